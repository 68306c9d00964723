use super::types::MigrationPhase;
use crate::error::{Errno, FopResult};
use crate::fop::{LINKTO_XATTR, Reply, S_ISGID, S_ISVTX, Xattrs};
use crate::topology::types::SubvolId;

/// Clears the copy-in-progress bits from every attribute block in the reply.
pub fn strip_phase1(reply: &mut Reply) {
    for iatt in reply.iatts_mut() {
        if MigrationPhase::detect(iatt) == MigrationPhase::Copying {
            iatt.mode &= !(S_ISVTX | S_ISGID);
        }
    }
}

/// The object moved away from the node that answered.
///
/// Either it is gone (`ENOENT`) or the node returned a link file.
pub fn needs_redirect(result: &FopResult<Reply>) -> bool {
    match result {
        Err(errno) => *errno == Errno::ENOENT,
        Ok(reply) => reply
            .iatt()
            .map(|iatt| MigrationPhase::detect(iatt) == MigrationPhase::Moved)
            .unwrap_or(false),
    }
}

/// The copy to a second node is in progress, according to the reply.
pub fn is_copying(result: &FopResult<Reply>) -> bool {
    match result {
        Ok(reply) => reply
            .iatt()
            .map(|iatt| MigrationPhase::detect(iatt) == MigrationPhase::Copying)
            .unwrap_or(false),
        Err(_) => false,
    }
}

/// Node named by a link-target xattr.
pub fn linkto_target(xattrs: &Xattrs) -> Option<SubvolId> {
    let raw = xattrs.get(LINKTO_XATTR)?;
    let name = std::str::from_utf8(raw).ok()?.trim_end_matches('\0');
    if name.is_empty() {
        None
    } else {
        Some(SubvolId::from(name))
    }
}

/// Xattr set naming `target` as the holder of the data.
pub fn linkto_xattr(target: &SubvolId) -> Xattrs {
    Xattrs::from([(LINKTO_XATTR.to_string(), target.as_str().as_bytes().to_vec())])
}
