use std::collections::BTreeMap;

use crate::error::{Errno, FopResult};
use crate::fop::{DirEntry, Iatt, Reply, Statvfs};
use crate::topology::types::SubvolId;

/// How partial results of one dispatch combine.
///
/// `fold` is called once per target, in completion order. Implementations must not
/// depend on that order: folding the same results in any permutation has to produce
/// the same `finish` output.
pub trait Merge: Send + 'static {
    type Output: Send + 'static;

    fn fold(&mut self, subvol: &SubvolId, result: FopResult<Reply>);

    fn finish(self) -> Self::Output;
}

/// Shared error bookkeeping.
///
/// Object-absent errors are soft: they only become the result when nothing succeeded.
/// Unreachable nodes are soft too when `tolerate_unreachable` is set. Any other error
/// is hard; among several hard errors the smallest code wins so the outcome does not
/// depend on arrival order.
#[derive(Debug, Clone, Default)]
pub struct ErrorFold {
    pub successes: usize,
    pub absent: usize,
    pub unreachable: usize,
    hard: Option<Errno>,
    tolerate_unreachable: bool,
}

impl ErrorFold {
    pub fn new(tolerate_unreachable: bool) -> Self {
        Self {
            tolerate_unreachable,
            ..Default::default()
        }
    }

    pub fn record_ok(&mut self) {
        self.successes += 1;
    }

    pub fn record_err(&mut self, errno: Errno) {
        if errno.is_absent() {
            self.absent += 1;
        } else if errno.is_unreachable() && self.tolerate_unreachable {
            self.unreachable += 1;
        } else {
            self.hard = Some(self.hard.map_or(errno, |h| h.min(errno)));
        }
    }

    pub fn verdict(&self) -> FopResult<()> {
        if let Some(errno) = self.hard {
            return Err(errno);
        }
        if self.successes > 0 {
            return Ok(());
        }
        if self.absent > 0 {
            Err(Errno::ENOENT)
        } else {
            Err(Errno::ENOTCONN)
        }
    }
}

// --- Attributes ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrMode {
    /// A directory exists on every node: sizes and block counts add up.
    Directory,
    /// One file seen through several nodes (before and after a migration handoff).
    File,
}

/// Attribute merge.
///
/// Identity fields (gfid, type, mode, owner) come from the lowest subvolume id that
/// answered. Timestamps take the latest value, link counts the largest. Sizes and
/// blocks are summed for directories and maxed for files.
#[derive(Debug, Clone)]
pub struct AttrMerge {
    mode: AttrMode,
    base: Option<(SubvolId, Iatt)>,
    size: u64,
    blocks: u64,
    pub errors: ErrorFold,
}

impl AttrMerge {
    pub fn new(mode: AttrMode) -> Self {
        Self {
            mode,
            base: None,
            size: 0,
            blocks: 0,
            errors: ErrorFold::new(mode == AttrMode::Directory),
        }
    }

    pub fn merge_iatt(&mut self, subvol: &SubvolId, iatt: &Iatt) {
        self.errors.record_ok();

        match self.mode {
            AttrMode::Directory => {
                self.size += iatt.size;
                self.blocks += iatt.blocks;
            }
            AttrMode::File => {
                self.size = self.size.max(iatt.size);
                self.blocks = self.blocks.max(iatt.blocks);
            }
        }

        match &mut self.base {
            Some((base_subvol, base)) => {
                let (atime, mtime, ctime) = (
                    base.atime.max(iatt.atime),
                    base.mtime.max(iatt.mtime),
                    base.ctime.max(iatt.ctime),
                );
                let nlink = base.nlink.max(iatt.nlink);
                if subvol < base_subvol {
                    *base_subvol = subvol.clone();
                    *base = iatt.clone();
                }
                base.atime = atime;
                base.mtime = mtime;
                base.ctime = ctime;
                base.nlink = nlink;
            }
            None => self.base = Some((subvol.clone(), iatt.clone())),
        }
    }

    pub fn result(self) -> FopResult<Iatt> {
        self.errors.verdict()?;
        let (_, mut iatt) = self.base.ok_or(Errno::ENOENT)?;
        iatt.size = self.size;
        iatt.blocks = self.blocks;
        Ok(iatt)
    }
}

impl Merge for AttrMerge {
    type Output = FopResult<Iatt>;

    fn fold(&mut self, subvol: &SubvolId, result: FopResult<Reply>) {
        match result {
            Ok(reply) => match reply.iatt() {
                Some(iatt) => self.merge_iatt(subvol, iatt),
                None => self.errors.record_ok(),
            },
            Err(errno) => self.errors.record_err(errno),
        }
    }

    fn finish(self) -> Self::Output {
        self.result()
    }
}

/// Pre/post attribute pairs of a modifying operation.
#[derive(Debug, Clone)]
pub struct PrePostMerge {
    pub pre: AttrMerge,
    pub post: AttrMerge,
}

impl PrePostMerge {
    pub fn new(mode: AttrMode) -> Self {
        Self {
            pre: AttrMerge::new(mode),
            post: AttrMerge::new(mode),
        }
    }

    pub fn merge_pair(&mut self, subvol: &SubvolId, pre: &Iatt, post: &Iatt) {
        self.pre.merge_iatt(subvol, pre);
        self.post.merge_iatt(subvol, post);
    }

    pub fn result(self) -> FopResult<(Iatt, Iatt)> {
        Ok((self.pre.result()?, self.post.result()?))
    }
}

impl Merge for PrePostMerge {
    type Output = FopResult<(Iatt, Iatt)>;

    fn fold(&mut self, subvol: &SubvolId, result: FopResult<Reply>) {
        match result {
            Ok(Reply::PrePost { pre, post }) => self.merge_pair(subvol, &pre, &post),
            Ok(reply) => {
                self.pre.fold(subvol, Ok(reply.clone()));
                self.post.fold(subvol, Ok(reply));
            }
            Err(errno) => {
                self.pre.errors.record_err(errno);
                self.post.errors.record_err(errno);
            }
        }
    }

    fn finish(self) -> Self::Output {
        self.result()
    }
}

// --- Capacity ---

/// Sums capacity over every node that answered.
#[derive(Debug, Clone)]
pub struct StatfsMerge {
    total: Statvfs,
    errors: ErrorFold,
}

impl StatfsMerge {
    pub fn new() -> Self {
        Self {
            total: Statvfs::default(),
            errors: ErrorFold::new(true),
        }
    }
}

impl Default for StatfsMerge {
    fn default() -> Self {
        Self::new()
    }
}

impl Merge for StatfsMerge {
    type Output = FopResult<Statvfs>;

    fn fold(&mut self, _subvol: &SubvolId, result: FopResult<Reply>) {
        match result.and_then(|r| r.into_statfs()) {
            Ok(s) => {
                self.errors.record_ok();
                self.total.total_bytes += s.total_bytes;
                self.total.free_bytes += s.free_bytes;
                self.total.avail_bytes += s.avail_bytes;
                self.total.files = self.total.files.saturating_add(s.files);
                self.total.files_free = self.total.files_free.saturating_add(s.files_free);
            }
            Err(errno) => self.errors.record_err(errno),
        }
    }

    fn finish(self) -> Self::Output {
        self.errors.verdict()?;
        Ok(self.total)
    }
}

// --- Listings ---

/// Merges directory listings from every node.
///
/// Link files are hidden. A name seen on several nodes (a directory always is)
/// is reported once, using the copy from the lowest subvolume id.
#[derive(Debug, Clone)]
pub struct ReaddirMerge {
    entries: BTreeMap<String, (SubvolId, DirEntry)>,
    errors: ErrorFold,
}

impl ReaddirMerge {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            errors: ErrorFold::new(true),
        }
    }
}

impl Default for ReaddirMerge {
    fn default() -> Self {
        Self::new()
    }
}

impl Merge for ReaddirMerge {
    type Output = FopResult<Vec<DirEntry>>;

    fn fold(&mut self, subvol: &SubvolId, result: FopResult<Reply>) {
        let listing = match result.and_then(|r| r.into_entries()) {
            Ok(listing) => listing,
            Err(errno) => return self.errors.record_err(errno),
        };
        self.errors.record_ok();

        for entry in listing.into_iter().filter(|e| !e.iatt.has_linkfile_mode()) {
            match self.entries.get(&entry.name) {
                Some((owner, _)) if owner <= subvol => {}
                _ => {
                    self.entries
                        .insert(entry.name.clone(), (subvol.clone(), entry));
                }
            }
        }
    }

    fn finish(self) -> Self::Output {
        self.errors.verdict()?;
        Ok(self.entries.into_values().map(|(_, e)| e).collect())
    }
}

// --- Raw ---

/// Keeps every node's result for the caller to interpret.
#[derive(Debug, Clone, Default)]
pub struct Collect {
    results: BTreeMap<SubvolId, FopResult<Reply>>,
}

impl Collect {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Merge for Collect {
    type Output = BTreeMap<SubvolId, FopResult<Reply>>;

    fn fold(&mut self, subvol: &SubvolId, result: FopResult<Reply>) {
        self.results.insert(subvol.clone(), result);
    }

    fn finish(self) -> Self::Output {
        self.results
    }
}

/// Combined verdict over per-node results gathered by `Collect`.
pub fn verdict_of(
    results: &BTreeMap<SubvolId, FopResult<Reply>>,
    tolerate_unreachable: bool,
) -> FopResult<()> {
    let mut errors = ErrorFold::new(tolerate_unreachable);
    for result in results.values() {
        match result {
            Ok(_) => errors.record_ok(),
            Err(errno) => errors.record_err(*errno),
        }
    }
    errors.verdict()
}
