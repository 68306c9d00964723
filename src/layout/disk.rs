//! On-disk layout codec.
//!
//! Each node persists only its own slice of a directory's layout, as four big-endian
//! words: `[count, type, start, stop]`. A count of zero records a zero-width slice.

use thiserror::Error;

use super::types::HashRange;

pub const DISK_LAYOUT_LEN: usize = 16;
/// Davies-Meyer hash type tag.
pub const LAYOUT_TYPE_DM: u32 = 0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DiskLayoutError {
    #[error("layout xattr has {0} bytes, expected {DISK_LAYOUT_LEN}")]
    BadLength(usize),
    #[error("unsupported layout count {0}")]
    BadCount(u32),
    #[error("unknown hash type {0}")]
    BadType(u32),
    #[error("inverted range {start:#010x}..{stop:#010x}")]
    Inverted { start: u32, stop: u32 },
}

pub fn encode(range: Option<HashRange>) -> Vec<u8> {
    let (count, start, stop) = match range {
        Some(r) => (1u32, r.start, r.stop),
        None => (0u32, 0, 0),
    };

    let mut buf = Vec::with_capacity(DISK_LAYOUT_LEN);
    for word in [count, LAYOUT_TYPE_DM, start, stop] {
        buf.extend_from_slice(&word.to_be_bytes());
    }
    buf
}

pub fn decode(raw: &[u8]) -> Result<Option<HashRange>, DiskLayoutError> {
    if raw.len() != DISK_LAYOUT_LEN {
        return Err(DiskLayoutError::BadLength(raw.len()));
    }

    let word = |i: usize| u32::from_be_bytes([raw[i * 4], raw[i * 4 + 1], raw[i * 4 + 2], raw[i * 4 + 3]]);
    let (count, kind, start, stop) = (word(0), word(1), word(2), word(3));

    if kind != LAYOUT_TYPE_DM {
        return Err(DiskLayoutError::BadType(kind));
    }

    match count {
        0 => Ok(None),
        1 if start <= stop => Ok(Some(HashRange::new(start, stop))),
        1 => Err(DiskLayoutError::Inverted { start, stop }),
        other => Err(DiskLayoutError::BadCount(other)),
    }
}
