use std::io;
use thiserror::Error;

/// Errors raised while persisting or restoring the routing table.
///
/// None of these are fatal to the node: a failed save leaves a
/// possibly-partial file behind, and a failed load leaves the table sparser
/// than intended, to be repopulated by live traffic.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("entry codec error: {0}")]
    Entry(#[from] bincode::Error),

    #[error("bad bucket magic {found:#010x}")]
    BadMagic { found: u32 },

    #[error("bucket declares {count} entries, capacity is {max}")]
    TooManyEntries { count: u32, max: u32 },

    #[error("bucket index {index} out of range")]
    IndexOutOfRange { index: u32 },

    #[error("truncated bucket header")]
    TruncatedHeader,
}
