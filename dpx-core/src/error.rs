use thiserror::Error;

/// Errors surfaced by the depot engine.
///
/// Parser errors are fatal for a command; per-file extraction errors abort
/// that file only. Checksum mismatches found by the validator are a data
/// outcome, reported but never raised through this type.
#[derive(Debug, Error)]
pub enum DepotError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("truncated input while reading {0}")]
    Truncated(&'static str),

    #[error("bad magic: found {found:#010x}, expected {expected:#010x}")]
    BadMagic { found: u32, expected: u32 },

    #[error("unsupported format version {0}")]
    UnsupportedVersion(u32),

    #[error("seek to {pos} outside buffer of {len} bytes")]
    BadSeek { pos: u64, len: u64 },

    #[error("directory entry {0} does not reach the root")]
    CycleDetected(u32),

    #[error("entry {0} has a non-directory parent")]
    BadParent(u32),

    #[error("file id {0} appears more than once")]
    DuplicateFileId(u32),

    #[error("file id {0} not present")]
    UnknownFileId(u32),

    #[error("unknown file type byte {0:#04x}")]
    UnknownFileType(u8),

    #[error("decrypt failed: {0}")]
    Decrypt(String),

    #[error("inflate failed: {0}")]
    Inflate(String),

    #[error("bad key: {0}")]
    BadKey(String),

    #[error("chunk {0} digest mismatch")]
    ChunkDigest(usize),

    #[error("refusing unsafe output path {0:?}")]
    UnsafePath(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type Result<T, E = DepotError> = std::result::Result<T, E>;
