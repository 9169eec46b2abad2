use thiserror::Error;

pub type Result<T> = std::result::Result<T, ZpaqError>;

/// Error kinds surfaced by the archiver core.
///
/// Decode-side corruption is always one of `Truncated`, `BadMagic`,
/// `BadHeader`, `Corrupt`, or `ChecksumMismatch`; the container reader
/// treats these as resync triggers rather than hard stops.
#[derive(Debug, Error)]
pub enum ZpaqError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected end of stream: {0}")]
    Truncated(&'static str),

    #[error("bad block magic")]
    BadMagic,

    #[error("bad block header: {0}")]
    BadHeader(&'static str),

    #[error("corrupt stream: {0}")]
    Corrupt(&'static str),

    #[error("ZPAQL runtime fault: {0}")]
    VmRuntime(&'static str),

    #[error("arithmetic coder left its valid range")]
    CoderRange,

    #[error("checksum mismatch in segment {0:?}")]
    ChecksumMismatch(String),

    #[error("wrong password or not an archive")]
    BadKey,

    #[error("version {requested} is beyond the committed tail {committed}")]
    BadVersion { requested: u32, committed: u32 },

    #[error("unknown compression method {0}")]
    UnknownMethod(u8),
}

impl ZpaqError {
    /// A malformed block is recoverable by scanning for the next magic;
    /// everything else aborts the read.
    pub fn is_resyncable(&self) -> bool {
        matches!(
            self,
            ZpaqError::Truncated(_)
                | ZpaqError::BadMagic
                | ZpaqError::BadHeader(_)
                | ZpaqError::Corrupt(_)
                | ZpaqError::VmRuntime(_)
                | ZpaqError::CoderRange
                | ZpaqError::ChecksumMismatch(_)
        )
    }
}
