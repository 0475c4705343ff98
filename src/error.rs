use thiserror::Error;

/// Result type alias for TFTP operations
pub type Result<T> = std::result::Result<T, TftpError>;

/// Terminal outcomes of a transfer and of the surrounding tooling.
///
/// Transient conditions (a timeout before the retry budget is spent, stale
/// duplicates, strays from an unknown transfer ID) are recovered inside the
/// session engine and never surface here.
#[derive(Error, Debug)]
pub enum TftpError {
    /// Transport send/receive failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Retry budget exhausted
    #[error("timed out: {0}")]
    Timeout(String),

    /// The peer sent an ERROR packet; surfaced verbatim
    #[error("peer error {code}: {message}")]
    Peer { code: u16, message: String },

    /// Malformed packet, unexpected opcode in steady state, or an option out
    /// of range after an OACK
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The caller's data sink refused a block
    #[error("transfer rejected: {0}")]
    Rejected(String),

    /// The driver's cancellation token fired at a suspension boundary
    #[error("transfer cancelled")]
    Cancelled,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Generic error
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}
