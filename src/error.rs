//! Main Crate Error

#[derive(thiserror::Error, Debug)]
/// Kadmos crate error enum.
pub enum Error {
    /// No response arrived within the request timeout.
    #[error("Request timed out")]
    Timeout,

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    /// Indicates that an Id was constructed from a slice of the wrong length.
    #[error("Invalid id size: {0}, expected 16 bytes")]
    InvalidIdSize(usize),

    /// A datagram ended before the frame it promised was complete,
    /// or carried bytes past the end of the frame.
    #[error("Truncated or oversized message frame")]
    TruncatedMessage,

    /// The message kind tag is not one of PING, LOOKUP or RESPONSE.
    #[error("Unknown message kind: {0}")]
    UnknownMessageKind(u8),

    /// A lookup round could not reach any of its candidates.
    #[error("No reachable recipient for lookup round")]
    NoRecipients,

    /// The engine is not in the `Running` state.
    #[error("Node is not running")]
    NotRunning,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
