use dmsgprims_frame::IoqError;

/// Errors that can occur in connection operations.
#[derive(Debug, thiserror::Error)]
pub enum IocomError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] dmsgprims_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] dmsgprims_frame::FrameError),

    /// Cipher negotiation failed.
    #[error("cipher negotiation failed: {0}")]
    Cipher(#[from] dmsgprims_frame::CipherError),

    /// A message was written in a way its transaction state does not allow.
    #[error("protocol violation on msgid {msgid} ({flags}): {reason}")]
    Protocol {
        msgid: u64,
        flags: String,
        reason: &'static str,
    },

    /// The referenced circuit is not attached.
    #[error("unknown circuit {0}")]
    UnknownCircuit(u64),

    /// The connection core has stopped; nothing more can be written.
    #[error("connection closed")]
    Closed,

    /// The connection core stopped on a terminal queue error.
    #[error("connection terminated: {0}")]
    Terminated(IoqError),
}

pub type Result<T> = std::result::Result<T, IocomError>;
