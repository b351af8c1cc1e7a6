/// Sticky I/O queue error.
///
/// Once an [`crate::ioq::RxIoq`] records one of these it stops accepting
/// bytes, and the connection layer walks its open transactions to close
/// them. The numeric [`code`](IoqError::code) is carried in the `error`
/// field of the synthesized close frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum IoqError {
    /// Frame sync lost: the magic matched neither byte order.
    #[error("frame sync lost (bad magic)")]
    Sync,

    /// The peer closed the stream.
    #[error("end of stream")]
    Eof,

    /// The socket failed on read or write.
    #[error("socket failure")]
    Sock,

    /// A header field (header size, aux length) is out of bounds.
    #[error("header field out of bounds")]
    Field,

    /// Header CRC mismatch.
    #[error("header CRC mismatch")]
    HeaderCrc,

    /// Aux payload CRC mismatch.
    #[error("aux payload CRC mismatch")]
    AuxCrc,

    /// A frame referenced a transaction in a way its state does not allow.
    #[error("transaction state violation")]
    Trans,

    /// Cipher negotiation, decryption or encryption failed.
    #[error("cipher failure")]
    Cipher,

    /// The salt sequence byte did not match the receive counter.
    #[error("frame sequence mismatch")]
    Sequence,

    /// A late abort for a transaction that is already closed.
    ///
    /// Never fatal: the frame is discarded.
    #[error("transaction already closed")]
    Already,

    /// The frame was handed to the relay and is no longer ours.
    ///
    /// Never fatal.
    #[error("frame routed")]
    Routed,

    /// The frame referenced a circuit that does not exist.
    #[error("unknown circuit")]
    BadCircuit,
}

impl IoqError {
    /// Wire code for this error.
    pub fn code(self) -> u32 {
        match self {
            IoqError::Sync => 1,
            IoqError::Eof => 2,
            IoqError::Sock => 3,
            IoqError::Field => 4,
            IoqError::HeaderCrc => 5,
            IoqError::AuxCrc => 7,
            IoqError::Trans => 8,
            IoqError::Cipher => 11,
            IoqError::Sequence => 14,
            IoqError::Already => 15,
            IoqError::Routed => 20,
            IoqError::BadCircuit => 21,
        }
    }

    /// Map a wire code back to an error.
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => IoqError::Sync,
            2 => IoqError::Eof,
            3 => IoqError::Sock,
            4 => IoqError::Field,
            5 => IoqError::HeaderCrc,
            7 => IoqError::AuxCrc,
            8 => IoqError::Trans,
            11 => IoqError::Cipher,
            14 => IoqError::Sequence,
            15 => IoqError::Already,
            20 => IoqError::Routed,
            21 => IoqError::BadCircuit,
            _ => return None,
        })
    }

    /// Whether this error terminates the connection.
    pub fn is_fatal(self) -> bool {
        !matches!(self, IoqError::Already | IoqError::Routed)
    }
}

/// Cipher collaborator failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct CipherError(pub String);

/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The aux payload exceeds the configured maximum size.
    #[error("aux payload too large ({size} bytes, max {max})")]
    AuxTooLarge { size: usize, max: usize },

    /// The declared header size is outside the supported range.
    #[error("header size {size} out of range (min 64, max {max})")]
    HeaderSize { size: usize, max: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,

    /// The receive queue entered its terminal error state.
    #[error("ioq error: {0}")]
    Ioq(#[from] IoqError),

    /// The cipher collaborator failed.
    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),
}

pub type Result<T> = std::result::Result<T, FrameError>;
