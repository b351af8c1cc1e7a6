//! Transactional message framing over Unix domain sockets.
//!
//! dmsgprims carries dmsg frames (64-byte headers, CRC-32C protected, either
//! byte order) between two processes and tracks the transactions they form.
//!
//! # Crate Structure
//!
//! - [`transport`]: Unix domain sockets and anonymous stream pairs
//! - [`frame`]: Wire format, receive/transmit queues and the message pool
//! - [`iocom`]: Connection core: transactions, circuits and the I/O loop
//!   (behind the `iocom` feature)

/// Re-export transport types.
pub mod transport {
    pub use dmsgprims_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use dmsgprims_frame::*;
}

/// Re-export connection types (requires `iocom` feature).
#[cfg(feature = "iocom")]
pub mod iocom {
    pub use dmsgprims_iocom::*;
}
