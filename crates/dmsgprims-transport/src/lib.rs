//! Duplex stream transport for dmsgprims.
//!
//! Provides the byte streams the message-transport core runs over:
//! - Unix domain sockets (bind/accept/connect on a filesystem path)
//! - Anonymous socket pairs (in-process links, wakeup channels, tests)
//!
//! This is the lowest layer of dmsgprims. Everything else builds on top of
//! the [`DmsgStream`] type provided here.

pub mod error;
pub mod stream;

#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};
pub use stream::DmsgStream;

#[cfg(unix)]
pub use uds::UnixDomainSocket;
