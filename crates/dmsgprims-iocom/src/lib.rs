//! dmsg connection core.
//!
//! An [`Iocom`] owns one stream and runs the single-threaded loop that
//! frames, classifies and delivers messages. Transactions are tracked per
//! circuit; when the connection fails every open transaction receives a
//! synthesized `LNK_ERROR` close before a final EOF frame.
//!
//! Other threads interact through a cloneable [`IocomHandle`].

#![cfg(unix)]

pub mod circuit;
pub mod config;
pub mod connector;
pub mod error;
pub mod flags;
pub mod handle;
pub mod handler;
pub mod iocom;
pub mod listener;
pub mod router;
pub mod state;

pub use circuit::{Circuit, CircuitSet};
pub use config::{IocomConfig, DEFAULT_POLL_TIMEOUT};
pub use connector::{connect, connect_with_config};
pub use error::{IocomError, Result};
pub use handle::{IocomHandle, IocomStats};
pub use handler::IocomHandler;
pub use iocom::Iocom;
pub use listener::IocomListener;
pub use router::{LocalRouter, RouteDecision, Router};
pub use state::{classify_rx, classify_tx, ReplyHandler, RxClass, State, StateTable, TxClass};
