//! dmsg wire framing.
//!
//! Every frame is a 64-byte core header, an optional command-specific
//! extended header and an aux payload zero-padded to 64 bytes:
//! - a 2-byte magic whose reading selects the frame's byte order
//! - a salt whose low byte is a per-direction sequence number
//! - CRC-32C over the header and over the aligned aux payload
//!
//! [`RxIoq`] and [`TxIoq`] are the nonblocking receive and transmit
//! queues used by the connection core. [`FrameReader`] and [`FrameWriter`]
//! wrap them for blocking use.

pub mod cipher;
pub mod codec;
pub mod crc;
pub mod error;
pub mod header;
pub mod ioq;
pub mod message;
pub mod pool;
pub mod reader;
pub mod writer;

pub use cipher::{Cipher, Plaintext};
pub use codec::{encode_frame, FrameConfig};
pub use error::{CipherError, FrameError, IoqError, Result};
pub use header::{
    ByteOrder, MsgHeader, ABORT, ALIGN, AUX_MAX, CREATE, DBG_SHELL, DELETE, HDR_MAX, HDR_SIZE,
    LNK_AUTH, LNK_CONN, LNK_ERROR, LNK_PAD, LNK_PING, LNK_SPAN, PROTO_DBG, PROTO_LNK, REPLY,
};
pub use ioq::{FlushOutcome, IoqState, ReadOutcome, RxIoq, TxIoq};
pub use message::{Message, Origin, TransRef};
pub use pool::{MessageAlloc, MessagePool, PoolStats};
pub use reader::FrameReader;
pub use writer::FrameWriter;
