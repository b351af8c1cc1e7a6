use std::io::{ErrorKind, Read};

use dmsgprims_transport::DmsgStream;

use crate::cipher::Plaintext;
use crate::codec::FrameConfig;
use crate::error::{FrameError, IoqError, Result};
use crate::ioq::{ReadOutcome, RxIoq};
use crate::message::Message;
use crate::pool::MessagePool;

/// Reads complete messages from any `Read` stream (blocking, plaintext).
///
/// Handles partial reads internally; callers always get complete frames.
/// This is the simple synchronous counterpart of the connection core's
/// receive path, useful for tools and for driving a peer by hand.
pub struct FrameReader<T> {
    inner: T,
    rx: RxIoq,
    pool: MessagePool,
    config: FrameConfig,
}

impl<T: Read> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            rx: RxIoq::new(&config),
            pool: MessagePool::default(),
            config,
        }
    }

    /// Read the next complete message (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached. A
    /// nonblocking stream with nothing to read surfaces as an I/O error of
    /// kind `WouldBlock`; the reader stays usable afterwards.
    pub fn read_message(&mut self) -> Result<Message> {
        loop {
            match self.rx.next_message(&mut self.pool) {
                Ok(Some(msg)) => return Ok(msg),
                Ok(None) => {}
                Err(err) => return Err(ioq_to_frame_error(err)),
            }
            match self.rx.read_from(&mut self.inner, &mut Plaintext) {
                Ok(ReadOutcome::Read(_)) => {}
                Ok(ReadOutcome::WouldBlock) => {
                    return Err(FrameError::Io(ErrorKind::WouldBlock.into()))
                }
                Err(err) => return Err(ioq_to_frame_error(err)),
            }
        }
    }

    /// Return a message container for reuse by later reads.
    pub fn recycle(&mut self, msg: Message) {
        self.pool.release(msg);
    }

    /// The receive queue's sticky error, if any.
    pub fn error(&self) -> Option<IoqError> {
        self.rx.error()
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameReader<DmsgStream> {
    /// Create a frame reader for a `DmsgStream` with a read timeout applied.
    pub fn with_timeout(
        inner: DmsgStream,
        config: FrameConfig,
        timeout: Option<std::time::Duration>,
    ) -> Result<Self> {
        inner
            .set_read_timeout(timeout)
            .map_err(|err| FrameError::Io(err.into_io()))?;
        Ok(Self::with_config(inner, config))
    }
}

fn ioq_to_frame_error(err: IoqError) -> FrameError {
    match err {
        IoqError::Eof => FrameError::ConnectionClosed,
        other => FrameError::Ioq(other),
    }
}
