use std::io::{ErrorKind, Write};

use dmsgprims_transport::DmsgStream;

use crate::cipher::Plaintext;
use crate::codec::FrameConfig;
use crate::error::{FrameError, IoqError, Result};
use crate::ioq::{FlushOutcome, TxIoq};
use crate::message::Message;
use crate::pool::MessagePool;

/// Writes complete messages to any `Write` stream (blocking, plaintext).
///
/// Frames carry the writer's own salt sequence, so a [`crate::FrameReader`]
/// or a connection core on the other end accepts them in order.
pub struct FrameWriter<T> {
    inner: T,
    tx: TxIoq,
    pool: MessagePool,
    config: FrameConfig,
}

impl<T: Write> FrameWriter<T> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            tx: TxIoq::new(),
            pool: MessagePool::default(),
            config,
        }
    }

    /// Check out a message in this writer's wire order.
    pub fn message(&mut self, cmd: u32, aux_size: usize) -> Message {
        self.pool.checkout(cmd, aux_size, self.config.wire_order)
    }

    /// Encode and write a message (blocking).
    pub fn send(&mut self, msg: Message) -> Result<()> {
        if msg.aux().len() > self.config.max_aux_size {
            return Err(FrameError::AuxTooLarge {
                size: msg.aux().len(),
                max: self.config.max_aux_size,
            });
        }
        self.tx.push(msg);

        let pool = &mut self.pool;
        loop {
            match self.tx.flush(&mut self.inner, &mut Plaintext, |m| pool.release(m)) {
                Ok(FlushOutcome::Drained) => break,
                Ok(FlushOutcome::WouldBlock) => continue,
                Err(IoqError::Sock) => {
                    for msg in self.tx.drain() {
                        pool.release(msg);
                    }
                    return Err(FrameError::ConnectionClosed);
                }
                Err(err) => return Err(FrameError::Ioq(err)),
            }
        }

        self.flush()
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current frame writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameWriter<DmsgStream> {
    /// Create a frame writer for a `DmsgStream` with a write timeout applied.
    pub fn with_timeout(
        inner: DmsgStream,
        config: FrameConfig,
        timeout: Option<std::time::Duration>,
    ) -> Result<Self> {
        inner
            .set_write_timeout(timeout)
            .map_err(|err| FrameError::Io(err.into_io()))?;
        Ok(Self::with_config(inner, config))
    }
}
