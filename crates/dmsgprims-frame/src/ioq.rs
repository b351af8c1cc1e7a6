//! Receive and transmit framing queues.
//!
//! [`RxIoq`] turns a byte stream into [`Message`]s through a bounded
//! buffer and a small state machine, surviving arbitrary partial reads.
//! [`TxIoq`] serializes queued messages and resumes partial writes at a
//! byte offset. Both carry a sticky [`IoqError`]: once set, nothing more
//! is read or written.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};

use bytes::BytesMut;
use tracing::{debug, trace, warn};

use crate::cipher::Cipher;
use crate::codec::{encode_frame, FrameConfig};
use crate::crc::{crc32, header_crc};
use crate::error::IoqError;
use crate::header::{
    align, command_name, header_size, ByteOrder, MsgHeader, AUX_MAX, BUF_SIZE, HDR_MAX, HDR_SIZE,
};
use crate::message::Message;
use crate::pool::MessageAlloc;

/// Receive state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoqState {
    /// Waiting for the 64-byte core header.
    CoreHeader,
    /// Core header validated; waiting for the rest of the declared header.
    ExtHeader,
    /// Copying aux bytes that are already buffered.
    AuxHead,
    /// Buffer drained; remaining aux bytes go straight into the message.
    AuxTail,
    /// Terminal.
    Error,
}

/// Result of one read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// This many bytes arrived.
    Read(usize),
    /// Nothing available right now.
    WouldBlock,
}

/// Receive queue.
///
/// Cursor invariant: `beg <= cdx <= cdn <= end <= BUF_SIZE`.
/// `beg..cdx` is plaintext already claimed by the frame in progress,
/// `cdn` is how far the cipher has decrypted, and `end` is how far the
/// stream has filled the buffer. Without an active cipher `cdn == end`.
pub struct RxIoq {
    buf: Box<[u8]>,
    beg: usize,
    cdx: usize,
    cdn: usize,
    end: usize,
    state: IoqState,
    seq: u32,
    error: Option<IoqError>,
    order: ByteOrder,
    hbytes: usize,
    abytes: usize,
    aux_fill: usize,
    partial: Option<Message>,
    max_aux: usize,
    frames: u64,
}

impl RxIoq {
    pub fn new(config: &FrameConfig) -> Self {
        Self {
            buf: vec![0u8; BUF_SIZE].into_boxed_slice(),
            beg: 0,
            cdx: 0,
            cdn: 0,
            end: 0,
            state: IoqState::CoreHeader,
            seq: 0,
            error: None,
            order: ByteOrder::native(),
            hbytes: 0,
            abytes: 0,
            aux_fill: 0,
            partial: None,
            max_aux: config.max_aux_size.min(AUX_MAX),
            frames: 0,
        }
    }

    pub fn state(&self) -> IoqState {
        self.state
    }

    /// The sticky error, if any.
    pub fn error(&self) -> Option<IoqError> {
        self.error
    }

    /// Force the queue into its terminal state. The first error wins.
    pub fn set_error(&mut self, err: IoqError) -> IoqError {
        let err = *self.error.get_or_insert(err);
        self.state = IoqState::Error;
        err
    }

    /// Frames reassembled so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Bytes buffered but not yet consumed by the framer.
    pub fn buffered(&self) -> usize {
        self.end - self.beg
    }

    /// Take the container of a frame abandoned mid-payload.
    pub fn take_partial(&mut self) -> Option<Message> {
        self.partial.take()
    }

    /// Read once from `src`.
    ///
    /// End of stream and read failures become the sticky error. While an aux
    /// payload is being received with no cipher and nothing buffered, the
    /// read goes straight into the message's aux buffer.
    pub fn read_from<R: Read + ?Sized>(
        &mut self,
        src: &mut R,
        cipher: &mut dyn Cipher,
    ) -> Result<ReadOutcome, IoqError> {
        if let Some(err) = self.error {
            return Err(err);
        }

        if self.state == IoqState::AuxTail && !cipher.is_active() && self.beg == self.end {
            if let Some(msg) = self.partial.as_mut() {
                let dst = &mut msg.aux_aligned_mut()[self.aux_fill..self.abytes];
                return match read_some(src, dst) {
                    Ok(Some(0)) => Err(self.set_error(IoqError::Eof)),
                    Ok(Some(n)) => {
                        self.aux_fill += n;
                        Ok(ReadOutcome::Read(n))
                    }
                    Ok(None) => Ok(ReadOutcome::WouldBlock),
                    Err(_) => Err(self.set_error(IoqError::Sock)),
                };
            }
        }

        self.compact();
        if self.end == self.buf.len() {
            return Err(self.set_error(IoqError::Field));
        }
        match read_some(src, &mut self.buf[self.end..]) {
            Ok(Some(0)) => Err(self.set_error(IoqError::Eof)),
            Ok(Some(n)) => {
                self.end += n;
                self.decrypt(cipher)?;
                Ok(ReadOutcome::Read(n))
            }
            Ok(None) => Ok(ReadOutcome::WouldBlock),
            Err(err) => {
                debug!(error = %err, "stream read failed");
                Err(self.set_error(IoqError::Sock))
            }
        }
    }

    /// Append raw stream bytes. Returns how many were accepted.
    pub fn feed(&mut self, data: &[u8], cipher: &mut dyn Cipher) -> Result<usize, IoqError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        self.compact();
        let n = data.len().min(self.buf.len() - self.end);
        self.buf[self.end..self.end + n].copy_from_slice(&data[..n]);
        self.end += n;
        self.decrypt(cipher)?;
        Ok(n)
    }

    /// Reassemble the next complete message from buffered plaintext.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Any framing failure
    /// becomes the sticky error and is returned from every later call.
    pub fn next_message<A: MessageAlloc + ?Sized>(
        &mut self,
        alloc: &mut A,
    ) -> Result<Option<Message>, IoqError> {
        let result = self.step(alloc);
        if result.is_err() {
            if let Some(msg) = self.partial.take() {
                alloc.release(msg);
            }
        }
        result
    }

    fn step<A: MessageAlloc + ?Sized>(
        &mut self,
        alloc: &mut A,
    ) -> Result<Option<Message>, IoqError> {
        loop {
            if let Some(err) = self.error {
                return Err(err);
            }
            match self.state {
                IoqState::CoreHeader => {
                    if self.cdn - self.beg < HDR_SIZE {
                        return Ok(None);
                    }
                    let raw = &self.buf[self.beg..self.beg + HDR_SIZE];
                    let Some(order) = ByteOrder::from_magic([raw[0], raw[1]]) else {
                        warn!(magic = ?&raw[..2], "frame sync lost");
                        return Err(self.set_error(IoqError::Sync));
                    };
                    let hbytes = header_size(MsgHeader::peek_cmd(raw, order));
                    if !(HDR_SIZE..=HDR_MAX).contains(&hbytes) {
                        warn!(hbytes, "header size out of bounds");
                        return Err(self.set_error(IoqError::Field));
                    }
                    self.order = order;
                    self.hbytes = hbytes;
                    self.cdx = self.beg + HDR_SIZE;
                    self.state = IoqState::ExtHeader;
                }
                IoqState::ExtHeader => {
                    if self.cdn - self.beg < self.hbytes {
                        return Ok(None);
                    }
                    let raw = &self.buf[self.beg..self.beg + self.hbytes];
                    if header_crc(raw) != MsgHeader::peek_hdr_crc(raw, self.order) {
                        warn!("header crc mismatch");
                        return Err(self.set_error(IoqError::HeaderCrc));
                    }
                    let header = MsgHeader::get(raw, self.order);
                    let aux = header.aux_bytes as usize;
                    if aux > self.max_aux {
                        warn!(aux, max = self.max_aux, "aux length out of bounds");
                        return Err(self.set_error(IoqError::Field));
                    }
                    if header.salt & 0xFF != self.seq & 0xFF {
                        warn!(
                            expected = self.seq & 0xFF,
                            got = header.salt & 0xFF,
                            "frame sequence mismatch"
                        );
                        return Err(self.set_error(IoqError::Sequence));
                    }
                    self.seq = self.seq.wrapping_add(1);

                    let mut msg = alloc.alloc(header.cmd, aux, self.order);
                    msg.set_received_header(header, &raw[HDR_SIZE..]);
                    self.beg += self.hbytes;
                    self.cdx = self.beg;

                    if aux == 0 {
                        self.state = IoqState::CoreHeader;
                        return Ok(Some(self.complete(msg)));
                    }
                    self.abytes = align(aux);
                    self.aux_fill = 0;
                    self.partial = Some(msg);
                    self.state = IoqState::AuxHead;
                }
                IoqState::AuxHead | IoqState::AuxTail => {
                    let Some(msg) = self.partial.as_mut() else {
                        return Err(self.set_error(IoqError::Field));
                    };
                    let n = (self.cdn - self.beg).min(self.abytes - self.aux_fill);
                    msg.aux_aligned_mut()[self.aux_fill..self.aux_fill + n]
                        .copy_from_slice(&self.buf[self.beg..self.beg + n]);
                    self.beg += n;
                    self.cdx = self.beg;
                    self.aux_fill += n;

                    if self.aux_fill < self.abytes {
                        if self.beg == self.cdn {
                            self.state = IoqState::AuxTail;
                        }
                        return Ok(None);
                    }

                    let Some(msg) = self.partial.take() else {
                        return Err(self.set_error(IoqError::Field));
                    };
                    if crc32(msg.aux_aligned()) != msg.header().aux_crc {
                        warn!(msgid = msg.msgid(), "aux crc mismatch");
                        self.partial = Some(msg);
                        return Err(self.set_error(IoqError::AuxCrc));
                    }
                    self.state = IoqState::CoreHeader;
                    return Ok(Some(self.complete(msg)));
                }
                IoqState::Error => {
                    return Err(self.set_error(IoqError::Sock));
                }
            }
        }
    }

    fn complete(&mut self, msg: Message) -> Message {
        self.frames += 1;
        trace!(
            msgid = msg.msgid(),
            circuit = msg.circuit(),
            cmd = command_name(msg.cmd()),
            aux = msg.aux().len(),
            "frame received"
        );
        msg
    }

    fn decrypt(&mut self, cipher: &mut dyn Cipher) -> Result<(), IoqError> {
        if !cipher.is_active() {
            self.cdn = self.end;
            return Ok(());
        }
        match cipher.decrypt(&mut self.buf[self.cdn..self.end]) {
            Ok(n) => {
                self.cdn += n.min(self.end - self.cdn);
                Ok(())
            }
            Err(err) => {
                warn!(cipher = cipher.name(), error = %err, "decrypt failed");
                Err(self.set_error(IoqError::Cipher))
            }
        }
    }

    /// Slide unconsumed bytes to the front when the headroom could not
    /// hold another maximal header.
    fn compact(&mut self) {
        if self.beg == 0 {
            return;
        }
        if self.beg == self.end {
            self.beg = 0;
            self.cdx = 0;
            self.cdn = 0;
            self.end = 0;
            return;
        }
        if self.buf.len() - self.end >= HDR_MAX {
            return;
        }
        let shift = self.beg;
        self.buf.copy_within(self.beg..self.end, 0);
        self.beg = 0;
        self.cdx -= shift;
        self.cdn -= shift;
        self.end -= shift;
    }
}

/// One read; `Ok(None)` means the source would block.
fn read_some<R: Read + ?Sized>(src: &mut R, dst: &mut [u8]) -> std::io::Result<Option<usize>> {
    loop {
        match src.read(dst) {
            Ok(n) => return Ok(Some(n)),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(None),
            Err(err) => return Err(err),
        }
    }
}

/// Result of one flush pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Every queued frame was written.
    Drained,
    /// The stream stopped accepting bytes; call again when writable.
    WouldBlock,
}

struct InFlight {
    msg: Message,
    wire: BytesMut,
    offset: usize,
}

/// Transmit queue.
pub struct TxIoq {
    queue: VecDeque<Message>,
    inflight: Option<InFlight>,
    plain: BytesMut,
    seq: u32,
    error: Option<IoqError>,
    frames: u64,
}

impl TxIoq {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            inflight: None,
            plain: BytesMut::with_capacity(HDR_MAX),
            seq: 0,
            error: None,
            frames: 0,
        }
    }

    /// Queue a message for transmission.
    pub fn push(&mut self, msg: Message) {
        self.queue.push_back(msg);
    }

    /// Whether anything is queued or partially written.
    pub fn has_pending(&self) -> bool {
        self.inflight.is_some() || !self.queue.is_empty()
    }

    pub fn error(&self) -> Option<IoqError> {
        self.error
    }

    /// Frames fully written so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Write queued frames until drained or the stream would block.
    ///
    /// `sent` receives each message once its last byte is written.
    pub fn flush<W, F>(
        &mut self,
        dst: &mut W,
        cipher: &mut dyn Cipher,
        mut sent: F,
    ) -> Result<FlushOutcome, IoqError>
    where
        W: Write + ?Sized,
        F: FnMut(Message),
    {
        loop {
            if let Some(err) = self.error {
                return Err(err);
            }
            if self.inflight.is_none() {
                let Some(msg) = self.queue.pop_front() else {
                    return Ok(FlushOutcome::Drained);
                };
                let inflight = self.encode(msg, cipher)?;
                self.inflight = Some(inflight);
            }
            let Some(inflight) = self.inflight.as_mut() else {
                continue;
            };
            match dst.write(&inflight.wire[inflight.offset..]) {
                Ok(0) => return Err(self.fail(IoqError::Sock)),
                Ok(n) => {
                    inflight.offset += n;
                    if inflight.offset == inflight.wire.len() {
                        if let Some(done) = self.inflight.take() {
                            self.frames += 1;
                            sent(done.msg);
                        }
                    }
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    return Ok(FlushOutcome::WouldBlock)
                }
                Err(err) => {
                    debug!(error = %err, "stream write failed");
                    return Err(self.fail(IoqError::Sock));
                }
            }
        }
    }

    /// Remove everything queued or in flight.
    pub fn drain(&mut self) -> Vec<Message> {
        let mut out: Vec<Message> = self.inflight.take().map(|f| f.msg).into_iter().collect();
        out.extend(self.queue.drain(..));
        out
    }

    pub fn set_error(&mut self, err: IoqError) -> IoqError {
        self.fail(err)
    }

    fn fail(&mut self, err: IoqError) -> IoqError {
        *self.error.get_or_insert(err)
    }

    fn encode(&mut self, mut msg: Message, cipher: &mut dyn Cipher) -> Result<InFlight, IoqError> {
        let salt = (rand::random::<u32>() << 8) | (self.seq & 0xFF);
        self.seq = self.seq.wrapping_add(1);

        self.plain.clear();
        if let Err(err) = encode_frame(&mut msg, salt, &mut self.plain) {
            warn!(error = %err, msgid = msg.msgid(), "frame encode failed");
            self.queue.push_front(msg);
            return Err(self.fail(IoqError::Field));
        }
        let wire = if cipher.is_active() {
            let mut wire = BytesMut::with_capacity(self.plain.len());
            if let Err(err) = cipher.encrypt(&[&self.plain[..]], &mut wire) {
                warn!(cipher = cipher.name(), error = %err, "encrypt failed");
                self.queue.push_front(msg);
                return Err(self.fail(IoqError::Cipher));
            }
            wire
        } else {
            self.plain.split()
        };
        trace!(
            msgid = msg.msgid(),
            circuit = msg.circuit(),
            cmd = command_name(msg.cmd()),
            bytes = wire.len(),
            "frame encoded"
        );
        Ok(InFlight {
            msg,
            wire,
            offset: 0,
        })
    }
}

impl Default for TxIoq {
    fn default() -> Self {
        Self::new()
    }
}
