//! The connection core.
//!
//! One thread runs [`Iocom::run`]; everything else goes through an
//! [`IocomHandle`]. The loop blocks in `poll(2)` only while no work flag is
//! set, so a handle that queues work and pokes the wakeup socket is always
//! picked up on the next iteration.

use std::io::{ErrorKind, Read};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::sync::mpsc::{self, Receiver};

use dmsgprims_frame::header::{flags_name, PROTO_MASK};
use dmsgprims_frame::{
    Cipher, FlushOutcome, IoqError, Message, MessagePool, Origin, Plaintext, ReadOutcome, RxIoq,
    TransRef, TxIoq, ABORT, CREATE, DELETE, LNK_ERROR, PROTO_DBG, REPLY,
};
use dmsgprims_transport::{DmsgStream, TransportError};
use tracing::{debug, info, trace, warn};

use crate::config::IocomConfig;
use crate::error::{IocomError, Result};
use crate::flags::{ALTWORK, EOF, RWORK, SHUTDOWN, SWORK, WWORK};
use crate::handle::{Inner, IocomHandle};
use crate::handler::IocomHandler;
use crate::router::{LocalRouter, RouteDecision, Router};
use crate::state::{classify_rx, RxClass};

/// Stream reads per receive pass before other work gets a turn.
const MAX_READS_PER_PASS: usize = 16;

/// A connection and its core loop.
pub struct Iocom {
    stream: DmsgStream,
    alt: Option<OwnedFd>,
    wakeup: UnixStream,
    outbound: Receiver<Message>,
    rx: RxIoq,
    tx: TxIoq,
    cipher: Box<dyn Cipher>,
    router: Box<dyn Router>,
    handler: Box<dyn IocomHandler>,
    handle: IocomHandle,
    config: IocomConfig,
}

impl Iocom {
    /// Set up a plaintext connection over `stream`.
    pub fn new(
        stream: DmsgStream,
        handler: impl IocomHandler + 'static,
        config: IocomConfig,
    ) -> Result<Self> {
        Self::with_cipher(stream, handler, config, Box::new(Plaintext))
    }

    /// Set up a connection, negotiating `cipher` on the blocking stream
    /// before switching it to nonblocking mode.
    pub fn with_cipher(
        mut stream: DmsgStream,
        handler: impl IocomHandler + 'static,
        config: IocomConfig,
        mut cipher: Box<dyn Cipher>,
    ) -> Result<Self> {
        if let Err(err) = cipher.negotiate(&mut stream) {
            warn!(label = %config.label, cipher = cipher.name(), error = %err, "cipher negotiation failed");
            return Err(err.into());
        }
        stream.set_nonblocking(true)?;

        let (wake_tx, wakeup) = UnixStream::pair().map_err(TransportError::from)?;
        wake_tx.set_nonblocking(true).map_err(TransportError::from)?;
        wakeup.set_nonblocking(true).map_err(TransportError::from)?;

        let (out_tx, outbound) = mpsc::channel();
        let handle = IocomHandle::new(Inner::new(
            MessagePool::new(config.pool_capacity),
            config.frame.wire_order,
            config.frame.max_aux_size,
            config.label.clone(),
            out_tx,
            wake_tx,
        ));
        info!(label = %config.label, cipher = cipher.name(), "connection established");

        Ok(Self {
            stream,
            alt: None,
            wakeup,
            outbound,
            rx: RxIoq::new(&config.frame),
            tx: TxIoq::new(),
            cipher,
            router: Box::new(LocalRouter),
            handler: Box::new(handler),
            handle,
            config,
        })
    }

    /// Relay policy for non-zero circuits.
    pub fn with_router(mut self, router: impl Router + 'static) -> Self {
        self.router = Box::new(router);
        self
    }

    /// Side channel watched alongside the stream; readiness runs
    /// [`IocomHandler::on_alt`].
    pub fn with_alt(mut self, fd: impl Into<OwnedFd>) -> Self {
        self.alt = Some(fd.into());
        self
    }

    pub fn handle(&self) -> IocomHandle {
        self.handle.clone()
    }

    /// Run the core loop until the connection terminates.
    ///
    /// Every open transaction receives a synthesized close and the handler
    /// receives one final `LNK_ERROR` frame with message id 0 before this
    /// returns. End of stream and requested shutdown return `Ok(())`.
    pub fn run(mut self) -> Result<()> {
        loop {
            self.take_restate();
            if !self.handle.inner.flags.has_work() {
                self.wait();
            }
            let work = self.handle.inner.flags.take_work();
            self.drain_wakeups();
            self.fold_outbound();

            if work & SWORK != 0 {
                self.handler.on_signal(&self.handle);
                self.fold_outbound();
            }
            if self.tx.has_pending() && self.rx.error().is_none() {
                self.flush();
            }
            if work & RWORK != 0 && self.rx.error().is_none() {
                self.pump();
            }
            if work & ALTWORK != 0 && self.rx.error().is_none() {
                self.handler.on_alt(&self.handle);
            }
            // Frames queued before the request have had their flush attempt.
            if work & SHUTDOWN != 0 {
                info!(label = %self.config.label, "shutdown requested");
                self.rx.set_error(IoqError::Eof);
            }
            if let Some(err) = self.rx.error() {
                return self.terminate(err);
            }
        }
    }

    fn take_restate(&mut self) {
        let pending = self
            .handle
            .inner
            .pending_handler
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handler) = pending {
            self.handler = handler;
            debug!(label = %self.config.label, "handler restated");
        }
    }

    fn wait(&mut self) {
        let mut fds = Vec::with_capacity(3);
        fds.push(pollfd(self.wakeup.as_raw_fd(), libc::POLLIN));
        let mut stream_events = libc::POLLIN;
        if self.tx.has_pending() {
            stream_events |= libc::POLLOUT;
        }
        fds.push(pollfd(self.stream.as_raw_fd(), stream_events));
        if let Some(alt) = &self.alt {
            fds.push(pollfd(alt.as_raw_fd(), libc::POLLIN));
        }

        let timeout = i32::try_from(self.config.poll_timeout.as_millis()).unwrap_or(i32::MAX);
        // SAFETY: `fds` is a live, correctly sized array of pollfd records.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() != ErrorKind::Interrupted {
                warn!(label = %self.config.label, error = %err, "poll failed");
                self.rx.set_error(IoqError::Sock);
            }
            return;
        }
        if rc == 0 {
            trace!(label = %self.config.label, "poll timeout");
            return;
        }

        let flags = &self.handle.inner.flags;
        let stream = fds[1].revents;
        if stream & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
            flags.set(RWORK);
        }
        if stream & libc::POLLOUT != 0 {
            flags.set(WWORK);
        }
        if fds.get(2).is_some_and(|alt| alt.revents != 0) {
            flags.set(ALTWORK);
        }
    }

    fn drain_wakeups(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            match self.wakeup.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }

    fn fold_outbound(&mut self) {
        while let Ok(msg) = self.outbound.try_recv() {
            self.tx.push(msg);
        }
    }

    fn flush(&mut self) {
        let mut sent = Vec::new();
        let result = self
            .tx
            .flush(&mut self.stream, self.cipher.as_mut(), |msg| sent.push(msg));

        let mut shared = self.handle.lock();
        shared.stats.frames_sent += sent.len() as u64;
        for msg in sent {
            shared.release(msg);
        }
        match result {
            Ok(FlushOutcome::Drained) => {}
            Ok(FlushOutcome::WouldBlock) => trace!(label = %self.config.label, "write would block"),
            Err(err) => {
                let dropped = self.tx.drain();
                warn!(
                    label = %self.config.label,
                    error = %err,
                    dropped = dropped.len(),
                    "write failed, discarding transmit queue"
                );
                for msg in dropped {
                    shared.release(msg);
                }
                drop(shared);
                self.rx.set_error(err);
            }
        }
    }

    fn pump(&mut self) {
        for _ in 0..MAX_READS_PER_PASS {
            loop {
                let next = {
                    let mut shared = self.handle.lock();
                    self.rx.next_message(&mut shared.pool)
                };
                match next {
                    Ok(Some(msg)) => self.dispatch(msg),
                    Ok(None) => break,
                    Err(_) => return,
                }
                if self.rx.error().is_some() {
                    return;
                }
            }
            match self.rx.read_from(&mut self.stream, self.cipher.as_mut()) {
                Ok(ReadOutcome::Read(_)) => {}
                Ok(ReadOutcome::WouldBlock) => return,
                Err(err) => {
                    debug!(label = %self.config.label, error = %err, "receive stopped");
                    return;
                }
            }
        }
        self.handle.inner.flags.set(RWORK);
    }

    fn dispatch(&mut self, mut msg: Message) {
        let circuit = msg.circuit();
        {
            let mut shared = self.handle.lock();
            shared.stats.frames_received += 1;
            match shared.circuits.acquire(circuit) {
                Ok(held) => msg.set_circuit_ref(held),
                Err(err) => {
                    warn!(label = %self.config.label, circuit, msgid = msg.msgid(), "frame on unknown circuit");
                    shared.pool.release(msg);
                    drop(shared);
                    self.rx.set_error(err);
                    return;
                }
            }
        }

        if circuit != 0 {
            msg = match self.router.route(&self.handle, circuit, msg) {
                RouteDecision::Local(msg) => msg,
                RouteDecision::Relayed => {
                    self.handle.lock().stats.relayed += 1;
                    return;
                }
            };
        }

        let class = {
            let mut shared = self.handle.lock();
            match shared.circuits.table_mut(circuit) {
                Some(table) => classify_rx(table, &msg),
                None => Err(IoqError::BadCircuit),
            }
        };
        debug!(
            label = %self.config.label,
            msgid = msg.msgid(),
            circuit,
            cmd = %flags_name(msg.cmd()),
            "frame received"
        );

        match class {
            Ok(RxClass::OneOff) => self.deliver(&msg),
            Ok(RxClass::Trans(trans)) => {
                msg.set_trans(Some(trans));
                self.deliver_trans(&msg, trans);
                self.handle.lock().finish_if_closed(trans);
            }
            Err(IoqError::Already) => {
                debug!(label = %self.config.label, msgid = msg.msgid(), "late abort discarded");
                self.handle.lock().stats.late_aborts += 1;
            }
            Err(err) => {
                warn!(
                    label = %self.config.label,
                    msgid = msg.msgid(),
                    circuit,
                    cmd = %flags_name(msg.cmd()),
                    error = %err,
                    "transaction violation"
                );
                self.rx.set_error(err);
            }
        }
        self.handle.release(msg);
    }

    fn deliver(&mut self, msg: &Message) {
        if msg.cmd() & PROTO_MASK == PROTO_DBG {
            self.handler.on_debug(&self.handle, msg);
        } else {
            self.handler.on_message(&self.handle, msg);
        }
    }

    /// Run the transaction's reply handler, or the connection handler when
    /// it has none. The lock is released for the duration of the call.
    fn deliver_trans(&mut self, msg: &Message, trans: TransRef) {
        let taken = self
            .handle
            .lock()
            .circuits
            .table_mut(trans.circuit)
            .and_then(|t| t.get_mut(trans.origin, trans.msgid))
            .and_then(|state| state.reply_handler.take());

        let Some(mut reply_handler) = taken else {
            self.deliver(msg);
            return;
        };
        reply_handler(&self.handle, msg);

        let mut shared = self.handle.lock();
        if let Some(state) = shared
            .circuits
            .table_mut(trans.circuit)
            .and_then(|t| t.get_mut(trans.origin, trans.msgid))
        {
            state.reply_handler.get_or_insert(reply_handler);
        }
    }

    fn terminate(mut self, err: IoqError) -> Result<()> {
        let code = err.code();
        if err == IoqError::Eof {
            info!(label = %self.config.label, "connection closing");
        } else {
            warn!(label = %self.config.label, error = %err, code, "connection failed");
        }

        self.handle.lock().closed = true;
        let mut stale = self.tx.drain();
        stale.extend(self.outbound.try_iter());
        stale.extend(self.rx.take_partial());
        let circuits = {
            let mut shared = self.handle.lock();
            for msg in stale {
                shared.release(msg);
            }
            shared.circuits.ids()
        };

        for circuit in circuits {
            for origin in [Origin::Remote, Origin::Local] {
                let msgids = self
                    .handle
                    .lock()
                    .circuits
                    .table(circuit)
                    .map(|t| t.ids(origin))
                    .unwrap_or_default();
                for msgid in msgids {
                    self.synthesize_close(
                        TransRef {
                            circuit,
                            msgid,
                            origin,
                        },
                        code,
                    );
                }
            }
            self.handle.lock().circuits.maybe_teardown(circuit);
        }

        let eof = {
            let mut shared = self.handle.lock();
            let mut msg = shared.pool.checkout(LNK_ERROR, 0, self.config.frame.wire_order);
            msg.set_error(code);
            msg
        };
        self.deliver(&eof);
        self.handle.release(eof);
        self.handle.inner.flags.set(EOF);

        let stats = self.handle.stats();
        info!(
            label = %self.config.label,
            frames_received = stats.frames_received,
            frames_sent = stats.frames_sent,
            synthesized_closes = stats.synthesized_closes,
            "connection core stopped"
        );
        if err == IoqError::Eof {
            Ok(())
        } else {
            Err(IocomError::Terminated(err))
        }
    }

    /// Deliver a final `LNK_ERROR` for one still-open transaction and drop
    /// its record. Records whose receive side already closed go silently.
    fn synthesize_close(&mut self, trans: TransRef, code: u32) {
        let (msg, reply_handler) = {
            let mut guard = self.handle.lock();
            let shared = &mut *guard;
            let Some(table) = shared.circuits.table_mut(trans.circuit) else {
                return;
            };
            let Some(state) = table.get_mut(trans.origin, trans.msgid) else {
                return;
            };
            if state.rxcmd & DELETE != 0 {
                table.remove(trans.origin, trans.msgid);
                return;
            }

            let mut flags = DELETE | ABORT;
            if trans.origin == Origin::Local {
                flags |= REPLY;
                if state.rxcmd & CREATE == 0 {
                    flags |= CREATE;
                }
            }
            state.rxcmd |= flags;
            let reply_handler = state.reply_handler.take();

            let mut msg = shared
                .pool
                .checkout(LNK_ERROR | flags, 0, self.config.frame.wire_order);
            msg.set_msgid(trans.msgid);
            msg.set_circuit(trans.circuit);
            msg.set_error(code);
            msg.set_trans(Some(trans));
            shared.stats.synthesized_closes += 1;
            (msg, reply_handler)
        };

        debug!(
            label = %self.config.label,
            msgid = trans.msgid,
            circuit = trans.circuit,
            cmd = %flags_name(msg.cmd()),
            "synthesized close"
        );
        match reply_handler {
            Some(mut reply_handler) => reply_handler(&self.handle, &msg),
            None => self.deliver(&msg),
        }

        let mut shared = self.handle.lock();
        if let Some(table) = shared.circuits.table_mut(trans.circuit) {
            table.remove(trans.origin, trans.msgid);
        }
        shared.release(msg);
    }
}

fn pollfd(fd: std::os::fd::RawFd, events: libc::c_short) -> libc::pollfd {
    libc::pollfd {
        fd,
        events,
        revents: 0,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::mpsc::Sender;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    use bytes::BytesMut;
    use dmsgprims_frame::header::{with_header_size, TRANS_MASK};
    use dmsgprims_frame::{
        CipherError, FrameConfig, FrameError, FrameReader, FrameWriter, HDR_MAX, LNK_PING,
        LNK_SPAN,
    };

    use super::*;
    use crate::state::ReplyHandler;

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Seen {
        cmd: u32,
        msgid: u64,
        circuit: u64,
        error: u32,
        aux: Vec<u8>,
    }

    impl Seen {
        fn of(msg: &Message) -> Self {
            Self {
                cmd: msg.cmd(),
                msgid: msg.msgid(),
                circuit: msg.circuit(),
                error: msg.error(),
                aux: msg.aux().to_vec(),
            }
        }
    }

    fn collector() -> (impl IocomHandler, Receiver<Seen>) {
        let (tx, rx) = mpsc::channel();
        let handler = move |_: &IocomHandle, msg: &Message| {
            let _ = tx.send(Seen::of(msg));
        };
        (handler, rx)
    }

    fn config() -> IocomConfig {
        IocomConfig::default()
            .with_poll_timeout(Duration::from_millis(100))
            .with_label("test")
    }

    struct Peer {
        reader: FrameReader<DmsgStream>,
        writer: FrameWriter<DmsgStream>,
    }

    impl Peer {
        fn new(stream: DmsgStream) -> Self {
            let reader_stream = stream.try_clone().expect("stream should clone");
            Self {
                reader: FrameReader::with_timeout(reader_stream, FrameConfig::default(), Some(WAIT))
                    .expect("reader should build"),
                writer: FrameWriter::new(stream),
            }
        }

        fn send(&mut self, cmd: u32, msgid: u64, circuit: u64, aux: &[u8]) {
            let mut msg = self.writer.message(cmd, aux.len());
            msg.set_msgid(msgid);
            msg.set_circuit(circuit);
            msg.write_aux(aux);
            self.writer.send(msg).expect("peer send should succeed");
        }

        fn recv(&mut self) -> Message {
            self.reader.read_message().expect("peer should receive a frame")
        }
    }

    fn spawn(
        handler: impl IocomHandler + 'static,
    ) -> (IocomHandle, Peer, JoinHandle<Result<()>>) {
        let (local, remote) = DmsgStream::pair().expect("pair should open");
        let iocom = Iocom::new(local, handler, config()).expect("iocom should start");
        let handle = iocom.handle();
        let join = thread::spawn(move || iocom.run());
        (handle, Peer::new(remote), join)
    }

    fn next(rx: &Receiver<Seen>) -> Seen {
        rx.recv_timeout(WAIT).expect("handler should see a frame")
    }

    #[test]
    fn create_then_delete_on_circuit_zero() {
        let (tx, rx) = mpsc::channel();
        let handler = move |handle: &IocomHandle, msg: &Message| {
            if msg.msgid() == 7 && msg.is_delete() {
                handle.reply(msg, 0).expect("reply should queue");
            }
            let _ = tx.send(Seen::of(msg));
        };
        let (handle, mut peer, join) = spawn(handler);

        peer.send(LNK_PING | CREATE, 7, 0, b"open");
        let open = next(&rx);
        assert_eq!((open.cmd, open.msgid, open.aux.as_slice()), (LNK_PING | CREATE, 7, &b"open"[..]));

        peer.send(LNK_PING | DELETE, 7, 0, b"");
        assert_eq!(next(&rx).cmd, LNK_PING | DELETE);

        let reply = peer.recv();
        assert_eq!(reply.msgid(), 7);
        assert!(reply.is_reply() && reply.is_create() && reply.is_delete());
        assert_eq!(reply.cmd() & !TRANS_MASK, LNK_ERROR);
        assert_eq!(handle.transactions(), 0);

        handle.shutdown();
        join.join().expect("core thread should finish").expect("shutdown is clean");
        let eof = next(&rx);
        assert_eq!((eof.cmd, eof.msgid, eof.error), (LNK_ERROR, 0, IoqError::Eof.code()));
        assert!(handle.is_finished());

        let late = handle.alloc(0, 0, LNK_PING, None).expect("alloc still works");
        assert!(matches!(handle.write(late), Err(IocomError::Closed)));
    }

    #[test]
    fn peer_loss_closes_every_open_transaction_then_eof() {
        let (handler, rx) = collector();
        let (handle, mut peer, join) = spawn(handler);

        for msgid in 1..=3 {
            peer.send(LNK_PING | CREATE, msgid, 0, b"");
            assert_eq!(next(&rx).msgid, msgid);
        }
        let cmd = handle
            .alloc(0, 0, LNK_PING | CREATE, None)
            .expect("alloc should succeed");
        let local_id = cmd.msgid();
        handle.write(cmd).expect("write should queue");
        assert_eq!(peer.recv().msgid(), local_id);
        assert_eq!(handle.transactions(), 4);

        drop(peer);
        join.join().expect("core thread should finish").expect("peer EOF is clean");

        let code = IoqError::Eof.code();
        for msgid in 1..=3 {
            let close = next(&rx);
            assert_eq!((close.cmd, close.msgid, close.error), (LNK_ERROR | DELETE | ABORT, msgid, code));
        }
        let local = next(&rx);
        assert_eq!(local.msgid, local_id);
        assert_eq!(local.cmd, LNK_ERROR | CREATE | REPLY | DELETE | ABORT);
        let eof = next(&rx);
        assert_eq!((eof.cmd, eof.msgid, eof.error), (LNK_ERROR, 0, code));
        assert!(rx.try_recv().is_err(), "nothing follows the EOF frame");

        assert_eq!(handle.transactions(), 0);
        assert_eq!(handle.stats().synthesized_closes, 4);
    }

    #[test]
    fn bad_magic_terminates_with_sync_error() {
        let (handler, rx) = collector();
        let (_handle, mut peer, join) = spawn(handler);

        peer.send(LNK_PING | CREATE, 3, 0, b"");
        next(&rx);
        peer.writer.get_mut().write_all(&[0u8; 64]).expect("raw write");

        let result = join.join().expect("core thread should finish");
        assert!(matches!(result, Err(IocomError::Terminated(IoqError::Sync))));
        let code = IoqError::Sync.code();
        let close = next(&rx);
        assert_eq!((close.msgid, close.error), (3, code));
        let eof = next(&rx);
        assert_eq!((eof.msgid, eof.error), (0, code));
    }

    #[test]
    fn frame_on_unknown_circuit_is_fatal() {
        let (handler, rx) = collector();
        let (_handle, mut peer, join) = spawn(handler);

        peer.send(LNK_PING, 0, 9, b"");
        let result = join.join().expect("core thread should finish");
        assert!(matches!(result, Err(IocomError::Terminated(IoqError::BadCircuit))));
        assert_eq!(next(&rx).error, IoqError::BadCircuit.code());
    }

    #[test]
    fn late_aborts_are_dropped_without_error() {
        let (handler, rx) = collector();
        let (handle, mut peer, join) = spawn(handler);

        peer.send(LNK_ERROR | ABORT | DELETE, 44, 0, b"");
        peer.send(LNK_ERROR | ABORT | DELETE, 44, 0, b"");
        peer.send(LNK_PING, 0, 0, b"after");
        let seen = next(&rx);
        assert_eq!((seen.cmd, seen.aux.as_slice()), (LNK_PING, &b"after"[..]));

        handle.shutdown();
        join.join().expect("core thread should finish").expect("shutdown is clean");
        assert_eq!(handle.stats().late_aborts, 2);
    }

    #[test]
    fn abort_after_both_sides_closed_is_counted_and_dropped() {
        let (tx, rx) = mpsc::channel();
        let handler = move |handle: &IocomHandle, msg: &Message| {
            if msg.msgid() == 7 && msg.is_delete() && !msg.is_abort() {
                handle.reply(msg, 0).expect("reply should queue");
            }
            let _ = tx.send(Seen::of(msg));
        };
        let (handle, mut peer, join) = spawn(handler);

        peer.send(LNK_PING | CREATE, 7, 0, b"");
        peer.send(LNK_PING | DELETE, 7, 0, b"");
        assert_eq!(next(&rx).cmd, LNK_PING | CREATE);
        assert_eq!(next(&rx).cmd, LNK_PING | DELETE);
        assert!(peer.recv().is_delete());
        assert_eq!(handle.transactions(), 0);

        // Command direction closed, reply direction still open.
        peer.send(LNK_PING | CREATE, 8, 0, b"");
        peer.send(LNK_PING | DELETE, 8, 0, b"");
        next(&rx);
        next(&rx);

        peer.send(LNK_ERROR | ABORT | DELETE, 7, 0, b"");
        peer.send(LNK_ERROR | ABORT | DELETE, 8, 0, b"");
        peer.send(LNK_PING, 0, 0, b"still up");
        let seen = next(&rx);
        assert_eq!((seen.cmd, seen.aux.as_slice()), (LNK_PING, &b"still up"[..]));

        assert_eq!(handle.stats().late_aborts, 2);
        let open = TransRef {
            circuit: 0,
            msgid: 8,
            origin: Origin::Remote,
        };
        assert_eq!(handle.transaction_flags(open), Some((0, CREATE | DELETE)));

        handle.shutdown();
        join.join().expect("core thread should finish").expect("shutdown is clean");
    }

    #[test]
    fn stale_abort_leaves_reused_msgid_untouched() {
        let (tx, rx) = mpsc::channel();
        let handler = move |handle: &IocomHandle, msg: &Message| {
            if msg.is_delete() && !msg.is_abort() {
                handle.reply(msg, 0).expect("reply should queue");
            }
            let _ = tx.send(Seen::of(msg));
        };
        let (handle, mut peer, join) = spawn(handler);

        peer.send(LNK_PING | CREATE | DELETE, 9, 0, b"first");
        assert_eq!(next(&rx).aux, b"first");
        assert!(peer.recv().is_delete());
        assert_eq!(handle.transactions(), 0);

        peer.send(LNK_PING | CREATE, 9, 0, b"second");
        assert_eq!(next(&rx).aux, b"second");
        let reused = TransRef {
            circuit: 0,
            msgid: 9,
            origin: Origin::Remote,
        };
        assert_eq!(handle.transaction_flags(reused), Some((0, CREATE)));

        // An abort of the first command's CREATE arrives after reuse.
        peer.send(LNK_ERROR | CREATE | ABORT | DELETE, 9, 0, b"");
        peer.send(LNK_PING, 0, 0, b"marker");
        assert_eq!(next(&rx).aux, b"marker");

        assert_eq!(handle.stats().late_aborts, 1);
        assert_eq!(handle.transaction_flags(reused), Some((0, CREATE)));

        peer.send(LNK_PING | DELETE, 9, 0, b"");
        assert_eq!(next(&rx).cmd, LNK_PING | DELETE);
        assert!(peer.recv().is_delete());
        assert_eq!(handle.transactions(), 0);

        handle.shutdown();
        join.join().expect("core thread should finish").expect("shutdown is clean");
    }

    #[test]
    fn oversized_header_is_rejected_at_alloc() {
        let (handler, _rx) = collector();
        let (handle, mut peer, join) = spawn(handler);

        let cmd = with_header_size(LNK_SPAN, 4096);
        match handle.alloc(0, 0, cmd, None) {
            Err(IocomError::Frame(FrameError::HeaderSize { size, max })) => {
                assert_eq!((size, max), (4096, HDR_MAX));
            }
            other => panic!("expected header size error, got {other:?}"),
        }
        assert_eq!(handle.transactions(), 0);

        let ping = handle.alloc(0, 0, LNK_PING, None).expect("alloc should succeed");
        handle.write(ping).expect("write should queue");
        assert_eq!(peer.recv().cmd(), LNK_PING);

        handle.shutdown();
        join.join().expect("core thread should finish").expect("shutdown is clean");
    }

    struct BrokenEncrypt;

    impl Cipher for BrokenEncrypt {
        fn name(&self) -> &'static str {
            "broken-encrypt"
        }

        fn negotiate(&mut self, _stream: &mut DmsgStream) -> std::result::Result<(), CipherError> {
            Ok(())
        }

        fn is_active(&self) -> bool {
            true
        }

        fn decrypt(&mut self, region: &mut [u8]) -> std::result::Result<usize, CipherError> {
            Ok(region.len())
        }

        fn encrypt(
            &mut self,
            _plain: &[&[u8]],
            _out: &mut BytesMut,
        ) -> std::result::Result<(), CipherError> {
            Err(CipherError("key schedule exhausted".into()))
        }
    }

    #[test]
    fn encrypt_failure_terminates_with_cipher_code() {
        let (handler, rx) = collector();
        let (local, _remote) = DmsgStream::pair().expect("pair should open");
        let iocom = Iocom::with_cipher(local, handler, config(), Box::new(BrokenEncrypt))
            .expect("iocom should start");
        let handle = iocom.handle();
        let join = thread::spawn(move || iocom.run());

        let msg = handle.alloc(0, 0, LNK_PING, None).expect("alloc should succeed");
        handle.write(msg).expect("write should queue");

        let result = join.join().expect("core thread should finish");
        assert!(matches!(result, Err(IocomError::Terminated(IoqError::Cipher))));
        let eof = next(&rx);
        assert_eq!((eof.cmd, eof.msgid, eof.error), (LNK_ERROR, 0, IoqError::Cipher.code()));
        let pool = handle.pool_stats();
        assert_eq!(pool.created + pool.reused, pool.released);
    }

    #[test]
    fn racing_writes_reach_the_wire_in_classification_order() {
        let (handler, _rx) = collector();
        let (handle, mut peer, join) = spawn(handler);

        for _ in 0..50 {
            let create = handle
                .alloc(0, 0, LNK_PING | CREATE, None)
                .expect("alloc should succeed");
            let msgid = create.msgid();

            let closer = handle.clone();
            let delete = thread::spawn(move || loop {
                let mut msg = closer.alloc(0, 0, LNK_PING | DELETE, None).expect("alloc");
                msg.set_msgid(msgid);
                match closer.write(msg) {
                    Ok(()) => break,
                    Err(IocomError::Protocol { .. }) => thread::yield_now(),
                    Err(err) => panic!("unexpected write error: {err}"),
                }
            });
            handle.write(create).expect("write should queue");
            delete.join().expect("delete thread should finish");

            let first = peer.recv();
            let second = peer.recv();
            assert_eq!((first.msgid(), second.msgid()), (msgid, msgid));
            assert!(first.is_create() && !first.is_delete());
            assert!(second.is_delete() && !second.is_create());
        }

        handle.shutdown();
        join.join().expect("core thread should finish").expect("shutdown is clean");
    }

    struct Stash(Sender<Message>);

    impl Router for Stash {
        fn route(&mut self, _handle: &IocomHandle, _circuit: u64, msg: Message) -> RouteDecision {
            let _ = self.0.send(msg);
            RouteDecision::Relayed
        }
    }

    #[test]
    fn relayed_frame_holds_circuit_until_released() {
        let (handler, _rx) = collector();
        let (stash_tx, stash_rx) = mpsc::channel();
        let (local, remote) = DmsgStream::pair().expect("pair should open");
        let iocom = Iocom::new(local, handler, config())
            .expect("iocom should start")
            .with_router(Stash(stash_tx));
        let handle = iocom.handle();
        assert!(handle.attach_circuit(5));
        let join = thread::spawn(move || iocom.run());
        let mut peer = Peer::new(remote);

        peer.send(LNK_PING, 0, 5, b"relay me");
        let relayed = stash_rx.recv_timeout(WAIT).expect("router should see the frame");
        assert_eq!(relayed.aux(), b"relay me");
        assert!(relayed.holds_circuit_ref());

        assert!(handle.detach_circuit(5));
        assert!(handle.has_circuit(5), "relayed message keeps the circuit");
        handle.release(relayed);
        assert!(!handle.has_circuit(5));

        handle.shutdown();
        join.join().expect("core thread should finish").expect("shutdown is clean");
        assert_eq!(handle.stats().relayed, 1);
    }

    fn echo(handle: &IocomHandle, msg: &Message) {
        if msg.is_create() && !msg.is_reply() {
            let mut reply = handle
                .alloc(msg.circuit(), msg.aux().len(), msg.cmd_switch() | CREATE | DELETE | REPLY, None)
                .expect("reply alloc");
            reply.set_msgid(msg.msgid());
            reply.write_aux(msg.aux());
            handle.write(reply).expect("reply write");
        }
    }

    #[test]
    fn reply_handler_sees_the_reply() {
        let (left, right) = DmsgStream::pair().expect("pair should open");
        let server = Iocom::new(right, echo, config().with_label("server")).expect("server");
        let server_handle = server.handle();
        let server_join = thread::spawn(move || server.run());

        let (handler, unsolicited) = collector();
        let client = Iocom::new(left, handler, config().with_label("client")).expect("client");
        let client_handle = client.handle();
        let client_join = thread::spawn(move || client.run());

        let (reply_tx, reply_rx) = mpsc::channel();
        for round in 0..3u8 {
            let tx = reply_tx.clone();
            let on_reply: ReplyHandler = Box::new(move |_: &IocomHandle, msg: &Message| {
                let _ = tx.send(Seen::of(msg));
            });
            let mut cmd = client_handle
                .alloc(0, 5, LNK_PING | CREATE | DELETE, Some(on_reply))
                .expect("alloc should succeed");
            cmd.write_aux(&[b'a' + round; 5]);
            let msgid = cmd.msgid();
            client_handle.write(cmd).expect("write should queue");

            let reply = next(&reply_rx);
            assert_eq!(reply.msgid, msgid);
            assert_eq!(reply.cmd, LNK_PING | CREATE | DELETE | REPLY);
            assert_eq!(reply.aux, vec![b'a' + round; 5]);
        }

        client_handle.shutdown();
        client_join.join().expect("client thread").expect("client shutdown is clean");
        server_join.join().expect("server thread").expect("server sees EOF");

        let eof = next(&unsolicited);
        assert_eq!((eof.cmd, eof.msgid), (LNK_ERROR, 0));
        assert_eq!(client_handle.stats().synthesized_closes, 0);
        assert_eq!(server_handle.stats().frames_received, 3);
        assert!(client_handle.pool_stats().reused > 0);
    }

    struct Restated {
        seen: Sender<Seen>,
        alt: Sender<()>,
    }

    impl IocomHandler for Restated {
        fn on_message(&mut self, _handle: &IocomHandle, msg: &Message) {
            let _ = self.seen.send(Seen::of(msg));
        }

        fn on_alt(&mut self, _handle: &IocomHandle) {
            let _ = self.alt.send(());
        }
    }

    #[test]
    fn restate_swaps_handler_and_reruns_callbacks() {
        let (first, first_rx) = collector();
        let (handle, mut peer, join) = spawn(first);

        peer.send(LNK_PING, 0, 0, b"one");
        assert_eq!(next(&first_rx).aux, b"one");

        let (seen, second_rx) = mpsc::channel();
        let (alt, alt_rx) = mpsc::channel();
        handle.restate(Restated { seen, alt });
        alt_rx.recv_timeout(WAIT).expect("alt callback runs after restate");

        peer.send(LNK_PING, 0, 0, b"two");
        assert_eq!(next(&second_rx).aux, b"two");
        assert!(first_rx.try_recv().is_err());

        handle.shutdown();
        join.join().expect("core thread should finish").expect("shutdown is clean");
    }

    struct AltReader {
        alt: UnixStream,
        out: Sender<Vec<u8>>,
    }

    impl IocomHandler for AltReader {
        fn on_message(&mut self, _handle: &IocomHandle, _msg: &Message) {}

        fn on_alt(&mut self, _handle: &IocomHandle) {
            let mut buf = [0u8; 16];
            if let Ok(n) = self.alt.read(&mut buf) {
                let _ = self.out.send(buf[..n].to_vec());
            }
        }
    }

    #[test]
    fn alt_channel_readiness_runs_callback() {
        let (alt, mut alt_peer) = UnixStream::pair().expect("alt pair");
        alt.set_nonblocking(true).expect("nonblocking alt");
        let watched = alt.try_clone().expect("alt clone");
        let (out, out_rx) = mpsc::channel();

        let (local, _remote) = DmsgStream::pair().expect("pair should open");
        let iocom = Iocom::new(local, AltReader { alt, out }, config())
            .expect("iocom should start")
            .with_alt(watched);
        let handle = iocom.handle();
        let join = thread::spawn(move || iocom.run());

        alt_peer.write_all(b"poke").expect("alt write");
        let got = loop {
            let chunk = out_rx.recv_timeout(WAIT).expect("alt callback should run");
            if !chunk.is_empty() {
                break chunk;
            }
        };
        assert_eq!(got, b"poke");

        handle.shutdown();
        join.join().expect("core thread should finish").expect("shutdown is clean");
    }

    #[test]
    fn unwritten_command_is_forgotten_on_release() {
        let (handler, _rx) = collector();
        let (local, _remote) = DmsgStream::pair().expect("pair should open");
        let iocom = Iocom::new(local, handler, config()).expect("iocom should start");
        let handle = iocom.handle();

        let first = handle.alloc(0, 0, LNK_PING | CREATE, None).expect("alloc");
        let second = handle.alloc(0, 0, LNK_PING | CREATE, None).expect("alloc");
        assert_eq!((first.msgid(), second.msgid()), (1, 2));
        assert_eq!(handle.transactions(), 2);

        handle.release(first);
        handle.release(second);
        assert_eq!(handle.transactions(), 0);
        assert!(matches!(
            handle.alloc(3, 0, LNK_PING, None),
            Err(IocomError::UnknownCircuit(3))
        ));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "already open")]
    fn reused_local_msgid_is_caught() {
        let (handler, _rx) = collector();
        let (local, _remote) = DmsgStream::pair().expect("pair should open");
        let iocom = Iocom::new(local, handler, config()).expect("iocom should start");
        let handle = iocom.handle();

        let _first = handle.alloc(0, 0, LNK_PING | CREATE, None).expect("alloc");
        handle.inner.next_msgid.store(1, std::sync::atomic::Ordering::Relaxed);
        let _second = handle.alloc(0, 0, LNK_PING | CREATE, None);
    }

    #[test]
    fn write_rejects_stream_without_open_transaction() {
        let (handler, _rx) = collector();
        let (local, _remote) = DmsgStream::pair().expect("pair should open");
        let iocom = Iocom::new(local, handler, config()).expect("iocom should start");
        let handle = iocom.handle();

        let mut msg = handle.alloc(0, 0, LNK_PING, None).expect("alloc");
        msg.set_msgid(99);
        assert!(matches!(handle.write(msg), Err(IocomError::Protocol { msgid: 99, .. })));

        let trans = TransRef {
            circuit: 0,
            msgid: 99,
            origin: Origin::Local,
        };
        handle.abort(trans).expect("abort on unknown transaction is a no-op");
        handle.abort(trans).expect("abort is idempotent");
        assert_eq!(handle.pool_stats().released, 1);
    }
}
