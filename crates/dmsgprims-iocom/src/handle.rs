use std::any::Any;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{SendError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dmsgprims_frame::header::{flags_name, header_size};
use dmsgprims_frame::{
    ByteOrder, FrameError, Message, MessagePool, Origin, PoolStats, TransRef, ABORT, CREATE,
    DELETE, HDR_MAX, LNK_ERROR, REPLY,
};
use serde::Serialize;
use tracing::debug;

use crate::circuit::CircuitSet;
use crate::error::{IocomError, Result};
use crate::flags::{WorkFlags, ALTWORK, EOF, RWORK, SHUTDOWN, SWORK, WWORK};
use crate::handler::IocomHandler;
use crate::state::{classify_tx, ReplyHandler, State, TxClass};

/// Connection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IocomStats {
    pub frames_received: u64,
    pub frames_sent: u64,
    pub late_aborts: u64,
    pub relayed: u64,
    pub synthesized_closes: u64,
}

/// State behind the connection lock.
pub(crate) struct Shared {
    pub(crate) pool: MessagePool,
    pub(crate) circuits: CircuitSet,
    pub(crate) stats: IocomStats,
    pub(crate) closed: bool,
}

impl Shared {
    /// Return a message container, dropping its circuit reference.
    ///
    /// A command allocated with CREATE but never written takes its
    /// transaction record with it.
    pub(crate) fn release(&mut self, msg: Message) {
        if let Some(trans) = msg.trans() {
            if trans.origin == Origin::Local && msg.is_create() && !msg.is_reply() {
                if let Some(table) = self.circuits.table_mut(trans.circuit) {
                    let unsent = table
                        .get(Origin::Local, trans.msgid)
                        .is_some_and(|s| s.txcmd == 0 && s.rxcmd == 0);
                    if unsent {
                        table.remove(Origin::Local, trans.msgid);
                    }
                }
            }
        }
        let circuit = msg.circuit();
        if msg.holds_circuit_ref() {
            self.circuits.release_ref(circuit);
        } else if circuit != 0 {
            self.circuits.maybe_teardown(circuit);
        }
        self.pool.release(msg);
    }

    /// Drop the record of `trans` once both directions have closed.
    pub(crate) fn finish_if_closed(&mut self, trans: TransRef) {
        let Some(table) = self.circuits.table_mut(trans.circuit) else {
            return;
        };
        let closed = table
            .get(trans.origin, trans.msgid)
            .is_some_and(State::is_closed);
        if closed {
            table.remove(trans.origin, trans.msgid);
            debug!(msgid = trans.msgid, circuit = trans.circuit, "transaction closed");
            if trans.circuit != 0 {
                self.circuits.maybe_teardown(trans.circuit);
            }
        }
    }
}

pub(crate) struct Inner {
    pub(crate) shared: Mutex<Shared>,
    pub(crate) flags: WorkFlags,
    pub(crate) pending_handler: Mutex<Option<Box<dyn IocomHandler>>>,
    pub(crate) wire_order: ByteOrder,
    pub(crate) max_aux: usize,
    pub(crate) label: String,
    pub(crate) next_msgid: AtomicU64,
    outbound: Sender<Message>,
    wake: UnixStream,
}

impl Inner {
    pub(crate) fn new(
        pool: MessagePool,
        wire_order: ByteOrder,
        max_aux: usize,
        label: String,
        outbound: Sender<Message>,
        wake: UnixStream,
    ) -> Self {
        Self {
            shared: Mutex::new(Shared {
                pool,
                circuits: CircuitSet::default(),
                stats: IocomStats::default(),
                closed: false,
            }),
            flags: WorkFlags::new(RWORK),
            pending_handler: Mutex::new(None),
            wire_order,
            max_aux,
            label,
            next_msgid: AtomicU64::new(1),
            outbound,
            wake,
        }
    }
}

/// Cloneable submission handle for one connection.
///
/// Usable from any thread. Every operation takes the connection lock only
/// briefly and never performs stream I/O; outbound messages travel to the
/// core loop over a channel.
#[derive(Clone)]
pub struct IocomHandle {
    pub(crate) inner: Arc<Inner>,
}

impl IocomHandle {
    pub(crate) fn new(inner: Inner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Shared> {
        self.inner.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connection label used in logs.
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Allocate a message on `circuit`.
    ///
    /// A CREATE without REPLY opens a new local transaction under a freshly
    /// minted message id; `reply_handler`, if given, then receives every
    /// frame the peer sends on it. The message holds a reference on a
    /// non-zero circuit until it is written or released.
    pub fn alloc(
        &self,
        circuit: u64,
        aux_size: usize,
        cmd: u32,
        reply_handler: Option<ReplyHandler>,
    ) -> Result<Message> {
        let mut msg = self.checkout(circuit, aux_size, cmd)?;
        if cmd & CREATE != 0 && cmd & REPLY == 0 {
            let msgid = self.inner.next_msgid.fetch_add(1, Ordering::Relaxed);
            msg.set_msgid(msgid);
            let mut state = State::new(msgid, circuit, Origin::Local);
            state.head = Some(*msg.header());
            state.reply_handler = reply_handler;
            let trans = state.trans();

            let mut shared = self.lock();
            if let Some(table) = shared.circuits.table_mut(circuit) {
                let inserted = table.insert(state);
                debug_assert!(inserted, "msgid {msgid} already open on circuit {circuit}");
            }
            msg.set_trans(Some(trans));
            debug!(msgid, circuit, cmd = %flags_name(cmd), "transaction opened");
        }
        Ok(msg)
    }

    /// Check out a container without touching transaction state.
    fn checkout(&self, circuit: u64, aux_size: usize, cmd: u32) -> Result<Message> {
        if header_size(cmd) > HDR_MAX {
            return Err(FrameError::HeaderSize {
                size: header_size(cmd),
                max: HDR_MAX,
            }
            .into());
        }
        if aux_size > self.inner.max_aux {
            return Err(FrameError::AuxTooLarge {
                size: aux_size,
                max: self.inner.max_aux,
            }
            .into());
        }
        let mut shared = self.lock();
        let held = shared
            .circuits
            .acquire(circuit)
            .map_err(|_| IocomError::UnknownCircuit(circuit))?;
        let mut msg = shared.pool.checkout(cmd, aux_size, self.inner.wire_order);
        msg.set_circuit(circuit);
        msg.set_circuit_ref(held);
        Ok(msg)
    }

    /// Queue a message for transmission.
    ///
    /// The transmit-side transaction rules are applied and the message is
    /// enqueued under the connection lock, so the core sees writes in the
    /// order they were classified. A late abort on a closed transaction is
    /// dropped silently.
    pub fn write(&self, mut msg: Message) -> Result<()> {
        {
            let mut guard = self.lock();
            let shared = &mut *guard;
            if shared.closed {
                shared.release(msg);
                return Err(IocomError::Closed);
            }
            let circuit = msg.circuit();
            let class = match shared.circuits.table_mut(circuit) {
                Some(table) => classify_tx(table, &msg),
                None => Err(IocomError::UnknownCircuit(circuit)),
            };
            match class {
                Ok(TxClass::OneOff) => msg.set_trans(None),
                Ok(TxClass::Trans(trans)) => {
                    msg.set_trans(Some(trans));
                    shared.finish_if_closed(trans);
                }
                Ok(TxClass::Discard) => {
                    debug!(msgid = msg.msgid(), "late abort dropped");
                    shared.release(msg);
                    return Ok(());
                }
                Err(err) => {
                    shared.release(msg);
                    return Err(err);
                }
            }
            if let Err(SendError(msg)) = self.inner.outbound.send(msg) {
                shared.release(msg);
                return Err(IocomError::Closed);
            }
        }

        self.inner.flags.set(WWORK);
        self.wake();
        Ok(())
    }

    /// Terminate our side of the transaction `msg` belongs to.
    ///
    /// Sends a `LNK_ERROR` carrying `error` with DELETE set. Does nothing
    /// for one-off frames or when our side is already closed.
    pub fn reply(&self, msg: &Message, error: u32) -> Result<()> {
        match msg.trans() {
            Some(trans) => self.send_status(trans, error, DELETE),
            None => Ok(()),
        }
    }

    /// Like [`reply`](Self::reply), but leaves our side open.
    pub fn result(&self, msg: &Message, error: u32) -> Result<()> {
        match msg.trans() {
            Some(trans) => self.send_status(trans, error, 0),
            None => Ok(()),
        }
    }

    /// Abort a transaction: close our side with ABORT set.
    ///
    /// Idempotent; aborting a closed or unknown transaction does nothing.
    pub fn abort(&self, trans: TransRef) -> Result<()> {
        self.send_status(trans, 0, ABORT | DELETE)
    }

    fn send_status(&self, trans: TransRef, error: u32, extra: u32) -> Result<()> {
        let flags = {
            let shared = self.lock();
            let Some(state) = shared
                .circuits
                .table(trans.circuit)
                .and_then(|t| t.get(trans.origin, trans.msgid))
            else {
                return Ok(());
            };
            if state.txcmd & DELETE != 0 {
                return Ok(());
            }
            let mut flags = extra;
            if state.txcmd & CREATE == 0 {
                flags |= CREATE;
            }
            if trans.origin == Origin::Remote {
                flags |= REPLY;
            }
            flags
        };
        let mut msg = self.checkout(trans.circuit, 0, LNK_ERROR | flags)?;
        msg.set_msgid(trans.msgid);
        msg.set_error(error);
        self.write(msg)
    }

    /// Return a message container to the pool.
    pub fn release(&self, msg: Message) {
        self.lock().release(msg);
    }

    /// Ask the core loop to run the signal callback.
    pub fn signal(&self) {
        self.inner.flags.set(SWORK);
        self.wake();
    }

    /// Ask the core loop to close every transaction and stop.
    pub fn shutdown(&self) {
        self.inner.flags.set(SHUTDOWN);
        self.wake();
    }

    /// Swap the callback set. The receive pump and the alt callback run at
    /// least once afterwards.
    pub fn restate(&self, handler: impl IocomHandler + 'static) {
        *self
            .inner
            .pending_handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(handler));
        self.inner.flags.set(RWORK | ALTWORK);
        self.wake();
    }

    /// Attach circuit `id`. Returns `false` for circuit zero.
    pub fn attach_circuit(&self, id: u64) -> bool {
        self.lock().circuits.attach(id)
    }

    /// Drop one attachment of circuit `id`.
    pub fn detach_circuit(&self, id: u64) -> bool {
        self.lock().circuits.detach(id)
    }

    pub fn has_circuit(&self, id: u64) -> bool {
        self.lock().circuits.contains(id)
    }

    /// Attach an opaque payload to a transaction.
    pub fn set_payload(&self, trans: TransRef, payload: Box<dyn Any + Send>) -> bool {
        self.with_state(trans, |state| state.payload = Some(payload))
            .is_some()
    }

    pub fn take_payload(&self, trans: TransRef) -> Option<Box<dyn Any + Send>> {
        self.with_state(trans, |state| state.payload.take())
            .flatten()
    }

    /// Install or replace the reply handler of a transaction.
    pub fn set_reply_handler(&self, trans: TransRef, handler: ReplyHandler) -> bool {
        self.with_state(trans, |state| state.reply_handler = Some(handler))
            .is_some()
    }

    /// Flag bits `(txcmd, rxcmd)` recorded for a live transaction.
    pub fn transaction_flags(&self, trans: TransRef) -> Option<(u32, u32)> {
        self.with_state(trans, |state| (state.txcmd, state.rxcmd))
    }

    /// Open transactions across all circuits.
    pub fn transactions(&self) -> usize {
        self.lock().circuits.transactions()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.lock().pool.stats()
    }

    pub fn stats(&self) -> IocomStats {
        self.lock().stats
    }

    /// Whether the core loop has delivered its final EOF frame.
    pub fn is_finished(&self) -> bool {
        self.inner.flags.contains(EOF)
    }

    fn with_state<R>(&self, trans: TransRef, f: impl FnOnce(&mut State) -> R) -> Option<R> {
        let mut shared = self.lock();
        shared
            .circuits
            .table_mut(trans.circuit)
            .and_then(|t| t.get_mut(trans.origin, trans.msgid))
            .map(f)
    }

    pub(crate) fn wake(&self) {
        // A full wakeup socket already guarantees a pending wakeup.
        let _ = (&self.inner.wake).write(&[1]);
    }
}

impl std::fmt::Debug for IocomHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IocomHandle")
            .field("label", &self.inner.label)
            .finish()
    }
}
