//! Transaction records and the rules that open and close them.
//!
//! A transaction has two directions: the command direction, sent by the
//! side that issued CREATE, and the reply direction (REPLY set). Each
//! direction opens with CREATE and closes with DELETE. The record lives in
//! the `sent` map when this side issued the command and in `received` when
//! the peer did, and is destroyed once both directions carried DELETE.

use std::any::Any;
use std::collections::BTreeMap;

use dmsgprims_frame::header::{flags_name, TRANS_MASK};
use dmsgprims_frame::{IoqError, Message, MsgHeader, Origin, TransRef, ABORT, CREATE, DELETE, REPLY};

use crate::error::IocomError;
use crate::handle::IocomHandle;

/// Completion callback invoked for frames received on one transaction.
pub type ReplyHandler = Box<dyn FnMut(&IocomHandle, &Message) + Send>;

/// One transaction.
pub struct State {
    pub(crate) msgid: u64,
    pub(crate) circuit: u64,
    pub(crate) origin: Origin,
    /// Flag bits this side has transmitted.
    pub(crate) txcmd: u32,
    /// Flag bits observed from the peer.
    pub(crate) rxcmd: u32,
    /// Header of the opening frame, dropped once the transaction closes.
    pub(crate) head: Option<MsgHeader>,
    pub(crate) payload: Option<Box<dyn Any + Send>>,
    pub(crate) reply_handler: Option<ReplyHandler>,
}

impl State {
    pub(crate) fn new(msgid: u64, circuit: u64, origin: Origin) -> Self {
        Self {
            msgid,
            circuit,
            origin,
            txcmd: 0,
            rxcmd: 0,
            head: None,
            payload: None,
            reply_handler: None,
        }
    }

    pub fn trans(&self) -> TransRef {
        TransRef {
            circuit: self.circuit,
            msgid: self.msgid,
            origin: self.origin,
        }
    }

    pub fn txcmd(&self) -> u32 {
        self.txcmd
    }

    pub fn rxcmd(&self) -> u32 {
        self.rxcmd
    }

    pub fn head(&self) -> Option<&MsgHeader> {
        self.head.as_ref()
    }

    pub fn tx_open(&self) -> bool {
        self.txcmd & CREATE != 0 && self.txcmd & DELETE == 0
    }

    pub fn rx_open(&self) -> bool {
        self.rxcmd & CREATE != 0 && self.rxcmd & DELETE == 0
    }

    /// Both directions have carried DELETE.
    pub fn is_closed(&self) -> bool {
        self.txcmd & DELETE != 0 && self.rxcmd & DELETE != 0
    }
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("msgid", &self.msgid)
            .field("circuit", &self.circuit)
            .field("origin", &self.origin)
            .field("txcmd", &flags_name(self.txcmd))
            .field("rxcmd", &flags_name(self.rxcmd))
            .field("has_payload", &self.payload.is_some())
            .field("has_reply_handler", &self.reply_handler.is_some())
            .finish()
    }
}

/// The two ordered transaction maps of one circuit.
#[derive(Debug, Default)]
pub struct StateTable {
    sent: BTreeMap<u64, State>,
    received: BTreeMap<u64, State>,
}

impl StateTable {
    fn map(&self, origin: Origin) -> &BTreeMap<u64, State> {
        match origin {
            Origin::Local => &self.sent,
            Origin::Remote => &self.received,
        }
    }

    fn map_mut(&mut self, origin: Origin) -> &mut BTreeMap<u64, State> {
        match origin {
            Origin::Local => &mut self.sent,
            Origin::Remote => &mut self.received,
        }
    }

    pub fn get(&self, origin: Origin, msgid: u64) -> Option<&State> {
        self.map(origin).get(&msgid)
    }

    pub fn get_mut(&mut self, origin: Origin, msgid: u64) -> Option<&mut State> {
        self.map_mut(origin).get_mut(&msgid)
    }

    /// Insert a new record. Returns `false` if the id is already in use.
    pub fn insert(&mut self, state: State) -> bool {
        let map = self.map_mut(state.origin);
        if map.contains_key(&state.msgid) {
            return false;
        }
        map.insert(state.msgid, state);
        true
    }

    pub fn remove(&mut self, origin: Origin, msgid: u64) -> Option<State> {
        self.map_mut(origin).remove(&msgid)
    }

    /// Message ids of one map in ascending order.
    pub fn ids(&self, origin: Origin) -> Vec<u64> {
        self.map(origin).keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.sent.len() + self.received.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.is_empty() && self.received.is_empty()
    }
}

/// How a received frame relates to the transaction maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxClass {
    /// Non-transactional frame.
    OneOff,
    /// Frame on this transaction; its flags have been recorded.
    Trans(TransRef),
}

/// Which map a frame's message id refers to, from the receiver's side.
fn rx_origin(cmd: u32) -> Origin {
    if cmd & REPLY != 0 {
        Origin::Local
    } else {
        Origin::Remote
    }
}

fn late_or(cmd: u32, err: IoqError) -> IoqError {
    if cmd & ABORT != 0 {
        IoqError::Already
    } else {
        err
    }
}

/// Resolve a received frame against `table`, recording its flags.
///
/// A first CREATE without REPLY opens a record in `received`. Anything else
/// transactional needs an existing record whose direction is open; when
/// that is missing an ABORT frame is a late abort ([`IoqError::Already`])
/// and any other frame a protocol violation ([`IoqError::Trans`]).
pub fn classify_rx(table: &mut StateTable, msg: &Message) -> Result<RxClass, IoqError> {
    let cmd = msg.cmd();
    let flags = cmd & TRANS_MASK;
    let msgid = msg.msgid();

    if msgid == 0 {
        return if flags == 0 {
            Ok(RxClass::OneOff)
        } else {
            Err(IoqError::Trans)
        };
    }

    let origin = rx_origin(cmd);
    if cmd & CREATE != 0 && origin == Origin::Remote {
        let mut state = State::new(msgid, msg.circuit(), Origin::Remote);
        state.rxcmd = flags;
        state.head = Some(*msg.header());
        let trans = state.trans();
        if !table.insert(state) {
            return Err(late_or(cmd, IoqError::Trans));
        }
        return Ok(RxClass::Trans(trans));
    }

    let Some(state) = table.get_mut(origin, msgid) else {
        return Err(late_or(cmd, IoqError::Trans));
    };
    if cmd & CREATE != 0 {
        // Reply direction opening on one of our commands.
        if state.rxcmd & CREATE != 0 {
            return Err(late_or(cmd, IoqError::Trans));
        }
    } else if !state.rx_open() {
        return Err(late_or(cmd, IoqError::Trans));
    }
    state.rxcmd |= flags;
    Ok(RxClass::Trans(state.trans()))
}

/// How an outbound frame relates to the transaction maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxClass {
    OneOff,
    Trans(TransRef),
    /// Late abort on a transaction that already closed: drop the frame.
    Discard,
}

fn violation(msg: &Message, reason: &'static str) -> IocomError {
    IocomError::Protocol {
        msgid: msg.msgid(),
        flags: flags_name(msg.cmd()),
        reason,
    }
}

/// Apply the transmit-side rules to an outbound frame, recording its flags.
///
/// Mirrors [`classify_rx`]: a local command must have been opened by
/// allocation, and replies need an open received command.
pub fn classify_tx(table: &mut StateTable, msg: &Message) -> Result<TxClass, IocomError> {
    let cmd = msg.cmd();
    let flags = cmd & TRANS_MASK;
    let msgid = msg.msgid();

    if msgid == 0 {
        return if flags == 0 {
            Ok(TxClass::OneOff)
        } else {
            Err(violation(msg, "transaction flags on message id 0"))
        };
    }

    // Our command direction lives in `sent`; replies go to `received`.
    let origin = if cmd & REPLY != 0 {
        Origin::Remote
    } else {
        Origin::Local
    };
    let Some(state) = table.get_mut(origin, msgid) else {
        if cmd & ABORT != 0 {
            return Ok(TxClass::Discard);
        }
        return Err(violation(msg, "no such transaction"));
    };

    if cmd & CREATE != 0 {
        if state.txcmd & CREATE != 0 {
            if cmd & ABORT != 0 {
                return Ok(TxClass::Discard);
            }
            return Err(violation(msg, "transaction already created"));
        }
        if origin == Origin::Remote && state.rxcmd & CREATE == 0 {
            return Err(violation(msg, "reply before command"));
        }
    } else if !state.tx_open() {
        if cmd & ABORT != 0 {
            return Ok(TxClass::Discard);
        }
        return Err(violation(msg, "transaction not open"));
    }
    state.txcmd |= flags;
    Ok(TxClass::Trans(state.trans()))
}
