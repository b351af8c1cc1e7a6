//! Free lists of message containers.

use serde::Serialize;

use crate::header::ByteOrder;
use crate::message::Message;

/// Default number of containers kept per free list.
pub const DEFAULT_POOL_CAPACITY: usize = 64;

/// Source of message containers.
///
/// The receive queue allocates through this trait so that it never owns a
/// pool of its own; the connection layer passes in the shared one.
pub trait MessageAlloc {
    /// Check out a container reset for `cmd` with an aux payload of
    /// `aux_size` bytes, in byte order `order`.
    fn alloc(&mut self, cmd: u32, aux_size: usize, order: ByteOrder) -> Message;

    /// Hand a container back, e.g. one abandoned by a failed frame.
    fn release(&mut self, msg: Message);
}

/// Counters describing pool behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Containers built from scratch because a free list was empty.
    pub created: u64,
    /// Checkouts served from a free list.
    pub reused: u64,
    /// Checkouts whose pooled aux buffer was too small and had to grow.
    pub aux_reallocs: u64,
    /// Containers returned through [`MessagePool::release`].
    pub released: u64,
    /// Releases dropped because the free list was full.
    pub discarded: u64,
}

/// Two free lists of message containers: one for frames without aux
/// payload and one for aux-bearing frames.
///
/// Every checkout resets the container, which zero-fills the extended
/// header and the whole aligned aux region.
#[derive(Debug)]
pub struct MessagePool {
    plain: Vec<Message>,
    aux: Vec<Message>,
    capacity: usize,
    stats: PoolStats,
}

impl MessagePool {
    /// Create an empty pool keeping up to `capacity` containers per list.
    pub fn new(capacity: usize) -> Self {
        Self {
            plain: Vec::new(),
            aux: Vec::new(),
            capacity,
            stats: PoolStats::default(),
        }
    }

    /// Check out a container.
    pub fn checkout(&mut self, cmd: u32, aux_size: usize, order: ByteOrder) -> Message {
        let list = if aux_size > 0 {
            &mut self.aux
        } else {
            &mut self.plain
        };
        match list.pop() {
            Some(mut msg) => {
                self.stats.reused += 1;
                if msg.reset(cmd, aux_size, order) {
                    self.stats.aux_reallocs += 1;
                }
                msg
            }
            None => {
                self.stats.created += 1;
                let mut msg = Message::new(cmd, aux_size);
                msg.reset(cmd, aux_size, order);
                msg
            }
        }
    }

    /// Return a container to the matching free list.
    ///
    /// Circuit references are the connection layer's business and must be
    /// dropped before the container gets here.
    pub fn release(&mut self, mut msg: Message) {
        self.stats.released += 1;
        msg.set_trans(None);
        msg.set_circuit_ref(false);
        let list = if msg.aux_aligned().is_empty() {
            &mut self.plain
        } else {
            &mut self.aux
        };
        if list.len() < self.capacity {
            list.push(msg);
        } else {
            self.stats.discarded += 1;
        }
    }

    /// Containers currently parked on the free lists.
    pub fn pooled(&self) -> usize {
        self.plain.len() + self.aux.len()
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }
}

impl Default for MessagePool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

impl MessageAlloc for MessagePool {
    fn alloc(&mut self, cmd: u32, aux_size: usize, order: ByteOrder) -> Message {
        self.checkout(cmd, aux_size, order)
    }

    fn release(&mut self, msg: Message) {
        MessagePool::release(self, msg);
    }
}
