//! Circuit set.
//!
//! Circuit zero is implicit and always present. Other circuits are attached
//! explicitly and live while they hold references or open transactions.

use std::collections::HashMap;

use dmsgprims_frame::IoqError;
use tracing::debug;

use crate::state::StateTable;

/// A non-zero circuit.
#[derive(Debug, Default)]
pub struct Circuit {
    refs: u32,
    table: StateTable,
}

impl Circuit {
    pub fn refs(&self) -> u32 {
        self.refs
    }

    pub fn table(&self) -> &StateTable {
        &self.table
    }
}

#[derive(Debug, Default)]
pub struct CircuitSet {
    zero: StateTable,
    others: HashMap<u64, Circuit>,
}

impl CircuitSet {
    /// Attach circuit `id`, or take another reference if it exists.
    ///
    /// Circuit zero cannot be attached; returns `false` for it.
    pub fn attach(&mut self, id: u64) -> bool {
        if id == 0 {
            return false;
        }
        let circuit = self.others.entry(id).or_default();
        circuit.refs += 1;
        debug!(circuit = id, refs = circuit.refs, "circuit attached");
        true
    }

    /// Drop one attachment reference. Returns `false` if `id` is unknown.
    pub fn detach(&mut self, id: u64) -> bool {
        if !self.others.contains_key(&id) {
            return false;
        }
        self.release_ref(id);
        true
    }

    /// Resolve `id` for a message, taking a reference on non-zero circuits.
    ///
    /// Returns whether a reference was taken.
    pub fn acquire(&mut self, id: u64) -> Result<bool, IoqError> {
        if id == 0 {
            return Ok(false);
        }
        match self.others.get_mut(&id) {
            Some(circuit) => {
                circuit.refs += 1;
                Ok(true)
            }
            None => Err(IoqError::BadCircuit),
        }
    }

    /// Drop a reference taken by [`acquire`](Self::acquire) or
    /// [`attach`](Self::attach).
    pub fn release_ref(&mut self, id: u64) {
        if let Some(circuit) = self.others.get_mut(&id) {
            circuit.refs = circuit.refs.saturating_sub(1);
        }
        self.maybe_teardown(id);
    }

    /// Remove circuit `id` once it has no references and no transactions.
    pub fn maybe_teardown(&mut self, id: u64) {
        let idle = self
            .others
            .get(&id)
            .is_some_and(|c| c.refs == 0 && c.table.is_empty());
        if idle {
            self.others.remove(&id);
            debug!(circuit = id, "circuit torn down");
        }
    }

    pub fn contains(&self, id: u64) -> bool {
        id == 0 || self.others.contains_key(&id)
    }

    pub fn get(&self, id: u64) -> Option<&Circuit> {
        self.others.get(&id)
    }

    pub fn table(&self, id: u64) -> Option<&StateTable> {
        if id == 0 {
            Some(&self.zero)
        } else {
            self.others.get(&id).map(|c| &c.table)
        }
    }

    pub fn table_mut(&mut self, id: u64) -> Option<&mut StateTable> {
        if id == 0 {
            Some(&mut self.zero)
        } else {
            self.others.get_mut(&id).map(|c| &mut c.table)
        }
    }

    /// Circuit ids, circuit zero first and the rest ascending.
    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.others.keys().copied().collect();
        ids.sort_unstable();
        ids.insert(0, 0);
        ids
    }

    /// Open transactions across every circuit.
    pub fn transactions(&self) -> usize {
        self.zero.len() + self.others.values().map(|c| c.table.len()).sum::<usize>()
    }
}
