//! Work flags shared between the core loop and submission handles.
//!
//! Anything that hands the core loop work sets the matching bit; the loop
//! only blocks in `poll(2)` while no work bit is set.

use std::sync::atomic::{AtomicU32, Ordering};

/// Outbound messages are queued.
pub const WWORK: u32 = 0x0001;
/// The stream may have readable bytes.
pub const RWORK: u32 = 0x0002;
/// The signal callback was requested.
pub const SWORK: u32 = 0x0004;
/// The alt channel callback should run.
pub const ALTWORK: u32 = 0x0008;
/// Shutdown was requested.
pub const SHUTDOWN: u32 = 0x0010;
/// The core loop has finished (status, not work).
pub const EOF: u32 = 0x0100;

/// Bits that keep the core loop from blocking.
pub const WORK_MASK: u32 = WWORK | RWORK | SWORK | ALTWORK | SHUTDOWN;

#[derive(Debug, Default)]
pub struct WorkFlags(AtomicU32);

impl WorkFlags {
    pub fn new(initial: u32) -> Self {
        Self(AtomicU32::new(initial))
    }

    pub fn set(&self, bits: u32) {
        self.0.fetch_or(bits, Ordering::AcqRel);
    }

    /// Clear and return all pending work bits.
    pub fn take_work(&self) -> u32 {
        self.0.fetch_and(!WORK_MASK, Ordering::AcqRel) & WORK_MASK
    }

    pub fn has_work(&self) -> bool {
        self.0.load(Ordering::Acquire) & WORK_MASK != 0
    }

    pub fn contains(&self, bits: u32) -> bool {
        self.0.load(Ordering::Acquire) & bits == bits
    }
}
