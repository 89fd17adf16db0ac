//! Version ledger.
//!
//! A monotonic counter owned by one reconciler instance. It starts at 0 every
//! time the service starts and is never read back from storage; versions only
//! drive the staleness check, not data correctness.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct VersionLedger {
    version: AtomicU64,
}

impl VersionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn starting_at(version: u64) -> Self {
        Self {
            version: AtomicU64::new(version),
        }
    }

    pub fn current(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Atomically increment and return the new version.
    pub fn advance(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// How far `claimed` trails the current version (0 when it is current or ahead).
    pub fn lag(&self, claimed: u64) -> u64 {
        self.current().saturating_sub(claimed)
    }
}
