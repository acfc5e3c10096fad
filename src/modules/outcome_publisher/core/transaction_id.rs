// Process unique suffixes for transactional ids.
//
// The broker treats a transactional id as a session key: two live producers sharing one fence
// each other. Every handle therefore gets `<base>-<n>` with `n` never reused by this process.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct TransactionIdAllocator {
    next: AtomicU64,
}

impl TransactionIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Strictly increasing, starting at 1.
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn transactional_id(&self, base: &str) -> String {
        format!("{base}-{}", self.next())
    }
}
