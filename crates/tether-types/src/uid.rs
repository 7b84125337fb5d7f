//! Correlation identifier generation.

use std::sync::atomic::{AtomicU64, Ordering};

/// Produces correlation ids. One generator never returns the same id twice.
pub trait UidGenerator: Send + Sync {
    fn uid(&self) -> String;
}

impl<F> UidGenerator for F
where
    F: Fn() -> String + Send + Sync,
{
    fn uid(&self) -> String {
        self()
    }
}

/// Default generator: a random per-generator prefix plus a monotonic counter.
///
/// The prefix keeps ids from two links distinguishable in logs; the counter
/// alone guarantees uniqueness within the generator.
#[derive(Debug)]
pub struct SequentialUid {
    prefix: String,
    counter: AtomicU64,
}

impl SequentialUid {
    pub fn new() -> Self {
        let seed = uuid::Uuid::new_v4().simple().to_string();
        Self {
            prefix: seed[..8].to_string(),
            counter: AtomicU64::new(0),
        }
    }
}

impl Default for SequentialUid {
    fn default() -> Self {
        Self::new()
    }
}

impl UidGenerator for SequentialUid {
    fn uid(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{:x}", self.prefix, n)
    }
}
