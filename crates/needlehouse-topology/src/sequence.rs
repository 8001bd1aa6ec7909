//! Needle-id sequencing.
//!
//! The master hands every stored object a cluster-unique 64-bit id. The
//! trait is async because the production implementation reserves ranges
//! through the replicated log; [`MemorySequencer`] backs tests and
//! single-node setups where durability comes from elsewhere.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::error::Result;

/// Allocates contiguous, never-reused id ranges.
#[async_trait]
pub trait Sequencer: Send + Sync {
    /// Reserve `count` ids; returns the first id of the range
    /// `[first, first + count)`.
    async fn next_batch(&self, count: u64) -> Result<u64>;

    /// Highest id handed out so far.
    async fn peek(&self) -> u64;
}

/// Atomic counter sequencer with no persistence.
#[derive(Debug, Default)]
pub struct MemorySequencer {
    counter: AtomicU64,
}

impl MemorySequencer {
    pub fn new(start: u64) -> Self {
        Self {
            counter: AtomicU64::new(start),
        }
    }
}

#[async_trait]
impl Sequencer for MemorySequencer {
    async fn next_batch(&self, count: u64) -> Result<u64> {
        Ok(self.counter.fetch_add(count, Ordering::SeqCst) + 1)
    }

    async fn peek(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_batches_never_overlap() {
        let seq = MemorySequencer::new(0);
        let a = seq.next_batch(3).await.unwrap();
        let b = seq.next_batch(1).await.unwrap();
        let c = seq.next_batch(10).await.unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 4);
        assert_eq!(c, 5);
        assert_eq!(seq.peek().await, 14);
    }

    #[tokio::test]
    async fn test_starts_after_seed() {
        let seq = MemorySequencer::new(100);
        assert_eq!(seq.next_batch(1).await.unwrap(), 101);
    }
}
