//! Per-session sequence number allocation

use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::Sequence;

/// Allocates unique, strictly increasing sequence numbers for one session
///
/// The counter starts at a random 16-bit value shifted into the top bits, so
/// sessions recreated after a management server restart land in a different
/// range than answers still in flight from the previous incarnation.
#[derive(Debug)]
pub struct SequenceAllocator {
    next: AtomicU64,
}

impl SequenceAllocator {
    pub fn new() -> Self {
        Self::with_seed(rand::random::<u16>())
    }

    pub fn with_seed(seed: u16) -> Self {
        Self {
            next: AtomicU64::new(u64::from(seed) << 48),
        }
    }

    /// Get the next sequence number
    pub fn next_sequence(&self) -> Sequence {
        self.next.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Last value handed out (or the seed if none yet)
    pub fn current(&self) -> Sequence {
        self.next.load(Ordering::SeqCst)
    }
}

impl Default for SequenceAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_seed_occupies_top_bits() {
        let alloc = SequenceAllocator::with_seed(0xabcd);
        assert_eq!(alloc.current(), 0xabcd_u64 << 48);
        assert_eq!(alloc.next_sequence(), (0xabcd_u64 << 48) + 1);
        assert_eq!(alloc.next_sequence(), (0xabcd_u64 << 48) + 2);
    }

    #[test]
    fn test_strictly_increasing() {
        let alloc = SequenceAllocator::new();
        let mut last = alloc.current();
        for _ in 0..1000 {
            let seq = alloc.next_sequence();
            assert!(seq > last);
            last = seq;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_unique_under_concurrency() {
        let alloc = Arc::new(SequenceAllocator::new());
        let mut handles = Vec::new();

        for _ in 0..8 {
            let alloc = Arc::clone(&alloc);
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::with_capacity(500);
                let mut last = 0;
                for _ in 0..500 {
                    let seq = alloc.next_sequence();
                    // Each caller observes its own values increasing
                    assert!(seq > last);
                    last = seq;
                    seen.push(seq);
                }
                seen
            }));
        }

        let mut all = HashSet::new();
        for handle in handles {
            for seq in handle.await.unwrap() {
                assert!(all.insert(seq), "duplicate sequence {seq}");
            }
        }
        assert_eq!(all.len(), 4000);
    }
}
