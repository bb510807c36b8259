//! Ordering buffer for requests waiting on an in-flight ordered request

use std::collections::VecDeque;

use crate::types::{Request, Sequence};

/// Requests deferred because an ordered request is still outstanding
///
/// Kept sorted by sequence number ascending; sequence numbers are unique.
#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: VecDeque<Request>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert at the sorted position for the request's sequence
    ///
    /// Returns the request back if an entry with the same sequence is
    /// already queued.
    pub fn insert(&mut self, request: Request) -> Result<(), Request> {
        match self.entries.binary_search_by_key(&request.seq(), Request::seq) {
            Ok(_) => Err(request),
            Err(pos) => {
                self.entries.insert(pos, request);
                Ok(())
            }
        }
    }

    pub fn remove(&mut self, seq: Sequence) -> Option<Request> {
        let pos = self
            .entries
            .binary_search_by_key(&seq, Request::seq)
            .ok()?;
        self.entries.remove(pos)
    }

    pub fn contains(&self, seq: Sequence) -> bool {
        self.entries
            .binary_search_by_key(&seq, Request::seq)
            .is_ok()
    }

    /// Take the lowest-sequence entry
    pub fn pop_front(&mut self) -> Option<Request> {
        self.entries.pop_front()
    }

    pub fn clear(&mut self) -> Vec<Request> {
        self.entries.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
