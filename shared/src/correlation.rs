//! Correlation table for outstanding requests.
//!
//! Each entry is destroyed exactly once: by the matching response, by its
//! deadline passing, or by the connection being lost. The caller-side token
//! `T` is handed back on every path so the caller always learns the outcome.

use crate::protocol::Opcode;
use std::collections::HashMap;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("request timed out")]
    Timeout,
    #[error("connection lost before a response arrived")]
    ConnectionLost,
}

#[derive(Debug)]
struct PendingRequest<T> {
    opcode: Opcode,
    deadline: Instant,
    token: T,
}

#[derive(Debug)]
pub struct PendingRequests<T> {
    entries: HashMap<u32, PendingRequest<T>>,
    next_correlation_id: u32,
}

impl<T> Default for PendingRequests<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingRequests<T> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_correlation_id: 1,
        }
    }

    /// Records a new outstanding request and returns its correlation id.
    pub fn insert(&mut self, opcode: Opcode, token: T, deadline: Instant) -> u32 {
        let correlation_id = self.next_correlation_id;
        // Zero is never handed out.
        self.next_correlation_id = self.next_correlation_id.wrapping_add(1).max(1);

        self.entries.insert(
            correlation_id,
            PendingRequest {
                opcode,
                deadline,
                token,
            },
        );
        correlation_id
    }

    /// Claims the entry for a response. A duplicate or unsolicited response
    /// returns `None` and must be dropped by the caller.
    pub fn fulfill(&mut self, correlation_id: u32) -> Option<(Opcode, T)> {
        self.entries
            .remove(&correlation_id)
            .map(|entry| (entry.opcode, entry.token))
    }

    /// Removes and returns every entry whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<(Opcode, T)> {
        let expired: Vec<u32> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.fulfill(id))
            .collect()
    }

    /// Connection loss: every outstanding request fails.
    pub fn fail_all(&mut self) -> Vec<(Opcode, T)> {
        self.entries
            .drain()
            .map(|(_, entry)| (entry.opcode, entry.token))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
