//! Outbound mutation queue.
//!
//! FIFO of mutations waiting to be handed to the transport. Local edits
//! are appended in the order they were applied, so the server sees them
//! in that order too. A set or delete that hits the same key as the
//! unsent tail replaces it.

use std::collections::VecDeque;

use crate::object::MutationPayload;
use crate::op::OutboundMutation;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    /// Replaced the tail entry with this local sequence number.
    Coalesced(u64),
    Full,
}

#[derive(Debug, Clone)]
pub struct MutationQueue {
    queue: VecDeque<OutboundMutation>,
    max_size: usize,
    coalesce: bool,
}

impl MutationQueue {
    pub fn new(max_size: usize, coalesce: bool) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
            coalesce,
        }
    }

    pub fn enqueue(&mut self, outbound: OutboundMutation) -> Enqueued {
        if self.coalesce {
            if let Some(tail) = self.queue.back_mut() {
                if same_key(tail, &outbound) {
                    let replaced = tail.mutation.local_sequence;
                    *tail = outbound;
                    return Enqueued::Coalesced(replaced);
                }
            }
        }
        if self.queue.len() >= self.max_size {
            return Enqueued::Full;
        }
        self.push(outbound);
        Enqueued::Queued
    }

    /// Append without coalescing or size checks. Used when resubmitting
    /// mutations that are already applied locally.
    pub(crate) fn push(&mut self, outbound: OutboundMutation) {
        self.queue.push_back(outbound);
    }

    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.max_size
    }

    pub fn drain(&mut self) -> Vec<OutboundMutation> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

fn same_key(a: &OutboundMutation, b: &OutboundMutation) -> bool {
    if a.mutation.target != b.mutation.target {
        return false;
    }
    let key = |payload: &MutationPayload| match payload {
        MutationPayload::MapSet { key, .. } | MutationPayload::MapDelete { key } => {
            Some(key.clone())
        }
        _ => None,
    };
    match (key(&a.mutation.payload), key(&b.mutation.payload)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}
