//! Grouping of ready participants into emission batches
//!
//! Participants that want a round at the same time and share an exact
//! EmitterConfig are served by one acoustic emission. Grouping is pure and
//! synchronous; the coordinator drives the debounce window and the strictly
//! sequential processing around it.

use crate::session::request::{ConfigKey, EmitterConfig, ParticipantRequest, RequestId, RequestStatus};
use std::collections::HashMap;

/// Debounce window before a scheduling round, so near-simultaneous join
/// bursts merge into one batch instead of many singletons
pub const BATCH_DEBOUNCE_MS: u64 = 200;

/// A transient group of requests served by one emission. Never persisted.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Fresh id for logging and event correlation
    pub id: u64,
    /// The emission parameters every member agreed on
    pub config: EmitterConfig,
    /// Member request ids, in creation order
    pub members: Vec<RequestId>,
}

/// Groups ready participants by exact config equality and hands out fresh
/// batch ids
#[derive(Debug)]
pub struct BatchScheduler {
    next_batch_id: u64,
}

impl BatchScheduler {
    pub fn new() -> Self {
        Self { next_batch_id: 1 }
    }

    /// Group every `ready` request into batches.
    ///
    /// Two requests land in the same batch iff their configs match exactly;
    /// batches come out ordered by their earliest member's creation time.
    pub fn group_ready(&mut self, requests: &[ParticipantRequest]) -> Vec<Batch> {
        let mut ready: Vec<&ParticipantRequest> = requests
            .iter()
            .filter(|r| r.status == RequestStatus::Ready)
            .collect();
        ready.sort_by_key(|r| r.created_at);

        let mut batches: Vec<Batch> = Vec::new();
        let mut index: HashMap<ConfigKey, usize> = HashMap::new();

        for request in ready {
            match index.entry(request.config.grouping_key()) {
                std::collections::hash_map::Entry::Occupied(entry) => {
                    batches[*entry.get()].members.push(request.id.clone());
                }
                std::collections::hash_map::Entry::Vacant(entry) => {
                    entry.insert(batches.len());
                    batches.push(Batch {
                        id: self.next_batch_id,
                        config: request.config.clone(),
                        members: vec![request.id.clone()],
                    });
                    self.next_batch_id += 1;
                }
            }
        }

        if !batches.is_empty() {
            tracing::debug!(
                batches = batches.len(),
                members = batches.iter().map(|b| b.members.len()).sum::<usize>(),
                "grouped ready participants"
            );
        }
        batches
    }
}

impl Default for BatchScheduler {
    fn default() -> Self {
        Self::new()
    }
}
