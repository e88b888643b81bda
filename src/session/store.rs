//! Shared state store seam and in-memory implementation
//!
//! The coordinator and participants communicate only through writes and
//! subscriptions on ParticipantRequest records; no direct channel exists
//! between devices. The trait models a document-oriented key-value store
//! with per-record subscriptions: a subscriber sees the current value
//! immediately, every subsequent change in full, and `None` on deletion.
//!
//! Write failures always surface to the caller so it can decide whether to
//! retry or abort the round.

use crate::session::request::{ParticipantRequest, RequestId};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::watch;

/// Errors from shared-store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("request not found: {0}")]
    NotFound(RequestId),

    #[error("request already exists: {0}")]
    AlreadyExists(RequestId),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Document-oriented store of participant requests.
///
/// Implementations must deliver the current record immediately on
/// subscribe, the full record on every change, and `None` when the record
/// is deleted.
pub trait SharedStore: Send + Sync + 'static {
    /// Insert a fresh record
    fn create(&self, record: ParticipantRequest) -> Result<(), StoreError>;

    /// Mutate an existing record in place and return the updated copy
    fn update(
        &self,
        id: &str,
        mutate: &mut dyn FnMut(&mut ParticipantRequest),
    ) -> Result<ParticipantRequest, StoreError>;

    /// Remove a record. Subscribers observe `None`.
    fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// Fetch a record by id
    fn get(&self, id: &str) -> Result<Option<ParticipantRequest>, StoreError>;

    /// Fetch all current records
    fn list(&self) -> Result<Vec<ParticipantRequest>, StoreError>;

    /// Subscribe to one record's changes
    fn subscribe(&self, id: &str) -> watch::Receiver<Option<ParticipantRequest>>;
}

struct Inner {
    records: HashMap<RequestId, ParticipantRequest>,
    /// Channels outlive their records so deletion delivers `None` and a
    /// later re-create is observed on the same receiver
    channels: HashMap<RequestId, watch::Sender<Option<ParticipantRequest>>>,
}

/// In-process reference implementation of [`SharedStore`].
///
/// Used by tests and the demo binary; a networked deployment plugs its own
/// transport in behind the same trait.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                records: HashMap::new(),
                channels: HashMap::new(),
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn notify(&mut self, id: &str, value: Option<ParticipantRequest>) {
        if let Some(tx) = self.channels.get(id) {
            // send_replace updates the stored value even with no receiver
            // alive, so a later subscriber never observes a stale record
            tx.send_replace(value);
        }
    }
}

impl SharedStore for MemoryStore {
    fn create(&self, record: ParticipantRequest) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.records.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id));
        }
        let id = record.id.clone();
        inner.records.insert(id.clone(), record.clone());
        inner.notify(&id, Some(record));
        Ok(())
    }

    fn update(
        &self,
        id: &str,
        mutate: &mut dyn FnMut(&mut ParticipantRequest),
    ) -> Result<ParticipantRequest, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        mutate(record);
        let updated = record.clone();
        inner.notify(id, Some(updated.clone()));
        Ok(updated)
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.records.remove(id).is_none() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        inner.notify(id, None);
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<ParticipantRequest>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.records.get(id).cloned())
    }

    fn list(&self) -> Result<Vec<ParticipantRequest>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.records.values().cloned().collect())
    }

    fn subscribe(&self, id: &str) -> watch::Receiver<Option<ParticipantRequest>> {
        let mut inner = self.inner.lock().unwrap();
        let current = inner.records.get(id).cloned();
        inner
            .channels
            .entry(id.to_string())
            .or_insert_with(|| watch::channel(current).0)
            .subscribe()
    }
}
