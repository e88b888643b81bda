//! Multi-participant handshake and batching over the shared state store
//!
//! This module contains everything above the acoustic layer:
//! - Participant request records and the persisted schema ([`request`])
//! - The shared-store seam and its in-memory implementation ([`store`])
//! - Debounced grouping of ready participants ([`batch`])
//! - The coordinator half of the handshake ([`coordinator`])
//! - The participant half of the handshake ([`participant`])

pub mod batch;
pub mod coordinator;
pub mod participant;
pub mod request;
pub mod store;

use crate::audio::engine::AudioEngineError;
use store::StoreError;
use thiserror::Error;

/// Errors surfaced by the coordinator and participant state machines
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("audio error: {0}")]
    Audio(#[from] AudioEngineError),
}
