//! Coordinator half of the verification handshake
//!
//! Sequences ready participants into batches, drives one acoustic emission
//! per batch, and writes verdicts for submitted detections. All waits are
//! bounded: a straggling participant shrinks its batch instead of blocking
//! it, and emission failures are retried a fixed number of times before the
//! attempt is recorded as a terminal failure.

use crate::audio::emitter::{PulseEmitter, ToneSink};
use crate::audio::pattern::{Pattern, Symbol};
use crate::session::batch::{Batch, BatchScheduler, BATCH_DEBOUNCE_MS};
use crate::session::request::{FailureCause, ParticipantRequest, RequestId, RequestStatus};
use crate::session::store::{SharedStore, StoreError};
use crate::session::SessionError;
use crate::verify::Verifier;
use crate::PATTERN_LENGTH;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{sleep, Instant};

/// Cadence of the coordinator's store-polling loop
pub const BATCH_POLL_MS: u64 = 100;

/// How long a batch waits for every member to reach `listening`
pub const HANDSHAKE_TIMEOUT_MS: u64 = 3_000;

/// Poll interval while waiting on the handshake
pub const HANDSHAKE_POLL_MS: u64 = 100;

/// Buffer after the emission window for acoustic transmission latency
pub const TRANSMISSION_BUFFER_MS: u64 = 300;

/// Emission attempts per batch before members are failed
pub const MAX_EMIT_ATTEMPTS: u32 = 3;

/// Capacity of the session event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Round progress notifications for an out-of-process observer (UI, logs)
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A batch was selected and its members moved to `emitting`
    BatchStarted {
        batch_id: u64,
        members: Vec<RequestId>,
    },
    /// The handshake timed out; the batch proceeds without `missing`
    HandshakeShortfall {
        batch_id: u64,
        missing: Vec<RequestId>,
    },
    /// The acoustic emission for a batch finished
    EmissionComplete { batch_id: u64 },
    /// A verdict was written
    Verdict {
        id: RequestId,
        match_count: usize,
        passed: bool,
    },
    /// A request was terminally failed by the coordinator
    RoundFailed { id: RequestId, cause: FailureCause },
}

/// Drives the ready→emitting→listening→submitted→verdict sequence for all
/// participants sharing this emitting device.
pub struct SessionCoordinator<S: SharedStore, K: ToneSink> {
    store: Arc<S>,
    emitter: PulseEmitter<K>,
    scheduler: BatchScheduler,
    verifier: Verifier,
    pattern_length: usize,
    /// Idempotent verification dispatch: ids currently being verified
    verifying: HashSet<RequestId>,
    /// Batch processing is mutually exclusive per emitting device
    processing: bool,
    events: broadcast::Sender<SessionEvent>,
}

impl<S: SharedStore, K: ToneSink> SessionCoordinator<S, K> {
    /// Create a coordinator over a store and an emitter
    pub fn new(store: Arc<S>, emitter: PulseEmitter<K>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            emitter,
            scheduler: BatchScheduler::new(),
            verifier: Verifier::new(),
            pattern_length: PATTERN_LENGTH,
            verifying: HashSet::new(),
            processing: false,
            events,
        }
    }

    /// Override the pattern length (deployment profile)
    pub fn with_pattern_length(mut self, pattern_length: usize) -> Self {
        self.pattern_length = pattern_length;
        self
    }

    /// Subscribe to round progress events
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Run until `shutdown` turns true (or its sender is dropped)
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), SessionError> {
        tracing::info!(pattern_length = self.pattern_length, "coordinator running");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = sleep(Duration::from_millis(BATCH_POLL_MS)) => {
                    self.tick().await?;
                }
            }
        }
        tracing::info!("coordinator stopped");
        Ok(())
    }

    /// One poll cycle: verify pending submissions, then schedule batches
    pub async fn tick(&mut self) -> Result<(), SessionError> {
        self.verify_submissions()?;
        self.run_scheduling_rounds().await?;
        self.verify_submissions()?;
        Ok(())
    }

    /// Schedule and process every currently-ready batch, then re-check for
    /// participants that became ready while processing was underway so a
    /// request arriving mid-emission is never starved.
    async fn run_scheduling_rounds(&mut self) -> Result<(), SessionError> {
        if self.processing {
            return Ok(());
        }
        let any_ready = self
            .store
            .list()?
            .iter()
            .any(|r| r.status == RequestStatus::Ready);
        if !any_ready {
            return Ok(());
        }

        self.processing = true;
        let result = self.drain_ready_batches().await;
        self.processing = false;
        result
    }

    async fn drain_ready_batches(&mut self) -> Result<(), SessionError> {
        // Merge near-simultaneous join bursts into one batch
        sleep(Duration::from_millis(BATCH_DEBOUNCE_MS)).await;

        loop {
            let batches = self.scheduler.group_ready(&self.store.list()?);
            if batches.is_empty() {
                break;
            }
            // Strictly sequential: never two emissions on one device
            for batch in batches {
                self.process_batch(batch).await?;
                self.verify_submissions()?;
            }
        }
        Ok(())
    }

    async fn process_batch(&mut self, batch: Batch) -> Result<(), SessionError> {
        // One fresh pattern per batch: a single emission serves every member
        let pattern = Pattern::generate(self.pattern_length);

        let mut selected: Vec<RequestId> = Vec::new();
        for id in &batch.members {
            let result = self.store.update(id, &mut |r| {
                if r.advance(RequestStatus::Emitting) {
                    r.emitted_pattern = Some(pattern.clone());
                }
            });
            match result {
                Ok(updated)
                    if updated.status == RequestStatus::Emitting
                        && updated.emitted_pattern.as_ref() == Some(&pattern) =>
                {
                    selected.push(id.clone());
                }
                Ok(_) => {}
                // A member deleted mid-selection simply drops out
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        if selected.is_empty() {
            return Ok(());
        }

        tracing::info!(
            batch_id = batch.id,
            members = selected.len(),
            pattern = %pattern,
            "batch selected"
        );
        let _ = self.events.send(SessionEvent::BatchStarted {
            batch_id: batch.id,
            members: selected.clone(),
        });

        // Handshake: wait (bounded) for members to confirm recording
        let deadline = Instant::now() + Duration::from_millis(HANDSHAKE_TIMEOUT_MS);
        let listening = loop {
            // Always a freshly-fetched view, never a stale snapshot
            let records = self.store.list()?;
            let listening: Vec<RequestId> = records
                .iter()
                .filter(|r| selected.contains(&r.id) && r.status == RequestStatus::Listening)
                .map(|r| r.id.clone())
                .collect();
            if listening.len() == selected.len() {
                break listening;
            }
            if Instant::now() >= deadline {
                let missing: Vec<RequestId> = selected
                    .iter()
                    .filter(|id| !listening.contains(id))
                    .cloned()
                    .collect();
                tracing::warn!(
                    batch_id = batch.id,
                    missing = missing.len(),
                    listening = listening.len(),
                    "handshake timeout, proceeding with partial batch"
                );
                let _ = self.events.send(SessionEvent::HandshakeShortfall {
                    batch_id: batch.id,
                    missing,
                });
                break listening;
            }
            sleep(Duration::from_millis(HANDSHAKE_POLL_MS)).await;
        };

        if listening.is_empty() {
            tracing::warn!(batch_id = batch.id, "no member reached listening, skipping emission");
            return Ok(());
        }

        let mut attempt = 1u32;
        loop {
            match self.emitter.emit(&pattern, &batch.config).await {
                Ok(_frequencies) => {
                    let _ = self
                        .events
                        .send(SessionEvent::EmissionComplete { batch_id: batch.id });
                    break;
                }
                Err(e) if attempt < MAX_EMIT_ATTEMPTS => {
                    tracing::warn!(batch_id = batch.id, attempt, error = %e, "emission failed, retrying");
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        batch_id = batch.id,
                        attempts = attempt,
                        error = %e,
                        "emission failed, abandoning batch"
                    );
                    for id in &listening {
                        let updated = self.store.update(id, &mut |r| {
                            if r.advance(RequestStatus::Failed) {
                                r.failure = Some(FailureCause::Emission);
                                r.verified_at = Some(Utc::now());
                            }
                        });
                        if updated.is_ok() {
                            let _ = self.events.send(SessionEvent::RoundFailed {
                                id: id.clone(),
                                cause: FailureCause::Emission,
                            });
                        }
                    }
                    return Ok(());
                }
            }
        }

        // Short buffer for acoustic transmission latency
        sleep(Duration::from_millis(TRANSMISSION_BUFFER_MS)).await;

        // All members that took part move to submitted together
        for id in &listening {
            match self.store.update(id, &mut |r| {
                r.advance(RequestStatus::Submitted);
            }) {
                Ok(_) => {}
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Write verdicts for submitted requests carrying a detected pattern.
    ///
    /// Dispatch is idempotent: an id already being verified is skipped, and
    /// the membership set is cleared on completion.
    fn verify_submissions(&mut self) -> Result<(), SessionError> {
        for record in self.store.list()? {
            if record.status != RequestStatus::Submitted {
                continue;
            }
            let Some(detected) = record.detected_pattern.clone() else {
                continue;
            };
            if !self.verifying.insert(record.id.clone()) {
                continue;
            }

            let verdict = self.verify_one(&record, &detected);
            self.verifying.remove(&record.id);
            verdict?;
        }
        Ok(())
    }

    fn verify_one(
        &mut self,
        record: &ParticipantRequest,
        detected: &[Symbol],
    ) -> Result<(), SessionError> {
        let Some(emitted) = record.emitted_pattern.clone() else {
            tracing::warn!(id = %record.id, "submission without a ground-truth pattern");
            match self.store.update(&record.id, &mut |r| {
                if r.advance(RequestStatus::Failed) {
                    r.failure = Some(FailureCause::NoSignal);
                    r.verified_at = Some(Utc::now());
                }
            }) {
                Ok(_) | Err(StoreError::NotFound(_)) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        };

        let result = self.verifier.compare(&emitted, detected);
        let failure = if result.passed {
            None
        } else if result.match_count == 0 {
            Some(FailureCause::NoSignal)
        } else {
            Some(FailureCause::PartialMatch)
        };

        let next = if result.passed {
            RequestStatus::Verified
        } else {
            RequestStatus::Failed
        };
        match self.store.update(&record.id, &mut |r| {
            if r.advance(next) {
                r.match_count = Some(result.match_count as u32);
                r.passed = Some(result.passed);
                r.failure = failure;
                r.verified_at = Some(Utc::now());
            }
        }) {
            Ok(_) => {
                tracing::info!(
                    id = %record.id,
                    match_count = result.match_count,
                    passed = result.passed,
                    "verdict written"
                );
                let _ = self.events.send(SessionEvent::Verdict {
                    id: record.id.clone(),
                    match_count: result.match_count,
                    passed: result.passed,
                });
                Ok(())
            }
            // Deleted while verifying: the participant side resets itself
            Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
