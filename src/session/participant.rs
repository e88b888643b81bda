//! Participant half of the verification handshake
//!
//! A participant joins the shared store, signals readiness, and reacts to
//! coordinator-driven status changes on its own record. The microphone is
//! acquired only once the coordinator signals `emitting` (never earlier, to
//! avoid capturing ambient pre-roll and wasting battery), and every wait is
//! bounded: a missing verdict restarts the round up to a retry cap, and a
//! deleted record resets the participant to idle from any state.

use crate::audio::detector::{decoded_symbols, CaptureSession, CaptureSource};
use crate::session::request::{
    EmitterConfig, FailureCause, ParticipantRequest, RequestId, RequestStatus,
};
use crate::session::store::{SharedStore, StoreError};
use crate::session::SessionError;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// How long to wait after submitting (or while mid-round) for the
/// coordinator to respond before restarting the round
pub const RESPONSE_TIMEOUT_MS: u64 = 5_000;

/// How long a participant may sit in `ready` before surfacing an error
/// state for manual retry
pub const READY_STUCK_TIMEOUT_MS: u64 = 30_000;

/// Round restarts before the attempt is recorded as a terminal failure
pub const MAX_ROUND_RETRIES: u32 = 3;

/// How a participant's run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticipantOutcome {
    /// The coordinator verified the detected pattern
    Verified { match_count: usize },
    /// The round ended in a terminal failure
    Failed {
        match_count: Option<u32>,
        cause: Option<FailureCause>,
    },
    /// The record disappeared from the store (external session end);
    /// the participant is back at idle with all audio released
    Reset,
    /// Stuck in `ready` past the stuck timeout; manual retry advised
    Stuck,
}

/// Per-participant state machine over the shared store.
///
/// Owns the `detected_pattern` field of its record and its own readiness
/// signal; all other status movement comes from the coordinator.
pub struct Participant<S: SharedStore, C: CaptureSource> {
    store: Arc<S>,
    capture: C,
    id: RequestId,
    config: EmitterConfig,
    session: Option<C::Session>,
    /// Duplicate submissions for the same request are suppressed
    submitted_once: bool,
    retries: u32,
    deadline: Option<Instant>,
}

impl<S: SharedStore, C: CaptureSource> Participant<S, C> {
    pub fn new(store: Arc<S>, capture: C, id: impl Into<RequestId>, config: EmitterConfig) -> Self {
        Self {
            store,
            capture,
            id: id.into(),
            config,
            session: None,
            submitted_once: false,
            retries: 0,
            deadline: None,
        }
    }

    /// Run one verification flow to a terminal outcome.
    ///
    /// Creates the request record if absent, signals readiness, and then
    /// follows the coordinator through the handshake.
    pub async fn run(mut self) -> Result<ParticipantOutcome, SessionError> {
        if self.store.get(&self.id)?.is_none() {
            self.store
                .create(ParticipantRequest::new(self.id.clone(), self.config.clone()))?;
        }
        let mut changes = self.store.subscribe(&self.id);
        tracing::info!(id = %self.id, "participant joined");

        loop {
            let current = changes.borrow_and_update().clone();
            if let Some(outcome) = self.handle_record(current)? {
                self.release_audio();
                return Ok(outcome);
            }

            let deadline = self.deadline;
            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        // The store side is gone entirely
                        self.release_audio();
                        return Ok(ParticipantOutcome::Reset);
                    }
                }
                _ = wait_deadline(deadline) => {
                    if let Some(outcome) = self.handle_deadline()? {
                        self.release_audio();
                        return Ok(outcome);
                    }
                }
            }
        }
    }

    /// React to the freshly-observed record state
    fn handle_record(
        &mut self,
        current: Option<ParticipantRequest>,
    ) -> Result<Option<ParticipantOutcome>, SessionError> {
        let Some(record) = current else {
            tracing::info!(id = %self.id, "request removed externally, resetting to idle");
            return Ok(Some(ParticipantOutcome::Reset));
        };

        match record.status {
            RequestStatus::Waiting => {
                // Running is the request for a round: signal readiness now
                match self.store.update(&self.id, &mut |r| {
                    r.advance(RequestStatus::Ready);
                }) {
                    Ok(_) => {}
                    // Deleted between observation and write: reset
                    Err(StoreError::NotFound(_)) => return Ok(Some(ParticipantOutcome::Reset)),
                    Err(e) => return Err(e.into()),
                }
                self.deadline = Some(Instant::now() + Duration::from_millis(READY_STUCK_TIMEOUT_MS));
                Ok(None)
            }
            RequestStatus::Ready => Ok(None),
            RequestStatus::Emitting => {
                if self.session.is_none() {
                    let mut session = match self.capture.open(&record.config) {
                        Ok(session) => session,
                        Err(e) => {
                            tracing::error!(id = %self.id, error = %e, "microphone acquisition failed");
                            let _ = self.store.update(&self.id, &mut |r| {
                                if r.advance(RequestStatus::Failed) {
                                    r.failure = Some(FailureCause::Hardware);
                                    r.verified_at = Some(Utc::now());
                                }
                            });
                            return Err(e.into());
                        }
                    };
                    // Discard ambient pre-roll captured before the emission
                    session.clear();
                    self.session = Some(session);
                    match self.store.update(&self.id, &mut |r| {
                        r.advance(RequestStatus::Listening);
                    }) {
                        Ok(_) => {}
                        Err(StoreError::NotFound(_)) => {
                            return Ok(Some(ParticipantOutcome::Reset))
                        }
                        Err(e) => return Err(e.into()),
                    }
                    self.deadline =
                        Some(Instant::now() + Duration::from_millis(RESPONSE_TIMEOUT_MS));
                }
                Ok(None)
            }
            RequestStatus::Listening => Ok(None),
            RequestStatus::Submitted => {
                if !self.submitted_once {
                    self.submitted_once = true;
                    let peaks = self
                        .session
                        .take()
                        .map(|mut session| session.stop_and_analyze())
                        .unwrap_or_default();
                    let symbols = decoded_symbols(&peaks);
                    tracing::info!(
                        id = %self.id,
                        detected = symbols.len(),
                        "recording analyzed, submitting detected pattern"
                    );
                    match self.store.update(&self.id, &mut |r| {
                        r.detected_pattern = Some(symbols.clone());
                    }) {
                        Ok(_) => {}
                        Err(StoreError::NotFound(_)) => {
                            return Ok(Some(ParticipantOutcome::Reset))
                        }
                        Err(e) => return Err(e.into()),
                    }
                    self.deadline =
                        Some(Instant::now() + Duration::from_millis(RESPONSE_TIMEOUT_MS));
                }
                Ok(None)
            }
            RequestStatus::Verified => Ok(Some(ParticipantOutcome::Verified {
                match_count: record.match_count.unwrap_or(0) as usize,
            })),
            RequestStatus::Failed => Ok(Some(ParticipantOutcome::Failed {
                match_count: record.match_count,
                cause: record.failure,
            })),
        }
    }

    /// A phase deadline expired: restart or fail the round
    fn handle_deadline(&mut self) -> Result<Option<ParticipantOutcome>, SessionError> {
        self.deadline = None;
        let Some(record) = self.store.get(&self.id)? else {
            return Ok(Some(ParticipantOutcome::Reset));
        };

        match record.status {
            RequestStatus::Ready => {
                tracing::error!(id = %self.id, "stuck in ready, surfacing for manual retry");
                Ok(Some(ParticipantOutcome::Stuck))
            }
            RequestStatus::Emitting | RequestStatus::Listening | RequestStatus::Submitted => {
                self.retries += 1;
                self.release_audio();
                self.submitted_once = false;

                if self.retries >= MAX_ROUND_RETRIES {
                    tracing::error!(
                        id = %self.id,
                        retries = self.retries,
                        "no response after retry cap, recording terminal failure"
                    );
                    match self.store.update(&self.id, &mut |r| {
                        if r.advance(RequestStatus::Failed) {
                            r.failure = Some(FailureCause::Timeout);
                            r.verified_at = Some(Utc::now());
                        }
                    }) {
                        Ok(_) | Err(StoreError::NotFound(_)) => {}
                        Err(e) => return Err(e.into()),
                    }
                    Ok(Some(ParticipantOutcome::Failed {
                        match_count: None,
                        cause: Some(FailureCause::Timeout),
                    }))
                } else {
                    tracing::warn!(id = %self.id, retry = self.retries, "round timed out, restarting");
                    match self.store.update(&self.id, &mut |r| r.reset_for_retry()) {
                        Ok(_) => Ok(None),
                        Err(StoreError::NotFound(_)) => Ok(Some(ParticipantOutcome::Reset)),
                        Err(e) => Err(e.into()),
                    }
                }
            }
            _ => Ok(None),
        }
    }

    /// Release the recording device and any analysis resources
    fn release_audio(&mut self) {
        if self.session.take().is_some() {
            tracing::debug!(id = %self.id, "recording released");
        }
    }
}

/// Pending forever when no deadline is armed
async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(instant) => tokio::time::sleep_until(instant).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::detector::{DetectedPeak, DetectorDiagnostics};
    use crate::audio::engine::AudioEngineError;
    use crate::audio::pattern::{Pattern, Symbol};
    use crate::session::store::MemoryStore;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::sleep;

    struct FakeCapture {
        peaks: Vec<DetectedPeak>,
        fail_open: bool,
        opened: Arc<AtomicUsize>,
        cleared: Arc<AtomicBool>,
    }

    impl FakeCapture {
        fn new(symbols: &[Symbol]) -> Self {
            let peaks = symbols
                .iter()
                .enumerate()
                .map(|(i, &symbol)| DetectedPeak {
                    frequency_hz: 19_000.0,
                    amplitude_db: 40.0,
                    timestamp_ms: i as f64 * 300.0,
                    symbol,
                    snr_db: 30.0,
                })
                .collect();
            Self {
                peaks,
                fail_open: false,
                opened: Arc::new(AtomicUsize::new(0)),
                cleared: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    struct FakeSession {
        peaks: Vec<DetectedPeak>,
        cleared: Arc<AtomicBool>,
    }

    impl CaptureSource for FakeCapture {
        type Session = FakeSession;

        fn open(&mut self, _config: &EmitterConfig) -> Result<FakeSession, AudioEngineError> {
            if self.fail_open {
                return Err(AudioEngineError::NoInputDevice);
            }
            self.opened.fetch_add(1, Ordering::Relaxed);
            Ok(FakeSession {
                peaks: self.peaks.clone(),
                cleared: Arc::clone(&self.cleared),
            })
        }
    }

    impl CaptureSession for FakeSession {
        fn clear(&mut self) {
            self.cleared.store(true, Ordering::Relaxed);
        }

        fn stop_and_analyze(&mut self) -> Vec<DetectedPeak> {
            std::mem::take(&mut self.peaks)
        }

        fn diagnostics(&self) -> DetectorDiagnostics {
            DetectorDiagnostics {
                peaks: self.peaks.clone(),
                noise_floor_db: -80.0,
            }
        }
    }

    async fn wait_for_status(store: &MemoryStore, id: &str, status: RequestStatus) {
        for _ in 0..200 {
            if let Some(r) = store.get(id).unwrap() {
                if r.status == status {
                    return;
                }
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("request {id} never reached {status:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_joins_and_signals_ready() {
        let store = Arc::new(MemoryStore::new());
        let participant = Participant::new(
            Arc::clone(&store),
            FakeCapture::new(&[]),
            "p1",
            EmitterConfig::default(),
        );
        let handle = tokio::spawn(participant.run());

        wait_for_status(&store, "p1", RequestStatus::Ready).await;

        // External session end resets the participant to idle
        store.delete("p1").unwrap();
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome, ParticipantOutcome::Reset);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_round_to_verified() {
        let store = Arc::new(MemoryStore::new());
        let pattern = Pattern::from_symbols(vec![Symbol::High, Symbol::Low, Symbol::High]);
        let capture = FakeCapture::new(pattern.symbols());
        let cleared = Arc::clone(&capture.cleared);
        let opened = Arc::clone(&capture.opened);

        let participant = Participant::new(
            Arc::clone(&store),
            capture,
            "p1",
            EmitterConfig::default(),
        );
        let handle = tokio::spawn(participant.run());

        wait_for_status(&store, "p1", RequestStatus::Ready).await;
        assert_eq!(
            opened.load(Ordering::Relaxed),
            0,
            "the microphone must not be acquired before the emitting signal"
        );

        // Coordinator side: select into a batch
        let emitted = pattern.clone();
        store
            .update("p1", &mut |r| {
                if r.advance(RequestStatus::Emitting) {
                    r.emitted_pattern = Some(emitted.clone());
                }
            })
            .unwrap();

        wait_for_status(&store, "p1", RequestStatus::Listening).await;
        assert_eq!(opened.load(Ordering::Relaxed), 1);
        assert!(
            cleared.load(Ordering::Relaxed),
            "pre-roll peaks must be cleared before signalling listening"
        );

        // Coordinator side: emission done, collect submissions
        store
            .update("p1", &mut |r| {
                r.advance(RequestStatus::Submitted);
            })
            .unwrap();

        // Participant writes its detection exactly once
        for _ in 0..200 {
            if store
                .get("p1")
                .unwrap()
                .unwrap()
                .detected_pattern
                .is_some()
            {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        let record = store.get("p1").unwrap().unwrap();
        assert_eq!(
            record.detected_pattern.as_deref(),
            Some(pattern.symbols()),
            "detected pattern must reflect the analyzed peaks"
        );

        // Coordinator side: verdict
        store
            .update("p1", &mut |r| {
                if r.advance(RequestStatus::Verified) {
                    r.match_count = Some(3);
                    r.passed = Some(true);
                }
            })
            .unwrap();

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome, ParticipantOutcome::Verified { match_count: 3 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_deletion_resets_from_mid_round() {
        let store = Arc::new(MemoryStore::new());
        let participant = Participant::new(
            Arc::clone(&store),
            FakeCapture::new(&[Symbol::High]),
            "p1",
            EmitterConfig::default(),
        );
        let handle = tokio::spawn(participant.run());

        wait_for_status(&store, "p1", RequestStatus::Ready).await;
        store
            .update("p1", &mut |r| {
                if r.advance(RequestStatus::Emitting) {
                    r.emitted_pattern = Some(Pattern::generate(6));
                }
            })
            .unwrap();
        wait_for_status(&store, "p1", RequestStatus::Listening).await;

        store.delete("p1").unwrap();
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            ParticipantOutcome::Reset,
            "a deleted record must reset the participant regardless of state"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hardware_failure_is_fatal() {
        let store = Arc::new(MemoryStore::new());
        let mut capture = FakeCapture::new(&[]);
        capture.fail_open = true;

        let participant = Participant::new(
            Arc::clone(&store),
            capture,
            "p1",
            EmitterConfig::default(),
        );
        let handle = tokio::spawn(participant.run());

        wait_for_status(&store, "p1", RequestStatus::Ready).await;
        store
            .update("p1", &mut |r| {
                r.advance(RequestStatus::Emitting);
            })
            .unwrap();

        let result = handle.await.unwrap();
        assert!(
            matches!(result, Err(SessionError::Audio(_))),
            "microphone denial must surface as an audio error, got {result:?}"
        );
        let record = store.get("p1").unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Failed);
        assert_eq!(record.failure, Some(FailureCause::Hardware));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_verdict_restarts_then_fails() {
        let store = Arc::new(MemoryStore::new());
        let participant = Participant::new(
            Arc::clone(&store),
            FakeCapture::new(&[Symbol::High]),
            "p1",
            EmitterConfig::default(),
        );
        let handle = tokio::spawn(participant.run());

        // A coordinator that keeps selecting the participant but never
        // delivers a verdict
        let store_side = Arc::clone(&store);
        let driver = tokio::spawn(async move {
            loop {
                sleep(Duration::from_millis(50)).await;
                let Some(record) = store_side.get("p1").ok().flatten() else {
                    break;
                };
                match record.status {
                    RequestStatus::Ready => {
                        let _ = store_side.update("p1", &mut |r| {
                            if r.advance(RequestStatus::Emitting) {
                                r.emitted_pattern = Some(Pattern::generate(6));
                            }
                        });
                    }
                    RequestStatus::Failed => break,
                    _ => {}
                }
            }
        });

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            ParticipantOutcome::Failed {
                match_count: None,
                cause: Some(FailureCause::Timeout),
            }
        );
        let record = store.get("p1").unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Failed);
        assert_eq!(record.failure, Some(FailureCause::Timeout));
        driver.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_in_ready_surfaces_error() {
        let store = Arc::new(MemoryStore::new());
        let participant = Participant::new(
            Arc::clone(&store),
            FakeCapture::new(&[]),
            "p1",
            EmitterConfig::default(),
        );

        // No coordinator exists: the ready-stuck timeout fires
        let outcome = participant.run().await.unwrap();
        assert_eq!(outcome, ParticipantOutcome::Stuck);
    }
}
