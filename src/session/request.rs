//! Participant request records and the persisted schema
//!
//! A [`ParticipantRequest`] is one verification attempt, shared between the
//! coordinator and the participant through the store. Field ownership is
//! split: the coordinator writes `status` (forward transitions) and
//! `emitted_pattern`; the participant writes `detected_pattern` and its own
//! readiness; the verifier writes `match_count`/`passed`. The JSON shape is
//! a cross-implementation contract, so every schema field is explicit.

use crate::audio::pattern::{Pattern, Symbol};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store document id for one participant request
pub type RequestId = String;

/// Handshake state of one participant request.
///
/// Status only ever moves forward along the fixed graph
/// `waiting → ready → emitting → listening → submitted → {verified, failed}`
/// (with `failed` also reachable from `emitting`/`listening` when an
/// emission attempt is abandoned). The only way back is the explicit
/// round-restart reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Waiting,
    Ready,
    Emitting,
    Listening,
    Submitted,
    Verified,
    Failed,
}

impl RequestStatus {
    /// True for states that end the request lifecycle
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestStatus::Verified | RequestStatus::Failed)
    }

    /// Whether `next` is a legal forward transition from this state
    pub fn can_advance_to(self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, next),
            (Waiting, Ready)
                | (Ready, Emitting)
                | (Emitting, Listening)
                | (Listening, Submitted)
                | (Submitted, Verified)
                | (Submitted, Failed)
                | (Emitting, Failed)
                | (Listening, Failed)
        )
    }
}

/// Why a request ended in `failed`.
///
/// Distinguishing these matters to the user: "no signal" means move the
/// devices closer, "partial match" means retry, "timeout"/"hardware"/
/// "emission" mean something in the system broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    /// Nothing decodable arrived (match count 0)
    NoSignal,
    /// Some symbols decoded, but below the pass threshold
    PartialMatch,
    /// A handshake or verdict wait expired past the retry cap
    Timeout,
    /// Microphone or speaker acquisition failed
    Hardware,
    /// The acoustic emission itself failed past the retry cap
    Emission,
}

/// Acoustic emission parameters.
///
/// Two participants are config-equivalent iff all fields match exactly;
/// equivalence decides batch membership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmitterConfig {
    /// Output volume, 0.0..=1.0
    pub volume: f32,
    /// Lower carrier frequency in Hz (the `Low` symbol)
    pub freq_low_hz: f32,
    /// Upper carrier frequency in Hz (the `High` symbol)
    pub freq_high_hz: f32,
    /// Pulse length in milliseconds
    pub pulse_duration_ms: u32,
    /// Silence between pulses in milliseconds
    pub pulse_gap_ms: u32,
    /// Route the rendered emission through the highpass cascade
    pub use_output_filter: bool,
    /// Highpass corner frequency in Hz, just below the lower carrier
    pub filter_cutoff_hz: f32,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            volume: 0.8,
            freq_low_hz: 18_500.0,
            freq_high_hz: 19_500.0,
            pulse_duration_ms: 120,
            pulse_gap_ms: 180,
            use_output_filter: true,
            filter_cutoff_hz: 17_000.0,
        }
    }
}

impl EmitterConfig {
    /// Carrier frequency for a symbol. `Unknown` has no carrier.
    pub fn carrier_hz(&self, symbol: Symbol) -> Option<f32> {
        match symbol {
            Symbol::High => Some(self.freq_high_hz),
            Symbol::Low => Some(self.freq_low_hz),
            Symbol::Unknown => None,
        }
    }

    /// Exact-equality grouping key for batch membership. Float fields are
    /// compared by bit pattern, so any single-field difference separates
    /// two configs.
    pub fn grouping_key(&self) -> ConfigKey {
        ConfigKey {
            volume: self.volume.to_bits(),
            freq_low: self.freq_low_hz.to_bits(),
            freq_high: self.freq_high_hz.to_bits(),
            pulse_duration_ms: self.pulse_duration_ms,
            pulse_gap_ms: self.pulse_gap_ms,
            use_output_filter: self.use_output_filter,
            filter_cutoff: self.filter_cutoff_hz.to_bits(),
        }
    }
}

/// Hashable exact-equality key derived from an [`EmitterConfig`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfigKey {
    volume: u32,
    freq_low: u32,
    freq_high: u32,
    pulse_duration_ms: u32,
    pulse_gap_ms: u32,
    use_output_filter: bool,
    filter_cutoff: u32,
}

/// One verification attempt, as persisted in the shared store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantRequest {
    /// Store document id (participant identity for this round)
    pub id: RequestId,
    /// Handshake state
    pub status: RequestStatus,
    /// Emission parameters this participant expects
    pub config: EmitterConfig,
    /// Ground-truth pattern, written once by the coordinator
    pub emitted_pattern: Option<Pattern>,
    /// Decoded symbols, written once by the participant
    pub detected_pattern: Option<Vec<Symbol>>,
    /// Verifier output: matched symbol count
    pub match_count: Option<u32>,
    /// Verifier output: pass decision
    pub passed: Option<bool>,
    /// Failure classification for terminal `failed`
    pub failure: Option<FailureCause>,
    /// When the request was created
    pub created_at: DateTime<Utc>,
    /// When the verdict was written
    pub verified_at: Option<DateTime<Utc>>,
}

impl ParticipantRequest {
    /// Create a fresh request in `waiting`
    pub fn new(id: impl Into<RequestId>, config: EmitterConfig) -> Self {
        Self {
            id: id.into(),
            status: RequestStatus::Waiting,
            config,
            emitted_pattern: None,
            detected_pattern: None,
            match_count: None,
            passed: None,
            failure: None,
            created_at: Utc::now(),
            verified_at: None,
        }
    }

    /// Apply a forward transition. Returns false (leaving the record
    /// untouched) when the edge is outside the fixed graph.
    pub fn advance(&mut self, next: RequestStatus) -> bool {
        if self.status.can_advance_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    /// Explicit round-restart reset: back to `waiting` with all per-round
    /// fields cleared. This is the only backward movement the state machine
    /// allows, and it is always externally triggered.
    pub fn reset_for_retry(&mut self) {
        self.status = RequestStatus::Waiting;
        self.emitted_pattern = None;
        self.detected_pattern = None;
        self.match_count = None;
        self.passed = None;
        self.failure = None;
        self.verified_at = None;
    }
}
