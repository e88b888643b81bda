//! Proxitone - ultrasonic co-location verification
//!
//! Verifies that two devices share a physical space by exchanging a random
//! binary pattern over an inaudible acoustic side-channel. One device emits
//! the pattern as frequency-shift-keyed ultrasonic pulses, the other decodes
//! it from microphone input, and a verifier checks the decoded sequence
//! against the emitted one with an order-based subsequence match.

pub mod audio;
pub mod session;
pub mod verify;

pub use audio::detector::SpectralDetector;
pub use audio::emitter::PulseEmitter;
pub use audio::engine::AudioEngine;
pub use audio::pattern::{Pattern, Symbol};
pub use session::coordinator::SessionCoordinator;
pub use session::participant::Participant;
pub use session::request::{EmitterConfig, ParticipantRequest, RequestStatus};
pub use session::store::{MemoryStore, SharedStore};
pub use verify::Verifier;

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default sample rate for audio processing (48kHz, the common consumer rate
/// that still leaves the 17-20.5kHz band below Nyquist)
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

/// Number of symbols in one verification pattern
pub const PATTERN_LENGTH: usize = 6;

/// Maximum number of detected peaks retained per recording session
pub const MAX_PEAKS: usize = 12;

/// FFT size for spectral analysis (23.4Hz per bin at 48kHz)
pub const FFT_SIZE: usize = 2048;

/// Lower edge of the ultrasonic analysis band in Hz
pub const BAND_LOW_HZ: f32 = 17_000.0;

/// Upper edge of the ultrasonic analysis band in Hz
pub const BAND_HIGH_HZ: f32 = 20_500.0;
