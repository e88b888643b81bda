//! FSK pulse scheduling and rendering
//!
//! Converts a symbol pattern into sine pulses at the two carrier frequencies.
//! All pulse start times are computed upfront in output frames relative to a
//! single hardware clock reference (the output stream frame counter), so the
//! emission timing is immune to process scheduling jitter. Each pulse carries
//! a linear fade-in/fade-out envelope to suppress audible clicks at the edges.

use crate::audio::engine::AudioEngineError;
use crate::audio::filter::HighpassCascade;
use crate::audio::pattern::Pattern;
use crate::session::request::EmitterConfig;
use std::f32::consts::TAU;
use std::time::Duration;

/// Linear fade length applied at each pulse edge, in milliseconds
const EDGE_FADE_MS: f32 = 4.0;

/// Duration of the optional AGC warm-up pulse, in milliseconds
const WARMUP_DURATION_MS: u32 = 80;

/// Warm-up pulse offset above the upper carrier. Keeps the warm-up outside
/// the classification tolerance of both carriers so it can neither decode as
/// a symbol nor bias the adaptive noise floor with carrier-adjacent energy.
const WARMUP_OFFSET_HZ: f32 = 600.0;

/// Scheduling margin between "now" on the output clock and the first pulse,
/// in milliseconds
const LEAD_IN_MS: u32 = 20;

/// Envelope-tail buffer added to the blocking wait after the last pulse, in
/// milliseconds
const TAIL_BUFFER_MS: u64 = 50;

/// Number of biquad stages when output filtering is enabled
const FILTER_STAGES: usize = 2;

/// One scheduled sine pulse, in frames relative to the emission start
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledPulse {
    /// Start offset in output frames
    pub start_frame: u64,
    /// Pulse length in frames
    pub duration_frames: u32,
    /// Carrier frequency in Hz
    pub frequency_hz: f32,
}

/// Destination for rendered emission samples.
///
/// The cpal-backed engine implements this over a real output stream; tests
/// and the demo binary use the loopback channel.
pub trait ToneSink: Send {
    /// Output sample rate in Hz
    fn sample_rate(&self) -> u32;

    /// Current position of the output hardware clock, in frames
    fn current_frame(&self) -> u64;

    /// Queue samples to start playing at an absolute output frame
    fn schedule(&self, start_frame: u64, samples: Vec<f32>) -> Result<(), AudioEngineError>;
}

/// Schedules and renders one acoustic emission per batch.
///
/// `emit` resolves only after the scheduled emission window plus an
/// envelope-tail buffer has elapsed, so callers can sequence the handshake
/// around it without re-deriving pulse timing.
pub struct PulseEmitter<S: ToneSink> {
    sink: S,
    warmup: bool,
}

impl<S: ToneSink> PulseEmitter<S> {
    /// Create an emitter over the given sink, warm-up pulse enabled.
    pub fn new(sink: S) -> Self {
        Self { sink, warmup: true }
    }

    /// Enable or disable the AGC warm-up pulse. Disabling shortens the
    /// emission window at the cost of the first data pulse landing on an
    /// unsettled receiver gain.
    pub fn with_warmup(mut self, warmup: bool) -> Self {
        self.warmup = warmup;
        self
    }

    /// Compute the full pulse schedule for a pattern, relative frame 0.
    pub fn plan(
        pattern: &Pattern,
        config: &EmitterConfig,
        sample_rate: u32,
        warmup: bool,
    ) -> Vec<ScheduledPulse> {
        let frames_per_ms = sample_rate as f64 / 1000.0;
        let pulse_frames = (config.pulse_duration_ms as f64 * frames_per_ms) as u32;
        let gap_frames = (config.pulse_gap_ms as f64 * frames_per_ms) as u64;

        let mut pulses = Vec::with_capacity(pattern.len() + 1);
        let mut cursor: u64 = 0;

        if warmup {
            let warmup_frames = (WARMUP_DURATION_MS as f64 * frames_per_ms) as u32;
            pulses.push(ScheduledPulse {
                start_frame: cursor,
                duration_frames: warmup_frames,
                frequency_hz: config.freq_high_hz + WARMUP_OFFSET_HZ,
            });
            cursor += warmup_frames as u64 + gap_frames;
        }

        for &symbol in pattern.symbols() {
            let Some(freq) = config.carrier_hz(symbol) else {
                // Unknown is detector output only and is never scheduled
                continue;
            };
            pulses.push(ScheduledPulse {
                start_frame: cursor,
                duration_frames: pulse_frames,
                frequency_hz: freq,
            });
            cursor += pulse_frames as u64 + gap_frames;
        }

        pulses
    }

    /// Render a pulse schedule into one contiguous sample buffer.
    ///
    /// Every pulse is a sine at its carrier with a linear edge envelope,
    /// scaled by the configured volume. When output filtering is enabled the
    /// whole buffer is run through the highpass cascade.
    pub fn render(plan: &[ScheduledPulse], config: &EmitterConfig, sample_rate: u32) -> Vec<f32> {
        let total_frames = plan
            .iter()
            .map(|p| p.start_frame + p.duration_frames as u64)
            .max()
            .unwrap_or(0) as usize;
        let mut buffer = vec![0.0f32; total_frames];

        let fade_frames = ((EDGE_FADE_MS / 1000.0) * sample_rate as f32) as u32;
        let volume = config.volume.clamp(0.0, 1.0);

        for pulse in plan {
            let fade = fade_frames.min(pulse.duration_frames / 2).max(1);
            for i in 0..pulse.duration_frames {
                let envelope = if i < fade {
                    i as f32 / fade as f32
                } else if i >= pulse.duration_frames - fade {
                    (pulse.duration_frames - i) as f32 / fade as f32
                } else {
                    1.0
                };
                let phase = TAU * pulse.frequency_hz * i as f32 / sample_rate as f32;
                buffer[pulse.start_frame as usize + i as usize] = phase.sin() * envelope * volume;
            }
        }

        if config.use_output_filter {
            let mut filter = HighpassCascade::new(sample_rate, config.filter_cutoff_hz, FILTER_STAGES);
            filter.process_buffer(&mut buffer);
        }

        buffer
    }

    /// Emit a pattern and block until the emission window has fully elapsed.
    ///
    /// # Returns
    /// The carrier frequencies actually scheduled for the pattern symbols
    /// (echoing `pattern`, for verification bookkeeping).
    pub async fn emit(
        &mut self,
        pattern: &Pattern,
        config: &EmitterConfig,
    ) -> Result<Vec<f32>, AudioEngineError> {
        let sample_rate = self.sink.sample_rate();
        let plan = Self::plan(pattern, config, sample_rate, self.warmup);
        let samples = Self::render(&plan, config, sample_rate);

        let lead_in_frames = (LEAD_IN_MS * sample_rate / 1000) as u64;
        let start_frame = self.sink.current_frame() + lead_in_frames;
        let total_frames = samples.len() as u64;

        tracing::debug!(
            pulses = plan.len(),
            start_frame,
            total_frames,
            filtered = config.use_output_filter,
            "emission scheduled"
        );

        self.sink.schedule(start_frame, samples)?;

        let window_ms = (total_frames + lead_in_frames) * 1000 / sample_rate as u64;
        tokio::time::sleep(Duration::from_millis(window_ms + TAIL_BUFFER_MS)).await;

        let frequencies: Vec<f32> = pattern
            .symbols()
            .iter()
            .filter_map(|&s| config.carrier_hz(s))
            .collect();

        tracing::info!(
            pattern = %pattern,
            pulses = frequencies.len(),
            window_ms,
            "emission complete"
        );

        Ok(frequencies)
    }

    /// Warm-up carrier for a config (fixed offset above the upper carrier)
    pub fn warmup_frequency(config: &EmitterConfig) -> f32 {
        config.freq_high_hz + WARMUP_OFFSET_HZ
    }
}
