//! Biquad highpass filtering for the emission path
//!
//! The pulse envelopes are short, so the rendered signal carries low-frequency
//! transient energy that is faintly audible on small speakers. Routing the
//! output through a highpass whose cutoff sits just below the lower carrier
//! removes those sub-harmonic transients while both carriers stay in the
//! passband.

use std::f32::consts::{FRAC_1_SQRT_2, PI};

/// Single RBJ biquad highpass stage (direct form 1)
#[derive(Debug, Clone)]
pub struct BiquadHighpass {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl BiquadHighpass {
    /// Create a highpass stage with Butterworth Q.
    ///
    /// # Arguments
    /// * `sample_rate` - Sample rate in Hz
    /// * `cutoff_hz` - -3dB corner frequency in Hz
    pub fn new(sample_rate: u32, cutoff_hz: f32) -> Self {
        Self::with_q(sample_rate, cutoff_hz, FRAC_1_SQRT_2)
    }

    /// Create a highpass stage with an explicit Q.
    pub fn with_q(sample_rate: u32, cutoff_hz: f32, q: f32) -> Self {
        let w0 = 2.0 * PI * cutoff_hz / sample_rate as f32;
        let cos_w0 = w0.cos();
        let alpha = w0.sin() / (2.0 * q);

        let a0 = 1.0 + alpha;
        Self {
            b0: ((1.0 + cos_w0) / 2.0) / a0,
            b1: (-(1.0 + cos_w0)) / a0,
            b2: ((1.0 + cos_w0) / 2.0) / a0,
            a1: (-2.0 * cos_w0) / a0,
            a2: (1.0 - alpha) / a0,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        }
    }

    /// Process a single sample
    pub fn process(&mut self, x: f32) -> f32 {
        let y = self.b0 * x + self.b1 * self.x1 + self.b2 * self.x2
            - self.a1 * self.y1
            - self.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }

    /// Clear filter state
    pub fn reset(&mut self) {
        self.x1 = 0.0;
        self.x2 = 0.0;
        self.y1 = 0.0;
        self.y2 = 0.0;
    }
}

/// One or more cascaded highpass stages sharing a cutoff.
///
/// Cascading steepens the stopband rolloff; the passband carriers see only
/// the mild corner attenuation of each stage.
#[derive(Debug, Clone)]
pub struct HighpassCascade {
    stages: Vec<BiquadHighpass>,
}

impl HighpassCascade {
    /// Create a cascade of `stages` identical highpass stages.
    ///
    /// # Arguments
    /// * `sample_rate` - Sample rate in Hz
    /// * `cutoff_hz` - -3dB corner frequency in Hz
    /// * `stages` - Number of biquad stages (min 1)
    pub fn new(sample_rate: u32, cutoff_hz: f32, stages: usize) -> Self {
        let stages = stages.max(1);
        Self {
            stages: (0..stages)
                .map(|_| BiquadHighpass::new(sample_rate, cutoff_hz))
                .collect(),
        }
    }

    /// Process a single sample through all stages
    pub fn process(&mut self, x: f32) -> f32 {
        self.stages.iter_mut().fold(x, |s, stage| stage.process(s))
    }

    /// Filter a buffer in place
    pub fn process_buffer(&mut self, buffer: &mut [f32]) {
        for sample in buffer.iter_mut() {
            *sample = self.process(*sample);
        }
    }

    /// Clear all stage state
    pub fn reset(&mut self) {
        for stage in &mut self.stages {
            stage.reset();
        }
    }

    /// Number of stages in the cascade
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }
}
