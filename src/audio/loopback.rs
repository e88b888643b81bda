//! Simulated acoustic channel for tests and the demo binary
//!
//! Connects a [`ToneSink`] directly to any number of capture sessions:
//! every scheduled emission buffer is fed straight into each live
//! detector, exercising the full render-and-decode path with no audio
//! hardware. An optional channel gain stands in for distance attenuation.

use crate::audio::detector::{
    CaptureSession, CaptureSource, DetectedPeak, DetectorDiagnostics, SpectralDetector,
};
use crate::audio::emitter::ToneSink;
use crate::audio::engine::AudioEngineError;
use crate::session::request::EmitterConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

struct Bus {
    listeners: Vec<Weak<Mutex<SpectralDetector>>>,
}

/// A shared in-process acoustic medium
pub struct LoopbackChannel {
    bus: Arc<Mutex<Bus>>,
    frame: Arc<AtomicU64>,
    sample_rate: u32,
    gain: f32,
}

impl LoopbackChannel {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            bus: Arc::new(Mutex::new(Bus {
                listeners: Vec::new(),
            })),
            frame: Arc::new(AtomicU64::new(0)),
            sample_rate,
            gain: 1.0,
        }
    }

    /// Attenuate delivered samples, simulating speaker-to-mic path loss
    pub fn with_gain(mut self, gain: f32) -> Self {
        self.gain = gain;
        self
    }

    /// Emitting side of the channel
    pub fn sink(&self) -> LoopbackSink {
        LoopbackSink {
            bus: Arc::clone(&self.bus),
            frame: Arc::clone(&self.frame),
            sample_rate: self.sample_rate,
            gain: self.gain,
        }
    }

    /// Listening side of the channel
    pub fn capture(&self) -> LoopbackCapture {
        LoopbackCapture {
            bus: Arc::clone(&self.bus),
            sample_rate: self.sample_rate,
        }
    }
}

/// Tone sink that delivers scheduled samples to every live listener
pub struct LoopbackSink {
    bus: Arc<Mutex<Bus>>,
    frame: Arc<AtomicU64>,
    sample_rate: u32,
    gain: f32,
}

impl ToneSink for LoopbackSink {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_frame(&self) -> u64 {
        self.frame.load(Ordering::Relaxed)
    }

    fn schedule(&self, _start_frame: u64, samples: Vec<f32>) -> Result<(), AudioEngineError> {
        let delivered: Vec<f32> = samples.iter().map(|s| s * self.gain).collect();

        let mut bus = self.bus.lock().unwrap();
        bus.listeners.retain(|w| w.strong_count() > 0);
        for listener in &bus.listeners {
            if let Some(detector) = listener.upgrade() {
                detector.lock().unwrap().process_frame(&delivered);
            }
        }

        self.frame
            .fetch_add(samples.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

/// Capture source registering simulated microphones on the channel
pub struct LoopbackCapture {
    bus: Arc<Mutex<Bus>>,
    sample_rate: u32,
}

impl CaptureSource for LoopbackCapture {
    type Session = LoopbackSession;

    fn open(&mut self, config: &EmitterConfig) -> Result<LoopbackSession, AudioEngineError> {
        let mut detector = SpectralDetector::new(self.sample_rate, config);
        detector.start_recording();
        let detector = Arc::new(Mutex::new(detector));

        let mut bus = self.bus.lock().unwrap();
        bus.listeners.push(Arc::downgrade(&detector));

        Ok(LoopbackSession { detector })
    }
}

/// One simulated recording session
pub struct LoopbackSession {
    detector: Arc<Mutex<SpectralDetector>>,
}

impl CaptureSession for LoopbackSession {
    fn clear(&mut self) {
        self.detector.lock().unwrap().clear_peaks();
    }

    fn stop_and_analyze(&mut self) -> Vec<DetectedPeak> {
        self.detector.lock().unwrap().stop_and_analyze()
    }

    fn diagnostics(&self) -> DetectorDiagnostics {
        self.detector.lock().unwrap().diagnostics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::detector::decoded_symbols;
    use crate::audio::emitter::PulseEmitter;
    use crate::audio::pattern::{Pattern, Symbol};

    #[tokio::test(start_paused = true)]
    async fn test_emission_decodes_over_loopback() {
        let channel = LoopbackChannel::new(48000);
        let mut capture = channel.capture();
        let config = EmitterConfig::default();

        let mut session = capture.open(&config).unwrap();
        session.clear();

        let pattern = Pattern::from_symbols(vec![
            Symbol::High,
            Symbol::Low,
            Symbol::Low,
            Symbol::High,
            Symbol::High,
            Symbol::Low,
        ]);
        let mut emitter = PulseEmitter::new(channel.sink());
        let frequencies = emitter.emit(&pattern, &config).await.unwrap();
        assert_eq!(frequencies.len(), pattern.len());

        let peaks = session.stop_and_analyze();
        assert_eq!(
            decoded_symbols(&peaks),
            pattern.symbols(),
            "a clean loopback must decode the exact emitted pattern"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_attenuated_channel_still_decodes() {
        let channel = LoopbackChannel::new(48000).with_gain(0.1);
        let mut capture = channel.capture();
        let config = EmitterConfig::default();

        let mut session = capture.open(&config).unwrap();
        let pattern = Pattern::generate(6);
        let mut emitter = PulseEmitter::new(channel.sink());
        emitter.emit(&pattern, &config).await.unwrap();

        let peaks = session.stop_and_analyze();
        assert_eq!(decoded_symbols(&peaks), pattern.symbols());
    }

    #[tokio::test(start_paused = true)]
    async fn test_multiple_listeners_hear_one_emission() {
        let channel = LoopbackChannel::new(48000);
        let config = EmitterConfig::default();

        let mut capture_a = channel.capture();
        let mut capture_b = channel.capture();
        let mut session_a = capture_a.open(&config).unwrap();
        let mut session_b = capture_b.open(&config).unwrap();

        let pattern = Pattern::generate(6);
        let mut emitter = PulseEmitter::new(channel.sink());
        emitter.emit(&pattern, &config).await.unwrap();

        assert_eq!(
            decoded_symbols(&session_a.stop_and_analyze()),
            pattern.symbols()
        );
        assert_eq!(
            decoded_symbols(&session_b.stop_and_analyze()),
            pattern.symbols()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_session_stops_receiving() {
        let channel = LoopbackChannel::new(48000);
        let config = EmitterConfig::default();

        let mut capture = channel.capture();
        let session = capture.open(&config).unwrap();
        drop(session);

        let mut emitter = PulseEmitter::new(channel.sink());
        emitter
            .emit(&Pattern::generate(6), &config)
            .await
            .unwrap();

        let bus = channel.bus.lock().unwrap();
        assert!(
            bus.listeners.is_empty(),
            "dead listeners must be pruned on delivery"
        );
    }
}
