//! Spectral peak detection over the ultrasonic band
//!
//! Turns raw microphone frames into a timestamped symbol sequence. Each
//! analysis window is transformed with an FFT restricted to the ultrasonic
//! band; the strongest bin is gated by an adaptive noise floor, classified
//! against the two configured carriers, and deduplicated against recent
//! peaks so reflections of one physical pulse decode as one symbol.

use crate::audio::pattern::Symbol;
use crate::session::request::EmitterConfig;
use crate::{BAND_HIGH_HZ, BAND_LOW_HZ, FFT_SIZE, MAX_PEAKS};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Minimum peak-to-floor ratio for a frame to survive, as a linear ratio
const MIN_SNR_RATIO: f32 = 4.0;

/// Classification tolerance around each carrier frequency
const FREQ_TOLERANCE_HZ: f32 = 150.0;

/// Frequency window within which two detections merge into one peak
const MERGE_FREQ_HZ: f32 = 300.0;

/// Time window within which two detections merge into one peak
const MERGE_TIME_MS: f64 = 150.0;

/// Noise floor reset value, in dB
const NOISE_FLOOR_MIN_DB: f32 = -80.0;

/// EWMA weight for noise floor updates
const NOISE_ALPHA: f32 = 0.3;

/// Guard against log of zero on silent bins
const AMPLITUDE_EPSILON: f32 = 1e-9;

/// One classified spectral peak, ordered by detection time
#[derive(Debug, Clone)]
pub struct DetectedPeak {
    /// Peak bin frequency in Hz
    pub frequency_hz: f32,
    /// Peak amplitude in dB
    pub amplitude_db: f32,
    /// Detection time in milliseconds since recording start
    pub timestamp_ms: f64,
    /// Carrier classification
    pub symbol: Symbol,
    /// Peak amplitude over the noise floor, in dB
    pub snr_db: f32,
}

/// Snapshot of detector state for logging and failure triage
#[derive(Debug, Clone)]
pub struct DetectorDiagnostics {
    /// Currently retained peaks
    pub peaks: Vec<DetectedPeak>,
    /// Current noise floor estimate in dB
    pub noise_floor_db: f32,
}

/// Factory for listening sessions.
///
/// The participant acquires the microphone only when told to (on the
/// emitting signal), never earlier; a fresh session is opened per round.
pub trait CaptureSource: Send + 'static {
    type Session: CaptureSession;

    /// Acquire the input device and start recording into a detector tuned
    /// to the carriers of `config`.
    fn open(
        &mut self,
        config: &EmitterConfig,
    ) -> Result<Self::Session, crate::audio::engine::AudioEngineError>;
}

/// An active recording session around a [`SpectralDetector`]
pub trait CaptureSession: Send {
    /// Discard peaks captured before the emission window
    fn clear(&mut self);

    /// Stop recording and return the retained peaks
    fn stop_and_analyze(&mut self) -> Vec<DetectedPeak>;

    /// Current detector snapshot
    fn diagnostics(&self) -> DetectorDiagnostics;
}

/// Ultrasonic-band peak detector with an adaptive noise floor.
///
/// The noise floor is an exponentially-weighted moving average of the
/// per-window median band amplitude, updated only upward (monotonic ratchet
/// within one recording session) and reset on [`clear_peaks`] or
/// [`start_recording`].
///
/// [`clear_peaks`]: SpectralDetector::clear_peaks
/// [`start_recording`]: SpectralDetector::start_recording
pub struct SpectralDetector {
    sample_rate: u32,
    freq_low: f32,
    freq_high: f32,
    fft: Arc<dyn Fft<f32>>,
    /// Sample accumulator feeding fixed-size analysis windows
    window: Vec<f32>,
    noise_floor_db: f32,
    peaks: Vec<DetectedPeak>,
    recording: bool,
    /// Total samples consumed since recording start (the detection clock)
    frames_consumed: u64,
}

impl SpectralDetector {
    /// Create a detector tuned to the carriers of `config`.
    pub fn new(sample_rate: u32, config: &EmitterConfig) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            sample_rate,
            freq_low: config.freq_low_hz,
            freq_high: config.freq_high_hz,
            fft: planner.plan_fft_forward(FFT_SIZE),
            window: Vec::with_capacity(FFT_SIZE * 2),
            noise_floor_db: NOISE_FLOOR_MIN_DB,
            peaks: Vec::new(),
            recording: false,
            frames_consumed: 0,
        }
    }

    /// SNR gate in dB, converted from the linear ratio
    fn min_snr_db() -> f32 {
        20.0 * MIN_SNR_RATIO.log10()
    }

    /// Begin a recording session. Resets peaks, the noise floor, and the
    /// detection clock.
    pub fn start_recording(&mut self) {
        self.recording = true;
        self.peaks.clear();
        self.window.clear();
        self.noise_floor_db = NOISE_FLOOR_MIN_DB;
        self.frames_consumed = 0;
        tracing::debug!(sample_rate = self.sample_rate, "recording started");
    }

    /// Discard peaks captured so far (ambient pre-roll) without restarting
    /// the recording session. Also resets the noise floor so pre-roll energy
    /// cannot gate the actual emission window.
    pub fn clear_peaks(&mut self) {
        let dropped = self.peaks.len();
        self.peaks.clear();
        self.noise_floor_db = NOISE_FLOOR_MIN_DB;
        if dropped > 0 {
            tracing::debug!(dropped, "pre-roll peaks cleared");
        }
    }

    /// Whether a recording session is active
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Current noise floor estimate in dB
    pub fn noise_floor_db(&self) -> f32 {
        self.noise_floor_db
    }

    /// Feed microphone samples. Called once per available audio buffer;
    /// analysis runs for every completed window.
    pub fn process_frame(&mut self, samples: &[f32]) {
        if !self.recording {
            return;
        }
        self.window.extend_from_slice(samples);
        while self.window.len() >= FFT_SIZE {
            let block: Vec<f32> = self.window.drain(..FFT_SIZE).collect();
            self.frames_consumed += FFT_SIZE as u64;
            self.analyze_window(&block);
        }
    }

    /// Stop the session and return retained peaks.
    ///
    /// If more than [`MAX_PEAKS`] peaks were retained, only the strongest
    /// survive, re-sorted chronologically afterwards: order, not strength,
    /// is what verification uses.
    pub fn stop_and_analyze(&mut self) -> Vec<DetectedPeak> {
        self.recording = false;
        self.window.clear();

        let mut peaks = std::mem::take(&mut self.peaks);
        if peaks.len() > MAX_PEAKS {
            peaks.sort_by(|a, b| b.amplitude_db.total_cmp(&a.amplitude_db));
            peaks.truncate(MAX_PEAKS);
        }
        peaks.sort_by(|a, b| a.timestamp_ms.total_cmp(&b.timestamp_ms));

        tracing::info!(
            peaks = peaks.len(),
            noise_floor_db = self.noise_floor_db,
            "recording analyzed"
        );
        peaks
    }

    /// Snapshot current peaks and noise floor
    pub fn diagnostics(&self) -> DetectorDiagnostics {
        DetectorDiagnostics {
            peaks: self.peaks.clone(),
            noise_floor_db: self.noise_floor_db,
        }
    }

    fn analyze_window(&mut self, block: &[f32]) {
        let mut spectrum: Vec<Complex<f32>> =
            block.iter().map(|&x| Complex::new(x, 0.0)).collect();
        self.fft.process(&mut spectrum);

        let hz_per_bin = self.sample_rate as f32 / FFT_SIZE as f32;
        let lo_bin = (BAND_LOW_HZ / hz_per_bin).ceil() as usize;
        let hi_bin = ((BAND_HIGH_HZ / hz_per_bin).floor() as usize).min(FFT_SIZE / 2 - 1);
        if lo_bin >= hi_bin {
            return;
        }

        let mut band_db = Vec::with_capacity(hi_bin - lo_bin + 1);
        let mut peak_db = f32::MIN;
        let mut peak_bin = lo_bin;
        for (bin, c) in spectrum[lo_bin..=hi_bin].iter().enumerate() {
            let db = 20.0 * (c.norm() + AMPLITUDE_EPSILON).log10();
            if db > peak_db {
                peak_db = db;
                peak_bin = lo_bin + bin;
            }
            band_db.push(db);
        }

        // Noise floor: EWMA of the band median, ratcheting upward only
        band_db.sort_by(f32::total_cmp);
        let median_db = band_db[band_db.len() / 2];
        if median_db > self.noise_floor_db {
            self.noise_floor_db =
                self.noise_floor_db * (1.0 - NOISE_ALPHA) + median_db * NOISE_ALPHA;
        }

        let snr_db = peak_db - self.noise_floor_db;
        if snr_db < Self::min_snr_db() {
            return;
        }

        let frequency_hz = peak_bin as f32 * hz_per_bin;
        let symbol = if (frequency_hz - self.freq_high).abs() <= FREQ_TOLERANCE_HZ {
            Symbol::High
        } else if (frequency_hz - self.freq_low).abs() <= FREQ_TOLERANCE_HZ {
            Symbol::Low
        } else {
            // Interference: loud, but matching neither carrier
            tracing::trace!(frequency_hz, snr_db, "off-carrier peak rejected");
            return;
        };

        let timestamp_ms = self.frames_consumed as f64 / self.sample_rate as f64 * 1000.0;
        let peak = DetectedPeak {
            frequency_hz,
            amplitude_db: peak_db,
            timestamp_ms,
            symbol,
            snr_db,
        };

        // Merge reflections: a retained peak close in frequency and time is
        // either overwritten by a stronger detection or shadows a weaker one
        if let Some(existing) = self.peaks.iter_mut().find(|p| {
            (p.frequency_hz - peak.frequency_hz).abs() <= MERGE_FREQ_HZ
                && (peak.timestamp_ms - p.timestamp_ms).abs() <= MERGE_TIME_MS
        }) {
            if peak.amplitude_db > existing.amplitude_db {
                *existing = peak;
            }
            return;
        }

        tracing::trace!(
            frequency_hz,
            amplitude_db = peak_db,
            snr_db,
            symbol = %peak.symbol,
            "peak retained"
        );
        self.peaks.push(peak);
    }
}

/// Map retained peaks to the decoded symbol sequence, in detection order
pub fn decoded_symbols(peaks: &[DetectedPeak]) -> Vec<Symbol> {
    peaks.iter().map(|p| p.symbol).collect()
}

/// Handle for the dedicated analysis thread.
///
/// The thread drains microphone frames from a bounded channel and feeds the
/// shared detector, so no FFT work ever runs on the audio callback.
pub struct AnalysisWorker {
    stop_flag: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl AnalysisWorker {
    /// Spawn the analysis thread over a shared detector and frame queue.
    pub fn spawn(
        detector: Arc<Mutex<SpectralDetector>>,
        frames: crossbeam_channel::Receiver<Vec<f32>>,
    ) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop_flag);

        let thread = std::thread::Builder::new()
            .name("spectral-analysis".into())
            .spawn(move || loop {
                if flag.load(Ordering::Acquire) {
                    break;
                }
                match frames.recv_timeout(Duration::from_millis(10)) {
                    Ok(frame) => {
                        let mut detector = detector.lock().unwrap();
                        detector.process_frame(&frame);
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                }
            })
            .expect("Failed to spawn spectral analysis thread");

        Self {
            stop_flag,
            thread: Some(thread),
        }
    }

    /// Stop the analysis thread and wait for it to finish
    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AnalysisWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::TAU;

    fn sine_window(freq: f32, amplitude: f32) -> Vec<f32> {
        (0..FFT_SIZE)
            .map(|i| (TAU * freq * i as f32 / 48000.0).sin() * amplitude)
            .collect()
    }

    fn detector() -> SpectralDetector {
        let mut d = SpectralDetector::new(48000, &EmitterConfig::default());
        d.start_recording();
        d
    }

    #[test]
    fn test_high_carrier_classified() {
        let mut d = detector();
        d.process_frame(&sine_window(19_500.0, 0.4));

        let peaks = d.stop_and_analyze();
        assert_eq!(peaks.len(), 1);
        assert_eq!(peaks[0].symbol, Symbol::High);
        assert!((peaks[0].frequency_hz - 19_500.0).abs() < 50.0);
        assert!(peaks[0].snr_db > SpectralDetector::min_snr_db());
    }

    #[test]
    fn test_low_carrier_classified() {
        let mut d = detector();
        d.process_frame(&sine_window(18_500.0, 0.4));

        let peaks = d.stop_and_analyze();
        assert_eq!(peaks.len(), 1);
        assert_eq!(peaks[0].symbol, Symbol::Low);
    }

    #[test]
    fn test_off_carrier_interference_rejected() {
        let mut d = detector();
        // Loud tone in-band but matching neither carrier
        d.process_frame(&sine_window(17_800.0, 0.5));

        let peaks = d.stop_and_analyze();
        assert!(peaks.is_empty(), "Off-carrier tone must be discarded");
    }

    #[test]
    fn test_silence_yields_nothing() {
        let mut d = detector();
        for _ in 0..10 {
            d.process_frame(&vec![0.0; FFT_SIZE]);
        }
        assert!(d.stop_and_analyze().is_empty());
    }

    #[test]
    fn test_reflection_merge_keeps_stronger() {
        let mut d = detector();
        // Direct path then a stronger reflection within the merge windows
        d.process_frame(&sine_window(19_500.0, 0.2));
        d.process_frame(&sine_window(19_500.0, 0.5));

        let peaks = d.stop_and_analyze();
        assert_eq!(peaks.len(), 1, "Reflections must merge into one peak");

        let strong_db = 20.0 * (0.5f32 * FFT_SIZE as f32 / 2.0).log10();
        assert!(
            (peaks[0].amplitude_db - strong_db).abs() < 3.0,
            "Merged peak should retain the stronger amplitude, got {} dB",
            peaks[0].amplitude_db
        );
    }

    #[test]
    fn test_weaker_reflection_dropped() {
        let mut d = detector();
        d.process_frame(&sine_window(19_500.0, 0.5));
        let first = d.diagnostics().peaks[0].clone();

        d.process_frame(&sine_window(19_500.0, 0.2));
        let peaks = d.stop_and_analyze();
        assert_eq!(peaks.len(), 1);
        assert_eq!(
            peaks[0].timestamp_ms, first.timestamp_ms,
            "Weaker reflection must not overwrite the retained peak"
        );
    }

    #[test]
    fn test_distinct_carriers_never_merge() {
        let mut d = detector();
        // Back-to-back windows, alternating carriers: close in time but far
        // apart in frequency
        d.process_frame(&sine_window(19_500.0, 0.4));
        d.process_frame(&sine_window(18_500.0, 0.4));

        let peaks = d.stop_and_analyze();
        assert_eq!(peaks.len(), 2);
        assert_eq!(peaks[0].symbol, Symbol::High);
        assert_eq!(peaks[1].symbol, Symbol::Low);
    }

    #[test]
    fn test_peak_cap_and_chronological_order() {
        let mut d = detector();
        // Alternating carriers defeat both merge windows, so every window
        // lands one peak. Amplitudes rise so the earliest are the weakest.
        let count = MAX_PEAKS + 4;
        for i in 0..count {
            let freq = if i % 2 == 0 { 19_500.0 } else { 18_500.0 };
            let amplitude = 0.1 + 0.02 * i as f32;
            d.process_frame(&sine_window(freq, amplitude));
        }

        let peaks = d.stop_and_analyze();
        assert_eq!(peaks.len(), MAX_PEAKS, "Cap must bound retained peaks");
        for pair in peaks.windows(2) {
            assert!(
                pair[0].timestamp_ms < pair[1].timestamp_ms,
                "Survivors must be re-sorted chronologically"
            );
        }
        // The weakest (earliest) detections are the ones dropped
        let earliest_kept = peaks[0].timestamp_ms;
        let window_ms = FFT_SIZE as f64 / 48.0;
        assert!(
            earliest_kept > window_ms * 4.0,
            "The four weakest (earliest) peaks should have been dropped"
        );
    }

    #[test]
    fn test_clear_peaks_discards_preroll() {
        let mut d = detector();
        d.process_frame(&sine_window(19_500.0, 0.4));
        assert_eq!(d.diagnostics().peaks.len(), 1);

        d.clear_peaks();
        assert!(d.is_recording(), "clear_peaks must not stop the session");
        assert!(d.stop_and_analyze().is_empty());
    }

    #[test]
    fn test_noise_floor_ratchets_monotonically() {
        let mut d = detector();
        assert_eq!(d.noise_floor_db(), NOISE_FLOOR_MIN_DB);

        // Broadband noise raises the band median
        let mut seed = 0x2F6E2B1u32;
        let mut noise = |amp: f32| -> Vec<f32> {
            (0..FFT_SIZE)
                .map(|_| {
                    seed = seed.wrapping_mul(1103515245).wrapping_add(12345);
                    ((seed >> 16) as f32 / 32768.0 - 1.0) * amp
                })
                .collect()
        };

        d.process_frame(&noise(0.5));
        let raised = d.noise_floor_db();
        assert!(raised > NOISE_FLOOR_MIN_DB, "Loud noise must raise the floor");

        // Quieter noise must not lower it
        d.process_frame(&noise(0.05));
        assert!(
            d.noise_floor_db() >= raised,
            "Noise floor must be monotonically non-decreasing within a session"
        );

        d.clear_peaks();
        assert_eq!(
            d.noise_floor_db(),
            NOISE_FLOOR_MIN_DB,
            "Explicit reset is the only way down"
        );
    }

    #[test]
    fn test_timestamps_follow_detection_clock() {
        let mut d = detector();
        d.process_frame(&sine_window(19_500.0, 0.4));
        for _ in 0..8 {
            d.process_frame(&vec![0.0; FFT_SIZE]);
        }
        d.process_frame(&sine_window(18_500.0, 0.4));

        let peaks = d.stop_and_analyze();
        assert_eq!(peaks.len(), 2);
        let window_ms = FFT_SIZE as f64 / 48.0;
        let gap = peaks[1].timestamp_ms - peaks[0].timestamp_ms;
        assert!(
            (gap - 9.0 * window_ms).abs() < 1.0,
            "Peak spacing should match the sample clock, got {gap}ms"
        );
    }

    #[test]
    fn test_decoded_symbols_order() {
        let mut d = detector();
        d.process_frame(&sine_window(19_500.0, 0.4));
        for _ in 0..8 {
            d.process_frame(&vec![0.0; FFT_SIZE]);
        }
        d.process_frame(&sine_window(18_500.0, 0.4));

        let peaks = d.stop_and_analyze();
        assert_eq!(decoded_symbols(&peaks), vec![Symbol::High, Symbol::Low]);
    }

    #[test]
    fn test_analysis_worker_feeds_detector() {
        let det = Arc::new(Mutex::new(SpectralDetector::new(
            48000,
            &EmitterConfig::default(),
        )));
        det.lock().unwrap().start_recording();

        let (tx, rx) = crossbeam_channel::bounded(64);
        let mut worker = AnalysisWorker::spawn(Arc::clone(&det), rx);

        tx.send(sine_window(19_500.0, 0.4)).unwrap();
        drop(tx);

        // The worker drains buffered frames before observing disconnect
        for _ in 0..200 {
            if !det.lock().unwrap().diagnostics().peaks.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        worker.stop();

        let peaks = det.lock().unwrap().stop_and_analyze();
        assert_eq!(peaks.len(), 1);
        assert_eq!(peaks[0].symbol, Symbol::High);
    }
}
