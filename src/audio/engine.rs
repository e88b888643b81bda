//! cpal audio engine for device management and stream handling
//!
//! Provides the hardware side of both halves of the verification flow:
//! - An output sink whose stream frame counter is the hardware clock that
//!   pulse schedules are computed against
//! - A capture source that feeds microphone frames into the analysis thread
//!
//! cpal streams are not `Send`, so each stream lives on a dedicated thread
//! that owns it for its whole lifetime; control and samples cross thread
//! boundaries only through lock-free channels and atomics.

use crate::audio::detector::{
    AnalysisWorker, CaptureSession, CaptureSource, DetectedPeak, DetectorDiagnostics,
    SpectralDetector,
};
use crate::audio::emitter::ToneSink;
use crate::session::request::EmitterConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Bound on queued capture frames between the input callback and analysis
const CAPTURE_QUEUE_FRAMES: usize = 64;

/// Errors that can occur during audio engine operations.
///
/// Hardware acquisition failures are fatal for the current session and are
/// surfaced to the caller, never retried automatically.
#[derive(Error, Debug)]
pub enum AudioEngineError {
    #[error("No output device available")]
    NoOutputDevice,

    #[error("No input device available (microphone access denied?)")]
    NoInputDevice,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported stream config: {0}")]
    UnsupportedConfig(String),

    #[error("Audio worker thread is gone")]
    WorkerGone,
}

/// Audio device information
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Device name
    pub name: String,
    /// Whether this is a default input or output device
    pub is_default: bool,
    /// Number of input channels
    pub input_channels: u16,
    /// Number of output channels
    pub output_channels: u16,
}

/// Device enumeration over the default cpal host
pub struct AudioEngine;

impl AudioEngine {
    /// List available audio devices
    pub fn list_devices() -> Result<Vec<DeviceInfo>, AudioEngineError> {
        let host = cpal::default_host();
        let mut devices = Vec::new();

        let default_input = host.default_input_device().and_then(|d| d.name().ok());
        let default_output = host.default_output_device().and_then(|d| d.name().ok());

        let iter = host
            .devices()
            .map_err(|e| AudioEngineError::StreamError(e.to_string()))?;
        for device in iter {
            let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
            let is_default =
                Some(&name) == default_input.as_ref() || Some(&name) == default_output.as_ref();

            let input_channels = device
                .default_input_config()
                .map(|c| c.channels())
                .unwrap_or(0);
            let output_channels = device
                .default_output_config()
                .map(|c| c.channels())
                .unwrap_or(0);

            devices.push(DeviceInfo {
                name,
                is_default,
                input_channels,
                output_channels,
            });
        }

        Ok(devices)
    }
}

/// One scheduled span of output samples
struct Segment {
    start_frame: u64,
    samples: Vec<f32>,
}

/// Hardware-clocked tone sink over a cpal output stream.
///
/// The output callback advances a shared frame counter; scheduled segments
/// are mixed in exactly at their start frame, so pulse timing follows the
/// audio clock rather than any software timer.
pub struct CpalToneSink {
    sample_rate: u32,
    frame: Arc<AtomicU64>,
    segments_tx: crossbeam_channel::Sender<Segment>,
    stop_tx: crossbeam_channel::Sender<()>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl CpalToneSink {
    /// Acquire the default output device and start the output stream.
    ///
    /// Fails fatally for the session when no output device can be acquired.
    pub fn open() -> Result<Self, AudioEngineError> {
        let frame = Arc::new(AtomicU64::new(0));
        let (segments_tx, segments_rx) = crossbeam_channel::unbounded::<Segment>();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<u32, AudioEngineError>>(1);

        let frame_for_thread = Arc::clone(&frame);
        let thread = std::thread::Builder::new()
            .name("tone-output".into())
            .spawn(move || {
                Self::output_thread(frame_for_thread, segments_rx, stop_rx, ready_tx);
            })
            .map_err(|e| AudioEngineError::StreamError(e.to_string()))?;

        let sample_rate = ready_rx
            .recv_timeout(Duration::from_secs(5))
            .map_err(|_| AudioEngineError::WorkerGone)??;

        tracing::info!(sample_rate, "output stream running");
        Ok(Self {
            sample_rate,
            frame,
            segments_tx,
            stop_tx,
            thread: Some(thread),
        })
    }

    fn output_thread(
        frame: Arc<AtomicU64>,
        segments_rx: crossbeam_channel::Receiver<Segment>,
        stop_rx: crossbeam_channel::Receiver<()>,
        ready_tx: crossbeam_channel::Sender<Result<u32, AudioEngineError>>,
    ) {
        let build = || -> Result<(cpal::Stream, u32), AudioEngineError> {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or(AudioEngineError::NoOutputDevice)?;
            let supported = device
                .default_output_config()
                .map_err(|e| AudioEngineError::UnsupportedConfig(e.to_string()))?;
            let sample_rate = supported.sample_rate();
            let channels = supported.channels() as usize;
            let config: cpal::StreamConfig = supported.config();

            let counter = Arc::clone(&frame);
            let mut active: VecDeque<Segment> = VecDeque::new();
            let stream = device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        while let Ok(segment) = segments_rx.try_recv() {
                            active.push_back(segment);
                        }

                        let base = counter.load(Ordering::Relaxed);
                        let frames = data.len() / channels;
                        for f in 0..frames {
                            let abs = base + f as u64;
                            let mut sample = 0.0f32;
                            for segment in &active {
                                if abs >= segment.start_frame {
                                    let idx = (abs - segment.start_frame) as usize;
                                    if idx < segment.samples.len() {
                                        sample += segment.samples[idx];
                                    }
                                }
                            }
                            for c in 0..channels {
                                data[f * channels + c] = sample;
                            }
                        }

                        let end = base + frames as u64;
                        active.retain(|s| s.start_frame + s.samples.len() as u64 > end);
                        counter.store(end, Ordering::Relaxed);
                    },
                    |e| tracing::error!(error = %e, "output stream error"),
                    None,
                )
                .map_err(|e| AudioEngineError::StreamError(e.to_string()))?;

            stream
                .play()
                .map_err(|e| AudioEngineError::StreamError(e.to_string()))?;
            Ok((stream, sample_rate))
        };

        match build() {
            Ok((stream, sample_rate)) => {
                let _ = ready_tx.send(Ok(sample_rate));
                // Keep the stream alive until told to stop
                let _ = stop_rx.recv();
                drop(stream);
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
            }
        }
    }
}

impl ToneSink for CpalToneSink {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_frame(&self) -> u64 {
        self.frame.load(Ordering::Relaxed)
    }

    fn schedule(&self, start_frame: u64, samples: Vec<f32>) -> Result<(), AudioEngineError> {
        self.segments_tx
            .send(Segment {
                start_frame,
                samples,
            })
            .map_err(|_| AudioEngineError::WorkerGone)
    }
}

impl Drop for CpalToneSink {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Capture source over the default cpal input device
pub struct CpalCaptureSource;

impl CaptureSource for CpalCaptureSource {
    type Session = CpalCaptureSession;

    fn open(&mut self, config: &EmitterConfig) -> Result<CpalCaptureSession, AudioEngineError> {
        CpalCaptureSession::open(config)
    }
}

/// Live microphone session: input stream thread feeding the analysis worker
pub struct CpalCaptureSession {
    detector: Arc<Mutex<SpectralDetector>>,
    worker: AnalysisWorker,
    stop_tx: crossbeam_channel::Sender<()>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl CpalCaptureSession {
    fn open(config: &EmitterConfig) -> Result<Self, AudioEngineError> {
        let (frames_tx, frames_rx) = crossbeam_channel::bounded::<Vec<f32>>(CAPTURE_QUEUE_FRAMES);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<u32, AudioEngineError>>(1);

        let thread = std::thread::Builder::new()
            .name("mic-capture".into())
            .spawn(move || {
                Self::input_thread(frames_tx, stop_rx, ready_tx);
            })
            .map_err(|e| AudioEngineError::StreamError(e.to_string()))?;

        // Microphone acquisition failure propagates as an initialization
        // failure for the session
        let sample_rate = ready_rx
            .recv_timeout(Duration::from_secs(5))
            .map_err(|_| AudioEngineError::WorkerGone)??;

        let detector = Arc::new(Mutex::new(SpectralDetector::new(sample_rate, config)));
        detector.lock().unwrap().start_recording();
        let worker = AnalysisWorker::spawn(Arc::clone(&detector), frames_rx);

        tracing::info!(sample_rate, "microphone capture running");
        Ok(Self {
            detector,
            worker,
            stop_tx,
            thread: Some(thread),
        })
    }

    fn input_thread(
        frames_tx: crossbeam_channel::Sender<Vec<f32>>,
        stop_rx: crossbeam_channel::Receiver<()>,
        ready_tx: crossbeam_channel::Sender<Result<u32, AudioEngineError>>,
    ) {
        let build = || -> Result<(cpal::Stream, u32), AudioEngineError> {
            let host = cpal::default_host();
            let device = host
                .default_input_device()
                .ok_or(AudioEngineError::NoInputDevice)?;
            let supported = device
                .default_input_config()
                .map_err(|e| AudioEngineError::UnsupportedConfig(e.to_string()))?;
            let sample_rate = supported.sample_rate();
            let channels = supported.channels() as usize;
            let config: cpal::StreamConfig = supported.config();

            let stream = device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        // Mono-ize on channel 0; drop the frame if the
                        // analysis queue is full rather than block the
                        // audio callback
                        let mono: Vec<f32> = data.iter().step_by(channels).copied().collect();
                        let _ = frames_tx.try_send(mono);
                    },
                    |e| tracing::error!(error = %e, "input stream error"),
                    None,
                )
                .map_err(|e| AudioEngineError::StreamError(e.to_string()))?;

            stream
                .play()
                .map_err(|e| AudioEngineError::StreamError(e.to_string()))?;
            Ok((stream, sample_rate))
        };

        match build() {
            Ok((stream, sample_rate)) => {
                let _ = ready_tx.send(Ok(sample_rate));
                let _ = stop_rx.recv();
                drop(stream);
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
            }
        }
    }

    fn shutdown(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        self.worker.stop();
    }
}

impl CaptureSession for CpalCaptureSession {
    fn clear(&mut self) {
        self.detector.lock().unwrap().clear_peaks();
    }

    fn stop_and_analyze(&mut self) -> Vec<DetectedPeak> {
        self.shutdown();
        self.detector.lock().unwrap().stop_and_analyze()
    }

    fn diagnostics(&self) -> DetectorDiagnostics {
        self.detector.lock().unwrap().diagnostics()
    }
}

impl Drop for CpalCaptureSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}
