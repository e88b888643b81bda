//! Audio processing module
//!
//! This module contains the acoustic side of the verification flow:
//! - Pattern alphabet and random pattern generation ([`pattern`])
//! - FSK pulse scheduling and envelope shaping ([`emitter`])
//! - Highpass output filtering ([`filter`])
//! - Spectral peak detection with an adaptive noise floor ([`detector`])
//! - cpal device management and stream handling ([`engine`])
//! - Simulated acoustic channel for tests and the demo binary ([`loopback`])

pub mod detector;
pub mod emitter;
pub mod engine;
pub mod filter;
pub mod loopback;
pub mod pattern;
