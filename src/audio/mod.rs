//! # Audio Module
//!
//! Loads evaluation audio from disk into the format the model consumes.
//!
//! ## Key Components:
//! - **decode**: WAV and FLAC file decoding
//! - **processor**: format validation, PCM conversion, downmixing
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 16kHz (16,000 Hz), no resampling
//! - **Channels**: Mono (multi-channel input is averaged)
//! - **Samples**: `f32` in [-1.0, 1.0]

pub mod decode;      // File decoding (wav / symphonia)
pub mod processor;   // Format validation and conversion

pub use decode::load_audio;
pub use processor::{AudioFormat, AudioProcessor};

/// Sample rate every model input is expected at.
pub const SAMPLE_RATE: u32 = 16_000;
