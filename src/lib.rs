//! # ASR Quantization Benchmark
//!
//! Post-training quantization harness for CTC speech recognition models.
//! Quantizes named submodules of a pretrained model (dynamic, static or
//! low-bit) and measures word error rate, real-time factor and per-module
//! FLOPs before and after.
//!
//! ## Application Architecture:
//! - **config**: harness configuration (TOML files + environment variables)
//! - **model**: addressable module graph and the CTC encoder model
//! - **quantization**: dynamic, static and low-bit quantization passes
//! - **benchmark**: WER, RTF and FLOP measurement
//! - **data / audio**: corpus loading and audio decoding
//! - **presets**: per-model module tables
//! - **experiments / report**: experiment drivers and result files
//! - **error**: custom error types

pub mod audio;        // Audio decoding and conversion
pub mod benchmark;    // WER / RTF / FLOPs
pub mod config;       // Configuration management
pub mod data;         // LibriSpeech-style corpus loading
pub mod device;       // Compute device selection
pub mod error;        // Error handling types
pub mod experiments;  // Experiment drivers
pub mod model;        // Module graph and ASR model
pub mod presets;      // Model presets
pub mod quantization; // Quantization passes
pub mod report;       // Report writing

#[cfg(test)]
pub(crate) mod testing;

pub use error::{HarnessError, HarnessResult};
