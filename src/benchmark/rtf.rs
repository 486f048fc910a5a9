//! Real-time factor: model processing time divided by audio duration.
//! Values below 1.0 mean faster than real time.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Duration in seconds of `samples` samples at `sample_rate` Hz.
pub fn audio_duration_secs(samples: usize, sample_rate: u32) -> f64 {
    samples as f64 / sample_rate as f64
}

/// Accumulates processing time and audio duration over many utterances.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RtfMeter {
    processing_secs: f64,
    audio_secs: f64,
    utterances: usize,
}

impl RtfMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, processing: Duration, audio_secs: f64) {
        self.processing_secs += processing.as_secs_f64();
        self.audio_secs += audio_secs;
        self.utterances += 1;
    }

    pub fn processing_secs(&self) -> f64 {
        self.processing_secs
    }

    pub fn audio_secs(&self) -> f64 {
        self.audio_secs
    }

    pub fn utterances(&self) -> usize {
        self.utterances
    }

    /// Total processing time over total audio time; 0 when nothing was measured.
    pub fn rtf(&self) -> f64 {
        if self.audio_secs > 0.0 {
            self.processing_secs / self.audio_secs
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_at_16k() {
        assert_eq!(audio_duration_secs(16_000, 16_000), 1.0);
        assert_eq!(audio_duration_secs(8_000, 16_000), 0.5);
    }

    #[test]
    fn test_rtf_is_ratio_of_totals() {
        let mut meter = RtfMeter::new();
        meter.add(Duration::from_millis(500), 1.0);
        meter.add(Duration::from_millis(100), 3.0);
        assert!((meter.rtf() - 0.15).abs() < 1e-9);
        assert_eq!(meter.utterances(), 2);
    }

    #[test]
    fn test_empty_meter() {
        assert_eq!(RtfMeter::new().rtf(), 0.0);
    }
}
