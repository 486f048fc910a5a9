//! # Audio Processing and Validation
//!
//! Converts decoded PCM into the representation the model consumes and
//! checks that it meets the model's format requirements.
//!
//! ## Key Functions:
//! - **Format validation**: sample rate must match the model, at least one channel
//! - **Format conversion**: integer PCM of any supported depth to float in [-1.0, 1.0]
//! - **Downmixing**: interleaved multi-channel audio to mono

use crate::error::{HarnessError, HarnessResult};

/// Audio format information read from a file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

/// Audio validation and conversion utilities.
///
/// ## Purpose:
/// Every utterance fed to the model must be mono float audio at the model's
/// sample rate. Resampling is not supported, so a mismatched rate is an error.
#[derive(Debug, Clone, Copy)]
pub struct AudioProcessor {
    sample_rate: u32,
}

impl AudioProcessor {
    /// Create a processor expecting audio at `sample_rate`.
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Validate a decoded stream's declared format.
    ///
    /// ## Returns:
    /// - **Ok(())**: format is usable
    /// - **Err(HarnessError::Data)**: rate mismatch or zero channels
    pub fn validate_format(&self, format: &AudioFormat) -> HarnessResult<()> {
        if format.sample_rate != self.sample_rate {
            return Err(HarnessError::Data(format!(
                "Sample rate mismatch: expected {}, got {}",
                self.sample_rate, format.sample_rate
            )));
        }
        if format.channels == 0 {
            return Err(HarnessError::Data("Audio has no channels".to_string()));
        }
        Ok(())
    }

    /// Convert 16-bit PCM samples to 32-bit float format.
    ///
    /// ## Conversion:
    /// Scales from [-32768, 32767] to [-1.0, 1.0].
    pub fn pcm16_to_float(&self, samples: &[i16]) -> Vec<f32> {
        samples.iter().map(|&sample| sample as f32 / 32768.0).collect()
    }

    /// Convert unsigned 8-bit PCM (centered on 128) to float.
    pub fn pcm8_to_float(&self, samples: &[u8]) -> Vec<f32> {
        samples.iter().map(|&sample| (sample as f32 - 128.0) / 128.0).collect()
    }

    /// Convert 24-bit PCM stored in `i32` to float.
    pub fn pcm24_to_float(&self, samples: &[i32]) -> Vec<f32> {
        samples.iter().map(|&sample| sample as f32 / 8_388_608.0).collect()
    }

    /// Average interleaved channels into one.
    ///
    /// A trailing partial frame is dropped.
    pub fn downmix(&self, interleaved: &[f32], channels: usize) -> Vec<f32> {
        if channels <= 1 {
            return interleaved.to_vec();
        }
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_validation() {
        let processor = AudioProcessor::new(16_000);
        let ok = AudioFormat {
            sample_rate: 16_000,
            channels: 1,
            bits_per_sample: 16,
        };
        assert!(processor.validate_format(&ok).is_ok());

        let resampled = AudioFormat {
            sample_rate: 44_100,
            ..ok
        };
        let err = processor.validate_format(&resampled).unwrap_err();
        assert!(err.to_string().contains("expected 16000, got 44100"));

        let silent = AudioFormat { channels: 0, ..ok };
        assert!(processor.validate_format(&silent).is_err());
    }

    #[test]
    fn test_pcm_conversion() {
        let processor = AudioProcessor::new(16_000);
        let floats = processor.pcm16_to_float(&[0, 16384, -16384, -32768]);
        assert_eq!(floats, vec![0.0, 0.5, -0.5, -1.0]);

        assert_eq!(processor.pcm8_to_float(&[128, 0, 192]), vec![0.0, -1.0, 0.5]);
        assert_eq!(processor.pcm24_to_float(&[4_194_304]), vec![0.5]);
    }

    #[test]
    fn test_downmix() {
        let processor = AudioProcessor::new(16_000);
        let stereo = [1.0, 0.0, 0.5, 0.5, -1.0, 1.0, 0.25];
        assert_eq!(processor.downmix(&stereo, 2), vec![0.5, 0.5, 0.0]);
        assert_eq!(processor.downmix(&[0.1, 0.2], 1), vec![0.1, 0.2]);
    }
}
