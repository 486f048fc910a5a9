//! # Configuration Management
//!
//! This module handles loading harness configuration from multiple sources:
//! - TOML configuration files (`quantbench.toml`, or the file passed with `--config`)
//! - Environment variables (with `ASRQ_` prefix, `__` between nested keys)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Command line flags (applied by the CLI after loading)
//! 2. Environment variables (`ASRQ_DATA__ROOT`, `ASRQ_MODEL__DEVICE`, etc.)
//! 3. Configuration file
//! 4. Default values (defined in the Default impl)

use crate::device::DevicePreference;
use crate::quantization::{DynamicDType, LowBitOptions, ObserverKind};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main harness configuration that contains all settings.
///
/// ## Why separate config structs:
/// Breaking configuration into logical groups (model, data, benchmark,
/// quantization, output) keeps each experiment's knobs easy to find.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub model: ModelConfig,
    pub data: DataConfig,
    pub benchmark: BenchmarkConfig,
    pub quantization: QuantizationConfig,
    pub output: OutputConfig,
}

/// Which model to load and where to run it.
///
/// ## Fields:
/// - `preset`: built-in preset name (`wav2vec2`) or path to a TOML preset
/// - `source`: overrides the preset's source (local directory or hub repo id)
/// - `cache_dir`: overrides the preset's download directory
/// - `device`: `auto`, `cpu`, `cuda[:N]` or `metal[:N]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub preset: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub cache_dir: Option<String>,
    pub device: DevicePreference,
}

/// Evaluation corpus and sampling.
///
/// ## Fields:
/// - `root`: LibriSpeech split directory (`.../LibriSpeech/dev-clean`)
/// - `num_samples`: utterances scored by the float / dynamic / static experiments
/// - `low_bit_samples`: utterances scored by the low-bit experiments
/// - `calibration_samples`: utterances drawn (with replacement) for calibration
/// - `seed`: seed for the calibration draw
/// - `flops_sample_index`: utterance used for FLOP counting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    pub root: String,
    pub num_samples: usize,
    pub low_bit_samples: usize,
    pub calibration_samples: usize,
    pub seed: u64,
    pub flops_sample_index: usize,
}

/// Benchmark loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    pub warmup: usize,
    pub show_progress: bool,
}

/// Quantization settings shared by the experiments.
///
/// ## Fields:
/// - `dynamic_dtype`: weight format for dynamic quantization
/// - `static_observer`: range observer for static quantization
/// - `low_bit_observer`: range observer for the low-bit sweep and uniform runs
/// - `mixed_observer`: range observer for the mixed-resolution low-bit run
/// - `quantize_weights` / `quantize_activations`: what low-bit wrappers quantize
/// - `uniform_bits`: bit width of the uniform low-bit experiment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizationConfig {
    pub dynamic_dtype: DynamicDType,
    pub static_observer: ObserverKind,
    pub low_bit_observer: ObserverKind,
    #[serde(default = "default_mixed_observer")]
    pub mixed_observer: ObserverKind,
    pub quantize_weights: bool,
    pub quantize_activations: bool,
    pub uniform_bits: u8,
}

fn default_mixed_observer() -> ObserverKind {
    ObserverKind::BatchMinMax
}

impl QuantizationConfig {
    /// Low-bit wrapper settings for one experiment.
    pub fn low_bit_options(&self, mixed: bool) -> LowBitOptions {
        LowBitOptions {
            quantize_weights: self.quantize_weights,
            quantize_activations: self.quantize_activations,
            observer: if mixed { self.mixed_observer } else { self.low_bit_observer },
        }
    }
}

/// Where reports go.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub dir: String,
    /// Also write a JSON summary next to each text report
    pub json: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig {
                preset: "wav2vec2".to_string(),
                source: None,
                cache_dir: None,
                device: DevicePreference::Cpu,
            },
            data: DataConfig {
                root: "librispeech_dev_clean/LibriSpeech/dev-clean".to_string(),
                num_samples: 100,
                low_bit_samples: 20,
                calibration_samples: 10,
                seed: 1337,
                flops_sample_index: 1,
            },
            benchmark: BenchmarkConfig {
                warmup: 10,
                show_progress: true,
            },
            quantization: QuantizationConfig {
                dynamic_dtype: DynamicDType::Int8,
                static_observer: ObserverKind::MinMax,
                low_bit_observer: ObserverKind::ExpAvgMinMax,
                mixed_observer: default_mixed_observer(),
                quantize_weights: true,
                quantize_activations: false,
                uniform_bits: 4,
            },
            output: OutputConfig {
                dir: "output".to_string(),
                json: false,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with `path` if given (must exist), else `quantbench.toml` if present
    /// 3. Override with environment variables prefixed with `ASRQ_`
    ///
    /// ## Environment Variable Examples:
    /// - `ASRQ_DATA__ROOT=/data/LibriSpeech/dev-clean`
    /// - `ASRQ_DATA__NUM_SAMPLES=20`
    /// - `ASRQ_MODEL__DEVICE=cuda`
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder().add_source(config::Config::try_from(&AppConfig::default())?);

        builder = match path {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder.add_source(config::File::with_name("quantbench").required(false)),
        };

        let config: AppConfig = builder
            .add_source(
                config::Environment::with_prefix("ASRQ")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Sample counts are non-zero
    /// - Warm-up does not exceed the evaluation subset
    /// - The uniform bit width is between 1 and 8
    pub fn validate(&self) -> Result<()> {
        if self.data.num_samples == 0 || self.data.low_bit_samples == 0 {
            return Err(anyhow::anyhow!("Evaluation sample counts must be greater than 0"));
        }

        if self.data.calibration_samples == 0 {
            return Err(anyhow::anyhow!("Calibration sample count must be greater than 0"));
        }

        if self.benchmark.warmup > self.data.num_samples {
            return Err(anyhow::anyhow!(
                "Warm-up ({}) cannot exceed the number of evaluation samples ({})",
                self.benchmark.warmup,
                self.data.num_samples
            ));
        }

        if !(1..=8).contains(&self.quantization.uniform_bits) {
            return Err(anyhow::anyhow!(
                "Uniform bit width must be between 1 and 8, got {}",
                self.quantization.uniform_bits
            ));
        }

        if !self.quantization.quantize_weights && !self.quantization.quantize_activations {
            return Err(anyhow::anyhow!("At least one of weights or activations must be quantized"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.model.preset, "wav2vec2");
        assert_eq!(config.data.num_samples, 100);
        assert_eq!(config.data.seed, 1337);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.data.calibration_samples = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.benchmark.warmup = 200;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.quantization.uniform_bits = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.quantization.quantize_weights = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bench.toml");
        std::fs::write(
            &path,
            r#"
            [data]
            root = "/corpora/dev-clean"
            num_samples = 20

            [quantization]
            dynamic_dtype = "int4"
            low_bit_observer = "batch_min_max"

            [model]
            device = "auto"
            source = "models/local"
            "#,
        )
        .unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.data.root, "/corpora/dev-clean");
        assert_eq!(config.data.num_samples, 20);
        // untouched values keep their defaults
        assert_eq!(config.data.calibration_samples, 10);
        assert_eq!(config.quantization.dynamic_dtype, DynamicDType::Int4);
        assert_eq!(config.quantization.low_bit_observer, ObserverKind::BatchMinMax);
        assert_eq!(config.model.device, DevicePreference::Auto);
        assert_eq!(config.model.source.as_deref(), Some("models/local"));
        assert_eq!(config.model.cache_dir, None);
    }

    #[test]
    fn test_mixed_run_has_its_own_observer() {
        let quantization = AppConfig::default().quantization;
        assert_eq!(quantization.low_bit_options(true).observer, ObserverKind::BatchMinMax);
        assert_eq!(quantization.low_bit_options(false).observer, ObserverKind::ExpAvgMinMax);

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bench.toml");
        std::fs::write(
            &path,
            r#"
            [quantization]
            mixed_observer = "exp_avg_min_max"
            quantize_activations = true
            "#,
        )
        .unwrap();
        let options = AppConfig::load(Some(&path)).unwrap().quantization.low_bit_options(true);
        assert_eq!(options.observer, ObserverKind::ExpAvgMinMax);
        assert!(options.quantize_activations && options.quantize_weights);
    }

    #[test]
    fn test_missing_explicit_file_fails() {
        assert!(AppConfig::load(Some(Path::new("/nonexistent/bench.toml"))).is_err());
    }
}
