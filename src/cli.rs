//! # Command Line Interface
//!
//! One subcommand per experiment. Flags given here override the loaded
//! configuration.

use asr_quant_bench::config::AppConfig;
use asr_quant_bench::device::DevicePreference;
use asr_quant_bench::quantization::{DynamicDType, ObserverKind};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "asr-quant-bench", version, about = "Post-training quantization benchmarks for CTC ASR models")]
pub struct Cli {
    /// Configuration file (defaults to ./quantbench.toml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Built-in preset name or path to a TOML preset
    #[arg(short, long, global = true)]
    pub preset: Option<String>,

    /// Model directory or Hugging Face Hub repository, overriding the preset
    #[arg(long, global = true)]
    pub source: Option<String>,

    /// LibriSpeech split directory
    #[arg(short, long, global = true)]
    pub data_root: Option<String>,

    /// Compute device: auto, cpu, cuda[:N] or metal[:N]
    #[arg(long, global = true)]
    pub device: Option<DevicePreference>,

    /// Report file (defaults to <output dir>/<experiment>.txt)
    #[arg(short, long, global = true)]
    pub output: Option<PathBuf>,

    /// Also write a JSON summary next to the report
    #[arg(long, global = true)]
    pub json: bool,

    /// Hide progress bars
    #[arg(long, global = true)]
    pub no_progress: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Float baseline and one mixed dynamic + static run
    Overall {
        /// Number of utterances to score
        #[arg(short = 'n', long)]
        samples: Option<usize>,
        /// Weight format for dynamic quantization
        #[arg(long)]
        dtype: Option<DynamicDType>,
    },
    /// Each module quantized alone with every allowed method
    PerLayer {
        #[arg(short = 'n', long)]
        samples: Option<usize>,
        #[arg(long)]
        dtype: Option<DynamicDType>,
    },
    /// FLOPs per second of audio for each preset module
    Flops {
        /// Index of the utterance to profile
        #[arg(long)]
        sample_index: Option<usize>,
    },
    /// Low-bit fake quantization experiments
    LowBit {
        #[command(subcommand)]
        mode: LowBitMode,
        #[arg(short = 'n', long, global = true)]
        samples: Option<usize>,
        /// Also quantize activations
        #[arg(long, global = true)]
        activations: bool,
        /// Leave weights in float (requires --activations)
        #[arg(long, global = true)]
        no_weights: bool,
        /// Range observer for the selected run
        #[arg(long, value_enum, global = true)]
        observer: Option<ObserverArg>,
    },
}

#[derive(Debug, Subcommand)]
pub enum LowBitMode {
    /// Every module group alone at 8 down to 1 bits
    Sweep,
    /// Every group at its preset bit width in a single run
    Mixed,
    /// Every group at one bit width
    Uniform {
        #[arg(short, long)]
        bits: Option<u8>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ObserverArg {
    BatchMinMax,
    ExpAvgMinMax,
}

impl From<ObserverArg> for ObserverKind {
    fn from(arg: ObserverArg) -> Self {
        match arg {
            ObserverArg::BatchMinMax => ObserverKind::BatchMinMax,
            ObserverArg::ExpAvgMinMax => ObserverKind::ExpAvgMinMax,
        }
    }
}

impl Command {
    /// Report file stem for this experiment.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Overall { .. } => "overall",
            Command::PerLayer { .. } => "per_layer",
            Command::Flops { .. } => "flops",
            Command::LowBit { mode, .. } => match mode {
                LowBitMode::Sweep => "low_bit_sweep",
                LowBitMode::Mixed => "low_bit_mixed",
                LowBitMode::Uniform { .. } => "low_bit_uniform",
            },
        }
    }
}

impl Cli {
    /// Apply command line overrides on top of the loaded configuration.
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(preset) = &self.preset {
            config.model.preset = preset.clone();
        }
        if let Some(source) = &self.source {
            config.model.source = Some(source.clone());
        }
        if let Some(root) = &self.data_root {
            config.data.root = root.clone();
        }
        if let Some(device) = self.device {
            config.model.device = device;
        }
        if self.json {
            config.output.json = true;
        }
        if self.no_progress {
            config.benchmark.show_progress = false;
        }

        match &self.command {
            Command::Overall { samples, dtype } | Command::PerLayer { samples, dtype } => {
                if let Some(n) = samples {
                    config.data.num_samples = *n;
                }
                if let Some(dtype) = dtype {
                    config.quantization.dynamic_dtype = *dtype;
                }
            }
            Command::Flops { sample_index } => {
                if let Some(index) = sample_index {
                    config.data.flops_sample_index = *index;
                }
            }
            Command::LowBit {
                mode,
                samples,
                activations,
                no_weights,
                observer,
            } => {
                if let Some(n) = samples {
                    config.data.low_bit_samples = *n;
                }
                if *activations {
                    config.quantization.quantize_activations = true;
                }
                if *no_weights {
                    config.quantization.quantize_weights = false;
                }
                match (observer, mode) {
                    (Some(observer), LowBitMode::Mixed) => config.quantization.mixed_observer = (*observer).into(),
                    (Some(observer), _) => config.quantization.low_bit_observer = (*observer).into(),
                    (None, _) => {}
                }
                if let LowBitMode::Uniform { bits: Some(bits) } = mode {
                    config.quantization.uniform_bits = *bits;
                }
            }
        }
    }

    /// Report path: `--output`, or `<output dir>/<experiment>.txt`.
    pub fn report_path(&self, config: &AppConfig) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| PathBuf::from(&config.output.dir).join(format!("{}.txt", self.command.name())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_low_bit_flags_override_config() {
        let cli = Cli::parse_from([
            "asr-quant-bench",
            "--data-root",
            "/corpora/dev-clean",
            "low-bit",
            "uniform",
            "--bits",
            "3",
            "--activations",
            "--observer",
            "batch-min-max",
        ]);
        let mut config = AppConfig::default();
        cli.apply(&mut config);

        assert_eq!(config.data.root, "/corpora/dev-clean");
        assert_eq!(config.quantization.uniform_bits, 3);
        assert!(config.quantization.quantize_activations);
        assert!(config.quantization.quantize_weights);
        assert_eq!(config.quantization.low_bit_observer, ObserverKind::BatchMinMax);
        assert_eq!(cli.report_path(&config), PathBuf::from("output/low_bit_uniform.txt"));
    }

    #[test]
    fn test_observer_flag_targets_the_selected_run() {
        let cli = Cli::parse_from(["asr-quant-bench", "low-bit", "mixed", "--observer", "exp-avg-min-max"]);
        let mut config = AppConfig::default();
        cli.apply(&mut config);

        assert_eq!(config.quantization.mixed_observer, ObserverKind::ExpAvgMinMax);
        assert_eq!(config.quantization.low_bit_observer, ObserverKind::ExpAvgMinMax);
        assert_eq!(cli.command.name(), "low_bit_mixed");

        let cli = Cli::parse_from(["asr-quant-bench", "low-bit", "sweep", "--observer", "batch-min-max"]);
        let mut config = AppConfig::default();
        cli.apply(&mut config);
        assert_eq!(config.quantization.low_bit_observer, ObserverKind::BatchMinMax);
        assert_eq!(config.quantization.mixed_observer, ObserverKind::BatchMinMax);
    }

    #[test]
    fn test_overall_flags() {
        let cli = Cli::parse_from(["asr-quant-bench", "overall", "-n", "5", "--dtype", "int4", "-o", "r.txt", "--no-progress"]);
        let mut config = AppConfig::default();
        cli.apply(&mut config);

        assert_eq!(config.data.num_samples, 5);
        assert_eq!(config.quantization.dynamic_dtype, DynamicDType::Int4);
        assert!(!config.benchmark.show_progress);
        assert_eq!(cli.report_path(&config), PathBuf::from("r.txt"));
    }

    #[test]
    fn test_device_flag_parses() {
        let cli = Cli::parse_from(["asr-quant-bench", "--device", "cuda:1", "flops", "--sample-index", "0"]);
        assert_eq!(cli.device, Some(DevicePreference::Cuda(1)));
        assert_eq!(cli.command.name(), "flops");
    }
}
