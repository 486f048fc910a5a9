//! # ASR Quantization Benchmark - Main Application Entry Point
//!
//! Command line front end for the quantization experiments.
//!
//! ## What a run does:
//! 1. Loads configuration (defaults, `quantbench.toml`, `ASRQ_*` variables, flags)
//! 2. Resolves the model preset and loads the float model
//! 3. Reads the evaluation and calibration utterances
//! 4. Runs the selected experiment and writes its report

mod cli; // Command line parsing (cli.rs)

use anyhow::{Context, Result};
use asr_quant_bench::benchmark::BenchmarkOptions;
use asr_quant_bench::config::AppConfig;
use asr_quant_bench::data::{read_transcripts, TranscriptEntry};
use asr_quant_bench::device::describe_device;
use asr_quant_bench::experiments::{self, ExperimentInputs};
use asr_quant_bench::model::loader::{load_model, ModelSource};
use asr_quant_bench::presets::{low_bit_groups, ModelPreset};
use asr_quant_bench::quantization::{QConfig, QuantizeOptions};
use asr_quant_bench::report::ReportWriter;
use clap::Parser;
use cli::{Cli, Command, LowBitMode};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenv::dotenv().ok();
    init_tracing()?;

    let cli = Cli::parse();
    let mut config = AppConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;

    info!("Starting asr-quant-bench v{}", env!("CARGO_PKG_VERSION"));
    info!("Experiment: {}", cli.command.name());

    let preset = ModelPreset::resolve(&config.model.preset)?;
    let source = config.model.source.clone().unwrap_or_else(|| preset.source.clone());
    let cache_dir = config.model.cache_dir.clone().unwrap_or_else(|| preset.savedir.clone());
    let device = config.model.device.resolve()?;
    info!("Device: {}", describe_device(&device));

    let model = load_model(&ModelSource::parse(&source, Some(PathBuf::from(cache_dir))), &device)
        .await
        .with_context(|| format!("Failed to load model from {}", source))?;

    let report_path = cli.report_path(&config);
    let json_path = config.output.json.then(|| report_path.with_extension("json"));
    let mut report = ReportWriter::new(cli.command.name(), report_path, json_path);

    let bench = BenchmarkOptions {
        warmup: config.benchmark.warmup,
        show_progress: config.benchmark.show_progress,
    };
    let quantize = QuantizeOptions {
        dtype: config.quantization.dynamic_dtype,
        qconfig: QConfig {
            observer: config.quantization.static_observer,
            ..QConfig::default()
        },
        ..QuantizeOptions::default()
    };

    match &cli.command {
        Command::Overall { .. } => {
            let inputs = ExperimentInputs::load(&config.data, config.data.num_samples)?;
            experiments::overall(&model, &preset.overall, &inputs, &quantize, &bench, &mut report)?;
        }
        Command::PerLayer { .. } => {
            let inputs = ExperimentInputs::load(&config.data, config.data.num_samples)?;
            experiments::per_layer(&model, &preset, &inputs, &quantize, &bench, &mut report)?;
        }
        Command::LowBit { mode, .. } => {
            let inputs = ExperimentInputs::load(&config.data, config.data.low_bit_samples)?;
            let groups = low_bit_groups(model.config());
            let low_bit = config
                .quantization
                .low_bit_options(matches!(mode, LowBitMode::Mixed));
            info!("Low-bit observer: {:?}", low_bit.observer);
            match mode {
                LowBitMode::Sweep => experiments::low_bit_sweep(&model, &groups, &inputs, &low_bit, &mut report)?,
                LowBitMode::Mixed => experiments::low_bit_mixed(
                    &model,
                    &groups,
                    &preset.mixed_bits,
                    &inputs,
                    &low_bit,
                    &mut report,
                )?,
                LowBitMode::Uniform { .. } => experiments::low_bit_uniform(
                    &model,
                    &groups,
                    config.quantization.uniform_bits,
                    &inputs,
                    &low_bit,
                    &mut report,
                )?,
            }
        }
        Command::Flops { .. } => {
            let entry = flops_entry(Path::new(&config.data.root), config.data.flops_sample_index)?;
            let utterance = entry.load()?;
            info!("Counting FLOPs on utterance {}", utterance.id);
            experiments::flop_analysis(&model, &preset, &utterance.audio)?;
            return Ok(());
        }
    }

    info!(
        "Wrote {} result(s) to {}",
        report.entries().len(),
        report.path().display()
    );
    Ok(())
}

/// Set up structured logging; `RUST_LOG` overrides the default filter.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "asr_quant_bench=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}

fn flops_entry(root: &Path, index: usize) -> Result<TranscriptEntry> {
    let entries = read_transcripts(root).with_context(|| format!("Failed to read corpus at {}", root.display()))?;
    let count = entries.len();
    entries
        .into_iter()
        .nth(index)
        .with_context(|| format!("FLOP sample index {} out of range ({} utterances)", index, count))
}
