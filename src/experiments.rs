//! # Experiment Drivers
//!
//! Each experiment starts from the loaded float model, copies it for every
//! configuration it measures, and records one report entry per run.
//!
//! ## Experiments:
//! - **overall**: float baseline, then one mixed dynamic + static run
//! - **per_layer**: float baseline, then each module alone, dynamic and static
//! - **flop_analysis**: FLOPs per second of audio for each preset module
//! - **low_bit_sweep**: each module group at 8 down to 1 bits
//! - **low_bit_mixed**: every group at its own bit width in a single run
//! - **low_bit_uniform**: every group at one bit width

use crate::benchmark::{benchmark, count_flops, BenchmarkOptions};
use crate::config::DataConfig;
use crate::data::{load_entries, random_choice, read_transcripts, Utterance};
use crate::model::{EncoderAsr, QuantizableModel};
use crate::presets::{GroupBits, LowBitGroup, ModelPreset, OverallPlan, QuantMethod};
use crate::quantization::{
    custom_quantize, low_bit_benchmark, low_bit_benchmark_groups, measure_wer, CandleBackend, LowBitOptions,
    QuantizeOptions,
};
use crate::report::{ReportEntry, ReportWriter};
use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

pub const BASELINE_LABEL: &str = "Original Model";

/// Audio and references scored by an experiment, plus calibration audio.
#[derive(Debug, Clone, Default)]
pub struct ExperimentInputs {
    pub samples: Vec<Vec<f32>>,
    pub references: Vec<String>,
    pub calibration: Vec<Vec<f32>>,
}

impl ExperimentInputs {
    pub fn new(evaluation: Vec<Utterance>, calibration: Vec<Utterance>) -> Self {
        let (samples, references) = evaluation.into_iter().map(|u| (u.audio, u.reference)).unzip();
        Self {
            samples,
            references,
            calibration: calibration.into_iter().map(|u| u.audio).collect(),
        }
    }

    /// Read the corpus: the first `n` utterances are scored, calibration
    /// utterances are drawn from the whole corpus with a fixed seed.
    pub fn load(data: &DataConfig, n: usize) -> Result<Self> {
        let entries = read_transcripts(Path::new(&data.root))
            .with_context(|| format!("Failed to read corpus at {}", data.root))?;
        if entries.is_empty() {
            bail!("Corpus at {} has no utterances", data.root);
        }

        let evaluation = load_entries(&entries[..n.min(entries.len())])?;
        let calibration = load_entries(&random_choice(&entries, data.calibration_samples, data.seed)?)?;
        info!(
            "Loaded {} evaluation and {} calibration utterances",
            evaluation.len(),
            calibration.len()
        );
        Ok(Self::new(evaluation, calibration))
    }
}

fn record_benchmark<M>(
    model: &M,
    label: &str,
    inputs: &ExperimentInputs,
    options: &BenchmarkOptions,
    report: &mut ReportWriter,
) -> Result<()>
where
    M: QuantizableModel + ?Sized,
{
    let result = benchmark(model, &inputs.samples, &inputs.references, options)
        .with_context(|| format!("Benchmark failed for '{}'", label))?;
    report.record(ReportEntry::new(label, result.wer, Some(result.rtf)))?;
    Ok(())
}

/// Float baseline, then the preset's combined dynamic + static plan.
pub fn overall<M>(
    model: &M,
    plan: &OverallPlan,
    inputs: &ExperimentInputs,
    quantize: &QuantizeOptions,
    options: &BenchmarkOptions,
    report: &mut ReportWriter,
) -> Result<()>
where
    M: QuantizableModel + Clone,
{
    record_benchmark(model, BASELINE_LABEL, inputs, options, report)?;

    let mut quantized = model.clone();
    custom_quantize(
        &mut quantized,
        Some(plan.dynamic.as_slice()),
        Some(plan.static_modules.as_slice()),
        Some(inputs.calibration.as_slice()),
        quantize,
        &CandleBackend,
    )
    .context("Mixed quantization failed")?;
    record_benchmark(&quantized, &plan.label, inputs, options, report)
}

/// Float baseline, then every module quantized on its own with each
/// method the preset allows for it.
pub fn per_layer<M>(
    model: &M,
    preset: &ModelPreset,
    inputs: &ExperimentInputs,
    quantize: &QuantizeOptions,
    options: &BenchmarkOptions,
    report: &mut ReportWriter,
) -> Result<()>
where
    M: QuantizableModel + Clone,
{
    record_benchmark(model, BASELINE_LABEL, inputs, options, report)?;

    for module in preset.modules_with(QuantMethod::Dynamic) {
        let mut quantized = model.clone();
        let modules = [module.clone()];
        custom_quantize(&mut quantized, Some(modules.as_slice()), None, None, quantize, &CandleBackend)
            .with_context(|| format!("Dynamic quantization of {} failed", module))?;
        record_benchmark(&quantized, &format!("{} (dynamic)", module), inputs, options, report)?;
    }

    for module in preset.modules_with(QuantMethod::Static) {
        let mut quantized = model.clone();
        let modules = [module.clone()];
        custom_quantize(
            &mut quantized,
            None,
            Some(modules.as_slice()),
            Some(inputs.calibration.as_slice()),
            quantize,
            &CandleBackend,
        )
        .with_context(|| format!("Static quantization of {} failed", module))?;
        record_benchmark(&quantized, &format!("{} (static)", module), inputs, options, report)?;
    }
    Ok(())
}

/// FLOPs per second of audio for each preset module, printed to stdout.
pub fn flop_analysis(model: &EncoderAsr, preset: &ModelPreset, sample: &[f32]) -> Result<BTreeMap<String, f64>> {
    let flops = count_flops(model, &preset.module_paths(), sample).context("FLOP counting failed")?;
    println!("{}", preset.source);
    for (module, value) in &flops {
        println!("{}: {}", module, value);
    }
    println!();
    Ok(flops)
}

/// Every group alone at 8, 7, …, 1 bits.
pub fn low_bit_sweep<M>(
    model: &M,
    groups: &[LowBitGroup],
    inputs: &ExperimentInputs,
    options: &LowBitOptions,
    report: &mut ReportWriter,
) -> Result<()>
where
    M: QuantizableModel + Clone,
{
    for group in groups {
        for bits in (1..=8u8).rev() {
            let mut quantized = model.clone();
            let wer = low_bit_benchmark(
                &mut quantized,
                &group.layers,
                bits,
                &inputs.samples,
                &inputs.references,
                &inputs.calibration,
                options,
            )
            .with_context(|| format!("{}-bit quantization of {} failed", bits, group.module))?;
            report.record(ReportEntry::sweep(group.module.as_str(), bits, wer))?;
        }
    }
    Ok(())
}

fn short_name(module: &str) -> &str {
    module.rsplit('.').next().unwrap_or(module)
}

/// Float baseline, then all groups at once, each at its configured width.
/// Groups without a configured width stay in float.
pub fn low_bit_mixed<M>(
    model: &M,
    groups: &[LowBitGroup],
    widths: &[GroupBits],
    inputs: &ExperimentInputs,
    options: &LowBitOptions,
    report: &mut ReportWriter,
) -> Result<()>
where
    M: QuantizableModel + Clone,
{
    let baseline = measure_wer(model, &inputs.samples, &inputs.references)?;
    report.record(ReportEntry::new(BASELINE_LABEL, baseline, None))?;

    let mut plan = Vec::new();
    let mut parts = Vec::new();
    for group in groups {
        if let Some(width) = widths.iter().find(|w| w.module == group.module) {
            plan.push((group.layers.clone(), width.bits));
            parts.push(format!("{} {}", width.bits, short_name(&group.module)));
        }
    }
    if plan.is_empty() {
        bail!("No bit widths configured for any low-bit module group");
    }

    let mut quantized = model.clone();
    let wer = low_bit_benchmark_groups(
        &mut quantized,
        &plan,
        &inputs.samples,
        &inputs.references,
        &inputs.calibration,
        options,
    )
    .context("Mixed resolution quantization failed")?;
    let label = format!("Mixed resolution quantization ({})", parts.join(" "));
    report.record(ReportEntry::new(label, wer, None))?;
    Ok(())
}

/// Every layer of every group at `bits`.
pub fn low_bit_uniform<M>(
    model: &M,
    groups: &[LowBitGroup],
    bits: u8,
    inputs: &ExperimentInputs,
    options: &LowBitOptions,
    report: &mut ReportWriter,
) -> Result<()>
where
    M: QuantizableModel + Clone,
{
    let layers: Vec<String> = groups.iter().flat_map(|g| g.layers.iter().cloned()).collect();
    let mut quantized = model.clone();
    let wer = low_bit_benchmark(
        &mut quantized,
        &layers,
        bits,
        &inputs.samples,
        &inputs.references,
        &inputs.calibration,
        options,
    )
    .with_context(|| format!("Uniform {}-bit quantization failed", bits))?;
    report.record(ReportEntry::new(format!("Uniform {} Bit Quantization", bits), wer, None))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::get_module;
    use crate::model::ModuleKind;
    use crate::presets::low_bit_groups;
    use crate::testing::{tiny_config, tiny_model};
    use tempfile::TempDir;

    fn inputs() -> ExperimentInputs {
        let samples: Vec<Vec<f32>> = (0..3)
            .map(|k| (0..1600).map(|i| ((i * (k + 2)) % 23) as f32 / 23.0 - 0.5).collect())
            .collect();
        ExperimentInputs {
            references: vec!["a b".to_string(), "c".to_string(), "d e f".to_string()],
            calibration: samples[..2].to_vec(),
            samples,
        }
    }

    fn quiet() -> BenchmarkOptions {
        BenchmarkOptions {
            warmup: 1,
            show_progress: false,
        }
    }

    fn report(dir: &TempDir) -> ReportWriter {
        ReportWriter::new("test", dir.path().join("report.txt"), None)
    }

    #[test]
    fn test_overall_records_baseline_and_mixed_run() {
        let dir = TempDir::new().unwrap();
        let mut writer = report(&dir);
        let model = tiny_model();
        let plan = ModelPreset::wav2vec2().overall;

        overall(&model, &plan, &inputs(), &QuantizeOptions::default(), &quiet(), &mut writer).unwrap();

        let labels: Vec<&str> = writer.entries().iter().map(|e| e.label.as_str()).collect();
        assert_eq!(labels, vec![BASELINE_LABEL, plan.label.as_str()]);
        assert!(writer.entries().iter().all(|e| e.rtf.is_some()));
        // the float model handed in is left untouched
        assert_eq!(
            get_module(model.mods(), "encoder.enc.linear1.w").unwrap().kind(),
            ModuleKind::Linear
        );
    }

    #[test]
    fn test_per_layer_runs_every_allowed_method() {
        let dir = TempDir::new().unwrap();
        let mut writer = report(&dir);
        let preset = ModelPreset::wav2vec2();

        per_layer(&tiny_model(), &preset, &inputs(), &QuantizeOptions::default(), &quiet(), &mut writer).unwrap();

        let expected = 1 + preset.modules_with(QuantMethod::Dynamic).len() + preset.modules_with(QuantMethod::Static).len();
        assert_eq!(writer.entries().len(), expected);
        assert_eq!(
            writer.entries().last().unwrap().label,
            "encoder.wav2vec2.model.feature_extractor (static)"
        );
    }

    #[test]
    fn test_low_bit_sweep_covers_every_width() {
        let dir = TempDir::new().unwrap();
        let mut writer = report(&dir);
        let groups = low_bit_groups(&tiny_config());

        low_bit_sweep(&tiny_model(), &groups[..1], &inputs(), &LowBitOptions::default(), &mut writer).unwrap();

        let bits: Vec<u8> = writer.entries().iter().filter_map(|e| e.bits).collect();
        assert_eq!(bits, vec![8, 7, 6, 5, 4, 3, 2, 1]);
        assert!(writer.entries().iter().all(|e| e.label == "encoder.enc"));
    }

    #[test]
    fn test_low_bit_mixed_label_and_baseline() {
        let dir = TempDir::new().unwrap();
        let mut writer = report(&dir);
        let groups = low_bit_groups(&tiny_config());
        let widths = ModelPreset::wav2vec2().mixed_bits;

        low_bit_mixed(&tiny_model(), &groups, &widths, &inputs(), &LowBitOptions::default(), &mut writer).unwrap();

        let entries = writer.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].label, BASELINE_LABEL);
        assert_eq!(
            entries[1].label,
            "Mixed resolution quantization (6 layers 3 feature_projection 5 feature_extractor)"
        );
    }

    #[test]
    fn test_low_bit_mixed_without_widths_fails() {
        let dir = TempDir::new().unwrap();
        let mut writer = report(&dir);
        let groups = low_bit_groups(&tiny_config());
        assert!(low_bit_mixed(&tiny_model(), &groups, &[], &inputs(), &LowBitOptions::default(), &mut writer).is_err());
    }

    #[test]
    fn test_low_bit_uniform_single_entry() {
        let dir = TempDir::new().unwrap();
        let mut writer = report(&dir);
        let groups = low_bit_groups(&tiny_config());

        low_bit_uniform(&tiny_model(), &groups, 4, &inputs(), &LowBitOptions::default(), &mut writer).unwrap();

        let text = std::fs::read_to_string(writer.path()).unwrap();
        assert!(text.starts_with("Uniform 4 Bit Quantization\nWER(%): "));
    }

    #[test]
    fn test_flop_analysis_skips_nothing_for_wav2vec2_modules() {
        let flops = flop_analysis(&tiny_model(), &ModelPreset::wav2vec2(), &vec![0.2; 16_000]).unwrap();
        assert_eq!(flops.len(), ModelPreset::wav2vec2().modules.len());
        assert!(flops.values().all(|v| *v > 0.0));
    }
}
