//! # Benchmarking
//!
//! Accuracy and latency measurement for (possibly quantized) models.
//!
//! ## Key Components:
//! - **wer**: word error rate with an edit-distance alignment
//! - **rtf**: real-time factor accumulation
//! - **flops**: per-module FLOP counts
//! - **benchmark()**: warm up, then transcribe every sample timing the encoder
//!
//! ## Benchmark Flow:
//! 1. Transcribe the first `warmup` samples untimed (caches, allocator)
//! 2. Transcribe every sample, timing the encoder forward only
//! 3. `WER` over all hypotheses, `RTF = Σ encoder time / Σ audio duration`

pub mod flops;
pub mod rtf;
pub mod wer;

pub use flops::{count_flops, FlopCounter};
pub use rtf::{audio_duration_secs, RtfMeter};
pub use wer::{compute_wer, compute_wer_stats, edit_distance, WerStats};

use crate::audio::SAMPLE_RATE;
use crate::error::{HarnessError, HarnessResult};
use crate::model::Transcriber;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Knobs for [`benchmark`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkOptions {
    /// Number of leading samples transcribed untimed before measuring
    pub warmup: usize,
    /// Draw progress bars on stderr
    pub show_progress: bool,
}

impl Default for BenchmarkOptions {
    fn default() -> Self {
        Self {
            warmup: 10,
            show_progress: true,
        }
    }
}

/// Outcome of one benchmark run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkResult {
    /// Word error rate in percent
    pub wer: f64,
    /// Encoder time over audio duration
    pub rtf: f64,
    pub stats: WerStats,
    pub encoder_secs: f64,
    pub audio_secs: f64,
}

fn progress_bar(len: usize, label: &str, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} {msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-");
    pb.set_style(style);
    pb.set_message(label.to_string());
    pb
}

/// Measure WER and RTF of `model` on `samples`.
///
/// ## Parameters:
/// - **model**: anything that can transcribe 16 kHz audio
/// - **samples**: mono audio, one vector per utterance
/// - **references**: ground-truth transcripts, one per sample
///
/// ## Returns:
/// - **Ok(BenchmarkResult)**: WER (%) and RTF
/// - **Err**: mismatched inputs or a failed transcription
pub fn benchmark<M, R>(
    model: &M,
    samples: &[Vec<f32>],
    references: &[R],
    options: &BenchmarkOptions,
) -> HarnessResult<BenchmarkResult>
where
    M: Transcriber + ?Sized,
    R: AsRef<str>,
{
    if samples.len() != references.len() {
        return Err(HarnessError::Metric(
            "Number of references is not equal to the number of hypotheses".to_string(),
        ));
    }

    let warmup = &samples[..options.warmup.min(samples.len())];
    let pb = progress_bar(warmup.len(), "warming up", options.show_progress);
    for sample in warmup {
        model.timed_transcribe(sample)?;
        pb.inc(1);
    }
    pb.finish_and_clear();

    let mut meter = RtfMeter::new();
    let mut hypotheses = Vec::with_capacity(samples.len());
    let pb = progress_bar(samples.len(), "evaluating", options.show_progress);
    for sample in samples {
        let (text, encoder_time) = model.timed_transcribe(sample)?;
        meter.add(encoder_time, audio_duration_secs(sample.len(), SAMPLE_RATE));
        hypotheses.push(text);
        pb.inc(1);
    }
    pb.finish_and_clear();

    let stats = compute_wer_stats(references, &hypotheses)?;
    let result = BenchmarkResult {
        wer: stats.wer(),
        rtf: meter.rtf(),
        stats,
        encoder_secs: meter.processing_secs(),
        audio_secs: meter.audio_secs(),
    };
    info!(
        "Benchmarked {} utterances ({:.1}s audio): WER {:.2}%, RTF {:.4}",
        samples.len(),
        result.audio_secs,
        result.wer,
        result.rtf
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTranscriber;

    fn quiet(warmup: usize) -> BenchmarkOptions {
        BenchmarkOptions {
            warmup,
            show_progress: false,
        }
    }

    #[test]
    fn test_warmup_is_not_scored() {
        let model = ScriptedTranscriber::new(vec![(16_000, "hello world"), (32_000, "good bye")], 0.25);
        let samples = vec![vec![0.0; 16_000], vec![0.0; 32_000]];
        let references = vec!["hello world", "good night"];

        let result = benchmark(&model, &samples, &references, &quiet(1)).unwrap();

        // 1 warm-up call + 2 measured calls
        assert_eq!(model.calls(), 3);
        assert!((result.wer - 25.0).abs() < 1e-9);
        assert_eq!(result.audio_secs, 3.0);
        // 0.25 s of encoder time per call, 2 measured calls over 3 s
        assert!((result.rtf - 0.5 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_warmup_longer_than_corpus() {
        let model = ScriptedTranscriber::new(vec![(1_600, "a")], 0.1);
        let samples = vec![vec![0.0; 1_600]];
        let result = benchmark(&model, &samples, &["a"], &quiet(10)).unwrap();
        assert_eq!(model.calls(), 2);
        assert_eq!(result.wer, 0.0);
    }

    #[test]
    fn test_mismatched_inputs_fail_before_transcribing() {
        let model = ScriptedTranscriber::new(vec![(1_600, "a")], 0.1);
        let samples = vec![vec![0.0; 1_600]];
        assert!(benchmark(&model, &samples, &["a", "b"], &quiet(0)).is_err());
        assert_eq!(model.calls(), 0);
    }
}
