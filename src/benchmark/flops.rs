//! # FLOP Counting
//!
//! Per-module floating-point operation counts, used to rank modules by cost
//! before choosing what to quantize.
//!
//! ## How It Works:
//! 1. The encoder runs once with a [`FlopCounter`] attached to the forward context
//! 2. Each leaf records its FLOPs against the current scope
//! 3. The count is added to the scope and every enclosing prefix, so a
//!    container's total is the sum of everything below it
//! 4. Requested paths are looked up and divided by the audio duration

use crate::error::{HarnessError, HarnessResult};
use crate::model::{EncoderAsr, ForwardCtx};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Only paths below the acoustic encoder are counted.
const ENCODER_PREFIX: &str = "encoder.";

/// FLOPs accumulated by module path (relative to the counted module).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlopCounter {
    by_module: BTreeMap<String, u64>,
}

impl FlopCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `flops` to the scope and all of its prefixes (the root is `""`).
    pub fn record(&mut self, scope: &[String], flops: u64) {
        for depth in 0..=scope.len() {
            *self.by_module.entry(scope[..depth].join(".")).or_default() += flops;
        }
    }

    pub fn get(&self, path: &str) -> Option<u64> {
        self.by_module.get(path).copied()
    }

    pub fn total(&self) -> u64 {
        self.get("").unwrap_or(0)
    }

    pub fn by_module(&self) -> &BTreeMap<String, u64> {
        &self.by_module
    }
}

/// FLOPs per second of audio for each requested module under `encoder.`.
///
/// ## Parameters:
/// - **model**: the model to profile (its encoder runs once)
/// - **modules**: dotted paths relative to the model's module root
/// - **sample**: one utterance of 16 kHz audio
///
/// ## Returns:
/// - **Ok(map)**: path → FLOPs per second; paths outside `encoder.` are skipped
/// - **Err**: the sample is unusable or a path was never executed
pub fn count_flops(
    model: &EncoderAsr,
    modules: &[String],
    sample: &[f32],
) -> HarnessResult<BTreeMap<String, f64>> {
    let wavs = model.preprocess_input(sample)?;
    let audio_seconds = sample.len() as f64 / model.sample_rate() as f64;

    let mut ctx = ForwardCtx::with_flop_counter();
    model.encode(&wavs, &mut ctx)?;
    let counter = ctx
        .take_flop_counter()
        .ok_or_else(|| HarnessError::Internal("FLOP counter was detached".to_string()))?;
    info!(
        "Encoder total: {:.3} GFLOPs for {:.2}s of audio",
        counter.total() as f64 / 1e9,
        audio_seconds
    );

    let mut output = BTreeMap::new();
    for module in modules {
        let Some(relative) = module.strip_prefix(ENCODER_PREFIX) else {
            debug!("Skipping {}: not part of the encoder", module);
            continue;
        };
        let flops = counter.get(relative).ok_or_else(|| {
            HarnessError::Metric(format!("Module '{}' was not executed by the encoder", module))
        })?;
        output.insert(module.clone(), flops as f64 / audio_seconds);
    }
    Ok(output)
}
