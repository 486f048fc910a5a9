//! # Submodule Quantization Orchestrator
//!
//! Applies mixed dynamic / static quantization to named submodules of a
//! model, in place.
//!
//! ## Sequence:
//! 1. Dynamic quantization of every listed dynamic module
//! 2. Static quantization of every listed static module:
//!    wrap → prepare → calibrate (transcribe each sample) → convert
//!
//! The numeric work is delegated to a [`QuantBackend`]; [`CandleBackend`]
//! is the real one.

use crate::error::{HarnessError, HarnessResult};
use crate::model::{module_slot_mut, wrap_module, Module, ModuleKind, QuantizableModel};
use crate::quantization::dynamic::{quantize_dynamic_subtree, DynamicDType};
use crate::quantization::observer::QConfig;
use crate::quantization::static_quant::{for_each_static_quant, StaticQuant};
use tracing::{debug, info};

/// Numeric side of quantization.
pub trait QuantBackend {
    /// Swap target-kind modules in the subtree at `slot` for dynamic ones.
    fn quantize_dynamic(
        &self,
        slot: &mut Box<dyn Module>,
        targets: &[ModuleKind],
        dtype: DynamicDType,
    ) -> HarnessResult<usize>;

    /// Arm observers inside every static wrapper below `root`.
    fn prepare(&self, root: &mut dyn Module) -> HarnessResult<usize>;

    /// Freeze observed ranges inside every static wrapper below `root`.
    fn convert(&self, root: &mut dyn Module) -> HarnessResult<usize>;
}

/// Backend built on candle's quantized tensors and the fake-quant wrappers.
#[derive(Debug, Clone, Copy, Default)]
pub struct CandleBackend;

impl QuantBackend for CandleBackend {
    fn quantize_dynamic(
        &self,
        slot: &mut Box<dyn Module>,
        targets: &[ModuleKind],
        dtype: DynamicDType,
    ) -> HarnessResult<usize> {
        quantize_dynamic_subtree(slot, targets, dtype)
    }

    fn prepare(&self, root: &mut dyn Module) -> HarnessResult<usize> {
        let mut instrumented = 0;
        for_each_static_quant(root, &mut |wrapper| {
            instrumented += wrapper.prepare();
            Ok(())
        })?;
        Ok(instrumented)
    }

    fn convert(&self, root: &mut dyn Module) -> HarnessResult<usize> {
        let mut converted = 0;
        for_each_static_quant(root, &mut |wrapper| {
            converted += wrapper.convert()?;
            Ok(())
        })?;
        Ok(converted)
    }
}

/// Knobs shared by the dynamic and static passes.
#[derive(Debug, Clone)]
pub struct QuantizeOptions {
    /// Module kinds replaced by dynamic quantization
    pub targets: Vec<ModuleKind>,
    pub dtype: DynamicDType,
    pub qconfig: QConfig,
}

impl Default for QuantizeOptions {
    fn default() -> Self {
        Self {
            targets: vec![ModuleKind::Linear],
            dtype: DynamicDType::Int8,
            qconfig: QConfig::default(),
        }
    }
}

/// Dynamically quantize each listed module. No-op for `None` or `[]`.
pub fn dynamic_quantize<M, B>(
    model: &mut M,
    modules: Option<&[String]>,
    options: &QuantizeOptions,
    backend: &B,
) -> HarnessResult<()>
where
    M: QuantizableModel + ?Sized,
    B: QuantBackend + ?Sized,
{
    let modules = match modules {
        Some(modules) if !modules.is_empty() => modules,
        _ => return Ok(()),
    };
    let targets: &[ModuleKind] = if options.targets.is_empty() {
        &[ModuleKind::Linear]
    } else {
        &options.targets
    };

    for path in modules {
        let slot = module_slot_mut(model.mods_mut(), path)?;
        let replaced = backend.quantize_dynamic(slot, targets, options.dtype)?;
        debug!("Dynamic {} quantization of {}: {} layers", options.dtype, path, replaced);
    }
    Ok(())
}

/// Statically quantize each listed module using the calibration samples.
/// No-op for `None` or `[]`.
pub fn static_quantize<M, B>(
    model: &mut M,
    modules: Option<&[String]>,
    calibration_samples: Option<&[Vec<f32>]>,
    options: &QuantizeOptions,
    backend: &B,
) -> HarnessResult<()>
where
    M: QuantizableModel + ?Sized,
    B: QuantBackend + ?Sized,
{
    let modules = match modules {
        Some(modules) if !modules.is_empty() => modules,
        _ => return Ok(()),
    };
    let samples = match calibration_samples {
        Some(samples) if !samples.is_empty() => samples,
        _ => {
            return Err(HarnessError::Calibration(
                "No calibration samples provided for static quantization.".to_string(),
            ))
        }
    };

    for path in modules {
        let qconfig = options.qconfig;
        wrap_module(model.mods_mut(), path, move |module| Box::new(StaticQuant::new(module, qconfig)))?;
    }

    let instrumented = backend.prepare(model.mods_mut())?;
    debug!("Calibrating {} instrumented layers on {} samples", instrumented, samples.len());
    for sample in samples {
        model.transcribe(sample)?;
    }
    let converted = backend.convert(model.mods_mut())?;
    debug!("Converted {} layers", converted);
    Ok(())
}

/// Mixed in-place quantization: dynamic modules first, then static ones.
///
/// ## Parameters:
/// - **dynamic_modules**: paths (relative to `mods`) for dynamic quantization
/// - **static_modules**: paths for static quantization
/// - **calibration_samples**: audio used to calibrate the static modules
pub fn custom_quantize<M, B>(
    model: &mut M,
    dynamic_modules: Option<&[String]>,
    static_modules: Option<&[String]>,
    calibration_samples: Option<&[Vec<f32>]>,
    options: &QuantizeOptions,
    backend: &B,
) -> HarnessResult<()>
where
    M: QuantizableModel + ?Sized,
    B: QuantBackend + ?Sized,
{
    info!(
        "Quantizing {} modules dynamically, {} statically",
        dynamic_modules.map_or(0, <[String]>::len),
        static_modules.map_or(0, <[String]>::len)
    );
    dynamic_quantize(model, dynamic_modules, options, backend)?;
    static_quantize(model, static_modules, calibration_samples, options, backend)
}
