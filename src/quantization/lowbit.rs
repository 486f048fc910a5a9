//! # Low-Bit Quantization
//!
//! Fake-quantizes weights and/or activations of individual linear and conv
//! layers at an arbitrary bit width (1–8 bits), to probe how far each part
//! of the model can be squeezed before accuracy collapses.
//!
//! ## Key Components:
//! - **AffineQuantizer**: bit width plus range observer
//! - **QWrapper**: wraps one linear / conv layer with optional weight and
//!   activation quantizers
//! - **QModuleState**: per-wrapper state machine (float, calibration, eval)
//!
//! ## Benchmark Flow:
//! 1. Wrap every listed layer
//! 2. Switch wrappers to a calibration state and run calibration samples
//! 3. Switch wrappers to the matching evaluation state
//! 4. Transcribe the evaluation samples and report WER

use crate::benchmark::compute_wer;
use crate::error::{HarnessError, HarnessResult};
use crate::model::layers::WeightedLayer;
use crate::model::{
    get_module_mut, module_slot_mut, ForwardCtx, Module, ModuleKind, PathSegment, QuantizableModel, Transcriber,
};
use crate::quantization::observer::{ObserverKind, QParams, SharedObserver};
use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

/// Quantization state of a [`QWrapper`].
///
/// Calibration states observe without quantizing; evaluation states
/// quantize with the frozen ranges without observing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QModuleState {
    Float,
    Calibration,
    CalibrationWeightOnly,
    CalibrationActOnly,
    QuantEval,
    QuantEvalWeightOnly,
    QuantEvalActOnly,
}

impl QModuleState {
    pub fn is_weight_observed(&self) -> bool {
        matches!(self, QModuleState::Calibration | QModuleState::CalibrationWeightOnly)
    }

    pub fn is_act_observed(&self) -> bool {
        matches!(self, QModuleState::Calibration | QModuleState::CalibrationActOnly)
    }

    pub fn is_weight_quantized(&self) -> bool {
        matches!(self, QModuleState::QuantEval | QModuleState::QuantEvalWeightOnly)
    }

    pub fn is_act_quantized(&self) -> bool {
        matches!(self, QModuleState::QuantEval | QModuleState::QuantEvalActOnly)
    }
}

impl fmt::Display for QModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The calibration / evaluation state pair for one weights/activations choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantModes {
    pub calibration: QModuleState,
    pub evaluation: QModuleState,
}

/// Pick the state pair for quantizing weights, activations, or both.
pub fn get_quant_modes(quantize_weights: bool, quantize_activations: bool) -> HarnessResult<QuantModes> {
    let (calibration, evaluation) = match (quantize_weights, quantize_activations) {
        (true, true) => (QModuleState::Calibration, QModuleState::QuantEval),
        (true, false) => (QModuleState::CalibrationWeightOnly, QModuleState::QuantEvalWeightOnly),
        (false, true) => (QModuleState::CalibrationActOnly, QModuleState::QuantEvalActOnly),
        (false, false) => {
            return Err(HarnessError::Quantization(
                "At least one of weights or activations must be quantized".to_string(),
            ))
        }
    };
    Ok(QuantModes {
        calibration,
        evaluation,
    })
}

/// Unsigned affine fake-quantizer with `2^bits` levels.
#[derive(Debug, Clone)]
pub struct AffineQuantizer {
    bits: u8,
    observer: SharedObserver,
}

impl AffineQuantizer {
    pub fn new(bits: u8, observer: ObserverKind) -> HarnessResult<Self> {
        if !(1..=8).contains(&bits) {
            return Err(HarnessError::Quantization(format!(
                "bit width must be between 1 and 8, got {}",
                bits
            )));
        }
        Ok(Self {
            bits,
            observer: SharedObserver::new(observer),
        })
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    pub fn observe(&self, xs: &Tensor) -> HarnessResult<()> {
        self.observer.observe(xs)
    }

    /// Parameters for the range observed so far.
    pub fn params(&self) -> HarnessResult<QParams> {
        let (min, max) = self.observer.snapshot().require_range("low-bit quantizer")?;
        Ok(QParams::for_bits(min, max, self.bits))
    }

    pub fn quantize(&self, xs: &Tensor) -> HarnessResult<Tensor> {
        self.params()?.fake_quantize(xs)
    }
}

/// A linear or conv layer with optional weight / activation quantizers.
///
/// The wrapped layer stays reachable as `<path>.layer` and can be replaced
/// there; it must remain a linear or conv layer.
#[derive(Debug, Clone)]
pub struct QWrapper {
    layer: Box<dyn Module>,
    weight_quantizer: Option<AffineQuantizer>,
    act_quantizer: Option<AffineQuantizer>,
    state: QModuleState,
}

impl QWrapper {
    pub fn new(
        layer: Box<dyn Module>,
        weight_quantizer: Option<AffineQuantizer>,
        act_quantizer: Option<AffineQuantizer>,
    ) -> HarnessResult<Self> {
        Self::weighted(layer.as_ref())?;
        Ok(Self {
            layer,
            weight_quantizer,
            act_quantizer,
            state: QModuleState::Float,
        })
    }

    pub fn state(&self) -> QModuleState {
        self.state
    }

    pub fn wrapped_kind(&self) -> ModuleKind {
        self.layer.kind()
    }

    fn weighted(layer: &dyn Module) -> HarnessResult<WeightedLayer> {
        layer.weighted_layer().ok_or_else(|| {
            HarnessError::UnsupportedLayer(format!(
                "Provided layers are not supported for fused quantization with QWrapper: [{}].",
                layer.kind()
            ))
        })
    }

    pub fn weight_quantizer(&self) -> Option<&AffineQuantizer> {
        self.weight_quantizer.as_ref()
    }

    pub fn act_quantizer(&self) -> Option<&AffineQuantizer> {
        self.act_quantizer.as_ref()
    }

    /// Change state. States touching weights or activations need the
    /// matching quantizer.
    pub fn set_state(&mut self, state: QModuleState) -> HarnessResult<()> {
        let needs_weights = state.is_weight_observed() || state.is_weight_quantized();
        let needs_acts = state.is_act_observed() || state.is_act_quantized();
        if needs_weights && self.weight_quantizer.is_none() {
            return Err(HarnessError::Quantization(format!(
                "state {} needs a weight quantizer",
                state
            )));
        }
        if needs_acts && self.act_quantizer.is_none() {
            return Err(HarnessError::Quantization(format!(
                "state {} needs an activation quantizer",
                state
            )));
        }
        self.state = state;
        Ok(())
    }

    fn quantizer<'a>(quantizer: &'a Option<AffineQuantizer>, what: &str) -> HarnessResult<&'a AffineQuantizer> {
        quantizer
            .as_ref()
            .ok_or_else(|| HarnessError::Quantization(format!("missing {} quantizer", what)))
    }
}

impl Module for QWrapper {
    fn kind(&self) -> ModuleKind {
        ModuleKind::QWrapper
    }

    fn forward(&self, xs: &Tensor, ctx: &mut ForwardCtx) -> HarnessResult<Tensor> {
        let weighted = Self::weighted(self.layer.as_ref())?;
        let weight = weighted.weight();
        if self.state.is_weight_observed() {
            Self::quantizer(&self.weight_quantizer, "weight")?.observe(weight)?;
        }
        let acts = if self.state.is_weight_quantized() {
            let q_weight = Self::quantizer(&self.weight_quantizer, "weight")?.quantize(weight)?;
            weighted.forward_with_weight(xs, &q_weight)?
        } else {
            weighted.forward(xs)?
        };
        ctx.record_flops(weighted.flops(&acts));

        if self.state.is_act_observed() {
            Self::quantizer(&self.act_quantizer, "activation")?.observe(&acts)?;
        }
        if self.state.is_act_quantized() {
            return Self::quantizer(&self.act_quantizer, "activation")?.quantize(&acts);
        }
        Ok(acts)
    }

    fn boxed_clone(&self) -> Box<dyn Module> {
        Box::new(self.clone())
    }

    fn child(&self, segment: &PathSegment) -> Option<&dyn Module> {
        match segment {
            PathSegment::Attr(name) if name == "layer" => Some(self.layer.as_ref()),
            _ => self.layer.child(segment),
        }
    }

    fn child_slot(&mut self, segment: &PathSegment) -> Option<&mut Box<dyn Module>> {
        match segment {
            PathSegment::Attr(name) if name == "layer" => Some(&mut self.layer),
            _ => self.layer.child_slot(segment),
        }
    }

    fn children(&self) -> Vec<(PathSegment, &dyn Module)> {
        vec![(PathSegment::attr("layer"), self.layer.as_ref())]
    }

    fn children_mut(&mut self) -> Vec<(PathSegment, &mut Box<dyn Module>)> {
        vec![(PathSegment::attr("layer"), &mut self.layer)]
    }

    fn as_qwrapper(&self) -> Option<&QWrapper> {
        Some(self)
    }

    fn as_qwrapper_mut(&mut self) -> Option<&mut QWrapper> {
        Some(self)
    }
}

/// Which parts of each layer to quantize and how ranges are tracked.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LowBitOptions {
    pub quantize_weights: bool,
    pub quantize_activations: bool,
    pub observer: ObserverKind,
}

impl Default for LowBitOptions {
    fn default() -> Self {
        Self {
            quantize_weights: true,
            quantize_activations: false,
            observer: ObserverKind::ExpAvgMinMax,
        }
    }
}

/// Wrap each listed layer in a [`QWrapper`] with `bits`-bit quantizers.
pub fn wrap_modules(
    root: &mut dyn Module,
    modules: &[String],
    bits: u8,
    options: &LowBitOptions,
) -> HarnessResult<()> {
    for path in modules {
        let weight_quantizer = options
            .quantize_weights
            .then(|| AffineQuantizer::new(bits, options.observer))
            .transpose()?;
        let act_quantizer = options
            .quantize_activations
            .then(|| AffineQuantizer::new(bits, options.observer))
            .transpose()?;

        let slot = module_slot_mut(root, path)?;
        let wrapper = QWrapper::new(slot.clone(), weight_quantizer, act_quantizer)?;
        *slot = Box::new(wrapper);
        debug!("Wrapped {} for {}-bit quantization", path, bits);
    }
    Ok(())
}

/// Put every listed wrapper into `state`.
pub fn set_module_modes(root: &mut dyn Module, modules: &[String], state: QModuleState) -> HarnessResult<()> {
    for path in modules {
        let module = get_module_mut(root, path)?;
        let wrapper = module.as_qwrapper_mut().ok_or_else(|| {
            HarnessError::UnsupportedLayer(format!("Module '{}' is not wrapped with QWrapper", path))
        })?;
        wrapper.set_state(state)?;
    }
    Ok(())
}

/// Run the calibration samples through the model; outputs are discarded.
pub fn calibrate<M: Transcriber + ?Sized>(model: &M, samples: &[Vec<f32>]) -> HarnessResult<()> {
    for sample in samples {
        model.transcribe(sample)?;
    }
    Ok(())
}

/// Transcribe every sample and score against the references.
pub fn measure_wer<M, R>(model: &M, samples: &[Vec<f32>], references: &[R]) -> HarnessResult<f64>
where
    M: Transcriber + ?Sized,
    R: AsRef<str>,
{
    let hypotheses = samples
        .iter()
        .map(|sample| model.transcribe(sample))
        .collect::<HarnessResult<Vec<_>>>()?;
    compute_wer(references, &hypotheses)
}

/// Wrap → calibrate → evaluate for a set of layer groups, each with its own
/// bit width. Returns the WER (%) of the quantized model.
pub fn low_bit_benchmark_groups<M, R>(
    model: &mut M,
    groups: &[(Vec<String>, u8)],
    samples: &[Vec<f32>],
    references: &[R],
    calibration_samples: &[Vec<f32>],
    options: &LowBitOptions,
) -> HarnessResult<f64>
where
    M: QuantizableModel + ?Sized,
    R: AsRef<str>,
{
    let modes = get_quant_modes(options.quantize_weights, options.quantize_activations)?;
    for (modules, bits) in groups {
        wrap_modules(model.mods_mut(), modules, *bits, options)?;
    }
    let all_modules: Vec<String> = groups.iter().flat_map(|(modules, _)| modules.iter().cloned()).collect();

    set_module_modes(model.mods_mut(), &all_modules, modes.calibration)?;
    calibrate(model, calibration_samples)?;
    set_module_modes(model.mods_mut(), &all_modules, modes.evaluation)?;

    let wer = measure_wer(model, samples, references)?;
    info!("Low-bit evaluation over {} layers: WER {:.2}%", all_modules.len(), wer);
    Ok(wer)
}

/// Quantize `modules` at a single bit width and report WER (%).
pub fn low_bit_benchmark<M, R>(
    model: &mut M,
    modules: &[String],
    bits: u8,
    samples: &[Vec<f32>],
    references: &[R],
    calibration_samples: &[Vec<f32>],
    options: &LowBitOptions,
) -> HarnessResult<f64>
where
    M: QuantizableModel + ?Sized,
    R: AsRef<str>,
{
    low_bit_benchmark_groups(
        model,
        &[(modules.to_vec(), bits)],
        samples,
        references,
        calibration_samples,
        options,
    )
}
