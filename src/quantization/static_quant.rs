//! # Static Quantization Wrapper
//!
//! [`StaticQuant`] surrounds a submodule with a quantize stub and a
//! dequantize stub: `quant → model → dequant`. Static quantization then runs
//! in two phases:
//!
//! 1. **prepare**: arm the input stub's observer and replace every linear /
//!    conv layer inside the wrapped module with a [`StaticQuantLeaf`] that
//!    observes its input and output
//! 2. *(calibration inference happens here)*
//! 3. **convert**: freeze the observed ranges into quantization parameters;
//!    from then on inputs, weights and outputs are fake-quantized
//!
//! ## Path Transparency:
//! The wrapper exposes `quant`, `model` and `dequant` and forwards every
//! other path segment to the wrapped module.

use crate::error::{HarnessError, HarnessResult};
use crate::model::layers::WeightedLayer;
use crate::model::{ForwardCtx, Module, ModuleKind, PathSegment};
use crate::quantization::observer::{tensor_range, QConfig, QParams, SharedObserver};
use candle_core::Tensor;
use tracing::debug;

/// Lifecycle of a statically quantized component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaticStage {
    /// Plain float passthrough
    Float,
    /// Float passthrough while observers record ranges
    Observing,
    /// Frozen ranges, fake-quantized compute
    Converted,
}

/// Entry stub: observes, then quantizes, the wrapper's input.
#[derive(Debug, Clone)]
pub struct QuantStub {
    observer: SharedObserver,
    params: Option<QParams>,
    stage: StaticStage,
}

impl QuantStub {
    pub fn new(qconfig: &QConfig) -> Self {
        Self {
            observer: SharedObserver::new(qconfig.observer),
            params: None,
            stage: StaticStage::Float,
        }
    }

    pub fn stage(&self) -> StaticStage {
        self.stage
    }

    pub fn params(&self) -> Option<QParams> {
        self.params
    }

    fn prepare(&mut self) {
        self.stage = StaticStage::Observing;
    }

    fn convert(&mut self, qconfig: &QConfig) -> HarnessResult<()> {
        let range = self.observer.snapshot().require_range("quantization stub input")?;
        self.params = Some(qconfig.activation_params(range));
        self.stage = StaticStage::Converted;
        Ok(())
    }
}

impl Module for QuantStub {
    fn kind(&self) -> ModuleKind {
        ModuleKind::QuantStub
    }

    fn forward(&self, xs: &Tensor, _ctx: &mut ForwardCtx) -> HarnessResult<Tensor> {
        match (self.stage, self.params) {
            (StaticStage::Observing, _) => {
                self.observer.observe(xs)?;
                Ok(xs.clone())
            }
            (StaticStage::Converted, Some(params)) => params.fake_quantize(xs),
            _ => Ok(xs.clone()),
        }
    }

    fn boxed_clone(&self) -> Box<dyn Module> {
        Box::new(self.clone())
    }
}

/// Exit stub. Fake-quantized tensors are already in float, so this is a
/// passthrough that marks where the quantized region ends.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeQuantStub;

impl Module for DeQuantStub {
    fn kind(&self) -> ModuleKind {
        ModuleKind::DeQuantStub
    }

    fn forward(&self, xs: &Tensor, _ctx: &mut ForwardCtx) -> HarnessResult<Tensor> {
        Ok(xs.clone())
    }

    fn boxed_clone(&self) -> Box<dyn Module> {
        Box::new(*self)
    }
}

/// A linear or conv layer instrumented for static quantization.
#[derive(Debug, Clone)]
pub struct StaticQuantLeaf {
    layer: WeightedLayer,
    input_observer: SharedObserver,
    output_observer: SharedObserver,
    stage: StaticStage,
    input_params: Option<QParams>,
    weight_params: Option<QParams>,
    output_params: Option<QParams>,
    quantized_weight: Option<Tensor>,
}

impl StaticQuantLeaf {
    pub fn new(layer: WeightedLayer, qconfig: &QConfig) -> Self {
        Self {
            layer,
            input_observer: SharedObserver::new(qconfig.observer),
            output_observer: SharedObserver::new(qconfig.observer),
            stage: StaticStage::Observing,
            input_params: None,
            weight_params: None,
            output_params: None,
            quantized_weight: None,
        }
    }

    pub fn stage(&self) -> StaticStage {
        self.stage
    }

    pub fn layer_kind(&self) -> ModuleKind {
        self.layer.kind()
    }

    pub fn input_params(&self) -> Option<QParams> {
        self.input_params
    }

    pub fn weight_params(&self) -> Option<QParams> {
        self.weight_params
    }

    pub fn output_params(&self) -> Option<QParams> {
        self.output_params
    }

    fn rearm(&mut self) {
        self.stage = StaticStage::Observing;
    }

    pub fn convert(&mut self, qconfig: &QConfig) -> HarnessResult<()> {
        let input_range = self
            .input_observer
            .snapshot()
            .require_range(&format!("{} input", self.layer.kind()))?;
        let output_range = self
            .output_observer
            .snapshot()
            .require_range(&format!("{} output", self.layer.kind()))?;
        let weight_range = tensor_range(self.layer.weight())?
            .ok_or_else(|| HarnessError::Quantization("cannot quantize an empty weight".to_string()))?;

        let weight_params = qconfig.weight_params(weight_range);
        self.quantized_weight = Some(weight_params.fake_quantize(self.layer.weight())?);
        self.weight_params = Some(weight_params);
        self.input_params = Some(qconfig.activation_params(input_range));
        self.output_params = Some(qconfig.activation_params(output_range));
        self.stage = StaticStage::Converted;
        Ok(())
    }
}

impl Module for StaticQuantLeaf {
    fn kind(&self) -> ModuleKind {
        ModuleKind::StaticQuantLeaf
    }

    fn forward(&self, xs: &Tensor, ctx: &mut ForwardCtx) -> HarnessResult<Tensor> {
        let ys = match (self.input_params, &self.quantized_weight, self.output_params) {
            (Some(input), Some(weight), Some(output)) if self.stage == StaticStage::Converted => {
                let xs = input.fake_quantize(xs)?;
                let ys = self.layer.forward_with_weight(&xs, weight)?;
                output.fake_quantize(&ys)?
            }
            _ => {
                if self.stage == StaticStage::Observing {
                    self.input_observer.observe(xs)?;
                }
                let ys = self.layer.forward(xs)?;
                if self.stage == StaticStage::Observing {
                    self.output_observer.observe(&ys)?;
                }
                ys
            }
        };
        ctx.record_flops(self.layer.flops(&ys));
        Ok(ys)
    }

    fn boxed_clone(&self) -> Box<dyn Module> {
        Box::new(self.clone())
    }

    fn as_static_leaf_mut(&mut self) -> Option<&mut StaticQuantLeaf> {
        Some(self)
    }
}

/// `quant → model → dequant` around an arbitrary submodule.
#[derive(Debug, Clone)]
pub struct StaticQuant {
    quant: QuantStub,
    model: Box<dyn Module>,
    dequant: DeQuantStub,
    qconfig: QConfig,
}

impl StaticQuant {
    pub fn new(model: Box<dyn Module>, qconfig: QConfig) -> Self {
        Self {
            quant: QuantStub::new(&qconfig),
            model,
            dequant: DeQuantStub,
            qconfig,
        }
    }

    pub fn qconfig(&self) -> &QConfig {
        &self.qconfig
    }

    pub fn quant_stub(&self) -> &QuantStub {
        &self.quant
    }

    pub fn inner(&self) -> &dyn Module {
        self.model.as_ref()
    }

    /// Arm observers. Returns the number of instrumented layers.
    pub fn prepare(&mut self) -> usize {
        self.quant.prepare();
        let instrumented = instrument(&mut self.model, &self.qconfig);
        debug!("Prepared static wrapper: {} layers instrumented", instrumented);
        instrumented
    }

    /// Freeze observed ranges. Every observer must have seen data.
    pub fn convert(&mut self) -> HarnessResult<usize> {
        self.quant.convert(&self.qconfig)?;
        let qconfig = self.qconfig;
        let mut converted = 0;
        visit_leaves(self.model.as_mut(), &mut |leaf| {
            leaf.convert(&qconfig)?;
            converted += 1;
            Ok(())
        })?;
        Ok(converted)
    }
}

/// Replace every linear / conv layer below `slot` with an observing leaf.
fn instrument(slot: &mut Box<dyn Module>, qconfig: &QConfig) -> usize {
    if let Some(leaf) = slot.as_static_leaf_mut() {
        leaf.rearm();
        return 1;
    }
    if let Some(layer) = slot.weighted_layer() {
        *slot = Box::new(StaticQuantLeaf::new(layer, qconfig));
        return 1;
    }
    slot.children_mut()
        .into_iter()
        .map(|(_, child)| instrument(child, qconfig))
        .sum()
}

fn visit_leaves(
    module: &mut dyn Module,
    f: &mut dyn FnMut(&mut StaticQuantLeaf) -> HarnessResult<()>,
) -> HarnessResult<()> {
    if let Some(leaf) = module.as_static_leaf_mut() {
        return f(leaf);
    }
    for (_, child) in module.children_mut() {
        visit_leaves(child.as_mut(), f)?;
    }
    Ok(())
}

impl Module for StaticQuant {
    fn kind(&self) -> ModuleKind {
        ModuleKind::StaticQuant
    }

    fn forward(&self, xs: &Tensor, ctx: &mut ForwardCtx) -> HarnessResult<Tensor> {
        let xs = self.quant.forward(xs, ctx)?;
        let ys = self.model.forward(&xs, ctx)?;
        self.dequant.forward(&ys, ctx)
    }

    fn boxed_clone(&self) -> Box<dyn Module> {
        Box::new(self.clone())
    }

    fn child(&self, segment: &PathSegment) -> Option<&dyn Module> {
        match segment {
            PathSegment::Attr(name) if name == "quant" => Some(&self.quant),
            PathSegment::Attr(name) if name == "model" => Some(self.model.as_ref()),
            PathSegment::Attr(name) if name == "dequant" => Some(&self.dequant),
            _ => self.model.child(segment),
        }
    }

    fn child_slot(&mut self, segment: &PathSegment) -> Option<&mut Box<dyn Module>> {
        match segment {
            PathSegment::Attr(name) if name == "model" => Some(&mut self.model),
            _ => self.model.child_slot(segment),
        }
    }

    fn children(&self) -> Vec<(PathSegment, &dyn Module)> {
        vec![
            (PathSegment::attr("quant"), &self.quant as &dyn Module),
            (PathSegment::attr("model"), self.model.as_ref()),
            (PathSegment::attr("dequant"), &self.dequant as &dyn Module),
        ]
    }

    fn children_mut(&mut self) -> Vec<(PathSegment, &mut Box<dyn Module>)> {
        vec![(PathSegment::attr("model"), &mut self.model)]
    }

    fn as_static_quant_mut(&mut self) -> Option<&mut StaticQuant> {
        Some(self)
    }
}

/// Apply `f` to every [`StaticQuant`] in the graph below `root`.
///
/// Wrappers nested inside another wrapper are left to the outer one.
pub fn for_each_static_quant(
    root: &mut dyn Module,
    f: &mut dyn FnMut(&mut StaticQuant) -> HarnessResult<()>,
) -> HarnessResult<()> {
    if let Some(wrapper) = root.as_static_quant_mut() {
        return f(wrapper);
    }
    for (_, child) in root.children_mut() {
        for_each_static_quant(child.as_mut(), f)?;
    }
    Ok(())
}
