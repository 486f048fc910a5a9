//! # Speech Model Graph
//!
//! The ASR model is held as a tree of [`Module`] trait objects so that any
//! nested submodule can be addressed by a dotted path string
//! (`encoder.wav2vec2.model.encoder.layers.3.attention.q_proj`) and replaced
//! in place by a quantization wrapper.
//!
//! ## Key Components:
//! - **Module trait**: single-tensor forward plus child lookup / replacement
//! - **Paths**: dotted-path resolution (`get_module`, `set_module`, `wrap_module`)
//! - **Layers & containers**: the building blocks the ASR model is made from
//! - **EncoderAsr**: the wav2vec2-style CTC model, its loader and vocabulary
//!
//! ## Wrapping Contract:
//! Wrappers keep the call interface of what they wrap (one tensor in, one
//! tensor out) and forward child lookups to the wrapped module, so paths
//! that resolved before wrapping keep resolving afterwards.

pub mod asr;          // wav2vec2-style CTC encoder model
pub mod attention;    // Self-attention and transformer layers
pub mod containers;   // Sequential and Block containers
pub mod layers;       // Leaf layers (linear, conv, norm, activations)
pub mod loader;       // Local / Hugging Face Hub model loading
pub mod path;         // Dotted module path resolution
pub mod positional;   // Convolutional relative positional embedding
pub mod vocab;        // CTC token decoding

pub use asr::{AsrConfig, EncoderAsr};
pub use path::{get_module, get_module_mut, module_slot_mut, set_module, wrap_module, ModulePath, PathSegment};

use crate::benchmark::flops::FlopCounter;
use crate::error::HarnessResult;
use crate::quantization::lowbit::QWrapper;
use crate::quantization::static_quant::{StaticQuant, StaticQuantLeaf};
use candle_core::Tensor;
use layers::WeightedLayer;
use std::fmt;
use std::time::Duration;

/// Concrete type of a module, used for quantization targets and assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ModuleKind {
    Linear,
    Conv1d,
    LayerNorm,
    GroupNorm,
    Activation,
    Transpose,
    Identity,
    Sequential,
    Block,
    SelfAttention,
    TransformerLayer,
    PositionalConv,
    StaticQuant,
    QuantStub,
    DeQuantStub,
    StaticQuantLeaf,
    DynamicLinear,
    QWrapper,
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A node of the model graph.
///
/// Only `kind`, `forward` and `boxed_clone` are required. Containers override
/// the child accessors; quantization wrappers override the matching `as_*`
/// accessor so passes can find them without downcasting.
pub trait Module: fmt::Debug + Send + Sync {
    fn kind(&self) -> ModuleKind;

    fn forward(&self, xs: &Tensor, ctx: &mut ForwardCtx) -> HarnessResult<Tensor>;

    /// Deep copy of the graph below this node. Tensors are shared handles.
    fn boxed_clone(&self) -> Box<dyn Module>;

    fn child(&self, _segment: &PathSegment) -> Option<&dyn Module> {
        None
    }

    /// The slot owning a child, used to replace it.
    fn child_slot(&mut self, _segment: &PathSegment) -> Option<&mut Box<dyn Module>> {
        None
    }

    fn children(&self) -> Vec<(PathSegment, &dyn Module)> {
        Vec::new()
    }

    /// Replaceable children, in forward order.
    fn children_mut(&mut self) -> Vec<(PathSegment, &mut Box<dyn Module>)> {
        Vec::new()
    }

    /// Linear and conv layers expose their weights for quantization.
    fn weighted_layer(&self) -> Option<WeightedLayer> {
        None
    }

    fn as_static_quant_mut(&mut self) -> Option<&mut StaticQuant> {
        None
    }

    fn as_static_leaf_mut(&mut self) -> Option<&mut StaticQuantLeaf> {
        None
    }

    fn as_qwrapper(&self) -> Option<&QWrapper> {
        None
    }

    fn as_qwrapper_mut(&mut self) -> Option<&mut QWrapper> {
        None
    }
}

impl Clone for Box<dyn Module> {
    fn clone(&self) -> Self {
        self.boxed_clone()
    }
}

/// Per-call state threaded through `forward`.
///
/// ## Fields:
/// - **scope**: path segments of the module currently running
/// - **flops**: optional FLOP counter; leaves record into it when present
#[derive(Debug, Default)]
pub struct ForwardCtx {
    scope: Vec<String>,
    flops: Option<FlopCounter>,
}

impl ForwardCtx {
    pub fn new() -> Self {
        Self::default()
    }

    /// A context that attributes FLOPs to every enclosing module.
    pub fn with_flop_counter() -> Self {
        Self {
            scope: Vec::new(),
            flops: Some(FlopCounter::new()),
        }
    }

    /// Run `f` with `segment` pushed onto the current scope.
    pub fn scoped<T>(
        &mut self,
        segment: &PathSegment,
        f: impl FnOnce(&mut Self) -> HarnessResult<T>,
    ) -> HarnessResult<T> {
        self.scope.push(segment.to_string());
        let result = f(self);
        self.scope.pop();
        result
    }

    pub fn scope(&self) -> String {
        self.scope.join(".")
    }

    pub fn record_flops(&mut self, flops: u64) {
        if let Some(counter) = self.flops.as_mut() {
            counter.record(&self.scope, flops);
        }
    }

    pub fn take_flop_counter(&mut self) -> Option<FlopCounter> {
        self.flops.take()
    }
}

/// Anything that turns 16 kHz mono audio into text.
pub trait Transcriber {
    fn transcribe(&self, audio: &[f32]) -> HarnessResult<String>;

    /// Transcribe and report the time spent in the acoustic encoder only.
    fn timed_transcribe(&self, audio: &[f32]) -> HarnessResult<(String, Duration)>;
}

/// A transcriber whose module graph can be rewritten in place.
///
/// Paths handed to the quantization passes are relative to `mods()`.
pub trait QuantizableModel: Transcriber {
    fn mods(&self) -> &dyn Module;

    fn mods_mut(&mut self) -> &mut dyn Module;
}
