//! # Leaf Layers
//!
//! Thin [`Module`] adapters over `candle-nn` layers. Each leaf records its
//! FLOPs into the [`ForwardCtx`] when a counter is attached.
//!
//! ## Counting Rules (one FLOP per multiply-accumulate):
//! - **Linear**: `N · in · out` (N = number of input rows)
//! - **Conv1d**: `B · L_out · C_out · C_in/groups · K`
//! - **LayerNorm / GroupNorm**: `5 · numel`
//! - Activations, transposes and identities are free

use crate::error::HarnessResult;
use crate::model::{ForwardCtx, Module, ModuleKind};
use candle_core::Tensor;
use candle_nn::{Conv1dConfig, Module as _, VarBuilder};

/// Weight-carrying layer that quantization passes can rebuild with new weights.
#[derive(Debug, Clone)]
pub enum WeightedLayer {
    Linear(candle_nn::Linear),
    Conv1d(candle_nn::Conv1d),
}

impl WeightedLayer {
    pub fn kind(&self) -> ModuleKind {
        match self {
            WeightedLayer::Linear(_) => ModuleKind::Linear,
            WeightedLayer::Conv1d(_) => ModuleKind::Conv1d,
        }
    }

    pub fn weight(&self) -> &Tensor {
        match self {
            WeightedLayer::Linear(layer) => layer.weight(),
            WeightedLayer::Conv1d(layer) => layer.weight(),
        }
    }

    pub fn bias(&self) -> Option<&Tensor> {
        match self {
            WeightedLayer::Linear(layer) => layer.bias(),
            WeightedLayer::Conv1d(layer) => layer.bias(),
        }
    }

    /// Width of one input row (linear) or input channels (conv).
    pub fn in_features(&self) -> usize {
        let dims = self.weight().dims();
        match self {
            WeightedLayer::Linear(_) => dims[dims.len() - 1],
            WeightedLayer::Conv1d(_) => dims[1],
        }
    }

    pub fn forward(&self, xs: &Tensor) -> HarnessResult<Tensor> {
        match self {
            WeightedLayer::Linear(layer) => Ok(layer.forward(xs)?),
            WeightedLayer::Conv1d(layer) => Ok(layer.forward(xs)?),
        }
    }

    /// Same layer, same bias, different weight.
    pub fn forward_with_weight(&self, xs: &Tensor, weight: &Tensor) -> HarnessResult<Tensor> {
        let bias = self.bias().cloned();
        match self {
            WeightedLayer::Linear(_) => {
                Ok(candle_nn::Linear::new(weight.clone(), bias).forward(xs)?)
            }
            WeightedLayer::Conv1d(layer) => {
                Ok(candle_nn::Conv1d::new(weight.clone(), bias, *layer.config()).forward(xs)?)
            }
        }
    }

    /// FLOPs of a call that produced `output`.
    ///
    /// Every output element costs one MAC per weight element feeding it,
    /// i.e. the product of all weight dims except the first.
    pub fn flops(&self, output: &Tensor) -> u64 {
        let per_output: usize = self.weight().dims().iter().skip(1).product();
        (output.elem_count() * per_output) as u64
    }
}

/// Fully connected layer.
#[derive(Debug, Clone)]
pub struct Linear {
    inner: candle_nn::Linear,
}

impl Linear {
    pub fn new(inner: candle_nn::Linear) -> Self {
        Self { inner }
    }

    pub fn load(in_dim: usize, out_dim: usize, bias: bool, vb: VarBuilder) -> HarnessResult<Self> {
        let inner = if bias {
            candle_nn::linear(in_dim, out_dim, vb)?
        } else {
            candle_nn::linear_no_bias(in_dim, out_dim, vb)?
        };
        Ok(Self::new(inner))
    }

    pub fn inner(&self) -> &candle_nn::Linear {
        &self.inner
    }
}

impl Module for Linear {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Linear
    }

    fn forward(&self, xs: &Tensor, ctx: &mut ForwardCtx) -> HarnessResult<Tensor> {
        let ys = self.inner.forward(xs)?;
        ctx.record_flops(WeightedLayer::Linear(self.inner.clone()).flops(&ys));
        Ok(ys)
    }

    fn boxed_clone(&self) -> Box<dyn Module> {
        Box::new(self.clone())
    }

    fn weighted_layer(&self) -> Option<WeightedLayer> {
        Some(WeightedLayer::Linear(self.inner.clone()))
    }
}

/// 1-D convolution over `(batch, channels, time)`.
#[derive(Debug, Clone)]
pub struct Conv1d {
    inner: candle_nn::Conv1d,
}

impl Conv1d {
    pub fn new(inner: candle_nn::Conv1d) -> Self {
        Self { inner }
    }

    pub fn load(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        bias: bool,
        vb: VarBuilder,
    ) -> HarnessResult<Self> {
        let config = Conv1dConfig {
            stride,
            ..Default::default()
        };
        Self::load_with_config(in_channels, out_channels, kernel_size, config, bias, vb)
    }

    /// Padded or grouped convolution.
    pub fn load_with_config(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        config: Conv1dConfig,
        bias: bool,
        vb: VarBuilder,
    ) -> HarnessResult<Self> {
        let inner = if bias {
            candle_nn::conv1d(in_channels, out_channels, kernel_size, config, vb)?
        } else {
            candle_nn::conv1d_no_bias(in_channels, out_channels, kernel_size, config, vb)?
        };
        Ok(Self::new(inner))
    }
}

impl Module for Conv1d {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Conv1d
    }

    fn forward(&self, xs: &Tensor, ctx: &mut ForwardCtx) -> HarnessResult<Tensor> {
        let ys = self.inner.forward(xs)?;
        ctx.record_flops(WeightedLayer::Conv1d(self.inner.clone()).flops(&ys));
        Ok(ys)
    }

    fn boxed_clone(&self) -> Box<dyn Module> {
        Box::new(self.clone())
    }

    fn weighted_layer(&self) -> Option<WeightedLayer> {
        Some(WeightedLayer::Conv1d(self.inner.clone()))
    }
}

/// Layer normalization over the last dimension, or over the channels of
/// `(B, C, T)` conv features when `channels_first` is set.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    inner: candle_nn::LayerNorm,
    channels_first: bool,
}

impl LayerNorm {
    pub fn load(size: usize, eps: f64, vb: VarBuilder) -> HarnessResult<Self> {
        Ok(Self {
            inner: candle_nn::layer_norm(size, eps, vb)?,
            channels_first: false,
        })
    }

    pub fn load_channels_first(channels: usize, eps: f64, vb: VarBuilder) -> HarnessResult<Self> {
        Ok(Self {
            channels_first: true,
            ..Self::load(channels, eps, vb)?
        })
    }
}

impl Module for LayerNorm {
    fn kind(&self) -> ModuleKind {
        ModuleKind::LayerNorm
    }

    fn forward(&self, xs: &Tensor, ctx: &mut ForwardCtx) -> HarnessResult<Tensor> {
        let ys = if self.channels_first {
            let frames = xs.transpose(1, 2)?.contiguous()?;
            self.inner.forward(&frames)?.transpose(1, 2)?.contiguous()?
        } else {
            self.inner.forward(xs)?
        };
        ctx.record_flops(5 * xs.elem_count() as u64);
        Ok(ys)
    }

    fn boxed_clone(&self) -> Box<dyn Module> {
        Box::new(self.clone())
    }
}

/// Group normalization over `(B, C, T)`.
#[derive(Debug, Clone)]
pub struct GroupNorm {
    inner: candle_nn::GroupNorm,
}

impl GroupNorm {
    pub fn load(num_groups: usize, channels: usize, eps: f64, vb: VarBuilder) -> HarnessResult<Self> {
        Ok(Self {
            inner: candle_nn::group_norm(num_groups, channels, eps, vb)?,
        })
    }
}

impl Module for GroupNorm {
    fn kind(&self) -> ModuleKind {
        ModuleKind::GroupNorm
    }

    fn forward(&self, xs: &Tensor, ctx: &mut ForwardCtx) -> HarnessResult<Tensor> {
        let ys = self.inner.forward(xs)?;
        ctx.record_flops(5 * xs.elem_count() as u64);
        Ok(ys)
    }

    fn boxed_clone(&self) -> Box<dyn Module> {
        Box::new(self.clone())
    }
}

/// Pointwise non-linearities.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Activation {
    /// Exact (erf) GELU
    Gelu,
    Relu,
    /// Leaky ReLU with the given negative slope
    LeakyRelu(f64),
}

impl Module for Activation {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Activation
    }

    fn forward(&self, xs: &Tensor, _ctx: &mut ForwardCtx) -> HarnessResult<Tensor> {
        let ys = match self {
            Activation::Gelu => xs.gelu_erf()?,
            Activation::Relu => xs.relu()?,
            Activation::LeakyRelu(slope) => candle_nn::ops::leaky_relu(xs, *slope)?,
        };
        Ok(ys)
    }

    fn boxed_clone(&self) -> Box<dyn Module> {
        Box::new(*self)
    }
}

/// Swaps two dimensions, e.g. `(B, C, T)` conv features to `(B, T, C)` frames.
#[derive(Debug, Clone, Copy)]
pub struct Transpose {
    dim1: usize,
    dim2: usize,
}

impl Transpose {
    pub fn new(dim1: usize, dim2: usize) -> Self {
        Self { dim1, dim2 }
    }
}

impl Module for Transpose {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Transpose
    }

    fn forward(&self, xs: &Tensor, _ctx: &mut ForwardCtx) -> HarnessResult<Tensor> {
        Ok(xs.transpose(self.dim1, self.dim2)?.contiguous()?)
    }

    fn boxed_clone(&self) -> Box<dyn Module> {
        Box::new(*self)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Identity;

impl Module for Identity {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Identity
    }

    fn forward(&self, xs: &Tensor, _ctx: &mut ForwardCtx) -> HarnessResult<Tensor> {
        Ok(xs.clone())
    }

    fn boxed_clone(&self) -> Box<dyn Module> {
        Box::new(*self)
    }
}
