//! # Convolutional Positional Embedding
//!
//! wav2vec2 has no absolute position table. Instead a wide grouped
//! convolution over time is added to the frames before the transformer
//! layers: `y = x + GELU(conv(x))`.
//!
//! Pretrained checkpoints store the convolution weight in weight-norm form,
//! either as `weight_g` / `weight_v` or as
//! `parametrizations.weight.original0` / `original1`. The magnitude `g`
//! has shape `(1, 1, K)`, so the direction is normalized per kernel tap.

use crate::error::HarnessResult;
use crate::model::layers::Conv1d;
use crate::model::{ForwardCtx, Module, ModuleKind, PathSegment};
use candle_core::Tensor;
use candle_nn::{Conv1dConfig, VarBuilder};

const WEIGHT_NORM_NAMES: [(&str, &str); 2] = [
    ("weight_g", "weight_v"),
    ("parametrizations.weight.original0", "parametrizations.weight.original1"),
];

/// Residual positional convolution over `(B, T, C)` frames.
#[derive(Debug, Clone)]
pub struct PositionalConvEmbedding {
    conv: Box<dyn Module>,
    /// Even kernels produce one frame too many with `K / 2` padding
    trim_last: bool,
}

impl PositionalConvEmbedding {
    pub fn load(hidden_size: usize, kernel_size: usize, groups: usize, vb: VarBuilder) -> HarnessResult<Self> {
        let conv_vb = vb.pp("conv");
        let config = Conv1dConfig {
            padding: kernel_size / 2,
            groups,
            ..Default::default()
        };
        let weight = load_weight_norm(&conv_vb, (hidden_size, hidden_size / groups, kernel_size))?;
        let bias = conv_vb.get(hidden_size, "bias")?;
        let conv = Conv1d::new(candle_nn::Conv1d::new(weight, Some(bias), config));

        Ok(Self {
            conv: Box::new(conv),
            trim_last: kernel_size % 2 == 0,
        })
    }
}

/// Resolve a weight-norm parametrized weight, falling back to a plain
/// `weight` tensor.
fn load_weight_norm(vb: &VarBuilder, shape: (usize, usize, usize)) -> HarnessResult<Tensor> {
    let (_, _, kernel_size) = shape;
    let names = WEIGHT_NORM_NAMES
        .iter()
        .find(|(g, v)| vb.contains_tensor(g) && vb.contains_tensor(v));

    match names {
        Some((g_name, v_name)) => {
            let g = vb.get((1, 1, kernel_size), g_name)?;
            let v = vb.get(shape, v_name)?;
            let norm = v.sqr()?.sum_keepdim((0, 1))?.sqrt()?;
            Ok(v.broadcast_mul(&g.broadcast_div(&norm)?)?)
        }
        None => Ok(vb.get(shape, "weight")?),
    }
}

impl Module for PositionalConvEmbedding {
    fn kind(&self) -> ModuleKind {
        ModuleKind::PositionalConv
    }

    fn forward(&self, xs: &Tensor, ctx: &mut ForwardCtx) -> HarnessResult<Tensor> {
        let channels_first = xs.transpose(1, 2)?.contiguous()?;
        let mut embedded = ctx.scoped(&PathSegment::attr("conv"), |ctx| self.conv.forward(&channels_first, ctx))?;
        if self.trim_last {
            let frames = embedded.dim(2)?;
            embedded = embedded.narrow(2, 0, frames - 1)?;
        }
        let embedded = embedded.gelu_erf()?.transpose(1, 2)?;
        Ok((xs + embedded)?)
    }

    fn boxed_clone(&self) -> Box<dyn Module> {
        Box::new(self.clone())
    }

    fn child(&self, segment: &PathSegment) -> Option<&dyn Module> {
        match segment {
            PathSegment::Attr(name) if name == "conv" => Some(self.conv.as_ref()),
            _ => None,
        }
    }

    fn child_slot(&mut self, segment: &PathSegment) -> Option<&mut Box<dyn Module>> {
        match segment {
            PathSegment::Attr(name) if name == "conv" => Some(&mut self.conv),
            _ => None,
        }
    }

    fn children(&self) -> Vec<(PathSegment, &dyn Module)> {
        vec![(PathSegment::attr("conv"), self.conv.as_ref())]
    }

    fn children_mut(&mut self) -> Vec<(PathSegment, &mut Box<dyn Module>)> {
        vec![(PathSegment::attr("conv"), &mut self.conv)]
    }
}
