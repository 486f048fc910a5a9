//! # Transformer Encoder Layers
//!
//! Multi-head self-attention and the transformer layer used by the wav2vec2
//! encoder, in its post-norm and pre-norm ("stable layer norm") variants. Every projection is a replaceable child slot, so
//! `layers.3.attention.q_proj` can be quantized like any other linear layer.

use crate::error::{HarnessError, HarnessResult};
use crate::model::containers::Block;
use crate::model::layers::{Activation, LayerNorm, Linear};
use crate::model::{ForwardCtx, Module, ModuleKind, PathSegment};
use candle_core::Tensor;
use candle_nn::VarBuilder;

/// Multi-head scaled dot-product self-attention over `(B, T, C)`.
#[derive(Debug, Clone)]
pub struct SelfAttention {
    q_proj: Box<dyn Module>,
    k_proj: Box<dyn Module>,
    v_proj: Box<dyn Module>,
    out_proj: Box<dyn Module>,
    num_heads: usize,
}

impl SelfAttention {
    const PROJECTIONS: [&'static str; 4] = ["q_proj", "k_proj", "v_proj", "out_proj"];

    pub fn load(hidden_size: usize, num_heads: usize, vb: VarBuilder) -> HarnessResult<Self> {
        if num_heads == 0 || hidden_size % num_heads != 0 {
            return Err(HarnessError::Model(format!(
                "hidden size {} is not divisible by {} attention heads",
                hidden_size, num_heads
            )));
        }
        Ok(Self {
            q_proj: Box::new(Linear::load(hidden_size, hidden_size, true, vb.pp("q_proj"))?),
            k_proj: Box::new(Linear::load(hidden_size, hidden_size, true, vb.pp("k_proj"))?),
            v_proj: Box::new(Linear::load(hidden_size, hidden_size, true, vb.pp("v_proj"))?),
            out_proj: Box::new(Linear::load(hidden_size, hidden_size, true, vb.pp("out_proj"))?),
            num_heads,
        })
    }

    fn slot(&self, name: &str) -> Option<&Box<dyn Module>> {
        match name {
            "q_proj" => Some(&self.q_proj),
            "k_proj" => Some(&self.k_proj),
            "v_proj" => Some(&self.v_proj),
            "out_proj" => Some(&self.out_proj),
            _ => None,
        }
    }

    fn slot_mut(&mut self, name: &str) -> Option<&mut Box<dyn Module>> {
        match name {
            "q_proj" => Some(&mut self.q_proj),
            "k_proj" => Some(&mut self.k_proj),
            "v_proj" => Some(&mut self.v_proj),
            "out_proj" => Some(&mut self.out_proj),
            _ => None,
        }
    }

    fn project(&self, name: &str, xs: &Tensor, ctx: &mut ForwardCtx) -> HarnessResult<Tensor> {
        let layer = self
            .slot(name)
            .ok_or_else(|| HarnessError::Internal(format!("unknown projection {}", name)))?;
        ctx.scoped(&PathSegment::attr(name), |ctx| layer.forward(xs, ctx))
    }

    /// `(B, T, C)` → `(B, H, T, D)`
    fn split_heads(&self, xs: &Tensor) -> HarnessResult<Tensor> {
        let (batch, frames, channels) = xs.dims3()?;
        let head_dim = channels / self.num_heads;
        Ok(xs
            .reshape((batch, frames, self.num_heads, head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }
}

impl Module for SelfAttention {
    fn kind(&self) -> ModuleKind {
        ModuleKind::SelfAttention
    }

    fn forward(&self, xs: &Tensor, ctx: &mut ForwardCtx) -> HarnessResult<Tensor> {
        let (batch, frames, channels) = xs.dims3()?;
        let head_dim = channels / self.num_heads;

        let q = self.split_heads(&self.project("q_proj", xs, ctx)?)?;
        let k = self.split_heads(&self.project("k_proj", xs, ctx)?)?;
        let v = self.split_heads(&self.project("v_proj", xs, ctx)?)?;

        let scale = 1.0 / (head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?.contiguous()?)? * scale)?;
        let weights = candle_nn::ops::softmax_last_dim(&scores)?;
        let context = weights.matmul(&v)?;

        // QK^T and AV
        ctx.record_flops((2 * batch * self.num_heads * frames * frames * head_dim) as u64);

        let merged = context
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, frames, channels))?;
        self.project("out_proj", &merged, ctx)
    }

    fn boxed_clone(&self) -> Box<dyn Module> {
        Box::new(self.clone())
    }

    fn child(&self, segment: &PathSegment) -> Option<&dyn Module> {
        match segment {
            PathSegment::Attr(name) => self.slot(name).map(|slot| slot.as_ref()),
            PathSegment::Index(_) => None,
        }
    }

    fn child_slot(&mut self, segment: &PathSegment) -> Option<&mut Box<dyn Module>> {
        match segment {
            PathSegment::Attr(name) => self.slot_mut(name),
            PathSegment::Index(_) => None,
        }
    }

    fn children(&self) -> Vec<(PathSegment, &dyn Module)> {
        Self::PROJECTIONS
            .iter()
            .filter_map(|name| Some((PathSegment::attr(name), self.slot(name)?.as_ref())))
            .collect()
    }

    fn children_mut(&mut self) -> Vec<(PathSegment, &mut Box<dyn Module>)> {
        vec![
            (PathSegment::attr("q_proj"), &mut self.q_proj),
            (PathSegment::attr("k_proj"), &mut self.k_proj),
            (PathSegment::attr("v_proj"), &mut self.v_proj),
            (PathSegment::attr("out_proj"), &mut self.out_proj),
        ]
    }
}

/// Encoder layer.
///
/// - post-norm: `h = LN(x + attn(x))`, `y = LN(h + ff(h))`
/// - pre-norm: `h = x + attn(LN(x))`, `y = h + ff(LN(h))`
#[derive(Debug, Clone)]
pub struct TransformerLayer {
    attention: Box<dyn Module>,
    layer_norm: Box<dyn Module>,
    feed_forward: Box<dyn Module>,
    final_layer_norm: Box<dyn Module>,
    pre_norm: bool,
}

impl TransformerLayer {
    pub fn load(
        hidden_size: usize,
        num_heads: usize,
        intermediate_size: usize,
        eps: f64,
        vb: VarBuilder,
    ) -> HarnessResult<Self> {
        Self::load_with_norm(hidden_size, num_heads, intermediate_size, eps, false, vb)
    }

    pub fn load_with_norm(
        hidden_size: usize,
        num_heads: usize,
        intermediate_size: usize,
        eps: f64,
        pre_norm: bool,
        vb: VarBuilder,
    ) -> HarnessResult<Self> {
        let ff_vb = vb.pp("feed_forward");
        let feed_forward = Block::new()
            .with(
                "intermediate_dense",
                Box::new(Linear::load(hidden_size, intermediate_size, true, ff_vb.pp("intermediate_dense"))?),
            )
            .with("activation", Box::new(Activation::Gelu))
            .with(
                "output_dense",
                Box::new(Linear::load(intermediate_size, hidden_size, true, ff_vb.pp("output_dense"))?),
            );

        Ok(Self {
            attention: Box::new(SelfAttention::load(hidden_size, num_heads, vb.pp("attention"))?),
            layer_norm: Box::new(LayerNorm::load(hidden_size, eps, vb.pp("layer_norm"))?),
            feed_forward: Box::new(feed_forward),
            final_layer_norm: Box::new(LayerNorm::load(hidden_size, eps, vb.pp("final_layer_norm"))?),
            pre_norm,
        })
    }

    fn slot(&self, name: &str) -> Option<&Box<dyn Module>> {
        match name {
            "attention" => Some(&self.attention),
            "layer_norm" => Some(&self.layer_norm),
            "feed_forward" => Some(&self.feed_forward),
            "final_layer_norm" => Some(&self.final_layer_norm),
            _ => None,
        }
    }

    fn slot_mut(&mut self, name: &str) -> Option<&mut Box<dyn Module>> {
        match name {
            "attention" => Some(&mut self.attention),
            "layer_norm" => Some(&mut self.layer_norm),
            "feed_forward" => Some(&mut self.feed_forward),
            "final_layer_norm" => Some(&mut self.final_layer_norm),
            _ => None,
        }
    }
}

fn run_child(
    name: &str,
    child: &dyn Module,
    xs: &Tensor,
    ctx: &mut ForwardCtx,
) -> HarnessResult<Tensor> {
    ctx.scoped(&PathSegment::attr(name), |ctx| child.forward(xs, ctx))
}

impl Module for TransformerLayer {
    fn kind(&self) -> ModuleKind {
        ModuleKind::TransformerLayer
    }

    fn forward(&self, xs: &Tensor, ctx: &mut ForwardCtx) -> HarnessResult<Tensor> {
        if self.pre_norm {
            let normed = run_child("layer_norm", self.layer_norm.as_ref(), xs, ctx)?;
            let attended = run_child("attention", self.attention.as_ref(), &normed, ctx)?;
            let hidden = (xs + attended)?;

            let normed = run_child("final_layer_norm", self.final_layer_norm.as_ref(), &hidden, ctx)?;
            let projected = run_child("feed_forward", self.feed_forward.as_ref(), &normed, ctx)?;
            return Ok((hidden + projected)?);
        }

        let attended = run_child("attention", self.attention.as_ref(), xs, ctx)?;
        let hidden = run_child("layer_norm", self.layer_norm.as_ref(), &(xs + attended)?, ctx)?;

        let projected = run_child("feed_forward", self.feed_forward.as_ref(), &hidden, ctx)?;
        let summed = (hidden + projected)?;
        run_child("final_layer_norm", self.final_layer_norm.as_ref(), &summed, ctx)
    }

    fn boxed_clone(&self) -> Box<dyn Module> {
        Box::new(self.clone())
    }

    fn child(&self, segment: &PathSegment) -> Option<&dyn Module> {
        match segment {
            PathSegment::Attr(name) => self.slot(name).map(|slot| slot.as_ref()),
            PathSegment::Index(_) => None,
        }
    }

    fn child_slot(&mut self, segment: &PathSegment) -> Option<&mut Box<dyn Module>> {
        match segment {
            PathSegment::Attr(name) => self.slot_mut(name),
            PathSegment::Index(_) => None,
        }
    }

    fn children(&self) -> Vec<(PathSegment, &dyn Module)> {
        vec![
            (PathSegment::attr("attention"), self.attention.as_ref()),
            (PathSegment::attr("layer_norm"), self.layer_norm.as_ref()),
            (PathSegment::attr("feed_forward"), self.feed_forward.as_ref()),
            (PathSegment::attr("final_layer_norm"), self.final_layer_norm.as_ref()),
        ]
    }

    fn children_mut(&mut self) -> Vec<(PathSegment, &mut Box<dyn Module>)> {
        vec![
            (PathSegment::attr("attention"), &mut self.attention),
            (PathSegment::attr("layer_norm"), &mut self.layer_norm),
            (PathSegment::attr("feed_forward"), &mut self.feed_forward),
            (PathSegment::attr("final_layer_norm"), &mut self.final_layer_norm),
        ]
    }
}
