//! # Dynamic Quantization
//!
//! Weights are quantized once into a block-quantized `QTensor`; activations
//! are quantized on the fly by the quantized matmul kernel at every call.
//!
//! ## Supported Kernels:
//! - **Int8**: `Q8_0`, 32-element blocks (default)
//! - **Int4**: `Q4_0`, 32-element blocks
//! - **Float16**: half-precision weights
//!
//! Linear layers whose input width is not a multiple of the block size
//! cannot be packed and are left in float.

use crate::error::{HarnessError, HarnessResult};
use crate::model::layers::WeightedLayer;
use crate::model::{ForwardCtx, Module, ModuleKind};
use candle_core::quantized::{GgmlDType, QMatMul, QTensor};
use candle_core::Tensor;
use candle_nn::Module as _;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// Weight precision for dynamic quantization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DynamicDType {
    #[default]
    Int8,
    Int4,
    Float16,
}

impl DynamicDType {
    pub fn ggml(&self) -> GgmlDType {
        match self {
            DynamicDType::Int8 => GgmlDType::Q8_0,
            DynamicDType::Int4 => GgmlDType::Q4_0,
            DynamicDType::Float16 => GgmlDType::F16,
        }
    }

    pub fn block_size(&self) -> usize {
        self.ggml().block_size()
    }
}

impl FromStr for DynamicDType {
    type Err = HarnessError;

    fn from_str(s: &str) -> HarnessResult<Self> {
        match s.to_lowercase().as_str() {
            "int8" | "qint8" | "q8_0" => Ok(DynamicDType::Int8),
            "int4" | "q4_0" => Ok(DynamicDType::Int4),
            "float16" | "f16" => Ok(DynamicDType::Float16),
            _ => Err(HarnessError::ConfigError(format!("Unknown dynamic dtype: {}", s))),
        }
    }
}

impl fmt::Display for DynamicDType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DynamicDType::Int8 => "int8",
            DynamicDType::Int4 => "int4",
            DynamicDType::Float16 => "float16",
        };
        write!(f, "{}", name)
    }
}

/// A linear layer with block-quantized weights.
#[derive(Debug, Clone)]
pub struct DynamicLinear {
    matmul: QMatMul,
    bias: Option<Tensor>,
    dtype: DynamicDType,
    in_features: usize,
    out_features: usize,
}

impl DynamicLinear {
    /// Pack a float linear layer. `Ok(None)` if its shape does not fit the
    /// dtype's block size.
    pub fn from_linear(layer: &candle_nn::Linear, dtype: DynamicDType) -> HarnessResult<Option<Self>> {
        let (out_features, in_features) = layer.weight().dims2()?;
        if in_features % dtype.block_size() != 0 {
            return Ok(None);
        }
        let qtensor = QTensor::quantize(layer.weight(), dtype.ggml())?;
        Ok(Some(Self {
            matmul: QMatMul::from_qtensor(qtensor)?,
            bias: layer.bias().cloned(),
            dtype,
            in_features,
            out_features,
        }))
    }

    pub fn dtype(&self) -> DynamicDType {
        self.dtype
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }
}

impl Module for DynamicLinear {
    fn kind(&self) -> ModuleKind {
        ModuleKind::DynamicLinear
    }

    fn forward(&self, xs: &Tensor, ctx: &mut ForwardCtx) -> HarnessResult<Tensor> {
        let ys = self.matmul.forward(&xs.contiguous()?)?;
        let ys = match &self.bias {
            Some(bias) => ys.broadcast_add(bias)?,
            None => ys,
        };
        ctx.record_flops((ys.elem_count() * self.in_features) as u64);
        Ok(ys)
    }

    fn boxed_clone(&self) -> Box<dyn Module> {
        Box::new(self.clone())
    }
}

/// Replace every module of a target kind in the subtree rooted at `slot`
/// (the slot itself included) by its dynamically quantized counterpart.
///
/// ## Returns:
/// - **Ok(n)**: number of layers replaced
pub fn quantize_dynamic_subtree(
    slot: &mut Box<dyn Module>,
    targets: &[ModuleKind],
    dtype: DynamicDType,
) -> HarnessResult<usize> {
    if targets.contains(&slot.kind()) {
        match slot.weighted_layer() {
            Some(WeightedLayer::Linear(layer)) => {
                return match DynamicLinear::from_linear(&layer, dtype)? {
                    Some(quantized) => {
                        *slot = Box::new(quantized);
                        Ok(1)
                    }
                    None => {
                        warn!(
                            "Keeping {:?} linear layer in float: input width is not a multiple of {}",
                            layer.weight().dims(),
                            dtype.block_size()
                        );
                        Ok(0)
                    }
                };
            }
            Some(other) => {
                debug!("No dynamic kernel for {}, leaving it in float", other.kind());
                return Ok(0);
            }
            None => {}
        }
    }

    let mut replaced = 0;
    for (_, child) in slot.children_mut() {
        replaced += quantize_dynamic_subtree(child, targets, dtype)?;
    }
    Ok(replaced)
}
