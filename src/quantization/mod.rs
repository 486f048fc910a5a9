//! # Quantization
//!
//! Post-training quantization passes over the module graph.
//!
//! ## Key Components:
//! - **observer**: range observers and affine quantization parameters
//! - **dynamic**: block-quantized linear layers (`QMatMul`)
//! - **static_quant**: calibrated quant → module → dequant wrappers
//! - **lowbit**: 1–8 bit fake-quant wrappers with a calibration state machine
//! - **orchestrator**: mixed dynamic / static quantization of named submodules

pub mod dynamic;
pub mod lowbit;
pub mod observer;
pub mod orchestrator;
pub mod static_quant;

pub use dynamic::{DynamicDType, DynamicLinear};
pub use lowbit::{
    calibrate, get_quant_modes, low_bit_benchmark, low_bit_benchmark_groups, measure_wer, set_module_modes,
    wrap_modules, AffineQuantizer, LowBitOptions, QModuleState, QWrapper,
};
pub use observer::{ObserverKind, QConfig, QParams};
pub use orchestrator::{custom_quantize, dynamic_quantize, static_quantize, CandleBackend, QuantBackend, QuantizeOptions};
pub use static_quant::StaticQuant;
