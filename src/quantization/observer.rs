//! # Range Observers and Affine Quantization Parameters
//!
//! Observers watch tensors flowing through a module and track their value
//! range; at conversion time the range is frozen into [`QParams`].
//!
//! ## Observer Kinds:
//! - **MinMax**: running minimum / maximum over everything seen
//! - **BatchMinMax**: range of the latest batch only
//! - **ExpAvgMinMax**: exponential moving average of batch ranges
//!
//! ## Fake Quantization:
//! `x̂ = (clamp(round(x / scale) + zero_point, qmin, qmax) - zero_point) · scale`
//!
//! Values stay in `f32`; only the set of representable values shrinks.

use crate::error::{lock_poisoned, HarnessError, HarnessResult};
use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Weight on history for [`ObserverKind::ExpAvgMinMax`].
pub const EXP_AVG_MOMENTUM: f32 = 0.9;

/// Frozen affine quantization parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QParams {
    pub scale: f32,
    pub zero_point: i32,
    pub qmin: i32,
    pub qmax: i32,
}

impl QParams {
    /// Asymmetric parameters covering `[min, max]`, widened to include zero.
    pub fn affine(min: f32, max: f32, qmin: i32, qmax: i32) -> Self {
        let min = min.min(0.0);
        let max = max.max(0.0);
        let scale = ((max - min) / (qmax - qmin) as f32).max(f32::EPSILON);
        let zero_point = (qmin as f32 - (min / scale).round()).clamp(qmin as f32, qmax as f32) as i32;
        Self {
            scale,
            zero_point,
            qmin,
            qmax,
        }
    }

    /// Symmetric parameters around zero for signed ranges.
    pub fn symmetric(min: f32, max: f32, qmin: i32, qmax: i32) -> Self {
        let amax = min.abs().max(max.abs());
        let scale = (amax / ((qmax - qmin) as f32 / 2.0)).max(f32::EPSILON);
        Self {
            scale,
            zero_point: 0,
            qmin,
            qmax,
        }
    }

    /// Unsigned `bits`-bit parameters for `[min, max]`.
    pub fn for_bits(min: f32, max: f32, bits: u8) -> Self {
        let qmax = (1i32 << bits) - 1;
        Self::affine(min, max, 0, qmax)
    }

    pub fn levels(&self) -> i32 {
        self.qmax - self.qmin + 1
    }

    pub fn quantize_value(&self, x: f32) -> i32 {
        ((x / self.scale).round() as i32 + self.zero_point).clamp(self.qmin, self.qmax)
    }

    pub fn dequantize_value(&self, q: i32) -> f32 {
        (q - self.zero_point) as f32 * self.scale
    }

    /// Quantize then dequantize every element of `xs`.
    pub fn fake_quantize(&self, xs: &Tensor) -> HarnessResult<Tensor> {
        let dtype = xs.dtype();
        let scale = self.scale as f64;
        let zero_point = self.zero_point as f64;
        let ys = xs
            .to_dtype(DType::F32)?
            .affine(1.0 / scale, zero_point)?
            .round()?
            .clamp(self.qmin as f32, self.qmax as f32)?
            .affine(scale, -zero_point * scale)?;
        Ok(ys.to_dtype(dtype)?)
    }
}

/// How an observer folds successive batches into one range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObserverKind {
    #[default]
    MinMax,
    BatchMinMax,
    ExpAvgMinMax,
}

/// Minimum and maximum of a tensor. `None` for empty tensors.
pub fn tensor_range(xs: &Tensor) -> HarnessResult<Option<(f32, f32)>> {
    if xs.elem_count() == 0 {
        return Ok(None);
    }
    let flat = xs.flatten_all()?.to_dtype(DType::F32)?;
    let min = flat.min(0)?.to_scalar::<f32>()?;
    let max = flat.max(0)?.to_scalar::<f32>()?;
    Ok(Some((min, max)))
}

/// Tracks the range of the values it is shown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RangeObserver {
    kind: ObserverKind,
    range: Option<(f32, f32)>,
    batches: usize,
}

impl RangeObserver {
    pub fn new(kind: ObserverKind) -> Self {
        Self {
            kind,
            range: None,
            batches: 0,
        }
    }

    pub fn observe(&mut self, xs: &Tensor) -> HarnessResult<()> {
        if let Some((min, max)) = tensor_range(xs)? {
            self.update(min, max);
        }
        Ok(())
    }

    pub fn update(&mut self, min: f32, max: f32) {
        self.range = Some(match (self.kind, self.range) {
            (_, None) | (ObserverKind::BatchMinMax, _) => (min, max),
            (ObserverKind::MinMax, Some((lo, hi))) => (lo.min(min), hi.max(max)),
            (ObserverKind::ExpAvgMinMax, Some((lo, hi))) => (
                EXP_AVG_MOMENTUM * lo + (1.0 - EXP_AVG_MOMENTUM) * min,
                EXP_AVG_MOMENTUM * hi + (1.0 - EXP_AVG_MOMENTUM) * max,
            ),
        });
        self.batches += 1;
    }

    pub fn kind(&self) -> ObserverKind {
        self.kind
    }

    pub fn range(&self) -> Option<(f32, f32)> {
        self.range
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn reset(&mut self) {
        self.range = None;
        self.batches = 0;
    }

    /// Observed range, or an error naming `what` if nothing was observed.
    pub fn require_range(&self, what: &str) -> HarnessResult<(f32, f32)> {
        self.range.ok_or_else(|| {
            HarnessError::Calibration(format!(
                "Observer for {} has no statistics; run calibration before converting",
                what
            ))
        })
    }
}

/// An observer that can be updated from `&self` forward passes.
///
/// Cloning takes a snapshot, so cloned models calibrate independently.
#[derive(Debug, Default)]
pub struct SharedObserver(Mutex<RangeObserver>);

impl SharedObserver {
    pub fn new(kind: ObserverKind) -> Self {
        Self(Mutex::new(RangeObserver::new(kind)))
    }

    pub fn observe(&self, xs: &Tensor) -> HarnessResult<()> {
        self.0.lock().map_err(lock_poisoned)?.observe(xs)
    }

    pub fn snapshot(&self) -> RangeObserver {
        match self.0.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn reset(&self) -> HarnessResult<()> {
        self.0.lock().map_err(lock_poisoned)?.reset();
        Ok(())
    }
}

impl Clone for SharedObserver {
    fn clone(&self) -> Self {
        Self(Mutex::new(self.snapshot()))
    }
}

/// Static quantization configuration carried by each wrapper.
///
/// Defaults match the usual x86 server setup: activations as unsigned
/// 8-bit with reduced range (`0..=127`), weights as signed 8-bit symmetric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QConfig {
    pub observer: ObserverKind,
    pub activation_qmin: i32,
    pub activation_qmax: i32,
    pub weight_qmin: i32,
    pub weight_qmax: i32,
}

impl Default for QConfig {
    fn default() -> Self {
        Self {
            observer: ObserverKind::MinMax,
            activation_qmin: 0,
            activation_qmax: 127,
            weight_qmin: -128,
            weight_qmax: 127,
        }
    }
}

impl QConfig {
    pub fn activation_params(&self, (min, max): (f32, f32)) -> QParams {
        QParams::affine(min, max, self.activation_qmin, self.activation_qmax)
    }

    pub fn weight_params(&self, (min, max): (f32, f32)) -> QParams {
        QParams::symmetric(min, max, self.weight_qmin, self.weight_qmax)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_affine_range_includes_zero() {
        let params = QParams::affine(1.0, 3.0, 0, 255);
        // The range is widened to [0, 3]
        assert_eq!(params.zero_point, 0);
        assert!((params.scale - 3.0 / 255.0).abs() < 1e-7);
        assert_eq!(params.dequantize_value(params.quantize_value(0.0)), 0.0);
    }

    #[test]
    fn test_affine_negative_range() {
        let params = QParams::affine(-1.0, 1.0, 0, 127);
        assert!(params.zero_point > 0 && params.zero_point < 127);
        assert_eq!(params.quantize_value(-5.0), 0);
        assert_eq!(params.quantize_value(5.0), 127);
    }

    #[test]
    fn test_degenerate_range_has_positive_scale() {
        let params = QParams::affine(0.0, 0.0, 0, 255);
        assert!(params.scale > 0.0);
        assert_eq!(params.quantize_value(0.0), 0);
    }

    #[test]
    fn test_symmetric_zero_point() {
        let params = QParams::symmetric(-2.0, 0.5, -128, 127);
        assert_eq!(params.zero_point, 0);
        assert!((params.scale - 2.0 / 127.5).abs() < 1e-7);
    }

    #[test]
    fn test_for_bits_levels() {
        assert_eq!(QParams::for_bits(-1.0, 1.0, 1).levels(), 2);
        assert_eq!(QParams::for_bits(-1.0, 1.0, 4).levels(), 16);
        assert_eq!(QParams::for_bits(-1.0, 1.0, 8).levels(), 256);
    }

    #[test]
    fn test_fake_quantize_snaps_to_grid() {
        let params = QParams::affine(0.0, 1.0, 0, 4);
        let xs = Tensor::new(&[0.0f32, 0.1, 0.3, 0.62, 2.0], &Device::Cpu).unwrap();
        let ys: Vec<f32> = params.fake_quantize(&xs).unwrap().to_vec1().unwrap();
        let expected = [0.0, 0.0, 0.25, 0.5, 1.0];
        for (y, e) in ys.iter().zip(expected) {
            assert!((y - e).abs() < 1e-6, "{} vs {}", y, e);
        }
    }

    #[test]
    fn test_min_max_observer_accumulates() {
        let mut observer = RangeObserver::new(ObserverKind::MinMax);
        observer.update(-1.0, 1.0);
        observer.update(0.0, 3.0);
        assert_eq!(observer.range(), Some((-1.0, 3.0)));
        assert_eq!(observer.batches(), 2);
    }

    #[test]
    fn test_batch_min_max_keeps_latest() {
        let mut observer = RangeObserver::new(ObserverKind::BatchMinMax);
        observer.update(-1.0, 1.0);
        observer.update(0.0, 3.0);
        assert_eq!(observer.range(), Some((0.0, 3.0)));
    }

    #[test]
    fn test_exp_avg_weights_history() {
        let mut observer = RangeObserver::new(ObserverKind::ExpAvgMinMax);
        observer.update(0.0, 10.0);
        observer.update(0.0, 20.0);
        let (_, max) = observer.range().unwrap();
        assert!((max - 11.0).abs() < 1e-5);
    }

    #[test]
    fn test_observe_tensor() {
        let mut observer = RangeObserver::new(ObserverKind::MinMax);
        let xs = Tensor::new(&[[-0.5f32, 2.0], [1.0, 0.25]], &Device::Cpu).unwrap();
        observer.observe(&xs).unwrap();
        assert_eq!(observer.range(), Some((-0.5, 2.0)));
    }

    #[test]
    fn test_empty_observer_is_an_error() {
        let observer = RangeObserver::new(ObserverKind::MinMax);
        let err = observer.require_range("layer").unwrap_err();
        assert!(err.to_string().contains("no statistics"));
    }

    #[test]
    fn test_shared_observer_clone_is_independent() {
        let shared = SharedObserver::new(ObserverKind::MinMax);
        let xs = Tensor::new(&[1.0f32, 2.0], &Device::Cpu).unwrap();
        shared.observe(&xs).unwrap();

        let copy = shared.clone();
        shared.reset().unwrap();
        assert_eq!(copy.snapshot().range(), Some((1.0, 2.0)));
        assert_eq!(shared.snapshot().range(), None);
    }
}
