//! Shared test fixtures: constant-weight layers, a tiny random model and a
//! scripted transcriber.

use crate::error::HarnessResult;
use crate::model::layers::{Conv1d, Linear};
use crate::model::vocab::CharVocabulary;
use crate::model::asr::FeatureNorm;
use crate::model::{AsrConfig, EncoderAsr, Transcriber};
use candle_core::{DType, Device, Tensor};
use candle_nn::{Conv1dConfig, VarBuilder, VarMap};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Linear layer with every weight equal to `value` and a zero bias.
pub fn linear(in_dim: usize, out_dim: usize, value: f32) -> Linear {
    let weight = Tensor::full(value, (out_dim, in_dim), &Device::Cpu).unwrap();
    let bias = Tensor::zeros(out_dim, DType::F32, &Device::Cpu).unwrap();
    Linear::new(candle_nn::Linear::new(weight, Some(bias)))
}

/// Conv1d layer with every weight equal to `value` and a zero bias.
pub fn conv1d(in_channels: usize, out_channels: usize, kernel: usize, stride: usize, value: f32) -> Conv1d {
    let weight = Tensor::full(value, (out_channels, in_channels, kernel), &Device::Cpu).unwrap();
    let bias = Tensor::zeros(out_channels, DType::F32, &Device::Cpu).unwrap();
    let config = Conv1dConfig {
        stride,
        ..Default::default()
    };
    Conv1d::new(candle_nn::Conv1d::new(weight, Some(bias), config))
}

/// Eight tokens: blank, word delimiter and six letters.
pub const TINY_VOCAB: &str = r#"{"<pad>": 0, "|": 1, "a": 2, "b": 3, "c": 4, "d": 5, "e": 6, "f": 7}"#;

/// Two conv layers, one transformer layer, one `enc` layer; every linear
/// input width is a multiple of 32 so dynamic quantization applies.
/// Group-normed extractor and post-norm layers, as in wav2vec2-base.
pub fn tiny_config() -> AsrConfig {
    AsrConfig {
        sample_rate: 16_000,
        conv_dim: vec![32, 32],
        conv_kernel: vec![10, 3],
        conv_stride: vec![5, 2],
        conv_bias: false,
        hidden_size: 32,
        num_hidden_layers: 1,
        num_attention_heads: 2,
        intermediate_size: 64,
        enc_dims: vec![32],
        enc_negative_slope: 0.01,
        vocab_size: 8,
        blank_id: 0,
        layer_norm_eps: 1e-5,
        feat_extract_norm: FeatureNorm::Group,
        do_stable_layer_norm: false,
        num_conv_pos_embeddings: 4,
        num_conv_pos_embedding_groups: 2,
    }
}

/// Randomly initialised tiny model and the variables backing it.
pub fn tiny_model_with_vars() -> (EncoderAsr, VarMap) {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let decoder = Arc::new(CharVocabulary::from_json(TINY_VOCAB).unwrap());
    let model = EncoderAsr::load(tiny_config(), vb, decoder).unwrap();
    (model, varmap)
}

pub fn tiny_model() -> EncoderAsr {
    tiny_model_with_vars().0
}

/// Answers by input length and reports a fixed encoder time per call.
pub struct ScriptedTranscriber {
    outputs: HashMap<usize, String>,
    encoder_time: Duration,
    calls: AtomicUsize,
}

impl ScriptedTranscriber {
    pub fn new(outputs: Vec<(usize, &str)>, encoder_secs: f64) -> Self {
        Self {
            outputs: outputs.into_iter().map(|(len, text)| (len, text.to_string())).collect(),
            encoder_time: Duration::from_secs_f64(encoder_secs),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Transcriber for ScriptedTranscriber {
    fn transcribe(&self, audio: &[f32]) -> HarnessResult<String> {
        Ok(self.timed_transcribe(audio)?.0)
    }

    fn timed_transcribe(&self, audio: &[f32]) -> HarnessResult<(String, Duration)> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = self.outputs.get(&audio.len()).cloned().unwrap_or_default();
        Ok((text, self.encoder_time))
    }
}
