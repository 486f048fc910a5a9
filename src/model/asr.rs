//! # CTC Encoder ASR Model
//!
//! A wav2vec2-style acoustic model: a strided convolutional feature
//! extractor, a transformer encoder with a convolutional positional
//! embedding, an optional feed-forward `enc` head and a linear CTC output
//! layer, decoded greedily.
//!
//! ## Module Tree (paths relative to `mods`):
//! ```text
//! encoder
//!   wav2vec2.model
//!     feature_extractor.conv_layers.{i}.conv / .layer_norm / .activation
//!     feature_extractor.to_frames
//!     feature_projection.layer_norm / .projection
//!     encoder.pos_conv_embed.conv
//!     encoder.layers.{i}.attention.{q_proj,k_proj,v_proj,out_proj}
//!                       .layer_norm
//!                       .feed_forward.{intermediate_dense,activation,output_dense}
//!                       .final_layer_norm
//!     encoder.layer_norm
//!   enc.linear{k}.w / enc.activation{k}     (only when enc_dims is set)
//!   ctc_lin.w
//! ```
//!
//! Conv layer norms exist only where `feat_extract_norm` asks for them:
//! layer 0 for `group`, every layer for `layer`. With
//! `do_stable_layer_norm` the transformer layers are pre-norm and
//! `encoder.layer_norm` runs after them instead of before.
//!
//! Weight tensors are named after these paths (`<path>.weight`, `<path>.bias`).

use crate::error::{HarnessError, HarnessResult};
use crate::model::attention::TransformerLayer;
use crate::model::containers::{Block, Sequential};
use crate::model::layers::{Activation, Conv1d, GroupNorm, LayerNorm, Linear, Transpose};
use crate::model::positional::PositionalConvEmbedding;
use crate::model::vocab::TokenDecoder;
use crate::model::{ForwardCtx, Module, QuantizableModel, Transcriber};
use candle_core::{Device, Tensor, D};
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Architecture description read from `config.json`.
///
/// Field names follow the Hugging Face wav2vec2 configuration so exported
/// configs can be used as they are; `enc_dims` describes the extra head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsrConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    pub conv_dim: Vec<usize>,
    pub conv_kernel: Vec<usize>,
    pub conv_stride: Vec<usize>,
    #[serde(default)]
    pub conv_bias: bool,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    /// Output widths of the `enc` head layers (may be empty)
    #[serde(default)]
    pub enc_dims: Vec<usize>,
    #[serde(default = "default_negative_slope")]
    pub enc_negative_slope: f64,
    pub vocab_size: usize,
    /// CTC blank; wav2vec2 uses the pad token
    #[serde(default, alias = "pad_token_id")]
    pub blank_id: u32,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default)]
    pub feat_extract_norm: FeatureNorm,
    /// Pre-norm transformer layers with the encoder norm at the end
    #[serde(default)]
    pub do_stable_layer_norm: bool,
    #[serde(default = "default_num_conv_pos_embeddings")]
    pub num_conv_pos_embeddings: usize,
    #[serde(default = "default_num_conv_pos_embedding_groups")]
    pub num_conv_pos_embedding_groups: usize,
}

/// Normalization inside the convolutional feature extractor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureNorm {
    /// GroupNorm with one group per channel after the first conv
    #[default]
    Group,
    /// LayerNorm over channels after every conv
    Layer,
}

fn default_sample_rate() -> u32 {
    16_000
}

fn default_negative_slope() -> f64 {
    0.01
}

fn default_layer_norm_eps() -> f64 {
    1e-5
}

fn default_num_conv_pos_embeddings() -> usize {
    128
}

fn default_num_conv_pos_embedding_groups() -> usize {
    16
}

impl AsrConfig {
    pub fn validate(&self) -> HarnessResult<()> {
        if self.conv_dim.is_empty() {
            return Err(HarnessError::Model("conv_dim must not be empty".to_string()));
        }
        if self.conv_dim.len() != self.conv_kernel.len() || self.conv_dim.len() != self.conv_stride.len() {
            return Err(HarnessError::Model(
                "conv_dim, conv_kernel and conv_stride must have the same length".to_string(),
            ));
        }
        if self.conv_kernel.iter().chain(&self.conv_stride).any(|&v| v == 0) {
            return Err(HarnessError::Model("conv kernels and strides must be positive".to_string()));
        }
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(HarnessError::Model(format!(
                "hidden_size {} must be divisible by num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.num_conv_pos_embeddings == 0
            || self.num_conv_pos_embedding_groups == 0
            || self.hidden_size % self.num_conv_pos_embedding_groups != 0
        {
            return Err(HarnessError::Model(format!(
                "hidden_size {} must be divisible by num_conv_pos_embedding_groups {}",
                self.hidden_size, self.num_conv_pos_embedding_groups
            )));
        }
        if self.vocab_size == 0 || self.blank_id as usize >= self.vocab_size {
            return Err(HarnessError::Model(format!(
                "blank id {} is outside the vocabulary of size {}",
                self.blank_id, self.vocab_size
            )));
        }
        Ok(())
    }

    /// Number of encoder frames produced for `samples` input samples.
    pub fn frames_for(&self, samples: usize) -> usize {
        self.conv_kernel
            .iter()
            .zip(&self.conv_stride)
            .fold(samples, |len, (&kernel, &stride)| {
                if len < kernel {
                    0
                } else {
                    (len - kernel) / stride + 1
                }
            })
    }

    /// Width of the features entering the CTC layer.
    fn head_dim(&self) -> usize {
        self.enc_dims.last().copied().unwrap_or(self.hidden_size)
    }
}

/// The ASR model and its token decoder.
#[derive(Debug, Clone)]
pub struct EncoderAsr {
    mods: Block,
    config: AsrConfig,
    decoder: Arc<dyn TokenDecoder>,
    device: Device,
}

impl EncoderAsr {
    /// Build the module tree, reading weights named after module paths.
    pub fn load(config: AsrConfig, vb: VarBuilder, decoder: Arc<dyn TokenDecoder>) -> HarnessResult<Self> {
        config.validate()?;
        let device = vb.device().clone();

        let encoder_vb = vb.pp("encoder");
        let w2v_vb = encoder_vb.pp("wav2vec2").pp("model");

        let mut encoder = Block::new().with(
            "wav2vec2",
            Box::new(Block::new().with("model", Box::new(Self::build_wav2vec2(&config, w2v_vb)?))),
        );
        if !config.enc_dims.is_empty() {
            encoder.insert("enc", Box::new(Self::build_enc(&config, encoder_vb.pp("enc"))?));
        }
        let ctc_lin = Linear::load(config.head_dim(), config.vocab_size, true, encoder_vb.pp("ctc_lin").pp("w"))?;
        let encoder = encoder.with("ctc_lin", Box::new(Block::new().with("w", Box::new(ctc_lin))));

        debug!(
            "Built CTC encoder: {} conv layers, {} transformer layers, vocab {}",
            config.conv_dim.len(),
            config.num_hidden_layers,
            config.vocab_size
        );

        Ok(Self {
            mods: Block::new().with("encoder", Box::new(encoder)),
            config,
            decoder,
            device,
        })
    }

    fn build_wav2vec2(config: &AsrConfig, vb: VarBuilder) -> HarnessResult<Block> {
        let conv_vb = vb.pp("feature_extractor").pp("conv_layers");
        let mut conv_layers = Sequential::default();
        let mut in_channels = 1;
        for (i, ((&dim, &kernel), &stride)) in config
            .conv_dim
            .iter()
            .zip(&config.conv_kernel)
            .zip(&config.conv_stride)
            .enumerate()
        {
            let layer_vb = conv_vb.pp(i);
            let conv = Conv1d::load(in_channels, dim, kernel, stride, config.conv_bias, layer_vb.pp("conv"))?;
            let mut layer = Block::new().with("conv", Box::new(conv));
            match config.feat_extract_norm {
                FeatureNorm::Group if i == 0 => {
                    let norm = GroupNorm::load(dim, dim, config.layer_norm_eps, layer_vb.pp("layer_norm"))?;
                    layer.insert("layer_norm", Box::new(norm));
                }
                FeatureNorm::Layer => {
                    let norm = LayerNorm::load_channels_first(dim, config.layer_norm_eps, layer_vb.pp("layer_norm"))?;
                    layer.insert("layer_norm", Box::new(norm));
                }
                FeatureNorm::Group => {}
            }
            conv_layers.push(Box::new(layer.with("activation", Box::new(Activation::Gelu))));
            in_channels = dim;
        }
        let feature_extractor = Block::new()
            .with("conv_layers", Box::new(conv_layers))
            .with("to_frames", Box::new(Transpose::new(1, 2)));

        let proj_vb = vb.pp("feature_projection");
        let feature_projection = Block::new()
            .with(
                "layer_norm",
                Box::new(LayerNorm::load(in_channels, config.layer_norm_eps, proj_vb.pp("layer_norm"))?),
            )
            .with(
                "projection",
                Box::new(Linear::load(in_channels, config.hidden_size, true, proj_vb.pp("projection"))?),
            );

        let enc_vb = vb.pp("encoder");
        let mut layers = Sequential::default();
        for i in 0..config.num_hidden_layers {
            layers.push(Box::new(TransformerLayer::load_with_norm(
                config.hidden_size,
                config.num_attention_heads,
                config.intermediate_size,
                config.layer_norm_eps,
                config.do_stable_layer_norm,
                enc_vb.pp("layers").pp(i),
            )?));
        }
        let pos_conv_embed = PositionalConvEmbedding::load(
            config.hidden_size,
            config.num_conv_pos_embeddings,
            config.num_conv_pos_embedding_groups,
            enc_vb.pp("pos_conv_embed"),
        )?;
        let layer_norm = LayerNorm::load(config.hidden_size, config.layer_norm_eps, enc_vb.pp("layer_norm"))?;
        let encoder = Block::new().with("pos_conv_embed", Box::new(pos_conv_embed));
        let encoder = if config.do_stable_layer_norm {
            encoder
                .with("layers", Box::new(layers))
                .with("layer_norm", Box::new(layer_norm))
        } else {
            encoder
                .with("layer_norm", Box::new(layer_norm))
                .with("layers", Box::new(layers))
        };

        Ok(Block::new()
            .with("feature_extractor", Box::new(feature_extractor))
            .with("feature_projection", Box::new(feature_projection))
            .with("encoder", Box::new(encoder)))
    }

    fn build_enc(config: &AsrConfig, vb: VarBuilder) -> HarnessResult<Block> {
        let mut enc = Block::new();
        let mut in_dim = config.hidden_size;
        for (k, &out_dim) in config.enc_dims.iter().enumerate() {
            let index = k + 1;
            let name = format!("linear{}", index);
            let linear = Linear::load(in_dim, out_dim, true, vb.pp(&name).pp("w"))?;
            enc.insert(&name, Box::new(Block::new().with("w", Box::new(linear))));
            enc.insert(
                &format!("activation{}", index),
                Box::new(Activation::LeakyRelu(config.enc_negative_slope)),
            );
            in_dim = out_dim;
        }
        Ok(enc)
    }

    pub fn config(&self) -> &AsrConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    /// Waveform → normalized `(1, 1, T)` tensor on the model device.
    pub fn preprocess_input(&self, audio: &[f32]) -> HarnessResult<Tensor> {
        if audio.is_empty() {
            return Err(HarnessError::Data("cannot transcribe empty audio".to_string()));
        }
        if self.config.frames_for(audio.len()) == 0 {
            return Err(HarnessError::Data(format!(
                "audio of {} samples is shorter than the feature extractor receptive field",
                audio.len()
            )));
        }

        let n = audio.len() as f32;
        let mean = audio.iter().sum::<f32>() / n;
        let variance = audio.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / n;
        let std = (variance + 1e-7).sqrt();
        let normalized: Vec<f32> = audio.iter().map(|x| (x - mean) / std).collect();

        Ok(Tensor::from_vec(normalized, (1, 1, audio.len()), &self.device)?)
    }

    /// Run `mods.encoder`, returning `(1, frames, vocab)` logits.
    ///
    /// The encoder's own name is not pushed onto the scope, so recorded
    /// FLOP paths are relative to `encoder`.
    pub fn encode(&self, wavs: &Tensor, ctx: &mut ForwardCtx) -> HarnessResult<Tensor> {
        let encoder = self
            .mods
            .get("encoder")
            .ok_or_else(|| HarnessError::Internal("model has no encoder".to_string()))?;
        encoder.forward(wavs, ctx)
    }

    /// Greedy CTC decoding of a single utterance.
    pub fn decode(&self, logits: &Tensor) -> HarnessResult<String> {
        let ids: Vec<u32> = logits.argmax(D::Minus1)?.squeeze(0)?.to_vec1()?;
        let tokens = ctc_collapse(&ids, self.config.blank_id);
        self.decoder.decode(&tokens)
    }
}

/// Collapse repeated ids and drop blanks.
pub fn ctc_collapse(ids: &[u32], blank_id: u32) -> Vec<u32> {
    let mut tokens = Vec::with_capacity(ids.len());
    let mut previous = None;
    for &id in ids {
        if previous != Some(id) && id != blank_id {
            tokens.push(id);
        }
        previous = Some(id);
    }
    tokens
}

impl Transcriber for EncoderAsr {
    fn transcribe(&self, audio: &[f32]) -> HarnessResult<String> {
        Ok(self.timed_transcribe(audio)?.0)
    }

    fn timed_transcribe(&self, audio: &[f32]) -> HarnessResult<(String, Duration)> {
        let wavs = self.preprocess_input(audio)?;

        let start = Instant::now();
        let logits = self.encode(&wavs, &mut ForwardCtx::new())?;
        let elapsed = start.elapsed();

        Ok((self.decode(&logits)?, elapsed))
    }
}

impl QuantizableModel for EncoderAsr {
    fn mods(&self) -> &dyn Module {
        &self.mods
    }

    fn mods_mut(&mut self) -> &mut dyn Module {
        &mut self.mods
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{get_module, ModuleKind};
    use crate::testing::{tiny_config, tiny_model};

    #[test]
    fn test_config_defaults_from_json() {
        let json = r#"{
            "conv_dim": [8, 8], "conv_kernel": [10, 3], "conv_stride": [5, 2],
            "hidden_size": 8, "num_hidden_layers": 1, "num_attention_heads": 2,
            "intermediate_size": 16, "vocab_size": 6, "pad_token_id": 0
        }"#;
        let config: AsrConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.sample_rate, 16_000);
        assert_eq!(config.blank_id, 0);
        assert!(config.enc_dims.is_empty());
        assert_eq!(config.feat_extract_norm, FeatureNorm::Group);
        assert_eq!(config.num_conv_pos_embeddings, 128);
        config.validate().unwrap();
    }

    #[test]
    fn test_stable_layer_norm_tree() {
        let config = AsrConfig {
            feat_extract_norm: FeatureNorm::Layer,
            do_stable_layer_norm: true,
            enc_dims: Vec::new(),
            ..tiny_config()
        };
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, candle_core::DType::F32, &Device::Cpu);
        let decoder = Arc::new(crate::model::vocab::CharVocabulary::from_json(crate::testing::TINY_VOCAB).unwrap());
        let model = EncoderAsr::load(config, vb, decoder).unwrap();
        let mods = model.mods();

        for i in 0..2 {
            let path = format!("encoder.wav2vec2.model.feature_extractor.conv_layers.{}.layer_norm", i);
            assert_eq!(get_module(mods, &path).unwrap().kind(), ModuleKind::LayerNorm);
        }
        assert!(get_module(mods, "encoder.enc").is_err());
        let encoder = get_module(mods, "encoder.wav2vec2.model.encoder").unwrap();
        let order: Vec<String> = encoder.children().iter().map(|(segment, _)| segment.to_string()).collect();
        assert_eq!(order, vec!["pos_conv_embed", "layers", "layer_norm"]);

        let audio: Vec<f32> = (0..1600).map(|i| (i as f32 * 0.05).sin()).collect();
        assert!(model.transcribe(&audio).is_ok());
    }

    #[test]
    fn test_validate_rejects_mismatched_conv_lists() {
        let mut config = tiny_config();
        config.conv_stride.pop();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_frames_for() {
        let config = tiny_config();
        // kernel 10 stride 5, then kernel 3 stride 2
        assert_eq!(config.frames_for(400), 39);
        assert_eq!(config.frames_for(5), 0);
    }

    #[test]
    fn test_module_tree_paths() {
        let model = tiny_model();
        let mods = model.mods();
        for (path, kind) in [
            ("encoder.wav2vec2.model.feature_extractor.conv_layers.0.conv", ModuleKind::Conv1d),
            ("encoder.wav2vec2.model.feature_extractor.conv_layers.0.layer_norm", ModuleKind::GroupNorm),
            ("encoder.wav2vec2.model.encoder.pos_conv_embed", ModuleKind::PositionalConv),
            ("encoder.wav2vec2.model.encoder.pos_conv_embed.conv", ModuleKind::Conv1d),
            ("encoder.wav2vec2.model.feature_projection.projection", ModuleKind::Linear),
            ("encoder.wav2vec2.model.encoder.layers.0.attention.q_proj", ModuleKind::Linear),
            ("encoder.wav2vec2.model.encoder.layers", ModuleKind::Sequential),
            ("encoder.enc.linear1.w", ModuleKind::Linear),
            ("encoder.enc.activation1", ModuleKind::Activation),
            ("encoder.ctc_lin.w", ModuleKind::Linear),
        ] {
            assert_eq!(get_module(mods, path).unwrap().kind(), kind, "{}", path);
        }
        assert!(get_module(mods, "encoder.wav2vec2.model.feature_extractor.conv_layers.1.layer_norm").is_err());
        let encoder = get_module(mods, "encoder.wav2vec2.model.encoder").unwrap();
        let order: Vec<String> = encoder.children().iter().map(|(segment, _)| segment.to_string()).collect();
        assert_eq!(order, vec!["pos_conv_embed", "layer_norm", "layers"]);
    }

    #[test]
    fn test_preprocess_input_normalizes() {
        let model = tiny_model();
        let audio: Vec<f32> = (0..800).map(|i| (i as f32 * 0.01).sin() + 0.5).collect();
        let wavs = model.preprocess_input(&audio).unwrap();
        assert_eq!(wavs.dims(), &[1, 1, 800]);
        let mean: f32 = wavs.mean_all().unwrap().to_scalar().unwrap();
        assert!(mean.abs() < 1e-4);
    }

    #[test]
    fn test_preprocess_rejects_empty_and_short_audio() {
        let model = tiny_model();
        assert!(model.preprocess_input(&[]).is_err());
        assert!(model.preprocess_input(&[0.1; 4]).is_err());
    }

    #[test]
    fn test_encode_produces_frame_logits() {
        let model = tiny_model();
        let wavs = model.preprocess_input(&vec![0.25; 800]).unwrap();
        let logits = model.encode(&wavs, &mut ForwardCtx::new()).unwrap();
        let frames = model.config().frames_for(800);
        assert_eq!(logits.dims(), &[1, frames, model.config().vocab_size]);
    }

    #[test]
    fn test_ctc_collapse() {
        assert_eq!(ctc_collapse(&[0, 3, 3, 0, 3, 4, 4, 0], 0), vec![3, 3, 4]);
        assert!(ctc_collapse(&[0, 0, 0], 0).is_empty());
    }

    #[test]
    fn test_timed_transcribe_matches_transcribe() {
        let model = tiny_model();
        let audio: Vec<f32> = (0..1600).map(|i| ((i % 50) as f32 / 50.0) - 0.5).collect();
        let (text, elapsed) = model.timed_transcribe(&audio).unwrap();
        assert_eq!(text, model.transcribe(&audio).unwrap());
        assert!(elapsed > Duration::ZERO);
    }
}
