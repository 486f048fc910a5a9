//! # Model Presets
//!
//! A preset names a pretrained model, where to cache it, and which of its
//! submodules may be quantized with which method.
//!
//! ## Key Components:
//! - **QuantMethod**: static or dynamic
//! - **ModelPreset**: model source, cache directory, per-module methods,
//!   the combined plan for the overall experiment and low-bit group widths
//! - **low_bit_groups()**: individual linear / conv layers per module group,
//!   derived from the model architecture
//!
//! Custom presets are TOML files with the same fields as [`ModelPreset`].

use crate::error::{HarnessError, HarnessResult};
use crate::model::AsrConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Quantization method allowed for a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantMethod {
    Static,
    Dynamic,
}

/// A submodule and the methods it can be quantized with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleEntry {
    pub path: String,
    #[serde(default)]
    pub methods: Vec<QuantMethod>,
}

/// Module lists for the combined dynamic + static run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverallPlan {
    pub label: String,
    #[serde(default)]
    pub dynamic: Vec<String>,
    #[serde(default, rename = "static")]
    pub static_modules: Vec<String>,
}

/// Bit width for one low-bit module group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupBits {
    pub module: String,
    pub bits: u8,
}

/// Everything an experiment needs to know about a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPreset {
    pub name: String,
    /// Local directory or Hugging Face Hub repository id
    pub source: String,
    /// Download cache for hub sources
    pub savedir: String,
    pub modules: Vec<ModuleEntry>,
    #[serde(default)]
    pub overall: OverallPlan,
    #[serde(default)]
    pub mixed_bits: Vec<GroupBits>,
}

pub const WAV2VEC2_ENC: &str = "encoder.enc";
pub const WAV2VEC2_LAYERS: &str = "encoder.wav2vec2.model.encoder.layers";
pub const WAV2VEC2_PROJECTION: &str = "encoder.wav2vec2.model.feature_projection";
pub const WAV2VEC2_EXTRACTOR: &str = "encoder.wav2vec2.model.feature_extractor";
pub const WAV2VEC2_CTC: &str = "encoder.ctc_lin";

impl ModelPreset {
    /// wav2vec2-base fine-tuned for CTC on 960 h of LibriSpeech.
    pub fn wav2vec2() -> Self {
        let entry = |path: &str, methods: &[QuantMethod]| ModuleEntry {
            path: path.to_string(),
            methods: methods.to_vec(),
        };
        let bits = |module: &str, bits: u8| GroupBits {
            module: module.to_string(),
            bits,
        };

        Self {
            name: "wav2vec2".to_string(),
            source: "facebook/wav2vec2-base-960h".to_string(),
            savedir: "pretrained/wav2vec2-base-960h".to_string(),
            modules: vec![
                entry(WAV2VEC2_PROJECTION, &[QuantMethod::Static, QuantMethod::Dynamic]),
                entry(WAV2VEC2_EXTRACTOR, &[QuantMethod::Static]),
                entry(WAV2VEC2_LAYERS, &[QuantMethod::Dynamic]),
                entry(WAV2VEC2_CTC, &[QuantMethod::Dynamic]),
            ],
            overall: OverallPlan {
                label: "Quantized Model (dynamic layers; static proj, extract)".to_string(),
                dynamic: vec![WAV2VEC2_LAYERS.to_string()],
                static_modules: vec![WAV2VEC2_PROJECTION.to_string(), WAV2VEC2_EXTRACTOR.to_string()],
            },
            mixed_bits: vec![
                bits(WAV2VEC2_LAYERS, 6),
                bits(WAV2VEC2_PROJECTION, 3),
                bits(WAV2VEC2_EXTRACTOR, 5),
            ],
        }
    }

    pub fn from_toml_str(contents: &str) -> HarnessResult<Self> {
        let preset: Self = toml::from_str(contents)?;
        preset.validate()?;
        Ok(preset)
    }

    pub fn from_toml_file(path: &Path) -> HarnessResult<Self> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    /// A built-in preset name, or a path to a TOML preset.
    pub fn resolve(name_or_path: &str) -> HarnessResult<Self> {
        match name_or_path {
            "wav2vec2" => Ok(Self::wav2vec2()),
            other => {
                let path = Path::new(other);
                if !path.is_file() {
                    return Err(HarnessError::ConfigError(format!(
                        "Unknown preset '{}': not a built-in name or a TOML file",
                        other
                    )));
                }
                Self::from_toml_file(path)
            }
        }
    }

    pub fn validate(&self) -> HarnessResult<()> {
        if self.modules.is_empty() {
            return Err(HarnessError::ConfigError(format!("Preset '{}' lists no modules", self.name)));
        }
        if let Some(group) = self.mixed_bits.iter().find(|g| !(1..=8).contains(&g.bits)) {
            return Err(HarnessError::ConfigError(format!(
                "Bit width for {} must be between 1 and 8, got {}",
                group.module, group.bits
            )));
        }
        Ok(())
    }

    pub fn module_paths(&self) -> Vec<String> {
        self.modules.iter().map(|m| m.path.clone()).collect()
    }

    /// Modules allowing `method`, in preset order.
    pub fn modules_with(&self, method: QuantMethod) -> Vec<String> {
        self.modules
            .iter()
            .filter(|m| m.methods.contains(&method))
            .map(|m| m.path.clone())
            .collect()
    }
}

/// The individual quantizable layers of one module group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LowBitGroup {
    pub module: String,
    pub layers: Vec<String>,
}

/// Layer groups for low-bit wrapping, derived from the architecture:
/// the `enc` head when the model has one, the transformer layers, the
/// feature projection and the feature extractor convolutions.
pub fn low_bit_groups(config: &AsrConfig) -> Vec<LowBitGroup> {
    let enc = (1..=config.enc_dims.len())
        .map(|k| format!("{}.linear{}.w", WAV2VEC2_ENC, k))
        .collect();

    let mut layers = Vec::with_capacity(config.num_hidden_layers * 6);
    for i in 0..config.num_hidden_layers {
        for name in ["k_proj", "v_proj", "q_proj", "out_proj"] {
            layers.push(format!("{}.{}.attention.{}", WAV2VEC2_LAYERS, i, name));
        }
        for name in ["intermediate_dense", "output_dense"] {
            layers.push(format!("{}.{}.feed_forward.{}", WAV2VEC2_LAYERS, i, name));
        }
    }

    let projection = vec![format!("{}.projection", WAV2VEC2_PROJECTION)];
    let extractor = (0..config.conv_dim.len())
        .map(|i| format!("{}.conv_layers.{}.conv", WAV2VEC2_EXTRACTOR, i))
        .collect();

    let mut groups = Vec::with_capacity(4);
    if !config.enc_dims.is_empty() {
        groups.push(LowBitGroup {
            module: WAV2VEC2_ENC.to_string(),
            layers: enc,
        });
    }
    groups.extend([
        LowBitGroup {
            module: WAV2VEC2_LAYERS.to_string(),
            layers,
        },
        LowBitGroup {
            module: WAV2VEC2_PROJECTION.to_string(),
            layers: projection,
        },
        LowBitGroup {
            module: WAV2VEC2_EXTRACTOR.to_string(),
            layers: extractor,
        },
    ]);
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::get_module;
    use crate::model::{Module, QuantizableModel};
    use crate::testing::{tiny_config, tiny_model};

    #[test]
    fn test_wav2vec2_methods() {
        let preset = ModelPreset::wav2vec2();
        assert!(preset.validate().is_ok());
        assert_eq!(
            preset.modules_with(QuantMethod::Static),
            vec![WAV2VEC2_PROJECTION.to_string(), WAV2VEC2_EXTRACTOR.to_string()]
        );
        assert_eq!(
            preset.modules_with(QuantMethod::Dynamic),
            vec![
                WAV2VEC2_PROJECTION.to_string(),
                WAV2VEC2_LAYERS.to_string(),
                WAV2VEC2_CTC.to_string()
            ]
        );
        assert_eq!(preset.mixed_bits.iter().map(|g| g.bits).collect::<Vec<_>>(), vec![6, 3, 5]);
    }

    #[test]
    fn test_toml_round_trip_keeps_static_key() {
        let preset = ModelPreset::wav2vec2();
        let text = toml::to_string(&preset).unwrap();
        assert!(text.contains("static = ["));
        assert_eq!(ModelPreset::from_toml_str(&text).unwrap(), preset);
    }

    #[test]
    fn test_custom_preset_from_toml() {
        let text = r#"
            name = "small"
            source = "models/small"
            savedir = "pretrained/small"

            [[modules]]
            path = "encoder.ctc_lin"
            methods = ["dynamic"]

            [[mixed_bits]]
            module = "encoder.ctc_lin"
            bits = 9
        "#;
        let err = ModelPreset::from_toml_str(text).unwrap_err();
        assert!(err.to_string().contains("between 1 and 8"));

        let preset = ModelPreset::from_toml_str(&text.replace("bits = 9", "bits = 2")).unwrap();
        assert_eq!(preset.modules_with(QuantMethod::Static), Vec::<String>::new());
        assert!(preset.overall.dynamic.is_empty());
    }

    #[test]
    fn test_resolve_unknown_preset() {
        assert!(ModelPreset::resolve("wav2vec2").is_ok());
        assert!(ModelPreset::resolve("/nonexistent/preset.toml").is_err());
    }

    #[test]
    fn test_low_bit_groups_resolve_on_model() {
        let config = tiny_config();
        let groups = low_bit_groups(&config);
        assert_eq!(groups.len(), 4);
        assert_eq!(groups[0].layers.len(), config.enc_dims.len());
        assert_eq!(groups[1].layers.len(), 6 * config.num_hidden_layers);
        assert_eq!(groups[1].layers[0], "encoder.wav2vec2.model.encoder.layers.0.attention.k_proj");
        assert_eq!(groups[3].layers.len(), config.conv_dim.len());

        let model = tiny_model();
        for layer in groups.iter().flat_map(|g| g.layers.iter()) {
            assert!(get_module(model.mods(), layer).unwrap().weighted_layer().is_some(), "{}", layer);
        }
    }

    #[test]
    fn test_low_bit_groups_skip_missing_enc_head() {
        let config = AsrConfig {
            enc_dims: Vec::new(),
            ..tiny_config()
        };
        let modules: Vec<String> = low_bit_groups(&config).into_iter().map(|g| g.module).collect();
        assert_eq!(modules, vec![WAV2VEC2_LAYERS, WAV2VEC2_PROJECTION, WAV2VEC2_EXTRACTOR]);
    }
}
