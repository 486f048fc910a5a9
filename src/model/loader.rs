//! # Model Loading
//!
//! Resolves the files of a pretrained CTC model and builds an [`EncoderAsr`].
//!
//! ## Model Directory Layout:
//! - `config.json`: architecture ([`AsrConfig`])
//! - `model.safetensors`: weights named after module paths, or in the
//!   Hugging Face `Wav2Vec2ForCTC` layout (`wav2vec2.*`, `lm_head.*`)
//! - `tokenizer.json` or `vocab.json`: token decoder
//!
//! Every tensor in the checkpoint must be consumed by the model. Leftovers
//! mean the architecture was misread, so loading fails instead of running
//! with silently missing pieces.
//!
//! ## Sources:
//! - **Local directory**: files are read in place
//! - **Hugging Face Hub**: files are downloaded (and cached) with `hf-hub`

use crate::error::{HarnessError, HarnessResult};
use crate::model::vocab::{CharVocabulary, HfTokenizer, TokenDecoder};
use crate::model::{AsrConfig, EncoderAsr};
use candle_core::safetensors::MmapedSafetensors;
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, error, info};

/// Where to load a model from.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelSource {
    LocalDir(PathBuf),
    Hub {
        repo: String,
        cache_dir: Option<PathBuf>,
    },
}

impl ModelSource {
    /// An existing directory is a local model, anything else a Hub repository id.
    pub fn parse(source: &str, cache_dir: Option<PathBuf>) -> Self {
        let path = Path::new(source);
        if path.is_dir() {
            ModelSource::LocalDir(path.to_path_buf())
        } else {
            ModelSource::Hub {
                repo: source.to_string(),
                cache_dir,
            }
        }
    }
}

/// Resolved on-disk model files.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub weights: PathBuf,
    pub tokenizer: Option<PathBuf>,
    pub vocab: Option<PathBuf>,
}

impl ModelFiles {
    fn in_dir(dir: &Path) -> HarnessResult<Self> {
        let existing = |name: &str| {
            let path = dir.join(name);
            path.is_file().then_some(path)
        };
        let config = existing("config.json")
            .ok_or_else(|| HarnessError::Model(format!("{} has no config.json", dir.display())))?;
        let weights = existing("model.safetensors")
            .ok_or_else(|| HarnessError::Model(format!("{} has no model.safetensors", dir.display())))?;
        Ok(Self {
            config,
            weights,
            tokenizer: existing("tokenizer.json"),
            vocab: existing("vocab.json"),
        })
    }
}

/// Load a model from `source` onto `device`.
///
/// ## Loading Process:
/// 1. Resolve (and download if needed) the model files
/// 2. Parse and validate `config.json`
/// 3. Build the token decoder
/// 4. Memory-map the safetensors weights and build the module tree
pub async fn load_model(source: &ModelSource, device: &Device) -> HarnessResult<EncoderAsr> {
    let start_time = Instant::now();
    let files = match source {
        ModelSource::LocalDir(dir) => {
            info!("Loading model from {}", dir.display());
            ModelFiles::in_dir(dir)?
        }
        ModelSource::Hub { repo, cache_dir } => fetch_from_hub(repo, cache_dir.as_deref()).await?,
    };

    let model = load_from_files(&files, device)?;
    info!(
        "Model loaded in {:.2}s ({} transformer layers)",
        start_time.elapsed().as_secs_f64(),
        model.config().num_hidden_layers
    );
    Ok(model)
}

/// Build a model from already resolved files.
pub fn load_from_files(files: &ModelFiles, device: &Device) -> HarnessResult<EncoderAsr> {
    let config: AsrConfig = serde_json::from_reader(std::fs::File::open(&files.config)?)?;
    debug!("Model config: {:?}", config);

    let decoder: Arc<dyn TokenDecoder> = match (&files.tokenizer, &files.vocab) {
        (Some(tokenizer), _) => Arc::new(HfTokenizer::from_file(tokenizer)?),
        (None, Some(vocab)) => Arc::new(CharVocabulary::from_file(vocab)?),
        (None, None) => {
            return Err(HarnessError::Model(
                "model has neither tokenizer.json nor vocab.json".to_string(),
            ))
        }
    };
    if decoder.vocab_size() < config.vocab_size {
        return Err(HarnessError::Model(format!(
            "decoder knows {} tokens but the model emits {}",
            decoder.vocab_size(),
            config.vocab_size
        )));
    }

    debug!("Loading model weights from {}", files.weights.display());
    // Safety: the weights file is not modified while the model is alive
    let stored: Vec<String> = unsafe { MmapedSafetensors::new(&files.weights)? }
        .tensors()
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    let layout = CheckpointLayout::detect(&stored);
    if layout == CheckpointLayout::HuggingFace && !config.enc_dims.is_empty() {
        return Err(HarnessError::Model(
            "Hugging Face wav2vec2 checkpoints have no enc head; enc_dims must be empty".to_string(),
        ));
    }
    debug!("Checkpoint layout: {:?}", layout);

    let requested = Arc::new(Mutex::new(HashSet::new()));
    let recorder = Arc::clone(&requested);
    // Safety: as above
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[&files.weights], DType::F32, device)? }.rename_f(
        move |name: &str| {
            let stored_name = layout.stored_name(name);
            if let Ok(mut seen) = recorder.lock() {
                seen.insert(stored_name.clone());
            }
            stored_name
        },
    );
    let model = EncoderAsr::load(config, vb, decoder)?;

    let requested = requested
        .lock()
        .map_err(|_| HarnessError::Internal("tensor name recorder poisoned".to_string()))?;
    check_all_used(&stored, &requested)?;
    Ok(model)
}

/// Tensor naming of a safetensors checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointLayout {
    /// Names are module paths (`encoder.wav2vec2.model.*`, `encoder.ctc_lin.w.*`)
    ModulePaths,
    /// `Wav2Vec2ForCTC` names (`wav2vec2.*`, `lm_head.*`)
    HuggingFace,
}

const MODULE_PREFIX: &str = "encoder.wav2vec2.model.";
const MODULE_HEAD_PREFIX: &str = "encoder.ctc_lin.w.";
const HF_PREFIX: &str = "wav2vec2.";
const HF_HEAD_PREFIX: &str = "lm_head.";

/// Training-only tensors that inference never reads.
const IGNORED_TENSORS: [&str; 1] = ["wav2vec2.masked_spec_embed"];

impl CheckpointLayout {
    pub fn detect(names: &[String]) -> Self {
        if names.iter().any(|name| name.starts_with(HF_PREFIX) || name.starts_with(HF_HEAD_PREFIX)) {
            CheckpointLayout::HuggingFace
        } else {
            CheckpointLayout::ModulePaths
        }
    }

    /// Name under which the tensor for module path `name` is stored.
    pub fn stored_name(self, name: &str) -> String {
        if self == CheckpointLayout::HuggingFace {
            if let Some(rest) = name.strip_prefix(MODULE_PREFIX) {
                return format!("{}{}", HF_PREFIX, rest);
            }
            if let Some(rest) = name.strip_prefix(MODULE_HEAD_PREFIX) {
                return format!("{}{}", HF_HEAD_PREFIX, rest);
            }
        }
        name.to_string()
    }
}

fn check_all_used(stored: &[String], requested: &HashSet<String>) -> HarnessResult<()> {
    let mut unused: Vec<&str> = stored
        .iter()
        .map(String::as_str)
        .filter(|name| !requested.contains(*name) && !IGNORED_TENSORS.contains(name))
        .collect();
    if unused.is_empty() {
        return Ok(());
    }
    unused.sort_unstable();
    let shown = unused.iter().take(5).copied().collect::<Vec<_>>().join(", ");
    Err(HarnessError::Model(format!(
        "{} checkpoint tensor(s) not used by the model: {}{}",
        unused.len(),
        shown,
        if unused.len() > 5 { ", ..." } else { "" }
    )))
}

async fn fetch_from_hub(repo_id: &str, cache_dir: Option<&Path>) -> HarnessResult<ModelFiles> {
    use hf_hub::api::tokio::{Api, ApiBuilder};

    info!("Fetching model {} from the Hugging Face Hub", repo_id);
    let mut builder = ApiBuilder::new().with_token(std::env::var("HF_TOKEN").ok());
    if let Some(dir) = cache_dir {
        debug!("Using cache dir: {}", dir.display());
        builder = builder.with_cache_dir(dir.to_path_buf());
    }
    let api = match builder.with_progress(false).build() {
        Ok(api) => api,
        Err(e) => {
            error!("ApiBuilder failed: {}, trying fallback to Api::new()", e);
            Api::new()?
        }
    };

    let repo = api.model(repo_id.to_string());
    let config = repo.get("config.json").await?;
    let weights = repo.get("model.safetensors").await?;
    let tokenizer = match repo.get("tokenizer.json").await {
        Ok(path) => Some(path),
        Err(e) => {
            debug!("No tokenizer.json in {}: {}", repo_id, e);
            None
        }
    };
    let vocab = if tokenizer.is_none() {
        Some(repo.get("vocab.json").await?)
    } else {
        None
    };

    Ok(ModelFiles {
        config,
        weights,
        tokenizer,
        vocab,
    })
}
