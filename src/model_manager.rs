use std::sync::{Mutex, PoisonError};

use candle_core::{Device, Tensor};
use pylate_rs::ColBERT;

use crate::{
    embedding::{EmbeddingProvider, l2_normalize},
    error::{Error, Result},
};

pub const DEFAULT_MODEL_ID: &str = "lightonai/GTE-ModernColBERT-v1";
pub const MODEL_ENV_VAR: &str = "BOOKBERT_MODEL";

/// Select the best available compute device.
///
/// Uses CUDA when compiled with the `cuda` feature, Metal when compiled with
/// the `metal` feature, and falls back to CPU otherwise.
fn default_device() -> Device {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }

    Device::Cpu
}

/// Key of the persisted model setting in `config.redb`.
pub const MODEL_SETTING: &str = "model_name";

/// Where the resolved model id came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSource {
    Flag,
    Env,
    Config,
    Default,
}

impl std::fmt::Display for ModelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Flag => write!(f, "--model"),
            Self::Env => write!(f, "{MODEL_ENV_VAR}"),
            Self::Config => write!(f, "config"),
            Self::Default => write!(f, "default"),
        }
    }
}

/// Resolve the model id: `--model`, then `BOOKBERT_MODEL`, then the stored
/// setting, then the built-in default.
pub fn resolve_model(
    explicit: Option<&str>,
    stored: Option<&str>,
) -> (String, ModelSource) {
    resolve_model_with(explicit, std::env::var(MODEL_ENV_VAR).ok(), stored)
}

fn resolve_model_with(
    explicit: Option<&str>,
    env: Option<String>,
    stored: Option<&str>,
) -> (String, ModelSource) {
    if let Some(id) = explicit {
        (id.to_string(), ModelSource::Flag)
    } else if let Some(id) = env.filter(|v| !v.is_empty()) {
        (id, ModelSource::Env)
    } else if let Some(id) = stored {
        (id.to_string(), ModelSource::Config)
    } else {
        (DEFAULT_MODEL_ID.to_string(), ModelSource::Default)
    }
}

/// A ColBERT model pooled down to one vector per text.
///
/// ColBERT produces a matrix of per-token vectors. Summing them and
/// normalising gives a single vector whose cosine similarity tracks the
/// average token agreement, which is what the hybrid ranker consumes.
pub struct ColbertEmbedder {
    model: Mutex<ColBERT>,
    model_id: String,
}

impl ColbertEmbedder {
    /// Load `model_id`, downloading it from the HuggingFace Hub if needed.
    ///
    /// Blocking; call from a loader passed to
    /// [`LazyEmbedder::new`](crate::embedding::LazyEmbedder::new).
    pub fn load(model_id: impl Into<String>) -> Result<Self> {
        let model_id = model_id.into();
        let colbert: ColBERT = ColBERT::from(&model_id)
            .with_device(default_device())
            .try_into()
            .map_err(|e| {
                Error::Embedding(format!("failed to load {model_id}: {e}"))
            })?;

        Ok(Self {
            model: Mutex::new(colbert),
            model_id,
        })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }
}

impl EmbeddingProvider for ColbertEmbedder {
    fn model(&self) -> &str {
        &self.model_id
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let embeddings = {
            let mut model =
                self.model.lock().unwrap_or_else(PoisonError::into_inner);
            model
                .encode(texts, false)
                .map_err(|e| Error::Embedding(format!("encode failed: {e}")))?
        };

        pool(&embeddings)
    }
}

/// `[batch, tokens, dim]` -> one L2-normalised `dim` vector per batch row.
fn pool(embeddings: &Tensor) -> Result<Vec<Vec<f32>>> {
    let pooled = embeddings
        .sum(1)
        .and_then(|t| t.to_vec2::<f32>())
        .map_err(|e| {
            Error::Embedding(format!("unexpected embedding tensor: {e}"))
        })?;

    Ok(pooled
        .into_iter()
        .map(|mut v| {
            l2_normalize(&mut v);
            v
        })
        .collect())
}
