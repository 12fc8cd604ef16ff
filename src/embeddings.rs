use crate::error::{RagError, Result};
use anyhow::Context;
use async_trait::async_trait;
use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig, DTYPE};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokenizers::{Tokenizer, TruncationParams};

/// Upper bound on encoder input length, in tokens
const MAX_SEQUENCE_TOKENS: usize = 512;

/// Representation of a vector embedding
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Embedding {
    pub values: Vec<f32>,
}

/// Maps text to fixed-size vectors
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed every text, returning vectors in input order
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Embedding>>;

    /// Length of every vector this embedder produces
    fn dimension(&self) -> usize;

    /// Embed a single text
    async fn embed_one(&self, text: &str) -> Result<Embedding> {
        self.embed(vec![text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| RagError::Embedding("model returned no vector".to_string()))
    }
}

/// Sentence-transformer style encoder running a BERT model on the CPU
#[derive(Clone)]
pub struct SentenceEmbedder {
    encoder: Arc<BertEncoder>,
}

struct BertEncoder {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
    dimension: usize,
}

impl SentenceEmbedder {
    /// Load a model directory holding `config.json`, `tokenizer.json` and `model.safetensors`
    pub fn load(model_dir: &Path) -> anyhow::Result<Self> {
        let files = ModelFiles::locate(model_dir)?;
        let device = Device::Cpu;

        info!("Loading embedding model from {}", model_dir.display());

        let config_str = std::fs::read_to_string(&files.config)
            .with_context(|| format!("Failed to read {}", files.config.display()))?;
        let config: BertConfig =
            serde_json::from_str(&config_str).context("Failed to parse BERT config")?;
        let dimension = hidden_size(&config_str)?;

        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {}", e))?;
        let tokenizer = with_sequence_limit(tokenizer, MAX_SEQUENCE_TOKENS)?;

        // SAFETY: the weights file is not modified while the model is alive
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[&files.weights], DTYPE, &device) }
            .context("Failed to load embedding weights")?;
        let model = BertModel::load(vb, &config).context("Failed to build BERT model")?;

        info!("Embedding model ready ({} dimensions)", dimension);

        Ok(SentenceEmbedder {
            encoder: Arc::new(BertEncoder {
                model,
                tokenizer,
                device,
                dimension,
            }),
        })
    }
}

#[async_trait]
impl Embedder for SentenceEmbedder {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Embedding>> {
        let encoder = Arc::clone(&self.encoder);
        tokio::task::spawn_blocking(move || {
            texts
                .iter()
                .map(|text| encoder.encode(text))
                .collect::<Result<Vec<_>>>()
        })
        .await
        .map_err(RagError::embedding)?
    }

    fn dimension(&self) -> usize {
        self.encoder.dimension
    }
}

impl BertEncoder {
    /// Mean-pool the last hidden state over the attention mask, then L2-normalise
    fn encode(&self, text: &str) -> Result<Embedding> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(RagError::embedding)?;

        let token_ids = encoding.get_ids();
        let attention_mask = encoding.get_attention_mask();

        let values = self.forward(token_ids, attention_mask).map_err(RagError::embedding)?;
        debug!("Embedded {} tokens", token_ids.len());

        Ok(Embedding { values })
    }

    fn forward(&self, token_ids: &[u32], attention_mask: &[u32]) -> candle_core::Result<Vec<f32>> {
        let token_ids = Tensor::new(token_ids, &self.device)?.unsqueeze(0)?;
        let mask = Tensor::new(attention_mask, &self.device)?.unsqueeze(0)?;
        let token_type_ids = token_ids.zeros_like()?;

        let hidden = self.model.forward(&token_ids, &token_type_ids, Some(&mask))?;

        let mask = mask.to_dtype(hidden.dtype())?.unsqueeze(2)?;
        let summed = hidden.broadcast_mul(&mask)?.sum(1)?;
        let counts = mask.sum(1)?;
        let pooled = summed.broadcast_div(&counts)?;

        let norm = pooled.sqr()?.sum_keepdim(1)?.sqrt()?;
        pooled.broadcast_div(&norm)?.squeeze(0)?.to_vec1::<f32>()
    }
}

/// Paths of the three files every local model snapshot must contain
pub(crate) struct ModelFiles {
    pub config: std::path::PathBuf,
    pub tokenizer: std::path::PathBuf,
    pub weights: std::path::PathBuf,
}

impl ModelFiles {
    pub fn locate(model_dir: &Path) -> anyhow::Result<Self> {
        let files = ModelFiles {
            config: model_dir.join("config.json"),
            tokenizer: model_dir.join("tokenizer.json"),
            weights: model_dir.join("model.safetensors"),
        };

        for path in [&files.config, &files.tokenizer, &files.weights] {
            anyhow::ensure!(
                path.exists(),
                "{} not found. Download the complete model snapshot into {}",
                path.display(),
                model_dir.display()
            );
        }

        Ok(files)
    }
}

/// Truncate encodings to `max_tokens`, keeping the post-processor's special tokens
fn with_sequence_limit(mut tokenizer: Tokenizer, max_tokens: usize) -> anyhow::Result<Tokenizer> {
    tokenizer
        .with_truncation(Some(TruncationParams {
            max_length: max_tokens,
            ..Default::default()
        }))
        .map_err(|e| anyhow::anyhow!("Failed to configure truncation: {}", e))?;
    Ok(tokenizer)
}

fn hidden_size(config_str: &str) -> anyhow::Result<usize> {
    let config: serde_json::Value = serde_json::from_str(config_str)?;
    config
        .get("hidden_size")
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .context("config.json has no hidden_size")
}
