use crate::embeddings::ModelFiles;
use crate::error::{RagError, Result};
use anyhow::Context;
use async_trait::async_trait;
use candle_core::{DType, Device, Tensor, D};
use candle_nn::VarBuilder;
use candle_transformers::models::t5::{Config as T5Config, T5ForConditionalGeneration};
use log::{debug, info};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokenizers::Tokenizer;

/// Produces an answer to a question from retrieved context
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    /// Cut `text` down to its first `max_tokens` tokens under this generator's tokenizer
    fn truncate_to_tokens(&self, text: &str, max_tokens: usize) -> Result<String>;

    /// Answer `question` using `context`
    async fn generate(&self, question: &str, context: &str) -> Result<String>;
}

/// Limits applied to every generation call
#[derive(Debug, Clone, Copy)]
pub struct GeneratorConfig {
    /// Prompt tokens kept before truncation
    pub max_input_tokens: usize,
    /// Decoder tokens produced at most, start token included
    pub max_answer_tokens: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        GeneratorConfig {
            max_input_tokens: 512,
            max_answer_tokens: 500,
        }
    }
}

/// Build the question-answering prompt fed to the model
pub fn build_prompt(question: &str, context: &str) -> String {
    format!("question: {} context: {}", question, context)
}

/// Keep the first `max_tokens` ids; the final id survives truncation when it is `eos`
pub fn truncate_ids(mut ids: Vec<u32>, max_tokens: usize, eos: u32) -> Vec<u32> {
    if ids.len() <= max_tokens {
        return ids;
    }
    if max_tokens == 0 {
        return Vec::new();
    }

    let ends_with_eos = ids.last() == Some(&eos);
    if ends_with_eos {
        ids.truncate(max_tokens - 1);
        ids.push(eos);
    } else {
        ids.truncate(max_tokens);
    }
    ids
}

/// Cut `text` so that re-encoding it, special tokens included, yields at most `max_tokens` ids.
///
/// Special tokens added by the post-processor count against the budget, so only
/// `max_tokens - specials` content ids are kept.
pub fn truncate_context(tokenizer: &Tokenizer, text: &str, max_tokens: usize) -> Result<String> {
    let encoding = tokenizer.encode(text, true).map_err(RagError::generation)?;
    let ids = encoding.get_ids();

    if ids.len() <= max_tokens {
        return Ok(text.to_string());
    }

    let mask = encoding.get_special_tokens_mask();
    let specials = mask.iter().filter(|&&m| m == 1).count();
    let kept: Vec<u32> = ids
        .iter()
        .zip(mask)
        .filter(|(_, m)| **m == 0)
        .map(|(&id, _)| id)
        .take(max_tokens.saturating_sub(specials))
        .collect();

    debug!("Truncating context from {} to {} tokens", ids.len(), kept.len() + specials);
    tokenizer.decode(&kept, true).map_err(RagError::generation)
}

/// Flan-T5 style encoder-decoder running greedy decoding on the CPU
pub struct T5Generator {
    inner: Arc<T5Inner>,
}

struct T5Inner {
    model: Mutex<T5ForConditionalGeneration>,
    tokenizer: Tokenizer,
    device: Device,
    decoder_start_token: u32,
    eos_token: u32,
    use_cache: bool,
    config: GeneratorConfig,
}

impl T5Generator {
    /// Load a model directory holding `config.json`, `tokenizer.json` and `model.safetensors`
    pub fn load(model_dir: &Path, config: GeneratorConfig) -> anyhow::Result<Self> {
        let files = ModelFiles::locate(model_dir)?;
        let device = Device::Cpu;

        info!("Loading generation model from {}", model_dir.display());

        let config_str = std::fs::read_to_string(&files.config)
            .with_context(|| format!("Failed to read {}", files.config.display()))?;
        let t5_config: T5Config =
            serde_json::from_str(&config_str).context("Failed to parse T5 config")?;

        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {}", e))?;

        // SAFETY: the weights file is not modified while the model is alive
        let vb =
            unsafe { VarBuilder::from_mmaped_safetensors(&[&files.weights], DType::F32, &device) }
                .context("Failed to load generation weights")?;
        let model =
            T5ForConditionalGeneration::load(vb, &t5_config).context("Failed to build T5 model")?;

        let decoder_start_token = t5_config
            .decoder_start_token_id
            .unwrap_or(t5_config.pad_token_id) as u32;
        let eos_token = t5_config.eos_token_id as u32;

        info!("Generation model ready");

        Ok(T5Generator {
            inner: Arc::new(T5Inner {
                model: Mutex::new(model),
                tokenizer,
                device,
                decoder_start_token,
                eos_token,
                use_cache: t5_config.use_cache,
                config,
            }),
        })
    }
}

#[async_trait]
impl AnswerGenerator for T5Generator {
    fn truncate_to_tokens(&self, text: &str, max_tokens: usize) -> Result<String> {
        truncate_context(&self.inner.tokenizer, text, max_tokens)
    }

    async fn generate(&self, question: &str, context: &str) -> Result<String> {
        let inner = Arc::clone(&self.inner);
        let prompt = build_prompt(question, context);

        tokio::task::spawn_blocking(move || inner.generate(&prompt))
            .await
            .map_err(RagError::generation)?
    }
}

impl T5Inner {
    fn generate(&self, prompt: &str) -> Result<String> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(RagError::generation)?;
        let input_ids = truncate_ids(
            encoding.get_ids().to_vec(),
            self.config.max_input_tokens,
            self.eos_token,
        );

        let output_ids = self.decode_greedy(&input_ids).map_err(RagError::generation)?;
        debug!(
            "Generated {} tokens from a {} token prompt",
            output_ids.len(),
            input_ids.len()
        );

        self.tokenizer
            .decode(&output_ids, true)
            .map_err(RagError::generation)
    }

    fn decode_greedy(&self, input_ids: &[u32]) -> candle_core::Result<Vec<u32>> {
        let mut model = self
            .model
            .lock()
            .map_err(|_| candle_core::Error::Msg("generation model lock poisoned".to_string()))?;
        model.clear_kv_cache();

        let input = Tensor::new(input_ids, &self.device)?.unsqueeze(0)?;
        let encoder_output = model.encode(&input)?;

        let mut output_ids = vec![self.decoder_start_token];
        while output_ids.len() < self.config.max_answer_tokens {
            // With the KV cache on, earlier positions are already cached
            let decoder_input = if self.use_cache && output_ids.len() > 1 {
                let last = output_ids[output_ids.len() - 1];
                Tensor::new(&[last], &self.device)?.unsqueeze(0)?
            } else {
                Tensor::new(output_ids.as_slice(), &self.device)?.unsqueeze(0)?
            };

            let logits = model.decode(&decoder_input, &encoder_output)?.squeeze(0)?;
            let next = logits.argmax(D::Minus1)?.to_scalar::<u32>()?;
            if next == self.eos_token {
                break;
            }
            output_ids.push(next);
        }

        model.clear_kv_cache();
        Ok(output_ids)
    }
}
