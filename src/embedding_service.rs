use cfg_if::cfg_if;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[cfg(feature = "local-embeddings")]
    #[error("Tokenizer error: {0}")]
    TokenizerError(#[from] tokenizers::Error),

    #[cfg(feature = "local-embeddings")]
    #[error("Model error: {0}")]
    ModelError(#[from] candle_core::Error),

    #[error("Initialization error: {0}")]
    InitError(String),

    #[error("Empty input")]
    EmptyInput,
}

/// Turns query text into a dense vector for the local index.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const CONFIG_FILE: &str = "config.json";

/// all-MiniLM-L6-v2, used when the model directory has no `config.json`.
pub const MINILM_CONFIG: &str = r#"{
    "vocab_size": 30522,
    "hidden_size": 384,
    "num_hidden_layers": 6,
    "num_attention_heads": 12,
    "intermediate_size": 1536,
    "hidden_act": "gelu",
    "hidden_dropout_prob": 0.1,
    "max_position_embeddings": 512,
    "type_vocab_size": 2,
    "initializer_range": 0.02,
    "layer_norm_eps": 1e-12,
    "pad_token_id": 0,
    "position_embedding_type": "absolute",
    "use_cache": true,
    "classifier_dropout": null,
    "model_type": "bert"
}"#;

cfg_if! {
    if #[cfg(feature = "local-embeddings")] {
        use candle_core::{DType, Device, Tensor};
        use candle_nn::VarBuilder;
        use candle_transformers::models::bert::{BertModel, Config};
        use log::info;
        use tokenizers::Tokenizer;

        // sentence-transformers truncates MiniLM input at 256 word pieces
        const MAX_TOKENS: usize = 256;

        /// Averages token states where `mask` is set.
        /// `hidden` is (batch, seq, dim) and `mask` is (batch, seq).
        pub(crate) fn mean_pool(hidden: &Tensor, mask: &Tensor) -> candle_core::Result<Tensor> {
            let mask = mask.to_dtype(hidden.dtype())?.unsqueeze(2)?;
            let summed = hidden.broadcast_mul(&mask)?.sum(1)?;
            let counts = mask.sum(1)?.maximum(1e-9)?;
            summed.broadcast_div(&counts)
        }

        pub(crate) fn l2_normalize(vectors: &Tensor) -> candle_core::Result<Tensor> {
            let norms = vectors.sqr()?.sum_keepdim(1)?.sqrt()?.maximum(1e-12)?;
            vectors.broadcast_div(&norms)
        }

        /// Full BERT encoder with sentence-transformers pooling: masked mean
        /// over the last hidden state, then unit length.
        struct SentenceEncoder {
            model: BertModel,
            device: Device,
        }

        impl SentenceEncoder {
            fn load(vb: VarBuilder, config: &Config, device: Device) -> candle_core::Result<Self> {
                let model = BertModel::load(vb, config)?;
                Ok(Self { model, device })
            }

            fn encode(&self, ids: &[u32], mask: &[u32]) -> candle_core::Result<Vec<f32>> {
                let input_ids = Tensor::new(ids, &self.device)?.unsqueeze(0)?;
                let attention_mask = Tensor::new(mask, &self.device)?.unsqueeze(0)?;
                let token_type_ids = input_ids.zeros_like()?;

                let hidden = self
                    .model
                    .forward(&input_ids, &token_type_ids, Some(&attention_mask))?;
                let pooled = mean_pool(&hidden, &attention_mask)?;
                l2_normalize(&pooled)?.squeeze(0)?.to_vec1()
            }
        }

        /// MiniLM sentence encoder running on the CPU.
        pub struct LocalEmbeddingService {
            encoder: SentenceEncoder,
            tokenizer: Tokenizer,
        }

        fn load_config(model_dir: &Path) -> Result<Config, EmbeddingError> {
            let path = model_dir.join(CONFIG_FILE);
            let raw = if path.exists() {
                std::fs::read_to_string(&path)
                    .map_err(|e| EmbeddingError::InitError(format!("{}: {}", path.display(), e)))?
            } else {
                MINILM_CONFIG.to_string()
            };
            serde_json::from_str(&raw).map_err(|e| EmbeddingError::InitError(format!("invalid model config: {}", e)))
        }

        impl LocalEmbeddingService {
            pub fn new(model_dir: &Path) -> Result<Self, EmbeddingError> {
                info!("Initializing LocalEmbeddingService from {}", model_dir.display());

                let device = Device::Cpu;

                let tokenizer = Tokenizer::from_file(model_dir.join(TOKENIZER_FILE))
                    .map_err(EmbeddingError::TokenizerError)?;
                let config = load_config(model_dir)?;

                let weights = model_dir.join(WEIGHTS_FILE);
                // SAFETY: the weights file is only read, and is not modified while mapped.
                let vb = unsafe {
                    VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, &device)
                }
                .map_err(|e| EmbeddingError::InitError(e.to_string()))?;

                let encoder = SentenceEncoder::load(vb, &config, device)?;
                info!("Local embedding model ready");

                Ok(Self { encoder, tokenizer })
            }
        }

        impl Embedder for LocalEmbeddingService {
            fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
                if text.trim().is_empty() {
                    return Err(EmbeddingError::EmptyInput);
                }

                let encoding = self.tokenizer.encode(text, true)?;
                let len = encoding.get_ids().len().min(MAX_TOKENS);
                let ids = &encoding.get_ids()[..len];
                let mask = &encoding.get_attention_mask()[..len];

                Ok(self.encoder.encode(ids, mask)?)
            }
        }

        pub fn load_local_embedder(model_dir: &Path) -> Result<std::sync::Arc<dyn Embedder>, EmbeddingError> {
            Ok(std::sync::Arc::new(LocalEmbeddingService::new(model_dir)?))
        }
    } else {
        pub fn load_local_embedder(model_dir: &Path) -> Result<std::sync::Arc<dyn Embedder>, EmbeddingError> {
            Err(EmbeddingError::InitError(format!(
                "built without the local-embeddings feature, cannot load {}",
                model_dir.display()
            )))
        }
    }
}
