use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvironmentVar(String),

    #[error("Invalid value for {name}: {value}")]
    Invalid { name: String, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalBackend {
    Chroma,
    Pinecone,
}

impl FromStr for RetrievalBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "chroma" | "local" => Ok(RetrievalBackend::Chroma),
            "pinecone" | "cloud" => Ok(RetrievalBackend::Pinecone),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    Groq,
    Ollama,
}

impl FromStr for LlmProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "groq" => Ok(LlmProvider::Groq),
            "ollama" => Ok(LlmProvider::Ollama),
            _ => Err(()),
        }
    }
}

/// How the orchestrator phrases the generation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptStrategy {
    /// Source-only answers with inline `^N` markers requested from the model.
    Grounded,
    /// Follow-up aware answers with a conversation preamble; a marker is
    /// inserted after generation.
    Conversational,
}

impl FromStr for PromptStrategy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "grounded" => Ok(PromptStrategy::Grounded),
            "conversational" => Ok(PromptStrategy::Conversational),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChromaSettings {
    pub url: String,
    pub collection: String,
    pub model_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct PineconeSettings {
    pub api_key: String,
    pub index_name: String,
    pub index_host: Option<String>,
    pub embed_model: String,
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub provider: LlmProvider,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub groq_api_key: Option<String>,
    pub groq_api_base: String,
    pub ollama_url: String,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub chunk_words: usize,
    pub chunk_delay: Duration,
    pub status_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct Icd11Settings {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone)]
pub struct SupabaseSettings {
    pub url: String,
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub jwt_secret: String,
    pub retrieval_backend: RetrievalBackend,
    pub chroma: ChromaSettings,
    pub pinecone: Option<PineconeSettings>,
    pub llm: LlmSettings,
    pub prompt_strategy: PromptStrategy,
    pub retrieval_top_k: usize,
    pub history_turns: usize,
    pub provider_timeout: Duration,
    pub provider_retries: u32,
    pub stream: StreamSettings,
    pub verified_answers_path: Option<PathBuf>,
    pub icd11: Option<Icd11Settings>,
    pub supabase: Option<SupabaseSettings>,
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn required(name: &str) -> Result<String, ConfigError> {
    optional(name).ok_or_else(|| ConfigError::MissingEnvironmentVar(name.to_string()))
}

fn string_or(name: &str, default: &str) -> String {
    optional(name).unwrap_or_else(|| default.to_string())
}

fn parsed_or<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match optional(name) {
        Some(value) => value.trim().parse::<T>().map_err(|_| ConfigError::Invalid {
            name: name.to_string(),
            value,
        }),
        None => Ok(default),
    }
}

impl Settings {
    /// Reads settings from the process environment. Call `dotenv().ok()`
    /// first to pick up a `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        let retrieval_backend = parsed_or("RETRIEVAL_BACKEND", RetrievalBackend::Chroma)?;
        let provider = parsed_or("LLM_PROVIDER", LlmProvider::Groq)?;

        let pinecone = match retrieval_backend {
            RetrievalBackend::Pinecone => Some(PineconeSettings {
                api_key: required("PINECONE_API_KEY")?,
                index_name: string_or("PINECONE_INDEX_NAME", "psych-agent"),
                index_host: optional("PINECONE_INDEX_HOST"),
                embed_model: string_or("PINECONE_EMBED_MODEL", "multilingual-e5-large"),
            }),
            RetrievalBackend::Chroma => None,
        };

        let groq_api_key = match provider {
            LlmProvider::Groq => Some(required("GROQ_API_KEY")?),
            LlmProvider::Ollama => optional("GROQ_API_KEY"),
        };

        let icd11 = match (optional("ICD11_CLIENT_ID"), optional("ICD11_CLIENT_SECRET")) {
            (Some(client_id), Some(client_secret)) => Some(Icd11Settings {
                client_id,
                client_secret,
            }),
            _ => None,
        };

        let supabase = match (optional("SUPABASE_URL"), optional("SUPABASE_KEY")) {
            (Some(url), Some(key)) => Some(SupabaseSettings { url, key }),
            _ => None,
        };

        let chunk_words: usize = parsed_or("STREAM_CHUNK_WORDS", 4)?;
        if chunk_words == 0 {
            return Err(ConfigError::Invalid {
                name: "STREAM_CHUNK_WORDS".to_string(),
                value: "0".to_string(),
            });
        }

        Ok(Self {
            host: string_or("HOST", "0.0.0.0"),
            port: parsed_or("PORT", 8001)?,
            allowed_origins: string_or(
                "ALLOWED_ORIGINS",
                "http://localhost:3000,http://localhost:5173",
            )
            .split(',')
            .map(|origin| origin.trim().to_string())
            .filter(|origin| !origin.is_empty())
            .collect(),
            jwt_secret: required("JWT_SECRET")?,
            retrieval_backend,
            chroma: ChromaSettings {
                url: string_or("CHROMA_URL", "http://localhost:8000"),
                collection: string_or("CHROMA_COLLECTION", "dsm5tr_hierarchical"),
                model_dir: PathBuf::from(string_or("EMBEDDING_MODEL_DIR", "ml_models")),
            },
            pinecone,
            llm: LlmSettings {
                provider,
                model: string_or("LLM_MODEL", "mixtral-8x7b-32768"),
                temperature: parsed_or("LLM_TEMPERATURE", 0.1)?,
                max_tokens: parsed_or("LLM_MAX_TOKENS", 2048)?,
                groq_api_key,
                groq_api_base: string_or("GROQ_API_BASE", "https://api.groq.com/openai/v1"),
                ollama_url: string_or("OLLAMA_URL", "http://localhost:11434"),
            },
            prompt_strategy: parsed_or("PROMPT_STRATEGY", PromptStrategy::Grounded)?,
            retrieval_top_k: parsed_or("RETRIEVAL_TOP_K", 10)?,
            history_turns: parsed_or("HISTORY_TURNS", 6)?,
            provider_timeout: Duration::from_secs(parsed_or("PROVIDER_TIMEOUT_SECS", 30)?),
            provider_retries: parsed_or("PROVIDER_RETRIES", 1)?,
            stream: StreamSettings {
                chunk_words,
                chunk_delay: Duration::from_millis(parsed_or("STREAM_CHUNK_DELAY_MS", 100)?),
                status_delay: Duration::from_millis(parsed_or("STREAM_STATUS_DELAY_MS", 500)?),
            },
            verified_answers_path: optional("VERIFIED_ANSWERS_PATH").map(PathBuf::from),
            icd11,
            supabase,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
