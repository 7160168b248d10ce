use anyhow::Context;
use axum::extract::FromRef;
use log::{info, warn};
use std::sync::Arc;

use crate::auth::JwtSecret;
use crate::chat_store::{ChatStore, InMemoryChatStore, SupabaseChatStore};
use crate::config::{LlmProvider, RetrievalBackend, Settings};
use crate::disorders::DisorderCatalog;
use crate::embedding_service::load_local_embedder;
use crate::icd11_service::Icd11Client;
use crate::llm_service::{groq::GroqClient, ollama::OllamaClient, LlmClient, LlmService};
use crate::rag_service::RagOrchestrator;
use crate::retrieval_service::{chroma::ChromaRetriever, pinecone::PineconeRetriever, RetrievalClient, Retriever};
use crate::streaming::ChatStreamer;
use crate::verified_answers::VerifiedAnswerCache;

#[derive(FromRef, Clone)]
pub struct AppState {
    pub rag: Arc<RagOrchestrator>,
    pub store: Arc<dyn ChatStore>,
    pub streamer: ChatStreamer,
    pub jwt_secret: JwtSecret,
    pub history_turns: usize,
}

impl AppState {
    pub fn new(settings: &Settings, rag: Arc<RagOrchestrator>, store: Arc<dyn ChatStore>) -> Self {
        Self {
            streamer: ChatStreamer::new(
                Arc::clone(&store),
                Arc::clone(&rag),
                settings.stream.clone(),
                settings.history_turns,
            ),
            rag,
            store,
            jwt_secret: JwtSecret(Arc::new(settings.jwt_secret.clone())),
            history_turns: settings.history_turns,
        }
    }

    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let client = reqwest::Client::new();
        let rag = Arc::new(build_orchestrator(settings, client)?);
        Ok(Self::new(settings, rag, build_store(settings)))
    }
}

pub fn build_retriever(settings: &Settings, client: reqwest::Client) -> anyhow::Result<Arc<dyn Retriever>> {
    match settings.retrieval_backend {
        RetrievalBackend::Chroma => {
            let embedder = load_local_embedder(&settings.chroma.model_dir)
                .with_context(|| format!("loading embedding model from {}", settings.chroma.model_dir.display()))?;
            Ok(Arc::new(ChromaRetriever::new(
                client,
                &settings.chroma.url,
                &settings.chroma.collection,
                embedder,
            )))
        }
        RetrievalBackend::Pinecone => {
            let pinecone = settings
                .pinecone
                .as_ref()
                .context("PINECONE_API_KEY must be set for the pinecone backend")?;
            Ok(Arc::new(PineconeRetriever::new(client, pinecone)))
        }
    }
}

pub fn build_llm(settings: &Settings, client: reqwest::Client) -> anyhow::Result<LlmService> {
    let backend: Arc<dyn LlmClient> = match settings.llm.provider {
        LlmProvider::Groq => Arc::new(GroqClient::new(&settings.llm)?),
        LlmProvider::Ollama => Arc::new(OllamaClient::new(client, &settings.llm)),
    };
    Ok(LlmService::new(backend, settings.provider_timeout, settings.provider_retries))
}

pub fn build_orchestrator(settings: &Settings, client: reqwest::Client) -> anyhow::Result<RagOrchestrator> {
    let catalog = Arc::new(DisorderCatalog::dsm5tr());

    let retriever = build_retriever(settings, client.clone())?;
    let retrieval = RetrievalClient::new(retriever, settings.provider_timeout);
    let llm = build_llm(settings, client.clone())?;

    let verified = match &settings.verified_answers_path {
        Some(path) => VerifiedAnswerCache::from_path(Arc::clone(&catalog), path)
            .with_context(|| format!("loading verified answers from {}", path.display()))?,
        None => VerifiedAnswerCache::builtin(Arc::clone(&catalog))?,
    };

    info!(
        "Pipeline: retrieval={} llm={}/{} strategy={:?}",
        retrieval.backend_name(),
        llm.provider(),
        llm.model(),
        settings.prompt_strategy
    );

    let mut rag = RagOrchestrator::new(
        catalog,
        retrieval,
        llm,
        settings.prompt_strategy,
        Arc::new(verified),
        settings.retrieval_top_k,
    );
    match &settings.icd11 {
        Some(icd11) => {
            rag = rag.with_icd11(Arc::new(Icd11Client::new(client, icd11)), settings.provider_timeout);
        }
        None => info!("ICD-11 cross-reference disabled"),
    }
    Ok(rag)
}

pub fn build_store(settings: &Settings) -> Arc<dyn ChatStore> {
    match &settings.supabase {
        Some(supabase) => Arc::new(SupabaseChatStore::new(supabase)),
        None => {
            warn!("SUPABASE_URL not set, chat history is kept in memory");
            Arc::new(InMemoryChatStore::new())
        }
    }
}
