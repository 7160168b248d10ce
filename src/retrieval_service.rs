//! Vector retrieval behind one contract, with two interchangeable backends.
//!
//! `RetrievalClient` is the boundary the orchestrator talks to: it never
//! returns an error, it reports `RetrievalOutcome::Unavailable` instead so the
//! caller can continue in LLM-only mode.

pub mod chroma;
pub mod pinecone;

use async_trait::async_trait;
use log::{error, info, warn};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::embedding_service::EmbeddingError;
use crate::types::{DocumentMetadata, RetrievedDocument};

pub use chroma::ChromaRetriever;
pub use pinecone::PineconeRetriever;

#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Provider returned {status}: {body}")]
    Provider { status: u16, body: String },

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Unexpected response shape: {0}")]
    MalformedResponse(String),

    #[error("Misconfigured backend: {0}")]
    Misconfigured(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait Retriever: Send + Sync {
    fn name(&self) -> &'static str;

    async fn search(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedDocument>, RetrievalError>;
}

#[derive(Debug)]
pub enum RetrievalOutcome {
    Documents(Vec<RetrievedDocument>),
    Empty,
    Unavailable(RetrievalError),
}

#[derive(Clone)]
pub struct RetrievalClient {
    backend: Arc<dyn Retriever>,
    timeout: Duration,
}

impl RetrievalClient {
    pub fn new(backend: Arc<dyn Retriever>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Single attempt, bounded by the configured timeout. Results come back
    /// ordered by descending score.
    pub async fn search(&self, query: &str, top_k: usize) -> RetrievalOutcome {
        let result = tokio::time::timeout(self.timeout, self.backend.search(query, top_k)).await;

        match result {
            Ok(Ok(mut docs)) => {
                if docs.is_empty() {
                    warn!("{} search returned no documents", self.backend.name());
                    return RetrievalOutcome::Empty;
                }
                docs.sort_by(|a, b| {
                    b.score
                        .partial_cmp(&a.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                docs.truncate(top_k);
                info!("{} search returned {} documents", self.backend.name(), docs.len());
                RetrievalOutcome::Documents(docs)
            }
            Ok(Err(e)) => {
                error!("{} search failed: {}", self.backend.name(), e);
                RetrievalOutcome::Unavailable(e)
            }
            Err(_) => {
                error!("{} search timed out after {:?}", self.backend.name(), self.timeout);
                RetrievalOutcome::Unavailable(RetrievalError::Timeout(self.timeout))
            }
        }
    }
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Reads the metadata fields both backends store alongside each chunk.
pub(crate) fn metadata_from_map(map: &Map<String, Value>) -> DocumentMetadata {
    let field = |key: &str| map.get(key).and_then(value_as_string);
    DocumentMetadata {
        disorder_name: field("disorder_name"),
        icd_code: field("icd_code"),
        section_type: field("section_type"),
        chunk_type: field("chunk_type"),
        hierarchy_path: field("hierarchy_path"),
        page: field("page"),
        source: field("source"),
    }
}
