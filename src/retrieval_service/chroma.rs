use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::OnceCell;

use super::{metadata_from_map, RetrievalError, Retriever};
use crate::embedding_service::Embedder;
use crate::types::RetrievedDocument;

/// Local index served by a Chroma instance; query vectors come from the
/// in-process embedder.
pub struct ChromaRetriever {
    client: reqwest::Client,
    base_url: String,
    collection: String,
    collection_id: OnceCell<String>,
    embedder: Arc<dyn Embedder>,
}

#[derive(Deserialize)]
struct CollectionResponse {
    id: String,
}

#[derive(Serialize)]
struct QueryRequest<'a> {
    query_embeddings: Vec<Vec<f32>>,
    n_results: usize,
    include: &'a [&'a str],
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct QueryResponse {
    #[serde(default)]
    documents: Vec<Vec<Option<String>>>,
    #[serde(default)]
    metadatas: Vec<Vec<Option<Map<String, Value>>>>,
    #[serde(default)]
    distances: Vec<Vec<Option<f32>>>,
}

impl ChromaRetriever {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        collection: &str,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            collection: collection.to_string(),
            collection_id: OnceCell::new(),
            embedder,
        }
    }

    async fn collection_id(&self) -> Result<&String, RetrievalError> {
        self.collection_id
            .get_or_try_init(|| async {
                let url = format!(
                    "{}/api/v1/collections/{}",
                    self.base_url,
                    urlencoding::encode(&self.collection)
                );
                let response = self.client.get(&url).send().await?;
                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(RetrievalError::Provider {
                        status: status.as_u16(),
                        body,
                    });
                }
                let collection: CollectionResponse = response
                    .json()
                    .await
                    .map_err(|e| RetrievalError::MalformedResponse(e.to_string()))?;
                info!("Resolved Chroma collection {} -> {}", self.collection, collection.id);
                Ok(collection.id)
            })
            .await
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>, RetrievalError> {
        let embedder = Arc::clone(&self.embedder);
        let text = query.to_string();
        tokio::task::spawn_blocking(move || embedder.embed(&text))
            .await
            .map_err(|e| RetrievalError::Misconfigured(format!("embedding task failed: {}", e)))?
            .map_err(RetrievalError::from)
    }
}

/// Flattens Chroma's column-oriented single-query response. Distances become
/// `1 / (1 + d)`, which stays in (0, 1] for both the default L2 space and
/// cosine collections.
fn similarity(distance: f32) -> f32 {
    1.0 / (1.0 + distance.max(0.0))
}

pub(crate) fn documents_from_response(response: QueryResponse) -> Vec<RetrievedDocument> {
    let documents = response.documents.into_iter().next().unwrap_or_default();
    let metadatas = response.metadatas.into_iter().next().unwrap_or_default();
    let distances = response.distances.into_iter().next().unwrap_or_default();

    documents
        .into_iter()
        .enumerate()
        .filter_map(|(i, content)| {
            let content = content.filter(|c| !c.trim().is_empty())?;
            let metadata = metadatas
                .get(i)
                .and_then(|m| m.as_ref())
                .map(metadata_from_map)
                .unwrap_or_default();
            let score = distances
                .get(i)
                .copied()
                .flatten()
                .map(similarity)
                .unwrap_or(0.0);
            Some(RetrievedDocument::new(content, metadata, score))
        })
        .collect()
}

#[async_trait]
impl Retriever for ChromaRetriever {
    fn name(&self) -> &'static str {
        "chroma"
    }

    async fn search(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedDocument>, RetrievalError> {
        let collection_id = self.collection_id().await?;
        let embedding = self.embed_query(query).await?;
        debug!("Query embedding has {} dimensions", embedding.len());

        let url = format!("{}/api/v1/collections/{}/query", self.base_url, collection_id);
        let request = QueryRequest {
            query_embeddings: vec![embedding],
            n_results: top_k,
            include: &["documents", "metadatas", "distances"],
        };

        let response = self.client.post(&url).json(&request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RetrievalError::Provider {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: QueryResponse = response
            .json()
            .await
            .map_err(|e| RetrievalError::MalformedResponse(e.to_string()))?;

        Ok(documents_from_response(parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flattens_query_response() {
        let raw = json!({
            "ids": [["a", "b", "c"]],
            "documents": [["Borderline text", null, "PTSD text"]],
            "metadatas": [[
                {"disorder_name": "Borderline Personality Disorder", "icd_code": "F60.3", "page": 753},
                null,
                null
            ]],
            "distances": [[0.25, 0.3, 0.5]]
        });
        let response: QueryResponse = serde_json::from_value(raw).unwrap();
        let docs = documents_from_response(response);

        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].metadata.icd_code.as_deref(), Some("F60.3"));
        assert_eq!(docs[0].metadata.page.as_deref(), Some("753"));
        assert!((docs[0].score - 0.8).abs() < 1e-6);
        assert_eq!(docs[1].content, "PTSD text");
        assert!(docs[1].metadata.disorder_name.is_none());
    }

    #[test]
    fn empty_response_yields_no_documents() {
        let response: QueryResponse = serde_json::from_value(json!({"ids": [[]]})).unwrap();
        assert!(documents_from_response(response).is_empty());
    }

    #[test]
    fn large_l2_distances_keep_positive_ordered_scores() {
        let raw = json!({
            "ids": [["near", "far", "unscored"]],
            "documents": [["near", "far", "unscored"]],
            "metadatas": [[null, null, null]],
            "distances": [[0.9, 3.0, null]]
        });
        let response: QueryResponse = serde_json::from_value(raw).unwrap();
        let docs = documents_from_response(response);

        assert!((docs[1].score - 0.25).abs() < 1e-6);
        assert!(docs[0].score > docs[1].score);
        assert!(docs[1].score > 0.0);
        assert_eq!(docs[2].score, 0.0);
    }
}
