use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::OnceCell;

use super::{metadata_from_map, RetrievalError, Retriever};
use crate::config::PineconeSettings;
use crate::types::RetrievedDocument;

const CONTROL_PLANE_URL: &str = "https://api.pinecone.io";
const API_VERSION: &str = "2024-10";

/// Hosted index; query text is embedded by Pinecone's inference API.
pub struct PineconeRetriever {
    client: reqwest::Client,
    api_key: String,
    index_name: String,
    embed_model: String,
    control_plane_url: String,
    index_host: OnceCell<String>,
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedValues>,
}

#[derive(Deserialize)]
struct EmbedValues {
    values: Vec<f32>,
}

#[derive(Deserialize)]
struct DescribeIndexResponse {
    host: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest {
    vector: Vec<f32>,
    top_k: usize,
    include_metadata: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct QueryResponse {
    #[serde(default)]
    matches: Vec<Match>,
}

#[derive(Debug, Deserialize)]
struct Match {
    #[serde(default)]
    score: f32,
    #[serde(default)]
    metadata: Option<Map<String, Value>>,
}

impl PineconeRetriever {
    pub fn new(client: reqwest::Client, settings: &PineconeSettings) -> Self {
        let index_host = match &settings.index_host {
            Some(host) => OnceCell::new_with(Some(normalize_host(host))),
            None => OnceCell::new(),
        };
        Self {
            client,
            api_key: settings.api_key.clone(),
            index_name: settings.index_name.clone(),
            embed_model: settings.embed_model.clone(),
            control_plane_url: CONTROL_PLANE_URL.to_string(),
            index_host,
        }
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("Api-Key", &self.api_key)
            .header("X-Pinecone-API-Version", API_VERSION)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, RetrievalError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(RetrievalError::Provider {
            status: status.as_u16(),
            body,
        })
    }

    async fn index_host(&self) -> Result<&String, RetrievalError> {
        self.index_host
            .get_or_try_init(|| async {
                let url = format!("{}/indexes/{}", self.control_plane_url, self.index_name);
                let response = Self::check(self.request(reqwest::Method::GET, &url).send().await?).await?;
                let described: DescribeIndexResponse = response
                    .json()
                    .await
                    .map_err(|e| RetrievalError::MalformedResponse(e.to_string()))?;
                info!("Resolved Pinecone index {} -> {}", self.index_name, described.host);
                Ok(normalize_host(&described.host))
            })
            .await
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>, RetrievalError> {
        let url = format!("{}/embed", self.control_plane_url);
        let body = json!({
            "model": self.embed_model,
            "parameters": {"input_type": "query", "truncate": "END"},
            "inputs": [{"text": query}],
        });
        let response = Self::check(
            self.request(reqwest::Method::POST, &url).json(&body).send().await?,
        )
        .await?;
        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| RetrievalError::MalformedResponse(e.to_string()))?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.values)
            .ok_or_else(|| RetrievalError::MalformedResponse("embed response had no data".to_string()))
    }
}

fn normalize_host(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{}", host)
    }
}

/// Chunk text lives in the match metadata under `content` (or `text`).
pub(crate) fn documents_from_response(response: QueryResponse) -> Vec<RetrievedDocument> {
    response
        .matches
        .into_iter()
        .filter_map(|m| {
            let metadata = m.metadata?;
            let content = metadata
                .get("content")
                .or_else(|| metadata.get("text"))
                .and_then(Value::as_str)
                .filter(|c| !c.trim().is_empty())?
                .to_string();
            Some(RetrievedDocument::new(content, metadata_from_map(&metadata), m.score))
        })
        .collect()
}

#[async_trait]
impl Retriever for PineconeRetriever {
    fn name(&self) -> &'static str {
        "pinecone"
    }

    async fn search(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedDocument>, RetrievalError> {
        let vector = self.embed_query(query).await?;
        debug!("Pinecone query embedding has {} dimensions", vector.len());

        let host = self.index_host().await?;
        let url = format!("{}/query", host);
        let request = QueryRequest {
            vector,
            top_k,
            include_metadata: true,
        };

        let response = Self::check(
            self.request(reqwest::Method::POST, &url).json(&request).send().await?,
        )
        .await?;
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

    #[test]
    fn matches_without_content_are_skipped() {
        let raw = json!({
            "matches": [
                {"id": "1", "score": 0.91, "metadata": {
                    "content": "Diagnostic Criteria F60.3 ...",
                    "disorder_name": "Borderline Personality Disorder",
                    "icd_code": "F60.3",
                    "source": "DSM-5-TR",
                    "page": "753"
                }},
                {"id": "2", "score": 0.5, "metadata": {"source": "DSM-5-TR"}},
                {"id": "3", "score": 0.4}
            ]
        });
        let response: QueryResponse = serde_json::from_value(raw).unwrap();
        let docs = documents_from_response(response);

        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].metadata.icd_code.as_deref(), Some("F60.3"));
        assert!((docs[0].score - 0.91).abs() < f32::EPSILON);
    }

    #[test]
    fn host_gets_scheme() {
        assert_eq!(
            normalize_host("psych-agent-abc.svc.pinecone.io/"),
            "https://psych-agent-abc.svc.pinecone.io"
        );
        assert_eq!(normalize_host("http://localhost:5080"), "http://localhost:5080");
    }

    #[test]
    fn configured_host_skips_lookup() {
        let settings = PineconeSettings {
            api_key: "key".to_string(),
            index_name: "psych-agent".to_string(),
            index_host: Some("idx.svc.pinecone.io".to_string()),
            embed_model: "multilingual-e5-large".to_string(),
        };
        let retriever = PineconeRetriever::new(reqwest::Client::new(), &settings);
        assert_eq!(
            retriever.index_host.get().map(String::as_str),
            Some("https://idx.svc.pinecone.io")
        );
    }
}
