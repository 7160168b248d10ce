//! WHO ICD-API cross-reference for chapter 06 (mental, behavioural or
//! neurodevelopmental disorders).

use async_trait::async_trait;
use log::{debug, info};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::Icd11Settings;
use crate::types::Citation;

const TOKEN_URL: &str = "https://icdaccessmanagement.who.int/connect/token";
const SEARCH_URL: &str = "https://id.who.int/icd/release/11/2024-01/mms/search";
const MENTAL_DISORDERS_CHAPTER: &str = "06";
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

pub const MAX_CROSS_REFERENCES: usize = 3;
pub const ICD11_SOURCE: &str = "ICD-11";
pub const ICD11_HIERARCHY: &str = "ICD-11 > Mental, Behavioural or Neurodevelopmental Disorders";

#[derive(Error, Debug)]
pub enum Icd11Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("ICD-API returned {status}: {body}")]
    Provider { status: u16, body: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Icd11Match {
    pub code: String,
    pub title: String,
    pub uri: String,
    pub score: f32,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SearchResponse {
    #[serde(default)]
    destination_entities: Vec<DestinationEntity>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DestinationEntity {
    #[serde(default)]
    the_code: Option<String>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    score: f32,
}

static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("tag regex is valid"));

/// Looks up ICD-11 entities that correspond to a clinical query.
#[async_trait]
pub trait CrossReferencer: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<Icd11Match>, Icd11Error>;
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

pub struct Icd11Client {
    client: reqwest::Client,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<CachedToken>>,
}

impl Icd11Client {
    pub fn new(client: reqwest::Client, settings: &Icd11Settings) -> Self {
        Self {
            client,
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
            token: Mutex::new(None),
        }
    }

    async fn access_token(&self) -> Result<String, Icd11Error> {
        // Held across the refresh so concurrent searches wait for one token fetch.
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let response = self
            .client
            .post(TOKEN_URL)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", "icdapi_access"),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?;
        let response = check(response).await?;
        let token: TokenResponse = response.json().await?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_REFRESH_MARGIN);
        info!("Obtained ICD-API token valid for {:?}", lifetime);
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }
}

#[async_trait]
impl CrossReferencer for Icd11Client {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<Icd11Match>, Icd11Error> {
        let token = self.access_token().await?;
        let response = self
            .client
            .get(SEARCH_URL)
            .query(&[
                ("q", query),
                ("useFlexisearch", "true"),
                ("flatResults", "true"),
                ("chapterFilter", MENTAL_DISORDERS_CHAPTER),
            ])
            .bearer_auth(token)
            .header("Accept", "application/json")
            .header("API-Version", "v2")
            .header("Accept-Language", "en")
            .send()
            .await?;
        let response = check(response).await?;
        let parsed: SearchResponse = response.json().await?;
        let matches = matches_from_response(parsed, max_results);
        debug!("ICD-11 search returned {} matches", matches.len());
        Ok(matches)
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, Icd11Error> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Icd11Error::Provider {
        status: status.as_u16(),
        body,
    })
}

/// Search titles come back with `<em class='found'>` highlighting.
fn strip_tags(text: &str) -> String {
    TAG.replace_all(text, "").trim().to_string()
}

pub(crate) fn matches_from_response(response: SearchResponse, max_results: usize) -> Vec<Icd11Match> {
    response
        .destination_entities
        .into_iter()
        .filter_map(|entity| {
            let code = entity.the_code.filter(|c| !c.is_empty())?;
            Some(Icd11Match {
                code,
                title: strip_tags(&entity.title),
                uri: entity.id,
                score: entity.score,
            })
        })
        .take(max_results)
        .collect()
}

/// Citations for `matches`, numbered from `first_id`.
pub fn cross_reference_citations(matches: &[Icd11Match], first_id: usize) -> Vec<Citation> {
    matches
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let content = format!("ICD-11: {} ({})", m.title, m.code);
            Citation {
                id: first_id + i,
                preview: content.clone(),
                content,
                full_content: format!(
                    "ICD-11 Code: {}\nTitle: {}\nSource: World Health Organization ICD-11",
                    m.code, m.title
                ),
                source: ICD11_SOURCE.to_string(),
                page: None,
                disorder_name: Some(m.title.clone()),
                icd_code: Some(m.code.clone()),
                section_type: None,
                hierarchy_path: Some(ICD11_HIERARCHY.to_string()),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_flat_search_results() {
        let raw = json!({
            "error": false,
            "destinationEntities": [
                {"id": "http://id.who.int/icd/entity/1", "title": "<em class='found'>Borderline</em> pattern", "theCode": "6D11.5", "score": 0.92},
                {"id": "http://id.who.int/icd/entity/2", "title": "Uncoded grouping", "score": 0.5},
                {"id": "http://id.who.int/icd/entity/3", "title": "Personality disorder", "theCode": "6D10", "score": 0.4},
                {"id": "http://id.who.int/icd/entity/4", "title": "Personality difficulty", "theCode": "QE50.7", "score": 0.3},
                {"id": "http://id.who.int/icd/entity/5", "title": "Other", "theCode": "6D11", "score": 0.2}
            ]
        });
        let response: SearchResponse = serde_json::from_value(raw).unwrap();
        let matches = matches_from_response(response, MAX_CROSS_REFERENCES);

        assert_eq!(matches.len(), 3);
        assert_eq!(matches[0].code, "6D11.5");
        assert_eq!(matches[0].title, "Borderline pattern");
        assert_eq!(matches[1].code, "6D10");
    }

    #[test]
    fn highlight_markup_is_removed() {
        assert_eq!(
            strip_tags("<em class='found'>Post</em> traumatic <b>stress</b> disorder "),
            "Post traumatic stress disorder"
        );
        assert_eq!(strip_tags("Anxiety 3 < 4"), "Anxiety 3 < 4");
    }

    #[test]
    fn citations_continue_numbering() {
        let matches = vec![Icd11Match {
            code: "6B40".to_string(),
            title: "Post traumatic stress disorder".to_string(),
            uri: "http://id.who.int/icd/entity/2070699808".to_string(),
            score: 0.9,
        }];
        let citations = cross_reference_citations(&matches, 3);
        assert_eq!(citations[0].id, 3);
        assert_eq!(citations[0].source, "ICD-11");
        assert_eq!(citations[0].content, "ICD-11: Post traumatic stress disorder (6B40)");
        assert_eq!(citations[0].hierarchy_path.as_deref(), Some(ICD11_HIERARCHY));
    }
}
