//! Pre-authored answers for validated diagnostic-criteria questions, keyed by
//! canonical disorder id.

use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::citation_service::strip_dangling_markers;
use crate::disorders::DisorderCatalog;
use crate::types::Citation;

const BUILTIN_DATASET: &str = include_str!("../data/verified_answers.json");

/// A query must ask about criteria (or diagnosis) to be served verbatim.
const CRITERIA_INTENT: &[&str] = &["criteria", "diagnos", "symptom"];

#[derive(Error, Debug)]
pub enum VerifiedAnswerError {
    #[error("Failed to read dataset: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid dataset: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown disorder id in dataset: {0}")]
    UnknownDisorder(String),

    #[error("Answer for {0} cites a source it does not list")]
    DanglingMarker(String),

    #[error("Citation ids for {0} must run 1..=n in order")]
    CitationOrder(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedAnswer {
    pub disorder_id: String,
    pub answer: String,
    pub citations: Vec<Citation>,
}

pub struct VerifiedAnswerCache {
    catalog: Arc<DisorderCatalog>,
    answers: HashMap<String, VerifiedAnswer>,
}

impl VerifiedAnswerCache {
    pub fn from_json(catalog: Arc<DisorderCatalog>, json: &str) -> Result<Self, VerifiedAnswerError> {
        let entries: Vec<VerifiedAnswer> = serde_json::from_str(json)?;
        let mut answers = HashMap::new();
        for entry in entries {
            if catalog.get(&entry.disorder_id).is_none() {
                return Err(VerifiedAnswerError::UnknownDisorder(entry.disorder_id));
            }
            if entry.citations.iter().enumerate().any(|(i, c)| c.id != i + 1) {
                return Err(VerifiedAnswerError::CitationOrder(entry.disorder_id));
            }
            if strip_dangling_markers(&entry.answer, entry.citations.len()) != entry.answer {
                return Err(VerifiedAnswerError::DanglingMarker(entry.disorder_id));
            }
            answers.insert(entry.disorder_id.clone(), entry);
        }
        info!("Loaded {} verified answers", answers.len());
        Ok(Self { catalog, answers })
    }

    pub fn builtin(catalog: Arc<DisorderCatalog>) -> Result<Self, VerifiedAnswerError> {
        Self::from_json(catalog, BUILTIN_DATASET)
    }

    pub fn from_path(catalog: Arc<DisorderCatalog>, path: &Path) -> Result<Self, VerifiedAnswerError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(catalog, &json)
    }

    pub fn empty(catalog: Arc<DisorderCatalog>) -> Self {
        Self {
            catalog,
            answers: HashMap::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn unchecked(catalog: Arc<DisorderCatalog>, entries: Vec<VerifiedAnswer>) -> Self {
        let answers = entries.into_iter().map(|e| (e.disorder_id.clone(), e)).collect();
        Self { catalog, answers }
    }

    pub fn len(&self) -> usize {
        self.answers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.answers.is_empty()
    }

    /// Only the query itself is considered; history never triggers a
    /// verbatim answer.
    pub fn lookup(&self, query: &str) -> Option<&VerifiedAnswer> {
        let entry = self.catalog.detect(query)?;
        let lowered = query.to_lowercase();
        if !CRITERIA_INTENT.iter().any(|intent| lowered.contains(intent)) {
            return None;
        }
        self.answers.get(&entry.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> VerifiedAnswerCache {
        VerifiedAnswerCache::builtin(Arc::new(DisorderCatalog::dsm5tr())).unwrap()
    }

    #[test]
    fn builtin_dataset_loads() {
        let cache = cache();
        assert_eq!(cache.len(), 1);
        let answer = cache
            .lookup("What are the diagnostic criteria for Borderline Personality Disorder?")
            .unwrap();
        assert!(answer.answer.starts_with("**Borderline Personality Disorder (F60.3)"));
        assert_eq!(answer.citations.len(), 1);
        assert_eq!(answer.citations[0].icd_code.as_deref(), Some("F60.3"));
        assert_eq!(answer.citations[0].source, "DSM-5-TR, Page 753");
    }

    #[test]
    fn code_lookup_hits() {
        assert!(cache().lookup("F60.3 criteria").is_some());
    }

    #[test]
    fn non_criteria_question_misses() {
        assert!(cache().lookup("How is borderline personality disorder treated?").is_none());
    }

    #[test]
    fn uncached_disorder_misses() {
        assert!(cache().lookup("Diagnostic criteria for PTSD").is_none());
    }

    fn ptsd_entry(answer: &str, citation_ids: &[usize]) -> String {
        let citations: Vec<serde_json::Value> = citation_ids
            .iter()
            .map(|id| {
                serde_json::json!({
                    "id": id,
                    "content": "PTSD criteria",
                    "preview": "PTSD criteria",
                    "full_content": "PTSD criteria",
                    "source": "DSM-5-TR"
                })
            })
            .collect();
        serde_json::json!([{
            "disorder_id": "ptsd",
            "answer": answer,
            "citations": citations
        }])
        .to_string()
    }

    #[test]
    fn marker_beyond_citations_is_rejected() {
        let json = ptsd_entry("PTSD criteria summary^3.", &[1]);
        assert!(matches!(
            VerifiedAnswerCache::from_json(Arc::new(DisorderCatalog::dsm5tr()), &json),
            Err(VerifiedAnswerError::DanglingMarker(_))
        ));
    }

    #[test]
    fn out_of_order_citation_ids_are_rejected() {
        let json = ptsd_entry("PTSD criteria summary^1.", &[2]);
        assert!(matches!(
            VerifiedAnswerCache::from_json(Arc::new(DisorderCatalog::dsm5tr()), &json),
            Err(VerifiedAnswerError::CitationOrder(_))
        ));
    }

    #[test]
    fn well_formed_entry_loads() {
        let json = ptsd_entry("PTSD criteria^1 and course^2.", &[1, 2]);
        let cache = VerifiedAnswerCache::from_json(Arc::new(DisorderCatalog::dsm5tr()), &json).unwrap();
        assert!(cache.lookup("What are the diagnostic criteria for PTSD?").is_some());
    }

    #[test]
    fn unknown_disorder_id_is_rejected() {
        let json = r#"[{"disorder_id": "made_up", "answer": "x", "citations": []}]"#;
        assert!(matches!(
            VerifiedAnswerCache::from_json(Arc::new(DisorderCatalog::dsm5tr()), json),
            Err(VerifiedAnswerError::UnknownDisorder(_))
        ));
    }
}
