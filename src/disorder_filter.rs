use log::{debug, info};
use std::sync::Arc;

use crate::disorders::{DisorderCatalog, DisorderEntry};
use crate::types::{ChatTurn, RetrievedDocument};

/// Documents kept when no disorder is recognized, or when none match.
pub const UNFILTERED_LIMIT: usize = 3;
/// Upper bound on documents kept for a recognized disorder.
pub const MATCHED_LIMIT: usize = 5;
/// Most recent history turns scanned for a disorder mention.
pub const HISTORY_WINDOW: usize = 3;

#[derive(Clone)]
pub struct DisorderFilter {
    catalog: Arc<DisorderCatalog>,
    history_window: usize,
}

impl DisorderFilter {
    pub fn new(catalog: Arc<DisorderCatalog>) -> Self {
        Self {
            catalog,
            history_window: HISTORY_WINDOW,
        }
    }

    /// Disorder named in the query, else in the recent history.
    pub fn detect(&self, query: &str, history: &[ChatTurn]) -> Option<&DisorderEntry> {
        self.catalog
            .detect_in_conversation(query, history, self.history_window)
    }

    fn is_relevant(&self, entry: &DisorderEntry, doc: &RetrievedDocument) -> bool {
        if self.catalog.mentions(&entry.id, &doc.content) {
            return true;
        }
        [&doc.metadata.disorder_name, &doc.metadata.icd_code]
            .into_iter()
            .flatten()
            .filter_map(|value| self.catalog.resolve(value))
            .any(|resolved| resolved.id == entry.id)
    }

    /// Order-preserving subset of `docs`. Never empty unless `docs` is.
    pub fn filter(
        &self,
        docs: Vec<RetrievedDocument>,
        query: &str,
        history: &[ChatTurn],
    ) -> Vec<RetrievedDocument> {
        let Some(entry) = self.detect(query, history) else {
            debug!("No disorder recognized, keeping top {}", UNFILTERED_LIMIT);
            return docs.into_iter().take(UNFILTERED_LIMIT).collect();
        };

        let matching: Vec<usize> = docs
            .iter()
            .enumerate()
            .filter(|(_, doc)| self.is_relevant(entry, doc))
            .map(|(i, _)| i)
            .take(MATCHED_LIMIT)
            .collect();

        if matching.is_empty() {
            info!(
                "No documents mention {} ({}), falling back to top {}",
                entry.name, entry.icd_code, UNFILTERED_LIMIT
            );
            return docs.into_iter().take(UNFILTERED_LIMIT).collect();
        }

        info!(
            "Kept {} of {} documents for {} ({})",
            matching.len(),
            docs.len(),
            entry.name,
            entry.icd_code
        );
        docs.into_iter()
            .enumerate()
            .filter(|(i, _)| matching.contains(i))
            .map(|(_, doc)| doc)
            .collect()
    }
}
