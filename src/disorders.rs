//! Disorder vocabulary shared by the filter, the citation formatter, the
//! conversation-context builder and the verified-answer cache.
//!
//! The table is a closed list: anything not listed here is never recognized,
//! and callers fall back to unfiltered behavior.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::types::ChatTurn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisorderEntry {
    /// Canonical id, e.g. `borderline_personality`.
    pub id: String,
    pub name: String,
    pub icd_code: String,
    /// Lowercase phrases that identify the disorder in free text.
    pub aliases: Vec<String>,
}

#[derive(Debug)]
struct CompiledEntry {
    entry: DisorderEntry,
    patterns: Vec<Regex>,
}

#[derive(Debug)]
pub struct DisorderCatalog {
    entries: Vec<CompiledEntry>,
}

fn entry(id: &str, name: &str, icd_code: &str, aliases: &[&str]) -> DisorderEntry {
    DisorderEntry {
        id: id.to_string(),
        name: name.to_string(),
        icd_code: icd_code.to_string(),
        aliases: aliases.iter().map(|a| a.to_string()).collect(),
    }
}

fn alias_pattern(alias: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!(r"(?i)\b{}\b", regex::escape(alias)))
}

impl DisorderCatalog {
    pub fn new(entries: Vec<DisorderEntry>) -> Result<Self, regex::Error> {
        let entries = entries
            .into_iter()
            .map(|entry| {
                let mut phrases = entry.aliases.clone();
                phrases.push(entry.name.to_lowercase());
                phrases.push(entry.icd_code.to_lowercase());
                let patterns = phrases
                    .iter()
                    .filter(|p| !p.is_empty())
                    .map(|p| alias_pattern(p))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(CompiledEntry { entry, patterns })
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self { entries })
    }

    /// Built-in DSM-5-TR vocabulary.
    pub fn dsm5tr() -> Self {
        let entries = vec![
            entry(
                "ptsd",
                "Posttraumatic Stress Disorder",
                "F43.10",
                &["ptsd", "posttraumatic stress", "post-traumatic stress"],
            ),
            entry(
                "borderline_personality",
                "Borderline Personality Disorder",
                "F60.3",
                &["borderline personality", "bpd"],
            ),
            entry(
                "major_depressive",
                "Major Depressive Disorder",
                "F32.9",
                &["major depressive", "depression"],
            ),
            entry(
                "intermittent_explosive",
                "Intermittent Explosive Disorder",
                "F63.81",
                &["intermittent explosive"],
            ),
            entry(
                "generalized_anxiety",
                "Generalized Anxiety Disorder",
                "F41.1",
                &["generalized anxiety", "gad"],
            ),
            entry("schizophrenia", "Schizophrenia", "F20.9", &["schizophrenia"]),
        ];
        // Patterns are escaped literals, compilation cannot fail.
        Self::new(entries).unwrap_or(Self { entries: Vec::new() })
    }

    pub fn entries(&self) -> impl Iterator<Item = &DisorderEntry> {
        self.entries.iter().map(|c| &c.entry)
    }

    pub fn get(&self, id: &str) -> Option<&DisorderEntry> {
        self.entries().find(|e| e.id == id)
    }

    /// Detects the disorder mentioned earliest in `text`. When two aliases
    /// start at the same offset the longer match wins.
    pub fn detect(&self, text: &str) -> Option<&DisorderEntry> {
        let mut best: Option<(usize, usize, &DisorderEntry)> = None;
        for compiled in &self.entries {
            for pattern in &compiled.patterns {
                if let Some(m) = pattern.find(text) {
                    let candidate = (m.start(), m.end() - m.start());
                    let better = match best {
                        None => true,
                        Some((start, len, _)) => {
                            candidate.0 < start || (candidate.0 == start && candidate.1 > len)
                        }
                    };
                    if better {
                        best = Some((candidate.0, candidate.1, &compiled.entry));
                    }
                }
            }
        }
        best.map(|(_, _, entry)| entry)
    }

    /// Query first, then history from the most recent turn backwards.
    pub fn detect_in_conversation(
        &self,
        query: &str,
        history: &[ChatTurn],
        turns: usize,
    ) -> Option<&DisorderEntry> {
        if let Some(found) = self.detect(query) {
            return Some(found);
        }
        history
            .iter()
            .rev()
            .take(turns)
            .find_map(|turn| self.detect(&turn.content))
    }

    /// True when `text` mentions any phrase of the entry.
    pub fn mentions(&self, id: &str, text: &str) -> bool {
        self.entries
            .iter()
            .find(|c| c.entry.id == id)
            .map(|c| c.patterns.iter().any(|p| p.is_match(text)))
            .unwrap_or(false)
    }

    /// Resolves a metadata disorder name or ICD code to an entry.
    pub fn resolve(&self, name_or_code: &str) -> Option<&DisorderEntry> {
        let needle = name_or_code.trim();
        self.entries().find(|e| {
            e.name.eq_ignore_ascii_case(needle) || e.icd_code.eq_ignore_ascii_case(needle)
        })
    }
}

impl Default for DisorderCatalog {
    fn default() -> Self {
        Self::dsm5tr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_by_alias_and_code() {
        let catalog = DisorderCatalog::dsm5tr();
        assert_eq!(catalog.detect("criteria for PTSD?").unwrap().id, "ptsd");
        assert_eq!(
            catalog.detect("what does F60.3 cover").unwrap().id,
            "borderline_personality"
        );
        assert!(catalog.detect("general question about sleep").is_none());
    }

    #[test]
    fn alias_requires_word_boundary() {
        let catalog = DisorderCatalog::dsm5tr();
        // "gadget" must not match the "gad" alias
        assert!(catalog.detect("a gadget for tracking mood").is_none());
    }

    #[test]
    fn earliest_mention_wins() {
        let catalog = DisorderCatalog::dsm5tr();
        let found = catalog
            .detect("Is depression common after PTSD?")
            .unwrap();
        assert_eq!(found.id, "major_depressive");
    }

    #[test]
    fn query_beats_history() {
        let catalog = DisorderCatalog::dsm5tr();
        let history = vec![ChatTurn::user("Tell me about PTSD")];
        let found = catalog
            .detect_in_conversation("And schizophrenia?", &history, 3)
            .unwrap();
        assert_eq!(found.id, "schizophrenia");
    }

    #[test]
    fn most_recent_history_turn_wins() {
        let catalog = DisorderCatalog::dsm5tr();
        let history = vec![
            ChatTurn::user("Tell me about schizophrenia"),
            ChatTurn::assistant("Schizophrenia is..."),
            ChatTurn::user("Now PTSD please"),
            ChatTurn::assistant("Posttraumatic stress disorder..."),
        ];
        let found = catalog
            .detect_in_conversation("what about treatment", &history, 3)
            .unwrap();
        assert_eq!(found.id, "ptsd");
    }

    #[test]
    fn history_window_is_bounded() {
        let catalog = DisorderCatalog::dsm5tr();
        let history = vec![
            ChatTurn::user("Tell me about PTSD"),
            ChatTurn::assistant("ok"),
            ChatTurn::user("thanks"),
            ChatTurn::assistant("anything else?"),
        ];
        assert!(catalog
            .detect_in_conversation("treatment options", &history, 3)
            .is_none());
    }

    #[test]
    fn resolves_metadata_names() {
        let catalog = DisorderCatalog::dsm5tr();
        assert_eq!(
            catalog.resolve("borderline personality disorder").unwrap().icd_code,
            "F60.3"
        );
        assert_eq!(catalog.resolve("F43.10").unwrap().id, "ptsd");
        assert!(catalog.resolve("Unknown Disorder").is_none());
    }
}
