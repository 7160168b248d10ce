//! Turns retrieved documents into display citations and keeps the inline
//! `^N` markers in generated text consistent with them.

use log::debug;
use std::sync::Arc;

use crate::disorders::DisorderCatalog;
use crate::types::{Citation, RetrievedDocument, DEFAULT_SOURCE};

pub const PREVIEW_CHARS: usize = 200;
const CONTEXT_PREVIEW_CHARS: usize = 500;
const SHORT_PREVIEW_CHARS: usize = 100;
const EXTENDED_PREVIEW_CHARS: usize = 400;
const PREVIEW_SENTENCES: usize = 3;

const CONTEXT_CUES: &[&str] = &[
    "diagnostic criteria",
    "the essential",
    "characterized by",
    "symptoms include",
    "must be present",
    "requires",
    "differential diagnosis",
    "prevalence",
    "development",
];

const SALIENT_KEYWORDS: &[&str] = &["criteria", "disorder", "diagnosis", "symptoms"];

const GENERAL_SECTION: &str = "General";

fn truncate_chars(text: &str, max: usize) -> Option<String> {
    match text.char_indices().nth(max) {
        Some((idx, _)) => Some(text[..idx].to_string()),
        None => None,
    }
}

/// First `PREVIEW_CHARS` characters, with `...` when cut.
pub fn plain_preview(content: &str) -> String {
    match truncate_chars(content, PREVIEW_CHARS) {
        Some(head) => format!("{}...", head),
        None => content.to_string(),
    }
}

/// Fields of a `DOCUMENT: ...; DISORDER: X; SECTION: Y; TEXT: ...` chunk.
#[derive(Debug, Default, PartialEq)]
pub struct StructuredChunk {
    pub disorder: Option<String>,
    pub section: Option<String>,
    pub text: Option<String>,
    pub criteria: Option<String>,
}

impl StructuredChunk {
    pub fn parse(content: &str) -> Option<Self> {
        if !content.starts_with("DOCUMENT:") {
            return None;
        }
        let mut chunk = StructuredChunk::default();
        for part in content.split(';').map(str::trim) {
            let field = |prefix: &str| {
                part.strip_prefix(prefix)
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
            };
            if let Some(value) = field("DISORDER:") {
                chunk.disorder = Some(value);
            } else if let Some(value) = field("SECTION:") {
                chunk.section = Some(value);
            } else if let Some(value) = field("TEXT:") {
                chunk.text.get_or_insert(value);
            } else if let Some(value) = field("CRITERIA:") {
                chunk.criteria.get_or_insert(value);
            }
        }
        Some(chunk)
    }

    /// Body text with the field labels removed.
    pub fn body(&self) -> Option<&str> {
        self.text.as_deref().or(self.criteria.as_deref())
    }
}

/// Preview window starting at the first sentence with a context cue.
pub fn contextual_preview(content: &str, section: Option<&str>) -> Option<String> {
    let structured = StructuredChunk::parse(content);
    let clean = structured
        .as_ref()
        .and_then(StructuredChunk::body)
        .unwrap_or(content);

    let sentences: Vec<&str> = clean.split(". ").collect();
    let start = sentences.iter().position(|sentence| {
        let lowered = sentence.trim().to_lowercase();
        CONTEXT_CUES.iter().any(|cue| lowered.contains(cue))
    })?;

    let end = (start + PREVIEW_SENTENCES).min(sentences.len());
    let mut preview = sentences[start..end].join(". ");
    if let Some(section) = section.filter(|s| *s != GENERAL_SECTION) {
        preview = format!("[{}] {}", section, preview);
    }

    if let Some(head) = truncate_chars(&preview, CONTEXT_PREVIEW_CHARS) {
        let head: String = head.chars().take(CONTEXT_PREVIEW_CHARS - 3).collect();
        preview = format!("{}...", head);
    } else if preview.chars().count() < SHORT_PREVIEW_CHARS && clean.len() > preview.len() {
        preview = match truncate_chars(clean, EXTENDED_PREVIEW_CHARS) {
            Some(head) => format!("{}...", head),
            None => clean.to_string(),
        };
    }
    Some(preview)
}

/// `DSM-5-TR > Disorder > Section`, shortened when parts are unknown.
pub fn hierarchy_path(disorder: Option<&str>, section: Option<&str>) -> String {
    match (disorder, section.filter(|s| *s != GENERAL_SECTION)) {
        (Some(disorder), Some(section)) => format!("{} > {} > {}", DEFAULT_SOURCE, disorder, section),
        (Some(disorder), None) => format!("{} > {}", DEFAULT_SOURCE, disorder),
        (None, _) => DEFAULT_SOURCE.to_string(),
    }
}

#[derive(Clone)]
pub struct CitationFormatter {
    catalog: Arc<DisorderCatalog>,
}

impl CitationFormatter {
    pub fn new(catalog: Arc<DisorderCatalog>) -> Self {
        Self { catalog }
    }

    /// Sequential ids from 1, in input order.
    pub fn format(&self, docs: &[RetrievedDocument]) -> Vec<Citation> {
        docs.iter()
            .enumerate()
            .map(|(i, doc)| self.citation(i + 1, doc))
            .collect()
    }

    fn citation(&self, id: usize, doc: &RetrievedDocument) -> Citation {
        let metadata = &doc.metadata;
        let structured = StructuredChunk::parse(&doc.content);

        let mut disorder_name = metadata
            .disorder_name
            .clone()
            .or_else(|| structured.as_ref().and_then(|s| s.disorder.clone()));
        let mut icd_code = metadata.icd_code.clone();
        let section_type = metadata
            .section_type
            .clone()
            .or_else(|| structured.as_ref().and_then(|s| s.section.clone()));

        if disorder_name.is_none() {
            if let Some(entry) = self.catalog.detect(&doc.content) {
                debug!("Citation {} tagged {} from content", id, entry.name);
                disorder_name = Some(entry.name.clone());
                icd_code = icd_code.or_else(|| Some(entry.icd_code.clone()));
            }
        }
        if icd_code.is_none() {
            icd_code = disorder_name
                .as_deref()
                .and_then(|name| self.catalog.resolve(name))
                .map(|entry| entry.icd_code.clone());
        }

        let hierarchy = metadata
            .hierarchy_path
            .clone()
            .unwrap_or_else(|| hierarchy_path(disorder_name.as_deref(), section_type.as_deref()));

        let content = plain_preview(&doc.content);
        let preview = contextual_preview(&doc.content, section_type.as_deref())
            .unwrap_or_else(|| content.clone());

        Citation {
            id,
            content,
            preview,
            full_content: doc.content.clone(),
            source: metadata
                .source
                .clone()
                .unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
            page: metadata.page.clone(),
            disorder_name,
            icd_code,
            section_type,
            hierarchy_path: Some(hierarchy),
        }
    }
}

/// Byte ranges of sentences, split after a period followed by whitespace.
fn sentence_ends(text: &str) -> Vec<usize> {
    let mut ends = Vec::new();
    let mut chars = text.char_indices().peekable();
    while let Some((idx, c)) = chars.next() {
        if c == '.' {
            if let Some((_, next)) = chars.peek() {
                if next.is_whitespace() {
                    ends.push(idx + 1);
                }
            }
        }
    }
    ends.push(text.len());
    ends
}

/// Positions and values of every `^N` marker.
fn markers(text: &str) -> Vec<(usize, usize, Option<usize>)> {
    let bytes = text.as_bytes();
    let mut found = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'^' {
            let start = i;
            let mut end = i + 1;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
            if end > start + 1 {
                found.push((start, end, text[start + 1..end].parse::<usize>().ok()));
                i = end;
                continue;
            }
        }
        i += 1;
    }
    found
}

pub fn has_markers(text: &str) -> bool {
    !markers(text).is_empty()
}

/// Appends `^id` to the first sentence with a clinically salient keyword.
/// Text with a single sentence gets the marker at the end. Text that already
/// carries markers is left alone.
pub fn insert_marker(text: &str, id: usize) -> String {
    if text.trim().is_empty() || has_markers(text) {
        return text.to_string();
    }

    let ends = sentence_ends(text);
    if ends.len() == 1 {
        return format!("{}^{}", text.trim_end(), id);
    }

    let mut start = 0;
    for end in ends {
        let sentence = &text[start..end];
        let lowered = sentence.to_lowercase();
        if SALIENT_KEYWORDS.iter().any(|k| lowered.contains(k)) {
            let insert_at = start + sentence.trim_end().len();
            let mut out = String::with_capacity(text.len() + 4);
            out.push_str(&text[..insert_at]);
            out.push_str(&format!("^{}", id));
            out.push_str(&text[insert_at..]);
            return out;
        }
        start = end;
    }
    text.to_string()
}

/// Removes markers that do not point at one of `count` citations.
pub fn strip_dangling_markers(text: &str, count: usize) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for (start, end, value) in markers(text) {
        let valid = matches!(value, Some(n) if n >= 1 && n <= count);
        if !valid {
            out.push_str(&text[last..start]);
            last = end;
        }
    }
    out.push_str(&text[last..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::doc;
    use crate::types::DocumentMetadata;

    fn formatter() -> CitationFormatter {
        CitationFormatter::new(Arc::new(DisorderCatalog::dsm5tr()))
    }

    #[test]
    fn ids_are_sequential_and_metadata_is_kept() {
        let docs = vec![
            doc("Criteria text", Some("Borderline Personality Disorder"), Some("F60.3"), 0.9),
            doc("Other text", None, None, 0.4),
        ];
        let citations = formatter().format(&docs);
        assert_eq!(citations.iter().map(|c| c.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(citations[0].icd_code.as_deref(), Some("F60.3"));
        assert_eq!(
            citations[0].hierarchy_path.as_deref(),
            Some("DSM-5-TR > Borderline Personality Disorder")
        );
        assert_eq!(citations[1].hierarchy_path.as_deref(), Some("DSM-5-TR"));
        assert_eq!(citations[1].source, "DSM-5-TR");
    }

    #[test]
    fn content_scan_fills_missing_metadata() {
        let docs = vec![RetrievedDocument::new(
            "Individuals with posttraumatic stress may avoid reminders.",
            DocumentMetadata::default(),
            0.5,
        )];
        let citation = &formatter().format(&docs)[0];
        assert_eq!(citation.disorder_name.as_deref(), Some("Posttraumatic Stress Disorder"));
        assert_eq!(citation.icd_code.as_deref(), Some("F43.10"));
    }

    #[test]
    fn structured_chunk_supplies_disorder_and_section() {
        let content = "DOCUMENT: DSM-5-TR; DISORDER: Borderline Personality Disorder; SECTION: Diagnostic Features; TEXT: The essential feature is a pervasive pattern of instability";
        let chunk = StructuredChunk::parse(content).unwrap();
        assert_eq!(chunk.section.as_deref(), Some("Diagnostic Features"));

        let citation = &formatter().format(&[RetrievedDocument::new(content, DocumentMetadata::default(), 1.0)])[0];
        assert_eq!(citation.icd_code.as_deref(), Some("F60.3"));
        assert_eq!(
            citation.hierarchy_path.as_deref(),
            Some("DSM-5-TR > Borderline Personality Disorder > Diagnostic Features")
        );
        assert!(citation.preview.starts_with("[Diagnostic Features] The essential feature"));
    }

    #[test]
    fn plain_preview_truncates_on_char_boundary() {
        let long = "é".repeat(250);
        let preview = plain_preview(&long);
        assert_eq!(preview.chars().count(), PREVIEW_CHARS + 3);
        assert!(preview.ends_with("..."));
        assert_eq!(plain_preview("short"), "short");
    }

    #[test]
    fn contextual_preview_needs_a_cue() {
        assert!(contextual_preview("Nothing useful here. Just words.", None).is_none());
        let content = "This chapter opens the section. \
            Diagnostic criteria require five or more symptoms during the same two-week period. \
            Symptoms represent a change from previous functioning. \
            At least one symptom is depressed mood or loss of interest. \
            Fourth sentence is left out";
        let preview = contextual_preview(content, Some("General")).unwrap();
        assert!(preview.starts_with("Diagnostic criteria require five or more symptoms"));
        assert!(preview.ends_with("depressed mood or loss of interest"));
        assert!(!preview.contains("Fourth"));
    }

    #[test]
    fn marker_goes_after_first_salient_sentence() {
        let text = "Hello there. The diagnostic criteria include mood changes. Treatment varies.";
        assert_eq!(
            insert_marker(text, 1),
            "Hello there. The diagnostic criteria include mood changes.^1 Treatment varies."
        );
    }

    #[test]
    fn single_sentence_gets_trailing_marker() {
        assert_eq!(insert_marker("A short answer  ", 2), "A short answer^2");
    }

    #[test]
    fn existing_markers_take_precedence() {
        let text = "Criteria apply^2. Symptoms vary.";
        assert_eq!(insert_marker(text, 1), text);
    }

    #[test]
    fn no_salient_sentence_leaves_text_alone() {
        let text = "Hello there. Nice weather.";
        assert_eq!(insert_marker(text, 1), text);
    }

    #[test]
    fn dangling_markers_are_removed() {
        let text = "Five symptoms^1 over two weeks^3, see also^0 and^12.";
        assert_eq!(strip_dangling_markers(text, 2), "Five symptoms^1 over two weeks, see also and.");
        assert_eq!(strip_dangling_markers(text, 0), "Five symptoms over two weeks, see also and.");
        assert_eq!(strip_dangling_markers("x^ y", 1), "x^ y");
    }
}
