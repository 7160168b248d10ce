//! Prompt assembly: the source context block, the conversation preamble and
//! the two prompt strategies.

use std::sync::Arc;

use crate::config::PromptStrategy;
use crate::disorders::DisorderCatalog;
use crate::types::{recent_turns, ChatRole, ChatTurn, RetrievedDocument};

/// History turns replayed to the model.
pub const PROMPT_HISTORY_TURNS: usize = 4;

const PREVIOUS_QUESTION_CHARS: usize = 100;

const FOLLOW_UP_INDICATORS: &[&str] = &[
    "treatment",
    "therapy",
    "medication",
    "prognosis",
    "how",
    "what about",
    "also",
    "additionally",
];

const GROUNDED_SYSTEM_PROMPT: &str = "You are a psychiatric clinical decision support assistant with expertise in DSM-5-TR diagnostic criteria.

CRITICAL INSTRUCTIONS:
1. Base your response ONLY on the provided DSM-5-TR sources
2. Cite sources using ^1, ^2, ^3 format inline (e.g., \"Major Depressive Disorder requires five symptoms^1\")
3. Use multiple citations when combining information from different sources
4. Structure responses clearly with diagnostic criteria, features, and considerations
5. Include ICD codes when discussing specific disorders
6. If sources don't contain enough information, acknowledge limitations

RESPONSE FORMAT:
- Start with a clear answer to the clinical question
- Present diagnostic criteria as numbered lists when applicable
- Cite each major point with ^N notation
- End with clinical considerations or differential diagnosis if relevant";

const CONVERSATIONAL_SYSTEM_PROMPT: &str = "You are a DSM-5-TR Clinical Reference Assistant providing psychiatric consultation.

INSTRUCTIONS:
- Respond naturally and professionally, varying your language based on context
- For new topics: Start directly with the clinical information requested
- For follow-up questions: Reference previous discussion naturally (\"Regarding the PTSD we discussed...\", \"For that same condition...\", etc.)
- For treatment questions: Focus on the disorder from recent conversation context
- Provide accurate DSM-5-TR information with diagnostic codes when relevant
- Be concise but thorough";

const NO_SOURCES_NOTE: &str = "No DSM-5-TR sources could be retrieved for this question. Answer from general DSM-5-TR knowledge, state clearly that no sources were available, and do not use citation markers.";

/// One block per document: `[Source i] Disorder (ICD)` then the content.
pub fn build(docs: &[RetrievedDocument]) -> String {
    docs.iter()
        .enumerate()
        .map(|(i, doc)| {
            let mut header = format!("[Source {}]", i + 1);
            if let Some(name) = &doc.metadata.disorder_name {
                header.push(' ');
                header.push_str(name);
            }
            if let Some(code) = &doc.metadata.icd_code {
                header.push_str(&format!(" ({})", code));
            }
            format!("{}\n{}\n", header, doc.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Short note describing where the conversation stands, derived from the
/// last few turns.
pub fn conversation_preamble(catalog: &DisorderCatalog, query: &str, history: &[ChatTurn]) -> String {
    if history.len() < 2 {
        return "CONTEXT: This is a new conversation topic.".to_string();
    }

    let recent = recent_turns(history, PROMPT_HISTORY_TURNS);
    let mut lines = Vec::new();

    match catalog.detect_in_conversation("", recent, recent.len()) {
        Some(entry) => {
            lines.push(format!("CONTEXT: Ongoing discussion about {}.", entry.name));
            let lowered = query.to_lowercase();
            if FOLLOW_UP_INDICATORS.iter().any(|i| lowered.contains(i)) {
                lines.push(format!(
                    "This appears to be a follow-up question about {}.",
                    entry.name
                ));
            }
        }
        None => lines.push("CONTEXT: This appears to be a new topic.".to_string()),
    }

    let previous = recent
        .iter()
        .rev()
        .find(|turn| turn.role == ChatRole::User)
        .map(|turn| turn.content.as_str())
        .filter(|content| !content.is_empty() && *content != query);
    if let Some(previous) = previous {
        let excerpt: String = previous.chars().take(PREVIOUS_QUESTION_CHARS).collect();
        lines.push(format!("Previous question: {}...", excerpt));
    }

    lines.join("\n") + "\n"
}

/// Builds the message list for the configured prompt strategy.
#[derive(Clone)]
pub struct PromptBuilder {
    strategy: PromptStrategy,
    catalog: Arc<DisorderCatalog>,
}

impl PromptBuilder {
    pub fn new(strategy: PromptStrategy, catalog: Arc<DisorderCatalog>) -> Self {
        Self { strategy, catalog }
    }

    /// System instruction, then recent history, then the query. `context` is
    /// `None` in LLM-only mode.
    pub fn messages(&self, query: &str, context: Option<&str>, history: &[ChatTurn]) -> Vec<ChatTurn> {
        let system = match self.strategy {
            PromptStrategy::Grounded => GROUNDED_SYSTEM_PROMPT,
            PromptStrategy::Conversational => CONVERSATIONAL_SYSTEM_PROMPT,
        };

        let mut messages = vec![ChatTurn::system(system)];
        messages.extend(
            recent_turns(history, PROMPT_HISTORY_TURNS)
                .iter()
                .filter(|turn| turn.role != ChatRole::System)
                .cloned(),
        );
        messages.push(ChatTurn::user(self.user_message(query, context, history)));
        messages
    }

    fn user_message(&self, query: &str, context: Option<&str>, history: &[ChatTurn]) -> String {
        match (self.strategy, context) {
            (PromptStrategy::Grounded, Some(context)) => format!(
                "Based on these DSM-5-TR sources:\n\n{}\n\nQuestion: {}\n\nProvide a detailed clinical response with inline citations (^1, ^2, etc.).",
                context, query
            ),
            (PromptStrategy::Grounded, None) => {
                format!("Question: {}\n\n{}", query, NO_SOURCES_NOTE)
            }
            (PromptStrategy::Conversational, context) => format!(
                "{}\nDSM-5-TR CONTEXT:\n{}\n\nCLINICIAN QUERY: {}\n\nRESPONSE:",
                conversation_preamble(&self.catalog, query, history),
                context.unwrap_or(NO_SOURCES_NOTE),
                query
            ),
        }
    }
}
