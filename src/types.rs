use serde::{Deserialize, Serialize};
use std::fmt;

pub const DISCLAIMER: &str =
    "This is a clinical decision support tool and not a replacement for professional psychiatric evaluation.";

pub const DEFAULT_SOURCE: &str = "DSM-5-TR";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

impl fmt::Display for ChatRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content)
    }
}

/// Keeps the most recent `limit` turns, oldest first.
pub fn recent_turns(history: &[ChatTurn], limit: usize) -> &[ChatTurn] {
    let start = history.len().saturating_sub(limit);
    &history[start..]
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disorder_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icd_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hierarchy_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub content: String,
    #[serde(default)]
    pub metadata: DocumentMetadata,
    pub score: f32,
}

impl RetrievedDocument {
    pub fn new(content: impl Into<String>, metadata: DocumentMetadata, score: f32) -> Self {
        Self {
            content: content.into(),
            metadata,
            score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub id: usize,
    pub content: String,
    pub preview: String,
    pub full_content: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disorder_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icd_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hierarchy_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub response: String,
    pub citations: Vec<Citation>,
    pub disclaimer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl AgentResponse {
    pub fn new(response: impl Into<String>, citations: Vec<Citation>) -> Self {
        Self {
            response: response.into(),
            citations,
            disclaimer: DISCLAIMER.to_string(),
            model: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_turns_keeps_tail_in_order() {
        let history: Vec<ChatTurn> = (0..8).map(|i| ChatTurn::user(format!("turn {}", i))).collect();
        let tail = recent_turns(&history, 3);
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].content, "turn 5");
        assert_eq!(tail[2].content, "turn 7");
    }

    #[test]
    fn recent_turns_with_short_history() {
        let history = vec![ChatTurn::user("only")];
        assert_eq!(recent_turns(&history, 6).len(), 1);
    }

    #[test]
    fn role_serializes_lowercase() {
        let turn = ChatTurn::assistant("hi");
        let json = serde_json::to_string(&turn).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"hi"}"#);
    }

    #[test]
    fn agent_response_carries_disclaimer() {
        let response = AgentResponse::new("text", vec![]);
        assert_eq!(response.disclaimer, DISCLAIMER);
        assert!(response.model.is_none());
    }
}
