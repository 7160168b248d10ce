use async_trait::async_trait;
use futures::StreamExt;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use super::{LlmClient, LlmError, TextStream};
use crate::config::LlmSettings;
use crate::types::ChatTurn;

/// Local Ollama server, native `/api/chat` endpoint.
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatTurn],
    stream: bool,
    options: ChatOptions,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
}

impl OllamaClient {
    pub fn new(client: reqwest::Client, settings: &LlmSettings) -> Self {
        Self {
            client,
            base_url: settings.ollama_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
        }
    }

    async fn post_chat(&self, messages: &[ChatTurn], stream: bool) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/api/chat", self.base_url);
        let request = ChatRequest {
            model: &self.model,
            messages,
            stream,
            options: ChatOptions {
                temperature: self.temperature,
                num_predict: self.max_tokens,
            },
        };

        let response = self.client.post(&url).json(&request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Provider {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

pub(crate) fn parse_chunk(line: &str) -> Result<ChatChunk, LlmError> {
    let chunk: ChatChunk =
        serde_json::from_str(line).map_err(|e| LlmError::MalformedResponse(e.to_string()))?;
    if let Some(error) = chunk.error {
        return Err(LlmError::MalformedResponse(error));
    }
    Ok(chunk)
}

/// Splits a byte stream into newline-delimited JSON records.
#[derive(Default)]
pub(crate) struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line).trim().to_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    pub(crate) fn finish(&mut self) -> Option<String> {
        let rest = String::from_utf8_lossy(&self.buffer).trim().to_string();
        self.buffer.clear();
        if rest.is_empty() {
            None
        } else {
            Some(rest)
        }
    }
}

struct StreamState<S> {
    bytes: S,
    lines: LineBuffer,
    pending: VecDeque<Result<String, LlmError>>,
    finished: bool,
}

impl<S> StreamState<S> {
    fn queue_line(&mut self, line: &str) {
        match parse_chunk(line) {
            Ok(chunk) => {
                if let Some(message) = chunk.message {
                    if !message.content.is_empty() {
                        self.pending.push_back(Ok(message.content));
                    }
                }
                if chunk.done {
                    self.finished = true;
                }
            }
            Err(e) => {
                self.pending.push_back(Err(e));
                self.finished = true;
            }
        }
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    fn name(&self) -> &'static str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, messages: &[ChatTurn]) -> Result<String, LlmError> {
        debug!("Sending {} messages to Ollama", messages.len());
        let response = self.post_chat(messages, false).await?;
        let body = response.text().await?;
        let chunk = parse_chunk(&body)?;
        chunk
            .message
            .map(|m| m.content)
            .ok_or_else(|| LlmError::MalformedResponse("chat response had no message".to_string()))
    }

    async fn generate_stream(&self, messages: &[ChatTurn]) -> Result<TextStream, LlmError> {
        let response = self.post_chat(messages, true).await?;
        let state = StreamState {
            bytes: response.bytes_stream().boxed(),
            lines: LineBuffer::default(),
            pending: VecDeque::new(),
            finished: false,
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(item) = state.pending.pop_front() {
                    return Some((item, state));
                }
                if state.finished {
                    return None;
                }
                match state.bytes.next().await {
                    Some(Ok(bytes)) => {
                        for line in state.lines.push(&bytes) {
                            state.queue_line(&line);
                        }
                    }
                    Some(Err(e)) => {
                        state.pending.push_back(Err(LlmError::from(e)));
                        state.finished = true;
                    }
                    None => {
                        if let Some(line) = state.lines.finish() {
                            state.queue_line(&line);
                        }
                        state.finished = true;
                    }
                }
            }
        });

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_partial_lines() {
        let mut lines = LineBuffer::default();
        assert!(lines.push(br#"{"message":{"content":"Bor"#).is_empty());
        let complete = lines.push(b"derline\"},\"done\":false}\n{\"done\":true}\n");
        assert_eq!(complete.len(), 2);
        assert!(lines.finish().is_none());

        let first = parse_chunk(&complete[0]).unwrap();
        assert_eq!(first.message.unwrap().content, "Borderline");
        assert!(parse_chunk(&complete[1]).unwrap().done);
    }

    #[test]
    fn trailing_record_without_newline() {
        let mut lines = LineBuffer::default();
        assert!(lines.push(br#"{"done":true}"#).is_empty());
        assert_eq!(lines.finish().as_deref(), Some(r#"{"done":true}"#));
    }

    #[test]
    fn error_record_is_malformed() {
        assert!(matches!(
            parse_chunk(r#"{"error":"model 'llama3' not found"}"#),
            Err(LlmError::MalformedResponse(_))
        ));
    }

    #[test]
    fn request_uses_lowercase_roles() {
        let messages = vec![ChatTurn::system("rules"), ChatTurn::user("q")];
        let request = ChatRequest {
            model: "llama3",
            messages: &messages,
            stream: false,
            options: ChatOptions {
                temperature: 0.1,
                num_predict: 256,
            },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["options"]["num_predict"], 256);
    }
}
