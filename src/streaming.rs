//! Server-sent event protocol for one chat message: status updates while the
//! pipeline runs, then the answer in word batches.

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::chat_store::{ChatMessage, ChatStore, StoreError};
use crate::config::StreamSettings;
use crate::rag_service::RagOrchestrator;
use crate::types::{ChatRole, ChatTurn, Citation};

pub const STATUS_ANALYZING: &str = "Analyzing symptoms and retrieving DSM-5-TR criteria...";
pub const STATUS_QUERYING: &str = "Querying vector database for relevant DSM-5-TR sections...";
pub const STATUS_GENERATING: &str = "Generating clinical analysis...";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    UserMessage {
        id: String,
        content: String,
    },
    Thinking {
        status: String,
    },
    Citations(Vec<Citation>),
    ResponseStart {},
    ResponseChunk {
        chunk: String,
        /// Word offset of the chunk's first word.
        index: usize,
    },
    ResponseComplete {
        id: String,
        full_response: String,
        citations: Vec<Citation>,
    },
    Error {
        message: String,
        id: Option<String>,
    },
}

impl StreamEvent {
    pub fn thinking(status: &str) -> Self {
        StreamEvent::Thinking {
            status: status.to_string(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::ResponseComplete { .. } | StreamEvent::Error { .. })
    }
}

/// Batches of `size` words, each tagged with the offset of its first word.
pub fn chunk_words(text: &str, size: usize) -> Vec<(usize, String)> {
    let words: Vec<&str> = text.split_whitespace().collect();
    words
        .chunks(size.max(1))
        .enumerate()
        .map(|(i, chunk)| (i * size.max(1), chunk.join(" ")))
        .collect()
}

/// Previous turns of the session, without the message being answered.
pub async fn conversation_history(
    store: &dyn ChatStore,
    session_id: &str,
    exclude_id: &str,
    turns: usize,
) -> Result<Vec<ChatTurn>, StoreError> {
    let messages = store.recent_messages(session_id, turns + 1).await?;
    let mut history: Vec<ChatTurn> = messages
        .iter()
        .filter(|m| m.id != exclude_id)
        .map(ChatMessage::to_turn)
        .collect();
    let start = history.len().saturating_sub(turns);
    Ok(history.split_off(start))
}

#[derive(Clone)]
pub struct ChatStreamer {
    store: Arc<dyn ChatStore>,
    rag: Arc<RagOrchestrator>,
    pacing: StreamSettings,
    history_turns: usize,
}

struct Disconnected;

impl ChatStreamer {
    pub fn new(
        store: Arc<dyn ChatStore>,
        rag: Arc<RagOrchestrator>,
        pacing: StreamSettings,
        history_turns: usize,
    ) -> Self {
        Self {
            store,
            rag,
            pacing,
            history_turns,
        }
    }

    async fn send(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> Result<(), Disconnected> {
        tx.send(event).await.map_err(|_| Disconnected)
    }

    /// Emits the full event sequence for an already stored user message.
    /// Ends with `response_complete` or `error`, unless the client goes away.
    pub async fn run(&self, user_message: ChatMessage, tx: mpsc::Sender<StreamEvent>) {
        let session_id = user_message.session_id.clone();
        if let Err(e) = self.stream(&user_message, &tx).await {
            match e {
                StreamFailure::Disconnected => {
                    warn!("Client left session {} mid-stream", session_id);
                }
                StreamFailure::Store(e) => {
                    error!("Streaming failed for session {}: {}", session_id, e);
                    let message = format!("I apologize, but I encountered an error: {}", e);
                    let stored = self
                        .store
                        .add_message(ChatMessage::new(&session_id, ChatRole::Assistant, message.clone(), vec![]))
                        .await
                        .ok()
                        .map(|m| m.id);
                    let _ = Self::send(&tx, StreamEvent::Error { message, id: stored }).await;
                }
            }
        }
    }

    async fn stream(&self, user_message: &ChatMessage, tx: &mpsc::Sender<StreamEvent>) -> Result<(), StreamFailure> {
        Self::send(
            tx,
            StreamEvent::UserMessage {
                id: user_message.id.clone(),
                content: user_message.content.clone(),
            },
        )
        .await?;

        Self::send(tx, StreamEvent::thinking(STATUS_ANALYZING)).await?;
        tokio::time::sleep(self.pacing.status_delay).await;
        Self::send(tx, StreamEvent::thinking(STATUS_QUERYING)).await?;
        tokio::time::sleep(self.pacing.status_delay).await;

        let history = conversation_history(
            self.store.as_ref(),
            &user_message.session_id,
            &user_message.id,
            self.history_turns,
        )
        .await?;

        Self::send(tx, StreamEvent::thinking(STATUS_GENERATING)).await?;
        let response = self.rag.process_query(&user_message.content, &history).await;

        if !response.citations.is_empty() {
            Self::send(tx, StreamEvent::Citations(response.citations.clone())).await?;
        }

        Self::send(tx, StreamEvent::ResponseStart {}).await?;
        let chunks = chunk_words(&response.response, self.pacing.chunk_words);
        for (index, chunk) in chunks {
            Self::send(tx, StreamEvent::ResponseChunk { chunk, index }).await?;
            tokio::time::sleep(self.pacing.chunk_delay).await;
        }

        let assistant = self
            .store
            .add_message(ChatMessage::new(
                &user_message.session_id,
                ChatRole::Assistant,
                response.response.clone(),
                response.citations.clone(),
            ))
            .await?;
        info!("Stored assistant message {} for session {}", assistant.id, user_message.session_id);

        Self::send(
            tx,
            StreamEvent::ResponseComplete {
                id: assistant.id,
                full_response: response.response,
                citations: response.citations,
            },
        )
        .await?;
        Ok(())
    }
}

enum StreamFailure {
    Disconnected,
    Store(StoreError),
}

impl From<Disconnected> for StreamFailure {
    fn from(_: Disconnected) -> Self {
        StreamFailure::Disconnected
    }
}

impl From<StoreError> for StreamFailure {
    fn from(e: StoreError) -> Self {
        StreamFailure::Store(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat_store::{ChatSession, InMemoryChatStore};
    use crate::config::PromptStrategy;
    use crate::disorders::DisorderCatalog;
    use crate::llm_service::LlmService;
    use crate::retrieval_service::RetrievalClient;
    use crate::testing::{doc, FailingRetriever, StubLlm, StubRetriever};
    use crate::verified_answers::VerifiedAnswerCache;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    const TWELVE_WORDS: &str = "one two three four five six seven eight nine ten eleven twelve";

    fn pacing() -> StreamSettings {
        StreamSettings {
            chunk_words: 4,
            chunk_delay: Duration::ZERO,
            status_delay: Duration::ZERO,
        }
    }

    fn rag(retriever: Arc<dyn crate::retrieval_service::Retriever>, reply: &str) -> Arc<RagOrchestrator> {
        let catalog = Arc::new(DisorderCatalog::dsm5tr());
        Arc::new(RagOrchestrator::new(
            Arc::clone(&catalog),
            RetrievalClient::new(retriever, Duration::from_secs(1)),
            LlmService::new(Arc::new(StubLlm::new(reply)), Duration::from_secs(1), 0),
            PromptStrategy::Grounded,
            Arc::new(VerifiedAnswerCache::empty(catalog)),
            10,
        ))
    }

    async fn collect(streamer: &ChatStreamer, store: &InMemoryChatStore, content: &str) -> (String, Vec<StreamEvent>) {
        let session = store.create_session("alice", None).await.unwrap();
        let user = store
            .add_message(ChatMessage::new(&session.id, ChatRole::User, content, vec![]))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(64);
        streamer.run(user, tx).await;

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (session.id, events)
    }

    /// Stores messages normally but cannot read history back.
    #[derive(Default)]
    struct HistoryOutageStore {
        inner: InMemoryChatStore,
    }

    #[async_trait]
    impl ChatStore for HistoryOutageStore {
        async fn create_session(&self, user_id: &str, title: Option<String>) -> Result<ChatSession, StoreError> {
            self.inner.create_session(user_id, title).await
        }

        async fn get_session(&self, user_id: &str, session_id: &str) -> Result<ChatSession, StoreError> {
            self.inner.get_session(user_id, session_id).await
        }

        async fn add_message(&self, message: ChatMessage) -> Result<ChatMessage, StoreError> {
            self.inner.add_message(message).await
        }

        async fn messages(&self, session_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
            self.inner.messages(session_id).await
        }

        async fn recent_messages(&self, _session_id: &str, _limit: usize) -> Result<Vec<ChatMessage>, StoreError> {
            Err(StoreError::Backend("connection reset".to_string()))
        }
    }

    #[test]
    fn chunk_offsets_are_word_indices() {
        let chunks = chunk_words("a b c d e f", 4);
        assert_eq!(chunks, vec![(0, "a b c d".to_string()), (4, "e f".to_string())]);
        assert!(chunk_words("   ", 4).is_empty());
    }

    #[test]
    fn events_use_type_and_data() {
        let event = StreamEvent::ResponseChunk {
            chunk: "a b".to_string(),
            index: 4,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "response_chunk", "data": {"chunk": "a b", "index": 4}})
        );
        assert_eq!(
            serde_json::to_value(StreamEvent::ResponseStart {}).unwrap(),
            json!({"type": "response_start", "data": {}})
        );
    }

    #[tokio::test]
    async fn twelve_words_stream_as_three_chunks() {
        let store = Arc::new(InMemoryChatStore::new());
        let streamer = ChatStreamer::new(store.clone(), rag(Arc::new(FailingRetriever), TWELVE_WORDS), pacing(), 6);

        let (_, events) = collect(&streamer, &store, "general question").await;

        assert!(matches!(events[0], StreamEvent::UserMessage { ref content, .. } if content == "general question"));
        let chunks: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ResponseChunk { chunk, .. } => Some(chunk.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(chunks.len(), 3);

        let last = events.last().unwrap();
        assert!(last.is_terminal());
        match last {
            StreamEvent::ResponseComplete { full_response, citations, .. } => {
                assert_eq!(chunks.join(" "), full_response.trim());
                assert!(citations.is_empty());
            }
            other => panic!("unexpected terminal event {:?}", other),
        }

        let thinking = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Thinking { .. }))
            .count();
        assert_eq!(thinking, 3);
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::Citations(_))));
    }

    #[tokio::test]
    async fn citations_precede_response_start() {
        let store = Arc::new(InMemoryChatStore::new());
        let retriever = Arc::new(StubRetriever::new(vec![doc(
            "Exposure to actual or threatened death",
            Some("Posttraumatic Stress Disorder"),
            Some("F43.10"),
            0.9,
        )]));
        let streamer = ChatStreamer::new(store.clone(), rag(retriever, "PTSD criteria^1 apply."), pacing(), 6);

        let (session_id, events) = collect(&streamer, &store, "PTSD criteria").await;
        let citations_at = events.iter().position(|e| matches!(e, StreamEvent::Citations(_))).unwrap();
        let start_at = events.iter().position(|e| matches!(e, StreamEvent::ResponseStart {})).unwrap();
        assert!(citations_at < start_at);

        let StreamEvent::ResponseComplete { id, .. } = events.last().unwrap() else {
            panic!("stream did not complete");
        };
        let stored = store.messages(&session_id).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(&stored[1].id, id);
        assert_eq!(stored[1].citations.len(), 1);
    }

    #[tokio::test]
    async fn history_excludes_current_message() {
        let store = InMemoryChatStore::new();
        let session = store.create_session("alice", None).await.unwrap();
        for (role, text) in [
            (ChatRole::User, "What about PTSD?"),
            (ChatRole::Assistant, "PTSD requires..."),
        ] {
            store
                .add_message(ChatMessage::new(&session.id, role, text, vec![]))
                .await
                .unwrap();
        }
        let current = store
            .add_message(ChatMessage::new(&session.id, ChatRole::User, "and treatment?", vec![]))
            .await
            .unwrap();

        let history = conversation_history(&store, &session.id, &current.id, 6).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, "PTSD requires...");
    }

    #[tokio::test]
    async fn history_failure_ends_with_error_event() {
        let store = Arc::new(HistoryOutageStore::default());
        let streamer = ChatStreamer::new(store.clone(), rag(Arc::new(FailingRetriever), TWELVE_WORDS), pacing(), 6);

        let session = store.create_session("alice", None).await.unwrap();
        let user = store
            .add_message(ChatMessage::new(&session.id, ChatRole::User, "general question", vec![]))
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        streamer.run(user, tx).await;
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }

        assert!(!events
            .iter()
            .any(|e| matches!(e, StreamEvent::ResponseComplete { .. } | StreamEvent::ResponseStart {})));
        let StreamEvent::Error { message, id } = events.last().unwrap() else {
            panic!("stream did not end with an error: {:?}", events.last());
        };
        assert!(message.contains("connection reset"));

        let stored = store.messages(&session.id).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].role, ChatRole::Assistant);
        assert_eq!(id.as_deref(), Some(stored[1].id.as_str()));
    }
}
