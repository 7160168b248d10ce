//! Deterministic provider stubs for unit tests.

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::icd11_service::{CrossReferencer, Icd11Error, Icd11Match};
use crate::llm_service::{LlmClient, LlmError, TextStream};
use crate::retrieval_service::{RetrievalError, Retriever};
use crate::types::{ChatTurn, DocumentMetadata, RetrievedDocument};

pub fn doc(content: &str, disorder_name: Option<&str>, icd_code: Option<&str>, score: f32) -> RetrievedDocument {
    RetrievedDocument::new(
        content,
        DocumentMetadata {
            disorder_name: disorder_name.map(str::to_string),
            icd_code: icd_code.map(str::to_string),
            source: Some("DSM-5-TR".to_string()),
            ..Default::default()
        },
        score,
    )
}

pub struct StubRetriever {
    docs: Vec<RetrievedDocument>,
    calls: AtomicUsize,
}

impl StubRetriever {
    pub fn new(docs: Vec<RetrievedDocument>) -> Self {
        Self {
            docs,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Retriever for StubRetriever {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn search(&self, _query: &str, _top_k: usize) -> Result<Vec<RetrievedDocument>, RetrievalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.docs.clone())
    }
}

pub struct FailingRetriever;

#[async_trait]
impl Retriever for FailingRetriever {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn search(&self, _query: &str, _top_k: usize) -> Result<Vec<RetrievedDocument>, RetrievalError> {
        Err(RetrievalError::Provider {
            status: 503,
            body: "vector store unavailable".to_string(),
        })
    }
}

/// Replies with a fixed text and records the last message list it saw.
pub struct StubLlm {
    reply: String,
    calls: AtomicUsize,
    last_messages: Mutex<Vec<ChatTurn>>,
}

impl StubLlm {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            calls: AtomicUsize::new(0),
            last_messages: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_messages(&self) -> Vec<ChatTurn> {
        self.last_messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for StubLlm {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn model(&self) -> &str {
        "stub-model"
    }

    async fn generate(&self, messages: &[ChatTurn]) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_messages.lock().unwrap() = messages.to_vec();
        Ok(self.reply.clone())
    }

    async fn generate_stream(&self, messages: &[ChatTurn]) -> Result<TextStream, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_messages.lock().unwrap() = messages.to_vec();
        let fragments: Vec<Result<String, LlmError>> = self
            .reply
            .split_inclusive(' ')
            .map(|s| Ok(s.to_string()))
            .collect();
        Ok(futures::stream::iter(fragments).boxed())
    }
}

pub struct FailingLlm;

#[async_trait]
impl LlmClient for FailingLlm {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn model(&self) -> &str {
        "failing-model"
    }

    async fn generate(&self, _messages: &[ChatTurn]) -> Result<String, LlmError> {
        Err(LlmError::Provider {
            status: 429,
            body: "rate limited".to_string(),
        })
    }

    async fn generate_stream(&self, _messages: &[ChatTurn]) -> Result<TextStream, LlmError> {
        Err(LlmError::Provider {
            status: 429,
            body: "rate limited".to_string(),
        })
    }
}

/// Fails the first `failures` calls, then replies.
pub struct FlakyLlm {
    failures: usize,
    reply: String,
    calls: AtomicUsize,
}

impl FlakyLlm {
    pub fn new(failures: usize, reply: &str) -> Self {
        Self {
            failures,
            reply: reply.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for FlakyLlm {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn model(&self) -> &str {
        "flaky-model"
    }

    async fn generate(&self, _messages: &[ChatTurn]) -> Result<String, LlmError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(LlmError::MalformedResponse("missing choices".to_string()))
        } else {
            Ok(self.reply.clone())
        }
    }

    async fn generate_stream(&self, messages: &[ChatTurn]) -> Result<TextStream, LlmError> {
        let text = self.generate(messages).await?;
        Ok(futures::stream::iter(vec![Ok(text)]).boxed())
    }
}

/// Returns fixed ICD-11 matches after an optional delay.
pub struct StubIcd11 {
    matches: Vec<Icd11Match>,
    delay: std::time::Duration,
}

impl StubIcd11 {
    pub fn new(codes: &[(&str, &str)]) -> Self {
        let matches = codes
            .iter()
            .map(|(code, title)| Icd11Match {
                code: code.to_string(),
                title: title.to_string(),
                uri: format!("http://id.who.int/icd/entity/{}", code),
                score: 0.9,
            })
            .collect();
        Self {
            matches,
            delay: std::time::Duration::ZERO,
        }
    }

    pub fn delayed(mut self, delay: std::time::Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl CrossReferencer for StubIcd11 {
    async fn search(&self, _query: &str, max_results: usize) -> Result<Vec<Icd11Match>, Icd11Error> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.matches.iter().take(max_results).cloned().collect())
    }
}

pub struct FailingIcd11;

#[async_trait]
impl CrossReferencer for FailingIcd11 {
    async fn search(&self, _query: &str, _max_results: usize) -> Result<Vec<Icd11Match>, Icd11Error> {
        Err(Icd11Error::Provider {
            status: 401,
            body: "invalid_client".to_string(),
        })
    }
}
