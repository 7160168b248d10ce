//! Retrieval-augmented answer pipeline.
//!
//! `process_query` always returns a well-formed `AgentResponse`: provider
//! failures degrade to LLM-only generation or to a fixed clinical-safety
//! message, never to an error.

use futures::FutureExt;
use log::{error, info, warn};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use crate::citation_service::{insert_marker, strip_dangling_markers, CitationFormatter};
use crate::config::PromptStrategy;
use crate::context_builder::{self, PromptBuilder};
use crate::disorder_filter::DisorderFilter;
use crate::disorders::DisorderCatalog;
use crate::icd11_service::{cross_reference_citations, CrossReferencer, MAX_CROSS_REFERENCES};
use crate::llm_service::LlmService;
use crate::retrieval_service::{RetrievalClient, RetrievalOutcome};
use crate::types::{AgentResponse, ChatTurn, Citation, RetrievedDocument, DISCLAIMER};
use crate::verified_answers::VerifiedAnswerCache;

pub const PROCESSING_APOLOGY: &str = "I apologize, but I encountered an error processing your query. Please try again or contact support if the issue persists.";

pub const NO_CONTENT_MESSAGE: &str = "I couldn't find specific information about that disorder in the DSM-5-TR database. Please check the spelling or try a different disorder name.";

pub const VERIFIED_MODEL: &str = "verified-answer";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Start,
    VerifiedAnswer,
    Retrieve,
    Filter,
    BuildContext,
    Generate,
    FormatCitations,
    CrossReference,
    Done,
    ErrorFallback,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Start => "START",
            PipelineStage::VerifiedAnswer => "VERIFIED_ANSWER",
            PipelineStage::Retrieve => "RETRIEVE",
            PipelineStage::Filter => "FILTER",
            PipelineStage::BuildContext => "BUILD_CONTEXT",
            PipelineStage::Generate => "GENERATE",
            PipelineStage::FormatCitations => "FORMAT_CITATIONS",
            PipelineStage::CrossReference => "CROSS_REFERENCE",
            PipelineStage::Done => "DONE",
            PipelineStage::ErrorFallback => "ERROR_FALLBACK",
        };
        f.write_str(name)
    }
}

/// Fixed answer for a failed generation. Carries the disclaimer in the text
/// itself so it survives clients that drop the `disclaimer` field.
pub fn clinical_safety_response() -> AgentResponse {
    AgentResponse::new(format!("{}\n\n{}", PROCESSING_APOLOGY, DISCLAIMER), Vec::new())
}

pub struct RagOrchestrator {
    catalog: Arc<DisorderCatalog>,
    retrieval: RetrievalClient,
    filter: DisorderFilter,
    prompts: PromptBuilder,
    llm: LlmService,
    citations: CitationFormatter,
    verified: Arc<VerifiedAnswerCache>,
    icd11: Option<Arc<dyn CrossReferencer>>,
    icd11_timeout: Duration,
    top_k: usize,
}

impl RagOrchestrator {
    pub fn new(
        catalog: Arc<DisorderCatalog>,
        retrieval: RetrievalClient,
        llm: LlmService,
        strategy: PromptStrategy,
        verified: Arc<VerifiedAnswerCache>,
        top_k: usize,
    ) -> Self {
        Self {
            filter: DisorderFilter::new(Arc::clone(&catalog)),
            prompts: PromptBuilder::new(strategy, Arc::clone(&catalog)),
            citations: CitationFormatter::new(Arc::clone(&catalog)),
            catalog,
            retrieval,
            llm,
            verified,
            icd11: None,
            icd11_timeout: Duration::from_secs(10),
            top_k,
        }
    }

    pub fn with_icd11(mut self, client: Arc<dyn CrossReferencer>, timeout: Duration) -> Self {
        self.icd11 = Some(client);
        self.icd11_timeout = timeout;
        self
    }

    pub async fn process_query(&self, query: &str, history: &[ChatTurn]) -> AgentResponse {
        info!("[{}] query: {:.100}", PipelineStage::Start, query);
        match AssertUnwindSafe(self.run(query, history)).catch_unwind().await {
            Ok(response) => {
                info!(
                    "[{}] {} chars, {} citations",
                    PipelineStage::Done,
                    response.response.len(),
                    response.citations.len()
                );
                response
            }
            Err(_) => {
                error!("[{}] pipeline panicked", PipelineStage::ErrorFallback);
                clinical_safety_response()
            }
        }
    }

    async fn run(&self, query: &str, history: &[ChatTurn]) -> AgentResponse {
        if let Some(verified) = self.verified.lookup(query) {
            info!(
                "[{}] serving curated answer for {}",
                PipelineStage::VerifiedAnswer,
                verified.disorder_id
            );
            let answer = strip_dangling_markers(&verified.answer, verified.citations.len());
            return AgentResponse::new(answer, verified.citations.clone()).with_model(VERIFIED_MODEL);
        }

        info!("[{}] backend={} top_k={}", PipelineStage::Retrieve, self.retrieval.backend_name(), self.top_k);
        let docs = match self.retrieval.search(query, self.top_k).await {
            RetrievalOutcome::Documents(docs) => docs,
            RetrievalOutcome::Empty => {
                if let Some(entry) = self.catalog.detect(query) {
                    warn!("[{}] nothing indexed for {}", PipelineStage::Retrieve, entry.name);
                    return AgentResponse::new(NO_CONTENT_MESSAGE, Vec::new());
                }
                return self.generate_without_sources(query, history).await;
            }
            RetrievalOutcome::Unavailable(e) => {
                warn!("[{}] unavailable, continuing LLM-only: {}", PipelineStage::Retrieve, e);
                return self.generate_without_sources(query, history).await;
            }
        };

        let docs = self.filter.filter(docs, query, history);
        info!("[{}] {} documents kept", PipelineStage::Filter, docs.len());

        let context = context_builder::build(&docs);
        info!("[{}] {} chars of context", PipelineStage::BuildContext, context.len());

        let messages = self.prompts.messages(query, Some(&context), history);
        let text = match self.llm.generate(&messages).await {
            Ok(text) => text,
            Err(e) => {
                error!("[{}] generation failed: {}", PipelineStage::ErrorFallback, e);
                return clinical_safety_response();
            }
        };

        let mut citations = self.citations.format(&docs);
        info!("[{}] {} citations", PipelineStage::FormatCitations, citations.len());
        let text = insert_marker(&text, 1);

        citations.extend(self.cross_reference(query, citations.len() + 1, &docs).await);

        let text = strip_dangling_markers(&text, citations.len());
        AgentResponse::new(text, citations).with_model(self.llm.model())
    }

    async fn generate_without_sources(&self, query: &str, history: &[ChatTurn]) -> AgentResponse {
        let messages = self.prompts.messages(query, None, history);
        match self.llm.generate(&messages).await {
            Ok(text) => {
                info!("[{}] LLM-only answer, no citations", PipelineStage::Generate);
                AgentResponse::new(strip_dangling_markers(&text, 0), Vec::new())
                    .with_model(self.llm.model())
            }
            Err(e) => {
                error!("[{}] generation failed: {}", PipelineStage::ErrorFallback, e);
                clinical_safety_response()
            }
        }
    }

    async fn cross_reference(&self, query: &str, first_id: usize, docs: &[RetrievedDocument]) -> Vec<Citation> {
        let Some(client) = &self.icd11 else {
            return Vec::new();
        };
        if docs.is_empty() {
            return Vec::new();
        }

        match tokio::time::timeout(self.icd11_timeout, client.search(query, MAX_CROSS_REFERENCES)).await {
            Ok(Ok(matches)) => {
                info!("[{}] {} ICD-11 matches", PipelineStage::CrossReference, matches.len());
                cross_reference_citations(&matches, first_id)
            }
            Ok(Err(e)) => {
                warn!("[{}] ICD-11 lookup failed: {}", PipelineStage::CrossReference, e);
                Vec::new()
            }
            Err(_) => {
                warn!("[{}] ICD-11 lookup timed out", PipelineStage::CrossReference);
                Vec::new()
            }
        }
    }
}
