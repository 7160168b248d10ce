pub mod auth;
pub mod chat_store;
pub mod citation_service;
pub mod config;
pub mod context_builder;
pub mod disorder_filter;
pub mod disorders;
pub mod embedding_service;
pub mod error;
pub mod handlers;
pub mod icd11_service;
pub mod llm_service;
pub mod rag_service;
pub mod retrieval_service;
pub mod state;
pub mod streaming;
pub mod types;
pub mod verified_answers;

#[cfg(test)]
mod testing;
