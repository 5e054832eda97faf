//! SmartChat - Retrieval-augmented dialogue core
//!
//! Answers questions over a document corpus: hybrid vector and keyword
//! retrieval, second-pass reranking, cited prompt assembly, generation through
//! a fallback chain of LLM providers (blocking or streamed), and a query cache
//! invalidated on document mutation.

pub mod cache;
pub mod cli;
pub mod config;
pub mod context;
pub mod embedding;
pub mod error;
pub mod index;
pub mod llm;
pub mod pipeline;
pub mod retrieval;
pub mod server;
pub mod types;

pub use error::{Result, SmartChatError};
