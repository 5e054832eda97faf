//! Query embedding
//!
//! The embedding model is an external collaborator. This module defines the
//! seam the retriever embeds queries through, plus a local FastEmbed adapter:
//! - EmbeddingProvider trait for abstraction
//! - FastEmbedProvider for local embedding (all-MiniLM-L6-v2, 384-dim)

mod provider;

pub use provider::{EmbeddingError, EmbeddingProvider, FastEmbedProvider};
