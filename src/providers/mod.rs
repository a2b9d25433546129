//! Capability interfaces for the external collaborators: embedding, semantic
//! rerank/analysis, and feed fetching.
//!
//! Each call is one request/response round-trip that either yields a parsed
//! payload or an [`AppError::Provider`](crate::error::AppError::Provider).
//! Implementations must bound every call with a timeout. Tests substitute
//! deterministic stubs for all three traits.

mod process;
mod script;

pub use process::ScriptRunner;
pub use script::{ScriptEmbedder, ScriptFeedFetcher, ScriptReranker};

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{RawPost, SearchHit, SemanticAnalysis};

/// Turns text into a fixed-length vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Output of a semantic rerank: the reordered (possibly trimmed) candidates
/// and the query analysis the provider used.
#[derive(Debug, Clone, Default)]
pub struct Reranked {
    pub results: Vec<SearchHit>,
    pub analysis: Option<SemanticAnalysis>,
}

#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, candidates: &[SearchHit]) -> Result<Reranked>;

    /// Intent/entity/domain metadata for a query, without reranking.
    async fn analyze(&self, query: &str) -> Result<SemanticAnalysis>;
}

/// Fetches and parses one feed into raw posts.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(&self, url: &str, source: &str) -> Result<Vec<RawPost>>;
}
