//! Secondary search index over blog posts.
//!
//! The index is a derived, rebuildable copy of the record store keyed by post
//! id. Two backends implement [`SearchIndex`]: an Elasticsearch client for
//! deployments and an in-process [`MemoryIndex`] used for embedded runs and
//! tests.

mod elasticsearch;
mod memory;

pub use elasticsearch::ElasticsearchIndex;
pub use memory::MemoryIndex;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{IndexDocument, SearchHit};

/// Fields searched by the lexical tiers, with per-tier boosts.
pub(crate) const PHRASE_FIELDS: [(&str, f32); 4] =
    [("title", 3.0), ("description", 2.0), ("content", 1.0), ("tags", 2.0)];
pub(crate) const BEST_FIELDS: [(&str, f32); 4] =
    [("title", 2.0), ("description", 1.5), ("content", 1.0), ("tags", 1.0)];
pub(crate) const MOST_FIELDS: [(&str, f32); 4] =
    [("title", 1.5), ("description", 1.0), ("content", 1.0), ("tags", 1.0)];

/// Tier weights: exact phrase > fuzzy term match > partial match.
pub(crate) const PHRASE_BOOST: f32 = 3.0;
pub(crate) const FUZZY_BOOST: f32 = 1.0;
pub(crate) const PARTIAL_BOOST: f32 = 0.5;

/// A three-tier lexical query as executed by the index.
#[derive(Debug, Clone)]
pub struct LexicalQuery {
    pub text: String,
    pub size: usize,
    /// Index-side floor; hits scoring below it are never returned.
    pub min_score: f32,
}

/// Default score floors on a backend's own scoring scale. Configured
/// floors in [`SearchSettings`](crate::config::SearchSettings) override them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreFloors {
    /// Applied by the index to the raw query score.
    pub index: f32,
    /// Applied by the query engine to the returned hits.
    pub post: f32,
}

impl ScoreFloors {
    /// Elasticsearch BM25 scale with the three tiers and field boosts.
    pub const ELASTICSEARCH: Self = Self {
        index: 13.0,
        post: 3.0,
    };
}

/// A k-nearest-neighbour query against the embedding field.
#[derive(Debug, Clone)]
pub struct KnnQuery {
    pub vector: Vec<f32>,
    pub k: usize,
    pub num_candidates: usize,
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Create the index with its mapping unless it already exists.
    async fn ensure_index(&self) -> Result<()>;

    async fn upsert(&self, id: i64, document: IndexDocument) -> Result<()>;

    /// Remove one document. Returns whether it existed.
    async fn delete(&self, id: i64) -> Result<bool>;

    /// Remove every document whose `source` equals `source`.
    async fn delete_by_source(&self, source: &str) -> Result<usize>;

    /// Hits ordered by score desc, then publication date desc.
    async fn lexical(&self, query: &LexicalQuery) -> Result<Vec<SearchHit>>;

    /// Hits ordered by similarity desc, then publication date desc.
    async fn knn(&self, query: &KnnQuery) -> Result<Vec<SearchHit>>;

    async fn count(&self) -> Result<usize>;

    fn score_floors(&self) -> ScoreFloors {
        ScoreFloors::ELASTICSEARCH
    }
}

/// Score desc, then newest first; undated posts sort last.
pub(crate) fn rank_order(a: &SearchHit, b: &SearchHit) -> std::cmp::Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then_with(|| b.document.published_at.cmp(&a.document.published_at))
}
