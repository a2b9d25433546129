//! Query engine: lexical, vector and semantic-rerank retrieval over the
//! search index, with a best-effort audit trail in the record store.

use std::sync::Arc;

use chrono::Utc;

use crate::config::SearchSettings;
use crate::db::Repository;
use crate::error::Result;
use crate::index::{KnnQuery, LexicalQuery, SearchIndex};
use crate::models::{
    SearchHit, SearchQuery, SearchRequest, SearchResponse, SearchStrategy, SemanticAnalysis,
};
use crate::providers::{Embedder, Reranker};

pub struct QueryEngine {
    repo: Repository,
    index: Arc<dyn SearchIndex>,
    embedder: Arc<dyn Embedder>,
    reranker: Arc<dyn Reranker>,
    settings: SearchSettings,
}

impl QueryEngine {
    pub fn new(
        repo: Repository,
        index: Arc<dyn SearchIndex>,
        embedder: Arc<dyn Embedder>,
        reranker: Arc<dyn Reranker>,
        settings: SearchSettings,
    ) -> Self {
        Self {
            repo,
            index,
            embedder,
            reranker,
            settings,
        }
    }

    pub fn settings(&self) -> &SearchSettings {
        &self.settings
    }

    /// Run one search. Only the vector strategy can fail on a provider
    /// error; index errors yield an empty result set.
    pub async fn search(
        &self,
        request: &SearchRequest,
        strategy: SearchStrategy,
        user_id: Option<&str>,
    ) -> Result<SearchResponse> {
        request.validate(self.settings.max_limit)?;
        let query = request.query.trim();
        let size = request.limit;

        let (results, semantic_analysis) = match strategy {
            SearchStrategy::Lexical => (self.lexical(query, size).await, None),
            SearchStrategy::Vector => (self.vector(query, size).await?, None),
            SearchStrategy::Semantic => self.semantic(query, size).await,
        };

        self.audit(query, user_id, results.len()).await;

        Ok(SearchResponse {
            query: query.to_string(),
            total_results: results.len(),
            results,
            search_type: strategy,
            semantic_analysis,
            timestamp: Utc::now(),
        })
    }

    /// Three-tier text query with the two independent score floors.
    pub async fn lexical(&self, query: &str, size: usize) -> Vec<SearchHit> {
        let request = LexicalQuery {
            text: query.to_string(),
            size: size * self.settings.lexical_overfetch_factor.max(1),
            min_score: self
                .settings
                .index_min_score
                .unwrap_or(self.index.score_floors().index),
        };

        let hits = match self.index.lexical(&request).await {
            Ok(hits) => hits,
            Err(e) => {
                tracing::error!("Lexical search for '{}' failed: {}", query, e);
                return Vec::new();
            }
        };

        let post_min_score = self
            .settings
            .post_min_score
            .unwrap_or(self.index.score_floors().post);
        let fetched = hits.len();
        let mut hits: Vec<SearchHit> = hits
            .into_iter()
            .filter(|hit| hit.score >= post_min_score)
            .collect();
        hits.truncate(size);
        tracing::debug!(
            "Lexical '{}': {} from index, {} after floor",
            query,
            fetched,
            hits.len()
        );
        hits
    }

    /// Embed the query and run kNN. Embedding failures are surfaced.
    pub async fn vector(&self, query: &str, size: usize) -> Result<Vec<SearchHit>> {
        let vector = self.embedder.embed(query).await?;
        let request = KnnQuery {
            vector,
            k: size,
            num_candidates: (size * self.settings.knn_candidate_factor)
                .max(self.settings.knn_min_candidates),
        };

        match self.index.knn(&request).await {
            Ok(hits) => Ok(hits),
            Err(e) => {
                tracing::error!("Vector search for '{}' failed: {}", query, e);
                Ok(Vec::new())
            }
        }
    }

    /// Rerank a broadened lexical pool. Any rerank failure falls back to the
    /// head of that pool.
    pub async fn semantic(
        &self,
        query: &str,
        size: usize,
    ) -> (Vec<SearchHit>, Option<SemanticAnalysis>) {
        let pool = self
            .lexical(query, size * self.settings.semantic_pool_factor.max(1))
            .await;
        if pool.is_empty() {
            return (Vec::new(), None);
        }

        let (mut results, analysis, reachable) = match self.reranker.rerank(query, &pool).await {
            Ok(reranked) => (reranked.results, reranked.analysis, true),
            Err(e) => {
                tracing::warn!("Semantic rerank failed, using lexical candidates: {}", e);
                let reachable = !e.is_provider_unavailable();
                (pool, None, reachable)
            }
        };
        results.truncate(size);
        for hit in &mut results {
            hit.document.embedding = None;
        }

        // A provider that timed out or never started is not asked again
        let analysis = match analysis {
            Some(analysis) => Some(analysis),
            None if reachable => self.analyze(query).await,
            None => None,
        };
        (results, analysis)
    }

    /// Intent/entity/domain metadata for a query, if the provider answers.
    pub async fn analyze(&self, query: &str) -> Option<SemanticAnalysis> {
        match self.reranker.analyze(query).await {
            Ok(analysis) => Some(analysis),
            Err(e) => {
                tracing::warn!("Query analysis failed: {}", e);
                None
            }
        }
    }

    pub async fn history(&self, user_id: Option<&str>, limit: usize) -> Result<Vec<SearchQuery>> {
        self.repo.get_search_history(user_id, limit).await
    }

    async fn audit(&self, query: &str, user_id: Option<&str>, results: usize) {
        if let Err(e) = self.repo.log_search(query, user_id, results).await {
            tracing::warn!("Failed to record search '{}': {}", query, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::TimeZone;

    use super::*;
    use crate::error::AppError;
    use crate::index::MemoryIndex;
    use crate::models::{IndexDocument, EMBEDDING_DIMS};
    use crate::providers::Reranked;

    /// An index whose backend is down.
    struct FailingIndex;

    fn index_down() -> AppError {
        AppError::Index("connection refused".to_string())
    }

    #[async_trait]
    impl SearchIndex for FailingIndex {
        async fn ensure_index(&self) -> Result<()> {
            Err(index_down())
        }

        async fn upsert(&self, _id: i64, _document: IndexDocument) -> Result<()> {
            Err(index_down())
        }

        async fn delete(&self, _id: i64) -> Result<bool> {
            Err(index_down())
        }

        async fn delete_by_source(&self, _source: &str) -> Result<usize> {
            Err(index_down())
        }

        async fn lexical(&self, _query: &LexicalQuery) -> Result<Vec<SearchHit>> {
            Err(index_down())
        }

        async fn knn(&self, _query: &KnnQuery) -> Result<Vec<SearchHit>> {
            Err(index_down())
        }

        async fn count(&self) -> Result<usize> {
            Err(index_down())
        }
    }

    struct FixedEmbedder(Vec<f32>);

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(self.0.clone())
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Err(AppError::provider("embedder", "timed out after 60s"))
        }
    }

    struct FailingReranker;

    #[async_trait]
    impl Reranker for FailingReranker {
        async fn rerank(&self, _query: &str, _candidates: &[SearchHit]) -> Result<Reranked> {
            Err(AppError::provider("reranker", "malformed payload"))
        }

        async fn analyze(&self, _query: &str) -> Result<SemanticAnalysis> {
            Err(AppError::provider("reranker", "malformed payload"))
        }
    }

    /// Fails every rerank and counts analysis-only calls.
    struct CountingReranker {
        unavailable: bool,
        analyze_calls: AtomicUsize,
    }

    impl CountingReranker {
        fn new(unavailable: bool) -> Arc<Self> {
            Arc::new(Self {
                unavailable,
                analyze_calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Reranker for CountingReranker {
        async fn rerank(&self, _query: &str, _candidates: &[SearchHit]) -> Result<Reranked> {
            if self.unavailable {
                Err(AppError::provider_unavailable("reranker", "timed out after 120s"))
            } else {
                Err(AppError::provider("reranker", "malformed payload"))
            }
        }

        async fn analyze(&self, _query: &str) -> Result<SemanticAnalysis> {
            self.analyze_calls.fetch_add(1, Ordering::SeqCst);
            Ok(SemanticAnalysis::default())
        }
    }

    /// Reverses the pool and reports a fixed analysis.
    struct ReversingReranker;

    #[async_trait]
    impl Reranker for ReversingReranker {
        async fn rerank(&self, _query: &str, candidates: &[SearchHit]) -> Result<Reranked> {
            let mut results = candidates.to_vec();
            results.reverse();
            Ok(Reranked {
                results,
                analysis: Some(SemanticAnalysis {
                    expanded_terms: vec!["runtime".to_string()],
                    ..Default::default()
                }),
            })
        }

        async fn analyze(&self, _query: &str) -> Result<SemanticAnalysis> {
            Ok(SemanticAnalysis::default())
        }
    }

    fn doc(title: &str, day: u32, embedding: Option<Vec<f32>>) -> IndexDocument {
        IndexDocument {
            title: title.to_string(),
            description: "engineering notes".to_string(),
            content: String::new(),
            author: String::new(),
            url: format!("https://example.com/{}", title.replace(' ', "-")),
            source: "Blog".to_string(),
            tags: Vec::new(),
            themes: Vec::new(),
            published_at: Some(Utc.with_ymd_and_hms(2025, 3, day, 0, 0, 0).unwrap()),
            created_at: None,
            embedding,
        }
    }

    fn unit_vector(hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; EMBEDDING_DIMS];
        v[hot] = 1.0;
        v
    }

    fn permissive() -> SearchSettings {
        SearchSettings {
            index_min_score: Some(0.0),
            post_min_score: Some(0.0),
            ..Default::default()
        }
    }

    async fn engine(
        embedder: Arc<dyn Embedder>,
        reranker: Arc<dyn Reranker>,
        settings: SearchSettings,
    ) -> (QueryEngine, Repository, Arc<MemoryIndex>) {
        let repo = Repository::in_memory().await.unwrap();
        let index = Arc::new(MemoryIndex::new().unwrap());
        let engine = QueryEngine::new(repo.clone(), index.clone(), embedder, reranker, settings);
        (engine, repo, index)
    }

    async fn seed_runtime_posts(index: &MemoryIndex) {
        let titles = [
            "Inside the Tokio runtime",
            "Tokio runtime internals",
            "Tuning the Tokio runtime",
            "Tokio tasks explained",
            "Runtime metrics for services",
            "A runtime for actors",
            "Baking sourdough bread",
            "Gardening in spring",
        ];
        for (i, title) in titles.iter().enumerate() {
            index
                .upsert(i as i64 + 1, doc(title, i as u32 + 1, None))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn lexical_ranks_phrase_match_first_and_drops_unrelated() {
        let (engine, _, index) = engine(
            Arc::new(FailingEmbedder),
            Arc::new(FailingReranker),
            SearchSettings::default(),
        )
        .await;
        index.upsert(1, doc("Tokyo runtimes compared", 1, None)).await.unwrap();
        index.upsert(2, doc("Inside the Tokio runtime", 2, None)).await.unwrap();
        index.upsert(3, doc("Baking sourdough bread", 3, None)).await.unwrap();

        let response = engine
            .search(&SearchRequest::new("tokio runtime", 10), SearchStrategy::Lexical, None)
            .await
            .unwrap();

        assert_eq!(response.search_type, SearchStrategy::Lexical);
        assert!(!response.results.is_empty());
        assert_eq!(response.results[0].id, 2);
        assert!(response.results.iter().all(|h| h.id != 3));
        assert_eq!(response.total_results, response.results.len());
    }

    #[tokio::test]
    async fn post_floor_applies_after_index_floor() {
        let strict = SearchSettings {
            index_min_score: Some(0.0),
            post_min_score: Some(1_000.0),
            ..Default::default()
        };
        let (engine, _, index) =
            engine(Arc::new(FailingEmbedder), Arc::new(FailingReranker), strict).await;
        seed_runtime_posts(&index).await;

        assert!(engine.lexical("tokio runtime", 10).await.is_empty());
    }

    #[tokio::test]
    async fn lexical_truncates_to_requested_size() {
        let (engine, _, index) =
            engine(Arc::new(FailingEmbedder), Arc::new(FailingReranker), permissive()).await;
        seed_runtime_posts(&index).await;

        let hits = engine.lexical("tokio runtime", 2).await;
        assert_eq!(hits.len(), 2);
        assert!(hits[0].score >= hits[1].score);
    }

    #[tokio::test]
    async fn vector_ranks_similar_embedding_first() {
        let (engine, _, index) = engine(
            Arc::new(FixedEmbedder(unit_vector(0))),
            Arc::new(FailingReranker),
            SearchSettings::default(),
        )
        .await;
        let mut close = unit_vector(0);
        close[1] = 0.2;
        index.upsert(1, doc("Far away", 1, Some(unit_vector(5)))).await.unwrap();
        index.upsert(2, doc("Close by", 2, Some(close))).await.unwrap();

        let response = engine
            .search(&SearchRequest::new("anything", 5), SearchStrategy::Vector, None)
            .await
            .unwrap();
        let ids: Vec<i64> = response.results.iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![2, 1]);
        assert!(response.results[0].document.embedding.is_none());
    }

    #[tokio::test]
    async fn vector_surfaces_embedder_failure() {
        let (engine, repo, _) = engine(
            Arc::new(FailingEmbedder),
            Arc::new(FailingReranker),
            SearchSettings::default(),
        )
        .await;

        let err = engine
            .search(&SearchRequest::new("anything", 5), SearchStrategy::Vector, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Provider { provider: "embedder", .. }));
        assert!(repo.get_search_history(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn semantic_falls_back_to_broadened_lexical_pool() {
        let (engine, _, index) =
            engine(Arc::new(FailingEmbedder), Arc::new(FailingReranker), permissive()).await;
        seed_runtime_posts(&index).await;

        let size = 2;
        let response = engine
            .search(&SearchRequest::new("tokio runtime", size), SearchStrategy::Semantic, None)
            .await
            .unwrap();

        let mut pool = engine.lexical("tokio runtime", size * 3).await;
        assert!(pool.len() > size);
        pool.truncate(size);
        assert_eq!(response.results, pool);
        assert!(response.semantic_analysis.is_none());
    }

    #[tokio::test]
    async fn semantic_returns_reranked_subset_with_analysis() {
        let (engine, _, index) =
            engine(Arc::new(FailingEmbedder), Arc::new(ReversingReranker), permissive()).await;
        seed_runtime_posts(&index).await;

        let pool = engine.lexical("tokio runtime", 6).await;
        let response = engine
            .search(&SearchRequest::new("tokio runtime", 2), SearchStrategy::Semantic, None)
            .await
            .unwrap();

        let expected: Vec<i64> = pool.iter().rev().take(2).map(|h| h.id).collect();
        let ids: Vec<i64> = response.results.iter().map(|h| h.id).collect();
        assert_eq!(ids, expected);
        assert_eq!(
            response.semantic_analysis.unwrap().expanded_terms,
            vec!["runtime".to_string()]
        );
    }

    #[tokio::test]
    async fn semantic_with_empty_pool_skips_provider() {
        let (engine, _, index) = engine(
            Arc::new(FailingEmbedder),
            Arc::new(ReversingReranker),
            SearchSettings::default(),
        )
        .await;
        seed_runtime_posts(&index).await;

        let response = engine
            .search(&SearchRequest::new("kubernetes", 5), SearchStrategy::Semantic, None)
            .await
            .unwrap();
        assert!(response.results.is_empty());
        assert!(response.semantic_analysis.is_none());
    }

    #[tokio::test]
    async fn each_search_is_audited_once() {
        let (engine, repo, index) =
            engine(Arc::new(FailingEmbedder), Arc::new(FailingReranker), permissive()).await;
        seed_runtime_posts(&index).await;

        let response = engine
            .search(&SearchRequest::new("tokio runtime", 3), SearchStrategy::Lexical, Some("u1"))
            .await
            .unwrap();
        engine
            .search(&SearchRequest::new("bread", 3), SearchStrategy::Lexical, None)
            .await
            .unwrap();

        let mine = engine.history(Some("u1"), 10).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].query, "tokio runtime");
        assert_eq!(mine[0].results, response.total_results as i64);
        assert_eq!(repo.get_search_history(None, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn single_post_is_found_with_default_settings() {
        let (engine, _, index) = engine(
            Arc::new(FailingEmbedder),
            Arc::new(FailingReranker),
            SearchSettings::default(),
        )
        .await;
        index.upsert(1, doc("Scaling Kafka consumers", 1, None)).await.unwrap();

        for query in ["Kafka", "Scaling Kafka consumers"] {
            let hits = engine.lexical(query, 10).await;
            assert_eq!(hits.iter().map(|h| h.id).collect::<Vec<_>>(), vec![1], "{query}");
        }
    }

    #[tokio::test]
    async fn configured_floors_override_backend_defaults() {
        let strict = SearchSettings {
            index_min_score: Some(1_000.0),
            ..Default::default()
        };
        let (engine, _, index) =
            engine(Arc::new(FailingEmbedder), Arc::new(FailingReranker), strict).await;
        index.upsert(1, doc("Scaling Kafka consumers", 1, None)).await.unwrap();

        assert!(engine.lexical("Scaling Kafka consumers", 10).await.is_empty());
    }

    #[tokio::test]
    async fn index_errors_yield_empty_results() {
        let repo = Repository::in_memory().await.unwrap();
        let engine = QueryEngine::new(
            repo.clone(),
            Arc::new(FailingIndex),
            Arc::new(FixedEmbedder(unit_vector(0))),
            Arc::new(ReversingReranker),
            SearchSettings::default(),
        );

        for strategy in [
            SearchStrategy::Lexical,
            SearchStrategy::Vector,
            SearchStrategy::Semantic,
        ] {
            let response = engine
                .search(&SearchRequest::new("tokio runtime", 5), strategy, None)
                .await
                .unwrap();
            assert!(response.results.is_empty(), "{strategy:?}");
            assert!(response.semantic_analysis.is_none());
        }
        assert_eq!(repo.get_search_history(None, 10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn audit_failure_does_not_reach_the_caller() {
        let (engine, repo, index) =
            engine(Arc::new(FailingEmbedder), Arc::new(FailingReranker), permissive()).await;
        seed_runtime_posts(&index).await;
        repo.drop_search_log().await.unwrap();

        let response = engine
            .search(&SearchRequest::new("tokio runtime", 3), SearchStrategy::Lexical, Some("u1"))
            .await
            .unwrap();
        assert_eq!(response.total_results, 3);
        assert!(engine.history(None, 10).await.is_err());
    }

    #[tokio::test]
    async fn unreachable_reranker_is_not_asked_for_analysis() {
        let reranker = CountingReranker::new(true);
        let (engine, _, index) =
            engine(Arc::new(FailingEmbedder), reranker.clone(), permissive()).await;
        seed_runtime_posts(&index).await;

        let (results, analysis) = engine.semantic("tokio runtime", 2).await;
        assert_eq!(results.len(), 2);
        assert!(analysis.is_none());
        assert_eq!(reranker.analyze_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejected_rerank_still_asks_for_analysis() {
        let reranker = CountingReranker::new(false);
        let (engine, _, index) =
            engine(Arc::new(FailingEmbedder), reranker.clone(), permissive()).await;
        seed_runtime_posts(&index).await;

        let (_, analysis) = engine.semantic("tokio runtime", 2).await;
        assert!(analysis.is_some());
        assert_eq!(reranker.analyze_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected() {
        let (engine, _, _) = engine(
            Arc::new(FailingEmbedder),
            Arc::new(FailingReranker),
            SearchSettings::default(),
        )
        .await;

        for request in [SearchRequest::new("", 5), SearchRequest::new("rust", 101)] {
            let err = engine
                .search(&request, SearchStrategy::Lexical, None)
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::InvalidInput(_)));
        }
    }
}
