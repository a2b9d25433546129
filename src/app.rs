use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, FetcherKind, IndexBackend, SearchSettings};
use crate::db::Repository;
use crate::error::{AppError, Result};
use crate::feed::HttpFeedFetcher;
use crate::index::{ElasticsearchIndex, MemoryIndex, SearchIndex};
use crate::ingest::IngestionPipeline;
use crate::models::{RssFeed, SearchQuery, Theme, UserRssFeed};
use crate::providers::{
    Embedder, FeedFetcher, Reranker, ScriptEmbedder, ScriptFeedFetcher, ScriptReranker,
};
use crate::search::QueryEngine;

/// The assembled system: one record store and one search index shared by
/// the ingestion and query paths.
pub struct App {
    pub repository: Repository,
    pub index: Arc<dyn SearchIndex>,
    pub ingestion: IngestionPipeline,
    pub search: QueryEngine,
}

impl App {
    pub async fn new(config: &Config) -> Result<Self> {
        let repository = Repository::new(&config.db_path).await?;

        let index: Arc<dyn SearchIndex> = match config.index.backend {
            IndexBackend::Memory => Arc::new(MemoryIndex::new()?),
            IndexBackend::Elasticsearch => Arc::new(ElasticsearchIndex::new(&config.index)?),
        };

        let embedder: Arc<dyn Embedder> =
            Arc::new(ScriptEmbedder::from_config(&config.providers));
        let reranker: Arc<dyn Reranker> =
            Arc::new(ScriptReranker::from_config(&config.providers));

        let fetcher: Arc<dyn FeedFetcher> = match config.fetcher {
            FetcherKind::Native => {
                let fetcher = HttpFeedFetcher::new(
                    repository.clone(),
                    &config.user_agent,
                    Duration::from_secs(config.http_timeout_secs),
                )?;
                if config.providers.embed_on_fetch {
                    Arc::new(fetcher.with_embedder(embedder.clone()))
                } else {
                    Arc::new(fetcher)
                }
            }
            FetcherKind::Script => Arc::new(ScriptFeedFetcher::from_config(&config.providers)),
        };

        let app = Self::from_parts(
            repository,
            index,
            fetcher,
            embedder,
            reranker,
            config.search.clone(),
        );

        // A missing or unreachable index must not prevent serving.
        if let Err(e) = app.index.ensure_index().await {
            tracing::error!("Failed to prepare search index: {}", e);
        }
        if config.index.backend == IndexBackend::Memory {
            app.ingestion.reindex().await?;
        }

        Ok(app)
    }

    pub fn from_parts(
        repository: Repository,
        index: Arc<dyn SearchIndex>,
        fetcher: Arc<dyn FeedFetcher>,
        embedder: Arc<dyn Embedder>,
        reranker: Arc<dyn Reranker>,
        settings: SearchSettings,
    ) -> Self {
        let ingestion = IngestionPipeline::new(repository.clone(), index.clone(), fetcher);
        let search = QueryEngine::new(repository.clone(), index.clone(), embedder, reranker, settings);
        Self {
            repository,
            index,
            ingestion,
            search,
        }
    }

    pub async fn subscribe(&self, user_id: &str, feed_id: i64) -> Result<UserRssFeed> {
        self.repository.subscribe(user_id, feed_id).await
    }

    pub async fn unsubscribe(&self, user_id: &str, feed_id: i64) -> Result<()> {
        self.repository.unsubscribe(user_id, feed_id).await
    }

    pub async fn user_feeds(&self, user_id: &str) -> Result<Vec<UserRssFeed>> {
        self.repository.get_user_feeds(user_id).await
    }

    pub async fn recommend_feeds(&self, user_id: &str, limit: usize) -> Result<Vec<RssFeed>> {
        self.repository.recommend_feeds(user_id, limit).await
    }

    pub async fn search_history(
        &self,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SearchQuery>> {
        self.search.history(user_id, limit).await
    }

    pub async fn add_theme(&self, name: &str, tags: BTreeSet<String>) -> Result<Theme> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::InvalidInput("theme name must not be empty".into()));
        }
        let tags = tags
            .into_iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        self.repository.upsert_theme(name, tags).await
    }

    pub async fn themes(&self) -> Result<Vec<Theme>> {
        self.repository.get_themes().await
    }
}
