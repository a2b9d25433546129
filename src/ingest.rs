//! Feed ingestion: fetch, upsert into the record store, write through to the
//! search index, then fold harvested themes and tags into the feed.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;

use crate::db::Repository;
use crate::error::{AppError, Result};
use crate::index::SearchIndex;
use crate::models::{BlogPost, IndexDocument, NewRssFeed, RssFeed};
use crate::providers::FeedFetcher;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchOutcome {
    pub success: bool,
    pub posts_processed: usize,
    /// Posts whose search index write failed. They remain in the record
    /// store and are picked up by the next reindex.
    pub index_failures: usize,
    pub posts: Vec<BlogPost>,
}

/// One entry of a fetch-all run.
#[derive(Debug, Clone, Serialize)]
pub struct FeedFetchReport {
    pub feed: String,
    #[serde(flatten)]
    pub result: FetchResult,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum FetchResult {
    Fetched(FetchOutcome),
    Failed { error: String },
}

impl FeedFetchReport {
    pub fn is_failure(&self) -> bool {
        matches!(self.result, FetchResult::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteFeedReport {
    pub feed: RssFeed,
    pub posts_deleted: usize,
    pub index_documents_deleted: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReindexReport {
    pub posts: usize,
    pub indexed: usize,
    pub failures: usize,
}

pub struct IngestionPipeline {
    repo: Repository,
    index: Arc<dyn SearchIndex>,
    fetcher: Arc<dyn FeedFetcher>,
}

impl IngestionPipeline {
    pub fn new(repo: Repository, index: Arc<dyn SearchIndex>, fetcher: Arc<dyn FeedFetcher>) -> Self {
        Self {
            repo,
            index,
            fetcher,
        }
    }

    pub async fn add_feed(&self, feed: NewRssFeed) -> Result<RssFeed> {
        let name = feed.name.trim();
        if name.is_empty() {
            return Err(AppError::InvalidInput("feed name must not be empty".into()));
        }
        let url = url::Url::parse(feed.url.trim())
            .map_err(|e| AppError::InvalidInput(format!("invalid feed url '{}': {e}", feed.url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(AppError::InvalidInput(format!(
                "feed url must be http(s), got '{}'",
                url.scheme()
            )));
        }

        let feed = NewRssFeed {
            name: name.to_string(),
            url: feed.url.trim().to_string(),
            ..feed
        };
        let created = self.repo.insert_feed(feed).await?;
        tracing::info!("Added feed {} ({})", created.name, created.url);
        Ok(created)
    }

    pub async fn list_feeds(&self) -> Result<Vec<RssFeed>> {
        self.repo.get_all_feeds().await
    }

    pub async fn feeds_by_theme(&self, theme: &str) -> Result<Vec<RssFeed>> {
        self.repo.get_feeds_by_theme(theme).await
    }

    pub async fn set_feed_active(&self, id: i64, is_active: bool) -> Result<RssFeed> {
        self.repo.set_feed_active(id, is_active).await
    }

    /// Fetch one feed and ingest its posts sequentially. A fetch failure
    /// rejects the whole batch and leaves the feed untouched.
    pub async fn fetch_one(&self, feed_id: i64) -> Result<FetchOutcome> {
        let feed = self.repo.require_feed(feed_id).await?;
        self.ingest(&feed).await
    }

    /// Fetch every active feed in turn. Failures are recorded per feed and
    /// never abort the run.
    pub async fn fetch_all(&self) -> Result<Vec<FeedFetchReport>> {
        let feeds = self.repo.get_active_feeds().await?;
        let mut reports = Vec::with_capacity(feeds.len());

        for feed in feeds {
            let result = match self.ingest(&feed).await {
                Ok(outcome) => FetchResult::Fetched(outcome),
                Err(e) => {
                    tracing::error!("Failed to fetch {} ({}): {}", feed.name, feed.url, e);
                    FetchResult::Failed {
                        error: e.to_string(),
                    }
                }
            };
            reports.push(FeedFetchReport {
                feed: feed.name,
                result,
            });
        }

        let failed = reports.iter().filter(|r| r.is_failure()).count();
        tracing::info!("Fetched {} feeds, {} failed", reports.len(), failed);
        Ok(reports)
    }

    async fn ingest(&self, feed: &RssFeed) -> Result<FetchOutcome> {
        let raw_posts = self.fetcher.fetch(&feed.url, &feed.name).await?;
        tracing::debug!("{} returned {} raw posts", feed.name, raw_posts.len());

        let mut themes = BTreeSet::new();
        let mut tags = BTreeSet::new();
        let mut posts = Vec::with_capacity(raw_posts.len());
        let mut index_failures = 0;

        for raw in raw_posts {
            let Some(new_post) = raw.into_new_post(Some(feed.id), &feed.name) else {
                tracing::debug!("Skipping post without url from {}", feed.name);
                continue;
            };
            let post = self.repo.upsert_post(new_post).await?;

            if let Err(e) = self.index.upsert(post.id, IndexDocument::from(&post)).await {
                tracing::warn!("Failed to index post {} ({}): {}", post.id, post.url, e);
                index_failures += 1;
            }

            themes.extend(post.themes.iter().cloned());
            tags.extend(post.tags.iter().cloned());
            posts.push(post);
        }

        self.repo.record_fetch(feed.id, themes, tags).await?;

        Ok(FetchOutcome {
            success: true,
            posts_processed: posts.len(),
            index_failures,
            posts,
        })
    }

    /// Remove a feed and everything it owns from both stores. Posts go
    /// first; the feed row is only deleted once the index is clean, so a
    /// failed delete can be retried.
    pub async fn delete_feed(&self, feed_id: i64) -> Result<DeleteFeedReport> {
        let feed = self.repo.require_feed(feed_id).await?;

        let post_ids = self.repo.delete_posts_for_feed(&feed).await?;
        let mut index_documents_deleted = 0;
        for id in &post_ids {
            if self.index.delete(*id).await? {
                index_documents_deleted += 1;
            }
        }
        // Documents indexed under the feed name but unknown to the store.
        index_documents_deleted += self.index.delete_by_source(&feed.name).await?;

        if !self.repo.delete_feed(feed.id).await? {
            return Err(AppError::NotFound(format!("RSS feed {feed_id}")));
        }
        tracing::info!(
            "Deleted feed {} with {} posts ({} index documents)",
            feed.name,
            post_ids.len(),
            index_documents_deleted
        );

        Ok(DeleteFeedReport {
            feed,
            posts_deleted: post_ids.len(),
            index_documents_deleted,
        })
    }

    /// Rebuild the search index from the record store.
    pub async fn reindex(&self) -> Result<ReindexReport> {
        self.index.ensure_index().await?;
        let posts = self.repo.get_all_posts().await?;

        let mut report = ReindexReport {
            posts: posts.len(),
            ..Default::default()
        };
        for post in &posts {
            match self.index.upsert(post.id, IndexDocument::from(post)).await {
                Ok(()) => report.indexed += 1,
                Err(e) => {
                    tracing::warn!("Failed to reindex post {}: {}", post.id, e);
                    report.failures += 1;
                }
            }
        }
        tracing::info!("Reindexed {}/{} posts", report.indexed, report.posts);
        Ok(report)
    }
}
