use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use rss_search::config::SearchSettings;
use rss_search::db::Repository;
use rss_search::index::{MemoryIndex, SearchIndex};
use rss_search::models::{
    NewRssFeed, RawPost, SearchHit, SearchRequest, SearchStrategy, SemanticAnalysis,
    EMBEDDING_DIMS,
};
use rss_search::providers::{Embedder, FeedFetcher, Reranked, Reranker};
use rss_search::{App, AppError, Result};

#[derive(Default)]
struct CannedFetcher {
    feeds: HashMap<String, Vec<RawPost>>,
}

#[async_trait]
impl FeedFetcher for CannedFetcher {
    async fn fetch(&self, url: &str, _source: &str) -> Result<Vec<RawPost>> {
        self.feeds
            .get(url)
            .cloned()
            .ok_or_else(|| AppError::provider("fetcher", "malformed payload"))
    }
}

/// Maps the first word of the text to a fixed axis.
struct KeywordEmbedder;

#[async_trait]
impl Embedder for KeywordEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(axis(if text.to_lowercase().contains("database") { 0 } else { 1 }))
    }
}

struct DownReranker;

#[async_trait]
impl Reranker for DownReranker {
    async fn rerank(&self, _query: &str, _candidates: &[SearchHit]) -> Result<Reranked> {
        Err(AppError::provider_unavailable("reranker", "timed out after 120s"))
    }

    async fn analyze(&self, _query: &str) -> Result<SemanticAnalysis> {
        Err(AppError::provider_unavailable("reranker", "timed out after 120s"))
    }
}

fn axis(hot: usize) -> Vec<f32> {
    let mut v = vec![0.0; EMBEDDING_DIMS];
    v[hot] = 1.0;
    v
}

fn post(url: &str, title: &str, description: &str, embedding: Option<Vec<f32>>) -> RawPost {
    RawPost {
        title: Some(title.to_string()),
        description: Some(description.to_string()),
        content: Some(description.to_string()),
        author: Some("staff".to_string()),
        url: url.to_string(),
        published_at: Some("2025-05-01T09:00:00".to_string()),
        embedding,
        ..Default::default()
    }
}

fn engineering_posts() -> Vec<RawPost> {
    vec![
        post(
            "https://eng.example/payments",
            "Designing resilient payment pipelines",
            "Idempotency keys and retries",
            None,
        ),
        post(
            "https://eng.example/db",
            "Sharding our database",
            "Moving tables between clusters",
            Some(axis(0)),
        ),
        post(
            "https://eng.example/css",
            "A new design system",
            "Tokens and components",
            Some(axis(1)),
        ),
        post(
            "https://eng.example/oncall",
            "Making on-call humane",
            "Rotations and alert budgets",
            None,
        ),
        post(
            "https://eng.example/ml",
            "Feature stores in practice",
            "Offline and online parity",
            None,
        ),
    ]
}

struct Harness {
    app: App,
    repo: Repository,
    index: Arc<MemoryIndex>,
    _dir: TempDir,
}

async fn harness(feeds: Vec<(&str, Vec<RawPost>)>) -> Harness {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("posts.db");
    let repo = Repository::new(db_path.to_str().unwrap()).await.unwrap();
    let index = Arc::new(MemoryIndex::new().unwrap());
    let fetcher = CannedFetcher {
        feeds: feeds
            .into_iter()
            .map(|(url, posts)| (url.to_string(), posts))
            .collect(),
    };

    let app = App::from_parts(
        repo.clone(),
        index.clone(),
        Arc::new(fetcher),
        Arc::new(KeywordEmbedder),
        Arc::new(DownReranker),
        SearchSettings::default(),
    );
    Harness {
        app,
        repo,
        index,
        _dir: dir,
    }
}

#[tokio::test]
async fn ingested_post_is_found_by_its_title() {
    let h = harness(vec![("https://eng.example/rss", engineering_posts())]).await;
    let feed = h
        .app
        .ingestion
        .add_feed(NewRssFeed::new("Eng", "https://eng.example/rss"))
        .await
        .unwrap();
    h.app.ingestion.fetch_one(feed.id).await.unwrap();

    let response = h
        .app
        .search
        .search(
            &SearchRequest::new("Designing resilient payment pipelines", 10),
            SearchStrategy::Lexical,
            None,
        )
        .await
        .unwrap();

    assert!(!response.results.is_empty());
    assert_eq!(response.results[0].document.url, "https://eng.example/payments");
    assert_eq!(response.results[0].document.source, "Eng");

    let json = serde_json::to_value(&response).unwrap();
    assert_eq!(json["searchType"], "lexical");
    assert_eq!(json["totalResults"], response.results.len());
    assert!(json.get("semantic_analysis").is_none());
}

#[tokio::test]
async fn lone_post_is_found_by_its_title() {
    let h = harness(vec![(
        "https://solo.example/rss",
        vec![post(
            "https://solo.example/kafka",
            "Scaling Kafka consumers",
            "Partition assignment",
            None,
        )],
    )])
    .await;
    let feed = h
        .app
        .ingestion
        .add_feed(NewRssFeed::new("Solo", "https://solo.example/rss"))
        .await
        .unwrap();
    h.app.ingestion.fetch_one(feed.id).await.unwrap();

    for query in ["Kafka", "Scaling Kafka consumers"] {
        let response = h
            .app
            .search
            .search(&SearchRequest::new(query, 10), SearchStrategy::Lexical, None)
            .await
            .unwrap();
        assert_eq!(response.total_results, 1, "{query}");
        assert_eq!(response.results[0].document.url, "https://solo.example/kafka");
    }
}

#[tokio::test]
async fn vector_search_uses_carried_embeddings() {
    let h = harness(vec![("https://eng.example/rss", engineering_posts())]).await;
    let feed = h
        .app
        .ingestion
        .add_feed(NewRssFeed::new("Eng", "https://eng.example/rss"))
        .await
        .unwrap();
    h.app.ingestion.fetch_one(feed.id).await.unwrap();

    let response = h
        .app
        .search
        .search(
            &SearchRequest::new("database scaling", 2),
            SearchStrategy::Vector,
            None,
        )
        .await
        .unwrap();

    let urls: Vec<&str> = response
        .results
        .iter()
        .map(|h| h.document.url.as_str())
        .collect();
    assert_eq!(urls, vec!["https://eng.example/db", "https://eng.example/css"]);
}

#[tokio::test]
async fn semantic_search_survives_provider_outage() {
    let h = harness(vec![("https://eng.example/rss", engineering_posts())]).await;
    let feed = h
        .app
        .ingestion
        .add_feed(NewRssFeed::new("Eng", "https://eng.example/rss"))
        .await
        .unwrap();
    h.app.ingestion.fetch_one(feed.id).await.unwrap();

    let query = "resilient payment pipelines";
    let response = h
        .app
        .search
        .search(&SearchRequest::new(query, 1), SearchStrategy::Semantic, Some("dana"))
        .await
        .unwrap();

    let mut expected = h.app.search.lexical(query, 3).await;
    expected.truncate(1);
    assert_eq!(response.results, expected);
    assert_eq!(response.search_type, SearchStrategy::Semantic);
    assert!(response.semantic_analysis.is_none());

    let history = h.app.search_history(Some("dana"), 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].results, 1);
}

#[tokio::test]
async fn fetch_all_reports_each_feed() {
    let h = harness(vec![
        ("https://eng.example/rss", engineering_posts()),
        (
            "https://ops.example/rss",
            vec![post("https://ops.example/1", "Postmortem culture", "Blameless reviews", None)],
        ),
    ])
    .await;
    for (name, url) in [
        ("Eng", "https://eng.example/rss"),
        ("Broken", "https://broken.example/rss"),
        ("Ops", "https://ops.example/rss"),
    ] {
        h.app
            .ingestion
            .add_feed(NewRssFeed::new(name, url))
            .await
            .unwrap();
    }

    let reports = h.app.ingestion.fetch_all().await.unwrap();
    assert_eq!(reports.len(), 3);
    for report in &reports {
        assert_eq!(report.is_failure(), report.feed == "Broken", "{}", report.feed);
    }

    let broken = h
        .repo
        .get_all_feeds()
        .await
        .unwrap()
        .into_iter()
        .find(|f| f.name == "Broken")
        .unwrap();
    assert!(broken.last_fetch.is_none());
    assert!(h.repo.get_posts_for_feed(&broken).await.unwrap().is_empty());
    assert_eq!(h.repo.count_posts().await.unwrap(), 6);
    assert_eq!(h.index.count().await.unwrap(), 6);
}

#[tokio::test]
async fn deleting_a_feed_clears_both_stores() {
    let h = harness(vec![
        ("https://eng.example/rss", engineering_posts()),
        (
            "https://ops.example/rss",
            vec![post("https://ops.example/1", "Postmortem culture", "Blameless reviews", None)],
        ),
    ])
    .await;
    let eng = h
        .app
        .ingestion
        .add_feed(NewRssFeed::new("Eng", "https://eng.example/rss"))
        .await
        .unwrap();
    let ops = h
        .app
        .ingestion
        .add_feed(NewRssFeed::new("Ops", "https://ops.example/rss"))
        .await
        .unwrap();
    h.app.ingestion.fetch_all().await.unwrap();

    let report = h.app.ingestion.delete_feed(eng.id).await.unwrap();
    assert_eq!(report.posts_deleted, 5);
    assert_eq!(h.index.count().await.unwrap(), 1);
    assert_eq!(h.repo.count_posts().await.unwrap(), 1);
    assert!(h.repo.get_feed(ops.id).await.unwrap().is_some());

    let response = h
        .app
        .search
        .search(
            &SearchRequest::new("Designing resilient payment pipelines", 10),
            SearchStrategy::Lexical,
            None,
        )
        .await
        .unwrap();
    assert!(response.results.is_empty());

    let err = h.app.ingestion.delete_feed(eng.id).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn subscriptions_drive_recommendations() {
    let h = harness(vec![]).await;
    let themed = |name: &str, url: &str, themes: &[&str]| NewRssFeed {
        themes: themes.iter().map(|t| t.to_string()).collect(),
        ..NewRssFeed::new(name, url)
    };
    let a = h
        .app
        .ingestion
        .add_feed(themed("A", "https://a.example/rss", &["backend", "data"]))
        .await
        .unwrap();
    let b = h
        .app
        .ingestion
        .add_feed(themed("B", "https://b.example/rss", &["data"]))
        .await
        .unwrap();
    h.app
        .ingestion
        .add_feed(themed("C", "https://c.example/rss", &["design"]))
        .await
        .unwrap();

    h.app.subscribe("dana", a.id).await.unwrap();
    assert!(h.app.subscribe("dana", a.id).await.unwrap_err().is_conflict());

    let recommended = h.app.recommend_feeds("dana", 10).await.unwrap();
    assert_eq!(recommended.iter().map(|f| f.id).collect::<Vec<_>>(), vec![b.id]);

    h.app.unsubscribe("dana", a.id).await.unwrap();
    assert!(h.app.user_feeds("dana").await.unwrap().is_empty());
    let again = h.app.subscribe("dana", a.id).await.unwrap();
    assert!(again.is_active);
}
