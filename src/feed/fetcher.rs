use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use feed_rs::model::Entry;
use feed_rs::parser;
use regex::Regex;
use reqwest::Client;

use crate::db::Repository;
use crate::error::{AppError, Result};
use crate::models::{RawPost, Theme};
use crate::providers::{Embedder, FeedFetcher};

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern is valid"));

/// Downloads and parses RSS/Atom feeds in-process. Posts are classified
/// against the theme vocabulary in the record store and optionally embedded.
pub struct HttpFeedFetcher {
    client: Client,
    repo: Repository,
    embedder: Option<Arc<dyn Embedder>>,
}

impl HttpFeedFetcher {
    pub fn new(repo: Repository, user_agent: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent(user_agent)
            .build()?;

        Ok(Self {
            client,
            repo,
            embedder: None,
        })
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    async fn embed_post(&self, post: &RawPost) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        let text = [&post.title, &post.description, &post.content]
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join("\n");
        if text.is_empty() {
            return None;
        }

        match embedder.embed(&text).await {
            Ok(vector) => Some(vector),
            Err(e) => {
                tracing::warn!("Embedding failed for {}: {}", post.url, e);
                None
            }
        }
    }
}

#[async_trait]
impl FeedFetcher for HttpFeedFetcher {
    async fn fetch(&self, url: &str, source: &str) -> Result<Vec<RawPost>> {
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(AppError::provider(
                "fetcher",
                format!("failed to fetch {url}: HTTP {}", response.status()),
            ));
        }

        let bytes = response.bytes().await?;
        let themes = self.repo.get_themes().await?;
        let mut posts = parse_feed(&bytes, &themes)?;

        if self.embedder.is_some() {
            for post in &mut posts {
                post.embedding = self.embed_post(post).await;
            }
        }

        tracing::debug!("Parsed {} posts from {} ({})", posts.len(), source, url);
        Ok(posts)
    }
}

/// Parse a feed document into raw posts, classifying each against `themes`.
pub fn parse_feed(bytes: &[u8], themes: &[Theme]) -> Result<Vec<RawPost>> {
    let feed = parser::parse(bytes)?;
    Ok(feed
        .entries
        .into_iter()
        .map(|entry| entry_to_post(entry, themes))
        .collect())
}

fn entry_to_post(entry: Entry, themes: &[Theme]) -> RawPost {
    let title = entry
        .title
        .as_ref()
        .map(|t| clean_text(&t.content))
        .unwrap_or_default();
    let description = entry
        .summary
        .as_ref()
        .map(|s| clean_text(&s.content))
        .unwrap_or_default();

    // Full content first, then the summary.
    let content = entry
        .content
        .as_ref()
        .and_then(|c| c.body.as_deref())
        .map(clean_text)
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| description.clone());

    let (matched_themes, matched_tags) = classify(&title, &description, themes);

    RawPost {
        url: entry
            .links
            .first()
            .map(|l| l.href.clone())
            .unwrap_or_default(),
        author: entry.authors.first().map(|a| a.name.clone()),
        published_at: entry.published.or(entry.updated).map(|d| d.to_rfc3339()),
        title: Some(title),
        description: Some(description),
        content: Some(content),
        themes: Some(matched_themes),
        tags: Some(matched_tags),
        embedding: None,
    }
}

/// HTML to plain text on a single line.
fn clean_text(html: &str) -> String {
    let text = html2text::from_read(html.as_bytes(), 10_000).unwrap_or_else(|_| html.to_string());
    WHITESPACE.replace_all(&text, " ").trim().to_string()
}

/// A theme matches when any of its tags occurs in the lowercased title and
/// description. Returns the matched theme names and the matching tags.
fn classify(title: &str, description: &str, themes: &[Theme]) -> (Vec<String>, Vec<String>) {
    let haystack = format!("{title} {description}").to_lowercase();
    let mut matched_themes = Vec::new();
    let mut matched_tags = Vec::new();

    for theme in themes {
        let hits: Vec<&String> = theme
            .tags
            .iter()
            .filter(|tag| !tag.is_empty() && haystack.contains(&tag.to_lowercase()))
            .collect();
        if !hits.is_empty() {
            matched_themes.push(theme.name.clone());
            matched_tags.extend(hits.into_iter().cloned());
        }
    }
    (matched_themes, matched_tags)
}
