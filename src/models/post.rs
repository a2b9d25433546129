use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::parse_datetime;

/// Dimension of the embedding field (all-MiniLM-L6-v2).
pub const EMBEDDING_DIMS: usize = 384;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlogPost {
    pub id: i64,
    pub feed_id: Option<i64>,
    pub title: String,
    pub description: String,
    pub content: String,
    pub author: String,
    pub url: String,
    pub source: String,
    pub tags: BTreeSet<String>,
    pub themes: BTreeSet<String>,
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing)]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input to the record store upsert. `url` is the dedup key.
#[derive(Debug, Clone, Default)]
pub struct NewBlogPost {
    pub feed_id: Option<i64>,
    pub title: String,
    pub description: String,
    pub content: String,
    pub author: String,
    pub url: String,
    pub source: String,
    pub tags: BTreeSet<String>,
    pub themes: BTreeSet<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub embedding: Option<Vec<f32>>,
}

/// A post as produced by a feed fetcher, before it is bound to a feed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPost {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub themes: Option<Vec<String>>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

impl RawPost {
    /// Bind the raw record to its owning feed. Returns `None` when the post
    /// has no url, since the url is its identity.
    pub fn into_new_post(self, feed_id: Option<i64>, source: &str) -> Option<NewBlogPost> {
        let url = self.url.trim().to_string();
        if url.is_empty() {
            return None;
        }

        let embedding = match self.embedding {
            Some(vector) if vector.len() == EMBEDDING_DIMS => Some(vector),
            Some(vector) => {
                tracing::warn!(
                    "Dropping {}-dim embedding for {} (expected {})",
                    vector.len(),
                    url,
                    EMBEDDING_DIMS
                );
                None
            }
            None => None,
        };

        Some(NewBlogPost {
            feed_id,
            title: self
                .title
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| "Untitled".to_string()),
            description: self.description.unwrap_or_default(),
            content: self.content.unwrap_or_default(),
            author: self.author.unwrap_or_default(),
            url,
            source: source.to_string(),
            tags: split_labels(self.tags.unwrap_or_default()),
            themes: split_labels(self.themes.unwrap_or_default()),
            published_at: self.published_at.as_deref().and_then(parse_datetime),
            embedding,
        })
    }
}

// Fetch scripts join the tags of one theme with commas.
fn split_labels(values: Vec<String>) -> BTreeSet<String> {
    values
        .iter()
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

/// The search index projection of a [`BlogPost`], keyed by post id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDocument {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub author: String,
    pub url: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub themes: Vec<String>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl From<&BlogPost> for IndexDocument {
    fn from(post: &BlogPost) -> Self {
        Self {
            title: post.title.clone(),
            description: post.description.clone(),
            content: post.content.clone(),
            author: post.author.clone(),
            url: post.url.clone(),
            source: post.source.clone(),
            tags: post.tags.iter().cloned().collect(),
            themes: post.themes.iter().cloned().collect(),
            published_at: post.published_at,
            created_at: Some(post.created_at),
            embedding: post.embedding.clone(),
        }
    }
}
