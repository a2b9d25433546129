use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RssFeed {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub themes: BTreeSet<String>,
    pub tags: BTreeSet<String>,
    pub is_active: bool,
    pub last_fetch: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewRssFeed {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub themes: BTreeSet<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl NewRssFeed {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            ..Default::default()
        }
    }
}

/// A user's subscription to a feed. Unsubscribing clears `is_active`
/// instead of deleting the row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRssFeed {
    pub id: i64,
    pub user_id: String,
    pub rss_feed_id: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub rss_feed: RssFeed,
}

/// A named tag vocabulary used to classify incoming posts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Theme {
    pub id: i64,
    pub name: String,
    pub tags: BTreeSet<String>,
}
