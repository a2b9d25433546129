mod feed;
mod post;
mod search;

pub use feed::{NewRssFeed, RssFeed, Theme, UserRssFeed};
pub use post::{BlogPost, IndexDocument, NewBlogPost, RawPost, EMBEDDING_DIMS};
pub use search::{
    DomainMatch, Entities, Intent, SearchHit, SearchQuery, SearchRequest, SearchResponse,
    SearchStrategy, SemanticAnalysis,
};

use chrono::{DateTime, NaiveDateTime, Utc};

/// Parse the timestamp shapes we see from SQLite, feeds and provider payloads.
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    // Try RFC3339 first (e.g., "2026-01-11T12:34:56+00:00")
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // Naive ISO 8601 as emitted by Python's isoformat() (e.g., "2026-01-11T12:34:56")
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    // SQLite datetime format (e.g., "2026-01-11 12:34:56")
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    None
}
