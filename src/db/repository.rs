use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tokio_rusqlite::Connection;

use crate::error::{AppError, Result};
use crate::models::{
    parse_datetime, BlogPost, NewBlogPost, NewRssFeed, RssFeed, SearchQuery, Theme, UserRssFeed,
};

use super::schema::SCHEMA;

const FEED_COLUMNS: &str = "id, name, url, themes, tags, is_active, last_fetch, created_at";

const POST_COLUMNS: &str = "id, feed_id, title, description, content, author, url, source, \
                            tags, themes, published_at, embedding, created_at, updated_at";

/// Authoritative record store for feeds, posts, subscriptions, themes and
/// the search audit log.
#[derive(Clone)]
pub struct Repository {
    conn: Connection,
}

enum Subscribe {
    Created(i64),
    Reactivated(i64),
    AlreadyActive,
    UnknownFeed,
}

impl Repository {
    pub async fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).await?;
        Self::init(conn).await
    }

    pub async fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    // Feed operations

    /// Insert a feed. A feed whose url is already stored is a conflict.
    pub async fn insert_feed(&self, feed: NewRssFeed) -> Result<RssFeed> {
        let url = feed.url.clone();
        let themes = to_json(&feed.themes)?;
        let tags = to_json(&feed.tags)?;

        let id = self
            .conn
            .call(move |conn| {
                let exists: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM feeds WHERE url = ?1)",
                    params![feed.url],
                    |row| row.get(0),
                )?;
                if exists {
                    return Ok(None);
                }
                conn.execute(
                    "INSERT INTO feeds (name, url, themes, tags) VALUES (?1, ?2, ?3, ?4)",
                    params![feed.name, feed.url, themes, tags],
                )?;
                Ok(Some(conn.last_insert_rowid()))
            })
            .await?;

        let id = id.ok_or_else(|| AppError::Conflict(format!("RSS feed already exists: {url}")))?;
        self.require_feed(id).await
    }

    pub async fn get_feed(&self, id: i64) -> Result<Option<RssFeed>> {
        let feed = self
            .conn
            .call(move |conn| {
                let feed = conn
                    .query_row(
                        &format!("SELECT {FEED_COLUMNS} FROM feeds WHERE id = ?1"),
                        params![id],
                        feed_from_row,
                    )
                    .optional()?;
                Ok(feed)
            })
            .await?;
        Ok(feed)
    }

    pub async fn require_feed(&self, id: i64) -> Result<RssFeed> {
        self.get_feed(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("RSS feed {id}")))
    }

    /// All feeds, newest first.
    pub async fn get_all_feeds(&self) -> Result<Vec<RssFeed>> {
        self.query_feeds(
            format!("SELECT {FEED_COLUMNS} FROM feeds ORDER BY created_at DESC, id DESC"),
            None,
        )
        .await
    }

    pub async fn get_active_feeds(&self) -> Result<Vec<RssFeed>> {
        self.query_feeds(
            format!("SELECT {FEED_COLUMNS} FROM feeds WHERE is_active = 1 ORDER BY id"),
            None,
        )
        .await
    }

    pub async fn get_feeds_by_theme(&self, theme: &str) -> Result<Vec<RssFeed>> {
        self.query_feeds(
            format!(
                "SELECT {FEED_COLUMNS} FROM feeds \
                 WHERE EXISTS (SELECT 1 FROM json_each(feeds.themes) WHERE value = ?1) \
                 ORDER BY created_at DESC, id DESC"
            ),
            Some(theme.to_string()),
        )
        .await
    }

    async fn query_feeds(&self, sql: String, param: Option<String>) -> Result<Vec<RssFeed>> {
        let feeds = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = match param {
                    Some(p) => stmt.query_map(params![p], feed_from_row)?,
                    None => stmt.query_map([], feed_from_row)?,
                };
                let feeds = rows.collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(feeds)
            })
            .await?;
        Ok(feeds)
    }

    pub async fn set_feed_active(&self, id: i64, is_active: bool) -> Result<RssFeed> {
        let updated = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE feeds SET is_active = ?1 WHERE id = ?2",
                    params![is_active, id],
                )?;
                Ok(n)
            })
            .await?;
        if updated == 0 {
            return Err(AppError::NotFound(format!("RSS feed {id}")));
        }
        self.require_feed(id).await
    }

    /// Stamp `last_fetch` and fold the harvested vocabulary into the feed's
    /// accumulated themes and tags.
    pub async fn record_fetch(
        &self,
        id: i64,
        themes: BTreeSet<String>,
        tags: BTreeSet<String>,
    ) -> Result<RssFeed> {
        let now = Utc::now().to_rfc3339();
        let found = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let current: Option<(String, String)> = tx
                    .query_row(
                        "SELECT themes, tags FROM feeds WHERE id = ?1",
                        params![id],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
                let Some((old_themes, old_tags)) = current else {
                    return Ok(false);
                };

                let mut all_themes = parse_set(&old_themes);
                all_themes.extend(themes);
                let mut all_tags = parse_set(&old_tags);
                all_tags.extend(tags);

                tx.execute(
                    "UPDATE feeds SET last_fetch = ?1, themes = ?2, tags = ?3 WHERE id = ?4",
                    params![now, set_json(&all_themes), set_json(&all_tags), id],
                )?;
                tx.commit()?;
                Ok(true)
            })
            .await?;

        if !found {
            return Err(AppError::NotFound(format!("RSS feed {id}")));
        }
        self.require_feed(id).await
    }

    pub async fn delete_feed(&self, id: i64) -> Result<bool> {
        let deleted = self
            .conn
            .call(move |conn| {
                let n = conn.execute("DELETE FROM feeds WHERE id = ?1", params![id])?;
                Ok(n > 0)
            })
            .await?;
        Ok(deleted)
    }

    // Post operations

    /// Insert or update a post keyed by url. The id, source and creation
    /// time of an existing row are preserved.
    pub async fn upsert_post(&self, post: NewBlogPost) -> Result<BlogPost> {
        let tags = to_json(&post.tags)?;
        let themes = to_json(&post.themes)?;
        let embedding = post.embedding.as_ref().map(to_json).transpose()?;
        let now = Utc::now().to_rfc3339();

        let saved = self
            .conn
            .call(move |conn| {
                conn.execute(
                    r#"INSERT INTO blog_posts (feed_id, title, description, content, author, url, source,
                                              tags, themes, published_at, embedding, created_at, updated_at)
                       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)
                       ON CONFLICT(url) DO UPDATE SET
                           feed_id = COALESCE(blog_posts.feed_id, excluded.feed_id),
                           title = excluded.title,
                           description = excluded.description,
                           content = excluded.content,
                           author = excluded.author,
                           tags = excluded.tags,
                           themes = excluded.themes,
                           published_at = excluded.published_at,
                           embedding = COALESCE(excluded.embedding, blog_posts.embedding),
                           updated_at = excluded.updated_at"#,
                    params![
                        post.feed_id,
                        post.title,
                        post.description,
                        post.content,
                        post.author,
                        post.url,
                        post.source,
                        tags,
                        themes,
                        post.published_at.map(|dt| dt.to_rfc3339()),
                        embedding,
                        now,
                    ],
                )?;
                let saved = conn.query_row(
                    &format!("SELECT {POST_COLUMNS} FROM blog_posts WHERE url = ?1"),
                    params![post.url],
                    post_from_row,
                )?;
                Ok(saved)
            })
            .await?;
        Ok(saved)
    }

    pub async fn get_post(&self, id: i64) -> Result<Option<BlogPost>> {
        let post = self
            .conn
            .call(move |conn| {
                let post = conn
                    .query_row(
                        &format!("SELECT {POST_COLUMNS} FROM blog_posts WHERE id = ?1"),
                        params![id],
                        post_from_row,
                    )
                    .optional()?;
                Ok(post)
            })
            .await?;
        Ok(post)
    }

    pub async fn get_post_by_url(&self, url: &str) -> Result<Option<BlogPost>> {
        let url = url.to_string();
        let post = self
            .conn
            .call(move |conn| {
                let post = conn
                    .query_row(
                        &format!("SELECT {POST_COLUMNS} FROM blog_posts WHERE url = ?1"),
                        params![url],
                        post_from_row,
                    )
                    .optional()?;
                Ok(post)
            })
            .await?;
        Ok(post)
    }

    /// Posts owned by a feed: linked by id, or by source name for rows
    /// that were stored without a feed id.
    pub async fn get_posts_for_feed(&self, feed: &RssFeed) -> Result<Vec<BlogPost>> {
        let (id, name) = (feed.id, feed.name.clone());
        let posts = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {POST_COLUMNS} FROM blog_posts \
                     WHERE feed_id = ?1 OR (feed_id IS NULL AND source = ?2) \
                     ORDER BY id"
                ))?;
                let posts = stmt
                    .query_map(params![id, name], post_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(posts)
            })
            .await?;
        Ok(posts)
    }

    /// Delete every post owned by the feed and return their ids.
    pub async fn delete_posts_for_feed(&self, feed: &RssFeed) -> Result<Vec<i64>> {
        let (id, name) = (feed.id, feed.name.clone());
        let ids = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let ids = {
                    let mut stmt = tx.prepare(
                        "SELECT id FROM blog_posts \
                         WHERE feed_id = ?1 OR (feed_id IS NULL AND source = ?2) ORDER BY id",
                    )?;
                    let ids = stmt
                        .query_map(params![id, name], |row| row.get::<_, i64>(0))?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    ids
                };
                tx.execute(
                    "DELETE FROM blog_posts WHERE feed_id = ?1 OR (feed_id IS NULL AND source = ?2)",
                    params![id, name],
                )?;
                tx.commit()?;
                Ok(ids)
            })
            .await?;
        Ok(ids)
    }

    pub async fn get_all_posts(&self) -> Result<Vec<BlogPost>> {
        let posts = self
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare(&format!("SELECT {POST_COLUMNS} FROM blog_posts ORDER BY id"))?;
                let posts = stmt
                    .query_map([], post_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(posts)
            })
            .await?;
        Ok(posts)
    }

    pub async fn count_posts(&self) -> Result<usize> {
        let count = self
            .conn
            .call(|conn| {
                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM blog_posts", [], |row| row.get(0))?;
                Ok(count)
            })
            .await?;
        Ok(count as usize)
    }

    // Subscription operations

    /// Subscribe a user to a feed, reactivating a previous subscription.
    pub async fn subscribe(&self, user_id: &str, feed_id: i64) -> Result<UserRssFeed> {
        let user = user_id.to_string();
        let outcome = self
            .conn
            .call(move |conn| {
                let feed_exists: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM feeds WHERE id = ?1)",
                    params![feed_id],
                    |row| row.get(0),
                )?;
                if !feed_exists {
                    return Ok(Subscribe::UnknownFeed);
                }

                let existing: Option<(i64, bool)> = conn
                    .query_row(
                        "SELECT id, is_active FROM user_rss_feeds WHERE user_id = ?1 AND rss_feed_id = ?2",
                        params![user, feed_id],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;

                match existing {
                    Some((_, true)) => Ok(Subscribe::AlreadyActive),
                    Some((id, false)) => {
                        conn.execute(
                            "UPDATE user_rss_feeds SET is_active = 1 WHERE id = ?1",
                            params![id],
                        )?;
                        Ok(Subscribe::Reactivated(id))
                    }
                    None => {
                        conn.execute(
                            "INSERT INTO user_rss_feeds (user_id, rss_feed_id) VALUES (?1, ?2)",
                            params![user, feed_id],
                        )?;
                        Ok(Subscribe::Created(conn.last_insert_rowid()))
                    }
                }
            })
            .await?;

        let id = match outcome {
            Subscribe::Created(id) | Subscribe::Reactivated(id) => id,
            Subscribe::AlreadyActive => {
                return Err(AppError::Conflict(format!(
                    "user {user_id} is already subscribed to feed {feed_id}"
                )))
            }
            Subscribe::UnknownFeed => {
                return Err(AppError::NotFound(format!("RSS feed {feed_id}")));
            }
        };

        self.get_subscription(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("subscription {id}")))
    }

    pub async fn unsubscribe(&self, user_id: &str, feed_id: i64) -> Result<()> {
        let user = user_id.to_string();
        let updated = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE user_rss_feeds SET is_active = 0 \
                     WHERE user_id = ?1 AND rss_feed_id = ?2 AND is_active = 1",
                    params![user, feed_id],
                )?;
                Ok(n)
            })
            .await?;
        if updated == 0 {
            return Err(AppError::NotFound(format!(
                "active subscription of user {user_id} to feed {feed_id}"
            )));
        }
        Ok(())
    }

    async fn get_subscription(&self, id: i64) -> Result<Option<UserRssFeed>> {
        let sub = self
            .conn
            .call(move |conn| {
                let sub = conn
                    .query_row(
                        &subscription_sql("u.id = ?1"),
                        params![id],
                        subscription_from_row,
                    )
                    .optional()?;
                Ok(sub)
            })
            .await?;
        Ok(sub)
    }

    /// Active subscriptions of a user, with their feeds.
    pub async fn get_user_feeds(&self, user_id: &str) -> Result<Vec<UserRssFeed>> {
        let user = user_id.to_string();
        let subs = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{} ORDER BY u.created_at DESC, u.id DESC",
                    subscription_sql("u.user_id = ?1 AND u.is_active = 1")
                ))?;
                let subs = stmt
                    .query_map(params![user], subscription_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(subs)
            })
            .await?;
        Ok(subs)
    }

    /// Active feeds the user does not follow that share themes with the
    /// feeds they do follow, most shared themes first.
    pub async fn recommend_feeds(&self, user_id: &str, limit: usize) -> Result<Vec<RssFeed>> {
        let subscribed = self.get_user_feeds(user_id).await?;
        let followed: BTreeSet<i64> = subscribed.iter().map(|s| s.rss_feed_id).collect();
        let interests: BTreeSet<&String> = subscribed
            .iter()
            .flat_map(|s| s.rss_feed.themes.iter())
            .collect();

        let mut scored: Vec<(usize, RssFeed)> = self
            .get_active_feeds()
            .await?
            .into_iter()
            .filter(|f| !followed.contains(&f.id))
            .map(|f| {
                let shared = f.themes.iter().filter(|t| interests.contains(t)).count();
                (shared, f)
            })
            .filter(|(shared, _)| *shared > 0)
            .collect();

        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.name.cmp(&b.1.name)));
        Ok(scored.into_iter().take(limit).map(|(_, f)| f).collect())
    }

    // Search audit log

    /// Append one audit row for a completed search.
    pub async fn log_search(
        &self,
        query: &str,
        user_id: Option<&str>,
        results: usize,
    ) -> Result<i64> {
        let query = query.to_string();
        let user = user_id.map(str::to_string);
        let now = Utc::now().to_rfc3339();
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO search_queries (query, user_id, results, created_at) VALUES (?1, ?2, ?3, ?4)",
                    params![query, user, results as i64, now],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(id)
    }

    pub async fn get_search_history(
        &self,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SearchQuery>> {
        let user = user_id.map(str::to_string);
        let history = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, query, user_id, results, created_at FROM search_queries \
                     WHERE (?1 IS NULL OR user_id = ?1) \
                     ORDER BY created_at DESC, id DESC LIMIT ?2",
                )?;
                let history = stmt
                    .query_map(params![user, limit as i64], search_query_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(history)
            })
            .await?;
        Ok(history)
    }

    /// Drop the audit table so every later `log_search` fails.
    #[cfg(test)]
    pub(crate) async fn drop_search_log(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch("DROP TABLE search_queries")?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // Theme vocabulary

    pub async fn upsert_theme(&self, name: &str, tags: BTreeSet<String>) -> Result<Theme> {
        let name = name.to_string();
        let tags = to_json(&tags)?;
        let theme = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO themes (name, tags) VALUES (?1, ?2) \
                     ON CONFLICT(name) DO UPDATE SET tags = excluded.tags",
                    params![name, tags],
                )?;
                let theme = conn.query_row(
                    "SELECT id, name, tags FROM themes WHERE name = ?1",
                    params![name],
                    theme_from_row,
                )?;
                Ok(theme)
            })
            .await?;
        Ok(theme)
    }

    pub async fn get_themes(&self) -> Result<Vec<Theme>> {
        let themes = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT id, name, tags FROM themes ORDER BY name")?;
                let themes = stmt
                    .query_map([], theme_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(themes)
            })
            .await?;
        Ok(themes)
    }
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn set_json(set: &BTreeSet<String>) -> String {
    // Serializing a set of strings cannot fail.
    serde_json::to_string(set).unwrap_or_else(|_| "[]".to_string())
}

fn parse_set(s: &str) -> BTreeSet<String> {
    serde_json::from_str(s).unwrap_or_default()
}

fn timestamp(raw: Option<String>) -> DateTime<Utc> {
    raw.as_deref().and_then(parse_datetime).unwrap_or_else(Utc::now)
}

fn subscription_sql(filter: &str) -> String {
    format!(
        "SELECT u.id, u.user_id, u.rss_feed_id, u.is_active, u.created_at, \
                f.id, f.name, f.url, f.themes, f.tags, f.is_active, f.last_fetch, f.created_at \
         FROM user_rss_feeds u JOIN feeds f ON f.id = u.rss_feed_id WHERE {filter}"
    )
}

fn feed_from_row(row: &Row) -> rusqlite::Result<RssFeed> {
    feed_from_row_at(row, 0)
}

fn feed_from_row_at(row: &Row, at: usize) -> rusqlite::Result<RssFeed> {
    Ok(RssFeed {
        id: row.get(at)?,
        name: row.get(at + 1)?,
        url: row.get(at + 2)?,
        themes: parse_set(&row.get::<_, String>(at + 3)?),
        tags: parse_set(&row.get::<_, String>(at + 4)?),
        is_active: row.get(at + 5)?,
        last_fetch: row
            .get::<_, Option<String>>(at + 6)?
            .and_then(|s| parse_datetime(&s)),
        created_at: timestamp(row.get(at + 7)?),
    })
}

fn subscription_from_row(row: &Row) -> rusqlite::Result<UserRssFeed> {
    Ok(UserRssFeed {
        id: row.get(0)?,
        user_id: row.get(1)?,
        rss_feed_id: row.get(2)?,
        is_active: row.get(3)?,
        created_at: timestamp(row.get(4)?),
        rss_feed: feed_from_row_at(row, 5)?,
    })
}

fn post_from_row(row: &Row) -> rusqlite::Result<BlogPost> {
    Ok(BlogPost {
        id: row.get(0)?,
        feed_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        content: row.get(4)?,
        author: row.get(5)?,
        url: row.get(6)?,
        source: row.get(7)?,
        tags: parse_set(&row.get::<_, String>(8)?),
        themes: parse_set(&row.get::<_, String>(9)?),
        published_at: row
            .get::<_, Option<String>>(10)?
            .and_then(|s| parse_datetime(&s)),
        embedding: row
            .get::<_, Option<String>>(11)?
            .and_then(|s| serde_json::from_str(&s).ok()),
        created_at: timestamp(row.get(12)?),
        updated_at: timestamp(row.get(13)?),
    })
}

fn search_query_from_row(row: &Row) -> rusqlite::Result<SearchQuery> {
    Ok(SearchQuery {
        id: row.get(0)?,
        query: row.get(1)?,
        user_id: row.get(2)?,
        results: row.get(3)?,
        created_at: timestamp(row.get(4)?),
    })
}

fn theme_from_row(row: &Row) -> rusqlite::Result<Theme> {
    Ok(Theme {
        id: row.get(0)?,
        name: row.get(1)?,
        tags: parse_set(&row.get::<_, String>(2)?),
    })
}
