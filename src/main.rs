use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Serialize;

use rss_search::config::Config;
use rss_search::error::Result;
use rss_search::models::{NewRssFeed, SearchRequest, SearchStrategy};
use rss_search::App;

/// Aggregate blog posts from RSS feeds and search them.
#[derive(Parser, Debug)]
#[clap(name = "rss-search", version)]
struct Cli {
    /// Path to the config file
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage feeds
    Feeds {
        #[clap(subcommand)]
        action: FeedAction,
    },
    /// Fetch one feed, or every active feed with --all
    Fetch {
        /// Feed id
        id: Option<i64>,

        #[clap(long, conflicts_with = "id")]
        all: bool,
    },
    /// Search posts
    Search {
        query: String,

        /// lexical, vector or semantic
        #[clap(short, long, default_value = "lexical")]
        strategy: SearchStrategy,

        #[clap(short, long)]
        limit: Option<usize>,

        /// Record the search under this user
        #[clap(short, long)]
        user: Option<String>,
    },
    /// Show intent, entities and domains for a query
    Analyze { query: String },
    /// Show recent searches
    History {
        #[clap(short, long)]
        user: Option<String>,

        #[clap(short, long, default_value = "20")]
        limit: usize,
    },
    /// Rebuild the search index from the database
    Reindex,
    /// Subscribe a user to a feed
    Subscribe { user: String, feed_id: i64 },
    /// Unsubscribe a user from a feed
    Unsubscribe { user: String, feed_id: i64 },
    /// List a user's subscriptions
    Subscriptions { user: String },
    /// Suggest feeds sharing themes with a user's subscriptions
    Recommend {
        user: String,

        #[clap(short, long, default_value = "10")]
        limit: usize,
    },
    /// Manage the theme vocabulary used to tag posts
    Themes {
        #[clap(subcommand)]
        action: ThemeAction,
    },
}

#[derive(Subcommand, Debug)]
enum FeedAction {
    /// Add a feed
    Add {
        name: String,
        url: String,

        #[clap(long, value_delimiter = ',')]
        themes: Vec<String>,

        #[clap(long, value_delimiter = ',')]
        tags: Vec<String>,
    },
    /// List feeds, newest first
    List {
        /// Only feeds carrying this theme
        #[clap(long)]
        theme: Option<String>,
    },
    /// Delete a feed and all of its posts
    Delete { id: i64 },
    /// Include a feed in fetch --all
    Activate { id: i64 },
    /// Skip a feed in fetch --all
    Deactivate { id: i64 },
}

#[derive(Subcommand, Debug)]
enum ThemeAction {
    /// Add or replace a theme
    Add {
        name: String,

        /// Comma separated tags
        #[clap(value_delimiter = ',')]
        tags: Vec<String>,
    },
    /// List themes
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging (only show warnings and errors by default)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let app = App::new(&config).await?;

    match cli.command {
        Command::Feeds { action } => match action {
            FeedAction::Add {
                name,
                url,
                themes,
                tags,
            } => {
                let feed = NewRssFeed {
                    themes: themes.into_iter().collect(),
                    tags: tags.into_iter().collect(),
                    ..NewRssFeed::new(name, url)
                };
                print_json(&app.ingestion.add_feed(feed).await?)
            }
            FeedAction::List { theme: Some(theme) } => {
                print_json(&app.ingestion.feeds_by_theme(&theme).await?)
            }
            FeedAction::List { theme: None } => print_json(&app.ingestion.list_feeds().await?),
            FeedAction::Delete { id } => print_json(&app.ingestion.delete_feed(id).await?),
            FeedAction::Activate { id } => {
                print_json(&app.ingestion.set_feed_active(id, true).await?)
            }
            FeedAction::Deactivate { id } => {
                print_json(&app.ingestion.set_feed_active(id, false).await?)
            }
        },
        Command::Fetch { all: true, .. } => print_json(&app.ingestion.fetch_all().await?),
        Command::Fetch { id: Some(id), .. } => print_json(&app.ingestion.fetch_one(id).await?),
        Command::Fetch { id: None, .. } => Err(anyhow::anyhow!("pass a feed id or --all").into()),
        Command::Search {
            query,
            strategy,
            limit,
            user,
        } => {
            let limit = limit.unwrap_or(app.search.settings().default_limit);
            let request = SearchRequest::new(query, limit);
            print_json(&app.search.search(&request, strategy, user.as_deref()).await?)
        }
        Command::Analyze { query } => print_json(&app.search.analyze(&query).await),
        Command::History { user, limit } => {
            print_json(&app.search_history(user.as_deref(), limit).await?)
        }
        Command::Reindex => print_json(&app.ingestion.reindex().await?),
        Command::Subscribe { user, feed_id } => print_json(&app.subscribe(&user, feed_id).await?),
        Command::Unsubscribe { user, feed_id } => {
            app.unsubscribe(&user, feed_id).await?;
            print_json(&serde_json::json!({ "success": true }))
        }
        Command::Subscriptions { user } => print_json(&app.user_feeds(&user).await?),
        Command::Recommend { user, limit } => print_json(&app.recommend_feeds(&user, limit).await?),
        Command::Themes { action } => match action {
            ThemeAction::Add { name, tags } => {
                print_json(&app.add_theme(&name, tags.into_iter().collect()).await?)
            }
            ThemeAction::List => print_json(&app.themes().await?),
        },
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value)?;
    println!("{out}");
    Ok(())
}
