//! Blog aggregation over RSS feeds with lexical, vector and semantic search.
//!
//! The record store (SQLite) is authoritative; the search index is a derived
//! copy kept in sync by explicit dual writes and rebuildable with
//! [`ingest::IngestionPipeline::reindex`].

pub mod app;
pub mod config;
pub mod db;
pub mod error;
pub mod feed;
pub mod index;
pub mod ingest;
pub mod models;
pub mod providers;
pub mod search;

pub use app::App;
pub use config::Config;
pub use error::{AppError, Result};
