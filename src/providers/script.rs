use async_trait::async_trait;
use serde::Deserialize;

use super::{Embedder, FeedFetcher, Reranked, Reranker, ScriptRunner};
use crate::config::ProviderConfig;
use crate::error::{AppError, Result};
use crate::models::{RawPost, SearchHit, SemanticAnalysis, EMBEDDING_DIMS};

/// Embedding provider backed by a program that prints a JSON float array
/// (or `null` for text it cannot embed).
pub struct ScriptEmbedder {
    runner: ScriptRunner,
}

impl ScriptEmbedder {
    pub fn new(runner: ScriptRunner) -> Self {
        Self { runner }
    }

    pub fn from_config(config: &ProviderConfig) -> Self {
        Self::new(ScriptRunner::new(
            "embedder",
            config.embed_command.clone(),
            config.embed_timeout(),
            config.debug,
        ))
    }
}

#[async_trait]
impl Embedder for ScriptEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let args = vec!["--query".to_string(), text.to_string()];
        let vector: Option<Vec<f32>> = self.runner.run(&args).await?;
        let vector = vector
            .ok_or_else(|| AppError::provider(self.runner.name(), "no embedding for empty text"))?;

        if vector.len() != EMBEDDING_DIMS {
            return Err(AppError::provider(
                self.runner.name(),
                format!(
                    "embedding has {} dimensions, expected {EMBEDDING_DIMS}",
                    vector.len()
                ),
            ));
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(AppError::provider(
                self.runner.name(),
                "embedding contains non-finite values",
            ));
        }
        Ok(vector)
    }
}

#[derive(Debug, Deserialize)]
struct RerankPayload {
    ranked_results: Vec<SearchHit>,
    #[serde(default)]
    semantic_analysis: Option<SemanticAnalysis>,
}

#[derive(Debug, Deserialize)]
struct AnalysisPayload {
    semantic_analysis: SemanticAnalysis,
}

/// Semantic provider. Candidates are handed over in a temporary JSON file
/// which is removed once the call returns.
pub struct ScriptReranker {
    runner: ScriptRunner,
}

impl ScriptReranker {
    pub fn new(runner: ScriptRunner) -> Self {
        Self { runner }
    }

    pub fn from_config(config: &ProviderConfig) -> Self {
        Self::new(ScriptRunner::new(
            "reranker",
            config.rerank_command.clone(),
            config.rerank_timeout(),
            config.debug,
        ))
    }
}

#[async_trait]
impl Reranker for ScriptReranker {
    async fn rerank(&self, query: &str, candidates: &[SearchHit]) -> Result<Reranked> {
        let file = tempfile::Builder::new()
            .prefix("search_results_")
            .suffix(".json")
            .tempfile()?;
        tokio::fs::write(file.path(), serde_json::to_vec(candidates)?).await?;

        let args = vec![
            "--query".to_string(),
            query.to_string(),
            "--results".to_string(),
            file.path().to_string_lossy().into_owned(),
        ];
        let payload: RerankPayload = self.runner.run(&args).await?;
        drop(file);

        tracing::debug!(
            "Reranked {} candidates into {} results",
            candidates.len(),
            payload.ranked_results.len()
        );
        Ok(Reranked {
            results: payload.ranked_results,
            analysis: payload.semantic_analysis,
        })
    }

    async fn analyze(&self, query: &str) -> Result<SemanticAnalysis> {
        let args = vec![
            "--query".to_string(),
            query.to_string(),
            "--analysis-only".to_string(),
        ];
        let payload: AnalysisPayload = self.runner.run(&args).await?;
        Ok(payload.semantic_analysis)
    }
}

/// Feed fetcher that delegates download and parsing to an external program
/// printing a JSON array of posts.
pub struct ScriptFeedFetcher {
    runner: ScriptRunner,
}

impl ScriptFeedFetcher {
    pub fn new(runner: ScriptRunner) -> Self {
        Self { runner }
    }

    pub fn from_config(config: &ProviderConfig) -> Self {
        Self::new(ScriptRunner::new(
            "fetcher",
            config.fetch_command.clone(),
            config.fetch_timeout(),
            config.debug,
        ))
    }
}

#[async_trait]
impl FeedFetcher for ScriptFeedFetcher {
    async fn fetch(&self, url: &str, source: &str) -> Result<Vec<RawPost>> {
        let args = vec![
            "--url".to_string(),
            url.to_string(),
            "--source".to_string(),
            source.to_string(),
        ];
        self.runner.run(&args).await
    }
}
