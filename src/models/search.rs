use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::IndexDocument;
use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchStrategy {
    #[default]
    Lexical,
    Vector,
    Semantic,
}

impl fmt::Display for SearchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Lexical => "lexical",
            Self::Vector => "vector",
            Self::Semantic => "semantic",
        };
        f.write_str(name)
    }
}

impl FromStr for SearchStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lexical" | "text" => Ok(Self::Lexical),
            "vector" | "knn" => Ok(Self::Vector),
            "semantic" => Ok(Self::Semantic),
            other => Err(format!("unknown search strategy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    10
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, limit: usize) -> Self {
        Self {
            query: query.into(),
            limit,
        }
    }

    pub fn validate(&self, max_limit: usize) -> Result<()> {
        if self.query.trim().is_empty() {
            return Err(AppError::InvalidInput("query must not be empty".into()));
        }
        if self.limit == 0 || self.limit > max_limit {
            return Err(AppError::InvalidInput(format!(
                "limit must be between 1 and {max_limit}, got {}",
                self.limit
            )));
        }
        Ok(())
    }
}

/// One ranked result. Rerank providers echo the document back and may attach
/// their own scoring breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub id: i64,
    pub score: f32,
    #[serde(flatten)]
    pub document: IndexDocument,
    #[serde(
        default,
        rename = "semantic_score",
        skip_serializing_if = "Option::is_none"
    )]
    pub semantic_score: Option<f32>,
    #[serde(
        default,
        rename = "original_score",
        skip_serializing_if = "Option::is_none"
    )]
    pub original_score: Option<f32>,
}

impl SearchHit {
    pub fn new(id: i64, score: f32, mut document: IndexDocument) -> Self {
        document.embedding = None;
        Self {
            id,
            score,
            document,
            semantic_score: None,
            original_score: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    #[serde(default = "default_intent")]
    pub primary_intent: String,
    #[serde(default)]
    pub secondary_intents: Vec<String>,
    #[serde(default)]
    pub confidence: f32,
}

fn default_intent() -> String {
    "information".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entities {
    #[serde(default)]
    pub companies: Vec<String>,
    #[serde(default)]
    pub technologies: Vec<String>,
    #[serde(default)]
    pub concepts: Vec<String>,
    #[serde(default)]
    pub other_entities: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainMatch {
    pub domain: String,
    #[serde(default)]
    pub relevance_score: f32,
}

/// Query intent, entity and domain metadata from the semantic provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SemanticAnalysis {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_query: Option<String>,
    #[serde(default)]
    pub intent: Intent,
    #[serde(default)]
    pub entities: Entities,
    #[serde(default)]
    pub domains: Vec<DomainMatch>,
    #[serde(default)]
    pub expanded_terms: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_query: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub query: String,
    pub total_results: usize,
    pub results: Vec<SearchHit>,
    pub search_type: SearchStrategy,
    #[serde(
        default,
        rename = "semantic_analysis",
        skip_serializing_if = "Option::is_none"
    )]
    pub semantic_analysis: Option<SemanticAnalysis>,
    pub timestamp: DateTime<Utc>,
}

/// Audit record of one search call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    pub id: i64,
    pub query: String,
    pub user_id: Option<String>,
    pub results: i64,
    pub created_at: DateTime<Utc>,
}
