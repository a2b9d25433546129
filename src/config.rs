use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default)]
    pub fetcher: FetcherKind,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub search: SearchSettings,

    #[serde(default)]
    pub providers: ProviderConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetcherKind {
    /// In-process HTTP fetch and feed parsing.
    #[default]
    Native,
    /// External fetch script speaking the JSON contract.
    Script,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexBackend {
    #[default]
    Memory,
    Elasticsearch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default)]
    pub backend: IndexBackend,
    #[serde(default = "default_es_node")]
    pub node: String,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_index_name")]
    pub name: String,
    #[serde(default = "default_index_timeout")]
    pub request_timeout_secs: u64,
}

/// Tunable knobs of the query engine. The two score floors are applied
/// independently: one by the index, one on the returned hits. Unset floors
/// take the active backend's calibrated defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_min_score: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_min_score: Option<f32>,
    #[serde(default = "default_search_limit")]
    pub default_limit: usize,
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,
    #[serde(default = "default_lexical_overfetch")]
    pub lexical_overfetch_factor: usize,
    #[serde(default = "default_semantic_pool")]
    pub semantic_pool_factor: usize,
    #[serde(default = "default_knn_factor")]
    pub knn_candidate_factor: usize,
    #[serde(default = "default_knn_min_candidates")]
    pub knn_min_candidates: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub debug: bool,
    /// Embed posts during native fetches so they are reachable by kNN.
    #[serde(default = "default_true")]
    pub embed_on_fetch: bool,
    #[serde(default = "default_embed_command")]
    pub embed_command: Vec<String>,
    #[serde(default = "default_rerank_command")]
    pub rerank_command: Vec<String>,
    #[serde(default = "default_fetch_command")]
    pub fetch_command: Vec<String>,
    #[serde(default = "default_embed_timeout")]
    pub embed_timeout_secs: u64,
    #[serde(default = "default_rerank_timeout")]
    pub rerank_timeout_secs: u64,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
}

fn default_db_path() -> String {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rss-search");
    std::fs::create_dir_all(&data_dir).ok();
    data_dir.join("posts.db").to_string_lossy().to_string()
}

fn default_user_agent() -> String {
    "rss-search/0.1".to_string()
}

fn default_http_timeout() -> u64 {
    30
}

fn default_es_node() -> String {
    "http://localhost:9200".to_string()
}

fn default_index_name() -> String {
    "blog-posts".to_string()
}

fn default_index_timeout() -> u64 {
    10
}

fn default_search_limit() -> usize {
    10
}

fn default_max_limit() -> usize {
    100
}

fn default_lexical_overfetch() -> usize {
    2
}

fn default_semantic_pool() -> usize {
    3
}

fn default_knn_factor() -> usize {
    6
}

fn default_knn_min_candidates() -> usize {
    60
}

fn python_script(script: &str) -> Vec<String> {
    vec!["python3".to_string(), format!("scripts/{script}")]
}

fn default_embed_command() -> Vec<String> {
    python_script("embed_text.py")
}

fn default_rerank_command() -> Vec<String> {
    python_script("semantic_search.py")
}

fn default_fetch_command() -> Vec<String> {
    python_script("fetch_rss.py")
}

fn default_true() -> bool {
    true
}

fn default_embed_timeout() -> u64 {
    60
}

fn default_rerank_timeout() -> u64 {
    120
}

fn default_fetch_timeout() -> u64 {
    300
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: IndexBackend::default(),
            node: default_es_node(),
            username: None,
            password: None,
            name: default_index_name(),
            request_timeout_secs: default_index_timeout(),
        }
    }
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            index_min_score: None,
            post_min_score: None,
            default_limit: default_search_limit(),
            max_limit: default_max_limit(),
            lexical_overfetch_factor: default_lexical_overfetch(),
            semantic_pool_factor: default_semantic_pool(),
            knn_candidate_factor: default_knn_factor(),
            knn_min_candidates: default_knn_min_candidates(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            debug: false,
            embed_on_fetch: true,
            embed_command: default_embed_command(),
            rerank_command: default_rerank_command(),
            fetch_command: default_fetch_command(),
            embed_timeout_secs: default_embed_timeout(),
            rerank_timeout_secs: default_rerank_timeout(),
            fetch_timeout_secs: default_fetch_timeout(),
        }
    }
}

impl ProviderConfig {
    pub fn embed_timeout(&self) -> Duration {
        Duration::from_secs(self.embed_timeout_secs)
    }

    pub fn rerank_timeout(&self) -> Duration {
        Duration::from_secs(self.rerank_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            fetcher: FetcherKind::default(),
            user_agent: default_user_agent(),
            http_timeout_secs: default_http_timeout(),
            index: IndexConfig::default(),
            search: SearchSettings::default(),
            providers: ProviderConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load from `path`, writing out the defaults when it does not exist yet.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            let config = Config::default();
            config.save_to(path)?;
            config
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| AppError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("rss-search")
            .join("config.toml")
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(node) = std::env::var("ELASTICSEARCH_NODE") {
            self.index.node = node;
        }
        if let Ok(username) = std::env::var("ELASTICSEARCH_USERNAME") {
            self.index.username = Some(username);
        }
        if let Ok(password) = std::env::var("ELASTICSEARCH_PASSWORD") {
            self.index.password = Some(password);
        }
        if std::env::var("PYTHON_DEBUG").is_ok_and(|v| v == "1") {
            self.providers.debug = true;
        }
    }

    fn validate(&self) -> Result<()> {
        let commands = [
            ("embed_command", &self.providers.embed_command),
            ("rerank_command", &self.providers.rerank_command),
            ("fetch_command", &self.providers.fetch_command),
        ];
        for (name, argv) in commands {
            if argv.is_empty() {
                return Err(AppError::Config(format!("providers.{name} is empty")));
            }
        }
        if self.search.max_limit == 0 || self.search.default_limit > self.search.max_limit {
            return Err(AppError::Config(
                "search.default_limit must be between 1 and search.max_limit".into(),
            ));
        }
        Ok(())
    }
}
