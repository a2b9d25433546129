use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    KnnQuery, LexicalQuery, SearchIndex, BEST_FIELDS, FUZZY_BOOST, MOST_FIELDS, PARTIAL_BOOST,
    PHRASE_BOOST, PHRASE_FIELDS,
};
use crate::config::IndexConfig;
use crate::error::{AppError, Result};
use crate::models::{IndexDocument, SearchHit, EMBEDDING_DIMS};

#[derive(Debug, Deserialize)]
struct SearchBody {
    hits: HitsEnvelope,
}

#[derive(Debug, Deserialize)]
struct HitsEnvelope {
    hits: Vec<RawHit>,
}

#[derive(Debug, Deserialize)]
struct RawHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_score", default)]
    score: Option<f32>,
    #[serde(rename = "_source")]
    source: IndexDocument,
}

#[derive(Debug, Deserialize)]
struct DeleteByQueryBody {
    #[serde(default)]
    deleted: usize,
}

#[derive(Debug, Deserialize)]
struct CountBody {
    count: usize,
}

pub struct ElasticsearchIndex {
    client: Client,
    node: String,
    index: String,
    username: Option<String>,
    password: Option<String>,
}

impl ElasticsearchIndex {
    pub fn new(config: &IndexConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            client,
            node: config.node.trim_end_matches('/').to_string(),
            index: config.name.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!(
            "{}/{}{}",
            self.node,
            urlencoding::encode(&self.index),
            path
        );
        let builder = self.client.request(method, url);
        match &self.username {
            Some(user) => builder.basic_auth(user, self.password.as_ref()),
            None => builder,
        }
    }

    async fn search(&self, body: Value) -> Result<Vec<SearchHit>> {
        let response = self
            .request(Method::POST, "/_search")
            .json(&body)
            .send()
            .await?;
        let body: SearchBody = ensure_success(response).await?.json().await?;

        let hits = body
            .hits
            .hits
            .into_iter()
            .filter_map(|hit| match hit.id.parse::<i64>() {
                Ok(id) => Some(SearchHit::new(id, hit.score.unwrap_or(0.0), hit.source)),
                Err(_) => {
                    tracing::warn!("Skipping search hit with non-numeric id {}", hit.id);
                    None
                }
            })
            .collect();
        Ok(hits)
    }
}

#[async_trait]
impl SearchIndex for ElasticsearchIndex {
    async fn ensure_index(&self) -> Result<()> {
        let response = self.request(Method::HEAD, "").send().await?;
        match response.status() {
            status if status.is_success() => {
                tracing::debug!("Search index {} already exists", self.index);
                Ok(())
            }
            StatusCode::NOT_FOUND => {
                let response = self
                    .request(Method::PUT, "")
                    .json(&index_mapping())
                    .send()
                    .await?;
                ensure_success(response).await?;
                tracing::info!("Created search index {}", self.index);
                Ok(())
            }
            status => Err(AppError::Index(format!(
                "checking index {} returned HTTP {status}",
                self.index
            ))),
        }
    }

    async fn upsert(&self, id: i64, document: IndexDocument) -> Result<()> {
        let response = self
            .request(Method::PUT, &upsert_path(id))
            .json(&document)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<bool> {
        let response = self
            .request(Method::DELETE, &format!("/_doc/{id}"))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        ensure_success(response).await?;
        Ok(true)
    }

    async fn delete_by_source(&self, source: &str) -> Result<usize> {
        let response = self
            .request(Method::POST, "/_delete_by_query?refresh=true&conflicts=proceed")
            .json(&json!({ "query": { "term": { "source": source } } }))
            .send()
            .await?;
        let body: DeleteByQueryBody = ensure_success(response).await?.json().await?;
        Ok(body.deleted)
    }

    async fn lexical(&self, query: &LexicalQuery) -> Result<Vec<SearchHit>> {
        self.search(lexical_body(query)).await
    }

    async fn knn(&self, query: &KnnQuery) -> Result<Vec<SearchHit>> {
        if query.vector.len() != EMBEDDING_DIMS {
            return Err(AppError::InvalidInput(format!(
                "query vector has {} dimensions, expected {EMBEDDING_DIMS}",
                query.vector.len()
            )));
        }
        self.search(knn_body(query)).await
    }

    async fn count(&self) -> Result<usize> {
        let response = self.request(Method::GET, "/_count").send().await?;
        let body: CountBody = ensure_success(response).await?.json().await?;
        Ok(body.count)
    }
}

async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    Err(AppError::Index(format!("HTTP {status}: {text}")))
}

/// Indexing waits for the next refresh so a post is searchable as soon as
/// its fetch returns.
fn upsert_path(id: i64) -> String {
    format!("/_doc/{id}?refresh=wait_for")
}

fn boosted(fields: &[(&str, f32)]) -> Vec<String> {
    fields
        .iter()
        .map(|(name, boost)| {
            if *boost == 1.0 {
                name.to_string()
            } else {
                format!("{name}^{boost}")
            }
        })
        .collect()
}

fn index_mapping() -> Value {
    json!({
        "mappings": {
            "properties": {
                "title": { "type": "text", "analyzer": "standard" },
                "description": { "type": "text", "analyzer": "standard" },
                "content": { "type": "text", "analyzer": "standard" },
                "author": { "type": "keyword" },
                "url": { "type": "keyword" },
                "source": { "type": "keyword" },
                "tags": { "type": "keyword" },
                "themes": { "type": "keyword" },
                "publishedAt": { "type": "date" },
                "createdAt": { "type": "date" },
                "embedding": {
                    "type": "dense_vector",
                    "dims": EMBEDDING_DIMS,
                    "index": true,
                    "similarity": "cosine"
                }
            }
        }
    })
}

fn ranking_sort() -> Value {
    json!([
        { "_score": { "order": "desc" } },
        { "publishedAt": { "order": "desc", "missing": "_last" } }
    ])
}

fn lexical_body(query: &LexicalQuery) -> Value {
    json!({
        "query": {
            "bool": {
                "should": [
                    {
                        "multi_match": {
                            "query": query.text,
                            "fields": boosted(&PHRASE_FIELDS),
                            "type": "phrase",
                            "boost": PHRASE_BOOST
                        }
                    },
                    {
                        "multi_match": {
                            "query": query.text,
                            "fields": boosted(&BEST_FIELDS),
                            "type": "best_fields",
                            "fuzziness": "AUTO",
                            "boost": FUZZY_BOOST
                        }
                    },
                    {
                        "multi_match": {
                            "query": query.text,
                            "fields": boosted(&MOST_FIELDS),
                            "type": "most_fields",
                            "boost": PARTIAL_BOOST
                        }
                    }
                ],
                "minimum_should_match": 1
            }
        },
        "size": query.size,
        "min_score": query.min_score,
        "track_scores": true,
        "sort": ranking_sort(),
        "_source": { "excludes": ["embedding"] }
    })
}

fn knn_body(query: &KnnQuery) -> Value {
    json!({
        "knn": {
            "field": "embedding",
            "query_vector": query.vector,
            "k": query.k,
            "num_candidates": query.num_candidates
        },
        "size": query.k,
        "track_scores": true,
        "sort": ranking_sort(),
        "_source": { "excludes": ["embedding"] }
    })
}
