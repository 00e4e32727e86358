//! Meilisearch backend over its HTTP API.

use super::{SearchFilters, SearchQuery, SearchStorage};
use crate::{Error, Result};
use archivist_core::IndexedDocument;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Url};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;

/// Connection settings for Meilisearch.
#[derive(Debug, Clone)]
pub struct MeilisearchConfig {
    /// Server URL, e.g. `http://localhost:7700`.
    pub url: String,

    /// Master or API key. Omitted for unsecured development servers.
    pub api_key: Option<String>,

    /// Index uid.
    pub index: String,

    pub timeout: Duration,
}

impl MeilisearchConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: None,
            index: "messages".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    hits: Vec<IndexedDocument>,
}

/// [`SearchStorage`] backed by a Meilisearch index.
///
/// Meilisearch applies writes asynchronously, so an upsert that returns
/// `Ok` is enqueued, not yet searchable.
pub struct MeilisearchStorage {
    client: Client,
    base: Url,
    config: MeilisearchConfig,
}

impl MeilisearchStorage {
    pub fn new(config: MeilisearchConfig) -> Result<Self> {
        let base = Url::parse(&config.url)
            .map_err(|e| Error::Config(format!("invalid Meilisearch URL '{}': {e}", config.url)))?;
        if base.cannot_be_a_base() {
            return Err(Error::Config(format!(
                "Meilisearch URL '{}' cannot carry a path",
                config.url
            )));
        }
        let client = Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            base,
            config,
        })
    }

    /// Create the index if needed and configure filterable and sortable
    /// attributes.
    pub async fn ensure_index(&self) -> Result<()> {
        let url = self.endpoint(&["indexes"])?;
        let body = json!({ "uid": self.config.index, "primaryKey": "id" });
        // Creating an existing index enqueues a task that fails server-side;
        // the request itself still succeeds.
        self.send(self.client.post(url).json(&body)).await?;

        let url = self.endpoint(&["indexes", &self.config.index, "settings"])?;
        let settings = json!({
            "filterableAttributes": ["room_id", "sender"],
            "sortableAttributes": ["origin_server_ts"]
        });
        self.send(self.client.patch(url).json(&settings)).await?;

        tracing::info!(
            "Meilisearch index '{}' ready at {}",
            self.config.index,
            self.base
        );
        Ok(())
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Config("Meilisearch URL cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(&self, mut request: RequestBuilder) -> Result<Value> {
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::StorageNotFound(
                String::from_utf8_lossy(&bytes).into_owned(),
            ));
        }
        if !status.is_success() {
            return Err(Error::Storage(format!(
                "Meilisearch returned {}: {}",
                status,
                String::from_utf8_lossy(&bytes)
            )));
        }
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Quote a value for a Meilisearch filter expression.
fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Build a filter expression, e.g. `room_id = "!a:b" AND sender = "@c:d"`.
fn filter_expression(filters: &SearchFilters) -> Option<String> {
    let mut clauses = Vec::new();
    if let Some(room_id) = &filters.room_id {
        clauses.push(format!("room_id = {}", quote(room_id)));
    }
    if let Some(sender) = &filters.sender {
        clauses.push(format!("sender = {}", quote(sender)));
    }
    if clauses.is_empty() {
        None
    } else {
        Some(clauses.join(" AND "))
    }
}

fn search_body(query: &SearchQuery) -> Value {
    let mut body = json!({
        "q": query.term,
        "limit": query.limit,
        "sort": ["origin_server_ts:desc"]
    });
    if let Some(filter) = filter_expression(&query.filters) {
        body["filter"] = Value::String(filter);
    }
    body
}

#[async_trait]
impl SearchStorage for MeilisearchStorage {
    async fn upsert(&self, document: &IndexedDocument) -> Result<()> {
        let mut url = self.endpoint(&["indexes", &self.config.index, "documents"])?;
        url.query_pairs_mut().append_pair("primaryKey", "id");
        self.send(self.client.post(url).json(&[document])).await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let url = self.endpoint(&["indexes", &self.config.index, "documents", id])?;
        self.send(self.client.delete(url)).await?;
        Ok(())
    }

    async fn query(&self, query: &SearchQuery) -> Result<Vec<IndexedDocument>> {
        let url = self.endpoint(&["indexes", &self.config.index, "search"])?;
        let value = self
            .send(self.client.post(url).json(&search_body(query)))
            .await?;
        let parsed: SearchResponse = serde_json::from_value(value)?;
        Ok(parsed.hits)
    }
}
