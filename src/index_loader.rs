//! Bulk-writes `FilmDoc`s to the `movies` search index.

use std::collections::HashMap;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::config::IndexConfig;
use crate::error::EtlError;
use crate::model::FilmDoc;

const INDEX_NAME: &str = "movies";

/// Write side of the search index, abstracted so the Orchestrator can be
/// driven against a real HTTP index in production and a fake in-memory one
/// under test.
#[async_trait]
pub trait IndexWriter: Send + Sync {
    async fn bulk_index(&self, docs: &HashMap<Uuid, FilmDoc>) -> Result<(), EtlError>;
}

/// Thin client over the search index's bulk NDJSON endpoint. One `FilmDoc`
/// per line becomes one `{index: {_index, _id}}` action line followed by
/// its source line, matching the Elasticsearch/OpenSearch bulk contract the
/// rest of this workspace's index clients speak.
pub struct IndexLoader {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct BulkIndexAction<'a> {
    index: BulkIndexMeta<'a>,
}

#[derive(Serialize)]
struct BulkIndexMeta<'a> {
    #[serde(rename = "_index")]
    index: &'a str,
    #[serde(rename = "_id")]
    id: Uuid,
}

impl IndexLoader {
    pub fn new(config: &IndexConfig) -> Result<Self> {
        let base_url = config
            .hosts
            .first()
            .cloned()
            .ok_or_else(|| anyhow!("no index hosts configured"))?;
        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
        })
    }
}

#[async_trait]
impl IndexWriter for IndexLoader {
    /// Writes every document in `docs`, idempotent by film UUID. A film
    /// missing from `docs` is left untouched in the index, matching the
    /// reference contract of only ever upserting changed documents.
    async fn bulk_index(&self, docs: &HashMap<Uuid, FilmDoc>) -> Result<(), EtlError> {
        if docs.is_empty() {
            return Ok(());
        }

        let mut body = String::new();
        for (id, doc) in docs {
            let action = BulkIndexAction {
                index: BulkIndexMeta {
                    index: INDEX_NAME,
                    id: *id,
                },
            };
            body.push_str(&serde_json::to_string(&action).map_err(anyhow::Error::from)?);
            body.push('\n');
            body.push_str(&serde_json::to_string(doc).map_err(anyhow::Error::from)?);
            body.push('\n');
        }

        let url = format!("{}/_bulk", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .with_context(|| format!("sending bulk index request to {url}"))
            .map_err(EtlError::IndexWrite)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(EtlError::IndexWrite(anyhow!(
                "bulk index request failed with status {status}: {text}"
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_doc_set_sends_no_request() {
        let loader = IndexLoader::new(&IndexConfig {
            hosts: vec!["http://localhost:1".to_string()],
        })
        .unwrap();
        let docs: HashMap<Uuid, FilmDoc> = HashMap::new();
        let result = loader.bulk_index(&docs).await;
        assert!(result.is_ok());
    }

    #[test]
    fn new_rejects_empty_host_list() {
        let result = IndexLoader::new(&IndexConfig { hosts: vec![] });
        assert!(result.is_err());
    }
}
