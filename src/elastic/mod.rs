use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::{Client, Response, StatusCode, Url};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::elastic::model::BulkResponse;
use crate::model::SearchDocument;

pub mod model;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IndexError {
    /// The index could not be reached at all.
    #[error("index unreachable: {0}")]
    Connectivity(String),
    /// The index answered but asked us to try again (throttling, 5xx, item failures).
    #[error("retryable index error: {0}")]
    Retryable(String),
    #[error("index error: {0}")]
    Fatal(String),
}

impl IndexError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, IndexError::Connectivity(_) | IndexError::Retryable(_))
    }
}

/// Search index operations the sync job needs.
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Create the index if absent and declare its mapping. Idempotent.
    async fn ensure_schema(&self) -> Result<(), IndexError>;

    async fn ping(&self) -> Result<(), IndexError>;

    /// Insert-or-replace every document by id.
    async fn bulk_upsert(&self, documents: &[SearchDocument]) -> Result<(), IndexError>;
}

/// Field mapping declared on the index.
pub static MAPPING: Lazy<Value> = Lazy::new(|| {
    let keyword = json!({ "type": "keyword" });
    let date = json!({ "type": "date", "format": "yyyy-MM-dd HH:mm:ss||strict_date_optional_time" });
    let fielddata_text = json!({ "type": "text", "fielddata": true });
    let nested_keyword = json!({ "properties": { "keyword": keyword } });
    json!({
        "properties": {
            "key": keyword,
            "value": keyword,
            "key_value_pairs": { "properties": { "key": keyword, "value": keyword } },
            "release": keyword,
            "updated_date": date,
            "created_date": date,
            "transaction_ids": fielddata_text,
            "has_doi": fielddata_text,
            "description": keyword,
            "type": keyword,
            "keyword": keyword,
            "users": {
                "properties": {
                    "keyword": keyword,
                    "submitter": nested_keyword,
                    "authorized_releaser": nested_keyword
                }
            },
            "instruments": nested_keyword,
            "projects": {
                "properties": {
                    "keyword": keyword,
                    "closed_date": date,
                    "actual_start_date": date,
                    "actual_end_date": date
                }
            },
            "institutions": nested_keyword,
            "science_themes": nested_keyword,
            "groups": nested_keyword,
            "files": { "properties": { "keyword": keyword, "created_date": date } }
        }
    })
});

#[derive(Clone)]
pub struct ElasticClient {
    http: Client,
    base_url: Url,
    index: String,
    bulk_chunk_size: usize,
}

impl fmt::Debug for ElasticClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElasticClient")
            .field("base_url", &self.base_url)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

impl ElasticClient {
    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let base_url = Url::parse(&cfg.elasticsearch.url)?;
        Self::with_base_url(
            base_url,
            cfg.elasticsearch.index.clone(),
            Duration::from_secs(cfg.elasticsearch.timeout_seconds),
            cfg.elasticsearch.bulk_chunk_size,
        )
    }

    pub fn with_base_url(
        mut base_url: Url,
        index: String,
        timeout: Duration,
        bulk_chunk_size: usize,
    ) -> anyhow::Result<Self> {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = Client::builder()
            .user_agent("search-sync/0.1")
            .timeout(timeout)
            .no_proxy()
            .build()?;
        Ok(Self {
            http,
            base_url,
            index,
            bulk_chunk_size: bulk_chunk_size.max(1),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, IndexError> {
        self.base_url
            .join(path)
            .map_err(|err| IndexError::Fatal(format!("invalid index url {}: {}", path, err)))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Response, IndexError> {
        request
            .send()
            .await
            .map_err(|err| IndexError::Connectivity(err.to_string()))
    }

    async fn post_bulk(&self, body: String) -> Result<(), IndexError> {
        let url = self.endpoint("_bulk")?;
        debug!(%url, bytes = body.len(), "sending bulk request");
        let res = self
            .send(
                self.http
                    .post(url)
                    .header("Content-Type", "application/x-ndjson")
                    .body(body),
            )
            .await?;
        let res = check_status(res).await?;
        let payload: BulkResponse = res
            .json()
            .await
            .map_err(|err| IndexError::Fatal(format!("invalid bulk response: {}", err)))?;
        if payload.errors {
            let failed = payload.failed_items();
            let first = payload.first_error().unwrap_or_default();
            warn!(failed, first = %first, "bulk request had item failures");
            return Err(IndexError::Retryable(format!(
                "{} bulk item(s) failed, first: {}",
                failed, first
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl IndexStore for ElasticClient {
    async fn ensure_schema(&self) -> Result<(), IndexError> {
        let index_url = self.endpoint(&self.index)?;
        let res = self.send(self.http.put(index_url)).await?;
        // 400 means the index is already there.
        if res.status() != StatusCode::BAD_REQUEST {
            check_status(res).await?;
        }

        let mapping_url = self.endpoint(&format!("{}/_mapping", self.index))?;
        let res = self
            .send(self.http.put(mapping_url).json(&*MAPPING))
            .await?;
        check_status(res).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), IndexError> {
        let res = self.send(self.http.get(self.base_url.clone())).await?;
        match check_status(res).await {
            Ok(_) => Ok(()),
            Err(err) => Err(IndexError::Connectivity(err.to_string())),
        }
    }

    async fn bulk_upsert(&self, documents: &[SearchDocument]) -> Result<(), IndexError> {
        for chunk in documents.chunks(self.bulk_chunk_size) {
            let body = build_bulk_body(&self.index, chunk)?;
            self.post_bulk(body).await?;
        }
        Ok(())
    }
}

/// Map a non-success status onto the error taxonomy.
async fn check_status(res: Response) -> Result<Response, IndexError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    Err(classify_status(status, body))
}

pub fn classify_status(status: StatusCode, body: String) -> IndexError {
    let message = format!("{}: {}", status, body);
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        IndexError::Retryable(message)
    } else {
        IndexError::Fatal(message)
    }
}

/// NDJSON body of `index` actions, one action line plus one source line per document.
pub fn build_bulk_body(index: &str, documents: &[SearchDocument]) -> Result<String, IndexError> {
    let mut body = String::new();
    for doc in documents {
        let action = json!({ "index": { "_index": index, "_id": doc.id } });
        body.push_str(&action.to_string());
        body.push('\n');
        let source = serde_json::to_string(&doc.source)
            .map_err(|err| IndexError::Fatal(format!("unserializable document {}: {}", doc.id, err)))?;
        body.push_str(&source);
        body.push('\n');
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, value: Value) -> SearchDocument {
        SearchDocument {
            id: id.into(),
            source: value,
        }
    }

    #[test]
    fn bulk_body_pairs_actions_with_sources() {
        let docs = vec![
            doc("users_1", json!({"name": "a"})),
            doc("users_2", json!({"name": "b"})),
        ];
        let body = build_bulk_body("idx", &docs).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(body.ends_with('\n'));
        let action: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(action["index"]["_index"], "idx");
        assert_eq!(action["index"]["_id"], "users_1");
        let source: Value = serde_json::from_str(lines[3]).unwrap();
        assert_eq!(source["name"], "b");
    }

    #[test]
    fn empty_bulk_body_is_empty() {
        assert_eq!(build_bulk_body("idx", &[]).unwrap(), "");
    }

    #[test]
    fn status_classification() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, String::new()).is_retryable());
        assert!(classify_status(StatusCode::BAD_GATEWAY, String::new()).is_retryable());
        let fatal = classify_status(StatusCode::BAD_REQUEST, "bad".into());
        assert!(!fatal.is_retryable());
        assert!(fatal.to_string().contains("bad"));
        assert!(IndexError::Connectivity("down".into()).is_retryable());
    }

    #[test]
    fn base_url_gets_trailing_slash() {
        let client = ElasticClient::with_base_url(
            Url::parse("http://localhost:9200/es").unwrap(),
            "idx".into(),
            Duration::from_secs(1),
            0,
        )
        .unwrap();
        assert_eq!(client.endpoint("_bulk").unwrap().as_str(), "http://localhost:9200/es/_bulk");
        assert_eq!(client.bulk_chunk_size, 1);
    }

    #[test]
    fn mapping_declares_dates_and_keywords() {
        assert_eq!(MAPPING["properties"]["created_date"]["type"], "date");
        assert_eq!(MAPPING["properties"]["users"]["properties"]["submitter"]["properties"]["keyword"]["type"], "keyword");
    }
}
