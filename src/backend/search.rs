//! Search-index client.
//!
//! [`SearchClient`] lists the index operations the evaluation needs;
//! [`ElasticClient`] implements them over the Elasticsearch REST API with a
//! blocking `reqwest` client. Failures are classified so query errors in the
//! report carry a cause: transport failures are [`EvalError::Network`], a
//! `400` answer is [`EvalError::MalformedQuery`], anything else is
//! [`EvalError::Backend`].

use crate::config::RetryPolicy;
use crate::error::{EvalError, Result};
use crate::normalizer::IndexedRecord;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::fmt::Write as _;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Counters from one bulk request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkSummary {
    pub indexed: usize,
    pub failed: usize,
}

impl BulkSummary {
    pub fn merge(&mut self, other: BulkSummary) {
        self.indexed += other.indexed;
        self.failed += other.failed;
    }
}

/// Index operations used by the search-index backend.
pub trait SearchClient: Send + Sync {
    fn health(&self) -> Result<()>;
    fn create_index(&self, index: &str) -> Result<()>;
    fn index_exists(&self, index: &str) -> Result<bool>;
    fn delete_index(&self, index: &str) -> Result<()>;
    /// Best-effort bulk insert; rejected documents are counted, not raised.
    fn bulk(&self, records: &[IndexedRecord]) -> Result<BulkSummary>;
    /// Make everything written so far visible to search, across all indices.
    fn refresh(&self) -> Result<()>;
    /// Total number of documents in `index` matching `body`.
    fn count_hits(&self, index: &str, body: &Value) -> Result<u64>;
}

/// Poll [`SearchClient::health`] until it succeeds.
///
/// Gives up with [`EvalError::Connectivity`] once `policy` runs out of
/// attempts or time.
pub fn wait_until_ready(client: &dyn SearchClient, policy: &RetryPolicy) -> Result<()> {
    let started = Instant::now();
    let mut attempt = 0;
    loop {
        attempt += 1;
        let last_error = match client.health() {
            Ok(()) => {
                info!(attempts = attempt, "search index is ready");
                return Ok(());
            }
            Err(e) => e,
        };

        let elapsed = started.elapsed();
        if attempt >= policy.max_attempts || elapsed >= policy.timeout() {
            return Err(EvalError::Connectivity(format!(
                "gave up after {attempt} attempts in {}ms: {last_error}",
                elapsed.as_millis()
            )));
        }

        let delay = policy
            .backoff(attempt - 1)
            .min(policy.timeout().saturating_sub(elapsed));
        debug!(attempt, delay_ms = delay.as_millis() as u64, error = %last_error, "search index not ready");
        thread::sleep(delay);
    }
}

/// Elasticsearch REST client.
#[derive(Debug, Clone)]
pub struct ElasticClient {
    base_url: String,
    http: Client,
}

impl ElasticClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EvalError::Network(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request
            .send()
            .map_err(|e| EvalError::Network(e.to_string()))?;
        check_status(response)
    }

    fn send_json(&self, request: RequestBuilder) -> Result<Value> {
        self.send(request)?
            .json::<Value>()
            .map_err(|e| EvalError::Backend(format!("invalid response body: {e}")))
    }
}

fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(classify_status(status, &body))
}

fn classify_status(status: StatusCode, body: &str) -> EvalError {
    let reason = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["reason"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.to_string());
    if status == StatusCode::BAD_REQUEST {
        EvalError::MalformedQuery(reason)
    } else {
        EvalError::Backend(format!("{status}: {reason}"))
    }
}

/// Render records as a `_bulk` NDJSON body.
pub fn bulk_body(records: &[IndexedRecord]) -> String {
    let mut body = String::new();
    for record in records {
        let action = json!({ "index": { "_index": record.index } });
        // Value's Display is infallible JSON
        let _ = writeln!(body, "{action}");
        let _ = writeln!(body, "{}", record.source);
    }
    body
}

/// Count accepted and rejected items in a `_bulk` response.
pub fn summarize_bulk_response(response: &Value) -> BulkSummary {
    let mut summary = BulkSummary::default();
    let Some(items) = response["items"].as_array() else {
        return summary;
    };
    for item in items {
        let result = item
            .as_object()
            .and_then(|actions| actions.values().next())
            .cloned()
            .unwrap_or(Value::Null);
        let status = result["status"].as_u64().unwrap_or(0);
        if result.get("error").is_some() || !(200..300).contains(&status) {
            summary.failed += 1;
        } else {
            summary.indexed += 1;
        }
    }
    summary
}

/// Read the total hit count from a `_search` response.
///
/// Accepts both the object form (`{"value": n}`) and the bare number older
/// servers return.
pub fn total_hits(response: &Value) -> Result<u64> {
    let total = &response["hits"]["total"];
    total["value"]
        .as_u64()
        .or_else(|| total.as_u64())
        .ok_or_else(|| EvalError::Backend("search response has no hit total".to_string()))
}

/// Ask for an exact total and no documents.
pub fn count_request(body: &Value) -> Value {
    let mut body = match body {
        Value::Object(_) => body.clone(),
        _ => json!({}),
    };
    if let Value::Object(map) = &mut body {
        map.insert("track_total_hits".to_string(), Value::Bool(true));
        map.entry("size").or_insert(json!(0));
    }
    body
}

impl SearchClient for ElasticClient {
    fn health(&self) -> Result<()> {
        self.send(self.http.get(self.url("_cluster/health")))?;
        Ok(())
    }

    fn create_index(&self, index: &str) -> Result<()> {
        self.send(self.http.put(self.url(index)))?;
        debug!(index, "created index");
        Ok(())
    }

    fn index_exists(&self, index: &str) -> Result<bool> {
        let response = self
            .http
            .head(self.url(index))
            .send()
            .map_err(|e| EvalError::Network(e.to_string()))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(classify_status(status, "")),
        }
    }

    fn delete_index(&self, index: &str) -> Result<()> {
        self.send(self.http.delete(self.url(index)))?;
        debug!(index, "deleted index");
        Ok(())
    }

    fn bulk(&self, records: &[IndexedRecord]) -> Result<BulkSummary> {
        if records.is_empty() {
            return Ok(BulkSummary::default());
        }
        let response = self.send_json(
            self.http
                .post(self.url("_bulk"))
                .header("Content-Type", "application/x-ndjson")
                .body(bulk_body(records)),
        )?;
        let summary = summarize_bulk_response(&response);
        if summary.failed > 0 {
            warn!(failed = summary.failed, "bulk request rejected documents");
        }
        Ok(summary)
    }

    fn refresh(&self) -> Result<()> {
        self.send(self.http.post(self.url("_refresh")))?;
        Ok(())
    }

    fn count_hits(&self, index: &str, body: &Value) -> Result<u64> {
        let response = self.send_json(
            self.http
                .post(self.url(&format!("{index}/_search")))
                .json(&count_request(body)),
        )?;
        total_hits(&response)
    }
}
