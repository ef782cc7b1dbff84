//! HTTP client for Elasticsearch and OpenSearch

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client as HttpClient, RequestBuilder};
use serde_json::{Value, json};
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::config::SearchConfig;
use crate::domain::search::{
    BackendHealth, BackendKind, BulkItemResult, BulkOperation, SearchBackend, SearchRequest,
    SearchResponse, is_index_name_safe,
};
use crate::error::{Error, Result};

/// Default backend URL
pub const DEFAULT_BASE_URL: &str = "http://localhost:9200";

/// Default request timeout in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 30;

const ES_JSON: &str = "application/vnd.elasticsearch+json; compatible-with=8";
const ES_NDJSON: &str = "application/vnd.elasticsearch+x-ndjson; compatible-with=8";
const OS_JSON: &str = "application/json";
const OS_NDJSON: &str = "application/x-ndjson";

/// Builder for [`HttpSearchBackend`]
pub struct HttpSearchBackendBuilder {
    kind: BackendKind,
    base_url: Option<String>,
    username: Option<String>,
    password: Option<String>,
    timeout_secs: Option<u64>,
}

impl Default for HttpSearchBackendBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpSearchBackendBuilder {
    pub fn new() -> Self {
        Self {
            kind: BackendKind::Elasticsearch,
            base_url: None,
            username: None,
            password: None,
            timeout_secs: None,
        }
    }

    /// Set the server flavour
    pub fn kind(mut self, kind: BackendKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set the base URL (defaults to `http://localhost:9200`)
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Use HTTP basic authentication
    pub fn credentials(mut self, username: impl Into<String>, password: Option<String>) -> Self {
        self.username = Some(username.into());
        self.password = password;
        self
    }

    /// Set the request timeout
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn build(self) -> Result<HttpSearchBackend> {
        let base_url = self
            .base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(Error::ConfigError(format!(
                "Search backend URL must start with http:// or https://, got '{}'",
                base_url
            )));
        }

        let timeout_secs = self.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS);
        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(Error::NetworkError)?;

        Ok(HttpSearchBackend {
            http_client,
            kind: self.kind,
            base_url,
            username: self.username,
            password: self.password,
        })
    }
}

/// Search backend speaking the Elasticsearch REST API
#[derive(Clone)]
pub struct HttpSearchBackend {
    http_client: HttpClient,
    kind: BackendKind,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

impl fmt::Debug for HttpSearchBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSearchBackend")
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl HttpSearchBackend {
    pub fn builder() -> HttpSearchBackendBuilder {
        HttpSearchBackendBuilder::new()
    }

    /// Build a client from configuration; the password comes from the environment
    pub fn from_config(config: &SearchConfig) -> Result<Self> {
        let password = config
            .resolved_password()
            .map_err(|e| Error::ConfigError(e.to_string()))?;

        let mut builder = Self::builder()
            .kind(config.backend)
            .base_url(&config.url)
            .timeout_secs(config.request_timeout_secs);
        if let Some(username) = &config.username {
            builder = builder.credentials(username, password);
        }
        builder.build()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn json_type(&self) -> &'static str {
        match self.kind {
            BackendKind::Elasticsearch => ES_JSON,
            BackendKind::OpenSearch => OS_JSON,
        }
    }

    fn ndjson_type(&self) -> &'static str {
        match self.kind {
            BackendKind::Elasticsearch => ES_NDJSON,
            BackendKind::OpenSearch => OS_NDJSON,
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.username {
            Some(username) => request.basic_auth(username, self.password.as_deref()),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Value> {
        let response = self
            .authorize(request)
            .header(ACCEPT, self.json_type())
            .send()
            .await
            .map_err(Error::NetworkError)?;

        let status = response.status();
        if !status.is_success() {
            return handle_error_response(status, response).await;
        }

        response
            .json()
            .await
            .map_err(|e| Error::SearchFailed(format!("Failed to parse response: {}", e)))
    }
}

#[async_trait]
impl SearchBackend for HttpSearchBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        if request.indices.is_empty() {
            return Err(Error::InvalidInput(
                "search request names no index".to_string(),
            ));
        }
        if let Some(bad) = request.indices.iter().find(|i| !is_index_name_safe(i)) {
            return Err(Error::InvalidInput(format!("invalid index name '{}'", bad)));
        }
        let url = format!(
            "{}/{}/_search?ignore_unavailable=true&allow_no_indices=true",
            self.base_url,
            request.indices.join(",")
        );

        debug!(indices = ?request.indices, "Sending search request");

        let body = self
            .send(
                self.http_client
                    .post(&url)
                    .header(CONTENT_TYPE, self.json_type())
                    .body(serde_json::to_vec(&request.body)?),
            )
            .await?;

        SearchResponse::from_json(&body)
    }

    async fn bulk(&self, operations: &[BulkOperation]) -> Result<Vec<BulkItemResult>> {
        if operations.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/_bulk", self.base_url);

        debug!(operations = operations.len(), "Sending bulk request");

        let body = self
            .send(
                self.http_client
                    .post(&url)
                    .header(CONTENT_TYPE, self.ndjson_type())
                    .body(bulk_body(operations)?),
            )
            .await?;

        let items = body
            .get("items")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::IndexingFailed("bulk response has no 'items'".to_string()))?;
        if items.len() != operations.len() {
            return Err(Error::IndexingFailed(format!(
                "bulk response has {} items for {} operations",
                items.len(),
                operations.len()
            )));
        }

        Ok(operations
            .iter()
            .zip(items)
            .map(|(op, item)| parse_bulk_item(op, item))
            .collect())
    }

    async fn health(&self) -> Result<BackendHealth> {
        let body = self.send(self.http_client.get(&self.base_url)).await?;
        let version = body.get("version");

        Ok(BackendHealth {
            kind: self.kind,
            cluster_name: body
                .get("cluster_name")
                .and_then(Value::as_str)
                .map(str::to_string),
            version: version
                .and_then(|v| v.get("number"))
                .and_then(Value::as_str)
                .map(str::to_string),
            distribution: version
                .and_then(|v| v.get("distribution"))
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

/// NDJSON body: one action line, plus a source line for index operations
fn bulk_body(operations: &[BulkOperation]) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    for op in operations {
        let action = match op {
            BulkOperation::Index { index, id, .. } => {
                json!({ "index": { "_index": index, "_id": id } })
            }
            BulkOperation::Delete { index, id } => {
                json!({ "delete": { "_index": index, "_id": id } })
            }
        };
        serde_json::to_writer(&mut body, &action)?;
        body.push(b'\n');
        if let BulkOperation::Index { document, .. } = op {
            serde_json::to_writer(&mut body, document)?;
            body.push(b'\n');
        }
    }
    Ok(body)
}

fn parse_bulk_item(op: &BulkOperation, item: &Value) -> BulkItemResult {
    // Each item is keyed by its action name
    let detail = item
        .as_object()
        .and_then(|obj| obj.values().next())
        .cloned()
        .unwrap_or(Value::Null);

    let status = detail.get("status").and_then(Value::as_u64).unwrap_or(0) as u16;
    let error = detail.get("error").map(|e| {
        e.get("reason")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| e.to_string())
    });

    BulkItemResult {
        index: detail
            .get("_index")
            .and_then(Value::as_str)
            .unwrap_or(op.index())
            .to_string(),
        id: detail
            .get("_id")
            .and_then(Value::as_str)
            .unwrap_or(op.id())
            .to_string(),
        status,
        not_found: detail.get("result").and_then(Value::as_str) == Some("not_found"),
        error,
    }
}

/// Map a non-success response onto the error taxonomy
async fn handle_error_response<T>(
    status: reqwest::StatusCode,
    response: reqwest::Response,
) -> Result<T> {
    let body = response.text().await.unwrap_or_default();
    let reason = error_reason(&body);

    match status.as_u16() {
        429 | 500..=599 => Err(Error::BackendUnavailable {
            status: status.as_u16(),
            message: reason,
        }),
        401 => Err(Error::SearchFailed(format!(
            "Unauthorized: check search.username and SEARCHGATE_BACKEND_PASSWORD ({})",
            reason
        ))),
        403 => Err(Error::SearchFailed(format!("Forbidden: {}", reason))),
        400 => Err(Error::SearchFailed(format!("Bad request: {}", reason))),
        _ => Err(Error::SearchFailed(format!("HTTP error {}: {}", status, reason))),
    }
}

/// `error.reason` from an error body, or the raw body
fn error_reason(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            let error = v.get("error")?;
            error
                .get("reason")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| error.as_str().map(str::to_string))
        })
        .unwrap_or_else(|| body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{basic_auth, body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn backend(server: &MockServer, kind: BackendKind) -> HttpSearchBackend {
        HttpSearchBackend::builder()
            .kind(kind)
            .base_url(server.uri())
            .timeout_secs(5)
            .build()
            .unwrap()
    }

    fn request(index: &str) -> SearchRequest {
        SearchRequest {
            indices: vec![index.to_string()],
            body: json!({ "from": 0, "size": 10, "query": { "match_all": {} } }),
        }
    }

    #[test]
    fn test_builder_rejects_bad_url() {
        let result = HttpSearchBackend::builder().base_url("localhost:9200").build();
        assert!(matches!(result, Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_debug_redacts_password() {
        let backend = HttpSearchBackend::builder()
            .credentials("elastic", Some("hunter2".into()))
            .build()
            .unwrap();
        let rendered = format!("{:?}", backend);
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_bulk_body_lines() {
        let ops = vec![
            BulkOperation::Index {
                index: "i".into(),
                id: "1".into(),
                document: json!({ "name": "acme" }),
            },
            BulkOperation::Delete {
                index: "i".into(),
                id: "2".into(),
            },
        ];
        let body = String::from_utf8(bulk_body(&ops).unwrap()).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("\"index\""));
        assert_eq!(lines[1], r#"{"name":"acme"}"#);
        assert!(lines[2].contains("\"delete\""));
        assert!(body.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_search_parses_hits() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search_index_order/_search"))
            .and(query_param("ignore_unavailable", "true"))
            .and(header("content-type", OS_JSON))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "_shards": { "total": 1 },
                "hits": {
                    "total": { "value": 1, "relation": "eq" },
                    "hits": [{
                        "_index": "search_index_order",
                        "_id": "o-1",
                        "_score": 1.5,
                        "_source": { "_instance_name": "Order 1" },
                        "highlight": { "comment": ["<b>acme</b>"] }
                    }]
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = backend(&server, BackendKind::OpenSearch)
            .search(&request("search_index_order"))
            .await
            .unwrap();

        assert_eq!(response.total_hits, 1);
        assert_eq!(response.shards_total, 1);
        assert_eq!(response.hits[0].id, "o-1");
    }

    #[tokio::test]
    async fn test_search_rejects_unsafe_index_names() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let backend = backend(&server, BackendKind::OpenSearch);
        for index in ["search_index_a/b", "search_index_a#b", "search_index_a?b"] {
            let result = backend.search(&request(index)).await;
            assert!(matches!(result, Err(Error::InvalidInput(_))), "{index}");
        }
    }

    #[tokio::test]
    async fn test_elasticsearch_uses_compat_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("content-type", ES_JSON))
            .and(header("accept", ES_JSON))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "_shards": { "total": 0 },
                "hits": { "total": { "value": 0 }, "hits": [] }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = backend(&server, BackendKind::Elasticsearch)
            .search(&request("missing"))
            .await
            .unwrap();
        assert_eq!(response.shards_total, 0);
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start().await;
        Mock::given(path("/busy/_search"))
            .respond_with(ResponseTemplate::new(503).set_body_json(json!({
                "error": { "type": "unavailable", "reason": "cluster busy" }
            })))
            .mount(&server)
            .await;
        Mock::given(path("/broken/_search"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": { "type": "parsing_exception", "reason": "unknown query" }
            })))
            .mount(&server)
            .await;

        let backend = backend(&server, BackendKind::OpenSearch);

        let busy = backend.search(&request("busy")).await.unwrap_err();
        assert!(busy.is_transient());
        assert!(matches!(
            busy,
            Error::BackendUnavailable { status: 503, ref message } if message == "cluster busy"
        ));

        let broken = backend.search(&request("broken")).await.unwrap_err();
        assert!(!broken.is_transient());
        assert!(broken.to_string().contains("unknown query"));
    }

    #[tokio::test]
    async fn test_bulk_results_in_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .and(header("content-type", OS_NDJSON))
            .and(body_string_contains("\"delete\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errors": true,
                "items": [
                    { "index": { "_index": "i", "_id": "1", "status": 201, "result": "created" } },
                    { "delete": { "_index": "i", "_id": "2", "status": 404, "result": "not_found" } },
                    { "index": { "_index": "i", "_id": "3", "status": 400,
                                 "error": { "type": "mapper_parsing_exception", "reason": "bad field" } } }
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let ops = vec![
            BulkOperation::Index {
                index: "i".into(),
                id: "1".into(),
                document: json!({}),
            },
            BulkOperation::Delete {
                index: "i".into(),
                id: "2".into(),
            },
            BulkOperation::Index {
                index: "i".into(),
                id: "3".into(),
                document: json!({}),
            },
        ];

        let results = backend(&server, BackendKind::OpenSearch)
            .bulk(&ops)
            .await
            .unwrap();

        assert!(results[0].is_success());
        assert!(results[1].is_success() && results[1].not_found);
        assert!(!results[2].is_success());
        assert_eq!(results[2].error.as_deref(), Some("bad field"));
    }

    #[tokio::test]
    async fn test_bulk_item_count_mismatch_fails() {
        let server = MockServer::start().await;
        Mock::given(path("/_bulk"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "items": [] })))
            .mount(&server)
            .await;

        let ops = vec![BulkOperation::Delete {
            index: "i".into(),
            id: "1".into(),
        }];
        let result = backend(&server, BackendKind::OpenSearch).bulk(&ops).await;
        assert!(matches!(result, Err(Error::IndexingFailed(_))));
    }

    #[tokio::test]
    async fn test_health_with_basic_auth() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .and(basic_auth("admin", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "cluster_name": "docker-cluster",
                "version": { "distribution": "opensearch", "number": "2.11.0" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let backend = HttpSearchBackend::builder()
            .kind(BackendKind::OpenSearch)
            .base_url(server.uri())
            .credentials("admin", Some("secret".into()))
            .build()
            .unwrap();

        let health = backend.health().await.unwrap();
        assert_eq!(health.cluster_name.as_deref(), Some("docker-cluster"));
        assert_eq!(health.version.as_deref(), Some("2.11.0"));
        assert!(health.matches_kind());
    }
}
