//! End-to-end tests: SQL source -> queue -> bulk indexing -> secured search

use searchgate_core::config::{Config, SourceConfig};
use searchgate_core::domain::queue::{ChangeKind, EntityRef};
use searchgate_core::domain::scheduler::TickOutcome;
use searchgate_core::domain::search::{BackendKind, SearchContext};
use searchgate_core::domain::security::Principal;
use searchgate_core::infrastructure::backend::HttpSearchBackend;
use searchgate_core::storage::Database;
use searchgate_core::{Error, prelude::Searchgate};
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn orders_db() -> Database {
    let db = Database::in_memory().await.unwrap();
    sqlx::query(
        "CREATE TABLE orders (id INTEGER PRIMARY KEY, number TEXT, comment TEXT, owner TEXT)",
    )
    .execute(db.pool())
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO orders (id, number, comment, owner) VALUES
            (1, 'SO-001', 'acme rush', 'alice'),
            (2, 'SO-002', 'acme later', 'bob'),
            (3, 'SO-003', 'acme standard', 'alice')",
    )
    .execute(db.pool())
    .await
    .unwrap();
    db
}

async fn app(server: &MockServer) -> Searchgate {
    let mut config = Config::default();
    config.search.backend = BackendKind::OpenSearch;
    config.search.url = server.uri();
    config.search.retry_max_attempts = 1;
    config.sources.push(
        SourceConfig::new("sales_Order", "orders")
            .with_name_column("number")
            .with_fields(&["comment"])
            .with_row_policy("owner = :principal"),
    );

    let backend = HttpSearchBackend::builder()
        .kind(BackendKind::OpenSearch)
        .base_url(server.uri())
        .build()
        .unwrap();

    Searchgate::assemble(config, orders_db().await, Arc::new(backend)).unwrap()
}

async fn enqueue(app: &Searchgate, id: &str, kind: ChangeKind) {
    let mut tx = app.database().pool().begin().await.unwrap();
    app.queue()
        .enqueue(&mut *tx, &EntityRef::new("sales_Order", id), kind)
        .await
        .unwrap();
    tx.commit().await.unwrap();
}

fn bulk_ok(items: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "errors": false, "items": items }))
}

#[tokio::test]
async fn test_queue_drain_writes_current_state() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .respond_with(bulk_ok(json!([
            { "index": { "_index": "search_index_sales_order", "_id": "1", "status": 201 } },
            { "index": { "_index": "search_index_sales_order", "_id": "3", "status": 200 } },
            { "delete": { "_index": "search_index_sales_order", "_id": "99", "status": 404, "result": "not_found" } }
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let app = app(&server).await;
    enqueue(&app, "1", ChangeKind::Created).await;
    enqueue(&app, "3", ChangeKind::Updated).await;
    enqueue(&app, "99", ChangeKind::Updated).await;

    let processed = app.queue().process_queue(10, 100).await.unwrap();
    assert_eq!(processed, 3);
    assert_eq!(app.queue().depth(None).await.unwrap(), 0);

    let requests = server.received_requests().await.unwrap();
    let body = String::from_utf8_lossy(&requests[0].body).to_string();
    let lines: Vec<&str> = body.lines().collect();
    assert_eq!(lines.len(), 5);
    assert!(lines[1].contains("\"_instance_name\":\"SO-001\""));
    assert!(lines[1].contains("acme rush"));
    assert!(lines[4].contains("\"delete\""));
}

#[tokio::test]
async fn test_backend_outage_keeps_items_queued() {
    let server = MockServer::start().await;
    Mock::given(path("/_bulk"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let app = app(&server).await;
    enqueue(&app, "1", ChangeKind::Created).await;

    let result = app.queue().process_queue(10, 100).await;
    assert!(matches!(result, Err(Error::BackendUnavailable { status: 503, .. })));

    let stats = app.queue().stats().await.unwrap();
    assert_eq!(stats[0].pending, 1);
    assert_eq!(stats[0].retried, 1);
}

#[tokio::test]
async fn test_scheduler_tick_drains_queue() {
    let server = MockServer::start().await;
    Mock::given(path("/_bulk"))
        .respond_with(bulk_ok(json!([
            { "index": { "_index": "search_index_sales_order", "_id": "2", "status": 200 } }
        ])))
        .mount(&server)
        .await;

    let app = app(&server).await;
    enqueue(&app, "2", ChangeKind::Updated).await;

    match app.scheduler().tick().await {
        TickOutcome::Processed(report) => assert_eq!(report.processed, 1),
        other => panic!("unexpected tick outcome: {:?}", other),
    }
    assert_eq!(app.queue().depth(None).await.unwrap(), 0);
}

#[tokio::test]
async fn test_search_hides_rows_outside_policy() {
    let server = MockServer::start().await;
    let hit = |id: &str, name: &str| {
        json!({
            "_index": "search_index_sales_order",
            "_id": id,
            "_score": 1.0,
            "_source": { "_instance_name": name, "_entity_type": "sales_Order" },
            "highlight": { "comment": ["<b>acme</b>"] }
        })
    };
    Mock::given(method("POST"))
        .and(path("/search_index_sales_order/_search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_shards": { "total": 1 },
            "hits": {
                "total": { "value": 3, "relation": "eq" },
                "hits": [hit("1", "SO-001"), hit("2", "SO-002"), hit("3", "SO-003")]
            }
        })))
        .mount(&server)
        .await;

    let app = app(&server).await;

    let alice = app
        .searcher()
        .search(SearchContext::new("acme", Principal::user("alice")))
        .await
        .unwrap();
    let ids: Vec<&str> = alice.entries.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["1", "3"]);
    assert_eq!(alice.entries[0].display_name, "SO-001");
    assert!(!alice.more_data_available);

    let system = app
        .searcher()
        .search(SearchContext::new("acme", Principal::system()))
        .await
        .unwrap();
    assert_eq!(system.entries.len(), 3);
}
