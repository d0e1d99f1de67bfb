//! HTTP API against a live listener on an ephemeral port.

mod common;

use common::*;
use serde_json::{json, Value};
use std::sync::Arc;

use casefile::casefile as casefiles;
use casefile::chunk::WholeMessage;
use casefile::cluster::load_clusters;
use casefile::config::Config;
use casefile::embed_cmd::EmbeddingIndexer;
use casefile::enrich::EnrichmentWorker;
use casefile::ingest::{label_filter, IngestOptions, IngestionWorker};
use casefile::server::{router, AppState};
use casefile::vector_store::SqliteVectorStore;

/// Ingest the seeded mailbox, build Alice's casefile, embed it, and serve.
async fn serve_fixture(with_embeddings: bool) -> (tempfile::TempDir, String, String) {
    let (tmp, pool) = test_db().await;
    let store = test_store(&pool);
    let vectors = SqliteVectorStore::new(pool.clone());
    let mailbox = seeded_mailbox();
    let embedder = Arc::new(FakeEmbedder::new("fake/keywords@1"));

    IngestionWorker::new(
        &store,
        &mailbox,
        &vectors,
        label_filter(Vec::new()),
        IngestOptions {
            full: false,
            limit: None,
            page_size: 10,
            concurrency: 4,
            retry: no_retry(),
        },
    )
    .run()
    .await
    .unwrap();
    let clusters = load_clusters(&store).await.unwrap();
    let alice = casefiles::create_from_cluster(&pool, &clusters[0], Some("Flat"))
        .await
        .unwrap();
    EnrichmentWorker::new(&store, &mailbox, &vectors, &WholeMessage, no_retry(), "w1")
        .run(&alice.casefile_id)
        .await
        .unwrap();
    EmbeddingIndexer::new(&store, &vectors, embedder.as_ref(), no_retry(), "w1")
        .run(&alice.casefile_id, false)
        .await
        .unwrap();

    let provider: Option<Arc<dyn casefile::embedding::EmbeddingProvider>> = if with_embeddings {
        Some(embedder)
    } else {
        None
    };
    let state = AppState::new(
        Config::with_db_path(tmp.path().join("data/cf.sqlite")),
        pool,
        provider,
        Arc::new(FakeGenerator { broken: false }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });

    (tmp, base, alice.casefile_id)
}

#[tokio::test]
async fn test_health() {
    let (_tmp, base, _) = serve_fixture(true).await;
    let body: Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_clusters_endpoint() {
    let (_tmp, base, _) = serve_fixture(true).await;
    let body: Value = reqwest::get(format!("{}/clusters", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let clusters = body["clusters"].as_array().unwrap();
    assert_eq!(clusters.len(), 2);
    assert_eq!(clusters[0]["domain"], "x.com");
    assert_eq!(clusters[0]["message_count"], 3);
}

#[tokio::test]
async fn test_status_endpoint() {
    let (_tmp, base, id) = serve_fixture(true).await;
    let resp = reqwest::get(format!("{}/casefiles/{}/status", base, id))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["name"], "Flat");
    assert_eq!(body["members"], 3);
    assert_eq!(body["coverage"]["embedded"], 3);
    assert_eq!(body["ready"], true);

    let resp = reqwest::get(format!("{}/casefiles/nope/status", base))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_ask_endpoint() {
    let (_tmp, base, id) = serve_fixture(true).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/casefiles/{}/ask", base, id))
        .json(&json!({ "query": "When does the lease start?", "k": 2 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["chunks"].as_array().unwrap().len(), 2);
    assert_eq!(body["chunks"][0]["citation"]["message_id"], "a1");
    assert_eq!(body["text"], "Based on 2 excerpt(s).");

    let resp = client
        .post(format!("{}/casefiles/{}/ask", base, id))
        .json(&json!({ "query": "  " }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    let resp = client
        .post(format!("{}/casefiles/{}/ask", base, id))
        .json(&json!({ "query": "lease", "k": 0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
    assert_eq!(body["error"]["message"], "k must be >= 1");

    let resp = client
        .post(format!("{}/casefiles/nope/ask", base))
        .json(&json!({ "query": "lease" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_ask_without_embeddings() {
    let (_tmp, base, id) = serve_fixture(false).await;
    let resp = reqwest::Client::new()
        .post(format!("{}/casefiles/{}/ask", base, id))
        .json(&json!({ "query": "lease" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "embeddings_disabled");
}
