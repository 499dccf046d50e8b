//! Client engine against a live table service over loopback HTTP.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use tablesync_client::{
    ClientError, PullOptions, PullRequest, PushOptions, SyncEngine, SynchronizeOptions,
    TableRegistration,
};
use tablesync_core::memory::{MemoryDeltaTokenStore, MemoryLocalStore};
use tablesync_core::{DeltaTokenStore, LocalStore};
use tablesync_server::{router, AppState};
use tablesync_storage_sqlite::SqliteSyncStore;

async fn spawn_server() -> String {
    let state = Arc::new(AppState::new());
    state.store.define_table("movies", true);
    let app = router().with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/")
}

fn movie_registration() -> TableRegistration {
    TableRegistration::new("movies", ["id", "updatedAt", "version", "deleted", "title"])
}

struct Harness {
    engine: SyncEngine,
    local: Arc<MemoryLocalStore>,
    delta: Arc<MemoryDeltaTokenStore>,
    base: String,
    http: reqwest::Client,
}

async fn harness() -> Harness {
    let base = spawn_server().await;
    let local = Arc::new(MemoryLocalStore::new());
    let delta = Arc::new(MemoryDeltaTokenStore::new());
    let sqlite = Arc::new(SqliteSyncStore::open_in_memory().unwrap());

    let engine = SyncEngine::builder(base.clone())
        .register(movie_registration())
        .local_store(Arc::clone(&local) as Arc<dyn LocalStore>)
        .queue_store(sqlite)
        .delta_store(Arc::clone(&delta) as Arc<dyn DeltaTokenStore>)
        .build()
        .unwrap();

    Harness {
        engine,
        local,
        delta,
        base,
        http: reqwest::Client::new(),
    }
}

fn token() -> CancellationToken {
    CancellationToken::new()
}

#[tokio::test]
async fn push_creates_and_writes_back_the_server_copy() {
    let hx = harness().await;
    hx.engine
        .insert("movies", json!({"id": "e1", "title": "Local"}))
        .unwrap();
    hx.engine.save_changes(&token()).await.unwrap();

    let result = hx
        .engine
        .push(&[], &PushOptions::default(), &token())
        .await
        .unwrap();
    assert!(result.is_successful(), "{:?}", result.failed_requests);
    assert_eq!(result.completed_operations, 1);
    assert!(hx.engine.pending_operations().unwrap().is_empty());

    // The local row now carries the server's system fields.
    let row = hx.local.get("movies", "e1").unwrap().unwrap();
    assert!(row["version"].as_str().is_some());
    assert!(row["updatedAt"].as_str().is_some());
    assert_eq!(row["deleted"], json!(false));

    // And the server agrees.
    let server_row: Value = hx
        .http
        .get(format!("{}tables/movies/e1", hx.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(server_row["title"], json!("Local"));
    assert_eq!(server_row["version"], row["version"]);
}

#[tokio::test]
async fn pull_ingests_server_changes_and_soft_deletes() {
    let hx = harness().await;

    hx.http
        .post(format!("{}tables/movies", hx.base))
        .json(&json!({"id": "s1", "title": "Server"}))
        .send()
        .await
        .unwrap();

    let result = hx
        .engine
        .pull(
            vec![PullRequest::new("movies")],
            &PullOptions::default(),
            &token(),
        )
        .await
        .unwrap();
    assert!(result.is_successful());
    assert_eq!(result.items_applied, 1);
    assert!(hx.local.get("movies", "s1").unwrap().is_some());
    let first_token = hx.delta.get("movies").unwrap();
    assert!(first_token > tablesync_core::epoch());

    // Millisecond timestamps: make sure the delete lands in a later window.
    tokio::time::sleep(Duration::from_millis(5)).await;
    hx.http
        .delete(format!("{}tables/movies/s1", hx.base))
        .send()
        .await
        .unwrap();

    let result = hx
        .engine
        .pull(
            vec![PullRequest::new("movies")],
            &PullOptions::default(),
            &token(),
        )
        .await
        .unwrap();
    assert!(result.is_successful());
    // The soft delete propagated as a local deletion.
    assert!(hx.local.get("movies", "s1").unwrap().is_none());
    assert!(hx.delta.get("movies").unwrap() > first_token);
}

#[tokio::test]
async fn synchronize_pushes_before_pulling() {
    let hx = harness().await;

    // One local change and one server-only row.
    hx.engine
        .insert("movies", json!({"id": "mine", "title": "Mine"}))
        .unwrap();
    hx.engine.save_changes(&token()).await.unwrap();
    hx.http
        .post(format!("{}tables/movies", hx.base))
        .json(&json!({"id": "theirs", "title": "Theirs"}))
        .send()
        .await
        .unwrap();

    let result = hx
        .engine
        .synchronize(&SynchronizeOptions::default(), &token())
        .await
        .unwrap();
    assert!(result.is_successful());
    assert_eq!(result.push.completed_operations, 1);

    // Both rows are local after the pull, including the pushed one.
    assert!(hx.local.get("movies", "mine").unwrap().is_some());
    assert!(hx.local.get("movies", "theirs").unwrap().is_some());
    assert!(hx.engine.pending_operations().unwrap().is_empty());
}

#[tokio::test]
async fn conflicting_create_surfaces_the_server_entity() {
    let hx = harness().await;
    hx.http
        .post(format!("{}tables/movies", hx.base))
        .json(&json!({"id": "c1", "title": "Server wins"}))
        .send()
        .await
        .unwrap();

    hx.engine
        .insert("movies", json!({"id": "c1", "title": "Client hopes"}))
        .unwrap();
    hx.engine.save_changes(&token()).await.unwrap();

    let result = hx
        .engine
        .push(&[], &PushOptions::default(), &token())
        .await
        .unwrap();
    assert!(!result.is_successful());
    let failure = &result.failed_requests["c1"];
    assert_eq!(failure.status_code(), Some(409));
    assert!(failure.is_conflict());
    assert_eq!(
        failure.server_entity().unwrap()["title"],
        json!("Server wins")
    );

    // The operation stays queued for resolution.
    let pending = hx.engine.pending_operations().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].http_status_code, Some(409));
}

#[tokio::test]
async fn replace_conflict_then_resolve_with_server_version() {
    let hx = harness().await;

    // Seed through the engine so client and server share the row.
    hx.engine
        .insert("movies", json!({"id": "r1", "title": "v0"}))
        .unwrap();
    hx.engine.save_changes(&token()).await.unwrap();
    hx.engine
        .push(&[], &PushOptions::default(), &token())
        .await
        .unwrap();

    // Another client replaces it server-side.
    let row = hx.local.get("movies", "r1").unwrap().unwrap();
    let stale_version = row["version"].as_str().unwrap().to_string();
    hx.http
        .put(format!("{}tables/movies/r1", hx.base))
        .header("if-match", format!("\"{stale_version}\""))
        .json(&json!({"title": "other-client"}))
        .send()
        .await
        .unwrap();

    // Our replace with the stale version now fails with 412.
    hx.engine
        .update(
            "movies",
            json!({"id": "r1", "title": "ours", "version": stale_version}),
        )
        .unwrap();
    hx.engine.save_changes(&token()).await.unwrap();
    let result = hx
        .engine
        .push(&[], &PushOptions::default(), &token())
        .await
        .unwrap();
    let failure = &result.failed_requests["r1"];
    assert_eq!(failure.status_code(), Some(412));
    let server_entity = failure.server_entity().unwrap().clone();
    assert_eq!(server_entity["title"], json!("other-client"));

    // Resolving with the server's version lets the push succeed.
    hx.engine
        .update(
            "movies",
            json!({
                "id": "r1",
                "title": "merged",
                "version": server_entity["version"].as_str().unwrap()
            }),
        )
        .unwrap();
    hx.engine.save_changes(&token()).await.unwrap();
    let result = hx
        .engine
        .push(&[], &PushOptions::default(), &token())
        .await
        .unwrap();
    assert!(result.is_successful(), "{:?}", result.failed_requests);

    let server_row: Value = hx
        .http
        .get(format!("{}tables/movies/r1", hx.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(server_row["title"], json!("merged"));
}

#[tokio::test]
async fn remote_table_direct_crud_and_cache_validation() {
    let hx = harness().await;
    let table = hx.engine.remote_table("movies").unwrap();

    let created = table
        .create(&json!({"id": "d1", "title": "Direct"}), &token())
        .await
        .unwrap();
    let version = created["version"].as_str().unwrap().to_string();

    // The cached version is current, so the conditional read short-circuits.
    assert_eq!(
        table.read_if_newer("d1", &version, &token()).await.unwrap(),
        None
    );

    let replaced = table
        .replace(
            &json!({"id": "d1", "title": "Direct 2", "version": version}),
            &token(),
        )
        .await
        .unwrap();
    assert_eq!(replaced["title"], json!("Direct 2"));

    // Now the cached version is stale and the read returns the new copy.
    let refreshed = table
        .read_if_newer("d1", created["version"].as_str().unwrap(), &token())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(refreshed["title"], json!("Direct 2"));

    // A stale conditional replace is rejected with the server entity.
    let err = table
        .replace(
            &json!({"id": "d1", "title": "stale", "version": created["version"]}),
            &token(),
        )
        .await
        .unwrap_err();
    match err {
        ClientError::Service { status, response } => {
            assert_eq!(status, Some(412));
            assert_eq!(response.server_entity().unwrap()["title"], json!("Direct 2"));
        }
        other => panic!("expected a service error, got {other}"),
    }

    table
        .delete("d1", replaced["version"].as_str(), &token())
        .await
        .unwrap();
    let err = table.read("d1", &token()).await.unwrap_err();
    assert!(matches!(err, ClientError::Service { status: Some(410), .. }));

    // query_all pages through the whole set.
    for index in 0..120 {
        table
            .create(&json!({"id": format!("q{index:03}")}), &token())
            .await
            .unwrap();
    }
    let items = table
        .query_all(&tablesync_core::QueryDescription::new(), &token())
        .await
        .unwrap();
    assert_eq!(items.len(), 120);
}

#[tokio::test]
async fn pull_pages_through_large_result_sets() {
    let hx = harness().await;
    for index in 0..250 {
        let response = hx
            .http
            .post(format!("{}tables/movies", hx.base))
            .json(&json!({"id": format!("p{index:03}"), "title": format!("#{index}")}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 201);
    }

    let result = hx
        .engine
        .pull(
            vec![PullRequest::new("movies")],
            &PullOptions::default(),
            &token(),
        )
        .await
        .unwrap();
    assert!(result.is_successful());
    assert_eq!(result.items_applied, 250);
    assert_eq!(hx.local.rows("movies").len(), 250);
}
