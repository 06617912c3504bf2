//! A full refresh round trip: fake upstream mirror, HTTP fetcher, updater,
//! and the downstream server reading the result.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use axum_test::TestServer;
use sigmirror::cvd::build_cvd;
use sigmirror::fetcher::{HttpFetcher, RetryPolicy};
use sigmirror::mirror::MirrorDir;
use sigmirror::oracle::NoOracle;
use sigmirror::server::{router, ServerState};
use sigmirror::store::VersionStore;
use sigmirror::types::{LocalVersion, VersionRecord};
use sigmirror::updater::{CycleOutcome, Updater, UpdaterSettings};

type Files = Arc<Mutex<HashMap<String, Vec<u8>>>>;

async fn upstream_file(State(files): State<Files>, Path(file): Path<String>) -> Response {
    match files.lock().unwrap().get(&file) {
        Some(bytes) => bytes.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn start_upstream(files: Files) -> String {
    let app = Router::new()
        .route("/{file}", get(upstream_file))
        .with_state(files);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn mirrors_full_database_then_diffs() {
    let files: Files = Arc::default();
    files
        .lock()
        .unwrap()
        .insert("daily.cvd".into(), build_cvd(27000, b"daily signatures").unwrap());
    let upstream = start_upstream(Arc::clone(&files)).await;

    let dir = tempfile::tempdir().unwrap();
    let mirror = MirrorDir::new(dir.path());
    mirror.prepare().await.unwrap();
    let store = Arc::new(VersionStore::new(dir.path()));
    let fetcher = HttpFetcher::new(
        &upstream,
        "sigmirror-test",
        RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(5),
        },
        Duration::from_secs(5),
    )
    .unwrap();
    let updater = Updater::new(
        Arc::clone(&store),
        mirror.clone(),
        Arc::new(fetcher),
        Arc::new(NoOracle),
        UpdaterSettings {
            diff_count_threshold: 100,
            diff_retention: 10,
        },
    );
    let downstream = TestServer::new(router(ServerState::new(
        mirror,
        Arc::clone(&store),
        &["daily".to_string()],
    )))
    .unwrap();

    // Nothing is served before the first cycle.
    assert_eq!(downstream.get("/daily.cvd").await.status_code(), 404);

    assert_eq!(
        updater.run_cycle("daily").await,
        CycleOutcome::Full { version: 27000 }
    );
    let resp = downstream.get("/daily.cvd").await;
    assert_eq!(resp.status_code(), 200);
    assert_eq!(
        resp.as_bytes().as_ref(),
        build_cvd(27000, b"daily signatures").unwrap().as_slice()
    );

    {
        let mut files = files.lock().unwrap();
        files.insert("daily-27001.cdiff".into(), b"diff one".to_vec());
        files.insert("daily-27002.cdiff".into(), b"diff two".to_vec());
    }
    assert_eq!(
        updater.run_cycle("daily").await,
        CycleOutcome::Diffs {
            version: 27002,
            applied: 2,
            diff_count: 2
        }
    );
    let resp = downstream.get("/daily-27002.cdiff").await;
    assert_eq!(resp.status_code(), 200);
    assert_eq!(resp.as_bytes().as_ref(), b"diff two");

    let records: Vec<VersionRecord> = downstream.get("/versions").await.json();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].version, 27002);
    assert_eq!(records[0].diff_count, 2);
    assert_eq!(records[0].full_version, 27000);
}

#[tokio::test]
async fn unreachable_upstream_keeps_serving_last_version() {
    let files: Files = Arc::default();
    files
        .lock()
        .unwrap()
        .insert("main.cvd".into(), build_cvd(62, b"main signatures").unwrap());
    let upstream = start_upstream(Arc::clone(&files)).await;

    let dir = tempfile::tempdir().unwrap();
    let mirror = MirrorDir::new(dir.path());
    mirror.prepare().await.unwrap();
    let store = Arc::new(VersionStore::new(dir.path()));
    let fetcher = HttpFetcher::new(
        &upstream,
        "sigmirror-test",
        RetryPolicy {
            max_retries: 0,
            base_delay: Duration::from_millis(1),
        },
        Duration::from_secs(5),
    )
    .unwrap();
    let updater = Updater::new(
        Arc::clone(&store),
        mirror.clone(),
        Arc::new(fetcher),
        Arc::new(NoOracle),
        UpdaterSettings::default(),
    );
    updater.run_cycle("main").await;

    // The upstream loses everything: no diffs, no full database.
    files.lock().unwrap().clear();
    let outcome = updater.run_cycle("main").await;
    assert!(matches!(outcome, CycleOutcome::Failed { .. }), "{outcome:?}");
    assert_eq!(
        store.current_version("main").await.unwrap(),
        LocalVersion::Known {
            version: 62,
            diff_count: 0
        }
    );

    let downstream =
        TestServer::new(router(ServerState::new(mirror, store, &["main".to_string()]))).unwrap();
    let resp = downstream.get("/main.cvd").await;
    assert_eq!(resp.status_code(), 200);
    assert_eq!(
        resp.as_bytes().as_ref(),
        build_cvd(62, b"main signatures").unwrap().as_slice()
    );
}
