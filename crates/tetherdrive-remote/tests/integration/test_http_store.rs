//! Integration tests for the HTTP remote store
//!
//! Verifies the wire contract of every store operation against a
//! wiremock-based device file service.

use std::time::Duration;

use serde_json::json;
use tetherdrive_core::domain::RelativePath;
use tetherdrive_core::ports::IRemoteStore;
use tetherdrive_remote::http::HttpRemoteStore;
use tetherdrive_remote::RemoteError;
use tokio::io::AsyncReadExt;
use wiremock::{
    matchers::{body_bytes, body_json, header, method, path, query_param},
    Mock, ResponseTemplate,
};

use crate::common::{self, rel};

// ============================================================================
// Listing and metadata
// ============================================================================

#[tokio::test]
async fn test_list_files_sends_path_and_kind() {
    let (server, store) = common::setup_store().await;

    Mock::given(method("GET"))
        .and(path("/fs/list"))
        .and(query_param("path", "/docs"))
        .and(query_param("kind", "file"))
        .and(header("authorization", "Bearer test-device-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "entries": [
                common::file_json("/docs/a.txt", 10),
                common::file_json("/docs/b.txt", 20),
                common::file_json("/elsewhere/c.txt", 30)
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let files = store.list_files(&rel("docs"), None).await.unwrap();

    let names: Vec<_> = files.iter().map(|e| e.relative_path.as_str()).collect();
    assert_eq!(names, vec!["docs/a.txt", "docs/b.txt"]);
    assert_eq!(files[1].length, 20);
}

#[tokio::test]
async fn test_list_directories_of_root_with_pattern() {
    let (server, store) = common::setup_store().await;

    Mock::given(method("GET"))
        .and(path("/fs/list"))
        .and(query_param("path", "/"))
        .and(query_param("kind", "directory"))
        .and(query_param("pattern", "DC*"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "entries": [common::dir_json("/DCIM")]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dirs = store
        .list_directories(&RelativePath::root(), Some("DC*"))
        .await
        .unwrap();

    assert_eq!(dirs.len(), 1);
    assert!(dirs[0].is_directory);
    assert_eq!(dirs[0].relative_path, rel("DCIM"));
}

#[tokio::test]
async fn test_metadata_found_and_missing() {
    let (server, store) = common::setup_store().await;

    Mock::given(method("GET"))
        .and(path("/fs/metadata"))
        .and(query_param("path", "/a.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(common::file_json("/a.txt", 7)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fs/metadata"))
        .and(query_param("path", "/gone.txt"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let entry = store.metadata(&rel("a.txt")).await.unwrap().unwrap();
    assert_eq!(entry.length, 7);
    assert!(store.metadata(&rel("gone.txt")).await.unwrap().is_none());
    assert!(!store.exists(&rel("gone.txt")).await.unwrap());
}

// ============================================================================
// Content transfer
// ============================================================================

#[tokio::test]
async fn test_open_read_sends_range_header() {
    let (server, store) = common::setup_store().await;

    Mock::given(method("GET"))
        .and(path("/fs/content"))
        .and(query_param("path", "/data.bin"))
        .and(header("range", "bytes=3-"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(b"3456789".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let mut reader = store.open_read(&rel("data.bin"), 3).await.unwrap();
    let mut data = Vec::new();
    reader.read_to_end(&mut data).await.unwrap();

    assert_eq!(data, b"3456789");
}

#[tokio::test]
async fn test_open_read_skips_when_range_is_ignored() {
    let (server, store) = common::setup_store().await;

    Mock::given(method("GET"))
        .and(path("/fs/content"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"0123456789".to_vec()))
        .mount(&server)
        .await;

    let mut reader = store.open_read(&rel("data.bin"), 4).await.unwrap();
    let mut data = Vec::new();
    reader.read_to_end(&mut data).await.unwrap();

    assert_eq!(data, b"456789");
}

#[tokio::test]
async fn test_upload_streams_file_body() {
    let (server, store) = common::setup_store().await;
    let local = tempfile::TempDir::new().unwrap();
    let source = local.path().join("report.txt");
    std::fs::write(&source, b"quarterly numbers").unwrap();

    Mock::given(method("PUT"))
        .and(path("/fs/content"))
        .and(query_param("path", "/work/report.txt"))
        .and(body_bytes(b"quarterly numbers".to_vec()))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    store
        .upload_file(&rel("work/report.txt"), &source)
        .await
        .unwrap();
}

// ============================================================================
// Namespace operations
// ============================================================================

#[tokio::test]
async fn test_create_directory_and_rename() {
    let (server, store) = common::setup_store().await;

    Mock::given(method("POST"))
        .and(path("/fs/directory"))
        .and(query_param("path", "/music"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/fs/move"))
        .and(body_json(json!({"from": "/a.txt", "to": "/music/b.txt"})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    store.create_directory(&rel("music")).await.unwrap();
    store.rename(&rel("a.txt"), &rel("music/b.txt")).await.unwrap();
}

#[tokio::test]
async fn test_delete_tolerates_missing_entries() {
    let (server, store) = common::setup_store().await;

    Mock::given(method("DELETE"))
        .and(path("/fs/entry"))
        .and(query_param("path", "/old"))
        .and(query_param("recursive", "true"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/fs/entry"))
        .and(query_param("path", "/gone.txt"))
        .and(query_param("recursive", "false"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    store.delete_directory(&rel("old")).await.unwrap();
    store.delete_file(&rel("gone.txt")).await.unwrap();
}

// ============================================================================
// Error mapping
// ============================================================================

#[tokio::test]
async fn test_server_error_is_reported() {
    let (server, store) = common::setup_store().await;

    Mock::given(method("GET"))
        .and(path("/fs/metadata"))
        .respond_with(ResponseTemplate::new(500).set_body_string("disk on fire"))
        .mount(&server)
        .await;

    let err = store.metadata(&rel("a.txt")).await.unwrap_err();
    let message = format!("{err:#}");
    assert!(message.contains("Server error"), "{message}");
    assert!(message.contains("disk on fire"), "{message}");
    assert!(matches!(
        err.downcast_ref::<RemoteError>(),
        Some(RemoteError::ServerError(_))
    ));
}

#[tokio::test]
async fn test_throttling_carries_retry_after() {
    let (server, store) = common::setup_store().await;

    Mock::given(method("GET"))
        .and(path("/fs/list"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
        .mount(&server)
        .await;

    let err = store
        .list_files(&RelativePath::root(), None)
        .await
        .unwrap_err();
    match err.downcast_ref::<RemoteError>() {
        Some(RemoteError::TooManyRequests { retry_after }) => {
            assert_eq!(*retry_after, Duration::from_secs(7))
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_unauthenticated_store_sends_no_token() {
    let server = wiremock::MockServer::start().await;
    let store = HttpRemoteStore::new(&server.uri(), None).unwrap();

    Mock::given(method("GET"))
        .and(path("/fs/metadata"))
        .and(header("authorization", "Bearer test-device-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(common::file_json("/a.txt", 1)))
        .mount(&server)
        .await;

    // Without the token the mock above does not match and wiremock answers 404.
    assert!(store.metadata(&rel("a.txt")).await.unwrap().is_none());

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert!(!requests[0].headers.contains_key("authorization"));
}
