//! Shared test helpers for HTTP store integration tests

use serde_json::{json, Value};
use tetherdrive_core::domain::RelativePath;
use tetherdrive_remote::http::HttpRemoteStore;
use wiremock::MockServer;

/// Token every helper store authenticates with
pub const TEST_TOKEN: &str = "test-device-token";

/// Starts a mock server and returns a store pointing at it
pub async fn setup_store() -> (MockServer, HttpRemoteStore) {
    let server = MockServer::start().await;
    let store = HttpRemoteStore::new(&server.uri(), Some(TEST_TOKEN.to_string()))
        .expect("mock server URI is valid");
    (server, store)
}

/// Wire representation of a file entry
pub fn file_json(path: &str, length: u64) -> Value {
    json!({
        "path": path,
        "isDirectory": false,
        "length": length,
        "lastModified": "2024-05-01T10:00:00Z"
    })
}

/// Wire representation of a directory entry
pub fn dir_json(path: &str) -> Value {
    json!({
        "path": path,
        "isDirectory": true,
        "lastModified": "2024-05-01T10:00:00Z"
    })
}

pub fn rel(path: &str) -> RelativePath {
    RelativePath::new(path).unwrap()
}
