//! HTTP remote store
//!
//! Typed client for the JSON file service exposed by the paired device.
//!
//! ## Endpoints
//!
//! | Operation | Request |
//! |---|---|
//! | list | `GET /fs/list?path=<dir>&kind=file\|directory[&pattern=<glob>]` |
//! | metadata | `GET /fs/metadata?path=<p>` (404 when absent) |
//! | read | `GET /fs/content?path=<p>` with `Range: bytes=<offset>-` |
//! | upload | `PUT /fs/content?path=<p>` |
//! | mkdir | `POST /fs/directory?path=<p>` |
//! | move | `POST /fs/move` with `{"from","to"}` |
//! | delete | `DELETE /fs/entry?path=<p>&recursive=<bool>` (404 tolerated) |
//!
//! Paths on the wire are absolute within the remote tree (`/` is the root).

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use reqwest::header::{CONTENT_LENGTH, RANGE, RETRY_AFTER};
use reqwest::{Body, Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tetherdrive_core::domain::{RelativePath, RemoteEntry};
use tetherdrive_core::ports::{IRemoteStore, RemoteReader};
use tokio::io::AsyncReadExt;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, trace, warn};
use url::Url;

use crate::{parse_retry_after, RemoteError, DEFAULT_RETRY_AFTER};

// ============================================================================
// Wire types
// ============================================================================

/// One entry as returned by `/fs/list` and `/fs/metadata`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryDto {
    path: String,
    is_directory: bool,
    #[serde(default)]
    length: u64,
    last_modified: DateTime<Utc>,
}

impl EntryDto {
    fn into_entry(self) -> Result<RemoteEntry, RemoteError> {
        let path = RelativePath::new(&self.path)
            .map_err(|e| RemoteError::InvalidResponse(format!("bad entry path {:?}: {e}", self.path)))?;
        Ok(if self.is_directory {
            RemoteEntry::directory(path, self.last_modified)
        } else {
            RemoteEntry::file(path, self.length, self.last_modified)
        })
    }
}

/// Response of `/fs/list`
#[derive(Debug, Deserialize)]
struct ListResponse {
    entries: Vec<EntryDto>,
}

/// Body of `/fs/move`
#[derive(Debug, Serialize)]
struct MoveRequest<'a> {
    from: &'a str,
    to: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    File,
    Directory,
}

impl EntryKind {
    fn as_str(self) -> &'static str {
        match self {
            EntryKind::File => "file",
            EntryKind::Directory => "directory",
        }
    }
}

/// Wire spelling of a relative path
fn wire_path(path: &RelativePath) -> String {
    format!("/{}", path.as_str())
}

// ============================================================================
// HttpRemoteStore
// ============================================================================

/// HTTP client for the device file service
pub struct HttpRemoteStore {
    /// The underlying HTTP client
    client: Client,
    /// Base URL of the service, without trailing slash
    base_url: String,
    /// Optional bearer token
    auth_token: Option<String>,
}

impl HttpRemoteStore {
    /// Creates a store for the service at `base_url`
    ///
    /// # Errors
    /// Returns `RemoteError::InvalidConfig` if `base_url` is not an http(s) URL
    pub fn new(base_url: &str, auth_token: Option<String>) -> Result<Self, RemoteError> {
        let parsed = Url::parse(base_url)
            .map_err(|e| RemoteError::InvalidConfig(format!("invalid base URL {base_url:?}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(RemoteError::InvalidConfig(format!(
                "base URL must be http(s): {base_url}"
            )));
        }

        Ok(Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token,
        })
    }

    /// Returns the base URL for API requests
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Creates a request builder for `endpoint`, authenticated when a token is set
    pub fn request(&self, method: Method, endpoint: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, endpoint);
        let builder = self.client.request(method, &url);
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Sends `builder` and turns non-success statuses into [`RemoteError`]s
    async fn send(&self, builder: RequestBuilder, what: &str) -> Result<Response, RemoteError> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(|v| parse_retry_after(v, DEFAULT_RETRY_AFTER));
        let body = response.text().await.unwrap_or_default();
        let detail = if body.is_empty() {
            what.to_string()
        } else {
            format!("{what}: {}", body.trim())
        };
        Err(RemoteError::from_status(status, detail, retry_after))
    }

    async fn list(
        &self,
        dir: &RelativePath,
        kind: EntryKind,
        pattern: Option<&str>,
    ) -> Result<Vec<RemoteEntry>> {
        let dir_param = wire_path(dir);
        let mut query = vec![("path", dir_param.as_str()), ("kind", kind.as_str())];
        if let Some(pattern) = pattern {
            query.push(("pattern", pattern));
        }

        let what = format!("list {dir_param}");
        let listing: ListResponse = self
            .send(self.request(Method::GET, "/fs/list").query(&query), &what)
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::InvalidResponse(format!("{what}: {e}")))?;

        let mut entries = Vec::with_capacity(listing.entries.len());
        for dto in listing.entries {
            let entry = dto.into_entry()?;
            let expected_kind = entry.is_directory == (kind == EntryKind::Directory);
            if entry.relative_path.parent().as_ref() != Some(dir) || !expected_kind {
                warn!(dir = %dir, path = %entry.relative_path, "Ignoring stray entry in listing");
                continue;
            }
            entries.push(entry);
        }
        debug!(dir = %dir, kind = kind.as_str(), count = entries.len(), "Listed remote directory");
        Ok(entries)
    }

    async fn delete(&self, path: &RelativePath, recursive: bool) -> Result<()> {
        let path_param = wire_path(path);
        let recursive_param = if recursive { "true" } else { "false" };
        let builder = self
            .request(Method::DELETE, "/fs/entry")
            .query(&[("path", path_param.as_str()), ("recursive", recursive_param)]);

        match self.send(builder, &format!("delete {path_param}")).await {
            Ok(_) => {
                debug!(path = %path, recursive, "Deleted remote entry");
                Ok(())
            }
            Err(RemoteError::NotFound(_)) => {
                trace!(path = %path, "Remote entry already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait::async_trait]
impl IRemoteStore for HttpRemoteStore {
    async fn list_files(
        &self,
        dir: &RelativePath,
        pattern: Option<&str>,
    ) -> Result<Vec<RemoteEntry>> {
        self.list(dir, EntryKind::File, pattern).await
    }

    async fn list_directories(
        &self,
        dir: &RelativePath,
        pattern: Option<&str>,
    ) -> Result<Vec<RemoteEntry>> {
        self.list(dir, EntryKind::Directory, pattern).await
    }

    async fn metadata(&self, path: &RelativePath) -> Result<Option<RemoteEntry>> {
        let path_param = wire_path(path);
        let what = format!("metadata {path_param}");
        let builder = self
            .request(Method::GET, "/fs/metadata")
            .query(&[("path", path_param.as_str())]);

        let response = match self.send(builder, &what).await {
            Ok(response) => response,
            Err(RemoteError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let dto: EntryDto = response
            .json()
            .await
            .map_err(|e| RemoteError::InvalidResponse(format!("{what}: {e}")))?;
        Ok(Some(dto.into_entry()?))
    }

    async fn open_read(&self, path: &RelativePath, offset: u64) -> Result<RemoteReader> {
        let path_param = wire_path(path);
        let mut builder = self
            .request(Method::GET, "/fs/content")
            .query(&[("path", path_param.as_str())]);
        if offset > 0 {
            builder = builder.header(RANGE, format!("bytes={offset}-"));
        }

        let response = self
            .send(builder, &format!("read {path_param}"))
            .await
            .with_context(|| format!("Failed to open {path} at offset {offset}"))?;
        let ranged = response.status() == StatusCode::PARTIAL_CONTENT;
        trace!(path = %path, offset, ranged, "Opened remote content stream");

        let stream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        let mut reader: RemoteReader = Box::new(StreamReader::new(Box::pin(stream)));

        if offset > 0 && !ranged {
            // The server ignored the range; skip to the offset ourselves.
            let skipped = tokio::io::copy(&mut (&mut reader).take(offset), &mut tokio::io::sink())
                .await
                .with_context(|| format!("Failed to skip to offset {offset} of {path}"))?;
            if skipped < offset {
                return Err(RemoteError::InvalidResponse(format!(
                    "{path_param} is shorter than offset {offset}"
                ))
                .into());
            }
        }
        Ok(reader)
    }

    async fn upload_file(&self, path: &RelativePath, local: &Path) -> Result<()> {
        let path_param = wire_path(path);
        let file = tokio::fs::File::open(local)
            .await
            .with_context(|| format!("Failed to open {} for upload", local.display()))?;
        let length = file.metadata().await?.len();

        let builder = self
            .request(Method::PUT, "/fs/content")
            .query(&[("path", path_param.as_str())])
            .header(CONTENT_LENGTH, length)
            .body(Body::wrap_stream(ReaderStream::new(file)));
        self.send(builder, &format!("upload {path_param}")).await?;

        debug!(path = %path, bytes = length, "Uploaded file");
        Ok(())
    }

    async fn create_directory(&self, path: &RelativePath) -> Result<()> {
        let path_param = wire_path(path);
        let builder = self
            .request(Method::POST, "/fs/directory")
            .query(&[("path", path_param.as_str())]);
        self.send(builder, &format!("mkdir {path_param}")).await?;
        debug!(path = %path, "Created remote directory");
        Ok(())
    }

    async fn rename(&self, from: &RelativePath, to: &RelativePath) -> Result<()> {
        let (from_param, to_param) = (wire_path(from), wire_path(to));
        let builder = self.request(Method::POST, "/fs/move").json(&MoveRequest {
            from: &from_param,
            to: &to_param,
        });
        self.send(builder, &format!("move {from_param} -> {to_param}"))
            .await?;
        debug!(from = %from, to = %to, "Moved remote entry");
        Ok(())
    }

    async fn delete_file(&self, path: &RelativePath) -> Result<()> {
        self.delete(path, false).await
    }

    async fn delete_directory(&self, path: &RelativePath) -> Result<()> {
        self.delete(path, true).await
    }
}
