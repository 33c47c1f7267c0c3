// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, StatusCode};
use tracing::debug;

use crate::error::StorageError;
use crate::inflight::PushBody;

const CONTENT_MD5: &str = "content-md5";
const DIRECTORY_CONTENT_TYPE: &str = "application/json; type=directory";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub digest: String,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub content_md5: Option<String>,
    pub content_length: Option<u64>,
    /// Refuse the write if the path already holds an object.
    pub if_absent: bool,
}

/// Durable object storage addressed by absolute path.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Metadata of the object at `path`, or [`StorageError::NotFound`].
    async fn info(&self, path: &str) -> Result<ObjectInfo, StorageError>;

    /// Creates `dir` and any missing ancestors. Succeeds if they already exist.
    async fn mkdirp(&self, dir: &str) -> Result<(), StorageError>;

    /// Stores `body` at `path`, reading it as it arrives. A broken body
    /// fails the write.
    async fn put(&self, path: &str, body: PushBody, options: PutOptions)
        -> Result<(), StorageError>;
}

/// Parent directory of an object path. `None` for paths directly under the root.
pub fn parent_dir(path: &str) -> Option<&str> {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => Some(parent),
        _ => None,
    }
}

/// Object store speaking a directory-aware HTTP protocol: `HEAD` for
/// metadata, `PUT` with a directory content type to create directories and a
/// plain `PUT` for objects.
///
/// Metadata and directory requests are bounded by `request_timeout`. Object
/// writes are not: they last as long as the pusher takes to send the body.
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    client: reqwest::Client,
    base_url: String,
    user: String,
    request_timeout: Duration,
}

impl HttpObjectStore {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        user: &str,
        request_timeout: Duration,
    ) -> Self {
        HttpObjectStore {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            user: user.to_string(),
            request_timeout,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Directories to create for `dir`, shallowest first. Only paths below the
    /// account root are created; the root itself always exists.
    fn directories<'a>(&self, dir: &'a str) -> Result<Vec<&'a str>, StorageError> {
        let root = format!("/{}", self.user);
        let dir = dir.trim_end_matches('/');
        let Some(rest) = dir.strip_prefix(&root) else {
            return Err(StorageError::InvalidRequest(format!(
                "{dir} is outside {root}"
            )));
        };
        if !rest.is_empty() && !rest.starts_with('/') {
            return Err(StorageError::InvalidRequest(format!(
                "{dir} is outside {root}"
            )));
        }

        let mut dirs = Vec::new();
        for (i, c) in rest.char_indices().skip(1) {
            if c == '/' {
                dirs.push(&dir[..root.len() + i]);
            }
        }
        if !rest.is_empty() {
            dirs.push(dir);
        }
        Ok(dirs)
    }
}

async fn status_error(response: reqwest::Response) -> StorageError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    StorageError::Status { status, message }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn info(&self, path: &str) -> Result<ObjectInfo, StorageError> {
        let response = self
            .client
            .head(self.url(path))
            .timeout(self.request_timeout)
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(StorageError::NotFound),
            status if status.is_success() => {
                let headers = response.headers();
                let digest = headers
                    .get(CONTENT_MD5)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let size = headers
                    .get(header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok());
                Ok(ObjectInfo { digest, size })
            }
            _ => Err(status_error(response).await),
        }
    }

    async fn mkdirp(&self, dir: &str) -> Result<(), StorageError> {
        for dir in self.directories(dir)? {
            let response = self
                .client
                .put(self.url(dir))
                .header(header::CONTENT_TYPE, DIRECTORY_CONTENT_TYPE)
                .timeout(self.request_timeout)
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(status_error(response).await);
            }
            debug!(dir = %dir, "ensured directory");
        }
        Ok(())
    }

    async fn put(
        &self,
        path: &str,
        body: PushBody,
        options: PutOptions,
    ) -> Result<(), StorageError> {
        let mut request = self
            .client
            .put(self.url(path))
            .header(header::CONTENT_TYPE, "application/octet-stream");
        if let Some(length) = options.content_length {
            request = request.header(header::CONTENT_LENGTH, length);
        }
        if let Some(md5) = &options.content_md5 {
            request = request.header(CONTENT_MD5, md5);
        }
        if options.if_absent {
            request = request.header(header::IF_NONE_MATCH, "*");
        }

        let response = request
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        debug!(path = %path, "stored object");
        Ok(())
    }
}
