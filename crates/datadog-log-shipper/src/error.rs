// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

/// The remote command channel could not take another request right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("remote command transport unavailable")]
pub struct TransportUnavailable;

/// Errors returned by an object store.
///
/// Request failures are captured as text so the error stays cheap to clone; the
/// upload stage records the first error of two arrivals and hands it back later.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("object not found")]
    NotFound,

    #[error("storage responded {status}: {message}")]
    Status { status: u16, message: String },

    #[error("storage request failed: {0}")]
    Request(String),

    #[error("invalid storage request: {0}")]
    InvalidRequest(String),
}

impl From<reqwest::Error> for StorageError {
    fn from(err: reqwest::Error) -> Self {
        StorageError::Request(err.to_string())
    }
}

/// Failure of one pipeline stage. Every variant ends in the fixed backoff for
/// the offending log file; none of them is fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    #[error(transparent)]
    TransportUnavailable(#[from] TransportUnavailable),

    #[error("{script} exited {exit_status}: {stderr}")]
    CommandFailed {
        script: &'static str,
        exit_status: i32,
        stderr: String,
    },

    #[error("{script} command timed out")]
    Timeout { script: &'static str },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("correlation handle closed before {script} completed")]
    Closed { script: &'static str },
}

/// Reasons a discovery sweep for one host was abandoned.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    TransportUnavailable(#[from] TransportUnavailable),

    #[error("previous sweep still outstanding")]
    InProgress,

    #[error("enumeration timed out")]
    Timeout,

    #[error("enumeration exited {exit_status}: {stderr}")]
    CommandFailed { exit_status: i32, stderr: String },

    #[error("could not parse enumeration reply: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("correlation handle closed before enumeration completed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("inventory request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("inventory responded {status}: {message}")]
    Status { status: u16, message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("could not read script {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("script {0} defined more than once")]
    Duplicate(String),

    #[error("required script {0} is missing")]
    Missing(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum LogsetError {
    #[error("could not read logsets from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse logsets: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("logset {name} has an invalid regex: {source}")]
    Regex {
        name: String,
        #[source]
        source: regex::Error,
    },
}

/// Errors that stop the shipper from starting.
#[derive(Debug, thiserror::Error)]
pub enum ShipperError {
    #[error(transparent)]
    Scripts(#[from] ScriptError),

    #[error(transparent)]
    Logsets(#[from] LogsetError),

    #[error("could not build HTTP client: {0}")]
    Client(String),

    #[error("could not bind ingress listener: {0}")]
    Bind(#[from] std::io::Error),
}
