// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pipeline stages driven against a fake fleet and an in-memory store

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::helpers::{logfile, pipeline};
use common::mocks::{ok_reply, Behaviour, FakeExecutor, MemoryStore};
use datadog_log_shipper::{
    error::{StageError, StorageError, TransportUnavailable},
    inflight::CommandReply,
    scripts,
};

const REMOTE_PATH: &str = "/poseidon/stor/logs/z1/a.log";

fn fixture(store: MemoryStore) -> (Arc<FakeExecutor>, Arc<MemoryStore>) {
    (Arc::new(FakeExecutor::new()), Arc::new(store))
}

#[tokio::test(start_paused = true)]
async fn test_existing_remote_copy_skips_upload() {
    let (executor, store) = fixture(MemoryStore::new().with_object(REMOTE_PATH, "old", "abc123"));
    let ctx = pipeline(executor.clone(), store.clone());
    let mut lf = logfile("a.log");

    ctx.run("h1", &mut lf).await.expect("pipeline succeeds");

    assert!(lf.uploaded());
    assert_eq!(lf.remote_digest(), Some("abc123"));
    assert!(lf.removed());
    assert!(store.dirs().is_empty());

    let sent = executor.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].label, scripts::REMOVE);
    assert_eq!(sent[0].host, "h1");
    assert_eq!(sent[0].args, vec!["/var/log/a.log", "abc123", "z1"]);
}

#[tokio::test(start_paused = true)]
async fn test_happy_path_uploads_then_removes() {
    let (executor, store) = fixture(MemoryStore::new());
    executor.on(scripts::PUSH, Behaviour::push("log contents", "md5=="));
    let ctx = pipeline(executor.clone(), store.clone());
    let mut lf = logfile("a.log");

    ctx.run("h1", &mut lf).await.expect("pipeline succeeds");

    assert!(lf.uploaded());
    assert!(lf.removed());
    assert_eq!(lf.remote_digest(), Some("md5=="));
    assert_eq!(store.dirs(), vec!["/poseidon/stor/logs/z1"]);
    assert_eq!(
        store.object(REMOTE_PATH),
        Some((Bytes::from_static(b"log contents"), "md5==".to_string()))
    );
    assert_eq!(executor.verdicts(), vec![true]);

    let sent = executor.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].label, scripts::PUSH);
    assert_eq!(sent[0].args[0], "/var/log/a.log");
    assert!(sent[0].args[1].starts_with("http://10.0.0.1:2020/pushlog/"));
    assert!(!sent[0].args[1].contains("%%ID%%"));
    assert_eq!(sent[0].args[2], "z1");
    assert_eq!(sent[1].label, scripts::REMOVE);
    assert_eq!(sent[1].args, vec!["/var/log/a.log", "md5==", "z1"]);
    assert!(executor.register.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reply_without_push_times_out() {
    let (executor, store) = fixture(MemoryStore::new());
    executor.on(scripts::PUSH, Behaviour::ok());
    let ctx = pipeline(executor.clone(), store.clone());
    let mut lf = logfile("a.log");

    let err = ctx.upload("h1", &mut lf).await.unwrap_err();
    assert_eq!(err, StageError::Timeout { script: scripts::PUSH });
    assert!(!lf.uploaded());
    assert!(executor.register.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_push_without_reply_times_out() {
    let (executor, store) = fixture(MemoryStore::new());
    executor.on(
        scripts::PUSH,
        Behaviour::Push {
            delay: Duration::ZERO,
            body: Bytes::from_static(b"log contents"),
            content_md5: Some("md5==".to_string()),
            then_reply: None,
        },
    );
    let ctx = pipeline(executor.clone(), store.clone());
    let mut lf = logfile("a.log");

    let err = ctx.upload("h1", &mut lf).await.unwrap_err();
    assert_eq!(err, StageError::Timeout { script: scripts::PUSH });
    assert!(!lf.uploaded());
    // the object itself was stored; the next attempt finds it
    assert_eq!(executor.verdicts(), vec![true]);
    assert!(store.object(REMOTE_PATH).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_failing_reply_fails_stage_after_successful_push() {
    let (executor, store) = fixture(MemoryStore::new());
    executor.on(
        scripts::PUSH,
        Behaviour::Push {
            delay: Duration::ZERO,
            body: Bytes::from_static(b"log contents"),
            content_md5: Some("md5==".to_string()),
            then_reply: Some((
                Duration::from_millis(10),
                CommandReply {
                    exit_status: 2,
                    stdout: String::new(),
                    stderr: "gzip: broken pipe".to_string(),
                },
            )),
        },
    );
    let ctx = pipeline(executor.clone(), store.clone());
    let mut lf = logfile("a.log");

    let err = ctx.upload("h1", &mut lf).await.unwrap_err();
    assert_eq!(
        err,
        StageError::CommandFailed {
            script: scripts::PUSH,
            exit_status: 2,
            stderr: "gzip: broken pipe".to_string(),
        }
    );
    assert!(!lf.uploaded());
    assert_eq!(executor.verdicts(), vec![true]);
}

#[tokio::test(start_paused = true)]
async fn test_failed_store_is_reported_to_pusher() {
    let store = MemoryStore::new();
    store.fail_put(true);
    let (executor, store) = fixture(store);
    executor.on(scripts::PUSH, Behaviour::push("log contents", "md5=="));
    let ctx = pipeline(executor.clone(), store.clone());
    let mut lf = logfile("a.log");

    let err = ctx.upload("h1", &mut lf).await.unwrap_err();
    assert_eq!(
        err,
        StageError::Storage(StorageError::Status {
            status: 503,
            message: "ServiceUnavailable".to_string(),
        })
    );
    assert_eq!(executor.verdicts(), vec![false]);
    assert!(!lf.uploaded());
}

#[tokio::test(start_paused = true)]
async fn test_push_without_md5_is_refused() {
    let (executor, store) = fixture(MemoryStore::new());
    executor.on(
        scripts::PUSH,
        Behaviour::Push {
            delay: Duration::ZERO,
            body: Bytes::from_static(b"log contents"),
            content_md5: None,
            then_reply: Some((Duration::ZERO, ok_reply())),
        },
    );
    let ctx = pipeline(executor.clone(), store.clone());
    let mut lf = logfile("a.log");

    let err = ctx.upload("h1", &mut lf).await.unwrap_err();
    assert!(matches!(err, StageError::Protocol(_)));
    assert_eq!(executor.verdicts(), vec![false]);
    assert!(store.object(REMOTE_PATH).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_transport_unavailable_fails_stage() {
    let (executor, store) = fixture(MemoryStore::new());
    executor.on(scripts::PUSH, Behaviour::Unavailable);
    let ctx = pipeline(executor.clone(), store.clone());
    let mut lf = logfile("a.log");

    let err = ctx.run("h1", &mut lf).await.unwrap_err();
    assert_eq!(err, StageError::TransportUnavailable(TransportUnavailable));
    assert!(executor.sent().is_empty());
    assert_eq!(store.dirs(), vec!["/poseidon/stor/logs/z1"]);
}

#[tokio::test(start_paused = true)]
async fn test_failed_remove_keeps_upload() {
    let (executor, store) = fixture(MemoryStore::new());
    executor.on(scripts::PUSH, Behaviour::push("log contents", "md5=="));
    executor.on(scripts::REMOVE, Behaviour::exit(1, "checksum mismatch"));
    let ctx = pipeline(executor.clone(), store.clone());
    let mut lf = logfile("a.log");

    let err = ctx.run("h1", &mut lf).await.unwrap_err();
    assert!(matches!(
        err,
        StageError::CommandFailed {
            script: scripts::REMOVE,
            exit_status: 1,
            ..
        }
    ));
    assert!(lf.uploaded());
    assert!(!lf.removed());

    // a retry goes straight to removal
    executor.on(scripts::REMOVE, Behaviour::ok());
    ctx.run("h1", &mut lf).await.expect("retry succeeds");
    assert!(lf.removed());
    assert_eq!(
        executor.sent_labels(),
        vec![scripts::PUSH, scripts::REMOVE, scripts::REMOVE]
    );
}

#[tokio::test(start_paused = true)]
async fn test_storage_outage_fails_existence_check() {
    let store = MemoryStore::new();
    store.fail_info(true);
    let (executor, store) = fixture(store);
    let ctx = pipeline(executor.clone(), store.clone());
    let mut lf = logfile("a.log");

    let err = ctx.run("h1", &mut lf).await.unwrap_err();
    assert!(matches!(err, StageError::Storage(StorageError::Request(_))));
    assert!(executor.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_push_rearms_stage_timeout() {
    let (executor, store) = fixture(MemoryStore::new());
    executor.on(
        scripts::PUSH,
        Behaviour::Push {
            delay: Duration::from_secs(25),
            body: Bytes::from_static(b"log contents"),
            content_md5: Some("md5==".to_string()),
            then_reply: Some((Duration::from_secs(20), ok_reply())),
        },
    );
    let ctx = pipeline(executor.clone(), store.clone());
    let mut lf = logfile("a.log");

    let started = tokio::time::Instant::now();
    ctx.upload("h1", &mut lf).await.expect("upload succeeds");
    assert!(started.elapsed() >= Duration::from_secs(45));
    assert!(lf.uploaded());
}
