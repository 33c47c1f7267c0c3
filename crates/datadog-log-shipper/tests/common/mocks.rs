// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fake collaborators standing in for the command transport and object store

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use datadog_log_shipper::{
    error::{StorageError, TransportUnavailable},
    inflight::{push_body, CommandReply, InboundPush, Inflight, InflightRegister, PushBody},
    remote::{substitute_correlation_id, RemoteExecutor},
    storage::{ObjectInfo, ObjectStore, PutOptions},
};
use futures::StreamExt;
use tokio::sync::oneshot;

/// How the fake fleet answers one kind of command.
#[derive(Debug, Clone)]
pub enum Behaviour {
    /// Replies after `delay`.
    Reply { delay: Duration, reply: CommandReply },
    /// Pushes `body` after `delay`, waits for the verdict, then optionally
    /// replies after a further delay.
    Push {
        delay: Duration,
        body: Bytes,
        content_md5: Option<String>,
        then_reply: Option<(Duration, CommandReply)>,
    },
    /// Never answers.
    Silent,
    /// The transport refuses the command.
    Unavailable,
}

impl Behaviour {
    pub fn ok() -> Self {
        Behaviour::stdout("")
    }

    pub fn stdout(stdout: &str) -> Self {
        Behaviour::Reply {
            delay: Duration::ZERO,
            reply: CommandReply {
                exit_status: 0,
                stdout: stdout.to_string(),
                stderr: String::new(),
            },
        }
    }

    pub fn exit(exit_status: i32, stderr: &str) -> Self {
        Behaviour::Reply {
            delay: Duration::ZERO,
            reply: CommandReply {
                exit_status,
                stdout: String::new(),
                stderr: stderr.to_string(),
            },
        }
    }

    /// Pushes `body` with `content_md5`, then exits 0.
    pub fn push(body: &'static str, content_md5: &str) -> Self {
        Behaviour::Push {
            delay: Duration::ZERO,
            body: Bytes::from_static(body.as_bytes()),
            content_md5: Some(content_md5.to_string()),
            then_reply: Some((Duration::ZERO, ok_reply())),
        }
    }
}

pub fn ok_reply() -> CommandReply {
    CommandReply {
        exit_status: 0,
        stdout: String::new(),
        stderr: String::new(),
    }
}

#[derive(Debug, Clone)]
pub struct SentCommand {
    pub host: String,
    pub label: &'static str,
    pub script: String,
    pub args: Vec<String>,
}

/// Executor that answers from a table of behaviours keyed by command label,
/// using a real [`InflightRegister`] for correlation.
#[derive(Default)]
pub struct FakeExecutor {
    pub register: InflightRegister,
    behaviours: Mutex<HashMap<&'static str, Behaviour>>,
    sent: Mutex<Vec<SentCommand>>,
    verdicts: Arc<Mutex<Vec<bool>>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, label: &'static str, behaviour: Behaviour) -> &Self {
        self.behaviours.lock().unwrap().insert(label, behaviour);
        self
    }

    pub fn sent(&self) -> Vec<SentCommand> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_labels(&self) -> Vec<&'static str> {
        self.sent().iter().map(|c| c.label).collect()
    }

    /// Verdicts the shipper gave for each push, in order.
    pub fn verdicts(&self) -> Vec<bool> {
        self.verdicts.lock().unwrap().clone()
    }
}

impl RemoteExecutor for FakeExecutor {
    fn send(
        &self,
        host: &str,
        script: &str,
        args: &[String],
        label: &'static str,
    ) -> Result<Inflight, TransportUnavailable> {
        let behaviour = self
            .behaviours
            .lock()
            .unwrap()
            .get(label)
            .cloned()
            .unwrap_or_else(Behaviour::ok);
        if matches!(behaviour, Behaviour::Unavailable) {
            return Err(TransportUnavailable);
        }

        let inflight = self.register.open(host, label);
        let id = inflight.id().to_string();
        self.sent.lock().unwrap().push(SentCommand {
            host: host.to_string(),
            label,
            script: script.to_string(),
            args: substitute_correlation_id(args, &id),
        });

        let register = self.register.clone();
        let verdicts = Arc::clone(&self.verdicts);
        tokio::spawn(async move {
            match behaviour {
                Behaviour::Reply { delay, reply } => {
                    tokio::time::sleep(delay).await;
                    register.deliver_reply(&id, reply);
                }
                Behaviour::Push {
                    delay,
                    body,
                    content_md5,
                    then_reply,
                } => {
                    tokio::time::sleep(delay).await;
                    let (reply, verdict) = oneshot::channel();
                    let push = InboundPush {
                        content_length: Some(body.len() as u64),
                        body: push_body(body),
                        content_md5,
                        reply,
                    };
                    if register.deliver_push(&id, push).is_err() {
                        return;
                    }
                    let stored = verdict.await.unwrap_or(false);
                    verdicts.lock().unwrap().push(stored);
                    if let Some((delay, reply)) = then_reply {
                        tokio::time::sleep(delay).await;
                        register.deliver_reply(&id, reply);
                    }
                }
                Behaviour::Silent | Behaviour::Unavailable => {}
            }
        });

        Ok(inflight)
    }
}

/// Object store kept in memory, with switches to make each operation fail.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, (Bytes, String)>>,
    dirs: Mutex<Vec<String>>,
    failing_paths: Mutex<HashSet<String>>,
    info_calls: Mutex<Vec<String>>,
    fail_info: Mutex<bool>,
    fail_mkdirp: Mutex<bool>,
    fail_put: Mutex<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object(self, path: &str, body: &'static str, digest: &str) -> Self {
        self.objects.lock().unwrap().insert(
            path.to_string(),
            (Bytes::from_static(body.as_bytes()), digest.to_string()),
        );
        self
    }

    pub fn object(&self, path: &str) -> Option<(Bytes, String)> {
        self.objects.lock().unwrap().get(path).cloned()
    }

    pub fn dirs(&self) -> Vec<String> {
        self.dirs.lock().unwrap().clone()
    }

    pub fn info_calls(&self) -> Vec<String> {
        self.info_calls.lock().unwrap().clone()
    }

    pub fn fail_info(&self, fail: bool) {
        *self.fail_info.lock().unwrap() = fail;
    }

    pub fn fail_mkdirp(&self, fail: bool) {
        *self.fail_mkdirp.lock().unwrap() = fail;
    }

    pub fn fail_put(&self, fail: bool) {
        *self.fail_put.lock().unwrap() = fail;
    }

    /// Makes every operation on `path` fail.
    pub fn fail_path(&self, path: &str) {
        self.failing_paths.lock().unwrap().insert(path.to_string());
    }

    fn unavailable(&self, path: &str) -> Option<StorageError> {
        if self.failing_paths.lock().unwrap().contains(path) {
            return Some(StorageError::Status {
                status: 503,
                message: "ServiceUnavailable".to_string(),
            });
        }
        None
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn info(&self, path: &str) -> Result<ObjectInfo, StorageError> {
        self.info_calls.lock().unwrap().push(path.to_string());
        if let Some(e) = self.unavailable(path) {
            return Err(e);
        }
        if *self.fail_info.lock().unwrap() {
            return Err(StorageError::Request("connection refused".to_string()));
        }
        match self.objects.lock().unwrap().get(path) {
            Some((body, digest)) => Ok(ObjectInfo {
                digest: digest.clone(),
                size: Some(body.len() as u64),
            }),
            None => Err(StorageError::NotFound),
        }
    }

    async fn mkdirp(&self, dir: &str) -> Result<(), StorageError> {
        if *self.fail_mkdirp.lock().unwrap() {
            return Err(StorageError::Status {
                status: 500,
                message: "InternalError".to_string(),
            });
        }
        self.dirs.lock().unwrap().push(dir.to_string());
        Ok(())
    }

    async fn put(
        &self,
        path: &str,
        mut body: PushBody,
        options: PutOptions,
    ) -> Result<(), StorageError> {
        if let Some(e) = self.unavailable(path) {
            return Err(e);
        }
        if *self.fail_put.lock().unwrap() {
            return Err(StorageError::Status {
                status: 503,
                message: "ServiceUnavailable".to_string(),
            });
        }
        let mut contents = BytesMut::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| StorageError::Request(e.to_string()))?;
            contents.extend_from_slice(&chunk);
        }
        let body = contents.freeze();
        let mut objects = self.objects.lock().unwrap();
        if options.if_absent && objects.contains_key(path) {
            return Err(StorageError::Status {
                status: 412,
                message: "PreconditionFailed".to_string(),
            });
        }
        objects.insert(
            path.to_string(),
            (body, options.content_md5.unwrap_or_default()),
        );
        Ok(())
    }
}
