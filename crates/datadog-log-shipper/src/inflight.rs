// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Correlation of remote commands with the events they produce.
//!
//! Every remote command gets an [`Inflight`] handle registered under a fresh
//! correlation id. The command transport delivers the command's reply to the
//! register by id, and the ingress server delivers pushed file contents the
//! same way. The handle owner reads those as [`InflightEvent`]s, bounded by a
//! timeout it arms and cancels itself.
//!
//! Completing or dropping the handle removes the id from the register, so a
//! late reply or push for a stage that already gave up is rejected rather than
//! acted on.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::debug;

/// Placeholder in command arguments replaced with the correlation id.
pub const CORRELATION_ID_PLACEHOLDER: &str = "%%ID%%";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CommandReply {
    pub exit_status: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl CommandReply {
    /// Reply standing in for a command whose outcome never made it back.
    pub fn failed(stderr: String) -> Self {
        CommandReply {
            exit_status: -1,
            stdout: String::new(),
            stderr,
        }
    }
}

/// Contents of a push as they arrive from the pusher. An `Err` chunk means
/// the transfer broke off and the contents are incomplete.
pub type PushBody = BoxStream<'static, io::Result<Bytes>>;

/// Push body already held in memory.
pub fn push_body(contents: Bytes) -> PushBody {
    stream::iter([Ok(contents)]).boxed()
}

/// File contents pushed by a host for a running command. Delivered as soon as
/// the request head arrives; the body streams in behind it.
pub struct InboundPush {
    pub body: PushBody,
    pub content_md5: Option<String>,
    pub content_length: Option<u64>,
    /// Verdict for the pusher: true once the contents are durably stored.
    pub reply: oneshot::Sender<bool>,
}

impl fmt::Debug for InboundPush {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundPush")
            .field("content_md5", &self.content_md5)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum InflightEvent {
    CommandReply(CommandReply),
    InboundPush(InboundPush),
    Timeout,
}

#[derive(Debug)]
enum Delivery {
    Reply(CommandReply),
    Push(InboundPush),
}

impl From<Delivery> for InflightEvent {
    fn from(delivery: Delivery) -> Self {
        match delivery {
            Delivery::Reply(reply) => InflightEvent::CommandReply(reply),
            Delivery::Push(push) => InflightEvent::InboundPush(push),
        }
    }
}

#[derive(Debug)]
struct Entry {
    tx: mpsc::UnboundedSender<Delivery>,
    host: String,
    label: &'static str,
    opened: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct InflightSummary {
    pub id: String,
    pub host: String,
    pub label: &'static str,
    pub age_ms: u64,
}

/// Open correlation handles, shared by the command transport, the pipeline and
/// the ingress server.
#[derive(Debug, Clone, Default)]
pub struct InflightRegister {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl InflightRegister {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new handle for a command about to be sent to `host`.
    pub fn open(&self, host: &str, label: &'static str) -> Inflight {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.entries().insert(
            id.clone(),
            Entry {
                tx,
                host: host.to_string(),
                label,
                opened: Instant::now(),
            },
        );
        debug!(id = %id, host = %host, label, "opened inflight");
        Inflight {
            id,
            register: self.clone(),
            rx,
            deadline: None,
            completed: false,
        }
    }

    /// Routes a command reply. Returns false if the id is no longer open.
    pub fn deliver_reply(&self, id: &str, reply: CommandReply) -> bool {
        match self.entries().get(id) {
            Some(entry) => entry.tx.send(Delivery::Reply(reply)).is_ok(),
            None => false,
        }
    }

    /// Routes pushed contents. Hands the push back if the id is no longer open
    /// so the caller can answer the pusher itself.
    pub fn deliver_push(&self, id: &str, push: InboundPush) -> Result<(), InboundPush> {
        let entries = self.entries();
        let Some(entry) = entries.get(id) else {
            return Err(push);
        };
        if entry.tx.is_closed() {
            return Err(push);
        }
        // a send racing the handle's drop loses the verdict sender, which the
        // pusher reads as "not stored"
        let _ = entry.tx.send(Delivery::Push(push));
        Ok(())
    }

    /// Resolves once the handle for `id` is completed or dropped, at once if
    /// it already is.
    pub fn closed(&self, id: &str) -> impl Future<Output = ()> + Send + 'static {
        let tx = self.entries().get(id).map(|entry| entry.tx.clone());
        async move {
            if let Some(tx) = tx {
                tx.closed().await;
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries().contains_key(id)
    }

    pub fn dump_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries().keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    pub fn summaries(&self) -> Vec<InflightSummary> {
        let now = Instant::now();
        let mut summaries: Vec<InflightSummary> = self
            .entries()
            .iter()
            .map(|(id, entry)| InflightSummary {
                id: id.clone(),
                host: entry.host.clone(),
                label: entry.label,
                age_ms: now.duration_since(entry.opened).as_millis() as u64,
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    fn close(&self, id: &str) {
        if self.entries().remove(id).is_some() {
            debug!(id = %id, "closed inflight");
        }
    }
}

/// Handle on one remote command.
#[derive(Debug)]
pub struct Inflight {
    id: String,
    register: InflightRegister,
    rx: mpsc::UnboundedReceiver<Delivery>,
    deadline: Option<Instant>,
    completed: bool,
}

impl Inflight {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Arms (or re-arms) the timeout `duration` from now.
    pub fn start_timeout(&mut self, duration: Duration) {
        self.deadline = Some(Instant::now() + duration);
    }

    pub fn cancel_timeout(&mut self) {
        self.deadline = None;
    }

    /// Deregisters the handle. Later deliveries for this id are rejected.
    pub fn complete(&mut self) {
        if !self.completed {
            self.completed = true;
            self.register.close(&self.id);
            self.rx.close();
        }
    }

    /// Waits for the next event. A fired timeout disarms itself and is reported
    /// once. Returns `None` when the handle is complete and nothing is buffered,
    /// or when no timeout is armed and the sender side has gone away.
    pub async fn next_event(&mut self) -> Option<InflightEvent> {
        let Some(deadline) = self.deadline else {
            return self.rx.recv().await.map(Into::into);
        };
        tokio::select! {
            biased;
            delivery = self.rx.recv() => delivery.map(Into::into),
            _ = tokio::time::sleep_until(deadline) => {
                self.deadline = None;
                Some(InflightEvent::Timeout)
            }
        }
    }
}

impl Drop for Inflight {
    fn drop(&mut self) {
        self.complete();
    }
}
