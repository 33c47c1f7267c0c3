// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The four stages that take one log file from discovered to removed.
//!
//! Stages run in order on a working copy of a [`LogFile`]; the first failure
//! skips the rest. Each stage is a no-op when the record shows its work is
//! already done, so a file retried after backoff resumes where it stopped.
//!
//! The upload stage is the only one with two completion signals: the push
//! script's own reply over the command channel, and the file contents the
//! script pushes to the ingress server. Both must arrive before the stage
//! resolves.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{StageError, StorageError};
use crate::inflight::{CommandReply, Inflight, InflightEvent, InboundPush};
use crate::join::CompletionJoin;
use crate::logfile::LogFile;
use crate::remote::RemoteExecutor;
use crate::scripts::{self, Scripts};
use crate::storage::{parent_dir, ObjectStore, PutOptions};

pub const COMMAND_REPLY: &str = "command_reply";
pub const INBOUND_PUSH: &str = "inbound_push";

/// Collaborators shared by every pipeline run.
pub struct PipelineContext {
    pub executor: Arc<dyn RemoteExecutor>,
    pub storage: Arc<dyn ObjectStore>,
    pub scripts: Arc<Scripts>,
    /// URL the push script sends contents to; contains the `%%ID%%` placeholder.
    pub callback_url: String,
    pub stage_timeout: Duration,
}

fn command_outcome(script: &'static str, reply: CommandReply) -> Result<(), StageError> {
    if reply.exit_status == 0 {
        return Ok(());
    }
    Err(StageError::CommandFailed {
        script,
        exit_status: reply.exit_status,
        stderr: reply.stderr,
    })
}

impl PipelineContext {
    /// Runs every stage on `logfile`, recording progress on it as stages succeed.
    pub async fn run(&self, host_id: &str, logfile: &mut LogFile) -> Result<(), StageError> {
        self.check_existing(logfile).await?;
        self.ensure_directory(logfile).await?;
        self.upload(host_id, logfile).await?;
        self.remove(host_id, logfile).await
    }

    pub async fn check_existing(&self, logfile: &mut LogFile) -> Result<(), StageError> {
        if logfile.uploaded() {
            return Ok(());
        }
        match self.storage.info(logfile.remote_path()).await {
            Ok(object) => {
                info!(
                    zone = %logfile.zonename(),
                    path = %logfile.local_path(),
                    remote_path = %logfile.remote_path(),
                    digest = %object.digest,
                    "already uploaded"
                );
                logfile.mark_uploaded(object.digest);
                Ok(())
            }
            Err(StorageError::NotFound) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn ensure_directory(&self, logfile: &LogFile) -> Result<(), StageError> {
        if logfile.uploaded() {
            return Ok(());
        }
        match parent_dir(logfile.remote_path()) {
            Some(dir) => Ok(self.storage.mkdirp(dir).await?),
            None => Ok(()),
        }
    }

    pub async fn upload(&self, host_id: &str, logfile: &mut LogFile) -> Result<(), StageError> {
        if logfile.uploaded() {
            return Ok(());
        }

        let args = [
            logfile.local_path().to_string(),
            self.callback_url.clone(),
            logfile.zonename().to_string(),
        ];
        let mut inflight =
            self.executor
                .send(host_id, &self.scripts.push(), &args, scripts::PUSH)?;
        inflight.start_timeout(self.stage_timeout);

        let mut join = CompletionJoin::new(&[COMMAND_REPLY, INBOUND_PUSH]);
        let mut digest = None;
        let result = loop {
            if join.is_drained() {
                break join.into_result();
            }
            match inflight.next_event().await {
                Some(InflightEvent::CommandReply(reply)) => {
                    debug!(id = %inflight.id(), exit_status = reply.exit_status, "push command replied");
                    join.arrive(COMMAND_REPLY, command_outcome(scripts::PUSH, reply));
                }
                Some(InflightEvent::InboundPush(push)) => {
                    if join.has_arrived(INBOUND_PUSH) {
                        warn!(id = %inflight.id(), "duplicate push rejected");
                        let _ = push.reply.send(false);
                        continue;
                    }
                    inflight.cancel_timeout();
                    let stored = self.store_push(logfile, push).await;
                    inflight.start_timeout(self.stage_timeout);
                    join.arrive(INBOUND_PUSH, stored.map(|md5| digest = Some(md5)));
                }
                Some(InflightEvent::Timeout) => {
                    break Err(StageError::Timeout {
                        script: scripts::PUSH,
                    })
                }
                None => {
                    break Err(StageError::Closed {
                        script: scripts::PUSH,
                    })
                }
            }
        };
        inflight.complete();
        result?;

        let Some(digest) = digest else {
            return Err(StageError::Protocol(
                "upload completed without a stored push".to_string(),
            ));
        };
        info!(
            host = %host_id,
            zone = %logfile.zonename(),
            path = %logfile.local_path(),
            remote_path = %logfile.remote_path(),
            digest = %digest,
            "uploaded"
        );
        logfile.mark_uploaded(digest);
        Ok(())
    }

    /// Writes pushed contents to storage, refusing to overwrite anything, and
    /// tells the pusher whether they were stored.
    async fn store_push(&self, logfile: &LogFile, push: InboundPush) -> Result<String, StageError> {
        let InboundPush {
            body,
            content_md5,
            content_length,
            reply,
        } = push;

        let stored = match content_md5 {
            None => Err(StageError::Protocol("push carried no content-md5".to_string())),
            Some(md5) => {
                let options = PutOptions {
                    content_md5: Some(md5.clone()),
                    content_length,
                    if_absent: true,
                };
                self.storage
                    .put(logfile.remote_path(), body, options)
                    .await
                    .map(|()| md5)
                    .map_err(StageError::from)
            }
        };

        if reply.send(stored.is_ok()).is_err() {
            debug!(path = %logfile.local_path(), "pusher went away before its verdict");
        }
        stored
    }

    pub async fn remove(&self, host_id: &str, logfile: &mut LogFile) -> Result<(), StageError> {
        if !logfile.uploaded() || logfile.removed() {
            return Ok(());
        }

        let args = [
            logfile.local_path().to_string(),
            logfile.remote_digest().unwrap_or_default().to_string(),
            logfile.zonename().to_string(),
        ];
        let mut inflight =
            self.executor
                .send(host_id, &self.scripts.remove(), &args, scripts::REMOVE)?;
        inflight.start_timeout(self.stage_timeout);
        let result = await_command(&mut inflight, scripts::REMOVE).await;
        inflight.complete();
        result?;

        if logfile.mark_removed() {
            info!(
                host = %host_id,
                zone = %logfile.zonename(),
                path = %logfile.local_path(),
                "removed local copy"
            );
        }
        Ok(())
    }
}

/// Waits for a single-channel command to finish. Pushes are not expected and
/// are refused.
async fn await_command(inflight: &mut Inflight, script: &'static str) -> Result<(), StageError> {
    loop {
        match inflight.next_event().await {
            Some(InflightEvent::CommandReply(reply)) => return command_outcome(script, reply),
            Some(InflightEvent::InboundPush(push)) => {
                warn!(id = %inflight.id(), script, "unexpected push rejected");
                let _ = push.reply.send(false);
            }
            Some(InflightEvent::Timeout) => return Err(StageError::Timeout { script }),
            None => return Err(StageError::Closed { script }),
        }
    }
}
