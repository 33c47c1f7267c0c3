// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::TransportUnavailable;
use crate::inflight::{CommandReply, Inflight, InflightRegister, CORRELATION_ID_PLACEHOLDER};

/// Runs scripts on fleet hosts.
pub trait RemoteExecutor: Send + Sync {
    /// Starts `script` on `host`. The returned handle later yields the
    /// command's reply; `label` names the command in logs and introspection.
    /// Occurrences of `%%ID%%` in `args` are replaced with the handle's id.
    fn send(
        &self,
        host: &str,
        script: &str,
        args: &[String],
        label: &'static str,
    ) -> Result<Inflight, TransportUnavailable>;
}

pub fn substitute_correlation_id(args: &[String], id: &str) -> Vec<String> {
    args.iter()
        .map(|arg| arg.replace(CORRELATION_ID_PLACEHOLDER, id))
        .collect()
}

#[derive(Debug, Serialize)]
struct CommandRequest {
    script: String,
    args: Vec<String>,
}

/// Sends commands to a command-execution API, one POST per command.
///
/// At most `max_inflight` commands are outstanding at once; beyond that the
/// transport reports itself unavailable instead of queueing.
#[derive(Debug, Clone)]
pub struct HttpCommandExecutor {
    client: reqwest::Client,
    command_url: String,
    register: InflightRegister,
    permits: Arc<Semaphore>,
}

impl HttpCommandExecutor {
    pub fn new(
        client: reqwest::Client,
        command_url: &str,
        register: InflightRegister,
        max_inflight: usize,
    ) -> Self {
        HttpCommandExecutor {
            client,
            command_url: command_url.trim_end_matches('/').to_string(),
            register,
            permits: Arc::new(Semaphore::new(max_inflight)),
        }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

async fn execute(client: &reqwest::Client, url: &str, request: &CommandRequest) -> CommandReply {
    let response = match client.post(url).json(request).send().await {
        Ok(response) => response,
        Err(e) => return CommandReply::failed(format!("command request failed: {e}")),
    };
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return CommandReply::failed(format!("command API responded {status}: {body}"));
    }
    match response.json::<CommandReply>().await {
        Ok(reply) => reply,
        Err(e) => CommandReply::failed(format!("could not decode command reply: {e}")),
    }
}

impl RemoteExecutor for HttpCommandExecutor {
    fn send(
        &self,
        host: &str,
        script: &str,
        args: &[String],
        label: &'static str,
    ) -> Result<Inflight, TransportUnavailable> {
        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            warn!(host = %host, label, "command transport saturated");
            return Err(TransportUnavailable);
        };

        let inflight = self.register.open(host, label);
        let id = inflight.id().to_string();
        let request = CommandRequest {
            script: script.to_string(),
            args: substitute_correlation_id(args, &id),
        };
        let url = format!("{}/servers/{}/execute", self.command_url, host);
        let client = self.client.clone();
        let register = self.register.clone();

        // the request is unbounded, so it lives only as long as its inflight
        let abandoned = self.register.closed(&id);

        tokio::spawn(async move {
            tokio::select! {
                reply = execute(&client, &url, &request) => {
                    drop(permit);
                    if !register.deliver_reply(&id, reply) {
                        debug!(id = %id, label, "reply for closed inflight dropped");
                    }
                }
                _ = abandoned => {
                    debug!(
                        id = %id,
                        label,
                        "inflight closed before reply, command request abandoned"
                    );
                }
            }
        });

        Ok(inflight)
    }
}
