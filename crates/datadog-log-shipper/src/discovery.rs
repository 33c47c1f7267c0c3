// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Deserialize;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::DiscoveryError;
use crate::host::{Host, HostState};
use crate::inflight::InflightEvent;
use crate::logfile::{LogFile, LogFileKey};
use crate::logsets::{Placement, Taxonomy};
use crate::registry::HostRegistry;
use crate::remote::RemoteExecutor;
use crate::scripts::{self, Scripts};
use crate::worker::UploadWorker;
use crate::zones::ZoneDirectory;

/// One entry of an enumeration reply.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DiscoveredLog {
    pub path: String,
    pub zonename: String,
    pub zonerole: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub generation: u64,
    pub added: usize,
    pub refreshed: usize,
    pub debounced: usize,
    pub unrecognized: usize,
    pub pruned: usize,
}

fn too_young(rotated_at: SystemTime, debounce: Duration, now: SystemTime) -> bool {
    match now.duration_since(rotated_at) {
        Ok(age) => age < debounce,
        // rotation stamped in the future
        Err(_) => true,
    }
}

/// Applies a parsed enumeration to a host's table.
///
/// The generation advances before any entry is applied, so every tracked file
/// the enumeration does not mention ends up stale and is pruned at the end.
pub fn apply_enumeration(
    host: &Host,
    state: &mut HostState,
    entries: &[DiscoveredLog],
    taxonomy: &dyn Taxonomy,
    user: &str,
    now: SystemTime,
) -> SweepReport {
    let generation = state.advance_generation();
    let mut report = SweepReport {
        generation,
        ..Default::default()
    };

    for entry in entries {
        let key = LogFileKey::new(&entry.zonename, &entry.path);
        if state.observe(&key) {
            report.refreshed += 1;
            continue;
        }

        let placement = Placement {
            user,
            datacenter: host.datacenter(),
            zonename: &entry.zonename,
            host_id: host.id(),
        };
        let Some(classification) = taxonomy.classify(&entry.path, &placement) else {
            warn!(
                host = %host.id(),
                zone = %entry.zonename,
                path = %entry.path,
                "no logset matches path"
            );
            report.unrecognized += 1;
            continue;
        };

        if let Some(rotated_at) = classification.rotated_at {
            if !classification.debounce.is_zero()
                && too_young(rotated_at, classification.debounce, now)
            {
                debug!(
                    host = %host.id(),
                    zone = %entry.zonename,
                    path = %entry.path,
                    "rotated too recently, skipping"
                );
                report.debounced += 1;
                continue;
            }
        }

        let logfile = LogFile::new(
            key,
            &entry.zonerole,
            classification.remote_path,
            generation,
        );
        info!(
            host = %host.id(),
            zone = %entry.zonename,
            path = %entry.path,
            remote_path = %logfile.remote_path(),
            logset = %classification.logset,
            "added new logfile"
        );
        state.logfiles_mut().insert(logfile);
        report.added += 1;
    }

    for logfile in state.prune() {
        if logfile.uploaded() {
            info!(
                host = %host.id(),
                zone = %logfile.zonename(),
                path = %logfile.local_path(),
                "logfile disappeared"
            );
        } else {
            // the file is gone locally and no remote copy was ever confirmed
            warn!(
                host = %host.id(),
                zone = %logfile.zonename(),
                path = %logfile.local_path(),
                uploaded = false,
                "logfile disappeared before upload"
            );
        }
        report.pruned += 1;
    }

    report
}

/// Periodic enumeration of every known host's log files.
pub struct Discovery {
    pub registry: Arc<HostRegistry>,
    pub executor: Arc<dyn RemoteExecutor>,
    pub taxonomy: Arc<dyn Taxonomy>,
    pub zones: Arc<dyn ZoneDirectory>,
    pub scripts: Arc<Scripts>,
    pub worker: Arc<UploadWorker>,
    pub storage_user: String,
    /// how long to wait for an enumeration reply
    pub reply_timeout: Duration,
}

impl Discovery {
    /// Runs one sweep of `host`. Skipped while the previous sweep of the same
    /// host is still waiting on its reply.
    pub async fn discover_one(&self, host: &Arc<Host>) -> Result<SweepReport, DiscoveryError> {
        let Some(_sweep) = host.try_begin_sweep() else {
            return Err(DiscoveryError::InProgress);
        };

        let zones = self.zones.zones_for_host(host.id());
        let script = self
            .scripts
            .enumerate(&self.taxonomy.discovery_document(&zones));
        let mut inflight = self
            .executor
            .send(host.id(), &script, &[], scripts::ENUMERATE)?;
        inflight.start_timeout(self.reply_timeout);

        let reply = loop {
            match inflight.next_event().await {
                Some(InflightEvent::CommandReply(reply)) => break reply,
                Some(InflightEvent::InboundPush(push)) => {
                    let _ = push.reply.send(false);
                }
                Some(InflightEvent::Timeout) => return Err(DiscoveryError::Timeout),
                None => return Err(DiscoveryError::Closed),
            }
        };
        inflight.complete();

        if reply.exit_status != 0 {
            return Err(DiscoveryError::CommandFailed {
                exit_status: reply.exit_status,
                stderr: reply.stderr,
            });
        }
        let entries: Vec<DiscoveredLog> = serde_json::from_str(&reply.stdout)?;

        let report = {
            let mut state = host.lock().await;
            apply_enumeration(
                host,
                &mut state,
                &entries,
                self.taxonomy.as_ref(),
                &self.storage_user,
                SystemTime::now(),
            )
        };
        if report.added > 0 {
            self.worker.trigger(Arc::clone(host));
        }
        Ok(report)
    }

    /// Sweeps every registered host in parallel and waits for all of them.
    pub async fn discover_all(self: &Arc<Self>) {
        let mut joinset = JoinSet::new();
        for host in self.registry.list().await {
            let discovery = Arc::clone(self);
            joinset.spawn(async move {
                match discovery.discover_one(&host).await {
                    Ok(report) => debug!(host = %host.id(), ?report, "sweep applied"),
                    Err(DiscoveryError::InProgress) => {
                        debug!(host = %host.id(), "previous sweep still outstanding")
                    }
                    Err(DiscoveryError::Timeout) => {
                        debug!(host = %host.id(), "enumeration timed out")
                    }
                    Err(e @ DiscoveryError::TransportUnavailable(_))
                    | Err(e @ DiscoveryError::Closed) => {
                        warn!(host = %host.id(), "discovery skipped: {e}")
                    }
                    Err(e) => error!(host = %host.id(), "discovery failed: {e}"),
                }
            });
        }
        while let Some(finished) = joinset.join_next().await {
            if let Err(e) = finished {
                error!("discovery task failed: {e}");
            }
        }
    }

    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        initial_delay: Duration,
        cancel: CancellationToken,
    ) {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(initial_delay) => {}
        }

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("discovery stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }
            self.discover_all().await;
        }
    }
}
