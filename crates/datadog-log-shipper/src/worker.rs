// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::StageError;
use crate::host::Host;
use crate::logfile::{LogFileKey, Scan};
use crate::pipeline::PipelineContext;

/// What one worker pass over a host did.
#[derive(Debug)]
pub enum Pass {
    /// Another pass already holds the host's worker flag.
    Busy,
    /// Ran the pipeline on one file.
    Processed {
        key: LogFileKey,
        outcome: Result<(), StageError>,
    },
    /// Nothing eligible until the given time.
    Deferred(Instant),
    /// Nothing left to do.
    Idle,
}

/// Drains a host's log files through the pipeline, one file per pass.
///
/// At most one pass runs per host at a time. A failing file is put under a
/// fixed backoff and the worker moves on to its siblings.
pub struct UploadWorker {
    pipeline: Arc<PipelineContext>,
    backoff: Duration,
    reschedule_slack: Duration,
    cancel: CancellationToken,
}

impl UploadWorker {
    pub fn new(
        pipeline: Arc<PipelineContext>,
        backoff: Duration,
        reschedule_slack: Duration,
        cancel: CancellationToken,
    ) -> Self {
        UploadWorker {
            pipeline,
            backoff,
            reschedule_slack,
            cancel,
        }
    }

    /// Starts draining `host` in the background. Harmless if a worker is
    /// already running for it.
    pub fn trigger(self: &Arc<Self>, host: Arc<Host>) {
        let worker = Arc::clone(self);
        tokio::spawn(async move { worker.drive(host).await });
    }

    /// Keeps passing over `host` until it is idle, another worker owns it, or
    /// the shipper shuts down. Sleeps through backoff windows.
    pub async fn drive(&self, host: Arc<Host>) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            match self.pass(&host).await {
                Pass::Busy | Pass::Idle => return,
                Pass::Processed { .. } => continue,
                Pass::Deferred(until) => {
                    if !host.lock().await.schedule_wake(until) {
                        debug!(host = %host.id(), "worker already scheduled");
                        return;
                    }
                    debug!(
                        host = %host.id(),
                        delay_ms = until.saturating_duration_since(Instant::now()).as_millis() as u64,
                        "worker rescheduled"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            host.lock().await.clear_wake(until);
                            return;
                        }
                        _ = tokio::time::sleep_until(until) => {}
                    }
                    host.lock().await.clear_wake(until);
                }
            }
        }
    }

    /// Runs the pipeline on the first eligible file of `host`, if any.
    ///
    /// The host lock is held while choosing the file and while writing the
    /// result back, never across the pipeline itself.
    pub async fn pass(&self, host: &Host) -> Pass {
        let mut logfile = {
            let mut state = host.lock().await;
            if !state.try_activate_worker() {
                return Pass::Busy;
            }
            match state.logfiles_mut().next_eligible(Instant::now()) {
                Scan::Ready(logfile) => logfile,
                Scan::Deferred(until) => {
                    state.deactivate_worker();
                    return Pass::Deferred(until + self.reschedule_slack);
                }
                Scan::Idle => {
                    state.deactivate_worker();
                    return Pass::Idle;
                }
            }
        };

        let outcome = self.pipeline.run(host.id(), &mut logfile).await;
        if let Err(e) = &outcome {
            logfile.defer_until(Instant::now() + self.backoff);
            error!(
                host = %host.id(),
                zone = %logfile.zonename(),
                path = %logfile.local_path(),
                backoff_secs = self.backoff.as_secs(),
                "pipeline failed: {e}"
            );
        }

        let mut state = host.lock().await;
        if !state.logfiles_mut().commit(&logfile) {
            debug!(
                host = %host.id(),
                path = %logfile.local_path(),
                "logfile pruned while in the pipeline"
            );
        }
        state.deactivate_worker();
        Pass::Processed {
            key: logfile.key().clone(),
            outcome,
        }
    }
}
