// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

use crate::logfile::{LogFile, LogFileKey, LogFileSnapshot, LogFileTable};

/// A machine in the fleet.
///
/// Everything discovery and the upload worker change lives in [`HostState`]
/// behind one async mutex, so the two never mutate a host's table at the same
/// time. Different hosts share nothing and proceed in parallel.
#[derive(Debug)]
pub struct Host {
    id: String,
    datacenter: String,
    version: String,
    last_seen_ms: AtomicU64,
    sweeping: AtomicBool,
    state: Mutex<HostState>,
}

impl Host {
    pub fn new(id: &str, datacenter: &str, version: &str) -> Self {
        Host {
            id: id.to_string(),
            datacenter: datacenter.to_string(),
            version: version.to_string(),
            last_seen_ms: AtomicU64::new(now_ms()),
            sweeping: AtomicBool::new(false),
            state: Mutex::new(HostState::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn datacenter(&self) -> &str {
        &self.datacenter
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Milliseconds since the epoch at which inventory last reported this host.
    pub fn last_seen_ms(&self) -> u64 {
        self.last_seen_ms.load(Ordering::Relaxed)
    }

    pub fn touch(&self) {
        self.last_seen_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub async fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().await
    }

    /// Claims the right to run a discovery sweep. `None` while an earlier sweep
    /// for this host is still waiting on its reply.
    pub fn try_begin_sweep(&self) -> Option<SweepGuard<'_>> {
        self.sweeping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SweepGuard { host: self })
    }

    pub async fn snapshot(&self) -> HostSnapshot {
        let now = Instant::now();
        let state = self.lock().await;
        HostSnapshot {
            id: self.id.clone(),
            datacenter: self.datacenter.clone(),
            version: self.version.clone(),
            last_seen_ms: self.last_seen_ms(),
            generation: state.generation,
            worker_active: state.worker_active,
            logfiles: state.logfiles.iter().map(|lf| lf.snapshot(now)).collect(),
        }
    }
}

pub struct SweepGuard<'a> {
    host: &'a Host,
}

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.host.sweeping.store(false, Ordering::Release);
    }
}

/// The mutable part of a host.
#[derive(Debug)]
pub struct HostState {
    generation: u64,
    logfiles: LogFileTable,
    worker_active: bool,
    /// earliest time a sleeping worker will look at this host again
    wake_at: Option<Instant>,
}

impl HostState {
    pub fn new() -> Self {
        HostState {
            generation: 1,
            logfiles: LogFileTable::default(),
            worker_active: false,
            wake_at: None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn logfiles(&self) -> &LogFileTable {
        &self.logfiles
    }

    pub fn logfiles_mut(&mut self) -> &mut LogFileTable {
        &mut self.logfiles
    }

    /// Starts a new discovery generation. Called once per enumeration that is
    /// about to be applied, before any of its entries.
    pub fn advance_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Refreshes a tracked file seen again in the current generation. Returns
    /// false if the file is not tracked.
    pub fn observe(&mut self, key: &LogFileKey) -> bool {
        let generation = self.generation;
        match self.logfiles.get_mut(key) {
            Some(lf) => {
                lf.observe(generation);
                true
            }
            None => false,
        }
    }

    /// Drops every file the current generation did not observe.
    pub fn prune(&mut self) -> Vec<LogFile> {
        self.logfiles.prune(self.generation)
    }

    pub fn worker_active(&self) -> bool {
        self.worker_active
    }

    /// Sets the worker-active flag. Returns false if it was already set.
    pub fn try_activate_worker(&mut self) -> bool {
        if self.worker_active {
            return false;
        }
        self.worker_active = true;
        true
    }

    pub fn deactivate_worker(&mut self) {
        self.worker_active = false;
    }

    /// Books a wake-up at `at`. Returns false if one is already booked for
    /// `at` or earlier, in which case the caller need not wait itself.
    pub fn schedule_wake(&mut self, at: Instant) -> bool {
        if self.wake_at.is_some_and(|booked| booked <= at) {
            return false;
        }
        self.wake_at = Some(at);
        true
    }

    /// Releases the booking made for `at`, if it is still the current one.
    pub fn clear_wake(&mut self, at: Instant) {
        if self.wake_at == Some(at) {
            self.wake_at = None;
        }
    }

    pub fn wake_at(&self) -> Option<Instant> {
        self.wake_at
    }
}

impl Default for HostState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HostSnapshot {
    pub id: String,
    pub datacenter: String,
    pub version: String,
    pub last_seen_ms: u64,
    pub generation: u64,
    pub worker_active: bool,
    pub logfiles: Vec<LogFileSnapshot>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
