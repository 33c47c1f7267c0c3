// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tracked log files for one host and the rules that move them through their
//! lifecycle.
//!
//! A [`LogFile`] is created by discovery on first sighting, refreshed by every
//! later sweep that still reports it, and advanced by the upload worker through
//! `uploaded` and `removed`. Records are dropped from the [`LogFileTable`] when a
//! completed sweep no longer reports them, whatever their upload state.

use serde::Serialize;
use tokio::time::Instant;

/// Identity of a log file within a host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct LogFileKey {
    pub zonename: String,
    pub local_path: String,
}

impl LogFileKey {
    pub fn new(zonename: &str, local_path: &str) -> Self {
        LogFileKey {
            zonename: zonename.to_string(),
            local_path: local_path.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogFile {
    key: LogFileKey,
    zonerole: String,
    remote_path: String,
    uploaded: bool,
    remote_digest: Option<String>,
    removed: bool,
    ignore_until: Option<Instant>,
    generation: u64,
    /// generation in which this record was created; distinguishes a record from
    /// a later one with the same key after a prune
    created_in: u64,
}

impl LogFile {
    pub fn new(key: LogFileKey, zonerole: &str, remote_path: String, generation: u64) -> Self {
        LogFile {
            key,
            zonerole: zonerole.to_string(),
            remote_path,
            uploaded: false,
            remote_digest: None,
            removed: false,
            ignore_until: None,
            generation,
            created_in: generation,
        }
    }

    pub fn key(&self) -> &LogFileKey {
        &self.key
    }

    pub fn zonename(&self) -> &str {
        &self.key.zonename
    }

    pub fn local_path(&self) -> &str {
        &self.key.local_path
    }

    pub fn zonerole(&self) -> &str {
        &self.zonerole
    }

    pub fn remote_path(&self) -> &str {
        &self.remote_path
    }

    pub fn uploaded(&self) -> bool {
        self.uploaded
    }

    pub fn remote_digest(&self) -> Option<&str> {
        self.remote_digest.as_deref()
    }

    pub fn removed(&self) -> bool {
        self.removed
    }

    pub fn ignore_until(&self) -> Option<Instant> {
        self.ignore_until
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Nothing left to do: the remote copy is confirmed and the local one gone.
    pub fn is_done(&self) -> bool {
        self.uploaded && self.removed
    }

    /// Records a confirmed remote copy along with its digest.
    pub fn mark_uploaded(&mut self, digest: String) {
        self.uploaded = true;
        self.remote_digest = Some(digest);
    }

    /// Records that the local copy was deleted. Refused unless the remote copy
    /// was confirmed first.
    pub fn mark_removed(&mut self) -> bool {
        if !self.uploaded {
            return false;
        }
        self.removed = true;
        true
    }

    /// Discovery saw this file again in `generation`. A file that reappears
    /// after removal is treated as new local data.
    pub fn observe(&mut self, generation: u64) {
        self.generation = generation;
        self.removed = false;
    }

    pub fn defer_until(&mut self, deadline: Instant) {
        self.ignore_until = Some(deadline);
    }

    fn deferred_at(&self, now: Instant) -> Option<Instant> {
        self.ignore_until.filter(|until| now < *until)
    }

    pub fn snapshot(&self, now: Instant) -> LogFileSnapshot {
        LogFileSnapshot {
            zonename: self.key.zonename.clone(),
            zonerole: self.zonerole.clone(),
            local_path: self.key.local_path.clone(),
            remote_path: self.remote_path.clone(),
            uploaded: self.uploaded,
            remote_digest: self.remote_digest.clone(),
            removed: self.removed,
            generation: self.generation,
            ignore_for_ms: self
                .deferred_at(now)
                .map(|until| until.duration_since(now).as_millis() as u64),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogFileSnapshot {
    pub zonename: String,
    pub zonerole: String,
    pub local_path: String,
    pub remote_path: String,
    pub uploaded: bool,
    pub remote_digest: Option<String>,
    pub removed: bool,
    pub generation: u64,
    pub ignore_for_ms: Option<u64>,
}

/// Result of scanning the table for work.
#[derive(Debug)]
pub enum Scan {
    /// Copy of the first record with work left to do.
    Ready(LogFile),
    /// Nothing ready; the earliest backoff deadline among skipped records.
    Deferred(Instant),
    Idle,
}

/// Log files of one host, kept in discovery order.
#[derive(Debug, Default)]
pub struct LogFileTable {
    files: Vec<LogFile>,
}

impl LogFileTable {
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogFile> {
        self.files.iter()
    }

    pub fn get(&self, key: &LogFileKey) -> Option<&LogFile> {
        self.files.iter().find(|lf| lf.key == *key)
    }

    pub fn get_mut(&mut self, key: &LogFileKey) -> Option<&mut LogFile> {
        self.files.iter_mut().find(|lf| lf.key == *key)
    }

    /// Appends a record. Returns false, leaving the table untouched, if the key
    /// is already tracked.
    pub fn insert(&mut self, logfile: LogFile) -> bool {
        if self.get(&logfile.key).is_some() {
            return false;
        }
        self.files.push(logfile);
        true
    }

    /// Drops every record not observed in `generation` and returns them.
    pub fn prune(&mut self, generation: u64) -> Vec<LogFile> {
        let (kept, stale): (Vec<LogFile>, Vec<LogFile>) = std::mem::take(&mut self.files)
            .into_iter()
            .partition(|lf| lf.generation == generation);
        self.files = kept;
        stale
    }

    /// Walks the table in order, skipping records under backoff and records with
    /// nothing left to do. Expired backoff deadlines are cleared on the way.
    pub fn next_eligible(&mut self, now: Instant) -> Scan {
        let mut until: Option<Instant> = None;

        for lf in self.files.iter_mut() {
            if let Some(deadline) = lf.deferred_at(now) {
                until = Some(until.map_or(deadline, |u| u.min(deadline)));
                continue;
            }
            lf.ignore_until = None;

            if lf.is_done() {
                continue;
            }
            return Scan::Ready(lf.clone());
        }

        match until {
            Some(deadline) => Scan::Deferred(deadline),
            None => Scan::Idle,
        }
    }

    /// Writes the worker's progress on a copy back into the tracked record.
    ///
    /// Only the fields the pipeline owns are copied; the generation belongs to
    /// discovery. Returns false if the record was pruned (or pruned and created
    /// again) while the copy was being worked on.
    pub fn commit(&mut self, progress: &LogFile) -> bool {
        let Some(lf) = self.get_mut(&progress.key) else {
            return false;
        };
        if lf.created_in != progress.created_in {
            return false;
        }
        if progress.uploaded && !lf.uploaded {
            lf.uploaded = true;
            lf.remote_digest = progress.remote_digest.clone();
        }
        if progress.removed {
            lf.removed = true;
        }
        lf.ignore_until = progress.ignore_until;
        true
    }
}
