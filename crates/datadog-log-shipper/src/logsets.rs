// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Recognition of rotated log file paths.
//!
//! A logset describes one family of rotated logs: where they live, a regex that
//! recognises their file names (with named captures for the rotation
//! timestamp), how long to wait after rotation before shipping, which zone roles
//! produce them, and a template for the remote destination path.
//!
//! Templates substitute `{user}`, `{datacenter}`, `{zonename}`, `{host}` and
//! `{logset}`, plus every named capture of the logset's regex (for example
//! `{year}` or `{hour}`).

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::NaiveDate;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::error::LogsetError;
use crate::zones::Zone;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogsetDefinition {
    pub name: String,
    pub search_dirs: Vec<String>,
    pub regex: String,
    /// seconds after rotation before a file is considered complete
    #[serde(default)]
    pub debounce_time: u64,
    /// zone roles this logset applies to
    pub zones: Vec<String>,
    pub manta_path: String,
}

#[derive(Debug)]
pub struct Logset {
    definition: LogsetDefinition,
    regex: Regex,
}

impl Logset {
    pub fn new(definition: LogsetDefinition) -> Result<Self, LogsetError> {
        let regex = Regex::new(&definition.regex).map_err(|source| LogsetError::Regex {
            name: definition.name.clone(),
            source,
        })?;
        Ok(Logset { definition, regex })
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.definition.debounce_time)
    }

    pub fn applies_to(&self, role: &str) -> bool {
        self.definition.zones.iter().any(|r| r == role)
    }

    fn captures<'p>(&self, local_path: &'p str) -> Option<Captures<'p>> {
        self.regex.captures(local_path)
    }

    /// Rotation time encoded in the file name, interpreted as UTC. `None` when
    /// the logset has no date captures or they do not form a valid time.
    fn rotation_time(&self, captures: &Captures<'_>) -> Option<SystemTime> {
        let part = |name: &str| -> Option<u32> { captures.name(name)?.as_str().parse().ok() };
        let year: i32 = captures.name("year")?.as_str().parse().ok()?;
        let date = NaiveDate::from_ymd_opt(year, part("month")?, part("day")?)?;
        let time = date.and_hms_opt(
            part("hour")?,
            part("minute").unwrap_or(0),
            part("second").unwrap_or(0),
        )?;
        let secs = u64::try_from(time.and_utc().timestamp()).ok()?;
        Some(UNIX_EPOCH + Duration::from_secs(secs))
    }

    fn remote_path(&self, captures: &Captures<'_>, placement: &Placement<'_>) -> String {
        let mut path = self
            .definition
            .manta_path
            .replace("{user}", placement.user)
            .replace("{datacenter}", placement.datacenter)
            .replace("{zonename}", placement.zonename)
            .replace("{host}", placement.host_id)
            .replace("{logset}", self.name());
        for name in self.regex.capture_names().flatten() {
            let value = captures.name(name).map_or("", |m| m.as_str());
            path = path.replace(&format!("{{{name}}}"), value);
        }
        path
    }
}

/// Where a log file is going: the storage account and the origin of the file.
#[derive(Debug, Clone, Copy)]
pub struct Placement<'a> {
    pub user: &'a str,
    pub datacenter: &'a str,
    pub zonename: &'a str,
    pub host_id: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub logset: String,
    pub remote_path: String,
    pub rotated_at: Option<SystemTime>,
    pub debounce: Duration,
}

pub trait Taxonomy: Send + Sync {
    /// Recognises a local log path. `None` if no logset claims it.
    fn classify(&self, local_path: &str, placement: &Placement<'_>) -> Option<Classification>;

    /// The logset description sent to a host's enumeration script, restricted
    /// to the logsets that apply to the given zones.
    fn discovery_document(&self, zones: &[Zone]) -> String;
}

#[derive(Debug, Serialize)]
struct DiscoveryEntry<'a> {
    name: &'a str,
    search_dirs: &'a [String],
    regex: &'a str,
    zones: Vec<&'a str>,
}

#[derive(Debug, Default)]
pub struct LogsetCatalog {
    logsets: Vec<Arc<Logset>>,
}

impl LogsetCatalog {
    pub fn from_definitions(definitions: Vec<LogsetDefinition>) -> Result<Self, LogsetError> {
        let logsets = definitions
            .into_iter()
            .map(|d| Logset::new(d).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(LogsetCatalog { logsets })
    }

    pub fn from_json(json: &str) -> Result<Self, LogsetError> {
        Self::from_definitions(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self, LogsetError> {
        let json = std::fs::read_to_string(path).map_err(|source| LogsetError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn len(&self) -> usize {
        self.logsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logsets.is_empty()
    }
}

impl Taxonomy for LogsetCatalog {
    fn classify(&self, local_path: &str, placement: &Placement<'_>) -> Option<Classification> {
        self.logsets.iter().find_map(|logset| {
            let captures = logset.captures(local_path)?;
            Some(Classification {
                logset: logset.name().to_string(),
                remote_path: logset.remote_path(&captures, placement),
                rotated_at: logset.rotation_time(&captures),
                debounce: logset.debounce(),
            })
        })
    }

    fn discovery_document(&self, zones: &[Zone]) -> String {
        let entries: Vec<DiscoveryEntry<'_>> = self
            .logsets
            .iter()
            .filter_map(|logset| {
                let zonenames: Vec<&str> = zones
                    .iter()
                    .filter(|zone| logset.applies_to(&zone.role))
                    .map(|zone| zone.name.as_str())
                    .collect();
                if zonenames.is_empty() {
                    return None;
                }
                Some(DiscoveryEntry {
                    name: logset.name(),
                    search_dirs: &logset.definition.search_dirs,
                    regex: &logset.definition.regex,
                    zones: zonenames,
                })
            })
            .collect();
        serde_json::to_string(&entries).unwrap_or_else(|_| "[]".to_string())
    }
}
