// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::Serialize;

/// A zone on a host whose logs are enumerated, and the role that decides which
/// logsets apply to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Zone {
    pub name: String,
    pub role: String,
}

impl Zone {
    pub fn new(name: &str, role: &str) -> Self {
        Zone {
            name: name.to_string(),
            role: role.to_string(),
        }
    }
}

/// Parses a `name:role` list. Entries may be separated by commas or whitespace;
/// malformed entries are dropped.
pub fn parse_zone_list(list: &str) -> Vec<Zone> {
    let normalized = list.replace(',', " ");
    normalized
        .split_whitespace()
        .filter_map(|entry| {
            let (name, role) = entry.split_once(':')?;
            if name.is_empty() || role.is_empty() || role.contains(':') {
                return None;
            }
            Some(Zone::new(name, role))
        })
        .collect()
}

pub trait ZoneDirectory: Send + Sync {
    fn zones_for_host(&self, host_id: &str) -> Vec<Zone>;
}

/// Every host is enumerated for the same set of zones.
#[derive(Debug, Clone)]
pub struct StaticZoneDirectory {
    zones: Vec<Zone>,
}

impl StaticZoneDirectory {
    pub fn new(zones: Vec<Zone>) -> Self {
        StaticZoneDirectory { zones }
    }
}

impl ZoneDirectory for StaticZoneDirectory {
    fn zones_for_host(&self, _host_id: &str) -> Vec<Zone> {
        self.zones.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_zone_list_mixed_separators() {
        let zones = parse_zone_list("global:global,3f1a:moray 8bc2:manatee");
        assert_eq!(
            zones,
            vec![
                Zone::new("global", "global"),
                Zone::new("3f1a", "moray"),
                Zone::new("8bc2", "manatee"),
            ]
        );
    }

    #[test]
    fn test_parse_zone_list_drops_malformed() {
        let zones = parse_zone_list("global,:role,zone:,a:b:c,ok:web");
        assert_eq!(zones, vec![Zone::new("ok", "web")]);
    }

    #[test]
    fn test_static_directory_returns_same_zones_for_every_host() {
        let directory = StaticZoneDirectory::new(vec![Zone::new("global", "global")]);
        assert_eq!(
            directory.zones_for_host("h1"),
            directory.zones_for_host("h2")
        );
    }
}
