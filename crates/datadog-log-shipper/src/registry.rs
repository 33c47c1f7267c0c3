// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::host::Host;

/// Every host the shipper knows about, keyed by identity.
///
/// Populated by the inventory poller, read by discovery and the ingress server.
/// Hosts are never removed; one that drops out of inventory simply stops having
/// its `last_seen` refreshed.
#[derive(Debug, Default)]
pub struct HostRegistry {
    hosts: RwLock<HashMap<String, Arc<Host>>>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a host on first sighting, otherwise refreshes its last-seen time.
    pub async fn update(&self, id: &str, datacenter: &str, version: &str) -> Arc<Host> {
        if let Some(host) = self.hosts.read().await.get(id) {
            host.touch();
            return Arc::clone(host);
        }

        let mut hosts = self.hosts.write().await;
        let host = hosts.entry(id.to_string()).or_insert_with(|| {
            info!(host = %id, datacenter = %datacenter, version = %version, "new host");
            Arc::new(Host::new(id, datacenter, version))
        });
        host.touch();
        Arc::clone(host)
    }

    pub async fn lookup(&self, id: &str) -> Option<Arc<Host>> {
        self.hosts.read().await.get(id).cloned()
    }

    /// All hosts, ordered by identity.
    pub async fn list(&self) -> Vec<Arc<Host>> {
        let mut hosts: Vec<Arc<Host>> = self.hosts.read().await.values().cloned().collect();
        hosts.sort_by(|a, b| a.id().cmp(b.id()));
        hosts
    }

    pub async fn ids(&self) -> Vec<String> {
        self.list()
            .await
            .iter()
            .map(|host| host.id().to_string())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.hosts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.hosts.read().await.is_empty()
    }
}
