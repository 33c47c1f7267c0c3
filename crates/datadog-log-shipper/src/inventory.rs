// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::InventoryError;
use crate::registry::HostRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryHost {
    pub host_id: String,
    pub datacenter: Option<String>,
    pub version: Option<String>,
    pub setup: bool,
}

/// A snapshot source of the fleet.
#[async_trait]
pub trait InventorySource: Send + Sync {
    async fn list_hosts(&self) -> Result<Vec<InventoryHost>, InventoryError>;
}

#[derive(Debug, Deserialize)]
struct ServerRecord {
    uuid: String,
    #[serde(default)]
    datacenter: Option<String>,
    #[serde(default)]
    setup: bool,
    #[serde(default)]
    sysinfo: HashMap<String, serde_json::Value>,
}

impl From<ServerRecord> for InventoryHost {
    fn from(record: ServerRecord) -> Self {
        let version = record
            .sysinfo
            .get("SDC Version")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string);
        InventoryHost {
            host_id: record.uuid,
            datacenter: record.datacenter,
            version,
            setup: record.setup,
        }
    }
}

/// Inventory API that lists servers with their system information.
#[derive(Debug, Clone)]
pub struct HttpInventory {
    client: reqwest::Client,
    url: String,
}

impl HttpInventory {
    pub fn new(client: reqwest::Client, url: &str) -> Self {
        HttpInventory {
            client,
            url: url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl InventorySource for HttpInventory {
    async fn list_hosts(&self) -> Result<Vec<InventoryHost>, InventoryError> {
        let response = self
            .client
            .get(format!("{}/servers", self.url))
            .query(&[("extras", "sysinfo")])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(InventoryError::Status {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        let records: Vec<ServerRecord> = response.json().await?;
        Ok(records.into_iter().map(InventoryHost::from).collect())
    }
}

/// Keeps the host registry in step with the inventory.
pub struct InventoryPoller {
    pub source: Arc<dyn InventorySource>,
    pub registry: Arc<HostRegistry>,
}

impl InventoryPoller {
    /// Registers or refreshes every usable host. Returns how many were.
    pub async fn poll_once(&self) -> Result<usize, InventoryError> {
        let mut updated = 0;
        for host in self.source.list_hosts().await? {
            if !host.setup {
                debug!(host = %host.host_id, "ignoring host that is not set up");
                continue;
            }
            // only hosts reporting a platform version are managed
            let Some(version) = host.version.as_deref() else {
                warn!(host = %host.host_id, "ignoring host without an SDC version");
                continue;
            };
            let Some(datacenter) = host.datacenter.as_deref().filter(|dc| !dc.trim().is_empty())
            else {
                warn!(host = %host.host_id, "ignoring host without a datacenter");
                continue;
            };
            self.registry
                .update(&host.host_id, datacenter, version)
                .await;
            updated += 1;
        }
        Ok(updated)
    }

    /// Polls immediately, then every `interval` until cancelled.
    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("inventory poller stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }
            match self.poll_once().await {
                Ok(count) => debug!(hosts = count, "inventory refreshed"),
                Err(e) => error!("inventory poll failed: {e}"),
            }
        }
    }
}
