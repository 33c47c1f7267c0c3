// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::discovery::Discovery;
use crate::error::ShipperError;
use crate::http_utils::build_client;
use crate::inflight::{InflightRegister, CORRELATION_ID_PLACEHOLDER};
use crate::ingress::IngressServer;
use crate::inventory::{HttpInventory, InventoryPoller, InventorySource};
use crate::logsets::{LogsetCatalog, Taxonomy};
use crate::pipeline::PipelineContext;
use crate::registry::HostRegistry;
use crate::remote::{HttpCommandExecutor, RemoteExecutor};
use crate::scripts::Scripts;
use crate::storage::{HttpObjectStore, ObjectStore};
use crate::worker::UploadWorker;
use crate::zones::{StaticZoneDirectory, ZoneDirectory};

/// Everything the shipper runs on. Built from [`Config`] by
/// [`LogShipper::from_config`], or assembled by hand with other collaborators.
pub struct LogShipper {
    pub config: Arc<Config>,
    pub scripts: Arc<Scripts>,
    pub register: InflightRegister,
    pub registry: Arc<HostRegistry>,
    pub executor: Arc<dyn RemoteExecutor>,
    pub storage: Arc<dyn ObjectStore>,
    pub inventory: Arc<dyn InventorySource>,
    pub taxonomy: Arc<dyn Taxonomy>,
    pub zones: Arc<dyn ZoneDirectory>,
}

/// A running shipper.
pub struct ShipperHandle {
    pub local_addr: SocketAddr,
    pub callback_url: String,
    pub registry: Arc<HostRegistry>,
    pub register: InflightRegister,
    pub discovery: Arc<Discovery>,
    tasks: JoinSet<()>,
}

impl ShipperHandle {
    /// Waits for every loop to stop, which happens once the start token is
    /// cancelled.
    pub async fn wait(mut self) {
        while let Some(finished) = self.tasks.join_next().await {
            if let Err(e) = finished {
                error!("shipper task failed: {e}");
            }
        }
    }
}

impl LogShipper {
    pub fn from_config(config: Arc<Config>) -> Result<Self, ShipperError> {
        let scripts = Scripts::load(&config.scripts_dir)?;
        let taxonomy = LogsetCatalog::load(&config.logsets_path)?;
        info!(
            scripts = ?scripts.names(),
            logsets = taxonomy.len(),
            "loaded scripts and logsets"
        );

        // object writes and command requests last as long as a push does, so
        // only their connects are bounded here
        let client = build_client(
            config.proxy_url.as_deref(),
            None,
            config.storage_connect_timeout,
        )
        .map_err(|e| ShipperError::Client(e.to_string()))?;
        let command_client = build_client(None, None, config.storage_connect_timeout)
            .map_err(|e| ShipperError::Client(e.to_string()))?;
        let inventory_client = build_client(
            None,
            Some(config.storage_request_timeout),
            config.storage_connect_timeout,
        )
        .map_err(|e| ShipperError::Client(e.to_string()))?;

        let register = InflightRegister::new();
        let executor = HttpCommandExecutor::new(
            command_client,
            &config.command_url,
            register.clone(),
            config.max_inflight,
        );
        let storage = HttpObjectStore::new(
            client,
            &config.storage_url,
            &config.storage_user,
            config.storage_request_timeout,
        );
        let inventory = HttpInventory::new(inventory_client, &config.inventory_url);
        let zones = StaticZoneDirectory::new(config.zones.clone());

        Ok(LogShipper {
            scripts: Arc::new(scripts),
            register,
            registry: Arc::new(HostRegistry::new()),
            executor: Arc::new(executor),
            storage: Arc::new(storage),
            inventory: Arc::new(inventory),
            taxonomy: Arc::new(taxonomy),
            zones: Arc::new(zones),
            config,
        })
    }

    /// Binds the ingress server, then starts the ingress, inventory and
    /// discovery loops. All of them stop when `cancel` is cancelled.
    pub async fn start(self, cancel: CancellationToken) -> Result<ShipperHandle, ShipperError> {
        let now = Instant::now();
        let config = Arc::clone(&self.config);

        let listener = TcpListener::bind((config.admin_ip.as_str(), config.port)).await?;
        let local_addr = listener.local_addr()?;
        let callback_url = format!(
            "http://{}:{}/pushlog/{CORRELATION_ID_PLACEHOLDER}",
            config.admin_ip,
            local_addr.port()
        );

        let pipeline = Arc::new(PipelineContext {
            executor: Arc::clone(&self.executor),
            storage: Arc::clone(&self.storage),
            scripts: Arc::clone(&self.scripts),
            callback_url: callback_url.clone(),
            stage_timeout: config.stage_timeout,
        });
        let worker = Arc::new(UploadWorker::new(
            pipeline,
            config.backoff,
            config.reschedule_slack,
            cancel.clone(),
        ));
        let discovery = Arc::new(Discovery {
            registry: Arc::clone(&self.registry),
            executor: Arc::clone(&self.executor),
            taxonomy: Arc::clone(&self.taxonomy),
            zones: Arc::clone(&self.zones),
            scripts: Arc::clone(&self.scripts),
            worker,
            storage_user: config.storage_user.clone(),
            reply_timeout: config.discovery_timeout(),
        });

        let mut tasks = JoinSet::new();

        let ingress = Arc::new(IngressServer {
            register: self.register.clone(),
            registry: Arc::clone(&self.registry),
            max_content_length: config.max_push_content_length as u64,
            push_idle_timeout: config.stage_timeout,
        });
        let ingress_cancel = cancel.clone();
        tasks.spawn(async move {
            if let Err(e) = ingress.serve(listener, ingress_cancel).await {
                error!("Error when running ingress server: {e}");
            }
        });

        let poller = InventoryPoller {
            source: Arc::clone(&self.inventory),
            registry: Arc::clone(&self.registry),
        };
        tasks.spawn(poller.run(config.inventory_interval, cancel.clone()));

        tasks.spawn(Arc::clone(&discovery).run(
            config.discovery_interval,
            config.discovery_initial_delay,
            cancel,
        ));

        info!(address = %local_addr, callback_url = %callback_url, "log shipper started");
        debug!(
            "Time taken to start the log shipper: {} ms",
            now.elapsed().as_millis()
        );

        Ok(ShipperHandle {
            local_addr,
            callback_url,
            registry: self.registry,
            register: self.register,
            discovery,
            tasks,
        })
    }
}
