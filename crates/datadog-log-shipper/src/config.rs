// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::zones::{parse_zone_list, Zone};

const DEFAULT_ADMIN_IP: &str = "127.0.0.1";
const DEFAULT_SCRIPTS_DIR: &str = "./scripts";
const DEFAULT_LOGSETS_PATH: &str = "./etc/logsets.json";
const DEFAULT_ZONES: &str = "global:global";
const DEFAULT_DISCOVERY_INTERVAL_SECS: u64 = 60;
const DEFAULT_DISCOVERY_INITIAL_DELAY_SECS: u64 = 15;
const DEFAULT_INVENTORY_INTERVAL_SECS: u64 = 60;
const DEFAULT_MAX_INFLIGHT: usize = 1000;

#[derive(Debug, Clone)]
pub struct Config {
    /// base URL of the object store
    pub storage_url: String,
    /// account owning the uploaded logs; first component of every remote path
    pub storage_user: String,
    /// base URL of the remote command-execution API
    pub command_url: String,
    /// base URL of the fleet inventory API
    pub inventory_url: String,
    /// address hosts use to push log contents back to the ingress server
    pub admin_ip: String,
    /// ingress server port, 0 for an OS-assigned port
    pub port: u16,
    pub scripts_dir: PathBuf,
    pub logsets_path: PathBuf,
    pub zones: Vec<Zone>,
    /// how often every host is asked to enumerate its log files
    pub discovery_interval: Duration,
    pub discovery_initial_delay: Duration,
    /// fraction of the discovery interval to wait for an enumeration reply
    pub discovery_timeout_ratio: f64,
    pub inventory_interval: Duration,
    /// how long a log file is skipped after any pipeline stage fails
    pub backoff: Duration,
    /// added to the earliest backoff deadline before the worker wakes again
    pub reschedule_slack: Duration,
    /// deadline for each remote command issued by the pipeline
    pub stage_timeout: Duration,
    /// remote commands in flight before the transport reports unavailable
    pub max_inflight: usize,
    pub max_push_content_length: usize,
    pub storage_request_timeout: Duration,
    pub storage_connect_timeout: Duration,
    pub proxy_url: Option<String>,
}

impl Config {
    pub fn new() -> Result<Config, Box<dyn std::error::Error>> {
        let storage_url = required("DD_LOG_SHIPPER_STORAGE_URL")?;
        let storage_user = required("DD_LOG_SHIPPER_STORAGE_USER")?;
        let command_url = required("DD_LOG_SHIPPER_COMMAND_URL")?;
        let inventory_url = required("DD_LOG_SHIPPER_INVENTORY_URL")?;

        let mut config = Config::with_endpoints(
            &storage_url,
            &storage_user,
            &command_url,
            &inventory_url,
        );

        if let Ok(admin_ip) = env::var("DD_LOG_SHIPPER_ADMIN_IP") {
            config.admin_ip = admin_ip;
        }
        config.port = env::var("DD_LOG_SHIPPER_PORT")
            .ok()
            .and_then(|port| port.parse::<u16>().ok())
            .unwrap_or(config.port);
        if let Ok(dir) = env::var("DD_LOG_SHIPPER_SCRIPTS_DIR") {
            config.scripts_dir = PathBuf::from(dir);
        }
        if let Ok(path) = env::var("DD_LOG_SHIPPER_LOGSETS_PATH") {
            config.logsets_path = PathBuf::from(path);
        }
        if let Ok(zones) = env::var("DD_LOG_SHIPPER_ZONES") {
            config.zones = parse_zone_list(&zones);
            if config.zones.is_empty() {
                return Err(anyhow::anyhow!(
                    "DD_LOG_SHIPPER_ZONES does not contain any name:role entries"
                )
                .into());
            }
        }
        config.discovery_interval = Duration::from_secs(env_u64(
            "DD_LOG_SHIPPER_DISCOVERY_INTERVAL_SECS",
            DEFAULT_DISCOVERY_INTERVAL_SECS,
        ));
        config.discovery_initial_delay = Duration::from_secs(env_u64(
            "DD_LOG_SHIPPER_DISCOVERY_INITIAL_DELAY_SECS",
            DEFAULT_DISCOVERY_INITIAL_DELAY_SECS,
        ));
        config.inventory_interval = Duration::from_secs(env_u64(
            "DD_LOG_SHIPPER_INVENTORY_INTERVAL_SECS",
            DEFAULT_INVENTORY_INTERVAL_SECS,
        ));
        config.max_inflight = env::var("DD_LOG_SHIPPER_MAX_INFLIGHT")
            .ok()
            .and_then(|max| max.parse::<usize>().ok())
            .unwrap_or(DEFAULT_MAX_INFLIGHT);
        config.proxy_url = env::var("DD_PROXY_HTTPS")
            .or_else(|_| env::var("HTTPS_PROXY"))
            .ok();

        if config.discovery_interval.is_zero() {
            return Err(anyhow::anyhow!("discovery interval must be greater than zero").into());
        }

        Ok(config)
    }

    /// Builds a configuration with every optional setting at its default.
    pub fn with_endpoints(
        storage_url: &str,
        storage_user: &str,
        command_url: &str,
        inventory_url: &str,
    ) -> Config {
        Config {
            storage_url: storage_url.trim_end_matches('/').to_string(),
            storage_user: storage_user.to_string(),
            command_url: command_url.trim_end_matches('/').to_string(),
            inventory_url: inventory_url.trim_end_matches('/').to_string(),
            admin_ip: DEFAULT_ADMIN_IP.to_string(),
            port: 0,
            scripts_dir: PathBuf::from(DEFAULT_SCRIPTS_DIR),
            logsets_path: PathBuf::from(DEFAULT_LOGSETS_PATH),
            zones: parse_zone_list(DEFAULT_ZONES),
            discovery_interval: Duration::from_secs(DEFAULT_DISCOVERY_INTERVAL_SECS),
            discovery_initial_delay: Duration::from_secs(DEFAULT_DISCOVERY_INITIAL_DELAY_SECS),
            discovery_timeout_ratio: 0.85,
            inventory_interval: Duration::from_secs(DEFAULT_INVENTORY_INTERVAL_SECS),
            backoff: Duration::from_secs(120),
            reschedule_slack: Duration::from_secs(1),
            stage_timeout: Duration::from_secs(30),
            max_inflight: DEFAULT_MAX_INFLIGHT,
            max_push_content_length: 1024 * 1024 * 1024, // 1GiB in Bytes
            storage_request_timeout: Duration::from_secs(60),
            storage_connect_timeout: Duration::from_secs(15),
            proxy_url: None,
        }
    }

    /// How long a discovery sweep waits for the enumeration reply.
    pub fn discovery_timeout(&self) -> Duration {
        self.discovery_interval.mul_f64(self.discovery_timeout_ratio)
    }
}

fn required(name: &str) -> Result<String, anyhow::Error> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(anyhow::anyhow!("{name} environment variable is not set")),
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}
