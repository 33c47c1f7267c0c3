// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, sync::Arc};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use datadog_log_shipper::{config::Config, shipper::LogShipper};

const CONFIG_RETRY_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
pub async fn main() {
    let log_level = env::var("DD_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,reqwest=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = load_config().await;

    let shipper = match LogShipper::from_config(Arc::clone(&config)) {
        Ok(shipper) => shipper,
        Err(e) => {
            error!("Error creating log shipper: {e}");
            return;
        }
    };

    let cancel = CancellationToken::new();
    let handle = match shipper.start(cancel.clone()).await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Error starting log shipper: {e}");
            return;
        }
    };

    shutdown_signal().await;
    info!("shutting down log shipper");
    cancel.cancel();
    handle.wait().await;
}

/// Reads the configuration, retrying until the environment provides a valid one.
async fn load_config() -> Arc<Config> {
    let mut warned = false;
    loop {
        match Config::new() {
            Ok(config) => return Arc::new(config),
            Err(e) => {
                if !warned {
                    warn!(
                        "Invalid configuration, retrying every {}s: {e}",
                        CONFIG_RETRY_INTERVAL.as_secs()
                    );
                    warned = true;
                } else {
                    debug!("Configuration still invalid: {e}");
                }
            }
        }
        sleep(CONFIG_RETRY_INTERVAL).await;
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            error!("Unable to listen for SIGTERM: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
