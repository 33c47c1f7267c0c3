// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use datadog_log_shipper::{
    host::Host,
    logfile::{LogFile, LogFileKey},
    pipeline::PipelineContext,
    remote::RemoteExecutor,
    scripts::{self, Scripts},
    storage::ObjectStore,
};
use http_body_util::Full;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::time::timeout;

pub const CALLBACK_URL: &str = "http://10.0.0.1:2020/pushlog/%%ID%%";
pub const STAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Script table with recognisable bodies for every required script.
pub fn scripts() -> Arc<Scripts> {
    let map = HashMap::from([
        (
            scripts::ENUMERATE.to_string(),
            "#!/bin/bash\nfind_logs '%%LOGSETS%%'\n".to_string(),
        ),
        (scripts::PUSH.to_string(), "#!/bin/bash\npush \"$@\"\n".to_string()),
        (scripts::REMOVE.to_string(), "#!/bin/bash\nrm_log \"$@\"\n".to_string()),
    ]);
    Arc::new(Scripts::from_map(map).expect("test scripts are complete"))
}

pub fn pipeline(
    executor: Arc<dyn RemoteExecutor>,
    storage: Arc<dyn ObjectStore>,
) -> Arc<PipelineContext> {
    Arc::new(PipelineContext {
        executor,
        storage,
        scripts: scripts(),
        callback_url: CALLBACK_URL.to_string(),
        stage_timeout: STAGE_TIMEOUT,
    })
}

/// A fresh record for `/var/log/{name}` in zone `z1`.
pub fn logfile(name: &str) -> LogFile {
    LogFile::new(
        LogFileKey::new("z1", &format!("/var/log/{name}")),
        "core",
        format!("/poseidon/stor/logs/z1/{name}"),
        1,
    )
}

/// Host `h1` tracking one fresh record per name, in order.
pub async fn host_with_files(names: &[&str]) -> Arc<Host> {
    let host = Arc::new(Host::new("h1", "us-east-1", "7.0"));
    {
        let mut state = host.lock().await;
        let generation = state.generation();
        for name in names {
            state.logfiles_mut().insert(LogFile::new(
                LogFileKey::new("z1", &format!("/var/log/{name}")),
                "core",
                format!("/poseidon/stor/logs/z1/{name}"),
                generation,
            ));
        }
    }
    host
}

/// Send an HTTP request over TCP and return the response
pub async fn send_tcp_request(
    port: u16,
    uri: &str,
    method: &str,
    headers: &[(&str, &str)],
    body: Option<Vec<u8>>,
) -> Result<Response<hyper::body::Incoming>, Box<dyn std::error::Error>> {
    let stream = timeout(
        Duration::from_secs(2),
        tokio::net::TcpStream::connect(format!("127.0.0.1:{}", port)),
    )
    .await??;

    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

    tokio::spawn(async move {
        let _ = conn.await;
    });

    let mut request_builder = Request::builder().uri(uri).method(method);
    for (name, value) in headers {
        request_builder = request_builder.header(*name, *value);
    }

    let request = match body {
        Some(body_data) => {
            let body_len = body_data.len();
            request_builder = request_builder.header("Content-Length", body_len.to_string());
            request_builder.body(Full::new(Bytes::from(body_data)))?
        }
        None => request_builder.body(Full::new(Bytes::new()))?,
    };

    Ok(timeout(Duration::from_secs(5), sender.send_request(request)).await??)
}
