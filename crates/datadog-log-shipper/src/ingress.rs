// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{http, Method, Request, StatusCode};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::http_utils::{
    header_str, json_response, log_and_create_http_response, verify_request_content_length,
    HttpResponse,
};
use crate::inflight::{InboundPush, InflightRegister};
use crate::registry::HostRegistry;

const PUSHLOG_ENDPOINT_PATH: &str = "/pushlog/";
const INFO_ENDPOINT_PATH: &str = "/info";
const SERVERS_ENDPOINT_PATH: &str = "/servers";
const INFLIGHTS_ENDPOINT_PATH: &str = "/inflights";

/// Body chunks read ahead of the upload stage.
const PUSH_BODY_BUFFER: usize = 8;

/// HTTP server receiving pushed log contents from hosts, plus read-only views
/// of the shipper's state.
pub struct IngressServer {
    pub register: InflightRegister,
    pub registry: Arc<HostRegistry>,
    pub max_content_length: u64,
    /// A push body that makes no progress for this long is abandoned.
    pub push_idle_timeout: Duration,
}

impl IngressServer {
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let server = hyper::server::conn::http1::Builder::new();
        let mut joinset = tokio::task::JoinSet::new();

        let ingress = Arc::clone(&self);
        let service = service_fn(move |req| {
            let ingress = Arc::clone(&ingress);
            async move { ingress.endpoint_handler(req).await }
        });

        loop {
            let conn = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("ingress server stopped");
                    return Ok(());
                }
                con_res = listener.accept() => match con_res {
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("Server error: {e}");
                        return Err(e.into());
                    }
                    Ok((conn, _)) => conn,
                },
                finished = async {
                    match joinset.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => match finished {
                    Err(e) if e.is_panic() => {
                        error!("Connection handler panicked: {:?}", e);
                        continue;
                    },
                    Ok(()) | Err(_) => continue,
                },
            };
            let conn = hyper_util::rt::TokioIo::new(conn);
            let server = server.clone();
            let service = service.clone();
            joinset.spawn(async move {
                if let Err(e) = server.serve_connection(conn, service).await {
                    error!("Connection error: {e}");
                }
            });
        }
    }

    async fn endpoint_handler(&self, req: Request<Incoming>) -> http::Result<HttpResponse> {
        let path = req.uri().path().to_string();
        match (req.method(), path.as_str()) {
            (&Method::PUT, p) if p.starts_with(PUSHLOG_ENDPOINT_PATH) => {
                let id = &p[PUSHLOG_ENDPOINT_PATH.len()..];
                self.handle_push(id, req).await
            }
            (&Method::GET, INFO_ENDPOINT_PATH) => self.info_handler(),
            (&Method::GET, SERVERS_ENDPOINT_PATH) => {
                json_response(&self.registry.ids().await, StatusCode::OK)
            }
            (&Method::GET, p) if p.starts_with("/servers/") => {
                let id = &p["/servers/".len()..];
                match self.registry.lookup(id).await {
                    Some(host) => json_response(&host.snapshot().await, StatusCode::OK),
                    None => log_and_create_http_response(
                        &format!("Unknown server {id}"),
                        StatusCode::NOT_FOUND,
                    ),
                }
            }
            (&Method::GET, INFLIGHTS_ENDPOINT_PATH) => {
                json_response(&self.register.summaries(), StatusCode::OK)
            }
            _ => log_and_create_http_response(
                &format!("Unsupported request {} {path}", req.method()),
                StatusCode::NOT_FOUND,
            ),
        }
    }

    /// Hands a push to the upload stage waiting on `id` as soon as its head
    /// arrives, then feeds it the body. Answers with the stage's verdict: 200
    /// once stored, 500 otherwise.
    async fn handle_push(&self, id: &str, req: Request<Incoming>) -> http::Result<HttpResponse> {
        if !self.register.contains(id) {
            return log_and_create_http_response(
                &format!("No command in flight for {id}"),
                StatusCode::NOT_FOUND,
            );
        }

        let (parts, body) = req.into_parts();
        if let Some(response) = verify_request_content_length(
            &parts.headers,
            self.max_content_length,
            "Error processing push",
        ) {
            return response;
        }
        let content_md5 = header_str(&parts.headers, "content-md5").map(str::to_string);
        let content_length = header_str(&parts.headers, "content-length")
            .and_then(|v| v.parse::<u64>().ok());

        let (chunks, chunks_rx) = mpsc::channel(PUSH_BODY_BUFFER);
        let (reply, verdict) = oneshot::channel();
        let push = InboundPush {
            body: chunks_rx.boxed(),
            content_md5,
            content_length,
            reply,
        };
        if self.register.deliver_push(id, push).is_err() {
            return log_and_create_http_response(
                &format!("No command in flight for {id}"),
                StatusCode::NOT_FOUND,
            );
        }

        forward_body(id, body, chunks, self.push_idle_timeout).await;

        match verdict.await {
            Ok(true) => {
                log_and_create_http_response(&format!("Stored push for {id}"), StatusCode::OK)
            }
            Ok(false) | Err(_) => log_and_create_http_response(
                &format!("Push for {id} was not stored"),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        }
    }

    fn info_handler(&self) -> http::Result<HttpResponse> {
        let response_json = json!({
            "endpoints": [
                format!("{PUSHLOG_ENDPOINT_PATH}{{id}}"),
                INFO_ENDPOINT_PATH,
                SERVERS_ENDPOINT_PATH,
                format!("{SERVERS_ENDPOINT_PATH}/{{id}}"),
                INFLIGHTS_ENDPOINT_PATH,
            ],
            "config": {
                "max_push_content_length": self.max_content_length,
            },
        });
        json_response(&response_json, StatusCode::OK)
    }
}

/// Copies a request body into `chunks` until it ends, the reader goes away or
/// the pusher stalls for `idle_timeout`. A broken or stalled body ends the
/// stream with an error so the write it feeds fails.
async fn forward_body(
    id: &str,
    mut body: Incoming,
    mut chunks: mpsc::Sender<io::Result<Bytes>>,
    idle_timeout: Duration,
) {
    loop {
        let failure = match tokio::time::timeout(idle_timeout, body.frame()).await {
            Ok(None) => return,
            Ok(Some(Ok(frame))) => {
                // trailers carry nothing to store
                let Ok(data) = frame.into_data() else {
                    continue;
                };
                if chunks.send(Ok(data)).await.is_err() {
                    debug!(id = %id, "push body no longer read");
                    return;
                }
                continue;
            }
            Ok(Some(Err(e))) => io::Error::other(e),
            Err(_) => io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no push data for {}s", idle_timeout.as_secs_f64()),
            ),
        };
        warn!(id = %id, error = %failure, "push body broke off");
        let _ = chunks.send(Err(failure)).await;
        return;
    }
}
