//! Read-only HTTP API.
//!
//! Thin adapters over cache snapshots and store queries for a dashboard.
//! Handler panics are trapped and answered with a 500; dashboard reads
//! never fail because a single source is down - they serve whatever the
//! cache last held.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;
use futures::FutureExt;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::cache::Cache;
use crate::store::Store;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

const DEFAULT_SPARKLINE_WINDOW: i64 = 3600;
const DEFAULT_ALERT_LIMIT: usize = 50;

/// Serve the API until cancellation; shutdown drains connections for at
/// most five seconds.
pub async fn run_server(
    listen: SocketAddr,
    cache: Arc<Cache>,
    store: Arc<Store>,
    token: CancellationToken,
) -> Result<(), Error> {
    let make_svc = make_service_fn(move |_conn| {
        let cache = Arc::clone(&cache);
        let store = Arc::clone(&store);
        async move {
            Ok::<_, Infallible>(service_fn(move |request| {
                handle(request, Arc::clone(&cache), Arc::clone(&store))
            }))
        }
    });

    let server = hyper::Server::try_bind(&listen)?.serve(make_svc);
    log::info!("http api listening on http://{}", listen);

    let graceful = server.with_graceful_shutdown({
        let token = token.clone();
        async move { token.cancelled().await }
    });

    tokio::select! {
        result = graceful => result.map_err(Error::from),
        _ = async {
            token.cancelled().await;
            tokio::time::sleep(SHUTDOWN_TIMEOUT).await;
        } => {
            log::warn!("http shutdown grace period expired, dropping connections");
            Ok(())
        }
    }
}

async fn handle(
    request: Request<Body>,
    cache: Arc<Cache>,
    store: Arc<Store>,
) -> Result<Response<Body>, Infallible> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let query = request.uri().query().unwrap_or("").to_string();

    let routed = std::panic::AssertUnwindSafe(route(&method, &path, &query, cache, store))
        .catch_unwind()
        .await;

    let response = match routed {
        Ok(response) => response,
        Err(_) => {
            log::error!("panic while handling {} {}", method, path);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
        }
    };

    Ok(response)
}

async fn route(
    method: &Method,
    path: &str,
    query: &str,
    cache: Arc<Cache>,
    store: Arc<Store>,
) -> Response<Body> {
    if method != Method::GET {
        return error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }

    let params = parse_query(query);
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    match segments.as_slice() {
        ["api2", "json", "health"] => health(&cache),
        ["api2", "json", "snapshot"] => match serde_json::to_value(cache.snapshot()) {
            Ok(value) => json_data_response(value),
            Err(err) => {
                log::error!("serializing snapshot failed - {}", err);
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "serialization failed")
            }
        },
        ["api2", "json", "alerts"] => {
            let limit = params
                .get("limit")
                .and_then(|limit| limit.parse::<usize>().ok())
                .unwrap_or(DEFAULT_ALERT_LIMIT);
            match store.recent_alerts(limit) {
                Ok(alerts) => json_data_response(json!(alerts)),
                Err(err) => {
                    log::error!("alert query failed - {}", err);
                    error_response(StatusCode::INTERNAL_SERVER_ERROR, "query failed")
                }
            }
        }
        ["api2", "json", "nodes", instance, node, "sparkline"] => {
            let metric = params.get("metric").map(String::as_str).unwrap_or("cpu");
            let since = since_param(&params);
            match store.query_node_sparkline(instance, node, metric, since) {
                Ok(series) => json_data_response(json!(series)),
                Err(err) => error_response(StatusCode::BAD_REQUEST, &err.to_string()),
            }
        }
        ["api2", "json", "guests", instance, vmid, "sparkline"] => {
            let vmid = match vmid.parse::<u64>() {
                Ok(vmid) => vmid,
                Err(_) => return error_response(StatusCode::BAD_REQUEST, "invalid vmid"),
            };
            let since = since_param(&params);
            match store.query_guest_sparkline(instance, vmid, since) {
                Ok(series) => json_data_response(json!(series)),
                Err(err) => {
                    log::error!("guest sparkline query failed - {}", err);
                    error_response(StatusCode::INTERNAL_SERVER_ERROR, "query failed")
                }
            }
        }
        _ => error_response(StatusCode::NOT_FOUND, "no such endpoint"),
    }
}

/// `ok` once any collector ever completed a poll, `no_data` before that,
/// plus per-collector freshness in seconds.
fn health(cache: &Cache) -> Response<Body> {
    let snapshot = cache.snapshot();
    let now = proxmox_time::epoch_i64();

    let status = if snapshot.last_poll.is_empty() {
        "no_data"
    } else {
        "ok"
    };
    let collectors: HashMap<&String, i64> = snapshot
        .last_poll
        .iter()
        .map(|(name, time)| (name, (now - time).max(0)))
        .collect();

    json_data_response(json!({
        "status": status,
        "collectors": collectors,
    }))
}

fn since_param(params: &HashMap<String, String>) -> i64 {
    params
        .get("since")
        .and_then(|since| since.parse::<i64>().ok())
        .unwrap_or_else(|| proxmox_time::epoch_i64() - DEFAULT_SPARKLINE_WINDOW)
}

fn parse_query(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in query.split('&') {
        if let Some((key, value)) = pair.split_once('=') {
            params.insert(key.to_string(), value.to_string());
        }
    }
    params
}

fn json_data_response(data: serde_json::Value) -> Response<Body> {
    let body = json!({ "data": data }).to_string();
    Response::builder()
        .status(StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap()
}

fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    let body = json!({ "message": message }).to_string();
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap()
}
