//! Shared HTTPS API client for PVE and PBS instances.
//!
//! Thin wrapper around hyper with openssl TLS. Certificate verification can
//! be disabled per source (opt-in). Requests carry a fixed timeout and
//! responses are read through a size limit to bound memory on hostile
//! servers.

use std::time::Duration;

use anyhow::{bail, format_err, Error};
use hyper::body::HttpBody;
use hyper::client::{Client, HttpConnector};
use hyper::Body;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use serde_json::Value;

use proxmox_http::client::HttpsConnector;

/// Per-request deadline for all API calls.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on response body size.
pub const MAX_RESPONSE_SIZE: usize = 10 * 1024 * 1024;

const TCP_KEEPALIVE_TIME: u32 = 120;

/// Failure reported by the API, structured by HTTP status.
#[derive(Debug, thiserror::Error)]
#[error("request to {endpoint} failed with status {status}: {body}")]
pub struct ApiError {
    pub status: u16,
    pub body: String,
    pub endpoint: String,
}

impl ApiError {
    /// Server-side or rate-limit failures are worth retrying at the next
    /// poll cycle; everything else is terminal for this cycle.
    pub fn is_retryable(&self) -> bool {
        self.status >= 500 || self.status == 429
    }
}

/// Transport-level failure (connect, TLS, timeout, broken body).
#[derive(Debug, thiserror::Error)]
#[error("connection error: {0}")]
pub struct RetryableError(pub anyhow::Error);

impl RetryableError {
    pub fn is_retryable(&self) -> bool {
        true
    }
}

/// Authorization header value for a PVE API token.
pub fn pve_token_header(token_id: &str, secret: &str) -> String {
    format!("PVEAPIToken={}={}", token_id, secret)
}

/// Authorization header value for a PBS API token (colon separator, unlike
/// PVE).
pub fn pbs_token_header(token_id: &str, secret: &str) -> String {
    format!("PBSAPIToken={}:{}", token_id, secret)
}

/// Split a configured `host` or `host:port` string.
pub fn split_host_port(host: &str, default_port: u16) -> (String, u16) {
    match host.rsplit_once(':') {
        Some((name, port)) => match port.parse::<u16>() {
            Ok(port) => (name.to_string(), port),
            Err(_) => (host.to_string(), default_port),
        },
        None => (host.to_string(), default_port),
    }
}

/// Build a hyper client with our TLS settings.
pub fn new_https_client(verify_tls: bool) -> Result<Client<HttpsConnector>, Error> {
    let mut ssl_connector_builder = SslConnector::builder(SslMethod::tls())?;

    if !verify_tls {
        ssl_connector_builder.set_verify(SslVerifyMode::NONE);
    }

    let mut httpc = HttpConnector::new();
    httpc.set_nodelay(true);
    httpc.enforce_http(false); // we want https
    httpc.set_connect_timeout(Some(Duration::new(10, 0)));

    let https = HttpsConnector::with_connector(
        httpc,
        ssl_connector_builder.build(),
        TCP_KEEPALIVE_TIME,
    );

    Ok(Client::builder().build::<_, Body>(https))
}

/// HTTPS client for one PVE or PBS instance.
pub struct ApiClient {
    client: Client<HttpsConnector>,
    server: String,
    port: u16,
    auth_header: String,
}

impl ApiClient {
    pub fn new(
        server: &str,
        port: u16,
        auth_header: String,
        verify_tls: bool,
    ) -> Result<Self, Error> {
        if !verify_tls {
            log::warn!(
                "TLS certificate verification disabled for {}:{}",
                server,
                port
            );
        }

        Ok(Self {
            client: new_https_client(verify_tls)?,
            server: server.to_string(),
            port,
            auth_header,
        })
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// GET an API path and unwrap the `{"data": ...}` envelope both
    /// upstream APIs use.
    pub async fn get(&self, path: &str) -> Result<Value, Error> {
        let mut response = self.get_raw(path).await?;
        match response.get_mut("data") {
            Some(data) => Ok(data.take()),
            None => bail!("missing 'data' envelope in response from {}", path),
        }
    }

    /// GET an API path and return the parsed response body.
    pub async fn get_raw(&self, path: &str) -> Result<Value, Error> {
        let uri = format!("https://{}:{}{}", self.server, self.port, path);

        let request = http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header(http::header::AUTHORIZATION, &self.auth_header)
            .header(http::header::ACCEPT, "application/json")
            .body(Body::empty())?;

        let response = match tokio::time::timeout(HTTP_TIMEOUT, self.client.request(request)).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => return Err(RetryableError(err.into()).into()),
            Err(_) => {
                return Err(RetryableError(format_err!(
                    "request timed out after {}s",
                    HTTP_TIMEOUT.as_secs()
                ))
                .into())
            }
        };

        let status = response.status();
        let body = read_body_limited(response.into_body(), MAX_RESPONSE_SIZE).await?;

        if !status.is_success() {
            return Err(ApiError {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
                endpoint: path.to_string(),
            }
            .into());
        }

        let value: Value = serde_json::from_slice(&body)
            .map_err(|err| format_err!("invalid JSON from {} - {}", path, err))?;

        Ok(value)
    }
}

/// Read a response body, failing once it exceeds `limit` bytes.
pub async fn read_body_limited(mut body: Body, limit: usize) -> Result<Vec<u8>, Error> {
    let mut data = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|err| RetryableError(err.into()))?;
        if data.len() + chunk.len() > limit {
            bail!("response too large (limit {} bytes)", limit);
        }
        data.extend_from_slice(&chunk);
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_retryability() {
        for (status, expected) in [
            (400, false),
            (403, false),
            (404, false),
            (429, true),
            (499, false),
            (500, true),
            (503, true),
            (599, true),
        ] {
            let err = ApiError {
                status,
                body: String::new(),
                endpoint: "/api2/json/nodes".to_string(),
            };
            assert_eq!(err.is_retryable(), expected, "status {}", status);
        }

        let err = RetryableError(format_err!("connection refused"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_token_headers() {
        assert_eq!(
            pve_token_header("monitor@pam!readonly", "uuid-secret"),
            "PVEAPIToken=monitor@pam!readonly=uuid-secret"
        );
        assert_eq!(
            pbs_token_header("monitor@pbs!readonly", "uuid-secret"),
            "PBSAPIToken=monitor@pbs!readonly:uuid-secret"
        );
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("pve.example.com", 8006),
            ("pve.example.com".to_string(), 8006)
        );
        assert_eq!(
            split_host_port("pve.example.com:443", 8006),
            ("pve.example.com".to_string(), 443)
        );
        assert_eq!(
            split_host_port("10.0.0.5:8007", 8007),
            ("10.0.0.5".to_string(), 8007)
        );
    }

    #[tokio::test]
    async fn test_body_size_limit() -> Result<(), Error> {
        let body = Body::from(vec![0u8; 64]);
        let data = read_body_limited(body, 64).await?;
        assert_eq!(data.len(), 64);

        let body = Body::from(vec![0u8; 65]);
        assert!(read_body_limited(body, 64).await.is_err());
        Ok(())
    }
}
