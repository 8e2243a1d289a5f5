//! Notification providers.
//!
//! The alerter fans every notification out to an ordered list of
//! providers. The reference provider talks to an ntfy-compatible webhook
//! endpoint; provider failures are the caller's problem to log.

use std::time::Duration;

use anyhow::{bail, format_err, Error};
use hyper::{Body, Client};

use proxmox_http::client::HttpsConnector;

use pmon_api_types::{Notification, Severity};

use crate::client::new_https_client;
use crate::config::NtfyTargetConfig;

/// Outbound notification requests are bounded independently of the poll
/// timeout.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait::async_trait]
pub trait NotificationProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, notification: &Notification) -> Result<(), Error>;
}

/// Priority on the ntfy 1-5 scale.
pub fn severity_priority(severity: Severity) -> u8 {
    match severity {
        Severity::Critical => 5,
        Severity::Warning => 3,
        Severity::Info => 2,
    }
}

/// Emoji shortcode tag for the severity.
pub fn severity_tag(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "rotating_light",
        Severity::Warning => "warning",
        Severity::Info => "information_source",
    }
}

/// Comma separated tag list: severity, alert type, optional resolved
/// marker.
pub fn notification_tags(notification: &Notification) -> String {
    let mut tags = format!(
        "{},{}",
        severity_tag(notification.severity),
        notification.alert_type
    );
    if notification.resolved == Some(true) {
        tags.push_str(",resolved");
    }
    tags
}

/// ntfy-compatible webhook target.
pub struct NtfyProvider {
    name: String,
    url: String,
    topic: String,
    token: Option<String>,
    client: Client<HttpsConnector>,
}

impl NtfyProvider {
    pub fn new(config: &NtfyTargetConfig) -> Result<Self, Error> {
        Ok(Self {
            name: format!("ntfy:{}", config.topic),
            url: config.url.trim_end_matches('/').to_string(),
            topic: config.topic.clone(),
            token: config.token.clone(),
            client: new_https_client(!config.insecure_tls)?,
        })
    }
}

#[async_trait::async_trait]
impl NotificationProvider for NtfyProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, notification: &Notification) -> Result<(), Error> {
        let uri = format!("{}/{}", self.url, self.topic);

        let mut request = http::Request::builder()
            .method("POST")
            .uri(&uri)
            .header("X-Title", notification.title.as_str())
            .header(
                "X-Priority",
                severity_priority(notification.severity).to_string(),
            )
            .header("X-Tags", notification_tags(notification));

        if let Some(token) = &self.token {
            request = request.header(http::header::AUTHORIZATION, format!("Bearer {}", token));
        }

        let request = request.body(Body::from(notification.message.clone()))?;

        let response = tokio::time::timeout(SEND_TIMEOUT, self.client.request(request))
            .await
            .map_err(|_| format_err!("notification send timed out"))??;

        let status = response.status();
        if !status.is_success() {
            bail!("notification endpoint answered {}", status);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    #[test]
    fn test_priority_mapping() {
        assert_eq!(severity_priority(Severity::Critical), 5);
        assert_eq!(severity_priority(Severity::Warning), 3);
        assert_eq!(severity_priority(Severity::Info), 2);
    }

    #[test]
    fn test_tags() {
        let mut notification = Notification {
            alert_type: "disk_smart_failed".to_string(),
            severity: Severity::Critical,
            title: "t".to_string(),
            message: "m".to_string(),
            instance: "test-pve".to_string(),
            subject: "sda".to_string(),
            timestamp: 0,
            resolved: None,
            metadata: HashMap::new(),
        };
        assert_eq!(
            notification_tags(&notification),
            "rotating_light,disk_smart_failed"
        );

        notification.resolved = Some(true);
        notification.severity = Severity::Info;
        assert_eq!(
            notification_tags(&notification),
            "information_source,disk_smart_failed,resolved"
        );
    }
}
