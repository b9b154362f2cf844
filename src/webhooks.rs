//! Outbound webhook delivery.
//!
//! Registered endpoints receive a JSON envelope `{event, data, timestamp}`
//! for every bus event they subscribe to. With a secret configured the body
//! is signed with HMAC-SHA256 in the `X-Scheduler-Signature` header. A failed
//! POST is retried after each configured backoff delay; every delivery keeps
//! a record that ends in `success` or `failed`.
//!
//! Targets are checked when they are registered: only http(s), and no
//! loopback, private, link-local or otherwise reserved addresses, whether
//! given literally or reached through DNS.

use crate::config::WebhooksConfig;
use crate::db::Database;
use crate::error::SchedulerError;
use crate::events::{EventReceiver, SchedulerEvent};
use crate::types::{DeliveryStatus, Webhook, WebhookDelivery};
use anyhow::{Result, anyhow};
use hmac::{Hmac, Mac};
use reqwest::Url;
use serde_json::json;
use sha2::Sha256;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying `sha256=<hex digest>` of the request body.
pub const SIGNATURE_HEADER: &str = "X-Scheduler-Signature";

/// `sha256=<hex>` HMAC of `body` under `secret`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length; the error branch is unreachable.
    let digest = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mut mac) => {
            mac.update(body);
            mac.finalize().into_bytes()
        }
        Err(_) => return String::new(),
    };
    format!("sha256={}", hex::encode(digest))
}

fn is_forbidden_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_multicast()
        || ip.is_broadcast()
        || ip.is_documentation()
        // 100.64.0.0/10 carrier-grade NAT
        || (a == 100 && (64..=127).contains(&b))
        // 0.0.0.0/8 "this network"
        || a == 0
}

fn is_forbidden_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_forbidden_v4(v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        || ip.is_unique_local()
        || ip.is_unicast_link_local()
        // 2001:db8::/32 documentation
        || (first == 0x2001 && ip.segments()[1] == 0x0db8)
}

/// True for addresses a webhook may not target.
pub fn is_forbidden_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_forbidden_v4(v4),
        IpAddr::V6(v6) => is_forbidden_v6(v6),
    }
}

/// Check a target URL, resolving its host.
pub async fn validate_target(url: &str) -> Result<Url> {
    let parsed =
        Url::parse(url).map_err(|e| SchedulerError::webhook_target(url, &e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(SchedulerError::webhook_target(url, "scheme must be http or https").into());
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| SchedulerError::webhook_target(url, "missing host"))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase();

    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_forbidden_ip(ip) {
            return Err(SchedulerError::webhook_target(url, "reserved address").into());
        }
        return Ok(parsed);
    }

    if host == "localhost" || host.ends_with(".localhost") {
        return Err(SchedulerError::webhook_target(url, "loopback host").into());
    }

    let port = parsed.port_or_known_default().unwrap_or(443);
    let addrs = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|e| SchedulerError::webhook_target(url, &format!("cannot resolve host: {}", e)))?;

    let mut resolved = 0;
    for addr in addrs {
        resolved += 1;
        if is_forbidden_ip(addr.ip()) {
            return Err(SchedulerError::webhook_target(
                url,
                &format!("host resolves to reserved address {}", addr.ip()),
            )
            .into());
        }
    }
    if resolved == 0 {
        return Err(SchedulerError::webhook_target(url, "host has no addresses").into());
    }
    Ok(parsed)
}

/// Delivers bus events to registered webhooks.
pub struct WebhookDispatcher {
    db: Database,
    client: reqwest::Client,
    backoff: Vec<Duration>,
    allow_private_targets: bool,
    shutdown: CancellationToken,
}

impl WebhookDispatcher {
    pub fn new(db: Database, config: &WebhooksConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            db,
            client,
            backoff: config
                .backoff_seconds
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
            allow_private_targets: config.allow_private_targets,
            shutdown: CancellationToken::new(),
        })
    }

    /// Override the retry delays.
    pub fn with_backoff(mut self, backoff: Vec<Duration>) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Validate and store a webhook. An empty `events` list subscribes to all.
    pub async fn register(
        &self,
        url: &str,
        events: &[String],
        secret: Option<&str>,
    ) -> Result<Webhook> {
        if self.allow_private_targets {
            let parsed = Url::parse(url)
                .map_err(|e| SchedulerError::webhook_target(url, &e.to_string()))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(
                    SchedulerError::webhook_target(url, "scheme must be http or https").into(),
                );
            }
        } else {
            validate_target(url).await?;
        }

        let hook = self.db.insert_webhook(url, events, secret)?;
        info!(webhook_id = hook.id, url, events = ?events, "Webhook registered");
        Ok(hook)
    }

    /// Consume bus events until shutdown, delivering each to every matching
    /// active webhook on its own task.
    pub fn start(self: Arc<Self>, mut events: EventReceiver) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Starting webhook dispatcher");
            loop {
                tokio::select! {
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        self.fan_out(event);
                    }
                    _ = self.shutdown.cancelled() => {
                        info!("Shutdown signal received, stopping webhook dispatcher");
                        break;
                    }
                }
            }
        })
    }

    fn fan_out(self: &Arc<Self>, event: SchedulerEvent) {
        let hooks = match self.db.list_webhooks(true) {
            Ok(hooks) => hooks,
            Err(e) => {
                warn!(error = %e, "Failed to load webhooks");
                return;
            }
        };
        for hook in hooks.into_iter().filter(|h| h.wants(event.kind.as_str())) {
            let dispatcher = Arc::clone(self);
            let event = event.clone();
            tokio::spawn(async move {
                if let Err(e) = dispatcher.deliver(&hook, &event).await {
                    warn!(webhook_id = hook.id, error = %e, "Webhook delivery errored");
                }
            });
        }
    }

    /// Deliver one event to one webhook, retrying per the backoff schedule.
    pub async fn deliver(&self, hook: &Webhook, event: &SchedulerEvent) -> Result<WebhookDelivery> {
        let body = serde_json::to_vec(&json!({
            "event": event.kind.as_str(),
            "data": event.payload,
            "timestamp": event.timestamp,
        }))?;
        let body_text = String::from_utf8_lossy(&body).into_owned();
        let delivery_id = self.db.create_delivery(hook.id, event.kind.as_str(), &body_text)?;
        let signature = hook.secret.as_deref().map(|s| sign(s, &body));

        let attempts = self.backoff.len() + 1;
        for attempt in 1..=attempts {
            let mut request = self
                .client
                .post(&hook.url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.clone());
            if let Some(signature) = &signature {
                request = request.header(SIGNATURE_HEADER, signature);
            }

            let (status, error) = match request.send().await {
                Ok(response) if response.status().is_success() => {
                    (Some(response.status().as_u16()), None)
                }
                Ok(response) => (
                    Some(response.status().as_u16()),
                    Some(format!("HTTP {}", response.status())),
                ),
                Err(e) => (e.status().map(|s| s.as_u16()), Some(e.to_string())),
            };

            let Some(error) = error else {
                self.db
                    .record_delivery_attempt(delivery_id, DeliveryStatus::Success, status, None)?;
                debug!(webhook_id = hook.id, delivery_id, attempt, "Webhook delivered");
                return self.load_delivery(delivery_id);
            };

            let last = attempt == attempts;
            let outcome = if last {
                DeliveryStatus::Failed
            } else {
                DeliveryStatus::Pending
            };
            self.db
                .record_delivery_attempt(delivery_id, outcome, status, Some(&error))?;

            if last {
                warn!(
                    webhook_id = hook.id,
                    delivery_id,
                    attempts,
                    error = %error,
                    "Webhook delivery failed"
                );
                break;
            }

            let delay = self.backoff[attempt - 1];
            debug!(webhook_id = hook.id, attempt, ?delay, error = %error, "Retrying webhook");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => {
                    self.db.record_delivery_attempt(
                        delivery_id,
                        DeliveryStatus::Failed,
                        status,
                        Some("cancelled by shutdown"),
                    )?;
                    break;
                }
            }
        }

        self.load_delivery(delivery_id)
    }

    fn load_delivery(&self, delivery_id: i64) -> Result<WebhookDelivery> {
        self.db
            .get_delivery(delivery_id)?
            .ok_or_else(|| anyhow!("delivery {} disappeared", delivery_id))
    }
}
