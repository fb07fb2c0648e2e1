//! Delivery of a request to an editor extension and the wait for its reply.

use std::{sync::Arc, time::Duration};

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    config::RelayConfig,
    error::{RelayError, Result},
    events::EventEmitter,
    pending::{PendingTable, SlotOutcome},
    registry::EndpointDiscovery,
};

pub const ASK_REQUEST_TYPE: &str = "ask_continue";

/// Body of `POST /ask` sent to an extension.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AskRequest<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub request_id: &'a str,
    pub reason: &'a str,
    pub callback_port: u16,
}

#[derive(Debug, Default, Deserialize)]
struct AskAck {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    details: Option<String>,
}

/// Why a single candidate did not take the request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryFailure {
    #[error("cannot connect to port {port}")]
    Unreachable { port: u16 },
    #[error("timed out connecting to port {port}")]
    TimedOut { port: u16 },
    #[error("extension on port {port} returned error: {error} - {details}")]
    Extension {
        port: u16,
        error: String,
        details: String,
    },
    #[error("extension on port {port} answered with HTTP {status}")]
    UnexpectedStatus { port: u16, status: u16 },
    #[error("extension on port {port} did not acknowledge the request")]
    NotAcknowledged { port: u16 },
    #[error("request to port {port} failed: {message}")]
    Transport { port: u16, message: String },
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub host: String,
    /// Port of this process's callback listener, sent with every request.
    pub callback_port: u16,
    pub request_timeout: Duration,
    pub max_rounds: u32,
    pub backoff_base: Duration,
    pub discovery_attempts: u32,
    pub discovery_retry_delay: Duration,
    pub max_pending_age: Duration,
}

impl DispatchSettings {
    pub fn from_config(cfg: &RelayConfig, callback_port: u16) -> Self {
        Self {
            host: cfg.extension_host.clone(),
            callback_port,
            request_timeout: cfg.request_timeout,
            max_rounds: cfg.max_rounds.max(1),
            backoff_base: cfg.backoff_base,
            discovery_attempts: cfg.discovery_attempts.max(1),
            discovery_retry_delay: cfg.discovery_retry_delay,
            max_pending_age: cfg.max_pending_age,
        }
    }
}

/// Wait before the retry that follows failed round `round` (zero-based):
/// `base * 2^round`.
pub fn backoff_delay(base: Duration, round: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(round))
}

#[derive(Clone)]
pub struct Dispatcher {
    client: Client,
    table: PendingTable,
    discovery: Arc<dyn EndpointDiscovery>,
    settings: DispatchSettings,
    events: EventEmitter,
}

impl Dispatcher {
    pub fn new(
        table: PendingTable,
        discovery: Arc<dyn EndpointDiscovery>,
        settings: DispatchSettings,
        events: EventEmitter,
    ) -> Result<Self> {
        // Loopback only; never route through an HTTP proxy from the environment.
        let client = Client::builder().no_proxy().build()?;
        Ok(Self {
            client,
            table,
            discovery,
            settings,
            events,
        })
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Deliver `reason` to an extension and suspend until the human answers,
    /// cancels, or the request is reaped. There is no timeout on the wait.
    pub async fn send(&self, reason: &str) -> Result<String> {
        let reaped = self.table.reap_expired(self.settings.max_pending_age);
        if !reaped.is_empty() {
            self.events
                .emit("requests_reaped", json!({ "requestIds": reaped }));
        }

        let pending = self.table.create();
        let request_id = pending.id().to_string();

        let ports = self.discover_with_retry().await;
        tracing::info!(
            target = "ask_relay::dispatch",
            request_id = %request_id,
            ports = ?ports,
            pending = self.table.len(),
            "discovered extension endpoints"
        );
        if ports.is_empty() {
            self.table.remove(&request_id);
            return Err(RelayError::NoEndpoints);
        }

        match self.deliver(&request_id, reason, &ports).await {
            Ok(port) => {
                tracing::info!(
                    target = "ask_relay::dispatch",
                    request_id = %request_id,
                    port,
                    "request delivered, waiting for user input"
                );
                self.events.emit(
                    "request_dispatched",
                    json!({ "requestId": request_id, "port": port }),
                );
            }
            Err(failure) => {
                // A reply may already have resolved the entry while we were retrying.
                if self.table.remove(&request_id) {
                    let detail = failure
                        .map(|failure| failure.to_string())
                        .unwrap_or_else(|| "no delivery attempted".to_string());
                    tracing::warn!(
                        target = "ask_relay::dispatch",
                        request_id = %request_id,
                        detail = %detail,
                        "delivery exhausted"
                    );
                    self.events.emit(
                        "request_failed",
                        json!({ "requestId": request_id, "detail": detail }),
                    );
                    return Err(RelayError::DeliveryExhausted {
                        rounds: self.settings.max_rounds.max(1),
                        detail,
                    });
                }
            }
        }

        match pending.wait().await {
            Some(SlotOutcome::Response(text)) => Ok(text),
            Some(SlotOutcome::Cancelled) => Err(RelayError::Cancelled),
            Some(SlotOutcome::Expired) => Err(RelayError::Expired {
                after: self.settings.max_pending_age,
            }),
            None => Err(RelayError::Abandoned),
        }
    }

    async fn discover_with_retry(&self) -> Vec<u16> {
        let attempts = self.settings.discovery_attempts.max(1);
        for attempt in 1..=attempts {
            let ports = self.discovery.discover();
            if !ports.is_empty() {
                return ports;
            }
            if attempt < attempts {
                tracing::info!(
                    target = "ask_relay::dispatch",
                    attempt,
                    attempts,
                    "no extension endpoints yet, retrying discovery"
                );
                tokio::time::sleep(self.settings.discovery_retry_delay).await;
            }
        }
        Vec::new()
    }

    /// Run up to `max_rounds` passes over `ports`, returning the first port
    /// that acknowledged the request, or the last failure seen.
    async fn deliver(
        &self,
        request_id: &str,
        reason: &str,
        ports: &[u16],
    ) -> std::result::Result<u16, Option<DeliveryFailure>> {
        let rounds = self.settings.max_rounds.max(1);
        let mut last_failure = None;

        for round in 0..rounds {
            for &port in ports {
                match self.post_ask(port, request_id, reason).await {
                    Ok(()) => return Ok(port),
                    Err(failure) => {
                        tracing::debug!(
                            target = "ask_relay::dispatch",
                            request_id = %request_id,
                            port,
                            error = %failure,
                            "candidate rejected request"
                        );
                        last_failure = Some(failure);
                    }
                }
            }

            if round + 1 < rounds {
                let delay = backoff_delay(self.settings.backoff_base, round);
                tracing::warn!(
                    target = "ask_relay::dispatch",
                    request_id = %request_id,
                    round = round + 1,
                    rounds,
                    delay_ms = delay.as_millis() as u64,
                    "delivery round failed, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }

        Err(last_failure)
    }

    async fn post_ask(
        &self,
        port: u16,
        request_id: &str,
        reason: &str,
    ) -> std::result::Result<(), DeliveryFailure> {
        let url = format!("http://{}:{port}/ask", self.settings.host);
        let body = AskRequest {
            kind: ASK_REQUEST_TYPE,
            request_id,
            reason,
            callback_port: self.settings.callback_port,
        };

        let response = self
            .client
            .post(&url)
            .timeout(self.settings.request_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|error| classify_transport_error(port, &error))?;

        let status = response.status();
        let ack: AskAck = response.json().await.unwrap_or_default();

        if status.is_success() {
            if ack.success {
                Ok(())
            } else {
                Err(DeliveryFailure::NotAcknowledged { port })
            }
        } else if status.is_server_error() {
            Err(DeliveryFailure::Extension {
                port,
                error: ack.error.unwrap_or_else(|| "unknown".to_string()),
                details: ack.details.unwrap_or_default(),
            })
        } else {
            Err(DeliveryFailure::UnexpectedStatus {
                port,
                status: status.as_u16(),
            })
        }
    }
}

fn classify_transport_error(port: u16, error: &reqwest::Error) -> DeliveryFailure {
    if error.is_timeout() {
        DeliveryFailure::TimedOut { port }
    } else if error.is_connect() {
        DeliveryFailure::Unreachable { port }
    } else {
        DeliveryFailure::Transport {
            port,
            message: error.to_string(),
        }
    }
}
