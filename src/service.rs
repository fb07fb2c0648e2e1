//! Process-wide relay state: the pending table, the callback listener and the
//! dispatcher, owned by one cloneable handle.

use std::{path::PathBuf, sync::Arc};

use serde_json::json;

use crate::{
    callback_api::{callback_router, spawn_callback_listener},
    config::RelayConfig,
    dispatcher::{DispatchSettings, Dispatcher},
    error::{RelayError, Result},
    events::EventEmitter,
    pending::PendingTable,
    registry::EndpointRegistry,
};

#[derive(Clone)]
pub struct RelayService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    table: PendingTable,
    callback_port: u16,
    listening: bool,
    port_dir: PathBuf,
    dispatcher: Dispatcher,
}

impl RelayService {
    /// Start the callback listener and wait (bounded) for it to report its
    /// port. Only an exhausted port range is fatal; any other listener
    /// problem leaves the relay running with a best-effort callback port.
    pub async fn start(config: RelayConfig, events: EventEmitter) -> Result<Self> {
        let table = PendingTable::new();
        let router = callback_router(table.clone(), events.clone());
        let ready = spawn_callback_listener(
            router,
            config.callback_port_start,
            config.callback_port_attempts,
        )
        .map_err(RelayError::ListenerBind)?;

        let fallback_port = config.callback_port_start;
        let (callback_port, listening) =
            match tokio::time::timeout(config.ready_timeout, ready).await {
                Ok(Ok(Ok(port))) => (port, true),
                Ok(Ok(Err(error @ RelayError::ListenerBindExhausted { .. }))) => {
                    return Err(error);
                }
                Ok(Ok(Err(error))) => {
                    tracing::error!(
                        target = "ask_relay::service",
                        error = %error,
                        port = fallback_port,
                        "callback listener unavailable, replies cannot be received"
                    );
                    (fallback_port, false)
                }
                Ok(Err(_)) => {
                    tracing::error!(
                        target = "ask_relay::service",
                        port = fallback_port,
                        "callback listener exited before reporting readiness"
                    );
                    (fallback_port, false)
                }
                Err(_) => {
                    tracing::warn!(
                        target = "ask_relay::service",
                        timeout_ms = config.ready_timeout.as_millis() as u64,
                        port = fallback_port,
                        "callback listener not ready in time, using default port"
                    );
                    (fallback_port, false)
                }
            };

        tracing::info!(
            target = "ask_relay::service",
            callback_port,
            listening,
            port_dir = %config.port_dir.display(),
            "relay service started"
        );
        events.emit(
            "callback_ready",
            json!({ "port": callback_port, "listening": listening }),
        );

        let registry = EndpointRegistry::new(config.port_dir.clone(), config.default_extension_port);
        let dispatcher = Dispatcher::new(
            table.clone(),
            Arc::new(registry),
            DispatchSettings::from_config(&config, callback_port),
            events,
        )?;

        Ok(Self {
            inner: Arc::new(ServiceInner {
                table,
                callback_port,
                listening,
                port_dir: config.port_dir,
                dispatcher,
            }),
        })
    }

    /// Hand control to the human and return their reply.
    pub async fn request_user_input(&self, reason: &str) -> Result<String> {
        tracing::info!(target = "ask_relay::service", reason = %reason, "requesting user input");
        self.inner.dispatcher.send(reason).await
    }

    pub fn callback_port(&self) -> u16 {
        self.inner.callback_port
    }

    /// Whether the callback listener reported a bound port.
    pub fn is_listening(&self) -> bool {
        self.inner.listening
    }

    pub fn port_dir(&self) -> &std::path::Path {
        &self.inner.port_dir
    }

    pub fn pending(&self) -> &PendingTable {
        &self.inner.table
    }
}
