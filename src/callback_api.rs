//! Local HTTP listener that receives the human's reply from the editor
//! extension and resolves the matching pending request.
//!
//! The listener runs on its own OS thread with a single-threaded runtime so it
//! stays responsive no matter what the dispatching side is doing. Its bound
//! port is reported once through a readiness channel before serving starts.

use std::{io, net::Ipv4Addr};

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderName, Method, StatusCode},
    routing, Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::oneshot};

use crate::{
    error::{RelayError, Result},
    events::EventEmitter,
    pending::{PendingTable, SlotOutcome},
};

/// Replies may carry several base64 screenshots.
pub const MAX_CALLBACK_BODY_BYTES: usize = 32 * 1024 * 1024;

type CorsHeaders = [(HeaderName, &'static str); 3];

/// Body of `POST /response`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseSubmission {
    pub request_id: String,
    #[serde(default)]
    pub user_input: String,
    #[serde(default)]
    pub cancelled: bool,
}

impl ResponseSubmission {
    /// Cancellation wins over any accompanying text.
    pub fn into_outcome(self) -> SlotOutcome {
        if self.cancelled {
            SlotOutcome::Cancelled
        } else {
            SlotOutcome::Response(self.user_input)
        }
    }
}

#[derive(Clone)]
struct CallbackState {
    table: PendingTable,
    events: EventEmitter,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn callback_router(table: PendingTable, events: EventEmitter) -> Router {
    let state = CallbackState { table, events };

    Router::new()
        .route(
            "/response",
            routing::post(callback_response).options(callback_preflight),
        )
        .fallback(callback_fallback)
        .layer(DefaultBodyLimit::max(MAX_CALLBACK_BODY_BYTES))
        .with_state(state)
}

fn cors_headers() -> CorsHeaders {
    [
        (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        (header::ACCESS_CONTROL_ALLOW_METHODS, "POST, OPTIONS"),
        (header::ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type"),
    ]
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

async fn callback_preflight() -> (StatusCode, CorsHeaders) {
    (StatusCode::OK, cors_headers())
}

async fn callback_fallback(method: Method) -> (StatusCode, CorsHeaders) {
    if method == Method::OPTIONS {
        (StatusCode::OK, cors_headers())
    } else {
        (StatusCode::NOT_FOUND, cors_headers())
    }
}

async fn callback_response(
    State(state): State<CallbackState>,
    body: Bytes,
) -> (StatusCode, CorsHeaders, Json<Value>) {
    let submission: ResponseSubmission = match serde_json::from_slice(&body) {
        Ok(submission) => submission,
        Err(error) => {
            tracing::warn!(
                target = "ask_relay::callback",
                error = %error,
                bytes = body.len(),
                "rejecting malformed response submission"
            );
            return (
                StatusCode::BAD_REQUEST,
                cors_headers(),
                Json(json!({ "error": format!("invalid response body: {error}") })),
            );
        }
    };

    let request_id = submission.request_id.clone();
    let cancelled = submission.cancelled;
    if state.table.resolve(&request_id, submission.into_outcome()) {
        tracing::info!(
            target = "ask_relay::callback",
            request_id = %request_id,
            cancelled,
            "received user response"
        );
        state.events.emit(
            "request_resolved",
            json!({ "requestId": request_id, "cancelled": cancelled }),
        );
        (
            StatusCode::OK,
            cors_headers(),
            Json(json!({ "success": true })),
        )
    } else {
        tracing::debug!(
            target = "ask_relay::callback",
            request_id = %request_id,
            "response for unknown or already-resolved request"
        );
        (
            StatusCode::NOT_FOUND,
            cors_headers(),
            Json(json!({ "error": "Request not found" })),
        )
    }
}

// ---------------------------------------------------------------------------
// Binding and serving
// ---------------------------------------------------------------------------

/// Bind on loopback at the first free port in `start..start + attempts`.
/// Only address-in-use moves on to the next port; any other error aborts.
pub async fn bind_with_retry(start: u16, attempts: u32) -> Result<(TcpListener, u16)> {
    for offset in 0..attempts {
        let Ok(port) = u16::try_from(u32::from(start) + offset) else {
            break;
        };
        match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
            Ok(listener) => {
                let bound = listener
                    .local_addr()
                    .map_err(RelayError::ListenerBind)?
                    .port();
                return Ok((listener, bound));
            }
            Err(error) if error.kind() == io::ErrorKind::AddrInUse => {
                tracing::debug!(
                    target = "ask_relay::callback",
                    port,
                    "callback port in use, trying next"
                );
            }
            Err(error) => return Err(RelayError::ListenerBind(error)),
        }
    }
    Err(RelayError::ListenerBindExhausted { start, attempts })
}

/// Start the listener thread. The returned receiver yields the bound port, or
/// the bind error, before the listener begins serving.
pub fn spawn_callback_listener(
    router: Router,
    start: u16,
    attempts: u32,
) -> io::Result<oneshot::Receiver<Result<u16>>> {
    let (ready_tx, ready_rx) = oneshot::channel();

    std::thread::Builder::new()
        .name("callback-listener".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(error) => {
                    let _ = ready_tx.send(Err(RelayError::ListenerBind(error)));
                    return;
                }
            };

            runtime.block_on(async move {
                let (listener, port) = match bind_with_retry(start, attempts).await {
                    Ok(bound) => bound,
                    Err(error) => {
                        tracing::error!(
                            target = "ask_relay::callback",
                            error = %error,
                            "callback listener failed to start"
                        );
                        let _ = ready_tx.send(Err(error));
                        return;
                    }
                };

                tracing::info!(target = "ask_relay::callback", port, "callback listener started");
                let _ = ready_tx.send(Ok(port));

                if let Err(error) = axum::serve(listener, router).await {
                    tracing::error!(
                        target = "ask_relay::callback",
                        error = %error,
                        "callback listener stopped"
                    );
                }
            });
        })?;

    Ok(ready_rx)
}
