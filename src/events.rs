use std::io::{self, Write};

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber. Everything goes to stderr: stdout is
/// reserved for the JSON-RPC tool protocol.
///
/// The level comes from `log_level` when given, then `RUST_LOG`, then `info`.
pub fn init_logging(log_level: Option<&str>) -> Result<()> {
    let from_env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = resolve_filter(log_level, from_env.as_deref());
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(true)
        .with_ansi(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn resolve_filter(flag: Option<&str>, from_env: Option<&str>) -> EnvFilter {
    [flag, from_env]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|directives| !directives.is_empty())
        .find_map(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Writes relay lifecycle events as JSON lines on stderr when enabled.
#[derive(Clone, Debug, Default)]
pub struct EventEmitter {
    json_output: bool,
}

impl EventEmitter {
    pub fn new(json_output: bool) -> Self {
        Self { json_output }
    }

    pub fn is_enabled(&self) -> bool {
        self.json_output
    }

    pub fn emit<T: Serialize>(&self, event_type: &str, payload: T) {
        if !self.json_output {
            return;
        }

        let line = event_line(event_type, payload);
        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "{}", line);
    }
}

fn event_line<T: Serialize>(event_type: &str, payload: T) -> serde_json::Value {
    json!({
        "ts": Utc::now().to_rfc3339(),
        "type": event_type,
        "payload": payload,
    })
}
