use std::{path::PathBuf, time::Duration};

pub const DEFAULT_EXTENSION_PORT: u16 = 23983;
pub const CALLBACK_PORT_START: u16 = 23984;
pub const CALLBACK_PORT_ATTEMPTS: u32 = 50;
pub const PORT_DIR_NAME: &str = "ask-continue-ports";
pub const PORT_DIR_ENV: &str = "ASK_CONTINUE_PORT_DIR";

/// Runtime settings for one relay service instance.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Directory scanned for `*.port` descriptor files.
    pub port_dir: PathBuf,
    /// Port tried when no descriptor is found.
    pub default_extension_port: u16,
    /// Host the editor extensions listen on.
    pub extension_host: String,
    pub callback_port_start: u16,
    pub callback_port_attempts: u32,
    /// How long service start waits for the callback listener to bind.
    pub ready_timeout: Duration,
    /// Per-candidate POST timeout.
    pub request_timeout: Duration,
    pub max_rounds: u32,
    /// Unit of the exponential backoff between failed rounds.
    pub backoff_base: Duration,
    pub discovery_attempts: u32,
    pub discovery_retry_delay: Duration,
    /// Pending entries older than this are reaped as expired.
    pub max_pending_age: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port_dir: default_port_dir(),
            default_extension_port: DEFAULT_EXTENSION_PORT,
            extension_host: "127.0.0.1".to_string(),
            callback_port_start: CALLBACK_PORT_START,
            callback_port_attempts: CALLBACK_PORT_ATTEMPTS,
            ready_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            max_rounds: 3,
            backoff_base: Duration::from_secs(1),
            discovery_attempts: 3,
            discovery_retry_delay: Duration::from_secs(1),
            max_pending_age: Duration::from_secs(600),
        }
    }
}

/// `<temp>/ask-continue-ports`, unless `ASK_CONTINUE_PORT_DIR` is set.
pub fn default_port_dir() -> PathBuf {
    std::env::var(PORT_DIR_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join(PORT_DIR_NAME))
}

#[derive(Debug, clap::Args, Clone)]
pub struct ServeArgs {
    /// Tracing filter directives; `RUST_LOG` applies when omitted.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Emit relay lifecycle events as JSON lines on stderr.
    #[arg(long, default_value_t = false)]
    pub json_events: bool,

    #[arg(long)]
    pub port_dir: Option<PathBuf>,

    #[arg(long, default_value_t = DEFAULT_EXTENSION_PORT)]
    pub default_extension_port: u16,

    #[arg(long, default_value_t = CALLBACK_PORT_START)]
    pub callback_port_start: u16,

    #[arg(long, default_value_t = CALLBACK_PORT_ATTEMPTS)]
    pub callback_port_attempts: u32,

    #[arg(long, default_value_t = 600)]
    pub max_pending_age_secs: u64,
}

impl Default for ServeArgs {
    fn default() -> Self {
        Self {
            log_level: None,
            json_events: false,
            port_dir: None,
            default_extension_port: DEFAULT_EXTENSION_PORT,
            callback_port_start: CALLBACK_PORT_START,
            callback_port_attempts: CALLBACK_PORT_ATTEMPTS,
            max_pending_age_secs: 600,
        }
    }
}

impl ServeArgs {
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            port_dir: self.port_dir.clone().unwrap_or_else(default_port_dir),
            default_extension_port: self.default_extension_port,
            callback_port_start: self.callback_port_start,
            callback_port_attempts: self.callback_port_attempts.max(1),
            max_pending_age: Duration::from_secs(self.max_pending_age_secs),
            ..RelayConfig::default()
        }
    }
}
