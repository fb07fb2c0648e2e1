//! Registration of the relay as an MCP server in an editor's JSON config.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::Serialize;
use serde_json::{Map, Value};

pub const SERVER_NAME: &str = "ask-continue";
const SERVERS_KEY: &str = "mcpServers";

/// The `mcpServers` entry that launches this relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerEntry {
    pub command: String,
    pub args: Vec<String>,
}

impl ServerEntry {
    pub fn for_current_exe() -> io::Result<Self> {
        let exe = std::env::current_exe()?;
        Ok(Self {
            command: exe.to_string_lossy().into_owned(),
            args: vec!["serve".to_string()],
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct McpInstallReport {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub backup: Option<PathBuf>,
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".codeium").join("windsurf").join("mcp_config.json"))
}

pub fn install_server(config_path: &Path, entry: &ServerEntry) -> io::Result<McpInstallReport> {
    let mut report = McpInstallReport::default();
    let desired = serde_json::to_value(entry).map_err(io::Error::other)?;

    if !config_path.exists() {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut servers = Map::new();
        servers.insert(SERVER_NAME.to_string(), desired);
        let mut top = Map::new();
        top.insert(SERVERS_KEY.to_string(), Value::Object(servers));
        write_pretty_json(config_path, &Value::Object(top))?;
        tracing::info!(target = "ask_relay::install", path = %config_path.display(), "created MCP config");
        report.created = 1;
        return Ok(report);
    }

    let mut top = load_document(config_path)?;
    let mut servers = take_servers(&mut top);
    if servers.get(SERVER_NAME) == Some(&desired) {
        report.skipped = 1;
        return Ok(report);
    }

    report.backup = Some(backup_config(config_path)?);
    servers.insert(SERVER_NAME.to_string(), desired);
    top.insert(SERVERS_KEY.to_string(), Value::Object(servers));
    write_pretty_json(config_path, &Value::Object(top))?;
    tracing::info!(target = "ask_relay::install", path = %config_path.display(), "registered ask-continue server");
    report.updated = 1;
    Ok(report)
}

/// Remove only the relay's entry. Returns whether the file changed.
pub fn uninstall_server(config_path: &Path) -> io::Result<bool> {
    if !config_path.exists() {
        return Ok(false);
    }

    let mut top = load_document(config_path)?;
    let mut servers = take_servers(&mut top);
    if servers.remove(SERVER_NAME).is_none() {
        return Ok(false);
    }

    backup_config(config_path)?;
    top.insert(SERVERS_KEY.to_string(), Value::Object(servers));
    write_pretty_json(config_path, &Value::Object(top))?;
    tracing::info!(target = "ask_relay::install", path = %config_path.display(), "removed ask-continue server");
    Ok(true)
}

/// Parse the existing config. Unreadable JSON or a non-object top level is
/// replaced by an empty document; the caller backs the file up before writing.
fn load_document(path: &Path) -> io::Result<Map<String, Value>> {
    let raw = fs::read_to_string(path)?;
    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(top)) => Ok(top),
        Ok(_) => {
            tracing::warn!(target = "ask_relay::install", path = %path.display(), "config is not a JSON object, starting fresh");
            Ok(Map::new())
        }
        Err(error) => {
            tracing::warn!(target = "ask_relay::install", path = %path.display(), error = %error, "config is not valid JSON, starting fresh");
            Ok(Map::new())
        }
    }
}

/// Detach `mcpServers` from the document; a missing or non-object value
/// becomes an empty map.
fn take_servers(top: &mut Map<String, Value>) -> Map<String, Value> {
    match top.remove(SERVERS_KEY) {
        Some(Value::Object(servers)) => servers,
        _ => Map::new(),
    }
}

/// Copy the config to `<stem>.backup_<YYYYmmdd_HHMMSS>.json` beside it.
fn backup_config(path: &Path) -> io::Result<PathBuf> {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "mcp_config".to_string());
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let backup = path.with_file_name(format!("{stem}.backup_{timestamp}.json"));
    fs::copy(path, &backup)?;
    tracing::info!(target = "ask_relay::install", backup = %backup.display(), "backed up MCP config");
    Ok(backup)
}

fn write_pretty_json(path: &Path, value: &Value) -> io::Result<()> {
    let mut body = serde_json::to_string_pretty(value).map_err(|error| {
        io::Error::other(format!("failed to serialize {}: {error}", path.display()))
    })?;
    body.push('\n');
    fs::write(path, body)
}

#[cfg(test)]
mod tests {
    use std::{fs, path::Path};

    use serde_json::{json, Value};
    use tempfile::tempdir;

    use super::{install_server, uninstall_server, ServerEntry, SERVER_NAME};

    fn entry() -> ServerEntry {
        ServerEntry {
            command: "/opt/ask-continue-relay".to_string(),
            args: vec!["serve".to_string()],
        }
    }

    fn read_json(path: &Path) -> Value {
        serde_json::from_str(&fs::read_to_string(path).expect("read config")).expect("parse config")
    }

    fn backups_in(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.contains(".backup_"))
            .collect()
    }

    #[test]
    fn creates_config_and_parent_directories_when_missing() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join(".codeium").join("windsurf").join("mcp_config.json");

        let report = install_server(&path, &entry()).expect("install");
        assert_eq!((report.created, report.updated, report.skipped), (1, 0, 0));
        assert!(report.backup.is_none());

        let json = read_json(&path);
        assert_eq!(
            json["mcpServers"][SERVER_NAME],
            json!({ "command": "/opt/ask-continue-relay", "args": ["serve"] })
        );
    }

    #[test]
    fn merges_into_existing_servers_and_backs_up() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("mcp_config.json");
        fs::write(
            &path,
            r#"{"mcpServers":{"other":{"command":"uvx","args":["other-mcp"]}},"theme":"dark"}"#,
        )
        .expect("write existing config");

        let report = install_server(&path, &entry()).expect("install");
        assert_eq!((report.created, report.updated, report.skipped), (0, 1, 0));

        let json = read_json(&path);
        assert_eq!(json["mcpServers"]["other"]["command"], json!("uvx"));
        assert_eq!(json["theme"], json!("dark"));
        assert_eq!(json["mcpServers"][SERVER_NAME]["command"], json!("/opt/ask-continue-relay"));

        let backup = report.backup.expect("backup written");
        let name = backup.file_name().expect("name").to_string_lossy().into_owned();
        assert!(name.starts_with("mcp_config.backup_"));
        assert!(name.ends_with(".json"));
        assert!(read_json(&backup)["mcpServers"].get(SERVER_NAME).is_none());
    }

    #[test]
    fn identical_entry_is_skipped_without_backup() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("mcp_config.json");
        install_server(&path, &entry()).expect("first install");

        let report = install_server(&path, &entry()).expect("second install");
        assert_eq!((report.created, report.updated, report.skipped), (0, 0, 1));
        assert!(backups_in(temp.path()).is_empty());
    }

    #[test]
    fn changed_command_updates_entry() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("mcp_config.json");
        install_server(&path, &entry()).expect("first install");

        let moved = ServerEntry {
            command: "/usr/local/bin/ask-continue-relay".to_string(),
            ..entry()
        };
        let report = install_server(&path, &moved).expect("reinstall");
        assert_eq!(report.updated, 1);
        assert_eq!(
            read_json(&path)["mcpServers"][SERVER_NAME]["command"],
            json!("/usr/local/bin/ask-continue-relay")
        );
    }

    #[test]
    fn invalid_json_is_backed_up_and_replaced() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("mcp_config.json");
        fs::write(&path, "{ broken").expect("write broken config");

        let report = install_server(&path, &entry()).expect("install");
        assert_eq!(report.updated, 1);

        let backup = report.backup.expect("backup written");
        assert_eq!(fs::read_to_string(backup).expect("read backup"), "{ broken");
        let json = read_json(&path);
        assert_eq!(json["mcpServers"].as_object().map(|servers| servers.len()), Some(1));
    }

    #[test]
    fn non_object_servers_field_is_reset() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("mcp_config.json");
        fs::write(&path, r#"{"mcpServers":[1,2]}"#).expect("write config");

        install_server(&path, &entry()).expect("install");
        assert!(read_json(&path)["mcpServers"][SERVER_NAME].is_object());
    }

    #[test]
    fn uninstall_removes_only_relay_entry() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("mcp_config.json");
        fs::write(
            &path,
            r#"{"mcpServers":{"other":{"command":"uvx"},"ask-continue":{"command":"x","args":[]}}}"#,
        )
        .expect("write config");

        assert!(uninstall_server(&path).expect("uninstall"));
        let json = read_json(&path);
        assert!(json["mcpServers"].get(SERVER_NAME).is_none());
        assert!(json["mcpServers"]["other"].is_object());
        assert_eq!(backups_in(temp.path()).len(), 1);

        assert!(!uninstall_server(&path).expect("second uninstall"));
    }

    #[test]
    fn uninstall_missing_file_is_noop() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("absent.json");
        assert!(!uninstall_server(&path).expect("uninstall"));
        assert!(!path.exists());
    }
}
