//! Discovery of live editor-extension listeners.
//!
//! Each running extension instance publishes a small JSON descriptor named
//! `<pid>.port` into a shared directory. Discovery is best-effort: unreadable
//! or malformed descriptors are skipped, and an empty scan falls back to the
//! well-known default port. Stale descriptors are not filtered here; they fail
//! at dispatch time and the dispatcher moves on to the next candidate.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

pub const DESCRIPTOR_SUFFIX: &str = ".port";

/// Contents of one `*.port` file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Publication time in epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<u64>,
}

/// Source of candidate extension ports for the dispatcher.
pub trait EndpointDiscovery: Send + Sync {
    /// Candidate ports in the order they should be tried. Never fails; an
    /// implementation that finds nothing returns an empty list.
    fn discover(&self) -> Vec<u16>;
}

#[derive(Debug, Clone)]
pub struct EndpointRegistry {
    dir: PathBuf,
    default_port: u16,
}

impl EndpointRegistry {
    pub fn new(dir: impl Into<PathBuf>, default_port: u16) -> Self {
        Self {
            dir: dir.into(),
            default_port,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn default_port(&self) -> u16 {
        self.default_port
    }

    /// Every well-formed descriptor in the directory, ordered by file name.
    pub fn scan(&self) -> Vec<EndpointDescriptor> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(error) => {
                tracing::debug!(
                    target = "ask_relay::registry",
                    dir = %self.dir.display(),
                    error = %error,
                    "descriptor directory unavailable"
                );
                return Vec::new();
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.ends_with(DESCRIPTOR_SUFFIX))
            })
            .collect();
        paths.sort();

        paths
            .iter()
            .filter_map(|path| match read_descriptor(path) {
                Some(descriptor) => Some(descriptor),
                None => {
                    tracing::debug!(
                        target = "ask_relay::registry",
                        file = %path.display(),
                        "skipping malformed descriptor"
                    );
                    None
                }
            })
            .collect()
    }
}

impl EndpointDiscovery for EndpointRegistry {
    fn discover(&self) -> Vec<u16> {
        let mut ports = Vec::new();
        for descriptor in self.scan() {
            if !ports.contains(&descriptor.port) {
                ports.push(descriptor.port);
            }
        }
        if ports.is_empty() {
            ports.push(self.default_port);
        }
        ports
    }
}

fn read_descriptor(path: &Path) -> Option<EndpointDescriptor> {
    let raw = fs::read_to_string(path).ok()?;
    let descriptor: EndpointDescriptor = serde_json::from_str(&raw).ok()?;
    (descriptor.port != 0).then_some(descriptor)
}

/// Write a descriptor the way an extension instance publishes itself.
pub fn publish_descriptor(dir: &Path, descriptor: &EndpointDescriptor) -> std::io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let stem = descriptor
        .pid
        .map(|pid| pid.to_string())
        .unwrap_or_else(|| format!("port-{}", descriptor.port));
    let path = dir.join(format!("{stem}{DESCRIPTOR_SUFFIX}"));
    let body = serde_json::to_string(descriptor).map_err(std::io::Error::other)?;
    fs::write(&path, body)?;
    Ok(path)
}
