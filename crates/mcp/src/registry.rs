//! Server registry: turns connection intents into server descriptors.
//!
//! Intents come in four shapes: script paths, URLs, a JSON config document
//! with an `mcpServers` object, and auto-discovery of well-known config
//! files. No process or network I/O happens here.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::protocol::PROTOCOL_VERSION;
use crate::transport::{TransportConfig, TransportKind};

/// A normalized description of one tool server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub name: String,
    pub transport: TransportConfig,
}

impl ServerDescriptor {
    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }
}

/// Everything a caller may ask to connect to.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    /// Local server scripts (`.py`, `.js`, `.mjs`).
    pub server_paths: Vec<PathBuf>,
    /// Remote server URLs.
    pub server_urls: Vec<String>,
    /// A JSON document with an `mcpServers` object.
    pub config_path: Option<PathBuf>,
    /// Also look for well-known config documents.
    pub auto_discovery: bool,
}

/// Descriptors produced by [`resolve`], plus the intents that failed.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub descriptors: Vec<ServerDescriptor>,
    pub errors: Vec<String>,
}

/// Resolve all intents in `options`, de-duplicating by name (first wins).
pub fn resolve(options: &ConnectOptions) -> Resolution {
    let mut resolution = Resolution::default();
    let mut candidates = descriptors_from_paths(&options.server_paths);
    candidates.extend(descriptors_from_urls(&options.server_urls));

    if let Some(path) = &options.config_path {
        match descriptors_from_config_file(path) {
            Ok(found) => candidates.extend(found),
            Err(e) => resolution
                .errors
                .push(format!("Error loading config from {}: {e}", path.display())),
        }
    }

    if options.auto_discovery {
        candidates.extend(discover());
    }

    let mut seen = HashSet::new();
    for descriptor in candidates {
        if seen.insert(descriptor.name.clone()) {
            resolution.descriptors.push(descriptor);
        } else {
            tracing::debug!(server = %descriptor.name, "duplicate server name ignored");
        }
    }
    resolution
}

/// Descriptors for local scripts. Unrecognized file types are dropped.
pub fn descriptors_from_paths<P: AsRef<Path>>(paths: &[P]) -> Vec<ServerDescriptor> {
    paths
        .iter()
        .filter_map(|path| descriptor_from_path(path.as_ref()))
        .collect()
}

fn descriptor_from_path(path: &Path) -> Option<ServerDescriptor> {
    let interpreter = match path.extension()?.to_str()? {
        "py" => "python3",
        "js" | "mjs" => "node",
        _ => {
            tracing::debug!(path = %path.display(), "not a recognized server script");
            return None;
        }
    };
    let file_name = path.file_name()?.to_str()?;
    let name = file_name.split('.').next().unwrap_or(file_name);
    if name.is_empty() {
        return None;
    }

    Some(ServerDescriptor {
        name: name.to_string(),
        transport: TransportConfig::Stdio {
            command: interpreter.to_string(),
            args: vec![path.to_string_lossy().into_owned()],
            env: HashMap::new(),
        },
    })
}

/// Descriptors for remote servers. Only `http(s)://` URLs are accepted.
pub fn descriptors_from_urls<S: AsRef<str>>(urls: &[S]) -> Vec<ServerDescriptor> {
    urls.iter()
        .filter_map(|url| descriptor_from_url(url.as_ref()))
        .collect()
}

fn descriptor_from_url(url: &str) -> Option<ServerDescriptor> {
    let parsed = match reqwest::Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => parsed,
        _ => {
            tracing::debug!(url, "not an http(s) url");
            return None;
        }
    };
    let host = parsed.host_str()?;
    let name = host.replace(['.', ':'], "_");

    let transport = if url.to_ascii_lowercase().contains("sse") {
        TransportConfig::Sse {
            url: url.to_string(),
        }
    } else {
        TransportConfig::StreamableHttp {
            url: url.to_string(),
            headers: HashMap::from([(
                "MCP-Protocol-Version".to_string(),
                PROTOCOL_VERSION.to_string(),
            )]),
        }
    };
    Some(ServerDescriptor { name, transport })
}

#[derive(Debug, Deserialize)]
struct ConfigEntry {
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
}

/// Read and parse a config document.
pub fn descriptors_from_config_file(path: &Path) -> Result<Vec<ServerDescriptor>> {
    if !path.exists() {
        return Err(Error::Config(format!(
            "Config file not found: {}",
            path.display()
        )));
    }
    let content = std::fs::read_to_string(path)?;
    parse_config_document(&content)
}

/// Parse a document of the form `{"mcpServers": {name: {command, args, env}}}`.
///
/// Entries without a `command` are skipped with a warning.
pub fn parse_config_document(content: &str) -> Result<Vec<ServerDescriptor>> {
    let document: Value = serde_json::from_str(content)
        .map_err(|e| Error::Config(format!("Invalid JSON in config file: {e}")))?;
    let servers = document
        .get("mcpServers")
        .and_then(Value::as_object)
        .ok_or_else(|| Error::Config("Config file must contain \"mcpServers\" object".into()))?;

    let mut descriptors = Vec::with_capacity(servers.len());
    for (name, entry) in servers {
        let entry: ConfigEntry = match serde_json::from_value(entry.clone()) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(server = %name, error = %e, "skipping malformed server entry");
                continue;
            }
        };
        let Some(command) = entry.command.filter(|c| !c.is_empty()) else {
            tracing::warn!(server = %name, "skipping server entry without a command");
            continue;
        };
        descriptors.push(ServerDescriptor {
            name: name.clone(),
            transport: TransportConfig::Stdio {
                command,
                args: entry.args,
                env: entry.env,
            },
        });
    }
    Ok(descriptors)
}

/// Best-effort discovery from well-known config documents.
pub fn discover() -> Vec<ServerDescriptor> {
    discover_in(&discovery_candidates())
}

fn discover_in(candidates: &[PathBuf]) -> Vec<ServerDescriptor> {
    let mut found = Vec::new();
    for path in candidates.iter().filter(|p| p.exists()) {
        match descriptors_from_config_file(path) {
            Ok(descriptors) => {
                tracing::info!(path = %path.display(), count = descriptors.len(), "discovered servers");
                found.extend(descriptors);
            }
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "ignoring config"),
        }
    }
    found
}

fn discovery_candidates() -> Vec<PathBuf> {
    let mut candidates = vec![PathBuf::from(".mcp.json")];
    if let Some(dir) = desktop_config_dir() {
        candidates.push(dir.join("Claude").join("claude_desktop_config.json"));
    }
    candidates
}

fn desktop_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| PathBuf::from(h).join("Library/Application Support"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
    }
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(PathBuf::from)
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        None
    }
}
