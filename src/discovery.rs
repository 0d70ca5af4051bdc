//! Server discovery — merge the desktop agent's global config with a
//! project-local `.mcp.json`.
//!
//! Both sources are optional and independently fault-tolerant: an unreadable
//! or unparseable file is skipped with a warning instead of failing the whole
//! pass. Name collisions across sources stay distinct (the project entry is
//! renamed), never merged.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::types::{ServerDescriptor, TransportKind, DEFAULT_TIMEOUT_MILLIS};

/// File name of the project-local configuration, resolved against the
/// project root handed to [`discover`].
pub const PROJECT_CONFIG_NAME: &str = ".mcp.json";

// ─── Config Paths ────────────────────────────────────────────────────────────

/// Platform path of the desktop agent's global configuration file.
///
/// Resolves to `<config dir>/Claude/claude_desktop_config.json`, e.g.
/// `~/Library/Application Support/Claude/…` on macOS or `~/.config/Claude/…`
/// on Linux. `None` when the platform exposes no config directory.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("Claude").join("claude_desktop_config.json"))
}

// ─── Raw Config Format ───────────────────────────────────────────────────────

/// On-disk shape shared by both sources: `{ "mcpServers": { name: entry } }`.
#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(rename = "mcpServers", default)]
    mcp_servers: HashMap<String, RawServerEntry>,
}

/// One server entry before validation. Every field is optional in the file;
/// [`normalize`] decides which combination is usable.
#[derive(Debug, Deserialize)]
struct RawServerEntry {
    /// `stdio` (default when absent), `sse`, or `http`.
    #[serde(rename = "type", default)]
    entry_type: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
}

// ─── Discovery ───────────────────────────────────────────────────────────────

/// Discover servers from the global config file and, when a project root is
/// given, from `<root>/.mcp.json`.
///
/// Returns descriptors keyed by id. A project entry whose name collides with
/// a global one is renamed with a ` (project)` suffix so both stay reachable.
pub fn discover(project_root: Option<&Path>) -> HashMap<String, ServerDescriptor> {
    discover_from(global_config_path().as_deref(), project_root)
}

/// [`discover`] with an explicit global config path, for callers (and tests)
/// that don't want the platform default.
pub fn discover_from(
    global_config: Option<&Path>,
    project_root: Option<&Path>,
) -> HashMap<String, ServerDescriptor> {
    let mut servers: HashMap<String, ServerDescriptor> = HashMap::new();

    if let Some(path) = global_config {
        for descriptor in load_source(path, "global") {
            servers.insert(descriptor.id.clone(), descriptor);
        }
    }

    if let Some(root) = project_root {
        let path = root.join(PROJECT_CONFIG_NAME);
        for mut descriptor in load_source(&path, "project") {
            if servers.contains_key(&descriptor.id) {
                let renamed = format!("{} (project)", descriptor.id);
                tracing::info!(
                    server = %descriptor.id,
                    renamed = %renamed,
                    "project server name collides with a global entry, renaming"
                );
                descriptor.id = renamed.clone();
                descriptor.name = renamed;
            }
            servers.insert(descriptor.id.clone(), descriptor);
        }
    }

    servers
}

/// Read and parse one config source. Any failure is logged and yields an
/// empty list so the other source still contributes.
fn load_source(path: &Path, source: &str) -> Vec<ServerDescriptor> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), source, "config file not present");
            return Vec::new();
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                source,
                error = %e,
                "failed to read config file, skipping source"
            );
            return Vec::new();
        }
    };

    let config: RawConfig = match serde_json::from_str(&raw) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                source,
                error = %e,
                "skipping unparseable config file"
            );
            return Vec::new();
        }
    };

    config
        .mcp_servers
        .into_iter()
        .filter_map(|(name, entry)| normalize(&name, entry, source))
        .collect()
}

/// Validate one raw entry into a descriptor, or skip it with a warning when
/// the required field for its transport kind is missing.
fn normalize(name: &str, entry: RawServerEntry, source: &str) -> Option<ServerDescriptor> {
    let kind = entry.entry_type.as_deref().unwrap_or("stdio");

    let transport = match kind {
        "stdio" => {
            let command = match entry.command {
                Some(command) => command,
                None => {
                    tracing::warn!(
                        server = name,
                        source,
                        "skipping stdio server without a command"
                    );
                    return None;
                }
            };
            TransportKind::Stream {
                command,
                args: entry.args,
                env: entry.env,
                cwd: entry.cwd,
            }
        }
        // Both names appear in the wild for the SSE transport.
        "sse" | "http" => {
            let url = match entry.url {
                Some(url) => url,
                None => {
                    tracing::warn!(
                        server = name,
                        source,
                        "skipping event-stream server without a url"
                    );
                    return None;
                }
            };
            TransportKind::EventStream {
                url,
                headers: entry.headers,
            }
        }
        other => {
            tracing::warn!(
                server = name,
                source,
                transport_type = other,
                "skipping server with unknown transport type"
            );
            return None;
        }
    };

    Some(ServerDescriptor {
        id: name.to_string(),
        name: name.to_string(),
        transport,
        timeout_millis: DEFAULT_TIMEOUT_MILLIS,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
