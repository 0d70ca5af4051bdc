//! MCP Bridge — JSON-RPC client plumbing for Model Context Protocol servers.
//!
//! This crate handles:
//! - Spawning stdio servers and dialing SSE endpoints behind one transport enum
//! - JSON-RPC 2.0 framing, request correlation, and per-request timeouts
//! - A connection registry with lifecycle events for the host application
//! - Server discovery from the desktop agent's config and project `.mcp.json`
//! - SQLite-backed usage analytics and context-sensitive tool ranking
//!
//! The host drives everything through [`McpRegistry`]; the other modules are
//! public for embedders that need finer-grained control.

pub mod analytics;
pub mod codec;
pub mod connection;
pub mod correlator;
pub mod discovery;
pub mod errors;
pub mod registry;
pub mod scoring;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use analytics::{ToolUsageStat, UsageAnalytics};
pub use connection::{Connection, ConnectionState};
pub use errors::McpError;
pub use registry::{McpRegistry, ServerStatus};
pub use scoring::{RelevanceScorer, ScoredTool, ScoringWeights, ToolContext};
pub use types::{
    McpEvent, McpEventKind, PromptDescriptor, ResourceDescriptor, ServerDescriptor, ServerInfo,
    ToolCallResult, ToolDescriptor, TransportKind,
};

/// Return the platform-standard data directory for mcp-bridge.
///
/// - macOS: `~/Library/Application Support/mcp-bridge/`
/// - Windows: `{FOLDERID_RoamingAppData}\mcp-bridge\`
/// - Linux: `$XDG_DATA_HOME/mcp-bridge/` (fallback `~/.local/share/mcp-bridge/`)
///
/// Falls back to `~/.mcp-bridge/` only if none of the above can be resolved.
pub fn data_dir() -> std::path::PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcp-bridge");
    }
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".mcp-bridge")
}

/// Resolve the path for the usage analytics database.
///
/// Uses the platform-standard data directory (creates it if needed).
pub fn analytics_db_path() -> std::path::PathBuf {
    let dir = data_dir();
    if !dir.exists() {
        let _ = std::fs::create_dir_all(&dir);
    }
    dir.join("usage.db")
}

/// Initialize the tracing subscriber with plain-text output on stderr.
///
/// The filter defaults to `mcp_bridge=info,warn` and can be overridden via
/// `RUST_LOG`. Safe to call more than once; only the first call installs a
/// subscriber.
pub fn init_tracing() {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mcp_bridge=info,warn"));

    let _ = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .try_init();
}
