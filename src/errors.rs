//! MCP client error types.

use thiserror::Error;

/// Errors surfaced by the MCP client subsystem.
#[derive(Debug, Error)]
pub enum McpError {
    /// A stream-transport server process failed to start.
    #[error("failed to spawn server '{server}': {reason}")]
    SpawnFailed {
        server: String,
        reason: String,
    },

    /// Establishing the transport session failed (spawn aside): bad HTTP
    /// status, endpoint wait expired, unreachable host.
    #[error("failed to connect to server '{server}': {reason}")]
    ConnectFailed {
        server: String,
        reason: String,
    },

    /// The initialize handshake failed after the transport came up.
    #[error("server '{server}' initialization failed: {reason}")]
    HandshakeFailed {
        server: String,
        reason: String,
    },

    /// I/O failure on an established transport.
    #[error("transport error for server '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// The connection closed while the request was still pending.
    #[error("connection closed for server '{server}': {reason}")]
    ConnectionClosed {
        server: String,
        reason: String,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A request received no response within its timeout.
    #[error("request '{method}' timed out after {timeout_ms}ms")]
    Timeout {
        method: String,
        timeout_ms: u64,
    },

    /// An operation addressed a server id with no live connection.
    #[error("server not connected: '{server}'")]
    NotConnected {
        server: String,
    },

    /// Event-stream send attempted before the server announced its
    /// reply channel.
    #[error("no session URL available for server '{server}'")]
    NoSessionUrl {
        server: String,
    },

    /// Usage-analytics storage failure.
    #[error("storage error: {reason}")]
    StorageError {
        reason: String,
    },
}

impl From<rusqlite::Error> for McpError {
    fn from(e: rusqlite::Error) -> Self {
        McpError::StorageError {
            reason: e.to_string(),
        }
    }
}
