//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types, server descriptors, and the event payloads
//! emitted to the host application.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Protocol version advertised during the `initialize` handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Per-request timeout applied when a descriptor does not set its own.
pub const DEFAULT_TIMEOUT_MILLIS: u64 = 30_000;

// ─── JSON-RPC 2.0 ────────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (a request without an id; no response follows).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    /// Create a new JSON-RPC notification.
    pub fn new(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// Either outbound JSON-RPC unit. Serializes as the bare inner object.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OutboundMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// An inbound JSON-RPC unit before classification.
///
/// Responses carry `id` (and `result` or `error`); notifications carry
/// `method` without an id. Servers may also issue requests of their own
/// (both `id` and `method`), which this client does not service.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
}

impl InboundMessage {
    /// True when this message is a server-initiated notification.
    pub fn is_notification(&self) -> bool {
        self.id.is_none() && self.method.is_some()
    }

    /// True when this message answers one of our requests.
    pub fn is_response(&self) -> bool {
        self.id.is_some() && self.method.is_none()
    }
}

// ─── Server Descriptors ──────────────────────────────────────────────────────

/// Identity and connection recipe for a remote tool server.
///
/// Constructed by the caller or by discovery; never mutated by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDescriptor {
    /// Unique key within the registry.
    pub id: String,
    /// Display name.
    pub name: String,
    #[serde(flatten)]
    pub transport: TransportKind,
    /// Applied to every request sent on connections built from this
    /// descriptor.
    #[serde(default = "default_timeout_millis")]
    pub timeout_millis: u64,
}

/// How to reach the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "transportKind", rename_all = "camelCase")]
pub enum TransportKind {
    /// Spawn a child process and speak line-delimited JSON over its stdio.
    Stream {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        cwd: Option<PathBuf>,
    },
    /// Long-lived SSE stream for inbound traffic, HTTP POST for outbound.
    EventStream {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

fn default_timeout_millis() -> u64 {
    DEFAULT_TIMEOUT_MILLIS
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// A tool advertised by a server via `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: serde_json::Value,
}

/// A resource advertised by a server via `resources/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub uri: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "mimeType")]
    pub mime_type: Option<String>,
}

/// A prompt template advertised by a server via `prompts/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
}

/// One named argument accepted by a prompt template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

/// Result of a tool call, with the server's content payload kept verbatim.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallResult {
    pub tool_name: String,
    pub content: serde_json::Value,
    pub is_error: bool,
    pub execution_time_ms: u64,
}

/// Server identity returned in the initialize response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

// ─── Events ──────────────────────────────────────────────────────────────────

/// Lifecycle and notification event forwarded to the host application.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct McpEvent {
    pub server_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: McpEventKind,
}

impl McpEvent {
    pub fn new(server_id: &str, kind: McpEventKind) -> Self {
        Self {
            server_id: server_id.to_string(),
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// What happened, plus any payload the host may want to display.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum McpEventKind {
    Connecting,
    Connected { capabilities: serde_json::Value },
    Disconnected { reason: Option<String> },
    Error { message: String },
    ToolsChanged,
    ResourcesChanged,
    PromptsChanged,
    Log { data: serde_json::Value },
}

// ─── Standard JSON-RPC Error Codes ───────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────
