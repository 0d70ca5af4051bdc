//! The server registry.
//!
//! One `McpRegistry` owns every live connection, keyed by server id.
//! Connect and disconnect serialize on the registry lock, so concurrent
//! connects to one server cannot double-spawn it; operations clone the
//! connection handle out and run without the lock. All lifecycle events
//! funnel through the single receiver handed out at construction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use crate::analytics::UsageAnalytics;
use crate::connection::{Connection, ConnectionState};
use crate::errors::McpError;
use crate::types::{
    McpEvent, McpEventKind, PromptDescriptor, ResourceDescriptor, ServerDescriptor, ServerInfo,
    ToolCallResult, ToolDescriptor,
};

// ─── Server Status ───────────────────────────────────────────────────────────

/// Point-in-time view of one registered server, for status surfaces.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub id: String,
    pub name: String,
    pub state: ConnectionState,
    pub server_info: Option<ServerInfo>,
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// Owner of all live server connections.
pub struct McpRegistry {
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    analytics: Arc<UsageAnalytics>,
    events: mpsc::UnboundedSender<McpEvent>,
}

impl McpRegistry {
    /// Build a registry and the receiver its lifecycle events arrive on.
    pub fn new(analytics: Arc<UsageAnalytics>) -> (Self, mpsc::UnboundedReceiver<McpEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                connections: Mutex::new(HashMap::new()),
                analytics,
                events,
            },
            events_rx,
        )
    }

    fn emit(&self, server_id: &str, kind: McpEventKind) {
        let _ = self.events.send(McpEvent::new(server_id, kind));
    }

    /// Connect a server and return its advertised capabilities.
    ///
    /// Connecting an id that already holds a live connection is a no-op
    /// returning the cached capabilities; the server is not touched. A
    /// stale closed entry is replaced with a fresh session.
    pub async fn connect(&self, descriptor: ServerDescriptor) -> Result<Value, McpError> {
        let mut connections = self.connections.lock().await;

        if let Some(existing) = connections.get(&descriptor.id) {
            if existing.state() == ConnectionState::Connected {
                tracing::debug!(server = %descriptor.id, "already connected");
                return Ok(existing.capabilities().clone());
            }
            connections.remove(&descriptor.id);
        }

        let id = descriptor.id.clone();
        self.emit(&id, McpEventKind::Connecting);

        match Connection::open(descriptor, self.events.clone()).await {
            Ok(connection) => {
                let capabilities = connection.capabilities().clone();
                self.emit(
                    &id,
                    McpEventKind::Connected {
                        capabilities: capabilities.clone(),
                    },
                );
                connections.insert(id, Arc::new(connection));
                Ok(capabilities)
            }
            Err(e) => {
                tracing::warn!(server = %id, error = %e, "connection failed");
                self.emit(
                    &id,
                    McpEventKind::Error {
                        message: e.to_string(),
                    },
                );
                Err(e)
            }
        }
    }

    /// Close and forget a server. Disconnecting an unknown id is a no-op.
    pub async fn disconnect(&self, id: &str) -> Result<(), McpError> {
        let mut connections = self.connections.lock().await;
        match connections.remove(id) {
            Some(connection) => {
                connection.close().await;
                Ok(())
            }
            None => {
                tracing::debug!(server = %id, "disconnect for unregistered server");
                Ok(())
            }
        }
    }

    /// Close every connection and flush pending analytics writes. The
    /// registry stays usable afterwards.
    pub async fn shutdown_all(&self) {
        {
            let mut connections = self.connections.lock().await;
            for (_, connection) in connections.drain() {
                connection.close().await;
            }
        }
        self.analytics.flush_now().await;
    }

    // ─── Operations ──────────────────────────────────────────────────────

    pub async fn list_tools(&self, id: &str) -> Result<Vec<ToolDescriptor>, McpError> {
        self.connection(id).await?.list_tools().await
    }

    pub async fn list_resources(&self, id: &str) -> Result<Vec<ResourceDescriptor>, McpError> {
        self.connection(id).await?.list_resources().await
    }

    pub async fn list_prompts(&self, id: &str) -> Result<Vec<PromptDescriptor>, McpError> {
        self.connection(id).await?.list_prompts().await
    }

    /// Invoke a tool, timing it and feeding the outcome to analytics.
    ///
    /// A result carrying `isError: true` is a completed call whose tool
    /// reported failure; it still comes back as `Ok`.
    pub async fn call_tool(
        &self,
        id: &str,
        tool_name: &str,
        arguments: Value,
    ) -> Result<ToolCallResult, McpError> {
        let connection = self.connection(id).await?;

        let started = Instant::now();
        let outcome = connection.call_tool(tool_name, arguments).await;
        let execution_time_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(content) => {
                let is_error = content
                    .get("isError")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                self.analytics
                    .record_usage(id, tool_name, !is_error, execution_time_ms);
                Ok(ToolCallResult {
                    tool_name: tool_name.to_string(),
                    content,
                    is_error,
                    execution_time_ms,
                })
            }
            Err(e) => {
                self.analytics
                    .record_usage(id, tool_name, false, execution_time_ms);
                Err(e)
            }
        }
    }

    pub async fn read_resource(&self, id: &str, uri: &str) -> Result<Value, McpError> {
        self.connection(id).await?.read_resource(uri).await
    }

    pub async fn get_prompt(
        &self,
        id: &str,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<Value, McpError> {
        self.connection(id).await?.get_prompt(name, arguments).await
    }

    /// Connect, list tools, and tear down, without registering anything.
    ///
    /// The session runs under a throwaway id and its events go nowhere, so
    /// probing never disturbs a registered server with the same id.
    pub async fn probe(
        &self,
        descriptor: &ServerDescriptor,
    ) -> Result<Vec<ToolDescriptor>, McpError> {
        let mut probe_descriptor = descriptor.clone();
        probe_descriptor.id = format!("probe-{}", uuid::Uuid::new_v4());

        let (probe_events, _) = mpsc::unbounded_channel();
        let connection = Connection::open(probe_descriptor, probe_events).await?;
        let tools = connection.list_tools().await;
        connection.close().await;
        tools
    }

    /// Snapshot of every registered server, ordered by id.
    pub async fn get_status(&self) -> Vec<ServerStatus> {
        let connections = self.connections.lock().await;
        let mut statuses: Vec<ServerStatus> = connections
            .values()
            .map(|connection| {
                let descriptor = connection.descriptor();
                ServerStatus {
                    id: descriptor.id.clone(),
                    name: descriptor.name.clone(),
                    state: connection.state(),
                    server_info: connection.server_info().cloned(),
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    /// Shared analytics handle, for scoring and status surfaces.
    pub fn analytics(&self) -> &Arc<UsageAnalytics> {
        &self.analytics
    }

    async fn connection(&self, id: &str) -> Result<Arc<Connection>, McpError> {
        let connections = self.connections.lock().await;
        connections
            .get(id)
            .cloned()
            .ok_or_else(|| McpError::NotConnected {
                server: id.to_string(),
            })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
