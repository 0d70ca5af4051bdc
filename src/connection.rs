//! One live server session.
//!
//! `Connection::open` establishes the transport, runs the `initialize`
//! handshake, and spawns the pump that routes inbound traffic: responses to
//! their registered waiters, notifications to the host event channel. All
//! operations require the connected state. A closed connection never comes
//! back; callers build a fresh one instead.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::correlator::{response_outcome, RequestCorrelator};
use crate::errors::McpError;
use crate::transport::{Transport, TransportEvent};
use crate::types::{
    error_codes, InboundMessage, JsonRpcNotification, JsonRpcRequest, McpEvent, McpEventKind,
    OutboundMessage, PromptDescriptor, ResourceDescriptor, ServerDescriptor, ServerInfo,
    ToolDescriptor, PROTOCOL_VERSION,
};

// ─── Connection State ────────────────────────────────────────────────────────

/// Session lifecycle. `Closed` is terminal; no transition leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Closed,
}

// ─── Shared Session State ────────────────────────────────────────────────────

/// The slice of session state the pump task and the connection both touch.
#[derive(Debug)]
struct Shared {
    server_id: String,
    correlator: RequestCorrelator,
    state: Mutex<ConnectionState>,
    events: mpsc::UnboundedSender<McpEvent>,
}

fn lock_state(state: &Mutex<ConnectionState>) -> MutexGuard<'_, ConnectionState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *lock_state(&self.state)
    }

    fn emit(&self, kind: McpEventKind) {
        // The host may have dropped its receiver; events are advisory.
        let _ = self.events.send(McpEvent::new(&self.server_id, kind));
    }

    /// Handshake completion. Refused once the session has closed.
    fn set_connected(&self) -> bool {
        let mut state = lock_state(&self.state);
        if *state == ConnectionState::Connecting {
            *state = ConnectionState::Connected;
            true
        } else {
            false
        }
    }

    fn mark_closed(&self) -> ConnectionState {
        let mut state = lock_state(&self.state);
        let previous = *state;
        *state = ConnectionState::Closed;
        previous
    }

    /// Close the session and fail its pending requests.
    ///
    /// Only the first transition does any of that, however many paths race
    /// here. The disconnect event fires only for sessions that actually
    /// reached the connected state; a handshake casualty stays silent and
    /// its failure is reported by the caller instead.
    fn transition_closed(&self, reason: Option<String>) -> bool {
        let previous = self.mark_closed();
        if previous == ConnectionState::Closed {
            return false;
        }
        let reject_reason = reason.as_deref().unwrap_or("connection closed");
        self.correlator.reject_all(&self.server_id, reject_reason);
        if previous == ConnectionState::Connected {
            self.emit(McpEventKind::Disconnected { reason });
        }
        true
    }
}

// ─── Inbound Routing ─────────────────────────────────────────────────────────

/// Drive one transport's inbound channel until it runs dry.
async fn pump(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            TransportEvent::Message(msg) => route_message(&shared, msg),
            TransportEvent::Closed { reason } => {
                shared.transition_closed(Some(reason));
                return;
            }
        }
    }
    // Sender dropped without a close event; treat it the same way.
    shared.transition_closed(None);
}

fn route_message(shared: &Shared, msg: InboundMessage) {
    if msg.is_response() {
        if let Some(id) = msg.id {
            shared
                .correlator
                .resolve(id, response_outcome(msg.result, msg.error));
        }
    } else if msg.is_notification() {
        let Some(method) = msg.method.as_deref() else {
            return;
        };
        match method {
            "notifications/tools/list_changed" => shared.emit(McpEventKind::ToolsChanged),
            "notifications/resources/list_changed" => shared.emit(McpEventKind::ResourcesChanged),
            "notifications/prompts/list_changed" => shared.emit(McpEventKind::PromptsChanged),
            "notifications/message" => shared.emit(McpEventKind::Log {
                data: msg.params.unwrap_or(Value::Null),
            }),
            other => {
                tracing::debug!(
                    server = %shared.server_id,
                    method = other,
                    "ignoring unhandled notification"
                );
            }
        }
    } else {
        // Both id and method: a server-initiated request, which this
        // client does not service.
        tracing::debug!(
            server = %shared.server_id,
            method = msg.method.as_deref().unwrap_or(""),
            "ignoring server-initiated request"
        );
    }
}

// ─── Connection ──────────────────────────────────────────────────────────────

/// A single established session with one server.
#[derive(Debug)]
pub struct Connection {
    descriptor: ServerDescriptor,
    transport: Transport,
    shared: Arc<Shared>,
    capabilities: Value,
    server_info: Option<ServerInfo>,
}

impl Connection {
    /// Connect the transport, run the `initialize` handshake, and start
    /// routing inbound traffic.
    ///
    /// Lifecycle events for the session (disconnects, change notifications,
    /// server log messages) flow to `events` for as long as it lives.
    pub async fn open(
        descriptor: ServerDescriptor,
        events: mpsc::UnboundedSender<McpEvent>,
    ) -> Result<Self, McpError> {
        let (transport, transport_rx) = Transport::connect(&descriptor).await?;

        let shared = Arc::new(Shared {
            server_id: descriptor.id.clone(),
            correlator: RequestCorrelator::new(),
            state: Mutex::new(ConnectionState::Connecting),
            events,
        });
        tokio::spawn(pump(Arc::clone(&shared), transport_rx));

        let mut connection = Self {
            descriptor,
            transport,
            shared,
            capabilities: Value::Object(Default::default()),
            server_info: None,
        };

        match connection.handshake().await {
            Ok((capabilities, server_info)) => {
                if !connection.shared.set_connected() {
                    // The transport died between the handshake response and
                    // here; the session never becomes usable.
                    connection.transport.close().await;
                    return Err(McpError::HandshakeFailed {
                        server: connection.shared.server_id.clone(),
                        reason: "connection closed during handshake".into(),
                    });
                }
                connection.capabilities = capabilities;
                connection.server_info = server_info;
                tracing::info!(
                    server = %connection.shared.server_id,
                    "server connection established"
                );
                Ok(connection)
            }
            Err(e) => {
                connection.transport.close().await;
                connection.shared.transition_closed(None);
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> Result<(Value, Option<ServerInfo>), McpError> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
        });

        let result = self
            .request_unchecked("initialize", Some(params))
            .await
            .map_err(|e| McpError::HandshakeFailed {
                server: self.shared.server_id.clone(),
                reason: e.to_string(),
            })?;

        let capabilities = result
            .get("capabilities")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));
        let server_info = result
            .get("serverInfo")
            .and_then(|v| serde_json::from_value(v.clone()).ok());

        // The initialized notification completes the handshake.
        self.notify("notifications/initialized", None)
            .await
            .map_err(|e| McpError::HandshakeFailed {
                server: self.shared.server_id.clone(),
                reason: format!("failed to send initialized notification: {e}"),
            })?;

        Ok((capabilities, server_info))
    }

    // ─── Operations ──────────────────────────────────────────────────────

    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        let result = self.request("tools/list", None).await?;
        parse_list(result, "tools")
    }

    pub async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>, McpError> {
        let result = self.request("resources/list", None).await?;
        parse_list(result, "resources")
    }

    pub async fn list_prompts(&self) -> Result<Vec<PromptDescriptor>, McpError> {
        let result = self.request("prompts/list", None).await?;
        parse_list(result, "prompts")
    }

    /// Invoke a tool; the result is the server's content payload, verbatim.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments,
        });
        self.request("tools/call", Some(params)).await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<Value, McpError> {
        self.request("resources/read", Some(serde_json::json!({ "uri": uri })))
            .await
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<Value, McpError> {
        let mut params = serde_json::json!({ "name": name });
        if let Some(args) = arguments {
            params["arguments"] = args;
        }
        self.request("prompts/get", Some(params)).await
    }

    /// Tear the session down. Idempotent.
    pub async fn close(&self) {
        self.shared.transition_closed(None);
        self.transport.close().await;
    }

    // ─── Accessors ───────────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// The server's advertised capabilities from the initialize result.
    pub fn capabilities(&self) -> &Value {
        &self.capabilities
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.descriptor
    }

    // ─── Request Plumbing ────────────────────────────────────────────────

    fn ensure_connected(&self) -> Result<(), McpError> {
        if self.shared.state() != ConnectionState::Connected {
            return Err(McpError::NotConnected {
                server: self.shared.server_id.clone(),
            });
        }
        Ok(())
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        self.ensure_connected()?;
        self.request_unchecked(method, params).await
    }

    /// Register, send, and await one request. State is not checked here so
    /// the handshake can run while still connecting.
    async fn request_unchecked(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, McpError> {
        let (id, rx) = self.shared.correlator.register();
        let request = JsonRpcRequest::new(id, method, params);

        if let Err(e) = self
            .transport
            .send(&OutboundMessage::Request(request))
            .await
        {
            self.shared.correlator.forget(id);
            return Err(e);
        }

        self.shared
            .correlator
            .wait(
                &self.shared.server_id,
                method,
                id,
                rx,
                self.descriptor.timeout_millis,
            )
            .await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let notification = JsonRpcNotification::new(method, params);
        self.transport
            .send(&OutboundMessage::Notification(notification))
            .await
    }
}

/// Pull a named array member out of a list result; an absent member reads
/// as an empty list.
fn parse_list<T: DeserializeOwned>(result: Value, member: &str) -> Result<Vec<T>, McpError> {
    let Some(items) = result.get(member) else {
        return Ok(Vec::new());
    };
    serde_json::from_value(items.clone()).map_err(|e| McpError::ServerError {
        code: error_codes::INTERNAL_ERROR,
        message: format!("malformed {member} list: {e}"),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_shared() -> (Arc<Shared>, mpsc::UnboundedReceiver<McpEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            server_id: "files".into(),
            correlator: RequestCorrelator::new(),
            state: Mutex::new(ConnectionState::Connected),
            events: tx,
        });
        (shared, rx)
    }

    fn inbound(json: &str) -> InboundMessage {
        serde_json::from_str(json).unwrap()
    }

    #[tokio::test]
    async fn test_route_response_to_waiter() {
        let (shared, _events) = test_shared();
        let (id, rx) = shared.correlator.register();

        route_message(
            &shared,
            inbound(&format!(
                r#"{{"jsonrpc":"2.0","id":{id},"result":{{"tools":[]}}}}"#
            )),
        );

        let value = rx.await.unwrap().unwrap();
        assert_eq!(value["tools"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_route_error_response() {
        let (shared, _events) = test_shared();
        let (id, rx) = shared.correlator.register();

        route_message(
            &shared,
            inbound(&format!(
                r#"{{"jsonrpc":"2.0","id":{id},"error":{{"code":-32601,"message":"Method not found"}}}}"#
            )),
        );

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, McpError::ServerError { code: -32601, .. }));
    }

    #[tokio::test]
    async fn test_route_change_notifications_to_events() {
        let (shared, mut events) = test_shared();

        for (method, expected) in [
            ("notifications/tools/list_changed", "tools-changed"),
            ("notifications/resources/list_changed", "resources-changed"),
            ("notifications/prompts/list_changed", "prompts-changed"),
        ] {
            route_message(
                &shared,
                inbound(&format!(r#"{{"jsonrpc":"2.0","method":"{method}"}}"#)),
            );
            let event = events.recv().await.unwrap();
            assert_eq!(event.server_id, "files");
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["type"], expected);
        }
    }

    #[tokio::test]
    async fn test_route_log_notification_carries_params() {
        let (shared, mut events) = test_shared();

        route_message(
            &shared,
            inbound(
                r#"{"jsonrpc":"2.0","method":"notifications/message","params":{"level":"info","data":"indexing"}}"#,
            ),
        );

        let event = events.recv().await.unwrap();
        match event.kind {
            McpEventKind::Log { data } => assert_eq!(data["level"], "info"),
            other => panic!("expected log event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_notification_and_server_request_dropped() {
        let (shared, mut events) = test_shared();

        route_message(
            &shared,
            inbound(r#"{"jsonrpc":"2.0","method":"notifications/unknown/thing"}"#),
        );
        // Server-initiated request: both id and method.
        route_message(
            &shared,
            inbound(r#"{"jsonrpc":"2.0","id":9,"method":"sampling/createMessage"}"#),
        );

        assert!(events.try_recv().is_err());
        assert_eq!(shared.correlator.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_transport_close_rejects_and_announces_once() {
        let (shared, mut events) = test_shared();
        let (_, pending_rx) = shared.correlator.register();

        let (tx, rx) = mpsc::unbounded_channel();
        let pump_task = tokio::spawn(pump(Arc::clone(&shared), rx));

        tx.send(TransportEvent::Closed {
            reason: "server exited with exit status: 1".into(),
        })
        .unwrap();
        pump_task.await.unwrap();

        assert_eq!(shared.state(), ConnectionState::Closed);

        let err = pending_rx.await.unwrap().unwrap_err();
        assert!(matches!(err, McpError::ConnectionClosed { .. }));

        let event = events.recv().await.unwrap();
        match event.kind {
            McpEventKind::Disconnected { reason } => {
                assert!(reason.unwrap().contains("exit status: 1"));
            }
            other => panic!("expected disconnected event, got {other:?}"),
        }

        // Later transition attempts are no-ops.
        assert!(!shared.transition_closed(Some("again".into())));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_no_transition_leaves_closed() {
        let (shared, _events) = test_shared();
        shared.transition_closed(None);
        assert!(!shared.set_connected());
        assert_eq!(shared.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_close_before_connected_emits_no_event() {
        let (tx, mut events) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            server_id: "files".into(),
            correlator: RequestCorrelator::new(),
            state: Mutex::new(ConnectionState::Connecting),
            events: tx,
        });
        let (_, pending_rx) = shared.correlator.register();

        assert!(shared.transition_closed(Some("server exited".into())));
        assert_eq!(shared.state(), ConnectionState::Closed);

        // The pending handshake request still fails, but no disconnect
        // reaches the host for a session that never connected.
        assert!(pending_rx.await.unwrap().is_err());
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_parse_list_missing_member_is_empty() {
        let tools: Vec<ToolDescriptor> =
            parse_list(serde_json::json!({"nextCursor": null}), "tools").unwrap();
        assert!(tools.is_empty());
    }

    #[test]
    fn test_parse_list_malformed_member() {
        let result: Result<Vec<ToolDescriptor>, _> =
            parse_list(serde_json::json!({"tools": [{"description": 3}]}), "tools");
        assert!(result.is_err());
    }

    #[cfg(unix)]
    mod with_mock_server {
        use super::*;
        use crate::types::TransportKind;
        use std::collections::HashMap;

        /// A shell server that answers initialize and one tools/list call.
        const MOCK_SCRIPT: &str = r#"
read line
id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"mock","version":"1.0"}}}\n' "$id"
read notif
read line
id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"read_file","description":"Read a file","inputSchema":{"type":"object"}}]}}\n' "$id"
read eof
"#;

        fn mock_descriptor(id: &str, script: &str) -> ServerDescriptor {
            ServerDescriptor {
                id: id.to_string(),
                name: id.to_string(),
                transport: TransportKind::Stream {
                    command: "sh".into(),
                    args: vec!["-c".into(), script.into()],
                    env: HashMap::new(),
                    cwd: None,
                },
                timeout_millis: 5_000,
            }
        }

        #[tokio::test]
        async fn test_open_handshake_and_list_tools() {
            let (events_tx, _events) = mpsc::unbounded_channel();
            let connection = Connection::open(mock_descriptor("mock", MOCK_SCRIPT), events_tx)
                .await
                .unwrap();

            assert_eq!(connection.state(), ConnectionState::Connected);
            assert_eq!(
                connection.capabilities(),
                &serde_json::json!({"tools": {}})
            );
            assert_eq!(
                connection.server_info().and_then(|i| i.name.as_deref()),
                Some("mock")
            );

            let tools = connection.list_tools().await.unwrap();
            assert_eq!(tools.len(), 1);
            assert_eq!(tools[0].name, "read_file");

            connection.close().await;
            assert_eq!(connection.state(), ConnectionState::Closed);

            let err = connection.list_tools().await.unwrap_err();
            assert!(matches!(err, McpError::NotConnected { .. }));
        }

        #[tokio::test]
        async fn test_open_fails_when_server_exits_immediately() {
            let mut descriptor = mock_descriptor("dud", "exit 1");
            descriptor.timeout_millis = 1_000;

            let (events_tx, _events) = mpsc::unbounded_channel();
            let err = Connection::open(descriptor, events_tx).await.unwrap_err();
            assert!(matches!(err, McpError::HandshakeFailed { .. }));
        }
    }
}
