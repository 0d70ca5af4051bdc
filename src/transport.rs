//! The two wire transports.
//!
//! `Stream` runs the server as a child process and exchanges newline-delimited
//! JSON over its stdio; stderr is drained for diagnostics and never parsed as
//! protocol. `EventStream` opens a long-lived SSE stream and POSTs outbound
//! messages to the session URL announced by the server's `endpoint` event.
//! Both feed inbound traffic through a single channel of `TransportEvent`s so
//! the connection layer reads one shape regardless of the wire.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

use crate::codec::{decode_message, encode_line, LineDecoder, SseDecoder};
use crate::errors::McpError;
use crate::types::{InboundMessage, OutboundMessage, ServerDescriptor, TransportKind};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Timeout for graceful child exit after stdin closes, before force-killing.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the stdout reader waits for an exit status once stdout closes.
const REAP_TIMEOUT: Duration = Duration::from_millis(200);

// ─── Transport Events ────────────────────────────────────────────────────────

/// Inbound traffic surfaced by a transport's reader task.
#[derive(Debug)]
pub enum TransportEvent {
    /// A decoded JSON-RPC message (response or notification).
    Message(InboundMessage),
    /// The wire is gone; no further events will arrive.
    Closed { reason: String },
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// A connected wire to one server, either flavor.
#[derive(Debug)]
pub enum Transport {
    Stream(StreamTransport),
    Event(EventStreamTransport),
}

impl Transport {
    /// Establish the wire described by `descriptor` and hand back the
    /// channel its reader task feeds.
    pub async fn connect(
        descriptor: &ServerDescriptor,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), McpError> {
        match &descriptor.transport {
            TransportKind::Stream {
                command,
                args,
                env,
                cwd,
            } => {
                let (transport, events) =
                    StreamTransport::spawn(&descriptor.id, command, args, env, cwd.as_deref())
                        .await?;
                Ok((Self::Stream(transport), events))
            }
            TransportKind::EventStream { url, headers } => {
                let (transport, events) = EventStreamTransport::connect(
                    &descriptor.id,
                    url,
                    headers,
                    descriptor.timeout_millis,
                )
                .await?;
                Ok((Self::Event(transport), events))
            }
        }
    }

    /// Write one outbound message to the wire.
    pub async fn send(&self, msg: &OutboundMessage) -> Result<(), McpError> {
        match self {
            Self::Stream(t) => t.send(msg).await,
            Self::Event(t) => t.send(msg).await,
        }
    }

    /// Tear the wire down. Safe to call more than once.
    pub async fn close(&self) {
        match self {
            Self::Stream(t) => t.close().await,
            Self::Event(t) => t.close().await,
        }
    }
}

// ─── Stream Transport ────────────────────────────────────────────────────────

/// A spawned server child process speaking newline-delimited JSON on stdio.
#[derive(Debug)]
pub struct StreamTransport {
    server: String,
    writer: Mutex<Option<ChildStdin>>,
    child: Arc<Mutex<Child>>,
}

impl StreamTransport {
    /// Spawn the server process and start its stdout/stderr reader tasks.
    async fn spawn(
        server: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&std::path::Path>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), McpError> {
        let mut cmd = Command::new(command);
        cmd.args(args);

        for (key, value) in env {
            cmd.env(key, value);
        }
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        // Wire stdio for JSON-RPC; stderr is captured so it never hits ours.
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            server: server.to_string(),
            reason: format!("{e}"),
        })?;

        let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
            server: server.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
            server: server.to_string(),
            reason: "failed to capture stdout".into(),
        })?;
        let stderr = child.stderr.take().ok_or(McpError::SpawnFailed {
            server: server.to_string(),
            reason: "failed to capture stderr".into(),
        })?;

        tracing::info!(server = %server, command = %command, "spawned server process");

        let child = Arc::new(Mutex::new(child));
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(read_stdout(
            server.to_string(),
            stdout,
            Arc::clone(&child),
            tx,
        ));
        tokio::spawn(read_stderr(server.to_string(), stderr));

        Ok((
            Self {
                server: server.to_string(),
                writer: Mutex::new(Some(stdin)),
                child,
            },
            rx,
        ))
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<(), McpError> {
        let line = encode_line(msg).map_err(|e| McpError::TransportError {
            server: self.server.clone(),
            reason: format!("failed to serialize message: {e}"),
        })?;

        let mut writer = self.writer.lock().await;
        let Some(stdin) = writer.as_mut() else {
            return Err(McpError::TransportError {
                server: self.server.clone(),
                reason: "stdin already closed".into(),
            });
        };

        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| McpError::TransportError {
                server: self.server.clone(),
                reason: format!("failed to write to stdin: {e}"),
            })?;
        stdin.flush().await.map_err(|e| McpError::TransportError {
            server: self.server.clone(),
            reason: format!("failed to flush stdin: {e}"),
        })?;
        Ok(())
    }

    async fn close(&self) {
        // Closing stdin signals the server to exit on its own.
        self.writer.lock().await.take();

        let mut child = self.child.lock().await;
        match timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.server, %status, "server process exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(server = %self.server, error = %e, "error waiting for server exit");
            }
            Err(_) => {
                tracing::warn!(server = %self.server, "server did not exit in time, killing");
                let _ = child.kill().await;
            }
        }
    }
}

/// Reader task: frame stdout into messages until the pipe closes.
async fn read_stdout(
    server: String,
    mut stdout: tokio::process::ChildStdout,
    child: Arc<Mutex<Child>>,
    tx: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut decoder = LineDecoder::new();
    let mut buf = [0u8; 8192];

    let reason = loop {
        match stdout.read(&mut buf).await {
            Ok(0) => {
                if !decoder.pending().is_empty() {
                    tracing::debug!(server = %server, "discarding partial line at stream end");
                }
                // Pick up the exit status if the process has already died.
                let mut child = child.lock().await;
                break match timeout(REAP_TIMEOUT, child.wait()).await {
                    Ok(Ok(status)) => format!("server exited with {status}"),
                    _ => "server stdout closed".to_string(),
                };
            }
            Ok(n) => {
                for msg in decoder.feed(&buf[..n]) {
                    if tx.send(TransportEvent::Message(msg)).is_err() {
                        return;
                    }
                }
            }
            Err(e) => break format!("failed to read from stdout: {e}"),
        }
    };

    let _ = tx.send(TransportEvent::Closed { reason });
}

/// Reader task: drain stderr as diagnostics, one log line per line written.
async fn read_stderr(server: String, stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            tracing::debug!(server = %server, line = %line, "server stderr");
        }
    }
}

// ─── Event Stream Transport ──────────────────────────────────────────────────

/// A long-lived SSE stream plus HTTP POSTs to the session URL it announces.
#[derive(Debug)]
pub struct EventStreamTransport {
    server: String,
    http: reqwest::Client,
    /// Session URL from the `endpoint` event; `None` until it arrives.
    post_url: Arc<Mutex<Option<String>>>,
    request_timeout: Duration,
    reader_task: JoinHandle<()>,
}

impl EventStreamTransport {
    /// Open the SSE stream and wait for the server to announce its session
    /// URL, bounded by the descriptor timeout.
    async fn connect(
        server: &str,
        url: &str,
        headers: &HashMap<String, String>,
        timeout_millis: u64,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), McpError> {
        let sse_url = with_sse_suffix(url);

        let mut default_headers = HeaderMap::new();
        for (key, value) in headers {
            let name =
                HeaderName::from_bytes(key.as_bytes()).map_err(|e| McpError::ConnectFailed {
                    server: server.to_string(),
                    reason: format!("invalid header name '{key}': {e}"),
                })?;
            let value = HeaderValue::from_str(value).map_err(|e| McpError::ConnectFailed {
                server: server.to_string(),
                reason: format!("invalid value for header '{key}': {e}"),
            })?;
            default_headers.insert(name, value);
        }

        // No whole-request timeout on the client: the SSE GET is expected to
        // stay open for the life of the session. POSTs get a per-request one.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(timeout_millis))
            .default_headers(default_headers)
            .build()
            .map_err(|e| McpError::ConnectFailed {
                server: server.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        tracing::info!(server = %server, url = %sse_url, "opening event stream");

        // Bound the header exchange only; the body is expected to stream
        // for the life of the session.
        let request = http
            .get(&sse_url)
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache")
            .send();
        let response = match timeout(Duration::from_millis(timeout_millis), request).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                let reason = if e.is_timeout() {
                    format!("connect timed out: {e}")
                } else if e.is_connect() {
                    format!("cannot reach server at {sse_url}: {e}")
                } else {
                    format!("{e}")
                };
                return Err(McpError::ConnectFailed {
                    server: server.to_string(),
                    reason,
                });
            }
            Err(_) => {
                return Err(McpError::ConnectFailed {
                    server: server.to_string(),
                    reason: format!(
                        "timed out after {timeout_millis}ms waiting for the event stream to open"
                    ),
                });
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Err(McpError::ConnectFailed {
                server: server.to_string(),
                reason: format!("event stream endpoint returned HTTP {status}"),
            });
        }

        let post_url = Arc::new(Mutex::new(None));
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let (tx, rx) = mpsc::unbounded_channel();

        let reader_task = tokio::spawn(read_event_stream(
            server.to_string(),
            response,
            sse_url.clone(),
            Arc::clone(&post_url),
            endpoint_tx,
            tx,
        ));

        // The session is unusable until the endpoint event names the POST URL.
        match timeout(Duration::from_millis(timeout_millis), endpoint_rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                reader_task.abort();
                return Err(McpError::ConnectFailed {
                    server: server.to_string(),
                    reason: "event stream closed before the endpoint event".into(),
                });
            }
            Err(_) => {
                reader_task.abort();
                return Err(McpError::ConnectFailed {
                    server: server.to_string(),
                    reason: format!(
                        "timed out after {timeout_millis}ms waiting for the endpoint event"
                    ),
                });
            }
        }

        Ok((
            Self {
                server: server.to_string(),
                http,
                post_url,
                request_timeout: Duration::from_millis(timeout_millis),
                reader_task,
            },
            rx,
        ))
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<(), McpError> {
        let post_url = {
            let guard = self.post_url.lock().await;
            guard.clone()
        };
        let Some(post_url) = post_url else {
            return Err(McpError::NoSessionUrl {
                server: self.server.clone(),
            });
        };

        let response = self
            .http
            .post(&post_url)
            .timeout(self.request_timeout)
            .json(msg)
            .send()
            .await
            .map_err(|e| {
                let reason = if e.is_timeout() {
                    format!("request timed out: {e}")
                } else {
                    format!("{e}")
                };
                McpError::TransportError {
                    server: self.server.clone(),
                    reason,
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            return Err(McpError::TransportError {
                server: self.server.clone(),
                reason: format!("POST returned HTTP {status}: {}", preview_body(&body)),
            });
        }
        Ok(())
    }

    async fn close(&self) {
        self.reader_task.abort();
        tracing::debug!(server = %self.server, "event stream closed");
    }
}

/// Reader task: frame the SSE byte stream into transport events.
async fn read_event_stream(
    server: String,
    response: reqwest::Response,
    base_url: String,
    post_url: Arc<Mutex<Option<String>>>,
    endpoint_tx: oneshot::Sender<()>,
    tx: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut stream = response.bytes_stream();
    let mut decoder = SseDecoder::new();
    let mut endpoint_tx = Some(endpoint_tx);

    let reason = loop {
        match stream.next().await {
            Some(Ok(chunk)) => {
                for event in decoder.feed(&chunk) {
                    match event.event_type.as_deref() {
                        Some("endpoint") => match resolve_post_url(&base_url, &event.data) {
                            Ok(resolved) => {
                                tracing::debug!(
                                    server = %server,
                                    post_url = %resolved,
                                    "received session URL"
                                );
                                *post_url.lock().await = Some(resolved);
                                if let Some(signal) = endpoint_tx.take() {
                                    let _ = signal.send(());
                                }
                            }
                            Err(reason) => {
                                tracing::warn!(
                                    server = %server,
                                    error = %reason,
                                    "ignoring unusable endpoint URL"
                                );
                            }
                        },
                        Some("message") | None => {
                            if let Some(msg) = decode_message(&event.data) {
                                if tx.send(TransportEvent::Message(msg)).is_err() {
                                    return;
                                }
                            }
                        }
                        Some(other) => {
                            tracing::debug!(server = %server, event = other, "ignoring SSE event");
                        }
                    }
                }
            }
            Some(Err(e)) => break format!("event stream read error: {e}"),
            None => break "event stream ended".to_string(),
        }
    };

    let _ = tx.send(TransportEvent::Closed { reason });
}

// ─── URL Helpers ─────────────────────────────────────────────────────────────

/// Apply the `/sse` suffix convention when the configured URL omits it.
fn with_sse_suffix(url: &str) -> String {
    if url.ends_with("/sse") {
        url.to_string()
    } else {
        format!("{}/sse", url.trim_end_matches('/'))
    }
}

/// The endpoint event may carry an absolute URL or one relative to the
/// SSE stream's own URL.
fn resolve_post_url(base: &str, endpoint: &str) -> Result<String, String> {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return Ok(endpoint.to_string());
    }
    let base = url::Url::parse(base).map_err(|e| format!("invalid base URL '{base}': {e}"))?;
    let joined = base
        .join(endpoint)
        .map_err(|e| format!("cannot resolve '{endpoint}' against '{base}': {e}"))?;
    Ok(joined.to_string())
}

/// First 200 characters of an HTTP error body, for log-sized error reasons.
fn preview_body(body: &str) -> String {
    body.trim().chars().take(200).collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
