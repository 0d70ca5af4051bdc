//! Wire framing codecs.
//!
//! The stream transport frames one JSON document per `\n`-terminated line;
//! `LineDecoder` buffers partial reads and splits on newline boundaries.
//! The event-stream transport uses the SSE block grammar (`event:` /
//! `data:` lines, blank line terminates a block); `SseDecoder` handles it.
//! Malformed JSON is logged and dropped, never fatal.

use serde::Serialize;

use crate::types::InboundMessage;

/// Encode a message as a single newline-terminated JSON line.
pub fn encode_line<T: Serialize>(msg: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}

/// Parse one JSON-RPC document, logging and discarding malformed input.
pub fn decode_message(raw: &str) -> Option<InboundMessage> {
    match serde_json::from_str::<InboundMessage>(raw) {
        Ok(msg) => Some(msg),
        Err(e) => {
            tracing::warn!(error = %e, frame = %preview(raw), "dropping malformed frame");
            None
        }
    }
}

/// First 200 characters, for log lines about bad frames.
fn preview(s: &str) -> String {
    s.chars().take(200).collect()
}

// ─── Line framing ────────────────────────────────────────────────────────────

/// Incremental decoder for newline-delimited JSON.
///
/// Feeds may end mid-document; the trailing partial line stays buffered
/// until the next feed completes it.
#[derive(Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every complete message framed so far.
    ///
    /// Chunks may end anywhere, including inside a multi-byte character:
    /// framing is byte-level and text conversion happens per complete line.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<InboundMessage> {
        self.buf.extend_from_slice(chunk);

        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(msg) = decode_message(line) {
                out.push(msg);
            }
        }
        out
    }

    /// Any trailing partial line still waiting for its newline.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }
}

// ─── SSE framing ─────────────────────────────────────────────────────────────

/// One parsed SSE block.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    /// The `event:` field, absent for untyped blocks (treated as `message`).
    pub event_type: Option<String>,
    /// The `data:` payload; multi-line data is joined with newlines.
    pub data: String,
}

/// Incremental decoder for the SSE block grammar.
///
/// Blocks are terminated by a blank line. `:`-prefixed comment lines and
/// blocks without any `data:` line (keep-alives) are discarded.
#[derive(Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every complete block framed so far.
    ///
    /// As with [`LineDecoder`], chunks may end anywhere, including inside
    /// a multi-byte character.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.extend_from_slice(chunk);
        // Some servers terminate lines with CRLF; the strip runs after each
        // append, which also joins a pair split across feeds. A trailing
        // lone carriage return stays put until its newline arrives.
        if self.buf.contains(&b'\r') {
            strip_crlf(&mut self.buf);
        }

        let mut out = Vec::new();
        while let Some(end) = self.buf.windows(2).position(|pair| pair == b"\n\n") {
            let block: Vec<u8> = self.buf.drain(..end + 2).collect();
            let block = String::from_utf8_lossy(&block);
            if let Some(event) = parse_block(&block) {
                out.push(event);
            }
        }
        out
    }
}

/// Drop every `\r` that directly precedes a `\n`, leaving lone `\r` bytes alone.
fn strip_crlf(buf: &mut Vec<u8>) {
    let mut out = Vec::with_capacity(buf.len());
    let mut i = 0;
    while i < buf.len() {
        if buf[i] == b'\r' && buf.get(i + 1) == Some(&b'\n') {
            i += 1;
            continue;
        }
        out.push(buf[i]);
        i += 1;
    }
    *buf = out;
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event_type: Option<String> = None;
    let mut data: Option<String> = None;

    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(value) = line.strip_prefix("event:") {
            event_type = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            let value = value.trim();
            match &mut data {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(value);
                }
                None => data = Some(value.to_string()),
            }
        }
    }

    data.map(|data| SseEvent { event_type, data })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
