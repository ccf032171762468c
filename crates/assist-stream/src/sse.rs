//! Server-sent-event framing.
//!
//! [`SseDecoder`] turns an arbitrary sequence of byte chunks into complete
//! frames. A frame may be split across any number of network reads; bytes are
//! carried over until the blank line that ends the frame arrives, so the
//! decoded output does not depend on how the body was chunked.

use tracing::trace;

/// Payload that marks the end of the event stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// One raw SSE frame: the optional `event:` field and the joined `data:` lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// A decoded frame, classified for the session pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum SseItem {
    /// Frame carried a JSON payload.
    Payload {
        event: Option<String>,
        value: serde_json::Value,
    },
    /// Frame carried the `[DONE]` sentinel.
    Done,
    /// Frame payload was not valid JSON. Only this frame is lost.
    Malformed { error: String, data: String },
}

/// Incremental decoder with a carry-over buffer between calls.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and returns every frame completed by it.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<SseItem> {
        self.push_frames(chunk)
            .into_iter()
            .map(classify_frame)
            .collect()
    }

    /// Feeds one chunk and returns the raw frames completed by it.
    pub fn push_frames(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some((end, consumed)) = find_frame_end(&self.buf) {
            let frame = parse_frame(&self.buf[..end]);
            self.buf.drain(..consumed);
            if let Some(frame) = frame {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flushes a trailing frame that was not terminated by a blank line.
    ///
    /// Called when the connection closes; the decoder is empty afterwards.
    pub fn finish(&mut self) -> Vec<SseItem> {
        let rest = std::mem::take(&mut self.buf);
        if !rest.is_empty() {
            trace!(
                event = "stream.decoder_flush",
                domain = "stream",
                pending_bytes = rest.len() as u64
            );
        }
        parse_frame(&rest)
            .map(classify_frame)
            .into_iter()
            .collect()
    }

    /// Number of bytes waiting for the rest of their frame.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }
}

/// Finds the first blank line. Returns the frame length and how many bytes to
/// consume, accepting `\n` and `\r\n` line endings in any combination.
fn find_frame_end(buf: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i < buf.len() {
        if buf[i] == b'\n' {
            match (buf.get(i + 1), buf.get(i + 2)) {
                (Some(b'\n'), _) => return Some((i, i + 2)),
                (Some(b'\r'), Some(b'\n')) => return Some((i, i + 3)),
                // `\n\r` at the end of the buffer: wait for the next chunk.
                (Some(b'\r'), None) => return None,
                _ => {}
            }
        }
        i += 1;
    }
    None
}

fn parse_frame(bytes: &[u8]) -> Option<SseFrame> {
    if bytes.is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(bytes);
    let mut event = None;
    let mut data_lines: Vec<&str> = Vec::new();
    for raw_line in text.split('\n') {
        let line = raw_line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => data_lines.push(value),
            "event" => event = Some(value.to_string()),
            _ => {}
        }
    }
    if data_lines.is_empty() {
        return None;
    }
    Some(SseFrame {
        event,
        data: data_lines.join("\n"),
    })
}

/// Classifies a frame's payload as JSON, the done sentinel, or malformed.
pub fn classify_frame(frame: SseFrame) -> SseItem {
    let payload = frame.data.trim();
    if payload == DONE_SENTINEL {
        return SseItem::Done;
    }
    match serde_json::from_str(payload) {
        Ok(value) => SseItem::Payload {
            event: frame.event,
            value,
        },
        Err(err) => SseItem::Malformed {
            error: err.to_string(),
            data: frame.data,
        },
    }
}
