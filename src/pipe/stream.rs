//! Stream line normalization.
//!
//! Turns the raw byte stream of a streaming chat completion into a lazy
//! sequence of text lines shaped according to [`StreamFormat`].

use std::fmt;
use std::pin::Pin;
use std::str::FromStr;

use bytes::Bytes;
use futures_core::Stream;
use serde::{Deserialize, Serialize};

use crate::error::PipeError;

/// Lazy, forward-only sequence of normalized lines.
///
/// Dropping it drops the underlying response and closes the connection.
pub type LineStream = Pin<Box<dyn Stream<Item = Result<String, PipeError>> + Send>>;

/// Terminal sentinel sent by OpenAI-compatible servers.
pub const DONE_SENTINEL: &str = "[DONE]";

/// How streamed lines are returned to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StreamFormat {
    /// Strip `data:` and compact JSON payloads; pass anything else through.
    #[default]
    Auto,
    /// Strip `data:` and yield the payload only.
    Jsonl,
    /// Pass lines through as received.
    Sse,
}

impl StreamFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamFormat::Auto => "auto",
            StreamFormat::Jsonl => "jsonl",
            StreamFormat::Sse => "sse",
        }
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(StreamFormat::Auto),
            "jsonl" => Ok(StreamFormat::Jsonl),
            "sse" => Ok(StreamFormat::Sse),
            other => Err(format!(
                "unknown stream format '{other}' (expected auto, jsonl or sse)"
            )),
        }
    }
}

impl TryFrom<String> for StreamFormat {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StreamFormat> for String {
    fn from(value: StreamFormat) -> Self {
        value.as_str().to_string()
    }
}

/// Shape one non-blank line according to `format`.
///
/// Returns `None` when the line must be suppressed: empty lines and the
/// `[DONE]` sentinel (bare, or as the payload of a `data:` line outside
/// `sse` mode).
pub fn normalize_line(format: StreamFormat, line: &str) -> Option<String> {
    if line.is_empty() || line.trim() == DONE_SENTINEL {
        return None;
    }

    if format == StreamFormat::Sse {
        return Some(line.to_string());
    }

    let payload = match line.strip_prefix("data:") {
        Some(rest) => rest.trim_start(),
        None => line,
    };
    if payload.is_empty() || payload == DONE_SENTINEL {
        return None;
    }

    match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(value) => Some(value.to_string()),
        Err(_) => match format {
            StreamFormat::Jsonl => Some(payload.to_string()),
            _ => Some(line.to_string()),
        },
    }
}

/// Trim a raw transport line, skip keep-alives, then normalize it.
fn process_raw_line(format: StreamFormat, raw: &str) -> Option<String> {
    let line = raw.trim();
    if line.is_empty() {
        return None;
    }
    normalize_line(format, line)
}

/// Reassembles lines from arbitrarily split byte chunks.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            lines.push(decode_line(&raw[..raw.len() - 1]));
        }
        lines
    }

    /// Flush a final line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.buf);
        Some(decode_line(&raw))
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Normalized lines of a streaming response body.
pub fn normalized_lines(response: reqwest::Response, format: StreamFormat) -> LineStream {
    normalize_byte_stream(response.bytes_stream(), format)
}

/// Normalize any byte stream. A transport error yields one
/// [`PipeError::Network`] and ends the stream.
pub fn normalize_byte_stream<S, E>(bytes: S, format: StreamFormat) -> LineStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    Box::pin(async_stream::stream! {
        use tokio_stream::StreamExt as _;

        let mut bytes = Box::pin(bytes);
        let mut splitter = LineSplitter::new();

        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(error = %e, "stream interrupted");
                    yield Err(PipeError::network(&e));
                    return;
                }
            };
            for raw in splitter.push(&chunk) {
                if let Some(line) = process_raw_line(format, &raw) {
                    yield Ok(line);
                }
            }
        }

        if let Some(raw) = splitter.finish() {
            if let Some(line) = process_raw_line(format, &raw) {
                yield Ok(line);
            }
        }
    })
}
