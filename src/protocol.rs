//! Wire Frame Codec
//!
//! Encoding and decoding for the TradingView websocket framing scheme.
//!
//! Every logical message travels as a length-prefixed frame:
//!
//! ```text
//! ~m~<byte-length>~m~<json-payload>
//! ```
//!
//! Several frames may be concatenated into a single websocket text message.
//! Heartbeat payloads start with `~h~` and are liveness tokens, not messages;
//! the decoder recognizes and discards them. Some server payloads arrive as
//! base64-encoded zlib streams and are handled by [`parse_compressed`].
//!
//! All functions here are stateless and pure.

use std::io::Read;

use base64::Engine as _;
use serde_json::Value;

/// Frame delimiter marker.
pub const FRAME_MARKER: &str = "~m~";

/// Prefix of heartbeat payloads.
pub const HEARTBEAT_PREFIX: &str = "~h~";

/// Codec errors.
///
/// Only [`parse_compressed`] surfaces these; per-frame decode failures in
/// [`parse_packets`] drop the offending frame and continue.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Base64 decoding failed.
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Zlib inflation failed.
    #[error("inflate error: {0}")]
    Inflate(#[from] std::io::Error),
}

// =============================================================================
// Encoding
// =============================================================================

/// Frame a raw, already-formatted payload.
///
/// Used for heartbeat echoes (`~h~<n>`) where the payload is not JSON.
#[must_use]
pub fn format_raw(payload: &str) -> String {
    format!("{FRAME_MARKER}{}{FRAME_MARKER}{payload}", payload.len())
}

/// Serialize a message value and wrap it in a `~m~` frame.
///
/// `null` field values are rendered as empty strings, never the `null`
/// literal, to match the protocol's lossy-null convention.
#[must_use]
pub fn format_packet(message: &Value) -> String {
    format_raw(&scrub_nulls(message.clone()).to_string())
}

/// Build and frame a protocol message with a method name and positional
/// argument list (`{"m": <method>, "p": [...]}`).
#[must_use]
pub fn format_message(method: &str, params: &[Value]) -> String {
    format_packet(&serde_json::json!({ "m": method, "p": params }))
}

/// Recursively replace `null` values with empty strings.
fn scrub_nulls(value: Value) -> Value {
    match value {
        Value::Null => Value::String(String::new()),
        Value::Object(map) => {
            Value::Object(map.into_iter().map(|(k, v)| (k, scrub_nulls(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(scrub_nulls).collect()),
        other => other,
    }
}

// =============================================================================
// Decoding
// =============================================================================

/// Decode a raw websocket payload into the sequence of message values it
/// carries, preserving arrival order.
///
/// Scans left to right for `~m~<N>~m~` markers and reads exactly `N` bytes of
/// payload per frame. Heartbeat payloads (`~h~...`) are never emitted, whether
/// alone or interleaved with ordinary frames. A payload that fails JSON
/// parsing is dropped and scanning continues, so one malformed frame never
/// aborts the batch.
#[must_use]
pub fn parse_packets(raw: &str) -> Vec<Value> {
    let mut out = Vec::new();
    let mut pos = 0;

    while let Some(found) = raw[pos..].find(FRAME_MARKER) {
        let digits_start = pos + found + FRAME_MARKER.len();
        let digits_len = raw[digits_start..]
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(raw.len() - digits_start);
        if digits_len == 0 {
            // Marker without a length prefix; resume scanning after it.
            pos = digits_start;
            continue;
        }
        let digits_end = digits_start + digits_len;
        let Ok(len) = raw[digits_start..digits_end].parse::<usize>() else {
            pos = digits_end;
            continue;
        };
        if !raw[digits_end..].starts_with(FRAME_MARKER) {
            pos = digits_end;
            continue;
        }

        let payload_start = digits_end + FRAME_MARKER.len();
        // A declared length too large to address is handled like truncation.
        let Some(payload) = payload_start
            .checked_add(len)
            .and_then(|payload_end| raw.get(payload_start..payload_end))
        else {
            tracing::debug!(declared_len = len, "truncated frame, dropping remainder");
            break;
        };
        pos = payload_start + len;

        if payload.starts_with(HEARTBEAT_PREFIX) {
            continue;
        }
        match serde_json::from_str::<Value>(payload) {
            Ok(value) => out.push(value),
            Err(error) => {
                tracing::debug!(%error, payload, "dropping malformed frame payload");
            }
        }
    }

    out
}

/// Decode a compressed server payload: base64, then zlib, then JSON.
///
/// # Errors
///
/// Returns an error if any of the three decoding stages fails.
pub fn parse_compressed(data: &str) -> Result<Value, PacketError> {
    let compressed = base64::engine::general_purpose::STANDARD.decode(data.trim())?;
    let mut inflated = Vec::new();
    flate2::read::ZlibDecoder::new(compressed.as_slice()).read_to_end(&mut inflated)?;
    Ok(serde_json::from_slice(&inflated)?)
}

// =============================================================================
// Classification
// =============================================================================

/// A decoded inbound value, classified for dispatch.
#[derive(Debug, Clone)]
pub enum ServerPacket {
    /// Bare numeric ping probe; must be echoed back as `~h~<n>`.
    Ping(i64),
    /// Protocol message with a method name and positional argument list.
    Message {
        /// Method name (`m` field).
        method: String,
        /// Positional arguments (`p` field); the session id sits at index 0
        /// for routable messages.
        params: Vec<Value>,
    },
    /// Anything else (session holder notices and the like).
    Other(Value),
}

/// Classify a decoded value for dispatch.
#[must_use]
pub fn classify(value: Value) -> ServerPacket {
    if let Some(n) = value.as_i64() {
        return ServerPacket::Ping(n);
    }
    if let Some(obj) = value.as_object()
        && let Some(method) = obj.get("m").and_then(Value::as_str)
    {
        let params = obj
            .get("p")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        return ServerPacket::Message {
            method: method.to_string(),
            params,
        };
    }
    ServerPacket::Other(value)
}
