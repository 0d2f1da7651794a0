//! Wire codec: UTF-8 JSON packets inside length-prefixed frames.
//!
//! The JSON schema is fixed:
//! `{"id","originatorId","payload","trace","ttl","timestamp","priority","packetType"}`
//! with `priority` as an integer and `trace` order preserved. Decode enforces
//! the schema strictly: a field of the wrong type is an attack or a version
//! mismatch, not something to paper over. The one exception is timestamp
//! skew, which is accepted and flagged.

use crate::error::DecodeError;
use crate::types::{MeshPacket, PacketType, Priority, MAX_TTL};
use serde_json::{json, Value};

// =============================================================================
// FRAME FORMAT
// =============================================================================

/// Byte the receiver answers after a successful decode.
pub const ACK: u8 = 0x06;

/// Byte the receiver answers when the frame fails to decode.
pub const NAK: u8 = 0x15;

/// Default transport port where the link medium has ports at all.
pub const DEFAULT_TRANSPORT_PORT: u16 = 8888;

/// Frame payload ceiling (1 MiB). A packet is a few KB; a length prefix far
/// above that is a hostile allocation request, not traffic.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Wrap payload bytes in the wire frame: `[u32 BE length][payload]`.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Validate a frame header and return the declared payload length.
pub fn frame_len(header: [u8; 4]) -> Result<usize, DecodeError> {
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(DecodeError::FrameTooLarge(len));
    }
    Ok(len)
}

/// Split one complete frame off the front of `buf`, if present.
/// Returns the payload and the number of bytes consumed.
pub fn read_frame(buf: &[u8]) -> Result<Option<(Vec<u8>, usize)>, DecodeError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = frame_len([buf[0], buf[1], buf[2], buf[3]])?;
    if buf.len() < 4 + len {
        return Ok(None);
    }
    Ok(Some((buf[4..4 + len].to_vec(), 4 + len)))
}

// =============================================================================
// JSON CODEC
// =============================================================================

/// Decode result: the packet plus the skew flag. A skewed timestamp means
/// the originating handset's clock is off; the packet is still processed.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub packet: MeshPacket,
    pub timestamp_skewed: bool,
}

/// Encode a packet to its wire JSON bytes.
pub fn encode(packet: &MeshPacket) -> Vec<u8> {
    let value = json!({
        "id": packet.id(),
        "originatorId": packet.originator_id(),
        "payload": packet.payload(),
        "trace": packet.trace(),
        "ttl": packet.ttl(),
        "timestamp": packet.timestamp_ms(),
        "priority": packet.priority().wire_code(),
        "packetType": packet.packet_type().as_str(),
    });
    value.to_string().into_bytes()
}

/// Decode wire bytes into a packet, enforcing the schema.
pub fn decode(bytes: &[u8], now_ms: i64) -> Result<Decoded, DecodeError> {
    let text =
        std::str::from_utf8(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let value: Value =
        serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let object = value
        .as_object()
        .ok_or_else(|| DecodeError::Malformed("top level is not an object".into()))?;

    let id = required_str(object, "id")?;
    let originator_id = required_str(object, "originatorId")?;
    let payload = required_str(object, "payload")?;
    let trace = required_trace(object)?;
    let ttl = required_int(object, "ttl")?;
    let timestamp_ms = required_int(object, "timestamp")?;
    let priority_code = required_int(object, "priority")?;
    let type_str = required_str(object, "packetType")?;

    if ttl < 0 || ttl > i64::from(MAX_TTL) {
        return Err(DecodeError::TtlOutOfRange(ttl));
    }
    let priority = Priority::from_wire_code(priority_code).ok_or(DecodeError::TypeMismatch {
        field: "priority",
        expected: "integer 0..=3",
    })?;
    let packet_type = PacketType::parse(&type_str).ok_or(DecodeError::TypeMismatch {
        field: "packetType",
        expected: "sos|ack|status|data",
    })?;

    let packet = MeshPacket::from_parts(
        id,
        originator_id,
        packet_type,
        priority,
        payload,
        trace,
        ttl as u32,
        timestamp_ms,
    )?;
    let timestamp_skewed = packet.timestamp_skewed(now_ms);

    Ok(Decoded {
        packet,
        timestamp_skewed,
    })
}

fn required_field<'a>(
    object: &'a serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<&'a Value, DecodeError> {
    match object.get(field) {
        Some(Value::Null) | None => Err(DecodeError::MissingField(field)),
        Some(v) => Ok(v),
    }
}

fn required_str(
    object: &serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<String, DecodeError> {
    required_field(object, field)?
        .as_str()
        .map(|s| s.to_string())
        .ok_or(DecodeError::TypeMismatch {
            field,
            expected: "string",
        })
}

fn required_int(
    object: &serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<i64, DecodeError> {
    required_field(object, field)?
        .as_i64()
        .ok_or(DecodeError::TypeMismatch {
            field,
            expected: "integer",
        })
}

fn required_trace(object: &serde_json::Map<String, Value>) -> Result<Vec<String>, DecodeError> {
    let array = required_field(object, "trace")?
        .as_array()
        .ok_or(DecodeError::TypeMismatch {
            field: "trace",
            expected: "array of strings",
        })?;
    let mut trace = Vec::with_capacity(array.len());
    for entry in array {
        let node = entry.as_str().ok_or(DecodeError::TypeMismatch {
            field: "trace",
            expected: "array of strings",
        })?;
        trace.push(node.to_string());
    }
    Ok(trace)
}
