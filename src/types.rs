//! Core value types for the mesh engine.
//!
//! # Design Goals
//!
//! 1. **Immutable packets** — a `MeshPacket` is a value. The only mutation is
//!    `add_hop`, which returns a *new* packet, so a queued original can never
//!    be corrupted by a send attempt.
//!
//! 2. **Append-only trace** — the trace is the audit trail of an emergency
//!    message. Every guard in the engine (dedup, loop guard, router) works
//!    off it, so its invariants are enforced at construction time.
//!
//! 3. **Copy-on-read neighbor snapshots** — `NodeInfo` values cross the
//!    link-adapter boundary as owned copies; nothing downstream can race the
//!    adapter's discovery thread.

use crate::error::{DecodeError, PacketError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

// =============================================================================
// PACKET CONSTANTS
// =============================================================================

/// Default TTL for newly originated packets.
/// 20 hops comfortably spans a multi-block disaster area; beyond that the
/// packet is more likely looping than progressing.
pub const DEFAULT_TTL: u32 = 20;

/// Absolute TTL ceiling. A packet claiming more than 30 remaining hops is
/// malformed or hostile and is rejected at decode.
pub const MAX_TTL: u32 = 30;

/// Accepted origination-timestamp window: 24 h into the past.
/// Devices in a disaster may have been offline for a long time before a
/// relay appears, so the past window is generous.
pub const TIMESTAMP_PAST_WINDOW_MS: i64 = 24 * 60 * 60 * 1000;

/// Accepted origination-timestamp window: 5 min into the future.
/// Covers clock skew between unsynchronized handsets; anything beyond is
/// flagged at decode.
pub const TIMESTAMP_FUTURE_WINDOW_MS: i64 = 5 * 60 * 1000;

/// A neighbor unseen for this long no longer counts as reachable.
pub const STALE_TIMEOUT_MS: i64 = 120_000;

/// Current Unix time in milliseconds.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Generate a fresh 128-bit packet id, rendered as 32 lowercase hex chars.
pub fn new_packet_id() -> String {
    let id: u128 = rand::random();
    hex::encode(id.to_be_bytes())
}

// =============================================================================
// PACKET MODEL
// =============================================================================

/// Message class carried by a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketType {
    Sos,
    Ack,
    Status,
    Data,
}

impl PacketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketType::Sos => "sos",
            PacketType::Ack => "ack",
            PacketType::Status => "status",
            PacketType::Data => "data",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sos" => Some(PacketType::Sos),
            "ack" => Some(PacketType::Ack),
            "status" => Some(PacketType::Status),
            "data" => Some(PacketType::Data),
            _ => None,
        }
    }
}

/// Forwarding priority. Encoded as an integer on the wire (`low = 0` …
/// `critical = 3`) and used for outbox ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn wire_code(&self) -> i64 {
        match self {
            Priority::Low => 0,
            Priority::Medium => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }

    pub fn from_wire_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Priority::Low),
            1 => Some(Priority::Medium),
            2 => Some(Priority::High),
            3 => Some(Priority::Critical),
            _ => None,
        }
    }
}

/// An immutable mesh packet.
///
/// Invariants (enforced by [`MeshPacket::from_parts`] and preserved by
/// `add_hop`):
/// - `trace` is non-empty and `trace[0] == originator_id`
/// - no node id appears twice in `trace`
/// - `ttl <= MAX_TTL`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshPacket {
    id: String,
    originator_id: String,
    packet_type: PacketType,
    priority: Priority,
    payload: String,
    trace: Vec<String>,
    ttl: u32,
    timestamp_ms: i64,
}

impl MeshPacket {
    /// Originate a new packet at this node. The trace starts as
    /// `[originator]` and the id is freshly generated.
    pub fn originate(
        originator_id: impl Into<String>,
        packet_type: PacketType,
        priority: Priority,
        payload: impl Into<String>,
        ttl: u32,
        timestamp_ms: i64,
    ) -> Self {
        let originator_id = originator_id.into();
        Self {
            id: new_packet_id(),
            originator_id: originator_id.clone(),
            packet_type,
            priority,
            payload: payload.into(),
            trace: vec![originator_id],
            ttl: ttl.min(MAX_TTL),
            timestamp_ms,
        }
    }

    /// Rebuild a packet from decoded wire fields, enforcing trace and TTL
    /// invariants.
    pub fn from_parts(
        id: String,
        originator_id: String,
        packet_type: PacketType,
        priority: Priority,
        payload: String,
        trace: Vec<String>,
        ttl: u32,
        timestamp_ms: i64,
    ) -> Result<Self, DecodeError> {
        if trace.is_empty() {
            return Err(DecodeError::TraceInvalid("trace is empty".into()));
        }
        if trace[0] != originator_id {
            return Err(DecodeError::TraceInvalid(format!(
                "trace[0] `{}` is not the originator `{}`",
                trace[0], originator_id
            )));
        }
        let mut seen = BTreeSet::new();
        for node in &trace {
            if !seen.insert(node.as_str()) {
                return Err(DecodeError::TraceInvalid(format!(
                    "node `{}` appears twice in trace",
                    node
                )));
            }
        }
        if ttl > MAX_TTL {
            return Err(DecodeError::TtlOutOfRange(ttl as i64));
        }
        Ok(Self {
            id,
            originator_id,
            packet_type,
            priority,
            payload,
            trace,
            ttl,
            timestamp_ms,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn originator_id(&self) -> &str {
        &self.originator_id
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn trace(&self) -> &[String] {
        &self.trace
    }

    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    pub fn is_sos(&self) -> bool {
        self.packet_type == PacketType::Sos
    }

    /// Hops taken so far. The originator entry does not count.
    pub fn hop_count(&self) -> usize {
        self.trace.len() - 1
    }

    /// The node that transmitted this packet to us: second-to-last trace
    /// entry, present only once the packet has moved at least one hop.
    pub fn previous_hop(&self) -> Option<&str> {
        if self.trace.len() >= 2 {
            Some(self.trace[self.trace.len() - 2].as_str())
        } else {
            None
        }
    }

    pub fn is_alive(&self) -> bool {
        self.ttl > 0
    }

    pub fn has_visited(&self, node_id: &str) -> bool {
        self.trace.iter().any(|n| n == node_id)
    }

    /// Timestamp outside the accepted window, relative to `now_ms`.
    pub fn timestamp_skewed(&self, now_ms: i64) -> bool {
        self.timestamp_ms < now_ms - TIMESTAMP_PAST_WINDOW_MS
            || self.timestamp_ms > now_ms + TIMESTAMP_FUTURE_WINDOW_MS
    }

    /// Append `node_id` to the trace and burn one TTL hop, yielding a new
    /// packet. Re-visiting a node or travelling on an exhausted TTL is
    /// rejected.
    pub fn add_hop(&self, node_id: &str) -> Result<MeshPacket, PacketError> {
        if self.has_visited(node_id) {
            return Err(PacketError::AlreadyVisited(node_id.to_string()));
        }
        if self.ttl == 0 {
            return Err(PacketError::TtlExhausted);
        }
        let mut next = self.clone();
        next.trace.push(node_id.to_string());
        next.ttl -= 1;
        Ok(next)
    }
}

// =============================================================================
// SOS PAYLOAD
// =============================================================================

/// Category of emergency, as selected on the victim's device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmergencyType {
    Medical,
    Trapped,
    Fire,
    Flood,
    Earthquake,
    Accident,
    Other,
}

impl EmergencyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmergencyType::Medical => "medical",
            EmergencyType::Trapped => "trapped",
            EmergencyType::Fire => "fire",
            EmergencyType::Flood => "flood",
            EmergencyType::Earthquake => "earthquake",
            EmergencyType::Accident => "accident",
            EmergencyType::Other => "other",
        }
    }
}

/// Field triage classification (START color codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriageLevel {
    None,
    Green,
    Yellow,
    Red,
}

impl TriageLevel {
    /// Single-letter code used in the advertisement record.
    pub fn code(&self) -> &'static str {
        match self {
            TriageLevel::None => "n",
            TriageLevel::Green => "g",
            TriageLevel::Yellow => "y",
            TriageLevel::Red => "r",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "n" => Some(TriageLevel::None),
            "g" => Some(TriageLevel::Green),
            "y" => Some(TriageLevel::Yellow),
            "r" => Some(TriageLevel::Red),
            _ => None,
        }
    }
}

/// The SOS form, JSON-encoded into `MeshPacket::payload` for `sos` packets.
///
/// `medical_conditions` and `required_supplies` are ordered sets so the JSON
/// rendering is byte-stable across encode/decode cycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SosPayload {
    pub sos_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub location_accuracy_m: f64,
    pub emergency_type: EmergencyType,
    pub triage_level: TriageLevel,
    pub number_of_people: u32,
    pub medical_conditions: BTreeSet<String>,
    pub required_supplies: BTreeSet<String>,
    pub additional_notes: String,
    #[serde(default)]
    pub contact_phone: Option<String>,
    pub timestamp_ms: i64,
    pub is_active: bool,
}

impl SosPayload {
    pub fn to_json(&self) -> String {
        // Struct-to-JSON for a plain value type cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

// =============================================================================
// NEIGHBOR MODEL
// =============================================================================

/// Role a node advertises to the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Sender,
    Relay,
    Goal,
    Idle,
}

impl NodeRole {
    /// Single-letter code used in the advertisement record.
    pub fn code(&self) -> &'static str {
        match self {
            NodeRole::Sender => "s",
            NodeRole::Relay => "r",
            NodeRole::Goal => "g",
            NodeRole::Idle => "i",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "s" => Some(NodeRole::Sender),
            "r" => Some(NodeRole::Relay),
            "g" => Some(NodeRole::Goal),
            "i" => Some(NodeRole::Idle),
            _ => None,
        }
    }
}

/// Snapshot of a discovered peer, rebuilt from its latest advertisement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    /// Link-layer address, opaque to the engine.
    pub device_address: String,
    pub display_name: String,
    /// 0–100.
    pub battery_level: u8,
    pub has_internet: bool,
    pub latitude: f64,
    pub longitude: f64,
    pub last_seen_ms: i64,
    pub signal_strength_dbm: i32,
    pub triage_level: TriageLevel,
    pub role: NodeRole,
    pub is_available_for_relay: bool,
}

impl NodeInfo {
    pub fn is_stale(&self, now_ms: i64) -> bool {
        now_ms - self.last_seen_ms > STALE_TIMEOUT_MS
    }

    pub fn normalized_battery(&self) -> f64 {
        f64::from(self.battery_level.min(100)) / 100.0
    }

    /// Map dBm onto [0, 1]: -90 dBm (barely usable) → 0.0, -30 dBm → 1.0.
    pub fn normalized_signal(&self) -> f64 {
        ((f64::from(self.signal_strength_dbm) + 90.0) / 60.0).clamp(0.0, 1.0)
    }

    /// Rebuild a snapshot from an advertisement record. Missing or garbled
    /// numeric fields fall back to conservative defaults rather than
    /// discarding the peer: a reachable relay with unknown battery is still
    /// better than no relay.
    pub fn from_advertisement(
        device_address: &str,
        record: &HashMap<String, String>,
        now_ms: i64,
    ) -> Option<Self> {
        let id = record.get("id")?.clone();
        if id.is_empty() {
            return None;
        }
        let battery_level = record
            .get("bat")
            .and_then(|v| v.parse::<u8>().ok())
            .unwrap_or(0)
            .min(100);
        let has_internet = record.get("net").map(|v| v == "1").unwrap_or(false);
        let latitude = record
            .get("lat")
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.0);
        let longitude = record
            .get("lng")
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.0);
        let signal_strength_dbm = record
            .get("sig")
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(-90);
        let triage_level = record
            .get("tri")
            .and_then(|v| TriageLevel::from_code(v))
            .unwrap_or(TriageLevel::None);
        let role = record
            .get("rol")
            .and_then(|v| NodeRole::from_code(v))
            .unwrap_or(NodeRole::Idle);
        let is_available_for_relay = record.get("rel").map(|v| v == "1").unwrap_or(false);

        Some(Self {
            id,
            device_address: device_address.to_string(),
            display_name: record.get("name").cloned().unwrap_or_default(),
            battery_level,
            has_internet,
            latitude,
            longitude,
            last_seen_ms: now_ms,
            signal_strength_dbm,
            triage_level,
            role,
            is_available_for_relay,
        })
    }
}

// =============================================================================
// OUTBOX MODEL
// =============================================================================

/// Mesh-delivery state of a queued packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

/// A packet awaiting forward, with retry bookkeeping.
///
/// The stored packet is the **original** as received (or originated); the
/// local hop is appended only at the moment of a send attempt. This is what
/// keeps hop accounting exact across immediate-forward failures and later
/// orchestrator retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub packet: MeshPacket,
    pub status: DeliveryStatus,
    pub retry_count: u32,
    pub last_attempt_ms: i64,
    pub created_ms: i64,
}

impl OutboxEntry {
    pub fn new(packet: MeshPacket, created_ms: i64) -> Self {
        Self {
            packet,
            status: DeliveryStatus::Pending,
            retry_count: 0,
            last_attempt_ms: 0,
            created_ms,
        }
    }
}
