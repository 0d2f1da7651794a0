//! Typed payloads for the engine's public streams.

use crate::types::{MeshPacket, SosPayload};

/// An SOS that terminated at this node (goal path). Emitted on `sos_alerts`.
#[derive(Debug, Clone)]
pub struct ReceivedSos {
    pub packet: MeshPacket,
    pub sos: SosPayload,
    pub received_at_ms: i64,
    pub sender_address: String,
}

/// A packet passing through this node in transit. Emitted on `relay_log`.
#[derive(Debug, Clone)]
pub struct RelayedPacket {
    pub packet: MeshPacket,
    pub received_at_ms: i64,
    pub sender_address: String,
}

/// Rolling orchestrator counters. Published as a snapshot on `relay_stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub packets_sent: u64,
    pub transient_failures: u64,
    pub permanent_drops: u64,
    pub pending_count: usize,
    pub neighbors_count: usize,
    pub running: bool,
    pub consecutive_failures: u32,
}

/// One orchestrator decision point. Emitted on `relay_activity`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayActivity {
    Started,
    Stopped,
    Checking { pending: usize },
    NoNeighbors,
    NoRoute { packet_id: String },
    Selected { packet_id: String, target: String },
    Connecting { target: String },
    Sent { packet_id: String, target: String },
    DeliveredLocal { packet_id: String },
    Failed { packet_id: String, target: String, error: String },
    Expired { packet_id: String },
    Paused { backoff_ms: u64 },
}

/// Where in the pipeline a diagnostic was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Decode,
    Dedup,
    Validate,
    Route,
    Forward,
    Upload,
    Command,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Decode => "decode",
            Stage::Dedup => "dedup",
            Stage::Validate => "validate",
            Stage::Route => "route",
            Stage::Forward => "forward",
            Stage::Upload => "upload",
            Stage::Command => "command",
        }
    }
}

/// Every error, recovered or not, lands here. Emitted on `relay_diagnostics`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub packet_id: Option<String>,
    pub stage: Stage,
    pub detail: String,
}

impl Diagnostic {
    pub fn new(packet_id: Option<&str>, stage: Stage, detail: impl Into<String>) -> Self {
        Self {
            packet_id: packet_id.map(str::to_string),
            stage,
            detail: detail.into(),
        }
    }
}
