//! Next-hop selection: hard filter, weighted score, deterministic tie-break.
//!
//! The router is pure. It never mutates packets and holds no connection
//! state; it ranks a snapshot of neighbors for one packet and explains its
//! ranking on demand so the host UI can show why a hop was (not) chosen.

use crate::config::RouterWeights;
use crate::types::{MeshPacket, NodeInfo};
use std::cmp::Ordering;

/// Why a neighbor was excluded before scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exclusion {
    IsOriginator,
    IsPreviousHop,
    InTrace,
    Stale,
    NotAvailableForRelay,
}

/// Score breakdown for one candidate, eligible or not.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub node_id: String,
    pub excluded: Option<Exclusion>,
    pub internet_points: f64,
    pub battery_points: f64,
    pub signal_points: f64,
    pub score: f64,
    battery_level: u8,
    signal_dbm: i32,
}

/// Full ranking for one packet, for diagnostics.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub packet_id: String,
    /// Eligible candidates first, best to worst; excluded ones follow.
    pub candidates: Vec<Candidate>,
    pub selected: Option<String>,
}

/// Scores eligible neighbors for a packet and picks the best next hop.
#[derive(Debug, Clone, Default)]
pub struct NeighborRouter {
    weights: RouterWeights,
}

impl NeighborRouter {
    pub fn new(weights: RouterWeights) -> Self {
        Self { weights }
    }

    /// The hard filter: loops first, then liveness, then willingness.
    fn exclusion(&self, node: &NodeInfo, packet: &MeshPacket, now_ms: i64) -> Option<Exclusion> {
        if node.id == packet.originator_id() {
            return Some(Exclusion::IsOriginator);
        }
        if Some(node.id.as_str()) == packet.previous_hop() {
            return Some(Exclusion::IsPreviousHop);
        }
        if packet.has_visited(&node.id) {
            return Some(Exclusion::InTrace);
        }
        if node.is_stale(now_ms) {
            return Some(Exclusion::Stale);
        }
        if !node.is_available_for_relay {
            return Some(Exclusion::NotAvailableForRelay);
        }
        None
    }

    fn candidate(&self, node: &NodeInfo, packet: &MeshPacket, now_ms: i64) -> Candidate {
        let internet_points = if node.has_internet {
            self.weights.internet
        } else {
            0.0
        };
        let battery_points = self.weights.battery * node.normalized_battery();
        let signal_points = self.weights.signal * node.normalized_signal();
        Candidate {
            node_id: node.id.clone(),
            excluded: self.exclusion(node, packet, now_ms),
            internet_points,
            battery_points,
            signal_points,
            score: internet_points + battery_points + signal_points,
            battery_level: node.battery_level,
            signal_dbm: node.signal_strength_dbm,
        }
    }

    /// Pick the best eligible next hop, or `None` when every neighbor is
    /// filtered out. Ties break on battery, then signal, then node id, so
    /// two nodes ranking the same snapshot pick the same hop.
    pub fn select_best(
        &self,
        neighbors: &[NodeInfo],
        packet: &MeshPacket,
        _self_id: &str,
        now_ms: i64,
    ) -> Option<NodeInfo> {
        let mut best: Option<(Candidate, &NodeInfo)> = None;
        for node in neighbors {
            let candidate = self.candidate(node, packet, now_ms);
            if candidate.excluded.is_some() {
                continue;
            }
            match &best {
                Some((current, _)) if rank(&candidate, current) != Ordering::Greater => {}
                _ => best = Some((candidate, node)),
            }
        }
        best.map(|(_, node)| node.clone())
    }

    /// Rank every neighbor for one packet, including the excluded ones and
    /// their per-component sub-scores.
    pub fn explain(
        &self,
        neighbors: &[NodeInfo],
        packet: &MeshPacket,
        self_id: &str,
        now_ms: i64,
    ) -> RoutingDecision {
        let mut candidates: Vec<Candidate> = neighbors
            .iter()
            .map(|n| self.candidate(n, packet, now_ms))
            .collect();
        candidates.sort_by(|a, b| {
            match (a.excluded.is_some(), b.excluded.is_some()) {
                (false, true) => Ordering::Less,
                (true, false) => Ordering::Greater,
                _ => rank(b, a),
            }
        });
        let selected = self
            .select_best(neighbors, packet, self_id, now_ms)
            .map(|n| n.id);
        RoutingDecision {
            packet_id: packet.id().to_string(),
            candidates,
            selected,
        }
    }
}

/// Total order over candidates: score, then battery, then signal strength
/// (less negative dBm), then lexicographically smaller id.
fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    a.score
        .partial_cmp(&b.score)
        .unwrap_or(Ordering::Equal)
        .then(a.battery_level.cmp(&b.battery_level))
        .then(a.signal_dbm.cmp(&b.signal_dbm))
        .then(b.node_id.cmp(&a.node_id))
}
