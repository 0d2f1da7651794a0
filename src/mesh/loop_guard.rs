//! Loop detection and packet integrity checks.
//!
//! Two gates guard the relay path: `should_process` on receive (is this
//! packet coherent and new to us?) and `can_forward_to` before a send (would
//! this hop create a loop?). Both are pure over the packet value, so every
//! rejection is reproducible from the trace alone.

use crate::types::{MeshPacket, MAX_TTL};
use thiserror::Error;

/// Longest legal trace: the originator plus one entry per allowed hop.
pub const MAX_TRACE_LEN: usize = MAX_TTL as usize + 1;

/// Why a packet was refused, either on receive or before a forward.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("ttl expired")]
    TtlExpired,
    #[error("ttl above protocol maximum")]
    InvalidTtl,
    #[error("target already in trace")]
    TargetInTrace,
    #[error("target is the originator")]
    TargetIsOriginator,
    #[error("target is the previous hop")]
    TargetIsPreviousHop,
    #[error("local node already processed this packet")]
    AlreadyProcessed,
    #[error("trace longer than any legal path")]
    TraceTooLong,
    #[error("packet id is empty")]
    EmptyId,
    #[error("originator id is empty")]
    EmptyOriginator,
    #[error("trace is empty")]
    TraceEmpty,
    #[error("trace does not start at the originator")]
    TraceOriginatorMismatch,
    #[error("trace contains a duplicate node")]
    TraceDuplicate,
}

/// Structural validity: ids present, trace coherent, no duplicates.
pub fn check_integrity(packet: &MeshPacket) -> Result<(), RejectReason> {
    if packet.id().is_empty() {
        return Err(RejectReason::EmptyId);
    }
    if packet.originator_id().is_empty() {
        return Err(RejectReason::EmptyOriginator);
    }
    let trace = packet.trace();
    if trace.is_empty() {
        return Err(RejectReason::TraceEmpty);
    }
    if trace[0] != packet.originator_id() {
        return Err(RejectReason::TraceOriginatorMismatch);
    }
    for (i, node) in trace.iter().enumerate() {
        if trace[..i].iter().any(|n| n == node) {
            return Err(RejectReason::TraceDuplicate);
        }
    }
    if trace.len() > MAX_TRACE_LEN {
        return Err(RejectReason::TraceTooLong);
    }
    Ok(())
}

/// May the local node process a freshly received packet?
///
/// The local id may legitimately appear as the *last* trace entry: that is
/// the state right after we appended ourselves. Anywhere earlier means the
/// packet came back around to us.
///
/// A zero-TTL packet still passes: TTL bounds further travel, not local
/// delivery. A goal node receiving a packet on its last hop must still hand
/// it to the responder path; the forward path drops it instead.
pub fn should_process(packet: &MeshPacket, self_id: &str) -> Result<(), RejectReason> {
    check_integrity(packet)?;
    if packet.has_visited(self_id) && packet.trace().last().map(String::as_str) != Some(self_id) {
        return Err(RejectReason::AlreadyProcessed);
    }
    Ok(())
}

/// Would forwarding this packet to `target_id` create a loop?
///
/// Evaluated on the packet as received (before the local hop is appended),
/// so `previous_hop` is the node that transmitted to us.
pub fn can_forward_to(
    packet: &MeshPacket,
    target_id: &str,
    self_id: &str,
) -> Result<(), RejectReason> {
    if packet.ttl() > MAX_TTL {
        return Err(RejectReason::InvalidTtl);
    }
    if !packet.is_alive() {
        return Err(RejectReason::TtlExpired);
    }
    if packet.trace().len() > MAX_TRACE_LEN {
        return Err(RejectReason::TraceTooLong);
    }
    if target_id == packet.originator_id() {
        return Err(RejectReason::TargetIsOriginator);
    }
    if Some(target_id) == packet.previous_hop() {
        return Err(RejectReason::TargetIsPreviousHop);
    }
    if packet.has_visited(target_id) {
        return Err(RejectReason::TargetInTrace);
    }
    if packet.has_visited(self_id) && packet.trace().last().map(String::as_str) != Some(self_id) {
        return Err(RejectReason::AlreadyProcessed);
    }
    Ok(())
}
