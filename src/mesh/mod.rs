//! Core mesh engine: codec, dedup, outbox, routing, relay, upload.

pub mod codec;
pub mod dedup;
pub mod engine;
pub mod events;
pub mod ingress;
pub mod loop_guard;
pub mod outbox;
pub mod probe;
pub mod relay;
pub mod roles;
pub mod router;
pub mod uploader;

// Re-exports
pub use codec::{decode, encode, frame, read_frame, Decoded, ACK, DEFAULT_TRANSPORT_PORT, MAX_FRAME_LEN, NAK};
pub use dedup::{Seen, SeenCache};
pub use engine::{EngineAdapters, MeshEngine};
pub use events::{Diagnostic, ReceivedSos, RelayActivity, RelayStats, RelayedPacket, Stage};
pub use ingress::{IngressCounters, IngressHandler};
pub use loop_guard::{can_forward_to, check_integrity, should_process, RejectReason, MAX_TRACE_LEN};
pub use outbox::{FailureDisposition, Outbox, OutboxStats};
pub use probe::ConnectivityProbe;
pub use relay::{GoalDelivery, RelayOrchestrator};
pub use roles::{LocalRole, RoleController};
pub use router::{Candidate, Exclusion, NeighborRouter, RoutingDecision};
pub use uploader::{cloud_record, GatewayUploader, Severity, UploadLedger};
