//! Received-frame pipeline: decode → dedup → validate → route.
//!
//! For any single packet id this sequence is total, and the engine runs one
//! ingress task, so dedup decisions are race-free. Decode errors, duplicates
//! and guard rejections are normal mesh traffic: they are counted, surfaced
//! as diagnostics, and dropped without ever reaching the UI streams.

use crate::adapters::{Clock, InboundFrame};
use crate::mesh::codec;
use crate::mesh::dedup::{Seen, SeenCache};
use crate::mesh::events::{Diagnostic, ReceivedSos, RelayedPacket, Stage};
use crate::mesh::loop_guard;
use crate::mesh::outbox::Outbox;
use crate::mesh::probe::ConnectivityProbe;
use crate::mesh::relay::RelayOrchestrator;
use crate::types::{MeshPacket, SosPayload};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Snapshot of the drop counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngressCounters {
    pub decode_errors: u64,
    pub duplicates: u64,
    pub rejections: u64,
}

pub struct IngressHandler {
    self_id: String,
    seen: Arc<SeenCache>,
    outbox: Arc<Outbox>,
    probe: Arc<ConnectivityProbe>,
    relay: Arc<RelayOrchestrator>,
    clock: Arc<dyn Clock>,

    sos_tx: broadcast::Sender<ReceivedSos>,
    relay_log_tx: broadcast::Sender<RelayedPacket>,
    forwards_tx: broadcast::Sender<String>,
    diagnostics_tx: broadcast::Sender<Diagnostic>,

    decode_errors: AtomicU64,
    duplicates: AtomicU64,
    rejections: AtomicU64,
}

impl IngressHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_id: String,
        seen: Arc<SeenCache>,
        outbox: Arc<Outbox>,
        probe: Arc<ConnectivityProbe>,
        relay: Arc<RelayOrchestrator>,
        clock: Arc<dyn Clock>,
        sos_tx: broadcast::Sender<ReceivedSos>,
        relay_log_tx: broadcast::Sender<RelayedPacket>,
        forwards_tx: broadcast::Sender<String>,
        diagnostics_tx: broadcast::Sender<Diagnostic>,
    ) -> Self {
        Self {
            self_id,
            seen,
            outbox,
            probe,
            relay,
            clock,
            sos_tx,
            relay_log_tx,
            forwards_tx,
            diagnostics_tx,
            decode_errors: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    pub fn counters(&self) -> IngressCounters {
        IngressCounters {
            decode_errors: self.decode_errors.load(Ordering::SeqCst),
            duplicates: self.duplicates.load(Ordering::SeqCst),
            rejections: self.rejections.load(Ordering::SeqCst),
        }
    }

    /// Drain frames until the channel closes or the task is aborted.
    pub async fn run(self: Arc<Self>, mut frames: broadcast::Receiver<InboundFrame>) {
        loop {
            match frames.recv().await {
                Ok(frame) => self.handle_frame(frame).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(dropped = n, "ingress lagged behind the link layer");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Process one received frame end to end.
    pub async fn handle_frame(&self, frame: InboundFrame) {
        let now = self.clock.now_ms();
        let decoded = match codec::decode(&frame.bytes, now) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.decode_errors.fetch_add(1, Ordering::SeqCst);
                self.diagnose(None, Stage::Decode, e.to_string());
                debug!(sender = %frame.sender_address, error = %e, "dropping undecodable frame");
                return;
            }
        };
        let packet = decoded.packet;
        if decoded.timestamp_skewed {
            self.diagnose(
                Some(packet.id()),
                Stage::Decode,
                "origination timestamp outside accepted window",
            );
        }

        if self.seen.check_and_mark(packet.id()) == Seen::AlreadySeen {
            self.duplicates.fetch_add(1, Ordering::SeqCst);
            debug!(packet_id = packet.id(), "duplicate receive");
            return;
        }

        if let Err(reason) = loop_guard::should_process(&packet, &self.self_id) {
            self.rejections.fetch_add(1, Ordering::SeqCst);
            self.diagnose(Some(packet.id()), Stage::Validate, reason.to_string());
            debug!(packet_id = packet.id(), %reason, "rejected on receive");
            return;
        }

        // One forced probe per SOS receive; the verdict drives both the
        // responder branch here and the forward decision below.
        let known_online = if packet.is_sos() {
            self.probe.check(true).await
        } else {
            false
        };

        if packet.is_sos() && known_online {
            match SosPayload::from_json(packet.payload()) {
                Ok(sos) => {
                    // Goal path: surface to responders, queue for the cloud.
                    // Mesh delivery is complete, so the entry goes straight
                    // to sent; the relay drain must not touch it again.
                    let _ = self.sos_tx.send(ReceivedSos {
                        packet: packet.clone(),
                        sos,
                        received_at_ms: now,
                        sender_address: frame.sender_address.clone(),
                    });
                    let queued = self
                        .outbox
                        .add(packet.clone())
                        .await
                        .and(self.outbox.mark_sent(packet.id()).await);
                    if let Err(e) = queued {
                        self.diagnose(Some(packet.id()), Stage::Forward, e.to_string());
                    }
                }
                Err(e) => {
                    self.diagnose(
                        Some(packet.id()),
                        Stage::Decode,
                        format!("sos payload unreadable: {e}"),
                    );
                }
            }
        } else {
            let _ = self.relay_log_tx.send(RelayedPacket {
                packet: packet.clone(),
                received_at_ms: now,
                sender_address: frame.sender_address.clone(),
            });
        }

        self.handle_forward_or_deliver(packet, known_online).await;
    }

    /// Decide what the forward path owes this packet.
    async fn handle_forward_or_deliver(&self, packet: MeshPacket, known_online: bool) {
        if known_online && packet.is_sos() {
            // We are the goal; the packet terminated here. No forward.
            return;
        }

        if !packet.is_alive() {
            // Arrived on its last hop and we are not its terminus.
            self.relay
                .account_permanent_drop(packet.id(), "ttl exhausted on arrival")
                .await;
            return;
        }

        // Store the original; the local hop is appended per send attempt.
        match self.outbox.add(packet.clone()).await {
            Ok(_) => {}
            Err(e) => {
                self.diagnose(Some(packet.id()), Stage::Forward, e.to_string());
                return;
            }
        }

        if self.relay.try_forward_now(&packet).await {
            let _ = self.forwards_tx.send(packet.id().to_string());
        }
        // On failure the entry stays pending for the periodic drain.
    }

    fn diagnose(&self, packet_id: Option<&str>, stage: Stage, detail: impl Into<String>) {
        let _ = self
            .diagnostics_tx
            .send(Diagnostic::new(packet_id, stage, detail));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{LinkLayer, ManualClock, ProbeTransport, Storage};
    use crate::config::{ProbeConfig, RelayConfig, RetryPolicy};
    use crate::error::{CloudError, LinkError};
    use crate::mesh::router::NeighborRouter;
    use crate::types::{
        EmergencyType, NodeInfo, NodeRole, PacketType, Priority, TriageLevel,
    };
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    struct StubLink {
        neighbors: std::sync::Mutex<Vec<NodeInfo>>,
        fail_sends: AtomicBool,
        sent: std::sync::Mutex<Vec<(String, Vec<u8>)>>,
        neighbors_tx: broadcast::Sender<Vec<NodeInfo>>,
        frames_tx: broadcast::Sender<InboundFrame>,
    }

    impl StubLink {
        fn new(neighbors: Vec<NodeInfo>) -> Arc<Self> {
            Arc::new(Self {
                neighbors: std::sync::Mutex::new(neighbors),
                fail_sends: AtomicBool::new(false),
                sent: std::sync::Mutex::new(Vec::new()),
                neighbors_tx: broadcast::channel(8).0,
                frames_tx: broadcast::channel(8).0,
            })
        }
    }

    #[async_trait]
    impl LinkLayer for StubLink {
        async fn initialize(&self) -> Result<(), LinkError> {
            Ok(())
        }
        async fn advertise(&self, _r: HashMap<String, String>) -> Result<(), LinkError> {
            Ok(())
        }
        async fn start_discovery(&self) -> Result<(), LinkError> {
            Ok(())
        }
        async fn stop_discovery(&self) -> Result<(), LinkError> {
            Ok(())
        }
        fn subscribe_neighbors(&self) -> broadcast::Receiver<Vec<NodeInfo>> {
            self.neighbors_tx.subscribe()
        }
        fn subscribe_frames(&self) -> broadcast::Receiver<InboundFrame> {
            self.frames_tx.subscribe()
        }
        async fn current_neighbors(&self) -> Vec<NodeInfo> {
            self.neighbors.lock().unwrap().clone()
        }
        async fn connect_and_send(&self, address: &str, bytes: &[u8]) -> Result<(), LinkError> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(LinkError::Busy);
            }
            self.sent
                .lock()
                .unwrap()
                .push((address.to_string(), bytes.to_vec()));
            Ok(())
        }
        fn signal_strength_dbm(&self) -> i32 {
            -50
        }
        async fn cleanup_stale(&self) {}
        async fn shutdown(&self) {}
    }

    /// Probe transport answering a fixed status.
    struct FixedProbe(u16);

    #[async_trait]
    impl ProbeTransport for FixedProbe {
        async fn fetch_status(&self, _url: &str, _t: Duration) -> Result<u16, CloudError> {
            Ok(self.0)
        }
    }

    fn make_node(id: &str) -> NodeInfo {
        NodeInfo {
            id: id.into(),
            device_address: format!("addr-{id}"),
            display_name: String::new(),
            battery_level: 80,
            has_internet: false,
            latitude: 0.0,
            longitude: 0.0,
            last_seen_ms: 1_000,
            signal_strength_dbm: -50,
            triage_level: TriageLevel::None,
            role: NodeRole::Relay,
            is_available_for_relay: true,
        }
    }

    fn make_sos_packet(id: &str, trace: &[&str], ttl: u32) -> MeshPacket {
        let sos = SosPayload {
            sos_id: id.into(),
            sender_id: trace[0].into(),
            sender_name: "Alice".into(),
            latitude: 12.9,
            longitude: 77.6,
            location_accuracy_m: 10.0,
            emergency_type: EmergencyType::Medical,
            triage_level: TriageLevel::Red,
            number_of_people: 1,
            medical_conditions: Default::default(),
            required_supplies: Default::default(),
            additional_notes: String::new(),
            contact_phone: None,
            timestamp_ms: 0,
            is_active: true,
        };
        MeshPacket::from_parts(
            id.into(),
            trace[0].into(),
            PacketType::Sos,
            Priority::Critical,
            sos.to_json(),
            trace.iter().map(|s| s.to_string()).collect(),
            ttl,
            0,
        )
        .unwrap()
    }

    struct Fixture {
        ingress: IngressHandler,
        outbox: Arc<Outbox>,
        link: Arc<StubLink>,
        sos_rx: broadcast::Receiver<ReceivedSos>,
        relay_log_rx: broadcast::Receiver<RelayedPacket>,
        forwards_rx: broadcast::Receiver<String>,
        relay: Arc<RelayOrchestrator>,
        seen: Arc<SeenCache>,
    }

    async fn make_fixture(self_id: &str, neighbors: Vec<NodeInfo>, probe_status: u16) -> Fixture {
        let storage: Arc<dyn Storage> = Arc::new(crate::store::MemoryStorage::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let seen = Arc::new(SeenCache::new(100));
        let outbox = Arc::new(Outbox::new(storage, clock.clone(), RetryPolicy::default()));
        let link = StubLink::new(neighbors);
        let probe = Arc::new(ConnectivityProbe::new(
            Arc::new(FixedProbe(probe_status)),
            clock.clone(),
            ProbeConfig {
                endpoints: vec!["http://probe".into()],
                ..ProbeConfig::default()
            },
        ));
        let activity_tx = broadcast::channel(64).0;
        let diagnostics_tx = broadcast::channel(64).0;
        let relay = Arc::new(RelayOrchestrator::new(
            link.clone(),
            outbox.clone(),
            NeighborRouter::default(),
            clock.clone(),
            RelayConfig::default(),
            Duration::from_secs(3600),
            None,
            activity_tx,
            diagnostics_tx.clone(),
        ));
        relay.set_node_id(self_id).await;
        let sos_tx = broadcast::channel(64).0;
        let relay_log_tx = broadcast::channel(64).0;
        let forwards_tx = broadcast::channel(64).0;

        let ingress = IngressHandler::new(
            self_id.to_string(),
            seen.clone(),
            outbox.clone(),
            probe,
            relay.clone(),
            clock,
            sos_tx.clone(),
            relay_log_tx.clone(),
            forwards_tx.clone(),
            diagnostics_tx,
        );
        Fixture {
            ingress,
            outbox,
            link,
            sos_rx: sos_tx.subscribe(),
            relay_log_rx: relay_log_tx.subscribe(),
            forwards_rx: forwards_tx.subscribe(),
            relay,
            seen,
        }
    }

    fn frame_of(packet: &MeshPacket) -> InboundFrame {
        InboundFrame {
            sender_address: "addr-src".into(),
            bytes: codec::encode(packet),
        }
    }

    #[tokio::test]
    async fn online_sos_goes_to_responder_stream_and_outbox() {
        let mut f = make_fixture("B", vec![], 204).await;
        let packet = make_sos_packet("p1", &["A"], 19);

        f.ingress.handle_frame(frame_of(&packet)).await;

        let alert = f.sos_rx.try_recv().unwrap();
        assert_eq!(alert.packet.id(), "p1");
        assert_eq!(alert.sos.sender_name, "Alice");
        assert_eq!(alert.sender_address, "addr-src");
        // Queued for the uploader, not re-forwarded.
        assert!(f.outbox.get("p1").await.is_some());
        assert!(f.relay_log_rx.try_recv().is_err());
        assert!(f.link.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn offline_sos_goes_to_relay_stream_and_forwards() {
        let mut f = make_fixture("R", vec![make_node("C")], 500).await;
        let packet = make_sos_packet("p1", &["A"], 19);

        f.ingress.handle_frame(frame_of(&packet)).await;

        let relayed = f.relay_log_rx.try_recv().unwrap();
        assert_eq!(relayed.packet.id(), "p1");
        assert!(f.sos_rx.try_recv().is_err());

        // Immediate forward happened and was reported.
        assert_eq!(f.forwards_rx.try_recv().unwrap(), "p1");
        let sent = f.link.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        // Outbox keeps the original without our hop.
        drop(sent);
        let entry = f.outbox.get("p1").await.unwrap();
        assert_eq!(entry.packet.trace(), &["A".to_string()]);
    }

    #[tokio::test]
    async fn duplicates_emit_once() {
        let mut f = make_fixture("B", vec![], 204).await;
        let packet = make_sos_packet("p1", &["A"], 19);

        for _ in 0..5 {
            f.ingress.handle_frame(frame_of(&packet)).await;
        }

        assert!(f.sos_rx.try_recv().is_ok());
        assert!(f.sos_rx.try_recv().is_err());
        assert_eq!(f.ingress.counters().duplicates, 4);
        assert_eq!(f.outbox.get_all().await.len(), 1);
        assert_eq!(f.seen.len(), 1);
    }

    #[tokio::test]
    async fn undecodable_frames_are_counted_and_dropped() {
        let mut f = make_fixture("B", vec![], 204).await;
        f.ingress
            .handle_frame(InboundFrame {
                sender_address: "x".into(),
                bytes: b"not json".to_vec(),
            })
            .await;
        assert_eq!(f.ingress.counters().decode_errors, 1);
        assert!(f.sos_rx.try_recv().is_err());
        assert!(f.relay_log_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn looped_packet_is_rejected() {
        let mut f = make_fixture("R", vec![], 500).await;
        // R appears mid-trace: this packet already passed through us.
        let packet = make_sos_packet("p1", &["A", "R", "X"], 10);
        f.ingress.handle_frame(frame_of(&packet)).await;
        assert_eq!(f.ingress.counters().rejections, 1);
        assert!(f.relay_log_rx.try_recv().is_err());
        assert!(f.outbox.get("p1").await.is_none());
    }

    #[tokio::test]
    async fn dead_on_arrival_is_permanent_drop() {
        let f = make_fixture("R", vec![make_node("C")], 500).await;
        let packet = make_sos_packet("p1", &["A", "Q"], 0);

        f.ingress.handle_frame(frame_of(&packet)).await;

        let stats = f.relay.stats().borrow().clone();
        assert_eq!(stats.permanent_drops, 1);
        assert!(f.outbox.get("p1").await.is_none());
        assert!(f.link.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dead_on_arrival_at_goal_still_alerts() {
        let mut f = make_fixture("B", vec![], 204).await;
        let packet = make_sos_packet("p1", &["A", "Q"], 0);

        f.ingress.handle_frame(frame_of(&packet)).await;

        // Terminal delivery still happens; no drop is charged.
        assert!(f.sos_rx.try_recv().is_ok());
        let stats = f.relay.stats().borrow().clone();
        assert_eq!(stats.permanent_drops, 0);
    }

    #[tokio::test]
    async fn failed_immediate_forward_leaves_entry_pending() {
        let mut f = make_fixture("R", vec![make_node("C")], 500).await;
        f.link.fail_sends.store(true, Ordering::SeqCst);
        let packet = make_sos_packet("p1", &["A"], 10);

        f.ingress.handle_frame(frame_of(&packet)).await;

        assert!(f.forwards_rx.try_recv().is_err());
        let entry = f.outbox.get("p1").await.unwrap();
        assert_eq!(entry.packet.trace(), &["A".to_string()]);
        assert_eq!(f.outbox.stats().await.pending, 1);
    }
}
