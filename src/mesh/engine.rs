//! Engine facade: command surface, event streams, task wiring.
//!
//! The engine owns every piece of mesh state (outbox, seen cache, upload
//! ledger, role state) and mutates it only from its own tasks; adapters talk
//! to it through channels. Hosts drive it with a handful of commands and
//! observe it through broadcast/watch streams; there is no other way in or
//! out.

use crate::adapters::{
    BatteryProvider, Clock, CloudSink, LinkLayer, LocationProvider, ProbeTransport, Storage,
};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::mesh::dedup::SeenCache;
use crate::mesh::events::{Diagnostic, ReceivedSos, RelayActivity, RelayedPacket, RelayStats, Stage};
use crate::mesh::ingress::{IngressCounters, IngressHandler};
use crate::mesh::outbox::Outbox;
use crate::mesh::probe::ConnectivityProbe;
use crate::mesh::relay::{GoalDelivery, RelayOrchestrator};
use crate::mesh::roles::RoleController;
use crate::mesh::router::NeighborRouter;
use crate::mesh::uploader::{GatewayUploader, UploadLedger};
use crate::types::{new_packet_id, MeshPacket, NodeInfo, PacketType, Priority, SosPayload, DEFAULT_TTL};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{info, warn};

/// The platform capabilities an engine is built over.
pub struct EngineAdapters {
    pub link: Arc<dyn LinkLayer>,
    pub storage: Arc<dyn Storage>,
    pub cloud: Arc<dyn CloudSink>,
    pub probe_transport: Arc<dyn ProbeTransport>,
    pub clock: Arc<dyn Clock>,
    pub battery: Arc<dyn BatteryProvider>,
    pub location: Arc<dyn LocationProvider>,
}

/// Terminates queued SOS packets locally once this node has internet.
struct LocalGoalDelivery {
    probe: Arc<ConnectivityProbe>,
    clock: Arc<dyn Clock>,
    sos_tx: broadcast::Sender<ReceivedSos>,
    diagnostics_tx: broadcast::Sender<Diagnostic>,
}

#[async_trait]
impl GoalDelivery for LocalGoalDelivery {
    async fn try_local_goal_deliver(&self, packet: &MeshPacket) -> bool {
        if !packet.is_sos() || !self.probe.is_online().await {
            return false;
        }
        match SosPayload::from_json(packet.payload()) {
            Ok(sos) => {
                let _ = self.sos_tx.send(ReceivedSos {
                    packet: packet.clone(),
                    sos,
                    received_at_ms: self.clock.now_ms(),
                    // Queued packets no longer carry their link-layer source.
                    sender_address: String::new(),
                });
                true
            }
            Err(e) => {
                let _ = self.diagnostics_tx.send(Diagnostic::new(
                    Some(packet.id()),
                    Stage::Forward,
                    format!("sos payload unreadable: {e}"),
                ));
                false
            }
        }
    }
}

struct EngineState {
    node_id: Option<String>,
    started: bool,
    ingress: Option<Arc<IngressHandler>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

pub struct MeshEngine {
    config: EngineConfig,
    link: Arc<dyn LinkLayer>,
    clock: Arc<dyn Clock>,

    seen: Arc<SeenCache>,
    outbox: Arc<Outbox>,
    ledger: Arc<UploadLedger>,
    probe: Arc<ConnectivityProbe>,
    roles: Arc<RoleController>,
    relay: Arc<RelayOrchestrator>,
    uploader: Arc<GatewayUploader>,

    sos_tx: broadcast::Sender<ReceivedSos>,
    relay_log_tx: broadcast::Sender<RelayedPacket>,
    forwards_tx: broadcast::Sender<String>,
    activity_tx: broadcast::Sender<RelayActivity>,
    diagnostics_tx: broadcast::Sender<Diagnostic>,
    neighbors_tx: watch::Sender<Vec<NodeInfo>>,

    state: Mutex<EngineState>,
}

impl MeshEngine {
    pub fn new(config: EngineConfig, adapters: EngineAdapters) -> Arc<Self> {
        let EngineAdapters {
            link,
            storage,
            cloud,
            probe_transport,
            clock,
            battery,
            location,
        } = adapters;

        let capacity = config.tuning.stream_capacity;
        let (sos_tx, _) = broadcast::channel(capacity);
        let (relay_log_tx, _) = broadcast::channel(capacity);
        let (forwards_tx, _) = broadcast::channel(capacity);
        let (activity_tx, _) = broadcast::channel(capacity);
        let (diagnostics_tx, _) = broadcast::channel(capacity);
        let (neighbors_tx, _) = watch::channel(Vec::new());

        let seen = Arc::new(SeenCache::new(config.tuning.seen_cache_capacity));
        let outbox = Arc::new(Outbox::new(
            storage.clone(),
            clock.clone(),
            config.retry.clone(),
        ));
        let ledger = Arc::new(UploadLedger::new(storage));
        let probe = Arc::new(ConnectivityProbe::new(
            probe_transport,
            clock.clone(),
            config.probe.clone(),
        ));
        let roles = Arc::new(RoleController::new(
            link.clone(),
            battery,
            location,
            clock.clone(),
            config.tuning.min_relay_battery,
        ));

        let goal: Arc<dyn GoalDelivery> = Arc::new(LocalGoalDelivery {
            probe: probe.clone(),
            clock: clock.clone(),
            sos_tx: sos_tx.clone(),
            diagnostics_tx: diagnostics_tx.clone(),
        });
        let relay = Arc::new(RelayOrchestrator::new(
            link.clone(),
            outbox.clone(),
            NeighborRouter::new(config.router.clone()),
            clock.clone(),
            config.relay.clone(),
            config.tuning.sent_retention,
            Some(goal),
            activity_tx.clone(),
            diagnostics_tx.clone(),
        ));
        let uploader = Arc::new(GatewayUploader::new(
            outbox.clone(),
            ledger.clone(),
            cloud,
            probe.clone(),
            clock.clone(),
            config.upload.clone(),
            diagnostics_tx.clone(),
        ));

        Arc::new(Self {
            config,
            link,
            clock,
            seen,
            outbox,
            ledger,
            probe,
            roles,
            relay,
            uploader,
            sos_tx,
            relay_log_tx,
            forwards_tx,
            activity_tx,
            diagnostics_tx,
            neighbors_tx,
            state: Mutex::new(EngineState {
                node_id: None,
                started: false,
                ingress: None,
                tasks: Vec::new(),
            }),
        })
    }

    // =========================================================================
    // COMMANDS
    // =========================================================================

    /// Bind the engine to a node identity, prepare the link layer, and
    /// restore durable state.
    pub async fn initialize(&self, node_id: &str) -> Result<(), EngineError> {
        if node_id.is_empty() {
            return Err(EngineError::Validation("node id must not be empty".into()));
        }
        let mut state = self.state.lock().await;
        if state.started {
            return Err(EngineError::AlreadyStarted);
        }

        self.link.initialize().await?;
        let restored = self.outbox.load().await?;
        let uploaded = self.ledger.load().await?;
        info!(node_id, restored, uploaded, "engine initialized");

        self.roles.set_node_id(node_id).await;
        self.relay.set_node_id(node_id).await;

        state.ingress = Some(Arc::new(IngressHandler::new(
            node_id.to_string(),
            self.seen.clone(),
            self.outbox.clone(),
            self.probe.clone(),
            self.relay.clone(),
            self.clock.clone(),
            self.sos_tx.clone(),
            self.relay_log_tx.clone(),
            self.forwards_tx.clone(),
            self.diagnostics_tx.clone(),
        )));
        state.node_id = Some(node_id.to_string());
        drop(state);

        self.roles.update_metadata().await?;
        Ok(())
    }

    /// Spawn the component tasks and start discovery.
    pub async fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        let node_id = state
            .node_id
            .clone()
            .ok_or(EngineError::NotInitialized)?;
        if state.started {
            return Err(EngineError::AlreadyStarted);
        }
        let ingress = state.ingress.clone().ok_or(EngineError::NotInitialized)?;

        self.link.start_discovery().await?;
        self.relay.start(&node_id).await?;

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(self.probe.clone().run()));
        tasks.push(tokio::spawn(self.uploader.clone().run()));
        tasks.push(tokio::spawn(ingress.run(self.link.subscribe_frames())));
        tasks.push(tokio::spawn(
            self.clone().watch_neighbors(self.link.subscribe_neighbors()),
        ));
        tasks.push(tokio::spawn(
            self.clone().watch_connectivity(self.probe.subscribe()),
        ));
        tasks.push(tokio::spawn(self.clone().maintenance_loop()));
        state.tasks = tasks;
        state.started = true;
        info!(node_id, "engine started");
        Ok(())
    }

    /// Stop the tasks and discovery. Durable state stays put; `start` may
    /// be called again.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if !state.started {
            return;
        }
        state.started = false;
        for task in state.tasks.drain(..) {
            task.abort();
        }
        drop(state);

        self.relay.stop().await;
        if let Err(e) = self.link.stop_discovery().await {
            warn!(error = %e, "stop_discovery failed");
        }
        info!("engine stopped");
    }

    /// Originate an SOS. Marks this node a sender, queues the packet, and
    /// tries an immediate forward. Always returns the packet id: a victim
    /// whose first send attempt fails still has a queued SOS.
    pub async fn send_sos(&self, payload: SosPayload) -> Result<String, EngineError> {
        let node_id = {
            let state = self.state.lock().await;
            state.node_id.clone().ok_or(EngineError::NotInitialized)?
        };

        let packet_id = new_packet_id();
        let mut sos = payload;
        if sos.sos_id.is_empty() {
            sos.sos_id = packet_id.clone();
        }
        if sos.sender_id.is_empty() {
            sos.sender_id = node_id.clone();
        }
        if sos.timestamp_ms == 0 {
            sos.timestamp_ms = self.clock.now_ms();
        }

        if let Err(e) = self.roles.mark_sender().await {
            // The SOS matters more than the advertisement.
            warn!(error = %e, "advertising sender role failed");
        }
        if let Err(e) = self.roles.set_triage(sos.triage_level).await {
            warn!(error = %e, "advertising triage failed");
        }

        let packet = MeshPacket::from_parts(
            packet_id.clone(),
            node_id.clone(),
            PacketType::Sos,
            Priority::Critical,
            sos.to_json(),
            vec![node_id],
            DEFAULT_TTL,
            self.clock.now_ms(),
        )
        .map_err(|e| EngineError::Validation(e.to_string()))?;

        self.seen.mark(packet.id());
        self.outbox.add(packet.clone()).await?;
        info!(packet_id = packet.id(), "sos queued");

        if self.relay.try_forward_now(&packet).await {
            let _ = self.forwards_tx.send(packet.id().to_string());
        }
        Ok(packet_id)
    }

    /// Recompute and re-advertise the local metadata record.
    pub async fn update_metadata(&self) -> Result<(), EngineError> {
        {
            let state = self.state.lock().await;
            if state.node_id.is_none() {
                return Err(EngineError::NotInitialized);
            }
        }
        self.roles.update_metadata().await?;
        Ok(())
    }

    /// Nudge the orchestrator into an immediate drain pass.
    pub fn force_relay(&self) {
        self.relay.force_relay();
    }

    /// Clear the sticky sender role once the host decides the emergency is
    /// over.
    pub async fn reset_role(&self) -> Result<(), EngineError> {
        self.roles.reset_role().await?;
        Ok(())
    }

    // =========================================================================
    // STREAMS
    // =========================================================================

    /// SOS packets that terminated at this node (goal path).
    pub fn sos_alerts(&self) -> broadcast::Receiver<ReceivedSos> {
        self.sos_tx.subscribe()
    }

    /// Packets passing through in transit.
    pub fn relay_log(&self) -> broadcast::Receiver<RelayedPacket> {
        self.relay_log_tx.subscribe()
    }

    /// Ids forwarded immediately on ingress or at origination.
    pub fn immediate_forwards(&self) -> broadcast::Receiver<String> {
        self.forwards_tx.subscribe()
    }

    /// Latest neighbor snapshot.
    pub fn neighbors(&self) -> watch::Receiver<Vec<NodeInfo>> {
        self.neighbors_tx.subscribe()
    }

    /// Orchestrator counters snapshot.
    pub fn relay_stats(&self) -> watch::Receiver<RelayStats> {
        self.relay.stats()
    }

    /// Orchestrator decision points.
    pub fn relay_activity(&self) -> broadcast::Receiver<RelayActivity> {
        self.activity_tx.subscribe()
    }

    /// Every recovered or surfaced error.
    pub fn relay_diagnostics(&self) -> broadcast::Receiver<Diagnostic> {
        self.diagnostics_tx.subscribe()
    }

    /// Connectivity transitions, `true` on offline→online.
    pub fn connectivity_changes(&self) -> broadcast::Receiver<bool> {
        self.probe.subscribe()
    }

    /// Ingress drop counters for the host's diagnostics pane.
    pub async fn counters(&self) -> IngressCounters {
        let state = self.state.lock().await;
        state
            .ingress
            .as_ref()
            .map(|i| i.counters())
            .unwrap_or_default()
    }

    pub async fn node_id(&self) -> Option<String> {
        self.state.lock().await.node_id.clone()
    }

    /// Total records delivered to the cloud sink by this node.
    pub fn uploaded_total(&self) -> u64 {
        self.uploader.uploaded_total()
    }

    /// Platform hook: forward network interface change events to the probe.
    pub fn notify_network_change(&self) {
        self.probe.notify_network_change();
    }

    // =========================================================================
    // BACKGROUND TASKS
    // =========================================================================

    /// Mirror link-layer snapshots into the public watch, dropping peers
    /// past the eviction threshold, and nudge the orchestrator when a
    /// neighbor set appears while packets wait.
    async fn watch_neighbors(
        self: Arc<Self>,
        mut rx: broadcast::Receiver<Vec<NodeInfo>>,
    ) {
        let mut was_empty = true;
        loop {
            let list = match rx.recv().await {
                Ok(list) => list,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let now = self.clock.now_ms();
            let eviction_ms = self.config.tuning.neighbor_eviction.as_millis() as i64;
            let list: Vec<NodeInfo> = list
                .into_iter()
                .filter(|n| now - n.last_seen_ms <= eviction_ms)
                .collect();

            let became_nonempty = was_empty && !list.is_empty();
            was_empty = list.is_empty();
            // send_replace so late subscribers observe the current snapshot.
            self.neighbors_tx.send_replace(list);

            if became_nonempty && self.outbox.stats().await.pending > 0 {
                self.relay.nudge();
            }
        }
    }

    /// Apply connectivity transitions to the role projection and wake the
    /// orchestrator so queued SOS packets reach `sos_alerts` promptly.
    async fn watch_connectivity(self: Arc<Self>, mut rx: broadcast::Receiver<bool>) {
        loop {
            match rx.recv().await {
                Ok(online) => {
                    if let Err(e) = self.roles.set_internet(online).await {
                        warn!(error = %e, "advertising connectivity change failed");
                    }
                    if online {
                        self.relay.nudge();
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Periodic housekeeping: refresh the advertisement (battery drains,
    /// GPS moves) and let the link layer drop stale peer records.
    async fn maintenance_loop(self: Arc<Self>) {
        loop {
            self.clock
                .sleep(std::time::Duration::from_secs(60))
                .await;
            self.link.cleanup_stale().await;
            if let Err(e) = self.roles.update_metadata().await {
                warn!(error = %e, "metadata refresh failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{
        CloudResponse, FixedBattery, FixedLocation, InboundFrame, ManualClock,
    };
    use crate::error::{CloudError, LinkError};
    use crate::store::MemoryStorage;
    use crate::types::{EmergencyType, TriageLevel};
    use std::collections::HashMap;
    use std::time::Duration;

    struct NullLink {
        neighbors_tx: broadcast::Sender<Vec<NodeInfo>>,
        frames_tx: broadcast::Sender<InboundFrame>,
    }

    impl NullLink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                neighbors_tx: broadcast::channel(8).0,
                frames_tx: broadcast::channel(8).0,
            })
        }
    }

    #[async_trait]
    impl LinkLayer for NullLink {
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
            Vec::new()
        }
        async fn connect_and_send(&self, _a: &str, _b: &[u8]) -> Result<(), LinkError> {
            Err(LinkError::ConnectionRefused)
        }
        fn signal_strength_dbm(&self) -> i32 {
            -60
        }
        async fn cleanup_stale(&self) {}
        async fn shutdown(&self) {}
    }

    struct NullSink;

    #[async_trait]
    impl CloudSink for NullSink {
        async fn post(
            &self,
            _body: serde_json::Value,
            _timeout: Duration,
        ) -> Result<CloudResponse, CloudError> {
            Ok(CloudResponse {
                status: 200,
                body: String::new(),
            })
        }
    }

    struct OfflineProbe;

    #[async_trait]
    impl ProbeTransport for OfflineProbe {
        async fn fetch_status(&self, _url: &str, _t: Duration) -> Result<u16, CloudError> {
            Err(CloudError::Network("no route".into()))
        }
    }

    fn make_engine() -> Arc<MeshEngine> {
        MeshEngine::new(
            EngineConfig::default(),
            EngineAdapters {
                link: NullLink::new(),
                storage: Arc::new(MemoryStorage::new()),
                cloud: Arc::new(NullSink),
                probe_transport: Arc::new(OfflineProbe),
                clock: Arc::new(ManualClock::new(1_700_000_000_000)),
                battery: Arc::new(FixedBattery(90)),
                location: Arc::new(FixedLocation(None)),
            },
        )
    }

    fn make_payload() -> SosPayload {
        SosPayload {
            sos_id: String::new(),
            sender_id: String::new(),
            sender_name: "Alice".into(),
            latitude: 12.9,
            longitude: 77.6,
            location_accuracy_m: 5.0,
            emergency_type: EmergencyType::Trapped,
            triage_level: TriageLevel::Red,
            number_of_people: 3,
            medical_conditions: Default::default(),
            required_supplies: Default::default(),
            additional_notes: String::new(),
            contact_phone: None,
            timestamp_ms: 0,
            is_active: true,
        }
    }

    #[tokio::test]
    async fn commands_require_initialize() {
        let engine = make_engine();
        assert!(matches!(
            engine.send_sos(make_payload()).await,
            Err(EngineError::NotInitialized)
        ));
        assert!(matches!(
            engine.start().await,
            Err(EngineError::NotInitialized)
        ));
        assert!(matches!(
            engine.update_metadata().await,
            Err(EngineError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let engine = make_engine();
        engine.initialize("A").await.unwrap();
        engine.start().await.unwrap();
        assert!(matches!(
            engine.start().await,
            Err(EngineError::AlreadyStarted)
        ));
        engine.stop().await;
    }

    #[tokio::test]
    async fn initialize_rejects_empty_node_id() {
        let engine = make_engine();
        assert!(matches!(
            engine.initialize("").await,
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn send_sos_queues_and_fills_payload_ids() {
        let engine = make_engine();
        engine.initialize("A").await.unwrap();

        let id = engine.send_sos(make_payload()).await.unwrap();
        assert_eq!(id.len(), 32);

        let entry = engine.outbox.get(&id).await.unwrap();
        assert!(entry.packet.is_sos());
        assert_eq!(entry.packet.trace(), &["A".to_string()]);
        assert_eq!(entry.packet.priority(), Priority::Critical);
        let sos = SosPayload::from_json(entry.packet.payload()).unwrap();
        assert_eq!(sos.sos_id, id);
        assert_eq!(sos.sender_id, "A");
        assert!(sos.timestamp_ms > 0);

        // Originating marks the node a sender.
        assert_eq!(
            engine.roles.advertised_role().await,
            crate::types::NodeRole::Sender
        );
    }

    #[tokio::test]
    async fn send_sos_survives_unreachable_neighbors() {
        let engine = make_engine();
        engine.initialize("A").await.unwrap();
        // NullLink refuses every connection; the SOS must still queue.
        let id = engine.send_sos(make_payload()).await.unwrap();
        assert_eq!(engine.outbox.stats().await.pending, 1);
        assert!(engine.outbox.get(&id).await.is_some());
    }

    #[tokio::test]
    async fn stop_then_start_again() {
        let engine = make_engine();
        engine.initialize("A").await.unwrap();
        engine.start().await.unwrap();
        engine.stop().await;
        engine.start().await.unwrap();
        engine.stop().await;
    }
}
