//! Shared test harness: an in-process link hub, a scripted probe transport,
//! a recording cloud sink, and a manual clock, wired into full engines.

use async_trait::async_trait;
use rescuenet::adapters::{
    CloudResponse, CloudSink, FixedBattery, FixedLocation, InboundFrame, LinkLayer,
    ManualClock, ProbeTransport, Storage,
};
use rescuenet::error::{CloudError, LinkError};
use rescuenet::mesh::{EngineAdapters, MeshEngine};
use rescuenet::store::MemoryStorage;
use rescuenet::types::{
    EmergencyType, MeshPacket, NodeInfo, NodeRole, SosPayload, TriageLevel,
};
use rescuenet::EngineConfig;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

// =============================================================================
// LINK HUB
// =============================================================================

/// Routes frames between attached links by address.
#[derive(Default)]
pub struct Hub {
    ports: Mutex<HashMap<String, broadcast::Sender<InboundFrame>>>,
}

impl Hub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn deliver(&self, to: &str, from: &str, bytes: Vec<u8>) -> Result<(), LinkError> {
        let ports = self.ports.lock().unwrap();
        let Some(port) = ports.get(to) else {
            return Err(LinkError::ConnectionRefused);
        };
        port.send(InboundFrame {
            sender_address: from.to_string(),
            bytes,
        })
        .map_err(|_| LinkError::ConnectionRefused)?;
        Ok(())
    }
}

/// One node's view of the hub. Neighbor sets are scripted per test so each
/// topology is explicit.
pub struct HubLink {
    pub address: String,
    hub: Arc<Hub>,
    down: AtomicBool,
    neighbors: Mutex<Vec<NodeInfo>>,
    neighbors_tx: broadcast::Sender<Vec<NodeInfo>>,
    frames_tx: broadcast::Sender<InboundFrame>,
}

impl HubLink {
    pub fn attach(hub: &Arc<Hub>, address: &str) -> Arc<Self> {
        let frames_tx = broadcast::channel(256).0;
        hub.ports
            .lock()
            .unwrap()
            .insert(address.to_string(), frames_tx.clone());
        Arc::new(Self {
            address: address.to_string(),
            hub: hub.clone(),
            down: AtomicBool::new(false),
            neighbors: Mutex::new(Vec::new()),
            neighbors_tx: broadcast::channel(32).0,
            frames_tx,
        })
    }

    pub fn set_neighbors(&self, list: Vec<NodeInfo>) {
        *self.neighbors.lock().unwrap() = list.clone();
        let _ = self.neighbors_tx.send(list);
    }

    /// Drop a crafted frame straight into this node's receive path.
    pub fn inject_frame(&self, from: &str, bytes: Vec<u8>) {
        let _ = self.frames_tx.send(InboundFrame {
            sender_address: from.to_string(),
            bytes,
        });
    }

    /// Simulate the radio going quiet: sends from this node start failing.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

#[async_trait]
impl LinkLayer for HubLink {
    async fn initialize(&self) -> Result<(), LinkError> {
        Ok(())
    }
    async fn advertise(&self, _record: HashMap<String, String>) -> Result<(), LinkError> {
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
        if self.down.load(Ordering::SeqCst) {
            return Err(LinkError::Timeout);
        }
        self.hub.deliver(address, &self.address, bytes.to_vec())
    }
    fn signal_strength_dbm(&self) -> i32 {
        -50
    }
    async fn cleanup_stale(&self) {}
    async fn shutdown(&self) {}
}

// =============================================================================
// PROBE + SINK STUBS
// =============================================================================

/// Probe endpoint whose status a test flips at will.
pub struct ScriptedProbe {
    status: AtomicU16,
}

impl ScriptedProbe {
    pub fn new(online: bool) -> Arc<Self> {
        Arc::new(Self {
            status: AtomicU16::new(if online { 204 } else { 503 }),
        })
    }

    pub fn set_online(&self, online: bool) {
        self.status
            .store(if online { 204 } else { 503 }, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProbeTransport for ScriptedProbe {
    async fn fetch_status(&self, _url: &str, _t: Duration) -> Result<u16, CloudError> {
        Ok(self.status.load(Ordering::SeqCst))
    }
}

/// Cloud sink that records every body it accepts.
pub struct RecordingSink {
    pub posts: Mutex<Vec<serde_json::Value>>,
    status: AtomicU16,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            posts: Mutex::new(Vec::new()),
            status: AtomicU16::new(200),
        })
    }

    pub fn post_count(&self) -> usize {
        self.posts.lock().unwrap().len()
    }
}

#[async_trait]
impl CloudSink for RecordingSink {
    async fn post(
        &self,
        body: serde_json::Value,
        _timeout: Duration,
    ) -> Result<CloudResponse, CloudError> {
        self.posts.lock().unwrap().push(body);
        Ok(CloudResponse {
            status: self.status.load(Ordering::SeqCst),
            body: String::new(),
        })
    }
}

// =============================================================================
// NODE FIXTURE
// =============================================================================

pub struct TestNode {
    pub engine: Arc<MeshEngine>,
    pub link: Arc<HubLink>,
    pub probe: Arc<ScriptedProbe>,
    pub sink: Arc<RecordingSink>,
}

impl TestNode {
    /// Build, initialize, and start an engine attached to the hub. The
    /// node's link address equals its id.
    pub async fn spawn(hub: &Arc<Hub>, clock: &Arc<ManualClock>, id: &str, online: bool) -> Self {
        let link = HubLink::attach(hub, id);
        let probe = ScriptedProbe::new(online);
        let sink = RecordingSink::new();
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());

        let engine = MeshEngine::new(
            EngineConfig::default(),
            EngineAdapters {
                link: link.clone(),
                storage,
                cloud: sink.clone(),
                probe_transport: probe.clone(),
                clock: clock.clone(),
                battery: Arc::new(FixedBattery(90)),
                location: Arc::new(FixedLocation(None)),
            },
        );
        engine.initialize(id).await.expect("initialize");
        engine.start().await.expect("start");

        Self {
            engine,
            link,
            probe,
            sink,
        }
    }
}

/// A peer as seen in a neighbor snapshot.
pub fn peer(id: &str, internet: bool, last_seen_ms: i64) -> NodeInfo {
    NodeInfo {
        id: id.to_string(),
        device_address: id.to_string(),
        display_name: String::new(),
        battery_level: 80,
        has_internet: internet,
        latitude: 0.0,
        longitude: 0.0,
        last_seen_ms,
        signal_strength_dbm: -50,
        triage_level: TriageLevel::None,
        role: if internet {
            NodeRole::Goal
        } else {
            NodeRole::Relay
        },
        is_available_for_relay: true,
    }
}

pub fn sos_payload(name: &str, triage: TriageLevel) -> SosPayload {
    SosPayload {
        sos_id: String::new(),
        sender_id: String::new(),
        sender_name: name.to_string(),
        latitude: 12.9,
        longitude: 77.6,
        location_accuracy_m: 8.0,
        emergency_type: EmergencyType::Medical,
        triage_level: triage,
        number_of_people: 2,
        medical_conditions: Default::default(),
        required_supplies: Default::default(),
        additional_notes: String::new(),
        contact_phone: None,
        timestamp_ms: 0,
        is_active: true,
    }
}

/// Craft a wire frame for a packet already in flight.
pub fn wire_frame(id: &str, trace: &[&str], ttl: u32, payload: &SosPayload) -> Vec<u8> {
    use rescuenet::types::{PacketType, Priority};
    let packet = MeshPacket::from_parts(
        id.to_string(),
        trace[0].to_string(),
        PacketType::Sos,
        Priority::Critical,
        payload.to_json(),
        trace.iter().map(|s| s.to_string()).collect(),
        ttl,
        1_700_000_000_000,
    )
    .expect("legal packet");
    rescuenet::mesh::codec::encode(&packet)
}

/// Let spawned tasks run, then advance the shared clock so every periodic
/// loop takes a turn. Repeats until `check` passes or attempts run out.
pub async fn settle_until<F>(clock: &Arc<ManualClock>, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        if check() {
            return true;
        }
        clock.advance(11_000);
    }
    false
}
