//! RescueNet field-test host.
//!
//! Embeds the mesh engine with a LAN adapter: UDP beacons carry the
//! advertisement record, TCP carries length-prefixed packet frames with a
//! one-byte ACK/NAK answer. Good enough to exercise a real multi-machine
//! mesh on one subnet; production hosts supply their own radio shim.

mod adapters;
mod config;
mod error;
mod mesh;
mod store;
mod types;

use crate::config::EngineConfig;
use crate::adapters::{
    FixedBattery, FixedLocation, GeoFix, HttpCloudSink, HttpProbeTransport, InboundFrame,
    LinkLayer, SystemClock,
};
use crate::error::{EngineError, LinkError};
use crate::mesh::{codec, EngineAdapters, MeshEngine};
use crate::store::SledStorage;
use crate::types::{EmergencyType, NodeInfo, SosPayload, TriageLevel};
use async_trait::async_trait;
use clap::Parser;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

// Exit codes when embedded in a shell pipeline.
const EXIT_USAGE: i32 = 64;
const EXIT_IOERR: i32 = 74;
const EXIT_TEMPFAIL: i32 = 75;

/// How often the UDP beacon repeats the current advertisement.
const BEACON_INTERVAL_SECS: u64 = 5;

#[derive(Parser)]
#[command(name = "rescuenet", version, about = "RescueNet mesh engine test host")]
struct Args {
    /// Node id (defaults to a random identifier)
    #[arg(short, long)]
    node_id: Option<String>,

    /// Human-readable display name
    #[arg(long, default_value = "")]
    name: String,

    /// TCP port for packet frames
    #[arg(short, long, default_value_t = codec::DEFAULT_TRANSPORT_PORT)]
    port: u16,

    /// UDP port for advertisement beacons
    #[arg(long, default_value_t = 8889)]
    advert_port: u16,

    /// Data directory for the durable outbox and upload ledger
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Cloud sink endpoint for SOS records
    #[arg(long, default_value = "http://localhost:9000/api/sos")]
    cloud_url: String,

    /// Battery percentage to advertise (no telemetry on a laptop)
    #[arg(long, default_value_t = 100)]
    battery: u8,

    /// Latitude to advertise
    #[arg(long)]
    lat: Option<f64>,

    /// Longitude to advertise
    #[arg(long)]
    lng: Option<f64>,

    /// Send a test SOS right after startup, with this note
    #[arg(long)]
    send_sos: Option<String>,

    /// Triage level for the test SOS: n, g, y, r
    #[arg(long, default_value = "r")]
    triage: String,
}

// =============================================================================
// LAN LINK LAYER
// =============================================================================

struct LanState {
    record: HashMap<String, String>,
    neighbors: HashMap<String, NodeInfo>,
    discovering: bool,
}

/// UDP-beacon discovery + TCP frame transport on one subnet.
struct LanLinkLayer {
    tcp_port: u16,
    advert_port: u16,
    bound: AtomicBool,
    state: Mutex<LanState>,
    neighbors_tx: broadcast::Sender<Vec<NodeInfo>>,
    frames_tx: broadcast::Sender<InboundFrame>,
}

impl LanLinkLayer {
    fn new(tcp_port: u16, advert_port: u16) -> Arc<Self> {
        Arc::new(Self {
            tcp_port,
            advert_port,
            bound: AtomicBool::new(false),
            state: Mutex::new(LanState {
                record: HashMap::new(),
                neighbors: HashMap::new(),
                discovering: false,
            }),
            neighbors_tx: broadcast::channel(32).0,
            frames_tx: broadcast::channel(256).0,
        })
    }

    /// Bind the sockets and spawn the adapter tasks. Host-side setup; the
    /// engine's `initialize` only verifies this ran.
    async fn bind(self: &Arc<Self>) -> Result<(), LinkError> {
        let listener = TcpListener::bind(("0.0.0.0", self.tcp_port))
            .await
            .map_err(|e| LinkError::Io(e.to_string()))?;
        let socket = UdpSocket::bind(("0.0.0.0", self.advert_port))
            .await
            .map_err(|e| LinkError::Io(e.to_string()))?;
        socket
            .set_broadcast(true)
            .map_err(|e| LinkError::Io(e.to_string()))?;
        let socket = Arc::new(socket);

        tokio::spawn(self.clone().serve_frames(listener));
        tokio::spawn(self.clone().beacon(socket.clone()));
        tokio::spawn(self.clone().listen_beacons(socket));
        self.bound.store(true, Ordering::SeqCst);
        info!(tcp = self.tcp_port, udp = self.advert_port, "LAN link ready");
        Ok(())
    }

    /// Accept loop: one frame per connection, ACK on decode, NAK otherwise.
    async fn serve_frames(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let link = self.clone();
            tokio::spawn(async move {
                if let Err(e) = link.receive_frame(stream, peer).await {
                    debug!(peer = %peer, error = %e, "inbound frame failed");
                }
            });
        }
    }

    async fn receive_frame(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> std::io::Result<()> {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await?;
        let len = match codec::frame_len(header) {
            Ok(len) => len,
            Err(_) => {
                stream.write_all(&[codec::NAK]).await?;
                return Ok(());
            }
        };
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;

        // Validate before acknowledging; the sender retries on NAK.
        if codec::decode(&payload, types::now_ms()).is_err() {
            stream.write_all(&[codec::NAK]).await?;
            return Ok(());
        }
        stream.write_all(&[codec::ACK]).await?;

        let _ = self.frames_tx.send(InboundFrame {
            sender_address: peer.to_string(),
            bytes: payload,
        });
        Ok(())
    }

    /// Rebroadcast the advertisement every few seconds while discovery is
    /// on.
    async fn beacon(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let target = format!("255.255.255.255:{}", self.advert_port);
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(BEACON_INTERVAL_SECS)).await;
            let record = {
                let state = self.state.lock().await;
                if !state.discovering || state.record.is_empty() {
                    continue;
                }
                let mut record = state.record.clone();
                record.insert("port".to_string(), self.tcp_port.to_string());
                record
            };
            match serde_json::to_vec(&record) {
                Ok(bytes) => {
                    if let Err(e) = socket.send_to(&bytes, &target).await {
                        debug!(error = %e, "beacon send failed");
                    }
                }
                Err(e) => warn!(error = %e, "beacon encode failed"),
            }
        }
    }

    /// Listen for peer beacons and fold them into the neighbor set.
    async fn listen_beacons(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut buf = vec![0u8; 4096];
        loop {
            let (len, src) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!(error = %e, "beacon recv failed");
                    continue;
                }
            };
            let Ok(record) = serde_json::from_slice::<HashMap<String, String>>(&buf[..len])
            else {
                continue;
            };
            let port = record
                .get("port")
                .and_then(|p| p.parse::<u16>().ok())
                .unwrap_or(codec::DEFAULT_TRANSPORT_PORT);
            let address = format!("{}:{}", src.ip(), port);
            let now = types::now_ms();
            let Some(node) = NodeInfo::from_advertisement(&address, &record, now) else {
                continue;
            };

            let mut state = self.state.lock().await;
            // Our own broadcast loops back; no point listing ourselves.
            if Some(&node.id) == state.record.get("id") {
                continue;
            }
            state.neighbors.insert(node.id.clone(), node);
            let snapshot: Vec<NodeInfo> = state.neighbors.values().cloned().collect();
            drop(state);
            let _ = self.neighbors_tx.send(snapshot);
        }
    }
}

#[async_trait]
impl LinkLayer for LanLinkLayer {
    async fn initialize(&self) -> Result<(), LinkError> {
        if self.bound.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LinkError::Io("LAN sockets not bound".into()))
        }
    }

    async fn advertise(&self, record: HashMap<String, String>) -> Result<(), LinkError> {
        self.state.lock().await.record = record;
        Ok(())
    }

    async fn start_discovery(&self) -> Result<(), LinkError> {
        self.state.lock().await.discovering = true;
        Ok(())
    }

    async fn stop_discovery(&self) -> Result<(), LinkError> {
        self.state.lock().await.discovering = false;
        Ok(())
    }

    fn subscribe_neighbors(&self) -> broadcast::Receiver<Vec<NodeInfo>> {
        self.neighbors_tx.subscribe()
    }

    fn subscribe_frames(&self) -> broadcast::Receiver<InboundFrame> {
        self.frames_tx.subscribe()
    }

    async fn current_neighbors(&self) -> Vec<NodeInfo> {
        self.state.lock().await.neighbors.values().cloned().collect()
    }

    async fn connect_and_send(&self, address: &str, bytes: &[u8]) -> Result<(), LinkError> {
        let mut stream = TcpStream::connect(address).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                LinkError::ConnectionRefused
            } else {
                LinkError::Io(e.to_string())
            }
        })?;
        stream
            .write_all(&codec::frame(bytes))
            .await
            .map_err(|e| LinkError::Io(e.to_string()))?;

        let mut answer = [0u8; 1];
        stream
            .read_exact(&mut answer)
            .await
            .map_err(|e| LinkError::Io(e.to_string()))?;
        match answer[0] {
            codec::ACK => Ok(()),
            other => Err(LinkError::InvalidAck(other)),
        }
    }

    fn signal_strength_dbm(&self) -> i32 {
        // Wired LAN: report a healthy constant.
        -55
    }

    async fn cleanup_stale(&self) {
        let now = types::now_ms();
        let mut state = self.state.lock().await;
        let before = state.neighbors.len();
        state.neighbors.retain(|_, n| !n.is_stale(now));
        if state.neighbors.len() != before {
            let snapshot: Vec<NodeInfo> = state.neighbors.values().cloned().collect();
            drop(state);
            let _ = self.neighbors_tx.send(snapshot);
        }
    }

    async fn shutdown(&self) {
        self.state.lock().await.discovering = false;
    }
}

// =============================================================================
// HOST
// =============================================================================

fn exit_code_for(error: &EngineError) -> i32 {
    match error {
        EngineError::Validation(_) => EXIT_USAGE,
        EngineError::Storage(_) => EXIT_IOERR,
        EngineError::LinkLayer(_) => EXIT_TEMPFAIL,
        EngineError::NotInitialized | EngineError::AlreadyStarted => EXIT_USAGE,
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rescuenet=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let node_id = args
        .node_id
        .clone()
        .unwrap_or_else(|| types::new_packet_id()[..8].to_string());
    let Some(triage) = TriageLevel::from_code(&args.triage) else {
        error!("invalid triage code `{}`, use n/g/y/r", args.triage);
        std::process::exit(EXIT_USAGE);
    };

    info!("RescueNet v{VERSION}, node {node_id}");

    if let Err(e) = std::fs::create_dir_all(&args.data_dir) {
        error!(error = %e, "cannot create data directory");
        std::process::exit(EXIT_IOERR);
    }
    let storage = match SledStorage::open(&args.data_dir) {
        Ok(storage) => Arc::new(storage),
        Err(e) => {
            error!(error = %e, "cannot open storage");
            std::process::exit(EXIT_IOERR);
        }
    };

    let link = LanLinkLayer::new(args.port, args.advert_port);
    if let Err(e) = link.bind().await {
        error!(error = %e, "cannot bind LAN link");
        std::process::exit(EXIT_TEMPFAIL);
    }

    let location = match (args.lat, args.lng) {
        (Some(latitude), Some(longitude)) => Some(GeoFix {
            latitude,
            longitude,
            accuracy_m: 10.0,
        }),
        _ => None,
    };

    let engine = MeshEngine::new(
        EngineConfig::default(),
        EngineAdapters {
            link,
            storage,
            cloud: Arc::new(HttpCloudSink::new(args.cloud_url.clone())),
            probe_transport: Arc::new(HttpProbeTransport::new()),
            clock: Arc::new(SystemClock),
            battery: Arc::new(FixedBattery(args.battery)),
            location: Arc::new(FixedLocation(location)),
        },
    );

    if let Err(e) = engine.initialize(&node_id).await {
        error!(error = %e, "initialize failed");
        std::process::exit(exit_code_for(&e));
    }
    if let Err(e) = engine.start().await {
        error!(error = %e, "start failed");
        std::process::exit(exit_code_for(&e));
    }

    // Print incoming SOS alerts (goal path) and relayed traffic.
    let mut alerts = engine.sos_alerts();
    tokio::spawn(async move {
        while let Ok(alert) = alerts.recv().await {
            info!(
                "SOS from {} at ({:.4}, {:.4}): {:?}, {} people, trace {:?}",
                alert.sos.sender_name,
                alert.sos.latitude,
                alert.sos.longitude,
                alert.sos.emergency_type,
                alert.sos.number_of_people,
                alert.packet.trace(),
            );
        }
    });
    let mut relayed = engine.relay_log();
    tokio::spawn(async move {
        while let Ok(entry) = relayed.recv().await {
            info!(
                "relaying {} (hop {} from {})",
                entry.packet.id(),
                entry.packet.hop_count(),
                entry.sender_address,
            );
        }
    });

    if let Some(note) = args.send_sos {
        let payload = SosPayload {
            sos_id: String::new(),
            sender_id: String::new(),
            sender_name: if args.name.is_empty() {
                node_id.clone()
            } else {
                args.name.clone()
            },
            latitude: args.lat.unwrap_or(0.0),
            longitude: args.lng.unwrap_or(0.0),
            location_accuracy_m: 10.0,
            emergency_type: EmergencyType::Other,
            triage_level: triage,
            number_of_people: 1,
            medical_conditions: Default::default(),
            required_supplies: Default::default(),
            additional_notes: note,
            contact_phone: None,
            timestamp_ms: 0,
            is_active: true,
        };
        match engine.send_sos(payload).await {
            Ok(id) => info!(packet_id = %id, "test SOS queued"),
            Err(e) => {
                error!(error = %e, "send_sos failed");
                engine.stop().await;
                std::process::exit(exit_code_for(&e));
            }
        }
    }

    // Periodic status line.
    let status_engine = engine.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            let stats = status_engine.relay_stats().borrow().clone();
            let neighbors = status_engine.neighbors().borrow().len();
            info!(
                "status: {} neighbors | {} pending | {} sent | {} uploaded",
                neighbors,
                stats.pending_count,
                stats.packets_sent,
                status_engine.uploaded_total(),
            );
        }
    });

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    engine.stop().await;
    std::process::exit(0);
}
