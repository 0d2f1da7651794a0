//! Capability boundaries between the engine and the platform.
//!
//! The engine consumes everything below as `Arc<dyn Trait>`: the link layer
//! (discovery + transport), durable storage, the cloud sink, the clock, and
//! the battery/location telemetry sources. Adapters deliver events through
//! channels and pass immutable snapshots; all engine state stays on the
//! engine side of these seams.

use crate::error::{CloudError, LinkError, StorageError};
use crate::types::NodeInfo;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

// =============================================================================
// LINK LAYER
// =============================================================================

/// A raw frame handed up by the link layer.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    /// Link-layer address of the transmitting peer, opaque to the engine.
    pub sender_address: String,
    /// Unframed payload bytes (the JSON packet, length prefix stripped).
    pub bytes: Vec<u8>,
}

/// Platform-specific peer discovery and transport.
///
/// The engine never touches sockets or radios directly; it advertises a
/// metadata record, observes `NodeInfo` snapshots, and asks the adapter to
/// deliver framed bytes to one address at a time.
#[async_trait]
pub trait LinkLayer: Send + Sync {
    /// Prepare the radio/socket. Called once from `Engine::initialize`.
    async fn initialize(&self) -> Result<(), LinkError>;

    /// Publish the local node record, replacing any prior advertisement.
    async fn advertise(&self, record: HashMap<String, String>) -> Result<(), LinkError>;

    async fn start_discovery(&self) -> Result<(), LinkError>;
    async fn stop_discovery(&self) -> Result<(), LinkError>;

    /// Most recent discovered set. A new value is broadcast whenever the set
    /// changes; late subscribers should also call [`current_neighbors`].
    ///
    /// [`current_neighbors`]: LinkLayer::current_neighbors
    fn subscribe_neighbors(&self) -> broadcast::Receiver<Vec<NodeInfo>>;

    /// Received frames, already deframed by the adapter.
    fn subscribe_frames(&self) -> broadcast::Receiver<InboundFrame>;

    async fn current_neighbors(&self) -> Vec<NodeInfo>;

    /// Connect, transmit framed bytes, await the application-level ACK,
    /// disconnect. Must honor cancellation; if it cannot, the engine treats
    /// a late return as a transient failure.
    async fn connect_and_send(&self, address: &str, bytes: &[u8]) -> Result<(), LinkError>;

    /// Current received-signal estimate in dBm.
    fn signal_strength_dbm(&self) -> i32;

    /// Drop internal records for peers that stopped advertising.
    async fn cleanup_stale(&self);

    async fn shutdown(&self);
}

// =============================================================================
// STORAGE
// =============================================================================

/// The two named keyed stores the engine persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    /// key = packet id, value = encoded `OutboxEntry`
    Outbox,
    /// key = packet id, value = ISO-8601 upload timestamp
    UploadLedger,
}

impl StoreKind {
    pub fn name(&self) -> &'static str {
        match self {
            StoreKind::Outbox => "outbox",
            StoreKind::UploadLedger => "upload_ledger",
        }
    }
}

/// Durable keyed storage. Writes must survive process restart.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn put(&self, store: StoreKind, key: &str, value: Vec<u8>) -> Result<(), StorageError>;
    async fn get(&self, store: StoreKind, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    async fn remove(&self, store: StoreKind, key: &str) -> Result<(), StorageError>;
    /// Full contents of one store, unordered.
    async fn scan(&self, store: StoreKind) -> Result<Vec<(String, Vec<u8>)>, StorageError>;
}

// =============================================================================
// CLOUD SINK
// =============================================================================

/// HTTP-level response from the sink. Non-2xx statuses are data, not errors;
/// only transport failures surface as `Err`.
#[derive(Debug, Clone)]
pub struct CloudResponse {
    pub status: u16,
    pub body: String,
}

impl CloudResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait CloudSink: Send + Sync {
    async fn post(
        &self,
        body: serde_json::Value,
        timeout: Duration,
    ) -> Result<CloudResponse, CloudError>;
}

/// Real sink: `POST <url>` with `Content-Type: application/json`.
pub struct HttpCloudSink {
    client: reqwest::Client,
    url: String,
}

impl HttpCloudSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl CloudSink for HttpCloudSink {
    async fn post(
        &self,
        body: serde_json::Value,
        timeout: Duration,
    ) -> Result<CloudResponse, CloudError> {
        let response = self
            .client
            .post(&self.url)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CloudError::Timeout
                } else {
                    CloudError::Network(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok(CloudResponse { status, body })
    }
}

// =============================================================================
// PROBE TRANSPORT
// =============================================================================

/// One HTTP GET against a connectivity endpoint, returning the status code.
///
/// This is the only thing the connectivity probe trusts: interface presence
/// and DNS answers for IP literals both succeed behind captive portals.
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    async fn fetch_status(&self, url: &str, timeout: Duration) -> Result<u16, CloudError>;
}

/// Real probe transport over reqwest.
pub struct HttpProbeTransport {
    client: reqwest::Client,
}

impl HttpProbeTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpProbeTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProbeTransport for HttpProbeTransport {
    async fn fetch_status(&self, url: &str, timeout: Duration) -> Result<u16, CloudError> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CloudError::Timeout
                } else {
                    CloudError::Network(e.to_string())
                }
            })?;
        Ok(response.status().as_u16())
    }
}

// =============================================================================
// CLOCK
// =============================================================================

/// Time source. Components take the clock as a capability so the test
/// harness can drive the engine deterministically.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by tokio timers.
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        crate::types::now_ms()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Manually driven clock. `sleep` completes only when `advance` is called,
/// whatever duration was requested, so periodic loops tick exactly when the
/// test says so.
pub struct ManualClock {
    now_ms: AtomicI64,
    tick: Notify,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
            tick: Notify::new(),
        }
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
        self.tick.notify_waiters();
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
        self.tick.notify_waiters();
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    async fn sleep(&self, _duration: Duration) {
        self.tick.notified().await;
    }
}

// =============================================================================
// TELEMETRY PROVIDERS
// =============================================================================

/// A GPS fix with horizontal accuracy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoFix {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_m: f64,
}

#[async_trait]
pub trait BatteryProvider: Send + Sync {
    /// Charge level 0–100.
    async fn battery_percent(&self) -> u8;
}

#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// Latest fix, or `None` when the platform has no position yet.
    async fn location(&self) -> Option<GeoFix>;
}

/// Constant battery reading, for hosts without telemetry and for tests.
pub struct FixedBattery(pub u8);

#[async_trait]
impl BatteryProvider for FixedBattery {
    async fn battery_percent(&self) -> u8 {
        self.0
    }
}

/// Constant location, for hosts without a GPS and for tests.
pub struct FixedLocation(pub Option<GeoFix>);

#[async_trait]
impl LocationProvider for FixedLocation {
    async fn location(&self) -> Option<GeoFix> {
        self.0
    }
}
