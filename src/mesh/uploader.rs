//! Gateway uploader: pushes SOS packets to the cloud sink once internet is
//! confirmed, and remembers what was delivered.
//!
//! The upload ledger is disjoint from the outbox on purpose: the outbox
//! tracks mesh delivery, the ledger tracks cloud delivery. A packet can be
//! forwarded on and uploaded by several gateways; each gateway only
//! guarantees it never re-posts an id it already delivered.

use crate::adapters::{Clock, CloudSink, Storage, StoreKind};
use crate::config::UploadConfig;
use crate::error::{CloudError, StorageError};
use crate::mesh::events::{Diagnostic, Stage};
use crate::mesh::outbox::Outbox;
use crate::mesh::probe::ConnectivityProbe;
use crate::types::{MeshPacket, SosPayload, TriageLevel};
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

// =============================================================================
// CLOUD SCHEMA
// =============================================================================

/// Severity vocabulary of the cloud sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Unknown,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "CRITICAL",
            Severity::High => "HIGH",
            Severity::Medium => "MEDIUM",
            Severity::Low => "LOW",
            Severity::Unknown => "UNKNOWN",
        }
    }

    /// Triage → severity. `Medium` is accepted by the sink but no triage
    /// tier maps onto it from the field.
    pub fn from_triage(triage: TriageLevel) -> Self {
        match triage {
            TriageLevel::Red => Severity::Critical,
            TriageLevel::Yellow => Severity::High,
            TriageLevel::Green => Severity::Low,
            TriageLevel::None => Severity::Unknown,
        }
    }
}

/// Build the sink's JSON body for one SOS packet.
pub fn cloud_record(packet: &MeshPacket, sos: &SosPayload) -> serde_json::Value {
    json!({
        "packet_id": packet.id(),
        "victim_name": sos.sender_name,
        "gps_lat": sos.latitude,
        "gps_long": sos.longitude,
        "severity": Severity::from_triage(sos.triage_level).as_str(),
        "emergency_type": sos.emergency_type.as_str(),
        "packet_trace": packet.trace(),
    })
}

// =============================================================================
// UPLOAD LEDGER
// =============================================================================

/// Persistent set of packet ids already delivered to the cloud.
pub struct UploadLedger {
    storage: Arc<dyn Storage>,
    ids: Mutex<HashSet<String>>,
}

impl UploadLedger {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            ids: Mutex::new(HashSet::new()),
        }
    }

    /// Rebuild the in-memory set from the durable store.
    pub async fn load(&self) -> Result<usize, StorageError> {
        let raw = self.storage.scan(StoreKind::UploadLedger).await?;
        let mut ids = self.ids.lock().await;
        ids.clear();
        for (key, _) in raw {
            ids.insert(key);
        }
        Ok(ids.len())
    }

    pub async fn contains(&self, packet_id: &str) -> bool {
        self.ids.lock().await.contains(packet_id)
    }

    /// Record a delivery with its ISO-8601 timestamp. Once an id is here it
    /// is never posted again.
    pub async fn record(&self, packet_id: &str, uploaded_at_ms: i64) -> Result<(), StorageError> {
        let stamp = chrono::DateTime::from_timestamp_millis(uploaded_at_ms)
            .unwrap_or_default()
            .to_rfc3339();
        self.storage
            .put(StoreKind::UploadLedger, packet_id, stamp.into_bytes())
            .await?;
        self.ids.lock().await.insert(packet_id.to_string());
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.ids.lock().await.len()
    }
}

// =============================================================================
// UPLOADER
// =============================================================================

pub struct GatewayUploader {
    outbox: Arc<Outbox>,
    ledger: Arc<UploadLedger>,
    cloud: Arc<dyn CloudSink>,
    probe: Arc<ConnectivityProbe>,
    clock: Arc<dyn Clock>,
    config: UploadConfig,
    diagnostics_tx: broadcast::Sender<Diagnostic>,
    /// Reentrancy guard: at most one sync cycle at a time.
    sync_lock: Mutex<()>,
    uploaded_total: AtomicU64,
}

impl GatewayUploader {
    pub fn new(
        outbox: Arc<Outbox>,
        ledger: Arc<UploadLedger>,
        cloud: Arc<dyn CloudSink>,
        probe: Arc<ConnectivityProbe>,
        clock: Arc<dyn Clock>,
        config: UploadConfig,
        diagnostics_tx: broadcast::Sender<Diagnostic>,
    ) -> Self {
        Self {
            outbox,
            ledger,
            cloud,
            probe,
            clock,
            config,
            diagnostics_tx,
            sync_lock: Mutex::new(()),
            uploaded_total: AtomicU64::new(0),
        }
    }

    pub fn uploaded_total(&self) -> u64 {
        self.uploaded_total.load(Ordering::SeqCst)
    }

    /// Drive sync cycles from online transitions and a periodic tick while
    /// online. Runs until the owning task is aborted.
    pub async fn run(self: Arc<Self>) {
        let mut changes = self.probe.subscribe();
        loop {
            tokio::select! {
                change = changes.recv() => {
                    match change {
                        Ok(true) => {
                            self.sync_pending().await;
                        }
                        Ok(false) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = self.clock.sleep(self.config.sync_interval) => {
                    if self.probe.is_online().await {
                        self.sync_pending().await;
                    }
                }
            }
        }
    }

    /// Upload every SOS outbox entry not yet in the ledger.
    ///
    /// Verifies connectivity with a forced probe first (captive-portal
    /// defense) and aborts the remainder of the batch if the network drops
    /// mid-cycle.
    pub async fn sync_pending(&self) -> usize {
        let Ok(_guard) = self.sync_lock.try_lock() else {
            debug!("sync cycle already running");
            return 0;
        };

        if !self.probe.check(true).await {
            debug!("sync skipped, probe says offline");
            return 0;
        }

        let mut candidates: Vec<MeshPacket> = Vec::new();
        for entry in self.outbox.get_all().await {
            if entry.packet.is_sos() && !self.ledger.contains(entry.packet.id()).await {
                candidates.push(entry.packet);
            }
        }
        candidates.sort_by(|a, b| a.id().cmp(b.id()));
        if candidates.is_empty() {
            return 0;
        }
        info!(count = candidates.len(), "uploading SOS packets to cloud");

        let mut uploaded = 0;
        for (i, packet) in candidates.iter().enumerate() {
            if i > 0 {
                self.clock.sleep(self.config.pacing).await;
            }

            let sos = match SosPayload::from_json(packet.payload()) {
                Ok(sos) => sos,
                Err(e) => {
                    self.diagnose(packet.id(), format!("sos payload unreadable: {e}"));
                    continue;
                }
            };
            let body = cloud_record(packet, &sos);

            match self.cloud.post(body, self.config.request_timeout).await {
                Ok(response) if response.is_success() => {
                    if let Err(e) = self.ledger.record(packet.id(), self.clock.now_ms()).await {
                        // Worst case we re-post next cycle; the sink sees a
                        // duplicate id, not a lost record.
                        warn!(packet_id = packet.id(), error = %e, "ledger write failed");
                    }
                    self.uploaded_total.fetch_add(1, Ordering::SeqCst);
                    uploaded += 1;
                    debug!(packet_id = packet.id(), "uploaded");
                }
                Ok(response) if (400..500).contains(&response.status) => {
                    // Malformed from the sink's point of view; retrying the
                    // identical body cannot help. Not added to the ledger.
                    warn!(
                        packet_id = packet.id(),
                        status = response.status,
                        "cloud rejected record, skipping"
                    );
                    self.diagnose(packet.id(), format!("cloud rejected: {}", response.status));
                }
                Ok(response) => {
                    // 5xx: sink-side trouble, retry next cycle.
                    self.diagnose(packet.id(), format!("cloud error: {}", response.status));
                }
                Err(e @ (CloudError::Timeout | CloudError::Network(_))) => {
                    // The "online" verdict was a false positive or the
                    // uplink just died; stop the batch and force a re-probe.
                    self.diagnose(packet.id(), e.to_string());
                    warn!(error = %e, "connectivity lost mid-batch, aborting sync");
                    self.probe.mark_offline().await;
                    break;
                }
                Err(e) => {
                    self.diagnose(packet.id(), e.to_string());
                }
            }
        }

        uploaded
    }

    fn diagnose(&self, packet_id: &str, detail: impl Into<String>) {
        let _ = self
            .diagnostics_tx
            .send(Diagnostic::new(Some(packet_id), Stage::Upload, detail));
    }
}
