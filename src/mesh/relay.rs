//! Relay orchestrator: the single task that drains the outbox.
//!
//! One cooperative loop owns all forwarding. It wakes on a periodic tick,
//! on `force_relay`, or when neighbors appear while packets wait. At most
//! one outgoing connection is in flight at any time: short-range links are
//! often half-duplex and a second connect in parallel just manufactures
//! BUSY failures.
//!
//! Hop accounting invariant: the outbox always holds the original packet,
//! and exactly one `add_hop` happens per send attempt, inside
//! `attempt_forward`. An immediate forward that fails and is later retried
//! by the tick loop therefore still puts exactly one new hop on the wire.

use crate::adapters::{Clock, LinkLayer};
use crate::config::RelayConfig;
use crate::error::LinkError;
use crate::mesh::codec;
use crate::mesh::events::{Diagnostic, RelayActivity, RelayStats, Stage};
use crate::mesh::outbox::{FailureDisposition, Outbox};
use crate::mesh::router::NeighborRouter;
use crate::types::{MeshPacket, NodeInfo};
use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tracing::{debug, info, warn};

/// Lets the orchestrator hand a queued packet to the local goal path when
/// this node has internet, instead of forwarding it another hop.
#[async_trait]
pub trait GoalDelivery: Send + Sync {
    /// Terminate the packet locally if possible; `true` means it was
    /// delivered to the responder path and needs no forward.
    async fn try_local_goal_deliver(&self, packet: &MeshPacket) -> bool;
}

pub struct RelayOrchestrator {
    link: Arc<dyn LinkLayer>,
    outbox: Arc<Outbox>,
    router: NeighborRouter,
    clock: Arc<dyn Clock>,
    config: RelayConfig,
    sent_retention: Duration,
    goal: Option<Arc<dyn GoalDelivery>>,

    self_id: Mutex<String>,
    running: AtomicBool,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    nudge: Notify,

    packets_sent: AtomicU64,
    transient_failures: AtomicU64,
    permanent_drops: AtomicU64,
    consecutive_failures: AtomicU32,

    stats_tx: watch::Sender<RelayStats>,
    activity_tx: broadcast::Sender<RelayActivity>,
    diagnostics_tx: broadcast::Sender<Diagnostic>,
}

impl RelayOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        link: Arc<dyn LinkLayer>,
        outbox: Arc<Outbox>,
        router: NeighborRouter,
        clock: Arc<dyn Clock>,
        config: RelayConfig,
        sent_retention: Duration,
        goal: Option<Arc<dyn GoalDelivery>>,
        activity_tx: broadcast::Sender<RelayActivity>,
        diagnostics_tx: broadcast::Sender<Diagnostic>,
    ) -> Self {
        let (stats_tx, _) = watch::channel(RelayStats::default());
        Self {
            link,
            outbox,
            router,
            clock,
            config,
            sent_retention,
            goal,
            self_id: Mutex::new(String::new()),
            running: AtomicBool::new(false),
            task: Mutex::new(None),
            nudge: Notify::new(),
            packets_sent: AtomicU64::new(0),
            transient_failures: AtomicU64::new(0),
            permanent_drops: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            stats_tx,
            activity_tx,
            diagnostics_tx,
        }
    }

    pub fn stats(&self) -> watch::Receiver<RelayStats> {
        self.stats_tx.subscribe()
    }

    /// Set the local node id. Called at engine initialize so immediate
    /// forwards work before the tick loop is started.
    pub async fn set_node_id(&self, self_id: &str) {
        *self.self_id.lock().await = self_id.to_string();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the tick loop. Rejects an empty node id, since every hop we
    /// append would be garbage.
    pub async fn start(self: &Arc<Self>, self_id: &str) -> Result<(), LinkError> {
        if self_id.is_empty() {
            return Err(LinkError::Unknown("relay requires a node id".into()));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.set_node_id(self_id).await;

        let orchestrator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            orchestrator.run().await;
        });
        *self.task.lock().await = Some(handle);

        self.emit(RelayActivity::Started);
        self.publish_stats(None, None).await;
        info!(self_id, "relay orchestrator started");
        Ok(())
    }

    /// Cancel the tick loop. Any in-flight connect is aborted with it.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
        self.emit(RelayActivity::Stopped);
        self.publish_stats(None, None).await;
        info!("relay orchestrator stopped");
    }

    /// Run one drain pass as soon as the loop is free.
    pub fn force_relay(&self) {
        self.nudge.notify_one();
    }

    /// Engine hook: neighbors appeared while the outbox is non-empty.
    pub fn nudge(&self) {
        self.nudge.notify_one();
    }

    async fn run(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.clock.sleep(self.config.relay_interval) => {}
                _ = self.nudge.notified() => {}
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            self.tick().await;
        }
    }

    /// One drain pass over the pending outbox, most urgent first.
    pub async fn tick(&self) {
        if let Err(e) = self.outbox.prune_sent(self.sent_retention).await {
            warn!(error = %e, "outbox prune failed");
        }

        let pending = self.outbox.pending_entries().await;
        self.emit(RelayActivity::Checking {
            pending: pending.len(),
        });
        if pending.is_empty() {
            self.publish_stats(Some(0), None).await;
            return;
        }

        let neighbors = self.link.current_neighbors().await;
        if neighbors.is_empty() {
            self.emit(RelayActivity::NoNeighbors);
        }

        let self_id = self.self_id.lock().await.clone();
        for entry in pending {
            let packet = entry.packet;

            // TTL death is a permanent drop, not a send failure.
            if !packet.is_alive() {
                if let Err(e) = self.outbox.remove(packet.id()).await {
                    warn!(error = %e, "failed to drop expired entry");
                }
                self.permanent_drops.fetch_add(1, Ordering::SeqCst);
                self.emit(RelayActivity::Expired {
                    packet_id: packet.id().to_string(),
                });
                self.diagnose(Some(packet.id()), Stage::Forward, "ttl expired in outbox");
                continue;
            }

            // This node may have become a goal since the packet was queued.
            if let Some(goal) = &self.goal {
                if goal.try_local_goal_deliver(&packet).await {
                    if let Err(e) = self.outbox.mark_sent(packet.id()).await {
                        warn!(error = %e, "failed to mark locally delivered entry");
                    }
                    self.packets_sent.fetch_add(1, Ordering::SeqCst);
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                    self.emit(RelayActivity::DeliveredLocal {
                        packet_id: packet.id().to_string(),
                    });
                    continue;
                }
            }

            let now = self.clock.now_ms();
            let Some(target) = self.router.select_best(&neighbors, &packet, &self_id, now)
            else {
                self.transient_failures.fetch_add(1, Ordering::SeqCst);
                self.emit(RelayActivity::NoRoute {
                    packet_id: packet.id().to_string(),
                });
                continue;
            };

            self.emit(RelayActivity::Selected {
                packet_id: packet.id().to_string(),
                target: target.id.clone(),
            });
            self.attempt_forward(&packet, &target).await;

            let failures = self.consecutive_failures.load(Ordering::SeqCst);
            if failures >= self.config.max_consecutive_failures {
                let backoff = self.backoff_delay(failures);
                self.emit(RelayActivity::Paused {
                    backoff_ms: backoff.as_millis() as u64,
                });
                debug!(failures, backoff_ms = backoff.as_millis() as u64, "relay backing off");
                self.clock.sleep(backoff).await;
                break;
            }
        }

        self.publish_stats(None, Some(neighbors.len())).await;
    }

    /// Forward `packet` to `target`: append the local hop (exactly once per
    /// attempt), transmit with a hard timeout, and record the outcome in the
    /// outbox and counters. Returns whether the send succeeded.
    ///
    /// The packet passed in must be the original (no local hop); a packet
    /// that already carries the local id as its last hop is sent as-is.
    pub async fn attempt_forward(&self, packet: &MeshPacket, target: &NodeInfo) -> bool {
        let self_id = self.self_id.lock().await.clone();
        let to_send = if packet.has_visited(&self_id) {
            packet.clone()
        } else {
            match packet.add_hop(&self_id) {
                Ok(p) => p,
                Err(e) => {
                    // Exhausted in the instant between the alive check and
                    // now; account it like any other expiry.
                    if let Err(e) = self.outbox.remove(packet.id()).await {
                        warn!(error = %e, "failed to drop unroutable entry");
                    }
                    self.permanent_drops.fetch_add(1, Ordering::SeqCst);
                    self.emit(RelayActivity::Expired {
                        packet_id: packet.id().to_string(),
                    });
                    self.diagnose(Some(packet.id()), Stage::Forward, e.to_string());
                    return false;
                }
            }
        };

        self.emit(RelayActivity::Connecting {
            target: target.id.clone(),
        });
        let bytes = codec::encode(&to_send);
        let result = tokio::time::timeout(
            self.config.connect_timeout,
            self.link.connect_and_send(&target.device_address, &bytes),
        )
        .await
        .unwrap_or(Err(LinkError::Timeout));

        match result {
            Ok(()) => {
                if let Err(e) = self.outbox.mark_sent(packet.id()).await {
                    warn!(error = %e, "failed to mark sent entry");
                }
                self.packets_sent.fetch_add(1, Ordering::SeqCst);
                self.consecutive_failures.store(0, Ordering::SeqCst);
                self.emit(RelayActivity::Sent {
                    packet_id: packet.id().to_string(),
                    target: target.id.clone(),
                });
                debug!(packet_id = packet.id(), target = %target.id, "forwarded");
                true
            }
            Err(error) => {
                let disposition = self
                    .outbox
                    .mark_failed(packet.id())
                    .await
                    .unwrap_or(FailureDisposition::Permanent);
                match disposition {
                    FailureDisposition::WillRetry => {
                        self.transient_failures.fetch_add(1, Ordering::SeqCst);
                    }
                    FailureDisposition::Permanent => {
                        self.permanent_drops.fetch_add(1, Ordering::SeqCst);
                    }
                }
                self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
                self.emit(RelayActivity::Failed {
                    packet_id: packet.id().to_string(),
                    target: target.id.clone(),
                    error: error.to_string(),
                });
                self.diagnose(Some(packet.id()), Stage::Forward, error.to_string());
                false
            }
        }
    }

    /// Route and forward a single packet right now, outside the tick loop.
    /// Used for immediate forwards on ingress and at SOS origination.
    pub async fn try_forward_now(&self, packet: &MeshPacket) -> bool {
        let neighbors = self.link.current_neighbors().await;
        let self_id = self.self_id.lock().await.clone();
        let now = self.clock.now_ms();
        let Some(target) = self.router.select_best(&neighbors, packet, &self_id, now) else {
            return false;
        };
        let sent = self.attempt_forward(packet, &target).await;
        self.publish_stats(None, Some(neighbors.len())).await;
        sent
    }

    /// Account a packet that died before it could be forwarded (TTL hit
    /// zero on arrival). Used by the ingress path, which never queues it.
    pub async fn account_permanent_drop(&self, packet_id: &str, detail: &str) {
        self.permanent_drops.fetch_add(1, Ordering::SeqCst);
        self.emit(RelayActivity::Expired {
            packet_id: packet_id.to_string(),
        });
        self.diagnose(Some(packet_id), Stage::Forward, detail);
        self.publish_stats(None, None).await;
    }

    /// Exponential backoff with jitter so co-located nodes desynchronize.
    fn backoff_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(self.config.max_consecutive_failures).min(8);
        let base = self.config.backoff_base.as_millis() as u64;
        let cap = self.config.backoff_cap.as_millis() as u64;
        let delay = base.saturating_mul(1 << exponent).min(cap);
        let jitter = rand::thread_rng().gen_range(0..=1000);
        Duration::from_millis(delay + jitter)
    }

    async fn publish_stats(&self, pending: Option<usize>, neighbors: Option<usize>) {
        let pending = match pending {
            Some(n) => n,
            None => self.outbox.stats().await.pending,
        };
        let previous = self.stats_tx.borrow().clone();
        let stats = RelayStats {
            packets_sent: self.packets_sent.load(Ordering::SeqCst),
            transient_failures: self.transient_failures.load(Ordering::SeqCst),
            permanent_drops: self.permanent_drops.load(Ordering::SeqCst),
            pending_count: pending,
            neighbors_count: neighbors.unwrap_or(previous.neighbors_count),
            running: self.running.load(Ordering::SeqCst),
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
        };
        // send_replace: the snapshot must update even with no subscribers,
        // so a late subscriber observes current state.
        self.stats_tx.send_replace(stats);
    }

    fn emit(&self, activity: RelayActivity) {
        let _ = self.activity_tx.send(activity);
    }

    fn diagnose(&self, packet_id: Option<&str>, stage: Stage, detail: impl Into<String>) {
        let _ = self.diagnostics_tx.send(Diagnostic::new(packet_id, stage, detail));
    }
}
