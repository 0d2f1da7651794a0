//! Internet connectivity probe.
//!
//! Authority rule: the node is online only when a known generate-204
//! endpoint actually answers 204 over the external interface. Interface
//! presence and DNS answers both lie behind captive portals, and a false
//! "online" turns a relay into a black hole that claims goal role and then
//! fails to deliver.

use crate::adapters::{Clock, ProbeTransport};
use crate::config::ProbeConfig;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, Notify};
use tracing::{debug, info};

struct ProbeState {
    online: bool,
    checked_at_ms: i64,
    /// No probe has completed yet; the cached verdict is just the default.
    fresh_start: bool,
}

/// Cached connectivity verdict with periodic re-verification.
pub struct ConnectivityProbe {
    transport: Arc<dyn ProbeTransport>,
    clock: Arc<dyn Clock>,
    config: ProbeConfig,
    state: Mutex<ProbeState>,
    changes: broadcast::Sender<bool>,
    recheck: Notify,
}

impl ConnectivityProbe {
    pub fn new(
        transport: Arc<dyn ProbeTransport>,
        clock: Arc<dyn Clock>,
        config: ProbeConfig,
    ) -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            transport,
            clock,
            config,
            state: Mutex::new(ProbeState {
                online: false,
                checked_at_ms: 0,
                fresh_start: true,
            }),
            changes,
            recheck: Notify::new(),
        }
    }

    /// Transition events: `true` on offline→online, `false` the other way.
    pub fn subscribe(&self) -> broadcast::Receiver<bool> {
        self.changes.subscribe()
    }

    /// Last verdict without probing. Callers that must not act on a stale
    /// value use `check(true)` instead.
    pub async fn is_online(&self) -> bool {
        self.state.lock().await.online
    }

    /// Current connectivity. Returns the cached verdict while it is fresh
    /// unless `force` is set; otherwise walks the endpoint list and accepts
    /// the first 204.
    ///
    /// The state lock is held across the probe, which also serializes
    /// concurrent checks: one HTTP round per verdict, not one per caller.
    pub async fn check(&self, force: bool) -> bool {
        let mut state = self.state.lock().await;
        let now = self.clock.now_ms();
        let fresh = !state.fresh_start
            && now - state.checked_at_ms < self.config.cache_window.as_millis() as i64;
        if fresh && !force {
            return state.online;
        }

        let online = self.probe_endpoints().await;
        state.checked_at_ms = self.clock.now_ms();
        let transitioned = state.fresh_start && online || !state.fresh_start && online != state.online;
        state.fresh_start = false;
        if transitioned {
            info!(online, "connectivity changed");
            let _ = self.changes.send(online);
        }
        state.online = online;
        online
    }

    /// Force the cached verdict to offline and request an immediate
    /// re-probe. Used by the uploader when a POST proves the last "online"
    /// was a false positive.
    pub async fn mark_offline(&self) {
        let mut state = self.state.lock().await;
        if state.online || state.fresh_start {
            state.online = false;
            state.fresh_start = false;
            state.checked_at_ms = self.clock.now_ms();
            info!("connectivity marked offline");
            let _ = self.changes.send(false);
        }
        drop(state);
        self.recheck.notify_one();
    }

    /// Platform network-change hook: any interface event forces a re-probe
    /// on the next loop turn.
    pub fn notify_network_change(&self) {
        self.recheck.notify_one();
    }

    /// Periodic probe loop: 30 s while online, 10 s while offline, plus
    /// immediate turns on platform change notifications. Runs until the
    /// owning task is aborted.
    pub async fn run(self: Arc<Self>) {
        loop {
            let interval = if self.is_online().await {
                self.config.interval_online
            } else {
                self.config.interval_offline
            };
            tokio::select! {
                _ = self.clock.sleep(interval) => {}
                _ = self.recheck.notified() => {}
            }
            self.check(true).await;
        }
    }

    async fn probe_endpoints(&self) -> bool {
        for endpoint in &self.config.endpoints {
            match self
                .transport
                .fetch_status(endpoint, self.config.request_timeout)
                .await
            {
                Ok(204) => return true,
                Ok(status) => {
                    // Captive portals answer 200/302 with a login page.
                    debug!(endpoint = %endpoint, status, "probe endpoint did not confirm");
                }
                Err(e) => {
                    debug!(endpoint = %endpoint, error = %e, "probe request failed");
                }
            }
        }
        false
    }
}
