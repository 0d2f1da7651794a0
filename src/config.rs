//! Engine configuration.
//!
//! Every tunable the components consume lives here with its default and the
//! reasoning behind it. Hosts override fields on [`EngineConfig`] before
//! constructing the engine; components never read ambient globals.

use std::time::Duration;

// =============================================================================
// DEDUP
// =============================================================================

/// Seen-cache capacity. 1000 ids × ~50 bytes ≈ 50 KB, enough to absorb a
/// flood of re-broadcasts from a dense cluster of handsets without letting
/// the cache grow unbounded on a low-memory device.
pub const DEFAULT_SEEN_CACHE_CAPACITY: usize = 1000;

// =============================================================================
// OUTBOX / RETRIES
// =============================================================================

/// Retry ceiling for non-SOS packets before they are marked failed.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Retry ceiling for SOS packets. An SOS is the whole point of the mesh, so
/// it gets an order of magnitude more patience than routine traffic.
pub const DEFAULT_MAX_SOS_RETRIES: u32 = 10;

/// Sent entries older than this are pruned from the durable outbox on
/// orchestrator ticks, keeping the store bounded on long-running nodes.
pub const DEFAULT_SENT_RETENTION: Duration = Duration::from_secs(60 * 60);

// =============================================================================
// RELAY ORCHESTRATOR
// =============================================================================

/// Periodic drain interval. Short enough that a newly discovered neighbor is
/// used quickly, long enough not to thrash a half-duplex radio.
pub const DEFAULT_RELAY_INTERVAL: Duration = Duration::from_secs(10);

/// Hard timeout on a single connect-and-send attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Consecutive send failures before the orchestrator backs off. Three in a
/// row means the channel itself is bad, not one unlucky peer.
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Backoff base after repeated failures. Doubles per extra failure streak,
/// capped below, with jitter so co-located nodes don't retry in lockstep.
pub const DEFAULT_RETRY_BACKOFF_BASE: Duration = Duration::from_secs(5);

/// Backoff ceiling.
pub const DEFAULT_RETRY_BACKOFF_CAP: Duration = Duration::from_secs(60);

// =============================================================================
// ROUTER WEIGHTS
// =============================================================================

/// Internet access dominates the score: one hop to a goal node beats any
/// chain of well-charged relays.
pub const DEFAULT_WEIGHT_INTERNET: f64 = 50.0;

/// Battery weight. A dying relay is a packet sink.
pub const DEFAULT_WEIGHT_BATTERY: f64 = 25.0;

/// Signal weight. Matters least: a weak link retries, a dead battery doesn't.
pub const DEFAULT_WEIGHT_SIGNAL: f64 = 10.0;

// =============================================================================
// CONNECTIVITY PROBE
// =============================================================================

/// How long a probe verdict stays fresh before `check()` re-probes.
pub const DEFAULT_PROBE_CACHE_WINDOW: Duration = Duration::from_secs(10);

/// Probe period while the last verdict was online.
pub const DEFAULT_PROBE_INTERVAL_ONLINE: Duration = Duration::from_secs(30);

/// Probe period while offline. Faster, because regaining internet is the
/// event that unlocks cloud delivery.
pub const DEFAULT_PROBE_INTERVAL_OFFLINE: Duration = Duration::from_secs(10);

/// Per-request probe timeout. Captive portals routinely blackhole traffic;
/// 4 s keeps the probe loop responsive.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(4);

/// Generate-204 endpoints, in probe order. Success on any confirms online.
pub fn default_probe_endpoints() -> Vec<String> {
    vec![
        "https://clients3.google.com/generate_204".to_string(),
        "https://connectivitycheck.gstatic.com/generate_204".to_string(),
        "https://cp.cloudflare.com/generate_204".to_string(),
    ]
}

// =============================================================================
// GATEWAY UPLOADER
// =============================================================================

/// Periodic sync interval while online.
pub const DEFAULT_UPLOAD_INTERVAL: Duration = Duration::from_secs(30);

/// Per-request cloud POST timeout.
pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(15);

/// Pause between consecutive POSTs in a batch so a gateway on a marginal
/// uplink doesn't saturate its own connection.
pub const DEFAULT_UPLOAD_PACING: Duration = Duration::from_millis(500);

// =============================================================================
// NEIGHBORS / ROLES
// =============================================================================

/// A neighbor unseen for longer than this is dropped from the engine's
/// snapshot entirely (vs. merely stale, which only makes it ineligible).
pub const DEFAULT_NEIGHBOR_EVICTION: Duration = Duration::from_secs(300);

/// Below this battery percentage the node stops advertising itself as
/// available for relay; it can still originate its own SOS.
pub const DEFAULT_MIN_RELAY_BATTERY: u8 = 15;

// =============================================================================
// STREAMS
// =============================================================================

/// Broadcast channel capacity for event streams. Slow consumers observe a
/// lag error rather than blocking the engine.
pub const DEFAULT_STREAM_CAPACITY: usize = 256;

/// Retry policy knobs consumed by the outbox.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub max_sos_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            max_sos_retries: DEFAULT_MAX_SOS_RETRIES,
        }
    }
}

impl RetryPolicy {
    pub fn limit_for(&self, is_sos: bool) -> u32 {
        if is_sos {
            self.max_sos_retries
        } else {
            self.max_retries
        }
    }
}

/// Scoring weights consumed by the router.
#[derive(Debug, Clone)]
pub struct RouterWeights {
    pub internet: f64,
    pub battery: f64,
    pub signal: f64,
}

impl Default for RouterWeights {
    fn default() -> Self {
        Self {
            internet: DEFAULT_WEIGHT_INTERNET,
            battery: DEFAULT_WEIGHT_BATTERY,
            signal: DEFAULT_WEIGHT_SIGNAL,
        }
    }
}

/// Connectivity probe configuration.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub endpoints: Vec<String>,
    pub cache_window: Duration,
    pub interval_online: Duration,
    pub interval_offline: Duration,
    pub request_timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            endpoints: default_probe_endpoints(),
            cache_window: DEFAULT_PROBE_CACHE_WINDOW,
            interval_online: DEFAULT_PROBE_INTERVAL_ONLINE,
            interval_offline: DEFAULT_PROBE_INTERVAL_OFFLINE,
            request_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

/// Relay orchestrator configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub relay_interval: Duration,
    pub connect_timeout: Duration,
    pub max_consecutive_failures: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            relay_interval: DEFAULT_RELAY_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            backoff_base: DEFAULT_RETRY_BACKOFF_BASE,
            backoff_cap: DEFAULT_RETRY_BACKOFF_CAP,
        }
    }
}

/// Gateway uploader configuration.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub sync_interval: Duration,
    pub request_timeout: Duration,
    pub pacing: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            sync_interval: DEFAULT_UPLOAD_INTERVAL,
            request_timeout: DEFAULT_UPLOAD_TIMEOUT,
            pacing: DEFAULT_UPLOAD_PACING,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    pub router: RouterWeights,
    pub probe: ProbeConfig,
    pub relay: RelayConfig,
    pub upload: UploadConfig,
    pub tuning: Tuning,
}

/// Remaining per-component knobs.
#[derive(Debug, Clone)]
pub struct Tuning {
    pub seen_cache_capacity: usize,
    pub sent_retention: Duration,
    pub neighbor_eviction: Duration,
    pub min_relay_battery: u8,
    pub stream_capacity: usize,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            seen_cache_capacity: DEFAULT_SEEN_CACHE_CAPACITY,
            sent_retention: DEFAULT_SENT_RETENTION,
            neighbor_eviction: DEFAULT_NEIGHBOR_EVICTION,
            min_relay_battery: DEFAULT_MIN_RELAY_BATTERY,
            stream_capacity: DEFAULT_STREAM_CAPACITY,
        }
    }
}
