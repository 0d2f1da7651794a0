//! Local role state and metadata advertisement.
//!
//! The advertised role is a deterministic projection, never stored:
//! internet access makes the node a goal regardless of what it is otherwise
//! doing, and `sender` survives until explicitly reset. Consumers must not
//! derive "goal" from the stored role or "sender" from the absence of
//! internet; both bugs hide behind the same advertisement otherwise.

use crate::adapters::{BatteryProvider, Clock, LinkLayer, LocationProvider};
use crate::error::LinkError;
use crate::types::{NodeRole, TriageLevel};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Locally held role; `goal` is never stored, only projected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalRole {
    Sender,
    Relay,
    Idle,
}

struct RoleState {
    node_id: String,
    current_role: LocalRole,
    has_internet: bool,
    triage: TriageLevel,
    last_record: HashMap<String, String>,
}

pub struct RoleController {
    link: Arc<dyn LinkLayer>,
    battery: Arc<dyn BatteryProvider>,
    location: Arc<dyn LocationProvider>,
    min_relay_battery: u8,
    state: Mutex<RoleState>,
}

impl RoleController {
    pub fn new(
        link: Arc<dyn LinkLayer>,
        battery: Arc<dyn BatteryProvider>,
        location: Arc<dyn LocationProvider>,
        _clock: Arc<dyn Clock>,
        min_relay_battery: u8,
    ) -> Self {
        Self {
            link,
            battery,
            location,
            min_relay_battery,
            state: Mutex::new(RoleState {
                node_id: String::new(),
                current_role: LocalRole::Idle,
                has_internet: false,
                triage: TriageLevel::None,
                last_record: HashMap::new(),
            }),
        }
    }

    pub async fn set_node_id(&self, node_id: &str) {
        let mut state = self.state.lock().await;
        state.node_id = node_id.to_string();
        state.current_role = LocalRole::Relay;
    }

    pub async fn current_role(&self) -> LocalRole {
        self.state.lock().await.current_role
    }

    pub async fn has_internet(&self) -> bool {
        self.state.lock().await.has_internet
    }

    /// The role peers will see: `goal` wins over everything, `sender` over
    /// `relay`.
    pub async fn advertised_role(&self) -> NodeRole {
        let state = self.state.lock().await;
        Self::project(&state)
    }

    fn project(state: &RoleState) -> NodeRole {
        if state.has_internet {
            NodeRole::Goal
        } else {
            match state.current_role {
                LocalRole::Sender => NodeRole::Sender,
                LocalRole::Relay => NodeRole::Relay,
                LocalRole::Idle => NodeRole::Idle,
            }
        }
    }

    /// Originating an SOS makes this node a sender until explicitly reset.
    pub async fn mark_sender(&self) -> Result<(), LinkError> {
        {
            let mut state = self.state.lock().await;
            if state.current_role == LocalRole::Sender {
                return Ok(());
            }
            state.current_role = LocalRole::Sender;
        }
        self.update_metadata().await.map(|_| ())
    }

    /// Host decided the emergency is over: drop back to relay duty.
    pub async fn reset_role(&self) -> Result<(), LinkError> {
        {
            let mut state = self.state.lock().await;
            if state.current_role == LocalRole::Relay {
                return Ok(());
            }
            state.current_role = LocalRole::Relay;
        }
        self.update_metadata().await.map(|_| ())
    }

    /// Connectivity transition from the probe. Only the projection changes;
    /// the stored role is untouched.
    pub async fn set_internet(&self, online: bool) -> Result<(), LinkError> {
        {
            let mut state = self.state.lock().await;
            if state.has_internet == online {
                return Ok(());
            }
            state.has_internet = online;
        }
        self.update_metadata().await.map(|_| ())
    }

    pub async fn set_triage(&self, triage: TriageLevel) -> Result<(), LinkError> {
        {
            let mut state = self.state.lock().await;
            if state.triage == triage {
                return Ok(());
            }
            state.triage = triage;
        }
        self.update_metadata().await.map(|_| ())
    }

    /// Recompute the advertisement record from current inputs and publish
    /// it, replacing the previous advertisement.
    pub async fn update_metadata(&self) -> Result<HashMap<String, String>, LinkError> {
        let battery = self.battery.battery_percent().await;
        let fix = self.location.location().await;
        let signal = self.link.signal_strength_dbm();

        let record = {
            let mut state = self.state.lock().await;
            let role = Self::project(&state);
            let mut record = HashMap::new();
            record.insert("id".to_string(), state.node_id.clone());
            record.insert("bat".to_string(), battery.to_string());
            record.insert(
                "net".to_string(),
                if state.has_internet { "1" } else { "0" }.to_string(),
            );
            let (lat, lng) = fix.map(|f| (f.latitude, f.longitude)).unwrap_or((0.0, 0.0));
            record.insert("lat".to_string(), format!("{lat:.6}"));
            record.insert("lng".to_string(), format!("{lng:.6}"));
            record.insert("sig".to_string(), signal.to_string());
            record.insert("tri".to_string(), state.triage.code().to_string());
            record.insert("rol".to_string(), role.code().to_string());
            record.insert(
                "rel".to_string(),
                if battery > self.min_relay_battery {
                    "1"
                } else {
                    "0"
                }
                .to_string(),
            );
            state.last_record = record.clone();
            record
        };

        debug!(rol = %record["rol"], rel = %record["rel"], "advertising metadata");
        self.link.advertise(record.clone()).await?;
        Ok(record)
    }

    /// Most recently advertised record, for diagnostics.
    pub async fn last_record(&self) -> HashMap<String, String> {
        self.state.lock().await.last_record.clone()
    }
}
