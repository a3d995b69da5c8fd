//! Domain types kept in the coordination store.
//!
//! All types serialize to JSON records. Timestamps are unix seconds, as
//! everywhere else in Fleet.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a service.
pub type ServiceId = String;

/// Unique identifier for one scheduled instance of a service.
pub type ServiceStateId = String;

/// Unique identifier for a host in the cluster.
pub type HostId = String;

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// What the cluster should be doing with a service or instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    #[default]
    Stop,
    Run,
    Restart,
}

// ── Service ───────────────────────────────────────────────────────

/// Logical definition of a workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub name: String,
    #[serde(default)]
    pub context: String,
    /// Command the container starts with.
    #[serde(default)]
    pub startup: String,
    #[serde(default)]
    pub description: String,
    /// Desired number of running instances.
    pub instances: u32,
    #[serde(default)]
    pub image_id: String,
    #[serde(default)]
    pub pool_id: String,
    pub desired_state: DesiredState,
    /// "auto" (the default) or "manual".
    #[serde(default)]
    pub launch: String,
    #[serde(default)]
    pub endpoints: Vec<ServiceEndpoint>,
    #[serde(default)]
    pub parent_service_id: String,
    pub created_at: u64,
    pub updated_at: u64,
}

/// An endpoint a service exports or imports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub protocol: String,
    pub port_number: u16,
    pub application: String,
    /// "export" or "import".
    pub purpose: String,
}

impl Service {
    /// A new, stopped service with a fresh id.
    pub fn new(name: impl Into<String>) -> Self {
        let now = epoch_secs();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            context: String::new(),
            startup: String::new(),
            description: String::new(),
            instances: 0,
            image_id: String::new(),
            pool_id: String::new(),
            desired_state: DesiredState::Stop,
            launch: String::new(),
            endpoints: Vec::new(),
            parent_service_id: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Build a freshly scheduled instance of this service on `host_id`.
    pub fn new_service_state(&self, host_id: impl Into<HostId>) -> ServiceState {
        ServiceState {
            id: Uuid::new_v4().to_string(),
            service_id: self.id.clone(),
            host_id: host_id.into(),
            container_id: String::new(),
            private_ip: String::new(),
            host_ip: String::new(),
            scheduled: epoch_secs(),
            started: None,
            terminated: None,
            port_mapping: HashMap::new(),
            endpoints: self.endpoints.clone(),
            in_sync: false,
        }
    }

    /// Whether any endpoint is an import.
    pub fn has_imports(&self) -> bool {
        self.endpoints.iter().any(|ep| ep.purpose == "import")
    }

    /// The endpoints this service imports.
    pub fn service_imports(&self) -> Vec<ServiceEndpoint> {
        self.endpoints
            .iter()
            .filter(|ep| ep.purpose == "import")
            .cloned()
            .collect()
    }
}

// ── ServiceState ──────────────────────────────────────────────────

/// One scheduled or running instance of a service on a host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceState {
    pub id: ServiceStateId,
    pub service_id: ServiceId,
    pub host_id: HostId,
    #[serde(default)]
    pub container_id: String,
    #[serde(default)]
    pub private_ip: String,
    #[serde(default)]
    pub host_ip: String,
    /// Unix timestamp when the instance was placed.
    pub scheduled: u64,
    pub started: Option<u64>,
    pub terminated: Option<u64>,
    /// protocol → container port → host port.
    #[serde(default)]
    pub port_mapping: HashMap<String, HashMap<String, String>>,
    #[serde(default)]
    pub endpoints: Vec<ServiceEndpoint>,
    /// Whether the agent's view of the instance matches the store.
    #[serde(default)]
    pub in_sync: bool,
}

impl ServiceState {
    /// Host port an exported container port is published on, if any.
    pub fn host_port(&self, protocol: &str, application: &str, port: u16) -> Option<u16> {
        let exported = self.endpoints.iter().any(|ep| {
            ep.port_number == port
                && ep.application == application
                && ep.protocol == protocol
                && ep.purpose == "export"
        });
        if !exported {
            return None;
        }
        self.port_mapping
            .get(&protocol.to_ascii_lowercase())
            .and_then(|ports| ports.get(&port.to_string()))
            .and_then(|external| external.parse().ok())
    }
}

// ── HostServiceState ──────────────────────────────────────────────

/// Per-host shadow of a [`ServiceState`], letting an agent enumerate what
/// should run on its host without scanning every service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostServiceState {
    pub host_id: HostId,
    pub service_id: ServiceId,
    pub service_state_id: ServiceStateId,
    pub desired_state: DesiredState,
}

impl From<&ServiceState> for HostServiceState {
    fn from(state: &ServiceState) -> Self {
        Self {
            host_id: state.host_id.clone(),
            service_id: state.service_id.clone(),
            service_state_id: state.id.clone(),
            desired_state: DesiredState::Run,
        }
    }
}

// ── RunningService ────────────────────────────────────────────────

/// A service instance joined with its service definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningService {
    pub id: ServiceStateId,
    pub service_id: ServiceId,
    pub host_id: HostId,
    pub container_id: String,
    pub started_at: Option<u64>,
    pub name: String,
    pub startup: String,
    pub description: String,
    pub instances: u32,
    pub image_id: String,
    pub pool_id: String,
    pub desired_state: DesiredState,
    pub parent_service_id: String,
}

impl RunningService {
    pub fn new(service: &Service, state: &ServiceState) -> Self {
        Self {
            id: state.id.clone(),
            service_id: state.service_id.clone(),
            host_id: state.host_id.clone(),
            container_id: state.container_id.clone(),
            started_at: state.started,
            name: service.name.clone(),
            startup: service.startup.clone(),
            description: service.description.clone(),
            instances: service.instances,
            image_id: service.image_id.clone(),
            pool_id: service.pool_id.clone(),
            desired_state: service.desired_state,
            parent_service_id: service.parent_service_id.clone(),
        }
    }
}

// ── Snapshots ─────────────────────────────────────────────────────

/// A request for the leader to snapshot a service.
///
/// `snapshot_label` and `snapshot_error` start empty; whoever serves the
/// request fills exactly one of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub id: String,
    pub service_id: ServiceId,
    #[serde(default)]
    pub snapshot_label: String,
    #[serde(default)]
    pub snapshot_error: String,
}

/// Where a snapshot request stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotOutcome {
    Pending,
    Fulfilled(String),
    Failed(String),
}

impl SnapshotRequest {
    pub fn new(service_id: impl Into<ServiceId>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            service_id: service_id.into(),
            snapshot_label: String::new(),
            snapshot_error: String::new(),
        }
    }

    /// An error wins over a label if a misbehaving fulfiller wrote both.
    pub fn outcome(&self) -> SnapshotOutcome {
        if !self.snapshot_error.is_empty() {
            SnapshotOutcome::Failed(self.snapshot_error.clone())
        } else if !self.snapshot_label.is_empty() {
            SnapshotOutcome::Fulfilled(self.snapshot_label.clone())
        } else {
            SnapshotOutcome::Pending
        }
    }
}
