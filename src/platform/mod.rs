//! Abstraction over the external virtualization platform.
//!
//! [`Platform`] opens authenticated connections; a [`PlatformConnection`] is
//! one logged-in session against the platform and exposes the handful of
//! operations the dashboard proxies. The concrete REST client lives in
//! [`crate::clients::vsphere`]; tests substitute a recording fake.

pub mod endpoint;
pub mod task;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

pub use endpoint::Endpoint;
pub use task::{TaskWaitPolicy, wait_for_task};

/// Errors reported by the platform or while talking to it.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("Invalid platform endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Platform rejected credentials: {0}")]
    AuthRejected(String),

    #[error("Platform unreachable: {0}")]
    Unreachable(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    TaskFailed(String),

    #[error("Task {task} did not finish within {waited_secs}s")]
    TaskTimeout { task: String, waited_secs: u64 },

    #[error("{0}")]
    Upstream(String),
}

/// Credentials and target for a new connection.
#[derive(Clone)]
pub struct ConnectRequest {
    pub endpoint: Endpoint,
    pub username: String,
    pub secret: String,
    pub insecure_tls: bool,
}

impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("secret", &"***")
            .field("insecure_tls", &self.insecure_tls)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PoweredOn => "poweredOn",
            Self::PoweredOff => "poweredOff",
            Self::Suspended => "suspended",
        };
        f.write_str(s)
    }
}

/// Power operation requested by a dashboard user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Start,
    Stop,
    Restart,
}

impl FromStr for PowerAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "restart" => Ok(Self::Restart),
            other => Err(format!(
                "Unknown power operation '{other}', expected start, stop or restart"
            )),
        }
    }
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
        };
        f.write_str(s)
    }
}

/// A single power call sent to the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerCall {
    Start,
    Stop,
    Reset,
}

impl PowerCall {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Reset => "reset",
        }
    }
}

/// Decides which call, if any, brings a VM in `current` state to the
/// outcome of `action`.
///
/// A restart of a VM that is not running becomes a start.
#[must_use]
pub const fn plan_power(action: PowerAction, current: PowerState) -> Option<PowerCall> {
    match (action, current) {
        (PowerAction::Start, PowerState::PoweredOn) => None,
        (PowerAction::Start, _) => Some(PowerCall::Start),
        (PowerAction::Stop, PowerState::PoweredOff) => None,
        (PowerAction::Stop, _) => Some(PowerCall::Stop),
        (PowerAction::Restart, PowerState::PoweredOn) => Some(PowerCall::Reset),
        (PowerAction::Restart, _) => Some(PowerCall::Start),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VmSummary {
    pub id: String,
    pub name: String,
    pub power_state: PowerState,
    pub guest_full_name: Option<String>,
    pub ip_address: Option<String>,
    pub num_cpu: Option<u32>,
    pub memory_size_mb: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Disk {
    pub label: String,
    pub size_gb: f64,
    pub disk_mode: Option<String>,
    pub thin_provisioned: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VmDetail {
    #[serde(flatten)]
    pub summary: VmSummary,
    pub annotation: Option<String>,
    pub disks: Vec<Disk>,
}

/// Live utilization figures reported by the platform, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Utilization {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
}

/// Snapshot tree as reported by the platform. Children are owned.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotTree {
    pub id: String,
    pub name: String,
    pub description: String,
    pub create_time: Option<String>,
    pub state: Option<String>,
    pub children: Vec<SnapshotTree>,
}

/// Flattened snapshot entry returned to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub create_time: Option<String>,
    pub state: Option<String>,
    pub parent_id: Option<String>,
    pub depth: usize,
}

/// Walks the trees depth-first, parents before children.
#[must_use]
pub fn flatten_snapshots(roots: &[SnapshotTree]) -> Vec<SnapshotInfo> {
    fn walk(
        node: &SnapshotTree,
        parent: Option<&str>,
        depth: usize,
        out: &mut Vec<SnapshotInfo>,
    ) {
        out.push(SnapshotInfo {
            id: node.id.clone(),
            name: node.name.clone(),
            description: node.description.clone(),
            create_time: node.create_time.clone(),
            state: node.state.clone(),
            parent_id: parent.map(str::to_string),
            depth,
        });
        for child in &node.children {
            walk(child, Some(&node.id), depth + 1, out);
        }
    }

    let mut out = Vec::new();
    for root in roots {
        walk(root, None, 0, &mut out);
    }
    out
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotSpec {
    pub name: String,
    pub description: Option<String>,
    pub memory: bool,
    pub quiesce: bool,
}

/// Handle to an asynchronous platform task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRef(pub String);

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed(String),
}

/// Opens connections to the platform.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Authenticates against the platform.
    ///
    /// # Errors
    ///
    /// [`PlatformError::AuthRejected`] for bad credentials,
    /// [`PlatformError::Unreachable`] when the host cannot be contacted.
    async fn connect(
        &self,
        request: &ConnectRequest,
    ) -> Result<Arc<dyn PlatformConnection>, PlatformError>;
}

/// One authenticated platform session.
#[async_trait]
pub trait PlatformConnection: Send + Sync {
    async fn list_vms(&self) -> Result<Vec<VmSummary>, PlatformError>;

    /// Returns `None` when the VM does not exist.
    async fn get_vm(&self, vm_id: &str) -> Result<Option<VmDetail>, PlatformError>;

    async fn power_state(&self, vm_id: &str) -> Result<PowerState, PlatformError>;

    /// Issues a power call. Platforms that run power changes as tasks
    /// return the task to wait on.
    async fn power(&self, vm_id: &str, call: PowerCall) -> Result<Option<TaskRef>, PlatformError>;

    /// Live utilization, or `None` when the platform has no figures for it.
    async fn utilization(&self, vm_id: &str) -> Result<Option<Utilization>, PlatformError>;

    async fn snapshots(&self, vm_id: &str) -> Result<Vec<SnapshotTree>, PlatformError>;

    async fn create_snapshot(
        &self,
        vm_id: &str,
        spec: &SnapshotSpec,
    ) -> Result<TaskRef, PlatformError>;

    async fn task_status(&self, task: &TaskRef) -> Result<TaskStatus, PlatformError>;

    /// Ends the platform session.
    async fn logout(&self) -> Result<(), PlatformError>;
}
