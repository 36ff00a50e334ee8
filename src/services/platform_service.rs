//! Proxied platform operations, gated by the caller's VM access.

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::PlatformConfig;
use crate::domain::{User, UserId};
use crate::platform::{
    ConnectRequest, Endpoint, PlatformError, PowerAction, PowerState, SnapshotInfo, SnapshotSpec,
    TaskWaitPolicy, Utilization, VmDetail, VmSummary, flatten_snapshots, plan_power,
    wait_for_task,
};
use crate::session::{SessionHandle, SessionRegistry};

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("You do not have access to VM {0}")]
    Forbidden(String),

    #[error("VM {0} not found")]
    VmNotFound(String),

    #[error(transparent)]
    Platform(#[from] PlatformError),
}

/// Connect parameters; missing fields fall back to configured defaults.
#[derive(Debug, Clone, Default)]
pub struct ConnectInput {
    pub endpoint: Option<String>,
    pub username: Option<String>,
    pub secret: Option<String>,
    pub insecure_tls: Option<bool>,
}

/// VM list entry with live utilization.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VmView {
    #[serde(flatten)]
    pub summary: VmSummary,
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub disk_usage: Option<f64>,
}

impl VmView {
    fn new(summary: VmSummary, usage: Option<Utilization>) -> Self {
        Self {
            summary,
            cpu_usage: usage.map(|u| u.cpu_usage),
            memory_usage: usage.map(|u| u.memory_usage),
            disk_usage: usage.map(|u| u.disk_usage),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PowerOutcome {
    pub vm_id: String,
    pub operation: String,
    pub previous_state: PowerState,
    /// The call actually sent, `None` when the VM was already in place.
    pub issued: Option<&'static str>,
    pub power_state: PowerState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotCreated {
    pub vm_id: String,
    pub name: String,
    pub task: String,
}

pub struct PlatformService {
    registry: Arc<SessionRegistry>,
    defaults: PlatformConfig,
    wait_policy: TaskWaitPolicy,
}

impl PlatformService {
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>, defaults: PlatformConfig) -> Self {
        let wait_policy = TaskWaitPolicy::from_config(&defaults);
        Self {
            registry,
            defaults,
            wait_policy,
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn default_endpoint(&self) -> Option<&str> {
        self.defaults.default_endpoint.as_deref()
    }

    /// Resolves connect input against the defaults and validates the endpoint
    /// before anything goes over the network.
    pub fn resolve_connect(&self, input: ConnectInput) -> Result<ConnectRequest, ProxyError> {
        let raw_endpoint = non_empty(input.endpoint)
            .or_else(|| self.defaults.default_endpoint.clone())
            .ok_or_else(|| ProxyError::InvalidInput("Endpoint is required".to_string()))?;
        let endpoint = Endpoint::parse(&raw_endpoint)
            .map_err(|e| ProxyError::InvalidInput(e.to_string()))?;

        let username = non_empty(input.username)
            .or_else(|| self.defaults.default_username.clone())
            .ok_or_else(|| ProxyError::InvalidInput("Username is required".to_string()))?;
        let secret = non_empty(input.secret)
            .or_else(|| self.defaults.default_secret.clone())
            .ok_or_else(|| ProxyError::InvalidInput("Password is required".to_string()))?;

        Ok(ConnectRequest {
            endpoint,
            username,
            secret,
            insecure_tls: input.insecure_tls.unwrap_or(self.defaults.insecure_tls),
        })
    }

    /// Opens a session for `owner` and hands it to `bind`. When `bind`
    /// fails the session is closed again before the error is returned.
    pub async fn connect<F, Fut, T, E>(
        &self,
        owner: &UserId,
        input: ConnectInput,
        bind: F,
    ) -> Result<(SessionHandle, T), E>
    where
        F: FnOnce(SessionHandle) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ProxyError>,
    {
        let request = self.resolve_connect(input)?;
        let handle = self
            .registry
            .open(owner.as_str(), &request)
            .await
            .map_err(ProxyError::from)?;
        metrics::counter!("vmcaptain_sessions_opened_total").increment(1);

        match bind(handle.clone()).await {
            Ok(bound) => Ok((handle, bound)),
            Err(e) => {
                warn!(user = %owner, "Binding the platform session failed, closing it");
                self.registry.close(&handle.token).await;
                Err(e)
            }
        }
    }

    pub async fn disconnect(&self, token: &str) -> bool {
        self.registry.close(token).await
    }

    /// Closes every session opened by `user`.
    pub async fn disconnect_user(&self, user: &UserId) -> usize {
        self.registry.close_owned_by(user.as_str()).await
    }

    pub async fn session(&self, token: &str) -> Option<SessionHandle> {
        self.registry.validate(token).await
    }

    /// Lists the VMs the user may see, with utilization for running ones.
    pub async fn list_vms(
        &self,
        user: &User,
        session: &SessionHandle,
    ) -> Result<Vec<VmView>, ProxyError> {
        let conn = session.connection.as_ref();
        let vms: Vec<VmSummary> = conn
            .list_vms()
            .await?
            .into_iter()
            .filter(|vm| user.can_access_vm(&vm.id))
            .collect();

        let usage = futures::future::join_all(vms.iter().map(|vm| async move {
            match vm.power_state {
                PowerState::PoweredOn => conn.utilization(&vm.id).await.unwrap_or_else(|e| {
                    warn!(vm = %vm.id, error = %e, "Utilization unavailable");
                    None
                }),
                PowerState::PoweredOff | PowerState::Suspended => Some(Utilization {
                    cpu_usage: 0.0,
                    memory_usage: 0.0,
                    disk_usage: 0.0,
                }),
            }
        }))
        .await;

        Ok(vms
            .into_iter()
            .zip(usage)
            .map(|(vm, usage)| VmView::new(vm, usage))
            .collect())
    }

    pub async fn get_vm(
        &self,
        user: &User,
        session: &SessionHandle,
        vm_id: &str,
    ) -> Result<VmDetail, ProxyError> {
        check_access(user, vm_id)?;
        session
            .connection
            .get_vm(vm_id)
            .await?
            .ok_or_else(|| ProxyError::VmNotFound(vm_id.to_string()))
    }

    /// Reads the current state and issues at most one power call.
    pub async fn power(
        &self,
        user: &User,
        session: &SessionHandle,
        vm_id: &str,
        operation: &str,
    ) -> Result<PowerOutcome, ProxyError> {
        let action: PowerAction = operation.parse().map_err(ProxyError::InvalidInput)?;
        check_access(user, vm_id)?;

        let conn = session.connection.as_ref();
        let previous = conn.power_state(vm_id).await.map_err(not_found(vm_id))?;

        let Some(call) = plan_power(action, previous) else {
            info!(vm = vm_id, %action, state = %previous, "VM already in requested state");
            return Ok(PowerOutcome {
                vm_id: vm_id.to_string(),
                operation: action.to_string(),
                previous_state: previous,
                issued: None,
                power_state: previous,
            });
        };

        if let Some(task) = conn.power(vm_id, call).await.map_err(not_found(vm_id))? {
            wait_for_task(conn, &task, self.wait_policy).await?;
        }
        metrics::counter!("vmcaptain_power_calls_total", "call" => call.as_str()).increment(1);

        let power_state = conn.power_state(vm_id).await.map_err(not_found(vm_id))?;
        info!(user = %user.username, vm = vm_id, %action, call = call.as_str(), "Power operation done");

        Ok(PowerOutcome {
            vm_id: vm_id.to_string(),
            operation: action.to_string(),
            previous_state: previous,
            issued: Some(call.as_str()),
            power_state,
        })
    }

    pub async fn list_snapshots(
        &self,
        user: &User,
        session: &SessionHandle,
        vm_id: &str,
    ) -> Result<Vec<SnapshotInfo>, ProxyError> {
        check_access(user, vm_id)?;
        let roots = session
            .connection
            .snapshots(vm_id)
            .await
            .map_err(not_found(vm_id))?;
        Ok(flatten_snapshots(&roots))
    }

    /// Starts a snapshot and waits for the platform task to finish.
    pub async fn create_snapshot(
        &self,
        user: &User,
        session: &SessionHandle,
        vm_id: &str,
        spec: SnapshotSpec,
    ) -> Result<SnapshotCreated, ProxyError> {
        let name = spec.name.trim();
        if name.is_empty() {
            return Err(ProxyError::InvalidInput("Snapshot name is required".to_string()));
        }
        let spec = SnapshotSpec {
            name: name.to_string(),
            ..spec
        };
        check_access(user, vm_id)?;

        let conn = session.connection.as_ref();
        let task = conn
            .create_snapshot(vm_id, &spec)
            .await
            .map_err(not_found(vm_id))?;
        wait_for_task(conn, &task, self.wait_policy).await?;

        info!(user = %user.username, vm = vm_id, snapshot = %spec.name, "Snapshot created");
        Ok(SnapshotCreated {
            vm_id: vm_id.to_string(),
            name: spec.name,
            task: task.0,
        })
    }
}

fn check_access(user: &User, vm_id: &str) -> Result<(), ProxyError> {
    if user.can_access_vm(vm_id) {
        Ok(())
    } else {
        Err(ProxyError::Forbidden(vm_id.to_string()))
    }
}

fn not_found(vm_id: &str) -> impl Fn(PlatformError) -> ProxyError + '_ {
    move |err| match err {
        PlatformError::NotFound(_) => ProxyError::VmNotFound(vm_id.to_string()),
        other => ProxyError::Platform(other),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
