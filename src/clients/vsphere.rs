//! vCenter client.
//!
//! Inventory, VM details and power go through the Automation REST API under
//! `/api`. Quick stats, snapshots and task tracking have no Automation
//! endpoint and go through the VI/JSON API under `/sdk/vim25/{release}`.
//! Each API gets its own login; every call carries the matching id in the
//! `vmware-api-session-id` header.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::platform::{
    ConnectRequest, Disk, Platform, PlatformConnection, PlatformError, PowerCall, PowerState,
    SnapshotSpec, SnapshotTree, TaskRef, TaskStatus, Utilization, VmDetail, VmSummary,
};

const SESSION_HEADER: &str = "vmware-api-session-id";
const SESSION_MANAGER: &str = "SessionManager";
const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Opens [`VsphereConnection`]s.
#[derive(Debug, Clone)]
pub struct VsphereConnector {
    request_timeout: Duration,
    vim_release: String,
}

impl VsphereConnector {
    #[must_use]
    pub fn new(request_timeout: Duration, vim_release: &str) -> Self {
        Self {
            request_timeout,
            vim_release: vim_release.to_string(),
        }
    }

    fn build_client(&self, insecure_tls: bool) -> Result<Client, PlatformError> {
        Client::builder()
            .user_agent(concat!("vmcaptain/", env!("CARGO_PKG_VERSION")))
            .timeout(self.request_timeout)
            .danger_accept_invalid_certs(insecure_tls)
            .build()
            .map_err(|e| PlatformError::Upstream(format!("Failed to build HTTP client: {e}")))
    }
}

#[async_trait]
impl Platform for VsphereConnector {
    async fn connect(
        &self,
        request: &ConnectRequest,
    ) -> Result<Arc<dyn PlatformConnection>, PlatformError> {
        let client = self.build_client(request.insecure_tls)?;
        let base = Url::parse(&request.endpoint.base_url())
            .map_err(|e| PlatformError::InvalidEndpoint(e.to_string()))?;

        let url = join(&base, &["api", "session"], &[])?;
        let response = client
            .post(url)
            .basic_auth(&request.username, Some(&request.secret))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(PlatformError::AuthRejected(format!(
                "vCenter at {} rejected the credentials for {}",
                request.endpoint, request.username
            )));
        }

        let session_id: String = decode(check(response, "session").await?).await?;

        let vim_base = join(&base, &["sdk", "vim25", &self.vim_release], &[])?;
        let vim_session = match vim_login(&client, &vim_base, request).await {
            Ok(id) => id,
            Err(e) => {
                let rest_session = join(&base, &["api", "session"], &[])?;
                if let Err(logout) = client
                    .delete(rest_session)
                    .header(SESSION_HEADER, &session_id)
                    .send()
                    .await
                {
                    debug!(error = %logout, "Failed to drop REST session after VI/JSON login failure");
                }
                return Err(e);
            }
        };

        info!(endpoint = %request.endpoint, username = %request.username, "Authenticated with vCenter");

        Ok(Arc::new(VsphereConnection {
            client,
            base,
            session_id,
            vim_base,
            vim_session,
        }))
    }
}

async fn vim_login(
    client: &Client,
    vim_base: &Url,
    request: &ConnectRequest,
) -> Result<String, PlatformError> {
    let url = join(vim_base, &[SESSION_MANAGER, SESSION_MANAGER, "Login"], &[])?;
    let response = client
        .post(url)
        .json(&LoginBody {
            user_name: &request.username,
            password: &request.secret,
        })
        .send()
        .await
        .map_err(transport_error)?;

    let response = check(response, "session").await?;
    response
        .headers()
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| PlatformError::Upstream("VI/JSON login returned no session id".to_string()))
}

/// One authenticated vCenter session pair.
pub struct VsphereConnection {
    client: Client,
    base: Url,
    session_id: String,
    vim_base: Url,
    vim_session: String,
}

impl VsphereConnection {
    fn request(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, &str)],
    ) -> Result<RequestBuilder, PlatformError> {
        let url = join(&self.base, segments, query)?;
        Ok(self
            .client
            .request(method, url)
            .header(SESSION_HEADER, &self.session_id))
    }

    async fn send(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, &str)],
        what: &str,
    ) -> Result<Response, PlatformError> {
        let response = self
            .request(method, segments, query)?
            .send()
            .await
            .map_err(transport_error)?;
        check(response, what).await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        what: &str,
    ) -> Result<T, PlatformError> {
        decode(self.send(Method::GET, segments, &[], what).await?).await
    }

    fn vim_request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder, PlatformError> {
        let url = join(&self.vim_base, segments, &[])?;
        Ok(self
            .client
            .request(method, url)
            .header(SESSION_HEADER, &self.vim_session))
    }

    /// Reads one property of a managed object.
    async fn vim_property(
        &self,
        kind: &str,
        id: &str,
        property: &str,
        what: &str,
    ) -> Result<Response, PlatformError> {
        let response = self
            .vim_request(Method::GET, &[kind, id, property])?
            .send()
            .await
            .map_err(transport_error)?;
        check(response, what).await
    }

    /// Guest identity is only reported while VMware Tools runs; any failure
    /// reads as "unknown".
    async fn guest_identity(&self, vm_id: &str) -> Option<GuestIdentity> {
        match self
            .get_json::<GuestIdentity>(&["api", "vcenter", "vm", vm_id, "guest", "identity"], "guest")
            .await
        {
            Ok(identity) => Some(identity),
            Err(e) => {
                debug!(vm = vm_id, error = %e, "Guest identity unavailable");
                None
            }
        }
    }
}

#[async_trait]
impl PlatformConnection for VsphereConnection {
    async fn list_vms(&self) -> Result<Vec<VmSummary>, PlatformError> {
        let vms: Vec<VmListEntry> = self.get_json(&["api", "vcenter", "vm"], "VM list").await?;

        let identities = futures::future::join_all(vms.iter().map(|vm| async {
            if vm.power_state == RestPowerState::PoweredOn {
                self.guest_identity(&vm.vm).await
            } else {
                None
            }
        }))
        .await;

        Ok(vms
            .into_iter()
            .zip(identities)
            .map(|(vm, identity)| VmSummary {
                id: vm.vm,
                name: vm.name,
                power_state: vm.power_state.into(),
                guest_full_name: identity.as_ref().and_then(GuestIdentity::full_name),
                ip_address: identity.and_then(|i| i.ip_address),
                num_cpu: vm.cpu_count,
                memory_size_mb: vm.memory_size_mib,
            })
            .collect())
    }

    async fn get_vm(&self, vm_id: &str) -> Result<Option<VmDetail>, PlatformError> {
        let info: VmInfo = match self.get_json(&["api", "vcenter", "vm", vm_id], "VM").await {
            Ok(info) => info,
            Err(PlatformError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let identity = if info.power_state == RestPowerState::PoweredOn {
            self.guest_identity(vm_id).await
        } else {
            None
        };

        Ok(Some(info.into_detail(vm_id, identity)))
    }

    async fn power_state(&self, vm_id: &str) -> Result<PowerState, PlatformError> {
        let power: PowerInfo = self
            .get_json(&["api", "vcenter", "vm", vm_id, "power"], "VM")
            .await?;
        Ok(power.state.into())
    }

    async fn power(&self, vm_id: &str, call: PowerCall) -> Result<Option<TaskRef>, PlatformError> {
        self.send(
            Method::POST,
            &["api", "vcenter", "vm", vm_id, "power"],
            &[("action", call.as_str())],
            "VM",
        )
        .await?;
        info!(vm = vm_id, action = call.as_str(), "Issued power call");
        // Power calls complete synchronously on this API.
        Ok(None)
    }

    async fn utilization(&self, vm_id: &str) -> Result<Option<Utilization>, PlatformError> {
        let response = match self
            .vim_property("VirtualMachine", vm_id, "summary", "quick stats")
            .await
        {
            Ok(response) => response,
            Err(PlatformError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let summary: VimVmSummary = decode(response).await?;
        Ok(summary.into_utilization())
    }

    async fn snapshots(&self, vm_id: &str) -> Result<Vec<SnapshotTree>, PlatformError> {
        let response = self
            .vim_property("VirtualMachine", vm_id, "snapshot", "VM")
            .await?;
        let body = response.text().await.map_err(transport_error)?;
        parse_snapshot_info(&body)
    }

    async fn create_snapshot(
        &self,
        vm_id: &str,
        spec: &SnapshotSpec,
    ) -> Result<TaskRef, PlatformError> {
        let body = CreateSnapshotBody {
            name: &spec.name,
            description: spec.description.as_deref().unwrap_or_default(),
            memory: spec.memory,
            quiesce: spec.quiesce,
        };

        let response = self
            .vim_request(Method::POST, &["VirtualMachine", vm_id, "CreateSnapshot_Task"])?
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let task: MoRef = decode(check(response, "VM").await?).await?;
        info!(vm = vm_id, task = %task.value, name = %spec.name, "Snapshot task started");
        Ok(TaskRef(task.value))
    }

    async fn task_status(&self, task: &TaskRef) -> Result<TaskStatus, PlatformError> {
        let info: VimTaskInfo =
            decode(self.vim_property("Task", &task.0, "info", "task").await?).await?;
        Ok(info.into_status())
    }

    async fn logout(&self) -> Result<(), PlatformError> {
        let vim = match self
            .vim_request(Method::POST, &[SESSION_MANAGER, SESSION_MANAGER, "Logout"])?
            .send()
            .await
        {
            Ok(response) => check(response, "session").await.map(drop),
            Err(e) => Err(transport_error(e)),
        };
        let rest = self
            .send(Method::DELETE, &["api", "session"], &[], "session")
            .await
            .map(drop);

        vim.and(rest)?;
        debug!("Logged out of vCenter");
        Ok(())
    }
}

fn join(base: &Url, segments: &[&str], query: &[(&str, &str)]) -> Result<Url, PlatformError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| PlatformError::InvalidEndpoint(base.to_string()))?
        .pop_if_empty()
        .extend(segments);
    if !query.is_empty() {
        url.query_pairs_mut().extend_pairs(query);
    }
    Ok(url)
}

fn transport_error(err: reqwest::Error) -> PlatformError {
    if err.is_connect() || err.is_timeout() {
        PlatformError::Unreachable(err.to_string())
    } else {
        PlatformError::Upstream(err.to_string())
    }
}

/// Maps non-success responses from either API onto [`PlatformError`].
async fn check(response: Response, what: &str) -> Result<Response, PlatformError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(classify(status, &body, what))
}

fn classify(status: StatusCode, body: &str, what: &str) -> PlatformError {
    let fault = serde_json::from_str::<VimFault>(body)
        .map(|f| f.type_name)
        .unwrap_or_default();
    let message = error_message(body).unwrap_or_else(|| format!("status={status}, body={body}"));

    match (status, fault.as_str()) {
        (StatusCode::NOT_FOUND, _) | (_, "ManagedObjectNotFound") => {
            PlatformError::NotFound(what.to_string())
        }
        (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN, _)
        | (_, "InvalidLogin" | "NotAuthenticated" | "NoPermission") => {
            PlatformError::AuthRejected(message)
        }
        _ => {
            warn!(%status, what, "vCenter request failed");
            PlatformError::Upstream(message)
        }
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, PlatformError> {
    response
        .json()
        .await
        .map_err(|e| PlatformError::Upstream(format!("Unexpected vCenter response: {e}")))
}

/// Text of an Automation error or a VI/JSON fault.
fn error_message(body: &str) -> Option<String> {
    if let Ok(err) = serde_json::from_str::<RestError>(body) {
        let joined = err
            .messages
            .into_iter()
            .map(|m| m.default_message)
            .collect::<Vec<_>>()
            .join("; ");
        if !joined.is_empty() {
            return Some(joined);
        }
    }
    serde_json::from_str::<VimFault>(body).ok()?.message()
}

/// An unset `snapshot` property comes back as an empty body or `null`.
fn parse_snapshot_info(body: &str) -> Result<Vec<SnapshotTree>, PlatformError> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    let info: Option<VimSnapshotInfo> = serde_json::from_str(body)
        .map_err(|e| PlatformError::Upstream(format!("Unexpected vCenter response: {e}")))?;
    Ok(info
        .map(|i| {
            i.root_snapshot_list
                .into_iter()
                .map(VimSnapshotTree::into_tree)
                .collect()
        })
        .unwrap_or_default())
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum RestPowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

impl From<RestPowerState> for PowerState {
    fn from(state: RestPowerState) -> Self {
        match state {
            RestPowerState::PoweredOn => Self::PoweredOn,
            RestPowerState::PoweredOff => Self::PoweredOff,
            RestPowerState::Suspended => Self::Suspended,
        }
    }
}

#[derive(Debug, Deserialize)]
struct VmListEntry {
    vm: String,
    name: String,
    power_state: RestPowerState,
    #[serde(default)]
    cpu_count: Option<u32>,
    #[serde(default, rename = "memory_size_MiB")]
    memory_size_mib: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct LocalizedMessage {
    default_message: String,
}

#[derive(Debug, Deserialize)]
struct RestError {
    #[serde(default)]
    messages: Vec<LocalizedMessage>,
}

#[derive(Debug, Deserialize)]
struct GuestIdentity {
    #[serde(default)]
    full_name: Option<LocalizedMessage>,
    #[serde(default)]
    ip_address: Option<String>,
}

impl GuestIdentity {
    fn full_name(&self) -> Option<String> {
        self.full_name.as_ref().map(|m| m.default_message.clone())
    }
}

#[derive(Debug, Deserialize)]
struct CpuInfo {
    count: u32,
}

#[derive(Debug, Deserialize)]
struct MemoryInfo {
    #[serde(rename = "size_MiB")]
    size_mib: u64,
}

#[derive(Debug, Deserialize)]
struct DiskBacking {
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DiskInfo {
    #[serde(default)]
    label: String,
    #[serde(default)]
    capacity: u64,
    #[serde(default)]
    backing: Option<DiskBacking>,
    #[serde(default)]
    disk_mode: Option<String>,
    #[serde(default)]
    thin_provisioned: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct VmInfo {
    name: String,
    power_state: RestPowerState,
    #[serde(default)]
    cpu: Option<CpuInfo>,
    #[serde(default)]
    memory: Option<MemoryInfo>,
    #[serde(default, rename = "guest_OS")]
    guest_os: Option<String>,
    #[serde(default)]
    annotation: Option<String>,
    #[serde(default)]
    disks: BTreeMap<String, DiskInfo>,
}

impl VmInfo {
    #[allow(clippy::cast_precision_loss)]
    fn into_detail(self, vm_id: &str, identity: Option<GuestIdentity>) -> VmDetail {
        let guest_full_name = identity
            .as_ref()
            .and_then(GuestIdentity::full_name)
            .or(self.guest_os);

        let disks = self
            .disks
            .into_values()
            .map(|disk| Disk {
                label: disk.label,
                size_gb: disk.capacity as f64 / BYTES_PER_GB,
                disk_mode: disk
                    .disk_mode
                    .or_else(|| disk.backing.and_then(|b| b.kind)),
                thin_provisioned: disk.thin_provisioned,
            })
            .collect();

        VmDetail {
            summary: VmSummary {
                id: vm_id.to_string(),
                name: self.name,
                power_state: self.power_state.into(),
                guest_full_name,
                ip_address: identity.and_then(|i| i.ip_address),
                num_cpu: self.cpu.map(|c| c.count),
                memory_size_mb: self.memory.map(|m| m.size_mib),
            },
            annotation: self.annotation.filter(|a| !a.is_empty()),
            disks,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PowerInfo {
    state: RestPowerState,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginBody<'a> {
    user_name: &'a str,
    password: &'a str,
}

/// VI/JSON managed object reference.
#[derive(Debug, Deserialize)]
struct MoRef {
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VimFault {
    #[serde(default, rename = "_typeName")]
    type_name: String,
    #[serde(default)]
    fault_message: Vec<VimMessage>,
}

#[derive(Debug, Deserialize)]
struct VimMessage {
    #[serde(default)]
    message: Option<String>,
}

impl VimFault {
    fn message(self) -> Option<String> {
        let joined = self
            .fault_message
            .into_iter()
            .filter_map(|m| m.message)
            .collect::<Vec<_>>()
            .join("; ");
        if !joined.is_empty() {
            Some(joined)
        } else if !self.type_name.is_empty() {
            Some(self.type_name)
        } else {
            None
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VimRuntime {
    /// MHz.
    #[serde(default)]
    max_cpu_usage: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct VimConfigSummary {
    #[serde(default, rename = "memorySizeMB")]
    memory_size_mb: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct VimStorageSummary {
    #[serde(default)]
    committed: f64,
    #[serde(default)]
    uncommitted: f64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VimQuickStats {
    /// MHz.
    #[serde(default)]
    overall_cpu_usage: Option<f64>,
    /// MB.
    #[serde(default)]
    guest_memory_usage: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VimVmSummary {
    #[serde(default)]
    runtime: VimRuntime,
    #[serde(default)]
    config: VimConfigSummary,
    #[serde(default)]
    storage: Option<VimStorageSummary>,
    #[serde(default)]
    quick_stats: VimQuickStats,
}

impl VimVmSummary {
    /// All three figures in percent, or `None` when any input is missing.
    fn into_utilization(self) -> Option<Utilization> {
        let cpu = percent(self.quick_stats.overall_cpu_usage?, self.runtime.max_cpu_usage?)?;
        let memory = percent(
            self.quick_stats.guest_memory_usage?,
            self.config.memory_size_mb?,
        )?;
        let storage = self.storage?;
        let disk = percent(storage.committed, storage.committed + storage.uncommitted)?;

        Some(Utilization {
            cpu_usage: cpu,
            memory_usage: memory,
            disk_usage: disk,
        })
    }
}

/// One decimal place.
fn percent(used: f64, total: f64) -> Option<f64> {
    (total > 0.0).then(|| (used / total * 1000.0).round() / 10.0)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VimSnapshotInfo {
    #[serde(default)]
    root_snapshot_list: Vec<VimSnapshotTree>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VimSnapshotTree {
    snapshot: MoRef,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    create_time: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    child_snapshot_list: Vec<VimSnapshotTree>,
}

impl VimSnapshotTree {
    fn into_tree(self) -> SnapshotTree {
        SnapshotTree {
            id: self.snapshot.value,
            name: self.name,
            description: self.description,
            create_time: self.create_time,
            state: self.state,
            children: self
                .child_snapshot_list
                .into_iter()
                .map(Self::into_tree)
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateSnapshotBody<'a> {
    name: &'a str,
    description: &'a str,
    memory: bool,
    quiesce: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
enum VimTaskState {
    Queued,
    Running,
    Success,
    Error,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocalizedMethodFault {
    #[serde(default)]
    localized_message: Option<String>,
    #[serde(default)]
    fault: Option<VimFault>,
}

#[derive(Debug, Deserialize)]
struct VimTaskInfo {
    state: VimTaskState,
    #[serde(default)]
    error: Option<LocalizedMethodFault>,
}

impl VimTaskInfo {
    fn into_status(self) -> TaskStatus {
        match self.state {
            VimTaskState::Queued => TaskStatus::Pending,
            VimTaskState::Running => TaskStatus::Running,
            VimTaskState::Success => TaskStatus::Succeeded,
            VimTaskState::Error => {
                let message = self
                    .error
                    .and_then(|e| {
                        e.localized_message
                            .filter(|m| !m.is_empty())
                            .or_else(|| e.fault.and_then(VimFault::message))
                    })
                    .unwrap_or_else(|| "Task failed".to_string());
                TaskStatus::Failed(message)
            }
        }
    }
}
