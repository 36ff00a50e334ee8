#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode},
};
use http_body_util::BodyExt;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use tower::ServiceExt;

use vmcaptain::api::AppState;
use vmcaptain::config::Config;
use vmcaptain::platform::{
    ConnectRequest, Platform, PlatformConnection, PlatformError, PowerCall, PowerState,
    SnapshotSpec, SnapshotTree, TaskRef, TaskStatus, Utilization, VmDetail, VmSummary,
};
use vmcaptain::session::{Clock, ManualClock};

pub const ADMIN_USER: &str = "admin";
pub const ADMIN_SECRET: &str = "123456";

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.general.database_path = "sqlite::memory:".to_string();
    config.auth.jwt_secret = "integration-test-secret".to_string();
    config.bootstrap.admin_secret = Some(ADMIN_SECRET.to_string());
    config.security.argon2_memory_cost_kib = 1024;
    config.security.argon2_time_cost = 1;
    config.observability.metrics_enabled = false;
    config.platform.task_poll_initial_ms = 1;
    config.platform.task_poll_max_ms = 5;
    config.platform.task_timeout_seconds = 5;
    config
}

/// In-memory platform that records every call it receives.
#[derive(Default)]
pub struct FakePlatform {
    pub vms: Mutex<BTreeMap<String, VmSummary>>,
    pub snapshots: Mutex<Vec<SnapshotTree>>,
    pub calls: Mutex<Vec<String>>,
    pub connects: AtomicUsize,
    pub logouts: AtomicUsize,
    pub task_failure: Mutex<Option<String>>,
    /// VMs whose utilization lookup fails.
    pub stats_failures: Mutex<Vec<String>>,
}

impl FakePlatform {
    pub fn with_vms(vms: &[(&str, PowerState)]) -> Arc<Self> {
        let fake = Self::default();
        {
            let mut map = fake.vms.lock().unwrap();
            for (id, state) in vms {
                map.insert(
                    (*id).to_string(),
                    VmSummary {
                        id: (*id).to_string(),
                        name: format!("{id}-name"),
                        power_state: *state,
                        guest_full_name: Some("Ubuntu Linux (64-bit)".to_string()),
                        ip_address: None,
                        num_cpu: Some(2),
                        memory_size_mb: Some(4096),
                    },
                );
            }
        }
        Arc::new(fake)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn state_of(&self, vm_id: &str) -> Option<PowerState> {
        self.vms.lock().unwrap().get(vm_id).map(|vm| vm.power_state)
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

pub struct FakeConnector(pub Arc<FakePlatform>);

#[async_trait]
impl Platform for FakeConnector {
    async fn connect(
        &self,
        request: &ConnectRequest,
    ) -> Result<Arc<dyn PlatformConnection>, PlatformError> {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        if request.secret == "wrong" {
            return Err(PlatformError::AuthRejected(
                "Cannot complete login due to an incorrect user name or password.".to_string(),
            ));
        }
        Ok(Arc::new(FakeConnection(self.0.clone())))
    }
}

pub struct FakeConnection(Arc<FakePlatform>);

#[async_trait]
impl PlatformConnection for FakeConnection {
    async fn list_vms(&self) -> Result<Vec<VmSummary>, PlatformError> {
        Ok(self.0.vms.lock().unwrap().values().cloned().collect())
    }

    async fn get_vm(&self, vm_id: &str) -> Result<Option<VmDetail>, PlatformError> {
        Ok(self.0.vms.lock().unwrap().get(vm_id).map(|vm| VmDetail {
            summary: vm.clone(),
            annotation: Some("managed by tests".to_string()),
            disks: vec![],
        }))
    }

    async fn power_state(&self, vm_id: &str) -> Result<PowerState, PlatformError> {
        self.0
            .state_of(vm_id)
            .ok_or_else(|| PlatformError::NotFound(vm_id.to_string()))
    }

    async fn power(&self, vm_id: &str, call: PowerCall) -> Result<Option<TaskRef>, PlatformError> {
        self.0.record(format!("{}:{vm_id}", call.as_str()));
        let mut vms = self.0.vms.lock().unwrap();
        let vm = vms
            .get_mut(vm_id)
            .ok_or_else(|| PlatformError::NotFound(vm_id.to_string()))?;
        vm.power_state = match call {
            PowerCall::Start | PowerCall::Reset => PowerState::PoweredOn,
            PowerCall::Stop => PowerState::PoweredOff,
        };
        Ok(None)
    }

    async fn utilization(&self, vm_id: &str) -> Result<Option<Utilization>, PlatformError> {
        if self.0.stats_failures.lock().unwrap().iter().any(|v| v == vm_id) {
            return Err(PlatformError::Upstream("stats service busy".to_string()));
        }
        Ok(Some(Utilization {
            cpu_usage: 12.5,
            memory_usage: 40.0,
            disk_usage: 55.0,
        }))
    }

    async fn snapshots(&self, vm_id: &str) -> Result<Vec<SnapshotTree>, PlatformError> {
        self.0.record(format!("snapshots:{vm_id}"));
        Ok(self.0.snapshots.lock().unwrap().clone())
    }

    async fn create_snapshot(
        &self,
        vm_id: &str,
        spec: &SnapshotSpec,
    ) -> Result<TaskRef, PlatformError> {
        self.0.record(format!("snapshot:{vm_id}:{}", spec.name));
        Ok(TaskRef("task-1".to_string()))
    }

    async fn task_status(&self, _task: &TaskRef) -> Result<TaskStatus, PlatformError> {
        Ok(match self.0.task_failure.lock().unwrap().clone() {
            Some(message) => TaskStatus::Failed(message),
            None => TaskStatus::Succeeded,
        })
    }

    async fn logout(&self) -> Result<(), PlatformError> {
        self.0.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: Arc<AppState>,
    pub platform: Arc<FakePlatform>,
    pub clock: Arc<ManualClock>,
}

pub async fn spawn_app(platform: Arc<FakePlatform>) -> TestApp {
    spawn_app_with_config(platform, test_config()).await
}

pub async fn spawn_app_with_config(platform: Arc<FakePlatform>, config: Config) -> TestApp {
    let clock = Arc::new(ManualClock::default());
    let state = vmcaptain::api::create_app_state_with_platform(
        config,
        Arc::new(FakeConnector(platform.clone())),
        clock.clone() as Arc<dyn Clock>,
    )
    .await
    .expect("Failed to create app state");

    TestApp {
        router: vmcaptain::api::router(state.clone()),
        state,
        platform,
        clock,
    }
}

impl TestApp {
    pub async fn send(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        let body = match body {
            Some(json) => {
                builder = builder.header("Content-Type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let response = self
            .router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    pub async fn login(&self, username: &str, secret: &str) -> String {
        let (status, body) = self
            .send(
                Method::POST,
                "/api/auth/login",
                None,
                Some(serde_json::json!({ "username": username, "password": secret })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "login failed: {body}");
        body["data"]["token"].as_str().unwrap().to_string()
    }

    pub async fn admin_token(&self) -> String {
        self.login(ADMIN_USER, ADMIN_SECRET).await
    }

    /// Creates a USER through the API and returns `(id, token)`.
    pub async fn create_user(&self, admin_token: &str, username: &str) -> (String, String) {
        let (status, body) = self
            .send(
                Method::POST,
                "/api/users",
                Some(admin_token),
                Some(serde_json::json!({
                    "username": username,
                    "password": "user-secret-1",
                    "role": "USER"
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "create failed: {body}");
        let id = body["data"]["id"].as_str().unwrap().to_string();
        let token = self.login(username, "user-secret-1").await;
        (id, token)
    }

    /// Opens a platform session and returns the session-bound token.
    pub async fn connect(&self, token: &str) -> String {
        let (status, body) = self
            .send(
                Method::POST,
                "/api/platform/connect",
                Some(token),
                Some(serde_json::json!({
                    "endpoint": "https://vcenter.test/sdk",
                    "username": "administrator@vsphere.local",
                    "password": "vc-secret",
                    "insecure_tls": true
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "connect failed: {body}");
        body["data"]["token"].as_str().unwrap().to_string()
    }
}
