//! In-memory registry of live platform sessions.
//!
//! Each session owns one authenticated [`PlatformConnection`]. Entries are
//! removed from the map before their connection is released, and only the
//! caller that removed an entry releases it, so a connection is logged out
//! at most once no matter how disconnect, lazy expiry, the sweep and
//! shutdown interleave.

pub mod clock;

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::platform::{ConnectRequest, Platform, PlatformConnection, PlatformError};

pub use clock::{Clock, ManualClock, SystemClock};

const TOKEN_BYTES: usize = 32;

struct SessionEntry {
    owner: String,
    connection: Arc<dyn PlatformConnection>,
    created_at: DateTime<Utc>,
    released: AtomicBool,
}

impl SessionEntry {
    /// Logs the connection out unless that already happened. Failures are
    /// logged and dropped.
    async fn release(&self, token: &str) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.connection.logout().await {
            warn!(session = %short(token), error = %e, "Failed to release platform session");
        }
    }
}

/// A validated session, cheap to clone and hand to a request.
#[derive(Clone)]
pub struct SessionHandle {
    pub token: String,
    pub connection: Arc<dyn PlatformConnection>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("token", &short(&self.token))
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

pub struct SessionRegistry {
    platform: Arc<dyn Platform>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    sessions: Mutex<HashMap<String, Arc<SessionEntry>>>,
    teardown_armed: AtomicBool,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(platform: Arc<dyn Platform>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            platform,
            clock,
            ttl,
            sessions: Mutex::new(HashMap::new()),
            teardown_armed: AtomicBool::new(false),
        }
    }

    /// Connects to the platform and registers a new session for `owner`.
    ///
    /// The endpoint inside `request` has already been validated, so every
    /// error here comes from the platform itself.
    pub async fn open(
        &self,
        owner: &str,
        request: &ConnectRequest,
    ) -> Result<SessionHandle, PlatformError> {
        let connection = self.platform.connect(request).await?;
        let created_at = self.clock.now();

        let entry = Arc::new(SessionEntry {
            owner: owner.to_string(),
            connection: connection.clone(),
            created_at,
            released: AtomicBool::new(false),
        });

        let token = {
            let mut sessions = self.sessions.lock().await;
            let mut token = generate_token();
            while sessions.contains_key(&token) {
                token = generate_token();
            }
            sessions.insert(token.clone(), entry);
            token
        };

        if !self.teardown_armed.swap(true, Ordering::AcqRel) {
            debug!("Armed platform session teardown");
        }

        info!(
            session = %short(&token),
            endpoint = %request.endpoint,
            username = %request.username,
            "Opened platform session"
        );

        Ok(SessionHandle {
            token,
            connection,
            created_at,
            expires_at: created_at + self.ttl,
        })
    }

    /// Looks up a live session. An expired entry is removed and released and
    /// reported as absent.
    pub async fn validate(&self, token: &str) -> Option<SessionHandle> {
        let expired = {
            let mut sessions = self.sessions.lock().await;
            let entry = sessions.get(token)?;

            if self.is_expired(entry) {
                sessions.remove(token)
            } else {
                return Some(SessionHandle {
                    token: token.to_string(),
                    connection: entry.connection.clone(),
                    created_at: entry.created_at,
                    expires_at: entry.created_at + self.ttl,
                });
            }
        };

        if let Some(entry) = expired {
            info!(session = %short(token), "Platform session expired");
            entry.release(token).await;
        }
        None
    }

    /// Removes and releases a session. Returns false when it was not live;
    /// an expired entry is still released but does not count.
    pub async fn close(&self, token: &str) -> bool {
        let (entry, live) = {
            let mut sessions = self.sessions.lock().await;
            let Some(entry) = sessions.remove(token) else {
                return false;
            };
            let live = !self.is_expired(&entry);
            (entry, live)
        };

        entry.release(token).await;
        if live {
            info!(session = %short(token), "Closed platform session");
        } else {
            info!(session = %short(token), "Platform session expired");
        }
        live
    }

    /// Removes and releases every session opened by `owner`.
    pub async fn close_owned_by(&self, owner: &str) -> usize {
        let owned: Vec<_> = {
            let mut sessions = self.sessions.lock().await;
            let tokens: Vec<String> = sessions
                .iter()
                .filter(|(_, entry)| entry.owner == owner)
                .map(|(token, _)| token.clone())
                .collect();
            tokens
                .into_iter()
                .filter_map(|token| sessions.remove(&token).map(|entry| (token, entry)))
                .collect()
        };

        futures::future::join_all(owned.iter().map(|(token, entry)| entry.release(token))).await;

        if !owned.is_empty() {
            info!(owner, count = owned.len(), "Closed platform sessions of owner");
        }
        owned.len()
    }

    /// Drains every session and releases each one independently.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<_> = self.sessions.lock().await.drain().collect();
        let count = drained.len();

        futures::future::join_all(
            drained
                .iter()
                .map(|(token, entry)| entry.release(token)),
        )
        .await;

        if count > 0 {
            info!(count, "Closed all platform sessions");
        }
        count
    }

    /// Removes and releases every expired session.
    pub async fn sweep_expired(&self) -> usize {
        let expired: Vec<_> = {
            let mut sessions = self.sessions.lock().await;
            let tokens: Vec<String> = sessions
                .iter()
                .filter(|(_, entry)| self.is_expired(entry))
                .map(|(token, _)| token.clone())
                .collect();
            tokens
                .into_iter()
                .filter_map(|token| sessions.remove(&token).map(|entry| (token, entry)))
                .collect()
        };

        for (token, entry) in &expired {
            entry.release(token).await;
        }

        if !expired.is_empty() {
            info!(count = expired.len(), "Swept expired platform sessions");
        }
        expired.len()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Process-exit teardown. Does nothing if no session was ever opened.
    pub async fn shutdown(&self) -> usize {
        if !self.teardown_armed.load(Ordering::Acquire) {
            return 0;
        }
        self.close_all().await
    }

    fn is_expired(&self, entry: &SessionEntry) -> bool {
        self.clock.now() - entry.created_at > self.ttl
    }
}

/// Runs `sweep_expired` on a fixed interval until the task is aborted.
pub fn spawn_sweeper(
    registry: Arc<SessionRegistry>,
    every: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let swept = registry.sweep_expired().await;
            if swept > 0 {
                metrics::counter!("vmcaptain_sessions_expired_total").increment(swept as u64);
            }
        }
    })
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn short(token: &str) -> &str {
    token.get(..8).unwrap_or(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{
        Endpoint, PowerCall, PowerState, SnapshotSpec, SnapshotTree, TaskRef, TaskStatus,
        Utilization, VmDetail, VmSummary,
    };
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingConnection {
        logouts: AtomicUsize,
        fail_logout: bool,
    }

    #[async_trait]
    impl PlatformConnection for CountingConnection {
        async fn list_vms(&self) -> Result<Vec<VmSummary>, PlatformError> {
            Ok(vec![])
        }
        async fn get_vm(&self, _: &str) -> Result<Option<VmDetail>, PlatformError> {
            Ok(None)
        }
        async fn power_state(&self, _: &str) -> Result<PowerState, PlatformError> {
            Ok(PowerState::PoweredOff)
        }
        async fn power(&self, _: &str, _: PowerCall) -> Result<Option<TaskRef>, PlatformError> {
            Ok(None)
        }
        async fn utilization(&self, _: &str) -> Result<Option<Utilization>, PlatformError> {
            Ok(None)
        }
        async fn snapshots(&self, _: &str) -> Result<Vec<SnapshotTree>, PlatformError> {
            Ok(vec![])
        }
        async fn create_snapshot(&self, _: &str, _: &SnapshotSpec) -> Result<TaskRef, PlatformError> {
            Ok(TaskRef("task".into()))
        }
        async fn task_status(&self, _: &TaskRef) -> Result<TaskStatus, PlatformError> {
            Ok(TaskStatus::Succeeded)
        }
        async fn logout(&self) -> Result<(), PlatformError> {
            self.logouts.fetch_add(1, Ordering::SeqCst);
            if self.fail_logout {
                Err(PlatformError::Unreachable("gone".into()))
            } else {
                Ok(())
            }
        }
    }

    /// Hands out the queued connections in order.
    struct QueuedPlatform {
        connections: std::sync::Mutex<Vec<Arc<CountingConnection>>>,
    }

    impl QueuedPlatform {
        fn new(connections: Vec<Arc<CountingConnection>>) -> Self {
            let mut connections = connections;
            connections.reverse();
            Self {
                connections: std::sync::Mutex::new(connections),
            }
        }
    }

    #[async_trait]
    impl Platform for QueuedPlatform {
        async fn connect(
            &self,
            _: &ConnectRequest,
        ) -> Result<Arc<dyn PlatformConnection>, PlatformError> {
            let conn = self
                .connections
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| PlatformError::AuthRejected("no more".into()))?;
            Ok(conn)
        }
    }

    fn request() -> ConnectRequest {
        ConnectRequest {
            endpoint: Endpoint::parse("https://vc.test/sdk").unwrap(),
            username: "administrator".into(),
            secret: "pw".into(),
            insecure_tls: true,
        }
    }

    fn registry(
        connections: Vec<Arc<CountingConnection>>,
    ) -> (SessionRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let registry = SessionRegistry::new(
            Arc::new(QueuedPlatform::new(connections)),
            clock.clone(),
            Duration::hours(24),
        );
        (registry, clock)
    }

    #[tokio::test]
    async fn tokens_are_64_hex_chars() {
        let (registry, _) = registry(vec![Arc::default()]);
        let handle = registry.open("user-1", &request()).await.unwrap();
        assert_eq!(handle.token.len(), 64);
        assert!(handle.token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(handle.expires_at - handle.created_at, Duration::hours(24));
    }

    #[tokio::test]
    async fn open_failure_registers_nothing() {
        let (registry, _) = registry(vec![]);
        assert!(matches!(
            registry.open("user-1", &request()).await,
            Err(PlatformError::AuthRejected(_))
        ));
        assert!(registry.is_empty().await);
        assert_eq!(registry.shutdown().await, 0);
    }

    #[tokio::test]
    async fn expiry_removes_once_and_releases_once() {
        let conn = Arc::new(CountingConnection::default());
        let (registry, clock) = registry(vec![conn.clone()]);
        let token = registry.open("user-1", &request()).await.unwrap().token;

        clock.advance(Duration::hours(24));
        assert!(registry.validate(&token).await.is_some(), "exactly 24h is still live");

        clock.advance(Duration::seconds(1));
        assert!(registry.validate(&token).await.is_none());
        assert!(registry.validate(&token).await.is_none());
        assert!(!registry.close(&token).await);
        assert_eq!(registry.sweep_expired().await, 0);

        assert_eq!(conn.logouts.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn close_is_true_then_false() {
        let conn = Arc::new(CountingConnection::default());
        let (registry, _) = registry(vec![conn.clone()]);
        let token = registry.open("user-1", &request()).await.unwrap().token;

        assert!(registry.close(&token).await);
        assert!(!registry.close(&token).await);
        assert!(registry.validate(&token).await.is_none());
        assert_eq!(conn.logouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_of_unswept_expired_session_is_not_live() {
        let conn = Arc::new(CountingConnection::default());
        let (registry, clock) = registry(vec![conn.clone()]);
        let token = registry.open("user-1", &request()).await.unwrap().token;

        clock.advance(Duration::hours(25));
        assert!(!registry.close(&token).await);
        assert!(registry.is_empty().await);
        assert_eq!(conn.logouts.load(Ordering::SeqCst), 1);

        assert!(!registry.close(&token).await);
        assert_eq!(conn.logouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_owned_by_leaves_other_owners() {
        let alice_a = Arc::new(CountingConnection::default());
        let bob = Arc::new(CountingConnection::default());
        let alice_b = Arc::new(CountingConnection::default());
        let (registry, _) = registry(vec![alice_a.clone(), bob.clone(), alice_b.clone()]);

        registry.open("user-alice", &request()).await.unwrap();
        let bob_token = registry.open("user-bob", &request()).await.unwrap().token;
        registry.open("user-alice", &request()).await.unwrap();

        assert_eq!(registry.close_owned_by("user-alice").await, 2);
        assert_eq!(registry.close_owned_by("user-alice").await, 0);
        assert_eq!(registry.len().await, 1);
        assert!(registry.validate(&bob_token).await.is_some());
        assert_eq!(alice_a.logouts.load(Ordering::SeqCst), 1);
        assert_eq!(alice_b.logouts.load(Ordering::SeqCst), 1);
        assert_eq!(bob.logouts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_close_releases_once() {
        let conn = Arc::new(CountingConnection::default());
        let (registry, _) = registry(vec![conn.clone()]);
        let registry = Arc::new(registry);
        let token = registry.open("user-1", &request()).await.unwrap().token;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let token = token.clone();
            handles.push(tokio::spawn(async move { registry.close(&token).await }));
        }

        let mut closed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                closed += 1;
            }
        }
        assert_eq!(closed, 1);
        assert_eq!(conn.logouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_all_continues_past_failures() {
        let failing = Arc::new(CountingConnection {
            fail_logout: true,
            ..CountingConnection::default()
        });
        let ok_a = Arc::new(CountingConnection::default());
        let ok_b = Arc::new(CountingConnection::default());
        let (registry, _) = registry(vec![ok_a.clone(), failing.clone(), ok_b.clone()]);

        for _ in 0..3 {
            registry.open("user-1", &request()).await.unwrap();
        }

        assert_eq!(registry.shutdown().await, 3);
        assert!(registry.is_empty().await);
        for conn in [&failing, &ok_a, &ok_b] {
            assert_eq!(conn.logouts.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn sweep_only_takes_expired() {
        let old = Arc::new(CountingConnection::default());
        let fresh = Arc::new(CountingConnection::default());
        let (registry, clock) = registry(vec![old.clone(), fresh.clone()]);

        let old_token = registry.open("user-1", &request()).await.unwrap().token;
        clock.advance(Duration::hours(20));
        let fresh_token = registry.open("user-1", &request()).await.unwrap().token;
        clock.advance(Duration::hours(5));

        assert_eq!(registry.sweep_expired().await, 1);
        assert_eq!(registry.len().await, 1);
        assert!(registry.validate(&old_token).await.is_none());
        assert!(registry.validate(&fresh_token).await.is_some());
        assert_eq!(old.logouts.load(Ordering::SeqCst), 1);
        assert_eq!(fresh.logouts.load(Ordering::SeqCst), 0);
    }
}
