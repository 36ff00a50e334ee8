use anyhow::Result;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, Statement};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::{BootstrapConfig, SecurityConfig};
use crate::domain::{Role, User, UserId};

pub mod migrator;
pub mod repositories;

pub use repositories::user::InsertOutcome;

#[derive(Clone)]
pub struct Store {
    pub conn: DatabaseConnection,
    assignment_lock: Arc<Mutex<()>>,
}

impl Store {
    pub async fn new(db_url: &str) -> Result<Self> {
        Self::with_pool_options(db_url, 5, 1).await
    }

    pub async fn with_pool_options(
        db_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self> {
        use sea_orm_migration::MigratorTrait;

        let in_memory = db_url.contains(":memory:");

        if !in_memory {
            let path_str = db_url.trim_start_matches("sqlite:");
            if let Some(parent) = Path::new(path_str).parent() {
                tokio::fs::create_dir_all(parent).await.ok();
            }
            if !Path::new(path_str).exists() {
                std::fs::File::create(path_str)?;
            }
        }

        // Every pooled connection to `sqlite::memory:` is its own database.
        let max_connections = if in_memory { 1 } else { max_connections };
        let min_connections = min_connections.min(max_connections);

        let mut opt = ConnectOptions::new(db_url.to_string());
        opt.max_connections(max_connections)
            .min_connections(min_connections)
            .connect_timeout(Duration::from_secs(10))
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(300))
            .sqlx_logging(false);

        if !in_memory {
            opt.max_lifetime(Duration::from_secs(600));
        }

        let conn = Database::connect(opt).await?;

        migrator::Migrator::up(&conn, None).await?;

        info!(
            "Database connected & migrations applied (pool: {}-{})",
            min_connections, max_connections
        );

        Ok(Self {
            conn,
            assignment_lock: Arc::new(Mutex::new(())),
        })
    }

    pub async fn ping(&self) -> Result<()> {
        let backend = self.conn.get_database_backend();
        self.conn
            .query_one(Statement::from_string(backend, "SELECT 1".to_string()))
            .await?;
        Ok(())
    }

    pub fn user_repo(&self) -> repositories::user::UserRepository {
        repositories::user::UserRepository::new(self.conn.clone(), self.assignment_lock.clone())
    }

    /// Creates the configured admin account when the table is empty and a
    /// bootstrap secret was provided. Returns the created user, if any.
    pub async fn bootstrap_admin(
        &self,
        bootstrap: &BootstrapConfig,
        security: &SecurityConfig,
    ) -> Result<Option<User>> {
        let Some(secret) = bootstrap.admin_secret.as_deref() else {
            return Ok(None);
        };

        let repo = self.user_repo();
        if repo.count().await? > 0 {
            return Ok(None);
        }

        match repo
            .create(&bootstrap.admin_username, secret, Role::Admin, security)
            .await?
        {
            InsertOutcome::Created(user) => {
                info!(username = %user.username, "Bootstrapped initial admin account");
                Ok(Some(user))
            }
            InsertOutcome::UsernameTaken => Ok(None),
        }
    }

    pub async fn count_users(&self) -> Result<u64> {
        self.user_repo().count().await
    }

    pub async fn list_users(&self) -> Result<Vec<User>> {
        self.user_repo().list_all().await
    }

    pub async fn get_user(&self, id: &UserId) -> Result<Option<User>> {
        self.user_repo().get_by_id(id).await
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        self.user_repo().get_by_username(username).await
    }

    pub async fn verify_user_credentials(
        &self,
        username: &str,
        secret: &str,
    ) -> Result<Option<User>> {
        self.user_repo().verify_credentials(username, secret).await
    }

    pub async fn verify_user_secret(&self, id: &UserId, secret: &str) -> Result<bool> {
        self.user_repo().verify_secret_for(id, secret).await
    }

    pub async fn create_user(
        &self,
        username: &str,
        secret: &str,
        role: Role,
        security: &SecurityConfig,
    ) -> Result<InsertOutcome> {
        self.user_repo()
            .create(username, secret, role, security)
            .await
    }

    pub async fn update_user_secret(
        &self,
        id: &UserId,
        new_secret: &str,
        security: &SecurityConfig,
    ) -> Result<bool> {
        self.user_repo()
            .update_secret(id, new_secret, security)
            .await
    }

    pub async fn assign_vm(&self, id: &UserId, vm_id: &str) -> Result<Option<Vec<String>>> {
        self.user_repo().assign_vm(id, vm_id).await
    }

    pub async fn unassign_vm(&self, id: &UserId, vm_id: &str) -> Result<Option<Vec<String>>> {
        self.user_repo().unassign_vm(id, vm_id).await
    }

    pub async fn delete_user(&self, id: &UserId) -> Result<bool> {
        self.user_repo().delete(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> Store {
        Store::new("sqlite::memory:").await.unwrap()
    }

    fn fast_security() -> SecurityConfig {
        SecurityConfig {
            argon2_memory_cost_kib: 1024,
            argon2_time_cost: 1,
            ..SecurityConfig::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_requires_secret() {
        let store = memory_store().await;
        let created = store
            .bootstrap_admin(&BootstrapConfig::default(), &fast_security())
            .await
            .unwrap();
        assert!(created.is_none());
        assert_eq!(store.count_users().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn bootstrap_creates_single_admin_once() {
        let store = memory_store().await;
        let bootstrap = BootstrapConfig {
            admin_username: "admin".to_string(),
            admin_secret: Some("123456".to_string()),
        };

        let first = store
            .bootstrap_admin(&bootstrap, &fast_security())
            .await
            .unwrap()
            .expect("admin created");
        assert_eq!(first.role, Role::Admin);

        let second = store
            .bootstrap_admin(&bootstrap, &fast_security())
            .await
            .unwrap();
        assert!(second.is_none());
        assert_eq!(store.count_users().await.unwrap(), 1);

        let user = store
            .verify_user_credentials("admin", "123456")
            .await
            .unwrap()
            .expect("credentials verify");
        assert_eq!(user.id, first.id);
        assert!(
            store
                .verify_user_credentials("admin", "1234567")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn duplicate_username_is_reported() {
        let store = memory_store().await;
        let security = fast_security();

        let first = store
            .create_user("alice", "s3cret-pass", Role::User, &security)
            .await
            .unwrap();
        assert!(matches!(first, InsertOutcome::Created(_)));

        let second = store
            .create_user("alice", "other-pass", Role::Admin, &security)
            .await
            .unwrap();
        assert!(matches!(second, InsertOutcome::UsernameTaken));
    }

    #[tokio::test]
    async fn assignment_round_trip_and_idempotence() {
        let store = memory_store().await;
        let InsertOutcome::Created(user) = store
            .create_user("bob", "s3cret-pass", Role::User, &fast_security())
            .await
            .unwrap()
        else {
            panic!("user not created");
        };

        assert_eq!(
            store.assign_vm(&user.id, "vm-1").await.unwrap(),
            Some(vec!["vm-1".to_string()])
        );
        assert_eq!(
            store.assign_vm(&user.id, "vm-1").await.unwrap(),
            Some(vec!["vm-1".to_string()])
        );
        assert_eq!(
            store.unassign_vm(&user.id, "vm-1").await.unwrap(),
            Some(vec![])
        );
        assert_eq!(
            store.unassign_vm(&user.id, "vm-1").await.unwrap(),
            Some(vec![])
        );

        let missing = UserId::from("user-missing");
        assert_eq!(store.assign_vm(&missing, "vm-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn concurrent_assignments_are_not_lost() {
        let store = memory_store().await;
        let InsertOutcome::Created(user) = store
            .create_user("carol", "s3cret-pass", Role::User, &fast_security())
            .await
            .unwrap()
        else {
            panic!("user not created");
        };

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let id = user.id.clone();
            handles.push(tokio::spawn(async move {
                store.assign_vm(&id, &format!("vm-{i}")).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let user = store.get_user(&user.id).await.unwrap().unwrap();
        assert_eq!(user.assigned_vms.len(), 8);
    }

    #[tokio::test]
    async fn delete_reports_missing() {
        let store = memory_store().await;
        assert!(!store.delete_user(&UserId::from("nope")).await.unwrap());
    }
}
