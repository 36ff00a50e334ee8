use anyhow::{Context, Result};
use argon2::{
    Algorithm, Argon2, Params, Version,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task;
use tracing::info;

use crate::config::SecurityConfig;
use crate::domain::{self, Role, User, UserId};
use crate::entities::{prelude::*, users};

/// Result of inserting a user whose username may already exist.
#[derive(Debug)]
pub enum InsertOutcome {
    Created(User),
    UsernameTaken,
}

pub struct UserRepository {
    conn: DatabaseConnection,
    assignment_lock: Arc<Mutex<()>>,
}

impl UserRepository {
    #[must_use]
    pub const fn new(conn: DatabaseConnection, assignment_lock: Arc<Mutex<()>>) -> Self {
        Self {
            conn,
            assignment_lock,
        }
    }

    // ========================================================================
    // Model Conversion Helpers
    // ========================================================================

    fn map_model(model: users::Model) -> Result<User> {
        let role: Role = model
            .role
            .parse()
            .with_context(|| format!("Corrupt role for user {}", model.id))?;

        let assigned_vms = decode_vm_list(&model.assigned_vms)
            .with_context(|| format!("Corrupt assigned_vms for user {}", model.id))?;

        Ok(User {
            id: UserId::from(model.id),
            username: model.username,
            role,
            assigned_vms,
            created_at: model.created_at,
            updated_at: model.updated_at,
        })
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn count(&self) -> Result<u64> {
        Users::find()
            .count(&self.conn)
            .await
            .context("Failed to count users")
    }

    pub async fn list_all(&self) -> Result<Vec<User>> {
        let rows = Users::find()
            .order_by_asc(users::Column::CreatedAt)
            .order_by_asc(users::Column::Username)
            .all(&self.conn)
            .await
            .context("Failed to list users")?;

        rows.into_iter().map(Self::map_model).collect()
    }

    pub async fn get_by_id(&self, id: &UserId) -> Result<Option<User>> {
        let user = Users::find_by_id(id.as_str())
            .one(&self.conn)
            .await
            .context("Failed to query user by ID")?;

        user.map(Self::map_model).transpose()
    }

    pub async fn get_by_username(&self, username: &str) -> Result<Option<User>> {
        let user = Users::find()
            .filter(users::Column::Username.eq(username))
            .one(&self.conn)
            .await
            .context("Failed to query user by username")?;

        user.map(Self::map_model).transpose()
    }

    /// Returns the user when the username exists and the secret verifies.
    pub async fn verify_credentials(&self, username: &str, secret: &str) -> Result<Option<User>> {
        let user = Users::find()
            .filter(users::Column::Username.eq(username))
            .one(&self.conn)
            .await
            .context("Failed to query user for credential verification")?;

        let Some(user) = user else {
            return Ok(None);
        };

        if verify_secret(user.password_hash.clone(), secret.to_string()).await? {
            Self::map_model(user).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Verifies a secret for a user id. Unknown ids never verify.
    pub async fn verify_secret_for(&self, id: &UserId, secret: &str) -> Result<bool> {
        let user = Users::find_by_id(id.as_str())
            .one(&self.conn)
            .await
            .context("Failed to query user for secret verification")?;

        match user {
            Some(user) => verify_secret(user.password_hash, secret.to_string()).await,
            None => Ok(false),
        }
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    pub async fn create(
        &self,
        username: &str,
        secret: &str,
        role: Role,
        config: &SecurityConfig,
    ) -> Result<InsertOutcome> {
        if self.get_by_username(username).await?.is_some() {
            return Ok(InsertOutcome::UsernameTaken);
        }

        let secret = secret.to_string();
        let config = config.clone();
        let password_hash = task::spawn_blocking(move || hash_password(&secret, Some(&config)))
            .await
            .context("Password hashing task panicked")??;

        let now = chrono::Utc::now().to_rfc3339();
        let id = UserId::generate();

        let active = users::ActiveModel {
            id: Set(id.to_string()),
            username: Set(username.to_string()),
            password_hash: Set(password_hash),
            role: Set(role.as_str().to_string()),
            assigned_vms: Set(encode_vm_list(&[])?),
            created_at: Set(now.clone()),
            updated_at: Set(now),
        };

        // The unique index still guards against a concurrent insert that
        // slipped past the lookup above.
        match Users::insert(active).exec(&self.conn).await {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => return Ok(InsertOutcome::UsernameTaken),
            Err(e) => return Err(e).context("Failed to insert user"),
        }

        info!(user_id = %id, username, role = %role, "Created user");

        let user = self
            .get_by_id(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("User {id} vanished after insert"))?;

        Ok(InsertOutcome::Created(user))
    }

    /// Replaces the secret hash. Returns false when the user does not exist.
    pub async fn update_secret(
        &self,
        id: &UserId,
        new_secret: &str,
        config: &SecurityConfig,
    ) -> Result<bool> {
        let Some(user) = Users::find_by_id(id.as_str())
            .one(&self.conn)
            .await
            .context("Failed to query user for secret update")?
        else {
            return Ok(false);
        };

        let secret = new_secret.to_string();
        let config = config.clone();
        let new_hash = task::spawn_blocking(move || hash_password(&secret, Some(&config)))
            .await
            .context("Password hashing task panicked")??;

        let mut active: users::ActiveModel = user.into();
        active.password_hash = Set(new_hash);
        active.updated_at = Set(chrono::Utc::now().to_rfc3339());
        active.update(&self.conn).await?;

        Ok(true)
    }

    /// Adds a VM to the user's list. `None` when the user does not exist.
    pub async fn assign_vm(&self, id: &UserId, vm_id: &str) -> Result<Option<Vec<String>>> {
        self.modify_vms(id, |vms| domain::assign_vm(vms, vm_id))
            .await
    }

    /// Removes a VM from the user's list. `None` when the user does not exist.
    pub async fn unassign_vm(&self, id: &UserId, vm_id: &str) -> Result<Option<Vec<String>>> {
        self.modify_vms(id, |vms| domain::unassign_vm(vms, vm_id))
            .await
    }

    /// Read-modify-write of `assigned_vms`, serialized across the process and
    /// run inside a transaction.
    async fn modify_vms<F>(&self, id: &UserId, change: F) -> Result<Option<Vec<String>>>
    where
        F: FnOnce(&mut Vec<String>) -> bool,
    {
        let _guard = self.assignment_lock.lock().await;

        let txn = self
            .conn
            .begin()
            .await
            .context("Failed to start assignment transaction")?;

        let Some(user) = Users::find_by_id(id.as_str())
            .one(&txn)
            .await
            .context("Failed to load user for VM assignment")?
        else {
            txn.rollback().await?;
            return Ok(None);
        };

        let mut vms = decode_vm_list(&user.assigned_vms)?;

        if change(&mut vms) {
            let mut active: users::ActiveModel = user.into();
            active.assigned_vms = Set(encode_vm_list(&vms)?);
            active.updated_at = Set(chrono::Utc::now().to_rfc3339());
            active.update(&txn).await?;
        }

        txn.commit()
            .await
            .context("Failed to commit assignment transaction")?;

        Ok(Some(vms))
    }

    pub async fn delete(&self, id: &UserId) -> Result<bool> {
        let result = Users::delete_by_id(id.as_str())
            .exec(&self.conn)
            .await
            .context("Failed to delete user")?;

        Ok(result.rows_affected > 0)
    }
}

fn decode_vm_list(raw: &str) -> Result<Vec<String>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(raw)?)
}

fn encode_vm_list(vms: &[String]) -> Result<String> {
    Ok(serde_json::to_string(vms)?)
}

fn is_unique_violation(err: &sea_orm::DbErr) -> bool {
    matches!(
        err.sql_err(),
        Some(sea_orm::SqlErr::UniqueConstraintViolation(_))
    )
}

/// Runs Argon2 verification on the blocking pool.
async fn verify_secret(password_hash: String, secret: String) -> Result<bool> {
    task::spawn_blocking(move || {
        let parsed_hash = PasswordHash::new(&password_hash)
            .map_err(|e| anyhow::anyhow!("Invalid password hash format: {e}"))?;

        Ok::<bool, anyhow::Error>(
            Argon2::default()
                .verify_password(secret.as_bytes(), &parsed_hash)
                .is_ok(),
        )
    })
    .await
    .context("Password verification task panicked")?
}

/// Hash a password using Argon2id with optional custom params.
/// If config is None, uses the library defaults.
pub fn hash_password(password: &str, config: Option<&SecurityConfig>) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);

    let argon2 = if let Some(cfg) = config {
        let params = Params::new(
            cfg.argon2_memory_cost_kib,
            cfg.argon2_time_cost,
            cfg.argon2_parallelism,
            None,
        )
        .map_err(|e| anyhow::anyhow!("Invalid Argon2 params: {e}"))?;
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
    } else {
        Argon2::default()
    };

    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Failed to hash password: {e}"))?;

    Ok(hash.to_string())
}
