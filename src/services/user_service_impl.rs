//! `SeaORM` implementation of the `UserService` trait.

use async_trait::async_trait;
use tracing::info;

use crate::config::SecurityConfig;
use crate::db::{InsertOutcome, Store};
use crate::domain::{User, UserId};
use crate::services::user_service::{NewUser, UserError, UserService};

pub struct SeaOrmUserService {
    store: Store,
    security: SecurityConfig,
}

impl SeaOrmUserService {
    #[must_use]
    pub const fn new(store: Store, security: SecurityConfig) -> Self {
        Self { store, security }
    }

    fn check_secret(&self, secret: &str) -> Result<(), UserError> {
        if secret.chars().count() < self.security.min_secret_length {
            return Err(UserError::Validation(format!(
                "Password must be at least {} characters",
                self.security.min_secret_length
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl UserService for SeaOrmUserService {
    async fn list(&self) -> Result<Vec<User>, UserError> {
        Ok(self.store.list_users().await?)
    }

    async fn get(&self, id: &UserId) -> Result<User, UserError> {
        self.store
            .get_user(id)
            .await?
            .ok_or_else(|| UserError::NotFound(id.to_string()))
    }

    async fn create(&self, input: NewUser) -> Result<User, UserError> {
        let username = input.username.trim();
        if username.is_empty() {
            return Err(UserError::Validation("Username is required".to_string()));
        }
        self.check_secret(&input.secret)?;

        match self
            .store
            .create_user(username, &input.secret, input.role, &self.security)
            .await?
        {
            InsertOutcome::Created(user) => Ok(user),
            InsertOutcome::UsernameTaken => Err(UserError::DuplicateUsername(username.to_string())),
        }
    }

    async fn delete(&self, actor: &UserId, target: &UserId) -> Result<(), UserError> {
        if actor == target {
            return Err(UserError::InvalidOperation(
                "You cannot delete your own account".to_string(),
            ));
        }

        if self.store.delete_user(target).await? {
            info!(user_id = %target, by = %actor, "Deleted user");
            Ok(())
        } else {
            Err(UserError::NotFound(target.to_string()))
        }
    }

    async fn change_password(
        &self,
        id: &UserId,
        current: &str,
        new: &str,
    ) -> Result<(), UserError> {
        self.check_secret(new)?;

        if current == new {
            return Err(UserError::Validation(
                "New password must be different from current password".to_string(),
            ));
        }

        if !self.store.verify_user_secret(id, current).await? {
            return Err(UserError::WrongCurrentPassword);
        }

        if !self.store.update_user_secret(id, new, &self.security).await? {
            return Err(UserError::NotFound(id.to_string()));
        }

        info!(user_id = %id, "Password changed");
        Ok(())
    }

    async fn reset_secret(&self, username: &str, new: &str) -> Result<(), UserError> {
        self.check_secret(new)?;

        let user = self
            .store
            .get_user_by_username(username)
            .await?
            .ok_or_else(|| UserError::NotFound(username.to_string()))?;

        self.store
            .update_user_secret(&user.id, new, &self.security)
            .await?;

        info!(user_id = %user.id, username, "Password reset");
        Ok(())
    }

    async fn assign_vm(&self, id: &UserId, vm_id: &str) -> Result<Vec<String>, UserError> {
        let vm_id = require_vm_id(vm_id)?;
        let vms = self
            .store
            .assign_vm(id, vm_id)
            .await?
            .ok_or_else(|| UserError::NotFound(id.to_string()))?;
        info!(user_id = %id, vm_id, "Assigned VM");
        Ok(vms)
    }

    async fn unassign_vm(&self, id: &UserId, vm_id: &str) -> Result<Vec<String>, UserError> {
        let vm_id = require_vm_id(vm_id)?;
        let vms = self
            .store
            .unassign_vm(id, vm_id)
            .await?
            .ok_or_else(|| UserError::NotFound(id.to_string()))?;
        info!(user_id = %id, vm_id, "Unassigned VM");
        Ok(vms)
    }
}

fn require_vm_id(vm_id: &str) -> Result<&str, UserError> {
    let vm_id = vm_id.trim();
    if vm_id.is_empty() {
        return Err(UserError::Validation("VM id is required".to_string()));
    }
    Ok(vm_id)
}
