//! Domain service for dashboard user management and VM assignment.

use thiserror::Error;

use crate::domain::{Role, User, UserId};

#[derive(Debug, Error)]
pub enum UserError {
    #[error("Username '{0}' already exists")]
    DuplicateUsername(String),

    #[error("Current password is incorrect")]
    WrongCurrentPassword,

    #[error("User {0} not found")]
    NotFound(String),

    #[error("{0}")]
    InvalidOperation(String),

    #[error("{0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl From<anyhow::Error> for UserError {
    fn from(err: anyhow::Error) -> Self {
        Self::Database(format!("{err:#}"))
    }
}

/// Input for creating a user.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub secret: String,
    pub role: Role,
}

#[async_trait::async_trait]
pub trait UserService: Send + Sync {
    async fn list(&self) -> Result<Vec<User>, UserError>;

    async fn get(&self, id: &UserId) -> Result<User, UserError>;

    /// # Errors
    ///
    /// [`UserError::DuplicateUsername`] if the name is taken,
    /// [`UserError::Validation`] for an empty name or short secret.
    async fn create(&self, input: NewUser) -> Result<User, UserError>;

    /// Deletes `target` on behalf of `actor`. Deleting oneself is refused.
    async fn delete(&self, actor: &UserId, target: &UserId) -> Result<(), UserError>;

    async fn change_password(
        &self,
        id: &UserId,
        current: &str,
        new: &str,
    ) -> Result<(), UserError>;

    /// Sets a new secret without knowing the old one. Operator use only.
    async fn reset_secret(&self, username: &str, new: &str) -> Result<(), UserError>;

    /// Idempotent. Returns the resulting VM list.
    async fn assign_vm(&self, id: &UserId, vm_id: &str) -> Result<Vec<String>, UserError>;

    /// Idempotent. Returns the resulting VM list.
    async fn unassign_vm(&self, id: &UserId, vm_id: &str) -> Result<Vec<String>, UserError>;
}
