//! Domain types for users and VM access with strong typing.
//!
//! The user record here is the shape handed to services and the HTTP layer.
//! It never carries the secret hash; that stays inside the repository.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Unique identifier for a dashboard user.
///
/// Wraps the string id (`user-<uuid>`) so it cannot be confused with a
/// username or a platform VM identifier.
///
/// # Examples
///
/// ```rust
/// use vmcaptain::domain::UserId;
///
/// let id = UserId::from("user-1");
/// assert_eq!(id.as_str(), "user-1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Generates a fresh identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("user-{}", uuid::Uuid::new_v4()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Role of a dashboard user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Admin,
    User,
}

impl Role {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "ADMIN",
            Self::User => "USER",
        }
    }

    #[must_use]
    pub const fn is_admin(&self) -> bool {
        matches!(self, Self::Admin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownRole(pub String);

impl fmt::Display for UnknownRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unknown role '{}', expected ADMIN or USER", self.0)
    }
}

impl std::error::Error for UnknownRole {}

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ADMIN" => Ok(Self::Admin),
            "USER" => Ok(Self::User),
            _ => Err(UnknownRole(s.to_string())),
        }
    }
}

/// A dashboard user without credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub role: Role,
    pub assigned_vms: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl User {
    /// Whether this user may see and operate the given VM.
    #[must_use]
    pub fn can_access_vm(&self, vm_id: &str) -> bool {
        self.role.is_admin() || self.assigned_vms.iter().any(|v| v == vm_id)
    }
}

/// Adds `vm_id` to the list if absent. Returns whether the list changed.
pub fn assign_vm(assigned: &mut Vec<String>, vm_id: &str) -> bool {
    if assigned.iter().any(|v| v == vm_id) {
        return false;
    }
    assigned.push(vm_id.to_string());
    true
}

/// Removes `vm_id` from the list if present. Returns whether the list changed.
pub fn unassign_vm(assigned: &mut Vec<String>, vm_id: &str) -> bool {
    let before = assigned.len();
    assigned.retain(|v| v != vm_id);
    assigned.len() != before
}
