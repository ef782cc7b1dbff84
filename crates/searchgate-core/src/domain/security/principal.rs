//! Identities that operations run under

use serde::{Deserialize, Serialize};
use std::fmt;

/// Who an operation is executed for
///
/// Queue maintenance always runs as `System`; searches run as the calling user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Principal {
    /// Elevated identity that bypasses row-level policies
    System,
    /// An authenticated user and the roles granted to them
    User { username: String, roles: Vec<String> },
}

impl Principal {
    pub fn system() -> Self {
        Self::System
    }

    pub fn user(username: impl Into<String>) -> Self {
        Self::User {
            username: username.into(),
            roles: Vec::new(),
        }
    }

    /// Add a role (no-op for `System`)
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        if let Self::User { roles, .. } = &mut self {
            let role = role.into();
            if !roles.contains(&role) {
                roles.push(role);
            }
        }
        self
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Self::System)
    }

    pub fn has_role(&self, role: &str) -> bool {
        match self {
            Self::System => false,
            Self::User { roles, .. } => roles.iter().any(|r| r == role),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::System => "system",
            Self::User { username, .. } => username,
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User { username, .. } => write!(f, "user:{}", username),
        }
    }
}
