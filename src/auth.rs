//! Static role assignment for API callers.
//!
//! The transport authenticates a caller and hands over its identity (the
//! client certificate's common name). This module only decides whether that
//! identity may perform an operation; it never talks to the network.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Status and Output
    Reader,
    /// All four operations
    Manager,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    StartJob,
    StopJob,
    GetJobStatus,
    StreamJobOutput,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::StartJob => write!(f, "StartJob"),
            Operation::StopJob => write!(f, "StopJob"),
            Operation::GetJobStatus => write!(f, "GetJobStatus"),
            Operation::StreamJobOutput => write!(f, "StreamJobOutput"),
        }
    }
}

impl Role {
    pub fn allows(&self, op: Operation) -> bool {
        match self {
            Role::Manager => true,
            Role::Reader => matches!(op, Operation::GetJobStatus | Operation::StreamJobOutput),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Unauthorized: unknown identity {0:?}")]
    Unauthorized(String),

    #[error("Forbidden: {identity:?} may not call {operation}")]
    Forbidden {
        identity: String,
        operation: Operation,
    },

    #[error("Failed to read role table: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid role table: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Identity -> role map, loaded once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleTable {
    roles: HashMap<String, Role>,
}

impl RoleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_role(mut self, identity: impl Into<String>, role: Role) -> Self {
        self.roles.insert(identity.into(), role);
        self
    }

    /// Parse `{"roles": {"alice": "manager", "bob": "reader"}}`.
    pub fn from_json(json: &str) -> Result<Self, AuthError> {
        Ok(serde_json::from_str(json)?)
    }

    pub async fn load(path: &Path) -> Result<Self, AuthError> {
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json(&json)
    }

    pub fn role_of(&self, identity: &str) -> Option<Role> {
        self.roles.get(identity).copied()
    }

    pub fn authorize(&self, identity: &str, operation: Operation) -> Result<Role, AuthError> {
        let role = self
            .role_of(identity)
            .ok_or_else(|| AuthError::Unauthorized(identity.to_string()))?;
        if !role.allows(operation) {
            tracing::warn!(identity, %operation, ?role, "Operation forbidden");
            return Err(AuthError::Forbidden {
                identity: identity.to_string(),
                operation,
            });
        }
        Ok(role)
    }
}
