//! Shared types for the Database custom resource
//!
//! - [`DatabaseType`] - engine behind a connection (only PostgreSQL gets extension handling)
//! - [`Phase`] - reconcile state machine position
//! - [`ConnectionStatus`] - outcome of the last reachability check
//! - [`SecretReference`] - pointer into a Kubernetes Secret
//! - [`Condition`] - Kubernetes-style status condition

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Database engine behind a connection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    #[default]
    Postgresql,
    Mysql,
}

impl DatabaseType {
    /// Only PostgreSQL targets get `pg_stat_statements` provisioning
    pub fn requires_extensions(&self) -> bool {
        matches!(self, DatabaseType::Postgresql)
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseType::Postgresql => write!(f, "postgresql"),
            DatabaseType::Mysql => write!(f, "mysql"),
        }
    }
}

/// Reconcile phase of a Database
///
/// `Pending` until first reconciled, `Configuring` while extensions are
/// not yet in place, then `Ready` or `Error`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum Phase {
    #[default]
    Pending,
    Configuring,
    Ready,
    Error,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Pending => write!(f, "Pending"),
            Phase::Configuring => write!(f, "Configuring"),
            Phase::Ready => write!(f, "Ready"),
            Phase::Error => write!(f, "Error"),
        }
    }
}

/// Result of the last connection attempt against the target database
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ConnectionStatus {
    Connected,
    /// Connection could be configured but the server did not answer
    Unreachable,
    /// The URL could not be turned into a connection at all
    Failed,
}

/// Reference to a key inside a Kubernetes Secret
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    /// Name of the Secret
    pub name: String,

    /// Key within the Secret's data
    pub key: String,

    /// Namespace of the Secret (defaults to the Database's namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl SecretReference {
    /// Namespace to look the Secret up in
    pub fn namespace_or<'a>(&'a self, default: &'a str) -> &'a str {
        match self.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => ns,
            _ => default,
        }
    }
}

/// Condition for status reporting (Kubernetes convention)
///
/// ```rust,no_run
/// use pghero_operator::crd::Condition;
///
/// let condition = Condition::ready(true, "Ready", "Database configuration synchronized");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition, e.g. "Ready"
    #[serde(rename = "type")]
    pub type_: String,
    /// "True", "False" or "Unknown"
    pub status: String,
    /// Last time the status flipped (RFC 3339)
    pub last_transition_time: String,
    /// Machine-readable reason; the phase name for the Ready condition
    pub reason: String,
    /// Human-readable message
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a new Ready condition
    pub fn ready(status: bool, reason: &str, message: &str) -> Self {
        Self {
            type_: "Ready".to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            last_transition_time: chrono::Utc::now().to_rfc3339(),
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation: None,
        }
    }
}
