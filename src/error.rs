//! Error types for the PgHero operator

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error (reads, writes, status persistence)
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Referenced Secret does not exist
    #[error("secret {namespace}/{name} not found")]
    SecretNotFound { namespace: String, name: String },

    /// Referenced Secret exists but lacks the requested key
    #[error("key {key} not found in secret {namespace}/{name}")]
    SecretKeyMissing {
        namespace: String,
        name: String,
        key: String,
    },

    /// The Secret value is not valid UTF-8
    #[error("value of key {key} in secret {namespace}/{name} is not valid UTF-8")]
    SecretValueInvalid {
        namespace: String,
        name: String,
        key: String,
    },

    /// Neither `url` nor `urlFromSecret` is set on the Database
    #[error("neither url nor urlFromSecret is set")]
    MissingUrl,

    /// Target database could not be reached
    #[error("database unreachable: {0}")]
    ConnectionError(String),

    /// Query against the target database failed
    #[error("database query failed: {0}")]
    DatabaseError(String),

    /// `CREATE EXTENSION` failed for a reason other than missing privileges
    #[error("failed to create extension {extension}: {message}")]
    ExtensionError { extension: String, message: String },

    /// A conditional write lost against a concurrent writer (HTTP 409)
    #[error("write conflict on {0}")]
    Conflict(String),

    /// The ConfigMap compare-and-swap loop ran out of attempts
    #[error("gave up updating ConfigMap {namespace}/{name} after {attempts} conflicting writes")]
    AggregationConflict {
        namespace: String,
        name: String,
        attempts: u32,
    },

    /// The reconcile deadline expired
    #[error("reconcile timed out after {0:?}")]
    Timeout(Duration),

    /// Rendering `database.yml` failed
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_yaml::Error),

    #[error("configuration error: {0}")]
    ConfigError(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether a quick retry is likely to succeed
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(e)) => e.code == 409 || e.code == 429 || e.code >= 500,
            Error::KubeError(_) => true,
            Error::Conflict(_) | Error::AggregationConflict { .. } | Error::Timeout(_) => true,
            Error::ConnectionError(_) | Error::DatabaseError(_) => true,
            Error::SecretNotFound { .. }
            | Error::SecretKeyMissing { .. }
            | Error::SecretValueInvalid { .. }
            | Error::MissingUrl
            | Error::ExtensionError { .. }
            | Error::SerializationError(_)
            | Error::ConfigError(_) => false,
        }
    }

    /// Short label for the `kind` dimension of the error counter
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::SecretNotFound { .. }
            | Error::SecretKeyMissing { .. }
            | Error::SecretValueInvalid { .. }
            | Error::MissingUrl => "secret",
            Error::ConnectionError(_) => "connection",
            Error::DatabaseError(_) | Error::ExtensionError { .. } => "database",
            Error::Conflict(_) | Error::AggregationConflict { .. } => "conflict",
            Error::Timeout(_) => "timeout",
            Error::SerializationError(_) => "serialization",
            Error::ConfigError(_) => "config",
        }
    }

    /// True for a 404 from the API server
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(e)) if e.code == 404)
    }
}
