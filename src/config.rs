//! Runtime configuration for the operator
//!
//! Populated from CLI flags / environment in `main.rs`; `Default` carries
//! the production intervals.

use std::time::Duration;

/// Extensions PgHero needs on every PostgreSQL target
pub const REQUIRED_EXTENSIONS: &[&str] = &["pg_stat_statements"];

#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Namespace to watch; `None` watches the whole cluster
    pub watch_namespace: Option<String>,
    /// Maximum number of Databases reconciled in parallel
    pub concurrency: u16,
    /// Requeue after a successful reconcile (drift correction)
    pub ready_requeue: Duration,
    /// Requeue while extensions are being set up
    pub configuring_requeue: Duration,
    /// Requeue after a phase `Error`
    pub error_requeue: Duration,
    /// Attempts of the ConfigMap compare-and-swap loop
    pub conflict_retries: u32,
    /// Deadline for opening a database session
    pub db_connect_timeout: Duration,
    /// Upper bound on the life of a database session
    pub db_connection_lifetime: Duration,
    /// Deadline for a whole reconcile
    pub reconcile_timeout: Duration,
    pub required_extensions: Vec<String>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            concurrency: 4,
            ready_requeue: Duration::from_secs(300),
            configuring_requeue: Duration::from_secs(30),
            error_requeue: Duration::from_secs(60),
            conflict_retries: 5,
            db_connect_timeout: Duration::from_secs(10),
            db_connection_lifetime: Duration::from_secs(10),
            reconcile_timeout: Duration::from_secs(60),
            required_extensions: REQUIRED_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
        }
    }
}
