//! PostgreSQL extension provisioning
//!
//! PgHero needs `pg_stat_statements`. The operator connects with the
//! Database's own credentials, creates whatever is missing, and when the
//! regular user lacks the privilege it retries through the optional
//! superuser credentials, then grants `pg_monitor` back to the regular user.
//!
//! Sessions are opened per call with a single connection and a short
//! lifetime; nothing is pooled across Databases or reconciles.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::Connection;
use tracing::{debug, error, info, instrument, warn};

use crate::config::OperatorConfig;
use crate::crd::{ConnectionStatus, Database, DatabaseStatus};
use crate::error::{Error, Result};

use super::resolver::resolve_superuser_url;
use super::store::ControlPlane;

/// SQLSTATE for insufficient_privilege
const SQLSTATE_INSUFFICIENT_PRIVILEGE: &str = "42501";

/// Error reported by a database session
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct SqlError {
    /// SQLSTATE when the server reported one
    pub code: Option<String>,
    pub message: String,
}

impl SqlError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    /// Whether the failure means "you are not allowed to do this" rather than a broken statement.
    ///
    /// The message match keeps the behaviour of the text-based check; the SQLSTATE covers
    /// servers running with a non-English `lc_messages`.
    pub fn is_permission_denied(&self) -> bool {
        self.message.contains("permission denied")
            || self.message.contains("must be superuser")
            || self.code.as_deref() == Some(SQLSTATE_INSUFFICIENT_PRIVILEGE)
    }
}

impl From<sqlx::Error> for SqlError {
    fn from(err: sqlx::Error) -> Self {
        let code = err
            .as_database_error()
            .and_then(|db| db.code())
            .map(|c| c.into_owned());
        Self {
            code,
            message: err.to_string(),
        }
    }
}

/// Failure to open a session
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectError {
    /// The URL could not be parsed into connection options
    #[error("invalid connection url: {0}")]
    InvalidUrl(String),
    /// Connecting or pinging the server failed
    #[error("{0}")]
    Unreachable(String),
}

/// Opens short-lived sessions against a target database
#[async_trait]
pub trait PgConnector: Send + Sync {
    async fn connect(&self, url: &str) -> std::result::Result<Box<dyn PgSession>, ConnectError>;
}

/// One open session; closed explicitly by the caller
#[async_trait]
pub trait PgSession: Send {
    /// `SELECT extname FROM pg_extension`
    async fn installed_extensions(&mut self) -> std::result::Result<Vec<String>, SqlError>;

    async fn execute(&mut self, statement: &str) -> std::result::Result<(), SqlError>;

    async fn close(&mut self);
}

/// [`PgConnector`] on top of sqlx
#[derive(Clone, Debug)]
pub struct SqlxConnector {
    connect_timeout: Duration,
    max_lifetime: Duration,
}

impl SqlxConnector {
    pub fn new(connect_timeout: Duration, max_lifetime: Duration) -> Self {
        Self {
            connect_timeout,
            max_lifetime,
        }
    }

    pub fn from_config(config: &OperatorConfig) -> Self {
        Self::new(config.db_connect_timeout, config.db_connection_lifetime)
    }
}

#[async_trait]
impl PgConnector for SqlxConnector {
    async fn connect(&self, url: &str) -> std::result::Result<Box<dyn PgSession>, ConnectError> {
        let options = PgConnectOptions::from_str(url)
            .map_err(|e| ConnectError::InvalidUrl(e.to_string()))?;

        let pool = PgPoolOptions::new()
            .max_connections(1)
            .min_connections(0)
            .max_lifetime(self.max_lifetime)
            .acquire_timeout(self.connect_timeout)
            .connect_with(options)
            .await
            .map_err(|e| ConnectError::Unreachable(e.to_string()))?;

        let mut conn = pool
            .acquire()
            .await
            .map_err(|e| ConnectError::Unreachable(e.to_string()))?;
        conn.ping()
            .await
            .map_err(|e| ConnectError::Unreachable(e.to_string()))?;
        drop(conn);

        Ok(Box::new(SqlxSession { pool }))
    }
}

struct SqlxSession {
    pool: PgPool,
}

#[async_trait]
impl PgSession for SqlxSession {
    async fn installed_extensions(&mut self) -> std::result::Result<Vec<String>, SqlError> {
        let names: Vec<String> = sqlx::query_scalar("SELECT extname FROM pg_extension")
            .fetch_all(&self.pool)
            .await?;
        Ok(names)
    }

    async fn execute(&mut self, statement: &str) -> std::result::Result<(), SqlError> {
        sqlx::query(statement).execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&mut self) {
        self.pool.close().await;
    }
}

/// Make sure every required extension exists on the Database's target.
///
/// Returns `Ok(true)` when all are present (or the engine is not PostgreSQL),
/// `Ok(false)` for conditions an operator has to fix (missing superuser
/// credentials), and `Err` for faults. Connection and extension fields of
/// `status` are updated in place either way.
#[instrument(skip_all, fields(name = %database.name_any(), namespace = %database.namespace_or_default()))]
pub async fn ensure_extensions(
    store: &dyn ControlPlane,
    connector: &dyn PgConnector,
    database: &Database,
    url: &str,
    required: &[String],
    status: &mut DatabaseStatus,
) -> Result<bool> {
    if !database.spec.database_type.requires_extensions() {
        debug!(
            database_type = %database.spec.database_type,
            "Skipping extension setup for non-PostgreSQL database"
        );
        return Ok(true);
    }

    let mut session = match connector.connect(url).await {
        Ok(session) => session,
        Err(ConnectError::InvalidUrl(msg)) => {
            status.connection_status = Some(ConnectionStatus::Failed);
            status.last_error = Some(format!("Failed to connect: {msg}"));
            return Err(Error::ConnectionError(format!("failed to open database connection: {msg}")));
        }
        Err(ConnectError::Unreachable(msg)) => {
            status.connection_status = Some(ConnectionStatus::Unreachable);
            status.last_error = Some(format!("Database unreachable: {msg}"));
            return Err(Error::ConnectionError(msg));
        }
    };

    status.connection_status = Some(ConnectionStatus::Connected);
    status.required_extensions = required.to_vec();

    let result = provision(store, connector, database, url, required, status, session.as_mut()).await;
    session.close().await;
    result
}

async fn provision(
    store: &dyn ControlPlane,
    connector: &dyn PgConnector,
    database: &Database,
    url: &str,
    required: &[String],
    status: &mut DatabaseStatus,
    session: &mut dyn PgSession,
) -> Result<bool> {
    let installed = list_installed(session, status).await?;

    let missing: Vec<&String> = required
        .iter()
        .filter(|ext| !installed.contains(ext))
        .collect();

    if missing.is_empty() {
        status.extensions_ready = true;
        status.last_error = None;
        info!("All required extensions are installed");
        return Ok(true);
    }

    info!(missing = ?missing, "Attempting to install missing extensions");

    for ext in missing {
        let statement = format!("CREATE EXTENSION IF NOT EXISTS {ext}");
        match session.execute(&statement).await {
            Ok(()) => info!(extension = %ext, "Installed extension"),
            Err(e) if e.is_permission_denied() => {
                info!(
                    extension = %ext,
                    "Permission denied with regular user, attempting with superuser credentials"
                );

                let superuser_url = match resolve_superuser_url(store, database).await {
                    Ok(Some(superuser_url)) => superuser_url,
                    Ok(None) => {
                        warn!(extension = %ext, "No superuser credentials available");
                        status.last_error = Some(format!(
                            "Permission denied to create extension {ext}. Database user needs \
                             superuser privileges or provide superuser credentials via \
                             superuserUrl or superuserUrlFromSecret."
                        ));
                        status.extensions_ready = false;
                        return Ok(false);
                    }
                    Err(err) => {
                        warn!(extension = %ext, error = %err, "Failed to resolve superuser credentials");
                        status.last_error = Some(format!(
                            "Permission denied to create extension {ext} and superuser \
                             credentials could not be resolved: {err}"
                        ));
                        status.extensions_ready = false;
                        return Ok(false);
                    }
                };

                if !create_as_superuser(connector, &superuser_url, ext, url).await {
                    status.last_error = Some(format!(
                        "Failed to create extension {ext} even with superuser credentials"
                    ));
                    status.extensions_ready = false;
                    return Ok(false);
                }
                info!(extension = %ext, "Installed extension with superuser credentials");
            }
            Err(e) => {
                status.last_error = Some(format!("Failed to create extension {ext}: {e}"));
                return Err(Error::ExtensionError {
                    extension: ext.clone(),
                    message: e.message,
                });
            }
        }
    }

    let installed = list_installed(session, status).await?;
    let still_missing: Vec<&String> = required
        .iter()
        .filter(|ext| !installed.contains(ext))
        .collect();

    status.extensions_ready = still_missing.is_empty();
    if status.extensions_ready {
        status.last_error = None;
        info!("All extensions successfully installed");
    } else {
        warn!(missing = ?still_missing, "Extensions still missing after installation");
        status.last_error = Some(format!(
            "Extensions still missing after installation: {}",
            still_missing
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }

    Ok(status.extensions_ready)
}

async fn list_installed(session: &mut dyn PgSession, status: &mut DatabaseStatus) -> Result<Vec<String>> {
    match session.installed_extensions().await {
        Ok(installed) => {
            status.installed_extensions = installed.clone();
            Ok(installed)
        }
        Err(e) => {
            status.last_error = Some(format!("Failed to query extensions: {e}"));
            Err(Error::DatabaseError(format!("failed to query extensions: {e}")))
        }
    }
}

/// Create `extension` through a separate superuser session and grant the
/// monitoring role to the user of `user_url`. Grant failures are logged only.
async fn create_as_superuser(
    connector: &dyn PgConnector,
    superuser_url: &str,
    extension: &str,
    user_url: &str,
) -> bool {
    let mut session = match connector.connect(superuser_url).await {
        Ok(session) => session,
        Err(e) => {
            error!(error = %e, "Failed to connect with superuser credentials");
            return false;
        }
    };

    let statement = format!("CREATE EXTENSION IF NOT EXISTS {extension}");
    let created = match session.execute(&statement).await {
        Ok(()) => true,
        Err(e) => {
            error!(extension = %extension, error = %e, "Failed to create extension as superuser");
            false
        }
    };

    if created {
        grant_monitoring(session.as_mut(), user_url).await;
    }

    session.close().await;
    created
}

async fn grant_monitoring(session: &mut dyn PgSession, user_url: &str) {
    let username = extract_username(user_url);
    if username.is_empty() || username == "postgres" {
        debug!("Skipping grants for empty or postgres user");
        return;
    }
    if !is_plain_identifier(username) {
        warn!(user = %username, "Skipping grants: user name is not a plain SQL identifier");
        return;
    }

    let grants = [
        format!("GRANT pg_monitor TO {username}"),
        format!("GRANT EXECUTE ON FUNCTION pg_stat_statements_reset TO {username}"),
    ];
    for grant in &grants {
        if let Err(e) = session.execute(grant).await {
            warn!(user = %username, error = %e, statement = %grant, "Failed to grant privilege");
        }
    }

    info!(user = %username, "Granted monitoring privileges to user");
}

/// User part of a `postgres://` / `postgresql://` URL.
///
/// Everything after the scheme up to the first `:`, or when there is no
/// such `:` (or it leads), up to the first `@`. Empty when neither applies.
pub fn extract_username(url: &str) -> &str {
    let rest = match url
        .strip_prefix("postgres://")
        .or_else(|| url.strip_prefix("postgresql://"))
    {
        Some(rest) => rest,
        None => return "",
    };

    match rest.find(':') {
        Some(idx) if idx > 0 => return &rest[..idx],
        _ => {}
    }
    match rest.find('@') {
        Some(idx) if idx > 0 => &rest[..idx],
        _ => "",
    }
}

fn is_plain_identifier(name: &str) -> bool {
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}
