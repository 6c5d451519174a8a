//! In-memory fakes shared by the controller tests
//!
//! [`FakeControlPlane`] keeps Databases, Secrets and ConfigMaps with
//! resourceVersions and enforces the same conditional-write rules as the
//! API server. Every call yields to the scheduler first so concurrent
//! reconciles interleave between read and write.
//!
//! [`FakeConnector`] maps URLs to scripted [`FakePg`] servers.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::ByteString;
use kube::core::ErrorResponse;
use kube::ResourceExt;

use crate::crd::{Database, DatabaseSpec, DatabaseStatus, DatabaseType};
use crate::error::{Error, Result};

use super::extensions::{extract_username, ConnectError, PgConnector, PgSession, SqlError};
use super::store::ControlPlane;

/// Build a Database the way the API server would hand it out
pub fn database(namespace: &str, name: &str, friendly: &str, url: Option<&str>) -> Database {
    let mut db = Database::new(
        name,
        DatabaseSpec {
            name: friendly.to_string(),
            url: url.map(str::to_string),
            url_from_secret: None,
            superuser_url: None,
            superuser_url_from_secret: None,
            database_type: DatabaseType::Postgresql,
            enabled: true,
        },
    );
    db.metadata.namespace = Some(namespace.to_string());
    db.metadata.generation = Some(1);
    db.metadata.uid = Some(format!("uid-{namespace}-{name}"));
    db
}

fn not_found(what: &str) -> Error {
    Error::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{what} not found"),
        reason: "NotFound".to_string(),
        code: 404,
    }))
}

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct State {
    databases: BTreeMap<Key, Database>,
    secrets: BTreeMap<Key, Secret>,
    config_maps: BTreeMap<Key, ConfigMap>,
    next_rv: u64,
    pending_conflicts: u32,
    config_map_writes: u32,
    status_patches: u32,
}

impl State {
    fn bump(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }
}

#[derive(Default)]
pub struct FakeControlPlane {
    state: Mutex<State>,
}

impl FakeControlPlane {
    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Store a Database, assigning it a fresh resourceVersion
    pub fn insert_database(&self, mut database: Database) -> Database {
        let mut state = self.state();
        database.metadata.resource_version = Some(state.bump());
        let k = key(&database.namespace_or_default(), &database.name_any());
        state.databases.insert(k, database.clone());
        database
    }

    pub fn insert_secret(&self, namespace: &str, name: &str, data: &[(&str, &str)]) {
        let mut secret = Secret::default();
        secret.metadata.name = Some(name.to_string());
        secret.metadata.namespace = Some(namespace.to_string());
        secret.data = Some(
            data.iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        );
        self.state().secrets.insert(key(namespace, name), secret);
    }

    /// Store a Secret holding raw bytes under `data_key`
    pub fn insert_secret_bytes(&self, namespace: &str, name: &str, data_key: &str, value: &[u8]) {
        let mut secret = Secret::default();
        secret.metadata.name = Some(name.to_string());
        secret.metadata.namespace = Some(namespace.to_string());
        secret.data = Some(BTreeMap::from([(data_key.to_string(), ByteString(value.to_vec()))]));
        self.state().secrets.insert(key(namespace, name), secret);
    }

    pub fn insert_config_map(&self, namespace: &str, mut config_map: ConfigMap) {
        let mut state = self.state();
        config_map.metadata.namespace = Some(namespace.to_string());
        config_map.metadata.resource_version = Some(state.bump());
        let k = key(namespace, &config_map.name_any());
        state.config_maps.insert(k, config_map);
    }

    pub fn database(&self, namespace: &str, name: &str) -> Option<Database> {
        self.state().databases.get(&key(namespace, name)).cloned()
    }

    pub fn config_map(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        self.state().config_maps.get(&key(namespace, name)).cloned()
    }

    /// Mark a Database for deletion; it disappears once no finalizer remains
    pub fn delete_database(&self, namespace: &str, name: &str) {
        let mut state = self.state();
        let rv = state.bump();
        let k = key(namespace, name);
        let Some(db) = state.databases.get_mut(&k) else {
            return;
        };
        if db.finalizers().is_empty() {
            state.databases.remove(&k);
            return;
        }
        db.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        db.metadata.resource_version = Some(rv);
    }

    /// Edit a stored Database as a user would (bumps generation)
    pub fn update_spec(&self, namespace: &str, name: &str, edit: impl FnOnce(&mut DatabaseSpec)) {
        let mut state = self.state();
        let rv = state.bump();
        if let Some(db) = state.databases.get_mut(&key(namespace, name)) {
            edit(&mut db.spec);
            db.metadata.generation = Some(db.metadata.generation.unwrap_or(0) + 1);
            db.metadata.resource_version = Some(rv);
        }
    }

    /// Make the next `n` ConfigMap writes lose against a simulated concurrent writer
    pub fn inject_config_map_conflicts(&self, n: u32) {
        self.state().pending_conflicts = n;
    }

    /// Successful ConfigMap creates and replaces so far
    pub fn config_map_writes(&self) -> u32 {
        self.state().config_map_writes
    }

    pub fn status_patches(&self) -> u32 {
        self.state().status_patches
    }

    /// Returns true when an injected conflict fired; the stored object moves on
    fn take_conflict(state: &mut State, k: &Key) -> bool {
        if state.pending_conflicts == 0 {
            return false;
        }
        state.pending_conflicts -= 1;
        let rv = state.bump();
        if let Some(existing) = state.config_maps.get_mut(k) {
            existing.metadata.resource_version = Some(rv);
        }
        true
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn get_database(&self, namespace: &str, name: &str) -> Result<Option<Database>> {
        tokio::task::yield_now().await;
        Ok(self.database(namespace, name))
    }

    async fn list_databases(&self, namespace: &str) -> Result<Vec<Database>> {
        tokio::task::yield_now().await;
        Ok(self
            .state()
            .databases
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, db)| db.clone())
            .collect())
    }

    async fn list_all_databases(&self) -> Result<Vec<Database>> {
        tokio::task::yield_now().await;
        Ok(self.state().databases.values().cloned().collect())
    }

    async fn set_finalizers(&self, database: &Database, finalizers: Vec<String>) -> Result<Database> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        let k = key(&database.namespace_or_default(), &database.name_any());
        let rv = state.bump();

        let Some(stored) = state.databases.get_mut(&k) else {
            return Err(not_found("Database"));
        };
        if stored.metadata.resource_version != database.metadata.resource_version {
            return Err(Error::Conflict(format!("Database {}/{}", k.0, k.1)));
        }

        stored.metadata.finalizers = Some(finalizers);
        stored.metadata.resource_version = Some(rv);
        let updated = stored.clone();

        if updated.metadata.deletion_timestamp.is_some() && updated.finalizers().is_empty() {
            state.databases.remove(&k);
        }
        Ok(updated)
    }

    async fn patch_status(&self, database: &Database, status: &DatabaseStatus) -> Result<()> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        let k = key(&database.namespace_or_default(), &database.name_any());
        let rv = state.bump();
        state.status_patches += 1;

        let Some(stored) = state.databases.get_mut(&k) else {
            return Err(not_found("Database"));
        };
        stored.status = Some(status.clone());
        stored.metadata.resource_version = Some(rv);
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        tokio::task::yield_now().await;
        Ok(self.state().secrets.get(&key(namespace, name)).cloned())
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        tokio::task::yield_now().await;
        Ok(self.config_map(namespace, name))
    }

    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<ConfigMap> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        let k = key(namespace, &config_map.name_any());

        if state.config_maps.contains_key(&k) || Self::take_conflict(&mut state, &k) {
            return Err(Error::Conflict(format!("ConfigMap {}/{}", k.0, k.1)));
        }

        let mut created = config_map.clone();
        created.metadata.namespace = Some(namespace.to_string());
        created.metadata.resource_version = Some(state.bump());
        state.config_maps.insert(k, created.clone());
        state.config_map_writes += 1;
        Ok(created)
    }

    async fn replace_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<ConfigMap> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        let k = key(namespace, &config_map.name_any());

        let Some(stored_rv) = state
            .config_maps
            .get(&k)
            .map(|cm| cm.metadata.resource_version.clone())
        else {
            return Err(not_found("ConfigMap"));
        };
        if stored_rv != config_map.metadata.resource_version || Self::take_conflict(&mut state, &k) {
            return Err(Error::Conflict(format!("ConfigMap {}/{}", k.0, k.1)));
        }

        let mut replaced = config_map.clone();
        replaced.metadata.namespace = Some(namespace.to_string());
        replaced.metadata.resource_version = Some(state.bump());
        state.config_maps.insert(k, replaced.clone());
        state.config_map_writes += 1;
        Ok(replaced)
    }
}

#[derive(Default)]
struct PgState {
    installed: Vec<String>,
    /// Only this user may create extensions
    creator: Option<String>,
    create_failure: Option<String>,
    grants_fail: bool,
    executed: Vec<String>,
}

/// Scripted PostgreSQL server; clones share state
#[derive(Clone, Default)]
pub struct FakePg {
    state: Arc<Mutex<PgState>>,
}

impl FakePg {
    pub fn with_extensions(installed: &[&str]) -> Self {
        let pg = Self::default();
        pg.state.lock().unwrap().installed = installed.iter().map(|s| s.to_string()).collect();
        pg
    }

    /// Reject `CREATE EXTENSION` from everyone but `user` with SQLSTATE 42501
    pub fn restricted_to(self, user: &str) -> Self {
        self.state.lock().unwrap().creator = Some(user.to_string());
        self
    }

    pub fn failing_create(self, message: &str) -> Self {
        self.state.lock().unwrap().create_failure = Some(message.to_string());
        self
    }

    pub fn failing_grants(self) -> Self {
        self.state.lock().unwrap().grants_fail = true;
        self
    }

    /// Statements that succeeded, in order
    pub fn executed(&self) -> Vec<String> {
        self.state.lock().unwrap().executed.clone()
    }

    pub fn installed(&self) -> Vec<String> {
        self.state.lock().unwrap().installed.clone()
    }
}

struct FakeSession {
    user: String,
    pg: FakePg,
    open: Arc<AtomicI64>,
    closed: bool,
}

#[async_trait]
impl PgSession for FakeSession {
    async fn installed_extensions(&mut self) -> std::result::Result<Vec<String>, SqlError> {
        Ok(self.pg.installed())
    }

    async fn execute(&mut self, statement: &str) -> std::result::Result<(), SqlError> {
        let mut state = self.pg.state.lock().unwrap();

        if let Some(ext) = statement.strip_prefix("CREATE EXTENSION IF NOT EXISTS ") {
            if let Some(message) = &state.create_failure {
                return Err(SqlError::new(message.clone()));
            }
            if state.creator.as_deref().is_some_and(|creator| creator != self.user) {
                return Err(SqlError {
                    code: Some("42501".to_string()),
                    message: format!("permission denied to create extension \"{ext}\""),
                });
            }
            if !state.installed.iter().any(|e| e == ext) {
                state.installed.push(ext.to_string());
            }
        } else if statement.starts_with("GRANT") && state.grants_fail {
            return Err(SqlError::new("role \"pg_monitor\" does not exist"));
        }

        state.executed.push(statement.to_string());
        Ok(())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// [`PgConnector`] resolving URLs to [`FakePg`] servers; unknown URLs are unreachable
#[derive(Default)]
pub struct FakeConnector {
    servers: Mutex<HashMap<String, FakePg>>,
    attempts: AtomicU32,
    open: Arc<AtomicI64>,
}

impl FakeConnector {
    pub fn with_server(self, url: &str, pg: FakePg) -> Self {
        self.servers.lock().unwrap().insert(url.to_string(), pg);
        self
    }

    pub fn connect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Sessions opened and not yet closed
    pub fn open_sessions(&self) -> i64 {
        self.open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PgConnector for FakeConnector {
    async fn connect(&self, url: &str) -> std::result::Result<Box<dyn PgSession>, ConnectError> {
        tokio::task::yield_now().await;
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if !url.starts_with("postgres://") && !url.starts_with("postgresql://") {
            return Err(ConnectError::InvalidUrl(format!("unsupported scheme in {url:?}")));
        }
        let pg = self
            .servers
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| ConnectError::Unreachable("connection refused".to_string()))?;

        self.open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            user: extract_username(url).to_string(),
            pg,
            open: self.open.clone(),
            closed: false,
        }))
    }
}
