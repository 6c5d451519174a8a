//! Main reconciler for Database resources
//!
//! Implements the controller pattern using kube-rs runtime.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::{
    api::Api,
    client::Client,
    runtime::{
        controller::{self, Action, Controller},
        watcher::Config,
    },
    ResourceExt,
};
use tracing::{debug, error, info, instrument, warn};

use crate::config::OperatorConfig;
use crate::crd::{Database, DatabaseStatus, Phase};
use crate::error::{Error, Result};

use super::aggregator;
use super::conditions::set_ready_condition;
use super::extensions::{ensure_extensions, PgConnector};
use super::finalizers::{add_finalizer, has_finalizer, is_being_deleted, remove_finalizer};
#[cfg(feature = "metrics")]
use super::metrics;
use super::resolver::resolve_url;
use super::store::ControlPlane;

#[cfg(feature = "metrics")]
const CONTROLLER_NAME: &str = "database";

/// Shared state for the controller
pub struct ControllerState {
    pub store: Arc<dyn ControlPlane>,
    pub connector: Arc<dyn PgConnector>,
    pub config: OperatorConfig,
}

impl ControllerState {
    pub fn new(
        store: Arc<dyn ControlPlane>,
        connector: Arc<dyn PgConnector>,
        config: OperatorConfig,
    ) -> Self {
        Self {
            store,
            connector,
            config,
        }
    }
}

/// Main entry point to start the controller
pub async fn run_controller(client: Client, state: Arc<ControllerState>) -> Result<()> {
    let databases: Api<Database> = match state.config.watch_namespace.as_deref() {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    info!(
        namespace = state.config.watch_namespace.as_deref().unwrap_or("<all>"),
        concurrency = state.config.concurrency,
        "Starting Database controller"
    );

    // Verify CRD exists
    match databases.list(&Default::default()).await {
        Ok(_) => info!("Database CRD is available"),
        Err(e) => {
            error!("Database CRD not found. Please install the CRD first: {:?}", e);
            return Err(Error::ConfigError("Database CRD not installed".to_string()));
        }
    }

    Controller::new(databases, Config::default())
        .with_config(controller::Config::default().concurrency(state.config.concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("Reconciled: {}", obj),
                Err(e) => warn!("Reconcile loop error: {:?}", e),
            }
        })
        .await;

    info!("Database controller stopped");
    Ok(())
}

/// The main reconciliation function
///
/// Called whenever a Database is created, updated or deleted, and when
/// the requeue timer expires. The work is bounded by the configured
/// reconcile timeout.
#[instrument(skip(obj, ctx), fields(name = %obj.name_any(), namespace = %obj.namespace_or_default()))]
async fn reconcile(obj: Arc<Database>, ctx: Arc<ControllerState>) -> Result<Action> {
    #[cfg(feature = "metrics")]
    let started = std::time::Instant::now();

    let namespace = obj.namespace_or_default();
    let name = obj.name_any();
    let deadline = ctx.config.reconcile_timeout;

    let result = match tokio::time::timeout(deadline, reconcile_database(&ctx, &namespace, &name)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(deadline)),
    };

    #[cfg(feature = "metrics")]
    metrics::observe_reconcile_duration_seconds(CONTROLLER_NAME, started.elapsed().as_secs_f64());

    result
}

/// Reconcile one Database by reference, reading its latest state first
pub(crate) async fn reconcile_database(
    ctx: &ControllerState,
    namespace: &str,
    name: &str,
) -> Result<Action> {
    let store = ctx.store.as_ref();

    let Some(database) = store.get_database(namespace, name).await? else {
        debug!("Database {}/{} no longer exists", namespace, name);
        return Ok(Action::await_change());
    };

    if is_being_deleted(&database) {
        return cleanup_database(ctx, &database).await;
    }

    let database = match add_finalizer(store, &database).await {
        Ok(database) => database,
        Err(e) if e.is_not_found() => return Ok(Action::await_change()),
        Err(e) => return Err(e),
    };

    apply_database(ctx, &database).await
}

/// Where a pass through the phase machine ended
struct Outcome {
    phase: Phase,
    message: String,
    config_map: Option<String>,
}

impl Outcome {
    fn new(phase: Phase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            config_map: None,
        }
    }
}

/// Drive a live Database towards Ready and persist the resulting status
async fn apply_database(ctx: &ControllerState, database: &Database) -> Result<Action> {
    let namespace = database.namespace_or_default();
    let name = database.name_any();

    info!("Reconciling Database {}/{}", namespace, name);

    let previous = database.status.clone().unwrap_or_default();
    let mut status = previous.clone();

    let outcome = converge(ctx, database, &mut status).await;
    let requeue = requeue_after(&ctx.config, outcome.phase);

    match outcome.phase {
        Phase::Ready => info!(message = %outcome.message, "Database is ready"),
        Phase::Error => warn!(message = %outcome.message, "Database reconcile failed"),
        _ => info!(phase = %outcome.phase, message = %outcome.message, "Database not ready yet"),
    }

    finish_status(&mut status, database, &outcome);
    if status_changed(&previous, &status) {
        status.last_updated = Some(chrono::Utc::now().to_rfc3339());
        match ctx.store.patch_status(database, &status).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(Action::await_change()),
            Err(e) => return Err(e),
        }
    } else {
        debug!("Status unchanged, skipping write");
    }

    #[cfg(feature = "metrics")]
    metrics::set_database_phase(&namespace, &name, outcome.phase);

    Ok(Action::requeue(requeue))
}

async fn converge(ctx: &ControllerState, database: &Database, status: &mut DatabaseStatus) -> Outcome {
    let store = ctx.store.as_ref();
    let namespace = database.namespace_or_default();

    let url = match resolve_url(store, database).await {
        Ok(url) => url,
        Err(e) => {
            status.extensions_ready = false;
            status.connection_status = None;
            return Outcome::new(Phase::Error, format!("Failed to get database URL: {e}"));
        }
    };

    if database.spec.database_type.requires_extensions() {
        let provisioned = ensure_extensions(
            store,
            ctx.connector.as_ref(),
            database,
            &url,
            &ctx.config.required_extensions,
            status,
        )
        .await;

        match provisioned {
            Ok(true) => {}
            Ok(false) => {
                return Outcome::new(Phase::Configuring, "Setting up required database extensions")
            }
            Err(e) => {
                return Outcome::new(
                    Phase::Configuring,
                    format!("Setting up database extensions: {e}"),
                )
            }
        }
    }

    match aggregator::upsert(store, &namespace, database, &url, ctx.config.conflict_retries).await {
        Ok(config_map) => Outcome {
            phase: Phase::Ready,
            message: "Database configuration synchronized".to_string(),
            config_map: Some(config_map),
        },
        Err(e) => Outcome::new(Phase::Error, format!("Failed to reconcile ConfigMap: {e}")),
    }
}

fn requeue_after(config: &OperatorConfig, phase: Phase) -> Duration {
    match phase {
        Phase::Ready => config.ready_requeue,
        Phase::Configuring | Phase::Pending => config.configuring_requeue,
        Phase::Error => config.error_requeue,
    }
}

fn finish_status(status: &mut DatabaseStatus, database: &Database, outcome: &Outcome) {
    let generation = database.metadata.generation;

    status.phase = outcome.phase;
    status.message = Some(outcome.message.clone());
    status.config_map_ref = match outcome.phase {
        Phase::Ready => outcome.config_map.clone(),
        _ => None,
    };
    if outcome.phase == Phase::Ready {
        status.extensions_ready = true;
    }
    status.observed_generation = generation;
    set_ready_condition(&mut status.conditions, outcome.phase, &outcome.message, generation);
}

/// Anything but the timestamp differs
fn status_changed(previous: &DatabaseStatus, next: &DatabaseStatus) -> bool {
    let mut next = next.clone();
    next.last_updated = previous.last_updated.clone();
    *previous != next || previous.last_updated.is_none()
}

/// Remove the Database from the namespace ConfigMap, then release it
#[instrument(skip(ctx, database), fields(name = %database.name_any(), namespace = %database.namespace_or_default()))]
async fn cleanup_database(ctx: &ControllerState, database: &Database) -> Result<Action> {
    if !has_finalizer(database) {
        return Ok(Action::await_change());
    }

    let namespace = database.namespace_or_default();
    let name = database.name_any();

    info!("Cleaning up Database: {}/{}", namespace, name);

    if let Err(e) =
        aggregator::rebuild(ctx.store.as_ref(), &namespace, &name, ctx.config.conflict_retries).await
    {
        warn!("Failed to rebuild ConfigMap during cleanup: {:?}", e);
    }

    match remove_finalizer(ctx.store.as_ref(), database).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }

    #[cfg(feature = "metrics")]
    metrics::clear_database_phase(&namespace, &name);

    info!("Cleanup complete for Database: {}/{}", namespace, name);
    Ok(Action::await_change())
}

/// Error policy for the controller
fn error_policy(database: Arc<Database>, error: &Error, _ctx: Arc<ControllerState>) -> Action {
    error!("Reconciliation error for {}: {:?}", database.name_any(), error);

    #[cfg(feature = "metrics")]
    metrics::inc_reconcile_error(CONTROLLER_NAME, error.metric_label());

    Action::requeue(error_requeue(error))
}

/// Use shorter retry for retriable errors
pub(crate) fn error_requeue(error: &Error) -> Duration {
    if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    }
}
