//! Aggregated PgHero configuration
//!
//! Every namespace gets one ConfigMap, `pghero-databases`, whose
//! `database.yml` lists all enabled Databases of that namespace. Any
//! reconcile may rewrite it, so each write is conditioned on the
//! resourceVersion that was read and the whole read-recompute-write cycle
//! is retried on conflict.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use crate::crd::Database;
use crate::error::{Error, Result};

#[cfg(feature = "metrics")]
use super::metrics;
use super::resolver::resolve_url;
use super::store::ControlPlane;

pub const CONFIG_MAP_NAME: &str = "pghero-databases";
pub const DATA_KEY: &str = "database.yml";
pub const COUNT_ANNOTATION: &str = "pghero.mithucste30.io/database-count";

const MANAGED_LABELS: [(&str, &str); 3] = [
    ("app.kubernetes.io/name", "pghero"),
    ("app.kubernetes.io/component", "database-config"),
    ("app.kubernetes.io/managed-by", "pghero-operator"),
];

/// Which Database triggered the recomputation
enum Trigger<'a> {
    /// Reconciling `database`; its URL is already resolved
    Upsert { database: &'a Database, url: &'a str },
    /// `name` is going away and must not be rendered
    Remove { name: &'a str },
}

/// Rewrite the namespace ConfigMap with `database` included, creating it when absent.
///
/// Returns the ConfigMap name.
#[instrument(skip_all, fields(namespace = %namespace, name = %database.name_any()))]
pub async fn upsert(
    store: &dyn ControlPlane,
    namespace: &str,
    database: &Database,
    url: &str,
    max_attempts: u32,
) -> Result<String> {
    converge(store, namespace, Trigger::Upsert { database, url }, max_attempts).await?;
    Ok(CONFIG_MAP_NAME.to_string())
}

/// Rewrite the namespace ConfigMap without `excluded`. Nothing happens if the ConfigMap does not exist.
#[instrument(skip_all, fields(namespace = %namespace, name = %excluded))]
pub async fn rebuild(
    store: &dyn ControlPlane,
    namespace: &str,
    excluded: &str,
    max_attempts: u32,
) -> Result<()> {
    converge(store, namespace, Trigger::Remove { name: excluded }, max_attempts).await
}

async fn converge(
    store: &dyn ControlPlane,
    namespace: &str,
    trigger: Trigger<'_>,
    max_attempts: u32,
) -> Result<()> {
    let max_attempts = max_attempts.max(1);

    for attempt in 1..=max_attempts {
        let existing = store.get_config_map(namespace, CONFIG_MAP_NAME).await?;
        if existing.is_none() && matches!(trigger, Trigger::Remove { .. }) {
            debug!("No ConfigMap to rebuild");
            return Ok(());
        }

        let databases = store.list_databases(namespace).await?;
        let entries = collect_entries(store, &databases, &trigger).await;
        let desired = desired_config_map(existing.as_ref(), namespace, &entries)?;

        let written = match &existing {
            None => {
                info!(databases = entries.len(), "Creating aggregated ConfigMap");
                store.create_config_map(namespace, &desired).await
            }
            Some(current) if *current == desired => {
                debug!(databases = entries.len(), "Aggregated ConfigMap already up to date");
                record_count(namespace, entries.len());
                return Ok(());
            }
            Some(_) => {
                info!(databases = entries.len(), "Updating aggregated ConfigMap");
                store.replace_config_map(namespace, &desired).await
            }
        };

        match written {
            Ok(_) => {
                record_count(namespace, entries.len());
                return Ok(());
            }
            Err(Error::Conflict(what)) => {
                #[cfg(feature = "metrics")]
                metrics::inc_configmap_conflict(namespace);
                warn!(attempt, max_attempts, conflict = %what, "ConfigMap changed underneath us, retrying");
            }
            Err(e) => return Err(e),
        }
    }

    Err(Error::AggregationConflict {
        namespace: namespace.to_string(),
        name: CONFIG_MAP_NAME.to_string(),
        attempts: max_attempts,
    })
}

#[allow(unused_variables)]
fn record_count(namespace: &str, count: usize) {
    #[cfg(feature = "metrics")]
    metrics::set_configmap_databases(namespace, count);
}

/// Friendly name -> (resource name, url) for every Database that belongs in the ConfigMap
async fn collect_entries(
    store: &dyn ControlPlane,
    databases: &[Database],
    trigger: &Trigger<'_>,
) -> BTreeMap<String, (String, String)> {
    let mut entries: BTreeMap<String, (String, String)> = BTreeMap::new();
    let mut current_seen = false;

    for db in databases {
        let name = db.name_any();

        let url = match trigger {
            Trigger::Remove { name: excluded } if *excluded == name => continue,
            Trigger::Upsert { database, url } if database.name_any() == name => {
                current_seen = true;
                if !database.spec.enabled {
                    continue;
                }
                url.to_string()
            }
            _ => {
                if !db.spec.enabled || db.metadata.deletion_timestamp.is_some() {
                    continue;
                }
                match resolve_url(store, db).await {
                    Ok(url) => url,
                    Err(e) => {
                        warn!(database = %name, error = %e, "Skipping database whose URL cannot be resolved");
                        continue;
                    }
                }
            }
        };

        insert_entry(&mut entries, &db.spec.name, name, url);
    }

    // A freshly created resource may not be listed yet
    if let Trigger::Upsert { database, url } = trigger {
        if !current_seen && database.spec.enabled {
            insert_entry(&mut entries, &database.spec.name, database.name_any(), url.to_string());
        }
    }

    entries
}

fn insert_entry(
    entries: &mut BTreeMap<String, (String, String)>,
    friendly: &str,
    resource: String,
    url: String,
) {
    if let Some((other, _)) = entries.get(friendly) {
        // The lexically greater resource name wins so every reconcile agrees
        if *other > resource {
            warn!(name = %friendly, kept = %other, dropped = %resource, "Duplicate database name");
            return;
        }
        warn!(name = %friendly, kept = %resource, dropped = %other, "Duplicate database name");
    }
    entries.insert(friendly.to_string(), (resource, url));
}

/// `existing` with the managed labels, annotation and data key overwritten
fn desired_config_map(
    existing: Option<&ConfigMap>,
    namespace: &str,
    entries: &BTreeMap<String, (String, String)>,
) -> Result<ConfigMap> {
    let mut config_map = existing.cloned().unwrap_or_else(|| ConfigMap {
        metadata: ObjectMeta {
            name: Some(CONFIG_MAP_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        ..Default::default()
    });

    let labels = config_map.metadata.labels.get_or_insert_with(BTreeMap::new);
    for (key, value) in MANAGED_LABELS {
        labels.insert(key.to_string(), value.to_string());
    }

    config_map
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(COUNT_ANNOTATION.to_string(), entries.len().to_string());

    let urls: BTreeMap<&str, &str> = entries
        .iter()
        .map(|(name, (_, url))| (name.as_str(), url.as_str()))
        .collect();
    config_map
        .data
        .get_or_insert_with(BTreeMap::new)
        .insert(DATA_KEY.to_string(), render_database_yml(&urls)?);

    Ok(config_map)
}

/// Render PgHero's `database.yml`.
///
/// ```
/// use std::collections::BTreeMap;
/// use pghero_operator::controller::render_database_yml;
///
/// let mut entries = BTreeMap::new();
/// entries.insert("main", "postgres://app:pw@db:5432/app");
/// assert_eq!(
///     render_database_yml(&entries).unwrap(),
///     "databases:\n  main:\n    url: postgres://app:pw@db:5432/app\n"
/// );
/// assert_eq!(render_database_yml(&BTreeMap::new()).unwrap(), "databases: {}\n");
/// ```
pub fn render_database_yml(entries: &BTreeMap<&str, &str>) -> Result<String> {
    let databases: BTreeMap<&str, BTreeMap<&str, &str>> = entries
        .iter()
        .map(|(name, url)| (*name, BTreeMap::from([("url", *url)])))
        .collect();
    let document = BTreeMap::from([("databases", databases)]);

    Ok(serde_yaml::to_string(&document)?)
}
