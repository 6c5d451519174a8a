//! Controller module for Database reconciliation
//!
//! This module contains the controller loop and the pieces it drives:
//! URL resolution, extension provisioning and the per-namespace PgHero
//! ConfigMap.

pub mod aggregator;
pub mod conditions;
pub mod extensions;
mod finalizers;
#[cfg(feature = "metrics")]
pub mod metrics;
mod reconciler;
pub mod resolver;
pub mod store;
#[cfg(test)]
pub(crate) mod testing;

pub use aggregator::{render_database_yml, CONFIG_MAP_NAME};
pub use extensions::{extract_username, PgConnector, PgSession, SqlxConnector};
pub use finalizers::DATABASE_FINALIZER;
pub use reconciler::{run_controller, ControllerState};
pub use resolver::{resolve_superuser_url, resolve_url};
pub use store::{ControlPlane, KubeControlPlane};
