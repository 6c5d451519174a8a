//! Finalizer handling for Database cleanup
//!
//! The finalizer keeps a deleted Database around until the namespace
//! ConfigMap has been rebuilt without it.

use kube::ResourceExt;
use tracing::info;

use crate::crd::Database;
use crate::error::Result;

use super::store::ControlPlane;

/// Finalizer name used to protect Database resources
pub const DATABASE_FINALIZER: &str = "pghero.mithucste30.io/finalizer";

/// Add the finalizer if it is missing; returns the object as stored afterwards
pub async fn add_finalizer(store: &dyn ControlPlane, database: &Database) -> Result<Database> {
    if has_finalizer(database) {
        return Ok(database.clone());
    }

    let mut finalizers: Vec<String> = database.finalizers().to_vec();
    finalizers.push(DATABASE_FINALIZER.to_string());

    let updated = store.set_finalizers(database, finalizers).await?;
    info!("Added finalizer to Database: {}", database.name_any());
    Ok(updated)
}

/// Remove our finalizer, leaving any others in place
///
/// Once no finalizer remains the API server completes the deletion.
pub async fn remove_finalizer(store: &dyn ControlPlane, database: &Database) -> Result<()> {
    let finalizers: Vec<String> = database
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != DATABASE_FINALIZER)
        .cloned()
        .collect();

    store.set_finalizers(database, finalizers).await?;

    info!("Removed finalizer from Database: {}", database.name_any());
    Ok(())
}

/// Check if the Database is being deleted
pub fn is_being_deleted(database: &Database) -> bool {
    database.metadata.deletion_timestamp.is_some()
}

/// Check if the Database has our finalizer
pub fn has_finalizer(database: &Database) -> bool {
    database
        .finalizers()
        .iter()
        .any(|f| f == DATABASE_FINALIZER)
}
