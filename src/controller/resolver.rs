//! Resolution of connection URLs
//!
//! A Database names its URL either literally or through a Secret
//! reference. The Secret wins when both are present. The superuser URL
//! follows the same rules but is optional.

use tracing::debug;

use crate::crd::{Database, SecretReference};
use crate::error::{Error, Result};

use super::store::ControlPlane;

/// Resolve the connection URL of a Database
pub async fn resolve_url(store: &dyn ControlPlane, database: &Database) -> Result<String> {
    let namespace = database.namespace_or_default();

    if let Some(reference) = &database.spec.url_from_secret {
        return read_secret_key(store, reference, &namespace).await;
    }

    match database.spec.url.as_deref() {
        Some(url) if !url.is_empty() => Ok(url.to_string()),
        _ => Err(Error::MissingUrl),
    }
}

/// Resolve the superuser URL, `Ok(None)` when none is configured
pub async fn resolve_superuser_url(
    store: &dyn ControlPlane,
    database: &Database,
) -> Result<Option<String>> {
    let namespace = database.namespace_or_default();

    if let Some(reference) = &database.spec.superuser_url_from_secret {
        return read_secret_key(store, reference, &namespace).await.map(Some);
    }

    Ok(database
        .spec
        .superuser_url
        .as_deref()
        .filter(|url| !url.is_empty())
        .map(str::to_string))
}

async fn read_secret_key(
    store: &dyn ControlPlane,
    reference: &SecretReference,
    default_namespace: &str,
) -> Result<String> {
    let namespace = reference.namespace_or(default_namespace);

    let secret = store
        .get_secret(namespace, &reference.name)
        .await?
        .ok_or_else(|| Error::SecretNotFound {
            namespace: namespace.to_string(),
            name: reference.name.clone(),
        })?;

    let value = secret
        .data
        .as_ref()
        .and_then(|data| data.get(&reference.key))
        .ok_or_else(|| Error::SecretKeyMissing {
            namespace: namespace.to_string(),
            name: reference.name.clone(),
            key: reference.key.clone(),
        })?;

    let value = String::from_utf8(value.0.clone()).map_err(|_| Error::SecretValueInvalid {
        namespace: namespace.to_string(),
        name: reference.name.clone(),
        key: reference.key.clone(),
    })?;

    debug!(
        secret = %reference.name,
        namespace = %namespace,
        key = %reference.key,
        "Resolved value from secret"
    );

    Ok(value)
}
