//! Control plane access
//!
//! Everything the reconciler reads from or writes to the API server goes
//! through [`ControlPlane`], so the reconcile logic can run against the
//! real cluster ([`KubeControlPlane`]) or an in-memory store in tests.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{
    api::{Api, ListParams, Patch, PatchParams, PostParams},
    Client, ResourceExt,
};
use serde_json::json;

use crate::crd::{Database, DatabaseStatus};
use crate::error::{Error, Result};

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "pghero-operator";

#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Fetch a Database; `None` when it no longer exists
    async fn get_database(&self, namespace: &str, name: &str) -> Result<Option<Database>>;

    async fn list_databases(&self, namespace: &str) -> Result<Vec<Database>>;

    /// Databases across every namespace
    async fn list_all_databases(&self) -> Result<Vec<Database>>;

    /// Overwrite the finalizer list, conditioned on the object's resourceVersion.
    /// Returns the updated object.
    async fn set_finalizers(&self, database: &Database, finalizers: Vec<String>)
        -> Result<Database>;

    async fn patch_status(&self, database: &Database, status: &DatabaseStatus) -> Result<()>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;

    /// Create a ConfigMap; [`Error::Conflict`] when it already exists
    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap)
        -> Result<ConfigMap>;

    /// Replace a ConfigMap at the resourceVersion it carries; [`Error::Conflict`] when stale
    async fn replace_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<ConfigMap>;
}

/// [`ControlPlane`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeControlPlane {
    client: Client,
}

impl KubeControlPlane {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn conflict_or(err: kube::Error, what: impl FnOnce() -> String) -> Error {
    match err {
        kube::Error::Api(e) if e.code == 409 => Error::Conflict(what()),
        other => Error::KubeError(other),
    }
}

#[async_trait]
impl ControlPlane for KubeControlPlane {
    async fn get_database(&self, namespace: &str, name: &str) -> Result<Option<Database>> {
        let api: Api<Database> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_databases(&self, namespace: &str) -> Result<Vec<Database>> {
        let api: Api<Database> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_all_databases(&self) -> Result<Vec<Database>> {
        let api: Api<Database> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn set_finalizers(
        &self,
        database: &Database,
        finalizers: Vec<String>,
    ) -> Result<Database> {
        let namespace = database.namespace_or_default();
        let api: Api<Database> = Api::namespaced(self.client.clone(), &namespace);

        let patch = json!({
            "metadata": {
                "resourceVersion": database.resource_version(),
                "finalizers": finalizers
            }
        });
        api.patch(
            &database.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(|e| conflict_or(e, || format!("Database {}/{}", namespace, database.name_any())))
    }

    async fn patch_status(&self, database: &Database, status: &DatabaseStatus) -> Result<()> {
        let namespace = database.namespace_or_default();
        let api: Api<Database> = Api::namespaced(self.client.clone(), &namespace);

        let patch = json!({ "status": status });
        api.patch_status(
            &database.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<ConfigMap> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), config_map)
            .await
            .map_err(|e| conflict_or(e, || format!("ConfigMap {}/{}", namespace, config_map.name_any())))
    }

    async fn replace_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<ConfigMap> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let name = config_map.name_any();
        api.replace(&name, &PostParams::default(), config_map)
            .await
            .map_err(|e| conflict_or(e, || format!("ConfigMap {}/{}", namespace, name)))
    }
}
