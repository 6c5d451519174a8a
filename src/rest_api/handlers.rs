//! HTTP handlers for the REST API

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use kube::ResourceExt;
use tracing::{error, instrument};

use crate::controller::ControllerState;
use crate::crd::Database;

use super::dto::{
    DatabaseDetailResponse, DatabaseListResponse, DatabaseSummary, ErrorResponse, HealthResponse,
};

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Health check endpoint
#[instrument]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Metrics endpoint in Prometheus text format
#[cfg(feature = "metrics")]
pub async fn metrics() -> Result<String, StatusCode> {
    use prometheus_client::encoding::text::encode;

    let mut buffer = String::new();
    encode(&mut buffer, &crate::controller::metrics::REGISTRY).map_err(|e| {
        error!("Failed to encode metrics: {:?}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(buffer)
}

fn summarize(db: &Database) -> DatabaseSummary {
    let status = db.status.clone().unwrap_or_default();
    DatabaseSummary {
        namespace: db.namespace_or_default(),
        name: db.name_any(),
        friendly_name: db.spec.name.clone(),
        database_type: db.spec.database_type,
        enabled: db.spec.enabled,
        phase: status.phase,
        extensions_ready: status.extensions_ready,
    }
}

/// List Databases in the watched scope
#[instrument(skip(state))]
pub async fn list_databases(
    State(state): State<Arc<ControllerState>>,
) -> Result<Json<DatabaseListResponse>, ApiError> {
    let listed = match state.config.watch_namespace.as_deref() {
        Some(ns) => state.store.list_databases(ns).await,
        None => state.store.list_all_databases().await,
    };

    match listed {
        Ok(databases) => {
            let mut items: Vec<DatabaseSummary> = databases.iter().map(summarize).collect();
            items.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
            let total = items.len();
            Ok(Json(DatabaseListResponse { items, total }))
        }
        Err(e) => {
            error!("Failed to list databases: {:?}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("list_failed", &e.to_string())),
            ))
        }
    }
}

/// Get a specific Database
#[instrument(skip(state), fields(name = %name, namespace = %namespace))]
pub async fn get_database(
    State(state): State<Arc<ControllerState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<DatabaseDetailResponse>, ApiError> {
    match state.store.get_database(&namespace, &name).await {
        Ok(Some(db)) => Ok(Json(DatabaseDetailResponse {
            namespace: db.namespace_or_default(),
            name: db.name_any(),
            friendly_name: db.spec.name.clone(),
            database_type: db.spec.database_type,
            enabled: db.spec.enabled,
            status: db.status.clone().unwrap_or_default(),
        })),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(
                "not_found",
                &format!("Database {}/{} not found", namespace, name),
            )),
        )),
        Err(e) => {
            error!("Failed to get database {}/{}: {:?}", namespace, name, e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("get_failed", &e.to_string())),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OperatorConfig;
    use crate::controller::testing::{database, FakeConnector, FakeControlPlane};
    use crate::crd::{DatabaseStatus, Phase};

    fn state(store: Arc<FakeControlPlane>, watch_namespace: Option<&str>) -> Arc<ControllerState> {
        let config = OperatorConfig {
            watch_namespace: watch_namespace.map(str::to_string),
            ..Default::default()
        };
        Arc::new(ControllerState::new(
            store,
            Arc::new(FakeConnector::default()),
            config,
        ))
    }

    #[tokio::test]
    async fn test_health() {
        let Json(body) = health().await;
        assert_eq!(body.status, "healthy");
        assert_eq!(body.version, env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_list_databases_sorted_and_scoped() {
        let store = Arc::new(FakeControlPlane::default());
        let mut ready = database("b", "orders", "orders", Some("postgres://o@db/o"));
        ready.status = Some(DatabaseStatus {
            phase: Phase::Ready,
            extensions_ready: true,
            ..Default::default()
        });
        store.insert_database(ready);
        store.insert_database(database("a", "users", "users", Some("postgres://u@db/u")));

        let Json(all) = list_databases(State(state(store.clone(), None))).await.unwrap();
        assert_eq!(all.total, 2);
        assert_eq!(all.items[0].namespace, "a");
        assert_eq!(all.items[0].phase, Phase::Pending);
        assert_eq!(all.items[1].phase, Phase::Ready);
        assert!(all.items[1].extensions_ready);

        let Json(scoped) = list_databases(State(state(store, Some("b")))).await.unwrap();
        assert_eq!(scoped.total, 1);
        assert_eq!(scoped.items[0].friendly_name, "orders");
    }

    #[tokio::test]
    async fn test_get_database_not_found() {
        let store = Arc::new(FakeControlPlane::default());
        let result = get_database(
            State(state(store, None)),
            Path(("apps".to_string(), "ghost".to_string())),
        )
        .await;

        let (code, Json(body)) = result.unwrap_err();
        assert_eq!(code, StatusCode::NOT_FOUND);
        assert_eq!(body.error, "not_found");
    }

    #[tokio::test]
    async fn test_detail_does_not_expose_url() {
        let store = Arc::new(FakeControlPlane::default());
        store.insert_database(database("apps", "prod", "prod", Some("postgres://app:secret@db/app")));

        let Json(body) = get_database(
            State(state(store, None)),
            Path(("apps".to_string(), "prod".to_string())),
        )
        .await
        .unwrap();

        let json = serde_json::to_string(&body).unwrap();
        assert!(!json.contains("secret@db"));
        assert_eq!(body.friendly_name, "prod");
    }
}
