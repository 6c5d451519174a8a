//! Data transfer objects for the REST API

use serde::{Deserialize, Serialize};

use crate::crd::{DatabaseStatus, DatabaseType, Phase};

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// One row of the Database list
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSummary {
    pub namespace: String,
    pub name: String,
    /// Key under `databases:` in the PgHero config
    pub friendly_name: String,
    pub database_type: DatabaseType,
    pub enabled: bool,
    pub phase: Phase,
    pub extensions_ready: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseListResponse {
    pub items: Vec<DatabaseSummary>,
    pub total: usize,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseDetailResponse {
    pub namespace: String,
    pub name: String,
    pub friendly_name: String,
    pub database_type: DatabaseType,
    pub enabled: bool,
    pub status: DatabaseStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}
