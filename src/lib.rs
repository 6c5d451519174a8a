//! PgHero operator: aggregates `Database` custom resources into PgHero's
//! `database.yml` and provisions the monitoring extensions PgHero needs.
//!
//! For each namespace the operator maintains a `pghero-databases`
//! ConfigMap listing every enabled Database, and makes sure
//! `pg_stat_statements` exists on each PostgreSQL target, falling back to
//! optional superuser credentials when the regular user lacks privileges.

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod telemetry;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::config::OperatorConfig;
pub use crate::error::{Error, Result};
