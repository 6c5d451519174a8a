//! Custom Resource Definitions for the PgHero operator

mod database;
pub mod types;


pub use database::{Database, DatabaseSpec, DatabaseStatus};
pub use types::*;
