//! # Connections Module
//!
//! Persistent connections to external services. Currently the PostgreSQL
//! store that records violation alerts.

/// PostgreSQL pooled persistence for violation records.
pub mod db_postgres;

pub use db_postgres::{PostgresViolationStore, StoreError};
