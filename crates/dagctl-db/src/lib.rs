//! Postgres-backed persistence for dagctl: DAG definitions, run attempts,
//! attempt history, and the dispatch queue.
//!
//! This crate owns the schema and every SQL statement; callers never write
//! raw queries. See `migrations/` for the schema and `src/queries/` for one
//! module per table family.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
