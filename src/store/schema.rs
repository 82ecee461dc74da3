//! Schema management for the Canonical Store.
//!
//! The teacher (`veridit-sql_saga/native/src/introspect.rs`) *reads* DDL
//! facts (era columns, PK columns) out of the catalog at call time. This
//! engine runs as an application, so the direction is reversed: it
//! *declares* the DDL facts up front via `sqlx::migrate!`, and the rest of
//! `store` is written against that known-fixed shape rather than
//! introspecting it per call.

use sqlx::PgPool;

/// Applies all pending migrations under `migrations/` to `pool`. Safe to
/// call on every process start (idempotent — `sqlx` tracks applied
/// migrations in `_sqlx_migrations`).
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// JSONB path expression selecting a source's `his_number` out of the
/// `canonical.slots` column, e.g. `slots -> 'qms' ->> 'his_number'`. Shared
/// between `queries.rs` (lookups) and any future schema-evolution tooling
/// that needs to target the same expression indexes declared in
/// `migrations/0001_init.sql`.
pub fn slot_his_number_path(source: crate::model::Source) -> String {
    format!("slots -> '{}' ->> 'his_number'", source.as_str())
}
