//! The Canonical Store (spec.md §2): durable consolidated registry of
//! patients, raw staging, mobile pre-registrations, downstream medical
//! events, and the append-only match log.

pub mod cache;
pub mod queries;
pub mod schema;

pub use queries::PgCsView;
