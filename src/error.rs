//! Error taxonomy for the Identity Reconciliation Engine (spec.md §7).

use uuid::Uuid;

/// The four error kinds produced by the engine, and their propagation
/// policy, exactly as spec.md §7 specifies:
///
/// - [`IreError::RetryableConflict`] — handled internally by the IRE retry
///   loop, surfaced only after the retry cap is exhausted.
/// - [`IreError::LockTimeout`] — surfaced to the caller as retryable.
/// - [`IreError::InvalidRaw`] — fatal for this event; the raw record is
///   left unstamped for human triage.
/// - [`IreError::StorageFailure`] — fatal for this event; the enclosing
///   worker stops and alerts.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum IreError {
    #[error("concurrent writer beat us to a unique slot for his_number={his_number:?}")]
    RetryableConflict {
        his_number: Option<String>,
        #[source]
        source: sqlx::Error,
    },

    #[error("identity lock not acquired within {timeout_ms}ms for key {key}")]
    LockTimeout { key: String, timeout_ms: u64 },

    #[error("raw record {raw_id} violates a schema invariant: {reason}")]
    InvalidRaw { raw_id: Uuid, reason: String },

    #[error("storage failure: {context}")]
    StorageFailure {
        context: String,
        #[source]
        source: sqlx::Error,
    },
}

impl IreError {
    /// True for the two kinds the IRE retry loop (and the worker pool's
    /// requeue policy) treats as transient.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RetryableConflict { .. } | Self::LockTimeout { .. })
    }

    /// Maps a raw `sqlx::Error` encountered inside a MU transaction to the
    /// taxonomy above. Postgres `23505` (`unique_violation`) is the
    /// "concurrent writer beat us" signal spec.md §4.2/§5 call out
    /// specifically; everything else is a fatal storage failure.
    pub fn from_sqlx(context: impl Into<String>, err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            if db_err.code().as_deref() == Some("23505") {
                return Self::RetryableConflict {
                    his_number: None,
                    source: err,
                };
            }
        }
        Self::StorageFailure {
            context: context.into(),
            source: err,
        }
    }
}

pub type Result<T> = std::result::Result<T, IreError>;
