//! Identity lock manager (spec.md §5): a named, string-keyed lock acquired
//! in lexicographic order with a configurable timeout.
//!
//! Grounded on `Alb-O-xeno/crates/editor/src/lsp/broker_transport.rs`'s
//! `DashMap<Key, ..>` + `tokio::sync::Mutex` pattern for per-key
//! concurrent state. This is an in-process substitute for the "named lock
//! table or database advisory locks" spec.md allows — see DESIGN.md's Open
//! Question resolution for why a single process is in scope here.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::IreError;
use crate::model::{DocumentId, Source};

/// One identity-lock key, in the string form spec.md §5 specifies:
/// `src:<source>/his:<his_number>`, `doc:<type>/<number>`, `can:<canonical_id>`.
pub fn source_his_key(source: Source, his_number: &str) -> String {
    format!("src:{}/his:{}", source.as_str(), his_number)
}

pub fn document_key(doc: DocumentId) -> String {
    format!("doc:{}/{}", doc.doc_type, doc.doc_number)
}

pub fn canonical_key(canonical_id: uuid::Uuid) -> String {
    format!("can:{}", canonical_id)
}

/// A held set of identity locks. Dropping this releases every lock it
/// holds, in any order (release order is not observable — only
/// acquisition order matters for deadlock avoidance).
pub struct LockGuardSet {
    _guards: Vec<OwnedMutexGuard<()>>,
}

/// In-process identity lock manager. One `LockManager` is shared across the
/// whole worker pool.
#[derive(Clone, Default)]
pub struct LockManager {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires every key in `keys`, sorted lexicographically first
    /// (spec.md §5: "Locks are always acquired in lexicographic order to
    /// avoid deadlock"), each bounded by `timeout`. On timeout, any locks
    /// already acquired in this call are released before returning the
    /// error, so a failed acquisition never leaves partial locks held.
    pub async fn acquire_sorted(
        &self,
        mut keys: Vec<String>,
        timeout: Duration,
    ) -> Result<LockGuardSet, IreError> {
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            let mutex = self
                .locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();

            match tokio::time::timeout(timeout, mutex.lock_owned()).await {
                Ok(guard) => guards.push(guard),
                Err(_) => {
                    // `guards` drops here, releasing everything acquired so far.
                    return Err(IreError::LockTimeout {
                        key,
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
            }
        }

        Ok(LockGuardSet { _guards: guards })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquires_disjoint_keys_concurrently() {
        let mgr = LockManager::new();
        let a = mgr
            .acquire_sorted(vec!["k1".to_string()], Duration::from_millis(100))
            .await
            .unwrap();
        let b = mgr
            .acquire_sorted(vec!["k2".to_string()], Duration::from_millis(100))
            .await
            .unwrap();
        drop(a);
        drop(b);
    }

    #[tokio::test]
    async fn second_acquirer_of_same_key_times_out() {
        let mgr = LockManager::new();
        let _held = mgr
            .acquire_sorted(vec!["k1".to_string()], Duration::from_millis(100))
            .await
            .unwrap();

        let mgr2 = mgr.clone();
        let result = mgr2
            .acquire_sorted(vec!["k1".to_string()], Duration::from_millis(30))
            .await;

        assert!(matches!(result, Err(IreError::LockTimeout { .. })));
    }

    #[tokio::test]
    async fn releasing_allows_a_subsequent_acquire() {
        let mgr = LockManager::new();
        let held = mgr
            .acquire_sorted(vec!["k1".to_string()], Duration::from_millis(100))
            .await
            .unwrap();
        drop(held);

        let result = mgr
            .acquire_sorted(vec!["k1".to_string()], Duration::from_millis(100))
            .await;
        assert!(result.is_ok());
    }
}
