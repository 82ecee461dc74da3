//! The Identity Reconciliation Engine orchestrator (spec.md §5).
//!
//! `reconcile` is the only entry point adapters and the worker pool call:
//! it computes the identity-lock set for one incoming raw record, acquires
//! those locks in sorted order, runs Matching Rules against a consistent
//! snapshot of the Canonical Store, applies the Mutator inside the same
//! transaction, and retries the whole attempt on a detected write
//! conflict. The retry loop's backoff follows spec.md §5's schedule: base
//! delay doubling per attempt, capped, no jitter — the same shape as the
//! teacher's corpus-mate `sbom-tool-sbom-tools/src/enrichment/osv/client.rs`
//! uses for its own retry loop.

use std::collections::HashMap;
use std::time::Duration;

use sqlx::PgPool;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{IreError, Result};
use crate::lock::{self, LockManager};
use crate::model::{CanonicalPatient, DocumentId, MobilePrereg, RawPatientRecord, Source};
use crate::mutator::{self, ApplyOutcome};
use crate::referrers::ReferrersRegistry;
use crate::rules::{self, CsView};
use crate::store::cache::ReferrersSqlCache;
use crate::store::queries::PgCsView;

/// One unit of work: a freshly-delivered per-source snapshot. Adapters
/// reuse the same `raw_id` across repeated deliveries of the same
/// underlying HIS record (spec.md §3: "raw" is a mutable per-source
/// snapshot, not an append-only event log) — the engine tells insertion
/// and update apart by whether a row already exists for this `raw_id`.
#[derive(Debug, Clone)]
pub struct ReconcileEvent {
    pub raw: RawPatientRecord,
}

/// Shared handles a worker needs to call [`reconcile`]. Grouped so the
/// worker pool (`worker.rs`) only has to thread one value through its
/// tasks instead of five.
#[derive(Clone)]
pub struct EngineHandles {
    pub pool: PgPool,
    pub config: EngineConfig,
    pub locks: LockManager,
    pub registry: std::sync::Arc<ReferrersRegistry>,
    pub cache: std::sync::Arc<ReferrersSqlCache>,
    /// Count of retry attempts fired by `reconcile`'s own backoff loop
    /// since process start, surfaced by `engine_health` (spec.md §6).
    pub retries: std::sync::Arc<std::sync::atomic::AtomicU64>,
}

impl EngineHandles {
    pub fn new(pool: PgPool, config: EngineConfig) -> Self {
        Self {
            pool,
            config,
            locks: LockManager::new(),
            registry: std::sync::Arc::new(ReferrersRegistry::default_registry()),
            cache: std::sync::Arc::new(ReferrersSqlCache::new()),
            retries: std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0)),
        }
    }

    /// Total retry attempts fired by `reconcile` since process start.
    pub fn retry_count(&self) -> u64 {
        self.retries.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// An in-memory snapshot of the handful of Canonical Store lookups one
/// `reconcile` call needs, gathered inside the transaction before MR runs
/// so the decision and the write that follows see the same data (spec.md
/// §5: "the critical section is the DB transaction plus the identity
/// locks"). MR itself stays synchronous and DB-agnostic — see `rules.rs`.
#[derive(Default)]
struct Snapshot {
    prereg: Option<MobilePrereg>,
    by_source_his: Option<CanonicalPatient>,
    by_doc: Option<CanonicalPatient>,
    by_doc_excluding: Option<CanonicalPatient>,
    by_id: HashMap<Uuid, CanonicalPatient>,
}

impl CsView for Snapshot {
    fn find_canonical_by_source_his(&self, _source: Source, _his_number: &str) -> Option<CanonicalPatient> {
        self.by_source_his.clone()
    }

    fn find_canonical_by_document(&self, _doc: DocumentId) -> Option<CanonicalPatient> {
        self.by_doc.clone()
    }

    fn find_canonical_by_document_excluding(
        &self,
        _doc: DocumentId,
        excluding: Uuid,
    ) -> Option<CanonicalPatient> {
        self.by_doc_excluding
            .clone()
            .filter(|c| c.canonical_id != excluding)
    }

    fn find_prereg_by_source_his(&self, _source: Source, _his_number: &str) -> Option<MobilePrereg> {
        self.prereg.clone()
    }

    fn find_canonical_by_id(&self, canonical_id: Uuid) -> Option<CanonicalPatient> {
        self.by_id.get(&canonical_id).cloned()
    }
}

impl Snapshot {
    fn remember(&mut self, canonical: Option<CanonicalPatient>) {
        if let Some(c) = canonical {
            self.by_id.insert(c.canonical_id, c);
        }
    }
}

async fn prefetch_insertion(cs: &mut PgCsView<'_, '_>, raw: &RawPatientRecord) -> Result<Snapshot> {
    let mut snap = Snapshot::default();

    snap.prereg = cs.find_prereg_by_source_his(raw.source, &raw.his_number).await?;
    if let Some(prereg) = &snap.prereg {
        let materialized = cs.find_canonical_by_id(prereg.canonical_id).await?;
        snap.remember(materialized);
    }

    snap.by_source_his = cs.find_canonical_by_source_his(raw.source, &raw.his_number).await?;
    snap.remember(snap.by_source_his.clone());

    if let Some(doc) = raw.document {
        snap.by_doc = cs.find_canonical_by_document(doc).await?;
        snap.remember(snap.by_doc.clone());
    }

    Ok(snap)
}

async fn prefetch_update(
    cs: &mut PgCsView<'_, '_>,
    old: &RawPatientRecord,
    new_raw: &RawPatientRecord,
    canonical_id: Uuid,
) -> Result<Snapshot> {
    let mut snap = Snapshot::default();

    let current = cs.find_canonical_by_id(canonical_id).await?;
    snap.remember(current);

    let doc_changed = old.document != new_raw.document;
    if doc_changed {
        if let Some(doc) = new_raw.document {
            snap.by_doc_excluding = cs
                .find_canonical_by_document_excluding(doc, canonical_id)
                .await?;
            snap.remember(snap.by_doc_excluding.clone());
        }
    }

    Ok(snap)
}

/// Runs Matching Rules and the Mutator for one event inside one
/// transaction, retrying on [`IreError::is_retryable`] up to
/// `config.retry_cap` times with exponential backoff (spec.md §5). Locks
/// are acquired once and held across every retry of the same event — a
/// retry means someone else's transaction beat ours to a unique slot, not
/// that our own lock discipline failed.
pub async fn reconcile(handles: &EngineHandles, event: &ReconcileEvent) -> Result<ApplyOutcome> {
    event.raw.validate()?;

    let mut lock_keys = vec![lock::source_his_key(event.raw.source, &event.raw.his_number)];
    if let Some(doc) = event.raw.document {
        lock_keys.push(lock::document_key(doc));
    }

    let _guards = handles
        .locks
        .acquire_sorted(lock_keys, handles.config.lock_timeout())
        .await?;

    let mut attempt: u32 = 0;
    loop {
        match try_reconcile_once(handles, event).await {
            Ok(outcome) => return Ok(outcome),
            Err(err) if err.is_retryable() && attempt < handles.config.retry_cap => {
                let delay = backoff_delay(attempt, &handles.config);
                tracing::warn!(
                    raw_id = %event.raw.raw_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "reconcile attempt hit a write conflict, retrying"
                );
                attempt += 1;
                handles.retries.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

async fn try_reconcile_once(handles: &EngineHandles, event: &ReconcileEvent) -> Result<ApplyOutcome> {
    let mut tx = handles
        .pool
        .begin()
        .await
        .map_err(|e| IreError::from_sqlx("begin reconcile transaction", e))?;

    let result = {
        let mut cs = PgCsView::new(&mut tx);
        run_decision_and_apply(&mut cs, &handles.registry, &handles.cache, &event.raw).await
    };

    match result {
        Ok(outcome) => {
            tx.commit()
                .await
                .map_err(|e| IreError::from_sqlx("commit reconcile transaction", e))?;
            Ok(outcome)
        }
        Err(err) => {
            let _ = tx.rollback().await;
            Err(err)
        }
    }
}

async fn run_decision_and_apply(
    cs: &mut PgCsView<'_, '_>,
    registry: &ReferrersRegistry,
    cache: &ReferrersSqlCache,
    raw: &RawPatientRecord,
) -> Result<ApplyOutcome> {
    let existing_raw = cs.fetch_raw(raw.raw_id).await?;

    let (decision, effective_raw) = match existing_raw {
        Some(old) if old.canonical_id.is_some() => {
            let canonical_id = old.canonical_id.expect("checked by match guard");
            let mut new_raw = raw.clone();
            new_raw.canonical_id = Some(canonical_id);

            let snapshot = prefetch_update(cs, &old, &new_raw, canonical_id).await?;
            cs.update_raw(&new_raw).await?;
            let decision = rules::decide_update(&old, &new_raw, &snapshot);
            (decision, new_raw)
        }
        Some(_unprocessed) => {
            cs.update_raw(raw).await?;
            let snapshot = prefetch_insertion(cs, raw).await?;
            (rules::decide_insertion(raw, &snapshot), raw.clone())
        }
        None => {
            cs.insert_raw(raw).await?;
            let snapshot = prefetch_insertion(cs, raw).await?;
            (rules::decide_insertion(raw, &snapshot), raw.clone())
        }
    };

    mutator::apply(cs, registry, cache, &effective_raw, decision).await
}

/// `50 * 2^min(attempt, 5)` ms, capped at `retry_max_delay_ms`, no jitter
/// (spec.md §5).
fn backoff_delay(attempt: u32, config: &EngineConfig) -> Duration {
    let exponent = attempt.min(5);
    let scaled = config.retry_base_delay_ms.saturating_mul(1u64 << exponent);
    Duration::from_millis(scaled.min(config.retry_max_delay_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let config = EngineConfig {
            database_url: "postgres://localhost/test".to_string(),
            retry_cap: 5,
            lock_timeout_ms: 30_000,
            worker_count: 4,
            retry_base_delay_ms: 50,
            retry_max_delay_ms: 1_600,
        };
        assert_eq!(backoff_delay(0, &config), Duration::from_millis(50));
        assert_eq!(backoff_delay(1, &config), Duration::from_millis(100));
        assert_eq!(backoff_delay(2, &config), Duration::from_millis(200));
        assert_eq!(backoff_delay(5, &config), Duration::from_millis(1_600));
        assert_eq!(backoff_delay(10, &config), Duration::from_millis(1_600));
    }
}
