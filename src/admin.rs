//! Administrative surface (spec.md §6): the Lock Protection Layer's
//! `Lock`/`Unlock` operations, plus thin wrappers around the read-only
//! stats views in `store::queries` for `ire-admin`'s reporting commands.

use sqlx::PgPool;
use uuid::Uuid;

use crate::engine::EngineHandles;
use crate::error::{IreError, Result};
use crate::lock;
use crate::store::queries::{self, EngineHealth, PgCsView};

/// Marks a canonical `matching_locked`, hiding it from Matching Rules
/// lookups and protecting it from losing a future MERGE (spec.md §4.1's
/// "locked canonicals are invisible to matching" and §9's LPL). Acquires
/// the canonical's identity lock first, so a `Lock` call cannot race a
/// `reconcile` call already holding it.
pub async fn lock_canonical(handles: &EngineHandles, canonical_id: Uuid, reason: &str) -> Result<()> {
    let _guard = handles
        .locks
        .acquire_sorted(vec![lock::canonical_key(canonical_id)], handles.config.lock_timeout())
        .await?;

    let mut tx = handles
        .pool
        .begin()
        .await
        .map_err(|e| IreError::from_sqlx("begin lock_canonical transaction", e))?;
    {
        let mut cs = PgCsView::new(&mut tx);
        cs.lock_canonical(canonical_id, reason).await?;
    }
    tx.commit()
        .await
        .map_err(|e| IreError::from_sqlx("commit lock_canonical transaction", e))?;
    Ok(())
}

/// Reverses [`lock_canonical`], restoring the canonical to normal
/// matching visibility.
pub async fn unlock_canonical(handles: &EngineHandles, canonical_id: Uuid) -> Result<()> {
    let _guard = handles
        .locks
        .acquire_sorted(vec![lock::canonical_key(canonical_id)], handles.config.lock_timeout())
        .await?;

    let mut tx = handles
        .pool
        .begin()
        .await
        .map_err(|e| IreError::from_sqlx("begin unlock_canonical transaction", e))?;
    {
        let mut cs = PgCsView::new(&mut tx);
        cs.unlock_canonical(canonical_id).await?;
    }
    tx.commit()
        .await
        .map_err(|e| IreError::from_sqlx("commit unlock_canonical transaction", e))?;
    Ok(())
}

/// One row of the `matching-stats` report: a match type label and the
/// number of `match_log` entries recorded under it.
#[derive(Debug, Clone)]
pub struct MatchingStatsRow {
    pub match_type: String,
    pub count: i64,
}

pub async fn matching_stats(pool: &PgPool) -> Result<Vec<MatchingStatsRow>> {
    let rows = queries::matching_stats(pool).await?;
    Ok(rows
        .into_iter()
        .map(|(match_type, count)| MatchingStatsRow { match_type, count })
        .collect())
}

#[derive(Debug, Clone)]
pub struct MobileAppStats {
    pub new_count: i64,
    pub update_count: i64,
}

pub async fn mobile_app_stats(pool: &PgPool) -> Result<MobileAppStats> {
    let (new_count, update_count) = queries::mobile_app_stats(pool).await?;
    Ok(MobileAppStats { new_count, update_count })
}

pub async fn engine_health(handles: &EngineHandles) -> Result<EngineHealth> {
    queries::engine_health(&handles.pool, handles.retry_count()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_stats_row_carries_label_and_count() {
        let row = MatchingStatsRow {
            match_type: "NEW_NO_DOC".to_string(),
            count: 3,
        };
        assert_eq!(row.match_type, "NEW_NO_DOC");
        assert_eq!(row.count, 3);
    }
}
