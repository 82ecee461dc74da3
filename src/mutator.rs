//! Mutator (MU) — spec.md §4.2.
//!
//! Applies a [`Decision`] to the Canonical Store inside the caller's
//! transaction. Every path here ends by stamping the triggering raw
//! record; MERGE additionally redirects every Referrers Registry entry
//! before deleting the losing canonical (spec.md §9's "cyclic reference
//! during merge" note: referrers first, delete second, triggering raw row
//! last).

use chrono::Utc;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{
    CanonicalPatient, Decision, MatchDetails, MatchLogEntry, MatchType, RawPatientRecord, Source,
};
use crate::referrers::ReferrersRegistry;
use crate::store::cache::ReferrersSqlCache;
use crate::store::queries::PgCsView;

/// Outcome of applying a decision, returned up through `engine::reconcile`.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub resulting_canonical_id: Uuid,
    pub match_type: MatchType,
}

/// Applies `decision` for `raw` using `cs`, the Referrers Registry, and its
/// SQL cache. `old` is only needed to compute `doc_changed`-adjacent
/// bookkeeping already folded into the decision by `rules::decide_update`;
/// it is not re-examined here.
pub async fn apply(
    cs: &mut PgCsView<'_, '_>,
    registry: &ReferrersRegistry,
    cache: &ReferrersSqlCache,
    raw: &RawPatientRecord,
    decision: Decision,
) -> Result<ApplyOutcome> {
    match decision {
        Decision::Create { match_type } => apply_create(cs, raw, match_type).await,
        Decision::UseExisting {
            canonical_id,
            match_type,
            materialize_mobile,
        } => {
            if materialize_mobile {
                apply_mobile_materialize(cs, raw, canonical_id, match_type).await
            } else if match_type == MatchType::RegularUpdate {
                apply_regular_update(cs, raw, canonical_id).await
            } else {
                apply_use_existing_insertion(cs, raw, canonical_id, match_type).await
            }
        }
        Decision::Merge { winner, loser } => apply_merge(cs, registry, cache, raw, winner, loser).await,
        Decision::LockedSkip => apply_locked_skip(cs, raw).await,
    }
}

async fn apply_create(
    cs: &mut PgCsView<'_, '_>,
    raw: &RawPatientRecord,
    match_type: MatchType,
) -> Result<ApplyOutcome> {
    let now = Utc::now();
    let canonical_id = Uuid::new_v4();

    let mut slots = std::collections::BTreeMap::new();
    slots.insert(raw.source, crate::model::SourceSlot::from_raw(raw));

    let canonical = CanonicalPatient {
        canonical_id,
        document: raw.document,
        demographics: raw.demographics.clone(),
        slots,
        primary_source: raw.source,
        registered_via_mobile: false,
        matching_locked: false,
        locked_at: None,
        lock_reason: None,
        created_at: now,
        updated_at: now,
    };

    cs.insert_canonical(&canonical).await?;
    cs.stamp_raw_processed(raw.raw_id, canonical_id).await?;

    write_audit(
        cs,
        raw,
        match_type,
        true,
        canonical_id,
        None,
        MatchDetails {
            is_mobile_match: false,
            has_document: raw.document.is_some(),
            loser_canonical_id: None,
            winner_canonical_id: None,
        },
    )
    .await?;

    Ok(ApplyOutcome {
        resulting_canonical_id: canonical_id,
        match_type,
    })
}

/// MOBILE_APP_NEW: materialize a canonical at the pre-allocated id the
/// mobile pre-registration reserved (spec.md §9: "two-phase canonical").
async fn apply_mobile_materialize(
    cs: &mut PgCsView<'_, '_>,
    raw: &RawPatientRecord,
    canonical_id: Uuid,
    match_type: MatchType,
) -> Result<ApplyOutcome> {
    let now = Utc::now();
    let mut slots = std::collections::BTreeMap::new();
    slots.insert(raw.source, crate::model::SourceSlot::from_raw(raw));

    let canonical = CanonicalPatient {
        canonical_id,
        document: raw.document,
        demographics: raw.demographics.clone(),
        slots,
        primary_source: raw.source,
        registered_via_mobile: true,
        matching_locked: false,
        locked_at: None,
        lock_reason: None,
        created_at: now,
        updated_at: now,
    };

    cs.insert_canonical(&canonical).await?;
    cs.stamp_raw_processed(raw.raw_id, canonical_id).await?;

    write_audit(
        cs,
        raw,
        match_type,
        true,
        canonical_id,
        Some(canonical_id),
        MatchDetails {
            is_mobile_match: true,
            has_document: raw.document.is_some(),
            loser_canonical_id: None,
            winner_canonical_id: None,
        },
    )
    .await?;

    Ok(ApplyOutcome {
        resulting_canonical_id: canonical_id,
        match_type,
    })
}

/// USE_EXISTING, insertion path (spec.md §4.2): fill-if-empty for
/// demographics and document, unconditional slot population for the raw's
/// own source.
async fn apply_use_existing_insertion(
    cs: &mut PgCsView<'_, '_>,
    raw: &RawPatientRecord,
    canonical_id: Uuid,
    match_type: MatchType,
) -> Result<ApplyOutcome> {
    let mut canonical = cs
        .find_canonical_by_id(canonical_id)
        .await?
        .ok_or_else(|| missing_canonical(canonical_id))?;

    *canonical.slot_mut(raw.source) = crate::model::SourceSlot::from_raw(raw);
    canonical.demographics.fill_if_empty(&raw.demographics);
    if canonical.document.is_none() {
        canonical.document = raw.document;
    }
    canonical.updated_at = Utc::now();

    cs.update_canonical(&canonical).await?;
    cs.stamp_raw_processed(raw.raw_id, canonical_id).await?;

    write_audit(
        cs,
        raw,
        match_type,
        false,
        canonical_id,
        None,
        MatchDetails {
            is_mobile_match: matches!(match_type, MatchType::MobileAppUpdate),
            has_document: raw.document.is_some(),
            loser_canonical_id: None,
            winner_canonical_id: None,
        },
    )
    .await?;

    Ok(ApplyOutcome {
        resulting_canonical_id: canonical_id,
        match_type,
    })
}

/// USE_EXISTING, update path / REGULAR_UPDATE (spec.md §4.2): the only
/// path that overwrites already-populated demographics, because the raw
/// record is authoritative for its own source's slot.
async fn apply_regular_update(
    cs: &mut PgCsView<'_, '_>,
    raw: &RawPatientRecord,
    canonical_id: Uuid,
) -> Result<ApplyOutcome> {
    let mut canonical = cs
        .find_canonical_by_id(canonical_id)
        .await?
        .ok_or_else(|| missing_canonical(canonical_id))?;

    *canonical.slot_mut(raw.source) = crate::model::SourceSlot::from_raw(raw);
    canonical.demographics = raw.demographics.clone();
    canonical.document = raw.document;
    canonical.updated_at = Utc::now();

    cs.update_canonical(&canonical).await?;
    cs.stamp_raw_processed(raw.raw_id, canonical_id).await?;

    write_audit(
        cs,
        raw,
        MatchType::RegularUpdate,
        false,
        canonical_id,
        None,
        MatchDetails {
            is_mobile_match: false,
            has_document: raw.document.is_some(),
            loser_canonical_id: None,
            winner_canonical_id: None,
        },
    )
    .await?;

    Ok(ApplyOutcome {
        resulting_canonical_id: canonical_id,
        match_type: MatchType::RegularUpdate,
    })
}

/// MERGE(winner, loser) — spec.md §4.2's eight numbered steps, in order.
async fn apply_merge(
    cs: &mut PgCsView<'_, '_>,
    registry: &ReferrersRegistry,
    cache: &ReferrersSqlCache,
    raw: &RawPatientRecord,
    winner_id: Uuid,
    loser_id: Uuid,
) -> Result<ApplyOutcome> {
    let mut winner = cs
        .find_canonical_by_id(winner_id)
        .await?
        .ok_or_else(|| missing_canonical(winner_id))?;
    let loser = cs
        .find_canonical_by_id(loser_id)
        .await?
        .ok_or_else(|| missing_canonical(loser_id))?;

    // Step 1: overwrite winner's matching slot from the triggering raw.
    *winner.slot_mut(raw.source) = crate::model::SourceSlot::from_raw(raw);

    // Step 2: copy loser's other slots into winner only where winner is empty.
    for &source in Source::all() {
        if source == raw.source {
            continue;
        }
        let loser_slot = loser.slot(source);
        if loser_slot.is_empty() {
            continue;
        }
        let winner_slot = winner.slot(source);
        if winner_slot.is_empty() {
            *winner.slot_mut(source) = loser_slot;
        }
    }

    // Step 3: fill winner's null demographic fields from loser.
    winner.demographics.fill_if_empty(&loser.demographics);
    if winner.document.is_none() {
        winner.document = loser.document;
    }

    // Step 4: OR registered_via_mobile.
    winner.registered_via_mobile = winner.registered_via_mobile || loser.registered_via_mobile;
    winner.updated_at = Utc::now();

    // Step 5: redirect every Referrers Registry entry from loser to winner.
    let rewrite_sql = cache.rewrite_sql_for(registry);
    for statement in &rewrite_sql.statements {
        sqlx::query(statement)
            .bind(winner_id)
            .bind(loser_id)
            .execute(&mut **cs.tx)
            .await
            .map_err(|e| crate::error::IreError::from_sqlx("merge referrer rewrite", e))?;
    }

    // Step 6: delete the loser, before writing the winner — the winner's
    // row is about to claim his_number/document values the loser's row
    // still holds, which the partial unique indexes on `canonical` would
    // otherwise reject as a live collision between two rows.
    cs.delete_canonical(loser_id).await?;

    // Only now is it safe to persist the absorbed slots/demographics/
    // document onto the winner without tripping over the loser's
    // still-unique values.
    cs.update_canonical(&winner).await?;

    // Step 7: update the triggering raw row last (it was already redirected
    // by step 5's raw_patient rewrite if it previously pointed at the
    // loser; this stamps it to the winner and sets processed_at
    // regardless, which is idempotent either way).
    cs.stamp_raw_processed(raw.raw_id, winner_id).await?;

    // Step 8: single MERGED_ON_UPDATE audit entry.
    write_audit(
        cs,
        raw,
        MatchType::MergedOnUpdate,
        false,
        winner_id,
        None,
        MatchDetails {
            is_mobile_match: false,
            has_document: true,
            loser_canonical_id: Some(loser_id),
            winner_canonical_id: Some(winner_id),
        },
    )
    .await?;

    Ok(ApplyOutcome {
        resulting_canonical_id: winner_id,
        match_type: MatchType::MergedOnUpdate,
    })
}

/// LOCKED_SKIP: stamp `processed_at` only, no canonical field changes.
async fn apply_locked_skip(cs: &mut PgCsView<'_, '_>, raw: &RawPatientRecord) -> Result<ApplyOutcome> {
    let canonical_id = raw
        .canonical_id
        .expect("LOCKED_SKIP is only reachable when raw.canonical_id is set");

    cs.stamp_raw_processed(raw.raw_id, canonical_id).await?;

    write_audit(
        cs,
        raw,
        MatchType::LockedSkip,
        false,
        canonical_id,
        None,
        MatchDetails {
            is_mobile_match: false,
            has_document: raw.document.is_some(),
            loser_canonical_id: None,
            winner_canonical_id: None,
        },
    )
    .await?;

    Ok(ApplyOutcome {
        resulting_canonical_id: canonical_id,
        match_type: MatchType::LockedSkip,
    })
}

#[allow(clippy::too_many_arguments)]
async fn write_audit(
    cs: &mut PgCsView<'_, '_>,
    raw: &RawPatientRecord,
    match_type: MatchType,
    created_new_canonical: bool,
    resulting_canonical_id: Uuid,
    mobile_prereg_canonical_id: Option<Uuid>,
    details: MatchDetails,
) -> Result<()> {
    let entry = MatchLogEntry {
        entry_id: Uuid::new_v4(),
        his_number: raw.his_number.clone(),
        source: raw.source,
        timestamp: Utc::now(),
        match_type,
        doc_number: raw.document.map(|d| d.doc_number),
        created_new_canonical,
        mobile_prereg_canonical_id,
        resulting_canonical_id,
        details,
    };
    cs.insert_match_log(&entry).await
}

fn missing_canonical(canonical_id: Uuid) -> crate::error::IreError {
    crate::error::IreError::StorageFailure {
        context: format!("expected canonical {canonical_id} to exist"),
        source: sqlx::Error::RowNotFound,
    }
}
