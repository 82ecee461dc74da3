//! `sqlx`-backed reads and writes against the Canonical Store.
//!
//! Grounded on the teacher's `reader.rs`: build a parameterized query once,
//! reuse it, keep the column-list bookkeeping in one place. Where the
//! teacher builds dynamic `SELECT`/`INSERT` text from introspected column
//! lists (because `sql_saga` targets arbitrary user tables), this module's
//! tables are fixed by `migrations/0001_init.sql`, so the queries are
//! static `sqlx::query_as` calls instead.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::{IreError, Result};
use crate::model::{
    CanonicalPatient, Demographics, DocumentId, MatchLogEntry, MobilePrereg, RawPatientRecord,
    Source,
};

/// Raw row shape for `canonical`, before `slots` jsonb is decoded into a
/// `BTreeMap<Source, SourceSlot>`.
#[derive(sqlx::FromRow)]
struct CanonicalRow {
    canonical_id: Uuid,
    doc_type: Option<i16>,
    doc_number: Option<i64>,
    last_name: Option<String>,
    first_name: Option<String>,
    middle_name: Option<String>,
    birth_date: Option<chrono::NaiveDate>,
    slots: JsonValue,
    primary_source: String,
    registered_via_mobile: bool,
    matching_locked: bool,
    locked_at: Option<chrono::DateTime<Utc>>,
    lock_reason: Option<String>,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

impl CanonicalRow {
    fn into_model(self) -> CanonicalPatient {
        let slots: BTreeMap<Source, crate::model::SourceSlot> =
            serde_json::from_value(self.slots).unwrap_or_default();
        CanonicalPatient {
            canonical_id: self.canonical_id,
            document: match (self.doc_type, self.doc_number) {
                (Some(doc_type), Some(doc_number)) => Some(DocumentId { doc_type, doc_number }),
                _ => None,
            },
            demographics: Demographics {
                last_name: self.last_name,
                first_name: self.first_name,
                middle_name: self.middle_name,
                birth_date: self.birth_date,
            },
            slots,
            primary_source: Source::from_str(&self.primary_source).unwrap_or(Source::Qms),
            registered_via_mobile: self.registered_via_mobile,
            matching_locked: self.matching_locked,
            locked_at: self.locked_at,
            lock_reason: self.lock_reason,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

const CANONICAL_COLUMNS: &str = "canonical_id, doc_type, doc_number, last_name, first_name, \
     middle_name, birth_date, slots, primary_source, registered_via_mobile, matching_locked, \
     locked_at, lock_reason, created_at, updated_at";

/// `sqlx`-backed `CsView` and `Mutator` data access, scoped to one
/// transaction so every lookup a single `Reconcile` call makes is
/// consistent with the writes it is about to perform (spec.md §5: "the
/// critical section is the DB transaction plus the identity locks").
pub struct PgCsView<'a, 'b> {
    pub tx: &'a mut Transaction<'b, Postgres>,
}

impl<'a, 'b> PgCsView<'a, 'b> {
    pub fn new(tx: &'a mut Transaction<'b, Postgres>) -> Self {
        Self { tx }
    }

    pub async fn find_canonical_by_source_his(
        &mut self,
        source: Source,
        his_number: &str,
    ) -> Result<Option<CanonicalPatient>> {
        let path = crate::store::schema::slot_his_number_path(source);
        let sql = format!(
            "SELECT {cols} FROM canonical WHERE matching_locked = false AND {path} = $1",
            cols = CANONICAL_COLUMNS,
            path = path,
        );
        let row: Option<CanonicalRow> = sqlx::query_as(&sql)
            .bind(his_number)
            .fetch_optional(&mut **self.tx)
            .await
            .map_err(|e| IreError::from_sqlx("find_canonical_by_source_his", e))?;
        Ok(row.map(CanonicalRow::into_model))
    }

    pub async fn find_canonical_by_document(
        &mut self,
        doc: DocumentId,
    ) -> Result<Option<CanonicalPatient>> {
        let sql = format!(
            "SELECT {cols} FROM canonical WHERE matching_locked = false \
             AND doc_type = $1 AND doc_number = $2",
            cols = CANONICAL_COLUMNS
        );
        let row: Option<CanonicalRow> = sqlx::query_as(&sql)
            .bind(doc.doc_type)
            .bind(doc.doc_number)
            .fetch_optional(&mut **self.tx)
            .await
            .map_err(|e| IreError::from_sqlx("find_canonical_by_document", e))?;
        Ok(row.map(CanonicalRow::into_model))
    }

    pub async fn find_canonical_by_document_excluding(
        &mut self,
        doc: DocumentId,
        excluding: Uuid,
    ) -> Result<Option<CanonicalPatient>> {
        let sql = format!(
            "SELECT {cols} FROM canonical WHERE matching_locked = false \
             AND doc_type = $1 AND doc_number = $2 AND canonical_id <> $3",
            cols = CANONICAL_COLUMNS
        );
        let row: Option<CanonicalRow> = sqlx::query_as(&sql)
            .bind(doc.doc_type)
            .bind(doc.doc_number)
            .bind(excluding)
            .fetch_optional(&mut **self.tx)
            .await
            .map_err(|e| IreError::from_sqlx("find_canonical_by_document_excluding", e))?;
        Ok(row.map(CanonicalRow::into_model))
    }

    pub async fn find_canonical_by_id(
        &mut self,
        canonical_id: Uuid,
    ) -> Result<Option<CanonicalPatient>> {
        let sql = format!("SELECT {cols} FROM canonical WHERE canonical_id = $1", cols = CANONICAL_COLUMNS);
        let row: Option<CanonicalRow> = sqlx::query_as(&sql)
            .bind(canonical_id)
            .fetch_optional(&mut **self.tx)
            .await
            .map_err(|e| IreError::from_sqlx("find_canonical_by_id", e))?;
        Ok(row.map(CanonicalRow::into_model))
    }

    pub async fn find_prereg_by_source_his(
        &mut self,
        source: Source,
        his_number: &str,
    ) -> Result<Option<MobilePrereg>> {
        let column = match source {
            Source::Qms => "his_number_qms",
            Source::Infoclinica => "his_number_infoclinica",
        };
        let sql = format!(
            "SELECT prereg_id, canonical_id, his_number_qms, his_number_infoclinica, created_at \
             FROM mobile_prereg WHERE {column} = $1"
        );
        let row = sqlx::query_as::<_, (Uuid, Uuid, Option<String>, Option<String>, chrono::DateTime<Utc>)>(&sql)
            .bind(his_number)
            .fetch_optional(&mut **self.tx)
            .await
            .map_err(|e| IreError::from_sqlx("find_prereg_by_source_his", e))?;
        Ok(row.map(|(prereg_id, canonical_id, qms, infoclinica, created_at)| MobilePrereg {
            prereg_id,
            canonical_id,
            his_number_qms: qms,
            his_number_infoclinica: infoclinica,
            created_at,
        }))
    }

    pub async fn insert_canonical(&mut self, c: &CanonicalPatient) -> Result<()> {
        let slots_json = serde_json::to_value(&c.slots).unwrap_or_else(|_| JsonValue::Object(Default::default()));
        sqlx::query(
            "INSERT INTO canonical (canonical_id, doc_type, doc_number, last_name, first_name, \
             middle_name, birth_date, slots, primary_source, registered_via_mobile, \
             matching_locked, locked_at, lock_reason, created_at, updated_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)",
        )
        .bind(c.canonical_id)
        .bind(c.document.map(|d| d.doc_type))
        .bind(c.document.map(|d| d.doc_number))
        .bind(&c.demographics.last_name)
        .bind(&c.demographics.first_name)
        .bind(&c.demographics.middle_name)
        .bind(c.demographics.birth_date)
        .bind(slots_json)
        .bind(c.primary_source.as_str())
        .bind(c.registered_via_mobile)
        .bind(c.matching_locked)
        .bind(c.locked_at)
        .bind(&c.lock_reason)
        .bind(c.created_at)
        .bind(c.updated_at)
        .execute(&mut **self.tx)
        .await
        .map_err(|e| IreError::from_sqlx("insert_canonical", e))?;
        Ok(())
    }

    pub async fn update_canonical(&mut self, c: &CanonicalPatient) -> Result<()> {
        let slots_json = serde_json::to_value(&c.slots).unwrap_or_else(|_| JsonValue::Object(Default::default()));
        sqlx::query(
            "UPDATE canonical SET doc_type=$2, doc_number=$3, last_name=$4, first_name=$5, \
             middle_name=$6, birth_date=$7, slots=$8, registered_via_mobile=$9, updated_at=$10 \
             WHERE canonical_id=$1",
        )
        .bind(c.canonical_id)
        .bind(c.document.map(|d| d.doc_type))
        .bind(c.document.map(|d| d.doc_number))
        .bind(&c.demographics.last_name)
        .bind(&c.demographics.first_name)
        .bind(&c.demographics.middle_name)
        .bind(c.demographics.birth_date)
        .bind(slots_json)
        .bind(c.registered_via_mobile)
        .bind(c.updated_at)
        .execute(&mut **self.tx)
        .await
        .map_err(|e| IreError::from_sqlx("update_canonical", e))?;
        Ok(())
    }

    pub async fn delete_canonical(&mut self, canonical_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM canonical WHERE canonical_id = $1")
            .bind(canonical_id)
            .execute(&mut **self.tx)
            .await
            .map_err(|e| IreError::from_sqlx("delete_canonical", e))?;
        Ok(())
    }

    pub async fn stamp_raw_processed(&mut self, raw_id: Uuid, canonical_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE raw_patient SET canonical_id = $2, processed_at = now() WHERE raw_id = $1",
        )
        .bind(raw_id)
        .bind(canonical_id)
        .execute(&mut **self.tx)
        .await
        .map_err(|e| IreError::from_sqlx("stamp_raw_processed", e))?;
        Ok(())
    }

    pub async fn fetch_raw(&mut self, raw_id: Uuid) -> Result<Option<RawPatientRecord>> {
        let row = sqlx::query_as::<_, RawRow>(
            "SELECT raw_id, his_number, source, business_unit, last_name, first_name, \
             middle_name, birth_date, doc_type, doc_number, email, phone, his_password, \
             login_email, canonical_id, processed_at FROM raw_patient WHERE raw_id = $1",
        )
        .bind(raw_id)
        .fetch_optional(&mut **self.tx)
        .await
        .map_err(|e| IreError::from_sqlx("fetch_raw", e))?;
        Ok(row.map(RawRow::into_model))
    }

    pub async fn insert_raw(&mut self, raw: &RawPatientRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO raw_patient (raw_id, his_number, source, business_unit, last_name, \
             first_name, middle_name, birth_date, doc_type, doc_number, email, phone, \
             his_password, login_email, canonical_id, processed_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16)",
        )
        .bind(raw.raw_id)
        .bind(&raw.his_number)
        .bind(raw.source.as_str())
        .bind(raw.business_unit.map(|b| b.0))
        .bind(&raw.demographics.last_name)
        .bind(&raw.demographics.first_name)
        .bind(&raw.demographics.middle_name)
        .bind(raw.demographics.birth_date)
        .bind(raw.document.map(|d| d.doc_type))
        .bind(raw.document.map(|d| d.doc_number))
        .bind(&raw.email)
        .bind(&raw.phone)
        .bind(&raw.his_password)
        .bind(&raw.login_email)
        .bind(raw.canonical_id)
        .bind(raw.processed_at)
        .execute(&mut **self.tx)
        .await
        .map_err(|e| IreError::from_sqlx("insert_raw", e))?;
        Ok(())
    }

    /// Refreshes the demographic/contact fields of an already-stored raw
    /// row (an adapter re-delivering the same `raw_id`), leaving
    /// `canonical_id`/`processed_at` untouched — those are only ever set by
    /// `stamp_raw_processed`.
    pub async fn update_raw(&mut self, raw: &RawPatientRecord) -> Result<()> {
        sqlx::query(
            "UPDATE raw_patient SET business_unit=$2, last_name=$3, first_name=$4, \
             middle_name=$5, birth_date=$6, doc_type=$7, doc_number=$8, email=$9, phone=$10, \
             his_password=$11, login_email=$12 WHERE raw_id=$1",
        )
        .bind(raw.raw_id)
        .bind(raw.business_unit.map(|b| b.0))
        .bind(&raw.demographics.last_name)
        .bind(&raw.demographics.first_name)
        .bind(&raw.demographics.middle_name)
        .bind(raw.demographics.birth_date)
        .bind(raw.document.map(|d| d.doc_type))
        .bind(raw.document.map(|d| d.doc_number))
        .bind(&raw.email)
        .bind(&raw.phone)
        .bind(&raw.his_password)
        .bind(&raw.login_email)
        .execute(&mut **self.tx)
        .await
        .map_err(|e| IreError::from_sqlx("update_raw", e))?;
        Ok(())
    }

    pub async fn insert_mobile_prereg(&mut self, prereg: &MobilePrereg) -> Result<()> {
        sqlx::query(
            "INSERT INTO mobile_prereg (prereg_id, canonical_id, his_number_qms, \
             his_number_infoclinica, created_at) VALUES ($1,$2,$3,$4,$5)",
        )
        .bind(prereg.prereg_id)
        .bind(prereg.canonical_id)
        .bind(&prereg.his_number_qms)
        .bind(&prereg.his_number_infoclinica)
        .bind(prereg.created_at)
        .execute(&mut **self.tx)
        .await
        .map_err(|e| IreError::from_sqlx("insert_mobile_prereg", e))?;
        Ok(())
    }

    pub async fn insert_match_log(&mut self, entry: &MatchLogEntry) -> Result<()> {
        let details = serde_json::to_value(&entry.details).unwrap_or_default();
        sqlx::query(
            "INSERT INTO match_log (entry_id, his_number, source, \"timestamp\", match_type, \
             doc_number, created_new_canonical, mobile_prereg_canonical_id, \
             resulting_canonical_id, details) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)",
        )
        .bind(entry.entry_id)
        .bind(&entry.his_number)
        .bind(entry.source.as_str())
        .bind(entry.timestamp)
        .bind(entry.match_type.as_str())
        .bind(entry.doc_number)
        .bind(entry.created_new_canonical)
        .bind(entry.mobile_prereg_canonical_id)
        .bind(entry.resulting_canonical_id)
        .bind(details)
        .execute(&mut **self.tx)
        .await
        .map_err(|e| IreError::from_sqlx("insert_match_log", e))?;
        Ok(())
    }

    pub async fn lock_canonical(&mut self, canonical_id: Uuid, reason: &str) -> Result<()> {
        sqlx::query(
            "UPDATE canonical SET matching_locked = true, locked_at = now(), lock_reason = $2 \
             WHERE canonical_id = $1",
        )
        .bind(canonical_id)
        .bind(reason)
        .execute(&mut **self.tx)
        .await
        .map_err(|e| IreError::from_sqlx("lock_canonical", e))?;
        Ok(())
    }

    pub async fn unlock_canonical(&mut self, canonical_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE canonical SET matching_locked = false, locked_at = NULL, lock_reason = NULL \
             WHERE canonical_id = $1",
        )
        .bind(canonical_id)
        .execute(&mut **self.tx)
        .await
        .map_err(|e| IreError::from_sqlx("unlock_canonical", e))?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct RawRow {
    raw_id: Uuid,
    his_number: String,
    source: String,
    business_unit: Option<i16>,
    last_name: Option<String>,
    first_name: Option<String>,
    middle_name: Option<String>,
    birth_date: Option<chrono::NaiveDate>,
    doc_type: Option<i16>,
    doc_number: Option<i64>,
    email: Option<String>,
    phone: Option<String>,
    his_password: Option<String>,
    login_email: Option<String>,
    canonical_id: Option<Uuid>,
    processed_at: Option<chrono::DateTime<Utc>>,
}

impl RawRow {
    fn into_model(self) -> RawPatientRecord {
        RawPatientRecord {
            raw_id: self.raw_id,
            his_number: self.his_number,
            source: Source::from_str(&self.source).unwrap_or(Source::Qms),
            business_unit: self.business_unit.map(crate::model::BusinessUnit),
            demographics: Demographics {
                last_name: self.last_name,
                first_name: self.first_name,
                middle_name: self.middle_name,
                birth_date: self.birth_date,
            },
            document: match (self.doc_type, self.doc_number) {
                (Some(doc_type), Some(doc_number)) => Some(DocumentId { doc_type, doc_number }),
                _ => None,
            },
            email: self.email,
            phone: self.phone,
            his_password: self.his_password,
            login_email: self.login_email,
            canonical_id: self.canonical_id,
            processed_at: self.processed_at,
        }
    }
}

/// Read views named in spec.md §6 ("Administrative surface"): counts by
/// match type, mobile-app adoption counts, and basic engine health.
pub async fn matching_stats(pool: &PgPool) -> Result<Vec<(String, i64)>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT match_type, count(*) FROM match_log GROUP BY match_type ORDER BY match_type",
    )
    .fetch_all(pool)
    .await
    .map_err(|e| IreError::from_sqlx("matching_stats", e))?;
    Ok(rows)
}

pub async fn mobile_app_stats(pool: &PgPool) -> Result<(i64, i64)> {
    let new_count: (i64,) = sqlx::query_as(
        "SELECT count(*) FROM match_log WHERE match_type = 'MOBILE_APP_NEW'",
    )
    .fetch_one(pool)
    .await
    .map_err(|e| IreError::from_sqlx("mobile_app_stats", e))?;
    let update_count: (i64,) = sqlx::query_as(
        "SELECT count(*) FROM match_log WHERE match_type = 'MOBILE_APP_UPDATE'",
    )
    .fetch_one(pool)
    .await
    .map_err(|e| IreError::from_sqlx("mobile_app_stats", e))?;
    Ok((new_count.0, update_count.0))
}

/// spec.md §6: "last-processed timestamp, backlog size, retry counts."
/// `retry_count` is not DB-stored (it is the in-process counter
/// `EngineHandles` maintains across `reconcile`'s backoff loop), so
/// `engine_health` takes it as a parameter rather than querying for it.
#[derive(Debug, Clone)]
pub struct EngineHealth {
    pub last_processed_at: Option<chrono::DateTime<Utc>>,
    pub backlog_size: i64,
    pub retry_count: u64,
}

pub async fn engine_health(pool: &PgPool, retry_count: u64) -> Result<EngineHealth> {
    let last: (Option<chrono::DateTime<Utc>>,) =
        sqlx::query_as("SELECT max(processed_at) FROM raw_patient")
            .fetch_one(pool)
            .await
            .map_err(|e| IreError::from_sqlx("engine_health", e))?;
    let backlog: (i64,) =
        sqlx::query_as("SELECT count(*) FROM raw_patient WHERE processed_at IS NULL")
            .fetch_one(pool)
            .await
            .map_err(|e| IreError::from_sqlx("engine_health", e))?;
    Ok(EngineHealth {
        last_processed_at: last.0,
        backlog_size: backlog.0,
        retry_count,
    })
}
