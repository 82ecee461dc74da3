//! End-to-end reconcile scenarios against a real Postgres database, one
//! per `#[sqlx::test]` (spec.md §8's "Concrete end-to-end scenarios").
//! Each test gets its own freshly migrated database courtesy of `sqlx`'s
//! test harness, so scenarios never interfere with each other.

use patient_ire::admin;
use patient_ire::config::EngineConfig;
use patient_ire::engine::{reconcile, EngineHandles, ReconcileEvent};
use patient_ire::model::{BusinessUnit, Demographics, DocumentId, RawPatientRecord, Source};
use sqlx::PgPool;
use uuid::Uuid;

fn handles(pool: PgPool) -> EngineHandles {
    EngineHandles::new(
        pool,
        EngineConfig {
            database_url: "unused-in-tests".to_string(),
            retry_cap: 5,
            lock_timeout_ms: 5_000,
            worker_count: 4,
            retry_base_delay_ms: 5,
            retry_max_delay_ms: 40,
        },
    )
}

fn raw(source: Source, his: &str, doc: Option<(i16, i64)>, name: &str) -> RawPatientRecord {
    RawPatientRecord {
        raw_id: Uuid::new_v4(),
        his_number: his.to_string(),
        source,
        business_unit: Some(BusinessUnit(1)),
        demographics: Demographics {
            last_name: Some(name.to_string()),
            first_name: None,
            middle_name: None,
            birth_date: None,
        },
        document: doc.map(|(doc_type, doc_number)| DocumentId { doc_type, doc_number }),
        email: None,
        phone: None,
        his_password: None,
        login_email: None,
        canonical_id: None,
        processed_at: None,
    }
}

/// Scenario 1: fresh patient, qMS first, Infoclinica later with a
/// matching document — the two raws converge on one canonical.
#[sqlx::test]
async fn scenario_1_cross_source_document_match(pool: PgPool) {
    let handles = handles(pool);

    let r1 = raw(Source::Qms, "Q1", Some((1, 1000)), "A");
    let outcome1 = reconcile(&handles, &ReconcileEvent { raw: r1 }).await.unwrap();
    let c1 = outcome1.resulting_canonical_id;

    let r2 = raw(Source::Infoclinica, "I1", Some((1, 1000)), "A");
    let outcome2 = reconcile(&handles, &ReconcileEvent { raw: r2 }).await.unwrap();

    assert_eq!(outcome2.resulting_canonical_id, c1);
    assert_eq!(outcome2.match_type, patient_ire::model::MatchType::MatchedDocument);

    let mut tx = handles.pool.begin().await.unwrap();
    let mut cs = patient_ire::store::queries::PgCsView::new(&mut tx);
    let canonical = cs.find_canonical_by_id(c1).await.unwrap().unwrap();
    assert!(canonical.slot(Source::Qms).his_number.is_some());
    assert!(canonical.slot(Source::Infoclinica).his_number.is_some());
}

/// Scenario 2: a late document arriving on an update triggers MERGE.
#[sqlx::test]
async fn scenario_2_late_document_triggers_merge(pool: PgPool) {
    let handles = handles(pool);

    let r_q2 = raw(Source::Qms, "Q2", None, "B");
    let q2_raw_id = r_q2.raw_id;
    let outcome_c2 = reconcile(&handles, &ReconcileEvent { raw: r_q2 }).await.unwrap();
    let c2 = outcome_c2.resulting_canonical_id;

    let r_i2 = raw(Source::Infoclinica, "I2", Some((1, 2000)), "B");
    let outcome_c3 = reconcile(&handles, &ReconcileEvent { raw: r_i2 }).await.unwrap();
    let c3 = outcome_c3.resulting_canonical_id;

    let mut updated_q2 = raw(Source::Qms, "Q2", Some((1, 2000)), "B");
    updated_q2.raw_id = q2_raw_id;
    let outcome_merge = reconcile(&handles, &ReconcileEvent { raw: updated_q2 }).await.unwrap();

    let expected_winner = c2.min(c3);
    let expected_loser = c2.max(c3);
    assert_eq!(outcome_merge.resulting_canonical_id, expected_winner);
    assert_eq!(outcome_merge.match_type, patient_ire::model::MatchType::MergedOnUpdate);

    let mut tx = handles.pool.begin().await.unwrap();
    let mut cs = patient_ire::store::queries::PgCsView::new(&mut tx);
    assert!(cs.find_canonical_by_id(expected_loser).await.unwrap().is_none());
    let winner = cs.find_canonical_by_id(expected_winner).await.unwrap().unwrap();
    assert!(winner.slot(Source::Qms).his_number.is_some());
    assert!(winner.slot(Source::Infoclinica).his_number.is_some());

    let q2_row = cs.fetch_raw(q2_raw_id).await.unwrap().unwrap();
    assert_eq!(q2_row.canonical_id, Some(expected_winner));
}

/// Scenario 3: a mobile pre-registration is adopted by the first matching
/// qMS record (MOBILE_APP_NEW).
#[sqlx::test]
async fn scenario_3_mobile_prereg_adoption(pool: PgPool) {
    let handles = handles(pool);
    let m1 = Uuid::new_v4();

    {
        let mut tx = handles.pool.begin().await.unwrap();
        let mut cs = patient_ire::store::queries::PgCsView::new(&mut tx);
        cs.insert_mobile_prereg(&patient_ire::model::MobilePrereg {
            prereg_id: Uuid::new_v4(),
            canonical_id: m1,
            his_number_qms: Some("Q3".to_string()),
            his_number_infoclinica: None,
            created_at: chrono::Utc::now(),
        })
        .await
        .unwrap();
        drop(cs);
        tx.commit().await.unwrap();
    }

    let r = raw(Source::Qms, "Q3", Some((1, 3000)), "C");
    let outcome = reconcile(&handles, &ReconcileEvent { raw: r }).await.unwrap();

    assert_eq!(outcome.resulting_canonical_id, m1);
    assert_eq!(outcome.match_type, patient_ire::model::MatchType::MobileAppNew);

    let mut tx = handles.pool.begin().await.unwrap();
    let mut cs = patient_ire::store::queries::PgCsView::new(&mut tx);
    let canonical = cs.find_canonical_by_id(m1).await.unwrap().unwrap();
    assert!(canonical.registered_via_mobile);
    assert_eq!(canonical.document, Some(DocumentId { doc_type: 1, doc_number: 3000 }));
}

/// Scenario 4: a locked canonical is invisible to document matching, so a
/// colliding document creates a brand-new canonical instead of merging.
#[sqlx::test]
async fn scenario_4_locked_canonical_invisible_to_matching(pool: PgPool) {
    let handles = handles(pool);

    let r1 = raw(Source::Qms, "Q1", Some((1, 1000)), "A");
    let outcome1 = reconcile(&handles, &ReconcileEvent { raw: r1 }).await.unwrap();
    let c1 = outcome1.resulting_canonical_id;

    admin::lock_canonical(&handles, c1, "fraud review").await.unwrap();

    let r2 = raw(Source::Qms, "QNEW", Some((1, 1000)), "A");
    let outcome2 = reconcile(&handles, &ReconcileEvent { raw: r2 }).await.unwrap();

    assert_ne!(outcome2.resulting_canonical_id, c1);
    assert_eq!(outcome2.match_type, patient_ire::model::MatchType::NewWithDoc);
}

/// Scenario 5: two workers racing to reconcile raws for the same document
/// converge on exactly one canonical with both slots filled. Identity
/// locks fully serialize the two `reconcile` calls on the shared
/// `doc:1/5000` key, so this exercises lock-based serialization rather
/// than the retry loop — the two are equally valid ways to satisfy the
/// "exactly one canonical" property the scenario specifies.
#[sqlx::test]
async fn scenario_5_concurrent_inserts_same_document_converge(pool: PgPool) {
    let handles = handles(pool);

    let r_qms = raw(Source::Qms, "Q5", Some((1, 5000)), "E");
    let r_ic = raw(Source::Infoclinica, "I5", Some((1, 5000)), "E");

    let h1 = handles.clone();
    let h2 = handles.clone();
    let t1 = tokio::spawn(async move { reconcile(&h1, &ReconcileEvent { raw: r_qms }).await });
    let t2 = tokio::spawn(async move { reconcile(&h2, &ReconcileEvent { raw: r_ic }).await });

    let outcome1 = t1.await.unwrap().unwrap();
    let outcome2 = t2.await.unwrap().unwrap();

    assert_eq!(outcome1.resulting_canonical_id, outcome2.resulting_canonical_id);

    let mut tx = handles.pool.begin().await.unwrap();
    let mut cs = patient_ire::store::queries::PgCsView::new(&mut tx);
    let canonical = cs
        .find_canonical_by_id(outcome1.resulting_canonical_id)
        .await
        .unwrap()
        .unwrap();
    assert!(canonical.slot(Source::Qms).his_number.is_some());
    assert!(canonical.slot(Source::Infoclinica).his_number.is_some());
}

/// Scenario 6: idempotent replay. Re-running scenario 1's two raws (in
/// reverse order, same `raw_id`s) leaves the canonical state unchanged —
/// both reconcile calls land on REGULAR_UPDATE, not a new CREATE/MERGE.
#[sqlx::test]
async fn scenario_6_idempotent_replay(pool: PgPool) {
    let handles = handles(pool);

    let r1 = raw(Source::Qms, "Q1", Some((1, 1000)), "A");
    let r1_id = r1.raw_id;
    let r1_for_replay = r1.clone();
    let outcome1 = reconcile(&handles, &ReconcileEvent { raw: r1 }).await.unwrap();
    let c1 = outcome1.resulting_canonical_id;

    let r2 = raw(Source::Infoclinica, "I1", Some((1, 1000)), "A");
    let r2_id = r2.raw_id;
    let r2_for_replay = r2.clone();
    reconcile(&handles, &ReconcileEvent { raw: r2 }).await.unwrap();

    // Replay in reverse order, same raw_ids.
    let mut replay2 = r2_for_replay;
    replay2.raw_id = r2_id;
    let replay_outcome2 = reconcile(&handles, &ReconcileEvent { raw: replay2 }).await.unwrap();

    let mut replay1 = r1_for_replay;
    replay1.raw_id = r1_id;
    let replay_outcome1 = reconcile(&handles, &ReconcileEvent { raw: replay1 }).await.unwrap();

    assert_eq!(replay_outcome1.resulting_canonical_id, c1);
    assert_eq!(replay_outcome2.resulting_canonical_id, c1);
    assert_eq!(replay_outcome1.match_type, patient_ire::model::MatchType::RegularUpdate);
    assert_eq!(replay_outcome2.match_type, patient_ire::model::MatchType::RegularUpdate);

    let mut tx = handles.pool.begin().await.unwrap();
    let mut cs = patient_ire::store::queries::PgCsView::new(&mut tx);
    let canonical = cs.find_canonical_by_id(c1).await.unwrap().unwrap();
    assert!(canonical.slot(Source::Qms).his_number.is_some());
    assert!(canonical.slot(Source::Infoclinica).his_number.is_some());
}
