//! Matching Rules (MR) — spec.md §4.1.
//!
//! `decide` is a pure function over a raw record and a [`CsView`] snapshot.
//! It never touches the database directly; the production `CsView` is
//! backed by `store::queries::PgCsView`, and tests use an in-memory
//! implementation, so the decision priority order below is unit-testable
//! without a running Postgres.

use uuid::Uuid;

use crate::model::{CanonicalPatient, Decision, DocumentId, MatchType, RawPatientRecord, Source};

/// The three lookups Matching Rules is allowed to perform against the
/// Canonical Store, each of which only ever returns canonicals with
/// `matching_locked = false` (spec.md §4.1: "locked canonicals are
/// invisible to matching").
pub trait CsView {
    fn find_canonical_by_source_his(
        &self,
        source: Source,
        his_number: &str,
    ) -> Option<CanonicalPatient>;

    fn find_canonical_by_document(&self, doc: DocumentId) -> Option<CanonicalPatient>;

    fn find_canonical_by_document_excluding(
        &self,
        doc: DocumentId,
        excluding: Uuid,
    ) -> Option<CanonicalPatient>;

    fn find_prereg_by_source_his(
        &self,
        source: Source,
        his_number: &str,
    ) -> Option<crate::model::MobilePrereg>;

    /// Looks up a canonical by id regardless of lock state — used only to
    /// tell "mobile prereg has no canonical yet" (MOBILE_APP_NEW) apart
    /// from "mobile prereg's canonical already exists" (MOBILE_APP_UPDATE),
    /// and to detect the locked-canonical short-circuit on the update path.
    /// This is intentionally a separate method from the three above: it is
    /// not itself a "matching" lookup and must see locked canonicals too.
    fn find_canonical_by_id(&self, canonical_id: Uuid) -> Option<CanonicalPatient>;
}

/// Insertion-path decision (spec.md §4.1, priority 1-4). Called when
/// `raw.canonical_id` is `None`.
pub fn decide_insertion(raw: &RawPatientRecord, cs: &dyn CsView) -> Decision {
    // Priority 1: mobile pre-registration.
    if let Some(prereg) = cs.find_prereg_by_source_his(raw.source, &raw.his_number) {
        let existing = cs.find_canonical_by_id(prereg.canonical_id);
        return Decision::UseExisting {
            canonical_id: prereg.canonical_id,
            match_type: if existing.is_some() {
                MatchType::MobileAppUpdate
            } else {
                MatchType::MobileAppNew
            },
            materialize_mobile: existing.is_none(),
        };
    }

    // Priority 2: same-source identifier.
    if let Some(existing) = cs.find_canonical_by_source_his(raw.source, &raw.his_number) {
        return Decision::UseExisting {
            canonical_id: existing.canonical_id,
            match_type: MatchType::UpdatedExisting,
            materialize_mobile: false,
        };
    }

    // Priority 3: cross-source document match.
    if let Some(doc) = raw.document {
        if let Some(existing) = cs.find_canonical_by_document(doc) {
            return Decision::UseExisting {
                canonical_id: existing.canonical_id,
                match_type: MatchType::MatchedDocument,
                materialize_mobile: false,
            };
        }
    }

    // Priority 4: fresh insertion.
    Decision::Create {
        match_type: if raw.document.is_some() {
            MatchType::NewWithDoc
        } else {
            MatchType::NewNoDoc
        },
    }
}

/// Update-path decision (spec.md §4.1, "Update path"). Called when an
/// adapter re-emits a raw record that already carries a `canonical_id`.
/// `old` is the previously-seen state of the same raw record (by
/// `raw_id`), used to detect a document change.
pub fn decide_update(
    old: &RawPatientRecord,
    new_raw: &RawPatientRecord,
    cs: &dyn CsView,
) -> Decision {
    let canonical_id = match new_raw.canonical_id {
        Some(id) => id,
        None => return decide_insertion(new_raw, cs),
    };

    if let Some(existing) = cs.find_canonical_by_id(canonical_id) {
        if existing.matching_locked {
            return Decision::LockedSkip;
        }
    }

    let doc_changed = old.document != new_raw.document;

    if doc_changed {
        if let Some(new_doc) = new_raw.document {
            if let Some(other) = cs.find_canonical_by_document_excluding(new_doc, canonical_id) {
                if other.canonical_id != canonical_id {
                    let (winner, loser) =
                        pick_merge_winner(canonical_id, other.canonical_id, cs);
                    return Decision::Merge { winner, loser };
                }
            }
        }
    }

    Decision::UseExisting {
        canonical_id,
        match_type: MatchType::RegularUpdate,
        materialize_mobile: false,
    }
}

/// Winner-selection tie-break for MERGE (spec.md §9): prefer the
/// mobile-registered side; otherwise the lexicographically smaller
/// `canonical_id`. Both ids are assumed to refer to canonicals that exist
/// (the raw's own canonical, by construction of the caller, and the
/// document-matched `other`).
fn pick_merge_winner(a: Uuid, b: Uuid, cs: &dyn CsView) -> (Uuid, Uuid) {
    let a_mobile = cs
        .find_canonical_by_id(a)
        .map(|c| c.registered_via_mobile)
        .unwrap_or(false);
    let b_mobile = cs
        .find_canonical_by_id(b)
        .map(|c| c.registered_via_mobile)
        .unwrap_or(false);

    match (a_mobile, b_mobile) {
        (true, false) => (a, b),
        (false, true) => (b, a),
        _ => {
            if a < b {
                (a, b)
            } else {
                (b, a)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Demographics, MobilePrereg};
    use chrono::Utc;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeCs {
        by_source_his: HashMap<(Source, String), CanonicalPatient>,
        by_doc: HashMap<DocumentId, CanonicalPatient>,
        by_id: HashMap<Uuid, CanonicalPatient>,
        preregs: HashMap<(Source, String), MobilePrereg>,
    }

    impl FakeCs {
        fn insert(&mut self, c: CanonicalPatient) {
            for (src, slot) in &c.slots {
                if let Some(his) = &slot.his_number {
                    self.by_source_his
                        .insert((*src, his.clone()), c.clone());
                }
            }
            if let Some(doc) = c.document {
                self.by_doc.insert(doc, c.clone());
            }
            self.by_id.insert(c.canonical_id, c);
        }
    }

    impl CsView for FakeCs {
        fn find_canonical_by_source_his(
            &self,
            source: Source,
            his_number: &str,
        ) -> Option<CanonicalPatient> {
            self.by_source_his
                .get(&(source, his_number.to_string()))
                .filter(|c| !c.matching_locked)
                .cloned()
        }

        fn find_canonical_by_document(&self, doc: DocumentId) -> Option<CanonicalPatient> {
            self.by_doc.get(&doc).filter(|c| !c.matching_locked).cloned()
        }

        fn find_canonical_by_document_excluding(
            &self,
            doc: DocumentId,
            excluding: Uuid,
        ) -> Option<CanonicalPatient> {
            self.by_doc
                .get(&doc)
                .filter(|c| !c.matching_locked && c.canonical_id != excluding)
                .cloned()
        }

        fn find_prereg_by_source_his(
            &self,
            source: Source,
            his_number: &str,
        ) -> Option<MobilePrereg> {
            self.preregs.get(&(source, his_number.to_string())).cloned()
        }

        fn find_canonical_by_id(&self, canonical_id: Uuid) -> Option<CanonicalPatient> {
            self.by_id.get(&canonical_id).cloned()
        }
    }

    fn blank_canonical(id: Uuid, source: Source, his: &str, doc: Option<DocumentId>) -> CanonicalPatient {
        let mut slots = std::collections::BTreeMap::new();
        slots.insert(
            source,
            crate::model::SourceSlot {
                his_number: Some(his.to_string()),
                ..Default::default()
            },
        );
        CanonicalPatient {
            canonical_id: id,
            document: doc,
            demographics: Demographics::default(),
            slots,
            primary_source: source,
            registered_via_mobile: false,
            matching_locked: false,
            locked_at: None,
            lock_reason: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn raw(source: Source, his: &str, doc: Option<DocumentId>) -> RawPatientRecord {
        RawPatientRecord {
            raw_id: Uuid::new_v4(),
            his_number: his.to_string(),
            source,
            business_unit: None,
            demographics: Demographics::default(),
            document: doc,
            email: None,
            phone: None,
            his_password: None,
            login_email: None,
            canonical_id: None,
            processed_at: None,
        }
    }

    #[test]
    fn fresh_insertion_with_no_match_creates() {
        let cs = FakeCs::default();
        let r = raw(Source::Qms, "Q1", None);
        assert_eq!(
            decide_insertion(&r, &cs),
            Decision::Create {
                match_type: MatchType::NewNoDoc
            }
        );
    }

    #[test]
    fn fresh_insertion_with_doc_creates_with_doc_type() {
        let cs = FakeCs::default();
        let doc = DocumentId { doc_type: 1, doc_number: 1000 };
        let r = raw(Source::Qms, "Q1", Some(doc));
        assert_eq!(
            decide_insertion(&r, &cs),
            Decision::Create {
                match_type: MatchType::NewWithDoc
            }
        );
    }

    #[test]
    fn same_source_his_number_uses_existing() {
        let mut cs = FakeCs::default();
        let id = Uuid::new_v4();
        cs.insert(blank_canonical(id, Source::Qms, "Q1", None));
        let r = raw(Source::Qms, "Q1", None);
        assert_eq!(
            decide_insertion(&r, &cs),
            Decision::UseExisting {
                canonical_id: id,
                match_type: MatchType::UpdatedExisting,
                materialize_mobile: false,
            }
        );
    }

    #[test]
    fn cross_source_document_match_scenario_1() {
        let mut cs = FakeCs::default();
        let doc = DocumentId { doc_type: 1, doc_number: 1000 };
        let c1 = Uuid::new_v4();
        cs.insert(blank_canonical(c1, Source::Qms, "Q1", Some(doc)));
        let r = raw(Source::Infoclinica, "I1", Some(doc));
        assert_eq!(
            decide_insertion(&r, &cs),
            Decision::UseExisting {
                canonical_id: c1,
                match_type: MatchType::MatchedDocument,
                materialize_mobile: false,
            }
        );
    }

    #[test]
    fn locked_canonical_invisible_to_document_match_scenario_4() {
        let mut cs = FakeCs::default();
        let doc = DocumentId { doc_type: 1, doc_number: 1000 };
        let mut c1 = blank_canonical(Uuid::new_v4(), Source::Qms, "Q1", Some(doc));
        c1.matching_locked = true;
        cs.insert(c1);
        let r = raw(Source::Qms, "QNEW", Some(doc));
        assert_eq!(
            decide_insertion(&r, &cs),
            Decision::Create {
                match_type: MatchType::NewWithDoc
            }
        );
    }

    #[test]
    fn mobile_prereg_new_when_no_canonical_yet() {
        let mut cs = FakeCs::default();
        let canonical_id = Uuid::new_v4();
        cs.preregs.insert(
            (Source::Qms, "Q3".to_string()),
            MobilePrereg {
                prereg_id: Uuid::new_v4(),
                canonical_id,
                his_number_qms: Some("Q3".to_string()),
                his_number_infoclinica: None,
                created_at: Utc::now(),
            },
        );
        let r = raw(Source::Qms, "Q3", Some(DocumentId { doc_type: 1, doc_number: 3000 }));
        assert_eq!(
            decide_insertion(&r, &cs),
            Decision::UseExisting {
                canonical_id,
                match_type: MatchType::MobileAppNew,
                materialize_mobile: true,
            }
        );
    }

    #[test]
    fn mobile_prereg_update_when_canonical_already_materialized() {
        let mut cs = FakeCs::default();
        let canonical_id = Uuid::new_v4();
        cs.preregs.insert(
            (Source::Qms, "Q3".to_string()),
            MobilePrereg {
                prereg_id: Uuid::new_v4(),
                canonical_id,
                his_number_qms: Some("Q3".to_string()),
                his_number_infoclinica: None,
                created_at: Utc::now(),
            },
        );
        cs.insert(blank_canonical(canonical_id, Source::Qms, "Q3", None));
        let r = raw(Source::Qms, "Q3", None);
        assert_eq!(
            decide_insertion(&r, &cs),
            Decision::UseExisting {
                canonical_id,
                match_type: MatchType::MobileAppUpdate,
                materialize_mobile: false,
            }
        );
    }

    #[test]
    fn update_path_without_doc_change_is_regular_update() {
        let mut cs = FakeCs::default();
        let id = Uuid::new_v4();
        cs.insert(blank_canonical(id, Source::Qms, "Q1", None));
        let mut old = raw(Source::Qms, "Q1", None);
        old.canonical_id = Some(id);
        let mut new_raw = old.clone();
        new_raw.demographics.first_name = Some("Changed".to_string());
        assert_eq!(
            decide_update(&old, &new_raw, &cs),
            Decision::UseExisting {
                canonical_id: id,
                match_type: MatchType::RegularUpdate,
                materialize_mobile: false,
            }
        );
    }

    #[test]
    fn update_path_with_new_colliding_document_merges_scenario_2() {
        let mut cs = FakeCs::default();
        let c2 = Uuid::new_v4();
        let c3 = Uuid::new_v4();
        cs.insert(blank_canonical(c2, Source::Qms, "Q2", None));
        let doc = DocumentId { doc_type: 1, doc_number: 2000 };
        cs.insert(blank_canonical(c3, Source::Infoclinica, "I2", Some(doc)));

        let mut old = raw(Source::Qms, "Q2", None);
        old.canonical_id = Some(c2);
        let mut new_raw = old.clone();
        new_raw.document = Some(doc);

        let expected_winner = if c2 < c3 { c2 } else { c3 };
        let expected_loser = if c2 < c3 { c3 } else { c2 };
        assert_eq!(
            decide_update(&old, &new_raw, &cs),
            Decision::Merge {
                winner: expected_winner,
                loser: expected_loser,
            }
        );
    }

    #[test]
    fn update_path_merge_prefers_mobile_registered_winner() {
        let mut cs = FakeCs::default();
        let c2 = Uuid::new_v4();
        let c3 = Uuid::new_v4();
        let doc = DocumentId { doc_type: 1, doc_number: 9000 };
        let mut canon2 = blank_canonical(c2, Source::Qms, "Q2", None);
        canon2.registered_via_mobile = true;
        cs.insert(canon2);
        cs.insert(blank_canonical(c3, Source::Infoclinica, "I2", Some(doc)));

        let mut old = raw(Source::Qms, "Q2", None);
        old.canonical_id = Some(c2);
        let mut new_raw = old.clone();
        new_raw.document = Some(doc);

        // c2 is mobile-registered and must win regardless of id ordering.
        assert_eq!(
            decide_update(&old, &new_raw, &cs),
            Decision::Merge {
                winner: c2,
                loser: c3,
            }
        );
    }

    #[test]
    fn locked_canonical_on_update_path_is_locked_skip() {
        let mut cs = FakeCs::default();
        let id = Uuid::new_v4();
        let mut c = blank_canonical(id, Source::Qms, "Q1", None);
        c.matching_locked = true;
        cs.insert(c);

        let mut old = raw(Source::Qms, "Q1", None);
        old.canonical_id = Some(id);
        let mut new_raw = old.clone();
        new_raw.document = Some(DocumentId { doc_type: 1, doc_number: 1 });

        assert_eq!(decide_update(&old, &new_raw, &cs), Decision::LockedSkip);
    }
}
