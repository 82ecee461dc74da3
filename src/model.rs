//! Domain types for the canonical patient registry.
//!
//! Mirrors the tables described by the Canonical Store: `canonical`,
//! `raw_patient`, `mobile_prereg`, `match_log`. Enum shapes follow the
//! fixed, closed vocabularies fixed by the spec (source systems, match
//! types) rather than open strings, so an invalid value cannot be
//! constructed.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One of the configured Hospital Information Systems. Adding a third
/// source means adding a variant here, a migration column, and a
/// `SourceSlot` entry — it never requires touching `mutator.rs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Qms,
    Infoclinica,
}

impl Source {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "qms" => Some(Self::Qms),
            "infoclinica" => Some(Self::Infoclinica),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Qms => "qms",
            Self::Infoclinica => "infoclinica",
        }
    }

    /// All currently configured sources, in a fixed order used wherever a
    /// deterministic iteration order matters (e.g. MERGE's "for every other
    /// source slot" step).
    pub fn all() -> &'static [Source] {
        &[Source::Qms, Source::Infoclinica]
    }
}

/// Business unit an HIS record belongs to. The spec treats this as an
/// opaque enum configured per deployment; modeled here as a small-int
/// newtype since no fixed vocabulary is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BusinessUnit(pub i16);

/// Government identity document pair. Invariant (c): both present or both
/// absent — enforced by keeping this as a single `Option<DocumentId>`
/// rather than two independent `Option` fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentId {
    pub doc_type: i16,
    pub doc_number: i64,
}

/// Per-source contact/credential slot on a canonical patient. Either
/// entirely empty or carries at least `his_number` (spec.md §3, Canonical
/// Patient invariants).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSlot {
    pub his_number: Option<String>,
    pub contact_email: Option<String>,
    pub phone: Option<String>,
    pub his_password: Option<String>,
    pub login_email: Option<String>,
}

impl SourceSlot {
    pub fn is_empty(&self) -> bool {
        self.his_number.is_none()
            && self.contact_email.is_none()
            && self.phone.is_none()
            && self.his_password.is_none()
            && self.login_email.is_none()
    }

    /// Build the slot the raw record contributes for its own source.
    pub fn from_raw(raw: &RawPatientRecord) -> Self {
        Self {
            his_number: Some(raw.his_number.clone()),
            contact_email: raw.email.clone(),
            phone: raw.phone.clone(),
            his_password: raw.his_password.clone(),
            login_email: raw.login_email.clone(),
        }
    }
}

/// Demographic fields shared by canonicals and raw records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Demographics {
    pub last_name: Option<String>,
    pub first_name: Option<String>,
    pub middle_name: Option<String>,
    pub birth_date: Option<NaiveDate>,
}

impl Demographics {
    /// Fill-if-empty merge: keep `self`'s value where present, otherwise
    /// take `other`'s. Used by USE_EXISTING (insertion path) and MERGE.
    pub fn fill_if_empty(&mut self, other: &Demographics) {
        if self.last_name.is_none() {
            self.last_name = other.last_name.clone();
        }
        if self.first_name.is_none() {
            self.first_name = other.first_name.clone();
        }
        if self.middle_name.is_none() {
            self.middle_name = other.middle_name.clone();
        }
        if self.birth_date.is_none() {
            self.birth_date = other.birth_date;
        }
    }
}

/// The single deduplicated record for one person (spec.md §3, "canonical").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalPatient {
    pub canonical_id: Uuid,
    pub document: Option<DocumentId>,
    pub demographics: Demographics,
    pub slots: BTreeMap<Source, SourceSlot>,
    pub primary_source: Source,
    pub registered_via_mobile: bool,
    pub matching_locked: bool,
    pub locked_at: Option<DateTime<Utc>>,
    pub lock_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalPatient {
    pub fn slot(&self, source: Source) -> SourceSlot {
        self.slots.get(&source).cloned().unwrap_or_default()
    }

    pub fn slot_mut(&mut self, source: Source) -> &mut SourceSlot {
        self.slots.entry(source).or_default()
    }
}

/// A per-source snapshot delivered by an adapter (spec.md §3, "raw").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPatientRecord {
    pub raw_id: Uuid,
    pub his_number: String,
    pub source: Source,
    pub business_unit: Option<BusinessUnit>,
    pub demographics: Demographics,
    pub document: Option<DocumentId>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub his_password: Option<String>,
    pub login_email: Option<String>,
    pub canonical_id: Option<Uuid>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl RawPatientRecord {
    /// InvalidRaw per spec.md §7: document type/number must be both set or
    /// both unset. Modeled as `Option<DocumentId>` at construction time, so
    /// this only matters for records built outside this crate (e.g.
    /// deserialized from an adapter payload); callers that assemble a
    /// `DocumentId` directly cannot violate it.
    pub fn validate(&self) -> Result<(), crate::error::IreError> {
        if self.his_number.trim().is_empty() {
            return Err(crate::error::IreError::InvalidRaw {
                raw_id: self.raw_id,
                reason: "his_number must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// A reservation of a canonical id created before any HIS record exists
/// (spec.md §3, "mobile_prereg").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MobilePrereg {
    pub prereg_id: Uuid,
    pub canonical_id: Uuid,
    pub his_number_qms: Option<String>,
    pub his_number_infoclinica: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MobilePrereg {
    pub fn his_number_for(&self, source: Source) -> Option<&str> {
        match source {
            Source::Qms => self.his_number_qms.as_deref(),
            Source::Infoclinica => self.his_number_infoclinica.as_deref(),
        }
    }
}

/// The enumerated label written to the audit log describing which rule
/// produced a decision (spec.md §3, `match_log.match_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchType {
    NewNoDoc,
    NewWithDoc,
    UpdatedExisting,
    MatchedDocument,
    MobileAppNew,
    MobileAppUpdate,
    MergedOnUpdate,
    RegularUpdate,
    LockedSkip,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewNoDoc => "NEW_NO_DOC",
            Self::NewWithDoc => "NEW_WITH_DOC",
            Self::UpdatedExisting => "UPDATED_EXISTING",
            Self::MatchedDocument => "MATCHED_DOCUMENT",
            Self::MobileAppNew => "MOBILE_APP_NEW",
            Self::MobileAppUpdate => "MOBILE_APP_UPDATE",
            Self::MergedOnUpdate => "MERGED_ON_UPDATE",
            Self::RegularUpdate => "REGULAR_UPDATE",
            Self::LockedSkip => "LOCKED_SKIP",
        }
    }
}

/// Structured `match_log.details` payload (spec.md §6, audit log contract).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchDetails {
    pub is_mobile_match: bool,
    pub has_document: bool,
    pub loser_canonical_id: Option<Uuid>,
    pub winner_canonical_id: Option<Uuid>,
}

/// Append-only audit entry (spec.md §3, "match_log").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchLogEntry {
    pub entry_id: Uuid,
    pub his_number: String,
    pub source: Source,
    pub timestamp: DateTime<Utc>,
    pub match_type: MatchType,
    pub doc_number: Option<i64>,
    pub created_new_canonical: bool,
    pub mobile_prereg_canonical_id: Option<Uuid>,
    pub resulting_canonical_id: Uuid,
    pub details: MatchDetails,
}

/// The decision produced by Matching Rules (spec.md §4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    UseExisting {
        canonical_id: Uuid,
        match_type: MatchType,
        /// Set when MR found the canonical via mobile pre-registration but
        /// it does not exist yet — MU must materialize it with this id.
        materialize_mobile: bool,
    },
    Create {
        match_type: MatchType,
    },
    Merge {
        winner: Uuid,
        loser: Uuid,
    },
    LockedSkip,
}
