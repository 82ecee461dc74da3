//! The Referrers Registry (spec.md §6): a configuration-time list of
//! (table, column) pairs naming every table whose rows carry
//! `canonical_id`. `mutator::apply_merge` consults this list to rewrite
//! foreign-key references during MERGE; adding a new referrer never
//! requires touching `mutator.rs`.

use crate::util::qi;

/// One table/column pair that references `canonical.canonical_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Referrer {
    pub table: String,
    pub column: String,
}

impl Referrer {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }

    /// The `UPDATE ... SET col = $1 WHERE col = $2` statement redirecting
    /// this referrer's rows from one canonical id to another.
    pub fn rewrite_sql(&self) -> String {
        format!(
            "UPDATE {table} SET {col} = $1 WHERE {col} = $2",
            table = qi(&self.table),
            col = qi(&self.column),
        )
    }
}

/// The full registry, in the fixed order referrers must be redirected
/// during MERGE. `raw_patient` and `mobile_prereg` are referrers in
/// addition to `protocols` — see spec.md §9's "cyclic reference during
/// merge" design note: the *triggering* raw record is itself a referrer
/// and must be redirected before the loser canonical is deleted, but that
/// specific row's `canonical_id` is set by `mutator::apply_merge` directly
/// (step 7) rather than through this generic rewrite, since it also needs
/// `processed_at` stamped in the same statement.
#[derive(Debug, Clone)]
pub struct ReferrersRegistry {
    entries: Vec<Referrer>,
}

impl ReferrersRegistry {
    /// The registry seeded with the tables spec.md names explicitly.
    /// Deployments add entries (e.g. a new medical-event table) by
    /// extending this list, not by editing `mutator.rs`.
    pub fn default_registry() -> Self {
        Self {
            entries: vec![
                Referrer::new("raw_patient", "canonical_id"),
                Referrer::new("protocols", "canonical_id"),
                Referrer::new("mobile_prereg", "canonical_id"),
            ],
        }
    }

    pub fn with_entries(entries: Vec<Referrer>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[Referrer] {
        &self.entries
    }

    pub fn push(&mut self, referrer: Referrer) {
        self.entries.push(referrer);
    }

    /// A stable hash of the registry shape, used by `store::cache` as a
    /// cache-invalidation key: if the registry changes (a new referrer
    /// added at runtime via configuration reload), cached rewrite SQL must
    /// be rebuilt.
    pub fn shape_hash(&self) -> u64 {
        let mut buf = String::new();
        for e in &self.entries {
            buf.push_str(&e.table);
            buf.push('.');
            buf.push_str(&e.column);
            buf.push(';');
        }
        xxhash_rust::xxh3::xxh3_64(buf.as_bytes())
    }
}

impl Default for ReferrersRegistry {
    fn default() -> Self {
        Self::default_registry()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_has_spec_named_tables() {
        let reg = ReferrersRegistry::default_registry();
        let tables: Vec<&str> = reg.entries().iter().map(|e| e.table.as_str()).collect();
        assert!(tables.contains(&"raw_patient"));
        assert!(tables.contains(&"protocols"));
        assert!(tables.contains(&"mobile_prereg"));
    }

    #[test]
    fn rewrite_sql_quotes_identifiers() {
        let r = Referrer::new("protocols", "canonical_id");
        assert_eq!(
            r.rewrite_sql(),
            "UPDATE \"protocols\" SET \"canonical_id\" = $1 WHERE \"canonical_id\" = $2"
        );
    }

    #[test]
    fn shape_hash_changes_when_entries_change() {
        let a = ReferrersRegistry::default_registry();
        let mut b = a.clone();
        b.push(Referrer::new("appointments", "canonical_id"));
        assert_ne!(a.shape_hash(), b.shape_hash());
    }
}
