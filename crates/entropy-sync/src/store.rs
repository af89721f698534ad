use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

pub type PackageId = i64;

/// Grouped package sets: set name to member atoms.
pub type PackageSets = BTreeMap<String, BTreeSet<String>>;

/// One package's metadata as exchanged with the differential service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub id: PackageId,
    pub atom: String,
    #[serde(default)]
    pub revision: i64,
    #[serde(default)]
    pub signature: Option<String>,
    /// Remaining metadata columns, kept opaque.
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl PackageRecord {
    pub fn new(id: PackageId, atom: impl Into<String>, revision: i64) -> Self {
        Self {
            id,
            atom: atom.into(),
            revision,
            signature: None,
            fields: serde_json::Map::new(),
        }
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

/// Pending tree-structure moves and their digest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeUpdates {
    pub digest: String,
    pub actions: Vec<String>,
}

/// Local-only state attached to a package atom, carried across bulk replacements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub atom: String,
    pub key: String,
    pub value: String,
}

/// Normalization rules for `MetadataStore::checksum`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumOptions {
    pub ordered: bool,
    pub include_signatures: bool,
}

impl Default for ChecksumOptions {
    fn default() -> Self {
        Self {
            ordered: true,
            include_signatures: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("package not found: {0}")]
    NotFound(PackageId),

    /// The file is not a usable metadata store.
    #[error("corrupt metadata store: {0}")]
    Corrupt(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Settings key holding the cross-reference library index.
pub const LIBRARY_INDEX_KEY: &str = "library_idpackages";

/// Local metadata store of one repository.
///
/// Mutations made after `begin` stay invisible until `commit`; `rollback`
/// restores the state as of `begin`.
pub trait MetadataStore: Send + Sync {
    fn list_all_identifiers(&self) -> Result<BTreeSet<PackageId>, StoreError>;

    fn record(&self, id: PackageId) -> Result<Option<PackageRecord>, StoreError>;

    /// Atoms starting with `prefix`, e.g. `sys-apps/entropy-`.
    fn find_atoms(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    fn begin(&mut self) -> Result<(), StoreError>;

    fn insert_record(&mut self, record: &PackageRecord) -> Result<(), StoreError>;

    fn remove_record(&mut self, id: PackageId) -> Result<(), StoreError>;

    fn package_sets(&self) -> Result<PackageSets, StoreError>;

    fn replace_package_sets(&mut self, sets: &PackageSets) -> Result<(), StoreError>;

    fn tree_updates(&self) -> Result<Option<TreeUpdates>, StoreError>;

    fn set_tree_updates(&mut self, updates: &TreeUpdates) -> Result<(), StoreError>;

    fn setting(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set_setting(&mut self, key: &str, value: &str) -> Result<(), StoreError>;

    fn annotations(&self) -> Result<Vec<Annotation>, StoreError>;

    fn set_annotation(&mut self, annotation: &Annotation) -> Result<(), StoreError>;

    fn commit(&mut self) -> Result<(), StoreError>;

    fn rollback(&mut self) -> Result<(), StoreError>;

    fn checksum(&self, options: ChecksumOptions) -> Result<String, StoreError>;

    /// Rebuild search indexes after the content changed.
    fn rebuild_indexes(&mut self) -> Result<(), StoreError>;

    fn close(self: Box<Self>) -> Result<(), StoreError>;
}

/// Opens metadata stores. Two stores may be open at once (old and new copy).
pub trait StoreOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn MetadataStore>, StoreError>;

    /// Build a fresh store at `dest` from an uncompressed dump.
    fn import_dump(&self, dump: &Path, dest: &Path) -> Result<(), StoreError>;

    /// Whether dumps can be imported at all. Without it tier 2 is unusable.
    fn supports_dump_import(&self) -> bool {
        true
    }

    /// Check that the file at `path` is a readable store.
    fn validate(&self, path: &Path) -> Result<(), StoreError> {
        let store = self.open(path)?;
        store.list_all_identifiers()?;
        store.close()
    }
}

/// Copy local-only annotations from `old` into `new` for atoms still present.
///
/// Runs inside a transaction on `new`; on error the transaction is rolled
/// back and the error returned, leaving `new` as imported.
pub fn align_annotations(
    old: &dyn MetadataStore,
    new: &mut dyn MetadataStore,
) -> Result<usize, StoreError> {
    let annotations = old.annotations()?;
    if annotations.is_empty() {
        return Ok(0);
    }
    let mut known = BTreeSet::new();
    for id in new.list_all_identifiers()? {
        if let Some(record) = new.record(id)? {
            known.insert(record.atom);
        }
    }

    new.begin()?;
    let mut carried = 0;
    for annotation in annotations.iter().filter(|a| known.contains(&a.atom)) {
        if let Err(e) = new.set_annotation(annotation) {
            let _ = new.rollback();
            return Err(e);
        }
        carried += 1;
    }
    if let Err(e) = new.commit() {
        let _ = new.rollback();
        return Err(e);
    }
    Ok(carried)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_json_shape() {
        let json = serde_json::json!({
            "id": 7,
            "atom": "app-misc/foo-1.0",
            "fields": {"slot": "0"}
        });
        let record: PackageRecord = serde_json::from_value(json).unwrap();
        assert_eq!(record.id, 7);
        assert_eq!(record.revision, 0);
        assert_eq!(record.signature, None);
        assert_eq!(record.fields["slot"], "0");
    }

    #[test]
    fn checksum_defaults_are_strict() {
        let options = ChecksumOptions::default();
        assert!(options.ordered);
        assert!(options.include_signatures);
    }
}
