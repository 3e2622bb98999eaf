use crate::audit::AuditLogEntry;
use crate::error::StoreError;
use crate::model::{EntityType, ImportSummary, NormalizedEntity};
use crate::reconcile::Directory;

pub trait StoreWriter {
    /// Insert a row and return its id. Every reference on the entity must
    /// already point at a stored row.
    fn insert(&mut self, entity: &NormalizedEntity) -> Result<i64, StoreError>;

    fn append_audit(&mut self, entries: &[AuditLogEntry]) -> Result<(), StoreError>;
}

pub trait ImportStore {
    fn exists(&self, kind: EntityType, natural_key: &str) -> Result<bool, StoreError>;

    /// Families and coded entities currently stored, for reference resolution.
    fn load_directory(&self) -> Result<Directory, StoreError>;

    /// Run `f` in a transaction that commits when it returns `Ok` and rolls
    /// back otherwise (including on early return or panic).
    fn transaction<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn StoreWriter) -> Result<T, E>,
        E: From<StoreError>;

    fn record_run(&mut self, summary: &ImportSummary) -> Result<(), StoreError>;

    fn counts(&self) -> Result<Vec<(String, i64)>, StoreError>;

    fn sample(&self, n: usize) -> Result<Vec<(EntityType, serde_json::Value)>, StoreError>;
}
