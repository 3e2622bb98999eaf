use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::config::{EntityWhitelist, ImportConfig};
use crate::error::{AuditError, RecordError};
use crate::model::EntityType;
use crate::store::StoreWriter;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldChange {
    pub old: Option<String>,
    pub new: Option<String>,
}

/// Field name → (old, new).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeSet(BTreeMap<String, FieldChange>);

impl ChangeSet {
    pub fn new() -> Self {
        ChangeSet::default()
    }

    pub fn set(&mut self, field: &str, old: Option<String>, new: Option<String>) -> &mut Self {
        self.0.insert(field.to_string(), FieldChange { old, new });
        self
    }

    /// Changes for a freshly created row: every field that has a value.
    pub fn created(fields: Vec<(&'static str, Option<String>)>) -> Self {
        let mut cs = ChangeSet::new();
        for (field, value) in fields {
            if value.is_some() {
                cs.set(field, None, value);
            }
        }
        cs
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldChange)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub entity_type: EntityType,
    pub entity_id: i64,
    pub field: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub changed_by: String,
    pub changed_at: DateTime<Utc>,
}

pub struct ChangeLog<'a> {
    whitelist: &'a EntityWhitelist,
    actor: &'a str,
}

impl<'a> ChangeLog<'a> {
    pub fn new(config: &'a ImportConfig) -> Self {
        ChangeLog {
            whitelist: &config.audited,
            actor: &config.actor,
        }
    }

    pub fn check_entity_type(&self, entity_type: &str) -> Result<EntityType, AuditError> {
        let et = entity_type
            .parse::<EntityType>()
            .map_err(AuditError::UnknownEntityType)?;
        if !self.whitelist.contains(et) {
            return Err(AuditError::NotAudited(et));
        }
        Ok(et)
    }

    /// Validate and expand a change set into log entries. Nothing is written.
    pub fn entries(
        &self,
        entity_type: &str,
        entity_id: i64,
        changes: &ChangeSet,
        at: DateTime<Utc>,
    ) -> Result<Vec<AuditLogEntry>, AuditError> {
        let et = self.check_entity_type(entity_type)?;
        if changes.is_empty() {
            return Err(AuditError::EmptyChangeSet {
                entity_type: et,
                entity_id,
            });
        }
        Ok(changes
            .iter()
            .map(|(field, change)| AuditLogEntry {
                entity_type: et,
                entity_id,
                field: field.to_string(),
                old_value: change.old.clone(),
                new_value: change.new.clone(),
                changed_by: self.actor.to_string(),
                changed_at: at,
            })
            .collect())
    }

    /// Validate then append. A rejected change writes no rows.
    pub fn record(
        &self,
        writer: &mut dyn StoreWriter,
        entity_type: &str,
        entity_id: i64,
        changes: &ChangeSet,
        at: DateTime<Utc>,
    ) -> Result<usize, RecordError> {
        let entries = self.entries(entity_type, entity_id, changes, at)?;
        writer.append_audit(&entries)?;
        Ok(entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_and_unlisted_types_are_rejected() {
        let mut cfg = ImportConfig::default();
        cfg.audited = EntityWhitelist::only([EntityType::Student]);
        let log = ChangeLog::new(&cfg);
        let mut cs = ChangeSet::new();
        cs.set("name", None, Some("x".into()));

        assert_eq!(
            log.entries("Foo", 1, &cs, Utc::now()),
            Err(AuditError::UnknownEntityType("Foo".into()))
        );
        assert_eq!(
            log.entries("student", 1, &cs, Utc::now()),
            Err(AuditError::UnknownEntityType("student".into()))
        );
        assert_eq!(
            log.entries("Family", 1, &cs, Utc::now()),
            Err(AuditError::NotAudited(EntityType::Family))
        );
        let entries = log.entries("Student", 1, &cs, Utc::now()).expect("whitelisted");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].changed_by, "legacy-import");
    }

    #[test]
    fn created_change_set_skips_absent_values() {
        let cs = ChangeSet::created(vec![("a", Some("1".into())), ("b", None)]);
        assert_eq!(cs.len(), 1);
        let (field, change) = cs.iter().next().expect("one change");
        assert_eq!(field, "a");
        assert_eq!(change.old, None);
    }
}
