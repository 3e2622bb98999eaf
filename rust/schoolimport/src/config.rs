use anyhow::Context;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;

use crate::model::EntityType;

pub const DEFAULT_DATE_FORMAT: &str = "%d/%m/%Y";
pub const DEFAULT_ACTOR: &str = "legacy-import";

/// Entity types the change log accepts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityWhitelist(BTreeSet<EntityType>);

impl EntityWhitelist {
    pub fn all() -> Self {
        EntityWhitelist(EntityType::ALL.into_iter().collect())
    }

    pub fn only(types: impl IntoIterator<Item = EntityType>) -> Self {
        EntityWhitelist(types.into_iter().collect())
    }

    pub fn contains(&self, t: EntityType) -> bool {
        self.0.contains(&t)
    }
}

impl Default for EntityWhitelist {
    fn default() -> Self {
        EntityWhitelist::all()
    }
}

#[derive(Clone, Debug)]
pub struct ImportConfig {
    /// chrono format string for legacy date fields.
    pub date_format: String,
    /// Recorded as `changed_by` on change-log entries.
    pub actor: String,
    pub audited: EntityWhitelist,
}

impl Default for ImportConfig {
    fn default() -> Self {
        ImportConfig {
            date_format: DEFAULT_DATE_FORMAT.to_string(),
            actor: DEFAULT_ACTOR.to_string(),
            audited: EntityWhitelist::all(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ConfigFile {
    date_format: Option<String>,
    actor: Option<String>,
    audited_entity_types: Option<Vec<String>>,
}

impl ImportConfig {
    /// Defaults, overridden by the JSON file at `path` when given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<ImportConfig> {
        let mut cfg = ImportConfig::default();
        let Some(path) = path else {
            return Ok(cfg);
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.to_string_lossy()))?;
        let file: ConfigFile = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.to_string_lossy()))?;

        if let Some(fmt) = file.date_format.filter(|s| !s.trim().is_empty()) {
            cfg.date_format = fmt;
        }
        if let Some(actor) = file.actor.filter(|s| !s.trim().is_empty()) {
            cfg.actor = actor.trim().to_string();
        }
        if let Some(types) = file.audited_entity_types {
            let mut parsed = Vec::with_capacity(types.len());
            for t in &types {
                let et = t
                    .parse::<EntityType>()
                    .map_err(|bad| anyhow::anyhow!("unknown entity type in auditedEntityTypes: {bad}"))?;
                parsed.push(et);
            }
            cfg.audited = EntityWhitelist::only(parsed);
        }
        Ok(cfg)
    }
}
