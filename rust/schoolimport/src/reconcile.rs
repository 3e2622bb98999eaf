use std::collections::HashMap;

use crate::model::{family_name_key, EntityType, FamilyLink, NormalizedEntity, RefId};

#[derive(Clone, Debug)]
struct KnownFamily {
    id: RefId,
    key: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FamilyResolution {
    pub link: FamilyLink,
    pub warning: Option<String>,
}

/// Known entities at a point in the run: everything the store held when the
/// run started plus everything the run has imported (or, in preview, would
/// have imported) since.
#[derive(Clone, Debug, Default)]
pub struct Directory {
    families: Vec<KnownFamily>,
    codes: HashMap<(EntityType, String), RefId>,
}

impl Directory {
    pub fn new() -> Self {
        Directory::default()
    }

    pub fn add_family(&mut self, id: RefId, name: &str) {
        self.families.push(KnownFamily {
            id,
            key: family_name_key(name),
        });
    }

    pub fn add_code(&mut self, kind: EntityType, code: &str, id: RefId) {
        self.codes.insert((kind, code.trim().to_string()), id);
    }

    /// Record an entity that now exists under `id`.
    pub fn register(&mut self, entity: &NormalizedEntity, id: RefId) {
        match entity {
            NormalizedEntity::Family(f) => self.add_family(id, &f.name),
            other => self.add_code(other.entity_type(), &other.natural_key(), id),
        }
    }

    pub fn resolve_code(&self, kind: EntityType, code: &str) -> Option<RefId> {
        self.codes.get(&(kind, code.trim().to_string())).copied()
    }

    /// Exact case-insensitive match on the trimmed name. Several matches
    /// resolve to the lowest stored id and carry a warning.
    pub fn resolve_family(&self, raw: &str) -> FamilyResolution {
        let key = family_name_key(raw);
        let matches: Vec<RefId> = self
            .families
            .iter()
            .filter(|f| f.key == key)
            .map(|f| f.id)
            .collect();

        match matches.as_slice() {
            [] => FamilyResolution {
                link: FamilyLink::Create {
                    name: raw.trim().to_string(),
                },
                warning: None,
            },
            [only] => FamilyResolution {
                link: FamilyLink::Linked(*only),
                warning: None,
            },
            many => {
                let mut stored: Vec<i64> = many
                    .iter()
                    .filter_map(|id| match id {
                        RefId::Stored(n) => Some(*n),
                        RefId::Projected => None,
                    })
                    .collect();
                stored.sort_unstable();
                let chosen = stored.first().map(|n| RefId::Stored(*n)).unwrap_or(many[0]);
                let ids = stored
                    .iter()
                    .map(|n| n.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                let warning = match chosen {
                    RefId::Stored(n) => format!(
                        "family '{}' matched {} existing families (ids {}); linked to {}",
                        raw.trim(),
                        many.len(),
                        ids,
                        n
                    ),
                    RefId::Projected => format!(
                        "family '{}' matched {} families; linked to the first",
                        raw.trim(),
                        many.len()
                    ),
                };
                FamilyResolution {
                    link: FamilyLink::Linked(chosen),
                    warning: Some(warning),
                }
            }
        }
    }
}
