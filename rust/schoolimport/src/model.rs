use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Every kind of entity the system knows about. This is the closed set that
/// change-log entity types are checked against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityType {
    Family,
    Student,
    Truck,
    ClassGroup,
    Activity,
    Billing,
    Attendance,
    Evaluation,
}

impl EntityType {
    pub const ALL: [EntityType; 8] = [
        EntityType::Family,
        EntityType::Student,
        EntityType::Truck,
        EntityType::ClassGroup,
        EntityType::Activity,
        EntityType::Billing,
        EntityType::Attendance,
        EntityType::Evaluation,
    ];

    pub const IMPORTED: [EntityType; 5] = [
        EntityType::Family,
        EntityType::ClassGroup,
        EntityType::Truck,
        EntityType::Student,
        EntityType::Activity,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Family => "Family",
            EntityType::Student => "Student",
            EntityType::Truck => "Truck",
            EntityType::ClassGroup => "ClassGroup",
            EntityType::Activity => "Activity",
            EntityType::Billing => "Billing",
            EntityType::Attendance => "Attendance",
            EntityType::Evaluation => "Evaluation",
        }
    }

    pub fn record_element(self) -> Option<&'static str> {
        match self {
            EntityType::Family => Some("family"),
            EntityType::Student => Some("student"),
            EntityType::Truck => Some("truck"),
            EntityType::ClassGroup => Some("classGroup"),
            EntityType::Activity => Some("activity"),
            _ => None,
        }
    }

    pub fn from_record_element(name: &str) -> Option<EntityType> {
        EntityType::IMPORTED
            .into_iter()
            .find(|t| t.record_element() == Some(name))
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exact match against the canonical names. No case folding: the change log
/// stores these strings verbatim.
impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// Reference to another entity as seen during a run. `Projected` entities
/// only exist in preview mode, where nothing receives a real id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefId {
    Stored(i64),
    Projected,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FamilyLink {
    Linked(RefId),
    /// No family matched; one is created with this name alongside the student.
    Create { name: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Family {
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
    pub auto_created: bool,
}

impl Family {
    pub fn auto_created(name: &str) -> Self {
        Family {
            name: name.trim().to_string(),
            phone: None,
            email: None,
            address: None,
            auto_created: true,
        }
    }
}

pub fn family_name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

#[derive(Clone, Debug, PartialEq)]
pub struct Student {
    pub code: String,
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: NaiveDate,
    pub enrolled_on: Option<NaiveDate>,
    pub family: Option<FamilyLink>,
    pub class_group: Option<RefId>,
    pub truck: Option<RefId>,
    pub monthly_fee: f64,
    pub sibling_count: i64,
    pub allergies: Option<String>,
    pub notes: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Truck {
    pub code: String,
    pub plate: String,
    pub driver: Option<String>,
    pub capacity: Option<i64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClassGroup {
    pub code: String,
    pub name: String,
    pub min_age: Option<i64>,
    pub max_age: Option<i64>,
    pub monthly_fee: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Activity {
    pub code: String,
    pub name: String,
    pub held_on: NaiveDate,
    pub cost: f64,
    pub class_group: Option<RefId>,
    pub description: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum NormalizedEntity {
    Family(Family),
    Student(Student),
    Truck(Truck),
    ClassGroup(ClassGroup),
    Activity(Activity),
}

impl NormalizedEntity {
    pub fn entity_type(&self) -> EntityType {
        match self {
            NormalizedEntity::Family(_) => EntityType::Family,
            NormalizedEntity::Student(_) => EntityType::Student,
            NormalizedEntity::Truck(_) => EntityType::Truck,
            NormalizedEntity::ClassGroup(_) => EntityType::ClassGroup,
            NormalizedEntity::Activity(_) => EntityType::Activity,
        }
    }

    pub fn natural_key(&self) -> String {
        match self {
            NormalizedEntity::Family(f) => family_name_key(&f.name),
            NormalizedEntity::Student(s) => s.code.clone(),
            NormalizedEntity::Truck(t) => t.code.clone(),
            NormalizedEntity::ClassGroup(c) => c.code.clone(),
            NormalizedEntity::Activity(a) => a.code.clone(),
        }
    }

    /// Field values as written to the change log when the row is created.
    /// Links only carry an id once they point at a stored row.
    pub fn audit_fields(&self) -> Vec<(&'static str, Option<String>)> {
        match self {
            NormalizedEntity::Family(f) => vec![
                ("name", Some(f.name.clone())),
                ("phone", f.phone.clone()),
                ("email", f.email.clone()),
                ("address", f.address.clone()),
                ("autoCreated", Some(f.auto_created.to_string())),
            ],
            NormalizedEntity::Student(s) => vec![
                ("code", Some(s.code.clone())),
                ("firstName", Some(s.first_name.clone())),
                ("lastName", Some(s.last_name.clone())),
                ("dateOfBirth", Some(s.date_of_birth.to_string())),
                ("enrolledOn", s.enrolled_on.map(|d| d.to_string())),
                (
                    "familyId",
                    match &s.family {
                        Some(FamilyLink::Linked(id)) => stored_id(Some(*id)),
                        _ => None,
                    },
                ),
                ("classGroupId", stored_id(s.class_group)),
                ("truckId", stored_id(s.truck)),
                ("monthlyFee", Some(s.monthly_fee.to_string())),
                ("siblingCount", Some(s.sibling_count.to_string())),
                ("allergies", s.allergies.clone()),
                ("notes", s.notes.clone()),
            ],
            NormalizedEntity::Truck(t) => vec![
                ("code", Some(t.code.clone())),
                ("plate", Some(t.plate.clone())),
                ("driver", t.driver.clone()),
                ("capacity", t.capacity.map(|c| c.to_string())),
            ],
            NormalizedEntity::ClassGroup(c) => vec![
                ("code", Some(c.code.clone())),
                ("name", Some(c.name.clone())),
                ("minAge", c.min_age.map(|v| v.to_string())),
                ("maxAge", c.max_age.map(|v| v.to_string())),
                ("monthlyFee", Some(c.monthly_fee.to_string())),
            ],
            NormalizedEntity::Activity(a) => vec![
                ("code", Some(a.code.clone())),
                ("name", Some(a.name.clone())),
                ("date", Some(a.held_on.to_string())),
                ("cost", Some(a.cost.to_string())),
                ("classGroupId", stored_id(a.class_group)),
                ("description", a.description.clone()),
            ],
        }
    }
}

fn stored_id(id: Option<RefId>) -> Option<String> {
    match id {
        Some(RefId::Stored(n)) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum OutcomeStatus {
    Imported,
    Skipped,
    Error,
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OutcomeStatus::Imported => "Imported",
            OutcomeStatus::Skipped => "Skipped",
            OutcomeStatus::Error => "Error",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOutcome {
    pub kind: String,
    pub natural_key: String,
    pub line: u32,
    pub status: OutcomeStatus,
    pub reason: Option<String>,
    pub warnings: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub run_id: Uuid,
    pub source_path: PathBuf,
    pub source_sha256: String,
    pub preview: bool,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub imported_count: usize,
    pub skipped_count: usize,
    pub error_count: usize,
    pub audit_log_path: Option<PathBuf>,
    pub summary_path: Option<PathBuf>,
    #[serde(skip)]
    pub outcomes: Vec<ImportOutcome>,
}

impl ImportSummary {
    pub fn total(&self) -> usize {
        self.imported_count + self.skipped_count + self.error_count
    }

    pub fn outcomes_with(&self, status: OutcomeStatus) -> impl Iterator<Item = &ImportOutcome> {
        self.outcomes.iter().filter(move |o| o.status == status)
    }
}
