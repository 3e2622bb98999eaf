use chrono::NaiveDate;

use crate::config::ImportConfig;
use crate::error::MapError;
use crate::legacy::LegacyRecord;
use crate::model::{Activity, ClassGroup, EntityType, Family, NormalizedEntity, RefId, Student, Truck};
use crate::reconcile::Directory;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NumericDefault {
    Zero,
    Null,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldPolicy {
    RequiredText,
    OptionalText,
    RequiredDate,
    OptionalDate,
    Decimal(NumericDefault),
    Integer(NumericDefault),
}

use FieldPolicy::*;
use NumericDefault::{Null, Zero};

pub const FAMILY_FIELDS: &[(&str, FieldPolicy)] = &[
    ("name", RequiredText),
    ("phone", OptionalText),
    ("email", OptionalText),
    ("address", OptionalText),
];

pub const STUDENT_FIELDS: &[(&str, FieldPolicy)] = &[
    ("code", RequiredText),
    ("firstName", RequiredText),
    ("lastName", RequiredText),
    ("dateOfBirth", RequiredDate),
    ("enrolledOn", OptionalDate),
    ("family", OptionalText),
    ("classGroup", OptionalText),
    ("truck", OptionalText),
    ("monthlyFee", Decimal(Zero)),
    ("siblingCount", Integer(Zero)),
    ("allergies", OptionalText),
    ("notes", OptionalText),
];

pub const TRUCK_FIELDS: &[(&str, FieldPolicy)] = &[
    ("code", RequiredText),
    ("plate", RequiredText),
    ("driver", OptionalText),
    ("capacity", Integer(Null)),
];

pub const CLASS_GROUP_FIELDS: &[(&str, FieldPolicy)] = &[
    ("code", RequiredText),
    ("name", RequiredText),
    ("minAge", Integer(Null)),
    ("maxAge", Integer(Null)),
    ("monthlyFee", Decimal(Zero)),
];

pub const ACTIVITY_FIELDS: &[(&str, FieldPolicy)] = &[
    ("code", RequiredText),
    ("name", RequiredText),
    ("date", RequiredDate),
    ("cost", Decimal(Zero)),
    ("classGroup", OptionalText),
    ("description", OptionalText),
];

pub fn field_table(kind: EntityType) -> &'static [(&'static str, FieldPolicy)] {
    match kind {
        EntityType::Family => FAMILY_FIELDS,
        EntityType::Student => STUDENT_FIELDS,
        EntityType::Truck => TRUCK_FIELDS,
        EntityType::ClassGroup => CLASS_GROUP_FIELDS,
        EntityType::Activity => ACTIVITY_FIELDS,
        _ => &[],
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Value {
    Absent,
    Text(String),
    Date(NaiveDate),
    Decimal(f64),
    Integer(i64),
}

struct Coerced(Vec<(&'static str, Value)>);

impl Coerced {
    fn value(&self, field: &'static str) -> &Value {
        self.0
            .iter()
            .find(|(name, _)| *name == field)
            .map(|(_, v)| v)
            .unwrap_or(&Value::Absent)
    }

    fn text(&self, field: &'static str) -> Option<String> {
        match self.value(field) {
            Value::Text(s) => Some(s.clone()),
            _ => None,
        }
    }

    fn required_text(&self, field: &'static str) -> Result<String, MapError> {
        self.text(field).ok_or(MapError::MissingField { field })
    }

    fn date(&self, field: &'static str) -> Option<NaiveDate> {
        match self.value(field) {
            Value::Date(d) => Some(*d),
            _ => None,
        }
    }

    fn required_date(&self, field: &'static str) -> Result<NaiveDate, MapError> {
        self.date(field).ok_or(MapError::MissingField { field })
    }

    fn decimal(&self, field: &'static str) -> Option<f64> {
        match self.value(field) {
            Value::Decimal(n) => Some(*n),
            _ => None,
        }
    }

    fn integer(&self, field: &'static str) -> Option<i64> {
        match self.value(field) {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }
}

fn non_blank(s: &str) -> Option<&str> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t)
    }
}

// Some exports use a decimal comma. A comma followed by exactly three digits
// may be a thousands separator instead, so that form is refused.
fn parse_decimal(s: &str) -> Option<f64> {
    let normalized = match s.split_once(',') {
        None => s.to_string(),
        Some((whole, frac)) => {
            let ambiguous = frac.len() == 3 && frac.bytes().all(|b| b.is_ascii_digit());
            if s.contains('.') || frac.contains(',') || ambiguous {
                return None;
            }
            format!("{whole}.{frac}")
        }
    };
    normalized.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Apply the field table to a record. Fields are checked in table order, so
/// the first failing field is reported deterministically.
fn coerce(
    record: &LegacyRecord,
    table: &'static [(&'static str, FieldPolicy)],
    date_format: &str,
) -> Result<Coerced, MapError> {
    let mut out = Vec::with_capacity(table.len());
    for &(field, policy) in table {
        let raw = record.get(field).and_then(non_blank);
        let value = match (policy, raw) {
            (RequiredText | RequiredDate, None) => return Err(MapError::MissingField { field }),
            (Decimal(Zero), None) => Value::Decimal(0.0),
            (Integer(Zero), None) => Value::Integer(0),
            (_, None) => Value::Absent,
            (RequiredText | OptionalText, Some(v)) => Value::Text(v.to_string()),
            (RequiredDate | OptionalDate, Some(v)) => NaiveDate::parse_from_str(v, date_format)
                .map(Value::Date)
                .map_err(|_| MapError::InvalidDate {
                    field,
                    value: v.to_string(),
                    format: date_format.to_string(),
                })?,
            (Decimal(_), Some(v)) => parse_decimal(v)
                .map(Value::Decimal)
                .ok_or_else(|| MapError::InvalidNumber {
                    field,
                    value: v.to_string(),
                })?,
            (Integer(_), Some(v)) => v
                .strip_prefix('+')
                .unwrap_or(v)
                .parse::<i64>()
                .map(Value::Integer)
                .map_err(|_| MapError::InvalidNumber {
                    field,
                    value: v.to_string(),
                })?,
        };
        out.push((field, value));
    }
    Ok(Coerced(out))
}

fn not_negative(field: &'static str, n: f64) -> Result<(), MapError> {
    if n < 0.0 {
        return Err(MapError::Integrity {
            field,
            reason: format!("must not be negative (got {n})"),
        });
    }
    Ok(())
}

/// A mapped entity plus any non-fatal notes about how it was resolved.
#[derive(Clone, Debug, PartialEq)]
pub struct Mapped {
    pub entity: NormalizedEntity,
    pub warnings: Vec<String>,
}

pub struct RecordMapper<'a> {
    config: &'a ImportConfig,
}

impl<'a> RecordMapper<'a> {
    pub fn new(config: &'a ImportConfig) -> Self {
        RecordMapper { config }
    }

    pub fn map(&self, record: &LegacyRecord, directory: &Directory) -> Result<Mapped, MapError> {
        let kind = EntityType::from_record_element(&record.kind)
            .ok_or_else(|| MapError::UnknownKind(record.kind.clone()))?;
        let values = coerce(record, field_table(kind), &self.config.date_format)?;
        let mut warnings = Vec::new();

        let entity = match kind {
            EntityType::Family => NormalizedEntity::Family(Family {
                name: values.required_text("name")?,
                phone: values.text("phone"),
                email: values.text("email"),
                address: values.text("address"),
                auto_created: false,
            }),
            EntityType::Student => {
                let monthly_fee = values.decimal("monthlyFee").unwrap_or(0.0);
                not_negative("monthlyFee", monthly_fee)?;
                let sibling_count = values.integer("siblingCount").unwrap_or(0);
                not_negative("siblingCount", sibling_count as f64)?;
                let date_of_birth = values.required_date("dateOfBirth")?;
                let enrolled_on = values.date("enrolledOn");
                if enrolled_on.is_some_and(|d| d < date_of_birth) {
                    return Err(MapError::Integrity {
                        field: "enrolledOn",
                        reason: "is before dateOfBirth".into(),
                    });
                }

                let family = values.text("family").map(|name| {
                    let resolution = directory.resolve_family(&name);
                    if let Some(w) = resolution.warning {
                        warnings.push(w);
                    }
                    resolution.link
                });
                let class_group = resolve_code(
                    directory,
                    EntityType::ClassGroup,
                    "classGroup",
                    values.text("classGroup"),
                    &mut warnings,
                );
                let truck = resolve_code(
                    directory,
                    EntityType::Truck,
                    "truck",
                    values.text("truck"),
                    &mut warnings,
                );

                NormalizedEntity::Student(Student {
                    code: values.required_text("code")?,
                    first_name: values.required_text("firstName")?,
                    last_name: values.required_text("lastName")?,
                    date_of_birth,
                    enrolled_on,
                    family,
                    class_group,
                    truck,
                    monthly_fee,
                    sibling_count,
                    allergies: values.text("allergies"),
                    notes: values.text("notes"),
                })
            }
            EntityType::Truck => {
                let capacity = values.integer("capacity");
                if let Some(c) = capacity {
                    not_negative("capacity", c as f64)?;
                }
                NormalizedEntity::Truck(Truck {
                    code: values.required_text("code")?,
                    plate: values.required_text("plate")?,
                    driver: values.text("driver"),
                    capacity,
                })
            }
            EntityType::ClassGroup => {
                let min_age = values.integer("minAge");
                let max_age = values.integer("maxAge");
                if let (Some(lo), Some(hi)) = (min_age, max_age) {
                    if lo > hi {
                        return Err(MapError::Integrity {
                            field: "minAge",
                            reason: format!("({lo}) is greater than maxAge ({hi})"),
                        });
                    }
                }
                let monthly_fee = values.decimal("monthlyFee").unwrap_or(0.0);
                not_negative("monthlyFee", monthly_fee)?;
                NormalizedEntity::ClassGroup(ClassGroup {
                    code: values.required_text("code")?,
                    name: values.required_text("name")?,
                    min_age,
                    max_age,
                    monthly_fee,
                })
            }
            EntityType::Activity => {
                let cost = values.decimal("cost").unwrap_or(0.0);
                not_negative("cost", cost)?;
                let class_group = resolve_code(
                    directory,
                    EntityType::ClassGroup,
                    "classGroup",
                    values.text("classGroup"),
                    &mut warnings,
                );
                NormalizedEntity::Activity(Activity {
                    code: values.required_text("code")?,
                    name: values.required_text("name")?,
                    held_on: values.required_date("date")?,
                    cost,
                    class_group,
                    description: values.text("description"),
                })
            }
            other => return Err(MapError::UnknownKind(other.to_string())),
        };

        Ok(Mapped { entity, warnings })
    }
}

fn resolve_code(
    directory: &Directory,
    kind: EntityType,
    field: &str,
    code: Option<String>,
    warnings: &mut Vec<String>,
) -> Option<RefId> {
    let code = code?;
    let found = directory.resolve_code(kind, &code);
    if found.is_none() {
        warnings.push(format!("{field} '{code}' does not match any {kind}; left unlinked"));
    }
    found
}
