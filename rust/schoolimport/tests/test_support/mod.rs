#![allow(dead_code)]

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub const SCHEMA: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
  <xs:element name="legacyExport" type="ExportType"/>

  <xs:complexType name="ExportType">
    <xs:sequence>
      <xs:element name="families" type="FamiliesType" minOccurs="0"/>
      <xs:element name="classGroups" type="ClassGroupsType" minOccurs="0"/>
      <xs:element name="trucks" type="TrucksType" minOccurs="0"/>
      <xs:element name="students" type="StudentsType" minOccurs="0"/>
      <xs:element name="activities" type="ActivitiesType" minOccurs="0"/>
    </xs:sequence>
    <xs:attribute name="exportedOn" type="xs:string"/>
  </xs:complexType>

  <xs:complexType name="FamiliesType">
    <xs:sequence>
      <xs:element name="family" type="FamilyType" minOccurs="0" maxOccurs="unbounded"/>
    </xs:sequence>
  </xs:complexType>
  <xs:complexType name="FamilyType">
    <xs:sequence>
      <xs:element name="name" type="xs:string"/>
      <xs:element name="phone" type="xs:string" minOccurs="0"/>
      <xs:element name="email" type="xs:string" minOccurs="0"/>
      <xs:element name="address" type="xs:string" minOccurs="0"/>
    </xs:sequence>
  </xs:complexType>

  <xs:complexType name="ClassGroupsType">
    <xs:sequence>
      <xs:element name="classGroup" type="ClassGroupType" minOccurs="0" maxOccurs="unbounded"/>
    </xs:sequence>
  </xs:complexType>
  <xs:complexType name="ClassGroupType">
    <xs:sequence>
      <xs:element name="code" type="xs:string"/>
      <xs:element name="name" type="xs:string"/>
      <xs:element name="minAge" type="xs:string" minOccurs="0"/>
      <xs:element name="maxAge" type="xs:string" minOccurs="0"/>
      <xs:element name="monthlyFee" type="xs:string" minOccurs="0"/>
    </xs:sequence>
  </xs:complexType>

  <xs:complexType name="TrucksType">
    <xs:sequence>
      <xs:element name="truck" type="TruckType" minOccurs="0" maxOccurs="unbounded"/>
    </xs:sequence>
  </xs:complexType>
  <xs:complexType name="TruckType">
    <xs:sequence>
      <xs:element name="code" type="xs:string"/>
      <xs:element name="plate" type="xs:string"/>
      <xs:element name="driver" type="xs:string" minOccurs="0"/>
      <xs:element name="capacity" type="xs:string" minOccurs="0"/>
    </xs:sequence>
  </xs:complexType>

  <xs:complexType name="StudentsType">
    <xs:sequence>
      <xs:element name="student" type="StudentType" minOccurs="0" maxOccurs="unbounded"/>
    </xs:sequence>
  </xs:complexType>
  <xs:complexType name="StudentType">
    <xs:sequence>
      <xs:element name="code" type="xs:string"/>
      <xs:element name="firstName" type="xs:string"/>
      <xs:element name="lastName" type="xs:string"/>
      <xs:element name="dateOfBirth" type="xs:string"/>
      <xs:element name="enrolledOn" type="xs:string" minOccurs="0"/>
      <xs:element name="family" type="xs:string" minOccurs="0"/>
      <xs:element name="classGroup" type="xs:string" minOccurs="0"/>
      <xs:element name="truck" type="xs:string" minOccurs="0"/>
      <xs:element name="monthlyFee" type="xs:string" minOccurs="0"/>
      <xs:element name="siblingCount" type="xs:string" minOccurs="0"/>
      <xs:element name="allergies" type="xs:string" minOccurs="0"/>
      <xs:element name="notes" type="xs:string" minOccurs="0"/>
    </xs:sequence>
  </xs:complexType>

  <xs:complexType name="ActivitiesType">
    <xs:sequence>
      <xs:element name="activity" type="ActivityType" minOccurs="0" maxOccurs="unbounded"/>
    </xs:sequence>
  </xs:complexType>
  <xs:complexType name="ActivityType">
    <xs:sequence>
      <xs:element name="code" type="xs:string"/>
      <xs:element name="name" type="xs:string"/>
      <xs:element name="date" type="xs:string"/>
      <xs:element name="cost" type="xs:string" minOccurs="0"/>
      <xs:element name="classGroup" type="xs:string" minOccurs="0"/>
      <xs:element name="description" type="xs:string" minOccurs="0"/>
    </xs:sequence>
  </xs:complexType>
</xs:schema>
"#;

pub fn student(code: &str, last_name: &str, dob: &str, family: Option<&str>) -> String {
    let family = family
        .map(|f| format!("<family>{f}</family>"))
        .unwrap_or_default();
    format!(
        "<student><code>{code}</code><firstName>Kid {code}</firstName><lastName>{last_name}</lastName><dateOfBirth>{dob}</dateOfBirth>{family}</student>"
    )
}

pub fn family(name: &str) -> String {
    format!("<family><name>{name}</name></family>")
}

pub fn class_group(code: &str, name: &str) -> String {
    format!("<classGroup><code>{code}</code><name>{name}</name></classGroup>")
}

pub fn truck(code: &str, plate: &str) -> String {
    format!("<truck><code>{code}</code><plate>{plate}</plate></truck>")
}

pub fn activity(code: &str, date: &str, cost: Option<&str>, class_group: Option<&str>) -> String {
    let cost = cost.map(|c| format!("<cost>{c}</cost>")).unwrap_or_default();
    let group = class_group
        .map(|g| format!("<classGroup>{g}</classGroup>"))
        .unwrap_or_default();
    format!("<activity><code>{code}</code><name>Outing {code}</name><date>{date}</date>{cost}{group}</activity>")
}

/// Legacy export with the given sections, each `(section, records)`.
pub fn export(sections: &[(&str, Vec<String>)]) -> String {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<legacyExport>\n");
    for (section, records) in sections {
        xml.push_str(&format!("  <{section}>\n"));
        for r in records {
            xml.push_str("    ");
            xml.push_str(r);
            xml.push('\n');
        }
        xml.push_str(&format!("  </{section}>\n"));
    }
    xml.push_str("</legacyExport>\n");
    xml
}

pub struct Fixture {
    pub dir: PathBuf,
    pub source: PathBuf,
    pub schema: PathBuf,
    pub db: PathBuf,
}

impl Fixture {
    pub fn new(prefix: &str, source_xml: &str) -> Fixture {
        let dir = temp_dir(prefix);
        let source = dir.join("export.xml");
        let schema = dir.join("export.xsd");
        std::fs::write(&source, source_xml).expect("write source");
        std::fs::write(&schema, SCHEMA).expect("write schema");
        Fixture {
            db: dir.join("store.sqlite3"),
            dir,
            source,
            schema,
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

pub fn count_rows(db: &Path, table: &str) -> i64 {
    let conn = Connection::open(db).expect("open db");
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
        .expect("count rows")
}

pub fn run_cli(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_schoolimport"))
        .args(args)
        .env_remove("SCHOOLIMPORT_DB")
        .env_remove("RUST_LOG")
        .output()
        .expect("run schoolimport")
}

pub fn stdout_of(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).to_string()
}

pub fn stderr_of(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).to_string()
}
