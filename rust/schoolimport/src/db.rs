use chrono::Utc;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::Path;
use tracing::{debug, warn};

use crate::audit::AuditLogEntry;
use crate::error::StoreError;
use crate::model::{EntityType, FamilyLink, ImportSummary, NormalizedEntity, RefId};
use crate::reconcile::Directory;
use crate::store::{ImportStore, StoreWriter};

pub const DEFAULT_DB_FILE: &str = "schoolimport.sqlite3";

fn table_for(kind: EntityType) -> Option<&'static str> {
    match kind {
        EntityType::Family => Some("families"),
        EntityType::Student => Some("students"),
        EntityType::Truck => Some("trucks"),
        EntityType::ClassGroup => Some("class_groups"),
        EntityType::Activity => Some("activities"),
        _ => None,
    }
}

pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS families(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            name_key TEXT NOT NULL,
            phone TEXT,
            email TEXT,
            address TEXT,
            auto_created INTEGER NOT NULL DEFAULT 0,
            created_at TEXT
        )",
        [],
    )?;
    ensure_families_auto_created(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_families_name_key ON families(name_key)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_groups(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            min_age INTEGER,
            max_age INTEGER,
            monthly_fee REAL NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS trucks(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            code TEXT NOT NULL UNIQUE,
            plate TEXT NOT NULL,
            driver TEXT,
            capacity INTEGER
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            code TEXT NOT NULL UNIQUE,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            date_of_birth TEXT NOT NULL,
            enrolled_on TEXT,
            family_id INTEGER,
            class_group_id INTEGER,
            truck_id INTEGER,
            monthly_fee REAL NOT NULL DEFAULT 0,
            sibling_count INTEGER NOT NULL DEFAULT 0,
            allergies TEXT,
            notes TEXT,
            FOREIGN KEY(family_id) REFERENCES families(id),
            FOREIGN KEY(class_group_id) REFERENCES class_groups(id),
            FOREIGN KEY(truck_id) REFERENCES trucks(id)
        )",
        [],
    )?;
    ensure_students_sibling_count(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_family ON students(family_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS activities(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            held_on TEXT NOT NULL,
            cost REAL NOT NULL DEFAULT 0,
            class_group_id INTEGER,
            description TEXT,
            FOREIGN KEY(class_group_id) REFERENCES class_groups(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS audit_log(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            entity_id INTEGER NOT NULL,
            field TEXT NOT NULL,
            old_value TEXT,
            new_value TEXT,
            changed_by TEXT NOT NULL,
            changed_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_log_entity ON audit_log(entity_type, entity_id)",
        [],
    )?;
    conn.execute(
        "CREATE TRIGGER IF NOT EXISTS audit_log_no_update BEFORE UPDATE ON audit_log
         BEGIN SELECT RAISE(ABORT, 'audit_log is append-only'); END",
        [],
    )?;
    conn.execute(
        "CREATE TRIGGER IF NOT EXISTS audit_log_no_delete BEFORE DELETE ON audit_log
         BEGIN SELECT RAISE(ABORT, 'audit_log is append-only'); END",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS import_runs(
            id TEXT PRIMARY KEY,
            source_path TEXT NOT NULL,
            source_sha256 TEXT NOT NULL,
            started_at TEXT NOT NULL,
            completed_at TEXT NOT NULL,
            imported INTEGER NOT NULL,
            skipped INTEGER NOT NULL,
            errors INTEGER NOT NULL,
            cancelled INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    Ok(())
}

// Stores created by the admin console before auto-creation existed lack the flag.
fn ensure_families_auto_created(conn: &Connection) -> rusqlite::Result<()> {
    if table_has_column(conn, "families", "auto_created")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE families ADD COLUMN auto_created INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
    Ok(())
}

fn ensure_students_sibling_count(conn: &Connection) -> rusqlite::Result<()> {
    if table_has_column(conn, "students", "sibling_count")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE students ADD COLUMN sibling_count INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?",
            [table],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<SqliteStore, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        init_schema(&conn)?;
        debug!("opened store {}", path.to_string_lossy());
        Ok(SqliteStore { conn })
    }

    /// Open an existing store without creating or upgrading anything.
    /// Tables the file does not have yet read as empty.
    pub fn open_read_only(path: &Path) -> Result<SqliteStore, StoreError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        debug!("opened store {} read-only", path.to_string_lossy());
        Ok(SqliteStore { conn })
    }

    pub fn open_in_memory() -> Result<SqliteStore, StoreError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(SqliteStore { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn row_count(&self, table: &str) -> rusqlite::Result<i64> {
        if !table_exists(&self.conn, table)? {
            return Ok(0);
        }
        self.conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
    }
}

struct SqliteWriter<'a> {
    conn: &'a Connection,
}

fn stored(id: Option<RefId>, field: &'static str) -> Result<Option<i64>, StoreError> {
    match id {
        None => Ok(None),
        Some(RefId::Stored(n)) => Ok(Some(n)),
        Some(RefId::Projected) => Err(StoreError::UnresolvedReference { field }),
    }
}

impl StoreWriter for SqliteWriter<'_> {
    fn insert(&mut self, entity: &NormalizedEntity) -> Result<i64, StoreError> {
        match entity {
            NormalizedEntity::Family(f) => {
                self.conn.execute(
                    "INSERT INTO families(name, name_key, phone, email, address, auto_created, created_at)
                     VALUES(?, ?, ?, ?, ?, ?, ?)",
                    params![
                        f.name,
                        entity.natural_key(),
                        f.phone,
                        f.email,
                        f.address,
                        f.auto_created,
                        Utc::now().to_rfc3339(),
                    ],
                )?;
            }
            NormalizedEntity::Student(s) => {
                let family_id = match &s.family {
                    None => None,
                    Some(FamilyLink::Linked(id)) => stored(Some(*id), "family")?,
                    Some(FamilyLink::Create { .. }) => {
                        return Err(StoreError::UnresolvedReference { field: "family" })
                    }
                };
                self.conn.execute(
                    "INSERT INTO students(code, first_name, last_name, date_of_birth, enrolled_on,
                                          family_id, class_group_id, truck_id, monthly_fee,
                                          sibling_count, allergies, notes)
                     VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    params![
                        s.code,
                        s.first_name,
                        s.last_name,
                        s.date_of_birth.to_string(),
                        s.enrolled_on.map(|d| d.to_string()),
                        family_id,
                        stored(s.class_group, "classGroup")?,
                        stored(s.truck, "truck")?,
                        s.monthly_fee,
                        s.sibling_count,
                        s.allergies,
                        s.notes,
                    ],
                )?;
            }
            NormalizedEntity::Truck(t) => {
                self.conn.execute(
                    "INSERT INTO trucks(code, plate, driver, capacity) VALUES(?, ?, ?, ?)",
                    params![t.code, t.plate, t.driver, t.capacity],
                )?;
            }
            NormalizedEntity::ClassGroup(c) => {
                self.conn.execute(
                    "INSERT INTO class_groups(code, name, min_age, max_age, monthly_fee)
                     VALUES(?, ?, ?, ?, ?)",
                    params![c.code, c.name, c.min_age, c.max_age, c.monthly_fee],
                )?;
            }
            NormalizedEntity::Activity(a) => {
                self.conn.execute(
                    "INSERT INTO activities(code, name, held_on, cost, class_group_id, description)
                     VALUES(?, ?, ?, ?, ?, ?)",
                    params![
                        a.code,
                        a.name,
                        a.held_on.to_string(),
                        a.cost,
                        stored(a.class_group, "classGroup")?,
                        a.description,
                    ],
                )?;
            }
        }
        Ok(self.conn.last_insert_rowid())
    }

    fn append_audit(&mut self, entries: &[AuditLogEntry]) -> Result<(), StoreError> {
        let mut ins = self.conn.prepare(
            "INSERT INTO audit_log(entity_type, entity_id, field, old_value, new_value, changed_by, changed_at)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
        )?;
        for e in entries {
            ins.execute(params![
                e.entity_type.as_str(),
                e.entity_id,
                e.field,
                e.old_value,
                e.new_value,
                e.changed_by,
                e.changed_at.to_rfc3339(),
            ])?;
        }
        Ok(())
    }
}

impl ImportStore for SqliteStore {
    fn exists(&self, kind: EntityType, natural_key: &str) -> Result<bool, StoreError> {
        let Some(table) = table_for(kind) else {
            return Ok(false);
        };
        let column = if kind == EntityType::Family {
            "name_key"
        } else {
            "code"
        };
        if !table_exists(&self.conn, table)? {
            return Ok(false);
        }
        let sql = format!("SELECT 1 FROM {table} WHERE {column} = ? LIMIT 1");
        let found = self
            .conn
            .query_row(&sql, [natural_key], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    fn load_directory(&self) -> Result<Directory, StoreError> {
        let mut dir = Directory::new();
        if table_exists(&self.conn, "families")? {
            let mut stmt = self.conn.prepare("SELECT id, name FROM families ORDER BY id")?;
            let families = stmt
                .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            for (id, name) in families {
                dir.add_family(RefId::Stored(id), &name);
            }
        }

        for kind in [EntityType::ClassGroup, EntityType::Truck] {
            let Some(table) = table_for(kind) else {
                continue;
            };
            if !table_exists(&self.conn, table)? {
                continue;
            }
            let mut stmt = self
                .conn
                .prepare(&format!("SELECT id, code FROM {table} ORDER BY id"))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            for (id, code) in rows {
                dir.add_code(kind, &code, RefId::Stored(id));
            }
        }
        Ok(dir)
    }

    fn transaction<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn StoreWriter) -> Result<T, E>,
        E: From<StoreError>,
    {
        let tx = self.conn.transaction().map_err(StoreError::from)?;
        let result = {
            let mut writer = SqliteWriter { conn: &tx };
            f(&mut writer)
        };
        match result {
            Ok(v) => {
                tx.commit().map_err(StoreError::from)?;
                Ok(v)
            }
            Err(e) => {
                if let Err(rb) = tx.rollback() {
                    warn!("rollback failed: {rb}");
                }
                Err(e)
            }
        }
    }

    fn record_run(&mut self, summary: &ImportSummary) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO import_runs(id, source_path, source_sha256, started_at, completed_at,
                                     imported, skipped, errors, cancelled)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                summary.run_id.to_string(),
                summary.source_path.to_string_lossy(),
                summary.source_sha256,
                summary.started_at.to_rfc3339(),
                summary.completed_at.to_rfc3339(),
                summary.imported_count as i64,
                summary.skipped_count as i64,
                summary.error_count as i64,
                summary.cancelled,
            ],
        )?;
        Ok(())
    }

    fn counts(&self) -> Result<Vec<(String, i64)>, StoreError> {
        let mut out = Vec::new();
        for kind in EntityType::IMPORTED {
            if let Some(table) = table_for(kind) {
                out.push((kind.to_string(), self.row_count(table)?));
            }
        }
        for table in ["audit_log", "import_runs"] {
            out.push((table.to_string(), self.row_count(table)?));
        }
        Ok(out)
    }

    fn sample(&self, n: usize) -> Result<Vec<(EntityType, serde_json::Value)>, StoreError> {
        let mut out = Vec::new();
        for kind in EntityType::IMPORTED {
            let Some(table) = table_for(kind) else {
                continue;
            };
            if !table_exists(&self.conn, table)? {
                continue;
            }
            let mut stmt = self
                .conn
                .prepare(&format!("SELECT * FROM {table} ORDER BY id LIMIT ?"))?;
            let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
            let mut rows = stmt.query([n as i64])?;
            while let Some(row) = rows.next()? {
                let mut obj = serde_json::Map::new();
                for (i, col) in columns.iter().enumerate() {
                    let v = match row.get_ref(i)? {
                        ValueRef::Null => serde_json::Value::Null,
                        ValueRef::Integer(n) => serde_json::Value::from(n),
                        ValueRef::Real(f) => serde_json::Value::from(f),
                        ValueRef::Text(t) => {
                            serde_json::Value::from(String::from_utf8_lossy(t).to_string())
                        }
                        ValueRef::Blob(b) => serde_json::Value::from(format!("<{} bytes>", b.len())),
                    };
                    obj.insert(col.clone(), v);
                }
                out.push((kind, serde_json::Value::Object(obj)));
            }
        }
        Ok(out)
    }
}
