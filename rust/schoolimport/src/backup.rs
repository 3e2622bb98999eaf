use anyhow::{anyhow, bail, Context};
use serde_json::json;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::db::SqliteStore;
use crate::importer::sha256_hex;
use crate::store::ImportStore;

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/store.sqlite3";
pub const BUNDLE_FORMAT: &str = "schoolimport-store-v1";

#[derive(Debug, Clone)]
pub struct BackupSummary {
    pub bundle_format: String,
    pub db_bytes: u64,
    pub db_sha256: String,
}

/// Snapshot the store at `db_path` into a zip at `out_path`. The manifest
/// records the database checksum and its row counts at backup time.
pub fn export_store_bundle(db_path: &Path, out_path: &Path) -> anyhow::Result<BackupSummary> {
    if !db_path.is_file() {
        return Err(anyhow!(
            "store database not found: {}",
            db_path.to_string_lossy()
        ));
    }

    let counts = SqliteStore::open_read_only(db_path)
        .and_then(|store| store.counts())
        .with_context(|| format!("failed to read store {}", db_path.to_string_lossy()))?;
    let db = std::fs::read(db_path)
        .with_context(|| format!("failed to read database {}", db_path.to_string_lossy()))?;
    let db_sha256 = sha256_hex(&db);

    if let Some(parent) = out_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }
    let out_file = File::create(out_path)
        .with_context(|| format!("failed to create bundle {}", out_path.to_string_lossy()))?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let rows: serde_json::Map<String, serde_json::Value> = counts
        .into_iter()
        .map(|(table, n)| (table, n.into()))
        .collect();
    let manifest = json!({
        "format": BUNDLE_FORMAT,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "createdAt": chrono::Utc::now().to_rfc3339(),
        "sourceDatabase": db_path.to_string_lossy(),
        "dbSha256": db_sha256,
        "rows": rows,
    });
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(serde_json::to_vec_pretty(&manifest)?.as_slice())
        .context("failed to write manifest entry")?;

    zip.start_file(DB_ENTRY, opts)
        .context("failed to start database entry")?;
    zip.write_all(&db).context("failed to write database entry")?;
    zip.finish().context("failed to finalize bundle")?;

    Ok(BackupSummary {
        bundle_format: BUNDLE_FORMAT.to_string(),
        db_bytes: db.len() as u64,
        db_sha256,
    })
}

/// Manifest format of a bundle, after checking that the stored database
/// still matches the checksum in the manifest.
pub fn bundle_format(path: &Path) -> anyhow::Result<String> {
    let in_file = File::open(path)
        .with_context(|| format!("failed to open bundle {}", path.to_string_lossy()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;

    let mut manifest_text = String::new();
    archive
        .by_name(MANIFEST_ENTRY)
        .context("bundle missing manifest.json")?
        .read_to_string(&mut manifest_text)
        .context("failed to read manifest.json")?;
    let manifest: serde_json::Value =
        serde_json::from_str(&manifest_text).context("manifest.json is invalid JSON")?;

    let mut db = Vec::new();
    archive
        .by_name(DB_ENTRY)
        .with_context(|| format!("bundle missing {}", DB_ENTRY))?
        .read_to_end(&mut db)
        .context("failed to read database entry")?;
    let expected = manifest.get("dbSha256").and_then(|v| v.as_str());
    if expected != Some(sha256_hex(&db).as_str()) {
        bail!("database entry does not match manifest checksum");
    }

    manifest
        .get("format")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("manifest.json has no format"))
}
