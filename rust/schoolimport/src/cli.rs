use anyhow::{anyhow, Context};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::backup;
use crate::config::ImportConfig;
use crate::db::{SqliteStore, DEFAULT_DB_FILE};
use crate::error::ImportError;
use crate::importer::{ImportRequest, Importer};
use crate::model::ImportSummary;
use crate::store::ImportStore;

/// Import a legacy XML export into the school store.
///
/// The source document is validated against the XSD before anything is
/// written. Each record is then imported in its own transaction; records
/// already present (by code, or by family name) are skipped.
#[derive(Debug, Clone, Parser)]
#[command(name = "schoolimport", version, about = "Import legacy XML exports into the school store")]
pub struct Args {
    /// Legacy XML export to import
    #[arg(
        value_name = "SOURCE",
        required_unless_present_any = ["count", "sample"]
    )]
    pub source: Option<PathBuf>,

    #[arg(
        long = "schema",
        value_name = "PATH",
        required_unless_present_any = ["count", "sample"],
        help = "XSD the source must validate against"
    )]
    pub schema: Option<PathBuf>,

    #[arg(
        long = "db",
        value_name = "PATH",
        env = "SCHOOLIMPORT_DB",
        default_value = DEFAULT_DB_FILE,
        help = "SQLite store to import into"
    )]
    pub db: PathBuf,

    #[arg(
        long = "audit",
        value_name = "PATH",
        help = "Append one line per record outcome to this file"
    )]
    pub audit: Option<PathBuf>,

    #[arg(
        long = "summary",
        value_name = "PATH",
        help = "Write a plain-text run summary to this file"
    )]
    pub summary: Option<PathBuf>,

    #[arg(long = "preview", help = "Validate, map and check every record but write nothing")]
    pub preview: bool,

    #[arg(
        long = "count",
        conflicts_with = "sample",
        help = "Print persisted record counts and exit"
    )]
    pub count: bool,

    #[arg(
        long = "sample",
        value_name = "N",
        help = "Print the first N persisted records of each kind and exit"
    )]
    pub sample: Option<usize>,

    #[arg(long = "config", value_name = "PATH", help = "JSON import configuration")]
    pub config: Option<PathBuf>,

    #[arg(
        long = "backup",
        value_name = "PATH",
        help = "Zip the existing store to PATH before importing"
    )]
    pub backup: Option<PathBuf>,

    #[arg(long = "json", help = "Print results as JSON")]
    pub json: bool,

    #[arg(
        short = 'v',
        long = "verbose",
        action = clap::ArgAction::Count,
        help = "Increase logging verbosity (-v: info, -vv: debug, -vvv: trace)"
    )]
    pub verbose: u8,

    #[arg(
        short = 'q',
        long = "quiet",
        help = "Suppress output except errors",
        conflicts_with = "verbose"
    )]
    pub quiet: bool,
}

impl Args {
    pub fn get_log_level(&self) -> &'static str {
        if self.quiet {
            "error"
        } else {
            match self.verbose {
                0 => "warn",
                1 => "info",
                2 => "debug",
                _ => "trace",
            }
        }
    }
}

pub fn setup_logging(args: &Args) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let log_level = args.get_log_level();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("schoolimport={}", log_level)));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_level(true)
                .with_writer(std::io::stderr),
        )
        .try_init();

    debug!("Logging initialized at level: {}", log_level);
}

pub fn run(args: Args) -> anyhow::Result<()> {
    setup_logging(&args);
    let config = ImportConfig::load(args.config.as_deref())?;
    debug!("configuration: {:?}", config);

    if args.count || args.sample.is_some() {
        return report_store(&args);
    }

    let source = args
        .source
        .clone()
        .ok_or_else(|| anyhow!("a SOURCE document is required"))?;
    let schema = args
        .schema
        .clone()
        .ok_or_else(|| anyhow!("--schema is required"))?;
    let mut req = ImportRequest::new(source, schema).preview(args.preview);
    if let Some(p) = &args.audit {
        req = req.audit_log(p);
    }
    if let Some(p) = &args.summary {
        req = req.summary(p);
    }

    let mut importer = Importer::new(&config);
    let validated = importer.validate(&req).map_err(print_violations)?;

    if let Some(out) = args.backup.as_deref().filter(|_| !args.preview) {
        if args.db.is_file() {
            let written = backup::export_store_bundle(&args.db, out)?;
            info!(
                "backed up store to {} ({}, {} bytes, sha256 {})",
                out.to_string_lossy(),
                written.bundle_format,
                written.db_bytes,
                written.db_sha256
            );
        } else {
            info!("no existing store at {}; backup skipped", args.db.to_string_lossy());
        }
    }

    // Preview never creates or upgrades the store file.
    let mut store = match (args.preview, args.db.is_file()) {
        (true, true) => SqliteStore::open_read_only(&args.db),
        (true, false) => SqliteStore::open_in_memory(),
        (false, _) => SqliteStore::open(&args.db),
    }
    .with_context(|| format!("failed to open store {}", args.db.to_string_lossy()))?;

    let summary = importer.import(&mut store, &req, validated)?;
    print_summary(&summary, args.json)
}

fn print_violations(e: ImportError) -> ImportError {
    if let ImportError::SchemaViolations { violations, .. } = &e {
        for v in violations {
            eprintln!("  {v}");
        }
    }
    e
}

fn print_summary(summary: &ImportSummary, json: bool) -> anyhow::Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    if json {
        writeln!(
            out,
            "{}",
            serde_json::to_string_pretty(summary).context("failed to serialize summary")?
        )?;
        return Ok(());
    }
    if summary.preview {
        writeln!(out, "Preview (nothing written)")?;
    }
    if summary.cancelled {
        writeln!(out, "Cancelled")?;
    }
    writeln!(out, "Imported: {}", summary.imported_count)?;
    writeln!(out, "Skipped: {}", summary.skipped_count)?;
    writeln!(out, "Errors: {}", summary.error_count)?;
    Ok(())
}

fn report_store(args: &Args) -> anyhow::Result<()> {
    if !args.db.is_file() {
        return Err(anyhow!("store not found: {}", args.db.to_string_lossy()));
    }
    let store = SqliteStore::open_read_only(&args.db)
        .with_context(|| format!("failed to open store {}", args.db.to_string_lossy()))?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    if let Some(n) = args.sample {
        for (kind, row) in store.sample(n)? {
            let line = serde_json::json!({ "kind": kind, "record": row });
            writeln!(out, "{}", line)?;
        }
        return Ok(());
    }

    let counts = store.counts()?;
    if args.json {
        let obj: serde_json::Map<String, serde_json::Value> = counts
            .into_iter()
            .map(|(k, n)| (k, serde_json::Value::from(n)))
            .collect();
        writeln!(out, "{}", serde_json::Value::Object(obj))?;
    } else {
        for (k, n) in counts {
            writeln!(out, "{k}\t{n}")?;
        }
    }
    Ok(())
}
