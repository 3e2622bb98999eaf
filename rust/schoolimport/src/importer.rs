use chrono::{DateTime, Utc};
use roxmltree::Document;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{ChangeLog, ChangeSet};
use crate::config::ImportConfig;
use crate::error::{ImportError, RecordError};
use crate::legacy::{read_records, LegacyRecord};
use crate::mapper::{Mapped, RecordMapper};
use crate::model::{
    family_name_key, EntityType, Family, FamilyLink, ImportOutcome, ImportSummary,
    NormalizedEntity, OutcomeStatus, RefId,
};
use crate::reconcile::Directory;
use crate::schema::Schema;
use crate::store::{ImportStore, StoreWriter};

pub const ALREADY_IMPORTED: &str = "already imported";

/// Shared stop request, checked between records only.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        CancelFlag::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug)]
pub struct ImportRequest {
    pub source: PathBuf,
    pub schema: PathBuf,
    pub audit_log: Option<PathBuf>,
    pub summary: Option<PathBuf>,
    pub preview: bool,
    pub cancel: Option<CancelFlag>,
}

impl ImportRequest {
    pub fn new(source: impl Into<PathBuf>, schema: impl Into<PathBuf>) -> Self {
        ImportRequest {
            source: source.into(),
            schema: schema.into(),
            audit_log: None,
            summary: None,
            preview: false,
            cancel: None,
        }
    }

    pub fn audit_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.audit_log = Some(path.into());
        self
    }

    pub fn summary(mut self, path: impl Into<PathBuf>) -> Self {
        self.summary = Some(path.into());
        self
    }

    pub fn preview(mut self, preview: bool) -> Self {
        self.preview = preview;
        self
    }

    pub fn cancel_flag(mut self, flag: CancelFlag) -> Self {
        self.cancel = Some(flag);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunPhase {
    NotStarted,
    Validating,
    Processing,
    Completed,
    Aborted,
}

impl RunPhase {
    pub fn can_advance_to(self, next: RunPhase) -> bool {
        matches!(
            (self, next),
            (RunPhase::NotStarted, RunPhase::Validating)
                | (RunPhase::Validating, RunPhase::Processing)
                | (RunPhase::Validating, RunPhase::Aborted)
                | (RunPhase::Processing, RunPhase::Completed)
        )
    }
}

/// A source document that passed schema validation, reduced to its records.
#[derive(Clone, Debug)]
pub struct Validated {
    pub source_sha256: String,
    pub started_at: DateTime<Utc>,
    pub records: Vec<LegacyRecord>,
}

pub struct Importer<'a> {
    config: &'a ImportConfig,
    phase: RunPhase,
}

impl<'a> Importer<'a> {
    pub fn new(config: &'a ImportConfig) -> Self {
        Importer {
            config,
            phase: RunPhase::NotStarted,
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    fn advance(&mut self, next: RunPhase) {
        if !self.phase.can_advance_to(next) {
            warn!("unexpected phase change {:?} -> {:?}", self.phase, next);
        }
        debug!("phase {:?} -> {:?}", self.phase, next);
        self.phase = next;
    }

    pub fn run<S: ImportStore>(
        &mut self,
        store: &mut S,
        req: &ImportRequest,
    ) -> Result<ImportSummary, ImportError> {
        let validated = self.validate(req)?;
        self.import(store, req, validated)
    }

    /// Load the schema and source and validate one against the other.
    /// Touches nothing but the two input files.
    pub fn validate(&mut self, req: &ImportRequest) -> Result<Validated, ImportError> {
        self.phase = RunPhase::NotStarted;
        self.advance(RunPhase::Validating);
        match validate_inputs(req) {
            Ok(v) => {
                info!(
                    "validated {} ({} records, sha256 {})",
                    req.source.to_string_lossy(),
                    v.records.len(),
                    v.source_sha256
                );
                Ok(v)
            }
            Err(e) => {
                self.advance(RunPhase::Aborted);
                warn!("import aborted: {e}");
                Err(e)
            }
        }
    }

    pub fn import<S: ImportStore>(
        &mut self,
        store: &mut S,
        req: &ImportRequest,
        validated: Validated,
    ) -> Result<ImportSummary, ImportError> {
        self.advance(RunPhase::Processing);
        let mut directory = store.load_directory()?;
        let mut run = RecordRun {
            mapper: RecordMapper::new(self.config),
            log: ChangeLog::new(self.config),
            directory: &mut directory,
            projected: HashSet::new(),
            preview: req.preview,
        };

        let mut outcomes = Vec::with_capacity(validated.records.len());
        let mut cancelled = false;
        for record in &validated.records {
            if req.cancelled() {
                cancelled = true;
                warn!(
                    "cancelled after {} of {} records",
                    outcomes.len(),
                    validated.records.len()
                );
                break;
            }
            let outcome = run.process(store, record);
            debug!(
                "line {}: {} {} {}{}",
                outcome.line,
                outcome.kind,
                outcome.natural_key,
                outcome.status,
                outcome
                    .reason
                    .as_deref()
                    .map(|r| format!(" ({r})"))
                    .unwrap_or_default()
            );
            for w in &outcome.warnings {
                warn!("line {}: {}", outcome.line, w);
            }
            outcomes.push(outcome);
        }

        let count = |s: OutcomeStatus| outcomes.iter().filter(|o| o.status == s).count();
        let mut summary = ImportSummary {
            run_id: Uuid::new_v4(),
            source_path: req.source.clone(),
            source_sha256: validated.source_sha256,
            preview: req.preview,
            cancelled,
            started_at: validated.started_at,
            completed_at: Utc::now(),
            imported_count: count(OutcomeStatus::Imported),
            skipped_count: count(OutcomeStatus::Skipped),
            error_count: count(OutcomeStatus::Error),
            audit_log_path: None,
            summary_path: None,
            outcomes,
        };

        // Records are committed by now; reporting failures only warn.
        if !req.preview {
            if let Err(e) = store.record_run(&summary) {
                warn!("failed to record run {}: {e}", summary.run_id);
            }
            if let Some(path) = &req.audit_log {
                match append_outcome_log(path, &summary) {
                    Ok(()) => summary.audit_log_path = Some(path.clone()),
                    Err(e) => warn!("{e}"),
                }
            }
            if let Some(path) = &req.summary {
                match std::fs::write(path, render_summary_text(&summary)) {
                    Ok(()) => summary.summary_path = Some(path.clone()),
                    Err(e) => warn!("failed to write {}: {e}", path.to_string_lossy()),
                }
            }
        }

        self.advance(RunPhase::Completed);
        info!(
            "{} complete: {} imported, {} skipped, {} errors",
            if req.preview { "preview" } else { "import" },
            summary.imported_count,
            summary.skipped_count,
            summary.error_count
        );
        Ok(summary)
    }
}

fn validate_inputs(req: &ImportRequest) -> Result<Validated, ImportError> {
    let started_at = Utc::now();
    if !req.source.is_file() {
        return Err(ImportError::SourceMissing {
            path: req.source.clone(),
        });
    }
    if !req.schema.is_file() {
        return Err(ImportError::SchemaMissing {
            path: req.schema.clone(),
        });
    }

    let schema_text = read_text(&req.schema)?;
    let schema = Schema::parse(&schema_text).map_err(|source| ImportError::Schema {
        path: req.schema.clone(),
        source,
    })?;

    let bytes = std::fs::read(&req.source).map_err(|source| ImportError::Read {
        path: req.source.clone(),
        source,
    })?;
    let source_sha256 = sha256_hex(&bytes);
    let text = String::from_utf8(bytes).map_err(|e| ImportError::Read {
        path: req.source.clone(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
    })?;
    let doc = Document::parse(&text).map_err(|source| ImportError::MalformedSource {
        path: req.source.clone(),
        source,
    })?;
    schema
        .validate(&doc)
        .map_err(|violations| ImportError::SchemaViolations {
            path: req.source.clone(),
            violations,
        })?;

    Ok(Validated {
        source_sha256,
        started_at,
        records: read_records(&doc),
    })
}

fn read_text(path: &Path) -> Result<String, ImportError> {
    std::fs::read_to_string(path).map_err(|source| ImportError::Read {
        path: path.to_path_buf(),
        source,
    })
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

struct RecordRun<'a> {
    mapper: RecordMapper<'a>,
    log: ChangeLog<'a>,
    directory: &'a mut Directory,
    /// Natural keys a preview run would have created.
    projected: HashSet<(EntityType, String)>,
    preview: bool,
}

impl RecordRun<'_> {
    fn process<S: ImportStore>(&mut self, store: &mut S, record: &LegacyRecord) -> ImportOutcome {
        let mapped = match self.mapper.map(record, self.directory) {
            Ok(m) => m,
            Err(e) => {
                let kind = EntityType::from_record_element(&record.kind)
                    .map(EntityType::as_str)
                    .unwrap_or(&record.kind);
                return outcome(record, kind, record.fallback_key(), Err(e.into()), Vec::new());
            }
        };
        let kind = mapped.entity.entity_type();
        let key = mapped.entity.natural_key();

        let result = self.place(store, &mapped, kind, &key);
        outcome(record, kind.as_str(), key, result, mapped.warnings)
    }

    fn place<S: ImportStore>(
        &mut self,
        store: &mut S,
        mapped: &Mapped,
        kind: EntityType,
        key: &str,
    ) -> Result<OutcomeStatus, RecordError> {
        let seen = store.exists(kind, key)? || self.projected.contains(&(kind, key.to_string()));
        if seen {
            return Ok(OutcomeStatus::Skipped);
        }

        if self.preview {
            self.log.check_entity_type(kind.as_str())?;
            if let Some(name) = pending_family(&mapped.entity) {
                self.log.check_entity_type(EntityType::Family.as_str())?;
                self.directory.add_family(RefId::Projected, &name);
                self.projected
                    .insert((EntityType::Family, family_name_key(&name)));
            }
            self.projected.insert((kind, key.to_string()));
            self.directory.register(&mapped.entity, RefId::Projected);
            return Ok(OutcomeStatus::Imported);
        }

        let log = &self.log;
        let at = Utc::now();
        let (id, created_family) =
            store.transaction(|w| persist(w, log, &mapped.entity, at))?;
        if let Some((family_id, name)) = created_family {
            self.directory.add_family(RefId::Stored(family_id), &name);
        }
        self.directory.register(&mapped.entity, RefId::Stored(id));
        Ok(OutcomeStatus::Imported)
    }
}

fn pending_family(entity: &NormalizedEntity) -> Option<String> {
    match entity {
        NormalizedEntity::Student(s) => match &s.family {
            Some(FamilyLink::Create { name }) => Some(name.clone()),
            _ => None,
        },
        _ => None,
    }
}

/// Insert the entity, auto-creating its family first when needed, and log
/// every created field. Runs inside the record's transaction.
fn persist(
    w: &mut dyn StoreWriter,
    log: &ChangeLog<'_>,
    entity: &NormalizedEntity,
    at: DateTime<Utc>,
) -> Result<(i64, Option<(i64, String)>), RecordError> {
    let mut entity = entity.clone();
    let mut created_family = None;

    if let Some(name) = pending_family(&entity) {
        let family = NormalizedEntity::Family(Family::auto_created(&name));
        let family_id = w.insert(&family)?;
        log.record(
            w,
            EntityType::Family.as_str(),
            family_id,
            &ChangeSet::created(family.audit_fields()),
            at,
        )?;
        if let NormalizedEntity::Student(s) = &mut entity {
            s.family = Some(FamilyLink::Linked(RefId::Stored(family_id)));
        }
        created_family = Some((family_id, name));
    }

    let id = w.insert(&entity)?;
    log.record(
        w,
        entity.entity_type().as_str(),
        id,
        &ChangeSet::created(entity.audit_fields()),
        at,
    )?;
    Ok((id, created_family))
}

fn outcome(
    record: &LegacyRecord,
    kind: &str,
    natural_key: String,
    result: Result<OutcomeStatus, RecordError>,
    warnings: Vec<String>,
) -> ImportOutcome {
    let (status, reason) = match result {
        Ok(OutcomeStatus::Skipped) => (OutcomeStatus::Skipped, Some(ALREADY_IMPORTED.to_string())),
        Ok(status) => (status, None),
        Err(e) => (OutcomeStatus::Error, Some(e.to_string())),
    };
    ImportOutcome {
        kind: kind.to_string(),
        natural_key,
        line: record.line,
        status,
        reason,
        warnings,
    }
}

fn one_line(s: &str) -> String {
    s.replace(['\t', '\r', '\n'], " ")
}

fn append_outcome_log(path: &Path, summary: &ImportSummary) -> Result<(), ImportError> {
    let mut text = format!(
        "# run {} source={} sha256={} completed={} imported={} skipped={} errors={}{}\n",
        summary.run_id,
        summary.source_path.to_string_lossy(),
        summary.source_sha256,
        summary.completed_at.to_rfc3339(),
        summary.imported_count,
        summary.skipped_count,
        summary.error_count,
        if summary.cancelled { " cancelled" } else { "" }
    );
    for o in &summary.outcomes {
        let mut reason = o.reason.clone().unwrap_or_default();
        if !o.warnings.is_empty() {
            if !reason.is_empty() {
                reason.push_str("; ");
            }
            reason.push_str(&o.warnings.join("; "));
        }
        let _ = writeln!(
            text,
            "{}\t{}\t{}\t{}",
            o.kind,
            one_line(&o.natural_key),
            o.status,
            one_line(&reason)
        );
    }

    let write_err = |source| ImportError::Write {
        path: path.to_path_buf(),
        source,
    };
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(write_err)?;
    f.write_all(text.as_bytes()).map_err(write_err)?;
    Ok(())
}

pub fn render_summary_text(summary: &ImportSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Legacy import run {}", summary.run_id);
    let _ = writeln!(out, "Source:    {}", summary.source_path.to_string_lossy());
    let _ = writeln!(out, "SHA-256:   {}", summary.source_sha256);
    let _ = writeln!(out, "Started:   {}", summary.started_at.to_rfc3339());
    let _ = writeln!(out, "Completed: {}", summary.completed_at.to_rfc3339());
    if summary.cancelled {
        let _ = writeln!(out, "Cancelled before all records were processed");
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "Imported: {}", summary.imported_count);
    let _ = writeln!(out, "Skipped:  {}", summary.skipped_count);
    let _ = writeln!(out, "Errors:   {}", summary.error_count);
    let _ = writeln!(out, "Total:    {}", summary.total());

    let errors: Vec<_> = summary.outcomes_with(OutcomeStatus::Error).collect();
    if !errors.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Errors:");
        for o in errors {
            let _ = writeln!(
                out,
                "  line {}: {} {}: {}",
                o.line,
                o.kind,
                o.natural_key,
                o.reason.as_deref().unwrap_or("")
            );
        }
    }
    out
}
