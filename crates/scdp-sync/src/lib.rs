//! Run orchestration for SCDP: locate, fetch, extract, normalize, diff and
//! export, plus run reports and the optional cron scheduler.

pub mod config;
pub mod diff;
pub mod export;
pub mod normalize;
pub mod query;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use scdp_adapters::{
    load_sources_config, CommandOcrEngine, ExtractionFailed, Extractor, Locator, LocatorError, OcrEngine, Scope,
    SkippedListing,
};
use scdp_core::{Dataset, DatasetError, Delta, ExtractionResult, RawDocument, Record, SourceRef};
use scdp_storage::{ArtifactStore, CancelToken, FetchError, HttpFetcher};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{load_aliases, load_taxonomy, parse_formats, AliasTable, ExportFormat, RunConfig};
pub use diff::{diff, record_changes};
pub use export::{load_dataset, load_manifest, ExportFailure, ExportManifest, ExportedFile, Exporter, WriteReport};
pub use normalize::{
    deduplicate, ClassificationError, CoercionWarning, DuplicateAudit, NormalizationError, Normalizer,
};
pub use query::{category_counts, filter_records, hierarchy, statistics, CategoryCount, RecordFilter, Statistics};

pub const CRATE_NAME: &str = "scdp-sync";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Setup(#[from] anyhow::Error),
    #[error(transparent)]
    Locator(#[from] LocatorError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Export(#[from] ExportFailure),
    #[error("run cancelled")]
    Cancelled,
}

/// A located document that never produced a table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedDocument {
    pub source_id: String,
    pub url: String,
    pub stage: &'static str,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SkippedItems {
    pub listings: Vec<SkippedListing>,
    pub documents: Vec<SkippedDocument>,
    pub extractions: Vec<ExtractionFailed>,
    pub records: Vec<NormalizationError>,
    pub coercions: Vec<CoercionWarning>,
    pub duplicates: Vec<DuplicateAudit>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scope: String,
    pub documents_located: usize,
    pub documents_fetched: usize,
    pub retries: usize,
    pub tables_extracted: usize,
    pub records_normalized: usize,
    pub records_out_of_scope: usize,
    /// Previous records outside a scoped run's slice, exported unchanged.
    pub records_carried_over: usize,
    pub records_exported: usize,
    pub added: usize,
    pub removed: usize,
    pub changed: usize,
    pub dataset_checksum: String,
    pub exports_dir: String,
    pub reports_dir: String,
    pub warnings: Vec<String>,
    pub skipped: SkippedItems,
}

enum DocumentOutcome {
    Extracted {
        tables: Vec<ExtractionResult>,
        retries: usize,
        fetched: bool,
    },
    FetchFailed(SkippedDocument),
    ExtractionFailed {
        failure: Option<ExtractionFailed>,
        skipped: SkippedDocument,
        retries: usize,
        fetched: bool,
    },
    Cancelled,
}

pub struct SyncPipeline {
    config: RunConfig,
    fetcher: HttpFetcher,
    artifact_store: ArtifactStore,
    extractor: Arc<Extractor>,
    running: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(config: RunConfig) -> Result<Self> {
        let fetcher = HttpFetcher::new(config.fetcher_config())?;
        Self::with_fetcher(config, fetcher)
    }

    /// Build around an existing fetcher, e.g. one with a scripted transport.
    pub fn with_fetcher(config: RunConfig, fetcher: HttpFetcher) -> Result<Self> {
        let ocr = match &config.ocr_command {
            Some(cmd) => {
                let engine: Arc<dyn OcrEngine> = Arc::new(
                    CommandOcrEngine::from_command_line(cmd).with_context(|| format!("empty OCR command {cmd:?}"))?,
                );
                Some(engine)
            }
            None => None,
        };
        Ok(Self {
            artifact_store: ArtifactStore::new(config.artifacts_dir.clone()),
            extractor: Arc::new(Extractor::standard(config.confidence_threshold, ocr)),
            fetcher,
            config,
            running: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub async fn run_once(&self, cancel: &CancelToken) -> Result<RunSummary, PipelineError> {
        let _guard = self.running.lock().await;
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, scope = %self.config.scope);
        self.run_inner(run_id, started_at, cancel).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        cancel: &CancelToken,
    ) -> Result<RunSummary, PipelineError> {
        let root = &self.config.workspace_root;
        let sources = load_sources_config(root.join("sources.yaml"))?.sources;
        let taxonomy = load_taxonomy(root.join("rules").join("taxonomy.yaml"))?;
        let aliases = load_aliases(root.join("rules").join("aliases.yaml"))?;

        let located = Locator::new(&self.fetcher, self.config.max_pages)
            .locate(&sources, &self.config.scope, cancel)
            .await
            .map_err(|e| match e {
                LocatorError::Cancelled => PipelineError::Cancelled,
                other => other.into(),
            })?;

        let mut skipped = SkippedItems {
            listings: located.skipped.clone(),
            ..SkippedItems::default()
        };
        let mut retries = located.retry_events;
        let mut documents_fetched = located.prefetched.len();
        let documents_located = located.refs.len();

        let mut prefetched = located.prefetched;
        let jobs: Vec<_> = located
            .refs
            .iter()
            .map(|source| (source, prefetched.remove(&source.url)))
            .collect();
        let futures: Vec<_> = jobs
            .into_iter()
            .map(|(source, cached)| self.process_document(source, cached, cancel))
            .collect();
        let outcomes: Vec<DocumentOutcome> = stream::iter(futures)
            .buffered(self.config.concurrency.max(1))
            .collect()
            .await;

        if cancel.is_cancelled() || outcomes.iter().any(|o| matches!(o, DocumentOutcome::Cancelled)) {
            warn!("run cancelled; discarding in-flight results");
            return Err(PipelineError::Cancelled);
        }

        let mut tables = Vec::new();
        for outcome in outcomes {
            match outcome {
                DocumentOutcome::Extracted {
                    tables: found,
                    retries: r,
                    fetched,
                } => {
                    retries += r;
                    documents_fetched += usize::from(fetched);
                    tables.extend(found);
                }
                DocumentOutcome::FetchFailed(doc) => skipped.documents.push(doc),
                DocumentOutcome::ExtractionFailed {
                    failure,
                    skipped: doc,
                    retries: r,
                    fetched,
                } => {
                    retries += r;
                    documents_fetched += usize::from(fetched);
                    skipped.extractions.extend(failure);
                    skipped.documents.push(doc);
                }
                DocumentOutcome::Cancelled => {}
            }
        }

        let normalizer = Normalizer::new(taxonomy.clone(), &aliases);
        let mut records = Vec::new();
        let mut records_out_of_scope = 0usize;
        for table in &tables {
            let rows = normalizer.normalize(table);
            for warning in &rows.warnings {
                warn!(
                    url = %warning.source_url,
                    row = warning.row,
                    column = %warning.column,
                    reason = %warning.reason,
                    "value coerced to null"
                );
            }
            skipped.coercions.extend(rows.warnings);
            for outcome in rows.outcomes {
                match outcome {
                    Ok(record) if self.config.scope.admits(Some(&record.market), Some(&record.certifying_board)) => {
                        records.push(record)
                    }
                    Ok(_) => records_out_of_scope += 1,
                    Err(error) => {
                        warn!(error = %error, "record dropped");
                        skipped.records.push(error);
                    }
                }
            }
        }
        let records_normalized = records.len();
        let (mut records, duplicates) = deduplicate(records);
        skipped.duplicates = duplicates;

        let previous = match load_dataset(&self.config.exports_dir) {
            Ok(previous) => previous,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "previous export unreadable; diffing against nothing");
                None
            }
        };
        let records_carried_over = match &previous {
            Some(previous) if self.config.scope != Scope::All => {
                let carried = carry_over(previous, &self.config.scope, &records);
                let count = carried.len();
                records.extend(carried);
                count
            }
            _ => 0,
        };
        let dataset = Dataset::from_records(records, Utc::now(), taxonomy.version)?;
        let delta = diff(previous.as_ref(), &dataset);

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let report = Exporter::new(self.config.exports_dir.clone())
            .with_taxonomy(taxonomy)
            .export(&dataset, &self.config.formats)
            .await?;

        let reports_dir = self.config.reports_dir().join(run_id.to_string());
        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            scope: self.config.scope.to_string(),
            documents_located,
            documents_fetched,
            retries,
            tables_extracted: tables.len(),
            records_normalized,
            records_out_of_scope,
            records_carried_over,
            records_exported: dataset.len(),
            added: delta.added.len(),
            removed: delta.removed.len(),
            changed: delta.changed.len(),
            dataset_checksum: dataset.checksum().to_string(),
            exports_dir: report.directory.display().to_string(),
            reports_dir: reports_dir.display().to_string(),
            warnings: located.warnings,
            skipped,
        };
        if let Err(e) = write_reports(&reports_dir, &summary, &delta).await {
            warn!(error = %format!("{e:#}"), dir = %reports_dir.display(), "run reports not written");
        }

        info!(
            located = summary.documents_located,
            fetched = summary.documents_fetched,
            tables = summary.tables_extracted,
            records = summary.records_exported,
            added = summary.added,
            removed = summary.removed,
            changed = summary.changed,
            skipped_documents = summary.skipped.documents.len(),
            dropped_records = summary.skipped.records.len(),
            "sync run finished"
        );
        Ok(summary)
    }

    async fn process_document(
        &self,
        source: &SourceRef,
        cached: Option<RawDocument>,
        cancel: &CancelToken,
    ) -> DocumentOutcome {
        let skip = |stage: &'static str, reason: String| SkippedDocument {
            source_id: source.source_id.clone(),
            url: source.url.clone(),
            stage,
            reason,
        };

        let (document, retries, fetched) = match cached {
            Some(document) => (document, 0, false),
            None => match self.fetcher.fetch(source, cancel).await {
                Ok(fetched) => (fetched.document, fetched.retries.len(), true),
                Err(FetchError::Cancelled { .. }) => return DocumentOutcome::Cancelled,
                Err(error) => {
                    warn!(url = %source.url, error = %error, "document skipped after fetch failure");
                    return DocumentOutcome::FetchFailed(skip("fetch", error.to_string()));
                }
            },
        };

        if let Err(e) = self.artifact_store.store_document(&document).await {
            warn!(url = %source.url, error = %format!("{e:#}"), "raw document not archived");
        }

        let extractor = Arc::clone(&self.extractor);
        match tokio::task::spawn_blocking(move || extractor.extract(&document)).await {
            Ok(Ok(tables)) => DocumentOutcome::Extracted {
                tables,
                retries,
                fetched,
            },
            Ok(Err(failure)) => {
                warn!(url = %source.url, error = %failure, "document skipped after extraction failure");
                DocumentOutcome::ExtractionFailed {
                    skipped: skip("extract", failure.to_string()),
                    failure: Some(failure),
                    retries,
                    fetched,
                }
            }
            Err(join) => {
                warn!(url = %source.url, error = %join, "extraction task aborted");
                DocumentOutcome::ExtractionFailed {
                    failure: None,
                    skipped: skip("extract", join.to_string()),
                    retries,
                    fetched,
                }
            }
        }
    }

    /// Cron-driven runs when `SCDP_SCHEDULER_ENABLED` is set. A tick that
    /// fires while a run is still active waits for it to finish.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(self);
        let cron = self.config.sync_cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once(&CancelToken::new()).await {
                    Ok(summary) => info!(run_id = %summary.run_id, records = summary.records_exported, "scheduled sync finished"),
                    Err(e) => warn!(error = %e, "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

/// Records of `previous` that `scope` leaves untouched. A scoped run refreshes
/// its own slice of the canonical export and keeps everything else.
fn carry_over(previous: &Dataset, scope: &Scope, fresh: &[Record]) -> Vec<Record> {
    let fresh: HashSet<&str> = fresh.iter().map(|r| r.identifier.as_str()).collect();
    previous
        .records()
        .iter()
        .filter(|r| !scope.admits(Some(&r.market), Some(&r.certifying_board)))
        .filter(|r| !fresh.contains(r.identifier.as_str()))
        .cloned()
        .collect()
}

async fn write_reports(dir: &Path, summary: &RunSummary, delta: &Delta) -> Result<()> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let summary_json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(dir.join("run_summary.json"), summary_json)
        .await
        .context("writing run_summary.json")?;
    let delta_json = serde_json::to_vec_pretty(delta).context("serializing delta")?;
    fs::write(dir.join("delta.json"), delta_json)
        .await
        .context("writing delta.json")?;
    fs::write(dir.join("brief.md"), run_brief(summary, delta))
        .await
        .context("writing brief.md")?;
    Ok(())
}

fn run_brief(summary: &RunSummary, delta: &Delta) -> String {
    let mut lines = vec![
        "# SCDP Run Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Scope: {}", summary.scope),
        format!(
            "- Documents: {} located, {} fetched, {} retries",
            summary.documents_located, summary.documents_fetched, summary.retries
        ),
        format!("- Tables extracted: {}", summary.tables_extracted),
        format!(
            "- Records: {} exported ({} normalized, {} out of scope{})",
            summary.records_exported,
            summary.records_normalized,
            summary.records_out_of_scope,
            if summary.records_carried_over > 0 {
                format!(", {} carried over", summary.records_carried_over)
            } else {
                String::new()
            }
        ),
        format!(
            "- Delta: +{} / -{} / ~{} field changes",
            summary.added, summary.removed, summary.changed
        ),
        format!("- Dataset checksum: `{}`", summary.dataset_checksum),
        String::new(),
        "## Skipped".to_string(),
        format!("- listing pages: {}", summary.skipped.listings.len()),
        format!("- documents: {}", summary.skipped.documents.len()),
        format!("- records: {}", summary.skipped.records.len()),
        format!("- coerced values: {}", summary.skipped.coercions.len()),
        format!("- duplicate merges: {}", summary.skipped.duplicates.len()),
    ];
    if !summary.warnings.is_empty() {
        lines.push(String::new());
        lines.push("## Warnings".to_string());
        lines.extend(summary.warnings.iter().map(|w| format!("- {w}")));
    }
    if !delta.removed.is_empty() {
        lines.push(String::new());
        lines.push("## Removed".to_string());
        lines.extend(delta.removed.iter().map(|id| format!("- {id}")));
    }
    lines.push(String::new());
    lines.join("\n")
}

pub async fn run_sync_once_from_env() -> Result<RunSummary> {
    let config = RunConfig::from_env()?;
    let pipeline = SyncPipeline::new(config)?;
    Ok(pipeline.run_once(&CancelToken::new()).await?)
}

/// Field-level delta between two export directories.
pub fn diff_export_dirs(previous: &Path, current: &Path) -> Result<Delta> {
    let before = load_dataset(previous)?;
    let after = load_dataset(current)?
        .with_context(|| format!("{} holds no export manifest", current.display()))?;
    Ok(diff(before.as_ref(), &after))
}

/// Markdown digest of the most recent `runs` run reports.
pub fn report_markdown(runs: usize, workspace_root: Option<PathBuf>) -> Result<String> {
    let root = workspace_root.unwrap_or_else(|| PathBuf::from("."));
    let reports_root = root.join("reports");
    let mut dirs = std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .map(|entry| {
            let path = entry.path();
            let summary: Option<serde_json::Value> = std::fs::read_to_string(path.join("run_summary.json"))
                .ok()
                .and_then(|text| serde_json::from_str(&text).ok());
            (path, summary)
        })
        .collect::<Vec<_>>();
    dirs.sort_by(|a, b| {
        let started = |s: &Option<serde_json::Value>| {
            s.as_ref()
                .and_then(|v| v.get("started_at"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        started(&b.1).cmp(&started(&a.1))
    });

    let mut lines = vec!["# SCDP Run Reports".to_string(), String::new()];
    for (path, summary) in dirs.into_iter().take(runs.max(1)) {
        let run_id = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        lines.push(format!("## Run `{run_id}`"));
        match summary {
            Some(s) => {
                let num = |key: &str| s.get(key).and_then(|v| v.as_u64()).unwrap_or(0);
                lines.push(format!(
                    "- started: {}",
                    s.get("started_at").and_then(|v| v.as_str()).unwrap_or("unknown")
                ));
                lines.push(format!("- records exported: {}", num("records_exported")));
                lines.push(format!(
                    "- delta: +{} / -{} / ~{}",
                    num("added"),
                    num("removed"),
                    num("changed")
                ));
                let dropped = s
                    .pointer("/skipped/records")
                    .and_then(|v| v.as_array())
                    .map(Vec::len)
                    .unwrap_or(0);
                lines.push(format!("- dropped records: {dropped}"));
            }
            None => lines.push("- run_summary.json missing or unreadable".to_string()),
        }
        let brief = path.join("brief.md");
        if brief.exists() {
            lines.push(format!("- brief: `{}`", brief.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
