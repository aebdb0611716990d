//! Reconciliation pipeline orchestration: batch in, consolidated collection
//! updated, reports and dashboard snapshots out.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow_array::{BooleanArray, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use imoscout_adapters::{batch_source_for, BatchLocation, Portal};
use imoscout_core::{Listing, ListingId, ReappearancePolicy, ReconcileConfig, ReconcileEngine, ReconcilePlan};
use imoscout_storage::{
    ArtifactStore, CollectionSelector, ConsolidatedStore, InsertOutcome, JsonFileStore, RejectedInsert,
    StoreError, UpdateOutcome,
};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "imoscout-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub portal: Portal,
    pub enabled: bool,
    /// Crawl batch file, relative to the workspace root. Without it the batch
    /// is read from the raw collection.
    #[serde(default)]
    pub batch_path: Option<PathBuf>,
    #[serde(default)]
    pub raw_collection: Option<String>,
    #[serde(default)]
    pub consolidated_collection: Option<String>,
    #[serde(default)]
    pub identifier_field: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceConfig {
    pub fn for_portal(portal: Portal) -> Self {
        Self {
            source_id: portal.source_id().to_string(),
            display_name: portal.display_name().to_string(),
            portal,
            enabled: true,
            batch_path: None,
            raw_collection: None,
            consolidated_collection: None,
            identifier_field: None,
            notes: None,
        }
    }

    pub fn identifier_field(&self) -> &str {
        self.identifier_field
            .as_deref()
            .unwrap_or_else(|| self.portal.identifier_field())
    }

    pub fn raw_collection(&self) -> String {
        self.raw_collection
            .clone()
            .unwrap_or_else(|| self.portal.raw_collection())
    }

    pub fn consolidated_collection(&self) -> String {
        self.consolidated_collection
            .clone()
            .unwrap_or_else(|| self.portal.consolidated_collection())
    }

    pub fn batch_location(&self, workspace_root: &Path) -> BatchLocation {
        match &self.batch_path {
            Some(path) => BatchLocation::File(workspace_root.join(path)),
            None => BatchLocation::Collection(self.raw_collection()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub store_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub reappearance: ReappearancePolicy,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let workspace_root = lookup("IMOSCOUT_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let reappearance = lookup("IMOSCOUT_REAPPEARANCE")
            .map(|value| value.parse::<ReappearancePolicy>())
            .transpose()
            .context("parsing IMOSCOUT_REAPPEARANCE")?
            .unwrap_or_default();

        Ok(Self {
            store_dir: lookup("IMOSCOUT_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("data")),
            artifacts_dir: lookup("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("artifacts")),
            reappearance,
            scheduler_enabled: lookup("IMOSCOUT_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron_1: lookup("SYNC_CRON_1").unwrap_or_else(|| "0 0 6 * * *".to_string()),
            sync_cron_2: lookup("SYNC_CRON_2").unwrap_or_else(|| "0 0 18 * * *".to_string()),
            workspace_root,
        })
    }
}

/// Serializes reconcile-and-write cycles per consolidated collection.
#[derive(Debug, Default)]
pub struct CollectionLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CollectionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock_for(&self, collection: &str) -> Arc<Mutex<()>> {
        let mut map = self.locks.lock().await;
        map.entry(collection.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn acquire(&self, collection: &str) -> OwnedMutexGuard<()> {
        self.lock_for(collection).await.lock_owned().await
    }
}

/// Store outcomes of applying one plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AppliedPlan {
    pub marked_unavailable: UpdateOutcome,
    pub marked_available: UpdateOutcome,
    pub inserted: InsertOutcome,
}

/// Reconciliation bound to one consolidated collection of a store.
pub struct Reconciler {
    store: Arc<dyn ConsolidatedStore>,
    collection: String,
    engine: ReconcileEngine,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ConsolidatedStore>,
        collection: impl Into<String>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            store,
            collection: collection.into(),
            engine: ReconcileEngine::new(config),
        }
    }

    /// Reads the consolidated set and computes the plan. A failed read is
    /// returned as-is and nothing is reconciled.
    pub async fn plan(&self, raw_batch: Vec<Listing>) -> Result<ReconcilePlan, StoreError> {
        let consolidated = self
            .store
            .read(&CollectionSelector::all(self.collection.clone()))
            .await?;

        let anonymous = consolidated
            .iter()
            .filter(|listing| listing.identifier(self.engine.id_field()).is_none())
            .count();
        if anonymous > 0 {
            warn!(
                collection = %self.collection,
                anonymous,
                "consolidated records without identifier are never marked unavailable"
            );
        }

        Ok(self.engine.reconcile(raw_batch, &consolidated))
    }

    /// Issues the plan's write intents, stopping at the first store error.
    pub async fn apply(&self, plan: &ReconcilePlan) -> Result<AppliedPlan, StoreError> {
        let id_field = self.engine.id_field();
        let mut applied = AppliedPlan::default();

        if !plan.mark_unavailable.is_empty() {
            applied.marked_unavailable = self
                .store
                .mark_unavailable(&self.collection, id_field, &plan.mark_unavailable)
                .await?;
        }
        if !plan.mark_available.is_empty() {
            applied.marked_available = self
                .store
                .mark_available(&self.collection, id_field, &plan.mark_available)
                .await?;
        }
        if !plan.insert.is_empty() {
            applied.inserted = self
                .store
                .insert(&self.collection, id_field, plan.insert.clone())
                .await?;
        }

        for rejected in &applied.inserted.rejected {
            warn!(
                collection = %self.collection,
                id = ?rejected.id,
                reason = %rejected.reason,
                "insert rejected by store"
            );
        }
        Ok(applied)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: String,
    pub store_kind: String,
    pub store_location: String,
    pub reappearance: ReappearancePolicy,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceRunSummary {
    pub source_id: String,
    pub collection: String,
    pub identifier_field: String,
    pub raw_count: usize,
    pub unique_count: usize,
    pub duplicates_dropped: usize,
    pub inserted_ids: Vec<ListingId>,
    pub rejected: Vec<RejectedInsert>,
    pub marked_unavailable: Vec<ListingId>,
    pub marked_available: Vec<ListingId>,
    pub applied: AppliedPlan,
    pub archived_batch: String,
    pub batch_already_archived: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceRunSummary>,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

impl SyncRunSummary {
    pub fn total_inserted(&self) -> usize {
        self.sources.iter().map(|s| s.inserted_ids.len()).sum()
    }

    pub fn total_marked_unavailable(&self) -> usize {
        self.sources.iter().map(|s| s.marked_unavailable.len()).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

struct SourceRun {
    summary: SourceRunSummary,
    consolidated: Vec<Listing>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: Arc<dyn ConsolidatedStore>,
    store_location: String,
    artifact_store: ArtifactStore,
    locks: CollectionLocks,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Self {
        let store = Arc::new(JsonFileStore::new(config.store_dir.clone()));
        let store_location = config.store_dir.display().to_string();
        Self::with_store(config, store, store_location)
    }

    pub fn with_store(
        config: SyncConfig,
        store: Arc<dyn ConsolidatedStore>,
        store_location: impl Into<String>,
    ) -> Self {
        let artifact_store = ArtifactStore::new(config.artifacts_dir.clone());
        Self {
            config,
            store,
            store_location: store_location.into(),
            artifact_store,
            locks: CollectionLocks::new(),
        }
    }

    pub fn store(&self) -> Arc<dyn ConsolidatedStore> {
        Arc::clone(&self.store)
    }

    /// Reconciles every enabled source in the registry.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let registry = self.load_source_registry().await?;
        let enabled: Vec<_> = registry.sources.into_iter().filter(|s| s.enabled).collect();
        if enabled.is_empty() {
            warn!("no enabled sources in sources.yaml");
        }
        self.run_sources(&enabled).await
    }

    /// Reconciles one source, optionally from an explicit batch file.
    ///
    /// Sources missing from the registry fall back to their portal defaults.
    pub async fn consolidate_source(
        &self,
        source_id: &str,
        batch_path: Option<PathBuf>,
    ) -> Result<SyncRunSummary> {
        let registry_path = self.registry_path();
        let registered = if fs::try_exists(&registry_path)
            .await
            .with_context(|| format!("checking {}", registry_path.display()))?
        {
            self.load_source_registry()
                .await?
                .sources
                .into_iter()
                .find(|s| s.source_id == source_id)
        } else {
            None
        };

        let mut source = match registered {
            Some(source) => source,
            None => match Portal::from_source_id(source_id) {
                Some(portal) => SourceConfig::for_portal(portal),
                None => bail!("unknown source `{source_id}`"),
            },
        };
        if let Some(path) = batch_path {
            source.batch_path = Some(path);
        }
        self.run_sources(std::slice::from_ref(&source)).await
    }

    /// Stored and available listing counts for every registered source.
    pub async fn consolidated_counts(&self) -> Result<BTreeMap<String, (usize, usize)>> {
        let registry = self.load_source_registry().await?;
        consolidated_counts(self.store.as_ref(), &registry.sources).await
    }

    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for cron in [&self.config.sync_cron_1, &self.config.sync_cron_2] {
            let pipeline = Arc::clone(&self);
            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let pipeline = Arc::clone(&pipeline);
                Box::pin(async move {
                    match pipeline.run_once().await {
                        Ok(summary) => info!(
                            run_id = %summary.run_id,
                            inserted = summary.total_inserted(),
                            marked_unavailable = summary.total_marked_unavailable(),
                            "scheduled sync complete"
                        ),
                        Err(err) => error!(error = ?err, "scheduled sync failed"),
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(Some(sched))
    }

    fn registry_path(&self) -> PathBuf {
        self.config.workspace_root.join("sources.yaml")
    }

    async fn load_source_registry(&self) -> Result<SourceRegistry> {
        let path = self.registry_path();
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    async fn run_sources(&self, sources: &[SourceConfig]) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let mut runs = Vec::with_capacity(sources.len());
        for source in sources {
            let span = info_span!("reconcile", %run_id, source_id = %source.source_id);
            let run = self
                .run_source(source)
                .instrument(span)
                .await
                .with_context(|| format!("reconciling source {}", source.source_id))?;
            runs.push(run);
        }

        let finished_at = Utc::now();
        let reports_dir = self
            .write_reports(run_id, started_at, finished_at, &runs)
            .await?;
        let manifest_path = self.export_parquet_snapshots(&reports_dir, &runs).await?;

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            sources: runs.into_iter().map(|run| run.summary).collect(),
            reports_dir: reports_dir.display().to_string(),
            parquet_manifest: manifest_path.display().to_string(),
        })
    }

    async fn run_source(&self, source: &SourceConfig) -> Result<SourceRun> {
        let id_field = source.identifier_field().to_string();
        let collection = source.consolidated_collection();

        let batch_source = batch_source_for(
            &source.source_id,
            &id_field,
            source.batch_location(&self.config.workspace_root),
            self.store(),
        );
        let batch = batch_source
            .load_batch()
            .await
            .with_context(|| format!("loading batch for {}", source.source_id))?;
        let fetched_at = batch.fetched_at.unwrap_or_else(Utc::now);
        let archived = self
            .artifact_store
            .archive_batch(fetched_at, &source.source_id, &batch.listings)
            .await?;

        let reconciler = Reconciler::new(
            self.store(),
            collection.clone(),
            ReconcileConfig {
                id_field: id_field.clone(),
                reappearance: self.config.reappearance,
            },
        );

        let guard = self.locks.acquire(&collection).await;
        let plan = reconciler
            .plan(batch.listings)
            .await
            .with_context(|| format!("reading consolidated collection {collection}"))?;
        let applied = reconciler
            .apply(&plan)
            .await
            .with_context(|| format!("writing consolidated collection {collection}"))?;
        let consolidated = self
            .store
            .read(&CollectionSelector::all(collection.clone()))
            .await
            .with_context(|| format!("re-reading consolidated collection {collection}"))?;
        drop(guard);

        let rejected_ids: HashSet<Option<ListingId>> =
            applied.inserted.rejected.iter().map(|r| r.id.clone()).collect();
        let inserted_ids = plan
            .insert
            .iter()
            .map(|listing| listing.identifier(&id_field))
            .filter(|id| !rejected_ids.contains(id))
            .flatten()
            .collect::<Vec<_>>();

        info!(
            collection = %collection,
            raw = plan.raw_count,
            unique = plan.unique_count,
            inserted = inserted_ids.len(),
            rejected = applied.inserted.rejected.len(),
            marked_unavailable = plan.mark_unavailable.len(),
            marked_available = plan.mark_available.len(),
            "source reconciled"
        );

        let summary = SourceRunSummary {
            source_id: source.source_id.clone(),
            collection,
            identifier_field: id_field,
            raw_count: plan.raw_count,
            unique_count: plan.unique_count,
            duplicates_dropped: plan.duplicates_dropped(),
            inserted_ids,
            rejected: applied.inserted.rejected.clone(),
            marked_unavailable: plan.mark_unavailable,
            marked_available: plan.mark_available,
            applied,
            archived_batch: archived.relative_path.display().to_string(),
            batch_already_archived: archived.deduplicated,
        };
        Ok(SourceRun {
            summary,
            consolidated,
        })
    }

    async fn write_reports(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        runs: &[SourceRun],
    ) -> Result<PathBuf> {
        let reports_dir = self.config.workspace_root.join("reports").join(run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let run_record = RunRecord {
            run_id,
            started_at,
            finished_at,
            status: "completed".to_string(),
            store_kind: self.store.kind().to_string(),
            store_location: self.store_location.clone(),
            reappearance: self.config.reappearance,
        };

        let rows = runs
            .iter()
            .map(|run| {
                let s = &run.summary;
                format!(
                    "| {} | {} | {} | {} | {} | {} | {} |",
                    s.source_id,
                    s.raw_count,
                    s.unique_count,
                    s.inserted_ids.len(),
                    s.marked_unavailable.len(),
                    s.marked_available.len(),
                    s.rejected.len()
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let brief = format!(
            "# imoscout Run Summary\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Store: {} ({})\n- Reappearance policy: {}\n- Sources: {}\n\n## Sources\n| source | raw | unique | inserted | marked unavailable | marked available | rejected |\n|---|---|---|---|---|---|---|\n{}\n",
            run_record.run_id,
            run_record.started_at,
            run_record.finished_at,
            run_record.store_kind,
            run_record.store_location,
            run_record.reappearance,
            runs.len(),
            rows
        );
        fs::write(reports_dir.join("run_summary.md"), brief)
            .await
            .context("writing run_summary.md")?;

        let delta_json = serde_json::to_vec_pretty(&serde_json::json!({
            "run": run_record,
            "sources": runs.iter().map(|run| &run.summary).collect::<Vec<_>>(),
        }))
        .context("serializing reconcile delta")?;
        fs::write(reports_dir.join("reconcile_delta.json"), delta_json)
            .await
            .context("writing reconcile_delta.json")?;

        Ok(reports_dir)
    }

    async fn export_parquet_snapshots(&self, reports_dir: &Path, runs: &[SourceRun]) -> Result<PathBuf> {
        let snapshot_dir = reports_dir.join("snapshots");
        fs::create_dir_all(&snapshot_dir)
            .await
            .with_context(|| format!("creating {}", snapshot_dir.display()))?;

        let listings_path = snapshot_dir.join("listings.parquet");
        let changes_path = snapshot_dir.join("changes.parquet");

        write_listings_parquet(&listings_path, runs)?;
        write_changes_parquet(&changes_path, runs)?;

        let manifest = ParquetManifest {
            schema_version: 1,
            files: vec![
                manifest_entry("listings", reports_dir, &listings_path)?,
                manifest_entry("changes", reports_dir, &changes_path)?,
            ],
        };

        let manifest_path = snapshot_dir.join("manifest.json");
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
        fs::write(&manifest_path, bytes)
            .await
            .with_context(|| format!("writing {}", manifest_path.display()))?;

        Ok(manifest_path)
    }
}

/// Markdown digest of the most recent `runs` report directories.
pub fn report_daily_markdown(runs: usize, workspace_root: Option<PathBuf>) -> Result<String> {
    let root = workspace_root.unwrap_or_else(|| PathBuf::from("."));
    let reports_root = root.join("reports");
    let mut dirs = std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();
    let dirs = dirs.into_iter().take(runs.max(1)).collect::<Vec<_>>();

    let mut lines = vec!["# imoscout Recent Runs".to_string(), String::new()];
    for dir in dirs {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let delta_path = dir.path().join("reconcile_delta.json");
        let summary_path = dir.path().join("run_summary.md");
        let manifest_path = dir.path().join("snapshots").join("manifest.json");

        let delta: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&delta_path)
                .with_context(|| format!("reading {}", delta_path.display()))?,
        )
        .with_context(|| format!("parsing {}", delta_path.display()))?;

        let sources = delta
            .get("sources")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let count = |key: &str| -> usize {
            sources
                .iter()
                .filter_map(|s| s.get(key).and_then(|v| v.as_array()).map(|a| a.len()))
                .sum()
        };
        let policy = delta
            .get("run")
            .and_then(|v| v.get("reappearance"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");

        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!("- sources: {}", sources.len()));
        lines.push(format!("- inserted: {}", count("inserted_ids")));
        lines.push(format!("- marked unavailable: {}", count("marked_unavailable")));
        lines.push(format!("- marked available: {}", count("marked_available")));
        lines.push(format!("- reappearance policy: `{policy}`"));
        lines.push(format!("- delta: `{}`", delta_path.display()));
        if manifest_path.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        if summary_path.exists() {
            lines.push(format!("- run summary: `{}`", summary_path.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_listings_parquet(path: &Path, runs: &[SourceRun]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("listing_id", DataType::Utf8, true),
        ArrowField::new("is_available", DataType::Boolean, false),
        ArrowField::new("title", DataType::Utf8, true),
        ArrowField::new("record_json", DataType::Utf8, false),
    ]));

    let rows = runs
        .iter()
        .flat_map(|run| {
            run.consolidated
                .iter()
                .map(move |listing| (run.summary.source_id.as_str(), &run.summary.identifier_field, listing))
        })
        .collect::<Vec<_>>();

    let source_ids = StringArray::from(rows.iter().map(|(source_id, _, _)| Some(*source_id)).collect::<Vec<_>>());
    let listing_ids = StringArray::from(
        rows.iter()
            .map(|(_, id_field, listing)| listing.identifier(id_field).map(|id| id.to_string()))
            .collect::<Vec<_>>(),
    );
    let available = BooleanArray::from(
        rows.iter()
            .map(|(_, _, listing)| listing.is_available())
            .collect::<Vec<_>>(),
    );
    let titles = StringArray::from(
        rows.iter()
            .map(|(_, _, listing)| listing.get("title").and_then(|v| v.as_str()))
            .collect::<Vec<_>>(),
    );
    let records = rows
        .iter()
        .map(|(_, _, listing)| serde_json::to_string(listing).map(Some))
        .collect::<Result<Vec<_>, _>>()
        .context("serializing listing records")?;
    let records = StringArray::from(records);

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(source_ids),
            Arc::new(listing_ids),
            Arc::new(available),
            Arc::new(titles),
            Arc::new(records),
        ],
    )
    .context("building listings record batch")?;
    write_parquet(path, batch)
}

fn write_changes_parquet(path: &Path, runs: &[SourceRun]) -> Result<()> {
    let mut rows: Vec<(&str, Option<String>, &str)> = Vec::new();
    for run in runs {
        let s = &run.summary;
        let source_id = s.source_id.as_str();
        rows.extend(s.inserted_ids.iter().map(|id| (source_id, Some(id.to_string()), "inserted")));
        rows.extend(
            s.marked_unavailable
                .iter()
                .map(|id| (source_id, Some(id.to_string()), "marked_unavailable")),
        );
        rows.extend(
            s.marked_available
                .iter()
                .map(|id| (source_id, Some(id.to_string()), "marked_available")),
        );
        rows.extend(
            s.rejected
                .iter()
                .map(|r| (source_id, r.id.as_ref().map(ToString::to_string), "rejected")),
        );
    }

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("listing_id", DataType::Utf8, true),
        ArrowField::new("change", DataType::Utf8, false),
    ]));
    let source_ids = StringArray::from(rows.iter().map(|(s, _, _)| Some(*s)).collect::<Vec<_>>());
    let listing_ids = StringArray::from(rows.iter().map(|(_, id, _)| id.clone()).collect::<Vec<_>>());
    let changes = StringArray::from(rows.iter().map(|(_, _, c)| Some(*c)).collect::<Vec<_>>());
    let batch = RecordBatch::try_new(
        schema,
        vec![Arc::new(source_ids), Arc::new(listing_ids), Arc::new(changes)],
    )
    .context("building changes record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

/// Per-source counts of consolidated records, for quick status output.
pub async fn consolidated_counts(
    store: &dyn ConsolidatedStore,
    sources: &[SourceConfig],
) -> Result<BTreeMap<String, (usize, usize)>> {
    let mut counts = BTreeMap::new();
    for source in sources {
        let listings = store
            .read(&CollectionSelector::all(source.consolidated_collection()))
            .await
            .with_context(|| format!("reading {}", source.consolidated_collection()))?;
        let available = listings.iter().filter(|l| l.is_available()).count();
        counts.insert(source.source_id.clone(), (listings.len(), available));
    }
    Ok(counts)
}
