//! Recovery pipeline: snapshot/live diff, staged extraction and idempotent restore.

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use resurface_adapters::{
    decode_staged, load_staged, read_source, LiveFetcher, RecordSource, SnapshotSource,
};
use resurface_core::{ContentRecord, IdentityKey, IdentityMatch, RestoreFailure};
use resurface_storage::{
    write_atomic, ArtifactStore, HttpLiveStore, LiveStore, LiveStoreConfig, StoredArtifact,
    UpsertKind,
};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use tokio::fs;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub live_base_url: String,
    pub live_token: Option<String>,
    pub include_unpublished: bool,
    pub http_timeout_secs: Option<u64>,
    pub snapshot_path: PathBuf,
    pub staging_path: PathBuf,
    pub reports_dir: PathBuf,
    pub restore_concurrency: usize,
    /// `None` disables near-match hints in the diff report.
    pub near_match_threshold: Option<f64>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            live_base_url: "http://localhost:3000/api".to_string(),
            live_token: None,
            include_unpublished: true,
            http_timeout_secs: None,
            snapshot_path: PathBuf::from("./backups/snapshot.json"),
            staging_path: PathBuf::from("./staging/missing_records.json"),
            reports_dir: PathBuf::from("./reports"),
            restore_concurrency: 4,
            near_match_threshold: Some(DiffConfig::default_near_match_threshold()),
        }
    }
}

impl RecoveryConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            live_base_url: std::env::var("RESURFACE_LIVE_URL").unwrap_or(defaults.live_base_url),
            live_token: std::env::var("RESURFACE_LIVE_TOKEN")
                .ok()
                .filter(|token| !token.is_empty()),
            include_unpublished: std::env::var("RESURFACE_INCLUDE_UNPUBLISHED")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False"))
                .unwrap_or(defaults.include_unpublished),
            http_timeout_secs: std::env::var("RESURFACE_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok()),
            snapshot_path: std::env::var("RESURFACE_SNAPSHOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.snapshot_path),
            staging_path: std::env::var("RESURFACE_STAGING")
                .map(PathBuf::from)
                .unwrap_or(defaults.staging_path),
            reports_dir: std::env::var("RESURFACE_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            restore_concurrency: std::env::var("RESURFACE_RESTORE_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.restore_concurrency),
            near_match_threshold: match std::env::var("RESURFACE_NEAR_MATCH") {
                Ok(v) if v == "off" => None,
                Ok(v) => v.parse().ok().or(defaults.near_match_threshold),
                Err(_) => defaults.near_match_threshold,
            },
        }
    }

    pub fn live_store_config(&self) -> LiveStoreConfig {
        LiveStoreConfig {
            base_url: self.live_base_url.clone(),
            token: self.live_token.clone(),
            include_unpublished: self.include_unpublished,
            timeout: self.http_timeout_secs.map(Duration::from_secs),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Diff
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct DiffConfig {
    pub near_match_threshold: Option<f64>,
}

impl DiffConfig {
    const fn default_near_match_threshold() -> f64 {
        0.92
    }
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            near_match_threshold: Some(Self::default_near_match_threshold()),
        }
    }
}

/// Closest live title to a missing record, shown to the reviewer only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NearMatch {
    pub live_title: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub snapshot_index: usize,
    pub id: Option<String>,
    pub title: String,
    pub identity: IdentityMatch,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissingRecord {
    pub snapshot_index: usize,
    /// Snapshot index of the first record with the same identity key, when this one is a
    /// later occurrence.
    pub duplicate_of: Option<usize>,
    pub near_match: Option<NearMatch>,
    pub record: ContentRecord,
}

/// Snapshot records absent from live, in snapshot order, plus how every snapshot record
/// was classified.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiffResult {
    pub classifications: Vec<Classification>,
    pub missing: Vec<MissingRecord>,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty()
    }

    pub fn len(&self) -> usize {
        self.missing.len()
    }

    pub fn records(&self) -> impl Iterator<Item = &ContentRecord> {
        self.missing.iter().map(|m| &m.record)
    }

    pub fn into_records(self) -> Vec<ContentRecord> {
        self.missing.into_iter().map(|m| m.record).collect()
    }

    pub fn matched_by_id(&self) -> usize {
        self.count(|identity| matches!(identity, IdentityMatch::MatchedById(_)))
    }

    pub fn matched_by_title(&self) -> usize {
        self.count(|identity| matches!(identity, IdentityMatch::MatchedByTitle(_)))
    }

    pub fn duplicate_titles(&self) -> usize {
        self.missing.iter().filter(|m| m.duplicate_of.is_some()).count()
    }

    fn count(&self, pred: impl Fn(&IdentityMatch) -> bool) -> usize {
        self.classifications
            .iter()
            .filter(|c| pred(&c.identity))
            .count()
    }
}

struct LiveIndex<'a> {
    ids: HashSet<&'a str>,
    keys: HashSet<IdentityKey>,
    titles: Vec<(IdentityKey, &'a str)>,
}

impl<'a> LiveIndex<'a> {
    fn build(live: &'a [ContentRecord]) -> Self {
        let mut ids = HashSet::with_capacity(live.len());
        let mut keys = HashSet::with_capacity(live.len());
        let mut titles = Vec::with_capacity(live.len());
        for record in live {
            if let Some(id) = record.stable_id() {
                ids.insert(id);
            }
            if record.has_title() {
                let key = record.identity_key();
                if keys.insert(key.clone()) {
                    titles.push((key, record.title.as_str()));
                }
            }
        }
        Self { ids, keys, titles }
    }

    /// Stable id first, normalized title second.
    fn classify(&self, record: &ContentRecord) -> IdentityMatch {
        if let Some(id) = record.stable_id() {
            if self.ids.contains(id) {
                return IdentityMatch::MatchedById(id.to_string());
            }
        }
        let key = record.identity_key();
        if !key.is_empty() && self.keys.contains(&key) {
            return IdentityMatch::MatchedByTitle(key);
        }
        IdentityMatch::Unmatched
    }

    fn nearest(&self, key: &IdentityKey, threshold: f64) -> Option<NearMatch> {
        self.titles
            .iter()
            .map(|(live_key, title)| (jaro_winkler(key.as_str(), live_key.as_str()), *title))
            .filter(|(score, _)| *score >= threshold)
            .fold(None, |best: Option<(f64, &str)>, candidate| match best {
                Some(current) if current.0 >= candidate.0 => Some(current),
                _ => Some(candidate),
            })
            .map(|(score, title)| NearMatch {
                live_title: title.to_string(),
                score,
            })
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiffEngine {
    config: DiffConfig,
}

impl DiffEngine {
    pub fn new(config: DiffConfig) -> Self {
        Self { config }
    }

    pub fn diff(&self, live: &[ContentRecord], snapshot: &[ContentRecord]) -> DiffResult {
        let span = info_span!("diff", live = live.len(), snapshot = snapshot.len());
        let _guard = span.enter();

        let index = LiveIndex::build(live);
        let mut first_seen: HashMap<IdentityKey, usize> = HashMap::new();
        let mut result = DiffResult {
            classifications: Vec::with_capacity(snapshot.len()),
            missing: Vec::new(),
        };

        for (snapshot_index, record) in snapshot.iter().enumerate() {
            let key = record.identity_key();
            let duplicate_of = match first_seen.get(&key) {
                Some(&first) => Some(first),
                None => {
                    first_seen.insert(key.clone(), snapshot_index);
                    None
                }
            };

            let identity = index.classify(record);
            if identity.is_unmatched() {
                let near_match = self
                    .config
                    .near_match_threshold
                    .and_then(|threshold| index.nearest(&key, threshold));
                result.missing.push(MissingRecord {
                    snapshot_index,
                    duplicate_of,
                    near_match,
                    record: record.clone(),
                });
            }
            result.classifications.push(Classification {
                snapshot_index,
                id: record.stable_id().map(str::to_string),
                title: record.title.clone(),
                identity,
            });
        }

        info!(
            missing = result.missing.len(),
            matched_by_id = result.matched_by_id(),
            matched_by_title = result.matched_by_title(),
            "computed snapshot diff"
        );
        result
    }
}

/// Diff with the default engine settings.
pub fn diff(live: &[ContentRecord], snapshot: &[ContentRecord]) -> DiffResult {
    DiffEngine::default().diff(live, snapshot)
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionManifest {
    pub run_id: Uuid,
    pub extracted_at: DateTime<Utc>,
    pub records: usize,
    pub sha256: String,
}

/// Sidecar written next to the staged artifact, e.g. `missing.json.manifest.json`.
pub fn manifest_path_for(staging_path: &Path) -> PathBuf {
    let mut name = staging_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".manifest.json");
    staging_path.with_file_name(name)
}

#[derive(Debug, Clone)]
pub struct ExtractionWriter {
    staging_path: PathBuf,
}

impl ExtractionWriter {
    pub fn new(staging_path: impl Into<PathBuf>) -> Self {
        Self {
            staging_path: staging_path.into(),
        }
    }

    pub fn staging_path(&self) -> &Path {
        &self.staging_path
    }

    /// Write the missing records as a JSON array, replacing any previous artifact.
    pub async fn persist(&self, run_id: Uuid, diff: &DiffResult) -> Result<StoredArtifact> {
        let span = info_span!("extract", %run_id, path = %self.staging_path.display());
        async {
            let records: Vec<&ContentRecord> = diff.records().collect();
            let mut bytes =
                serde_json::to_vec_pretty(&records).context("serializing staged records")?;
            bytes.push(b'\n');
            let stored = write_atomic(&self.staging_path, &bytes).await?;

            let manifest = ExtractionManifest {
                run_id,
                extracted_at: Utc::now(),
                records: records.len(),
                sha256: stored.content_hash.clone(),
            };
            let manifest_bytes =
                serde_json::to_vec_pretty(&manifest).context("serializing extraction manifest")?;
            write_atomic(&manifest_path_for(&self.staging_path), &manifest_bytes).await?;

            info!(records = records.len(), sha256 = %stored.content_hash, "staged missing records");
            Ok::<_, anyhow::Error>(stored)
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ArtifactCheck {
    Unchanged {
        sha256: String,
    },
    Edited {
        extracted_sha256: String,
        current_sha256: String,
    },
    NoManifest {
        sha256: String,
    },
}

/// Compare the staged artifact against the manifest its extraction left behind.
pub async fn check_artifact(staging_path: &Path) -> Result<ArtifactCheck> {
    let bytes = fs::read(staging_path)
        .await
        .with_context(|| format!("reading {}", staging_path.display()))?;
    verify_artifact(staging_path, &bytes).await
}

/// Like [`check_artifact`], for artifact bytes the caller has already read.
pub async fn verify_artifact(staging_path: &Path, bytes: &[u8]) -> Result<ArtifactCheck> {
    let current = ArtifactStore::sha256_hex(bytes);

    let manifest_path = manifest_path_for(staging_path);
    let manifest_bytes = match fs::read(&manifest_path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Ok(ArtifactCheck::NoManifest { sha256: current })
        }
        Err(err) => {
            return Err(err).with_context(|| format!("reading {}", manifest_path.display()))
        }
    };
    let manifest: ExtractionManifest = match serde_json::from_slice(&manifest_bytes) {
        Ok(manifest) => manifest,
        Err(err) => {
            warn!(path = %manifest_path.display(), %err, "ignoring unreadable extraction manifest");
            return Ok(ArtifactCheck::NoManifest { sha256: current });
        }
    };

    if manifest.sha256 == current {
        Ok(ArtifactCheck::Unchanged { sha256: current })
    } else {
        Ok(ArtifactCheck::Edited {
            extracted_sha256: manifest.sha256,
            current_sha256: current,
        })
    }
}

// ---------------------------------------------------------------------------
// Restore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RestoreStatus {
    Created,
    Updated,
    Failed { reason: RestoreFailure },
}

/// Terminal result for one artifact record. Built exactly once per record per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreOutcome {
    pub index: usize,
    pub id: Option<String>,
    pub title: String,
    pub status: RestoreStatus,
}

impl RestoreOutcome {
    fn settle(index: usize, record: &ContentRecord, status: RestoreStatus) -> Self {
        Self {
            index,
            id: record.id.clone(),
            title: record.title.clone(),
            status,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RestoreSummary {
    pub total: usize,
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
    pub not_attempted: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Sorted by artifact index.
    pub outcomes: Vec<RestoreOutcome>,
    /// Indices never started because the run was stopped.
    pub not_attempted: Vec<usize>,
}

impl RestoreRun {
    pub fn summary(&self) -> RestoreSummary {
        let mut summary = RestoreSummary {
            total: self.outcomes.len() + self.not_attempted.len(),
            not_attempted: self.not_attempted.len(),
            ..Default::default()
        };
        for outcome in &self.outcomes {
            match outcome.status {
                RestoreStatus::Created => summary.created += 1,
                RestoreStatus::Updated => summary.updated += 1,
                RestoreStatus::Failed { .. } => summary.failed += 1,
            }
        }
        summary
    }

    pub fn is_clean(&self) -> bool {
        let summary = self.summary();
        summary.failed == 0 && summary.not_attempted == 0
    }
}

/// Upserts staged records into the live store by stable id.
///
/// Records with distinct ids run concurrently up to `concurrency`. Records sharing an id
/// run one after another in artifact order inside a single task, so the last one wins.
/// The stop flag is only consulted between records; a started upsert always completes.
#[derive(Clone)]
pub struct RestoreUpserter {
    store: Arc<dyn LiveStore>,
    concurrency: usize,
    stop: Arc<AtomicBool>,
}

impl RestoreUpserter {
    pub fn new(store: Arc<dyn LiveStore>, concurrency: usize) -> Self {
        Self {
            store,
            concurrency: concurrency.clamp(1, Semaphore::MAX_PERMITS),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub async fn restore(&self, records: Vec<ContentRecord>) -> RestoreRun {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let total = records.len();
        let span = info_span!("restore", %run_id, records = total);

        let mut outcomes = async {
            let mut outcomes = Vec::with_capacity(total);
            let mut groups: Vec<(String, Vec<(usize, ContentRecord)>)> = Vec::new();
            let mut group_of: HashMap<String, usize> = HashMap::new();

            for (index, record) in records.into_iter().enumerate() {
                let Some(id) = record.stable_id().map(str::to_string) else {
                    warn!(index, title = %record.title, "record has no stable id; not restored");
                    outcomes.push(RestoreOutcome::settle(
                        index,
                        &record,
                        RestoreStatus::Failed {
                            reason: RestoreFailure::MissingIdentity,
                        },
                    ));
                    continue;
                };
                match group_of.get(&id) {
                    Some(&pos) => groups[pos].1.push((index, record)),
                    None => {
                        group_of.insert(id.clone(), groups.len());
                        groups.push((id, vec![(index, record)]));
                    }
                }
            }

            let semaphore = Arc::new(Semaphore::new(self.concurrency));
            let settled = Arc::new(Mutex::new(Vec::<RestoreOutcome>::with_capacity(total)));
            let mut task_ids = HashMap::new();
            let mut tasks = JoinSet::new();
            for (id, group) in groups {
                if self.stop.load(Ordering::SeqCst) {
                    break;
                }
                let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                    break;
                };
                let store = Arc::clone(&self.store);
                let stop = Arc::clone(&self.stop);
                let settled = Arc::clone(&settled);
                let group_id = id.clone();
                let handle = tasks.spawn(
                    async move {
                        let _permit = permit;
                        for (index, record) in group {
                            if stop.load(Ordering::SeqCst) {
                                break;
                            }
                            let status = upsert_one(store.as_ref(), &id, &record)
                                .instrument(info_span!("restore_record", index, id = %id))
                                .await;
                            settled
                                .lock()
                                .await
                                .push(RestoreOutcome::settle(index, &record, status));
                        }
                    }
                    .in_current_span(),
                );
                task_ids.insert(handle.id(), group_id);
            }

            while let Some(joined) = tasks.join_next().await {
                if let Err(err) = joined {
                    let id = task_ids.get(&err.id()).map(String::as_str).unwrap_or("unknown");
                    warn!(%err, id, "restore task ended abnormally; unsettled records not attempted");
                }
            }
            outcomes.append(&mut *settled.lock().await);
            outcomes
        }
        .instrument(span.clone())
        .await;

        outcomes.sort_by_key(|o| o.index);
        let settled: HashSet<usize> = outcomes.iter().map(|o| o.index).collect();
        let not_attempted: Vec<usize> = (0..total).filter(|i| !settled.contains(i)).collect();

        let run = RestoreRun {
            run_id,
            started_at,
            finished_at: Utc::now(),
            outcomes,
            not_attempted,
        };
        let summary = run.summary();
        span.in_scope(|| {
            info!(
                created = summary.created,
                updated = summary.updated,
                failed = summary.failed,
                not_attempted = summary.not_attempted,
                "restore finished"
            )
        });
        run
    }
}

async fn upsert_one(store: &dyn LiveStore, id: &str, record: &ContentRecord) -> RestoreStatus {
    match store.upsert(id, record).await {
        Ok(UpsertKind::Created) => {
            info!("created");
            RestoreStatus::Created
        }
        Ok(UpsertKind::Updated) => {
            info!("updated");
            RestoreStatus::Updated
        }
        Err(err) => {
            warn!(%err, "upsert failed");
            RestoreStatus::Failed {
                reason: RestoreFailure::WriteFailure {
                    message: err.to_string(),
                },
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlannedAction {
    Create,
    Update,
    Fail { reason: RestoreFailure },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedRestore {
    pub index: usize,
    pub id: Option<String>,
    pub title: String,
    pub action: PlannedAction,
}

/// What a restore of `records` would do against `live`, without writing anything.
pub fn plan_restore(records: &[ContentRecord], live: &[ContentRecord]) -> Vec<PlannedRestore> {
    let mut existing: HashSet<&str> = live.iter().filter_map(ContentRecord::stable_id).collect();
    records
        .iter()
        .enumerate()
        .map(|(index, record)| {
            let action = match record.stable_id() {
                None => PlannedAction::Fail {
                    reason: RestoreFailure::MissingIdentity,
                },
                Some(id) if existing.insert(id) => PlannedAction::Create,
                Some(_) => PlannedAction::Update,
            };
            PlannedRestore {
                index,
                id: record.id.clone(),
                title: record.title.clone(),
                action,
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct DiffRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub snapshot_source: String,
    pub live_source: String,
    pub snapshot_records: usize,
    pub live_records: usize,
    pub diff: DiffResult,
    pub artifact: Option<StoredArtifact>,
    pub report_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub run: RestoreRun,
    pub artifact_path: PathBuf,
    pub artifact_check: ArtifactCheck,
    pub report_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ReportWriter {
    store: ArtifactStore,
}

impl ReportWriter {
    pub fn new(reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            store: ArtifactStore::new(reports_dir),
        }
    }

    pub async fn write_diff_report(&self, run: &DiffRun) -> Result<PathBuf> {
        let missing = run
            .diff
            .missing
            .iter()
            .map(|m| {
                serde_json::json!({
                    "snapshot_index": m.snapshot_index,
                    "id": m.record.id,
                    "title": m.record.title,
                    "duplicate_of": m.duplicate_of,
                    "near_match": m.near_match,
                })
            })
            .collect::<Vec<_>>();
        let report = serde_json::json!({
            "run_id": run.run_id,
            "started_at": run.started_at,
            "finished_at": run.finished_at,
            "snapshot_source": run.snapshot_source,
            "live_source": run.live_source,
            "counts": {
                "snapshot": run.snapshot_records,
                "live": run.live_records,
                "matched_by_id": run.diff.matched_by_id(),
                "matched_by_title": run.diff.matched_by_title(),
                "missing": run.diff.len(),
                "duplicate_titles": run.diff.duplicate_titles(),
            },
            "artifact": run.artifact,
            "classifications": run.diff.classifications,
            "missing": missing,
        });
        let bytes = serde_json::to_vec_pretty(&report).context("serializing diff report")?;
        self.store
            .store_run_file(run.run_id, "diff_report.json", &bytes)
            .await?;
        self.store
            .store_run_file(run.run_id, "diff_brief.md", diff_brief(run).as_bytes())
            .await?;
        Ok(self.store.run_dir(run.run_id))
    }

    pub async fn write_restore_report(
        &self,
        run: &RestoreRun,
        artifact_path: &Path,
        check: &ArtifactCheck,
    ) -> Result<PathBuf> {
        let report = serde_json::json!({
            "run_id": run.run_id,
            "started_at": run.started_at,
            "finished_at": run.finished_at,
            "artifact_path": artifact_path,
            "artifact_check": check,
            "summary": run.summary(),
            "outcomes": run.outcomes,
            "not_attempted": run.not_attempted,
        });
        let bytes = serde_json::to_vec_pretty(&report).context("serializing restore report")?;
        self.store
            .store_run_file(run.run_id, "restore_report.json", &bytes)
            .await?;
        self.store
            .store_run_file(
                run.run_id,
                "restore_brief.md",
                restore_brief(run, artifact_path).as_bytes(),
            )
            .await?;
        Ok(self.store.run_dir(run.run_id))
    }
}

fn diff_brief(run: &DiffRun) -> String {
    let artifact = match &run.artifact {
        Some(stored) => format!(
            "`{}` (sha256 `{}`)",
            stored.path.display(),
            stored.content_hash
        ),
        None => "not written".to_string(),
    };
    let missing = if run.diff.is_empty() {
        "- none".to_string()
    } else {
        run.diff
            .missing
            .iter()
            .map(|m| {
                let mut line = format!("- [{}] {}", m.snapshot_index, m.record.title);
                match m.record.stable_id() {
                    Some(id) => line.push_str(&format!(" (id `{id}`)")),
                    None => line.push_str(" (no id, cannot be restored as-is)"),
                }
                if let Some(first) = m.duplicate_of {
                    line.push_str(&format!("; duplicate title of [{first}]"));
                }
                if let Some(near) = &m.near_match {
                    line.push_str(&format!(
                        "; similar live title \"{}\" ({:.2})",
                        near.live_title, near.score
                    ));
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        "# Resurface Diff Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Snapshot: {} ({} records)\n- Live: {} ({} records)\n- Matched by id: {}\n- Matched by title: {}\n- Missing: {}\n- Staged artifact: {}\n\n## Missing Records\n{}\n",
        run.run_id,
        run.started_at,
        run.finished_at,
        run.snapshot_source,
        run.snapshot_records,
        run.live_source,
        run.live_records,
        run.diff.matched_by_id(),
        run.diff.matched_by_title(),
        run.diff.len(),
        artifact,
        missing,
    )
}

fn restore_brief(run: &RestoreRun, artifact_path: &Path) -> String {
    let summary = run.summary();
    let failures = run
        .outcomes
        .iter()
        .filter_map(|o| match &o.status {
            RestoreStatus::Failed { reason } => Some(format!("- [{}] {}: {}", o.index, o.title, reason)),
            _ => None,
        })
        .collect::<Vec<_>>();
    format!(
        "# Resurface Restore Brief\n\n- Run ID: `{}`\n- Artifact: `{}`\n- Created: {}\n- Updated: {}\n- Failed: {}\n- Not attempted: {}\n\n## Failures\n{}\n",
        run.run_id,
        artifact_path.display(),
        summary.created,
        summary.updated,
        summary.failed,
        summary.not_attempted,
        if failures.is_empty() {
            "- none".to_string()
        } else {
            failures.join("\n")
        },
    )
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Runs the stages against explicitly supplied configuration and live store.
pub struct RecoveryPipeline {
    config: RecoveryConfig,
    store: Arc<dyn LiveStore>,
    engine: DiffEngine,
    reports: ReportWriter,
}

impl RecoveryPipeline {
    pub fn new(config: RecoveryConfig, store: Arc<dyn LiveStore>) -> Self {
        let engine = DiffEngine::new(DiffConfig {
            near_match_threshold: config.near_match_threshold,
        });
        let reports = ReportWriter::new(config.reports_dir.clone());
        Self {
            config,
            store,
            engine,
            reports,
        }
    }

    pub fn from_config(config: RecoveryConfig) -> Result<Self> {
        let store = HttpLiveStore::new(config.live_store_config())?;
        Ok(Self::new(config, Arc::new(store)))
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Load, fetch and diff. With `write_artifact` the result is staged for review.
    /// Any stage failure aborts before an artifact is written.
    pub async fn run_diff(&self, write_artifact: bool) -> Result<DiffRun> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let snapshot_source = SnapshotSource::new(&self.config.snapshot_path);
        let live_source = LiveFetcher::new(Arc::clone(&self.store));
        let snapshot = snapshot_source.load_records().await?;
        let live = live_source.load_records().await?;

        let diff = self.engine.diff(&live, &snapshot);
        let artifact = if write_artifact {
            Some(
                ExtractionWriter::new(&self.config.staging_path)
                    .persist(run_id, &diff)
                    .await?,
            )
        } else {
            None
        };

        let mut run = DiffRun {
            run_id,
            started_at,
            finished_at: Utc::now(),
            snapshot_source: snapshot_source.source_name(),
            live_source: live_source.source_name(),
            snapshot_records: snapshot.len(),
            live_records: live.len(),
            diff,
            artifact,
            report_dir: None,
        };
        run.report_dir = Some(self.reports.write_diff_report(&run).await?);
        Ok(run)
    }

    /// Apply the staged artifact. Per-record failures are reported in the result; only a
    /// missing or unreadable artifact is an error.
    pub async fn run_restore(&self, stop: Arc<AtomicBool>) -> Result<RestoreReport> {
        let artifact_path = self.config.staging_path.clone();
        let bytes = read_source(&artifact_path)?;
        let records = decode_staged(&artifact_path, &bytes)?;
        let artifact_check = verify_artifact(&artifact_path, &bytes).await?;
        if let ArtifactCheck::Edited { .. } = &artifact_check {
            warn!(path = %artifact_path.display(), "staged artifact changed since extraction; restoring reviewed content");
        }

        let run = RestoreUpserter::new(Arc::clone(&self.store), self.config.restore_concurrency)
            .with_stop_flag(stop)
            .restore(records)
            .await;

        let report_dir = match self
            .reports
            .write_restore_report(&run, &artifact_path, &artifact_check)
            .await
        {
            Ok(dir) => Some(dir),
            Err(err) => {
                warn!(%err, "failed to write restore report");
                None
            }
        };

        Ok(RestoreReport {
            run,
            artifact_path,
            artifact_check,
            report_dir,
        })
    }

    pub async fn plan_restore(&self) -> Result<Vec<PlannedRestore>> {
        let records = load_staged(&self.config.staging_path)?;
        let live = LiveFetcher::new(Arc::clone(&self.store)).fetch().await?;
        Ok(plan_restore(&records, &live))
    }
}
