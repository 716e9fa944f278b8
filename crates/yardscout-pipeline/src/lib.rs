//! Inventory reconciliation pipeline: normalize, reconcile, match, aggregate.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;
use yardscout_adapters::{adapter_for_yard, AdapterError, Harvest};
use yardscout_core::{
    parse_year, DateFilter, IdentityKey, InventoryRecord, RawCandidate, RowGroup, RowVehicle,
    RunContext, SourceDateFormat, WatchListEntry, YardSummary,
};
use yardscout_storage::{
    ArtifactStore, HttpClientConfig, HttpFetcher, InventoryStore, StoreError,
};

pub const CRATE_NAME: &str = "yardscout-pipeline";

/// Yard registry file (`yards.yaml` at the workspace root): which sources are
/// enabled and where their listings live.
#[derive(Debug, Clone, Deserialize)]
pub struct YardRegistry {
    pub yards: Vec<YardConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct YardConfig {
    pub yard_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub listing_url: String,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: String,
    pub artifacts_dir: PathBuf,
    pub retention_days: u32,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub workspace_root: PathBuf,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("YARDSCOUT_DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:cars.db?mode=rwc".to_string()),
            artifacts_dir: std::env::var("YARDSCOUT_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./artifacts")),
            retention_days: std::env::var("YARDSCOUT_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(15),
            user_agent: std::env::var("YARDSCOUT_USER_AGENT")
                .unwrap_or_else(|_| "yardscout/0.1".to_string()),
            http_timeout_secs: std::env::var("YARDSCOUT_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            workspace_root: PathBuf::from("."),
        }
    }
}

/// Structured outcome of one refresh run, surfaced to the trigger caller.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources_ok: usize,
    pub sources_failed: usize,
    pub parsed: usize,
    pub skipped: usize,
    pub inserted: usize,
    pub expired: usize,
    pub message: String,
}

/// Batch output of the normalizer: the records that passed validation plus a
/// count of discarded candidates.
#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub records: Vec<InventoryRecord>,
    pub skipped: usize,
}

fn parse_source_date(raw: &str, format: SourceDateFormat, today: NaiveDate) -> Option<NaiveDate> {
    let raw = raw.trim();
    match format {
        SourceDateFormat::MonthDayYear2 => NaiveDate::parse_from_str(raw, "%m/%d/%y").ok(),
        SourceDateFormat::MonthNameDayYear => NaiveDate::parse_from_str(raw, "%b %d, %Y").ok(),
        SourceDateFormat::AgeDays => {
            if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let age: i64 = raw.parse().ok()?;
            today.checked_sub_signed(ChronoDuration::days(age))
        }
    }
}

/// Validates and coerces one raw candidate into the canonical record shape.
/// A malformed date or year is a discard signal, never an error; `completed`
/// is always false at creation.
pub fn normalize_candidate(
    candidate: &RawCandidate,
    format: SourceDateFormat,
    today: NaiveDate,
) -> Option<InventoryRecord> {
    let year = parse_year(&candidate.year)?;
    let arrival_date = parse_source_date(&candidate.date, format, today)?;
    let make = yardscout_core::collapse_whitespace(&candidate.make);
    let model = yardscout_core::collapse_whitespace(&candidate.model);
    let row = yardscout_core::collapse_whitespace(&candidate.row);
    let yard = yardscout_core::collapse_whitespace(&candidate.yard);
    if make.is_empty() || model.is_empty() || row.is_empty() || yard.is_empty() {
        return None;
    }
    Some(InventoryRecord {
        year,
        make,
        model,
        row,
        arrival_date,
        yard,
        completed: false,
    })
}

pub fn normalize_batch(
    candidates: &[RawCandidate],
    format: SourceDateFormat,
    today: NaiveDate,
) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();
    for candidate in candidates {
        match normalize_candidate(candidate, format, today) {
            Some(record) => batch.records.push(record),
            None => batch.skipped += 1,
        }
    }
    batch
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("loading persisted inventory: {0}")]
    Load(#[source] StoreError),
    #[error("commit failed: {0}")]
    Commit(#[source] StoreError),
}

/// Delta computed against a snapshot of the persisted set. Pure, so the
/// dedup/expiry rules are testable without a store.
#[derive(Debug, Clone, Default)]
pub struct ReconcilePlan {
    pub expired: Vec<InventoryRecord>,
    pub inserts: Vec<InventoryRecord>,
    pub duplicate_count: usize,
    pub stale_count: usize,
}

/// Computes expirations and inserts for one batch of normalized candidates.
///
/// Expiry runs unconditionally so an empty fetch (source outage) still
/// retires aged-out records. The identity-key working set grows as inserts
/// are planned, so two identical candidates in one batch yield one insert.
/// Candidates already older than the cutoff are not inserted; they would
/// violate the retention invariant on the very run that added them.
pub fn plan_reconcile(
    existing: &[InventoryRecord],
    incoming: &[InventoryRecord],
    today: NaiveDate,
    retention_days: u32,
) -> ReconcilePlan {
    let cutoff = today - ChronoDuration::days(i64::from(retention_days));

    let mut plan = ReconcilePlan::default();
    let mut keys: HashSet<IdentityKey> = HashSet::new();
    for record in existing {
        if record.arrival_date < cutoff {
            plan.expired.push(record.clone());
        } else {
            keys.insert(record.identity_key());
        }
    }

    for candidate in incoming {
        if candidate.arrival_date < cutoff {
            plan.stale_count += 1;
            continue;
        }
        let key = candidate.identity_key();
        if keys.contains(&key) {
            plan.duplicate_count += 1;
            continue;
        }
        keys.insert(key);
        plan.inserts.push(candidate.clone());
    }

    plan
}

/// Applies [`plan_reconcile`] against the store as one atomic commit.
///
/// Callers must serialize invocations (the [`Pipeline`] holds a single-writer
/// lock around this): the plan is computed from a snapshot, and two racing
/// reconciliations over the same snapshot would double-insert.
pub async fn reconcile(
    store: &dyn InventoryStore,
    incoming: &[InventoryRecord],
    today: NaiveDate,
    retention_days: u32,
) -> Result<ReconcilePlan, ReconcileError> {
    let existing = store.load_all().await.map_err(ReconcileError::Load)?;
    let plan = plan_reconcile(&existing, incoming, today, retention_days);
    let delete_keys: Vec<IdentityKey> = plan.expired.iter().map(|r| r.identity_key()).collect();
    store
        .commit(&delete_keys, &plan.inserts)
        .await
        .map_err(ReconcileError::Commit)?;
    Ok(plan)
}

/// Filters inventory down to records matching any watch-list criterion.
///
/// The lookup maps `(lowercase make, lowercase model)` to every year range
/// declared for that pair; a record matches if its year falls in any of them,
/// with an absent bound treated as unbounded.
pub fn match_inventory(
    inventory: &[InventoryRecord],
    watch_list: &[WatchListEntry],
    filter: DateFilter,
    today: NaiveDate,
) -> Vec<InventoryRecord> {
    let mut ranges: HashMap<(String, String), Vec<(Option<u16>, Option<u16>)>> = HashMap::new();
    for entry in watch_list {
        ranges
            .entry((entry.make.to_lowercase(), entry.model.to_lowercase()))
            .or_default()
            .push((entry.min_year, entry.max_year));
    }

    let cutoff = filter.cutoff(today);
    inventory
        .iter()
        .filter(|record| cutoff.map_or(true, |c| record.arrival_date >= c))
        .filter(|record| {
            let pair = (record.make.to_lowercase(), record.model.to_lowercase());
            ranges.get(&pair).map_or(false, |bounds| {
                bounds.iter().any(|(min, max)| {
                    min.map_or(true, |m| record.year >= m)
                        && max.map_or(true, |m| record.year <= m)
                })
            })
        })
        .cloned()
        .collect()
}

fn row_sort_key(row: &str) -> (u8, i64, String) {
    match row.trim().parse::<i64>() {
        Ok(n) => (0, n, String::new()),
        Err(_) => (1, 0, row.to_string()),
    }
}

/// Groups matched records by yard then row, deduplicating vehicles by
/// `(make, model, year)` within each row. The dedup is key-based, so repeated
/// records from overlapping scrape batches never double-count; a vehicle
/// shows as completed if any backing record is.
pub fn aggregate(matched: &[InventoryRecord]) -> BTreeMap<String, YardSummary> {
    let mut yards: BTreeMap<String, BTreeMap<String, BTreeMap<(String, String, u16), RowVehicle>>> =
        BTreeMap::new();
    for record in matched {
        let triple = (
            record.make.to_lowercase(),
            record.model.to_lowercase(),
            record.year,
        );
        let row_entry = yards
            .entry(record.yard.clone())
            .or_default()
            .entry(record.row.clone())
            .or_default();
        match row_entry.get_mut(&triple) {
            Some(vehicle) => vehicle.completed |= record.completed,
            None => {
                row_entry.insert(
                    triple,
                    RowVehicle {
                        make: record.make.clone(),
                        model: record.model.clone(),
                        year: record.year,
                        completed: record.completed,
                    },
                );
            }
        }
    }

    yards
        .into_iter()
        .map(|(yard, rows)| {
            let mut row_groups: Vec<RowGroup> = rows
                .into_iter()
                .map(|(row, vehicles)| RowGroup {
                    row,
                    vehicles: vehicles.into_values().collect(),
                })
                .collect();
            row_groups.sort_by_key(|group| row_sort_key(&group.row));
            let hot_wheels_count = row_groups.iter().map(|g| g.vehicles.len()).sum();
            (
                yard,
                YardSummary {
                    hot_wheels_count,
                    rows: row_groups,
                },
            )
        })
        .collect()
}

/// Case-insensitive substring search across every displayed field.
pub fn search_records(records: &[InventoryRecord], query: &str) -> Vec<InventoryRecord> {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return records.to_vec();
    }
    records
        .iter()
        .filter(|r| {
            r.year.to_string().contains(&needle)
                || r.make.to_lowercase().contains(&needle)
                || r.model.to_lowercase().contains(&needle)
                || r.row.to_lowercase().contains(&needle)
                || r.yard.to_lowercase().contains(&needle)
        })
        .cloned()
        .collect()
}

struct FetchedYard {
    body: String,
    harvest: Harvest,
    format: SourceDateFormat,
}

/// Orchestrates one refresh: concurrent fetches, archive, normalize,
/// reconcile. The reconcile gate keeps at most one read-modify-write in
/// flight; reads through the store stay concurrent and snapshot-consistent.
pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<dyn InventoryStore>,
    artifacts: ArtifactStore,
    http: Arc<HttpFetcher>,
    reconcile_gate: Mutex<()>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, store: Arc<dyn InventoryStore>) -> Result<Self> {
        let artifacts = ArtifactStore::new(config.artifacts_dir.clone());
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Self {
            config,
            store,
            artifacts,
            http: Arc::new(http),
            reconcile_gate: Mutex::new(()),
        })
    }

    pub fn store(&self) -> Arc<dyn InventoryStore> {
        Arc::clone(&self.store)
    }

    pub fn retention_days(&self) -> u32 {
        self.config.retention_days
    }

    async fn load_registry(&self) -> Result<YardRegistry> {
        let path = self.config.workspace_root.join("yards.yaml");
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Full fetch → normalize → reconcile run. One source failing degrades
    /// the run to the remaining sources; only a commit failure aborts it.
    pub async fn run_once(&self) -> Result<RefreshSummary> {
        let started_at = Utc::now();
        let ctx = RunContext {
            run_id: Uuid::new_v4(),
            today: started_at.date_naive(),
        };

        let registry = self.load_registry().await?;
        let enabled: Vec<YardConfig> = registry.yards.into_iter().filter(|y| y.enabled).collect();

        let mut handles = Vec::new();
        for yard in &enabled {
            let adapter = adapter_for_yard(&yard.yard_id)
                .with_context(|| format!("no adapter registered for {}", yard.yard_id))?;
            let http = Arc::clone(&self.http);
            let url = yard.listing_url.clone();
            let task_ctx = ctx;
            handles.push((
                yard.yard_id.clone(),
                tokio::spawn(async move {
                    let body = adapter.fetch_listing(&http, &task_ctx, &url).await?;
                    let harvest = adapter.parse_listing(&body)?;
                    Ok::<FetchedYard, AdapterError>(FetchedYard {
                        body,
                        harvest,
                        format: adapter.date_format(),
                    })
                }),
            ));
        }

        let mut sources_ok = 0usize;
        let mut sources_failed = 0usize;
        let mut parsed = 0usize;
        let mut skipped = 0usize;
        let mut failures = Vec::new();
        let mut normalized = Vec::new();

        for (yard_id, handle) in handles {
            match handle.await {
                Ok(Ok(fetched)) => {
                    sources_ok += 1;
                    if let Err(err) = self
                        .artifacts
                        .store_listing(started_at, &yard_id, fetched.body.as_bytes())
                        .await
                    {
                        warn!(yard = %yard_id, error = %err, "archiving raw listing failed");
                    }
                    parsed += fetched.harvest.candidates.len();
                    skipped += fetched.harvest.skipped;
                    let batch = normalize_batch(&fetched.harvest.candidates, fetched.format, ctx.today);
                    skipped += batch.skipped;
                    normalized.extend(batch.records);
                }
                Ok(Err(err)) => {
                    sources_failed += 1;
                    warn!(yard = %yard_id, error = %err, "source fetch failed");
                    failures.push(format!("{yard_id}: {err}"));
                }
                // A panicked or cancelled task loses only its own source.
                Err(err) => {
                    sources_failed += 1;
                    warn!(yard = %yard_id, error = %err, "fetch task aborted");
                    failures.push(format!("{yard_id}: {err}"));
                }
            }
        }

        let plan = {
            let _writer = self.reconcile_gate.lock().await;
            reconcile(
                self.store.as_ref(),
                &normalized,
                ctx.today,
                self.config.retention_days,
            )
            .await?
        };

        skipped += plan.stale_count;
        let finished_at = Utc::now();
        let message = if failures.is_empty() {
            format!(
                "{} sources ok; {} inserted, {} expired, {} duplicate, {} skipped",
                sources_ok,
                plan.inserts.len(),
                plan.expired.len(),
                plan.duplicate_count,
                skipped
            )
        } else {
            format!(
                "{} sources ok, {} failed ({}); {} inserted, {} expired",
                sources_ok,
                sources_failed,
                failures.join("; "),
                plan.inserts.len(),
                plan.expired.len()
            )
        };

        Ok(RefreshSummary {
            run_id: ctx.run_id,
            started_at,
            finished_at,
            sources_ok,
            sources_failed,
            parsed,
            skipped,
            inserted: plan.inserts.len(),
            expired: plan.expired.len(),
            message,
        })
    }

    /// Watch-list query: match current inventory, then group by yard and row.
    pub async fn scavenger_view(
        &self,
        filter: DateFilter,
    ) -> Result<BTreeMap<String, YardSummary>> {
        let inventory = self.store.load_all().await?;
        let watch_list = self.store.load_watch_list().await?;
        let today = Utc::now().date_naive();
        Ok(aggregate(&match_inventory(
            &inventory,
            &watch_list,
            filter,
            today,
        )))
    }

    /// Records inside the retention window, newest arrivals first.
    pub async fn recent_inventory(&self) -> Result<Vec<InventoryRecord>> {
        let cutoff =
            Utc::now().date_naive() - ChronoDuration::days(i64::from(self.config.retention_days));
        let mut records: Vec<InventoryRecord> = self
            .store
            .load_all()
            .await?
            .into_iter()
            .filter(|r| r.arrival_date >= cutoff)
            .collect();
        records.sort_by(|a, b| b.arrival_date.cmp(&a.arrival_date));
        Ok(records)
    }

    pub async fn search(&self, query: &str) -> Result<Vec<InventoryRecord>> {
        let records = self.store.load_all().await?;
        Ok(search_records(&records, query))
    }
}
