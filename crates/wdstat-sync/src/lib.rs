//! Sync pipeline orchestration: discovery, per-entity reconciliation, batched
//! submission, reference repair and progress bookkeeping.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;
use wdstat_core::properties::{AREA, POPULATION};
use wdstat_core::{AreaKind, Change, Dataset, EntityRecord};
use wdstat_reconcile::{reconcile, repair_references, resolve_area, ReconcileConfig, ReconcileError};
use wdstat_storage::remote::{DEFAULT_API_URL, DEFAULT_QUERY_URL};
use wdstat_storage::{
    flags, load_dataset_for, BindingRow, ProgressStore, RemoteApi, RemoteClientConfig, RemoteError,
    RetryPolicy, WikibaseClient,
};

pub const CRATE_NAME: &str = "wdstat-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_url: String,
    pub query_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Account named in the bot assertion; defaults to `username`.
    pub bot_user: Option<String>,
    pub progress_path: PathBuf,
    pub dataset_dir: PathBuf,
    pub fetch_delay_ms: u64,
    pub repair_delay_ms: u64,
    pub edit_batch_size: usize,
    pub repair_batch_size: usize,
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let username = std::env::var("WDSTAT_USER").ok().filter(|v| !v.is_empty());
        Self {
            api_url: std::env::var("WDSTAT_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string()),
            query_url: std::env::var("WDSTAT_QUERY_URL")
                .unwrap_or_else(|_| DEFAULT_QUERY_URL.to_string()),
            user_agent: std::env::var("WDSTAT_USER_AGENT")
                .unwrap_or_else(|_| "wdstat-bot/0.1".to_string()),
            http_timeout_secs: env_parse("WDSTAT_HTTP_TIMEOUT_SECS", 30),
            bot_user: std::env::var("WDSTAT_BOT_USER")
                .ok()
                .filter(|v| !v.is_empty())
                .or_else(|| username.clone()),
            username,
            password: std::env::var("WDSTAT_PASSWORD").ok().filter(|v| !v.is_empty()),
            progress_path: std::env::var("WDSTAT_PROGRESS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./progress.json")),
            dataset_dir: std::env::var("WDSTAT_DATASET_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            fetch_delay_ms: env_parse("WDSTAT_FETCH_DELAY_MS", 1000),
            repair_delay_ms: env_parse("WDSTAT_REPAIR_DELAY_MS", 2000),
            edit_batch_size: env_parse("WDSTAT_EDIT_BATCH_SIZE", 6),
            repair_batch_size: env_parse("WDSTAT_REPAIR_BATCH_SIZE", 4),
        }
    }

    pub fn remote_client_config(&self) -> RemoteClientConfig {
        RemoteClientConfig {
            api_url: self.api_url.clone(),
            query_url: self.query_url.clone(),
            user_agent: self.user_agent.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            bot_user: self.bot_user.clone(),
            maxlag: 5,
            retry: RetryPolicy::default(),
        }
    }

    pub fn sync_settings(&self, kind: AreaKind) -> RunSettings {
        RunSettings {
            kind,
            delay: Duration::from_millis(self.fetch_delay_ms),
            batch_size: self.edit_batch_size,
        }
    }

    pub fn repair_settings(&self, kind: AreaKind) -> RunSettings {
        RunSettings {
            kind,
            delay: Duration::from_millis(self.repair_delay_ms),
            batch_size: self.repair_batch_size,
        }
    }
}

/// Per-run knobs shared by the sync and reference-repair loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSettings {
    pub kind: AreaKind,
    /// Courtesy pause between successive entity fetches.
    pub delay: Duration,
    pub batch_size: usize,
}

/// Submits `changes` in consecutive groups of at most `max_batch`, one after another.
/// Returns the number of submissions made. Groups already sent stay committed when a
/// later group fails.
/// A submission that stopped part way. The first `committed` changes were accepted.
#[derive(Debug, Error)]
#[error("batch {batch} failed after {committed} committed changes: {source}")]
pub struct BatchError {
    pub batch: usize,
    pub committed: usize,
    pub source: RemoteError,
}

pub async fn submit_in_batches(
    remote: &dyn RemoteApi,
    entity_id: &str,
    changes: &[Change],
    max_batch: usize,
) -> Result<usize, BatchError> {
    let mut submissions = 0usize;
    let mut committed = 0usize;
    for batch in changes.chunks(max_batch.max(1)) {
        if let Err(source) = remote.submit_edit(entity_id, batch).await {
            return Err(BatchError {
                batch: submissions + 1,
                committed,
                source,
            });
        }
        submissions += 1;
        committed += batch.len();
        info!(entity = entity_id, batch = submissions, size = batch.len(), "batch submitted");
    }
    Ok(submissions)
}

/// Built-in discovery queries over the query endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoveryQuery {
    WithoutPopulation,
    WithoutArea,
    PopulationWithoutReferences,
    AreaWithoutReferences,
}

impl DiscoveryQuery {
    pub const ALL: [Self; 4] = [
        Self::WithoutPopulation,
        Self::WithoutArea,
        Self::PopulationWithoutReferences,
        Self::AreaWithoutReferences,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WithoutPopulation => "without-population",
            Self::WithoutArea => "without-area",
            Self::PopulationWithoutReferences => "population-without-references",
            Self::AreaWithoutReferences => "area-without-references",
        }
    }

    pub fn sparql(&self, kind: AreaKind) -> String {
        let code = kind.code_property();
        match self {
            Self::WithoutPopulation => missing_statement_query(code, POPULATION),
            Self::WithoutArea => missing_statement_query(code, AREA),
            Self::PopulationWithoutReferences => unreferenced_statement_query(code, POPULATION),
            Self::AreaWithoutReferences => unreferenced_statement_query(code, AREA),
        }
    }
}

impl fmt::Display for DiscoveryQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiscoveryQuery {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|q| q.as_str() == wanted)
            .ok_or_else(|| {
                let known: Vec<&str> = Self::ALL.iter().map(DiscoveryQuery::as_str).collect();
                format!("unknown query `{s}` (expected one of {})", known.join(", "))
            })
    }
}

fn missing_statement_query(code_property: &str, metric_property: &str) -> String {
    format!(
        r#"
 SELECT DISTINCT ?item ?itemLabel WHERE {{
  ?item wdt:{code_property} ?areaCode .

  FILTER (!isBlank(?areaCode)) .
  FILTER NOT EXISTS {{
    ?item wdt:{metric_property} ?value .
  }}

  SERVICE wikibase:label {{
    bd:serviceParam wikibase:language "en" .
  }}
 }}
"#
    )
}

fn unreferenced_statement_query(code_property: &str, metric_property: &str) -> String {
    format!(
        r#"
  SELECT DISTINCT ?item ?itemLabel WHERE {{
    ?item p:{metric_property} ?statement .
    ?item wdt:{code_property} ?areaCode .

    FILTER (!isBlank(?areaCode)) .
    FILTER NOT EXISTS {{
      ?statement prov:wasDerivedFrom ?ref .
    }}

    SERVICE wikibase:label {{
      bd:serviceParam wikibase:language "en" .
    }}
  }}
"#
    )
}

/// Reduces an entity URI such as `http://www.wikidata.org/entity/Q42` to `Q42`.
pub fn entity_id_from_uri(uri: &str) -> Option<String> {
    let tail = uri.trim().rsplit('/').next()?;
    let digits = tail.strip_prefix('Q')?;
    if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        Some(tail.to_string())
    } else {
        None
    }
}

/// Candidate ids from query rows, in result order without duplicates.
pub fn candidate_ids(rows: &[BindingRow]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    rows.iter()
        .filter_map(|row| row.get("item"))
        .filter_map(|binding| entity_id_from_uri(&binding.value))
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

pub async fn discover(client: &WikibaseClient, kind: AreaKind, query: DiscoveryQuery) -> Result<Vec<String>> {
    let rows = client
        .run_query(&query.sparql(kind))
        .await
        .with_context(|| format!("running discovery query {query}"))?;
    let ids = candidate_ids(&rows);
    info!(kind = %kind, query = %query, candidates = ids.len(), "discovery complete");
    Ok(ids)
}

/// What happened to one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EntityOutcome {
    Updated { changes: usize, submissions: usize },
    Unchanged,
    Skipped { reason: String },
}

fn record_skip(record: &mut EntityRecord, err: &ReconcileError) {
    record.error = Some(err.to_string());
    if let Some((property, claims)) = err.review_claims() {
        record
            .review_claims
            .insert(property.to_string(), claims.to_vec());
    }
}

/// Fetches, reconciles and submits one entity, then records the outcome.
///
/// Validation and ambiguous-data problems are recorded and yield `Skipped`;
/// remote and storage failures are returned as errors.
pub async fn sync_entity(
    remote: &dyn RemoteApi,
    store: &mut ProgressStore,
    dataset: &Dataset,
    config: &ReconcileConfig,
    entity_id: &str,
    batch_size: usize,
) -> Result<EntityOutcome> {
    let entity = remote
        .fetch_entity(entity_id)
        .await
        .with_context(|| format!("fetching {entity_id}"))?;

    let mut record = EntityRecord::new(&entity.id, config.kind, Utc::now());
    record.labels = entity.labels.clone();

    let resolved = resolve_area(&entity, config.kind, dataset)
        .and_then(|(code, area)| reconcile(&entity, area, config).map(|r| (code, area, r)));
    let (code, area, reconciliation) = match resolved {
        Ok(resolved) => resolved,
        Err(err) => {
            warn!(entity = %entity.id, error = %err, category = ?err.category(), "entity skipped");
            record_skip(&mut record, &err);
            if let ReconcileError::AreaMissing { code, .. } = &err {
                record.area_code = Some(code.clone());
            }
            store.upsert(record).await?;
            return Ok(EntityOutcome::Skipped {
                reason: err.to_string(),
            });
        }
    };

    record.area_code = Some(code);
    record.name = Some(area.trimmed_name().to_string());
    record.municipality = Some(area.municipality.clone());

    let diagnostics = &reconciliation.diagnostics;
    if let Some(mismatch) = &diagnostics.label_mismatch {
        warn!(entity = %entity.id, dataset = %mismatch.dataset_name, remote = ?mismatch.remote_label, "label does not match dataset name");
    }
    if diagnostics.needs_review() {
        warn!(entity = %entity.id, notes = diagnostics.notes.len(), "claims need manual review");
    }
    if diagnostics.located_in_claims == 0 || diagnostics.municipality_code_claims == 0 {
        info!(
            entity = %entity.id,
            located_in = diagnostics.located_in_claims,
            municipality_code = diagnostics.municipality_code_claims,
            "administrative claims incomplete"
        );
    }

    let changes = reconciliation.changes;
    let submissions = match submit_in_batches(remote, &entity.id, &changes, batch_size).await {
        Ok(submissions) => submissions,
        Err(err) => {
            if err.committed > 0 {
                warn!(entity = %entity.id, committed = err.committed, "recording partial submission");
                record.changed = true;
                record.error = Some(err.to_string());
                record.edits = changes[..err.committed].to_vec();
                store.upsert(record).await?;
            }
            return Err(anyhow::Error::new(err).context(format!("submitting changes for {}", entity.id)));
        }
    };

    record.changed = !changes.is_empty();
    record.flags.insert(flags::REFERENCES_CORRECTED.to_string());
    let outcome = if changes.is_empty() {
        EntityOutcome::Unchanged
    } else {
        info!(entity = %entity.id, changes = changes.len(), submissions, "entity updated");
        EntityOutcome::Updated {
            changes: changes.len(),
            submissions,
        }
    };
    record.edits = changes;
    store.upsert(record).await?;
    Ok(outcome)
}

/// Re-attaches canonical references to claims created by earlier runs, then
/// marks the record so it is not visited again.
pub async fn repair_entity(
    remote: &dyn RemoteApi,
    store: &mut ProgressStore,
    dataset: &Dataset,
    config: &ReconcileConfig,
    entity_id: &str,
    batch_size: usize,
) -> Result<EntityOutcome> {
    let applied = store
        .get(entity_id)
        .map(|record| record.edits.clone())
        .with_context(|| format!("no progress record for {entity_id}"))?;
    let entity = remote
        .fetch_entity(entity_id)
        .await
        .with_context(|| format!("fetching {entity_id}"))?;

    let area = match resolve_area(&entity, config.kind, dataset) {
        Ok((_, area)) => area,
        Err(err) => {
            warn!(entity = %entity.id, error = %err, "cannot repair references");
            return Ok(EntityOutcome::Skipped {
                reason: err.to_string(),
            });
        }
    };

    let changes = repair_references(&entity, area, &applied, config);
    let submissions = submit_in_batches(remote, &entity.id, &changes, batch_size)
        .await
        .with_context(|| format!("submitting reference repairs for {}", entity.id))?;
    store
        .mark_complete(entity_id, flags::CHANGES_REFERENCES_CORRECTED, Utc::now())
        .await?;

    if changes.is_empty() {
        Ok(EntityOutcome::Unchanged)
    } else {
        info!(entity = %entity.id, repaired = changes.len(), "references repaired");
        Ok(EntityOutcome::Updated {
            changes: changes.len(),
            submissions,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Aborted { entity: String, error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub kind: AreaKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub candidates: usize,
    pub processed: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub changes_submitted: usize,
    pub submissions: usize,
    pub status: RunStatus,
}

impl SyncRunSummary {
    fn start(kind: AreaKind, candidates: usize) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            kind,
            started_at: now,
            finished_at: now,
            candidates,
            processed: 0,
            updated: 0,
            unchanged: 0,
            skipped: 0,
            changes_submitted: 0,
            submissions: 0,
            status: RunStatus::Completed,
        }
    }

    fn record(&mut self, outcome: &EntityOutcome) {
        self.processed += 1;
        match outcome {
            EntityOutcome::Updated {
                changes,
                submissions,
            } => {
                self.updated += 1;
                self.changes_submitted += changes;
                self.submissions += submissions;
            }
            EntityOutcome::Unchanged => self.unchanged += 1,
            EntityOutcome::Skipped { .. } => self.skipped += 1,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

impl fmt::Display for SyncRunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match &self.status {
            RunStatus::Completed => "complete".to_string(),
            RunStatus::Aborted { entity, error } => format!("aborted at {entity}: {error}"),
        };
        write!(
            f,
            "run {} ({}) {status}: candidates={} processed={} updated={} unchanged={} skipped={} changes={} submissions={}",
            self.run_id,
            self.kind,
            self.candidates,
            self.processed,
            self.updated,
            self.unchanged,
            self.skipped,
            self.changes_submitted,
            self.submissions
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Workflow {
    Sync,
    RepairReferences,
}

/// Walks `ids` one entity at a time. The first remote or storage failure halts the run.
async fn drive(
    workflow: Workflow,
    remote: &dyn RemoteApi,
    store: &mut ProgressStore,
    dataset: &Dataset,
    settings: &RunSettings,
    ids: &[String],
) -> SyncRunSummary {
    let config = ReconcileConfig::for_kind(settings.kind);
    let mut summary = SyncRunSummary::start(settings.kind, ids.len());

    for (index, entity_id) in ids.iter().enumerate() {
        if index > 0 && !settings.delay.is_zero() {
            tokio::time::sleep(settings.delay).await;
        }
        let span = info_span!("entity", entity = %entity_id, kind = %settings.kind);
        let result = match workflow {
            Workflow::Sync => {
                sync_entity(remote, store, dataset, &config, entity_id, settings.batch_size)
                    .instrument(span)
                    .await
            }
            Workflow::RepairReferences => {
                repair_entity(remote, store, dataset, &config, entity_id, settings.batch_size)
                    .instrument(span)
                    .await
            }
        };
        match result {
            Ok(outcome) => summary.record(&outcome),
            Err(err) => {
                error!(entity = %entity_id, error = %format!("{err:#}"), "run aborted");
                summary.status = RunStatus::Aborted {
                    entity: entity_id.clone(),
                    error: format!("{err:#}"),
                };
                break;
            }
        }
    }

    summary.finished_at = Utc::now();
    if summary.is_completed() {
        info!(
            processed = summary.processed,
            updated = summary.updated,
            skipped = summary.skipped,
            "run complete"
        );
    }
    summary
}

pub async fn run_sync(
    remote: &dyn RemoteApi,
    store: &mut ProgressStore,
    dataset: &Dataset,
    settings: &RunSettings,
    ids: &[String],
) -> SyncRunSummary {
    drive(Workflow::Sync, remote, store, dataset, settings, ids).await
}

/// Entities of `kind` with applied edits whose references have not been repaired yet.
pub fn pending_reference_repairs(store: &ProgressStore, kind: AreaKind) -> Vec<String> {
    store.find_pending(|record| {
        record.kind == kind
            && !record.edits.is_empty()
            && !record.has_flag(flags::CHANGES_REFERENCES_CORRECTED)
    })
}

pub async fn run_reference_repair(
    remote: &dyn RemoteApi,
    store: &mut ProgressStore,
    dataset: &Dataset,
    settings: &RunSettings,
) -> SyncRunSummary {
    let ids = pending_reference_repairs(store, settings.kind);
    info!(kind = %settings.kind, pending = ids.len(), "reference repair starting");
    drive(Workflow::RepairReferences, remote, store, dataset, settings, &ids).await
}

/// Candidate selection for a sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub skip: usize,
    pub take: Option<usize>,
    /// Revisit entities whose previous sync already completed.
    pub include_complete: bool,
}

/// Deduplicates `ids`, drops completed entities unless asked not to, then applies skip/take.
pub fn select_candidates(ids: Vec<String>, store: &ProgressStore, selection: &Selection) -> Vec<String> {
    let mut seen = BTreeSet::new();
    ids.into_iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty() && seen.insert(id.clone()))
        .filter(|id| {
            selection.include_complete
                || !store
                    .get(id)
                    .is_some_and(|record| record.has_flag(flags::REFERENCES_CORRECTED))
        })
        .skip(selection.skip)
        .take(selection.take.unwrap_or(usize::MAX))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateSource {
    Ids(Vec<String>),
    Query(DiscoveryQuery),
}

async fn connect(config: &SyncConfig) -> Result<WikibaseClient> {
    let (Some(username), Some(password)) = (&config.username, &config.password) else {
        bail!("WDSTAT_USER and WDSTAT_PASSWORD must be set for write runs");
    };
    let client = WikibaseClient::new(config.remote_client_config())?;
    client
        .authenticate(username, password)
        .await
        .context("logging in")?;
    Ok(client)
}

pub async fn run_sync_from_env(
    kind: AreaKind,
    source: CandidateSource,
    selection: Selection,
) -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let dataset = load_dataset_for(&config.dataset_dir, kind).await?;
    let mut store = ProgressStore::open(&config.progress_path).await?;
    let client = connect(&config).await?;

    let ids = match source {
        CandidateSource::Ids(ids) => ids,
        CandidateSource::Query(query) => discover(&client, kind, query).await?,
    };
    let ids = select_candidates(ids, &store, &selection);
    info!(kind = %kind, candidates = ids.len(), "sync starting");
    Ok(run_sync(&client, &mut store, &dataset, &config.sync_settings(kind), &ids).await)
}

pub async fn run_reference_repair_from_env(kind: AreaKind) -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let dataset = load_dataset_for(&config.dataset_dir, kind).await?;
    let mut store = ProgressStore::open(&config.progress_path).await?;
    let client = connect(&config).await?;
    Ok(run_reference_repair(&client, &mut store, &dataset, &config.repair_settings(kind)).await)
}

pub async fn discover_from_env(kind: AreaKind, query: DiscoveryQuery) -> Result<Vec<String>> {
    let config = SyncConfig::from_env();
    let client = WikibaseClient::new(config.remote_client_config())?;
    discover(&client, kind, query).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tempfile::{tempdir, TempDir};
    use tokio::time::Instant;
    use wdstat_core::properties::{COUNTRY, STATED_IN, URBAN_AREA_CODE};
    use wdstat_core::{Area, Claim, Label, Reference, RemoteEntity, Snak};
    use wdstat_reconcile::{YearTable, LOCALITIES_2010, RETRIEVED_AT, STATISTICS_DATABASE};
    use wdstat_storage::Binding;

    #[derive(Default)]
    struct FakeRemote {
        entities: BTreeMap<String, RemoteEntity>,
        fetched: Mutex<Vec<String>>,
        submitted: Mutex<Vec<(String, Vec<Change>)>>,
        failures: Mutex<VecDeque<bool>>,
    }

    impl FakeRemote {
        fn with(entities: Vec<RemoteEntity>) -> Self {
            Self {
                entities: entities.into_iter().map(|e| (e.id.clone(), e)).collect(),
                ..Self::default()
            }
        }

        /// Scripts submit results in order; `true` fails that call.
        fn failing(self, script: &[bool]) -> Self {
            *self.failures.lock().unwrap() = script.iter().copied().collect();
            self
        }

        fn submissions(&self) -> Vec<(String, Vec<Change>)> {
            self.submitted.lock().unwrap().clone()
        }

        fn fetched(&self) -> Vec<String> {
            self.fetched.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RemoteApi for FakeRemote {
        async fn fetch_entity(&self, id: &str) -> Result<RemoteEntity, RemoteError> {
            self.fetched.lock().unwrap().push(id.to_string());
            self.entities
                .get(id)
                .cloned()
                .ok_or_else(|| RemoteError::MissingEntity(id.to_string()))
        }

        async fn submit_edit(&self, id: &str, changes: &[Change]) -> Result<(), RemoteError> {
            if self.failures.lock().unwrap().pop_front().unwrap_or(false) {
                return Err(RemoteError::RetriesExhausted {
                    attempts: 10,
                    status: Some(503),
                    body: "unavailable".to_string(),
                });
            }
            self.submitted
                .lock()
                .unwrap()
                .push((id.to_string(), changes.to_vec()));
            Ok(())
        }
    }

    fn claim(id: &str, mainsnak: Snak) -> Claim {
        let mut claim = Claim::new(mainsnak, Vec::new(), Vec::new());
        claim.id = Some(id.to_string());
        claim
    }

    fn locality(id: &str, country: u64, code: &str) -> RemoteEntity {
        let mut claims = BTreeMap::new();
        claims.insert(
            COUNTRY.to_string(),
            vec![claim(&format!("{id}$c"), Snak::item(COUNTRY, country))],
        );
        claims.insert(
            URBAN_AREA_CODE.to_string(),
            vec![claim(&format!("{id}$a"), Snak::string(URBAN_AREA_CODE, code))],
        );
        let mut labels = BTreeMap::new();
        labels.insert(
            "sv".to_string(),
            Label {
                language: "sv".to_string(),
                value: "Ankeborg".to_string(),
            },
        );
        RemoteEntity {
            id: id.to_string(),
            labels,
            descriptions: BTreeMap::new(),
            claims,
        }
    }

    fn dataset() -> Dataset {
        let mut population = BTreeMap::new();
        population.insert("05".to_string(), Some(1100.0));
        population.insert("10".to_string(), Some(1200.0));
        Dataset::from_areas([Area {
            code: "T0001".to_string(),
            name: "Ankeborg ".to_string(),
            municipality: "Ankeborg".to_string(),
            population,
            area: BTreeMap::new(),
        }])
    }

    async fn store() -> (TempDir, ProgressStore) {
        let dir = tempdir().unwrap();
        let store = ProgressStore::open(dir.path().join("progress.json")).await.unwrap();
        (dir, store)
    }

    fn settings(batch_size: usize) -> RunSettings {
        RunSettings {
            kind: AreaKind::Urban,
            delay: Duration::ZERO,
            batch_size,
        }
    }

    fn labels(n: usize) -> Vec<Change> {
        (0..n).map(|i| Change::add_label("en", &format!("label {i}"))).collect()
    }

    #[tokio::test]
    async fn batches_are_sequential_bounded_and_ordered() {
        let remote = FakeRemote::default();
        let changes = labels(13);
        let submissions = submit_in_batches(&remote, "Q1", &changes, 6).await.unwrap();
        assert_eq!(submissions, 3);

        let sent = remote.submissions();
        let sizes: Vec<usize> = sent.iter().map(|(_, batch)| batch.len()).collect();
        assert_eq!(sizes, vec![6, 6, 1]);
        let flattened: Vec<Change> = sent.into_iter().flat_map(|(_, batch)| batch).collect();
        assert_eq!(flattened, changes);
    }

    #[tokio::test]
    async fn empty_change_list_submits_nothing_and_zero_batch_means_one() {
        let remote = FakeRemote::default();
        assert_eq!(submit_in_batches(&remote, "Q1", &[], 6).await.unwrap(), 0);
        assert_eq!(submit_in_batches(&remote, "Q1", &labels(3), 0).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn failed_batch_keeps_earlier_batches_and_stops() {
        let remote = FakeRemote::default().failing(&[false, true]);
        let err = submit_in_batches(&remote, "Q1", &labels(12), 4).await.unwrap_err();
        assert!(matches!(err.source, RemoteError::RetriesExhausted { .. }));
        assert_eq!(err.batch, 2);
        assert_eq!(err.committed, 4);
        assert_eq!(remote.submissions().len(), 1);
    }

    #[tokio::test]
    async fn missing_dataset_entry_is_recorded_without_writes() {
        let remote = FakeRemote::with(vec![locality("Q1", 34, "0009")]);
        let (_dir, mut store) = store().await;
        let config = ReconcileConfig::for_kind(AreaKind::Urban);

        let outcome = sync_entity(&remote, &mut store, &dataset(), &config, "Q1", 6)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            EntityOutcome::Skipped {
                reason: "urbanArea missing".to_string()
            }
        );
        assert!(remote.submissions().is_empty());
        let record = store.get("Q1").unwrap();
        assert_eq!(record.error.as_deref(), Some("urbanArea missing"));
        assert_eq!(record.area_code.as_deref(), Some("T0009"));
        let kept = &record.review_claims[URBAN_AREA_CODE];
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].mainsnak.string_value(), Some("0009"));
    }

    #[tokio::test]
    async fn wrong_country_is_recorded_with_claims_for_review() {
        let remote = FakeRemote::with(vec![locality("Q1", 20, "T0001")]);
        let (_dir, mut store) = store().await;
        let config = ReconcileConfig::for_kind(AreaKind::Urban);

        let outcome = sync_entity(&remote, &mut store, &dataset(), &config, "Q1", 6)
            .await
            .unwrap();
        assert!(matches!(outcome, EntityOutcome::Skipped { ref reason } if reason == "not in sweden"));
        assert!(remote.submissions().is_empty());
        let record = store.get("Q1").unwrap();
        assert_eq!(record.error.as_deref(), Some("not in sweden"));
        assert_eq!(record.review_claims[COUNTRY].len(), 1);
        assert!(!record.has_flag(flags::REFERENCES_CORRECTED));
    }

    #[tokio::test]
    async fn matched_entity_is_updated_and_recorded() {
        let remote = FakeRemote::with(vec![locality("Q1", 34, "T0001")]);
        let (_dir, mut store) = store().await;
        let config = ReconcileConfig::for_kind(AreaKind::Urban);

        let outcome = sync_entity(&remote, &mut store, &dataset(), &config, "Q1", 2)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            EntityOutcome::Updated {
                changes: 3,
                submissions: 2
            }
        );

        let sent = remote.submissions();
        assert_eq!(sent[0].1[0], Change::add_label("en", "Ankeborg"));
        let record = store.get("Q1").unwrap();
        assert!(record.changed);
        assert_eq!(record.edits.len(), 3);
        assert_eq!(record.name.as_deref(), Some("Ankeborg"));
        assert!(record.edits_digest.is_some());
        assert!(record.has_flag(flags::REFERENCES_CORRECTED));
    }

    #[tokio::test]
    async fn remote_failure_aborts_the_run() {
        let remote = FakeRemote::with(vec![
            locality("Q1", 34, "T0001"),
            locality("Q2", 34, "T0001"),
        ])
        .failing(&[true]);
        let (_dir, mut store) = store().await;
        let ids = vec!["Q1".to_string(), "Q2".to_string()];

        let summary = run_sync(&remote, &mut store, &dataset(), &settings(6), &ids).await;
        assert!(matches!(summary.status, RunStatus::Aborted { ref entity, .. } if entity == "Q1"));
        assert_eq!(summary.processed, 0);
        assert_eq!(remote.fetched(), vec!["Q1".to_string()]);
        assert!(store.get("Q1").is_none());
    }

    #[tokio::test]
    async fn partially_submitted_entity_records_committed_prefix() {
        let remote = FakeRemote::with(vec![locality("Q1", 34, "T0001")]).failing(&[false, true]);
        let (_dir, mut store) = store().await;
        let config = ReconcileConfig::for_kind(AreaKind::Urban);

        let err = sync_entity(&remote, &mut store, &dataset(), &config, "Q1", 2)
            .await
            .unwrap_err();
        let batch = err.downcast_ref::<BatchError>().unwrap();
        assert_eq!(batch.committed, 2);

        let sent = remote.submissions();
        assert_eq!(sent.len(), 1);
        let record = store.get("Q1").unwrap();
        assert!(record.changed);
        assert_eq!(record.edits, sent[0].1);
        assert!(record.edits_digest.is_some());
        assert!(record.error.as_deref().unwrap().contains("batch 2"));
        assert!(!record.has_flag(flags::REFERENCES_CORRECTED));
    }

    #[tokio::test]
    async fn skipped_entities_do_not_abort_the_run() {
        let remote = FakeRemote::with(vec![
            locality("Q1", 20, "T0001"),
            locality("Q2", 34, "T0001"),
        ]);
        let (_dir, mut store) = store().await;
        let ids = vec!["Q1".to_string(), "Q2".to_string()];

        let summary = run_sync(&remote, &mut store, &dataset(), &settings(6), &ids).await;
        assert!(summary.is_completed());
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.submissions, 1);
        assert!(summary.to_string().contains("processed=2"));
    }

    #[tokio::test(start_paused = true)]
    async fn fetches_are_spaced_by_the_courtesy_delay() {
        let remote = FakeRemote::with(vec![
            locality("Q1", 20, "T0001"),
            locality("Q2", 20, "T0001"),
            locality("Q3", 20, "T0001"),
        ]);
        let (_dir, mut store) = store().await;
        let ids = vec!["Q1".to_string(), "Q2".to_string(), "Q3".to_string()];
        let settings = RunSettings {
            delay: Duration::from_secs(1),
            ..settings(6)
        };

        let started = Instant::now();
        run_sync(&remote, &mut store, &dataset(), &settings, &ids).await;
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn selection_skips_completed_and_applies_window() {
        let remote = FakeRemote::with(vec![locality("Q1", 34, "T0001")]);
        let (_dir, mut store) = store().await;
        let config = ReconcileConfig::for_kind(AreaKind::Urban);
        sync_entity(&remote, &mut store, &dataset(), &config, "Q1", 6)
            .await
            .unwrap();

        let ids: Vec<String> = ["Q1", "Q2", "Q2", " Q3 ", "Q4"].iter().map(|s| s.to_string()).collect();
        let window = Selection {
            skip: 1,
            take: Some(1),
            include_complete: false,
        };
        assert_eq!(select_candidates(ids.clone(), &store, &window), vec!["Q3".to_string()]);

        let everything = Selection {
            include_complete: true,
            ..Selection::default()
        };
        assert_eq!(select_candidates(ids, &store, &everything).len(), 4);
    }

    fn legacy_population_claim(id: &str, amount: f64, year: &str) -> Claim {
        let mut claim = Claim::new(
            Snak::quantity(POPULATION, amount, "1"),
            vec![Reference::from_snaks(vec![Snak::item(STATED_IN, LOCALITIES_2010)])],
            vec![YearTable::standard().qualifier(year)],
        );
        claim.id = Some(id.to_string());
        claim
    }

    #[tokio::test]
    async fn reference_repair_replaces_only_references_and_marks_done() {
        let mut entity = locality("Q1", 34, "T0001");
        entity.claims.insert(
            POPULATION.to_string(),
            vec![legacy_population_claim("Q1$p10", 1200.0, "10")],
        );
        let remote = FakeRemote::with(vec![entity]);
        let (_dir, mut store) = store().await;

        let mut record = EntityRecord::new("Q1", AreaKind::Urban, Utc::now());
        record.edits = vec![Change::add_claim(legacy_population_claim("x", 1200.0, "10"))];
        store.upsert(record).await.unwrap();
        assert_eq!(pending_reference_repairs(&store, AreaKind::Urban), vec!["Q1".to_string()]);

        let summary = run_reference_repair(&remote, &mut store, &dataset(), &settings(4)).await;
        assert!(summary.is_completed());
        assert_eq!(summary.updated, 1);

        let sent = remote.submissions();
        assert_eq!(sent.len(), 1);
        let Change::EditClaim { id, claim } = &sent[0].1[0] else {
            panic!("expected an edit, got {:?}", sent[0].1[0]);
        };
        assert_eq!(id, "Q1$p10");
        assert_eq!(claim.amount(), Some(1200.0));
        assert_eq!(
            claim.references,
            vec![Reference::stated_in_retrieved(STATISTICS_DATABASE, RETRIEVED_AT)]
        );

        assert!(pending_reference_repairs(&store, AreaKind::Urban).is_empty());
        assert!(store
            .get("Q1")
            .unwrap()
            .has_flag(flags::CHANGES_REFERENCES_CORRECTED));
    }

    #[tokio::test]
    async fn unresolvable_entity_is_not_marked_repaired() {
        let remote = FakeRemote::with(vec![locality("Q1", 34, "T0404")]);
        let (_dir, mut store) = store().await;
        let mut record = EntityRecord::new("Q1", AreaKind::Urban, Utc::now());
        record.edits = labels(1);
        store.upsert(record).await.unwrap();

        let summary = run_reference_repair(&remote, &mut store, &dataset(), &settings(4)).await;
        assert_eq!(summary.skipped, 1);
        assert_eq!(pending_reference_repairs(&store, AreaKind::Urban).len(), 1);
    }

    #[test]
    fn entity_ids_are_taken_from_uri_tails() {
        assert_eq!(
            entity_id_from_uri("http://www.wikidata.org/entity/Q42").as_deref(),
            Some("Q42")
        );
        assert_eq!(entity_id_from_uri("http://www.wikidata.org/entity/P17"), None);
        assert_eq!(entity_id_from_uri("Q"), None);
    }

    #[test]
    fn candidate_ids_keep_order_and_drop_duplicates() {
        let row = |uri: &str| {
            let mut row = BindingRow::new();
            row.insert(
                "item".to_string(),
                Binding {
                    kind: "uri".to_string(),
                    value: uri.to_string(),
                },
            );
            row
        };
        let rows = vec![
            row("http://www.wikidata.org/entity/Q9"),
            row("http://www.wikidata.org/entity/Q3"),
            row("http://www.wikidata.org/entity/Q9"),
        ];
        assert_eq!(candidate_ids(&rows), vec!["Q9".to_string(), "Q3".to_string()]);
    }

    #[test]
    fn discovery_queries_target_the_kind_code_property() {
        let urban = DiscoveryQuery::WithoutPopulation.sparql(AreaKind::Urban);
        assert!(urban.contains("wdt:P775"));
        assert!(urban.contains("wdt:P1082"));

        let minor = DiscoveryQuery::AreaWithoutReferences.sparql(AreaKind::Minor);
        assert!(minor.contains("wdt:P776"));
        assert!(minor.contains("p:P2046"));
        assert!(minor.contains("prov:wasDerivedFrom"));

        assert_eq!(
            "area_without_references".parse::<DiscoveryQuery>(),
            Ok(DiscoveryQuery::AreaWithoutReferences)
        );
        assert!("everything".parse::<DiscoveryQuery>().is_err());
    }
}
