//! Remote Wikibase client, run-progress persistence and dataset loading for wdstat.

pub mod remote;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;
use wdstat_core::{Area, AreaKind, Change, Dataset, EntityRecord};

pub use remote::{
    AttemptOutcome, Binding, BindingRow, RemoteApi, RemoteClientConfig, RemoteError, RetryPolicy,
    WikibaseClient,
};

pub const CRATE_NAME: &str = "wdstat-storage";

/// Completion flags recorded per correction category.
pub mod flags {
    pub const REFERENCES_CORRECTED: &str = "references_corrected";
    pub const CHANGES_REFERENCES_CORRECTED: &str = "changes_references_corrected";
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Digest of an applied edit list in its serialized form.
pub fn digest_edits(edits: &[Change]) -> anyhow::Result<String> {
    let bytes = serde_json::to_vec(edits).context("serializing edits for digest")?;
    Ok(sha256_hex(&bytes))
}

/// Entity-keyed progress records backed by one JSON file.
///
/// Every mutation is persisted before it returns, so a crash never loses a
/// committed upsert. Access is strictly sequential; no locking is done.
#[derive(Debug)]
pub struct ProgressStore {
    path: PathBuf,
    records: BTreeMap<String, EntityRecord>,
}

impl ProgressStore {
    /// Opens the store, starting empty when the file does not exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let records = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing progress file {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("reading progress file {}", path.display()))
            }
        };
        debug!(path = %path.display(), records = records.len(), "progress store opened");
        Ok(Self { path, records })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, entity_id: &str) -> Option<&EntityRecord> {
        self.records.get(entity_id)
    }

    pub fn find_pending<P>(&self, mut predicate: P) -> Vec<String>
    where
        P: FnMut(&EntityRecord) -> bool,
    {
        self.records
            .values()
            .filter(|record| predicate(record))
            .map(|record| record.entity_id.clone())
            .collect()
    }

    /// Inserts or merges `record`. Scalar fields overwrite, edits append, flags accumulate.
    pub async fn upsert(&mut self, record: EntityRecord) -> anyhow::Result<&EntityRecord> {
        let entity_id = record.entity_id.clone();
        let merged = match self.records.remove(&entity_id) {
            Some(existing) => merge_record(existing, record),
            None => record,
        };
        let merged = with_digest(merged)?;
        self.records.insert(entity_id.clone(), merged);
        self.persist().await?;
        self.records
            .get(&entity_id)
            .with_context(|| format!("record {entity_id} vanished after upsert"))
    }

    pub async fn mark_complete(
        &mut self,
        entity_id: &str,
        flag: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let record = self
            .records
            .get_mut(entity_id)
            .with_context(|| format!("no progress record for {entity_id}"))?;
        record.flags.insert(flag.to_string());
        record.updated_at = at;
        self.persist().await?;
        info!(entity = entity_id, flag, "marked complete");
        Ok(())
    }

    /// Write-to-temp then rename, so readers only ever see a whole file.
    async fn persist(&self) -> anyhow::Result<()> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating progress directory {}", parent.display()))?;

        let bytes = serde_json::to_vec_pretty(&self.records).context("serializing progress records")?;
        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp progress file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp progress file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp progress file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }
        Ok(())
    }
}

fn merge_record(mut existing: EntityRecord, update: EntityRecord) -> EntityRecord {
    existing.kind = update.kind;
    if !update.labels.is_empty() {
        existing.labels = update.labels;
    }
    if update.area_code.is_some() {
        existing.area_code = update.area_code;
    }
    if update.name.is_some() {
        existing.name = update.name;
    }
    if update.municipality.is_some() {
        existing.municipality = update.municipality;
    }
    existing.error = update.error;
    existing.review_claims = update.review_claims;
    existing.changed = update.changed;
    existing.edits.extend(update.edits);
    existing.flags.extend(update.flags);
    existing.updated_at = update.updated_at;
    existing
}

fn with_digest(mut record: EntityRecord) -> anyhow::Result<EntityRecord> {
    record.edits_digest = if record.edits.is_empty() {
        None
    } else {
        Some(digest_edits(&record.edits)?)
    };
    Ok(record)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DatasetFile {
    Keyed(BTreeMap<String, Area>),
    Listed(Vec<Area>),
}

pub fn dataset_file_name(kind: AreaKind) -> &'static str {
    match kind {
        AreaKind::Urban => "urban-areas.json",
        AreaKind::Minor => "minor-urban-areas.json",
    }
}

/// Loads a dataset file: either a code-keyed object or a list of areas carrying their own codes.
pub async fn load_dataset(path: impl AsRef<Path>) -> anyhow::Result<Dataset> {
    let path = path.as_ref();
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading dataset {}", path.display()))?;
    let file: DatasetFile = serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing dataset {}", path.display()))?;
    let areas: Vec<Area> = match file {
        DatasetFile::Keyed(map) => map
            .into_iter()
            .map(|(code, mut area)| {
                if area.code.is_empty() {
                    area.code = code;
                }
                area
            })
            .collect(),
        DatasetFile::Listed(list) => list,
    };
    let dataset = Dataset::from_areas(
        areas
            .into_iter()
            .filter(|area| !area.code.trim().is_empty())
            .map(|mut area| {
                area.code = area.code.trim().to_ascii_uppercase();
                area
            }),
    );
    info!(path = %path.display(), areas = dataset.len(), "dataset loaded");
    Ok(dataset)
}

pub async fn load_dataset_for(dir: impl AsRef<Path>, kind: AreaKind) -> anyhow::Result<Dataset> {
    load_dataset(dir.as_ref().join(dataset_file_name(kind))).await
}
