use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::{CatalogRecord, RecordId, lenient_time};
use crate::error::IngestError;
use crate::lock::IndexLocks;
use crate::object_store::{
    ObjectStore, StatResult, WritePrecondition, WriteResult, ensure_bucket,
};

pub const INDEX_FORMAT_VERSION: u32 = 1;
pub const INDEX_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FootprintRow {
    pub id: RecordId,
    pub name: String,
    #[serde(default, with = "lenient_time")]
    pub content_start: Option<DateTime<Utc>>,
    #[serde(default, with = "lenient_time")]
    pub content_end: Option<DateTime<Utc>>,
    pub srid: u32,
    pub wkt: String,
    #[serde(default)]
    pub bbox: Option<[f64; 4]>,
    pub local_blob_storage_path: String,
}

impl From<&CatalogRecord> for FootprintRow {
    fn from(record: &CatalogRecord) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            content_start: record.content_date.start,
            content_end: record.content_date.end,
            srid: record.footprint.srid(),
            wkt: record.footprint.wkt().to_string(),
            bbox: record.footprint.bbox(),
            local_blob_storage_path: record.asset_key(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FootprintIndex {
    pub format_version: u32,
    pub rows: Vec<FootprintRow>,
}

impl Default for FootprintIndex {
    fn default() -> Self {
        Self {
            format_version: INDEX_FORMAT_VERSION,
            rows: Vec::new(),
        }
    }
}

impl FootprintIndex {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.rows.iter().any(|row| &row.id == id)
    }

    pub fn ids(&self) -> Vec<RecordId> {
        self.rows.iter().map(|row| row.id.clone()).collect()
    }

    pub fn rows_intersecting(&self, bbox: [f64; 4]) -> Vec<&FootprintRow> {
        self.rows
            .iter()
            .filter(|row| {
                row.bbox.is_some_and(|row_box| {
                    row_box[0] <= bbox[2]
                        && row_box[2] >= bbox[0]
                        && row_box[1] <= bbox[3]
                        && row_box[3] >= bbox[1]
                })
            })
            .collect()
    }

    fn append_new(&mut self, records: &[CatalogRecord]) -> usize {
        let mut known = self.rows.iter().map(|row| row.id.clone()).collect::<HashSet<_>>();
        let before = self.rows.len();
        for record in records {
            if known.insert(record.id.clone()) {
                self.rows.push(FootprintRow::from(record));
            }
        }
        self.rows.len() - before
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MergeResult {
    Merged { added: usize, total: usize },
    NoOp { total: usize },
    NotAttempted,
    Failed { message: String },
}

pub struct MetadataMergeStore {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    key: String,
    locks: IndexLocks,
}

impl MetadataMergeStore {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        locks: IndexLocks,
    ) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            key: key.into(),
            locks,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn load(&self) -> Result<Option<(FootprintIndex, String)>, IngestError> {
        if !self.store.bucket_exists(&self.bucket)? {
            return Ok(None);
        }
        let meta = match self.store.stat_object(&self.bucket, &self.key)? {
            StatResult::NotFound => return Ok(None),
            StatResult::Exists(meta) => meta,
        };
        let bytes = self.store.get_object(&self.bucket, &self.key)?;
        let index: FootprintIndex = serde_json::from_slice(&bytes)
            .map_err(|err| IngestError::MetadataRead(format!("{}: {err}", self.key)))?;
        if index.format_version != INDEX_FORMAT_VERSION {
            return Err(IngestError::MetadataRead(format!(
                "{} has unsupported format version {}",
                self.key, index.format_version
            )));
        }
        Ok(Some((index, meta.version)))
    }

    pub fn load_index(&self) -> Result<FootprintIndex, IngestError> {
        Ok(self.load()?.map(|(index, _)| index).unwrap_or_default())
    }

    /// Adds footprints for identifiers not already indexed.
    ///
    /// Read failures surface as `MetadataRead`; write failures as
    /// `MergeWriteFailed` or `MergeConflict`, with the prior document intact.
    pub fn merge_footprints(&self, records: &[CatalogRecord]) -> Result<MergeResult, IngestError> {
        self.locks
            .with_lock(&format!("{}/{}", self.bucket, self.key), || {
                self.merge_locked(records)
            })
    }

    fn merge_locked(&self, records: &[CatalogRecord]) -> Result<MergeResult, IngestError> {
        let loaded = self.load().map_err(|err| match err {
            read @ IngestError::MetadataRead(_) => read,
            other => IngestError::MetadataRead(other.to_string()),
        })?;
        let (mut index, precondition) = match loaded {
            Some((index, version)) => {
                info!(key = %self.key, rows = index.len(), "loaded footprint index");
                (index, WritePrecondition::MatchesVersion(version))
            }
            None => {
                info!(key = %self.key, "footprint index missing, building from scratch");
                (FootprintIndex::default(), WritePrecondition::DoesNotExist)
            }
        };

        let added = index.append_new(records);
        if added == 0 {
            info!(
                key = %self.key,
                input = records.len(),
                "no new identifiers, index left unchanged"
            );
            return Ok(MergeResult::NoOp { total: index.len() });
        }
        info!(input = records.len(), added, "appending footprints");

        let payload = serde_json::to_vec(&index)
            .map_err(|err| IngestError::MergeWriteFailed(err.to_string()))?;
        ensure_bucket(self.store.as_ref(), &self.bucket)
            .map_err(|err| IngestError::MergeWriteFailed(err.to_string()))?;
        let mut reader: &[u8] = &payload;
        let written = self
            .store
            .put_object(
                &self.bucket,
                &self.key,
                &mut reader,
                payload.len() as u64,
                INDEX_CONTENT_TYPE,
                precondition,
            )
            .map_err(|err| IngestError::MergeWriteFailed(err.to_string()))?;
        match written {
            WriteResult::Written(meta) => {
                info!(
                    key = %self.key,
                    total = index.len(),
                    version = %meta.version,
                    "uploaded footprint index"
                );
                Ok(MergeResult::Merged {
                    added,
                    total: index.len(),
                })
            }
            WriteResult::PreconditionFailed { current_version } => {
                warn!(
                    key = %self.key,
                    current_version = current_version.as_deref().unwrap_or("none"),
                    "footprint index changed underneath merge"
                );
                Err(IngestError::MergeConflict {
                    key: self.key.clone(),
                })
            }
        }
    }
}
