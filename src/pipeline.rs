use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use chrono::Utc;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::Serialize;
use tracing::{error, info, info_span, warn};

use crate::catalog_index::{CatalogIndexWriter, ExistenceOracle};
use crate::domain::{AuthToken, CatalogRecord, IndexedRecord, IngestedAsset, RecordId, dedup_by_id};
use crate::error::IngestError;
use crate::fetcher::{AssetFetcher, FetchOutcome};
use crate::metadata::{MergeResult, MetadataMergeStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Candidates,
    Deduplicated,
    Fetched,
    MetadataMerged,
    Indexed,
    PartiallyFailed,
    NothingToIngest,
}

#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestionReport {
    pub state: BatchState,
    pub candidates: usize,
    pub skipped_existing: Vec<RecordId>,
    pub fetched: Vec<RecordId>,
    pub assets: Vec<IngestedAsset>,
    pub failed: Vec<RecordId>,
    pub failures: BTreeMap<RecordId, String>,
    pub not_started: Vec<RecordId>,
    pub metadata: MergeResult,
    pub indexed_count: usize,
    pub index_error: Option<String>,
}

impl IngestionReport {
    fn new(candidates: usize) -> Self {
        Self {
            state: BatchState::Candidates,
            candidates,
            skipped_existing: Vec::new(),
            fetched: Vec::new(),
            assets: Vec::new(),
            failed: Vec::new(),
            failures: BTreeMap::new(),
            not_started: Vec::new(),
            metadata: MergeResult::NotAttempted,
            indexed_count: 0,
            index_error: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, BatchState::Indexed | BatchState::NothingToIngest)
    }
}

enum Slot {
    Done(FetchOutcome),
    NotStarted(RecordId),
}

pub struct Pipeline {
    oracle: Arc<dyn ExistenceOracle>,
    writer: Arc<dyn CatalogIndexWriter>,
    fetcher: Arc<AssetFetcher>,
    metadata: Arc<MetadataMergeStore>,
    pool: ThreadPool,
}

impl Pipeline {
    pub fn new(
        oracle: Arc<dyn ExistenceOracle>,
        writer: Arc<dyn CatalogIndexWriter>,
        fetcher: Arc<AssetFetcher>,
        metadata: Arc<MetadataMergeStore>,
        workers: usize,
    ) -> Result<Self, IngestError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|idx| format!("safe-fetch-{idx}"))
            .build()
            .map_err(|err| IngestError::WorkerPool(err.to_string()))?;
        Ok(Self {
            oracle,
            writer,
            fetcher,
            metadata,
            pool,
        })
    }

    pub fn metadata(&self) -> &MetadataMergeStore {
        &self.metadata
    }

    /// Returns `Err` only for batch-level failures: the existence check
    /// (`DedupUnavailable`) and reading the footprint index (`MetadataRead`).
    /// Everything else is recorded on the report.
    pub fn ingest_candidates(
        &self,
        records: Vec<CatalogRecord>,
        token: &AuthToken,
        cancel: &CancellationToken,
    ) -> Result<IngestionReport, IngestError> {
        let records = dedup_by_id(records);
        let mut report = IngestionReport::new(records.len());
        info!(candidates = records.len(), "batch started");
        if records.is_empty() {
            report.state = BatchState::NothingToIngest;
            return Ok(report);
        }

        let ids = records.iter().map(|r| r.id.clone()).collect::<BTreeSet<_>>();
        let existing = self.oracle.check_existing(&ids).map_err(|err| {
            error!(error = %err, "existence check failed, aborting batch");
            IngestError::DedupUnavailable(err.to_string())
        })?;
        let to_fetch = records
            .into_iter()
            .filter(|record| !existing.contains(&record.id))
            .collect::<Vec<_>>();
        report.skipped_existing = ids.intersection(&existing).cloned().collect();
        report.state = BatchState::Deduplicated;
        info!(
            skipped = report.skipped_existing.len(),
            remaining = to_fetch.len(),
            "deduplicated against catalog index"
        );
        if to_fetch.is_empty() {
            report.state = BatchState::NothingToIngest;
            info!("every candidate is already ingested");
            return Ok(report);
        }

        let slots = self.pool.install(|| {
            to_fetch
                .par_iter()
                .map(|record| {
                    if cancel.is_cancelled() {
                        Slot::NotStarted(record.id.clone())
                    } else {
                        Slot::Done(self.fetcher.fetch_and_store(record, token))
                    }
                })
                .collect::<Vec<_>>()
        });

        let mut stored = BTreeSet::new();
        for slot in slots {
            match slot {
                Slot::Done(FetchOutcome::Stored { asset, .. }) => {
                    stored.insert(asset.id.clone());
                    report.fetched.push(asset.id.clone());
                    report.assets.push(asset);
                }
                Slot::Done(FetchOutcome::Failed { id, error, .. }) => {
                    report.failures.insert(id.clone(), error.to_string());
                    report.failed.push(id);
                }
                Slot::NotStarted(id) => report.not_started.push(id),
            }
        }
        let fetched_records = to_fetch
            .into_iter()
            .filter(|record| stored.contains(&record.id))
            .collect::<Vec<_>>();
        info!(
            fetched = report.fetched.len(),
            failed = report.failed.len(),
            not_started = report.not_started.len(),
            "fetch phase finished"
        );

        if fetched_records.is_empty() {
            warn!("no archives stored, skipping metadata and index writes");
            report.state = BatchState::PartiallyFailed;
            return Ok(report);
        }
        report.state = BatchState::Fetched;

        match self.metadata.merge_footprints(&fetched_records) {
            Ok(result) => {
                report.metadata = result;
                report.state = BatchState::MetadataMerged;
            }
            Err(IngestError::MetadataRead(message)) => {
                let stored = report
                    .fetched
                    .iter()
                    .map(RecordId::as_str)
                    .collect::<Vec<_>>()
                    .join(",");
                error!(
                    error = %message,
                    stored = %stored,
                    "footprint index unreadable, aborting batch with archives left unindexed"
                );
                return Err(IngestError::MetadataRead(format!(
                    "{message} (archives stored without index rows: {stored})"
                )));
            }
            Err(err) => {
                error!(error = %err, "footprint merge failed, index write skipped");
                report.metadata = MergeResult::Failed {
                    message: err.to_string(),
                };
                report.state = BatchState::PartiallyFailed;
                return Ok(report);
            }
        }

        let indexed = fetched_records
            .into_iter()
            .map(IndexedRecord::new)
            .collect::<Vec<_>>();
        match self.writer.append_indexed(&indexed) {
            Ok(count) => {
                if count != indexed.len() {
                    warn!(
                        expected = indexed.len(),
                        inserted = count,
                        "catalog index count differs from stored archives"
                    );
                }
                report.indexed_count = count;
                report.state = BatchState::Indexed;
            }
            Err(err) => {
                let err = IngestError::IndexWriteFailed(err.to_string());
                error!(error = %err, "catalog index append failed");
                report.index_error = Some(err.to_string());
                report.state = BatchState::PartiallyFailed;
                return Ok(report);
            }
        }

        if !report.failed.is_empty() || !report.not_started.is_empty() {
            report.state = BatchState::PartiallyFailed;
        }
        info!(
            state = ?report.state,
            fetched = report.fetched.len(),
            failed = report.failed.len(),
            indexed = report.indexed_count,
            "batch finished"
        );
        Ok(report)
    }
}

static BATCH_COUNTER: AtomicU64 = AtomicU64::new(1);

pub struct IngestionHandle {
    batch_id: String,
    cancel: CancellationToken,
    handle: JoinHandle<Result<IngestionReport, IngestError>>,
}

impl IngestionHandle {
    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    pub fn cancel(&self) {
        info!(batch = %self.batch_id, "cancellation requested");
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn wait(self) -> Result<IngestionReport, IngestError> {
        self.handle
            .join()
            .map_err(|_| IngestError::WorkerPool(format!("batch {} panicked", self.batch_id)))?
    }
}

pub fn spawn_ingestion(
    pipeline: Arc<Pipeline>,
    records: Vec<CatalogRecord>,
    token: AuthToken,
) -> Result<IngestionHandle, IngestError> {
    let batch_id = format!(
        "batch-{}-{}",
        Utc::now().format("%Y%m%dT%H%M%S"),
        BATCH_COUNTER.fetch_add(1, Ordering::Relaxed)
    );
    let cancel = CancellationToken::new();
    let thread_cancel = cancel.clone();
    let span_id = batch_id.clone();
    let handle = thread::Builder::new()
        .name(batch_id.clone())
        .spawn(move || {
            let _span = info_span!("batch", id = %span_id).entered();
            pipeline.ingest_candidates(records, &token, &thread_cancel)
        })
        .map_err(|err| IngestError::WorkerPool(err.to_string()))?;
    info!(batch = %batch_id, "batch accepted");
    Ok(IngestionHandle {
        batch_id,
        cancel,
        handle,
    })
}
