use std::collections::{BTreeSet, HashMap};
use std::io::{Cursor, Write};
use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use zip::write::SimpleFileOptions;

use sentinel_safe_ingest::catalog_index::{CatalogIndexWriter, ExistenceOracle, SqliteCatalogIndex};
use sentinel_safe_ingest::domain::{AuthToken, CatalogRecord, IndexedRecord, RecordId};
use sentinel_safe_ingest::error::IngestError;
use sentinel_safe_ingest::fetcher::{AssetFetcher, AssetSource, DownloadInfo};
use sentinel_safe_ingest::lock::IndexLocks;
use sentinel_safe_ingest::metadata::{MergeResult, MetadataMergeStore};
use sentinel_safe_ingest::object_store::{MemoryObjectStore, ObjectStore, StatResult, WritePrecondition};
use sentinel_safe_ingest::pipeline::{BatchState, CancellationToken, Pipeline, spawn_ingestion};
use sentinel_safe_ingest::retry::RetryPolicy;

const BUCKET: &str = "sentinel-2-data";
const INDEX_KEY: &str = "sentinel_2_metadata/uploaded_sentinel_2_footprints.json";

fn record(id: &str) -> CatalogRecord {
    serde_json::from_value(serde_json::json!({
        "Id": id,
        "Name": format!("S2A_MSIL1C_{id}.SAFE"),
        "ContentDate": {"Start": "2024-05-03T10:30:31.024Z", "End": "2024-05-03T10:30:31.024Z"},
        "Footprint": "geography'SRID=4326;POLYGON ((9 46, 10 46, 10 47, 9 47, 9 46))'"
    }))
    .unwrap()
}

fn safe_zip(id: &str) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file(format!("{id}.SAFE/manifest.safe"), SimpleFileOptions::default())
        .unwrap();
    writer.write_all(b"<xfdu:XFDU/>").unwrap();
    writer.finish().unwrap().into_inner()
}

fn id(raw: &str) -> RecordId {
    raw.parse().unwrap()
}

#[derive(Default)]
struct MockSource {
    failing: BTreeSet<String>,
    calls: Mutex<HashMap<String, u32>>,
    cancel_on_first: Mutex<Option<CancellationToken>>,
}

impl MockSource {
    fn failing(ids: &[&str]) -> Self {
        Self {
            failing: ids.iter().map(|id| id.to_string()).collect(),
            ..Self::default()
        }
    }

    fn calls_for(&self, id: &str) -> u32 {
        self.calls.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }
}

impl AssetSource for MockSource {
    fn download(
        &self,
        id: &RecordId,
        _token: &AuthToken,
        sink: &mut dyn Write,
    ) -> Result<DownloadInfo, IngestError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default() += 1;
        if let Some(cancel) = self.cancel_on_first.lock().unwrap().take() {
            cancel.cancel();
        }
        if self.failing.contains(id.as_str()) {
            return Err(IngestError::DownloadStatus {
                status: 503,
                message: "service unavailable".to_string(),
            });
        }
        let bytes = safe_zip(id.as_str());
        sink.write_all(&bytes).unwrap();
        Ok(DownloadInfo {
            received: bytes.len() as u64,
            expected: Some(bytes.len() as u64),
        })
    }
}

struct FailingOracle;

impl ExistenceOracle for FailingOracle {
    fn check_existing(&self, _ids: &BTreeSet<RecordId>) -> Result<BTreeSet<RecordId>, IngestError> {
        Err(IngestError::GraphHttp("connection refused".to_string()))
    }
}

struct FailingWriter;

impl CatalogIndexWriter for FailingWriter {
    fn append_indexed(&self, _records: &[IndexedRecord]) -> Result<usize, IngestError> {
        Err(IngestError::Database("disk I/O error".to_string()))
    }
}

struct Harness {
    store: Arc<MemoryObjectStore>,
    index: Arc<SqliteCatalogIndex>,
    source: Arc<MockSource>,
    metadata: Arc<MetadataMergeStore>,
    pipeline: Pipeline,
}

impl Harness {
    fn new(source: MockSource) -> Self {
        Self::with_workers(source, 4)
    }

    fn with_workers(source: MockSource, workers: usize) -> Self {
        let index = Arc::new(SqliteCatalogIndex::open_in_memory().unwrap());
        Self::build(source, workers, index.clone(), index.clone(), index)
    }

    fn build(
        source: MockSource,
        workers: usize,
        oracle: Arc<dyn ExistenceOracle>,
        writer: Arc<dyn CatalogIndexWriter>,
        index: Arc<SqliteCatalogIndex>,
    ) -> Self {
        let store = Arc::new(MemoryObjectStore::new());
        let source = Arc::new(source);
        let fetcher = AssetFetcher::new(
            source.clone(),
            store.clone(),
            BUCKET,
            RetryPolicy::no_delay(2),
        );
        let metadata = Arc::new(MetadataMergeStore::new(
            store.clone(),
            BUCKET,
            INDEX_KEY,
            IndexLocks::new(),
        ));
        let pipeline =
            Pipeline::new(oracle, writer, Arc::new(fetcher), metadata.clone(), workers).unwrap();
        Self {
            store,
            index,
            source,
            metadata,
            pipeline,
        }
    }

    fn run(&self, ids: &[&str]) -> Result<sentinel_safe_ingest::pipeline::IngestionReport, IngestError> {
        let records = ids.iter().map(|raw| record(raw)).collect();
        self.pipeline
            .ingest_candidates(records, &AuthToken::new("token"), &CancellationToken::new())
    }

    fn footprint_ids(&self) -> Vec<RecordId> {
        self.metadata.load_index().unwrap().ids()
    }

    fn archive_keys(&self) -> Vec<String> {
        self.store
            .keys(BUCKET)
            .into_iter()
            .filter(|key| key.ends_with(".SAFE.zip"))
            .collect()
    }
}

#[test]
fn fresh_batch_is_fetched_merged_and_indexed() {
    let harness = Harness::new(MockSource::default());
    let report = harness.run(&["id1", "id2"]).unwrap();

    assert_eq!(report.state, BatchState::Indexed);
    assert_eq!(report.fetched, vec![id("id1"), id("id2")]);
    assert!(report.failed.is_empty());
    assert_eq!(report.metadata, MergeResult::Merged { added: 2, total: 2 });
    assert_eq!(report.indexed_count, 2);
    assert_eq!(harness.footprint_ids(), vec![id("id1"), id("id2")]);
    assert_eq!(harness.index.count().unwrap(), 2);
    assert_eq!(harness.archive_keys(), vec!["id1.SAFE.zip", "id2.SAFE.zip"]);
}

#[test]
fn existing_identifiers_are_not_fetched_again() {
    let harness = Harness::new(MockSource::default());
    harness.run(&["id1"]).unwrap();
    let before = match harness.store.stat_object(BUCKET, "id1.SAFE.zip").unwrap() {
        StatResult::Exists(meta) => meta.version,
        StatResult::NotFound => panic!("id1 archive missing"),
    };

    let report = harness.run(&["id1", "id2"]).unwrap();

    assert_eq!(report.skipped_existing, vec![id("id1")]);
    assert_eq!(report.fetched, vec![id("id2")]);
    assert_eq!(harness.source.calls_for("id1"), 1);
    assert_eq!(harness.index.count().unwrap(), 2);
    let after = match harness.store.stat_object(BUCKET, "id1.SAFE.zip").unwrap() {
        StatResult::Exists(meta) => meta.version,
        StatResult::NotFound => panic!("id1 archive missing"),
    };
    assert_eq!(before, after);
}

#[test]
fn all_fetches_failing_writes_nothing() {
    let harness = Harness::new(MockSource::failing(&["id3"]));
    let report = harness.run(&["id3"]).unwrap();

    assert_eq!(report.state, BatchState::PartiallyFailed);
    assert!(report.fetched.is_empty());
    assert_eq!(report.failed, vec![id("id3")]);
    assert!(report.failures[&id("id3")].contains("503"));
    assert_eq!(report.metadata, MergeResult::NotAttempted);
    assert_eq!(harness.source.calls_for("id3"), 2);
    assert!(harness.store.keys(BUCKET).iter().all(|key| key != INDEX_KEY));
    assert_eq!(harness.index.count().unwrap(), 0);
}

#[test]
fn one_failure_does_not_block_siblings() {
    let harness = Harness::new(MockSource::failing(&["bad"]));
    let report = harness.run(&["good", "bad"]).unwrap();

    assert_eq!(report.state, BatchState::PartiallyFailed);
    assert_eq!(report.fetched, vec![id("good")]);
    assert_eq!(report.failed, vec![id("bad")]);
    assert_eq!(harness.footprint_ids(), vec![id("good")]);
    assert_eq!(harness.index.ids().unwrap(), vec![id("good")]);
    assert_eq!(harness.archive_keys(), vec!["good.SAFE.zip"]);
}

#[test]
fn rerunning_the_same_batch_is_idempotent() {
    let harness = Harness::new(MockSource::default());
    harness.run(&["a", "b", "c"]).unwrap();
    let index_before = harness.metadata.load_index().unwrap();

    let report = harness.run(&["a", "b", "c"]).unwrap();

    assert_eq!(report.state, BatchState::NothingToIngest);
    assert_eq!(report.skipped_existing.len(), 3);
    assert_eq!(harness.source.total_calls(), 3);
    assert_eq!(harness.metadata.load_index().unwrap(), index_before);
    assert_eq!(harness.index.count().unwrap(), 3);
}

#[test]
fn duplicate_candidates_are_fetched_once() {
    let harness = Harness::new(MockSource::default());
    let report = harness.run(&["dup", "dup", "other"]).unwrap();

    assert_eq!(report.candidates, 2);
    assert_eq!(harness.source.calls_for("dup"), 1);
    assert_eq!(harness.footprint_ids().len(), 2);
}

#[test]
fn empty_candidate_list_touches_nothing() {
    let harness = Harness::new(MockSource::default());
    let report = harness.run(&[]).unwrap();
    assert_eq!(report.state, BatchState::NothingToIngest);
    assert!(harness.store.keys(BUCKET).is_empty());
}

#[test]
fn unavailable_oracle_aborts_before_any_fetch() {
    let index = Arc::new(SqliteCatalogIndex::open_in_memory().unwrap());
    let harness = Harness::build(
        MockSource::default(),
        2,
        Arc::new(FailingOracle),
        index.clone(),
        index,
    );

    let err = harness.run(&["id1", "id2"]).unwrap_err();

    assert_matches!(err, IngestError::DedupUnavailable(_));
    assert_eq!(harness.source.total_calls(), 0);
    assert!(harness.store.keys(BUCKET).is_empty());
}

#[test]
fn merge_write_failure_keeps_prior_index_and_skips_catalog_rows() {
    let harness = Harness::new(MockSource::default());
    harness.run(&["first"]).unwrap();
    harness.store.fail_writes_to(INDEX_KEY);

    let report = harness.run(&["second"]).unwrap();

    assert_eq!(report.state, BatchState::PartiallyFailed);
    assert_matches!(report.metadata, MergeResult::Failed { .. });
    assert_eq!(report.indexed_count, 0);
    assert_eq!(harness.footprint_ids(), vec![id("first")]);
    assert_eq!(harness.index.ids().unwrap(), vec![id("first")]);
}

#[test]
fn unreadable_index_fails_the_batch() {
    let harness = Harness::new(MockSource::default());
    harness.store.make_bucket(BUCKET).unwrap();
    let garbage = b"not json";
    harness
        .store
        .put_object(
            BUCKET,
            INDEX_KEY,
            &mut &garbage[..],
            garbage.len() as u64,
            "application/json",
            WritePrecondition::None,
        )
        .unwrap();

    let err = harness.run(&["id1", "id2"]).unwrap_err();

    assert_matches!(
        err,
        IngestError::MetadataRead(ref message) if message.contains("id1") && message.contains("id2")
    );
    assert_eq!(harness.index.count().unwrap(), 0);
}

#[test]
fn index_append_failure_is_reported() {
    let index = Arc::new(SqliteCatalogIndex::open_in_memory().unwrap());
    let harness = Harness::build(
        MockSource::default(),
        2,
        index.clone(),
        Arc::new(FailingWriter),
        index,
    );

    let report = harness.run(&["id1"]).unwrap();

    assert_eq!(report.state, BatchState::PartiallyFailed);
    assert_matches!(report.metadata, MergeResult::Merged { added: 1, .. });
    assert!(report.index_error.unwrap().contains("disk I/O error"));
}

#[test]
fn cancellation_skips_unstarted_records_but_indexes_fetched_ones() {
    let harness = Harness::with_workers(MockSource::default(), 1);
    let cancel = CancellationToken::new();
    *harness.source.cancel_on_first.lock().unwrap() = Some(cancel.clone());

    let records = ["a", "b", "c"].iter().map(|raw| record(raw)).collect();
    let report = harness
        .pipeline
        .ingest_candidates(records, &AuthToken::new("token"), &cancel)
        .unwrap();

    assert_eq!(report.state, BatchState::PartiallyFailed);
    assert_eq!(report.fetched.len(), 1);
    assert_eq!(report.not_started.len(), 2);
    assert_eq!(harness.source.total_calls(), 1);
    assert_eq!(harness.footprint_ids(), report.fetched);
    assert_eq!(harness.index.ids().unwrap(), report.fetched);
}

#[test]
fn spawned_batch_reports_through_its_handle() {
    let harness = Harness::new(MockSource::default());
    let Harness {
        pipeline, index, ..
    } = harness;
    let handle = spawn_ingestion(
        Arc::new(pipeline),
        vec![record("bg1"), record("bg2")],
        AuthToken::new("token"),
    )
    .unwrap();
    assert!(handle.batch_id().starts_with("batch-"));

    let report = handle.wait().unwrap();
    assert_eq!(report.state, BatchState::Indexed);
    assert_eq!(index.count().unwrap(), 2);
}
