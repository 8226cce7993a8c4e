use std::io::{Cursor, Write};
use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use zip::write::SimpleFileOptions;

use sentinel_safe_ingest::aoi::AoiRegistry;
use sentinel_safe_ingest::app::{App, SilentProgress};
use sentinel_safe_ingest::catalog_index::SqliteCatalogIndex;
use sentinel_safe_ingest::copernicus::{CatalogSearch, TokenProvider};
use sentinel_safe_ingest::domain::{AuthToken, CatalogRecord, RecordId, parse_catalog_page};
use sentinel_safe_ingest::error::IngestError;
use sentinel_safe_ingest::fetcher::{AssetFetcher, AssetSource, DownloadInfo};
use sentinel_safe_ingest::lock::IndexLocks;
use sentinel_safe_ingest::metadata::MetadataMergeStore;
use sentinel_safe_ingest::object_store::MemoryObjectStore;
use sentinel_safe_ingest::output::JsonOutput;
use sentinel_safe_ingest::pipeline::{BatchState, Pipeline};
use sentinel_safe_ingest::retry::RetryPolicy;

fn fixture_records() -> Vec<CatalogRecord> {
    let raw = include_str!("fixtures/copernicus_products.json");
    parse_catalog_page(&serde_json::from_str(raw).unwrap()).unwrap()
}

/// Returns the first two fixture products for the first polygon and the
/// last two for any other, so results overlap on one identifier.
#[derive(Default)]
struct MockSearch {
    queries: Mutex<Vec<String>>,
}

impl CatalogSearch for MockSearch {
    fn search(&self, aoi_wkt: &str, collection: &str) -> Result<Vec<CatalogRecord>, IngestError> {
        assert_eq!(collection, "SENTINEL-2");
        let mut queries = self.queries.lock().unwrap();
        queries.push(aoi_wkt.to_string());
        let records = fixture_records();
        if queries.len() == 1 {
            Ok(records[..2].to_vec())
        } else {
            Ok(records[1..].to_vec())
        }
    }
}

struct StaticToken;

impl TokenProvider for StaticToken {
    fn token(&self) -> Result<AuthToken, IngestError> {
        Ok(AuthToken::new("test-token"))
    }
}

struct ZipSource;

impl AssetSource for ZipSource {
    fn download(
        &self,
        id: &RecordId,
        token: &AuthToken,
        sink: &mut dyn Write,
    ) -> Result<DownloadInfo, IngestError> {
        assert_eq!(token.as_str(), "test-token");
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file(format!("{id}.SAFE/manifest.safe"), SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"<xfdu:XFDU/>").unwrap();
        let bytes = writer.finish().unwrap().into_inner();
        sink.write_all(&bytes).unwrap();
        Ok(DownloadInfo {
            received: bytes.len() as u64,
            expected: Some(bytes.len() as u64),
        })
    }
}

fn app() -> (App<MockSearch, StaticToken>, Arc<SqliteCatalogIndex>) {
    let store = Arc::new(MemoryObjectStore::new());
    let index = Arc::new(SqliteCatalogIndex::open_in_memory().unwrap());
    let fetcher = AssetFetcher::new(
        Arc::new(ZipSource),
        store.clone(),
        "sentinel-2-data",
        RetryPolicy::no_delay(1),
    );
    let metadata = MetadataMergeStore::new(
        store,
        "sentinel-2-data",
        "sentinel_2_metadata/uploaded_sentinel_2_footprints.json",
        IndexLocks::new(),
    );
    let pipeline = Pipeline::new(
        index.clone(),
        index.clone(),
        Arc::new(fetcher),
        Arc::new(metadata),
        2,
    )
    .unwrap();
    let app = App::new(
        MockSearch::default(),
        StaticToken,
        Arc::new(pipeline),
        AoiRegistry::open_in_memory().unwrap(),
        "SENTINEL-2",
    );
    (app, index)
}

fn aoi_document() -> serde_json::Value {
    serde_json::from_str(include_str!("fixtures/aoi_two_polygons.geojson")).unwrap()
}

#[test]
fn geojson_ingest_searches_every_polygon_and_dedups() {
    let (app, index) = app();

    let result = app.ingest_geojson(&aoi_document(), &SilentProgress).unwrap();

    assert_eq!(result.report.candidates, 3);
    assert_eq!(result.report.state, BatchState::Indexed);
    assert_eq!(result.report.indexed_count, 3);
    assert_eq!(index.count().unwrap(), 3);
    assert!(result.batch_id.starts_with("batch-"));
}

#[test]
fn second_ingest_of_the_same_area_is_a_no_op() {
    let (app, index) = app();
    app.ingest_geojson(&aoi_document(), &SilentProgress).unwrap();

    let again = app.ingest_records(fixture_records(), &SilentProgress).unwrap();

    assert_eq!(again.report.state, BatchState::NothingToIngest);
    assert_eq!(again.report.skipped_existing.len(), 3);
    assert_eq!(index.count().unwrap(), 3);
}

#[test]
fn registered_aoi_can_be_searched() {
    let (app, _index) = app();
    let added = app.register_aoi("alps", &aoi_document()).unwrap();
    assert_eq!(added.polygons, 2);
    assert!(added.wkt.starts_with("MULTIPOLYGON ((("));

    let found = app.search_aoi(added.id, &SilentProgress).unwrap();
    assert_eq!(found.aoi_id, Some(added.id));
    assert_eq!(found.records.len(), 2);
    assert_eq!(app.list_aois().unwrap().len(), 1);

    assert_matches!(
        app.search_aoi(added.id + 10, &SilentProgress),
        Err(IngestError::AoiNotFound(_))
    );
}

#[test]
fn footprints_filter_by_bbox() {
    let (app, _index) = app();
    app.ingest_records(fixture_records(), &SilentProgress).unwrap();

    assert_eq!(app.footprints(None).unwrap().rows.len(), 3);
    let east = app.footprints(Some([13.0, 46.0, 16.0, 48.0])).unwrap();
    assert_eq!(east.rows.len(), 1);
    assert_eq!(east.rows[0].id.as_str(), "f0e1d2c3-b4a5-4697-8877-665544332211");
}

#[test]
fn ingest_report_renders_as_json() {
    let (app, _index) = app();
    let result = app.ingest_records(fixture_records(), &SilentProgress).unwrap();

    let rendered = JsonOutput::render(&result).unwrap();
    let value: serde_json::Value = serde_json::from_str(&rendered).unwrap();

    assert_eq!(value["report"]["state"], "indexed");
    assert_eq!(value["report"]["metadata"]["status"], "merged");
    assert_eq!(value["report"]["metadata"]["added"], 3);
    assert_eq!(value["report"]["fetched"].as_array().unwrap().len(), 3);
}
