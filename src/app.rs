use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;

use crate::aoi::{AoiExtent, AoiRegistry, combined_wkt, parse_geojson};
use crate::copernicus::{CatalogSearch, TokenProvider, search_polygons};
use crate::domain::{CatalogRecord, dedup_by_id};
use crate::error::IngestError;
use crate::metadata::FootprintRow;
use crate::pipeline::{IngestionReport, Pipeline, spawn_ingestion};

#[derive(Debug, Clone, Serialize)]
pub struct AoiAddResult {
    pub id: i64,
    pub name: String,
    pub polygons: usize,
    pub wkt: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub aoi_id: Option<i64>,
    pub polygons: usize,
    pub records: Vec<CatalogRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestResult {
    pub batch_id: String,
    pub report: IngestionReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct FootprintList {
    pub bbox: Option<[f64; 4]>,
    pub rows: Vec<FootprintRow>,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub struct SilentProgress;

impl ProgressSink for SilentProgress {
    fn event(&self, _event: ProgressEvent) {}
}

pub struct App<S: CatalogSearch, T: TokenProvider> {
    search: S,
    tokens: T,
    pipeline: Arc<Pipeline>,
    aois: AoiRegistry,
    collection: String,
}

impl<S: CatalogSearch, T: TokenProvider> App<S, T> {
    pub fn new(
        search: S,
        tokens: T,
        pipeline: Arc<Pipeline>,
        aois: AoiRegistry,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            search,
            tokens,
            pipeline,
            aois,
            collection: collection.into(),
        }
    }

    pub fn register_aoi(&self, name: &str, geojson: &Value) -> Result<AoiAddResult, IngestError> {
        let polygons = parse_geojson(geojson)?;
        let wkt = combined_wkt(&polygons)?;
        let id = self.aois.insert(name, &wkt)?;
        Ok(AoiAddResult {
            id,
            name: name.trim().to_string(),
            polygons: polygons.len(),
            wkt,
        })
    }

    pub fn list_aois(&self) -> Result<Vec<AoiExtent>, IngestError> {
        self.aois.list()
    }

    pub fn search_aoi(&self, id: i64, sink: &dyn ProgressSink) -> Result<SearchResult, IngestError> {
        let extent = self.aois.get(id)?;
        sink.event(ProgressEvent {
            message: format!("phase=Search; querying catalog for AOI {}", extent.aoi_name),
            elapsed: None,
        });
        let records = self.search.search(&extent.aoi_wkt, &self.collection)?;
        Ok(SearchResult {
            aoi_id: Some(id),
            polygons: 1,
            records: dedup_by_id(records),
        })
    }

    pub fn ingest_geojson(
        &self,
        geojson: &Value,
        sink: &dyn ProgressSink,
    ) -> Result<IngestResult, IngestError> {
        let polygons = parse_geojson(geojson)?
            .iter()
            .map(|polygon| polygon.to_wkt())
            .collect::<Vec<_>>();
        sink.event(ProgressEvent {
            message: format!("phase=Search; {} polygon(s)", polygons.len()),
            elapsed: None,
        });
        let records = search_polygons(&self.search, &polygons, &self.collection);
        self.ingest_records(records, sink)
    }

    pub fn ingest_aoi(&self, id: i64, sink: &dyn ProgressSink) -> Result<IngestResult, IngestError> {
        let found = self.search_aoi(id, sink)?;
        self.ingest_records(found.records, sink)
    }

    pub fn ingest_records(
        &self,
        records: Vec<CatalogRecord>,
        sink: &dyn ProgressSink,
    ) -> Result<IngestResult, IngestError> {
        let started = Instant::now();
        let token = self.tokens.token()?;
        sink.event(ProgressEvent {
            message: format!("phase=Ingest; {} candidate(s)", records.len()),
            elapsed: None,
        });
        let handle = spawn_ingestion(Arc::clone(&self.pipeline), records, token)?;
        let batch_id = handle.batch_id().to_string();
        let report = handle.wait()?;
        sink.event(ProgressEvent {
            message: format!(
                "phase=Done; fetched={} failed={} indexed={}",
                report.fetched.len(),
                report.failed.len(),
                report.indexed_count
            ),
            elapsed: Some(started.elapsed()),
        });
        Ok(IngestResult { batch_id, report })
    }

    pub fn footprints(&self, bbox: Option<[f64; 4]>) -> Result<FootprintList, IngestError> {
        let index = self.pipeline.metadata().load_index()?;
        let rows = match bbox {
            Some(bbox) => index.rows_intersecting(bbox).into_iter().cloned().collect(),
            None => index.rows,
        };
        Ok(FootprintList { bbox, rows })
    }
}
