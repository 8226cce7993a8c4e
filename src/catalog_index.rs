use std::collections::BTreeSet;
use std::fs;
use std::sync::Mutex;

use camino::Utf8Path;
use chrono::SecondsFormat;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use tracing::{debug, info};

use crate::domain::{IndexedRecord, RecordId};
use crate::error::IngestError;

const MAX_QUERY_PARAMS: usize = 32_000;

pub trait ExistenceOracle: Send + Sync {
    fn check_existing(&self, ids: &BTreeSet<RecordId>) -> Result<BTreeSet<RecordId>, IngestError>;
}

pub trait CatalogIndexWriter: Send + Sync {
    /// Inserts rows for records without one; existing identifiers are left
    /// untouched. Returns the number of rows actually inserted.
    fn append_indexed(&self, records: &[IndexedRecord]) -> Result<usize, IngestError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS copernicus_ingested_catalog (
    Id TEXT PRIMARY KEY,
    Name TEXT,
    ContentType TEXT,
    ContentLength TEXT,
    OriginDate TEXT,
    PublicationDate TEXT,
    EvictionDate TEXT,
    ModificationDate TEXT,
    Online TEXT,
    S3Path TEXT,
    Checksum TEXT,
    ContentDate TEXT,
    Footprint TEXT,
    GeoFootprint TEXT,
    LocalStoragePath TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS aoi_extents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    aoi_name TEXT NOT NULL,
    aoi_wkt TEXT NOT NULL,
    created_at TEXT NOT NULL
);
";

pub fn open_database(path: &Utf8Path) -> Result<Connection, IngestError> {
    if let Some(parent) = path.parent() {
        if !parent.as_str().is_empty() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        }
    }
    let conn = Connection::open(path.as_std_path())?;
    conn.execute_batch(SCHEMA)?;
    debug!(path = %path, "opened catalog database");
    Ok(conn)
}

pub fn open_memory_database() -> Result<Connection, IngestError> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

pub struct SqliteCatalogIndex {
    conn: Mutex<Connection>,
}

impl SqliteCatalogIndex {
    pub fn open(path: &Utf8Path) -> Result<Self, IngestError> {
        Ok(Self {
            conn: Mutex::new(open_database(path)?),
        })
    }

    pub fn open_in_memory() -> Result<Self, IngestError> {
        Ok(Self {
            conn: Mutex::new(open_memory_database()?),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, IngestError> {
        self.conn
            .lock()
            .map_err(|_| IngestError::Database("connection lock poisoned".to_string()))
    }

    pub fn count(&self) -> Result<usize, IngestError> {
        let conn = self.conn()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM copernicus_ingested_catalog", [], |row| {
                row.get(0)
            })?;
        Ok(count as usize)
    }

    pub fn ids(&self) -> Result<Vec<RecordId>, IngestError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT Id FROM copernicus_ingested_catalog ORDER BY Id")?;
        let raw = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter().map(|id| id.parse::<RecordId>()).collect()
    }

    pub fn local_storage_path(&self, id: &RecordId) -> Result<Option<String>, IngestError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT LocalStoragePath FROM copernicus_ingested_catalog WHERE Id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?)
    }
}

impl ExistenceOracle for SqliteCatalogIndex {
    fn check_existing(&self, ids: &BTreeSet<RecordId>) -> Result<BTreeSet<RecordId>, IngestError> {
        if ids.is_empty() {
            return Ok(BTreeSet::new());
        }
        let conn = self.conn()?;
        let all = ids.iter().map(RecordId::as_str).collect::<Vec<_>>();
        let mut existing = BTreeSet::new();
        for chunk in all.chunks(MAX_QUERY_PARAMS) {
            let placeholders = (1..=chunk.len())
                .map(|i| format!("?{i}"))
                .collect::<Vec<_>>()
                .join(",");
            let sql = format!(
                "SELECT Id FROM copernicus_ingested_catalog WHERE Id IN ({placeholders})"
            );
            let mut stmt = conn.prepare(&sql)?;
            let found = stmt
                .query_map(params_from_iter(chunk.iter()), |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for id in found {
                existing.insert(id.parse::<RecordId>()?);
            }
        }
        debug!(checked = ids.len(), existing = existing.len(), "existence check");
        Ok(existing)
    }
}

impl CatalogIndexWriter for SqliteCatalogIndex {
    fn append_indexed(&self, records: &[IndexedRecord]) -> Result<usize, IngestError> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut inserted = 0usize;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO copernicus_ingested_catalog (
                    Id, Name, ContentType, ContentLength, OriginDate, PublicationDate,
                    EvictionDate, ModificationDate, Online, S3Path, Checksum, ContentDate,
                    Footprint, GeoFootprint, LocalStoragePath
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            )?;
            for indexed in records {
                let record = &indexed.record;
                let checksum = serde_json::to_string(&record.checksum)
                    .map_err(|err| IngestError::Database(err.to_string()))?;
                let content_date = serde_json::to_string(&record.content_date)
                    .map_err(|err| IngestError::Database(err.to_string()))?;
                let geo_footprint = record
                    .geo_footprint
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()
                    .map_err(|err| IngestError::Database(err.to_string()))?;
                inserted += stmt.execute(params![
                    record.id.as_str(),
                    record.name,
                    record.content_type,
                    record.content_length.map(|len| len.to_string()),
                    record.origin_date.map(format_time),
                    record.publication_date.map(format_time),
                    record.eviction_date.map(format_time),
                    record.modification_date.map(format_time),
                    record.online.to_string(),
                    record.s3_path,
                    checksum,
                    content_date,
                    record.footprint.to_string(),
                    geo_footprint,
                    indexed.local_storage_path,
                ])?;
            }
        }
        tx.commit()?;
        info!(input = records.len(), inserted, "catalog index append");
        Ok(inserted)
    }
}

fn format_time(time: chrono::DateTime<chrono::Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CatalogRecord;

    fn indexed(id: &str) -> IndexedRecord {
        let record: CatalogRecord = serde_json::from_value(serde_json::json!({
            "Id": id,
            "Name": format!("{id}.SAFE"),
            "Online": true,
            "Footprint": "geography'SRID=4326;POLYGON ((0 0, 1 0, 1 1, 0 0))'"
        }))
        .unwrap();
        IndexedRecord::new(record)
    }

    #[test]
    fn duplicate_identifiers_are_ignored() {
        let index = SqliteCatalogIndex::open_in_memory().unwrap();
        assert_eq!(index.append_indexed(&[indexed("a"), indexed("b")]).unwrap(), 2);
        assert_eq!(index.append_indexed(&[indexed("b"), indexed("c")]).unwrap(), 1);
        assert_eq!(index.count().unwrap(), 3);
        assert_eq!(
            index
                .local_storage_path(&"c".parse().unwrap())
                .unwrap()
                .as_deref(),
            Some("c.SAFE.zip")
        );
    }

    #[test]
    fn existence_check_returns_subset() {
        let index = SqliteCatalogIndex::open_in_memory().unwrap();
        index.append_indexed(&[indexed("a")]).unwrap();
        let ids = ["a", "b"]
            .iter()
            .map(|id| id.parse().unwrap())
            .collect::<BTreeSet<RecordId>>();
        let existing = index.check_existing(&ids).unwrap();
        assert_eq!(existing.len(), 1);
        assert!(existing.contains(&"a".parse().unwrap()));
    }
}
