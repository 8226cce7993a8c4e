use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::IngestError;

pub const DEFAULT_SRID: u32 = 4326;
pub const ASSET_KEY_SUFFIX: &str = ".SAFE.zip";
pub const ASSET_CONTENT_TYPE: &str = "application/zip";

static FOOTPRINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:geography')?(?:SRID=(\d+);)?([A-Za-z]+\s*\(.*\))'?$").unwrap()
});
static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-?\d+(?:\.\d+)?(?:[eE][-+]?\d+)?").unwrap());

/// Catalog product identifier. Used verbatim in object keys, so it is
/// restricted to characters that cannot escape a key prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordId(String);

impl RecordId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn asset_key(&self) -> String {
        format!("{}{ASSET_KEY_SUFFIX}", self.0)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        let is_valid = !normalized.is_empty()
            && !normalized.starts_with('.')
            && normalized
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
        if !is_valid {
            return Err(IngestError::InvalidRecord(format!(
                "invalid identifier: {value:?}"
            )));
        }
        Ok(Self(normalized.to_string()))
    }
}

impl TryFrom<String> for RecordId {
    type Error = IngestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RecordId> for String {
    fn from(value: RecordId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Footprint {
    srid: u32,
    wkt: String,
}

impl Footprint {
    pub fn new(srid: u32, wkt: impl Into<String>) -> Self {
        Self {
            srid,
            wkt: wkt.into(),
        }
    }

    pub fn srid(&self) -> u32 {
        self.srid
    }

    pub fn wkt(&self) -> &str {
        &self.wkt
    }

    pub fn bbox(&self) -> Option<[f64; 4]> {
        let numbers = NUMBER_RE
            .find_iter(&self.wkt)
            .filter_map(|m| m.as_str().parse::<f64>().ok())
            .collect::<Vec<_>>();
        if numbers.len() < 2 || numbers.len() % 2 != 0 {
            return None;
        }
        let mut bbox = [f64::MAX, f64::MAX, f64::MIN, f64::MIN];
        for pair in numbers.chunks_exact(2) {
            bbox[0] = bbox[0].min(pair[0]);
            bbox[1] = bbox[1].min(pair[1]);
            bbox[2] = bbox[2].max(pair[0]);
            bbox[3] = bbox[3].max(pair[1]);
        }
        Some(bbox)
    }
}

impl fmt::Display for Footprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "geography'SRID={};{}'", self.srid, self.wkt)
    }
}

impl FromStr for Footprint {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let captures = FOOTPRINT_RE
            .captures(trimmed)
            .ok_or_else(|| IngestError::InvalidFootprint(value.to_string()))?;
        let srid = match captures.get(1) {
            Some(raw) => raw
                .as_str()
                .parse::<u32>()
                .map_err(|_| IngestError::InvalidFootprint(value.to_string()))?,
            None => DEFAULT_SRID,
        };
        let wkt = captures
            .get(2)
            .map(|m| m.as_str().trim().to_string())
            .ok_or_else(|| IngestError::InvalidFootprint(value.to_string()))?;
        Ok(Self { srid, wkt })
    }
}

impl TryFrom<String> for Footprint {
    type Error = IngestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Footprint> for String {
    fn from(value: Footprint) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Checksum {
    pub value: String,
    pub algorithm: String,
    #[serde(default)]
    pub checksum_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContentDateRange {
    #[serde(default, with = "lenient_time")]
    pub start: Option<DateTime<Utc>>,
    #[serde(default, with = "lenient_time")]
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CatalogRecord {
    pub id: RecordId,
    pub name: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub content_length: Option<u64>,
    #[serde(default, with = "lenient_time")]
    pub origin_date: Option<DateTime<Utc>>,
    #[serde(default, with = "lenient_time")]
    pub publication_date: Option<DateTime<Utc>>,
    #[serde(default, with = "lenient_time")]
    pub eviction_date: Option<DateTime<Utc>>,
    #[serde(default, with = "lenient_time")]
    pub modification_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub online: bool,
    #[serde(default, rename = "S3Path")]
    pub s3_path: Option<String>,
    #[serde(default)]
    pub checksum: Vec<Checksum>,
    #[serde(default)]
    pub content_date: ContentDateRange,
    pub footprint: Footprint,
    #[serde(default)]
    pub geo_footprint: Option<Value>,
}

impl CatalogRecord {
    pub fn asset_key(&self) -> String {
        self.id.asset_key()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestedAsset {
    pub id: RecordId,
    pub key: String,
    pub byte_length: u64,
    pub content_type: String,
}

#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(***)")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexedRecord {
    pub record: CatalogRecord,
    pub local_storage_path: String,
}

impl IndexedRecord {
    pub fn new(record: CatalogRecord) -> Self {
        let local_storage_path = record.asset_key();
        Self {
            record,
            local_storage_path,
        }
    }
}

pub fn parse_catalog_page(body: &Value) -> Result<Vec<CatalogRecord>, IngestError> {
    let items = body
        .get("value")
        .and_then(|value| value.as_array())
        .ok_or_else(|| IngestError::InvalidRecord("response has no value array".to_string()))?;
    let mut records = Vec::with_capacity(items.len());
    for (position, item) in items.iter().enumerate() {
        match serde_json::from_value::<CatalogRecord>(item.clone()) {
            Ok(record) => records.push(record),
            Err(err) => {
                let id = item.get("Id").and_then(Value::as_str).unwrap_or("<missing>");
                warn!(position, id, error = %err, "skipping unparseable catalog record");
            }
        }
    }
    Ok(records)
}

pub fn dedup_by_id(records: Vec<CatalogRecord>) -> Vec<CatalogRecord> {
    let mut seen = std::collections::HashSet::new();
    records
        .into_iter()
        .filter(|record| seen.insert(record.id.clone()))
        .collect()
}

pub(crate) mod lenient_time {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(time) => {
                serializer.serialize_str(&time.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(text) => DateTime::parse_from_rfc3339(text)
                .map(|time| Some(time.with_timezone(&Utc)))
                .map_err(serde::de::Error::custom),
        }
    }
}
