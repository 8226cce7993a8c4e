use std::collections::BTreeSet;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::catalog_index::{CatalogIndexWriter, ExistenceOracle};
use crate::domain::{IndexedRecord, RecordId};
use crate::error::IngestError;

pub const NODE_LABELS: [&str; 5] = ["Metadata", "Record", "SAFE", "Sentinel", "Imagery"];

#[derive(Debug, Deserialize)]
struct ExistsEntry {
    id: String,
    exists: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodePayload {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub query_type: &'static str,
    pub labels: Vec<&'static str>,
    pub properties: NodeProperties,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeProperties {
    pub id: String,
    pub name: String,
    pub collection_start_date: Option<String>,
    pub collection_end_date: Option<String>,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub origin_date: Option<String>,
    pub publication_date: Option<String>,
    pub eviction_date: Option<String>,
    pub modification_date: Option<String>,
    pub external_s3_path: Option<String>,
    pub footprint: String,
    pub local_blob_storage_path: String,
}

impl From<&IndexedRecord> for NodePayload {
    fn from(indexed: &IndexedRecord) -> Self {
        let record = &indexed.record;
        let stamp = |time: Option<chrono::DateTime<chrono::Utc>>| {
            time.map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        };
        Self {
            kind: "node",
            query_type: "CREATE",
            labels: NODE_LABELS.to_vec(),
            properties: NodeProperties {
                id: record.id.to_string(),
                name: record.name.clone(),
                collection_start_date: stamp(record.content_date.start),
                collection_end_date: stamp(record.content_date.end),
                content_type: record.content_type.clone(),
                content_length: record.content_length,
                origin_date: stamp(record.origin_date),
                publication_date: stamp(record.publication_date),
                eviction_date: stamp(record.eviction_date),
                modification_date: stamp(record.modification_date),
                external_s3_path: record.s3_path.clone(),
                footprint: record.footprint.to_string(),
                local_blob_storage_path: indexed.local_storage_path.clone(),
            },
        }
    }
}

#[derive(Clone)]
pub struct GraphApiClient {
    client: Client,
    base_url: String,
}

impl GraphApiClient {
    pub fn new(base_url: &str) -> Result<Self, IngestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("safe-ingest/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| IngestError::GraphHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| IngestError::GraphHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn handle_status(response: Response) -> Result<Response, IngestError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "graph API request failed".to_string());
        Err(IngestError::GraphStatus { status, message })
    }
}

impl ExistenceOracle for GraphApiClient {
    fn check_existing(&self, ids: &BTreeSet<RecordId>) -> Result<BTreeSet<RecordId>, IngestError> {
        if ids.is_empty() {
            return Ok(BTreeSet::new());
        }
        let joined = ids
            .iter()
            .map(RecordId::as_str)
            .collect::<Vec<_>>()
            .join(",");
        let response = self
            .client
            .get(format!("{}/v1/api/exists", self.base_url))
            .query(&[("post_ids", joined.as_str())])
            .send()
            .map_err(|err| IngestError::GraphHttp(err.to_string()))?;
        let entries: Vec<ExistsEntry> = Self::handle_status(response)?
            .json()
            .map_err(|err| IngestError::GraphHttp(err.to_string()))?;

        let mut existing = BTreeSet::new();
        for entry in entries.into_iter().filter(|entry| entry.exists) {
            let id = entry.id.parse::<RecordId>()?;
            // Only the asked-about identifiers count.
            if ids.contains(&id) {
                existing.insert(id);
            } else {
                warn!(id = %id, "graph API reported an identifier that was not queried");
            }
        }
        debug!(checked = ids.len(), existing = existing.len(), "graph existence check");
        Ok(existing)
    }
}

/// Builds CREATE payloads for records whose identifier is neither already in
/// the graph nor repeated earlier in the batch.
pub fn fresh_nodes(
    oracle: &dyn ExistenceOracle,
    records: &[IndexedRecord],
) -> Result<Vec<NodePayload>, IngestError> {
    let ids = records
        .iter()
        .map(|indexed| indexed.record.id.clone())
        .collect::<BTreeSet<_>>();
    let mut skip = oracle.check_existing(&ids)?;
    let nodes = records
        .iter()
        .filter(|indexed| skip.insert(indexed.record.id.clone()))
        .map(NodePayload::from)
        .collect::<Vec<_>>();
    if nodes.len() < records.len() {
        debug!(
            input = records.len(),
            fresh = nodes.len(),
            "graph nodes already present were skipped"
        );
    }
    Ok(nodes)
}

impl CatalogIndexWriter for GraphApiClient {
    fn append_indexed(&self, records: &[IndexedRecord]) -> Result<usize, IngestError> {
        if records.is_empty() {
            return Ok(0);
        }
        let nodes = fresh_nodes(self, records)?;
        if nodes.is_empty() {
            return Ok(0);
        }
        let response = self
            .client
            .post(format!("{}/v1/api/run_query", self.base_url))
            .json(&nodes)
            .send()
            .map_err(|err| IngestError::GraphHttp(err.to_string()))?;
        let created: Vec<Value> = Self::handle_status(response)?
            .json()
            .map_err(|err| IngestError::GraphHttp(err.to_string()))?;
        info!(
            input = records.len(),
            posted = nodes.len(),
            created = created.len(),
            "graph catalog nodes created"
        );
        Ok(created.len())
    }
}
