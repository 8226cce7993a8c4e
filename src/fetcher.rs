use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use reqwest::blocking::Client;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use tracing::{debug, info, warn};

use crate::domain::{ASSET_CONTENT_TYPE, AuthToken, CatalogRecord, IngestedAsset, RecordId};
use crate::error::IngestError;
use crate::fs_util;
use crate::object_store::{ObjectStore, WritePrecondition, WriteResult, ensure_bucket};
use crate::retry::{Attempted, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadInfo {
    pub received: u64,
    pub expected: Option<u64>,
}

pub trait AssetSource: Send + Sync {
    fn download(
        &self,
        id: &RecordId,
        token: &AuthToken,
        sink: &mut dyn Write,
    ) -> Result<DownloadInfo, IngestError>;
}

#[derive(Clone)]
pub struct ZipperHttpClient {
    client: Client,
    base_url: String,
}

impl ZipperHttpClient {
    pub fn new(base_url: &str) -> Result<Self, IngestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("safe-ingest/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| IngestError::DownloadHttp(err.to_string()))?,
        );
        // Archives run to gigabytes; only the connect phase is bounded.
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(30))
            .timeout(None)
            .build()
            .map_err(|err| IngestError::DownloadHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn product_url(&self, id: &RecordId) -> String {
        format!("{}/odata/v1/Products({})/$value", self.base_url, id.as_str())
    }
}

impl AssetSource for ZipperHttpClient {
    fn download(
        &self,
        id: &RecordId,
        token: &AuthToken,
        sink: &mut dyn Write,
    ) -> Result<DownloadInfo, IngestError> {
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token.as_str()))
            .map_err(|err| IngestError::DownloadHttp(err.to_string()))?;
        let mut response = self
            .client
            .get(self.product_url(id))
            .header(AUTHORIZATION, bearer)
            .send()
            .map_err(|err| IngestError::DownloadHttp(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "download request failed".to_string());
            return Err(IngestError::DownloadStatus { status, message });
        }
        let expected = response.content_length();
        let received = std::io::copy(&mut response, sink)
            .map_err(|err| IngestError::DownloadHttp(err.to_string()))?;
        Ok(DownloadInfo { received, expected })
    }
}

#[derive(Debug)]
pub enum FetchOutcome {
    Stored {
        asset: IngestedAsset,
        attempts: u32,
    },
    Failed {
        id: RecordId,
        attempts: u32,
        error: IngestError,
    },
}

impl FetchOutcome {
    pub fn id(&self) -> &RecordId {
        match self {
            FetchOutcome::Stored { asset, .. } => &asset.id,
            FetchOutcome::Failed { id, .. } => id,
        }
    }
}

pub struct AssetFetcher {
    source: Arc<dyn AssetSource>,
    store: Arc<dyn ObjectStore>,
    bucket: String,
    retry: RetryPolicy,
    verify_archives: bool,
    spool_dir: Option<Utf8PathBuf>,
}

impl AssetFetcher {
    pub fn new(
        source: Arc<dyn AssetSource>,
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            source,
            store,
            bucket: bucket.into(),
            retry,
            verify_archives: true,
            spool_dir: None,
        }
    }

    pub fn with_archive_verification(mut self, enabled: bool) -> Self {
        self.verify_archives = enabled;
        self
    }

    pub fn with_spool_dir(mut self, dir: Utf8PathBuf) -> Self {
        self.spool_dir = Some(dir);
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Downloads the archive for `record` and stores it under its
    /// deterministic key. Never returns `Stored` unless the object store
    /// acknowledged a complete, length-checked write.
    pub fn fetch_and_store(&self, record: &CatalogRecord, token: &AuthToken) -> FetchOutcome {
        let key = record.asset_key();
        let attempted = self
            .retry
            .run(record.id.as_str(), |attempt| self.fetch_once(record, token, &key, attempt));
        match attempted {
            Attempted::Success { value, attempts } => {
                info!(
                    id = %record.id,
                    key = %value.key,
                    bytes = value.byte_length,
                    attempts,
                    "stored archive"
                );
                FetchOutcome::Stored {
                    asset: value,
                    attempts,
                }
            }
            Attempted::Failed { error, attempts } => {
                warn!(id = %record.id, attempts, %error, "archive fetch failed");
                FetchOutcome::Failed {
                    id: record.id.clone(),
                    attempts,
                    error: IngestError::FetchFailed {
                        id: record.id.to_string(),
                        message: error.to_string(),
                    },
                }
            }
        }
    }

    fn fetch_once(
        &self,
        record: &CatalogRecord,
        token: &AuthToken,
        key: &str,
        attempt: u32,
    ) -> Result<IngestedAsset, IngestError> {
        debug!(id = %record.id, attempt, "requesting archive");
        let mut builder = tempfile::Builder::new();
        builder.prefix("safe-ingest-spool");
        let mut spooled = match &self.spool_dir {
            Some(dir) => builder.tempfile_in(dir.as_std_path()),
            None => builder.tempfile(),
        }
        .map_err(|err| IngestError::Filesystem(err.to_string()))?;

        let start = std::time::Instant::now();
        let info = self
            .source
            .download(&record.id, token, spooled.as_file_mut())?;
        spooled
            .as_file_mut()
            .flush()
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        debug!(
            id = %record.id,
            bytes = info.received,
            latency_ms = start.elapsed().as_millis() as u64,
            "download finished"
        );

        if let Some(expected) = info.expected {
            if expected != info.received {
                return Err(IngestError::ShortRead {
                    expected,
                    received: info.received,
                });
            }
        }
        if info.received == 0 {
            return Err(IngestError::ShortRead {
                expected: info.expected.unwrap_or(1),
                received: 0,
            });
        }
        if self.verify_archives {
            fs_util::validate_zip(spooled.path())?;
        }

        ensure_bucket(self.store.as_ref(), &self.bucket)?;
        let length = info.received;
        let file = spooled.as_file_mut();
        file.seek(SeekFrom::Start(0))
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        let written = self.store.put_object(
            &self.bucket,
            key,
            file,
            length,
            ASSET_CONTENT_TYPE,
            WritePrecondition::None,
        )?;
        match written {
            WriteResult::Written(meta) if meta.size == length => Ok(IngestedAsset {
                id: record.id.clone(),
                key: key.to_string(),
                byte_length: meta.size,
                content_type: ASSET_CONTENT_TYPE.to_string(),
            }),
            WriteResult::Written(meta) => Err(IngestError::ObjectStore(format!(
                "stored {} bytes for {key}, expected {length}",
                meta.size
            ))),
            WriteResult::PreconditionFailed { .. } => Err(IngestError::ObjectStore(format!(
                "unconditional write to {key} was rejected"
            ))),
        }
    }
}
