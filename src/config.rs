use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::IngestError;
use crate::retry::RetryPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "safe-ingest.json";
pub const DEFAULT_BUCKET: &str = "sentinel-2-data";
pub const DEFAULT_METADATA_KEY: &str = "sentinel_2_metadata/uploaded_sentinel_2_footprints.json";
pub const DEFAULT_COLLECTION: &str = "SENTINEL-2";
pub const USERNAME_ENV: &str = "CDSE_USERNAME";
pub const PASSWORD_ENV: &str = "CDSE_PASSWORD";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub endpoints: EndpointsSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub ingestion: IngestionSection,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct EndpointsSection {
    #[serde(default)]
    pub catalog: Option<String>,
    #[serde(default)]
    pub zipper: Option<String>,
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub graph_api: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct StorageSection {
    #[serde(default)]
    pub object_root: Option<String>,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub metadata_key: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct IngestionSection {
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub base_delay_ms: Option<u64>,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
    #[serde(default)]
    pub verify_archives: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct Endpoints {
    pub catalog: String,
    pub zipper: String,
    pub identity: String,
    pub graph_api: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub object_root: Utf8PathBuf,
    pub bucket: String,
    pub metadata_key: String,
    pub database: Utf8PathBuf,
}

#[derive(Debug, Clone)]
pub struct IngestionSettings {
    pub collection: String,
    pub workers: usize,
    pub retry: RetryPolicy,
    pub verify_archives: bool,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub endpoints: Endpoints,
    pub storage: StorageSettings,
    pub ingestion: IngestionSettings,
}

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl Credentials {
    pub fn from_env() -> Result<Self, IngestError> {
        let username = read_env(USERNAME_ENV)?;
        let password = read_env(PASSWORD_ENV)?;
        Ok(Self { username, password })
    }
}

fn read_env(name: &str) -> Result<String, IngestError> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| IngestError::MissingCredential(name.to_string()))
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads the config from `path`, or from `safe-ingest.json` in the
    /// current directory. A missing default file falls back to built-in
    /// defaults; a missing explicit file is an error.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, IngestError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| IngestError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| IngestError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, IngestError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let endpoints = Endpoints {
            catalog: trim_url(
                config
                    .endpoints
                    .catalog
                    .unwrap_or_else(|| "https://catalogue.dataspace.copernicus.eu".to_string()),
            ),
            zipper: trim_url(
                config
                    .endpoints
                    .zipper
                    .unwrap_or_else(|| "https://zipper.dataspace.copernicus.eu".to_string()),
            ),
            identity: config.endpoints.identity.unwrap_or_else(|| {
                "https://identity.dataspace.copernicus.eu/auth/realms/CDSE/protocol/openid-connect/token"
                    .to_string()
            }),
            graph_api: config.endpoints.graph_api.map(trim_url),
        };

        let object_root = match config.storage.object_root {
            Some(root) => Utf8PathBuf::from(root),
            None => default_data_root()?.join("objects"),
        };
        let database = match config.storage.database {
            Some(path) => Utf8PathBuf::from(path),
            None => default_data_root()?.join("catalog.sqlite"),
        };
        let storage = StorageSettings {
            object_root,
            bucket: config
                .storage
                .bucket
                .unwrap_or_else(|| DEFAULT_BUCKET.to_string()),
            metadata_key: config
                .storage
                .metadata_key
                .unwrap_or_else(|| DEFAULT_METADATA_KEY.to_string()),
            database,
        };

        let defaults = RetryPolicy::default();
        let workers = config.ingestion.workers.unwrap_or(4);
        if workers == 0 {
            return Err(IngestError::ConfigParse(
                "ingestion.workers must be at least 1".to_string(),
            ));
        }
        let max_attempts = config
            .ingestion
            .max_attempts
            .unwrap_or(defaults.max_attempts);
        if max_attempts == 0 {
            return Err(IngestError::ConfigParse(
                "ingestion.max_attempts must be at least 1".to_string(),
            ));
        }
        let retry = RetryPolicy {
            max_attempts,
            base_delay: config
                .ingestion
                .base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            max_delay: config
                .ingestion
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
        };
        let ingestion = IngestionSettings {
            collection: config
                .ingestion
                .collection
                .unwrap_or_else(|| DEFAULT_COLLECTION.to_string()),
            workers,
            retry,
            verify_archives: config.ingestion.verify_archives.unwrap_or(true),
        };

        Ok(ResolvedConfig {
            schema_version,
            endpoints,
            storage,
            ingestion,
        })
    }
}

pub fn default_data_root() -> Result<Utf8PathBuf, IngestError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.data_local_dir().join("sentinel-safe-ingest")).ok()
        })
        .ok_or_else(|| IngestError::Filesystem("unable to resolve data directory".to_string()))
}

fn trim_url(value: String) -> String {
    value.trim_end_matches('/').to_string()
}
