use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;

use sentinel_safe_ingest::config::{Config, ConfigLoader, DEFAULT_COLLECTION};
use sentinel_safe_ingest::error::IngestError;

#[test]
fn parse_full_config_file() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("safe-ingest.json");
    fs::write(
        &path,
        r#"{
            "schema_version": 1,
            "endpoints": {
                "catalog": "https://catalogue.example.test/",
                "graph_api": "http://127.0.0.1:7474/"
            },
            "storage": {
                "object_root": "/srv/minio",
                "bucket": "s2-raw",
                "database": "/srv/catalog.sqlite"
            },
            "ingestion": {
                "workers": 8,
                "max_attempts": 5,
                "base_delay_ms": 50,
                "verify_archives": false
            }
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();

    assert_eq!(resolved.endpoints.catalog, "https://catalogue.example.test");
    assert_eq!(resolved.endpoints.graph_api.as_deref(), Some("http://127.0.0.1:7474"));
    assert_eq!(resolved.endpoints.zipper, "https://zipper.dataspace.copernicus.eu");
    assert_eq!(resolved.storage.bucket, "s2-raw");
    assert_eq!(resolved.storage.object_root.as_str(), "/srv/minio");
    assert_eq!(resolved.ingestion.workers, 8);
    assert_eq!(resolved.ingestion.retry.max_attempts, 5);
    assert_eq!(resolved.ingestion.retry.base_delay, Duration::from_millis(50));
    assert_eq!(resolved.ingestion.collection, DEFAULT_COLLECTION);
    assert!(!resolved.ingestion.verify_archives);
}

#[test]
fn explicit_missing_file_is_an_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("absent.json");
    let err = ConfigLoader::resolve(path.to_str()).unwrap_err();
    assert_matches!(err, IngestError::ConfigRead(_));
}

#[test]
fn malformed_json_is_reported() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("broken.json");
    fs::write(&path, "{ \"ingestion\": ").unwrap();
    let err = ConfigLoader::resolve(path.to_str()).unwrap_err();
    assert_matches!(err, IngestError::ConfigParse(_));
}

#[test]
fn zero_workers_is_rejected() {
    let config: Config = serde_json::from_str(r#"{"ingestion": {"workers": 0}}"#).unwrap();
    let err = ConfigLoader::resolve_config(config).unwrap_err();
    assert_matches!(err, IngestError::ConfigParse(_));
}
