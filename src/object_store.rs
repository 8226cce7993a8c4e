use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::{self, Read, Write};
use std::sync::{Mutex, RwLock};
use std::time::UNIX_EPOCH;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::IngestError;

const STAGING_DIR: &str = ".staging";
const SIDECAR_DIR: &str = ".meta";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub version: String,
    pub content_type: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatResult {
    Exists(ObjectMeta),
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePrecondition {
    None,
    DoesNotExist,
    MatchesVersion(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    Written(ObjectMeta),
    PreconditionFailed { current_version: Option<String> },
}

pub trait ObjectStore: Send + Sync {
    fn bucket_exists(&self, bucket: &str) -> Result<bool, IngestError>;
    fn make_bucket(&self, bucket: &str) -> Result<(), IngestError>;
    /// Reads exactly `length` bytes from `data`; a shorter or longer stream
    /// is rejected and leaves any previous object under `key` untouched.
    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: &mut dyn Read,
        length: u64,
        content_type: &str,
        precondition: WritePrecondition,
    ) -> Result<WriteResult, IngestError>;
    fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, IngestError>;
    fn stat_object(&self, bucket: &str, key: &str) -> Result<StatResult, IngestError>;
}

pub fn ensure_bucket(store: &dyn ObjectStore, bucket: &str) -> Result<(), IngestError> {
    if store.bucket_exists(bucket)? {
        debug!(bucket, "bucket already exists");
        return Ok(());
    }
    store.make_bucket(bucket)?;
    info!(bucket, "created bucket");
    Ok(())
}

fn validate_key(key: &str) -> Result<(), IngestError> {
    let is_valid = !key.is_empty()
        && !key.starts_with('/')
        && key
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
        && !key.starts_with(STAGING_DIR)
        && !key.starts_with(SIDECAR_DIR);
    if !is_valid {
        return Err(IngestError::ObjectStore(format!("invalid object key: {key}")));
    }
    Ok(())
}

fn copy_exact(data: &mut dyn Read, sink: &mut dyn Write, length: u64) -> Result<(), IngestError> {
    let mut limited = data.take(length.saturating_add(1));
    let received = io::copy(&mut limited, sink)
        .map_err(|err| IngestError::ObjectStore(format!("upload stream failed: {err}")))?;
    if received < length {
        return Err(IngestError::ShortRead {
            expected: length,
            received,
        });
    }
    if received > length {
        return Err(IngestError::ObjectStore(format!(
            "upload stream exceeds declared length {length}"
        )));
    }
    Ok(())
}

#[derive(Debug)]
pub struct FsObjectStore {
    root: Utf8PathBuf,
    commit: Mutex<()>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    content_type: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    sha256: Option<String>,
}

struct HashingWriter<'a> {
    inner: &'a mut dyn Write,
    hasher: Sha256,
}

impl Write for HashingWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl FsObjectStore {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            commit: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn bucket_dir(&self, bucket: &str) -> Result<Utf8PathBuf, IngestError> {
        if bucket.is_empty() || bucket.contains('/') || bucket.starts_with('.') {
            return Err(IngestError::ObjectStore(format!(
                "invalid bucket name: {bucket}"
            )));
        }
        Ok(self.root.join(bucket))
    }

    pub fn object_path(&self, bucket: &str, key: &str) -> Result<Utf8PathBuf, IngestError> {
        validate_key(key)?;
        Ok(self.bucket_dir(bucket)?.join(key))
    }

    fn sidecar_path(&self, bucket: &str, key: &str) -> Result<Utf8PathBuf, IngestError> {
        Ok(self
            .bucket_dir(bucket)?
            .join(SIDECAR_DIR)
            .join(format!("{key}.json")))
    }

    fn read_meta(&self, bucket: &str, key: &str) -> Result<StatResult, IngestError> {
        let path = self.object_path(bucket, key)?;
        let metadata = match fs::metadata(path.as_std_path()) {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return Ok(StatResult::NotFound),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(StatResult::NotFound),
            Err(err) => return Err(IngestError::ObjectStore(err.to_string())),
        };
        let modified = metadata
            .modified()
            .map_err(|err| IngestError::ObjectStore(err.to_string()))?;
        let nanos = modified
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or_default();
        let sidecar = fs::read(self.sidecar_path(bucket, key)?.as_std_path())
            .ok()
            .and_then(|bytes| serde_json::from_slice::<Sidecar>(&bytes).ok());
        // A sidecar describing a different size belongs to another write.
        let version = sidecar
            .as_ref()
            .filter(|sidecar| sidecar.size == Some(metadata.len()))
            .and_then(|sidecar| sidecar.sha256.clone())
            .unwrap_or_else(|| format!("{nanos:x}-{:x}", metadata.len()));
        Ok(StatResult::Exists(ObjectMeta {
            key: key.to_string(),
            size: metadata.len(),
            version,
            content_type: sidecar.map(|sidecar| sidecar.content_type),
            last_modified: Some(DateTime::<Utc>::from(modified)),
        }))
    }
}

impl ObjectStore for FsObjectStore {
    fn bucket_exists(&self, bucket: &str) -> Result<bool, IngestError> {
        Ok(self.bucket_dir(bucket)?.as_std_path().is_dir())
    }

    fn make_bucket(&self, bucket: &str) -> Result<(), IngestError> {
        let dir = self.bucket_dir(bucket)?;
        fs::create_dir_all(dir.join(STAGING_DIR).as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        fs::create_dir_all(dir.join(SIDECAR_DIR).as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))
    }

    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: &mut dyn Read,
        length: u64,
        content_type: &str,
        precondition: WritePrecondition,
    ) -> Result<WriteResult, IngestError> {
        let target = self.object_path(bucket, key)?;
        if !self.bucket_exists(bucket)? {
            return Err(IngestError::ObjectStore(format!(
                "bucket does not exist: {bucket}"
            )));
        }
        let staging_dir = self.bucket_dir(bucket)?.join(STAGING_DIR);
        fs::create_dir_all(staging_dir.as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        let mut staged = tempfile::Builder::new()
            .prefix("upload")
            .tempfile_in(staging_dir.as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        let mut hashing = HashingWriter {
            inner: staged.as_file_mut(),
            hasher: Sha256::new(),
        };
        copy_exact(data, &mut hashing, length)?;
        let digest = hex::encode(hashing.hasher.finalize());
        staged
            .as_file()
            .sync_all()
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;

        let _guard = self
            .commit
            .lock()
            .map_err(|_| IngestError::ObjectStore("commit lock poisoned".to_string()))?;
        let current = self.read_meta(bucket, key)?;
        let precondition_holds = match (&precondition, &current) {
            (WritePrecondition::None, _) => true,
            (WritePrecondition::DoesNotExist, StatResult::NotFound) => true,
            (WritePrecondition::DoesNotExist, StatResult::Exists(_)) => false,
            (WritePrecondition::MatchesVersion(expected), StatResult::Exists(meta)) => {
                meta.version == *expected
            }
            (WritePrecondition::MatchesVersion(_), StatResult::NotFound) => false,
        };
        if !precondition_holds {
            let current_version = match current {
                StatResult::Exists(meta) => Some(meta.version),
                StatResult::NotFound => None,
            };
            return Ok(WriteResult::PreconditionFailed { current_version });
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        }
        staged
            .persist(target.as_std_path())
            .map_err(|err| IngestError::ObjectStore(err.to_string()))?;

        let sidecar = self.sidecar_path(bucket, key)?;
        let payload = serde_json::to_vec(&Sidecar {
            content_type: content_type.to_string(),
            size: Some(length),
            sha256: Some(digest),
        })
        .map_err(|err| IngestError::ObjectStore(err.to_string()))?;
        write_bytes_atomic(&sidecar, &payload)?;

        match self.read_meta(bucket, key)? {
            StatResult::Exists(meta) if meta.size == length => Ok(WriteResult::Written(meta)),
            StatResult::Exists(meta) => Err(IngestError::ObjectStore(format!(
                "stored size {} does not match declared length {length}",
                meta.size
            ))),
            StatResult::NotFound => Err(IngestError::ObjectStore(format!(
                "object {key} missing after write"
            ))),
        }
    }

    fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, IngestError> {
        let path = self.object_path(bucket, key)?;
        fs::read(path.as_std_path())
            .map_err(|err| IngestError::ObjectStore(format!("get {bucket}/{key}: {err}")))
    }

    fn stat_object(&self, bucket: &str, key: &str) -> Result<StatResult, IngestError> {
        self.read_meta(bucket, key)
    }
}

fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), IngestError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
    }
    let tmp_path = path.with_extension("json.tmp");
    fs::write(tmp_path.as_std_path(), content)
        .map_err(|err| IngestError::Filesystem(err.to_string()))?;
    fs::rename(tmp_path.as_std_path(), path.as_std_path())
        .map_err(|err| IngestError::Filesystem(err.to_string()))?;
    Ok(())
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    version: u64,
    content_type: String,
    last_modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    buckets: RwLock<HashMap<String, HashMap<String, StoredObject>>>,
    failing_keys: RwLock<BTreeSet<String>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes_to(&self, key: &str) {
        if let Ok(mut failing) = self.failing_keys.write() {
            failing.insert(key.to_string());
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut failing) = self.failing_keys.write() {
            failing.clear();
        }
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let buckets = match self.buckets.read() {
            Ok(buckets) => buckets,
            Err(_) => return Vec::new(),
        };
        let mut keys = buckets
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    fn meta(key: &str, object: &StoredObject) -> ObjectMeta {
        ObjectMeta {
            key: key.to_string(),
            size: object.data.len() as u64,
            version: object.version.to_string(),
            content_type: Some(object.content_type.clone()),
            last_modified: Some(object.last_modified),
        }
    }
}

impl ObjectStore for MemoryObjectStore {
    fn bucket_exists(&self, bucket: &str) -> Result<bool, IngestError> {
        let buckets = self
            .buckets
            .read()
            .map_err(|_| IngestError::ObjectStore("lock poisoned".to_string()))?;
        Ok(buckets.contains_key(bucket))
    }

    fn make_bucket(&self, bucket: &str) -> Result<(), IngestError> {
        let mut buckets = self
            .buckets
            .write()
            .map_err(|_| IngestError::ObjectStore("lock poisoned".to_string()))?;
        buckets.entry(bucket.to_string()).or_default();
        Ok(())
    }

    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: &mut dyn Read,
        length: u64,
        content_type: &str,
        precondition: WritePrecondition,
    ) -> Result<WriteResult, IngestError> {
        validate_key(key)?;
        let injected = self
            .failing_keys
            .read()
            .map(|failing| failing.contains(key))
            .unwrap_or(false);
        if injected {
            return Err(IngestError::ObjectStore(format!(
                "injected write failure for {key}"
            )));
        }

        let mut buffer = Vec::with_capacity(usize::try_from(length).unwrap_or(0));
        copy_exact(data, &mut buffer, length)?;

        let mut buckets = self
            .buckets
            .write()
            .map_err(|_| IngestError::ObjectStore("lock poisoned".to_string()))?;
        let objects = buckets
            .get_mut(bucket)
            .ok_or_else(|| IngestError::ObjectStore(format!("bucket does not exist: {bucket}")))?;
        let current = objects.get(key);
        let precondition_holds = match (&precondition, current) {
            (WritePrecondition::None, _) => true,
            (WritePrecondition::DoesNotExist, current) => current.is_none(),
            (WritePrecondition::MatchesVersion(expected), Some(object)) => {
                object.version.to_string() == *expected
            }
            (WritePrecondition::MatchesVersion(_), None) => false,
        };
        if !precondition_holds {
            return Ok(WriteResult::PreconditionFailed {
                current_version: current.map(|object| object.version.to_string()),
            });
        }

        let version = current.map_or(1, |object| object.version + 1);
        let object = StoredObject {
            data: buffer,
            version,
            content_type: content_type.to_string(),
            last_modified: Utc::now(),
        };
        let meta = Self::meta(key, &object);
        objects.insert(key.to_string(), object);
        Ok(WriteResult::Written(meta))
    }

    fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, IngestError> {
        let buckets = self
            .buckets
            .read()
            .map_err(|_| IngestError::ObjectStore("lock poisoned".to_string()))?;
        buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .map(|object| object.data.clone())
            .ok_or_else(|| IngestError::ObjectStore(format!("object not found: {bucket}/{key}")))
    }

    fn stat_object(&self, bucket: &str, key: &str) -> Result<StatResult, IngestError> {
        let buckets = self
            .buckets
            .read()
            .map_err(|_| IngestError::ObjectStore("lock poisoned".to_string()))?;
        Ok(buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .map(|object| StatResult::Exists(Self::meta(key, object)))
            .unwrap_or(StatResult::NotFound))
    }
}
