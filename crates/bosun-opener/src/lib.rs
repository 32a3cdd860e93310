#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **bosun-opener** – Provider dispatch for uniform object I/O.
//!
//! The [`Opener`] parses logical path strings (`gs://…`, `s3://…`, absolute
//! local paths) and routes each operation to the matching driver crate.
//! Remote bucket handles are cached per bucket name so repeated access skips
//! credential and connection setup; local paths bypass remote providers
//! entirely.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tracing::debug;

use bosun_opener_file::FileStorage;
use bosun_opener_gcs::GcsClient;
use bosun_opener_s3::S3Client;

pub use bosun_opener_core::{
    is_not_exist, AttrUpdate, ByteReader, ObjectAttrs, ObjectInfo, ObjectIterator, ObjectPath,
    ObjectStorage, ObjectWriter, OpenerError, Provider, SignedUrlOptions, WriteOptions,
};
pub use bosun_opener_gcs::ServiceAccountKey;
pub use bosun_opener_s3::S3Credentials;

/// Credential sources for the remote providers.
#[derive(Debug, Clone, Default)]
pub struct OpenerConfig {
    /// GCS service-account JSON file; `None` runs anonymously.
    pub gcs_credentials_file: Option<PathBuf>,
    /// S3 credentials JSON blob; `None` uses the SDK default chain.
    pub s3_credentials_file: Option<PathBuf>,
}

/// Uniform streaming interface over every configured storage provider.
#[derive(Clone)]
pub struct Opener {
    inner: Arc<OpenerInner>,
}

struct OpenerInner {
    config: OpenerConfig,
    file: Arc<FileStorage>,
    handles: Mutex<HashMap<String, Arc<dyn ObjectStorage>>>,
}

impl Opener {
    /// Create an opener with the given credential sources.
    pub fn new(config: OpenerConfig) -> Self {
        Self {
            inner: Arc::new(OpenerInner {
                config,
                file: Arc::new(FileStorage::new()),
                handles: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The driver responsible for `path`, building and caching remote bucket
    /// handles on first use.
    async fn storage_for(&self, path: &ObjectPath) -> Result<Arc<dyn ObjectStorage>> {
        if path.provider == Provider::File {
            return Ok(Arc::clone(&self.inner.file) as Arc<dyn ObjectStorage>);
        }
        let key = format!("{}://{}", path.provider, path.bucket);
        let mut handles = self.inner.handles.lock().await;
        if let Some(handle) = handles.get(&key) {
            return Ok(Arc::clone(handle));
        }
        debug!(bucket = %key, "opening storage bucket handle");
        let handle: Arc<dyn ObjectStorage> = match path.provider {
            Provider::Gcs => Arc::new(
                GcsClient::from_credentials_file(
                    self.inner.config.gcs_credentials_file.as_deref(),
                )
                .await?,
            ),
            Provider::S3 => Arc::new(
                S3Client::from_credentials_file(self.inner.config.s3_credentials_file.as_deref())
                    .await?,
            ),
            Provider::File => unreachable!("local paths handled above"),
        };
        handles.insert(key, Arc::clone(&handle));
        Ok(handle)
    }

    /// Open `path` for reading.
    pub async fn reader(&self, path: &str) -> Result<ByteReader> {
        let path = ObjectPath::parse(path)?;
        self.storage_for(&path).await?.reader(&path).await
    }

    /// Open `path` for reading `length` bytes from `offset`.
    pub async fn range_reader(
        &self,
        path: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<ByteReader> {
        let path = ObjectPath::parse(path)?;
        self.storage_for(&path)
            .await?
            .range_reader(&path, offset, length)
            .await
    }

    /// Open a writer for `path`.
    pub async fn writer(&self, path: &str, opts: &WriteOptions) -> Result<Box<dyn ObjectWriter>> {
        let path = ObjectPath::parse(path)?;
        self.storage_for(&path).await?.writer(&path, opts).await
    }

    /// The attributes of the object at `path`.
    pub async fn attributes(&self, path: &str) -> Result<ObjectAttrs> {
        let path = ObjectPath::parse(path)?;
        self.storage_for(&path).await?.attributes(&path).await
    }

    /// Apply a partial attribute update to the object at `path`.
    pub async fn update_attributes(&self, path: &str, update: AttrUpdate) -> Result<ObjectAttrs> {
        let path = ObjectPath::parse(path)?;
        self.storage_for(&path)
            .await?
            .update_attributes(&path, update)
            .await
    }

    /// A public, cookie-auth, or signed URL for the object at `path`.
    pub async fn signed_url(&self, path: &str, opts: &SignedUrlOptions) -> Result<String> {
        let path = ObjectPath::parse(path)?;
        self.storage_for(&path).await?.signed_url(&path, opts).await
    }

    /// Iterate entries under `prefix`.
    pub async fn iterator(
        &self,
        prefix: &str,
        delimiter: &str,
    ) -> Result<Box<dyn ObjectIterator>> {
        let prefix = ObjectPath::parse(prefix)?;
        self.storage_for(&prefix)
            .await?
            .iterator(&prefix, delimiter)
            .await
    }

    /// Read the whole object at `path` into memory.
    pub async fn read_object(&self, path: &str) -> Result<Vec<u8>> {
        let mut reader = self.reader(path).await?;
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await?;
        Ok(out)
    }

    /// Write `bytes` as the object at `path` in one shot.
    pub async fn write_object(&self, path: &str, bytes: &[u8], opts: &WriteOptions) -> Result<()> {
        let mut writer = self.writer(path, opts).await?;
        writer.write(bytes).await?;
        writer.close().await
    }
}
