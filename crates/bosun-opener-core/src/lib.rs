#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **bosun-opener-core** – Core object storage abstractions.
//!
//! This crate defines the storage-provider contract used throughout Bosun:
//! the object path grammar, the [`ObjectStorage`] trait implemented by the
//! per-provider driver crates, and the error taxonomy. Drivers (local
//! filesystem, GCS, S3) implement these traits in separate crates that
//! depend on this core abstraction.
//!
//! Callers never branch on provider-specific error types; absence is always
//! detected through [`is_not_exist`], which sees through `anyhow` context
//! wrapping.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

//─────────────────────────────
//  Path grammar
//─────────────────────────────

/// Storage provider selected by an object path's scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Local filesystem, addressed by absolute path.
    File,
    /// Google Cloud Storage, addressed as `gs://bucket/object`.
    Gcs,
    /// S3-compatible storage, addressed as `s3://bucket/object`.
    S3,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provider::File => f.write_str("file"),
            Provider::Gcs => f.write_str("gs"),
            Provider::S3 => f.write_str("s3"),
        }
    }
}

/// Parsed form of a logical object path.
///
/// Canonical syntaxes: `gs://bucket/object`, `s3://bucket/object`,
/// `/absolute/path`, and `file:///absolute/path`. For the local provider the
/// bucket is empty and `path` is the absolute filesystem path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectPath {
    /// Provider addressed by the path's scheme.
    pub provider: Provider,
    /// Bucket name; empty for the local provider.
    pub bucket: String,
    /// Object name relative to the bucket, or the absolute local path.
    pub path: String,
}

impl ObjectPath {
    /// Parse a logical path string.
    pub fn parse(raw: &str) -> Result<Self, OpenerError> {
        if let Some(rest) = raw.strip_prefix("gs://") {
            return Self::split_remote(Provider::Gcs, raw, rest);
        }
        if let Some(rest) = raw.strip_prefix("s3://") {
            return Self::split_remote(Provider::S3, raw, rest);
        }
        if let Some(rest) = raw.strip_prefix("file://") {
            if !rest.starts_with('/') {
                return Err(OpenerError::InvalidPath {
                    path: raw.to_owned(),
                    reason: "file:// paths must be absolute".to_owned(),
                });
            }
            return Ok(Self {
                provider: Provider::File,
                bucket: String::new(),
                path: rest.to_owned(),
            });
        }
        if raw.starts_with('/') {
            return Ok(Self {
                provider: Provider::File,
                bucket: String::new(),
                path: raw.to_owned(),
            });
        }
        Err(OpenerError::InvalidPath {
            path: raw.to_owned(),
            reason: "expected gs://, s3://, file:// or an absolute path".to_owned(),
        })
    }

    fn split_remote(provider: Provider, raw: &str, rest: &str) -> Result<Self, OpenerError> {
        let (bucket, path) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(OpenerError::InvalidPath {
                path: raw.to_owned(),
                reason: "missing bucket name".to_owned(),
            });
        }
        Ok(Self {
            provider,
            bucket: bucket.to_owned(),
            path: path.to_owned(),
        })
    }

    /// A sibling path with `name` appended to this path's object name.
    pub fn join(&self, name: &str) -> Self {
        let mut joined = self.clone();
        if joined.path.is_empty() || joined.path.ends_with('/') {
            joined.path.push_str(name);
        } else {
            joined.path.push('/');
            joined.path.push_str(name);
        }
        joined
    }
}

impl std::fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.provider {
            Provider::File => f.write_str(&self.path),
            Provider::Gcs => write!(f, "gs://{}/{}", self.bucket, self.path),
            Provider::S3 => write!(f, "s3://{}/{}", self.bucket, self.path),
        }
    }
}

impl std::str::FromStr for ObjectPath {
    type Err = OpenerError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::parse(raw)
    }
}

//─────────────────────────────
//  Error taxonomy
//─────────────────────────────

/// Errors raised by storage drivers.
///
/// Provider-specific error types never leak past a driver; everything is
/// mapped onto these variants at the driver boundary.
#[derive(Debug, thiserror::Error)]
pub enum OpenerError {
    /// The object does not exist. Detect via [`is_not_exist`], not matching.
    #[error("object does not exist: {0}")]
    NotExist(String),
    /// A write with `must_not_exist` found the object already present.
    #[error("precondition failed, object already exists: {0}")]
    PreconditionFailed(String),
    /// The path string did not match the object-path grammar.
    #[error("invalid object path {path:?}: {reason}")]
    InvalidPath {
        /// The offending path string.
        path: String,
        /// Why it was rejected.
        reason: String,
    },
    /// The provider does not support the requested operation.
    #[error("{provider} provider does not support {operation}")]
    Unsupported {
        /// Provider the operation was attempted on.
        provider: Provider,
        /// Name of the unsupported operation.
        operation: &'static str,
    },
    /// Credentials were missing, malformed, or of the wrong kind.
    #[error("credentials error: {0}")]
    Credentials(String),
    /// An I/O failure underneath the driver.
    #[error("i/o failure on {path}")]
    Io {
        /// Path the operation ran against.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Any other provider-side failure.
    #[error("provider failure on {path}: {message}")]
    Provider {
        /// Path the operation ran against.
        path: String,
        /// Provider-reported description.
        message: String,
    },
}

/// Whether `err` denotes object absence, for any provider, at any wrap depth.
///
/// This predicate is the only supported way to branch on absence: it matches
/// the driver [`OpenerError::NotExist`] variant as well as raw OS
/// not-found errors, including when either is buried under `anyhow` context.
pub fn is_not_exist(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(opener) = cause.downcast_ref::<OpenerError>() {
            if matches!(opener, OpenerError::NotExist(_)) {
                return true;
            }
            if let OpenerError::Io { source, .. } = opener {
                if source.kind() == std::io::ErrorKind::NotFound {
                    return true;
                }
            }
        }
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::NotFound {
                return true;
            }
        }
    }
    false
}

//─────────────────────────────
//  Operation option types
//─────────────────────────────

/// Options for opening a writer.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Driver-side buffer size hint, in bytes.
    pub buffer_size: Option<usize>,
    /// MIME content type recorded on the object.
    pub content_type: Option<String>,
    /// Content encoding recorded on the object (e.g. `gzip`).
    pub content_encoding: Option<String>,
    /// User metadata recorded on the object.
    pub metadata: BTreeMap<String, String>,
    /// Fail with [`OpenerError::PreconditionFailed`] if the object exists.
    pub must_not_exist: bool,
}

/// Attributes reported for a stored object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectAttrs {
    /// Object size in bytes.
    pub size: u64,
    /// MIME content type, when the provider records one.
    pub content_type: Option<String>,
    /// Content encoding, when the provider records one.
    pub content_encoding: Option<String>,
    /// User metadata.
    pub metadata: BTreeMap<String, String>,
    /// Last update time, when the provider records one.
    pub updated: Option<DateTime<Utc>>,
}

/// Partial attribute update; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct AttrUpdate {
    /// New content encoding.
    pub content_encoding: Option<String>,
    /// Metadata entries to merge over the existing map.
    pub metadata: Option<BTreeMap<String, String>>,
}

/// Options for producing a signed or public URL.
#[derive(Debug, Clone)]
pub struct SignedUrlOptions {
    /// Lifetime of a signature. URLs without a signature ignore this.
    pub expires: Duration,
    /// Produce a browser cookie-auth URL instead of a public/signed one.
    pub use_cookie_auth: bool,
}

impl Default for SignedUrlOptions {
    fn default() -> Self {
        Self {
            expires: Duration::from_secs(10 * 60),
            use_cookie_auth: false,
        }
    }
}

/// One entry yielded by an object iterator.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInfo {
    /// Full logical path of the entry (`gs://bucket/a/b`).
    pub full_name: String,
    /// Final path segment.
    pub leaf_name: String,
    /// Whether the entry is a synthetic directory (delimiter prefix).
    pub is_dir: bool,
    /// Object size in bytes; zero for directories.
    pub size: u64,
    /// Last update time, when known.
    pub updated: Option<DateTime<Utc>>,
}

//─────────────────────────────
//  Storage traits
//─────────────────────────────

/// A byte stream read from storage.
pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Sink for a single object write.
///
/// Bytes are accepted incrementally; the write is committed (and any
/// `must_not_exist` precondition finally enforced) by [`ObjectWriter::close`].
#[async_trait]
pub trait ObjectWriter: Send {
    /// Append bytes to the pending object.
    async fn write(&mut self, buf: &[u8]) -> anyhow::Result<()>;

    /// Commit the object. Dropping a writer without closing abandons it.
    async fn close(self: Box<Self>) -> anyhow::Result<()>;
}

/// Iterator over objects under a prefix.
#[async_trait]
pub trait ObjectIterator: Send {
    /// The next entry, `None` once the listing is exhausted.
    async fn next(&mut self) -> Option<anyhow::Result<ObjectInfo>>;
}

/// Uniform streaming interface over one storage provider.
///
/// All operations take a parsed [`ObjectPath`] addressed to this provider.
/// Implementations must map provider-native absence onto
/// [`OpenerError::NotExist`] so [`is_not_exist`] works uniformly.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Open the object for reading from the start.
    async fn reader(&self, path: &ObjectPath) -> anyhow::Result<ByteReader>;

    /// Open the object for reading `length` bytes from `offset`.
    /// A `length` of `None` reads to the end.
    async fn range_reader(
        &self,
        path: &ObjectPath,
        offset: u64,
        length: Option<u64>,
    ) -> anyhow::Result<ByteReader>;

    /// Open a writer for the object.
    async fn writer(
        &self,
        path: &ObjectPath,
        opts: &WriteOptions,
    ) -> anyhow::Result<Box<dyn ObjectWriter>>;

    /// The object's attributes.
    async fn attributes(&self, path: &ObjectPath) -> anyhow::Result<ObjectAttrs>;

    /// Apply a partial attribute update, returning the resulting attributes.
    async fn update_attributes(
        &self,
        path: &ObjectPath,
        update: AttrUpdate,
    ) -> anyhow::Result<ObjectAttrs>;

    /// A public, cookie-auth, or signed URL for the object.
    async fn signed_url(
        &self,
        path: &ObjectPath,
        opts: &SignedUrlOptions,
    ) -> anyhow::Result<String>;

    /// Iterate entries under `prefix`. With the path separator as
    /// `delimiter` one level is returned, synthetic directories included;
    /// with an empty delimiter the full subtree of objects is returned.
    async fn iterator(
        &self,
        prefix: &ObjectPath,
        delimiter: &str,
    ) -> anyhow::Result<Box<dyn ObjectIterator>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn parses_gcs_paths() {
        let path = ObjectPath::parse("gs://bucket/some/object").unwrap();
        assert_eq!(path.provider, Provider::Gcs);
        assert_eq!(path.bucket, "bucket");
        assert_eq!(path.path, "some/object");
        assert_eq!(path.to_string(), "gs://bucket/some/object");
    }

    #[test]
    fn parses_s3_paths() {
        let path = ObjectPath::parse("s3://b/k").unwrap();
        assert_eq!(path.provider, Provider::S3);
        assert_eq!(path.bucket, "b");
        assert_eq!(path.path, "k");
    }

    #[test]
    fn parses_local_paths() {
        for raw in ["/var/log/build.log", "file:///var/log/build.log"] {
            let path = ObjectPath::parse(raw).unwrap();
            assert_eq!(path.provider, Provider::File);
            assert_eq!(path.bucket, "");
            assert_eq!(path.path, "/var/log/build.log");
        }
    }

    #[test]
    fn rejects_relative_and_unknown_paths() {
        for raw in ["relative/path", "ftp://x/y", "gs://", "file://relative"] {
            assert!(
                matches!(ObjectPath::parse(raw), Err(OpenerError::InvalidPath { .. })),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn bucket_root_paths_have_empty_object_name() {
        let path = ObjectPath::parse("gs://bucket").unwrap();
        assert_eq!(path.path, "");
        assert_eq!(path.join("leaf").path, "leaf");
    }

    #[test]
    fn join_inserts_separator_once() {
        let base = ObjectPath::parse("gs://b/dir/").unwrap();
        assert_eq!(base.join("leaf").path, "dir/leaf");
        let base = ObjectPath::parse("gs://b/dir").unwrap();
        assert_eq!(base.join("leaf").path, "dir/leaf");
    }

    #[test]
    fn not_exist_predicate_sees_through_wrapping() {
        let inner = anyhow::Error::new(OpenerError::NotExist("gs://b/missing".to_owned()));
        let wrapped = inner.context("while fetching artifacts");
        assert!(is_not_exist(&wrapped));

        let os: anyhow::Result<()> =
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into());
        let os = os.context("reading log").unwrap_err();
        assert!(is_not_exist(&os));

        let other = anyhow::Error::new(OpenerError::PreconditionFailed("x".to_owned()));
        assert!(!is_not_exist(&other));
    }
}
