#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **bosun-opener-s3** – S3-compatible storage driver for the object opener.
//!
//! Built on the AWS SDK. Credentials come from a JSON blob on disk
//! (`{region, endpoint?, insecure?, s3_force_path_style?, access_key?,
//! secret_key?}`); empty key material falls back to the SDK's default
//! provider chain, so workloads with ambient credentials need no file at
//! all.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::MetadataDirective;
use serde::Deserialize;

use bosun_opener_core::{
    AttrUpdate, ByteReader, ObjectAttrs, ObjectInfo, ObjectIterator, ObjectPath, ObjectStorage,
    ObjectWriter, OpenerError, Provider, SignedUrlOptions, WriteOptions,
};

//─────────────────────────────
//  Credentials
//─────────────────────────────

/// On-disk S3 credentials blob.
#[derive(Debug, Clone, Deserialize)]
pub struct S3Credentials {
    /// Region name, e.g. `us-east-1`.
    pub region: String,
    /// Alternate endpoint for S3-compatible services.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Use plain HTTP when the endpoint carries no scheme.
    #[serde(default)]
    pub insecure: bool,
    /// Use path-style bucket addressing.
    #[serde(default)]
    pub s3_force_path_style: bool,
    /// Static access key; empty falls back to the default provider chain.
    #[serde(default)]
    pub access_key: Option<String>,
    /// Static secret key; empty falls back to the default provider chain.
    #[serde(default)]
    pub secret_key: Option<String>,
}

impl S3Credentials {
    /// Load credentials from a JSON file.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading S3 credentials file {}", path.display()))?;
        serde_json::from_slice(&raw)
            .with_context(|| format!("parsing S3 credentials file {}", path.display()))
    }

    fn static_keys(&self) -> Option<(String, String)> {
        match (self.access_key.as_deref(), self.secret_key.as_deref()) {
            (Some(access), Some(secret)) if !access.is_empty() && !secret.is_empty() => {
                Some((access.to_owned(), secret.to_owned()))
            }
            _ => None,
        }
    }

    fn endpoint_url(&self) -> Option<String> {
        let endpoint = self.endpoint.as_deref()?;
        if endpoint.is_empty() {
            return None;
        }
        if endpoint.contains("://") {
            Some(endpoint.to_owned())
        } else if self.insecure {
            Some(format!("http://{endpoint}"))
        } else {
            Some(format!("https://{endpoint}"))
        }
    }
}

//─────────────────────────────
//  Client
//─────────────────────────────

/// S3 implementation of [`ObjectStorage`].
#[derive(Debug, Clone)]
pub struct S3Client {
    client: aws_sdk_s3::Client,
}

impl S3Client {
    /// Create a client. With `None` the SDK default configuration is used.
    pub async fn new(credentials: Option<S3Credentials>) -> Result<Self> {
        let client = match credentials {
            Some(creds) => {
                let mut loader = aws_config::defaults(BehaviorVersion::latest())
                    .region(Region::new(creds.region.clone()));
                if let Some((access, secret)) = creds.static_keys() {
                    loader = loader.credentials_provider(Credentials::new(
                        access,
                        secret,
                        None,
                        None,
                        "bosun-credentials-file",
                    ));
                }
                let shared = loader.load().await;
                let mut builder = aws_sdk_s3::config::Builder::from(&shared)
                    .force_path_style(creds.s3_force_path_style);
                if let Some(endpoint) = creds.endpoint_url() {
                    builder = builder.endpoint_url(endpoint);
                }
                aws_sdk_s3::Client::from_conf(builder.build())
            }
            None => {
                let shared = aws_config::load_defaults(BehaviorVersion::latest()).await;
                aws_sdk_s3::Client::new(&shared)
            }
        };
        Ok(Self { client })
    }

    /// Create a client from an optional credentials file path.
    pub async fn from_credentials_file(path: Option<&Path>) -> Result<Self> {
        let credentials = match path {
            Some(path) => Some(S3Credentials::from_file(path).await?),
            None => None,
        };
        Self::new(credentials).await
    }

    async fn head(&self, path: &ObjectPath) -> Result<ObjectAttrs> {
        let head = self
            .client
            .head_object()
            .bucket(&path.bucket)
            .key(&path.path)
            .send()
            .await
            .map_err(|err| {
                let not_found = err
                    .as_service_error()
                    .map(|service| service.is_not_found())
                    .unwrap_or(false);
                if not_found {
                    anyhow::Error::new(OpenerError::NotExist(path.to_string()))
                } else {
                    provider_error(path, err)
                }
            })?;
        Ok(ObjectAttrs {
            size: head.content_length().unwrap_or(0).max(0) as u64,
            content_type: head.content_type().map(str::to_owned),
            content_encoding: head.content_encoding().map(str::to_owned),
            metadata: head
                .metadata()
                .map(|meta| meta.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default(),
            updated: head.last_modified().and_then(aws_time_to_chrono),
        })
    }
}

fn aws_time_to_chrono(
    time: &aws_sdk_s3::primitives::DateTime,
) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::from_timestamp(time.secs(), time.subsec_nanos())
}

fn provider_error<E, R>(
    path: &ObjectPath,
    err: aws_sdk_s3::error::SdkError<E, R>,
) -> anyhow::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    anyhow::Error::new(OpenerError::Provider {
        path: path.to_string(),
        message: err.to_string(),
    })
}

fn http_status<E>(err: &aws_sdk_s3::error::SdkError<E>) -> Option<u16> {
    err.raw_response().map(|raw| raw.status().as_u16())
}

#[async_trait]
impl ObjectStorage for S3Client {
    async fn reader(&self, path: &ObjectPath) -> Result<ByteReader> {
        self.range_reader(path, 0, None).await
    }

    async fn range_reader(
        &self,
        path: &ObjectPath,
        offset: u64,
        length: Option<u64>,
    ) -> Result<ByteReader> {
        let mut request = self
            .client
            .get_object()
            .bucket(&path.bucket)
            .key(&path.path);
        if offset > 0 || length.is_some() {
            let range = match length {
                Some(length) if length > 0 => format!("bytes={offset}-{}", offset + length - 1),
                _ => format!("bytes={offset}-"),
            };
            request = request.range(range);
        }
        let output = request.send().await.map_err(|err| {
            let no_such_key = err
                .as_service_error()
                .map(|service| service.is_no_such_key())
                .unwrap_or(false);
            if no_such_key {
                anyhow::Error::new(OpenerError::NotExist(path.to_string()))
            } else {
                provider_error(path, err)
            }
        })?;
        Ok(Box::new(output.body.into_async_read()))
    }

    async fn writer(
        &self,
        path: &ObjectPath,
        opts: &WriteOptions,
    ) -> Result<Box<dyn ObjectWriter>> {
        Ok(Box::new(S3Writer {
            client: self.client.clone(),
            path: path.clone(),
            opts: opts.clone(),
            buf: Vec::with_capacity(opts.buffer_size.unwrap_or(0)),
        }))
    }

    async fn attributes(&self, path: &ObjectPath) -> Result<ObjectAttrs> {
        self.head(path).await
    }

    async fn update_attributes(
        &self,
        path: &ObjectPath,
        update: AttrUpdate,
    ) -> Result<ObjectAttrs> {
        let current = self.head(path).await?;
        let mut metadata = current.metadata.clone();
        if let Some(extra) = update.metadata {
            metadata.extend(extra);
        }
        let content_encoding = update.content_encoding.or(current.content_encoding);

        // S3 has no metadata patch; rewrite attributes with a self-copy.
        let mut request = self
            .client
            .copy_object()
            .bucket(&path.bucket)
            .key(&path.path)
            .copy_source(format!("{}/{}", path.bucket, path.path))
            .metadata_directive(MetadataDirective::Replace)
            .set_content_type(current.content_type.clone())
            .set_content_encoding(content_encoding.clone());
        for (key, value) in &metadata {
            request = request.metadata(key.as_str(), value.as_str());
        }
        request
            .send()
            .await
            .map_err(|err| provider_error(path, err))?;

        Ok(ObjectAttrs {
            content_encoding,
            metadata,
            ..current
        })
    }

    async fn signed_url(&self, path: &ObjectPath, opts: &SignedUrlOptions) -> Result<String> {
        if opts.use_cookie_auth {
            return Err(OpenerError::Unsupported {
                provider: Provider::S3,
                operation: "cookie-auth URLs",
            }
            .into());
        }
        let config = PresigningConfig::expires_in(opts.expires)
            .context("building presigning configuration")?;
        let presigned = self
            .client
            .get_object()
            .bucket(&path.bucket)
            .key(&path.path)
            .presigned(config)
            .await
            .map_err(|err| provider_error(path, err))?;
        Ok(presigned.uri().to_string())
    }

    async fn iterator(
        &self,
        prefix: &ObjectPath,
        delimiter: &str,
    ) -> Result<Box<dyn ObjectIterator>> {
        Ok(Box::new(S3Iterator {
            client: self.client.clone(),
            bucket: prefix.bucket.clone(),
            prefix: prefix.path.clone(),
            delimiter: delimiter.to_owned(),
            buffer: VecDeque::new(),
            continuation: None,
            exhausted: false,
        }))
    }
}

/// Buffering writer committed as one PutObject on close.
struct S3Writer {
    client: aws_sdk_s3::Client,
    path: ObjectPath,
    opts: WriteOptions,
    buf: Vec<u8>,
}

#[async_trait]
impl ObjectWriter for S3Writer {
    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let this = *self;
        let mut request = this
            .client
            .put_object()
            .bucket(&this.path.bucket)
            .key(&this.path.path)
            .body(ByteStream::from(this.buf))
            .set_content_type(this.opts.content_type.clone())
            .set_content_encoding(this.opts.content_encoding.clone());
        if this.opts.must_not_exist {
            request = request.if_none_match("*");
        }
        let metadata: BTreeMap<String, String> = this.opts.metadata.clone();
        for (key, value) in &metadata {
            request = request.metadata(key.as_str(), value.as_str());
        }
        request.send().await.map_err(|err| {
            if http_status(&err) == Some(412) {
                anyhow::Error::new(OpenerError::PreconditionFailed(this.path.to_string()))
            } else {
                provider_error(&this.path, err)
            }
        })?;
        Ok(())
    }
}

/// Paginated ListObjectsV2 iterator.
struct S3Iterator {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
    delimiter: String,
    buffer: VecDeque<ObjectInfo>,
    continuation: Option<String>,
    exhausted: bool,
}

impl S3Iterator {
    async fn fetch_page(&mut self) -> Result<()> {
        let probe = ObjectPath {
            provider: Provider::S3,
            bucket: self.bucket.clone(),
            path: self.prefix.clone(),
        };
        let mut request = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&self.prefix);
        if !self.delimiter.is_empty() {
            request = request.delimiter(&self.delimiter);
        }
        if let Some(token) = &self.continuation {
            request = request.continuation_token(token);
        }
        let page = request
            .send()
            .await
            .map_err(|err| provider_error(&probe, err))?;

        for dir in page.common_prefixes() {
            if let Some(name) = dir.prefix() {
                let trimmed = name.trim_end_matches('/');
                self.buffer.push_back(ObjectInfo {
                    full_name: format!("s3://{}/{name}", self.bucket),
                    leaf_name: trimmed.rsplit('/').next().unwrap_or(trimmed).to_owned(),
                    is_dir: true,
                    size: 0,
                    updated: None,
                });
            }
        }
        for object in page.contents() {
            let Some(key) = object.key() else { continue };
            self.buffer.push_back(ObjectInfo {
                full_name: format!("s3://{}/{key}", self.bucket),
                leaf_name: key.rsplit('/').next().unwrap_or(key).to_owned(),
                is_dir: false,
                size: object.size().unwrap_or(0).max(0) as u64,
                updated: object.last_modified().and_then(aws_time_to_chrono),
            });
        }

        self.continuation = page.next_continuation_token().map(str::to_owned);
        if self.continuation.is_none() {
            self.exhausted = true;
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectIterator for S3Iterator {
    async fn next(&mut self) -> Option<Result<ObjectInfo>> {
        loop {
            if let Some(entry) = self.buffer.pop_front() {
                return Some(Ok(entry));
            }
            if self.exhausted {
                return None;
            }
            if let Err(err) = self.fetch_page().await {
                self.exhausted = true;
                return Some(Err(err));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_blob_parses_with_defaults() {
        let creds: S3Credentials = serde_json::from_str(
            r#"{"region":"us-east-1","access_key":"AK","secret_key":"SK"}"#,
        )
        .unwrap();
        assert_eq!(creds.region, "us-east-1");
        assert!(!creds.insecure);
        assert!(!creds.s3_force_path_style);
        assert_eq!(creds.static_keys().unwrap().0, "AK");
    }

    #[test]
    fn empty_keys_fall_back_to_default_chain() {
        let creds: S3Credentials = serde_json::from_str(
            r#"{"region":"us-east-1","access_key":"","secret_key":""}"#,
        )
        .unwrap();
        assert!(creds.static_keys().is_none());

        let creds: S3Credentials = serde_json::from_str(r#"{"region":"us-east-1"}"#).unwrap();
        assert!(creds.static_keys().is_none());
    }

    #[test]
    fn endpoint_scheme_follows_insecure_flag() {
        let mut creds: S3Credentials = serde_json::from_str(
            r#"{"region":"r","endpoint":"minio.internal:9000"}"#,
        )
        .unwrap();
        assert_eq!(
            creds.endpoint_url().as_deref(),
            Some("https://minio.internal:9000")
        );
        creds.insecure = true;
        assert_eq!(
            creds.endpoint_url().as_deref(),
            Some("http://minio.internal:9000")
        );
        creds.endpoint = Some("https://explicit.example".to_owned());
        assert_eq!(
            creds.endpoint_url().as_deref(),
            Some("https://explicit.example")
        );
    }
}
