#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **bosun-opener-gcs** – Google Cloud Storage driver for the object opener.
//!
//! Talks to the GCS JSON API over `reqwest`. Authentication is optional:
//! without credentials the driver runs anonymously against public objects,
//! with a service-account key it uses the OAuth2 JWT-bearer grant. Writes
//! with `must_not_exist` are guarded server-side via `ifGenerationMatch=0`.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio_util::io::StreamReader;
use url::Url;

use bosun_opener_core::{
    AttrUpdate, ByteReader, ObjectAttrs, ObjectInfo, ObjectIterator, ObjectPath, ObjectStorage,
    ObjectWriter, OpenerError, SignedUrlOptions, WriteOptions,
};

mod auth;
mod sign;

pub use auth::ServiceAccountKey;

use auth::GcsAuth;

/// Google Cloud Storage implementation of [`ObjectStorage`].
///
/// Cloning is cheap; all clones share the HTTP connection pool and the
/// cached access token.
#[derive(Clone)]
pub struct GcsClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    http: reqwest::Client,
    auth: GcsAuth,
    api_base: Url,
}

impl GcsClient {
    /// Create a client. `key` of `None` runs anonymously.
    pub fn new(key: Option<ServiceAccountKey>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("building GCS HTTP client")?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                http,
                auth: GcsAuth::new(key),
                api_base: Url::parse(sign::PUBLIC_HOST).expect("static URL parses"),
            }),
        })
    }

    /// Create a client from an optional credentials file path.
    pub async fn from_credentials_file(path: Option<&Path>) -> Result<Self> {
        let key = match path {
            Some(path) => Some(ServiceAccountKey::from_file(path).await?),
            None => None,
        };
        Self::new(key)
    }

    /// Point the client at a different API endpoint. Tests use this to talk
    /// to a local fake.
    pub fn with_api_base(self, api_base: Url) -> Self {
        let inner = ClientInner {
            http: self.inner.http.clone(),
            auth: GcsAuth::new(self.inner.auth.service_account().cloned()),
            api_base,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    fn object_url(&self, path: &ObjectPath, media: bool) -> Result<Url> {
        let mut url = self.inner.api_base.clone();
        url.path_segments_mut()
            .map_err(|_| OpenerError::Provider {
                path: path.to_string(),
                message: "API base URL cannot carry paths".to_owned(),
            })?
            .extend(["storage", "v1", "b", path.bucket.as_str(), "o", path.path.as_str()]);
        if media {
            url.query_pairs_mut().append_pair("alt", "media");
        }
        Ok(url)
    }

    fn list_url(&self, bucket: &str) -> Url {
        let mut url = self.inner.api_base.clone();
        url.path_segments_mut()
            .expect("API base URL validated at construction")
            .extend(["storage", "v1", "b", bucket, "o"]);
        url
    }

    fn upload_url(&self, path: &ObjectPath, must_not_exist: bool) -> Url {
        let mut url = self.inner.api_base.clone();
        url.path_segments_mut()
            .expect("API base URL validated at construction")
            .extend(["upload", "storage", "v1", "b", path.bucket.as_str(), "o"]);
        url.query_pairs_mut().append_pair("uploadType", "multipart");
        if must_not_exist {
            url.query_pairs_mut().append_pair("ifGenerationMatch", "0");
        }
        url
    }

    async fn authorize(&self, request: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        match self.inner.auth.bearer_token(&self.inner.http).await? {
            Some(token) => Ok(request.bearer_auth(token)),
            None => Ok(request),
        }
    }
}

/// Map a non-success response onto the opener error taxonomy.
async fn expect_success(path: &ObjectPath, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let mut body = response.text().await.unwrap_or_default();
    body.truncate(256);
    let err = match status {
        StatusCode::NOT_FOUND => OpenerError::NotExist(path.to_string()),
        StatusCode::PRECONDITION_FAILED => OpenerError::PreconditionFailed(path.to_string()),
        _ => OpenerError::Provider {
            path: path.to_string(),
            message: format!("{status}: {body}"),
        },
    };
    Err(err.into())
}

//─────────────────────────────
//  Wire types
//─────────────────────────────

#[derive(Debug, Deserialize)]
struct ObjectResource {
    #[serde(default)]
    name: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(rename = "contentType")]
    content_type: Option<String>,
    #[serde(rename = "contentEncoding")]
    content_encoding: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
    updated: Option<DateTime<Utc>>,
}

impl ObjectResource {
    fn into_attrs(self) -> ObjectAttrs {
        ObjectAttrs {
            size: self.size.and_then(|s| s.parse().ok()).unwrap_or(0),
            content_type: self.content_type,
            content_encoding: self.content_encoding,
            metadata: self.metadata,
            updated: self.updated,
        }
    }
}

#[derive(Debug, Serialize)]
struct ObjectMetadataPatch {
    #[serde(rename = "contentEncoding", skip_serializing_if = "Option::is_none")]
    content_encoding: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    items: Vec<ObjectResource>,
    #[serde(default)]
    prefixes: Vec<String>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

//─────────────────────────────
//  Storage implementation
//─────────────────────────────

#[async_trait]
impl ObjectStorage for GcsClient {
    async fn reader(&self, path: &ObjectPath) -> Result<ByteReader> {
        self.range_reader(path, 0, None).await
    }

    async fn range_reader(
        &self,
        path: &ObjectPath,
        offset: u64,
        length: Option<u64>,
    ) -> Result<ByteReader> {
        let url = self.object_url(path, true)?;
        let mut request = self.inner.http.get(url);
        if offset > 0 || length.is_some() {
            let range = match length {
                Some(length) if length > 0 => format!("bytes={offset}-{}", offset + length - 1),
                _ => format!("bytes={offset}-"),
            };
            request = request.header(reqwest::header::RANGE, range);
        }
        let request = self.authorize(request).await?;
        let response = request
            .send()
            .await
            .with_context(|| format!("fetching {path}"))?;
        let response = expect_success(path, response).await?;
        let stream = response
            .bytes_stream()
            .map_err(|err| std::io::Error::other(err));
        Ok(Box::new(StreamReader::new(stream)))
    }

    async fn writer(
        &self,
        path: &ObjectPath,
        opts: &WriteOptions,
    ) -> Result<Box<dyn ObjectWriter>> {
        Ok(Box::new(GcsWriter {
            client: self.clone(),
            path: path.clone(),
            opts: opts.clone(),
            buf: Vec::with_capacity(opts.buffer_size.unwrap_or(0)),
        }))
    }

    async fn attributes(&self, path: &ObjectPath) -> Result<ObjectAttrs> {
        let url = self.object_url(path, false)?;
        let request = self.authorize(self.inner.http.get(url)).await?;
        let response = request
            .send()
            .await
            .with_context(|| format!("fetching attributes of {path}"))?;
        let response = expect_success(path, response).await?;
        let resource: ObjectResource = response
            .json()
            .await
            .with_context(|| format!("decoding attributes of {path}"))?;
        Ok(resource.into_attrs())
    }

    async fn update_attributes(
        &self,
        path: &ObjectPath,
        update: AttrUpdate,
    ) -> Result<ObjectAttrs> {
        let url = self.object_url(path, false)?;
        let patch = ObjectMetadataPatch {
            content_encoding: update.content_encoding,
            metadata: update.metadata,
        };
        let request = self.authorize(self.inner.http.patch(url).json(&patch)).await?;
        let response = request
            .send()
            .await
            .with_context(|| format!("updating attributes of {path}"))?;
        let response = expect_success(path, response).await?;
        let resource: ObjectResource = response
            .json()
            .await
            .with_context(|| format!("decoding attributes of {path}"))?;
        Ok(resource.into_attrs())
    }

    async fn signed_url(&self, path: &ObjectPath, opts: &SignedUrlOptions) -> Result<String> {
        sign::object_url(self.inner.auth.service_account(), path, opts)
    }

    async fn iterator(
        &self,
        prefix: &ObjectPath,
        delimiter: &str,
    ) -> Result<Box<dyn ObjectIterator>> {
        Ok(Box::new(GcsIterator {
            client: self.clone(),
            bucket: prefix.bucket.clone(),
            prefix: prefix.path.clone(),
            delimiter: delimiter.to_owned(),
            buffer: VecDeque::new(),
            next_page: None,
            exhausted: false,
        }))
    }
}

/// Buffering writer committed as one multipart upload on close.
struct GcsWriter {
    client: GcsClient,
    path: ObjectPath,
    opts: WriteOptions,
    buf: Vec<u8>,
}

#[async_trait]
impl ObjectWriter for GcsWriter {
    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let this = *self;
        let url = this.client.upload_url(&this.path, this.opts.must_not_exist);

        let mut meta = serde_json::json!({ "name": this.path.path });
        if let Some(content_type) = &this.opts.content_type {
            meta["contentType"] = serde_json::json!(content_type);
        }
        if let Some(content_encoding) = &this.opts.content_encoding {
            meta["contentEncoding"] = serde_json::json!(content_encoding);
        }
        if !this.opts.metadata.is_empty() {
            meta["metadata"] = serde_json::json!(this.opts.metadata);
        }

        let boundary = format!("bosun-{}", uuid::Uuid::new_v4());
        let data_type = this
            .opts
            .content_type
            .as_deref()
            .unwrap_or("application/octet-stream");
        let mut body = Vec::with_capacity(this.buf.len() + 512);
        body.extend_from_slice(
            format!("--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n")
                .as_bytes(),
        );
        body.extend_from_slice(meta.to_string().as_bytes());
        body.extend_from_slice(
            format!("\r\n--{boundary}\r\nContent-Type: {data_type}\r\n\r\n").as_bytes(),
        );
        body.extend_from_slice(&this.buf);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

        let request = this
            .client
            .inner
            .http
            .post(url)
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={boundary}"),
            )
            .body(body);
        let request = this.client.authorize(request).await?;
        let response = request
            .send()
            .await
            .with_context(|| format!("uploading {}", this.path))?;
        expect_success(&this.path, response).await?;
        Ok(())
    }
}

/// Paginated listing over the objects API.
struct GcsIterator {
    client: GcsClient,
    bucket: String,
    prefix: String,
    delimiter: String,
    buffer: VecDeque<ObjectInfo>,
    next_page: Option<String>,
    exhausted: bool,
}

impl GcsIterator {
    async fn fetch_page(&mut self) -> Result<()> {
        let mut url = self.client.list_url(&self.bucket);
        {
            let mut query = url.query_pairs_mut();
            if !self.prefix.is_empty() {
                query.append_pair("prefix", &self.prefix);
            }
            if !self.delimiter.is_empty() {
                query.append_pair("delimiter", &self.delimiter);
            }
            if let Some(token) = &self.next_page {
                query.append_pair("pageToken", token);
            }
        }
        let probe = ObjectPath {
            provider: bosun_opener_core::Provider::Gcs,
            bucket: self.bucket.clone(),
            path: self.prefix.clone(),
        };
        let request = self.client.authorize(self.client.inner.http.get(url)).await?;
        let response = request
            .send()
            .await
            .with_context(|| format!("listing gs://{}/{}", self.bucket, self.prefix))?;
        let response = expect_success(&probe, response).await?;
        let page: ListResponse = response
            .json()
            .await
            .with_context(|| format!("decoding listing of gs://{}/{}", self.bucket, self.prefix))?;

        for dir in page.prefixes {
            let trimmed = dir.trim_end_matches('/');
            self.buffer.push_back(ObjectInfo {
                full_name: format!("gs://{}/{dir}", self.bucket),
                leaf_name: trimmed.rsplit('/').next().unwrap_or(trimmed).to_owned(),
                is_dir: true,
                size: 0,
                updated: None,
            });
        }
        for item in page.items {
            let name = item.name.clone();
            let updated = item.updated;
            let size = item.size.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0);
            self.buffer.push_back(ObjectInfo {
                full_name: format!("gs://{}/{name}", self.bucket),
                leaf_name: name.rsplit('/').next().unwrap_or(&name).to_owned(),
                is_dir: false,
                size,
                updated,
            });
        }
        self.next_page = page.next_page_token;
        if self.next_page.is_none() {
            self.exhausted = true;
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectIterator for GcsIterator {
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
