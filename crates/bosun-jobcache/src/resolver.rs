//! Remote resolution of job configuration over JSON/HTTP.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::debug;
use url::Url;

use crate::artifact::JobArtifact;
use crate::CacheKey;

/// How long the readiness probe polls the ping endpoint before giving up.
pub const READINESS_DEADLINE: Duration = Duration::from_secs(15);

/// Interval between readiness probe attempts.
const READINESS_POLL: Duration = Duration::from_millis(500);

/// Produces the job configuration artifact for a cache key.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve the artifact for `key`. May perform network I/O.
    async fn resolve(&self, key: &CacheKey) -> Result<JobArtifact>;
}

//─────────────────────────────
//  Wire types
//─────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct ResolveRequest {
    refs: Refs,
}

#[derive(Debug, Serialize, Deserialize)]
struct Refs {
    org: String,
    repo: String,
    base_sha: String,
    #[serde(default)]
    base_ref: String,
    #[serde(default)]
    pulls: Vec<Pull>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Pull {
    sha: String,
}

impl ResolveRequest {
    fn from_key(key: &CacheKey) -> Self {
        let (org, repo) = key
            .identifier
            .split_once('/')
            .unwrap_or((key.identifier.as_str(), ""));
        Self {
            refs: Refs {
                org: org.to_owned(),
                repo: repo.to_owned(),
                base_sha: key.base_sha.clone(),
                base_ref: String::new(),
                pulls: key
                    .head_shas
                    .iter()
                    .map(|sha| Pull { sha: sha.clone() })
                    .collect(),
            },
        }
    }
}

//─────────────────────────────
//  HTTP resolver
//─────────────────────────────

/// JSON-over-HTTP client for an external configuration resolver service.
///
/// Before the first resolution the client polls the service's `/ping`
/// endpoint until it answers, bounded by a readiness deadline. The request
/// timeout is re-read from the supplied closure on every call so it tracks
/// hot config reloads.
pub struct HttpResolver {
    http: reqwest::Client,
    base: Url,
    user_agent: String,
    timeout_fn: Arc<dyn Fn() -> Duration + Send + Sync>,
    readiness_deadline: Duration,
    ready: OnceCell<()>,
}

impl HttpResolver {
    /// Create a client for the resolver at `base`.
    ///
    /// `component` and `version` form the `User-Agent` header; `timeout_fn`
    /// yields the per-request timeout and is consulted on every call.
    pub fn new(
        base: Url,
        component: &str,
        version: &str,
        timeout_fn: Arc<dyn Fn() -> Duration + Send + Sync>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("building resolver HTTP client")?;
        Ok(Self {
            http,
            base,
            user_agent: format!("{component}/{version}"),
            timeout_fn,
            readiness_deadline: READINESS_DEADLINE,
            ready: OnceCell::new(),
        })
    }

    /// Shorten the readiness deadline. Tests use this to fail fast.
    pub fn with_readiness_deadline(mut self, deadline: Duration) -> Self {
        self.readiness_deadline = deadline;
        self
    }

    fn endpoint(&self, segment: &str) -> Url {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .expect("resolver base URL cannot carry paths")
            .push(segment);
        url
    }

    async fn wait_ready(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.readiness_deadline;
        loop {
            let response = self
                .http
                .get(self.endpoint("ping"))
                .header(reqwest::header::USER_AGENT, &self.user_agent)
                .timeout(READINESS_POLL)
                .send()
                .await;
            match response {
                Ok(response) if response.status().is_success() => {
                    debug!("configuration resolver is ready");
                    return Ok(());
                }
                Ok(response) => {
                    debug!(status = %response.status(), "resolver not ready yet");
                }
                Err(err) => {
                    debug!(%err, "resolver ping failed");
                }
            }
            if tokio::time::Instant::now() + READINESS_POLL > deadline {
                anyhow::bail!(
                    "configuration resolver at {} did not become ready within {:?}",
                    self.base,
                    self.readiness_deadline
                );
            }
            tokio::time::sleep(READINESS_POLL).await;
        }
    }
}

#[async_trait]
impl Resolver for HttpResolver {
    async fn resolve(&self, key: &CacheKey) -> Result<JobArtifact> {
        self.ready
            .get_or_try_init(|| self.wait_ready())
            .await
            .context("waiting for configuration resolver readiness")?;

        let request = ResolveRequest::from_key(key);
        let timeout = (self.timeout_fn)();
        let response = self
            .http
            .post(self.endpoint("inrepoconfig"))
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/json; charset=UTF-8",
            )
            .json(&request)
            .timeout(timeout)
            .send()
            .await
            .with_context(|| format!("requesting job configuration for {}", key.identifier))?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            body.truncate(256);
            anyhow::bail!(
                "configuration resolver returned {status} for {}: {body}",
                key.identifier
            );
        }
        response
            .json()
            .await
            .with_context(|| format!("decoding job configuration for {}", key.identifier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_carries_org_repo_and_pulls() {
        let key = CacheKey {
            identifier: "acme/widgets".to_owned(),
            base_sha: "ba5e".to_owned(),
            head_shas: vec!["abcd".to_owned(), "ef01".to_owned()],
        };
        let request = ResolveRequest::from_key(&key);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["refs"]["org"], "acme");
        assert_eq!(json["refs"]["repo"], "widgets");
        assert_eq!(json["refs"]["base_sha"], "ba5e");
        assert_eq!(json["refs"]["pulls"][0]["sha"], "abcd");
        assert_eq!(json["refs"]["pulls"][1]["sha"], "ef01");
    }
}
