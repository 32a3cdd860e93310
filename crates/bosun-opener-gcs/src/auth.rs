//! Service-account authentication for the GCS JSON API.
//!
//! With no credentials the client runs anonymously and can only touch public
//! objects. With a service-account key it exchanges a signed JWT for a
//! bearer token through the OAuth2 JWT-bearer grant and caches the token
//! until shortly before expiry.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use bosun_opener_core::OpenerError;

/// Scope requested for all storage operations.
const STORAGE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.full_control";

/// Tokens are refreshed this long before their reported expiry.
const EXPIRY_SKEW: Duration = Duration::from_secs(60);

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_owned()
}

/// Subset of a Google service-account key file the driver needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    /// Key kind; URL signing requires `service_account`.
    #[serde(rename = "type")]
    pub key_type: String,
    /// Account email, used as JWT issuer and as `GoogleAccessId`.
    pub client_email: String,
    /// PEM-encoded RSA private key.
    pub private_key: String,
    /// OAuth2 token endpoint.
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl ServiceAccountKey {
    /// Load a key from a JSON credentials file.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading GCS credentials file {}", path.display()))?;
        serde_json::from_slice(&raw)
            .with_context(|| format!("parsing GCS credentials file {}", path.display()))
    }

    /// The RSA signing key, or a credentials error for unusable material.
    pub(crate) fn encoding_key(&self) -> Result<EncodingKey, OpenerError> {
        EncodingKey::from_rsa_pem(self.private_key.as_bytes())
            .map_err(|err| OpenerError::Credentials(format!("unusable private key: {err}")))
    }
}

#[derive(Debug, Serialize)]
struct GrantClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug)]
pub(crate) struct CachedToken {
    access_token: String,
    refresh_after: Instant,
}

/// Token source for API requests.
#[derive(Debug)]
pub(crate) enum GcsAuth {
    /// No credentials; requests carry no authorization header.
    Anonymous,
    /// Service-account key with a cached bearer token.
    ServiceAccount {
        key: ServiceAccountKey,
        cached: RwLock<Option<CachedToken>>,
    },
}

impl GcsAuth {
    pub(crate) fn new(key: Option<ServiceAccountKey>) -> Self {
        match key {
            Some(key) => GcsAuth::ServiceAccount {
                key,
                cached: RwLock::new(None),
            },
            None => GcsAuth::Anonymous,
        }
    }

    pub(crate) fn service_account(&self) -> Option<&ServiceAccountKey> {
        match self {
            GcsAuth::ServiceAccount { key, .. } => Some(key),
            GcsAuth::Anonymous => None,
        }
    }

    /// The current bearer token, fetching or refreshing if needed.
    pub(crate) async fn bearer_token(&self, http: &reqwest::Client) -> Result<Option<String>> {
        let (key, cached) = match self {
            GcsAuth::Anonymous => return Ok(None),
            GcsAuth::ServiceAccount { key, cached } => (key, cached),
        };

        if let Some(token) = cached.read().await.as_ref() {
            if Instant::now() < token.refresh_after {
                return Ok(Some(token.access_token.clone()));
            }
        }

        let mut slot = cached.write().await;
        // Another caller may have refreshed while we waited for the lock.
        if let Some(token) = slot.as_ref() {
            if Instant::now() < token.refresh_after {
                return Ok(Some(token.access_token.clone()));
            }
        }

        let fetched = fetch_token(http, key).await?;
        let access_token = fetched.access_token.clone();
        *slot = Some(fetched);
        Ok(Some(access_token))
    }
}

async fn fetch_token(http: &reqwest::Client, key: &ServiceAccountKey) -> Result<CachedToken> {
    let now = chrono::Utc::now().timestamp() as u64;
    let claims = GrantClaims {
        iss: &key.client_email,
        scope: STORAGE_SCOPE,
        aud: &key.token_uri,
        iat: now,
        exp: now + 3600,
    };
    let assertion = jsonwebtoken::encode(
        &Header::new(Algorithm::RS256),
        &claims,
        &key.encoding_key()?,
    )
    .context("signing OAuth2 grant assertion")?;

    let response = http
        .post(&key.token_uri)
        .form(&[
            ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
            ("assertion", assertion.as_str()),
        ])
        .send()
        .await
        .context("requesting GCS access token")?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("token endpoint returned {status}: {body}");
    }
    let token: TokenResponse = response
        .json()
        .await
        .context("decoding GCS token response")?;

    debug!(expires_in = token.expires_in, "fetched GCS access token");
    let lifetime = Duration::from_secs(token.expires_in);
    Ok(CachedToken {
        access_token: token.access_token,
        refresh_after: Instant::now() + lifetime.saturating_sub(EXPIRY_SKEW),
    })
}
