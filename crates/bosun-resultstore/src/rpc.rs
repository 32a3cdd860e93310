//! The upload RPC surface and its JSON/HTTP client.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use bosun_retry::RpcCode;

use crate::model::{Action, Configuration, ConfiguredTarget, Invocation, Target};

/// A failed remote call, classified by [`RpcCode`].
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct RpcError {
    /// Status code driving retry classification.
    pub code: RpcCode,
    /// Server-provided description.
    pub message: String,
}

impl RpcError {
    /// Create an error with the given code and message.
    pub fn new(code: RpcCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Whether retrying this call can never succeed.
    pub fn is_permanent(&self) -> bool {
        self.code.is_permanent()
    }
}

/// Server-side upload progress for an invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadMetadata {
    /// The resume token the server expects on the next batch.
    pub resume_token: String,
}

/// One resource creation operation inside a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum UploadOp {
    /// Create a configuration under the invocation.
    CreateConfiguration(Configuration),
    /// Create a target under the invocation.
    CreateTarget(Target),
    /// Create a configured target under the invocation.
    CreateConfiguredTarget(ConfiguredTarget),
    /// Create an action under a configured target.
    CreateAction(Action),
    /// Finalize the invocation. At most one per invocation, always last.
    Finalize,
}

/// An ordered batch of upload operations with its idempotency tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadBatch {
    /// Invocation the operations belong to.
    pub invocation_id: Uuid,
    /// Authorization token for the invocation.
    pub auth_token: String,
    /// Token proving where this client believes the upload stands. The
    /// server accepts the batch only if it matches its recorded state.
    pub resume_token: String,
    /// Token the server records once this batch is applied.
    pub next_resume_token: String,
    /// The operations, in order.
    pub ops: Vec<UploadOp>,
}

/// The remote upload surface.
#[async_trait]
pub trait UploadRpc: Send + Sync {
    /// Create the invocation record.
    async fn create_invocation(
        &self,
        invocation: &Invocation,
        auth_token: &str,
        resume_token: &str,
    ) -> Result<(), RpcError>;

    /// Probe an existing invocation. Fails permanently once finalized.
    async fn touch_invocation(&self, id: Uuid, auth_token: &str) -> Result<(), RpcError>;

    /// Read the server's recorded upload progress.
    async fn upload_metadata(&self, id: Uuid, auth_token: &str) -> Result<UploadMetadata, RpcError>;

    /// Apply one batch of operations.
    async fn upload_batch(&self, batch: &UploadBatch) -> Result<(), RpcError>;
}

//─────────────────────────────
//  JSON/HTTP client
//─────────────────────────────

#[derive(Debug, Serialize)]
struct CreateInvocationRequest<'a> {
    invocation: &'a Invocation,
    resume_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct WireError {
    code: RpcCode,
    #[serde(default)]
    message: String,
}

/// JSON-over-HTTP implementation of [`UploadRpc`].
pub struct HttpResultStoreClient {
    http: reqwest::Client,
    base: Url,
}

impl HttpResultStoreClient {
    /// Create a client for the service at `base`.
    pub fn new(base: Url) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder().build().map_err(|err| {
            RpcError::new(RpcCode::Internal, format!("building HTTP client: {err}"))
        })?;
        Ok(Self { http, base })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .expect("result store base URL cannot carry paths")
            .extend(segments);
        url
    }

    async fn run(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, RpcError> {
        let response = request
            .send()
            .await
            .map_err(|err| RpcError::new(RpcCode::Unavailable, err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        // Prefer the structured error the server sends; fall back to mapping
        // the HTTP status.
        if let Ok(wire) = serde_json::from_str::<WireError>(&body) {
            return Err(RpcError::new(wire.code, wire.message));
        }
        let code = match status.as_u16() {
            400 => RpcCode::InvalidArgument,
            403 => RpcCode::PermissionDenied,
            404 => RpcCode::NotFound,
            409 => RpcCode::AlreadyExists,
            412 => RpcCode::FailedPrecondition,
            501 => RpcCode::Unimplemented,
            429 | 503 => RpcCode::Unavailable,
            504 => RpcCode::DeadlineExceeded,
            _ => RpcCode::Unknown,
        };
        let mut message = body;
        message.truncate(256);
        Err(RpcError::new(code, format!("{status}: {message}")))
    }
}

#[async_trait]
impl UploadRpc for HttpResultStoreClient {
    async fn create_invocation(
        &self,
        invocation: &Invocation,
        auth_token: &str,
        resume_token: &str,
    ) -> Result<(), RpcError> {
        let body = CreateInvocationRequest {
            invocation,
            resume_token,
        };
        self.run(
            self.http
                .post(self.endpoint(&["invocations"]))
                .bearer_auth(auth_token)
                .json(&body),
        )
        .await
        .map(|_| ())
    }

    async fn touch_invocation(&self, id: Uuid, auth_token: &str) -> Result<(), RpcError> {
        let id = id.to_string();
        self.run(
            self.http
                .post(self.endpoint(&["invocations", &id, "touch"]))
                .bearer_auth(auth_token),
        )
        .await
        .map(|_| ())
    }

    async fn upload_metadata(&self, id: Uuid, auth_token: &str) -> Result<UploadMetadata, RpcError> {
        let id = id.to_string();
        let response = self
            .run(
                self.http
                    .get(self.endpoint(&["invocations", &id, "uploadMetadata"]))
                    .bearer_auth(auth_token),
            )
            .await?;
        response
            .json()
            .await
            .map_err(|err| RpcError::new(RpcCode::Internal, format!("decoding metadata: {err}")))
    }

    async fn upload_batch(&self, batch: &UploadBatch) -> Result<(), RpcError> {
        let id = batch.invocation_id.to_string();
        self.run(
            self.http
                .post(self.endpoint(&["invocations", &id, "batch"]))
                .bearer_auth(&batch.auth_token)
                .json(batch),
        )
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_error_codes_deserialize_from_canonical_names() {
        let wire: WireError =
            serde_json::from_str(r#"{"code":"ALREADY_EXISTS","message":"duplicate"}"#).unwrap();
        assert_eq!(wire.code, RpcCode::AlreadyExists);
        assert!(RpcError::new(wire.code, wire.message).is_permanent());
    }

    #[test]
    fn upload_op_serialization_is_tagged() {
        let op = UploadOp::Finalize;
        assert_eq!(
            serde_json::to_value(&op).unwrap(),
            serde_json::json!({"op": "finalize"})
        );
    }
}
