//! The upload writer: batching, resume tokens, retries, classification.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use base64::Engine as _;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use bosun_retry::{retry_with_cancel, Backoff, RetryError, RpcCode};

use crate::model::{Action, Configuration, ConfiguredTarget, Invocation, Target};
use crate::rpc::{RpcError, UploadBatch, UploadOp, UploadRpc};

/// Maximum operations per batch; a batch is also flushed on finalize.
pub const BATCH_SIZE: usize = 100;

//─────────────────────────────
//  Auth tokens
//─────────────────────────────

/// Process-global seed for deriving per-invocation authorization tokens.
///
/// The same invocation id always yields the same token within one process,
/// so a crashed-and-retried upload by the same process can resume the
/// invocation it created earlier.
#[derive(Debug, Default)]
pub struct AuthTokenSeed {
    seed: Mutex<Option<Uuid>>,
}

impl AuthTokenSeed {
    /// Create an empty seed; the UUID is drawn on first use.
    pub fn new() -> Self {
        Self::default()
    }

    /// The authorization token for `invocation_id`.
    pub fn token_for(&self, invocation_id: &Uuid) -> String {
        let mut guard = self.seed.lock().expect("auth token seed lock poisoned");
        let seed = guard.get_or_insert_with(Uuid::new_v4);
        Uuid::new_v5(seed, invocation_id.as_bytes()).to_string()
    }
}

/// A fresh opaque resume token: base64 of a random UUID.
fn fresh_resume_token() -> String {
    base64::engine::general_purpose::STANDARD.encode(Uuid::new_v4().as_bytes())
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Failures surfaced by the upload writer.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// `add_upload` was called after finalization. Programming error.
    #[error("invocation {0} is already finalized")]
    AlreadyFinalized(Uuid),
    /// Two sibling resources carried the same UID. Programming error.
    #[error("duplicate {kind} uid {uid:?}")]
    DuplicateUid {
        /// Resource kind.
        kind: &'static str,
        /// The duplicated identifier.
        uid: String,
    },
    /// The server rejected the call with a non-retryable code.
    #[error("permanent upload failure: {0}")]
    Permanent(#[source] RpcError),
    /// Retries ran out without a success.
    #[error("transient upload failure: {0}")]
    Transient(#[source] RpcError),
    /// The upload was cancelled mid-flight. Treated as transient.
    #[error("upload cancelled")]
    Cancelled,
}

impl UploadError {
    /// Whether the failure can never succeed on retry.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            UploadError::Permanent(_)
                | UploadError::AlreadyFinalized(_)
                | UploadError::DuplicateUid { .. }
        )
    }
}

fn map_retry(err: RetryError<RpcError>) -> UploadError {
    match err {
        RetryError::Permanent(err) => UploadError::Permanent(err),
        RetryError::Exhausted(err) => UploadError::Transient(err),
        RetryError::Cancelled => UploadError::Cancelled,
    }
}

//─────────────────────────────
//  Writer
//─────────────────────────────

/// Uploads one invocation's resources in resumable, retried batches.
///
/// Single-threaded per invocation: operations buffer until the batch cap or
/// finalization forces a flush. Every flush attaches a
/// `(resume_token, next_resume_token)` pair; the server applies a batch only
/// when the resume token matches its recorded state, which makes retried
/// flushes idempotent.
pub struct UploadWriter<C> {
    client: Arc<C>,
    backoff: Backoff,
    cancel: CancellationToken,
    invocation_id: Uuid,
    auth_token: String,
    resume_token: String,
    pending: Vec<UploadOp>,
    finalized: bool,
    // (kind, parent uid, uid); uniqueness is scoped to the parent resource.
    seen_uids: HashSet<(&'static str, String, String)>,
}

impl<C: UploadRpc> UploadWriter<C> {
    /// Create the invocation remotely and return a writer positioned at the
    /// server's recorded resume point.
    ///
    /// When the invocation already exists (a previous attempt by this
    /// process created it), the writer touches it and adopts the server's
    /// resume token; a permanent failure on touch means the invocation was
    /// already finalized and is reported as permanent.
    pub async fn new(
        client: Arc<C>,
        seed: &AuthTokenSeed,
        invocation: &Invocation,
        backoff: Backoff,
        cancel: CancellationToken,
    ) -> Result<Self, UploadError> {
        invocation
            .validate()
            .map_err(|dup| UploadError::DuplicateUid {
                kind: dup.kind,
                uid: dup.uid,
            })?;

        let auth_token = seed.token_for(&invocation.id);
        let initial_token = fresh_resume_token();

        let created = retry_with_cancel(
            &backoff,
            &cancel,
            RpcError::is_permanent,
            || client.create_invocation(invocation, &auth_token, &initial_token),
        )
        .await;

        let resume_token = match created {
            Ok(()) => initial_token,
            Err(RetryError::Permanent(err)) if err.code == RpcCode::AlreadyExists => {
                debug!(invocation = %invocation.id, "invocation already exists, resuming");
                retry_with_cancel(&backoff, &cancel, RpcError::is_permanent, || {
                    client.touch_invocation(invocation.id, &auth_token)
                })
                .await
                .map_err(map_retry)?;
                let metadata =
                    retry_with_cancel(&backoff, &cancel, RpcError::is_permanent, || {
                        client.upload_metadata(invocation.id, &auth_token)
                    })
                    .await
                    .map_err(map_retry)?;
                metadata.resume_token
            }
            Err(err) => return Err(map_retry(err)),
        };

        Ok(Self {
            client,
            backoff,
            cancel,
            invocation_id: invocation.id,
            auth_token,
            resume_token,
            pending: Vec::new(),
            finalized: false,
            seen_uids: HashSet::new(),
        })
    }

    /// The resume token the next batch will carry.
    pub fn resume_token(&self) -> &str {
        &self.resume_token
    }

    /// Queue one operation, flushing when the batch cap is reached or the
    /// operation finalizes the invocation.
    ///
    /// Calling this after a finalize was queued is a programming error.
    pub async fn add_upload(&mut self, op: UploadOp) -> Result<(), UploadError> {
        if self.finalized {
            return Err(UploadError::AlreadyFinalized(self.invocation_id));
        }
        if let Some((kind, parent_uid, uid)) = op_identity(&op) {
            if !self
                .seen_uids
                .insert((kind, parent_uid.to_owned(), uid.to_owned()))
            {
                return Err(UploadError::DuplicateUid {
                    kind,
                    uid: uid.to_owned(),
                });
            }
        }
        let finalizes = matches!(op, UploadOp::Finalize);
        self.pending.push(op);
        if finalizes {
            self.finalized = true;
            return self.flush().await;
        }
        if self.pending.len() >= BATCH_SIZE {
            return self.flush().await;
        }
        Ok(())
    }

    /// Queue the final operation and flush everything outstanding.
    pub async fn finalize(&mut self) -> Result<(), UploadError> {
        self.add_upload(UploadOp::Finalize).await
    }

    /// Send the buffered operations as one batch.
    ///
    /// The same `(resume_token, next_resume_token)` pair is reused across
    /// retry attempts of a single batch; a fresh next token is drawn per
    /// batch, never per attempt.
    async fn flush(&mut self) -> Result<(), UploadError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = UploadBatch {
            invocation_id: self.invocation_id,
            auth_token: self.auth_token.clone(),
            resume_token: self.resume_token.clone(),
            next_resume_token: fresh_resume_token(),
            ops: self.pending.clone(),
        };
        retry_with_cancel(&self.backoff, &self.cancel, RpcError::is_permanent, || {
            self.client.upload_batch(&batch)
        })
        .await
        .map_err(map_retry)?;

        self.pending.clear();
        self.resume_token = batch.next_resume_token;
        Ok(())
    }
}

/// The `(kind, parent uid, uid)` identity of a create operation.
///
/// Configurations, targets, and configured targets are children of the
/// invocation itself, so their parent slot is empty; an action is scoped to
/// its configured target, so two siblings under different configured targets
/// may share a UID.
fn op_identity(op: &UploadOp) -> Option<(&'static str, &str, &str)> {
    match op {
        UploadOp::CreateConfiguration(c) => Some(("configuration", "", &c.uid)),
        UploadOp::CreateTarget(t) => Some(("target", "", &t.uid)),
        UploadOp::CreateConfiguredTarget(ct) => Some(("configured target", "", &ct.uid)),
        UploadOp::CreateAction(a) => Some(("action", &a.configured_target_uid, &a.uid)),
        UploadOp::Finalize => None,
    }
}

//─────────────────────────────
//  Top-level upload
//─────────────────────────────

/// The child resources uploaded alongside an invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvocationResources {
    /// Configurations, uploaded first.
    pub configurations: Vec<Configuration>,
    /// Targets.
    pub targets: Vec<Target>,
    /// Configured targets.
    pub configured_targets: Vec<ConfiguredTarget>,
    /// Actions, uploaded last.
    pub actions: Vec<Action>,
}

/// Upload one invocation and finalize it.
///
/// Permanent failures are logged and swallowed so a retrying outer
/// reconciler does not spin on them; only transient failures (including
/// cancellation) are returned.
pub async fn upload_invocation<C: UploadRpc>(
    client: Arc<C>,
    seed: &AuthTokenSeed,
    invocation: &Invocation,
    resources: &InvocationResources,
    backoff: Backoff,
    cancel: CancellationToken,
) -> Result<(), UploadError> {
    let outcome = upload_all(client, seed, invocation, resources, backoff, cancel).await;
    match outcome {
        Ok(()) => Ok(()),
        Err(err) if err.is_permanent() => {
            warn!(invocation = %invocation.id, %err, "permanent upload failure, giving up");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

async fn upload_all<C: UploadRpc>(
    client: Arc<C>,
    seed: &AuthTokenSeed,
    invocation: &Invocation,
    resources: &InvocationResources,
    backoff: Backoff,
    cancel: CancellationToken,
) -> Result<(), UploadError> {
    let mut writer = UploadWriter::new(client, seed, invocation, backoff, cancel).await?;
    for configuration in &resources.configurations {
        writer
            .add_upload(UploadOp::CreateConfiguration(configuration.clone()))
            .await?;
    }
    for target in &resources.targets {
        writer.add_upload(UploadOp::CreateTarget(target.clone())).await?;
    }
    for configured_target in &resources.configured_targets {
        writer
            .add_upload(UploadOp::CreateConfiguredTarget(configured_target.clone()))
            .await?;
    }
    for action in &resources.actions {
        writer.add_upload(UploadOp::CreateAction(action.clone())).await?;
    }
    writer.finalize().await
}
