#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **bosun-resultstore** – Resumable, batched upload of job results.
//!
//! A single logical invocation (status, timing, attributes, child resources,
//! file references) is uploaded to a remote result service through the
//! [`UploadRpc`] surface. Batches carry a `(resume_token, next_resume_token)`
//! idempotency pair so interrupted uploads resume where the server last
//! recorded progress, every call retries with exponential backoff, and
//! failures are classified: permanent errors stop retries immediately and
//! are swallowed at the top level, transient errors surface to the caller's
//! own retry cadence.

mod model;
mod rpc;
mod writer;

pub use model::{
    Action, Configuration, ConfiguredTarget, DuplicateUid, FileRef, Invocation,
    InvocationAttributes, InvocationStatus, Target, Timing,
};
pub use rpc::{HttpResultStoreClient, RpcError, UploadBatch, UploadMetadata, UploadOp, UploadRpc};
pub use writer::{
    upload_invocation, AuthTokenSeed, InvocationResources, UploadError, UploadWriter, BATCH_SIZE,
};
