#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **bosun-retry** – Exponential backoff with explicit error classification.
//!
//! Every remote call site in Bosun owns two explicit axes: its backoff
//! parameters and its permanent-error predicate. Neither is hidden inside a
//! client library, so tests can inject fast backoffs and fake predicates.
//!
//! A *permanent* failure ends the retry loop immediately and is surfaced as
//! such; everything else is treated as transient and retried until the step
//! budget or the overall deadline runs out.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

//─────────────────────────────
//  RPC status codes
//─────────────────────────────

/// Status code attached to a failed remote call.
///
/// The variant names mirror the canonical RPC status vocabulary so that
/// wire-level errors map onto them directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcCode {
    /// The entity the call tried to create already exists.
    AlreadyExists,
    /// The referenced entity does not exist.
    NotFound,
    /// The request was malformed.
    InvalidArgument,
    /// The system is not in a state required for the operation.
    FailedPrecondition,
    /// The server does not implement the called method.
    Unimplemented,
    /// The caller lacks permission for the operation.
    PermissionDenied,
    /// The deadline expired before the call completed.
    DeadlineExceeded,
    /// The service is currently unavailable.
    Unavailable,
    /// The operation was aborted.
    Aborted,
    /// Catch-all for unclassified server failures.
    Internal,
    /// The error could not be mapped to a known code.
    Unknown,
}

impl RpcCode {
    /// Whether a call failing with this code must not be retried.
    pub fn is_permanent(self) -> bool {
        matches!(
            self,
            RpcCode::AlreadyExists
                | RpcCode::NotFound
                | RpcCode::InvalidArgument
                | RpcCode::FailedPrecondition
                | RpcCode::Unimplemented
                | RpcCode::PermissionDenied
        )
    }
}

impl std::fmt::Display for RpcCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RpcCode::AlreadyExists => "ALREADY_EXISTS",
            RpcCode::NotFound => "NOT_FOUND",
            RpcCode::InvalidArgument => "INVALID_ARGUMENT",
            RpcCode::FailedPrecondition => "FAILED_PRECONDITION",
            RpcCode::Unimplemented => "UNIMPLEMENTED",
            RpcCode::PermissionDenied => "PERMISSION_DENIED",
            RpcCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            RpcCode::Unavailable => "UNAVAILABLE",
            RpcCode::Aborted => "ABORTED",
            RpcCode::Internal => "INTERNAL",
            RpcCode::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

//─────────────────────────────
//  Backoff policy
//─────────────────────────────

/// Parameters of an exponential backoff loop.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// Delay before the first retry.
    pub base: Duration,
    /// Multiplier applied to the delay after each attempt.
    pub factor: f64,
    /// Upper bound on a single delay.
    pub cap: Duration,
    /// Number of retries after the initial attempt.
    pub steps: u32,
    /// Relative jitter applied to each delay (0.2 = ±20%).
    pub jitter: f64,
    /// Upper bound on the whole loop, including time spent in attempts.
    pub overall_deadline: Duration,
}

impl Backoff {
    /// The standard profile for remote procedure calls: 100ms base, factor 2,
    /// 30s cap, 8 steps, 20% jitter, bounded overall at five minutes.
    pub fn rpc_default() -> Self {
        Self {
            base: Duration::from_millis(100),
            factor: 2.0,
            cap: Duration::from_secs(30),
            steps: 8,
            jitter: 0.2,
            overall_deadline: Duration::from_secs(300),
        }
    }

    /// A near-instant profile for unit tests.
    pub fn fast() -> Self {
        Self {
            base: Duration::from_millis(1),
            factor: 2.0,
            cap: Duration::from_millis(10),
            steps: 8,
            jitter: 0.0,
            overall_deadline: Duration::from_secs(5),
        }
    }

    /// The jittered delay for the given zero-based retry step.
    fn delay(&self, step: u32) -> Duration {
        let exp = self.factor.powi(step as i32);
        let raw = self.base.as_secs_f64() * exp;
        let capped = raw.min(self.cap.as_secs_f64());
        let jittered = if self.jitter > 0.0 {
            let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
            capped * (1.0 + spread)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

//─────────────────────────────
//  Retry loop
//─────────────────────────────

/// Why a retried operation ultimately failed.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The predicate classified the failure as permanent; no retry happened.
    #[error("permanent failure: {0}")]
    Permanent(#[source] E),
    /// The step budget or the overall deadline ran out.
    #[error("retries exhausted: {0}")]
    Exhausted(#[source] E),
    /// The cancellation token fired while waiting. Counts as transient.
    #[error("retry loop cancelled")]
    Cancelled,
}

impl<E> RetryError<E> {
    /// Whether the failure is permanent. Cancellation is transient.
    pub fn is_permanent(&self) -> bool {
        matches!(self, RetryError::Permanent(_))
    }

    /// The underlying error, if any attempt ran.
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Permanent(e) | RetryError::Exhausted(e) => Some(e),
            RetryError::Cancelled => None,
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or the budget runs out.
pub async fn retry<T, E, Fut, Op, P>(
    policy: &Backoff,
    is_permanent: P,
    op: Op,
) -> Result<T, RetryError<E>>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    retry_with_cancel(policy, &CancellationToken::new(), is_permanent, op).await
}

/// As [`retry`], aborting the loop when `cancel` fires.
///
/// Cancellation is reported as [`RetryError::Cancelled`] and classified as
/// transient so outer reconcilers retry at their own cadence.
pub async fn retry_with_cancel<T, E, Fut, Op, P>(
    policy: &Backoff,
    cancel: &CancellationToken,
    is_permanent: P,
    mut op: Op,
) -> Result<T, RetryError<E>>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let deadline = Instant::now() + policy.overall_deadline;
    for step in 0..=policy.steps {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_permanent(&err) => {
                debug!(%err, "permanent failure, not retrying");
                return Err(RetryError::Permanent(err));
            }
            Err(err) => {
                if step == policy.steps {
                    return Err(RetryError::Exhausted(err));
                }
                let delay = policy.delay(step);
                if Instant::now() + delay >= deadline {
                    warn!(%err, "overall retry deadline exceeded");
                    return Err(RetryError::Exhausted(err));
                }
                debug!(%err, step, ?delay, "transient failure, backing off");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    unreachable!("retry loop exits inside the attempt loop")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, thiserror::Error)]
    #[error("fake rpc failure: {code}")]
    struct FakeError {
        code: RpcCode,
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let result = retry(&Backoff::fast(), |e: &FakeError| e.code.is_permanent(), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Err(FakeError {
                        code: RpcCode::Unavailable,
                    })
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn permanent_failure_stops_immediately() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> =
            retry(&Backoff::fast(), |e: &FakeError| e.code.is_permanent(), || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(FakeError {
                        code: RpcCode::PermissionDenied,
                    })
                }
            })
            .await;
        assert!(matches!(result, Err(RetryError::Permanent(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_step_budget() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> =
            retry(&Backoff::fast(), |e: &FakeError| e.code.is_permanent(), || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(FakeError {
                        code: RpcCode::Internal,
                    })
                }
            })
            .await;
        assert!(matches!(result, Err(RetryError::Exhausted(_))));
        // Initial attempt plus eight retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 9);
    }

    #[tokio::test]
    async fn cancellation_counts_as_transient() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), _> = retry_with_cancel(
            &Backoff::fast(),
            &cancel,
            |e: &FakeError| e.code.is_permanent(),
            || async {
                Err(FakeError {
                    code: RpcCode::Unavailable,
                })
            },
        )
        .await;
        let err = result.unwrap_err();
        assert!(matches!(err, RetryError::Cancelled));
        assert!(!err.is_permanent());
    }

    #[test]
    fn delay_is_capped() {
        let policy = Backoff {
            jitter: 0.0,
            ..Backoff::rpc_default()
        };
        // 100ms * 2^10 would be ~102s; the cap holds it at 30s.
        assert_eq!(policy.delay(10), Duration::from_secs(30));
    }

    #[test]
    fn permanent_code_set_matches_policy() {
        for code in [
            RpcCode::AlreadyExists,
            RpcCode::NotFound,
            RpcCode::InvalidArgument,
            RpcCode::FailedPrecondition,
            RpcCode::Unimplemented,
            RpcCode::PermissionDenied,
        ] {
            assert!(code.is_permanent(), "{code} should be permanent");
        }
        for code in [
            RpcCode::Unavailable,
            RpcCode::DeadlineExceeded,
            RpcCode::Aborted,
            RpcCode::Internal,
            RpcCode::Unknown,
        ] {
            assert!(!code.is_permanent(), "{code} should be transient");
        }
    }
}
