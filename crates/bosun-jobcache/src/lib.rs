#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **bosun-jobcache** – Bounded, keyed cache of per-repository job
//! configuration.
//!
//! A [`JobCache`] maps a revision set `(identifier, base SHA, head SHAs…)`
//! onto the resolved [`JobArtifact`] for that revision set, fetching misses
//! through a [`Resolver`]. At most one resolution is in flight per key
//! fingerprint; concurrent callers for the same fingerprint join it and
//! share its outcome, errors included. Storage is a bounded LRU; evictions
//! are reported to the inserting caller for observability.
//!
//! The cache stores the artifact exactly as resolved; the
//! defaulting/validation pass runs on every return so it stays a pure
//! function of the stored artifact.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

mod artifact;
mod resolver;

pub use artifact::{
    default_and_validate, JobArtifact, JobBase, Postsubmit, Presubmit, ValidationError,
    DEFAULT_AGENT, DEFAULT_CLUSTER,
};
pub use resolver::{HttpResolver, Resolver, READINESS_DEADLINE};

//─────────────────────────────
//  Cache key
//─────────────────────────────

/// Identity of one resolved revision set.
///
/// Head SHA order is significant: the same SHAs in a different order name a
/// different key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    /// Opaque `org/repo` repository identifier.
    pub identifier: String,
    /// Base revision the heads apply onto.
    pub base_sha: String,
    /// Head revisions, in order.
    pub head_shas: Vec<String>,
}

impl CacheKey {
    /// Deterministic string fingerprint of the key.
    ///
    /// Canonical JSON of the ordered triple; stable across processes.
    pub fn fingerprint(&self) -> String {
        serde_json::to_string(self).expect("cache keys always serialize")
    }
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Failures surfaced by cache lookups.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The repository identifier was empty.
    #[error("repository identifier must not be empty")]
    EmptyIdentifier,
    /// The cache was constructed with size zero.
    #[error("cache size must be at least 1")]
    ZeroSize,
    /// The base-revision getter failed.
    #[error("failed to get base SHA for {identifier}: {source}")]
    BaseRef {
        /// Repository identifier.
        identifier: String,
        /// Getter error.
        source: anyhow::Error,
    },
    /// A head-revision getter failed.
    #[error("failed to get head ref for {identifier}: {source}")]
    HeadRef {
        /// Repository identifier.
        identifier: String,
        /// Getter error.
        source: anyhow::Error,
    },
    /// The resolver failed; nothing was cached.
    #[error("resolving job configuration for {identifier} failed: {source}")]
    Resolve {
        /// Repository identifier.
        identifier: String,
        /// Resolver error, shared with every waiter of the resolution.
        source: Arc<anyhow::Error>,
    },
    /// The resolved artifact failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// The outcome of a resolution this caller joined.
    #[error("{0}")]
    Shared(Arc<CacheError>),
}

//─────────────────────────────
//  Cache
//─────────────────────────────

/// Outcome of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheLookup {
    /// The defaulted, validated artifact.
    pub jobs: JobArtifact,
    /// Whether the artifact came from the LRU.
    pub cache_hit: bool,
    /// Whether storing the artifact evicted another entry.
    pub evicted: bool,
}

type FlightOutcome = Result<(Arc<JobArtifact>, bool), Arc<CacheError>>;
type FlightState = Option<FlightOutcome>;

struct CacheInner {
    lru: LruCache<String, Arc<JobArtifact>>,
    inflight: HashMap<String, watch::Receiver<FlightState>>,
}

/// Bounded singleflight cache in front of a [`Resolver`].
pub struct JobCache<R> {
    resolver: Arc<R>,
    inner: Mutex<CacheInner>,
}

enum Role {
    Hit(Arc<JobArtifact>),
    Wait(watch::Receiver<FlightState>),
    Lead(watch::Sender<FlightState>),
}

impl<R: Resolver> JobCache<R> {
    /// Create a cache holding at most `size` artifacts.
    pub fn new(resolver: R, size: usize) -> Result<Self, CacheError> {
        let size = NonZeroUsize::new(size).ok_or(CacheError::ZeroSize)?;
        Ok(Self {
            resolver: Arc::new(resolver),
            inner: Mutex::new(CacheInner {
                lru: LruCache::new(size),
                inflight: HashMap::new(),
            }),
        })
    }

    /// Number of cached artifacts.
    pub fn len(&self) -> usize {
        self.inner.lock().lru.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up the artifact for the revision set named by the getters.
    ///
    /// The getters run first, in order, and their failures are surfaced with
    /// context and never cached. On a miss the first caller resolves while
    /// any concurrent callers for the same fingerprint await and share the
    /// outcome.
    pub async fn get<B, I, H>(
        &self,
        identifier: &str,
        base_getter: B,
        head_getters: I,
    ) -> Result<CacheLookup, CacheError>
    where
        B: FnOnce() -> anyhow::Result<String>,
        I: IntoIterator<Item = H>,
        H: FnOnce() -> anyhow::Result<String>,
    {
        if identifier.is_empty() {
            return Err(CacheError::EmptyIdentifier);
        }
        let base_sha = base_getter().map_err(|source| CacheError::BaseRef {
            identifier: identifier.to_owned(),
            source,
        })?;
        let mut head_shas = Vec::new();
        for getter in head_getters {
            head_shas.push(getter().map_err(|source| CacheError::HeadRef {
                identifier: identifier.to_owned(),
                source,
            })?);
        }
        let key = CacheKey {
            identifier: identifier.to_owned(),
            base_sha,
            head_shas,
        };
        self.get_for_key(&key).await
    }

    /// Look up the artifact for an already-built key.
    pub async fn get_for_key(&self, key: &CacheKey) -> Result<CacheLookup, CacheError> {
        if key.identifier.is_empty() {
            return Err(CacheError::EmptyIdentifier);
        }
        let fingerprint = key.fingerprint();

        let role = {
            let mut inner = self.inner.lock();
            if let Some(artifact) = inner.lru.get(&fingerprint) {
                Role::Hit(Arc::clone(artifact))
            } else if let Some(rx) = inner.inflight.get(&fingerprint) {
                Role::Wait(rx.clone())
            } else {
                let (tx, rx) = watch::channel(None);
                inner.inflight.insert(fingerprint.clone(), rx);
                Role::Lead(tx)
            }
        };

        match role {
            Role::Hit(artifact) => Ok(CacheLookup {
                jobs: default_and_validate(&artifact)?,
                cache_hit: true,
                evicted: false,
            }),
            Role::Wait(rx) => self.await_flight(rx).await,
            Role::Lead(tx) => self.resolve_and_publish(key, fingerprint, tx).await,
        }
    }

    async fn await_flight(
        &self,
        mut rx: watch::Receiver<FlightState>,
    ) -> Result<CacheLookup, CacheError> {
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(state) => state
                .as_ref()
                .cloned()
                .expect("wait_for only returns populated states"),
            // The leader vanished without publishing; treat like a failed
            // resolution so the next call retries.
            Err(_) => {
                return Err(CacheError::Resolve {
                    identifier: String::new(),
                    source: Arc::new(anyhow::anyhow!("in-flight resolution was abandoned")),
                });
            }
        };
        match outcome {
            Ok((artifact, _evicted)) => Ok(CacheLookup {
                jobs: default_and_validate(&artifact)?,
                cache_hit: false,
                evicted: false,
            }),
            Err(shared) => Err(CacheError::Shared(shared)),
        }
    }

    async fn resolve_and_publish(
        &self,
        key: &CacheKey,
        fingerprint: String,
        tx: watch::Sender<FlightState>,
    ) -> Result<CacheLookup, CacheError> {
        // The resolver runs outside any lock; it may block on the network.
        match self.resolver.resolve(key).await {
            Ok(artifact) => {
                let artifact = Arc::new(artifact);
                let evicted = {
                    let mut inner = self.inner.lock();
                    let displaced = inner.lru.push(fingerprint.clone(), Arc::clone(&artifact));
                    inner.inflight.remove(&fingerprint);
                    matches!(displaced, Some((displaced_key, _)) if displaced_key != fingerprint)
                };
                if evicted {
                    debug!(identifier = %key.identifier, "cache insertion evicted the oldest entry");
                }
                tx.send_replace(Some(Ok((Arc::clone(&artifact), evicted))));
                Ok(CacheLookup {
                    jobs: default_and_validate(&artifact)?,
                    cache_hit: false,
                    evicted,
                })
            }
            Err(err) => {
                warn!(identifier = %key.identifier, %err, "job configuration resolution failed");
                let shared = Arc::new(CacheError::Resolve {
                    identifier: key.identifier.clone(),
                    source: Arc::new(err),
                });
                self.inner.lock().inflight.remove(&fingerprint);
                tx.send_replace(Some(Err(Arc::clone(&shared))));
                Err(CacheError::Shared(shared))
            }
        }
    }

    /// Drop every cached artifact belonging to `identifier`.
    pub fn invalidate_prefix(&self, identifier: &str) {
        let mut inner = self.inner.lock();
        let doomed: Vec<String> = inner
            .lru
            .iter()
            .filter(|(fingerprint, _)| {
                serde_json::from_str::<CacheKey>(fingerprint)
                    .map(|key| key.identifier == identifier)
                    .unwrap_or(false)
            })
            .map(|(fingerprint, _)| fingerprint.clone())
            .collect();
        for fingerprint in doomed {
            inner.lru.pop(&fingerprint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct FakeResolver {
        calls: AtomicUsize,
        gate: Option<Arc<Notify>>,
        fail: std::sync::atomic::AtomicBool,
    }

    impl FakeResolver {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                gate: None,
                fail: std::sync::atomic::AtomicBool::new(false),
            }
        }

        fn gated(gate: Arc<Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl Resolver for FakeResolver {
        async fn resolve(&self, key: &CacheKey) -> anyhow::Result<JobArtifact> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("resolver unavailable");
            }
            Ok(JobArtifact {
                presubmits: vec![Presubmit {
                    base: JobBase {
                        name: format!("unit-{}", key.base_sha),
                        ..JobBase::default()
                    },
                    ..Presubmit::default()
                }],
                ..JobArtifact::default()
            })
        }
    }

    fn key(identifier: &str, base: &str, heads: &[&str]) -> CacheKey {
        CacheKey {
            identifier: identifier.to_owned(),
            base_sha: base.to_owned(),
            head_shas: heads.iter().map(|s| (*s).to_owned()).collect(),
        }
    }

    #[test]
    fn fingerprint_is_deterministic_and_order_sensitive() {
        let a = key("foo/bar", "ba5e", &["abcd", "ef01"]);
        let b = key("foo/bar", "ba5e", &["abcd", "ef01"]);
        let swapped = key("foo/bar", "ba5e", &["ef01", "abcd"]);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), swapped.fingerprint());
    }

    #[tokio::test]
    async fn hit_after_miss_and_defaulting_on_every_return() {
        let cache = JobCache::new(FakeResolver::new(), 4).unwrap();
        let k = key("org/repo", "ba5e", &[]);

        let first = cache.get_for_key(&k).await.unwrap();
        assert!(!first.cache_hit);
        // The defaulting pass ran on the way out of the cache.
        assert_eq!(first.jobs.presubmits[0].base.agent, DEFAULT_AGENT);

        let second = cache.get_for_key(&k).await.unwrap();
        assert!(second.cache_hit);
        assert_eq!(first.jobs, second.jobs);
        assert_eq!(cache.resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_gets_share_one_resolution() {
        let gate = Arc::new(Notify::new());
        let cache = Arc::new(JobCache::new(FakeResolver::gated(Arc::clone(&gate)), 4).unwrap());
        let k = key("org/repo", "ba5e", &["abcd"]);

        let first = tokio::spawn({
            let cache = Arc::clone(&cache);
            let k = k.clone();
            async move { cache.get_for_key(&k).await }
        });
        let second = tokio::spawn({
            let cache = Arc::clone(&cache);
            let k = k.clone();
            async move { cache.get_for_key(&k).await }
        });

        // Let both tasks reach the cache before releasing the resolver.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        gate.notify_waiters();
        gate.notify_waiters();

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(first.jobs, second.jobs);
        assert_eq!(
            cache.resolver.calls.load(Ordering::SeqCst),
            1,
            "exactly one resolution must run for identical keys"
        );
    }

    #[tokio::test]
    async fn eviction_is_reported_and_drops_the_oldest() {
        let cache = JobCache::new(FakeResolver::new(), 2).unwrap();
        let a = key("org/repo", "aaaa", &[]);
        let b = key("org/repo", "bbbb", &[]);
        let c = key("org/repo", "cccc", &[]);

        assert!(!cache.get_for_key(&a).await.unwrap().evicted);
        assert!(!cache.get_for_key(&b).await.unwrap().evicted);
        let third = cache.get_for_key(&c).await.unwrap();
        assert!(third.evicted, "inserting C into a full cache must evict");
        assert_eq!(cache.len(), 2);

        // A was the oldest entry; fetching it again re-resolves.
        let calls_before = cache.resolver.calls.load(Ordering::SeqCst);
        let again = cache.get_for_key(&a).await.unwrap();
        assert!(!again.cache_hit);
        assert_eq!(cache.resolver.calls.load(Ordering::SeqCst), calls_before + 1);
    }

    #[tokio::test]
    async fn resolver_errors_are_shared_and_not_cached() {
        let gate = Arc::new(Notify::new());
        let resolver = FakeResolver::gated(Arc::clone(&gate));
        resolver.fail.store(true, Ordering::SeqCst);
        let cache = Arc::new(JobCache::new(resolver, 4).unwrap());
        let k = key("org/repo", "ba5e", &[]);

        let first = tokio::spawn({
            let cache = Arc::clone(&cache);
            let k = k.clone();
            async move { cache.get_for_key(&k).await }
        });
        let second = tokio::spawn({
            let cache = Arc::clone(&cache);
            let k = k.clone();
            async move { cache.get_for_key(&k).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        gate.notify_waiters();
        gate.notify_waiters();

        assert!(first.await.unwrap().is_err());
        assert!(second.await.unwrap().is_err());
        assert_eq!(cache.resolver.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 0, "failed resolutions must not be cached");

        // The next call retries.
        cache.resolver.fail.store(false, Ordering::SeqCst);
        let retry = tokio::spawn({
            let cache = Arc::clone(&cache);
            let k = k.clone();
            async move { cache.get_for_key(&k).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        gate.notify_waiters();
        assert!(retry.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn getter_errors_surface_with_context() {
        let cache = JobCache::new(FakeResolver::new(), 4).unwrap();
        let err = cache
            .get(
                "org/repo",
                || anyhow::bail!("remote unreachable"),
                Vec::<fn() -> anyhow::Result<String>>::new(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to get base SHA"));

        let err = cache
            .get(
                "org/repo",
                || Ok("ba5e".to_owned()),
                vec![|| anyhow::bail!("pull vanished")],
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to get head ref"));

        let err = cache
            .get(
                "",
                || Ok("ba5e".to_owned()),
                Vec::<fn() -> anyhow::Result<String>>::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::EmptyIdentifier));
    }

    #[tokio::test]
    async fn invalidate_prefix_drops_only_matching_entries() {
        let cache = JobCache::new(FakeResolver::new(), 4).unwrap();
        cache.get_for_key(&key("org/alpha", "aaaa", &[])).await.unwrap();
        cache.get_for_key(&key("org/alpha", "bbbb", &[])).await.unwrap();
        cache.get_for_key(&key("org/beta", "cccc", &[])).await.unwrap();
        assert_eq!(cache.len(), 3);

        cache.invalidate_prefix("org/alpha");
        assert_eq!(cache.len(), 1);

        let lookup = cache.get_for_key(&key("org/beta", "cccc", &[])).await.unwrap();
        assert!(lookup.cache_hit);
    }

    #[tokio::test]
    async fn zero_size_is_rejected() {
        assert!(matches!(
            JobCache::new(FakeResolver::new(), 0),
            Err(CacheError::ZeroSize)
        ));
    }
}
