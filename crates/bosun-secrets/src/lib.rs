#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **bosun-secrets** – Process-wide store of on-disk secrets.
//!
//! The [`SecretAgent`] maps secret file paths to their current contents,
//! reloading from disk when a file's modification time advances, and keeps a
//! [`Censorer`] in sync so no loaded secret can leak through log output.
//!
//! Secrets may optionally carry a parsed typed value: a typed entry only
//! advances when the parser accepts the new bytes, so a bad write to the
//! underlying file never replaces a last-known-good value.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

mod censor;

pub use censor::{Censorer, CensoringMakeWriter, CensoringWriter};

/// Cadence of the per-secret reload worker.
pub const RELOAD_TICK: Duration = Duration::from_secs(1);

/// After this many consecutive unchanged-mtime ticks the worker force-reloads
/// once, guarding against filesystems with unreliable modification times.
pub const FORCE_RELOAD_TICKS: u32 = 600;

//─────────────────────────────
//  Error types
//─────────────────────────────

/// Errors raised while loading or parsing a secret file.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    /// The secret file could not be read.
    #[error("failed to read secret {path}")]
    Io {
        /// Path of the secret file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The file contained nothing after trimming surrounding whitespace.
    #[error("secret {path} is empty after trimming")]
    Empty {
        /// Path of the secret file.
        path: PathBuf,
    },
    /// The trimmed payload contains internal whitespace or line breaks.
    #[error("secret {path} contains internal whitespace")]
    MalformedToken {
        /// Path of the secret file.
        path: PathBuf,
    },
    /// A typed secret's parser rejected the payload.
    #[error("failed to parse secret {path}")]
    Parse {
        /// Path of the secret file.
        path: PathBuf,
        /// Parser error.
        #[source]
        source: anyhow::Error,
    },
}

//─────────────────────────────
//  Secret agent
//─────────────────────────────

struct AgentInner {
    store: RwLock<HashMap<PathBuf, Vec<u8>>>,
    censorer: Censorer,
    cancel: CancellationToken,
    tick: Duration,
}

impl AgentInner {
    /// Rebuild the censor set from the current map under a shared lock.
    fn refresh_censorer(&self) {
        let store = self.store.read();
        self.censorer.refresh(store.values().map(Vec::as_slice));
    }
}

/// Hot-reloading store of on-disk secrets.
///
/// Cloning is cheap; all clones share the same store, censorer, and reload
/// workers. Reader operations take a shared lock, reload workers take an
/// exclusive lock only across the value swap.
#[derive(Clone)]
pub struct SecretAgent {
    inner: Arc<AgentInner>,
}

impl Default for SecretAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretAgent {
    /// Create an empty agent with the standard one-second reload tick.
    pub fn new() -> Self {
        Self::with_tick_interval(RELOAD_TICK)
    }

    /// Create an agent with a custom reload cadence. Tests use short ticks.
    pub fn with_tick_interval(tick: Duration) -> Self {
        Self {
            inner: Arc::new(AgentInner {
                store: RwLock::new(HashMap::new()),
                censorer: Censorer::new(),
                cancel: CancellationToken::new(),
                tick,
            }),
        }
    }

    /// Create an agent and register every path, failing on the first load
    /// error.
    pub async fn start<I, P>(paths: I) -> Result<Self, SecretError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let agent = Self::new();
        for path in paths {
            agent.add(path).await?;
        }
        Ok(agent)
    }

    /// Load `path` once and register a background reloader for it.
    ///
    /// Fails if the initial load fails, the trimmed content is empty, or the
    /// token contains internal whitespace. After success the value is
    /// published and the censorer refreshed.
    pub async fn add(&self, path: impl AsRef<Path>) -> Result<(), SecretError> {
        let path = path.as_ref().to_path_buf();
        let loaded = load_secret(&path).await?;

        let inner = Arc::clone(&self.inner);
        let publish_path = path.clone();
        let publish: PublishFn = Arc::new(move |bytes: &[u8]| {
            {
                let mut store = inner.store.write();
                store.insert(publish_path.clone(), bytes.to_vec());
            }
            inner.refresh_censorer();
            Ok(())
        });

        publish(&loaded.bytes).expect("raw publish is infallible");
        self.spawn_reloader(path, loaded.mtime, publish);
        Ok(())
    }

    /// As [`SecretAgent::add`], additionally maintaining a parsed value.
    ///
    /// The initial load must both read and parse successfully. On reload, a
    /// parse failure keeps the previous raw and parsed pair and is logged
    /// once per distinct failing content. The returned [`TypedSecret`] is a
    /// cheap cloneable accessor safe to call from any thread.
    pub async fn add_with_parser<T, P>(
        &self,
        path: impl AsRef<Path>,
        parser: P,
    ) -> Result<TypedSecret<T>, SecretError>
    where
        T: Send + Sync + 'static,
        P: Fn(&[u8]) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let path = path.as_ref().to_path_buf();
        let loaded = load_secret(&path).await?;
        let initial = parser(&loaded.bytes).map_err(|source| SecretError::Parse {
            path: path.clone(),
            source,
        })?;

        let slot = Arc::new(RwLock::new(Arc::new(initial)));
        let typed = TypedSecret { value: Arc::clone(&slot) };

        let inner = Arc::clone(&self.inner);
        let publish_path = path.clone();
        let publish: PublishFn = Arc::new(move |bytes: &[u8]| {
            let parsed = parser(bytes).map_err(|source| SecretError::Parse {
                path: publish_path.clone(),
                source,
            })?;
            {
                let mut store = inner.store.write();
                store.insert(publish_path.clone(), bytes.to_vec());
                *slot.write() = Arc::new(parsed);
            }
            inner.refresh_censorer();
            Ok(())
        });

        publish(&loaded.bytes).expect("initial payload already parsed");
        self.spawn_reloader(path, loaded.mtime, publish);
        Ok(typed)
    }

    /// The current raw bytes of a registered secret.
    pub fn get_secret(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.inner.store.read().get(path.as_ref()).cloned()
    }

    /// A cloneable accessor that always yields the current bytes of `path`.
    pub fn token_generator(&self, path: impl AsRef<Path>) -> TokenGenerator {
        TokenGenerator {
            inner: Arc::clone(&self.inner),
            path: path.as_ref().to_path_buf(),
        }
    }

    /// The censorer kept in sync with this agent's secrets.
    pub fn censorer(&self) -> Censorer {
        self.inner.censorer.clone()
    }

    /// Rewrite `content` with every loaded secret masked.
    pub fn censor(&self, content: &[u8]) -> Vec<u8> {
        self.inner.censorer.censor(content)
    }

    /// Stop all reload workers. Loaded values remain readable.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    fn spawn_reloader(&self, path: PathBuf, initial_mtime: Option<SystemTime>, publish: PublishFn) {
        let cancel = self.inner.cancel.clone();
        let tick = self.inner.tick;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut last_mtime = initial_mtime;
            let mut skips: u32 = 0;
            let mut last_failure: Option<Vec<u8>> = None;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let meta = match tokio::fs::metadata(&path).await {
                    Ok(meta) => meta,
                    Err(err) => {
                        warn!(path = %path.display(), %err, "failed to stat secret");
                        continue;
                    }
                };
                let mtime = match meta.modified() {
                    Ok(mtime) => mtime,
                    Err(err) => {
                        warn!(path = %path.display(), %err, "secret mtime unavailable");
                        continue;
                    }
                };
                if let Some(last) = last_mtime {
                    if mtime <= last && skips < FORCE_RELOAD_TICKS {
                        skips += 1;
                        continue;
                    }
                }
                skips = 0;

                let raw = match tokio::fs::read(&path).await {
                    Ok(raw) => raw,
                    Err(err) => {
                        warn!(path = %path.display(), %err, "failed to reload secret, keeping previous value");
                        continue;
                    }
                };
                last_mtime = Some(mtime);

                let trimmed = raw.trim_ascii().to_vec();
                let outcome = validate_token(&path, &trimmed).and_then(|()| publish(&trimmed));
                match outcome {
                    Ok(()) => {
                        last_failure = None;
                        debug!(path = %path.display(), "reloaded secret");
                    }
                    Err(err) => {
                        // Log once per distinct failing content, not per tick.
                        if last_failure.as_deref() != Some(trimmed.as_slice()) {
                            warn!(path = %path.display(), %err, "failed to reload secret, keeping previous value");
                            last_failure = Some(trimmed);
                        }
                    }
                }
            }
        });
    }
}

type PublishFn = Arc<dyn Fn(&[u8]) -> Result<(), SecretError> + Send + Sync>;

//─────────────────────────────
//  Accessors
//─────────────────────────────

/// Accessor yielding the current raw bytes of one registered secret.
#[derive(Clone)]
pub struct TokenGenerator {
    inner: Arc<AgentInner>,
    path: PathBuf,
}

impl TokenGenerator {
    /// The current token bytes, empty if the secret was never registered.
    pub fn token(&self) -> Vec<u8> {
        self.inner
            .store
            .read()
            .get(&self.path)
            .cloned()
            .unwrap_or_default()
    }
}

/// Accessor yielding the current parsed value of a typed secret.
///
/// The value only advances when the parser accepted a reload; callers always
/// observe a complete, last-known-good value.
#[derive(Debug)]
pub struct TypedSecret<T> {
    value: Arc<RwLock<Arc<T>>>,
}

impl<T> Clone for TypedSecret<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
        }
    }
}

impl<T> TypedSecret<T> {
    /// The current parsed value.
    pub fn get(&self) -> Arc<T> {
        Arc::clone(&self.value.read())
    }
}

//─────────────────────────────
//  Loading
//─────────────────────────────

struct LoadedSecret {
    bytes: Vec<u8>,
    mtime: Option<SystemTime>,
}

async fn load_secret(path: &Path) -> Result<LoadedSecret, SecretError> {
    let raw = tokio::fs::read(path).await.map_err(|source| SecretError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mtime = tokio::fs::metadata(path)
        .await
        .ok()
        .and_then(|meta| meta.modified().ok());
    let trimmed = raw.trim_ascii().to_vec();
    validate_token(path, &trimmed)?;
    Ok(LoadedSecret {
        bytes: trimmed,
        mtime,
    })
}

fn validate_token(path: &Path, trimmed: &[u8]) -> Result<(), SecretError> {
    if trimmed.is_empty() {
        return Err(SecretError::Empty {
            path: path.to_path_buf(),
        });
    }
    if trimmed.iter().any(u8::is_ascii_whitespace) {
        return Err(SecretError::MalformedToken {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_file(path: &Path, content: &[u8]) {
        let mut file = std::fs::File::create(path).unwrap();
        file.write_all(content).unwrap();
        file.sync_all().unwrap();
    }

    #[tokio::test]
    async fn add_rejects_empty_secret() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        write_file(&path, b"  \n ");

        let agent = SecretAgent::new();
        let err = agent.add(&path).await.unwrap_err();
        assert!(matches!(err, SecretError::Empty { .. }));
        agent.shutdown();
    }

    #[tokio::test]
    async fn add_rejects_internal_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken");
        write_file(&path, b"abc def\n");

        let agent = SecretAgent::new();
        let err = agent.add(&path).await.unwrap_err();
        assert!(matches!(err, SecretError::MalformedToken { .. }));
        agent.shutdown();
    }

    #[tokio::test]
    async fn add_trims_and_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        write_file(&path, b"\n  hunter2  \n");

        let agent = SecretAgent::new();
        agent.add(&path).await.unwrap();
        assert_eq!(agent.get_secret(&path).unwrap(), b"hunter2");

        let generator = agent.token_generator(&path);
        assert_eq!(generator.token(), b"hunter2");
        agent.shutdown();
    }

    #[tokio::test]
    async fn censorer_tracks_registered_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        write_file(&a, b"SECRET");
        write_file(&b, b"MYSTERY");

        let agent = SecretAgent::start([&a, &b]).await.unwrap();
        let out = agent.censorer().censor_str("A SECRET is a MYSTERY");
        assert_eq!(out, "A ****** is a *******");
        agent.shutdown();
    }

    #[tokio::test]
    async fn typed_secret_requires_initial_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("count");
        write_file(&path, b"not-a-number");

        let agent = SecretAgent::new();
        let err = agent
            .add_with_parser(&path, |bytes| {
                let text = std::str::from_utf8(bytes)?;
                Ok(text.parse::<u64>()?)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SecretError::Parse { .. }));
        agent.shutdown();
    }

    #[tokio::test]
    async fn typed_secret_yields_parsed_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("count");
        write_file(&path, b"1\n");

        let agent = SecretAgent::new();
        let value = agent
            .add_with_parser(&path, |bytes| {
                let text = std::str::from_utf8(bytes)?;
                Ok(text.parse::<u64>()?)
            })
            .await
            .unwrap();
        assert_eq!(*value.get(), 1);
        agent.shutdown();
    }
}
