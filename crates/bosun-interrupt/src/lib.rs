#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **bosun-interrupt** – Graceful-shutdown coordination for the control plane.
//!
//! A single [`InterruptManager`] is created in `main` and handed to every
//! component that spawns long-running work. It listens for OS termination
//! signals, broadcasts one edge-triggered cancellation to all registered
//! workers and servers, and bounds the subsequent drain with a grace period.
//!
//! Unit tests construct fresh instances and fire the broadcast with
//! [`InterruptManager::terminate`] instead of delivering a real signal.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Default upper bound on time spent draining registered workers.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(60);

//─────────────────────────────
//  Interrupt manager
//─────────────────────────────

/// Coordinates shutdown of every worker and server in the process.
///
/// All clones share the same broadcast and worker accounting.
#[derive(Debug, Clone)]
pub struct InterruptManager {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    token: CancellationToken,
    tracker: TaskTracker,
    grace: Mutex<Duration>,
    signal_installed: AtomicBool,
    // Worker name -> live count, reported when the grace timer wins the drain.
    running: Mutex<HashMap<String, usize>>,
}

impl Default for InterruptManager {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptManager {
    /// Create a manager with the default one-minute grace period.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                token: CancellationToken::new(),
                tracker: TaskTracker::new(),
                grace: Mutex::new(DEFAULT_GRACE_PERIOD),
                signal_installed: AtomicBool::new(false),
                running: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Override the drain grace period.
    pub fn set_grace_period(&self, grace: Duration) {
        *self.inner.grace.lock().expect("grace lock poisoned") = grace;
    }

    /// Install the process signal handler. Only the first call has effect;
    /// the broadcast is edge-triggered and later signals are ignored.
    pub fn spawn_signal_listener(&self) {
        if self.inner.signal_installed.swap(true, Ordering::SeqCst) {
            return;
        }
        let token = self.inner.token.clone();
        tokio::spawn(async move {
            let mut fired = false;
            loop {
                wait_for_termination_signal().await;
                if fired {
                    debug!("ignoring repeated termination signal");
                    continue;
                }
                fired = true;
                info!("received termination signal, broadcasting shutdown");
                token.cancel();
            }
        });
    }

    /// A cancellation token that fires when the broadcast does.
    ///
    /// Tokens handed out after the broadcast are already cancelled, so late
    /// registrants run their shutdown immediately instead of hanging.
    ///
    /// A bare token holds no drain slot: [`InterruptManager::wait_for_graceful_shutdown`]
    /// does not wait for work that only watches a token. Work that must be
    /// awaited during the drain goes through [`InterruptManager::run`],
    /// [`InterruptManager::tick`], [`InterruptManager::on_interrupt`], or
    /// [`InterruptManager::listen_and_serve`], which account a slot for it.
    pub fn context(&self) -> CancellationToken {
        self.inner.token.child_token()
    }

    /// Fire the broadcast without an OS signal.
    pub fn terminate(&self) {
        self.inner.token.cancel();
    }

    /// Whether the broadcast has fired.
    pub fn is_terminated(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Spawn `work` as an accounted worker. The slot is released when the
    /// returned future completes; `work` receives the broadcast token.
    pub fn run<F, Fut>(&self, name: &str, work: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.context();
        let guard = RunningGuard::enter(&self.inner, name);
        self.inner.tracker.spawn(async move {
            work(token).await;
            drop(guard);
        });
    }

    /// Run `f` once the broadcast fires. The slot is accounted immediately so
    /// the drain waits for the hook to finish.
    pub fn on_interrupt<F, Fut>(&self, name: &str, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.context();
        let guard = RunningGuard::enter(&self.inner, name);
        self.inner.tracker.spawn(async move {
            token.cancelled().await;
            f().await;
            drop(guard);
        });
    }

    /// Run `work` repeatedly, sleeping `interval()` between rounds, until the
    /// broadcast fires. The interval is recomputed after every round.
    pub fn tick<W, Fut, I>(&self, name: &str, mut work: W, interval: I)
    where
        W: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
        I: Fn() -> Duration + Send + 'static,
    {
        let token = self.context();
        let guard = RunningGuard::enter(&self.inner, name);
        self.inner.tracker.spawn(async move {
            loop {
                work().await;
                let pause = interval();
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
            drop(guard);
        });
    }

    /// Serve `router` on `listener` until the broadcast fires, then shut the
    /// server down gracefully, bounded by `grace`.
    pub fn listen_and_serve(&self, name: &str, listener: TcpListener, router: axum::Router, grace: Duration) {
        let token = self.context();
        let guard = RunningGuard::enter(&self.inner, name);
        let name = name.to_owned();
        self.inner.tracker.spawn(async move {
            let shutdown = token.clone();
            let serve = async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await
            };
            tokio::select! {
                result = serve => {
                    if let Err(err) = result {
                        warn!(server = %name, %err, "server exited with error");
                    }
                }
                _ = async { token.cancelled().await; tokio::time::sleep(grace).await } => {
                    warn!(server = %name, ?grace, "server did not drain within grace period");
                }
            }
            drop(guard);
        });
    }

    /// Block until the broadcast has fired and every accounted worker has
    /// finished, or until the grace period elapses.
    pub async fn wait_for_graceful_shutdown(&self) {
        self.inner.token.cancelled().await;
        self.inner.tracker.close();
        let grace = *self.inner.grace.lock().expect("grace lock poisoned");
        if tokio::time::timeout(grace, self.inner.tracker.wait()).await.is_err() {
            let running = self.inner.running.lock().expect("running lock poisoned");
            let names: Vec<&str> = running.keys().map(String::as_str).collect();
            warn!(?grace, still_running = ?names, "grace period elapsed before all workers finished");
        } else {
            info!("all workers finished, shutting down");
        }
    }
}

#[cfg(unix)]
async fn wait_for_termination_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(err) => {
            warn!(%err, "failed to install SIGTERM handler, falling back to ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Tracks a worker's name for the drain-timeout warning.
struct RunningGuard {
    inner: Arc<Inner>,
    name: String,
}

impl RunningGuard {
    fn enter(inner: &Arc<Inner>, name: &str) -> Self {
        *inner
            .running
            .lock()
            .expect("running lock poisoned")
            .entry(name.to_owned())
            .or_insert(0) += 1;
        Self {
            inner: Arc::clone(inner),
            name: name.to_owned(),
        }
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let mut running = self.inner.running.lock().expect("running lock poisoned");
        if let Some(count) = running.get_mut(&self.name) {
            *count -= 1;
            if *count == 0 {
                running.remove(&self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    #[tokio::test]
    async fn drain_waits_for_all_workers() {
        let manager = InterruptManager::new();
        let finished = Arc::new(AtomicU32::new(0));
        for i in 0..3 {
            let finished = Arc::clone(&finished);
            manager.run(&format!("worker-{i}"), move |_token| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                finished.fetch_add(1, Ordering::SeqCst);
            });
        }

        let started = Instant::now();
        manager.terminate();
        manager.wait_for_graceful_shutdown().await;

        assert_eq!(finished.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn grace_period_bounds_slow_workers() {
        let manager = InterruptManager::new();
        manager.set_grace_period(Duration::from_millis(150));
        manager.run("sleeper", |_token| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let started = Instant::now();
        manager.terminate();
        manager.wait_for_graceful_shutdown().await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(150));
        assert!(elapsed < Duration::from_millis(1100));
    }

    #[tokio::test]
    async fn workers_observe_the_broadcast() {
        let manager = InterruptManager::new();
        let observed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&observed);
        manager.run("watcher", move |token| async move {
            token.cancelled().await;
            flag.store(true, Ordering::SeqCst);
        });

        manager.terminate();
        manager.wait_for_graceful_shutdown().await;
        assert!(observed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn on_interrupt_runs_after_broadcast() {
        let manager = InterruptManager::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        manager.on_interrupt("hook", move || async move {
            flag.store(true, Ordering::SeqCst);
        });
        assert!(!ran.load(Ordering::SeqCst));

        manager.terminate();
        manager.wait_for_graceful_shutdown().await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn late_registration_shuts_down_immediately() {
        let manager = InterruptManager::new();
        manager.terminate();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        manager.on_interrupt("late-hook", move || async move {
            flag.store(true, Ordering::SeqCst);
        });

        let token = manager.context();
        assert!(token.is_cancelled());

        manager.wait_for_graceful_shutdown().await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn tick_recomputes_interval_and_stops_on_broadcast() {
        let manager = InterruptManager::new();
        let rounds = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&rounds);
        manager.tick(
            "ticker",
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
            || Duration::from_millis(10),
        );

        tokio::time::sleep(Duration::from_millis(55)).await;
        manager.terminate();
        manager.wait_for_graceful_shutdown().await;

        let seen = rounds.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several rounds, got {seen}");
    }
}
