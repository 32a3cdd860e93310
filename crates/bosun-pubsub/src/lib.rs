#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **bosun-pubsub** – Supervisor for pull subscriptions.
//!
//! The [`PullServer`] keeps one receive loop per configured `(project,
//! topic)` subscription, routes every delivered message through a
//! user-supplied handler, and accounts acknowledgements. When the
//! subscription set changes it cancels the running loops, waits for them to
//! drain (in-flight messages finish handling), and starts the new set;
//! re-subscribing unchanged subscriptions is acceptable and loses nothing.
//!
//! The message transport sits behind the [`Subscriber`]/[`SubscriberFactory`]
//! seam; [`InMemoryBroker`] is the in-process implementation used by tests
//! and single-process deployments.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use bosun_interrupt::InterruptManager;

mod broker;

pub use broker::InMemoryBroker;

/// Buffer size of the configuration-delta channel.
pub const CONFIG_CHANNEL_BUFFER: usize = 2;

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// One pull endpoint on a `(project, topic)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullSubscription {
    /// Cloud project owning the topic.
    pub project: String,
    /// Topic identifier.
    pub topic: String,
    /// Job targets messages on this subscription may address.
    pub allowed_targets: Vec<String>,
    /// Upper bound on unacknowledged messages held at once.
    pub max_outstanding_messages: usize,
}

/// The pub/sub-relevant slice of the process configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullConfig {
    /// The subscriptions to serve.
    pub subscriptions: Vec<PullSubscription>,
}

/// A buffered channel for pushing configuration deltas to the server.
pub fn config_channel() -> (mpsc::Sender<PullConfig>, mpsc::Receiver<PullConfig>) {
    mpsc::channel(CONFIG_CHANNEL_BUFFER)
}

//─────────────────────────────
//  Messages and the transport seam
//─────────────────────────────

/// One delivered pub/sub message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Broker-assigned message identifier.
    pub id: String,
    /// Payload bytes.
    pub data: Vec<u8>,
    /// Broker attributes.
    pub attributes: BTreeMap<String, String>,
}

/// Acknowledgement half of a delivery.
#[async_trait]
pub trait Acker: Send {
    /// Confirm successful handling.
    async fn ack(self: Box<Self>);
    /// Request redelivery.
    async fn nack(self: Box<Self>);
}

/// A message plus its acknowledgement handle.
pub struct Delivery {
    message: Message,
    acker: Box<dyn Acker>,
}

impl Delivery {
    /// Pair a message with its acker.
    pub fn new(message: Message, acker: Box<dyn Acker>) -> Self {
        Self { message, acker }
    }

    /// The delivered message.
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Acknowledge the message.
    pub async fn ack(self) {
        self.acker.ack().await;
    }

    /// Negatively acknowledge the message.
    pub async fn nack(self) {
        self.acker.nack().await;
    }
}

/// Failures while receiving from a subscription.
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    /// The caller lacks permission on the subscription. Logged and
    /// swallowed: misconfiguration must not crash the supervisor.
    #[error("code = PermissionDenied: {0}")]
    PermissionDenied(String),
    /// Any other receive failure; ends the subscription's loop.
    #[error("receive failed: {0}")]
    Receive(String),
}

impl SubscribeError {
    /// Whether this failure is a permission problem. Also recognizes
    /// foreign errors carried in [`SubscribeError::Receive`] by message.
    pub fn is_permission_denied(&self) -> bool {
        match self {
            SubscribeError::PermissionDenied(_) => true,
            SubscribeError::Receive(message) => message.contains("code = PermissionDenied"),
        }
    }
}

/// A live receive stream for one subscription.
#[async_trait]
pub trait Subscriber: Send {
    /// The next delivery; `None` once the stream ends cleanly.
    async fn receive(&mut self) -> Result<Option<Delivery>, SubscribeError>;
}

/// Opens subscriptions on the underlying transport.
#[async_trait]
pub trait SubscriberFactory: Send + Sync {
    /// Open a subscription honoring its outstanding-message bound.
    async fn subscribe(&self, sub: &PullSubscription) -> Result<Box<dyn Subscriber>>;
}

/// Routes messages; a returned error drives the NACK path.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one delivered message.
    async fn handle(&self, sub: &PullSubscription, message: &Message) -> Result<()>;
}

//─────────────────────────────
//  Metrics
//─────────────────────────────

/// Acknowledgement counters for the whole server.
#[derive(Debug, Default)]
pub struct PullMetrics {
    acks: AtomicU64,
    nacks: AtomicU64,
}

/// A point-in-time view of [`PullMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Messages handled successfully.
    pub acks: u64,
    /// Messages whose handler failed.
    pub nacks: u64,
}

impl PullMetrics {
    /// Read the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            acks: self.acks.load(Ordering::SeqCst),
            nacks: self.nacks.load(Ordering::SeqCst),
        }
    }
}

//─────────────────────────────
//  Server
//─────────────────────────────

/// Supervisor owning one receive loop per configured subscription.
pub struct PullServer<F, H> {
    factory: Arc<F>,
    handler: Arc<H>,
    metrics: Arc<PullMetrics>,
}

impl<F, H> PullServer<F, H>
where
    F: SubscriberFactory + 'static,
    H: MessageHandler + 'static,
{
    /// Create a server routing messages from `factory` through `handler`.
    pub fn new(factory: Arc<F>, handler: Arc<H>) -> Self {
        Self {
            factory,
            handler,
            metrics: Arc::new(PullMetrics::default()),
        }
    }

    /// The server's acknowledgement counters.
    pub fn metrics(&self) -> Arc<PullMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Run under the interrupt manager as an accounted worker.
    pub fn spawn(
        self: Arc<Self>,
        interrupt: &InterruptManager,
        initial: PullConfig,
        config_rx: mpsc::Receiver<PullConfig>,
    ) {
        let server = self;
        interrupt.run("pull-server", move |token| async move {
            if let Err(err) = server.run(token, initial, config_rx).await {
                error!(%err, "pull server failed");
            }
        });
    }

    /// Serve until `token` fires.
    ///
    /// On every configuration delta the pub/sub-relevant slice is diffed
    /// against the running set; only a real change triggers a restart, which
    /// waits for all running loops (and their in-flight messages) first.
    pub async fn run(
        &self,
        token: CancellationToken,
        initial: PullConfig,
        mut config_rx: mpsc::Receiver<PullConfig>,
    ) -> Result<()> {
        let mut current = initial.subscriptions;
        let mut config_open = true;
        loop {
            let derived = token.child_token();
            let mut loops = JoinSet::new();
            for sub in current.clone() {
                let factory = Arc::clone(&self.factory);
                let handler = Arc::clone(&self.handler);
                let metrics = Arc::clone(&self.metrics);
                let loop_token = derived.clone();
                loops.spawn(async move {
                    run_subscription(factory, handler, metrics, sub, loop_token).await
                });
            }
            info!(subscriptions = current.len(), "pull server serving");

            let next = loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        derived.cancel();
                        drain(&mut loops).await;
                        info!("pull server stopped");
                        return Ok(());
                    }
                    delta = config_rx.recv(), if config_open => {
                        match delta {
                            Some(config) => {
                                if config.subscriptions == current {
                                    debug!("configuration change does not affect subscriptions");
                                } else {
                                    break config.subscriptions;
                                }
                            }
                            None => config_open = false,
                        }
                    }
                    finished = loops.join_next(), if !loops.is_empty() => {
                        match finished {
                            Some(Ok(Ok(()))) => {}
                            Some(Ok(Err(err))) => {
                                derived.cancel();
                                drain(&mut loops).await;
                                return Err(err);
                            }
                            Some(Err(join_err)) => {
                                derived.cancel();
                                drain(&mut loops).await;
                                return Err(anyhow::Error::new(join_err))
                                    .context("subscription loop panicked");
                            }
                            None => {}
                        }
                    }
                }
            };

            info!("subscription set changed, restarting receive loops");
            derived.cancel();
            drain(&mut loops).await;
            current = next;
        }
    }
}

async fn drain(loops: &mut JoinSet<Result<()>>) {
    while let Some(finished) = loops.join_next().await {
        if let Ok(Err(err)) = finished {
            warn!(%err, "subscription loop ended with error during drain");
        }
    }
}

async fn run_subscription<F, H>(
    factory: Arc<F>,
    handler: Arc<H>,
    metrics: Arc<PullMetrics>,
    sub: PullSubscription,
    token: CancellationToken,
) -> Result<()>
where
    F: SubscriberFactory,
    H: MessageHandler,
{
    let mut subscriber = factory
        .subscribe(&sub)
        .await
        .with_context(|| format!("subscribing to {}/{}", sub.project, sub.topic))?;
    debug!(project = %sub.project, topic = %sub.topic, "subscription loop started");
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!(project = %sub.project, topic = %sub.topic, "subscription loop cancelled");
                return Ok(());
            }
            received = subscriber.receive() => match received {
                Ok(Some(delivery)) => {
                    match handler.handle(&sub, delivery.message()).await {
                        Ok(()) => {
                            metrics.acks.fetch_add(1, Ordering::SeqCst);
                            delivery.ack().await;
                        }
                        Err(err) => {
                            warn!(
                                project = %sub.project,
                                topic = %sub.topic,
                                %err,
                                "message handler failed"
                            );
                            metrics.nacks.fetch_add(1, Ordering::SeqCst);
                            delivery.nack().await;
                        }
                    }
                }
                Ok(None) => {
                    info!(project = %sub.project, topic = %sub.topic, "subscription stream ended");
                    return Ok(());
                }
                Err(err) if err.is_permission_denied() => {
                    warn!(
                        project = %sub.project,
                        topic = %sub.topic,
                        %err,
                        "permission denied, dropping subscription"
                    );
                    return Ok(());
                }
                Err(err) => {
                    return Err(anyhow::Error::new(err)).with_context(|| {
                        format!("receiving from {}/{}", sub.project, sub.topic)
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_denied_detection_covers_foreign_errors() {
        let native = SubscribeError::PermissionDenied("no access".to_owned());
        assert!(native.is_permission_denied());

        let foreign = SubscribeError::Receive(
            "rpc error: code = PermissionDenied desc = forbidden".to_owned(),
        );
        assert!(foreign.is_permission_denied());

        let other = SubscribeError::Receive("connection reset".to_owned());
        assert!(!other.is_permission_denied());
    }

    #[test]
    fn config_channel_is_buffered() {
        let (tx, _rx) = config_channel();
        assert!(tx.try_send(PullConfig::default()).is_ok());
        assert!(tx.try_send(PullConfig::default()).is_ok());
        assert!(tx.try_send(PullConfig::default()).is_err());
    }
}
