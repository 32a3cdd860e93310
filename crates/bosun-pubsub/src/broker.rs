//! In-process message broker backing the [`Subscriber`] seam.
//!
//! Topic queues persist across re-subscribes, so a supervisor restart picks
//! up where the previous subscription loop stopped. Suitable for tests and
//! single-process deployments; a cloud pub/sub adapter implements the same
//! traits against the remote service.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{Acker, Delivery, Message, PullSubscription, SubscribeError, Subscriber, SubscriberFactory};

#[derive(Default)]
struct TopicQueue {
    queue: Mutex<VecDeque<Message>>,
    notify: Notify,
    acked: AtomicU64,
    nacked: AtomicU64,
}

/// In-memory broker delivering published messages to subscribers.
#[derive(Default)]
pub struct InMemoryBroker {
    topics: Mutex<HashMap<(String, String), Arc<TopicQueue>>>,
}

impl InMemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, project: &str, topic: &str) -> Arc<TopicQueue> {
        let mut topics = self.topics.lock();
        Arc::clone(
            topics
                .entry((project.to_owned(), topic.to_owned()))
                .or_default(),
        )
    }

    /// Publish a message onto a topic.
    pub fn publish(&self, project: &str, topic: &str, data: &[u8]) {
        self.publish_message(
            project,
            topic,
            Message {
                id: format!("m-{}", self.queue(project, topic).queue.lock().len()),
                data: data.to_vec(),
                attributes: BTreeMap::new(),
            },
        );
    }

    /// Publish a fully-formed message onto a topic.
    pub fn publish_message(&self, project: &str, topic: &str, message: Message) {
        let queue = self.queue(project, topic);
        queue.queue.lock().push_back(message);
        queue.notify.notify_one();
    }

    /// Messages acknowledged on a topic so far.
    pub fn acked(&self, project: &str, topic: &str) -> u64 {
        self.queue(project, topic).acked.load(Ordering::SeqCst)
    }

    /// Messages negatively acknowledged on a topic so far.
    pub fn nacked(&self, project: &str, topic: &str) -> u64 {
        self.queue(project, topic).nacked.load(Ordering::SeqCst)
    }

    /// Messages still waiting on a topic.
    pub fn backlog(&self, project: &str, topic: &str) -> usize {
        self.queue(project, topic).queue.lock().len()
    }
}

#[async_trait]
impl SubscriberFactory for InMemoryBroker {
    async fn subscribe(&self, sub: &PullSubscription) -> anyhow::Result<Box<dyn Subscriber>> {
        Ok(Box::new(QueueSubscriber {
            queue: self.queue(&sub.project, &sub.topic),
        }))
    }
}

struct QueueSubscriber {
    queue: Arc<TopicQueue>,
}

#[async_trait]
impl Subscriber for QueueSubscriber {
    async fn receive(&mut self) -> Result<Option<Delivery>, SubscribeError> {
        loop {
            {
                let mut queue = self.queue.queue.lock();
                if let Some(message) = queue.pop_front() {
                    return Ok(Some(Delivery::new(
                        message,
                        Box::new(QueueAcker {
                            queue: Arc::clone(&self.queue),
                        }),
                    )));
                }
            }
            self.queue.notify.notified().await;
        }
    }
}

struct QueueAcker {
    queue: Arc<TopicQueue>,
}

#[async_trait]
impl Acker for QueueAcker {
    async fn ack(self: Box<Self>) {
        self.queue.acked.fetch_add(1, Ordering::SeqCst);
    }

    async fn nack(self: Box<Self>) {
        self.queue.nacked.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription(project: &str, topic: &str) -> PullSubscription {
        PullSubscription {
            project: project.to_owned(),
            topic: topic.to_owned(),
            allowed_targets: Vec::new(),
            max_outstanding_messages: 10,
        }
    }

    #[tokio::test]
    async fn delivers_published_messages_in_order() {
        let broker = InMemoryBroker::new();
        broker.publish("p", "t", b"one");
        broker.publish("p", "t", b"two");

        let mut subscriber = broker.subscribe(&subscription("p", "t")).await.unwrap();
        let first = subscriber.receive().await.unwrap().unwrap();
        assert_eq!(first.message().data, b"one");
        first.ack().await;
        let second = subscriber.receive().await.unwrap().unwrap();
        assert_eq!(second.message().data, b"two");
        second.nack().await;

        assert_eq!(broker.acked("p", "t"), 1);
        assert_eq!(broker.nacked("p", "t"), 1);
    }

    #[tokio::test]
    async fn queue_survives_resubscription() {
        let broker = InMemoryBroker::new();
        broker.publish("p", "t", b"waiting");

        // First subscriber goes away without receiving.
        drop(broker.subscribe(&subscription("p", "t")).await.unwrap());

        let mut second = broker.subscribe(&subscription("p", "t")).await.unwrap();
        let delivery = second.receive().await.unwrap().unwrap();
        assert_eq!(delivery.message().data, b"waiting");
    }
}
