//! Fans a release message out to the polls parked on its key.
//!
//! Small fan-outs are delivered inline on the dispatch path. Large ones are
//! handed to a delivery worker which wakes waiters in slices of `batch_size`,
//! sleeping `batch_interval` in between, so one publish cannot stall the
//! dispatcher or wake every client at the same instant.
use crate::config::DeliveryConfig;
use crate::metrics_defs::{
    NOTIFICATION_BATCH_ASYNC, NOTIFICATION_FANOUT_SIZE, NOTIFICATION_QUEUE_FULL,
    RELEASE_MESSAGE_INVALID, RELEASE_MESSAGE_RECEIVED,
};
use crate::registry::{NotificationRegistry, WatchRequest};
use crate::types::{MessageKey, Notification, ReleaseMessage, WatchKey};
use shared::{counter, histogram};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

pub trait ReleaseMessageListener: Send + Sync {
    fn handle_message(&self, message: &ReleaseMessage, channel: &str);
}

struct DeliveryBatch {
    key: WatchKey,
    notification: Notification,
    waiters: Vec<Arc<WatchRequest>>,
}

pub struct ReleaseMessageBus {
    registry: Arc<NotificationRegistry>,
    topic: String,
    batch_size: usize,
    // A key always maps to the same worker so its batches stay in log order
    workers: Vec<mpsc::Sender<DeliveryBatch>>,
}

impl ReleaseMessageBus {
    /// Spawns the delivery workers, must be called within a tokio runtime.
    pub fn new(
        registry: Arc<NotificationRegistry>,
        topic: impl Into<String>,
        config: &DeliveryConfig,
    ) -> Self {
        let batch_size = config.batch_size.max(1);
        let batch_interval = config.batch_interval();

        let workers = (0..config.workers.max(1))
            .map(|worker_id| {
                let (tx, rx) = mpsc::channel(config.queue_size.max(1));
                tokio::spawn(run_delivery_worker(
                    worker_id,
                    rx,
                    registry.clone(),
                    batch_size,
                    batch_interval,
                ));
                tx
            })
            .collect();

        ReleaseMessageBus {
            registry,
            topic: topic.into(),
            batch_size,
            workers,
        }
    }

    fn worker_for(&self, key: &str) -> &mpsc::Sender<DeliveryBatch> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.workers[(hasher.finish() % self.workers.len() as u64) as usize]
    }
}

impl ReleaseMessageListener for ReleaseMessageBus {
    fn handle_message(&self, message: &ReleaseMessage, channel: &str) {
        tracing::info!(channel, id = message.id, content = %message.content, "message received");

        let content = message.content.as_str();
        if channel != self.topic || content.is_empty() {
            return;
        }
        counter!(RELEASE_MESSAGE_RECEIVED).increment(1);

        let Some(key) = MessageKey::parse(content) else {
            counter!(RELEASE_MESSAGE_INVALID).increment(1);
            tracing::error!(content, "message format invalid");
            return;
        };

        if !self.registry.contains_key(content) {
            return;
        }

        let waiters = self.registry.lookup(content);
        histogram!(NOTIFICATION_FANOUT_SIZE).record(waiters.len() as f64);

        let mut notification = Notification::new(key.namespace, message.id);
        notification.add_message(content, message.id);

        if waiters.len() > self.batch_size {
            counter!(NOTIFICATION_BATCH_ASYNC).increment(1);
            let waiter_count = waiters.len();
            let batch = DeliveryBatch {
                key: content.to_string(),
                notification,
                waiters,
            };
            let batch = match self.worker_for(content).try_send(batch) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(batch)) => {
                    counter!(NOTIFICATION_QUEUE_FULL).increment(1);
                    tracing::warn!(
                        key = %batch.key,
                        waiter_count,
                        "delivery queue full, delivering inline"
                    );
                    batch
                }
                Err(mpsc::error::TrySendError::Closed(batch)) => {
                    // Workers only stop when the runtime shuts down
                    tracing::error!(
                        key = %batch.key,
                        waiter_count,
                        "delivery worker gone, delivering inline"
                    );
                    batch
                }
            };
            for waiter in &batch.waiters {
                deliver(&self.registry, waiter, &batch.notification);
            }
            return;
        }

        tracing::debug!(count = waiters.len(), key = content, "notify clients");
        for waiter in &waiters {
            deliver(&self.registry, waiter, &notification);
        }
        tracing::debug!("notification completed");
    }
}

async fn run_delivery_worker(
    worker_id: usize,
    mut rx: mpsc::Receiver<DeliveryBatch>,
    registry: Arc<NotificationRegistry>,
    batch_size: usize,
    batch_interval: Duration,
) {
    while let Some(batch) = rx.recv().await {
        tracing::debug!(
            worker_id,
            count = batch.waiters.len(),
            key = %batch.key,
            batch_size,
            "async notify clients"
        );
        for (i, waiter) in batch.waiters.iter().enumerate() {
            if i > 0 && i % batch_size == 0 {
                sleep(batch_interval).await;
            }
            deliver(&registry, waiter, &batch.notification);
        }
    }
    tracing::debug!(worker_id, "delivery worker stopped");
}

/// Resolves one waiter. Failures stay with that waiter.
fn deliver(registry: &NotificationRegistry, waiter: &WatchRequest, notification: &Notification) {
    let result = catch_unwind(AssertUnwindSafe(|| {
        registry.fulfill(waiter, vec![notification.clone()])
    }));
    match result {
        Ok(true) => {}
        Ok(false) => {
            tracing::debug!(watch_id = waiter.id(), "waiter already resolved, skipped");
        }
        Err(_) => {
            tracing::error!(watch_id = waiter.id(), "delivery to waiter panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::WatchState;
    use std::collections::HashMap;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    const TOPIC: &str = "config-release";

    fn bus(registry: &Arc<NotificationRegistry>, batch_size: usize) -> ReleaseMessageBus {
        ReleaseMessageBus::new(
            registry.clone(),
            TOPIC,
            &DeliveryConfig {
                batch_size,
                batch_interval_ms: 1,
                workers: 2,
                queue_size: 64,
            },
        )
    }

    fn park(
        registry: &NotificationRegistry,
        keys: &[&str],
    ) -> (Arc<WatchRequest>, oneshot::Receiver<Vec<Notification>>) {
        let (request, rx) = WatchRequest::new(
            keys.iter().map(|k| k.to_string()).collect(),
            HashMap::new(),
            HashMap::new(),
            Duration::from_secs(60),
        );
        registry.register(&request);
        (request, rx)
    }

    async fn fan_out(waiter_count: usize, batch_size: usize) {
        let registry = Arc::new(NotificationRegistry::new());
        let bus = bus(&registry, batch_size);

        let parked: Vec<_> = (0..waiter_count)
            .map(|_| park(&registry, &["app+default+ns", "app+c1+ns"]))
            .collect();
        // Someone watching an unrelated key must not be woken
        let (bystander, _bystander_rx) = park(&registry, &["app+default+other"]);

        bus.handle_message(&ReleaseMessage::new(9, "app+default+ns"), TOPIC);

        let mut delivered = 0;
        for (request, rx) in parked {
            let notifications = timeout(Duration::from_secs(5), rx)
                .await
                .expect("delivery timed out")
                .expect("responder dropped");
            assert_eq!(notifications.len(), 1);
            assert_eq!(notifications[0].namespace_name, "ns");
            assert_eq!(notifications[0].notification_id, 9);
            assert_eq!(notifications[0].messages.get("app+default+ns"), Some(&9));
            assert_eq!(request.state(), WatchState::Fulfilled);
            delivered += 1;
        }

        assert_eq!(delivered, waiter_count);
        assert_eq!(bystander.state(), WatchState::Pending);
        // Fulfilled waiters are gone from every key, not only the one that fired
        assert!(registry.lookup("app+default+ns").is_empty());
        assert!(registry.lookup("app+c1+ns").is_empty());
        assert_eq!(registry.parked_count(), 1);
    }

    #[tokio::test]
    async fn test_fan_out_below_batch_threshold() {
        fan_out(10, 100).await;
    }

    #[tokio::test]
    async fn test_fan_out_above_batch_threshold() {
        fan_out(250, 100).await;
    }

    #[tokio::test]
    async fn test_fan_out_exactly_at_batch_threshold() {
        fan_out(100, 100).await;
    }

    fn fulfilled(parked: &[(Arc<WatchRequest>, oneshot::Receiver<Vec<Notification>>)]) -> usize {
        parked
            .iter()
            .filter(|(request, _)| request.state() == WatchState::Fulfilled)
            .count()
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_large_fan_out_is_throttled() {
        let registry = Arc::new(NotificationRegistry::new());
        let bus = ReleaseMessageBus::new(
            registry.clone(),
            TOPIC,
            &DeliveryConfig {
                batch_size: 100,
                batch_interval_ms: 1000,
                workers: 1,
                queue_size: 8,
            },
        );
        let parked: Vec<_> = (0..250)
            .map(|_| park(&registry, &["app+default+ns"]))
            .collect();

        bus.handle_message(&ReleaseMessage::new(5, "app+default+ns"), TOPIC);
        // Handed off to the worker, nobody woken on the dispatch path
        assert_eq!(fulfilled(&parked), 0);

        settle().await;
        assert_eq!(fulfilled(&parked), 100);

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(fulfilled(&parked), 200);

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(fulfilled(&parked), 250);
        assert_eq!(registry.parked_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_delivers_inline() {
        let registry = Arc::new(NotificationRegistry::new());
        let bus = ReleaseMessageBus::new(
            registry.clone(),
            TOPIC,
            &DeliveryConfig {
                batch_size: 1,
                batch_interval_ms: 1000,
                workers: 1,
                queue_size: 1,
            },
        );
        let first: Vec<_> = (0..2).map(|_| park(&registry, &["app+default+a"])).collect();
        let second: Vec<_> = (0..2).map(|_| park(&registry, &["app+default+b"])).collect();

        // The worker has not run yet, so the first batch fills its queue
        bus.handle_message(&ReleaseMessage::new(1, "app+default+a"), TOPIC);
        bus.handle_message(&ReleaseMessage::new(2, "app+default+b"), TOPIC);

        assert_eq!(fulfilled(&first), 0);
        assert_eq!(fulfilled(&second), 2);

        settle().await;
        assert_eq!(fulfilled(&first), 1);
        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(fulfilled(&first), 2);
    }

    #[tokio::test]
    async fn test_small_fan_out_is_synchronous() {
        let registry = Arc::new(NotificationRegistry::new());
        let bus = bus(&registry, 100);
        let (request, mut rx) = park(&registry, &["app+default+ns"]);

        bus.handle_message(&ReleaseMessage::new(3, "app+default+ns"), TOPIC);

        // No await point in between: delivered before handle_message returned
        assert_eq!(request.state(), WatchState::Fulfilled);
        assert_eq!(rx.try_recv().unwrap()[0].notification_id, 3);
    }

    #[tokio::test]
    async fn test_ignored_messages() {
        let registry = Arc::new(NotificationRegistry::new());
        let bus = bus(&registry, 100);
        let (request, _rx) = park(&registry, &["app+default+ns"]);

        // Other channel
        bus.handle_message(&ReleaseMessage::new(1, "app+default+ns"), "other-topic");
        // Empty and malformed content
        bus.handle_message(&ReleaseMessage::new(2, ""), TOPIC);
        bus.handle_message(&ReleaseMessage::new(3, "app+default"), TOPIC);
        bus.handle_message(&ReleaseMessage::new(4, "app+default+ns+x"), TOPIC);
        // Nobody watching
        bus.handle_message(&ReleaseMessage::new(5, "app+default+unwatched"), TOPIC);

        assert_eq!(request.state(), WatchState::Pending);
        assert_eq!(registry.lookup("app+default+ns").len(), 1);

        // The bus keeps working after the bad input
        bus.handle_message(&ReleaseMessage::new(6, "app+default+ns"), TOPIC);
        assert_eq!(request.state(), WatchState::Fulfilled);
    }

    #[tokio::test]
    async fn test_resolved_waiters_are_skipped() {
        let registry = Arc::new(NotificationRegistry::new());
        let bus = bus(&registry, 100);
        let (timed_out, timed_out_rx) = park(&registry, &["app+default+ns"]);
        let (waiting, waiting_rx) = park(&registry, &["app+default+ns"]);

        // Snapshot taken while both are parked, then one times out concurrently
        let snapshot = registry.lookup("app+default+ns");
        assert!(registry.expire(&timed_out));
        let notification = Notification::new("ns", 4);
        for waiter in &snapshot {
            deliver(&registry, waiter, &notification);
        }
        drop(bus);

        assert_eq!(timed_out.state(), WatchState::TimedOut);
        assert!(timed_out_rx.await.is_err());
        assert_eq!(waiting.state(), WatchState::Fulfilled);
        assert_eq!(waiting_rx.await.unwrap()[0].notification_id, 4);
    }
}
