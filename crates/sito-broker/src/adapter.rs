//! Topology declaration and the multi-queue consume loop

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use sito_config::{ClassKind, ClassRegistry};

use crate::channel::{BrokerChannel, Delivery, ExchangeOptions, QueueOptions};
use crate::{BrokerError, Result};

const POLL_BATCH: u32 = 10;
const IDLE_PAUSE: Duration = Duration::from_millis(100);
const ERROR_PAUSE: Duration = Duration::from_secs(1);

/// Acknowledgement outcome returned by a per-queue callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Ack,
    /// Reject; dead-letters when the queue has a DLX, otherwise drops.
    Nack,
    /// Reject and put back for redelivery.
    Requeue,
}

/// Per-queue consumer callback. Invoked serially for one queue; distinct
/// queues run concurrently.
#[async_trait]
pub trait ConsumeCallback: Send + Sync {
    async fn consume(&self, delivery: &Delivery) -> ConsumeOutcome;
}

/// A queue wired to its callback for the consume loop.
pub struct QueueBinding {
    pub queue: String,
    pub callback: Arc<dyn ConsumeCallback>,
}

/// Per-queue consume-loop counters.
#[derive(Debug, Default)]
pub struct ConsumeStats {
    pub delivered: AtomicU64,
    pub acked: AtomicU64,
    pub nacked: AtomicU64,
}

/// Idempotent topology declaration plus the blocking multiplex consumer.
/// The adapter is the only component that touches broker wire state.
pub struct BrokerAdapter {
    channel: Arc<dyn BrokerChannel>,
    shutdown_tx: broadcast::Sender<()>,
    stats: DashMap<String, Arc<ConsumeStats>>,
}

impl BrokerAdapter {
    pub fn new(channel: Arc<dyn BrokerChannel>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            channel,
            shutdown_tx,
            stats: DashMap::new(),
        }
    }

    pub fn channel(&self) -> Arc<dyn BrokerChannel> {
        self.channel.clone()
    }

    /// Signal every consume loop to stop between messages.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub fn stats_for(&self, queue: &str) -> Arc<ConsumeStats> {
        self.stats
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(ConsumeStats::default()))
            .clone()
    }

    /// Declare every exchange and queue referenced by the registry:
    /// passive first, active on a no-exchange/no-queue miss, then bind
    /// with routing key = queue name unless the class overrides it.
    /// Notify classes without a queue only get their exchange checked.
    pub async fn declare_topology(&self, registry: &ClassRegistry) -> Result<()> {
        let mut declared_exchanges = std::collections::HashSet::new();

        for (name, class) in registry.iter() {
            if declared_exchanges.insert(class.exchange.clone()) {
                self.ensure_exchange(&class.exchange).await?;
            }

            let queue = match (&class.queue, class.kind) {
                (Some(queue), _) => queue,
                (None, ClassKind::Notify) => {
                    debug!(class = %name, exchange = %class.exchange, "Notify class without queue, exchange only");
                    continue;
                }
                (None, _) => {
                    return Err(BrokerError::DeclareFailed {
                        name: name.to_string(),
                        reason: "work/exchange class declares no queue".to_string(),
                    })
                }
            };

            self.ensure_queue(queue).await?;
            let routing_key = class.route_key.as_deref().unwrap_or(queue);
            self.channel
                .queue_bind(queue, &class.exchange, routing_key)
                .await?;
            debug!(
                class = %name,
                exchange = %class.exchange,
                queue = %queue,
                routing_key = %routing_key,
                "Declared and bound"
            );
        }

        info!(classes = registry.len(), "Broker topology declared");
        Ok(())
    }

    async fn ensure_exchange(&self, name: &str) -> Result<()> {
        match self
            .channel
            .exchange_declare(name, ExchangeOptions { passive: true })
            .await
        {
            Ok(()) => Ok(()),
            Err(BrokerError::NotFound(_)) => {
                info!(exchange = %name, "Exchange missing, declaring");
                self.channel
                    .exchange_declare(name, ExchangeOptions::default())
                    .await
            }
            Err(e) => Err(e),
        }
    }

    async fn ensure_queue(&self, name: &str) -> Result<()> {
        match self.channel.queue_declare(name, QueueOptions::passive()).await {
            Ok(()) => Ok(()),
            Err(BrokerError::NotFound(_)) => {
                info!(queue = %name, "Queue missing, declaring");
                self.channel
                    .queue_declare(name, QueueOptions::default())
                    .await
            }
            Err(e) => Err(e),
        }
    }

    /// Best-effort publish to an exchange.
    pub async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        self.channel.publish(exchange, routing_key, payload).await
    }

    /// Blocking multiplex consumer. Runs one serial loop per queue and
    /// returns when the shutdown signal fires or, with `qmax` set, as soon
    /// as any queue has processed that many messages (debug aid; remaining
    /// channel state is torn down by process exit).
    pub async fn consume_poll(&self, bindings: Vec<QueueBinding>, qmax: Option<u64>) -> Result<()> {
        let mut handles = Vec::with_capacity(bindings.len());

        for binding in bindings {
            let channel = self.channel.clone();
            let stats = self.stats_for(&binding.queue);
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            let shutdown_tx = self.shutdown_tx.clone();
            let queue = binding.queue;
            let callback = binding.callback;

            handles.push(tokio::spawn(async move {
                info!(queue = %queue, "Consumer loop started");
                'outer: loop {
                    tokio::select! {
                        _ = shutdown_rx.recv() => {
                            break;
                        }
                        polled = channel.poll(&queue, POLL_BATCH) => {
                            let deliveries = match polled {
                                Ok(d) => d,
                                Err(e) => {
                                    error!(queue = %queue, error = %e, "Poll failed");
                                    tokio::time::sleep(ERROR_PAUSE).await;
                                    continue;
                                }
                            };
                            if deliveries.is_empty() {
                                tokio::time::sleep(IDLE_PAUSE).await;
                                continue;
                            }
                            for delivery in deliveries {
                                let outcome = callback.consume(&delivery).await;
                                let acked = match outcome {
                                    ConsumeOutcome::Ack => {
                                        channel.ack(&queue, delivery.tag).await
                                    }
                                    ConsumeOutcome::Nack => {
                                        channel.nack(&queue, delivery.tag, false).await
                                    }
                                    ConsumeOutcome::Requeue => {
                                        channel.nack(&queue, delivery.tag, true).await
                                    }
                                };
                                if let Err(e) = acked {
                                    warn!(queue = %queue, tag = delivery.tag, error = %e, "Acknowledge failed");
                                }
                                match outcome {
                                    ConsumeOutcome::Ack => {
                                        stats.acked.fetch_add(1, Ordering::SeqCst);
                                    }
                                    _ => {
                                        stats.nacked.fetch_add(1, Ordering::SeqCst);
                                    }
                                }
                                let seen = stats.delivered.fetch_add(1, Ordering::SeqCst) + 1;
                                if qmax.is_some_and(|limit| seen >= limit) {
                                    info!(queue = %queue, seen = seen, "Consume cap reached, stopping all loops");
                                    let _ = shutdown_tx.send(());
                                    break 'outer;
                                }
                            }
                        }
                    }
                }
                info!(
                    queue = %queue,
                    delivered = stats.delivered.load(Ordering::SeqCst),
                    acked = stats.acked.load(Ordering::SeqCst),
                    nacked = stats.nacked.load(Ordering::SeqCst),
                    "Consumer loop stopped"
                );
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                return Err(BrokerError::ConsumerFailed {
                    queue: "<join>".to_string(),
                    reason: e.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use sito_common::{ManualClock, SystemClock};
    use sito_config::{MemorySettingsStore, RouterSettings};
    use serde_json::json;

    struct CountingCallback {
        outcome: ConsumeOutcome,
        seen: AtomicU64,
    }

    #[async_trait]
    impl ConsumeCallback for CountingCallback {
        async fn consume(&self, _delivery: &Delivery) -> ConsumeOutcome {
            self.seen.fetch_add(1, Ordering::SeqCst);
            self.outcome
        }
    }

    fn registry() -> sito_config::ClassRegistry {
        let store = MemorySettingsStore::new(json!({
            "QueueRouter": {
                "settings_key": "settings",
                "cargo_key": "cargo",
                "work_class": {
                    "SendText": {
                        "exchange": "sito.start",
                        "queue": "start",
                        "process_route": ["Dispatch"]
                    }
                },
                "exchange_class": {
                    "Dispatch": {"exchange": "sito.dispatch", "queue": "dispatch"}
                },
                "notify_class": {
                    "OpsPing": {"exchange": "ops.notify", "route_key": "ping"}
                }
            }
        }));
        RouterSettings::load(&store).unwrap().registry
    }

    #[tokio::test]
    async fn declare_topology_is_idempotent() {
        let broker = Arc::new(MemoryBroker::new(Arc::new(ManualClock::new(0))));
        let adapter = BrokerAdapter::new(broker.clone());
        let registry = registry();

        adapter.declare_topology(&registry).await.unwrap();
        adapter.declare_topology(&registry).await.unwrap();

        assert!(broker.has_exchange("sito.start"));
        assert!(broker.has_exchange("sito.dispatch"));
        assert!(broker.has_exchange("ops.notify"));
        assert!(broker.has_queue("start"));
        assert!(broker.has_queue("dispatch"));
        // Notify class owns no queue.
        assert_eq!(broker.queue_names().len(), 2);
    }

    #[tokio::test]
    async fn consume_poll_stops_at_qmax() {
        let broker = Arc::new(MemoryBroker::new(Arc::new(SystemClock)));
        let adapter = BrokerAdapter::new(broker.clone());
        broker
            .queue_declare("work", QueueOptions::default())
            .await
            .unwrap();
        for i in 0..5u8 {
            broker.publish("", "work", &[i]).await.unwrap();
        }

        let callback = Arc::new(CountingCallback {
            outcome: ConsumeOutcome::Ack,
            seen: AtomicU64::new(0),
        });
        adapter
            .consume_poll(
                vec![QueueBinding {
                    queue: "work".into(),
                    callback: callback.clone(),
                }],
                Some(3),
            )
            .await
            .unwrap();

        assert_eq!(callback.seen.load(Ordering::SeqCst), 3);
        let stats = adapter.stats_for("work");
        assert_eq!(stats.delivered.load(Ordering::SeqCst), 3);
        assert_eq!(broker.queue_depth("work"), 2);
    }

    #[tokio::test]
    async fn requeued_messages_come_back() {
        let broker = Arc::new(MemoryBroker::new(Arc::new(SystemClock)));
        let adapter = BrokerAdapter::new(broker.clone());
        broker
            .queue_declare("work", QueueOptions::default())
            .await
            .unwrap();
        broker.publish("", "work", b"again").await.unwrap();

        let callback = Arc::new(CountingCallback {
            outcome: ConsumeOutcome::Requeue,
            seen: AtomicU64::new(0),
        });
        adapter
            .consume_poll(
                vec![QueueBinding {
                    queue: "work".into(),
                    callback: callback.clone(),
                }],
                Some(2),
            )
            .await
            .unwrap();

        // Same message delivered twice, still on the queue afterwards.
        assert_eq!(callback.seen.load(Ordering::SeqCst), 2);
        assert_eq!(broker.queue_depth("work"), 1);
    }
}
