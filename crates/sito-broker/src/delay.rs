//! Delayed delivery
//!
//! A delayed message parks in a TTL queue whose dead-letter target is the
//! real exchange/routing-key; the broker redelivers it at or after the
//! requested wall-clock epoch. Epochs round up to minute granularity so the
//! number of distinct delay queues stays bounded, and each delay queue
//! expires itself shortly after its messages fire.

use std::sync::Arc;

use tracing::{debug, info};

use sito_common::Clock;

use crate::channel::{
    ArgValue, BrokerChannel, QueueOptions, ARG_DEAD_LETTER_EXCHANGE, ARG_DEAD_LETTER_ROUTING_KEY,
    ARG_MESSAGE_TTL, ARG_QUEUE_EXPIRES,
};
use crate::Result;

const MINUTE: i64 = 60;
/// Grace period a fired delay queue lingers before the broker reaps it.
const QUEUE_LINGER_MS: i64 = 60_000;

/// When the parked message should re-enter its target.
#[derive(Debug, Clone, Copy)]
pub enum DelaySpec {
    /// Absolute wall-clock epoch seconds.
    ExpireEpoch(i64),
    /// Seconds from now.
    ExpireDelta(i64),
}

pub struct DelayScheduler {
    channel: Arc<dyn BrokerChannel>,
    clock: Arc<dyn Clock>,
}

impl DelayScheduler {
    pub fn new(channel: Arc<dyn BrokerChannel>, clock: Arc<dyn Clock>) -> Self {
        Self { channel, clock }
    }

    /// Round an epoch up to the next minute boundary.
    pub fn round_up_to_minute(epoch: i64) -> i64 {
        (epoch + MINUTE - 1) / MINUTE * MINUTE
    }

    /// Name of the delay queue parking messages for one (epoch, target).
    pub fn delay_queue_name(epoch: i64, target_exchange: &str, target_route: &str) -> String {
        format!("delay.{epoch}.{target_exchange}.{target_route}")
    }

    /// Park `payload` so it re-enters `target_exchange`/`target_route` at
    /// or after the requested time. A delay already in the past publishes
    /// straight to the target.
    pub async fn publish_delayed(
        &self,
        spec: DelaySpec,
        target_exchange: &str,
        target_route: &str,
        payload: &[u8],
    ) -> Result<()> {
        let now = self.clock.epoch();
        let requested = match spec {
            DelaySpec::ExpireEpoch(epoch) => epoch,
            DelaySpec::ExpireDelta(delta) => now + delta,
        };
        let epoch = Self::round_up_to_minute(requested);
        let ttl_ms = (epoch - now) * 1000;

        if ttl_ms <= 0 {
            debug!(
                exchange = %target_exchange,
                routing_key = %target_route,
                "Delay already due, publishing directly"
            );
            return self.channel.publish(target_exchange, target_route, payload).await;
        }

        let queue = Self::delay_queue_name(epoch, target_exchange, target_route);
        self.channel
            .queue_declare(
                &queue,
                QueueOptions {
                    passive: false,
                    args: vec![
                        (ARG_MESSAGE_TTL.into(), ArgValue::Int(ttl_ms)),
                        (
                            ARG_DEAD_LETTER_EXCHANGE.into(),
                            ArgValue::Str(target_exchange.into()),
                        ),
                        (
                            ARG_DEAD_LETTER_ROUTING_KEY.into(),
                            ArgValue::Str(target_route.into()),
                        ),
                        (
                            ARG_QUEUE_EXPIRES.into(),
                            ArgValue::Int(ttl_ms + QUEUE_LINGER_MS),
                        ),
                    ],
                },
            )
            .await?;

        info!(
            queue = %queue,
            fire_epoch = epoch,
            ttl_ms = ttl_ms,
            "Parked delayed message"
        );
        self.channel.publish("", &queue, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ExchangeOptions;
    use crate::memory::MemoryBroker;
    use sito_common::ManualClock;

    async fn target(broker: &MemoryBroker) {
        broker
            .exchange_declare("sito.dispatch", ExchangeOptions::default())
            .await
            .unwrap();
        broker
            .queue_declare("dispatch", QueueOptions::default())
            .await
            .unwrap();
        broker
            .queue_bind("dispatch", "sito.dispatch", "dispatch")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn delayed_message_fires_at_rounded_epoch() {
        let clock = Arc::new(ManualClock::new(1_700_000_010));
        let broker = Arc::new(MemoryBroker::new(clock.clone()));
        target(&broker).await;

        let scheduler = DelayScheduler::new(broker.clone(), clock.clone());
        scheduler
            .publish_delayed(DelaySpec::ExpireDelta(95), "sito.dispatch", "dispatch", b"later")
            .await
            .unwrap();

        // 1_700_000_105 rounds up to 1_700_000_160.
        let queue = DelayScheduler::delay_queue_name(1_700_000_160, "sito.dispatch", "dispatch");
        assert!(broker.has_queue(&queue));
        assert_eq!(broker.queue_depth("dispatch"), 0);

        clock.set(1_700_000_159);
        broker.expire_due();
        assert_eq!(broker.queue_depth("dispatch"), 0);

        clock.set(1_700_000_160);
        broker.expire_due();
        assert_eq!(broker.take_payloads("dispatch"), vec![b"later".to_vec()]);
    }

    #[tokio::test]
    async fn past_epoch_publishes_immediately() {
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let broker = Arc::new(MemoryBroker::new(clock.clone()));
        target(&broker).await;

        let scheduler = DelayScheduler::new(broker.clone(), clock.clone());
        scheduler
            .publish_delayed(
                DelaySpec::ExpireEpoch(1_699_999_000),
                "sito.dispatch",
                "dispatch",
                b"now",
            )
            .await
            .unwrap();
        assert_eq!(broker.queue_depth("dispatch"), 1);
    }

    #[test]
    fn minute_rounding_is_up_and_stable() {
        assert_eq!(DelayScheduler::round_up_to_minute(120), 120);
        assert_eq!(DelayScheduler::round_up_to_minute(121), 180);
        assert_eq!(DelayScheduler::round_up_to_minute(179), 180);
    }
}
