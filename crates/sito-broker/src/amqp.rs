//! AMQP 0.9.1 binding for BrokerChannel using lapin
//!
//! One connection per worker process; publishes and active declares share a
//! long-lived channel. Passive declares run on a scratch channel because a
//! failed passive declare closes the channel it ran on.

use std::sync::Arc;

use async_trait::async_trait;
use lapin::options::{
    BasicAckOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::Mutex;
use tracing::info;

use crate::channel::{ArgValue, BrokerChannel, Delivery, ExchangeOptions, QueueOptions};
use crate::{BrokerError, Result};

pub struct AmqpBroker {
    connection: Connection,
    channel: Arc<Mutex<Channel>>,
}

fn is_not_found(err: &lapin::Error) -> bool {
    let text = err.to_string();
    text.contains("NOT_FOUND") || text.contains("404")
}

fn field_table(args: &[(String, ArgValue)]) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in args {
        let amqp_value = match value {
            ArgValue::Str(s) => AMQPValue::LongString(s.as_str().into()),
            ArgValue::Int(i) => AMQPValue::LongLongInt(*i),
        };
        table.insert(key.as_str().into(), amqp_value);
    }
    table
}

impl AmqpBroker {
    pub async fn connect(url: &str) -> Result<Self> {
        let connection = Connection::connect(
            url,
            ConnectionProperties::default().with_connection_name("sito-worker".into()),
        )
        .await
        .map_err(|e| BrokerError::Connection(format!("AMQP connect failed: {e}")))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(format!("AMQP channel failed: {e}")))?;

        info!("AMQP connection established");
        Ok(Self {
            connection,
            channel: Arc::new(Mutex::new(channel)),
        })
    }

    async fn scratch_channel(&self) -> Result<Channel> {
        self.connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(format!("AMQP scratch channel failed: {e}")))
    }
}

#[async_trait]
impl BrokerChannel for AmqpBroker {
    async fn exchange_declare(&self, name: &str, opts: ExchangeOptions) -> Result<()> {
        let declare_opts = ExchangeDeclareOptions {
            passive: opts.passive,
            durable: false,
            auto_delete: false,
            internal: false,
            nowait: false,
        };
        let result = if opts.passive {
            let channel = self.scratch_channel().await?;
            channel
                .exchange_declare(name, ExchangeKind::Direct, declare_opts, FieldTable::default())
                .await
        } else {
            let channel = self.channel.lock().await;
            channel
                .exchange_declare(name, ExchangeKind::Direct, declare_opts, FieldTable::default())
                .await
        };
        result.map_err(|e| {
            if opts.passive && is_not_found(&e) {
                BrokerError::NotFound(format!("exchange '{name}'"))
            } else {
                BrokerError::DeclareFailed {
                    name: name.to_string(),
                    reason: e.to_string(),
                }
            }
        })
    }

    async fn queue_declare(&self, name: &str, opts: QueueOptions) -> Result<()> {
        let declare_opts = QueueDeclareOptions {
            passive: opts.passive,
            durable: false,
            exclusive: false,
            auto_delete: false,
            nowait: false,
        };
        let result = if opts.passive {
            let channel = self.scratch_channel().await?;
            channel
                .queue_declare(name, declare_opts, FieldTable::default())
                .await
        } else {
            let channel = self.channel.lock().await;
            channel
                .queue_declare(name, declare_opts, field_table(&opts.args))
                .await
        };
        result.map(|_| ()).map_err(|e| {
            if opts.passive && is_not_found(&e) {
                BrokerError::NotFound(format!("queue '{name}'"))
            } else {
                BrokerError::DeclareFailed {
                    name: name.to_string(),
                    reason: e.to_string(),
                }
            }
        })
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let channel = self.channel.lock().await;
        channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::DeclareFailed {
                name: queue.to_string(),
                reason: format!("bind failed: {e}"),
            })
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        let channel = self.channel.lock().await;
        // Best-effort: queue the publish, do not await broker confirmation.
        channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_content_type("application/json".into()),
            )
            .await
            .map(|_confirm| ())
            .map_err(|e| BrokerError::PublishFailed {
                exchange: exchange.to_string(),
                reason: e.to_string(),
            })
    }

    async fn poll(&self, queue: &str, max: u32) -> Result<Vec<Delivery>> {
        let channel = self.channel.lock().await;
        let mut out = Vec::with_capacity(max as usize);
        for _ in 0..max {
            let got = channel
                .basic_get(queue, BasicGetOptions { no_ack: false })
                .await
                .map_err(|e| BrokerError::ConsumerFailed {
                    queue: queue.to_string(),
                    reason: format!("basic_get failed: {e}"),
                })?;
            match got {
                Some(message) => out.push(Delivery {
                    tag: message.delivery.delivery_tag,
                    queue: queue.to_string(),
                    payload: message.delivery.data.clone(),
                    redelivered: message.delivery.redelivered,
                }),
                None => break,
            }
        }
        Ok(out)
    }

    async fn ack(&self, queue: &str, tag: u64) -> Result<()> {
        let channel = self.channel.lock().await;
        channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::ConsumerFailed {
                queue: queue.to_string(),
                reason: format!("ack failed: {e}"),
            })
    }

    async fn nack(&self, queue: &str, tag: u64, requeue: bool) -> Result<()> {
        let channel = self.channel.lock().await;
        channel
            .basic_nack(
                tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BrokerError::ConsumerFailed {
                queue: queue.to_string(),
                reason: format!("nack failed: {e}"),
            })
    }
}
