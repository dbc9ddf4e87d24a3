//! In-process broker
//!
//! Implements the full BrokerChannel contract including message-TTL plus
//! dead-letter redelivery, which is what the delay scheduler builds on.
//! Expiry is driven by the injected clock: every poll sweeps due messages
//! into their dead-letter target, and tests can call `expire_due` directly
//! after advancing a ManualClock.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use sito_common::Clock;

use crate::channel::{
    ArgValue, BrokerChannel, Delivery, ExchangeOptions, QueueOptions, ARG_DEAD_LETTER_EXCHANGE,
    ARG_DEAD_LETTER_ROUTING_KEY, ARG_MESSAGE_TTL,
};
use crate::{BrokerError, Result};

#[derive(Debug, Clone)]
struct Binding {
    routing_key: String,
    queue: String,
}

#[derive(Debug)]
struct Stored {
    tag: u64,
    payload: Vec<u8>,
    redelivered: bool,
    expire_at: Option<i64>,
}

#[derive(Default)]
struct QueueState {
    args: Vec<(String, ArgValue)>,
    ready: Mutex<VecDeque<Stored>>,
    unacked: Mutex<HashMap<u64, Stored>>,
}

impl QueueState {
    fn arg_str(&self, name: &str) -> Option<&str> {
        self.args.iter().find_map(|(k, v)| match v {
            ArgValue::Str(s) if k == name => Some(s.as_str()),
            _ => None,
        })
    }

    fn arg_int(&self, name: &str) -> Option<i64> {
        self.args.iter().find_map(|(k, v)| match v {
            ArgValue::Int(i) if k == name => Some(*i),
            _ => None,
        })
    }
}

pub struct MemoryBroker {
    clock: Arc<dyn Clock>,
    exchanges: DashMap<String, Vec<Binding>>,
    queues: DashMap<String, Arc<QueueState>>,
    tag_seq: AtomicU64,
}

impl MemoryBroker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            exchanges: DashMap::new(),
            queues: DashMap::new(),
            tag_seq: AtomicU64::new(1),
        }
    }

    fn enqueue(&self, queue: &str, payload: &[u8], redelivered: bool) {
        let Some(state) = self.queues.get(queue).map(|q| q.clone()) else {
            debug!(queue = %queue, "Dropping message for unknown queue");
            return;
        };
        let expire_at = state
            .arg_int(ARG_MESSAGE_TTL)
            .map(|ttl_ms| self.clock.epoch() + (ttl_ms + 999) / 1000);
        let stored = Stored {
            tag: self.tag_seq.fetch_add(1, Ordering::SeqCst),
            payload: payload.to_vec(),
            redelivered,
            expire_at,
        };
        state.ready.lock().push_back(stored);
    }

    fn route(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        if exchange.is_empty() {
            // Default exchange: routing key names the queue directly.
            self.enqueue(routing_key, payload, false);
            return Ok(());
        }
        let Some(bindings) = self.exchanges.get(exchange) else {
            return Err(BrokerError::PublishFailed {
                exchange: exchange.to_string(),
                reason: "no exchange".to_string(),
            });
        };
        let targets: Vec<String> = bindings
            .iter()
            .filter(|b| b.routing_key == routing_key)
            .map(|b| b.queue.clone())
            .collect();
        drop(bindings);
        if targets.is_empty() {
            debug!(exchange = %exchange, routing_key = %routing_key, "Unroutable message dropped");
        }
        for queue in targets {
            self.enqueue(&queue, payload, false);
        }
        Ok(())
    }

    /// Move every due message into its dead-letter target. Messages in a
    /// TTL queue with no dead-letter exchange are discarded on expiry.
    pub fn expire_due(&self) {
        let now = self.clock.epoch();
        let queue_names: Vec<String> = self.queues.iter().map(|e| e.key().clone()).collect();
        for name in queue_names {
            let Some(state) = self.queues.get(&name).map(|q| q.clone()) else {
                continue;
            };
            let mut due = Vec::new();
            {
                let mut ready = state.ready.lock();
                while ready
                    .front()
                    .is_some_and(|m| m.expire_at.is_some_and(|e| e <= now))
                {
                    if let Some(msg) = ready.pop_front() {
                        due.push(msg);
                    }
                }
            }
            if due.is_empty() {
                continue;
            }
            let dlx = state.arg_str(ARG_DEAD_LETTER_EXCHANGE).map(str::to_string);
            let dlk = state
                .arg_str(ARG_DEAD_LETTER_ROUTING_KEY)
                .map(str::to_string);
            for msg in due {
                match (&dlx, &dlk) {
                    (Some(exchange), Some(routing_key)) => {
                        debug!(queue = %name, exchange = %exchange, "Dead-lettering expired message");
                        if let Err(e) = self.route(exchange, routing_key, &msg.payload) {
                            warn!(queue = %name, error = %e, "Dead-letter routing failed, message lost");
                        }
                    }
                    _ => debug!(queue = %name, "Expired message discarded (no DLX)"),
                }
            }
        }
    }

    // Introspection helpers for tests and the worker startup summary.

    pub fn has_exchange(&self, name: &str) -> bool {
        self.exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.queues.contains_key(name)
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.queues.iter().map(|e| e.key().clone()).collect()
    }

    pub fn queue_depth(&self, name: &str) -> usize {
        self.queues
            .get(name)
            .map(|q| q.ready.lock().len())
            .unwrap_or(0)
    }

    pub fn queue_args(&self, name: &str) -> Vec<(String, ArgValue)> {
        self.queues
            .get(name)
            .map(|q| q.args.clone())
            .unwrap_or_default()
    }

    /// Drain and return every ready payload of a queue, oldest first.
    pub fn take_payloads(&self, name: &str) -> Vec<Vec<u8>> {
        self.queues
            .get(name)
            .map(|q| q.ready.lock().drain(..).map(|m| m.payload).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BrokerChannel for MemoryBroker {
    async fn exchange_declare(&self, name: &str, opts: ExchangeOptions) -> Result<()> {
        if opts.passive {
            if self.exchanges.contains_key(name) {
                return Ok(());
            }
            return Err(BrokerError::NotFound(format!("exchange '{name}'")));
        }
        self.exchanges.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn queue_declare(&self, name: &str, opts: QueueOptions) -> Result<()> {
        if opts.passive {
            if self.queues.contains_key(name) {
                return Ok(());
            }
            return Err(BrokerError::NotFound(format!("queue '{name}'")));
        }
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(QueueState {
                    args: opts.args.clone(),
                    ..Default::default()
                })
            });
        Ok(())
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        if !self.queues.contains_key(queue) {
            return Err(BrokerError::DeclareFailed {
                name: queue.to_string(),
                reason: "bind to undeclared queue".to_string(),
            });
        }
        let mut bindings = self
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::DeclareFailed {
                name: exchange.to_string(),
                reason: "bind to undeclared exchange".to_string(),
            })?;
        let exists = bindings
            .iter()
            .any(|b| b.routing_key == routing_key && b.queue == queue);
        if !exists {
            bindings.push(Binding {
                routing_key: routing_key.to_string(),
                queue: queue.to_string(),
            });
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        self.route(exchange, routing_key, payload)
    }

    async fn poll(&self, queue: &str, max: u32) -> Result<Vec<Delivery>> {
        self.expire_due();
        let state = self
            .queues
            .get(queue)
            .map(|q| q.clone())
            .ok_or_else(|| BrokerError::ConsumerFailed {
                queue: queue.to_string(),
                reason: "no such queue".to_string(),
            })?;

        let mut out = Vec::new();
        let mut ready = state.ready.lock();
        let mut unacked = state.unacked.lock();
        while out.len() < max as usize {
            let Some(msg) = ready.pop_front() else { break };
            out.push(Delivery {
                tag: msg.tag,
                queue: queue.to_string(),
                payload: msg.payload.clone(),
                redelivered: msg.redelivered,
            });
            unacked.insert(msg.tag, msg);
        }
        Ok(out)
    }

    async fn ack(&self, queue: &str, tag: u64) -> Result<()> {
        if let Some(state) = self.queues.get(queue) {
            state.unacked.lock().remove(&tag);
        }
        Ok(())
    }

    async fn nack(&self, queue: &str, tag: u64, requeue: bool) -> Result<()> {
        let Some(state) = self.queues.get(queue).map(|q| q.clone()) else {
            return Ok(());
        };
        let Some(mut msg) = state.unacked.lock().remove(&tag) else {
            return Ok(());
        };
        if requeue {
            msg.redelivered = true;
            state.ready.lock().push_front(msg);
            return Ok(());
        }
        let dlx = state.arg_str(ARG_DEAD_LETTER_EXCHANGE).map(str::to_string);
        let dlk = state
            .arg_str(ARG_DEAD_LETTER_ROUTING_KEY)
            .map(str::to_string);
        if let (Some(exchange), Some(routing_key)) = (dlx, dlk) {
            self.route(&exchange, &routing_key, &msg.payload)?;
        }
        Ok(())
    }
}
