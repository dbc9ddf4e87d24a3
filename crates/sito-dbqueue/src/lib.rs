//! DB-update publisher
//!
//! Relational state changes never touch SQL here: they are published as JSON
//! mutations onto sharded DB-update queues and applied by downstream
//! consumers. Mutations sharing a `task_start` hash to the same shard, so
//! every statement of one transaction reaches one consumer in FIFO order. A
//! `start` precedes each statement group and a `commit` (or `rollback` on
//! failure) closes it; downstream applies the group atomically, and all row
//! writes are upserts by primary key so redelivery is safe.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info};

use sito_broker::{BrokerChannel, BrokerError};
use sito_common::{
    Clock, MessagePacket, TAG_CARGO, TAG_HISTORY, TAG_SETTINGS, TAG_STATUS_DETAIL,
};

/// Logical database the request tables live in.
pub const REQUEST_DB: &str = "sito_messaging";
pub const REQUEST_TABLE: &str = "request";
pub const REQUEST_TAGS_TABLE: &str = "request_tags";
pub const REQUEST_BATCH_TABLE: &str = "request_batch";

const UNKNOWN_CALLER: &str = "unknown_caller";

#[derive(Debug, thiserror::Error)]
pub enum DbQueueError {
    #[error("transaction '{transaction_id}' rolled back: {reason}")]
    TransactionAborted {
        transaction_id: String,
        reason: String,
    },

    #[error("packet has no record_id; request row was never assigned")]
    MissingRecordId,

    #[error("mutation encode failed: {0}")]
    Encode(#[source] serde_json::Error),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

pub type Result<T> = std::result::Result<T, DbQueueError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionMode {
    Start,
    Commit,
    Rollback,
}

/// One SQL statement, shipped as data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbStatement {
    pub db_name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub values: Vec<Value>,
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub where_clause: Option<Map<String, Value>>,
    #[serde(rename = "macro", default, skip_serializing_if = "Option::is_none")]
    pub sql_macro: Option<String>,
    pub task_start: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbTransaction {
    pub transaction_mode: TransactionMode,
    pub transaction_id: String,
    pub task_start: i64,
}

/// Everything the DB-update queue carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum DbMutation {
    Insert(DbStatement),
    Update(DbStatement),
    Delete(DbStatement),
    Transaction(DbTransaction),
}

impl DbMutation {
    pub fn task_start(&self) -> i64 {
        match self {
            DbMutation::Insert(s) | DbMutation::Update(s) | DbMutation::Delete(s) => s.task_start,
            DbMutation::Transaction(t) => t.task_start,
        }
    }

    fn stamp(&mut self, transaction_id: &str, task_start: i64) {
        match self {
            DbMutation::Insert(s) | DbMutation::Update(s) | DbMutation::Delete(s) => {
                s.task_start = task_start;
                s.transaction_id = Some(transaction_id.to_string());
            }
            DbMutation::Transaction(t) => {
                t.task_start = task_start;
                t.transaction_id = transaction_id.to_string();
            }
        }
    }
}

/// Compound request-row update; see `DbUpdatePublisher::publish_with_request`.
pub struct RequestUpdate<'a> {
    pub packet: &'a MessagePacket,
    /// Caller-supplied statements emitted before the request upserts.
    pub records: Vec<DbMutation>,
    pub caller: Option<&'a str>,
    pub skip_request: bool,
    pub transaction_id: Option<String>,
    /// Positive value marks the heavy tags as expiring.
    pub expires: i64,
}

impl<'a> RequestUpdate<'a> {
    pub fn new(packet: &'a MessagePacket) -> Self {
        Self {
            packet,
            records: Vec::new(),
            caller: None,
            skip_request: false,
            transaction_id: None,
            expires: 0,
        }
    }

    pub fn caller(mut self, caller: &'a str) -> Self {
        self.caller = Some(caller);
        self
    }

    pub fn records(mut self, records: Vec<DbMutation>) -> Self {
        self.records = records;
        self
    }

    pub fn expires(mut self, expires: i64) -> Self {
        self.expires = expires;
        self
    }
}

pub struct DbUpdatePublisher {
    channel: Arc<dyn BrokerChannel>,
    clock: Arc<dyn Clock>,
    exchange: String,
    shards: u32,
}

impl DbUpdatePublisher {
    pub fn new(
        channel: Arc<dyn BrokerChannel>,
        clock: Arc<dyn Clock>,
        exchange: impl Into<String>,
        shards: u32,
    ) -> Self {
        Self {
            channel,
            clock,
            exchange: exchange.into(),
            shards: shards.max(1),
        }
    }

    /// Stable affinity hash: every mutation with the same task_start lands
    /// on the same shard regardless of which process published it.
    pub fn shard_of(&self, task_start: i64) -> u32 {
        task_start.rem_euclid(self.shards as i64) as u32
    }

    pub fn routing_key(&self, task_start: i64) -> String {
        format!("db-updates.{}", self.shard_of(task_start))
    }

    pub async fn publish(&self, mutation: &DbMutation) -> Result<()> {
        let payload = serde_json::to_vec(mutation).map_err(DbQueueError::Encode)?;
        let routing_key = self.routing_key(mutation.task_start());
        debug!(routing_key = %routing_key, "Publishing DB mutation");
        self.channel
            .publish(&self.exchange, &routing_key, &payload)
            .await?;
        Ok(())
    }

    pub async fn publish_transaction(
        &self,
        mode: TransactionMode,
        transaction_id: &str,
        task_start: i64,
    ) -> Result<()> {
        self.publish(&DbMutation::Transaction(DbTransaction {
            transaction_mode: mode,
            transaction_id: transaction_id.to_string(),
            task_start,
        }))
        .await
    }

    /// Publish a transaction: start, caller records, request-row upsert plus
    /// the four heavy tags and the request_batch link, commit. Any failure
    /// publishes a rollback for the same transaction id and surfaces the
    /// original error. Returns the transaction id used.
    pub async fn publish_with_request(&self, update: RequestUpdate<'_>) -> Result<String> {
        let settings = &update.packet.settings;
        let record_id = settings
            .record_id
            .clone()
            .ok_or(DbQueueError::MissingRecordId)?;
        let task_start = settings.task_start.unwrap_or_else(|| self.clock.epoch());
        let transaction_id = update.transaction_id.clone().unwrap_or_else(|| {
            format!("{record_id}_{}", update.caller.unwrap_or(UNKNOWN_CALLER))
        });

        self.publish_transaction(TransactionMode::Start, &transaction_id, task_start)
            .await?;

        let result = self
            .publish_body(&update, &record_id, &transaction_id, task_start)
            .await;

        match result {
            Ok(()) => {
                self.publish_transaction(TransactionMode::Commit, &transaction_id, task_start)
                    .await?;
                info!(transaction_id = %transaction_id, record_id = %record_id, "Request update committed");
                Ok(transaction_id)
            }
            Err(e) => {
                if let Err(rollback_err) = self
                    .publish_transaction(TransactionMode::Rollback, &transaction_id, task_start)
                    .await
                {
                    error!(
                        transaction_id = %transaction_id,
                        error = %rollback_err,
                        "Rollback publish failed after transaction error"
                    );
                }
                Err(DbQueueError::TransactionAborted {
                    transaction_id,
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn publish_body(
        &self,
        update: &RequestUpdate<'_>,
        record_id: &str,
        transaction_id: &str,
        task_start: i64,
    ) -> Result<()> {
        for record in &update.records {
            let mut record = record.clone();
            record.stamp(transaction_id, task_start);
            self.publish(&record).await?;
        }

        if update.skip_request {
            return Ok(());
        }

        let settings = &update.packet.settings;

        let mut columns = vec!["id".to_string()];
        let mut values = vec![Value::from(record_id)];
        for (column, value) in [
            ("state", settings.state.as_ref().map(|s| Value::from(s.as_str()))),
            ("sent_time", settings.sent_time.map(Value::from)),
            (
                "fallback_mode",
                settings.fallback_mode.as_ref().map(|s| Value::from(s.as_str())),
            ),
            (
                "system_id",
                settings.system_id.as_ref().map(|s| Value::from(s.as_str())),
            ),
        ] {
            if let Some(value) = value {
                columns.push(column.to_string());
                values.push(value);
            }
        }
        self.publish(&DbMutation::Insert(DbStatement {
            db_name: REQUEST_DB.into(),
            table: REQUEST_TABLE.into(),
            columns,
            values,
            where_clause: None,
            sql_macro: None,
            task_start,
            transaction_id: Some(transaction_id.to_string()),
        }))
        .await?;

        let expires_flag = i64::from(update.expires > 0);
        let system_id = settings.system_id.clone().unwrap_or_default();
        let tags = [
            (
                TAG_SETTINGS,
                serde_json::to_value(settings).map_err(DbQueueError::Encode)?,
            ),
            (TAG_CARGO, update.packet.cargo.clone()),
            (
                TAG_HISTORY,
                serde_json::to_value(&settings.history).map_err(DbQueueError::Encode)?,
            ),
            (
                TAG_STATUS_DETAIL,
                settings
                    .request_status_detail
                    .clone()
                    .map(Value::from)
                    .unwrap_or(Value::from("")),
            ),
        ];
        for (tag_name, tag_value) in tags {
            self.publish(&tag_mutation(
                record_id,
                &system_id,
                tag_name,
                tag_value,
                expires_flag,
                task_start,
                transaction_id,
            )?)
            .await?;
        }

        if let Some(batch_id) = &settings.batch_id {
            self.publish(&DbMutation::Insert(DbStatement {
                db_name: REQUEST_DB.into(),
                table: REQUEST_BATCH_TABLE.into(),
                columns: vec!["request_id".into(), "batch_id".into()],
                values: vec![Value::from(record_id), Value::from(batch_id.as_str())],
                where_clause: None,
                sql_macro: None,
                task_start,
                transaction_id: Some(transaction_id.to_string()),
            }))
            .await?;
        }

        Ok(())
    }
}

/// Build a request_tags upsert. Non-scalar values are JSON-serialized;
/// strings are stored raw.
pub fn tag_mutation(
    record_id: &str,
    system_id: &str,
    tag_name: &str,
    tag_value: Value,
    expires_flag: i64,
    task_start: i64,
    transaction_id: &str,
) -> Result<DbMutation> {
    let rendered = match tag_value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => serde_json::to_string(&other).map_err(DbQueueError::Encode)?,
    };
    Ok(DbMutation::Insert(DbStatement {
        db_name: REQUEST_DB.into(),
        table: REQUEST_TAGS_TABLE.into(),
        columns: vec![
            "request_id".into(),
            "system_id".into(),
            "tag_name".into(),
            "tag_value".into(),
            "expires_flag".into(),
        ],
        values: vec![
            Value::from(record_id),
            Value::from(system_id),
            Value::from(tag_name),
            Value::from(rendered),
            Value::from(expires_flag),
        ],
        where_clause: None,
        sql_macro: None,
        task_start,
        transaction_id: Some(transaction_id.to_string()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sito_broker::{Delivery, ExchangeOptions, MemoryBroker, QueueOptions};
    use sito_common::{ManualClock, PacketSettings};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Delegates to a MemoryBroker but fails publishes from the Nth call on.
    struct FlakyChannel {
        inner: Arc<MemoryBroker>,
        fail_from: u32,
        published: AtomicU32,
    }

    #[async_trait]
    impl BrokerChannel for FlakyChannel {
        async fn exchange_declare(&self, name: &str, opts: ExchangeOptions) -> sito_broker::Result<()> {
            self.inner.exchange_declare(name, opts).await
        }
        async fn queue_declare(&self, name: &str, opts: QueueOptions) -> sito_broker::Result<()> {
            self.inner.queue_declare(name, opts).await
        }
        async fn queue_bind(
            &self,
            queue: &str,
            exchange: &str,
            routing_key: &str,
        ) -> sito_broker::Result<()> {
            self.inner.queue_bind(queue, exchange, routing_key).await
        }
        async fn publish(
            &self,
            exchange: &str,
            routing_key: &str,
            payload: &[u8],
        ) -> sito_broker::Result<()> {
            let n = self.published.fetch_add(1, Ordering::SeqCst);
            if n >= self.fail_from && !payload_is_rollback(payload) {
                return Err(BrokerError::PublishFailed {
                    exchange: exchange.to_string(),
                    reason: "injected failure".to_string(),
                });
            }
            self.inner.publish(exchange, routing_key, payload).await
        }
        async fn poll(&self, queue: &str, max: u32) -> sito_broker::Result<Vec<Delivery>> {
            self.inner.poll(queue, max).await
        }
        async fn ack(&self, queue: &str, tag: u64) -> sito_broker::Result<()> {
            self.inner.ack(queue, tag).await
        }
        async fn nack(&self, queue: &str, tag: u64, requeue: bool) -> sito_broker::Result<()> {
            self.inner.nack(queue, tag, requeue).await
        }
    }

    fn payload_is_rollback(payload: &[u8]) -> bool {
        serde_json::from_slice::<DbMutation>(payload)
            .map(|m| {
                matches!(
                    m,
                    DbMutation::Transaction(DbTransaction {
                        transaction_mode: TransactionMode::Rollback,
                        ..
                    })
                )
            })
            .unwrap_or(false)
    }

    async fn updates_broker(shards: u32) -> Arc<MemoryBroker> {
        let broker = Arc::new(MemoryBroker::new(Arc::new(ManualClock::new(1_700_000_000))));
        broker
            .exchange_declare("sito.db-updates", ExchangeOptions::default())
            .await
            .unwrap();
        for shard in 0..shards {
            let queue = format!("db-updates.{shard}");
            broker
                .queue_declare(&queue, QueueOptions::default())
                .await
                .unwrap();
            broker
                .queue_bind(&queue, "sito.db-updates", &queue)
                .await
                .unwrap();
        }
        broker
    }

    fn packet() -> MessagePacket {
        MessagePacket::new(
            serde_json::json!({"text": "hello"}),
            PacketSettings {
                record_id: Some("req-9".into()),
                task_start: Some(1_700_000_123),
                state: Some("ABORTED".into()),
                system_id: Some("42".into()),
                batch_id: Some("b1".into()),
                request_status_detail: Some("carrier rejected".into()),
                history: vec!["A".into(), "B".into()],
                ..Default::default()
            },
        )
    }

    fn decode_all(payloads: Vec<Vec<u8>>) -> Vec<DbMutation> {
        payloads
            .into_iter()
            .map(|p| serde_json::from_slice(&p).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn affinity_keeps_one_transaction_on_one_shard() {
        let broker = updates_broker(4).await;
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let publisher = DbUpdatePublisher::new(broker.clone(), clock, "sito.db-updates", 4);

        let task_start = 1_700_000_123;
        assert_eq!(publisher.shard_of(task_start), publisher.shard_of(task_start));

        let txn = publisher
            .publish_with_request(RequestUpdate::new(&packet()).caller("results"))
            .await
            .unwrap();
        assert_eq!(txn, "req-9_results");

        let shard = publisher.shard_of(task_start);
        for other in 0..4u32 {
            let depth = broker.queue_depth(&format!("db-updates.{other}"));
            if other == shard {
                // start + request + 4 tags + request_batch + commit
                assert_eq!(depth, 8);
            } else {
                assert_eq!(depth, 0);
            }
        }
    }

    #[tokio::test]
    async fn committed_transaction_brackets_statements() {
        let broker = updates_broker(1).await;
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let publisher = DbUpdatePublisher::new(broker.clone(), clock, "sito.db-updates", 1);

        publisher
            .publish_with_request(RequestUpdate::new(&packet()).caller("results"))
            .await
            .unwrap();

        let mutations = decode_all(broker.take_payloads("db-updates.0"));
        assert!(matches!(
            &mutations[0],
            DbMutation::Transaction(t) if t.transaction_mode == TransactionMode::Start
        ));
        assert!(matches!(
            mutations.last().unwrap(),
            DbMutation::Transaction(t) if t.transaction_mode == TransactionMode::Commit
        ));

        let request_row = mutations.iter().find_map(|m| match m {
            DbMutation::Insert(s) if s.table == REQUEST_TABLE => Some(s),
            _ => None,
        });
        let request_row = request_row.expect("request upsert present");
        assert!(request_row.columns.contains(&"state".to_string()));
        assert_eq!(request_row.values[0], Value::from("req-9"));

        let tag_names: Vec<&str> = mutations
            .iter()
            .filter_map(|m| match m {
                DbMutation::Insert(s) if s.table == REQUEST_TAGS_TABLE => {
                    s.values.get(2).and_then(Value::as_str)
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            tag_names,
            vec![TAG_SETTINGS, TAG_CARGO, TAG_HISTORY, TAG_STATUS_DETAIL]
        );

        assert!(mutations.iter().any(|m| matches!(
            m,
            DbMutation::Insert(s) if s.table == REQUEST_BATCH_TABLE
        )));
    }

    #[tokio::test]
    async fn failure_mid_transaction_rolls_back_without_commit() {
        let inner = updates_broker(1).await;
        let channel = Arc::new(FlakyChannel {
            inner: inner.clone(),
            fail_from: 3,
            published: AtomicU32::new(0),
        });
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let publisher = DbUpdatePublisher::new(channel, clock, "sito.db-updates", 1);

        let err = publisher
            .publish_with_request(RequestUpdate::new(&packet()).caller("results"))
            .await
            .unwrap_err();
        assert!(matches!(err, DbQueueError::TransactionAborted { .. }));

        let mutations = decode_all(inner.take_payloads("db-updates.0"));
        let modes: Vec<TransactionMode> = mutations
            .iter()
            .filter_map(|m| match m {
                DbMutation::Transaction(t) => Some(t.transaction_mode),
                _ => None,
            })
            .collect();
        assert_eq!(modes.first(), Some(&TransactionMode::Start));
        assert_eq!(modes.last(), Some(&TransactionMode::Rollback));
        assert!(!modes.contains(&TransactionMode::Commit));
        assert_eq!(
            modes
                .iter()
                .filter(|m| **m == TransactionMode::Start)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn negative_task_start_still_hashes_in_range() {
        let broker = updates_broker(4).await;
        let clock = Arc::new(ManualClock::new(0));
        let publisher = DbUpdatePublisher::new(broker, clock, "sito.db-updates", 4);
        let shard = publisher.shard_of(-7);
        assert!(shard < 4);
    }
}
