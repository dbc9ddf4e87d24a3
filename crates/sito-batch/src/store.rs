//! Batch records and their lifecycle

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use sito_broker::{DelayScheduler, DelaySpec};

use crate::kv::KvStore;
use crate::{BatchError, BatchState, DeliverCondition, DlrMessage, Result};

const KEY_PREFIX: &str = "Sr_";

const F_BATCH_SIZE: &str = "batch_size";
const F_GOOD: &str = "good_count";
const F_BAD: &str = "bad_count";
const F_STATE: &str = "state";
const F_CONDITION: &str = "deliver_condition";
const F_COMMON: &str = "common_tags";
const F_REQUESTS: &str = "requests";
const F_SEND_TIME: &str = "send_time";
const F_BATCH_START: &str = "batch_start";
const F_DELAY_TIME: &str = "delay_time";
const F_SYSTEM_ID: &str = "system_id";

/// Full batch record as held in the `Sr_<batch_id>` hash.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRecord {
    pub batch_size: u64,
    pub good_count: u64,
    pub bad_count: u64,
    pub state: BatchState,
    pub deliver_condition: DeliverCondition,
    /// Serialized common block shared by every request of the batch.
    pub common_tags: Value,
    /// Serialized structured request list (segment names with placeholder
    /// calc ids; phone list optional).
    pub requests: Value,
    pub send_time: i64,
    pub batch_start: i64,
    pub delay_time: i64,
    pub system_id: String,
}

impl BatchRecord {
    pub fn new(batch_size: u64, system_id: impl Into<String>) -> Self {
        Self {
            batch_size,
            good_count: 0,
            bad_count: 0,
            state: BatchState::Processing,
            deliver_condition: DeliverCondition::Go,
            common_tags: Value::Null,
            requests: Value::Null,
            send_time: 0,
            batch_start: 0,
            delay_time: 0,
            system_id: system_id.into(),
        }
    }

    fn fields(&self) -> Vec<(String, String)> {
        vec![
            (F_BATCH_SIZE.into(), self.batch_size.to_string()),
            (F_GOOD.into(), self.good_count.to_string()),
            (F_BAD.into(), self.bad_count.to_string()),
            (F_STATE.into(), self.state.render()),
            (F_CONDITION.into(), self.deliver_condition.render().into()),
            (F_COMMON.into(), self.common_tags.to_string()),
            (F_REQUESTS.into(), self.requests.to_string()),
            (F_SEND_TIME.into(), self.send_time.to_string()),
            (F_BATCH_START.into(), self.batch_start.to_string()),
            (F_DELAY_TIME.into(), self.delay_time.to_string()),
            (F_SYSTEM_ID.into(), self.system_id.clone()),
        ]
    }

    fn from_fields(fields: &BTreeMap<String, String>) -> Result<Self> {
        fn int(fields: &BTreeMap<String, String>, name: &str) -> Result<i64> {
            let raw = fields.get(name).map(String::as_str).unwrap_or("0");
            raw.parse().map_err(|_| BatchError::BadField {
                field: name.to_string(),
                value: raw.to_string(),
            })
        }
        fn json(fields: &BTreeMap<String, String>, name: &str) -> Value {
            fields
                .get(name)
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or(Value::Null)
        }

        let state_raw = fields.get(F_STATE).map(String::as_str).unwrap_or("");
        let state = BatchState::parse(state_raw).ok_or_else(|| BatchError::BadField {
            field: F_STATE.to_string(),
            value: state_raw.to_string(),
        })?;
        let condition_raw = fields.get(F_CONDITION).map(String::as_str).unwrap_or("GO");
        let deliver_condition =
            DeliverCondition::parse(condition_raw).ok_or_else(|| BatchError::BadField {
                field: F_CONDITION.to_string(),
                value: condition_raw.to_string(),
            })?;

        Ok(Self {
            batch_size: int(fields, F_BATCH_SIZE)? as u64,
            good_count: int(fields, F_GOOD)? as u64,
            bad_count: int(fields, F_BAD)? as u64,
            state,
            deliver_condition,
            common_tags: json(fields, F_COMMON),
            requests: json(fields, F_REQUESTS),
            send_time: int(fields, F_SEND_TIME)?,
            batch_start: int(fields, F_BATCH_START)?,
            delay_time: int(fields, F_DELAY_TIME)?,
            system_id: fields.get(F_SYSTEM_ID).cloned().unwrap_or_default(),
        })
    }
}

/// TTL anchors for a batch; the effective expiry is the later of the
/// explicit expiration and deliver_time + ttl.
#[derive(Debug, Clone, Copy)]
pub struct BatchTtl {
    pub expiration: i64,
    pub deliver_time: i64,
    pub ttl: i64,
}

impl BatchTtl {
    pub fn expiry_epoch(&self) -> i64 {
        self.expiration.max(self.deliver_time + self.ttl)
    }
}

pub struct BatchStore {
    kv: Arc<dyn KvStore>,
    scheduler: Arc<DelayScheduler>,
}

impl BatchStore {
    pub fn new(kv: Arc<dyn KvStore>, scheduler: Arc<DelayScheduler>) -> Self {
        Self { kv, scheduler }
    }

    pub fn key(batch_id: &str) -> String {
        format!("{KEY_PREFIX}{batch_id}")
    }

    /// Write the initial record, set its TTL, and park the matching DLR
    /// timeout message that finalizes the batch when it fires.
    pub async fn create(
        &self,
        batch_id: &str,
        record: &BatchRecord,
        ttl: BatchTtl,
        dlr_exchange: &str,
        dlr_route: &str,
    ) -> Result<()> {
        let key = Self::key(batch_id);
        let expiry = ttl.expiry_epoch();
        self.kv.hash_set(&key, &record.fields()).await?;
        self.kv.expire_at(&key, expiry).await?;

        let dlr = DlrMessage {
            batch_id: batch_id.to_string(),
            fire_epoch: expiry,
        };
        let payload =
            serde_json::to_vec(&dlr).map_err(|e| BatchError::Store(format!("dlr encode: {e}")))?;
        self.scheduler
            .publish_delayed(DelaySpec::ExpireEpoch(expiry), dlr_exchange, dlr_route, &payload)
            .await?;

        info!(
            batch_id = %batch_id,
            batch_size = record.batch_size,
            expiry = expiry,
            "Batch created"
        );
        Ok(())
    }

    pub async fn load(&self, batch_id: &str) -> Result<BatchRecord> {
        let fields = self
            .kv
            .hash_get_all(&Self::key(batch_id))
            .await?
            .ok_or_else(|| BatchError::Missing(batch_id.to_string()))?;
        BatchRecord::from_fields(&fields)
    }

    pub async fn record_good(&self, batch_id: &str) -> Result<i64> {
        self.kv.hash_incr(&Self::key(batch_id), F_GOOD, 1).await
    }

    pub async fn record_bad(&self, batch_id: &str) -> Result<i64> {
        self.kv.hash_incr(&Self::key(batch_id), F_BAD, 1).await
    }

    pub async fn state(&self, batch_id: &str) -> Result<BatchState> {
        let raw = self
            .kv
            .hash_get(&Self::key(batch_id), F_STATE)
            .await?
            .ok_or_else(|| BatchError::Missing(batch_id.to_string()))?;
        BatchState::parse(&raw).ok_or(BatchError::BadField {
            field: F_STATE.to_string(),
            value: raw,
        })
    }

    pub async fn set_state(&self, batch_id: &str, state: BatchState) -> Result<()> {
        debug!(batch_id = %batch_id, state = %state.render(), "Batch state change");
        self.kv
            .hash_set(&Self::key(batch_id), &[(F_STATE.into(), state.render())])
            .await
    }

    pub async fn set_deliver_condition(
        &self,
        batch_id: &str,
        condition: DeliverCondition,
    ) -> Result<()> {
        self.kv
            .hash_set(
                &Self::key(batch_id),
                &[(F_CONDITION.into(), condition.render().into())],
            )
            .await
    }

    /// Gate a delayed batch re-entering the router: the external
    /// deliver-condition override must still be GO.
    pub async fn check_reentry(&self, batch_id: &str) -> Result<BatchState> {
        let raw = self
            .kv
            .hash_get(&Self::key(batch_id), F_CONDITION)
            .await?
            .ok_or_else(|| BatchError::Missing(batch_id.to_string()))?;
        let condition = DeliverCondition::parse(&raw).ok_or(BatchError::BadField {
            field: F_CONDITION.to_string(),
            value: raw,
        })?;
        if condition == DeliverCondition::Abort {
            return Err(BatchError::NotGo(batch_id.to_string()));
        }
        self.state(batch_id).await
    }

    /// Terminal transition when the DLR fires: stamp the final state,
    /// return the last record for persistence, and drop the KV entry.
    pub async fn finalize(&self, batch_id: &str, state: BatchState) -> Result<BatchRecord> {
        let mut record = self.load(batch_id).await?;
        record.state = state;
        self.kv.delete(&Self::key(batch_id)).await?;
        info!(batch_id = %batch_id, state = %state.render(), "Batch finalized");
        Ok(record)
    }
}
