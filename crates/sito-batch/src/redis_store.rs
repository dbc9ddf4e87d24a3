//! Redis binding for the KV store seam

use std::collections::BTreeMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::kv::KvStore;
use crate::{BatchError, Result};

pub struct RedisKvStore {
    conn: ConnectionManager,
}

impl RedisKvStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client =
            redis::Client::open(url).map_err(|e| BatchError::Store(format!("redis open: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| BatchError::Store(format!("redis connect: {e}")))?;
        Ok(Self { conn })
    }
}

fn store_err(e: redis::RedisError) -> BatchError {
    BatchError::Store(e.to_string())
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.hset_multiple::<_, _, _, ()>(key, fields)
            .await
            .map_err(store_err)
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.hget(key, field).await.map_err(store_err)
    }

    async fn hash_get_all(&self, key: &str) -> Result<Option<BTreeMap<String, String>>> {
        let mut conn = self.conn.clone();
        let map: BTreeMap<String, String> = conn.hgetall(key).await.map_err(store_err)?;
        Ok(if map.is_empty() { None } else { Some(map) })
    }

    async fn hash_incr(&self, key: &str, field: &str, by: i64) -> Result<i64> {
        let mut conn = self.conn.clone();
        conn.hincr(key, field, by).await.map_err(store_err)
    }

    async fn expire_at(&self, key: &str, epoch: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.expire_at::<_, ()>(key, epoch).await.map_err(store_err)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await.map_err(store_err)
    }
}
