//! Redis-cluster backend.
//!
//! One multiplexed connection per backend, lazily established and dropped on
//! transport failure so the next call reconnects. Error classification is
//! the breaker's contract: only connection refusal, dropped connections,
//! IO errors and timeouts count as transport failures.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::Mutex;

use crate::error::StoreError;

use super::{KvBackend, KvOp};

pub struct RedisBackend {
    client: redis::Client,
    conn: Mutex<Option<MultiplexedConnection>>,
}

impl RedisBackend {
    pub fn new(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::Other(format!("invalid redis url: {e}")))?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
        })
    }

    async fn conn(&self) -> Result<MultiplexedConnection, StoreError> {
        let mut guard = self.conn.lock().await;
        if let Some(c) = guard.as_ref() {
            return Ok(c.clone());
        }
        let c = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(classify)?;
        *guard = Some(c.clone());
        Ok(c)
    }

    async fn invalidate(&self) {
        *self.conn.lock().await = None;
    }

    async fn fail(&self, e: redis::RedisError) -> StoreError {
        let err = classify(e);
        if matches!(err, StoreError::Transport(_)) {
            self.invalidate().await;
        }
        err
    }
}

fn classify(e: redis::RedisError) -> StoreError {
    if e.is_connection_refusal()
        || e.is_connection_dropped()
        || e.is_timeout()
        || e.kind() == redis::ErrorKind::IoError
    {
        StoreError::Transport(e.to_string())
    } else {
        StoreError::Other(e.to_string())
    }
}

#[async_trait]
impl KvBackend for RedisBackend {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut c = self.conn().await?;
        match c.hget(key, field).await {
            Ok(v) => Ok(v),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        let mut c = self.conn().await?;
        match c.hset_multiple::<_, _, _, ()>(key, fields).await {
            Ok(_) => Ok(()),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn hmget(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>, StoreError> {
        let mut c = self.conn().await?;
        let mut cmd = redis::cmd("HMGET");
        cmd.arg(key);
        for f in fields {
            cmd.arg(*f);
        }
        match cmd.query_async(&mut c).await {
            Ok(v) => Ok(v),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut c = self.conn().await?;
        match c.hgetall(key).await {
            Ok(v) => Ok(v),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn hdel(&self, key: &str, fields: &[&str]) -> Result<(), StoreError> {
        let mut c = self.conn().await?;
        match c.hdel::<_, _, ()>(key, fields.to_vec()).await {
            Ok(_) => Ok(()),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let mut c = self.conn().await?;
        match c.del::<_, i64>(key).await {
            Ok(n) => Ok(n > 0),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut c = self.conn().await?;
        match c.get(key).await {
            Ok(v) => Ok(v),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut c = self.conn().await?;
        match c.set::<_, _, ()>(key, value).await {
            Ok(_) => Ok(()),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let mut c = self.conn().await?;
        match c.set_ex::<_, _, ()>(key, value, ttl_secs as usize).await {
            Ok(_) => Ok(()),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<bool, StoreError> {
        let mut c = self.conn().await?;
        let res: Result<Option<String>, redis::RedisError> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut c)
            .await;
        match res {
            Ok(v) => Ok(v.is_some()),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut c = self.conn().await?;
        match c.incr(key, 1i64).await {
            Ok(v) => Ok(v),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let mut c = self.conn().await?;
        match c.expire::<_, i64>(key, ttl_secs as usize).await {
            Ok(_) => Ok(()),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut c = self.conn().await?;
        match c.sadd::<_, _, ()>(key, member).await {
            Ok(_) => Ok(()),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut c = self.conn().await?;
        match c.srem::<_, _, ()>(key, member).await {
            Ok(_) => Ok(()),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut c = self.conn().await?;
        match c.smembers(key).await {
            Ok(v) => Ok(v),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut c = self.conn().await?;
        match c.zadd::<_, _, _, ()>(key, member, score).await {
            Ok(_) => Ok(()),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut c = self.conn().await?;
        match c.zrem::<_, _, i64>(key, member).await {
            Ok(n) => Ok(n > 0),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        let mut c = self.conn().await?;
        match c.zrangebyscore_withscores(key, min, max).await {
            Ok(v) => Ok(v),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn pipeline(&self, ops: Vec<KvOp>) -> Result<(), StoreError> {
        let mut c = self.conn().await?;
        let mut pipe = redis::pipe();
        for op in &ops {
            match op {
                KvOp::Hset { key, fields } => {
                    pipe.cmd("HSET").arg(key).arg(fields.as_slice()).ignore();
                }
                KvOp::Hdel { key, fields } => {
                    pipe.cmd("HDEL").arg(key).arg(fields.as_slice()).ignore();
                }
                KvOp::Del { key } => {
                    pipe.cmd("DEL").arg(key).ignore();
                }
                KvOp::Set { key, value } => {
                    pipe.cmd("SET").arg(key).arg(value).ignore();
                }
                KvOp::Sadd { key, member } => {
                    pipe.cmd("SADD").arg(key).arg(member).ignore();
                }
                KvOp::Srem { key, member } => {
                    pipe.cmd("SREM").arg(key).arg(member).ignore();
                }
                KvOp::Zadd { key, member, score } => {
                    pipe.cmd("ZADD").arg(key).arg(*score).arg(member).ignore();
                }
                KvOp::Zrem { key, member } => {
                    pipe.cmd("ZREM").arg(key).arg(member).ignore();
                }
                KvOp::Expire { key, ttl_secs } => {
                    pipe.cmd("EXPIRE").arg(key).arg(*ttl_secs).ignore();
                }
            }
        }
        match pipe.query_async::<_, ()>(&mut c).await {
            Ok(_) => Ok(()),
            Err(e) => Err(self.fail(e).await),
        }
    }
}
