//! State-store capability (hash-tagged key-value cluster accessor).
//!
//! `StateStore` is the only way the engine touches the cluster: a thin
//! hash/set/zset/counter surface behind a `KvBackend` trait, with a circuit
//! breaker wrapped around every call. The production backend speaks Redis;
//! the in-memory backend backs the test suite and local simulation, the same
//! split the exchange client uses between live and sim.
//!
//! Cross-tag atomicity is NOT offered. All keys touched inside one logical
//! step must share a hash-tag; the layer above covers partial failure with
//! the idempotency keys.

pub mod breaker;
pub mod keys;
pub mod memory;
pub mod redis_backend;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{EngineError, StoreError};
use breaker::{BreakerSnapshot, CircuitBreaker};

/// One entry in a pipelined multi-op batch.
#[derive(Debug, Clone)]
pub enum KvOp {
    Hset {
        key: String,
        fields: Vec<(String, String)>,
    },
    Hdel {
        key: String,
        fields: Vec<String>,
    },
    Del {
        key: String,
    },
    Set {
        key: String,
        value: String,
    },
    Sadd {
        key: String,
        member: String,
    },
    Srem {
        key: String,
        member: String,
    },
    Zadd {
        key: String,
        member: String,
        score: f64,
    },
    Zrem {
        key: String,
        member: String,
    },
    Expire {
        key: String,
        ttl_secs: u64,
    },
}

#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;
    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError>;
    async fn hmget(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>, StoreError>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;
    async fn hdel(&self, key: &str, fields: &[&str]) -> Result<(), StoreError>;
    async fn del(&self, key: &str) -> Result<bool, StoreError>;
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError>;
    /// `SET NX EX`, the only way idempotency reservations are created.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64)
        -> Result<bool, StoreError>;
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError>;
    async fn sadd(&self, key: &str, member: &str) -> Result<(), StoreError>;
    async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;
    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError>;
    /// Members with `min <= score <= max`, ascending by score.
    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>, StoreError>;
    async fn pipeline(&self, ops: Vec<KvOp>) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct StateStore {
    backend: Arc<dyn KvBackend>,
    breaker: Arc<CircuitBreaker>,
}

impl StateStore {
    pub fn new(backend: Arc<dyn KvBackend>, failure_threshold: u32, recovery: Duration) -> Self {
        Self {
            backend,
            breaker: Arc::new(CircuitBreaker::new(failure_threshold, recovery)),
        }
    }

    pub fn breaker_snapshot(&self) -> BreakerSnapshot {
        self.breaker.snapshot()
    }

    /// Runs one backend call under the breaker. The future is constructed
    /// lazily and never polled when the breaker rejects, so an open circuit
    /// does not touch the transport.
    async fn guarded<T, F>(&self, fut: F) -> Result<T, EngineError>
    where
        F: Future<Output = Result<T, StoreError>> + Send,
    {
        if !self.breaker.try_acquire() {
            return Err(EngineError::StateStoreUnavailable);
        }
        match fut.await {
            Ok(v) => {
                self.breaker.on_success();
                Ok(v)
            }
            Err(StoreError::Transport(m)) => {
                self.breaker.on_transport_failure();
                Err(EngineError::Store(m))
            }
            Err(e) => {
                self.breaker.on_success();
                Err(e.into())
            }
        }
    }

    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, EngineError> {
        self.guarded(self.backend.hget(key, field)).await
    }

    pub async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), EngineError> {
        self.guarded(self.backend.hset(key, fields)).await
    }

    pub async fn hmget(
        &self,
        key: &str,
        fields: &[&str],
    ) -> Result<Vec<Option<String>>, EngineError> {
        self.guarded(self.backend.hmget(key, fields)).await
    }

    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, EngineError> {
        self.guarded(self.backend.hgetall(key)).await
    }

    pub async fn hdel(&self, key: &str, fields: &[&str]) -> Result<(), EngineError> {
        self.guarded(self.backend.hdel(key, fields)).await
    }

    pub async fn del(&self, key: &str) -> Result<bool, EngineError> {
        self.guarded(self.backend.del(key)).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, EngineError> {
        self.guarded(self.backend.get(key)).await
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), EngineError> {
        self.guarded(self.backend.set(key, value)).await
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), EngineError> {
        self.guarded(self.backend.set_ex(key, value, ttl_secs)).await
    }

    pub async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<bool, EngineError> {
        self.guarded(self.backend.set_nx_ex(key, value, ttl_secs))
            .await
    }

    pub async fn incr(&self, key: &str) -> Result<i64, EngineError> {
        self.guarded(self.backend.incr(key)).await
    }

    pub async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), EngineError> {
        self.guarded(self.backend.expire(key, ttl_secs)).await
    }

    pub async fn sadd(&self, key: &str, member: &str) -> Result<(), EngineError> {
        self.guarded(self.backend.sadd(key, member)).await
    }

    pub async fn srem(&self, key: &str, member: &str) -> Result<(), EngineError> {
        self.guarded(self.backend.srem(key, member)).await
    }

    pub async fn smembers(&self, key: &str) -> Result<Vec<String>, EngineError> {
        self.guarded(self.backend.smembers(key)).await
    }

    pub async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), EngineError> {
        self.guarded(self.backend.zadd(key, member, score)).await
    }

    pub async fn zrem(&self, key: &str, member: &str) -> Result<bool, EngineError> {
        self.guarded(self.backend.zrem(key, member)).await
    }

    pub async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>, EngineError> {
        self.guarded(self.backend.zrangebyscore(key, min, max)).await
    }

    pub async fn pipeline(&self, ops: Vec<KvOp>) -> Result<(), EngineError> {
        self.guarded(self.backend.pipeline(ops)).await
    }
}
