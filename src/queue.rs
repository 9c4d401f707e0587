//! Durable queue bus.
//!
//! Workers coordinate through named durable queues. The production bus rides
//! Redis lists (`LPUSH` to publish, `BRPOP` to consume) with a retry counter
//! carried in the message envelope; exhausted retries are re-published to the
//! dead-letter queue by the worker loop. The in-memory bus backs the test
//! suite.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;

use crate::error::EngineError;

pub const CONFIRMATION_QUEUE: &str = "confirmation_queue";
pub const OPEN_QUEUE: &str = "open_queue";
pub const CLOSE_QUEUE: &str = "close_queue";
pub const CANCEL_QUEUE: &str = "cancel_queue";
pub const STOPLOSS_CANCEL_QUEUE: &str = "stoploss_cancel_queue";
pub const TAKEPROFIT_CANCEL_QUEUE: &str = "takeprofit_cancel_queue";
pub const REJECT_QUEUE: &str = "reject_queue";
pub const ORDER_DB_UPDATE_QUEUE: &str = "order_db_update_queue";
pub const PROVIDER_SEND_QUEUE: &str = "provider_send_queue";
pub const DLQ: &str = "dlq";

/// Wire envelope: the body plus how many delivery attempts already failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    #[serde(default)]
    pub retries: u32,
    pub body: Value,
}

#[async_trait]
pub trait QueueBus: Send + Sync {
    async fn publish_message(&self, queue: &str, msg: &QueueMessage) -> Result<(), EngineError>;

    /// Blocks until the next message on `queue` arrives.
    async fn consume(&self, queue: &str) -> Result<QueueMessage, EngineError>;

    /// Non-blocking pop, `None` when the queue is empty.
    async fn try_consume(&self, queue: &str) -> Result<Option<QueueMessage>, EngineError>;
}

/// Publish a fresh (zero-retry) message.
pub async fn publish(bus: &dyn QueueBus, queue: &str, body: Value) -> Result<(), EngineError> {
    bus.publish_message(queue, &QueueMessage { retries: 0, body })
        .await
}

/// Canonical post-image event for the external persistence service.
pub async fn publish_db_update(bus: &dyn QueueBus, body: Value) -> Result<(), EngineError> {
    publish(bus, ORDER_DB_UPDATE_QUEUE, body).await
}

/// Dead-letter a message, attaching the routing reason.
pub async fn publish_dlq(
    bus: &dyn QueueBus,
    source_queue: &str,
    reason: &str,
    body: Value,
) -> Result<(), EngineError> {
    publish(
        bus,
        DLQ,
        serde_json::json!({
            "source_queue": source_queue,
            "reason": reason,
            "body": body,
        }),
    )
    .await
}

// ─────────────────────────────────────────────────────────
// Redis-backed bus
// ─────────────────────────────────────────────────────────

pub struct RedisQueueBus {
    client: redis::Client,
}

impl RedisQueueBus {
    pub fn new(redis_url: &str) -> Result<Self, EngineError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| EngineError::Queue(format!("invalid redis url: {e}")))?;
        Ok(Self { client })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, EngineError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| EngineError::Queue(e.to_string()))
    }
}

#[async_trait]
impl QueueBus for RedisQueueBus {
    async fn publish_message(&self, queue: &str, msg: &QueueMessage) -> Result<(), EngineError> {
        let mut c = self.conn().await?;
        let payload =
            serde_json::to_string(msg).map_err(|e| EngineError::Queue(e.to_string()))?;
        redis::cmd("LPUSH")
            .arg(queue)
            .arg(payload)
            .query_async::<_, ()>(&mut c)
            .await
            .map_err(|e| EngineError::Queue(e.to_string()))
    }

    async fn consume(&self, queue: &str) -> Result<QueueMessage, EngineError> {
        loop {
            let mut c = self.conn().await?;
            // 5s block so a dropped connection is noticed.
            let res: Option<(String, String)> = redis::cmd("BRPOP")
                .arg(queue)
                .arg(5u64)
                .query_async(&mut c)
                .await
                .map_err(|e| EngineError::Queue(e.to_string()))?;
            if let Some((_, payload)) = res {
                return serde_json::from_str(&payload)
                    .map_err(|e| EngineError::Malformed(e.to_string()));
            }
        }
    }

    async fn try_consume(&self, queue: &str) -> Result<Option<QueueMessage>, EngineError> {
        let mut c = self.conn().await?;
        let res: Option<String> = redis::cmd("RPOP")
            .arg(queue)
            .query_async(&mut c)
            .await
            .map_err(|e| EngineError::Queue(e.to_string()))?;
        match res {
            Some(payload) => serde_json::from_str(&payload)
                .map(Some)
                .map_err(|e| EngineError::Malformed(e.to_string())),
            None => Ok(None),
        }
    }
}

// ─────────────────────────────────────────────────────────
// In-memory bus (tests, local sim)
// ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryQueueBus {
    queues: Mutex<HashMap<String, VecDeque<QueueMessage>>>,
    notify: Notify,
}

impl MemoryQueueBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .unwrap()
            .get(queue)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }
}

#[async_trait]
impl QueueBus for MemoryQueueBus {
    async fn publish_message(&self, queue: &str, msg: &QueueMessage) -> Result<(), EngineError> {
        self.queues
            .lock()
            .unwrap()
            .entry(queue.to_string())
            .or_default()
            .push_back(msg.clone());
        self.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<QueueMessage, EngineError> {
        loop {
            let notified = self.notify.notified();
            if let Some(msg) = self
                .queues
                .lock()
                .unwrap()
                .get_mut(queue)
                .and_then(|q| q.pop_front())
            {
                return Ok(msg);
            }
            notified.await;
        }
    }

    async fn try_consume(&self, queue: &str) -> Result<Option<QueueMessage>, EngineError> {
        Ok(self
            .queues
            .lock()
            .unwrap()
            .get_mut(queue)
            .and_then(|q| q.pop_front()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_consume_roundtrips() {
        let bus = MemoryQueueBus::new();
        publish(&bus, OPEN_QUEUE, serde_json::json!({"order_id": "1"}))
            .await
            .unwrap();
        let msg = bus.try_consume(OPEN_QUEUE).await.unwrap().unwrap();
        assert_eq!(msg.retries, 0);
        assert_eq!(msg.body["order_id"], "1");
        assert!(bus.try_consume(OPEN_QUEUE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dlq_carries_routing_reason() {
        let bus = MemoryQueueBus::new();
        publish_dlq(
            &bus,
            CONFIRMATION_QUEUE,
            "unknown_routing_state",
            serde_json::json!({"order_id": "2"}),
        )
        .await
        .unwrap();
        let msg = bus.try_consume(DLQ).await.unwrap().unwrap();
        assert_eq!(msg.body["reason"], "unknown_routing_state");
        assert_eq!(msg.body["source_queue"], CONFIRMATION_QUEUE);
    }
}
