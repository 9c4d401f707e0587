//! Close-context attribution.
//!
//! Whoever initiates a close (user, admin, autocutoff, trigger engine)
//! writes a short-lived context record; the close-confirm worker consumes it
//! to attribute `close_reason`, then deletes it. TTL covers the provider
//! round-trip budget.

use chrono::Utc;
use tracing::{debug, info};

use crate::error::EngineError;
use crate::orders::CloseReason;
use crate::store::{keys, StateStore};

pub const CLOSE_CONTEXT_TTL_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct CloseContext {
    pub context: CloseReason,
    pub initiator: String,
    pub ts_ms: i64,
}

pub async fn set_close_context(
    store: &StateStore,
    order_id: &str,
    context: CloseReason,
    initiator: &str,
) -> Result<(), EngineError> {
    let key = keys::close_context(order_id);
    store
        .hset(
            &key,
            &[
                ("context".to_string(), context.as_str().to_string()),
                ("initiator".to_string(), initiator.to_string()),
                ("ts".to_string(), Utc::now().timestamp_millis().to_string()),
            ],
        )
        .await?;
    store.expire(&key, CLOSE_CONTEXT_TTL_SECS).await?;
    info!(order_id, context = context.as_str(), initiator, "close context set");
    Ok(())
}

pub async fn get_close_context(
    store: &StateStore,
    order_id: &str,
) -> Result<Option<CloseContext>, EngineError> {
    let h = store.hgetall(&keys::close_context(order_id)).await?;
    if h.is_empty() {
        debug!(order_id, "no close context");
        return Ok(None);
    }
    let context = h
        .get("context")
        .and_then(|s| CloseReason::parse(s))
        .ok_or_else(|| EngineError::Malformed("close context without reason".into()))?;
    Ok(Some(CloseContext {
        context,
        initiator: h.get("initiator").cloned().unwrap_or_else(|| "system".into()),
        ts_ms: h.get("ts").and_then(|v| v.parse().ok()).unwrap_or(0),
    }))
}

pub async fn clear_close_context(store: &StateStore, order_id: &str) -> Result<(), EngineError> {
    store.del(&keys::close_context(order_id)).await?;
    Ok(())
}
