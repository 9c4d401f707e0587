//! Trigger-index repository.
//!
//! Armed stop-loss / take-profit / pending-activation levels live in sorted
//! sets per (symbol, side): member = order_id, score = trigger price in raw
//! market space. `order_triggers:ORDID` keeps the metadata needed to invert
//! an index hit back to the owning order without loading it.
//!
//! The user-facing level is quoted in execution-price space; the stored
//! score folds the group half-spread back out so the monitor can compare
//! against raw bid/ask directly.

use std::collections::HashMap;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::error::EngineError;
use crate::orders::Side;
use crate::store::{keys, KvOp, StateStore};

/// A user-facing level plus its raw-space comparison score.
#[derive(Debug, Clone, Copy)]
pub struct TriggerLevel {
    pub user: Decimal,
    pub score: Decimal,
}

impl TriggerLevel {
    pub fn from_user(side: Side, user: Decimal, half_spread: Decimal) -> Self {
        TriggerLevel {
            user,
            score: trigger_score(side, user, half_spread),
        }
    }
}

/// BUY orders close against bid (raw = exec + half_spread); SELL orders
/// close against ask (raw = exec - half_spread).
pub fn trigger_score(side: Side, user_level: Decimal, half_spread: Decimal) -> Decimal {
    match side {
        Side::Buy => user_level + half_spread,
        Side::Sell => user_level - half_spread,
    }
}

#[derive(Debug, Clone)]
pub struct TriggerDoc {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub user_type: String,
    pub user_id: String,
    pub stop_loss_user: Option<Decimal>,
    pub stop_loss_score: Option<Decimal>,
    pub take_profit_user: Option<Decimal>,
    pub take_profit_score: Option<Decimal>,
}

impl TriggerDoc {
    fn from_hash(h: &HashMap<String, String>) -> Option<Self> {
        let dec = |k: &str| h.get(k).and_then(|v| v.parse::<Decimal>().ok());
        Some(TriggerDoc {
            order_id: h.get("order_id")?.clone(),
            symbol: h.get("symbol")?.clone(),
            side: Side::parse(h.get("side")?).ok()?,
            user_type: h.get("user_type")?.clone(),
            user_id: h.get("user_id")?.clone(),
            stop_loss_user: dec("stop_loss_user"),
            stop_loss_score: dec("stop_loss_score"),
            take_profit_user: dec("take_profit_user"),
            take_profit_score: dec("take_profit_score"),
        })
    }
}

fn score_f64(score: Decimal) -> f64 {
    score.to_f64().unwrap_or(0.0)
}

pub async fn upsert_order_triggers(
    store: &StateStore,
    order_id: &str,
    symbol: &str,
    side: Side,
    user_type: &str,
    user_id: &str,
    stop_loss: Option<TriggerLevel>,
    take_profit: Option<TriggerLevel>,
) -> Result<(), EngineError> {
    let symbol = symbol.to_uppercase();
    let mut fields = vec![
        ("order_id".to_string(), order_id.to_string()),
        ("symbol".to_string(), symbol.clone()),
        ("side".to_string(), side.as_str().to_string()),
        ("user_type".to_string(), user_type.to_string()),
        ("user_id".to_string(), user_id.to_string()),
    ];
    let mut ops = Vec::new();
    if let Some(sl) = stop_loss {
        fields.push(("stop_loss_user".to_string(), sl.user.to_string()));
        fields.push(("stop_loss_score".to_string(), sl.score.to_string()));
        ops.push(KvOp::Zadd {
            key: keys::sl_index(&symbol, side.as_str()),
            member: order_id.to_string(),
            score: score_f64(sl.score),
        });
    }
    if let Some(tp) = take_profit {
        fields.push(("take_profit_user".to_string(), tp.user.to_string()));
        fields.push(("take_profit_score".to_string(), tp.score.to_string()));
        ops.push(KvOp::Zadd {
            key: keys::tp_index(&symbol, side.as_str()),
            member: order_id.to_string(),
            score: score_f64(tp.score),
        });
    }
    ops.insert(
        0,
        KvOp::Hset {
            key: keys::order_triggers(order_id),
            fields,
        },
    );
    store.pipeline(ops).await
}

pub async fn get_order_triggers(
    store: &StateStore,
    order_id: &str,
) -> Result<Option<TriggerDoc>, EngineError> {
    let h = store.hgetall(&keys::order_triggers(order_id)).await?;
    if h.is_empty() {
        return Ok(None);
    }
    Ok(TriggerDoc::from_hash(&h))
}

/// Drops every trigger owned by the order (both halves plus metadata).
/// Returns the doc that was removed, if any.
pub async fn remove_order_triggers(
    store: &StateStore,
    order_id: &str,
) -> Result<Option<TriggerDoc>, EngineError> {
    let doc = match get_order_triggers(store, order_id).await? {
        Some(d) => d,
        None => return Ok(None),
    };
    store
        .pipeline(vec![
            KvOp::Zrem {
                key: keys::sl_index(&doc.symbol, doc.side.as_str()),
                member: order_id.to_string(),
            },
            KvOp::Zrem {
                key: keys::tp_index(&doc.symbol, doc.side.as_str()),
                member: order_id.to_string(),
            },
            KvOp::Zrem {
                key: keys::pending_index(&doc.symbol, doc.side.as_str()),
                member: order_id.to_string(),
            },
            KvOp::Del {
                key: keys::order_triggers(order_id),
            },
        ])
        .await?;
    Ok(Some(doc))
}

/// Removes only the stop-loss half, leaving any take-profit armed.
pub async fn remove_stoploss_trigger(
    store: &StateStore,
    order_id: &str,
) -> Result<(), EngineError> {
    let doc = match get_order_triggers(store, order_id).await? {
        Some(d) => d,
        None => return Ok(()),
    };
    store
        .pipeline(vec![
            KvOp::Zrem {
                key: keys::sl_index(&doc.symbol, doc.side.as_str()),
                member: order_id.to_string(),
            },
            KvOp::Hdel {
                key: keys::order_triggers(order_id),
                fields: vec!["stop_loss_user".into(), "stop_loss_score".into()],
            },
        ])
        .await
}

/// Removes only the take-profit half, leaving any stop-loss armed.
pub async fn remove_takeprofit_trigger(
    store: &StateStore,
    order_id: &str,
) -> Result<(), EngineError> {
    let doc = match get_order_triggers(store, order_id).await? {
        Some(d) => d,
        None => return Ok(()),
    };
    store
        .pipeline(vec![
            KvOp::Zrem {
                key: keys::tp_index(&doc.symbol, doc.side.as_str()),
                member: order_id.to_string(),
            },
            KvOp::Hdel {
                key: keys::order_triggers(order_id),
                fields: vec!["take_profit_user".into(), "take_profit_score".into()],
            },
        ])
        .await
}

/// Arms a pending order's activation level.
pub async fn register_pending_activation(
    store: &StateStore,
    order_id: &str,
    symbol: &str,
    side: Side,
    user_type: &str,
    user_id: &str,
    level: Decimal,
) -> Result<(), EngineError> {
    let symbol = symbol.to_uppercase();
    store
        .pipeline(vec![
            KvOp::Hset {
                key: keys::order_triggers(order_id),
                fields: vec![
                    ("order_id".to_string(), order_id.to_string()),
                    ("symbol".to_string(), symbol.clone()),
                    ("side".to_string(), side.as_str().to_string()),
                    ("user_type".to_string(), user_type.to_string()),
                    ("user_id".to_string(), user_id.to_string()),
                    ("pending_level".to_string(), level.to_string()),
                ],
            },
            KvOp::Zadd {
                key: keys::pending_index(&symbol, side.as_str()),
                member: order_id.to_string(),
                score: score_f64(level),
            },
        ])
        .await
}
