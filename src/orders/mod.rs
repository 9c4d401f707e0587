//! Order domain model and store access.
//!
//! The `order_data` hash is the canonical record; `user_holdings` mirrors
//! the open subset for margin recomputation and `order_owner` inverts an
//! order_id back to its owning partition. All wire strings are fixed here.

pub mod close_context;
pub mod executor;
pub mod ids;
pub mod sl_tp;

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::store::{keys, KvOp, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Result<Self, EngineError> {
        match s.trim().to_uppercase().as_str() {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            _ => Err(EngineError::InvalidOrderType),
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    #[serde(rename = "QUEUED")]
    Queued,
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "CLOSING")]
    Closing,
    #[serde(rename = "SL_PENDING")]
    SlPending,
    #[serde(rename = "TP_PENDING")]
    TpPending,
    #[serde(rename = "CLOSED")]
    Closed,
    #[serde(rename = "CANCELLED")]
    Cancelled,
    #[serde(rename = "REJECTED")]
    Rejected,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Queued => "QUEUED",
            OrderStatus::Open => "OPEN",
            OrderStatus::Pending => "PENDING",
            OrderStatus::Closing => "CLOSING",
            OrderStatus::SlPending => "SL_PENDING",
            OrderStatus::TpPending => "TP_PENDING",
            OrderStatus::Closed => "CLOSED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Rejected => "REJECTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "QUEUED" => Some(OrderStatus::Queued),
            "OPEN" => Some(OrderStatus::Open),
            "PENDING" => Some(OrderStatus::Pending),
            "CLOSING" => Some(OrderStatus::Closing),
            "SL_PENDING" => Some(OrderStatus::SlPending),
            "TP_PENDING" => Some(OrderStatus::TpPending),
            "CLOSED" => Some(OrderStatus::Closed),
            "CANCELLED" => Some(OrderStatus::Cancelled),
            "REJECTED" => Some(OrderStatus::Rejected),
            _ => None,
        }
    }

    /// Terminal states are immutable except for a single `finalized_ts`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Closed | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }

    /// States whose orders count toward holdings and symbol membership.
    pub fn is_holding(&self) -> bool {
        matches!(self, OrderStatus::Open | OrderStatus::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    #[serde(rename = "USER_CLOSED")]
    UserClosed,
    #[serde(rename = "ADMIN_CLOSED")]
    AdminClosed,
    #[serde(rename = "AUTOCUTOFF")]
    Autocutoff,
    #[serde(rename = "STOPLOSS_HIT")]
    StoplossHit,
    #[serde(rename = "TAKEPROFIT_HIT")]
    TakeprofitHit,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::UserClosed => "USER_CLOSED",
            CloseReason::AdminClosed => "ADMIN_CLOSED",
            CloseReason::Autocutoff => "AUTOCUTOFF",
            CloseReason::StoplossHit => "STOPLOSS_HIT",
            CloseReason::TakeprofitHit => "TAKEPROFIT_HIT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "USER_CLOSED" => Some(CloseReason::UserClosed),
            "ADMIN_CLOSED" => Some(CloseReason::AdminClosed),
            "AUTOCUTOFF" => Some(CloseReason::Autocutoff),
            "STOPLOSS_HIT" => Some(CloseReason::StoplossHit),
            "TAKEPROFIT_HIT" => Some(CloseReason::TakeprofitHit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub order_id: String,
    pub user_type: String,
    pub user_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub margin_usd: Decimal,
    pub commission_entry: Decimal,
    pub commission_exit: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub status: OrderStatus,
    pub close_price: Option<Decimal>,
    pub close_reason: Option<CloseReason>,
    pub created_ts_ms: i64,
    pub closed_ts_ms: Option<i64>,
    pub finalized_ts_ms: Option<i64>,
}

fn push(fields: &mut Vec<(String, String)>, k: &str, v: String) {
    fields.push((k.to_string(), v));
}

impl Order {
    pub fn partition(&self) -> String {
        format!("{}:{}", self.user_type, self.user_id)
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut f = Vec::new();
        push(&mut f, "order_id", self.order_id.clone());
        push(&mut f, "user_type", self.user_type.clone());
        push(&mut f, "user_id", self.user_id.clone());
        push(&mut f, "symbol", self.symbol.clone());
        push(&mut f, "side", self.side.as_str().to_string());
        push(&mut f, "quantity", self.quantity.to_string());
        push(&mut f, "entry_price", self.entry_price.to_string());
        push(&mut f, "margin_usd", self.margin_usd.to_string());
        push(&mut f, "commission_entry", self.commission_entry.to_string());
        push(&mut f, "commission_exit", self.commission_exit.to_string());
        if let Some(sl) = self.stop_loss {
            push(&mut f, "stop_loss", sl.to_string());
        }
        if let Some(tp) = self.take_profit {
            push(&mut f, "take_profit", tp.to_string());
        }
        push(&mut f, "status", self.status.as_str().to_string());
        if let Some(cp) = self.close_price {
            push(&mut f, "close_price", cp.to_string());
        }
        if let Some(cr) = self.close_reason {
            push(&mut f, "close_reason", cr.as_str().to_string());
        }
        push(&mut f, "created_ts", self.created_ts_ms.to_string());
        if let Some(ts) = self.closed_ts_ms {
            push(&mut f, "closed_ts", ts.to_string());
        }
        if let Some(ts) = self.finalized_ts_ms {
            push(&mut f, "finalized_ts", ts.to_string());
        }
        f
    }

    pub fn from_hash(h: &HashMap<String, String>) -> Result<Self, EngineError> {
        let req = |k: &str| -> Result<String, EngineError> {
            h.get(k)
                .cloned()
                .ok_or_else(|| EngineError::Malformed(format!("order hash missing {k}")))
        };
        let dec = |k: &str| -> Result<Decimal, EngineError> {
            req(k)?
                .parse::<Decimal>()
                .map_err(|e| EngineError::Malformed(format!("order field {k}: {e}")))
        };
        let opt_dec = |k: &str| -> Option<Decimal> { h.get(k).and_then(|v| v.parse().ok()) };
        Ok(Order {
            order_id: req("order_id")?,
            user_type: req("user_type")?,
            user_id: req("user_id")?,
            symbol: req("symbol")?,
            side: Side::parse(&req("side")?)?,
            quantity: dec("quantity")?,
            entry_price: dec("entry_price")?,
            margin_usd: dec("margin_usd")?,
            commission_entry: opt_dec("commission_entry").unwrap_or_default(),
            commission_exit: opt_dec("commission_exit").unwrap_or_default(),
            stop_loss: opt_dec("stop_loss"),
            take_profit: opt_dec("take_profit"),
            status: OrderStatus::parse(&req("status")?)
                .ok_or_else(|| EngineError::Malformed("bad status".into()))?,
            close_price: opt_dec("close_price"),
            close_reason: h.get("close_reason").and_then(|s| CloseReason::parse(s)),
            created_ts_ms: req("created_ts")?
                .parse()
                .map_err(|_| EngineError::Malformed("bad created_ts".into()))?,
            closed_ts_ms: h.get("closed_ts").and_then(|v| v.parse().ok()),
            finalized_ts_ms: h.get("finalized_ts").and_then(|v| v.parse().ok()),
        })
    }

    /// The open-subset mirror written under `user_holdings`.
    pub fn holdings_fields(&self) -> Vec<(String, String)> {
        vec![
            ("order_id".to_string(), self.order_id.clone()),
            ("symbol".to_string(), self.symbol.to_uppercase()),
            ("side".to_string(), self.side.as_str().to_string()),
            ("quantity".to_string(), self.quantity.to_string()),
            ("entry_price".to_string(), self.entry_price.to_string()),
            ("margin_usd".to_string(), self.margin_usd.to_string()),
            ("status".to_string(), self.status.as_str().to_string()),
        ]
    }

    /// Canonical post-image for the persistence queue.
    pub fn post_image(&self, event: &str) -> serde_json::Value {
        let mut img = serde_json::json!({
            "type": event,
            "order_id": self.order_id,
            "user_type": self.user_type,
            "user_id": self.user_id,
            "symbol": self.symbol,
            "side": self.side.as_str(),
            "quantity": self.quantity.to_string(),
            "entry_price": self.entry_price.to_string(),
            "margin_usd": self.margin_usd.to_string(),
            "commission_entry": self.commission_entry.to_string(),
            "commission_exit": self.commission_exit.to_string(),
            "status": self.status.as_str(),
            "created_ts": self.created_ts_ms,
        });
        let obj = img.as_object_mut().unwrap();
        if let Some(sl) = self.stop_loss {
            obj.insert("stop_loss".into(), sl.to_string().into());
        }
        if let Some(tp) = self.take_profit {
            obj.insert("take_profit".into(), tp.to_string().into());
        }
        if let Some(cp) = self.close_price {
            obj.insert("close_price".into(), cp.to_string().into());
        }
        if let Some(cr) = self.close_reason {
            obj.insert("close_reason".into(), cr.as_str().into());
        }
        if let Some(ts) = self.closed_ts_ms {
            obj.insert("closed_ts".into(), ts.into());
        }
        img
    }
}

// ─────────────────────────────────────────────────────────
// Store access
// ─────────────────────────────────────────────────────────

pub async fn save_order(store: &StateStore, order: &Order) -> Result<(), EngineError> {
    let key = keys::order_data(&order.user_type, &order.user_id, &order.order_id);
    store.hset(&key, &order.to_fields()).await
}

pub async fn load_order(
    store: &StateStore,
    user_type: &str,
    user_id: &str,
    order_id: &str,
) -> Result<Option<Order>, EngineError> {
    let h = store
        .hgetall(&keys::order_data(user_type, user_id, order_id))
        .await?;
    if h.is_empty() {
        return Ok(None);
    }
    Order::from_hash(&h).map(Some)
}

/// Resolve an order from its id alone via the `order_owner` index.
pub async fn load_order_by_id(
    store: &StateStore,
    order_id: &str,
) -> Result<Option<Order>, EngineError> {
    let owner = match store.get(&keys::order_owner(order_id)).await? {
        Some(o) => o,
        None => return Ok(None),
    };
    let (ut, uid) = owner
        .split_once(':')
        .ok_or_else(|| EngineError::Malformed(format!("bad order_owner value: {owner}")))?;
    load_order(store, ut, uid, order_id).await
}

/// Adds the holdings mirror and symbol membership for a newly open order in
/// one pipelined write.
pub fn holdings_add_ops(order: &Order) -> Vec<KvOp> {
    vec![
        KvOp::Hset {
            key: keys::user_holdings(&order.user_type, &order.user_id, &order.order_id),
            fields: order.holdings_fields(),
        },
        KvOp::Sadd {
            key: holdings_index_key(&order.user_type, &order.user_id),
            member: order.order_id.clone(),
        },
        KvOp::Sadd {
            key: keys::symbol_holders(&order.symbol, &order.user_type),
            member: order.partition(),
        },
    ]
}

/// Removes the holdings mirror; symbol membership is dropped only when this
/// was the user's last non-terminal order on the symbol (checked by caller).
pub fn holdings_remove_ops(order: &Order, drop_symbol_membership: bool) -> Vec<KvOp> {
    let mut ops = vec![
        KvOp::Del {
            key: keys::user_holdings(&order.user_type, &order.user_id, &order.order_id),
        },
        KvOp::Srem {
            key: holdings_index_key(&order.user_type, &order.user_id),
            member: order.order_id.clone(),
        },
    ];
    if drop_symbol_membership {
        ops.push(KvOp::Srem {
            key: keys::symbol_holders(&order.symbol, &order.user_type),
            member: order.partition(),
        });
    }
    ops
}

/// True when the user still has another non-terminal order on `symbol`
/// besides `except_order_id`.
pub async fn has_other_holdings_on_symbol(
    store: &StateStore,
    user_type: &str,
    user_id: &str,
    symbol: &str,
    except_order_id: &str,
) -> Result<bool, EngineError> {
    let orders = load_user_holdings(store, user_type, user_id).await?;
    Ok(orders.iter().any(|o| {
        o.order_id != except_order_id && o.symbol.eq_ignore_ascii_case(symbol)
    }))
}

/// All holdings-mirror rows for one user. The mirror key set is discovered
/// through the per-user open-order index kept alongside the mirror.
pub async fn load_user_holdings(
    store: &StateStore,
    user_type: &str,
    user_id: &str,
) -> Result<Vec<HoldingRow>, EngineError> {
    let index_key = holdings_index_key(user_type, user_id);
    let ids = store.smembers(&index_key).await?;
    let mut rows = Vec::with_capacity(ids.len());
    for order_id in ids {
        let h = store
            .hgetall(&keys::user_holdings(user_type, user_id, &order_id))
            .await?;
        if h.is_empty() {
            continue;
        }
        if let Some(row) = HoldingRow::from_hash(&h) {
            rows.push(row);
        }
    }
    Ok(rows)
}

/// Per-user set of open order ids, kept next to the holdings mirror so the
/// margin engine never pages closed orders.
pub fn holdings_index_key(user_type: &str, user_id: &str) -> String {
    format!("user_holdings_index:{{{user_type}:{user_id}}}")
}

#[derive(Debug, Clone)]
pub struct HoldingRow {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub margin_usd: Decimal,
}

impl HoldingRow {
    fn from_hash(h: &HashMap<String, String>) -> Option<Self> {
        Some(HoldingRow {
            order_id: h.get("order_id")?.clone(),
            symbol: h.get("symbol")?.clone(),
            side: Side::parse(h.get("side")?).ok()?,
            quantity: h.get("quantity")?.parse().ok()?,
            entry_price: h.get("entry_price")?.parse().ok()?,
            margin_usd: h.get("margin_usd")?.parse().ok()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_order() -> Order {
        Order {
            order_id: "1700000000000101".into(),
            user_type: "live".into(),
            user_id: "1001".into(),
            symbol: "EURUSD".into(),
            side: Side::Buy,
            quantity: dec!(1),
            entry_price: dec!(1.20001),
            margin_usd: dec!(12.0001),
            commission_entry: dec!(0),
            commission_exit: dec!(0),
            stop_loss: Some(dec!(1.199)),
            take_profit: None,
            status: OrderStatus::Open,
            close_price: None,
            close_reason: None,
            created_ts_ms: 1_700_000_000_000,
            closed_ts_ms: None,
            finalized_ts_ms: None,
        }
    }

    #[test]
    fn hash_roundtrip_preserves_order() {
        let order = sample_order();
        let h: HashMap<String, String> = order.to_fields().into_iter().collect();
        let back = Order::from_hash(&h).unwrap();
        assert_eq!(back, order);
    }

    #[test]
    fn terminal_statuses() {
        assert!(OrderStatus::Closed.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(!OrderStatus::Open.is_terminal());
        assert!(!OrderStatus::Closing.is_terminal());
    }

    #[test]
    fn post_image_carries_close_fields_only_when_set() {
        let mut order = sample_order();
        let img = order.post_image("order_opened");
        assert!(img.get("close_price").is_none());
        order.close_price = Some(dec!(1.19899));
        order.close_reason = Some(CloseReason::StoplossHit);
        let img = order.post_image("order_closed");
        assert_eq!(img["close_reason"], "STOPLOSS_HIT");
    }
}
