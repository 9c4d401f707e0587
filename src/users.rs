//! User account configuration.
//!
//! Owned by the relational DB and mutated only by the persistence service;
//! this side only reads the cached hash.

use std::collections::HashMap;

use rust_decimal::Decimal;

use crate::error::EngineError;
use crate::store::{keys, StateStore};

/// Where a user's orders execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderRouting {
    Local,
    Provider(String),
}

impl OrderRouting {
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("local") {
            OrderRouting::Local
        } else {
            OrderRouting::Provider(s.to_string())
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, OrderRouting::Local)
    }
}

#[derive(Debug, Clone)]
pub struct UserConfig {
    pub group: String,
    pub leverage: Decimal,
    pub wallet_balance: Decimal,
    pub enabled: bool,
    pub routing: OrderRouting,
}

impl UserConfig {
    pub fn from_hash(h: &HashMap<String, String>) -> Option<Self> {
        Some(UserConfig {
            group: h.get("group").cloned().unwrap_or_default(),
            leverage: h.get("leverage").and_then(|v| v.parse().ok())?,
            wallet_balance: h.get("wallet_balance").and_then(|v| v.parse().ok())?,
            enabled: h
                .get("status")
                .map(|s| s.eq_ignore_ascii_case("enabled"))
                .unwrap_or(false),
            routing: OrderRouting::parse(h.get("sending_orders").map(String::as_str).unwrap_or("")),
        })
    }
}

pub async fn load_user_config(
    store: &StateStore,
    user_type: &str,
    user_id: &str,
) -> Result<Option<UserConfig>, EngineError> {
    let h = store
        .hgetall(&keys::user_config(user_type, user_id))
        .await?;
    if h.is_empty() {
        return Ok(None);
    }
    Ok(UserConfig::from_hash(&h))
}
