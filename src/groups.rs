//! Group (instrument) configuration.
//!
//! Redis-first read-through with a DB fallback over the internal provider
//! HTTP surface; successful fallback responses are cached back so the next
//! read stays in the cluster. Absent required fields are a hard
//! `missing_group_config`, never a silent default.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::warn;

use crate::error::EngineError;
use crate::store::{keys, StateStore};

pub const STANDARD_GROUP: &str = "Standard";

/// Instrument class. Crypto margins carry an extra factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentType {
    Forex,
    Commodity,
    Index,
    Crypto,
}

impl InstrumentType {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(InstrumentType::Forex),
            2 => Some(InstrumentType::Commodity),
            3 => Some(InstrumentType::Index),
            4 => Some(InstrumentType::Crypto),
            _ => None,
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            InstrumentType::Forex => 1,
            InstrumentType::Commodity => 2,
            InstrumentType::Index => 3,
            InstrumentType::Crypto => 4,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GroupConfig {
    pub instrument_type: Option<InstrumentType>,
    pub contract_size: Option<Decimal>,
    pub profit_currency: Option<String>,
    pub spread: Option<Decimal>,
    pub spread_pip: Option<Decimal>,
    pub commission_rate: Option<Decimal>,
    pub commission_type: Option<i64>,
    pub commission_value_type: Option<i64>,
    pub crypto_margin_factor: Option<Decimal>,
}

impl GroupConfig {
    pub fn from_hash(h: &HashMap<String, String>) -> Self {
        let dec = |k: &str| h.get(k).and_then(|v| v.parse::<Decimal>().ok());
        let int = |k: &str| h.get(k).and_then(|v| v.parse::<i64>().ok());
        GroupConfig {
            instrument_type: int("type").and_then(InstrumentType::from_code),
            contract_size: dec("contract_size"),
            profit_currency: h.get("profit").map(|s| s.to_uppercase()),
            spread: dec("spread"),
            spread_pip: dec("spread_pip"),
            commission_rate: dec("commission_rate"),
            commission_type: int("commission_type"),
            commission_value_type: int("commission_value_type"),
            crypto_margin_factor: dec("crypto_margin_factor"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.instrument_type.is_none()
            && self.contract_size.is_none()
            && self.profit_currency.is_none()
            && self.spread.is_none()
            && self.spread_pip.is_none()
    }

    /// The margin engine cannot run without these.
    pub fn has_margin_fields(&self) -> bool {
        self.instrument_type.is_some()
            && self.contract_size.is_some()
            && self.profit_currency.is_some()
    }

    pub fn half_spread(&self) -> Option<Decimal> {
        match (self.spread, self.spread_pip) {
            (Some(s), Some(p)) => Some(s * p / Decimal::TWO),
            _ => None,
        }
    }

    fn to_fields(&self) -> Vec<(String, String)> {
        let mut f = Vec::new();
        if let Some(t) = self.instrument_type {
            f.push(("type".to_string(), t.code().to_string()));
        }
        if let Some(cs) = self.contract_size {
            f.push(("contract_size".to_string(), cs.to_string()));
        }
        if let Some(p) = &self.profit_currency {
            f.push(("profit".to_string(), p.clone()));
        }
        if let Some(s) = self.spread {
            f.push(("spread".to_string(), s.to_string()));
        }
        if let Some(p) = self.spread_pip {
            f.push(("spread_pip".to_string(), p.to_string()));
        }
        f
    }
}

/// Redis fetch for (group, symbol) falling back to the Standard group.
/// Returns the row plus the group actually used.
pub async fn fetch_group(
    store: &StateStore,
    group: &str,
    symbol: &str,
) -> Result<(GroupConfig, String), EngineError> {
    let group = if group.trim().is_empty() {
        STANDARD_GROUP
    } else {
        group.trim()
    };
    let h = store.hgetall(&keys::group_symbol(group, symbol)).await?;
    if !h.is_empty() {
        return Ok((GroupConfig::from_hash(&h), group.to_string()));
    }
    let h = store
        .hgetall(&keys::group_symbol(STANDARD_GROUP, symbol))
        .await?;
    Ok((GroupConfig::from_hash(&h), STANDARD_GROUP.to_string()))
}

#[derive(Debug, Deserialize)]
struct ProviderGroupResponse {
    data: Option<ProviderGroupRow>,
}

#[derive(Debug, Deserialize)]
struct ProviderGroupRow {
    name: Option<String>,
    #[serde(rename = "type")]
    instrument_type: Option<i64>,
    contract_size: Option<String>,
    profit: Option<String>,
    spread: Option<String>,
    spread_pip: Option<String>,
}

impl ProviderGroupRow {
    fn into_config(self) -> GroupConfig {
        GroupConfig {
            instrument_type: self.instrument_type.and_then(InstrumentType::from_code),
            contract_size: self.contract_size.and_then(|v| v.parse().ok()),
            profit_currency: self.profit.map(|s| s.to_uppercase()),
            spread: self.spread.and_then(|v| v.parse().ok()),
            spread_pip: self.spread_pip.and_then(|v| v.parse().ok()),
            ..GroupConfig::default()
        }
    }
}

async fn fetch_from_db(
    http: &reqwest::Client,
    provider_url: &str,
    group: &str,
    symbol: &str,
) -> Option<(GroupConfig, Option<String>)> {
    let url = format!("{provider_url}/groups/{group}/{}", symbol.to_uppercase());
    match http.get(&url).send().await {
        Ok(resp) if resp.status().is_success() => match resp.json::<ProviderGroupResponse>().await
        {
            Ok(body) => body.data.map(|row| {
                let name = row.name.clone();
                (row.into_config(), name)
            }),
            Err(e) => {
                warn!(group, symbol, error = %e, "group db response malformed");
                None
            }
        },
        Ok(resp) => {
            warn!(group, symbol, status = %resp.status(), "group db fallback non-200");
            None
        }
        Err(e) => {
            warn!(group, symbol, error = %e, "group db fallback failed");
            None
        }
    }
}

/// Read-through resolution: Redis (group, then Standard), then the DB via
/// the internal provider endpoint, caching DB hits back into Redis under
/// both the responding and the requested group.
pub async fn get_group_config_with_fallback(
    store: &StateStore,
    http: Option<&reqwest::Client>,
    provider_url: &str,
    group: &str,
    symbol: &str,
) -> Result<(GroupConfig, String), EngineError> {
    let (cfg, used) = fetch_group(store, group, symbol).await?;
    if cfg.has_margin_fields() {
        return Ok((cfg, used));
    }
    let Some(http) = http else {
        return Ok((cfg, used));
    };
    let db = match fetch_from_db(http, provider_url, group, symbol).await {
        Some(hit) => Some(hit),
        None => fetch_from_db(http, provider_url, STANDARD_GROUP, symbol).await,
    };
    if let Some((db_cfg, name)) = db {
        let responding = name.unwrap_or_else(|| group.to_string());
        let fields = db_cfg.to_fields();
        if !fields.is_empty() {
            store
                .hset(&keys::group_symbol(&responding, symbol), &fields)
                .await?;
            if responding != group {
                store
                    .hset(&keys::group_symbol(group, symbol), &fields)
                    .await?;
            }
        }
        return Ok((db_cfg, responding));
    }
    Ok((cfg, used))
}
