//! Pricing: execution price resolution and USD conversion.
//!
//! Execution price applies the group half-spread to the raw side price:
//! BUY executes at ask + half_spread, SELL at bid - half_spread. Conversion
//! to USD always uses the ask of the conversion pair, which is conservative:
//! it over-estimates required margin.

use std::collections::HashMap;

use rust_decimal::Decimal;

use crate::error::EngineError;
use crate::groups;
use crate::market::TickSource;
use crate::orders::Side;
use crate::store::{keys, StateStore};

/// Caller-supplied `{symbol → (bid, ask)}` snapshot consulted before the
/// live store during conversions (the portfolio flush reuses one cache for
/// a whole batch of users).
pub type PriceCache = HashMap<String, (Decimal, Decimal)>;

#[derive(Debug, Clone)]
pub struct ExecutionQuote {
    pub exec_price: Decimal,
    pub raw_price: Decimal,
    pub half_spread: Decimal,
    pub group_used: String,
}

/// Resolves the execution price for (group, symbol, side).
pub async fn execution_price(
    store: &StateStore,
    user_group: &str,
    symbol: &str,
    side: Side,
) -> Result<ExecutionQuote, EngineError> {
    let (cfg, group_used) = groups::fetch_group(store, user_group, symbol).await?;
    let half_spread = cfg
        .half_spread()
        .ok_or_else(|| EngineError::InvalidSpreadData {
            group: group_used.clone(),
            symbol: symbol.to_uppercase(),
        })?;

    let px = store
        .hmget(&keys::market(symbol), &["bid", "ask", "source"])
        .await?;
    let source = TickSource::parse(px.get(2).and_then(|v| v.as_deref()).unwrap_or("feed"));
    if !source.is_tradable() {
        // Warmup/emergency fallback ticks keep the plumbing alive but are
        // never execution prices.
        return Err(EngineError::MissingMarketPrice {
            symbol: symbol.to_uppercase(),
        });
    }
    let parse = |idx: usize| -> Option<Decimal> {
        px.get(idx).and_then(|v| v.as_deref()).and_then(|v| v.parse().ok())
    };
    let raw_price = match side {
        Side::Buy => parse(1),
        Side::Sell => parse(0),
    }
    .ok_or_else(|| EngineError::MissingMarketPrice {
        symbol: symbol.to_uppercase(),
    })?;

    let exec_price = match side {
        Side::Buy => raw_price + half_spread,
        Side::Sell => raw_price - half_spread,
    };
    Ok(ExecutionQuote {
        exec_price,
        raw_price,
        half_spread,
        group_used,
    })
}

/// Converts `amount` from `from_currency` into USD.
///
/// Lookup order: direct pair `{from}USD` ask, inverse pair `USD{from}` ask
/// (divide), each first in the caller cache then in the live store. In
/// strict mode a miss is `conversion_rate_missing`; non-strict returns the
/// amount unchanged.
pub async fn convert_to_usd(
    store: &StateStore,
    amount: Decimal,
    from_currency: &str,
    cache: Option<&PriceCache>,
    strict: bool,
) -> Result<Decimal, EngineError> {
    let fc = from_currency.trim().to_uppercase();
    if fc.is_empty() {
        return if strict {
            Err(EngineError::ConversionRateMissing { currency: fc })
        } else {
            Ok(amount)
        };
    }
    if fc == "USD" || fc == "USDT" {
        return Ok(amount);
    }

    let direct = format!("{fc}USD");
    let inverse = format!("USD{fc}");

    if let Some(cache) = cache {
        if let Some((_, ask)) = cache.get(&direct) {
            if *ask > Decimal::ZERO {
                return Ok(amount * *ask);
            }
        }
        if let Some((_, ask)) = cache.get(&inverse) {
            if *ask > Decimal::ZERO {
                return Ok(amount / *ask);
            }
        }
    }

    if let Some(ask) = market_ask(store, &direct).await? {
        if ask > Decimal::ZERO {
            return Ok(amount * ask);
        }
    }
    if let Some(ask) = market_ask(store, &inverse).await? {
        if ask > Decimal::ZERO {
            return Ok(amount / ask);
        }
    }

    if strict {
        Err(EngineError::ConversionRateMissing { currency: fc })
    } else {
        Ok(amount)
    }
}

async fn market_ask(store: &StateStore, pair: &str) -> Result<Option<Decimal>, EngineError> {
    let v = store.hmget(&keys::market(pair), &["ask"]).await?;
    Ok(v.first()
        .and_then(|x| x.as_deref())
        .and_then(|x| x.parse().ok()))
}
