//! Margin engine.
//!
//! Per-order margin is computed in the instrument's profit currency and
//! converted to USD; per-symbol totals net opposing lots (hedged margin):
//! the surviving net quantity carries the worst-case per-lot margin among
//! the symbol's open orders. Commission is a separate charge gated by the
//! group's commission type.

use std::collections::HashMap;

use rust_decimal::Decimal;

use crate::error::EngineError;
use crate::groups::{GroupConfig, InstrumentType};
use crate::orders::{load_user_holdings, HoldingRow, Side};
use crate::pricing::{convert_to_usd, PriceCache};
use crate::store::StateStore;
use crate::users::UserConfig;

/// Margin for one order, in USD. `group` is the group row the config came
/// from, carried into the error when required fields are missing.
pub async fn compute_single_order_margin(
    store: &StateStore,
    cfg: &GroupConfig,
    group: &str,
    symbol: &str,
    quantity: Decimal,
    execution_price: Decimal,
    leverage: Decimal,
    cache: Option<&PriceCache>,
) -> Result<Decimal, EngineError> {
    if leverage <= Decimal::ZERO {
        return Err(EngineError::InvalidLeverage);
    }
    let (contract_size, profit_ccy, instrument_type) = match (
        cfg.contract_size,
        cfg.profit_currency.as_deref(),
        cfg.instrument_type,
    ) {
        (Some(cs), Some(p), Some(t)) => (cs, p, t),
        _ => {
            return Err(EngineError::MissingGroupConfig {
                group: group.to_string(),
                symbol: symbol.to_uppercase(),
            })
        }
    };

    let contract_value = contract_size * quantity;
    let mut margin_native = (contract_value * execution_price) / leverage;
    if instrument_type == InstrumentType::Crypto {
        let factor = cfg.crypto_margin_factor.unwrap_or(Decimal::ONE);
        margin_native *= factor;
    }
    convert_to_usd(store, margin_native, profit_ccy, cache, true).await
}

// ─────────────────────────────────────────────────────────
// Commission
// ─────────────────────────────────────────────────────────

const COMMISSION_EVERY: i64 = 0;
const COMMISSION_ENTRY: i64 = 1;
const COMMISSION_EXIT: i64 = 2;
const VALUE_TYPE_PER_LOT: i64 = 0;
const VALUE_TYPE_PERCENT: i64 = 1;

fn commission(
    cfg: &GroupConfig,
    applicable: &[i64],
    quantity: Decimal,
    price: Decimal,
) -> Decimal {
    let (rate, ctype, vtype) = match (
        cfg.commission_rate,
        cfg.commission_type,
        cfg.commission_value_type,
    ) {
        (Some(r), Some(c), Some(v)) => (r, c, v),
        _ => return Decimal::ZERO,
    };
    if !applicable.contains(&ctype) {
        return Decimal::ZERO;
    }
    let raw = match vtype {
        VALUE_TYPE_PER_LOT => quantity * rate,
        VALUE_TYPE_PERCENT => match cfg.contract_size {
            Some(cs) => (rate / Decimal::ONE_HUNDRED) * cs * quantity * price,
            None => return Decimal::ZERO,
        },
        _ => return Decimal::ZERO,
    };
    raw.round_dp(2)
}

/// Entry commission applies for commission_type every-trade or entry-only.
pub fn compute_entry_commission(cfg: &GroupConfig, quantity: Decimal, price: Decimal) -> Decimal {
    commission(cfg, &[COMMISSION_EVERY, COMMISSION_ENTRY], quantity, price)
}

/// Exit commission applies for commission_type every-trade or exit-only.
pub fn compute_exit_commission(cfg: &GroupConfig, quantity: Decimal, price: Decimal) -> Decimal {
    commission(cfg, &[COMMISSION_EVERY, COMMISSION_EXIT], quantity, price)
}

// ─────────────────────────────────────────────────────────
// Hedged aggregation
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SymbolOrder {
    pub side: Side,
    pub quantity: Decimal,
    pub margin_usd: Decimal,
}

impl From<&HoldingRow> for SymbolOrder {
    fn from(r: &HoldingRow) -> Self {
        SymbolOrder {
            side: r.side,
            quantity: r.quantity,
            margin_usd: r.margin_usd,
        }
    }
}

/// Hedged margin for one symbol: opposing lots net out up to the smaller
/// side, the surviving net quantity carries the highest per-lot margin.
pub fn compute_symbol_margin(orders: &[SymbolOrder]) -> Decimal {
    if orders.is_empty() {
        return Decimal::ZERO;
    }
    let mut buy_qty = Decimal::ZERO;
    let mut sell_qty = Decimal::ZERO;
    let mut per_lot_max = Decimal::ZERO;
    for o in orders {
        match o.side {
            Side::Buy => buy_qty += o.quantity,
            Side::Sell => sell_qty += o.quantity,
        }
        if o.quantity > Decimal::ZERO {
            let per_lot = o.margin_usd / o.quantity;
            if per_lot > per_lot_max {
                per_lot_max = per_lot;
            }
        }
    }
    let net_qty = buy_qty.max(sell_qty);
    if net_qty <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    per_lot_max * net_qty
}

/// Total used margin across every symbol the user holds.
pub fn compute_total_margin(holdings: &[HoldingRow]) -> Decimal {
    let mut by_symbol: HashMap<&str, Vec<SymbolOrder>> = HashMap::new();
    for h in holdings {
        by_symbol
            .entry(h.symbol.as_str())
            .or_default()
            .push(SymbolOrder::from(h));
    }
    by_symbol
        .values()
        .map(|orders| compute_symbol_margin(orders))
        .sum()
}

// ─────────────────────────────────────────────────────────
// Portfolio totals
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PortfolioTotals {
    pub used_margin_usd: Decimal,
    pub unrealized_pnl: Decimal,
    pub equity: Decimal,
    pub free_margin: Decimal,
    /// equity / used_margin; `None` when nothing is on margin.
    pub margin_level: Option<Decimal>,
}

/// Unrealized P&L for one holding against the current raw prices: a BUY
/// exits on bid, a SELL on ask, both in the instrument's profit currency.
pub async fn unrealized_pnl_for_holding(
    store: &StateStore,
    cfg: &GroupConfig,
    holding: &HoldingRow,
    bid: Decimal,
    ask: Decimal,
    cache: Option<&PriceCache>,
) -> Result<Decimal, EngineError> {
    let contract_size = cfg.contract_size.unwrap_or(Decimal::ZERO);
    let profit_ccy = cfg.profit_currency.as_deref().unwrap_or("USD");
    let diff = match holding.side {
        Side::Buy => bid - holding.entry_price,
        Side::Sell => holding.entry_price - ask,
    };
    let native = diff * contract_size * holding.quantity;
    // Non-strict: a missing conversion pair degrades the estimate rather
    // than blocking the portfolio flush.
    convert_to_usd(store, native, profit_ccy, cache, false).await
}

/// Full portfolio recomputation for one user: used margin (hedged), open
/// P&L, equity, free margin and margin level.
pub async fn compute_portfolio(
    store: &StateStore,
    user_type: &str,
    user_id: &str,
    user: &UserConfig,
    cache: Option<&PriceCache>,
) -> Result<PortfolioTotals, EngineError> {
    let holdings = load_user_holdings(store, user_type, user_id).await?;
    let used_margin_usd = compute_total_margin(&holdings);

    let mut unrealized_pnl = Decimal::ZERO;
    for h in &holdings {
        let (cfg, _) = crate::groups::fetch_group(store, &user.group, &h.symbol).await?;
        let snapshot = store
            .hmget(&crate::store::keys::market(&h.symbol), &["bid", "ask"])
            .await?;
        let bid: Option<Decimal> = snapshot
            .first()
            .and_then(|v| v.as_deref())
            .and_then(|v| v.parse().ok());
        let ask: Option<Decimal> = snapshot
            .get(1)
            .and_then(|v| v.as_deref())
            .and_then(|v| v.parse().ok());
        if let (Some(bid), Some(ask)) = (bid, ask) {
            unrealized_pnl +=
                unrealized_pnl_for_holding(store, &cfg, h, bid, ask, cache).await?;
        }
    }

    let equity = user.wallet_balance + unrealized_pnl;
    let free_margin = equity - used_margin_usd;
    let margin_level = if used_margin_usd > Decimal::ZERO {
        Some(equity / used_margin_usd)
    } else {
        None
    };
    Ok(PortfolioTotals {
        used_margin_usd,
        unrealized_pnl,
        equity,
        free_margin,
        margin_level,
    })
}
