//! Key-space layout.
//!
//! Every key whose access pattern needs multi-key atomicity carries a
//! hash-tag for the logical partition: user keys tag on `{ut:uid}`, symbol
//! indexes tag on `{SYMBOL}`, group rows tag on `{group}`. Off-core tooling
//! reads these keys, so the layout is part of the public contract; all key
//! construction goes through this module.

pub fn user_config(user_type: &str, user_id: &str) -> String {
    format!("user:{{{user_type}:{user_id}}}:config")
}

pub fn group_symbol(group: &str, symbol: &str) -> String {
    format!("groups:{{{group}}}:{}", symbol.to_uppercase())
}

pub fn order_data(user_type: &str, user_id: &str, order_id: &str) -> String {
    format!("order_data:{{{user_type}:{user_id}}}:{order_id}")
}

pub fn user_holdings(user_type: &str, user_id: &str, order_id: &str) -> String {
    format!("user_holdings:{{{user_type}:{user_id}}}:{order_id}")
}

/// Inverts an order_id back to its owning `ut:uid` partition. Written once
/// at order creation; the dispatcher and trigger engine depend on it.
pub fn order_owner(order_id: &str) -> String {
    format!("order_owner:{order_id}")
}

pub fn symbol_holders(symbol: &str, user_type: &str) -> String {
    format!("symbol_holders:{}:{user_type}", symbol.to_uppercase())
}

pub fn sl_index(symbol: &str, side: &str) -> String {
    format!("sl_index:{{{}}}:{side}", symbol.to_uppercase())
}

pub fn tp_index(symbol: &str, side: &str) -> String {
    format!("tp_index:{{{}}}:{side}", symbol.to_uppercase())
}

pub fn pending_index(symbol: &str, side: &str) -> String {
    format!("pending_index:{{{}}}:{side}", symbol.to_uppercase())
}

pub fn order_triggers(order_id: &str) -> String {
    format!("order_triggers:{order_id}")
}

pub fn close_context(order_id: &str) -> String {
    format!("close_context:{order_id}")
}

pub fn idempotency(user_type: &str, user_id: &str, key: &str) -> String {
    format!("idempotency:{user_type}:{user_id}:{key}")
}

pub fn provider_idem(exec_id: &str) -> String {
    format!("provider_idem:{exec_id}")
}

pub fn market(symbol: &str) -> String {
    format!("market:{}", symbol.to_uppercase())
}

/// Set of every symbol the market cache has written; the warmup scan
/// iterates it.
pub fn market_symbols() -> String {
    "market:symbols".to_string()
}

pub fn user_portfolio(user_type: &str, user_id: &str) -> String {
    format!("user_portfolio:{{{user_type}:{user_id}}}")
}

pub fn daily_seq(prefix: &str, yyyymmdd: &str) -> String {
    format!("{prefix}_seq:{yyyymmdd}")
}

pub fn trigger_leader(partition: &str) -> String {
    format!("trigger_leader:{partition}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_tags_follow_partition_discipline() {
        assert_eq!(user_config("live", "1001"), "user:{live:1001}:config");
        assert_eq!(group_symbol("Standard", "eurusd"), "groups:{Standard}:EURUSD");
        assert_eq!(
            order_data("live", "1001", "1700000000000101"),
            "order_data:{live:1001}:1700000000000101"
        );
        assert_eq!(sl_index("EURUSD", "BUY"), "sl_index:{EURUSD}:BUY");
        assert_eq!(symbol_holders("EURUSD", "live"), "symbol_holders:EURUSD:live");
        assert_eq!(market("eurusd"), "market:EURUSD");
    }
}
