//! Crate-level error type.
//!
//! Every rejection the engine can produce maps to a stable machine-readable
//! reason code; the HTTP layer and queue consumers match on the variant, the
//! human string is for logs only.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("order type must be BUY or SELL")]
    InvalidOrderType,

    #[error("group row is missing spread/spread_pip for {symbol} (group {group})")]
    InvalidSpreadData { group: String, symbol: String },

    #[error("no market price for {symbol}")]
    MissingMarketPrice { symbol: String },

    #[error("user account is not enabled")]
    InvalidUserStatus,

    #[error("user leverage must be positive")]
    InvalidLeverage,

    #[error("group config missing required fields for {symbol} (group {group})")]
    MissingGroupConfig { group: String, symbol: String },

    #[error("insufficient free margin: required {required} available {available}")]
    InsufficientMargin { required: String, available: String },

    #[error("another request with this idempotency key is in flight")]
    IdempotencyInProgress,

    #[error("no conversion rate for {currency}->USD")]
    ConversionRateMissing { currency: String },

    #[error("state store circuit breaker is open")]
    StateStoreUnavailable,

    #[error("provider transport unreachable")]
    ProviderUnreachable,

    #[error("duplicate execution report (exec_id {exec_id})")]
    DuplicateExecReport { exec_id: String },

    #[error("no route for (redis_status={redis_status}, ord_status={ord_status})")]
    UnknownRoutingState {
        redis_status: String,
        ord_status: String,
    },

    #[error("store operation failed: {0}")]
    Store(String),

    #[error("queue operation failed: {0}")]
    Queue(String),

    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl EngineError {
    /// Stable wire code, used in HTTP responses and queue messages.
    pub fn reason(&self) -> &'static str {
        match self {
            EngineError::InvalidOrderType => "invalid_order_type",
            EngineError::InvalidSpreadData { .. } => "invalid_spread_data",
            EngineError::MissingMarketPrice { .. } => "missing_market_price",
            EngineError::InvalidUserStatus => "invalid_user_status",
            EngineError::InvalidLeverage => "invalid_leverage",
            EngineError::MissingGroupConfig { .. } => "missing_group_config",
            EngineError::InsufficientMargin { .. } => "insufficient_margin",
            EngineError::IdempotencyInProgress => "idempotency_in_progress",
            EngineError::ConversionRateMissing { .. } => "conversion_rate_missing",
            EngineError::StateStoreUnavailable => "state_store_unavailable",
            EngineError::ProviderUnreachable => "provider_unreachable",
            EngineError::DuplicateExecReport { .. } => "duplicate_exec_report",
            EngineError::UnknownRoutingState { .. } => "unknown_routing_state",
            EngineError::Store(_) => "state_store_error",
            EngineError::Queue(_) => "queue_error",
            EngineError::Malformed(_) => "malformed_payload",
        }
    }
}

/// Transport-level store failure. The circuit breaker only counts the
/// `Transport` kind; everything else passes through untouched.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("{0}")]
    Other(String),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::Store(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes_are_stable() {
        assert_eq!(EngineError::InvalidOrderType.reason(), "invalid_order_type");
        assert_eq!(
            EngineError::InsufficientMargin {
                required: "12".into(),
                available: "5".into()
            }
            .reason(),
            "insufficient_margin"
        );
        assert_eq!(
            EngineError::StateStoreUnavailable.reason(),
            "state_store_unavailable"
        );
    }
}
