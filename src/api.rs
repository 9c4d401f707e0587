//! HTTP surface: a thin wrapper over the order executor.
//!
//! `POST /orders/instant` prices and admits the order synchronously; for
//! provider-routed accounts the provider payload is dispatched from a
//! background task so the caller never waits on provider RTT. `GET /health`
//! exposes the circuit-breaker state.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::error::EngineError;
use crate::orders::executor::{InstantOrderRequest, OrderExecutor};
use crate::orders::Side;
use crate::queue::{self, QueueBus, PROVIDER_SEND_QUEUE};
use crate::store::StateStore;

#[derive(Clone)]
pub struct ApiState {
    pub executor: Arc<OrderExecutor>,
    pub bus: Arc<dyn QueueBus>,
    pub store: StateStore,
}

#[derive(Debug, Deserialize)]
pub struct InstantOrderBody {
    pub symbol: String,
    pub order_type: String,
    pub order_price: Decimal,
    pub order_quantity: Decimal,
    pub user_id: String,
    pub user_type: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/orders/instant", post(instant_order))
        .route("/health", get(health))
        .with_state(state)
}

pub async fn serve(state: ApiState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "http surface listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "circuit_breaker": state.store.breaker_snapshot(),
    }))
}

fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::IdempotencyInProgress => StatusCode::CONFLICT,
        EngineError::InsufficientMargin { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::StateStoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::InvalidOrderType
        | EngineError::InvalidSpreadData { .. }
        | EngineError::MissingMarketPrice { .. }
        | EngineError::InvalidUserStatus
        | EngineError::InvalidLeverage
        | EngineError::MissingGroupConfig { .. }
        | EngineError::ConversionRateMissing { .. }
        | EngineError::Malformed(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: &EngineError) -> (StatusCode, Json<Value>) {
    (
        status_for(err),
        Json(json!({
            "ok": false,
            "reason": err.reason(),
            "message": err.to_string(),
        })),
    )
}

async fn instant_order(
    State(state): State<ApiState>,
    Json(body): Json<InstantOrderBody>,
) -> (StatusCode, Json<Value>) {
    let side = match Side::parse(&body.order_type) {
        Ok(s) => s,
        Err(e) => return reject(&e),
    };
    if body.user_type != "live" && body.user_type != "demo" {
        return reject(&EngineError::Malformed(
            "user_type must be live or demo".into(),
        ));
    }

    let request = InstantOrderRequest {
        symbol: body.symbol,
        side,
        order_price: body.order_price,
        order_quantity: body.order_quantity,
        user_id: body.user_id,
        user_type: body.user_type,
        idempotency_key: body.idempotency_key,
        stop_loss: body.stop_loss,
        take_profit: body.take_profit,
    };

    match state.executor.execute_instant_order(request).await {
        Ok(outcome) => {
            // Provider dispatch is off the caller's critical path.
            if let Some(payload) = outcome.provider_payload {
                let bus = state.bus.clone();
                tokio::spawn(async move {
                    match serde_json::to_value(&payload) {
                        Ok(body) => {
                            if let Err(e) =
                                queue::publish(bus.as_ref(), PROVIDER_SEND_QUEUE, body).await
                            {
                                error!(
                                    order_id = %payload.order_id,
                                    error = %e,
                                    "provider dispatch failed, order stays QUEUED for reconciliation"
                                );
                            }
                        }
                        Err(e) => error!(error = %e, "provider payload serialization failed"),
                    }
                });
            }
            let r = outcome.response;
            (
                StatusCode::OK,
                Json(json!({
                    "ok": r.ok,
                    "order_id": r.order_id,
                    "order_status": r.order_status,
                    "flow": r.flow,
                    "exec_price": r.exec_price,
                    "margin_usd": r.margin_usd,
                })),
            )
        }
        Err(e) => reject(&e),
    }
}
