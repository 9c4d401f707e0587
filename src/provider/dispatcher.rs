//! Confirmation dispatcher.
//!
//! Consumes normalized execution reports and routes each to the worker
//! queue that owns the (current order status × report status) transition.
//! A replayed report is dropped by the provider-side idempotency guard;
//! an unroutable pair goes to the dead-letter queue with the reason.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::EngineError;
use crate::orders::{load_order_by_id, OrderStatus};
use crate::provider::{ExecutionReport, OrdStatus};
use crate::queue::{
    self, QueueBus, CANCEL_QUEUE, CLOSE_QUEUE, CONFIRMATION_QUEUE, OPEN_QUEUE, REJECT_QUEUE,
    STOPLOSS_CANCEL_QUEUE, TAKEPROFIT_CANCEL_QUEUE,
};
use crate::store::{keys, StateStore};

const PROVIDER_IDEM_TTL_SECS: u64 = 7 * 24 * 3600;

/// The state-transition table. `None` means dead-letter.
pub fn route(redis_status: OrderStatus, ord_status: OrdStatus) -> Option<&'static str> {
    use OrderStatus::*;
    match (redis_status, ord_status) {
        (Queued, OrdStatus::Executed) => Some(OPEN_QUEUE),
        (Queued, OrdStatus::Rejected) => Some(REJECT_QUEUE),
        // Some LPs report a pre-fill rejection as a cancel.
        (Queued, OrdStatus::Cancelled) => Some(CANCEL_QUEUE),
        // An EXECUTED report against an open order is its close fill.
        (Open, OrdStatus::Executed) => Some(CLOSE_QUEUE),
        (Closing, OrdStatus::Executed) => Some(CLOSE_QUEUE),
        (SlPending, OrdStatus::Cancelled) => Some(STOPLOSS_CANCEL_QUEUE),
        (TpPending, OrdStatus::Cancelled) => Some(TAKEPROFIT_CANCEL_QUEUE),
        // Pending activation fills open the order.
        (Pending, OrdStatus::Executed) => Some(OPEN_QUEUE),
        (Pending, OrdStatus::Cancelled) => Some(CANCEL_QUEUE),
        _ => None,
    }
}

pub struct ConfirmationDispatcher {
    store: StateStore,
    bus: Arc<dyn QueueBus>,
}

impl ConfirmationDispatcher {
    pub fn new(store: StateStore, bus: Arc<dyn QueueBus>) -> Self {
        Self { store, bus }
    }

    pub async fn run(&self) {
        loop {
            let msg = match self.bus.consume(CONFIRMATION_QUEUE).await {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "confirmation consume failed");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
            };
            let report: ExecutionReport = match serde_json::from_value(msg.body.clone()) {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "undecodable confirmation message");
                    let _ = queue::publish_dlq(
                        self.bus.as_ref(),
                        CONFIRMATION_QUEUE,
                        "malformed_payload",
                        msg.body,
                    )
                    .await;
                    continue;
                }
            };
            if let Err(e) = self.dispatch(&report).await {
                warn!(order_id = %report.order_id, error = %e, "dispatch failed");
            }
        }
    }

    pub async fn dispatch(&self, report: &ExecutionReport) -> Result<(), EngineError> {
        // Provider-side idempotency: a replayed exec_id is dropped.
        let fresh = self
            .store
            .set_nx_ex(
                &keys::provider_idem(&report.exec_id),
                "1",
                PROVIDER_IDEM_TTL_SECS,
            )
            .await?;
        if !fresh {
            info!(
                order_id = %report.order_id,
                exec_id = %report.exec_id,
                "duplicate execution report dropped"
            );
            return Ok(());
        }

        let ord_status = match report.status() {
            Some(s) => s,
            None => {
                return self
                    .dead_letter(report, "unknown_routing_state")
                    .await
            }
        };
        let order = match load_order_by_id(&self.store, &report.order_id).await? {
            Some(o) => o,
            None => return self.dead_letter(report, "unknown_order").await,
        };

        match route(order.status, ord_status) {
            Some(destination) => {
                let body = serde_json::to_value(report)
                    .map_err(|e| EngineError::Malformed(e.to_string()))?;
                queue::publish(self.bus.as_ref(), destination, body).await?;
                info!(
                    order_id = %report.order_id,
                    redis_status = order.status.as_str(),
                    ord_status = ord_status.as_str(),
                    destination,
                    "report routed"
                );
                Ok(())
            }
            None => {
                warn!(
                    order_id = %report.order_id,
                    redis_status = order.status.as_str(),
                    ord_status = ord_status.as_str(),
                    "unroutable report"
                );
                self.dead_letter(report, "unknown_routing_state").await
            }
        }
    }

    async fn dead_letter(&self, report: &ExecutionReport, reason: &str) -> Result<(), EngineError> {
        let body =
            serde_json::to_value(report).map_err(|e| EngineError::Malformed(e.to_string()))?;
        queue::publish_dlq(self.bus.as_ref(), CONFIRMATION_QUEUE, reason, body).await
    }
}
