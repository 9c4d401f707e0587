//! Cancel-confirm workers.
//!
//! `CancelWorker` finalizes a cancelled pending order. The SL/TP cancel
//! workers confirm removal of a single protective level with the provider:
//! each strips exactly its own half of the trigger state and restores the
//! order to OPEN, never touching the other half.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use crate::error::EngineError;
use crate::orders::{
    has_other_holdings_on_symbol, holdings_remove_ops, load_order_by_id, save_order, sl_tp,
    OrderStatus,
};
use crate::provider::ExecutionReport;
use crate::queue::{self, QueueBus, CANCEL_QUEUE, STOPLOSS_CANCEL_QUEUE, TAKEPROFIT_CANCEL_QUEUE};
use crate::store::{keys, KvOp, StateStore};
use crate::workers::ReportHandler;

pub struct CancelWorker {
    store: StateStore,
    bus: Arc<dyn QueueBus>,
}

impl CancelWorker {
    pub fn new(store: StateStore, bus: Arc<dyn QueueBus>) -> Self {
        Self { store, bus }
    }
}

#[async_trait]
impl ReportHandler for CancelWorker {
    fn queue(&self) -> &'static str {
        CANCEL_QUEUE
    }

    async fn handle(&self, report: &ExecutionReport) -> Result<(), EngineError> {
        let mut order = match load_order_by_id(&self.store, &report.order_id).await? {
            Some(o) => o,
            None => {
                return Err(EngineError::Store(format!(
                    "order {} not found",
                    report.order_id
                )))
            }
        };
        if order.status == OrderStatus::Cancelled {
            info!(order_id = %order.order_id, "cancel replay acked");
            return Ok(());
        }
        if !matches!(order.status, OrderStatus::Pending | OrderStatus::Queued) {
            info!(
                order_id = %order.order_id,
                status = order.status.as_str(),
                "cancel report against non-matching status, acking as replay"
            );
            return Ok(());
        }

        let now_ms = Utc::now().timestamp_millis();
        order.status = OrderStatus::Cancelled;
        order.finalized_ts_ms = Some(now_ms);

        let drop_membership = !has_other_holdings_on_symbol(
            &self.store,
            &order.user_type,
            &order.user_id,
            &order.symbol,
            &order.order_id,
        )
        .await?;
        let mut ops = vec![KvOp::Hset {
            key: keys::order_data(&order.user_type, &order.user_id, &order.order_id),
            fields: order.to_fields(),
        }];
        ops.extend(holdings_remove_ops(&order, drop_membership));
        self.store.pipeline(ops).await?;
        sl_tp::remove_order_triggers(&self.store, &order.order_id).await?;

        queue::publish_db_update(self.bus.as_ref(), order.post_image("order_cancelled")).await?;
        info!(order_id = %order.order_id, "pending order cancelled");
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────
// SL / TP cancel confirmation
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProtectiveLeg {
    StopLoss,
    TakeProfit,
}

struct LegCancelWorker {
    store: StateStore,
    bus: Arc<dyn QueueBus>,
    leg: ProtectiveLeg,
}

impl LegCancelWorker {
    async fn handle_leg(&self, report: &ExecutionReport) -> Result<(), EngineError> {
        let mut order = match load_order_by_id(&self.store, &report.order_id).await? {
            Some(o) => o,
            None => {
                return Err(EngineError::Store(format!(
                    "order {} not found",
                    report.order_id
                )))
            }
        };
        let expected = match self.leg {
            ProtectiveLeg::StopLoss => OrderStatus::SlPending,
            ProtectiveLeg::TakeProfit => OrderStatus::TpPending,
        };
        if order.status != expected {
            info!(
                order_id = %order.order_id,
                status = order.status.as_str(),
                "leg-cancel report against non-matching status, acking as replay"
            );
            return Ok(());
        }

        // Remove exactly this half; the other protective level stays armed.
        match self.leg {
            ProtectiveLeg::StopLoss => {
                sl_tp::remove_stoploss_trigger(&self.store, &order.order_id).await?;
                order.stop_loss = None;
            }
            ProtectiveLeg::TakeProfit => {
                sl_tp::remove_takeprofit_trigger(&self.store, &order.order_id).await?;
                order.take_profit = None;
            }
        }
        order.status = OrderStatus::Open;
        save_order(&self.store, &order).await?;
        // The stale level must not survive in the canonical hash.
        let field = match self.leg {
            ProtectiveLeg::StopLoss => "stop_loss",
            ProtectiveLeg::TakeProfit => "take_profit",
        };
        self.store
            .hdel(
                &keys::order_data(&order.user_type, &order.user_id, &order.order_id),
                &[field],
            )
            .await?;

        let event = match self.leg {
            ProtectiveLeg::StopLoss => "stoploss_cancelled",
            ProtectiveLeg::TakeProfit => "takeprofit_cancelled",
        };
        queue::publish_db_update(self.bus.as_ref(), order.post_image(event)).await?;
        info!(order_id = %order.order_id, event, "protective level removed");
        Ok(())
    }
}

pub struct StopLossCancelWorker(LegCancelWorker);

impl StopLossCancelWorker {
    pub fn new(store: StateStore, bus: Arc<dyn QueueBus>) -> Self {
        Self(LegCancelWorker {
            store,
            bus,
            leg: ProtectiveLeg::StopLoss,
        })
    }
}

#[async_trait]
impl ReportHandler for StopLossCancelWorker {
    fn queue(&self) -> &'static str {
        STOPLOSS_CANCEL_QUEUE
    }
    async fn handle(&self, report: &ExecutionReport) -> Result<(), EngineError> {
        self.0.handle_leg(report).await
    }
}

pub struct TakeProfitCancelWorker(LegCancelWorker);

impl TakeProfitCancelWorker {
    pub fn new(store: StateStore, bus: Arc<dyn QueueBus>) -> Self {
        Self(LegCancelWorker {
            store,
            bus,
            leg: ProtectiveLeg::TakeProfit,
        })
    }
}

#[async_trait]
impl ReportHandler for TakeProfitCancelWorker {
    fn queue(&self) -> &'static str {
        TAKEPROFIT_CANCEL_QUEUE
    }
    async fn handle(&self, report: &ExecutionReport) -> Result<(), EngineError> {
        self.0.handle_leg(report).await
    }
}
