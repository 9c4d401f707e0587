//! Close-confirm worker.
//!
//! Applies `OPEN|CLOSING → CLOSED`: recomputes exit commission and realized
//! P&L from the actual close fill, tears down the holdings mirror, symbol
//! membership and trigger indexes, and attributes `close_reason` from the
//! close context written by whoever initiated the close.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use crate::error::EngineError;
use crate::groups;
use crate::margin;
use crate::orders::{
    close_context, has_other_holdings_on_symbol, holdings_remove_ops, load_order_by_id, sl_tp,
    CloseReason, OrderStatus, Side,
};
use crate::pricing;
use crate::provider::ExecutionReport;
use crate::queue::{self, QueueBus, CLOSE_QUEUE};
use crate::store::{keys, KvOp, StateStore};
use crate::users;
use crate::workers::ReportHandler;

pub struct CloseWorker {
    store: StateStore,
    bus: Arc<dyn QueueBus>,
}

impl CloseWorker {
    pub fn new(store: StateStore, bus: Arc<dyn QueueBus>) -> Self {
        Self { store, bus }
    }

    /// The full close transition, also invoked directly by the trigger
    /// engine and autocutoff for local-routing accounts.
    pub async fn apply_close(&self, report: &ExecutionReport) -> Result<(), EngineError> {
        let mut order = match load_order_by_id(&self.store, &report.order_id).await? {
            Some(o) => o,
            None => {
                return Err(EngineError::Store(format!(
                    "order {} not found",
                    report.order_id
                )))
            }
        };

        if order.status == OrderStatus::Closed {
            info!(order_id = %order.order_id, "close replay acked");
            return Ok(());
        }
        if !matches!(order.status, OrderStatus::Open | OrderStatus::Closing) {
            info!(
                order_id = %order.order_id,
                status = order.status.as_str(),
                "close report against non-matching status, acking as replay"
            );
            return Ok(());
        }

        let close_price = report
            .avg_px_dec()
            .ok_or_else(|| EngineError::Malformed("close report without avg_px".into()))?;

        let user = users::load_user_config(&self.store, &order.user_type, &order.user_id)
            .await?
            .ok_or(EngineError::InvalidUserStatus)?;
        let (cfg, _) = groups::fetch_group(&self.store, &user.group, &order.symbol).await?;

        order.commission_exit =
            margin::compute_exit_commission(&cfg, order.quantity, close_price);

        let contract_size = cfg.contract_size.unwrap_or_default();
        let diff = match order.side {
            Side::Buy => close_price - order.entry_price,
            Side::Sell => order.entry_price - close_price,
        };
        let native = diff * contract_size * order.quantity;
        let profit_ccy = cfg.profit_currency.as_deref().unwrap_or("USD");
        let realized_pnl =
            pricing::convert_to_usd(&self.store, native, profit_ccy, None, false).await?;
        let net_profit = realized_pnl - order.commission_entry - order.commission_exit;

        let reason = match close_context::get_close_context(&self.store, &order.order_id).await? {
            Some(ctx) => ctx.context,
            None => CloseReason::UserClosed,
        };

        let now_ms = Utc::now().timestamp_millis();
        order.status = OrderStatus::Closed;
        order.close_price = Some(close_price);
        order.close_reason = Some(reason);
        order.closed_ts_ms = Some(now_ms);
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
        close_context::clear_close_context(&self.store, &order.order_id).await?;

        let mut img = order.post_image("order_closed");
        let obj = img.as_object_mut().unwrap();
        obj.insert("realized_pnl".into(), realized_pnl.to_string().into());
        obj.insert("net_profit".into(), net_profit.to_string().into());
        queue::publish_db_update(self.bus.as_ref(), img).await?;

        info!(
            order_id = %order.order_id,
            close_price = %close_price,
            close_reason = reason.as_str(),
            realized_pnl = %realized_pnl,
            "order closed"
        );
        Ok(())
    }
}

#[async_trait]
impl ReportHandler for CloseWorker {
    fn queue(&self) -> &'static str {
        CLOSE_QUEUE
    }

    async fn handle(&self, report: &ExecutionReport) -> Result<(), EngineError> {
        self.apply_close(report).await
    }
}
