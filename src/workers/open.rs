//! Open-confirm worker.
//!
//! Applies `QUEUED → OPEN` (and `PENDING → OPEN` for activated pending
//! orders): recomputes final margin and entry commission from the actual
//! fill price, materializes the holdings mirror and symbol membership, and
//! arms any SL/TP the order carries.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::info;

use crate::error::EngineError;
use crate::groups;
use crate::margin;
use crate::orders::{
    holdings_add_ops, load_order_by_id, sl_tp, sl_tp::TriggerLevel, OrderStatus,
};
use crate::provider::ExecutionReport;
use crate::queue::{self, QueueBus, OPEN_QUEUE};
use crate::store::{keys, KvOp, StateStore};
use crate::users;
use crate::workers::ReportHandler;

pub struct OpenWorker {
    store: StateStore,
    bus: Arc<dyn QueueBus>,
}

impl OpenWorker {
    pub fn new(store: StateStore, bus: Arc<dyn QueueBus>) -> Self {
        Self { store, bus }
    }
}

#[async_trait]
impl ReportHandler for OpenWorker {
    fn queue(&self) -> &'static str {
        OPEN_QUEUE
    }

    async fn handle(&self, report: &ExecutionReport) -> Result<(), EngineError> {
        let mut order = match load_order_by_id(&self.store, &report.order_id).await? {
            Some(o) => o,
            None => {
                // The QUEUED write may still be in flight; retry.
                return Err(EngineError::Store(format!(
                    "order {} not found",
                    report.order_id
                )));
            }
        };

        if order.status == OrderStatus::Open || order.status.is_terminal() {
            info!(order_id = %order.order_id, status = order.status.as_str(), "open replay acked");
            return Ok(());
        }
        if !matches!(order.status, OrderStatus::Queued | OrderStatus::Pending) {
            info!(
                order_id = %order.order_id,
                status = order.status.as_str(),
                "open report against non-matching status, acking as replay"
            );
            return Ok(());
        }

        let fill_price = report.avg_px_dec().unwrap_or(order.entry_price);
        let fill_qty = report.cum_qty_dec().unwrap_or(order.quantity);

        let user = users::load_user_config(&self.store, &order.user_type, &order.user_id)
            .await?
            .ok_or(EngineError::InvalidUserStatus)?;
        let (cfg, group_used) =
            groups::fetch_group(&self.store, &user.group, &order.symbol).await?;

        // Final margin and commission use the provider's fill, not the
        // requested price the preliminary check ran against.
        order.entry_price = fill_price;
        order.quantity = fill_qty;
        order.margin_usd = margin::compute_single_order_margin(
            &self.store,
            &cfg,
            &group_used,
            &order.symbol,
            fill_qty,
            fill_price,
            user.leverage,
            None,
        )
        .await?;
        order.commission_entry = margin::compute_entry_commission(&cfg, fill_qty, fill_price);
        order.status = OrderStatus::Open;

        let mut ops = vec![KvOp::Hset {
            key: keys::order_data(&order.user_type, &order.user_id, &order.order_id),
            fields: order.to_fields(),
        }];
        ops.extend(holdings_add_ops(&order));
        self.store.pipeline(ops).await?;

        if order.stop_loss.is_some() || order.take_profit.is_some() {
            let half_spread = cfg.half_spread().unwrap_or(Decimal::ZERO);
            sl_tp::upsert_order_triggers(
                &self.store,
                &order.order_id,
                &order.symbol,
                order.side,
                &order.user_type,
                &order.user_id,
                order
                    .stop_loss
                    .map(|sl| TriggerLevel::from_user(order.side, sl, half_spread)),
                order
                    .take_profit
                    .map(|tp| TriggerLevel::from_user(order.side, tp, half_spread)),
            )
            .await?;
        }

        queue::publish_db_update(self.bus.as_ref(), order.post_image("order_opened")).await?;
        info!(
            order_id = %order.order_id,
            fill_price = %order.entry_price,
            margin_usd = %order.margin_usd,
            "order open confirmed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orders::{load_order, save_order, Order, Side};
    use crate::queue::MemoryQueueBus;
    use crate::store::memory::MemoryBackend;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    async fn harness() -> (OpenWorker, StateStore, Arc<MemoryQueueBus>) {
        let store = StateStore::new(Arc::new(MemoryBackend::new()), 5, Duration::from_secs(30));
        let bus = Arc::new(MemoryQueueBus::new());
        (OpenWorker::new(store.clone(), bus.clone()), store, bus)
    }

    async fn seed(store: &StateStore) {
        store
            .hset(
                &keys::user_config("live", "1001"),
                &[
                    ("group".to_string(), "Standard".to_string()),
                    ("leverage".to_string(), "100".to_string()),
                    ("wallet_balance".to_string(), "10000".to_string()),
                    ("status".to_string(), "enabled".to_string()),
                    ("sending_orders".to_string(), "lp_main".to_string()),
                ],
            )
            .await
            .unwrap();
        store
            .hset(
                &keys::group_symbol("Standard", "EURUSD"),
                &[
                    ("type".to_string(), "1".to_string()),
                    ("contract_size".to_string(), "1000".to_string()),
                    ("profit".to_string(), "USD".to_string()),
                    ("spread".to_string(), "2".to_string()),
                    ("spread_pip".to_string(), "0.00001".to_string()),
                ],
            )
            .await
            .unwrap();
    }

    async fn seed_queued_order(store: &StateStore, order_id: &str, sl: Option<Decimal>) {
        let order = Order {
            order_id: order_id.into(),
            user_type: "live".into(),
            user_id: "1001".into(),
            symbol: "EURUSD".into(),
            side: Side::Buy,
            quantity: dec!(1),
            entry_price: dec!(1.2),
            margin_usd: dec!(12),
            commission_entry: dec!(0),
            commission_exit: dec!(0),
            stop_loss: sl,
            take_profit: None,
            status: OrderStatus::Queued,
            close_price: None,
            close_reason: None,
            created_ts_ms: 0,
            closed_ts_ms: None,
            finalized_ts_ms: None,
        };
        save_order(store, &order).await.unwrap();
        store
            .set(&keys::order_owner(order_id), "live:1001")
            .await
            .unwrap();
    }

    fn executed(order_id: &str, px: &str) -> ExecutionReport {
        ExecutionReport {
            order_id: order_id.into(),
            exec_id: format!("e-{order_id}"),
            ord_status: "EXECUTED".into(),
            avg_px: Some(px.into()),
            cum_qty: Some("1".into()),
            ts_ms: 0,
            raw: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn fill_finalizes_margin_and_holdings() {
        let (worker, store, bus) = harness().await;
        seed(&store).await;
        seed_queued_order(&store, "601", None).await;

        worker.handle(&executed("601", "1.20002")).await.unwrap();

        let order = load_order(&store, "live", "1001", "601").await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Open);
        assert_eq!(order.entry_price, dec!(1.20002));
        // (1000 * 1 * 1.20002) / 100
        assert_eq!(order.margin_usd, dec!(12.0002));

        let holders = store
            .smembers(&keys::symbol_holders("EURUSD", "live"))
            .await
            .unwrap();
        assert_eq!(holders, vec!["live:1001".to_string()]);

        let evt = bus
            .try_consume(crate::queue::ORDER_DB_UPDATE_QUEUE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(evt.body["type"], "order_opened");
    }

    #[tokio::test]
    async fn replay_is_a_noop() {
        let (worker, store, bus) = harness().await;
        seed(&store).await;
        seed_queued_order(&store, "602", None).await;

        worker.handle(&executed("602", "1.20002")).await.unwrap();
        // Drain the first event, then replay.
        bus.try_consume(crate::queue::ORDER_DB_UPDATE_QUEUE)
            .await
            .unwrap();
        worker.handle(&executed("602", "1.30000")).await.unwrap();

        // Price unchanged, no second persistence event.
        let order = load_order(&store, "live", "1001", "602").await.unwrap().unwrap();
        assert_eq!(order.entry_price, dec!(1.20002));
        assert!(bus
            .try_consume(crate::queue::ORDER_DB_UPDATE_QUEUE)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn open_arms_sl_trigger() {
        let (worker, store, _bus) = harness().await;
        seed(&store).await;
        seed_queued_order(&store, "603", Some(dec!(1.199))).await;

        worker.handle(&executed("603", "1.20002")).await.unwrap();

        let sl = store
            .zrangebyscore(&keys::sl_index("EURUSD", "BUY"), f64::MIN, f64::MAX)
            .await
            .unwrap();
        assert_eq!(sl.len(), 1);
        assert_eq!(sl[0].0, "603");
    }
}
