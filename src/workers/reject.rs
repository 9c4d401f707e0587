//! Reject worker.
//!
//! Applies `QUEUED → REJECTED`. A queued order never entered the holdings
//! mirror, so finalizing it is what releases the provisional margin the
//! admission check reserved against the account.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use crate::error::EngineError;
use crate::orders::{load_order_by_id, save_order, OrderStatus};
use crate::provider::ExecutionReport;
use crate::queue::{self, QueueBus, REJECT_QUEUE};
use crate::store::StateStore;
use crate::workers::ReportHandler;

pub struct RejectWorker {
    store: StateStore,
    bus: Arc<dyn QueueBus>,
}

impl RejectWorker {
    pub fn new(store: StateStore, bus: Arc<dyn QueueBus>) -> Self {
        Self { store, bus }
    }
}

#[async_trait]
impl ReportHandler for RejectWorker {
    fn queue(&self) -> &'static str {
        REJECT_QUEUE
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
        if order.status == OrderStatus::Rejected {
            info!(order_id = %order.order_id, "reject replay acked");
            return Ok(());
        }
        if order.status != OrderStatus::Queued {
            info!(
                order_id = %order.order_id,
                status = order.status.as_str(),
                "reject report against non-matching status, acking as replay"
            );
            return Ok(());
        }

        order.status = OrderStatus::Rejected;
        order.finalized_ts_ms = Some(Utc::now().timestamp_millis());
        save_order(&self.store, &order).await?;

        queue::publish_db_update(self.bus.as_ref(), order.post_image("order_rejected")).await?;
        info!(order_id = %order.order_id, "provider rejected order");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orders::{load_order, Order, Side};
    use crate::queue::MemoryQueueBus;
    use crate::store::memory::MemoryBackend;
    use crate::store::keys;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    #[tokio::test]
    async fn queued_order_is_finalized_without_holdings() {
        let store = StateStore::new(Arc::new(MemoryBackend::new()), 5, Duration::from_secs(30));
        let bus = Arc::new(MemoryQueueBus::new());
        let order = Order {
            order_id: "901".into(),
            user_type: "live".into(),
            user_id: "1001".into(),
            symbol: "EURUSD".into(),
            side: Side::Buy,
            quantity: dec!(1),
            entry_price: dec!(1.2),
            margin_usd: dec!(12),
            commission_entry: dec!(0),
            commission_exit: dec!(0),
            stop_loss: None,
            take_profit: None,
            status: OrderStatus::Queued,
            close_price: None,
            close_reason: None,
            created_ts_ms: 0,
            closed_ts_ms: None,
            finalized_ts_ms: None,
        };
        save_order(&store, &order).await.unwrap();
        store.set(&keys::order_owner("901"), "live:1001").await.unwrap();

        let worker = RejectWorker::new(store.clone(), bus.clone());
        let report = ExecutionReport {
            order_id: "901".into(),
            exec_id: "r-1".into(),
            ord_status: "REJECTED".into(),
            avg_px: None,
            cum_qty: None,
            ts_ms: 0,
            raw: serde_json::json!({}),
        };
        worker.handle(&report).await.unwrap();

        let rejected = load_order(&store, "live", "1001", "901").await.unwrap().unwrap();
        assert_eq!(rejected.status, OrderStatus::Rejected);
        assert!(rejected.finalized_ts_ms.is_some());

        // No symbol membership was ever added for the queued order.
        let holders = store
            .smembers(&keys::symbol_holders("EURUSD", "live"))
            .await
            .unwrap();
        assert!(holders.is_empty());

        let evt = bus
            .try_consume(crate::queue::ORDER_DB_UPDATE_QUEUE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(evt.body["type"], "order_rejected");

        // Terminal replay is a no-op.
        worker.handle(&report).await.unwrap();
        assert!(bus
            .try_consume(crate::queue::ORDER_DB_UPDATE_QUEUE)
            .await
            .unwrap()
            .is_none());
    }
}
