//! Price-driven trigger engine.
//!
//! Subscribes to symbol-moved notifications and scans the armed stop-loss,
//! take-profit and pending-activation indexes for levels the new raw price
//! has crossed (touch or gap-through both count). A crossed order is moved
//! out of its index first (the `zrem` is the claim), then turned into a
//! close (or activation) intent: close context written, synthetic EXECUTED
//! report enqueued exactly as if the provider had answered, except that
//! local-routing accounts apply the transition directly.
//!
//! Exactly one leader runs per symbol partition, elected through a lease in
//! the state store and renewed at half the TTL.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::groups;
use crate::market::MarketSnapshot;
use crate::orders::{
    close_context, ids, load_order_by_id, CloseReason, OrderStatus, Side,
};
#[cfg(test)]
use crate::orders::{sl_tp, Order};
use crate::provider::ExecutionReport;
use crate::queue::{self, QueueBus, CLOSE_QUEUE, OPEN_QUEUE};
use crate::store::{keys, StateStore};
use crate::users;
use crate::workers::close::CloseWorker;
use crate::workers::open::OpenWorker;
use crate::workers::ReportHandler;

const LEASE_TTL_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    StopLoss,
    TakeProfit,
    PendingActivation,
}

#[derive(Debug, Clone)]
pub struct FiredTrigger {
    pub order_id: String,
    pub kind: TriggerKind,
    pub score: f64,
}

pub struct TriggerMonitor {
    store: StateStore,
    bus: Arc<dyn QueueBus>,
    close_worker: Arc<CloseWorker>,
    open_worker: Arc<OpenWorker>,
    partition: String,
    lease_id: String,
}

impl TriggerMonitor {
    pub fn new(
        store: StateStore,
        bus: Arc<dyn QueueBus>,
        close_worker: Arc<CloseWorker>,
        open_worker: Arc<OpenWorker>,
        partition: String,
    ) -> Self {
        Self {
            store,
            bus,
            close_worker,
            open_worker,
            partition,
            lease_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Acquire or renew the partition lease. Only the leader scans.
    async fn hold_lease(&self) -> Result<bool, EngineError> {
        let key = keys::trigger_leader(&self.partition);
        if self
            .store
            .set_nx_ex(&key, &self.lease_id, LEASE_TTL_SECS)
            .await?
        {
            return Ok(true);
        }
        match self.store.get(&key).await? {
            Some(holder) if holder == self.lease_id => {
                self.store.expire(&key, LEASE_TTL_SECS).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub async fn run(self: Arc<Self>, mut moved: broadcast::Receiver<String>) {
        let mut renew = tokio::time::interval(Duration::from_secs(LEASE_TTL_SECS / 2));
        let mut is_leader = false;
        loop {
            tokio::select! {
                _ = renew.tick() => {
                    match self.hold_lease().await {
                        Ok(lead) => {
                            if lead != is_leader {
                                info!(partition = %self.partition, leader = lead, "trigger leadership changed");
                            }
                            is_leader = lead;
                        }
                        Err(e) => warn!(error = %e, "lease renewal failed"),
                    }
                }
                sym = moved.recv() => {
                    match sym {
                        Ok(symbol) if is_leader => {
                            if let Err(e) = self.scan_symbol(&symbol).await {
                                warn!(symbol, error = %e, "trigger scan failed");
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(missed = n, "trigger monitor lagged behind tick stream");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    }

    /// One scan pass for a moved symbol. Returns what fired, in firing
    /// order, for observability and tests.
    pub async fn scan_symbol(&self, symbol: &str) -> Result<Vec<FiredTrigger>, EngineError> {
        let snap = match self.market(symbol).await? {
            Some(s) => s,
            None => return Ok(Vec::new()),
        };
        // Synthetic warmup quotes never execute anything.
        if !snap.source.is_tradable() {
            return Ok(Vec::new());
        }
        let bid = dec_to_f64(snap.bid);
        let ask = dec_to_f64(snap.ask);
        let mut fired = Vec::new();

        // Stop-loss of a BUY fires when bid drops to the score; the member
        // closest to the crossing point (lowest score >= bid) goes first.
        let hits = self
            .store
            .zrangebyscore(&keys::sl_index(symbol, "BUY"), bid, f64::MAX)
            .await?;
        for (order_id, score) in hits {
            self.fire_close(&mut fired, symbol, &order_id, score, TriggerKind::StopLoss, Side::Buy, &snap)
                .await?;
        }

        // Stop-loss of a SELL fires when ask rises to the score; highest
        // score <= ask goes first.
        let mut hits = self
            .store
            .zrangebyscore(&keys::sl_index(symbol, "SELL"), f64::MIN, ask)
            .await?;
        hits.reverse();
        for (order_id, score) in hits {
            self.fire_close(&mut fired, symbol, &order_id, score, TriggerKind::StopLoss, Side::Sell, &snap)
                .await?;
        }

        // Take-profit of a BUY fires when bid rises to the score.
        let mut hits = self
            .store
            .zrangebyscore(&keys::tp_index(symbol, "BUY"), f64::MIN, bid)
            .await?;
        hits.reverse();
        for (order_id, score) in hits {
            self.fire_close(&mut fired, symbol, &order_id, score, TriggerKind::TakeProfit, Side::Buy, &snap)
                .await?;
        }

        // Take-profit of a SELL fires when ask drops to the score.
        let hits = self
            .store
            .zrangebyscore(&keys::tp_index(symbol, "SELL"), ask, f64::MAX)
            .await?;
        for (order_id, score) in hits {
            self.fire_close(&mut fired, symbol, &order_id, score, TriggerKind::TakeProfit, Side::Sell, &snap)
                .await?;
        }

        // Pending BUY activates when ask reaches the level; pending SELL
        // when bid does. Gap-through counts as a cross.
        let hits = self
            .store
            .zrangebyscore(&keys::pending_index(symbol, "BUY"), ask, f64::MAX)
            .await?;
        for (order_id, score) in hits {
            self.fire_activation(&mut fired, symbol, &order_id, score, Side::Buy, &snap)
                .await?;
        }
        let mut hits = self
            .store
            .zrangebyscore(&keys::pending_index(symbol, "SELL"), f64::MIN, bid)
            .await?;
        hits.reverse();
        for (order_id, score) in hits {
            self.fire_activation(&mut fired, symbol, &order_id, score, Side::Sell, &snap)
                .await?;
        }

        Ok(fired)
    }

    async fn market(&self, symbol: &str) -> Result<Option<MarketSnapshot>, EngineError> {
        let h = self.store.hgetall(&keys::market(symbol)).await?;
        if h.is_empty() {
            return Ok(None);
        }
        Ok(MarketSnapshot::from_hash(&h))
    }

    async fn fire_close(
        &self,
        fired: &mut Vec<FiredTrigger>,
        symbol: &str,
        order_id: &str,
        score: f64,
        kind: TriggerKind,
        index_side: Side,
        snap: &MarketSnapshot,
    ) -> Result<(), EngineError> {
        // The zrem is the claim; losing the race means another leader owns
        // this firing.
        let index_key = match kind {
            TriggerKind::StopLoss => keys::sl_index(symbol, index_side.as_str()),
            TriggerKind::TakeProfit => keys::tp_index(symbol, index_side.as_str()),
            TriggerKind::PendingActivation => unreachable!(),
        };
        if !self.store.zrem(&index_key, order_id).await? {
            return Ok(());
        }

        let order = match load_order_by_id(&self.store, order_id).await? {
            Some(o) if o.status == OrderStatus::Open => o,
            Some(o) => {
                warn!(order_id, status = o.status.as_str(), "armed trigger on non-open order");
                return Ok(());
            }
            None => {
                warn!(order_id, "armed trigger without order");
                return Ok(());
            }
        };

        let user = users::load_user_config(&self.store, &order.user_type, &order.user_id)
            .await?
            .ok_or(EngineError::InvalidUserStatus)?;
        let (cfg, _) = groups::fetch_group(&self.store, &user.group, symbol).await?;
        let half_spread = cfg.half_spread().unwrap_or(Decimal::ZERO);
        let close_price = match order.side {
            Side::Buy => snap.bid - half_spread,
            Side::Sell => snap.ask + half_spread,
        };

        // Claim the order itself before anything durable goes out.
        self.store
            .hset(
                &keys::order_data(&order.user_type, &order.user_id, &order.order_id),
                &[("status".to_string(), OrderStatus::Closing.as_str().to_string())],
            )
            .await?;

        let reason = match kind {
            TriggerKind::StopLoss => CloseReason::StoplossHit,
            TriggerKind::TakeProfit => CloseReason::TakeprofitHit,
            TriggerKind::PendingActivation => unreachable!(),
        };
        close_context::set_close_context(&self.store, order_id, reason, "trigger_engine").await?;

        let close_id = ids::generate_close_id(&self.store).await?;
        let report = synthetic_report(order_id, &close_id, close_price);

        if user.routing.is_local() {
            self.close_worker.handle(&report).await?;
        } else {
            let body = serde_json::to_value(&report)
                .map_err(|e| EngineError::Malformed(e.to_string()))?;
            queue::publish(self.bus.as_ref(), CLOSE_QUEUE, body).await?;
        }

        info!(
            order_id,
            symbol,
            kind = ?kind,
            score,
            close_price = %close_price,
            "trigger fired"
        );
        fired.push(FiredTrigger {
            order_id: order_id.to_string(),
            kind,
            score,
        });
        Ok(())
    }

    async fn fire_activation(
        &self,
        fired: &mut Vec<FiredTrigger>,
        symbol: &str,
        order_id: &str,
        score: f64,
        index_side: Side,
        snap: &MarketSnapshot,
    ) -> Result<(), EngineError> {
        let index_key = keys::pending_index(symbol, index_side.as_str());
        if !self.store.zrem(&index_key, order_id).await? {
            return Ok(());
        }
        let order = match load_order_by_id(&self.store, order_id).await? {
            Some(o) if o.status == OrderStatus::Pending => o,
            _ => return Ok(()),
        };
        let user = users::load_user_config(&self.store, &order.user_type, &order.user_id)
            .await?
            .ok_or(EngineError::InvalidUserStatus)?;
        let (cfg, _) = groups::fetch_group(&self.store, &user.group, symbol).await?;
        let half_spread = cfg.half_spread().unwrap_or(Decimal::ZERO);
        let fill_price = match order.side {
            Side::Buy => snap.ask + half_spread,
            Side::Sell => snap.bid - half_spread,
        };
        self.store
            .hdel(&keys::order_triggers(order_id), &["pending_level"])
            .await?;

        let report = synthetic_report(order_id, &format!("ACT{order_id}"), fill_price);
        if user.routing.is_local() {
            self.open_worker.handle(&report).await?;
        } else {
            let body = serde_json::to_value(&report)
                .map_err(|e| EngineError::Malformed(e.to_string()))?;
            queue::publish(self.bus.as_ref(), OPEN_QUEUE, body).await?;
        }

        info!(order_id, symbol, score, fill_price = %fill_price, "pending order activated");
        fired.push(FiredTrigger {
            order_id: order_id.to_string(),
            kind: TriggerKind::PendingActivation,
            score,
        });
        Ok(())
    }
}

fn synthetic_report(order_id: &str, exec_id: &str, px: Decimal) -> ExecutionReport {
    ExecutionReport {
        order_id: order_id.to_string(),
        exec_id: exec_id.to_string(),
        ord_status: "EXECUTED".to_string(),
        avg_px: Some(px.to_string()),
        cum_qty: None,
        ts_ms: Utc::now().timestamp_millis(),
        raw: serde_json::json!({"synthetic": true}),
    }
}

fn dec_to_f64(d: Decimal) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    d.to_f64().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{DecodedTick, MarketCache};
    use crate::orders::{load_order, save_order};
    use crate::queue::MemoryQueueBus;
    use crate::store::memory::MemoryBackend;
    use rust_decimal_macros::dec;

    struct Harness {
        store: StateStore,
        bus: Arc<MemoryQueueBus>,
        monitor: Arc<TriggerMonitor>,
        cache: MarketCache,
    }

    async fn harness() -> Harness {
        let store = StateStore::new(Arc::new(MemoryBackend::new()), 5, Duration::from_secs(30));
        let bus: Arc<MemoryQueueBus> = Arc::new(MemoryQueueBus::new());
        let close_worker = Arc::new(CloseWorker::new(store.clone(), bus.clone()));
        let open_worker = Arc::new(OpenWorker::new(store.clone(), bus.clone()));
        let monitor = Arc::new(TriggerMonitor::new(
            store.clone(),
            bus.clone(),
            close_worker,
            open_worker,
            "p0".to_string(),
        ));
        let cache = MarketCache::new(store.clone(), Duration::from_secs(60), None);
        Harness { store, bus, monitor, cache }
    }

    async fn seed(h: &Harness, routing: &str) {
        h.store
            .hset(
                &keys::user_config("live", "1001"),
                &[
                    ("group".to_string(), "Standard".to_string()),
                    ("leverage".to_string(), "100".to_string()),
                    ("wallet_balance".to_string(), "10000".to_string()),
                    ("status".to_string(), "enabled".to_string()),
                    ("sending_orders".to_string(), routing.to_string()),
                ],
            )
            .await
            .unwrap();
        h.store
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

    async fn seed_armed_buy(h: &Harness, order_id: &str, sl_user: Decimal, sl_score: Decimal) {
        let order = Order {
            order_id: order_id.into(),
            user_type: "live".into(),
            user_id: "1001".into(),
            symbol: "EURUSD".into(),
            side: Side::Buy,
            quantity: dec!(1),
            entry_price: dec!(1.20001),
            margin_usd: dec!(12.0001),
            commission_entry: dec!(0),
            commission_exit: dec!(0),
            stop_loss: Some(sl_user),
            take_profit: None,
            status: OrderStatus::Open,
            close_price: None,
            close_reason: None,
            created_ts_ms: 0,
            closed_ts_ms: None,
            finalized_ts_ms: None,
        };
        save_order(&h.store, &order).await.unwrap();
        h.store
            .set(&keys::order_owner(order_id), "live:1001")
            .await
            .unwrap();
        h.store
            .pipeline(crate::orders::holdings_add_ops(&order))
            .await
            .unwrap();
        sl_tp::upsert_order_triggers(
            &h.store,
            order_id,
            "EURUSD",
            Side::Buy,
            "live",
            "1001",
            Some(sl_tp::TriggerLevel { user: sl_user, score: sl_score }),
            None,
        )
        .await
        .unwrap();
    }

    async fn tick(h: &Harness, bid: Decimal, ask: Decimal) {
        h.cache
            .ingest(DecodedTick {
                symbol: "EURUSD".into(),
                bid: Some(bid),
                ask: Some(ask),
                source_ts_ms: Utc::now().timestamp_millis(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stop_loss_cross_closes_local_order_end_to_end() {
        let h = harness().await;
        seed(&h, "local").await;
        seed_armed_buy(&h, "1101", dec!(1.19900), dec!(1.19901)).await;
        tick(&h, dec!(1.19899), dec!(1.19909)).await;

        let fired = h.monitor.scan_symbol("EURUSD").await.unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].kind, TriggerKind::StopLoss);
        assert_eq!(fired[0].order_id, "1101");

        // Local routing: the close was applied directly.
        let order = load_order(&h.store, "live", "1001", "1101").await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Closed);
        assert_eq!(order.close_reason, Some(CloseReason::StoplossHit));
        let holders = h
            .store
            .smembers(&keys::symbol_holders("EURUSD", "live"))
            .await
            .unwrap();
        assert!(holders.is_empty());
        let sl = h
            .store
            .zrangebyscore(&keys::sl_index("EURUSD", "BUY"), f64::MIN, f64::MAX)
            .await
            .unwrap();
        assert!(sl.is_empty());
    }

    #[tokio::test]
    async fn provider_order_close_is_enqueued_not_applied() {
        let h = harness().await;
        seed(&h, "lp_main").await;
        seed_armed_buy(&h, "1102", dec!(1.19900), dec!(1.19901)).await;
        tick(&h, dec!(1.19899), dec!(1.19909)).await;

        let fired = h.monitor.scan_symbol("EURUSD").await.unwrap();
        assert_eq!(fired.len(), 1);

        // The order is claimed as CLOSING and a synthetic report waits on
        // the close queue.
        let order = load_order(&h.store, "live", "1001", "1102").await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Closing);
        let msg = h.bus.try_consume(CLOSE_QUEUE).await.unwrap().unwrap();
        assert_eq!(msg.body["order_id"], "1102");
        assert_eq!(msg.body["ord_status"], "EXECUTED");
        // Context is armed for the close worker.
        let ctx = close_context::get_close_context(&h.store, "1102").await.unwrap().unwrap();
        assert_eq!(ctx.context, CloseReason::StoplossHit);
    }

    #[tokio::test]
    async fn uncrossed_levels_stay_armed() {
        let h = harness().await;
        seed(&h, "local").await;
        seed_armed_buy(&h, "1103", dec!(1.19900), dec!(1.19901)).await;
        tick(&h, dec!(1.19950), dec!(1.19960)).await;

        let fired = h.monitor.scan_symbol("EURUSD").await.unwrap();
        assert!(fired.is_empty());
        let sl = h
            .store
            .zrangebyscore(&keys::sl_index("EURUSD", "BUY"), f64::MIN, f64::MAX)
            .await
            .unwrap();
        assert_eq!(sl.len(), 1);
    }

    #[tokio::test]
    async fn closest_crossing_fires_first() {
        let h = harness().await;
        seed(&h, "local").await;
        seed_armed_buy(&h, "1104", dec!(1.19910), dec!(1.19911)).await;
        seed_armed_buy(&h, "1105", dec!(1.19900), dec!(1.19901)).await;
        tick(&h, dec!(1.19890), dec!(1.19990)).await;

        let fired = h.monitor.scan_symbol("EURUSD").await.unwrap();
        assert_eq!(fired.len(), 2);
        // SL-BUY processes ascending score: 1.19901 before 1.19911.
        assert_eq!(fired[0].order_id, "1105");
        assert_eq!(fired[1].order_id, "1104");
    }

    #[tokio::test]
    async fn gap_through_counts_as_cross_for_pending() {
        let h = harness().await;
        seed(&h, "lp_main").await;
        let order = Order {
            order_id: "1106".into(),
            user_type: "live".into(),
            user_id: "1001".into(),
            symbol: "EURUSD".into(),
            side: Side::Buy,
            quantity: dec!(1),
            entry_price: dec!(1.19500),
            margin_usd: dec!(12),
            commission_entry: dec!(0),
            commission_exit: dec!(0),
            stop_loss: None,
            take_profit: None,
            status: OrderStatus::Pending,
            close_price: None,
            close_reason: None,
            created_ts_ms: 0,
            closed_ts_ms: None,
            finalized_ts_ms: None,
        };
        save_order(&h.store, &order).await.unwrap();
        h.store.set(&keys::order_owner("1106"), "live:1001").await.unwrap();
        sl_tp::register_pending_activation(
            &h.store, "1106", "EURUSD", Side::Buy, "live", "1001", dec!(1.19500),
        )
        .await
        .unwrap();

        // Market gaps far past the level without touching it.
        tick(&h, dec!(1.19390), dec!(1.19400)).await;
        let fired = h.monitor.scan_symbol("EURUSD").await.unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].kind, TriggerKind::PendingActivation);
        let msg = h.bus.try_consume(OPEN_QUEUE).await.unwrap().unwrap();
        assert_eq!(msg.body["order_id"], "1106");
    }
}
