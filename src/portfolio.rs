//! Portfolio recalculator and autocutoff watcher.
//!
//! Symbol-moved events fan out to the affected accounts through the
//! `symbol_holders` sets; affected users land in an in-memory dirty set,
//! deduplicated, and a periodic flush recomputes margin, equity and free
//! margin per user, persisting a snapshot. Each flushed snapshot passes the
//! autocutoff watcher: an account whose margin level falls below the cutoff
//! gets its largest-losing position liquidated through the same close path
//! a user-initiated close takes. Context and close request are durable
//! before the liquidation is reported.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::groups;
use crate::margin::{self, PortfolioTotals};
use crate::orders::{close_context, ids, load_user_holdings, CloseReason, Side};
use crate::provider::ExecutionReport;
use crate::queue::{self, QueueBus, CLOSE_QUEUE};
use crate::store::{keys, StateStore};
use crate::users::{self, UserConfig};

pub const USER_TYPES: [&str; 2] = ["live", "demo"];

pub struct PortfolioRecalculator {
    store: StateStore,
    bus: Arc<dyn QueueBus>,
    flush_interval: Duration,
    /// Liquidate when equity / used_margin drops below this ratio.
    cutoff_level: Decimal,
    dirty: Mutex<HashMap<&'static str, HashSet<String>>>,
}

#[derive(Debug, Clone)]
pub struct FlushedUser {
    pub user_type: String,
    pub user_id: String,
    pub totals: PortfolioTotals,
    pub liquidated_order: Option<String>,
}

impl PortfolioRecalculator {
    pub fn new(
        store: StateStore,
        bus: Arc<dyn QueueBus>,
        flush_interval: Duration,
        cutoff_level: Decimal,
    ) -> Self {
        Self {
            store,
            bus,
            flush_interval,
            cutoff_level,
            dirty: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(self: Arc<Self>, moved: broadcast::Receiver<String>) {
        let this = self.clone();
        tokio::spawn(async move { this.collect(moved).await });

        let mut flush = tokio::time::interval(self.flush_interval);
        loop {
            flush.tick().await;
            if let Err(e) = self.flush_once().await {
                warn!(error = %e, "portfolio flush failed");
            }
        }
    }

    async fn collect(&self, mut moved: broadcast::Receiver<String>) {
        loop {
            match moved.recv().await {
                Ok(symbol) => {
                    if let Err(e) = self.mark_symbol_dirty(&symbol).await {
                        warn!(symbol, error = %e, "dirty-set update failed");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "portfolio listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Union the symbol's holders into the dirty set (deduplicating).
    pub async fn mark_symbol_dirty(&self, symbol: &str) -> Result<usize, EngineError> {
        let mut added = 0usize;
        for ut in USER_TYPES {
            let members = self
                .store
                .smembers(&keys::symbol_holders(symbol, ut))
                .await?;
            if members.is_empty() {
                continue;
            }
            let mut dirty = self.dirty.lock().unwrap();
            let bucket = dirty.entry(ut).or_default();
            for member in members {
                // Members are "ut:uid"; keep just the uid.
                let uid = member
                    .split_once(':')
                    .map(|(_, uid)| uid.to_string())
                    .unwrap_or(member);
                if bucket.insert(uid) {
                    added += 1;
                }
            }
        }
        Ok(added)
    }

    pub fn dirty_count(&self, user_type: &str) -> usize {
        self.dirty
            .lock()
            .unwrap()
            .get(user_type)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    fn drain_dirty(&self) -> Vec<(&'static str, String)> {
        let mut dirty = self.dirty.lock().unwrap();
        let mut out = Vec::new();
        for (ut, uids) in dirty.iter_mut() {
            for uid in uids.drain() {
                out.push((*ut, uid));
            }
        }
        out
    }

    /// Drain the dirty set and recompute every affected account.
    pub async fn flush_once(&self) -> Result<Vec<FlushedUser>, EngineError> {
        let batch = self.drain_dirty();
        let mut flushed = Vec::with_capacity(batch.len());
        for (ut, uid) in batch {
            match self.recompute_user(ut, &uid).await {
                Ok(Some(f)) => flushed.push(f),
                Ok(None) => {}
                Err(e) => warn!(user_type = ut, user_id = %uid, error = %e, "recompute failed"),
            }
        }
        Ok(flushed)
    }

    async fn recompute_user(
        &self,
        user_type: &str,
        user_id: &str,
    ) -> Result<Option<FlushedUser>, EngineError> {
        let user = match users::load_user_config(&self.store, user_type, user_id).await? {
            Some(u) => u,
            None => return Ok(None),
        };
        let totals =
            margin::compute_portfolio(&self.store, user_type, user_id, &user, None).await?;

        self.store
            .hset(
                &keys::user_portfolio(user_type, user_id),
                &[
                    ("used_margin_usd".to_string(), totals.used_margin_usd.to_string()),
                    ("unrealized_pnl".to_string(), totals.unrealized_pnl.to_string()),
                    ("equity".to_string(), totals.equity.to_string()),
                    ("free_margin".to_string(), totals.free_margin.to_string()),
                    (
                        "margin_level".to_string(),
                        totals
                            .margin_level
                            .map(|l| l.to_string())
                            .unwrap_or_default(),
                    ),
                    ("ts_ms".to_string(), Utc::now().timestamp_millis().to_string()),
                ],
            )
            .await?;

        let liquidated_order = self
            .check_autocutoff(user_type, user_id, &user, &totals)
            .await?;
        Ok(Some(FlushedUser {
            user_type: user_type.to_string(),
            user_id: user_id.to_string(),
            totals,
            liquidated_order,
        }))
    }

    /// Liquidates the largest-losing open position when the margin level is
    /// below the cutoff. Returns the liquidated order id, if any.
    async fn check_autocutoff(
        &self,
        user_type: &str,
        user_id: &str,
        user: &UserConfig,
        totals: &PortfolioTotals,
    ) -> Result<Option<String>, EngineError> {
        let level = match totals.margin_level {
            Some(l) => l,
            None => return Ok(None),
        };
        if level >= self.cutoff_level {
            return Ok(None);
        }

        let holdings = load_user_holdings(&self.store, user_type, user_id).await?;
        let mut worst: Option<(String, Decimal, Decimal)> = None; // (order_id, pnl, close_px)
        for h in &holdings {
            let (cfg, _) = groups::fetch_group(&self.store, &user.group, &h.symbol).await?;
            let px = self
                .store
                .hmget(&keys::market(&h.symbol), &["bid", "ask"])
                .await?;
            let bid: Option<Decimal> = px.first().and_then(|v| v.as_deref()).and_then(|v| v.parse().ok());
            let ask: Option<Decimal> = px.get(1).and_then(|v| v.as_deref()).and_then(|v| v.parse().ok());
            let (Some(bid), Some(ask)) = (bid, ask) else { continue };
            let pnl =
                margin::unrealized_pnl_for_holding(&self.store, &cfg, h, bid, ask, None).await?;
            let half_spread = cfg.half_spread().unwrap_or(Decimal::ZERO);
            let close_px = match h.side {
                Side::Buy => bid - half_spread,
                Side::Sell => ask + half_spread,
            };
            if worst.as_ref().map(|(_, w, _)| pnl < *w).unwrap_or(true) {
                worst = Some((h.order_id.clone(), pnl, close_px));
            }
        }
        let Some((order_id, pnl, close_px)) = worst else {
            return Ok(None);
        };

        warn!(
            user_type,
            user_id,
            margin_level = %level,
            order_id = %order_id,
            pnl = %pnl,
            "margin level below cutoff, liquidating"
        );

        // Durability order matters: context, then the close request; only
        // then is the liquidation considered reported. A crashing worker
        // replays from the queue.
        close_context::set_close_context(
            &self.store,
            &order_id,
            CloseReason::Autocutoff,
            &format!("liquidation_engine:{user_type}:{user_id}"),
        )
        .await?;
        let close_id = ids::generate_close_id(&self.store).await?;
        let report = ExecutionReport {
            order_id: order_id.clone(),
            exec_id: close_id,
            ord_status: "EXECUTED".to_string(),
            avg_px: Some(close_px.to_string()),
            cum_qty: None,
            ts_ms: Utc::now().timestamp_millis(),
            raw: serde_json::json!({"synthetic": true}),
        };
        let body =
            serde_json::to_value(&report).map_err(|e| EngineError::Malformed(e.to_string()))?;
        queue::publish(self.bus.as_ref(), CLOSE_QUEUE, body).await?;
        info!(order_id = %order_id, "autocutoff close enqueued");
        Ok(Some(order_id))
    }
}
