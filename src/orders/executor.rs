//! Instant-order executor, the only place orders are born.
//!
//! Validates the request, reserves the idempotency key, prices and
//! margin-checks the order, then either finalizes it locally (OPEN) or
//! stages it for the provider (QUEUED). Every failure gate surfaces a
//! stable reason code; the stored idempotency response never contains the
//! provider payload.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::EngineError;
use crate::groups;
use crate::margin;
use crate::orders::{
    holdings_add_ops, ids::OrderIdGenerator, sl_tp, sl_tp::TriggerLevel, Order, OrderStatus, Side,
};
use crate::pricing;
use crate::queue::{self, QueueBus};
use crate::store::{keys, KvOp, StateStore};
use crate::users::{self, OrderRouting};

const IDEM_PLACEHOLDER: &str = "__reserved__";
/// TTL must outlive the provider round-trip budget.
const IDEM_TTL_SECS: u64 = 15 * 60;

#[derive(Debug, Clone)]
pub struct InstantOrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_price: Decimal,
    pub order_quantity: Decimal,
    pub user_id: String,
    pub user_type: String,
    pub idempotency_key: Option<String>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstantOrderResponse {
    pub ok: bool,
    pub order_id: String,
    pub order_status: String,
    pub flow: String,
    pub exec_price: String,
    pub margin_usd: String,
}

/// What gets dispatched to the provider for non-local routing. Returned to
/// the HTTP layer so the send happens off the caller's critical path; never
/// stored under the idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderOrderPayload {
    pub order_id: String,
    pub user_id: String,
    pub user_type: String,
    pub symbol: String,
    pub side: String,
    pub quantity: String,
    pub price: String,
    pub idempotency_key: Option<String>,
    pub ts_ms: i64,
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub response: InstantOrderResponse,
    pub provider_payload: Option<ProviderOrderPayload>,
    /// True when the response was replayed from the idempotency record.
    pub replayed: bool,
}

pub struct OrderExecutor {
    store: StateStore,
    bus: Arc<dyn QueueBus>,
    ids: OrderIdGenerator,
    http: Option<reqwest::Client>,
    db_fallback_url: String,
}

impl OrderExecutor {
    pub fn new(store: StateStore, bus: Arc<dyn QueueBus>, worker_id: u16) -> Self {
        Self {
            store,
            bus,
            ids: OrderIdGenerator::new(worker_id),
            http: None,
            db_fallback_url: String::new(),
        }
    }

    /// Enables the group-config DB fallback over the internal provider
    /// endpoint; without it only the cluster cache is consulted.
    pub fn with_db_fallback(mut self, client: reqwest::Client, url: impl Into<String>) -> Self {
        self.http = Some(client);
        self.db_fallback_url = url.into();
        self
    }

    pub async fn execute_instant_order(
        &self,
        req: InstantOrderRequest,
    ) -> Result<ExecutionOutcome, EngineError> {
        if req.order_quantity <= Decimal::ZERO {
            return Err(EngineError::Malformed(
                "order_quantity must be positive".into(),
            ));
        }

        // 1. Idempotency reservation. SET NX is the only creation path, so
        //    at most one executor owns a given client key.
        let idem_key = req
            .idempotency_key
            .as_ref()
            .map(|k| keys::idempotency(&req.user_type, &req.user_id, k));
        if let Some(key) = &idem_key {
            let reserved = self
                .store
                .set_nx_ex(key, IDEM_PLACEHOLDER, IDEM_TTL_SECS)
                .await?;
            if !reserved {
                match self.store.get(key).await? {
                    Some(v) if v == IDEM_PLACEHOLDER => {
                        return Err(EngineError::IdempotencyInProgress)
                    }
                    Some(v) => {
                        let response: InstantOrderResponse = serde_json::from_str(&v)
                            .map_err(|e| EngineError::Malformed(e.to_string()))?;
                        info!(
                            order_id = %response.order_id,
                            user_id = %req.user_id,
                            "idempotent replay"
                        );
                        return Ok(ExecutionOutcome {
                            response,
                            provider_payload: None,
                            replayed: true,
                        });
                    }
                    // Record expired between SET NX and GET; treat as in
                    // flight rather than double-execute.
                    None => return Err(EngineError::IdempotencyInProgress),
                }
            }
        }

        let result = self.admit_and_write(&req).await;
        match result {
            Ok(outcome) => {
                if let Some(key) = &idem_key {
                    let body = serde_json::to_string(&outcome.response)
                        .map_err(|e| EngineError::Malformed(e.to_string()))?;
                    self.store.set_ex(key, &body, IDEM_TTL_SECS).await?;
                }
                Ok(outcome)
            }
            Err(e) => {
                // Pre-commit failure: drop the placeholder so the client can
                // retry with the same key.
                if let Some(key) = &idem_key {
                    let _ = self.store.del(key).await;
                }
                Err(e)
            }
        }
    }

    async fn admit_and_write(
        &self,
        req: &InstantOrderRequest,
    ) -> Result<ExecutionOutcome, EngineError> {
        // 2. Account gates.
        let user = users::load_user_config(&self.store, &req.user_type, &req.user_id)
            .await?
            .ok_or(EngineError::InvalidUserStatus)?;
        if !user.enabled {
            return Err(EngineError::InvalidUserStatus);
        }
        if user.leverage <= Decimal::ZERO {
            return Err(EngineError::InvalidLeverage);
        }

        let (cfg, group_used) = groups::get_group_config_with_fallback(
            &self.store,
            self.http.as_ref(),
            &self.db_fallback_url,
            &user.group,
            &req.symbol,
        )
        .await?;
        if !cfg.has_margin_fields() {
            return Err(EngineError::MissingGroupConfig {
                group: group_used,
                symbol: req.symbol.to_uppercase(),
            });
        }

        // 3. Routing decision.
        match &user.routing {
            OrderRouting::Local => self.execute_local(req, &user, &cfg, &group_used).await,
            OrderRouting::Provider(provider) => {
                self.stage_for_provider(req, &user, &cfg, &group_used, provider)
                    .await
            }
        }
    }

    async fn check_free_margin(
        &self,
        req: &InstantOrderRequest,
        user: &crate::users::UserConfig,
        order_margin: Decimal,
    ) -> Result<(), EngineError> {
        let portfolio = margin::compute_portfolio(
            &self.store,
            &req.user_type,
            &req.user_id,
            user,
            None,
        )
        .await?;
        let free_after = portfolio.free_margin - order_margin;
        if free_after < Decimal::ZERO {
            warn!(
                user_id = %req.user_id,
                symbol = %req.symbol,
                required = %order_margin,
                available = %portfolio.free_margin,
                "order rejected on margin"
            );
            return Err(EngineError::InsufficientMargin {
                required: order_margin.to_string(),
                available: portfolio.free_margin.to_string(),
            });
        }
        Ok(())
    }

    // 4. Local path: price, margin-check, finalize OPEN synchronously.
    async fn execute_local(
        &self,
        req: &InstantOrderRequest,
        user: &crate::users::UserConfig,
        cfg: &groups::GroupConfig,
        group_used: &str,
    ) -> Result<ExecutionOutcome, EngineError> {
        let quote =
            pricing::execution_price(&self.store, &user.group, &req.symbol, req.side).await?;
        let margin_usd = margin::compute_single_order_margin(
            &self.store,
            cfg,
            group_used,
            &req.symbol,
            req.order_quantity,
            quote.exec_price,
            user.leverage,
            None,
        )
        .await?;
        self.check_free_margin(req, user, margin_usd).await?;
        let commission_entry =
            margin::compute_entry_commission(cfg, req.order_quantity, quote.exec_price);

        let order = Order {
            order_id: self.ids.next(),
            user_type: req.user_type.clone(),
            user_id: req.user_id.clone(),
            symbol: req.symbol.to_uppercase(),
            side: req.side,
            quantity: req.order_quantity,
            entry_price: quote.exec_price,
            margin_usd,
            commission_entry,
            commission_exit: Decimal::ZERO,
            stop_loss: req.stop_loss,
            take_profit: req.take_profit,
            status: OrderStatus::Open,
            close_price: None,
            close_reason: None,
            created_ts_ms: Utc::now().timestamp_millis(),
            closed_ts_ms: None,
            finalized_ts_ms: None,
        };

        let mut ops = vec![
            KvOp::Hset {
                key: keys::order_data(&order.user_type, &order.user_id, &order.order_id),
                fields: order.to_fields(),
            },
            KvOp::Set {
                key: keys::order_owner(&order.order_id),
                value: order.partition(),
            },
        ];
        ops.extend(holdings_add_ops(&order));
        self.store.pipeline(ops).await?;

        if req.stop_loss.is_some() || req.take_profit.is_some() {
            sl_tp::upsert_order_triggers(
                &self.store,
                &order.order_id,
                &order.symbol,
                order.side,
                &order.user_type,
                &order.user_id,
                req.stop_loss
                    .map(|sl| TriggerLevel::from_user(order.side, sl, quote.half_spread)),
                req.take_profit
                    .map(|tp| TriggerLevel::from_user(order.side, tp, quote.half_spread)),
            )
            .await?;
        }

        queue::publish_db_update(self.bus.as_ref(), order.post_image("order_opened")).await?;
        info!(
            order_id = %order.order_id,
            user_id = %order.user_id,
            symbol = %order.symbol,
            side = order.side.as_str(),
            exec_price = %order.entry_price,
            margin_usd = %order.margin_usd,
            "local order opened"
        );

        Ok(ExecutionOutcome {
            response: InstantOrderResponse {
                ok: true,
                order_id: order.order_id.clone(),
                order_status: order.status.as_str().to_string(),
                flow: "local".to_string(),
                exec_price: order.entry_price.to_string(),
                margin_usd: order.margin_usd.to_string(),
            },
            provider_payload: None,
            replayed: false,
        })
    }

    // 5. Provider path: preliminary margin against the requested price,
    //    durable QUEUED record, payload handed back for async dispatch.
    async fn stage_for_provider(
        &self,
        req: &InstantOrderRequest,
        user: &crate::users::UserConfig,
        cfg: &groups::GroupConfig,
        group_used: &str,
        provider: &str,
    ) -> Result<ExecutionOutcome, EngineError> {
        let preliminary_margin = margin::compute_single_order_margin(
            &self.store,
            cfg,
            group_used,
            &req.symbol,
            req.order_quantity,
            req.order_price,
            user.leverage,
            None,
        )
        .await?;
        self.check_free_margin(req, user, preliminary_margin).await?;

        let order = Order {
            order_id: self.ids.next(),
            user_type: req.user_type.clone(),
            user_id: req.user_id.clone(),
            symbol: req.symbol.to_uppercase(),
            side: req.side,
            quantity: req.order_quantity,
            entry_price: req.order_price,
            margin_usd: preliminary_margin,
            commission_entry: Decimal::ZERO,
            commission_exit: Decimal::ZERO,
            stop_loss: req.stop_loss,
            take_profit: req.take_profit,
            status: OrderStatus::Queued,
            close_price: None,
            close_reason: None,
            created_ts_ms: Utc::now().timestamp_millis(),
            closed_ts_ms: None,
            finalized_ts_ms: None,
        };

        self.store
            .pipeline(vec![
                KvOp::Hset {
                    key: keys::order_data(&order.user_type, &order.user_id, &order.order_id),
                    fields: order.to_fields(),
                },
                KvOp::Set {
                    key: keys::order_owner(&order.order_id),
                    value: order.partition(),
                },
            ])
            .await?;
        queue::publish_db_update(self.bus.as_ref(), order.post_image("order_queued")).await?;
        info!(
            order_id = %order.order_id,
            user_id = %order.user_id,
            symbol = %order.symbol,
            provider,
            "order staged for provider"
        );

        Ok(ExecutionOutcome {
            response: InstantOrderResponse {
                ok: true,
                order_id: order.order_id.clone(),
                order_status: order.status.as_str().to_string(),
                flow: "provider".to_string(),
                exec_price: order.entry_price.to_string(),
                margin_usd: order.margin_usd.to_string(),
            },
            provider_payload: Some(ProviderOrderPayload {
                order_id: order.order_id,
                user_id: req.user_id.clone(),
                user_type: req.user_type.clone(),
                symbol: req.symbol.to_uppercase(),
                side: req.side.as_str().to_string(),
                quantity: req.order_quantity.to_string(),
                price: req.order_price.to_string(),
                idempotency_key: req.idempotency_key.clone(),
                ts_ms: Utc::now().timestamp_millis(),
            }),
            replayed: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orders::load_order;
    use crate::queue::MemoryQueueBus;
    use crate::store::memory::MemoryBackend;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    async fn harness() -> (OrderExecutor, StateStore, Arc<MemoryQueueBus>) {
        let store = StateStore::new(Arc::new(MemoryBackend::new()), 5, Duration::from_secs(30));
        let bus = Arc::new(MemoryQueueBus::new());
        let exec = OrderExecutor::new(store.clone(), bus.clone(), 1);
        (exec, store, bus)
    }

    async fn seed_user(store: &StateStore, wallet: &str, routing: &str) {
        store
            .hset(
                &keys::user_config("live", "1001"),
                &[
                    ("group".to_string(), "Standard".to_string()),
                    ("leverage".to_string(), "100".to_string()),
                    ("wallet_balance".to_string(), wallet.to_string()),
                    ("status".to_string(), "enabled".to_string()),
                    ("sending_orders".to_string(), routing.to_string()),
                ],
            )
            .await
            .unwrap();
    }

    async fn seed_group_and_market(store: &StateStore) {
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
        store
            .hset(
                &keys::market("EURUSD"),
                &[
                    ("bid".to_string(), "1.19990".to_string()),
                    ("ask".to_string(), "1.20000".to_string()),
                    ("ts_ms".to_string(), "1700000000000".to_string()),
                    ("source".to_string(), "feed".to_string()),
                ],
            )
            .await
            .unwrap();
    }

    fn buy_request(idem: Option<&str>) -> InstantOrderRequest {
        InstantOrderRequest {
            symbol: "EURUSD".into(),
            side: Side::Buy,
            order_price: dec!(1.2),
            order_quantity: dec!(1),
            user_id: "1001".into(),
            user_type: "live".into(),
            idempotency_key: idem.map(String::from),
            stop_loss: None,
            take_profit: None,
        }
    }

    #[tokio::test]
    async fn local_buy_opens_with_seed_numbers() {
        let (exec, store, bus) = harness().await;
        seed_user(&store, "10000", "local").await;
        seed_group_and_market(&store).await;

        let out = exec.execute_instant_order(buy_request(None)).await.unwrap();
        assert_eq!(out.response.flow, "local");
        assert_eq!(out.response.order_status, "OPEN");
        assert_eq!(out.response.exec_price.parse::<Decimal>().unwrap(), dec!(1.20001));
        assert_eq!(out.response.margin_usd.parse::<Decimal>().unwrap(), dec!(12.0001));
        assert!(out.provider_payload.is_none());

        let order = load_order(&store, "live", "1001", &out.response.order_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(order.status, OrderStatus::Open);
        assert_eq!(order.entry_price, dec!(1.20001));

        // Symbol membership present, no trigger-index entries.
        let holders = store
            .smembers(&keys::symbol_holders("EURUSD", "live"))
            .await
            .unwrap();
        assert_eq!(holders, vec!["live:1001".to_string()]);
        let sl = store
            .zrangebyscore(&keys::sl_index("EURUSD", "BUY"), f64::MIN, f64::MAX)
            .await
            .unwrap();
        assert!(sl.is_empty());

        // A persistence event went out.
        let evt = bus
            .try_consume(crate::queue::ORDER_DB_UPDATE_QUEUE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(evt.body["type"], "order_opened");
    }

    #[tokio::test]
    async fn insufficient_margin_writes_nothing() {
        let (exec, store, _bus) = harness().await;
        seed_user(&store, "5", "local").await;
        seed_group_and_market(&store).await;

        let err = exec
            .execute_instant_order(buy_request(None))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "insufficient_margin");

        let holders = store
            .smembers(&keys::symbol_holders("EURUSD", "live"))
            .await
            .unwrap();
        assert!(holders.is_empty());
    }

    #[tokio::test]
    async fn idempotent_replay_returns_identical_response() {
        let (exec, store, _bus) = harness().await;
        seed_user(&store, "10000", "local").await;
        seed_group_and_market(&store).await;

        let first = exec
            .execute_instant_order(buy_request(Some("k-1")))
            .await
            .unwrap();
        let second = exec
            .execute_instant_order(buy_request(Some("k-1")))
            .await
            .unwrap();
        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.response, second.response);

        // Exactly one order exists for the user.
        let index = store
            .smembers(&crate::orders::holdings_index_key("live", "1001"))
            .await
            .unwrap();
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn failed_attempt_releases_the_key() {
        let (exec, store, _bus) = harness().await;
        seed_user(&store, "5", "local").await;
        seed_group_and_market(&store).await;

        let err = exec
            .execute_instant_order(buy_request(Some("k-2")))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "insufficient_margin");

        // Top up and retry with the same key: goes through.
        seed_user(&store, "10000", "local").await;
        let out = exec
            .execute_instant_order(buy_request(Some("k-2")))
            .await
            .unwrap();
        assert!(out.response.ok);
    }

    #[tokio::test]
    async fn disabled_user_rejected() {
        let (exec, store, _bus) = harness().await;
        seed_user(&store, "10000", "local").await;
        store
            .hset(
                &keys::user_config("live", "1001"),
                &[("status".to_string(), "disabled".to_string())],
            )
            .await
            .unwrap();
        seed_group_and_market(&store).await;
        let err = exec
            .execute_instant_order(buy_request(None))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "invalid_user_status");
    }

    #[tokio::test]
    async fn provider_routing_stages_queued_order() {
        let (exec, store, _bus) = harness().await;
        seed_user(&store, "10000", "lp_main").await;
        seed_group_and_market(&store).await;

        let out = exec.execute_instant_order(buy_request(None)).await.unwrap();
        assert_eq!(out.response.flow, "provider");
        assert_eq!(out.response.order_status, "QUEUED");
        let payload = out.provider_payload.unwrap();
        assert_eq!(payload.symbol, "EURUSD");
        assert_eq!(payload.side, "BUY");

        let order = load_order(&store, "live", "1001", &out.response.order_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(order.status, OrderStatus::Queued);
        // Preliminary margin uses the requested price: (1000*1*1.2)/100.
        assert_eq!(order.margin_usd, dec!(12));

        // No holdings or symbol membership until the open confirms.
        let holders = store
            .smembers(&keys::symbol_holders("EURUSD", "live"))
            .await
            .unwrap();
        assert!(holders.is_empty());
    }

    #[tokio::test]
    async fn provider_payload_not_replayed() {
        let (exec, store, _bus) = harness().await;
        seed_user(&store, "10000", "lp_main").await;
        seed_group_and_market(&store).await;

        let first = exec
            .execute_instant_order(buy_request(Some("k-3")))
            .await
            .unwrap();
        assert!(first.provider_payload.is_some());
        let replay = exec
            .execute_instant_order(buy_request(Some("k-3")))
            .await
            .unwrap();
        assert!(replay.replayed);
        assert!(replay.provider_payload.is_none());
        assert_eq!(first.response, replay.response);
    }

    #[tokio::test]
    async fn sl_tp_register_trigger_indexes() {
        let (exec, store, _bus) = harness().await;
        seed_user(&store, "10000", "local").await;
        seed_group_and_market(&store).await;

        let mut req = buy_request(None);
        req.stop_loss = Some(dec!(1.199));
        req.take_profit = Some(dec!(1.21));
        let out = exec.execute_instant_order(req).await.unwrap();

        let sl = store
            .zrangebyscore(&keys::sl_index("EURUSD", "BUY"), f64::MIN, f64::MAX)
            .await
            .unwrap();
        assert_eq!(sl.len(), 1);
        assert_eq!(sl[0].0, out.response.order_id);
        // Score folds the half-spread back into raw space.
        assert!((sl[0].1 - 1.19901).abs() < 1e-9);
        let tp = store
            .zrangebyscore(&keys::tp_index("EURUSD", "BUY"), f64::MIN, f64::MAX)
            .await
            .unwrap();
        assert_eq!(tp.len(), 1);
    }
}
