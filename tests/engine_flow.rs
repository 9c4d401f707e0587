//! End-to-end flows over the in-memory wiring: the instant-order path, the
//! provider round-trip (listener frame → dispatcher → worker), price-driven
//! stop-loss closes and the holdings/trigger-index invariants across the
//! whole lifecycle.

use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use fx_exec_engine::market::DecodedTick;
use fx_exec_engine::monitor::TriggerMonitor;
use fx_exec_engine::orders::executor::{InstantOrderRequest, OrderExecutor};
use fx_exec_engine::orders::{load_order, CloseReason, OrderStatus, Side};
use fx_exec_engine::provider::dispatcher::ConfirmationDispatcher;
use fx_exec_engine::provider::{encode_frame, normalize_report};
use fx_exec_engine::queue::{
    MemoryQueueBus, QueueBus, CLOSE_QUEUE, CONFIRMATION_QUEUE, OPEN_QUEUE, PROVIDER_SEND_QUEUE,
    REJECT_QUEUE,
};
use fx_exec_engine::store::{keys, StateStore};
use fx_exec_engine::workers::close::CloseWorker;
use fx_exec_engine::workers::open::OpenWorker;
use fx_exec_engine::workers::reject::RejectWorker;
use fx_exec_engine::workers::ReportHandler;
use fx_exec_engine::{AppConfig, AppContext};

struct Engine {
    ctx: AppContext,
    executor: OrderExecutor,
    dispatcher: ConfirmationDispatcher,
    open_worker: Arc<OpenWorker>,
    close_worker: Arc<CloseWorker>,
    reject_worker: RejectWorker,
    monitor: Arc<TriggerMonitor>,
}

fn engine() -> (Engine, Arc<MemoryQueueBus>) {
    let ctx = AppContext::in_memory(AppConfig::default());
    // A concrete bus handle so the tests can peek into queues.
    let bus: Arc<MemoryQueueBus> = Arc::new(MemoryQueueBus::new());
    let store = ctx.store.clone();
    let open_worker = Arc::new(OpenWorker::new(store.clone(), bus.clone()));
    let close_worker = Arc::new(CloseWorker::new(store.clone(), bus.clone()));
    let engine = Engine {
        executor: OrderExecutor::new(store.clone(), bus.clone(), 1),
        dispatcher: ConfirmationDispatcher::new(store.clone(), bus.clone()),
        reject_worker: RejectWorker::new(store.clone(), bus.clone()),
        monitor: Arc::new(TriggerMonitor::new(
            store.clone(),
            bus.clone(),
            close_worker.clone(),
            open_worker.clone(),
            "it".to_string(),
        )),
        open_worker,
        close_worker,
        ctx,
    };
    (engine, bus)
}

async fn seed_account(store: &StateStore, wallet: &str, routing: &str) {
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

async fn tick(engine: &Engine, bid: Decimal, ask: Decimal) {
    engine
        .ctx
        .market
        .ingest(DecodedTick {
            symbol: "EURUSD".into(),
            bid: Some(bid),
            ask: Some(ask),
            source_ts_ms: chrono::Utc::now().timestamp_millis(),
        })
        .await
        .unwrap();
}

fn instant_buy(qty: Decimal, sl: Option<Decimal>) -> InstantOrderRequest {
    InstantOrderRequest {
        symbol: "EURUSD".into(),
        side: Side::Buy,
        order_price: dec!(1.2),
        order_quantity: qty,
        user_id: "1001".into(),
        user_type: "live".into(),
        idempotency_key: None,
        stop_loss: sl,
        take_profit: None,
    }
}

#[tokio::test]
async fn stop_loss_fires_and_close_worker_finalizes() {
    // Scenario: open BUY with SL, cross it with a tick, run the monitor,
    // feed the enqueued synthetic report through the close worker.
    let (engine, bus) = engine();
    let store = engine.ctx.store.clone();
    seed_account(&store, "10000", "local").await;
    tick(&engine, dec!(1.19990), dec!(1.20000)).await;

    let out = engine
        .executor
        .execute_instant_order(instant_buy(dec!(1), Some(dec!(1.19900))))
        .await
        .unwrap();
    let order_id = out.response.order_id.clone();

    // SL armed.
    let sl = store
        .zrangebyscore(&keys::sl_index("EURUSD", "BUY"), f64::MIN, f64::MAX)
        .await
        .unwrap();
    assert_eq!(sl.len(), 1);

    // Crossing tick; local routing applies the close inline.
    tick(&engine, dec!(1.19899), dec!(1.19909)).await;
    let fired = engine.monitor.scan_symbol("EURUSD").await.unwrap();
    assert_eq!(fired.len(), 1);

    let order = load_order(&store, "live", "1001", &order_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.status, OrderStatus::Closed);
    assert_eq!(order.close_reason, Some(CloseReason::StoplossHit));

    // Invariants: holdings mirror gone, membership gone, index clean.
    let holders = store
        .smembers(&keys::symbol_holders("EURUSD", "live"))
        .await
        .unwrap();
    assert!(holders.is_empty());
    let sl = store
        .zrangebyscore(&keys::sl_index("EURUSD", "BUY"), f64::MIN, f64::MAX)
        .await
        .unwrap();
    assert!(sl.is_empty());
    // One open + one close persistence event.
    let mut events = Vec::new();
    while let Some(m) = bus
        .try_consume(fx_exec_engine::queue::ORDER_DB_UPDATE_QUEUE)
        .await
        .unwrap()
    {
        events.push(m.body["type"].as_str().unwrap().to_string());
    }
    assert_eq!(events, vec!["order_opened", "order_closed"]);
}

#[tokio::test]
async fn provider_round_trip_open_then_reject_path() {
    // Scenario: provider-routed order is QUEUED; an EXECUTED report routes
    // to open_queue and finalizes holdings; a REJECTED report on a second
    // order routes to reject_queue and frees the reservation.
    let (engine, bus) = engine();
    let store = engine.ctx.store.clone();
    seed_account(&store, "10000", "lp_main").await;
    tick(&engine, dec!(1.19990), dec!(1.20000)).await;

    let queued = engine
        .executor
        .execute_instant_order(instant_buy(dec!(1), None))
        .await
        .unwrap();
    assert_eq!(queued.response.order_status, "QUEUED");
    let order_id = queued.response.order_id.clone();

    // The provider's frame, as the listener would decode it.
    let frame = encode_frame(&serde_json::json!({
        "11": order_id, "17": "exec-1", "39": "EXECUTED",
        "6": "1.20002", "14": "1",
    }))
    .unwrap();
    let report = normalize_report(
        &fx_exec_engine::provider::decode_frame(&frame[4..]).unwrap(),
        0,
    )
    .unwrap();

    engine.dispatcher.dispatch(&report).await.unwrap();
    let msg = bus.try_consume(OPEN_QUEUE).await.unwrap().unwrap();
    let routed = serde_json::from_value(msg.body).unwrap();
    engine.open_worker.handle(&routed).await.unwrap();

    let order = load_order(&store, "live", "1001", &order_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.status, OrderStatus::Open);
    assert_eq!(order.entry_price, dec!(1.20002));
    let holders = store
        .smembers(&keys::symbol_holders("EURUSD", "live"))
        .await
        .unwrap();
    assert_eq!(holders, vec!["live:1001".to_string()]);

    // Second order gets rejected by the provider.
    let second = engine
        .executor
        .execute_instant_order(instant_buy(dec!(1), None))
        .await
        .unwrap();
    let second_id = second.response.order_id.clone();
    let reject = normalize_report(
        &serde_json::json!({"11": second_id, "17": "exec-2", "39": "REJECTED"}),
        0,
    )
    .unwrap();
    engine.dispatcher.dispatch(&reject).await.unwrap();
    let msg = bus.try_consume(REJECT_QUEUE).await.unwrap().unwrap();
    let routed = serde_json::from_value(msg.body).unwrap();
    engine.reject_worker.handle(&routed).await.unwrap();

    let order = load_order(&store, "live", "1001", &second_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.status, OrderStatus::Rejected);
    // Membership unchanged: only the first (open) order holds the symbol.
    let holders = store
        .smembers(&keys::symbol_holders("EURUSD", "live"))
        .await
        .unwrap();
    assert_eq!(holders, vec!["live:1001".to_string()]);
}

#[tokio::test]
async fn duplicate_report_replay_reaches_no_worker_twice() {
    let (engine, bus) = engine();
    let store = engine.ctx.store.clone();
    seed_account(&store, "10000", "lp_main").await;
    tick(&engine, dec!(1.19990), dec!(1.20000)).await;

    let queued = engine
        .executor
        .execute_instant_order(instant_buy(dec!(1), None))
        .await
        .unwrap();
    let order_id = queued.response.order_id.clone();
    let report = normalize_report(
        &serde_json::json!({"11": order_id, "17": "exec-dup", "39": "EXECUTED", "6": "1.2"}),
        0,
    )
    .unwrap();

    engine.dispatcher.dispatch(&report).await.unwrap();
    engine.dispatcher.dispatch(&report).await.unwrap();
    assert!(bus.try_consume(OPEN_QUEUE).await.unwrap().is_some());
    assert!(bus.try_consume(OPEN_QUEUE).await.unwrap().is_none());

    // Even if the same report somehow reaches the worker twice, the second
    // application is a status-guarded no-op.
    engine.open_worker.handle(&report).await.unwrap();
    let before = load_order(&store, "live", "1001", &report.order_id)
        .await
        .unwrap()
        .unwrap();
    engine.open_worker.handle(&report).await.unwrap();
    let after = load_order(&store, "live", "1001", &report.order_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn provider_close_round_trip_from_trigger() {
    // Provider-routed account: the trigger engine claims the order as
    // CLOSING and enqueues a synthetic report; the close worker finalizes.
    let (engine, bus) = engine();
    let store = engine.ctx.store.clone();
    seed_account(&store, "10000", "lp_main").await;
    tick(&engine, dec!(1.19990), dec!(1.20000)).await;

    let queued = engine
        .executor
        .execute_instant_order(instant_buy(dec!(1), Some(dec!(1.19900))))
        .await
        .unwrap();
    let order_id = queued.response.order_id.clone();
    // Provider fills the open.
    let fill = normalize_report(
        &serde_json::json!({"11": order_id, "17": "exec-o", "39": "EXECUTED", "6": "1.20001", "14": "1"}),
        0,
    )
    .unwrap();
    engine.dispatcher.dispatch(&fill).await.unwrap();
    let msg = bus.try_consume(OPEN_QUEUE).await.unwrap().unwrap();
    engine
        .open_worker
        .handle(&serde_json::from_value(msg.body).unwrap())
        .await
        .unwrap();

    // SL crossed.
    tick(&engine, dec!(1.19899), dec!(1.19909)).await;
    let fired = engine.monitor.scan_symbol("EURUSD").await.unwrap();
    assert_eq!(fired.len(), 1);

    let claimed = load_order(&store, "live", "1001", &order_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.status, OrderStatus::Closing);

    let msg = bus.try_consume(CLOSE_QUEUE).await.unwrap().unwrap();
    engine
        .close_worker
        .handle(&serde_json::from_value(msg.body).unwrap())
        .await
        .unwrap();

    let closed = load_order(&store, "live", "1001", &order_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(closed.status, OrderStatus::Closed);
    assert_eq!(closed.close_reason, Some(CloseReason::StoplossHit));
}

#[tokio::test]
async fn confirmation_queue_is_fed_by_normalized_frames() {
    // The listener-normalized report survives the queue as JSON.
    let report = normalize_report(
        &serde_json::json!({"11": "1", "17": "e", "39": "EXECUTED", "6": 1.5}),
        42,
    )
    .unwrap();
    let bus = MemoryQueueBus::new();
    fx_exec_engine::queue::publish(
        &bus,
        CONFIRMATION_QUEUE,
        serde_json::to_value(&report).unwrap(),
    )
    .await
    .unwrap();
    let msg = bus.try_consume(CONFIRMATION_QUEUE).await.unwrap().unwrap();
    let back: fx_exec_engine::provider::ExecutionReport =
        serde_json::from_value(msg.body).unwrap();
    assert_eq!(back.order_id, "1");
    assert_eq!(back.avg_px_dec(), Some(dec!(1.5)));
}

#[tokio::test]
async fn provider_send_queue_carries_dispatch_payloads() {
    let (engine, bus) = engine();
    let store = engine.ctx.store.clone();
    seed_account(&store, "10000", "lp_main").await;
    tick(&engine, dec!(1.19990), dec!(1.20000)).await;

    let out = engine
        .executor
        .execute_instant_order(instant_buy(dec!(1), None))
        .await
        .unwrap();
    let payload = out.provider_payload.unwrap();
    fx_exec_engine::queue::publish(
        bus.as_ref(),
        PROVIDER_SEND_QUEUE,
        serde_json::to_value(&payload).unwrap(),
    )
    .await
    .unwrap();
    let msg = bus.try_consume(PROVIDER_SEND_QUEUE).await.unwrap().unwrap();
    assert_eq!(msg.body["order_id"], payload.order_id);
    assert_eq!(msg.body["symbol"], "EURUSD");
}
