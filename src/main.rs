//! Engine binary: wires the state store, queues, market cache, dispatcher,
//! lifecycle workers, trigger engine, portfolio recalculator and the HTTP
//! surface into one process. The provider socket listener runs as its own
//! binary (single writer per transport).

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use fx_exec_engine::api::{self, ApiState};
use fx_exec_engine::monitor::TriggerMonitor;
use fx_exec_engine::orders::executor::OrderExecutor;
use fx_exec_engine::portfolio::PortfolioRecalculator;
use fx_exec_engine::provider::dispatcher::ConfirmationDispatcher;
use fx_exec_engine::workers::{
    self,
    cancel::{CancelWorker, StopLossCancelWorker, TakeProfitCancelWorker},
    close::CloseWorker,
    open::OpenWorker,
    reject::RejectWorker,
    ReportHandler,
};
use fx_exec_engine::{AppConfig, AppContext};

/// File logging when FX_LOG_DIR is set, stdout otherwise. The guard must
/// outlive main or buffered lines are lost on shutdown.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter =
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match std::env::var("FX_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "fx_engine.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_max_level(Level::INFO)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let _log_guard = init_tracing();

    let config = AppConfig::from_env();
    info!(?config, "fx engine starting");
    let ctx = AppContext::connect(config.clone())?;

    // Market warmup before anything can execute against a stale snapshot.
    match ctx.market.warmup("startup").await {
        Ok(n) => info!(refreshed = n, "startup market warmup done"),
        Err(e) => tracing::warn!(error = %e, "startup warmup failed"),
    }

    // Decoded-tick ingress from the feed transport.
    {
        let market = ctx.market.clone();
        let redis_url = config.redis_url.clone();
        tokio::spawn(async move { fx_exec_engine::market::run_tick_ingress(market, redis_url).await });
    }

    // Freshness watchdog: warm up stale symbols; once the feed has been
    // silent past the grace period, force the emergency fallback.
    {
        let market = ctx.market.clone();
        let grace = Duration::from_secs(config.market_freshness_secs * 5);
        tokio::spawn(async move {
            let mut check = tokio::time::interval(Duration::from_secs(30));
            loop {
                check.tick().await;
                match market.feed_silence() {
                    Some(age) if age >= grace => {
                        if let Err(e) = market.emergency_populate().await {
                            tracing::warn!(error = %e, "emergency populate failed");
                        }
                    }
                    _ => match market.stale_symbols().await {
                        Ok(stale) if !stale.is_empty() => {
                            if let Err(e) = market.warmup("watchdog").await {
                                tracing::warn!(error = %e, "watchdog warmup failed");
                            }
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "freshness check failed"),
                    },
                }
            }
        });
    }

    // Confirmation dispatcher.
    {
        let dispatcher = ConfirmationDispatcher::new(ctx.store.clone(), ctx.bus.clone());
        tokio::spawn(async move { dispatcher.run().await });
    }

    // One worker family per queue.
    let close_worker = Arc::new(CloseWorker::new(ctx.store.clone(), ctx.bus.clone()));
    let open_worker = Arc::new(OpenWorker::new(ctx.store.clone(), ctx.bus.clone()));
    let handlers: Vec<Arc<dyn ReportHandler>> = vec![
        open_worker.clone(),
        close_worker.clone(),
        Arc::new(CancelWorker::new(ctx.store.clone(), ctx.bus.clone())),
        Arc::new(StopLossCancelWorker::new(ctx.store.clone(), ctx.bus.clone())),
        Arc::new(TakeProfitCancelWorker::new(ctx.store.clone(), ctx.bus.clone())),
        Arc::new(RejectWorker::new(ctx.store.clone(), ctx.bus.clone())),
    ];
    for handler in handlers {
        let bus = ctx.bus.clone();
        tokio::spawn(async move { workers::run_worker(bus, handler).await });
    }

    // Trigger engine (leader-elected per symbol partition).
    {
        let monitor = Arc::new(TriggerMonitor::new(
            ctx.store.clone(),
            ctx.bus.clone(),
            close_worker,
            open_worker,
            config.trigger_partition.clone(),
        ));
        let rx = ctx.market.subscribe();
        tokio::spawn(async move { monitor.run(rx).await });
    }

    // Portfolio recalculator + autocutoff watcher.
    {
        let recalc = Arc::new(PortfolioRecalculator::new(
            ctx.store.clone(),
            ctx.bus.clone(),
            Duration::from_millis(config.portfolio_flush_ms),
            config.autocutoff_level,
        ));
        let rx = ctx.market.subscribe();
        tokio::spawn(async move { recalc.run(rx).await });
    }

    // HTTP surface, on the caller's critical path.
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(3))
        .build()?;
    let state = ApiState {
        executor: Arc::new(
            OrderExecutor::new(ctx.store.clone(), ctx.bus.clone(), config.worker_id)
                .with_db_fallback(http, config.internal_provider_url.clone()),
        ),
        bus: ctx.bus.clone(),
        store: ctx.store.clone(),
    };
    api::serve(state, config.listen_addr).await
}
