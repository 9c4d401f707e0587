//! Execution and risk core of a retail FX/CFD trading backend.
//!
//! Clients submit orders over HTTP; the core prices them against the live
//! market cache, checks free margin, executes locally or stages for the
//! external liquidity provider, and keeps per-user margin state current as
//! prices move. Stop-loss / take-profit / pending activation and margin
//! liquidation fire from the price stream. All workers coordinate through a
//! hash-tagged key-value cluster and durable queues.

pub mod api;
pub mod error;
pub mod groups;
pub mod margin;
pub mod market;
pub mod monitor;
pub mod orders;
pub mod portfolio;
pub mod pricing;
pub mod provider;
pub mod queue;
pub mod store;
pub mod users;
pub mod workers;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;

use error::EngineError;
use market::MarketCache;
use queue::{MemoryQueueBus, QueueBus, RedisQueueBus};
use store::memory::MemoryBackend;
use store::redis_backend::RedisBackend;
use store::StateStore;

// ─────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub redis_url: String,
    pub listen_addr: SocketAddr,
    pub worker_id: u16,
    pub breaker_failure_threshold: u32,
    pub breaker_recovery_secs: u64,
    pub market_freshness_secs: u64,
    pub portfolio_flush_ms: u64,
    /// Liquidate below this equity/used-margin ratio.
    pub autocutoff_level: Decimal,
    pub trigger_partition: String,
    pub provider_uds_path: String,
    pub provider_tcp_host: String,
    pub provider_tcp_port: u16,
    pub internal_provider_url: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            listen_addr: "127.0.0.1:8000".parse().unwrap(),
            worker_id: 1,
            breaker_failure_threshold: 5,
            breaker_recovery_secs: 30,
            market_freshness_secs: 60,
            portfolio_flush_ms: 100,
            autocutoff_level: Decimal::new(5, 1), // 0.5
            trigger_partition: "default".to_string(),
            provider_uds_path: "/run/fx_exec/exec.sock".to_string(),
            provider_tcp_host: "127.0.0.1".to_string(),
            provider_tcp_port: 9001,
            internal_provider_url: "http://127.0.0.1:3000/api/internal/provider".to_string(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let mut c = Self::default();
        if let Ok(v) = std::env::var("REDIS_URL") { c.redis_url = v; }
        if let Ok(v) = std::env::var("FX_LISTEN_ADDR") { if let Ok(a) = v.parse() { c.listen_addr = a; } }
        if let Ok(v) = std::env::var("FX_WORKER_ID") { if let Ok(n) = v.parse() { c.worker_id = n; } }
        if let Ok(v) = std::env::var("FX_BREAKER_FAILURES") { if let Ok(n) = v.parse() { c.breaker_failure_threshold = n; } }
        if let Ok(v) = std::env::var("FX_BREAKER_RECOVERY_SECS") { if let Ok(n) = v.parse() { c.breaker_recovery_secs = n; } }
        if let Ok(v) = std::env::var("FX_MARKET_FRESHNESS_SECS") { if let Ok(n) = v.parse() { c.market_freshness_secs = n; } }
        if let Ok(v) = std::env::var("FX_PORTFOLIO_FLUSH_MS") { if let Ok(n) = v.parse() { c.portfolio_flush_ms = n; } }
        if let Ok(v) = std::env::var("FX_AUTOCUTOFF_LEVEL") { if let Ok(n) = v.parse() { c.autocutoff_level = n; } }
        if let Ok(v) = std::env::var("FX_TRIGGER_PARTITION") { c.trigger_partition = v; }
        if let Ok(v) = std::env::var("EXEC_UDS_PATH") { c.provider_uds_path = v; }
        if let Ok(v) = std::env::var("EXEC_TCP_HOST") { c.provider_tcp_host = v; }
        if let Ok(v) = std::env::var("EXEC_TCP_PORT") { if let Ok(n) = v.parse() { c.provider_tcp_port = n; } }
        if let Ok(v) = std::env::var("INTERNAL_PROVIDER_URL") { c.internal_provider_url = v; }
        c
    }
}

// ─────────────────────────────────────────────────────────
// Process-wide context
// ─────────────────────────────────────────────────────────

/// Everything a component needs, created once at startup and threaded
/// through explicitly. No global singletons, no import-time side effects.
pub struct AppContext {
    pub config: AppConfig,
    pub store: StateStore,
    pub bus: Arc<dyn QueueBus>,
    pub market: Arc<MarketCache>,
}

impl AppContext {
    /// Production wiring: Redis-backed store, queues and pub/sub.
    pub fn connect(config: AppConfig) -> Result<Self, EngineError> {
        let backend = Arc::new(RedisBackend::new(&config.redis_url)?);
        let store = StateStore::new(
            backend,
            config.breaker_failure_threshold,
            Duration::from_secs(config.breaker_recovery_secs),
        );
        let bus: Arc<dyn QueueBus> = Arc::new(RedisQueueBus::new(&config.redis_url)?);
        let external = redis::Client::open(config.redis_url.as_str())
            .map_err(|e| EngineError::Store(e.to_string()))?;
        let market = Arc::new(MarketCache::new(
            store.clone(),
            Duration::from_secs(config.market_freshness_secs),
            Some(external),
        ));
        Ok(Self {
            config,
            store,
            bus,
            market,
        })
    }

    /// Hermetic wiring for tests and local simulation: everything
    /// in-process.
    pub fn in_memory(config: AppConfig) -> Self {
        let store = StateStore::new(
            Arc::new(MemoryBackend::new()),
            config.breaker_failure_threshold,
            Duration::from_secs(config.breaker_recovery_secs),
        );
        let bus: Arc<dyn QueueBus> = Arc::new(MemoryQueueBus::new());
        let market = Arc::new(MarketCache::new(
            store.clone(),
            Duration::from_secs(config.market_freshness_secs),
            None,
        ));
        Self {
            config,
            store,
            bus,
            market,
        }
    }
}
