//! Provider listener binary: the single writer onto the confirmation
//! queue. Kept out of the engine process so exactly one socket reader
//! exists per transport.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use fx_exec_engine::provider::listener::{ListenerConfig, ProviderListener};
use fx_exec_engine::queue::RedisQueueBus;
use fx_exec_engine::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_max_level(Level::INFO)
        .init();

    let config = AppConfig::from_env();
    info!(
        uds = %config.provider_uds_path,
        tcp = %format!("{}:{}", config.provider_tcp_host, config.provider_tcp_port),
        "provider listener starting"
    );

    let bus = Arc::new(RedisQueueBus::new(&config.redis_url)?);
    let listener = ProviderListener::new(
        ListenerConfig {
            uds_path: config.provider_uds_path.clone(),
            tcp_host: config.provider_tcp_host.clone(),
            tcp_port: config.provider_tcp_port,
            connect_timeout: Duration::from_secs(3),
        },
        bus,
    );
    listener.run().await;
    Ok(())
}
