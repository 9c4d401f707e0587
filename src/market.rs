//! Market cache: decoded tick ingress → per-symbol bid/ask snapshot plus
//! "symbol moved" fan-out.
//!
//! In-process subscribers (trigger engine, portfolio recalculator) register
//! on an explicit broadcast channel; the same symbol name is also published
//! on the `market_price_updates` Redis channel because off-process tooling
//! subscribes there. The publish happens strictly after the store write, so
//! a subscriber reading the snapshot on notification always observes at
//! least the writing tick.
//!
//! Warmup: after a transport reconnect any symbol whose snapshot is older
//! than the freshness threshold is overwritten from the fallback table and
//! tagged `warmup_fallback`; pricing refuses to execute against fallback
//! ticks. Emergency populate overrides every known symbol unconditionally.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::store::{keys, StateStore};

/// Symbol-moved notifications for off-process subscribers.
pub const MARKET_CHANNEL: &str = "market_price_updates";
/// Decoded ticks arrive here from the (external) feed transport.
pub const TICK_CHANNEL: &str = "market_ticks";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickSource {
    Feed,
    WarmupFallback,
    EmergencyFallback,
}

impl TickSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TickSource::Feed => "feed",
            TickSource::WarmupFallback => "warmup_fallback",
            TickSource::EmergencyFallback => "emergency_fallback",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "warmup_fallback" => TickSource::WarmupFallback,
            "emergency_fallback" => TickSource::EmergencyFallback,
            _ => TickSource::Feed,
        }
    }

    /// Fallback ticks exist to keep downstream consumers alive, not to
    /// execute against.
    pub fn is_tradable(&self) -> bool {
        matches!(self, TickSource::Feed)
    }
}

/// Decoded tick from the (external) market-data transport. Partial updates
/// are legal: bid-only or ask-only ticks merge against the prior snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct DecodedTick {
    pub symbol: String,
    #[serde(default)]
    pub bid: Option<Decimal>,
    #[serde(default)]
    pub ask: Option<Decimal>,
    pub source_ts_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarketSnapshot {
    pub bid: Decimal,
    pub ask: Decimal,
    pub ts_ms: i64,
    pub source: TickSource,
}

impl MarketSnapshot {
    pub fn from_hash(h: &HashMap<String, String>) -> Option<Self> {
        Some(MarketSnapshot {
            bid: h.get("bid")?.parse().ok()?,
            ask: h.get("ask")?.parse().ok()?,
            ts_ms: h.get("ts_ms")?.parse().ok()?,
            source: TickSource::parse(h.get("source").map(String::as_str).unwrap_or("feed")),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct FallbackQuote {
    bid: Decimal,
    ask: Decimal,
}

fn fallback_table() -> HashMap<&'static str, FallbackQuote> {
    HashMap::from([
        ("EURUSD", FallbackQuote { bid: dec!(1.0843), ask: dec!(1.0845) }),
        ("GBPUSD", FallbackQuote { bid: dec!(1.2754), ask: dec!(1.2756) }),
        ("USDSEK", FallbackQuote { bid: dec!(10.8198), ask: dec!(10.8234) }),
        ("EURSEK", FallbackQuote { bid: dec!(11.7412), ask: dec!(11.7456) }),
        ("GBPSEK", FallbackQuote { bid: dec!(13.8076), ask: dec!(13.8123) }),
    ])
}

pub struct MarketCache {
    store: StateStore,
    moved_tx: broadcast::Sender<String>,
    external: Option<redis::Client>,
    freshness: Duration,
    fallback: HashMap<&'static str, FallbackQuote>,
    /// Wall-clock ms of the last real feed tick; 0 until the first one.
    last_feed_ms: AtomicI64,
}

impl MarketCache {
    pub fn new(store: StateStore, freshness: Duration, external: Option<redis::Client>) -> Self {
        let (moved_tx, _) = broadcast::channel(4096);
        Self {
            store,
            moved_tx,
            external,
            freshness,
            fallback: fallback_table(),
            last_feed_ms: AtomicI64::new(0),
        }
    }

    /// How long the feed has been silent; `None` before the first tick.
    pub fn feed_silence(&self) -> Option<Duration> {
        let last = self.last_feed_ms.load(Ordering::Relaxed);
        if last == 0 {
            return None;
        }
        let elapsed_ms = (Utc::now().timestamp_millis() - last).max(0) as u64;
        Some(Duration::from_millis(elapsed_ms))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.moved_tx.subscribe()
    }

    pub async fn snapshot(&self, symbol: &str) -> Result<Option<MarketSnapshot>, EngineError> {
        let h = self.store.hgetall(&keys::market(symbol)).await?;
        if h.is_empty() {
            return Ok(None);
        }
        Ok(MarketSnapshot::from_hash(&h))
    }

    /// Accepts one decoded tick: merge the missing side from the prior
    /// snapshot, write, then notify.
    pub async fn ingest(&self, tick: DecodedTick) -> Result<MarketSnapshot, EngineError> {
        let symbol = tick.symbol.to_uppercase();
        let prior = self.snapshot(&symbol).await?;
        let bid = tick.bid.or(prior.map(|p| p.bid));
        let ask = tick.ask.or(prior.map(|p| p.ask));
        let (bid, ask) = match (bid, ask) {
            (Some(b), Some(a)) => (b, a),
            // One-sided first tick: mirror the known side so the snapshot is
            // complete; the next tick on the other side corrects it.
            (Some(b), None) => (b, b),
            (None, Some(a)) => (a, a),
            (None, None) => {
                return Err(EngineError::Malformed(format!(
                    "tick for {symbol} with neither side"
                )))
            }
        };
        let snap = MarketSnapshot {
            bid,
            ask,
            ts_ms: tick.source_ts_ms,
            source: TickSource::Feed,
        };
        self.write_snapshot(&symbol, &snap).await?;
        self.last_feed_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        self.notify(&symbol).await;
        Ok(snap)
    }

    async fn write_snapshot(
        &self,
        symbol: &str,
        snap: &MarketSnapshot,
    ) -> Result<(), EngineError> {
        self.store
            .hset(
                &keys::market(symbol),
                &[
                    ("bid".to_string(), snap.bid.to_string()),
                    ("ask".to_string(), snap.ask.to_string()),
                    ("ts_ms".to_string(), snap.ts_ms.to_string()),
                    ("source".to_string(), snap.source.as_str().to_string()),
                ],
            )
            .await?;
        self.store.sadd(&keys::market_symbols(), symbol).await?;
        Ok(())
    }

    async fn notify(&self, symbol: &str) {
        // In-process fan-out first; a lagging receiver only loses coalesced
        // notifications, never the snapshot itself.
        let _ = self.moved_tx.send(symbol.to_string());
        if let Some(client) = &self.external {
            match client.get_multiplexed_async_connection().await {
                Ok(mut c) => {
                    let r: Result<(), redis::RedisError> = redis::cmd("PUBLISH")
                        .arg(MARKET_CHANNEL)
                        .arg(symbol)
                        .query_async(&mut c)
                        .await;
                    if let Err(e) = r {
                        warn!(symbol, error = %e, "external market publish failed");
                    }
                }
                Err(e) => warn!(symbol, error = %e, "external market publish failed"),
            }
        }
    }

    /// Every symbol the cache has written plus the fallback universe.
    async fn known_symbols(&self) -> Result<Vec<String>, EngineError> {
        let mut symbols = self.store.smembers(&keys::market_symbols()).await?;
        for s in self.fallback.keys() {
            if !symbols.iter().any(|k| k == s) {
                symbols.push((*s).to_string());
            }
        }
        symbols.sort();
        Ok(symbols)
    }

    fn is_stale(&self, snap: Option<&MarketSnapshot>, now_ms: i64) -> bool {
        match snap {
            None => true,
            Some(s) => now_ms.saturating_sub(s.ts_ms) > self.freshness.as_millis() as i64,
        }
    }

    /// Overwrites every stale symbol with a fallback tick so downstream
    /// consumers never execute against prices from before a connection gap.
    /// Returns how many symbols were refreshed.
    pub async fn warmup(&self, reason: &str) -> Result<usize, EngineError> {
        let now_ms = Utc::now().timestamp_millis();
        let mut refreshed = 0usize;
        for symbol in self.known_symbols().await? {
            let snap = self.snapshot(&symbol).await?;
            if !self.is_stale(snap.as_ref(), now_ms) {
                continue;
            }
            if let Some(q) = self.fallback.get(symbol.as_str()) {
                // Small jitter so repeated warmups don't pin every consumer
                // to the exact same synthetic quote.
                let jitter = {
                    use rand::Rng;
                    use rust_decimal::prelude::FromPrimitive;
                    let f: f64 = rand::thread_rng().gen_range(-0.1..0.1);
                    ((q.ask - q.bid) * Decimal::from_f64(f).unwrap_or_default()).round_dp(5)
                };
                self.write_snapshot(
                    &symbol,
                    &MarketSnapshot {
                        bid: q.bid + jitter,
                        ask: q.ask + jitter,
                        ts_ms: now_ms,
                        source: TickSource::WarmupFallback,
                    },
                )
                .await?;
                refreshed += 1;
            } else {
                warn!(symbol, "stale symbol without fallback quote");
            }
        }
        info!(reason, refreshed, "market warmup complete");
        Ok(refreshed)
    }

    /// Unconditional override of every fallback symbol; invoked when the
    /// transport has been down longer than the grace period.
    pub async fn emergency_populate(&self) -> Result<usize, EngineError> {
        let now_ms = Utc::now().timestamp_millis();
        let mut count = 0usize;
        for (symbol, q) in &self.fallback {
            self.write_snapshot(
                symbol,
                &MarketSnapshot {
                    bid: q.bid,
                    ask: q.ask,
                    ts_ms: now_ms,
                    source: TickSource::EmergencyFallback,
                },
            )
            .await?;
            count += 1;
        }
        warn!(count, "emergency market population");
        Ok(count)
    }

    /// Symbols whose snapshot is older than the freshness threshold.
    pub async fn stale_symbols(&self) -> Result<Vec<String>, EngineError> {
        let now_ms = Utc::now().timestamp_millis();
        let mut stale = Vec::new();
        for symbol in self.known_symbols().await? {
            let snap = self.snapshot(&symbol).await?;
            if self.is_stale(snap.as_ref(), now_ms) {
                stale.push(symbol);
            }
        }
        Ok(stale)
    }
}

/// Tick ingress: subscribes to the feed transport's `market_ticks` channel
/// and pushes every decoded tick through the cache. Reconnects with a flat
/// 5 s delay, warming the cache up after each gap.
pub async fn run_tick_ingress(market: Arc<MarketCache>, redis_url: String) {
    let mut first = true;
    loop {
        let client = match redis::Client::open(redis_url.as_str()) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "tick ingress: bad redis url");
                return;
            }
        };
        match client.get_async_connection().await {
            Ok(conn) => {
                let mut pubsub = conn.into_pubsub();
                if let Err(e) = pubsub.subscribe(TICK_CHANNEL).await {
                    warn!(error = %e, "tick ingress subscribe failed");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
                info!(channel = TICK_CHANNEL, "tick ingress subscribed");
                if !first {
                    // Connection gap: nothing that happened meanwhile is
                    // trustworthy.
                    if let Err(e) = market.warmup("reconnection").await {
                        warn!(error = %e, "post-reconnect warmup failed");
                    }
                }
                first = false;

                let mut stream = pubsub.into_on_message();
                while let Some(msg) = stream.next().await {
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(error = %e, "tick payload unreadable");
                            continue;
                        }
                    };
                    match serde_json::from_str::<DecodedTick>(&payload) {
                        Ok(tick) => {
                            if let Err(e) = market.ingest(tick).await {
                                warn!(error = %e, "tick ingest failed");
                            }
                        }
                        Err(e) => warn!(error = %e, "undecodable tick"),
                    }
                }
                warn!("tick ingress stream dropped, reconnecting");
            }
            Err(e) => warn!(error = %e, "tick ingress connect failed"),
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}
