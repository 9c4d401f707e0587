//! Order and lifecycle id generation.
//!
//! Order ids are 16-digit numeric strings: 13-digit unix-millisecond
//! timestamp, one worker digit, two intra-millisecond sequence digits.
//! Generation is store-independent and monotonic per worker; when the
//! sequence exhausts a millisecond it borrows from the next one.
//!
//! Close / SL-cancel / TP-cancel ids are `CLS|SLC|TPC` + `yyyymmdd` + a
//! zero-padded daily sequence backed by a TTL'd counter in the state store.

use std::sync::Mutex;

use chrono::Utc;

use crate::error::EngineError;
use crate::store::{keys, StateStore};

const DAILY_SEQ_TTL_SECS: u64 = 3 * 24 * 60 * 60;

pub struct OrderIdGenerator {
    worker_digit: u8,
    state: Mutex<(i64, u32)>,
}

impl OrderIdGenerator {
    pub fn new(worker_id: u16) -> Self {
        Self {
            worker_digit: (worker_id % 10) as u8,
            state: Mutex::new((0, 0)),
        }
    }

    pub fn next(&self) -> String {
        let now_ms = Utc::now().timestamp_millis();
        let mut g = self.state.lock().unwrap();
        if now_ms > g.0 {
            g.0 = now_ms;
            g.1 = 0;
        } else {
            g.1 += 1;
            if g.1 > 99 {
                g.0 += 1;
                g.1 = 0;
            }
        }
        format!("{:013}{}{:02}", g.0, self.worker_digit, g.1)
    }
}

pub fn validate_order_id(id: &str) -> bool {
    id.len() == 16 && id.bytes().all(|b| b.is_ascii_digit())
}

pub fn extract_timestamp_ms(id: &str) -> Option<i64> {
    if !validate_order_id(id) {
        return None;
    }
    id[..13].parse().ok()
}

pub fn extract_worker_digit(id: &str) -> Option<u8> {
    if !validate_order_id(id) {
        return None;
    }
    id[13..14].parse().ok()
}

fn yyyymmdd() -> String {
    Utc::now().format("%Y%m%d").to_string()
}

async fn next_daily_seq(store: &StateStore, prefix: &str, date: &str) -> Result<i64, EngineError> {
    let key = keys::daily_seq(prefix, date);
    let seq = store.incr(&key).await?;
    if seq == 1 {
        store.expire(&key, DAILY_SEQ_TTL_SECS).await?;
    }
    Ok(seq)
}

pub async fn generate_close_id(store: &StateStore) -> Result<String, EngineError> {
    let date = yyyymmdd();
    let seq = next_daily_seq(store, "cls", &date).await?;
    Ok(format!("CLS{date}{seq:06}"))
}

pub async fn generate_stoploss_cancel_id(store: &StateStore) -> Result<String, EngineError> {
    let date = yyyymmdd();
    let seq = next_daily_seq(store, "slc", &date).await?;
    Ok(format!("SLC{date}{seq:06}"))
}

pub async fn generate_takeprofit_cancel_id(store: &StateStore) -> Result<String, EngineError> {
    let date = yyyymmdd();
    let seq = next_daily_seq(store, "tpc", &date).await?;
    Ok(format!("TPC{date}{seq:06}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryBackend;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn ids_are_16_digit_numeric() {
        let gen = OrderIdGenerator::new(3);
        let id = gen.next();
        assert!(validate_order_id(&id), "bad id {id}");
        assert_eq!(extract_worker_digit(&id), Some(3));
        let ts = extract_timestamp_ms(&id).unwrap();
        let now = Utc::now().timestamp_millis();
        assert!((now - ts).abs() < 2_000);
    }

    #[test]
    fn ids_are_unique_and_monotonic_under_burst() {
        let gen = OrderIdGenerator::new(7);
        let mut prev = String::new();
        let mut seen = HashSet::new();
        for _ in 0..1_000 {
            let id = gen.next();
            assert!(id > prev, "{id} not after {prev}");
            assert!(seen.insert(id.clone()));
            prev = id;
        }
    }

    #[test]
    fn validation_rejects_garbage() {
        assert!(!validate_order_id("abc"));
        assert!(!validate_order_id("12345"));
        assert!(!validate_order_id("17000000000001x1"));
        assert_eq!(extract_timestamp_ms("not-an-id"), None);
    }

    #[tokio::test]
    async fn close_ids_sequence_per_day() {
        let store = StateStore::new(
            Arc::new(MemoryBackend::new()),
            5,
            Duration::from_secs(30),
        );
        let a = generate_close_id(&store).await.unwrap();
        let b = generate_close_id(&store).await.unwrap();
        let date = yyyymmdd();
        assert_eq!(a, format!("CLS{date}000001"));
        assert_eq!(b, format!("CLS{date}000002"));
        let s = generate_stoploss_cancel_id(&store).await.unwrap();
        assert_eq!(s, format!("SLC{date}000001"));
        let t = generate_takeprofit_cancel_id(&store).await.unwrap();
        assert_eq!(t, format!("TPC{date}000001"));
    }
}
