//! In-process backend for tests and local simulation.
//!
//! Implements the full `KvBackend` surface over plain maps with lazy TTL
//! expiry. `set_failing(true)` makes every operation return a transport
//! error, which is how the breaker tests drive failure sequences.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::StoreError;

use super::{KvBackend, KvOp};

#[derive(Default)]
struct MemInner {
    strings: HashMap<String, String>,
    counters: HashMap<String, i64>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
    zsets: HashMap<String, BTreeMap<String, f64>>,
    expiries: HashMap<String, Instant>,
}

impl MemInner {
    fn purge_if_expired(&mut self, key: &str) {
        if let Some(at) = self.expiries.get(key) {
            if Instant::now() >= *at {
                self.expiries.remove(key);
                self.strings.remove(key);
                self.counters.remove(key);
                self.hashes.remove(key);
                self.sets.remove(key);
                self.zsets.remove(key);
            }
        }
    }

    fn remove_all(&mut self, key: &str) -> bool {
        let existed = self.strings.remove(key).is_some()
            | self.counters.remove(key).is_some()
            | self.hashes.remove(key).is_some()
            | self.sets.remove(key).is_some()
            | self.zsets.remove(key).is_some();
        self.expiries.remove(key);
        existed
    }

    fn apply(&mut self, op: KvOp) {
        match op {
            KvOp::Hset { key, fields } => {
                let h = self.hashes.entry(key).or_default();
                for (f, v) in fields {
                    h.insert(f, v);
                }
            }
            KvOp::Hdel { key, fields } => {
                if let Some(h) = self.hashes.get_mut(&key) {
                    for f in fields {
                        h.remove(&f);
                    }
                }
            }
            KvOp::Del { key } => {
                self.remove_all(&key);
            }
            KvOp::Set { key, value } => {
                self.strings.insert(key, value);
            }
            KvOp::Sadd { key, member } => {
                self.sets.entry(key).or_default().insert(member);
            }
            KvOp::Srem { key, member } => {
                if let Some(s) = self.sets.get_mut(&key) {
                    s.remove(&member);
                }
            }
            KvOp::Zadd { key, member, score } => {
                self.zsets.entry(key).or_default().insert(member, score);
            }
            KvOp::Zrem { key, member } => {
                if let Some(z) = self.zsets.get_mut(&key) {
                    z.remove(&member);
                }
            }
            KvOp::Expire { key, ttl_secs } => {
                self.expiries
                    .insert(key, Instant::now() + Duration::from_secs(ttl_secs));
            }
        }
    }
}

pub struct MemoryBackend {
    inner: Mutex<MemInner>,
    failing: AtomicBool,
    ops: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemInner::default()),
            failing: AtomicBool::new(false),
            ops: AtomicU64::new(0),
        }
    }

    /// While set, every operation fails with a transport error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of operations that reached the backend (breaker tests assert
    /// fail-fast means this does not move).
    pub fn op_count(&self) -> u64 {
        self.ops.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StoreError> {
        self.ops.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Transport("injected failure".into()))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        let mut g = self.inner.lock().unwrap();
        g.purge_if_expired(key);
        Ok(g.hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        self.check()?;
        let mut g = self.inner.lock().unwrap();
        g.purge_if_expired(key);
        let h = g.hashes.entry(key.to_string()).or_default();
        for (f, v) in fields {
            h.insert(f.clone(), v.clone());
        }
        Ok(())
    }

    async fn hmget(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>, StoreError> {
        self.check()?;
        let mut g = self.inner.lock().unwrap();
        g.purge_if_expired(key);
        let h = g.hashes.get(key);
        Ok(fields
            .iter()
            .map(|f| h.and_then(|h| h.get(*f)).cloned())
            .collect())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.check()?;
        let mut g = self.inner.lock().unwrap();
        g.purge_if_expired(key);
        Ok(g.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hdel(&self, key: &str, fields: &[&str]) -> Result<(), StoreError> {
        self.check()?;
        let mut g = self.inner.lock().unwrap();
        if let Some(h) = g.hashes.get_mut(key) {
            for f in fields {
                h.remove(*f);
            }
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        self.check()?;
        let mut g = self.inner.lock().unwrap();
        g.purge_if_expired(key);
        Ok(g.remove_all(key))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        let mut g = self.inner.lock().unwrap();
        g.purge_if_expired(key);
        Ok(g.strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check()?;
        let mut g = self.inner.lock().unwrap();
        g.strings.insert(key.to_string(), value.to_string());
        g.expiries.remove(key);
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        self.check()?;
        let mut g = self.inner.lock().unwrap();
        g.strings.insert(key.to_string(), value.to_string());
        g.expiries
            .insert(key.to_string(), Instant::now() + Duration::from_secs(ttl_secs));
        Ok(())
    }

    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<bool, StoreError> {
        self.check()?;
        let mut g = self.inner.lock().unwrap();
        g.purge_if_expired(key);
        if g.strings.contains_key(key) {
            return Ok(false);
        }
        g.strings.insert(key.to_string(), value.to_string());
        g.expiries
            .insert(key.to_string(), Instant::now() + Duration::from_secs(ttl_secs));
        Ok(true)
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        self.check()?;
        let mut g = self.inner.lock().unwrap();
        g.purge_if_expired(key);
        let c = g.counters.entry(key.to_string()).or_insert(0);
        *c += 1;
        Ok(*c)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError> {
        self.check()?;
        let mut g = self.inner.lock().unwrap();
        g.expiries
            .insert(key.to_string(), Instant::now() + Duration::from_secs(ttl_secs));
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.check()?;
        let mut g = self.inner.lock().unwrap();
        g.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.check()?;
        let mut g = self.inner.lock().unwrap();
        if let Some(s) = g.sets.get_mut(key) {
            s.remove(member);
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.check()?;
        let mut g = self.inner.lock().unwrap();
        g.purge_if_expired(key);
        let mut members: Vec<String> = g
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        self.check()?;
        let mut g = self.inner.lock().unwrap();
        g.zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.check()?;
        let mut g = self.inner.lock().unwrap();
        Ok(g.zsets
            .get_mut(key)
            .map(|z| z.remove(member).is_some())
            .unwrap_or(false))
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        self.check()?;
        let mut g = self.inner.lock().unwrap();
        g.purge_if_expired(key);
        let mut hits: Vec<(String, f64)> = g
            .zsets
            .get(key)
            .map(|z| {
                z.iter()
                    .filter(|(_, s)| **s >= min && **s <= max)
                    .map(|(m, s)| (m.clone(), *s))
                    .collect()
            })
            .unwrap_or_default();
        hits.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap().then(a.0.cmp(&b.0)));
        Ok(hits)
    }

    async fn pipeline(&self, ops: Vec<KvOp>) -> Result<(), StoreError> {
        self.check()?;
        let mut g = self.inner.lock().unwrap();
        for op in ops {
            g.apply(op);
        }
        Ok(())
    }
}
