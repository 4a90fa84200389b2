//! LRU response cache keyed by a cheap hash of the conversation context.
//!
//! A cache hit bypasses the dispatch path entirely: no rate-limit accounting,
//! no network call. Entries expire after a TTL; access refreshes recency for
//! eviction but never extends the TTL.

use crate::conversation::WireMessage;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Cache bounds.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub max_size: usize,
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 50,
            ttl: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    response: String,
    inserted_at: Instant,
}

/// Bounded, time-boxed memo of (context hash -> generated reply).
#[derive(Debug, Default)]
pub struct ResponseCache {
    config: CacheConfig,
    entries: HashMap<String, CacheEntry>,
    /// Least recently used first.
    access_order: Vec<String>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            access_order: Vec::new(),
        }
    }

    /// Look up by hash. Expired entries are removed on access.
    pub fn get(&mut self, hash: &str) -> Option<String> {
        self.get_at(hash, Instant::now())
    }

    fn get_at(&mut self, hash: &str, now: Instant) -> Option<String> {
        let entry = self.entries.get(hash)?;
        if now.duration_since(entry.inserted_at) > self.config.ttl {
            self.entries.remove(hash);
            self.access_order.retain(|h| h != hash);
            return None;
        }
        let response = entry.response.clone();
        self.touch(hash);
        Some(response)
    }

    /// Insert or overwrite. Evicts the least recently used entry when full.
    pub fn insert(&mut self, hash: impl Into<String>, response: impl Into<String>) {
        self.insert_at(hash.into(), response.into(), Instant::now());
    }

    fn insert_at(&mut self, hash: String, response: String, now: Instant) {
        if !self.entries.contains_key(&hash) && self.entries.len() >= self.config.max_size {
            if !self.access_order.is_empty() {
                let oldest = self.access_order.remove(0);
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(
            hash.clone(),
            CacheEntry {
                response,
                inserted_at: now,
            },
        );
        self.touch(&hash);
    }

    /// Convenience: look up by context.
    pub fn get_response(&mut self, messages: &[WireMessage]) -> Option<String> {
        let hash = hash_context(messages);
        let hit = self.get(&hash);
        debug!(
            hash = &hash[..hash.len().min(8)],
            hit = hit.is_some(),
            size = self.entries.len(),
            "response cache lookup"
        );
        hit
    }

    /// Convenience: store by context.
    pub fn store_response(&mut self, messages: &[WireMessage], response: &str) {
        let hash = hash_context(messages);
        debug!(
            hash = &hash[..hash.len().min(8)],
            response_len = response.len(),
            "caching response"
        );
        self.insert(hash, response);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.access_order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn touch(&mut self, hash: &str) {
        self.access_order.retain(|h| h != hash);
        self.access_order.push(hash.to_string());
    }
}

/// Cheap deterministic hash of the ordered context: the classic 31-multiply
/// rolling hash over role+text pairs, rendered base-36. Not cryptographic;
/// collisions only cost a stale reply within the TTL.
pub fn hash_context(messages: &[WireMessage]) -> String {
    let mut key = String::new();
    for msg in messages {
        key.push_str(&msg.role);
        key.push('\u{1}');
        key.push_str(&msg.joined_text());
        key.push('\u{2}');
    }

    let mut hash: i32 = 0;
    for c in key.chars() {
        hash = hash.wrapping_mul(31).wrapping_add(c as i32);
    }
    to_base36(hash)
}

fn to_base36(value: i32) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut n = (value as i64).unsigned_abs();
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    if value < 0 {
        out.push(b'-');
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}
