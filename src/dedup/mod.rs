//! Notification deduplication gate
//!
//! Every (target, party, slot) detection passes through the gate exactly
//! once per TTL window. The gate key embeds a short digest of the slot
//! identity so a changed date or time is a new detection while a re-scrape
//! of the same opening stays silent.
//!
//! The Redis gate is atomic across processes (`SET NX EX`). Store failures
//! fail open: a duplicate notification beats a silently dropped detection.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use deadpool_redis::{Pool, Runtime};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::config::{DedupConfig, RedisConfig};

/// Build the gate key for one detection
///
/// Shape: `{prefix}:{target_id}:{digest}` where the digest is the first 16
/// hex characters of SHA-256 over `target:party:signature`.
pub fn dedup_key(prefix: &str, target_id: &str, party_id: &str, signature: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{target_id}:{party_id}:{signature}"));
    let digest = hex_prefix(&hasher.finalize(), 16);
    format!("{prefix}:{target_id}:{digest}")
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    let mut out = String::with_capacity(len);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
        if out.len() >= len {
            break;
        }
    }
    out.truncate(len);
    out
}

/// At-most-once admission per (target, party, slot) within the TTL
#[async_trait]
pub trait DedupGate: Send + Sync {
    /// Returns true when this detection is new and should be dispatched
    async fn first_seen(&self, target_id: &str, party_id: &str, signature: &str) -> bool;

    /// Drop every marker for a target; returns the number removed
    ///
    /// Maintenance operation, used when an operator wants re-notification
    /// after a false clear.
    async fn clear_target(&self, target_id: &str) -> usize;
}

// ============================================================================
// Redis gate
// ============================================================================

/// Cross-process gate backed by Redis `SET NX EX`
pub struct RedisDedupGate {
    pool: Pool,
    prefix: String,
    ttl: Duration,
}

impl RedisDedupGate {
    /// Connect a gate, failing fast on a malformed URL
    pub fn try_new(redis: &RedisConfig, dedup: &DedupConfig) -> anyhow::Result<Self> {
        let mut cfg = deadpool_redis::Config::from_url(&redis.url);
        cfg.pool = Some(deadpool_redis::PoolConfig::new(redis.pool_size));
        let pool = cfg.create_pool(Some(Runtime::Tokio1))?;
        Ok(Self {
            pool,
            prefix: dedup.key_prefix.clone(),
            ttl: dedup.ttl(),
        })
    }

    async fn try_claim(&self, key: &str) -> Result<bool, crate::error::Error> {
        let mut conn = self.pool.get().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(self.ttl.as_secs())
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn scan_and_delete(&self, pattern: &str) -> Result<usize, crate::error::Error> {
        let mut conn = self.pool.get().await?;
        let mut removed = 0;
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            if !keys.is_empty() {
                let deleted: usize = redis::cmd("DEL")
                    .arg(&keys)
                    .query_async(&mut conn)
                    .await?;
                removed += deleted;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(removed)
    }
}

#[async_trait]
impl DedupGate for RedisDedupGate {
    async fn first_seen(&self, target_id: &str, party_id: &str, signature: &str) -> bool {
        let key = dedup_key(&self.prefix, target_id, party_id, signature);
        match self.try_claim(&key).await {
            Ok(claimed) => claimed,
            Err(e) => {
                tracing::warn!(error = %e, key = %key, "Dedup store unavailable, failing open");
                true
            }
        }
    }

    async fn clear_target(&self, target_id: &str) -> usize {
        let pattern = format!("{}:{}:*", self.prefix, target_id);
        match self.scan_and_delete(&pattern).await {
            Ok(removed) => {
                tracing::info!(target = %target_id, removed, "Dedup markers cleared");
                removed
            }
            Err(e) => {
                tracing::warn!(error = %e, target = %target_id, "Dedup clear failed");
                0
            }
        }
    }
}

// ============================================================================
// In-memory gate
// ============================================================================

/// Single-process gate for tests and Redis-less deployments
pub struct MemoryDedupGate {
    seen: Mutex<HashMap<String, Instant>>,
    prefix: String,
    ttl: Duration,
}

impl MemoryDedupGate {
    pub fn new(config: &DedupConfig) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            prefix: config.key_prefix.clone(),
            ttl: config.ttl(),
        }
    }
}

#[async_trait]
impl DedupGate for MemoryDedupGate {
    async fn first_seen(&self, target_id: &str, party_id: &str, signature: &str) -> bool {
        let key = dedup_key(&self.prefix, target_id, party_id, signature);
        let mut seen = self.seen.lock().await;
        let now = Instant::now();
        seen.retain(|_, at| now.duration_since(*at) < self.ttl);
        match seen.get(&key) {
            Some(_) => false,
            None => {
                seen.insert(key, now);
                true
            }
        }
    }

    async fn clear_target(&self, target_id: &str) -> usize {
        let prefix = format!("{}:{}:", self.prefix, target_id);
        let mut seen = self.seen.lock().await;
        let before = seen.len();
        seen.retain(|key, _| !key.starts_with(&prefix));
        before - seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_shape() {
        let key = dedup_key("dedup", "paris_75", "a1", "2024-03-05|09:00");
        let parts: Vec<&str> = key.split(':').collect();
        assert_eq!(parts[0], "dedup");
        assert_eq!(parts[1], "paris_75");
        assert_eq!(parts[2].len(), 16);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_key_varies_per_slot_and_party() {
        let a = dedup_key("dedup", "paris_75", "a1", "2024-03-05|09:00");
        let b = dedup_key("dedup", "paris_75", "a1", "2024-03-05|10:30");
        let c = dedup_key("dedup", "paris_75", "a2", "2024-03-05|09:00");
        assert_ne!(a, b);
        assert_ne!(a, c);
        // Deterministic for the same detection
        assert_eq!(a, dedup_key("dedup", "paris_75", "a1", "2024-03-05|09:00"));
    }

    #[tokio::test]
    async fn test_memory_gate_admits_once() {
        let gate = MemoryDedupGate::new(&DedupConfig::default());
        assert!(gate.first_seen("paris_75", "a1", "2024-03-05|09:00").await);
        assert!(!gate.first_seen("paris_75", "a1", "2024-03-05|09:00").await);
        // Different slot is a new detection
        assert!(gate.first_seen("paris_75", "a1", "2024-03-06|09:00").await);
    }

    #[tokio::test]
    async fn test_memory_gate_clear_target() {
        let gate = MemoryDedupGate::new(&DedupConfig::default());
        gate.first_seen("paris_75", "a1", "2024-03-05|09:00").await;
        gate.first_seen("paris_75", "a2", "2024-03-05|09:00").await;
        gate.first_seen("lyon_69", "a1", "2024-03-05|09:00").await;

        assert_eq!(gate.clear_target("paris_75").await, 2);
        // Cleared detections are admitted again, others stay suppressed
        assert!(gate.first_seen("paris_75", "a1", "2024-03-05|09:00").await);
        assert!(!gate.first_seen("lyon_69", "a1", "2024-03-05|09:00").await);
    }

    #[tokio::test]
    async fn test_memory_gate_expires() {
        let config = DedupConfig {
            ttl_secs: 0,
            ..Default::default()
        };
        let gate = MemoryDedupGate::new(&config);
        assert!(gate.first_seen("paris_75", "a1", "any").await);
        // Zero TTL means the marker is gone by the next call
        assert!(gate.first_seen("paris_75", "a1", "any").await);
    }

    #[tokio::test]
    #[ignore = "Requires running Redis"]
    async fn test_redis_gate_admits_once() {
        let gate = RedisDedupGate::try_new(&RedisConfig::default(), &DedupConfig::default())
            .expect("pool");
        let signature = format!("{}", uuid::Uuid::new_v4());
        assert!(gate.first_seen("it_target", "it_party", &signature).await);
        assert!(!gate.first_seen("it_target", "it_party", &signature).await);
    }
}
