//! Content-addressed and similarity response cache.
//!
//! Backed by Redis when configured; degrades to a silent no-op when the
//! backend is unset or unreachable, with the choice made once behind a
//! single factory function.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use crate::config::LlmCacheConfig;
use crate::types::{CacheError, CachedPattern, PatternMemory, PatternSignature, TimelineEntry};

/// Pluggable response cache. All methods return `Result` so a caller can
/// log a degrade warning, but no caller should ever treat an `Err` here
/// as fatal — a cache miss is always a safe fallback to a fresh model
/// call.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    /// Block (briefly) until the backend connection is confirmed, or
    /// return an error if it never becomes ready. Callers should still
    /// treat the error as "run uncached", not as startup failure.
    async fn wait_for_ready(&self, timeout: Duration) -> Result<(), CacheError>;

    async fn get_exact(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn put_exact(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Find the closest cached pattern to `embedding` above
    /// `similarity_threshold`, scanning at most `scan_limit` entries.
    async fn find_similar(
        &self,
        embedding: &[f32],
        similarity_threshold: f64,
        scan_limit: usize,
    ) -> Result<Option<CachedPattern>, CacheError>;

    async fn remember_pattern(&self, pattern: CachedPattern) -> Result<(), CacheError>;

    // --- Memory extension: same store, distinct key space. ---

    /// Append a query to a session's recent-query list (hour-scale TTL,
    /// refreshed on every write).
    async fn record_session_query(&self, session_id: &str, query: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Most recent queries for a session, newest first.
    async fn recent_session_queries(&self, session_id: &str, limit: usize) -> Result<Vec<String>, CacheError>;

    /// Record an incident in the time-ordered timeline, trimming to
    /// `max_incidents` afterward.
    async fn record_timeline_incident(&self, entry: TimelineEntry, max_incidents: usize) -> Result<(), CacheError>;

    /// Most recent timeline entries, newest first.
    async fn recent_timeline(&self, limit: usize) -> Result<Vec<TimelineEntry>, CacheError>;

    /// Bump a pattern signature's frequency/last-seen, optionally
    /// appending a resolution, and return the updated memory.
    async fn record_pattern_resolution(
        &self,
        signature: &PatternSignature,
        resolution: Option<&str>,
        now: SystemTime,
    ) -> Result<PatternMemory, CacheError>;

    /// All remembered patterns whose frequency is at or above
    /// `min_frequency` — the investigation loop's "confidence floor".
    async fn patterns_above_confidence(&self, min_frequency: u64) -> Result<Vec<PatternMemory>, CacheError>;
}

/// Deterministic, dependency-free feature-hash embedding: identity
/// tokens (pod/namespace/error-class) are weighted 3x over generic word
/// shingles, then hashed via FNV-1a into a 128-dimension vector and
/// L2-normalized. Substitutes for a learned embedding while preserving
/// its dimensionality/similarity contract.
pub const EMBEDDING_DIMS: usize = 128;

pub fn embed(text: &str) -> Vec<f32> {
    let mut vec = vec![0f32; EMBEDDING_DIMS];
    let lowered = text.to_lowercase();

    let identity_re = regex::Regex::new(r"(pod/[\w-]+|ns/[\w-]+|timeout|connectionrefused|oomkilled|crashloopbackoff)")
        .expect("identity pattern is valid");
    for m in identity_re.find_iter(&lowered) {
        accumulate(&mut vec, m.as_str(), 3.0);
    }
    for word in lowered.split_whitespace() {
        accumulate(&mut vec, word, 1.0);
    }

    let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vec.iter_mut() {
            *v /= norm;
        }
    }
    vec
}

fn accumulate(vec: &mut [f32], token: &str, weight: f32) {
    let idx = fnv1a(token.as_bytes()) as usize % vec.len();
    vec[idx] += weight;
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    dot as f64
}

pub fn content_key(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// No-op cache used when no Redis URL is configured, or once the real
/// backend has been confirmed unreachable for this process lifetime.
pub struct NullCache;

#[async_trait]
impl ResponseCache for NullCache {
    async fn wait_for_ready(&self, _timeout: Duration) -> Result<(), CacheError> {
        Ok(())
    }

    async fn get_exact(&self, _key: &str) -> Result<Option<String>, CacheError> {
        Ok(None)
    }

    async fn put_exact(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), CacheError> {
        Ok(())
    }

    async fn find_similar(
        &self,
        _embedding: &[f32],
        _similarity_threshold: f64,
        _scan_limit: usize,
    ) -> Result<Option<CachedPattern>, CacheError> {
        Ok(None)
    }

    async fn remember_pattern(&self, _pattern: CachedPattern) -> Result<(), CacheError> {
        Ok(())
    }

    async fn record_session_query(&self, _session_id: &str, _query: &str, _ttl: Duration) -> Result<(), CacheError> {
        Ok(())
    }

    async fn recent_session_queries(&self, _session_id: &str, _limit: usize) -> Result<Vec<String>, CacheError> {
        Ok(Vec::new())
    }

    async fn record_timeline_incident(&self, _entry: TimelineEntry, _max_incidents: usize) -> Result<(), CacheError> {
        Ok(())
    }

    async fn recent_timeline(&self, _limit: usize) -> Result<Vec<TimelineEntry>, CacheError> {
        Ok(Vec::new())
    }

    async fn record_pattern_resolution(
        &self,
        signature: &PatternSignature,
        resolution: Option<&str>,
        now: SystemTime,
    ) -> Result<PatternMemory, CacheError> {
        Ok(PatternMemory {
            signature: signature.clone(),
            frequency: 1,
            last_seen: now,
            resolutions: resolution.into_iter().map(String::from).collect(),
        })
    }

    async fn patterns_above_confidence(&self, _min_frequency: u64) -> Result<Vec<PatternMemory>, CacheError> {
        Ok(Vec::new())
    }
}

/// Redis-backed cache. Content-addressed entries live under
/// `sentinel:cache:<key>`; similarity candidates are kept in a bounded
/// list under `sentinel:patterns`. The memory extension lives in its
/// own key space: per-session recent queries (`sentinel:session:<id>`,
/// hour-scale TTL), an incident timeline sorted set
/// (`sentinel:incident:timeline`), and pattern-signature memory
/// (`sentinel:patterns:signatures`).
pub struct RedisCache {
    client: redis::Client,
    conn: RwLock<Option<redis::aio::MultiplexedConnection>>,
    max_patterns_scanned: usize,
}

const TIMELINE_KEY: &str = "sentinel:incident:timeline";
const PATTERNS_KEY: &str = "sentinel:patterns:signatures";
const SESSION_QUERY_CAP: usize = 50;
const PATTERN_RESOLUTION_CAP: usize = 20;

impl RedisCache {
    pub fn new(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url).map_err(|e| CacheError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            conn: RwLock::new(None),
            max_patterns_scanned: 500,
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, CacheError> {
        if let Some(conn) = self.conn.read().clone() {
            return Ok(conn);
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        *self.conn.write() = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl ResponseCache for RedisCache {
    async fn wait_for_ready(&self, timeout: Duration) -> Result<(), CacheError> {
        tokio::time::timeout(timeout, self.connection())
            .await
            .map_err(|_| CacheError::Unavailable("timed out waiting for redis".into()))??;
        Ok(())
    }

    async fn get_exact(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection().await?;
        redis::cmd("GET")
            .arg(format!("sentinel:cache:{key}"))
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::OperationFailed(e.to_string()))
    }

    async fn put_exact(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        redis::cmd("SET")
            .arg(format!("sentinel:cache:{key}"))
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| CacheError::OperationFailed(e.to_string()))
    }

    async fn find_similar(
        &self,
        embedding: &[f32],
        similarity_threshold: f64,
        scan_limit: usize,
    ) -> Result<Option<CachedPattern>, CacheError> {
        let mut conn = self.connection().await?;
        let limit = scan_limit.min(self.max_patterns_scanned);
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg("sentinel:patterns")
            .arg(0)
            .arg(limit as isize - 1)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::OperationFailed(e.to_string()))?;

        let mut best: Option<(f64, CachedPattern)> = None;
        for entry in raw {
            let Ok(pattern) = serde_json::from_str::<CachedPattern>(&entry) else { continue };
            let sim = cosine_similarity(embedding, &pattern.embedding);
            if sim >= similarity_threshold {
                if best.as_ref().map(|(s, _)| sim > *s).unwrap_or(true) {
                    best = Some((sim, pattern));
                }
            }
        }
        Ok(best.map(|(_, p)| p))
    }

    async fn remember_pattern(&self, pattern: CachedPattern) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let encoded = serde_json::to_string(&pattern).map_err(|e| CacheError::OperationFailed(e.to_string()))?;
        redis::cmd("LPUSH")
            .arg("sentinel:patterns")
            .arg(encoded)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| CacheError::OperationFailed(e.to_string()))?;
        redis::cmd("LTRIM")
            .arg("sentinel:patterns")
            .arg(0)
            .arg(self.max_patterns_scanned as isize - 1)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| CacheError::OperationFailed(e.to_string()))
    }

    async fn record_session_query(&self, session_id: &str, query: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let key = format!("sentinel:session:{session_id}");
        redis::cmd("LPUSH")
            .arg(&key)
            .arg(query)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| CacheError::OperationFailed(e.to_string()))?;
        redis::cmd("LTRIM")
            .arg(&key)
            .arg(0)
            .arg(SESSION_QUERY_CAP as isize - 1)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| CacheError::OperationFailed(e.to_string()))?;
        redis::cmd("EXPIRE")
            .arg(&key)
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| CacheError::OperationFailed(e.to_string()))
    }

    async fn recent_session_queries(&self, session_id: &str, limit: usize) -> Result<Vec<String>, CacheError> {
        let mut conn = self.connection().await?;
        redis::cmd("LRANGE")
            .arg(format!("sentinel:session:{session_id}"))
            .arg(0)
            .arg(limit as isize - 1)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::OperationFailed(e.to_string()))
    }

    async fn record_timeline_incident(&self, entry: TimelineEntry, max_incidents: usize) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let score = entry
            .timestamp
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        let encoded = serde_json::to_string(&entry).map_err(|e| CacheError::OperationFailed(e.to_string()))?;
        redis::cmd("ZADD")
            .arg(TIMELINE_KEY)
            .arg(score)
            .arg(encoded)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| CacheError::OperationFailed(e.to_string()))?;

        let len: usize = redis::cmd("ZCARD")
            .arg(TIMELINE_KEY)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::OperationFailed(e.to_string()))?;
        if len > max_incidents {
            redis::cmd("ZREMRANGEBYRANK")
                .arg(TIMELINE_KEY)
                .arg(0)
                .arg((len - max_incidents) as isize - 1)
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(|e| CacheError::OperationFailed(e.to_string()))?;
        }
        Ok(())
    }

    async fn recent_timeline(&self, limit: usize) -> Result<Vec<TimelineEntry>, CacheError> {
        let mut conn = self.connection().await?;
        let raw: Vec<String> = redis::cmd("ZREVRANGE")
            .arg(TIMELINE_KEY)
            .arg(0)
            .arg(limit as isize - 1)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::OperationFailed(e.to_string()))?;
        Ok(raw.into_iter().filter_map(|s| serde_json::from_str(&s).ok()).collect())
    }

    async fn record_pattern_resolution(
        &self,
        signature: &PatternSignature,
        resolution: Option<&str>,
        now: SystemTime,
    ) -> Result<PatternMemory, CacheError> {
        let mut conn = self.connection().await?;
        let field = signature.key();
        let existing: Option<String> = redis::cmd("HGET")
            .arg(PATTERNS_KEY)
            .arg(&field)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::OperationFailed(e.to_string()))?;

        let mut memory = existing
            .and_then(|raw| serde_json::from_str::<PatternMemory>(&raw).ok())
            .unwrap_or_else(|| PatternMemory {
                signature: signature.clone(),
                frequency: 0,
                last_seen: now,
                resolutions: Vec::new(),
            });
        memory.frequency += 1;
        memory.last_seen = now;
        if let Some(resolution) = resolution {
            memory.resolutions.push(resolution.to_string());
            if memory.resolutions.len() > PATTERN_RESOLUTION_CAP {
                memory.resolutions.remove(0);
            }
        }

        let encoded = serde_json::to_string(&memory).map_err(|e| CacheError::OperationFailed(e.to_string()))?;
        redis::cmd("HSET")
            .arg(PATTERNS_KEY)
            .arg(&field)
            .arg(encoded)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| CacheError::OperationFailed(e.to_string()))?;
        Ok(memory)
    }

    async fn patterns_above_confidence(&self, min_frequency: u64) -> Result<Vec<PatternMemory>, CacheError> {
        let mut conn = self.connection().await?;
        let raw: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(PATTERNS_KEY)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::OperationFailed(e.to_string()))?;
        Ok(raw
            .values()
            .filter_map(|s| serde_json::from_str::<PatternMemory>(s).ok())
            .filter(|p| p.frequency >= min_frequency)
            .collect())
    }
}

/// Build the configured cache backend, falling back to [`NullCache`]
/// when no Redis URL is set or the connection cannot be established —
/// this is the "cache/store unavailability -> silent degrade" policy.
pub async fn build_cache(config: &LlmCacheConfig) -> Arc<dyn ResponseCache> {
    let Some(redis_cfg) = &config.redis else {
        return Arc::new(NullCache);
    };
    match RedisCache::new(&redis_cfg.url) {
        Ok(cache) => {
            if cache.wait_for_ready(Duration::from_secs(2)).await.is_err() {
                tracing::warn!("response cache unreachable at startup, degrading to no-op");
                return Arc::new(NullCache);
            }
            Arc::new(cache)
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to construct response cache, degrading to no-op");
            Arc::new(NullCache)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embeddings_are_unit_length() {
        let v = embed("pod/payments-7f4 CrashLoopBackOff timeout connecting to db");
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4 || norm == 0.0);
    }

    #[test]
    fn similar_text_has_high_cosine_similarity() {
        let a = embed("pod/payments-7f4 CrashLoopBackOff timeout connecting to db");
        let b = embed("pod/payments-9a2 CrashLoopBackOff timeout connecting to db");
        let sim = cosine_similarity(&a, &b);
        assert!(sim > 0.7, "expected high similarity, got {sim}");
    }

    #[test]
    fn dissimilar_text_has_low_cosine_similarity() {
        let a = embed("pod/payments-7f4 CrashLoopBackOff timeout connecting to db");
        let b = embed("disk usage warning on ns/monitoring volume nearly full");
        let sim = cosine_similarity(&a, &b);
        assert!(sim < 0.5, "expected low similarity, got {sim}");
    }

    #[tokio::test]
    async fn null_cache_always_misses() {
        let cache = NullCache;
        assert!(cache.get_exact("k").await.unwrap().is_none());
        assert!(cache.find_similar(&[0.0; EMBEDDING_DIMS], 0.8, 10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn null_cache_memory_extension_is_inert_except_for_resolution_synthesis() {
        let cache = NullCache;
        assert!(cache.recent_session_queries("s1", 5).await.unwrap().is_empty());
        assert!(cache.recent_timeline(5).await.unwrap().is_empty());
        assert!(cache.patterns_above_confidence(1).await.unwrap().is_empty());

        let signature = PatternSignature {
            service: "payments".into(),
            error_class: "oomkilled".into(),
            severity: "critical".into(),
        };
        let memory = cache
            .record_pattern_resolution(&signature, Some("raised memory limits"), SystemTime::now())
            .await
            .unwrap();
        assert_eq!(memory.frequency, 1);
        assert_eq!(memory.resolutions, vec!["raised memory limits".to_string()]);
    }

    #[test]
    fn pattern_signature_key_joins_its_three_fields() {
        let sig = PatternSignature {
            service: "payments".into(),
            error_class: "oomkilled".into(),
            severity: "critical".into(),
        };
        assert_eq!(sig.key(), "payments:oomkilled:critical");
    }
}
