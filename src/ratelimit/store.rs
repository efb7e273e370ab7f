//! Shared counter store
//!
//! Fixed-window counters with an atomic check-and-increment. The in-memory
//! store serializes updates through one mutex; the Redis store runs the same
//! logic as a server-side script so concurrent gateways share one budget.

use crate::error::AppError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

/// Outcome of one attempt against a fixed window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowHit {
    pub admitted: bool,
    /// Count within the current window after this attempt (never above the limit)
    pub count: u64,
    /// Time until the current window resets
    pub resets_in: Duration,
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Reset the window if it has elapsed, then increment if `count < limit`.
    async fn hit(&self, key: &str, limit: u64, window: Duration) -> Result<WindowHit, AppError>;
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    count: u64,
    window_start: Instant,
    window: Duration,
}

/// Process-local counter store
pub struct InMemoryCounterStore {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Drop buckets whose own window has elapsed
    pub async fn prune(&self) -> usize {
        let mut buckets = self.buckets.lock().await;
        let before = buckets.len();
        let now = Instant::now();
        buckets.retain(|_, b| now.duration_since(b.window_start) < b.window);
        before - buckets.len()
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn hit(&self, key: &str, limit: u64, window: Duration) -> Result<WindowHit, AppError> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            count: 0,
            window_start: now,
            window,
        });

        if now.duration_since(bucket.window_start) >= window {
            bucket.count = 0;
            bucket.window_start = now;
        }
        bucket.window = window;

        let resets_in = window.saturating_sub(now.duration_since(bucket.window_start));
        if bucket.count >= limit {
            return Ok(WindowHit {
                admitted: false,
                count: bucket.count,
                resets_in,
            });
        }

        bucket.count += 1;
        Ok(WindowHit {
            admitted: true,
            count: bucket.count,
            resets_in,
        })
    }
}

/// KEYS[1] = counter, ARGV[1] = limit, ARGV[2] = window in ms.
/// Returns {admitted, count, pttl}.
const HIT_SCRIPT: &str = r#"
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local ttl = redis.call('PTTL', KEYS[1])
if ttl <= 0 then
  if limit < 1 then
    return {0, 0, window}
  end
  redis.call('SET', KEYS[1], 1, 'PX', window)
  return {1, 1, window}
end
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current >= limit then
  return {0, current, ttl}
end
current = redis.call('INCR', KEYS[1])
return {1, current, ttl}
"#;

/// Counter store backed by Redis, shared across gateway instances
pub struct RedisCounterStore {
    conn: ConnectionManager,
    script: redis::Script,
}

impl RedisCounterStore {
    pub async fn connect(url: &str) -> Result<Self, AppError> {
        let client = redis::Client::open(url)
            .map_err(|e| AppError::Config(format!("Invalid REDIS_URL: {}", e)))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| AppError::CounterStore(format!("Failed to connect to Redis: {}", e)))?;
        info!("✅ Connected to Redis counter store");
        Ok(Self {
            conn,
            script: redis::Script::new(HIT_SCRIPT),
        })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn hit(&self, key: &str, limit: u64, window: Duration) -> Result<WindowHit, AppError> {
        let mut conn = self.conn.clone();
        let window_ms = window.as_millis().max(1) as u64;
        let (admitted, count, ttl_ms): (i64, i64, i64) = self
            .script
            .key(key)
            .arg(limit)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| AppError::CounterStore(format!("Counter update failed: {}", e)))?;

        debug!("counter {} -> {} (admitted: {})", key, count, admitted == 1);
        Ok(WindowHit {
            admitted: admitted == 1,
            count: count.max(0) as u64,
            resets_in: Duration::from_millis(ttl_ms.max(0) as u64),
        })
    }
}
