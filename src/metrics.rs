//! Observability counters
//!
//! Constructed once at startup and shared through application state. All
//! increments are atomic; nothing here gates control flow.

use axum::{
    extract::{MatchedPath, Request, State},
    middleware::Next,
    response::Response,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::debug;

#[derive(Default)]
struct EndpointCounters {
    count: AtomicU64,
    success: AtomicU64,
    errors: AtomicU64,
    duration_total_ms: AtomicU64,
}

#[derive(Default)]
struct DatasetCounters {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    rows_returned: AtomicU64,
    duration_total_ms: AtomicU64,
}

pub struct Metrics {
    started_at: DateTime<Utc>,
    endpoints: RwLock<HashMap<String, Arc<EndpointCounters>>>,
    datasets: RwLock<HashMap<String, Arc<DatasetCounters>>>,
    rate_limited: AtomicU64,
    auth_failures: AtomicU64,
    policy_denials: AtomicU64,
    approvals_requested: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            endpoints: RwLock::new(HashMap::new()),
            datasets: RwLock::new(HashMap::new()),
            rate_limited: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
            policy_denials: AtomicU64::new(0),
            approvals_requested: AtomicU64::new(0),
        }
    }

    fn counters<T: Default>(map: &RwLock<HashMap<String, Arc<T>>>, key: &str) -> Arc<T> {
        if let Ok(guard) = map.read() {
            if let Some(existing) = guard.get(key) {
                return existing.clone();
            }
        }
        match map.write() {
            Ok(mut guard) => guard.entry(key.to_string()).or_default().clone(),
            // A poisoned map only loses observations
            Err(_) => Arc::new(T::default()),
        }
    }

    pub fn record_request(&self, endpoint: &str, status: u16, duration_ms: u64) {
        let counters = Self::counters(&self.endpoints, endpoint);
        counters.count.fetch_add(1, Ordering::Relaxed);
        counters.duration_total_ms.fetch_add(duration_ms, Ordering::Relaxed);
        if (200..300).contains(&status) {
            counters.success.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_query(&self, dataset_id: &str, success: bool, rows: u64, duration_ms: u64) {
        let counters = Self::counters(&self.datasets, dataset_id);
        counters.total.fetch_add(1, Ordering::Relaxed);
        counters.rows_returned.fetch_add(rows, Ordering::Relaxed);
        counters.duration_total_ms.fetch_add(duration_ms, Ordering::Relaxed);
        if success {
            counters.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_policy_denial(&self) {
        self.policy_denials.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_approval_requested(&self) {
        self.approvals_requested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let endpoints = self
            .endpoints
            .read()
            .map(|map| {
                map.iter()
                    .map(|(k, c)| {
                        let count = c.count.load(Ordering::Relaxed);
                        let total = c.duration_total_ms.load(Ordering::Relaxed);
                        (
                            k.clone(),
                            EndpointSnapshot {
                                count,
                                success: c.success.load(Ordering::Relaxed),
                                errors: c.errors.load(Ordering::Relaxed),
                                avg_duration_ms: average(total, count),
                            },
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        let datasets = self
            .datasets
            .read()
            .map(|map| {
                map.iter()
                    .map(|(k, c)| {
                        let total = c.total.load(Ordering::Relaxed);
                        let duration = c.duration_total_ms.load(Ordering::Relaxed);
                        (
                            k.clone(),
                            DatasetSnapshot {
                                total_queries: total,
                                successful_queries: c.succeeded.load(Ordering::Relaxed),
                                failed_queries: c.failed.load(Ordering::Relaxed),
                                total_rows_returned: c.rows_returned.load(Ordering::Relaxed),
                                avg_execution_ms: average(duration, total),
                            },
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        MetricsSnapshot {
            timestamp: Utc::now(),
            started_at: self.started_at,
            endpoints,
            datasets,
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            policy_denials: self.policy_denials.load(Ordering::Relaxed),
            approvals_requested: self.approvals_requested.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn average(total: u64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total as f64 / count as f64
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointSnapshot {
    pub count: u64,
    pub success: u64,
    pub errors: u64,
    pub avg_duration_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetSnapshot {
    pub total_queries: u64,
    pub successful_queries: u64,
    pub failed_queries: u64,
    pub total_rows_returned: u64,
    pub avg_execution_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub endpoints: BTreeMap<String, EndpointSnapshot>,
    pub datasets: BTreeMap<String, DatasetSnapshot>,
    pub rate_limited: u64,
    pub auth_failures: u64,
    pub policy_denials: u64,
    pub approvals_requested: u64,
}

/// Per-endpoint request accounting, keyed by `METHOD /matched/path`
pub async fn track_requests(
    State(metrics): State<Arc<Metrics>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let endpoint = format!("{} {}", request.method(), path);
    let started = Instant::now();

    let response = next.run(request).await;

    let elapsed = started.elapsed().as_millis() as u64;
    let status = response.status().as_u16();
    debug!("{} -> {} in {}ms", endpoint, status, elapsed);
    metrics.record_request(&endpoint, status, elapsed);
    response
}
