//! Per-identity request budgets
//!
//! Fixed-window counters keyed by `ratelimit:<class>:<identity>`, enforced by an
//! explicit middleware stage that is configured per endpoint class.

mod middleware;
mod store;

pub use middleware::{enforce_rate_limit, RateLimitStage};
pub use store::{CounterStore, InMemoryCounterStore, RedisCounterStore, WindowHit};

use crate::audit::AuditLog;
use crate::config::RateLimitConfig;
use crate::metrics::Metrics;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Endpoint classes with independent budgets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointClass {
    Auth,
    Query,
    General,
    Sensitive,
}

impl EndpointClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointClass::Auth => "auth",
            EndpointClass::Query => "query",
            EndpointClass::General => "general",
            EndpointClass::Sensitive => "sensitive",
        }
    }
}

/// Builds middleware stages that share one counter store
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    config: RateLimitConfig,
    metrics: Arc<Metrics>,
    audit: Arc<AuditLog>,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        config: RateLimitConfig,
        metrics: Arc<Metrics>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            store,
            config,
            metrics,
            audit,
        }
    }

    pub fn limit_for(&self, class: EndpointClass) -> u64 {
        match class {
            EndpointClass::Auth => self.config.auth_per_window,
            EndpointClass::Query => self.config.query_per_window,
            EndpointClass::General => self.config.general_per_window,
            EndpointClass::Sensitive => self.config.sensitive_per_window,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.config.window_secs)
    }

    /// Middleware configuration for one endpoint class
    pub fn stage(&self, class: EndpointClass) -> RateLimitStage {
        RateLimitStage {
            class,
            limit: self.limit_for(class),
            window: self.window(),
            trusted_proxies: Arc::new(self.config.trusted_proxies.clone()),
            store: self.store.clone(),
            metrics: self.metrics.clone(),
            audit: self.audit.clone(),
        }
    }
}

/// Counter key for an identity within a class
pub fn bucket_key(class: EndpointClass, identity: &str) -> String {
    format!("ratelimit:{}:{}", class.as_str(), identity)
}
