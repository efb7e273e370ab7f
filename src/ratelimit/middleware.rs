//! Rate limiting middleware stage

use super::{bucket_key, CounterStore, EndpointClass, WindowHit};
use crate::audit::{AuditEvent, AuditEventType, AuditLog};
use crate::auth::Claims;
use crate::error::AppError;
use crate::metrics::Metrics;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Configuration of one rate limiting stage
#[derive(Clone)]
pub struct RateLimitStage {
    pub class: EndpointClass,
    pub limit: u64,
    pub window: Duration,
    pub(super) trusted_proxies: Arc<Vec<IpAddr>>,
    pub(super) store: Arc<dyn CounterStore>,
    pub(super) metrics: Arc<Metrics>,
    pub(super) audit: Arc<AuditLog>,
}

/// Authenticated principal first, then the client address
fn identity(request: &Request, trusted_proxies: &[IpAddr]) -> String {
    if let Some(claims) = request.extensions().get::<Claims>() {
        return claims.identity();
    }
    match client_ip(request, trusted_proxies) {
        Some(ip) => format!("ip:{}", ip),
        None => "ip:unknown".to_string(),
    }
}

/// The socket peer, or the first forwarded hop when the peer is a trusted proxy
fn client_ip(request: &Request, trusted_proxies: &[IpAddr]) -> Option<IpAddr> {
    let ConnectInfo(peer) = request.extensions().get::<ConnectInfo<SocketAddr>>()?;
    let peer = peer.ip();
    if trusted_proxies.contains(&peer) {
        if let Some(forwarded) = forwarded_for(request.headers()) {
            return Some(forwarded);
        }
    }
    Some(peer)
}

fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|hop| hop.trim().parse().ok())
}

fn set_limit_headers(headers: &mut HeaderMap, limit: u64, hit: &WindowHit) {
    headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
    headers.insert(
        "x-ratelimit-remaining",
        HeaderValue::from(limit.saturating_sub(hit.count)),
    );
}

/// Whole seconds until the window resets, rounded up
fn retry_after_secs(resets_in: Duration) -> u64 {
    let secs = resets_in.as_secs() + u64::from(resets_in.subsec_nanos() > 0);
    secs.max(1)
}

pub async fn enforce_rate_limit(
    State(stage): State<RateLimitStage>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let identity = identity(&request, &stage.trusted_proxies);
    let key = bucket_key(stage.class, &identity);
    let hit = stage.store.hit(&key, stage.limit, stage.window).await?;

    if !hit.admitted {
        let retry_after = retry_after_secs(hit.resets_in);
        warn!(
            "rate limit exceeded for {} on {} ({}/{})",
            identity,
            stage.class.as_str(),
            hit.count,
            stage.limit
        );
        stage.metrics.record_rate_limited();
        stage
            .audit
            .record(
                AuditEvent::new(AuditEventType::RateLimitExceeded, "endpoint")
                    .actor(identity.clone())
                    .resource(request.uri().path().to_string())
                    .details(json!({
                        "class": stage.class,
                        "limit": stage.limit,
                        "retry_after": retry_after,
                    })),
            )
            .await;
        return Err(AppError::RateLimited {
            class: stage.class.as_str().to_string(),
            limit: stage.limit,
            retry_after_secs: retry_after,
        });
    }

    let mut response = next.run(request).await;
    set_limit_headers(response.headers_mut(), stage.limit, &hit);
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::InMemoryCounterStore;
    use axum::{body::Body, http::StatusCode, middleware, routing::get, Router};
    use tower::ServiceExt;

    fn router(limit: u64, trusted_proxies: Vec<IpAddr>) -> (Router, Arc<Metrics>, Arc<AuditLog>) {
        let metrics = Arc::new(Metrics::new());
        let audit = Arc::new(AuditLog::new());
        let stage = RateLimitStage {
            class: EndpointClass::Auth,
            limit,
            window: Duration::from_secs(60),
            trusted_proxies: Arc::new(trusted_proxies),
            store: Arc::new(InMemoryCounterStore::new()),
            metrics: metrics.clone(),
            audit: audit.clone(),
        };
        let app = Router::new()
            .route("/login", get(|| async { "ok" }))
            .route_layer(middleware::from_fn_with_state(stage, enforce_rate_limit));
        (app, metrics, audit)
    }

    fn from(peer: &str, forwarded: Option<&str>) -> Request {
        let mut builder = Request::builder().uri("/login");
        if let Some(forwarded) = forwarded {
            builder = builder.header("x-forwarded-for", forwarded);
        }
        let mut request = builder.body(Body::empty()).unwrap();
        let peer: IpAddr = peer.parse().unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::new(peer, 51000)));
        request
    }

    #[tokio::test]
    async fn test_rejects_after_limit_with_retry_after() {
        let (app, metrics, audit) = router(2, Vec::new());

        for remaining in ["1", "0"] {
            let response = app.clone().oneshot(from("10.1.1.1", None)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()["x-ratelimit-limit"], "2");
            assert_eq!(response.headers()["x-ratelimit-remaining"], remaining);
        }

        let response = app.clone().oneshot(from("10.1.1.1", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry: u64 = response.headers()["retry-after"].to_str().unwrap().parse().unwrap();
        assert!((1..=60).contains(&retry));
        assert_eq!(metrics.snapshot().rate_limited, 1);
        assert_eq!(audit.count().await, 1);

        // Separate peer, separate bucket
        let response = app.oneshot(from("10.2.2.2", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_rotating_forwarded_for_does_not_reset_budget() {
        let (app, _, _) = router(2, Vec::new());

        let mut admitted = 0;
        for i in 0..20 {
            let hop = format!("203.0.113.{}", i);
            let response = app
                .clone()
                .oneshot(from("198.51.100.7", Some(&hop)))
                .await
                .unwrap();
            if response.status() == StatusCode::OK {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 2);
    }

    #[tokio::test]
    async fn test_forwarded_for_honoured_behind_trusted_proxy() {
        let proxy: IpAddr = "10.0.0.1".parse().unwrap();
        let (app, _, _) = router(1, vec![proxy]);

        let first = app
            .clone()
            .oneshot(from("10.0.0.1", Some("203.0.113.5, 10.0.0.1")))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let again = app
            .clone()
            .oneshot(from("10.0.0.1", Some("203.0.113.5")))
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::TOO_MANY_REQUESTS);

        // Another client behind the same proxy has its own budget
        let other = app
            .clone()
            .oneshot(from("10.0.0.1", Some("203.0.113.6")))
            .await
            .unwrap();
        assert_eq!(other.status(), StatusCode::OK);

        // An unparseable hop falls back to the proxy address itself
        let garbled = app.oneshot(from("10.0.0.1", Some("unknown"))).await.unwrap();
        assert_eq!(garbled.status(), StatusCode::OK);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(retry_after_secs(Duration::from_millis(1500)), 2);
        assert_eq!(retry_after_secs(Duration::from_secs(40)), 40);
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
    }
}
