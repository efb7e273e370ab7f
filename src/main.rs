//! Governed Query Gateway
//!
//! Runs analyst SQL against regulated banking datasets behind a read-only
//! gate, a dataset policy guard and human approval for high-PII data. Every
//! outcome is sealed into a signed evidence pack.

mod approval;
mod audit;
mod auth;
mod catalog;
mod config;
mod db;
mod error;
mod evidence;
mod guard;
mod metrics;
mod query;
mod ratelimit;
mod routes;
mod state;
mod users;

use crate::catalog::DatasetCatalog;
use crate::config::Settings;
use crate::query::{DetachedEngine, PostgresEngine, QueryEngine};
use crate::ratelimit::{CounterStore, InMemoryCounterStore, RedisCounterStore};
use crate::routes::create_router;
use crate::state::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("🚀 Starting Governed Query Gateway...");

    let settings = Settings::load()?;
    info!("📋 Configuration loaded successfully");

    let counters: Arc<dyn CounterStore> = match &settings.redis.url {
        Some(url) => {
            let store = RedisCounterStore::connect(url).await?;
            info!("✅ Shared counter store connected");
            Arc::new(store)
        }
        None => {
            warn!("⚠️  REDIS_URL not set, rate limits and budgets are per-process");
            let store = Arc::new(InMemoryCounterStore::new());
            spawn_counter_pruning(store.clone(), settings.rate_limits.window_secs);
            store as Arc<dyn CounterStore>
        }
    };

    let engine: Arc<dyn QueryEngine> = match &settings.database.url {
        Some(url) => {
            let pool = db::init_database_pool(&settings.database, url).await?;
            Arc::new(PostgresEngine::new(
                pool,
                Duration::from_secs(settings.database.query_timeout_secs),
            ))
        }
        None => {
            warn!("⚠️  DATABASE_URL not set, approved queries will fail at execution");
            Arc::new(DetachedEngine)
        }
    };

    let catalog = match &settings.catalog_path {
        Some(path) => DatasetCatalog::from_file(path).await?,
        None => DatasetCatalog::builtin(),
    };

    let state = Arc::new(AppState::new(&settings, counters, engine, catalog));

    if let (Some(email), Some(password)) = (
        &settings.security.bootstrap_admin_email,
        &settings.security.bootstrap_admin_password,
    ) {
        state.users.bootstrap_admin(email, password).await?;
    }

    let app = create_router(state, &settings);

    let addr = SocketAddr::from((settings.server.host, settings.server.port));

    info!("🌐 Server listening on http://{}", addr);
    info!("📚 API Endpoints:");
    info!("   POST /v1/auth/login                        - Login with email/password");
    info!("   POST /v1/query/execute                     - Submit a governed query");
    info!("   GET  /v1/query/{{id}}                        - Poll an execution");
    info!("   POST /v1/approvals/requests                - Request high-PII access");
    info!("   POST /v1/approvals/requests/{{id}}/action    - Approve or reject");
    info!("   GET  /v1/audit/trail                       - Audit trail");
    info!("   GET  /v1/audit/evidence/{{id}}               - Evidence pack");
    info!("   POST /v1/admin/users/{{id}}/status           - Enable or disable an account");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("👋 Server shutdown complete");
    Ok(())
}

/// Initialize tracing with structured logging. `LOG_FORMAT=json` switches the
/// output to one JSON object per line.
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,governed_query=debug,tower_http=debug"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_current_span(true))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .compact(),
            )
            .init();
    }
}

/// Drop expired in-memory windows so idle identities do not accumulate
fn spawn_counter_pruning(store: Arc<InMemoryCounterStore>, window_secs: u64) {
    let window = Duration::from_secs(window_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(window);
        loop {
            ticker.tick().await;
            let pruned = store.prune().await;
            if pruned > 0 {
                tracing::debug!("pruned {} expired rate limit windows", pruned);
            }
        }
    });
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("📴 Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("📴 Received terminate signal, initiating graceful shutdown...");
        },
    }
}
