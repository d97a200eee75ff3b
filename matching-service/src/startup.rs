//! Application startup and lifecycle management.

use crate::config::MatchingConfig;
use crate::engine::orchestrator::{MatchCommands, Orchestrator};
use crate::handlers;
use crate::services::{
    init_metrics, Database, EventPublisher, FixedFxRates, FxRateSource, HttpFxRateProvider,
    LogEventPublisher, MatchStore,
};
use crate::workers::{EvaluationJob, EvaluationPool};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use backoff::future::retry;
use backoff::ExponentialBackoff;
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::request_id::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: MatchingConfig,
    pub store: Arc<dyn MatchStore>,
    pub commands: Arc<MatchCommands>,
    pub jobs: mpsc::Sender<EvaluationJob>,
}

/// Build the HTTP router. Public so integration tests can mount the same
/// routes over an in-memory store.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/internal/evaluations", post(handlers::request_evaluation))
        .route(
            "/internal/documents/:document_id/confirm",
            post(handlers::confirm_suggestion),
        )
        .route(
            "/internal/documents/:document_id/dismiss",
            post(handlers::dismiss_suggestion),
        )
        .route(
            "/internal/documents/:document_id/match",
            post(handlers::manual_match),
        )
        .route(
            "/internal/documents/:document_id/unlink",
            post(handlers::unlink),
        )
        .route(
            "/internal/teams/:team_id/decisions",
            get(handlers::list_decisions),
        )
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: MatchingConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: MatchingConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(
        config: MatchingConfig,
        run_migrations: bool,
    ) -> Result<Self, AppError> {
        config.scoring.validate()?;

        // Initialize metrics
        init_metrics();

        // Connect to database, retrying while it comes up
        let connect_backoff = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        let db = retry(connect_backoff, || async {
            Database::new(
                &config.database.url,
                config.database.max_connections,
                config.database.min_connections,
            )
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "PostgreSQL not reachable yet, retrying");
                backoff::Error::transient(e)
            })
        })
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        // Run migrations only if requested
        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let store: Arc<dyn MatchStore> = Arc::new(db);

        let fx: Arc<dyn FxRateSource> = if config.fx.base_url.is_empty() {
            tracing::warn!(
                "FX_SERVICE_URL is not set, cross-currency scoring uses the built-in rate table"
            );
            Arc::new(FixedFxRates::default())
        } else {
            Arc::new(HttpFxRateProvider::new(
                config.fx.base_url.clone(),
                config.fx.timeout_secs,
            )?)
        };

        let events: Arc<dyn EventPublisher> = Arc::new(LogEventPublisher);

        let engine = Arc::new(Orchestrator::new(
            store.clone(),
            fx,
            events.clone(),
            config.scoring.clone(),
        ));
        let commands = Arc::new(MatchCommands::new(store.clone(), events));

        // Start evaluation workers
        let (pool, jobs) = EvaluationPool::new(config.worker.clone(), engine);
        tokio::spawn(async move {
            pool.start().await;
        });

        let state = AppState {
            config: config.clone(),
            store,
            commands,
            jobs,
        };

        // Bind HTTP listener
        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind TCP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "Matching service listener bound");

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get a handle to the match store.
    pub fn store(&self) -> Arc<dyn MatchStore> {
        self.state.store.clone()
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = api_router(self.state.clone());

        tracing::info!(
            service = "matching-service",
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready to accept connections"
        );

        axum::serve(self.listener, router).await
    }
}
