//! Common test utilities for matching-service integration tests.
//!
//! Tests run against the in-memory store so no database is required; the
//! HTTP surface is mounted through the same router the service uses.

#![allow(dead_code)]

use chrono::{NaiveDate, Utc};
use matching_service::config::{
    DatabaseConfig, FxConfig, MatchingConfig, ScoringConfig, WorkerConfig,
};
use matching_service::engine::orchestrator::{MatchCommands, Orchestrator};
use matching_service::models::{InboxDocument, Transaction};
use matching_service::services::{init_metrics, CapturingEventPublisher, FixedFxRates, InMemoryStore};
use matching_service::startup::{api_router, AppState};
use matching_service::workers::EvaluationPool;
use rust_decimal::Decimal;
use service_core::config::{Config as CoreConfig, Environment};
use std::future::Future;
use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;
use tokio::net::TcpListener;
use uuid::Uuid;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,matching_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

fn test_config() -> MatchingConfig {
    MatchingConfig {
        common: CoreConfig {
            port: 0,
            environment: Environment::Dev,
        },
        service_name: "matching-service-test".to_string(),
        service_version: "test".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        // Never connected; everything runs on the in-memory store.
        database: DatabaseConfig {
            url: "postgres://unused".to_string(),
            max_connections: 2,
            min_connections: 1,
        },
        fx: FxConfig {
            base_url: String::new(),
            timeout_secs: 1,
        },
        worker: WorkerConfig {
            enabled: true,
            worker_count: 2,
            queue_size: 16,
            evaluation_budget_secs: 5,
            max_requeues: 1,
        },
        scoring: ScoringConfig::default(),
    }
}

/// Rate table used by every test: EUR to USD at 1.05 through January,
/// 1.075 from February 2024 on.
pub fn test_fx_rates() -> FixedFxRates {
    let mut rates = FixedFxRates::new();
    rates.insert("EUR", "USD", date(2024, 1, 1), Decimal::new(1050, 3));
    rates.insert("EUR", "USD", date(2024, 2, 1), Decimal::new(1075, 3));
    rates
}

/// The engine wired to an in-memory store and a capturing event publisher.
pub struct TestEngine {
    pub store: Arc<InMemoryStore>,
    pub events: Arc<CapturingEventPublisher>,
    pub engine: Orchestrator,
    pub team_id: Uuid,
}

pub fn test_engine() -> TestEngine {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let events = Arc::new(CapturingEventPublisher::new());
    let engine = Orchestrator::new(
        store.clone(),
        Arc::new(test_fx_rates()),
        events.clone(),
        ScoringConfig::default(),
    );
    TestEngine {
        store,
        events,
        engine,
        team_id: Uuid::new_v4(),
    }
}

/// Test application wrapper: the full router plus the worker pool, served
/// on a random port.
pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub team_id: Uuid,
    pub store: Arc<InMemoryStore>,
    pub events: Arc<CapturingEventPublisher>,
}

impl TestApp {
    pub async fn spawn() -> Self {
        init_tracing();
        // Required for the metrics endpoint test.
        init_metrics();
        let config = test_config();

        let store = Arc::new(InMemoryStore::new());
        let events = Arc::new(CapturingEventPublisher::new());
        let engine = Arc::new(Orchestrator::new(
            store.clone(),
            Arc::new(test_fx_rates()),
            events.clone(),
            config.scoring.clone(),
        ));
        let commands = Arc::new(MatchCommands::new(store.clone(), events.clone()));

        let (pool, jobs) = EvaluationPool::new(config.worker.clone(), engine);
        tokio::spawn(async move {
            pool.start().await;
        });

        let state = AppState {
            config,
            store: store.clone(),
            commands,
            jobs,
        };

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test listener");
        let port = listener
            .local_addr()
            .expect("Failed to read local address")
            .port();
        let router = api_router(state);
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });

        TestApp {
            address: format!("http://127.0.0.1:{}", port),
            port,
            team_id: Uuid::new_v4(),
            store,
            events,
        }
    }
}

/// Polls a condition until it holds or roughly five seconds pass.
pub async fn wait_until<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// A card purchase of 49.99 USD on 2024-03-01 at Acme.
pub fn transaction(team_id: Uuid) -> Transaction {
    Transaction {
        transaction_id: Uuid::new_v4(),
        team_id,
        bank_account_id: Uuid::new_v4(),
        amount_minor: -4999,
        currency: "USD".to_string(),
        transaction_date: date(2024, 3, 1),
        counterparty_name: Some("Acme Inc".to_string()),
        raw_description: "CARD PURCHASE ACME INC".to_string(),
        matched_document_id: None,
        match_confidence: None,
        created_utc: Utc::now(),
        updated_utc: Utc::now(),
    }
}

/// A pending receipt that matches [`transaction`] exactly.
pub fn document(team_id: Uuid) -> InboxDocument {
    InboxDocument {
        document_id: Uuid::new_v4(),
        team_id,
        extracted_amount: Some(Decimal::new(4999, 2)),
        extracted_currency: Some("USD".to_string()),
        extracted_date: Some(date(2024, 3, 1)),
        extracted_counterparty: Some("Acme Inc.".to_string()),
        status: "pending".to_string(),
        matched_transaction_id: None,
        match_confidence: None,
        suggested_transaction_id: None,
        suggested_confidence: None,
        evaluation_attempts: 0,
        last_evaluated_utc: None,
        created_utc: Utc::now(),
        updated_utc: Utc::now(),
    }
}
