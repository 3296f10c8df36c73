//! Aegis - Real-Time Risk & Fraud Decision Engine
//! Mission: Score every event inside the latency budget, lose nothing, prove everything

use anyhow::{Context, Result};
use axum::middleware as axum_mw;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aegis_backend::{
    api::{self, AppState},
    audit::AuditChain,
    auth::{JwtHandler, OperatorStore},
    bus::EventBus,
    decisions::DecisionStore,
    dispatch::{webhooks, AlertManager, WebhookDispatcher, WebhookStore},
    engine::{
        registry::RuleRegistry,
        velocity::{VelocityChecker, VelocityConfig},
        RiskEngine,
    },
    graph::LinkGraph,
    middleware::{rate_limit_middleware, request_logging, RateLimitConfig, RateLimiter},
    models::Config,
    outbox::{self, OutboxStore},
    shadow::ShadowStore,
    state::StateStore,
    worker::{run_risk_worker, WorkerContext},
};

#[derive(Parser, Debug)]
#[command(name = "aegis", about = "Real-time risk & fraud decision engine")]
struct Args {
    /// Override the listen port (otherwise PORT env or 8080).
    #[arg(long)]
    port: Option<u16>,

    /// Override the SQLite database path.
    #[arg(long)]
    database: Option<String>,

    /// Override the rule source file.
    #[arg(long)]
    rules: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "aegis=info,aegis_backend=info,tower_http=warn".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(database) = args.database {
        config.database_path = database;
    }
    if let Some(rules) = args.rules {
        config.rules_path = rules;
    }

    info!("🛡️  Aegis risk engine starting");

    // Leaves first: state store and bus have no dependencies.
    let state_store = Arc::new(StateStore::new());
    let bus = Arc::new(EventBus::new());

    let registry = Arc::new(
        RuleRegistry::load(config.rules_path.clone(), state_store.clone(), bus.clone())
            .context("Failed to load initial rule set")?,
    );
    let velocity = VelocityChecker::new(state_store.clone(), VelocityConfig::from_config(&config));
    let engine = Arc::new(RiskEngine::new(
        registry.clone(),
        velocity,
        Duration::from_millis(config.eval_deadline_ms),
    ));

    let outbox_store = Arc::new(OutboxStore::new(&config.database_path)?);
    let decisions = Arc::new(DecisionStore::new(&config.database_path)?);
    let audit = Arc::new(AuditChain::new(&config.database_path)?);
    let graph = Arc::new(LinkGraph::new(&config.database_path)?);
    let shadow = Arc::new(ShadowStore::new(&config.database_path)?);
    let webhook_store = Arc::new(WebhookStore::new(&config.database_path)?);
    let dispatcher = Arc::new(WebhookDispatcher::new(webhook_store.clone()));
    let alerts = Arc::new(AlertManager::new(
        config.slack_webhook_url.clone(),
        config.pagerduty_api_key.clone(),
        config.pagerduty_service_id.clone(),
        config.alert_from_email.clone(),
    ));

    let operators = Arc::new(OperatorStore::new(&config.database_path)?);
    let jwt = Arc::new(JwtHandler::new(config.jwt_secret.clone()));

    // Background tasks: poller, retention, webhook retries, state sweep.
    let worker_ctx = Arc::new(WorkerContext {
        bus: bus.clone(),
        engine: engine.clone(),
        decisions: decisions.clone(),
        audit: audit.clone(),
        graph: graph.clone(),
        state: state_store.clone(),
        dispatcher: dispatcher.clone(),
        alerts: alerts.clone(),
    });
    tokio::spawn(run_risk_worker(worker_ctx));
    tokio::spawn(outbox::run_poller(
        outbox_store.clone(),
        bus.clone(),
        config.clone(),
    ));
    tokio::spawn(outbox::run_retention(
        outbox_store.clone(),
        config.outbox_retention_days,
    ));
    tokio::spawn(webhooks::run_retry_worker(dispatcher.clone()));
    tokio::spawn(aegis_backend::audit::run_chain_verifier(
        audit.clone(),
        Duration::from_secs(600),
    ));

    let sweep_state = state_store.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            sweep_state.sweep();
        }
    });

    let limiter = RateLimiter::new(RateLimitConfig::default());
    let cleanup_limiter = limiter.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(300));
        loop {
            ticker.tick().await;
            cleanup_limiter.cleanup();
        }
    });

    let app_state = AppState {
        config: Arc::new(config.clone()),
        state: state_store,
        bus,
        outbox: outbox_store,
        engine,
        registry,
        decisions,
        audit,
        graph,
        shadow,
        webhooks: webhook_store,
        dispatcher,
        alerts,
        operators,
        jwt,
    };

    let app = api::router(app_state)
        .layer(axum_mw::from_fn(request_logging))
        .layer(axum_mw::from_fn_with_state(limiter, rate_limit_middleware))
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!(%addr, "🚀 Aegis listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("Server error")?;

    Ok(())
}
