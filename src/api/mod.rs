//! API surface
//! Mission: Wire the HTTP boundary to the engine, stores, and workers

pub mod audit_api;
pub mod decisions_api;
pub mod events;
pub mod graph_api;
pub mod rules_api;
pub mod shadow_api;
pub mod webhooks_api;

use axum::{
    middleware as axum_mw,
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::audit::AuditChain;
use crate::auth::{auth_middleware, JwtHandler, OperatorStore};
use crate::bus::EventBus;
use crate::decisions::DecisionStore;
use crate::dispatch::{AlertManager, WebhookDispatcher, WebhookStore};
use crate::engine::{registry::RuleRegistry, RiskEngine};
use crate::graph::LinkGraph;
use crate::models::Config;
use crate::outbox::OutboxStore;
use crate::shadow::ShadowStore;
use crate::state::StateStore;

/// Application state shared across all handlers and workers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub state: Arc<StateStore>,
    pub bus: Arc<EventBus>,
    pub outbox: Arc<OutboxStore>,
    pub engine: Arc<RiskEngine>,
    pub registry: Arc<RuleRegistry>,
    pub decisions: Arc<DecisionStore>,
    pub audit: Arc<AuditChain>,
    pub graph: Arc<LinkGraph>,
    pub shadow: Arc<ShadowStore>,
    pub webhooks: Arc<WebhookStore>,
    pub dispatcher: Arc<WebhookDispatcher>,
    pub alerts: Arc<AlertManager>,
    pub operators: Arc<OperatorStore>,
    pub jwt: Arc<JwtHandler>,
}

/// Full route table. Everything except ingest, health, and login sits behind
/// bearer auth; role checks happen inside the handlers.
pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/api/v1/events/ingest", post(events::ingest))
        .route("/api/v1/events/auth", post(events::ingest_auth))
        .route("/api/v1/events/transaction", post(events::ingest_transaction))
        .route("/api/v1/events/health", get(events::health))
        .route("/health", get(events::health))
        .route("/auth/login", post(crate::auth::api::login));

    let protected = Router::new()
        .route("/api/v1/events/outbox/stats", get(events::outbox_stats))
        .route("/decisions", get(decisions_api::list_decisions))
        .route("/decisions/:event_id", get(decisions_api::get_decision))
        .route("/rules/reload", post(rules_api::reload))
        .route("/rules/rollback/:version", post(rules_api::rollback))
        .route("/rules/current", get(rules_api::current))
        .route("/rules/history", get(rules_api::history))
        .route("/rules/stats", get(rules_api::stats))
        .route("/rules/validate", get(rules_api::validate))
        .route("/audit/logs", get(audit_api::logs))
        .route("/audit/verify", get(audit_api::verify))
        .route("/audit/compliance-report", get(audit_api::compliance_report))
        .route("/shadow-mode/evaluate", post(shadow_api::evaluate))
        .route("/shadow-mode/label/:id", post(shadow_api::label))
        .route("/shadow-mode/accuracy/:rule_id", get(shadow_api::accuracy))
        .route("/shadow-mode/trends/:rule_id", get(shadow_api::trends))
        .route("/shadow-mode/compare", get(shadow_api::compare))
        .route("/shadow-mode/pending-labels", get(shadow_api::pending_labels))
        .route("/link-analysis/user/:id", get(graph_api::user_connections))
        .route("/link-analysis/ring/:id", get(graph_api::ring))
        .route("/link-analysis/hubs", get(graph_api::hubs))
        .route("/link-analysis/graph/:id", get(graph_api::graph_data))
        .route("/link-analysis/flag-ring", post(graph_api::flag_ring))
        .route("/webhooks", post(webhooks_api::register).get(webhooks_api::list))
        .route("/webhooks/:id/deliveries", get(webhooks_api::deliveries))
        .route_layer(axum_mw::from_fn_with_state(
            state.jwt.clone(),
            auth_middleware,
        ));

    public.merge(protected).with_state(state)
}
