//! Risk worker
//! Mission: Consume ingested events, score them, and fan the decision out

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditChain, AuditRecord};
use crate::bus::{streams, EventBus};
use crate::decisions::DecisionStore;
use crate::dispatch::{AlertManager, WebhookDispatcher};
use crate::engine::RiskEngine;
use crate::graph::LinkGraph;
use crate::models::{Event, RiskLevel};
use crate::state::StateStore;

/// Event-type families the worker consumes (one bus stream each).
pub const EVENT_FAMILIES: &[&str] = &["authentication", "transaction", "data_access", "rbac"];

/// How long two users sharing a device or IP count as co-occurring.
const LINK_WINDOW: Duration = Duration::from_secs(86400);
const SHARED_DEVICE_STRENGTH: f64 = 80.0;
const SHARED_IP_STRENGTH: f64 = 40.0;

pub struct WorkerContext {
    pub bus: Arc<EventBus>,
    pub engine: Arc<RiskEngine>,
    pub decisions: Arc<DecisionStore>,
    pub audit: Arc<AuditChain>,
    pub graph: Arc<LinkGraph>,
    pub state: Arc<StateStore>,
    pub dispatcher: Arc<WebhookDispatcher>,
    pub alerts: Arc<AlertManager>,
}

/// Score one event end to end. Safe to call more than once per event: the
/// decision insert is idempotent on `event_id` and all fan-out happens only
/// on first insert.
pub async fn handle_event(ctx: &WorkerContext, event: Event) {
    let evaluation = ctx.engine.evaluate_or_fail_open(&event);
    let assessment = evaluation.assessment;

    let inserted = match ctx
        .decisions
        .insert(&assessment, &evaluation.rule_evaluations)
    {
        Ok(inserted) => inserted,
        Err(e) => {
            error!(event_id = %event.event_id, error = %e, "Failed to persist decision");
            return;
        }
    };
    if !inserted {
        debug!(event_id = %event.event_id, "Duplicate event delivery, decision already recorded");
        return;
    }

    info!(
        event_id = %event.event_id,
        user_id = %event.actor.user_id,
        score = assessment.risk_score,
        action = assessment.recommended_action.as_str(),
        "Decision made"
    );

    let record = AuditRecord {
        actor_id: Some(event.actor.user_id.clone()),
        actor_role: None,
        event_type: "risk.decision".to_string(),
        resource_type: "risk_decision".to_string(),
        resource_id: event.event_id.clone(),
        payload: json!({
            "event_type": event.event_type,
            "risk_score": assessment.risk_score,
            "risk_level": assessment.risk_level.as_str(),
            "recommended_action": assessment.recommended_action.as_str(),
            "triggered_rules": assessment.triggered_rules,
            "confidence": assessment.confidence,
            "actor_ip": event.actor.ip_address,
            "actor_user_agent": event.actor.user_agent,
        }),
        shadow_mode: false,
    };
    if let Err(e) = ctx.audit.append(&event.org_id, record) {
        error!(event_id = %event.event_id, error = %e, "Failed to append audit entry");
    }

    record_co_occurrence(ctx, &event);

    // Fan-out runs off this worker's loop so a slow endpoint cannot stall
    // consumption.
    let dispatcher = ctx.dispatcher.clone();
    let outbound = assessment.clone();
    tokio::spawn(async move {
        dispatcher.dispatch(&outbound).await;
    });

    if assessment.risk_level >= RiskLevel::High && ctx.alerts.is_configured() {
        let alerts = ctx.alerts.clone();
        let org = event.org_id.clone();
        let alerted = assessment.clone();
        tokio::spawn(async move {
            alerts.send_all(&alerted, &org).await;
        });
    }

    let _ = ctx.bus.publish(
        streams::DECISIONS,
        &assessment.event_id,
        serde_json::to_value(&assessment).unwrap_or(json!({})),
    );
}

/// Users seen on the same device fingerprint or IP inside the link window
/// become graph edges. First co-occurrence creates the edge; repeats
/// reinforce it.
fn record_co_occurrence(ctx: &WorkerContext, event: &Event) {
    let user = &event.actor.user_id;

    let fingerprint = &event.actor.device_fingerprint;
    if !fingerprint.is_empty() && fingerprint != "unknown" {
        let key = format!("org:{}:link:device:{}", event.org_id, fingerprint);
        link_window_users(ctx, event, &key, user, "shared_device", fingerprint,
            SHARED_DEVICE_STRENGTH);
    }

    let ip = &event.actor.ip_address;
    if !ip.is_empty() && ip != "unknown" {
        let key = format!("org:{}:link:ip:{}", event.org_id, ip);
        link_window_users(ctx, event, &key, user, "shared_ip", ip, SHARED_IP_STRENGTH);
    }
}

fn link_window_users(
    ctx: &WorkerContext,
    event: &Event,
    key: &str,
    user: &str,
    connection_type: &str,
    value: &str,
    strength: f64,
) {
    let peers = ctx.state.window_members(key);
    ctx.state.add_to_window(key, user, LINK_WINDOW);

    for peer in peers {
        if peer == user {
            continue;
        }
        if let Err(e) =
            ctx.graph
                .record_connection(&event.org_id, user, &peer, connection_type, value, strength)
        {
            warn!(error = %e, "Failed to record user connection");
        }
    }
}

/// Long-lived consumer: one task per event-type family stream.
pub async fn run_risk_worker(ctx: Arc<WorkerContext>) {
    info!(families = EVENT_FAMILIES.len(), "Risk worker started");

    let mut tasks = Vec::new();
    for family in EVENT_FAMILIES {
        let stream = format!("{}:{family}", streams::EVENTS_PREFIX);
        let mut rx = ctx.bus.subscribe(&stream);
        let ctx = ctx.clone();

        tasks.push(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => match serde_json::from_value::<Event>(msg.payload) {
                        Ok(event) => handle_event(&ctx, event).await,
                        Err(e) => warn!(stream = %msg.stream, error = %e, "Undecodable event"),
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        // Dropped messages re-arrive via outbox retry.
                        warn!(stream = %stream, skipped, "Worker lagged behind bus");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));
    }

    for task in tasks {
        let _ = task.await;
    }
}
