//! End-to-end pipeline tests: ingest -> outbox -> bus -> engine -> decision
//! -> audit -> webhook delivery.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tempfile::{NamedTempFile, TempDir};

use aegis_backend::audit::AuditChain;
use aegis_backend::bus::{event_stream_for, EventBus};
use aegis_backend::decisions::DecisionStore;
use aegis_backend::dispatch::webhooks::{build_payload, sign_payload};
use aegis_backend::dispatch::{AlertManager, WebhookDispatcher, WebhookStore};
use aegis_backend::engine::registry::RuleRegistry;
use aegis_backend::engine::velocity::{VelocityChecker, VelocityConfig};
use aegis_backend::engine::RiskEngine;
use aegis_backend::graph::LinkGraph;
use aegis_backend::models::{event_types, ActorContext, Event, GeoContext, RecommendedAction, RiskLevel};
use aegis_backend::outbox::{poll_once, OutboxStatus, OutboxStore};
use aegis_backend::state::StateStore;
use aegis_backend::worker::{handle_event, WorkerContext};

const RULES: &str = r#"
scoring:
  base_risk: 0.1
  velocity_weight: 0.4
  behavioral_weight: 0.3
  thresholds:
    review: 0.30
    challenge: 0.60
    block: 0.80
rules:
  - id: impossible_travel
    name: Impossible travel
    type: velocity
    score: 0.75
  - id: rapid_transactions
    name: Rapid transactions
    type: velocity
    score: 0.70
gates:
  - id: sanctioned_region
    conditions:
      country_code:
        in: [KP, IR, SY, CU]
    score: 0.95
"#;

struct Pipeline {
    outbox: Arc<OutboxStore>,
    ctx: Arc<WorkerContext>,
    webhooks: Arc<WebhookStore>,
    _dir: TempDir,
    _rules: NamedTempFile,
}

fn pipeline() -> Pipeline {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("aegis.db");
    let db = db_path.to_str().unwrap();

    let mut rules = NamedTempFile::new().unwrap();
    rules.write_all(RULES.as_bytes()).unwrap();
    rules.flush().unwrap();

    let state = Arc::new(StateStore::new());
    let bus = Arc::new(EventBus::new());
    let registry =
        Arc::new(RuleRegistry::load(rules.path(), state.clone(), bus.clone()).unwrap());
    let velocity = VelocityChecker::new(
        state.clone(),
        VelocityConfig {
            travel_distance_threshold_mi: 3000.0,
            max_travel_speed_mph: 500.0,
            rapid_tx_hourly_threshold: 20,
            counter_ttl: Duration::from_secs(3600),
            location_ttl: Duration::from_secs(86400),
            device_ttl: Duration::from_secs(86400),
            device_window: Duration::from_secs(300),
            device_window_limit: 3,
        },
    );
    let engine = Arc::new(RiskEngine::new(registry, velocity, Duration::from_millis(150)));

    let webhooks = Arc::new(WebhookStore::new(db).unwrap());
    let ctx = Arc::new(WorkerContext {
        bus: bus.clone(),
        engine,
        decisions: Arc::new(DecisionStore::new(db).unwrap()),
        audit: Arc::new(AuditChain::new(db).unwrap()),
        graph: Arc::new(LinkGraph::new(db).unwrap()),
        state,
        dispatcher: Arc::new(WebhookDispatcher::new(webhooks.clone())),
        alerts: Arc::new(AlertManager::new(None, None, None, "alerts@test".into())),
    });

    Pipeline {
        outbox: Arc::new(OutboxStore::new(db).unwrap()),
        ctx,
        webhooks,
        _dir: dir,
        _rules: rules,
    }
}

fn login_event(event_id: &str, user_id: &str, country: &str) -> Event {
    Event {
        event_id: event_id.to_string(),
        event_type: event_types::AUTHENTICATION_LOGIN.to_string(),
        org_id: "org_1".to_string(),
        timestamp: Utc::now(),
        actor: ActorContext {
            user_id: user_id.to_string(),
            ip_address: "203.0.113.9".to_string(),
            user_agent: "integration-test".to_string(),
            device_fingerprint: "fp_1".to_string(),
            session_id: None,
        },
        context: GeoContext {
            geo_lat: 40.7128,
            geo_lon: -74.0060,
            country_code: Some(country.to_string()),
            city: None,
        },
        payload: json!({"success": true, "method": "password"}),
    }
}

/// Pull everything currently on the stream through the worker.
async fn drain(
    rx: &mut tokio::sync::broadcast::Receiver<aegis_backend::bus::BusMessage>,
    ctx: &WorkerContext,
) {
    while let Ok(msg) = rx.try_recv() {
        let event: Event = serde_json::from_value(msg.payload).unwrap();
        handle_event(ctx, event).await;
    }
}

#[tokio::test]
async fn test_sanctioned_login_blocked_end_to_end() {
    let p = pipeline();
    let stream = event_stream_for(event_types::AUTHENTICATION_LOGIN);
    let mut rx = p.ctx.bus.subscribe(&stream);

    // Ingress: transactional write, then the poller picks it up.
    p.outbox.ingest(&login_event("evt_kp", "u_1", "KP")).unwrap();
    let published = poll_once(&p.outbox, &p.ctx.bus, 100, 5, Duration::from_secs(1));
    assert_eq!(published, 1);

    drain(&mut rx, &p.ctx).await;

    let decision = p.ctx.decisions.by_event_id("evt_kp").unwrap().unwrap();
    assert!(decision.risk_score >= 0.8);
    assert_eq!(decision.risk_level, RiskLevel::Critical);
    assert_eq!(decision.recommended_action, RecommendedAction::Block);
    assert_eq!(decision.triggered_rules, vec!["sanctioned_region"]);

    // The decision input survives the trip modulo enrichment.
    assert_eq!(decision.event_type, event_types::AUTHENTICATION_LOGIN);
    assert_eq!(decision.user_id, "u_1");

    // Audit chain carries the decision and verifies clean.
    let report = p.ctx.audit.verify("org_1").unwrap();
    assert!(report.intact);
    assert_eq!(report.entries_checked, 1);

    // Outbox reached its terminal state.
    let (status, retries) = p.outbox.entry_status("evt_kp").unwrap().unwrap();
    assert_eq!(status, OutboxStatus::Published);
    assert_eq!(retries, 0);
}

#[tokio::test]
async fn test_publish_retries_until_consumer_appears() {
    let p = pipeline();

    p.outbox.ingest(&login_event("evt_retry", "u_1", "US")).unwrap();

    // No consumer on the stream yet: the publish fails and the entry stays
    // pending with a bumped retry count.
    let published = poll_once(&p.outbox, &p.ctx.bus, 100, 5, Duration::from_millis(0));
    assert_eq!(published, 0);
    let (status, retries) = p.outbox.entry_status("evt_retry").unwrap().unwrap();
    assert_eq!(status, OutboxStatus::Pending);
    assert_eq!(retries, 1);

    // A consumer attaches; the backoff (capped at the poll interval, which
    // is zero here) has elapsed, so the next poll succeeds.
    let stream = event_stream_for(event_types::AUTHENTICATION_LOGIN);
    let mut rx = p.ctx.bus.subscribe(&stream);
    let published = poll_once(&p.outbox, &p.ctx.bus, 100, 5, Duration::from_millis(0));
    assert_eq!(published, 1);

    drain(&mut rx, &p.ctx).await;
    assert!(p.ctx.decisions.by_event_id("evt_retry").unwrap().is_some());
}

#[tokio::test]
async fn test_webhook_receives_signed_decision() {
    use axum::{body::Bytes, extract::State, http::HeaderMap, routing::post, Router};
    use parking_lot::Mutex;

    // Capture endpoint: records body + signature header.
    type Captured = Arc<Mutex<Vec<(String, String)>>>;
    let captured: Captured = Arc::new(Mutex::new(Vec::new()));

    let app = Router::new()
        .route(
            "/hook",
            post(
                |State(captured): State<Captured>, headers: HeaderMap, body: Bytes| async move {
                    let signature = headers
                        .get("X-Signature")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    let body = String::from_utf8_lossy(&body).to_string();
                    captured.lock().push((signature, body));
                    "ok"
                },
            ),
        )
        .with_state(captured.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let p = pipeline();
    let (_, secret) = p
        .webhooks
        .register(
            "org_1",
            &format!("http://{addr}/hook"),
            vec![],
            RiskLevel::High,
            Some("integration".to_string()),
            5,
            3,
        )
        .unwrap();

    // A sanctioned-region login produces a critical decision, which clears
    // the webhook's min level.
    let stream = event_stream_for(event_types::AUTHENTICATION_LOGIN);
    let mut rx = p.ctx.bus.subscribe(&stream);
    p.outbox.ingest(&login_event("evt_hook", "u_9", "IR")).unwrap();
    poll_once(&p.outbox, &p.ctx.bus, 100, 5, Duration::from_secs(1));
    drain(&mut rx, &p.ctx).await;

    // Delivery is spawned off the worker; wait for it to land.
    for _ in 0..100 {
        if !captured.lock().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let deliveries = captured.lock().clone();
    assert_eq!(deliveries.len(), 1);
    let (signature, body) = &deliveries[0];

    // The signature verifies against the body with the registration secret.
    assert_eq!(signature, &sign_payload(body, &secret));

    let payload: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(payload["event_id"], "evt_hook");
    assert_eq!(payload["risk_level"], "critical");
    assert_eq!(payload["recommended_action"], "block");
    assert_eq!(payload["webhook_attempt"], 1);

    // And the canonical payload builder reproduces the same body shape.
    let decision = p.ctx.decisions.by_event_id("evt_hook").unwrap().unwrap();
    assert_eq!(
        build_payload(&decision, 1)["triggered_rules"],
        payload["triggered_rules"]
    );
}

#[tokio::test]
async fn test_impossible_travel_across_the_pipeline() {
    let p = pipeline();
    let stream = event_stream_for(event_types::AUTHENTICATION_LOGIN);
    let mut rx = p.ctx.bus.subscribe(&stream);

    // First login from New York.
    p.outbox.ingest(&login_event("evt_ny", "traveler", "US")).unwrap();
    poll_once(&p.outbox, &p.ctx.bus, 100, 5, Duration::from_secs(1));
    drain(&mut rx, &p.ctx).await;

    // Ten minutes later (by event timestamp) from Tokyo.
    let mut tokyo = login_event("evt_tokyo", "traveler", "JP");
    tokyo.context.geo_lat = 35.6762;
    tokyo.context.geo_lon = 139.6503;
    tokyo.timestamp = Utc::now() + chrono::Duration::minutes(10);
    p.outbox.ingest(&tokyo).unwrap();
    poll_once(&p.outbox, &p.ctx.bus, 100, 5, Duration::from_secs(1));
    drain(&mut rx, &p.ctx).await;

    let decision = p.ctx.decisions.by_event_id("evt_tokyo").unwrap().unwrap();
    assert!(decision
        .triggered_rules
        .contains(&"impossible_travel".to_string()));
    assert!(decision.risk_level >= RiskLevel::High);
    assert!(matches!(
        decision.recommended_action,
        RecommendedAction::Challenge | RecommendedAction::Block
    ));

    // Two decisions, two chained audit entries, chain intact.
    let report = p.ctx.audit.verify("org_1").unwrap();
    assert!(report.intact);
    assert_eq!(report.entries_checked, 2);
}
