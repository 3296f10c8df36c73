//! Core domain model
//! Mission: One canonical event shape for everything that flows through the engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event type namespace. Every ingested event carries one of these (or a
/// caller-defined type in the same `family.action` form).
pub mod event_types {
    pub const AUTHENTICATION_LOGIN: &str = "authentication.login";
    pub const AUTHENTICATION_LOGOUT: &str = "authentication.logout";
    pub const AUTHENTICATION_FAILED: &str = "authentication.failed";
    pub const AUTHENTICATION_MFA: &str = "authentication.mfa";

    pub const TRANSACTION_ATTEMPTED: &str = "transaction.attempted";
    pub const TRANSACTION_COMPLETED: &str = "transaction.completed";
    pub const TRANSACTION_FAILED: &str = "transaction.failed";

    pub const DATA_ACCESS_READ: &str = "data_access.read";
    pub const DATA_ACCESS_WRITE: &str = "data_access.write";
    pub const DATA_ACCESS_DELETE: &str = "data_access.delete";

    pub const RBAC_VIOLATION: &str = "rbac.violation";
}

fn default_org() -> String {
    "default".to_string()
}

/// Who performed the action: user, device, and network identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorContext {
    pub user_id: String,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub user_agent: String,
    /// Hash of device characteristics (browser, OS, screen resolution, etc.)
    #[serde(default)]
    pub device_fingerprint: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Where the action came from, for geo-velocity checks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeoContext {
    #[serde(default)]
    pub geo_lat: f64,
    #[serde(default)]
    pub geo_lon: f64,
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
}

/// A business event submitted by a client system. Immutable after ingress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub event_type: String,
    #[serde(default = "default_org")]
    pub org_id: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub actor: ActorContext,
    #[serde(default)]
    pub context: GeoContext,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Event {
    /// Stream family for bus routing: the part before the first dot.
    pub fn family(&self) -> &str {
        self.event_type
            .split_once('.')
            .map(|(family, _)| family)
            .unwrap_or(&self.event_type)
    }
}

/// Risk severity bands, ordered low to critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "low" => Some(RiskLevel::Low),
            "medium" => Some(RiskLevel::Medium),
            "high" => Some(RiskLevel::High),
            "critical" => Some(RiskLevel::Critical),
            _ => None,
        }
    }

    /// Ordinal rank used for minimum-level webhook filters.
    pub fn rank(&self) -> u8 {
        match self {
            RiskLevel::Low => 1,
            RiskLevel::Medium => 2,
            RiskLevel::High => 3,
            RiskLevel::Critical => 4,
        }
    }
}

/// What the caller should do with the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendedAction {
    Allow,
    Review,
    Challenge,
    Block,
}

impl RecommendedAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecommendedAction::Allow => "allow",
            RecommendedAction::Review => "review",
            RecommendedAction::Challenge => "challenge",
            RecommendedAction::Block => "block",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "allow" => Some(RecommendedAction::Allow),
            "review" => Some(RecommendedAction::Review),
            "challenge" => Some(RecommendedAction::Challenge),
            "block" => Some(RecommendedAction::Block),
            _ => None,
        }
    }
}

/// One decision per event. Never updated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub id: String,
    pub event_id: String,
    pub event_type: String,
    pub org_id: String,
    pub user_id: String,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub recommended_action: RecommendedAction,
    /// All triggered rule ids in evaluation order, de-duplicated.
    pub triggered_rules: Vec<String>,
    pub hard_rules_triggered: Vec<String>,
    pub velocity_alerts: Vec<String>,
    pub behavioral_flags: Vec<String>,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

impl RiskAssessment {
    pub fn new(event: &Event) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_id: event.event_id.clone(),
            event_type: event.event_type.clone(),
            org_id: event.org_id.clone(),
            user_id: event.actor.user_id.clone(),
            risk_score: 0.0,
            risk_level: RiskLevel::Low,
            recommended_action: RecommendedAction::Allow,
            triggered_rules: Vec::new(),
            hard_rules_triggered: Vec::new(),
            velocity_alerts: Vec::new(),
            behavioral_flags: Vec::new(),
            confidence: 0.0,
            created_at: Utc::now(),
        }
    }
}

/// Rule category of a single evaluation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleCategory {
    Hard,
    Velocity,
    Behavioral,
}

impl RuleCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleCategory::Hard => "hard",
            RuleCategory::Velocity => "velocity",
            RuleCategory::Behavioral => "behavioral",
        }
    }
}

/// Per-rule evaluation trace stored alongside the decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleEvaluationRecord {
    pub rule_id: String,
    pub rule_name: String,
    pub category: RuleCategory,
    pub matched: bool,
    pub score_contribution: f64,
    /// The values the condition was checked against, for debugging.
    pub condition_snapshot: serde_json::Value,
}

/// Application configuration, loaded once at startup and injected.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    pub rules_path: String,
    pub jwt_secret: String,

    // Outbox
    pub outbox_poll_interval_ms: u64,
    pub outbox_batch_size: usize,
    pub outbox_max_retries: u32,
    pub outbox_retention_days: i64,

    // Risk engine
    pub eval_deadline_ms: u64,
    pub travel_distance_threshold_mi: f64,
    pub max_travel_speed_mph: f64,
    pub rapid_tx_hourly_threshold: u64,
    pub counter_ttl_secs: u64,
    pub location_ttl_secs: u64,
    pub device_ttl_secs: u64,
    pub device_window_secs: u64,
    pub device_window_limit: usize,

    // Outbound delivery
    pub webhook_timeout_secs: u64,
    pub webhook_max_retries: u32,
    pub slack_webhook_url: Option<String>,
    pub pagerduty_api_key: Option<String>,
    pub pagerduty_service_id: Option<String>,
    pub alert_from_email: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        Ok(Self {
            database_path: env_or("DATABASE_PATH", "./aegis.db"),
            port: env_parse("PORT", 8080),
            rules_path: env_or("RULES_PATH", "./rules/fraud_rules.yaml"),
            jwt_secret: env_or("JWT_SECRET", "dev-secret-change-in-production"),

            outbox_poll_interval_ms: env_parse("OUTBOX_POLL_INTERVAL_MS", 1000),
            outbox_batch_size: env_parse("OUTBOX_BATCH_SIZE", 100),
            outbox_max_retries: env_parse("OUTBOX_MAX_RETRIES", 5),
            outbox_retention_days: env_parse("OUTBOX_RETENTION_DAYS", 7),

            eval_deadline_ms: env_parse("EVAL_DEADLINE_MS", 150),
            travel_distance_threshold_mi: env_parse("TRAVEL_DISTANCE_THRESHOLD_MI", 3000.0),
            max_travel_speed_mph: env_parse("MAX_TRAVEL_SPEED_MPH", 500.0),
            rapid_tx_hourly_threshold: env_parse("RAPID_TX_HOURLY_THRESHOLD", 20),
            counter_ttl_secs: env_parse("COUNTER_TTL_SECS", 3600),
            location_ttl_secs: env_parse("LOCATION_TTL_SECS", 86400),
            device_ttl_secs: env_parse("DEVICE_TTL_SECS", 2_592_000),
            device_window_secs: env_parse("DEVICE_WINDOW_SECS", 300),
            device_window_limit: env_parse("DEVICE_WINDOW_LIMIT", 3),

            webhook_timeout_secs: env_parse("WEBHOOK_TIMEOUT_SECS", 30),
            webhook_max_retries: env_parse("WEBHOOK_MAX_RETRIES", 3),
            slack_webhook_url: std::env::var("SLACK_WEBHOOK_URL").ok(),
            pagerduty_api_key: std::env::var("PAGERDUTY_API_KEY").ok(),
            pagerduty_service_id: std::env::var("PAGERDUTY_SERVICE_ID").ok(),
            alert_from_email: env_or("ALERT_FROM_EMAIL", "alerts@aegis.local"),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_level_ordering() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::High < RiskLevel::Critical);
        assert_eq!(RiskLevel::Critical.rank(), 4);
        assert_eq!(RiskLevel::from_str("high"), Some(RiskLevel::High));
        assert_eq!(RiskLevel::from_str("bogus"), None);
    }

    #[test]
    fn test_event_family() {
        let event: Event = serde_json::from_value(serde_json::json!({
            "event_id": "evt_1",
            "event_type": "authentication.login",
            "actor": { "user_id": "u_1" }
        }))
        .unwrap();

        assert_eq!(event.family(), "authentication");
        assert_eq!(event.org_id, "default");
    }

    #[test]
    fn test_action_round_trip() {
        for action in [
            RecommendedAction::Allow,
            RecommendedAction::Review,
            RecommendedAction::Challenge,
            RecommendedAction::Block,
        ] {
            assert_eq!(RecommendedAction::from_str(action.as_str()), Some(action));
        }
    }
}
