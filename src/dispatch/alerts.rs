//! Chat & paging integrations
//! Mission: Human-facing alerts that never block the decision path

use serde_json::json;
use std::time::Duration;
use tracing::{error, info};

use crate::models::{RiskAssessment, RiskLevel};

const INTEGRATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Slack attachment color per risk band.
fn slack_color(level: RiskLevel) -> &'static str {
    match level {
        RiskLevel::Low => "#36a64f",
        RiskLevel::Medium => "#ff9900",
        RiskLevel::High => "#ff6666",
        RiskLevel::Critical => "#cc0000",
    }
}

/// PagerDuty severity per risk band.
fn pagerduty_severity(level: RiskLevel) -> &'static str {
    match level {
        RiskLevel::Low => "info",
        RiskLevel::Medium => "warning",
        RiskLevel::High => "error",
        RiskLevel::Critical => "critical",
    }
}

pub struct SlackAlerter {
    webhook_url: String,
    client: reqwest::Client,
}

impl SlackAlerter {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    /// Color-coded attachment with the decision summary. Returns whether the
    /// post landed; failures are logged and swallowed.
    pub async fn send_alert(&self, assessment: &RiskAssessment, org_name: &str) -> bool {
        let level = assessment.risk_level.as_str().to_uppercase();
        let payload = json!({
            "attachments": [{
                "fallback": format!("Risk Alert: {level} risk detected"),
                "color": slack_color(assessment.risk_level),
                "title": format!("🚨 {level} RISK ALERT"),
                "fields": [
                    {"title": "Organization", "value": org_name, "short": true},
                    {"title": "Risk Score", "value": format!("{:.2}/1.0", assessment.risk_score), "short": true},
                    {"title": "Risk Level", "value": level, "short": true},
                    {"title": "Confidence", "value": format!("{:.1}%", assessment.confidence * 100.0), "short": true},
                    {"title": "Affected User", "value": assessment.user_id, "short": true},
                    {"title": "Recommended Action", "value": assessment.recommended_action.as_str().to_uppercase(), "short": true},
                    {"title": "Triggered Rules", "value": join_or_none(&assessment.triggered_rules), "short": false},
                ],
                "footer": "Aegis Risk Engine",
            }]
        });

        match self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .timeout(INTEGRATION_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                info!(
                    event_id = %assessment.event_id,
                    risk_level = assessment.risk_level.as_str(),
                    "Slack alert sent"
                );
                true
            }
            Ok(resp) => {
                error!(
                    event_id = %assessment.event_id,
                    status = resp.status().as_u16(),
                    "Slack alert failed"
                );
                false
            }
            Err(e) => {
                error!(event_id = %assessment.event_id, error = %e, "Slack alert error");
                false
            }
        }
    }
}

pub struct PagerDutyAlerter {
    api_key: String,
    service_id: String,
    base_url: String,
    client: reqwest::Client,
}

impl PagerDutyAlerter {
    pub fn new(api_key: String, service_id: String) -> Self {
        Self {
            api_key,
            service_id,
            base_url: "https://api.pagerduty.com".to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Create an incident for high/critical decisions only, to avoid noise.
    pub async fn send_alert(&self, assessment: &RiskAssessment, from_email: &str) -> bool {
        if assessment.risk_level < RiskLevel::High {
            return false;
        }

        let payload = json!({
            "incident": {
                "type": "incident",
                "title": format!(
                    "[{}] Risk Alert for user {}",
                    assessment.risk_level.as_str().to_uppercase(),
                    assessment.user_id
                ),
                "service": {"id": self.service_id, "type": "service_reference"},
                "urgency": if assessment.risk_level == RiskLevel::Critical { "high" } else { "low" },
                "body": {
                    "type": "incident_body",
                    "details": json!({
                        "event_id": assessment.event_id,
                        "user_id": assessment.user_id,
                        "risk_score": assessment.risk_score,
                        "risk_level": assessment.risk_level.as_str(),
                        "severity": pagerduty_severity(assessment.risk_level),
                        "confidence": assessment.confidence,
                        "recommended_action": assessment.recommended_action.as_str(),
                        "triggered_rules": assessment.triggered_rules,
                    }).to_string(),
                }
            }
        });

        match self
            .client
            .post(format!("{}/incidents", self.base_url))
            .header("Authorization", format!("Token token={}", self.api_key))
            .header("Accept", "application/vnd.pagerduty+json;version=2")
            .header("From", from_email)
            .json(&payload)
            .timeout(INTEGRATION_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                info!(
                    event_id = %assessment.event_id,
                    risk_level = assessment.risk_level.as_str(),
                    "PagerDuty incident created"
                );
                true
            }
            Ok(resp) => {
                error!(
                    event_id = %assessment.event_id,
                    status = resp.status().as_u16(),
                    "PagerDuty incident creation failed"
                );
                false
            }
            Err(e) => {
                error!(event_id = %assessment.event_id, error = %e, "PagerDuty error");
                false
            }
        }
    }
}

/// All configured integrations behind one entry point.
pub struct AlertManager {
    slack: Option<SlackAlerter>,
    pagerduty: Option<PagerDutyAlerter>,
    from_email: String,
}

impl AlertManager {
    pub fn new(
        slack_webhook_url: Option<String>,
        pagerduty_api_key: Option<String>,
        pagerduty_service_id: Option<String>,
        from_email: String,
    ) -> Self {
        let pagerduty = match (pagerduty_api_key, pagerduty_service_id) {
            (Some(key), Some(service)) => Some(PagerDutyAlerter::new(key, service)),
            _ => None,
        };
        Self {
            slack: slack_webhook_url.map(SlackAlerter::new),
            pagerduty,
            from_email,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.slack.is_some() || self.pagerduty.is_some()
    }

    /// Fire every configured channel. Integration failures never propagate.
    pub async fn send_all(&self, assessment: &RiskAssessment, org_name: &str) {
        if let Some(slack) = &self.slack {
            slack.send_alert(assessment, org_name).await;
        }
        if let Some(pagerduty) = &self.pagerduty {
            pagerduty.send_alert(assessment, &self.from_email).await;
        }
    }
}

fn join_or_none(rules: &[String]) -> String {
    if rules.is_empty() {
        "None".to_string()
    } else {
        rules.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActorContext, Event, RecommendedAction};
    use chrono::Utc;

    fn assessment(level: RiskLevel) -> RiskAssessment {
        let event = Event {
            event_id: "evt_1".to_string(),
            event_type: "authentication.login".to_string(),
            org_id: "org_1".to_string(),
            timestamp: Utc::now(),
            actor: ActorContext {
                user_id: "u_1".to_string(),
                ip_address: String::new(),
                user_agent: String::new(),
                device_fingerprint: String::new(),
                session_id: None,
            },
            context: Default::default(),
            payload: serde_json::json!({}),
        };
        let mut a = RiskAssessment::new(&event);
        a.risk_level = level;
        a.recommended_action = RecommendedAction::Block;
        a
    }

    #[test]
    fn test_color_and_severity_maps() {
        assert_eq!(slack_color(RiskLevel::Critical), "#cc0000");
        assert_eq!(slack_color(RiskLevel::Low), "#36a64f");
        assert_eq!(pagerduty_severity(RiskLevel::High), "error");
        assert_eq!(pagerduty_severity(RiskLevel::Medium), "warning");
    }

    #[tokio::test]
    async fn test_pagerduty_skips_low_and_medium() {
        let alerter = PagerDutyAlerter::new("key".into(), "service".into());
        // Low/medium return false before any network call is attempted.
        assert!(!alerter.send_alert(&assessment(RiskLevel::Low), "a@b.c").await);
        assert!(!alerter.send_alert(&assessment(RiskLevel::Medium), "a@b.c").await);
    }

    #[test]
    fn test_manager_configuration() {
        let none = AlertManager::new(None, None, None, "a@b.c".into());
        assert!(!none.is_configured());

        let slack_only = AlertManager::new(
            Some("http://hooks.example".into()),
            None,
            None,
            "a@b.c".into(),
        );
        assert!(slack_only.is_configured());

        // PagerDuty requires both key and service id.
        let half = AlertManager::new(None, Some("key".into()), None, "a@b.c".into());
        assert!(!half.is_configured());
    }

    #[test]
    fn test_join_or_none() {
        assert_eq!(join_or_none(&[]), "None");
        assert_eq!(
            join_or_none(&["a".to_string(), "b".to_string()]),
            "a, b"
        );
    }
}
