//! Rule set model
//! Mission: Parse, validate, and match the YAML fraud-rule source

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::Event;

fn default_true() -> bool {
    true
}

/// Score thresholds mapping risk score to action band.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Thresholds {
    pub review: f64,
    pub challenge: f64,
    pub block: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            review: 0.30,
            challenge: 0.60,
            block: 0.80,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub base_risk: f64,
    pub velocity_weight: f64,
    pub behavioral_weight: f64,
    #[serde(default)]
    pub thresholds: Thresholds,
}

/// Rule categories as declared in the source file. `behavioral_ml` rules are
/// scored exactly like behavioral ones; the tag only marks their origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Hard,
    Velocity,
    Behavioral,
    BehavioralMl,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDef {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: RuleKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub conditions: serde_json::Map<String, Value>,
    pub score: f64,
}

/// Hard gate: on match the decision is an immediate block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateDef {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub conditions: serde_json::Map<String, Value>,
    pub score: f64,
}

/// Boost applied when a specific multi-rule pattern triggers together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComboDef {
    pub id: String,
    pub triggered_rules: Vec<String>,
    pub boost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleFile {
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub rules: Vec<RuleDef>,
    #[serde(default)]
    pub gates: Vec<GateDef>,
    #[serde(default)]
    pub rule_combinations: Vec<ComboDef>,
}

impl RuleFile {
    pub fn rules_of_kind(&self, kind: RuleKind) -> impl Iterator<Item = &RuleDef> {
        self.rules
            .iter()
            .filter(move |r| r.enabled && r.kind == kind)
    }

    /// Behavioral and behavioral_ml rules score identically.
    pub fn behavioral_rules(&self) -> impl Iterator<Item = &RuleDef> {
        self.rules.iter().filter(|r| {
            r.enabled && matches!(r.kind, RuleKind::Behavioral | RuleKind::BehavioralMl)
        })
    }
}

/// An installed, immutable snapshot of the rule source. Evaluators capture an
/// `Arc<RuleSet>` at the start of a call and use it throughout.
#[derive(Debug, Clone, Serialize)]
pub struct RuleSet {
    pub version: String,
    pub hash: String,
    pub loaded_at: DateTime<Utc>,
    pub file: RuleFile,
}

/// Canonical serialization: serde_json sorts object keys, so hashing the
/// string form is stable across key-order permutations of the same source.
pub fn canonical_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// Validate the raw (pre-typed) rule document. Returns every issue found;
/// empty means installable.
pub fn validate_rules(raw: &Value) -> Vec<String> {
    let mut issues = Vec::new();

    let Some(root) = raw.as_object() else {
        return vec!["rule source is not a mapping".to_string()];
    };

    for section in ["scoring", "rules", "gates"] {
        if !root.contains_key(section) {
            issues.push(format!("Missing required section: {section}"));
        }
    }

    if let Some(scoring) = root.get("scoring").and_then(|s| s.as_object()) {
        for field in ["base_risk", "velocity_weight", "behavioral_weight"] {
            match scoring.get(field) {
                None => issues.push(format!("Missing scoring field: {field}")),
                Some(v) if !v.is_number() => {
                    issues.push(format!("Invalid scoring field type: {field}"))
                }
                _ => {}
            }
        }
    }

    if let Some(rules) = root.get("rules").and_then(|r| r.as_array()) {
        for (i, rule) in rules.iter().enumerate() {
            let label = rule
                .get("name")
                .and_then(|n| n.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("#{i}"));

            for field in ["name", "type", "score"] {
                if rule.get(field).is_none() {
                    issues.push(format!("Rule {label}: Missing '{field}'"));
                }
            }
            if let Some(score) = rule.get("score") {
                if !score.is_number() {
                    issues.push(format!("Rule {label}: Invalid score type"));
                }
            }
            if let Some(kind) = rule.get("type").and_then(|t| t.as_str()) {
                if !matches!(kind, "hard" | "velocity" | "behavioral" | "behavioral_ml") {
                    issues.push(format!("Rule {label}: Invalid type '{kind}'"));
                }
            }
            if let Some(conditions) = rule.get("conditions") {
                if !conditions.is_object() {
                    issues.push(format!("Rule {label}: Conditions must be a mapping"));
                }
            }
        }
    }

    if let Some(gates) = root.get("gates").and_then(|g| g.as_array()) {
        for (i, gate) in gates.iter().enumerate() {
            if gate.get("conditions").is_none() {
                let label = gate
                    .get("id")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| format!("#{i}"));
                issues.push(format!("Gate {label}: Missing conditions"));
            }
        }
    }

    issues
}

/// Resolve a condition key against the event. Well-known keys map to the
/// envelope; everything else is looked up in the free-form payload.
fn resolve_field(event: &Event, key: &str) -> Value {
    match key {
        "event_type" => Value::String(event.event_type.clone()),
        "user_id" => Value::String(event.actor.user_id.clone()),
        "ip_address" => Value::String(event.actor.ip_address.clone()),
        "user_agent" => Value::String(event.actor.user_agent.clone()),
        "device_fingerprint" => Value::String(event.actor.device_fingerprint.clone()),
        "country_code" => event
            .context
            .country_code
            .clone()
            .map(Value::String)
            .unwrap_or(Value::Null),
        "city" => event
            .context
            .city
            .clone()
            .map(Value::String)
            .unwrap_or(Value::Null),
        other => event.payload.get(other).cloned().unwrap_or(Value::Null),
    }
}

fn matches_operator(actual: &Value, expected: &Value) -> bool {
    match expected {
        Value::Object(ops) => ops.iter().all(|(op, operand)| match op.as_str() {
            "eq" => actual == operand,
            "ne" => actual != operand,
            "in" => operand
                .as_array()
                .map(|list| list.contains(actual))
                .unwrap_or(false),
            "gt" => compare_numbers(actual, operand, |a, b| a > b),
            "gte" => compare_numbers(actual, operand, |a, b| a >= b),
            "lt" => compare_numbers(actual, operand, |a, b| a < b),
            "lte" => compare_numbers(actual, operand, |a, b| a <= b),
            "contains" => match (actual.as_str(), operand.as_str()) {
                (Some(haystack), Some(needle)) => haystack.contains(needle),
                _ => false,
            },
            _ => false,
        }),
        // Bare scalar: plain equality.
        scalar => actual == scalar,
    }
}

fn compare_numbers(actual: &Value, operand: &Value, cmp: fn(f64, f64) -> bool) -> bool {
    match (actual.as_f64(), operand.as_f64()) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

/// Check an event against a rule's conditions. All conditions must hold.
/// Returns the match outcome and a snapshot of the values checked.
pub fn match_conditions(
    event: &Event,
    conditions: &serde_json::Map<String, Value>,
) -> (bool, Value) {
    let mut snapshot = serde_json::Map::new();
    let mut matched = true;

    for (key, expected) in conditions {
        let actual = resolve_field(event, key);
        if !matches_operator(&actual, expected) {
            matched = false;
        }
        snapshot.insert(key.clone(), actual);
    }

    (matched, Value::Object(snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ActorContext;

    fn login_event(country: &str) -> Event {
        Event {
            event_id: "evt_1".into(),
            event_type: "authentication.login".into(),
            org_id: "org_1".into(),
            timestamp: Utc::now(),
            actor: ActorContext {
                user_id: "u_1".into(),
                ip_address: "10.0.0.1".into(),
                user_agent: "test".into(),
                device_fingerprint: "fp".into(),
                session_id: None,
            },
            context: crate::models::GeoContext {
                geo_lat: 0.0,
                geo_lon: 0.0,
                country_code: Some(country.to_string()),
                city: None,
            },
            payload: serde_json::json!({"amount": 150.0}),
        }
    }

    fn conditions(v: Value) -> serde_json::Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_country_in_list_matches() {
        let event = login_event("KP");
        let conds = conditions(serde_json::json!({
            "event_type": "authentication.login",
            "country_code": {"in": ["KP", "IR", "SY"]}
        }));

        let (matched, snapshot) = match_conditions(&event, &conds);
        assert!(matched);
        assert_eq!(snapshot["country_code"], "KP");
    }

    #[test]
    fn test_country_not_in_list_fails() {
        let event = login_event("US");
        let conds = conditions(serde_json::json!({
            "country_code": {"in": ["KP", "IR"]}
        }));
        let (matched, _) = match_conditions(&event, &conds);
        assert!(!matched);
    }

    #[test]
    fn test_payload_numeric_comparison() {
        let event = login_event("US");
        let conds = conditions(serde_json::json!({"amount": {"gt": 100.0}}));
        assert!(match_conditions(&event, &conds).0);

        let conds = conditions(serde_json::json!({"amount": {"gt": 200.0}}));
        assert!(!match_conditions(&event, &conds).0);
    }

    #[test]
    fn test_empty_conditions_match_everything() {
        let event = login_event("US");
        let (matched, _) = match_conditions(&event, &serde_json::Map::new());
        assert!(matched);
    }

    #[test]
    fn test_validation_catches_missing_sections() {
        let raw = serde_json::json!({"rules": []});
        let issues = validate_rules(&raw);
        assert!(issues.iter().any(|i| i.contains("scoring")));
        assert!(issues.iter().any(|i| i.contains("gates")));
    }

    #[test]
    fn test_validation_catches_missing_score() {
        let raw = serde_json::json!({
            "scoring": {"base_risk": 0.1, "velocity_weight": 0.4, "behavioral_weight": 0.3},
            "rules": [{"id": "r1", "name": "no score", "type": "behavioral"}],
            "gates": []
        });
        let issues = validate_rules(&raw);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].contains("Missing 'score'"));
    }

    #[test]
    fn test_validation_rejects_bad_type() {
        let raw = serde_json::json!({
            "scoring": {"base_risk": 0.1, "velocity_weight": 0.4, "behavioral_weight": 0.3},
            "rules": [{"id": "r1", "name": "r1", "type": "magic", "score": 0.5}],
            "gates": [{"id": "g1", "score": 0.9}]
        });
        let issues = validate_rules(&raw);
        assert!(issues.iter().any(|i| i.contains("Invalid type 'magic'")));
        assert!(issues.iter().any(|i| i.contains("Missing conditions")));
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": 2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": 2, "b": 1}"#).unwrap();
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn test_rule_file_parses_from_yaml() {
        let yaml = r#"
scoring:
  base_risk: 0.1
  velocity_weight: 0.4
  behavioral_weight: 0.3
  thresholds:
    review: 0.30
    challenge: 0.60
    block: 0.80
rules:
  - id: rapid_transactions
    name: Rapid transactions
    type: velocity
    score: 0.7
  - id: odd_hours
    name: Odd hours access
    type: behavioral
    score: 0.4
    conditions:
      event_type: data_access.read
gates:
  - id: sanctioned_region
    conditions:
      country_code:
        in: [KP, IR, SY, CU]
    score: 0.95
rule_combinations:
  - id: takeover_pattern
    triggered_rules: [impossible_travel, rapid_transactions]
    boost: 0.15
"#;
        let file: RuleFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(file.rules.len(), 2);
        assert_eq!(file.gates.len(), 1);
        assert_eq!(file.rule_combinations[0].boost, 0.15);
        assert_eq!(file.rules_of_kind(RuleKind::Velocity).count(), 1);
        assert_eq!(file.behavioral_rules().count(), 1);
    }
}
