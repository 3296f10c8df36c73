//! Velocity checks
//! Mission: Catch physically implausible or rate-anomalous behavior in real time

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::models::{event_types, Config, Event};
use crate::state::StateStore;

/// Earth's radius in miles.
const EARTH_RADIUS_MI: f64 = 3959.0;

/// Rule ids this checker implements. Velocity rules in the source file with
/// these ids dispatch here; anything else falls back to condition matching.
pub const IMPOSSIBLE_TRAVEL: &str = "impossible_travel";
pub const RAPID_TRANSACTIONS: &str = "rapid_transactions";
pub const MULTI_DEVICE_LOGIN: &str = "multi_device_login";

#[derive(Debug, Clone)]
pub struct VelocityOutcome {
    pub matched: bool,
    pub snapshot: Value,
}

#[derive(Debug, Clone)]
pub struct VelocityConfig {
    pub travel_distance_threshold_mi: f64,
    pub max_travel_speed_mph: f64,
    pub rapid_tx_hourly_threshold: u64,
    pub counter_ttl: Duration,
    pub location_ttl: Duration,
    pub device_ttl: Duration,
    pub device_window: Duration,
    pub device_window_limit: usize,
}

impl VelocityConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            travel_distance_threshold_mi: config.travel_distance_threshold_mi,
            max_travel_speed_mph: config.max_travel_speed_mph,
            rapid_tx_hourly_threshold: config.rapid_tx_hourly_threshold,
            counter_ttl: Duration::from_secs(config.counter_ttl_secs),
            location_ttl: Duration::from_secs(config.location_ttl_secs),
            device_ttl: Duration::from_secs(config.device_ttl_secs),
            device_window: Duration::from_secs(config.device_window_secs),
            device_window_limit: config.device_window_limit,
        }
    }
}

/// Great-circle distance in miles (haversine).
pub fn haversine_miles(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();

    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_MI * c
}

pub struct VelocityChecker {
    state: Arc<StateStore>,
    config: VelocityConfig,
}

impl VelocityChecker {
    pub fn new(state: Arc<StateStore>, config: VelocityConfig) -> Self {
        Self { state, config }
    }

    /// Dispatch on a velocity rule id.
    pub fn check(&self, rule_id: &str, event: &Event) -> Option<VelocityOutcome> {
        match rule_id {
            IMPOSSIBLE_TRAVEL => Some(self.check_impossible_travel(event)),
            RAPID_TRANSACTIONS => Some(self.check_rapid_transactions(event)),
            MULTI_DEVICE_LOGIN => Some(self.check_multi_device(event)),
            _ => None,
        }
    }

    /// Successive logins whose separation exceeds the distance threshold at
    /// an implied speed above the human ceiling. The last known location is
    /// always updated to the current event's location after evaluation.
    pub fn check_impossible_travel(&self, event: &Event) -> VelocityOutcome {
        if event.event_type != event_types::AUTHENTICATION_LOGIN {
            return no_match(json!({"skipped": "not a login event"}));
        }

        let key = location_key(&event.org_id, &event.actor.user_id);
        let previous = self.state.location(&key);
        self.state.set_location(
            &key,
            event.context.geo_lat,
            event.context.geo_lon,
            self.config.location_ttl,
        );

        let Some(previous) = previous else {
            return no_match(json!({"first_location": true}));
        };

        let distance = haversine_miles(
            previous.lat,
            previous.lon,
            event.context.geo_lat,
            event.context.geo_lon,
        );

        let elapsed_hours =
            (event.timestamp - previous.seen_at).num_milliseconds() as f64 / 3_600_000.0;
        // Zero or negative elapsed time with real distance means two places
        // at once: implied speed is unbounded.
        let required_speed_mph = if elapsed_hours > 0.0 {
            distance / elapsed_hours
        } else {
            f64::INFINITY
        };

        let matched = distance > self.config.travel_distance_threshold_mi
            && required_speed_mph > self.config.max_travel_speed_mph;

        if matched {
            warn!(
                user_id = %event.actor.user_id,
                distance_mi = distance,
                required_speed_mph,
                "Impossible travel detected"
            );
        }

        VelocityOutcome {
            matched,
            snapshot: json!({
                "distance_miles": distance,
                "elapsed_hours": elapsed_hours,
                "required_speed_mph": if required_speed_mph.is_finite() {
                    json!(required_speed_mph)
                } else {
                    json!("unbounded")
                },
                "distance_threshold_mi": self.config.travel_distance_threshold_mi,
                "max_speed_mph": self.config.max_travel_speed_mph,
            }),
        }
    }

    /// Hourly per-user transaction counter.
    pub fn check_rapid_transactions(&self, event: &Event) -> VelocityOutcome {
        if event.event_type != event_types::TRANSACTION_ATTEMPTED {
            return no_match(json!({"skipped": "not a transaction event"}));
        }

        let key = format!(
            "org:{}:user:{}:transactions:hourly",
            event.org_id, event.actor.user_id
        );
        let count = self.state.increment_counter(&key, self.config.counter_ttl);
        let matched = count > self.config.rapid_tx_hourly_threshold;

        if matched {
            warn!(
                user_id = %event.actor.user_id,
                count,
                "Rapid transactions detected"
            );
        }

        VelocityOutcome {
            matched,
            snapshot: json!({
                "hourly_count": count,
                "threshold": self.config.rapid_tx_hourly_threshold,
            }),
        }
    }

    /// Logins from too many unseen devices inside a short window. The
    /// fingerprint is cached into the known set after evaluation either way.
    pub fn check_multi_device(&self, event: &Event) -> VelocityOutcome {
        if event.event_type != event_types::AUTHENTICATION_LOGIN {
            return no_match(json!({"skipped": "not a login event"}));
        }
        let fingerprint = &event.actor.device_fingerprint;
        if fingerprint.is_empty() {
            return no_match(json!({"skipped": "no device fingerprint"}));
        }

        let device_key = device_key(&event.org_id, &event.actor.user_id);
        if self.state.has_device(&device_key, fingerprint) {
            return no_match(json!({"known_device": true}));
        }

        let window_key = format!("{device_key}:recent");
        let new_devices = self.state.add_to_window(
            &window_key,
            fingerprint,
            self.config.device_window,
        );
        let matched = new_devices > self.config.device_window_limit;

        self.state
            .add_device(&device_key, fingerprint, self.config.device_ttl);

        if matched {
            warn!(
                user_id = %event.actor.user_id,
                new_devices,
                window_secs = self.config.device_window.as_secs(),
                "Multi-device login detected"
            );
        }

        VelocityOutcome {
            matched,
            snapshot: json!({
                "new_devices_in_window": new_devices,
                "window_limit": self.config.device_window_limit,
            }),
        }
    }
}

fn location_key(org_id: &str, user_id: &str) -> String {
    format!("org:{org_id}:user:{user_id}")
}

fn device_key(org_id: &str, user_id: &str) -> String {
    format!("org:{org_id}:user:{user_id}:devices")
}

fn no_match(snapshot: Value) -> VelocityOutcome {
    VelocityOutcome {
        matched: false,
        snapshot,
    }
}
