//! Velocity & state store
//! Mission: Bounded-TTL counters, sets, and small records on the risk-engine hot path
//!
//! In-process stand-in for the shared KV product. Every entry carries its own
//! expiry; reads treat an expired entry as absent and a periodic sweep
//! reclaims memory. Increments are atomic per key; reads may be slightly
//! stale, which the engine tolerates because it re-reads within a single
//! evaluation.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

struct CounterEntry {
    count: u64,
    expires_at: Instant,
}

struct LocationEntry {
    lat: f64,
    lon: f64,
    seen_at: DateTime<Utc>,
    expires_at: Instant,
}

struct SetEntry {
    members: HashSet<String>,
    expires_at: Instant,
}

/// Last known location of a user, with the wall-clock time it was observed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LastLocation {
    pub lat: f64,
    pub lon: f64,
    pub seen_at: DateTime<Utc>,
}

/// TTL-bounded state store keyed by `(user_id, ...)` strings.
pub struct StateStore {
    counters: Mutex<HashMap<String, CounterEntry>>,
    locations: Mutex<HashMap<String, LocationEntry>>,
    device_sets: Mutex<HashMap<String, SetEntry>>,
    /// Short-window sets (e.g. "new devices seen in 5 minutes"). The whole
    /// set evicts atomically at window end.
    window_sets: Mutex<HashMap<String, SetEntry>>,
    /// Small string KV used for rule-set distribution between instances.
    kv: Mutex<HashMap<String, (String, Option<Instant>)>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            locations: Mutex::new(HashMap::new()),
            device_sets: Mutex::new(HashMap::new()),
            window_sets: Mutex::new(HashMap::new()),
            kv: Mutex::new(HashMap::new()),
        }
    }

    /// Increment a counter, creating it with `ttl` if absent. Returns the new
    /// count. The TTL is fixed at creation; the window does not slide.
    pub fn increment_counter(&self, key: &str, ttl: Duration) -> u64 {
        let mut counters = self.counters.lock();
        let now = Instant::now();

        let entry = counters.entry(key.to_string()).or_insert(CounterEntry {
            count: 0,
            expires_at: now + ttl,
        });

        if entry.expires_at <= now {
            entry.count = 0;
            entry.expires_at = now + ttl;
        }

        entry.count += 1;
        entry.count
    }

    pub fn counter(&self, key: &str) -> Option<u64> {
        let counters = self.counters.lock();
        counters
            .get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.count)
    }

    pub fn set_location(&self, user_id: &str, lat: f64, lon: f64, ttl: Duration) {
        let mut locations = self.locations.lock();
        locations.insert(
            user_id.to_string(),
            LocationEntry {
                lat,
                lon,
                seen_at: Utc::now(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn location(&self, user_id: &str) -> Option<LastLocation> {
        let locations = self.locations.lock();
        locations
            .get(user_id)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| LastLocation {
                lat: e.lat,
                lon: e.lon,
                seen_at: e.seen_at,
            })
    }

    /// Add a device fingerprint to a user's known set. The TTL applies to the
    /// set, not individual members, and is refreshed on write.
    pub fn add_device(&self, user_id: &str, fingerprint: &str, ttl: Duration) {
        let mut sets = self.device_sets.lock();
        let now = Instant::now();

        let entry = sets.entry(user_id.to_string()).or_insert(SetEntry {
            members: HashSet::new(),
            expires_at: now + ttl,
        });

        if entry.expires_at <= now {
            entry.members.clear();
        }
        entry.members.insert(fingerprint.to_string());
        entry.expires_at = now + ttl;
    }

    pub fn has_device(&self, user_id: &str, fingerprint: &str) -> bool {
        let sets = self.device_sets.lock();
        sets.get(user_id)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.members.contains(fingerprint))
            .unwrap_or(false)
    }

    pub fn devices_of(&self, user_id: &str) -> Vec<String> {
        let sets = self.device_sets.lock();
        sets.get(user_id)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Add a member to a short-window set and return the set's cardinality.
    /// An expired window is dropped wholesale before the add.
    pub fn add_to_window(&self, key: &str, member: &str, window: Duration) -> usize {
        let mut sets = self.window_sets.lock();
        let now = Instant::now();

        let entry = sets.entry(key.to_string()).or_insert(SetEntry {
            members: HashSet::new(),
            expires_at: now + window,
        });

        if entry.expires_at <= now {
            entry.members.clear();
            entry.expires_at = now + window;
        }

        entry.members.insert(member.to_string());
        entry.members.len()
    }

    /// Members of a short-window set, empty once the window has closed.
    pub fn window_members(&self, key: &str) -> Vec<String> {
        let sets = self.window_sets.lock();
        sets.get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn kv_set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let mut kv = self.kv.lock();
        kv.insert(
            key.to_string(),
            (value.to_string(), ttl.map(|t| Instant::now() + t)),
        );
    }

    pub fn kv_get(&self, key: &str) -> Option<String> {
        let kv = self.kv.lock();
        kv.get(key)
            .filter(|(_, exp)| exp.map(|e| e > Instant::now()).unwrap_or(true))
            .map(|(v, _)| v.clone())
    }

    /// Drop expired entries. Called from a background task.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.counters.lock().retain(|_, e| e.expires_at > now);
        self.locations.lock().retain(|_, e| e.expires_at > now);
        self.device_sets.lock().retain(|_, e| e.expires_at > now);
        self.window_sets.lock().retain(|_, e| e.expires_at > now);
        self.kv
            .lock()
            .retain(|_, (_, exp)| exp.map(|e| e > now).unwrap_or(true));
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_increments() {
        let store = StateStore::new();
        let ttl = Duration::from_secs(60);

        assert_eq!(store.increment_counter("user:u1:tx:hourly", ttl), 1);
        assert_eq!(store.increment_counter("user:u1:tx:hourly", ttl), 2);
        assert_eq!(store.counter("user:u1:tx:hourly"), Some(2));
        assert_eq!(store.counter("user:u2:tx:hourly"), None);
    }

    #[test]
    fn test_counter_expiry_resets() {
        let store = StateStore::new();

        store.increment_counter("k", Duration::from_millis(0));
        // Entry expired immediately; next increment starts a fresh window.
        assert_eq!(store.increment_counter("k", Duration::from_secs(60)), 1);
    }

    #[test]
    fn test_location_round_trip() {
        let store = StateStore::new();
        store.set_location("u1", 40.7128, -74.0060, Duration::from_secs(60));

        let loc = store.location("u1").unwrap();
        assert!((loc.lat - 40.7128).abs() < 1e-9);
        assert!((loc.lon + 74.0060).abs() < 1e-9);
        assert!(store.location("u2").is_none());
    }

    #[test]
    fn test_device_set_membership() {
        let store = StateStore::new();
        let ttl = Duration::from_secs(60);

        assert!(!store.has_device("u1", "fp_a"));
        store.add_device("u1", "fp_a", ttl);
        store.add_device("u1", "fp_b", ttl);

        assert!(store.has_device("u1", "fp_a"));
        assert!(!store.has_device("u1", "fp_c"));
        assert_eq!(store.devices_of("u1").len(), 2);
    }

    #[test]
    fn test_window_set_cardinality() {
        let store = StateStore::new();
        let window = Duration::from_secs(60);

        assert_eq!(store.add_to_window("u1:devices:5min", "a", window), 1);
        assert_eq!(store.add_to_window("u1:devices:5min", "b", window), 2);
        // Duplicate member does not grow the set.
        assert_eq!(store.add_to_window("u1:devices:5min", "b", window), 2);
    }

    #[test]
    fn test_window_set_evicts_wholesale() {
        let store = StateStore::new();

        store.add_to_window("k", "a", Duration::from_millis(0));
        store.add_to_window("k", "b", Duration::from_millis(0));
        // Window closed: set restarts from scratch.
        assert_eq!(store.add_to_window("k", "c", Duration::from_secs(60)), 1);
    }

    #[test]
    fn test_kv_ttl() {
        let store = StateStore::new();
        store.kv_set("rules:current_version", "1.0.1", None);
        assert_eq!(
            store.kv_get("rules:current_version").as_deref(),
            Some("1.0.1")
        );

        store.kv_set("ephemeral", "x", Some(Duration::from_millis(0)));
        assert_eq!(store.kv_get("ephemeral"), None);
    }

    #[test]
    fn test_sweep_reclaims() {
        let store = StateStore::new();
        store.increment_counter("dead", Duration::from_millis(0));
        store.increment_counter("live", Duration::from_secs(60));

        store.sweep();
        assert_eq!(store.counter("live"), Some(1));
        assert!(store.counters.lock().get("dead").is_none());
    }
}
