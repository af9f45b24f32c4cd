//! Acceptance policies applied to every record before it is enqueued:
//! level gate, per-level sampling, rolling-minute rate limit, field masking.

use std::collections::HashMap;

use rand::Rng;
use serde_json::Value;

use crate::entry::{Level, LogEntry};

pub const MASKED_VALUE: &str = "********";

/// Minimum-severity gate. Events ranked strictly below the configured floor
/// are dropped.
pub fn level_allows(floor: Level, level: Level) -> bool {
    level.rank() >= floor.rank()
}

/// Draws a uniform [0,1) variate against the per-level acceptance rate.
/// Levels without a configured rate are always accepted.
pub fn should_sample(rates: &HashMap<Level, f64>, level: Level) -> bool {
    match rates.get(&level) {
        Some(rate) => accept_draw(rand::thread_rng().gen::<f64>(), *rate),
        None => true,
    }
}

fn accept_draw(draw: f64, rate: f64) -> bool {
    draw < rate.clamp(0.0, 1.0)
}

/// Per-minute admission counter keyed by the monotonic epoch minute
/// (`unix_ms / 60_000`), so keys never collide across hours or months.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    counts: HashMap<i64, u32>,
}

impl RateLimiter {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            counts: HashMap::new(),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Resets all counters; used when the cap changes at runtime.
    pub fn set_limit(&mut self, limit: u32) {
        self.limit = limit;
        self.counts.clear();
    }

    /// Admits or rejects one event at the given wall-clock time.
    /// A limit of zero means unlimited.
    pub fn admit(&mut self, now_ms: i64) -> bool {
        if self.limit == 0 {
            return true;
        }
        let minute = now_ms.div_euclid(60_000);
        let count = self.counts.entry(minute).or_insert(0);
        *count += 1;
        *count <= self.limit
    }

    /// Drops counters for minutes older than the current one.
    pub fn purge_stale(&mut self, now_ms: i64) {
        let minute = now_ms.div_euclid(60_000);
        self.counts.retain(|key, _| *key >= minute);
    }

    #[cfg(test)]
    fn tracked_minutes(&self) -> usize {
        self.counts.len()
    }
}

/// Replaces the value at any key named in `fields` with [`MASKED_VALUE`],
/// recursively through nested mappings. Arrays are traversed; atoms are left
/// untouched.
pub fn mask_value(value: &mut Value, fields: &[String]) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map.iter_mut() {
                if fields.iter().any(|field| field == key) {
                    *nested = Value::String(MASKED_VALUE.to_string());
                } else {
                    mask_value(nested, fields);
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                mask_value(item, fields);
            }
        }
        _ => {}
    }
}

/// Applies masking to every free-form mapping the record carries. Typed
/// envelope fields never hold caller-supplied secrets and are not touched.
pub fn mask_entry(entry: &mut LogEntry, fields: &[String]) {
    if fields.is_empty() {
        return;
    }

    for map in [
        &mut entry.context,
        &mut entry.global_context,
        &mut entry.user_context,
    ] {
        for (key, nested) in map.iter_mut() {
            if fields.iter().any(|field| field == key) {
                *nested = Value::String(MASKED_VALUE.to_string());
            } else {
                mask_value(nested, fields);
            }
        }
    }

    if let Some(user) = entry.user.as_mut() {
        mask_value(user, fields);
    }
    for crumb in entry.breadcrumbs.iter_mut() {
        if let Some(data) = crumb.data.as_mut() {
            mask_value(data, fields);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn level_gate_is_a_strict_floor() {
        assert!(level_allows(Level::Info, Level::Info));
        assert!(level_allows(Level::Info, Level::Critical));
        assert!(!level_allows(Level::Info, Level::Debug));
        assert!(level_allows(Level::Trace, Level::Trace));
    }

    #[test]
    fn sampling_is_deterministic_at_the_extremes() {
        let mut rates = HashMap::new();
        rates.insert(Level::Info, 0.0);
        rates.insert(Level::Error, 1.0);

        for _ in 0..100 {
            assert!(!should_sample(&rates, Level::Info));
            assert!(should_sample(&rates, Level::Error));
            assert!(should_sample(&rates, Level::Warn));
        }
    }

    #[test]
    fn sampling_fraction_converges_to_the_rate() {
        let mut rates = HashMap::new();
        rates.insert(Level::Debug, 0.5);

        let accepted = (0..4_000)
            .filter(|_| should_sample(&rates, Level::Debug))
            .count() as f64;
        let fraction = accepted / 4_000.0;
        assert!(fraction > 0.4 && fraction < 0.6, "fraction={fraction}");
    }

    #[test]
    fn accept_draw_respects_boundaries() {
        assert!(accept_draw(0.0, 0.3));
        assert!(!accept_draw(0.3, 0.3));
        assert!(!accept_draw(0.99, 0.0));
        assert!(accept_draw(0.99, 1.5));
    }

    #[test]
    fn rate_limiter_caps_per_minute_and_resets_on_rollover() {
        let mut limiter = RateLimiter::new(3);
        let minute_a = 1_700_000_040_000i64;
        let minute_b = minute_a + 60_000;

        let admitted = (0..5).filter(|_| limiter.admit(minute_a)).count();
        assert_eq!(admitted, 3);

        assert!(limiter.admit(minute_b));
    }

    #[test]
    fn rate_limiter_zero_means_unlimited() {
        let mut limiter = RateLimiter::new(0);
        for _ in 0..1_000 {
            assert!(limiter.admit(1_700_000_000_000));
        }
    }

    #[test]
    fn rate_limiter_janitor_purges_old_minutes() {
        let mut limiter = RateLimiter::new(1);
        let start = 1_700_000_040_000i64;
        limiter.admit(start);
        limiter.admit(start + 60_000);
        limiter.admit(start + 120_000);
        assert_eq!(limiter.tracked_minutes(), 3);

        limiter.purge_stale(start + 120_000);
        assert_eq!(limiter.tracked_minutes(), 1);
    }

    #[test]
    fn rate_limiter_reset_clears_counts() {
        let mut limiter = RateLimiter::new(1);
        let now = 1_700_000_000_000i64;
        assert!(limiter.admit(now));
        assert!(!limiter.admit(now));

        limiter.set_limit(1);
        assert!(limiter.admit(now));
    }

    #[test]
    fn mask_value_walks_nested_maps_and_arrays() {
        let fields = vec!["password".to_string(), "token".to_string()];
        let mut value = json!({
            "password": "p",
            "nested": {"token": "t", "keep": "k"},
            "list": [{"password": 42}, "scalar"],
        });

        mask_value(&mut value, &fields);

        assert_eq!(value["password"], MASKED_VALUE);
        assert_eq!(value["nested"]["token"], MASKED_VALUE);
        assert_eq!(value["nested"]["keep"], "k");
        assert_eq!(value["list"][0]["password"], MASKED_VALUE);
        assert_eq!(value["list"][1], "scalar");
    }

    #[test]
    fn mask_entry_only_rewrites_matching_paths() {
        let fields = vec!["password".to_string()];
        let mut entry = LogEntry::new(Level::Info, "x", "svc");
        entry
            .context
            .insert("password".to_string(), json!("hunter2"));
        entry
            .context
            .insert("nested".to_string(), json!({"password": "p", "other": 1}));
        entry.user = Some(json!({"id": "u1", "password": "p"}));

        let before = serde_json::to_value(&entry).unwrap();
        mask_entry(&mut entry, &fields);
        let after = serde_json::to_value(&entry).unwrap();

        assert_eq!(after["context"]["password"], MASKED_VALUE);
        assert_eq!(after["context"]["nested"]["password"], MASKED_VALUE);
        assert_eq!(after["user"]["password"], MASKED_VALUE);
        // Everything else is untouched.
        assert_eq!(after["context"]["nested"]["other"], before["context"]["nested"]["other"]);
        assert_eq!(after["message"], before["message"]);
        assert_eq!(after["user"]["id"], before["user"]["id"]);
    }

    #[test]
    fn mask_entry_with_no_fields_is_identity() {
        let mut entry = LogEntry::new(Level::Info, "x", "svc");
        entry.context.insert("password".to_string(), json!("p"));
        let before = entry.clone();
        mask_entry(&mut entry, &[]);
        assert_eq!(entry, before);
    }
}
