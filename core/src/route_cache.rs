//! Route cache — bounded LRU with a TTL, keyed by the optimization
//! input (start point rounded to 4 decimals plus the sorted stop ids).
//!
//! Readers take the lock briefly to clone; writers serialise through
//! the same lock. Cache hits come back with `quality = Cached`.

use crate::clock::Clock;
use crate::route::{Route, RouteQuality};
use crate::types::Location;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

struct Entry {
    route:       Route,
    inserted_at: DateTime<Utc>,
    last_used:   u64,
}

pub struct RouteCache {
    clock:       Arc<dyn Clock>,
    ttl:         Duration,
    max_entries: usize,
    inner:       Mutex<(HashMap<String, Entry>, u64)>,
}

impl RouteCache {
    pub fn new(clock: Arc<dyn Clock>, ttl_ms: i64, max_entries: usize) -> Self {
        Self {
            clock,
            ttl: Duration::milliseconds(ttl_ms),
            max_entries: max_entries.max(1),
            inner: Mutex::new((HashMap::new(), 0)),
        }
    }

    /// Cache key: start location rounded to 4 decimal places (~11 m)
    /// plus the stop ids in sorted order.
    pub fn key(start: Location, stop_ids: &[String]) -> String {
        let mut ids = stop_ids.to_vec();
        ids.sort_unstable();
        format!("{:.4},{:.4}|{}", start.lat, start.lng, ids.join(","))
    }

    pub fn get(&self, key: &str) -> Option<Route> {
        let now = self.clock.now();
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let (map, counter) = &mut *guard;

        let expired = match map.get(key) {
            Some(entry) => now - entry.inserted_at >= self.ttl,
            None => return None,
        };
        if expired {
            map.remove(key);
            return None;
        }

        *counter += 1;
        let tick = *counter;
        let entry = map.get_mut(key)?;
        entry.last_used = tick;
        let mut route = entry.route.clone();
        route.quality = RouteQuality::Cached;
        Some(route)
    }

    pub fn put(&self, key: String, route: Route) {
        let now = self.clock.now();
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let (map, counter) = &mut *guard;
        *counter += 1;
        let tick = *counter;

        map.insert(key, Entry { route, inserted_at: now, last_used: tick });

        // Evict: expired first, then least-recently-used.
        if map.len() > self.max_entries {
            map.retain(|_, e| now - e.inserted_at < self.ttl);
        }
        while map.len() > self.max_entries {
            if let Some(oldest) = map
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                map.remove(&oldest);
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn route(id: &str) -> Route {
        Route {
            id: id.into(),
            driver_id: "d1".into(),
            stops: Vec::new(),
            segments: Vec::new(),
            total_distance_km: 1.0,
            total_duration_min: 3.0,
            quality: RouteQuality::Good,
        }
    }

    fn cache(max: usize) -> (Arc<ManualClock>, RouteCache) {
        let clock = Arc::new(ManualClock::starting_at(
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        ));
        let cache = RouteCache::new(clock.clone(), 300_000, max);
        (clock, cache)
    }

    #[test]
    fn key_is_insensitive_to_stop_order() {
        let start = Location::new(24.71234, 46.67891);
        let a = RouteCache::key(start, &["p-o1".into(), "d-o1".into()]);
        let b = RouteCache::key(start, &["d-o1".into(), "p-o1".into()]);
        assert_eq!(a, b);
    }

    #[test]
    fn hit_comes_back_as_cached() {
        let (_clock, cache) = cache(10);
        cache.put("k".into(), route("r1"));
        let hit = cache.get("k").unwrap();
        assert_eq!(hit.quality, RouteQuality::Cached);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let (clock, cache) = cache(10);
        cache.put("k".into(), route("r1"));
        clock.advance_minutes(6);
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn lru_eviction_keeps_recent() {
        let (_clock, cache) = cache(2);
        cache.put("a".into(), route("ra"));
        cache.put("b".into(), route("rb"));
        let _ = cache.get("a"); // touch a so b is the LRU
        cache.put("c".into(), route("rc"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }
}
