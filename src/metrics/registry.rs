//! Registry of rolling windows for every endpoint seen since startup.

use std::sync::Arc;

use chrono::Duration;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::clock::Clock;
use super::window::RollingWindow;
use super::Granularity;
use crate::config::WindowConfig;
use crate::intake::{EndpointKey, TelemetryEvent};

/// The three windows of one endpoint plus its latest schema fingerprint.
pub struct EndpointWindows {
    pub short: RollingWindow,
    pub medium: RollingWindow,
    pub long: RollingWindow,
    latest_fingerprint: Mutex<Option<String>>,
}

impl EndpointWindows {
    fn new(config: &WindowConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            short: RollingWindow::new(Duration::seconds(config.short_secs as i64), clock.clone()),
            medium: RollingWindow::new(Duration::seconds(config.medium_secs as i64), clock.clone()),
            long: RollingWindow::new(Duration::seconds(config.long_secs as i64), clock),
            latest_fingerprint: Mutex::new(None),
        }
    }

    pub fn window(&self, granularity: Granularity) -> &RollingWindow {
        match granularity {
            Granularity::Short => &self.short,
            Granularity::Medium => &self.medium,
            Granularity::Long => &self.long,
        }
    }

    /// Most recently observed fingerprint, if any event carried one.
    pub fn latest_fingerprint(&self) -> Option<String> {
        self.latest_fingerprint.lock().clone()
    }

    fn record(&self, event: &TelemetryEvent) {
        for granularity in Granularity::ALL {
            self.window(granularity).record(event.latency_ms, event.is_error);
        }
        if let Some(fp) = &event.schema_fingerprint {
            *self.latest_fingerprint.lock() = Some(fp.clone());
        }
    }
}

/// Concurrent map of endpoint -> windows, shared by intake workers and the scanner.
pub struct EndpointRegistry {
    endpoints: DashMap<EndpointKey, Arc<EndpointWindows>>,
    config: WindowConfig,
    clock: Arc<dyn Clock>,
}

impl EndpointRegistry {
    pub fn new(config: WindowConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            endpoints: DashMap::new(),
            config,
            clock,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Fold one event into its endpoint's windows, creating them on first sight.
    ///
    /// The map guard is held while recording so `prune_idle` cannot drop an
    /// entry between lookup and write.
    pub fn record(&self, event: &TelemetryEvent) {
        if let Some(windows) = self.endpoints.get(&event.endpoint) {
            windows.record(event);
            return;
        }
        self.endpoints
            .entry(event.endpoint.clone())
            .or_insert_with(|| Arc::new(EndpointWindows::new(&self.config, self.clock.clone())))
            .record(event);
    }

    /// Drop endpoints whose long window has drained. Returns how many were removed.
    pub fn prune_idle(&self) -> usize {
        let before = self.endpoints.len();
        self.endpoints.retain(|_, windows| windows.long.count() > 0);
        before.saturating_sub(self.endpoints.len())
    }

    pub fn get(&self, endpoint: &EndpointKey) -> Option<Arc<EndpointWindows>> {
        self.endpoints.get(endpoint).map(|entry| entry.clone())
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Point-in-time list of endpoints. No map locks are held afterwards.
    pub fn snapshot(&self) -> Vec<(EndpointKey, Arc<EndpointWindows>)> {
        let mut endpoints: Vec<_> = self
            .endpoints
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        endpoints.sort_by(|a, b| a.0.cmp(&b.0));
        endpoints
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::clock::ManualClock;
    use chrono::Utc;

    fn event(method: &str, path: &str, latency_ms: u64, status: u16, fp: Option<&str>) -> TelemetryEvent {
        TelemetryEvent {
            request_id: None,
            timestamp: Utc::now(),
            endpoint: EndpointKey::new(method, path),
            status_code: status,
            latency_ms,
            is_error: status >= 400,
            schema_fingerprint: fp.map(str::to_string),
        }
    }

    #[test]
    fn test_record_feeds_all_three_windows() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry = EndpointRegistry::new(WindowConfig::default(), clock.clone());

        registry.record(&event("GET", "/users", 10, 200, None));
        registry.record(&event("get", "/USERS", 20, 500, Some("fp1")));
        registry.record(&event("POST", "/users", 30, 201, None));

        assert_eq!(registry.len(), 2);
        let users = registry.get(&EndpointKey::new("GET", "/users")).unwrap();
        for g in Granularity::ALL {
            assert_eq!(users.window(g).count(), 2);
            assert_eq!(users.window(g).error_rate_pct(), 50.0);
        }
        assert_eq!(users.latest_fingerprint().as_deref(), Some("fp1"));

        // Past the short window only.
        clock.advance(chrono::Duration::minutes(10));
        assert_eq!(users.short.count(), 0);
        assert_eq!(users.medium.count(), 2);
        assert_eq!(users.long.count(), 2);
    }

    #[test]
    fn test_fingerprint_is_kept_when_later_events_have_none() {
        let registry = EndpointRegistry::new(WindowConfig::default(), Arc::new(ManualClock::new(Utc::now())));
        registry.record(&event("GET", "/a", 1, 200, Some("fp1")));
        registry.record(&event("GET", "/a", 1, 200, None));
        let windows = registry.get(&EndpointKey::new("GET", "/a")).unwrap();
        assert_eq!(windows.latest_fingerprint().as_deref(), Some("fp1"));
    }

    #[test]
    fn test_prune_idle_drops_only_drained_endpoints() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry = EndpointRegistry::new(WindowConfig::default(), clock.clone());
        registry.record(&event("GET", "/old", 1, 200, Some("fp1")));

        clock.advance(chrono::Duration::hours(23));
        registry.record(&event("GET", "/recent", 1, 200, None));
        assert_eq!(registry.prune_idle(), 0);

        clock.advance(chrono::Duration::hours(2));
        assert_eq!(registry.prune_idle(), 1);
        assert!(registry.get(&EndpointKey::new("GET", "/old")).is_none());
        assert!(registry.get(&EndpointKey::new("GET", "/recent")).is_some());

        // A pruned endpoint starts fresh when it reappears.
        registry.record(&event("GET", "/old", 5, 500, None));
        let old = registry.get(&EndpointKey::new("GET", "/old")).unwrap();
        assert_eq!(old.long.count(), 1);
        assert_eq!(old.latest_fingerprint(), None);
    }

    #[test]
    fn test_snapshot_is_sorted_by_endpoint() {
        let registry = EndpointRegistry::new(WindowConfig::default(), Arc::new(ManualClock::new(Utc::now())));
        registry.record(&event("POST", "/b", 1, 200, None));
        registry.record(&event("GET", "/a", 1, 200, None));
        let keys: Vec<String> = registry
            .snapshot()
            .into_iter()
            .map(|(k, _)| k.to_string())
            .collect();
        assert_eq!(keys, vec!["get:/a", "post:/b"]);
    }
}
