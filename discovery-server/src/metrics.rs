//! Lightweight Prometheus-compatible metrics for the discovery server.
//!
//! Atomic counters, rendered in Prometheus text exposition format. The
//! server logs the rendering periodically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub struct Metrics {
    /// Open client connections (gauge)
    pub active_connections: AtomicU64,
    /// Live sessions (gauge)
    pub active_sessions: AtomicU64,
    pub sessions_created_total: AtomicU64,
    pub joins_total: AtomicU64,
    /// Joins refused: not found, full, bad password, bad signature
    pub join_rejections_total: AtomicU64,
    /// Messages relayed to other session members
    pub messages_relayed_total: AtomicU64,
    pub rate_limited_total: AtomicU64,
    pub migrations_total: AtomicU64,
    pub start_time: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            active_connections: AtomicU64::new(0),
            active_sessions: AtomicU64::new(0),
            sessions_created_total: AtomicU64::new(0),
            joins_total: AtomicU64::new(0),
            join_rejections_total: AtomicU64::new(0),
            messages_relayed_total: AtomicU64::new(0),
            rate_limited_total: AtomicU64::new(0),
            migrations_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(gauge: &AtomicU64) {
        // Saturating: a gauge never wraps below zero
        let _ = gauge.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(1))
        });
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let uptime = self.start_time.elapsed().as_secs();
        format!(
            "# HELP acds_active_connections Current number of client connections\n\
             # TYPE acds_active_connections gauge\n\
             acds_active_connections {}\n\
             # HELP acds_active_sessions Current number of sessions\n\
             # TYPE acds_active_sessions gauge\n\
             acds_active_sessions {}\n\
             # HELP acds_sessions_created_total Total sessions created\n\
             # TYPE acds_sessions_created_total counter\n\
             acds_sessions_created_total {}\n\
             # HELP acds_joins_total Total successful joins\n\
             # TYPE acds_joins_total counter\n\
             acds_joins_total {}\n\
             # HELP acds_join_rejections_total Total rejected joins\n\
             # TYPE acds_join_rejections_total counter\n\
             acds_join_rejections_total {}\n\
             # HELP acds_messages_relayed_total Total messages relayed to session members\n\
             # TYPE acds_messages_relayed_total counter\n\
             acds_messages_relayed_total {}\n\
             # HELP acds_rate_limited_total Total requests refused by rate limiting\n\
             # TYPE acds_rate_limited_total counter\n\
             acds_rate_limited_total {}\n\
             # HELP acds_migrations_total Total host migrations started\n\
             # TYPE acds_migrations_total counter\n\
             acds_migrations_total {}\n\
             # HELP acds_uptime_seconds Server uptime in seconds\n\
             # TYPE acds_uptime_seconds gauge\n\
             acds_uptime_seconds {}\n",
            self.active_connections.load(Ordering::Relaxed),
            self.active_sessions.load(Ordering::Relaxed),
            self.sessions_created_total.load(Ordering::Relaxed),
            self.joins_total.load(Ordering::Relaxed),
            self.join_rejections_total.load(Ordering::Relaxed),
            self.messages_relayed_total.load(Ordering::Relaxed),
            self.rate_limited_total.load(Ordering::Relaxed),
            self.migrations_total.load(Ordering::Relaxed),
            uptime,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render_format() {
        let m = Metrics::new();
        m.sessions_created_total.fetch_add(5, Ordering::Relaxed);
        m.messages_relayed_total.fetch_add(1024, Ordering::Relaxed);
        let output = m.render();
        assert!(output.contains("acds_sessions_created_total 5"));
        assert!(output.contains("acds_messages_relayed_total 1024"));
        assert!(output.contains("acds_active_connections 0"));
        assert!(output.contains("# TYPE acds_uptime_seconds gauge"));
    }

    #[test]
    fn test_gauge_does_not_wrap() {
        let m = Metrics::new();
        Metrics::inc(&m.active_connections);
        Metrics::dec(&m.active_connections);
        Metrics::dec(&m.active_connections);
        assert_eq!(m.active_connections.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_metrics_render_prometheus_format() {
        let m = Metrics::new();
        let output = m.render();
        for name in [
            "acds_active_connections",
            "acds_active_sessions",
            "acds_uptime_seconds",
        ] {
            assert!(output.contains(&format!("# HELP {}", name)));
            assert!(output.contains(&format!("# TYPE {} gauge", name)));
        }
        for name in [
            "acds_sessions_created_total",
            "acds_joins_total",
            "acds_join_rejections_total",
            "acds_messages_relayed_total",
            "acds_rate_limited_total",
            "acds_migrations_total",
        ] {
            assert!(output.contains(&format!("# HELP {}", name)));
            assert!(output.contains(&format!("# TYPE {} counter", name)));
        }
    }
}
