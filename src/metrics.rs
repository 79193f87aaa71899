use crate::model::{ClusterEntry, CombinedSnapshot, PoolEntry};
use prometheus::core::Collector;
use prometheus::{
    histogram_opts, opts, Counter, CounterVec, Encoder, Gauge, Histogram, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const LOGIN_OUTCOME_SUCCESS: &str = "success";
pub const BACKEND_BROKER: &str = "broker";
pub const BACKEND_CLUSTER: &str = "cluster";

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    started_at_unix: i64,
    pub vmdash_logins_total: CounterVec,
    pub vmdash_backend_errors_total: CounterVec,
    pub vmdash_refresh_total: Counter,
    pub vmdash_refresh_duration_seconds: Histogram,
    pub vmdash_active_sessions: Gauge,
    pub vmdash_sessions_expired_total: Counter,
    pub vmdash_uptime_seconds: Gauge,
    pub vmdash_scrape_count_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let vmdash_logins_total = CounterVec::new(
            opts!("vmdash_logins_total", "Login attempts by outcome"),
            &["outcome"],
        )?;
        let vmdash_backend_errors_total = CounterVec::new(
            opts!(
                "vmdash_backend_errors_total",
                "Backend failures seen while building snapshots"
            ),
            &["backend"],
        )?;
        let vmdash_refresh_total = Counter::with_opts(opts!(
            "vmdash_refresh_total",
            "Dashboard snapshots built"
        ))?;
        let vmdash_refresh_duration_seconds = Histogram::with_opts(histogram_opts!(
            "vmdash_refresh_duration_seconds",
            "Time to build one snapshot across all backends",
            vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 15.0, 30.0]
        ))?;
        let vmdash_active_sessions = Gauge::with_opts(opts!(
            "vmdash_active_sessions",
            "Sessions currently held in memory"
        ))?;
        let vmdash_sessions_expired_total = Counter::with_opts(opts!(
            "vmdash_sessions_expired_total",
            "Sessions evicted after the idle timeout"
        ))?;
        let vmdash_uptime_seconds =
            Gauge::with_opts(opts!("vmdash_uptime_seconds", "Service uptime in seconds"))?;
        let vmdash_scrape_count_total = Counter::with_opts(opts!(
            "vmdash_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;

        register(&registry, &vmdash_logins_total)?;
        register(&registry, &vmdash_backend_errors_total)?;
        register(&registry, &vmdash_refresh_total)?;
        register(&registry, &vmdash_refresh_duration_seconds)?;
        register(&registry, &vmdash_active_sessions)?;
        register(&registry, &vmdash_sessions_expired_total)?;
        register(&registry, &vmdash_uptime_seconds)?;
        register(&registry, &vmdash_scrape_count_total)?;

        Ok(Arc::new(Self {
            registry,
            started_at_unix: now_unix(),
            vmdash_logins_total,
            vmdash_backend_errors_total,
            vmdash_refresh_total,
            vmdash_refresh_duration_seconds,
            vmdash_active_sessions,
            vmdash_sessions_expired_total,
            vmdash_uptime_seconds,
            vmdash_scrape_count_total,
        }))
    }

    pub fn inc_login(&self, outcome: &str) {
        self.vmdash_logins_total.with_label_values(&[outcome]).inc();
    }

    pub fn inc_backend_error(&self, backend: &str) {
        self.vmdash_backend_errors_total
            .with_label_values(&[backend])
            .inc();
    }

    /// Counts one refresh and the sentinels it carries.
    pub fn observe_refresh(&self, snapshot: &CombinedSnapshot, took: Duration) {
        self.vmdash_refresh_total.inc();
        self.vmdash_refresh_duration_seconds
            .observe(took.as_secs_f64());

        for (_, entries) in &snapshot.pools_by_broker {
            if entries.iter().any(|e| matches!(e, PoolEntry::Error { .. })) {
                self.inc_backend_error(BACKEND_BROKER);
            }
        }
        for (_, entry) in &snapshot.clusters_by_backend {
            if !matches!(entry, ClusterEntry::Snapshot(_)) {
                self.inc_backend_error(BACKEND_CLUSTER);
            }
        }
    }

    pub fn set_active_sessions(&self, count: usize) {
        self.vmdash_active_sessions.set(count as f64);
    }

    pub fn add_expired_sessions(&self, count: usize) {
        self.vmdash_sessions_expired_total.inc_by(count as f64);
    }

    pub fn update_uptime(&self) {
        let uptime = now_unix().saturating_sub(self.started_at_unix) as f64;
        self.vmdash_uptime_seconds.set(uptime);
    }

    pub fn inc_scrape_count(&self) {
        self.vmdash_scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
