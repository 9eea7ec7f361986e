use crate::broadcast::BroadcastReport;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, Registry, TextEncoder};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    started_at_unix: i64,
    pub telemetry_connections_active: Gauge,
    pub telemetry_connections_total: Counter,
    pub telemetry_broadcasts_total: Counter,
    pub telemetry_messages_sent_total: Counter,
    pub telemetry_messages_failed_total: CounterVec,
    pub telemetry_probe_errors_total: CounterVec,
    pub telemetry_sample_duration_seconds: Gauge,
    pub telemetry_inbound_ignored_total: Counter,
    pub telemetry_last_broadcast_timestamp_seconds: Gauge,
    pub telemetry_uptime_seconds: Gauge,
    pub telemetry_scrape_count_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let telemetry_connections_active = Gauge::with_opts(opts!(
            "telemetry_connections_active",
            "Number of currently registered dashboard connections"
        ))?;
        let telemetry_connections_total = Counter::with_opts(opts!(
            "telemetry_connections_total",
            "Total number of accepted dashboard connections"
        ))?;
        let telemetry_broadcasts_total = Counter::with_opts(opts!(
            "telemetry_broadcasts_total",
            "Total number of completed broadcast cycles"
        ))?;
        let telemetry_messages_sent_total = Counter::with_opts(opts!(
            "telemetry_messages_sent_total",
            "Total number of payloads queued for delivery"
        ))?;
        let telemetry_messages_failed_total = CounterVec::new(
            opts!(
                "telemetry_messages_failed_total",
                "Payloads not delivered, by reason (dropped = client queue full, closed = connection gone, encode = serialization failed)"
            ),
            &["reason"],
        )?;
        let telemetry_probe_errors_total = CounterVec::new(
            opts!(
                "telemetry_probe_errors_total",
                "Probe invocations that produced an error marker, by topic"
            ),
            &["topic"],
        )?;
        let telemetry_sample_duration_seconds = Gauge::with_opts(opts!(
            "telemetry_sample_duration_seconds",
            "Wall time of the last sampling round"
        ))?;
        let telemetry_inbound_ignored_total = Counter::with_opts(opts!(
            "telemetry_inbound_ignored_total",
            "Inbound client messages ignored because they were malformed"
        ))?;
        let telemetry_last_broadcast_timestamp_seconds = Gauge::with_opts(opts!(
            "telemetry_last_broadcast_timestamp_seconds",
            "Unix timestamp of the last completed broadcast"
        ))?;
        let telemetry_uptime_seconds = Gauge::with_opts(opts!(
            "telemetry_uptime_seconds",
            "Process uptime in seconds"
        ))?;
        let telemetry_scrape_count_total = Counter::with_opts(opts!(
            "telemetry_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;

        register(&registry, &telemetry_connections_active)?;
        register(&registry, &telemetry_connections_total)?;
        register(&registry, &telemetry_broadcasts_total)?;
        register(&registry, &telemetry_messages_sent_total)?;
        register(&registry, &telemetry_messages_failed_total)?;
        register(&registry, &telemetry_probe_errors_total)?;
        register(&registry, &telemetry_sample_duration_seconds)?;
        register(&registry, &telemetry_inbound_ignored_total)?;
        register(&registry, &telemetry_last_broadcast_timestamp_seconds)?;
        register(&registry, &telemetry_uptime_seconds)?;
        register(&registry, &telemetry_scrape_count_total)?;

        Ok(Arc::new(Self {
            registry,
            started_at_unix: now_unix(),
            telemetry_connections_active,
            telemetry_connections_total,
            telemetry_broadcasts_total,
            telemetry_messages_sent_total,
            telemetry_messages_failed_total,
            telemetry_probe_errors_total,
            telemetry_sample_duration_seconds,
            telemetry_inbound_ignored_total,
            telemetry_last_broadcast_timestamp_seconds,
            telemetry_uptime_seconds,
            telemetry_scrape_count_total,
        }))
    }

    pub fn connection_opened(&self) {
        self.telemetry_connections_total.inc();
        self.telemetry_connections_active.inc();
    }

    pub fn connection_closed(&self) {
        self.telemetry_connections_active.dec();
    }

    pub fn record_sample(&self, elapsed: Duration) {
        self.telemetry_sample_duration_seconds
            .set(elapsed.as_secs_f64());
    }

    pub fn inc_probe_error(&self, topic: &str) {
        self.telemetry_probe_errors_total
            .with_label_values(&[topic])
            .inc();
    }

    pub fn record_broadcast(&self, report: &BroadcastReport) {
        self.telemetry_broadcasts_total.inc();
        self.telemetry_messages_sent_total
            .inc_by(report.sent as f64);
        for (reason, count) in [
            ("dropped", report.dropped),
            ("closed", report.closed),
            ("encode", report.unencodable),
        ] {
            self.telemetry_messages_failed_total
                .with_label_values(&[reason])
                .inc_by(count as f64);
        }
        self.telemetry_last_broadcast_timestamp_seconds
            .set(now_unix() as f64);
    }

    pub fn inc_inbound_ignored(&self) {
        self.telemetry_inbound_ignored_total.inc();
    }

    pub fn inc_scrape_count(&self) {
        self.telemetry_scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let uptime = now_unix().saturating_sub(self.started_at_unix) as f64;
        self.telemetry_uptime_seconds.set(uptime);

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
