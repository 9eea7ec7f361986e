use crate::broadcast::broadcast;
use crate::collectors::sample_snapshot;
use crate::config::Config;
use crate::hub::Registry;
use crate::metrics::Metrics;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, info};

/// Sample, broadcast, sleep, repeat until `shutdown` flips.
///
/// Shutdown interrupts the probe wait (dropping the round, which kills the
/// probe processes) and the inter-cycle sleep, but never a broadcast that has
/// already started. Probe failures are data and do not change the cadence.
pub async fn run_sampling_loop(
    cfg: Config,
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = cfg.interval();
    let probe_timeout = cfg.probe_timeout();
    info!(
        interval = %humantime::format_duration(interval),
        probe_timeout = %humantime::format_duration(probe_timeout),
        probes = cfg.probes.len(),
        "sampling loop started"
    );

    loop {
        if *shutdown.borrow() {
            break;
        }

        let started = Instant::now();
        let sampled = tokio::select! {
            _ = shutdown.changed() => None,
            sampled = sample_snapshot(&cfg.probes, probe_timeout) => Some(sampled),
        };
        let Some((snapshot, errors)) = sampled else {
            info!("shutdown received while sampling, round abandoned");
            break;
        };
        metrics.record_sample(started.elapsed());
        for topic in snapshot.failed_topics() {
            metrics.inc_probe_error(topic);
        }

        let report = broadcast(&snapshot, &registry).await;
        metrics.record_broadcast(&report);
        debug!(
            topics = snapshot.len(),
            probe_errors = errors,
            connections = report.connections,
            sent = report.sent,
            "cycle complete"
        );

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = time::sleep(interval) => {}
        }
    }

    info!("sampling loop stopped");
}
