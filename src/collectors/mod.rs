pub mod probe;

use crate::config::ProbeConfig;
use crate::state::Snapshot;
use futures::future::join_all;
use probe::run_probe;
use std::time::Duration;

/// Runs every probe concurrently and returns the combined snapshot together
/// with the number of topics that failed. Every configured topic is present.
pub async fn sample_snapshot(probes: &[ProbeConfig], timeout: Duration) -> (Snapshot, u64) {
    let results = join_all(probes.iter().map(|probe| async move {
        (probe.topic.clone(), run_probe(probe, timeout).await)
    }))
    .await;

    let snapshot = Snapshot::new(results.into_iter().collect());
    let errors = snapshot.error_count() as u64;
    (snapshot, errors)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::state::ProbeResult;
    use std::time::Instant;

    fn probe(topic: &str, script: &str) -> ProbeConfig {
        ProbeConfig {
            topic: topic.to_string(),
            command: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    #[tokio::test]
    async fn failed_topic_is_reported_alongside_healthy_ones() {
        let probes = vec![
            probe("cpu", r#"echo '{"usage": 10}'"#),
            probe("disk", r#"echo '{"free": 100}'"#),
            probe("gpu", "echo 'no gpu' >&2; exit 1"),
            probe("fan", r#"echo '{"rpm": 800}'"#),
        ];

        let (snapshot, errors) = sample_snapshot(&probes, Duration::from_secs(5)).await;

        assert_eq!(errors, 1);
        assert_eq!(snapshot.len(), 4);
        assert!(matches!(snapshot.get("cpu"), Some(ProbeResult::Record(_))));
        assert!(matches!(snapshot.get("disk"), Some(ProbeResult::Record(_))));
        assert!(matches!(snapshot.get("fan"), Some(ProbeResult::Record(_))));
        assert!(matches!(snapshot.get("gpu"), Some(ProbeResult::Error { .. })));
    }

    #[tokio::test]
    async fn probes_run_concurrently() {
        let probes: Vec<_> = ["cpu", "disk", "gpu", "fan"]
            .into_iter()
            .map(|topic| probe(topic, r#"sleep 1; echo '{}'"#))
            .collect();

        let start = Instant::now();
        let (snapshot, errors) = sample_snapshot(&probes, Duration::from_secs(10)).await;

        assert_eq!(errors, 0);
        assert_eq!(snapshot.len(), 4);
        assert!(start.elapsed() < Duration::from_millis(3500));
    }

    #[tokio::test]
    async fn timed_out_topic_does_not_delay_others_beyond_timeout() {
        let probes = vec![
            probe("cpu", r#"echo '{"usage": 1}'"#),
            probe("fan", r#"sleep 30; echo '{}'"#),
        ];

        let start = Instant::now();
        let (snapshot, errors) = sample_snapshot(&probes, Duration::from_millis(300)).await;

        assert_eq!(errors, 1);
        assert!(matches!(snapshot.get("cpu"), Some(ProbeResult::Record(_))));
        assert!(matches!(snapshot.get("fan"), Some(ProbeResult::Error { .. })));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
