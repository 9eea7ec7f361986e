use crate::config::ProbeConfig;
use crate::state::ProbeResult;
use serde_json::{Map, Value};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time;
use tracing::{debug, warn};

const MAX_STDERR_CHARS: usize = 512;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to start {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("failed to read output of {command}: {source}")]
    Wait {
        command: String,
        source: std::io::Error,
    },
    #[error("{command} failed ({status}): {stderr}")]
    Exit {
        command: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("{command} timed out after {timeout}")]
    Timeout {
        command: String,
        timeout: humantime::Duration,
    },
    #[error("{command} produced invalid JSON: {source}")]
    Parse {
        command: String,
        source: serde_json::Error,
    },
    #[error("{command} produced JSON that is not an object")]
    NotAnObject { command: String },
}

/// Runs one probe and folds every failure into an error result so the topic
/// is still reported.
pub async fn run_probe(probe: &ProbeConfig, timeout: Duration) -> ProbeResult {
    match try_run_probe(probe, timeout).await {
        Ok(record) => {
            debug!(topic = %probe.topic, fields = record.len(), "probe ok");
            ProbeResult::Record(record)
        }
        Err(err) => {
            warn!(topic = %probe.topic, error = %err, "probe failed");
            ProbeResult::error(err.to_string())
        }
    }
}

pub async fn try_run_probe(
    probe: &ProbeConfig,
    timeout: Duration,
) -> Result<Map<String, Value>, ProbeError> {
    let command = probe.command.clone();
    let mut cmd = Command::new(&probe.command);
    cmd.args(&probe.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Own process group, so descendants of wrapper scripts die with the probe.
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|source| ProbeError::Spawn {
        command: command.clone(),
        source,
    })?;
    let mut group = ProcessGroup::of(&child);

    let outcome = time::timeout(timeout, collect_output(&mut child)).await;
    let (status, stdout, stderr) = match outcome {
        Ok(Ok(output)) => {
            group.disarm();
            output
        }
        Ok(Err(source)) => {
            group.kill();
            reap(&mut child).await;
            return Err(ProbeError::Wait { command, source });
        }
        Err(_elapsed) => {
            group.kill();
            reap(&mut child).await;
            return Err(ProbeError::Timeout {
                command,
                timeout: timeout.into(),
            });
        }
    };

    if !status.success() {
        return Err(ProbeError::Exit {
            command,
            status,
            stderr: summarize_stderr(&stderr),
        });
    }

    parse_record(&command, &stdout)
}

/// SIGKILLs the whole process group of a probe when dropped, which covers a
/// sampling round cancelled mid-wait.
struct ProcessGroup {
    pgid: Option<i32>,
}

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self {
            pgid: child.id().and_then(|id| i32::try_from(id).ok()),
        }
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_group(pgid);
        }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_group(pgid: i32) {
    // SAFETY: killpg only sends a signal; a group that is already gone
    // yields ESRCH, which is fine to ignore.
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: i32) {}

async fn reap(child: &mut Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}

async fn collect_output(child: &mut Child) -> std::io::Result<(ExitStatus, Vec<u8>, Vec<u8>)> {
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();

    let read_stdout = async {
        match stdout_pipe.as_mut() {
            Some(pipe) => pipe.read_to_end(&mut stdout).await.map(|_| ()),
            None => Ok(()),
        }
    };
    let read_stderr = async {
        match stderr_pipe.as_mut() {
            Some(pipe) => pipe.read_to_end(&mut stderr).await.map(|_| ()),
            None => Ok(()),
        }
    };

    let (status, stdout_res, stderr_res) = tokio::join!(child.wait(), read_stdout, read_stderr);
    stdout_res?;
    stderr_res?;
    Ok((status?, stdout, stderr))
}

fn parse_record(command: &str, stdout: &[u8]) -> Result<Map<String, Value>, ProbeError> {
    let value: Value = serde_json::from_slice(stdout).map_err(|source| ProbeError::Parse {
        command: command.to_string(),
        source,
    })?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(ProbeError::NotAnObject {
            command: command.to_string(),
        }),
    }
}

fn summarize_stderr(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.is_empty() {
        return "no stderr output".to_string();
    }
    text.chars().take(MAX_STDERR_CHARS).collect()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::time::{Instant, SystemTime, UNIX_EPOCH};

    fn shell(script: &str) -> ProbeConfig {
        ProbeConfig {
            topic: "test".to_string(),
            command: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    #[tokio::test]
    async fn parses_json_object() {
        let probe = shell(r#"echo '{"usage": 42, "cores": [1, 2]}'"#);
        let record = try_run_probe(&probe, Duration::from_secs(5))
            .await
            .expect("probe should succeed");
        assert_eq!(record["usage"], 42);
        assert_eq!(record["cores"], serde_json::json!([1, 2]));
    }

    #[tokio::test]
    async fn non_zero_exit_becomes_error_result() {
        let probe = shell("echo 'sensor missing' >&2; exit 3");
        let err = try_run_probe(&probe, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Exit { .. }));
        assert!(err.to_string().contains("sensor missing"));

        match run_probe(&probe, Duration::from_secs(5)).await {
            ProbeResult::Error { error } => assert!(error.contains("sensor missing")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_executable_is_spawn_error() {
        let probe = ProbeConfig {
            topic: "gpu".to_string(),
            command: "/nonexistent/gpu_status.sh".to_string(),
            args: vec!["-o".to_string(), "json".to_string()],
        };
        let err = try_run_probe(&probe, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Spawn { .. }));
    }

    #[tokio::test]
    async fn invalid_output_is_parse_error() {
        let err = try_run_probe(&shell("echo 'CPU: 42%'"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Parse { .. }));

        let err = try_run_probe(&shell("echo '[1, 2, 3]'"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::NotAnObject { .. }));
    }

    fn marker_path(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!(
            "telemetryd-{name}-{}-{nanos}",
            std::process::id()
        ))
    }

    /// A wrapper that does not exec its worker: the worker is a grandchild.
    fn wrapper_touching(marker: &Path) -> ProbeConfig {
        shell(&format!(
            "( sleep 1.5; touch '{}'; echo '{{}}' ); true",
            marker.display()
        ))
    }

    #[tokio::test]
    async fn timeout_kills_wrapper_descendants() {
        let marker = marker_path("timeout");
        let start = Instant::now();
        let err = try_run_probe(&wrapper_touching(&marker), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(err.to_string().contains("timed out after 200ms"));

        time::sleep(Duration::from_millis(2500)).await;
        assert!(!marker.exists(), "descendant survived the timeout");
    }

    #[tokio::test]
    async fn cancelled_run_kills_wrapper_descendants() {
        let marker = marker_path("cancel");
        let probe = wrapper_touching(&marker);
        let outer = time::timeout(
            Duration::from_millis(200),
            try_run_probe(&probe, Duration::from_secs(30)),
        )
        .await;
        assert!(outer.is_err());

        time::sleep(Duration::from_millis(2500)).await;
        assert!(!marker.exists(), "descendant survived cancellation");
    }
}
