use crate::state::ALL_TOPICS_ALIASES;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_client_buffer")]
    pub client_buffer: usize,
    #[serde(default = "default_probes")]
    pub probes: Vec<ProbeConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProbeConfig {
    pub topic: String,
    pub command: String,
    #[serde(default = "default_probe_args")]
    pub args: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            interval_secs: default_interval_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
            client_buffer: default_client_buffer(),
            probes: default_probes(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg = Self::from_yaml(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        // An empty document deserializes to unit, not to an empty mapping.
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation("listen is required".to_string()));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "listen must be a valid host:port socket address".to_string(),
            ));
        }
        if self.interval_secs < 1 {
            return Err(ConfigError::Validation(
                "interval_secs must be >= 1".to_string(),
            ));
        }
        if self.probe_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "probe_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.client_buffer == 0 {
            return Err(ConfigError::Validation(
                "client_buffer must be > 0".to_string(),
            ));
        }

        validate_probes(&self.probes)?;

        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_probes(probes: &[ProbeConfig]) -> Result<(), ConfigError> {
    if probes.is_empty() {
        return Err(ConfigError::Validation(
            "at least one probe must be configured".to_string(),
        ));
    }

    let mut topics = HashSet::new();
    for probe in probes {
        let topic = probe.topic.trim();
        if topic.is_empty() {
            return Err(ConfigError::Validation(
                "probes[*].topic must not be empty".to_string(),
            ));
        }
        if ALL_TOPICS_ALIASES
            .iter()
            .any(|alias| alias.eq_ignore_ascii_case(topic))
        {
            return Err(ConfigError::Validation(format!(
                "probe topic '{}' is reserved for the all-topics subscription",
                probe.topic
            )));
        }
        if !topics.insert(topic.to_string()) {
            return Err(ConfigError::Validation(format!(
                "probe topic '{}' must be unique",
                probe.topic
            )));
        }
        if probe.command.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "probe '{}' command must not be empty",
                probe.topic
            )));
        }
    }
    Ok(())
}

fn default_listen() -> String {
    "127.0.0.1:8000".to_string()
}

const fn default_interval_secs() -> u64 {
    2
}

const fn default_probe_timeout_ms() -> u64 {
    5000
}

const fn default_client_buffer() -> usize {
    16
}

fn default_probe_args() -> Vec<String> {
    vec!["-o".to_string(), "json".to_string()]
}

fn default_probes() -> Vec<ProbeConfig> {
    ["cpu", "disk", "gpu", "fan"]
        .into_iter()
        .map(|topic| ProbeConfig {
            topic: topic.to_string(),
            command: format!("scripts/{topic}_status.sh"),
            args: default_probe_args(),
        })
        .collect()
}
