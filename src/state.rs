use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Name of a metric category, e.g. `cpu` or `disk`.
pub type Topic = String;

/// Subscription values that mean "every topic" rather than a single one.
pub const ALL_TOPICS_ALIASES: [&str; 2] = ["all", "dashboard"];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ProbeResult {
    Record(Map<String, Value>),
    Error { error: String },
}

impl ProbeResult {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// One complete sampling round. Built once, never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Snapshot {
    topics: BTreeMap<Topic, ProbeResult>,
}

impl Snapshot {
    pub fn new(topics: BTreeMap<Topic, ProbeResult>) -> Self {
        Self { topics }
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    #[cfg(test)]
    pub fn get(&self, topic: &str) -> Option<&ProbeResult> {
        self.topics.get(topic)
    }

    pub fn error_count(&self) -> usize {
        self.topics.values().filter(|r| r.is_error()).count()
    }

    pub fn failed_topics(&self) -> impl Iterator<Item = &str> {
        self.topics
            .iter()
            .filter(|(_, result)| result.is_error())
            .map(|(topic, _)| topic.as_str())
    }

    /// Subset of the snapshot a connection with `subscription` receives.
    /// An unknown topic yields an empty payload.
    pub fn payload_for(&self, subscription: &Subscription) -> BTreeMap<&str, &ProbeResult> {
        match subscription {
            Subscription::All => self
                .topics
                .iter()
                .map(|(topic, result)| (topic.as_str(), result))
                .collect(),
            Subscription::Topic(topic) => self
                .topics
                .get_key_value(topic.as_str())
                .map(|(topic, result)| (topic.as_str(), result))
                .into_iter()
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum Subscription {
    #[default]
    All,
    Topic(Topic),
}

impl Subscription {
    /// Maps the `tab` value sent by a client to a subscription.
    pub fn from_tab(tab: &str) -> Self {
        let tab = tab.trim();
        if ALL_TOPICS_ALIASES
            .iter()
            .any(|alias| alias.eq_ignore_ascii_case(tab))
        {
            Self::All
        } else {
            Self::Topic(tab.to_string())
        }
    }
}

impl std::fmt::Display for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Topic(topic) => f.write_str(topic),
        }
    }
}
