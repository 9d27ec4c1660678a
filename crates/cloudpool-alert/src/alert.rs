//! Alert records emitted by the engine.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertTopic {
    /// Launches, scheduled and executed terminations.
    PoolResize,
    ServiceState,
    /// Failed driver calls and aborted passes.
    PoolError,
    Configuration,
}

impl AlertTopic {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PoolResize => "POOL_RESIZE",
            Self::ServiceState => "SERVICE_STATE",
            Self::PoolError => "POOL_ERROR",
            Self::Configuration => "CONFIGURATION",
        }
    }
}

impl fmt::Display for AlertTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    Debug,
    Info,
    Notice,
    Warn,
    Error,
    Fatal,
}

impl AlertSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Notice => "NOTICE",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub topic: AlertTopic,
    pub severity: AlertSeverity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Alert {
    pub fn new(topic: AlertTopic, severity: AlertSeverity, message: impl Into<String>) -> Self {
        Self {
            topic,
            severity,
            message: message.into(),
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn info(topic: AlertTopic, message: impl Into<String>) -> Self {
        Self::new(topic, AlertSeverity::Info, message)
    }

    pub fn warn(topic: AlertTopic, message: impl Into<String>) -> Self {
        Self::new(topic, AlertSeverity::Warn, message)
    }

    pub fn error(topic: AlertTopic, message: impl Into<String>) -> Self {
        Self::new(topic, AlertSeverity::Error, message)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_wire_names() {
        let alert = Alert::warn(AlertTopic::PoolError, "snapshot failed")
            .with_metadata("pool", "web")
            .with_metadata("attempt", 3);
        let json = serde_json::to_string(&alert).unwrap();
        assert!(json.contains("\"topic\":\"POOL_ERROR\""));
        assert!(json.contains("\"severity\":\"WARN\""));
        assert!(json.contains("\"attempt\":\"3\""));
    }

    #[test]
    fn severity_order() {
        assert!(AlertSeverity::Debug < AlertSeverity::Info);
        assert!(AlertSeverity::Warn < AlertSeverity::Error);
        assert!(AlertSeverity::Error < AlertSeverity::Fatal);
        assert_eq!(AlertSeverity::Notice.to_string(), "NOTICE");
        assert_eq!(AlertTopic::ServiceState.to_string(), "SERVICE_STATE");
    }
}
