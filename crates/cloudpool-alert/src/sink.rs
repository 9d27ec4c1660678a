//! Alert sinks.
//!
//! The engine only knows `AlertSink`. Delivery to real channels (mail,
//! webhooks) would be another implementation of the same trait.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use cloudpool_core::{AlertSettings, CoreResult};

use crate::alert::{Alert, AlertSeverity};

/// Receives alerts. Delivery is fire-and-forget: a sink never fails the
/// caller.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, alert: Alert);
}

/// Writes alerts to the `tracing` log at a level matching their severity.
#[derive(Debug, Clone, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn notify(&self, alert: Alert) {
        let topic = alert.topic.as_str();
        let metadata = format!("{:?}", alert.metadata);
        match alert.severity {
            AlertSeverity::Debug => debug!(topic, %metadata, "{}", alert.message),
            AlertSeverity::Info | AlertSeverity::Notice => {
                info!(topic, severity = %alert.severity, %metadata, "{}", alert.message)
            }
            AlertSeverity::Warn => warn!(topic, %metadata, "{}", alert.message),
            AlertSeverity::Error | AlertSeverity::Fatal => {
                error!(topic, severity = %alert.severity, %metadata, "{}", alert.message)
            }
        }
    }
}

/// Forwards only alerts whose severity matches a pattern, stamping each
/// forwarded alert with the configured subject.
pub struct FilteringAlertSink {
    inner: Arc<dyn AlertSink>,
    severity_filter: Regex,
    subject: String,
}

impl FilteringAlertSink {
    pub fn new(inner: Arc<dyn AlertSink>, severity_filter: Regex, subject: impl Into<String>) -> Self {
        Self {
            inner,
            severity_filter,
            subject: subject.into(),
        }
    }

    pub fn from_settings(inner: Arc<dyn AlertSink>, settings: &AlertSettings) -> CoreResult<Self> {
        Ok(Self::new(inner, settings.severity_regex()?, settings.subject.clone()))
    }

    pub fn accepts(&self, severity: AlertSeverity) -> bool {
        self.severity_filter.is_match(severity.as_str())
    }
}

#[async_trait]
impl AlertSink for FilteringAlertSink {
    async fn notify(&self, alert: Alert) {
        if !self.accepts(alert.severity) {
            return;
        }
        let alert = alert.with_metadata("subject", &self.subject);
        self.inner.notify(alert).await;
    }
}

/// Keeps every alert in memory so tests can inspect what was sent.
#[derive(Debug, Clone, Default)]
pub struct MemoryAlertSink {
    alerts: Arc<Mutex<Vec<Alert>>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().await.clone()
    }

    pub async fn clear(&self) {
        self.alerts.lock().await.clear();
    }
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    async fn notify(&self, alert: Alert) {
        self.alerts.lock().await.push(alert);
    }
}
