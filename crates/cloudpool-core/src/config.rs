//! Pool configuration file parser.
//!
//! A pool is described by a single TOML document:
//!
//! ```toml
//! name = "webservers"
//!
//! [driver]
//! kind = "memory"
//! pool_identifier = "local-sim"
//!
//! [scale_out]
//! size = "m1.small"
//! image = "ubuntu-24.04"
//! security_groups = ["web"]
//! boot_script = ["#!/bin/bash", "apt-get update -qy"]
//!
//! [scale_in]
//! victim_selection_policy = "CLOSEST_TO_INSTANCE_HOUR"
//! instance_hour_margin = 300
//!
//! [pool_update]
//! update_interval = "60s"
//! driver_timeout = "30s"
//!
//! [alerts]
//! subject = "webservers alert"
//! severity_filter = "ERROR|FATAL"
//! ```
//!
//! Parsing only checks shape; call [`CloudPoolConfig::validate`] before use.

use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::types::INSTANCE_HOUR_SECS;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudPoolConfig {
    pub name: String,
    pub driver: DriverConfig,
    pub scale_out: ScaleOutConfig,
    pub scale_in: ScaleInConfig,
    #[serde(default)]
    pub pool_update: PoolUpdateConfig,
    pub alerts: Option<AlertSettings>,
}

/// Which cloud backend manages the pool, plus its settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriverConfig {
    /// Simulated in-process cloud.
    Memory {
        pool_identifier: String,
        /// Running machines present when the driver starts.
        #[serde(default)]
        initial_machines: u32,
    },
}

/// Launch template handed to the driver on scale-out. Opaque to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleOutConfig {
    /// Instance size/flavor, e.g. `m1.small`.
    pub size: String,
    /// Machine image to boot.
    pub image: String,
    pub key_pair: Option<String>,
    #[serde(default)]
    pub security_groups: Vec<String>,
    /// Boot script, one line per entry.
    #[serde(default)]
    pub boot_script: Vec<String>,
}

/// Victim selection policy for scale-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VictimSelectionPolicy {
    OldestInstance,
    NewestInstance,
    ClosestToInstanceHour,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleInConfig {
    pub victim_selection_policy: VictimSelectionPolicy,
    /// Seconds before the next instance-hour boundary at which a victim is
    /// terminated. Zero terminates as soon as scale-in is ordered.
    pub instance_hour_margin: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolUpdateConfig {
    /// Period between reconciliation passes (e.g. "60s").
    #[serde(default = "default_update_interval")]
    pub update_interval: String,
    /// Upper bound for a single driver call (e.g. "30s").
    #[serde(default = "default_driver_timeout")]
    pub driver_timeout: String,
}

fn default_update_interval() -> String {
    "60s".to_string()
}

fn default_driver_timeout() -> String {
    "30s".to_string()
}

impl Default for PoolUpdateConfig {
    fn default() -> Self {
        Self {
            update_interval: default_update_interval(),
            driver_timeout: default_driver_timeout(),
        }
    }
}

impl PoolUpdateConfig {
    pub fn update_interval(&self) -> CoreResult<Duration> {
        positive_duration("pool_update.update_interval", &self.update_interval)
    }

    pub fn driver_timeout(&self) -> CoreResult<Duration> {
        positive_duration("pool_update.driver_timeout", &self.driver_timeout)
    }
}

/// Alert routing. Delivery transport is up to the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertSettings {
    /// Subject line prefixed to delivered alerts.
    pub subject: String,
    /// Regex over severity names; only matching alerts are delivered.
    #[serde(default = "default_severity_filter")]
    pub severity_filter: String,
}

fn default_severity_filter() -> String {
    ".*".to_string()
}

impl AlertSettings {
    /// Compile the severity filter, anchored to match whole severity names.
    pub fn severity_regex(&self) -> CoreResult<Regex> {
        Regex::new(&format!("^(?:{})$", self.severity_filter)).map_err(|e| {
            CoreError::config(format!(
                "alerts.severity_filter is not a valid regex: {e}"
            ))
        })
    }
}

impl CloudPoolConfig {
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoreError::config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> CoreResult<Self> {
        toml::from_str(content).map_err(|e| CoreError::config(e.to_string()))
    }

    pub fn to_toml_string(&self) -> CoreResult<String> {
        toml::to_string_pretty(self).map_err(|e| CoreError::Serialize(e.to_string()))
    }

    /// Validate every section. Nothing is defaulted here.
    pub fn validate(&self) -> CoreResult<()> {
        if self.name.trim().is_empty() {
            return Err(CoreError::config("name cannot be empty"));
        }

        match &self.driver {
            DriverConfig::Memory {
                pool_identifier, ..
            } => {
                if pool_identifier.trim().is_empty() {
                    return Err(CoreError::config("driver.pool_identifier cannot be empty"));
                }
            }
        }

        if self.scale_out.size.trim().is_empty() {
            return Err(CoreError::config("scale_out.size cannot be empty"));
        }
        if self.scale_out.image.trim().is_empty() {
            return Err(CoreError::config("scale_out.image cannot be empty"));
        }

        let margin = self.scale_in.instance_hour_margin;
        if !(0..INSTANCE_HOUR_SECS).contains(&margin) {
            return Err(CoreError::config(format!(
                "scale_in.instance_hour_margin must be in [0, {INSTANCE_HOUR_SECS}), got {margin}"
            )));
        }

        self.pool_update.update_interval()?;
        self.pool_update.driver_timeout()?;

        if let Some(alerts) = &self.alerts {
            alerts.severity_regex()?;
        }

        Ok(())
    }
}

/// Parse a duration string like "500ms", "30s", "5m", "1h".
///
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> CoreResult<Duration> {
    let s = s.trim();
    let invalid = || CoreError::config(format!("invalid duration: {s:?}"));

    let (digits, unit_secs, millis) = if let Some(ms) = s.strip_suffix("ms") {
        (ms, 0, true)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1, false)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60, false)
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, 3600, false)
    } else {
        (s, 1, false)
    };

    let value: u64 = digits.trim().parse().map_err(|_| invalid())?;
    if millis {
        Ok(Duration::from_millis(value))
    } else {
        value
            .checked_mul(unit_secs)
            .map(Duration::from_secs)
            .ok_or_else(invalid)
    }
}

fn positive_duration(field: &str, s: &str) -> CoreResult<Duration> {
    let d = parse_duration(s).map_err(|e| CoreError::config(format!("{field}: {e}")))?;
    if d.is_zero() {
        return Err(CoreError::config(format!("{field} must be positive")));
    }
    Ok(d)
}
