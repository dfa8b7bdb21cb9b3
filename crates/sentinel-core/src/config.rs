//! Engine construction-time configuration (§6).
//!
//! Mirrors the teacher workspace's config style: a `serde`-deserializable
//! tree with `#[serde(default = "...")]` leaves, validated once after
//! deserialization rather than scattered through the types.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SentinelError};

/// Which protocol a check profile speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckType {
    Http,
    Https,
    Tcp,
}

impl Default for CheckType {
    fn default() -> Self {
        CheckType::Http
    }
}

fn default_true() -> bool {
    true
}

fn default_active_timeout() -> u64 {
    1
}

fn default_concurrency() -> usize {
    10
}

fn default_http_path() -> String {
    "/".to_string()
}

fn default_active_healthy_statuses() -> Vec<u16> {
    vec![200, 302]
}

fn default_active_healthy_successes() -> u8 {
    2
}

fn default_active_unhealthy_statuses() -> Vec<u16> {
    let mut v = vec![429, 404];
    v.extend(500..=505);
    v
}

fn default_active_unhealthy_tcp_failures() -> u8 {
    2
}

fn default_active_unhealthy_timeouts() -> u8 {
    3
}

fn default_unhealthy_http_failures() -> u8 {
    5
}

/// `2xx, 3xx except 3xx < 300` reduces to the contiguous range 200..400;
/// there is no 3xx status below 300, so this is exactly "2xx or 3xx".
fn default_passive_healthy_statuses() -> Vec<u16> {
    (200..400).collect()
}

fn default_passive_healthy_successes() -> u8 {
    5
}

fn default_passive_unhealthy_statuses() -> Vec<u16> {
    vec![429, 500, 503]
}

fn default_passive_unhealthy_timeouts() -> u8 {
    7
}

/// A set of acceptable/unacceptable HTTP statuses. Deserialized from a
/// JSON/TOML array but converted to a `HashSet` once, at construction,
/// per §6 ("all list-valued statuses are converted to a set for O(1)
/// lookup") — `as_set` is called on every `report_http_status`, so it
/// must return the already-built set rather than rebuilding it each time.
#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct StatusSet(HashSet<u16>);

impl StatusSet {
    pub fn as_set(&self) -> &HashSet<u16> {
        &self.0
    }
}

impl From<Vec<u16>> for StatusSet {
    fn from(statuses: Vec<u16>) -> Self {
        StatusSet(statuses.into_iter().collect())
    }
}

impl<'de> Deserialize<'de> for StatusSet {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(StatusSet(Vec::<u16>::deserialize(deserializer)?.into_iter().collect()))
    }
}

/// Per-field `#[serde(default = "...")]` (rather than a bare `#[serde(default)]`
/// that would silently fall back to zero) so that overriding one sibling
/// field in a partial TOML table — e.g. `[checks.active.healthy]
/// http_statuses = [200]` without repeating `successes` — still picks up
/// the profile's real default instead of resetting it to 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthyThresholds {
    #[serde(default = "default_active_healthy_statuses")]
    pub http_statuses: StatusSet,
    #[serde(default = "default_active_healthy_successes")]
    pub successes: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassiveHealthyThresholds {
    #[serde(default = "default_passive_healthy_statuses")]
    pub http_statuses: StatusSet,
    #[serde(default = "default_passive_healthy_successes")]
    pub successes: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnhealthyThresholds {
    #[serde(default = "default_active_unhealthy_statuses")]
    pub http_statuses: StatusSet,
    #[serde(default = "default_active_unhealthy_tcp_failures")]
    pub tcp_failures: u8,
    #[serde(default = "default_active_unhealthy_timeouts")]
    pub timeouts: u8,
    #[serde(default = "default_unhealthy_http_failures")]
    pub http_failures: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassiveUnhealthyThresholds {
    #[serde(default = "default_passive_unhealthy_statuses")]
    pub http_statuses: StatusSet,
    #[serde(default = "default_active_unhealthy_tcp_failures")]
    pub tcp_failures: u8,
    #[serde(default = "default_passive_unhealthy_timeouts")]
    pub timeouts: u8,
    #[serde(default = "default_unhealthy_http_failures")]
    pub http_failures: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalPair {
    /// Seconds; 0 disables the tick.
    #[serde(default)]
    pub healthy_interval: u64,
    #[serde(default)]
    pub unhealthy_interval: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveConfig {
    #[serde(default)]
    pub r#type: CheckType,
    #[serde(default = "default_active_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_http_path")]
    pub http_path: String,
    #[serde(default)]
    pub https_sni: Option<String>,
    #[serde(default = "default_true")]
    pub https_verify_certificate: bool,
    #[serde(default)]
    pub req_headers: Vec<String>,
    #[serde(default)]
    pub healthy_interval_secs: u64,
    #[serde(default)]
    pub unhealthy_interval_secs: u64,
    #[serde(default = "default_active_healthy")]
    pub healthy: HealthyThresholds,
    #[serde(default = "default_active_unhealthy")]
    pub unhealthy: UnhealthyThresholds,
}

fn default_active_healthy() -> HealthyThresholds {
    HealthyThresholds {
        http_statuses: default_active_healthy_statuses().into(),
        successes: default_active_healthy_successes(),
    }
}

fn default_active_unhealthy() -> UnhealthyThresholds {
    UnhealthyThresholds {
        http_statuses: default_active_unhealthy_statuses().into(),
        tcp_failures: default_active_unhealthy_tcp_failures(),
        timeouts: default_active_unhealthy_timeouts(),
        http_failures: default_unhealthy_http_failures(),
    }
}

impl Default for ActiveConfig {
    fn default() -> Self {
        Self {
            r#type: CheckType::Http,
            timeout_secs: default_active_timeout(),
            concurrency: default_concurrency(),
            http_path: default_http_path(),
            https_sni: None,
            https_verify_certificate: true,
            req_headers: Vec::new(),
            healthy_interval_secs: 0,
            unhealthy_interval_secs: 0,
            healthy: default_active_healthy(),
            unhealthy: default_active_unhealthy(),
        }
    }
}

impl ActiveConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn healthy_interval(&self) -> Duration {
        Duration::from_secs(self.healthy_interval_secs)
    }

    pub fn unhealthy_interval(&self) -> Duration {
        Duration::from_secs(self.unhealthy_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassiveConfig {
    #[serde(default)]
    pub r#type: CheckType,
    #[serde(default = "default_passive_healthy")]
    pub healthy: PassiveHealthyThresholds,
    #[serde(default = "default_passive_unhealthy")]
    pub unhealthy: PassiveUnhealthyThresholds,
}

fn default_passive_healthy() -> PassiveHealthyThresholds {
    PassiveHealthyThresholds {
        http_statuses: default_passive_healthy_statuses().into(),
        successes: default_passive_healthy_successes(),
    }
}

fn default_passive_unhealthy() -> PassiveUnhealthyThresholds {
    PassiveUnhealthyThresholds {
        http_statuses: default_passive_unhealthy_statuses().into(),
        tcp_failures: default_active_unhealthy_tcp_failures(),
        timeouts: default_passive_unhealthy_timeouts(),
        http_failures: default_unhealthy_http_failures(),
    }
}

impl Default for PassiveConfig {
    fn default() -> Self {
        Self {
            r#type: CheckType::Http,
            healthy: default_passive_healthy(),
            unhealthy: default_passive_unhealthy(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChecksConfig {
    #[serde(default)]
    pub active: ActiveConfig,
    #[serde(default)]
    pub passive: PassiveConfig,
}

/// Top-level engine configuration. `name` must be unique within the
/// process sharing a `shm_name`; together they form the keyspace prefix
/// (§4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub name: String,
    pub shm_name: String,
    #[serde(default)]
    pub ssl_cert: Option<String>,
    #[serde(default)]
    pub ssl_key: Option<String>,
    #[serde(default)]
    pub checks: ChecksConfig,
}

impl Config {
    pub fn new(name: impl Into<String>, shm_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shm_name: shm_name.into(),
            ssl_cert: None,
            ssl_key: None,
            checks: ChecksConfig::default(),
        }
    }

    /// Enforces §6's construction-time rules. Called once by
    /// `Engine::new`; a `Config` loaded from elsewhere should call this
    /// itself before handing the config to the engine.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(SentinelError::Config("name must not be empty".into()));
        }
        if self.shm_name.is_empty() {
            return Err(SentinelError::Config("shm_name must not be empty".into()));
        }
        match (&self.ssl_cert, &self.ssl_key) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(SentinelError::Config(
                    "ssl_cert and ssl_key must both be set or both be absent".into(),
                ))
            }
            _ => {}
        }

        for (label, t) in [
            ("active.healthy.successes", self.checks.active.healthy.successes),
            ("active.unhealthy.tcp_failures", self.checks.active.unhealthy.tcp_failures),
            ("active.unhealthy.timeouts", self.checks.active.unhealthy.timeouts),
            ("active.unhealthy.http_failures", self.checks.active.unhealthy.http_failures),
            ("passive.healthy.successes", self.checks.passive.healthy.successes),
            ("passive.unhealthy.tcp_failures", self.checks.passive.unhealthy.tcp_failures),
            ("passive.unhealthy.timeouts", self.checks.passive.unhealthy.timeouts),
            ("passive.unhealthy.http_failures", self.checks.passive.unhealthy.http_failures),
        ] {
            if t >= 255 {
                return Err(SentinelError::Config(format!("{label} threshold must be < 255, got {t}")));
            }
        }

        if self.checks.active.unhealthy.http_failures > 0 && self.checks.active.unhealthy.tcp_failures == 0 {
            return Err(SentinelError::Config(
                "active.unhealthy.http_failures > 0 requires active.unhealthy.tcp_failures > 0".into(),
            ));
        }
        if self.checks.passive.unhealthy.http_failures > 0 && self.checks.passive.unhealthy.tcp_failures == 0 {
            return Err(SentinelError::Config(
                "passive.unhealthy.http_failures > 0 requires passive.unhealthy.tcp_failures > 0".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cfg = Config::new("n", "shm");
        assert_eq!(cfg.checks.active.healthy.successes, 2);
        assert_eq!(cfg.checks.active.unhealthy.tcp_failures, 2);
        assert_eq!(cfg.checks.active.unhealthy.timeouts, 3);
        assert_eq!(cfg.checks.passive.healthy.successes, 5);
        assert_eq!(cfg.checks.passive.unhealthy.timeouts, 7);
        assert_eq!(cfg.checks.passive.unhealthy.http_statuses.as_set(), &HashSet::from([429, 500, 503]));
        assert!(cfg.checks.passive.healthy.http_statuses.as_set().contains(&200));
        assert!(cfg.checks.passive.healthy.http_statuses.as_set().contains(&399));
        assert!(!cfg.checks.passive.healthy.http_statuses.as_set().contains(&400));
    }

    #[test]
    fn rejects_threshold_at_255() {
        let mut cfg = Config::new("n", "shm");
        cfg.checks.active.healthy.successes = 255;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_http_failures_without_tcp_failures() {
        let mut cfg = Config::new("n", "shm");
        cfg.checks.active.unhealthy.http_failures = 5;
        cfg.checks.active.unhealthy.tcp_failures = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_mismatched_tls_material() {
        let mut cfg = Config::new("n", "shm");
        cfg.ssl_cert = Some("cert".into());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_empty_name() {
        let cfg = Config::new("", "shm");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_override_of_one_sibling_field_keeps_the_others_defaulted() {
        let toml = r#"
            name = "n"
            shm_name = "shm"

            [checks.active.healthy]
            http_statuses = [200]
        "#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.checks.active.healthy.http_statuses.as_set(), &HashSet::from([200]));
        assert_eq!(cfg.checks.active.healthy.successes, 2);
    }
}
