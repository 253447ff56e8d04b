//! config-rs/lib.rs
//! Controller settings loaded from the process environment (and an optional `.env` file).
//!
//! Every value has a default. Values that are present but unparsable fall back to the
//! default with a warning instead of aborting startup, the same way port lookups behave.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Upper bound on status staleness while a job is running.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Default cooldown before the same workflow may run again against the same target.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

/// Settings consumed by the controller binary and library.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSettings {
    /// Minimum time between a completed execution and a re-run of the same workflow on the same target
    pub cooldown_period: Duration,
    /// First status poll delay after dispatch
    pub poll_interval_initial: Duration,
    /// Poll delay cap while Running
    pub poll_interval_max: Duration,
    /// How often the controller lists requests in scope
    pub resync_interval: Duration,
    pub error_backoff_base: Duration,
    pub error_backoff_max: Duration,
    /// Restrict the controller to one namespace; `None` watches all of them
    pub watch_namespace: Option<String>,
    pub audit_ledger_path: PathBuf,
    /// Webhook receiving Skipped/Failed notifications; log-only when unset
    pub notification_webhook_url: Option<String>,
    pub notification_timeout: Duration,
    pub log_level: String,
    pub log_json: bool,
    /// JSON manifest with the requests the daemon starts with
    pub requests_path: Option<PathBuf>,
    /// How long simulated jobs take before they report success
    pub simulated_job_duration: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            cooldown_period: DEFAULT_COOLDOWN,
            poll_interval_initial: Duration::from_millis(1000),
            poll_interval_max: MAX_POLL_INTERVAL,
            resync_interval: Duration::from_millis(1000),
            error_backoff_base: Duration::from_millis(500),
            error_backoff_max: Duration::from_secs(30),
            watch_namespace: None,
            audit_ledger_path: PathBuf::from("data/audit/ledger.bin"),
            notification_webhook_url: None,
            notification_timeout: Duration::from_millis(5000),
            log_level: "info".to_string(),
            log_json: false,
            requests_path: None,
            simulated_job_duration: Duration::from_secs(5),
        }
    }
}

impl ControllerSettings {
    /// Load settings from the environment, reading `.env` first if one exists.
    pub fn from_env() -> Self {
        if let Err(e) = dotenv::dotenv() {
            log::debug!("No .env file loaded: {}", e);
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from an explicit key/value map. Keys match the environment variable names.
    pub fn from_map(values: &HashMap<String, String>) -> Self {
        Self::from_lookup(|key| values.get(key).cloned())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let poll_interval_max = millis(&lookup, "REMEDIATION_POLL_MAX_MS", defaults.poll_interval_max);
        let poll_interval_max = if poll_interval_max > MAX_POLL_INTERVAL {
            log::warn!(
                "REMEDIATION_POLL_MAX_MS exceeds {:?}, clamping to the staleness bound",
                MAX_POLL_INTERVAL
            );
            MAX_POLL_INTERVAL
        } else {
            poll_interval_max
        };

        Self {
            cooldown_period: seconds(&lookup, "REMEDIATION_COOLDOWN_SECS", defaults.cooldown_period),
            poll_interval_initial: millis(&lookup, "REMEDIATION_POLL_INITIAL_MS", defaults.poll_interval_initial),
            poll_interval_max,
            resync_interval: millis(&lookup, "REMEDIATION_RESYNC_MS", defaults.resync_interval),
            error_backoff_base: millis(&lookup, "REMEDIATION_ERROR_BACKOFF_BASE_MS", defaults.error_backoff_base),
            error_backoff_max: millis(&lookup, "REMEDIATION_ERROR_BACKOFF_MAX_MS", defaults.error_backoff_max),
            watch_namespace: non_empty(&lookup, "REMEDIATION_WATCH_NAMESPACE"),
            audit_ledger_path: non_empty(&lookup, "AUDIT_LEDGER_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.audit_ledger_path),
            notification_webhook_url: non_empty(&lookup, "NOTIFICATION_WEBHOOK_URL"),
            notification_timeout: millis(&lookup, "NOTIFICATION_TIMEOUT_MS", defaults.notification_timeout),
            log_level: non_empty(&lookup, "REMEDIATION_LOG_LEVEL").unwrap_or(defaults.log_level),
            log_json: flag(&lookup, "REMEDIATION_LOG_JSON", defaults.log_json),
            requests_path: non_empty(&lookup, "REMEDIATION_REQUESTS_PATH").map(PathBuf::from),
            simulated_job_duration: seconds(
                &lookup,
                "REMEDIATION_SIMULATED_JOB_SECS",
                defaults.simulated_job_duration,
            ),
        }
    }

    /// Reject combinations the controller cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_initial.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "REMEDIATION_POLL_INITIAL_MS",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.poll_interval_initial > self.poll_interval_max {
            return Err(ConfigError::InvalidValue {
                key: "REMEDIATION_POLL_INITIAL_MS",
                reason: format!("must not exceed the poll cap of {:?}", self.poll_interval_max),
            });
        }
        if self.resync_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "REMEDIATION_RESYNC_MS",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.error_backoff_max < self.error_backoff_base {
            return Err(ConfigError::InvalidValue {
                key: "REMEDIATION_ERROR_BACKOFF_MAX_MS",
                reason: "must not be smaller than the backoff base".to_string(),
            });
        }
        Ok(())
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn number<F>(lookup: &F, key: &str) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = non_empty(lookup, key)?;
    match raw.parse::<u64>() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("Invalid value '{}' in {}, using default", raw, key);
            None
        }
    }
}

fn millis<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    number(lookup, key).map(Duration::from_millis).unwrap_or(default)
}

fn seconds<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    number(lookup, key).map(Duration::from_secs).unwrap_or(default)
}

fn flag<F>(lookup: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    match non_empty(lookup, key) {
        Some(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}
