//! The reconcile loop: list requests in scope, reconcile the ones that are due, reschedule.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use config_rs::ControllerSettings;
use rand::Rng;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use crate::error::Result;
use crate::lifecycle::{LifecycleManager, ReconcileAction};
use crate::model::ObjectKey;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub resync_interval: Duration,
    pub error_backoff_base: Duration,
    pub error_backoff_max: Duration,
    /// Fraction of the backoff added or removed at random.
    pub jitter_factor: f64,
    pub watch_namespace: Option<String>,
}

impl From<&ControllerSettings> for ControllerConfig {
    fn from(settings: &ControllerSettings) -> Self {
        Self {
            resync_interval: settings.resync_interval,
            error_backoff_base: settings.error_backoff_base,
            error_backoff_max: settings.error_backoff_max,
            jitter_factor: 0.2,
            watch_namespace: settings.watch_namespace.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Schedule {
    /// Next reconcile time; `None` means wait until the request changes.
    due: Option<DateTime<Utc>>,
    /// `resource_version` seen when the entry was last written.
    version: u64,
    failures: u32,
}

/// Counters for one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub listed: usize,
    pub reconciled: usize,
    pub requeued: usize,
    pub errors: usize,
}

pub struct Controller {
    manager: Arc<LifecycleManager>,
    config: ControllerConfig,
    schedule: Mutex<HashMap<ObjectKey, Schedule>>,
}

impl Controller {
    pub fn new(manager: Arc<LifecycleManager>, config: ControllerConfig) -> Self {
        Self {
            manager,
            config,
            schedule: Mutex::new(HashMap::new()),
        }
    }

    /// One pass over every request in scope.
    ///
    /// A listing failure aborts the pass; nothing is reconciled on a partial view.
    pub async fn run_once(&self) -> Result<PassSummary> {
        let requests = self
            .manager
            .store()
            .list(self.config.watch_namespace.as_deref())
            .await?;
        let now = self.manager.clock().now();
        let mut summary = PassSummary {
            listed: requests.len(),
            ..PassSummary::default()
        };

        let mut schedule = self.schedule.lock().await;
        schedule.retain(|key, _| requests.iter().any(|r| &r.key() == key));

        for request in &requests {
            let key = request.key();
            let version = request.metadata.resource_version;
            let entry = schedule.entry(key.clone()).or_default();

            let due = match entry.due {
                Some(at) => at <= now,
                None => entry.version != version,
            };
            if !due {
                continue;
            }

            summary.reconciled += 1;
            match self.manager.reconcile(&key).await {
                Ok(ReconcileAction::Requeue(delay)) => {
                    summary.requeued += 1;
                    *entry = Schedule {
                        due: Some(now + to_chrono(delay)),
                        version,
                        failures: 0,
                    };
                }
                Ok(ReconcileAction::Done) => {
                    *entry = Schedule {
                        due: None,
                        version,
                        failures: 0,
                    };
                }
                Err(e) if e.is_retriable() => {
                    summary.errors += 1;
                    let failures = entry.failures.saturating_add(1);
                    let delay = self.error_backoff(failures);
                    warn!(request = %key, error = %e, failures, delay_ms = delay.as_millis() as u64, "reconcile failed; retrying");
                    *entry = Schedule {
                        due: Some(now + to_chrono(delay)),
                        version,
                        failures,
                    };
                }
                Err(e) => {
                    summary.errors += 1;
                    error!(request = %key, error = %e, "reconcile failed permanently; waiting for the request to change");
                    *entry = Schedule {
                        due: None,
                        version,
                        failures: entry.failures.saturating_add(1),
                    };
                }
            }
        }

        Ok(summary)
    }

    /// Run passes every `resync_interval` until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            namespace = self.config.watch_namespace.as_deref().unwrap_or("*"),
            resync_ms = self.config.resync_interval.as_millis() as u64,
            "controller started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.run_once().await {
                warn!(error = %e, "listing requests failed; skipping pass");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.resync_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("controller stopped");
    }

    /// Exponential backoff with jitter: `base * 2^(failures-1)`, capped.
    fn error_backoff(&self, failures: u32) -> Duration {
        let base_ms = self.config.error_backoff_base.as_millis() as f64;
        let max_ms = self.config.error_backoff_max.as_millis() as f64;
        let exponent = failures.saturating_sub(1).min(30) as i32;
        let capped = (base_ms * 2f64.powi(exponent)).min(max_ms);

        let jitter_range = capped * self.config.jitter_factor.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..jitter_range)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).clamp(0.0, max_ms) as u64)
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(1))
}
