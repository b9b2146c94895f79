// Reconcile Scheduler - runs the consistency check on a timer
//
// Daily runs execute at RECONCILE_HOUR UTC (02:00 by default, off-peak).
// Hourly is available for deployments that want faster drift detection.

use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, TimeZone, Utc};
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};

use super::{CheckFilter, ConsistencyReconciler, FixMode};
use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileFrequency {
    Off,
    Daily,
    Hourly,
}

impl FromStr for ReconcileFrequency {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" | "disabled" => Ok(ReconcileFrequency::Off),
            "daily" => Ok(ReconcileFrequency::Daily),
            "hourly" => Ok(ReconcileFrequency::Hourly),
            other => Err(AppError::Config(format!(
                "unknown reconcile schedule '{}', expected off, hourly or daily",
                other
            ))),
        }
    }
}

/// Reconcile schedule configuration
#[derive(Debug, Clone)]
pub struct ReconcileScheduleConfig {
    pub frequency: ReconcileFrequency,
    /// UTC hour for daily runs (0-23)
    pub execution_hour: u32,
    /// Apply auto-fixable corrections after each check
    pub auto_fix: bool,
}

/// Reconcile scheduler - coordinates periodic consistency checks
pub struct ReconcileScheduler {
    config: ReconcileScheduleConfig,
    reconciler: Arc<ConsistencyReconciler>,
}

impl ReconcileScheduler {
    pub fn new(config: ReconcileScheduleConfig, reconciler: Arc<ConsistencyReconciler>) -> Self {
        Self { config, reconciler }
    }

    /// Start the scheduler in the background. Returns None when scheduling is off.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        let config = self.config.clone();
        let reconciler = self.reconciler.clone();

        match config.frequency {
            ReconcileFrequency::Off => {
                info!("Scheduled reconciliation disabled");
                None
            }
            ReconcileFrequency::Daily => Some(tokio::spawn(async move {
                Self::run_daily_scheduler(&config, &reconciler).await
            })),
            ReconcileFrequency::Hourly => Some(tokio::spawn(async move {
                Self::run_hourly_scheduler(&config, &reconciler).await
            })),
        }
    }

    async fn run_daily_scheduler(config: &ReconcileScheduleConfig, reconciler: &Arc<ConsistencyReconciler>) {
        loop {
            let now = Utc::now();
            let next_execution = Self::calculate_next_daily_execution(now, config.execution_hour);
            let wait = next_execution.signed_duration_since(now);

            if wait.num_seconds() > 0 {
                info!("Next reconciliation scheduled for {} UTC", next_execution.format("%Y-%m-%d %H:%M:%S"));
                tokio::time::sleep(Duration::from_secs(wait.num_seconds() as u64)).await;
            }

            Self::run_cycle(config, reconciler).await;
        }
    }

    async fn run_hourly_scheduler(config: &ReconcileScheduleConfig, reconciler: &Arc<ConsistencyReconciler>) {
        let mut interval = interval(Duration::from_secs(3600));

        loop {
            interval.tick().await;
            Self::run_cycle(config, reconciler).await;
        }
    }

    async fn run_cycle(config: &ReconcileScheduleConfig, reconciler: &ConsistencyReconciler) {
        info!("Starting reconciliation cycle");

        let result = if config.auto_fix {
            reconciler.fix(FixMode::Apply).await
        } else {
            reconciler.check(&CheckFilter::all()).await
        };

        match result {
            Ok(report) if report.has_unresolved() => warn!(
                "Reconciliation cycle finished: {} found, {} fixed, {} unresolved",
                report.summary.issues_found, report.summary.issues_fixed, report.summary.unresolved
            ),
            Ok(_) => info!("Reconciliation cycle finished: no issues"),
            Err(e) => error!("Reconciliation cycle failed: {}", e),
        }
    }

    /// Next occurrence of `execution_hour:00` UTC strictly after `now`
    fn calculate_next_daily_execution(now: DateTime<Utc>, execution_hour: u32) -> DateTime<Utc> {
        let at = NaiveTime::from_hms_opt(execution_hour.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
        let today = Utc.from_utc_datetime(&now.date_naive().and_time(at));

        if today <= now {
            today + ChronoDuration::days(1)
        } else {
            today
        }
    }
}
