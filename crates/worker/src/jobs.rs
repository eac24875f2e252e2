//! Scheduled jobs

use std::sync::Arc;

use async_trait::async_trait;
use clubhouse_billing::{InvariantChecker, RecurringBillingProcessor, RecurringBillingReport};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

use crate::config::HEARTBEAT_SCHEDULE;

#[async_trait]
pub trait ScheduledJob: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Six-field cron expression
    fn schedule(&self) -> &str;

    async fn run(&self);
}

/// Add a job to the scheduler under its own cron schedule
pub async fn register(
    scheduler: &JobScheduler,
    job: Arc<dyn ScheduledJob>,
) -> Result<Uuid, JobSchedulerError> {
    let name = job.name();
    let schedule = job.schedule().to_string();

    let handler = job.clone();
    let id = scheduler
        .add(Job::new_async(schedule.as_str(), move |_uuid, _l| {
            let job = handler.clone();
            Box::pin(async move {
                job.run().await;
            })
        })?)
        .await?;

    info!(job = name, schedule = %schedule, "Scheduled job");
    Ok(id)
}

/// Bills due club memberships
pub struct RecurringBillingJob {
    processor: Arc<RecurringBillingProcessor>,
    schedule: String,
    // Held for the length of a run; a tick that finds it taken is skipped
    running: Mutex<()>,
}

impl RecurringBillingJob {
    pub fn new(processor: Arc<RecurringBillingProcessor>, schedule: impl Into<String>) -> Self {
        Self {
            processor,
            schedule: schedule.into(),
            running: Mutex::new(()),
        }
    }

    /// One billing run at `now`; `None` if skipped or the run failed
    pub async fn run_at(&self, now: OffsetDateTime) -> Option<RecurringBillingReport> {
        let Ok(_guard) = self.running.try_lock() else {
            warn!("Previous recurring billing run still in progress, skipping");
            return None;
        };

        let span = tracing::info_span!("recurring_billing", run_id = %Uuid::new_v4());
        async {
            info!(now = %now, "Running recurring club membership billing");
            match self.processor.run(now).await {
                Ok(report) => {
                    report.log();
                    Some(report)
                }
                Err(e) => {
                    error!(error = %e, "Recurring club membership billing failed");
                    None
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl ScheduledJob for RecurringBillingJob {
    fn name(&self) -> &'static str {
        "recurring-club-billing"
    }

    fn schedule(&self) -> &str {
        &self.schedule
    }

    async fn run(&self) {
        self.run_at(OffsetDateTime::now_utc()).await;
    }
}

pub struct InvariantCheckJob {
    checker: Arc<InvariantChecker>,
    schedule: String,
}

impl InvariantCheckJob {
    pub fn new(checker: Arc<InvariantChecker>, schedule: impl Into<String>) -> Self {
        Self {
            checker,
            schedule: schedule.into(),
        }
    }
}

#[async_trait]
impl ScheduledJob for InvariantCheckJob {
    fn name(&self) -> &'static str {
        "club-billing-invariants"
    }

    fn schedule(&self) -> &str {
        &self.schedule
    }

    async fn run(&self) {
        info!("Running club billing invariant checks");
        match self.checker.run_all_checks().await {
            Ok(summary) => summary.log(),
            Err(e) => error!(error = %e, "Club billing invariant checks failed"),
        }
    }
}

pub struct HeartbeatJob;

#[async_trait]
impl ScheduledJob for HeartbeatJob {
    fn name(&self) -> &'static str {
        "heartbeat"
    }

    fn schedule(&self) -> &str {
        HEARTBEAT_SCHEDULE
    }

    async fn run(&self) {
        info!("Worker heartbeat - all systems operational");
    }
}
