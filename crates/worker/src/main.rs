#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Clubhouse Background Worker
//!
//! Handles scheduled jobs including:
//! - Recurring club membership billing (hourly)
//! - Club billing invariant checks (daily at 4:30 AM UTC)
//! - Health check heartbeat (every 5 minutes)

mod config;
mod jobs;

use std::sync::Arc;
use std::time::Duration;

use clubhouse_billing::BillingService;
use clubhouse_shared::{create_pool, create_read_pool, run_migrations};
use tokio_cron_scheduler::JobScheduler;
use tracing::{info, warn};

use crate::config::{LogFormat, WorkerConfig};
use crate::jobs::{register, HeartbeatJob, InvariantCheckJob, RecurringBillingJob, ScheduledJob};

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Config errors surface through anyhow before logging is up
    let config = WorkerConfig::from_env()?;

    init_tracing(config.log_format);

    info!("Starting Clubhouse Worker");

    let pool = create_pool(&config.database_url, config.pool).await?;
    let read_pool = match &config.database_read_url {
        Some(url) => create_read_pool(url, config.pool).await?,
        None => pool.clone(),
    };

    if config.run_migrations {
        run_migrations(&pool).await?;
    }

    let billing = match BillingService::from_env(read_pool, pool.clone()) {
        Ok(b) => b,
        Err(e) => {
            // If Stripe or the ledger isn't configured, run in minimal mode
            warn!(error = %e, "Failed to create billing service - running in minimal mode");
            info!("Worker running without club billing");

            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    let mut scheduler = JobScheduler::new().await?;

    let jobs: Vec<Arc<dyn ScheduledJob>> = vec![
        Arc::new(RecurringBillingJob::new(
            billing.recurring.clone(),
            config.recurring_schedule.clone(),
        )),
        Arc::new(InvariantCheckJob::new(
            billing.invariants.clone(),
            config.invariants_schedule.clone(),
        )),
        Arc::new(HeartbeatJob),
    ];
    let job_count = jobs.len();
    for job in jobs {
        register(&scheduler, job).await?;
    }

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!(
        max_concurrency = billing.recurring.config().max_concurrency,
        "Clubhouse Worker started successfully with {} scheduled jobs", job_count
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down job scheduler");
    scheduler.shutdown().await?;
    pool.close().await;

    Ok(())
}
