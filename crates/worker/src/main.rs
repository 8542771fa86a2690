// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Storefront Worker
//!
//! Background jobs for billing:
//!
//! - Drain the billing event inbox into the entitlement synchronizer
//! - Check cached limits against the plan catalog
//! - Prune completed inbox rows

mod config;
mod event_processor;

use std::sync::Arc;

use storefront_billing::{BillingService, ViolationSeverity};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing_subscriber::EnvFilter;

use crate::config::WorkerConfig;

const INBOX_CLEANUP_SCHEDULE: &str = "0 30 3 * * *";
const INBOX_RETENTION_DAYS: i32 = 30;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = WorkerConfig::from_env()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if config.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!("Starting Storefront worker");

    let pool =
        storefront_shared::create_pool(&config.database_url, config.database_max_connections)
            .await?;
    storefront_shared::run_migrations(&pool).await?;
    tracing::info!("Database ready");

    let billing = Arc::new(BillingService::from_env(pool.clone())?);

    let mut scheduler = JobScheduler::new().await?;

    {
        let pool = pool.clone();
        let billing = billing.clone();
        let batch_size = config.inbox_batch_size;
        let retry_delay_secs = config.inbox_retry_delay_secs;
        scheduler
            .add(Job::new_async(
                config.inbox_poll_schedule.as_str(),
                move |_id, _scheduler| {
                    let pool = pool.clone();
                    let billing = billing.clone();
                    Box::pin(async move {
                        let stats = event_processor::process_billing_inbox(
                            &pool,
                            &billing.sync,
                            batch_size,
                            retry_delay_secs,
                        )
                        .await;
                        if stats.claimed > 0 || stats.dead_lettered > 0 {
                            tracing::info!(
                                claimed = stats.claimed,
                                completed = stats.completed,
                                retried = stats.retried,
                                dead_lettered = stats.dead_lettered,
                                "Billing inbox pass finished"
                            );
                        }
                    })
                },
            )?)
            .await?;
    }

    {
        let billing = billing.clone();
        scheduler
            .add(Job::new_async(
                config.drift_check_schedule.as_str(),
                move |_id, _scheduler| {
                    let billing = billing.clone();
                    Box::pin(async move { run_drift_check(&billing).await })
                },
            )?)
            .await?;
    }

    {
        let pool = pool.clone();
        scheduler
            .add(Job::new_async(INBOX_CLEANUP_SCHEDULE, move |_id, _scheduler| {
                let pool = pool.clone();
                Box::pin(async move {
                    event_processor::cleanup_completed_events(&pool, INBOX_RETENTION_DAYS).await;
                })
            })?)
            .await?;
    }

    scheduler.start().await?;
    tracing::info!(
        inbox_schedule = %config.inbox_poll_schedule,
        drift_schedule = %config.drift_check_schedule,
        "Scheduler started"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    scheduler.shutdown().await?;
    pool.close().await;

    Ok(())
}

async fn run_drift_check(billing: &BillingService) {
    let summary = match billing.invariants.run_all_checks().await {
        Ok(summary) => summary,
        Err(e) => {
            tracing::error!(error = %e, "Entitlement drift check failed to run");
            return;
        }
    };

    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => tracing::error!(
                invariant = violation.invariant,
                org_id = %violation.org_id,
                severity = %violation.severity,
                context = %violation.context,
                "{}",
                violation.description
            ),
            ViolationSeverity::Medium => tracing::warn!(
                invariant = violation.invariant,
                org_id = %violation.org_id,
                severity = %violation.severity,
                context = %violation.context,
                "{}",
                violation.description
            ),
        }
    }

    tracing::info!(
        organizations = summary.organizations_checked,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        healthy = summary.healthy,
        "Entitlement drift check finished"
    );
}
