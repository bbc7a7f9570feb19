use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::config::SyncConfig;
use crate::Engine;

/// Registers one cron job that runs `tick` against the shared engine.
async fn add_tick<F, Fut>(sched: &JobScheduler, name: &'static str, cron: &str, engine: Arc<Engine>, tick: F) -> Result<()>
where
    F: Fn(Arc<Engine>) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Result<String>> + Send + 'static,
{
    let job = Job::new_async(cron, move |_uuid, _l| {
        let engine = engine.clone();
        let tick = tick.clone();
        Box::pin(async move {
            match tick(engine).await {
                Ok(summary) => info!(tick = name, %summary, "scheduled tick finished"),
                Err(err) => error!(tick = name, error = %err, "scheduled tick failed"),
            }
        })
    })
    .with_context(|| format!("creating {name} job for cron {cron}"))?;
    sched
        .add(job)
        .await
        .with_context(|| format!("adding {name} job"))?;
    Ok(())
}

/// Dispatch, decay, hourly rate reset and the daily maintenance sweep. Not started.
pub async fn build_scheduler(engine: Arc<Engine>, config: &SyncConfig) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;

    add_tick(&sched, "dispatch", &config.dispatch_cron, engine.clone(), |engine| async move {
        let report = engine.dispatch_tick().await?;
        Ok(format!(
            "dispatched {} skipped {}",
            report.dispatched.len(),
            report.skipped.len()
        ))
    })
    .await?;

    add_tick(&sched, "decay", &config.decay_cron, engine.clone(), |engine| async move {
        let report = engine.decay_tick().await?;
        Ok(format!(
            "updated {} of {}, {} verifications",
            report.updated, report.scanned, report.verifications_dispatched
        ))
    })
    .await?;

    add_tick(&sched, "rate_reset", &config.rate_reset_cron, engine.clone(), |engine| async move {
        let sources = engine.rate_reset().await?;
        Ok(format!("reset {sources} sources"))
    })
    .await?;

    add_tick(&sched, "maintenance", &config.maintenance_cron, engine, |engine| async move {
        let report = engine.maintenance_sweep().await?;
        Ok(format!(
            "deactivated {} circuits reset {} stale jobs {}",
            report.deactivated, report.circuits_reset, report.stale_jobs_failed
        ))
    })
    .await?;

    info!(
        dispatch = %config.dispatch_cron,
        decay = %config.decay_cron,
        rate_reset = %config.rate_reset_cron,
        maintenance = %config.maintenance_cron,
        "scheduler configured"
    );
    Ok(sched)
}
