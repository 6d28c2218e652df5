//! Run orchestration: schema bootstrap, worker spawning, supervision and shutdown.

use crate::audit::AuditSink;
use crate::backend::{Backend, Session};
use crate::config::{sensor_identity, RunConfig, HOTSPOT_SENSOR_ID};
use crate::error::{Result, TrafficError};
use crate::report::RunReport;
use crate::schema::schema_statements;
use crate::worker::{SensorWorker, WorkerReport};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Runs a complete traffic session against `backend`.
///
/// Returns [`TrafficError::InitialConnection`] when the control connection
/// cannot be opened; every later failure is logged and absorbed. `cancel`
/// ends the run early (e.g. on SIGINT) and still produces a report.
pub async fn run_workload<B: Backend>(
    config: Arc<RunConfig>,
    backend: Arc<B>,
    audit: Arc<dyn AuditSink>,
    cancel: CancellationToken,
) -> Result<RunReport> {
    let start = Instant::now();
    info!("=== TRAFFIC RUN START ===");
    info!("Start time: {}", Utc::now());
    info!("Parameters: {:?}", config);
    info!("Target: {}", backend.describe());
    info!("Connection policy: {}", config.connection_policy());
    if config.modes.leak_mode && !config.modes.connection_storm {
        warn!("Leak mode has no effect without connection storm");
    }

    let control = backend.connect().await.map_err(|e| {
        error!("Initial connection failed: {}", e);
        TrafficError::InitialConnection(e)
    })?;

    for statement in schema_statements(&config.keyspace, &config.table) {
        if let Err(e) = control.execute(&statement).await {
            warn!("Schema statement may have failed: {}", e);
        }
    }

    let workers_cancel = cancel.child_token();
    let handles = spawn_workers(&config, &backend, &audit, &workers_cancel).await;
    let spawned_at = Instant::now();
    info!("Started {} workers total", handles.len());

    let join_deadline = match supervise(&config, &handles, &cancel, start).await {
        StopReason::Cancelled => {
            workers_cancel.cancel();
            deadline_after(Instant::now(), config.join_timeout())
        }
        // Workers time their own duration from their own start; the last one
        // spawned is the last to reach it
        StopReason::DurationElapsed => {
            let last_expiry = deadline_after(spawned_at, config.duration().unwrap_or_default());
            deadline_after(last_expiry.max(Instant::now()), config.join_timeout())
        }
    };

    let workers_spawned = handles.len();
    let (reports, abandoned) = join_workers(handles, join_deadline).await;
    if abandoned > 0 {
        warn!("{} workers did not exit in time and were abandoned", abandoned);
    }

    let actual_duration = start.elapsed();
    info!("Stop time: {}", Utc::now());

    if let Err(e) = control.close().await {
        debug!("Control connection teardown failed: {}", e);
    }

    let mut report = RunReport {
        backend: backend.describe(),
        policy: config.connection_policy().to_string(),
        hotspot: config.modes.hotspot,
        configured_duration: config.duration(),
        actual_duration,
        workers_spawned,
        workers_abandoned: abandoned,
        ..Default::default()
    };
    report.absorb(&reports);
    report.log_summary();
    info!("=== TRAFFIC RUN END ===");

    Ok(report)
}

/// Spawns the hotspot worker or the fleet, pausing between batches.
async fn spawn_workers<B: Backend>(
    config: &Arc<RunConfig>,
    backend: &Arc<B>,
    audit: &Arc<dyn AuditSink>,
    cancel: &CancellationToken,
) -> Vec<JoinHandle<WorkerReport>> {
    let spawn = |index: usize, sensor_id: String| {
        let worker = SensorWorker::new(
            sensor_id,
            Arc::clone(config),
            Arc::clone(backend),
            Arc::clone(audit),
            cancel.clone(),
            config.worker_seed(index),
        );
        tokio::spawn(worker.run())
    };

    if config.modes.hotspot {
        info!("HOTSPOT ENABLED on `{}`", HOTSPOT_SENSOR_ID);
        return vec![spawn(0, HOTSPOT_SENSOR_ID.to_string())];
    }

    let batch = config.tuning.spawn_batch_size.max(1);
    let mut handles = Vec::new();
    for i in 0..config.workers {
        if cancel.is_cancelled() {
            break;
        }
        handles.push(spawn(i, sensor_identity(i)));

        if (i + 1) % batch == 0 && i + 1 < config.workers {
            info!("Started {} workers...", i + 1);
            tokio::time::sleep(config.spawn_pause()).await;
        }
    }
    handles
}

/// Why supervision ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    DurationElapsed,
    Cancelled,
}

/// Waits until the duration elapses or the run is cancelled, logging liveness.
async fn supervise(
    config: &RunConfig,
    handles: &[JoinHandle<WorkerReport>],
    cancel: &CancellationToken,
    start: Instant,
) -> StopReason {
    let deadline = config.duration();
    let poll = config.poll_interval();

    loop {
        let wait = match deadline {
            Some(limit) => {
                let remaining = limit.saturating_sub(start.elapsed());
                if remaining.is_zero() {
                    info!("Duration reached, waiting for workers to finish");
                    return StopReason::DurationElapsed;
                }
                remaining.min(poll)
            }
            None => poll,
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Shutting down...");
                return StopReason::Cancelled;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        if deadline.map_or(true, |limit| start.elapsed() < limit) {
            let active = handles.iter().filter(|h| !h.is_finished()).count();
            info!("Still running... {} workers active", active);
        }
    }
}

/// `base + wait`, saturating far in the future instead of overflowing.
fn deadline_after(base: Instant, wait: Duration) -> Instant {
    base.checked_add(wait)
        .unwrap_or_else(|| base + Duration::from_secs(100 * 365 * 24 * 3600))
}

/// Joins every worker under one shared deadline. Workers still running when
/// it passes are detached, not aborted.
async fn join_workers(
    handles: Vec<JoinHandle<WorkerReport>>,
    deadline: Instant,
) -> (Vec<WorkerReport>, usize) {
    let mut reports = Vec::with_capacity(handles.len());
    let mut abandoned = 0;

    for handle in handles {
        match tokio::time::timeout_at(deadline, handle).await {
            Ok(Ok(report)) => reports.push(report),
            Ok(Err(e)) => error!("Worker task failed: {}", e),
            Err(_) => abandoned += 1,
        }
    }

    (reports, abandoned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_saturates_on_huge_wait() {
        let now = Instant::now();
        let deadline = deadline_after(now, Duration::MAX);
        assert!(deadline > now + Duration::from_secs(3600));
        assert_eq!(deadline_after(now, Duration::from_secs(5)), now + Duration::from_secs(5));
    }
}
