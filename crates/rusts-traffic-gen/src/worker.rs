//! Sensor worker: the per-sensor tick loop.
//!
//! Each tick obtains a session, writes one value per metric (possibly
//! corrupted by the fault injector), optionally reads back a random sensor,
//! optionally burns CPU, then sleeps for the jittered tick interval. Nothing
//! that goes wrong inside a tick stops the worker; only the duration bound
//! and the cancellation token do, and both are checked between ticks.

use crate::audit::AuditSink;
use crate::backend::{Backend, Session, READ_LIMIT};
use crate::config::{sensor_identity, RunConfig};
use crate::connection::{ConnectionManager, ConnectionSummary};
use crate::error::FailureClass;
use crate::fault::{FaultInjector, FaultKind};
use crate::metrics::{default_metrics, MetricDefinition, TelemetrySample};
use chrono::Utc;
use hdrhistogram::Histogram;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerState {
    Connecting,
    Ticking,
    Reading,
    CpuSpiking,
    Sleeping,
    Exited,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Connecting => "connecting",
            WorkerState::Ticking => "ticking",
            WorkerState::Reading => "reading",
            WorkerState::CpuSpiking => "cpu-spiking",
            WorkerState::Sleeping => "sleeping",
            WorkerState::Exited => "exited",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Faults injected by one worker, by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FaultCounts {
    pub zero: u64,
    pub spike: u64,
    pub nan: u64,
}

impl FaultCounts {
    pub fn record(&mut self, kind: FaultKind) {
        match kind {
            FaultKind::Zero => self.zero += 1,
            FaultKind::Spike => self.spike += 1,
            FaultKind::Nan => self.nan += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.zero + self.spike + self.nan
    }

    pub fn merge(&mut self, other: &FaultCounts) {
        self.zero += other.zero;
        self.spike += other.spike;
        self.nan += other.nan;
    }
}

/// What a worker did over its lifetime, returned when it exits.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub sensor_id: String,
    pub final_state: WorkerState,
    pub elapsed: Duration,
    pub ticks: u64,
    pub writes_ok: u64,
    pub write_errors: u64,
    /// Subset of `write_errors` caused by handle exhaustion
    pub write_resource_errors: u64,
    pub reads_ok: u64,
    pub read_errors: u64,
    pub connect_failures: u64,
    pub faults: FaultCounts,
    pub connections: ConnectionSummary,
    /// Write latency in microseconds
    pub write_latency: Histogram<u64>,
}

impl WorkerReport {
    fn new(sensor_id: &str) -> Self {
        Self {
            sensor_id: sensor_id.to_string(),
            final_state: WorkerState::Connecting,
            elapsed: Duration::ZERO,
            ticks: 0,
            writes_ok: 0,
            write_errors: 0,
            write_resource_errors: 0,
            reads_ok: 0,
            read_errors: 0,
            connect_failures: 0,
            faults: FaultCounts::default(),
            connections: ConnectionSummary::default(),
            write_latency: new_latency_histogram(),
        }
    }
}

/// Creates an empty latency histogram (1us .. 60s, 3 significant digits).
pub fn new_latency_histogram() -> Histogram<u64> {
    Histogram::<u64>::new_with_bounds(1, 60_000_000, 3).expect("static histogram bounds are valid")
}

/// One simulated sensor.
pub struct SensorWorker<B: Backend> {
    sensor_id: String,
    config: Arc<RunConfig>,
    metrics: Arc<Vec<MetricDefinition>>,
    injector: FaultInjector,
    connections: ConnectionManager<B>,
    rng: StdRng,
    cancel: CancellationToken,
    state: WorkerState,
    report: WorkerReport,
}

impl<B: Backend> SensorWorker<B> {
    pub fn new(
        sensor_id: impl Into<String>,
        config: Arc<RunConfig>,
        backend: Arc<B>,
        audit: Arc<dyn AuditSink>,
        cancel: CancellationToken,
        seed: Option<u64>,
    ) -> Self {
        let sensor_id = sensor_id.into();
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            connections: ConnectionManager::new(backend, config.connection_policy(), &*sensor_id),
            injector: FaultInjector::new(config.fault_probability, audit),
            metrics: Arc::new(default_metrics()),
            report: WorkerReport::new(&sensor_id),
            state: WorkerState::Connecting,
            sensor_id,
            config,
            rng,
            cancel,
        }
    }

    /// Runs ticks until the duration bound is reached or the token is cancelled.
    pub async fn run(mut self) -> WorkerReport {
        let start = Instant::now();
        let deadline = self.config.duration();
        debug!(
            "Worker {} started ({} policy)",
            self.sensor_id,
            self.connections.policy()
        );

        loop {
            if self.cancel.is_cancelled() {
                debug!("Worker {} cancelled", self.sensor_id);
                break;
            }
            if let Some(limit) = deadline {
                if start.elapsed() >= limit {
                    info!(
                        "Duration {} minutes reached. Worker {} exiting...",
                        limit.as_secs() / 60,
                        self.sensor_id
                    );
                    break;
                }
            }
            self.tick().await;
        }

        transition(&mut self.state, WorkerState::Exited, &self.sensor_id);
        let mut report = self.report;
        report.connections = self.connections.shutdown().await;
        report.final_state = self.state;
        report.elapsed = start.elapsed();
        report
    }

    async fn tick(&mut self) {
        transition(&mut self.state, WorkerState::Connecting, &self.sensor_id);
        let session = match self.connections.acquire().await {
            Ok(session) => session,
            Err(_) => {
                // Already logged with its classification; retry the same tick
                self.report.connect_failures += 1;
                tokio::time::sleep(self.config.connect_backoff()).await;
                return;
            }
        };

        transition(&mut self.state, WorkerState::Ticking, &self.sensor_id);
        let timestamp = Utc::now();
        let t = timestamp.timestamp_micros() as f64 / 1_000_000.0;

        for metric in self.metrics.iter() {
            let raw = metric.simulate(t, &mut self.rng);
            let (value, fault) =
                self.injector
                    .apply(&mut self.rng, &self.sensor_id, metric.name, timestamp, raw);
            if let Some(kind) = fault {
                self.report.faults.record(kind);
            }

            let sample = TelemetrySample {
                sensor_id: self.sensor_id.clone(),
                timestamp,
                metric_name: metric.name.to_string(),
                value,
                unit: metric.unit.to_string(),
            };

            let started = Instant::now();
            match session.insert(&sample).await {
                Ok(()) => {
                    self.report.writes_ok += 1;
                    let micros = started.elapsed().as_micros() as u64;
                    let _ = self.report.write_latency.record(micros.max(1));
                }
                Err(e) => {
                    self.report.write_errors += 1;
                    if e.classify() == FailureClass::ResourceExhaustion {
                        self.report.write_resource_errors += 1;
                        error!("INSERT ERROR - TOO MANY OPEN FILES in worker {}", self.sensor_id);
                    } else {
                        error!("Insertion failed in worker {}: {}", self.sensor_id, e);
                    }
                }
            }
        }

        if self.config.modes.read_storm {
            transition(&mut self.state, WorkerState::Reading, &self.sensor_id);
            let target = sensor_identity(self.rng.gen_range(0..self.config.num_sensors.max(1)));
            match session.recent(&target, READ_LIMIT).await {
                Ok(_) => self.report.reads_ok += 1,
                Err(e) => {
                    self.report.read_errors += 1;
                    error!("Read failed in worker {}: {}", self.sensor_id, e);
                }
            }
        }

        self.connections.release().await;

        if self.config.modes.cpu_spike {
            transition(&mut self.state, WorkerState::CpuSpiking, &self.sensor_id);
            let iterations = self.config.tuning.cpu_spike_iterations;
            let seed: u64 = self.rng.gen();
            if let Err(e) = tokio::task::spawn_blocking(move || cpu_spike(iterations, seed)).await {
                warn!("CPU spike in worker {} failed: {}", self.sensor_id, e);
            }
        }

        transition(&mut self.state, WorkerState::Sleeping, &self.sensor_id);
        let pause = compute_sleep(
            self.config.base_interval(),
            self.config.jitter,
            self.config.min_sleep(),
            &mut self.rng,
        );
        tokio::time::sleep(pause).await;
        self.report.ticks += 1;
    }
}

fn transition(state: &mut WorkerState, next: WorkerState, sensor_id: &str) {
    trace!("Worker {}: {} -> {}", sensor_id, state, next);
    *state = next;
}

/// Jittered tick pause: `base * (1 + f)` with `f` uniform in
/// `[max(-0.99, -jitter), jitter]`, never below `floor`.
pub fn compute_sleep<R: Rng + ?Sized>(
    base: Duration,
    jitter: f64,
    floor: Duration,
    rng: &mut R,
) -> Duration {
    let factor = if jitter > 0.0 {
        rng.gen_range((-jitter).max(-0.99)..=jitter)
    } else {
        0.0
    };
    let secs = (base.as_secs_f64() * (1.0 + factor)).max(floor.as_secs_f64());
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Fixed amount of floating point work, independent of wall-clock time.
pub fn cpu_spike(iterations: u64, seed: u64) -> f64 {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut acc = 0.0;
    for _ in 0..iterations {
        acc += rng.gen::<f64>().sqrt();
    }
    std::hint::black_box(acc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_without_jitter_is_base() {
        let mut rng = StdRng::seed_from_u64(1);
        let base = Duration::from_millis(20);
        for _ in 0..100 {
            assert_eq!(
                compute_sleep(base, 0.0, Duration::from_millis(1), &mut rng),
                base
            );
        }
    }

    #[test]
    fn test_sleep_never_below_floor() {
        let mut rng = StdRng::seed_from_u64(2);
        let floor = Duration::from_millis(1);
        for jitter in [0.3, 0.99, 1.0, 5.0] {
            for _ in 0..10_000 {
                let pause = compute_sleep(Duration::from_millis(20), jitter, floor, &mut rng);
                assert!(pause >= floor, "jitter {} gave {:?}", jitter, pause);
            }
        }
    }

    #[test]
    fn test_sleep_multiplier_stays_positive_at_full_jitter() {
        let mut rng = StdRng::seed_from_u64(3);
        let base = Duration::from_secs(1);
        for _ in 0..10_000 {
            // Floor disabled: the clamp alone must keep the pause positive
            let pause = compute_sleep(base, 1.0, Duration::ZERO, &mut rng);
            assert!(pause >= Duration::from_millis(10), "{:?}", pause);
            assert!(pause <= Duration::from_secs(2));
        }
    }

    #[test]
    fn test_sleep_bounds_follow_jitter() {
        let mut rng = StdRng::seed_from_u64(4);
        let base = Duration::from_millis(100);
        for _ in 0..10_000 {
            let pause = compute_sleep(base, 0.3, Duration::from_millis(1), &mut rng);
            assert!(pause >= Duration::from_millis(69) && pause <= Duration::from_millis(131));
        }
    }

    #[test]
    fn test_cpu_spike_is_deterministic() {
        assert_eq!(cpu_spike(10_000, 5), cpu_spike(10_000, 5));
        assert_eq!(cpu_spike(0, 5), 0.0);
    }

    #[test]
    fn test_fault_counts() {
        let mut counts = FaultCounts::default();
        counts.record(FaultKind::Zero);
        counts.record(FaultKind::Nan);
        counts.record(FaultKind::Nan);
        assert_eq!(counts.total(), 3);

        let mut total = FaultCounts::default();
        total.merge(&counts);
        total.merge(&counts);
        assert_eq!(total.nan, 4);
    }
}
