//! In-process backend.
//!
//! Keeps the most recent rows of each sensor in memory, counts sessions, and
//! can be scripted to fail the next N connects, writes or reads with a given
//! [`FailureClass`]. Used for dry runs and by the test suite.

use super::{Backend, Session, StoredRow};
use crate::config::RunConfig;
use crate::error::{BackendError, FailureClass};
use crate::metrics::TelemetrySample;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Rows kept per sensor unless configured otherwise.
pub const DEFAULT_RETENTION: usize = 1_000;

/// The most recent rows of one sensor.
#[derive(Debug, Default)]
struct SensorRows {
    rows: VecDeque<StoredRow>,
    written: u64,
}

impl SensorRows {
    fn push(&mut self, row: StoredRow, retention: usize) {
        self.written += 1;
        if retention == 0 {
            return;
        }
        while self.rows.len() >= retention {
            self.rows.pop_front();
        }
        self.rows.push_back(row);
    }
}

#[derive(Debug)]
struct MemoryState {
    sensors: DashMap<String, SensorRows>,
    retention: usize,
    written: AtomicU64,
    statements: Mutex<Vec<String>>,
    connect_failures: Mutex<VecDeque<FailureClass>>,
    write_failures: Mutex<VecDeque<FailureClass>>,
    read_failures: Mutex<VecDeque<FailureClass>>,
    failing_statements: Mutex<Vec<String>>,
    opened: AtomicU64,
    closed: AtomicU64,
    connect_attempts: AtomicU64,
    reads: AtomicU64,
}

impl MemoryState {
    fn new(retention: usize) -> Self {
        Self {
            sensors: DashMap::new(),
            retention,
            written: AtomicU64::new(0),
            statements: Mutex::new(Vec::new()),
            connect_failures: Mutex::new(VecDeque::new()),
            write_failures: Mutex::new(VecDeque::new()),
            read_failures: Mutex::new(VecDeque::new()),
            failing_statements: Mutex::new(Vec::new()),
            opened: AtomicU64::new(0),
            closed: AtomicU64::new(0),
            connect_attempts: AtomicU64::new(0),
            reads: AtomicU64::new(0),
        }
    }
}

/// Cheaply cloneable handle on a shared in-memory store.
///
/// Only the last `retention` rows of each sensor are kept, so an unbounded
/// dry run holds at most `retention` rows per sensor identity.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    state: Arc<MemoryState>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    /// Keeps at most `rows_per_sensor` rows for each sensor.
    pub fn with_retention(rows_per_sensor: usize) -> Self {
        Self {
            state: Arc::new(MemoryState::new(rows_per_sensor)),
        }
    }

    pub fn from_config(config: &RunConfig) -> Self {
        Self::with_retention(config.tuning.memory_retention_rows)
    }

    /// Fails the next `count` connection attempts with `class`.
    pub fn fail_next_connects(&self, count: usize, class: FailureClass) {
        let mut queue = self.state.connect_failures.lock();
        queue.extend(std::iter::repeat(class).take(count));
    }

    /// Fails the next `count` inserts with `class`.
    pub fn fail_next_writes(&self, count: usize, class: FailureClass) {
        let mut queue = self.state.write_failures.lock();
        queue.extend(std::iter::repeat(class).take(count));
    }

    /// Fails the next `count` reads with `class`.
    pub fn fail_next_reads(&self, count: usize, class: FailureClass) {
        let mut queue = self.state.read_failures.lock();
        queue.extend(std::iter::repeat(class).take(count));
    }

    /// Fails every schema statement containing `fragment`.
    pub fn fail_statements_containing(&self, fragment: impl Into<String>) {
        self.state.failing_statements.lock().push(fragment.into());
    }

    /// Snapshot of every retained row, grouped by sensor, each group in write order.
    pub fn rows(&self) -> Vec<StoredRow> {
        self.state
            .sensors
            .iter()
            .flat_map(|entry| entry.rows.iter().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Retained rows of one sensor, in write order.
    pub fn rows_for(&self, sensor_id: &str) -> Vec<StoredRow> {
        self.state
            .sensors
            .get(sensor_id)
            .map(|entry| entry.rows.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Sensor identities that wrote at least one row.
    pub fn sensors(&self) -> Vec<String> {
        self.state
            .sensors
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Rows accepted since creation, retained or not.
    pub fn written(&self) -> u64 {
        self.state.written.load(Ordering::Relaxed)
    }

    /// Rows accepted for one sensor, retained or not.
    pub fn written_for(&self, sensor_id: &str) -> u64 {
        self.state
            .sensors
            .get(sensor_id)
            .map(|entry| entry.written)
            .unwrap_or(0)
    }

    /// Schema statements that were executed successfully.
    pub fn statements(&self) -> Vec<String> {
        self.state.statements.lock().clone()
    }

    /// Sessions opened successfully.
    pub fn opened(&self) -> u64 {
        self.state.opened.load(Ordering::Relaxed)
    }

    /// Sessions closed.
    pub fn closed(&self) -> u64 {
        self.state.closed.load(Ordering::Relaxed)
    }

    /// Sessions opened and never closed.
    pub fn live(&self) -> u64 {
        self.opened().saturating_sub(self.closed())
    }

    /// Connection attempts, successful or not.
    pub fn connect_attempts(&self) -> u64 {
        self.state.connect_attempts.load(Ordering::Relaxed)
    }

    /// Reads served successfully.
    pub fn reads(&self) -> u64 {
        self.state.reads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    type Session = MemorySession;

    async fn connect(&self) -> Result<MemorySession, BackendError> {
        self.state.connect_attempts.fetch_add(1, Ordering::Relaxed);
        if let Some(class) = self.state.connect_failures.lock().pop_front() {
            return Err(BackendError::simulated(class, "connect refused by script"));
        }

        let id = self.state.opened.fetch_add(1, Ordering::Relaxed);
        Ok(MemorySession {
            id,
            state: Arc::clone(&self.state),
        })
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Session on a [`MemoryBackend`].
#[derive(Debug)]
pub struct MemorySession {
    id: u64,
    state: Arc<MemoryState>,
}

impl MemorySession {
    /// Sequence number of this session (0 for the first one opened).
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn execute(&self, statement: &str) -> Result<(), BackendError> {
        let rejected = self
            .state
            .failing_statements
            .lock()
            .iter()
            .any(|fragment| statement.contains(fragment.as_str()));
        if rejected {
            return Err(BackendError::Server {
                status: 400,
                message: format!("statement rejected: {}", statement.trim()),
            });
        }

        self.state.statements.lock().push(statement.to_string());
        Ok(())
    }

    async fn insert(&self, sample: &TelemetrySample) -> Result<(), BackendError> {
        if let Some(class) = self.state.write_failures.lock().pop_front() {
            return Err(BackendError::simulated(class, "write rejected by script"));
        }

        let row = StoredRow::from(sample);
        let retention = self.state.retention;
        match self.state.sensors.get_mut(&sample.sensor_id) {
            Some(mut entry) => entry.push(row, retention),
            None => self
                .state
                .sensors
                .entry(sample.sensor_id.clone())
                .or_default()
                .push(row, retention),
        }
        self.state.written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn recent(&self, sensor_id: &str, limit: usize) -> Result<Vec<StoredRow>, BackendError> {
        if let Some(class) = self.state.read_failures.lock().pop_front() {
            return Err(BackendError::simulated(class, "read rejected by script"));
        }

        // Only this sensor's shard is locked, and only while copying
        let mut rows: Vec<StoredRow> = self
            .state
            .sensors
            .get(sensor_id)
            .map(|entry| entry.rows.iter().cloned().collect())
            .unwrap_or_default();
        // event_time DESC, metric_name ASC
        rows.sort_by(|a, b| {
            b.event_time
                .cmp(&a.event_time)
                .then_with(|| a.metric_name.cmp(&b.metric_name))
        });
        rows.truncate(limit);

        self.state.reads.fetch_add(1, Ordering::Relaxed);
        Ok(rows)
    }

    async fn close(self) -> Result<(), BackendError> {
        self.state.closed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
