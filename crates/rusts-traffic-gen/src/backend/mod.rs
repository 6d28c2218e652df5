//! Storage backend abstraction.
//!
//! The generator treats the target cluster as an opaque write/read sink. A
//! [`Backend`] opens [`Session`]s; a session is the connection handle a worker
//! owns (or leaks) according to its connection policy.

pub mod http;
pub mod memory;

pub use http::HttpBackend;
pub use memory::{MemoryBackend, MemorySession};

use crate::error::BackendError;
use crate::metrics::TelemetrySample;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Rows returned by a bounded read.
pub const READ_LIMIT: usize = 10;

/// A row as read back from the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRow {
    pub sensor_id: String,
    pub event_time: DateTime<Utc>,
    pub metric_name: String,
    pub value: f64,
    pub unit: String,
}

impl From<&TelemetrySample> for StoredRow {
    fn from(sample: &TelemetrySample) -> Self {
        Self {
            sensor_id: sample.sensor_id.clone(),
            event_time: sample.timestamp,
            metric_name: sample.metric_name.clone(),
            value: sample.value,
            unit: sample.unit.clone(),
        }
    }
}

/// An open connection to the backend.
#[async_trait]
pub trait Session: Send + Sync + Sized + 'static {
    /// Runs a schema statement.
    async fn execute(&self, statement: &str) -> Result<(), BackendError>;

    /// Appends one telemetry row.
    async fn insert(&self, sample: &TelemetrySample) -> Result<(), BackendError>;

    /// Fetches at most `limit` of the most recent rows for `sensor_id`.
    async fn recent(&self, sensor_id: &str, limit: usize) -> Result<Vec<StoredRow>, BackendError>;

    /// Releases the connection.
    async fn close(self) -> Result<(), BackendError>;
}

/// Factory for sessions against one target cluster.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    type Session: Session;

    /// Opens a new session.
    async fn connect(&self) -> Result<Self::Session, BackendError>;

    /// Short human-readable description of the target.
    fn describe(&self) -> String;
}
