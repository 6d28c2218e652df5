//! Synthetic sensor-telemetry traffic generator for stressing RusTs deployments.
//!
//! Every worker impersonates one sensor and writes a reading per metric on
//! each tick, at a configurable rate with jitter. On top of the steady write
//! load the generator can:
//!
//! - corrupt samples on purpose (zero, 10x spike, NaN) and audit each one
//! - issue bounded reads against random sensors (read storm)
//! - focus all traffic on a single partition (hotspot)
//! - open a fresh connection per tick (connection storm), optionally never
//!   closing it (leak mode)
//! - burn CPU between ticks (cpu spike)
//!
//! # Usage
//! ```bash
//! # Steady load against a local server for ten minutes
//! rusts-traffic-gen --hosts localhost --workers 50 --duration 10
//!
//! # Connection storm with leaked handles, dry run in memory
//! rusts-traffic-gen --backend memory --connection-storm --leak-mode
//! ```

pub mod audit;
pub mod backend;
pub mod config;
pub mod connection;
pub mod error;
pub mod fault;
pub mod metrics;
pub mod report;
pub mod schema;
pub mod worker;
pub mod workload;

pub use audit::{AuditSink, FileAuditSink, MemoryAuditSink, TracingAuditSink};
pub use backend::{Backend, HttpBackend, MemoryBackend, Session, StoredRow};
pub use config::{RunConfig, HOTSPOT_SENSOR_ID};
pub use connection::{ConnectionManager, ConnectionPolicy};
pub use error::{BackendError, FailureClass, Result, TrafficError};
pub use fault::{FaultEvent, FaultInjector, FaultKind};
pub use metrics::{default_metrics, MetricDefinition, TelemetrySample};
pub use report::RunReport;
pub use worker::{SensorWorker, WorkerReport, WorkerState};
pub use workload::run_workload;
