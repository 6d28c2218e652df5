//! Append-only sinks for fault audit events.
//!
//! Sinks are shared by all workers, so every implementation must accept
//! concurrent `record` calls. A sink never fails the caller: write errors are
//! reported on the operational log and dropped. [`FileAuditSink`] hands lines
//! to a dedicated writer thread, so `record` never touches the file from an
//! async task.

use crate::config::AuditFormat;
use crate::fault::FaultEvent;
use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Destination for [`FaultEvent`]s.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &FaultEvent);
}

/// Appends one line per event to a file.
///
/// Lines are queued to a background thread that writes them in order and
/// flushes whenever the queue runs empty. Dropping the sink drains the queue
/// and waits for the thread.
pub struct FileAuditSink {
    sender: Option<mpsc::UnboundedSender<String>>,
    writer: Option<JoinHandle<()>>,
    format: AuditFormat,
}

impl FileAuditSink {
    /// Opens (or creates) `path` in append mode and starts the writer thread.
    pub fn open(path: impl AsRef<Path>, format: AuditFormat) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        let (sender, rx) = mpsc::unbounded_channel();

        let writer = thread::Builder::new()
            .name("fault-audit-writer".to_string())
            .spawn(move || write_lines(BufWriter::new(file), rx))?;

        Ok(Self {
            sender: Some(sender),
            writer: Some(writer),
            format,
        })
    }

    fn format_line(&self, event: &FaultEvent) -> String {
        match self.format {
            AuditFormat::Text => format!(
                "{} [WARNING] {} | Sensor={} | Metric={} | Fault={} | Value={}",
                Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                event.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
                event.sensor_id,
                event.metric_name,
                event.fault_kind,
                event.injected_value
            ),
            // NaN has no JSON representation and serializes as null
            AuditFormat::Json => serde_json::to_string(event).unwrap_or_else(|e| {
                format!("{{\"error\":\"{}\"}}", e)
            }),
        }
    }
}

impl AuditSink for FileAuditSink {
    fn record(&self, event: &FaultEvent) {
        let line = self.format_line(event);
        let sent = self
            .sender
            .as_ref()
            .map_or(false, |sender| sender.send(line).is_ok());
        if !sent {
            error!("Fault audit writer has stopped, dropping record");
        }
    }
}

impl Drop for FileAuditSink {
    fn drop(&mut self) {
        // Closing the channel ends the writer once the queue is drained
        self.sender.take();
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                error!("Fault audit writer panicked");
            }
        }
    }
}

/// Writer thread body: runs until every sender is gone.
fn write_lines(mut writer: BufWriter<File>, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = rx.blocking_recv() {
        let mut result = writeln!(writer, "{}", line);
        while result.is_ok() {
            match rx.try_recv() {
                Ok(line) => result = writeln!(writer, "{}", line),
                Err(_) => break,
            }
        }
        if let Err(e) = result.and_then(|_| writer.flush()) {
            error!("Failed to append fault audit record: {}", e);
        }
    }
    debug!("Fault audit writer stopped");
}

/// Collects events in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<FaultEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every event recorded so far.
    pub fn events(&self) -> Vec<FaultEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: &FaultEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Emits events on the `fault_audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &FaultEvent) {
        warn!(
            target: "fault_audit",
            sensor = %event.sensor_id,
            metric = %event.metric_name,
            fault = %event.fault_kind,
            value = event.injected_value,
            "{} | Sensor={} | Metric={} | Fault={} | Value={}",
            event.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            event.sensor_id,
            event.metric_name,
            event.fault_kind,
            event.injected_value
        );
    }
}
