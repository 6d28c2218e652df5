//! End-of-run report.

use crate::worker::{new_latency_histogram, FaultCounts, WorkerReport};
use hdrhistogram::Histogram;
use serde::Serialize;
use std::time::Duration;
use tracing::info;

/// Latency statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LatencyStats {
    pub count: u64,
    pub min_us: u64,
    pub max_us: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
}

impl LatencyStats {
    /// Computes latency statistics from a histogram.
    pub fn from_histogram(histogram: &Histogram<u64>) -> Self {
        if histogram.is_empty() {
            return Self::default();
        }

        Self {
            count: histogram.len(),
            min_us: histogram.min(),
            max_us: histogram.max(),
            mean_us: histogram.mean() as u64,
            p50_us: histogram.value_at_quantile(0.50),
            p95_us: histogram.value_at_quantile(0.95),
            p99_us: histogram.value_at_quantile(0.99),
        }
    }

    /// Formats latency as a human-readable string.
    pub fn format_ms(&self) -> String {
        if self.count == 0 {
            "N/A".to_string()
        } else {
            format!(
                "p50={:.1}ms p95={:.1}ms p99={:.1}ms max={:.1}ms",
                self.p50_us as f64 / 1000.0,
                self.p95_us as f64 / 1000.0,
                self.p99_us as f64 / 1000.0,
                self.max_us as f64 / 1000.0
            )
        }
    }
}

/// Aggregate of every worker that exited before the join timeout.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    // Configuration
    pub backend: String,
    pub policy: String,
    pub hotspot: bool,
    pub configured_duration: Option<Duration>,
    pub actual_duration: Duration,

    // Workers
    pub workers_spawned: usize,
    pub workers_joined: usize,
    pub workers_abandoned: usize,

    // Traffic
    pub ticks: u64,
    pub writes_ok: u64,
    pub write_errors: u64,
    pub write_resource_errors: u64,
    pub reads_ok: u64,
    pub read_errors: u64,
    pub faults: FaultCounts,
    pub write_latency: LatencyStats,

    // Connections
    pub connect_failures: u64,
    pub handles_opened: u64,
    pub handles_leaked: usize,
    pub leak_diagnostics: u64,
}

impl RunReport {
    /// Folds worker reports into the run totals.
    pub fn absorb(&mut self, workers: &[WorkerReport]) {
        let mut latency = new_latency_histogram();

        for w in workers {
            self.ticks += w.ticks;
            self.writes_ok += w.writes_ok;
            self.write_errors += w.write_errors;
            self.write_resource_errors += w.write_resource_errors;
            self.reads_ok += w.reads_ok;
            self.read_errors += w.read_errors;
            self.connect_failures += w.connect_failures;
            self.faults.merge(&w.faults);
            self.handles_opened += w.connections.opened;
            self.handles_leaked += w.connections.leaked;
            self.leak_diagnostics += w.connections.leak_diagnostics;
            let _ = latency.add(&w.write_latency);
        }

        self.workers_joined += workers.len();
        self.write_latency = LatencyStats::from_histogram(&latency);
    }

    pub fn writes_per_second(&self) -> f64 {
        if self.actual_duration.as_secs_f64() > 0.0 {
            self.writes_ok as f64 / self.actual_duration.as_secs_f64()
        } else {
            0.0
        }
    }

    /// Share of written samples that were deliberately corrupted.
    pub fn fault_ratio(&self) -> f64 {
        let attempted = self.writes_ok + self.write_errors;
        if attempted > 0 {
            self.faults.total() as f64 / attempted as f64
        } else {
            0.0
        }
    }

    /// Generates a JSON report.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Writes the final summary to the operational log.
    pub fn log_summary(&self) {
        match self.configured_duration {
            Some(d) => info!("Duration configured: {:.1}s", d.as_secs_f64()),
            None => info!("Duration configured: unbounded"),
        }
        info!("Duration actual: {:.1}s", self.actual_duration.as_secs_f64());
        info!(
            "Workers: {} spawned, {} joined, {} abandoned",
            self.workers_spawned, self.workers_joined, self.workers_abandoned
        );
        info!(
            "Writes: {} ok, {} failed ({} handle exhaustion), {:.0}/s",
            format_number(self.writes_ok),
            format_number(self.write_errors),
            format_number(self.write_resource_errors),
            self.writes_per_second()
        );
        info!(
            "Faults injected: {} (zero={}, spike={}, nan={})",
            self.faults.total(),
            self.faults.zero,
            self.faults.spike,
            self.faults.nan
        );
        info!(
            "Connections: {} opened, {} leaked, {} connect failures",
            format_number(self.handles_opened),
            self.handles_leaked,
            self.connect_failures
        );
    }

    /// Prints a summary to stdout.
    pub fn print_summary(&self) {
        println!("\n{}", "=".repeat(60));
        println!("TRAFFIC RUN RESULTS");
        println!("{}", "=".repeat(60));

        println!(
            "\nBackend: {} | Policy: {} | Hotspot: {}",
            self.backend, self.policy, self.hotspot
        );
        println!(
            "Duration: {:.1}s actual / {}",
            self.actual_duration.as_secs_f64(),
            self.configured_duration
                .map(|d| format!("{:.1}s configured", d.as_secs_f64()))
                .unwrap_or_else(|| "unbounded".to_string())
        );
        println!(
            "Workers: {} spawned, {} joined, {} abandoned",
            self.workers_spawned, self.workers_joined, self.workers_abandoned
        );

        println!("\nWRITES:");
        println!(
            "   Rows: {} ({:.0}/s)",
            format_number(self.writes_ok),
            self.writes_per_second()
        );
        println!("   Latency: {}", self.write_latency.format_ms());
        if self.write_errors > 0 {
            println!(
                "   Errors: {} ({} handle exhaustion)",
                self.write_errors, self.write_resource_errors
            );
        }

        println!("\nFAULTS:");
        println!(
            "   Injected: {} ({:.2}% of samples) zero={} spike={} nan={}",
            self.faults.total(),
            self.fault_ratio() * 100.0,
            self.faults.zero,
            self.faults.spike,
            self.faults.nan
        );

        if self.reads_ok + self.read_errors > 0 {
            println!("\nREADS:");
            println!("   Ok: {} Errors: {}", self.reads_ok, self.read_errors);
        }

        println!("\nCONNECTIONS:");
        println!(
            "   Opened: {} Leaked: {} Connect failures: {}",
            format_number(self.handles_opened),
            self.handles_leaked,
            self.connect_failures
        );

        println!("\n{}", "=".repeat(60));
    }
}

/// Formats a number with thousand separators.
fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionSummary;
    use crate::worker::WorkerState;

    fn worker_report(writes: u64, latency_us: u64) -> WorkerReport {
        let mut latency = new_latency_histogram();
        for _ in 0..writes {
            latency.record(latency_us).unwrap();
        }
        WorkerReport {
            sensor_id: "sensor_000000".to_string(),
            final_state: WorkerState::Exited,
            elapsed: Duration::from_secs(1),
            ticks: writes / 4,
            writes_ok: writes,
            write_errors: 2,
            write_resource_errors: 1,
            reads_ok: 3,
            read_errors: 0,
            connect_failures: 1,
            faults: FaultCounts {
                zero: 1,
                spike: 0,
                nan: 1,
            },
            connections: ConnectionSummary {
                opened: 5,
                leaked: 4,
                leak_diagnostics: 0,
            },
            write_latency: latency,
        }
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(123), "123");
        assert_eq!(format_number(1234), "1,234");
        assert_eq!(format_number(1234567), "1,234,567");
    }

    #[test]
    fn test_absorb_sums_workers() {
        let mut report = RunReport {
            workers_spawned: 3,
            actual_duration: Duration::from_secs(2),
            ..Default::default()
        };
        report.absorb(&[worker_report(100, 500), worker_report(200, 1500)]);

        assert_eq!(report.workers_joined, 2);
        assert_eq!(report.writes_ok, 300);
        assert_eq!(report.write_errors, 4);
        assert_eq!(report.faults.total(), 4);
        assert_eq!(report.handles_opened, 10);
        assert_eq!(report.handles_leaked, 8);
        assert_eq!(report.write_latency.count, 300);
        assert!(report.write_latency.p99_us >= 1_000);
        assert_eq!(report.writes_per_second(), 150.0);
    }

    #[test]
    fn test_empty_latency_formats_as_na() {
        let report = RunReport::default();
        assert_eq!(report.write_latency.format_ms(), "N/A");
        assert_eq!(report.fault_ratio(), 0.0);
    }

    #[test]
    fn test_json_report() {
        let mut report = RunReport {
            policy: "storm".to_string(),
            ..Default::default()
        };
        report.absorb(&[worker_report(8, 100)]);

        let value: serde_json::Value = serde_json::from_str(&report.to_json()).unwrap();
        assert_eq!(value["policy"], "storm");
        assert_eq!(value["writes_ok"], 8);
        assert_eq!(value["faults"]["nan"], 1);
    }
}
