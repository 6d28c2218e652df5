//! Per-sample fault injection.
//!
//! Every sample passes through [`FaultInjector::apply`] once. With probability
//! `p` the value is replaced by zero, ten times itself, or NaN (uniform choice)
//! and a [`FaultEvent`] is handed to the audit sink. Untouched samples are not
//! recorded anywhere.

use crate::audit::AuditSink;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Kind of corruption applied to a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultKind {
    Zero,
    Spike,
    Nan,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::Zero => "zero",
            FaultKind::Spike => "spike",
            FaultKind::Nan => "nan",
        }
    }

    /// Returns all fault kinds.
    pub fn all() -> &'static [FaultKind] {
        &[FaultKind::Zero, FaultKind::Spike, FaultKind::Nan]
    }

    /// Corrupts `value` according to this kind.
    pub fn corrupt(&self, value: f64) -> f64 {
        match self {
            FaultKind::Zero => 0.0,
            FaultKind::Spike => value * 10.0,
            FaultKind::Nan => f64::NAN,
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit record of one corrupted sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultEvent {
    /// Timestamp of the corrupted sample (the tick timestamp)
    pub timestamp: DateTime<Utc>,
    pub sensor_id: String,
    pub metric_name: String,
    pub fault_kind: FaultKind,
    /// Value actually written
    pub injected_value: f64,
    /// Value before corruption
    pub original_value: f64,
}

/// Decides, per sample, whether to corrupt it.
#[derive(Clone)]
pub struct FaultInjector {
    probability: f64,
    audit: Arc<dyn AuditSink>,
}

impl FaultInjector {
    pub fn new(probability: f64, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            probability: probability.clamp(0.0, 1.0),
            audit,
        }
    }

    /// Passes `value` through, possibly corrupted. Returns the value to write
    /// and the fault kind when one was applied.
    pub fn apply<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        sensor_id: &str,
        metric_name: &str,
        timestamp: DateTime<Utc>,
        value: f64,
    ) -> (f64, Option<FaultKind>) {
        if rng.gen::<f64>() >= self.probability {
            return (value, None);
        }

        let kind = FaultKind::all()[rng.gen_range(0..3)];
        let injected = kind.corrupt(value);

        self.audit.record(&FaultEvent {
            timestamp,
            sensor_id: sensor_id.to_string(),
            metric_name: metric_name.to_string(),
            fault_kind: kind,
            injected_value: injected,
            original_value: value,
        });

        (injected, Some(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashMap;

    #[test]
    fn test_zero_probability_never_faults() {
        let sink = Arc::new(MemoryAuditSink::new());
        let injector = FaultInjector::new(0.0, sink.clone());
        let mut rng = StdRng::seed_from_u64(3);

        for i in 0..10_000 {
            let (v, kind) = injector.apply(&mut rng, "s", "m", Utc::now(), i as f64);
            assert_eq!(v, i as f64);
            assert!(kind.is_none());
        }
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_full_probability_always_faults() {
        let sink = Arc::new(MemoryAuditSink::new());
        let injector = FaultInjector::new(1.0, sink.clone());
        let mut rng = StdRng::seed_from_u64(3);

        for _ in 0..1_000 {
            let (_, kind) = injector.apply(&mut rng, "s", "m", Utc::now(), 4.0);
            assert!(kind.is_some());
        }
        assert_eq!(sink.events().len(), 1_000);
    }

    #[test]
    fn test_out_of_range_probability_is_clamped() {
        let sink = Arc::new(MemoryAuditSink::new());
        let always = FaultInjector::new(7.5, sink.clone());
        let never = FaultInjector::new(-0.5, sink.clone());
        let mut rng = StdRng::seed_from_u64(21);

        for _ in 0..1_000 {
            assert!(always.apply(&mut rng, "s", "m", Utc::now(), 1.0).1.is_some());
            assert!(never.apply(&mut rng, "s", "m", Utc::now(), 1.0).1.is_none());
        }
        assert_eq!(sink.events().len(), 1_000);
    }

    #[test]
    fn test_fault_rate_converges() {
        let sink = Arc::new(MemoryAuditSink::new());
        let injector = FaultInjector::new(0.1, sink.clone());
        let mut rng = StdRng::seed_from_u64(11);
        let n = 200_000;

        let faulted = (0..n)
            .filter(|_| {
                injector
                    .apply(&mut rng, "s", "m", Utc::now(), 1.0)
                    .1
                    .is_some()
            })
            .count();

        let rate = faulted as f64 / n as f64;
        assert!((rate - 0.1).abs() < 0.005, "fault rate {}", rate);
        assert_eq!(sink.events().len(), faulted);
    }

    #[test]
    fn test_kinds_are_uniform() {
        let sink = Arc::new(MemoryAuditSink::new());
        let injector = FaultInjector::new(1.0, sink.clone());
        let mut rng = StdRng::seed_from_u64(5);
        let n = 30_000;

        let mut counts: HashMap<FaultKind, usize> = HashMap::new();
        for _ in 0..n {
            if let (_, Some(kind)) = injector.apply(&mut rng, "s", "m", Utc::now(), 2.0) {
                *counts.entry(kind).or_default() += 1;
            }
        }

        for kind in FaultKind::all() {
            let share = counts[kind] as f64 / n as f64;
            assert!((share - 1.0 / 3.0).abs() < 0.02, "{} share {}", kind, share);
        }
    }

    #[test]
    fn test_event_matches_injected_value() {
        let sink = Arc::new(MemoryAuditSink::new());
        let injector = FaultInjector::new(1.0, sink.clone());
        let mut rng = StdRng::seed_from_u64(9);
        let ts = Utc::now();

        for _ in 0..300 {
            let (v, kind) = injector.apply(&mut rng, "sensor_000001", "ws_temp", ts, 21.5);
            let kind = kind.unwrap();
            let event = sink.events().pop().unwrap();

            assert_eq!(event.fault_kind, kind);
            assert_eq!(event.sensor_id, "sensor_000001");
            assert_eq!(event.metric_name, "ws_temp");
            assert_eq!(event.timestamp, ts);
            assert_eq!(event.original_value, 21.5);
            match kind {
                FaultKind::Zero => assert_eq!(v, 0.0),
                FaultKind::Spike => assert_eq!(v, 215.0),
                FaultKind::Nan => assert!(v.is_nan()),
            }
            assert_eq!(v.to_bits(), event.injected_value.to_bits());
        }
    }
}
