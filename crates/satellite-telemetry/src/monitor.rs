//! Subsystem instrumentation.
//!
//! A `Monitor` owns its own prometheus registry and is handed explicitly to
//! whoever records into it; nothing here is process-global. Metric names
//! follow `satellite_<area>_<metric>`.

use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::TelemetryError;

/// Counters and gauges describing the subsystem lifecycle.
#[derive(Clone)]
pub struct Monitor {
    registry: Registry,
    runs: IntCounterVec,
    failures: IntCounterVec,
    closes: IntCounterVec,
    close_failures: IntCounterVec,
    segments: IntGaugeVec,
}

impl Monitor {
    /// Create a monitor with a fresh registry.
    pub fn new() -> Result<Self, TelemetryError> {
        let registry = Registry::new_custom(Some("satellite".to_string()), None)
            .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;

        let runs = counter_vec(
            &registry,
            "subsystem_runs_total",
            "Subsystem tasks launched by the supervisor",
        )?;
        let failures = counter_vec(
            &registry,
            "subsystem_failures_total",
            "Subsystem tasks that exited with a non-cancellation error",
        )?;
        let closes = counter_vec(
            &registry,
            "subsystem_closes_total",
            "Close calls issued by the supervisor",
        )?;
        let close_failures = counter_vec(
            &registry,
            "subsystem_close_failures_total",
            "Close calls that returned an error",
        )?;

        let segments = IntGaugeVec::new(
            Opts::new("metainfo_segments", "Segments seen by the last metrics pass"),
            &["kind"],
        )
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
        registry
            .register(Box::new(segments.clone()))
            .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;

        Ok(Self {
            registry,
            runs,
            failures,
            closes,
            close_failures,
            segments,
        })
    }

    pub fn record_run(&self, subsystem: &str) {
        self.runs.with_label_values(&[subsystem]).inc();
    }

    pub fn record_failure(&self, subsystem: &str) {
        self.failures.with_label_values(&[subsystem]).inc();
    }

    pub fn record_close(&self, subsystem: &str, ok: bool) {
        self.closes.with_label_values(&[subsystem]).inc();
        if !ok {
            self.close_failures.with_label_values(&[subsystem]).inc();
        }
    }

    pub fn set_segment_count(&self, kind: &str, count: u64) {
        let value = i64::try_from(count).unwrap_or(i64::MAX);
        self.segments.with_label_values(&[kind]).set(value);
    }

    pub fn runs(&self, subsystem: &str) -> u64 {
        self.runs.with_label_values(&[subsystem]).get()
    }

    pub fn failures(&self, subsystem: &str) -> u64 {
        self.failures.with_label_values(&[subsystem]).get()
    }

    pub fn closes(&self, subsystem: &str) -> u64 {
        self.closes.with_label_values(&[subsystem]).get()
    }

    pub fn close_failures(&self, subsystem: &str) -> u64 {
        self.close_failures.with_label_values(&[subsystem]).get()
    }

    /// Sum of a counter over every subsystem label.
    pub fn total_failures(&self) -> u64 {
        sum_counter(&self.failures)
    }

    pub fn total_runs(&self) -> u64 {
        sum_counter(&self.runs)
    }

    pub fn total_closes(&self) -> u64 {
        sum_counter(&self.closes)
    }

    pub fn segment_count(&self, kind: &str) -> i64 {
        self.segments.with_label_values(&[kind]).get()
    }

    /// Render every metric in the prometheus text format.
    pub fn gather_text(&self) -> Result<String, TelemetryError> {
        TextEncoder::new()
            .encode_to_string(&self.registry.gather())
            .map_err(|e| TelemetryError::MetricsInit(e.to_string()))
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str) -> Result<IntCounterVec, TelemetryError> {
    let counter = IntCounterVec::new(Opts::new(name, help), &["subsystem"])
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    registry
        .register(Box::new(counter.clone()))
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    Ok(counter)
}

fn sum_counter(counter: &IntCounterVec) -> u64 {
    use prometheus::core::Collector;

    counter
        .collect()
        .iter()
        .flat_map(|family| family.get_metric())
        .map(|metric| metric.get_counter().get_value() as u64)
        .sum()
}
