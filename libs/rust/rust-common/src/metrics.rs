//! Prometheus text metrics helpers.
//!
//! Lock-free counters and gauges that render themselves in the Prometheus
//! text exposition format.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

/// Something that can render itself as Prometheus exposition text.
pub trait PrometheusMetric {
    /// Render the `# HELP`, `# TYPE` and sample lines.
    fn to_prometheus(&self) -> String;
}

fn render(name: &str, help: &str, kind: &str, value: u64) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    let _ = writeln!(out, "{name} {value}");
    out
}

/// Concatenate several metrics into one exposition document.
#[must_use]
pub fn render_all(metrics: &[&dyn PrometheusMetric]) -> String {
    metrics.iter().map(|m| m.to_prometheus()).collect()
}

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    name: String,
    help: String,
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter.
    #[must_use]
    pub fn new(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            value: AtomicU64::new(0),
        }
    }

    /// Increment the counter by 1.
    pub fn inc(&self) {
        self.inc_by(1);
    }

    /// Increment the counter by a specific amount.
    pub fn inc_by(&self, amount: u64) {
        self.value.fetch_add(amount, Ordering::Relaxed);
    }

    /// Get the current value.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Get the metric name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PrometheusMetric for Counter {
    fn to_prometheus(&self) -> String {
        render(&self.name, &self.help, "counter", self.get())
    }
}

/// A gauge that can move in both directions; never goes below zero.
#[derive(Debug)]
pub struct Gauge {
    name: String,
    help: String,
    value: AtomicU64,
}

impl Gauge {
    /// Create a new gauge.
    #[must_use]
    pub fn new(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            value: AtomicU64::new(0),
        }
    }

    /// Set the gauge value.
    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Set the gauge to 1 for `true`, 0 for `false`.
    pub fn set_flag(&self, flag: bool) {
        self.set(u64::from(flag));
    }

    /// Increment the gauge by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement the gauge by 1, saturating at zero.
    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    /// Get the current value.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Get the metric name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PrometheusMetric for Gauge {
    fn to_prometheus(&self) -> String {
        render(&self.name, &self.help, "gauge", self.get())
    }
}
