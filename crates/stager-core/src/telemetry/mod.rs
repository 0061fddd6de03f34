//! Process-wide metrics registry.
//!
//! Samples are kept per series: the metric name together with the labels given at the
//! call site, so a counter such as `stager.media.read.bytes` can be read per media type
//! or summed over all of them. Without the `telemetry` feature every call is a no-op and
//! snapshots are empty.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

pub mod stage;
pub mod tags;

/// One metric name with its sorted label pairs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Series {
    pub name: String,
    pub labels: Vec<(String, String)>,
}

impl Series {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect();
        labels.sort();
        labels.dedup_by(|later, earlier| later.0 == earlier.0);
        Self {
            name: name.to_owned(),
            labels,
        }
    }

    /// True when the series is `name` and carries every pair of `labels`.
    pub fn matches(&self, name: &str, labels: &[(&str, &str)]) -> bool {
        self.name == name
            && labels.iter().all(|(key, value)| {
                self.labels
                    .iter()
                    .any(|(have_key, have_value)| have_key == key && have_value == value)
            })
    }
}

impl fmt::Display for Series {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if self.labels.is_empty() {
            return Ok(());
        }
        f.write_str("{")?;
        for (idx, (key, value)) in self.labels.iter().enumerate() {
            if idx > 0 {
                f.write_str(",")?;
            }
            write!(f, "{key}={value}")?;
        }
        f.write_str("}")
    }
}

/// Histogram summary of one or more series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub total: u64,
    pub min: u64,
    pub max: u64,
}

impl HistogramSnapshot {
    fn record(&mut self, value: u64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count = self.count.saturating_add(1);
        self.total = self.total.saturating_add(value);
    }

    fn merge(&mut self, other: &Self) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.count = self.count.saturating_add(other.count);
        self.total = self.total.saturating_add(other.total);
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total as f64 / self.count as f64
        }
    }
}

/// Point-in-time copy of every series.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub counters: Vec<(Series, u64)>,
    pub gauges: Vec<(Series, u64)>,
    pub histograms: Vec<(Series, HistogramSnapshot)>,
}

impl TelemetrySnapshot {
    /// Counter summed over all series named `name`.
    pub fn counter(&self, name: &str) -> Option<u64> {
        self.counter_with(name, &[])
    }

    /// Counter summed over the series named `name` that carry `labels`.
    pub fn counter_with(&self, name: &str, labels: &[(&str, &str)]) -> Option<u64> {
        sum(&self.counters, name, labels)
    }

    pub fn gauge(&self, name: &str) -> Option<u64> {
        sum(&self.gauges, name, &[])
    }

    /// Histogram merged over the series named `name` that carry `labels`.
    pub fn histogram_with(&self, name: &str, labels: &[(&str, &str)]) -> Option<HistogramSnapshot> {
        let mut merged: Option<HistogramSnapshot> = None;
        for (series, value) in &self.histograms {
            if series.matches(name, labels) {
                merged.get_or_insert_with(HistogramSnapshot::default).merge(value);
            }
        }
        merged
    }
}

fn sum(values: &[(Series, u64)], name: &str, labels: &[(&str, &str)]) -> Option<u64> {
    values
        .iter()
        .filter(|(series, _)| series.matches(name, labels))
        .map(|(_, value)| *value)
        .reduce(u64::saturating_add)
}

#[inline]
pub fn increment_counter(name: &'static str, value: u64, labels: &[(&str, &str)]) {
    registry::increment_counter(name, value, labels);
}

#[inline]
pub fn record_histogram(name: &'static str, value: u64, labels: &[(&str, &str)]) {
    registry::record_histogram(name, value, labels);
}

#[inline]
pub fn set_gauge(name: &'static str, value: u64, labels: &[(&str, &str)]) {
    registry::set_gauge(name, value, labels);
}

#[inline]
pub fn add_gauge(name: &'static str, delta: u64, labels: &[(&str, &str)]) {
    registry::adjust_gauge(name, labels, |gauge| gauge.saturating_add(delta));
}

/// Subtracts `delta` from a gauge, stopping at zero.
#[inline]
pub fn sub_gauge_saturating(name: &'static str, delta: u64, labels: &[(&str, &str)]) {
    registry::adjust_gauge(name, labels, |gauge| gauge.saturating_sub(delta));
}

/// Microseconds since `started_at`, clamped to `u64::MAX`.
#[inline]
pub fn elapsed_us(started_at: Instant) -> u64 {
    started_at.elapsed().as_micros().min(u64::MAX as u128) as u64
}

pub fn snapshot() -> TelemetrySnapshot {
    registry::snapshot()
}

#[cfg(feature = "telemetry")]
mod registry {
    use std::collections::HashMap;
    use std::sync::{Mutex, OnceLock};

    use super::{HistogramSnapshot, Series, TelemetrySnapshot};
    use crate::sync::lock_unpoisoned;

    #[derive(Default)]
    struct Store {
        counters: Mutex<HashMap<Series, u64>>,
        gauges: Mutex<HashMap<Series, u64>>,
        histograms: Mutex<HashMap<Series, HistogramSnapshot>>,
    }

    fn store() -> &'static Store {
        static STORE: OnceLock<Store> = OnceLock::new();
        STORE.get_or_init(Store::default)
    }

    pub(super) fn increment_counter(name: &str, value: u64, labels: &[(&str, &str)]) {
        let mut counters = lock_unpoisoned(&store().counters);
        let entry = counters.entry(Series::new(name, labels)).or_insert(0);
        *entry = entry.saturating_add(value);
    }

    pub(super) fn record_histogram(name: &str, value: u64, labels: &[(&str, &str)]) {
        lock_unpoisoned(&store().histograms)
            .entry(Series::new(name, labels))
            .or_default()
            .record(value);
    }

    pub(super) fn set_gauge(name: &str, value: u64, labels: &[(&str, &str)]) {
        lock_unpoisoned(&store().gauges).insert(Series::new(name, labels), value);
    }

    pub(super) fn adjust_gauge(name: &str, labels: &[(&str, &str)], adjust: impl FnOnce(u64) -> u64) {
        let mut gauges = lock_unpoisoned(&store().gauges);
        let entry = gauges.entry(Series::new(name, labels)).or_insert(0);
        *entry = adjust(*entry);
    }

    pub(super) fn snapshot() -> TelemetrySnapshot {
        fn sorted<T: Copy>(map: &HashMap<Series, T>) -> Vec<(Series, T)> {
            let mut values: Vec<_> = map.iter().map(|(series, value)| (series.clone(), *value)).collect();
            values.sort_by(|left, right| left.0.cmp(&right.0));
            values
        }

        TelemetrySnapshot {
            counters: sorted(&lock_unpoisoned(&store().counters)),
            gauges: sorted(&lock_unpoisoned(&store().gauges)),
            histograms: sorted(&lock_unpoisoned(&store().histograms)),
        }
    }
}

#[cfg(not(feature = "telemetry"))]
mod registry {
    use super::TelemetrySnapshot;

    pub(super) fn increment_counter(_name: &str, _value: u64, _labels: &[(&str, &str)]) {}

    pub(super) fn record_histogram(_name: &str, _value: u64, _labels: &[(&str, &str)]) {}

    pub(super) fn set_gauge(_name: &str, _value: u64, _labels: &[(&str, &str)]) {}

    pub(super) fn adjust_gauge(_name: &str, _labels: &[(&str, &str)], _adjust: impl FnOnce(u64) -> u64) {}

    pub(super) fn snapshot() -> TelemetrySnapshot {
        TelemetrySnapshot::default()
    }
}
