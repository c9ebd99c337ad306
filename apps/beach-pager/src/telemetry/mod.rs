use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub mod logging;

fn env_truthy(var: &str) -> Option<bool> {
    std::env::var(var)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .ok()
}

static PERF_ENABLED: Lazy<bool> = Lazy::new(|| {
    env_truthy("BEACH_PERF")
        .or_else(|| env_truthy("BEACH_TELEMETRY"))
        .unwrap_or(false)
});

static STATS: Lazy<Mutex<HashMap<&'static str, PerfStat>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

static GAUGES: Lazy<Mutex<HashMap<&'static str, GaugeStat>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

#[derive(Default)]
struct GaugeStat {
    last: u64,
    max: u64,
    samples: u64,
}

#[derive(Default)]
struct PerfStat {
    total_ns: u128,
    max_ns: u128,
    count: u64,
}

pub fn enabled() -> bool {
    *PERF_ENABLED
}

pub fn record_duration(label: &'static str, duration: Duration) {
    if !enabled() {
        return;
    }
    let mut stats = STATS.lock();
    let entry = stats.entry(label).or_default();
    entry.count += 1;
    let nanos = duration.as_nanos();
    entry.total_ns += nanos;
    entry.max_ns = entry.max_ns.max(nanos);
    if entry.count % 200 == 0 {
        log_stat(label, entry);
    }
}

pub fn record_gauge(label: &'static str, value: u64) {
    if !enabled() {
        return;
    }
    let mut gauges = GAUGES.lock();
    let entry = gauges.entry(label).or_default();
    entry.last = value;
    entry.max = entry.max.max(value);
    entry.samples = entry.samples.saturating_add(1);
    if entry.samples % 200 == 0 {
        tracing::info!(
            target = "pager::perf",
            label,
            last = entry.last,
            max = entry.max,
            samples = entry.samples,
            "gauge"
        );
    }
}

/// Logs every recorded timer and gauge; called once at shutdown.
pub fn flush() {
    if !enabled() {
        return;
    }
    for (label, stat) in STATS.lock().iter() {
        log_stat(*label, stat);
    }
    for (label, gauge) in GAUGES.lock().iter() {
        tracing::info!(
            target = "pager::perf",
            label = *label,
            last = gauge.last,
            max = gauge.max,
            samples = gauge.samples,
            "gauge"
        );
    }
}

fn log_stat(label: &'static str, stat: &PerfStat) {
    let avg_ns = if stat.count > 0 {
        stat.total_ns / stat.count as u128
    } else {
        0
    };
    let avg_us = (avg_ns as f64 / 10.0).round() / 100.0;
    let max_us = (stat.max_ns as f64 / 10.0).round() / 100.0;
    tracing::info!(
        target = "pager::perf",
        label,
        count = stat.count,
        avg_us,
        max_us,
        "timer"
    );
}

pub struct PerfGuard {
    label: &'static str,
    start: Instant,
}

impl PerfGuard {
    pub fn new(label: &'static str) -> Option<Self> {
        if !enabled() {
            return None;
        }
        Some(Self {
            label,
            start: Instant::now(),
        })
    }
}

impl Drop for PerfGuard {
    fn drop(&mut self) {
        record_duration(self.label, self.start.elapsed());
    }
}
