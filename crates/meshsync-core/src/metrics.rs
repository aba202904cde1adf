//! Sync observability
//!
//! Small numeric helpers plus a process-wide [`SyncMetrics`] registry whose
//! [`MetricsSnapshot`] the mediator logs and broadcasts.

use parking_lot::Mutex;
use serde::Serialize;

use crate::mapping::parse_signed_timestamp_ms;
use crate::sync::adapter::WindowStats;
use crate::sync::transfer::serialized_len;
use crate::types::Operation;

/// Running count/total/max of non-negative samples
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct AggregateMetric {
    pub count: u64,
    pub total: f64,
    pub max: f64,
}

impl AggregateMetric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Negative and non-finite samples are ignored.
    pub fn add_sample(&mut self, sample: f64) {
        if !sample.is_finite() || sample < 0.0 {
            return;
        }
        self.count += 1;
        self.total += sample;
        if sample > self.max {
            self.max = sample;
        }
    }

    /// Mean of the samples; 0.0 when there are none
    pub fn average(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.total / self.count as f64
    }
}

/// A payload whose wire size is being measured
#[derive(Debug, Clone, Copy)]
pub enum Payload<'a> {
    Text(&'a str),
    Binary(&'a [u8]),
    Json(&'a serde_json::Value),
}

impl<'a> From<&'a str> for Payload<'a> {
    fn from(text: &'a str) -> Self {
        Payload::Text(text)
    }
}

impl<'a> From<&'a [u8]> for Payload<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        Payload::Binary(bytes)
    }
}

impl<'a> From<&'a serde_json::Value> for Payload<'a> {
    fn from(value: &'a serde_json::Value) -> Self {
        Payload::Json(value)
    }
}

/// UTF-8 length for text, raw length for bytes, serialized JSON length otherwise
pub fn message_bytes<'a>(payload: impl Into<Payload<'a>>) -> usize {
    match payload.into() {
        Payload::Text(text) => text.len(),
        Payload::Binary(bytes) => bytes.len(),
        Payload::Json(value) => serialized_len(value),
    }
}

/// Milliseconds between each operation's signing and `now_ms`.
///
/// Operations without a parseable `signature.signed` are skipped; clock skew
/// into the future clamps to zero.
pub fn collect_queue_delay_samples(operations: &[Operation], now_ms: i64) -> Vec<i64> {
    operations
        .iter()
        .filter_map(|op| op.signed_at())
        .filter(|signed| !signed.is_empty())
        .filter_map(parse_signed_timestamp_ms)
        .map(|ts| now_ms.saturating_sub(ts).max(0))
        .collect()
}

/// `numerator / denominator`, or 0 when that would not be a finite number
pub fn safe_rate(numerator: f64, denominator: f64) -> f64 {
    if !numerator.is_finite() || !denominator.is_finite() || denominator <= 0.0 {
        return 0.0;
    }
    numerator / denominator
}

#[derive(Debug, Default)]
struct Counters {
    sessions_started: u64,
    sessions_completed: u64,
    sessions_failed: u64,
    windows: u64,
    windows_capped_by_rounds: u64,
    windows_capped_by_records: u64,
    have_ids: u64,
    need_ids: u64,
    ops_requested: u64,
    ops_pushed: u64,
    ops_received: u64,
    ops_rejected: u64,
    legacy_batches: u64,
    duplicate_batches: u64,
    messages_sent: u64,
    messages_received: u64,
    bytes_sent: u64,
    bytes_received: u64,
    rounds_per_window: AggregateMetric,
    window_duration_ms: AggregateMetric,
    session_duration_ms: AggregateMetric,
    queue_delay_ms: AggregateMetric,
}

/// Process-wide sync counters
#[derive(Debug, Default)]
pub struct SyncMetrics {
    counters: Mutex<Counters>,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_started(&self) {
        self.counters.lock().sessions_started += 1;
    }

    pub fn session_finished(&self, duration_ms: u64, ok: bool) {
        let mut c = self.counters.lock();
        if ok {
            c.sessions_completed += 1;
        } else {
            c.sessions_failed += 1;
        }
        c.session_duration_ms.add_sample(duration_ms as f64);
    }

    pub fn record_window(&self, stats: &WindowStats, have: usize, need: usize) {
        let mut c = self.counters.lock();
        c.windows += 1;
        c.windows_capped_by_rounds += u64::from(stats.capped_by_rounds);
        c.windows_capped_by_records += u64::from(stats.capped_by_records);
        c.have_ids += have as u64;
        c.need_ids += need as u64;
        c.rounds_per_window.add_sample(f64::from(stats.rounds));
        c.window_duration_ms.add_sample(stats.duration_ms as f64);
    }

    pub fn ops_requested(&self, count: usize) {
        self.counters.lock().ops_requested += count as u64;
    }

    pub fn ops_pushed(&self, count: usize) {
        self.counters.lock().ops_pushed += count as u64;
    }

    /// Received operations, with their signing-to-now delays
    pub fn ops_received(&self, operations: &[Operation], now_ms: i64) {
        let mut c = self.counters.lock();
        c.ops_received += operations.len() as u64;
        for delay in collect_queue_delay_samples(operations, now_ms) {
            c.queue_delay_ms.add_sample(delay as f64);
        }
    }

    pub fn ops_rejected(&self, count: usize) {
        self.counters.lock().ops_rejected += count as u64;
    }

    pub fn legacy_batch(&self, duplicate: bool) {
        let mut c = self.counters.lock();
        c.legacy_batches += 1;
        c.duplicate_batches += u64::from(duplicate);
    }

    pub fn message_sent(&self, bytes: usize) {
        let mut c = self.counters.lock();
        c.messages_sent += 1;
        c.bytes_sent += bytes as u64;
    }

    pub fn message_received(&self, bytes: usize) {
        let mut c = self.counters.lock();
        c.messages_received += 1;
        c.bytes_received += bytes as u64;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = self.counters.lock();
        MetricsSnapshot {
            sessions_started: c.sessions_started,
            sessions_completed: c.sessions_completed,
            sessions_failed: c.sessions_failed,
            windows: c.windows,
            windows_capped_by_rounds: c.windows_capped_by_rounds,
            windows_capped_by_records: c.windows_capped_by_records,
            round_cap_rate: safe_rate(c.windows_capped_by_rounds as f64, c.windows as f64),
            record_cap_rate: safe_rate(c.windows_capped_by_records as f64, c.windows as f64),
            have_ids: c.have_ids,
            need_ids: c.need_ids,
            ops_requested: c.ops_requested,
            ops_pushed: c.ops_pushed,
            ops_received: c.ops_received,
            ops_rejected: c.ops_rejected,
            reject_rate: safe_rate(c.ops_rejected as f64, c.ops_received as f64),
            legacy_batches: c.legacy_batches,
            duplicate_batches: c.duplicate_batches,
            messages_sent: c.messages_sent,
            messages_received: c.messages_received,
            bytes_sent: c.bytes_sent,
            bytes_received: c.bytes_received,
            avg_rounds_per_window: c.rounds_per_window.average(),
            max_rounds_per_window: c.rounds_per_window.max,
            avg_window_duration_ms: c.window_duration_ms.average(),
            avg_session_duration_ms: c.session_duration_ms.average(),
            avg_queue_delay_ms: c.queue_delay_ms.average(),
            max_queue_delay_ms: c.queue_delay_ms.max,
        }
    }
}

/// Point-in-time view of [`SyncMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub sessions_started: u64,
    pub sessions_completed: u64,
    pub sessions_failed: u64,
    pub windows: u64,
    pub windows_capped_by_rounds: u64,
    pub windows_capped_by_records: u64,
    pub round_cap_rate: f64,
    pub record_cap_rate: f64,
    pub have_ids: u64,
    pub need_ids: u64,
    pub ops_requested: u64,
    pub ops_pushed: u64,
    pub ops_received: u64,
    pub ops_rejected: u64,
    pub reject_rate: f64,
    pub legacy_batches: u64,
    pub duplicate_batches: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub avg_rounds_per_window: f64,
    pub max_rounds_per_window: f64,
    pub avg_window_duration_ms: f64,
    pub avg_session_duration_ms: f64,
    pub avg_queue_delay_ms: f64,
    pub max_queue_delay_ms: f64,
}
