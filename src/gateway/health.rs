//! Connection health tracking
//!
//! Process-wide rolling window over the last hour: availability changes,
//! a bounded ring of heartbeat latencies, and reconnect starts. The
//! composite score weighs uptime 50%, heartbeat p95 30%, reconnects 20%.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;

const LATENCY_RING_SIZE: usize = 256;

fn window() -> Duration {
    Duration::hours(1)
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub uptime_percent: f64,
    pub heartbeat_p95_ms: f64,
    pub reconnect_count: u32,
    pub score: f64,
}

#[derive(Debug)]
struct HealthInner {
    /// (timestamp, became_available)
    availability_changes: VecDeque<(DateTime<Utc>, bool)>,
    /// Availability state as of the oldest retained change.
    state_before_window: bool,
    latencies_ms: VecDeque<f64>,
    reconnect_starts: VecDeque<DateTime<Utc>>,
    started_at: DateTime<Utc>,
}

/// Rolling connection health. Shared via `Arc`, owned by the session
/// manager; everything else reads snapshots.
#[derive(Debug)]
pub struct ConnectionHealth {
    inner: Mutex<HealthInner>,
}

impl ConnectionHealth {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HealthInner {
                availability_changes: VecDeque::new(),
                state_before_window: false,
                latencies_ms: VecDeque::with_capacity(LATENCY_RING_SIZE),
                reconnect_starts: VecDeque::new(),
                started_at: Utc::now(),
            }),
        }
    }

    pub fn record_availability(&self, available: bool) {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        inner.availability_changes.push_back((now, available));
        Self::prune(&mut inner, now);
    }

    pub fn record_heartbeat_latency(&self, latency_ms: f64) {
        let mut inner = self.inner.lock();
        if inner.latencies_ms.len() >= LATENCY_RING_SIZE {
            inner.latencies_ms.pop_front();
        }
        inner.latencies_ms.push_back(latency_ms);
    }

    pub fn record_reconnect_start(&self) {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        inner.reconnect_starts.push_back(now);
        Self::prune(&mut inner, now);
    }

    fn prune(inner: &mut HealthInner, now: DateTime<Utc>) {
        let cutoff = now - window();
        while let Some(&(ts, available)) = inner.availability_changes.front() {
            if ts < cutoff {
                inner.state_before_window = available;
                inner.availability_changes.pop_front();
            } else {
                break;
            }
        }
        while inner
            .reconnect_starts
            .front()
            .is_some_and(|ts| *ts < cutoff)
        {
            inner.reconnect_starts.pop_front();
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        Self::prune(&mut inner, now);

        let uptime_percent = Self::uptime_percent(&inner, now);
        let heartbeat_p95_ms = Self::p95(&inner.latencies_ms);
        let reconnect_count = inner.reconnect_starts.len() as u32;

        let score = (0.5 * uptime_percent
            + 0.3 * (100.0 - heartbeat_p95_ms / 2.0).max(0.0)
            + 0.2 * (100.0 - reconnect_count as f64 * 20.0).max(0.0))
        .clamp(0.0, 100.0);

        HealthSnapshot {
            uptime_percent,
            heartbeat_p95_ms,
            reconnect_count,
            score,
        }
    }

    fn uptime_percent(inner: &HealthInner, now: DateTime<Utc>) -> f64 {
        // The window starts at the later of (now - 1h) and process start,
        // so a freshly started healthy process is not penalised for the
        // hour it did not exist.
        let window_start = (now - window()).max(inner.started_at);
        let window_ms = (now - window_start).num_milliseconds().max(1) as f64;

        let mut available = inner.state_before_window;
        let mut cursor = window_start;
        let mut up_ms = 0i64;

        for &(ts, became_available) in &inner.availability_changes {
            let ts = ts.max(window_start);
            if available {
                up_ms += (ts - cursor).num_milliseconds();
            }
            cursor = ts;
            available = became_available;
        }
        if available {
            up_ms += (now - cursor).num_milliseconds();
        }

        (up_ms as f64 / window_ms * 100.0).clamp(0.0, 100.0)
    }

    fn p95(latencies: &VecDeque<f64>) -> f64 {
        if latencies.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = latencies.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let index = ((sorted.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
        sorted[index]
    }
}

impl Default for ConnectionHealth {
    fn default() -> Self {
        Self::new()
    }
}
