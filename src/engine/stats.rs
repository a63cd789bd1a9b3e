// Live relay statistics: active sessions, open upstream connections, bytes relayed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

/// Rate window for `relay_bps`. Readers inside a window share the last computed rate.
const RATE_WINDOW: Duration = Duration::from_secs(1);

struct StatsSample {
    at: Instant,
    relayed_bytes: u64,
    bps: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub sessions_total: u64,
    pub active_sessions: u64,
    pub open_upstreams: u64,
    pub relayed_bytes_total: u64,
    pub relay_bps: u64,
    pub upstream_failures: u64,
    pub aborted_streams: u64,
}

pub struct StatsCollector {
    sessions_total: AtomicU64,
    active_sessions: AtomicU64,
    open_upstreams: AtomicU64,
    relayed_bytes_total: AtomicU64,
    upstream_failures: AtomicU64,
    aborted_streams: AtomicU64,
    last_sample: Mutex<StatsSample>,
    rate_window: Duration,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::with_rate_window(RATE_WINDOW)
    }

    pub fn with_rate_window(rate_window: Duration) -> Self {
        Self {
            sessions_total: AtomicU64::new(0),
            active_sessions: AtomicU64::new(0),
            open_upstreams: AtomicU64::new(0),
            relayed_bytes_total: AtomicU64::new(0),
            upstream_failures: AtomicU64::new(0),
            aborted_streams: AtomicU64::new(0),
            last_sample: Mutex::new(StatsSample {
                at: Instant::now(),
                relayed_bytes: 0,
                bps: 0,
            }),
            rate_window,
        }
    }

    /// Returns the new session's sequence number.
    pub fn session_opened(&self) -> u64 {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        self.sessions_total.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn session_closed(&self) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn upstream_opened(&self) {
        self.open_upstreams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn upstream_closed(&self) {
        self.open_upstreams.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_relayed(&self, bytes: u64) {
        self.relayed_bytes_total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_upstream_failure(&self) {
        self.upstream_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A stream that ended early: caller gone, upstream dropped, or shutdown.
    pub fn record_aborted(&self) {
        self.aborted_streams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn open_upstreams(&self) -> u64 {
        self.open_upstreams.load(Ordering::Relaxed)
    }

    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let now = Instant::now();
        let relayed = self.relayed_bytes_total.load(Ordering::Relaxed);

        let relay_bps = {
            let mut sample = self.last_sample.lock();
            let elapsed = now.duration_since(sample.at);
            if elapsed >= self.rate_window {
                let delta = relayed.saturating_sub(sample.relayed_bytes);
                sample.bps = (delta as f64 / elapsed.as_secs_f64()) as u64;
                sample.at = now;
                sample.relayed_bytes = relayed;
            }
            sample.bps
        };

        StatsSnapshot {
            sessions_total: self.sessions_total.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            open_upstreams: self.open_upstreams.load(Ordering::Relaxed),
            relayed_bytes_total: relayed,
            relay_bps,
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
            aborted_streams: self.aborted_streams.load(Ordering::Relaxed),
        }
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}
