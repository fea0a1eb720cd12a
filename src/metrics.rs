//! Replication counters, the `/repl` status document, and the poll-loop
//! rate controller.

use chrono::Local;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::oplog::{ts_seconds, ts_to_datetime, ts_to_log};

/// Per-syncer replication counters. All fields are plain atomics so the
/// hot path never takes a lock; the TPS window is computed lazily on read.
pub struct ReplicationMetric {
    replset: String,
    logs_get: AtomicU64,
    logs_apply: AtomicU64,
    logs_success: AtomicU64,
    checkpoint_times: AtomicU64,
    retransmission: AtomicU64,
    lsn: AtomicU64,
    lsn_ack: AtomicU64,
    lsn_ckpt: AtomicU64,
    oplog_max_size: AtomicU64,
    tps: Mutex<TpsWindow>,
}

struct TpsWindow {
    last_count: u64,
    last_at: Instant,
    value: u64,
}

impl ReplicationMetric {
    pub fn new(replset: impl Into<String>) -> ReplicationMetric {
        ReplicationMetric {
            replset: replset.into(),
            logs_get: AtomicU64::new(0),
            logs_apply: AtomicU64::new(0),
            logs_success: AtomicU64::new(0),
            checkpoint_times: AtomicU64::new(0),
            retransmission: AtomicU64::new(0),
            lsn: AtomicU64::new(0),
            lsn_ack: AtomicU64::new(0),
            lsn_ckpt: AtomicU64::new(0),
            oplog_max_size: AtomicU64::new(0),
            tps: Mutex::new(TpsWindow {
                last_count: 0,
                last_at: Instant::now(),
                value: 0,
            }),
        }
    }

    pub fn replset(&self) -> &str {
        &self.replset
    }

    pub fn add_get(&self, n: u64) {
        self.logs_get.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_apply(&self, n: u64) {
        self.logs_apply.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_success(&self, n: u64) {
        self.logs_success.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_checkpoint(&self, n: u64) {
        self.checkpoint_times.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_retransmission(&self, n: u64) {
        self.retransmission.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_lsn(&self, ts: u64) {
        self.lsn.fetch_max(ts, Ordering::Relaxed);
    }

    pub fn set_lsn_ack(&self, ts: u64) {
        self.lsn_ack.fetch_max(ts, Ordering::Relaxed);
    }

    pub fn set_lsn_checkpoint(&self, ts: u64) {
        self.lsn_ckpt.fetch_max(ts, Ordering::Relaxed);
    }

    pub fn set_oplog_size(&self, size: u64) {
        self.oplog_max_size.fetch_max(size, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.logs_get.load(Ordering::Relaxed)
    }

    pub fn apply(&self) -> u64 {
        self.logs_apply.load(Ordering::Relaxed)
    }

    pub fn success(&self) -> u64 {
        self.logs_success.load(Ordering::Relaxed)
    }

    pub fn lsn(&self) -> u64 {
        self.lsn.load(Ordering::Relaxed)
    }

    pub fn lsn_ack(&self) -> u64 {
        self.lsn_ack.load(Ordering::Relaxed)
    }

    pub fn lsn_checkpoint(&self) -> u64 {
        self.lsn_ckpt.load(Ordering::Relaxed)
    }

    /// Applied-entries-per-second over the window since the last call, at
    /// most once a second.
    pub fn tps(&self) -> u64 {
        let mut window = self.tps.lock().unwrap();
        let elapsed = window.last_at.elapsed();
        if elapsed.as_secs() >= 1 {
            let count = self.success();
            window.value = (count.saturating_sub(window.last_count)) / elapsed.as_secs();
            window.last_count = count;
            window.last_at = Instant::now();
        }
        window.value
    }
}

/// Timestamp rendered for the status document.
#[derive(Serialize, Debug)]
pub struct MongoTime {
    pub ts: String,
    pub unix: u64,
    pub time: String,
}

impl MongoTime {
    fn from_ts(ts: u64) -> MongoTime {
        MongoTime {
            ts: ts_to_log(ts),
            unix: ts_seconds(ts),
            time: ts_to_datetime(ts).format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

/// Status document served at `GET /repl`; the HTTP transport is external.
#[derive(Serialize, Debug)]
pub struct SyncerStatus {
    pub who: String,
    pub replset: String,
    pub logs_get: u64,
    pub logs_repl: u64,
    pub logs_success: u64,
    pub tps: u64,
    pub lsn: MongoTime,
    pub lsn_ack: MongoTime,
    pub lsn_ckpt: MongoTime,
    pub now: String,
}

impl SyncerStatus {
    pub fn snapshot(who: &str, metric: &ReplicationMetric) -> SyncerStatus {
        SyncerStatus {
            who: who.to_string(),
            replset: metric.replset().to_string(),
            logs_get: metric.get(),
            logs_repl: metric.apply(),
            logs_success: metric.success(),
            tps: metric.tps(),
            lsn: MongoTime::from_ts(metric.lsn()),
            lsn_ack: MongoTime::from_ts(metric.lsn_ack()),
            lsn_ckpt: MongoTime::from_ts(metric.lsn_checkpoint()),
            now: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

/// Token-per-second gate for the poll loop. `control` counts `n` events
/// against the current one-second window and reports whether the caller
/// should back off.
pub struct SimpleRateController {
    state: Mutex<RateWindow>,
}

struct RateWindow {
    window_start: Instant,
    count: u64,
}

impl SimpleRateController {
    pub fn new() -> SimpleRateController {
        SimpleRateController {
            state: Mutex::new(RateWindow {
                window_start: Instant::now(),
                count: 0,
            }),
        }
    }

    /// Returns `true` when the caller is over `tps_limit` for the current
    /// second and should sleep. A limit of 0 never throttles.
    pub fn control(&self, tps_limit: u64, n: u64) -> bool {
        if tps_limit == 0 {
            return false;
        }
        let mut state = self.state.lock().unwrap();
        if state.window_start.elapsed().as_secs() >= 1 {
            state.window_start = Instant::now();
            state.count = 0;
        }
        if state.count + n > tps_limit {
            return true;
        }
        state.count += n;
        false
    }
}

impl Default for SimpleRateController {
    fn default() -> Self {
        SimpleRateController::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_metric_counters() {
        let m = ReplicationMetric::new("rs0");
        m.add_get(3);
        m.add_apply(2);
        m.set_lsn(5 << 32);
        m.set_lsn((4 << 32) | 1); // must not regress
        assert_eq!(m.get(), 3);
        assert_eq!(m.apply(), 2);
        assert_eq!(m.lsn(), 5 << 32);
    }

    #[test]
    fn test_status_snapshot_serializes() {
        let m = ReplicationMetric::new("rs0");
        m.set_lsn((100 << 32) | 7);
        let status = SyncerStatus::snapshot("repl-01", &m);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["replset"], "rs0");
        assert_eq!(json["lsn"]["ts"], "100:7");
    }

    #[test]
    fn test_rate_controller_zero_limit_never_throttles() {
        let rc = SimpleRateController::new();
        for _ in 0..1000 {
            assert!(!rc.control(0, 1));
        }
    }

    #[test]
    fn test_rate_controller_throttles_over_limit() {
        let rc = SimpleRateController::new();
        let mut throttled = false;
        for _ in 0..100 {
            throttled |= rc.control(10, 1);
        }
        assert!(throttled);
    }
}
