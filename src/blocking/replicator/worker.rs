//! Destination worker handle.
//!
//! The worker itself (the network sender applying batches at the
//! destination) lives outside the syncer; this is the handle the batcher
//! pushes into. `ack` and `unack` are the only state shared between syncer
//! and sender: plain 64-bit atomics, always read ack before unack so an
//! observer can never see `ack > unack`.

use crossbeam::channel::{unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use tracing::warn;

use crate::oplog::GenericOplog;
use crate::ACK_WAIT_INTERVAL_MS;

pub struct Worker {
    id: usize,
    ack: AtomicU64,
    unack: AtomicU64,
    all_acked: AtomicBool,
    batch_tx: Sender<Vec<GenericOplog>>,
}

impl Worker {
    /// Create the worker handle and the receiving end its sender drains.
    pub fn new(id: usize) -> (Worker, Receiver<Vec<GenericOplog>>) {
        let (batch_tx, batch_rx) = unbounded();
        (
            Worker {
                id,
                ack: AtomicU64::new(0),
                unack: AtomicU64::new(0),
                all_acked: AtomicBool::new(false),
                batch_tx,
            },
            batch_rx,
        )
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Non-blocking enqueue; raises `unack` to the batch's max ts before
    /// the batch becomes visible to the sender.
    pub fn push(&self, batch: Vec<GenericOplog>) {
        let max_ts = batch.iter().map(|log| log.parsed.ts).max().unwrap_or(0);
        if max_ts != 0 {
            self.unack.fetch_max(max_ts, Ordering::SeqCst);
            self.all_acked.store(false, Ordering::SeqCst);
        }
        if self.batch_tx.send(batch).is_err() {
            warn!(worker = self.id, "worker receiver is gone, batch dropped");
        }
    }

    pub fn ack(&self) -> u64 {
        self.ack.load(Ordering::SeqCst)
    }

    pub fn unack(&self) -> u64 {
        self.unack.load(Ordering::SeqCst)
    }

    /// Called by the sender once the destination confirmed everything up
    /// to `ts`.
    pub fn set_ack(&self, ts: u64) {
        self.ack.fetch_max(ts, Ordering::SeqCst);
    }

    /// Force both clocks, used when restoring a checkpoint and on the idle
    /// catch-up path. `unack` is written first so `ack ≤ unack` holds at
    /// every observation point.
    pub fn force_ack(&self, ts: u64) {
        self.unack.store(ts, Ordering::SeqCst);
        self.ack.store(ts, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn set_counters(&self, ack: u64, unack: u64) {
        self.unack.store(unack, Ordering::SeqCst);
        self.ack.store(ack, Ordering::SeqCst);
    }

    pub fn is_all_acked(&self) -> bool {
        self.all_acked.load(Ordering::SeqCst)
    }

    /// Sticky all-acked marker; cleared by the next `push`.
    pub fn set_all_acked(&self, v: bool) {
        self.all_acked.store(v, Ordering::SeqCst);
    }
}

/// Block until every worker reports `ack == unack`. Spin-with-sleep; the
/// counters are the only coordination channel with the senders.
pub fn wait_all_acked(workers: &[std::sync::Arc<Worker>]) {
    loop {
        let pending = workers.iter().any(|w| {
            let ack = w.ack();
            let unack = w.unack();
            unack > ack
        });
        if !pending {
            return;
        }
        thread::sleep(Duration::from_millis(ACK_WAIT_INTERVAL_MS));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::oplog::{Oplog, OpType};
    use bson::doc;
    use std::sync::Arc;

    fn entry(ts: u64) -> GenericOplog {
        GenericOplog {
            raw: vec![],
            parsed: Oplog {
                ts,
                op: OpType::Insert,
                ns: "db.a".to_string(),
                o: doc! {"_id": 1},
                o2: None,
                gid: None,
            },
        }
    }

    #[test]
    fn test_push_raises_unack_and_clears_sticky() {
        let (worker, rx) = Worker::new(0);
        worker.set_all_acked(true);
        worker.push(vec![entry(5 << 32), entry((5 << 32) | 3)]);
        assert_eq!(worker.unack(), (5 << 32) | 3);
        assert_eq!(worker.ack(), 0);
        assert!(!worker.is_all_acked());
        assert_eq!(rx.recv().unwrap().len(), 2);
    }

    #[test]
    fn test_force_ack_sets_both_clocks() {
        let (worker, _rx) = Worker::new(0);
        worker.force_ack((200 << 32) | 10);
        assert_eq!(worker.ack(), (200 << 32) | 10);
        assert_eq!(worker.unack(), (200 << 32) | 10);
    }

    #[test]
    fn test_wait_all_acked_returns_after_sender_acks() {
        let (worker, rx) = Worker::new(0);
        let worker = Arc::new(worker);
        worker.push(vec![entry(7 << 32)]);

        let acker = {
            let worker = worker.clone();
            thread::spawn(move || {
                let batch = rx.recv().unwrap();
                thread::sleep(Duration::from_millis(50));
                let max = batch.iter().map(|l| l.parsed.ts).max().unwrap();
                worker.set_ack(max);
            })
        };
        wait_all_acked(&[worker.clone()]);
        assert_eq!(worker.ack(), worker.unack());
        acker.join().unwrap();
    }
}
