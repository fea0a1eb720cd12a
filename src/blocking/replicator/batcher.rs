//! Merges parsed oplogs from the parallel logs queues, applies the filter
//! chain, detects barriers, and partitions batches across the workers.
//!
//! The batcher is the sole consumer of every logs queue and the sole
//! producer to the workers. Queue batches are read in the same round-robin
//! order the fetcher assigned them, which reassembles the source order
//! across the parallel deserializers.

use crossbeam::channel::{Receiver, TryRecvError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::journal::Journal;
use super::move_chunk::MoveChunkManager;
use super::worker::{wait_all_acked, Worker};
use crate::filter::FilterChain;
use crate::hasher::OplogHasher;
use crate::metrics::ReplicationMetric;
use crate::oplog::{GenericOplog, Oplog};
use crate::ADAPTIVE_BATCHING_MAX_SIZE;

/// Result of one filter pass over a merged batch.
pub struct FilteredBatch {
    /// Entries surviving the filter chain and the move-chunk gate.
    pub logs: Vec<GenericOplog>,
    /// The last surviving entry is a DDL command.
    pub barrier: bool,
    /// Barrier semantics require a durable checkpoint before proceeding.
    pub flush_checkpoint: bool,
    /// Parsed view of the last surviving entry; `None` when everything was
    /// filtered.
    pub last_oplog: Option<Oplog>,
    /// A move-chunk block stashed the batch tail; retry after a wait.
    pub need_wait: bool,
}

pub struct Batcher {
    replset: String,
    filter_chain: Arc<FilterChain>,
    hasher: Arc<dyn OplogHasher>,
    mvck: Arc<dyn MoveChunkManager>,
    metric: Arc<ReplicationMetric>,
    journal: Option<Arc<Journal>>,
    sync_ts: Arc<AtomicU64>,
    unsync_ts: Arc<AtomicU64>,
    logs_queue: Vec<Receiver<Vec<GenericOplog>>>,
    workers: Vec<Arc<Worker>>,
    next_queue: usize,
    remain_logs: Vec<GenericOplog>,
}

impl Batcher {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        replset: String,
        filter_chain: Arc<FilterChain>,
        hasher: Arc<dyn OplogHasher>,
        mvck: Arc<dyn MoveChunkManager>,
        metric: Arc<ReplicationMetric>,
        journal: Option<Arc<Journal>>,
        sync_ts: Arc<AtomicU64>,
        unsync_ts: Arc<AtomicU64>,
        logs_queue: Vec<Receiver<Vec<GenericOplog>>>,
        workers: Vec<Arc<Worker>>,
    ) -> Batcher {
        Batcher {
            replset,
            filter_chain,
            hasher,
            mvck,
            metric,
            journal,
            sync_ts,
            unsync_ts,
            logs_queue,
            workers,
            next_queue: 0,
            remain_logs: Vec::new(),
        }
    }

    pub fn unsync_ts(&self) -> u64 {
        self.unsync_ts.load(Ordering::SeqCst)
    }

    pub fn sync_ts(&self) -> u64 {
        self.sync_ts.load(Ordering::SeqCst)
    }

    /// `syncTs := unsyncTs`, the per-iteration carry-over.
    pub fn store_sync_ts(&self) {
        self.sync_ts
            .store(self.unsync_ts.load(Ordering::SeqCst), Ordering::SeqCst);
    }

    /// Merge as much as immediately available into one batch, stopping at
    /// a barrier entry (placed last), at the adaptive size cap, or when no
    /// queue is readable. Blocks only while the batch is still empty.
    ///
    /// Returns `None` once every producer hung up (shutdown).
    pub fn next(&mut self) -> Option<Vec<GenericOplog>> {
        let mut batch = Vec::new();
        if !self.remain_logs.is_empty() {
            let pending = std::mem::take(&mut self.remain_logs);
            if self.absorb(&mut batch, pending) {
                return Some(batch);
            }
        }
        loop {
            let received = if batch.is_empty() {
                match self.logs_queue[self.next_queue].recv() {
                    Ok(logs) => logs,
                    Err(_) => return None,
                }
            } else {
                match self.logs_queue[self.next_queue].try_recv() {
                    Ok(logs) => logs,
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                }
            };
            self.next_queue = (self.next_queue + 1) % self.logs_queue.len();
            if self.absorb(&mut batch, received) {
                return Some(batch);
            }
            if batch.len() >= ADAPTIVE_BATCHING_MAX_SIZE {
                break;
            }
        }
        Some(batch)
    }

    /// Append `logs` to `batch` until a barrier entry. A barrier is
    /// emitted as a batch of its own: the entries it would replace on the
    /// DDL transform path must not ride along. Whatever follows goes to
    /// the remain slot; `unsyncTs` advances for every entry that made it
    /// into the batch. Returns whether a barrier cut the merge.
    fn absorb(&mut self, batch: &mut Vec<GenericOplog>, logs: Vec<GenericOplog>) -> bool {
        let mut queue: VecDeque<GenericOplog> = logs.into();
        while let Some(log) = queue.pop_front() {
            let is_barrier = log.parsed.is_command() || log.parsed.is_checkpoint_noop();
            if is_barrier && !batch.is_empty() {
                // cut before the barrier; it goes out alone next round
                let mut stash = vec![log];
                stash.extend(queue.drain(..));
                stash.extend(std::mem::take(&mut self.remain_logs));
                self.remain_logs = stash;
                return true;
            }
            self.observe(&log.parsed);
            batch.push(log);
            if is_barrier {
                if !queue.is_empty() {
                    let mut stash: Vec<GenericOplog> = queue.drain(..).collect();
                    stash.extend(std::mem::take(&mut self.remain_logs));
                    self.remain_logs = stash;
                }
                return true;
            }
        }
        false
    }

    fn observe(&self, log: &Oplog) {
        self.unsync_ts.fetch_max(log.ts, Ordering::SeqCst);
        if let Some(journal) = &self.journal {
            journal.write_record(log);
        }
    }

    /// Filter pass: drop chain-filtered entries, hold back entries blocked
    /// by a destination chunk migration, and derive the barrier and flush
    /// flags from what survives.
    pub fn filter_and_block_move_chunk(&mut self, batch: Vec<GenericOplog>) -> FilteredBatch {
        let mut kept: Vec<GenericOplog> = Vec::with_capacity(batch.len());
        let mut flush_checkpoint = false;
        let mut need_wait = false;
        let mut queue: VecDeque<GenericOplog> = batch.into();
        while let Some(log) = queue.pop_front() {
            if log.parsed.is_checkpoint_noop() {
                flush_checkpoint = true;
            }
            if self.filter_chain.filter(&log.parsed) {
                continue;
            }
            if self.mvck.block_oplog(&self.replset, &log.parsed) {
                need_wait = true;
                let mut stash: Vec<GenericOplog> = vec![log];
                stash.extend(queue.drain(..));
                stash.extend(std::mem::take(&mut self.remain_logs));
                self.remain_logs = stash;
                break;
            }
            kept.push(log);
        }
        let last_oplog = kept.last().map(|g| g.parsed.clone());
        let barrier = last_oplog.as_ref().map_or(false, |l| l.is_command());
        if barrier {
            flush_checkpoint = true;
        }
        FilteredBatch {
            logs: kept,
            barrier,
            flush_checkpoint,
            last_oplog,
            need_wait,
        }
    }

    /// Partition `batch` across the workers by hash and push each slice.
    /// Returns whether anything was dispatched.
    pub fn dispatch_batch(&self, batch: Vec<GenericOplog>) -> bool {
        if batch.is_empty() || self.workers.is_empty() {
            return false;
        }
        let dispatched = batch.len() as u64;
        let worker_count = self.workers.len() as u64;
        let mut slices: Vec<Vec<GenericOplog>> =
            (0..worker_count).map(|_| Vec::new()).collect();
        for log in batch {
            let idx = (self.hasher.distribute(&log.parsed) % worker_count) as usize;
            slices[idx].push(log);
        }
        for (idx, slice) in slices.into_iter().enumerate() {
            if !slice.is_empty() {
                self.workers[idx].push(slice);
            }
        }
        self.metric.add_apply(dispatched);
        true
    }

    /// Block until every worker drained: `ack == unack` everywhere.
    pub fn wait_all_ack(&self) {
        wait_all_acked(&self.workers);
    }

    /// Idle catch-up: a long fully-filtered tail still advances the
    /// worker clocks so a restart does not redo the filtered stretch.
    pub fn update_ack_ts(&self, ts: u64) {
        for worker in &self.workers {
            worker.force_ack(ts);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use super::super::move_chunk::NoopMoveChunkManager;
    use crate::filter::{DdlFilter, NamespaceFilter};
    use crate::hasher::{PrimaryKeyHasher, TableHasher};
    use crate::oplog::OpType;
    use bson::doc;
    use crossbeam::channel::{bounded, Sender};

    fn insert(ns: &str, id: i32, ts: u64) -> GenericOplog {
        GenericOplog {
            raw: vec![],
            parsed: Oplog {
                ts,
                op: OpType::Insert,
                ns: ns.to_string(),
                o: doc! {"_id": id},
                o2: None,
                gid: None,
            },
        }
    }

    fn command(ns: &str, ts: u64) -> GenericOplog {
        GenericOplog {
            raw: vec![],
            parsed: Oplog {
                ts,
                op: OpType::Command,
                ns: ns.to_string(),
                o: doc! {"create": "a"},
                o2: None,
                gid: None,
            },
        }
    }

    struct BlockNs(String);

    impl MoveChunkManager for BlockNs {
        fn block_oplog(&self, _replset: &str, log: &Oplog) -> bool {
            log.ns == self.0
        }
    }

    type Built = (
        Batcher,
        Vec<Sender<Vec<GenericOplog>>>,
        Vec<Arc<Worker>>,
        Vec<crossbeam::channel::Receiver<Vec<GenericOplog>>>,
    );

    fn build(
        queues: usize,
        workers: usize,
        filter_chain: FilterChain,
        mvck: Arc<dyn MoveChunkManager>,
        hasher: Arc<dyn OplogHasher>,
    ) -> Built {
        let mut txs = Vec::new();
        let mut rxs = Vec::new();
        for _ in 0..queues {
            let (tx, rx) = bounded(16);
            txs.push(tx);
            rxs.push(rx);
        }
        let mut worker_handles = Vec::new();
        let mut worker_rxs = Vec::new();
        for id in 0..workers {
            let (worker, rx) = Worker::new(id);
            worker_handles.push(Arc::new(worker));
            worker_rxs.push(rx);
        }
        let batcher = Batcher::new(
            "rs0".to_string(),
            Arc::new(filter_chain),
            hasher,
            mvck,
            Arc::new(ReplicationMetric::new("rs0")),
            None,
            Arc::new(AtomicU64::new(0)),
            Arc::new(AtomicU64::new(0)),
            rxs,
            worker_handles.clone(),
        );
        (batcher, txs, worker_handles, worker_rxs)
    }

    #[test]
    fn test_next_merges_round_robin() {
        let (mut batcher, txs, _workers, _wrx) = build(
            2,
            1,
            FilterChain::new(),
            Arc::new(NoopMoveChunkManager),
            Arc::new(TableHasher),
        );
        // producer order: batch 0 -> queue 0, batch 1 -> queue 1
        txs[0].send(vec![insert("db.a", 1, 1 << 32)]).unwrap();
        txs[1].send(vec![insert("db.a", 2, 2 << 32)]).unwrap();
        let batch = batcher.next().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].parsed.ts, 1 << 32);
        assert_eq!(batch[1].parsed.ts, 2 << 32);
        assert_eq!(batcher.unsync_ts(), 2 << 32);
    }

    #[test]
    fn test_barrier_is_emitted_alone() {
        let (mut batcher, txs, _workers, _wrx) = build(
            1,
            1,
            FilterChain::new(),
            Arc::new(NoopMoveChunkManager),
            Arc::new(TableHasher),
        );
        txs[0]
            .send(vec![
                insert("db.a", 1, 1 << 32),
                command("db.$cmd", 2 << 32),
                insert("db.a", 2, 3 << 32),
            ])
            .unwrap();
        // entries before the barrier go out first
        let batch = batcher.next().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].parsed.ts, 1 << 32);
        // the barrier itself is a batch of one
        let batch = batcher.next().unwrap();
        assert_eq!(batch.len(), 1);
        assert!(batch[0].parsed.is_command());
        // the stashed tail comes back first on the following call
        txs[0].send(vec![insert("db.a", 3, 4 << 32)]).unwrap();
        let batch = batcher.next().unwrap();
        assert_eq!(batch[0].parsed.ts, 3 << 32);
        assert_eq!(batch[1].parsed.ts, 4 << 32);
    }

    #[test]
    fn test_filter_drops_and_reports_last_survivor() {
        let mut chain = FilterChain::new();
        chain.push(Box::new(NamespaceFilter::new(
            vec![],
            vec!["db.junk".to_string()],
        )));
        let (mut batcher, _txs, _workers, _wrx) = build(
            1,
            1,
            chain,
            Arc::new(NoopMoveChunkManager),
            Arc::new(TableHasher),
        );
        let fb = batcher.filter_and_block_move_chunk(vec![
            insert("db.a", 1, 1 << 32),
            insert("db.junk", 2, 2 << 32),
        ]);
        assert_eq!(fb.logs.len(), 1);
        assert_eq!(fb.last_oplog.unwrap().ts, 1 << 32);
        assert!(!fb.barrier);
        assert!(!fb.flush_checkpoint);
    }

    #[test]
    fn test_all_filtered_yields_no_last_oplog() {
        let mut chain = FilterChain::new();
        chain.push(Box::new(DdlFilter));
        let (mut batcher, _txs, _workers, _wrx) = build(
            1,
            1,
            chain,
            Arc::new(NoopMoveChunkManager),
            Arc::new(TableHasher),
        );
        let fb = batcher.filter_and_block_move_chunk(vec![command("db.$cmd", 1 << 32)]);
        assert!(fb.logs.is_empty());
        assert!(fb.last_oplog.is_none());
        assert!(!fb.barrier);
    }

    #[test]
    fn test_ddl_survivor_sets_barrier_and_flush() {
        let (mut batcher, _txs, _workers, _wrx) = build(
            1,
            1,
            FilterChain::new(),
            Arc::new(NoopMoveChunkManager),
            Arc::new(TableHasher),
        );
        let fb = batcher.filter_and_block_move_chunk(vec![
            insert("db.a", 1, 1 << 32),
            command("db.$cmd", 2 << 32),
        ]);
        assert!(fb.barrier);
        assert!(fb.flush_checkpoint);
        assert!(fb.last_oplog.unwrap().is_command());
    }

    #[test]
    fn test_move_chunk_block_stashes_tail() {
        let (mut batcher, _txs, _workers, _wrx) = build(
            1,
            1,
            FilterChain::new(),
            Arc::new(BlockNs("db.hot".to_string())),
            Arc::new(TableHasher),
        );
        let fb = batcher.filter_and_block_move_chunk(vec![
            insert("db.a", 1, 1 << 32),
            insert("db.hot", 2, 2 << 32),
            insert("db.a", 3, 3 << 32),
        ]);
        assert!(fb.need_wait);
        assert_eq!(fb.logs.len(), 1);
        assert_eq!(batcher.remain_logs.len(), 2);
        assert_eq!(batcher.remain_logs[0].parsed.ts, 2 << 32);
    }

    #[test]
    fn test_dispatch_partitions_by_id() {
        let (batcher, _txs, workers, worker_rxs) = build(
            1,
            2,
            FilterChain::new(),
            Arc::new(NoopMoveChunkManager),
            Arc::new(PrimaryKeyHasher),
        );
        let batch: Vec<GenericOplog> = (0..50)
            .map(|i| insert("db.a", i, ((100u64) << 32) | (i as u64 + 1)))
            .collect();
        assert!(batcher.dispatch_batch(batch));
        drop(batcher);

        // every entry lands on exactly one worker, in source order there
        let mut total = 0;
        for (worker, rx) in workers.iter().zip(worker_rxs) {
            let mut last_ts = 0;
            let mut worker_max = 0;
            while let Ok(slice) = rx.try_recv() {
                for log in slice {
                    assert!(log.parsed.ts > last_ts);
                    last_ts = log.parsed.ts;
                    worker_max = worker_max.max(log.parsed.ts);
                    total += 1;
                }
            }
            assert_eq!(worker.unack(), worker_max);
        }
        assert_eq!(total, 50);
    }

    #[test]
    fn test_update_ack_ts_forces_worker_clocks() {
        let (batcher, _txs, workers, _wrx) = build(
            1,
            2,
            FilterChain::new(),
            Arc::new(NoopMoveChunkManager),
            Arc::new(TableHasher),
        );
        batcher.update_ack_ts((200 << 32) | 10);
        for worker in &workers {
            assert_eq!(worker.ack(), (200 << 32) | 10);
            assert_eq!(worker.unack(), (200 << 32) | 10);
        }
    }

    #[test]
    fn test_store_sync_ts_carries_over() {
        let (mut batcher, txs, _workers, _wrx) = build(
            1,
            1,
            FilterChain::new(),
            Arc::new(NoopMoveChunkManager),
            Arc::new(TableHasher),
        );
        txs[0].send(vec![insert("db.a", 1, 7 << 32)]).unwrap();
        let _ = batcher.next().unwrap();
        assert_eq!(batcher.sync_ts(), 0);
        batcher.store_sync_ts();
        assert_eq!(batcher.sync_ts(), 7 << 32);
    }
}
