//! Per-replica-set oplog syncer: hosts the fetch → parse → batch →
//! dispatch pipeline and owns the checkpoint arithmetic.
//!
//! The data flow inside one syncer is:
//! `source → reader → buffer → pendingQueue[k] → deserializer[k] →
//! logsQueue[k] → batcher → worker[hash % W]`.
//! One fetcher, P deserializers, one batcher. Workers are external
//! senders; the only state shared with them is the ack/unack pair on each
//! [Worker] handle.

use chrono::{DateTime, Local};
use crossbeam::channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

use super::batcher::{Batcher, FilteredBatch};
use super::checkpoint::{CheckpointDoc, CheckpointManager, CheckpointProvider};
use super::ddl_manager::DdlManager;
use super::journal::Journal;
use super::move_chunk::MoveChunkManager;
use super::reader::{FetchStatus, OplogReader};
use super::worker::Worker;
use crate::cmd_oplog::{transform_db_ddl, transform_sharding_ddl};
use crate::config::{ShardKey, SyncerConfig};
use crate::error::{ReplError, Result};
use crate::filter::{AutologousFilter, DdlFilter, FilterChain, GidFilter, NamespaceFilter};
use crate::hasher::{OplogHasher, PrimaryKeyHasher, TableHasher};
use crate::metrics::{ReplicationMetric, SimpleRateController, SyncerStatus};
use crate::oplog::{ts_seconds, ts_to_log, GenericOplog, Oplog};
use crate::{
    CHECKPOINT_EPOCH_TS, DURATION_TIME_MS, PIPELINE_QUEUE_LEN, PIPELINE_QUEUE_MAX_NR,
    PIPELINE_QUEUE_MIN_NR,
};

pub struct OplogSyncer {
    replset: String,
    conf: Arc<SyncerConfig>,
    /// full-copy finish position; 0 while the document phase still runs.
    doc_end_ts: AtomicU64,
    reader: Arc<OplogReader>,
    ckpt_manager: Arc<CheckpointManager>,
    ddl_manager: Arc<DdlManager>,
    mvck_manager: Arc<dyn MoveChunkManager>,
    rate: Arc<SimpleRateController>,
    metric: Arc<ReplicationMetric>,
    journal: Option<Arc<Journal>>,
    filter_chain: Arc<FilterChain>,
    hasher: Arc<dyn OplogHasher>,
    workers: Mutex<Vec<Arc<Worker>>>,
    sync_ts: Arc<AtomicU64>,
    unsync_ts: Arc<AtomicU64>,
}

/// Fetch-side state owned by the poll loop: the raw-frame buffer and the
/// round-robin cursor over the pending queues.
struct FetchContext {
    buffer: Vec<Vec<u8>>,
    buffer_capacity: usize,
    pending_txs: Vec<Sender<Vec<Vec<u8>>>>,
    next_queue_position: u64,
}

impl OplogSyncer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conf: Arc<SyncerConfig>,
        replset: &str,
        reader: Arc<OplogReader>,
        doc_end_ts: u64,
        ckpt_manager: Arc<CheckpointManager>,
        ddl_manager: Arc<DdlManager>,
        mvck_manager: Arc<dyn MoveChunkManager>,
        rate: Arc<SimpleRateController>,
    ) -> Result<OplogSyncer> {
        let mut filter_chain = FilterChain::new();
        filter_chain.push(Box::new(AutologousFilter::new(conf.checkpoint_db())));
        filter_chain.push(Box::new(GidFilter::new(conf.oplog_gids().to_vec())));
        if conf.dml_only() {
            filter_chain.push(Box::new(DdlFilter));
        }
        // namespace matching is the heavy predicate, keep it last
        if !conf.namespace_white().is_empty() || !conf.namespace_black().is_empty() {
            filter_chain.push(Box::new(NamespaceFilter::new(
                conf.namespace_white().to_vec(),
                conf.namespace_black().to_vec(),
            )));
        }

        let hasher: Arc<dyn OplogHasher> = match conf.shard_key() {
            ShardKey::ByNamespace => Arc::new(TableHasher),
            ShardKey::ById => Arc::new(PrimaryKeyHasher),
        };

        let journal = if conf.enable_journal() {
            Some(Arc::new(Journal::new(
                conf.log_directory(),
                conf.collector_id(),
                replset,
            )?))
        } else {
            None
        };

        Ok(OplogSyncer {
            replset: replset.to_string(),
            doc_end_ts: AtomicU64::new(doc_end_ts),
            reader,
            ckpt_manager,
            ddl_manager,
            mvck_manager,
            rate,
            metric: Arc::new(ReplicationMetric::new(replset)),
            journal,
            filter_chain: Arc::new(filter_chain),
            hasher,
            workers: Mutex::new(Vec::new()),
            sync_ts: Arc::new(AtomicU64::new(0)),
            unsync_ts: Arc::new(AtomicU64::new(0)),
            conf,
        })
    }

    pub fn replset(&self) -> &str {
        &self.replset
    }

    pub fn metric(&self) -> &Arc<ReplicationMetric> {
        &self.metric
    }

    /// Append a worker to the group. One-shot setup before [start].
    pub fn bind(&self, worker: Arc<Worker>) {
        self.workers.lock().unwrap().push(worker);
    }

    /// Invoked when the document phase completes while oplogs were being
    /// spilled: record the handoff point and start draining the spill.
    pub fn start_disk_apply(&self, doc_end_ts: u64) {
        self.doc_end_ts.store(doc_end_ts, Ordering::SeqCst);
        self.reader.update_fetch_status(FetchStatus::StoreDiskApply);
        info!(
            replset = %self.replset,
            doc_end_ts = %ts_to_log(doc_end_ts),
            "document phase done, draining disk queue"
        );
    }

    /// Spin up the deserializer pool and the batcher, then poll the reader
    /// for as long as this node holds the master lease. Runs forever; call
    /// from a dedicated thread.
    pub fn start(self: &Arc<Self>, master: Arc<AtomicBool>) {
        info!(
            replset = %self.replset,
            ckpt_interval_ms = self.conf.checkpoint_interval_ms(),
            shard_cluster = self.conf.is_shard_cluster(),
            "poll oplog syncer start"
        );

        let parallel = if self.conf.is_shard_cluster() {
            // a sharded source already interleaves streams whose relative
            // order must survive end-to-end
            PIPELINE_QUEUE_MIN_NR
        } else {
            PIPELINE_QUEUE_MAX_NR
        };
        let mut pending_txs = Vec::with_capacity(parallel);
        let mut logs_rxs = Vec::with_capacity(parallel);
        for index in 0..parallel {
            let (pending_tx, pending_rx) = bounded(PIPELINE_QUEUE_LEN);
            let (logs_tx, logs_rx) = bounded(PIPELINE_QUEUE_LEN);
            pending_txs.push(pending_tx);
            logs_rxs.push(logs_rx);
            thread::Builder::new()
                .name(format!("deserializer-{}-{}", self.replset, index))
                .spawn(move || deserializer(pending_rx, logs_tx))
                .expect("spawn deserializer thread");
        }

        let batcher = Batcher::new(
            self.replset.clone(),
            self.filter_chain.clone(),
            self.hasher.clone(),
            self.mvck_manager.clone(),
            self.metric.clone(),
            self.journal.clone(),
            self.sync_ts.clone(),
            self.unsync_ts.clone(),
            logs_rxs,
            self.workers.lock().unwrap().clone(),
        );
        {
            let syncer = self.clone();
            thread::Builder::new()
                .name(format!("batcher-{}", self.replset))
                .spawn(move || batcher_loop(syncer, batcher))
                .expect("spawn batcher thread");
        }

        let mut ctx = FetchContext {
            buffer: Vec::with_capacity(self.conf.fetcher_buffer_capacity()),
            buffer_capacity: self.conf.fetcher_buffer_capacity(),
            pending_txs,
            next_queue_position: 0,
        };
        loop {
            self.reader.start_fetcher();
            self.poll(&master, &mut ctx);
            warn!(
                replset = %self.replset,
                yield_ms = DURATION_TIME_MS,
                "oplog syncer polling yield"
            );
            thread::sleep(Duration::from_millis(DURATION_TIME_MS));
        }
    }

    /// Only the master polls; the coordinator-wide rate limiter gates the
    /// loop and a tripped limiter backs off 100 ms.
    fn poll(&self, master: &AtomicBool, ctx: &mut FetchContext) {
        while master.load(Ordering::SeqCst) {
            if self.rate.control(self.conf.sentinel_tps(), 1) {
                thread::sleep(Duration::from_millis(100));
                continue;
            }
            self.next(ctx);
        }
    }

    /// Pull one frame from the reader. A frame is buffered; the benign
    /// no-data signal flushes the buffer instead.
    fn next(&self, ctx: &mut FetchContext) -> bool {
        match self.reader.next() {
            Ok(Some(raw)) => {
                self.metric.add_get(1);
                self.metric.set_oplog_size(raw.len() as u64);
                self.transfer(ctx, Some(raw))
            }
            Ok(None) => self.transfer(ctx, None),
            Err(e @ ReplError::DiskQueueCorrupt { .. }) => {
                error!(?e, replset = %self.replset, "disk queue corrupted, cannot continue");
                panic!("disk queue corrupted: {e}");
            }
            Err(e) => {
                error!(?e, replset = %self.replset, "oplog syncer internal error");
                thread::sleep(Duration::from_millis(DURATION_TIME_MS));
                false
            }
        }
    }

    /// Move the buffered frames onto the pending queue selected by the
    /// monotonic queue position; strict round-robin keeps producer order
    /// reconstructible after the parallel parse stage.
    fn transfer(&self, ctx: &mut FetchContext, log: Option<Vec<u8>>) -> bool {
        let flush = log.is_none();
        if let Some(raw) = log {
            ctx.buffer.push(raw);
        }
        if ctx.buffer.len() >= ctx.buffer_capacity || (flush && !ctx.buffer.is_empty()) {
            let selected = (ctx.next_queue_position % ctx.pending_txs.len() as u64) as usize;
            let batch =
                std::mem::replace(&mut ctx.buffer, Vec::with_capacity(ctx.buffer_capacity));
            if ctx.pending_txs[selected].send(batch).is_err() {
                warn!(replset = %self.replset, "pending queue closed, frames dropped");
                return false;
            }
            ctx.next_queue_position += 1;
            return true;
        }
        false
    }

    fn ddl_support_for_sharding(&self) -> bool {
        self.conf.is_shard_cluster()
    }

    /// Aggregate the worker clocks into the checkpoint ack value.
    ///
    /// Always load `ack` before `unack` so no worker is ever observed with
    /// `ack > unack` spuriously. A worker with `unack < ack && unack == 0`
    /// is a restarted receiver: treated as partial without contributing.
    pub fn calculate_syncer_ack_ts(&self) -> Result<u64> {
        let workers = self.workers.lock().unwrap();
        let mut all_acked = true;
        let mut candidates = Vec::with_capacity(workers.len());
        let mut all_ack_values = Vec::with_capacity(workers.len());
        for worker in workers.iter() {
            let ack = worker.ack();
            let unack = worker.unack();
            if ack == 0 && unack == 0 {
                // nothing synced through this worker yet, skip
            } else if ack == unack || worker.is_all_acked() {
                worker.set_all_acked(true);
                all_ack_values.push(ack);
            } else if unack > ack {
                // most likely: partially acked (ack may still be 0)
                candidates.push(ack);
                all_acked = false;
            } else if unack == 0 {
                // restarted receiver, its unack will follow up shortly
                all_acked = false;
            } else {
                return Err(ReplError::AckOverrun { ack, unack });
            }
        }
        if all_acked && !all_ack_values.is_empty() {
            // every worker drained: free to jump to the largest ack
            return Ok(*all_ack_values.iter().max().expect("non-empty"));
        }
        if candidates.is_empty() {
            return Err(ReplError::CheckpointNotReady {
                reason: "no candidate ack values",
            });
        }
        let min = *candidates.iter().min().expect("non-empty");
        if min == 0 {
            return Err(ReplError::CheckpointNotReady {
                reason: "smallest candidate ack is zero",
            });
        }
        Ok(min)
    }

    /// Restore clocks and fetch state from a stored checkpoint record.
    ///
    /// Verifies the source still retains the checkpoint position, seeds
    /// the epoch timestamp on a first run, and selects the fetch state
    /// from the document-phase handoff and the presence of a disk queue.
    pub fn load_by_doc(&self, doc: &CheckpointDoc, wall_clock: DateTime<Local>) -> Result<()> {
        let mut ack_ts = doc.ack_ts;
        let mut sync_ts = doc.sync_ts;
        if ack_ts != 0 {
            let oldest = self.reader.oldest_source_ts()?;
            if oldest > ack_ts {
                return Err(ReplError::OplogWindowLost {
                    oldest,
                    ack_ts,
                });
            }
        } else {
            // first run: both clocks start at the epoch
            ack_ts = CHECKPOINT_EPOCH_TS;
            sync_ts = CHECKPOINT_EPOCH_TS;
        }

        self.sync_ts.store(sync_ts, Ordering::SeqCst);
        self.unsync_ts.store(sync_ts, Ordering::SeqCst);
        for worker in self.workers.lock().unwrap().iter() {
            worker.force_ack(ack_ts);
        }

        let doc_end_ts = self.doc_end_ts.load(Ordering::SeqCst);
        if doc_end_ts == 0 {
            // document and oplog replication run in parallel: spill until
            // the document phase hands over
            self.reader
                .update_fetch_status(FetchStatus::StoreDiskNoApply);
            self.reader.init_disk_queue(&format!(
                "diskqueue-{}-{}",
                self.replset,
                wall_clock.format("%Y%m%d-%H%M%S")
            ))?;
            self.reader.update_query_timestamp(ack_ts);
        } else if doc
            .dq_name
            .as_deref()
            .map_or(false, |name| self.reader.disk_queue_exists(name))
        {
            // resume draining the spill left behind by the previous run
            let name = doc.dq_name.as_deref().expect("checked above");
            self.reader.update_fetch_status(FetchStatus::StoreDiskApply);
            self.reader.init_disk_queue(name)?;
            let query_ts = self.reader.query_ts_from_disk_queue();
            if query_ts == 0 {
                warn!(replset = %self.replset, dq_name = name, "disk queue already emptied");
                self.reader.update_query_timestamp(ack_ts);
            } else {
                self.reader.update_query_timestamp(query_ts);
            }
        } else {
            // serial document-then-oplog replication
            self.reader
                .update_fetch_status(FetchStatus::StoreMemoryApply);
            self.reader.update_query_timestamp(ack_ts);
        }

        info!(
            replset = %self.replset,
            ack_ts = %ts_to_log(ack_ts),
            sync_ts = %ts_to_log(sync_ts),
            fetch_status = ?self.reader.fetch_status(),
            "checkpoint loaded"
        );
        Ok(())
    }

    /// Status document behind `GET /repl`.
    pub fn status(&self) -> SyncerStatus {
        SyncerStatus::snapshot(self.conf.collector_id(), &self.metric)
    }
}

impl CheckpointProvider for OplogSyncer {
    /// Snapshot the checkpoint record. Runs under the manager's write
    /// lease, so the batcher is between iterations and `syncTs` has been
    /// carried over.
    fn flush_by_doc(&self) -> Result<CheckpointDoc> {
        let ack_ts = self.calculate_syncer_ack_ts()?;
        let sync_ts = self.sync_ts.load(Ordering::SeqCst);
        let unsync_ts = self.unsync_ts.load(Ordering::SeqCst);
        assert_eq!(
            sync_ts, unsync_ts,
            "checkpoint flush while a batch is in flight"
        );
        self.metric.add_checkpoint(1);
        self.metric.set_lsn_ack(ack_ts);
        self.metric.set_lsn_checkpoint(ack_ts);
        let dq_name = match self.reader.fetch_status() {
            FetchStatus::StoreDiskNoApply | FetchStatus::StoreDiskApply => {
                self.reader.disk_queue_name()
            }
            FetchStatus::StoreMemoryApply => None,
        };
        Ok(CheckpointDoc {
            name: self.replset.clone(),
            ack_ts,
            sync_ts,
            dq_name,
        })
    }
}

/// Parse raw frames from one pending queue into the matching logs queue.
/// Parse failures are fatal: a MongoDB oplog does not contain undecodable
/// entries unless the stream is corrupted.
fn deserializer(pending_rx: Receiver<Vec<Vec<u8>>>, logs_tx: Sender<Vec<GenericOplog>>) {
    while let Ok(raw_batch) = pending_rx.recv() {
        let mut parsed = Vec::with_capacity(raw_batch.len());
        for raw in raw_batch {
            match Oplog::parse(&raw) {
                Ok(log) => parsed.push(GenericOplog { raw, parsed: log }),
                Err(e) => {
                    error!(?e, "oplog parse violation, source stream corrupted");
                    panic!("oplog parse violation: {e}");
                }
            }
        }
        if logs_tx.send(parsed).is_err() {
            break;
        }
    }
}

/// The batcher loop: merge, filter, gate DDL, dispatch, keep the clocks.
fn batcher_loop(sync: Arc<OplogSyncer>, mut batcher: Batcher) {
    loop {
        let Some(batch) = batcher.next() else {
            info!(replset = %sync.replset, "logs queues closed, batcher exiting");
            return;
        };

        // hold the read lease so the flusher cannot snapshot mid-dispatch
        let mut lease = sync.ckpt_manager.read_lease();
        let FilteredBatch {
            logs,
            barrier,
            flush_checkpoint,
            last_oplog,
            need_wait,
        } = batcher.filter_and_block_move_chunk(batch);

        if let Some(last) = last_oplog {
            let mut need_dispatch = true;
            let mut need_unblock = false;
            let mut logs = logs;
            if last.is_command() {
                if sync.ddl_support_for_sharding() {
                    // the quorum wait can span a peer's checkpoint flush;
                    // park without the lease so the flusher can run
                    batcher.store_sync_ts();
                    drop(lease);
                    need_dispatch = sync.ddl_manager.block_ddl(&sync.replset, &last);
                    lease = sync.ckpt_manager.read_lease();
                    if need_dispatch {
                        info!(
                            replset = %sync.replset,
                            ts = %ts_to_log(last.ts),
                            ns = %last.ns,
                            "prepare to dispatch ddl"
                        );
                        logs = transform_ddl_batch(&sync, &last, logs, true);
                        need_unblock = true;
                    }
                } else if !sync.conf.dml_only() {
                    logs = transform_ddl_batch(&sync, &last, logs, false);
                }
            }
            if need_dispatch {
                if batcher.dispatch_batch(logs) {
                    sync.metric.set_lsn(last.ts);
                    sync.reader.update_query_timestamp(last.ts);
                }
                if barrier || flush_checkpoint {
                    // drain the workers, then persist: the barrier point
                    // must be durable before anything after it moves
                    batcher.wait_all_ack();
                    batcher.store_sync_ts();
                    if flush_checkpoint {
                        drop(lease);
                        sync.ckpt_manager.flush_and_wait();
                        lease = sync.ckpt_manager.read_lease();
                    }
                    if need_unblock {
                        info!(
                            replset = %sync.replset,
                            ts = %ts_to_log(last.ts),
                            "unblock at ddl"
                        );
                        sync.ddl_manager.unblock_ddl(&sync.replset, &last);
                    }
                }
            }
        } else {
            // everything was filtered: a long silent tail still has to
            // advance the checkpoint or a restart redoes it unbounded
            let unsync_ts = batcher.unsync_ts();
            let query_ts = sync.reader.query_timestamp();
            let gap = sync.conf.filter_checkpoint_gap_secs();
            if unsync_ts > query_ts
                && ts_seconds(unsync_ts).saturating_sub(ts_seconds(query_ts)) >= gap
            {
                batcher.wait_all_ack();
                info!(
                    replset = %sync.replset,
                    from = %ts_to_log(query_ts),
                    to = %ts_to_log(unsync_ts),
                    "filtered tail, ack catch-up"
                );
                sync.reader.update_query_timestamp(unsync_ts);
                batcher.update_ack_ts(unsync_ts);
            }
        }

        batcher.store_sync_ts();
        drop(lease);
        if need_wait {
            thread::sleep(Duration::from_millis(100));
        }
    }
}

/// Rewrite a DDL barrier batch into the destination form. The DDL entry is
/// the last survivor; its raw frame rides along on every rewritten entry.
fn transform_ddl_batch(
    sync: &OplogSyncer,
    last: &Oplog,
    logs: Vec<GenericOplog>,
    sharding: bool,
) -> Vec<GenericOplog> {
    let raw = logs.last().map(|g| g.raw.clone()).unwrap_or_default();
    let transformed = if sharding {
        match sync.ddl_manager.shard_collection_spec(last) {
            Some(spec) => transform_sharding_ddl(
                &sync.replset,
                last,
                &spec,
                sync.ddl_manager.to_is_sharding(),
            ),
            None => transform_db_ddl(&sync.replset, last),
        }
    } else {
        transform_db_ddl(&sync.replset, last)
    };
    transformed
        .into_iter()
        .map(|parsed| GenericOplog {
            raw: raw.clone(),
            parsed,
        })
        .collect()
}
