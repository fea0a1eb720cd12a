//! In-process pipeline tests: an injected oplog source feeds a real
//! syncer (fetcher, deserializers, batcher, workers) and the checkpoint
//! path is verified against an in-memory store.

use bson::{doc, Timestamp};
use chrono::Local;
use crossbeam::channel::Receiver;
use mongo_repl::{
    CheckpointDoc, CheckpointManager, CheckpointProvider, DdlManager, GenericOplog,
    MemoryCheckpointStorage, NoopMoveChunkManager, OplogReader, OplogSource, OplogSyncer,
    ReplError, Result, SimpleRateController, SyncerConfig, Worker,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Replays a fixed frame list, then reports "no data" forever.
struct ReplaySource {
    frames: Vec<Vec<u8>>,
    cursor: usize,
    oldest: u64,
}

impl ReplaySource {
    fn new(frames: Vec<Vec<u8>>) -> ReplaySource {
        ReplaySource {
            frames,
            cursor: 0,
            oldest: 1 << 32,
        }
    }
}

impl OplogSource for ReplaySource {
    fn next(&mut self) -> Result<Option<Vec<u8>>> {
        if self.cursor < self.frames.len() {
            self.cursor += 1;
            Ok(Some(self.frames[self.cursor - 1].clone()))
        } else {
            // keep the fetcher from spinning hot once drained
            thread::sleep(Duration::from_millis(10));
            Ok(None)
        }
    }

    fn restart_from(&mut self, _ts: u64) -> Result<()> {
        Ok(())
    }

    fn oldest_ts(&mut self) -> Result<u64> {
        Ok(self.oldest)
    }
}

fn insert_frame(time: u32, inc: u32, ns: &str, id: i32) -> Vec<u8> {
    bson::to_vec(&doc! {
        "ts": Timestamp { time, increment: inc },
        "op": "i",
        "ns": ns,
        "o": {"_id": id, "x": id},
    })
    .unwrap()
}

fn test_config(dir: &TempDir, extra_filter: &str) -> Arc<SyncerConfig> {
    let toml = format!(
        r#"
        [collector]
        id = "repl-test"
        log_directory = {:?}
        fetcher_buffer_capacity = 64

        [source]
        replsets = [
            {{ name = "rs0", url = "mongodb://localhost:27017" }},
        ]

        [target]
        url = "mongodb://localhost:27018"

        [checkpoint]
        url = "mongodb://localhost:27018"

        [filter]
        checkpoint_gap_secs = 0
        {}
        "#,
        dir.path().to_str().unwrap(),
        extra_filter,
    );
    Arc::new(SyncerConfig::from_toml(&toml).unwrap())
}

struct Pipeline {
    syncer: Arc<OplogSyncer>,
    reader: Arc<OplogReader>,
    ckpt_manager: Arc<CheckpointManager>,
    workers: Vec<Arc<Worker>>,
    /// per-worker applied timestamps, in arrival order.
    applied: Arc<Mutex<Vec<Vec<u64>>>>,
}

fn build_pipeline(
    conf: Arc<SyncerConfig>,
    dir: &TempDir,
    frames: Vec<Vec<u8>>,
    worker_count: usize,
) -> Pipeline {
    let reader = Arc::new(OplogReader::new(
        Box::new(ReplaySource::new(frames)),
        dir.path().to_path_buf(),
    ));
    let ckpt_manager = Arc::new(CheckpointManager::new(
        Box::new(MemoryCheckpointStorage::new()),
        60_000,
    ));
    let ddl_manager = Arc::new(DdlManager::new(1, false, None).unwrap());
    let syncer = Arc::new(
        OplogSyncer::new(
            conf,
            "rs0",
            reader.clone(),
            1 << 32, // document phase already done, serial mode
            ckpt_manager.clone(),
            ddl_manager,
            Arc::new(NoopMoveChunkManager),
            Arc::new(SimpleRateController::new()),
        )
        .unwrap(),
    );

    let applied = Arc::new(Mutex::new(vec![Vec::new(); worker_count]));
    let mut workers = Vec::new();
    for id in 0..worker_count {
        let (worker, batch_rx) = Worker::new(id);
        let worker = Arc::new(worker);
        syncer.bind(worker.clone());
        spawn_acker(worker.clone(), batch_rx, id, applied.clone());
        workers.push(worker);
    }

    Pipeline {
        syncer,
        reader,
        ckpt_manager,
        workers,
        applied,
    }
}

/// Stand-in destination sender: records what it saw and acks immediately.
fn spawn_acker(
    worker: Arc<Worker>,
    batch_rx: Receiver<Vec<GenericOplog>>,
    id: usize,
    applied: Arc<Mutex<Vec<Vec<u64>>>>,
) {
    thread::spawn(move || {
        while let Ok(batch) = batch_rx.recv() {
            let max_ts = batch.iter().map(|log| log.parsed.ts).max().unwrap_or(0);
            {
                let mut applied = applied.lock().unwrap();
                for log in &batch {
                    applied[id].push(log.parsed.ts);
                }
            }
            if max_ts != 0 {
                worker.set_ack(max_ts);
            }
        }
    });
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    false
}

#[test]
fn steady_stream_reaches_checkpoint() {
    let dir = TempDir::new().unwrap();
    let conf = test_config(&dir, "");
    let frames: Vec<Vec<u8>> = (1..=1000)
        .map(|i| insert_frame(100, i as u32, "db.a", i))
        .collect();
    let pipeline = build_pipeline(conf, &dir, frames, 2);

    pipeline
        .syncer
        .load_by_doc(&CheckpointDoc::initial("rs0"), Local::now())
        .unwrap();
    let master = Arc::new(AtomicBool::new(true));
    {
        let syncer = pipeline.syncer.clone();
        let master = master.clone();
        thread::spawn(move || syncer.start(master));
    }

    // every entry lands and every worker drains
    let applied = pipeline.applied.clone();
    assert!(
        wait_until(Duration::from_secs(30), || {
            let total: usize = applied.lock().unwrap().iter().map(|v| v.len()).sum();
            total == 1000
                && pipeline
                    .workers
                    .iter()
                    .all(|w| w.ack() == w.unack())
        }),
        "pipeline did not drain in time"
    );

    let last_ts = (100u64 << 32) | 1000;
    let applied = pipeline.applied.lock().unwrap();
    // multi-set across workers is exactly the input; per-worker order is
    // source order
    let mut all: Vec<u64> = applied.iter().flatten().copied().collect();
    all.sort_unstable();
    let expected: Vec<u64> = (1..=1000u64).map(|i| (100 << 32) | i).collect();
    assert_eq!(all, expected);
    for per_worker in applied.iter() {
        assert!(per_worker.windows(2).all(|w| w[0] < w[1]));
    }
    assert_eq!(
        pipeline.workers.iter().map(|w| w.ack()).max().unwrap(),
        last_ts
    );

    // the checkpoint path reports the stream tail
    pipeline.ckpt_manager.start_flusher(vec![
        pipeline.syncer.clone() as Arc<dyn CheckpointProvider>
    ]);
    pipeline.ckpt_manager.flush_and_wait();
    let stored = pipeline.ckpt_manager.load("rs0").unwrap();
    assert_eq!(stored.ack_ts, last_ts);
    assert_eq!(stored.sync_ts, last_ts);
    assert_eq!(pipeline.syncer.metric().lsn(), last_ts);

    master.store(false, Ordering::SeqCst);
}

#[test]
fn fully_filtered_tail_advances_ack() {
    let dir = TempDir::new().unwrap();
    let conf = test_config(&dir, "namespace_black = [\"db.b\"]");
    let frames: Vec<Vec<u8>> = (1..=10)
        .map(|i| insert_frame(200, i as u32, "db.b", i))
        .collect();
    let pipeline = build_pipeline(conf, &dir, frames, 2);

    pipeline
        .syncer
        .load_by_doc(&CheckpointDoc::initial("rs0"), Local::now())
        .unwrap();
    let master = Arc::new(AtomicBool::new(true));
    {
        let syncer = pipeline.syncer.clone();
        let master = master.clone();
        thread::spawn(move || syncer.start(master));
    }

    let tail = (200u64 << 32) | 10;
    let reader = pipeline.reader.clone();
    let workers = pipeline.workers.clone();
    assert!(
        wait_until(Duration::from_secs(30), || {
            reader.query_timestamp() == tail && workers.iter().all(|w| w.ack() == tail)
        }),
        "filtered tail did not advance the clocks"
    );

    // nothing was dispatched
    let applied = pipeline.applied.lock().unwrap();
    assert!(applied.iter().all(|per_worker| per_worker.is_empty()));

    master.store(false, Ordering::SeqCst);
}

fn command_frame(time: u32, inc: u32, ns: &str, o: bson::Document) -> Vec<u8> {
    bson::to_vec(&doc! {
        "ts": Timestamp { time, increment: inc },
        "op": "c",
        "ns": ns,
        "o": o,
    })
    .unwrap()
}

/// Two replica-set syncers see the same DDL; only the quorum-designated
/// executor dispatches it, and its checkpoint lands before the barrier
/// releases.
#[test]
fn sharded_ddl_executes_once() {
    let dir = TempDir::new().unwrap();
    let toml = format!(
        r#"
        [collector]
        id = "repl-test"
        log_directory = {:?}
        fetcher_buffer_capacity = 64

        [source]
        replsets = [
            {{ name = "rs0", url = "mongodb://localhost:27017" }},
            {{ name = "rs1", url = "mongodb://localhost:27027" }},
        ]

        [target]
        url = "mongodb://localhost:27018"

        [checkpoint]
        url = "mongodb://localhost:27018"
        "#,
        dir.path().to_str().unwrap(),
    );
    let conf = Arc::new(SyncerConfig::from_toml(&toml).unwrap());

    let ckpt_manager = Arc::new(CheckpointManager::new(
        Box::new(MemoryCheckpointStorage::new()),
        60_000,
    ));
    let ddl_manager = Arc::new(DdlManager::new(2, false, None).unwrap());
    let ddl = command_frame(300, 5, "db.$cmd", doc! {"create": "a"});

    let mut syncers = Vec::new();
    let mut workers = Vec::new();
    let mut applied_sets = Vec::new();
    for (idx, replset) in ["rs0", "rs1"].iter().enumerate() {
        let frames = vec![
            insert_frame(300, idx as u32 + 1, "db.a", idx as i32),
            ddl.clone(),
        ];
        let reader = Arc::new(OplogReader::new(
            Box::new(ReplaySource::new(frames)),
            dir.path().to_path_buf(),
        ));
        let syncer = Arc::new(
            OplogSyncer::new(
                conf.clone(),
                replset,
                reader,
                1 << 32,
                ckpt_manager.clone(),
                ddl_manager.clone(),
                Arc::new(NoopMoveChunkManager),
                Arc::new(SimpleRateController::new()),
            )
            .unwrap(),
        );
        let applied = Arc::new(Mutex::new(vec![Vec::new()]));
        let (worker, batch_rx) = Worker::new(0);
        let worker = Arc::new(worker);
        syncer.bind(worker.clone());
        spawn_acker(worker.clone(), batch_rx, 0, applied.clone());
        syncer
            .load_by_doc(&CheckpointDoc::initial(replset), Local::now())
            .unwrap();
        syncers.push(syncer);
        workers.push(worker);
        applied_sets.push(applied);
    }

    ckpt_manager.start_flusher(
        syncers
            .iter()
            .map(|s| s.clone() as Arc<dyn CheckpointProvider>)
            .collect(),
    );

    let master = Arc::new(AtomicBool::new(true));
    for syncer in &syncers {
        let syncer = syncer.clone();
        let master = master.clone();
        thread::spawn(move || syncer.start(master));
    }

    let ddl_ts = (300u64 << 32) | 5;
    // rs0 is the lexicographic executor: its worker must see the command,
    // rs1's must not, and the barrier flush persists rs0's checkpoint at
    // the ddl position before the peers are released
    let ckpt = ckpt_manager.clone();
    assert!(
        wait_until(Duration::from_secs(30), || {
            workers[0].ack() == ddl_ts
                && workers[1].ack() == (300 << 32) | 2
                && workers[1].ack() == workers[1].unack()
                && ckpt.load("rs0").unwrap().ack_ts == ddl_ts
        }),
        "ddl barrier did not settle"
    );
    assert!(applied_sets[0].lock().unwrap()[0].contains(&ddl_ts));
    assert!(!applied_sets[1].lock().unwrap()[0].contains(&ddl_ts));

    // once rs1 settles, a flush reports its own tail
    ckpt_manager.flush_and_wait();
    assert_eq!(ckpt_manager.load("rs1").unwrap().ack_ts, (300 << 32) | 2);

    master.store(false, Ordering::SeqCst);
}

#[test]
fn oplog_window_lost_fails_load() {
    let dir = TempDir::new().unwrap();
    let conf = test_config(&dir, "");
    let pipeline = build_pipeline(conf, &dir, vec![], 1);

    // stored checkpoint is older than anything the source still retains
    let stale = CheckpointDoc {
        name: "rs0".to_string(),
        ack_ts: 1 << 16,
        sync_ts: 1 << 16,
        dq_name: None,
    };
    let err = pipeline
        .syncer
        .load_by_doc(&stale, Local::now())
        .unwrap_err();
    assert!(matches!(err, ReplError::OplogWindowLost { .. }));
}
