//! Oplog fetch front-end: the source driver abstraction, the resumable
//! fetch state machine, and the fetcher thread feeding the pipeline.
//!
//! The reader sits between the source cursor and the syncer's raw buffer.
//! Depending on the fetch status, frames either flow straight into the
//! in-memory channel (`StoreMemoryApply`), are spilled to the disk queue
//! while the document phase is still copying (`StoreDiskNoApply`), or are
//! replayed from the disk queue before the live tail resumes
//! (`StoreDiskApply`). Transitions are driven solely by the hosting syncer.

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use mongodb::options::{CursorType, FindOptions};
use mongodb::sync::{Client, Cursor};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

use super::disk_queue::DiskQueue;
use super::oplog_helper;
use crate::error::{ReplError, Result};
use crate::oplog::{ts_to_log, ts_to_u64, u64_to_ts};
use crate::{DURATION_TIME_MS, OPLOG_COLL, OPLOG_DB, READER_TIMEOUT_MS, TIMESTAMP_KEY};

const READER_CHANNEL_LEN: usize = 256;

/// Fetch state machine of one syncer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FetchStatus {
    /// live tail; no disk spill.
    StoreMemoryApply = 0,
    /// document phase running; frames are spilled to disk, nothing flows
    /// downstream.
    StoreDiskNoApply = 1,
    /// document phase done; drain the disk queue first, then resume the
    /// live tail.
    StoreDiskApply = 2,
}

impl FetchStatus {
    fn from_u8(v: u8) -> FetchStatus {
        match v {
            1 => FetchStatus::StoreDiskNoApply,
            2 => FetchStatus::StoreDiskApply,
            _ => FetchStatus::StoreMemoryApply,
        }
    }
}

/// The oplog source driver: a cursor yielding raw BSON frames.
///
/// `next` returns `Ok(None)` as the benign "no data yet" signal; errors are
/// transient and the fetcher restarts the cursor via `restart_from`.
pub trait OplogSource: Send {
    fn next(&mut self) -> Result<Option<Vec<u8>>>;
    fn restart_from(&mut self, ts: u64) -> Result<()>;
    /// Oldest timestamp still retained by the source, for the
    /// oplog-window check at checkpoint load.
    fn oldest_ts(&mut self) -> Result<u64>;
}

/// Tailable-await cursor over `local.oplog.rs`.
pub struct MongoOplogSource {
    client: Client,
    position: u64,
    cursor: Option<Cursor<bson::Document>>,
}

impl MongoOplogSource {
    pub fn new(url: &str) -> Result<MongoOplogSource> {
        let client = Client::with_uri_str(url)?;
        Ok(MongoOplogSource {
            client,
            position: 0,
            cursor: None,
        })
    }

    fn oplog_coll(&self) -> mongodb::sync::Collection<bson::Document> {
        self.client.database(OPLOG_DB).collection(OPLOG_COLL)
    }

    fn build_cursor(&self) -> Result<Cursor<bson::Document>> {
        let filter = bson::doc! {TIMESTAMP_KEY: {"$gte": u64_to_ts(self.position)}};
        let options = FindOptions::builder()
            .cursor_type(CursorType::TailableAwait)
            .no_cursor_timeout(true)
            .build();
        Ok(self.oplog_coll().find(filter, options)?)
    }
}

impl OplogSource for MongoOplogSource {
    fn next(&mut self) -> Result<Option<Vec<u8>>> {
        if self.cursor.is_none() {
            self.cursor = Some(self.build_cursor()?);
        }
        let next = match self.cursor.as_mut() {
            Some(cursor) => cursor.next(),
            None => return Ok(None),
        };
        match next {
            Some(Ok(doc)) => {
                self.position = ts_to_u64(doc.get_timestamp(TIMESTAMP_KEY)?);
                Ok(Some(bson::to_vec(&doc)?))
            }
            Some(Err(e)) => {
                self.cursor = None;
                Err(e.into())
            }
            // tailable cursor died (e.g. rollover); rebuild on the next call
            None => {
                self.cursor = None;
                Ok(None)
            }
        }
    }

    fn restart_from(&mut self, ts: u64) -> Result<()> {
        self.position = ts;
        self.cursor = None;
        Ok(())
    }

    fn oldest_ts(&mut self) -> Result<u64> {
        Ok(ts_to_u64(oplog_helper::get_earliest_ts(&self.oplog_coll())?))
    }
}

pub struct OplogReader {
    source: Mutex<Option<Box<dyn OplogSource>>>,
    frame_tx: Sender<Vec<u8>>,
    frame_rx: Receiver<Vec<u8>>,
    query_ts: AtomicU64,
    fetch_status: AtomicU8,
    fetcher_started: AtomicBool,
    disk_queue: Mutex<Option<DiskQueue>>,
    log_dir: PathBuf,
}

impl OplogReader {
    pub fn new(source: Box<dyn OplogSource>, log_dir: PathBuf) -> OplogReader {
        let (frame_tx, frame_rx) = bounded(READER_CHANNEL_LEN);
        OplogReader {
            source: Mutex::new(Some(source)),
            frame_tx,
            frame_rx,
            query_ts: AtomicU64::new(0),
            fetch_status: AtomicU8::new(FetchStatus::StoreMemoryApply as u8),
            fetcher_started: AtomicBool::new(false),
            disk_queue: Mutex::new(None),
            log_dir,
        }
    }

    /// Next raw frame for the pipeline, honoring the fetch status.
    /// `Ok(None)` means no data yet and doubles as the buffer-flush tick.
    pub fn next(&self) -> Result<Option<Vec<u8>>> {
        match self.fetch_status() {
            // the fetcher diverts frames to disk in the NoApply state, so
            // the channel stays empty and this naturally reports idle
            FetchStatus::StoreMemoryApply | FetchStatus::StoreDiskNoApply => {
                match self.frame_rx.recv_timeout(Duration::from_millis(READER_TIMEOUT_MS)) {
                    Ok(frame) => Ok(Some(frame)),
                    Err(RecvTimeoutError::Timeout) => Ok(None),
                    Err(RecvTimeoutError::Disconnected) => Ok(None),
                }
            }
            FetchStatus::StoreDiskApply => self.next_from_disk(),
        }
    }

    fn next_from_disk(&self) -> Result<Option<Vec<u8>>> {
        let mut guard = self.disk_queue.lock().unwrap();
        match guard.as_mut() {
            Some(queue) => {
                if let Some(frame) = queue.pop()? {
                    return Ok(Some(frame));
                }
                queue.flush()?;
                if let Some(frame) = queue.pop()? {
                    return Ok(Some(frame));
                }
                // fully drained: switch to the live tail while still
                // holding the queue lock, so the fetcher cannot append a
                // frame in between
                let queue = guard.take().expect("queue checked above");
                info!(
                    name = queue.name(),
                    query_ts = %ts_to_log(queue.query_ts()),
                    "disk queue drained, resuming live tail"
                );
                queue.remove()?;
                self.update_fetch_status(FetchStatus::StoreMemoryApply);
                Ok(None)
            }
            None => {
                self.update_fetch_status(FetchStatus::StoreMemoryApply);
                Ok(None)
            }
        }
    }

    /// Spawn the fetcher thread; repeated calls are no-ops.
    pub fn start_fetcher(self: &Arc<Self>) {
        if self.fetcher_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut source = match self.source.lock().unwrap().take() {
            Some(source) => source,
            None => {
                warn!("oplog source already taken, fetcher not started");
                return;
            }
        };
        let reader = self.clone();
        thread::Builder::new()
            .name("oplog fetcher".to_string())
            .spawn(move || {
                let start_ts = reader.query_timestamp();
                if let Err(e) = source.restart_from(start_ts) {
                    warn!(?e, "fetcher initial positioning failed");
                }
                info!(query_ts = %ts_to_log(start_ts), "oplog fetcher started");
                loop {
                    match source.next() {
                        Ok(Some(frame)) => reader.route_frame(frame),
                        // the cursor went quiet; pace the rebuild
                        Ok(None) => thread::sleep(Duration::from_millis(READER_TIMEOUT_MS)),
                        Err(e) => {
                            warn!(?e, "transient fetch error, retrying");
                            thread::sleep(Duration::from_millis(DURATION_TIME_MS));
                            let ts = reader.query_timestamp();
                            if let Err(e) = source.restart_from(ts) {
                                warn!(?e, "fetcher reposition failed");
                            }
                        }
                    }
                }
            })
            .expect("spawn oplog fetcher thread");
    }

    /// Send one frame downstream or spill it, per the current status. The
    /// disk-queue lock spans the status check so the drain hand-off in
    /// `next_from_disk` can never lose a frame.
    fn route_frame(&self, frame: Vec<u8>) {
        let mut frame = frame;
        loop {
            let spill = {
                let mut guard = self.disk_queue.lock().unwrap();
                if self.fetch_status() != FetchStatus::StoreMemoryApply {
                    if let Some(queue) = guard.as_mut() {
                        let ts = frame_ts(&frame);
                        if let Err(e) = queue.append(&frame, ts) {
                            error!(?e, "disk queue append failed");
                            panic!("disk queue append failed: {e}");
                        }
                        true
                    } else {
                        false
                    }
                } else {
                    false
                }
            };
            if spill {
                return;
            }
            // a full channel blocks the fetcher: the sole source of
            // upstream backpressure
            match self
                .frame_tx
                .send_timeout(frame, Duration::from_millis(READER_TIMEOUT_MS))
            {
                Ok(()) => return,
                Err(crossbeam::channel::SendTimeoutError::Timeout(returned)) => {
                    // status may have flipped to a disk mode meanwhile
                    frame = returned;
                }
                Err(crossbeam::channel::SendTimeoutError::Disconnected(_)) => return,
            }
        }
    }

    pub fn update_query_timestamp(&self, ts: u64) {
        self.query_ts.store(ts, Ordering::SeqCst);
    }

    pub fn query_timestamp(&self) -> u64 {
        self.query_ts.load(Ordering::SeqCst)
    }

    pub fn update_fetch_status(&self, status: FetchStatus) {
        self.fetch_status.store(status as u8, Ordering::SeqCst);
    }

    pub fn fetch_status(&self) -> FetchStatus {
        FetchStatus::from_u8(self.fetch_status.load(Ordering::SeqCst))
    }

    /// Attach a disk queue: re-open an existing spill of that name or
    /// create a fresh one.
    pub fn init_disk_queue(&self, name: &str) -> Result<()> {
        let queue = if DiskQueue::meta_exists(&self.log_dir, name) {
            DiskQueue::open(&self.log_dir, name)?
        } else {
            DiskQueue::create(&self.log_dir, name)?
        };
        *self.disk_queue.lock().unwrap() = Some(queue);
        Ok(())
    }

    /// Resume point recorded in the attached disk queue's metadata; 0 when
    /// the queue is gone.
    pub fn query_ts_from_disk_queue(&self) -> u64 {
        self.disk_queue
            .lock()
            .unwrap()
            .as_ref()
            .map(|q| q.query_ts())
            .unwrap_or(0)
    }

    pub fn disk_queue_name(&self) -> Option<String> {
        self.disk_queue
            .lock()
            .unwrap()
            .as_ref()
            .map(|q| q.name().to_string())
    }

    pub fn disk_queue_exists(&self, name: &str) -> bool {
        DiskQueue::meta_exists(&self.log_dir, name)
    }

    /// Oldest timestamp the source retains. Only callable before the
    /// fetcher takes ownership of the source, i.e. during checkpoint load.
    pub fn oldest_source_ts(&self) -> Result<u64> {
        let mut guard = self.source.lock().unwrap();
        match guard.as_mut() {
            Some(source) => source.oldest_ts(),
            None => Err(ReplError::SourceUnavailable),
        }
    }
}

fn frame_ts(frame: &[u8]) -> u64 {
    bson::Document::from_reader(frame)
        .ok()
        .and_then(|doc| doc.get_timestamp(TIMESTAMP_KEY).ok())
        .map(ts_to_u64)
        .unwrap_or(0)
}
