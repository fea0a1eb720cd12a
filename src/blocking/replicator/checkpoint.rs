//! Durable checkpoint: the per-replset record, its storage backends, and
//! the flush coordinator.
//!
//! The manager owns the single multi-reader/one-writer lock of the
//! pipeline: the batcher holds the read lease while composing and
//! dispatching a batch, the flusher takes the write lease to snapshot.
//! A barrier flush is a rendezvous: the batcher drops its lease, signals
//! the flusher and blocks until the snapshot is persisted.

use bson::doc;
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use mongodb::options::UpdateOptions;
use mongodb::sync::{Client, Collection};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{ReplError, Result};
use crate::oplog::ts_to_log;
use crate::{
    CHECKPOINT_ACK_TS_KEY, CHECKPOINT_DQ_NAME_KEY, CHECKPOINT_NAME_KEY, CHECKPOINT_SYNC_TS_KEY,
};

/// One persisted checkpoint record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointDoc {
    pub name: String,
    pub ack_ts: u64,
    pub sync_ts: u64,
    pub dq_name: Option<String>,
}

impl CheckpointDoc {
    /// Record for a replica set that has never checkpointed.
    pub fn initial(replset: &str) -> CheckpointDoc {
        CheckpointDoc {
            name: replset.to_string(),
            ack_ts: 0,
            sync_ts: 0,
            dq_name: None,
        }
    }

    pub fn to_document(&self) -> bson::Document {
        let mut doc = doc! {
            CHECKPOINT_NAME_KEY: &self.name,
            CHECKPOINT_ACK_TS_KEY: self.ack_ts as i64,
            CHECKPOINT_SYNC_TS_KEY: self.sync_ts as i64,
        };
        if let Some(dq_name) = &self.dq_name {
            doc.insert(CHECKPOINT_DQ_NAME_KEY, dq_name);
        }
        doc
    }

    pub fn from_document(doc: &bson::Document) -> Result<CheckpointDoc> {
        let name = doc.get_str(CHECKPOINT_NAME_KEY).map_err(|_| {
            ReplError::IllegalCheckpoint {
                replset: String::new(),
            }
        })?;
        let ack_ts = doc
            .get_i64(CHECKPOINT_ACK_TS_KEY)
            .map_err(|_| ReplError::IllegalCheckpoint {
                replset: name.to_string(),
            })? as u64;
        let sync_ts = doc
            .get_i64(CHECKPOINT_SYNC_TS_KEY)
            .map_err(|_| ReplError::IllegalCheckpoint {
                replset: name.to_string(),
            })? as u64;
        let dq_name = doc
            .get_str(CHECKPOINT_DQ_NAME_KEY)
            .ok()
            .map(|s| s.to_string());
        Ok(CheckpointDoc {
            name: name.to_string(),
            ack_ts,
            sync_ts,
            dq_name,
        })
    }
}

pub trait CheckpointStorage: Send + Sync {
    fn store(&self, doc: &CheckpointDoc) -> Result<()>;
    fn load(&self, replset: &str) -> Result<Option<CheckpointDoc>>;
}

/// Checkpoints in a MongoDB collection, one record per replica set,
/// upserted by name.
pub struct MongoCheckpointStorage {
    coll: Collection<bson::Document>,
}

const CHECKPOINT_COLL: &str = "replica_checkpoint";

impl MongoCheckpointStorage {
    pub fn new(url: &str, db: &str) -> Result<MongoCheckpointStorage> {
        let client = Client::with_uri_str(url)?;
        Ok(MongoCheckpointStorage {
            coll: client.database(db).collection(CHECKPOINT_COLL),
        })
    }
}

impl CheckpointStorage for MongoCheckpointStorage {
    fn store(&self, doc: &CheckpointDoc) -> Result<()> {
        self.coll.update_one(
            doc! { CHECKPOINT_NAME_KEY: &doc.name },
            doc! { "$set": doc.to_document() },
            UpdateOptions::builder().upsert(true).build(),
        )?;
        Ok(())
    }

    fn load(&self, replset: &str) -> Result<Option<CheckpointDoc>> {
        match self.coll.find_one(doc! { CHECKPOINT_NAME_KEY: replset }, None)? {
            Some(doc) => Ok(Some(CheckpointDoc::from_document(&doc)?)),
            None => Ok(None),
        }
    }
}

/// In-process storage for tests and dry runs.
#[derive(Default)]
pub struct MemoryCheckpointStorage {
    docs: Mutex<std::collections::HashMap<String, CheckpointDoc>>,
}

impl MemoryCheckpointStorage {
    pub fn new() -> MemoryCheckpointStorage {
        MemoryCheckpointStorage::default()
    }
}

impl CheckpointStorage for MemoryCheckpointStorage {
    fn store(&self, doc: &CheckpointDoc) -> Result<()> {
        self.docs
            .lock()
            .unwrap()
            .insert(doc.name.clone(), doc.clone());
        Ok(())
    }

    fn load(&self, replset: &str) -> Result<Option<CheckpointDoc>> {
        Ok(self.docs.lock().unwrap().get(replset).cloned())
    }
}

/// A syncer-side snapshot source; [crate::OplogSyncer] implements this.
pub trait CheckpointProvider: Send + Sync {
    fn flush_by_doc(&self) -> Result<CheckpointDoc>;
}

pub struct CheckpointManager {
    storage: Box<dyn CheckpointStorage>,
    lock: RwLock<()>,
    flush_tx: Sender<Sender<()>>,
    flush_rx: Receiver<Sender<()>>,
    interval: Duration,
}

impl CheckpointManager {
    pub fn new(storage: Box<dyn CheckpointStorage>, interval_ms: u64) -> CheckpointManager {
        let (flush_tx, flush_rx) = unbounded();
        CheckpointManager {
            storage,
            lock: RwLock::new(()),
            flush_tx,
            flush_rx,
            interval: Duration::from_millis(interval_ms),
        }
    }

    /// Shared lease held by the batcher across one compose-and-dispatch
    /// iteration; the flusher cannot snapshot while any lease is out.
    pub fn read_lease(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read().unwrap()
    }

    /// Stored checkpoint for `replset`, or the initial record.
    pub fn load(&self, replset: &str) -> Result<CheckpointDoc> {
        Ok(self
            .storage
            .load(replset)?
            .unwrap_or_else(|| CheckpointDoc::initial(replset)))
    }

    pub fn store(&self, doc: &CheckpointDoc) -> Result<()> {
        self.storage.store(doc)
    }

    /// Signal the flusher and block until the snapshot completed. The
    /// caller must have dropped its read lease first, or the flusher can
    /// never take the write lease.
    pub fn flush_and_wait(&self) {
        let (done_tx, done_rx) = unbounded();
        if self.flush_tx.send(done_tx).is_err() {
            warn!("checkpoint flusher is gone, flush skipped");
            return;
        }
        let _ = done_rx.recv();
    }

    /// Spawn the periodic flusher over `providers`. Flush errors are
    /// retryable: logged and retried at the next tick.
    pub fn start_flusher(self: &Arc<Self>, providers: Vec<Arc<dyn CheckpointProvider>>) {
        let manager = self.clone();
        thread::Builder::new()
            .name("checkpoint flusher".to_string())
            .spawn(move || loop {
                match manager.flush_rx.recv_timeout(manager.interval) {
                    Ok(done) => {
                        manager.flush_providers(&providers);
                        let _ = done.send(());
                    }
                    Err(RecvTimeoutError::Timeout) => manager.flush_providers(&providers),
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            })
            .expect("spawn checkpoint flusher thread");
    }

    fn flush_providers(&self, providers: &[Arc<dyn CheckpointProvider>]) {
        let _write = self.lock.write().unwrap();
        for provider in providers {
            match provider.flush_by_doc() {
                Ok(doc) => {
                    if let Err(e) = self.storage.store(&doc) {
                        warn!(?e, replset = %doc.name, "checkpoint store failed, will retry");
                    } else {
                        info!(
                            replset = %doc.name,
                            ack_ts = %ts_to_log(doc.ack_ts),
                            sync_ts = %ts_to_log(doc.sync_ts),
                            "checkpoint flushed"
                        );
                    }
                }
                Err(e) => warn!(?e, "checkpoint snapshot not ready, will retry"),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct StubProvider {
        doc: CheckpointDoc,
    }

    impl CheckpointProvider for StubProvider {
        fn flush_by_doc(&self) -> Result<CheckpointDoc> {
            Ok(self.doc.clone())
        }
    }

    #[test]
    fn test_doc_roundtrip() {
        let doc = CheckpointDoc {
            name: "rs0".to_string(),
            ack_ts: (505 << 32) | 2,
            sync_ts: (505 << 32) | 2,
            dq_name: Some("diskqueue-rs0-1".to_string()),
        };
        let roundtrip = CheckpointDoc::from_document(&doc.to_document()).unwrap();
        assert_eq!(doc, roundtrip);
    }

    #[test]
    fn test_doc_without_disk_queue_omits_key() {
        let doc = CheckpointDoc::initial("rs0");
        let bson_doc = doc.to_document();
        assert!(!bson_doc.contains_key("dqName"));
        assert_eq!(CheckpointDoc::from_document(&bson_doc).unwrap(), doc);
    }

    #[test]
    fn test_memory_storage_load_missing_gives_initial() {
        let manager = CheckpointManager::new(Box::new(MemoryCheckpointStorage::new()), 1000);
        let doc = manager.load("rs9").unwrap();
        assert_eq!(doc, CheckpointDoc::initial("rs9"));
    }

    #[test]
    fn test_flush_and_wait_persists_through_flusher() {
        let manager = Arc::new(CheckpointManager::new(
            Box::new(MemoryCheckpointStorage::new()),
            60_000,
        ));
        let provider = Arc::new(StubProvider {
            doc: CheckpointDoc {
                name: "rs0".to_string(),
                ack_ts: 100 << 32,
                sync_ts: 100 << 32,
                dq_name: None,
            },
        });
        manager.start_flusher(vec![provider]);
        manager.flush_and_wait();
        let stored = manager.load("rs0").unwrap();
        assert_eq!(stored.ack_ts, 100 << 32);
    }
}
