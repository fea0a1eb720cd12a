//! Reference destination sender: drains one worker's batch channel and
//! applies the entries directly against the target MongoDB.
//!
//! DML is applied idempotently with batched `update`/`delete` commands
//! (inserts become upserts keyed by `_id`, so a replay after a crash
//! converges); command entries run one by one via `run_command`. After a
//! batch lands, the worker's `ack` advances to the batch's max timestamp.

use bson::{doc, Bson, Document};
use crossbeam::channel::Receiver;
use mongodb::sync::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{info, warn};

use super::worker::Worker;
use crate::error::{ReplError, Result};
use crate::metrics::ReplicationMetric;
use crate::oplog::{GenericOplog, Oplog, OpType};

pub struct DirectApplier {
    target: Client,
    worker: Arc<Worker>,
    metric: Arc<ReplicationMetric>,
}

impl DirectApplier {
    pub fn new(
        target_url: &str,
        worker: Arc<Worker>,
        metric: Arc<ReplicationMetric>,
    ) -> Result<DirectApplier> {
        Ok(DirectApplier {
            target: Client::with_uri_str(target_url)?,
            worker,
            metric,
        })
    }

    /// Consume `batch_rx` until the worker hangs up. Apply failures are
    /// retried in place; the ack clock only advances past applied entries.
    pub fn start(self, batch_rx: Receiver<Vec<GenericOplog>>) -> JoinHandle<()> {
        thread::Builder::new()
            .name(format!("applier-{}", self.worker.id()))
            .spawn(move || {
                while let Ok(batch) = batch_rx.recv() {
                    let max_ts = batch.iter().map(|log| log.parsed.ts).max().unwrap_or(0);
                    let count = batch.len() as u64;
                    loop {
                        match self.apply_batch(&batch) {
                            Ok(()) => break,
                            Err(e) => {
                                warn!(
                                    worker = self.worker.id(),
                                    ?e,
                                    "apply batch failed, retransmitting"
                                );
                                self.metric.add_retransmission(1);
                                thread::sleep(std::time::Duration::from_millis(
                                    crate::DURATION_TIME_MS,
                                ));
                            }
                        }
                    }
                    if max_ts != 0 {
                        self.worker.set_ack(max_ts);
                    }
                    self.metric.add_success(count);
                }
                info!(worker = self.worker.id(), "applier exiting");
            })
            .expect("spawn applier thread")
    }

    fn apply_batch(&self, batch: &[GenericOplog]) -> Result<()> {
        // runs of CRUD entries are applied together; a command flushes the
        // run and executes alone
        let mut run: Vec<&Oplog> = Vec::with_capacity(batch.len());
        for log in batch {
            match log.parsed.op {
                OpType::Command => {
                    if !run.is_empty() {
                        self.apply_dml_run(&run)?;
                        run.clear();
                    }
                    self.apply_command(&log.parsed)?;
                }
                OpType::Noop => {}
                _ => run.push(&log.parsed),
            }
        }
        if !run.is_empty() {
            self.apply_dml_run(&run)?;
        }
        Ok(())
    }

    fn apply_command(&self, log: &Oplog) -> Result<()> {
        info!(ns = %log.ns, "applying command oplog");
        self.target
            .database(log.db())
            .run_command(log.o.clone(), None)?;
        Ok(())
    }

    /// Convert a run of CRUD entries into batched `update`/`delete`
    /// commands per collection, flushing whenever the statement kind
    /// changes between upsert-like and delete.
    fn apply_dml_run(&self, run: &[&Oplog]) -> Result<()> {
        let mut statements: Vec<(String, String, Document)> = Vec::with_capacity(run.len());
        let mut current_delete = is_delete(run[0]);
        for log in run {
            let id = match log.effective_id() {
                Some(id) => id.clone(),
                None => {
                    warn!(ns = %log.ns, "dml entry without _id, ignored");
                    continue;
                }
            };
            let coll = match log.coll() {
                Some(coll) => coll.to_string(),
                None => {
                    warn!(ns = %log.ns, "dml entry with bare namespace, ignored");
                    continue;
                }
            };

            if is_delete(log) != current_delete {
                self.flush_statements(current_delete, &mut statements)?;
                current_delete = is_delete(log);
            }

            let statement = match log.parsed_statement(id) {
                Some(s) => s,
                None => continue,
            };
            statements.push((log.db().to_string(), coll, statement));
        }
        self.flush_statements(current_delete, &mut statements)?;
        Ok(())
    }

    fn flush_statements(
        &self,
        delete: bool,
        statements: &mut Vec<(String, String, Document)>,
    ) -> Result<()> {
        if statements.is_empty() {
            return Ok(());
        }
        let (command, payload_key) = if delete {
            ("delete", "deletes")
        } else {
            ("update", "updates")
        };
        let mut per_coll: HashMap<(String, String), Vec<Document>> = HashMap::new();
        for (db, coll, statement) in statements.drain(..) {
            per_coll.entry((db, coll)).or_default().push(statement);
        }
        for ((db, coll), docs) in per_coll {
            let result = self.target.database(&db).run_command(
                doc! {
                    command: coll,
                    payload_key: docs,
                },
                None,
            )?;
            if result.contains_key("writeErrors") {
                return Err(ReplError::ApplyOplogError(result));
            }
        }
        Ok(())
    }
}

fn is_delete(log: &Oplog) -> bool {
    log.op == OpType::Delete
}

impl Oplog {
    /// One statement document for the destination's `update`/`delete`
    /// command, or `None` when the entry cannot be rendered.
    fn parsed_statement(&self, id: Bson) -> Option<Document> {
        match self.op {
            OpType::Update => {
                let mut obj = self.o.clone();
                let is_modifier = obj.keys().any(|k| k.starts_with('$'));
                if is_modifier {
                    // $v is mongodb-internal, never send it back
                    obj.remove("$v");
                }
                Some(doc! {
                    "q": {"_id": id},
                    "u": obj,
                    // a whole-document update replays as an upsert
                    "upsert": !is_modifier,
                })
            }
            // inserts replay as upserts so re-delivery converges
            OpType::Insert => Some(doc! {
                "q": {"_id": id},
                "u": self.o.clone(),
                "upsert": true,
            }),
            OpType::Delete => Some(doc! {
                "q": {"_id": id},
                "limit": 1,
            }),
            OpType::Command | OpType::Noop => None,
        }
    }
}
