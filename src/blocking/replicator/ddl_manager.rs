//! Cross-syncer DDL barrier coordinator.
//!
//! A schema-changing command appears once per replica set in a sharded
//! source, but must be applied at-most-once at the destination. Every
//! syncer that meets the command registers its arrival here and blocks;
//! once a majority has registered the same `(ns, ts)`, exactly one syncer
//! (the lexicographically smallest replset among the registrants) is
//! designated executor and released with `true`. The executor dispatches,
//! flushes its checkpoint and calls [DdlManager::unblock_ddl], which wakes
//! the remaining waiters with `false`.
//!
//! Barriers never time out: a stuck quorum is surfaced as a repeated
//! warning and must be resolved by the operator.

use bson::doc;
use mongodb::sync::Client;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Condvar, Mutex};
use std::time::Duration;
use tracing::{info, warn};

use crate::cmd_oplog::ShardCollectionSpec;
use crate::error::Result;
use crate::oplog::{ts_to_log, Oplog};

const STUCK_WARN_INTERVAL: Duration = Duration::from_secs(60);
const EXECUTED_KEEP: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct DdlKey {
    ns: String,
    ts: u64,
}

#[derive(Default)]
struct DdlEntry {
    arrivals: BTreeSet<String>,
    executor: Option<String>,
}

#[derive(Default)]
struct DdlState {
    blocking: HashMap<DdlKey, DdlEntry>,
    executed: HashSet<DdlKey>,
}

pub struct DdlManager {
    total_syncers: usize,
    to_is_sharding: bool,
    config_server: Option<Client>,
    state: Mutex<DdlState>,
    cond: Condvar,
}

impl DdlManager {
    /// `total_syncers` is the number of replica sets feeding this
    /// replicator; the quorum is a strict majority of it.
    pub fn new(
        total_syncers: usize,
        to_is_sharding: bool,
        config_server_url: Option<&str>,
    ) -> Result<DdlManager> {
        let config_server = match config_server_url {
            Some(url) => Some(Client::with_uri_str(url)?),
            None => None,
        };
        Ok(DdlManager {
            total_syncers,
            to_is_sharding,
            config_server,
            state: Mutex::new(DdlState::default()),
            cond: Condvar::new(),
        })
    }

    pub fn to_is_sharding(&self) -> bool {
        self.to_is_sharding
    }

    fn majority(&self) -> usize {
        self.total_syncers / 2 + 1
    }

    /// Register `replset`'s arrival at the DDL identified by `(log.ns,
    /// log.ts)` and block. Returns `true` iff this syncer is the designated
    /// executor; everyone else stays blocked until the executor unblocks
    /// and then returns `false`. A syncer arriving after the DDL already
    /// executed returns `false` immediately.
    pub fn block_ddl(&self, replset: &str, log: &Oplog) -> bool {
        let key = DdlKey {
            ns: log.ns.clone(),
            ts: log.ts,
        };
        let mut state = self.state.lock().unwrap();
        if state.executed.contains(&key) {
            info!(%replset, ns = %key.ns, ts = %ts_to_log(key.ts), "ddl already executed by a peer, skipping");
            return false;
        }

        let entry = state.blocking.entry(key.clone()).or_default();
        entry.arrivals.insert(replset.to_string());
        if entry.executor.is_none() && entry.arrivals.len() >= self.majority() {
            // smallest replset name among the registrants, so every peer
            // derives the same executor
            let executor = entry
                .arrivals
                .iter()
                .next()
                .expect("quorum entry has at least one arrival")
                .clone();
            info!(ns = %key.ns, ts = %ts_to_log(key.ts), %executor, "ddl quorum reached");
            entry.executor = Some(executor);
            self.cond.notify_all();
        }

        loop {
            match state.blocking.get(&key) {
                None => return false,
                Some(entry) => {
                    if entry.executor.as_deref() == Some(replset) {
                        return true;
                    }
                }
            }
            let (guard, timeout) = self
                .cond
                .wait_timeout(state, STUCK_WARN_INTERVAL)
                .unwrap();
            state = guard;
            if timeout.timed_out() && state.blocking.contains_key(&key) {
                warn!(
                    %replset,
                    ns = %key.ns,
                    ts = %ts_to_log(key.ts),
                    arrivals = state.blocking[&key].arrivals.len(),
                    needed = self.majority(),
                    "ddl barrier still waiting for quorum"
                );
            }
        }
    }

    /// Release the barrier after the executor dispatched and flushed.
    pub fn unblock_ddl(&self, replset: &str, log: &Oplog) {
        let key = DdlKey {
            ns: log.ns.clone(),
            ts: log.ts,
        };
        let mut state = self.state.lock().unwrap();
        state.blocking.remove(&key);
        state.executed.insert(key.clone());
        if state.executed.len() > EXECUTED_KEEP {
            prune_executed(&mut state.executed);
        }
        info!(%replset, ns = %key.ns, ts = %ts_to_log(key.ts), "ddl barrier released");
        self.cond.notify_all();
    }

    /// Shard-key description of the namespace the DDL touches, from the
    /// source config server. `None` for an unsharded namespace or when no
    /// config server is configured.
    pub fn shard_collection_spec(&self, log: &Oplog) -> Option<ShardCollectionSpec> {
        let client = self.config_server.as_ref()?;
        let target_ns = ddl_target_ns(log)?;
        let coll = client
            .database("config")
            .collection::<bson::Document>("collections");
        match coll.find_one(doc! {"_id": &target_ns, "dropped": {"$ne": true}}, None) {
            Ok(Some(doc)) => {
                let key = doc.get_document("key").ok()?.clone();
                let unique = doc.get_bool("unique").unwrap_or(false);
                Some(ShardCollectionSpec {
                    ns: target_ns,
                    key,
                    unique,
                })
            }
            Ok(None) => None,
            Err(e) => {
                warn!(?e, ns = %target_ns, "shard spec lookup failed, treating as unsharded");
                None
            }
        }
    }
}

/// The `db.coll` namespace a DDL command operates on.
fn ddl_target_ns(log: &Oplog) -> Option<String> {
    let db = log.db();
    for key in ["create", "drop", "createIndexes", "dropIndexes"] {
        if let Ok(coll) = log.o.get_str(key) {
            return Some(format!("{}.{}", db, coll));
        }
    }
    log.o
        .get_str("renameCollection")
        .ok()
        .map(|ns| ns.to_string())
}

fn prune_executed(executed: &mut HashSet<DdlKey>) {
    let mut keys: Vec<DdlKey> = executed.iter().cloned().collect();
    keys.sort_by_key(|k| k.ts);
    for key in keys.into_iter().take(executed.len() - EXECUTED_KEEP / 2) {
        executed.remove(&key);
    }
}
