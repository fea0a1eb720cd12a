//! Oplog-to-worker routing policies.
//!
//! The hash output mod the worker count picks the destination worker, so
//! every oplog touching the same routing key lands on the same worker and
//! keeps its source order there. Commands and noops always route to worker
//! 0: barriers drain every worker before dispatch, so pinning them costs
//! nothing and keeps DDL single-streamed.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::oplog::{Oplog, OpType};

pub trait OplogHasher: Send + Sync {
    /// Routing hash for `log`; the caller takes it mod the worker count.
    fn distribute(&self, log: &Oplog) -> u64;
}

fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

/// Routes by namespace: one collection, one worker.
pub struct TableHasher;

impl OplogHasher for TableHasher {
    fn distribute(&self, log: &Oplog) -> u64 {
        match log.op {
            OpType::Command | OpType::Noop => 0,
            _ => hash_bytes(log.ns.as_bytes()),
        }
    }
}

/// Routes by the effective `_id`, spreading a hot collection over every
/// worker while keeping each document single-streamed.
pub struct PrimaryKeyHasher;

impl OplogHasher for PrimaryKeyHasher {
    fn distribute(&self, log: &Oplog) -> u64 {
        match log.op {
            OpType::Command | OpType::Noop => 0,
            _ => match log.effective_id() {
                // canonical bson bytes give a stable identity across numeric
                // and composite _id types
                Some(id) => {
                    let wrapped = bson::doc! {"_id": id.clone()};
                    hash_bytes(&bson::to_vec(&wrapped).unwrap_or_default())
                }
                None => hash_bytes(log.ns.as_bytes()),
            },
        }
    }
}
