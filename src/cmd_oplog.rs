//! Structured command-oplog parsing and the DDL transforms applied before
//! dispatch.
//!
//! A command entry (`op == "c"`) carries its command in `o` and names its
//! database in `ns` (`"<db>.$cmd"`). [DdlOplog::from_oplog] recognizes the
//! schema-changing commands the replicator understands; everything else is
//! forwarded verbatim.

use bson::{doc, Document};
use tracing::warn;

use crate::error::Result;
use crate::oplog::{Oplog, OpType};

/// A collection namespace split into its parts.
#[derive(Debug, PartialEq, Eq)]
pub struct CollNs<'a> {
    pub db_name: &'a str,
    pub coll_name: &'a str,
}

impl<'a> CollNs<'a> {
    pub fn new(db_name: &'a str, coll_name: &'a str) -> Self {
        CollNs { db_name, coll_name }
    }

    pub fn full(&self) -> String {
        format!("{}.{}", self.db_name, self.coll_name)
    }
}

/// Recognized schema-changing commands.
#[derive(Debug, PartialEq)]
pub enum DdlOplog<'a> {
    RenameCollection { from: CollNs<'a>, to: CollNs<'a> },
    DropCollection(CollNs<'a>),
    CreateCollection(CollNs<'a>),
    DropIndexes { ns: CollNs<'a>, name: &'a str },
    CreateIndexes { ns: CollNs<'a>, key: &'a Document, name: &'a str },
    /// A transaction envelope; its inner operations are unwrapped by
    /// [transform_db_ddl].
    ApplyOps(&'a Vec<bson::Bson>),
}

impl<'a> DdlOplog<'a> {
    /// Parse a command oplog. Returns `None` when the command is not one
    /// the replicator rewrites (it is then forwarded untouched).
    pub fn from_oplog(log: &'a Oplog) -> Result<Option<Self>> {
        let obj = &log.o;
        let db = log.db();

        if obj.contains_key("renameCollection") {
            // {"renameCollection": "a.b", "to": "a.c"}
            let rename_ns = obj.get_str("renameCollection")?;
            let (from_db, from_coll) = match rename_ns.split_once('.') {
                Some(x) => x,
                None => {
                    warn!(%rename_ns, "renameCollection value is not a namespace, command ignored.");
                    return Ok(None);
                }
            };
            let to_ns = obj.get_str("to")?;
            let (to_db, to_coll) = match to_ns.split_once('.') {
                Some(x) => x,
                None => {
                    warn!(%to_ns, "rename target is not a namespace, command ignored.");
                    return Ok(None);
                }
            };
            Ok(Some(DdlOplog::RenameCollection {
                from: CollNs::new(from_db, from_coll),
                to: CollNs::new(to_db, to_coll),
            }))
        } else if obj.contains_key("drop") {
            let coll = obj.get_str("drop")?;
            Ok(Some(DdlOplog::DropCollection(CollNs::new(db, coll))))
        } else if obj.contains_key("create") {
            let coll = obj.get_str("create")?;
            Ok(Some(DdlOplog::CreateCollection(CollNs::new(db, coll))))
        } else if obj.contains_key("createIndexes") {
            // {"createIndexes": "coll", "key": {"x": 1}, "name": "x_1", ...}
            let key = match obj.get_document("key") {
                Ok(doc) => doc,
                Err(err) => {
                    warn!(?obj, ?err, "createIndexes command without `key`, ignored.");
                    return Ok(None);
                }
            };
            let name = match obj.get_str("name") {
                Ok(name) => name,
                Err(err) => {
                    warn!(?obj, ?err, "createIndexes command without `name`, ignored.");
                    return Ok(None);
                }
            };
            let coll = obj.get_str("createIndexes")?;
            Ok(Some(DdlOplog::CreateIndexes {
                ns: CollNs::new(db, coll),
                key,
                name,
            }))
        } else if obj.contains_key("dropIndexes") {
            let name = match obj.get_str("index") {
                Ok(n) => n,
                Err(err) => {
                    warn!(?obj, ?err, "dropIndexes command without `index`, ignored.");
                    return Ok(None);
                }
            };
            let coll = obj.get_str("dropIndexes")?;
            Ok(Some(DdlOplog::DropIndexes {
                ns: CollNs::new(db, coll),
                name,
            }))
        } else if obj.contains_key("applyOps") {
            Ok(Some(DdlOplog::ApplyOps(obj.get_array("applyOps")?)))
        } else {
            Ok(None)
        }
    }
}

/// Shard key description of a collection on the source cluster, read from
/// the config server's `config.collections`.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardCollectionSpec {
    pub ns: String,
    pub key: Document,
    pub unique: bool,
}

fn command_oplog(template: &Oplog, o: Document) -> Oplog {
    Oplog {
        ts: template.ts,
        op: OpType::Command,
        ns: template.ns.clone(),
        o,
        o2: None,
        gid: template.gid.clone(),
    }
}

/// Rewrite a DDL for a plain (non-sharded) destination: an `applyOps`
/// envelope is unwrapped into its inner entries, anything else replays
/// verbatim as a DB-scoped command.
pub fn transform_db_ddl(replset: &str, log: &Oplog) -> Vec<Oplog> {
    match DdlOplog::from_oplog(log) {
        Ok(Some(DdlOplog::ApplyOps(inner))) => {
            let mut out = Vec::with_capacity(inner.len());
            for entry in inner {
                if let bson::Bson::Document(doc) = entry {
                    // inner entries carry no ts of their own; they inherit
                    // the envelope's
                    let mut doc = doc.clone();
                    doc.insert(crate::TIMESTAMP_KEY, crate::oplog::u64_to_ts(log.ts));
                    match Oplog::from_doc(doc) {
                        Ok(inner_log) => out.push(inner_log),
                        Err(err) => {
                            warn!(%replset, ?err, "applyOps inner entry is not an oplog, skipped.")
                        }
                    }
                }
            }
            out
        }
        Ok(_) => vec![log.clone()],
        Err(err) => {
            warn!(%replset, ?err, "ddl command could not be parsed, forwarded verbatim.");
            vec![log.clone()]
        }
    }
}

/// Rewrite a DDL for a sharded destination. A `create` of a collection the
/// source shards becomes `create` + `shardCollection` so the destination
/// spreads it the same way; other commands fall back to the plain rewrite.
pub fn transform_sharding_ddl(
    replset: &str,
    log: &Oplog,
    spec: &ShardCollectionSpec,
    to_is_sharding: bool,
) -> Vec<Oplog> {
    if !to_is_sharding {
        return transform_db_ddl(replset, log);
    }
    match DdlOplog::from_oplog(log) {
        Ok(Some(DdlOplog::CreateCollection(ns))) if ns.full() == spec.ns => {
            vec![
                command_oplog(log, doc! {"create": ns.coll_name}),
                command_oplog(
                    log,
                    doc! {
                        "shardCollection": spec.ns.clone(),
                        "key": spec.key.clone(),
                        "unique": spec.unique,
                    },
                ),
            ]
        }
        _ => transform_db_ddl(replset, log),
    }
}
