//! Bulk document copy: the full-sync phase that precedes (or runs in
//! parallel with) oplog replication.
//!
//! Collections are copied on a rayon pool, `_id`-range-partitioned when
//! large; indexes are rebuilt afterwards from `listIndexes`. The returned
//! `docEndTs` is the source's latest oplog timestamp once every copy
//! finished, the handoff point the oplog phase resumes from.

use bson::oid::ObjectId;
use bson::{doc, Document};
use crossbeam::channel;
use mongodb::options::{FindOneOptions, FindOptions};
use mongodb::sync::{Client, Collection, Database};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::Arc;
use tracing::info;

use super::oplog_helper;
use crate::config::SyncerConfig;
use crate::error::{ReplError, Result};
use crate::oplog::ts_to_u64;
use crate::{OPLOG_COLL, OPLOG_DB};

const LARGE_COLL_SIZE: u64 = 10000;

enum SyncTableStatus {
    Done,
    Failed(ReplError),
}

/// Copies the configured databases of one replica set to the destination.
pub struct DocumentSyncer {
    id: usize,
    source: Client,
    target: Client,
    conf: Arc<SyncerConfig>,
    pool: ThreadPool,
    coll_pool: Arc<ThreadPool>,
}

impl DocumentSyncer {
    pub fn new(
        id: usize,
        source_url: &str,
        conf: Arc<SyncerConfig>,
    ) -> Result<DocumentSyncer> {
        let source = Client::with_uri_str(source_url)?;
        let target = Client::with_uri_str(conf.target_url())?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(conf.collection_parallel())
            .build()
            .expect("build collection pool");
        let coll_pool = Arc::new(
            ThreadPoolBuilder::new()
                .num_threads(conf.collection_concurrent())
                .build()
                .expect("build document pool"),
        );
        Ok(DocumentSyncer {
            id,
            source,
            target,
            conf,
            pool,
            coll_pool,
        })
    }

    /// Copy every user collection and rebuild indexes. Returns the source
    /// oplog position after the copy completed (`docEndTs`).
    pub fn start(&self) -> Result<u64> {
        let db_names = self.user_databases()?;
        for db_name in &db_names {
            let namespaces = self.source.database(db_name).list_collection_names(None)?;
            if namespaces.is_empty() {
                info!(syncer = self.id, db = %db_name, "document syncer: no collections");
                continue;
            }
            self.check_drop_policy(db_name, &namespaces)?;
            self.sync_collections(db_name, &namespaces)?;
            self.sync_indexes(db_name, &namespaces)?;
        }
        let end_ts = oplog_helper::get_latest_ts(
            &self.source.database(OPLOG_DB).collection(OPLOG_COLL),
        )?;
        info!(syncer = self.id, doc_end_ts = ?end_ts, "document syncer finish");
        Ok(ts_to_u64(end_ts))
    }

    fn user_databases(&self) -> Result<Vec<String>> {
        Ok(self
            .source
            .list_database_names(None, None)?
            .into_iter()
            .filter(|name| {
                name != "admin" && name != "local" && name != "config" && name != self.conf.checkpoint_db()
            })
            .collect())
    }

    /// With the drop policy off, copying over existing destination data is
    /// refused rather than silently merged.
    fn check_drop_policy(&self, db_name: &str, namespaces: &[String]) -> Result<()> {
        let target_db = self.target.database(db_name);
        let existing = target_db.list_collection_names(None)?;
        for coll in namespaces {
            if existing.iter().any(|c| c == coll) {
                if !self.conf.collection_drop() {
                    return Err(ReplError::ApplyOplogError(doc! {
                        "error": "collection to be synced already exists in dest mongodb",
                        "ns": format!("{}.{}", db_name, coll),
                    }));
                }
                target_db.collection::<Document>(coll).drop(None)?;
            }
        }
        Ok(())
    }

    fn sync_collections(&self, db_name: &str, namespaces: &[String]) -> Result<()> {
        let (sender, receiver) = channel::bounded(self.conf.collection_parallel());
        let src_db = self.source.database(db_name);
        let target_db = self.target.database(db_name);
        let batch_size = self.conf.document_batch_size();
        let doc_concurrent = self.conf.collection_concurrent();

        let total = namespaces.len();
        for coll in namespaces {
            let sender = sender.clone();
            let source_coll = src_db.collection::<Document>(coll);
            let target_coll = target_db.collection::<Document>(coll);
            let doc_count = source_coll.estimated_document_count(None)?;

            if doc_count <= LARGE_COLL_SIZE {
                self.pool.spawn(move || {
                    if let Err(e) = sync_one_serial(source_coll, target_coll, batch_size) {
                        let _ = sender.send(SyncTableStatus::Failed(e));
                        return;
                    }
                    let _ = sender.send(SyncTableStatus::Done);
                })
            } else {
                let coll_pool = self.coll_pool.clone();
                self.pool.spawn(move || {
                    if let Err(e) = sync_one_concurrent(
                        source_coll,
                        target_coll,
                        doc_concurrent,
                        batch_size,
                        coll_pool,
                    ) {
                        let _ = sender.send(SyncTableStatus::Failed(e));
                        return;
                    }
                    let _ = sender.send(SyncTableStatus::Done);
                })
            }
        }

        let mut complete = 0;
        while let Ok(event) = receiver.recv() {
            match event {
                SyncTableStatus::Done => {
                    complete += 1;
                    info!(
                        syncer = self.id,
                        db = %db_name,
                        progress = complete * 100 / total,
                        "document syncer progress"
                    );
                    if complete == total {
                        break;
                    }
                }
                SyncTableStatus::Failed(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Index rebuild runs in the calling thread: index builds take
    /// collection-level locks at the destination anyway.
    fn sync_indexes(&self, db_name: &str, namespaces: &[String]) -> Result<()> {
        let src_db = self.source.database(db_name);
        let target_db = self.target.database(db_name);
        info!(syncer = self.id, db = %db_name, "document syncer: rebuild indexes");
        for coll in namespaces {
            let listed = src_db.run_command(doc! {"listIndexes": coll}, None)?;
            let indexes = listed.get_document("cursor")?.get_array("firstBatch")?;
            let indexes: Vec<bson::Bson> = indexes
                .iter()
                .filter(|idx| match idx {
                    // _id_ always exists at the destination
                    bson::Bson::Document(d) => d.get_str("name").map_or(true, |n| n != "_id_"),
                    _ => false,
                })
                .cloned()
                .collect();
            if indexes.is_empty() {
                continue;
            }
            target_db.run_command(
                doc! {
                    "createIndexes": coll,
                    "indexes": indexes,
                },
                None,
            )?;
        }
        Ok(())
    }
}

/// Enable sharding on the destination for every database and collection
/// the source shards, before any data lands. Mirrors the source's
/// `config.databases` / `config.collections` records.
pub fn sync_namespace_spec_for_sharding(cs_url: &str, target: &Client) -> Result<()> {
    info!("document syncer namespace spec for sharding begin");
    let cs_client = Client::with_uri_str(cs_url)?;
    let admin: Database = target.database("admin");

    let databases = cs_client
        .database("config")
        .collection::<Document>("databases");
    let cursor = databases.find(doc! {"partitioned": true}, None)?;
    for db_doc in cursor {
        let db_doc = db_doc?;
        let db_name = db_doc.get_str("_id")?;
        admin.run_command(doc! {"enablesharding": db_name}, None)?;
    }

    let collections = cs_client
        .database("config")
        .collection::<Document>("collections");
    let cursor = collections.find(doc! {"dropped": {"$ne": true}}, None)?;
    for col_doc in cursor {
        let col_doc = col_doc?;
        let ns = col_doc.get_str("_id")?;
        let key = col_doc.get_document("key")?;
        let unique = col_doc.get_bool("unique").unwrap_or(false);
        admin.run_command(
            doc! {"shardCollection": ns, "key": key.clone(), "unique": unique},
            None,
        )?;
    }
    info!("document syncer namespace spec for sharding successful");
    Ok(())
}

fn sync_one_serial(
    source_coll: Collection<Document>,
    target_coll: Collection<Document>,
    batch_size: usize,
) -> Result<()> {
    let mut buffer = Vec::with_capacity(batch_size);
    let cursor = source_coll.find(
        None,
        FindOptions::builder().batch_size(batch_size as u32).build(),
    )?;
    for doc in cursor {
        buffer.push(doc?);
        if buffer.len() == batch_size {
            let data_to_write = std::mem::replace(&mut buffer, Vec::with_capacity(batch_size));
            target_coll.insert_many(data_to_write, None)?;
        }
    }
    if !buffer.is_empty() {
        target_coll.insert_many(buffer, None)?;
    }
    Ok(())
}

fn sync_one_concurrent(
    source_coll: Collection<Document>,
    target_coll: Collection<Document>,
    doc_concurrent: usize,
    batch_size: usize,
    pool: Arc<ThreadPool>,
) -> Result<()> {
    let id_ranges = split_ids(&source_coll, doc_concurrent)?;
    let (sender, receiver) = channel::bounded(doc_concurrent);
    let range_count = id_ranges.len();
    for (id_min, id_max) in id_ranges {
        let source_coll = source_coll.clone();
        let target_coll = target_coll.clone();
        let sender = sender.clone();
        pool.spawn(move || {
            let result = copy_id_range(&source_coll, &target_coll, id_min, id_max, batch_size);
            match result {
                Err(e) => {
                    let _ = sender.send(SyncTableStatus::Failed(e));
                }
                Ok(()) => {
                    let _ = sender.send(SyncTableStatus::Done);
                }
            }
        })
    }

    let mut count = 0;
    while let Ok(event) = receiver.recv() {
        match event {
            SyncTableStatus::Failed(e) => return Err(e),
            SyncTableStatus::Done => {
                count += 1;
                if count == range_count {
                    break;
                }
            }
        }
    }
    Ok(())
}

fn copy_id_range(
    source_coll: &Collection<Document>,
    target_coll: &Collection<Document>,
    id_min: ObjectId,
    id_max: ObjectId,
    batch_size: usize,
) -> Result<()> {
    let mut buffer = Vec::with_capacity(batch_size);
    let cursor = source_coll.find(
        doc! {"_id": {"$gte": id_min, "$lte": id_max}},
        FindOptions::builder().batch_size(batch_size as u32).build(),
    )?;
    for doc in cursor {
        buffer.push(doc?);
        if buffer.len() == batch_size {
            let data_to_write = std::mem::replace(&mut buffer, Vec::with_capacity(batch_size));
            target_coll.insert_many(data_to_write, None)?;
        }
    }
    if !buffer.is_empty() {
        target_coll.insert_many(buffer, None)?;
    }
    Ok(())
}

/// Partition a collection into `doc_concurrent` `_id` ranges of roughly
/// equal document counts.
fn split_ids(
    coll: &Collection<Document>,
    doc_concurrent: usize,
) -> Result<Vec<(ObjectId, ObjectId)>> {
    let count = coll.count_documents(None, None)? as usize;
    let docs_per_worker = (count / doc_concurrent).max(1);

    let mut id_ranges = Vec::with_capacity(doc_concurrent);
    for i in 0..doc_concurrent - 1 {
        let min_id = id_at(coll, (i * docs_per_worker) as u64, 1)?;
        let max_id = id_at(coll, ((i + 1) * docs_per_worker) as u64 - 1, 1)?;
        match (min_id, max_id) {
            (Some(min), Some(max)) => id_ranges.push((min, max)),
            _ => break,
        }
    }

    // last worker takes the remaining ids
    let last_min = id_at(coll, ((doc_concurrent - 1) * docs_per_worker) as u64, 1)?;
    let last_max = id_at(coll, 0, -1)?;
    if let (Some(min), Some(max)) = (last_min, last_max) {
        id_ranges.push((min, max));
    }
    Ok(id_ranges)
}

fn id_at(coll: &Collection<Document>, skip: u64, direction: i32) -> Result<Option<ObjectId>> {
    let found = coll.find_one(
        None,
        FindOneOptions::builder()
            .sort(doc! {"_id": direction})
            .skip(skip)
            .build(),
    )?;
    Ok(found.and_then(|d| d.get_object_id("_id").ok()))
}
