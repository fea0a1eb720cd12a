mod applier;
mod batcher;
mod checkpoint;
mod ddl_manager;
mod disk_queue;
mod doc_syncer;
mod journal;
mod move_chunk;
mod oplog_helper;
mod reader;
mod syncer;
mod worker;

pub use applier::DirectApplier;
pub use batcher::{Batcher, FilteredBatch};
pub use checkpoint::{
    CheckpointDoc, CheckpointManager, CheckpointProvider, CheckpointStorage,
    MemoryCheckpointStorage, MongoCheckpointStorage,
};
pub use ddl_manager::DdlManager;
pub use disk_queue::DiskQueue;
pub use doc_syncer::{sync_namespace_spec_for_sharding, DocumentSyncer};
pub use journal::Journal;
pub use move_chunk::{MoveChunkManager, NoopMoveChunkManager};
pub use reader::{FetchStatus, MongoOplogSource, OplogReader, OplogSource};
pub use syncer::OplogSyncer;
pub use worker::{wait_all_acked, Worker};
