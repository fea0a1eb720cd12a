#![feature(error_generic_member_access)]

mod blocking;
mod cmd_oplog;
mod config;
mod error;
mod filter;
mod hasher;
mod metrics;
mod oplog;

const OPLOG_DB: &str = "local";
const OPLOG_COLL: &str = "oplog.rs";

// oplog relative keys.
const TIMESTAMP_KEY: &str = "ts";
const OP_KEY: &str = "op";
const NAMESPACE_KEY: &str = "ns";
const OBJECT_KEY: &str = "o";
const OBJECT2_KEY: &str = "o2";
const GID_KEY: &str = "g";

// op codes.
const INSERT_OP: &str = "i";
const UPDATE_OP: &str = "u";
const DELETE_OP: &str = "d";
const COMMAND_OP: &str = "c";
const NOOP_OP: &str = "n";

// a noop carrying this key forces a checkpoint flush (stream barrier).
const FORCE_CHECKPOINT_KEY: &str = "forceCheckpoint";

// bson deserialize workload is a CPU-intensive task.
const PIPELINE_QUEUE_MAX_NR: usize = 4;
const PIPELINE_QUEUE_MIN_NR: usize = 1;
const PIPELINE_QUEUE_LEN: usize = 64;

/// Retry cadence after a fetch error, in milliseconds.
const DURATION_TIME_MS: u64 = 6000;
/// Reader-side receive timeout: the benign "no data yet" granularity.
const READER_TIMEOUT_MS: u64 = 1000;
/// Spin interval while waiting on worker acks, in milliseconds.
const ACK_WAIT_INTERVAL_MS: u64 = 100;
/// Max number of parsed entries merged into one dispatch batch.
const ADAPTIVE_BATCHING_MAX_SIZE: usize = 16384;

/// Checkpoint epoch for a first run: seconds = 1, ordinal = 0.
const CHECKPOINT_EPOCH_TS: u64 = 1 << 32;

// checkpoint document keys.
const CHECKPOINT_NAME_KEY: &str = "name";
const CHECKPOINT_ACK_TS_KEY: &str = "ackTs";
const CHECKPOINT_SYNC_TS_KEY: &str = "syncTs";
const CHECKPOINT_DQ_NAME_KEY: &str = "dqName";

pub use blocking::replicator::{
    sync_namespace_spec_for_sharding, wait_all_acked, Batcher, CheckpointDoc, CheckpointManager,
    CheckpointProvider, CheckpointStorage, DdlManager, DirectApplier, DiskQueue, DocumentSyncer,
    FetchStatus, FilteredBatch, Journal, MemoryCheckpointStorage, MongoCheckpointStorage,
    MongoOplogSource, MoveChunkManager, NoopMoveChunkManager, OplogReader, OplogSource,
    OplogSyncer, Worker,
};
pub use cmd_oplog::{
    transform_db_ddl, transform_sharding_ddl, CollNs, DdlOplog, ShardCollectionSpec,
};
pub use config::{ReplsetSource, ShardKey, SyncerConfig};
pub use error::{ReplError, Result};
pub use filter::{
    AutologousFilter, DdlFilter, FilterChain, GidFilter, NamespaceFilter, OplogFilter,
};
pub use hasher::{OplogHasher, PrimaryKeyHasher, TableHasher};
pub use metrics::{ReplicationMetric, SimpleRateController, SyncerStatus};
pub use oplog::{ts_seconds, ts_to_datetime, ts_to_log, ts_to_u64, u64_to_ts, GenericOplog, Oplog, OpType};
