//! Replicator configuration, expressed in toml.
//!
//! Basic configuration file example:
//! ```toml
//! [collector]
//! id = "repl-01"
//! log_directory = "/var/log/mongo-repl"
//!
//! [source]
//! # one entry per replica set; more than one entry means the source is a
//! # sharded cluster (single pipeline queue, cross-syncer DDL gating).
//! replsets = [
//!     { name = "rs0", url = "mongodb://localhost:27017/?authSource=admin" },
//! ]
//! # config server url, only meaningful for a sharded source.
//! # config_server_url = "mongodb://localhost:27019"
//!
//! [target]
//! url = "mongodb://localhost:27018/?authSource=admin"
//! is_sharding = false
//!
//! [checkpoint]
//! url = "mongodb://localhost:27018"
//! db = "mongo_repl"
//! interval_ms = 5000
//! ```
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Oplog-to-worker routing policy.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardKey {
    /// route by namespace.
    ByNamespace,
    /// route by the effective `_id`.
    ById,
}

/// Global replicator configuration.
#[derive(Deserialize, Debug)]
pub struct SyncerConfig {
    collector: Collector,
    source: Source,
    target: Target,
    checkpoint: Checkpoint,
    #[serde(default)]
    filter: Filter,
    #[serde(default)]
    replayer: Replayer,
}

#[derive(Deserialize, Debug)]
struct Collector {
    /// identity reported by the status endpoint and stamped on journals.
    id: String,
    /// directory for disk queues and journals.
    #[serde(default = "default_log_directory")]
    log_directory: PathBuf,
    /// raw frames buffered before a push to the pending queue.
    #[serde(default = "default_fetcher_buffer_capacity")]
    fetcher_buffer_capacity: usize,
    /// workers per syncer.
    #[serde(default = "default_worker_count")]
    worker_count: usize,
    /// poll-loop TPS ceiling, 0 means unlimited.
    #[serde(default)]
    sentinel_tps: u64,
    /// record every observed oplog to an audit journal.
    #[serde(default)]
    enable_journal: bool,
}

/// One source replica set.
#[derive(Deserialize, Debug, Clone)]
pub struct ReplsetSource {
    pub name: String,
    pub url: String,
}

#[derive(Deserialize, Debug)]
struct Source {
    replsets: Vec<ReplsetSource>,
    /// config server url of a sharded source, for shard-spec lookups.
    config_server_url: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Target {
    url: String,
    #[serde(default)]
    is_sharding: bool,
}

#[derive(Deserialize, Debug)]
struct Checkpoint {
    url: String,
    #[serde(default = "default_checkpoint_db")]
    db: String,
    /// periodic checkpoint tick, in milliseconds.
    #[serde(default = "default_checkpoint_interval_ms")]
    interval_ms: u64,
}

#[derive(Deserialize, Debug)]
struct Filter {
    /// replay DML only, dropping schema-changing commands.
    #[serde(default)]
    dml_only: bool,
    #[serde(default)]
    namespace_white: Vec<String>,
    #[serde(default)]
    namespace_black: Vec<String>,
    /// allowed origin tags; empty keeps everything.
    #[serde(default)]
    oplog_gids: Vec<String>,
    /// seconds of fully-filtered tail after which the checkpoint is
    /// force-advanced.
    #[serde(default = "default_filter_checkpoint_gap")]
    checkpoint_gap_secs: u64,
}

impl Default for Filter {
    fn default() -> Self {
        Filter {
            dml_only: false,
            namespace_white: Vec::new(),
            namespace_black: Vec::new(),
            oplog_gids: Vec::new(),
            checkpoint_gap_secs: default_filter_checkpoint_gap(),
        }
    }
}

#[derive(Deserialize, Debug)]
struct Replayer {
    /// routing policy between workers.
    #[serde(default = "default_shard_key")]
    shard_key: ShardKey,
    /// collections copied concurrently during the document phase.
    #[serde(default = "number_of_cpus")]
    collection_parallel: usize,
    /// threads used to copy a single large collection.
    #[serde(default = "half_number_of_cpus")]
    collection_concurrent: usize,
    /// documents per insert batch during the document phase.
    #[serde(default = "default_document_batch_size")]
    document_batch_size: usize,
    /// drop destination collections before the full copy; refuse to copy
    /// over existing data otherwise.
    #[serde(default)]
    collection_drop: bool,
}

impl Default for Replayer {
    fn default() -> Self {
        Replayer {
            shard_key: default_shard_key(),
            collection_parallel: number_of_cpus(),
            collection_concurrent: half_number_of_cpus(),
            document_batch_size: default_document_batch_size(),
            collection_drop: false,
        }
    }
}

fn default_log_directory() -> PathBuf {
    PathBuf::from("./mongo-repl-data")
}

fn default_fetcher_buffer_capacity() -> usize {
    256
}

fn default_worker_count() -> usize {
    8
}

fn default_checkpoint_db() -> String {
    "mongo_repl".to_string()
}

fn default_checkpoint_interval_ms() -> u64 {
    5000
}

fn default_filter_checkpoint_gap() -> u64 {
    60
}

fn default_shard_key() -> ShardKey {
    ShardKey::ById
}

fn default_document_batch_size() -> usize {
    10000
}

fn number_of_cpus() -> usize {
    num_cpus::get()
}

fn half_number_of_cpus() -> usize {
    (num_cpus::get() / 2).max(1)
}

impl SyncerConfig {
    pub fn from_toml(data: &str) -> Result<SyncerConfig, toml::de::Error> {
        toml::from_str(data)
    }

    pub fn collector_id(&self) -> &str {
        &self.collector.id
    }

    pub fn log_directory(&self) -> &Path {
        &self.collector.log_directory
    }

    pub fn fetcher_buffer_capacity(&self) -> usize {
        self.collector.fetcher_buffer_capacity
    }

    pub fn worker_count(&self) -> usize {
        self.collector.worker_count
    }

    pub fn sentinel_tps(&self) -> u64 {
        self.collector.sentinel_tps
    }

    pub fn enable_journal(&self) -> bool {
        self.collector.enable_journal
    }

    pub fn replsets(&self) -> &[ReplsetSource] {
        &self.source.replsets
    }

    /// A source with more than one replica set is a sharded cluster: the
    /// pipeline shrinks to one queue to preserve inter-shard ordering and
    /// DDL gating turns on.
    pub fn is_shard_cluster(&self) -> bool {
        self.source.replsets.len() > 1
    }

    pub fn config_server_url(&self) -> Option<&str> {
        self.source.config_server_url.as_deref()
    }

    pub fn target_url(&self) -> &str {
        &self.target.url
    }

    pub fn target_is_sharding(&self) -> bool {
        self.target.is_sharding
    }

    pub fn checkpoint_url(&self) -> &str {
        &self.checkpoint.url
    }

    pub fn checkpoint_db(&self) -> &str {
        &self.checkpoint.db
    }

    pub fn checkpoint_interval_ms(&self) -> u64 {
        self.checkpoint.interval_ms
    }

    pub fn dml_only(&self) -> bool {
        self.filter.dml_only
    }

    pub fn namespace_white(&self) -> &[String] {
        &self.filter.namespace_white
    }

    pub fn namespace_black(&self) -> &[String] {
        &self.filter.namespace_black
    }

    pub fn oplog_gids(&self) -> &[String] {
        &self.filter.oplog_gids
    }

    pub fn filter_checkpoint_gap_secs(&self) -> u64 {
        self.filter.checkpoint_gap_secs
    }

    pub fn shard_key(&self) -> ShardKey {
        self.replayer.shard_key
    }

    pub fn collection_parallel(&self) -> usize {
        self.replayer.collection_parallel
    }

    pub fn collection_concurrent(&self) -> usize {
        self.replayer.collection_concurrent
    }

    pub fn document_batch_size(&self) -> usize {
        self.replayer.document_batch_size
    }

    pub fn collection_drop(&self) -> bool {
        self.replayer.collection_drop
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const MINIMAL: &str = r#"
        [collector]
        id = "repl-01"

        [source]
        replsets = [
            { name = "rs0", url = "mongodb://localhost:27017" },
        ]

        [target]
        url = "mongodb://localhost:27018"

        [checkpoint]
        url = "mongodb://localhost:27018"
    "#;

    #[test]
    fn test_minimal_config_defaults() {
        let conf = SyncerConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(conf.collector_id(), "repl-01");
        assert!(!conf.is_shard_cluster());
        assert_eq!(conf.fetcher_buffer_capacity(), 256);
        assert_eq!(conf.checkpoint_interval_ms(), 5000);
        assert_eq!(conf.shard_key(), ShardKey::ById);
        assert_eq!(conf.filter_checkpoint_gap_secs(), 60);
        assert!(!conf.dml_only());
    }

    #[test]
    fn test_sharded_source_detection() {
        let toml = r#"
            [collector]
            id = "repl-01"

            [source]
            replsets = [
                { name = "rs0", url = "mongodb://localhost:27017" },
                { name = "rs1", url = "mongodb://localhost:27027" },
            ]
            config_server_url = "mongodb://localhost:27019"

            [target]
            url = "mongodb://localhost:27018"
            is_sharding = true

            [checkpoint]
            url = "mongodb://localhost:27018"

            [filter]
            namespace_black = ["db.secret"]

            [replayer]
            shard_key = "ByNamespace"
        "#;
        let conf = SyncerConfig::from_toml(toml).unwrap();
        assert!(conf.is_shard_cluster());
        assert!(conf.target_is_sharding());
        assert_eq!(conf.shard_key(), ShardKey::ByNamespace);
        assert_eq!(conf.namespace_black(), ["db.secret".to_string()]);
        assert_eq!(conf.config_server_url(), Some("mongodb://localhost:27019"));
    }
}
