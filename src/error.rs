#![allow(missing_docs)]

use bson::document::ValueAccessError;
use bson::Document;
use mongodb::error::Error as MongoError;
use std::backtrace::Backtrace;
use std::result::Result as StdResult;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReplError {
    #[error("Mongodb connection error")]
    MongoError {
        #[from]
        source: MongoError,
        backtrace: Backtrace,
    },
    #[error("Mongodb document value error")]
    BsonError {
        #[from]
        source: ValueAccessError,
        backtrace: Backtrace,
    },
    #[error("Oplog entry can not be decoded")]
    OplogDecodeError {
        #[from]
        source: bson::de::Error,
        backtrace: Backtrace,
    },
    #[error("Oplog entry can not be encoded")]
    OplogEncodeError {
        #[from]
        source: bson::ser::Error,
        backtrace: Backtrace,
    },
    #[error("Disk queue io error")]
    IoError {
        #[from]
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[error("Disk queue {name:?} is corrupted at offset {offset}")]
    DiskQueueCorrupt { name: String, offset: u64 },
    #[error("Can't fetch doc from mongodb")]
    EmptyDocError,
    #[error("worker unack[{unack}] should follow up ack[{ack}]")]
    AckOverrun { ack: u64, unack: u64 },
    #[error("checkpoint not ready: {reason}")]
    CheckpointNotReady { reason: &'static str },
    #[error("checkpoint record for replset {replset:?} is illegal")]
    IllegalCheckpoint { replset: String },
    #[error(
        "source oldest oplog ts[{oldest}] is newer than checkpoint ackTs[{ack_ts}], \
         the oplog window is lost; user must re-seed from a full copy"
    )]
    OplogWindowLost { oldest: u64, ack_ts: u64 },
    #[error("oplog source is already owned by the fetcher")]
    SourceUnavailable,
    #[error("apply oplogs error")]
    ApplyOplogError(Document),
}

pub type Result<T> = StdResult<T, ReplError>;
