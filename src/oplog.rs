//! Parsed oplog model and timestamp helpers.
//!
//! Most oplog information comes from here:
//! https://github.com/mongodb/mongo/blob/master/src/mongo/db/repl/oplog_entry.idl
//! https://github.com/mongodb/mongo/blob/master/src/mongo/idl/basic_types.idl
//!
//! Useful fields:
//! ts: The time when the oplog entry was created. (Timestamp)
//! op: The operation type. ("i" / "u" / "d" / "c" / "n")
//! ns: The namespace on which to apply the operation. (String)
//! o: The operation applied. (Document)
//! o2: Additional information about the operation applied. (Document)
//! g: Optional gid tag marking the origin of the entry.
//!
//! Throughout the pipeline a timestamp is carried as a packed `u64`:
//! seconds in the upper 32 bits, ordinal in the lower 32. Worker and
//! syncer clocks are plain `AtomicU64` over this representation.

use bson::{Document, Timestamp};
use chrono::{DateTime, Local, TimeZone};

use crate::error::{ReplError, Result};
use crate::{
    COMMAND_OP, DELETE_OP, FORCE_CHECKPOINT_KEY, GID_KEY, INSERT_OP, NAMESPACE_KEY, NOOP_OP,
    OBJECT2_KEY, OBJECT_KEY, OP_KEY, TIMESTAMP_KEY, UPDATE_OP,
};

/// Pack a bson [Timestamp] into the pipeline's `u64` representation.
pub fn ts_to_u64(ts: Timestamp) -> u64 {
    ((ts.time as u64) << 32) | ts.increment as u64
}

/// Unpack a pipeline timestamp back into a bson [Timestamp].
pub fn u64_to_ts(ts: u64) -> Timestamp {
    Timestamp {
        time: (ts >> 32) as u32,
        increment: ts as u32,
    }
}

/// Seconds part of a packed timestamp.
pub fn ts_seconds(ts: u64) -> u64 {
    ts >> 32
}

/// Render a packed timestamp as `<seconds>:<ordinal>` for logging.
pub fn ts_to_log(ts: u64) -> String {
    format!("{}:{}", ts >> 32, ts as u32)
}

/// Wall-clock view of a packed timestamp.
pub fn ts_to_datetime(ts: u64) -> DateTime<Local> {
    Local
        .timestamp_opt(ts_seconds(ts) as i64, 0)
        .single()
        .unwrap_or_else(|| Local.timestamp_opt(0, 0).single().unwrap())
}

/// The operation type of an oplog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    Insert,
    Update,
    Delete,
    Command,
    Noop,
}

impl OpType {
    pub fn from_str(op: &str) -> Option<OpType> {
        match op {
            INSERT_OP => Some(OpType::Insert),
            UPDATE_OP => Some(OpType::Update),
            DELETE_OP => Some(OpType::Delete),
            COMMAND_OP => Some(OpType::Command),
            NOOP_OP => Some(OpType::Noop),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Insert => INSERT_OP,
            OpType::Update => UPDATE_OP,
            OpType::Delete => DELETE_OP,
            OpType::Command => COMMAND_OP,
            OpType::Noop => NOOP_OP,
        }
    }
}

/// One parsed oplog entry. Only the fields the pipeline consumes are kept;
/// the raw frame travels alongside in [GenericOplog] for passthrough.
#[derive(Debug, Clone)]
pub struct Oplog {
    /// The time when the oplog entry was created, packed.
    pub ts: u64,
    /// The operation type.
    pub op: OpType,
    /// The namespace on which to apply the operation.
    pub ns: String,
    /// The operation applied.
    pub o: Document,
    /// Additional information about the operation applied.
    pub o2: Option<Document>,
    /// Origin tag, set by kernels that stamp replicated writes.
    pub gid: Option<String>,
}

impl Oplog {
    /// Parse a raw BSON frame into an [Oplog].
    ///
    /// Unknown `op` codes and missing mandatory fields are decode errors;
    /// the deserializer stage treats them as fatal (a corrupted oplog
    /// stream cannot be recovered from).
    pub fn parse(raw: &[u8]) -> Result<Oplog> {
        let doc = Document::from_reader(raw)?;
        Oplog::from_doc(doc)
    }

    pub fn from_doc(doc: Document) -> Result<Oplog> {
        let ts = ts_to_u64(doc.get_timestamp(TIMESTAMP_KEY)?);
        let op_str = doc.get_str(OP_KEY)?;
        let op = OpType::from_str(op_str).ok_or_else(|| ReplError::BsonError {
            source: bson::document::ValueAccessError::UnexpectedType,
            backtrace: std::backtrace::Backtrace::capture(),
        })?;
        let ns = doc.get_str(NAMESPACE_KEY)?.to_string();
        let o = doc.get_document(OBJECT_KEY).cloned().unwrap_or_default();
        let o2 = doc.get_document(OBJECT2_KEY).ok().cloned();
        let gid = doc.get_str(GID_KEY).ok().map(|s| s.to_string());
        Ok(Oplog {
            ts,
            op,
            ns,
            o,
            o2,
            gid,
        })
    }

    /// Database part of the namespace.
    pub fn db(&self) -> &str {
        self.ns.split_once('.').map(|(db, _)| db).unwrap_or(&self.ns)
    }

    /// Collection part of the namespace, if any.
    pub fn coll(&self) -> Option<&str> {
        self.ns.split_once('.').map(|(_, coll)| coll)
    }

    pub fn is_command(&self) -> bool {
        self.op == OpType::Command
    }

    pub fn is_noop(&self) -> bool {
        self.op == OpType::Noop
    }

    /// A noop carrying the `forceCheckpoint` marker acts as a stream
    /// barrier: the batch is cut here and the checkpoint flushed.
    pub fn is_checkpoint_noop(&self) -> bool {
        self.is_noop() && self.o.get_bool(FORCE_CHECKPOINT_KEY).unwrap_or(false)
    }

    /// The `_id` the entry effectively addresses: `o2._id` for updates and
    /// deletes, `o._id` for inserts. None for commands and noops.
    pub fn effective_id(&self) -> Option<&bson::Bson> {
        match self.op {
            OpType::Insert => self.o.get("_id"),
            OpType::Update | OpType::Delete => self
                .o2
                .as_ref()
                .and_then(|d| d.get("_id"))
                .or_else(|| self.o.get("_id")),
            OpType::Command | OpType::Noop => None,
        }
    }
}

/// Pair of raw frame and parsed view. The raw bytes are preserved for
/// transmission; the parsed view drives routing, filtering and barrier
/// detection.
#[derive(Debug, Clone)]
pub struct GenericOplog {
    pub raw: Vec<u8>,
    pub parsed: Oplog,
}

#[cfg(test)]
mod test {
    use super::*;
    use bson::doc;

    fn sample_doc(ts: Timestamp, op: &str, ns: &str) -> Document {
        doc! {"ts": ts, "op": op, "ns": ns, "o": {"_id": 7, "x": 1}}
    }

    #[test]
    fn test_ts_pack_roundtrip() {
        let ts = Timestamp {
            time: 100,
            increment: 42,
        };
        let packed = ts_to_u64(ts);
        assert_eq!(packed, (100u64 << 32) | 42);
        assert_eq!(u64_to_ts(packed), ts);
        assert_eq!(ts_seconds(packed), 100);
        assert_eq!(ts_to_log(packed), "100:42");
    }

    #[test]
    fn test_parse_insert() {
        let ts = Timestamp {
            time: 5,
            increment: 1,
        };
        let raw = bson::to_vec(&sample_doc(ts, "i", "db.a")).unwrap();
        let log = Oplog::parse(&raw).unwrap();
        assert_eq!(log.op, OpType::Insert);
        assert_eq!(log.ns, "db.a");
        assert_eq!(log.ts, ts_to_u64(ts));
        assert_eq!(log.db(), "db");
        assert_eq!(log.coll(), Some("a"));
        assert_eq!(log.effective_id(), Some(&bson::Bson::Int32(7)));
    }

    #[test]
    fn test_parse_unknown_op_is_error() {
        let ts = Timestamp {
            time: 5,
            increment: 1,
        };
        let raw = bson::to_vec(&sample_doc(ts, "z", "db.a")).unwrap();
        assert!(Oplog::parse(&raw).is_err());
    }

    #[test]
    fn test_effective_id_prefers_o2_for_update() {
        let doc = doc! {
            "ts": Timestamp { time: 9, increment: 0 },
            "op": "u",
            "ns": "db.a",
            "o": {"$set": {"x": 2}},
            "o2": {"_id": 3},
        };
        let log = Oplog::from_doc(doc).unwrap();
        assert_eq!(log.effective_id(), Some(&bson::Bson::Int32(3)));
    }

    #[test]
    fn test_checkpoint_noop_detection() {
        let doc = doc! {
            "ts": Timestamp { time: 1, increment: 0 },
            "op": "n",
            "ns": "",
            "o": {"forceCheckpoint": true},
        };
        let log = Oplog::from_doc(doc).unwrap();
        assert!(log.is_checkpoint_noop());

        let plain = doc! {
            "ts": Timestamp { time: 1, increment: 1 },
            "op": "n",
            "ns": "",
            "o": {"msg": "periodic noop"},
        };
        assert!(!Oplog::from_doc(plain).unwrap().is_checkpoint_noop());
    }
}
