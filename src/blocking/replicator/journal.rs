//! Audit journal: one JSON line per oplog observed by the batcher.

use serde_json::json;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;

use crate::error::Result;
use crate::oplog::{ts_to_log, Oplog};

pub struct Journal {
    writer: Mutex<BufWriter<File>>,
}

impl Journal {
    /// Journal file named after the collector and the replica set, under
    /// the log directory.
    pub fn new(log_dir: &Path, collector_id: &str, replset: &str) -> Result<Journal> {
        std::fs::create_dir_all(log_dir)?;
        let path = log_dir.join(format!("{}.{}.journal", collector_id, replset));
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Journal {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn write_record(&self, log: &Oplog) {
        let line = json!({
            "ts": ts_to_log(log.ts),
            "op": log.op.as_str(),
            "ns": log.ns,
        });
        let mut writer = self.writer.lock().unwrap();
        if let Err(e) = writeln!(writer, "{}", line) {
            warn!(?e, "journal write failed");
        }
    }
}
