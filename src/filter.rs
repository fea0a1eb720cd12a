//! Oplog filter predicates and their chain.
//!
//! A filter returns `true` when the entry should be dropped. The chain
//! short-circuits on the first drop. The order of the filters is not
//! semantically significant, but namespace matching is the heaviest
//! predicate and is appended last.

use crate::oplog::Oplog;

pub trait OplogFilter: Send + Sync {
    /// Returns `true` when `log` should be dropped.
    fn filter(&self, log: &Oplog) -> bool;
}

/// Ordered predicate composite.
pub struct FilterChain {
    filters: Vec<Box<dyn OplogFilter>>,
}

impl FilterChain {
    pub fn new() -> FilterChain {
        FilterChain { filters: vec![] }
    }

    pub fn push(&mut self, filter: Box<dyn OplogFilter>) {
        self.filters.push(filter);
    }

    /// Returns `true` when any predicate drops `log`.
    pub fn filter(&self, log: &Oplog) -> bool {
        self.filters.iter().any(|f| f.filter(log))
    }
}

impl Default for FilterChain {
    fn default() -> Self {
        FilterChain::new()
    }
}

/// Drops entries originating from this replicator or from MongoDB's own
/// bookkeeping databases: nothing under `admin`, `local` or `config` is
/// user data, and replaying our own checkpoint writes would loop forever.
pub struct AutologousFilter {
    storage_db: String,
}

impl AutologousFilter {
    pub fn new(storage_db: impl Into<String>) -> AutologousFilter {
        AutologousFilter {
            storage_db: storage_db.into(),
        }
    }
}

impl OplogFilter for AutologousFilter {
    fn filter(&self, log: &Oplog) -> bool {
        log.ns.starts_with("admin.")
            || log.ns.starts_with("local.")
            || log.ns.starts_with("config.")
            || log.db() == self.storage_db
    }
}

/// Drops entries whose gid is not in the allow-list. An empty allow-list
/// keeps everything (gid stamping is an optional kernel feature).
pub struct GidFilter {
    gids: Vec<String>,
}

impl GidFilter {
    pub fn new(gids: Vec<String>) -> GidFilter {
        GidFilter { gids }
    }
}

impl OplogFilter for GidFilter {
    fn filter(&self, log: &Oplog) -> bool {
        if self.gids.is_empty() {
            return false;
        }
        match &log.gid {
            Some(gid) => !self.gids.iter().any(|g| g == gid),
            None => true,
        }
    }
}

/// Drops schema-changing commands when the replayer runs in DML-only mode.
pub struct DdlFilter;

impl OplogFilter for DdlFilter {
    fn filter(&self, log: &Oplog) -> bool {
        log.is_command()
    }
}

/// Namespace allow/deny filter.
///
/// An entry in either list matches a namespace exactly, or matches a whole
/// database when given as `db` (so `"db"` covers `db.*`).
pub struct NamespaceFilter {
    white: Vec<String>,
    black: Vec<String>,
}

impl NamespaceFilter {
    pub fn new(white: Vec<String>, black: Vec<String>) -> NamespaceFilter {
        NamespaceFilter { white, black }
    }

    fn matches(list: &[String], log: &Oplog) -> bool {
        list.iter()
            .any(|entry| entry == &log.ns || entry == log.db())
    }
}

impl OplogFilter for NamespaceFilter {
    fn filter(&self, log: &Oplog) -> bool {
        if Self::matches(&self.black, log) {
            return true;
        }
        !self.white.is_empty() && !Self::matches(&self.white, log)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::oplog::OpType;
    use bson::doc;

    fn log(ns: &str, op: OpType) -> Oplog {
        Oplog {
            ts: 1 << 32,
            op,
            ns: ns.to_string(),
            o: doc! {},
            o2: None,
            gid: None,
        }
    }

    #[test]
    fn test_autologous_filter() {
        let f = AutologousFilter::new("mongo_repl");
        assert!(f.filter(&log("admin.system.users", OpType::Insert)));
        assert!(f.filter(&log("config.chunks", OpType::Insert)));
        assert!(f.filter(&log("mongo_repl.checkpoint", OpType::Insert)));
        assert!(!f.filter(&log("db.a", OpType::Insert)));
    }

    #[test]
    fn test_gid_filter() {
        let empty = GidFilter::new(vec![]);
        assert!(!empty.filter(&log("db.a", OpType::Insert)));

        let f = GidFilter::new(vec!["g1".to_string()]);
        let mut tagged = log("db.a", OpType::Insert);
        tagged.gid = Some("g1".to_string());
        assert!(!f.filter(&tagged));
        tagged.gid = Some("g2".to_string());
        assert!(f.filter(&tagged));
        assert!(f.filter(&log("db.a", OpType::Insert)));
    }

    #[test]
    fn test_ddl_filter() {
        assert!(DdlFilter.filter(&log("db.$cmd", OpType::Command)));
        assert!(!DdlFilter.filter(&log("db.a", OpType::Update)));
    }

    #[test]
    fn test_namespace_filter_black() {
        let f = NamespaceFilter::new(vec![], vec!["db.secret".to_string(), "junk".to_string()]);
        assert!(f.filter(&log("db.secret", OpType::Insert)));
        assert!(f.filter(&log("junk.any", OpType::Insert)));
        assert!(!f.filter(&log("db.a", OpType::Insert)));
    }

    #[test]
    fn test_namespace_filter_white() {
        let f = NamespaceFilter::new(vec!["db.a".to_string()], vec![]);
        assert!(!f.filter(&log("db.a", OpType::Insert)));
        assert!(f.filter(&log("db.b", OpType::Insert)));
    }

    #[test]
    fn test_chain_short_circuit() {
        let mut chain = FilterChain::new();
        chain.push(Box::new(DdlFilter));
        chain.push(Box::new(NamespaceFilter::new(
            vec![],
            vec!["db.b".to_string()],
        )));
        assert!(chain.filter(&log("db.$cmd", OpType::Command)));
        assert!(chain.filter(&log("db.b", OpType::Insert)));
        assert!(!chain.filter(&log("db.a", OpType::Insert)));
    }
}
