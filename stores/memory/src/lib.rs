//! In-memory `DbAccess` implementation.
//!
//! Backs a whole cache database with a `BTreeMap` guarded by a mutex.
//! Transactions buffer mutations and apply them atomically on commit, so
//! the crash-consistency contract (tree and scsn commit together) can be
//! exercised by tests: an aborted transaction leaves the committed view
//! untouched.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use mega_core::caps::{DB_KIND_BITS, DbAccess, DbTable};

#[derive(Default)]
struct Shared {
    databases: BTreeMap<String, Arc<Mutex<BTreeMap<u64, Vec<u8>>>>>,
}

/// Provider handing out tables over shared in-memory state, so a "restart"
/// in a test (dropping the client, opening a new one over the same
/// provider) sees the committed records.
#[derive(Clone, Default)]
pub struct MemoryDbAccess {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryDbAccess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed records in a database, for test assertions.
    pub fn record_count(&self, name: &str) -> usize {
        let shared = self.shared.lock().unwrap();
        shared
            .databases
            .get(name)
            .map(|db| db.lock().unwrap().len())
            .unwrap_or(0)
    }

    /// Names of databases that have been opened, for test assertions.
    pub fn database_names(&self) -> Vec<String> {
        self.shared.lock().unwrap().databases.keys().cloned().collect()
    }

    /// Committed records of one kind, for test assertions.
    pub fn records_of_kind(&self, name: &str, kind: u8) -> Vec<(u64, Vec<u8>)> {
        let shared = self.shared.lock().unwrap();
        let Some(db) = shared.databases.get(name) else {
            return Vec::new();
        };
        db.lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| mega_core::caps::db_record_kind(**id) == kind)
            .map(|(id, v)| (*id, v.clone()))
            .collect()
    }
}

impl DbAccess for MemoryDbAccess {
    fn open(&self, name: &str) -> anyhow::Result<Box<dyn DbTable>> {
        let mut shared = self.shared.lock().unwrap();
        let db = shared
            .databases
            .entry(name.to_string())
            .or_default()
            .clone();
        let next_seq = db.lock().unwrap().keys().max().map_or(1, |id| (id >> DB_KIND_BITS) + 1);
        Ok(Box::new(MemoryTable {
            committed: db,
            pending: Vec::new(),
            in_tx: false,
            cursor: None,
            next_seq,
        }))
    }
}

enum Op {
    Put(u64, Vec<u8>),
    Del(u64),
    Truncate,
}

struct MemoryTable {
    committed: Arc<Mutex<BTreeMap<u64, Vec<u8>>>>,
    pending: Vec<Op>,
    in_tx: bool,
    cursor: Option<u64>,
    next_seq: u64,
}

impl MemoryTable {
    fn apply(map: &mut BTreeMap<u64, Vec<u8>>, op: Op) {
        match op {
            Op::Put(id, data) => {
                map.insert(id, data);
            }
            Op::Del(id) => {
                map.remove(&id);
            }
            Op::Truncate => map.clear(),
        }
    }
}

impl DbTable for MemoryTable {
    fn rewind(&mut self) {
        self.cursor = None;
    }

    fn next_record(&mut self) -> anyhow::Result<Option<(u64, Vec<u8>)>> {
        let map = self.committed.lock().unwrap();
        let next = match self.cursor {
            None => map.iter().next(),
            Some(last) => map.range(last + 1..).next(),
        };
        Ok(next.map(|(id, data)| {
            self.cursor = Some(*id);
            (*id, data.clone())
        }))
    }

    fn put(&mut self, id: u64, data: &[u8]) -> anyhow::Result<()> {
        let op = Op::Put(id, data.to_vec());
        if self.in_tx {
            self.pending.push(op);
        } else {
            Self::apply(&mut self.committed.lock().unwrap(), op);
        }
        Ok(())
    }

    fn del(&mut self, id: u64) -> anyhow::Result<()> {
        let op = Op::Del(id);
        if self.in_tx {
            self.pending.push(op);
        } else {
            Self::apply(&mut self.committed.lock().unwrap(), op);
        }
        Ok(())
    }

    fn truncate(&mut self) -> anyhow::Result<()> {
        if self.in_tx {
            self.pending.push(Op::Truncate);
        } else {
            self.committed.lock().unwrap().clear();
        }
        Ok(())
    }

    fn begin(&mut self) -> anyhow::Result<()> {
        self.in_tx = true;
        Ok(())
    }

    fn commit(&mut self) -> anyhow::Result<()> {
        let mut map = self.committed.lock().unwrap();
        for op in self.pending.drain(..) {
            Self::apply(&mut map, op);
        }
        self.in_tx = false;
        Ok(())
    }

    fn abort(&mut self) {
        self.pending.clear();
        self.in_tx = false;
    }

    fn in_transaction(&self) -> bool {
        self.in_tx
    }

    fn next_id(&mut self, kind: u8) -> u64 {
        let id = (self.next_seq << DB_KIND_BITS) | u64::from(kind) & mega_core::caps::DB_KIND_MASK;
        self.next_seq += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_outside_transaction_is_immediate() {
        let access = MemoryDbAccess::new();
        let mut table = access.open("db1").unwrap();
        table.put(0x12, b"hello").unwrap();
        assert_eq!(access.record_count("db1"), 1);
    }

    #[test]
    fn test_transaction_buffers_until_commit() {
        let access = MemoryDbAccess::new();
        let mut table = access.open("db1").unwrap();
        table.begin().unwrap();
        table.put(0x12, b"hello").unwrap();
        assert_eq!(access.record_count("db1"), 0);
        table.commit().unwrap();
        assert_eq!(access.record_count("db1"), 1);
    }

    #[test]
    fn test_abort_discards() {
        let access = MemoryDbAccess::new();
        let mut table = access.open("db1").unwrap();
        table.begin().unwrap();
        table.put(0x12, b"hello").unwrap();
        table.abort();
        table.begin().unwrap();
        table.commit().unwrap();
        assert_eq!(access.record_count("db1"), 0);
    }

    #[test]
    fn test_iteration_and_ids() {
        let access = MemoryDbAccess::new();
        let mut table = access.open("db1").unwrap();
        let a = table.next_id(2);
        let b = table.next_id(2);
        assert_ne!(a, b);
        assert_eq!(mega_core::caps::db_record_kind(a), 2);
        table.put(a, b"a").unwrap();
        table.put(b, b"b").unwrap();

        table.rewind();
        let mut seen = Vec::new();
        while let Some((_, data)) = table.next_record().unwrap() {
            seen.push(data);
        }
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn test_reopen_sees_committed_state() {
        let access = MemoryDbAccess::new();
        {
            let mut table = access.open("session").unwrap();
            let id = table.next_id(1);
            table.put(id, b"persisted").unwrap();
        }
        let mut table = access.open("session").unwrap();
        table.rewind();
        let (_, data) = table.next_record().unwrap().unwrap();
        assert_eq!(data, b"persisted");
        // id allocation continues past existing records
        assert!(table.next_id(1) >> DB_KIND_BITS > 1);
    }
}
