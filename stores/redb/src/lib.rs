//! Persistent `DbAccess` implementation backed by redb.
//!
//! One redb database per session cache. The engine's long-lived
//! transaction maps onto a redb write transaction held open until the SC
//! cursor advances; everything written in between becomes durable in a
//! single commit, which is exactly the crash-consistency contract the
//! node cache needs.

use std::path::{Path, PathBuf};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use mega_core::caps::{DB_KIND_BITS, DbAccess, DbTable};

const TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("records");

/// Opens session databases under a base directory.
#[derive(Debug, Clone)]
pub struct RedbDbAccess {
    base_dir: PathBuf,
}

impl RedbDbAccess {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        RedbDbAccess {
            base_dir: base_dir.into(),
        }
    }
}

impl DbAccess for RedbDbAccess {
    fn open(&self, name: &str) -> anyhow::Result<Box<dyn DbTable>> {
        std::fs::create_dir_all(&self.base_dir)?;
        let path = self.base_dir.join(format!("{name}.redb"));
        RedbTable::open(&path).map(|t| Box::new(t) as Box<dyn DbTable>)
    }
}

struct RedbTable {
    db: Database,
    txn: Option<redb::WriteTransaction>,
    cursor: Option<u64>,
    next_seq: u64,
}

impl RedbTable {
    fn open(path: &Path) -> anyhow::Result<RedbTable> {
        let db = Database::create(path)?;

        // Ensure the records table exists before the first read; a fresh
        // database would otherwise error on `open_table`.
        let mut next_seq = 1;
        {
            let write_txn = db.begin_write()?;
            {
                let table = write_txn.open_table(TABLE)?;
                if let Some(entry) = table.last()? {
                    next_seq = (entry.0.value() >> DB_KIND_BITS) + 1;
                }
            }
            write_txn.commit()?;
        }

        Ok(RedbTable {
            db,
            txn: None,
            cursor: None,
            next_seq,
        })
    }

    fn with_write<F>(&mut self, f: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut redb::Table<'_, u64, &[u8]>) -> Result<(), redb::StorageError>,
    {
        match &self.txn {
            Some(txn) => {
                let mut table = txn.open_table(TABLE)?;
                f(&mut table)?;
            }
            None => {
                let txn = self.db.begin_write()?;
                {
                    let mut table = txn.open_table(TABLE)?;
                    f(&mut table)?;
                }
                txn.commit()?;
            }
        }
        Ok(())
    }
}

impl DbTable for RedbTable {
    fn rewind(&mut self) {
        self.cursor = None;
    }

    fn next_record(&mut self) -> anyhow::Result<Option<(u64, Vec<u8>)>> {
        // Reads go through the committed view; the engine only iterates
        // at session resume, before the long transaction opens.
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TABLE)?;
        let start = self.cursor.map_or(0, |c| c + 1);
        let mut range = table.range(start..)?;
        match range.next() {
            Some(entry) => {
                let (id, data) = entry?;
                let id = id.value();
                self.cursor = Some(id);
                Ok(Some((id, data.value().to_vec())))
            }
            None => Ok(None),
        }
    }

    fn put(&mut self, id: u64, data: &[u8]) -> anyhow::Result<()> {
        self.with_write(|table| table.insert(id, data).map(|_| ()))
    }

    fn del(&mut self, id: u64) -> anyhow::Result<()> {
        self.with_write(|table| table.remove(id).map(|_| ()))
    }

    fn truncate(&mut self) -> anyhow::Result<()> {
        self.with_write(|table| {
            table.retain(|_, _| false)?;
            Ok(())
        })
    }

    fn begin(&mut self) -> anyhow::Result<()> {
        if self.txn.is_none() {
            self.txn = Some(self.db.begin_write()?);
        }
        Ok(())
    }

    fn commit(&mut self) -> anyhow::Result<()> {
        if let Some(txn) = self.txn.take() {
            txn.commit()?;
        }
        Ok(())
    }

    fn abort(&mut self) {
        if let Some(txn) = self.txn.take() {
            let _ = txn.abort();
        }
    }

    fn in_transaction(&self) -> bool {
        self.txn.is_some()
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
    fn test_put_get_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let access = RedbDbAccess::new(dir.path());
        {
            let mut table = access.open("sess1").unwrap();
            let id = table.next_id(2);
            table.put(id, b"hello").unwrap();
        }
        let mut table = access.open("sess1").unwrap();
        table.rewind();
        let (id, data) = table.next_record().unwrap().unwrap();
        assert_eq!(mega_core::caps::db_record_kind(id), 2);
        assert_eq!(data, b"hello");
    }

    #[test]
    fn test_transaction_commit_visibility() {
        let dir = tempfile::tempdir().unwrap();
        let access = RedbDbAccess::new(dir.path());
        let mut table = access.open("sess1").unwrap();

        table.begin().unwrap();
        table.put(0x10, b"in-tx").unwrap();
        assert!(table.in_transaction());
        table.commit().unwrap();

        table.rewind();
        assert!(table.next_record().unwrap().is_some());
    }

    #[test]
    fn test_abort_discards_writes() {
        let dir = tempfile::tempdir().unwrap();
        let access = RedbDbAccess::new(dir.path());
        let mut table = access.open("sess1").unwrap();

        table.begin().unwrap();
        table.put(0x10, b"gone").unwrap();
        table.abort();

        table.rewind();
        assert!(table.next_record().unwrap().is_none());
    }
}
