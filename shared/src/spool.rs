//! Durable spool for undelivered messages.
//!
//! A local embedded key-value store mapping `<service>|<id>` to the
//! serialized message. Every write commits through redb's ACID path, so a
//! `put` is durable when it returns. A corrupt store fails at open; there is
//! no silent repair pass that could drop entries.

use std::path::{Path, PathBuf};

use redb::{Database, ReadableTable, TableDefinition};

use courier_error::BrokerResult;

const SPOOL_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("spool");

/// Separator between the service name and the per-message id in spool keys.
pub const KEY_SEPARATOR: char = '|';

/// Name of the store file inside the spool directory.
const STORE_FILE: &str = "spool.redb";

pub struct Spool {
    db: Database,
    path: PathBuf,
}

impl Spool {
    /// Create or open the spool under `dir`.
    ///
    /// The directory is created mode 0700 and the store file is restricted
    /// to 0600; spooled payloads are private to the broker user.
    pub fn open(dir: impl AsRef<Path>) -> BrokerResult<Self> {
        let dir = dir.as_ref();
        create_private_dir(dir)?;

        let path = dir.join(STORE_FILE);
        let db = Database::create(&path)?;
        restrict_file(&path)?;

        // Make sure the table exists so empty scans work.
        let write_txn = db.begin_write()?;
        {
            write_txn.open_table(SPOOL_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self { db, path })
    }

    /// Path of the backing store file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist `value` under `key`. Durable when this returns.
    pub fn put(&self, key: &str, value: &[u8]) -> BrokerResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SPOOL_TABLE)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Fetch the value stored under `key`.
    pub fn get(&self, key: &str) -> BrokerResult<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SPOOL_TABLE)?;
        Ok(table.get(key)?.map(|guard| guard.value().to_vec()))
    }

    /// Remove `key`. Idempotent; returns whether an entry was present.
    pub fn delete(&self, key: &str) -> BrokerResult<bool> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(SPOOL_TABLE)?;
            let removed = table.remove(key)?.is_some();
            removed
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Collect every `(key, value)` whose key starts with `prefix`, in
    /// lexicographic key order. The snapshot is taken under one read
    /// transaction, so the order is stable for the scan.
    pub fn scan_prefix(&self, prefix: &str) -> BrokerResult<Vec<(String, Vec<u8>)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SPOOL_TABLE)?;

        let mut entries = Vec::new();
        for item in table.range(prefix..)? {
            let (key_guard, value_guard) = item?;
            let key = key_guard.value();
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key.to_string(), value_guard.value().to_vec()));
        }
        Ok(entries)
    }

    /// Number of entries under `prefix`.
    pub fn count_prefix(&self, prefix: &str) -> BrokerResult<usize> {
        Ok(self.scan_prefix(prefix)?.len())
    }

    /// Force a durable no-op commit, flushing any pending store state.
    pub fn sync(&self) -> BrokerResult<()> {
        let write_txn = self.db.begin_write()?;
        write_txn.commit()?;
        Ok(())
    }

    /// Spool key for one message addressed to `service`.
    pub fn key_for(service: &str, id: &str) -> String {
        format!("{service}{KEY_SEPARATOR}{id}")
    }

    /// Scan prefix covering every message addressed to `service`.
    pub fn prefix(service: &str) -> String {
        format!("{service}{KEY_SEPARATOR}")
    }

    /// The service-name portion of a spool key.
    pub fn service_of(key: &str) -> Option<&str> {
        key.split(KEY_SEPARATOR).next().filter(|s| !s.is_empty())
    }
}

fn create_private_dir(dir: &Path) -> BrokerResult<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true).mode(0o700);
        builder.create(dir)?;
    }
    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

fn restrict_file(path: &Path) -> BrokerResult<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}
