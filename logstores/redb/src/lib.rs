//! RedbLogStore - a durable `LogStore` backed by redb.
//!
//! Entries live in the `log` table keyed by index. Hard state, the purge
//! point and the latest snapshot live in the `meta` table. Every value is
//! CBOR except the snapshot data, which is stored as given.

use anyhow::{Result, anyhow, bail};
use bytes::Bytes;
use pinset_core::{EntryId, HardState, LogEntry, LogStore, SnapshotMeta};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::{path::Path, sync::Arc};

const LOG_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("log");
const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

const HARD_STATE_KEY: &str = "hard_state";
const LAST_PURGED_KEY: &str = "last_purged";
const SNAPSHOT_META_KEY: &str = "snapshot_meta";
const SNAPSHOT_DATA_KEY: &str = "snapshot_data";

#[derive(Clone)]
pub struct RedbLogStore {
    db: Arc<Database>,
}

impl std::fmt::Debug for RedbLogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbLogStore").finish()
    }
}

impl RedbLogStore {
    /// Opens (or creates) `log.redb` inside the directory `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;
        let db = Database::create(path.join("log.redb"))?;

        // Create both tables so that first reads on a fresh database succeed.
        {
            let write_txn = db.begin_write()?;
            {
                let _ = write_txn.open_table(LOG_TABLE)?;
                let _ = write_txn.open_table(META_TABLE)?;
            }
            write_txn.commit()?;
        }
        tracing::debug!(path = %path.display(), "opened redb log store");

        Ok(Self { db: Arc::new(db) })
    }

    async fn blocking<T, F>(&self, what: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| anyhow!("redb {what} task failed: {}", e))?
    }
}

fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>> {
    minicbor::to_vec(value).map_err(|e| anyhow!("cbor encode failed: {e}"))
}

fn decode<T: for<'b> minicbor::Decode<'b, ()>>(bytes: &[u8], what: &str) -> Result<T> {
    minicbor::decode(bytes).map_err(|e| anyhow!("corrupt {what}: {e}"))
}

fn snapshot_meta(
    meta: &impl ReadableTable<&'static str, &'static [u8]>,
) -> Result<Option<SnapshotMeta>> {
    meta.get(SNAPSHOT_META_KEY)?
        .map(|guard| decode(guard.value(), "snapshot metadata"))
        .transpose()
}

fn last_purged(meta: &impl ReadableTable<&'static str, &'static [u8]>) -> Result<Option<EntryId>> {
    meta.get(LAST_PURGED_KEY)?
        .map(|guard| decode(guard.value(), "purge point"))
        .transpose()
}

fn last_entry_id(
    log: &impl ReadableTable<u64, &'static [u8]>,
    meta: &impl ReadableTable<&'static str, &'static [u8]>,
) -> Result<Option<EntryId>> {
    if let Some((_, value)) = log.last()? {
        let entry: LogEntry = decode(value.value(), "log entry")?;
        return Ok(Some(entry.id));
    }
    last_purged(meta)
}

fn keys_in(
    log: &impl ReadableTable<u64, &'static [u8]>,
    range: impl std::ops::RangeBounds<u64> + 'static,
) -> Result<Vec<u64>> {
    let mut keys = Vec::new();
    for item in log.range(range)? {
        let (key, _) = item?;
        keys.push(key.value());
    }
    Ok(keys)
}

#[async_trait::async_trait]
impl LogStore for RedbLogStore {
    async fn append(&self, entries: Vec<LogEntry>) -> Result<u64> {
        self.blocking("append", move |db| {
            let write_txn = db.begin_write()?;
            let last;
            {
                let mut log = write_txn.open_table(LOG_TABLE)?;
                let meta = write_txn.open_table(META_TABLE)?;
                let current = last_entry_id(&log, &meta)?;
                let Some(first) = entries.first() else {
                    return Ok(current.map_or(0, |id| id.index));
                };
                let mut next = current.map_or(first.index(), |id| id.index + 1);
                for entry in &entries {
                    if entry.index() != next {
                        bail!(
                            "non-contiguous append: expected index {next}, got {}",
                            entry.index()
                        );
                    }
                    log.insert(entry.index(), encode(entry)?.as_slice())?;
                    next += 1;
                }
                last = next - 1;
            }
            write_txn.commit()?;
            Ok(last)
        })
        .await
    }

    async fn entry(&self, index: u64) -> Result<Option<LogEntry>> {
        self.blocking("read", move |db| {
            let read_txn = db.begin_read()?;
            let log = read_txn.open_table(LOG_TABLE)?;
            log.get(index)?
                .map(|guard| decode(guard.value(), "log entry"))
                .transpose()
        })
        .await
    }

    async fn entries(&self, from: u64, to: u64) -> Result<Vec<LogEntry>> {
        if from >= to {
            return Ok(Vec::new());
        }
        self.blocking("read", move |db| {
            let read_txn = db.begin_read()?;
            let log = read_txn.open_table(LOG_TABLE)?;
            let mut out = Vec::new();
            let mut expected = from;
            for item in log.range(from..to)? {
                let (key, value) = item?;
                if key.value() != expected {
                    break;
                }
                out.push(decode(value.value(), "log entry")?);
                expected += 1;
            }
            Ok(out)
        })
        .await
    }

    async fn last_entry_id(&self) -> Result<Option<EntryId>> {
        self.blocking("read", |db| {
            let read_txn = db.begin_read()?;
            let log = read_txn.open_table(LOG_TABLE)?;
            let meta = read_txn.open_table(META_TABLE)?;
            last_entry_id(&log, &meta)
        })
        .await
    }

    async fn last_purged(&self) -> Result<Option<EntryId>> {
        self.blocking("read", |db| {
            let read_txn = db.begin_read()?;
            let meta = read_txn.open_table(META_TABLE)?;
            last_purged(&meta)
        })
        .await
    }

    async fn truncate_suffix(&self, from: u64) -> Result<()> {
        self.blocking("truncate", move |db| {
            let write_txn = db.begin_write()?;
            {
                let mut log = write_txn.open_table(LOG_TABLE)?;
                for key in keys_in(&log, from..)? {
                    log.remove(key)?;
                }
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn truncate_prefix(&self, upto: EntryId) -> Result<()> {
        self.blocking("truncate", move |db| {
            let write_txn = db.begin_write()?;
            let removed;
            {
                let mut log = write_txn.open_table(LOG_TABLE)?;
                let mut meta = write_txn.open_table(META_TABLE)?;
                let keys = keys_in(&log, ..=upto.index)?;
                removed = keys.len();
                for key in keys {
                    log.remove(key)?;
                }
                if last_purged(&meta)?.is_none_or(|purged| purged.index < upto.index) {
                    meta.insert(LAST_PURGED_KEY, encode(&upto)?.as_slice())?;
                }
            }
            write_txn.commit()?;
            tracing::trace!(upto = upto.index, removed, "compacted log prefix");
            Ok(())
        })
        .await
    }

    async fn write_snapshot(&self, data: Bytes, meta: SnapshotMeta) -> Result<()> {
        self.blocking("snapshot write", move |db| {
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(META_TABLE)?;
                table.insert(SNAPSHOT_DATA_KEY, data.as_ref())?;
                table.insert(SNAPSHOT_META_KEY, encode(&meta)?.as_slice())?;
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn read_snapshot(&self) -> Result<Option<(Bytes, SnapshotMeta)>> {
        self.blocking("snapshot read", |db| {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(META_TABLE)?;
            let Some(meta) = snapshot_meta(&table)? else {
                return Ok(None);
            };
            let data = table
                .get(SNAPSHOT_DATA_KEY)?
                .map(|guard| Bytes::copy_from_slice(guard.value()))
                .ok_or_else(|| anyhow!("snapshot metadata without snapshot data"))?;
            Ok(Some((data, meta)))
        })
        .await
    }

    async fn save_hard_state(&self, state: HardState) -> Result<()> {
        self.blocking("hard state write", move |db| {
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(META_TABLE)?;
                table.insert(HARD_STATE_KEY, encode(&state)?.as_slice())?;
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn hard_state(&self) -> Result<Option<HardState>> {
        self.blocking("hard state read", |db| {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(META_TABLE)?;
            table
                .get(HARD_STATE_KEY)?
                .map(|guard| decode(guard.value(), "hard state"))
                .transpose()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pinset_core::testutil::LogStoreTests;

    #[tokio::test]
    async fn test_redb_log_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbLogStore::open(dir.path()).unwrap();
        LogStoreTests::new(&store).run_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_reopen_keeps_log_snapshot_and_hard_state() {
        use pinset_core::{EntryPayload, Membership, PeerId};

        let leader = PeerId([3; 32]);
        let id = |term, index| EntryId::new(term, leader, index);
        let dir = tempfile::tempdir().unwrap();
        let meta = SnapshotMeta {
            last_included: Some(id(1, 2)),
            membership_id: Some(id(1, 0)),
            membership: Membership::new([leader]),
            snapshot_id: "1-2-1".into(),
        };
        let hard_state = HardState {
            term: 2,
            voted_for: leader,
            vote_committed: true,
            committed: Some(id(2, 4)),
        };
        {
            let store = RedbLogStore::open(dir.path()).unwrap();
            let entries = (0..=4)
                .map(|i| LogEntry::new(id(if i < 3 { 1 } else { 2 }, i), EntryPayload::Blank))
                .collect();
            store.append(entries).await.unwrap();
            store
                .write_snapshot(Bytes::from_static(b"snap"), meta.clone())
                .await
                .unwrap();
            store.truncate_prefix(id(1, 2)).await.unwrap();
            store.save_hard_state(hard_state.clone()).await.unwrap();
        }

        let store = RedbLogStore::open(dir.path()).unwrap();
        assert_eq!(store.last_purged().await.unwrap(), Some(id(1, 2)));
        assert!(store.entry(2).await.unwrap().is_none());
        assert_eq!(store.last_entry_id().await.unwrap(), Some(id(2, 4)));
        assert_eq!(store.hard_state().await.unwrap(), Some(hard_state));
        let (data, read_meta) = store.read_snapshot().await.unwrap().unwrap();
        assert_eq!(data, Bytes::from_static(b"snap"));
        assert_eq!(read_meta, meta);
        assert_eq!(
            store
                .append(vec![LogEntry::new(id(2, 5), EntryPayload::Blank)])
                .await
                .unwrap(),
            5
        );

        // The purge point survives even when compaction emptied the log.
        store.truncate_prefix(id(2, 5)).await.unwrap();
        drop(store);
        let store = RedbLogStore::open(dir.path()).unwrap();
        assert_eq!(store.last_entry_id().await.unwrap(), Some(id(2, 5)));
    }
}
