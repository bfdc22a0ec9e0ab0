//! In-memory `LogStore` for tests and ephemeral peers.

use anyhow::{Result, bail};
use bytes::Bytes;
use pinset_core::{EntryId, HardState, LogEntry, LogStore, SnapshotMeta};
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<u64, LogEntry>,
    last_purged: Option<EntryId>,
    snapshot: Option<(Bytes, SnapshotMeta)>,
    hard_state: Option<HardState>,
}

impl Inner {
    fn last_entry_id(&self) -> Option<EntryId> {
        self.entries
            .values()
            .next_back()
            .map(|e| e.id)
            .or(self.last_purged)
    }
}

#[derive(Debug, Default)]
pub struct MemoryLogStore {
    inner: RwLock<Inner>,
}

impl MemoryLogStore {
    /// Creates a new, empty `MemoryLogStore`.
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&Inner) -> T) -> T {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    fn write<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

#[async_trait::async_trait]
impl LogStore for MemoryLogStore {
    async fn append(&self, entries: Vec<LogEntry>) -> Result<u64> {
        self.write(|inner| {
            let last = inner.last_entry_id();
            let Some(first) = entries.first() else {
                return Ok(last.map_or(0, |id| id.index));
            };
            let mut next = last.map_or(first.index(), |id| id.index + 1);
            for entry in &entries {
                if entry.index() != next {
                    bail!(
                        "non-contiguous append: expected index {next}, got {}",
                        entry.index()
                    );
                }
                next += 1;
            }
            for entry in entries {
                inner.entries.insert(entry.index(), entry);
            }
            Ok(next - 1)
        })
    }

    async fn entry(&self, index: u64) -> Result<Option<LogEntry>> {
        Ok(self.read(|inner| inner.entries.get(&index).cloned()))
    }

    async fn entries(&self, from: u64, to: u64) -> Result<Vec<LogEntry>> {
        if from >= to {
            return Ok(Vec::new());
        }
        Ok(self.read(|inner| {
            let mut out = Vec::new();
            let mut expected = from;
            for (index, entry) in inner.entries.range(from..to) {
                if *index != expected {
                    break;
                }
                out.push(entry.clone());
                expected += 1;
            }
            out
        }))
    }

    async fn last_entry_id(&self) -> Result<Option<EntryId>> {
        Ok(self.read(Inner::last_entry_id))
    }

    async fn last_purged(&self) -> Result<Option<EntryId>> {
        Ok(self.read(|inner| inner.last_purged))
    }

    async fn truncate_suffix(&self, from: u64) -> Result<()> {
        self.write(|inner| {
            inner.entries.split_off(&from);
        });
        Ok(())
    }

    async fn truncate_prefix(&self, upto: EntryId) -> Result<()> {
        self.write(|inner| {
            let rest = inner.entries.split_off(&(upto.index + 1));
            inner.entries = rest;
            if inner.last_purged.is_none_or(|purged| purged.index < upto.index) {
                inner.last_purged = Some(upto);
            }
        });
        Ok(())
    }

    async fn write_snapshot(&self, data: Bytes, meta: SnapshotMeta) -> Result<()> {
        self.write(|inner| inner.snapshot = Some((data, meta)));
        Ok(())
    }

    async fn read_snapshot(&self) -> Result<Option<(Bytes, SnapshotMeta)>> {
        Ok(self.read(|inner| inner.snapshot.clone()))
    }

    async fn save_hard_state(&self, state: HardState) -> Result<()> {
        self.write(|inner| inner.hard_state = Some(state));
        Ok(())
    }

    async fn hard_state(&self) -> Result<Option<HardState>> {
        Ok(self.read(|inner| inner.hard_state.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pinset_core::{EntryPayload, PeerId};
    use pinset_core::testutil::LogStoreTests;

    #[tokio::test]
    async fn test_memory_log_store() {
        let store = MemoryLogStore::new();
        LogStoreTests::new(&store).run_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_entries_stop_at_gap_after_compaction() {
        let store = MemoryLogStore::new();
        let entries = (1..=4)
            .map(|i| LogEntry::new(EntryId::new(1, PeerId([1; 32]), i), EntryPayload::Blank))
            .collect();
        store.append(entries).await.unwrap();
        store
            .truncate_prefix(EntryId::new(1, PeerId([1; 32]), 2))
            .await
            .unwrap();

        assert!(store.entries(1, 5).await.unwrap().is_empty());
        assert_eq!(store.entries(3, 5).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_purging_past_the_log_moves_the_append_point() {
        let store = MemoryLogStore::new();
        let leader = PeerId([1; 32]);
        store
            .append(vec![LogEntry::new(EntryId::new(1, leader, 0), EntryPayload::Blank)])
            .await
            .unwrap();
        // A snapshot received from the leader covers more than the local log.
        store.truncate_prefix(EntryId::new(3, leader, 40)).await.unwrap();
        assert_eq!(
            store.last_entry_id().await.unwrap(),
            Some(EntryId::new(3, leader, 40))
        );
        assert!(
            store
                .append(vec![LogEntry::new(EntryId::new(3, leader, 1), EntryPayload::Blank)])
                .await
                .is_err()
        );
        let last = store
            .append(vec![LogEntry::new(EntryId::new(3, leader, 41), EntryPayload::Blank)])
            .await
            .unwrap();
        assert_eq!(last, 41);
    }
}
