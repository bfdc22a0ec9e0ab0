//! Test utilities for `LogStore` implementations.
//!
//! # Usage
//!
//! In your log store crate's `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! pinset_core = { workspace = true, features = ["testutil"] }
//! ```
//!
//! In your test:
//!
//! ```ignore
//! use pinset_core::testutil::LogStoreTests;
//!
//! #[tokio::test]
//! async fn test_my_log_store() {
//!     let store = MyLogStore::new();
//!     LogStoreTests::new(&store).run_all().await.unwrap();
//! }
//! ```
//!
//! `run_all` expects a store that was never written to. The log tests
//! clear the log again when they pass; the compaction test leaves a purged
//! prefix behind and the snapshot and hard state tests leave their records,
//! so those run last and in order.

use crate::log::{EntryId, EntryPayload, HardState, LogEntry, LogStore, Membership, SnapshotMeta};
use crate::op::{LogOp, LogOpKind};
use crate::peer::PeerId;
use crate::pin::PinSerial;
use anyhow::Result;
use bytes::Bytes;

/// Conformance suite for `LogStore` implementations.
pub struct LogStoreTests<'a, S> {
    store: &'a S,
}

const LEADER: PeerId = PeerId([1; 32]);

fn id(term: u64, index: u64) -> EntryId {
    EntryId::new(term, LEADER, index)
}

fn op_entry(term: u64, index: u64) -> LogEntry {
    LogEntry::new(
        id(term, index),
        EntryPayload::Op(LogOp::new(
            PinSerial::new(format!("cid-{index}"), -1),
            LogOpKind::Pin,
        )),
    )
}

fn entries(term: u64, range: std::ops::RangeInclusive<u64>) -> Vec<LogEntry> {
    range.map(|i| op_entry(term, i)).collect()
}

impl<'a, S: LogStore> LogStoreTests<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Run all tests.
    pub async fn run_all(&self) -> Result<()> {
        self.test_empty().await?;
        self.test_append_and_read().await?;
        self.test_append_must_be_contiguous().await?;
        self.test_truncate_suffix().await?;
        self.test_truncate_prefix().await?;
        self.test_snapshot().await?;
        self.test_hard_state().await?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.store.truncate_suffix(0).await
    }

    pub async fn test_empty(&self) -> Result<()> {
        assert_eq!(self.store.last_entry_id().await?, None);
        assert_eq!(self.store.last_purged().await?, None);
        assert!(self.store.entry(0).await?.is_none());
        assert!(self.store.entries(0, 10).await?.is_empty());
        assert!(self.store.hard_state().await?.is_none());
        Ok(())
    }

    pub async fn test_append_and_read(&self) -> Result<()> {
        // The first entry of a fresh log may sit at index 0.
        let last = self
            .store
            .append(vec![LogEntry::new(
                EntryId::default(),
                EntryPayload::Membership(Membership::new([LEADER])),
            )])
            .await?;
        assert_eq!(last, 0);
        let last = self.store.append(entries(1, 1..=5)).await?;
        assert_eq!(last, 5);
        let last = self.store.append(entries(2, 6..=7)).await?;
        assert_eq!(last, 7);
        assert_eq!(self.store.append(vec![]).await?, 7, "empty append is a no-op");

        assert_eq!(self.store.last_entry_id().await?, Some(id(2, 7)));
        assert_eq!(self.store.entry(3).await?, Some(op_entry(1, 3)));
        assert!(self.store.entry(8).await?.is_none());

        let range = self.store.entries(2, 6).await?;
        assert_eq!(range.len(), 4, "entries range is half-open");
        assert_eq!(range[0].index(), 2);
        assert_eq!(range[3].index(), 5);

        let tail = self.store.entries(6, 100).await?;
        assert_eq!(tail.len(), 2, "range stops at the last entry");

        self.clear().await
    }

    pub async fn test_append_must_be_contiguous(&self) -> Result<()> {
        self.store.append(entries(1, 1..=3)).await?;
        assert!(
            self.store.append(vec![op_entry(1, 5)]).await.is_err(),
            "appending with a gap should fail"
        );
        assert!(
            self.store.append(vec![op_entry(1, 3)]).await.is_err(),
            "appending over an existing index should fail"
        );
        assert!(
            self.store
                .append(vec![op_entry(1, 4), op_entry(1, 6)])
                .await
                .is_err(),
            "a batch with a hole should fail as a whole"
        );
        assert_eq!(self.store.last_entry_id().await?, Some(id(1, 3)));
        self.clear().await
    }

    pub async fn test_truncate_suffix(&self) -> Result<()> {
        self.store.append(entries(1, 1..=6)).await?;
        self.store.truncate_suffix(4).await?;
        assert_eq!(self.store.last_entry_id().await?, Some(id(1, 3)));
        assert!(self.store.entry(4).await?.is_none());

        // Conflicting suffix replaced by a later term.
        self.store.append(entries(3, 4..=5)).await?;
        assert_eq!(self.store.last_entry_id().await?, Some(id(3, 5)));
        assert_eq!(self.store.entry(4).await?.map(|e| e.term()), Some(3));

        self.store.truncate_suffix(100).await?;
        assert_eq!(self.store.last_entry_id().await?, Some(id(3, 5)));
        self.clear().await?;
        assert_eq!(self.store.last_entry_id().await?, None);
        Ok(())
    }

    /// Leaves entries 5..=11 with 1-4 purged.
    pub async fn test_truncate_prefix(&self) -> Result<()> {
        self.store.append(entries(1, 1..=10)).await?;
        self.store.truncate_prefix(id(1, 4)).await?;
        assert_eq!(self.store.last_purged().await?, Some(id(1, 4)));
        assert!(self.store.entry(4).await?.is_none());
        assert_eq!(self.store.entry(5).await?, Some(op_entry(1, 5)));
        assert_eq!(self.store.last_entry_id().await?, Some(id(1, 10)));
        assert!(
            self.store.entries(1, 6).await?.is_empty(),
            "a range starting in the purged prefix is empty"
        );

        self.store.truncate_prefix(id(1, 2)).await?;
        assert_eq!(
            self.store.last_purged().await?,
            Some(id(1, 4)),
            "the purge point never moves back"
        );

        self.store.append(vec![op_entry(2, 11)]).await?;
        assert_eq!(self.store.last_entry_id().await?, Some(id(2, 11)));
        Ok(())
    }

    /// Compacts the whole log behind a snapshot.
    pub async fn test_snapshot(&self) -> Result<()> {
        assert!(self.store.read_snapshot().await?.is_none());

        let first = self.store.last_entry_id().await?.map_or(0, |id| id.index + 1);
        let snapshot_index = first + 7;
        self.store
            .append(entries(3, first..=snapshot_index))
            .await?;

        let membership = Membership::new([LEADER, PeerId([2; 32])]);
        let meta = SnapshotMeta {
            last_included: Some(id(3, snapshot_index)),
            membership_id: Some(id(1, 0)),
            membership,
            snapshot_id: format!("3-{snapshot_index}-1"),
        };
        self.store
            .write_snapshot(Bytes::from_static(b"state-a"), meta.clone())
            .await?;
        self.store.truncate_prefix(id(3, snapshot_index)).await?;

        let (data, read_meta) = self
            .store
            .read_snapshot()
            .await?
            .expect("snapshot should be present");
        assert_eq!(data, Bytes::from_static(b"state-a"));
        assert_eq!(read_meta, meta);

        assert_eq!(
            self.store.last_entry_id().await?,
            Some(id(3, snapshot_index)),
            "an emptied log falls back to the purge point"
        );
        assert!(self.store.entry(snapshot_index).await?.is_none());

        let last = self
            .store
            .append(vec![op_entry(4, snapshot_index + 1)])
            .await?;
        assert_eq!(last, snapshot_index + 1, "append continues after the purge point");

        // A newer snapshot replaces the old one.
        let newer = SnapshotMeta {
            last_included: Some(id(4, snapshot_index + 1)),
            snapshot_id: format!("4-{}-2", snapshot_index + 1),
            ..meta
        };
        self.store
            .write_snapshot(Bytes::from_static(b"state-b"), newer.clone())
            .await?;
        let (data, read_meta) = self.store.read_snapshot().await?.expect("snapshot");
        assert_eq!(data, Bytes::from_static(b"state-b"));
        assert_eq!(read_meta, newer);
        Ok(())
    }

    pub async fn test_hard_state(&self) -> Result<()> {
        let hs = HardState {
            term: 7,
            voted_for: PeerId([9; 32]),
            vote_committed: false,
            committed: None,
        };
        self.store.save_hard_state(hs.clone()).await?;
        assert_eq!(self.store.hard_state().await?, Some(hs));

        let hs = HardState {
            term: 8,
            voted_for: PeerId([9; 32]),
            vote_committed: true,
            committed: Some(id(8, 4)),
        };
        self.store.save_hard_state(hs.clone()).await?;
        assert_eq!(self.store.hard_state().await?, Some(hs));
        Ok(())
    }
}
