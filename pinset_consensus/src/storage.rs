//! openraft log storage over a [`LogStore`].

use crate::types::{self, Entry, LogId, StorageError, TypeConfig, Vote, storage_error};
use openraft::storage::{LogFlushed, LogState, RaftLogReader, RaftLogStorage};
use openraft::{ErrorSubject, ErrorVerb, OptionalSend};
use pinset_core::LogStore;
use std::fmt::Debug;
use std::ops::{Bound, RangeBounds};
use std::sync::Arc;

/// Adapts a [`LogStore`] to openraft. Votes and the commit point are kept
/// together in the store's [`HardState`](pinset_core::HardState).
#[derive(Debug, Clone)]
pub struct LogStorage {
    store: Arc<dyn LogStore>,
}

impl LogStorage {
    pub fn new(store: Arc<dyn LogStore>) -> Self {
        Self { store }
    }

    async fn update_hard_state(
        &self,
        subject: ErrorSubject<pinset_core::PeerId>,
        update: impl FnOnce(&mut pinset_core::HardState),
    ) -> Result<(), StorageError> {
        let mut state = self
            .store
            .hard_state()
            .await
            .map_err(|e| storage_error(subject.clone(), ErrorVerb::Read, e))?
            .unwrap_or_default();
        update(&mut state);
        self.store
            .save_hard_state(state)
            .await
            .map_err(|e| storage_error(subject, ErrorVerb::Write, e))
    }
}

impl RaftLogReader<TypeConfig> for LogStorage {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry>, StorageError> {
        let from = match range.start_bound() {
            Bound::Included(i) => *i,
            Bound::Excluded(i) => i.saturating_add(1),
            Bound::Unbounded => 0,
        };
        let to = match range.end_bound() {
            Bound::Included(i) => i.saturating_add(1),
            Bound::Excluded(i) => *i,
            Bound::Unbounded => u64::MAX,
        };
        let entries = self
            .store
            .entries(from, to)
            .await
            .map_err(|e| storage_error(ErrorSubject::Logs, ErrorVerb::Read, e))?;
        Ok(entries.into_iter().map(types::raft_entry).collect())
    }
}

impl RaftLogStorage<TypeConfig> for LogStorage {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError> {
        let read_err = |e| storage_error(ErrorSubject::Logs, ErrorVerb::Read, e);
        let last_purged = self.store.last_purged().await.map_err(read_err)?;
        let last = self.store.last_entry_id().await.map_err(read_err)?;
        Ok(LogState {
            last_purged_log_id: last_purged.as_ref().map(types::log_id),
            last_log_id: last.as_ref().map(types::log_id),
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(&mut self, vote: &Vote) -> Result<(), StorageError> {
        self.update_hard_state(ErrorSubject::Vote, |state| types::set_vote(state, vote))
            .await
    }

    async fn read_vote(&mut self) -> Result<Option<Vote>, StorageError> {
        let state = self
            .store
            .hard_state()
            .await
            .map_err(|e| storage_error(ErrorSubject::Vote, ErrorVerb::Read, e))?;
        Ok(state.as_ref().map(types::vote))
    }

    async fn save_committed(&mut self, committed: Option<LogId>) -> Result<(), StorageError> {
        self.update_hard_state(ErrorSubject::Store, |state| {
            state.committed = committed.as_ref().map(types::entry_id);
        })
        .await
    }

    async fn read_committed(&mut self) -> Result<Option<LogId>, StorageError> {
        let state = self
            .store
            .hard_state()
            .await
            .map_err(|e| storage_error(ErrorSubject::Store, ErrorVerb::Read, e))?;
        Ok(state.and_then(|s| s.committed).as_ref().map(types::log_id))
    }

    async fn append<I>(&mut self, entries: I, callback: LogFlushed<TypeConfig>) -> Result<(), StorageError>
    where
        I: IntoIterator<Item = Entry> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let entries: Vec<_> = entries.into_iter().map(|e| types::log_entry(&e)).collect();
        // Every LogStore append is durable once it returns.
        self.store
            .append(entries)
            .await
            .map_err(|e| storage_error(ErrorSubject::Logs, ErrorVerb::Write, e))?;
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId) -> Result<(), StorageError> {
        tracing::debug!(from = log_id.index, "truncating conflicting log suffix");
        self.store
            .truncate_suffix(log_id.index)
            .await
            .map_err(|e| storage_error(ErrorSubject::Logs, ErrorVerb::Delete, e))
    }

    async fn purge(&mut self, log_id: LogId) -> Result<(), StorageError> {
        tracing::debug!(upto = log_id.index, "purging compacted log prefix");
        self.store
            .truncate_prefix(types::entry_id(&log_id))
            .await
            .map_err(|e| storage_error(ErrorSubject::Logs, ErrorVerb::Delete, e))
    }
}
