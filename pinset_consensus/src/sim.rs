//! An in-process network for running whole clusters in one runtime.
//!
//! Replicas registered with a [`SimNetwork`] reach each other through
//! [`SimTransport`], which can partition peers, lose messages and damage
//! snapshots in flight on demand.

use crate::{
    api::Raft,
    message::{RaftRequest, RaftResponse},
    transport::{Transport, TransportError},
};
use dashmap::{DashMap, DashSet};
use pinset_core::PeerId;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

#[derive(Debug, Default)]
struct SimInner {
    peers: DashMap<PeerId, Raft>,
    /// Directed links that drop everything.
    blocked: DashSet<(PeerId, PeerId)>,
    isolated: DashSet<PeerId>,
    drop_next: AtomicU32,
    corrupt_snapshots: AtomicBool,
}

#[derive(Debug, Clone, Default)]
pub struct SimNetwork {
    inner: Arc<SimInner>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// The transport `from` uses to reach the other peers.
    pub fn transport(&self, from: PeerId) -> Arc<SimTransport> {
        Arc::new(SimTransport {
            from,
            net: self.clone(),
        })
    }

    pub fn register(&self, raft: Raft) {
        self.inner.peers.insert(raft.id(), raft);
    }

    /// Makes `peer` unreachable, as if its process died.
    pub fn unregister(&self, peer: &PeerId) -> Option<Raft> {
        self.inner.peers.remove(peer).map(|(_, raft)| raft)
    }

    pub fn get(&self, peer: &PeerId) -> Option<Raft> {
        self.inner.peers.get(peer).map(|r| r.clone())
    }

    /// Cuts `peer` off from everybody, in both directions.
    pub fn isolate(&self, peer: PeerId) {
        self.inner.isolated.insert(peer);
    }

    /// Blocks traffic between the two groups, in both directions.
    pub fn partition(&self, left: &[PeerId], right: &[PeerId]) {
        for a in left {
            for b in right {
                self.inner.blocked.insert((*a, *b));
                self.inner.blocked.insert((*b, *a));
            }
        }
    }

    /// Removes every partition and isolation.
    pub fn heal(&self) {
        self.inner.blocked.clear();
        self.inner.isolated.clear();
    }

    /// Loses the next `count` requests, whoever sends them.
    pub fn drop_next(&self, count: u32) {
        self.inner.drop_next.store(count, Ordering::SeqCst);
    }

    /// While set, every snapshot sent arrives with a flipped byte.
    pub fn corrupt_snapshots(&self, corrupt: bool) {
        self.inner.corrupt_snapshots.store(corrupt, Ordering::SeqCst);
    }

    fn is_blocked(&self, from: &PeerId, to: &PeerId) -> bool {
        self.inner.isolated.contains(from)
            || self.inner.isolated.contains(to)
            || self.inner.blocked.contains(&(*from, *to))
    }

    fn take_drop(&self) -> bool {
        self.inner
            .drop_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct SimTransport {
    from: PeerId,
    net: SimNetwork,
}

#[async_trait::async_trait]
impl Transport for SimTransport {
    async fn send(
        &self,
        target: PeerId,
        mut request: RaftRequest,
    ) -> Result<RaftResponse, TransportError> {
        if self.net.is_blocked(&self.from, &target) {
            return Err(TransportError::Unreachable(target));
        }
        if self.net.take_drop() {
            tracing::trace!(from = %self.from.fmt_short(), to = %target.fmt_short(), kind = request.kind(), "dropped request");
            return Err(TransportError::Dropped);
        }
        if let RaftRequest::InstallSnapshot(req) = &mut request {
            if self.net.inner.corrupt_snapshots.load(Ordering::SeqCst) {
                if let Some(byte) = req.data.first_mut() {
                    *byte ^= 0xff;
                }
            }
        }
        let Some(raft) = self.net.get(&target) else {
            return Err(TransportError::Unreachable(target));
        };
        let response = raft
            .handle_request(request)
            .await
            .map_err(|e| TransportError::Remote(e.to_string()))?;
        // The link may have gone down while the peer was processing.
        if self.net.is_blocked(&target, &self.from) {
            return Err(TransportError::Dropped);
        }
        Ok(response)
    }
}
