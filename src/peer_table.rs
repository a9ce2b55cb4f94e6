//! Trusted-peers-by-file registry. Generalized from `peers.rs::Peers`
//! (a flat list of peer socket addresses collected from a tracker
//! response) into a concurrent map keyed by file id, since here peers
//! are registered incrementally as downloads complete rather than
//! fetched all at once.

use std::collections::HashMap;

use rand::seq::SliceRandom;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedPeer {
    pub host: String,
    pub port: u16,
}

#[derive(Default)]
pub struct PeerTable {
    by_file: Mutex<HashMap<String, Vec<TrustedPeer>>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a peer for `file_id`. Duplicates are acceptable per
    /// spec.md's data model -- no dedup is performed.
    pub async fn register(&self, file_id: &str, peer: TrustedPeer) {
        let mut guard = self.by_file.lock().await;
        guard.entry(file_id.to_string()).or_default().push(peer);
    }

    /// Takes a snapshot of the current peer list for `file_id` and
    /// returns it in randomized order, per spec.md's overflow-path
    /// requirement to "iterate the trusted peers ... in randomized
    /// order". Snapshotting (rather than holding the lock during the
    /// iteration) lets registrations continue to land while a long
    /// probe against one candidate is in flight (§9).
    pub async fn randomized_snapshot(&self, file_id: &str) -> Vec<TrustedPeer> {
        let mut snapshot = {
            let guard = self.by_file.lock().await;
            guard.get(file_id).cloned().unwrap_or_default()
        };
        snapshot.shuffle(&mut rand::thread_rng());
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registrations_are_scoped_per_file_id() {
        let table = PeerTable::new();
        table
            .register("f1", TrustedPeer { host: "a".into(), port: 1 })
            .await;
        table
            .register("f2", TrustedPeer { host: "b".into(), port: 2 })
            .await;

        assert_eq!(table.randomized_snapshot("f1").await.len(), 1);
        assert_eq!(table.randomized_snapshot("f2").await.len(), 1);
        assert_eq!(table.randomized_snapshot("unknown").await.len(), 0);
    }

    #[tokio::test]
    async fn duplicate_registrations_are_kept() {
        let table = PeerTable::new();
        let peer = TrustedPeer { host: "a".into(), port: 1 };
        table.register("f1", peer.clone()).await;
        table.register("f1", peer).await;
        assert_eq!(table.randomized_snapshot("f1").await.len(), 2);
    }
}
