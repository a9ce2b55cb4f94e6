//! Token table and sweeper for the trusted-peer server (§4.4).
//!
//! Shape follows the teacher's small-struct-with-constructor idiom
//! (`Handshake::new`, `PeerID::new`); the 128-bit random id generation
//! reuses the teacher's approach in `peers.rs::PeerID::new` (sample an
//! `Rng` distribution, collect into a fixed-width string).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const TOKEN_TTL: Duration = Duration::from_secs(240);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

struct TokenRecord {
    file_id: String,
    expires_at: Instant,
}

#[derive(Default)]
pub struct TokenTable {
    tokens: Mutex<HashMap<String, TokenRecord>>,
}

impl TokenTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn generate_id() -> String {
        let bytes: [u8; 16] = rand::thread_rng().gen();
        hex::encode(bytes)
    }

    /// Mints a fresh token for `file_id`, valid for `TOKEN_TTL`.
    pub async fn mint(&self, file_id: &str) -> String {
        let id = Self::generate_id();
        let record = TokenRecord {
            file_id: file_id.to_string(),
            expires_at: Instant::now() + TOKEN_TTL,
        };
        self.tokens.lock().await.insert(id.clone(), record);
        id
    }

    /// Validates a `(tokenId, fileId)` pair. A token is multi-use until
    /// it expires or is swept, per the spec's REDESIGN FLAG resolution
    /// mandating multi-shot tokens.
    pub async fn validate(&self, token_id: &str, file_id: &str) -> bool {
        let guard = self.tokens.lock().await;
        match guard.get(token_id) {
            Some(record) => record.file_id == file_id && record.expires_at > Instant::now(),
            None => false,
        }
    }

    /// Evicts every token whose `expires_at` has already passed.
    pub async fn sweep(&self) {
        let mut guard = self.tokens.lock().await;
        let now = Instant::now();
        let before = guard.len();
        guard.retain(|_, record| record.expires_at > now);
        let evicted = before - guard.len();
        if evicted > 0 {
            debug!("token sweep evicted {evicted} expired tokens");
        }
    }

    /// Spawns the periodic sweeper task. The returned handle is dropped
    /// by callers who don't need to join it; the sweeper runs for the
    /// lifetime of the owning process, as spec.md requires.
    pub fn spawn_sweeper(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn minted_token_validates_against_its_file_id_only() {
        let table = TokenTable::new();
        let id = table.mint("file-a").await;
        assert!(table.validate(&id, "file-a").await);
        assert!(!table.validate(&id, "file-b").await);
        assert!(!table.validate("not-a-real-token", "file-a").await);
    }

    #[tokio::test]
    async fn token_is_multi_use_until_swept() {
        let table = TokenTable::new();
        let id = table.mint("file-a").await;
        assert!(table.validate(&id, "file-a").await);
        assert!(table.validate(&id, "file-a").await);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_token_fails_validation_after_ttl() {
        let table = TokenTable::new();
        let id = table.mint("file-a").await;
        tokio::time::advance(TOKEN_TTL + Duration::from_secs(1)).await;
        assert!(!table.validate(&id, "file-a").await);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_only_expired_entries() {
        let table = TokenTable::new();
        let old = table.mint("file-a").await;
        tokio::time::advance(TOKEN_TTL + Duration::from_secs(1)).await;
        let fresh = table.mint("file-b").await;

        table.sweep().await;

        assert!(!table.validate(&old, "file-a").await);
        assert!(table.validate(&fresh, "file-b").await);
    }
}
