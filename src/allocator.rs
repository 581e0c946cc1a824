//! Deposit address allocator.
//!
//! Per network, a binary state vector over the rotating address pool lives
//! in `<network>_gateway_state`: `state[i] == 1` iff address i is free.
//! Index 0 is the outbound / consolidation address and is never handed out.
//! Memo-based networks bypass the allocator entirely and always use index 0.

use std::sync::Arc;
use std::time::Duration;

use eyre::{eyre, Result};
use tokio::sync::Mutex;

use crate::ipc::JsonIpc;
use crate::types::Network;

#[derive(Clone)]
pub struct AddressAllocator {
    ipc: JsonIpc,
    /// Serializes the read-modify-write on the state vectors across
    /// concurrent deposit handlers.
    guard: Arc<Mutex<()>>,
}

fn state_doc(network: Network) -> String {
    format!("{network}_gateway_state")
}

impl AddressAllocator {
    pub fn new(ipc: JsonIpc) -> Self {
        AddressAllocator {
            ipc,
            guard: Arc::new(Mutex::new(())),
        }
    }

    /// Reset a network's pool to all-available.
    pub async fn initialize(&self, network: Network, pool_size: usize) -> Result<()> {
        let _held = self.guard.lock().await;
        let state = vec![1u8; pool_size];
        self.ipc.write(&state_doc(network), &state).await?;
        Ok(())
    }

    /// Claim the lowest free deposit address (index > 0). `None` when the
    /// pool is exhausted.
    pub async fn lock(&self, network: Network) -> Result<Option<usize>> {
        let _held = self.guard.lock().await;
        let doc = state_doc(network);
        let mut state: Vec<u8> = self
            .ipc
            .read(&doc)
            .await?
            .ok_or_else(|| eyre!("address state for {network} is not initialized"))?;
        let claimed = state
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, &slot)| slot == 1)
            .map(|(idx, _)| idx);
        if let Some(idx) = claimed {
            state[idx] = 0;
            self.ipc.write(&doc, &state).await?;
        }
        Ok(claimed)
    }

    /// Return an address to the pool after a cool-down. The delay keeps a
    /// late-arriving transfer from the previous event from being attributed
    /// to a freshly armed matcher on the same address.
    pub fn unlock(&self, network: Network, idx: usize, delay: Duration) {
        let allocator = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = allocator.release(network, idx).await {
                tracing::error!(%network, idx, error = %err, "failed to release address");
            }
        });
    }

    async fn release(&self, network: Network, idx: usize) -> Result<()> {
        let _held = self.guard.lock().await;
        let doc = state_doc(network);
        let mut state: Vec<u8> = self
            .ipc
            .read(&doc)
            .await?
            .ok_or_else(|| eyre!("address state for {network} is not initialized"))?;
        if idx < state.len() {
            state[idx] = 1;
        }
        self.ipc.write(&doc, &state).await?;
        Ok(())
    }

    /// Current state vector, for startup checks and tests.
    pub async fn state(&self, network: Network) -> Result<Vec<u8>> {
        self.ipc
            .read(&state_doc(network))
            .await?
            .ok_or_else(|| eyre!("address state for {network} is not initialized"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fixture() -> (tempfile::TempDir, AddressAllocator) {
        let dir = tempfile::tempdir().unwrap();
        let ipc = JsonIpc::new(dir.path()).with_attempts(4);
        ipc.initialize().await.unwrap();
        (dir, AddressAllocator::new(ipc))
    }

    #[tokio::test]
    async fn test_initialize_sets_all_available() {
        let (_dir, allocator) = fixture().await;
        allocator.initialize(Network::Btc, 3).await.unwrap();
        assert_eq!(allocator.state(Network::Btc).await.unwrap(), vec![1, 1, 1]);
    }

    #[tokio::test]
    async fn test_lock_never_claims_index_zero() {
        let (_dir, allocator) = fixture().await;
        allocator.initialize(Network::Btc, 3).await.unwrap();
        assert_eq!(allocator.lock(Network::Btc).await.unwrap(), Some(1));
        assert_eq!(allocator.lock(Network::Btc).await.unwrap(), Some(2));
        // pool exhausted, index 0 still untouched
        assert_eq!(allocator.lock(Network::Btc).await.unwrap(), None);
        assert_eq!(allocator.state(Network::Btc).await.unwrap(), vec![1, 0, 0]);
    }

    #[tokio::test]
    async fn test_lowest_free_index_first() {
        let (_dir, allocator) = fixture().await;
        allocator.initialize(Network::Ltc, 4).await.unwrap();
        allocator.lock(Network::Ltc).await.unwrap();
        allocator.lock(Network::Ltc).await.unwrap();
        allocator.release(Network::Ltc, 1).await.unwrap();
        assert_eq!(allocator.lock(Network::Ltc).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_delayed_unlock_returns_address() {
        let (_dir, allocator) = fixture().await;
        allocator.initialize(Network::Btc, 2).await.unwrap();
        assert_eq!(allocator.lock(Network::Btc).await.unwrap(), Some(1));
        allocator.unlock(Network::Btc, 1, Duration::from_millis(200));
        // still held during the cool-down
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(allocator.state(Network::Btc).await.unwrap(), vec![1, 0]);
        // released afterwards
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(allocator.state(Network::Btc).await.unwrap(), vec![1, 1]);
    }

    #[tokio::test]
    async fn test_concurrent_locks_are_exclusive() {
        let (_dir, allocator) = fixture().await;
        allocator.initialize(Network::Btc, 6).await.unwrap();
        let mut handles = Vec::new();
        for _ in 0..5 {
            let allocator = allocator.clone();
            handles.push(tokio::spawn(
                async move { allocator.lock(Network::Btc).await },
            ));
        }
        let mut claimed = Vec::new();
        for handle in handles {
            if let Some(idx) = handle.await.unwrap().unwrap() {
                claimed.push(idx);
            }
        }
        claimed.sort_unstable();
        assert_eq!(claimed, vec![1, 2, 3, 4, 5]);
    }
}
