//! Synthetic test chain.
//!
//! There is no node: the block number is emulated as every third second of
//! unix time and "transactions" are drawn from a local queue document that
//! test harnesses (and this adapter's own transfer primitive) append to.
//! Amounts are graphene integers at precision 5.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use eyre::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::RpcError;
use crate::ipc::JsonIpc;
use crate::types::{Network, Order, Transfer};

use super::ForeignChain;

/// Queue document callers enqueue transfers into.
pub const QUEUE_DOC: &str = "xyz_transactions";

/// Seconds per emulated block.
const BLOCK_TIME: u64 = 3;

/// Graphene precision 5.
const PRECISION: f64 = 100_000.0;

/// One queued synthetic transaction. `block_num` of -1 executes in
/// whichever block drains the queue next.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XyzTransaction {
    #[serde(rename = "type")]
    pub kind: String,
    pub quantity: u64,
    pub to: String,
    pub public: String,
    #[serde(default)]
    pub memo: String,
    #[serde(default = "any_block")]
    pub block_num: i64,
}

fn any_block() -> i64 {
    -1
}

pub struct XyzChain {
    ipc: JsonIpc,
    /// Block fetches run concurrently; the queue drain must not, or one
    /// entry could land in two blocks.
    drain_guard: tokio::sync::Mutex<()>,
}

impl XyzChain {
    pub fn new(ipc: JsonIpc) -> Self {
        XyzChain {
            ipc,
            drain_guard: tokio::sync::Mutex::new(()),
        }
    }

    async fn drain_queue(&self, block_num: u64) -> Result<Vec<(usize, XyzTransaction)>, RpcError> {
        let _held = self.drain_guard.lock().await;
        let queue: Vec<XyzTransaction> = self
            .ipc
            .read(QUEUE_DOC)
            .await
            .map_err(|err| RpcError::Transport(err.to_string()))?
            .unwrap_or_default();
        let matched: Vec<(usize, XyzTransaction)> = queue
            .into_iter()
            .enumerate()
            .filter(|(_, trx)| trx.block_num < 0 || trx.block_num == block_num as i64)
            .collect();
        if !matched.is_empty() {
            self.ipc
                .write(QUEUE_DOC, &Vec::<XyzTransaction>::new())
                .await
                .map_err(|err| RpcError::Transport(err.to_string()))?;
        }
        Ok(matched)
    }
}

#[async_trait]
impl ForeignChain for XyzChain {
    fn network(&self) -> Network {
        Network::Xyz
    }

    async fn head(&self) -> Result<u64, RpcError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|err| RpcError::Transport(err.to_string()))?;
        Ok(now.as_secs() / BLOCK_TIME)
    }

    async fn block_transfers(&self, block_num: u64) -> Result<Vec<Transfer>, RpcError> {
        let matched = self.drain_queue(block_num).await?;
        Ok(matched
            .into_iter()
            .filter(|(_, trx)| trx.kind == "transfer")
            .map(|(idx, trx)| Transfer {
                hash: entry_hash(idx, block_num, &trx),
                to: trx.to,
                from: trx.public,
                memo: trx.memo,
                asset: "XYZ".to_string(),
                amount: trx.quantity as f64 / PRECISION,
            })
            .collect())
    }

    async fn verify_account(&self, _account: &str) -> Result<bool, RpcError> {
        // nothing to check the account against
        Ok(true)
    }

    async fn balance(&self, _address: &str) -> Result<f64, RpcError> {
        Ok(0.0)
    }

    /// "Broadcast" by enqueueing into the same queue the normalizer drains.
    async fn transfer(&self, order: &Order) -> Result<String> {
        let entry = XyzTransaction {
            kind: "transfer".to_string(),
            quantity: (order.quantity * PRECISION).round() as u64,
            to: order.to.clone(),
            public: order.public.clone(),
            memo: order.memo.clone().unwrap_or_default(),
            block_num: -1,
        };
        let _held = self.drain_guard.lock().await;
        let mut queue: Vec<XyzTransaction> = self.ipc.read(QUEUE_DOC).await?.unwrap_or_default();
        queue.push(entry.clone());
        self.ipc.write(QUEUE_DOC, &queue).await?;
        Ok(entry_hash(queue.len() - 1, 0, &entry))
    }
}

/// Mostly-unique per-entry hash over (index, block number, payload).
fn entry_hash(idx: usize, block_num: u64, trx: &XyzTransaction) -> String {
    let payload = serde_json::to_string(trx).unwrap_or_default();
    let digest = Sha256::digest(format!("{idx}{block_num}{payload}").as_bytes());
    hex::encode(digest)
}
