//! Parachain layer.
//!
//! One worker per enabled foreign network polls its chain, normalizes
//! confirmed blocks into the uniform transfer record, and maintains a
//! windowed cache file `parachain_<network>.cache`. Matchers read only this
//! cache; they never talk to foreign nodes themselves.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eyre::Result;
use futures::StreamExt;
use tokio::task::JoinSet;

use crate::context::GatewayContext;
use crate::error::RpcError;
use crate::metrics;
use crate::types::{Network, Order, ParachainFragment, Transfer};

pub mod eos;
pub mod ltcbtc;
pub mod ripple;
pub mod xyz;

pub use eos::EosChain;
pub use ltcbtc::CoreWalletChain;
pub use ripple::RippleChain;
pub use xyz::XyzChain;

/// Per-block fetches issued concurrently within one batch.
const FETCH_POOL: usize = 8;

/// Uniform adapter over one foreign blockchain.
#[async_trait]
pub trait ForeignChain: Send + Sync {
    fn network(&self) -> Network;

    /// Newest confirmed block number under the network's confirmation
    /// policy (irreversible head, validated ledger, or best block).
    async fn head(&self) -> Result<u64, RpcError>;

    /// Ordered, normalized transfers of one exact block. Implementations
    /// retry transport failures indefinitely; an `Err` is deterministic
    /// (the block data cannot be decoded) and retrying would not help.
    async fn block_transfers(&self, block_num: u64) -> Result<Vec<Transfer>, RpcError>;

    /// Whether `account` exists / is well-formed on this chain.
    async fn verify_account(&self, account: &str) -> Result<bool, RpcError>;

    /// Spendable balance of one gateway address.
    async fn balance(&self, address: &str) -> Result<f64, RpcError>;

    /// Broadcast an outbound transfer. Returns the native transaction id.
    async fn transfer(&self, order: &Order) -> Result<String>;

    /// Wallet-wide balance; only meaningful on core-wallet chains.
    async fn wallet_balance(&self) -> Result<f64, RpcError> {
        Ok(0.0)
    }

    /// Unspent output count; only meaningful on UTXO chains.
    async fn unspent_count(&self) -> Result<usize, RpcError> {
        Ok(0)
    }
}

/// Retry an RPC closure until it stops failing with a transport error.
/// Deterministic schema errors pass through untouched. The delay between
/// attempts grows quadratically and caps at thirty seconds; a parachain
/// would rather stall than skip a block.
pub(crate) async fn retry_transport<T, F, Fut>(what: &str, mut op: F) -> Result<T, RpcError>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, RpcError>>,
{
    let mut iteration: u32 = 0;
    loop {
        match op(iteration).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                if iteration == 1 || iteration % 50 == 0 {
                    tracing::warn!(what, iteration, error = %err, "rpc failed, retrying");
                }
                let delay = (0.02 * f64::from(iteration * iteration)).min(30.0);
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                iteration += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Drop the oldest blocks until at most `window` remain.
pub fn apply_window(cache: &mut ParachainFragment, window: usize) {
    while cache.len() > window {
        cache.pop_first();
    }
}

/// Cache document name for one network.
pub fn cache_doc(network: Network) -> String {
    format!("parachain_{network}.cache")
}

/// Spawns and supervises one parachain worker per offering.
pub struct ParachainManager {
    workers: JoinSet<Result<()>>,
}

impl ParachainManager {
    pub fn spawn(ctx: Arc<GatewayContext>) -> Self {
        let mut workers = JoinSet::new();
        for network in ctx.config.offerings.clone() {
            let ctx = ctx.clone();
            workers.spawn(async move { run_worker(ctx, network).await });
        }
        ParachainManager { workers }
    }

    /// Runs until any worker dies; parachains are load-bearing for every
    /// matcher, so a dead one takes the process down.
    pub async fn run(mut self) -> Result<()> {
        match self.workers.join_next().await {
            Some(Ok(Ok(()))) => Err(eyre::eyre!("parachain worker exited unexpectedly")),
            Some(Ok(Err(err))) => Err(err),
            Some(Err(err)) => Err(eyre::eyre!("parachain worker panicked: {err}")),
            None => Err(eyre::eyre!("no parachain workers were spawned")),
        }
    }
}

async fn run_worker(ctx: Arc<GatewayContext>, network: Network) -> Result<()> {
    let chain = ctx.chain(network)?;
    let timing = ctx.config.network(network).timing.clone();
    let window = ctx.config.network(network).window;
    let doc = cache_doc(network);

    // Scrub any cache left over from a previous run, then seed with the
    // current confirmed head so matchers have a start block immediately.
    ctx.ipc.write(&doc, &ParachainFragment::new()).await?;
    let head = chain.head().await.map_err(eyre::Error::from)?;
    let mut cache = ParachainFragment::new();
    let seeded = fetch_blocks(&ctx, chain.clone(), &[head]).await;
    cache.extend(seeded);
    ctx.ipc.write(&doc, &cache).await?;
    ctx.chronicle
        .record(&ctx.system_event(network), "initializing parachain")
        .await?;
    tracing::info!(%network, head, "parachain initialized");

    loop {
        ctx.watchdog.sleep("parachains", timing.poll()).await?;
        let current = match chain.head().await {
            Ok(current) => current,
            Err(err) => {
                metrics::ERRORS
                    .with_label_values(&["parachains", "head"])
                    .inc();
                tracing::error!(%network, error = %err, "failed to read chain head");
                continue;
            }
        };
        let max_cached = cache.keys().next_back().copied().unwrap_or(head);
        if current > max_cached + 1 {
            // every block after the newest on record, excluding the current
            // head itself
            let new_blocks: Vec<u64> = (max_cached + 1..current).collect();
            tracing::debug!(
                %network,
                from = new_blocks[0],
                to = new_blocks[new_blocks.len() - 1],
                "fetching new blocks"
            );
            let fragment = fetch_blocks(&ctx, chain.clone(), &new_blocks).await;
            cache.extend(fragment);
            apply_window(&mut cache, window);
            ctx.ipc.write(&doc, &cache).await?;
            metrics::PARACHAIN_HEAD
                .with_label_values(&[network.as_str()])
                .set(current as f64);
        }
        metrics::PARACHAIN_TICKS
            .with_label_values(&[network.as_str()])
            .inc();
    }
}

/// Fetch and normalize a batch of blocks concurrently, preserving block
/// order. A block whose data cannot be decoded is recorded as a hole and
/// enters the cache empty; transport failures never surface here because
/// the adapters retry them forever.
async fn fetch_blocks(
    ctx: &GatewayContext,
    chain: Arc<dyn ForeignChain>,
    new_blocks: &[u64],
) -> ParachainFragment {
    let network = chain.network();
    let results: Vec<(u64, Result<Vec<Transfer>, RpcError>)> =
        futures::stream::iter(new_blocks.to_vec().into_iter().map(move |block_num| {
            let chain = chain.clone();
            Box::pin(async move { (block_num, chain.block_transfers(block_num).await) })
                as std::pin::Pin<Box<dyn std::future::Future<Output = _> + Send>>
        }))
        .buffered(FETCH_POOL)
        .collect()
        .await;

    let mut fragment = ParachainFragment::new();
    for (block_num, outcome) in results {
        match outcome {
            Ok(transfers) => {
                fragment.insert(block_num, transfers);
            }
            Err(err) => {
                tracing::error!(%network, block_num, error = %err, "block data undecodable");
                let msg = format!("missing block data for {block_num}");
                if let Err(err) = ctx
                    .chronicle
                    .record(&ctx.system_event(network), &msg)
                    .await
                {
                    tracing::error!(%network, error = %err, "failed to chronicle missing block");
                }
                fragment.insert(block_num, Vec::new());
            }
        }
    }
    fragment
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment_with(keys: &[u64]) -> ParachainFragment {
        keys.iter().map(|&k| (k, Vec::new())).collect()
    }

    #[test]
    fn test_apply_window_keeps_newest() {
        let mut cache = fragment_with(&[1, 2, 3, 4, 5, 6]);
        apply_window(&mut cache, 4);
        assert_eq!(cache.keys().copied().collect::<Vec<_>>(), vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_apply_window_noop_when_under_budget() {
        let mut cache = fragment_with(&[10, 11]);
        apply_window(&mut cache, 5);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_cache_doc_name() {
        assert_eq!(cache_doc(Network::Btc), "parachain_btc.cache");
        assert_eq!(cache_doc(Network::Xyz), "parachain_xyz.cache");
    }

    #[tokio::test]
    async fn test_retry_transport_passes_schema_errors_through() {
        let result: Result<u64, RpcError> = retry_transport("test", |_| async {
            Err(RpcError::Schema("bad block".into()))
        })
        .await;
        assert!(matches!(result, Err(RpcError::Schema(_))));
    }

    #[tokio::test]
    async fn test_retry_transport_retries_until_success() {
        let result = retry_transport("test", |iteration| async move {
            if iteration < 3 {
                Err(RpcError::Transport("connection reset".into()))
            } else {
                Ok(42u64)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }
}
