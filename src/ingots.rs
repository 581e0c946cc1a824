//! Ingot casting.
//!
//! Deposits land on rotating inbound addresses; withdrawals always pay out
//! of the index-0 outbound address. This sweep periodically consolidates
//! inbound balances back into index 0 so the outbound side stays funded.

use std::sync::Arc;
use std::time::Duration;

use eyre::Result;

use crate::context::GatewayContext;
use crate::metrics;
use crate::types::{AuditEvent, IngotRecord, Network, Order};

/// Sweep cadence.
const INGOT_INTERVAL: Duration = Duration::from_secs(1800);

/// XRP accounts must keep a base reserve; sweep everything above it.
const XRP_RESERVE: f64 = 20.1;

pub struct IngotCaster;

impl IngotCaster {
    pub async fn run(ctx: Arc<GatewayContext>) -> Result<()> {
        tracing::info!("ingot casting started");
        loop {
            for network in ctx.config.offerings.clone() {
                if let Err(err) = sweep_network(&ctx, network).await {
                    metrics::ERRORS
                        .with_label_values(&["ingots", "sweep"])
                        .inc();
                    tracing::error!(%network, error = ?err, "ingot sweep failed");
                }
            }
            ctx.watchdog.sleep("ingots", INGOT_INTERVAL).await?;
        }
    }
}

async fn sweep_network(ctx: &GatewayContext, network: Network) -> Result<()> {
    match network {
        // EOS multiplexes one account by memo and the synthetic chain has
        // no funds to move
        Network::Eos | Network::Xyz => Ok(()),
        Network::Xrp => sweep_balances(ctx, network, XRP_RESERVE).await,
        Network::Btc | Network::Ltc => sweep_utxo(ctx, network).await,
    }
}

/// Account-balance chains: move each inbound address's balance above the
/// chain reserve back to index 0.
async fn sweep_balances(ctx: &GatewayContext, network: Network, reserve: f64) -> Result<()> {
    let chain = ctx.chain(network)?;
    let net_cfg = ctx.config.network(network);
    let nil = net_cfg.nil;
    let outbound = net_cfg.accounts[0].public.clone();
    for account in net_cfg.accounts.iter().skip(1) {
        let balance = match chain.balance(&account.public).await {
            Ok(balance) => balance,
            Err(err) => {
                tracing::warn!(%network, address = %account.public, error = %err, "balance read failed");
                continue;
            }
        };
        if balance <= nil {
            continue;
        }
        let quantity = balance - reserve;
        if quantity <= nil {
            continue;
        }
        let order = Order {
            public: account.public.clone(),
            private: account.private.clone(),
            to: outbound.clone(),
            quantity,
            memo: None,
        };
        let tx_id = chain.transfer(&order).await?;
        chronicle_ingot(ctx, network, &order, &tx_id).await?;
    }
    Ok(())
}

/// UTXO chains: once the wallet fragments past the unspent budget,
/// consolidate the whole balance into index 0.
async fn sweep_utxo(ctx: &GatewayContext, network: Network) -> Result<()> {
    let chain = ctx.chain(network)?;
    let net_cfg = ctx.config.network(network);
    let Some(max_unspent) = net_cfg.max_unspent else {
        return Ok(());
    };
    let unspent = chain.unspent_count().await.map_err(eyre::Error::from)?;
    if unspent <= max_unspent {
        return Ok(());
    }
    let quantity = chain.wallet_balance().await.map_err(eyre::Error::from)?;
    if quantity <= net_cfg.nil {
        return Ok(());
    }
    let outbound = net_cfg.accounts[0].clone();
    let order = Order {
        public: outbound.public.clone(),
        private: outbound.private.clone(),
        to: outbound.public.clone(),
        quantity,
        memo: None,
    };
    let tx_id = chain.transfer(&order).await?;
    chronicle_ingot(ctx, network, &order, &tx_id).await?;
    Ok(())
}

async fn chronicle_ingot(
    ctx: &GatewayContext,
    network: Network,
    order: &Order,
    tx_id: &str,
) -> Result<()> {
    let msg = format!("consolidating an ingot on {network}");
    tracing::info!(%network, tx_id, quantity = order.quantity, msg);
    let event = AuditEvent::Ingots {
        header: ctx.header(network),
        record: IngotRecord {
            tx_id: Some(tx_id.to_string()),
            order_public: Some(order.public.clone()),
            order_to: Some(order.to.clone()),
            order_quantity: Some(order.quantity),
        },
    };
    ctx.chronicle.record(&event, &msg).await
}
