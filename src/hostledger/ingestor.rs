//! Withdrawal ingestor.
//!
//! Several mavens independently read the host ledger's irreversible head
//! and block contents from different public nodes; a tick acts only on
//! their statistical mode. Transfers of a managed UIA to an issuer account
//! carrying a memo become withdrawal intents: the memo decodes to a foreign
//! address, a reserve matcher arms on it, and the foreign payout is
//! broadcast.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use eyre::{eyre, Result};
use rand::Rng;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinSet;

use crate::context::GatewayContext;
use crate::listener::{spawn_listener, ListenerParams};
use crate::metrics;
use crate::types::{AuditEvent, IssuerAction, Network, Order, WithdrawalRecord};

use super::consensus::statistical_mode;
use super::rpc::HostNodeClient;

/// Concurrent consensus readers; fewer when fewer nodes are configured.
const BLOCK_MAVENS: usize = 7;

/// Lifetime of a long-lived block-number maven before its termination and
/// respawn, bounding memory and shedding hung connections.
const MAVEN_RECYCLE: Duration = Duration::from_secs(600);

/// Join deadline for the short-lived per-block mavens.
const BLOCK_JOIN_DEADLINE: Duration = Duration::from_secs(6);

/// Host-ledger RPC timeout.
const HOST_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Fallback ceiling while waiting for a reserve matcher to arm.
const ARM_DEADLINE: Duration = Duration::from_secs(30);

const BLOCK_NUMBER_DOC: &str = "block_number";

fn block_num_maven_doc(maven_id: usize) -> String {
    format!("block_num_maven_{maven_id}")
}

fn block_maven_doc(maven_id: usize) -> String {
    format!("block_maven_{maven_id}")
}

/// A graphene transfer operation body (op code 0).
#[derive(Debug, Clone, serde::Deserialize)]
struct TransferOp {
    from: String,
    to: String,
    amount: OpAmount,
    #[serde(default)]
    memo: Option<Value>,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct OpAmount {
    /// Integer base units lacking precision.
    amount: i64,
    asset_id: String,
}

impl TransferOp {
    /// Base units to decimal under the asset's precision.
    fn decimal_amount(&self, precision: u32) -> f64 {
        self.amount.amount as f64 / 10f64.powi(precision as i32)
    }
}

pub struct WithdrawalIngestor;

impl WithdrawalIngestor {
    pub async fn run(ctx: Arc<GatewayContext>) -> Result<()> {
        let nodes = ctx.config.host.nodes.clone();
        let mavens = BLOCK_MAVENS.min(nodes.len());

        // scrub opinions from any previous session
        for maven_id in 0..mavens {
            ctx.ipc.write(&block_num_maven_doc(maven_id), &[0u64]).await?;
        }
        ctx.ipc.write(BLOCK_NUMBER_DOC, &[0u64]).await?;

        let recycler = tokio::spawn(recycle_block_num_mavens(
            ctx.clone(),
            nodes.clone(),
            mavens,
        ));
        tracing::info!(mavens, nodes = nodes.len(), "withdrawal ingestor started");

        let mut last_block: u64 = 0;
        let outcome = loop {
            if let Err(err) = tick(&ctx, &nodes, mavens, &mut last_block).await {
                // consensus shortfalls and node flakes alike: skip the tick,
                // the next one re-attempts
                metrics::CONSENSUS_SKIPS
                    .with_label_values(&["tick"])
                    .inc();
                tracing::warn!(error = %err, "ingest tick skipped");
            }
            // 2 blocks
            if let Err(err) = ctx.watchdog.sleep("withdrawals", Duration::from_secs(6)).await {
                break err;
            }
        };
        recycler.abort();
        Err(outcome)
    }
}

/// One ingest pass: consensus irreversible head, then consensus contents of
/// every newly irreversible block.
async fn tick(
    ctx: &Arc<GatewayContext>,
    nodes: &[String],
    mavens: usize,
    last_block: &mut u64,
) -> Result<()> {
    let mut opinions = Vec::with_capacity(mavens);
    for maven_id in 0..mavens {
        if let Ok(Some(doc)) = ctx.ipc.read::<Vec<u64>>(&block_num_maven_doc(maven_id)).await {
            if let Some(&num) = doc.first() {
                if num > 0 {
                    opinions.push(num);
                }
            }
        }
    }
    let current = statistical_mode(&opinions)
        .ok_or_else(|| eyre!("no consensus on irreversible block number"))?;
    ctx.ipc.write(BLOCK_NUMBER_DOC, &[current]).await?;
    metrics::HOST_IRREVERSIBLE_BLOCK.set(current as f64);

    if current > *last_block {
        // not on the first iteration
        if *last_block > 0 {
            let new_blocks: Vec<u64> = (*last_block + 1..=current).collect();
            let blocks = consensus_blocks(ctx, nodes, mavens, &new_blocks).await?;
            tracing::info!(
                irreversible = current,
                batch = new_blocks.len(),
                "processing host-ledger blocks"
            );
            for (block_num, transactions) in blocks {
                for (item, trx) in transactions.iter().enumerate() {
                    let operations = trx["operations"]
                        .as_array()
                        .map(Vec::as_slice)
                        .unwrap_or(&[]);
                    for op in operations {
                        // transfer ops only
                        if op.get(0).and_then(Value::as_u64) != Some(0) {
                            continue;
                        }
                        let Some(body) = op.get(1).cloned() else {
                            continue;
                        };
                        // each intent gets its own handler so the ingest
                        // loop keeps moving
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            handle_transfer_op(ctx, body, block_num, item + 1).await;
                        });
                    }
                }
            }
        }
        *last_block = current;
    }
    Ok(())
}

/// Long-lived irreversible-head readers, terminated and respawned in
/// rotation so each child lives about ten minutes.
async fn recycle_block_num_mavens(ctx: Arc<GatewayContext>, nodes: Vec<String>, mavens: usize) {
    let spawn = |maven_id: usize| {
        let ctx = ctx.clone();
        let nodes = nodes.clone();
        tokio::spawn(async move { block_num_maven(ctx, nodes, maven_id).await })
    };
    let mut handles: Vec<_> = (0..mavens).map(spawn).collect();
    loop {
        for maven_id in 0..mavens {
            tokio::time::sleep(MAVEN_RECYCLE / mavens as u32).await;
            handles[maven_id].abort();
            handles[maven_id] = spawn(maven_id);
        }
    }
}

/// One maven's opinion loop: publish the irreversible head of its node,
/// switching nodes whenever the answer is stale, out of range, or absent.
async fn block_num_maven(ctx: Arc<GatewayContext>, nodes: Vec<String>, maven_id: usize) {
    let doc = block_num_maven_doc(maven_id);
    let mut node_idx = random_index(nodes.len());
    loop {
        let Ok(client) = HostNodeClient::new(&nodes[node_idx], HOST_REQUEST_TIMEOUT) else {
            node_idx = random_index(nodes.len());
            continue;
        };
        loop {
            // occasionally rotate to spread load across public nodes
            if random_one_in(100) {
                break;
            }
            let globals = match client.dynamic_globals().await {
                Ok(globals) => globals,
                Err(_) => break,
            };
            // a node whose head is old is itself behind
            if chrono::Utc::now().timestamp() - globals.time > 10 {
                break;
            }
            let block_num = globals.last_irreversible_block_num;
            let latest: u64 = ctx
                .ipc
                .read::<Vec<u64>>(BLOCK_NUMBER_DOC)
                .await
                .ok()
                .flatten()
                .and_then(|doc| doc.first().copied())
                .unwrap_or(0);
            // wildly out-of-range answers mean a forked or lagging node
            if latest > 0 && (block_num > latest + 1200 || block_num + 5 < latest) {
                break;
            }
            if ctx.ipc.write(&doc, &[block_num]).await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        node_idx = random_index(nodes.len());
    }
}

/// Fan out short-lived mavens for the new blocks' transaction lists and
/// reduce their opinions to a per-block mode.
async fn consensus_blocks(
    ctx: &Arc<GatewayContext>,
    nodes: &[String],
    mavens: usize,
    new_blocks: &[u64],
) -> Result<BTreeMap<u64, Vec<Value>>> {
    for maven_id in 0..mavens {
        ctx.ipc
            .write(&block_maven_doc(maven_id), &serde_json::Map::new())
            .await?;
    }

    let mut workers = JoinSet::new();
    for maven_id in 0..mavens {
        let ctx = ctx.clone();
        let nodes = nodes.to_vec();
        let blocks = new_blocks.to_vec();
        workers.spawn(async move { block_maven(ctx, nodes, maven_id, blocks).await });
    }
    // stragglers past the deadline are terminated
    let _ = tokio::time::timeout(BLOCK_JOIN_DEADLINE, async {
        while workers.join_next().await.is_some() {}
    })
    .await;
    workers.abort_all();

    let mut opinions: BTreeMap<u64, Vec<String>> =
        new_blocks.iter().map(|&num| (num, Vec::new())).collect();
    for maven_id in 0..mavens {
        let Ok(Some(report)) = ctx
            .ipc
            .read::<BTreeMap<String, Value>>(&block_maven_doc(maven_id))
            .await
        else {
            continue;
        };
        for &block_num in new_blocks {
            // a maven may not have every block
            if let Some(transactions) = report.get(&block_num.to_string()) {
                opinions
                    .entry(block_num)
                    .or_default()
                    .push(transactions.to_string());
            }
        }
    }

    let mut blocks = BTreeMap::new();
    for (block_num, votes) in opinions {
        if votes.len() < mavens.saturating_sub(1) {
            return Err(eyre!("not enough responding mavens"));
        }
        let winner = statistical_mode(&votes)
            .ok_or_else(|| eyre!("no consensus on block {block_num} contents"))?;
        let transactions: Vec<Value> = serde_json::from_str(&winner)?;
        blocks.insert(block_num, transactions);
    }
    Ok(blocks)
}

/// One short-lived maven: fetch every new block's transaction list from a
/// freshly selected node and publish the result. Runs until it succeeds or
/// the join deadline terminates it.
async fn block_maven(
    ctx: Arc<GatewayContext>,
    nodes: Vec<String>,
    maven_id: usize,
    new_blocks: Vec<u64>,
) {
    let doc = block_maven_doc(maven_id);
    let mut node_idx = random_index(nodes.len());
    'nodes: loop {
        let Ok(client) = HostNodeClient::new(&nodes[node_idx], HOST_REQUEST_TIMEOUT) else {
            node_idx = random_index(nodes.len());
            continue;
        };
        let mut report: BTreeMap<String, Value> = BTreeMap::new();
        for &block_num in &new_blocks {
            match client.block_transactions(block_num).await {
                Ok(transactions) => {
                    report.insert(block_num.to_string(), Value::Array(transactions));
                }
                Err(_) => {
                    node_idx = random_index(nodes.len());
                    continue 'nodes;
                }
            }
        }
        let _ = ctx.ipc.write(&doc, &report).await;
        return;
    }
}

/// Decide whether a transfer op is a withdrawal intent and, if so, run the
/// whole payout flow. Never propagates: every failure is chronicled and
/// terminates this one event.
async fn handle_transfer_op(ctx: Arc<GatewayContext>, body: Value, block_num: u64, trx_idx: usize) {
    let op: TransferOp = match serde_json::from_value(body) {
        Ok(op) => op,
        Err(_) => return,
    };
    if !ctx.config.issuer_ids().contains(&op.to) {
        return;
    }
    let Some(network) = ctx.config.network_for_asset_id(&op.amount.asset_id) else {
        // a transfer of an asset this gateway does not manage
        tracing::debug!(asset_id = %op.amount.asset_id, "transfer to issuer of unmanaged asset");
        return;
    };
    if let Err(err) = withdraw(ctx.clone(), network, op, block_num, trx_idx).await {
        metrics::ERRORS
            .with_label_values(&["withdrawals", "handler"])
            .inc();
        tracing::error!(%network, error = ?err, "withdrawal handler failed");
    }
}

async fn withdraw(
    ctx: Arc<GatewayContext>,
    network: Network,
    op: TransferOp,
    block_num: u64,
    trx_idx: usize,
) -> Result<()> {
    let mut header = ctx.header(network);
    header.nonce = Some(GatewayContext::nonce());

    let Some(memo_blob) = op.memo.clone() else {
        let event = AuditEvent::Withdrawals {
            header,
            record: WithdrawalRecord {
                op: Some("transfer".to_string()),
                uia_id: Some(op.amount.asset_id.clone()),
                client_id: Some(op.from.clone()),
                ..Default::default()
            },
        };
        // no refund path for these; the chronicle entry is all they get
        ctx.chronicle
            .record(&event, "WARN: transfer to gateway WITHOUT memo")
            .await?;
        return Ok(());
    };

    header.event_id = Some(ctx.next_withdrawal_id());
    metrics::WITHDRAWALS_DETECTED
        .with_label_values(&[network.as_str()])
        .inc();

    let precision = ctx.config.network(network).asset.asset_precision;
    let amount = op.decimal_amount(precision);
    let gateway_account = ctx.config.network(network).accounts[0].clone();
    let memo_text = match &memo_blob {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };

    let mut record = WithdrawalRecord {
        op: Some("transfer".to_string()),
        uia_id: Some(op.amount.asset_id.clone()),
        withdrawal_amount: Some(amount),
        gateway_address: Some(gateway_account.public.clone()),
        client_id: Some(op.from.clone()),
        account_idx: Some(0),
        memo: Some(memo_text),
        ..Default::default()
    };
    let event = AuditEvent::Withdrawals {
        header: header.clone(),
        record: record.clone(),
    };
    tracing::info!(
        %network,
        block_num,
        trx_idx,
        client = %op.from,
        amount,
        "withdrawal request: transfer to gateway with memo"
    );
    ctx.chronicle
        .record(
            &event,
            &format!(
                "withdrawal request: transfer {} to gateway with memo",
                op.amount.asset_id
            ),
        )
        .await?;

    // the memo names the foreign destination
    let client_address = match ctx.signer.decode_memo(network, &memo_blob).await {
        Ok(address) => address,
        Err(err) => {
            ctx.chronicle
                .record(&event, &format!("memo decode failed: {err}"))
                .await?;
            return Ok(());
        }
    };

    let chain = ctx.chain(network)?;
    if !chain.verify_account(&client_address).await.unwrap_or(false) {
        ctx.chronicle
            .record(
                &event,
                &format!("memo is NOT a valid {network} account name"),
            )
            .await?;
        return Ok(());
    }

    record.client_address = Some(client_address.clone());
    record.order_public = Some(gateway_account.public.clone());
    record.order_to = Some(client_address.clone());
    record.order_quantity = Some(amount);
    let event = AuditEvent::Withdrawals {
        header,
        record: record.clone(),
    };

    // arm the reserve matcher on the client's foreign address before any
    // coin moves; it signals once its start block is recorded
    let (armed_tx, armed_rx) = oneshot::channel();
    spawn_listener(
        ctx.clone(),
        ListenerParams {
            network,
            action: IssuerAction::Reserve,
            listening_to: client_address.clone(),
            required_memo: None,
            expected_amount: Some(amount),
            client_id: Some(op.from.clone()),
            account_idx: 0,
            event: event.clone(),
        },
        Some(armed_tx),
    );
    ctx.chronicle
        .record(
            &event,
            &format!("spawn {network} withdrawal listener to reserve {amount}"),
        )
        .await?;
    if tokio::time::timeout(ARM_DEADLINE, armed_rx).await.is_err() {
        tracing::warn!(%network, "reserve matcher did not signal armed before deadline");
    }

    let order = Order {
        public: gateway_account.public.clone(),
        private: gateway_account.private.clone(),
        to: client_address.clone(),
        quantity: amount,
        memo: None,
    };
    match chain.transfer(&order).await {
        Ok(tx_id) => {
            record.tx_id = Some(tx_id.clone());
            let event = AuditEvent::Withdrawals {
                header: event.header().clone(),
                record,
            };
            tracing::info!(%network, tx_id = %tx_id, amount, to = %client_address, "withdrawal broadcast");
            ctx.chronicle
                .record(&event, &format!("broadcast {network} withdrawal transfer"))
                .await?;
        }
        Err(err) => {
            ctx.chronicle
                .record(&event, &format!("foreign transfer failed: {err}"))
                .await?;
        }
    }
    Ok(())
}

fn random_index(len: usize) -> usize {
    rand::thread_rng().gen_range(0..len)
}

fn random_one_in(odds: u32) -> bool {
    rand::thread_rng().gen_range(0..odds) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transfer_op_parses_graphene_shape() {
        let body = json!({
            "fee": { "amount": 1000, "asset_id": "1.3.0" },
            "from": "1.2.200",
            "to": "1.2.42",
            "amount": { "amount": 1_000_000, "asset_id": "1.3.5" },
            "memo": { "from": "PUB1", "to": "PUB2", "nonce": "123", "message": "abcd" },
        });
        let op: TransferOp = serde_json::from_value(body).unwrap();
        assert_eq!(op.from, "1.2.200");
        assert_eq!(op.to, "1.2.42");
        assert_eq!(op.amount.asset_id, "1.3.5");
        assert!(op.memo.is_some());
    }

    #[test]
    fn test_decimal_amount_uses_precision() {
        let op = TransferOp {
            from: String::new(),
            to: String::new(),
            amount: OpAmount {
                amount: 1_000_000,
                asset_id: "1.3.5".to_string(),
            },
            memo: None,
        };
        assert_eq!(op.decimal_amount(5), 10.0);
        assert_eq!(op.decimal_amount(8), 0.01);
    }

    #[test]
    fn test_memo_absence_survives_roundtrip() {
        let body = json!({
            "from": "1.2.200",
            "to": "1.2.42",
            "amount": { "amount": 5, "asset_id": "1.3.5" },
        });
        let op: TransferOp = serde_json::from_value(body).unwrap();
        assert!(op.memo.is_none());
    }

    #[test]
    fn test_maven_doc_names() {
        assert_eq!(block_num_maven_doc(0), "block_num_maven_0");
        assert_eq!(block_maven_doc(6), "block_maven_6");
    }
}
