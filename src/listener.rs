//! Transaction listener / matcher.
//!
//! One listener per in-flight event watches the parachain cache for a
//! transfer matching its predicate, fires the issue or reserve primitive on
//! the host ledger exactly once, and expires after the network's timeout.
//! Listeners read only the cache; they never talk to foreign nodes.

use std::sync::Arc;
use std::time::Instant;

use eyre::Result;
use tokio::sync::oneshot;

use crate::context::GatewayContext;
use crate::metrics;
use crate::parachain::cache_doc;
use crate::types::{
    roughly, AuditEvent, IssuerAction, Network, ParachainFragment, Transfer,
};

/// Everything a matcher needs to arm.
#[derive(Debug, Clone)]
pub struct ListenerParams {
    pub network: Network,
    pub action: IssuerAction,
    /// Gateway deposit address (issue) or client foreign address (reserve).
    pub listening_to: String,
    /// Expected memo; only asserted for issue on memo-based networks.
    pub required_memo: Option<String>,
    /// Expected amount; only asserted for reserve.
    pub expected_amount: Option<f64>,
    /// Host-ledger account receiving issued UIA.
    pub client_id: Option<String>,
    pub account_idx: usize,
    /// Pre-populated audit envelope this matcher chronicles against.
    pub event: AuditEvent,
}

/// How one cached transfer relates to the match predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Not addressed to us, or irrelevant to this matcher.
    Ignore,
    /// Addressed to us with the wrong memo.
    InvalidMemo,
    /// Addressed to us but at or below the dust threshold.
    Nil,
    /// Act on it.
    Match,
}

/// Terminal states of a matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Complete,
    TimedOut,
}

/// Pure match predicate, shared by issue and reserve.
pub fn evaluate_transfer(params: &ListenerParams, nil: f64, transfer: &Transfer) -> Verdict {
    if transfer.to != params.listening_to {
        return Verdict::Ignore;
    }
    if params.action == IssuerAction::Issue && params.network.memo_based() {
        if let Some(required) = &params.required_memo {
            if &transfer.memo != required {
                return Verdict::InvalidMemo;
            }
        }
    }
    if transfer.amount <= 0.0 {
        return Verdict::Ignore;
    }
    if transfer.amount <= nil {
        return Verdict::Nil;
    }
    match params.action {
        IssuerAction::Issue => Verdict::Match,
        IssuerAction::Reserve => match params.expected_amount {
            // the sender is not asserted: the foreign transfer may come
            // from any gateway-owned address, and (amount, destination) is
            // unambiguous within the window
            Some(expected) if roughly(transfer.amount, expected) => Verdict::Match,
            _ => Verdict::Ignore,
        },
    }
}

/// Block numbers already examined. Cached blocks are immutable once
/// written, so each is visited in order exactly once, head included; no
/// action can repeat for a (block, trx_index) pair.
#[derive(Debug)]
pub struct CheckedBlocks {
    max_checked: u64,
}

impl CheckedBlocks {
    pub fn new(start_block: u64) -> Self {
        CheckedBlocks {
            max_checked: start_block,
        }
    }

    /// Every unexamined block up to and including the cache head.
    pub fn next_batch(&mut self, current: u64) -> Vec<u64> {
        if current <= self.max_checked {
            return Vec::new();
        }
        let batch: Vec<u64> = (self.max_checked + 1..=current).collect();
        self.max_checked = current;
        batch
    }
}

/// Spawn a matcher on its own task. `armed` fires once the start block is
/// recorded, i.e. the matcher will see everything from here on.
pub fn spawn_listener(
    ctx: Arc<GatewayContext>,
    params: ListenerParams,
    armed: Option<oneshot::Sender<()>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let network = params.network;
        let event = params.event.clone();
        if let Err(err) = run(ctx.clone(), params, armed).await {
            metrics::ERRORS
                .with_label_values(&["listener", "fatal"])
                .inc();
            tracing::error!(%network, error = ?err, "listener aborted");
            let msg = format!("listener aborted: {err}");
            if let Err(err) = ctx.chronicle.record(&event, &msg).await {
                tracing::error!(%network, error = %err, "failed to chronicle listener abort");
            }
        }
    })
}

async fn run(
    ctx: Arc<GatewayContext>,
    params: ListenerParams,
    armed: Option<oneshot::Sender<()>>,
) -> Result<()> {
    let network = params.network;
    let net_cfg = ctx.config.network(network);
    let timing = net_cfg.timing.clone();
    let nil = net_cfg.nil;
    let pause = timing.pause();
    let doc = cache_doc(network);
    let start = Instant::now();

    // the newest cached block is the start block; everything after it will
    // be examined
    let cache: ParachainFragment = ctx.ipc.read(&doc).await?.unwrap_or_default();
    let start_block = cache.keys().next_back().copied().unwrap_or(0);
    let mut checked = CheckedBlocks::new(start_block);
    if let Some(armed) = armed {
        let _ = armed.send(());
    }

    let action_label = params.action.to_string();
    metrics::LISTENERS_ACTIVE
        .with_label_values(&[network.as_str(), &action_label])
        .inc();
    tracing::info!(
        %network,
        action = %params.action,
        listening_to = %params.listening_to,
        start_block,
        "listener armed"
    );

    let outcome = watch(&ctx, &params, &mut checked, start, &timing, nil, &doc).await;

    metrics::LISTENERS_ACTIVE
        .with_label_values(&[network.as_str(), &action_label])
        .dec();

    match outcome {
        Ok(Outcome::TimedOut) => {
            tracing::warn!(%network, listening_to = %params.listening_to, "listener timeout");
            metrics::LISTENER_TIMEOUTS
                .with_label_values(&[network.as_str()])
                .inc();
            ctx.chronicle.record(&params.event, "listener timeout").await?;
        }
        Ok(Outcome::Complete) => {}
        Err(err) => {
            release_locks(&ctx, &params, pause);
            return Err(err);
        }
    }
    release_locks(&ctx, &params, pause);
    Ok(())
}

/// Both terminal paths give the deposit address back after the cool-down
/// and free the memo for reuse.
fn release_locks(ctx: &GatewayContext, params: &ListenerParams, pause: std::time::Duration) {
    if params.action == IssuerAction::Issue && !params.network.memo_based() {
        ctx.allocator
            .unlock(params.network, params.account_idx, pause);
    }
    if let Some(memo) = &params.required_memo {
        ctx.memos.release(params.network, &params.listening_to, memo);
    }
}

async fn watch(
    ctx: &GatewayContext,
    params: &ListenerParams,
    checked: &mut CheckedBlocks,
    start: Instant,
    timing: &crate::config::Timing,
    nil: f64,
    doc: &str,
) -> Result<Outcome> {
    loop {
        tokio::time::sleep(timing.poll()).await;
        if start.elapsed() > timing.timeout() {
            return Ok(Outcome::TimedOut);
        }
        let cache: ParachainFragment = match ctx.ipc.read(doc).await {
            Ok(Some(cache)) => cache,
            Ok(None) => continue,
            Err(err) => {
                tracing::warn!(network = %params.network, error = %err, "cache read failed");
                continue;
            }
        };
        let Some(current) = cache.keys().next_back().copied() else {
            continue;
        };
        for block_num in checked.next_batch(current) {
            let Some(transfers) = cache.get(&block_num) else {
                // the window has already evicted this block
                let msg = format!("missing block data for {block_num}");
                ctx.chronicle.record(&params.event, &msg).await?;
                continue;
            };
            for transfer in transfers {
                match evaluate_transfer(params, nil, transfer) {
                    Verdict::Ignore => {}
                    Verdict::InvalidMemo => {
                        ctx.chronicle
                            .record(&params.event, "received tx with invalid memo")
                            .await?;
                    }
                    Verdict::Nil => {
                        ctx.chronicle
                            .record(&params.event, "received nil amount")
                            .await?;
                    }
                    Verdict::Match => {
                        act(ctx, params, transfer).await?;
                        return Ok(Outcome::Complete);
                    }
                }
            }
        }
    }
}

/// Fire the host-ledger primitive for a matched transfer. The return to
/// `Complete` right after is what guarantees at most one action per event.
async fn act(ctx: &GatewayContext, params: &ListenerParams, transfer: &Transfer) -> Result<()> {
    let network = params.network;
    let asset = &ctx.config.network(network).asset;
    tracing::info!(
        %network,
        amount = transfer.amount,
        from = %transfer.from,
        to = %transfer.to,
        hash = %transfer.hash,
        "transfer detected"
    );
    match params.action {
        IssuerAction::Issue => {
            let client_id = params.client_id.as_deref().unwrap_or_default();
            let tx_id = ctx.host.issue(asset, transfer.amount, client_id).await?;
            metrics::ISSUES.with_label_values(&[network.as_str()]).inc();
            let msg = format!(
                "ISSUING {} {} to {client_id} ({})",
                transfer.amount, asset.asset_name, tx_id
            );
            tracing::info!(%network, msg);
            ctx.chronicle
                .record(&stamped(params, transfer.amount), &msg)
                .await?;
        }
        IssuerAction::Reserve => {
            let tx_id = ctx.host.reserve(asset, transfer.amount).await?;
            metrics::RESERVES
                .with_label_values(&[network.as_str()])
                .inc();
            let msg = format!(
                "RESERVING {} {} ({})",
                transfer.amount, asset.asset_name, tx_id
            );
            tracing::info!(%network, msg);
            ctx.chronicle
                .record(&stamped(params, transfer.amount), &msg)
                .await?;
        }
    }
    Ok(())
}

/// The terminal audit record carries the matched amount.
fn stamped(params: &ListenerParams, amount: f64) -> AuditEvent {
    let mut event = params.event.clone();
    match &mut event {
        AuditEvent::Deposits { record, .. } => record.amount = Some(amount),
        AuditEvent::Withdrawals { record, .. } => record.withdrawal_amount = Some(amount),
        _ => {}
    }
    event
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AuditHeader;

    fn transfer(to: &str, memo: &str, amount: f64) -> Transfer {
        Transfer {
            to: to.to_string(),
            from: "sender".to_string(),
            memo: memo.to_string(),
            hash: "hash".to_string(),
            asset: "XRP".to_string(),
            amount,
        }
    }

    fn spec(network: Network, action: IssuerAction) -> ListenerParams {
        ListenerParams {
            network,
            action,
            listening_to: "gateway".to_string(),
            required_memo: Some("1234567890".to_string()),
            expected_amount: None,
            client_id: Some("1.2.100".to_string()),
            account_idx: 0,
            event: AuditEvent::System {
                header: AuditHeader::new(network, 0, String::new()),
            },
        }
    }

    #[test]
    fn test_issue_requires_matching_memo_on_memo_networks() {
        let spec = spec(Network::Xrp, IssuerAction::Issue);
        let good = transfer("gateway", "1234567890", 50.0);
        let bad = transfer("gateway", "9999999999", 50.0);
        assert_eq!(evaluate_transfer(&spec, 27.0, &good), Verdict::Match);
        assert_eq!(evaluate_transfer(&spec, 27.0, &bad), Verdict::InvalidMemo);
    }

    #[test]
    fn test_issue_ignores_memo_on_pooled_networks() {
        let mut spec = spec(Network::Btc, IssuerAction::Issue);
        spec.required_memo = None;
        let deposit = transfer("gateway", "", 0.5);
        assert_eq!(evaluate_transfer(&spec, 0.00027, &deposit), Verdict::Match);
    }

    #[test]
    fn test_wrong_address_is_ignored() {
        let spec = spec(Network::Xrp, IssuerAction::Issue);
        let stray = transfer("someone-else", "1234567890", 50.0);
        assert_eq!(evaluate_transfer(&spec, 27.0, &stray), Verdict::Ignore);
    }

    #[test]
    fn test_nil_amounts_are_flagged_not_matched() {
        let spec = spec(Network::Eos, IssuerAction::Issue);
        let mut dust = transfer("gateway", "1234567890", 2.0);
        assert_eq!(evaluate_transfer(&spec, 3.0, &dust), Verdict::Nil);
        // exactly nil is still nil
        dust.amount = 3.0;
        assert_eq!(evaluate_transfer(&spec, 3.0, &dust), Verdict::Nil);
        dust.amount = 0.0;
        assert_eq!(evaluate_transfer(&spec, 3.0, &dust), Verdict::Ignore);
    }

    #[test]
    fn test_reserve_asserts_amount_within_tolerance() {
        let mut spec = spec(Network::Xrp, IssuerAction::Reserve);
        spec.listening_to = "rClient".to_string();
        spec.required_memo = None;
        spec.expected_amount = Some(10.0);
        let exact = transfer("rClient", "", 10.0);
        let close = transfer("rClient", "", 9.9995);
        let off = transfer("rClient", "", 9.9);
        assert_eq!(evaluate_transfer(&spec, 0.1, &exact), Verdict::Match);
        assert_eq!(evaluate_transfer(&spec, 0.1, &close), Verdict::Match);
        assert_eq!(evaluate_transfer(&spec, 0.1, &off), Verdict::Ignore);
    }

    #[test]
    fn test_reserve_does_not_assert_sender() {
        let mut spec = spec(Network::Xrp, IssuerAction::Reserve);
        spec.listening_to = "rClient".to_string();
        spec.required_memo = None;
        spec.expected_amount = Some(10.0);
        let mut matched = transfer("rClient", "", 10.0);
        matched.from = "any-gateway-address".to_string();
        assert_eq!(evaluate_transfer(&spec, 0.1, &matched), Verdict::Match);
    }

    #[test]
    fn test_checked_blocks_visit_each_block_once() {
        let mut checked = CheckedBlocks::new(100);
        assert!(checked.next_batch(100).is_empty());
        assert_eq!(checked.next_batch(101), vec![101]);
        assert_eq!(checked.next_batch(104), vec![102, 103, 104]);
        // nothing new until the head advances again
        assert!(checked.next_batch(104).is_empty());
        assert_eq!(checked.next_batch(105), vec![105]);
    }
}
