//! End-to-end matcher flows over a real pipe directory: a hand-rolled
//! parachain cache stands in for the chain workers and a recording mock
//! stands in for the host ledger, so every scenario runs without external
//! infrastructure.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use eyre::Result;

use uia_gateway::config::{
    Config, DatabaseConfig, ForeignAccount, GatewayAsset, HostLedgerConfig, NetworkConfig,
    ProcessToggles, ServerConfig, SignerConfig, Timing, WatchdogConfig,
};
use uia_gateway::context::GatewayContext;
use uia_gateway::db;
use uia_gateway::listener::{spawn_listener, ListenerParams};
use uia_gateway::parachain::cache_doc;
use uia_gateway::signer::HostLedger;
use uia_gateway::types::{
    AuditEvent, DepositRecord, IssuerAction, Network, ParachainFragment, Transfer,
    WithdrawalRecord,
};

/// Records every issue/reserve the gateway fires.
#[derive(Default)]
struct RecordingHost {
    issues: Mutex<Vec<(String, f64, String)>>,
    reserves: Mutex<Vec<(String, f64)>>,
}

#[async_trait]
impl HostLedger for RecordingHost {
    async fn issue(&self, asset: &GatewayAsset, amount: f64, to_client: &str) -> Result<String> {
        self.issues
            .lock()
            .unwrap()
            .push((asset.asset_name.clone(), amount, to_client.to_string()));
        Ok("host-tx-issue".to_string())
    }

    async fn reserve(&self, asset: &GatewayAsset, amount: f64) -> Result<String> {
        self.reserves
            .lock()
            .unwrap()
            .push((asset.asset_name.clone(), amount));
        Ok("host-tx-reserve".to_string())
    }
}

fn fast_timing() -> Timing {
    Timing {
        poll_secs: 0.05,
        timeout_secs: 1,
        pause_secs: 1,
        request_secs: 1,
        estimate_secs: 60,
    }
}

fn network_config(network: Network, addresses: &[&str]) -> NetworkConfig {
    NetworkConfig {
        rpc_urls: vec![],
        wallet: None,
        accounts: addresses
            .iter()
            .map(|public| ForeignAccount {
                public: public.to_string(),
                private: format!("{public}-wif"),
            })
            .collect(),
        asset: GatewayAsset {
            asset_id: format!("1.3.{}", network as usize + 1),
            asset_name: format!("GATEWAY.{}", network.ticker()),
            asset_precision: 8,
            issuer_id: "1.2.42".to_string(),
            issuer_public: "gateway-issuer".to_string(),
        },
        timing: fast_timing(),
        window: 10,
        nil: match network {
            Network::Eos => 3.0,
            Network::Xrp => 27.0,
            _ => 0.0001,
        },
        max_unspent: None,
    }
}

fn test_config(pipe: PathBuf) -> Config {
    let offerings = vec![Network::Btc, Network::Xrp, Network::Eos];
    let networks: BTreeMap<Network, NetworkConfig> = [
        (Network::Btc, network_config(Network::Btc, &["A0", "A1", "A2"])),
        (Network::Xrp, network_config(Network::Xrp, &["rGateway"])),
        (Network::Eos, network_config(Network::Eos, &["gatewayacct"])),
    ]
    .into_iter()
    .collect();
    Config {
        offerings,
        processes: ProcessToggles {
            deposits: true,
            withdrawals: true,
            ingots: false,
        },
        networks,
        host: HostLedgerConfig {
            nodes: vec!["http://127.0.0.1:1".to_string()],
        },
        signer: SignerConfig {
            url: "http://127.0.0.1:1".to_string(),
            token: None,
        },
        server: ServerConfig {
            bind: "127.0.0.1".to_string(),
            port: 0,
            route: "gateway".to_string(),
        },
        database: DatabaseConfig {
            url: "sqlite::memory:".to_string(),
        },
        watchdog: WatchdogConfig {
            stale_secs: 60,
            repeat_secs: 600,
        },
        pipe_dir: pipe,
        contact: "support@example.com".to_string(),
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    ctx: Arc<GatewayContext>,
    host: Arc<RecordingHost>,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path().to_path_buf());
    let pool = db::create_pool("sqlite::memory:").await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    let host = Arc::new(RecordingHost::default());
    let ctx = GatewayContext::with_parts(config, pool, host.clone(), BTreeMap::new()).unwrap();
    ctx.ipc.initialize().await.unwrap();
    Harness {
        _dir: dir,
        ctx,
        host,
    }
}

fn transfer(to: &str, memo: &str, amount: f64, asset: &str) -> Transfer {
    Transfer {
        to: to.to_string(),
        from: "client-foreign-addr".to_string(),
        memo: memo.to_string(),
        hash: "native-tx-hash".to_string(),
        asset: asset.to_string(),
        amount,
    }
}

async fn write_cache(ctx: &GatewayContext, network: Network, cache: &ParachainFragment) {
    ctx.ipc.write(&cache_doc(network), cache).await.unwrap();
}

fn deposit_spec(ctx: &GatewayContext, network: Network, spec_overrides: ListenerParamsInit) -> ListenerParams {
    let mut header = ctx.header(network);
    header.event_id = Some(ctx.next_deposit_id());
    ListenerParams {
        network,
        action: IssuerAction::Issue,
        listening_to: spec_overrides.listening_to,
        required_memo: spec_overrides.required_memo,
        expected_amount: None,
        client_id: Some("1.2.100".to_string()),
        account_idx: spec_overrides.account_idx,
        event: AuditEvent::Deposits {
            header,
            record: DepositRecord {
                client_id: Some("1.2.100".to_string()),
                ..Default::default()
            },
        },
    }
}

struct ListenerParamsInit {
    listening_to: String,
    required_memo: Option<String>,
    account_idx: usize,
}

/// BTC deposit happy path: request locks A1, a cached transfer to A1 fires
/// the issue, and the address returns to the pool after the cool-down.
#[tokio::test]
async fn test_pooled_deposit_issues_and_releases_address() {
    let h = harness().await;
    h.ctx.allocator.initialize(Network::Btc, 3).await.unwrap();

    let idx = h.ctx.allocator.lock(Network::Btc).await.unwrap().unwrap();
    assert_eq!(idx, 1);
    assert_eq!(
        h.ctx.allocator.state(Network::Btc).await.unwrap(),
        vec![1, 0, 1]
    );

    let mut cache = ParachainFragment::new();
    cache.insert(100, vec![]);
    write_cache(&h.ctx, Network::Btc, &cache).await;

    let spec = deposit_spec(
        &h.ctx,
        Network::Btc,
        ListenerParamsInit {
            listening_to: "A1".to_string(),
            required_memo: None,
            account_idx: idx,
        },
    );
    let (armed_tx, armed_rx) = tokio::sync::oneshot::channel();
    let handle = spawn_listener(h.ctx.clone(), spec, Some(armed_tx));
    armed_rx.await.unwrap();

    cache.insert(101, vec![transfer("A1", "", 0.5, "BTC")]);
    write_cache(&h.ctx, Network::Btc, &cache).await;

    handle.await.unwrap();
    let issues = h.host.issues.lock().unwrap().clone();
    assert_eq!(issues, vec![("GATEWAY.BTC".to_string(), 0.5, "1.2.100".to_string())]);

    // exactly one terminal action in the audit trail
    assert_eq!(
        db::count_rows_like(&h.ctx.pool, "deposits", "%ISSUING%")
            .await
            .unwrap(),
        1
    );

    // the address comes back within pause + epsilon
    tokio::time::sleep(Duration::from_millis(1600)).await;
    assert_eq!(
        h.ctx.allocator.state(Network::Btc).await.unwrap(),
        vec![1, 1, 1]
    );
}

/// XRP deposit with the right memo issues for the observed amount.
#[tokio::test]
async fn test_memo_deposit_issues_on_matching_memo() {
    let h = harness().await;
    let mut cache = ParachainFragment::new();
    cache.insert(500, vec![]);
    write_cache(&h.ctx, Network::Xrp, &cache).await;

    let spec = deposit_spec(
        &h.ctx,
        Network::Xrp,
        ListenerParamsInit {
            listening_to: "rGateway".to_string(),
            required_memo: Some("1234567890".to_string()),
            account_idx: 0,
        },
    );
    let (armed_tx, armed_rx) = tokio::sync::oneshot::channel();
    let handle = spawn_listener(h.ctx.clone(), spec, Some(armed_tx));
    armed_rx.await.unwrap();

    cache.insert(501, vec![transfer("rGateway", "1234567890", 50.0, "XRP")]);
    write_cache(&h.ctx, Network::Xrp, &cache).await;

    handle.await.unwrap();
    let issues = h.host.issues.lock().unwrap().clone();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].1, 50.0);
}

/// XRP deposit with the wrong memo never issues; the mismatch is
/// chronicled and the matcher runs to its timeout.
#[tokio::test]
async fn test_memo_deposit_rejects_wrong_memo() {
    let h = harness().await;
    let mut cache = ParachainFragment::new();
    cache.insert(500, vec![]);
    write_cache(&h.ctx, Network::Xrp, &cache).await;

    let spec = deposit_spec(
        &h.ctx,
        Network::Xrp,
        ListenerParamsInit {
            listening_to: "rGateway".to_string(),
            required_memo: Some("1234567890".to_string()),
            account_idx: 0,
        },
    );
    let (armed_tx, armed_rx) = tokio::sync::oneshot::channel();
    let handle = spawn_listener(h.ctx.clone(), spec, Some(armed_tx));
    armed_rx.await.unwrap();

    cache.insert(501, vec![transfer("rGateway", "9999999999", 50.0, "XRP")]);
    write_cache(&h.ctx, Network::Xrp, &cache).await;

    handle.await.unwrap();
    assert!(h.host.issues.lock().unwrap().is_empty());
    assert_eq!(
        db::count_rows_like(&h.ctx.pool, "deposits", "%invalid memo%")
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        db::count_rows_like(&h.ctx.pool, "deposits", "%listener timeout%")
            .await
            .unwrap(),
        1
    );
}

/// EOS dust deposit: chronicled as nil, never issued.
#[tokio::test]
async fn test_dust_deposit_is_logged_not_issued() {
    let h = harness().await;
    let mut cache = ParachainFragment::new();
    cache.insert(9000, vec![]);
    write_cache(&h.ctx, Network::Eos, &cache).await;

    let spec = deposit_spec(
        &h.ctx,
        Network::Eos,
        ListenerParamsInit {
            listening_to: "gatewayacct".to_string(),
            required_memo: Some("abc123defg".to_string()),
            account_idx: 0,
        },
    );
    let (armed_tx, armed_rx) = tokio::sync::oneshot::channel();
    let handle = spawn_listener(h.ctx.clone(), spec, Some(armed_tx));
    armed_rx.await.unwrap();

    // 2 EOS against nil(eos) = 3
    cache.insert(9001, vec![transfer("gatewayacct", "abc123defg", 2.0, "EOS")]);
    write_cache(&h.ctx, Network::Eos, &cache).await;

    handle.await.unwrap();
    assert!(h.host.issues.lock().unwrap().is_empty());
    assert_eq!(
        db::count_rows_like(&h.ctx.pool, "deposits", "%received nil amount%")
            .await
            .unwrap(),
        1
    );
}

/// Reserve matcher fires within +-0.01% of the expected amount and records
/// exactly one RESERVING row.
#[tokio::test]
async fn test_reserve_matches_within_tolerance() {
    let h = harness().await;
    let mut cache = ParachainFragment::new();
    cache.insert(700, vec![]);
    write_cache(&h.ctx, Network::Xrp, &cache).await;

    let mut header = h.ctx.header(Network::Xrp);
    header.event_id = Some(h.ctx.next_withdrawal_id());
    let spec = ListenerParams {
        network: Network::Xrp,
        action: IssuerAction::Reserve,
        listening_to: "rClient".to_string(),
        required_memo: None,
        expected_amount: Some(50.0),
        client_id: Some("1.2.200".to_string()),
        account_idx: 0,
        event: AuditEvent::Withdrawals {
            header,
            record: WithdrawalRecord {
                client_address: Some("rClient".to_string()),
                withdrawal_amount: Some(50.0),
                ..Default::default()
            },
        },
    };
    let (armed_tx, armed_rx) = tokio::sync::oneshot::channel();
    let handle = spawn_listener(h.ctx.clone(), spec, Some(armed_tx));
    armed_rx.await.unwrap();

    // an off-amount transfer first, then the real payout shaved by fees
    cache.insert(701, vec![transfer("rClient", "", 45.0, "XRP")]);
    cache.insert(702, vec![transfer("rClient", "", 49.9975, "XRP")]);
    write_cache(&h.ctx, Network::Xrp, &cache).await;

    handle.await.unwrap();
    let reserves = h.host.reserves.lock().unwrap().clone();
    assert_eq!(reserves, vec![("GATEWAY.XRP".to_string(), 49.9975)]);
    assert_eq!(
        db::count_rows_like(&h.ctx.pool, "withdrawals", "%RESERVING%")
            .await
            .unwrap(),
        1
    );
}

/// A matcher that sees nothing times out, chronicles it, and the memo
/// becomes reusable.
#[tokio::test]
async fn test_listener_timeout_releases_memo() {
    let h = harness().await;
    let mut cache = ParachainFragment::new();
    cache.insert(100, vec![]);
    write_cache(&h.ctx, Network::Xrp, &cache).await;

    assert!(h
        .ctx
        .memos
        .try_register(Network::Xrp, "rGateway", "1234567890"));

    let spec = deposit_spec(
        &h.ctx,
        Network::Xrp,
        ListenerParamsInit {
            listening_to: "rGateway".to_string(),
            required_memo: Some("1234567890".to_string()),
            account_idx: 0,
        },
    );
    let handle = spawn_listener(h.ctx.clone(), spec, None);
    handle.await.unwrap();

    assert_eq!(
        db::count_rows_like(&h.ctx.pool, "deposits", "%listener timeout%")
            .await
            .unwrap(),
        1
    );
    // the triple is free again
    assert!(h
        .ctx
        .memos
        .try_register(Network::Xrp, "rGateway", "1234567890"));
}
