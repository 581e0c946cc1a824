//! Shared wiring handed to every worker.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{Local, Utc};
use eyre::{eyre, Result};
use sqlx::SqlitePool;

use crate::allocator::AddressAllocator;
use crate::chronicle::Chronicle;
use crate::config::Config;
use crate::ipc::JsonIpc;
use crate::parachain::{CoreWalletChain, EosChain, ForeignChain, RippleChain, XyzChain};
use crate::signer::{HostLedger, SignerClient};
use crate::types::{AuditEvent, AuditHeader, EventId, Network};
use crate::watchdog::Watchdog;

/// Outstanding deposit memos keyed by (network, listening_to, memo).
/// Arming two matchers on the same triple within one timeout window would
/// make their match predicates ambiguous, so the deposit handler checks
/// here first and matchers deregister on termination.
#[derive(Clone, Default)]
pub struct MemoRegistry {
    inner: Arc<Mutex<HashSet<(Network, String, String)>>>,
}

impl MemoRegistry {
    /// Claim a memo triple. False when it is already outstanding.
    pub fn try_register(&self, network: Network, listening_to: &str, memo: &str) -> bool {
        let mut held = self.inner.lock().expect("memo registry lock poisoned");
        held.insert((network, listening_to.to_string(), memo.to_string()))
    }

    pub fn release(&self, network: Network, listening_to: &str, memo: &str) {
        let mut held = self.inner.lock().expect("memo registry lock poisoned");
        held.remove(&(network, listening_to.to_string(), memo.to_string()));
    }
}

pub struct GatewayContext {
    pub config: Config,
    pub ipc: JsonIpc,
    pub pool: SqlitePool,
    pub chronicle: Chronicle,
    pub allocator: AddressAllocator,
    pub watchdog: Watchdog,
    pub signer: Arc<SignerClient>,
    pub host: Arc<dyn HostLedger>,
    pub chains: BTreeMap<Network, Arc<dyn ForeignChain>>,
    pub memos: MemoRegistry,
    pub session_unix: i64,
    pub session_date: String,
    deposit_counter: AtomicU64,
    withdrawal_counter: AtomicU64,
}

impl GatewayContext {
    /// Production wiring: one adapter per offering, signer-backed host
    /// ledger.
    pub fn assemble(config: Config, pool: SqlitePool) -> Result<Arc<Self>> {
        let ipc = JsonIpc::new(&config.pipe_dir);
        let chronicle = Chronicle::new(ipc.clone(), pool.clone());
        let allocator = AddressAllocator::new(ipc.clone());
        let watchdog = Watchdog::new(
            ipc.clone(),
            &config.watchdog,
            vec![
                "parachains".to_string(),
                "deposits".to_string(),
                "withdrawals".to_string(),
                "ingots".to_string(),
            ],
        );
        let signer = Arc::new(SignerClient::new(&config.signer)?);

        let mut chains: BTreeMap<Network, Arc<dyn ForeignChain>> = BTreeMap::new();
        for network in &config.offerings {
            let net_cfg = config.network(*network);
            let chain: Arc<dyn ForeignChain> = match network {
                Network::Eos => Arc::new(EosChain::new(net_cfg, signer.clone())?),
                Network::Xrp => Arc::new(RippleChain::new(net_cfg, signer.clone())?),
                Network::Btc | Network::Ltc => {
                    Arc::new(CoreWalletChain::new(*network, net_cfg)?)
                }
                Network::Xyz => Arc::new(XyzChain::new(ipc.clone())),
            };
            chains.insert(*network, chain);
        }

        Ok(Arc::new(GatewayContext {
            host: signer.clone(),
            signer,
            chains,
            memos: MemoRegistry::default(),
            session_unix: Utc::now().timestamp(),
            session_date: Local::now().format("%a %b %e %H:%M:%S %Y").to_string(),
            deposit_counter: AtomicU64::new(0),
            withdrawal_counter: AtomicU64::new(0),
            config,
            ipc,
            pool,
            chronicle,
            allocator,
            watchdog,
        }))
    }

    /// Test wiring with injected host ledger and chain adapters.
    pub fn with_parts(
        config: Config,
        pool: SqlitePool,
        host: Arc<dyn HostLedger>,
        chains: BTreeMap<Network, Arc<dyn ForeignChain>>,
    ) -> Result<Arc<Self>> {
        let ipc = JsonIpc::new(&config.pipe_dir);
        let chronicle = Chronicle::new(ipc.clone(), pool.clone());
        let allocator = AddressAllocator::new(ipc.clone());
        let watchdog = Watchdog::new(ipc.clone(), &config.watchdog, Vec::new());
        let signer = Arc::new(SignerClient::new(&config.signer)?);
        Ok(Arc::new(GatewayContext {
            host,
            signer,
            chains,
            memos: MemoRegistry::default(),
            session_unix: Utc::now().timestamp(),
            session_date: Local::now().format("%a %b %e %H:%M:%S %Y").to_string(),
            deposit_counter: AtomicU64::new(0),
            withdrawal_counter: AtomicU64::new(0),
            config,
            ipc,
            pool,
            chronicle,
            allocator,
            watchdog,
        }))
    }

    pub fn chain(&self, network: Network) -> Result<Arc<dyn ForeignChain>> {
        self.chains
            .get(&network)
            .cloned()
            .ok_or_else(|| eyre!("no chain adapter for {network}"))
    }

    /// Fresh audit header carrying the session context.
    pub fn header(&self, network: Network) -> AuditHeader {
        AuditHeader::new(network, self.session_unix, self.session_date.clone())
    }

    /// Chronicle-only event with no relational row.
    pub fn system_event(&self, network: Network) -> AuditEvent {
        AuditEvent::System {
            header: self.header(network),
        }
    }

    pub fn next_deposit_id(&self) -> EventId {
        EventId::deposit(self.deposit_counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn next_withdrawal_id(&self) -> EventId {
        EventId::withdrawal(self.withdrawal_counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Microseconds since the epoch; the per-event nonce.
    pub fn nonce() -> i64 {
        Utc::now().timestamp_micros()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memo_registry_rejects_duplicates() {
        let registry = MemoRegistry::default();
        assert!(registry.try_register(Network::Xrp, "rGate", "1234567890"));
        assert!(!registry.try_register(Network::Xrp, "rGate", "1234567890"));
        // different address or network is a different triple
        assert!(registry.try_register(Network::Xrp, "rOther", "1234567890"));
        assert!(registry.try_register(Network::Eos, "rGate", "1234567890"));
    }

    #[test]
    fn test_memo_registry_release_frees_triple() {
        let registry = MemoRegistry::default();
        assert!(registry.try_register(Network::Eos, "gateway", "abc123"));
        registry.release(Network::Eos, "gateway", "abc123");
        assert!(registry.try_register(Network::Eos, "gateway", "abc123"));
    }
}
