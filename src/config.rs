use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{eyre, Result, WrapErr};

use crate::types::Network;

/// Main gateway configuration, loaded from the environment (a `.env` file is
/// honored when present).
#[derive(Debug, Clone)]
pub struct Config {
    /// Networks this gateway instance serves.
    pub offerings: Vec<Network>,
    pub processes: ProcessToggles,
    pub networks: BTreeMap<Network, NetworkConfig>,
    pub host: HostLedgerConfig,
    pub signer: SignerConfig,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub watchdog: WatchdogConfig,
    /// Directory holding the file IPC pipe.
    pub pipe_dir: PathBuf,
    /// Operator support contact returned in deposit responses.
    pub contact: String,
}

/// Which long-running workers to enable. Parachains and the watchdog always
/// run.
#[derive(Debug, Clone)]
pub struct ProcessToggles {
    pub deposits: bool,
    pub withdrawals: bool,
    pub ingots: bool,
}

/// One foreign chain: nodes, rotating address pool, UIA metadata, cadences.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Node endpoints, primary first; rotated on failure. Empty for the
    /// synthetic chain.
    pub rpc_urls: Vec<String>,
    /// Wallet name for core-wallet chains (BTC/LTC).
    pub wallet: Option<String>,
    /// Index 0 is the outbound / consolidation address and is never handed
    /// out for deposits.
    pub accounts: Vec<ForeignAccount>,
    pub asset: GatewayAsset,
    pub timing: Timing,
    /// Blocks retained in the parachain cache.
    pub window: usize,
    /// Dust threshold; inbound transfers at or below it are logged, never
    /// acted on.
    pub nil: f64,
    /// UTXO chains consolidate once the wallet holds more unspent outputs
    /// than this.
    pub max_unspent: Option<usize>,
}

/// A foreign-chain key pair from the rotating pool.
#[derive(Clone)]
pub struct ForeignAccount {
    pub public: String,
    pub private: String,
}

impl fmt::Debug for ForeignAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignAccount")
            .field("public", &self.public)
            .field("private", &"<redacted>")
            .finish()
    }
}

/// Host-ledger UIA metadata for one network.
#[derive(Debug, Clone)]
pub struct GatewayAsset {
    /// "1.3.x"
    pub asset_id: String,
    /// Uppercase UIA symbol, e.g. "GATEWAY.BTC".
    pub asset_name: String,
    pub asset_precision: u32,
    /// "1.2.x"
    pub issuer_id: String,
    pub issuer_public: String,
}

/// Per-network cadences, in seconds.
#[derive(Debug, Clone)]
pub struct Timing {
    /// Parachain update and matcher read cadence.
    pub poll_secs: f64,
    /// Matcher lifetime.
    pub timeout_secs: u64,
    /// Address cool-down after completion or timeout.
    pub pause_secs: u64,
    /// Per-RPC transport timeout.
    pub request_secs: u64,
    /// Typical confirmation time quoted to depositors.
    pub estimate_secs: u64,
}

impl Timing {
    pub fn poll(&self) -> Duration {
        Duration::from_secs_f64(self.poll_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn pause(&self) -> Duration {
        Duration::from_secs(self.pause_secs)
    }

    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }
}

#[derive(Debug, Clone)]
pub struct HostLedgerConfig {
    /// Public host-ledger API nodes; consensus reads span several of them.
    pub nodes: Vec<String>,
}

/// Endpoint performing the signed operations (issue, reserve, foreign
/// broadcasts, memo decode). Keys for the host ledger never enter this
/// process.
#[derive(Clone)]
pub struct SignerConfig {
    pub url: String,
    pub token: Option<String>,
}

impl fmt::Debug for SignerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignerConfig")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub route: String,
}

#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// A worker is stale once its heartbeat is older than this.
    pub stale_secs: u64,
    /// Re-alert cadence for a worker that stays stale.
    pub repeat_secs: u64,
}

impl Config {
    /// Load configuration from environment variables, reading `.env` first
    /// when present.
    pub fn load() -> Result<Self> {
        if Path::new(".env").exists() {
            dotenvy::from_filename(".env").wrap_err("Failed to load .env file")?;
        }
        Self::load_from_env()
    }

    fn load_from_env() -> Result<Self> {
        let offerings: Vec<Network> = parse_list(
            &env::var("GATEWAY_OFFERINGS").unwrap_or_else(|_| "btc,ltc,xrp,eos".to_string()),
        )
        .iter()
        .map(|s| s.parse())
        .collect::<Result<_>>()?;
        if offerings.is_empty() {
            return Err(eyre!("GATEWAY_OFFERINGS cannot be empty"));
        }

        let mut networks = BTreeMap::new();
        for network in &offerings {
            networks.insert(*network, NetworkConfig::load_from_env(*network)?);
        }

        let host = HostLedgerConfig {
            nodes: parse_list(
                &env::var("HOST_NODES")
                    .map_err(|_| eyre!("HOST_NODES environment variable is required"))?,
            ),
        };
        if host.nodes.is_empty() {
            return Err(eyre!("HOST_NODES cannot be empty"));
        }

        let signer = SignerConfig {
            url: env::var("SIGNER_URL")
                .map_err(|_| eyre!("SIGNER_URL environment variable is required"))?,
            token: env::var("SIGNER_TOKEN").ok(),
        };

        Ok(Config {
            offerings,
            processes: ProcessToggles {
                deposits: env_flag("PROCESS_DEPOSITS", true)?,
                withdrawals: env_flag("PROCESS_WITHDRAWALS", true)?,
                ingots: env_flag("PROCESS_INGOTS", false)?,
            },
            networks,
            host,
            signer,
            server: ServerConfig {
                bind: env::var("SERVER_BIND").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("SERVER_PORT")
                    .unwrap_or_else(|_| "4018".to_string())
                    .parse()
                    .wrap_err("SERVER_PORT must be a valid port")?,
                route: env::var("SERVER_ROUTE").unwrap_or_else(|_| "gateway".to_string()),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://gateway_audit.db?mode=rwc".to_string()),
            },
            watchdog: WatchdogConfig {
                stale_secs: env_parsed("WATCHDOG_STALE_SECS", 60)?,
                repeat_secs: env_parsed("WATCHDOG_REPEAT_SECS", 600)?,
            },
            pipe_dir: PathBuf::from(env::var("PIPE_DIR").unwrap_or_else(|_| "pipe".to_string())),
            contact: env::var("GATEWAY_CONTACT")
                .unwrap_or_else(|_| "support@example.com".to_string()),
        })
    }

    /// Per-network section. Completeness over `offerings` is validated at
    /// load time.
    pub fn network(&self, network: Network) -> &NetworkConfig {
        &self.networks[&network]
    }

    /// Resolve a UIA symbol to its network.
    pub fn network_for_uia(&self, uia: &str) -> Option<Network> {
        self.networks
            .iter()
            .find(|(_, cfg)| cfg.asset.asset_name.eq_ignore_ascii_case(uia))
            .map(|(network, _)| *network)
    }

    /// Resolve a host-ledger asset id ("1.3.x") to its network.
    pub fn network_for_asset_id(&self, asset_id: &str) -> Option<Network> {
        self.networks
            .iter()
            .find(|(_, cfg)| cfg.asset.asset_id == asset_id)
            .map(|(network, _)| *network)
    }

    /// Issuer account ids across all offerings; transfers to these accounts
    /// are withdrawal candidates.
    pub fn issuer_ids(&self) -> Vec<String> {
        self.networks
            .values()
            .map(|cfg| cfg.asset.issuer_id.clone())
            .collect()
    }
}

impl NetworkConfig {
    fn load_from_env(network: Network) -> Result<Self> {
        let key = network.as_str().to_uppercase();
        let defaults = NetworkDefaults::for_network(network);

        let rpc_urls = match env::var(format!("{key}_RPC_URLS")) {
            Ok(raw) => parse_list(&raw),
            Err(_) if network == Network::Xyz => Vec::new(),
            Err(_) => return Err(eyre!("{key}_RPC_URLS environment variable is required")),
        };

        let accounts = parse_accounts(
            &env::var(format!("{key}_ACCOUNTS"))
                .map_err(|_| eyre!("{key}_ACCOUNTS environment variable is required"))?,
        )?;
        if accounts.is_empty() {
            return Err(eyre!("{key}_ACCOUNTS cannot be empty"));
        }

        let asset = GatewayAsset {
            asset_id: env::var(format!("{key}_ASSET_ID"))
                .map_err(|_| eyre!("{key}_ASSET_ID environment variable is required"))?,
            asset_name: env::var(format!("{key}_ASSET_NAME"))
                .map_err(|_| eyre!("{key}_ASSET_NAME environment variable is required"))?
                .to_uppercase(),
            asset_precision: env_parsed(&format!("{key}_ASSET_PRECISION"), 8)?,
            issuer_id: env::var(format!("{key}_ISSUER_ID"))
                .map_err(|_| eyre!("{key}_ISSUER_ID environment variable is required"))?,
            issuer_public: env::var(format!("{key}_ISSUER_PUBLIC")).unwrap_or_default(),
        };

        Ok(NetworkConfig {
            rpc_urls,
            wallet: env::var(format!("{key}_WALLET")).ok(),
            accounts,
            asset,
            timing: Timing {
                poll_secs: env_parsed(&format!("{key}_POLL_SECS"), defaults.poll_secs)?,
                timeout_secs: env_parsed(&format!("{key}_TIMEOUT_SECS"), defaults.timeout_secs)?,
                pause_secs: env_parsed(&format!("{key}_PAUSE_SECS"), defaults.pause_secs)?,
                request_secs: env_parsed(&format!("{key}_REQUEST_SECS"), 5)?,
                estimate_secs: env_parsed(&format!("{key}_ESTIMATE_SECS"), defaults.estimate_secs)?,
            },
            window: env_parsed(&format!("{key}_WINDOW"), defaults.window)?,
            nil: env_parsed(&format!("{key}_NIL"), defaults.nil)?,
            max_unspent: defaults.max_unspent,
        })
    }
}

/// Built-in per-network cadences. The window is sized so that
/// window x block_time comfortably exceeds the matcher timeout.
struct NetworkDefaults {
    poll_secs: f64,
    timeout_secs: u64,
    pause_secs: u64,
    estimate_secs: u64,
    window: usize,
    nil: f64,
    max_unspent: Option<usize>,
}

impl NetworkDefaults {
    fn for_network(network: Network) -> Self {
        match network {
            Network::Btc => NetworkDefaults {
                poll_secs: 60.0,
                timeout_secs: 7200,
                pause_secs: 900,
                estimate_secs: 3600,
                window: 20,
                nil: 0.00027,
                max_unspent: Some(10),
            },
            Network::Ltc => NetworkDefaults {
                poll_secs: 30.0,
                timeout_secs: 3600,
                pause_secs: 900,
                estimate_secs: 1800,
                window: 30,
                nil: 0.065,
                max_unspent: Some(10),
            },
            Network::Xrp => NetworkDefaults {
                poll_secs: 1.0,
                timeout_secs: 1800,
                pause_secs: 600,
                estimate_secs: 60,
                window: 2000,
                nil: 27.0,
                max_unspent: None,
            },
            Network::Eos => NetworkDefaults {
                poll_secs: 0.5,
                timeout_secs: 1800,
                pause_secs: 600,
                estimate_secs: 60,
                window: 4000,
                nil: 3.0,
                max_unspent: None,
            },
            Network::Xyz => NetworkDefaults {
                poll_secs: 3.0,
                timeout_secs: 600,
                pause_secs: 60,
                estimate_secs: 10,
                window: 300,
                nil: 0.1,
                max_unspent: None,
            },
        }
    }
}

/// Parse a comma-separated string into trimmed non-empty entries.
pub fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse "public:private,public:private,..." into the address pool.
pub fn parse_accounts(raw: &str) -> Result<Vec<ForeignAccount>> {
    parse_list(raw)
        .iter()
        .map(|entry| {
            let (public, private) = entry
                .split_once(':')
                .ok_or_else(|| eyre!("account entry {entry:?} must be public:private"))?;
            Ok(ForeignAccount {
                public: public.trim().to_string(),
                private: private.trim().to_string(),
            })
        })
        .collect()
}

fn env_flag(name: &str, default: bool) -> Result<bool> {
    match env::var(name) {
        Ok(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(eyre!("{name} must be a boolean, got {other:?}")),
        },
        Err(_) => Ok(default),
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| eyre!("{name} has an invalid value: {raw:?}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_trims_and_skips_empty() {
        assert_eq!(parse_list(" a , b ,,c, "), vec!["a", "b", "c"]);
        assert!(parse_list("").is_empty());
    }

    #[test]
    fn test_parse_accounts() {
        let accounts = parse_accounts("addr0:key0, addr1:key1").unwrap();
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].public, "addr0");
        assert_eq!(accounts[1].private, "key1");
    }

    #[test]
    fn test_parse_accounts_rejects_missing_key() {
        assert!(parse_accounts("lonely_address").is_err());
    }

    #[test]
    fn test_foreign_account_debug_redacts() {
        let account = ForeignAccount {
            public: "addr".into(),
            private: "wif_secret".into(),
        };
        let rendered = format!("{account:?}");
        assert!(!rendered.contains("wif_secret"));
    }

    #[test]
    fn test_window_covers_timeout() {
        // window x block_time must exceed the matcher timeout so a matcher
        // never outlives the blocks it still needs to examine
        let block_time = |network: Network| match network {
            Network::Btc => 600.0,
            Network::Ltc => 150.0,
            Network::Xrp => 4.0,
            Network::Eos => 0.5,
            Network::Xyz => 3.0,
        };
        for network in Network::ALL {
            let defaults = NetworkDefaults::for_network(network);
            assert!(
                defaults.window as f64 * block_time(network) > defaults.timeout_secs as f64,
                "window too small for {network}",
            );
        }
    }
}
