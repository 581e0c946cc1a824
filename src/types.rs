use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};

/// A foreign blockchain the gateway bridges to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Btc,
    Ltc,
    Xrp,
    Eos,
    Xyz,
}

impl Network {
    pub const ALL: [Network; 5] = [
        Network::Btc,
        Network::Ltc,
        Network::Xrp,
        Network::Eos,
        Network::Xyz,
    ];

    /// Lowercase config key ("btc", "xrp", ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Btc => "btc",
            Network::Ltc => "ltc",
            Network::Xrp => "xrp",
            Network::Eos => "eos",
            Network::Xyz => "xyz",
        }
    }

    /// Uppercase ticker as it appears on transfers and archive file names.
    pub fn ticker(&self) -> &'static str {
        match self {
            Network::Btc => "BTC",
            Network::Ltc => "LTC",
            Network::Xrp => "XRP",
            Network::Eos => "EOS",
            Network::Xyz => "XYZ",
        }
    }

    /// Memo-based networks run every deposit through one gateway account
    /// (index 0) and distinguish clients by memo; pooled networks rotate
    /// deposit addresses instead.
    pub fn memo_based(&self) -> bool {
        matches!(self, Network::Xrp | Network::Eos | Network::Xyz)
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Network {
    type Err = eyre::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "btc" => Ok(Network::Btc),
            "ltc" => Ok(Network::Ltc),
            "xrp" => Ok(Network::Xrp),
            "eos" => Ok(Network::Eos),
            "xyz" => Ok(Network::Xyz),
            other => Err(eyre!("unknown network {other:?}")),
        }
    }
}

/// The normalized unit flowing from the parachain workers to the matchers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub to: String,
    /// Empty on UTXO chains, which may omit the sender.
    pub from: String,
    /// Empty on chains without memos.
    pub memo: String,
    pub hash: String,
    pub asset: String,
    pub amount: f64,
}

/// Windowed map of recent blocks: block number -> ordered transfers.
/// serde_json renders the u64 keys as strings, matching the on-disk format
/// `{"<block_num>": [Transfer, ...]}`.
pub type ParachainFragment = BTreeMap<u64, Vec<Transfer>>;

/// Monotone per-handler event identifier: "D" or "W" plus a zero-padded
/// ten digit counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventId(String);

impl EventId {
    pub fn deposit(counter: u64) -> Self {
        EventId(format!("D{counter:010}"))
    }

    pub fn withdrawal(counter: u64) -> Self {
        EventId(format!("W{counter:010}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the matcher does when the awaited transfer appears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssuerAction {
    Issue,
    Reserve,
}

impl fmt::Display for IssuerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssuerAction::Issue => write!(f, "issue"),
            IssuerAction::Reserve => write!(f, "reserve"),
        }
    }
}

/// A foreign-chain transfer order handed to the signed broadcast primitive.
/// The private key never reaches logs or the audit trail.
#[derive(Clone, Serialize, Deserialize)]
pub struct Order {
    pub public: String,
    pub private: String,
    pub to: String,
    pub quantity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

impl fmt::Debug for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Order")
            .field("public", &self.public)
            .field("private", &"<redacted>")
            .field("to", &self.to)
            .field("quantity", &self.quantity)
            .field("memo", &self.memo)
            .finish()
    }
}

/// Session-scoped audit context shared by every record of one gateway run.
/// `network` is absent on the few incidents that cannot be attributed to
/// one (e.g. a deposit request naming an unknown UIA).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditHeader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<Network>,
    pub session_unix: i64,
    pub session_date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<i64>,
}

impl AuditHeader {
    pub fn new(network: Network, session_unix: i64, session_date: String) -> Self {
        AuditHeader {
            network: Some(network),
            session_unix,
            session_date,
            event_id: None,
            nonce: None,
        }
    }

    pub fn networkless(session_unix: i64, session_date: String) -> Self {
        AuditHeader {
            network: None,
            session_unix,
            session_date,
            event_id: None,
            nonce: None,
        }
    }

    /// Archive ticker; networkless events share one gateway-wide archive.
    pub fn ticker(&self) -> &'static str {
        self.network.map(|n| n.ticker()).unwrap_or("GATEWAY")
    }
}

/// Deposit-side audit record; one row per chronicle call in the `deposits`
/// table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DepositRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req_params: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uia: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_idx: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_memo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deposit_address: Option<String>,
}

/// Withdrawal-side audit record for the `withdrawals` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WithdrawalRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uia_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub withdrawal_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_idx: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_public: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_quantity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

/// Consolidation-sweep audit record for the `ingots` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngotRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_public: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_quantity: Option<f64>,
}

/// The per-event audit envelope. Each kind carries only its own fields;
/// `System` covers chronicle-only entries with no relational row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "process", rename_all = "lowercase")]
pub enum AuditEvent {
    Deposits {
        #[serde(flatten)]
        header: AuditHeader,
        #[serde(flatten)]
        record: DepositRecord,
    },
    Withdrawals {
        #[serde(flatten)]
        header: AuditHeader,
        #[serde(flatten)]
        record: WithdrawalRecord,
    },
    Ingots {
        #[serde(flatten)]
        header: AuditHeader,
        #[serde(flatten)]
        record: IngotRecord,
    },
    System {
        #[serde(flatten)]
        header: AuditHeader,
    },
}

impl AuditEvent {
    pub fn header(&self) -> &AuditHeader {
        match self {
            AuditEvent::Deposits { header, .. }
            | AuditEvent::Withdrawals { header, .. }
            | AuditEvent::Ingots { header, .. }
            | AuditEvent::System { header } => header,
        }
    }

    pub fn header_mut(&mut self) -> &mut AuditHeader {
        match self {
            AuditEvent::Deposits { header, .. }
            | AuditEvent::Withdrawals { header, .. }
            | AuditEvent::Ingots { header, .. }
            | AuditEvent::System { header } => header,
        }
    }
}

/// True when `amount` is within ±0.01% of `reference`. Reserve actions use
/// this tolerance because foreign fees can shave dust off the broadcast
/// amount.
pub fn roughly(amount: f64, reference: f64) -> bool {
    0.9999 * reference <= amount && amount <= 1.0001 * reference
}

/// Format an amount to a fixed number of decimal places, truncating rather
/// than rounding.
pub fn precisely(number: f64, precision: usize) -> String {
    let text = format!("{number:.24}");
    match text.find('.') {
        Some(dot) => {
            let mut out = text;
            out.push_str(&"0".repeat(precision));
            out.truncate(dot + precision + 1);
            out
        }
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_roundtrip() {
        for network in Network::ALL {
            let parsed: Network = network.as_str().parse().unwrap();
            assert_eq!(parsed, network);
        }
        assert!("doge".parse::<Network>().is_err());
    }

    #[test]
    fn test_network_memo_based() {
        assert!(Network::Xrp.memo_based());
        assert!(Network::Eos.memo_based());
        assert!(Network::Xyz.memo_based());
        assert!(!Network::Btc.memo_based());
        assert!(!Network::Ltc.memo_based());
    }

    #[test]
    fn test_event_id_format() {
        assert_eq!(EventId::deposit(1).as_str(), "D0000000001");
        assert_eq!(EventId::withdrawal(42).as_str(), "W0000000042");
        assert_eq!(EventId::deposit(9_999_999_999).as_str(), "D9999999999");
    }

    #[test]
    fn test_parachain_fragment_serializes_with_string_keys() {
        let mut fragment = ParachainFragment::new();
        fragment.insert(
            123,
            vec![Transfer {
                to: "rTo".into(),
                from: "rFrom".into(),
                memo: "1234567890".into(),
                hash: "abc".into(),
                asset: "XRP".into(),
                amount: 50.0,
            }],
        );
        let json = serde_json::to_string(&fragment).unwrap();
        assert!(json.starts_with(r#"{"123":"#));
        let back: ParachainFragment = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fragment);
    }

    #[test]
    fn test_roughly_tolerance() {
        assert!(roughly(10.0, 10.0));
        assert!(roughly(9.9999, 10.0));
        assert!(roughly(10.0009, 10.0));
        assert!(!roughly(9.99, 10.0));
        assert!(!roughly(10.01, 10.0));
    }

    #[test]
    fn test_precisely_truncates() {
        assert_eq!(precisely(0.123456789, 8), "0.12345678");
        assert_eq!(precisely(1.5, 3), "1.500");
        assert_eq!(precisely(42.0, 2), "42.00");
    }

    #[test]
    fn test_order_debug_redacts_private() {
        let order = Order {
            public: "rPub".into(),
            private: "sSecret".into(),
            to: "rDest".into(),
            quantity: 5.0,
            memo: None,
        };
        let rendered = format!("{order:?}");
        assert!(!rendered.contains("sSecret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_audit_event_tags_process() {
        let header = AuditHeader::new(Network::Btc, 1_700_000_000, "date".into());
        let event = AuditEvent::Deposits {
            header,
            record: DepositRecord {
                client_id: Some("1.2.100".into()),
                ..Default::default()
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["process"], "deposits");
        assert_eq!(json["client_id"], "1.2.100");
        assert_eq!(json["network"], "btc");
    }
}
