//! Ripple adapter.
//!
//! Confirmation policy: validated ledger. Normalization keeps only
//! successful native-XRP payments carrying a ten-digit destination tag,
//! which doubles as the deposit memo.

use std::sync::Arc;

use async_trait::async_trait;
use eyre::Result;
use serde_json::{json, Value};

use crate::config::NetworkConfig;
use crate::error::RpcError;
use crate::signer::SignerClient;
use crate::types::{Network, Order, Transfer};

use super::{retry_transport, ForeignChain};

/// Drops per XRP.
const DROPS: f64 = 1_000_000.0;

/// Payments at or below this are not deposits worth watching.
const MIN_PAYMENT_XRP: f64 = 0.1;

pub struct RippleChain {
    http: reqwest::Client,
    urls: Vec<String>,
    signer: Arc<SignerClient>,
}

impl RippleChain {
    pub fn new(config: &NetworkConfig, signer: Arc<SignerClient>) -> Result<Self> {
        if config.rpc_urls.is_empty() {
            return Err(eyre::eyre!("xrp needs at least one node URL"));
        }
        let http = reqwest::Client::builder()
            .timeout(config.timing.request())
            .build()?;
        Ok(RippleChain {
            http,
            urls: config.rpc_urls.clone(),
            signer,
        })
    }

    async fn request(&self, attempt: u32, method: &str, params: Value) -> Result<Value, RpcError> {
        let url = &self.urls[attempt as usize % self.urls.len()];
        let response = self
            .http
            .post(url)
            .json(&json!({ "method": method, "params": [params] }))
            .send()
            .await?;
        let body: Value = response.json().await?;
        Ok(body["result"].clone())
    }
}

#[async_trait]
impl ForeignChain for RippleChain {
    fn network(&self) -> Network {
        Network::Xrp
    }

    async fn head(&self) -> Result<u64, RpcError> {
        retry_transport("xrp validated ledger", |attempt| async move {
            let result = self
                .request(attempt, "ledger", json!({ "ledger_index": "validated" }))
                .await?;
            ledger_index(&result["ledger"]["ledger_index"])
                .ok_or_else(|| RpcError::Schema("ledger lacks ledger_index".into()))
        })
        .await
    }

    async fn block_transfers(&self, block_num: u64) -> Result<Vec<Transfer>, RpcError> {
        let result = retry_transport("xrp ledger", |attempt| async move {
            self.request(
                attempt,
                "ledger",
                json!({
                    "ledger_index": block_num,
                    "transactions": true,
                    "expand": true,
                }),
            )
            .await
        })
        .await?;
        let transactions = result["ledger"]["transactions"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        Ok(normalize_ledger(&transactions))
    }

    async fn verify_account(&self, account: &str) -> Result<bool, RpcError> {
        let result = retry_transport("xrp account_info", |attempt| async move {
            self.request(
                attempt,
                "account_info",
                json!({
                    "account": account,
                    "strict": true,
                    "ledger_index": "current",
                    "queue": true,
                }),
            )
            .await
        })
        .await?;
        Ok(result.get("account_data").is_some())
    }

    async fn balance(&self, address: &str) -> Result<f64, RpcError> {
        let result = retry_transport("xrp account_info", |attempt| async move {
            self.request(
                attempt,
                "account_info",
                json!({
                    "account": address,
                    "strict": true,
                    "ledger_index": "validated",
                }),
            )
            .await
        })
        .await?;
        let Some(drops) = result["account_data"]["Balance"].as_str() else {
            return Ok(0.0);
        };
        drops
            .parse::<f64>()
            .map(|value| value / DROPS)
            .map_err(|_| RpcError::Schema("unparseable XRP balance".into()))
    }

    async fn transfer(&self, order: &Order) -> Result<String> {
        self.signer.broadcast_transfer(Network::Xrp, order).await
    }
}

fn ledger_index(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Keep successful native payments with a ten-digit destination tag.
/// IOU payments carry an object amount and are dropped.
fn normalize_ledger(transactions: &[Value]) -> Vec<Transfer> {
    let mut transfers = Vec::new();
    for trx in transactions {
        if trx["TransactionType"].as_str() != Some("Payment")
            || trx["metaData"]["TransactionResult"].as_str() != Some("tesSUCCESS")
        {
            continue;
        }
        // native amounts are integer drops in a string; anything else is an
        // IOU object
        let Some(drops) = trx["Amount"].as_str() else {
            continue;
        };
        let Ok(drops) = drops.parse::<f64>() else {
            continue;
        };
        let amount = drops / DROPS;
        let memo = match &trx["DestinationTag"] {
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            _ => continue,
        };
        if memo.len() != 10 || !memo.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        if amount <= MIN_PAYMENT_XRP {
            continue;
        }
        let (Some(to), Some(from), Some(hash)) = (
            trx["Destination"].as_str(),
            trx["Account"].as_str(),
            trx["hash"].as_str(),
        ) else {
            continue;
        };
        transfers.push(Transfer {
            to: to.to_string(),
            from: from.to_string(),
            memo,
            hash: hash.to_string(),
            asset: "XRP".to_string(),
            amount,
        });
    }
    transfers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payment(amount: Value, tag: Value, result: &str) -> Value {
        json!({
            "TransactionType": "Payment",
            "metaData": { "TransactionResult": result },
            "Amount": amount,
            "DestinationTag": tag,
            "Destination": "rGateway",
            "Account": "rClient",
            "hash": "ABCDEF",
        })
    }

    #[test]
    fn test_normalize_accepts_tagged_native_payment() {
        let transactions = vec![payment(
            json!("50000000"),
            json!(1234567890u64),
            "tesSUCCESS",
        )];
        let transfers = normalize_ledger(&transactions);
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].amount, 50.0);
        assert_eq!(transfers[0].memo, "1234567890");
        assert_eq!(transfers[0].to, "rGateway");
    }

    #[test]
    fn test_normalize_rejects_iou_amounts() {
        let transactions = vec![payment(
            json!({ "currency": "USD", "value": "50", "issuer": "rIssuer" }),
            json!(1234567890u64),
            "tesSUCCESS",
        )];
        assert!(normalize_ledger(&transactions).is_empty());
    }

    #[test]
    fn test_normalize_rejects_failed_payments() {
        let transactions = vec![payment(
            json!("50000000"),
            json!(1234567890u64),
            "tecUNFUNDED",
        )];
        assert!(normalize_ledger(&transactions).is_empty());
    }

    #[test]
    fn test_normalize_rejects_short_tags_and_dust() {
        let short_tag = vec![payment(json!("50000000"), json!(1234u64), "tesSUCCESS")];
        assert!(normalize_ledger(&short_tag).is_empty());

        let dust = vec![payment(
            json!("50000"),
            json!(1234567890u64),
            "tesSUCCESS",
        )];
        assert!(normalize_ledger(&dust).is_empty());
    }

    #[test]
    fn test_normalize_requires_tag_presence() {
        let mut trx = payment(json!("50000000"), json!(null), "tesSUCCESS");
        trx.as_object_mut().unwrap().remove("DestinationTag");
        assert!(normalize_ledger(&[trx]).is_empty());
    }

    #[test]
    fn test_ledger_index_handles_both_shapes() {
        assert_eq!(ledger_index(&json!(123)), Some(123));
        assert_eq!(ledger_index(&json!("456")), Some(456));
        assert_eq!(ledger_index(&json!(null)), None);
    }
}
