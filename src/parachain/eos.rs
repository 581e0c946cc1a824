//! EOSIO adapter.
//!
//! Confirmation policy: last irreversible block. Normalization accepts only
//! `eosio.token::transfer` actions in the gateway's asset whose memo fits
//! the ten-character nonce space.

use std::sync::Arc;

use async_trait::async_trait;
use eyre::Result;
use serde_json::{json, Value};

use crate::config::NetworkConfig;
use crate::error::RpcError;
use crate::signer::SignerClient;
use crate::types::{Network, Order, Transfer};

use super::{retry_transport, ForeignChain};

/// Below this an EOS action is noise, regardless of the gateway's own nil
/// threshold.
const MIN_ACTION_AMOUNT: f64 = 0.01;

/// Longest memo the normalizer lets through.
const MAX_MEMO_LEN: usize = 10;

pub struct EosChain {
    http: reqwest::Client,
    urls: Vec<String>,
    signer: Arc<SignerClient>,
}

impl EosChain {
    pub fn new(config: &NetworkConfig, signer: Arc<SignerClient>) -> Result<Self> {
        if config.rpc_urls.is_empty() {
            return Err(eyre::eyre!("eos needs at least one node URL"));
        }
        let http = reqwest::Client::builder()
            .timeout(config.timing.request())
            .build()?;
        Ok(EosChain {
            http,
            urls: config.rpc_urls.clone(),
            signer,
        })
    }

    fn url(&self, attempt: u32, path: &str) -> String {
        let base = &self.urls[attempt as usize % self.urls.len()];
        format!("{base}/v1/chain/{path}")
    }

    async fn post(&self, attempt: u32, path: &str, body: Value) -> Result<Value, RpcError> {
        let response = self
            .http
            .post(self.url(attempt, path))
            .json(&body)
            .send()
            .await?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl ForeignChain for EosChain {
    fn network(&self) -> Network {
        Network::Eos
    }

    async fn head(&self) -> Result<u64, RpcError> {
        retry_transport("eos get_info", |attempt| async move {
            let info = self.post(attempt, "get_info", json!({})).await?;
            info["last_irreversible_block_num"]
                .as_u64()
                .ok_or_else(|| RpcError::Schema("get_info lacks irreversible block".into()))
        })
        .await
    }

    async fn block_transfers(&self, block_num: u64) -> Result<Vec<Transfer>, RpcError> {
        let block = retry_transport("eos get_block", |attempt| async move {
            self.post(
                attempt,
                "get_block",
                json!({ "block_num_or_id": block_num.to_string() }),
            )
            .await
        })
        .await?;
        Ok(normalize_block(&block, self.network().ticker()))
    }

    async fn verify_account(&self, account: &str) -> Result<bool, RpcError> {
        let ret = retry_transport("eos get_account", |attempt| async move {
            self.post(attempt, "get_account", json!({ "account_name": account }))
                .await
        })
        .await?;
        Ok(ret.get("created").is_some())
    }

    async fn balance(&self, address: &str) -> Result<f64, RpcError> {
        let ret = retry_transport("eos get_currency_balance", |attempt| async move {
            self.post(
                attempt,
                "get_currency_balance",
                json!({
                    "code": "eosio.token",
                    "account": address,
                    "symbol": self.network().ticker(),
                }),
            )
            .await
        })
        .await?;
        // ["12.3456 EOS"] or [] for an account that never held the token
        let Some(first) = ret.as_array().and_then(|list| list.first()) else {
            return Ok(0.0);
        };
        first
            .as_str()
            .and_then(|text| text.split(' ').next())
            .and_then(|amount| amount.parse().ok())
            .ok_or_else(|| RpcError::Schema("unparseable currency balance".into()))
    }

    async fn transfer(&self, order: &Order) -> Result<String> {
        self.signer.broadcast_transfer(Network::Eos, order).await
    }
}

/// Flatten one raw block into gateway-relevant transfers. Anything that
/// fails a filter is silently dropped.
fn normalize_block(block: &Value, ticker: &str) -> Vec<Transfer> {
    let mut transfers = Vec::new();
    let transactions = block["transactions"].as_array().cloned().unwrap_or_default();
    for receipt in &transactions {
        let trx = &receipt["trx"];
        // deferred transactions appear as bare id strings; nothing to scan
        let Some(actions) = trx["transaction"]["actions"].as_array() else {
            continue;
        };
        let Some(hash) = trx["id"].as_str() else {
            continue;
        };
        for action in actions {
            if action["account"].as_str() != Some("eosio.token")
                || action["name"].as_str() != Some("transfer")
            {
                continue;
            }
            let data = &action["data"];
            let Some(quantity) = data["quantity"].as_str() else {
                continue;
            };
            let mut parts = quantity.split(' ');
            let Some(amount) = parts.next().and_then(|q| q.parse::<f64>().ok()) else {
                continue;
            };
            let Some(symbol) = parts.next() else {
                continue;
            };
            let memo = data["memo"]
                .as_str()
                .unwrap_or_default()
                .replace(' ', "");
            if symbol.to_uppercase() != ticker
                || amount <= MIN_ACTION_AMOUNT
                || memo.len() > MAX_MEMO_LEN
            {
                continue;
            }
            let (Some(to), Some(from)) = (data["to"].as_str(), data["from"].as_str()) else {
                continue;
            };
            transfers.push(Transfer {
                to: to.to_string(),
                from: from.to_string(),
                memo,
                hash: hash.to_string(),
                asset: ticker.to_string(),
                amount,
            });
        }
    }
    transfers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(account: &str, name: &str, quantity: &str, memo: &str) -> Value {
        json!({
            "account": account,
            "name": name,
            "data": {
                "from": "alice",
                "to": "gatewayacct",
                "quantity": quantity,
                "memo": memo,
            }
        })
    }

    fn block_with_actions(actions: Vec<Value>) -> Value {
        json!({
            "transactions": [
                {
                    "trx": {
                        "id": "deadbeef",
                        "transaction": { "actions": actions }
                    }
                }
            ]
        })
    }

    #[test]
    fn test_normalize_accepts_token_transfer() {
        let block = block_with_actions(vec![action(
            "eosio.token",
            "transfer",
            "5.0000 EOS",
            "abc123defg",
        )]);
        let transfers = normalize_block(&block, "EOS");
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].to, "gatewayacct");
        assert_eq!(transfers[0].from, "alice");
        assert_eq!(transfers[0].amount, 5.0);
        assert_eq!(transfers[0].hash, "deadbeef");
    }

    #[test]
    fn test_normalize_rejects_wrong_contract() {
        let block = block_with_actions(vec![action(
            "fake.token",
            "transfer",
            "5.0000 EOS",
            "abc",
        )]);
        assert!(normalize_block(&block, "EOS").is_empty());
    }

    #[test]
    fn test_normalize_rejects_wrong_symbol_and_dust() {
        let block = block_with_actions(vec![
            action("eosio.token", "transfer", "5.0000 PEOS", "abc"),
            action("eosio.token", "transfer", "0.0050 EOS", "abc"),
        ]);
        assert!(normalize_block(&block, "EOS").is_empty());
    }

    #[test]
    fn test_normalize_rejects_long_memo_and_strips_spaces() {
        let long = block_with_actions(vec![action(
            "eosio.token",
            "transfer",
            "5.0000 EOS",
            "elevenchars",
        )]);
        assert!(normalize_block(&long, "EOS").is_empty());

        let spaced = block_with_actions(vec![action(
            "eosio.token",
            "transfer",
            "5.0000 EOS",
            "a b c 1 2 3",
        )]);
        let transfers = normalize_block(&spaced, "EOS");
        assert_eq!(transfers[0].memo, "abc123");
    }

    #[test]
    fn test_normalize_skips_deferred_transactions() {
        let block = json!({ "transactions": [ { "trx": "a1b2c3-bare-id" } ] });
        assert!(normalize_block(&block, "EOS").is_empty());
    }
}
