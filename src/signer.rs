//! Signed operation primitives.
//!
//! Issue, reserve, the EOS/XRP broadcasts, and memo decryption all require
//! key material and serialization formats that live behind an authenticated
//! signer endpoint. This module is the seam: a thin typed client on one
//! side, opaque signed RPC on the other. BTC/LTC broadcasts go through the
//! node wallet instead and the synthetic chain needs no signing at all, so
//! neither passes through here.

use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use serde_json::{json, Value};

use crate::config::{GatewayAsset, SignerConfig};
use crate::types::{Network, Order};

/// Host-ledger operations the gateway triggers. Trait-shaped so tests can
/// record calls instead of broadcasting.
#[async_trait]
pub trait HostLedger: Send + Sync {
    /// Issue `amount` of the network's UIA to a client account. Returns the
    /// host-ledger transaction id.
    async fn issue(&self, asset: &GatewayAsset, amount: f64, to_client: &str) -> Result<String>;

    /// Burn `amount` of previously issued UIA held by the issuer.
    async fn reserve(&self, asset: &GatewayAsset, amount: f64) -> Result<String>;
}

pub struct SignerClient {
    http: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl SignerClient {
    pub fn new(config: &SignerConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .wrap_err("Failed to build signer HTTP client")?;
        Ok(SignerClient {
            http,
            url: config.url.clone(),
            token: config.token.clone(),
        })
    }

    /// One signed call. Deliberately not retried: replaying a broadcast
    /// could double-spend; the caller decides what a failure means.
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let mut request = self
            .http
            .post(&self.url)
            .json(&json!({ "method": method, "params": params }));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response: Value = request
            .send()
            .await
            .wrap_err_with(|| format!("signer call {method} failed"))?
            .json()
            .await
            .wrap_err_with(|| format!("signer call {method} returned a non-JSON body"))?;
        if let Some(error) = response.get("error").filter(|e| !e.is_null()) {
            return Err(eyre!("signer rejected {method}: {error}"));
        }
        response
            .get("result")
            .cloned()
            .ok_or_else(|| eyre!("signer call {method} returned no result"))
    }

    fn expect_string(value: Value, method: &str) -> Result<String> {
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| eyre!("signer call {method} returned a non-string result"))
    }

    /// Broadcast a foreign-chain transfer for networks whose signing lives
    /// behind the seam (EOS, XRP).
    pub async fn broadcast_transfer(&self, network: Network, order: &Order) -> Result<String> {
        let result = self
            .call(
                "foreign_transfer",
                json!({
                    "network": network,
                    "public": order.public,
                    "private": order.private,
                    "to": order.to,
                    "quantity": order.quantity,
                    "memo": order.memo,
                }),
            )
            .await?;
        Self::expect_string(result, "foreign_transfer")
    }

    /// Decrypt a withdrawal memo into the plaintext foreign address it
    /// names. The synthetic chain bypasses decryption entirely.
    pub async fn decode_memo(&self, network: Network, memo: &Value) -> Result<String> {
        if network == Network::Xyz {
            return memo
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| eyre!("synthetic memo is not plaintext"));
        }
        let result = self
            .call("memo_decode", json!({ "network": network, "memo": memo }))
            .await?;
        Self::expect_string(result, "memo_decode")
    }
}

#[async_trait]
impl HostLedger for SignerClient {
    async fn issue(&self, asset: &GatewayAsset, amount: f64, to_client: &str) -> Result<String> {
        let result = self
            .call(
                "issue",
                json!({
                    "asset_id": asset.asset_id,
                    "asset_name": asset.asset_name,
                    "asset_precision": asset.asset_precision,
                    "issuer_id": asset.issuer_id,
                    "amount": amount,
                    "to": to_client,
                }),
            )
            .await?;
        Self::expect_string(result, "issue")
    }

    async fn reserve(&self, asset: &GatewayAsset, amount: f64) -> Result<String> {
        let result = self
            .call(
                "reserve",
                json!({
                    "asset_id": asset.asset_id,
                    "asset_name": asset.asset_name,
                    "asset_precision": asset.asset_precision,
                    "issuer_id": asset.issuer_id,
                    "amount": amount,
                }),
            )
            .await?;
        Self::expect_string(result, "reserve")
    }
}
