//! Read-only host-ledger node client.
//!
//! Graphene-style nodes answer `{"method": "call", "params": [api, method,
//! args]}` over HTTP. Consensus reading spans several of these clients,
//! each bound to a different public node.

use std::time::Duration;

use chrono::NaiveDateTime;
use eyre::Result;
use serde_json::{json, Value};

use crate::error::RpcError;

/// Dynamic global properties the ingestor cares about.
#[derive(Debug, Clone)]
pub struct DynamicGlobals {
    pub last_irreversible_block_num: u64,
    /// Head block wall-clock, unix seconds.
    pub time: i64,
}

pub struct HostNodeClient {
    http: reqwest::Client,
    url: String,
}

impl HostNodeClient {
    pub fn new(url: &str, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(HostNodeClient {
            http,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn database_call(&self, method: &str, args: Value) -> Result<Value, RpcError> {
        let response = self
            .http
            .post(&self.url)
            .json(&json!({
                "method": "call",
                "params": ["database", method, args],
                "jsonrpc": "2.0",
                "id": 1,
            }))
            .send()
            .await?;
        let body: Value = response.json().await?;
        if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
            return Err(RpcError::Schema(format!("{method}: {error}")));
        }
        body.get("result")
            .cloned()
            .ok_or_else(|| RpcError::Schema(format!("{method}: no result")))
    }

    pub async fn dynamic_globals(&self) -> Result<DynamicGlobals, RpcError> {
        let props = self
            .database_call("get_dynamic_global_properties", json!([]))
            .await?;
        let last_irreversible_block_num = props["last_irreversible_block_num"]
            .as_u64()
            .ok_or_else(|| RpcError::Schema("missing irreversible block".into()))?;
        let time = props["time"]
            .as_str()
            .and_then(parse_iso_time)
            .ok_or_else(|| RpcError::Schema("missing block time".into()))?;
        Ok(DynamicGlobals {
            last_irreversible_block_num,
            time,
        })
    }

    /// Transactions of one block, exactly as the node reports them.
    pub async fn block_transactions(&self, block_num: u64) -> Result<Vec<Value>, RpcError> {
        let block = self.database_call("get_block", json!([block_num])).await?;
        block["transactions"]
            .as_array()
            .cloned()
            .ok_or_else(|| RpcError::Schema("block lacks transactions".into()))
    }

    /// Look up arbitrary ledger objects ("1.3.x", "2.3.x", ...).
    pub async fn get_objects(&self, object_ids: &[&str]) -> Result<Value, RpcError> {
        self.database_call("get_objects", json!([object_ids])).await
    }
}

/// Host-ledger ISO8601 timestamps carry no zone and mean UTC.
fn parse_iso_time(raw: &str) -> Option<i64> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|dt| dt.and_utc().timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_iso_time() {
        let unix = parse_iso_time("2024-01-01T00:00:00").unwrap();
        assert_eq!(unix, 1_704_067_200);
        assert!(parse_iso_time("not a date").is_none());
    }
}
