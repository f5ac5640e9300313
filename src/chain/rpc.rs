//! Minimal JSON-RPC client for the node
//!
//! Covers exactly the calls the agent needs: head number, log filtering,
//! `eth_call` reads, gas estimation, node-signed sends and receipt lookups.
//! Every request shares one `reqwest` client with a hard timeout, so a stuck
//! node cannot wedge the coordinator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use num_bigint::BigUint;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use super::abi::{self, Address};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("node error {code}: {message}")]
    Node { code: i64, message: String },
    #[error("malformed response: {0}")]
    Decode(String),
}

impl From<abi::AbiError> for RpcError {
    fn from(e: abi::AbiError) -> Self {
        RpcError::Decode(e.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<JsonRpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcErrorBody {
    code: i64,
    message: String,
}

/// One log entry from `eth_getLogs`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(default)]
    pub block_number: Option<String>,
    #[serde(default)]
    pub transaction_hash: Option<String>,
    #[serde(default)]
    pub removed: Option<bool>,
}

/// Mined-transaction receipt, reduced to what the submitter inspects.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub block_number: Option<String>,
}

impl TransactionReceipt {
    pub fn succeeded(&self) -> bool {
        matches!(self.status.as_deref(), Some("0x1" | "0x01"))
    }
}

pub struct RpcClient {
    http: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(url: String, timeout: Duration) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url,
            next_id: AtomicU64::new(1),
        })
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
        });

        let response: JsonRpcResponse = self
            .http
            .post(&self.url)
            .json(&payload)
            .send()
            .await?
            .json()
            .await?;

        if let Some(err) = response.error {
            return Err(RpcError::Node {
                code: err.code,
                message: err.message,
            });
        }

        response
            .result
            .ok_or_else(|| RpcError::Decode(format!("{method}: neither result nor error")))
    }

    fn result_str(method: &str, value: &Value) -> Result<String, RpcError> {
        value
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| RpcError::Decode(format!("{method}: expected a hex string")))
    }

    pub async fn block_number(&self) -> Result<u64, RpcError> {
        let result = self.request("eth_blockNumber", json!([])).await?;
        Ok(abi::decode_quantity(&Self::result_str(
            "eth_blockNumber",
            &result,
        )?)?)
    }

    /// Logs at `address` matching any of `topics` as topic0, over `[from, to]`.
    pub async fn get_logs(
        &self,
        address: &Address,
        topics: &[&str],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<LogEntry>, RpcError> {
        let filter = json!({
            "address": address.to_string(),
            "topics": [topics],
            "fromBlock": format!("0x{from_block:x}"),
            "toBlock": format!("0x{to_block:x}"),
        });
        let result = self.request("eth_getLogs", json!([filter])).await?;
        serde_json::from_value(result).map_err(|e| RpcError::Decode(format!("eth_getLogs: {e}")))
    }

    /// `eth_call` against `latest`, returning the raw return data.
    pub async fn call(&self, to: &Address, data: &str) -> Result<Vec<u8>, RpcError> {
        let params = json!([{ "to": to.to_string(), "data": data }, "latest"]);
        let result = self.request("eth_call", params).await?;
        Ok(abi::decode_hex(&Self::result_str("eth_call", &result)?)?)
    }

    pub async fn estimate_gas(
        &self,
        from: &Address,
        to: &Address,
        data: &str,
    ) -> Result<u64, RpcError> {
        let params = json!([{
            "from": from.to_string(),
            "to": to.to_string(),
            "data": data,
        }]);
        let result = self.request("eth_estimateGas", params).await?;
        Ok(abi::decode_quantity(&Self::result_str(
            "eth_estimateGas",
            &result,
        )?)?)
    }

    /// Node-signed send from an account the node manages.
    pub async fn send_transaction(
        &self,
        from: &Address,
        to: &Address,
        data: &str,
        gas: u64,
    ) -> Result<String, RpcError> {
        let params = json!([{
            "from": from.to_string(),
            "to": to.to_string(),
            "data": data,
            "gas": format!("0x{gas:x}"),
        }]);
        let result = self.request("eth_sendTransaction", params).await?;
        Self::result_str("eth_sendTransaction", &result)
    }

    /// `None` until the transaction is mined.
    pub async fn transaction_receipt(
        &self,
        tx_hash: &str,
    ) -> Result<Option<TransactionReceipt>, RpcError> {
        let result = self
            .request("eth_getTransactionReceipt", json!([tx_hash]))
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        serde_json::from_value(result)
            .map(Some)
            .map_err(|e| RpcError::Decode(format!("eth_getTransactionReceipt: {e}")))
    }

    pub async fn balance(&self, address: &Address) -> Result<BigUint, RpcError> {
        let result = self
            .request("eth_getBalance", json!([address.to_string(), "latest"]))
            .await?;
        let hex_str = Self::result_str("eth_getBalance", &result)?;
        let bytes = abi::decode_hex(&pad_even(&hex_str))?;
        Ok(BigUint::from_bytes_be(&bytes))
    }
}

/// Quantities come back without leading zeros; `hex::decode` wants even length.
fn pad_even(s: &str) -> String {
    let stripped = s.trim_start_matches("0x");
    if stripped.len() % 2 == 0 {
        format!("0x{stripped}")
    } else {
        format!("0x0{stripped}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receipt_status() {
        let mined: TransactionReceipt =
            serde_json::from_str(r#"{"status":"0x1","blockNumber":"0x10"}"#).unwrap();
        assert!(mined.succeeded());

        let reverted: TransactionReceipt = serde_json::from_str(r#"{"status":"0x0"}"#).unwrap();
        assert!(!reverted.succeeded());

        // Pre-Byzantium receipts carry no status field
        let legacy: TransactionReceipt = serde_json::from_str(r#"{}"#).unwrap();
        assert!(!legacy.succeeded());
    }

    #[test]
    fn test_log_entry_deserializes() {
        let raw = r#"{
            "address": "0x318e735e110265044508c5dc95b38c1074d43829",
            "topics": ["0xaaaa"],
            "data": "0x",
            "blockNumber": "0x1b4",
            "transactionHash": "0xbeef"
        }"#;
        let log: LogEntry = serde_json::from_str(raw).unwrap();
        assert_eq!(log.topics.len(), 1);
        assert_eq!(log.block_number.as_deref(), Some("0x1b4"));
    }

    #[test]
    fn test_pad_even() {
        assert_eq!(pad_even("0x1a2"), "0x01a2");
        assert_eq!(pad_even("0x1a20"), "0x1a20");
    }
}
