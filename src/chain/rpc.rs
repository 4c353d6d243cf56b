//! Dogecoin Core JSON-RPC client.

use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, error};

use crate::chain::{Blockchain, ChainError, HeaderInfo, MempoolEntry};

pub struct CoreRpcClient {
    http: Client,
    url: String,
    user: String,
    pass: String,
}

impl CoreRpcClient {
    pub fn new(host: &str, port: u16, user: &str, pass: &str) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            http,
            url: format!("http://{host}:{port}/"),
            user: user.to_string(),
            pass: pass.to_string(),
        }
    }

    fn retry_policy() -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(10))
            .with_max_times(5)
            .with_jitter()
    }

    async fn call_once(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": "dogeindex",
            "method": method,
            "params": params,
        });
        let response = self
            .http
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.pass))
            .json(&body)
            .send()
            .await
            .map_err(|err| ChainError::Transport(err.to_string()))?;
        let payload: Value = response
            .json()
            .await
            .map_err(|err| ChainError::Transport(err.to_string()))?;

        if let Some(error) = payload.get("error").filter(|e| !e.is_null()) {
            return Err(ChainError::Rpc {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
            });
        }
        payload
            .get("result")
            .cloned()
            .ok_or_else(|| ChainError::BadResponse(format!("{method}: missing result")))
    }

    /// Issue a call, retrying transport failures with exponential backoff.
    /// RPC-level errors (unknown tx, bad params) are returned immediately.
    async fn call(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let params = &params;
        (move || async move { self.call_once(method, params.clone()).await })
            .retry(&Self::retry_policy())
            .when(|err: &ChainError| err.is_transient())
            .await
            .map_err(|err| {
                if err.is_transient() {
                    error!(%method, %err, "rpc call failed after retries");
                } else {
                    debug!(%method, %err, "rpc call rejected");
                }
                err
            })
    }

    fn expect_str(method: &str, value: Value) -> Result<String, ChainError> {
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ChainError::BadResponse(format!("{method}: expected string")))
    }

    fn expect_hex(method: &str, value: Value) -> Result<Vec<u8>, ChainError> {
        let hex_str = Self::expect_str(method, value)?;
        hex::decode(&hex_str)
            .map_err(|_| ChainError::BadResponse(format!("{method}: invalid hex")))
    }
}

#[async_trait]
impl Blockchain for CoreRpcClient {
    async fn best_block_hash(&self) -> Result<String, ChainError> {
        let result = self.call("getbestblockhash", json!([])).await?;
        Self::expect_str("getbestblockhash", result)
    }

    async fn block_hash(&self, height: i64) -> Result<String, ChainError> {
        let result = self.call("getblockhash", json!([height])).await?;
        Self::expect_str("getblockhash", result)
    }

    async fn block_header(&self, hash: &str) -> Result<HeaderInfo, ChainError> {
        let result = self.call("getblockheader", json!([hash, true])).await?;
        let object = result
            .as_object()
            .ok_or_else(|| ChainError::BadResponse("getblockheader: expected object".into()))?;
        Ok(HeaderInfo {
            hash: object
                .get("hash")
                .and_then(Value::as_str)
                .unwrap_or(hash)
                .to_string(),
            height: object
                .get("height")
                .and_then(Value::as_i64)
                .ok_or_else(|| ChainError::BadResponse("getblockheader: missing height".into()))?,
            time: object.get("time").and_then(Value::as_i64).unwrap_or(0),
            prev_hash: object
                .get("previousblockhash")
                .and_then(Value::as_str)
                .map(str::to_string),
            next_hash: object
                .get("nextblockhash")
                .and_then(Value::as_str)
                .map(str::to_string),
            confirmations: object
                .get("confirmations")
                .and_then(Value::as_i64)
                .unwrap_or(-1),
        })
    }

    async fn block(&self, hash: &str) -> Result<Vec<u8>, ChainError> {
        // Verbosity 0 returns the serialized block as hex.
        let result = self.call("getblock", json!([hash, 0])).await?;
        Self::expect_hex("getblock", result)
    }

    async fn raw_transaction(&self, txid: &str) -> Result<Vec<u8>, ChainError> {
        let result = self.call("getrawtransaction", json!([txid, false])).await?;
        Self::expect_hex("getrawtransaction", result)
    }

    async fn mempool_txids(&self) -> Result<Vec<String>, ChainError> {
        let result = self.call("getrawmempool", json!([])).await?;
        let txids = result
            .as_array()
            .ok_or_else(|| ChainError::BadResponse("getrawmempool: expected array".into()))?;
        Ok(txids
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect())
    }

    async fn mempool_entry(&self, txid: &str) -> Result<MempoolEntry, ChainError> {
        let result = self.call("getmempoolentry", json!([txid])).await?;
        let time = result
            .get("time")
            .and_then(Value::as_i64)
            .ok_or_else(|| ChainError::BadResponse("getmempoolentry: missing time".into()))?;
        Ok(MempoolEntry { time })
    }
}
