use std::sync::Arc;
use std::time::Duration;

use retry::{delay::Fixed, retry_with_index, OperationResult};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::evm::state::{ProviderError, StateProvider};
use crate::evm::types::{address_to_hex, parse_word, word_to_hex, EVMAddress, EVMU256};

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("empty result for {0}")]
    MissingResult(String),
}

pub fn block_tag(block: Option<u64>) -> String {
    match block {
        None => "latest".to_string(),
        Some(number) => format!("0x{:x}", number),
    }
}

fn parse_quantity(value: &Value) -> Result<u64, RpcError> {
    let raw = value
        .as_str()
        .ok_or_else(|| RpcError::Malformed("quantity is not a string".into()))?;
    u64::from_str_radix(raw.trim_start_matches("0x"), 16)
        .map_err(|e| RpcError::Malformed(format!("bad quantity {raw}: {e}")))
}

/// Blocking JSON-RPC client shared by every onchain consumer. Transient
/// transport failures retry on a fixed delay before giving up.
#[derive(Debug)]
pub struct RpcClient {
    pub endpoint_url: String,
    pub chain_id: u64,
    client: reqwest::blocking::Client,
}

impl RpcClient {
    pub fn new(endpoint_url: impl Into<String>, chain_id: u64) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            chain_id,
            client: reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(20))
                .build()
                .expect("build client failed"),
        }
    }

    pub fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1,
        });

        let text = retry_with_index(Fixed::from_millis(100), |current_try| {
            if current_try > 3 {
                return OperationResult::Err("did not succeed within 3 tries".to_string());
            }
            match self
                .client
                .post(&self.endpoint_url)
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
            {
                Ok(resp) => match resp.text() {
                    Ok(t) => OperationResult::Ok(t),
                    Err(e) => OperationResult::Retry(format!("failed to read response: {e}")),
                },
                Err(e) => OperationResult::Retry(format!("failed to send request: {e}")),
            }
        })
        .map_err(|e| RpcError::Transport(e.to_string()))?;

        let parsed: Value = serde_json::from_str(&text)
            .map_err(|e| RpcError::Malformed(format!("{e}: {text}")))?;
        if let Some(error) = parsed.get("error") {
            return Err(RpcError::Rpc {
                code: error.get("code").and_then(|c| c.as_i64()).unwrap_or(0),
                message: error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown")
                    .to_string(),
            });
        }
        parsed
            .get("result")
            .cloned()
            .filter(|r| !r.is_null())
            .ok_or_else(|| RpcError::MissingResult(method.to_string()))
    }

    pub fn block_number(&self) -> Result<u64, RpcError> {
        parse_quantity(&self.request("eth_blockNumber", json!([]))?)
    }

    pub fn get_block_by_number(&self, number: u64, full_txs: bool) -> Result<Value, RpcError> {
        self.request(
            "eth_getBlockByNumber",
            json!([block_tag(Some(number)), full_txs]),
        )
    }

    pub fn get_block_by_hash(&self, hash: &str, full_txs: bool) -> Result<Value, RpcError> {
        self.request("eth_getBlockByHash", json!([hash, full_txs]))
    }

    pub fn get_transaction_by_block_hash_and_index(
        &self,
        block_hash: &str,
        index: u64,
    ) -> Result<Value, RpcError> {
        self.request(
            "eth_getTransactionByBlockHashAndIndex",
            json!([block_hash, format!("0x{:x}", index)]),
        )
    }

    pub fn get_transaction_receipt(&self, tx_hash: &str) -> Result<Value, RpcError> {
        self.request("eth_getTransactionReceipt", json!([tx_hash]))
    }

    pub fn get_balance(&self, address: EVMAddress, block: Option<u64>) -> Result<EVMU256, RpcError> {
        let result = self.request(
            "eth_getBalance",
            json!([address_to_hex(address), block_tag(block)]),
        )?;
        result
            .as_str()
            .and_then(parse_word)
            .ok_or_else(|| RpcError::Malformed("bad balance".into()))
    }

    pub fn get_code(&self, address: EVMAddress, block: Option<u64>) -> Result<Vec<u8>, RpcError> {
        let result = self.request(
            "eth_getCode",
            json!([address_to_hex(address), block_tag(block)]),
        )?;
        let raw = result
            .as_str()
            .ok_or_else(|| RpcError::Malformed("bad code".into()))?;
        hex::decode(raw.trim_start_matches("0x"))
            .map_err(|e| RpcError::Malformed(format!("bad code hex: {e}")))
    }

    pub fn get_storage_at(
        &self,
        address: EVMAddress,
        slot: EVMU256,
        block: Option<u64>,
    ) -> Result<EVMU256, RpcError> {
        let result = self.request(
            "eth_getStorageAt",
            json!([address_to_hex(address), word_to_hex(slot), block_tag(block)]),
        )?;
        result
            .as_str()
            .and_then(parse_word)
            .ok_or_else(|| RpcError::Malformed("bad storage word".into()))
    }

    pub fn eth_call(
        &self,
        to: EVMAddress,
        data: &[u8],
        block: Option<u64>,
    ) -> Result<Vec<u8>, RpcError> {
        let result = self.request(
            "eth_call",
            json!([
                {"to": address_to_hex(to), "data": format!("0x{}", hex::encode(data))},
                block_tag(block)
            ]),
        )?;
        let raw = result
            .as_str()
            .ok_or_else(|| RpcError::Malformed("bad call result".into()))?;
        hex::decode(raw.trim_start_matches("0x"))
            .map_err(|e| RpcError::Malformed(format!("bad call hex: {e}")))
    }

    pub fn get_transaction_count(&self, address: EVMAddress) -> Result<u64, RpcError> {
        parse_quantity(&self.request(
            "eth_getTransactionCount",
            json!([address_to_hex(address), "pending"]),
        )?)
    }

    pub fn gas_price(&self) -> Result<EVMU256, RpcError> {
        self.request("eth_gasPrice", json!([]))?
            .as_str()
            .and_then(parse_word)
            .ok_or_else(|| RpcError::Malformed("bad gas price".into()))
    }

    pub fn send_raw_transaction(&self, raw: &[u8]) -> Result<String, RpcError> {
        let result = self.request(
            "eth_sendRawTransaction",
            json!([format!("0x{}", hex::encode(raw))]),
        )?;
        result
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| RpcError::Malformed("bad tx hash".into()))
    }

    pub fn get_logs(&self, filter: Value) -> Result<Vec<Value>, RpcError> {
        let result = self.request("eth_getLogs", json!([filter]))?;
        result
            .as_array()
            .cloned()
            .ok_or_else(|| RpcError::Malformed("logs not an array".into()))
    }
}

/// Lazy-hydration provider backing the local state adapter: every field
/// read resolves at a pinned block.
pub struct RpcStateProvider {
    client: Arc<RpcClient>,
    block: Option<u64>,
}

impl RpcStateProvider {
    pub fn new(client: Arc<RpcClient>, block: Option<u64>) -> Self {
        Self { client, block }
    }
}

impl StateProvider for RpcStateProvider {
    fn basic(&self, address: EVMAddress) -> Result<(EVMU256, u64), ProviderError> {
        let balance = self
            .client
            .get_balance(address, self.block)
            .map_err(|e| ProviderError::Rpc(e.to_string()))?;
        // nonce is irrelevant for replayed frames; zero keeps it cheap
        debug!(address = %address_to_hex(address), "hydrated balance");
        Ok((balance, 0))
    }

    fn code(&self, address: EVMAddress) -> Result<Vec<u8>, ProviderError> {
        self.client
            .get_code(address, self.block)
            .map_err(|e| ProviderError::Rpc(e.to_string()))
    }

    fn storage(&self, address: EVMAddress, slot: EVMU256) -> Result<EVMU256, ProviderError> {
        self.client.get_storage_at(address, slot, self.block).map_err(|e| {
            warn!(address = %address_to_hex(address), "storage hydration failed");
            ProviderError::Rpc(e.to_string())
        })
    }
}
