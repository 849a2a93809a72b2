use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::evm::types::{parse_address, parse_word, EVMAddress, EVMU256};
use crate::onchain::endpoints::{RpcClient, RpcError};

/// One frame of a call-tracer tree.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct CallFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub from: String,
    pub to: Option<String>,
    pub value: Option<String>,
    pub gas: Option<String>,
    #[serde(rename = "gasUsed")]
    pub gas_used: Option<String>,
    pub input: Option<String>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub calls: Vec<CallFrame>,
}

impl CallFrame {
    pub fn selector(&self) -> Option<[u8; 4]> {
        let input = self.input.as_ref()?;
        let raw = hex::decode(input.trim_start_matches("0x")).ok()?;
        raw.get(..4).map(|s| s.try_into().unwrap())
    }

    pub fn to_address(&self) -> Option<EVMAddress> {
        parse_address(self.to.as_deref()?)
    }

    fn gas_used_quantity(&self) -> u64 {
        self.gas_used
            .as_deref()
            .and_then(|g| u64::from_str_radix(g.trim_start_matches("0x"), 16).ok())
            .unwrap_or(0)
    }
}

/// One leaf-to-root path through the call tree.
#[derive(Clone, Debug)]
pub struct CallPath {
    pub addresses: Vec<String>,
    pub depth: usize,
    pub terminal_type: String,
}

#[derive(Clone, Debug, Default)]
pub struct CallStatistics {
    pub unique_addresses: usize,
    pub function_signatures: HashMap<String, usize>,
    pub success_count: usize,
    pub fail_count: usize,
    pub total_gas: u64,
}

/// Wraps `debug_traceTransaction` with the call tracer and extracts frames,
/// signatures and storage writes.
pub struct TxTracer {
    client: Arc<RpcClient>,
}

impl TxTracer {
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self { client }
    }

    pub fn trace(&self, tx_hash: &str) -> Result<CallFrame, RpcError> {
        let result = self.client.request(
            "debug_traceTransaction",
            json!([tx_hash, {"tracer": "callTracer", "tracerConfig": {"onlyTopCall": false}}]),
        )?;
        serde_json::from_value(result).map_err(|e| RpcError::Malformed(e.to_string()))
    }

    /// All descendants (the root included) whose `to` equals `address`,
    /// case-insensitively.
    pub fn find_contract_calls<'a>(
        &self,
        frame: &'a CallFrame,
        address: EVMAddress,
    ) -> Vec<&'a CallFrame> {
        let mut out = Vec::new();
        Self::walk(frame, &mut |f| {
            if f.to_address() == Some(address) {
                out.push(f);
            }
        });
        out
    }

    fn walk<'a>(frame: &'a CallFrame, visit: &mut impl FnMut(&'a CallFrame)) {
        visit(frame);
        for call in &frame.calls {
            Self::walk(call, visit);
        }
    }

    /// Enumerate leaf-to-root address paths with depth and terminal type.
    pub fn analyze_call_path(&self, frame: &CallFrame) -> Vec<CallPath> {
        let mut paths = Vec::new();
        let mut stack = Vec::new();
        Self::paths(frame, &mut stack, &mut paths);
        paths
    }

    fn paths(frame: &CallFrame, stack: &mut Vec<String>, out: &mut Vec<CallPath>) {
        stack.push(frame.to.clone().unwrap_or_default());
        if frame.calls.is_empty() {
            let mut addresses = stack.clone();
            addresses.reverse();
            out.push(CallPath {
                depth: stack.len() - 1,
                terminal_type: frame.frame_type.clone(),
                addresses,
            });
        } else {
            for call in &frame.calls {
                Self::paths(call, stack, out);
            }
        }
        stack.pop();
    }

    /// Per-contract SSTORE writes of the transaction, via a custom JS
    /// tracer. Nodes that reject custom tracers degrade to the prestate
    /// tracer's diff mode.
    pub fn get_storage_changes(
        &self,
        tx_hash: &str,
    ) -> Result<HashMap<EVMAddress, HashMap<EVMU256, EVMU256>>, RpcError> {
        const SSTORE_TRACER: &str = "{data: [], fault: function(log) {}, \
             step: function(log) { if (log.op.toString() == 'SSTORE') \
             this.data.push({addr: toHex(log.contract.getAddress()), \
             slot: '0x' + log.stack.peek(0).toString(16), \
             value: '0x' + log.stack.peek(1).toString(16)}); }, \
             result: function() { return this.data; }}";

        match self
            .client
            .request("debug_traceTransaction", json!([tx_hash, {"tracer": SSTORE_TRACER}]))
        {
            Ok(result) => Ok(Self::parse_sstore_list(&result)),
            Err(e) => {
                warn!(error = %e, "custom tracer rejected, falling back to prestate diff");
                let result = self.client.request(
                    "debug_traceTransaction",
                    json!([tx_hash, {"tracer": "prestateTracer", "tracerConfig": {"diffMode": true}}]),
                )?;
                Ok(Self::parse_prestate_diff(&result))
            }
        }
    }

    fn parse_sstore_list(result: &Value) -> HashMap<EVMAddress, HashMap<EVMU256, EVMU256>> {
        let mut out: HashMap<EVMAddress, HashMap<EVMU256, EVMU256>> = HashMap::new();
        for entry in result.as_array().into_iter().flatten() {
            let (Some(addr), Some(slot), Some(value)) = (
                entry.get("addr").and_then(|a| a.as_str()).and_then(parse_address),
                entry.get("slot").and_then(|s| s.as_str()).and_then(parse_word),
                entry.get("value").and_then(|v| v.as_str()).and_then(parse_word),
            ) else {
                continue;
            };
            out.entry(addr).or_default().insert(slot, value);
        }
        out
    }

    fn parse_prestate_diff(result: &Value) -> HashMap<EVMAddress, HashMap<EVMU256, EVMU256>> {
        let mut out: HashMap<EVMAddress, HashMap<EVMU256, EVMU256>> = HashMap::new();
        let Some(post) = result.get("post").and_then(|p| p.as_object()) else {
            return out;
        };
        for (raw_address, account) in post {
            let Some(address) = parse_address(raw_address) else { continue };
            let Some(storage) = account.get("storage").and_then(|s| s.as_object()) else {
                continue;
            };
            for (raw_slot, raw_value) in storage {
                let (Some(slot), Some(value)) = (
                    parse_word(raw_slot),
                    raw_value.as_str().and_then(parse_word),
                ) else {
                    continue;
                };
                out.entry(address).or_default().insert(slot, value);
            }
        }
        out
    }

    /// Aggregate statistics over a call tree.
    pub fn get_call_statistics(&self, frame: &CallFrame) -> CallStatistics {
        let mut stats = CallStatistics::default();
        let mut addresses = std::collections::HashSet::new();
        Self::walk(frame, &mut |f| {
            if let Some(to) = &f.to {
                addresses.insert(to.to_lowercase());
            }
            if let Some(selector) = f.selector() {
                *stats
                    .function_signatures
                    .entry(format!("0x{}", hex::encode(selector)))
                    .or_insert(0) += 1;
            }
            if f.error.is_none() {
                stats.success_count += 1;
            } else {
                stats.fail_count += 1;
            }
            stats.total_gas += f.gas_used_quantity();
        });
        stats.unique_addresses = addresses.len();
        debug!(
            addresses = stats.unique_addresses,
            frames = stats.success_count + stats.fail_count,
            "call statistics"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> CallFrame {
        serde_json::from_value(json!({
            "type": "CALL",
            "from": "0x0101010101010101010101010101010101010101",
            "to": "0x0202020202020202020202020202020202020202",
            "gasUsed": "0x100",
            "input": "0xa9059cbb000000000000000000000000000000000000000000000000000000000000dead0000000000000000000000000000000000000000000000000000000000000005",
            "calls": [
                {
                    "type": "STATICCALL",
                    "from": "0x0202020202020202020202020202020202020202",
                    "to": "0x0303030303030303030303030303030303030303",
                    "gasUsed": "0x10",
                    "input": "0x70a08231"
                },
                {
                    "type": "CALL",
                    "from": "0x0202020202020202020202020202020202020202",
                    "to": "0x0202020202020202020202020202020202020202",
                    "gasUsed": "0x20",
                    "error": "execution reverted"
                }
            ]
        }))
        .unwrap()
    }

    fn tracer() -> TxTracer {
        TxTracer::new(Arc::new(RpcClient::new("http://localhost:8545", 1)))
    }

    #[test]
    fn finds_contract_calls_recursively() {
        let frame = fixture();
        let target = EVMAddress::from_slice(&[2; 20]);
        let calls = tracer().find_contract_calls(&frame, target);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].selector(), Some([0xa9, 0x05, 0x9c, 0xbb]));
    }

    #[test]
    fn call_paths_are_leaf_to_root() {
        let frame = fixture();
        let paths = tracer().analyze_call_path(&frame);
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[0].depth, 1);
        assert_eq!(paths[0].terminal_type, "STATICCALL");
        // leaf first, root last
        assert!(paths[0].addresses[0].ends_with("0303"));
        assert!(paths[0].addresses[1].ends_with("0202"));
    }

    #[test]
    fn statistics_count_failures_and_gas() {
        let frame = fixture();
        let stats = tracer().get_call_statistics(&frame);
        assert_eq!(stats.unique_addresses, 2);
        assert_eq!(stats.success_count, 2);
        assert_eq!(stats.fail_count, 1);
        assert_eq!(stats.total_gas, 0x130);
        assert_eq!(stats.function_signatures["0xa9059cbb"], 1);
    }

    #[test]
    fn sstore_tracer_output_parses() {
        let raw = json!([
            {"addr": "0x0101010101010101010101010101010101010101",
             "slot": "0x8", "value": "0x2a"}
        ]);
        let parsed = TxTracer::parse_sstore_list(&raw);
        let addr = EVMAddress::from_slice(&[1; 20]);
        assert_eq!(parsed[&addr][&EVMU256::from(8u64)], EVMU256::from(42u64));
    }

    #[test]
    fn prestate_diff_parses() {
        let raw = json!({
            "pre": {},
            "post": {
                "0x0101010101010101010101010101010101010101": {
                    "storage": {"0x1": "0x5"}
                }
            }
        });
        let parsed = TxTracer::parse_prestate_diff(&raw);
        let addr = EVMAddress::from_slice(&[1; 20]);
        assert_eq!(parsed[&addr][&EVMU256::from(1u64)], EVMU256::from(5u64));
    }
}
