use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use crate::evm::abi::keccak_bytes;
use crate::evm::types::{address_to_hex, parse_word, word_to_hex, EVMAddress, EVMU256};
use crate::invariants::types::ContractState;
use crate::onchain::endpoints::{block_tag, RpcClient, RpcError};

const RANGE_PAGE: u64 = 1024;
/// Slots probed when the range RPC is unavailable; covers the common
/// proxy/token/pair layouts.
const PROBE_SLOTS: [u64; 10] = [0, 1, 2, 6, 7, 8, 9, 10, 11, 12];
const BALANCE_BASE_SLOTS: std::ops::RangeInclusive<u64> = 0..=5;

/// `keccak(left_pad(holder, 32) || left_pad(base_slot, 32))`: the storage
/// slot of `mapping(address => uint256)[holder]` rooted at `base_slot`.
pub fn balance_slot(holder: EVMAddress, base_slot: u64) -> EVMU256 {
    let mut preimage = [0u8; 64];
    preimage[12..32].copy_from_slice(holder.as_bytes());
    preimage[32..64].copy_from_slice(&EVMU256::from(base_slot).to_be_bytes::<32>());
    let mut hash = [0u8; 32];
    keccak_bytes(&preimage, &mut hash);
    EVMU256::try_from_be_slice(&hash).unwrap_or(EVMU256::ZERO)
}

/// Bulk storage snapshots with a targeted-slot fallback for nodes that do
/// not serve `debug_storageRangeAt`.
pub struct StorageFetcher {
    client: Arc<RpcClient>,
    range_unsupported: std::sync::atomic::AtomicBool,
}

impl StorageFetcher {
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self {
            client,
            range_unsupported: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Full storage of `address` at `block_hash`, paginated by `nextKey`
    /// until exhausted.
    pub fn fetch_range(
        &self,
        block_hash: &str,
        address: EVMAddress,
    ) -> Result<HashMap<EVMU256, EVMU256>, RpcError> {
        let mut out = HashMap::new();
        let mut start_key = String::new();
        loop {
            let result = self.client.request(
                "debug_storageRangeAt",
                json!([block_hash, 0, address_to_hex(address), start_key, RANGE_PAGE]),
            )?;
            let Some(storage) = result.get("storage").and_then(|s| s.as_object()) else {
                break;
            };
            for (_, entry) in storage {
                let (Some(key), Some(value)) = (
                    entry.get("key").and_then(|k| k.as_str()).and_then(parse_word),
                    entry.get("value").and_then(|v| v.as_str()).and_then(parse_word),
                ) else {
                    continue;
                };
                out.insert(key, value);
            }
            match result.get("nextKey").and_then(|k| k.as_str()) {
                Some(next) if !next.is_empty() => start_key = next.to_string(),
                _ => break,
            }
        }
        Ok(out)
    }

    /// Targeted probes: the known-slot set plus ERC-20 balance slots for a
    /// handful of holders.
    pub fn fetch_targeted(
        &self,
        address: EVMAddress,
        block: Option<u64>,
        holders: &[EVMAddress],
    ) -> HashMap<EVMU256, EVMU256> {
        let mut slots: Vec<EVMU256> = PROBE_SLOTS.iter().map(|s| EVMU256::from(*s)).collect();
        for holder in holders {
            for base in BALANCE_BASE_SLOTS {
                slots.push(balance_slot(*holder, base));
            }
        }

        let mut out = HashMap::new();
        for slot in slots {
            match self.client.get_storage_at(address, slot, block) {
                Ok(value) if value != EVMU256::ZERO => {
                    out.insert(slot, value);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(slot = %word_to_hex(slot), error = %e, "storage probe failed");
                }
            }
        }
        out
    }

    /// Full contract snapshot at a block. Balance and code always come from
    /// `eth_getBalance` / `eth_getCode`; storage prefers the range RPC and
    /// falls back to targeted probes once the node proves unsupportive.
    pub fn fetch_contract_state(
        &self,
        address: EVMAddress,
        block: Option<u64>,
        block_hash: Option<&str>,
        holders: &[EVMAddress],
    ) -> Result<ContractState, RpcError> {
        use std::sync::atomic::Ordering;

        let balance = self.client.get_balance(address, block)?;
        let code = self.client.get_code(address, block)?;

        let storage = if self.range_unsupported.load(Ordering::Relaxed) {
            self.fetch_targeted(address, block, holders)
        } else if let Some(block_hash) = block_hash {
            match self.fetch_range(block_hash, address) {
                Ok(storage) => storage,
                Err(e) => {
                    // unsupported once is unsupported forever on this node
                    warn!(error = %e, "debug_storageRangeAt unavailable, degrading to probes");
                    self.range_unsupported.store(true, Ordering::Relaxed);
                    self.fetch_targeted(address, block, holders)
                }
            }
        } else {
            self.fetch_targeted(address, block, holders)
        };

        debug!(
            address = %address_to_hex(address),
            block = %block_tag(block),
            slots = storage.len(),
            "fetched contract state"
        );
        Ok(ContractState {
            address,
            balance,
            storage,
            code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balance_slots_are_stable_and_distinct() {
        let holder = EVMAddress::from_slice(&[7; 20]);
        let a = balance_slot(holder, 0);
        let b = balance_slot(holder, 1);
        let c = balance_slot(EVMAddress::from_slice(&[8; 20]), 0);
        assert_ne!(a, EVMU256::ZERO);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, balance_slot(holder, 0));
    }

    #[test]
    fn balance_slot_matches_erc20_layout() {
        // keccak256(pad32(0xdead...) ++ pad32(0)) computed with the same
        // keccak the selectors use; guards the preimage layout
        let holder = EVMAddress::from_slice(&hex::decode("00000000000000000000000000000000000000aa").unwrap());
        let slot = balance_slot(holder, 3);
        let mut preimage = [0u8; 64];
        preimage[31] = 0xaa;
        preimage[63] = 3;
        let mut expected = [0u8; 32];
        keccak_bytes(&preimage, &mut expected);
        assert_eq!(slot, EVMU256::try_from_be_slice(&expected).unwrap());
    }
}
