use std::collections::HashMap;

use serde::Serialize;

use crate::evm::types::{EVMAddress, EVMU256};

/// Snapshot of one contract at a point in time. Slots not present read as
/// zero; zero values may be retained intentionally.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContractState {
    pub address: EVMAddress,
    pub balance: EVMU256,
    pub storage: HashMap<EVMU256, EVMU256>,
    pub code: Vec<u8>,
}

impl ContractState {
    pub fn slot(&self, slot: EVMU256) -> EVMU256 {
        self.storage.get(&slot).copied().unwrap_or(EVMU256::ZERO)
    }
}

/// Pre/post state of every contract touched by one transaction. Evaluators
/// must tolerate missing entries: `state_of` hands out zero-value stubs.
#[derive(Clone, Debug, Default)]
pub struct ChainState {
    pub block_number: u64,
    pub block_hash: String,
    pub tx_hash: String,
    pub timestamp: u64,
    /// post-transaction states
    pub states: HashMap<EVMAddress, ContractState>,
    /// pre-transaction states
    pub previous_states: HashMap<EVMAddress, ContractState>,
}

impl ChainState {
    pub fn state_of(&self, address: EVMAddress) -> ContractState {
        self.states.get(&address).cloned().unwrap_or(ContractState {
            address,
            ..Default::default()
        })
    }

    pub fn previous_state_of(&self, address: EVMAddress) -> Option<&ContractState> {
        self.previous_states.get(&address)
    }
}

/// Structured violation payload; feeds alerts and the fuzz trigger.
#[derive(Clone, Debug, Serialize)]
pub struct ViolationResult {
    pub project_id: String,
    pub invariant_id: String,
    pub invariant_name: String,
    pub block_number: u64,
    pub tx_hash: String,
    pub message: String,
    pub details: HashMap<String, String>,
}
