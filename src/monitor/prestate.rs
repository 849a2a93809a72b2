use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::BaselineStateFile;
use crate::evm::state::AccountState;
use crate::evm::types::{EVMAddress, EVMU256};
use crate::invariants::types::ContractState;
use crate::onchain::endpoints::RpcError;
use crate::onchain::storage::StorageFetcher;

/// Captures the per-block baseline and keeps a rolling per-contract state
/// that advances transaction by transaction.
///
/// Three ordered inputs feed the rolling map: a baseline file (fork tests,
/// loaded once per session), the parent-block snapshot (live chains), and
/// the per-transaction diffs applied by the monitor.
pub struct PreBlockStateOrchestrator {
    baseline_path: Option<PathBuf>,
    baseline_loaded: bool,
    fork_block: Option<u64>,
    fetcher: Option<Arc<StorageFetcher>>,
    protected: Vec<EVMAddress>,
    rolling: HashMap<EVMAddress, ContractState>,
}

impl PreBlockStateOrchestrator {
    pub fn new(
        baseline_path: Option<PathBuf>,
        fetcher: Option<Arc<StorageFetcher>>,
        protected: Vec<EVMAddress>,
    ) -> Self {
        Self {
            baseline_path,
            baseline_loaded: false,
            fork_block: None,
            fetcher,
            protected,
            rolling: HashMap::new(),
        }
    }

    /// Block number recorded in the baseline file, if one is configured.
    pub fn fork_block(&self) -> Option<u64> {
        self.fork_block
    }

    /// Establish the pre-block state for `block`.
    pub fn prepare_block(&mut self, block: u64) -> Result<(), RpcError> {
        if let Some(path) = &self.baseline_path {
            if !self.baseline_loaded {
                match BaselineStateFile::load(path) {
                    Ok(baseline) => {
                        info!(
                            block = baseline.block_number,
                            contracts = baseline.contracts.len(),
                            "loaded baseline state"
                        );
                        self.fork_block = Some(baseline.block_number);
                        self.rolling = baseline
                            .to_accounts()
                            .into_iter()
                            .map(|(address, account)| (address, account_to_state(address, account)))
                            .collect();
                        self.baseline_loaded = true;
                    }
                    Err(e) => {
                        warn!(error = %e, "baseline file unusable, falling back to parent block");
                        self.baseline_path = None;
                    }
                }
            }
            if self.baseline_loaded {
                // fork sessions roll forward from the baseline; no refetch
                return Ok(());
            }
        }

        if block == 0 {
            return Ok(());
        }
        let Some(fetcher) = &self.fetcher else {
            return Ok(());
        };
        let parent = block - 1;
        for address in self.protected.clone() {
            let state = fetcher.fetch_contract_state(address, Some(parent), None, &[])?;
            self.rolling.insert(address, state);
        }
        Ok(())
    }

    /// Rolling state at the start of the next transaction.
    pub fn pre_tx_states(&self) -> HashMap<EVMAddress, ContractState> {
        self.rolling.clone()
    }

    /// Fold one transaction's storage writes and balance updates into the
    /// rolling map.
    pub fn apply_storage_changes(
        &mut self,
        changes: &HashMap<EVMAddress, HashMap<EVMU256, EVMU256>>,
    ) {
        for (address, slots) in changes {
            let entry = self.rolling.entry(*address).or_insert_with(|| ContractState {
                address: *address,
                ..Default::default()
            });
            for (slot, value) in slots {
                entry.storage.insert(*slot, *value);
            }
        }
    }

    pub fn apply_balance(&mut self, address: EVMAddress, balance: EVMU256) {
        let entry = self.rolling.entry(address).or_insert_with(|| ContractState {
            address,
            ..Default::default()
        });
        entry.balance = balance;
    }

    /// Rolling state as adapter overrides for a replay.
    pub fn override_accounts(&self) -> HashMap<EVMAddress, AccountState> {
        self.rolling
            .iter()
            .map(|(address, state)| (*address, state_to_account(state)))
            .collect()
    }
}

fn account_to_state(address: EVMAddress, account: AccountState) -> ContractState {
    ContractState {
        address,
        balance: account.balance,
        code: account.code.bytes().to_vec(),
        storage: account.storage,
    }
}

fn state_to_account(state: &ContractState) -> AccountState {
    AccountState {
        balance: state.balance,
        nonce: 0,
        code: revm_primitives::Bytecode::new_raw(bytes::Bytes::from(state.code.clone())),
        storage: state.storage.clone(),
    }
}

/// Replay decision: transactions past the fork block run against the live
/// state with no override; historical (at-or-before fork) transactions run
/// over the captured prestate.
pub fn use_state_override(fork_block: Option<u64>, tx_block: u64) -> bool {
    match fork_block {
        Some(fork) => tx_block <= fork,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const BASELINE: &str = r#"{"block_number": 100, "contracts": {
        "0x0303030303030303030303030303030303030303": {
            "balance": "0x64", "storage": {"0x1": "0x2a"}
        }}}"#;

    fn addr(b: u8) -> EVMAddress {
        EVMAddress::from_slice(&[b; 20])
    }

    #[test]
    fn baseline_loads_exactly_once() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", BASELINE).unwrap();
        let path = file.path().to_path_buf();

        let mut orchestrator =
            PreBlockStateOrchestrator::new(Some(path), None, vec![addr(3)]);
        orchestrator.prepare_block(101).unwrap();
        assert_eq!(orchestrator.fork_block(), Some(100));
        let pre = orchestrator.pre_tx_states();
        assert_eq!(pre[&addr(3)].slot(EVMU256::from(1u64)), EVMU256::from(42u64));

        // deleting the file proves the second block does not re-read it
        drop(file);
        orchestrator.prepare_block(102).unwrap();
        assert_eq!(orchestrator.fork_block(), Some(100));
        assert_eq!(
            orchestrator.pre_tx_states()[&addr(3)].balance,
            EVMU256::from(100u64)
        );
    }

    #[test]
    fn rolling_state_advances_with_changes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", BASELINE).unwrap();
        let mut orchestrator = PreBlockStateOrchestrator::new(
            Some(file.path().to_path_buf()),
            None,
            vec![addr(3)],
        );
        orchestrator.prepare_block(101).unwrap();

        let pre = orchestrator.pre_tx_states();
        let changes = HashMap::from([(
            addr(3),
            HashMap::from([(EVMU256::from(1u64), EVMU256::from(99u64))]),
        )]);
        orchestrator.apply_storage_changes(&changes);

        // pre-tx snapshot is unaffected, rolling moved
        assert_eq!(pre[&addr(3)].slot(EVMU256::from(1u64)), EVMU256::from(42u64));
        assert_eq!(
            orchestrator.pre_tx_states()[&addr(3)].slot(EVMU256::from(1u64)),
            EVMU256::from(99u64)
        );

        let overrides = orchestrator.override_accounts();
        assert_eq!(
            overrides[&addr(3)].storage[&EVMU256::from(1u64)],
            EVMU256::from(99u64)
        );
    }

    #[test]
    fn fork_block_replay_bypass() {
        assert!(!use_state_override(Some(100), 101));
        assert!(use_state_override(Some(100), 100));
        assert!(use_state_override(Some(100), 99));
        assert!(use_state_override(None, 5));
    }
}
