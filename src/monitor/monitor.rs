use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::evm::config::FuzzingConfig;
use crate::evm::mutation::MutationEngine;
use crate::evm::registry::ProtectedRegistry;
use crate::evm::state::AccountState;
use crate::evm::types::{address_to_hex, parse_address, parse_word, EVMAddress, EVMU256};
use crate::evm::vm::{BlockContext, ExecutionResult, LocalEvmExecutor};
use crate::fuzz::campaign::{CampaignTx, FuzzCampaign};
use crate::fuzz::report::FuzzingReport;
use crate::invariants::registry::InvariantRegistry;
use crate::invariants::types::{ChainState, ContractState};
use crate::monitor::alerts::AlertManager;
use crate::monitor::prestate::{use_state_override, PreBlockStateOrchestrator};
use crate::onchain::endpoints::{RpcClient, RpcError, RpcStateProvider};
use crate::onchain::storage::StorageFetcher;
use crate::onchain::tracer::TxTracer;

#[derive(Clone, Debug)]
pub struct MonitorConfig {
    pub block_lag: u64,
    pub poll_interval: Duration,
    pub local_execution: bool,
    pub disable_state_override: bool,
    pub trace_settle: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            block_lag: 0,
            poll_interval: Duration::from_secs(1),
            local_execution: true,
            disable_state_override: false,
            trace_settle: Duration::from_secs(15),
        }
    }
}

/// Reconnect backoff: doubles up to a minute.
pub fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(Duration::from_secs(60))
}

/// A queued fuzzing campaign, handed to the worker pool.
pub struct FuzzTask {
    pub project: String,
    pub tx: CampaignTx,
    pub target: EVMAddress,
    pub target_functions: Vec<String>,
    pub overrides: HashMap<EVMAddress, AccountState>,
    pub pre_states: HashMap<EVMAddress, ContractState>,
    pub block: BlockContext,
    pub block_number: u64,
    pub fuzz_config: FuzzingConfig,
}

/// Spawn the shared fuzz worker pool. Workers run whole campaigns and push
/// normalized reports; a failed campaign never takes the pool down.
pub fn spawn_fuzz_workers(
    workers: usize,
    registry: Arc<RwLock<ProtectedRegistry>>,
    engine: Arc<MutationEngine>,
    invariants: Arc<InvariantRegistry>,
    task_rx: Receiver<FuzzTask>,
    report_tx: Sender<FuzzingReport>,
    cancel: Arc<AtomicBool>,
) -> Vec<JoinHandle<()>> {
    (0..workers.max(1))
        .map(|worker| {
            let registry = registry.clone();
            let engine = engine.clone();
            let invariants = invariants.clone();
            let task_rx = task_rx.clone();
            let report_tx = report_tx.clone();
            let cancel = cancel.clone();
            std::thread::spawn(move || {
                for task in task_rx.iter() {
                    if cancel.load(Ordering::Relaxed) {
                        break;
                    }
                    debug!(worker, target = %address_to_hex(task.target), "campaign start");
                    let campaign = FuzzCampaign::new(
                        registry.clone(),
                        engine.clone(),
                        task.fuzz_config.clone(),
                        task.block.clone(),
                        task.project.clone(),
                    );

                    let pre = task.pre_states.clone();
                    let target = task.target;
                    let block_number = task.block_number;
                    let tx_hash = task.tx.tx_hash.clone();
                    let check_invariants = invariants.clone();
                    let check = move |result: &ExecutionResult| {
                        let mut states = pre.clone();
                        for (address, slots) in &result.state_changes {
                            let entry =
                                states.entry(*address).or_insert_with(|| ContractState {
                                    address: *address,
                                    ..Default::default()
                                });
                            for (slot, change) in slots {
                                entry.storage.insert(*slot, change.after);
                            }
                        }
                        let chain_state = ChainState {
                            block_number,
                            tx_hash: tx_hash.clone(),
                            states,
                            previous_states: pre.clone(),
                            ..Default::default()
                        };
                        !check_invariants
                            .evaluate_transaction(&[target], &chain_state)
                            .is_empty()
                    };

                    let reports = campaign.run(
                        &task.tx,
                        task.target,
                        &task.target_functions,
                        task.overrides.clone(),
                        &check,
                        &cancel,
                    );
                    for mut report in reports {
                        report.normalize_selector();
                        if report_tx.send(report).is_err() {
                            return;
                        }
                    }
                }
            })
        })
        .collect()
}

/// The block-subscription driver: walks new heads behind a reorg lag,
/// replays protected transactions, evaluates invariants, and enqueues
/// fuzz campaigns.
pub struct Monitor {
    client: Arc<RpcClient>,
    tracer: TxTracer,
    fetcher: Arc<StorageFetcher>,
    registry: Arc<RwLock<ProtectedRegistry>>,
    invariants: Arc<InvariantRegistry>,
    alerts: AlertManager,
    orchestrator: PreBlockStateOrchestrator,
    config: MonitorConfig,
    /// project id -> fuzzing config
    fuzz_configs: HashMap<String, FuzzingConfig>,
    fuzz_tx: Sender<FuzzTask>,
    cancel: Arc<AtomicBool>,
    last_block: u64,
}

impl Monitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<RpcClient>,
        registry: Arc<RwLock<ProtectedRegistry>>,
        invariants: Arc<InvariantRegistry>,
        alerts: AlertManager,
        orchestrator: PreBlockStateOrchestrator,
        config: MonitorConfig,
        fuzz_configs: HashMap<String, FuzzingConfig>,
        fuzz_tx: Sender<FuzzTask>,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            tracer: TxTracer::new(client.clone()),
            fetcher: Arc::new(StorageFetcher::new(client.clone())),
            client,
            registry,
            invariants,
            alerts,
            orchestrator,
            config,
            fuzz_configs,
            fuzz_tx,
            cancel,
            last_block: 0,
        }
    }

    /// Drive until cancelled. Subscription failures reconnect with
    /// exponential backoff and resume from the last processed block.
    pub fn run(&mut self) {
        let mut backoff = Duration::from_secs(1);
        info!(endpoint = %self.client.endpoint_url, "monitor started");
        while !self.cancel.load(Ordering::Relaxed) {
            let head = match self.client.block_number() {
                Ok(head) => {
                    backoff = Duration::from_secs(1);
                    head
                }
                Err(e) => {
                    warn!(error = %e, backoff = ?backoff, "head poll failed, backing off");
                    std::thread::sleep(backoff);
                    backoff = next_backoff(backoff);
                    continue;
                }
            };

            let target = head.saturating_sub(self.config.block_lag);
            if self.last_block == 0 {
                // first sight of the chain: start at the tip
                self.last_block = target.saturating_sub(1);
            }
            while self.last_block < target && !self.cancel.load(Ordering::Relaxed) {
                let block = self.last_block + 1;
                match self.process_block(block) {
                    Ok(()) => self.last_block = block,
                    Err(e) => {
                        warn!(block, error = %e, "block processing failed, will retry");
                        break;
                    }
                }
            }
            std::thread::sleep(self.config.poll_interval);
        }
        info!("monitor stopped");
    }

    fn process_block(&mut self, number: u64) -> Result<(), RpcError> {
        self.orchestrator.prepare_block(number)?;
        let block = self.client.get_block_by_number(number, true)?;
        let block_hash = block
            .get("hash")
            .and_then(|h| h.as_str())
            .unwrap_or_default()
            .to_string();
        let timestamp = block
            .get("timestamp")
            .and_then(|t| t.as_str())
            .and_then(|t| u64::from_str_radix(t.trim_start_matches("0x"), 16).ok())
            .unwrap_or(0);
        let coinbase = block
            .get("miner")
            .and_then(|m| m.as_str())
            .and_then(parse_address)
            .unwrap_or_else(EVMAddress::zero);

        let transactions = block
            .get("transactions")
            .and_then(|t| t.as_array())
            .cloned()
            .unwrap_or_default();
        debug!(number, txs = transactions.len(), "processing block");

        // strictly index order; the rolling state advances sequentially
        for (index, tx) in transactions.iter().enumerate() {
            if self.cancel.load(Ordering::Relaxed) {
                break;
            }
            if let Err(e) = self.process_tx(number, &block_hash, timestamp, coinbase, tx) {
                // one failed transaction never stops the block
                warn!(number, index, error = %e, "transaction processing failed");
            }
        }
        Ok(())
    }

    fn trace_with_settle(&self, tx_hash: &str) -> Option<crate::onchain::tracer::CallFrame> {
        match self.tracer.trace(tx_hash) {
            Ok(frame) => Some(frame),
            Err(first) => {
                // trace data can lag the header event
                debug!(error = %first, "trace unavailable yet, settling");
                std::thread::sleep(self.config.trace_settle);
                match self.tracer.trace(tx_hash) {
                    Ok(frame) => Some(frame),
                    Err(e) => {
                        warn!(error = %e, "trace unavailable after settling");
                        None
                    }
                }
            }
        }
    }

    fn process_tx(
        &mut self,
        number: u64,
        block_hash: &str,
        timestamp: u64,
        coinbase: EVMAddress,
        tx: &Value,
    ) -> Result<(), RpcError> {
        let local_hash = tx
            .get("hash")
            .and_then(|h| h.as_str())
            .unwrap_or_default()
            .to_string();
        if local_hash.is_empty() {
            return Ok(());
        }

        // the receipt hash is canonical; never trust a locally computed one
        let receipt = self.client.get_transaction_receipt(&local_hash)?;
        let canonical_hash = receipt
            .get("transactionHash")
            .and_then(|h| h.as_str())
            .unwrap_or(&local_hash)
            .to_string();
        if !canonical_hash.eq_ignore_ascii_case(&local_hash) {
            warn!(local = %local_hash, canonical = %canonical_hash, "tx hash drift, adopting receipt hash");
        }

        let from = tx
            .get("from")
            .and_then(|f| f.as_str())
            .and_then(parse_address)
            .unwrap_or_else(EVMAddress::zero);
        let to = tx.get("to").and_then(|t| t.as_str()).and_then(parse_address);
        let input = tx
            .get("input")
            .and_then(|i| i.as_str())
            .map(|i| hex::decode(i.trim_start_matches("0x")).unwrap_or_default())
            .unwrap_or_default();
        let value = tx
            .get("value")
            .and_then(|v| v.as_str())
            .and_then(parse_word)
            .unwrap_or(EVMU256::ZERO);

        // protected hits through the direct target and through the trace
        let protected = self.registry.read().unwrap().addresses();
        let mut touched: Vec<EVMAddress> = Vec::new();
        if let Some(to) = to {
            if protected.contains(&to) {
                touched.push(to);
            }
        }
        let frame = self.trace_with_settle(&canonical_hash);
        if let Some(frame) = &frame {
            for address in &protected {
                if !touched.contains(address)
                    && !self.tracer.find_contract_calls(frame, *address).is_empty()
                {
                    touched.push(*address);
                }
            }
        }
        if touched.is_empty() {
            return Ok(());
        }
        if let Some(frame) = &frame {
            let stats = self.tracer.get_call_statistics(frame);
            info!(
                tx = %canonical_hash,
                addresses = stats.unique_addresses,
                signatures = stats.function_signatures.len(),
                gas = stats.total_gas,
                "protected transaction"
            );
        }

        let pre = self.orchestrator.pre_tx_states();
        let block_ctx = BlockContext {
            coinbase,
            number,
            timestamp,
            basefee: EVMU256::ZERO,
            prevrandao: revm_primitives::B256::zero(),
            chain_id: self.client.chain_id,
            gas_limit: 30_000_000,
        };

        let with_override = use_state_override(self.orchestrator.fork_block(), number)
            && !self.config.disable_state_override;
        let replay_overrides = if with_override {
            self.orchestrator.override_accounts()
        } else {
            HashMap::new()
        };

        let mut replayed = false;
        if self.config.local_execution {
            if let Some(to) = to {
                let mut executor = LocalEvmExecutor::new(block_ctx.clone());
                executor.set_protected(protected.clone());
                if !with_override {
                    executor.attach_provider(Arc::new(RpcStateProvider::new(
                        self.client.clone(),
                        Some(number.saturating_sub(1)),
                    )));
                }
                let result =
                    executor.execute(from, to, input.clone(), value, replay_overrides.clone());
                if result.success {
                    let after: HashMap<EVMAddress, HashMap<EVMU256, EVMU256>> = result
                        .state_changes
                        .iter()
                        .map(|(address, slots)| {
                            (
                                *address,
                                slots.iter().map(|(s, c)| (*s, c.after)).collect(),
                            )
                        })
                        .collect();
                    self.orchestrator.apply_storage_changes(&after);
                    replayed = true;
                } else {
                    debug!(error = ?result.error, "replay failed, falling back");
                }
            }
        }

        if !replayed {
            match self.tracer.get_storage_changes(&canonical_hash) {
                Ok(changes) => self.orchestrator.apply_storage_changes(&changes),
                Err(e) => {
                    if self.orchestrator.fork_block().is_some() {
                        // fork scenario: the rolling state is the best we have
                        debug!(error = %e, "no storage diff, keeping rolling state");
                    } else {
                        // historical scenario: read back from the chain
                        for address in &touched {
                            match self.fetcher.fetch_contract_state(
                                *address,
                                Some(number),
                                Some(block_hash),
                                &[from],
                            ) {
                                Ok(state) => {
                                    self.orchestrator
                                        .apply_balance(*address, state.balance);
                                    self.orchestrator.apply_storage_changes(&HashMap::from([(
                                        *address,
                                        state.storage,
                                    )]));
                                }
                                Err(e) => warn!(error = %e, "post-state fetch failed"),
                            }
                        }
                    }
                }
            }
        }

        let chain_state = ChainState {
            block_number: number,
            block_hash: block_hash.to_string(),
            tx_hash: canonical_hash.clone(),
            timestamp,
            states: self.orchestrator.pre_tx_states(),
            previous_states: pre.clone(),
        };
        let violations = self.invariants.evaluate_transaction(&touched, &chain_state);
        for violation in &violations {
            self.alerts.dispatch(violation);
        }

        // fuzz on violation, or unconditionally when auto-trigger is set
        for target in touched {
            let Some(project) = self.invariants.project_of(target).map(|p| p.id.clone()) else {
                continue;
            };
            let Some(fuzz_config) = self.fuzz_configs.get(&project).cloned() else {
                continue;
            };
            let violated_here = violations.iter().any(|v| v.project_id == project);
            if !violated_here && !fuzz_config.auto_trigger {
                continue;
            }
            // bare protected contracts (tokens etc.) are not fuzzed
            let Some(functions) = fuzz_config
                .target_functions
                .get(&address_to_hex(target))
                .cloned()
            else {
                continue;
            };
            if functions.is_empty() {
                continue;
            }

            // trace data from the node may lag the header event
            std::thread::sleep(self.config.trace_settle);
            let Some(to) = to else { continue };
            let task = FuzzTask {
                project,
                tx: CampaignTx {
                    from,
                    to,
                    input: input.clone(),
                    value,
                    tx_hash: canonical_hash.clone(),
                },
                target,
                target_functions: functions,
                overrides: replay_overrides.clone(),
                pre_states: pre.clone(),
                block: block_ctx.clone(),
                block_number: number,
                fuzz_config,
            };
            if self.fuzz_tx.try_send(task).is_err() {
                warn!(target = %address_to_hex(target), "fuzz queue full, dropping campaign");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evm::abi::{selector, SeedValue};
    use crate::evm::config::SeedConfig;
    use crate::evm::registry::ProtectedContractInfo;
    use bytes::Bytes;
    use crossbeam_channel::bounded;
    use ethers_core::abi::Token;
    use revm_primitives::Bytecode;

    #[test]
    fn backoff_doubles_to_a_minute() {
        let mut d = Duration::from_secs(1);
        let mut seen = vec![];
        for _ in 0..8 {
            d = next_backoff(d);
            seen.push(d.as_secs());
        }
        assert_eq!(seen, vec![2, 4, 8, 16, 32, 60, 60, 60]);
    }

    // CALLDATALOAD(4) -> SSTORE slot 0, then STOP
    const STORE_ARG: &[u8] = &[0x60, 0x04, 0x35, 0x60, 0x00, 0x55, 0x00];

    #[test]
    fn worker_pool_runs_campaigns_and_reports() {
        let target = EVMAddress::from_slice(&[3; 20]);
        let json = r#"[{"type":"function","name":"store","inputs":[
            {"name":"value","type":"uint256"}],
            "outputs":[],"stateMutability":"nonpayable"}]"#;
        let abi: ethers_core::abi::Abi = serde_json::from_str(json).unwrap();
        let method = abi.functions().next().unwrap().clone();

        let mut seed_config = SeedConfig {
            enabled: true,
            ..Default::default()
        };
        seed_config.attack_seeds.insert(
            0,
            vec![
                SeedValue::Int(EVMU256::from(10u64)),
                SeedValue::Int(EVMU256::from(900u64)),
            ],
        );
        let mut registry = ProtectedRegistry::new();
        registry
            .register(ProtectedContractInfo {
                address: target,
                name: "store".into(),
                abi,
                seed_config: Some(seed_config),
                metadata: HashMap::new(),
            })
            .unwrap();
        let registry = Arc::new(RwLock::new(registry));

        // threshold invariant: slot 0 of the target must stay <= 500
        let mut invariants = InvariantRegistry::new();
        invariants
            .load_project(
                &serde_json::from_value(serde_json::json!({
                    "project_id": "p1",
                    "contracts": [{"address": address_to_hex(target)}],
                    "invariants": [{
                        "id": "cap", "type": "threshold",
                        "parameters": {"contract": address_to_hex(target),
                                        "slot": 0, "max": 500}
                    }]
                }))
                .unwrap(),
            )
            .unwrap();
        let invariants = Arc::new(invariants);

        let (task_tx, task_rx) = bounded::<FuzzTask>(4);
        let (report_tx, report_rx) = bounded(16);
        let cancel = Arc::new(AtomicBool::new(false));
        let handles = spawn_fuzz_workers(
            2,
            registry,
            Arc::new(MutationEngine::new()),
            invariants,
            task_rx,
            report_tx,
            cancel.clone(),
        );

        let mut input = selector(&method).to_vec();
        input.extend(ethers_core::abi::encode(&[Token::Uint(5u64.into())]));
        let overrides = HashMap::from([(
            target,
            AccountState {
                code: Bytecode::new_raw(Bytes::from(STORE_ARG.to_vec())),
                ..Default::default()
            },
        )]);
        task_tx
            .send(FuzzTask {
                project: "p1".into(),
                tx: CampaignTx {
                    from: EVMAddress::from_slice(&[1; 20]),
                    to: target,
                    input,
                    value: EVMU256::ZERO,
                    tx_hash: "0xfeed".into(),
                },
                target,
                target_functions: vec!["store".into()],
                overrides,
                pre_states: HashMap::new(),
                block: BlockContext::default(),
                block_number: 7,
                fuzz_config: FuzzingConfig {
                    max_iterations: 4,
                    pool_size: 2,
                    ..Default::default()
                },
            })
            .unwrap();
        drop(task_tx);

        let report = report_rx
            .recv_timeout(Duration::from_secs(30))
            .expect("report expected");
        assert_eq!(report.function_signature, "store(uint256)");
        // 900 violates the cap, 10 does not
        assert_eq!(report.stats.valid_combinations, 2);
        assert!(report.has_findings());

        cancel.store(true, Ordering::Relaxed);
        for handle in handles {
            let _ = handle.join();
        }
    }
}
