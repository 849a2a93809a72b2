use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use ethers_core::abi::Token;
use ethers_core::types::transaction::eip2718::TypedTransaction;
use ethers_core::types::{TransactionRequest, U256 as EthersU256};
use ethers_signers::{LocalWallet, Signer};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::evm::abi::{selector_of, set_hash};
use crate::evm::types::{address_to_hex, convert_to_h160, EVMAddress};
use crate::fuzz::report::FuzzingReport;
use crate::onchain::endpoints::RpcClient;
use crate::rules::exporter::{
    merge_expressions, merge_parameters, ExpressionExport, RuleParameter,
};

/// Minimum interval between successful pushes for the same
/// `(project, functionSig)` key.
const PUSH_WINDOW: Duration = Duration::from_secs(3600);

const PUSH_FUNCTION: &str = "applyAutopatch(address,bytes4,bytes)";
const APPLIED_EVENT: &str = "AutopatchApplied(address,bytes4,uint256,bytes32)";
const RULE_EVENT: &str =
    "AutopatchRule(address,bytes4,uint8,uint8,uint8,bool,bytes32,bytes32,uint256)";

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("bad private key: {0}")]
    BadKey(String),
    #[error("rpc error: {0}")]
    Rpc(#[from] crate::onchain::endpoints::RpcError),
    #[error("signing error: {0}")]
    Signing(String),
}

#[derive(Clone, Debug)]
pub struct OraclePusherConfig {
    pub enabled: bool,
    pub module: EVMAddress,
    pub private_key: String,
    pub chain_id: u64,
    pub push_threshold: f64,
    /// honor below-threshold pushes when explicitly enabled
    pub push_candidates: bool,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_rules: usize,
    pub compress_ranges: bool,
    pub max_values_per_param: usize,
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub gas_limit: u64,
}

impl Default for OraclePusherConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            module: EVMAddress::zero(),
            private_key: String::new(),
            chain_id: 1,
            push_threshold: 0.5,
            push_candidates: false,
            batch_size: 8,
            flush_interval: Duration::from_secs(30),
            max_rules: 64,
            compress_ranges: true,
            max_values_per_param: 16,
            retry_count: 3,
            retry_delay: Duration::from_secs(2),
            gas_limit: 500_000,
        }
    }
}

fn event_topic(signature: &str) -> String {
    let mut hash = [0u8; 32];
    set_hash(signature, &mut hash);
    format!("0x{}", hex::encode(hash))
}

/// Batches fuzzing reports and submits signed rule transactions to the
/// on-chain module, one per `(project, functionSig)` group.
pub struct OraclePusher {
    config: OraclePusherConfig,
    client: Arc<RpcClient>,
    wallet: Option<LocalWallet>,
    buffer: RwLock<Vec<FuzzingReport>>,
    push_history: RwLock<HashMap<(String, String), SystemTime>>,
    ack_from_block: AtomicU64,
}

impl OraclePusher {
    pub fn new(config: OraclePusherConfig, client: Arc<RpcClient>) -> Result<Self, PushError> {
        let wallet = if config.enabled {
            let wallet: LocalWallet = config
                .private_key
                .trim_start_matches("0x")
                .parse()
                .map_err(|e| PushError::BadKey(format!("{e:?}")))?;
            Some(wallet.with_chain_id(config.chain_id))
        } else {
            None
        };
        Ok(Self {
            config,
            client,
            wallet,
            buffer: RwLock::new(Vec::new()),
            push_history: RwLock::new(HashMap::new()),
            ack_from_block: AtomicU64::new(0),
        })
    }

    /// Push eligibility: findings exist, similarity clears the threshold
    /// (or candidates are explicitly allowed), and the key has not been
    /// pushed within the last hour.
    pub fn should_push(&self, report: &FuzzingReport) -> bool {
        if !report.has_findings() {
            return false;
        }
        if report.stats.max_similarity < self.config.push_threshold
            && !self.config.push_candidates
        {
            return false;
        }
        let key = (report.project.clone(), report.function_signature.clone());
        match self.push_history.read().unwrap().get(&key) {
            Some(last) => SystemTime::now()
                .duration_since(*last)
                .map_or(true, |since| since >= PUSH_WINDOW),
            None => true,
        }
    }

    /// Cap discrete value sets, optionally compressing oversized numeric
    /// sets into ranges.
    fn optimize_parameters(&self, report: &mut FuzzingReport) {
        for param in &mut report.valid_parameters {
            if param.is_range || param.single_values.len() <= self.config.max_values_per_param {
                continue;
            }
            let numeric = param.param_type <= 1;
            if self.config.compress_ranges && numeric {
                let mut sorted = param.single_values.clone();
                sorted.sort();
                param.is_range = true;
                param.range_min = *sorted.first().unwrap();
                param.range_max = *sorted.last().unwrap();
                param.single_values.clear();
            } else {
                param.single_values.truncate(self.config.max_values_per_param);
            }
        }
    }

    pub fn process_fuzzing_result(&self, mut report: FuzzingReport) {
        if !self.config.enabled {
            return;
        }
        report.normalize_selector();
        self.optimize_parameters(&mut report);
        if !self.should_push(&report) {
            debug!(
                project = %report.project,
                sig = %report.function_signature,
                "report not eligible for push"
            );
            return;
        }
        let pending = {
            let mut buffer = self.buffer.write().unwrap();
            buffer.push(report);
            buffer.len()
        };
        if pending >= self.config.batch_size {
            if let Err(e) = self.flush() {
                warn!(error = %e, "flush after batch fill failed");
            }
        }
    }

    /// Group the buffer by `(project, functionSig)`, merge inside each
    /// group, and submit one signed transaction per group. Failed groups
    /// return to the buffer.
    pub fn flush(&self) -> Result<(), PushError> {
        let drained: Vec<FuzzingReport> = {
            let mut buffer = self.buffer.write().unwrap();
            std::mem::take(&mut *buffer)
        };
        if drained.is_empty() {
            return Ok(());
        }

        let mut groups: HashMap<(String, String), Vec<FuzzingReport>> = HashMap::new();
        for report in drained {
            groups
                .entry((report.project.clone(), report.function_signature.clone()))
                .or_default()
                .push(report);
        }

        let mut pushed = 0usize;
        for ((project, signature), reports) in groups {
            if pushed >= self.config.max_rules {
                warn!("max rules per flush reached, re-buffering remainder");
                self.buffer.write().unwrap().extend(reports);
                continue;
            }
            match self.push_group(&project, &signature, &reports) {
                Ok(tx_hash) => {
                    pushed += 1;
                    info!(project = %project, sig = %signature, tx = %tx_hash, "rules pushed");
                    self.push_history
                        .write()
                        .unwrap()
                        .insert((project, signature), SystemTime::now());
                }
                Err(e) => {
                    warn!(project = %project, sig = %signature, error = %e, "push failed, keeping reports");
                    self.buffer.write().unwrap().extend(reports);
                }
            }
        }
        Ok(())
    }

    fn push_group(
        &self,
        project: &str,
        signature: &str,
        reports: &[FuzzingReport],
    ) -> Result<String, PushError> {
        let Some(wallet) = &self.wallet else {
            return Err(PushError::Signing("no wallet configured".into()));
        };
        let contract = reports[0].contract;
        let selector = selector_of(signature);

        let mut parameters: Vec<RuleParameter> = Vec::new();
        let mut expressions: Vec<ExpressionExport> = Vec::new();
        for report in reports {
            let incoming: Vec<RuleParameter> = report
                .valid_parameters
                .iter()
                .map(RuleParameter::from_summary)
                .collect();
            merge_parameters(&mut parameters, &incoming);
            let incoming: Vec<ExpressionExport> = report
                .expression_rules
                .iter()
                .map(ExpressionExport::from_rule)
                .collect();
            merge_expressions(&mut expressions, &incoming);
        }

        let payload = serde_json::to_vec(&json!({
            "project": project,
            "functionSig": signature,
            "parameters": parameters,
            "expressions": expressions,
        }))
        .map_err(|e| PushError::Signing(e.to_string()))?;

        let mut calldata = selector_of(PUSH_FUNCTION).to_vec();
        calldata.extend(ethers_core::abi::encode(&[
            Token::Address(convert_to_h160(contract)),
            Token::FixedBytes(selector.to_vec()),
            Token::Bytes(payload),
        ]));

        let mut last_error = PushError::Signing("no attempt".into());
        for attempt in 0..=self.config.retry_count {
            if attempt > 0 {
                std::thread::sleep(self.config.retry_delay);
            }
            match self.submit(wallet, &calldata) {
                Ok(tx_hash) => return Ok(tx_hash),
                Err(e) => {
                    debug!(attempt, error = %e, "push attempt failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    fn submit(&self, wallet: &LocalWallet, calldata: &[u8]) -> Result<String, PushError> {
        let nonce = self
            .client
            .get_transaction_count(crate::evm::types::convert_h160(wallet.address()))?;
        let gas_price = self
            .client
            .gas_price()
            .map(|p| EthersU256::from_big_endian(&p.to_be_bytes::<32>()))
            .unwrap_or_else(|_| EthersU256::from(1_000_000_000u64));

        let tx: TypedTransaction = TransactionRequest::new()
            .from(wallet.address())
            .to(convert_to_h160(self.config.module))
            .gas(self.config.gas_limit)
            .gas_price(gas_price)
            .nonce(nonce)
            .chain_id(self.config.chain_id)
            .data(calldata.to_vec())
            .into();
        let signature = wallet
            .sign_transaction_sync(&tx)
            .map_err(|e| PushError::Signing(e.to_string()))?;
        let raw = tx.rlp_signed(&signature);
        Ok(self.client.send_raw_transaction(&raw)?)
    }

    /// Poll the module's acknowledgement events and log them.
    pub fn poll_acks(&self) {
        let from = self.ack_from_block.load(Ordering::Relaxed);
        let filter = json!({
            "address": address_to_hex(self.config.module),
            "fromBlock": format!("0x{:x}", from),
            "toBlock": "latest",
            "topics": [[event_topic(APPLIED_EVENT), event_topic(RULE_EVENT)]],
        });
        match self.client.get_logs(filter) {
            Ok(logs) => {
                for log in &logs {
                    let topic = log
                        .get("topics")
                        .and_then(|t| t.as_array())
                        .and_then(|t| t.first())
                        .and_then(|t| t.as_str())
                        .unwrap_or_default();
                    let kind = if topic == event_topic(APPLIED_EVENT) {
                        "AutopatchApplied"
                    } else {
                        "AutopatchRule"
                    };
                    info!(
                        event = kind,
                        block = log.get("blockNumber").and_then(|b| b.as_str()).unwrap_or(""),
                        "oracle acknowledgement"
                    );
                    if let Some(block) = log
                        .get("blockNumber")
                        .and_then(|b| b.as_str())
                        .and_then(|b| u64::from_str_radix(b.trim_start_matches("0x"), 16).ok())
                    {
                        self.ack_from_block.fetch_max(block + 1, Ordering::Relaxed);
                    }
                }
            }
            Err(e) => debug!(error = %e, "ack poll failed"),
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.read().unwrap().len()
    }
}

/// Background task: periodic flush plus the acknowledgement listener.
pub fn start_background(pusher: Arc<OraclePusher>, cancel: Arc<AtomicBool>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while !cancel.load(Ordering::Relaxed) {
            std::thread::sleep(pusher.config.flush_interval);
            if let Err(e) = pusher.flush() {
                warn!(error = %e, "periodic flush failed");
            }
            pusher.poll_acks();
        }
        // final drain on shutdown
        let _ = pusher.flush();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evm::types::EVMU256;
    use crate::fuzz::report::{FuzzingStats, ParameterSummary};

    fn pusher(config: OraclePusherConfig) -> OraclePusher {
        OraclePusher::new(config, Arc::new(RpcClient::new("http://localhost:8545", 1))).unwrap()
    }

    fn report(similarity: f64, values: Vec<u64>) -> FuzzingReport {
        FuzzingReport {
            project: "p1".into(),
            contract: EVMAddress::from_slice(&[1; 20]),
            selector: selector_of("swap(uint256)"),
            function_signature: "swap(uint256)".into(),
            stats: FuzzingStats {
                max_similarity: similarity,
                ..Default::default()
            },
            valid_parameters: vec![ParameterSummary {
                param_index: 0,
                param_type: 0,
                is_range: false,
                single_values: values
                    .into_iter()
                    .map(|v| EVMU256::from(v).to_be_bytes::<32>())
                    .collect(),
                range_min: [0; 32],
                range_max: [0; 32],
                occurrence_count: 1,
            }],
            expression_rules: vec![],
            constraint_rule: None,
            origin_tx_hash: "0x0".into(),
        }
    }

    fn disabled_config() -> OraclePusherConfig {
        OraclePusherConfig {
            push_threshold: 0.5,
            ..Default::default()
        }
    }

    #[test]
    fn should_push_honors_threshold_and_candidates() {
        let p = pusher(disabled_config());
        assert!(p.should_push(&report(0.9, vec![1])));
        assert!(!p.should_push(&report(0.1, vec![1])));

        let candidates = pusher(OraclePusherConfig {
            push_candidates: true,
            ..disabled_config()
        });
        // below threshold is allowed when candidates are explicitly on
        assert!(candidates.should_push(&report(0.1, vec![1])));

        // no findings never pushes
        let mut empty = report(0.9, vec![]);
        empty.valid_parameters.clear();
        assert!(!p.should_push(&empty));
    }

    #[test]
    fn push_window_suppresses_for_an_hour() {
        let p = pusher(disabled_config());
        let r = report(0.9, vec![1]);
        assert!(p.should_push(&r));
        p.push_history.write().unwrap().insert(
            ("p1".into(), "swap(uint256)".into()),
            SystemTime::now(),
        );
        assert!(!p.should_push(&r));
        p.push_history.write().unwrap().insert(
            ("p1".into(), "swap(uint256)".into()),
            SystemTime::now() - PUSH_WINDOW - Duration::from_secs(1),
        );
        assert!(p.should_push(&r));
    }

    #[test]
    fn oversized_discrete_sets_compress_to_ranges() {
        let p = pusher(OraclePusherConfig {
            max_values_per_param: 3,
            compress_ranges: true,
            ..Default::default()
        });
        let mut r = report(0.9, vec![5, 1, 9, 7, 3]);
        p.optimize_parameters(&mut r);
        let param = &r.valid_parameters[0];
        assert!(param.is_range);
        assert!(param.single_values.is_empty());
        assert_eq!(param.range_min, EVMU256::from(1u64).to_be_bytes::<32>());
        assert_eq!(param.range_max, EVMU256::from(9u64).to_be_bytes::<32>());

        let truncating = pusher(OraclePusherConfig {
            max_values_per_param: 2,
            compress_ranges: false,
            ..Default::default()
        });
        let mut r = report(0.9, vec![5, 1, 9]);
        truncating.optimize_parameters(&mut r);
        assert_eq!(r.valid_parameters[0].single_values.len(), 2);
    }

    #[test]
    fn event_topics_are_32_bytes() {
        let topic = event_topic(APPLIED_EVENT);
        assert!(topic.starts_with("0x"));
        assert_eq!(topic.len(), 66);
        assert_ne!(event_topic(APPLIED_EVENT), event_topic(RULE_EVENT));
    }

    #[test]
    fn mismatched_selector_is_normalized_before_buffering() {
        let enabled = OraclePusherConfig {
            enabled: true,
            private_key:
                "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318".into(),
            batch_size: 100,
            ..Default::default()
        };
        let p = pusher(enabled);
        let mut r = report(0.9, vec![1]);
        r.selector = [0xde, 0xad, 0xbe, 0xef];
        p.process_fuzzing_result(r);
        assert_eq!(p.buffered(), 1);
        assert_eq!(
            p.buffer.read().unwrap()[0].selector,
            selector_of("swap(uint256)")
        );
    }
}
