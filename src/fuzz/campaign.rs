use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use ethers_core::abi::{ParamType, Token};
use tracing::{debug, info, warn};

use crate::evm::abi::{param_type_code, token_to_word};
use crate::evm::config::FuzzingConfig;
use crate::evm::middlewares::call_interceptor::CallInterceptor;
use crate::evm::mutation::MutationEngine;
use crate::evm::pool::PoolManager;
use crate::evm::registry::ProtectedRegistry;
use crate::evm::state::AccountState;
use crate::evm::strategies::StrategyGenerator;
use crate::evm::types::{address_to_hex, EVMAddress, EVMU256};
use crate::evm::vm::{BlockContext, ExecutionResult, LocalEvmExecutor};
use crate::fuzz::report::{
    ConstraintRule, ExpressionRule, ExpressionTerm, FuzzingReport, FuzzingStats, ParameterSummary,
    TermKind,
};

/// The transaction a campaign replays and mutates.
#[derive(Clone, Debug)]
pub struct CampaignTx {
    pub from: EVMAddress,
    pub to: EVMAddress,
    pub input: Vec<u8>,
    pub value: EVMU256,
    pub tx_hash: String,
}

struct Sample {
    params: Vec<Token>,
    similarity: f64,
    success: bool,
    violated: bool,
}

/// Jaccard similarity over JUMPDEST traces; two empty traces count as
/// identical.
pub fn trace_similarity(a: &[(EVMAddress, usize)], b: &[(EVMAddress, usize)]) -> f64 {
    let left: HashSet<_> = a.iter().collect();
    let right: HashSet<_> = b.iter().collect();
    if left.is_empty() && right.is_empty() {
        return 1.0;
    }
    let intersection = left.intersection(&right).count() as f64;
    let union = left.union(&right).count() as f64;
    intersection / union
}

/// One fuzzing campaign: replays the transaction with pooled parameter
/// vectors spliced into calls that hit the target contract, and folds the
/// outcomes into per-function reports.
pub struct FuzzCampaign {
    registry: Arc<RwLock<ProtectedRegistry>>,
    engine: Arc<MutationEngine>,
    config: FuzzingConfig,
    block: BlockContext,
    project: String,
}

impl FuzzCampaign {
    pub fn new(
        registry: Arc<RwLock<ProtectedRegistry>>,
        engine: Arc<MutationEngine>,
        config: FuzzingConfig,
        block: BlockContext,
        project: String,
    ) -> Self {
        Self {
            registry,
            engine,
            config,
            block,
            project,
        }
    }

    pub fn run(
        &self,
        tx: &CampaignTx,
        target: EVMAddress,
        target_functions: &[String],
        overrides: HashMap<EVMAddress, AccountState>,
        violation_check: &dyn Fn(&ExecutionResult) -> bool,
        cancel: &AtomicBool,
    ) -> Vec<FuzzingReport> {
        let started = Instant::now();
        let budget = Duration::from_secs(self.config.campaign_budget_seconds());

        let (methods, seed_config, protected_addresses) = {
            let registry = self.registry.read().unwrap();
            let methods: Vec<_> = target_functions
                .iter()
                .filter_map(|name| registry.method_by_name(target, name).cloned())
                .collect();
            let seed_config = registry.get(target).and_then(|i| i.seed_config.clone());
            (methods, seed_config, registry.addresses())
        };
        if methods.is_empty() {
            warn!(target = %address_to_hex(target), "no target functions resolved, skipping");
            return vec![];
        }

        let mut pools = PoolManager::new(self.config.max_pools);
        pools.attach_generator(Box::new(StrategyGenerator::new(
            seed_config.clone(),
            self.config.seed,
        )));
        for method in &methods {
            pools.generate_pool(target, method, seed_config.as_ref(), self.config.pool_size);
        }

        // baseline run without mutation fixes the structural reference trace
        let mut baseline_executor = LocalEvmExecutor::new(self.block.clone());
        baseline_executor.set_protected(protected_addresses.clone());
        let baseline = baseline_executor.execute(
            tx.from,
            tx.to,
            tx.input.clone(),
            tx.value,
            overrides.clone(),
        );

        let interceptor = Rc::new(RefCell::new(CallInterceptor::new(
            self.registry.clone(),
            Arc::new(RwLock::new(pools)),
            self.engine.clone(),
            true,
        )));
        let mut executor = LocalEvmExecutor::new(self.block.clone());
        executor.set_protected(protected_addresses);
        executor.set_interceptor(interceptor.clone());

        let mut samples: HashMap<([u8; 4], String), Vec<Sample>> = HashMap::new();
        for iteration in 0..self.config.max_iterations {
            if cancel.load(Ordering::Relaxed) || started.elapsed() > budget {
                info!(iteration, "campaign budget exhausted");
                break;
            }
            let result = executor.execute(
                tx.from,
                tx.to,
                tx.input.clone(),
                tx.value,
                overrides.clone(),
            );
            let applied = interceptor.borrow_mut().take_applied();
            if applied.is_empty() {
                // nothing intercepted; more iterations will not change that
                debug!("no mutations applied, stopping campaign early");
                break;
            }
            let similarity =
                trace_similarity(&baseline.contract_jumpdests, &result.contract_jumpdests);
            let violated = violation_check(&result);
            for mutation in applied {
                self.engine
                    .update_history(&mutation.signature, similarity, result.success);
                samples
                    .entry((mutation.selector, mutation.signature))
                    .or_default()
                    .push(Sample {
                        params: mutation.params,
                        similarity,
                        success: result.success,
                        violated,
                    });
            }
        }

        let mut reports = Vec::new();
        for ((selector, signature), samples) in samples {
            let method = methods
                .iter()
                .find(|m| crate::evm::abi::selector(m) == selector);
            let Some(method) = method else { continue };
            reports.push(self.summarize(
                target,
                selector,
                &signature,
                method,
                seed_config.as_ref(),
                samples,
                &tx.tx_hash,
            ));
        }
        reports
    }

    #[allow(clippy::too_many_arguments)]
    fn summarize(
        &self,
        target: EVMAddress,
        selector: [u8; 4],
        signature: &str,
        method: &ethers_core::abi::Function,
        seed_config: Option<&crate::evm::config::SeedConfig>,
        samples: Vec<Sample>,
        origin_tx_hash: &str,
    ) -> FuzzingReport {
        let total = samples.len() as u64;
        let valid: Vec<&Sample> = samples.iter().filter(|s| s.violated && s.success).collect();

        let mut stats = FuzzingStats {
            total_combinations: total,
            valid_combinations: valid.len() as u64,
            min_similarity: f64::MAX,
            ..Default::default()
        };
        let mut raw_seen = HashSet::new();
        let mut overlap_seen = HashSet::new();
        for sample in &samples {
            stats.avg_similarity += sample.similarity;
            stats.max_similarity = stats.max_similarity.max(sample.similarity);
            stats.min_similarity = stats.min_similarity.min(sample.similarity);
            let key = format!("{:?}", sample.params);
            raw_seen.insert(key.clone());
            if sample.violated {
                overlap_seen.insert(key);
            }
        }
        if total > 0 {
            stats.avg_similarity /= total as f64;
        } else {
            stats.min_similarity = 0.0;
        }
        stats.raw_variants = raw_seen.len() as u64;
        stats.overlap_variants = overlap_seen.len() as u64;

        let mut valid_parameters = Vec::new();
        let mut expression_rules = Vec::new();
        for (index, input) in method.inputs.iter().enumerate() {
            // addresses are never fuzzed, they carry no attack region
            if matches!(input.kind, ParamType::Address) {
                continue;
            }
            let code = param_type_code(&input.kind);
            let words: Vec<[u8; 32]> = valid
                .iter()
                .filter_map(|s| s.params.get(index))
                .map(token_to_word)
                .collect();
            if words.is_empty() {
                continue;
            }
            let mut distinct: Vec<[u8; 32]> = words.clone();
            distinct.sort();
            distinct.dedup();

            let numeric = matches!(input.kind, ParamType::Uint(_) | ParamType::Int(_));
            let summary = if numeric && distinct.len() > 3 {
                ParameterSummary {
                    param_index: index,
                    param_type: code,
                    is_range: true,
                    single_values: vec![],
                    range_min: *distinct.first().unwrap(),
                    range_max: *distinct.last().unwrap(),
                    occurrence_count: words.len() as u64,
                }
            } else {
                ParameterSummary {
                    param_index: index,
                    param_type: code,
                    is_range: false,
                    single_values: distinct.clone(),
                    range_min: [0; 32],
                    range_max: [0; 32],
                    occurrence_count: words.len() as u64,
                }
            };
            valid_parameters.push(summary);

            if numeric {
                if let Some(rule) = self.extract_threshold_rule(
                    target, signature, index, code, &samples, &distinct, total,
                ) {
                    expression_rules.push(rule);
                }
            }
        }

        let constraint_rule = seed_config.and_then(|config| {
            method.inputs.iter().enumerate().find_map(|(index, _)| {
                config.constraint_for(&method.name, index).and_then(|c| {
                    c.range.as_ref().map(|range| ConstraintRule {
                        function: method.name.clone(),
                        param_index: index,
                        range_min: range.min.to_be_bytes::<32>(),
                        range_max: range.max.to_be_bytes::<32>(),
                        confidence: c.confidence,
                    })
                })
            })
        });

        FuzzingReport {
            project: self.project.clone(),
            contract: target,
            selector,
            function_signature: signature.to_string(),
            stats,
            valid_parameters,
            expression_rules,
            constraint_rule,
            origin_tx_hash: origin_tx_hash.to_string(),
        }
    }

    /// Single-parameter threshold rule: the smallest violating value,
    /// tightened by the largest non-violating value observed below it.
    #[allow(clippy::too_many_arguments)]
    fn extract_threshold_rule(
        &self,
        target: EVMAddress,
        signature: &str,
        param_index: usize,
        param_type: u8,
        samples: &[Sample],
        valid_distinct: &[[u8; 32]],
        total: u64,
    ) -> Option<ExpressionRule> {
        if valid_distinct.len() < 2 {
            return None;
        }
        let min_valid = EVMU256::try_from_be_slice(valid_distinct.first().unwrap())?;
        let max_invalid_below = samples
            .iter()
            .filter(|s| !s.violated)
            .filter_map(|s| s.params.get(param_index))
            .map(|t| EVMU256::try_from_be_slice(&token_to_word(t)).unwrap_or(EVMU256::ZERO))
            .filter(|v| *v < min_valid)
            .max();

        let threshold = match max_invalid_below {
            Some(below) => below + (min_valid - below) / EVMU256::from(2u64),
            None => min_valid,
        };
        let min_margin = min_valid - threshold;

        Some(ExpressionRule {
            contract: target,
            function_sig: signature.to_string(),
            expression_type: "param_ge_threshold".to_string(),
            terms: vec![ExpressionTerm {
                kind: TermKind::Param,
                param_index,
                param_type,
                slot: [0; 32],
                coeff: 1,
            }],
            threshold: threshold.to_be_bytes::<32>(),
            scale: 1,
            confidence: valid_distinct.len() as f64 / total.max(1) as f64,
            sample_count: total,
            min_margin: min_margin.to_be_bytes::<32>(),
            strategy: "boundary-scan".to_string(),
            generated_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evm::abi::{selector, SeedValue};
    use crate::evm::config::SeedConfig;
    use crate::evm::registry::ProtectedContractInfo;
    use bytes::Bytes;
    use revm_primitives::Bytecode;

    // CALLDATALOAD(4) -> SSTORE slot 0, then STOP
    const STORE_ARG: &[u8] = &[0x60, 0x04, 0x35, 0x60, 0x00, 0x55, 0x00];

    fn addr(b: u8) -> EVMAddress {
        EVMAddress::from_slice(&[b; 20])
    }

    fn setup(seeds: Vec<u64>) -> (FuzzCampaign, CampaignTx, HashMap<EVMAddress, AccountState>) {
        let target = addr(3);
        let json = r#"[{"type":"function","name":"store","inputs":[
            {"name":"value","type":"uint256"}],
            "outputs":[],"stateMutability":"nonpayable"}]"#;
        let abi: ethers_core::abi::Abi = serde_json::from_str(json).unwrap();

        let mut seed_config = SeedConfig {
            enabled: true,
            ..Default::default()
        };
        seed_config.attack_seeds.insert(
            0,
            seeds.into_iter().map(|s| SeedValue::Int(EVMU256::from(s))).collect(),
        );

        let mut registry = ProtectedRegistry::new();
        registry
            .register(ProtectedContractInfo {
                address: target,
                name: "store".into(),
                abi: abi.clone(),
                seed_config: Some(seed_config),
                metadata: HashMap::new(),
            })
            .unwrap();

        let config = FuzzingConfig {
            max_iterations: 6,
            pool_size: 3,
            seed: 1,
            ..Default::default()
        };
        let campaign = FuzzCampaign::new(
            Arc::new(RwLock::new(registry)),
            Arc::new(MutationEngine::new()),
            config,
            BlockContext::default(),
            "p1".into(),
        );

        let method = abi.functions().next().unwrap();
        let mut input = selector(method).to_vec();
        input.extend(ethers_core::abi::encode(&[Token::Uint(5u64.into())]));
        let tx = CampaignTx {
            from: addr(1),
            to: target,
            input,
            value: EVMU256::ZERO,
            tx_hash: "0xfeed".into(),
        };
        let overrides = HashMap::from([(
            target,
            AccountState {
                code: Bytecode::new_raw(Bytes::from(STORE_ARG.to_vec())),
                ..Default::default()
            },
        )]);
        (campaign, tx, overrides)
    }

    #[test]
    fn campaign_maps_the_violating_region() {
        let (campaign, tx, overrides) = setup(vec![100, 600, 700]);
        let target = addr(3);
        let cancel = AtomicBool::new(false);
        // "violated" when the stored value ends up >= 500
        let check = |result: &ExecutionResult| {
            result
                .state_changes
                .get(&target)
                .and_then(|slots| slots.get(&EVMU256::ZERO))
                .map_or(false, |change| change.after >= EVMU256::from(500u64))
        };

        let reports = campaign.run(&tx, target, &["store".into()], overrides, &check, &cancel);
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert_eq!(report.function_signature, "store(uint256)");
        assert_eq!(report.stats.total_combinations, 6);
        assert_eq!(report.stats.valid_combinations, 4);
        assert_eq!(report.stats.raw_variants, 3);
        assert_eq!(report.stats.overlap_variants, 2);

        let summary = &report.valid_parameters[0];
        assert!(!summary.is_range);
        let values: Vec<EVMU256> = summary
            .single_values
            .iter()
            .map(|w| EVMU256::try_from_be_slice(w).unwrap())
            .collect();
        assert_eq!(values, vec![EVMU256::from(600u64), EVMU256::from(700u64)]);

        // threshold lands between the best non-violating and worst violating
        let rule = &report.expression_rules[0];
        let threshold = EVMU256::try_from_be_slice(&rule.threshold).unwrap();
        assert!(threshold > EVMU256::from(100u64));
        assert!(threshold <= EVMU256::from(600u64));
        assert_eq!(rule.terms[0].kind, TermKind::Param);
    }

    #[test]
    fn cancelled_campaign_returns_nothing() {
        let (campaign, tx, overrides) = setup(vec![100, 600]);
        let cancel = AtomicBool::new(true);
        let reports = campaign.run(
            &tx,
            addr(3),
            &["store".into()],
            overrides,
            &|_| false,
            &cancel,
        );
        assert!(reports.is_empty());
    }

    #[test]
    fn unknown_target_function_is_skipped() {
        let (campaign, tx, overrides) = setup(vec![1]);
        let cancel = AtomicBool::new(false);
        let reports = campaign.run(
            &tx,
            addr(3),
            &["missing".into()],
            overrides,
            &|_| true,
            &cancel,
        );
        assert!(reports.is_empty());
    }
}
