use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use ethers_core::abi::ParamType;
use revm_interpreter::InstructionResult;
use tracing::{debug, warn};

use crate::evm::abi::canonical_signature;
use crate::evm::middlewares::middleware::{CallCtx, Middleware, MiddlewareType};
use crate::evm::mutation::MutationEngine;
use crate::evm::pool::PoolManager;
use crate::evm::registry::ProtectedRegistry;
use crate::evm::types::{address_to_hex, EVMAddress, EVMU256};

/// First CALL into a protected contract observed during an execution.
#[derive(Clone, Debug, PartialEq)]
pub struct FirstProtectedCall {
    pub caller: EVMAddress,
    pub target: EVMAddress,
    pub selector: [u8; 4],
    pub depth: usize,
}

/// One calldata rewrite applied during an execution, kept so the campaign
/// can tie the executed parameter vector to the execution outcome.
#[derive(Clone, Debug)]
pub struct AppliedMutation {
    pub target: EVMAddress,
    pub selector: [u8; 4],
    pub signature: String,
    pub params: Vec<ethers_core::abi::Token>,
}

#[derive(Clone, Debug)]
struct PendingCall {
    selector: Option<[u8; 4]>,
    input_len: usize,
    value: EVMU256,
}

/// Per-address replacement hook kept for projects that still ship their own
/// mutator; it runs before the pool-based rewrite and may short-circuit.
pub type LegacyMutator = Box<dyn Fn(&CallCtx) -> Option<Vec<u8>> + Send>;

/// Rewrites calldata of CALL/CALLCODE/DELEGATECALL/STATICCALL frames into
/// protected contracts using the registry, the parameter pool and the
/// mutation engine. Address-typed parameters are never fuzzed; the
/// originally supplied addresses are restored into the pooled vector.
pub struct CallInterceptor {
    registry: Arc<RwLock<ProtectedRegistry>>,
    pools: Arc<RwLock<PoolManager>>,
    engine: Arc<MutationEngine>,
    mutation_enabled: bool,

    first_protected_call: Option<FirstProtectedCall>,
    applied: Vec<AppliedMutation>,
    pending: Mutex<HashMap<usize, PendingCall>>,
    legacy_mutators: HashMap<EVMAddress, LegacyMutator>,
}

impl CallInterceptor {
    pub fn new(
        registry: Arc<RwLock<ProtectedRegistry>>,
        pools: Arc<RwLock<PoolManager>>,
        engine: Arc<MutationEngine>,
        mutation_enabled: bool,
    ) -> Self {
        Self {
            registry,
            pools,
            engine,
            mutation_enabled,
            first_protected_call: None,
            applied: Vec::new(),
            pending: Mutex::new(HashMap::new()),
            legacy_mutators: HashMap::new(),
        }
    }

    pub fn register_legacy_mutator(&mut self, address: EVMAddress, mutator: LegacyMutator) {
        self.legacy_mutators.insert(address, mutator);
    }

    pub fn reset(&mut self) {
        self.first_protected_call = None;
        self.applied.clear();
        self.pending.lock().unwrap().clear();
    }

    pub fn first_protected_call(&self) -> Option<&FirstProtectedCall> {
        self.first_protected_call.as_ref()
    }

    pub fn take_applied(&mut self) -> Vec<AppliedMutation> {
        std::mem::take(&mut self.applied)
    }

    fn mutate(&mut self, ctx: &CallCtx, selector: [u8; 4]) -> Option<Vec<u8>> {
        let registry = self.registry.read().unwrap();
        // unknown selectors pass through untouched
        let method = match registry.get_method(ctx.target, selector) {
            Ok(method) => method.clone(),
            Err(_) => return None,
        };
        drop(registry);

        let pooled = match self
            .pools
            .write()
            .unwrap()
            .get_pooled_params(ctx.target, selector)
        {
            Ok(params) => params,
            Err(e) => {
                debug!(error = %e, "no pooled params, passing calldata through");
                return None;
            }
        };

        let original_tokens = match self.engine.decode(&method, ctx.input) {
            Ok(tokens) => tokens,
            Err(e) => {
                debug!(error = %e, "original calldata does not decode, passing through");
                return None;
            }
        };

        let mut params = pooled;
        if params.len() != method.inputs.len() {
            warn!(
                target = %address_to_hex(ctx.target),
                "pool vector arity mismatch, passing through"
            );
            return None;
        }
        for (i, input) in method.inputs.iter().enumerate() {
            if matches!(input.kind, ParamType::Address) {
                params[i] = original_tokens[i].clone();
            }
        }

        match self.engine.mutate_calldata(&method, ctx.input, &params) {
            Ok(mutated) => {
                self.applied.push(AppliedMutation {
                    target: ctx.target,
                    selector,
                    signature: canonical_signature(&method),
                    params,
                });
                Some(mutated)
            }
            Err(e) => {
                warn!(error = %e, "mutation failed, passing calldata through");
                None
            }
        }
    }
}

/// Best-effort `Error(string)` revert reason decoding.
pub fn decode_revert_string(data: &[u8]) -> Option<String> {
    const ERROR_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];
    if data.len() < 4 + 32 + 32 || data[..4] != ERROR_SELECTOR {
        return None;
    }
    let tokens = ethers_core::abi::decode(&[ParamType::String], &data[4..]).ok()?;
    match tokens.into_iter().next() {
        Some(ethers_core::abi::Token::String(s)) => Some(s),
        _ => None,
    }
}

impl Middleware for CallInterceptor {
    fn on_call(&mut self, ctx: &CallCtx) -> Option<Vec<u8>> {
        let selector: Option<[u8; 4]> = ctx.input.get(..4).map(|s| s.try_into().unwrap());

        if self.first_protected_call.is_none() {
            if let Some(selector) = selector {
                if self.registry.read().unwrap().is_protected(ctx.target) {
                    self.first_protected_call = Some(FirstProtectedCall {
                        caller: ctx.caller,
                        target: ctx.target,
                        selector,
                        depth: ctx.depth,
                    });
                }
            }
        }

        self.pending.lock().unwrap().insert(
            ctx.depth,
            PendingCall {
                selector,
                input_len: ctx.input.len(),
                value: ctx.value,
            },
        );

        if let Some(mutator) = self.legacy_mutators.get(&ctx.target) {
            if let Some(replacement) = mutator(ctx) {
                return Some(replacement);
            }
        }

        if !self.mutation_enabled || !self.registry.read().unwrap().is_protected(ctx.target) {
            return None;
        }
        self.mutate(ctx, selector?)
    }

    fn on_call_end(&mut self, depth: usize, ret: InstructionResult, ret_data: &[u8]) {
        let pending = self.pending.lock().unwrap().remove(&depth);
        if ret != InstructionResult::Revert {
            return;
        }
        let Some(pending) = pending else { return };
        let reason = decode_revert_string(ret_data).unwrap_or_default();
        debug!(
            depth,
            selector = ?pending.selector.map(hex::encode),
            input_len = pending.input_len,
            value = %pending.value,
            reason = %reason,
            "intercepted call reverted"
        );
    }

    fn get_type(&self) -> MiddlewareType {
        MiddlewareType::CallInterceptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evm::abi::{selector, selector_of};
    use crate::evm::config::SeedConfig;
    use crate::evm::registry::ProtectedContractInfo;
    use crate::evm::abi::SeedValue;
    use crate::evm::types::EVMU256;
    use ethers_core::abi::Token;
    use ethers_core::types::U256;
    use primitive_types::H160;
    use revm_interpreter::CallScheme;

    fn registry_with_swap(addr: EVMAddress) -> (Arc<RwLock<ProtectedRegistry>>, ethers_core::abi::Function) {
        let json = r#"[{"type":"function","name":"swap","inputs":[
            {"name":"amount","type":"uint256"},{"name":"to","type":"address"}],
            "outputs":[],"stateMutability":"nonpayable"}]"#;
        let abi: ethers_core::abi::Abi = serde_json::from_str(json).unwrap();
        let method = abi.functions().next().unwrap().clone();
        let mut registry = ProtectedRegistry::new();
        registry
            .register(ProtectedContractInfo {
                address: addr,
                name: "pool".into(),
                abi,
                seed_config: None,
                metadata: HashMap::new(),
            })
            .unwrap();
        (Arc::new(RwLock::new(registry)), method)
    }

    fn interceptor_for(
        addr: EVMAddress,
    ) -> (CallInterceptor, ethers_core::abi::Function, Arc<MutationEngine>) {
        let (registry, method) = registry_with_swap(addr);
        let mut pools = PoolManager::new(8);
        let mut config = SeedConfig {
            enabled: true,
            ..Default::default()
        };
        config
            .attack_seeds
            .insert(0, vec![SeedValue::Int(EVMU256::from(777u64))]);
        pools.generate_pool(addr, &method, Some(&config), 2);
        let engine = Arc::new(MutationEngine::new());
        let interceptor = CallInterceptor::new(
            registry,
            Arc::new(RwLock::new(pools)),
            engine.clone(),
            true,
        );
        (interceptor, method, engine)
    }

    #[test]
    fn rewrites_value_params_but_restores_addresses() {
        let target = EVMAddress::from_slice(&[3; 20]);
        let (mut interceptor, method, engine) = interceptor_for(target);

        let original_to = H160::from_low_u64_be(0xabcd);
        let mut input = selector(&method).to_vec();
        input.extend(ethers_core::abi::encode(&[
            Token::Uint(U256::from(5u64)),
            Token::Address(original_to),
        ]));

        let ctx = CallCtx {
            scheme: CallScheme::Call,
            caller: EVMAddress::from_slice(&[1; 20]),
            target,
            code_address: target,
            value: EVMU256::ZERO,
            input: &input,
            gas_limit: 1_000_000,
            depth: 1,
        };
        let mutated = interceptor.on_call(&ctx).expect("rewrite expected");
        let tokens = engine.decode(&method, &mutated).unwrap();
        assert_eq!(tokens[0], Token::Uint(U256::from(777u64)));
        // addresses are not fuzzed
        assert_eq!(tokens[1], Token::Address(original_to));

        let first = interceptor.first_protected_call().unwrap();
        assert_eq!(first.target, target);
        assert_eq!(first.selector, selector(&method));
        assert_eq!(interceptor.take_applied().len(), 1);
    }

    #[test]
    fn unknown_selector_passes_through() {
        let target = EVMAddress::from_slice(&[3; 20]);
        let (mut interceptor, _, _) = interceptor_for(target);
        let input = selector_of("unknown()").to_vec();
        let ctx = CallCtx {
            scheme: CallScheme::Call,
            caller: EVMAddress::from_slice(&[1; 20]),
            target,
            code_address: target,
            value: EVMU256::ZERO,
            input: &input,
            gas_limit: 1_000_000,
            depth: 1,
        };
        assert!(interceptor.on_call(&ctx).is_none());
    }

    #[test]
    fn legacy_mutator_short_circuits() {
        let target = EVMAddress::from_slice(&[3; 20]);
        let (mut interceptor, method, _) = interceptor_for(target);
        interceptor.register_legacy_mutator(target, Box::new(|_| Some(vec![0xde, 0xad])));

        let mut input = selector(&method).to_vec();
        input.extend(ethers_core::abi::encode(&[
            Token::Uint(U256::from(5u64)),
            Token::Address(H160::zero()),
        ]));
        let ctx = CallCtx {
            scheme: CallScheme::Call,
            caller: EVMAddress::from_slice(&[1; 20]),
            target,
            code_address: target,
            value: EVMU256::ZERO,
            input: &input,
            gas_limit: 1_000_000,
            depth: 1,
        };
        assert_eq!(interceptor.on_call(&ctx), Some(vec![0xde, 0xad]));
    }

    #[test]
    fn revert_string_decodes() {
        let mut data = vec![0x08, 0xc3, 0x79, 0xa0];
        data.extend(ethers_core::abi::encode(&[Token::String("nope".into())]));
        assert_eq!(decode_revert_string(&data), Some("nope".to_string()));
        assert_eq!(decode_revert_string(&[0x01, 0x02]), None);
    }
}
