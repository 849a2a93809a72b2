use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use bytes::Bytes;
use revm_interpreter::{CallContext, CallInputs, CallScheme, Host, InstructionResult, Transfer};
use revm_primitives::{BlockEnv, CfgEnv, Env, SpecId, TransactTo, TxEnv, B256};

use crate::evm::host::{FuzzHost, LogEntry, FRAME_GAS_LIMIT, PRECOMPILE_ADDRESSES};
use crate::evm::middlewares::call_interceptor::CallInterceptor;
use crate::evm::middlewares::jumpdest::JumpdestCollector;
use crate::evm::state::{AccountState, SlotChange, StateAdapter, StateProvider};
use crate::evm::types::{EVMAddress, EVMU256};

/// Block-level context applied to every local execution.
#[derive(Clone, Debug)]
pub struct BlockContext {
    pub coinbase: EVMAddress,
    pub number: u64,
    pub timestamp: u64,
    pub basefee: EVMU256,
    pub prevrandao: B256,
    pub chain_id: u64,
    pub gas_limit: u64,
}

impl Default for BlockContext {
    fn default() -> Self {
        Self {
            coinbase: EVMAddress::zero(),
            number: 1,
            timestamp: 1_700_000_000,
            basefee: EVMU256::ZERO,
            prevrandao: B256::zero(),
            chain_id: 1,
            gas_limit: 30_000_000,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ExecutionResult {
    pub success: bool,
    pub return_data: Vec<u8>,
    pub gas_used: u64,
    pub contract_jumpdests: Vec<(EVMAddress, usize)>,
    pub state_changes: HashMap<EVMAddress, HashMap<EVMU256, SlotChange>>,
    pub logs: Vec<LogEntry>,
    pub error: Option<String>,
}

/// Drives the interpreter over an in-memory state override, with the
/// JUMPDEST collector and (optionally) the call interceptor attached.
/// Executions are deterministic for a fixed override, input and strategy
/// seed.
pub struct LocalEvmExecutor {
    block: BlockContext,
    protected: Vec<EVMAddress>,
    provider: Option<Arc<dyn StateProvider>>,
    collector: Rc<RefCell<JumpdestCollector>>,
    interceptor: Option<Rc<RefCell<CallInterceptor>>>,
}

impl LocalEvmExecutor {
    pub fn new(block: BlockContext) -> Self {
        Self {
            block,
            protected: Vec::new(),
            provider: None,
            collector: Rc::new(RefCell::new(JumpdestCollector::new())),
            interceptor: None,
        }
    }

    pub fn set_protected(&mut self, protected: Vec<EVMAddress>) {
        self.protected = protected;
    }

    pub fn attach_provider(&mut self, provider: Arc<dyn StateProvider>) {
        self.provider = Some(provider);
    }

    pub fn set_interceptor(&mut self, interceptor: Rc<RefCell<CallInterceptor>>) {
        self.interceptor = Some(interceptor);
    }

    pub fn interceptor(&self) -> Option<Rc<RefCell<CallInterceptor>>> {
        self.interceptor.clone()
    }

    fn build_env(&self, from: EVMAddress, to: EVMAddress, input: &[u8], value: EVMU256) -> Env {
        let mut cfg = CfgEnv::default();
        cfg.chain_id = EVMU256::from(self.block.chain_id);
        cfg.spec_id = SpecId::LATEST;
        Env {
            cfg,
            block: BlockEnv {
                number: EVMU256::from(self.block.number),
                coinbase: self.block.coinbase,
                timestamp: EVMU256::from(self.block.timestamp),
                difficulty: EVMU256::ZERO,
                prevrandao: Some(self.block.prevrandao),
                basefee: self.block.basefee,
                gas_limit: EVMU256::from(self.block.gas_limit),
            },
            tx: TxEnv {
                caller: from,
                gas_limit: FRAME_GAS_LIMIT,
                gas_price: self.block.basefee,
                gas_priority_fee: None,
                transact_to: TransactTo::Call(to),
                value,
                data: Bytes::from(input.to_vec()),
                chain_id: Some(self.block.chain_id),
                nonce: None,
                access_list: Vec::new(),
            },
        }
    }

    pub fn execute(
        &mut self,
        from: EVMAddress,
        to: EVMAddress,
        input: Vec<u8>,
        value: EVMU256,
        overrides: HashMap<EVMAddress, AccountState>,
    ) -> ExecutionResult {
        let mut state = StateAdapter::with_overrides(overrides);
        if let Some(provider) = &self.provider {
            state.attach_provider(provider.clone());
        }

        self.collector
            .borrow_mut()
            .reset_with_protected(&self.protected);
        if let Some(interceptor) = &self.interceptor {
            interceptor.borrow_mut().reset();
        }

        let env = self.build_env(from, to, &input, value);
        let mut host = FuzzHost::new(env, state);
        host.add_middleware(self.collector.clone());
        if let Some(interceptor) = &self.interceptor {
            host.add_middleware(interceptor.clone());
        }

        // top up the sender when the override does not fund the transfer
        if host.state.get_balance(from) < value {
            host.state.set_balance(from, value);
        }

        host.state.prepare(
            from,
            self.block.coinbase,
            Some(to),
            &PRECOMPILE_ADDRESSES,
            &[],
        );
        host.state.reset_changes();
        host.logs.clear();

        let mut call = CallInputs {
            contract: to,
            transfer: Transfer {
                source: from,
                target: to,
                value,
            },
            input: Bytes::from(input),
            gas_limit: FRAME_GAS_LIMIT,
            context: CallContext {
                address: to,
                caller: from,
                code_address: to,
                apparent_value: value,
                scheme: CallScheme::Call,
            },
            is_static: false,
        };
        let (ret, gas, output) = host.call(&mut call);
        host.state.finalize_destructs();

        let success = matches!(
            ret,
            InstructionResult::Return | InstructionResult::Stop | InstructionResult::SelfDestruct
        );
        ExecutionResult {
            success,
            return_data: output.to_vec(),
            gas_used: gas.spend(),
            contract_jumpdests: self.collector.borrow().records(),
            state_changes: host.state.changes().clone(),
            logs: host.logs.clone(),
            error: (!success).then(|| format!("{:?}", ret)),
        }
    }
}
