use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use once_cell::sync::Lazy;
use revm_interpreter::{
    CallInputs, Contract, CreateInputs, Gas, Host, InstructionResult, Interpreter,
    SelfDestructResult,
};
use revm_primitives::{Bytecode, CreateScheme, Env, LatestSpec, B256, U256};
use tracing::debug;

use crate::evm::middlewares::middleware::{CallCtx, Middleware};
use crate::evm::state::StateAdapter;
use crate::evm::types::{EVMAddress, EVMU256};

pub const CALL_STACK_LIMIT: usize = 1024;
/// Generous per-frame gas ceiling; campaigns care about semantics, not
/// metering.
pub const FRAME_GAS_LIMIT: u64 = 1e10 as u64;

/// Addresses of the standard precompiled contracts, pre-warmed by
/// `prepare` and short-circuited on CALL.
pub static PRECOMPILE_ADDRESSES: Lazy<Vec<EVMAddress>> = Lazy::new(|| {
    (1u8..=9)
        .map(|b| {
            let mut addr = [0u8; 20];
            addr[19] = b;
            EVMAddress::from_slice(&addr)
        })
        .collect()
});

#[derive(Clone, Debug)]
pub struct LogEntry {
    pub address: EVMAddress,
    pub topics: Vec<B256>,
    pub data: Vec<u8>,
}

/// The execution host: owns the state adapter and dispatches the CALL
/// family through the registered middlewares. One host serves one
/// execution.
pub struct FuzzHost {
    pub env: Env,
    pub state: StateAdapter,
    pub logs: Vec<LogEntry>,
    middlewares: Vec<Rc<RefCell<dyn Middleware>>>,
    depth: usize,
    pub call_count: usize,
}

impl FuzzHost {
    pub fn new(env: Env, state: StateAdapter) -> Self {
        Self {
            env,
            state,
            logs: Vec::new(),
            middlewares: Vec::new(),
            depth: 0,
            call_count: 0,
        }
    }

    pub fn add_middleware(&mut self, middleware: Rc<RefCell<dyn Middleware>>) {
        self.middlewares.push(middleware);
    }

    fn is_precompile(address: EVMAddress) -> bool {
        PRECOMPILE_ADDRESSES.contains(&address)
    }

    fn run_interpreter(&mut self, contract: Contract, gas_limit: u64, is_static: bool)
        -> (InstructionResult, Gas, Bytes)
    {
        self.depth += 1;
        let mut interp = Interpreter::new(contract, gas_limit, is_static);
        let ret = interp.run_inspect::<Self, LatestSpec>(self);
        self.depth -= 1;
        let output = interp.return_value();
        (ret, interp.gas, output)
    }

    fn create_address(&mut self, inputs: &CreateInputs) -> EVMAddress {
        match inputs.scheme {
            CreateScheme::Create => {
                let nonce = self.state.get_nonce(inputs.caller);
                let mut stream = rlp::RlpStream::new_list(2);
                stream.append(&inputs.caller.0.as_ref());
                stream.append(&nonce);
                let hash = revm_primitives::keccak256(&stream.out());
                EVMAddress::from_slice(&hash[12..])
            }
            CreateScheme::Create2 { salt } => {
                let code_hash = revm_primitives::keccak256(&inputs.init_code);
                let mut preimage = Vec::with_capacity(85);
                preimage.push(0xff);
                preimage.extend_from_slice(inputs.caller.as_bytes());
                preimage.extend_from_slice(&salt.to_be_bytes::<32>());
                preimage.extend_from_slice(code_hash.as_bytes());
                let hash = revm_primitives::keccak256(&preimage);
                EVMAddress::from_slice(&hash[12..])
            }
        }
    }
}

fn is_success(ret: InstructionResult) -> bool {
    matches!(
        ret,
        InstructionResult::Return | InstructionResult::Stop | InstructionResult::SelfDestruct
    )
}

impl Host for FuzzHost {
    fn step(&mut self, interp: &mut Interpreter, _is_static: bool) -> InstructionResult {
        let middlewares = self.middlewares.clone();
        for middleware in middlewares {
            unsafe {
                middleware.borrow_mut().on_step(interp, self.depth);
            }
        }
        InstructionResult::Continue
    }

    fn step_end(
        &mut self,
        _interp: &mut Interpreter,
        _is_static: bool,
        _ret: InstructionResult,
    ) -> InstructionResult {
        InstructionResult::Continue
    }

    fn env(&mut self) -> &mut Env {
        &mut self.env
    }

    fn load_account(&mut self, address: EVMAddress) -> Option<(bool, bool)> {
        let cold = !self.state.warm_address(address);
        Some((cold, self.state.exists(address)))
    }

    fn block_hash(&mut self, number: U256) -> Option<B256> {
        // no ancestry locally; a stable pseudo-hash keeps BLOCKHASH total
        Some(revm_primitives::keccak256(&number.to_be_bytes::<32>()))
    }

    fn balance(&mut self, address: EVMAddress) -> Option<(U256, bool)> {
        let cold = !self.state.warm_address(address);
        Some((self.state.get_balance(address), cold))
    }

    fn code(&mut self, address: EVMAddress) -> Option<(Bytecode, bool)> {
        let cold = !self.state.warm_address(address);
        Some((self.state.get_code(address), cold))
    }

    fn code_hash(&mut self, address: EVMAddress) -> Option<(B256, bool)> {
        let cold = !self.state.warm_address(address);
        Some((self.state.get_code_hash(address), cold))
    }

    fn sload(&mut self, address: EVMAddress, index: U256) -> Option<(U256, bool)> {
        let cold = !self.state.warm_slot(address, index);
        Some((self.state.get_storage(address, index), cold))
    }

    fn sstore(
        &mut self,
        address: EVMAddress,
        index: U256,
        value: U256,
    ) -> Option<(U256, U256, U256, bool)> {
        let cold = !self.state.warm_slot(address, index);
        let present = self.state.get_storage(address, index);
        self.state.set_storage(address, index, value);
        let original = self
            .state
            .changes()
            .get(&address)
            .and_then(|slots| slots.get(&index))
            .map(|change| change.before)
            .unwrap_or(present);
        Some((original, present, value, cold))
    }

    fn log(&mut self, address: EVMAddress, topics: Vec<B256>, data: Bytes) {
        self.logs.push(LogEntry {
            address,
            topics,
            data: data.to_vec(),
        });
    }

    fn selfdestruct(&mut self, address: EVMAddress, target: EVMAddress) -> Option<SelfDestructResult> {
        Some(self.state.selfdestruct(address, target))
    }

    fn create(
        &mut self,
        inputs: &mut CreateInputs,
    ) -> (InstructionResult, Option<EVMAddress>, Gas, Bytes) {
        if self.depth >= CALL_STACK_LIMIT {
            return (
                InstructionResult::CallTooDeep,
                None,
                Gas::new(inputs.gas_limit),
                Bytes::new(),
            );
        }
        let created = self.create_address(inputs);
        let snapshot = self.state.snapshot();

        let caller_balance = self.state.get_balance(inputs.caller);
        if caller_balance < inputs.value {
            self.state.revert_to(snapshot);
            return (
                InstructionResult::OutOfFund,
                None,
                Gas::new(inputs.gas_limit),
                Bytes::new(),
            );
        }
        let caller_nonce = self.state.get_nonce(inputs.caller);
        self.state.set_nonce(inputs.caller, caller_nonce + 1);
        self.state.set_balance(inputs.caller, caller_balance - inputs.value);
        let created_balance = self.state.get_balance(created);
        self.state.set_balance(created, created_balance + inputs.value);
        self.state.mark_created(created);

        let contract = Contract::new(
            Bytes::new(),
            Bytecode::new_raw(inputs.init_code.clone()),
            created,
            inputs.caller,
            inputs.value,
        );
        let (ret, gas, output) = self.run_interpreter(contract, inputs.gas_limit, false);

        if ret == InstructionResult::Return {
            self.state.set_code(created, Bytecode::new_raw(output.clone()));
            self.state.discard_snapshot(snapshot);
            (InstructionResult::Return, Some(created), gas, output)
        } else {
            self.state.revert_to(snapshot);
            (ret, None, gas, output)
        }
    }

    fn call(&mut self, inputs: &mut CallInputs) -> (InstructionResult, Gas, Bytes) {
        self.call_count += 1;
        if self.depth >= CALL_STACK_LIMIT {
            return (
                InstructionResult::CallTooDeep,
                Gas::new(inputs.gas_limit),
                Bytes::new(),
            );
        }

        // middlewares observe every frame and may rewrite its calldata
        let ctx = CallCtx {
            scheme: inputs.context.scheme,
            caller: inputs.context.caller,
            target: inputs.contract,
            code_address: inputs.context.code_address,
            value: inputs.context.apparent_value,
            input: &inputs.input,
            gas_limit: inputs.gas_limit,
            depth: self.depth,
        };
        let middlewares = self.middlewares.clone();
        let mut replacement = None;
        for middleware in &middlewares {
            if let Some(rewritten) = middleware.borrow_mut().on_call(&ctx) {
                replacement = Some(rewritten);
                break;
            }
        }
        if let Some(rewritten) = replacement {
            inputs.input = Bytes::from(rewritten);
        }

        let depth = self.depth;
        let snapshot = self.state.snapshot();

        let value = inputs.transfer.value;
        if value != EVMU256::ZERO && inputs.transfer.source != inputs.transfer.target {
            let source_balance = self.state.get_balance(inputs.transfer.source);
            if source_balance < value {
                self.state.revert_to(snapshot);
                return (
                    InstructionResult::OutOfFund,
                    Gas::new(inputs.gas_limit),
                    Bytes::new(),
                );
            }
            self.state
                .set_balance(inputs.transfer.source, source_balance - value);
            let target_balance = self.state.get_balance(inputs.transfer.target);
            self.state
                .set_balance(inputs.transfer.target, target_balance + value);
        }

        let (ret, gas, output) = if Self::is_precompile(inputs.contract) {
            // precompiles are not executed locally; identity semantics keep
            // proxied pipelines alive, others return empty success
            let out = if inputs.contract == PRECOMPILE_ADDRESSES[3] {
                inputs.input.clone()
            } else {
                Bytes::new()
            };
            (InstructionResult::Return, Gas::new(inputs.gas_limit), out)
        } else {
            let bytecode = self.state.get_code(inputs.contract);
            if bytecode.is_empty() {
                (InstructionResult::Stop, Gas::new(inputs.gas_limit), Bytes::new())
            } else {
                let contract =
                    Contract::new_with_context(inputs.input.clone(), bytecode, &inputs.context);
                self.run_interpreter(contract, inputs.gas_limit, inputs.is_static)
            }
        };

        for middleware in &middlewares {
            middleware.borrow_mut().on_call_end(depth, ret, &output);
        }

        if is_success(ret) {
            self.state.discard_snapshot(snapshot);
        } else {
            debug!(depth, ret = ?ret, "frame failed, reverting to snapshot");
            self.state.revert_to(snapshot);
        }
        (ret, gas, output)
    }
}
