use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use revm_interpreter::opcode::JUMPDEST;
use revm_interpreter::Interpreter;

use crate::evm::middlewares::middleware::{Middleware, MiddlewareType};
use crate::evm::types::EVMAddress;

/// Records the `(contract, pc)` pair of every JUMPDEST reached during an
/// execution. With a non-empty protected set, recording arms only once the
/// executing scope first enters a protected address; from then on every
/// JUMPDEST is kept. The trace is the structural similarity signal between
/// the original and mutated executions.
#[derive(Clone, Default)]
pub struct JumpdestCollector {
    records: Arc<Mutex<Vec<(EVMAddress, usize)>>>,
    recording: bool,
    protected: HashSet<EVMAddress>,
}

impl JumpdestCollector {
    pub fn new() -> Self {
        Self {
            records: Arc::new(Mutex::new(Vec::new())),
            recording: true,
            protected: HashSet::new(),
        }
    }

    /// Clear the trace and re-arm the protected gate.
    pub fn reset_with_protected(&mut self, addrs: &[EVMAddress]) {
        self.records.lock().unwrap().clear();
        self.protected = addrs.iter().copied().collect();
        self.recording = self.protected.is_empty();
    }

    pub fn records(&self) -> Vec<(EVMAddress, usize)> {
        self.records.lock().unwrap().clone()
    }

    pub fn handle(&self) -> Arc<Mutex<Vec<(EVMAddress, usize)>>> {
        self.records.clone()
    }
}

impl Middleware for JumpdestCollector {
    unsafe fn on_step(&mut self, interp: &mut Interpreter, _depth: usize) {
        let scope = interp.contract.address;
        if !self.recording {
            if !self.protected.contains(&scope) {
                return;
            }
            self.recording = true;
        }
        if *interp.instruction_pointer == JUMPDEST {
            self.records
                .lock()
                .unwrap()
                .push((scope, interp.program_counter()));
        }
    }

    fn get_type(&self) -> MiddlewareType {
        MiddlewareType::JumpdestCollector
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(b: u8) -> EVMAddress {
        EVMAddress::from_slice(&[b; 20])
    }

    #[test]
    fn gate_arms_on_first_protected_scope() {
        let mut collector = JumpdestCollector::new();
        collector.reset_with_protected(&[addr(2)]);
        assert!(!collector.recording);
        assert!(collector.records().is_empty());

        collector.reset_with_protected(&[]);
        assert!(collector.recording);
    }
}
