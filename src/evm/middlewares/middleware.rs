use revm_interpreter::{CallScheme, InstructionResult, Interpreter};

use crate::evm::types::{EVMAddress, EVMU256};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MiddlewareType {
    JumpdestCollector,
    CallInterceptor,
}

/// Everything known about a CALL-family frame before it is dispatched.
/// Assembled by the host from the interpreter's stack and memory without
/// popping anything.
#[derive(Clone, Debug)]
pub struct CallCtx<'a> {
    pub scheme: CallScheme,
    pub caller: EVMAddress,
    pub target: EVMAddress,
    pub code_address: EVMAddress,
    pub value: EVMU256,
    pub input: &'a [u8],
    pub gas_limit: u64,
    pub depth: usize,
}

/// Observer/rewriter hooks invoked by the host. `on_call` may return a
/// replacement calldata for the frame; the first middleware that does so
/// wins.
pub trait Middleware {
    /// Called before every instruction. Unsafe: reads the raw instruction
    /// pointer of the interpreter.
    unsafe fn on_step(&mut self, _interp: &mut Interpreter, _depth: usize) {}

    fn on_call(&mut self, _ctx: &CallCtx) -> Option<Vec<u8>> {
        None
    }

    fn on_call_end(&mut self, _depth: usize, _ret: InstructionResult, _ret_data: &[u8]) {}

    fn get_type(&self) -> MiddlewareType;
}
