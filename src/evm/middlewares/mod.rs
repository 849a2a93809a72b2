pub mod call_interceptor;
pub mod jumpdest;
pub mod middleware;
