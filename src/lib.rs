pub mod config;
pub mod evm;
pub mod fuzz;
pub mod invariants;
pub mod monitor;
pub mod onchain;
pub mod rules;
