pub mod abi;
pub mod config;
pub mod host;
pub mod middlewares;
pub mod mutation;
pub mod pool;
pub mod registry;
pub mod state;
pub mod strategies;
pub mod types;
pub mod vm;
