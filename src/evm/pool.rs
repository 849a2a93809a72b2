use std::collections::HashMap;
use std::time::SystemTime;

use ethers_core::abi::{Function, ParamType, Token};
use tracing::debug;

use crate::evm::abi::typed_zero;
use crate::evm::config::SeedConfig;
use crate::evm::types::{address_to_hex, EVMAddress};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no pool for {contract} selector {selector}")]
    PoolNotFound { contract: String, selector: String },
    #[error("empty pool for {contract} selector {selector}")]
    EmptyPool { contract: String, selector: String },
}

/// Produces a parameter value when neither constraints nor seeds apply.
/// Implemented by the strategy engine; `seed` is the pool position, which
/// keeps generation deterministic per campaign.
pub trait ParamGenerator: Send + Sync {
    fn generate(&self, ty: &ParamType, original: Option<&Token>, seed: u64) -> Option<Token>;
}

pub type PoolKey = (EVMAddress, [u8; 4]);

/// A pre-built FIFO of parameter vectors served round-robin.
#[derive(Clone, Debug)]
pub struct ParamPool {
    pub params: Vec<Vec<Token>>,
    pub current_idx: usize,
    pub generated_at: SystemTime,
    pub access_count: u64,
}

#[derive(Clone, Debug, Default)]
pub struct PoolStats {
    pub total_pools: usize,
    pub total_params: usize,
    pub avg_pool_size: f64,
    pub hits: u64,
    pub misses: u64,
}

/// Pre-generates and round-robins per-(contract, selector) parameter
/// vectors. Bounded by an LRU over pool keys; evicting a key drops its pool
/// and rolls its size out of the stats.
pub struct PoolManager {
    pools: HashMap<PoolKey, ParamPool>,
    lru: Vec<PoolKey>,
    max_pools: usize,
    generator: Option<Box<dyn ParamGenerator>>,
    stats: PoolStats,
}

impl PoolManager {
    pub fn new(max_pools: usize) -> Self {
        Self {
            pools: HashMap::new(),
            lru: Vec::new(),
            max_pools: max_pools.max(1),
            generator: None,
            stats: PoolStats::default(),
        }
    }

    pub fn attach_generator(&mut self, generator: Box<dyn ParamGenerator>) {
        self.generator = Some(generator);
    }

    /// Build one parameter vector for pool position `position`.
    fn build_vector(
        &self,
        method: &Function,
        seed_config: Option<&SeedConfig>,
        position: usize,
    ) -> Vec<Token> {
        method
            .inputs
            .iter()
            .enumerate()
            .map(|(j, param)| {
                if let Some(config) = seed_config {
                    if let Some(constraint) = config.constraint_for(&method.name, j) {
                        // attack values first, then min / max / midpoint,
                        // cycled by pool position
                        let mut candidates: Vec<Token> = constraint
                            .attack_values
                            .iter()
                            .filter_map(|v| v.coerce(&param.kind))
                            .collect();
                        if let Some(range) = &constraint.range {
                            for word in [range.min, range.max, range.midpoint()] {
                                if let Some(token) =
                                    crate::evm::abi::SeedValue::Int(word).coerce(&param.kind)
                                {
                                    candidates.push(token);
                                }
                            }
                        }
                        if !candidates.is_empty() {
                            return candidates[position % candidates.len()].clone();
                        }
                    }
                    if let Some(seeds) = config.attack_seeds.get(&j) {
                        let coerced: Vec<Token> = seeds
                            .iter()
                            .filter_map(|v| v.coerce(&param.kind))
                            .collect();
                        if !coerced.is_empty() {
                            return coerced[position % coerced.len()].clone();
                        }
                    }
                }
                if let Some(generator) = &self.generator {
                    if let Some(token) = generator.generate(&param.kind, None, position as u64) {
                        return token;
                    }
                }
                typed_zero(&param.kind)
            })
            .collect()
    }

    pub fn generate_pool(
        &mut self,
        contract: EVMAddress,
        method: &Function,
        seed_config: Option<&SeedConfig>,
        pool_size: usize,
    ) {
        let key = (contract, crate::evm::abi::selector(method));
        // regenerating an existing pool resets its stats contribution
        if let Some(old) = self.pools.remove(&key) {
            self.stats.total_pools -= 1;
            self.stats.total_params -= old.params.len();
        }

        let params: Vec<Vec<Token>> = (0..pool_size.max(1))
            .map(|position| self.build_vector(method, seed_config, position))
            .collect();

        self.stats.total_pools += 1;
        self.stats.total_params += params.len();
        self.stats.avg_pool_size =
            self.stats.total_params as f64 / self.stats.total_pools.max(1) as f64;
        debug!(
            contract = %address_to_hex(contract),
            method = %method.name,
            size = params.len(),
            "generated parameter pool"
        );

        self.pools.insert(
            key,
            ParamPool {
                params,
                current_idx: 0,
                generated_at: SystemTime::now(),
                access_count: 0,
            },
        );
        self.touch(key);
        self.evict_over_capacity();
    }

    fn touch(&mut self, key: PoolKey) {
        self.lru.retain(|k| *k != key);
        self.lru.push(key);
    }

    fn evict_over_capacity(&mut self) {
        while self.lru.len() > self.max_pools {
            let victim = self.lru.remove(0);
            if let Some(pool) = self.pools.remove(&victim) {
                self.stats.total_pools -= 1;
                self.stats.total_params -= pool.params.len();
                self.stats.avg_pool_size = if self.stats.total_pools == 0 {
                    0.0
                } else {
                    self.stats.total_params as f64 / self.stats.total_pools as f64
                };
            }
        }
    }

    /// Next vector for the key, advancing the round-robin cursor.
    pub fn get_pooled_params(
        &mut self,
        contract: EVMAddress,
        selector: [u8; 4],
    ) -> Result<Vec<Token>, PoolError> {
        let key = (contract, selector);
        let Some(pool) = self.pools.get_mut(&key) else {
            self.stats.misses += 1;
            return Err(PoolError::PoolNotFound {
                contract: address_to_hex(contract),
                selector: format!("0x{}", hex::encode(selector)),
            });
        };
        if pool.params.is_empty() {
            self.stats.misses += 1;
            return Err(PoolError::EmptyPool {
                contract: address_to_hex(contract),
                selector: format!("0x{}", hex::encode(selector)),
            });
        }
        let vector = pool.params[pool.current_idx].clone();
        pool.current_idx = (pool.current_idx + 1) % pool.params.len();
        pool.access_count += 1;
        self.stats.hits += 1;
        self.touch(key);
        Ok(vector)
    }

    pub fn invalidate_pool(&mut self, contract: EVMAddress, selector: [u8; 4]) {
        let key = (contract, selector);
        if let Some(pool) = self.pools.remove(&key) {
            self.lru.retain(|k| *k != key);
            self.stats.total_pools -= 1;
            self.stats.total_params -= pool.params.len();
            self.stats.avg_pool_size = if self.stats.total_pools == 0 {
                0.0
            } else {
                self.stats.total_params as f64 / self.stats.total_pools as f64
            };
        }
    }

    pub fn has_pool(&self, contract: EVMAddress, selector: [u8; 4]) -> bool {
        self.pools.contains_key(&(contract, selector))
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }
}
