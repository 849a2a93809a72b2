use std::collections::HashMap;
use std::sync::RwLock;

use ethers_core::abi::{Function, ParamType, Token};

#[derive(Debug, thiserror::Error)]
pub enum MutationError {
    #[error("calldata shorter than selector: {0} bytes")]
    CalldataTooShort(usize),
    #[error("abi error: {0}")]
    Abi(#[from] ethers_core::abi::Error),
    #[error("abi encode error: {0}")]
    Encode(String),
}

/// A parameter-mutation strategy. Strategies are pure; any randomness is
/// seeded per campaign so repeated runs generate identical variations.
pub trait MutationStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn priority(&self) -> i32;
    fn applicable(&self, ty: &ParamType) -> bool;
    fn generate_variations(&self, original: Option<&Token>, ty: &ParamType, count: usize)
        -> Vec<Token>;
}

/// Rolling per-method mutation outcome record.
#[derive(Clone, Debug, Default)]
pub struct MutationHistory {
    pub samples: u64,
    pub avg_similarity: f64,
    pub best_similarity: f64,
    pub success_count: u64,
}

/// ABI-level calldata surgery plus the per-method history map. Stateless
/// apart from the history; safe to share behind an `Arc`.
pub struct MutationEngine {
    strategies: Vec<Box<dyn MutationStrategy>>,
    history: RwLock<HashMap<String, MutationHistory>>,
}

impl Default for MutationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MutationEngine {
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
            history: RwLock::new(HashMap::new()),
        }
    }

    /// Register a strategy; the list stays sorted by priority, descending.
    pub fn register_strategy(&mut self, strategy: Box<dyn MutationStrategy>) {
        self.strategies.push(strategy);
        self.strategies.sort_by_key(|s| std::cmp::Reverse(s.priority()));
    }

    pub fn get_strategies(&self) -> Vec<(&'static str, i32)> {
        self.strategies
            .iter()
            .map(|s| (s.name(), s.priority()))
            .collect()
    }

    pub fn strategies_for(&self, ty: &ParamType) -> Vec<&dyn MutationStrategy> {
        self.strategies
            .iter()
            .filter(|s| s.applicable(ty))
            .map(|s| s.as_ref())
            .collect()
    }

    /// Unpack calldata (selector included) into the method's input tokens.
    pub fn decode(&self, method: &Function, calldata: &[u8]) -> Result<Vec<Token>, MutationError> {
        if calldata.len() < 4 {
            return Err(MutationError::CalldataTooShort(calldata.len()));
        }
        Ok(method.decode_input(&calldata[4..])?)
    }

    /// ABI-pack args; returns the body only, no selector.
    pub fn encode(&self, _method: &Function, args: &[Token]) -> Vec<u8> {
        ethers_core::abi::encode(args)
    }

    /// Re-encode calldata with the pooled parameters, keeping the original
    /// 4-byte selector. The body length may differ from the original.
    pub fn mutate_calldata(
        &self,
        method: &Function,
        original: &[u8],
        pooled_params: &[Token],
    ) -> Result<Vec<u8>, MutationError> {
        if original.len() < 4 {
            return Err(MutationError::CalldataTooShort(original.len()));
        }
        let mut out = original[..4].to_vec();
        out.extend(self.encode(method, pooled_params));
        Ok(out)
    }

    pub fn update_history(&self, signature: &str, similarity: f64, success: bool) {
        let mut history = self.history.write().unwrap();
        let entry = history.entry(signature.to_string()).or_default();
        let n = entry.samples as f64;
        entry.avg_similarity = (entry.avg_similarity * n + similarity) / (n + 1.0);
        entry.best_similarity = entry.best_similarity.max(similarity);
        entry.samples += 1;
        if success {
            entry.success_count += 1;
        }
    }

    pub fn history_of(&self, signature: &str) -> Option<MutationHistory> {
        self.history.read().unwrap().get(signature).cloned()
    }
}
