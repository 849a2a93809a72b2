use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::evm::abi::selector_of;
use crate::evm::types::EVMAddress;

/// Discrete values or an inclusive range discovered for one parameter.
/// Scalars are 32-byte big-endian words.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterSummary {
    pub param_index: usize,
    /// wire code: 0=uint256 1=int256 2=address 3=bool 4=bytes32 5=bytes 6=string
    pub param_type: u8,
    pub is_range: bool,
    #[serde(default)]
    pub single_values: Vec<[u8; 32]>,
    #[serde(default)]
    pub range_min: [u8; 32],
    #[serde(default)]
    pub range_max: [u8; 32],
    pub occurrence_count: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TermKind {
    Param,
    Slot,
}

/// One term of a linear expression rule.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExpressionTerm {
    pub kind: TermKind,
    #[serde(default)]
    pub param_index: usize,
    #[serde(default)]
    pub param_type: u8,
    #[serde(default)]
    pub slot: [u8; 32],
    pub coeff: i64,
}

/// Linear inequality over parameters and state slots, the compact on-chain
/// patch form: `sum(coeff_i * term_i) >= threshold / scale`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExpressionRule {
    pub contract: EVMAddress,
    pub function_sig: String,
    pub expression_type: String,
    pub terms: Vec<ExpressionTerm>,
    pub threshold: [u8; 32],
    pub scale: u64,
    pub confidence: f64,
    pub sample_count: u64,
    pub min_margin: [u8; 32],
    pub strategy: String,
    pub generated_at: u64,
}

impl ExpressionRule {
    /// Structural identity over every linear term; used for de-duping
    /// across reports.
    pub fn dedup_key(&self) -> String {
        let mut parts = vec![format!(
            "{:?}/{}/{}",
            self.contract, self.function_sig, self.expression_type
        )];
        for term in &self.terms {
            parts.push(format!(
                "{:?}:{}:{}:{}:{}",
                term.kind,
                term.param_index,
                term.param_type,
                hex::encode(term.slot),
                term.coeff
            ));
        }
        parts.join("|")
    }
}

/// Echo of a configured constraint range the campaign confirmed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConstraintRule {
    pub function: String,
    pub param_index: usize,
    pub range_min: [u8; 32],
    pub range_max: [u8; 32],
    pub confidence: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FuzzingStats {
    pub total_combinations: u64,
    pub valid_combinations: u64,
    pub avg_similarity: f64,
    pub max_similarity: f64,
    pub min_similarity: f64,
    /// raw vectors tried vs vectors overlapping the violating region
    pub raw_variants: u64,
    pub overlap_variants: u64,
}

/// Outcome of fuzzing one function within one transaction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FuzzingReport {
    pub project: String,
    pub contract: EVMAddress,
    pub selector: [u8; 4],
    /// canonical signature, e.g. `swap(uint256,address)`
    pub function_signature: String,
    pub stats: FuzzingStats,
    pub valid_parameters: Vec<ParameterSummary>,
    pub expression_rules: Vec<ExpressionRule>,
    #[serde(default)]
    pub constraint_rule: Option<ConstraintRule>,
    pub origin_tx_hash: String,
}

impl FuzzingReport {
    /// Selectors are canonical: whenever the carried selector disagrees
    /// with the keccak of the signature, the canonical one wins.
    pub fn normalize_selector(&mut self) {
        let canonical = selector_of(&self.function_signature);
        if self.selector != canonical {
            warn!(
                signature = %self.function_signature,
                carried = %hex::encode(self.selector),
                canonical = %hex::encode(canonical),
                "selector/signature mismatch, canonicalizing"
            );
            self.selector = canonical;
        }
    }

    pub fn has_findings(&self) -> bool {
        !self.valid_parameters.is_empty() || !self.expression_rules.is_empty()
    }
}
