use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::evm::abi::SeedValue;
use crate::evm::types::{parse_word, EVMU256};

/// Inclusive value range for a constrained parameter.
#[derive(Clone, Debug, PartialEq)]
pub struct ValueRange {
    pub min: EVMU256,
    pub max: EVMU256,
}

impl ValueRange {
    pub fn midpoint(&self) -> EVMU256 {
        self.min + (self.max - self.min) / EVMU256::from(2u64)
    }
}

/// Per-(function, parameter) constraint from project config. Attack values
/// are tried before the range endpoints.
#[derive(Clone, Debug, Default)]
pub struct ConstraintRange {
    pub attack_values: Vec<SeedValue>,
    pub range: Option<ValueRange>,
    pub mutation_strategy: Option<String>,
    pub confidence: f64,
}

/// Weight mix used when blending generated parameter vectors.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MutationWeights {
    pub seed: u32,
    pub random: u32,
    pub boundary: u32,
}

impl Default for MutationWeights {
    fn default() -> Self {
        Self {
            seed: 60,
            random: 20,
            boundary: 20,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RangeMutationConfig {
    pub percents: Vec<u32>,
}

impl Default for RangeMutationConfig {
    fn default() -> Self {
        Self {
            percents: vec![1, 5, 10, 50, 100],
        }
    }
}

/// Seed configuration of a protected contract. JSON keys for parameter
/// indices arrive as strings; values are loosely typed and parsed into
/// [`SeedValue`]s on load.
#[derive(Clone, Debug, Default)]
pub struct SeedConfig {
    pub enabled: bool,
    /// param index -> concrete seed values
    pub attack_seeds: HashMap<usize, Vec<SeedValue>>,
    /// lowercased function name -> param index -> constraint
    pub constraint_ranges: HashMap<String, HashMap<usize, ConstraintRange>>,
    pub range_mutation: RangeMutationConfig,
    pub weights: MutationWeights,
}

impl SeedConfig {
    pub fn from_value(v: &serde_json::Value) -> Self {
        let mut config = SeedConfig {
            enabled: v.get("enabled").and_then(|e| e.as_bool()).unwrap_or(true),
            ..Default::default()
        };

        if let Some(seeds) = v.get("attack_seeds").and_then(|s| s.as_object()) {
            for (idx, values) in seeds {
                let Ok(idx) = idx.parse::<usize>() else { continue };
                let parsed = values
                    .as_array()
                    .map(|arr| arr.iter().filter_map(SeedValue::from_json).collect())
                    .unwrap_or_default();
                config.attack_seeds.insert(idx, parsed);
            }
        }

        if let Some(funcs) = v.get("constraint_ranges").and_then(|s| s.as_object()) {
            for (func, params) in funcs {
                let Some(params) = params.as_object() else { continue };
                let mut per_param = HashMap::new();
                for (idx, constraint) in params {
                    let Ok(idx) = idx.parse::<usize>() else { continue };
                    per_param.insert(idx, Self::parse_constraint(constraint));
                }
                config
                    .constraint_ranges
                    .insert(func.to_lowercase(), per_param);
            }
        }

        if let Some(range_cfg) = v.get("range_mutation_config") {
            if let Ok(parsed) = serde_json::from_value(range_cfg.clone()) {
                config.range_mutation = parsed;
            }
        }
        if let Some(weights) = v.get("weights") {
            if let Ok(parsed) = serde_json::from_value(weights.clone()) {
                config.weights = parsed;
            }
        }
        config
    }

    fn parse_constraint(v: &serde_json::Value) -> ConstraintRange {
        let attack_values = v
            .get("attack_values")
            .and_then(|a| a.as_array())
            .map(|arr| arr.iter().filter_map(SeedValue::from_json).collect())
            .unwrap_or_default();
        let range = v.get("range").and_then(|r| {
            let min = r.get("min").and_then(|m| m.as_str()).and_then(parse_word)?;
            let max = r.get("max").and_then(|m| m.as_str()).and_then(parse_word)?;
            Some(ValueRange { min, max })
        });
        ConstraintRange {
            attack_values,
            range,
            mutation_strategy: v
                .get("mutation_strategy")
                .and_then(|s| s.as_str())
                .map(|s| s.to_string()),
            confidence: v.get("confidence").and_then(|c| c.as_f64()).unwrap_or(0.0),
        }
    }

    pub fn constraint_for(&self, func_name: &str, param: usize) -> Option<&ConstraintRange> {
        self.constraint_ranges
            .get(&func_name.to_lowercase())?
            .get(&param)
    }
}

/// Project-level fuzzing configuration. Two shapes ship in the wild: the
/// legacy `{enabled, iterations, timeout}` triple and the extended one
/// below. Legacy keys are accepted as aliases; extended fields win.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FuzzingConfig {
    pub enabled: bool,
    pub workers: usize,
    #[serde(alias = "timeout")]
    pub timeout_seconds: u64,
    #[serde(alias = "iterations")]
    pub max_iterations: usize,
    pub auto_trigger: bool,
    pub pool_size: usize,
    pub max_pools: usize,
    pub trace_settle_seconds: u64,
    pub seed: u64,
    /// contract address (0x hex) -> function names eligible for fuzzing
    pub target_functions: HashMap<String, Vec<String>>,
}

impl Default for FuzzingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: 20,
            timeout_seconds: 20,
            max_iterations: 256,
            auto_trigger: false,
            pool_size: 64,
            max_pools: 256,
            trace_settle_seconds: 15,
            seed: 0,
            target_functions: HashMap::new(),
        }
    }
}

impl FuzzingConfig {
    /// Campaign wall-clock budget; the floor keeps short configs useful.
    pub fn campaign_budget_seconds(&self) -> u64 {
        self.timeout_seconds.max(20)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_config_from_loose_json() {
        let raw: serde_json::Value = serde_json::from_str(
            r#"{
                "enabled": true,
                "attack_seeds": {"0": ["0xde0b6b3a7640000", 5], "2": [true]},
                "constraint_ranges": {
                    "Swap": {"1": {"attack_values": [1],
                                    "range": {"min": "0x0", "max": "0x64"},
                                    "mutation_strategy": "boundary",
                                    "confidence": 0.8}}
                }
            }"#,
        )
        .unwrap();
        let config = SeedConfig::from_value(&raw);
        assert_eq!(config.attack_seeds[&0].len(), 2);
        assert_eq!(config.attack_seeds[&2], vec![SeedValue::Bool(true)]);
        // function keys are lowercased on load
        let constraint = config.constraint_for("swap", 1).unwrap();
        assert_eq!(
            constraint.range.as_ref().unwrap().max,
            EVMU256::from(100u64)
        );
        assert_eq!(constraint.range.as_ref().unwrap().midpoint(), EVMU256::from(50u64));
        assert!(config.constraint_for("swap", 0).is_none());
    }

    #[test]
    fn fuzzing_config_accepts_both_shapes() {
        let legacy: FuzzingConfig =
            serde_json::from_str(r#"{"enabled": true, "timeout": 5, "iterations": 10}"#).unwrap();
        assert_eq!(legacy.timeout_seconds, 5);
        assert_eq!(legacy.max_iterations, 10);
        assert_eq!(legacy.campaign_budget_seconds(), 20);

        let extended: FuzzingConfig = serde_json::from_str(
            r#"{"enabled": true, "workers": 4, "timeout_seconds": 45,
                "target_functions": {"0xabc": ["swap"]}}"#,
        )
        .unwrap();
        assert_eq!(extended.workers, 4);
        assert_eq!(extended.campaign_budget_seconds(), 45);
    }
}
