use std::collections::HashMap;
use std::sync::Arc;

use crate::evm::types::{parse_address, parse_word, EVMAddress, EVMU256};
use crate::invariants::detectors::{detect, raw_change, u256_to_f64};
use crate::invariants::types::ChainState;

#[derive(Debug, thiserror::Error)]
pub enum InvariantError {
    #[error("unknown invariant type: {0}")]
    UnknownTag(String),
    #[error("invariant {id}: bad parameters: {reason}")]
    BadParameters { id: String, reason: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvariantTag {
    Ratio,
    Threshold,
    Delta,
    FlashChangePrevention,
    Custom,
}

impl InvariantTag {
    pub fn parse(raw: &str) -> Result<Self, InvariantError> {
        match raw {
            "ratio" => Ok(Self::Ratio),
            "threshold" => Ok(Self::Threshold),
            "delta" => Ok(Self::Delta),
            "flash-change-prevention" | "flash_change_prevention" => {
                Ok(Self::FlashChangePrevention)
            }
            "custom" => Ok(Self::Custom),
            other => Err(InvariantError::UnknownTag(other.to_string())),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RatioParams {
    pub contract: EVMAddress,
    pub numerator_slot: EVMU256,
    pub denominator_slot: EVMU256,
    pub max_ratio: f64,
}

#[derive(Clone, Debug)]
pub struct ThresholdParams {
    pub contract: EVMAddress,
    pub slot: EVMU256,
    pub max: Option<EVMU256>,
    pub min: Option<EVMU256>,
}

#[derive(Clone, Debug)]
pub struct DeltaParams {
    pub contract: EVMAddress,
    pub slot: EVMU256,
    pub max_change: f64,
}

#[derive(Clone, Debug)]
pub struct FlashChangeParams {
    pub contract: EVMAddress,
    /// slot -> per-slot threshold; `None` falls back to the global one
    pub slots: Vec<(EVMU256, Option<f64>)>,
    pub threshold: f64,
}

#[derive(Clone, Debug)]
pub enum InvariantParams {
    Ratio(RatioParams),
    Threshold(ThresholdParams),
    Delta(DeltaParams),
    FlashChange(FlashChangeParams),
    Custom(serde_json::Value),
}

/// Violation payload produced by an evaluator; the registry stamps project
/// and transaction identity on top.
#[derive(Clone, Debug, Default)]
pub struct ViolationDetail {
    pub message: String,
    pub details: HashMap<String, String>,
}

pub type EvaluatorFn =
    Arc<dyn Fn(&Invariant, &ChainState) -> (bool, Option<ViolationDetail>) + Send + Sync>;

#[derive(Clone)]
pub struct Invariant {
    pub id: String,
    pub name: String,
    pub tag: InvariantTag,
    pub params: InvariantParams,
    pub contracts: Vec<EVMAddress>,
    /// project-specific replacement for the default evaluator
    pub evaluator: Option<EvaluatorFn>,
}

impl std::fmt::Debug for Invariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invariant")
            .field("id", &self.id)
            .field("tag", &self.tag)
            .field("custom_evaluator", &self.evaluator.is_some())
            .finish()
    }
}

fn param_contract(
    id: &str,
    parameters: &serde_json::Value,
    declared: &[EVMAddress],
) -> Result<EVMAddress, InvariantError> {
    if let Some(raw) = parameters.get("contract").and_then(|c| c.as_str()) {
        return parse_address(raw).ok_or_else(|| InvariantError::BadParameters {
            id: id.to_string(),
            reason: format!("bad contract address {raw}"),
        });
    }
    declared
        .first()
        .copied()
        .ok_or_else(|| InvariantError::BadParameters {
            id: id.to_string(),
            reason: "no contract bound".to_string(),
        })
}

fn param_slot(
    id: &str,
    parameters: &serde_json::Value,
    key: &str,
) -> Result<EVMU256, InvariantError> {
    let raw = parameters
        .get(key)
        .ok_or_else(|| InvariantError::BadParameters {
            id: id.to_string(),
            reason: format!("missing {key}"),
        })?;
    let parsed = match raw {
        serde_json::Value::Number(n) => n.as_u64().map(EVMU256::from),
        serde_json::Value::String(s) => parse_word(s),
        _ => None,
    };
    parsed.ok_or_else(|| InvariantError::BadParameters {
        id: id.to_string(),
        reason: format!("bad slot for {key}"),
    })
}

/// Parse the loose `parameters` bag into the typed per-tag shape; unknown
/// or missing required fields fail closed at load time.
pub fn parse_params(
    id: &str,
    tag: InvariantTag,
    parameters: &serde_json::Value,
    declared: &[EVMAddress],
) -> Result<InvariantParams, InvariantError> {
    match tag {
        InvariantTag::Ratio => Ok(InvariantParams::Ratio(RatioParams {
            contract: param_contract(id, parameters, declared)?,
            numerator_slot: param_slot(id, parameters, "numerator_slot")?,
            denominator_slot: param_slot(id, parameters, "denominator_slot")?,
            max_ratio: parameters
                .get("max_ratio")
                .and_then(|v| v.as_f64())
                .unwrap_or(f64::MAX),
        })),
        InvariantTag::Threshold => {
            let word = |key: &str| {
                parameters.get(key).and_then(|v| match v {
                    serde_json::Value::Number(n) => n.as_u64().map(EVMU256::from),
                    serde_json::Value::String(s) => parse_word(s),
                    _ => None,
                })
            };
            Ok(InvariantParams::Threshold(ThresholdParams {
                contract: param_contract(id, parameters, declared)?,
                slot: param_slot(id, parameters, "slot")?,
                max: word("max"),
                min: word("min"),
            }))
        }
        InvariantTag::Delta => Ok(InvariantParams::Delta(DeltaParams {
            contract: param_contract(id, parameters, declared)?,
            slot: param_slot(id, parameters, "slot")?,
            max_change: parameters
                .get("max_change")
                .and_then(|v| v.as_f64())
                .unwrap_or(f64::MAX),
        })),
        InvariantTag::FlashChangePrevention => {
            let mut slots = Vec::new();
            if let Some(map) = parameters.get("slots").and_then(|s| s.as_object()) {
                for (raw_slot, raw_threshold) in map {
                    let Some(slot) = parse_word(raw_slot) else {
                        return Err(InvariantError::BadParameters {
                            id: id.to_string(),
                            reason: format!("bad slot {raw_slot}"),
                        });
                    };
                    slots.push((slot, raw_threshold.as_f64()));
                }
            }
            Ok(InvariantParams::FlashChange(FlashChangeParams {
                contract: param_contract(id, parameters, declared)?,
                slots,
                threshold: parameters
                    .get("threshold")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.5),
            }))
        }
        InvariantTag::Custom => Ok(InvariantParams::Custom(parameters.clone())),
    }
}

/// Default evaluator dispatch. Evaluator failures (zero denominators,
/// missing contract state) pass; a spurious violation is worse than a
/// missed one.
pub fn evaluate_default(
    invariant: &Invariant,
    chain_state: &ChainState,
) -> (bool, Option<ViolationDetail>) {
    match &invariant.params {
        InvariantParams::Ratio(params) => {
            let state = chain_state.state_of(params.contract);
            let denominator = state.slot(params.denominator_slot);
            if denominator == EVMU256::ZERO {
                return (true, None);
            }
            let actual =
                u256_to_f64(state.slot(params.numerator_slot)) / u256_to_f64(denominator);
            if actual > params.max_ratio {
                return violation(format!(
                    "ratio {:.4} exceeds max {:.4}",
                    actual, params.max_ratio
                ));
            }
            (true, None)
        }
        InvariantParams::Threshold(params) => {
            let value = chain_state.state_of(params.contract).slot(params.slot);
            if let Some(max) = params.max {
                if value > max {
                    return violation(format!("value {value} above max {max}"));
                }
            }
            if let Some(min) = params.min {
                if value < min {
                    return violation(format!("value {value} below min {min}"));
                }
            }
            (true, None)
        }
        InvariantParams::Delta(params) => {
            let Some(previous) = chain_state.previous_state_of(params.contract) else {
                // first observation always passes
                return (true, None);
            };
            let old = previous.slot(params.slot);
            if old == EVMU256::ZERO {
                return (true, None);
            }
            let new = chain_state.state_of(params.contract).slot(params.slot);
            let diff = if new > old { new - old } else { old - new };
            let rate = u256_to_f64(diff) / u256_to_f64(old);
            if rate > params.max_change {
                return violation(format!(
                    "delta {:.4} exceeds max change {:.4}",
                    rate, params.max_change
                ));
            }
            (true, None)
        }
        InvariantParams::FlashChange(params) => {
            let Some(previous) = chain_state.previous_state_of(params.contract) else {
                return (true, None);
            };
            let current = chain_state.state_of(params.contract);
            for (slot, slot_threshold) in &params.slots {
                let threshold = slot_threshold.unwrap_or(params.threshold);
                let before = previous.slot(*slot);
                let after = current.slot(*slot);
                if before == after {
                    continue;
                }
                // packed layouts first so compound slots do not false-positive
                let changes = match detect(before) {
                    Some(detector) => detector.check_change(before, after, threshold),
                    None => vec![raw_change(before, after, threshold)],
                };
                for change in changes {
                    if change.violated {
                        let mut detail = ViolationDetail {
                            message: format!(
                                "{} change_rate {:.4} exceeds threshold {:.4} at slot {}",
                                change.field, change.change_rate, threshold, slot
                            ),
                            details: HashMap::new(),
                        };
                        detail
                            .details
                            .insert("field".to_string(), change.field.to_string());
                        detail.details.insert(
                            "change_rate".to_string(),
                            format!("{:.4}", change.change_rate),
                        );
                        detail.details.insert("slot".to_string(), slot.to_string());
                        return (false, Some(detail));
                    }
                }
            }
            (true, None)
        }
        // a custom invariant without a registered evaluator cannot judge
        InvariantParams::Custom(_) => (true, None),
    }
}

fn violation(message: String) -> (bool, Option<ViolationDetail>) {
    (
        false,
        Some(ViolationDetail {
            message,
            details: HashMap::new(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invariants::types::ContractState;

    fn addr(b: u8) -> EVMAddress {
        EVMAddress::from_slice(&[b; 20])
    }

    fn invariant(tag: InvariantTag, params: InvariantParams) -> Invariant {
        Invariant {
            id: "inv".into(),
            name: "inv".into(),
            tag,
            params,
            contracts: vec![addr(1)],
            evaluator: None,
        }
    }

    fn chain_state_with_slot(
        contract: EVMAddress,
        slot: u64,
        before: EVMU256,
        after: EVMU256,
    ) -> ChainState {
        let mut pre = ContractState {
            address: contract,
            ..Default::default()
        };
        pre.storage.insert(EVMU256::from(slot), before);
        let mut post = pre.clone();
        post.storage.insert(EVMU256::from(slot), after);
        ChainState {
            states: HashMap::from([(contract, post)]),
            previous_states: HashMap::from([(contract, pre)]),
            ..Default::default()
        }
    }

    #[test]
    fn ratio_zero_denominator_passes() {
        let inv = invariant(
            InvariantTag::Ratio,
            InvariantParams::Ratio(RatioParams {
                contract: addr(1),
                numerator_slot: EVMU256::from(0u64),
                denominator_slot: EVMU256::from(1u64),
                max_ratio: 2.0,
            }),
        );
        // contract entirely missing from state: zero stub, still passes
        let (ok, _) = evaluate_default(&inv, &ChainState::default());
        assert!(ok);
    }

    #[test]
    fn threshold_violates_above_max() {
        let inv = invariant(
            InvariantTag::Threshold,
            InvariantParams::Threshold(ThresholdParams {
                contract: addr(1),
                slot: EVMU256::from(3u64),
                max: Some(EVMU256::from(10u64)),
                min: None,
            }),
        );
        let state = chain_state_with_slot(addr(1), 3, EVMU256::ZERO, EVMU256::from(11u64));
        let (ok, detail) = evaluate_default(&inv, &state);
        assert!(!ok);
        assert!(detail.unwrap().message.contains("above max"));
    }

    #[test]
    fn delta_first_observation_passes() {
        let inv = invariant(
            InvariantTag::Delta,
            InvariantParams::Delta(DeltaParams {
                contract: addr(1),
                slot: EVMU256::from(0u64),
                max_change: 0.1,
            }),
        );
        let mut state = chain_state_with_slot(addr(1), 0, EVMU256::from(100u64), EVMU256::from(200u64));
        state.previous_states.clear();
        assert!(evaluate_default(&inv, &state).0);

        let state = chain_state_with_slot(addr(1), 0, EVMU256::from(100u64), EVMU256::from(200u64));
        assert!(!evaluate_default(&inv, &state).0);
    }

    #[test]
    fn flash_change_reports_reserve_drain() {
        // slot 8 packed V2 reserves: r0 0x100 -> 0x1
        let pack = |r0: u64| {
            (EVMU256::from(r0) << 144)
                | (EVMU256::from(0x100u64) << 32)
                | EVMU256::from(0x5f00_0000u64)
        };
        let inv = invariant(
            InvariantTag::FlashChangePrevention,
            InvariantParams::FlashChange(FlashChangeParams {
                contract: addr(1),
                slots: vec![(EVMU256::from(8u64), None)],
                threshold: 0.5,
            }),
        );
        let state = chain_state_with_slot(addr(1), 8, pack(0x100), pack(0x1));
        let (ok, detail) = evaluate_default(&inv, &state);
        assert!(!ok);
        let detail = detail.unwrap();
        assert_eq!(detail.details["field"], "reserve0");
        assert!(detail.details["change_rate"].starts_with("0.996"));
    }

    #[test]
    fn unknown_tag_fails_closed() {
        assert!(InvariantTag::parse("made-up").is_err());
    }
}
