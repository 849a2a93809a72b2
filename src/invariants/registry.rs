use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use crate::config::ProjectConfig;
use crate::evm::types::{parse_address, EVMAddress};
use crate::invariants::evaluators::{
    evaluate_default, parse_params, EvaluatorFn, Invariant, InvariantError, InvariantTag,
};
use crate::invariants::types::{ChainState, ViolationResult};

#[derive(Clone, Debug)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub chain_id: u64,
    pub contracts: Vec<EVMAddress>,
}

/// Project/contract/invariant taxonomy. Populated at startup from project
/// configs; `register_evaluator` is the only post-load mutation.
#[derive(Default)]
pub struct InvariantRegistry {
    projects: HashMap<String, Project>,
    contract_to_project: HashMap<EVMAddress, String>,
    invariants: HashMap<String, HashMap<String, Invariant>>,
}

impl InvariantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a project config: declared contracts are registered, and any
    /// contract named inside an invariant (its `contracts` field or a
    /// `parameters.contracts` list) is hoisted into the contract map
    /// without overwriting existing bindings.
    pub fn load_project(&mut self, config: &ProjectConfig) -> Result<(), InvariantError> {
        let mut contracts: Vec<EVMAddress> = Vec::new();
        for declared in &config.contracts {
            if let Some(address) = parse_address(&declared.address) {
                contracts.push(address);
                self.contract_to_project
                    .entry(address)
                    .or_insert_with(|| config.project_id.clone());
            }
        }

        let mut invariants = HashMap::new();
        for declared in &config.invariants {
            let tag = InvariantTag::parse(&declared.tag)?;
            let mut bound: Vec<EVMAddress> = declared
                .contracts
                .iter()
                .filter_map(|raw| parse_address(raw))
                .collect();
            if let Some(extra) = declared
                .parameters
                .get("contracts")
                .and_then(|c| c.as_array())
            {
                bound.extend(
                    extra
                        .iter()
                        .filter_map(|raw| raw.as_str())
                        .filter_map(parse_address),
                );
            }
            for address in &bound {
                self.contract_to_project
                    .entry(*address)
                    .or_insert_with(|| config.project_id.clone());
            }
            if bound.is_empty() {
                bound = contracts.clone();
            }

            let params = parse_params(&declared.id, tag, &declared.parameters, &bound)?;
            invariants.insert(
                declared.id.clone(),
                Invariant {
                    id: declared.id.clone(),
                    name: if declared.name.is_empty() {
                        declared.id.clone()
                    } else {
                        declared.name.clone()
                    },
                    tag,
                    params,
                    contracts: bound,
                    evaluator: None,
                },
            );
        }

        info!(
            project = %config.project_id,
            contracts = contracts.len(),
            invariants = invariants.len(),
            "loaded project"
        );
        self.invariants
            .entry(config.project_id.clone())
            .or_default()
            .extend(invariants);
        self.projects.insert(
            config.project_id.clone(),
            Project {
                id: config.project_id.clone(),
                name: config.name.clone(),
                chain_id: config.chain_id,
                contracts,
            },
        );
        Ok(())
    }

    /// Replace the default evaluator of every already-loaded invariant with
    /// the given id.
    pub fn register_evaluator(&mut self, invariant_id: &str, evaluator: EvaluatorFn) {
        for project_invariants in self.invariants.values_mut() {
            if let Some(invariant) = project_invariants.get_mut(invariant_id) {
                invariant.evaluator = Some(evaluator.clone());
            }
        }
    }

    pub fn project_of(&self, contract: EVMAddress) -> Option<&Project> {
        let id = self.contract_to_project.get(&contract)?;
        self.projects.get(id)
    }

    pub fn project(&self, id: &str) -> Option<&Project> {
        self.projects.get(id)
    }

    pub fn projects(&self) -> impl Iterator<Item = &Project> {
        self.projects.values()
    }

    pub fn invariants_of(&self, project_id: &str) -> Vec<&Invariant> {
        self.invariants
            .get(project_id)
            .map(|m| m.values().collect())
            .unwrap_or_default()
    }

    /// Evaluate every invariant of every project reachable from the touched
    /// contracts, exactly once per project per transaction.
    pub fn evaluate_transaction(
        &self,
        contracts: &[EVMAddress],
        chain_state: &ChainState,
    ) -> Vec<ViolationResult> {
        let mut project_ids: Vec<&String> = contracts
            .iter()
            .filter_map(|c| self.contract_to_project.get(c))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        project_ids.sort();

        let mut violations = Vec::new();
        for project_id in project_ids {
            let Some(invariants) = self.invariants.get(project_id) else {
                continue;
            };
            for invariant in invariants.values() {
                let (ok, detail) = match &invariant.evaluator {
                    Some(evaluator) => evaluator(invariant, chain_state),
                    None => evaluate_default(invariant, chain_state),
                };
                if ok {
                    continue;
                }
                let detail = detail.unwrap_or_default();
                debug!(project = %project_id, invariant = %invariant.id, "violation");
                violations.push(ViolationResult {
                    project_id: project_id.clone(),
                    invariant_id: invariant.id.clone(),
                    invariant_name: invariant.name.clone(),
                    block_number: chain_state.block_number,
                    tx_hash: chain_state.tx_hash.clone(),
                    message: detail.message,
                    details: detail.details,
                });
            }
        }
        violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invariants::evaluators::ViolationDetail;
    use crate::invariants::types::ContractState;
    use crate::evm::types::EVMU256;
    use std::sync::Arc;

    fn project_json(project_id: &str, contract: &str) -> ProjectConfig {
        serde_json::from_value(serde_json::json!({
            "project_id": project_id,
            "name": project_id,
            "chain_id": 1,
            "contracts": [{"address": contract, "name": "vault"}],
            "invariants": [{
                "id": "cap",
                "name": "supply cap",
                "type": "threshold",
                "parameters": {"contract": contract, "slot": "0x0", "max": "0x64"}
            }]
        }))
        .unwrap()
    }

    const VAULT: &str = "0x0101010101010101010101010101010101010101";

    fn vault_addr() -> EVMAddress {
        EVMAddress::from_slice(&[1; 20])
    }

    #[test]
    fn loads_and_evaluates_threshold() {
        let mut registry = InvariantRegistry::new();
        registry.load_project(&project_json("p1", VAULT)).unwrap();

        let mut post = ContractState::default();
        post.storage
            .insert(EVMU256::ZERO, EVMU256::from(200u64));
        let chain_state = ChainState {
            states: HashMap::from([(vault_addr(), post)]),
            tx_hash: "0xabc".into(),
            ..Default::default()
        };

        let violations = registry.evaluate_transaction(&[vault_addr()], &chain_state);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].project_id, "p1");
        assert_eq!(violations[0].invariant_id, "cap");
        assert_eq!(violations[0].tx_hash, "0xabc");

        // untouched contracts reach no project
        let other = EVMAddress::from_slice(&[9; 20]);
        assert!(registry.evaluate_transaction(&[other], &chain_state).is_empty());
    }

    #[test]
    fn unknown_tag_fails_load() {
        let mut registry = InvariantRegistry::new();
        let config: ProjectConfig = serde_json::from_value(serde_json::json!({
            "project_id": "p1",
            "invariants": [{"id": "x", "type": "wat", "parameters": {}}]
        }))
        .unwrap();
        assert!(registry.load_project(&config).is_err());
    }

    #[test]
    fn parameter_contracts_are_hoisted() {
        let mut registry = InvariantRegistry::new();
        let extra = "0x0202020202020202020202020202020202020202";
        let config: ProjectConfig = serde_json::from_value(serde_json::json!({
            "project_id": "p1",
            "contracts": [{"address": VAULT}],
            "invariants": [{
                "id": "x", "type": "threshold",
                "parameters": {"contract": extra, "slot": 0, "max": 1,
                                "contracts": [extra]}
            }]
        }))
        .unwrap();
        registry.load_project(&config).unwrap();
        let hoisted = EVMAddress::from_slice(&[2; 20]);
        assert_eq!(registry.project_of(hoisted).unwrap().id, "p1");
    }

    #[test]
    fn registered_evaluator_replaces_default() {
        let mut registry = InvariantRegistry::new();
        registry.load_project(&project_json("p1", VAULT)).unwrap();
        registry.register_evaluator(
            "cap",
            Arc::new(|_, _| {
                (
                    false,
                    Some(ViolationDetail {
                        message: "custom says no".into(),
                        details: HashMap::new(),
                    }),
                )
            }),
        );
        let violations = registry.evaluate_transaction(&[vault_addr()], &ChainState::default());
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].message, "custom says no");
    }
}
