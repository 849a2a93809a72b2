use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::evm::config::FuzzingConfig;
use crate::evm::state::AccountState;
use crate::evm::types::{parse_address, parse_word, EVMAddress};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("bad json in {path}: {source}")]
    Json {
        path: String,
        source: serde_json::Error,
    },
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    let mut file = File::open(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let mut data = String::new();
    file.read_to_string(&mut data)
        .map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
    Ok(data)
}

fn parse_json<T: serde::de::DeserializeOwned>(path: &Path, data: &str) -> Result<T, ConfigError> {
    serde_json::from_str(data).map_err(|source| ConfigError::Json {
        path: path.display().to_string(),
        source,
    })
}

/// One protected contract as declared by a project.
#[derive(Clone, Debug, Deserialize)]
pub struct ContractConfig {
    pub address: String,
    #[serde(default)]
    pub name: String,
    /// Inline ABI json array.
    #[serde(default)]
    pub abi: Option<serde_json::Value>,
    /// Alternative: path to an ABI file.
    #[serde(default)]
    pub abi_path: Option<String>,
    #[serde(default)]
    pub seed_config: Option<serde_json::Value>,
}

/// Loosely-typed invariant declaration; the registry parses `parameters`
/// per tag and fails closed on unknown tags.
#[derive(Clone, Debug, Deserialize)]
pub struct InvariantConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub tag: String,
    #[serde(default)]
    pub contracts: Vec<String>,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub webhook_url: Option<String>,
    pub dedup_seconds: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            dedup_seconds: 300,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub block_lag: u64,
    pub poll_interval_ms: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            block_lag: 0,
            poll_interval_ms: 1000,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ProjectConfig {
    pub project_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub chain_id: u64,
    #[serde(default)]
    pub contracts: Vec<ContractConfig>,
    #[serde(default)]
    pub invariants: Vec<InvariantConfig>,
    #[serde(default)]
    pub fuzzing_config: FuzzingConfig,
    #[serde(default)]
    pub alert_config: AlertConfig,
    #[serde(default)]
    pub monitoring_config: MonitoringConfig,
}

pub fn load_project_config(path: &Path) -> Result<ProjectConfig, ConfigError> {
    let data = read_file(path)?;
    parse_json(path, &data)
}

/// Load every project config in a file that may hold one project or an
/// array of projects, optionally filtered by name.
pub fn load_project_configs(
    path: &Path,
    names: &[String],
) -> Result<Vec<ProjectConfig>, ConfigError> {
    let data = read_file(path)?;
    let value: serde_json::Value = parse_json(path, &data)?;
    let raw: Vec<serde_json::Value> = match value {
        serde_json::Value::Array(items) => items,
        single => vec![single],
    };
    let mut out = Vec::new();
    for item in raw {
        let config: ProjectConfig = serde_json::from_value(item).map_err(|source| {
            ConfigError::Json {
                path: path.display().to_string(),
                source,
            }
        })?;
        if !names.is_empty() && !names.iter().any(|n| n.eq_ignore_ascii_case(&config.name)) {
            continue;
        }
        out.push(config);
    }
    Ok(out)
}

/// Baseline state captured at a fork block:
/// `{block_number, contracts: {addr -> {balance, code, storage}}}`.
#[derive(Clone, Debug, Deserialize)]
pub struct BaselineStateFile {
    pub block_number: u64,
    #[serde(default)]
    pub contracts: HashMap<String, BaselineContract>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct BaselineContract {
    #[serde(default)]
    pub balance: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub storage: HashMap<String, String>,
}

impl BaselineStateFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = read_file(path)?;
        parse_json(path, &data)
    }

    /// Materialize into adapter account states keyed by parsed address.
    pub fn to_accounts(&self) -> HashMap<EVMAddress, AccountState> {
        let mut out = HashMap::new();
        for (raw_address, contract) in &self.contracts {
            let Some(address) = parse_address(raw_address) else {
                warn!(address = %raw_address, "skipping unparseable baseline address");
                continue;
            };
            let mut account = AccountState {
                balance: parse_word(&contract.balance).unwrap_or_default(),
                ..Default::default()
            };
            let raw_code = contract.code.trim_start_matches("0x");
            if !raw_code.is_empty() {
                if let Ok(code) = hex::decode(raw_code) {
                    account.code =
                        revm_primitives::Bytecode::new_raw(bytes::Bytes::from(code));
                }
            }
            for (slot, value) in &contract.storage {
                let (Some(slot), Some(value)) = (parse_word(slot), parse_word(value)) else {
                    continue;
                };
                account.storage.insert(slot, value);
            }
            out.insert(address, account);
        }
        out
    }
}

/// Foundry-style broadcast file; CREATE entries override the protected set.
#[derive(Clone, Debug, Deserialize)]
pub struct BroadcastFile {
    #[serde(default)]
    pub transactions: Vec<BroadcastTransaction>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastTransaction {
    #[serde(default)]
    pub transaction_type: String,
    #[serde(default)]
    pub contract_name: String,
    #[serde(default)]
    pub contract_address: String,
}

impl BroadcastFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = read_file(path)?;
        parse_json(path, &data)
    }

    pub fn created_contracts(&self) -> Vec<(String, EVMAddress)> {
        self.transactions
            .iter()
            .filter(|tx| tx.transaction_type.eq_ignore_ascii_case("CREATE"))
            .filter_map(|tx| {
                parse_address(&tx.contract_address).map(|a| (tx.contract_name.clone(), a))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn baseline_file_roundtrip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"block_number": 100, "contracts": {{
                "0x0303030303030303030303030303030303030303": {{
                    "balance": "0x64", "code": "0x6001",
                    "storage": {{"0x1": "0x2a"}}
                }},
                "garbage": {{"balance": "0x1"}}
            }}}}"#
        )
        .unwrap();
        let baseline = BaselineStateFile::load(file.path()).unwrap();
        assert_eq!(baseline.block_number, 100);

        let accounts = baseline.to_accounts();
        assert_eq!(accounts.len(), 1);
        let account = &accounts[&EVMAddress::from_slice(&[3; 20])];
        assert_eq!(account.balance, crate::evm::types::EVMU256::from(100u64));
        assert_eq!(
            account.storage[&crate::evm::types::EVMU256::from(1u64)],
            crate::evm::types::EVMU256::from(42u64)
        );
        assert!(!account.code.is_empty());
    }

    #[test]
    fn broadcast_create_entries_override_protected_set() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"transactions": [
                {{"transactionType": "CREATE", "contractName": "Vault",
                  "contractAddress": "0x0101010101010101010101010101010101010101"}},
                {{"transactionType": "CALL", "contractName": "x",
                  "contractAddress": "0x0202020202020202020202020202020202020202"}}
            ]}}"#
        )
        .unwrap();
        let broadcast = BroadcastFile::load(file.path()).unwrap();
        let created = broadcast.created_contracts();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].0, "Vault");
    }

    #[test]
    fn project_filter_by_name() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"project_id": "p1", "name": "alpha"}},
                {{"project_id": "p2", "name": "beta"}}]"#
        )
        .unwrap();
        let all = load_project_configs(file.path(), &[]).unwrap();
        assert_eq!(all.len(), 2);
        let filtered = load_project_configs(file.path(), &["beta".to_string()]).unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].project_id, "p2");
    }
}
