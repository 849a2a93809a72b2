use std::collections::HashMap;

use ethers_core::abi::{Abi, Function};
use tracing::{debug, error};

use crate::evm::abi::selector;
use crate::evm::config::SeedConfig;
use crate::evm::types::{address_to_hex, EVMAddress};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("contract not found: {0}")]
    ContractNotFound(String),
    #[error("method not found: {selector} @ {address}")]
    MethodNotFound { address: String, selector: String },
    #[error("contract already registered: {0}")]
    AlreadyRegistered(String),
}

/// A contract under protection: its parsed ABI plus the fuzzing seed
/// configuration attached by the project.
#[derive(Clone, Debug)]
pub struct ProtectedContractInfo {
    pub address: EVMAddress,
    pub name: String,
    pub abi: Abi,
    pub seed_config: Option<SeedConfig>,
    pub metadata: HashMap<String, String>,
}

/// Address -> contract info, with a `{selector -> method}` cache built at
/// registration time.
#[derive(Clone, Debug, Default)]
pub struct ProtectedRegistry {
    contracts: HashMap<EVMAddress, ProtectedContractInfo>,
    methods: HashMap<EVMAddress, HashMap<[u8; 4], Function>>,
}

impl ProtectedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, info: ProtectedContractInfo) -> Result<(), RegistryError> {
        if self.contracts.contains_key(&info.address) {
            return Err(RegistryError::AlreadyRegistered(address_to_hex(info.address)));
        }
        let mut cache = HashMap::new();
        for function in info.abi.functions() {
            cache.insert(selector(function), function.clone());
        }
        debug!(
            address = %address_to_hex(info.address),
            methods = cache.len(),
            "registered protected contract"
        );
        self.methods.insert(info.address, cache);
        self.contracts.insert(info.address, info);
        Ok(())
    }

    /// Best-effort bulk registration: per-entry failures are logged and the
    /// rest of the batch proceeds.
    pub fn register_batch(&mut self, infos: Vec<ProtectedContractInfo>) {
        for info in infos {
            let address = info.address;
            if let Err(e) = self.register(info) {
                error!(address = %address_to_hex(address), error = %e, "skipping contract");
            }
        }
    }

    pub fn get(&self, address: EVMAddress) -> Option<&ProtectedContractInfo> {
        self.contracts.get(&address)
    }

    pub fn is_protected(&self, address: EVMAddress) -> bool {
        self.contracts.contains_key(&address)
    }

    pub fn get_method(
        &self,
        address: EVMAddress,
        selector: [u8; 4],
    ) -> Result<&Function, RegistryError> {
        let methods = self
            .methods
            .get(&address)
            .ok_or_else(|| RegistryError::ContractNotFound(address_to_hex(address)))?;
        methods
            .get(&selector)
            .ok_or_else(|| RegistryError::MethodNotFound {
                address: address_to_hex(address),
                selector: format!("0x{}", hex::encode(selector)),
            })
    }

    pub fn method_by_name(&self, address: EVMAddress, name: &str) -> Option<&Function> {
        self.methods
            .get(&address)?
            .values()
            .find(|f| f.name.eq_ignore_ascii_case(name))
    }

    pub fn count(&self) -> usize {
        self.contracts.len()
    }

    pub fn get_all(&self) -> Vec<&ProtectedContractInfo> {
        self.contracts.values().collect()
    }

    pub fn addresses(&self) -> Vec<EVMAddress> {
        self.contracts.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evm::abi::selector_of;

    fn info(addr_byte: u8) -> ProtectedContractInfo {
        let json = r#"[{"type":"function","name":"transfer","inputs":[
            {"name":"to","type":"address"},{"name":"amount","type":"uint256"}],
            "outputs":[{"name":"","type":"bool"}],"stateMutability":"nonpayable"}]"#;
        ProtectedContractInfo {
            address: EVMAddress::from_slice(&[addr_byte; 20]),
            name: format!("c{}", addr_byte),
            abi: serde_json::from_str(json).unwrap(),
            seed_config: None,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn selector_cache_is_built_on_register() {
        let mut registry = ProtectedRegistry::new();
        registry.register(info(1)).unwrap();

        let address = EVMAddress::from_slice(&[1; 20]);
        let method = registry
            .get_method(address, selector_of("transfer(address,uint256)"))
            .unwrap();
        assert_eq!(method.name, "transfer");

        assert!(matches!(
            registry.get_method(address, [0, 0, 0, 0]),
            Err(RegistryError::MethodNotFound { .. })
        ));
        assert!(matches!(
            registry.get_method(EVMAddress::from_slice(&[9; 20]), [0, 0, 0, 0]),
            Err(RegistryError::ContractNotFound(_))
        ));
    }

    #[test]
    fn batch_registration_is_best_effort() {
        let mut registry = ProtectedRegistry::new();
        registry.register_batch(vec![info(1), info(1), info(2)]);
        assert_eq!(registry.count(), 2);
    }
}
