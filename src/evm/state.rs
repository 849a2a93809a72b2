use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use revm_interpreter::SelfDestructResult;
use revm_primitives::{Bytecode, B256};
use tracing::warn;

use crate::evm::types::{keccak_code_hash, EVMAddress, EVMU256};

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Remote source of account state, consulted once per (address, field) on
/// first read. Errors degrade to zero defaults; they are never propagated
/// into the interpreter.
pub trait StateProvider: Send + Sync {
    /// balance and nonce
    fn basic(&self, address: EVMAddress) -> Result<(EVMU256, u64), ProviderError>;
    fn code(&self, address: EVMAddress) -> Result<Vec<u8>, ProviderError>;
    fn storage(&self, address: EVMAddress, slot: EVMU256) -> Result<EVMU256, ProviderError>;
}

#[derive(Clone, Debug, Default)]
pub struct AccountState {
    pub balance: EVMU256,
    pub nonce: u64,
    pub code: Bytecode,
    pub storage: HashMap<EVMU256, EVMU256>,
}

impl AccountState {
    pub fn is_empty(&self) -> bool {
        self.balance == EVMU256::ZERO && self.nonce == 0 && self.code.is_empty()
    }

    pub fn code_hash(&self) -> B256 {
        keccak_code_hash(self.code.bytes())
    }
}

/// Which fields of an account were supplied by the initial override or have
/// already been hydrated. Either flag stops a provider round-trip.
#[derive(Clone, Debug, Default)]
struct FieldFlags {
    basic: bool,
    code: bool,
    slots: HashSet<EVMU256>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SlotChange {
    pub before: EVMU256,
    pub after: EVMU256,
}

#[derive(Clone, Debug)]
struct Snapshot {
    id: usize,
    accounts: HashMap<EVMAddress, AccountState>,
    changes: HashMap<EVMAddress, HashMap<EVMU256, SlotChange>>,
    transient: HashMap<(EVMAddress, EVMU256), EVMU256>,
    created: HashSet<EVMAddress>,
    destructed: HashSet<EVMAddress>,
}

/// In-memory EVM state with lazy RPC hydration, snapshots, access lists,
/// transient storage and per-slot change capture. One adapter serves one
/// execution; adapters are never shared across concurrent executions.
#[derive(Clone, Default)]
pub struct StateAdapter {
    accounts: HashMap<EVMAddress, AccountState>,
    overridden: HashMap<EVMAddress, FieldFlags>,
    hydrated: HashMap<EVMAddress, FieldFlags>,
    provider: Option<Arc<dyn StateProvider>>,

    snapshots: Vec<Snapshot>,
    next_snapshot_id: usize,

    changes: HashMap<EVMAddress, HashMap<EVMU256, SlotChange>>,

    warm_addresses: HashSet<EVMAddress>,
    warm_slots: HashSet<(EVMAddress, EVMU256)>,
    transient: HashMap<(EVMAddress, EVMU256), EVMU256>,

    created: HashSet<EVMAddress>,
    destructed: HashSet<EVMAddress>,
}

impl std::fmt::Debug for StateAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateAdapter")
            .field("accounts", &self.accounts.len())
            .field("snapshots", &self.snapshots.len())
            .finish()
    }
}

impl StateAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from an explicit account override. Supplied fields are pinned:
    /// lazy hydration will not overwrite them.
    pub fn with_overrides(overrides: HashMap<EVMAddress, AccountState>) -> Self {
        let mut adapter = Self::new();
        for (address, account) in overrides {
            let mut flags = FieldFlags {
                basic: true,
                code: true,
                ..Default::default()
            };
            flags.slots.extend(account.storage.keys().copied());
            adapter.overridden.insert(address, flags);
            adapter.accounts.insert(address, account);
        }
        adapter
    }

    pub fn attach_provider(&mut self, provider: Arc<dyn StateProvider>) {
        self.provider = Some(provider);
    }

    pub fn accounts(&self) -> &HashMap<EVMAddress, AccountState> {
        &self.accounts
    }

    fn hydrate_basic(&mut self, address: EVMAddress) {
        if self.overridden.get(&address).map_or(false, |f| f.basic)
            || self.hydrated.get(&address).map_or(false, |f| f.basic)
        {
            return;
        }
        self.hydrated.entry(address).or_default().basic = true;
        let Some(provider) = self.provider.clone() else { return };
        match provider.basic(address) {
            Ok((balance, nonce)) => {
                let account = self.accounts.entry(address).or_default();
                account.balance = balance;
                account.nonce = nonce;
            }
            Err(e) => warn!(address = ?address, error = %e, "basic hydration failed"),
        }
    }

    fn hydrate_code(&mut self, address: EVMAddress) {
        if self.overridden.get(&address).map_or(false, |f| f.code)
            || self.hydrated.get(&address).map_or(false, |f| f.code)
        {
            return;
        }
        self.hydrated.entry(address).or_default().code = true;
        let Some(provider) = self.provider.clone() else { return };
        match provider.code(address) {
            Ok(code) if !code.is_empty() => {
                self.accounts.entry(address).or_default().code =
                    Bytecode::new_raw(Bytes::from(code));
            }
            Ok(_) => {}
            Err(e) => warn!(address = ?address, error = %e, "code hydration failed"),
        }
    }

    fn hydrate_slot(&mut self, address: EVMAddress, slot: EVMU256) {
        if self
            .overridden
            .get(&address)
            .map_or(false, |f| f.slots.contains(&slot))
            || self
                .hydrated
                .get(&address)
                .map_or(false, |f| f.slots.contains(&slot))
        {
            return;
        }
        self.hydrated.entry(address).or_default().slots.insert(slot);
        let Some(provider) = self.provider.clone() else { return };
        match provider.storage(address, slot) {
            Ok(value) => {
                // zero values are retained on purpose: the lazy flag above
                // stops the next read from hitting the provider again
                self.accounts
                    .entry(address)
                    .or_default()
                    .storage
                    .insert(slot, value);
            }
            Err(e) => warn!(address = ?address, slot = ?slot, error = %e, "slot hydration failed"),
        }
    }

    pub fn get_balance(&mut self, address: EVMAddress) -> EVMU256 {
        self.hydrate_basic(address);
        self.accounts
            .get(&address)
            .map(|a| a.balance)
            .unwrap_or(EVMU256::ZERO)
    }

    pub fn get_nonce(&mut self, address: EVMAddress) -> u64 {
        self.hydrate_basic(address);
        self.accounts.get(&address).map(|a| a.nonce).unwrap_or(0)
    }

    pub fn get_code(&mut self, address: EVMAddress) -> Bytecode {
        self.hydrate_code(address);
        self.accounts
            .get(&address)
            .map(|a| a.code.clone())
            .unwrap_or_default()
    }

    pub fn get_code_hash(&mut self, address: EVMAddress) -> B256 {
        self.hydrate_code(address);
        self.accounts
            .get(&address)
            .map(|a| a.code_hash())
            .unwrap_or_else(B256::zero)
    }

    pub fn get_storage(&mut self, address: EVMAddress, slot: EVMU256) -> EVMU256 {
        self.hydrate_slot(address, slot);
        self.accounts
            .get(&address)
            .and_then(|a| a.storage.get(&slot).copied())
            .unwrap_or(EVMU256::ZERO)
    }

    pub fn set_balance(&mut self, address: EVMAddress, balance: EVMU256) {
        self.accounts.entry(address).or_default().balance = balance;
    }

    pub fn set_nonce(&mut self, address: EVMAddress, nonce: u64) {
        self.accounts.entry(address).or_default().nonce = nonce;
    }

    pub fn set_code(&mut self, address: EVMAddress, code: Bytecode) {
        self.accounts.entry(address).or_default().code = code;
    }

    /// Write a slot, recording `{before, after}`. The first write to a slot
    /// freezes `before` at the pre-write value.
    pub fn set_storage(&mut self, address: EVMAddress, slot: EVMU256, value: EVMU256) -> EVMU256 {
        let before = self.get_storage(address, slot);
        let entry = self
            .changes
            .entry(address)
            .or_default()
            .entry(slot)
            .or_insert_with(|| SlotChange {
                before,
                after: before,
            });
        entry.after = value;
        self.accounts
            .entry(address)
            .or_default()
            .storage
            .insert(slot, value);
        before
    }

    pub fn mark_created(&mut self, address: EVMAddress) {
        self.created.insert(address);
    }

    /// EIP-6780: selfdestruct transfers the balance immediately, but the
    /// account is finalized (deleted) only when it was created in the same
    /// transaction.
    pub fn selfdestruct(&mut self, address: EVMAddress, target: EVMAddress) -> SelfDestructResult {
        let balance = self.get_balance(address);
        let target_exists = self.accounts.contains_key(&target);
        let is_cold = !self.warm_addresses.contains(&target);
        self.warm_addresses.insert(target);
        let previously_destroyed = !self.destructed.insert(address);

        if address != target {
            let target_balance = self.get_balance(target);
            self.set_balance(target, target_balance + balance);
            self.set_balance(address, EVMU256::ZERO);
        }
        SelfDestructResult {
            had_value: balance != EVMU256::ZERO,
            target_exists,
            is_cold,
            previously_destroyed,
        }
    }

    /// Drop accounts whose selfdestruct may finalize (created this tx).
    pub fn finalize_destructs(&mut self) {
        let finalizable: Vec<EVMAddress> = self
            .destructed
            .intersection(&self.created)
            .copied()
            .collect();
        for address in finalizable {
            self.accounts.remove(&address);
        }
    }

    pub fn snapshot(&mut self) -> usize {
        let id = self.next_snapshot_id;
        self.next_snapshot_id += 1;
        self.snapshots.push(Snapshot {
            id,
            accounts: self.accounts.clone(),
            changes: self.changes.clone(),
            transient: self.transient.clone(),
            created: self.created.clone(),
            destructed: self.destructed.clone(),
        });
        id
    }

    /// Restore the account map at snapshot `id` and drop all snapshots with
    /// id >= the requested one.
    pub fn revert_to(&mut self, id: usize) -> bool {
        let Some(pos) = self.snapshots.iter().position(|s| s.id == id) else {
            return false;
        };
        let snapshot = self.snapshots[pos].clone();
        self.accounts = snapshot.accounts;
        self.changes = snapshot.changes;
        self.transient = snapshot.transient;
        self.created = snapshot.created;
        self.destructed = snapshot.destructed;
        self.snapshots.truncate(pos);
        true
    }

    pub fn discard_snapshot(&mut self, id: usize) {
        if let Some(pos) = self.snapshots.iter().position(|s| s.id == id) {
            self.snapshots.remove(pos);
        }
    }

    /// EIP-2929 warm-up before the top-level call. Resets transient storage
    /// and access lists for the new transaction.
    pub fn prepare(
        &mut self,
        sender: EVMAddress,
        coinbase: EVMAddress,
        dest: Option<EVMAddress>,
        precompiles: &[EVMAddress],
        access_list: &[(EVMAddress, Vec<EVMU256>)],
    ) {
        self.transient.clear();
        self.warm_addresses.clear();
        self.warm_slots.clear();
        self.created.clear();
        self.destructed.clear();

        self.warm_addresses.insert(sender);
        self.warm_addresses.insert(coinbase);
        if let Some(dest) = dest {
            self.warm_addresses.insert(dest);
        }
        self.warm_addresses.extend(precompiles.iter().copied());
        for (address, slots) in access_list {
            self.warm_addresses.insert(*address);
            for slot in slots {
                self.warm_slots.insert((*address, *slot));
            }
        }
    }

    /// Returns whether the address was cold, warming it.
    pub fn warm_address(&mut self, address: EVMAddress) -> bool {
        !self.warm_addresses.insert(address)
    }

    /// Returns whether the slot was cold, warming it.
    pub fn warm_slot(&mut self, address: EVMAddress, slot: EVMU256) -> bool {
        !self.warm_slots.insert((address, slot))
    }

    pub fn tload(&self, address: EVMAddress, slot: EVMU256) -> EVMU256 {
        self.transient
            .get(&(address, slot))
            .copied()
            .unwrap_or(EVMU256::ZERO)
    }

    pub fn tstore(&mut self, address: EVMAddress, slot: EVMU256, value: EVMU256) {
        self.transient.insert((address, slot), value);
    }

    pub fn is_empty(&self, address: EVMAddress) -> bool {
        self.accounts.get(&address).map_or(true, |a| a.is_empty())
    }

    pub fn exists(&self, address: EVMAddress) -> bool {
        self.accounts.contains_key(&address)
    }

    pub fn changes(&self) -> &HashMap<EVMAddress, HashMap<EVMU256, SlotChange>> {
        &self.changes
    }

    pub fn reset_changes(&mut self) {
        self.changes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingProvider {
        slot_hits: AtomicUsize,
        basic_hits: AtomicUsize,
    }

    impl StateProvider for CountingProvider {
        fn basic(&self, _address: EVMAddress) -> Result<(EVMU256, u64), ProviderError> {
            self.basic_hits.fetch_add(1, Ordering::SeqCst);
            Ok((EVMU256::from(42u64), 3))
        }

        fn code(&self, _address: EVMAddress) -> Result<Vec<u8>, ProviderError> {
            Ok(vec![])
        }

        fn storage(&self, _address: EVMAddress, _slot: EVMU256) -> Result<EVMU256, ProviderError> {
            self.slot_hits.fetch_add(1, Ordering::SeqCst);
            Ok(EVMU256::from(7u64))
        }
    }

    fn addr(b: u8) -> EVMAddress {
        EVMAddress::from_slice(&[b; 20])
    }

    #[test]
    fn lazy_slot_hydration_hits_provider_once() {
        let mut account = AccountState::default();
        account.balance = EVMU256::from(1u64);
        let mut adapter =
            StateAdapter::with_overrides(HashMap::from([(addr(1), account)]));
        let provider = Arc::new(CountingProvider::default());
        adapter.attach_provider(provider.clone());

        // balance was overridden, never fetched
        assert_eq!(adapter.get_balance(addr(1)), EVMU256::from(1u64));
        assert_eq!(provider.basic_hits.load(Ordering::SeqCst), 0);

        // slot 7 was not, exactly one fetch for two reads
        let slot = EVMU256::from(7u64);
        assert_eq!(adapter.get_storage(addr(1), slot), EVMU256::from(7u64));
        assert_eq!(adapter.get_storage(addr(1), slot), EVMU256::from(7u64));
        assert_eq!(provider.slot_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn snapshot_revert_restores_pre_ops_state() {
        let mut adapter = StateAdapter::new();
        let slot = EVMU256::from(1u64);
        adapter.set_storage(addr(1), slot, EVMU256::from(10u64));
        adapter.set_balance(addr(2), EVMU256::from(5u64));

        let snap = adapter.snapshot();
        adapter.set_storage(addr(1), slot, EVMU256::from(99u64));
        adapter.set_balance(addr(2), EVMU256::ZERO);
        adapter.set_nonce(addr(3), 9);
        let inner = adapter.snapshot();
        assert!(inner > snap);

        assert!(adapter.revert_to(snap));
        assert_eq!(adapter.get_storage(addr(1), slot), EVMU256::from(10u64));
        assert_eq!(adapter.get_balance(addr(2)), EVMU256::from(5u64));
        assert_eq!(adapter.get_nonce(addr(3)), 0);
        // snapshots with id >= requested are gone
        assert!(!adapter.revert_to(inner));
    }

    #[test]
    fn first_write_freezes_before() {
        let mut adapter = StateAdapter::new();
        let slot = EVMU256::from(8u64);
        adapter.set_storage(addr(1), slot, EVMU256::from(1u64));
        adapter.set_storage(addr(1), slot, EVMU256::from(2u64));
        let change = &adapter.changes()[&addr(1)][&slot];
        assert_eq!(change.before, EVMU256::ZERO);
        assert_eq!(change.after, EVMU256::from(2u64));
    }

    #[test]
    fn selfdestruct_finalizes_only_same_tx_creates() {
        let mut adapter = StateAdapter::new();
        adapter.set_balance(addr(1), EVMU256::from(10u64));
        adapter.set_balance(addr(9), EVMU256::from(10u64));
        adapter.mark_created(addr(1));

        let r = adapter.selfdestruct(addr(1), addr(2));
        assert!(r.had_value);
        adapter.selfdestruct(addr(9), addr(2));
        adapter.finalize_destructs();

        assert!(!adapter.exists(addr(1)));
        // pre-existing account survives, balance already drained
        assert!(adapter.exists(addr(9)));
        assert_eq!(adapter.get_balance(addr(2)), EVMU256::from(20u64));
    }

    #[test]
    fn prepare_resets_transient_and_warms() {
        let mut adapter = StateAdapter::new();
        adapter.tstore(addr(1), EVMU256::from(1u64), EVMU256::from(5u64));
        adapter.prepare(
            addr(7),
            addr(8),
            Some(addr(9)),
            &[addr(1)],
            &[(addr(2), vec![EVMU256::from(3u64)])],
        );
        assert_eq!(adapter.tload(addr(1), EVMU256::from(1u64)), EVMU256::ZERO);
        assert!(adapter.warm_address(addr(7)));
        assert!(adapter.warm_address(addr(9)));
        assert!(adapter.warm_slot(addr(2), EVMU256::from(3u64)));
        assert!(!adapter.warm_address(addr(42)));
    }
}
