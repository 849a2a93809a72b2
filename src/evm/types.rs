/// Common generic types shared by the local EVM and the onchain side.
use primitive_types::{H160, H256};
use revm_primitives::ruint::aliases::U512;
use revm_primitives::{B160, B256, U256};

pub type EVMAddress = B160;
pub type EVMU256 = U256;
pub type EVMU512 = U512;

/// convert an RPC-side H160 to the interpreter-side address
pub fn convert_h160(v: H160) -> EVMAddress {
    EVMAddress::from_slice(v.as_bytes())
}

/// convert the interpreter-side address back to an RPC-side H160
pub fn convert_to_h160(v: EVMAddress) -> H160 {
    H160::from_slice(v.as_bytes())
}

/// convert a 32-byte word hash to the interpreter word
pub fn convert_h256(v: H256) -> EVMU256 {
    EVMU256::try_from_be_slice(v.as_bytes()).unwrap_or(EVMU256::ZERO)
}

/// convert the interpreter word to a 32-byte word hash
pub fn convert_to_h256(v: EVMU256) -> H256 {
    H256::from_slice(&v.to_be_bytes::<32>())
}

/// convert U256 to an address by taking the last 20 bytes
pub fn convert_u256_to_address(v: EVMU256) -> EVMAddress {
    let data: [u8; 32] = v.to_be_bytes();
    EVMAddress::from_slice(&data[12..32])
}

pub fn address_to_u256(v: EVMAddress) -> EVMU256 {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(v.as_bytes());
    EVMU256::try_from_be_slice(&word).unwrap_or(EVMU256::ZERO)
}

/// Parse a fixed address from a hex string (no 0x prefix).
pub fn fixed_address(s: &str) -> EVMAddress {
    let mut address = EVMAddress::zero();
    address.0.copy_from_slice(&hex::decode(s).unwrap());
    address
}

/// Parse a 0x-prefixed (or bare) hex address, zero on malformed input.
pub fn parse_address(s: &str) -> Option<EVMAddress> {
    let raw = s.trim_start_matches("0x");
    let bytes = hex::decode(raw).ok()?;
    if bytes.len() != 20 {
        return None;
    }
    Some(EVMAddress::from_slice(&bytes))
}

/// Parse a 0x-prefixed hex quantity into a word.
pub fn parse_word(s: &str) -> Option<EVMU256> {
    let raw = s.trim_start_matches("0x");
    if raw.is_empty() {
        return Some(EVMU256::ZERO);
    }
    EVMU256::from_str_radix(raw, 16).ok()
}

pub fn word_to_hex(v: EVMU256) -> String {
    format!("0x{}", hex::encode(v.to_be_bytes::<32>()))
}

pub fn address_to_hex(v: EVMAddress) -> String {
    format!("0x{}", hex::encode(v.as_bytes()))
}

/// Check if an EVMU256 is zero
pub fn is_zero(v: EVMU256) -> bool {
    v == EVMU256::ZERO
}

/// As u64
pub fn as_u64(v: EVMU256) -> u64 {
    v.as_limbs()[0]
}

pub fn keccak_code_hash(code: &[u8]) -> B256 {
    if code.is_empty() {
        return B256::zero();
    }
    revm_primitives::keccak256(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_roundtrip() {
        let addr = fixed_address("00112233445566778899aabbccddeeff00112233");
        assert_eq!(convert_h160(convert_to_h160(addr)), addr);
        assert_eq!(convert_u256_to_address(address_to_u256(addr)), addr);
    }

    #[test]
    fn word_parsing() {
        assert_eq!(parse_word("0x"), Some(EVMU256::ZERO));
        assert_eq!(parse_word("0x10"), Some(EVMU256::from(16u64)));
        assert_eq!(
            word_to_hex(EVMU256::from(1u64)),
            format!("0x{}{}", "0".repeat(63), "1")
        );
        assert!(parse_address("0xdead").is_none());
    }
}
