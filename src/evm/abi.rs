/// ABI helpers shared by the registry, the mutation engine and the rule
/// pipeline. Canonical signatures follow the Solidity grammar; a selector is
/// always the first 4 bytes of keccak256 of that canonical signature.
use ethers_core::abi::{Function, ParamType, Token};
use primitive_types::H160;

use crate::evm::types::{EVMU256};

extern crate crypto;

use self::crypto::digest::Digest;
use self::crypto::sha3::Sha3;

pub fn set_hash(name: &str, out: &mut [u8]) {
    let mut hasher = Sha3::keccak256();
    hasher.input_str(name);
    hasher.result(out)
}

pub fn keccak_bytes(data: &[u8], out: &mut [u8]) {
    let mut hasher = Sha3::keccak256();
    hasher.input(data);
    hasher.result(out)
}

/// Canonical type name of an ABI parameter, recursing into tuples and
/// arrays the same way the signature grammar does.
pub fn canonical_type(ty: &ParamType) -> String {
    match ty {
        ParamType::Address => "address".to_string(),
        ParamType::Bytes => "bytes".to_string(),
        ParamType::Int(size) => format!("int{}", size),
        ParamType::Uint(size) => format!("uint{}", size),
        ParamType::Bool => "bool".to_string(),
        ParamType::String => "string".to_string(),
        ParamType::FixedBytes(size) => format!("bytes{}", size),
        ParamType::Array(inner) => format!("{}[]", canonical_type(inner)),
        ParamType::FixedArray(inner, size) => format!("{}[{}]", canonical_type(inner), size),
        ParamType::Tuple(inner) => {
            let v = inner
                .iter()
                .map(canonical_type)
                .collect::<Vec<String>>()
                .join(",");
            format!("({})", v)
        }
    }
}

/// Canonical signature, e.g. `swap(uint256,address)`.
pub fn canonical_signature(func: &Function) -> String {
    let args = func
        .inputs
        .iter()
        .map(|p| canonical_type(&p.kind))
        .collect::<Vec<String>>()
        .join(",");
    format!("{}({})", func.name, args)
}

/// 4-byte selector of the canonical signature.
pub fn selector(func: &Function) -> [u8; 4] {
    selector_of(&canonical_signature(func))
}

pub fn selector_of(signature: &str) -> [u8; 4] {
    let mut hash = [0u8; 32];
    set_hash(signature, &mut hash);
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Wire encoding of parameter kinds in rule payloads.
/// 0=uint256, 1=int256, 2=address, 3=bool, 4=bytes32, 5=bytes, 6=string
pub fn param_type_code(ty: &ParamType) -> u8 {
    match ty {
        ParamType::Uint(_) => 0,
        ParamType::Int(_) => 1,
        ParamType::Address => 2,
        ParamType::Bool => 3,
        ParamType::FixedBytes(_) => 4,
        ParamType::Bytes | ParamType::Array(_) | ParamType::FixedArray(_, _) => 5,
        ParamType::String | ParamType::Tuple(_) => 6,
    }
}

/// The zero value of an ABI type; used when no seed, constraint or
/// generator applies to a parameter position.
pub fn typed_zero(ty: &ParamType) -> Token {
    match ty {
        ParamType::Address => Token::Address(H160::zero()),
        ParamType::Bytes => Token::Bytes(vec![]),
        ParamType::Int(_) => Token::Int(ethers_core::types::U256::zero()),
        ParamType::Uint(_) => Token::Uint(ethers_core::types::U256::zero()),
        ParamType::Bool => Token::Bool(false),
        ParamType::String => Token::String(String::new()),
        ParamType::FixedBytes(size) => Token::FixedBytes(vec![0u8; *size]),
        ParamType::Array(_) => Token::Array(vec![]),
        ParamType::FixedArray(inner, size) => {
            Token::FixedArray((0..*size).map(|_| typed_zero(inner)).collect())
        }
        ParamType::Tuple(inner) => Token::Tuple(inner.iter().map(typed_zero).collect()),
    }
}

/// A concrete seed value from project config. Coercion into a typed ABI
/// token happens at strategy boundaries and may fail per target type.
#[derive(Clone, Debug, PartialEq)]
pub enum SeedValue {
    Int(EVMU256),
    Bool(bool),
    Address(H160),
    Bytes(Vec<u8>),
    Str(String),
}

impl SeedValue {
    /// Parse the loose JSON representation used by seed configs: numbers,
    /// booleans, 0x-hex strings and plain strings.
    pub fn from_json(v: &serde_json::Value) -> Option<Self> {
        match v {
            serde_json::Value::Bool(b) => Some(SeedValue::Bool(*b)),
            serde_json::Value::Number(n) => {
                let as_u64 = n.as_u64()?;
                Some(SeedValue::Int(EVMU256::from(as_u64)))
            }
            serde_json::Value::String(s) => {
                let raw = s.trim_start_matches("0x");
                if s.starts_with("0x") && raw.len() == 40 {
                    let bytes = hex::decode(raw).ok()?;
                    return Some(SeedValue::Address(H160::from_slice(&bytes)));
                }
                if s.starts_with("0x") {
                    if let Ok(word) = EVMU256::from_str_radix(raw, 16) {
                        return Some(SeedValue::Int(word));
                    }
                    return Some(SeedValue::Bytes(hex::decode(raw).ok()?));
                }
                if let Ok(word) = EVMU256::from_str_radix(s, 10) {
                    return Some(SeedValue::Int(word));
                }
                Some(SeedValue::Str(s.clone()))
            }
            _ => None,
        }
    }

    /// Coerce into a token of the target ABI type. Returns `None` when the
    /// seed cannot represent the type.
    pub fn coerce(&self, ty: &ParamType) -> Option<Token> {
        let ethers_word = |v: &EVMU256| {
            ethers_core::types::U256::from_big_endian(&v.to_be_bytes::<32>())
        };
        match (self, ty) {
            (SeedValue::Int(v), ParamType::Uint(_)) => Some(Token::Uint(ethers_word(v))),
            (SeedValue::Int(v), ParamType::Int(_)) => Some(Token::Int(ethers_word(v))),
            (SeedValue::Int(v), ParamType::Bool) => Some(Token::Bool(!crate::evm::types::is_zero(*v))),
            (SeedValue::Int(v), ParamType::FixedBytes(size)) if *size <= 32 => {
                Some(Token::FixedBytes(v.to_be_bytes::<32>()[32 - size..].to_vec()))
            }
            (SeedValue::Bool(b), ParamType::Bool) => Some(Token::Bool(*b)),
            (SeedValue::Bool(b), ParamType::Uint(_)) => {
                Some(Token::Uint(ethers_core::types::U256::from(*b as u64)))
            }
            (SeedValue::Address(a), ParamType::Address) => Some(Token::Address(*a)),
            (SeedValue::Address(a), ParamType::Uint(_)) => Some(Token::Uint(
                ethers_core::types::U256::from_big_endian(a.as_bytes()),
            )),
            (SeedValue::Bytes(b), ParamType::Bytes) => Some(Token::Bytes(b.clone())),
            (SeedValue::Bytes(b), ParamType::FixedBytes(size)) if b.len() == *size => {
                Some(Token::FixedBytes(b.clone()))
            }
            (SeedValue::Str(s), ParamType::String) => Some(Token::String(s.clone())),
            _ => None,
        }
    }
}

/// 32-byte word encoding of a token for rule payloads. Dynamic types hash
/// down to their keccak, mirroring how the on-chain module compares them.
pub fn token_to_word(token: &Token) -> [u8; 32] {
    let mut out = [0u8; 32];
    match token {
        Token::Uint(v) | Token::Int(v) => v.to_big_endian(&mut out),
        Token::Address(a) => out[12..].copy_from_slice(a.as_bytes()),
        Token::Bool(b) => out[31] = *b as u8,
        Token::FixedBytes(b) => {
            let n = b.len().min(32);
            out[..n].copy_from_slice(&b[..n]);
        }
        Token::Bytes(b) => keccak_bytes(b, &mut out),
        Token::String(s) => keccak_bytes(s.as_bytes(), &mut out),
        other => {
            let packed = ethers_core::abi::encode(&[other.clone()]);
            keccak_bytes(&packed, &mut out);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_matches_keccak() {
        // keccak256("transfer(address,uint256)")[..4] == a9059cbb
        assert_eq!(selector_of("transfer(address,uint256)"), [0xa9, 0x05, 0x9c, 0xbb]);
    }

    #[test]
    fn canonical_signature_of_function() {
        let json = r#"[{"type":"function","name":"swap","inputs":[
            {"name":"amount","type":"uint256"},{"name":"to","type":"address"}],
            "outputs":[],"stateMutability":"nonpayable"}]"#;
        let abi: ethers_core::abi::Abi = serde_json::from_str(json).unwrap();
        let func = abi.functions().next().unwrap();
        assert_eq!(canonical_signature(func), "swap(uint256,address)");
        assert_eq!(selector(func), selector_of("swap(uint256,address)"));
    }

    #[test]
    fn seed_coercion() {
        let seed = SeedValue::Int(EVMU256::from(7u64));
        assert_eq!(
            seed.coerce(&ParamType::Uint(256)),
            Some(Token::Uint(ethers_core::types::U256::from(7u64)))
        );
        assert_eq!(seed.coerce(&ParamType::Bool), Some(Token::Bool(true)));
        assert_eq!(seed.coerce(&ParamType::String), None);

        let addr = SeedValue::from_json(&serde_json::json!(
            "0x00112233445566778899aabbccddeeff00112233"
        ))
        .unwrap();
        assert!(matches!(addr, SeedValue::Address(_)));
    }

    #[test]
    fn typed_zero_is_zero_word() {
        assert_eq!(token_to_word(&typed_zero(&ParamType::Uint(256))), [0u8; 32]);
        assert_eq!(token_to_word(&typed_zero(&ParamType::Bool)), [0u8; 32]);
    }
}
