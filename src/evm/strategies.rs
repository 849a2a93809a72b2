use ethers_core::abi::{ParamType, Token};
use ethers_core::types::U256;
use itertools::Itertools;
use primitive_types::H160;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::evm::config::SeedConfig;
use crate::evm::mutation::MutationStrategy;
use crate::evm::pool::ParamGenerator;

pub const SEED_STRATEGY_PRIORITY: i32 = 100;
pub const ABI_STRATEGY_PRIORITY: i32 = 50;
pub const RANGE_STRATEGY_PRIORITY: i32 = 30;

fn is_primitive(ty: &ParamType) -> bool {
    matches!(
        ty,
        ParamType::Address
            | ParamType::Bool
            | ParamType::Bytes
            | ParamType::FixedBytes(_)
            | ParamType::Int(_)
            | ParamType::Uint(_)
            | ParamType::String
    )
}

/// Replays configured attack seeds, coercing each into the target type.
pub struct SeedStrategy {
    config: SeedConfig,
}

impl SeedStrategy {
    pub fn new(config: SeedConfig) -> Self {
        Self { config }
    }
}

impl MutationStrategy for SeedStrategy {
    fn name(&self) -> &'static str {
        "seed"
    }

    fn priority(&self) -> i32 {
        SEED_STRATEGY_PRIORITY
    }

    fn applicable(&self, _ty: &ParamType) -> bool {
        self.config.enabled
    }

    fn generate_variations(
        &self,
        _original: Option<&Token>,
        ty: &ParamType,
        count: usize,
    ) -> Vec<Token> {
        // hash-map order is not stable; iterate indices sorted so the same
        // config always replays in the same order
        self.config
            .attack_seeds
            .iter()
            .sorted_by_key(|(idx, _)| **idx)
            .flat_map(|(_, seeds)| seeds.iter())
            .filter_map(|seed| seed.coerce(ty))
            .take(count)
            .collect()
    }
}

/// Typed boundary sets first, deterministic random fills after.
pub struct AbiTypeStrategy {
    seed: u64,
}

impl AbiTypeStrategy {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    fn rng(&self, ty: &ParamType, count: usize) -> StdRng {
        let mut tag = [0u8; 32];
        crate::evm::abi::set_hash(&format!("{:?}/{}", ty, count), &mut tag);
        StdRng::seed_from_u64(self.seed ^ u64::from_be_bytes(tag[..8].try_into().unwrap()))
    }

    fn uint_boundaries(bits: usize) -> Vec<U256> {
        let max = if bits >= 256 {
            U256::MAX
        } else {
            (U256::one() << bits) - U256::one()
        };
        vec![
            U256::zero(),
            U256::one(),
            U256::from(2u64),
            U256::from(100u64),
            U256::from(1000u64),
            U256::exp10(18),
            U256::exp10(6),
            max - U256::one(),
            max,
        ]
    }

    fn int_boundaries(bits: usize) -> Vec<U256> {
        // two's complement words, the encoding Token::Int carries;
        // the sign-extended minimum is 2^256 - 2^(bits-1)
        let min = U256::MAX << (bits - 1);
        let max = (U256::one() << (bits - 1)) - U256::one();
        let minus_one = U256::MAX;
        vec![
            U256::zero(),
            U256::one(),
            minus_one,
            min,
            min + U256::one(),
            max - U256::one(),
            max,
        ]
    }
}

impl MutationStrategy for AbiTypeStrategy {
    fn name(&self) -> &'static str {
        "abi-type"
    }

    fn priority(&self) -> i32 {
        ABI_STRATEGY_PRIORITY
    }

    fn applicable(&self, ty: &ParamType) -> bool {
        is_primitive(ty)
    }

    fn generate_variations(
        &self,
        _original: Option<&Token>,
        ty: &ParamType,
        count: usize,
    ) -> Vec<Token> {
        let mut rng = self.rng(ty, count);
        let mut out: Vec<Token> = match ty {
            ParamType::Uint(bits) => Self::uint_boundaries(*bits)
                .into_iter()
                .map(Token::Uint)
                .collect(),
            ParamType::Int(bits) => Self::int_boundaries(*bits)
                .into_iter()
                .map(Token::Int)
                .collect(),
            ParamType::Address => vec![
                Token::Address(H160::zero()),
                Token::Address(H160::from_low_u64_be(1)),
                Token::Address(H160::from_low_u64_be(2)),
                Token::Address(H160::from_low_u64_be(0xdead)),
                Token::Address(H160::repeat_byte(0xff)),
            ],
            ParamType::Bool => vec![Token::Bool(false), Token::Bool(true)],
            ParamType::Bytes => vec![
                Token::Bytes(vec![]),
                Token::Bytes(vec![0x00]),
                Token::Bytes(vec![0xff]),
                Token::Bytes(vec![0x00; 4]),
                Token::Bytes(vec![0x00; 32]),
            ],
            ParamType::FixedBytes(size) => vec![
                Token::FixedBytes(vec![0x00; *size]),
                Token::FixedBytes(vec![0xff; *size]),
            ],
            ParamType::String => vec![
                Token::String(String::new()),
                Token::String("a".to_string()),
                Token::String("A".repeat(32)),
            ],
            _ => vec![],
        };

        while out.len() < count {
            let filler = match ty {
                ParamType::Uint(_) => Token::Uint(U256::from(rng.gen::<u64>())),
                ParamType::Int(_) => Token::Int(U256::from(rng.gen::<u64>())),
                ParamType::Address => Token::Address(H160::from_low_u64_be(rng.gen::<u64>())),
                ParamType::Bool => Token::Bool(rng.gen::<bool>()),
                ParamType::Bytes => {
                    let len = rng.gen_range(1..64);
                    Token::Bytes((0..len).map(|_| rng.gen::<u8>()).collect())
                }
                ParamType::FixedBytes(size) => {
                    Token::FixedBytes((0..*size).map(|_| rng.gen::<u8>()).collect())
                }
                ParamType::String => {
                    let len = rng.gen_range(1..32);
                    Token::String(
                        (0..len)
                            .map(|_| char::from(rng.gen_range(b'a'..=b'z')))
                            .collect(),
                    )
                }
                _ => break,
            };
            out.push(filler);
        }
        out.truncate(count.max(1));
        out
    }
}

/// Scales the original value by +-{1,5,10,50,100} percent.
pub struct RangePercentStrategy {
    percents: Vec<u32>,
}

impl RangePercentStrategy {
    pub fn new(percents: Vec<u32>) -> Self {
        Self { percents }
    }
}

impl Default for RangePercentStrategy {
    fn default() -> Self {
        Self::new(vec![1, 5, 10, 50, 100])
    }
}

impl MutationStrategy for RangePercentStrategy {
    fn name(&self) -> &'static str {
        "range-percent"
    }

    fn priority(&self) -> i32 {
        RANGE_STRATEGY_PRIORITY
    }

    fn applicable(&self, ty: &ParamType) -> bool {
        matches!(ty, ParamType::Uint(_) | ParamType::Int(_))
    }

    fn generate_variations(
        &self,
        original: Option<&Token>,
        ty: &ParamType,
        count: usize,
    ) -> Vec<Token> {
        let Some(original) = original else {
            return vec![];
        };
        let value = match original {
            Token::Uint(v) | Token::Int(v) => *v,
            _ => return vec![],
        };
        let mut out = Vec::new();
        for percent in &self.percents {
            let delta = value / U256::from(100u64) * U256::from(*percent);
            let up = value.saturating_add(delta);
            // unsigned values clamp at zero on the way down
            let down = value.saturating_sub(delta);
            match ty {
                ParamType::Uint(_) => {
                    out.push(Token::Uint(up));
                    out.push(Token::Uint(down));
                }
                ParamType::Int(_) => {
                    out.push(Token::Int(up));
                    out.push(Token::Int(value.overflowing_sub(delta).0));
                }
                _ => {}
            }
            if out.len() >= count {
                break;
            }
        }
        out.truncate(count);
        out
    }
}

/// The strategy suite wired into the pool manager: highest-priority
/// applicable strategy wins; the pool position picks the variation.
pub struct StrategyGenerator {
    strategies: Vec<Box<dyn MutationStrategy>>,
}

impl StrategyGenerator {
    pub fn new(seed_config: Option<SeedConfig>, campaign_seed: u64) -> Self {
        let mut strategies: Vec<Box<dyn MutationStrategy>> =
            vec![Box::new(AbiTypeStrategy::new(campaign_seed))];
        match seed_config {
            Some(config) => {
                strategies.push(Box::new(RangePercentStrategy::new(
                    config.range_mutation.percents.clone(),
                )));
                strategies.push(Box::new(SeedStrategy::new(config)));
            }
            None => strategies.push(Box::new(RangePercentStrategy::default())),
        }
        strategies.sort_by_key(|s| std::cmp::Reverse(s.priority()));
        Self { strategies }
    }
}

impl ParamGenerator for StrategyGenerator {
    fn generate(&self, ty: &ParamType, original: Option<&Token>, seed: u64) -> Option<Token> {
        for strategy in &self.strategies {
            if !strategy.applicable(ty) {
                continue;
            }
            let variations = strategy.generate_variations(original, ty, 16);
            if !variations.is_empty() {
                return Some(variations[seed as usize % variations.len()].clone());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evm::abi::SeedValue;
    use crate::evm::types::EVMU256;

    #[test]
    fn uint_boundaries_lead_the_set() {
        let strategy = AbiTypeStrategy::new(1);
        let variations = strategy.generate_variations(None, &ParamType::Uint(256), 9);
        assert_eq!(variations[0], Token::Uint(U256::zero()));
        assert_eq!(variations[8], Token::Uint(U256::MAX));
    }

    #[test]
    fn uint8_max_respects_width() {
        let strategy = AbiTypeStrategy::new(1);
        let variations = strategy.generate_variations(None, &ParamType::Uint(8), 9);
        assert_eq!(variations[8], Token::Uint(U256::from(255u64)));
        assert_eq!(variations[7], Token::Uint(U256::from(254u64)));
    }

    #[test]
    fn abi_strategy_is_deterministic() {
        let a = AbiTypeStrategy::new(7).generate_variations(None, &ParamType::Bytes, 12);
        let b = AbiTypeStrategy::new(7).generate_variations(None, &ParamType::Bytes, 12);
        assert_eq!(a, b);
        let c = AbiTypeStrategy::new(8).generate_variations(None, &ParamType::Bytes, 12);
        assert_ne!(a, c);
    }

    #[test]
    fn range_percent_clamps_unsigned_at_zero() {
        let strategy = RangePercentStrategy::default();
        let original = Token::Uint(U256::from(100u64));
        let variations = strategy.generate_variations(Some(&original), &ParamType::Uint(256), 10);
        assert!(variations.contains(&Token::Uint(U256::from(101u64))));
        assert!(variations.contains(&Token::Uint(U256::from(99u64))));
        assert!(variations.contains(&Token::Uint(U256::zero())));
        assert!(variations.iter().all(|t| matches!(t, Token::Uint(_))));

        assert!(strategy
            .generate_variations(None, &ParamType::Uint(256), 4)
            .is_empty());
    }

    #[test]
    fn seed_strategy_coerces_in_order() {
        let mut config = SeedConfig {
            enabled: true,
            ..Default::default()
        };
        config.attack_seeds.insert(
            1,
            vec![SeedValue::Str("skip".into()), SeedValue::Int(EVMU256::from(9u64))],
        );
        config
            .attack_seeds
            .insert(0, vec![SeedValue::Int(EVMU256::from(4u64))]);
        let strategy = SeedStrategy::new(config);
        let variations = strategy.generate_variations(None, &ParamType::Uint(256), 8);
        // index order, uncoercible seeds skipped
        assert_eq!(
            variations,
            vec![
                Token::Uint(U256::from(4u64)),
                Token::Uint(U256::from(9u64))
            ]
        );
    }

    #[test]
    fn generator_prefers_seed_strategy() {
        let mut config = SeedConfig {
            enabled: true,
            ..Default::default()
        };
        config
            .attack_seeds
            .insert(0, vec![SeedValue::Int(EVMU256::from(1234u64))]);
        let generator = StrategyGenerator::new(Some(config), 0);
        assert_eq!(
            generator.generate(&ParamType::Uint(256), None, 0),
            Some(Token::Uint(U256::from(1234u64)))
        );
    }
}
