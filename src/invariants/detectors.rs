use crate::evm::types::EVMU256;

/// Per-field relative change computed by a detector.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldChange {
    pub field: &'static str,
    pub change_rate: f64,
    pub violated: bool,
}

pub fn u256_to_f64(v: EVMU256) -> f64 {
    // precision past 2^53 does not matter for change rates
    v.to_string().parse::<f64>().unwrap_or(f64::MAX)
}

fn change_rate(before: EVMU256, after: EVMU256) -> f64 {
    if before == EVMU256::ZERO {
        return 0.0;
    }
    let diff = if after > before {
        after - before
    } else {
        before - after
    };
    u256_to_f64(diff) / u256_to_f64(before)
}

/// Unpacked Uniswap V3 `slot0` word.
#[derive(Clone, Debug, PartialEq)]
pub struct V3Slot0 {
    pub sqrt_price_x96: EVMU256,
    pub tick: i32,
    pub observation_index: u16,
    pub observation_cardinality: u16,
    pub observation_cardinality_next: u16,
    pub fee_protocol: u8,
    pub unlocked: bool,
}

/// Unpacked Uniswap V2 `reserve0 || reserve1 || blockTimestampLast` word.
#[derive(Clone, Debug, PartialEq)]
pub struct V2Reserves {
    pub reserve0: EVMU256,
    pub reserve1: EVMU256,
    pub block_timestamp_last: u32,
}

const MAX_TICK: i64 = 887_272;

/// Heuristic detector for a packed storage layout. `check_change` compares
/// the meaningful fields of two packed words instead of the raw values,
/// which keeps compound slots from tripping flash-change invariants.
pub trait PackedDetector: Send + Sync {
    fn name(&self) -> &'static str;
    fn matches(&self, value: EVMU256) -> bool;
    fn check_change(&self, before: EVMU256, after: EVMU256, threshold: f64) -> Vec<FieldChange>;
}

pub struct V3Slot0Detector;

impl V3Slot0Detector {
    pub fn unpack(value: EVMU256) -> V3Slot0 {
        let mask160 = (EVMU256::from(1u64) << 160) - EVMU256::from(1u64);
        let sqrt_price_x96 = value & mask160;
        let raw_tick = ((value >> 160usize) & EVMU256::from(0xff_ffffu64)).as_limbs()[0] as i64;
        // sign-extend the 24-bit tick
        let tick = if raw_tick >= 1 << 23 {
            raw_tick - (1 << 24)
        } else {
            raw_tick
        } as i32;
        let word = |shift: usize, bits: u64| ((value >> shift) & EVMU256::from(bits)).as_limbs()[0];
        V3Slot0 {
            sqrt_price_x96,
            tick,
            observation_index: word(184, 0xffff) as u16,
            observation_cardinality: word(200, 0xffff) as u16,
            observation_cardinality_next: word(216, 0xffff) as u16,
            fee_protocol: word(232, 0xff) as u8,
            unlocked: word(240, 0x1) == 1,
        }
    }
}

impl PackedDetector for V3Slot0Detector {
    fn name(&self) -> &'static str {
        "uniswap-v3-slot0"
    }

    fn matches(&self, value: EVMU256) -> bool {
        let unpacked = Self::unpack(value);
        if unpacked.sqrt_price_x96 == EVMU256::ZERO {
            return false;
        }
        let tick = unpacked.tick as i64;
        // something must live above the price for this to be slot0 at all
        (value >> 160) != EVMU256::ZERO && (-MAX_TICK..=MAX_TICK).contains(&tick)
    }

    fn check_change(&self, before: EVMU256, after: EVMU256, threshold: f64) -> Vec<FieldChange> {
        let before = Self::unpack(before);
        let after = Self::unpack(after);
        let rate = change_rate(before.sqrt_price_x96, after.sqrt_price_x96);
        vec![FieldChange {
            field: "sqrtPriceX96",
            change_rate: rate,
            violated: rate > threshold,
        }]
    }
}

pub struct V2ReservesDetector;

impl V2ReservesDetector {
    pub fn unpack(value: EVMU256) -> V2Reserves {
        let mask112 = (EVMU256::from(1u64) << 112) - EVMU256::from(1u64);
        V2Reserves {
            reserve0: value >> 144,
            reserve1: (value >> 32) & mask112,
            block_timestamp_last: (value & EVMU256::from(0xffff_ffffu64)).as_limbs()[0] as u32,
        }
    }
}

impl PackedDetector for V2ReservesDetector {
    fn name(&self) -> &'static str {
        "uniswap-v2-reserves"
    }

    fn matches(&self, value: EVMU256) -> bool {
        if value < (EVMU256::from(1u64) << 144) {
            return false;
        }
        let unpacked = Self::unpack(value);
        let max = EVMU256::from(1u64) << 112;
        unpacked.reserve0 > EVMU256::ZERO
            && unpacked.reserve1 > EVMU256::ZERO
            && unpacked.reserve0 < max
            && unpacked.reserve1 < max
    }

    fn check_change(&self, before: EVMU256, after: EVMU256, threshold: f64) -> Vec<FieldChange> {
        let before = Self::unpack(before);
        let after = Self::unpack(after);
        let rate0 = change_rate(before.reserve0, after.reserve0);
        let rate1 = change_rate(before.reserve1, after.reserve1);
        vec![
            FieldChange {
                field: "reserve0",
                change_rate: rate0,
                violated: rate0 > threshold,
            },
            FieldChange {
                field: "reserve1",
                change_rate: rate1,
                violated: rate1 > threshold,
            },
        ]
    }
}

static DETECTORS: &[&(dyn PackedDetector)] = &[&V3Slot0Detector, &V2ReservesDetector];

/// Most-specific detector matching the value, if any.
pub fn detect(value: EVMU256) -> Option<&'static dyn PackedDetector> {
    DETECTORS.iter().copied().find(|d| d.matches(value))
}

/// Raw single-field change check used when no packed layout matches.
pub fn raw_change(before: EVMU256, after: EVMU256, threshold: f64) -> FieldChange {
    let rate = change_rate(before, after);
    FieldChange {
        field: "value",
        change_rate: rate,
        violated: rate > threshold,
    }
}
