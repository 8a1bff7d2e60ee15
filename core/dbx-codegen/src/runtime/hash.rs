//! Pre-hash used by generated maps
//!
//! Row-at-a-time code calls `pre_hash` per key and batch code calls the
//! vector hash primitive; both land here so the two styles agree bit for bit.

use crate::error::DbxResult;
use crate::runtime::value::Value;
use ahash::RandomState;
use std::sync::OnceLock;

fn state() -> &'static RandomState {
    static STATE: OnceLock<RandomState> = OnceLock::new();
    STATE.get_or_init(|| {
        RandomState::with_seeds(
            0x243f_6a88_85a3_08d3,
            0x1319_8a2e_0370_7344,
            0xa409_3822_299f_31d0,
            0x082e_fa98_ec4e_6c89,
        )
    })
}

/// Integer-like keys hash through their `i64` value.
pub fn pre_hash_i64(v: i64) -> i64 {
    state().hash_one(v) as i64
}

pub fn pre_hash_f64(v: f64) -> i64 {
    // -0.0 == 0.0 must land in the same slot
    let v = if v == 0.0 { 0.0 } else { v };
    state().hash_one(v.to_bits()) as i64
}

pub fn pre_hash_bytes(v: &[u8]) -> i64 {
    state().hash_one(v) as i64
}

pub fn pre_hash(value: &Value) -> DbxResult<i64> {
    match value {
        Value::Double(d) => Ok(pre_hash_f64(*d)),
        Value::Bytes(b) => Ok(pre_hash_bytes(b)),
        other => Ok(pre_hash_i64(other.as_i64()?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_widths_hash_alike() {
        assert_eq!(pre_hash(&Value::Int(42)).unwrap(), pre_hash(&Value::Long(42)).unwrap());
        assert_ne!(pre_hash_i64(1), pre_hash_i64(2));
    }

    #[test]
    fn test_signed_zero() {
        assert_eq!(pre_hash_f64(0.0), pre_hash_f64(-0.0));
    }

    #[test]
    fn test_non_scalar_is_rejected() {
        assert!(pre_hash(&Value::Unit).is_err());
    }
}
