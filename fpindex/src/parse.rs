//! Conversion of host-supplied strings into index arguments.
//!
//! Malformed input is rejected here, before it reaches the tree.

use crate::error::{IndexError, Result};

/// Signed decimal id.
pub fn parse_id(s: &str) -> Result<i64> {
    s.trim()
        .parse()
        .map_err(|_| IndexError::InvalidId(s.to_owned()))
}

/// Query radius: a finite number `>= 0`.
pub fn parse_radius(s: &str) -> Result<f64> {
    match s.trim().parse::<f64>() {
        Ok(r) if r.is_finite() && r >= 0.0 => Ok(r),
        _ => Err(IndexError::InvalidRadius(s.to_owned())),
    }
}

/// Unsigned decimal fingerprint, or hexadecimal with a `0x` prefix.
pub fn parse_fingerprint(s: &str) -> Result<u64> {
    let t = s.trim();
    let parsed = match t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => t.parse(),
    };
    parsed.map_err(|_| IndexError::InvalidFingerprint(s.to_owned()))
}
