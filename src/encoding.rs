//! Feature hashing of request contexts into fixed-size vectors.
//!
//! Contextual algorithms need a numeric feature vector of a fixed dimension
//! `d`. Arbitrary key/value contexts are hashed into `d` buckets:
//!
//! ```text
//! index 0          : bias term, always 1.0 before normalization
//! number  k = v    : bucket(fnv1a32("k"))         += v
//! boolean k = b    : bucket(fnv1a32("k"))         += 1.0 if b
//! string  k = "s"  : bucket(fnv1a32("k=\"s\""))   += 1.0
//! ```
//!
//! Collisions are accepted. Entries are folded in sorted key order so two
//! maps with the same contents always produce bit-identical vectors.

use std::collections::HashMap;

use serde_json::Value;

/// A request context: string keys mapped to JSON scalars.
pub type Context = HashMap<String, Value>;

const FNV32_OFFSET: u32 = 0x811c_9dc5;
const FNV32_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a over bytes.
#[must_use]
pub fn fnv1a32(bytes: &[u8]) -> u32 {
    let mut h = FNV32_OFFSET;
    for b in bytes {
        h ^= u32::from(*b);
        h = h.wrapping_mul(FNV32_PRIME);
    }
    h
}

#[inline]
fn bucket(bytes: &[u8], d: usize) -> usize {
    fnv1a32(bytes) as usize % d
}

/// Encode a context into an L2-normalized vector of length `d`.
///
/// Nulls, arrays and objects carry no signal and are skipped. A zero vector
/// (only possible when a numeric value cancels the bias) is returned as-is.
#[must_use]
pub fn encode_context(ctx: &Context, d: usize) -> Vec<f64> {
    if d == 0 {
        return Vec::new();
    }

    let mut x = vec![0.0; d];
    x[0] = 1.0;

    let mut entries: Vec<(&String, &Value)> = ctx.iter().collect();
    entries.sort_unstable_by(|a, b| a.0.cmp(b.0));

    for (key, value) in entries {
        match value {
            Value::Number(n) => {
                if let Some(v) = n.as_f64().filter(|v| v.is_finite()) {
                    x[bucket(key.as_bytes(), d)] += v;
                }
            }
            Value::Bool(b) => {
                if *b {
                    x[bucket(key.as_bytes(), d)] += 1.0;
                }
            }
            Value::String(s) => {
                let pair = format!("{key}=\"{s}\"");
                x[bucket(pair.as_bytes(), d)] += 1.0;
            }
            Value::Null | Value::Array(_) | Value::Object(_) => {}
        }
    }

    // Scale by the largest magnitude first so squaring cannot overflow.
    let scale = x.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    if !scale.is_finite() {
        for v in &mut x {
            *v = if v.is_infinite() { v.signum() } else { 0.0 };
        }
    } else if scale > 0.0 {
        for v in &mut x {
            *v /= scale;
        }
    }

    let norm = x.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm > 0.0 {
        for v in &mut x {
            *v /= norm;
        }
    }
    x
}
