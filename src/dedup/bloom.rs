// src/dedup/bloom.rs
//! Bloom filter over canonical keys, persisted between cycles.
//!
//! Index derivation is double hashing over one SHA-256 digest:
//! `h1 + i * h2 mod m` for `i in 0..k`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BloomFilter {
    num_bits: u64,
    num_hashes: u32,
    expected_items: usize,
    false_positive_rate: f64,
    inserted: u64,
    #[serde(with = "bits_b64")]
    bits: Vec<u8>,
}

impl BloomFilter {
    /// Sized for `expected_items` at `false_positive_rate`.
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let p = false_positive_rate.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;
        let m = (-(n * p.ln()) / (ln2 * ln2)).ceil().max(64.0) as u64;
        let k = ((m as f64 / n) * ln2).round().clamp(1.0, 16.0) as u32;
        Self {
            num_bits: m,
            num_hashes: k,
            expected_items,
            false_positive_rate,
            inserted: 0,
            bits: vec![0; m.div_ceil(8) as usize],
        }
    }

    /// True when this filter was built for the given sizing parameters.
    pub fn matches_params(&self, expected_items: usize, false_positive_rate: f64) -> bool {
        self.num_bits > 0
            && self.num_hashes > 0
            && self.expected_items == expected_items
            && (self.false_positive_rate - false_positive_rate).abs() < f64::EPSILON
            && self.bits.len() as u64 == self.num_bits.div_ceil(8)
    }

    fn indexes(&self, key: &str) -> impl Iterator<Item = u64> + '_ {
        let digest = Sha256::digest(key.as_bytes());
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        a.copy_from_slice(&digest[0..8]);
        b.copy_from_slice(&digest[8..16]);
        let h1 = u64::from_le_bytes(a);
        // odd step so every index is reachable
        let h2 = u64::from_le_bytes(b) | 1;
        (0..self.num_hashes as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits)
    }

    pub fn insert(&mut self, key: &str) {
        let idx: Vec<u64> = self.indexes(key).collect();
        for i in idx {
            self.bits[(i / 8) as usize] |= 1 << (i % 8);
        }
        self.inserted += 1;
    }

    /// `false` is definite; `true` may be a false positive.
    pub fn contains(&self, key: &str) -> bool {
        self.indexes(key)
            .all(|i| self.bits[(i / 8) as usize] & (1 << (i % 8)) != 0)
    }

    pub fn inserted(&self) -> u64 {
        self.inserted
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }
}

mod bits_b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizing_for_one_percent() {
        let f = BloomFilter::new(1_000, 0.01);
        // ~9.6 bits per item, 7 hashes
        assert!((9_000..10_500).contains(&f.num_bits()));
        assert_eq!(f.num_hashes(), 7);
    }

    #[test]
    fn no_false_negatives() {
        let mut f = BloomFilter::new(500, 0.01);
        for i in 0..500 {
            f.insert(&format!("key-{i}"));
        }
        assert!((0..500).all(|i| f.contains(&format!("key-{i}"))));
    }

    #[test]
    fn false_positive_rate_is_near_target() {
        let mut f = BloomFilter::new(2_000, 0.01);
        for i in 0..2_000 {
            f.insert(&format!("in-{i}"));
        }
        let fp = (0..10_000).filter(|i| f.contains(&format!("out-{i}"))).count();
        assert!(fp < 300, "false positives: {fp}");
    }

    #[test]
    fn survives_serde() {
        let mut f = BloomFilter::new(100, 0.01);
        f.insert("a");
        let json = serde_json::to_string(&f).unwrap();
        let back: BloomFilter = serde_json::from_str(&json).unwrap();
        assert!(back.contains("a"));
        assert!(back.matches_params(100, 0.01));
    }

    #[test]
    fn zero_sized_state_is_not_reused() {
        let json = r#"{"num_bits":0,"num_hashes":0,"expected_items":100,"false_positive_rate":0.01,"inserted":0,"bits":""}"#;
        let f: BloomFilter = serde_json::from_str(json).unwrap();
        assert!(!f.matches_params(100, 0.01));
    }
}
