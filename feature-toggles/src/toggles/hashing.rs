use sha1::{Digest, Sha1};
use std::fmt::Write;

const LONG_SCALE: u64 = 0xfffffffffffffff;

/// This function takes an identifier and a group key and returns a float between 0 and 1.
/// Given the same identifier and group, it'll always return the same float. These floats are
/// uniformly distributed between 0 and 1, so if we want to show this feature to 20% of traffic
/// we can do hash(group, identifier) < 0.2
pub fn hash_fraction(group: &str, identifier: &str) -> f64 {
    let hash_key = format!("{}.{}", group, identifier);
    let mut hasher = Sha1::new();
    hasher.update(hash_key.as_bytes());
    let result = hasher.finalize();
    // :TRICKY: only the first 15 hex characters of the digest are used, which fits in a u64
    let hex_str: String = result.iter().fold(String::new(), |mut acc, byte| {
        let _ = write!(acc, "{:02x}", byte);
        acc
    });
    let hash_val = u64::from_str_radix(&hex_str[..15], 16).unwrap_or(0);

    hash_val as f64 / LONG_SCALE as f64
}

/// Maps an identifier onto a bucket in `1..=modulus`.
pub fn normalized_hash(group: &str, identifier: &str, modulus: u32) -> u32 {
    let bucket = (hash_fraction(group, identifier) * f64::from(modulus)) as u32;
    bucket.min(modulus - 1) + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable() {
        let first = hash_fraction("my-toggle", "user-1");
        let second = hash_fraction("my-toggle", "user-1");
        assert_eq!(first, second);
        assert!((0.0..1.0).contains(&first));
        assert_ne!(first, hash_fraction("my-toggle", "user-2"));
    }

    #[test]
    fn test_normalized_hash_stays_in_range() {
        for i in 0..500 {
            let bucket = normalized_hash("group", &format!("user-{i}"), 100);
            assert!((1..=100).contains(&bucket));
        }
    }

    #[test]
    fn test_normalized_hash_is_roughly_uniform() {
        let below_half = (0..2000)
            .filter(|i| normalized_hash("rollout", &i.to_string(), 100) <= 50)
            .count();
        assert!((800..1200).contains(&below_half), "got {below_half}");
    }
}
