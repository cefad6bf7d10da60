//! Key-to-bucket hashing.
//!
//! Three algorithms are offered. `Native` is the fastest but only stable
//! within one process; the two compat algorithms produce the same bucket
//! placement from any process and are the ones to use when several client
//! instances share a server farm.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Key hashing algorithm used for bucket selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashAlg {
    /// Process-local string hash. Not stable across processes.
    #[default]
    Native,
    /// Multiply-by-33 rolling hash over UTF-16 code units.
    OldCompat,
    /// CRC-32 of the UTF-8 bytes folded to 15 bits.
    NewCompat,
}

impl HashAlg {
    /// Hash a key to a signed 32-bit value.
    pub fn hash(&self, key: &str) -> i32 {
        match self {
            HashAlg::Native => native_hash(key),
            HashAlg::OldCompat => compat_hash(key),
            HashAlg::NewCompat => crc32_hash(key),
        }
    }
}

fn native_hash(key: &str) -> i32 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish() as i32
}

fn compat_hash(key: &str) -> i32 {
    let mut hash: i32 = 0;
    for unit in key.encode_utf16() {
        hash = hash.wrapping_mul(33).wrapping_add(unit as i32);
    }
    hash
}

fn crc32_hash(key: &str) -> i32 {
    ((crc32(key.as_bytes()) >> 16) & 0x7fff) as i32
}

/// Map a hash value onto a bucket index in `0..bucket_count`.
pub fn bucket_index(hash: i32, bucket_count: usize) -> usize {
    debug_assert!(bucket_count > 0);
    hash.rem_euclid(bucket_count as i32) as usize
}

// CRC-32 (IEEE reflected polynomial), table-driven.
const CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut c = i as u32;
        let mut k = 0;
        while k < 8 {
            c = if c & 1 != 0 {
                0xedb8_8320 ^ (c >> 1)
            } else {
                c >> 1
            };
            k += 1;
        }
        table[i] = c;
        i += 1;
    }
    table
};

fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xffff_ffffu32;
    for &byte in data {
        crc = CRC32_TABLE[((crc ^ byte as u32) & 0xff) as usize] ^ (crc >> 8);
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_check_value() {
        // Standard CRC-32 check vector.
        assert_eq!(crc32(b"123456789"), 0xcbf4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn compat_known_values() {
        assert_eq!(HashAlg::OldCompat.hash(""), 0);
        assert_eq!(HashAlg::OldCompat.hash("a"), 97);
        assert_eq!(HashAlg::OldCompat.hash("ab"), 97 * 33 + 98);
    }

    #[test]
    fn new_compat_is_folded() {
        // 15-bit fold leaves no high bits set.
        for key in ["", "a", "some-longer-key", "counter:123"] {
            let hash = HashAlg::NewCompat.hash(key);
            assert!((0..=0x7fff).contains(&hash), "hash {hash} out of range");
        }
    }

    #[test]
    fn native_stable_within_process() {
        assert_eq!(HashAlg::Native.hash("key"), HashAlg::Native.hash("key"));
    }

    #[test]
    fn bucket_index_handles_negative() {
        assert_eq!(bucket_index(-7, 3), (-7i32).rem_euclid(3) as usize);
        assert_eq!(bucket_index(i32::MIN, 7), (i32::MIN).rem_euclid(7) as usize);
        assert_eq!(bucket_index(5, 3), 2);
    }

    #[test]
    fn distributes() {
        let mut counts = [0u32; 4];
        for i in 0..1000u32 {
            let key = format!("key-{i}");
            counts[bucket_index(HashAlg::NewCompat.hash(&key), 4)] += 1;
        }
        for count in &counts {
            assert!(*count > 100, "poor distribution: {counts:?}");
        }
    }
}
