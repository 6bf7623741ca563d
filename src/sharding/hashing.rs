//! Key hashing algorithms for the shard ring.

use crate::error::{RedshardError, Result};
use std::str::FromStr;

/// Seed used by the MurmurHash64A variant.
const MURMUR_SEED: u64 = 0x1234_ABCD;

/// Hash function used to place nodes and keys on the ring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Hashing {
    /// MurmurHash64A, seed `0x1234ABCD`.
    #[default]
    Murmur64A,
    /// First four bytes of the MD5 digest, little-endian.
    Md5,
}

impl Hashing {
    pub fn hash(&self, data: &[u8]) -> u64 {
        match self {
            Self::Murmur64A => murmur64a(data, MURMUR_SEED),
            Self::Md5 => md5_hash(data),
        }
    }
}

impl FromStr for Hashing {
    type Err = RedshardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "murmur" | "murmur64a" => Ok(Self::Murmur64A),
            "md5" => Ok(Self::Md5),
            other => Err(RedshardError::Config(format!(
                "unknown hashing algorithm: {other}"
            ))),
        }
    }
}

/// MurmurHash64A over little-endian 8-byte blocks.
pub fn murmur64a(data: &[u8], seed: u64) -> u64 {
    const M: u64 = 0xc6a4_a793_5bd1_e995;
    const R: u32 = 47;

    let mut h = seed ^ (data.len() as u64).wrapping_mul(M);

    let mut blocks = data.chunks_exact(8);
    for block in &mut blocks {
        let mut k = u64::from_le_bytes([
            block[0], block[1], block[2], block[3], block[4], block[5], block[6], block[7],
        ]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);

        h ^= k;
        h = h.wrapping_mul(M);
    }

    let tail = blocks.remainder();
    if !tail.is_empty() {
        let mut last = [0u8; 8];
        last[..tail.len()].copy_from_slice(tail);
        h ^= u64::from_le_bytes(last);
        h = h.wrapping_mul(M);
    }

    h ^= h >> R;
    h = h.wrapping_mul(M);
    h ^= h >> R;
    h
}

fn md5_hash(data: &[u8]) -> u64 {
    let digest = md5::compute(data);
    let bytes = digest.0;
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn murmur_is_deterministic() {
        let a = Hashing::Murmur64A.hash(b"some-key");
        let b = Hashing::Murmur64A.hash(b"some-key");
        assert_eq!(a, b);
        assert_ne!(a, Hashing::Murmur64A.hash(b"some-kez"));
    }

    #[test]
    fn murmur_tail_bytes_matter() {
        // 8-byte block plus differing tails
        assert_ne!(
            murmur64a(b"12345678a", MURMUR_SEED),
            murmur64a(b"12345678b", MURMUR_SEED)
        );
        assert_ne!(murmur64a(b"", MURMUR_SEED), murmur64a(b"", 0));
    }

    #[test]
    fn md5_uses_first_four_digest_bytes() {
        // md5("") = d41d8cd98f00b204e9800998ecf8427e
        assert_eq!(Hashing::Md5.hash(b""), 0xd98c_1dd4);
        assert!(Hashing::Md5.hash(b"anything") <= u32::MAX as u64);
    }

    #[test]
    fn parse_names() {
        assert_eq!("md5".parse::<Hashing>().unwrap(), Hashing::Md5);
        assert_eq!("MURMUR".parse::<Hashing>().unwrap(), Hashing::Murmur64A);
        assert!("crc32".parse::<Hashing>().is_err());
    }
}
