use std::fmt;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Content identifier: the SHA-1 of a fragment or segment payload.
///
/// Fragments are keyed by the digest of their raw user bytes, never the
/// compressed form, so identical content always collides into one entry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Sha1Sum(pub [u8; 20]);

impl Sha1Sum {
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut out = [0u8; 40];
        for (i, b) in self.0.iter().copied().enumerate() {
            out[i * 2] = HEX[(b >> 4) as usize];
            out[i * 2 + 1] = HEX[(b & 0xF) as usize];
        }
        String::from_utf8_lossy(&out).into_owned()
    }
}

impl From<[u8; 20]> for Sha1Sum {
    fn from(raw: [u8; 20]) -> Self {
        Sha1Sum(raw)
    }
}

impl fmt::Debug for Sha1Sum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha1Sum({})", self.to_hex())
    }
}

/// Incremental accumulator with an API shaped like the digest it wraps.
pub struct Checksum(Sha1);

impl Checksum {
    pub fn new() -> Checksum {
        Checksum(Sha1::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> Sha1Sum {
        Sha1Sum(self.0.finalize().into())
    }
}

impl Default for Checksum {
    fn default() -> Self {
        Self::new()
    }
}

pub fn sum(data: &[u8]) -> Sha1Sum {
    let mut h = Checksum::new();
    h.update(data);
    h.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_digest() {
        // Known digest of the ASCII bytes "hello"
        assert_eq!(
            sum(b"hello").to_hex(),
            "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"
        );
    }

    #[test]
    fn incremental_matches_oneshot() {
        let mut h = Checksum::new();
        h.update(b"hel");
        h.update(b"lo");
        assert_eq!(h.finalize(), sum(b"hello"));
    }

    #[test]
    fn empty_input() {
        assert_eq!(
            sum(b"").to_hex(),
            "da39a3ee5e6b4b0d3255bfef95601890afd80709"
        );
    }
}
