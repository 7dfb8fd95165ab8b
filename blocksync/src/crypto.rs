//! Cryptographic primitives used by the synchronizer.
//!
//! Only block identity is needed here: a 32-byte Keccak-256 digest. Dependents should not care about the underlying
//! hash function.

use std::fmt::Display;

use sha3::{Digest, Keccak256};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, std::hash::Hash)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub const ZERO: Hash = Hash([0; 32]);

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn compute<T: AsRef<[S]>, S: AsRef<[u8]>>(preimages: T) -> Hash {
        let mut hasher = Keccak256::new();
        for preimage in preimages.as_ref() {
            hasher.update(preimage.as_ref());
        }
        Self(hasher.finalize().into())
    }

    pub fn builder() -> HashBuilder {
        HashBuilder(Keccak256::new())
    }

    /// The first four bytes, hex encoded. Used in log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

/// Incrementally hashes a sequence of fields.
pub struct HashBuilder(Keccak256);

impl HashBuilder {
    pub fn with(mut self, bytes: impl AsRef<[u8]>) -> Self {
        self.0.update(bytes.as_ref());
        self
    }

    pub fn finalize(self) -> Hash {
        Hash(self.0.finalize().into())
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.as_bytes()))
    }
}

impl std::fmt::Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::Hash;

    #[test]
    fn builder_matches_compute() {
        let a = Hash::compute([b"abc".as_slice(), b"def".as_slice()]);
        let b = Hash::builder().with(b"abc").with(b"def").finalize();
        assert_eq!(a, b);
        assert_ne!(a, Hash::ZERO);
    }

    #[test]
    fn hex_display() {
        let hash = Hash::compute([b"block"]);
        let hex = hash.to_string();
        assert_eq!(hex.len(), 64);
        assert_eq!(format!("{hash:?}"), hex);
        assert_eq!(hash.short(), &hex[..8]);
    }
}
