//! Optional at-rest key encryption.
//!
//! Supplied by the embedding storage; the tree only needs the two
//! transformations and a stable name for the component-operation records.

use crate::error::Result;

/// Encrypts serialized keys before they are written to a page.
pub trait Encryption: Send + Sync {
    /// Stable provider name, recorded alongside encrypted operations
    fn name(&self) -> &str;

    /// Encrypt a serialized key. The output may be longer than the input.
    fn encrypt(&self, plain: &[u8]) -> Vec<u8>;

    /// Decrypt bytes previously produced by [`Encryption::encrypt`]
    fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Trivial reversible cipher for tests; not a real cryptographic
    /// provider.
    pub struct XorEncryption {
        pub key: u8,
    }

    impl Encryption for XorEncryption {
        fn name(&self) -> &str {
            "test-xor"
        }

        fn encrypt(&self, plain: &[u8]) -> Vec<u8> {
            plain.iter().map(|b| b ^ self.key).collect()
        }

        fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>> {
            Ok(cipher.iter().map(|b| b ^ self.key).collect())
        }
    }
}
