//! Key handling: composite keys, serialization, optional encryption.

mod composite;
mod encryption;
mod serializer;

pub use composite::{Boundary, CompositeKey, KeyItem, KeyType};
pub use encryption::Encryption;
pub use serializer::{CompositeKeySerializer, KeySerializer};

#[cfg(test)]
pub(crate) use encryption::testing::XorEncryption;

use crate::error::{Result, TreeError};
use std::cmp::Ordering;
use std::sync::Arc;

/// Bundles the serializer and the optional encryption provider, and owns
/// the page-level key format.
///
/// Without encryption a stored key field is the serialized key verbatim.
/// With encryption it is `[plaintext length u32 BE][ciphertext]`.
#[derive(Clone)]
pub struct KeyCodec {
    serializer: Arc<dyn KeySerializer>,
    encryption: Option<Arc<dyn Encryption>>,
    max_key_size: usize,
}

impl KeyCodec {
    /// Create a codec
    pub fn new(
        serializer: Arc<dyn KeySerializer>,
        encryption: Option<Arc<dyn Encryption>>,
        max_key_size: usize,
    ) -> Self {
        Self {
            serializer,
            encryption,
            max_key_size,
        }
    }

    /// The serializer identifier
    pub fn serializer_id(&self) -> u8 {
        self.serializer.id()
    }

    /// Name of the encryption provider, if one is configured
    pub fn encryption_name(&self) -> Option<&str> {
        self.encryption.as_deref().map(Encryption::name)
    }

    /// The underlying serializer
    pub fn serializer(&self) -> &Arc<dyn KeySerializer> {
        &self.serializer
    }

    /// Encode a key into its stored form, enforcing the size limit
    pub fn encode(&self, key: &CompositeKey) -> Result<Vec<u8>> {
        let plain = self.serializer.serialize(key)?;
        let stored = match &self.encryption {
            None => plain,
            Some(enc) => {
                let cipher = enc.encrypt(&plain);
                let mut out = Vec::with_capacity(4 + cipher.len());
                out.extend_from_slice(&(plain.len() as u32).to_be_bytes());
                out.extend_from_slice(&cipher);
                out
            }
        };
        if stored.len() > self.max_key_size {
            return Err(TreeError::KeyTooLarge {
                size: stored.len(),
                max: self.max_key_size,
            });
        }
        Ok(stored)
    }

    /// Decode a stored key field back into a key
    pub fn decode(&self, stored: &[u8]) -> Result<CompositeKey> {
        match &self.encryption {
            None => self.serializer.deserialize(stored),
            Some(enc) => {
                if stored.len() < 4 {
                    return Err(TreeError::invalid_key("encrypted key field too short"));
                }
                let plain_len =
                    u32::from_be_bytes([stored[0], stored[1], stored[2], stored[3]]) as usize;
                let plain = enc.decrypt(&stored[4..])?;
                if plain.len() < plain_len {
                    return Err(TreeError::invalid_key("decrypted key shorter than declared"));
                }
                self.serializer.deserialize(&plain[..plain_len])
            }
        }
    }

    /// Compare a stored key field against an in-memory probe key
    pub fn compare(&self, stored: &[u8], probe: &CompositeKey) -> Result<Ordering> {
        Ok(self.decode(stored)?.cmp(probe))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DEFAULT_MAX_KEY_SIZE;

    fn plain_codec() -> KeyCodec {
        KeyCodec::new(Arc::new(CompositeKeySerializer), None, DEFAULT_MAX_KEY_SIZE)
    }

    #[test]
    fn test_plain_roundtrip() {
        let codec = plain_codec();
        let key = CompositeKey::new(vec![KeyItem::Str("k".into()), KeyItem::Int(9)]);
        let stored = codec.encode(&key).unwrap();
        assert_eq!(codec.decode(&stored).unwrap(), key);
    }

    #[test]
    fn test_encrypted_roundtrip() {
        let codec = KeyCodec::new(
            Arc::new(CompositeKeySerializer),
            Some(Arc::new(XorEncryption { key: 0x5A })),
            DEFAULT_MAX_KEY_SIZE,
        );
        let key = CompositeKey::str("secret");
        let stored = codec.encode(&key).unwrap();

        // The stored field carries the plaintext length up front and is not
        // the raw serialization.
        let plain = CompositeKeySerializer.serialize(&key).unwrap();
        assert_eq!(
            u32::from_be_bytes([stored[0], stored[1], stored[2], stored[3]]) as usize,
            plain.len()
        );
        assert_ne!(&stored[4..], plain.as_slice());

        assert_eq!(codec.decode(&stored).unwrap(), key);
    }

    #[test]
    fn test_oversize_rejected() {
        let codec = KeyCodec::new(Arc::new(CompositeKeySerializer), None, 8);
        let key = CompositeKey::str("much too long for eight bytes");
        match codec.encode(&key) {
            Err(TreeError::KeyTooLarge { max: 8, .. }) => {}
            other => panic!("expected KeyTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn test_compare_via_stored_bytes() {
        let codec = plain_codec();
        let stored = codec.encode(&CompositeKey::int(5)).unwrap();
        assert_eq!(
            codec.compare(&stored, &CompositeKey::int(7)).unwrap(),
            Ordering::Less
        );
        assert_eq!(
            codec.compare(&stored, &CompositeKey::int(5)).unwrap(),
            Ordering::Equal
        );
    }
}
