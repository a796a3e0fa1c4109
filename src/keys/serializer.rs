//! Key serialization.
//!
//! The tree never interprets key bytes itself; everything goes through a
//! [`KeySerializer`]. The stock implementation handles composite keys with
//! the wire format:
//!
//! ```text
//! [arity u8] then per item:
//!   tag 0x01  Int    8 bytes BE
//!   tag 0x02  Str    u16 BE length + UTF-8 bytes
//!   tag 0x03  Bytes  u16 BE length + bytes
//! ```
//!
//! Boundary sentinels are query-time artifacts and are rejected here.

use crate::error::{Result, TreeError};
use crate::keys::{CompositeKey, KeyItem};
use crate::types::TreeConfig;

const TAG_INT: u8 = 0x01;
const TAG_STR: u8 = 0x02;
const TAG_BYTES: u8 = 0x03;

/// Encodes and decodes keys for storage on pages.
pub trait KeySerializer: Send + Sync {
    /// Serializer identifier, stamped into component-operation records
    fn id(&self) -> u8;

    /// Validate a key against the tree configuration and return the form
    /// that will actually be stored
    fn preprocess(&self, key: &CompositeKey, config: &TreeConfig) -> Result<CompositeKey>;

    /// Serialize a key to bytes
    fn serialize(&self, key: &CompositeKey) -> Result<Vec<u8>>;

    /// Deserialize a key from bytes
    fn deserialize(&self, bytes: &[u8]) -> Result<CompositeKey>;

    /// Length in bytes of the serialized key starting at `bytes[0]`
    fn object_size(&self, bytes: &[u8]) -> Result<usize>;
}

/// The stock composite-key serializer
#[derive(Debug, Default)]
pub struct CompositeKeySerializer;

impl KeySerializer for CompositeKeySerializer {
    fn id(&self) -> u8 {
        1
    }

    fn preprocess(&self, key: &CompositeKey, config: &TreeConfig) -> Result<CompositeKey> {
        if key.arity() == 0 || key.arity() > config.key_size {
            return Err(TreeError::invalid_key(format!(
                "key has {} items, tree accepts 1..={}",
                key.arity(),
                config.key_size
            )));
        }
        for (i, item) in key.items().iter().enumerate() {
            if item.is_sentinel() {
                return Err(TreeError::invalid_key("boundary sentinels cannot be stored"));
            }
            if !item.matches(config.key_types[i]) {
                return Err(TreeError::invalid_key(format!(
                    "item {i} does not match declared type {:?}",
                    config.key_types[i]
                )));
            }
        }
        Ok(key.clone())
    }

    fn serialize(&self, key: &CompositeKey) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(16);
        if key.arity() > u8::MAX as usize {
            return Err(TreeError::invalid_key("key arity exceeds 255"));
        }
        buf.push(key.arity() as u8);
        for item in key.items() {
            match item {
                KeyItem::Int(v) => {
                    buf.push(TAG_INT);
                    buf.extend_from_slice(&v.to_be_bytes());
                }
                KeyItem::Str(s) => {
                    buf.push(TAG_STR);
                    push_len_prefixed(&mut buf, s.as_bytes())?;
                }
                KeyItem::Bytes(b) => {
                    buf.push(TAG_BYTES);
                    push_len_prefixed(&mut buf, b)?;
                }
                KeyItem::AlwaysLess | KeyItem::AlwaysGreater => {
                    return Err(TreeError::invalid_key("boundary sentinels cannot be stored"));
                }
            }
        }
        Ok(buf)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<CompositeKey> {
        let (key, _) = decode_key(bytes)?;
        Ok(key)
    }

    fn object_size(&self, bytes: &[u8]) -> Result<usize> {
        let (_, consumed) = decode_key(bytes)?;
        Ok(consumed)
    }
}

fn push_len_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    if bytes.len() > u16::MAX as usize {
        return Err(TreeError::invalid_key("key item longer than 65535 bytes"));
    }
    buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

fn decode_key(bytes: &[u8]) -> Result<(CompositeKey, usize)> {
    if bytes.is_empty() {
        return Err(TreeError::invalid_key("empty key bytes"));
    }
    let arity = bytes[0] as usize;
    let mut offset = 1;
    let mut items = Vec::with_capacity(arity);
    for _ in 0..arity {
        if offset >= bytes.len() {
            return Err(TreeError::invalid_key("truncated key bytes"));
        }
        let tag = bytes[offset];
        offset += 1;
        match tag {
            TAG_INT => {
                let end = offset + 8;
                if end > bytes.len() {
                    return Err(TreeError::invalid_key("truncated integer item"));
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes[offset..end]);
                items.push(KeyItem::Int(i64::from_be_bytes(raw)));
                offset = end;
            }
            TAG_STR | TAG_BYTES => {
                if offset + 2 > bytes.len() {
                    return Err(TreeError::invalid_key("truncated item length"));
                }
                let len = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]) as usize;
                offset += 2;
                let end = offset + len;
                if end > bytes.len() {
                    return Err(TreeError::invalid_key("truncated item payload"));
                }
                let payload = bytes[offset..end].to_vec();
                if tag == TAG_STR {
                    let s = String::from_utf8(payload)
                        .map_err(|_| TreeError::invalid_key("string item is not UTF-8"))?;
                    items.push(KeyItem::Str(s));
                } else {
                    items.push(KeyItem::Bytes(payload));
                }
                offset = end;
            }
            other => {
                return Err(TreeError::invalid_key(format!("unknown item tag 0x{other:02x}")));
            }
        }
    }
    Ok((CompositeKey::new(items), offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyType;

    fn config(types: Vec<KeyType>) -> TreeConfig {
        TreeConfig::new(0, types)
    }

    #[test]
    fn test_serialize_roundtrip() {
        let ser = CompositeKeySerializer;
        let keys = [
            CompositeKey::int(42),
            CompositeKey::int(-42),
            CompositeKey::str("hello"),
            CompositeKey::new(vec![
                KeyItem::Str("user".into()),
                KeyItem::Int(1001),
                KeyItem::Bytes(vec![0, 1, 2, 255]),
            ]),
        ];

        for key in keys {
            let bytes = ser.serialize(&key).unwrap();
            assert_eq!(ser.deserialize(&bytes).unwrap(), key);
            assert_eq!(ser.object_size(&bytes).unwrap(), bytes.len());
        }
    }

    #[test]
    fn test_object_size_with_trailing_bytes() {
        let ser = CompositeKeySerializer;
        let mut bytes = ser.serialize(&CompositeKey::str("k")).unwrap();
        let clean_len = bytes.len();
        bytes.extend_from_slice(&[0xAA; 7]);
        assert_eq!(ser.object_size(&bytes).unwrap(), clean_len);
    }

    #[test]
    fn test_preprocess_validates_types() {
        let ser = CompositeKeySerializer;
        let cfg = config(vec![KeyType::Str, KeyType::Int]);

        let good = CompositeKey::new(vec![KeyItem::Str("a".into()), KeyItem::Int(1)]);
        assert!(ser.preprocess(&good, &cfg).is_ok());

        // Partial keys are accepted (queries complete them later).
        assert!(ser.preprocess(&CompositeKey::str("a"), &cfg).is_ok());

        let wrong_type = CompositeKey::new(vec![KeyItem::Int(1), KeyItem::Int(2)]);
        assert!(ser.preprocess(&wrong_type, &cfg).is_err());

        let too_long = CompositeKey::new(vec![
            KeyItem::Str("a".into()),
            KeyItem::Int(1),
            KeyItem::Int(2),
        ]);
        assert!(ser.preprocess(&too_long, &cfg).is_err());
    }

    #[test]
    fn test_sentinels_rejected() {
        let ser = CompositeKeySerializer;
        let key = CompositeKey::new(vec![KeyItem::AlwaysLess]);
        assert!(ser.serialize(&key).is_err());
        assert!(ser.preprocess(&key, &config(vec![KeyType::Int])).is_err());
    }

    #[test]
    fn test_deserialize_rejects_garbage() {
        let ser = CompositeKeySerializer;
        assert!(ser.deserialize(&[]).is_err());
        assert!(ser.deserialize(&[1, 0x7F]).is_err());
        assert!(ser.deserialize(&[1, TAG_INT, 0, 0]).is_err());
    }
}
