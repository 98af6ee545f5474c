//! Encrypted node attribute blobs.
//!
//! An attribute blob is `"MEGA{" || json || "}"` zero-padded to a block
//! multiple and AES-CBC encrypted with a zero IV under the node key. The
//! five-byte magic doubles as the integrity check on decrypt: a wrong key
//! produces garbage there and the node is flagged "no-key" instead.

use serde_json::{Map, Value};

use crate::crypto::{BLOCK_SIZE, SymmCipher};
use crate::error::CodecError;

const MAGIC: &[u8; 5] = b"MEGA{";

/// Encrypts an attribute map under the node key.
pub fn encrypt_attrs(attrs: &Map<String, Value>, key: &SymmCipher) -> Vec<u8> {
    let json = Value::Object(attrs.clone()).to_string();
    debug_assert!(json.starts_with('{'));
    let mut data = Vec::with_capacity(4 + json.len() + BLOCK_SIZE);
    data.extend_from_slice(b"MEGA");
    data.extend_from_slice(json.as_bytes());
    let padded = data.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
    data.resize(padded, 0);
    key.cbc_encrypt(&mut data);
    data
}

/// Decrypts and validates an attribute blob. `CodecError::BadAttrMagic`
/// means the key does not fit, not that the blob is corrupt.
pub fn decrypt_attrs(blob: &[u8], key: &SymmCipher) -> Result<Map<String, Value>, CodecError> {
    if blob.is_empty() || blob.len() % BLOCK_SIZE != 0 {
        return Err(CodecError::BadLength {
            expected: BLOCK_SIZE,
            actual: blob.len(),
        });
    }
    let mut data = blob.to_vec();
    key.cbc_decrypt(&mut data);
    if &data[..MAGIC.len()] != MAGIC {
        return Err(CodecError::BadAttrMagic);
    }
    let end = data.iter().rposition(|&b| b == b'}').ok_or(CodecError::BadAttrMagic)?;
    let json = &data[4..=end];
    match serde_json::from_slice::<Value>(json) {
        Ok(Value::Object(map)) => Ok(map),
        _ => Err(CodecError::BadAttrMagic),
    }
}

/// Builds the common attribute map for a node: display name plus an
/// optional fingerprint attribute.
pub fn name_attrs(name: &str, fingerprint: Option<&str>) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("n".to_string(), Value::String(name.to_string()));
    if let Some(fp) = fingerprint {
        map.insert("c".to_string(), Value::String(fp.to_string()));
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SymmCipher {
        SymmCipher::new([0x42; 16])
    }

    #[test]
    fn test_roundtrip() {
        let attrs = name_attrs("hello world.txt", Some("AAAA"));
        let blob = encrypt_attrs(&attrs, &key());
        assert_eq!(blob.len() % BLOCK_SIZE, 0);
        let back = decrypt_attrs(&blob, &key()).unwrap();
        assert_eq!(back.get("n").unwrap(), "hello world.txt");
        assert_eq!(back.get("c").unwrap(), "AAAA");
    }

    #[test]
    fn test_wrong_key_is_no_key_not_panic() {
        let attrs = name_attrs("x", None);
        let blob = encrypt_attrs(&attrs, &key());
        let wrong = SymmCipher::new([0x43; 16]);
        assert_eq!(
            decrypt_attrs(&blob, &wrong).unwrap_err(),
            CodecError::BadAttrMagic
        );
    }

    #[test]
    fn test_unicode_name() {
        let attrs = name_attrs("Fotoς συλλογή 📁", None);
        let back = decrypt_attrs(&encrypt_attrs(&attrs, &key()), &key()).unwrap();
        assert_eq!(back.get("n").unwrap(), "Fotoς συλλογή 📁");
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(decrypt_attrs(&[0u8; 15], &key()).is_err());
        assert!(decrypt_attrs(&[0u8; 32], &key()).is_err());
    }
}
