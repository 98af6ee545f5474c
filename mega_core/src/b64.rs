//! Base64url helpers for the wire alphabet (no padding).

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use crate::error::CodecError;

pub fn encode(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

pub fn decode(s: &str) -> Result<Vec<u8>, CodecError> {
    URL_SAFE_NO_PAD
        .decode(s.as_bytes())
        .map_err(|_| CodecError::BadBase64(s.to_string()))
}

/// Decodes into a fixed-size array, rejecting length mismatches.
pub fn decode_exact<const N: usize>(s: &str) -> Result<[u8; N], CodecError> {
    let v = decode(s)?;
    v.try_into().map_err(|v: Vec<u8>| CodecError::BadLength {
        expected: N,
        actual: v.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let data = [0u8, 1, 2, 250, 251, 252, 253, 254, 255];
        assert_eq!(decode(&encode(&data)).unwrap(), data);
    }

    #[test]
    fn test_url_safe_alphabet() {
        // 0xfb 0xff encodes to characters outside the standard alphabet
        let enc = encode(&[0xfb, 0xef, 0xff]);
        assert!(!enc.contains('+') && !enc.contains('/') && !enc.contains('='));
    }

    #[test]
    fn test_decode_exact() {
        let enc = encode(&[7u8; 16]);
        let arr: [u8; 16] = decode_exact(&enc).unwrap();
        assert_eq!(arr, [7u8; 16]);
        assert!(decode_exact::<8>(&enc).is_err());
    }
}
