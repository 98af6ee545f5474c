//! Public link codecs: plain file/folder links (current and legacy
//! forms) and the password-protected `#P!` envelope.

use rand::RngCore;
use rand::rngs::StdRng;
use url::Url;

use crate::b64;
use crate::crypto::{FILE_KEY_SIZE, FOLDER_KEY_SIZE, derive_v2, hmac_sha256};
use crate::error::CodecError;
use crate::handle::{HANDLE_SIZE, PublicHandle};

const LINK_HOST: &str = "mega.nz";
const SALT_SIZE: usize = 32;

/// A parsed public link: the exported handle plus its decryption key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicLink {
    pub handle: PublicHandle,
    pub key: Vec<u8>,
    pub is_folder: bool,
}

impl PublicLink {
    pub fn new_file(handle: PublicHandle, key: [u8; FILE_KEY_SIZE]) -> PublicLink {
        PublicLink {
            handle,
            key: key.to_vec(),
            is_folder: false,
        }
    }

    pub fn new_folder(handle: PublicHandle, key: [u8; FOLDER_KEY_SIZE]) -> PublicLink {
        PublicLink {
            handle,
            key: key.to_vec(),
            is_folder: true,
        }
    }

    /// Current link form: `https://mega.nz/file/<ph>#<key>`.
    pub fn format(&self) -> String {
        let kind = if self.is_folder { "folder" } else { "file" };
        format!(
            "https://{LINK_HOST}/{kind}/{}#{}",
            self.handle.to_b64(),
            b64::encode(&self.key)
        )
    }

    /// Legacy link form: `https://mega.nz/#!<ph>!<key>`.
    pub fn format_legacy(&self) -> String {
        let bang = if self.is_folder { "#F!" } else { "#!" };
        format!(
            "https://{LINK_HOST}/{bang}{}!{}",
            self.handle.to_b64(),
            b64::encode(&self.key)
        )
    }

    /// Parses either form. The key length must match the node kind.
    pub fn parse(link: &str) -> Result<PublicLink, CodecError> {
        let url = Url::parse(link).map_err(|e| CodecError::BadLink(e.to_string()))?;
        let fragment = url.fragment().unwrap_or("");

        let (is_folder, handle_str, key_str) = if let Some(rest) = fragment.strip_prefix("F!") {
            let (h, k) = rest
                .split_once('!')
                .ok_or_else(|| CodecError::BadLink(link.to_string()))?;
            (true, h, k)
        } else if let Some(rest) = fragment.strip_prefix('!') {
            let (h, k) = rest
                .split_once('!')
                .ok_or_else(|| CodecError::BadLink(link.to_string()))?;
            (false, h, k)
        } else {
            let mut segments = url
                .path_segments()
                .ok_or_else(|| CodecError::BadLink(link.to_string()))?;
            let kind = segments.next().unwrap_or("");
            let handle = segments.next().unwrap_or("");
            let is_folder = match kind {
                "file" => false,
                "folder" => true,
                _ => return Err(CodecError::BadLink(link.to_string())),
            };
            (is_folder, handle, fragment)
        };

        let key = b64::decode(key_str)?;
        let expected = if is_folder { FOLDER_KEY_SIZE } else { FILE_KEY_SIZE };
        if key.len() != expected {
            return Err(CodecError::BadLength {
                expected,
                actual: key.len(),
            });
        }
        Ok(PublicLink {
            handle: PublicHandle::from_b64(handle_str)?,
            key,
            is_folder,
        })
    }
}

/// Password-protection algorithm identifiers. Algorithm 2 swaps the HMAC
/// key and message, matching a legacy client whose links must stay
/// decryptable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPasswordAlgorithm {
    V1 = 1,
    V2 = 2,
}

fn link_mac(alg: LinkPasswordAlgorithm, mac_key: &[u8], payload: &[u8]) -> [u8; 32] {
    match alg {
        LinkPasswordAlgorithm::V1 => hmac_sha256(mac_key, payload),
        LinkPasswordAlgorithm::V2 => hmac_sha256(payload, mac_key),
    }
}

/// Wraps a public link in a password envelope:
/// `alg(1) | isFile(1) | handle(6) | salt(32) | encKey | hmac(32)`,
/// base64url-encoded behind `#P!`.
pub fn encrypt_link_with_password(
    link: &PublicLink,
    password: &str,
    alg: LinkPasswordAlgorithm,
    rng: &mut StdRng,
) -> String {
    let mut salt = [0u8; SALT_SIZE];
    rng.fill_bytes(&mut salt);
    encrypt_link_with_salt(link, password, alg, salt)
}

pub fn encrypt_link_with_salt(
    link: &PublicLink,
    password: &str,
    alg: LinkPasswordAlgorithm,
    salt: [u8; SALT_SIZE],
) -> String {
    let derived = derive_v2(password.as_bytes(), &salt);
    let (enc_half, mac_key) = derived.split_at(32);

    let mut payload = Vec::with_capacity(2 + HANDLE_SIZE + SALT_SIZE + link.key.len());
    payload.push(alg as u8);
    payload.push(if link.is_folder { 0 } else { 1 });
    payload.extend_from_slice(&link.handle.as_raw().to_le_bytes()[..HANDLE_SIZE]);
    payload.extend_from_slice(&salt);
    for (i, b) in link.key.iter().enumerate() {
        payload.push(b ^ enc_half[i]);
    }

    let mac = link_mac(alg, mac_key, &payload);
    payload.extend_from_slice(&mac);
    format!("https://{LINK_HOST}/#P!{}", b64::encode(&payload))
}

/// Unwraps a password-protected link, returning the plain link. A wrong
/// password surfaces as `CodecError::BadMac`.
pub fn decrypt_link_with_password(link: &str, password: &str) -> Result<PublicLink, CodecError> {
    let url = Url::parse(link).map_err(|e| CodecError::BadLink(e.to_string()))?;
    let blob_b64 = url
        .fragment()
        .and_then(|f| f.strip_prefix("P!"))
        .ok_or_else(|| CodecError::BadLink(link.to_string()))?;
    let blob = b64::decode(blob_b64)?;

    // alg + isFile + handle + salt + at-least-a-folder-key + mac
    if blob.len() < 2 + HANDLE_SIZE + SALT_SIZE + FOLDER_KEY_SIZE + 32 {
        return Err(CodecError::Truncated);
    }
    let alg = match blob[0] {
        1 => LinkPasswordAlgorithm::V1,
        2 => LinkPasswordAlgorithm::V2,
        other => return Err(CodecError::BadVersion(other)),
    };
    let is_folder = blob[1] == 0;
    let key_len = if is_folder { FOLDER_KEY_SIZE } else { FILE_KEY_SIZE };
    let expected_len = 2 + HANDLE_SIZE + SALT_SIZE + key_len + 32;
    if blob.len() != expected_len {
        return Err(CodecError::BadLength {
            expected: expected_len,
            actual: blob.len(),
        });
    }

    let (payload, mac) = blob.split_at(blob.len() - 32);
    let salt: [u8; SALT_SIZE] = payload[2 + HANDLE_SIZE..2 + HANDLE_SIZE + SALT_SIZE]
        .try_into()
        .unwrap();
    let derived = derive_v2(password.as_bytes(), &salt);
    let (enc_half, mac_key) = derived.split_at(32);

    if link_mac(alg, mac_key, payload) != mac {
        return Err(CodecError::BadMac);
    }

    let mut raw = [0u8; 8];
    raw[..HANDLE_SIZE].copy_from_slice(&payload[2..2 + HANDLE_SIZE]);
    let enc_key = &payload[2 + HANDLE_SIZE + SALT_SIZE..];
    let key: Vec<u8> = enc_key
        .iter()
        .enumerate()
        .map(|(i, b)| b ^ enc_half[i])
        .collect();

    Ok(PublicLink {
        handle: PublicHandle::from_raw(u64::from_le_bytes(raw)),
        key,
        is_folder,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn file_link() -> PublicLink {
        let key: [u8; 32] = std::array::from_fn(|i| i as u8);
        PublicLink::new_file(PublicHandle::from_raw(0x0102030405), key)
    }

    #[test]
    fn test_format_parse_roundtrip() {
        let link = file_link();
        assert_eq!(PublicLink::parse(&link.format()).unwrap(), link);
        assert_eq!(PublicLink::parse(&link.format_legacy()).unwrap(), link);

        let folder = PublicLink::new_folder(PublicHandle::from_raw(77), [9u8; 16]);
        assert_eq!(PublicLink::parse(&folder.format()).unwrap(), folder);
        assert_eq!(PublicLink::parse(&folder.format_legacy()).unwrap(), folder);
    }

    #[test]
    fn test_key_length_enforced() {
        // folder key on a file path
        let bad = format!("https://mega.nz/file/AAAAAAAA#{}", b64::encode(&[0u8; 16]));
        assert!(PublicLink::parse(&bad).is_err());
    }

    #[test]
    fn test_password_roundtrip_both_algorithms() {
        let mut rng = StdRng::seed_from_u64(5);
        let link = file_link();
        for alg in [LinkPasswordAlgorithm::V1, LinkPasswordAlgorithm::V2] {
            let protected =
                encrypt_link_with_password(&link, "correct horse battery staple", alg, &mut rng);
            let plain =
                decrypt_link_with_password(&protected, "correct horse battery staple").unwrap();
            assert_eq!(plain, link);
        }
    }

    #[test]
    fn test_wrong_password_is_bad_mac() {
        let mut rng = StdRng::seed_from_u64(5);
        let protected = encrypt_link_with_password(
            &file_link(),
            "hunter2",
            LinkPasswordAlgorithm::V1,
            &mut rng,
        );
        assert_eq!(
            decrypt_link_with_password(&protected, "hunter3").unwrap_err(),
            CodecError::BadMac
        );
    }

    #[test]
    fn test_known_salt_algorithm2() {
        let link = file_link();
        let protected = encrypt_link_with_salt(
            &link,
            "correct horse battery staple",
            LinkPasswordAlgorithm::V2,
            [0u8; SALT_SIZE],
        );
        let plain = decrypt_link_with_password(&protected, "correct horse battery staple").unwrap();
        assert_eq!(plain.handle, PublicHandle::from_raw(0x0102030405));
        assert_eq!(
            b64::encode(&plain.key),
            "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8"
        );
        assert!(
            plain
                .format()
                .ends_with("#AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8")
        );
    }
}
