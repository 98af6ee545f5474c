//! Cryptographic primitives of the storage protocol.
//!
//! Node payloads are AES-128 throughout: ECB for key wrapping, CBC with a
//! zero IV for attribute blobs, CTR for file chunks with a per-chunk
//! CBC-MAC condensed into an 8-byte meta-MAC. Account-level material uses
//! PBKDF2-HMAC-SHA512, RSA for wrapped share keys, and Ed25519/X25519 for
//! the contact-key authrings.

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit, KeyIvInit, StreamCipher, StreamCipherSeek};
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::StdRng;
use rsa::BigUint;
use sha2::{Digest, Sha256};

use crate::error::CodecError;

pub const BLOCK_SIZE: usize = 16;
pub const FOLDER_KEY_SIZE: usize = 16;
pub const FILE_KEY_SIZE: usize = 32;

/// Key blobs longer than this are RSA ciphertexts, not symmetric wraps.
/// (The base64 form of a 32-byte key is at most ceil(4*32/3)+1 chars.)
pub const SYMM_KEY_B64_MAX: usize = 4 * FILE_KEY_SIZE / 3 + 4;

type HmacSha256 = Hmac<Sha256>;

/// An AES-128 key with the block modes the protocol needs.
#[derive(Clone)]
pub struct SymmCipher {
    cipher: Aes128,
    key: [u8; BLOCK_SIZE],
}

impl SymmCipher {
    pub fn new(key: [u8; BLOCK_SIZE]) -> Self {
        SymmCipher {
            cipher: Aes128::new(GenericArray::from_slice(&key)),
            key,
        }
    }

    pub fn from_slice(key: &[u8]) -> Result<Self, CodecError> {
        let arr: [u8; BLOCK_SIZE] = key.try_into().map_err(|_| CodecError::BadLength {
            expected: BLOCK_SIZE,
            actual: key.len(),
        })?;
        Ok(Self::new(arr))
    }

    pub fn key_bytes(&self) -> &[u8; BLOCK_SIZE] {
        &self.key
    }

    /// In-place ECB encryption. `data` must be a multiple of 16 bytes.
    pub fn ecb_encrypt(&self, data: &mut [u8]) {
        debug_assert_eq!(data.len() % BLOCK_SIZE, 0);
        for block in data.chunks_exact_mut(BLOCK_SIZE) {
            self.cipher
                .encrypt_block(GenericArray::from_mut_slice(block));
        }
    }

    /// In-place ECB decryption. `data` must be a multiple of 16 bytes.
    pub fn ecb_decrypt(&self, data: &mut [u8]) {
        debug_assert_eq!(data.len() % BLOCK_SIZE, 0);
        for block in data.chunks_exact_mut(BLOCK_SIZE) {
            self.cipher
                .decrypt_block(GenericArray::from_mut_slice(block));
        }
    }

    /// In-place CBC encryption with a zero IV over pre-padded data.
    pub fn cbc_encrypt(&self, data: &mut [u8]) {
        debug_assert_eq!(data.len() % BLOCK_SIZE, 0);
        let enc = cbc::Encryptor::<Aes128>::new(
            GenericArray::from_slice(&self.key),
            GenericArray::from_slice(&[0u8; BLOCK_SIZE]),
        );
        let len = data.len();
        enc.encrypt_padded_mut::<NoPadding>(data, len)
            .map(|_| ())
            .unwrap_or(());
    }

    /// In-place CBC decryption with a zero IV.
    pub fn cbc_decrypt(&self, data: &mut [u8]) {
        debug_assert_eq!(data.len() % BLOCK_SIZE, 0);
        let dec = cbc::Decryptor::<Aes128>::new(
            GenericArray::from_slice(&self.key),
            GenericArray::from_slice(&[0u8; BLOCK_SIZE]),
        );
        dec.decrypt_padded_mut::<NoPadding>(data)
            .map(|_| ())
            .unwrap_or(());
    }

    /// CBC-MAC over `data` with the given 16-byte start vector, used for
    /// chunk MACs. Trailing partial blocks are zero-padded.
    pub fn cbc_mac(&self, start: [u8; BLOCK_SIZE], data: &[u8]) -> [u8; BLOCK_SIZE] {
        let mut mac = start;
        for block in data.chunks(BLOCK_SIZE) {
            let mut padded = [0u8; BLOCK_SIZE];
            padded[..block.len()].copy_from_slice(block);
            for i in 0..BLOCK_SIZE {
                mac[i] ^= padded[i];
            }
            self.cipher.encrypt_block(GenericArray::from_mut_slice(&mut mac));
        }
        mac
    }

    /// In-place CTR transform of a file chunk located at byte offset `pos`
    /// within the stream whose nonce is `iv`.
    pub fn ctr_crypt(&self, iv: &[u8; 8], pos: u64, data: &mut [u8]) {
        let mut full_iv = [0u8; BLOCK_SIZE];
        full_iv[..8].copy_from_slice(iv);
        let mut ctr = ctr::Ctr128BE::<Aes128>::new(
            GenericArray::from_slice(&self.key),
            GenericArray::from_slice(&full_iv),
        );
        ctr.seek(pos);
        ctr.apply_keystream(data);
    }
}

impl std::fmt::Debug for SymmCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmCipher").finish_non_exhaustive()
    }
}

/// The two halves of a 32-byte file key plus the integrity residue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileKey {
    pub aes: [u8; 16],
    pub iv: [u8; 8],
    pub meta_mac: [u8; 8],
}

impl FileKey {
    /// XOR-unfolds the 32-byte wire form.
    pub fn unfold(full: &[u8; FILE_KEY_SIZE]) -> FileKey {
        let mut aes = [0u8; 16];
        for i in 0..16 {
            aes[i] = full[i] ^ full[i + 16];
        }
        let mut iv = [0u8; 8];
        iv.copy_from_slice(&full[16..24]);
        let mut meta_mac = [0u8; 8];
        meta_mac.copy_from_slice(&full[24..32]);
        FileKey { aes, iv, meta_mac }
    }

    /// Folds back into the 32-byte wire form.
    pub fn fold(&self) -> [u8; FILE_KEY_SIZE] {
        let mut full = [0u8; FILE_KEY_SIZE];
        full[16..24].copy_from_slice(&self.iv);
        full[24..32].copy_from_slice(&self.meta_mac);
        for i in 0..16 {
            full[i] = self.aes[i] ^ full[i + 16];
        }
        full
    }

    /// Draws a fresh key and CTR IV for a new upload. The meta-MAC is
    /// filled in when the last chunk completes.
    pub fn generate(rng: &mut StdRng) -> FileKey {
        let mut aes = [0u8; 16];
        let mut iv = [0u8; 8];
        rng.fill_bytes(&mut aes);
        rng.fill_bytes(&mut iv);
        FileKey {
            aes,
            iv,
            meta_mac: [0u8; 8],
        }
    }
}

/// Condenses an ordered sequence of chunk MACs into the 8-byte meta-MAC.
pub fn condense_macs<'a, I>(cipher: &SymmCipher, macs: I) -> [u8; 8]
where
    I: Iterator<Item = &'a [u8; BLOCK_SIZE]>,
{
    let mut acc = [0u8; BLOCK_SIZE];
    for mac in macs {
        for i in 0..BLOCK_SIZE {
            acc[i] ^= mac[i];
        }
        let mut block = acc;
        cipher
            .cipher
            .encrypt_block(GenericArray::from_mut_slice(&mut block));
        acc = block;
    }
    let mut out = [0u8; 8];
    for i in 0..4 {
        out[i] = acc[i] ^ acc[i + 4];
        out[i + 4] = acc[i + 8] ^ acc[i + 12];
    }
    out
}

/// PBKDF2-HMAC-SHA512 as used for v2 accounts and password links:
/// 100000 iterations deriving 64 bytes.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

pub fn derive_v2(password: &[u8], salt: &[u8]) -> [u8; 64] {
    let mut out = [0u8; 64];
    pbkdf2::pbkdf2_hmac::<sha2::Sha512>(password, salt, PBKDF2_ITERATIONS, &mut out);
    out
}

/// Share-edge authentication token: HMAC-SHA256 of the node handle keyed
/// with the account master key, truncated to one block.
pub fn handle_auth(master: &SymmCipher, handle_bytes: &[u8]) -> [u8; BLOCK_SIZE] {
    let mut mac =
        <HmacSha256 as KeyInit>::new_from_slice(master.key_bytes()).expect("hmac accepts any key length");
    mac.update(handle_bytes);
    let digest = mac.finalize().into_bytes();
    let mut out = [0u8; BLOCK_SIZE];
    out.copy_from_slice(&digest[..BLOCK_SIZE]);
    out
}

/// HMAC-SHA256, full width. Used by the password-link codec.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = <HmacSha256 as KeyInit>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// First 20 bytes of SHA-256 over a public key: the authring fingerprint.
pub fn key_fingerprint(pubkey: &[u8]) -> [u8; 20] {
    let digest = Sha256::digest(pubkey);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest[..20]);
    out
}

/// RSA keypair in the multi-precision-integer wire layout: each integer is
/// prefixed with its bit length (2 bytes, big-endian).
#[derive(Clone)]
pub struct RsaKey {
    pub n: BigUint,
    pub e: BigUint,
    d: Option<BigUint>,
    primes: Vec<BigUint>,
}

impl std::fmt::Debug for RsaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsaKey")
            .field("bits", &(self.n.bits()))
            .field("private", &self.d.is_some())
            .finish()
    }
}

fn read_mpi(data: &[u8], pos: &mut usize) -> Result<BigUint, CodecError> {
    if data.len() < *pos + 2 {
        return Err(CodecError::Truncated);
    }
    let bits = u16::from_be_bytes([data[*pos], data[*pos + 1]]) as usize;
    let bytes = bits.div_ceil(8);
    *pos += 2;
    if data.len() < *pos + bytes {
        return Err(CodecError::Truncated);
    }
    let v = BigUint::from_bytes_be(&data[*pos..*pos + bytes]);
    *pos += bytes;
    Ok(v)
}

fn write_mpi(out: &mut Vec<u8>, v: &BigUint) {
    let bits = v.bits() as u16;
    out.extend_from_slice(&bits.to_be_bytes());
    out.extend_from_slice(&v.to_bytes_be());
}

impl RsaKey {
    pub fn from_components(n: BigUint, e: BigUint, d: BigUint, primes: Vec<BigUint>) -> RsaKey {
        RsaKey {
            n,
            e,
            d: Some(d),
            primes,
        }
    }

    /// Parses a public key blob: n, e.
    pub fn from_public_blob(data: &[u8]) -> Result<RsaKey, CodecError> {
        let mut pos = 0;
        let n = read_mpi(data, &mut pos)?;
        let e = read_mpi(data, &mut pos)?;
        Ok(RsaKey {
            n,
            e,
            d: None,
            primes: Vec::new(),
        })
    }

    /// Parses a private key blob: p, q, d, u. The public modulus is
    /// recomputed; the exponent defaults to 17 as minted by the service.
    pub fn from_private_blob(data: &[u8]) -> Result<RsaKey, CodecError> {
        let mut pos = 0;
        let p = read_mpi(data, &mut pos)?;
        let q = read_mpi(data, &mut pos)?;
        let d = read_mpi(data, &mut pos)?;
        let _u = read_mpi(data, &mut pos)?;
        Ok(RsaKey {
            n: &p * &q,
            e: BigUint::from(17u32),
            d: Some(d),
            primes: vec![p, q],
        })
    }

    /// Serializes the private key as p, q, d, u with u the inverse of p
    /// modulo q (q is prime, so Fermat gives the inverse directly).
    pub fn private_blob(&self) -> Option<Vec<u8>> {
        let d = self.d.as_ref()?;
        let [p, q] = self.primes.as_slice() else {
            return None;
        };
        let u = p.modpow(&(q - 2u32), q);
        let mut out = Vec::new();
        write_mpi(&mut out, p);
        write_mpi(&mut out, q);
        write_mpi(&mut out, d);
        write_mpi(&mut out, &u);
        Some(out)
    }

    pub fn public_blob(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_mpi(&mut out, &self.n);
        write_mpi(&mut out, &self.e);
        out
    }

    pub fn has_private(&self) -> bool {
        self.d.is_some()
    }

    /// Raw RSA decryption (no padding scheme; the plaintext embeds its own
    /// structure). Returns big-endian bytes without leading zeros.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CodecError> {
        let d = self.d.as_ref().ok_or(CodecError::Truncated)?;
        let c = BigUint::from_bytes_be(ciphertext);
        if c >= self.n {
            return Err(CodecError::BadLength {
                expected: (self.n.bits() as usize).div_ceil(8),
                actual: ciphertext.len(),
            });
        }
        Ok(c.modpow(d, &self.n).to_bytes_be())
    }

    /// Raw RSA encryption with the public exponent.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let m = BigUint::from_bytes_be(plaintext);
        m.modpow(&self.e, &self.n).to_bytes_be()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn cipher() -> SymmCipher {
        SymmCipher::new(*b"0123456789abcdef")
    }

    #[test]
    fn test_ecb_roundtrip() {
        let c = cipher();
        let plain = *b"the quick brown fox jumps over l";
        let mut data = plain;
        c.ecb_encrypt(&mut data);
        assert_ne!(data, plain);
        c.ecb_decrypt(&mut data);
        assert_eq!(data, plain);
    }

    #[test]
    fn test_cbc_roundtrip_and_chaining() {
        let c = cipher();
        let plain = [0u8; 32];
        let mut data = plain;
        c.cbc_encrypt(&mut data);
        // CBC must chain: two identical plaintext blocks encrypt differently
        assert_ne!(data[..16], data[16..]);
        c.cbc_decrypt(&mut data);
        assert_eq!(data, plain);
    }

    #[test]
    fn test_ctr_roundtrip_and_seek() {
        let c = cipher();
        let iv = [9u8; 8];
        let mut whole = vec![0x5au8; 64];
        c.ctr_crypt(&iv, 0, &mut whole);

        // encrypting the second half alone at its stream offset must agree
        let mut tail = vec![0x5au8; 32];
        c.ctr_crypt(&iv, 32, &mut tail);
        assert_eq!(&whole[32..], &tail[..]);

        c.ctr_crypt(&iv, 0, &mut whole);
        assert_eq!(whole, vec![0x5au8; 64]);
    }

    #[test]
    fn test_file_key_fold_roundtrip() {
        let mut rng = StdRng::seed_from_u64(1);
        let fk = FileKey::generate(&mut rng);
        let folded = fk.fold();
        assert_eq!(FileKey::unfold(&folded), fk);
    }

    #[test]
    fn test_condense_macs_is_order_sensitive() {
        let c = cipher();
        let a = [1u8; 16];
        let b = [2u8; 16];
        let ab = condense_macs(&c, [&a, &b].into_iter());
        let ba = condense_macs(&c, [&b, &a].into_iter());
        assert_ne!(ab, ba);
    }

    #[test]
    fn test_handle_auth_is_keyed() {
        let c1 = cipher();
        let c2 = SymmCipher::new([3u8; 16]);
        let h = [1, 2, 3, 4, 5, 6];
        assert_ne!(handle_auth(&c1, &h), handle_auth(&c2, &h));
        assert_eq!(handle_auth(&c1, &h), handle_auth(&c1, &h));
    }

    #[test]
    fn test_rsa_blob_roundtrip_and_crypt() {
        // Small toy key; real keys are 2048 bit but the arithmetic is the same.
        let p = BigUint::from(61u32);
        let q = BigUint::from(53u32);
        let n = &p * &q; // 3233
        let e = BigUint::from(17u32);
        let d = BigUint::from(413u32);
        let key = RsaKey::from_components(n, e, d, vec![p, q]);
        let msg = [0x02u8, 0x86]; // 646 < n
        let ct = key.encrypt(&msg);
        let pt = key.decrypt(&ct).unwrap();
        assert_eq!(pt, msg);

        let pub_blob = key.public_blob();
        let parsed = RsaKey::from_public_blob(&pub_blob).unwrap();
        assert_eq!(parsed.n, key.n);
        assert_eq!(parsed.e, key.e);
        assert!(!parsed.has_private());
    }

    #[test]
    fn test_derive_v2_is_deterministic() {
        let a = derive_v2(b"pw", b"salt");
        let b = derive_v2(b"pw", b"salt");
        assert_eq!(a, b);
        assert_ne!(derive_v2(b"pw2", b"salt")[..], a[..]);
    }
}
