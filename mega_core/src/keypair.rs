//! Account keypair material: Ed25519 (signing), X25519 (chat/ECDH) and
//! RSA (legacy share-key wrapping), with the cross-signatures that bind
//! them together.
//!
//! The signing key is the root of trust: the X25519 and RSA public keys
//! are signed by it, and contacts track all three through the authrings.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use rand::rngs::StdRng;
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::crypto::RsaKey;
use crate::error::CodecError;

/// Domain separation prefixes for the cross-signatures.
const SIG_PREFIX_CU255: &[u8] = b"keyauth\0Cu25519";
const SIG_PREFIX_RSA: &[u8] = b"keyauth\0RSA";

pub const ED25519_KEY_SIZE: usize = 32;
pub const X25519_KEY_SIZE: usize = 32;
pub const RSA_BITS: usize = 2048;

/// The full private key set of a logged-in account.
pub struct KeyPairs {
    pub ed25519: SigningKey,
    pub cu25519: StaticSecret,
    pub rsa: RsaKey,
}

impl std::fmt::Debug for KeyPairs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPairs").finish_non_exhaustive()
    }
}

impl KeyPairs {
    /// Generates a fresh set. Protocol randomness comes from the injected
    /// client PRNG; RSA prime search uses the OS generator directly since
    /// the rsa crate sits on the older rand_core traits.
    pub fn generate(rng: &mut StdRng) -> anyhow::Result<KeyPairs> {
        let mut seed = [0u8; ED25519_KEY_SIZE];
        rng.fill_bytes(&mut seed);
        let ed25519 = SigningKey::from_bytes(&seed);

        let mut xseed = [0u8; X25519_KEY_SIZE];
        rng.fill_bytes(&mut xseed);
        let cu25519 = StaticSecret::from(xseed);

        let private = rsa::RsaPrivateKey::new(&mut rand_core::OsRng, RSA_BITS)?;
        let rsa = RsaKey::from_components(
            private.n().clone(),
            private.e().clone(),
            private.d().clone(),
            private.primes().to_vec(),
        );

        Ok(KeyPairs {
            ed25519,
            cu25519,
            rsa,
        })
    }

    pub fn ed25519_public(&self) -> [u8; ED25519_KEY_SIZE] {
        self.ed25519.verifying_key().to_bytes()
    }

    pub fn cu25519_public(&self) -> [u8; X25519_KEY_SIZE] {
        X25519Public::from(&self.cu25519).to_bytes()
    }

    /// Signs the X25519 public key with the Ed25519 key.
    pub fn sign_cu25519(&self) -> [u8; 64] {
        let mut msg = SIG_PREFIX_CU255.to_vec();
        msg.extend_from_slice(&self.cu25519_public());
        self.ed25519.sign(&msg).to_bytes()
    }

    /// Signs the RSA public key blob with the Ed25519 key.
    pub fn sign_rsa(&self) -> [u8; 64] {
        let mut msg = SIG_PREFIX_RSA.to_vec();
        msg.extend_from_slice(&self.rsa.public_blob());
        self.ed25519.sign(&msg).to_bytes()
    }

    /// Cross-verifies that the stored public halves match the private
    /// halves and that the cross-signatures hold. Any failure means the
    /// attribute set is in a compromised mixed state.
    pub fn verify_consistent(
        &self,
        pub_ed: &[u8],
        pub_cu: &[u8],
        pub_rsa_blob: &[u8],
        sig_cu: &[u8],
        sig_rsa: &[u8],
    ) -> Result<(), CodecError> {
        if pub_ed != self.ed25519_public() || pub_cu != self.cu25519_public() {
            return Err(CodecError::BadMac);
        }
        let parsed = RsaKey::from_public_blob(pub_rsa_blob)?;
        if parsed.n != self.rsa.n || parsed.e != self.rsa.e {
            return Err(CodecError::BadMac);
        }
        verify_cu25519_sig(&self.ed25519_public(), pub_cu, sig_cu)?;
        verify_rsa_sig(&self.ed25519_public(), pub_rsa_blob, sig_rsa)?;
        Ok(())
    }
}

fn verify_with_prefix(
    signer_pub: &[u8; ED25519_KEY_SIZE],
    prefix: &[u8],
    payload: &[u8],
    sig: &[u8],
) -> Result<(), CodecError> {
    let vk = VerifyingKey::from_bytes(signer_pub).map_err(|_| CodecError::BadMac)?;
    let sig_arr: [u8; 64] = sig.try_into().map_err(|_| CodecError::BadLength {
        expected: 64,
        actual: sig.len(),
    })?;
    let mut msg = prefix.to_vec();
    msg.extend_from_slice(payload);
    vk.verify(&msg, &Signature::from_bytes(&sig_arr))
        .map_err(|_| CodecError::BadMac)
}

/// Verifies the Ed25519 signature over an X25519 public key.
pub fn verify_cu25519_sig(
    signer_pub: &[u8; ED25519_KEY_SIZE],
    cu_pub: &[u8],
    sig: &[u8],
) -> Result<(), CodecError> {
    verify_with_prefix(signer_pub, SIG_PREFIX_CU255, cu_pub, sig)
}

/// Verifies the Ed25519 signature over an RSA public key blob.
pub fn verify_rsa_sig(
    signer_pub: &[u8; ED25519_KEY_SIZE],
    rsa_blob: &[u8],
    sig: &[u8],
) -> Result<(), CodecError> {
    verify_with_prefix(signer_pub, SIG_PREFIX_RSA, rsa_blob, sig)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    // RSA generation is slow; share one key set across the tests.
    fn pairs() -> &'static KeyPairs {
        use std::sync::OnceLock;
        static PAIRS: OnceLock<KeyPairs> = OnceLock::new();
        PAIRS.get_or_init(|| {
            let mut rng = StdRng::seed_from_u64(99);
            KeyPairs::generate(&mut rng).unwrap()
        })
    }

    #[test]
    fn test_cross_signatures_verify() {
        let kp = pairs();
        verify_cu25519_sig(&kp.ed25519_public(), &kp.cu25519_public(), &kp.sign_cu25519())
            .unwrap();
        verify_rsa_sig(&kp.ed25519_public(), &kp.rsa.public_blob(), &kp.sign_rsa()).unwrap();
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let kp = pairs();
        let mut sig = kp.sign_cu25519();
        sig[0] ^= 1;
        assert!(verify_cu25519_sig(&kp.ed25519_public(), &kp.cu25519_public(), &sig).is_err());
    }

    #[test]
    fn test_verify_consistent() {
        let kp = pairs();
        kp.verify_consistent(
            &kp.ed25519_public(),
            &kp.cu25519_public(),
            &kp.rsa.public_blob(),
            &kp.sign_cu25519(),
            &kp.sign_rsa(),
        )
        .unwrap();

        let wrong = [0u8; 32];
        assert!(
            kp.verify_consistent(
                &wrong,
                &kp.cu25519_public(),
                &kp.rsa.public_blob(),
                &kp.sign_cu25519(),
                &kp.sign_rsa(),
            )
            .is_err()
        );
    }
}
