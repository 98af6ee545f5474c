//! Login, session tokens and the account keypair lifecycle.
//!
//! Prelogin decides between the v1 scheme (password-derived AES key,
//! iterated) and v2 (PBKDF2-HMAC-SHA512 with a per-account salt). The
//! session serializes to a compact blob — version 1 for full accounts,
//! version 2 for folder links, padded to disguise which options are set.

use rand::RngCore;

use mega_core::crypto::{self, RsaKey, SymmCipher};
use mega_core::error::CodecError;
use mega_core::keypair::KeyPairs;
use mega_core::{ApiError, NodeHandle, PublicHandle, UserHandle, b64};

use crate::client::MegaClient;
use crate::commands::Command;

/// Server-issued session id length in raw bytes.
pub const SID_SIZE: usize = 27;
const FOLDER_BLOB_SIZE: usize = 96;

/// Authentication material of a folder-link session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderSession {
    pub ph: PublicHandle,
    pub root: NodeHandle,
    pub key: [u8; 16],
    pub write_auth: Option<String>,
    pub account_auth: Option<String>,
}

/// Everything identifying the logged-in session.
#[derive(Default)]
pub struct SessionState {
    pub me: Option<UserHandle>,
    pub email: Option<String>,
    pub master_key: Option<SymmCipher>,
    /// Raw session id bytes; the auth suffix carries them base64url.
    pub sid: Option<Vec<u8>>,
    /// Session key as dumped/restored alongside the sid.
    pub session_key: [u8; 16],
    pub rsa_key: Option<RsaKey>,
    pub keypairs: Option<KeyPairs>,
    /// Random id stamped into mutating commands so our own action
    /// packets can be recognized and skipped.
    pub session_id: String,
    pub folder: Option<FolderSession>,
    /// Account scheme from prelogin (1 or 2).
    pub version: u8,
}

impl SessionState {
    pub fn logged_in(&self) -> bool {
        self.sid.is_some() || self.folder.is_some()
    }
}

/// v1 password key: iterated AES over the password chunks.
pub fn derive_v1_key(password: &str) -> [u8; 16] {
    let mut pkey: [u8; 16] = [
        0x93, 0xC4, 0x67, 0xE3, 0x7D, 0xB0, 0xC7, 0xA4, 0xD1, 0xBE, 0x3F, 0x81, 0x01, 0x52, 0xCB,
        0x56,
    ];
    let bytes = password.as_bytes();
    let chunks: Vec<[u8; 16]> = bytes
        .chunks(16)
        .map(|c| {
            let mut chunk = [0u8; 16];
            chunk[..c.len()].copy_from_slice(c);
            chunk
        })
        .collect();
    for _ in 0..65536 {
        for chunk in &chunks {
            let cipher = SymmCipher::new(*chunk);
            cipher.ecb_encrypt(&mut pkey);
        }
    }
    pkey
}

/// v1 login hash of the (lowercased) email under the password key.
pub fn string_hash(email: &str, key: &SymmCipher) -> String {
    let mut h = [0u8; 16];
    for (i, byte) in email.to_lowercase().bytes().enumerate() {
        h[i % 16] ^= byte;
    }
    for _ in 0..16384 {
        key.ecb_encrypt(&mut h);
    }
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&h[0..4]);
    out[4..].copy_from_slice(&h[8..12]);
    b64::encode(&out)
}

/// v2 split of the PBKDF2 output: AES key and authentication key.
pub fn split_v2_key(derived: &[u8; 64]) -> ([u8; 16], [u8; 16]) {
    let mut aes = [0u8; 16];
    aes.copy_from_slice(&derived[..16]);
    let mut auth = [0u8; 16];
    auth.copy_from_slice(&derived[32..48]);
    (aes, auth)
}

impl MegaClient {
    /// Starts a credential login: prelogin first, then `us`.
    pub fn login(&mut self, email: &str, password: &str, tag: u32) {
        self.queue_command(Command::prelogin(email, password).with_tag(tag));
    }

    /// Auth query suffix for CS/SC URLs.
    pub(crate) fn auth_suffix(&self) -> String {
        if let Some(folder) = &self.session.folder {
            let mut suffix = format!("&n={}", folder.ph.to_b64());
            if let Some(w) = &folder.write_auth {
                suffix.push_str("&w=");
                suffix.push_str(w);
            }
            if let Some(account) = &folder.account_auth {
                suffix.push_str("&sid=");
                suffix.push_str(account);
            }
            return suffix;
        }
        match &self.session.sid {
            Some(sid) => format!("&sid={}", b64::encode(sid)),
            None => String::new(),
        }
    }

    pub(crate) fn on_prelogin(
        &mut self,
        tag: u32,
        email: &str,
        password: &str,
        result: crate::commands::CmdResult,
    ) {
        let response = match result {
            Ok(v) => v,
            Err(err) => {
                self.app.login_result(Err(err));
                self.app.request_error(tag, err);
                return;
            }
        };
        let version = response
            .get("v")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(1) as u8;
        self.session.version = version;
        self.session.email = Some(email.to_string());

        match version {
            2 => {
                let Some(salt) = response
                    .get("s")
                    .and_then(serde_json::Value::as_str)
                    .and_then(|s| b64::decode(s).ok())
                else {
                    self.app.login_result(Err(ApiError::Internal));
                    return;
                };
                let derived = crypto::derive_v2(password.as_bytes(), &salt);
                let (aes, auth) = split_v2_key(&derived);
                self.password_key = Some(SymmCipher::new(aes));
                let cmd =
                    Command::login_v2(email, &b64::encode(&auth), &self.fresh_session_key_b64());
                self.queue_command(cmd.with_tag(tag));
            }
            _ => {
                let key = SymmCipher::new(derive_v1_key(password));
                let uh = string_hash(email, &key);
                self.password_key = Some(key);
                let cmd = Command::login(email, &uh, &self.fresh_session_key_b64());
                self.queue_command(cmd.with_tag(tag));
            }
        }
    }

    fn fresh_session_key_b64(&mut self) -> String {
        self.rng.fill_bytes(&mut self.session.session_key);
        b64::encode(&self.session.session_key)
    }

    pub(crate) fn on_login(&mut self, tag: u32, result: crate::commands::CmdResult) {
        let response = match result {
            Ok(v) => v,
            Err(err) => {
                self.app.login_result(Err(err));
                self.app.request_error(tag, err);
                return;
            }
        };

        // Master key, wrapped with the password key.
        if let Some(k) = response.get("k").and_then(serde_json::Value::as_str)
            && let Ok(mut wrapped) = b64::decode(k)
            && wrapped.len() == 16
            && let Some(pw) = &self.password_key
        {
            pw.ecb_decrypt(&mut wrapped);
            let key: [u8; 16] = wrapped.try_into().expect("length checked");
            self.session.master_key = Some(SymmCipher::new(key));
        }

        self.session.me = response
            .get("u")
            .and_then(serde_json::Value::as_str)
            .and_then(|u| UserHandle::from_b64(u).ok());

        // Private key, wrapped with the master key; needed for csid.
        if let Some(privk) = response.get("privk").and_then(serde_json::Value::as_str)
            && let Ok(mut blob) = b64::decode(privk)
            && let Some(master) = &self.session.master_key
        {
            let whole = blob.len() - blob.len() % 16;
            master.ecb_decrypt(&mut blob[..whole]);
            match RsaKey::from_private_blob(&blob) {
                Ok(key) => self.session.rsa_key = Some(key),
                Err(err) => tracing::warn!("private key blob unusable: {err:?}"),
            }
        }

        // Session id: plain (tsid) or RSA-wrapped (csid).
        if let Some(tsid) = response.get("tsid").and_then(serde_json::Value::as_str) {
            self.session.sid = b64::decode(tsid).ok();
        } else if let Some(csid) = response.get("csid").and_then(serde_json::Value::as_str)
            && let Ok(wrapped) = b64::decode(csid)
            && let Some(privk) = &self.session.rsa_key
        {
            match privk.decrypt(&wrapped) {
                Ok(plain) => {
                    self.session.sid = Some(plain[..plain.len().min(SID_SIZE)].to_vec());
                }
                Err(err) => tracing::warn!("csid unwrap failed: {err:?}"),
            }
        }

        if self.session.sid.is_none() {
            self.app.login_result(Err(ApiError::Internal));
            return;
        }

        self.session.session_id = {
            let mut raw = [0u8; 8];
            self.rng.fill_bytes(&mut raw);
            b64::encode(&raw)
        };
        self.open_session_cache();
        self.queue_command(Command::user_data());
        self.app.login_result(Ok(()));
    }

    pub(crate) fn on_user_data(&mut self, result: crate::commands::CmdResult) {
        let Ok(response) = result else {
            return;
        };
        if let Some(email) = response.get("email").and_then(serde_json::Value::as_str) {
            self.session.email = Some(email.to_string());
            if let Some(me) = self.session.me {
                self.users.set_email(me, email);
            }
        }
        if self.session.me.is_none() {
            self.session.me = response
                .get("u")
                .and_then(serde_json::Value::as_str)
                .and_then(|u| UserHandle::from_b64(u).ok());
        }
    }

    // -- session blobs --

    /// Serializes the session: `1 | session_key(16) | sid(27)` for full
    /// accounts, a padded version-2 blob for folder links.
    pub fn dump_session(&self) -> Option<Vec<u8>> {
        if let Some(folder) = &self.session.folder {
            let mut blob = vec![2u8];
            blob.extend_from_slice(&folder.ph.as_raw().to_le_bytes()[..6]);
            blob.extend_from_slice(&folder.root.as_raw().to_le_bytes()[..6]);
            blob.extend_from_slice(&folder.key);
            let mut flags = 0u8;
            if folder.write_auth.is_some() {
                flags |= 1;
            }
            if folder.account_auth.is_some() {
                flags |= 2;
            }
            blob.push(flags);
            for field in [&folder.write_auth, &folder.account_auth].into_iter().flatten() {
                let bytes = field.as_bytes();
                blob.push(bytes.len() as u8);
                blob.extend_from_slice(bytes);
            }
            // Fixed size regardless of which auth fields exist.
            blob.resize(FOLDER_BLOB_SIZE, 0);
            return Some(blob);
        }

        let sid = self.session.sid.as_ref()?;
        let mut blob = Vec::with_capacity(1 + 16 + SID_SIZE);
        blob.push(1u8);
        blob.extend_from_slice(&self.session.session_key);
        blob.extend_from_slice(&sid[..sid.len().min(SID_SIZE)]);
        Some(blob)
    }

    /// Restores a dumped session and resumes: `ug` + cached fetchnodes.
    pub fn login_with_session(&mut self, blob: &[u8]) -> Result<(), CodecError> {
        // Unversioned legacy blobs (bare key + sid) are distinguished by
        // their exact length; versioned blobs always differ in size.
        if blob.len() == 16 + SID_SIZE {
            self.session.session_key = blob[..16].try_into().expect("sliced 16");
            self.session.sid = Some(blob[16..].to_vec());
            self.finish_session_resume();
            return Ok(());
        }
        match blob.first() {
            Some(1) => {
                if blob.len() < 1 + 16 + SID_SIZE {
                    return Err(CodecError::Truncated);
                }
                self.session.session_key = blob[1..17].try_into().expect("sliced 16");
                self.session.sid = Some(blob[17..17 + SID_SIZE].to_vec());
            }
            Some(2) => {
                if blob.len() != FOLDER_BLOB_SIZE {
                    return Err(CodecError::Truncated);
                }
                let mut ph = [0u8; 8];
                ph[..6].copy_from_slice(&blob[1..7]);
                let mut root = [0u8; 8];
                root[..6].copy_from_slice(&blob[7..13]);
                let key: [u8; 16] = blob[13..29].try_into().expect("sliced 16");
                let flags = blob[29];
                let mut pos = 30;
                let mut read_field = |set: bool| -> Result<Option<String>, CodecError> {
                    if !set {
                        return Ok(None);
                    }
                    let len = *blob.get(pos).ok_or(CodecError::Truncated)? as usize;
                    pos += 1;
                    let field = blob.get(pos..pos + len).ok_or(CodecError::Truncated)?;
                    pos += len;
                    Ok(Some(String::from_utf8_lossy(field).into_owned()))
                };
                let write_auth = read_field(flags & 1 != 0)?;
                let account_auth = read_field(flags & 2 != 0)?;
                self.session.folder = Some(FolderSession {
                    ph: PublicHandle::from_raw(u64::from_le_bytes(ph)),
                    root: NodeHandle::from_raw(u64::from_le_bytes(root)),
                    key,
                    write_auth,
                    account_auth,
                });
                self.session.master_key = Some(SymmCipher::new(key));
            }
            Some(v) => return Err(CodecError::BadVersion(*v)),
            None => return Err(CodecError::Truncated),
        }
        self.finish_session_resume();
        Ok(())
    }

    fn finish_session_resume(&mut self) {
        self.session.session_id = {
            let mut raw = [0u8; 8];
            self.rng.fill_bytes(&mut raw);
            b64::encode(&raw)
        };
        self.open_session_cache();
        if self.session.folder.is_none() {
            self.queue_command(Command::user_data());
        }
    }

    /// Opens a folder link as a session.
    pub fn login_to_folder(&mut self, link: &mega_core::links::PublicLink) -> Result<(), CodecError> {
        if !link.is_folder {
            return Err(CodecError::BadLink("not a folder link".into()));
        }
        let key: [u8; 16] = link.key.as_slice().try_into().map_err(|_| CodecError::BadLength {
            expected: 16,
            actual: link.key.len(),
        })?;
        self.session.folder = Some(FolderSession {
            ph: link.handle,
            root: NodeHandle::UNDEF,
            key,
            write_auth: None,
            account_auth: None,
        });
        self.session.master_key = Some(SymmCipher::new(key));
        self.session.session_id = {
            let mut raw = [0u8; 8];
            self.rng.fill_bytes(&mut raw);
            b64::encode(&raw)
        };
        self.open_session_cache();
        Ok(())
    }

    // -- keypair lifecycle --

    /// Enforces the all-or-clear invariant over {RSA, Ed25519, X25519}:
    /// a partial set means compromised mixed state and is wiped; a full
    /// set must cross-verify; absence generates a fresh set.
    ///
    /// Returns the keypairs to publish when fresh material was created.
    pub fn reconcile_keypairs(
        &mut self,
        pub_ed: Option<Vec<u8>>,
        pub_cu: Option<Vec<u8>>,
        pub_rsa: Option<Vec<u8>>,
        sig_cu: Option<Vec<u8>>,
        sig_rsa: Option<Vec<u8>>,
    ) -> anyhow::Result<bool> {
        let parts = [&pub_ed, &pub_cu, &pub_rsa, &sig_cu, &sig_rsa];
        let present = parts.iter().filter(|p| p.is_some()).count();

        if present == 0 {
            tracing::info!("no account keypairs: generating fresh set");
            let pairs = KeyPairs::generate(&mut self.rng)?;
            self.session.rsa_key = Some(pairs.rsa.clone());
            self.session.keypairs = Some(pairs);
            return Ok(true);
        }

        if present < parts.len() {
            // Mixed state: never reconcile, always clear.
            tracing::error!("partial keypair attributes: clearing for regeneration");
            self.session.keypairs = None;
            return Ok(false);
        }

        let (pub_ed, pub_cu, pub_rsa, sig_cu, sig_rsa) = (
            pub_ed.expect("counted"),
            pub_cu.expect("counted"),
            pub_rsa.expect("counted"),
            sig_cu.expect("counted"),
            sig_rsa.expect("counted"),
        );
        if let Some(pairs) = &self.session.keypairs {
            if pairs
                .verify_consistent(&pub_ed, &pub_cu, &pub_rsa, &sig_cu, &sig_rsa)
                .is_err()
            {
                tracing::error!("keypair cross-verification failed: clearing");
                self.session.keypairs = None;
            }
        } else {
            let ed_arr: [u8; 32] = pub_ed
                .as_slice()
                .try_into()
                .map_err(|_| anyhow::anyhow!("bad ed25519 public key size"))?;
            if mega_core::keypair::verify_cu25519_sig(&ed_arr, &pub_cu, &sig_cu).is_err()
                || mega_core::keypair::verify_rsa_sig(&ed_arr, &pub_rsa, &sig_rsa).is_err()
            {
                tracing::error!("stored key signatures do not verify: clearing");
            }
        }
        Ok(false)
    }

    // -- session death --

    pub(crate) fn session_died(&mut self, err: ApiError) {
        tracing::warn!("session terminated: {err}");
        self.scsn.stop();
        self.app.session_dead(err);
    }

    pub(crate) fn enter_blocked_state(&mut self) {
        tracing::warn!("account blocked: suspending SC, syncs and transfers");
        self.blocked = true;
        self.scsn.stop();
        self.suspend_all_syncs();
        self.app.session_dead(ApiError::Blocked);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v1_key_is_deterministic() {
        let a = derive_v1_key("password1");
        let b = derive_v1_key("password1");
        assert_eq!(a, b);
        assert_ne!(derive_v1_key("password2"), a);
    }

    #[test]
    fn test_string_hash_casefolds() {
        let key = SymmCipher::new([1u8; 16]);
        assert_eq!(string_hash("User@X.com", &key), string_hash("user@x.com", &key));
        // 8 bytes -> 11 chars
        assert_eq!(string_hash("u@x", &key).len(), 11);
    }

    #[test]
    fn test_split_v2_key() {
        let mut derived = [0u8; 64];
        for (i, b) in derived.iter_mut().enumerate() {
            *b = i as u8;
        }
        let (aes, auth) = split_v2_key(&derived);
        assert_eq!(aes[0], 0);
        assert_eq!(auth[0], 32);
    }
}
