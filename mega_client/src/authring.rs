//! Authrings: per-contact key fingerprints with an authentication level,
//! one ring per tracked key type (Ed25519, Cu25519, RSA).
//!
//! The cardinal rule: a tracked fingerprint is never overwritten. A
//! mismatch raises the key-modified path and keeps the old value, so a
//! server-side key substitution cannot silently succeed.

use std::collections::BTreeMap;

use mega_core::error::CodecError;
use mega_core::{UserHandle, crypto};

use crate::users::UserAttr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AuthMethod {
    /// Key observed, nothing verified.
    Seen,
    /// The user compared fingerprints out of band.
    Fingerprint,
    /// A valid signature chains the key to the contact's Ed25519 key.
    Signature,
}

impl AuthMethod {
    fn code(self) -> u8 {
        match self {
            AuthMethod::Seen => 0,
            AuthMethod::Fingerprint => 1,
            AuthMethod::Signature => 2,
        }
    }

    fn from_code(code: u8) -> Option<AuthMethod> {
        match code {
            0 => Some(AuthMethod::Seen),
            1 => Some(AuthMethod::Fingerprint),
            2 => Some(AuthMethod::Signature),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRingType {
    Ed25519,
    Cu25519,
    Rsa,
}

impl AuthRingType {
    pub fn attr(&self) -> UserAttr {
        match self {
            AuthRingType::Ed25519 => UserAttr::AuthRing,
            AuthRingType::Cu25519 => UserAttr::AuthCu255,
            AuthRingType::Rsa => UserAttr::AuthRsa,
        }
    }
}

/// Outcome of tracking one observed contact key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackResult {
    /// First observation, added.
    Added,
    /// Already tracked with the same fingerprint.
    Unchanged,
    /// Upgraded (e.g. a signature now verifies).
    Upgraded,
    /// Fingerprint differs from the tracked one. Entry NOT updated.
    Mismatch,
}

const ENTRY_SIZE: usize = 8 + 20 + 1;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthRing {
    entries: BTreeMap<UserHandle, ([u8; 20], AuthMethod)>,
}

impl AuthRing {
    pub fn new() -> AuthRing {
        AuthRing::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, user: UserHandle) -> Option<(&[u8; 20], AuthMethod)> {
        self.entries.get(&user).map(|(fp, m)| (fp, *m))
    }

    /// Records an observation of `pubkey` for `user`.
    pub fn track(&mut self, user: UserHandle, pubkey: &[u8], signature_ok: bool) -> TrackResult {
        let fp = crypto::key_fingerprint(pubkey);
        match self.entries.get_mut(&user) {
            Some((tracked, method)) => {
                if *tracked != fp {
                    return TrackResult::Mismatch;
                }
                if signature_ok && *method < AuthMethod::Signature {
                    *method = AuthMethod::Signature;
                    TrackResult::Upgraded
                } else {
                    TrackResult::Unchanged
                }
            }
            None => {
                let method = if signature_ok {
                    AuthMethod::Signature
                } else {
                    AuthMethod::Seen
                };
                self.entries.insert(user, (fp, method));
                TrackResult::Added
            }
        }
    }

    /// "Verify credentials": the user confirmed the fingerprint.
    pub fn set_verified(&mut self, user: UserHandle) -> bool {
        match self.entries.get_mut(&user) {
            Some((_, method)) if *method == AuthMethod::Seen => {
                *method = AuthMethod::Fingerprint;
                true
            }
            _ => false,
        }
    }

    /// Wire form stored in the user attribute: fixed-size entries of
    /// handle, fingerprint and level.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.len() * ENTRY_SIZE);
        for (user, (fp, method)) in &self.entries {
            out.extend_from_slice(&user.as_raw().to_le_bytes());
            out.extend_from_slice(fp);
            out.push(method.code());
        }
        out
    }

    pub fn deserialize(data: &[u8]) -> Result<AuthRing, CodecError> {
        if data.len() % ENTRY_SIZE != 0 {
            return Err(CodecError::Truncated);
        }
        let mut entries = BTreeMap::new();
        for rec in data.chunks_exact(ENTRY_SIZE) {
            let user = UserHandle::from_raw(u64::from_le_bytes(rec[..8].try_into().unwrap()));
            let mut fp = [0u8; 20];
            fp.copy_from_slice(&rec[8..28]);
            let method = AuthMethod::from_code(rec[28]).ok_or(CodecError::Truncated)?;
            entries.insert(user, (fp, method));
        }
        Ok(AuthRing { entries })
    }
}

/// The three rings plus the temporary collection mode used while loading
/// all contact keys in a fresh session: updates batch into one attribute
/// write once every contact resolves.
#[derive(Debug, Default)]
pub struct AuthRings {
    pub ed25519: AuthRing,
    pub cu25519: AuthRing,
    pub rsa: AuthRing,
    bulk: bool,
    dirty: [bool; 3],
}

impl AuthRings {
    pub fn new() -> AuthRings {
        AuthRings::default()
    }

    pub fn ring(&self, rtype: AuthRingType) -> &AuthRing {
        match rtype {
            AuthRingType::Ed25519 => &self.ed25519,
            AuthRingType::Cu25519 => &self.cu25519,
            AuthRingType::Rsa => &self.rsa,
        }
    }

    pub fn ring_mut(&mut self, rtype: AuthRingType) -> &mut AuthRing {
        match rtype {
            AuthRingType::Ed25519 => &mut self.ed25519,
            AuthRingType::Cu25519 => &mut self.cu25519,
            AuthRingType::Rsa => &mut self.rsa,
        }
    }

    fn idx(rtype: AuthRingType) -> usize {
        match rtype {
            AuthRingType::Ed25519 => 0,
            AuthRingType::Cu25519 => 1,
            AuthRingType::Rsa => 2,
        }
    }

    pub fn track(
        &mut self,
        rtype: AuthRingType,
        user: UserHandle,
        pubkey: &[u8],
        signature_ok: bool,
    ) -> TrackResult {
        let result = self.ring_mut(rtype).track(user, pubkey, signature_ok);
        if matches!(result, TrackResult::Added | TrackResult::Upgraded) {
            self.dirty[Self::idx(rtype)] = true;
        }
        result
    }

    /// Enters bulk mode: ring mutations collect locally instead of being
    /// pushed attribute-write-per-contact.
    pub fn begin_bulk(&mut self) {
        self.bulk = true;
    }

    /// Leaves bulk mode, returning the rings that changed and now need a
    /// single combined attribute update each.
    pub fn end_bulk(&mut self) -> Vec<AuthRingType> {
        self.bulk = false;
        self.take_dirty()
    }

    pub fn in_bulk(&self) -> bool {
        self.bulk
    }

    /// Rings with unsaved changes; cleared on take. Outside bulk mode the
    /// caller pushes these immediately.
    pub fn take_dirty(&mut self) -> Vec<AuthRingType> {
        let mut out = Vec::new();
        for (i, rtype) in [
            AuthRingType::Ed25519,
            AuthRingType::Cu25519,
            AuthRingType::Rsa,
        ]
        .into_iter()
        .enumerate()
        {
            if self.dirty[i] {
                out.push(rtype);
                self.dirty[i] = false;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u(raw: u64) -> UserHandle {
        UserHandle::from_raw(raw)
    }

    #[test]
    fn test_track_and_upgrade() {
        let mut ring = AuthRing::new();
        assert_eq!(ring.track(u(1), b"pubkey-a", false), TrackResult::Added);
        assert_eq!(ring.get(u(1)).unwrap().1, AuthMethod::Seen);

        assert_eq!(ring.track(u(1), b"pubkey-a", false), TrackResult::Unchanged);
        assert_eq!(ring.track(u(1), b"pubkey-a", true), TrackResult::Upgraded);
        assert_eq!(ring.get(u(1)).unwrap().1, AuthMethod::Signature);
    }

    #[test]
    fn test_mismatch_preserves_tracked_key() {
        let mut ring = AuthRing::new();
        ring.track(u(1), b"pubkey-a", false);
        let before = *ring.get(u(1)).unwrap().0;

        assert_eq!(ring.track(u(1), b"pubkey-EVIL", true), TrackResult::Mismatch);
        assert_eq!(*ring.get(u(1)).unwrap().0, before);
        assert_eq!(ring.get(u(1)).unwrap().1, AuthMethod::Seen);
    }

    #[test]
    fn test_verify_credentials_only_upgrades_seen() {
        let mut ring = AuthRing::new();
        ring.track(u(1), b"pk", false);
        assert!(ring.set_verified(u(1)));
        assert_eq!(ring.get(u(1)).unwrap().1, AuthMethod::Fingerprint);
        // does not downgrade a signature
        ring.track(u(2), b"pk2", true);
        assert!(!ring.set_verified(u(2)));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut ring = AuthRing::new();
        ring.track(u(1), b"pk-one", false);
        ring.track(u(2), b"pk-two", true);
        let back = AuthRing::deserialize(&ring.serialize()).unwrap();
        assert_eq!(ring, back);
        assert!(AuthRing::deserialize(&[0u8; 7]).is_err());
    }

    #[test]
    fn test_bulk_collects_dirty_rings() {
        let mut rings = AuthRings::new();
        rings.begin_bulk();
        rings.track(AuthRingType::Ed25519, u(1), b"pk", false);
        rings.track(AuthRingType::Cu25519, u(1), b"pk", false);
        let dirty = rings.end_bulk();
        assert_eq!(dirty.len(), 2);
        assert!(rings.take_dirty().is_empty());
    }
}
