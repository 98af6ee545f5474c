//! Users, pending contact requests and the chat table, with their
//! notification queues and the per-attribute version cache.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use mega_core::crypto::RsaKey;
use mega_core::{ChatHandle, NodeHandle, PcrHandle, UserHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Unknown,
    Hidden,
    Visible,
    Inactive,
    Blocked,
}

impl Visibility {
    pub fn from_code(code: i64) -> Visibility {
        match code {
            0 => Visibility::Hidden,
            1 => Visibility::Visible,
            2 => Visibility::Inactive,
            3 => Visibility::Blocked,
            _ => Visibility::Unknown,
        }
    }
}

/// User attribute names the engine itself reacts to. Everything else is
/// cached opaquely for the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UserAttr {
    Keyring,
    AuthRing,
    AuthCu255,
    AuthRsa,
    Ed25519PubKey,
    Cu25519PubKey,
    SigCu255,
    SigRsa,
    DisableVersions,
    PushSettings,
    StorageState,
    Other(&'static str),
}

impl UserAttr {
    pub fn code(&self) -> &'static str {
        match self {
            UserAttr::Keyring => "*keyring",
            UserAttr::AuthRing => "*!authring",
            UserAttr::AuthCu255 => "*!authCu255",
            UserAttr::AuthRsa => "*!authRSA",
            UserAttr::Ed25519PubKey => "+puEd255",
            UserAttr::Cu25519PubKey => "+puCu255",
            UserAttr::SigCu255 => "+sigCu255",
            UserAttr::SigRsa => "+sigPubk",
            UserAttr::DisableVersions => "^!dv",
            UserAttr::PushSettings => "^!ps",
            UserAttr::StorageState => "^!usl",
            UserAttr::Other(s) => s,
        }
    }

    pub fn from_code(code: &str) -> UserAttr {
        match code {
            "*keyring" => UserAttr::Keyring,
            "*!authring" => UserAttr::AuthRing,
            "*!authCu255" => UserAttr::AuthCu255,
            "*!authRSA" => UserAttr::AuthRsa,
            "+puEd255" => UserAttr::Ed25519PubKey,
            "+puCu255" => UserAttr::Cu25519PubKey,
            "+sigCu255" => UserAttr::SigCu255,
            "+sigPubk" => UserAttr::SigRsa,
            "^!dv" => UserAttr::DisableVersions,
            "^!ps" => UserAttr::PushSettings,
            "^!usl" => UserAttr::StorageState,
            _ => UserAttr::Other("?"),
        }
    }

    /// Attributes the engine re-fetches immediately when a version bump
    /// invalidates them, because its own behavior depends on the value.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            UserAttr::DisableVersions
                | UserAttr::PushSettings
                | UserAttr::StorageState
                | UserAttr::Keyring
                | UserAttr::AuthRing
                | UserAttr::AuthCu255
                | UserAttr::AuthRsa
        )
    }
}

#[derive(Debug, Clone)]
pub struct CachedAttr {
    pub value: Vec<u8>,
    pub version: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserChanges {
    pub new: bool,
    pub email: bool,
    pub visibility: bool,
    pub attrs: bool,
    pub pubkey: bool,
    pub removed: bool,
}

impl UserChanges {
    pub fn clear(&mut self) {
        *self = UserChanges::default();
    }
}

#[derive(Debug, Clone)]
pub struct User {
    pub handle: UserHandle,
    pub email: String,
    pub visibility: Visibility,
    pub ctime: i64,
    /// Business account flag from the `ub` packet.
    pub business: bool,
    /// Nodes this user shares into our account.
    pub sharing: BTreeSet<NodeHandle>,
    /// Cached attribute values with their version tokens.
    pub attrs: BTreeMap<String, CachedAttr>,
    /// Public RSA key, once fetched.
    pub pubkey: Option<RsaKey>,
    /// Commands parked until the public key arrives (app tags).
    pub pubkey_waiters: Vec<u32>,
    pub changed: UserChanges,
}

impl User {
    pub fn new(handle: UserHandle) -> User {
        User {
            handle,
            email: String::new(),
            visibility: Visibility::Unknown,
            ctime: 0,
            business: false,
            sharing: BTreeSet::new(),
            attrs: BTreeMap::new(),
            pubkey: None,
            pubkey_waiters: Vec::new(),
            changed: UserChanges::default(),
        }
    }

    pub fn set_attr(&mut self, attr: UserAttr, value: Vec<u8>, version: String) {
        self.set_attr_raw(attr.code(), value, version);
    }

    /// Stores an attribute under its wire name, preserving names this
    /// client has no enum for.
    pub fn set_attr_raw(&mut self, code: &str, value: Vec<u8>, version: String) {
        self.attrs
            .insert(code.to_string(), CachedAttr { value, version });
        self.changed.attrs = true;
    }

    pub fn attr(&self, attr: UserAttr) -> Option<&CachedAttr> {
        self.attrs.get(attr.code())
    }

    /// Drops a cached value whose version token went stale.
    pub fn invalidate_attr(&mut self, code: &str) {
        self.attrs.remove(code);
        self.changed.attrs = true;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PcrChanges {
    pub new: bool,
    pub accepted: bool,
    pub denied: bool,
    pub ignored: bool,
    pub deleted: bool,
    pub reminded: bool,
}

/// A pending contact request, either direction.
#[derive(Debug, Clone)]
pub struct PendingContactRequest {
    pub handle: PcrHandle,
    pub origin_email: String,
    pub target_email: String,
    pub ts: i64,
    pub uts: i64,
    pub message: String,
    pub outgoing: bool,
    pub removed: bool,
    pub changed: PcrChanges,
}

impl PendingContactRequest {
    pub fn new(handle: PcrHandle) -> PendingContactRequest {
        PendingContactRequest {
            handle,
            origin_email: String::new(),
            target_email: String::new(),
            ts: 0,
            uts: 0,
            message: String::new(),
            outgoing: false,
            removed: false,
            changed: PcrChanges::default(),
        }
    }
}

/// Chat room state as far as the packet stream carries it.
#[derive(Debug, Clone)]
pub struct ChatRoom {
    pub handle: ChatHandle,
    pub group: bool,
    pub shard: i64,
    /// user -> privilege code
    pub peers: BTreeMap<UserHandle, i64>,
    pub flags: i64,
    /// node -> users granted access through this chat
    pub node_access: BTreeMap<NodeHandle, BTreeSet<UserHandle>>,
}

impl ChatRoom {
    pub fn new(handle: ChatHandle) -> ChatRoom {
        ChatRoom {
            handle,
            group: false,
            shard: 0,
            peers: BTreeMap::new(),
            flags: 0,
            node_access: BTreeMap::new(),
        }
    }
}

/// User + PCR + chat tables with notification queues.
#[derive(Default)]
pub struct UserStore {
    users: HashMap<UserHandle, User>,
    emails: HashMap<String, UserHandle>,
    pcrs: HashMap<PcrHandle, PendingContactRequest>,
    pub chats: HashMap<ChatHandle, ChatRoom>,
    user_notify: Vec<UserHandle>,
    pcr_notify: Vec<PcrHandle>,
}

impl UserStore {
    pub fn new() -> UserStore {
        UserStore::default()
    }

    pub fn get(&self, h: UserHandle) -> Option<&User> {
        self.users.get(&h)
    }

    pub fn get_mut(&mut self, h: UserHandle) -> Option<&mut User> {
        self.users.get_mut(&h)
    }

    pub fn by_email(&self, email: &str) -> Option<&User> {
        self.emails.get(email).and_then(|h| self.users.get(h))
    }

    pub fn handles(&self) -> Vec<UserHandle> {
        self.users.keys().copied().collect()
    }

    /// Fetch-or-create. The email mapping stays 1:1 among non-inactive
    /// users: adopting an email for a new handle drops it from the old.
    pub fn ensure(&mut self, h: UserHandle) -> &mut User {
        self.users.entry(h).or_insert_with(|| {
            let mut user = User::new(h);
            user.changed.new = true;
            user
        })
    }

    pub fn set_email(&mut self, h: UserHandle, email: &str) {
        if email.is_empty() {
            return;
        }
        if let Some(old) = self.emails.insert(email.to_string(), h)
            && old != h
            && let Some(user) = self.users.get_mut(&old)
        {
            user.email.clear();
            user.changed.email = true;
        }
        let user = self.ensure(h);
        if user.email != email {
            user.email = email.to_string();
            user.changed.email = true;
        }
    }

    pub fn insert_pcr(&mut self, pcr: PendingContactRequest) {
        self.pcrs.insert(pcr.handle, pcr);
    }

    pub fn pcr(&self, h: PcrHandle) -> Option<&PendingContactRequest> {
        self.pcrs.get(&h)
    }

    pub fn pcr_mut(&mut self, h: PcrHandle) -> Option<&mut PendingContactRequest> {
        self.pcrs.get_mut(&h)
    }

    pub fn pcr_handles(&self) -> Vec<PcrHandle> {
        self.pcrs.keys().copied().collect()
    }

    pub fn notify_user(&mut self, h: UserHandle) {
        self.user_notify.push(h);
    }

    pub fn notify_pcr(&mut self, h: PcrHandle) {
        self.pcr_notify.push(h);
    }

    pub fn take_user_notifications(&mut self) -> Vec<UserHandle> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for h in std::mem::take(&mut self.user_notify) {
            if seen.insert(h) && self.users.contains_key(&h) {
                if let Some(user) = self.users.get_mut(&h) {
                    user.changed.clear();
                }
                out.push(h);
            }
        }
        out
    }

    pub fn take_pcr_notifications(&mut self) -> Vec<PcrHandle> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for h in std::mem::take(&mut self.pcr_notify) {
            if seen.insert(h) {
                if let Some(pcr) = self.pcrs.get(&h)
                    && pcr.removed
                {
                    self.pcrs.remove(&h);
                }
                out.push(h);
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
    fn test_email_mapping_is_one_to_one() {
        let mut store = UserStore::new();
        store.set_email(u(1), "a@x");
        store.set_email(u(2), "a@x");
        assert_eq!(store.by_email("a@x").unwrap().handle, u(2));
        assert!(store.get(u(1)).unwrap().email.is_empty());
    }

    #[test]
    fn test_attr_cache_versions() {
        let mut store = UserStore::new();
        let user = store.ensure(u(1));
        user.set_attr(UserAttr::DisableVersions, b"1".to_vec(), "v1".into());
        assert_eq!(user.attr(UserAttr::DisableVersions).unwrap().version, "v1");
        user.invalidate_attr("^!dv");
        assert!(user.attr(UserAttr::DisableVersions).is_none());
    }

    #[test]
    fn test_pcr_removed_on_drain() {
        let mut store = UserStore::new();
        let h = PcrHandle::from_raw(9);
        let mut pcr = PendingContactRequest::new(h);
        pcr.removed = true;
        store.insert_pcr(pcr);
        store.notify_pcr(h);
        assert_eq!(store.take_pcr_notifications(), vec![h]);
        assert!(store.pcr(h).is_none());
    }
}
