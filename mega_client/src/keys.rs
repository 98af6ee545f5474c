//! The key engine: node-key decryption, share-key distribution and
//! revocation, and the RSA-to-symmetric rewrite queue.
//!
//! Node keys arrive as `source:key` specs where source is either our own
//! user handle (master-key wrap) or the handle of a share root whose key
//! we may or may not hold yet. Decryption failure is never fatal; the
//! node stays "no-key" and a later share key unlocks it in an apply-key
//! walk over the subtree.

use mega_core::crypto::{self, SymmCipher};
use mega_core::{ApiError, NodeHandle, PcrHandle, UserHandle, b64};

use crate::client::MegaClient;
use crate::commands::Command;
use crate::consts::EVENT_SHARE_KEY_REPLACED;
use crate::nodes::{Access, NodeKey, NodeType, Share};

/// A share mutation collected from packets, `fetchnodes` or `ok`
/// elements, waiting to be merged into the node graph.
#[derive(Debug, Clone)]
pub struct NewShare {
    pub node: NodeHandle,
    pub outgoing: bool,
    pub peer: UserHandle,
    pub pcr: PcrHandle,
    pub access: Access,
    pub ts: i64,
    /// Share key, still wrapped with our master key.
    pub key: Option<Vec<u8>>,
    /// Share authentication token for outgoing shares.
    pub auth: Option<[u8; 16]>,
    /// On revocation, whether the share key should be dropped after
    /// rewriting foreign keys below the node.
    pub remove_key: bool,
    /// Pending share that was accepted and becomes a full share.
    pub upgrade_pending: bool,
}

impl MegaClient {
    /// Attempts to decrypt a node's pending key spec. Safe to call again
    /// whenever new share keys arrive.
    pub(crate) fn try_decrypt_node_key(&mut self, h: NodeHandle) {
        let Some(node) = self.nodes.get(h) else {
            return;
        };
        let NodeKey::Pending(spec) = &node.key else {
            return;
        };
        if spec.is_empty() {
            return;
        }
        let want_len = if node.ntype == NodeType::File { 32 } else { 16 };
        let spec = spec.clone();

        for part in spec.split('/') {
            let Some((src, key_b64)) = part.split_once(':') else {
                continue;
            };
            let Some((cipher, foreign)) = self.key_source_cipher(src) else {
                continue;
            };
            let Ok(mut key_bytes) = b64::decode(key_b64) else {
                tracing::warn!("undecodable key blob on node {h}");
                continue;
            };

            if key_bytes.len() > crypto::FILE_KEY_SIZE + 8 {
                // RSA-wrapped: longer than any symmetric form.
                let Some(privk) = self.session.rsa_key.clone() else {
                    continue;
                };
                match privk.decrypt(&key_bytes) {
                    Ok(plain) if plain.len() >= want_len => {
                        key_bytes = plain[..want_len].to_vec();
                        // Schedule replacement with a symmetric wrap so the
                        // server stops paying for RSA on every fetch.
                        self.key_rewrites.push(h);
                    }
                    _ => {
                        tracing::warn!("RSA unwrap failed for node {h}");
                        continue;
                    }
                }
            } else {
                if key_bytes.len() != want_len {
                    continue;
                }
                cipher.ecb_decrypt(&mut key_bytes);
            }

            let Some(node) = self.nodes.get_mut(h) else {
                return;
            };
            node.key = NodeKey::Decrypted(key_bytes);
            node.foreign_key = foreign;
            node.changed.key = true;
            self.apply_node_attrs(h);
            self.nodes.notify(h);
            return;
        }
    }

    /// Resolves a key-spec source into a cipher: our own user handle
    /// means the master key, a node handle means that node's share key.
    fn key_source_cipher(&self, src: &str) -> Option<(SymmCipher, bool)> {
        if src.len() == UserHandle::SIZE * 4 / 3 + 1 {
            let user = UserHandle::from_b64(src).ok()?;
            if Some(user) == self.session.me {
                return self.session.master_key.clone().map(|c| (c, false));
            }
            return None;
        }
        let share_node = NodeHandle::from_b64(src).ok()?;
        let key = self.nodes.get(share_node)?.share_key?;
        Some((SymmCipher::new(key), true))
    }

    /// Decrypts the attribute blob once a key is available, pulling out
    /// the display name and content fingerprint.
    pub(crate) fn apply_node_attrs(&mut self, h: NodeHandle) {
        let Some(node) = self.nodes.get(h) else {
            return;
        };
        let (Some(blob), Some(cipher)) = (node.attr_blob.clone(), node.cipher()) else {
            return;
        };
        let size = node.size;
        match mega_core::attrs::decrypt_attrs(&blob, &cipher) {
            Ok(attrs) => {
                let fingerprint = attrs
                    .get("c")
                    .and_then(serde_json::Value::as_str)
                    .and_then(|c| mega_core::FileFingerprint::from_attr(c, size).ok());
                let node = self.nodes.get_mut(h).expect("checked above");
                node.attrs = attrs;
                node.attr_blob = None;
                node.fingerprint = fingerprint;
                node.changed.attrs = true;
                if fingerprint.is_some() {
                    self.nodes.index_fingerprint(h);
                }
            }
            Err(_) => {
                tracing::warn!("attribute blob of {h} does not match its key");
            }
        }
    }

    /// Walks a subtree unlocking nodes that were waiting for the share
    /// key rooted at `top`.
    pub(crate) fn apply_keys_below(&mut self, top: NodeHandle) {
        for h in self.nodes.subtree(top) {
            self.try_decrypt_node_key(h);
        }
    }

    /// Drains the rewrite queue into one `NodeKeyUpdate` command that
    /// replaces RSA-wrapped keys with master-key wraps.
    pub(crate) fn flush_key_rewrites(&mut self) {
        if self.key_rewrites.is_empty() {
            return;
        }
        let Some(master) = self.session.master_key.clone() else {
            return;
        };
        let mut rewrites = Vec::new();
        let mut seen = std::collections::BTreeSet::new();
        for h in std::mem::take(&mut self.key_rewrites) {
            if !seen.insert(h) {
                continue;
            }
            let Some(node) = self.nodes.get(h) else {
                continue;
            };
            let Some(key) = node.key.decrypted() else {
                continue;
            };
            let mut wrapped = key.to_vec();
            master.ecb_encrypt(&mut wrapped);
            rewrites.push((h, b64::encode(&wrapped)));
        }
        if !rewrites.is_empty() {
            tracing::debug!(n = rewrites.len(), "rewriting RSA node keys");
            self.queue_command(Command::node_key_update(&rewrites));
        }
    }

    /// Merges every collected share mutation into the graph.
    pub(crate) fn merge_new_shares(&mut self) {
        for share in std::mem::take(&mut self.new_shares) {
            self.merge_new_share(share);
        }
    }

    fn merge_new_share(&mut self, ns: NewShare) {
        if !self.nodes.contains(ns.node) {
            tracing::debug!("share for unknown node {}", ns.node);
            return;
        }

        // 1. Key replacement, authenticated for outgoing shares.
        if let Some(wrapped) = &ns.key
            && let Some(master) = self.session.master_key.clone()
            && wrapped.len() == 16
        {
            let mut key = wrapped.clone();
            master.ecb_decrypt(&mut key);
            let key: [u8; 16] = key.try_into().expect("length checked");

            let node = self.nodes.get(ns.node).expect("checked above");
            let replacing = node.share_key.is_some_and(|old| old != key);
            let mut accept = true;
            if replacing && ns.outgoing {
                let auth_ok = ns.auth.is_some_and(|auth| {
                    crypto::handle_auth(&master, &ns.node.as_raw().to_le_bytes()[..6]) == auth
                });
                if !auth_ok {
                    tracing::warn!("rejecting unauthenticated share key swap on {}", ns.node);
                    accept = false;
                }
            }
            if accept {
                if replacing && self.state_current {
                    self.queue_command(Command::telemetry_event(
                        EVENT_SHARE_KEY_REPLACED,
                        "share key replaced",
                    ));
                }
                let node = self.nodes.get_mut(ns.node).expect("checked above");
                node.share_key = Some(key);
                self.apply_keys_below(ns.node);
            }
        }

        // 2. Access UNKNOWN with no key means revocation.
        if ns.access == Access::Unknown && ns.key.is_none() {
            self.revoke_share(ns);
            return;
        }

        // 3. Upsert the share edge.
        let share = Share {
            user: ns.peer,
            pcr: ns.pcr,
            access: ns.access,
            ts: ns.ts,
        };
        if ns.outgoing {
            let node = self.nodes.get_mut(ns.node).expect("checked above");
            if ns.upgrade_pending && ns.pcr.is_set() {
                node.pendingshares.remove(&ns.pcr);
                node.changed.pendingshares = true;
            }
            if ns.peer.is_set() {
                node.outshares.insert(ns.peer, share);
                node.changed.outshares = true;
            } else if ns.pcr.is_set() {
                node.pendingshares.insert(ns.pcr, share);
                node.changed.pendingshares = true;
            }
            self.nodes.notify(ns.node);
        } else {
            let node = self.nodes.get_mut(ns.node).expect("checked above");
            node.inshare = Some(share);
            node.changed.inshare = true;
            self.nodes.notify(ns.node);
            if ns.peer.is_set() {
                self.users.ensure(ns.peer).sharing.insert(ns.node);
                self.users.notify_user(ns.peer);
            }
        }

        // 4. A downgrade below FULL kills any sync rooted in the subtree.
        if ns.access != Access::Unknown && ns.access < Access::Full {
            self.fail_syncs_below(ns.node, mega_core::SyncError::ShareNonFullAccess);
        }
    }

    fn revoke_share(&mut self, ns: NewShare) {
        if ns.outgoing {
            let node = self.nodes.get_mut(ns.node).expect("caller checked");
            if ns.peer.is_set() {
                node.outshares.remove(&ns.peer);
                node.changed.outshares = true;
            }
            if ns.pcr.is_set() {
                node.pendingshares.remove(&ns.pcr);
                node.changed.pendingshares = true;
            }
            let now_unshared = node.outshares.is_empty() && node.pendingshares.is_empty();
            self.nodes.notify(ns.node);
            if now_unshared && ns.remove_key {
                self.rewrite_foreign_keys(ns.node);
                if let Some(node) = self.nodes.get_mut(ns.node) {
                    node.share_key = None;
                    node.changed.key = true;
                }
            }
        } else {
            let (parent, owner) = {
                let node = self.nodes.get(ns.node).expect("caller checked");
                (node.parent, node.inshare.map(|s| s.user))
            };
            if parent.is_none() {
                tracing::debug!("inshare {} revoked, purging subtree", ns.node);
                self.nodes.purge_subtree(ns.node);
            } else if let Some(node) = self.nodes.get_mut(ns.node) {
                node.inshare = None;
                node.changed.inshare = true;
                self.nodes.notify(ns.node);
            }
            if let Some(owner) = owner
                && let Some(user) = self.users.get_mut(owner)
            {
                user.sharing.remove(&ns.node);
                self.users.notify_user(owner);
            }
            self.fail_syncs_below(ns.node, mega_core::SyncError::ShareNonFullAccess);
        }
    }

    /// Queues key rewrites for every foreign-owned descendant of a node
    /// whose share just disappeared; their keys must stop being derivable
    /// from the revoked share key.
    pub(crate) fn rewrite_foreign_keys(&mut self, top: NodeHandle) {
        for h in self.nodes.subtree(top) {
            if let Some(node) = self.nodes.get(h)
                && node.foreign_key
                && node.has_key()
            {
                self.key_rewrites.push(h);
            }
        }
        self.flush_key_rewrites();
    }

    /// The effective access we hold on a node: owner unless it sits under
    /// an in-share.
    pub(crate) fn access_level(&self, h: NodeHandle) -> Access {
        let mut cursor = Some(h);
        while let Some(current) = cursor {
            let Some(node) = self.nodes.get(current) else {
                return Access::Unknown;
            };
            if let Some(inshare) = &node.inshare {
                return inshare.access;
            }
            cursor = node.parent;
        }
        Access::Owner
    }

    /// Raises the key-modified path for a contact whose tracked key
    /// changed: keep the tracked value, tell the embedder, log telemetry.
    pub(crate) fn on_key_modified(&mut self, user: UserHandle) -> ApiError {
        tracing::error!("tracked key changed for contact {user}");
        self.app.key_modified(user);
        self.queue_command(Command::telemetry_event(99414, "contact key modified"));
        ApiError::Key
    }
}
