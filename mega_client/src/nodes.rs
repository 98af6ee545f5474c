//! The in-memory node graph: files, folders and the three tree roots,
//! plus the children index, fingerprint index and notification queue.
//!
//! Only the action-packet processor and command completions mutate this
//! store from server truth; everything else reads it. Mutations mark a
//! `changed` bitset on the node and push it onto the notification queue,
//! which the main loop drains once per tick into the embedder callback.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde_json::{Map, Value};

use mega_core::crypto::SymmCipher;
use mega_core::{FileFingerprint, NodeHandle, PcrHandle, PublicHandle, UserHandle};

/// Node types as encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    File,
    Folder,
    Root,
    Vault,
    Rubbish,
}

impl NodeType {
    pub fn from_code(code: i64) -> Option<NodeType> {
        match code {
            0 => Some(NodeType::File),
            1 => Some(NodeType::Folder),
            2 => Some(NodeType::Root),
            3 => Some(NodeType::Vault),
            4 => Some(NodeType::Rubbish),
            _ => None,
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            NodeType::File => 0,
            NodeType::Folder => 1,
            NodeType::Root => 2,
            NodeType::Vault => 3,
            NodeType::Rubbish => 4,
        }
    }

    pub fn is_root_type(&self) -> bool {
        matches!(self, NodeType::Root | NodeType::Vault | NodeType::Rubbish)
    }

    pub fn is_container(&self) -> bool {
        *self != NodeType::File
    }
}

/// Share access levels. `Unknown` only appears in packets, where it marks
/// a revocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Access {
    Unknown,
    ReadOnly,
    ReadWrite,
    Full,
    Owner,
}

impl Access {
    pub fn from_code(code: i64) -> Access {
        match code {
            0 => Access::ReadOnly,
            1 => Access::ReadWrite,
            2 => Access::Full,
            3 => Access::Owner,
            _ => Access::Unknown,
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            Access::Unknown => -1,
            Access::ReadOnly => 0,
            Access::ReadWrite => 1,
            Access::Full => 2,
            Access::Owner => 3,
        }
    }
}

/// One share edge on a node: either to a user or to a pending contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Share {
    pub user: UserHandle,
    pub pcr: PcrHandle,
    pub access: Access,
    pub ts: i64,
}

/// Exported-link state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicLinkState {
    pub ph: PublicHandle,
    pub cts: i64,
    pub ets: i64,
    pub taken_down: bool,
}

/// Decryption state of a node key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKey {
    /// No usable key yet; the raw `source:key` spec is kept so a later
    /// share key can still unlock it.
    Pending(String),
    /// Plain 16- or 32-byte key.
    Decrypted(Vec<u8>),
}

impl NodeKey {
    pub fn decrypted(&self) -> Option<&[u8]> {
        match self {
            NodeKey::Decrypted(k) => Some(k),
            NodeKey::Pending(_) => None,
        }
    }
}

/// Which aspects of a node have pending notifications.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeChanges {
    pub new: bool,
    pub attrs: bool,
    pub owner: bool,
    pub ctime: bool,
    pub fileattrs: bool,
    pub parent: bool,
    pub removed: bool,
    pub key: bool,
    pub inshare: bool,
    pub outshares: bool,
    pub pendingshares: bool,
    pub public_link: bool,
}

impl NodeChanges {
    pub fn any(&self) -> bool {
        *self != NodeChanges::default()
    }

    pub fn clear(&mut self) {
        *self = NodeChanges::default();
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub handle: NodeHandle,
    pub parent: Option<NodeHandle>,
    pub owner: UserHandle,
    pub ntype: NodeType,
    pub size: u64,
    pub ctime: i64,
    /// Decrypted attribute map; empty while the key is pending.
    pub attrs: Map<String, Value>,
    /// Raw encrypted attribute blob, kept until a key arrives.
    pub attr_blob: Option<Vec<u8>>,
    pub key: NodeKey,
    /// File-attribute descriptor string (`num*type/handle` list).
    pub fileattrs: Option<String>,
    /// Share key if this node roots an outgoing or incoming share.
    pub share_key: Option<[u8; 16]>,
    pub outshares: BTreeMap<UserHandle, Share>,
    pub pendingshares: BTreeMap<PcrHandle, Share>,
    pub inshare: Option<Share>,
    pub plink: Option<PublicLinkState>,
    /// Key was wrapped by someone else's master key (share member).
    pub foreign_key: bool,
    pub fingerprint: Option<FileFingerprint>,
    pub changed: NodeChanges,
}

impl Node {
    pub fn new(handle: NodeHandle, ntype: NodeType) -> Node {
        Node {
            handle,
            parent: None,
            owner: UserHandle::UNDEF,
            ntype,
            size: 0,
            ctime: 0,
            attrs: Map::new(),
            attr_blob: None,
            key: NodeKey::Pending(String::new()),
            fileattrs: None,
            share_key: None,
            outshares: BTreeMap::new(),
            pendingshares: BTreeMap::new(),
            inshare: None,
            plink: None,
            foreign_key: false,
            fingerprint: None,
            changed: NodeChanges::default(),
        }
    }

    /// Display name from the decrypted attributes.
    pub fn name(&self) -> &str {
        match self.ntype {
            NodeType::Root => "Cloud Drive",
            NodeType::Vault => "Vault",
            NodeType::Rubbish => "Rubbish Bin",
            _ => self
                .attrs
                .get("n")
                .and_then(Value::as_str)
                .unwrap_or("NO_NAME"),
        }
    }

    pub fn has_key(&self) -> bool {
        matches!(self.key, NodeKey::Decrypted(_))
    }

    pub fn cipher(&self) -> Option<SymmCipher> {
        let key = self.key.decrypted()?;
        match key.len() {
            16 => SymmCipher::from_slice(key).ok(),
            32 => {
                let arr: [u8; 32] = key.try_into().ok()?;
                Some(SymmCipher::new(mega_core::crypto::FileKey::unfold(&arr).aes))
            }
            _ => None,
        }
    }

    /// True while a share (pending or established, either direction) or a
    /// public link requires this node to keep its share key.
    pub fn is_shared(&self) -> bool {
        !self.outshares.is_empty() || !self.pendingshares.is_empty() || self.inshare.is_some()
    }
}

/// The mutable node graph plus its indexes.
#[derive(Default)]
pub struct NodeStore {
    map: HashMap<NodeHandle, Node>,
    children: HashMap<NodeHandle, BTreeSet<NodeHandle>>,
    pub root: NodeHandle,
    pub vault: NodeHandle,
    pub rubbish: NodeHandle,
    fingerprints: HashMap<(u64, [u32; 4]), BTreeSet<NodeHandle>>,
    notify_queue: Vec<NodeHandle>,
}

impl NodeStore {
    pub fn new() -> NodeStore {
        NodeStore {
            root: NodeHandle::UNDEF,
            vault: NodeHandle::UNDEF,
            rubbish: NodeHandle::UNDEF,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, h: NodeHandle) -> Option<&Node> {
        self.map.get(&h)
    }

    pub fn get_mut(&mut self, h: NodeHandle) -> Option<&mut Node> {
        self.map.get_mut(&h)
    }

    pub fn contains(&self, h: NodeHandle) -> bool {
        self.map.contains_key(&h)
    }

    pub fn handles(&self) -> Vec<NodeHandle> {
        self.map.keys().copied().collect()
    }

    /// Inserts a node, indexing its parent edge, root role and
    /// fingerprint. An existing node under the same handle is replaced.
    pub fn insert(&mut self, node: Node) {
        let handle = node.handle;
        if let Some(old) = self.map.remove(&handle) {
            self.unindex(&old);
        }
        match node.ntype {
            NodeType::Root => self.root = handle,
            NodeType::Vault => self.vault = handle,
            NodeType::Rubbish => self.rubbish = handle,
            _ => {}
        }
        if let Some(parent) = node.parent {
            self.children.entry(parent).or_default().insert(handle);
        }
        if let Some(fp) = &node.fingerprint {
            self.fingerprints
                .entry((fp.size, fp.crc))
                .or_default()
                .insert(handle);
        }
        self.map.insert(handle, node);
    }

    fn unindex(&mut self, node: &Node) {
        if let Some(parent) = node.parent
            && let Some(set) = self.children.get_mut(&parent)
        {
            set.remove(&node.handle);
            if set.is_empty() {
                self.children.remove(&parent);
            }
        }
        if let Some(fp) = &node.fingerprint
            && let Some(set) = self.fingerprints.get_mut(&(fp.size, fp.crc))
        {
            set.remove(&node.handle);
            if set.is_empty() {
                self.fingerprints.remove(&(fp.size, fp.crc));
            }
        }
    }

    /// Re-parents a node, maintaining the children index.
    pub fn set_parent(&mut self, h: NodeHandle, new_parent: Option<NodeHandle>) {
        let Some(node) = self.map.get_mut(&h) else {
            return;
        };
        let old_parent = node.parent;
        node.parent = new_parent;
        node.changed.parent = true;
        if let Some(old) = old_parent
            && let Some(set) = self.children.get_mut(&old)
        {
            set.remove(&h);
        }
        if let Some(new) = new_parent {
            self.children.entry(new).or_default().insert(h);
        }
    }

    /// Records a late-resolved fingerprint in the index.
    pub fn index_fingerprint(&mut self, h: NodeHandle) {
        if let Some(node) = self.map.get(&h)
            && let Some(fp) = node.fingerprint
        {
            self.fingerprints
                .entry((fp.size, fp.crc))
                .or_default()
                .insert(h);
        }
    }

    pub fn children_of(&self, h: NodeHandle) -> impl Iterator<Item = NodeHandle> + '_ {
        self.children.get(&h).into_iter().flatten().copied()
    }

    pub fn child_count(&self, h: NodeHandle) -> usize {
        self.children.get(&h).map_or(0, BTreeSet::len)
    }

    /// First child of a folder matching a decrypted name.
    pub fn child_by_name(&self, parent: NodeHandle, name: &str) -> Option<NodeHandle> {
        self.children_of(parent)
            .find(|h| self.get(*h).is_some_and(|n| n.name() == name))
    }

    /// Nodes whose content fingerprint matches (any mtime).
    pub fn by_fingerprint(&self, fp: &FileFingerprint) -> Vec<NodeHandle> {
        self.fingerprints
            .get(&(fp.size, fp.crc))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// True if `ancestor` lies on the parent chain of `h` (or equals it).
    pub fn is_ancestor(&self, ancestor: NodeHandle, h: NodeHandle) -> bool {
        let mut cursor = Some(h);
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            cursor = self.get(current).and_then(|n| n.parent);
        }
        false
    }

    /// Walks up to the first node carrying a share key.
    pub fn share_key_ancestor(&self, h: NodeHandle) -> Option<NodeHandle> {
        let mut cursor = Some(h);
        while let Some(current) = cursor {
            let node = self.get(current)?;
            if node.share_key.is_some() {
                return Some(current);
            }
            cursor = node.parent;
        }
        None
    }

    /// Collects `h` and every descendant, depth-first.
    pub fn subtree(&self, h: NodeHandle) -> Vec<NodeHandle> {
        let mut out = Vec::new();
        let mut stack = vec![h];
        while let Some(current) = stack.pop() {
            if self.contains(current) {
                out.push(current);
                stack.extend(self.children_of(current));
            }
        }
        out
    }

    /// Removes a whole subtree, queueing removal notifications.
    pub fn purge_subtree(&mut self, h: NodeHandle) -> Vec<NodeHandle> {
        let doomed = self.subtree(h);
        for handle in &doomed {
            if let Some(mut node) = self.map.remove(handle) {
                self.unindex(&node);
                node.changed.removed = true;
                self.notify_queue.push(*handle);
                self.map.insert(*handle, node);
            }
        }
        // Leave the removal notifications visible until the purge; the
        // actual drop happens in take_notifications.
        doomed
    }

    /// Queues a notification for a node (idempotent per tick).
    pub fn notify(&mut self, h: NodeHandle) {
        self.notify_queue.push(h);
    }

    pub fn has_pending_notifications(&self) -> bool {
        !self.notify_queue.is_empty()
    }

    /// Drains the queue, deduplicated in arrival order, returning each
    /// node's change bitset, clearing it, and dropping nodes marked
    /// removed from the store.
    pub fn drain_notifications(&mut self) -> Vec<(NodeHandle, NodeChanges)> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for h in std::mem::take(&mut self.notify_queue) {
            if seen.insert(h) && self.map.contains_key(&h) {
                out.push(h);
            }
        }
        let mut result = Vec::with_capacity(out.len());
        for h in out {
            let changes = {
                let node = self.map.get_mut(&h).expect("checked above");
                let changes = node.changed;
                node.changed.clear();
                changes
            };
            if changes.removed
                && let Some(node) = self.map.remove(&h)
            {
                self.unindex(&node);
            }
            result.push((h, changes));
        }
        result
    }

    /// Notification handles only, for callers that don't need bitsets.
    pub fn take_notifications(&mut self) -> Vec<NodeHandle> {
        self.drain_notifications().into_iter().map(|(h, _)| h).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(raw: u64) -> NodeHandle {
        NodeHandle::from_raw(raw)
    }

    fn store_with_root() -> NodeStore {
        let mut store = NodeStore::new();
        store.insert(Node::new(h(1), NodeType::Root));
        store
    }

    #[test]
    fn test_insert_and_children_index() {
        let mut store = store_with_root();
        let mut file = Node::new(h(2), NodeType::File);
        file.parent = Some(h(1));
        store.insert(file);

        assert_eq!(store.root, h(1));
        assert_eq!(store.children_of(h(1)).collect::<Vec<_>>(), vec![h(2)]);
    }

    #[test]
    fn test_set_parent_moves_child() {
        let mut store = store_with_root();
        store.insert(Node::new(h(3), NodeType::Rubbish));
        let mut file = Node::new(h(2), NodeType::File);
        file.parent = Some(h(1));
        store.insert(file);

        store.set_parent(h(2), Some(h(3)));
        assert_eq!(store.children_of(h(1)).count(), 0);
        assert_eq!(store.children_of(h(3)).collect::<Vec<_>>(), vec![h(2)]);
        assert!(store.get(h(2)).unwrap().changed.parent);
    }

    #[test]
    fn test_is_ancestor() {
        let mut store = store_with_root();
        let mut folder = Node::new(h(2), NodeType::Folder);
        folder.parent = Some(h(1));
        store.insert(folder);
        let mut file = Node::new(h(3), NodeType::File);
        file.parent = Some(h(2));
        store.insert(file);

        assert!(store.is_ancestor(h(1), h(3)));
        assert!(store.is_ancestor(h(2), h(3)));
        assert!(!store.is_ancestor(h(3), h(1)));
    }

    #[test]
    fn test_purge_subtree() {
        let mut store = store_with_root();
        let mut folder = Node::new(h(2), NodeType::Folder);
        folder.parent = Some(h(1));
        store.insert(folder);
        let mut file = Node::new(h(3), NodeType::File);
        file.parent = Some(h(2));
        store.insert(file);

        let doomed = store.purge_subtree(h(2));
        assert_eq!(doomed.len(), 2);
        // still visible until notifications drain
        assert!(store.contains(h(2)));
        let notified = store.take_notifications();
        assert_eq!(notified.len(), 2);
        assert!(!store.contains(h(2)));
        assert!(!store.contains(h(3)));
        assert!(store.contains(h(1)));
    }

    #[test]
    fn test_fingerprint_index() {
        let mut store = store_with_root();
        let fp = FileFingerprint::from_bytes(b"data", 42);
        let mut file = Node::new(h(2), NodeType::File);
        file.parent = Some(h(1));
        file.fingerprint = Some(fp);
        store.insert(file);

        let other_mtime = FileFingerprint { mtime: 7, ..fp };
        assert_eq!(store.by_fingerprint(&other_mtime), vec![h(2)]);
    }

    #[test]
    fn test_notifications_dedup() {
        let mut store = store_with_root();
        store.notify(h(1));
        store.notify(h(1));
        store.notify(h(99)); // unknown handles are dropped
        assert_eq!(store.take_notifications(), vec![h(1)]);
        assert!(!store.has_pending_notifications());
    }
}
