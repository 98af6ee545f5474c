//! The local mirror tree: one `LocalNode` per filesystem entry under a
//! sync root, held in an id-keyed arena. Parent/child links are ids, the
//! remote pairing is a handle with a reverse index, and both sides of a
//! pairing are explicitly nulled when either is destroyed.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};

use mega_core::{Ds, FileFingerprint, NodeHandle};

use crate::transfers::TransferId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalNodeId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalType {
    File,
    Dir,
}

#[derive(Debug)]
pub struct LocalNode {
    pub id: LocalNodeId,
    pub parent: Option<LocalNodeId>,
    /// Platform-encoded name within the parent.
    pub name: String,
    pub ltype: LocalType,
    pub size: u64,
    pub mtime: i64,
    pub fingerprint: Option<FileFingerprint>,
    /// A worker is computing the fingerprint.
    pub fingerprint_pending: bool,
    /// Paired remote node, if any.
    pub remote: Option<NodeHandle>,
    pub deleted: bool,
    /// Upload deferred until this instant (Nagle window).
    pub nagle_until: Ds,
    /// (size, mtime) at the previous observation, for stability.
    pub last_seen: Option<(u64, i64)>,
    pub upload: Option<TransferId>,
    pub download: Option<TransferId>,
    /// Creation times of recent uploaded versions, for the throttle.
    pub version_times: VecDeque<i64>,
    pub children: BTreeMap<String, LocalNodeId>,
}

impl LocalNode {
    pub fn is_dir(&self) -> bool {
        self.ltype == LocalType::Dir
    }
}

#[derive(Default)]
pub struct LocalTree {
    map: HashMap<LocalNodeId, LocalNode>,
    by_remote: HashMap<NodeHandle, LocalNodeId>,
    next: u64,
}

impl LocalTree {
    pub fn new() -> LocalTree {
        LocalTree::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, id: LocalNodeId) -> Option<&LocalNode> {
        self.map.get(&id)
    }

    pub fn get_mut(&mut self, id: LocalNodeId) -> Option<&mut LocalNode> {
        self.map.get_mut(&id)
    }

    pub fn insert(
        &mut self,
        parent: Option<LocalNodeId>,
        name: &str,
        ltype: LocalType,
    ) -> LocalNodeId {
        self.next += 1;
        let id = LocalNodeId(self.next);
        self.map.insert(
            id,
            LocalNode {
                id,
                parent,
                name: name.to_string(),
                ltype,
                size: 0,
                mtime: 0,
                fingerprint: None,
                fingerprint_pending: false,
                remote: None,
                deleted: false,
                nagle_until: 0,
                last_seen: None,
                upload: None,
                download: None,
                version_times: VecDeque::new(),
                children: BTreeMap::new(),
            },
        );
        if let Some(parent) = parent
            && let Some(p) = self.map.get_mut(&parent)
        {
            p.children.insert(name.to_string(), id);
        }
        id
    }

    pub fn child(&self, parent: LocalNodeId, name: &str) -> Option<LocalNodeId> {
        self.map.get(&parent)?.children.get(name).copied()
    }

    pub fn children(&self, parent: LocalNodeId) -> Vec<LocalNodeId> {
        self.map
            .get(&parent)
            .map(|n| n.children.values().copied().collect())
            .unwrap_or_default()
    }

    /// Binds both sides of a local↔remote pairing.
    pub fn pair(&mut self, id: LocalNodeId, remote: NodeHandle) {
        if let Some(node) = self.map.get_mut(&id) {
            if let Some(old) = node.remote.take() {
                self.by_remote.remove(&old);
            }
            node.remote = Some(remote);
            self.by_remote.insert(remote, id);
        }
    }

    pub fn unpair(&mut self, id: LocalNodeId) {
        if let Some(node) = self.map.get_mut(&id)
            && let Some(remote) = node.remote.take()
        {
            self.by_remote.remove(&remote);
        }
    }

    pub fn by_remote(&self, remote: NodeHandle) -> Option<LocalNodeId> {
        self.by_remote.get(&remote).copied()
    }

    /// Moves a node under a new parent with a (possibly) new name.
    pub fn reparent(&mut self, id: LocalNodeId, new_parent: LocalNodeId, new_name: &str) {
        let Some(node) = self.map.get(&id) else {
            return;
        };
        let old_parent = node.parent;
        let old_name = node.name.clone();
        if let Some(old_parent) = old_parent
            && let Some(p) = self.map.get_mut(&old_parent)
        {
            p.children.remove(&old_name);
        }
        if let Some(node) = self.map.get_mut(&id) {
            node.parent = Some(new_parent);
            node.name = new_name.to_string();
        }
        if let Some(p) = self.map.get_mut(&new_parent) {
            p.children.insert(new_name.to_string(), id);
        }
    }

    /// Removes a node and all descendants, dissolving remote pairings.
    pub fn remove_subtree(&mut self, id: LocalNodeId) {
        let mut stack = vec![id];
        let mut doomed = Vec::new();
        while let Some(current) = stack.pop() {
            doomed.push(current);
            if let Some(node) = self.map.get(&current) {
                stack.extend(node.children.values().copied());
            }
        }
        if let Some(node) = self.map.get(&id)
            && let Some(parent) = node.parent
        {
            let name = node.name.clone();
            if let Some(p) = self.map.get_mut(&parent) {
                p.children.remove(&name);
            }
        }
        for id in doomed {
            if let Some(node) = self.map.remove(&id)
                && let Some(remote) = node.remote
            {
                self.by_remote.remove(&remote);
            }
        }
    }

    /// Filesystem path of a node below the sync root.
    pub fn path_of(&self, root_path: &Path, id: LocalNodeId) -> PathBuf {
        let mut parts = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let Some(node) = self.map.get(&current) else {
                break;
            };
            if node.parent.is_some() {
                parts.push(node.name.clone());
            }
            cursor = node.parent;
        }
        let mut path = root_path.to_path_buf();
        for part in parts.iter().rev() {
            path.push(part);
        }
        path
    }

    /// Resolves a filesystem path to a node, if tracked.
    pub fn by_path(&self, root: LocalNodeId, root_path: &Path, path: &Path) -> Option<LocalNodeId> {
        let rel = path.strip_prefix(root_path).ok()?;
        let mut cursor = root;
        for component in rel.components() {
            let name = component.as_os_str().to_string_lossy();
            cursor = self.child(cursor, &name)?;
        }
        Some(cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_paths() {
        let mut tree = LocalTree::new();
        let root = tree.insert(None, "", LocalType::Dir);
        let sub = tree.insert(Some(root), "docs", LocalType::Dir);
        let file = tree.insert(Some(sub), "a.txt", LocalType::File);

        let root_path = Path::new("/home/u/sync");
        assert_eq!(
            tree.path_of(root_path, file),
            PathBuf::from("/home/u/sync/docs/a.txt")
        );
        assert_eq!(
            tree.by_path(root, root_path, &PathBuf::from("/home/u/sync/docs/a.txt")),
            Some(file)
        );
        assert_eq!(tree.child(root, "docs"), Some(sub));
    }

    #[test]
    fn test_pairing_reverse_index() {
        let mut tree = LocalTree::new();
        let root = tree.insert(None, "", LocalType::Dir);
        let file = tree.insert(Some(root), "f", LocalType::File);
        let remote = NodeHandle::from_raw(7);

        tree.pair(file, remote);
        assert_eq!(tree.by_remote(remote), Some(file));
        tree.unpair(file);
        assert_eq!(tree.by_remote(remote), None);
        assert_eq!(tree.get(file).unwrap().remote, None);
    }

    #[test]
    fn test_remove_subtree_clears_pairings() {
        let mut tree = LocalTree::new();
        let root = tree.insert(None, "", LocalType::Dir);
        let sub = tree.insert(Some(root), "d", LocalType::Dir);
        let file = tree.insert(Some(sub), "f", LocalType::File);
        tree.pair(file, NodeHandle::from_raw(9));

        tree.remove_subtree(sub);
        assert!(tree.get(sub).is_none());
        assert!(tree.get(file).is_none());
        assert_eq!(tree.by_remote(NodeHandle::from_raw(9)), None);
        assert!(tree.children(root).is_empty());
    }

    #[test]
    fn test_reparent() {
        let mut tree = LocalTree::new();
        let root = tree.insert(None, "", LocalType::Dir);
        let a = tree.insert(Some(root), "a", LocalType::Dir);
        let b = tree.insert(Some(root), "b", LocalType::Dir);
        let file = tree.insert(Some(a), "f", LocalType::File);

        tree.reparent(file, b, "g");
        assert_eq!(tree.child(a, "f"), None);
        assert_eq!(tree.child(b, "g"), Some(file));
        assert_eq!(
            tree.path_of(Path::new("/r"), file),
            PathBuf::from("/r/b/g")
        );
    }
}
