//! `syncdown` and `syncup`: the two reconciliation passes.
//!
//! Both passes plan first over an immutable view, then apply the
//! resulting actions, so a decision made early in a recursion never
//! observes half-applied state from the same tick. Deletions are not
//! applied here at all: they queue onto the deferred lists and execute
//! after both passes, which is what lets a delete+create pair resolve as
//! a rename.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use mega_core::{Ds, NodeHandle, SyncError};

use crate::client::MegaClient;
use crate::commands::{Command, PutNodesSource};
use crate::consts::{RECENT_VERSION_INTERVAL_SECS, RECENT_VERSION_LIMIT};
use crate::nodes::NodeType;
use crate::sync::{LocalNodeId, Sync, SyncMode, anomaly};

/// Seconds a next version must wait once the recent-version count
/// exceeds the limit: `7 · (v/10) · (v−10)`.
pub fn version_throttle_delay_secs(recent: u64) -> i64 {
    if recent <= RECENT_VERSION_LIMIT {
        return 0;
    }
    let v = recent as f64;
    (7.0 * (v / 10.0) * (v - 10.0)) as i64
}

enum Action {
    Pair {
        local: LocalNodeId,
        remote: NodeHandle,
    },
    Detach {
        local: LocalNodeId,
    },
    Download {
        remote: NodeHandle,
        path: PathBuf,
    },
    MkdirLocal {
        remote: NodeHandle,
        parent: LocalNodeId,
        name: String,
        path: PathBuf,
    },
    MoveLocal {
        local: LocalNodeId,
        new_parent: LocalNodeId,
        name: String,
        from: PathBuf,
        to: PathBuf,
    },
    MoveToLocalDebris {
        local: LocalNodeId,
        path: PathBuf,
    },
    DebrisRemote {
        remote: NodeHandle,
    },
    UnlinkLocalNode {
        local: LocalNodeId,
    },
    Upload {
        local: LocalNodeId,
        path: PathBuf,
        parent_remote: NodeHandle,
        over: NodeHandle,
    },
    CreateRemoteDir {
        local: LocalNodeId,
        parent_remote: NodeHandle,
        name: String,
    },
    Anomaly {
        kind: crate::app::FileNameAnomaly,
        remote_name: String,
    },
    Fail {
        err: SyncError,
    },
}

impl MegaClient {
    /// Remote→local reconciliation for one sync. Gated until the initial
    /// scan finishes, so half-seen local trees never look like deletions.
    pub(crate) fn syncdown(&mut self, idx: usize) {
        let Some(sync) = self.syncs.get(idx) else {
            return;
        };
        if !sync.syncs_up() {
            return;
        }
        let mut actions = Vec::new();
        let root_path = sync.config.local_root.clone();
        self.plan_syncdown(
            sync,
            sync.root_local,
            sync.config.remote_root,
            &root_path,
            &mut actions,
        );
        self.apply_actions(idx, actions);
    }

    /// Direct children of a remote folder by name; on a name clash the
    /// newest (then largest) wins, the rest are shadowed.
    fn remote_children_by_name(&self, remote: NodeHandle) -> HashMap<String, NodeHandle> {
        let mut out: HashMap<String, NodeHandle> = HashMap::new();
        for child in self.nodes.children_of(remote) {
            let Some(node) = self.nodes.get(child) else {
                continue;
            };
            // A file child of a file is a previous version, not a child.
            if !node.has_key() && node.attrs.is_empty() {
                continue;
            }
            let name = node.name().to_string();
            match out.get(&name) {
                Some(existing) => {
                    let e = self.nodes.get(*existing).expect("indexed");
                    if (node.ctime, node.size) > (e.ctime, e.size) {
                        out.insert(name, child);
                    }
                }
                None => {
                    out.insert(name, child);
                }
            }
        }
        out
    }

    fn plan_syncdown(
        &self,
        sync: &Sync,
        local: LocalNodeId,
        remote: NodeHandle,
        path: &Path,
        actions: &mut Vec<Action>,
    ) {
        let mode = sync.config.mode;
        let mut remote_children = self.remote_children_by_name(remote);

        for child_id in sync.tree.children(local) {
            let Some(lnode) = sync.tree.get(child_id) else {
                continue;
            };
            let child_path = path.join(&lnode.name);

            match remote_children.remove(&lnode.name) {
                Some(rh) => {
                    let Some(rnode) = self.nodes.get(rh) else {
                        continue;
                    };
                    if lnode.deleted {
                        // Local deletion: syncup owns the remote side.
                        continue;
                    }
                    let remote_is_dir = rnode.ntype != NodeType::File;
                    if lnode.is_dir() != remote_is_dir {
                        tracing::warn!(
                            "type clash at {}: local {:?} vs remote {:?}",
                            child_path.display(),
                            lnode.ltype,
                            rnode.ntype
                        );
                        match mode {
                            SyncMode::BackupMirror => actions.push(Action::DebrisRemote { remote: rh }),
                            SyncMode::BackupMonitor => actions.push(Action::Fail {
                                err: SyncError::BackupModified,
                            }),
                            SyncMode::TwoWay => {}
                        }
                        actions.push(Action::Detach { local: child_id });
                        continue;
                    }
                    if remote_is_dir {
                        actions.push(Action::Pair {
                            local: child_id,
                            remote: rh,
                        });
                        self.plan_syncdown(sync, child_id, rh, &child_path, actions);
                        continue;
                    }
                    // Both files.
                    let Some(rfp) = rnode.fingerprint else {
                        continue; // no-key node, nothing to compare yet
                    };
                    match lnode.fingerprint {
                        Some(lfp) if lfp == rfp => {
                            actions.push(Action::Pair {
                                local: child_id,
                                remote: rh,
                            });
                        }
                        Some(lfp) if lfp.mtime > rfp.mtime => {
                            // Local newer: syncup's direction.
                        }
                        Some(_) | None => match mode {
                            SyncMode::TwoWay => {
                                if lnode.download.is_none() {
                                    actions.push(Action::Download {
                                        remote: rh,
                                        path: child_path,
                                    });
                                }
                            }
                            SyncMode::BackupMirror => {
                                actions.push(Action::DebrisRemote { remote: rh })
                            }
                            SyncMode::BackupMonitor => actions.push(Action::Fail {
                                err: SyncError::BackupModified,
                            }),
                        },
                    }
                }
                None => {
                    // Remote counterpart vanished entirely: propagate the
                    // deletion locally if the pairing says there was one.
                    if let Some(rh) = lnode.remote
                        && !lnode.deleted
                        && self.nodes.get(rh).is_none()
                    {
                        let still_matches = lnode.fingerprint.is_some();
                        if still_matches {
                            actions.push(Action::MoveToLocalDebris {
                                local: child_id,
                                path: child_path,
                            });
                        } else {
                            // Content changed while the remote vanished:
                            // keep the file, detach, let syncup reupload.
                            actions.push(Action::Detach { local: child_id });
                        }
                    }
                }
            }
        }

        // Remote children with no local counterpart.
        for (name, rh) in remote_children {
            let Some(rnode) = self.nodes.get(rh) else {
                continue;
            };
            if let Some(existing) = sync.tree.by_remote(rh) {
                // Known node paired elsewhere: a remote move; mirror it
                // as a local rename instead of delete+download.
                let from = sync.tree.path_of(&sync.config.local_root, existing);
                let to = path.join(anomaly::local_form(&name));
                actions.push(Action::MoveLocal {
                    local: existing,
                    new_parent: local,
                    name: anomaly::local_form(&name),
                    from,
                    to,
                });
                continue;
            }

            match sync.config.mode {
                SyncMode::BackupMirror => {
                    // Local is the truth; surplus remote entries go to
                    // the debris bin.
                    actions.push(Action::DebrisRemote { remote: rh });
                    continue;
                }
                SyncMode::BackupMonitor => {
                    actions.push(Action::Fail {
                        err: SyncError::BackupModified,
                    });
                    continue;
                }
                SyncMode::TwoWay => {}
            }

            let local_name = anomaly::local_form(&name);
            if let Some(kind) = anomaly::detect(&name, &local_name) {
                actions.push(Action::Anomaly {
                    kind,
                    remote_name: name.clone(),
                });
            }
            let child_path = path.join(&local_name);
            if rnode.ntype == NodeType::File {
                actions.push(Action::Download {
                    remote: rh,
                    path: child_path,
                });
            } else {
                actions.push(Action::MkdirLocal {
                    remote: rh,
                    parent: local,
                    name: local_name,
                    path: child_path,
                });
            }
        }
    }

    /// Local→remote reconciliation for one sync.
    pub(crate) fn syncup(&mut self, idx: usize, now: Ds) {
        let Some(sync) = self.syncs.get(idx) else {
            return;
        };
        if !sync.syncs_up() {
            return;
        }
        let mut actions = Vec::new();
        self.plan_syncup(
            sync,
            sync.root_local,
            sync.config.remote_root,
            &sync.config.local_root.clone(),
            now,
            &mut actions,
        );
        self.apply_actions(idx, actions);
    }

    fn plan_syncup(
        &self,
        sync: &Sync,
        local: LocalNodeId,
        remote: NodeHandle,
        path: &Path,
        now: Ds,
        actions: &mut Vec<Action>,
    ) {
        let remote_children = self.remote_children_by_name(remote);
        let now_secs = chrono::Utc::now().timestamp();

        for child_id in sync.tree.children(local) {
            let Some(lnode) = sync.tree.get(child_id) else {
                continue;
            };
            let child_path = path.join(&lnode.name);

            if lnode.deleted {
                // Local deletion: paired remote goes to the debris bin,
                // and the LocalNode dissolves once queued.
                if let Some(rh) = lnode.remote
                    && self.nodes.contains(rh)
                {
                    actions.push(Action::DebrisRemote { remote: rh });
                }
                actions.push(Action::UnlinkLocalNode { local: child_id });
                continue;
            }

            match remote_children.get(&lnode.name).copied() {
                Some(rh) => {
                    let Some(rnode) = self.nodes.get(rh) else {
                        continue;
                    };
                    if lnode.is_dir() && rnode.ntype != NodeType::File {
                        self.plan_syncup(sync, child_id, rh, &child_path, now, actions);
                        continue;
                    }
                    if lnode.is_dir() || rnode.ntype != NodeType::File {
                        continue; // type clash is syncdown's call
                    }
                    let (Some(lfp), Some(rfp)) = (lnode.fingerprint, rnode.fingerprint) else {
                        continue;
                    };
                    if lfp == rfp || lfp.mtime <= rfp.mtime {
                        continue;
                    }
                    // Local is newer: upload a new version, Nagle-gated
                    // and throttled when versions storm.
                    if lnode.upload.is_some() || now < lnode.nagle_until {
                        continue;
                    }
                    let recent = self.recent_version_count(rh, now_secs);
                    if recent > RECENT_VERSION_LIMIT {
                        let delay = version_throttle_delay_secs(recent);
                        if now_secs < rnode.ctime + delay {
                            tracing::debug!(
                                "throttling version storm at {} ({recent} recent)",
                                child_path.display()
                            );
                            continue;
                        }
                    }
                    actions.push(Action::Upload {
                        local: child_id,
                        path: child_path,
                        parent_remote: remote,
                        over: rh,
                    });
                }
                None => {
                    if lnode.is_dir() {
                        if lnode.remote.is_none() {
                            actions.push(Action::CreateRemoteDir {
                                local: child_id,
                                parent_remote: remote,
                                name: lnode.name.clone(),
                            });
                        } else if let Some(rh) = lnode.remote
                            && self.nodes.contains(rh)
                        {
                            self.plan_syncup(sync, child_id, rh, &child_path, now, actions);
                        }
                    } else {
                        // New local file: upload once stable for the
                        // Nagle window with a computed fingerprint.
                        if lnode.upload.is_some()
                            || lnode.fingerprint.is_none()
                            || now < lnode.nagle_until
                        {
                            continue;
                        }
                        actions.push(Action::Upload {
                            local: child_id,
                            path: child_path,
                            parent_remote: remote,
                            over: NodeHandle::UNDEF,
                        });
                    }
                }
            }
        }
    }

    /// Versions of a file node created within the recent window: the
    /// version chain hangs below the current node, newest first.
    fn recent_version_count(&self, file: NodeHandle, now_secs: i64) -> u64 {
        let mut count = 0;
        let mut cursor = Some(file);
        while let Some(current) = cursor {
            let Some(node) = self.nodes.get(current) else {
                break;
            };
            if now_secs - node.ctime <= RECENT_VERSION_INTERVAL_SECS {
                count += 1;
            }
            cursor = self
                .nodes
                .children_of(current)
                .find(|c| self.nodes.get(*c).is_some_and(|n| n.ntype == NodeType::File));
        }
        count
    }

    fn apply_actions(&mut self, idx: usize, actions: Vec<Action>) {
        let sync_id = self.syncs[idx].config.id;
        for action in actions {
            match action {
                Action::Pair { local, remote } => {
                    self.syncs[idx].tree.pair(local, remote);
                }
                Action::Detach { local } => {
                    self.syncs[idx].tree.unpair(local);
                }
                Action::Download { remote, path } => {
                    match self.start_download(remote, path.clone(), Some(sync_id), 0) {
                        Ok(tid) => {
                            let sync = &mut self.syncs[idx];
                            if let Some(id) = sync.tree.by_path(
                                sync.root_local,
                                &sync.config.local_root.clone(),
                                &path,
                            ) && let Some(node) = sync.tree.get_mut(id)
                            {
                                node.download = Some(tid);
                            }
                        }
                        Err(err) => {
                            tracing::debug!("sync download failed to queue: {err}");
                            let now = self.now_ds();
                            self.syncs[idx].syncdown_bt.backoff_for(now, 50);
                        }
                    }
                }
                Action::MkdirLocal {
                    remote,
                    parent,
                    name,
                    path,
                } => {
                    if let Err(err) = self.fsaccess.mkdir(&path) {
                        // Transient local trouble: retry on the timer.
                        tracing::debug!("local mkdir failed: {err}");
                        let now = self.now_ds();
                        self.syncs[idx].syncdown_bt.backoff_for(now, 50);
                        continue;
                    }
                    let sync = &mut self.syncs[idx];
                    let id = sync
                        .tree
                        .child(parent, &name)
                        .unwrap_or_else(|| sync.tree.insert(Some(parent), &name, super::LocalType::Dir));
                    sync.tree.pair(id, remote);
                    sync.scan_q.push_back((id, path));
                }
                Action::MoveLocal {
                    local,
                    new_parent,
                    name,
                    from,
                    to,
                } => {
                    if let Err(err) = self.fsaccess.rename(&from, &to) {
                        tracing::debug!("local move failed: {err}");
                        let now = self.now_ds();
                        self.syncs[idx].syncdown_bt.backoff_for(now, 50);
                        continue;
                    }
                    self.syncs[idx].tree.reparent(local, new_parent, &name);
                }
                Action::MoveToLocalDebris { local, path } => {
                    self.move_to_local_debris(idx, &path);
                    self.syncs[idx].tree.remove_subtree(local);
                }
                Action::DebrisRemote { remote } => {
                    if !self.to_debris.contains(&remote) {
                        self.to_debris.push(remote);
                    }
                }
                Action::UnlinkLocalNode { local } => {
                    self.syncs[idx].tree.remove_subtree(local);
                }
                Action::Upload {
                    local,
                    path,
                    parent_remote,
                    over,
                } => {
                    match self.start_upload(path, parent_remote, over, Some(sync_id), 0) {
                        Ok(tid) => {
                            if let Some(node) = self.syncs[idx].tree.get_mut(local) {
                                node.upload = Some(tid);
                            }
                        }
                        Err(err) => {
                            tracing::debug!("sync upload failed to queue: {err}");
                        }
                    }
                }
                Action::CreateRemoteDir {
                    local,
                    parent_remote,
                    name,
                } => {
                    self.sync_create_remote_dir(sync_id, local, parent_remote, &name);
                }
                Action::Anomaly { kind, remote_name } => {
                    self.app.filename_anomaly(kind, &remote_name);
                }
                Action::Fail { err } => {
                    self.fail_sync(idx, err);
                    return;
                }
            }
        }
    }

    /// Creates a remote folder for a local directory; the completion
    /// pairs the fresh handle back to the LocalNode.
    fn sync_create_remote_dir(
        &mut self,
        sync: crate::sync::SyncId,
        local: LocalNodeId,
        parent: NodeHandle,
        name: &str,
    ) {
        let Some(master) = self.session.master_key.clone() else {
            return;
        };
        // Folder key is fresh; attributes carry the name.
        let mut key = [0u8; 16];
        rand::RngCore::fill_bytes(&mut self.rng, &mut key);
        let cipher = mega_core::crypto::SymmCipher::new(key);
        let attrs = mega_core::attrs::name_attrs(name, None);
        let blob = mega_core::attrs::encrypt_attrs(&attrs, &cipher);
        let mut wrapped = key.to_vec();
        master.ecb_encrypt(&mut wrapped);

        let node = serde_json::json!([{
            "h": "xxxxxxxx",
            "t": 1,
            "a": mega_core::b64::encode(&blob),
            "k": mega_core::b64::encode(&wrapped),
        }]);
        // Mark the LocalNode so we do not create the folder twice while
        // the command is in flight.
        let Some(sync_ref) = self.syncs.iter_mut().find(|s| s.config.id == sync) else {
            return;
        };
        if let Some(lnode) = sync_ref.tree.get_mut(local) {
            lnode.remote = Some(NodeHandle::UNDEF);
        }
        let local_path = sync_ref.tree.path_of(&sync_ref.config.local_root.clone(), local);
        self.queue_command(Command::put_nodes(
            parent,
            node,
            PutNodesSource::SyncFolder {
                sync,
                local_path,
            },
        ));
    }

    /// PutNodes completion for a sync-created folder: bind the handle.
    pub(crate) fn sync_folder_created(
        &mut self,
        sync: crate::sync::SyncId,
        local_path: &Path,
        result: crate::commands::CmdResult,
    ) {
        let Some(idx) = self.syncs.iter().position(|s| s.config.id == sync) else {
            return;
        };
        match result {
            Ok(response) => {
                let read = self.read_nodes(&response);
                let sync_ref = &mut self.syncs[idx];
                if let Some(new_handle) = read.first()
                    && let Some(id) = sync_ref.tree.by_path(
                        sync_ref.root_local,
                        &sync_ref.config.local_root.clone(),
                        local_path,
                    )
                {
                    sync_ref.tree.pair(id, *new_handle);
                }
            }
            Err(err) => {
                tracing::warn!("sync folder creation failed: {err}");
                let sync_ref = &mut self.syncs[idx];
                if let Some(id) = sync_ref.tree.by_path(
                    sync_ref.root_local,
                    &sync_ref.config.local_root.clone(),
                    local_path,
                ) && let Some(node) = sync_ref.tree.get_mut(id)
                {
                    node.remote = None;
                }
                self.fail_sync(idx, SyncError::PutNodesError);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_throttle_formula() {
        assert_eq!(version_throttle_delay_secs(0), 0);
        assert_eq!(version_throttle_delay_secs(10), 0);
        // 7 * (20/10) * (20-10) = 140
        assert_eq!(version_throttle_delay_secs(20), 140);
        // 7 * 1.5 * 5 = 52
        assert_eq!(version_throttle_delay_secs(15), 52);
    }
}
