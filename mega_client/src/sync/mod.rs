//! The bidirectional folder synchronizer.
//!
//! Each configured sync mirrors one remote folder against one local
//! directory: an initial depth-first scan builds the `LocalNode` tree,
//! then every cooperative tick drains filesystem notifications, runs
//! `syncdown` (remote→local) and `syncup` (local→remote), and finally
//! executes the deferred deletion queues so that move patterns are
//! recognized as renames instead of delete+add pairs.

pub mod anomaly;
mod debris;
pub mod local_tree;
mod reconcile;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use rand::Rng;

use mega_core::caps::{DirNotify, FsEntryType};
use mega_core::{BackoffTimer, Ds, FileFingerprint, NodeHandle, SyncError};

use crate::client::MegaClient;
use crate::commands::Command;
use crate::consts::{EXTRA_SCANNING_DELAY_DS, NAGLE_DS, RESCAN_BASE_DELAY_DS};
use crate::nodes::{Access, NodeType};
use crate::workers::JobResult;

pub use local_tree::{LocalNode, LocalNodeId, LocalTree, LocalType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SyncId(pub u64);

/// Two-way sync or one of the backup disciplines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    TwoWay,
    /// The local side is the truth; remote divergence is debris'd.
    BackupMirror,
    /// The remote must never change; any modification trips the backup.
    BackupMonitor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    InitialScan,
    Active,
    Failed,
    Disabled,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub id: SyncId,
    pub local_root: PathBuf,
    pub remote_root: NodeHandle,
    pub mode: SyncMode,
    pub enabled: bool,
    pub last_error: SyncError,
    /// Stable id from the backup monitor registration.
    pub backup_id: Option<u64>,
    /// External drive root for external backups.
    pub external_drive: Option<PathBuf>,
}

pub struct Sync {
    pub config: SyncConfig,
    pub state: SyncState,
    /// Filesystem fingerprint captured at scan time; a mismatch on a
    /// later tick means the volume changed under us.
    pub fsfp: u64,
    pub tree: LocalTree,
    pub root_local: LocalNodeId,
    notify: Box<dyn DirNotify>,
    dir_events: VecDeque<PathBuf>,
    retry_q: VecDeque<PathBuf>,
    extra_q: VecDeque<(PathBuf, Ds)>,
    scan_q: VecDeque<(LocalNodeId, PathBuf)>,
    pub syncdown_bt: BackoffTimer,
    rescan_bt: BackoffTimer,
}

impl Sync {
    pub fn running(&self) -> bool {
        matches!(self.state, SyncState::InitialScan | SyncState::Active)
    }

    /// Scanning is done and reconciliation may act.
    pub fn syncs_up(&self) -> bool {
        self.state == SyncState::Active
    }
}

impl MegaClient {
    /// Configures and admits a new sync.
    pub fn add_sync(
        &mut self,
        local_root: PathBuf,
        remote_root: NodeHandle,
        mode: SyncMode,
        external_drive: Option<PathBuf>,
    ) -> Result<SyncId, SyncError> {
        // 1. Remote root must be a folder (or a tree root).
        let remote = self
            .nodes
            .get(remote_root)
            .ok_or(SyncError::RemoteNodeNotFound)?;
        if !remote.ntype.is_container() || remote.ntype == NodeType::Rubbish {
            return Err(SyncError::InvalidRemoteType);
        }

        // 2. No nesting with another active sync, either direction.
        for sync in &self.syncs {
            if !sync.running() {
                continue;
            }
            if self.nodes.is_ancestor(sync.config.remote_root, remote_root) {
                return Err(SyncError::ActiveSyncAbovePath);
            }
            if self.nodes.is_ancestor(remote_root, sync.config.remote_root) {
                return Err(SyncError::ActiveSyncBelowPath);
            }
            if local_root.starts_with(&sync.config.local_root)
                || sync.config.local_root.starts_with(&local_root)
            {
                return Err(SyncError::ActiveSyncAbovePath);
            }
        }

        // 3. Full access required along the whole in-share chain.
        if self.access_level(remote_root) < Access::Full {
            return Err(SyncError::ShareNonFullAccess);
        }

        // 4. Not under the rubbish root.
        if self.nodes.rubbish.is_set() && self.nodes.is_ancestor(self.nodes.rubbish, remote_root) {
            return Err(SyncError::RemoteNodeInsideRubbish);
        }

        // 5. Local support check and volume fingerprint.
        let root_entry = self
            .fsaccess
            .stat(&local_root)
            .ok()
            .flatten()
            .ok_or(SyncError::LocalPathUnavailable)?;
        if root_entry.etype != FsEntryType::Dir {
            return Err(SyncError::LocalPathUnavailable);
        }
        let fsfp = self
            .fsaccess
            .fs_id(&local_root)
            .map_err(|_| SyncError::UnsupportedFileSystem)?;

        // 6. External backups persist a drive id on the drive itself.
        if let Some(drive) = &external_drive {
            if !local_root.starts_with(drive) {
                return Err(SyncError::LocalPathUnavailable);
            }
            self.ensure_drive_id(drive);
        }

        let notify = self
            .fsaccess
            .notifier(&local_root)
            .map_err(|_| SyncError::UnsupportedFileSystem)?;

        self.next_sync_id += 1;
        let id = SyncId(self.next_sync_id);
        let mut tree = LocalTree::new();
        let root_local = tree.insert(None, "", LocalType::Dir);
        tree.pair(root_local, remote_root);

        let mut scan_q = VecDeque::new();
        scan_q.push_back((root_local, local_root.clone()));

        let config = SyncConfig {
            id,
            local_root: local_root.clone(),
            remote_root,
            mode,
            enabled: true,
            last_error: SyncError::NoError,
            backup_id: None,
            external_drive,
        };

        // 7. Register with the backup monitor for a stable backup id.
        self.queue_command(Command::backup_put(
            id,
            remote_root,
            &local_root.to_string_lossy(),
            mode != SyncMode::TwoWay,
        ));

        self.syncs.push(Sync {
            config,
            state: SyncState::InitialScan,
            fsfp,
            tree,
            root_local,
            notify,
            dir_events: VecDeque::new(),
            retry_q: VecDeque::new(),
            extra_q: VecDeque::new(),
            scan_q,
            syncdown_bt: BackoffTimer::new(),
            rescan_bt: BackoffTimer::new(),
        });
        tracing::info!("sync {id:?} admitted at {}", local_root.display());
        self.loop_requested = true;
        Ok(id)
    }

    /// Writes the drive-id marker if the drive does not carry one yet:
    /// a raw little-endian 64-bit value whose top half is random and
    /// bottom half time-derived, keeping ids unique and monotone.
    fn ensure_drive_id(&mut self, drive: &Path) {
        let marker = drive.join(".megabackup").join("drive-id");
        if self.fsaccess.stat(&marker).ok().flatten().is_some() {
            return;
        }
        let secs = chrono::Utc::now().timestamp() as u64 & 0xffff_ffff;
        let id = (u64::from(self.rng.random::<u32>()) << 32) | secs;
        let _ = self.fsaccess.mkdir(&drive.join(".megabackup"));
        let write = self
            .fsaccess
            .open_write(&marker, true)
            .and_then(|mut f| f.write_at(0, &id.to_le_bytes()));
        if let Err(err) = write {
            tracing::warn!("drive-id write failed: {err}");
        }
    }

    pub(crate) fn backup_put_result(&mut self, id: SyncId, result: crate::commands::CmdResult) {
        if let Ok(response) = result {
            let backup_id = response
                .get("id")
                .and_then(serde_json::Value::as_str)
                .and_then(|s| mega_core::b64::decode(s).ok())
                .map(|raw| {
                    let mut bytes = [0u8; 8];
                    bytes[..raw.len().min(8)].copy_from_slice(&raw[..raw.len().min(8)]);
                    u64::from_le_bytes(bytes)
                });
            if let Some(sync) = self.syncs.iter_mut().find(|s| s.config.id == id) {
                sync.config.backup_id = backup_id;
            }
        }
    }

    pub fn sync_ids(&self) -> Vec<SyncId> {
        self.syncs.iter().map(|s| s.config.id).collect()
    }

    pub fn sync_state(&self, id: SyncId) -> Option<(SyncState, SyncError)> {
        self.syncs
            .iter()
            .find(|s| s.config.id == id)
            .map(|s| (s.state, s.config.last_error))
    }

    pub(crate) fn fail_sync(&mut self, idx: usize, err: SyncError) {
        let Some(sync) = self.syncs.get_mut(idx) else {
            return;
        };
        if sync.state == SyncState::Failed {
            return;
        }
        tracing::warn!("sync {:?} failed: {}", sync.config.id, err.as_str());
        sync.state = SyncState::Failed;
        sync.config.last_error = err;
        let id = sync.config.id;
        self.app.sync_state_changed(id, err);
    }

    pub(crate) fn fail_syncs_below(&mut self, top: NodeHandle, err: SyncError) {
        let doomed: Vec<usize> = self
            .syncs
            .iter()
            .enumerate()
            .filter(|(_, s)| s.running() && self.nodes.is_ancestor(top, s.config.remote_root))
            .map(|(i, _)| i)
            .collect();
        for idx in doomed {
            self.fail_sync(idx, err);
        }
    }

    /// Synchronous suspension of every sync (SC overload, blocking).
    pub(crate) fn suspend_all_syncs(&mut self) {
        for sync in &mut self.syncs {
            if sync.running() {
                sync.state = SyncState::Disabled;
            }
        }
    }

    pub fn remove_sync(&mut self, id: SyncId) {
        self.syncs.retain(|s| s.config.id != id);
    }

    // -- the per-tick drive --

    pub(crate) fn exec_syncs(&mut self) {
        if self.blocked {
            return;
        }
        let now = self.now_ds();

        for idx in 0..self.syncs.len() {
            if !self.syncs[idx].running() {
                continue;
            }
            self.sync_check_volume(idx);
            if !self.syncs[idx].running() {
                continue;
            }
            self.sync_ingress(idx, now);
            self.sync_scan_step(idx, now);
        }

        // Reconciliation: remote→local first (may have been what the SC
        // parser yielded for), then local→remote.
        let run_down = self.syncdown_required || self.syncs.iter().any(|s| s.syncs_up());
        if run_down {
            for idx in 0..self.syncs.len() {
                if self.syncs[idx].syncs_up() || self.syncdown_required {
                    self.syncdown(idx);
                }
            }
            self.syncdown_required = false;
            self.sc.yield_to_sync = false;
        }

        for idx in 0..self.syncs.len() {
            if self.syncs[idx].syncs_up() {
                self.syncup(idx, now);
            }
        }

        // Deferred deletions run after both passes so that moves were
        // given the chance to be recognized as renames.
        self.flush_sync_deletes();
    }

    /// fsfp and availability invariant.
    fn sync_check_volume(&mut self, idx: usize) {
        let (root, fsfp) = {
            let sync = &self.syncs[idx];
            (sync.config.local_root.clone(), sync.fsfp)
        };
        match self.fsaccess.stat(&root) {
            Ok(Some(_)) => match self.fsaccess.fs_id(&root) {
                Ok(current) if current == fsfp => {}
                Ok(_) => self.fail_sync(idx, SyncError::LocalFingerprintMismatch),
                Err(_) => self.fail_sync(idx, SyncError::LocalPathUnavailable),
            },
            _ => self.fail_sync(idx, SyncError::LocalPathUnavailable),
        }
    }

    /// Drains raw notifications into the three queues and schedules
    /// rescans on watcher failure.
    fn sync_ingress(&mut self, idx: usize, now: Ds) {
        let tree_len = self.syncs[idx].tree.len() as u32;
        let sync = &mut self.syncs[idx];
        let events = sync.notify.drain();
        for path in events {
            // Writes that look like part of a rewrite burst coalesce in
            // the EXTRA queue; everything else goes straight in.
            let burst = sync
                .extra_q
                .iter()
                .any(|(p, _)| p.parent() == path.parent());
            if burst {
                sync.extra_q.push_back((path, now + EXTRA_SCANNING_DELAY_DS));
            } else {
                sync.dir_events.push_back(path.clone());
                sync.extra_q.push_back((path, now + EXTRA_SCANNING_DELAY_DS));
            }
        }

        if sync.notify.failed() {
            let delay = RESCAN_BASE_DELAY_DS + tree_len / 128;
            if sync.rescan_bt.next_fire() == mega_core::NEVER {
                tracing::warn!("watcher failed; full rescan in {delay} ds");
                sync.rescan_bt.backoff_for(now, delay);
            }
        }
        if sync.rescan_bt.armed(now) && sync.rescan_bt.next_fire() != mega_core::NEVER {
            sync.rescan_bt.reset();
            let root_local = sync.root_local;
            let root_path = sync.config.local_root.clone();
            sync.scan_q.push_back((root_local, root_path));
        }
    }

    /// Works the scan queue and the notification queues.
    fn sync_scan_step(&mut self, idx: usize, now: Ds) {
        // Initial or rescan traversal, bounded per tick.
        for _ in 0..128 {
            let Some((local_id, path)) = self.syncs[idx].scan_q.pop_front() else {
                break;
            };
            self.scan_entry(idx, local_id, &path, now);
        }

        if self.syncs[idx].scan_q.is_empty() && self.syncs[idx].state == SyncState::InitialScan {
            let id = self.syncs[idx].config.id;
            self.syncs[idx].state = SyncState::Active;
            tracing::info!("sync {id:?} finished initial scan");
            self.app.sync_state_changed(id, SyncError::NoError);
            self.loop_requested = true;
        }

        // Change notifications.
        loop {
            let Some(path) = self.syncs[idx].dir_events.pop_front() else {
                break;
            };
            self.scan_path(idx, &path, now);
        }
        loop {
            let Some(path) = self.syncs[idx].retry_q.pop_front() else {
                break;
            };
            self.scan_path(idx, &path, now);
        }
        // EXTRA entries wait out their coalescing delay.
        loop {
            match self.syncs[idx].extra_q.front() {
                Some((_, due)) if *due <= now => {
                    let (path, _) = self.syncs[idx].extra_q.pop_front().expect("peeked");
                    self.scan_path(idx, &path, now);
                }
                _ => break,
            }
        }
    }

    /// Scans one tree entry: refreshes the LocalNode, enumerates
    /// children for directories, arms Nagle timers for changed files.
    fn scan_entry(&mut self, idx: usize, local_id: LocalNodeId, path: &Path, now: Ds) {
        let entry = match self.fsaccess.stat(path) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::debug!("stat failed during scan: {err}");
                self.syncs[idx].retry_q.push_back(path.to_path_buf());
                return;
            }
        };
        let Some(entry) = entry else {
            if let Some(node) = self.syncs[idx].tree.get_mut(local_id) {
                node.deleted = true;
            }
            return;
        };

        match entry.etype {
            FsEntryType::Dir => {
                let listing = match self.fsaccess.list(path) {
                    Ok(listing) => listing,
                    Err(err) => {
                        tracing::debug!("list failed during scan: {err}");
                        self.syncs[idx].retry_q.push_back(path.to_path_buf());
                        return;
                    }
                };
                let mut seen = std::collections::BTreeSet::new();
                for child in listing {
                    seen.insert(child.name.clone());
                    let ltype = match child.etype {
                        FsEntryType::Dir => LocalType::Dir,
                        FsEntryType::File => LocalType::File,
                    };
                    let child_path = path.join(&child.name);
                    let child_id = {
                        let sync = &mut self.syncs[idx];
                        match sync.tree.child(local_id, &child.name) {
                            Some(id) => id,
                            None => sync.tree.insert(Some(local_id), &child.name, ltype),
                        }
                    };
                    match ltype {
                        LocalType::Dir => {
                            self.syncs[idx].scan_q.push_back((child_id, child_path))
                        }
                        LocalType::File => {
                            self.scan_file(idx, child_id, &child_path, child.size, child.mtime, now)
                        }
                    }
                }
                // Entries gone from disk are marked; deletion executes
                // deferred so moves can still be matched up.
                let sync = &mut self.syncs[idx];
                for child_id in sync.tree.children(local_id) {
                    if let Some(node) = sync.tree.get_mut(child_id)
                        && !seen.contains(&node.name)
                    {
                        node.deleted = true;
                    }
                }
            }
            FsEntryType::File => {
                self.scan_file(idx, local_id, path, entry.size, entry.mtime, now);
            }
        }
    }

    /// Refreshes a file node: Nagle window arming plus fingerprinting,
    /// with big files handed to the worker pool.
    fn scan_file(
        &mut self,
        idx: usize,
        local_id: LocalNodeId,
        path: &Path,
        size: u64,
        mtime: i64,
        now: Ds,
    ) {
        const WORKER_THRESHOLD: u64 = 8 * 1024 * 1024;
        let sync_id = self.syncs[idx].config.id;
        let needs_fp = {
            let Some(node) = self.syncs[idx].tree.get_mut(local_id) else {
                return;
            };
            node.deleted = false;
            let changed = node.last_seen != Some((size, mtime));
            node.size = size;
            node.mtime = mtime;
            if changed {
                // Unstable content: push the upload horizon out.
                node.last_seen = Some((size, mtime));
                node.nagle_until = now + NAGLE_DS;
                node.fingerprint = None;
            }
            node.fingerprint.is_none() && !node.fingerprint_pending
        };
        if !needs_fp {
            return;
        }

        if size > WORKER_THRESHOLD {
            if let Some(node) = self.syncs[idx].tree.get_mut(local_id) {
                node.fingerprint_pending = true;
            }
            // The worker opens its own handle; results drain at the top
            // of exec().
            let fs = self.fsaccess.clone();
            let path = path.to_path_buf();
            self.workers.submit(move || {
                let result = fs.open_read(&path).and_then(|mut f| {
                    FileFingerprint::generate(size, mtime, |pos, buf| f.read_at(pos, buf))
                });
                JobResult::Fingerprint {
                    sync: sync_id,
                    local: local_id,
                    path,
                    result,
                }
            });
        } else {
            let fp = self
                .fsaccess
                .open_read(path)
                .and_then(|mut f| {
                    FileFingerprint::generate(size, mtime, |pos, buf| f.read_at(pos, buf))
                })
                .ok();
            if let Some(node) = self.syncs[idx].tree.get_mut(local_id) {
                node.fingerprint = fp;
            }
        }
    }

    /// Routes a notification path to the owning LocalNode (or nearest
    /// tracked ancestor) and rescans it.
    fn scan_path(&mut self, idx: usize, path: &Path, now: Ds) {
        let (root_local, root_path) = {
            let sync = &self.syncs[idx];
            (sync.root_local, sync.config.local_root.clone())
        };
        let mut target = path.to_path_buf();
        loop {
            if let Some(id) = self.syncs[idx]
                .tree
                .by_path(root_local, &root_path, &target)
            {
                self.scan_entry(idx, id, &target, now);
                return;
            }
            match target.parent() {
                Some(parent) if parent.starts_with(&root_path) => target = parent.to_path_buf(),
                _ => {
                    self.scan_entry(idx, root_local, &root_path, now);
                    return;
                }
            }
        }
    }

    /// Worker-pool fingerprint results, drained at the top of exec().
    pub(crate) fn apply_worker_results(&mut self) {
        for result in self.workers.drain() {
            match result {
                JobResult::Fingerprint {
                    sync,
                    local,
                    path,
                    result,
                } => {
                    let Some(s) = self.syncs.iter_mut().find(|s| s.config.id == sync) else {
                        continue;
                    };
                    let Some(node) = s.tree.get_mut(local) else {
                        continue;
                    };
                    node.fingerprint_pending = false;
                    match result {
                        Ok(fp) => node.fingerprint = Some(fp),
                        Err(err) => {
                            tracing::debug!("fingerprint of {} failed: {err}", path.display());
                        }
                    }
                }
            }
        }
    }

    /// A sync-bound upload finished: pair the local node to the fresh
    /// handle and record the version time for the storm throttle.
    pub(crate) fn sync_upload_finished(
        &mut self,
        sync: SyncId,
        local_path: &Path,
        remote: NodeHandle,
    ) {
        let Some(idx) = self.syncs.iter().position(|s| s.config.id == sync) else {
            return;
        };
        let sync_ref = &mut self.syncs[idx];
        if let Some(id) = sync_ref.tree.by_path(
            sync_ref.root_local,
            &sync_ref.config.local_root.clone(),
            local_path,
        ) {
            if remote.is_set() {
                sync_ref.tree.pair(id, remote);
            }
            if let Some(node) = sync_ref.tree.get_mut(id) {
                node.upload = None;
                node.version_times
                    .push_back(chrono::Utc::now().timestamp());
                while node.version_times.len() > 32 {
                    node.version_times.pop_front();
                }
            }
        }
    }

    /// A sync-bound download finished: pair the local file.
    pub(crate) fn sync_download_finished(
        &mut self,
        sync: SyncId,
        local_path: &Path,
        remote: NodeHandle,
    ) {
        let now = self.now_ds();
        let Some(idx) = self.syncs.iter().position(|s| s.config.id == sync) else {
            return;
        };
        self.scan_path(idx, local_path, now);
        let sync = &mut self.syncs[idx];
        if let Some(id) = sync.tree.by_path(
            sync.root_local,
            &sync.config.local_root.clone(),
            local_path,
        ) {
            sync.tree.pair(id, remote);
            if let Some(node) = sync.tree.get_mut(id) {
                node.download = None;
            }
        }
    }
}
