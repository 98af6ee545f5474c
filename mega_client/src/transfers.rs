//! The transfer engine: direction-indexed queues of uploads and
//! downloads, a bounded slot pool, resumable progress via chunk-MAC
//! tables, and the overquota/pause machinery.
//!
//! Dispatch runs four pipelines — (PUT, large), (GET, large),
//! (PUT, small), (GET, small) — and keeps each fed with enough queued
//! bytes to cover a speed-scaled lookahead window, without ever crossing
//! the global and per-direction slot caps.

use std::collections::HashMap;
use std::path::PathBuf;

use mega_core::caps::GfxSize;
use mega_core::chunk::ChunkMacMap;
use mega_core::crypto::FileKey;
use mega_core::{ApiError, BackoffTimer, Ds, FileFingerprint, NodeHandle};

use crate::client::MegaClient;
use crate::commands::Command;
use crate::consts::{
    DEFAULT_BW_OVERQUOTA_BACKOFF_SECS, DOMINANT_FILE_REMAINDER, LARGE_FILE_THRESHOLD,
    MAX_NEW_STARTS_PER_TICK, MAX_PIPELINE_LOOKAHEAD, MAX_QUEUED_FA, MAX_TOTAL_TRANSFERS,
    MAX_TRANSFERS, MIN_PIPELINE_LOOKAHEAD, PIPELINE_LOOKAHEAD_SECS,
};
use crate::fileattr::FaOwner;
use crate::sync::SyncId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Get,
    Put,
}

impl Direction {
    pub fn idx(&self) -> usize {
        match self {
            Direction::Get => 0,
            Direction::Put => 1,
        }
    }

    pub fn code(&self) -> u8 {
        self.idx() as u8
    }

    pub fn from_code(code: u8) -> Option<Direction> {
        match code {
            0 => Some(Direction::Get),
            1 => Some(Direction::Put),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Queued,
    Active,
    Paused,
    Retrying,
    Completing,
    Completed,
    Cancelled,
    Failed,
}

/// One source/destination binding of a transfer. Several files can share
/// one transfer when their fingerprints match.
#[derive(Debug, Clone)]
pub struct FileTarget {
    pub name: String,
    pub local_path: PathBuf,
    /// GET: source node. PUT: target parent folder.
    pub remote: NodeHandle,
    /// PUT: previous version to overwrite (versioning `ov`).
    pub version_over: NodeHandle,
    pub sync: Option<SyncId>,
    pub tag: u32,
}

#[derive(Debug)]
pub struct Transfer {
    pub id: TransferId,
    pub dir: Direction,
    pub size: u64,
    pub pos: u64,
    pub progress_completed: u64,
    pub fingerprint: Option<FileFingerprint>,
    pub key: Option<FileKey>,
    pub chunk_macs: ChunkMacMap,
    pub files: Vec<FileTarget>,
    pub state: TransferState,
    pub bt: BackoffTimer,
    pub slot: Option<u64>,
    /// Download staging / upload source path.
    pub temp_path: PathBuf,
    /// Fingerprint of the partial temp file when the transfer was cached.
    pub temp_fp: Option<FileFingerprint>,
    pub temp_urls: Vec<String>,
    pub url_requested: bool,
    pub upload_token: Option<String>,
    /// File-attribute uploads that must finish before PutNodes.
    pub minfa: u32,
    pub fa_handles: Vec<(u32, String)>,
    /// PUT source metadata at queue time, rechecked at start.
    pub src_mtime: i64,
    pub src_size: u64,
    /// Client-minted handle identifying the upload before the server
    /// assigns a node handle.
    pub upload_handle: mega_core::UploadHandle,
    pub tag: u32,
}

impl Transfer {
    fn new(id: TransferId, dir: Direction, size: u64) -> Transfer {
        Transfer {
            id,
            dir,
            size,
            pos: 0,
            progress_completed: 0,
            fingerprint: None,
            key: None,
            chunk_macs: ChunkMacMap::new(),
            files: Vec::new(),
            state: TransferState::Queued,
            bt: BackoffTimer::new(),
            slot: None,
            temp_path: PathBuf::new(),
            temp_fp: None,
            temp_urls: Vec::new(),
            url_requested: false,
            upload_token: None,
            minfa: 0,
            fa_handles: Vec::new(),
            src_mtime: 0,
            src_size: 0,
            upload_handle: mega_core::UploadHandle::default(),
            tag: 0,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.size.saturating_sub(self.progress_completed)
    }

    pub fn is_large(&self) -> bool {
        self.size > LARGE_FILE_THRESHOLD
    }

    /// All FA uploads that gate node creation have completed.
    pub fn fa_complete(&self) -> bool {
        self.fa_handles.len() as u32 >= self.minfa
    }
}

/// Direction-indexed transfer queues with a fingerprint lookup so
/// identical content joins an existing transfer instead of re-running.
#[derive(Default)]
pub struct TransferQueues {
    next_id: u64,
    transfers: HashMap<TransferId, Transfer>,
    order: [Vec<TransferId>; 2],
    by_content: HashMap<(usize, u64, [u32; 4]), TransferId>,
    pub paused: [bool; 2],
}

impl TransferQueues {
    pub fn new() -> TransferQueues {
        TransferQueues::default()
    }

    pub fn get(&self, id: TransferId) -> Option<&Transfer> {
        self.transfers.get(&id)
    }

    pub fn get_mut(&mut self, id: TransferId) -> Option<&mut Transfer> {
        self.transfers.get_mut(&id)
    }

    pub fn ids(&self, dir: Direction) -> Vec<TransferId> {
        self.order[dir.idx()].clone()
    }

    pub fn all_ids(&self) -> Vec<TransferId> {
        self.transfers.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    fn insert(&mut self, transfer: Transfer) -> TransferId {
        let id = transfer.id;
        if let Some(fp) = &transfer.fingerprint {
            self.by_content
                .insert((transfer.dir.idx(), fp.size, fp.crc), id);
        }
        self.order[transfer.dir.idx()].push(id);
        self.transfers.insert(id, transfer);
        id
    }

    pub fn lookup_content(&self, dir: Direction, fp: &FileFingerprint) -> Option<TransferId> {
        self.by_content.get(&(dir.idx(), fp.size, fp.crc)).copied()
    }

    pub fn remove(&mut self, id: TransferId) -> Option<Transfer> {
        let transfer = self.transfers.remove(&id)?;
        self.order[transfer.dir.idx()].retain(|t| *t != id);
        if let Some(fp) = &transfer.fingerprint {
            self.by_content.remove(&(transfer.dir.idx(), fp.size, fp.crc));
        }
        Some(transfer)
    }

    fn allocate(&mut self, dir: Direction, size: u64) -> Transfer {
        self.next_id += 1;
        Transfer::new(TransferId(self.next_id), dir, size)
    }
}

impl MegaClient {
    /// Queues a download of `node` into `local_path`. Joins an existing
    /// transfer when the content fingerprint already has one.
    pub fn start_download(
        &mut self,
        node: NodeHandle,
        local_path: PathBuf,
        sync: Option<SyncId>,
        tag: u32,
    ) -> Result<TransferId, ApiError> {
        let remote = self.nodes.get(node).ok_or(ApiError::NotFound)?;
        let size = remote.size;
        let fingerprint = remote.fingerprint;
        let name = remote.name().to_string();

        let target = FileTarget {
            name,
            local_path: local_path.clone(),
            remote: node,
            version_over: NodeHandle::UNDEF,
            sync,
            tag,
        };

        if let Some(fp) = &fingerprint
            && let Some(existing) = self.transfers.lookup_content(Direction::Get, fp)
        {
            let transfer = self.transfers.get_mut(existing).expect("indexed");
            transfer.files.push(target);
            return Ok(existing);
        }

        let mut transfer = self.transfers.allocate(Direction::Get, size);
        transfer.fingerprint = fingerprint;
        transfer.temp_path = staging_path(&local_path);
        transfer.files.push(target);
        transfer.tag = tag;
        let id = self.transfers.insert(transfer);
        self.save_transfer_to_cache(id);
        self.loop_requested = true;
        Ok(id)
    }

    /// Queues an upload of `local_path` under `parent`.
    pub fn start_upload(
        &mut self,
        local_path: PathBuf,
        parent: NodeHandle,
        version_over: NodeHandle,
        sync: Option<SyncId>,
        tag: u32,
    ) -> Result<TransferId, ApiError> {
        let entry = self
            .fsaccess
            .stat(&local_path)
            .ok()
            .flatten()
            .ok_or(ApiError::Read)?;
        let name = entry.name.clone();

        let mut transfer = self.transfers.allocate(Direction::Put, entry.size);
        transfer.upload_handle = self.upload_handles.next();
        transfer.src_mtime = entry.mtime;
        transfer.src_size = entry.size;
        transfer.temp_path = local_path.clone();
        transfer.tag = tag;
        transfer.files.push(FileTarget {
            name,
            local_path,
            remote: parent,
            version_over,
            sync,
            tag,
        });
        let id = self.transfers.insert(transfer);
        self.save_transfer_to_cache(id);
        self.loop_requested = true;
        Ok(id)
    }

    /// Per-direction pause. Soft freezes dispatch; hard also disconnects
    /// the in-flight slots of that direction.
    pub fn pause_transfers(&mut self, dir: Direction, hard: bool) {
        self.transfers.paused[dir.idx()] = true;
        if hard {
            let slot_ids: Vec<u64> = self
                .slots
                .iter()
                .filter(|(_, s)| {
                    self.transfers
                        .get(s.transfer)
                        .is_some_and(|t| t.dir == dir)
                })
                .map(|(id, _)| *id)
                .collect();
            for slot_id in slot_ids {
                self.disconnect_slot(slot_id);
            }
            for id in self.transfers.ids(dir) {
                if let Some(t) = self.transfers.get_mut(id)
                    && t.state == TransferState::Active
                {
                    t.state = TransferState::Paused;
                }
            }
        }
    }

    /// Unpause: re-arm every backoff so the next tick resumes work.
    pub fn resume_transfers(&mut self, dir: Direction) {
        self.transfers.paused[dir.idx()] = false;
        let now = self.now_ds();
        for id in self.transfers.ids(dir) {
            if let Some(t) = self.transfers.get_mut(id) {
                if t.state == TransferState::Paused {
                    t.state = TransferState::Queued;
                }
                t.bt.arm(now);
            }
        }
        self.loop_requested = true;
    }

    /// The dispatch tick: starts queued transfers into slots while the
    /// caps and pipeline lookahead targets allow.
    pub(crate) fn dispatch_transfers(&mut self) {
        if self.blocked {
            return;
        }
        let now = self.now_ds();
        let fa_jammed = self.faqueue.len() > MAX_QUEUED_FA;
        let mut started = [0usize; 2];

        // (direction, large?) in responsiveness order
        let pipelines = [
            (Direction::Put, true),
            (Direction::Get, true),
            (Direction::Put, false),
            (Direction::Get, false),
        ];

        for (dir, large) in pipelines {
            if self.transfers.paused[dir.idx()] {
                continue;
            }
            if dir == Direction::Put && fa_jammed {
                continue;
            }
            // Bandwidth overquota holds the whole download direction, so
            // nothing jumps the queue ahead of the throttled transfer.
            if dir == Direction::Get && now < self.overquota_until {
                continue;
            }
            let speed = self.speeds[dir.idx()].bytes_per_second(now);
            let target = (speed * PIPELINE_LOOKAHEAD_SECS)
                .clamp(MIN_PIPELINE_LOOKAHEAD, MAX_PIPELINE_LOOKAHEAD);

            loop {
                if self.slots.len() >= MAX_TOTAL_TRANSFERS
                    || self.slot_count(dir) >= MAX_TRANSFERS
                    || started[dir.idx()] >= MAX_NEW_STARTS_PER_TICK
                {
                    break;
                }

                let (active_bytes, dominant) = self.pipeline_load(dir, large);
                if dominant {
                    break;
                }
                if active_bytes >= target {
                    break;
                }

                let Some(next) = self.next_queued(dir, large, now) else {
                    break;
                };
                if self.start_transfer(next) {
                    started[dir.idx()] += 1;
                } else {
                    break;
                }
            }
        }
    }

    /// Remaining active bytes in a pipeline, plus whether one very large
    /// file dominates it.
    fn pipeline_load(&self, dir: Direction, large: bool) -> (u64, bool) {
        let mut total = 0;
        let mut dominant = false;
        for (_, slot) in self.slots.iter() {
            let Some(t) = self.transfers.get(slot.transfer) else {
                continue;
            };
            if t.dir != dir || t.is_large() != large {
                continue;
            }
            let remaining = t.remaining();
            total += remaining;
            if t.is_large() && remaining > DOMINANT_FILE_REMAINDER {
                dominant = true;
            }
        }
        (total, dominant)
    }

    fn slot_count(&self, dir: Direction) -> usize {
        self.slots
            .iter()
            .filter(|(_, s)| self.transfers.get(s.transfer).is_some_and(|t| t.dir == dir))
            .count()
    }

    fn next_queued(&self, dir: Direction, large: bool, now: Ds) -> Option<TransferId> {
        self.transfers.order[dir.idx()]
            .iter()
            .copied()
            .find(|id| {
                self.transfers.get(*id).is_some_and(|t| {
                    matches!(t.state, TransferState::Queued | TransferState::Retrying)
                        && t.is_large() == large
                        && t.slot.is_none()
                        && (t.bt.next_fire() == mega_core::NEVER || t.bt.armed(now))
                })
            })
    }

    /// Per-transfer setup at slot allocation. Returns false if the
    /// transfer failed setup (it is completed-with-error, not retried).
    fn start_transfer(&mut self, id: TransferId) -> bool {
        match self.prepare_transfer(id) {
            Ok(()) => {
                self.create_slot(id);
                true
            }
            Err(err) => {
                tracing::warn!("transfer {id:?} failed setup: {err}");
                self.fail_transfer(id, err);
                false
            }
        }
    }

    fn prepare_transfer(&mut self, id: TransferId) -> Result<(), ApiError> {
        let dir = self.transfers.get(id).ok_or(ApiError::NotFound)?.dir;
        match dir {
            Direction::Put => self.prepare_upload(id),
            Direction::Get => self.prepare_download(id),
        }
    }

    fn prepare_upload(&mut self, id: TransferId) -> Result<(), ApiError> {
        let (path, src_mtime, src_size, had_key) = {
            let t = self.transfers.get(id).expect("caller checked");
            (t.temp_path.clone(), t.src_mtime, t.src_size, t.key.is_some())
        };

        // The file must not have changed since it was queued.
        let entry = self
            .fsaccess
            .stat(&path)
            .ok()
            .flatten()
            .ok_or(ApiError::Read)?;
        if entry.mtime != src_mtime || entry.size != src_size {
            return Err(ApiError::Read);
        }

        if !had_key {
            let key = FileKey::generate(&mut self.rng);
            let t = self.transfers.get_mut(id).expect("caller checked");
            t.key = Some(key);
        }

        // Thumbnail and preview gate node creation through minfa.
        if self.gfx.is_graphic(&path) {
            let key = self.transfers.get(id).expect("caller checked").key.expect("set above");
            let cipher = mega_core::crypto::SymmCipher::new(key.aes);
            for (fatype, kind) in [(0u32, GfxSize::Thumbnail), (1u32, GfxSize::Preview)] {
                match self.gfx.generate(&path, kind) {
                    Ok(mut media) => {
                        // FA payloads are padded and ECB-encrypted with
                        // the file key.
                        let padded = media.len().div_ceil(16) * 16;
                        media.resize(padded, 0);
                        cipher.ecb_encrypt(&mut media);
                        self.faqueue.push(FaOwner::Transfer(id), fatype, media);
                        let t = self.transfers.get_mut(id).expect("caller checked");
                        t.minfa += 1;
                    }
                    Err(err) => tracing::debug!("media generation failed: {err}"),
                }
            }
        }

        let t = self.transfers.get_mut(id).expect("caller checked");
        t.state = TransferState::Active;
        Ok(())
    }

    fn prepare_download(&mut self, id: TransferId) -> Result<(), ApiError> {
        let source = {
            let t = self.transfers.get(id).expect("caller checked");
            t.files
                .iter()
                .map(|f| f.remote)
                .find(|h| self.nodes.get(*h).is_some_and(|n| n.has_key()))
        };
        // Obtain the key from any suitable source file.
        let Some(source) = source else {
            return Err(ApiError::Args);
        };
        let key_bytes = self
            .nodes
            .get(source)
            .and_then(|n| n.key.decrypted())
            .ok_or(ApiError::Key)?;
        let full: [u8; 32] = key_bytes.try_into().map_err(|_| ApiError::Key)?;
        let key = FileKey::unfold(&full);

        // Resumption: the temp file must still match the cached partial
        // fingerprint, otherwise progress restarts from zero.
        let (temp_path, temp_fp, progress) = {
            let t = self.transfers.get(id).expect("caller checked");
            (t.temp_path.clone(), t.temp_fp, t.progress_completed)
        };
        let mut reset = false;
        if progress > 0 {
            match (self.fsaccess.stat(&temp_path).ok().flatten(), temp_fp) {
                (Some(entry), Some(expected)) if entry.size >= expected.size => {
                    // Fingerprint the same prefix the partial covered.
                    let current = self
                        .fsaccess
                        .open_read(&temp_path)
                        .ok()
                        .and_then(|mut file| {
                            FileFingerprint::generate(expected.size, expected.mtime, |pos, buf| {
                                file.read_at(pos, buf)
                            })
                            .ok()
                        });
                    if current.is_none_or(|fp| !fp.same_content(&expected)) {
                        reset = true;
                    }
                }
                _ => reset = true,
            }
        }

        let size = {
            let t = self.transfers.get_mut(id).expect("caller checked");
            t.key = Some(key);
            if reset {
                tracing::debug!("temp file mismatch, restarting {id:?} from zero");
                t.chunk_macs.clear();
                t.progress_completed = 0;
            }
            t.size
        };
        // Resume at the end of the last contiguous completed block.
        let t = self.transfers.get_mut(id).expect("caller checked");
        t.pos = t.chunk_macs.contiguous_end(size);
        t.progress_completed = t.pos;
        t.state = TransferState::Active;
        Ok(())
    }

    /// Temp URL arrived (or failed) from the `g`/`u` command.
    pub(crate) fn transfer_url_result(
        &mut self,
        id: TransferId,
        result: crate::commands::CmdResult,
    ) {
        let now = self.now_ds();
        match result {
            Ok(response) => {
                let urls = extract_urls(&response);
                let Some(t) = self.transfers.get_mut(id) else {
                    return;
                };
                if urls.is_empty() {
                    t.url_requested = false;
                    t.bt.backoff(now, &mut self.rng);
                    return;
                }
                t.temp_urls = urls;
                self.loop_requested = true;
            }
            Err(ApiError::OverQuota) => self.transfer_overquota(id, None),
            Err(ApiError::Paywall) => {
                // Storage paywall: uploads and syncs stop wholesale.
                tracing::warn!("storage paywall reached");
                self.transfers.paused[Direction::Put.idx()] = true;
                self.suspend_all_syncs();
                self.app.storage_state_changed(crate::app::StorageState::Paywall);
                if let Some(t) = self.transfers.get_mut(id) {
                    t.state = TransferState::Paused;
                }
            }
            Err(err) if err.is_retryable() => {
                if let Some(t) = self.transfers.get_mut(id) {
                    t.url_requested = false;
                    t.state = TransferState::Retrying;
                    t.bt.backoff(now, &mut self.rng);
                }
            }
            Err(err) => self.fail_transfer(id, err),
        }
    }

    /// Bandwidth overquota: requeue with the server-supplied retry-in or
    /// the default backoff. No other transfer of that direction may jump
    /// the queue meanwhile.
    pub(crate) fn transfer_overquota(&mut self, id: TransferId, timeleft_secs: Option<u64>) {
        let now = self.now_ds();
        if let Some(slot_id) = self.transfers.get(id).and_then(|t| t.slot) {
            self.release_slot(slot_id);
        }
        let delay_ds = (timeleft_secs.unwrap_or(DEFAULT_BW_OVERQUOTA_BACKOFF_SECS) * 10) as Ds;
        let mut held_direction = None;
        if let Some(t) = self.transfers.get_mut(id) {
            t.state = TransferState::Retrying;
            t.url_requested = false;
            t.temp_urls.clear();
            t.bt.backoff_for(now, delay_ds);
            held_direction = Some(t.dir);
        }
        if held_direction == Some(Direction::Get) {
            self.overquota_until = self.overquota_until.max(now.saturating_add(delay_ds));
        }
        self.app.storage_state_changed(crate::app::StorageState::Red);
    }

    pub(crate) fn fail_transfer(&mut self, id: TransferId, err: ApiError) {
        if let Some(slot_id) = self.transfers.get(id).and_then(|t| t.slot) {
            self.release_slot(slot_id);
        }
        if let Some(t) = self.transfers.get_mut(id) {
            t.state = TransferState::Failed;
        }
        self.remove_transfer_from_cache(id);
        self.app.transfer_failed(id, err);
        self.transfers.remove(id);
    }

    // -- introspection --

    pub fn transfer_count(&self) -> usize {
        self.transfers.len()
    }

    pub fn transfer_state(&self, id: TransferId) -> Option<TransferState> {
        self.transfers.get(id).map(|t| t.state)
    }

    /// (pos, progress_completed, size).
    pub fn transfer_progress(&self, id: TransferId) -> Option<(u64, u64, u64)> {
        self.transfers
            .get(id)
            .map(|t| (t.pos, t.progress_completed, t.size))
    }

    pub fn transfer_next_fire(&self, id: TransferId) -> Option<Ds> {
        self.transfers.get(id).map(|t| t.bt.next_fire())
    }

    /// Restored-from-cache and queued transfer ids, in queue order.
    pub fn transfer_ids(&self) -> Vec<TransferId> {
        self.transfers.all_ids()
    }

    /// (total, get, put) active slot counts.
    pub fn slot_counts(&self) -> (usize, usize, usize) {
        let get = self.slot_count(Direction::Get);
        let put = self.slot_count(Direction::Put);
        (self.slots.len(), get, put)
    }

    pub fn cancel_transfer(&mut self, id: TransferId) {
        if let Some(slot_id) = self.transfers.get(id).and_then(|t| t.slot) {
            self.release_slot(slot_id);
        }
        if let Some(t) = self.transfers.get_mut(id) {
            t.state = TransferState::Cancelled;
        }
        self.remove_transfer_from_cache(id);
        self.transfers.remove(id);
    }
}

/// Staging filename for a download in progress.
pub fn staging_path(final_path: &std::path::Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".getxfer");
    final_path.with_file_name(name)
}

/// Pulls download/upload URLs out of a `g`/`u` response: either one
/// plain URL or six RAID part URLs.
pub fn extract_urls(response: &serde_json::Value) -> Vec<String> {
    if let Some(url) = response.get("p").and_then(serde_json::Value::as_str) {
        return vec![url.to_string()];
    }
    if let Some(parts) = response.get("g").and_then(serde_json::Value::as_array) {
        return parts
            .iter()
            .filter_map(serde_json::Value::as_str)
            .map(str::to_string)
            .collect();
    }
    if let Some(url) = response.get("g").and_then(serde_json::Value::as_str) {
        return vec![url.to_string()];
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_path() {
        let p = staging_path(std::path::Path::new("/a/b/report.pdf"));
        assert_eq!(p, PathBuf::from("/a/b/report.pdf.getxfer"));
    }

    #[test]
    fn test_extract_urls() {
        let one = serde_json::json!({"p": "https://gfs1.example/dl"});
        assert_eq!(extract_urls(&one).len(), 1);
        let raid = serde_json::json!({"g": ["u1","u2","u3","u4","u5","u6"]});
        assert_eq!(extract_urls(&raid).len(), 6);
        let upload = serde_json::json!({"g": "https://ul.example/ul"});
        assert_eq!(extract_urls(&upload), vec!["https://ul.example/ul"]);
    }

    #[test]
    fn test_queue_content_dedup_key() {
        let mut queues = TransferQueues::new();
        let fp = FileFingerprint::from_bytes(b"same-bytes", 1);
        let mut t = queues.allocate(Direction::Get, 10);
        t.fingerprint = Some(fp);
        let id = queues.insert(t);
        assert_eq!(queues.lookup_content(Direction::Get, &fp), Some(id));
        // an mtime-only difference still joins
        let fp2 = FileFingerprint { mtime: 99, ..fp };
        assert_eq!(queues.lookup_content(Direction::Get, &fp2), Some(id));
        assert_eq!(queues.lookup_content(Direction::Put, &fp), None);
        queues.remove(id);
        assert_eq!(queues.lookup_content(Direction::Get, &fp), None);
    }
}
