//! Transfer slots: the per-connection I/O state machines that move
//! chunks between the temp URLs and the local filesystem, encrypting or
//! decrypting in CTR mode and maintaining the chunk-MAC table.

use std::collections::HashMap;

use mega_core::caps::ReqStatus;
use mega_core::chunk;
use mega_core::crypto::SymmCipher;
use mega_core::{ApiError, Ds, HttpReq, NodeHandle, b64};

use crate::client::MegaClient;
use crate::commands::Command;
use crate::consts::NETWORK_TIMEOUT_DS;
use crate::raid;
use crate::transfers::{Direction, TransferId, TransferState};

/// A RAID chunk fetch: one request per part, whole-line ranges.
pub struct RaidFetch {
    pub parts: Vec<Option<HttpReq>>,
    pub chunk_start: u64,
    pub chunk_len: usize,
}

pub struct TransferSlot {
    pub transfer: TransferId,
    /// Single-stream connection (plain transfers).
    pub conn: Option<HttpReq>,
    /// The chunk the connection is moving.
    pub chunk_start: u64,
    pub chunk_len: usize,
    /// MAC computed at send time for the in-flight PUT chunk.
    pub pending_mac: Option<[u8; 16]>,
    pub raid: Option<RaidFetch>,
    pub started_ds: Ds,
}

#[derive(Default)]
pub struct Slots {
    map: HashMap<u64, TransferSlot>,
    next: u64,
}

impl Slots {
    pub fn new() -> Slots {
        Slots::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u64, &TransferSlot)> {
        self.map.iter()
    }

    pub fn ids(&self) -> Vec<u64> {
        self.map.keys().copied().collect()
    }

    pub fn get(&self, id: u64) -> Option<&TransferSlot> {
        self.map.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut TransferSlot> {
        self.map.get_mut(&id)
    }

    pub fn insert(&mut self, slot: TransferSlot) -> u64 {
        self.next += 1;
        self.map.insert(self.next, slot);
        self.next
    }

    pub fn remove(&mut self, id: u64) -> Option<TransferSlot> {
        self.map.remove(&id)
    }
}

/// Chunk MAC start vector: the CTR nonce doubled.
fn mac_iv(iv: &[u8; 8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(iv);
    out[8..].copy_from_slice(iv);
    out
}

impl MegaClient {
    pub(crate) fn create_slot(&mut self, transfer: TransferId) {
        let now = self.now_ds();
        let slot_id = self.slots.insert(TransferSlot {
            transfer,
            conn: None,
            chunk_start: 0,
            chunk_len: 0,
            pending_mac: None,
            raid: None,
            started_ds: now,
        });
        if let Some(t) = self.transfers.get_mut(transfer) {
            t.slot = Some(slot_id);
            t.state = TransferState::Active;
        }
        self.loop_requested = true;
    }

    /// Removes a slot, aborting any in-flight requests.
    pub(crate) fn release_slot(&mut self, slot_id: u64) {
        if let Some(slot) = self.slots.remove(slot_id) {
            if let Some(req) = &slot.conn {
                self.http.cancel(req);
            }
            if let Some(raid) = &slot.raid {
                for req in raid.parts.iter().flatten() {
                    self.http.cancel(req);
                }
            }
            if let Some(t) = self.transfers.get_mut(slot.transfer) {
                t.slot = None;
            }
        }
    }

    /// Hard-pause path: abort the connection cleanly, keep the transfer.
    pub(crate) fn disconnect_slot(&mut self, slot_id: u64) {
        self.release_slot(slot_id);
    }

    /// Drives every slot one step.
    pub(crate) fn exec_transfer_slots(&mut self) {
        for slot_id in self.slots.ids() {
            self.slot_doio(slot_id);
        }
    }

    fn slot_doio(&mut self, slot_id: u64) {
        let Some(slot) = self.slots.get(slot_id) else {
            return;
        };
        let id = slot.transfer;
        let Some(transfer) = self.transfers.get(id) else {
            self.release_slot(slot_id);
            return;
        };

        // URL acquisition happens once per transfer attempt.
        if transfer.temp_urls.is_empty() {
            if !transfer.url_requested {
                let cmd = match transfer.dir {
                    Direction::Get => {
                        let Some(source) = transfer.files.first().map(|f| f.remote) else {
                            self.fail_transfer(id, ApiError::Args);
                            return;
                        };
                        Command::get_file_url(id, source)
                    }
                    Direction::Put => Command::put_file_url(id, transfer.size),
                };
                if let Some(t) = self.transfers.get_mut(id) {
                    t.url_requested = true;
                }
                self.queue_command(cmd);
            }
            return;
        }

        if slot.conn.is_none() && slot.raid.is_none() {
            self.slot_start_chunk(slot_id);
            return;
        }

        if self.slots.get(slot_id).is_some_and(|s| s.raid.is_some()) {
            self.slot_poll_raid(slot_id);
        } else {
            self.slot_poll_conn(slot_id);
        }
    }

    fn slot_start_chunk(&mut self, slot_id: u64) {
        let Some(slot) = self.slots.get(slot_id) else {
            return;
        };
        let id = slot.transfer;
        let Some(transfer) = self.transfers.get(id) else {
            return;
        };

        let pos = transfer.pos;
        if pos >= transfer.size {
            match transfer.dir {
                Direction::Get => self.finalize_download(id, slot_id),
                Direction::Put if transfer.size == 0 && transfer.upload_token.is_none() => {
                    // Empty file: one zero-length chunk fetches the token.
                    self.put_start_chunk(slot_id, 0, 0);
                }
                Direction::Put => self.upload_last_chunk_done(id, slot_id),
            }
            return;
        }
        let end = chunk::chunk_ceil(pos + 1).min(transfer.size);
        let len = (end - pos) as usize;

        match transfer.dir {
            Direction::Get => {
                if transfer.temp_urls.len() >= raid::RAID_PARTS {
                    self.raid_start_chunk(slot_id, pos, len);
                } else {
                    let url = format!(
                        "{}/{}-{}",
                        transfer.temp_urls[0],
                        pos,
                        pos + len as u64 - 1
                    );
                    let req = HttpReq::post(url, Vec::new());
                    if let Err(err) = self.http.post(&req) {
                        tracing::debug!("chunk request failed to start: {err}");
                        req.fail();
                    }
                    let slot = self.slots.get_mut(slot_id).expect("checked above");
                    slot.conn = Some(req);
                    slot.chunk_start = pos;
                    slot.chunk_len = len;
                }
            }
            Direction::Put => self.put_start_chunk(slot_id, pos, len),
        }
    }

    fn put_start_chunk(&mut self, slot_id: u64, pos: u64, len: usize) {
        let Some(slot) = self.slots.get(slot_id) else {
            return;
        };
        let id = slot.transfer;
        let (key, path, url, size) = {
            let t = self.transfers.get(id).expect("caller checked");
            (
                t.key.expect("set at prepare"),
                t.temp_path.clone(),
                t.temp_urls[0].clone(),
                t.size,
            )
        };

        let mut data = vec![0u8; len];
        let read = self
            .fsaccess
            .open_read(&path)
            .and_then(|mut f| f.read_at(pos, &mut data));
        if let Err(err) = read {
            tracing::warn!("upload source read failed: {err}");
            self.fail_transfer(id, ApiError::Read);
            return;
        }

        let cipher = SymmCipher::new(key.aes);
        let mac = cipher.cbc_mac(mac_iv(&key.iv), &data);
        cipher.ctr_crypt(&key.iv, pos, &mut data);

        let last = pos + len as u64 >= size;
        let url = format!("{url}/{pos}{}", if last { "?c=1" } else { "" });
        let req = HttpReq::post(url, data);
        if let Err(err) = self.http.post(&req) {
            tracing::debug!("chunk upload failed to start: {err}");
            req.fail();
        }
        let slot = self.slots.get_mut(slot_id).expect("caller checked");
        slot.conn = Some(req);
        slot.chunk_start = pos;
        slot.chunk_len = len;
        slot.pending_mac = Some(mac);
    }

    fn slot_poll_conn(&mut self, slot_id: u64) {
        let Some(slot) = self.slots.get(slot_id) else {
            return;
        };
        let Some(req) = slot.conn.clone() else {
            return;
        };
        let id = slot.transfer;

        match req.status() {
            ReqStatus::Prepared | ReqStatus::Inflight => {
                let idle = req.idle_time().unwrap_or_default();
                if idle.as_millis() as u64 > u64::from(NETWORK_TIMEOUT_DS) * 100 {
                    tracing::debug!("transfer stream timed out");
                    self.http.cancel(&req);
                    self.retry_transfer(id, slot_id, &req);
                }
            }
            ReqStatus::Failure => self.retry_transfer(id, slot_id, &req),
            ReqStatus::Success => match req.http_status() {
                200 => {
                    let body = req.take_response();
                    let dir = self.transfers.get(id).map(|t| t.dir);
                    match dir {
                        Some(Direction::Get) => self.get_chunk_done(id, slot_id, body),
                        Some(Direction::Put) => self.put_chunk_done(id, slot_id, body),
                        None => self.release_slot(slot_id),
                    }
                }
                509 => {
                    // Bandwidth quota exhausted at the storage server.
                    self.transfer_overquota(id, None);
                }
                status => {
                    tracing::debug!(status, "storage server error");
                    self.retry_transfer(id, slot_id, &req);
                }
            },
        }
    }

    fn get_chunk_done(&mut self, id: TransferId, slot_id: u64, mut data: Vec<u8>) {
        let Some(slot) = self.slots.get_mut(slot_id) else {
            return;
        };
        let (start, len) = (slot.chunk_start, slot.chunk_len);
        slot.conn = None;
        if data.len() != len {
            tracing::debug!(got = data.len(), want = len, "short chunk");
            if let Some(t) = self.transfers.get_mut(id) {
                let now = self.clock.now_ds();
                t.bt.backoff(now, &mut self.rng);
            }
            return;
        }

        let Some(t) = self.transfers.get_mut(id) else {
            return;
        };
        let key = t.key.expect("set at prepare");
        let cipher = SymmCipher::new(key.aes);
        cipher.ctr_crypt(&key.iv, start, &mut data);
        let mac = cipher.cbc_mac(mac_iv(&key.iv), &data);
        t.chunk_macs.insert(start, mac);

        let temp = t.temp_path.clone();
        let size = t.size;
        let write = self
            .fsaccess
            .open_write(&temp, true)
            .and_then(|mut f| f.write_at(start, &data));
        if let Err(err) = write {
            tracing::warn!("temp write failed: {err}");
            self.fail_transfer(id, ApiError::Write);
            return;
        }

        let now = self.now_ds();
        self.speeds[Direction::Get.idx()].record(now, data.len() as u64);
        let (done, pos) = {
            let t = self.transfers.get_mut(id).expect("checked above");
            t.pos = t.chunk_macs.contiguous_end(size);
            t.progress_completed = t.pos;
            (t.chunk_macs.complete(size) || size == 0, t.pos)
        };
        // Fingerprint the contiguous prefix so a later resume can prove
        // the temp file still matches this partial.
        if pos > 0 && !done {
            let partial_fp = self.fsaccess.open_read(&temp).ok().and_then(|mut f| {
                mega_core::FileFingerprint::generate(pos, 0, |p, buf| f.read_at(p, buf)).ok()
            });
            if let Some(t) = self.transfers.get_mut(id) {
                t.temp_fp = partial_fp;
            }
        }
        self.save_transfer_to_cache(id);

        if done {
            self.finalize_download(id, slot_id);
        } else {
            self.loop_requested = true;
        }
    }

    fn finalize_download(&mut self, id: TransferId, slot_id: u64) {
        let Some(t) = self.transfers.get(id) else {
            self.release_slot(slot_id);
            return;
        };
        let key = t.key.expect("set at prepare");
        let cipher = SymmCipher::new(key.aes);
        let meta = t.chunk_macs.meta_mac(&cipher);
        if t.size > 0 && meta != key.meta_mac {
            tracing::error!("meta-MAC mismatch on download {id:?}");
            self.release_slot(slot_id);
            self.fail_transfer(id, ApiError::Key);
            return;
        }

        let temp = t.temp_path.clone();
        let targets = t.files.clone();
        let mtime = t.fingerprint.map(|fp| fp.mtime);
        let source_node = targets
            .first()
            .map(|f| f.remote)
            .unwrap_or(NodeHandle::UNDEF);

        // First target gets the staging file; further ones get copies.
        let mut targets_iter = targets.iter();
        if let Some(first) = targets_iter.next() {
            if let Err(err) = self.fsaccess.rename(&temp, &first.local_path) {
                tracing::warn!("finalize rename failed: {err}");
                self.release_slot(slot_id);
                self.fail_transfer(id, ApiError::Write);
                return;
            }
            if let Some(mtime) = mtime {
                let _ = self.fsaccess.set_mtime(&first.local_path, mtime);
            }
            for extra in targets_iter {
                if let Err(err) = self.copy_local(&first.local_path, &extra.local_path) {
                    tracing::warn!("extra target copy failed: {err}");
                }
            }
        }

        self.release_slot(slot_id);
        if let Some(t) = self.transfers.get_mut(id) {
            t.state = TransferState::Completed;
        }
        self.remove_transfer_from_cache(id);
        for target in &targets {
            if let Some(sync) = target.sync {
                self.sync_download_finished(sync, &target.local_path, source_node);
            }
        }
        self.app.transfer_complete(id, source_node);
        self.transfers.remove(id);
    }

    fn copy_local(&mut self, from: &std::path::Path, to: &std::path::Path) -> anyhow::Result<()> {
        let mut reader = self.fsaccess.open_read(from)?;
        let size = reader.size();
        let mut writer = self.fsaccess.open_write(to, true)?;
        let mut pos = 0u64;
        let mut buf = vec![0u8; 1 << 17];
        while pos < size {
            let len = ((size - pos) as usize).min(buf.len());
            reader.read_at(pos, &mut buf[..len])?;
            writer.write_at(pos, &buf[..len])?;
            pos += len as u64;
        }
        Ok(())
    }

    fn put_chunk_done(&mut self, id: TransferId, slot_id: u64, body: Vec<u8>) {
        let (start, len, mac) = {
            let Some(slot) = self.slots.get_mut(slot_id) else {
                return;
            };
            let out = (slot.chunk_start, slot.chunk_len, slot.pending_mac);
            slot.conn = None;
            slot.pending_mac = None;
            out
        };

        let trimmed = body.trim_ascii();
        if let Ok(text) = std::str::from_utf8(trimmed)
            && let Ok(code) = text.parse::<i64>()
            && code < 0
        {
            let err = ApiError::from_code(code as i32);
            if err == ApiError::OverQuota {
                self.transfer_overquota(id, None);
            } else {
                self.release_slot(slot_id);
                self.fail_transfer(id, err);
            }
            return;
        }

        let now = self.now_ds();
        self.speeds[Direction::Put.idx()].record(now, len as u64);
        let Some(t) = self.transfers.get_mut(id) else {
            return;
        };
        if let Some(mac) = mac {
            t.chunk_macs.insert(start, mac);
        }
        t.pos = t.chunk_macs.contiguous_end(t.size);
        t.progress_completed = t.pos;
        if !trimmed.is_empty() {
            t.upload_token = Some(String::from_utf8_lossy(trimmed).into_owned());
        }
        self.save_transfer_to_cache(id);

        let done = {
            let t = self.transfers.get(id).expect("checked above");
            t.chunk_macs.complete(t.size) || t.size == 0
        };
        if done {
            self.upload_last_chunk_done(id, slot_id);
        } else {
            self.loop_requested = true;
        }
    }

    /// Last chunk acknowledged: wait for the gating file attributes, then
    /// finalize with PutNodes.
    fn upload_last_chunk_done(&mut self, id: TransferId, slot_id: u64) {
        self.release_slot(slot_id);
        if let Some(t) = self.transfers.get_mut(id) {
            t.state = TransferState::Completing;
        }
        self.check_fa_completion(id);
    }

    /// Called whenever an FA upload completes; issues PutNodes once the
    /// token is in and `minfa` attributes have handles.
    pub(crate) fn check_fa_completion(&mut self, id: TransferId) {
        let ready = {
            let Some(t) = self.transfers.get(id) else {
                return;
            };
            t.state == TransferState::Completing && t.upload_token.is_some() && t.fa_complete()
        };
        if ready {
            self.finalize_upload(id);
        }
    }

    fn finalize_upload(&mut self, id: TransferId) {
        let Some(t) = self.transfers.get_mut(id) else {
            return;
        };
        let key = t.key.expect("set at prepare");
        let cipher = SymmCipher::new(key.aes);
        let meta = t.chunk_macs.meta_mac(&cipher);
        let mut key = key;
        key.meta_mac = meta;
        t.key = Some(key);

        let token = t.upload_token.clone().expect("checked by caller");
        let target = t.files.first().map(|f| f.remote).unwrap_or(NodeHandle::UNDEF);
        let version_over = t
            .files
            .first()
            .map(|f| f.version_over)
            .unwrap_or(NodeHandle::UNDEF);
        let name = t
            .files
            .first()
            .map(|f| f.name.clone())
            .unwrap_or_default();
        let mtime = t.src_mtime;
        let size = t.src_size;
        let fa: Vec<String> = t.fa_handles.iter().map(|(_, h)| h.clone()).collect();
        let temp_path = t.temp_path.clone();

        // Content fingerprint for the attribute blob.
        let fingerprint = self
            .fsaccess
            .open_read(&temp_path)
            .ok()
            .and_then(|mut f| {
                mega_core::FileFingerprint::generate(size, mtime, |pos, buf| f.read_at(pos, buf))
                    .ok()
            });

        let attrs = mega_core::attrs::name_attrs(&name, fingerprint.map(|fp| fp.to_attr()).as_deref());
        let attr_blob = mega_core::attrs::encrypt_attrs(&attrs, &cipher);

        let Some(master) = self.session.master_key.clone() else {
            self.fail_transfer(id, ApiError::Args);
            return;
        };
        let mut wrapped = key.fold().to_vec();
        master.ecb_encrypt(&mut wrapped);

        let mut node = serde_json::json!({
            "h": token,
            "t": 0,
            "a": b64::encode(&attr_blob),
            "k": b64::encode(&wrapped),
        });
        if !fa.is_empty() {
            node["fa"] = serde_json::Value::String(fa.join("/"));
        }
        if version_over.is_set() {
            node["ov"] = serde_json::Value::String(version_over.to_b64());
        }

        tracing::debug!("finalizing upload {id:?} into {target}");
        self.queue_command(Command::put_nodes(
            target,
            serde_json::Value::Array(vec![node]),
            crate::commands::PutNodesSource::Upload { transfer: id },
        ));
    }

    /// Transport or server failure: back the transfer off and retry, and
    /// remember the misbehaving storage host.
    fn retry_transfer(&mut self, id: TransferId, slot_id: u64, req: &HttpReq) {
        if let Ok(url) = url::Url::parse(req.url())
            && let Some(host) = url.host_str()
        {
            self.bad_hosts.insert(host.to_string());
        }
        self.release_slot(slot_id);
        let now = self.now_ds();
        if let Some(t) = self.transfers.get_mut(id) {
            t.state = TransferState::Retrying;
            t.temp_urls.clear();
            t.url_requested = false;
            t.bt.backoff(now, &mut self.rng);
        }
    }

    // -- RAID --

    fn raid_start_chunk(&mut self, slot_id: u64, pos: u64, len: usize) {
        let Some(slot) = self.slots.get(slot_id) else {
            return;
        };
        let id = slot.transfer;
        let Some(t) = self.transfers.get(id) else {
            return;
        };
        let (part_start, part_end) = raid::part_range(pos, pos + len as u64);
        let mut parts = Vec::with_capacity(raid::RAID_PARTS);
        for part_url in t.temp_urls.iter().take(raid::RAID_PARTS) {
            let url = format!("{part_url}/{part_start}-{}", part_end - 1);
            let req = HttpReq::post(url, Vec::new());
            if self.http.post(&req).is_err() {
                req.fail();
            }
            parts.push(Some(req));
        }
        let slot = self.slots.get_mut(slot_id).expect("checked above");
        slot.raid = Some(RaidFetch {
            parts,
            chunk_start: pos,
            chunk_len: len,
        });
    }

    fn slot_poll_raid(&mut self, slot_id: u64) {
        let Some(slot) = self.slots.get(slot_id) else {
            return;
        };
        let id = slot.transfer;
        let Some(raid_fetch) = &slot.raid else {
            return;
        };

        let mut failed = Vec::new();
        for (i, req) in raid_fetch.parts.iter().enumerate() {
            match req.as_ref().map(|r| r.status()) {
                Some(ReqStatus::Success) => {}
                Some(ReqStatus::Failure) | None => failed.push(i),
                Some(_) => return, // still in flight
            }
        }

        if failed.len() > 1 {
            tracing::debug!("RAID chunk lost {} parts, retrying", failed.len());
            let req = raid_fetch.parts.iter().flatten().next().cloned();
            let slot = self.slots.get_mut(slot_id).expect("checked above");
            slot.raid = None;
            if let Some(req) = req {
                self.retry_transfer(id, slot_id, &req);
            }
            return;
        }

        let missing = failed.first().copied();
        let (start, len) = (raid_fetch.chunk_start, raid_fetch.chunk_len);
        let mut buffers: [Vec<u8>; raid::RAID_PARTS] = Default::default();
        for (i, req) in raid_fetch.parts.iter().enumerate() {
            if Some(i) != missing
                && let Some(req) = req
            {
                buffers[i] = req.take_response();
            }
        }
        let slot = self.slots.get_mut(slot_id).expect("checked above");
        slot.raid = None;

        // Decode the whole-line span, then cut out the chunk bytes.
        let line_offset = (start % raid::RAID_LINE as u64) as usize;
        let span = line_offset + len;
        match raid::decode(&buffers, missing, span) {
            Some(plain) if plain.len() >= span => {
                let data = plain[line_offset..span].to_vec();
                self.get_chunk_done(id, slot_id, data);
            }
            _ => {
                tracing::warn!("RAID decode failed");
                let now = self.now_ds();
                if let Some(t) = self.transfers.get_mut(id) {
                    t.bt.backoff(now, &mut self.rng);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_iv_doubles_nonce() {
        let iv = [1, 2, 3, 4, 5, 6, 7, 8];
        let v = mac_iv(&iv);
        assert_eq!(&v[..8], &iv);
        assert_eq!(&v[8..], &iv);
    }
}
