//! Streaming direct reads: partial file content by node or public
//! handle, without a full transfer. One `DirectReadNode` per (handle,
//! privacy) key holds a FIFO of reads and a cached temp URL.

use std::collections::HashMap;

use mega_core::caps::ReqStatus;
use mega_core::crypto::{FileKey, SymmCipher};
use mega_core::{ApiError, BackoffTimer, Ds, HttpReq, NodeHandle};

use crate::client::MegaClient;
use crate::commands::Command;
use crate::consts::{DR_URL_TTL_DS, MAX_DR_SLOTS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DrKey {
    pub handle: NodeHandle,
    pub public: bool,
}

#[derive(Debug)]
pub struct DirectRead {
    pub read_id: u64,
    pub offset: u64,
    pub count: u64,
    pub pos: u64,
    req: Option<HttpReq>,
}

pub struct DirectReadNode {
    pub key: DrKey,
    /// Decryption key; for public reads supplied by the caller.
    pub file_key: Option<FileKey>,
    url: Option<String>,
    url_received: Ds,
    url_requested: bool,
    pub bt: BackoffTimer,
    reads: Vec<DirectRead>,
}

#[derive(Default)]
pub struct DirectReads {
    nodes: HashMap<DrKey, DirectReadNode>,
    next_read_id: u64,
}

impl DirectReads {
    pub fn new() -> DirectReads {
        DirectReads::default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn inflight_count(&self) -> usize {
        self.nodes
            .values()
            .flat_map(|n| n.reads.iter())
            .filter(|r| r.req.is_some())
            .count()
    }
}

impl MegaClient {
    /// Queues a streaming read. Data arrives through
    /// `AppHandler::direct_read_data` in chunk-sized callbacks.
    pub fn direct_read(
        &mut self,
        handle: NodeHandle,
        public: bool,
        file_key: Option<FileKey>,
        offset: u64,
        count: u64,
    ) -> u64 {
        let key = DrKey { handle, public };
        let drn = self.drq.nodes.entry(key).or_insert_with(|| DirectReadNode {
            key,
            file_key,
            url: None,
            url_received: 0,
            url_requested: false,
            bt: BackoffTimer::new(),
            reads: Vec::new(),
        });
        if drn.file_key.is_none() {
            drn.file_key = file_key;
        }
        self.drq.next_read_id += 1;
        let read_id = self.drq.next_read_id;
        drn.reads.push(DirectRead {
            read_id,
            offset,
            count,
            pos: 0,
            req: None,
        });
        self.loop_requested = true;
        read_id
    }

    /// Cancels a pending read; the app gets `EINCOMPLETE`.
    pub fn cancel_direct_read(&mut self, read_id: u64) {
        let mut cancelled = false;
        for drn in self.drq.nodes.values_mut() {
            if let Some(idx) = drn.reads.iter().position(|r| r.read_id == read_id) {
                let read = drn.reads.remove(idx);
                if let Some(req) = &read.req {
                    self.http.cancel(req);
                }
                cancelled = true;
            }
        }
        if cancelled {
            self.app.direct_read_failed(read_id, ApiError::Incomplete);
        }
        self.drq.nodes.retain(|_, n| !n.reads.is_empty() || n.url.is_some());
    }

    pub(crate) fn exec_direct_reads(&mut self) {
        let now = self.now_ds();
        let keys: Vec<DrKey> = self.drq.nodes.keys().copied().collect();
        for key in keys {
            self.dr_node_step(now, key);
        }
    }

    fn dr_node_step(&mut self, now: Ds, key: DrKey) {
        // URL freshness: cached URLs expire after ten minutes.
        {
            let Some(drn) = self.drq.nodes.get_mut(&key) else {
                return;
            };
            if drn.reads.is_empty() {
                return;
            }
            if !drn.bt.armed(now) && drn.bt.next_fire() != mega_core::NEVER {
                return;
            }
            if drn.url.is_some() && now.saturating_sub(drn.url_received) > DR_URL_TTL_DS {
                drn.url = None;
                drn.url_requested = false;
            }
            if drn.url.is_none() {
                if !drn.url_requested {
                    drn.url_requested = true;
                    self.queue_command(Command::direct_read_url(key.handle, key.public));
                }
                return;
            }
        }

        self.dr_pump_reads(key);
    }

    fn dr_pump_reads(&mut self, key: DrKey) {
        let slots_free = MAX_DR_SLOTS.saturating_sub(self.drq.inflight_count());
        let Some(drn) = self.drq.nodes.get_mut(&key) else {
            return;
        };
        let url = drn.url.clone().expect("caller ensured");

        // Start requests FIFO while global slots remain.
        let mut free = slots_free;
        for read in drn.reads.iter_mut() {
            if free == 0 {
                break;
            }
            if read.req.is_none() {
                let start = read.offset + read.pos;
                let end = read.offset + read.count - 1;
                let req = HttpReq::post(format!("{url}/{start}-{end}"), Vec::new());
                if self.http.post(&req).is_err() {
                    req.fail();
                }
                read.req = Some(req);
                free -= 1;
            }
        }

        // Reap completions.
        let file_key = drn.file_key;
        let mut finished: Vec<(u64, Result<Vec<u8>, u16>, u64)> = Vec::new();
        for read in drn.reads.iter_mut() {
            let Some(req) = &read.req else {
                continue;
            };
            match req.status() {
                ReqStatus::Success if req.http_status() == 200 => {
                    finished.push((read.read_id, Ok(req.take_response()), read.offset + read.pos));
                }
                ReqStatus::Success => {
                    finished.push((read.read_id, Err(req.http_status()), 0));
                }
                ReqStatus::Failure => {
                    finished.push((read.read_id, Err(0), 0));
                }
                _ => {}
            }
        }

        let mut retry = false;
        for (read_id, outcome, stream_pos) in finished {
            match outcome {
                Ok(mut data) => {
                    if let Some(fk) = file_key {
                        let cipher = SymmCipher::new(fk.aes);
                        cipher.ctr_crypt(&fk.iv, stream_pos, &mut data);
                    }
                    drn.reads.retain(|r| r.read_id != read_id);
                    let keep = self.app.direct_read_data(read_id, &data);
                    if !keep {
                        // App declined the rest of the stream.
                        continue;
                    }
                }
                Err(status) if status >= 500 || status == 0 => {
                    // Retry with backoff on the node.
                    if let Some(read) = drn.reads.iter_mut().find(|r| r.read_id == read_id) {
                        read.req = None;
                    }
                    retry = true;
                }
                Err(_) => {
                    drn.reads.retain(|r| r.read_id != read_id);
                    self.app.direct_read_failed(read_id, ApiError::Failed);
                }
            }
        }
        if retry {
            let now = self.clock.now_ds();
            drn.bt.backoff(now, &mut self.rng);
            drn.url = None;
            drn.url_requested = false;
        }
    }

    /// Completion of the URL command for a direct-read node.
    pub(crate) fn dr_url_result(
        &mut self,
        handle: NodeHandle,
        public: bool,
        result: crate::commands::CmdResult,
    ) {
        let key = DrKey { handle, public };
        let now = self.now_ds();
        match result {
            Ok(response) => {
                let urls = crate::transfers::extract_urls(&response);
                let timeleft = response.get("tl").and_then(serde_json::Value::as_u64);
                let Some(drn) = self.drq.nodes.get_mut(&key) else {
                    return;
                };
                if let Some(url) = urls.into_iter().next() {
                    drn.url = Some(url);
                    drn.url_received = now;
                    drn.bt.reset();
                    self.loop_requested = true;
                } else if let Some(secs) = timeleft {
                    // Overquota: surface immediately, arm with timeleft.
                    drn.url_requested = false;
                    drn.bt.backoff_for(now, (secs * 10) as Ds);
                    let read_ids: Vec<u64> = drn.reads.iter().map(|r| r.read_id).collect();
                    for read_id in read_ids {
                        self.app.direct_read_failed(read_id, ApiError::OverQuota);
                    }
                } else {
                    drn.url_requested = false;
                    drn.bt.backoff(now, &mut self.rng);
                }
            }
            Err(err) if err == ApiError::Again || err.is_retryable() => {
                if let Some(drn) = self.drq.nodes.get_mut(&key) {
                    drn.url_requested = false;
                    drn.bt.backoff(now, &mut self.rng);
                }
            }
            Err(err) => {
                if let Some(drn) = self.drq.nodes.remove(&key) {
                    for read in drn.reads {
                        self.app.direct_read_failed(read.read_id, err);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dr_key_identity() {
        let a = DrKey {
            handle: NodeHandle::from_raw(1),
            public: false,
        };
        let b = DrKey {
            handle: NodeHandle::from_raw(1),
            public: true,
        };
        assert_ne!(a, b);
    }
}
