//! The file-attribute side channel: a queue of encrypted thumbnail and
//! preview payloads uploaded out-of-band from their transfers, plus the
//! fetch path for displaying attributes of existing nodes.
//!
//! Uploads gate node creation: a transfer's PutNodes waits until its
//! `minfa` attribute uploads report handles.

use std::collections::VecDeque;

use mega_core::caps::ReqStatus;
use mega_core::{HttpReq, NodeHandle};

use crate::client::MegaClient;
use crate::commands::Command;
use crate::transfers::TransferId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaOwner {
    /// Upload in progress; handles collect on the transfer.
    Transfer(TransferId),
    /// Attribute added to an existing node (`pfa` on completion).
    Node(NodeHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FaState {
    Queued,
    UrlRequested,
    Uploading,
}

pub struct PendingFa {
    pub id: u64,
    pub owner: FaOwner,
    pub fatype: u32,
    data: Vec<u8>,
    url: Option<String>,
    req: Option<HttpReq>,
    state: FaState,
}

/// Upload queue plus fetch bookkeeping.
#[derive(Default)]
pub struct FileAttrQueue {
    next_id: u64,
    queue: VecDeque<PendingFa>,
    /// Fetches in flight: (fa handle, request).
    fetches: Vec<(String, HttpReq)>,
}

impl FileAttrQueue {
    pub fn new() -> FileAttrQueue {
        FileAttrQueue::default()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn push(&mut self, owner: FaOwner, fatype: u32, data: Vec<u8>) -> u64 {
        self.next_id += 1;
        self.queue.push_back(PendingFa {
            id: self.next_id,
            owner,
            fatype,
            data,
            url: None,
            req: None,
            state: FaState::Queued,
        });
        self.next_id
    }

    fn get_mut(&mut self, id: u64) -> Option<&mut PendingFa> {
        self.queue.iter_mut().find(|fa| fa.id == id)
    }

    fn remove(&mut self, id: u64) -> Option<PendingFa> {
        let idx = self.queue.iter().position(|fa| fa.id == id)?;
        self.queue.remove(idx)
    }

    /// Drops every attribute belonging to a transfer (cancel path).
    pub fn drop_owner(&mut self, owner: FaOwner) {
        self.queue.retain(|fa| fa.owner != owner);
    }
}

impl MegaClient {
    /// One tick of the FA channel: request upload URLs, post payloads,
    /// reap completions.
    pub(crate) fn exec_fileattrs(&mut self) {
        let ids: Vec<u64> = self.faqueue.queue.iter().map(|fa| fa.id).collect();
        for id in ids {
            self.fa_step(id);
        }
        self.poll_fa_fetches();
    }

    fn fa_step(&mut self, id: u64) {
        let (state, req, size) = {
            let Some(fa) = self.faqueue.get_mut(id) else {
                return;
            };
            (fa.state, fa.req.clone(), fa.data.len())
        };
        match state {
            FaState::Queued => {
                if let Some(fa) = self.faqueue.get_mut(id) {
                    fa.state = FaState::UrlRequested;
                }
                self.queue_command(Command::fa_upload_url(id, size));
            }
            FaState::UrlRequested => {
                // Waiting on the command completion.
            }
            FaState::Uploading => {
                let Some(req) = req else {
                    return;
                };
                match req.status() {
                    ReqStatus::Success if req.http_status() == 200 => {
                        let body = req.take_response();
                        self.fa_upload_finished(id, body);
                    }
                    ReqStatus::Failure | ReqStatus::Success => {
                        tracing::debug!("FA upload failed, requeueing");
                        if let Some(fa) = self.faqueue.get_mut(id) {
                            fa.state = FaState::Queued;
                            fa.req = None;
                            fa.url = None;
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    /// Upload URL arrived from the `ufa` command.
    pub(crate) fn fa_url_result(&mut self, id: u64, result: crate::commands::CmdResult) {
        let url = result
            .ok()
            .and_then(|v| v.get("p").and_then(serde_json::Value::as_str).map(str::to_string));
        let Some(fa) = self.faqueue.get_mut(id) else {
            return;
        };
        match url {
            Some(url) => {
                let req = HttpReq::post(url.clone(), fa.data.clone());
                fa.url = Some(url);
                fa.state = FaState::Uploading;
                if self.http.post(&req).is_err() {
                    req.fail();
                }
                fa.req = Some(req);
            }
            None => {
                fa.state = FaState::Queued;
            }
        }
    }

    /// The storage server returned the attribute handle.
    fn fa_upload_finished(&mut self, id: u64, body: Vec<u8>) {
        let Some(fa) = self.faqueue.remove(id) else {
            return;
        };
        let handle = mega_core::b64::encode(body.trim_ascii());
        let descriptor = format!("{}*{}", fa.fatype, handle);
        match fa.owner {
            FaOwner::Transfer(transfer) => {
                if let Some(t) = self.transfers.get_mut(transfer) {
                    t.fa_handles.push((fa.fatype, descriptor));
                }
                self.check_fa_completion(transfer);
            }
            FaOwner::Node(node) => {
                self.queue_command(Command::attach_fa(node, &descriptor));
            }
        }
    }

    // -- fetch path --

    /// Requests the payload of an existing file attribute by handle.
    pub fn fetch_file_attr(&mut self, fa_handle: &str) {
        self.queue_command(Command::fa_fetch_url(fa_handle));
    }

    pub(crate) fn fa_fetch_url_result(
        &mut self,
        fa_handle: String,
        result: crate::commands::CmdResult,
    ) {
        let Some(url) = result
            .ok()
            .and_then(|v| v.get("p").and_then(serde_json::Value::as_str).map(str::to_string))
        else {
            return;
        };
        let req = HttpReq::post(url, fa_handle.clone().into_bytes());
        if self.http.post(&req).is_err() {
            req.fail();
        }
        self.faqueue.fetches.push((fa_handle, req));
    }

    fn poll_fa_fetches(&mut self) {
        let mut finished = Vec::new();
        self.faqueue.fetches.retain(|(handle, req)| match req.status() {
            ReqStatus::Success => {
                finished.push((handle.clone(), req.take_response()));
                false
            }
            ReqStatus::Failure => false,
            _ => true,
        });
        for (handle, data) in finished {
            tracing::debug!(bytes = data.len(), "file attribute {handle} fetched");
            self.fa_cache.insert(handle, data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_jam_counting() {
        let mut queue = FileAttrQueue::new();
        for _ in 0..3 {
            queue.push(FaOwner::Transfer(TransferId(1)), 0, vec![0u8; 16]);
        }
        assert_eq!(queue.len(), 3);
        queue.drop_owner(FaOwner::Transfer(TransferId(1)));
        assert!(queue.is_empty());
    }
}
