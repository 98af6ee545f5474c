//! The CS request dispatcher: batches queued commands into a single
//! in-flight POST, demultiplexes the positional response array, and owns
//! the retry/backoff and lock-probe machinery.
//!
//! At most one CS request is in flight at any time. The request id is
//! server-deduplicated, so a connectivity failure retries the exact same
//! POST; the id bumps only once a batch resolves.

use std::collections::VecDeque;
use std::time::Duration;

use serde_json::Value;

use mega_core::caps::ReqStatus;
use mega_core::{ApiError, BackoffTimer, HttpReq};

use crate::client::MegaClient;
use crate::commands::{Command, element_result};
use crate::consts::REQUEST_TIMEOUT_DS;

const REQID_LEN: usize = 10;

/// Renders the request id counter base-36, zero-padded.
fn render_reqid(counter: u64) -> String {
    const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut out = [b'0'; REQID_LEN];
    let mut value = counter;
    for slot in out.iter_mut().rev() {
        *slot = ALPHABET[(value % 36) as usize];
        value /= 36;
    }
    String::from_utf8_lossy(&out).into_owned()
}

struct Inflight {
    cmds: Vec<Command>,
    url: String,
    body: Vec<u8>,
    req: Option<HttpReq>,
}

pub struct ReqDispatcher {
    pending: VecDeque<Command>,
    inflight: Option<Inflight>,
    pub bt: BackoffTimer,
    reqid: u64,
    probe: Option<HttpReq>,
    /// Retry instead of surfacing on SSL verification failures.
    pub retry_essl: bool,
}

impl ReqDispatcher {
    pub fn new(reqid_seed: u64) -> ReqDispatcher {
        let mut bt = BackoffTimer::new();
        bt.arm(0);
        ReqDispatcher {
            pending: VecDeque::new(),
            inflight: None,
            bt,
            reqid: reqid_seed,
            probe: None,
            retry_essl: false,
        }
    }

    pub fn queue(&mut self, cmd: Command) {
        self.pending.push_back(cmd);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.as_ref().map_or(0, |i| i.cmds.len())
    }

    pub fn idle(&self) -> bool {
        self.inflight.is_none() && self.pending.is_empty()
    }

    /// True while a bulk fetch-nodes response may be in flight.
    fn inflight_has_fetchnodes(&self) -> bool {
        self.inflight
            .as_ref()
            .is_some_and(|i| i.cmds.iter().any(|c| c.batchable_with_fetchnodes))
    }
}

impl MegaClient {
    pub(crate) fn queue_command(&mut self, cmd: Command) {
        self.reqs.queue(cmd);
        self.loop_requested = true;
    }

    /// One dispatcher tick: polls the in-flight request, runs the lock
    /// probe, and posts the next batch when armed.
    pub(crate) fn exec_cs(&mut self) {
        let now = self.now_ds();

        if self.reqs.inflight.is_some() {
            self.poll_inflight_cs(now);
        }

        let can_post = self.reqs.inflight.as_ref().is_none_or(|i| i.req.is_none());
        if can_post && self.reqs.bt.armed(now) && !self.blocked {
            if self.reqs.inflight.is_some() {
                self.repost_cs();
            } else if !self.reqs.pending.is_empty() {
                self.post_new_batch();
            }
        }
    }

    fn cs_url(&self) -> String {
        let mut url = format!(
            "{}cs?id={}{}",
            self.api_url,
            render_reqid(self.reqs.reqid),
            self.auth_suffix(),
        );
        if !self.app_key.is_empty() {
            url.push_str("&ak=");
            url.push_str(&self.app_key);
        }
        url.push_str("&v=2");
        if let Some(lang) = &self.lang {
            url.push_str("&lang=");
            url.push_str(lang);
        }
        url
    }

    fn post_new_batch(&mut self) {
        let cmds: Vec<Command> = self.reqs.pending.drain(..).collect();
        let batch: Vec<&Value> = cmds.iter().map(|c| &c.json).collect();
        let body = serde_json::to_vec(&batch).expect("commands serialize");
        let url = self.cs_url();
        tracing::debug!(n = cmds.len(), "posting CS batch");
        let req = HttpReq::post(url.clone(), body.clone());
        if let Err(err) = self.http.post(&req) {
            tracing::warn!("CS post failed to start: {err}");
            req.fail();
        }
        self.reqs.inflight = Some(Inflight {
            cmds,
            url,
            body,
            req: Some(req),
        });
    }

    /// Retries the exact same POST (same request id) after backoff.
    fn repost_cs(&mut self) {
        let Some(infl) = &mut self.reqs.inflight else {
            return;
        };
        let req = HttpReq::post(infl.url.clone(), infl.body.clone());
        if let Err(err) = self.http.post(&req) {
            tracing::warn!("CS repost failed to start: {err}");
            req.fail();
        }
        infl.req = Some(req);
    }

    fn poll_inflight_cs(&mut self, now: mega_core::Ds) {
        let Some(req) = self.reqs.inflight.as_ref().and_then(|i| i.req.clone()) else {
            return;
        };
        match req.status() {
            ReqStatus::Prepared | ReqStatus::Inflight => self.check_cs_timeout(&req),
            ReqStatus::Success => {
                self.reqs.probe = None;
                let status = req.http_status();
                let body = req.take_response();
                self.process_cs_response(now, status, body);
            }
            ReqStatus::Failure => {
                self.reqs.probe = None;
                let ssl = req.state().ssl_failure;
                if ssl && !self.reqs.retry_essl {
                    tracing::error!("SSL verification failed on CS channel");
                    self.abort_batch(ApiError::Ssl);
                } else {
                    tracing::debug!("CS connectivity failure, backing off");
                    self.retry_batch(now);
                }
            }
        }
    }

    /// No data for too long: probe whether the server is actually busy
    /// working our request or we lost the connection silently.
    fn check_cs_timeout(&mut self, req: &HttpReq) {
        let idle = req.idle_time().unwrap_or_default();
        let timeout = Duration::from_millis(u64::from(REQUEST_TIMEOUT_DS) * 100);
        if idle < timeout || self.reqs.inflight_has_fetchnodes() {
            return;
        }

        match &self.reqs.probe {
            None => {
                let url = format!("{}cs?{}&wlt=1", self.api_url, self.auth_suffix());
                let probe = HttpReq::post(url, Vec::new());
                if self.http.post(&probe).is_ok() {
                    tracing::debug!("CS stalled, sending lock probe");
                    self.reqs.probe = Some(probe);
                }
            }
            Some(probe) => match probe.status() {
                ReqStatus::Success => {
                    let body = probe.take_response();
                    self.reqs.probe = None;
                    if body == b"1" {
                        // Server idle: the request is lost; reconnect.
                        tracing::debug!("lock probe: server idle, reconnecting CS");
                        self.http.cancel(req);
                        if let Some(infl) = &mut self.reqs.inflight {
                            infl.req = None;
                        }
                        let now = self.now_ds();
                        self.reqs.bt.arm(now);
                    } else {
                        // Server busy on our behalf: keep waiting.
                        req.state().last_data = Some(std::time::Instant::now());
                    }
                }
                ReqStatus::Failure => {
                    self.reqs.probe = None;
                }
                _ => {}
            },
        }
    }

    fn process_cs_response(&mut self, now: mega_core::Ds, status: u16, body: Vec<u8>) {
        if status == 500 {
            tracing::debug!("CS server busy (500)");
            self.retry_batch(now);
            return;
        }
        if status != 200 {
            tracing::debug!(status, "unexpected CS status");
            self.retry_batch(now);
            return;
        }

        let trimmed = body.trim_ascii();
        if trimmed == b"-3" || trimmed == b"-4" {
            tracing::debug!("CS lock/rate retry requested");
            self.retry_batch(now);
            return;
        }

        match serde_json::from_slice::<Value>(trimmed) {
            Ok(Value::Array(elements)) => self.finish_batch(elements),
            Ok(Value::Number(num)) => {
                let code = num.as_i64().unwrap_or(-1) as i32;
                if code < 0 {
                    self.abort_batch(ApiError::from_code(code));
                } else {
                    self.finish_batch(vec![Value::Number(num)]);
                }
            }
            Ok(Value::Object(obj)) => {
                let code = obj.get("err").and_then(Value::as_i64).unwrap_or(-1) as i32;
                self.abort_batch(ApiError::from_code(code));
            }
            Ok(other) => {
                tracing::warn!("unparseable CS payload: {other}");
                self.retry_batch(now);
            }
            Err(err) => {
                tracing::warn!("CS response not JSON: {err}");
                self.retry_batch(now);
            }
        }
    }

    /// Completes each command with its positional element.
    fn finish_batch(&mut self, elements: Vec<Value>) {
        let Some(infl) = self.reqs.inflight.take() else {
            return;
        };
        let mut elements = elements.into_iter();
        for cmd in infl.cmds {
            let result = match elements.next() {
                Some(element) => element_result(element),
                None => Err(ApiError::Internal),
            };
            self.complete_command(cmd, result);
        }
        self.reqs.reqid += 1;
        let now = self.now_ds();
        self.reqs.bt.reset();
        self.reqs.bt.arm(now);
        self.loop_requested = true;
    }

    /// A top-level error aborts every command in the batch.
    fn abort_batch(&mut self, err: ApiError) {
        tracing::warn!("CS batch aborted: {err}");
        match err {
            ApiError::Sid => self.session_died(err),
            ApiError::Blocked => self.enter_blocked_state(),
            _ => {}
        }
        let Some(infl) = self.reqs.inflight.take() else {
            return;
        };
        for cmd in infl.cmds {
            self.complete_command(cmd, Err(err));
        }
        self.reqs.reqid += 1;
        let now = self.now_ds();
        self.reqs.bt.reset();
        self.reqs.bt.arm(now);
    }

    /// Keeps the batch, backs off, and retries the identical POST later.
    fn retry_batch(&mut self, now: mega_core::Ds) {
        if let Some(infl) = &mut self.reqs.inflight {
            infl.req = None;
        }
        self.reqs.bt.backoff(now, &mut self.rng);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reqid_rendering() {
        assert_eq!(render_reqid(0), "0000000000");
        assert_eq!(render_reqid(35), "000000000z");
        assert_eq!(render_reqid(36), "0000000010");
        // monotonic in lexicographic order too
        assert!(render_reqid(100) < render_reqid(101));
    }
}
