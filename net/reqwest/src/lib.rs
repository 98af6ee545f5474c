//! `HttpIo` implementation over reqwest.
//!
//! The engine core is a synchronous cooperative loop; this crate bridges
//! it to async HTTP by running a private tokio runtime. Each `post`
//! spawns a task that streams the response into the shared request state,
//! and every completion or received chunk rings a condvar so the engine's
//! `wait()` wakes up exactly when there is something to process.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use mega_core::caps::{HttpIo, HttpReq, ReqStatus};

/// Signal shared between backend tasks and the waiting engine thread.
#[derive(Default)]
struct IoSignal {
    counter: Mutex<u64>,
    condvar: Condvar,
}

impl IoSignal {
    fn ring(&self) {
        let mut counter = self.counter.lock().expect("io signal poisoned");
        *counter += 1;
        self.condvar.notify_all();
    }

    fn wait(&self, max: Duration) {
        let counter = self.counter.lock().expect("io signal poisoned");
        let start = *counter;
        let _unused = self
            .condvar
            .wait_timeout_while(counter, max, |c| *c == start);
    }
}

pub struct ReqwestHttpIo {
    runtime: tokio::runtime::Runtime,
    client: reqwest::Client,
    signal: Arc<IoSignal>,
}

impl ReqwestHttpIo {
    pub fn new() -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .thread_name("mega-http")
            .build()?;
        Ok(ReqwestHttpIo {
            runtime,
            client: reqwest::Client::new(),
            signal: Arc::new(IoSignal::default()),
        })
    }
}

impl HttpIo for ReqwestHttpIo {
    fn post(&self, req: &HttpReq) -> anyhow::Result<()> {
        req.mark_inflight();
        let client = self.client.clone();
        let signal = self.signal.clone();
        let handle = req.clone();
        let url = req.url().to_string();
        let body = req.body().to_vec();

        self.runtime.spawn(async move {
            let result = client.post(&url).body(body).send().await;
            match result {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if let Some(len) = response.content_length() {
                        handle.state().content_length = Some(len);
                    }
                    let mut response = response;
                    loop {
                        match response.chunk().await {
                            Ok(Some(chunk)) => {
                                // A cancel may have raced us; stop feeding it.
                                if handle.status() != ReqStatus::Inflight {
                                    return;
                                }
                                handle.append_response(&chunk);
                                signal.ring();
                            }
                            Ok(None) => break,
                            Err(err) => {
                                tracing::debug!("http body error for {url}: {err}");
                                handle.fail();
                                signal.ring();
                                return;
                            }
                        }
                    }
                    if handle.status() == ReqStatus::Inflight {
                        handle.finish(status);
                    }
                    signal.ring();
                }
                Err(err) => {
                    tracing::debug!("http post failed for {url}: {err}");
                    handle.fail();
                    signal.ring();
                }
            }
        });
        Ok(())
    }

    fn cancel(&self, req: &HttpReq) {
        // The spawned task notices the state change and stops writing.
        req.fail();
        self.signal.ring();
    }

    fn wait_io(&self, max: Duration) {
        self.signal.wait(max);
    }
}
