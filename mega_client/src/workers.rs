//! A small thread pool for CPU-heavy work (content fingerprinting), the
//! only multi-threaded producer into the loop. Results queue up and are
//! drained at the top of `exec()`; no core data is touched off-thread.

use std::path::PathBuf;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread::JoinHandle;

use mega_core::FileFingerprint;

use crate::sync::{LocalNodeId, SyncId};

/// Results delivered back into the engine thread.
#[derive(Debug)]
pub enum JobResult {
    Fingerprint {
        sync: SyncId,
        local: LocalNodeId,
        path: PathBuf,
        result: anyhow::Result<FileFingerprint>,
    },
}

type Job = Box<dyn FnOnce() -> JobResult + Send>;

pub struct WorkerPool {
    tx: Option<Sender<Job>>,
    results: Receiver<JobResult>,
    threads: Vec<JoinHandle<()>>,
    inflight: usize,
}

impl WorkerPool {
    pub fn new(threads: usize) -> WorkerPool {
        let (tx, rx) = channel::<Job>();
        let (result_tx, results) = channel::<JobResult>();
        let rx = std::sync::Arc::new(std::sync::Mutex::new(rx));

        let threads = (0..threads.max(1))
            .map(|i| {
                let rx = rx.clone();
                let result_tx = result_tx.clone();
                std::thread::Builder::new()
                    .name(format!("mega-worker-{i}"))
                    .spawn(move || {
                        loop {
                            let job = {
                                let guard = rx.lock().expect("worker queue poisoned");
                                guard.recv()
                            };
                            match job {
                                Ok(job) => {
                                    let _ = result_tx.send(job());
                                }
                                Err(_) => break,
                            }
                        }
                    })
                    .expect("spawn worker thread")
            })
            .collect();

        WorkerPool {
            tx: Some(tx),
            results,
            threads,
            inflight: 0,
        }
    }

    pub fn submit(&mut self, job: impl FnOnce() -> JobResult + Send + 'static) {
        if let Some(tx) = &self.tx
            && tx.send(Box::new(job)).is_ok()
        {
            self.inflight += 1;
        }
    }

    /// Non-blocking drain of finished jobs.
    pub fn drain(&mut self) -> Vec<JobResult> {
        let mut out = Vec::new();
        while let Ok(result) = self.results.try_recv() {
            self.inflight -= 1;
            out.push(result);
        }
        out
    }

    pub fn busy(&self) -> bool {
        self.inflight > 0
    }

    /// Discards queued work and stops the threads.
    pub fn shutdown(&mut self) {
        self.tx = None;
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_roundtrip() {
        let mut pool = WorkerPool::new(2);
        for i in 0..4u64 {
            pool.submit(move || JobResult::Fingerprint {
                sync: SyncId(1),
                local: LocalNodeId(i),
                path: PathBuf::from("/x"),
                result: Ok(FileFingerprint::from_bytes(b"data", i as i64)),
            });
        }
        let mut got = 0;
        for _ in 0..200 {
            got += pool.drain().len();
            if got == 4 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(got, 4);
        assert!(!pool.busy());
    }
}
