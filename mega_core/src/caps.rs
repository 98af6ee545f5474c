//! Capability traits through which the engine reaches the outside world:
//! HTTP transport, the local filesystem, the cache database and the media
//! thumbnailer. The engine itself never touches a socket, a file
//! descriptor or a database handle directly, which is what makes the
//! whole loop drivable from tests.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Observable state of an HTTP request handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqStatus {
    /// Created but not yet handed to the backend.
    Prepared,
    /// Posted; the backend owns it until completion.
    Inflight,
    /// Completed with an HTTP status; body available.
    Success,
    /// Transport-level failure (no HTTP status).
    Failure,
}

#[derive(Debug)]
pub struct ReqState {
    pub status: ReqStatus,
    pub http_status: u16,
    pub response: Vec<u8>,
    pub content_length: Option<u64>,
    /// Instant of the most recent byte in either direction, for timeouts.
    pub last_data: Option<Instant>,
    /// Set by backends when the failure was a TLS pin/verification error.
    pub ssl_failure: bool,
}

/// A pollable HTTP request. The engine creates one, hands it to the
/// [`HttpIo`] backend via `post` and then polls `status()` from `exec()`
/// ticks; the backend fills the shared state from its own threads.
#[derive(Debug, Clone)]
pub struct HttpReq {
    inner: Arc<HttpReqInner>,
}

#[derive(Debug)]
struct HttpReqInner {
    url: String,
    body: Vec<u8>,
    state: Mutex<ReqState>,
}

impl HttpReq {
    pub fn post(url: impl Into<String>, body: Vec<u8>) -> HttpReq {
        HttpReq {
            inner: Arc::new(HttpReqInner {
                url: url.into(),
                body,
                state: Mutex::new(ReqState {
                    status: ReqStatus::Prepared,
                    http_status: 0,
                    response: Vec::new(),
                    content_length: None,
                    last_data: None,
                    ssl_failure: false,
                }),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Identity comparison: two handles to the same underlying request.
    pub fn same_as(&self, other: &HttpReq) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn state(&self) -> MutexGuard<'_, ReqState> {
        self.inner.state.lock().expect("http state poisoned")
    }

    pub fn status(&self) -> ReqStatus {
        self.state().status
    }

    pub fn http_status(&self) -> u16 {
        self.state().http_status
    }

    /// Moves the response body out, leaving the request finished-empty.
    pub fn take_response(&self) -> Vec<u8> {
        std::mem::take(&mut self.state().response)
    }

    pub fn bytes_received(&self) -> usize {
        self.state().response.len()
    }

    /// Seconds since the last byte moved, or since the post if none did.
    pub fn idle_time(&self) -> Option<Duration> {
        self.state().last_data.map(|t| t.elapsed())
    }

    // Backend-side helpers.

    pub fn mark_inflight(&self) {
        let mut st = self.state();
        st.status = ReqStatus::Inflight;
        st.last_data = Some(Instant::now());
    }

    pub fn append_response(&self, data: &[u8]) {
        let mut st = self.state();
        st.response.extend_from_slice(data);
        st.last_data = Some(Instant::now());
    }

    pub fn finish(&self, http_status: u16) {
        let mut st = self.state();
        st.http_status = http_status;
        st.status = ReqStatus::Success;
        st.last_data = Some(Instant::now());
    }

    pub fn fail(&self) {
        let mut st = self.state();
        st.status = ReqStatus::Failure;
        st.last_data = Some(Instant::now());
    }
}

/// HTTP transport capability. Implementations own their connection pools
/// and threads; `wait_io` is how the main loop sleeps until either a
/// request makes progress or the timeout elapses.
pub trait HttpIo: Send {
    fn post(&self, req: &HttpReq) -> anyhow::Result<()>;

    /// Aborts an in-flight request. The request transitions to `Failure`.
    fn cancel(&self, req: &HttpReq);

    /// Blocks the calling thread until I/O progress or `max` elapses.
    fn wait_io(&self, max: Duration);
}

/// Entry type as reported by the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEntryType {
    File,
    Dir,
}

#[derive(Debug, Clone)]
pub struct FsEntry {
    pub name: String,
    pub etype: FsEntryType,
    pub size: u64,
    pub mtime: i64,
}

/// Random-access read handle.
pub trait FileRead: Send {
    fn size(&self) -> u64;
    fn mtime(&self) -> i64;
    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> anyhow::Result<()>;
}

/// Random-access write handle.
pub trait FileWrite: Send {
    fn write_at(&mut self, pos: u64, data: &[u8]) -> anyhow::Result<()>;
    fn truncate(&mut self, len: u64) -> anyhow::Result<()>;
}

/// Raw change notifications from a watched directory tree. The engine
/// keeps its own coalescing queues on top; `failed` reports watcher
/// overflow, which forces a full rescan.
pub trait DirNotify: Send {
    fn drain(&mut self) -> Vec<PathBuf>;
    fn failed(&self) -> bool;
}

/// Local filesystem capability. `Sync` so the worker pool can share the
/// handle for off-thread fingerprinting.
pub trait FileSystemAccess: Send + Sync {
    fn open_read(&self, path: &Path) -> anyhow::Result<Box<dyn FileRead>>;
    fn open_write(&self, path: &Path, create: bool) -> anyhow::Result<Box<dyn FileWrite>>;
    /// `Ok(None)` means the path does not exist.
    fn stat(&self, path: &Path) -> anyhow::Result<Option<FsEntry>>;
    fn list(&self, path: &Path) -> anyhow::Result<Vec<FsEntry>>;
    fn mkdir(&self, path: &Path) -> anyhow::Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> anyhow::Result<()>;
    fn remove_file(&self, path: &Path) -> anyhow::Result<()>;
    fn remove_dir(&self, path: &Path) -> anyhow::Result<()>;
    fn set_mtime(&self, path: &Path, mtime: i64) -> anyhow::Result<()>;
    /// Volume identity for the path: mount/device derived, stable while
    /// the same filesystem stays mounted. Used as the sync `fsfp`.
    fn fs_id(&self, path: &Path) -> anyhow::Result<u64>;
    fn notifier(&self, root: &Path) -> anyhow::Result<Box<dyn DirNotify>>;
}

/// Record-kind tag stored in the low four bits of a cache record id.
pub const DB_KIND_BITS: u64 = 4;
pub const DB_KIND_MASK: u64 = (1 << DB_KIND_BITS) - 1;

pub fn db_record_kind(id: u64) -> u8 {
    (id & DB_KIND_MASK) as u8
}

/// A keyed record table inside one cache database. All mutations happen
/// inside the single long-lived transaction opened by `begin`; `commit`
/// is only called when the SC cursor advances, so the tree and the cursor
/// stay crash-consistent.
pub trait DbTable: Send {
    fn rewind(&mut self);
    fn next_record(&mut self) -> anyhow::Result<Option<(u64, Vec<u8>)>>;
    fn put(&mut self, id: u64, data: &[u8]) -> anyhow::Result<()>;
    fn del(&mut self, id: u64) -> anyhow::Result<()>;
    fn truncate(&mut self) -> anyhow::Result<()>;
    fn begin(&mut self) -> anyhow::Result<()>;
    fn commit(&mut self) -> anyhow::Result<()>;
    fn abort(&mut self);
    fn in_transaction(&self) -> bool;
    /// Allocates a fresh record id carrying `kind` in its low bits.
    fn next_id(&mut self, kind: u8) -> u64;
}

/// Cache database provider; one database per logged-in session.
pub trait DbAccess: Send {
    fn open(&self, name: &str) -> anyhow::Result<Box<dyn DbTable>>;
}

/// Media kinds produced for file attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GfxSize {
    /// Square crop, small.
    Thumbnail,
    /// Bounded fit, larger.
    Preview,
}

/// Thumbnailer capability.
pub trait GfxProc: Send {
    fn is_graphic(&self, path: &Path) -> bool;
    fn generate(&self, path: &Path, size: GfxSize) -> anyhow::Result<Vec<u8>>;
}

/// A thumbnailer that handles nothing; uploads then carry no previews.
#[derive(Debug, Default)]
pub struct NullGfx;

impl GfxProc for NullGfx {
    fn is_graphic(&self, _path: &Path) -> bool {
        false
    }

    fn generate(&self, _path: &Path, _size: GfxSize) -> anyhow::Result<Vec<u8>> {
        anyhow::bail!("no media support compiled in")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_req_lifecycle() {
        let req = HttpReq::post("https://example.test/cs", b"[]".to_vec());
        assert_eq!(req.status(), ReqStatus::Prepared);
        req.mark_inflight();
        req.append_response(b"[0]");
        req.finish(200);
        assert_eq!(req.status(), ReqStatus::Success);
        assert_eq!(req.http_status(), 200);
        assert_eq!(req.take_response(), b"[0]");
        assert!(req.take_response().is_empty());
    }

    #[test]
    fn test_record_kind_extraction() {
        let id = (42 << DB_KIND_BITS) | 3;
        assert_eq!(db_record_kind(id), 3);
    }
}
