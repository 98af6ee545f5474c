//! Test support: an in-memory filesystem and a scripted HTTP backend.
//!
//! Both implement the engine capability traits so the whole client loop
//! can be driven deterministically from tests: the scripted backend
//! records every posted request and replies with whatever the test queues
//! next, and the memory filesystem records mutations as notification
//! events the way a real watcher would.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::caps::{
    DirNotify, FileRead, FileSystemAccess, FileWrite, FsEntry, FsEntryType, HttpIo, HttpReq,
};

/// Scripted HTTP transport. Tests pop posted requests and complete them.
#[derive(Clone, Default)]
pub struct ScriptedHttp {
    inner: Arc<Mutex<ScriptedHttpState>>,
}

#[derive(Default)]
struct ScriptedHttpState {
    posted: VecDeque<HttpReq>,
}

impl ScriptedHttp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the oldest posted request, if any.
    pub fn pop_request(&self) -> Option<HttpReq> {
        self.inner.lock().unwrap().posted.pop_front()
    }

    /// Takes the oldest posted request whose URL contains `needle`.
    pub fn pop_request_matching(&self, needle: &str) -> Option<HttpReq> {
        let mut state = self.inner.lock().unwrap();
        let idx = state.posted.iter().position(|r| r.url().contains(needle))?;
        state.posted.remove(idx)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().posted.len()
    }

    /// Completes a request with a body and HTTP 200.
    pub fn respond(&self, req: &HttpReq, body: &[u8]) {
        req.append_response(body);
        req.finish(200);
    }

    pub fn respond_status(&self, req: &HttpReq, status: u16, body: &[u8]) {
        req.append_response(body);
        req.finish(status);
    }

    pub fn fail_transport(&self, req: &HttpReq) {
        req.fail();
    }
}

impl HttpIo for ScriptedHttp {
    fn post(&self, req: &HttpReq) -> anyhow::Result<()> {
        req.mark_inflight();
        self.inner.lock().unwrap().posted.push_back(req.clone());
        Ok(())
    }

    fn cancel(&self, req: &HttpReq) {
        let mut state = self.inner.lock().unwrap();
        state.posted.retain(|r| !r.same_as(req));
        req.fail();
    }

    fn wait_io(&self, _max: Duration) {
        // Nothing to wait for; tests drive completions synchronously.
    }
}

#[derive(Debug, Clone)]
enum MemEntry {
    File { data: Vec<u8>, mtime: i64 },
    Dir,
}

#[derive(Debug, Default)]
struct MemFsState {
    entries: BTreeMap<PathBuf, MemEntry>,
    events: Vec<PathBuf>,
    fs_id: u64,
    notify_failed: bool,
}

/// In-memory [`FileSystemAccess`], with mutation events recorded for the
/// notifier so sync tests see realistic change streams.
#[derive(Clone, Default)]
pub struct MemFileSystem {
    inner: Arc<Mutex<MemFsState>>,
}

impl MemFileSystem {
    pub fn new() -> Self {
        let fs = Self::default();
        fs.inner.lock().unwrap().fs_id = 1;
        fs
    }

    pub fn set_fs_id(&self, id: u64) {
        self.inner.lock().unwrap().fs_id = id;
    }

    pub fn set_notify_failed(&self, failed: bool) {
        self.inner.lock().unwrap().notify_failed = failed;
    }

    pub fn write_file(&self, path: impl AsRef<Path>, data: &[u8], mtime: i64) {
        let path = path.as_ref().to_path_buf();
        let mut st = self.inner.lock().unwrap();
        st.entries.insert(
            path.clone(),
            MemEntry::File {
                data: data.to_vec(),
                mtime,
            },
        );
        st.events.push(path);
    }

    pub fn make_dir(&self, path: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        let mut st = self.inner.lock().unwrap();
        st.entries.insert(path.clone(), MemEntry::Dir);
        st.events.push(path);
    }

    pub fn delete(&self, path: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        let mut st = self.inner.lock().unwrap();
        st.entries.retain(|p, _| !p.starts_with(&path));
        st.events.push(path);
    }

    pub fn read_file(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        let st = self.inner.lock().unwrap();
        match st.entries.get(path.as_ref()) {
            Some(MemEntry::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.inner.lock().unwrap().entries.contains_key(path.as_ref())
    }

    fn entry_info(path: &Path, entry: &MemEntry) -> FsEntry {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match entry {
            MemEntry::File { data, mtime } => FsEntry {
                name,
                etype: FsEntryType::File,
                size: data.len() as u64,
                mtime: *mtime,
            },
            MemEntry::Dir => FsEntry {
                name,
                etype: FsEntryType::Dir,
                size: 0,
                mtime: 0,
            },
        }
    }
}

struct MemFileRead {
    data: Vec<u8>,
    mtime: i64,
}

impl FileRead for MemFileRead {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn mtime(&self) -> i64 {
        self.mtime
    }

    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> anyhow::Result<()> {
        let pos = pos as usize;
        if pos + buf.len() > self.data.len() {
            anyhow::bail!("read past end of file");
        }
        buf.copy_from_slice(&self.data[pos..pos + buf.len()]);
        Ok(())
    }
}

struct MemFileWrite {
    fs: MemFileSystem,
    path: PathBuf,
}

impl FileWrite for MemFileWrite {
    fn write_at(&mut self, pos: u64, data: &[u8]) -> anyhow::Result<()> {
        let mut st = self.fs.inner.lock().unwrap();
        let entry = st
            .entries
            .entry(self.path.clone())
            .or_insert(MemEntry::File {
                data: Vec::new(),
                mtime: 0,
            });
        let MemEntry::File { data: file, .. } = entry else {
            anyhow::bail!("not a file: {}", self.path.display());
        };
        let end = pos as usize + data.len();
        if file.len() < end {
            file.resize(end, 0);
        }
        file[pos as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> anyhow::Result<()> {
        let mut st = self.fs.inner.lock().unwrap();
        if let Some(MemEntry::File { data, .. }) = st.entries.get_mut(&self.path) {
            data.truncate(len as usize);
        }
        Ok(())
    }
}

struct MemNotify {
    fs: MemFileSystem,
    root: PathBuf,
    cursor: usize,
}

impl DirNotify for MemNotify {
    fn drain(&mut self) -> Vec<PathBuf> {
        let st = self.fs.inner.lock().unwrap();
        let fresh: Vec<PathBuf> = st.events[self.cursor..]
            .iter()
            .filter(|p| p.starts_with(&self.root))
            .cloned()
            .collect();
        self.cursor = st.events.len();
        fresh
    }

    fn failed(&self) -> bool {
        self.fs.inner.lock().unwrap().notify_failed
    }
}

impl FileSystemAccess for MemFileSystem {
    fn open_read(&self, path: &Path) -> anyhow::Result<Box<dyn FileRead>> {
        let st = self.inner.lock().unwrap();
        match st.entries.get(path) {
            Some(MemEntry::File { data, mtime }) => Ok(Box::new(MemFileRead {
                data: data.clone(),
                mtime: *mtime,
            })),
            _ => anyhow::bail!("no such file: {}", path.display()),
        }
    }

    fn open_write(&self, path: &Path, create: bool) -> anyhow::Result<Box<dyn FileWrite>> {
        {
            let mut st = self.inner.lock().unwrap();
            if !st.entries.contains_key(path) {
                if !create {
                    anyhow::bail!("no such file: {}", path.display());
                }
                st.entries.insert(
                    path.to_path_buf(),
                    MemEntry::File {
                        data: Vec::new(),
                        mtime: 0,
                    },
                );
            }
        }
        Ok(Box::new(MemFileWrite {
            fs: self.clone(),
            path: path.to_path_buf(),
        }))
    }

    fn stat(&self, path: &Path) -> anyhow::Result<Option<FsEntry>> {
        let st = self.inner.lock().unwrap();
        Ok(st.entries.get(path).map(|e| Self::entry_info(path, e)))
    }

    fn list(&self, path: &Path) -> anyhow::Result<Vec<FsEntry>> {
        let st = self.inner.lock().unwrap();
        let mut out = Vec::new();
        for (p, e) in &st.entries {
            if p.parent() == Some(path) {
                out.push(Self::entry_info(p, e));
            }
        }
        Ok(out)
    }

    fn mkdir(&self, path: &Path) -> anyhow::Result<()> {
        let mut st = self.inner.lock().unwrap();
        st.entries.insert(path.to_path_buf(), MemEntry::Dir);
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> anyhow::Result<()> {
        let mut st = self.inner.lock().unwrap();
        let moved: Vec<(PathBuf, MemEntry)> = st
            .entries
            .iter()
            .filter(|(p, _)| p.starts_with(from))
            .map(|(p, e)| (p.clone(), e.clone()))
            .collect();
        if moved.is_empty() {
            anyhow::bail!("no such path: {}", from.display());
        }
        st.entries.retain(|p, _| !p.starts_with(from));
        for (p, e) in moved {
            let suffix = p.strip_prefix(from).expect("filtered by starts_with");
            st.entries.insert(to.join(suffix), e);
        }
        st.events.push(from.to_path_buf());
        st.events.push(to.to_path_buf());
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> anyhow::Result<()> {
        let mut st = self.inner.lock().unwrap();
        st.entries.remove(path);
        st.events.push(path.to_path_buf());
        Ok(())
    }

    fn remove_dir(&self, path: &Path) -> anyhow::Result<()> {
        self.remove_file(path)
    }

    fn set_mtime(&self, path: &Path, mtime: i64) -> anyhow::Result<()> {
        let mut st = self.inner.lock().unwrap();
        if let Some(MemEntry::File { mtime: m, .. }) = st.entries.get_mut(path) {
            *m = mtime;
        }
        Ok(())
    }

    fn fs_id(&self, _path: &Path) -> anyhow::Result<u64> {
        Ok(self.inner.lock().unwrap().fs_id)
    }

    fn notifier(&self, root: &Path) -> anyhow::Result<Box<dyn DirNotify>> {
        let cursor = self.inner.lock().unwrap().events.len();
        Ok(Box::new(MemNotify {
            fs: self.clone(),
            root: root.to_path_buf(),
            cursor,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_fs_basics() {
        let fs = MemFileSystem::new();
        fs.make_dir("/root");
        fs.write_file("/root/a.txt", b"hello", 10);
        let entry = fs.stat(Path::new("/root/a.txt")).unwrap().unwrap();
        assert_eq!(entry.size, 5);
        assert_eq!(entry.mtime, 10);
        assert_eq!(fs.list(Path::new("/root")).unwrap().len(), 1);
    }

    #[test]
    fn test_mem_fs_notify() {
        let fs = MemFileSystem::new();
        fs.make_dir("/watched");
        let mut notify = fs.notifier(Path::new("/watched")).unwrap();
        assert!(notify.drain().is_empty());
        fs.write_file("/watched/x", b"1", 1);
        fs.write_file("/elsewhere", b"1", 1);
        let events = notify.drain();
        assert_eq!(events, vec![PathBuf::from("/watched/x")]);
    }

    #[test]
    fn test_mem_fs_rename_subtree() {
        let fs = MemFileSystem::new();
        fs.make_dir("/a");
        fs.write_file("/a/f", b"x", 1);
        fs.rename(Path::new("/a"), Path::new("/b")).unwrap();
        assert!(!fs.exists("/a/f"));
        assert_eq!(fs.read_file("/b/f").unwrap(), b"x");
    }

    #[test]
    fn test_scripted_http() {
        let http = ScriptedHttp::new();
        let req = HttpReq::post("https://api.test/cs?id=1", b"[]".to_vec());
        http.post(&req).unwrap();
        let posted = http.pop_request().unwrap();
        http.respond(&posted, b"[0]");
        assert_eq!(req.take_response(), b"[0]");
    }
}
