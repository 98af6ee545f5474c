//! `FileSystemAccess` implementation over std::fs.
//!
//! Directory notifications are implemented as a polling scanner: each
//! `drain` walks the watched tree and diffs (size, mtime) snapshots.
//! Platform watcher integrations can replace this without touching the
//! engine, which only consumes the `DirNotify` contract.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use mega_core::caps::{
    DirNotify, FileRead, FileSystemAccess, FileWrite, FsEntry, FsEntryType,
};

#[derive(Debug, Clone, Default)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    pub fn new() -> Self {
        LocalFileSystem
    }
}

fn mtime_of(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn entry_of(name: String, meta: &fs::Metadata) -> FsEntry {
    FsEntry {
        name,
        etype: if meta.is_dir() {
            FsEntryType::Dir
        } else {
            FsEntryType::File
        },
        size: if meta.is_dir() { 0 } else { meta.len() },
        mtime: mtime_of(meta),
    }
}

struct LocalFileRead {
    file: fs::File,
    size: u64,
    mtime: i64,
}

impl FileRead for LocalFileRead {
    fn size(&self) -> u64 {
        self.size
    }

    fn mtime(&self) -> i64 {
        self.mtime
    }

    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> anyhow::Result<()> {
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.read_exact(buf)?;
        Ok(())
    }
}

struct LocalFileWrite {
    file: fs::File,
}

impl FileWrite for LocalFileWrite {
    fn write_at(&mut self, pos: u64, data: &[u8]) -> anyhow::Result<()> {
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> anyhow::Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }
}

/// Polling change source: diffs (size, mtime) snapshots of the tree.
struct PollingNotify {
    root: PathBuf,
    snapshot: BTreeMap<PathBuf, (u64, i64, bool)>,
    failed: bool,
}

impl PollingNotify {
    fn scan(root: &Path, out: &mut BTreeMap<PathBuf, (u64, i64, bool)>) -> anyhow::Result<()> {
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let entry = entry?;
            let meta = entry.metadata()?;
            let path = entry.path();
            let is_dir = meta.is_dir();
            out.insert(path.clone(), (meta.len(), mtime_of(&meta), is_dir));
            if is_dir {
                Self::scan(&path, out)?;
            }
        }
        Ok(())
    }
}

impl DirNotify for PollingNotify {
    fn drain(&mut self) -> Vec<PathBuf> {
        let mut current = BTreeMap::new();
        if let Err(err) = Self::scan(&self.root, &mut current) {
            tracing::warn!("scan of {} failed: {err}", self.root.display());
            self.failed = true;
            return Vec::new();
        }
        self.failed = false;

        let mut changed = Vec::new();
        for (path, state) in &current {
            if self.snapshot.get(path) != Some(state) {
                changed.push(path.clone());
            }
        }
        for path in self.snapshot.keys() {
            if !current.contains_key(path) {
                changed.push(path.clone());
            }
        }
        self.snapshot = current;
        changed
    }

    fn failed(&self) -> bool {
        self.failed
    }
}

impl FileSystemAccess for LocalFileSystem {
    fn open_read(&self, path: &Path) -> anyhow::Result<Box<dyn FileRead>> {
        let file = fs::File::open(path)?;
        let meta = file.metadata()?;
        Ok(Box::new(LocalFileRead {
            size: meta.len(),
            mtime: mtime_of(&meta),
            file,
        }))
    }

    fn open_write(&self, path: &Path, create: bool) -> anyhow::Result<Box<dyn FileWrite>> {
        let file = fs::OpenOptions::new()
            .write(true)
            .create(create)
            .open(path)?;
        Ok(Box::new(LocalFileWrite { file }))
    }

    fn stat(&self, path: &Path) -> anyhow::Result<Option<FsEntry>> {
        match fs::metadata(path) {
            Ok(meta) => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                Ok(Some(entry_of(name, &meta)))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn list(&self, path: &Path) -> anyhow::Result<Vec<FsEntry>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            out.push(entry_of(entry.file_name().to_string_lossy().into_owned(), &meta));
        }
        Ok(out)
    }

    fn mkdir(&self, path: &Path) -> anyhow::Result<()> {
        fs::create_dir_all(path)?;
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> anyhow::Result<()> {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(from, to)?;
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> anyhow::Result<()> {
        fs::remove_file(path)?;
        Ok(())
    }

    fn remove_dir(&self, path: &Path) -> anyhow::Result<()> {
        fs::remove_dir(path)?;
        Ok(())
    }

    fn set_mtime(&self, path: &Path, mtime: i64) -> anyhow::Result<()> {
        let time = UNIX_EPOCH + std::time::Duration::from_secs(mtime.max(0) as u64);
        let file = fs::OpenOptions::new().write(true).open(path)?;
        file.set_modified(SystemTime::from(time))?;
        Ok(())
    }

    fn fs_id(&self, path: &Path) -> anyhow::Result<u64> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let meta = fs::metadata(path)?;
            Ok(meta.dev())
        }
        #[cfg(not(unix))]
        {
            // No device id available; derive a stable value from the root
            // component so at least drive-letter swaps are caught.
            use std::collections::hash_map::DefaultHasher;
            use std::hash::{Hash, Hasher};
            let mut hasher = DefaultHasher::new();
            path.components().next().hash(&mut hasher);
            Ok(hasher.finish())
        }
    }

    fn notifier(&self, root: &Path) -> anyhow::Result<Box<dyn DirNotify>> {
        let mut snapshot = BTreeMap::new();
        PollingNotify::scan(root, &mut snapshot)?;
        Ok(Box::new(PollingNotify {
            root: root.to_path_buf(),
            snapshot,
            failed: false,
        }))
    }
}

/// Writes a small file atomically (temp file + rename), used for the
/// external-backup drive-id marker.
pub fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("no parent directory for {}", path.display()))?;
    fs::create_dir_all(parent)?;
    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(data)?;
    temp.as_file().sync_all()?;
    temp.persist(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stat_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let fs_access = LocalFileSystem::new();
        fs::write(dir.path().join("a.txt"), b"abc").unwrap();
        fs_access.mkdir(&dir.path().join("sub")).unwrap();

        let entry = fs_access.stat(&dir.path().join("a.txt")).unwrap().unwrap();
        assert_eq!(entry.etype, FsEntryType::File);
        assert_eq!(entry.size, 3);

        let mut names: Vec<String> = fs_access
            .list(dir.path())
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.txt", "sub"]);
        assert!(fs_access.stat(&dir.path().join("missing")).unwrap().is_none());
    }

    #[test]
    fn test_read_write_at() {
        let dir = tempfile::tempdir().unwrap();
        let fs_access = LocalFileSystem::new();
        let path = dir.path().join("f.bin");

        let mut w = fs_access.open_write(&path, true).unwrap();
        w.write_at(0, b"hello world").unwrap();
        w.write_at(6, b"rust!").unwrap();
        drop(w);

        let mut r = fs_access.open_read(&path).unwrap();
        let mut buf = [0u8; 5];
        r.read_at(6, &mut buf).unwrap();
        assert_eq!(&buf, b"rust!");
    }

    #[test]
    fn test_polling_notify_sees_changes() {
        let dir = tempfile::tempdir().unwrap();
        let fs_access = LocalFileSystem::new();
        let mut notify = fs_access.notifier(dir.path()).unwrap();
        assert!(notify.drain().is_empty());

        fs::write(dir.path().join("new.txt"), b"x").unwrap();
        let changed = notify.drain();
        assert_eq!(changed, vec![dir.path().join("new.txt")]);

        fs::remove_file(dir.path().join("new.txt")).unwrap();
        let changed = notify.drain();
        assert_eq!(changed, vec![dir.path().join("new.txt")]);
    }

    #[test]
    fn test_write_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".megabackup").join("drive-id");
        write_atomic(&path, &42u64.to_le_bytes()).unwrap();
        assert_eq!(fs::read(&path).unwrap(), 42u64.to_le_bytes());
    }
}
