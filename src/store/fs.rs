use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use data_encoding::HEXLOWER;

use super::{Key, Store, StoreError};

/// Directory holding lock files, hidden from [`Store::children`].
const LOCK_DIR: &str = ".locks";

/// Prefix of in-flight temporary files, hidden from [`Store::children`].
const TMP_PREFIX: &str = ".tmp-";

/// A [`Store`] laid out as a directory tree: every key is a file path below
/// the store root.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Open (creating if necessary) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StoreError::io(root.display(), e))?;
        debug!("Opened store at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &Key) -> PathBuf {
        let mut path = self.root.clone();
        path.extend(key.segments());
        path
    }

    fn lock_path(&self, key: &Key) -> PathBuf {
        let mut path = self.root.join(LOCK_DIR);
        match key.segments().split_last() {
            Some((last, parents)) => {
                path.extend(parents);
                path.push(format!("{last}.lock"));
            }
            None => path.push("root.lock"),
        }
        path
    }

    /// Write `value` to a fresh temporary file next to `path` and flush it
    /// to disk. Returns the temporary path.
    fn write_temp(&self, key: &Key, path: &Path, value: &[u8]) -> Result<PathBuf, StoreError> {
        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir).map_err(|e| StoreError::io(key, e))?;
        let tmp = dir.join(format!(
            "{TMP_PREFIX}{}",
            HEXLOWER.encode(&rand::random::<[u8; 8]>())
        ));
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp)
            .map_err(|e| StoreError::io(key, e))?;
        let written = file.write_all(value).and_then(|_| file.sync_all());
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(StoreError::io(key, e));
        }
        Ok(tmp)
    }

    fn lock(&self, key: &Key, exclusive: bool) -> Result<FsLock, StoreError> {
        let path = self.lock_path(key);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| StoreError::io(key, e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StoreError::io(key, e))?;
        let locked = if exclusive {
            file.lock()
        } else {
            file.lock_shared()
        };
        locked.map_err(|e| StoreError::io(key, e))?;
        trace!(
            "Acquired {} lock on {key}",
            if exclusive { "exclusive" } else { "shared" }
        );
        Ok(FsLock {
            file,
            key: key.clone(),
        })
    }
}

/// Flush a directory entry change (create, rename, unlink) to disk.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

impl Store for FsStore {
    type Lock = FsLock;

    fn get(&self, key: &Key) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(key, e)),
        }
    }

    fn create(&self, key: &Key, value: &[u8]) -> Result<(), StoreError> {
        let path = self.path(key);
        let tmp = self.write_temp(key, &path, value)?;
        // A hard link fails if the target exists, unlike a rename.
        let linked = fs::hard_link(&tmp, &path);
        let _ = fs::remove_file(&tmp);
        match linked {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(StoreError::AlreadyExists(key.clone()))
            }
            Err(e) => return Err(StoreError::io(key, e)),
        }
        if let Some(dir) = path.parent() {
            sync_dir(dir).map_err(|e| StoreError::io(key, e))?;
        }
        Ok(())
    }

    fn replace(&self, key: &Key, value: &[u8]) -> Result<(), StoreError> {
        let path = self.path(key);
        let tmp = self.write_temp(key, &path, value)?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(StoreError::io(key, e));
        }
        if let Some(dir) = path.parent() {
            sync_dir(dir).map_err(|e| StoreError::io(key, e))?;
        }
        Ok(())
    }

    fn remove(&self, key: &Key) -> Result<bool, StoreError> {
        let path = self.path(key);
        match fs::remove_file(&path) {
            Ok(()) => {
                if let Some(dir) = path.parent() {
                    sync_dir(dir).map_err(|e| StoreError::io(key, e))?;
                }
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(key, e)),
        }
    }

    fn children(&self, key: &Key) -> Result<Vec<String>, StoreError> {
        let entries = match fs::read_dir(self.path(key)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(key, e)),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(key, e))?;
            // Non-UTF-8 names cannot have been written through a `Key`.
            if let Ok(name) = entry.file_name().into_string() {
                if !name.starts_with('.') {
                    names.push(name);
                }
            }
        }
        names.sort_unstable();
        Ok(names)
    }

    fn append_line(&self, key: &Key, line: &str) -> Result<(), StoreError> {
        if line.contains('\n') {
            return Err(StoreError::MultilineEntry(key.clone()));
        }
        let path = self.path(key);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| StoreError::io(key, e))?;
        }
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| StoreError::io(key, e))?;
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        file.write_all(&buf)
            .and_then(|_| file.sync_data())
            .map_err(|e| StoreError::io(key, e))
    }

    fn lines(&self, key: &Key) -> Result<Vec<String>, StoreError> {
        match fs::read_to_string(self.path(key)) {
            Ok(text) => Ok(text
                .lines()
                .filter(|line| !line.is_empty())
                .map(String::from)
                .collect()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(StoreError::io(key, e)),
        }
    }

    fn lock_exclusive(&self, key: &Key) -> Result<FsLock, StoreError> {
        self.lock(key, true)
    }

    fn lock_shared(&self, key: &Key) -> Result<FsLock, StoreError> {
        self.lock(key, false)
    }
}

/// An advisory lock on a lock file, released when dropped (or when the
/// process dies, so a crashed request never wedges a voter).
#[derive(Debug)]
pub struct FsLock {
    file: File,
    key: Key,
}

impl Drop for FsLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!("Failed to release lock on {}: {e}", self.key);
        } else {
            trace!("Released lock on {}", self.key);
        }
    }
}
