//! A POSIX filesystem backend.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use walkdir::WalkDir;

use crate::error::StorageError;
use crate::uri::Uri;
use crate::vfs::{LockToken, VfsBackend};

/// Backend for `file://` URIs and bare paths.
pub struct PosixBackend {
    // Held lock files, keyed by token. The File must stay open for the
    // advisory lock to remain held.
    locks: Mutex<HashMap<u64, File>>,
    next_token: AtomicU64,
}

impl PosixBackend {
    /// Create a new POSIX backend.
    #[must_use]
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }
}

impl Default for PosixBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl VfsBackend for PosixBackend {
    fn create_dir(&self, uri: &Uri) -> Result<(), StorageError> {
        let path = uri.to_path();
        if path.exists() {
            return Err(StorageError::AlreadyExists(uri.to_string()));
        }
        std::fs::create_dir_all(&path).map_err(|err| StorageError::from_io(err, uri.as_str()))
    }

    fn remove_dir(&self, uri: &Uri) -> Result<(), StorageError> {
        std::fs::remove_dir_all(uri.to_path())
            .map_err(|err| StorageError::from_io(err, uri.as_str()))
    }

    fn move_dir(&self, old_uri: &Uri, new_uri: &Uri) -> Result<(), StorageError> {
        std::fs::rename(old_uri.to_path(), new_uri.to_path())
            .map_err(|err| StorageError::from_io(err, old_uri.as_str()))
    }

    fn touch(&self, uri: &Uri) -> Result<(), StorageError> {
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(uri.to_path())
            .map(|_| ())
            .map_err(|err| StorageError::from_io(err, uri.as_str()))
    }

    fn remove_file(&self, uri: &Uri) -> Result<(), StorageError> {
        std::fs::remove_file(uri.to_path())
            .map_err(|err| StorageError::from_io(err, uri.as_str()))
    }

    fn is_file(&self, uri: &Uri) -> Result<bool, StorageError> {
        Ok(uri.to_path().is_file())
    }

    fn is_dir(&self, uri: &Uri) -> Result<bool, StorageError> {
        Ok(uri.to_path().is_dir())
    }

    fn ls(&self, uri: &Uri) -> Result<Vec<Uri>, StorageError> {
        let dir = std::fs::read_dir(uri.to_path())
            .map_err(|err| StorageError::from_io(err, uri.as_str()))?;
        let mut names = Vec::new();
        for entry in dir {
            let entry = entry.map_err(StorageError::IOError)?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                return Err(StorageError::InvalidUri(format!(
                    "{uri}: non-UTF-8 child name"
                )));
            };
            names.push(name.to_string());
        }
        names.sort_unstable();
        Ok(names.iter().map(|name| uri.join(name)).collect())
    }

    fn read(&self, uri: &Uri, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        let mut file =
            File::open(uri.to_path()).map_err(|err| StorageError::from_io(err, uri.as_str()))?;
        file.seek(SeekFrom::Start(offset)).map_err(StorageError::IOError)?;
        file.read_exact(buf).map_err(StorageError::IOError)
    }

    fn write(&self, uri: &Uri, data: &[u8]) -> Result<(), StorageError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(uri.to_path())
            .map_err(|err| StorageError::from_io(err, uri.as_str()))?;
        file.write_all(data).map_err(StorageError::IOError)
    }

    fn dir_size(&self, uri: &Uri) -> Result<u64, StorageError> {
        let mut size = 0;
        for entry in WalkDir::new(uri.to_path()) {
            let entry = entry.map_err(|err| StorageError::Internal(err.to_string()))?;
            if entry.path().is_file() {
                size += entry
                    .metadata()
                    .map_err(|err| StorageError::Internal(err.to_string()))?
                    .len();
            }
        }
        Ok(size)
    }

    fn close_file(&self, _uri: &Uri) -> Result<(), StorageError> {
        // Handles are opened per operation; nothing is kept open.
        Ok(())
    }

    fn sync(&self, uri: &Uri) -> Result<(), StorageError> {
        let file =
            File::open(uri.to_path()).map_err(|err| StorageError::from_io(err, uri.as_str()))?;
        file.sync_all().map_err(StorageError::IOError)
    }

    fn filelock_lock(&self, uri: &Uri, shared: bool) -> Result<LockToken, StorageError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(uri.to_path())
            .map_err(|err| StorageError::from_io(err, uri.as_str()))?;
        // Explicit FileExt calls; std gained same-named methods in 1.89.
        let locked = if shared {
            FileExt::lock_shared(&file)
        } else {
            FileExt::lock_exclusive(&file)
        };
        locked.map_err(|err| StorageError::LockFailure(format!("{uri}: {err}")))?;
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.locks.lock().insert(token, file);
        Ok(LockToken(token))
    }

    fn filelock_unlock(&self, uri: &Uri, token: LockToken) -> Result<(), StorageError> {
        let file = self
            .locks
            .lock()
            .remove(&token.0)
            .ok_or_else(|| StorageError::LockFailure(format!("{uri}: lock not held")))?;
        FileExt::unlock(&file).map_err(|err| StorageError::LockFailure(format!("{uri}: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_uri(dir: &std::path::Path, name: &str) -> Uri {
        Uri::new(dir.join(name).to_str().unwrap()).unwrap()
    }

    #[test]
    fn posix_dirs_and_files() {
        let tmp = tempfile::TempDir::new().unwrap();
        let backend = PosixBackend::new();
        let dir = file_uri(tmp.path(), "arr");
        backend.create_dir(&dir).unwrap();
        assert!(backend.is_dir(&dir).unwrap());
        assert!(matches!(
            backend.create_dir(&dir),
            Err(StorageError::AlreadyExists(_))
        ));

        let file = dir.join("data.tdb");
        backend.write(&file, b"abcdef").unwrap();
        backend.write(&file, b"gh").unwrap();

        // Writes append: both payloads are readable in order.
        let mut buf = [0; 6];
        backend.read(&file, 2, &mut buf).unwrap();
        assert_eq!(&buf, b"cdefgh");
        assert_eq!(backend.dir_size(&dir).unwrap(), 8);

        let children = backend.ls(&dir).unwrap();
        assert_eq!(children, vec![dir.join("data.tdb")]);
    }

    #[test]
    fn posix_filelock_stacking() {
        let tmp = tempfile::TempDir::new().unwrap();
        let backend = PosixBackend::new();
        let lockfile = file_uri(tmp.path(), "__lockfile");
        backend.touch(&lockfile).unwrap();

        let a = backend.filelock_lock(&lockfile, true).unwrap();
        let b = backend.filelock_lock(&lockfile, true).unwrap();
        assert_ne!(a, b);
        backend.filelock_unlock(&lockfile, a).unwrap();
        backend.filelock_unlock(&lockfile, b).unwrap();
        assert!(backend.filelock_unlock(&lockfile, b).is_err());

        let x = backend.filelock_lock(&lockfile, false).unwrap();
        backend.filelock_unlock(&lockfile, x).unwrap();
    }
}
