//! An in-memory backend, used for deterministic tests and scratch arrays.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::StorageError;
use crate::uri::Uri;
use crate::vfs::{LockToken, VfsBackend};

#[derive(Default)]
struct Tree {
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
}

impl Tree {
    fn children(&self, prefix: &str) -> Vec<String> {
        let mut out = BTreeSet::new();
        for name in self.dirs.iter().chain(self.files.keys()) {
            if let Some(rest) = name.strip_prefix(prefix) {
                if !rest.is_empty() {
                    let first = rest.split('/').next().unwrap_or(rest);
                    out.insert(format!("{prefix}{first}"));
                }
            }
        }
        out.into_iter().collect()
    }
}

#[derive(Default)]
struct LockState {
    shared: u32,
    exclusive: bool,
}

/// Backend for `mem://` URIs.
///
/// Advisory locks are emulated with the same semantics as POSIX filelocks:
/// shared locks stack, an exclusive lock is granted only when nothing is
/// held, and acquisition blocks until granted.
pub struct MemoryBackend {
    tree: RwLock<Tree>,
    locks: Mutex<HashMap<String, LockState>>,
    lock_released: Condvar,
    tokens: Mutex<HashMap<u64, (String, bool)>>,
    next_token: AtomicU64,
}

impl MemoryBackend {
    /// Create a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tree: RwLock::new(Tree::default()),
            locks: Mutex::new(HashMap::new()),
            lock_released: Condvar::new(),
            tokens: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl VfsBackend for MemoryBackend {
    fn create_dir(&self, uri: &Uri) -> Result<(), StorageError> {
        let mut tree = self.tree.write();
        let key = uri.to_string();
        if tree.dirs.contains(&key) || tree.files.contains_key(&key) {
            return Err(StorageError::AlreadyExists(key));
        }
        tree.dirs.insert(key);
        Ok(())
    }

    fn remove_dir(&self, uri: &Uri) -> Result<(), StorageError> {
        let mut tree = self.tree.write();
        let key = uri.to_string();
        if !tree.dirs.remove(&key) {
            return Err(StorageError::NotFound(key));
        }
        let prefix = format!("{key}/");
        tree.dirs.retain(|dir| !dir.starts_with(&prefix));
        tree.files.retain(|file, _| !file.starts_with(&prefix));
        Ok(())
    }

    fn move_dir(&self, old_uri: &Uri, new_uri: &Uri) -> Result<(), StorageError> {
        let mut tree = self.tree.write();
        let old_key = old_uri.to_string();
        let new_key = new_uri.to_string();
        if !tree.dirs.remove(&old_key) {
            return Err(StorageError::NotFound(old_key));
        }
        let old_prefix = format!("{old_key}/");
        let new_prefix = format!("{new_key}/");
        tree.dirs.insert(new_key);
        let moved_dirs: Vec<String> = tree
            .dirs
            .iter()
            .filter(|dir| dir.starts_with(&old_prefix))
            .cloned()
            .collect();
        for dir in moved_dirs {
            tree.dirs.remove(&dir);
            let rest = dir.strip_prefix(&old_prefix).unwrap_or(&dir).to_string();
            tree.dirs.insert(format!("{new_prefix}{rest}"));
        }
        let moved_files: Vec<String> = tree
            .files
            .keys()
            .filter(|file| file.starts_with(&old_prefix))
            .cloned()
            .collect();
        for file in moved_files {
            let data = tree.files.remove(&file).unwrap_or_default();
            let rest = file.strip_prefix(&old_prefix).unwrap_or(&file).to_string();
            tree.files.insert(format!("{new_prefix}{rest}"), data);
        }
        Ok(())
    }

    fn touch(&self, uri: &Uri) -> Result<(), StorageError> {
        self.tree.write().files.entry(uri.to_string()).or_default();
        Ok(())
    }

    fn remove_file(&self, uri: &Uri) -> Result<(), StorageError> {
        self.tree
            .write()
            .files
            .remove(uri.as_str())
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(uri.to_string()))
    }

    fn is_file(&self, uri: &Uri) -> Result<bool, StorageError> {
        Ok(self.tree.read().files.contains_key(uri.as_str()))
    }

    fn is_dir(&self, uri: &Uri) -> Result<bool, StorageError> {
        Ok(self.tree.read().dirs.contains(uri.as_str()))
    }

    fn ls(&self, uri: &Uri) -> Result<Vec<Uri>, StorageError> {
        let tree = self.tree.read();
        if !tree.dirs.contains(uri.as_str()) {
            return Err(StorageError::NotFound(uri.to_string()));
        }
        tree.children(&uri.with_trailing_slash())
            .into_iter()
            .map(|child| Uri::new(child).map_err(Into::into))
            .collect()
    }

    fn read(&self, uri: &Uri, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        let tree = self.tree.read();
        let data = tree
            .files
            .get(uri.as_str())
            .ok_or_else(|| StorageError::NotFound(uri.to_string()))?;
        let offset = usize::try_from(offset)
            .map_err(|_| StorageError::InvalidArgument("offset out of range".to_string()))?;
        let end = offset + buf.len();
        if end > data.len() {
            return Err(StorageError::IOError(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("{uri}: read past end of file"),
            )));
        }
        buf.copy_from_slice(&data[offset..end]);
        Ok(())
    }

    fn write(&self, uri: &Uri, data: &[u8]) -> Result<(), StorageError> {
        self.tree
            .write()
            .files
            .entry(uri.to_string())
            .or_default()
            .extend_from_slice(data);
        Ok(())
    }

    fn dir_size(&self, uri: &Uri) -> Result<u64, StorageError> {
        let tree = self.tree.read();
        let prefix = uri.with_trailing_slash();
        Ok(tree
            .files
            .iter()
            .filter(|(file, _)| file.starts_with(&prefix))
            .map(|(_, data)| data.len() as u64)
            .sum())
    }

    fn close_file(&self, _uri: &Uri) -> Result<(), StorageError> {
        Ok(())
    }

    fn sync(&self, _uri: &Uri) -> Result<(), StorageError> {
        Ok(())
    }

    fn filelock_lock(&self, uri: &Uri, shared: bool) -> Result<LockToken, StorageError> {
        if !self.tree.read().files.contains_key(uri.as_str()) {
            return Err(StorageError::LockFailure(format!("{uri}: no such lockfile")));
        }
        let mut locks = self.locks.lock();
        loop {
            let state = locks.entry(uri.to_string()).or_default();
            let granted = if shared {
                !state.exclusive
            } else {
                !state.exclusive && state.shared == 0
            };
            if granted {
                if shared {
                    state.shared += 1;
                } else {
                    state.exclusive = true;
                }
                break;
            }
            self.lock_released.wait(&mut locks);
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.tokens.lock().insert(token, (uri.to_string(), shared));
        Ok(LockToken(token))
    }

    fn filelock_unlock(&self, uri: &Uri, token: LockToken) -> Result<(), StorageError> {
        let (locked_uri, shared) = self
            .tokens
            .lock()
            .remove(&token.0)
            .ok_or_else(|| StorageError::LockFailure(format!("{uri}: lock not held")))?;
        let mut locks = self.locks.lock();
        let state = locks
            .get_mut(&locked_uri)
            .ok_or_else(|| StorageError::LockFailure(format!("{uri}: lock state missing")))?;
        if shared {
            state.shared = state.shared.saturating_sub(1);
        } else {
            state.exclusive = false;
        }
        if state.shared == 0 && !state.exclusive {
            locks.remove(&locked_uri);
        }
        self.lock_released.notify_all();
        Ok(())
    }
}
