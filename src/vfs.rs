//! The virtual file system façade.
//!
//! A [`Vfs`] dispatches uniform path, file, directory, and lock operations to
//! a backend chosen by URI scheme. It performs no caching and keeps no state
//! of its own beyond the backend registry; every operation is pass-through
//! with categorized failures.

pub mod memory;
pub mod posix;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::Config;
use crate::error::StorageError;
use crate::uri::Uri;

pub use memory::MemoryBackend;
pub use posix::PosixBackend;

/// An opaque handle to a held advisory file lock.
///
/// Returned by [`Vfs::filelock_lock`] and redeemed by
/// [`Vfs::filelock_unlock`] on the same URI.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockToken(pub(crate) u64);

/// Operations a VFS backend must provide.
///
/// All paths arrive as full URIs; backends interpret the path portion.
pub trait VfsBackend: Send + Sync {
    /// Create a directory.
    fn create_dir(&self, uri: &Uri) -> Result<(), StorageError>;
    /// Remove a directory and its contents.
    fn remove_dir(&self, uri: &Uri) -> Result<(), StorageError>;
    /// Move a directory.
    fn move_dir(&self, old_uri: &Uri, new_uri: &Uri) -> Result<(), StorageError>;
    /// Create an empty file.
    fn touch(&self, uri: &Uri) -> Result<(), StorageError>;
    /// Remove a file.
    fn remove_file(&self, uri: &Uri) -> Result<(), StorageError>;
    /// Check whether `uri` names a file.
    fn is_file(&self, uri: &Uri) -> Result<bool, StorageError>;
    /// Check whether `uri` names a directory.
    fn is_dir(&self, uri: &Uri) -> Result<bool, StorageError>;
    /// List the children of a directory, ordered by name.
    fn ls(&self, uri: &Uri) -> Result<Vec<Uri>, StorageError>;
    /// Read exactly `buf.len()` bytes starting at `offset`.
    fn read(&self, uri: &Uri, offset: u64, buf: &mut [u8]) -> Result<(), StorageError>;
    /// Append `data` to the file at `uri`, creating it if absent.
    fn write(&self, uri: &Uri, data: &[u8]) -> Result<(), StorageError>;
    /// Total size of the files under the directory at `uri`.
    fn dir_size(&self, uri: &Uri) -> Result<u64, StorageError>;
    /// Flush and close any cached handle for `uri`.
    fn close_file(&self, uri: &Uri) -> Result<(), StorageError>;
    /// Force written data for `uri` to stable storage.
    fn sync(&self, uri: &Uri) -> Result<(), StorageError>;
    /// Acquire an advisory lock on the file at `uri`. Shared locks stack; an
    /// exclusive lock is granted only when no lock is held. Blocks until
    /// granted.
    fn filelock_lock(&self, uri: &Uri, shared: bool) -> Result<LockToken, StorageError>;
    /// Release a lock previously acquired on `uri`.
    fn filelock_unlock(&self, uri: &Uri, token: LockToken) -> Result<(), StorageError>;
    /// Cancel any backend-internal tasks.
    fn cancel_all_tasks(&self) {}
    /// Release backend resources.
    fn terminate(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Uniform file-system operations over pluggable scheme-addressed backends.
pub struct Vfs {
    backends: BTreeMap<&'static str, Arc<dyn VfsBackend>>,
    params: BTreeMap<String, String>,
}

impl std::fmt::Debug for Vfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vfs")
            .field("schemes", &self.backends.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Vfs {
    /// Initialize a VFS with the `file` and `mem` backends.
    ///
    /// `config` supplies the `vfs.*` parameters; unrecognized parameters are
    /// passed through to backends and ignored by those that do not use them.
    pub fn new(config: &Config) -> Result<Self, StorageError> {
        let mut backends: BTreeMap<&'static str, Arc<dyn VfsBackend>> = BTreeMap::new();
        backends.insert("file", Arc::new(PosixBackend::new()));
        backends.insert("mem", Arc::new(MemoryBackend::new()));
        Ok(Self {
            backends,
            params: config.vfs_params().clone(),
        })
    }

    /// The `vfs.*` parameters this VFS was initialized with.
    #[must_use]
    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    fn backend(&self, uri: &Uri) -> Result<&Arc<dyn VfsBackend>, StorageError> {
        self.backends
            .get(uri.scheme())
            .ok_or_else(|| StorageError::UnsupportedScheme(uri.scheme().to_string()))
    }

    /// Whether a backend is registered for the scheme of `uri`.
    #[must_use]
    pub fn supports_uri_scheme(&self, uri: &Uri) -> bool {
        self.backends.contains_key(uri.scheme())
    }

    /// Create a directory.
    pub fn create_dir(&self, uri: &Uri) -> Result<(), StorageError> {
        self.backend(uri)?.create_dir(uri)
    }

    /// Remove a directory and its contents.
    pub fn remove_dir(&self, uri: &Uri) -> Result<(), StorageError> {
        self.backend(uri)?.remove_dir(uri)
    }

    /// Move a directory.
    pub fn move_dir(&self, old_uri: &Uri, new_uri: &Uri) -> Result<(), StorageError> {
        if old_uri.scheme() != new_uri.scheme() {
            return Err(StorageError::InvalidArgument(
                "cannot move across URI schemes".to_string(),
            ));
        }
        self.backend(old_uri)?.move_dir(old_uri, new_uri)
    }

    /// Create an empty file.
    pub fn touch(&self, uri: &Uri) -> Result<(), StorageError> {
        self.backend(uri)?.touch(uri)
    }

    /// Remove a file.
    pub fn remove_file(&self, uri: &Uri) -> Result<(), StorageError> {
        self.backend(uri)?.remove_file(uri)
    }

    /// Check whether `uri` names a file.
    pub fn is_file(&self, uri: &Uri) -> Result<bool, StorageError> {
        self.backend(uri)?.is_file(uri)
    }

    /// Check whether `uri` names a directory.
    pub fn is_dir(&self, uri: &Uri) -> Result<bool, StorageError> {
        self.backend(uri)?.is_dir(uri)
    }

    /// List the children of a directory, ordered by name.
    pub fn ls(&self, uri: &Uri) -> Result<Vec<Uri>, StorageError> {
        self.backend(uri)?.ls(uri)
    }

    /// Read exactly `buf.len()` bytes starting at `offset`.
    pub fn read(&self, uri: &Uri, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        self.backend(uri)?.read(uri, offset, buf)
    }

    /// Append `data` to the file at `uri`, creating it if absent.
    pub fn write(&self, uri: &Uri, data: &[u8]) -> Result<(), StorageError> {
        self.backend(uri)?.write(uri, data)
    }

    /// Total size of the files under the directory at `uri`.
    pub fn dir_size(&self, uri: &Uri) -> Result<u64, StorageError> {
        self.backend(uri)?.dir_size(uri)
    }

    /// Flush and close any cached handle for `uri`.
    pub fn close_file(&self, uri: &Uri) -> Result<(), StorageError> {
        self.backend(uri)?.close_file(uri)
    }

    /// Force written data for `uri` to stable storage.
    pub fn sync(&self, uri: &Uri) -> Result<(), StorageError> {
        self.backend(uri)?.sync(uri)
    }

    /// Acquire an advisory lock on the file at `uri`.
    pub fn filelock_lock(&self, uri: &Uri, shared: bool) -> Result<LockToken, StorageError> {
        self.backend(uri)?.filelock_lock(uri, shared)
    }

    /// Release an advisory lock on the file at `uri`.
    pub fn filelock_unlock(&self, uri: &Uri, token: LockToken) -> Result<(), StorageError> {
        self.backend(uri)?.filelock_unlock(uri, token)
    }

    /// Cancel any backend-internal tasks.
    pub fn cancel_all_tasks(&self) {
        for backend in self.backends.values() {
            backend.cancel_all_tasks();
        }
    }

    /// Release all backend resources.
    pub fn terminate(&self) -> Result<(), StorageError> {
        for backend in self.backends.values() {
            backend.terminate()?;
        }
        Ok(())
    }
}
