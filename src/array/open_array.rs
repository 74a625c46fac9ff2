//! Per-(URI, mode) open-array state.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::array::fragment::FragmentMetadata;
use crate::array::schema::ArraySchema;
use crate::constants;
use crate::encryption::EncryptionKey;
use crate::error::StorageError;
use crate::uri::Uri;
use crate::vfs::{LockToken, Vfs};

/// The mode an array was opened in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// Opened for reads.
    Read,
    /// Opened for writes.
    Write,
}

/// In-memory state of one open array in one mode.
///
/// Created on the first open of a (URI, mode) pair, destroyed when its
/// reference count returns to zero. Refcount transitions through zero happen
/// only while the owning registry's mutex is held; the fragment-metadata map
/// carries its own lock so reader-pool workers can insert while the opener
/// holds the entry mutex.
#[derive(Debug)]
pub struct OpenArray {
    uri: Uri,
    mode: OpenMode,
    mtx: Mutex<()>,
    refcount: Mutex<u64>,
    schema: RwLock<Option<Arc<ArraySchema>>>,
    fragment_metadata: Mutex<HashMap<Uri, Arc<FragmentMetadata>>>,
    key: Mutex<Option<EncryptionKey>>,
    filelock: Mutex<Option<LockToken>>,
}

impl OpenArray {
    /// Create an entry with refcount zero.
    #[must_use]
    pub fn new(uri: Uri, mode: OpenMode) -> Self {
        Self {
            uri,
            mode,
            mtx: Mutex::new(()),
            refcount: Mutex::new(0),
            schema: RwLock::new(None),
            fragment_metadata: Mutex::new(HashMap::new()),
            key: Mutex::new(None),
            filelock: Mutex::new(None),
        }
    }

    /// The array URI.
    #[must_use]
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// The open mode.
    #[must_use]
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Acquire the entry mutex for the duration of the returned guard.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.mtx.lock()
    }

    /// Increment the reference count.
    pub fn refcount_incr(&self) {
        *self.refcount.lock() += 1;
    }

    /// Decrement the reference count and return the new value.
    pub fn refcount_decr(&self) -> u64 {
        let mut refcount = self.refcount.lock();
        *refcount = refcount.saturating_sub(1);
        *refcount
    }

    /// The current reference count.
    #[must_use]
    pub fn refcount(&self) -> u64 {
        *self.refcount.lock()
    }

    /// The attached schema, if loaded.
    #[must_use]
    pub fn schema(&self) -> Option<Arc<ArraySchema>> {
        self.schema.read().clone()
    }

    /// Attach the schema. Stable after the first call.
    pub fn set_schema(&self, schema: Arc<ArraySchema>) {
        let mut slot = self.schema.write();
        if slot.is_none() {
            *slot = Some(schema);
        }
    }

    /// Look up loaded metadata for the fragment at `uri`.
    ///
    /// Total: an absent fragment is `None`, never an error.
    #[must_use]
    pub fn fragment_metadata(&self, uri: &Uri) -> Option<Arc<FragmentMetadata>> {
        self.fragment_metadata.lock().get(uri).cloned()
    }

    /// Insert loaded fragment metadata, keeping the first instance on a
    /// concurrent double insert.
    pub fn insert_fragment_metadata(&self, metadata: Arc<FragmentMetadata>) -> Arc<FragmentMetadata> {
        let mut map = self.fragment_metadata.lock();
        map.entry(metadata.uri().clone()).or_insert(metadata).clone()
    }

    /// Reconcile `key` with the key stored on this entry.
    ///
    /// The first call pins the key; later calls succeed iff the key matches.
    pub fn set_encryption_key(&self, key: &EncryptionKey) -> Result<(), StorageError> {
        let mut stored = self.key.lock();
        match stored.as_ref() {
            None => {
                *stored = Some(key.clone());
                Ok(())
            }
            Some(stored) if stored == key => Ok(()),
            Some(_) => Err(StorageError::EncryptionMismatch(self.uri.to_string())),
        }
    }

    /// Acquire the shared cross-process filelock for this entry.
    ///
    /// One lock is held per entry regardless of the reference count. A no-op
    /// for write entries (writers coordinate through timestamped fragment
    /// names).
    pub fn file_lock(&self, vfs: &Vfs) -> Result<(), StorageError> {
        if self.mode == OpenMode::Write {
            return Ok(());
        }
        let mut filelock = self.filelock.lock();
        if filelock.is_none() {
            let lock_uri = self.uri.join(constants::FILELOCK_NAME);
            *filelock = Some(vfs.filelock_lock(&lock_uri, true)?);
        }
        Ok(())
    }

    /// Release the shared filelock if held. A no-op for write entries.
    pub fn file_unlock(&self, vfs: &Vfs) -> Result<(), StorageError> {
        if self.mode == OpenMode::Write {
            return Ok(());
        }
        let mut filelock = self.filelock.lock();
        if let Some(token) = filelock.take() {
            let lock_uri = self.uri.join(constants::FILELOCK_NAME);
            vfs.filelock_unlock(&lock_uri, token)?;
        }
        Ok(())
    }
}
