//! The storage coordinator.
//!
//! One [`StorageCoordinator`] owns the lifecycle of every opened array in the
//! process: it keeps separate read-side and write-side registries of open
//! entries, layers in-process mutexes under cross-process file locks,
//! discovers and loads fragment snapshots, dispatches queries onto worker
//! pools, and fronts the tile cache and the VFS.
//!
//! Lock hierarchy: the xlock gate is acquired before a registry mutex, a
//! registry mutex before an entry mutex, and no entry mutex is ever held
//! while acquiring a registry mutex.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use itertools::Itertools;
use parking_lot::{Condvar, Mutex};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::array::fragment::{self, FragmentInfo, FragmentMetadata};
use crate::array::open_array::{OpenArray, OpenMode};
use crate::array::schema::ArraySchema;
use crate::array::NonEmptyDomain;
use crate::cache::TileCache;
use crate::config::Config;
use crate::constants;
use crate::encryption::{EncryptionKey, EncryptionType};
use crate::error::StorageError;
use crate::object::{ObjectIter, ObjectType, WalkOrder};
use crate::pool::{TaskHandle, ThreadPool};
use crate::query::{Consolidate, Query};
use crate::tasks::CancelableTasks;
use crate::tile;
use crate::uri::Uri;
use crate::vfs::Vfs;

type Registry = Mutex<HashMap<String, Arc<OpenArray>>>;

// The process-wide exclusive-lock gate. A plain mutex cannot be held across
// `array_xlock` .. `array_xunlock` calls, so the gate is a held flag with a
// condvar. Openers pass through it; an xlocker owns it until xunlock.
struct XlockGate {
    held: Mutex<bool>,
    released: Condvar,
}

impl XlockGate {
    fn new() -> Self {
        Self {
            held: Mutex::new(false),
            released: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut held = self.held.lock();
        while *held {
            self.released.wait(&mut held);
        }
        *held = true;
    }

    fn release(&self) {
        *self.held.lock() = false;
        self.released.notify_all();
    }
}

struct InProgress {
    count: Mutex<u64>,
    zero: Condvar,
}

impl InProgress {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            zero: Condvar::new(),
        }
    }

    fn incr(&self) {
        *self.count.lock() += 1;
    }

    fn decr(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.zero.notify_all();
        }
    }

    fn wait_zero(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.zero.wait(&mut count);
        }
    }
}

// Scoped increment of the in-progress query counter.
struct InProgressGuard(Arc<InProgress>);

impl InProgressGuard {
    fn new(in_progress: Arc<InProgress>) -> Self {
        in_progress.incr();
        Self(in_progress)
    }
}

impl Drop for InProgressGuard {
    fn drop(&mut self) {
        self.0.decr();
    }
}

/// The central object mediating concurrent access to on-disk arrays.
pub struct StorageCoordinator {
    config: Config,
    vfs: Arc<Vfs>,
    tile_cache: TileCache,
    async_pool: ThreadPool,
    reader_pool: ThreadPool,
    writer_pool: ThreadPool,
    cancelable_tasks: CancelableTasks,
    open_arrays_for_reads: Registry,
    open_arrays_for_writes: Registry,
    // Signalled by every read-close that empties an entry; paired with the
    // read registry mutex.
    reader_drained: Condvar,
    xlock_gate: XlockGate,
    xfilelocks: Mutex<HashMap<String, crate::vfs::LockToken>>,
    cancellation: Mutex<bool>,
    in_progress: Arc<InProgress>,
    object_create_mtx: Mutex<()>,
}

impl std::fmt::Debug for StorageCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageCoordinator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StorageCoordinator {
    /// Initialize a coordinator from `config`: three worker pools, the tile
    /// cache, and the VFS.
    pub fn new(config: Config) -> Result<Self, StorageError> {
        let async_pool = ThreadPool::new(config.num_async_threads())?;
        let reader_pool = ThreadPool::new(config.num_reader_threads())?;
        let writer_pool = ThreadPool::new(config.num_writer_threads())?;
        let tile_cache = TileCache::new(config.tile_cache_size());
        let vfs = Arc::new(Vfs::new(&config)?);
        Ok(Self {
            config,
            vfs,
            tile_cache,
            async_pool,
            reader_pool,
            writer_pool,
            cancelable_tasks: CancelableTasks::new(),
            open_arrays_for_reads: Mutex::new(HashMap::new()),
            open_arrays_for_writes: Mutex::new(HashMap::new()),
            reader_drained: Condvar::new(),
            xlock_gate: XlockGate::new(),
            xfilelocks: Mutex::new(HashMap::new()),
            cancellation: Mutex::new(false),
            in_progress: Arc::new(InProgress::new()),
            object_create_mtx: Mutex::new(()),
        })
    }

    /// The configuration this coordinator was initialized with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The virtual file system.
    #[must_use]
    pub fn vfs(&self) -> &Vfs {
        &self.vfs
    }

    /// The tile cache.
    #[must_use]
    pub fn tile_cache(&self) -> &TileCache {
        &self.tile_cache
    }

    /// The asynchronous query pool.
    #[must_use]
    pub fn async_pool(&self) -> &ThreadPool {
        &self.async_pool
    }

    /// The reader pool.
    #[must_use]
    pub fn reader_pool(&self) -> &ThreadPool {
        &self.reader_pool
    }

    /// The writer pool.
    #[must_use]
    pub fn writer_pool(&self) -> &ThreadPool {
        &self.writer_pool
    }

    /* ------------------------------------------------------------------ */
    /* Plain file operations                                              */
    /* ------------------------------------------------------------------ */

    /// Create a directory.
    pub fn create_dir(&self, uri: &Uri) -> Result<(), StorageError> {
        self.vfs.create_dir(uri)
    }

    /// Create an empty file.
    pub fn touch(&self, uri: &Uri) -> Result<(), StorageError> {
        self.vfs.touch(uri)
    }

    /// Check whether `uri` names a file.
    pub fn is_file(&self, uri: &Uri) -> Result<bool, StorageError> {
        self.vfs.is_file(uri)
    }

    /// Check whether `uri` names a directory.
    pub fn is_dir(&self, uri: &Uri) -> Result<bool, StorageError> {
        self.vfs.is_dir(uri)
    }

    /// Read exactly `nbytes` at `offset` from the file at `uri` into
    /// `buffer`, replacing its contents.
    pub fn read(
        &self,
        uri: &Uri,
        offset: u64,
        buffer: &mut Vec<u8>,
        nbytes: u64,
    ) -> Result<(), StorageError> {
        let nbytes = usize::try_from(nbytes)
            .map_err(|_| StorageError::InvalidArgument("read length out of range".to_string()))?;
        buffer.resize(nbytes, 0);
        self.vfs.read(uri, offset, buffer)
    }

    /// Append `data` to the file at `uri`.
    pub fn write(&self, uri: &Uri, data: &[u8]) -> Result<(), StorageError> {
        self.vfs.write(uri, data)
    }

    /// Force written data for `uri` to stable storage.
    pub fn sync(&self, uri: &Uri) -> Result<(), StorageError> {
        self.vfs.sync(uri)
    }

    /// Flush and close any cached handle for `uri`.
    pub fn close_file(&self, uri: &Uri) -> Result<(), StorageError> {
        self.vfs.close_file(uri)
    }

    /* ------------------------------------------------------------------ */
    /* Tile cache integration                                             */
    /* ------------------------------------------------------------------ */

    fn cache_key(uri: &Uri, offset: u64) -> String {
        format!("{uri}+{offset}")
    }

    /// Probe the tile cache for `nbytes` at `(uri, offset)`.
    ///
    /// On a hit, `buffer` is replaced with the cached bytes and `Ok(true)` is
    /// returned; a miss is `Ok(false)`, not an error.
    pub fn read_from_cache(
        &self,
        uri: &Uri,
        offset: u64,
        buffer: &mut Vec<u8>,
        nbytes: u64,
    ) -> Result<bool, StorageError> {
        self.tile_cache
            .read(&Self::cache_key(uri, offset), buffer, 0, nbytes)
    }

    /// Insert the tile at `(uri, offset)` into the cache.
    ///
    /// Skipped silently when the payload exceeds the cache budget or when the
    /// filename is one of the metadata sentinels; metadata files are never
    /// cached.
    pub fn write_to_cache(
        &self,
        uri: &Uri,
        offset: u64,
        buffer: &[u8],
    ) -> Result<(), StorageError> {
        if buffer.len() as u64 > self.tile_cache.max_size() {
            return Ok(());
        }
        let filename = uri.last_path_part();
        if filename == constants::FRAGMENT_METADATA_FILENAME
            || filename == constants::ARRAY_SCHEMA_FILENAME
            || filename == constants::KV_SCHEMA_FILENAME
        {
            return Ok(());
        }
        self.tile_cache.insert(
            &Self::cache_key(uri, offset),
            Bytes::copy_from_slice(buffer),
            false,
        );
        Ok(())
    }

    /* ------------------------------------------------------------------ */
    /* Object model                                                       */
    /* ------------------------------------------------------------------ */

    /// Whether an array lives at `uri`.
    pub fn is_array(&self, uri: &Uri) -> Result<bool, StorageError> {
        self.vfs
            .is_file(&uri.join(constants::ARRAY_SCHEMA_FILENAME))
    }

    /// Whether a key-value array lives at `uri`.
    pub fn is_kv(&self, uri: &Uri) -> Result<bool, StorageError> {
        self.vfs.is_file(&uri.join(constants::KV_SCHEMA_FILENAME))
    }

    /// Whether a group lives at `uri`.
    pub fn is_group(&self, uri: &Uri) -> Result<bool, StorageError> {
        self.vfs.is_file(&uri.join(constants::GROUP_FILENAME))
    }

    /// Whether a fragment directory lives at `uri`.
    pub fn is_fragment(&self, uri: &Uri) -> Result<bool, StorageError> {
        self.vfs
            .is_file(&uri.join(constants::FRAGMENT_METADATA_FILENAME))
    }

    /// Classify the object at `uri` by its sentinel file.
    pub fn object_type(&self, uri: &Uri) -> Result<ObjectType, StorageError> {
        if !self.vfs.is_dir(uri)? {
            return Ok(ObjectType::Invalid);
        }
        for child in self.vfs.ls(uri)? {
            match child.last_path_part() {
                constants::GROUP_FILENAME => return Ok(ObjectType::Group),
                constants::KV_SCHEMA_FILENAME => return Ok(ObjectType::KeyValue),
                constants::ARRAY_SCHEMA_FILENAME => return Ok(ObjectType::Array),
                _ => {}
            }
        }
        Ok(ObjectType::Invalid)
    }

    /// Remove the object at `path`.
    pub fn object_remove(&self, path: &str) -> Result<(), StorageError> {
        let uri = Uri::new(path)?;
        if self.object_type(&uri)? == ObjectType::Invalid {
            return Err(StorageError::InvalidArgument(format!(
                "cannot remove {path}: not a valid object"
            )));
        }
        self.vfs.remove_dir(&uri)
    }

    /// Move the object at `old_path` to `new_path`.
    pub fn object_move(&self, old_path: &str, new_path: &str) -> Result<(), StorageError> {
        let old_uri = Uri::new(old_path)?;
        let new_uri = Uri::new(new_path)?;
        if self.object_type(&old_uri)? == ObjectType::Invalid {
            return Err(StorageError::InvalidArgument(format!(
                "cannot move {old_path}: not a valid object"
            )));
        }
        self.vfs.move_dir(&old_uri, &new_uri)
    }

    /// Begin a recursive walk of the objects under `path`.
    pub fn object_iter_begin(
        &self,
        path: &str,
        order: WalkOrder,
    ) -> Result<ObjectIter, StorageError> {
        let path_uri = Uri::new(path)?;
        let mut objs = Vec::new();
        for child in self.vfs.ls(&path_uri)? {
            if self.object_type(&child)? != ObjectType::Invalid {
                objs.push(child);
            }
        }
        Ok(ObjectIter::new(objs, order, true))
    }

    /// Begin a non-recursive preorder walk of the objects directly under
    /// `path`.
    pub fn object_iter_begin_non_recursive(&self, path: &str) -> Result<ObjectIter, StorageError> {
        let path_uri = Uri::new(path)?;
        let mut objs = Vec::new();
        for child in self.vfs.ls(&path_uri)? {
            if self.object_type(&child)? != ObjectType::Invalid {
                objs.push(child);
            }
        }
        Ok(ObjectIter::new(objs, WalkOrder::Preorder, false))
    }

    /* ------------------------------------------------------------------ */
    /* Creation                                                           */
    /* ------------------------------------------------------------------ */

    /// Create a group at `group`.
    pub fn group_create(&self, group: &str) -> Result<(), StorageError> {
        let uri = Uri::new(group)?;
        if self.is_group(&uri)? {
            return Err(StorageError::AlreadyExists(format!("group {group}")));
        }
        let _create = self.object_create_mtx.lock();
        self.vfs.create_dir(&uri)?;
        let group_file = uri.join(constants::GROUP_FILENAME);
        if let Err(err) = self.vfs.touch(&group_file) {
            if let Err(cleanup) = self.vfs.remove_dir(&uri) {
                warn!("failed to clean up group directory {uri}: {cleanup}");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Create an array at `uri` with `schema`, protected by `key`.
    pub fn array_create(
        &self,
        uri: &Uri,
        schema: &ArraySchema,
        key: &EncryptionKey,
    ) -> Result<(), StorageError> {
        if self.is_array(uri)? || self.is_kv(uri)? {
            return Err(StorageError::AlreadyExists(format!("array {uri}")));
        }
        let _create = self.object_create_mtx.lock();
        let mut schema = schema.clone();
        schema.set_uri(uri.clone());
        schema.check()?;

        self.vfs.create_dir(uri)?;
        if let Err(err) = self.store_array_schema(&schema, key) {
            if let Err(cleanup) = self.vfs.remove_dir(uri) {
                warn!("failed to clean up array directory {uri}: {cleanup}");
            }
            return Err(err);
        }
        let filelock_uri = uri.join(constants::FILELOCK_NAME);
        if let Err(err) = self.vfs.touch(&filelock_uri) {
            if let Err(cleanup) = self.vfs.remove_dir(uri) {
                warn!("failed to clean up array directory {uri}: {cleanup}");
            }
            return Err(err);
        }
        Ok(())
    }

    /* ------------------------------------------------------------------ */
    /* Schema persistence                                                 */
    /* ------------------------------------------------------------------ */

    /// Persist `schema` into its array directory as a generic tile.
    pub fn store_array_schema(
        &self,
        schema: &ArraySchema,
        key: &EncryptionKey,
    ) -> Result<(), StorageError> {
        let filename = if schema.is_kv() {
            constants::KV_SCHEMA_FILENAME
        } else {
            constants::ARRAY_SCHEMA_FILENAME
        };
        let schema_uri = schema.uri().join(filename);
        let payload = schema.to_bytes()?;
        if self.vfs.is_file(&schema_uri)? {
            self.vfs.remove_file(&schema_uri)?;
        }
        tile::write_generic(&self.vfs, &schema_uri, &payload, key)?;
        self.close_file(&schema_uri)
    }

    /// Load the schema of the array at `uri`.
    pub fn load_array_schema(
        &self,
        uri: &Uri,
        object_type: ObjectType,
        key: &EncryptionKey,
    ) -> Result<ArraySchema, StorageError> {
        let filename = match object_type {
            ObjectType::Array => constants::ARRAY_SCHEMA_FILENAME,
            ObjectType::KeyValue => constants::KV_SCHEMA_FILENAME,
            _ => {
                return Err(StorageError::InvalidArgument(format!(
                    "cannot load schema: {uri} is not an array"
                )))
            }
        };
        let schema_uri = uri.join(filename);
        if !self.vfs.is_file(&schema_uri)? {
            return Err(StorageError::NotFound(format!("schema of {uri}")));
        }
        let payload = tile::read_generic(&self.vfs, &schema_uri, 0, key)?;
        let schema = ArraySchema::from_bytes(&payload, uri.clone())?;
        if schema.is_kv() != (object_type == ObjectType::KeyValue) {
            return Err(StorageError::ParseError(format!(
                "{uri}: schema document contradicts its sentinel filename"
            )));
        }
        Ok(schema)
    }

    /// The encryption kind of the array at `uri`, read from the schema
    /// file's generic tile header without parsing the payload.
    pub fn array_get_encryption(&self, uri: &Uri) -> Result<EncryptionType, StorageError> {
        let filename = match self.object_type(uri)? {
            ObjectType::Array => constants::ARRAY_SCHEMA_FILENAME,
            ObjectType::KeyValue => constants::KV_SCHEMA_FILENAME,
            _ => {
                return Err(StorageError::InvalidArgument(format!(
                    "cannot get encryption: {uri} is not an array"
                )))
            }
        };
        let header = tile::read_generic_tile_header(&self.vfs, &uri.join(filename), 0)?;
        Ok(header.encryption_type)
    }

    /* ------------------------------------------------------------------ */
    /* Fragment discovery                                                 */
    /* ------------------------------------------------------------------ */

    /// Enumerate the fragment directories inside the array at `array_uri`.
    ///
    /// Children whose name starts with `.` are skipped; a child is a
    /// fragment iff it contains a fragment metadata file.
    pub fn get_fragment_uris(&self, array_uri: &Uri) -> Result<Vec<Uri>, StorageError> {
        let mut fragment_uris = Vec::new();
        for uri in self.vfs.ls(array_uri)? {
            if uri.last_path_part().starts_with('.') {
                continue;
            }
            if self.is_fragment(&uri)? {
                fragment_uris.push(uri);
            }
        }
        Ok(fragment_uris)
    }

    /// Keep the fragments with timestamp at most `timestamp` and sort them
    /// ascending by `(timestamp, uri)`.
    ///
    /// The URI tie-break makes snapshots deterministic.
    pub fn get_sorted_fragment_uris(
        fragment_uris: &[Uri],
        timestamp: u64,
    ) -> Result<Vec<(u64, Uri)>, StorageError> {
        let mut sorted = Vec::with_capacity(fragment_uris.len());
        for uri in fragment_uris {
            let t = fragment::parse_fragment_timestamp(uri.last_path_part())?;
            if t <= timestamp {
                sorted.push((t, uri.clone()));
            }
        }
        Ok(sorted.into_iter().sorted().collect())
    }

    /* ------------------------------------------------------------------ */
    /* Open / close protocol                                              */
    /* ------------------------------------------------------------------ */

    /// Open the array at `uri` for reads with a fragment snapshot at
    /// `timestamp`.
    ///
    /// Returns the schema and the loaded fragment metadata, ascending by
    /// `(timestamp, uri)`. The caller holds the open (and with it the shared
    /// cross-process filelock) until [`array_close_for_reads`](Self::array_close_for_reads).
    pub fn array_open_for_reads(
        &self,
        uri: &Uri,
        timestamp: u64,
        key: &EncryptionKey,
    ) -> Result<(Arc<ArraySchema>, Vec<Arc<FragmentMetadata>>), StorageError> {
        let entry = self.array_open_without_fragments(uri, key)?;
        let result = (|| {
            let fragment_uris = self.get_fragment_uris(uri)?;
            let fragments_to_load = Self::get_sorted_fragment_uris(&fragment_uris, timestamp)?;
            let _entry_lock = entry.lock();
            self.load_fragment_metadata(&entry, key, &fragments_to_load)
        })();
        match result {
            Ok(metadata) => {
                let schema = entry
                    .schema()
                    .ok_or_else(|| StorageError::Internal(format!("{uri}: open without schema")))?;
                Ok((schema, metadata))
            }
            Err(err) => {
                self.close_for_reads_after_failure(uri);
                Err(err)
            }
        }
    }

    /// Open the array at `uri` for reads against an explicit fragment list,
    /// used verbatim instead of a snapshot selection.
    pub fn array_open_for_reads_list(
        &self,
        uri: &Uri,
        fragments: &[FragmentInfo],
        key: &EncryptionKey,
    ) -> Result<(Arc<ArraySchema>, Vec<Arc<FragmentMetadata>>), StorageError> {
        let entry = self.array_open_without_fragments(uri, key)?;
        let fragments_to_load: Vec<(u64, Uri)> = fragments
            .iter()
            .map(|info| (info.timestamp, info.uri.clone()))
            .collect();
        let result = {
            let _entry_lock = entry.lock();
            self.load_fragment_metadata(&entry, key, &fragments_to_load)
        };
        match result {
            Ok(metadata) => {
                let schema = entry
                    .schema()
                    .ok_or_else(|| StorageError::Internal(format!("{uri}: open without schema")))?;
                Ok((schema, metadata))
            }
            Err(err) => {
                self.close_for_reads_after_failure(uri);
                Err(err)
            }
        }
    }

    /// Open the array at `uri` for writes.
    ///
    /// No filelock is taken and no fragment metadata is loaded: writers
    /// coordinate with readers through timestamped fragment names and may
    /// coexist with them.
    pub fn array_open_for_writes(
        &self,
        uri: &Uri,
        key: &EncryptionKey,
    ) -> Result<Arc<ArraySchema>, StorageError> {
        if !self.vfs.supports_uri_scheme(uri) {
            return Err(StorageError::UnsupportedScheme(uri.scheme().to_string()));
        }
        let object_type = self.object_type(uri)?;
        if object_type != ObjectType::Array && object_type != ObjectType::KeyValue {
            return Err(StorageError::NotFound(format!("array {uri}")));
        }

        let entry = {
            let mut writes = self.open_arrays_for_writes.lock();
            let entry = Self::find_or_create_entry(&mut writes, uri, OpenMode::Write, key)?;
            entry.refcount_incr();
            entry
        };
        debug!("opened {uri} for writes, refcount {}", entry.refcount());

        let entry_lock = entry.lock();
        if entry.schema().is_none() {
            match self.load_array_schema(uri, object_type, key) {
                Ok(schema) => entry.set_schema(Arc::new(schema)),
                Err(err) => {
                    drop(entry_lock);
                    if let Err(close_err) = self.array_close_for_writes(uri) {
                        warn!("failed to rewind write open of {uri}: {close_err}");
                    }
                    return Err(err);
                }
            }
        }
        let schema = entry
            .schema()
            .ok_or_else(|| StorageError::Internal(format!("{uri}: open without schema")))?;
        drop(entry_lock);
        Ok(schema)
    }

    /// Re-run snapshot selection and metadata loading on an array already
    /// open for reads.
    pub fn array_reopen(
        &self,
        uri: &Uri,
        timestamp: u64,
        key: &EncryptionKey,
    ) -> Result<(Arc<ArraySchema>, Vec<Arc<FragmentMetadata>>), StorageError> {
        let entry = {
            let reads = self.open_arrays_for_reads.lock();
            let entry = reads.get(uri.as_str()).cloned().ok_or_else(|| {
                StorageError::InvalidArgument(format!("cannot reopen {uri}: array not open"))
            })?;
            entry.set_encryption_key(key)?;
            entry
        };

        // A failed reopen leaves the open (and its refcount) untouched; the
        // caller still holds it and closes it as usual.
        let fragment_uris = self.get_fragment_uris(uri)?;
        let fragments_to_load = Self::get_sorted_fragment_uris(&fragment_uris, timestamp)?;
        let metadata = {
            let _entry_lock = entry.lock();
            self.load_fragment_metadata(&entry, key, &fragments_to_load)?
        };
        let schema = entry
            .schema()
            .ok_or_else(|| StorageError::Internal(format!("{uri}: open without schema")))?;
        Ok((schema, metadata))
    }

    /// Close one read-open of the array at `uri`.
    ///
    /// When the last open closes, the entry's shared filelock is released,
    /// the entry is destroyed, and waiters on the exclusive lock are woken.
    /// Closing an array that is not open is a no-op.
    pub fn array_close_for_reads(&self, uri: &Uri) -> Result<(), StorageError> {
        let result = {
            let mut reads = self.open_arrays_for_reads.lock();
            match reads.get(uri.as_str()).cloned() {
                None => Ok(()),
                Some(entry) => {
                    let _entry_lock = entry.lock();
                    if entry.refcount_decr() == 0 {
                        let unlocked = entry.file_unlock(&self.vfs);
                        reads.remove(uri.as_str());
                        debug!("closed last read-open of {uri}");
                        unlocked
                    } else {
                        Ok(())
                    }
                }
            }
        };
        self.reader_drained.notify_all();
        result
    }

    /// Close one write-open of the array at `uri`.
    ///
    /// Closing an array that is not open is a no-op.
    pub fn array_close_for_writes(&self, uri: &Uri) -> Result<(), StorageError> {
        let mut writes = self.open_arrays_for_writes.lock();
        if let Some(entry) = writes.get(uri.as_str()).cloned() {
            let _entry_lock = entry.lock();
            if entry.refcount_decr() == 0 {
                writes.remove(uri.as_str());
                debug!("closed last write-open of {uri}");
            }
        }
        Ok(())
    }

    // Shared head of the read-open paths: registries, key reconciliation,
    // shared filelock, schema.
    fn array_open_without_fragments(
        &self,
        uri: &Uri,
        key: &EncryptionKey,
    ) -> Result<Arc<OpenArray>, StorageError> {
        if !self.vfs.supports_uri_scheme(uri) {
            return Err(StorageError::UnsupportedScheme(uri.scheme().to_string()));
        }
        let object_type = self.object_type(uri)?;
        if object_type != ObjectType::Array && object_type != ObjectType::KeyValue {
            return Err(StorageError::NotFound(format!("array {uri}")));
        }

        // The xlock gate is acquired before the registry mutex everywhere,
        // so an exclusive locker and an opener cannot deadlock.
        self.xlock_gate.acquire();
        let entry = {
            let mut reads = self.open_arrays_for_reads.lock();
            let entry = Self::find_or_create_entry(&mut reads, uri, OpenMode::Read, key);
            match entry {
                Ok(entry) => {
                    entry.refcount_incr();
                    self.xlock_gate.release();
                    entry
                }
                Err(err) => {
                    self.xlock_gate.release();
                    return Err(err);
                }
            }
        };
        debug!("opened {uri} for reads, refcount {}", entry.refcount());

        let entry_lock = entry.lock();

        // The shared filelock is held by the entry (one per entry, not per
        // open) until the last close.
        if let Err(err) = entry.file_lock(&self.vfs) {
            drop(entry_lock);
            self.close_for_reads_after_failure(uri);
            return Err(err);
        }

        if entry.schema().is_none() {
            match self.load_array_schema(uri, object_type, key) {
                Ok(schema) => entry.set_schema(Arc::new(schema)),
                Err(err) => {
                    drop(entry_lock);
                    self.close_for_reads_after_failure(uri);
                    return Err(err);
                }
            }
        }
        drop(entry_lock);
        Ok(entry)
    }

    fn find_or_create_entry(
        registry: &mut HashMap<String, Arc<OpenArray>>,
        uri: &Uri,
        mode: OpenMode,
        key: &EncryptionKey,
    ) -> Result<Arc<OpenArray>, StorageError> {
        match registry.get(uri.as_str()) {
            Some(entry) => {
                entry.set_encryption_key(key)?;
                Ok(entry.clone())
            }
            None => {
                let entry = Arc::new(OpenArray::new(uri.clone(), mode));
                entry.set_encryption_key(key)?;
                registry.insert(uri.to_string(), entry.clone());
                Ok(entry)
            }
        }
    }

    // Compensating close after a failure past the refcount increment.
    fn close_for_reads_after_failure(&self, uri: &Uri) {
        if let Err(err) = self.array_close_for_reads(uri) {
            warn!("failed to rewind read open of {uri}: {err}");
        }
    }

    // Load the metadata of every fragment in `fragments_to_load` in parallel
    // on the reader pool, reusing instances already present on the entry.
    // Caller holds the entry mutex; the metadata map has its own lock for the
    // workers' inserts.
    fn load_fragment_metadata(
        &self,
        entry: &OpenArray,
        key: &EncryptionKey,
        fragments_to_load: &[(u64, Uri)],
    ) -> Result<Vec<Arc<FragmentMetadata>>, StorageError> {
        let schema = entry
            .schema()
            .ok_or_else(|| StorageError::Internal("metadata load without schema".to_string()))?;
        self.reader_pool.install(|| {
            fragments_to_load
                .par_iter()
                .map(|(timestamp, fragment_uri)| {
                    if let Some(metadata) = entry.fragment_metadata(fragment_uri) {
                        return Ok(metadata);
                    }
                    let coords_uri = fragment_uri.join(constants::COORDS_FILENAME);
                    let sparse = self.vfs.is_file(&coords_uri)?;
                    let metadata = FragmentMetadata::load(
                        &self.vfs,
                        &schema,
                        fragment_uri,
                        *timestamp,
                        !sparse,
                        key,
                    )?;
                    Ok(entry.insert_fragment_metadata(Arc::new(metadata)))
                })
                .collect()
        })
    }

    /* ------------------------------------------------------------------ */
    /* Exclusive lock                                                     */
    /* ------------------------------------------------------------------ */

    /// Take the exclusive lock on the array at `uri`.
    ///
    /// Blocks other local xlockers, waits until no local read-open of the
    /// array exists, then takes the exclusive cross-process filelock. Needed
    /// only for destructive operations that must not overlap any reader.
    pub fn array_xlock(&self, uri: &Uri) -> Result<(), StorageError> {
        self.xlock_gate.acquire();

        let mut reads = self.open_arrays_for_reads.lock();
        while reads.contains_key(uri.as_str()) {
            self.reader_drained.wait(&mut reads);
        }

        let lock_uri = uri.join(constants::FILELOCK_NAME);
        match self.vfs.filelock_lock(&lock_uri, false) {
            Ok(token) => {
                self.xfilelocks.lock().insert(uri.to_string(), token);
                debug!("xlocked {uri}");
                Ok(())
            }
            Err(err) => {
                drop(reads);
                self.xlock_gate.release();
                Err(err)
            }
        }
    }

    /// Release the exclusive lock on the array at `uri`.
    pub fn array_xunlock(&self, uri: &Uri) -> Result<(), StorageError> {
        {
            let mut xfilelocks = self.xfilelocks.lock();
            let token = xfilelocks.get(uri.as_str()).copied().ok_or_else(|| {
                StorageError::LockFailure(format!("{uri}: exclusive filelock not found"))
            })?;
            let lock_uri = uri.join(constants::FILELOCK_NAME);
            self.vfs.filelock_unlock(&lock_uri, token)?;
            xfilelocks.remove(uri.as_str());
        }
        self.xlock_gate.release();
        debug!("xunlocked {uri}");
        Ok(())
    }

    /* ------------------------------------------------------------------ */
    /* Array information                                                  */
    /* ------------------------------------------------------------------ */

    /// Union of the non-empty domains of `fragment_metadata`, or `None` if
    /// the list is empty.
    ///
    /// The array must be open for reads.
    pub fn array_get_non_empty_domain(
        &self,
        array_uri: &Uri,
        fragment_metadata: &[Arc<FragmentMetadata>],
    ) -> Result<Option<NonEmptyDomain>, StorageError> {
        if !self
            .open_arrays_for_reads
            .lock()
            .contains_key(array_uri.as_str())
        {
            return Err(StorageError::InvalidArgument(format!(
                "cannot get non-empty domain: {array_uri} not opened for reads"
            )));
        }
        let Some(first) = fragment_metadata.first() else {
            return Ok(None);
        };
        let mut domain = first.non_empty_domain().clone();
        for metadata in &fragment_metadata[1..] {
            domain.expand(metadata.non_empty_domain())?;
        }
        Ok(Some(domain))
    }

    /// Enumerate the fragments of `schema`'s array visible at `timestamp`.
    ///
    /// A shared filelock is held for the duration of enumeration so the scan
    /// cannot overlap a destructive exclusive-lock holder.
    pub fn get_fragment_info(
        &self,
        schema: &ArraySchema,
        timestamp: u64,
        key: &EncryptionKey,
    ) -> Result<Vec<FragmentInfo>, StorageError> {
        let array_uri = schema.uri();
        let lock_uri = array_uri.join(constants::FILELOCK_NAME);
        let token = self.vfs.filelock_lock(&lock_uri, true)?;
        let result = (|| {
            let fragment_uris = self.get_fragment_uris(array_uri)?;
            if fragment_uris.is_empty() {
                return Ok(Vec::new());
            }
            let sorted = Self::get_sorted_fragment_uris(&fragment_uris, timestamp)?;
            self.reader_pool.install(|| {
                sorted
                    .par_iter()
                    .map(|(t, uri)| self.fragment_info_at(schema, key, uri, *t))
                    .collect()
            })
        })();
        self.vfs.filelock_unlock(&lock_uri, token)?;
        result
    }

    /// Information about the single fragment at `fragment_uri`, whose
    /// timestamp is parsed from the directory name.
    pub fn get_fragment_info_single(
        &self,
        schema: &ArraySchema,
        key: &EncryptionKey,
        fragment_uri: &Uri,
    ) -> Result<FragmentInfo, StorageError> {
        let timestamp = fragment::parse_fragment_timestamp(fragment_uri.last_path_part())?;
        self.fragment_info_at(schema, key, fragment_uri, timestamp)
    }

    fn fragment_info_at(
        &self,
        schema: &ArraySchema,
        key: &EncryptionKey,
        fragment_uri: &Uri,
        timestamp: u64,
    ) -> Result<FragmentInfo, StorageError> {
        let coords_uri = fragment_uri.join(constants::COORDS_FILENAME);
        let sparse = self.vfs.is_file(&coords_uri)?;
        let metadata =
            FragmentMetadata::load(&self.vfs, schema, fragment_uri, timestamp, !sparse, key)?;
        Ok(FragmentInfo {
            uri: fragment_uri.clone(),
            sparse,
            timestamp,
            size: metadata.fragment_size(),
            non_empty_domain: metadata.non_empty_domain().clone(),
        })
    }

    /// Consolidate the fragments of the array at `array_name` through the
    /// external [`Consolidate`] collaborator.
    pub fn array_consolidate(
        &self,
        array_name: &str,
        key: &EncryptionKey,
        consolidator: &mut dyn Consolidate,
    ) -> Result<(), StorageError> {
        let uri = Uri::new(array_name)?;
        let object_type = self.object_type(&uri)?;
        if object_type != ObjectType::Array && object_type != ObjectType::KeyValue {
            return Err(StorageError::NotFound(format!("array {array_name}")));
        }
        consolidator.consolidate(self, &uri, key)
    }

    /* ------------------------------------------------------------------ */
    /* Query dispatch & cancellation                                      */
    /* ------------------------------------------------------------------ */

    /// Execute `query` inline, tracked by the in-progress counter.
    pub fn query_submit(&self, query: &dyn Query) -> Result<(), StorageError> {
        let _in_progress = InProgressGuard::new(self.in_progress.clone());
        query.process()
    }

    /// Enqueue `query` on the async pool.
    ///
    /// If the query is cancelled before processing begins, its
    /// [`cancel`](Query::cancel) hook runs instead of
    /// [`process`](Query::process) and the handle yields
    /// [`StorageError::Cancelled`].
    pub fn query_submit_async(&self, query: Arc<dyn Query>) -> TaskHandle {
        // The guard is taken at submission and released by whichever of the
        // two paths runs, so cancel_all_tasks cannot return while a query
        // is between dispatch and process().
        let guard = Arc::new(Mutex::new(Some(InProgressGuard::new(
            self.in_progress.clone(),
        ))));
        let work_guard = guard.clone();
        let work_query = query.clone();
        self.cancelable_tasks.enqueue(
            &self.async_pool,
            move || {
                let _in_progress = work_guard.lock().take();
                let result = work_query.process();
                if let Err(err) = &result {
                    warn!("async query failed: {err}");
                }
                result
            },
            move || {
                query.cancel();
                drop(guard.lock().take());
            },
        )
    }

    /// Cancel all queued tasks and wait for in-flight queries to quiesce.
    ///
    /// On return, every queued task has observed either completion of its
    /// work or its cancel hook, the in-progress counter is zero, and no new
    /// work starts on the async path before the flag clears. Reentrant calls
    /// return immediately.
    pub fn cancel_all_tasks(&self) -> Result<(), StorageError> {
        {
            let mut cancellation = self.cancellation.lock();
            if *cancellation {
                return Ok(());
            }
            *cancellation = true;
        }

        self.cancelable_tasks.cancel_all();
        self.vfs.cancel_all_tasks();
        self.in_progress.wait_zero();

        *self.cancellation.lock() = false;
        Ok(())
    }

    /// Whether a cancellation is currently in progress.
    ///
    /// Running queries are expected to poll this and wind down cooperatively.
    #[must_use]
    pub fn cancellation_in_progress(&self) -> bool {
        *self.cancellation.lock()
    }
}

impl Drop for StorageCoordinator {
    fn drop(&mut self) {
        if let Err(err) = self.cancel_all_tasks() {
            warn!("cancellation on shutdown failed: {err}");
        }

        // Release the filelocks of any still-open read entries.
        let reads: Vec<Arc<OpenArray>> =
            self.open_arrays_for_reads.lock().drain().map(|(_, e)| e).collect();
        for entry in reads {
            if let Err(err) = entry.file_unlock(&self.vfs) {
                warn!("failed to release filelock of {}: {err}", entry.uri());
            }
        }
        self.open_arrays_for_writes.lock().clear();

        // Release any still-held exclusive filelocks.
        let xfilelocks: Vec<(String, crate::vfs::LockToken)> =
            self.xfilelocks.lock().drain().collect();
        for (uri, token) in xfilelocks {
            if let Ok(uri) = Uri::new(uri) {
                let lock_uri = uri.join(constants::FILELOCK_NAME);
                if let Err(err) = self.vfs.filelock_unlock(&lock_uri, token) {
                    warn!("failed to release exclusive filelock of {uri}: {err}");
                }
            }
        }

        if let Err(err) = self.vfs.terminate() {
            warn!("failed to terminate VFS: {err}");
        }
    }
}
