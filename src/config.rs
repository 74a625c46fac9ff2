//! Coordinator configuration.

use std::collections::BTreeMap;

use crate::error::StorageError;

const DEFAULT_NUM_ASYNC_THREADS: usize = 1;
const DEFAULT_NUM_READER_THREADS: usize = 1;
const DEFAULT_NUM_WRITER_THREADS: usize = 1;
const DEFAULT_TILE_CACHE_SIZE: u64 = 10 * 1024 * 1024;

/// Configuration of a [`StorageCoordinator`](crate::coordinator::StorageCoordinator).
///
/// Built from a flat string mapping. Recognized keys:
///
/// - `sm.num_async_threads`, `sm.num_reader_threads`, `sm.num_writer_threads`:
///   pool sizes (positive integers).
/// - `sm.tile_cache_size`: tile cache byte budget (non-negative integer).
/// - `vfs.*`: opaque, passed through to VFS initialization.
#[derive(Debug, Clone)]
pub struct Config {
    num_async_threads: usize,
    num_reader_threads: usize,
    num_writer_threads: usize,
    tile_cache_size: u64,
    vfs_params: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_async_threads: DEFAULT_NUM_ASYNC_THREADS,
            num_reader_threads: DEFAULT_NUM_READER_THREADS,
            num_writer_threads: DEFAULT_NUM_WRITER_THREADS,
            tile_cache_size: DEFAULT_TILE_CACHE_SIZE,
            vfs_params: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Build a configuration from `(key, value)` parameters.
    ///
    /// # Errors
    /// Returns [`StorageError::InvalidArgument`] for an unrecognized `sm.`
    /// key, a non-numeric value, or a zero pool size.
    pub fn from_params<'a, I>(params: I) -> Result<Self, StorageError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut config = Self::default();
        for (key, value) in params {
            config.set(key, value)?;
        }
        Ok(config)
    }

    /// Set a single parameter.
    ///
    /// # Errors
    /// Same conditions as [`Config::from_params`].
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        match key {
            "sm.num_async_threads" => self.num_async_threads = parse_pool_size(key, value)?,
            "sm.num_reader_threads" => self.num_reader_threads = parse_pool_size(key, value)?,
            "sm.num_writer_threads" => self.num_writer_threads = parse_pool_size(key, value)?,
            "sm.tile_cache_size" => {
                self.tile_cache_size = value.parse().map_err(|_| {
                    StorageError::InvalidArgument(format!("{key}: expected byte count, got {value}"))
                })?;
            }
            _ => {
                if let Some(vfs_key) = key.strip_prefix("vfs.") {
                    self.vfs_params.insert(vfs_key.to_string(), value.to_string());
                } else {
                    return Err(StorageError::InvalidArgument(format!(
                        "unrecognized configuration key {key}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Size of the asynchronous query pool.
    #[must_use]
    pub fn num_async_threads(&self) -> usize {
        self.num_async_threads
    }

    /// Size of the reader pool.
    #[must_use]
    pub fn num_reader_threads(&self) -> usize {
        self.num_reader_threads
    }

    /// Size of the writer pool.
    #[must_use]
    pub fn num_writer_threads(&self) -> usize {
        self.num_writer_threads
    }

    /// Tile cache byte budget.
    #[must_use]
    pub fn tile_cache_size(&self) -> u64 {
        self.tile_cache_size
    }

    /// Parameters forwarded verbatim to VFS initialization.
    #[must_use]
    pub fn vfs_params(&self) -> &BTreeMap<String, String> {
        &self.vfs_params
    }
}

fn parse_pool_size(key: &str, value: &str) -> Result<usize, StorageError> {
    let n: usize = value.parse().map_err(|_| {
        StorageError::InvalidArgument(format!("{key}: expected positive integer, got {value}"))
    })?;
    if n == 0 {
        return Err(StorageError::InvalidArgument(format!(
            "{key}: pool size must be positive"
        )));
    }
    Ok(n)
}
