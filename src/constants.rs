//! Reserved names of the on-disk array layout.

/// Name of the array schema file inside an array directory.
pub const ARRAY_SCHEMA_FILENAME: &str = "__array_schema.tdb";

/// Name of the key-value schema file inside a key-value array directory.
pub const KV_SCHEMA_FILENAME: &str = "__kv_schema.tdb";

/// Name of the group sentinel file inside a group directory.
pub const GROUP_FILENAME: &str = "__tiledb_group.tdb";

/// Name of the fragment metadata file inside a fragment directory.
pub const FRAGMENT_METADATA_FILENAME: &str = "__fragment_metadata.tdb";

/// Name of the coordinates file that marks a fragment as sparse.
pub const COORDS_FILENAME: &str = "__coords.tdb";

/// Name of the advisory lock file inside an array directory.
pub const FILELOCK_NAME: &str = "__lockfile";

/// Prefix of every fragment directory name.
pub const FRAGMENT_PREFIX: &str = "__";
