//! Fragments: immutable timestamped batches of writes.
//!
//! A fragment is a directory named `__<uuid>_<timestamp>` inside the array
//! directory. It is *dense* iff it contains no coordinates file. Its
//! metadata document lives in `__fragment_metadata.tdb`, persisted as a
//! generic tile.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::array::domain::NonEmptyDomain;
use crate::array::schema::ArraySchema;
use crate::constants;
use crate::encryption::EncryptionKey;
use crate::error::StorageError;
use crate::tile;
use crate::uri::Uri;
use crate::vfs::Vfs;

/// Parse the timestamp out of a fragment directory name.
///
/// Fragment names have the form `__<uuid>_<timestamp>` with a decimal 64-bit
/// timestamp. A name that reached this point without the `__` prefix or an
/// underscore separator violates a program invariant.
pub fn parse_fragment_timestamp(name: &str) -> Result<u64, StorageError> {
    let rest = name.strip_prefix(constants::FRAGMENT_PREFIX).ok_or_else(|| {
        StorageError::Internal(format!("fragment name {name} lacks the __ prefix"))
    })?;
    let (_, timestamp) = rest.rsplit_once('_').ok_or_else(|| {
        StorageError::Internal(format!("fragment name {name} lacks a timestamp"))
    })?;
    timestamp
        .parse()
        .map_err(|_| StorageError::ParseError(format!("bad fragment timestamp in {name}")))
}

/// Generate a fresh fragment directory name for `timestamp`.
#[must_use]
pub fn new_fragment_name(timestamp: u64) -> String {
    format!(
        "{}{}_{timestamp}",
        constants::FRAGMENT_PREFIX,
        Uuid::new_v4().simple()
    )
}

/// Summary information about a fragment.
#[derive(Clone, Debug)]
pub struct FragmentInfo {
    /// Fragment directory URI.
    pub uri: Uri,
    /// Whether the fragment is sparse.
    pub sparse: bool,
    /// Fragment timestamp.
    pub timestamp: u64,
    /// Fragment size in bytes.
    pub size: u64,
    /// The fragment's non-empty domain.
    pub non_empty_domain: NonEmptyDomain,
}

#[derive(Serialize, Deserialize)]
struct FragmentDocument {
    version: u32,
    dense: bool,
    non_empty_domain: NonEmptyDomain,
    total_size: u64,
}

const FRAGMENT_METADATA_VERSION: u32 = 1;

/// Loaded metadata of one fragment.
///
/// At most one instance exists per (open entry, fragment URI); the open
/// entry's metadata map is the deduplication point.
#[derive(Debug)]
pub struct FragmentMetadata {
    uri: Uri,
    timestamp: u64,
    dense: bool,
    non_empty_domain: NonEmptyDomain,
    total_size: u64,
}

impl FragmentMetadata {
    /// Build metadata for a fragment being produced.
    #[must_use]
    pub fn new(uri: Uri, timestamp: u64, dense: bool, non_empty_domain: NonEmptyDomain) -> Self {
        Self {
            uri,
            timestamp,
            dense,
            non_empty_domain,
            total_size: 0,
        }
    }

    /// Load the metadata of the fragment at `uri` from its
    /// `__fragment_metadata.tdb` file and validate it against `schema`.
    pub fn load(
        vfs: &Vfs,
        schema: &ArraySchema,
        uri: &Uri,
        timestamp: u64,
        dense: bool,
        key: &EncryptionKey,
    ) -> Result<Self, StorageError> {
        let metadata_uri = uri.join(constants::FRAGMENT_METADATA_FILENAME);
        let payload = tile::read_generic(vfs, &metadata_uri, 0, key)?;
        let doc: FragmentDocument = serde_json::from_slice(&payload)?;
        if doc.version > FRAGMENT_METADATA_VERSION {
            return Err(StorageError::ParseError(format!(
                "unsupported fragment metadata version {}",
                doc.version
            )));
        }
        if doc.dense != dense {
            return Err(StorageError::ParseError(format!(
                "{uri}: metadata dense flag contradicts the coordinates probe"
            )));
        }
        if doc.non_empty_domain.datatype() != schema.coords_type()
            || doc.non_empty_domain.dim_num() != schema.dim_num()
        {
            return Err(StorageError::ParseError(format!(
                "{uri}: non-empty domain does not fit the array schema"
            )));
        }
        Ok(Self {
            uri: uri.clone(),
            timestamp,
            dense: doc.dense,
            non_empty_domain: doc.non_empty_domain,
            total_size: doc.total_size,
        })
    }

    /// Persist this metadata into the fragment directory.
    ///
    /// The recorded fragment size is the size of the data files present in
    /// the directory when the metadata is stored, so producers write data
    /// tiles first and metadata last.
    pub fn store(&mut self, vfs: &Vfs, key: &EncryptionKey) -> Result<(), StorageError> {
        let metadata_uri = self.uri.join(constants::FRAGMENT_METADATA_FILENAME);
        if !self.dense {
            let coords_uri = self.uri.join(constants::COORDS_FILENAME);
            if !vfs.is_file(&coords_uri)? {
                vfs.touch(&coords_uri)?;
            }
        }
        self.total_size = vfs.dir_size(&self.uri)?;
        let payload = self.to_document().to_bytes()?;
        tile::write_generic(vfs, &metadata_uri, &payload, key)?;
        vfs.close_file(&metadata_uri)
    }

    fn to_document(&self) -> FragmentDocument {
        FragmentDocument {
            version: FRAGMENT_METADATA_VERSION,
            dense: self.dense,
            non_empty_domain: self.non_empty_domain.clone(),
            total_size: self.total_size,
        }
    }

    /// Fragment directory URI.
    #[must_use]
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Fragment timestamp.
    #[must_use]
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Whether the fragment is dense.
    #[must_use]
    pub fn dense(&self) -> bool {
        self.dense
    }

    /// The fragment's non-empty domain.
    #[must_use]
    pub fn non_empty_domain(&self) -> &NonEmptyDomain {
        &self.non_empty_domain
    }

    /// Fragment size in bytes.
    #[must_use]
    pub fn fragment_size(&self) -> u64 {
        self.total_size
    }
}

impl FragmentDocument {
    fn to_bytes(&self) -> Result<Vec<u8>, StorageError> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn fragment_name_round_trip() {
        let name = new_fragment_name(42);
        assert!(name.starts_with("__"));
        assert_eq!(parse_fragment_timestamp(&name).unwrap(), 42);
    }

    #[test]
    fn fragment_name_invariants() {
        assert!(matches!(
            parse_fragment_timestamp("nope_5"),
            Err(StorageError::Internal(_))
        ));
        assert!(matches!(
            parse_fragment_timestamp("__nounderscore"),
            Err(StorageError::Internal(_))
        ));
        assert!(matches!(
            parse_fragment_timestamp("__abc_xyz"),
            Err(StorageError::ParseError(_))
        ));
    }

    #[test]
    fn fragment_metadata_round_trip() {
        let vfs = Vfs::new(&Config::default()).unwrap();
        let array = Uri::new("mem://arrays/a").unwrap();
        vfs.create_dir(&array).unwrap();
        let frag = array.join(&new_fragment_name(7));
        vfs.create_dir(&frag).unwrap();
        vfs.write(&frag.join("a.tdb"), &[0; 100]).unwrap();

        let key = EncryptionKey::no_encryption();
        let mut metadata = FragmentMetadata::new(
            frag.clone(),
            7,
            false,
            NonEmptyDomain::Int64(vec![[1, 4], [2, 8]]),
        );
        metadata.store(&vfs, &key).unwrap();

        // Sparse fragments get a coordinates file.
        assert!(vfs.is_file(&frag.join("__coords.tdb")).unwrap());

        let schema = crate::array::schema::test_schema(&array);
        let loaded = FragmentMetadata::load(&vfs, &schema, &frag, 7, false, &key).unwrap();
        assert_eq!(loaded.timestamp(), 7);
        assert!(!loaded.dense());
        assert_eq!(
            loaded.non_empty_domain(),
            &NonEmptyDomain::Int64(vec![[1, 4], [2, 8]])
        );
        // Data files plus the empty coordinates sentinel, metadata excluded.
        assert_eq!(loaded.fragment_size(), 100);
    }
}
