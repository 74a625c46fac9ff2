//! Driving the consolidation collaborator through the coordinator.

use fragstore::array::schema::{Attribute, Dimension};
use fragstore::array::{ArraySchema, Datatype, FragmentMetadata, NonEmptyDomain};
use fragstore::query::Consolidate;
use fragstore::{Config, EncryptionKey, StorageCoordinator, StorageError, Uri};

// A consolidator that keeps only the newest fragment. Real consolidation
// rewrites data; this exercises the coordination protocol around it.
struct KeepNewest;

impl Consolidate for KeepNewest {
    fn consolidate(
        &mut self,
        sm: &StorageCoordinator,
        uri: &Uri,
        _key: &EncryptionKey,
    ) -> Result<(), StorageError> {
        let fragment_uris = sm.get_fragment_uris(uri)?;
        let sorted = StorageCoordinator::get_sorted_fragment_uris(&fragment_uris, u64::MAX)?;
        if sorted.len() <= 1 {
            return Ok(());
        }
        sm.array_xlock(uri)?;
        let result = (|| {
            for (_, fragment_uri) in &sorted[..sorted.len() - 1] {
                sm.vfs().remove_dir(fragment_uri)?;
            }
            Ok(())
        })();
        sm.array_xunlock(uri)?;
        result
    }
}

fn create_array(sm: &StorageCoordinator, uri: &Uri, key: &EncryptionKey) {
    let schema = ArraySchema::new(
        uri.clone(),
        false,
        Datatype::Int64,
        vec![Dimension {
            name: "d".to_string(),
        }],
        vec![Attribute {
            name: "a".to_string(),
            datatype: Datatype::Int64,
        }],
    );
    sm.array_create(uri, &schema, key).unwrap();
}

fn add_fragment(sm: &StorageCoordinator, uri: &Uri, name: &str, timestamp: u64, key: &EncryptionKey) {
    let fragment_uri = uri.join(name);
    sm.vfs().create_dir(&fragment_uri).unwrap();
    sm.write(&fragment_uri.join("a.tdb"), &[0u8; 8]).unwrap();
    let mut metadata = FragmentMetadata::new(
        fragment_uri,
        timestamp,
        true,
        NonEmptyDomain::Int64(vec![[0, 1]]),
    );
    metadata.store(sm.vfs(), key).unwrap();
}

#[test]
fn consolidate_squashes_old_fragments() {
    let sm = StorageCoordinator::new(Config::default()).unwrap();
    let key = EncryptionKey::no_encryption();
    let uri = Uri::new("mem://arrays/consolidate").unwrap();
    create_array(&sm, &uri, &key);
    add_fragment(&sm, &uri, "__a_1", 1, &key);
    add_fragment(&sm, &uri, "__b_2", 2, &key);
    add_fragment(&sm, &uri, "__c_3", 3, &key);

    sm.array_consolidate("mem://arrays/consolidate", &key, &mut KeepNewest)
        .unwrap();

    let remaining = sm.get_fragment_uris(&uri).unwrap();
    assert_eq!(remaining, vec![uri.join("__c_3")]);

    // The array still opens normally afterwards.
    let (_, fragments) = sm.array_open_for_reads(&uri, u64::MAX, &key).unwrap();
    assert_eq!(fragments.len(), 1);
    assert_eq!(fragments[0].timestamp(), 3);
    sm.array_close_for_reads(&uri).unwrap();
}

#[test]
fn consolidate_validates_target() {
    let sm = StorageCoordinator::new(Config::default()).unwrap();
    let key = EncryptionKey::no_encryption();
    assert!(matches!(
        sm.array_consolidate("mem://arrays/absent", &key, &mut KeepNewest),
        Err(StorageError::NotFound(_))
    ));
    assert!(matches!(
        sm.array_consolidate("", &key, &mut KeepNewest),
        Err(StorageError::InvalidUri(_))
    ));
}
