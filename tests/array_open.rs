//! Open/close protocol and snapshot behaviour over the in-memory backend.

use std::sync::Arc;

use fragstore::array::schema::{Attribute, Dimension};
use fragstore::array::{ArraySchema, Datatype, FragmentMetadata, NonEmptyDomain};
use fragstore::object::{ObjectType, WalkOrder};
use fragstore::{Config, EncryptionKey, StorageCoordinator, StorageError, Uri};

fn coordinator() -> StorageCoordinator {
    StorageCoordinator::new(Config::default()).unwrap()
}

fn schema_for(uri: &Uri) -> ArraySchema {
    ArraySchema::new(
        uri.clone(),
        false,
        Datatype::Int64,
        vec![
            Dimension {
                name: "rows".to_string(),
            },
            Dimension {
                name: "cols".to_string(),
            },
        ],
        vec![Attribute {
            name: "a".to_string(),
            datatype: Datatype::Float64,
        }],
    )
}

fn create_array(sm: &StorageCoordinator, uri: &Uri, key: &EncryptionKey) -> ArraySchema {
    let schema = schema_for(uri);
    sm.array_create(uri, &schema, key).unwrap();
    schema
}

fn add_fragment(
    sm: &StorageCoordinator,
    array_uri: &Uri,
    name: &str,
    timestamp: u64,
    domain: NonEmptyDomain,
    key: &EncryptionKey,
) -> Uri {
    let fragment_uri = array_uri.join(name);
    sm.vfs().create_dir(&fragment_uri).unwrap();
    sm.write(&fragment_uri.join("a.tdb"), &[0u8; 16]).unwrap();
    let mut metadata = FragmentMetadata::new(fragment_uri.clone(), timestamp, true, domain);
    metadata.store(sm.vfs(), key).unwrap();
    fragment_uri
}

fn domain(rows: [i64; 2], cols: [i64; 2]) -> NonEmptyDomain {
    NonEmptyDomain::Int64(vec![rows, cols])
}

#[test]
fn snapshot_cut_off() {
    let sm = coordinator();
    let key = EncryptionKey::no_encryption();
    let uri = Uri::new("mem://arrays/snapshot").unwrap();
    create_array(&sm, &uri, &key);
    let a = add_fragment(&sm, &uri, "__a_5", 5, domain([0, 1], [0, 1]), &key);
    let b = add_fragment(&sm, &uri, "__b_10", 10, domain([0, 1], [0, 1]), &key);
    add_fragment(&sm, &uri, "__c_15", 15, domain([0, 1], [0, 1]), &key);

    let (_, fragments) = sm.array_open_for_reads(&uri, 10, &key).unwrap();
    let observed: Vec<(u64, Uri)> = fragments
        .iter()
        .map(|m| (m.timestamp(), m.uri().clone()))
        .collect();
    assert_eq!(observed, vec![(5, a), (10, b)]);
    sm.array_close_for_reads(&uri).unwrap();

    let (_, fragments) = sm.array_open_for_reads(&uri, 4, &key).unwrap();
    assert!(fragments.is_empty());
    sm.array_close_for_reads(&uri).unwrap();
}

#[test]
fn snapshot_monotonicity() {
    let sm = coordinator();
    let key = EncryptionKey::no_encryption();
    let uri = Uri::new("mem://arrays/monotonic").unwrap();
    create_array(&sm, &uri, &key);
    for (name, t) in [("__a_3", 3), ("__b_7", 7), ("__c_9", 9)] {
        add_fragment(&sm, &uri, name, t, domain([0, 0], [0, 0]), &key);
    }

    let (_, at_t1) = sm.array_open_for_reads(&uri, 7, &key).unwrap();
    let (_, at_t2) = sm.array_reopen(&uri, 9, &key).unwrap();
    let names_t1: Vec<&Uri> = at_t1.iter().map(|m| m.uri()).collect();
    let names_t2: Vec<&Uri> = at_t2.iter().map(|m| m.uri()).collect();
    assert_eq!(&names_t2[..names_t1.len()], &names_t1[..]);
    sm.array_close_for_reads(&uri).unwrap();
}

#[test]
fn concurrent_readers_release_everything() {
    let sm = Arc::new(coordinator());
    let key = EncryptionKey::no_encryption();
    let uri = Uri::new("mem://arrays/readers").unwrap();
    create_array(&sm, &uri, &key);

    let threads: Vec<_> = (0..2)
        .map(|_| {
            let sm = sm.clone();
            let key = key.clone();
            let uri = uri.clone();
            std::thread::spawn(move || {
                let (schema, fragments) = sm.array_open_for_reads(&uri, u64::MAX, &key).unwrap();
                assert_eq!(schema.dim_num(), 2);
                assert!(fragments.is_empty());
                sm.array_close_for_reads(&uri).unwrap();
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    // The read entry is gone: reopen fails, and the shared filelock count is
    // zero so the exclusive lock is grantable immediately.
    assert!(matches!(
        sm.array_reopen(&uri, u64::MAX, &key),
        Err(StorageError::InvalidArgument(_))
    ));
    sm.array_xlock(&uri).unwrap();
    sm.array_xunlock(&uri).unwrap();
}

#[test]
fn refcount_conservation() {
    let sm = coordinator();
    let key = EncryptionKey::no_encryption();
    let uri = Uri::new("mem://arrays/refcount").unwrap();
    create_array(&sm, &uri, &key);

    sm.array_open_for_reads(&uri, u64::MAX, &key).unwrap();
    sm.array_open_for_reads(&uri, u64::MAX, &key).unwrap();
    sm.array_close_for_reads(&uri).unwrap();
    // One open remains, so the entry still exists and reopen succeeds.
    sm.array_reopen(&uri, u64::MAX, &key).unwrap();
    sm.array_close_for_reads(&uri).unwrap();
    // Now the entry is gone.
    assert!(sm.array_reopen(&uri, u64::MAX, &key).is_err());
    // Closing a closed array is a no-op.
    sm.array_close_for_reads(&uri).unwrap();
}

#[test]
fn encryption_key_is_sticky() {
    let sm = coordinator();
    let k1 = EncryptionKey::no_encryption();
    let k2 = EncryptionKey::new(fragstore::EncryptionType::Aes256Gcm, vec![9; 32]).unwrap();
    let uri = Uri::new("mem://arrays/keys").unwrap();
    create_array(&sm, &uri, &k1);

    sm.array_open_for_reads(&uri, u64::MAX, &k1).unwrap();
    // A second open with a different key fails and leaves the first open
    // untouched.
    assert!(matches!(
        sm.array_open_for_reads(&uri, u64::MAX, &k2),
        Err(StorageError::EncryptionMismatch(_))
    ));
    sm.array_reopen(&uri, u64::MAX, &k1).unwrap();
    sm.array_close_for_reads(&uri).unwrap();
    assert!(sm.array_reopen(&uri, u64::MAX, &k1).is_err());
}

#[test]
fn writers_coexist_with_readers() {
    let sm = coordinator();
    let key = EncryptionKey::no_encryption();
    let uri = Uri::new("mem://arrays/both").unwrap();
    create_array(&sm, &uri, &key);

    let (read_schema, _) = sm.array_open_for_reads(&uri, u64::MAX, &key).unwrap();
    let write_schema = sm.array_open_for_writes(&uri, &key).unwrap();
    assert_eq!(read_schema.uri(), write_schema.uri());
    sm.array_close_for_writes(&uri).unwrap();
    sm.array_close_for_reads(&uri).unwrap();
}

#[test]
fn open_missing_array_fails() {
    let sm = coordinator();
    let key = EncryptionKey::no_encryption();
    let uri = Uri::new("mem://arrays/nothing").unwrap();
    assert!(matches!(
        sm.array_open_for_reads(&uri, u64::MAX, &key),
        Err(StorageError::NotFound(_))
    ));
    assert!(matches!(
        sm.array_open_for_writes(&uri, &key),
        Err(StorageError::NotFound(_))
    ));
}

#[test]
fn open_with_explicit_fragment_list() {
    let sm = coordinator();
    let key = EncryptionKey::no_encryption();
    let uri = Uri::new("mem://arrays/list").unwrap();
    let schema = create_array(&sm, &uri, &key);
    add_fragment(&sm, &uri, "__a_5", 5, domain([0, 3], [0, 3]), &key);
    add_fragment(&sm, &uri, "__b_10", 10, domain([4, 7], [0, 3]), &key);

    // Enumerate, then reopen against the enumerated list verbatim.
    let infos = sm.get_fragment_info(&schema, u64::MAX, &key).unwrap();
    assert_eq!(infos.len(), 2);
    assert!(!infos[0].sparse);
    assert_eq!(infos[0].size, 16);

    let (_, fragments) = sm.array_open_for_reads_list(&uri, &infos, &key).unwrap();
    assert_eq!(fragments.len(), 2);
    assert_eq!(fragments[0].timestamp(), 5);

    let non_empty = sm
        .array_get_non_empty_domain(&uri, &fragments)
        .unwrap()
        .unwrap();
    assert_eq!(non_empty, domain([0, 7], [0, 3]));
    sm.array_close_for_reads(&uri).unwrap();
}

#[test]
fn fragment_info_single_parses_name() {
    let sm = coordinator();
    let key = EncryptionKey::no_encryption();
    let uri = Uri::new("mem://arrays/single").unwrap();
    let schema = create_array(&sm, &uri, &key);
    let fragment_uri = add_fragment(&sm, &uri, "__a_42", 42, domain([1, 2], [3, 4]), &key);

    let info = sm
        .get_fragment_info_single(&schema, &key, &fragment_uri)
        .unwrap();
    assert_eq!(info.timestamp, 42);
    assert_eq!(info.non_empty_domain, domain([1, 2], [3, 4]));
}

#[test]
fn array_get_encryption_reads_header_only() {
    let sm = coordinator();
    let key = EncryptionKey::no_encryption();
    let uri = Uri::new("mem://arrays/enc").unwrap();
    create_array(&sm, &uri, &key);
    assert_eq!(
        sm.array_get_encryption(&uri).unwrap(),
        fragstore::EncryptionType::NoEncryption
    );
}

#[test]
fn object_model_and_walks() {
    let sm = coordinator();
    let key = EncryptionKey::no_encryption();
    let root = Uri::new("mem://tree").unwrap();
    sm.create_dir(&root).unwrap();
    sm.group_create("mem://tree/g").unwrap();
    let arr = Uri::new("mem://tree/g/a").unwrap();
    create_array(&sm, &arr, &key);

    assert_eq!(sm.object_type(&root.join("g")).unwrap(), ObjectType::Group);
    assert_eq!(sm.object_type(&arr).unwrap(), ObjectType::Array);
    assert_eq!(
        sm.object_type(&root.join("missing")).unwrap(),
        ObjectType::Invalid
    );

    let mut preorder = Vec::new();
    let mut iter = sm.object_iter_begin("mem://tree", WalkOrder::Preorder).unwrap();
    while let Some((uri, object_type)) = iter.next(&sm).unwrap() {
        preorder.push((uri.to_string(), object_type));
    }
    assert_eq!(
        preorder,
        vec![
            ("mem://tree/g".to_string(), ObjectType::Group),
            ("mem://tree/g/a".to_string(), ObjectType::Array),
        ]
    );

    let mut postorder = Vec::new();
    let mut iter = sm.object_iter_begin("mem://tree", WalkOrder::Postorder).unwrap();
    while let Some((uri, object_type)) = iter.next(&sm).unwrap() {
        postorder.push((uri.to_string(), object_type));
    }
    assert_eq!(
        postorder,
        vec![
            ("mem://tree/g/a".to_string(), ObjectType::Array),
            ("mem://tree/g".to_string(), ObjectType::Group),
        ]
    );

    // Non-recursive walk stops at the first level.
    let mut shallow = Vec::new();
    let mut iter = sm.object_iter_begin_non_recursive("mem://tree").unwrap();
    while let Some((uri, _)) = iter.next(&sm).unwrap() {
        shallow.push(uri.to_string());
    }
    assert_eq!(shallow, vec!["mem://tree/g".to_string()]);

    sm.object_move("mem://tree/g", "mem://tree/h").unwrap();
    assert!(sm.is_group(&root.join("h")).unwrap());
    sm.object_remove("mem://tree/h").unwrap();
    assert_eq!(sm.object_type(&root.join("h")).unwrap(), ObjectType::Invalid);
}

#[test]
fn create_collisions_are_rejected() {
    let sm = coordinator();
    let key = EncryptionKey::no_encryption();
    let uri = Uri::new("mem://arrays/dup").unwrap();
    create_array(&sm, &uri, &key);
    assert!(matches!(
        sm.array_create(&uri, &schema_for(&uri), &key),
        Err(StorageError::AlreadyExists(_))
    ));
    sm.group_create("mem://groups/g").unwrap();
    assert!(matches!(
        sm.group_create("mem://groups/g"),
        Err(StorageError::AlreadyExists(_))
    ));
}
