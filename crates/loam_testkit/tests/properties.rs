//! Property tests for the engine's invariants.

use loam_blob::{BlobKey, BlobStore};
use loam_core::{collate, group_key, group_together, Collation};
use loam_replicator::checkpoint_doc_id;
use proptest::prelude::*;
use serde_json::{json, Value};

/// Arbitrary JSON keys of the shapes map functions actually emit.
fn json_key() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i32>().prop_map(Value::from),
        "[a-zA-Z0-9 ]{0,12}".prop_map(Value::from),
    ];
    leaf.prop_recursive(3, 16, 4, |inner| {
        prop::collection::vec(inner, 0..4).prop_map(Value::Array)
    })
}

proptest! {
    #[test]
    fn stored_blobs_hash_to_their_key(content in prop::collection::vec(any::<u8>(), 0..2048)) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(&dir.path().join("attachments")).unwrap();
        let (key, length) = store.store_blob(&content).unwrap();
        prop_assert_eq!(length, content.len() as u64);
        let read_back = store.blob_contents(&key).unwrap();
        prop_assert_eq!(BlobKey::of(&read_back), key);
    }

    #[test]
    fn group_together_is_reflexive(key in json_key(), level in 0usize..6) {
        prop_assert!(group_together(&key, &key, level));
    }

    #[test]
    fn group_key_groups_with_its_source(key in json_key(), level in 0usize..6) {
        // The reported group key must itself belong to the group.
        let grouped = group_key(&key, level);
        prop_assert!(group_together(&key, &grouped, level));
    }

    #[test]
    fn checkpoint_id_is_pure(
        uuid in "[a-f0-9]{8,32}",
        url in "http://[a-z]{3,10}/[a-z]{1,8}",
        push in any::<bool>(),
    ) {
        let first = checkpoint_doc_id(&uuid, &url, push);
        let second = checkpoint_doc_id(&uuid, &url, push);
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(first.len(), 40);
        // Direction is part of the identity.
        prop_assert_ne!(first, checkpoint_doc_id(&uuid, &url, !push));
    }

    #[test]
    fn collation_is_a_total_order(a in json_key(), b in json_key(), c in json_key()) {
        use std::cmp::Ordering;
        for collation in [Collation::Unicode, Collation::Ascii, Collation::Raw] {
            // Antisymmetry.
            prop_assert_eq!(
                collate(&a, &b, collation),
                collate(&b, &a, collation).reverse()
            );
            // Transitivity of <=.
            if collate(&a, &b, collation) != Ordering::Greater
                && collate(&b, &c, collation) != Ordering::Greater
            {
                prop_assert_ne!(collate(&a, &c, collation), Ordering::Greater);
            }
        }
    }
}

#[test]
fn group_together_matches_prefix_semantics() {
    // Anchor the property tests with the concrete contract.
    assert!(group_together(&json!([1, 1]), &json!([1, 2]), 1));
    assert!(!group_together(&json!([1, 1]), &json!([1, 2]), 0));
    assert_eq!(group_key(&json!([1, 2, 3]), 2), json!([1, 2]));
}
