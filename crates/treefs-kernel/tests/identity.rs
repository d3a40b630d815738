//! Identity objects handed to indexers.

use proptest::prelude::*;
use treefs_kernel::identity::identity_id;
use treefs_kernel::{IdentityObject, MetaType};
use treefs_testutil::{memory_service, repo_path};
use treefs_types::{AttrValue, FileAttribute, FsPath};

#[tokio::test]
async fn content_changes_keep_identity() {
    let service = memory_service();
    let path = repo_path("/docs/readme.md");
    service.write_string(&path, "one", &[]).await.unwrap();
    let before = service.to_identity(&path, Vec::new());
    service.write_string(&path, "two", &[]).await.unwrap();
    let after = service.to_identity(&path, Vec::new());

    assert_eq!(before.id(), after.id());
    assert_eq!(before, after);
}

#[test]
fn identity_key_carries_cluster_and_segment() {
    let path = FsPath::object("repo", "dev", "/a/b.tar.gz").unwrap();
    let identity = IdentityObject::new(&path, vec![FileAttribute::new("lang", "none")]);
    let key = identity.key();

    assert_eq!(key.cluster_id, "repo");
    assert_eq!(key.segment_id, "dev");
    assert_eq!(key.key, "git://dev@repo/a/b.tar.gz");
    assert_eq!(key.id, identity_id(&MetaType::PATH, "git://dev@repo/a/b.tar.gz"));
    assert_eq!(identity.property("filename"), Some(&AttrValue::from("b.tar.gz")));
    assert_eq!(identity.property("extension"), Some(&AttrValue::from("gz")));
    assert_eq!(identity.property("basename"), Some(&AttrValue::from("b.tar")));
    assert_eq!(identity.property("lang"), Some(&AttrValue::from("none")));
    assert_eq!(identity.properties()[0].name, "lang");
}

#[test]
fn root_file_name_is_slash() {
    let identity = IdentityObject::new(&repo_path("/"), Vec::new());
    assert_eq!(identity.property("filename"), Some(&AttrValue::from("/")));
    assert_eq!(identity.property("basename"), Some(&AttrValue::from("")));
    assert_eq!(identity.property("extension"), Some(&AttrValue::from("")));
}

proptest! {
    #[test]
    fn equal_keys_equal_ids(key in "(/[a-z0-9_-]{1,6}){1,4}") {
        let a = IdentityObject::new(&repo_path(&key), Vec::new());
        let b = IdentityObject::new(&repo_path(&key), Vec::new());
        prop_assert_eq!(a.id(), b.id());
    }

    #[test]
    fn segments_never_collide(key in "(/[a-z0-9_-]{1,6}){1,4}") {
        let master = IdentityObject::new(&FsPath::object("repo", "master", &key).unwrap(), Vec::new());
        let dev = IdentityObject::new(&FsPath::object("repo", "dev", &key).unwrap(), Vec::new());
        prop_assert_ne!(master.id(), dev.id());
    }

    #[test]
    fn distinct_keys_distinct_ids(
        a in "(/[a-z]{1,6}){1,3}",
        b in "(/[a-z]{1,6}){1,3}",
    ) {
        prop_assume!(a != b);
        let ia = IdentityObject::new(&repo_path(&a), Vec::new());
        let ib = IdentityObject::new(&repo_path(&b), Vec::new());
        prop_assert_ne!(ia.id(), ib.id());
    }
}
