use std::sync::Arc;

use tempfile::tempdir;
use treemesh::io::device::MemoryPins;
use treemesh::node::{NodeSettings, TreeNode};
use treemesh::radio::{station_address, RecordingRadio};
use treemesh::tree::identity::{Identity, IdentityStore, SledIdentityStore};

#[test]
fn identity_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("identity");
    {
        let store = SledIdentityStore::open(&path).unwrap();
        let mut identity = Identity::load(&store).unwrap();
        assert!(!identity.is_configured());
        assert!(identity.configure_hid(121, &store).unwrap());
        assert!(identity.configure_bit_index(5, &store).unwrap());
    }
    let store = SledIdentityStore::open(&path).unwrap();
    let identity = Identity::load(&store).unwrap();
    assert_eq!(identity.raw_hid(), 121);
    assert_eq!(identity.bit_index(), Some(5));
    assert_eq!(identity.parent_hid(), 12);
    assert_eq!(identity.status_line(), "HID:121 P:12");
}

#[test]
fn reserved_values_are_refused_and_not_stored() {
    let dir = tempdir().unwrap();
    let store = SledIdentityStore::open(dir.path()).unwrap();
    let mut identity = Identity::load(&store).unwrap();
    assert!(!identity.configure_hid(0, &store).unwrap());
    assert!(!identity.configure_hid(0xFFFF, &store).unwrap());
    assert!(!identity.configure_bit_index(32, &store).unwrap());
    assert_eq!(store.load_hid().unwrap(), None);
    assert_eq!(store.load_bit_index().unwrap(), None);
}

#[test]
fn invalid_persisted_values_are_cleared_on_load() {
    let dir = tempdir().unwrap();
    let store = SledIdentityStore::open(dir.path()).unwrap();
    store.save_hid(0xFFFF).unwrap();
    store.save_bit_index(40).unwrap();
    let identity = Identity::load(&store).unwrap();
    assert!(!identity.is_configured());
    assert_eq!(store.load_hid().unwrap(), None);
    assert_eq!(store.load_bit_index().unwrap(), None);
}

#[test]
fn node_clear_identity_persists() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("node");
    let store: Arc<dyn IdentityStore> = Arc::new(SledIdentityStore::open(&path).unwrap());
    store.save_hid(1).unwrap();
    store.save_bit_index(0).unwrap();

    let radio = RecordingRadio::new(station_address(1));
    let mut node =
        TreeNode::new(store.clone(), radio, MemoryPins::new(), NodeSettings::default()).unwrap();
    assert!(node.identity().is_root());
    node.clear_identity().unwrap();
    assert!(!node.identity().is_configured());
    assert!(!node.send_data_report());
    assert_eq!(store.load_hid().unwrap(), None);
}
