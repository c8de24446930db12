//! Node identity: this node's HID and bit index, and where they persist.
//!
//! Both values are set once by an operator, written to a persistent store and
//! read back at boot. Either may be absent; an unconfigured node refuses to
//! route or send anything.
use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

use super::hid::Hid;

/// Width of the shared bitmap space: valid bit indices are `0..MAX_BIT_INDEX`.
pub const MAX_BIT_INDEX: u8 = 32;

const TREE_IDENTITY: &str = "tree_network";
const KEY_HID: &[u8] = b"my_hid";
const KEY_BIT_INDEX: &[u8] = b"my_bit_index";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store lock poisoned")]
    Poisoned,
}

/// Persistent key-value storage for the node identity. Survives reboot.
pub trait IdentityStore: Send + Sync {
    fn load_hid(&self) -> Result<Option<u16>, StoreError>;
    fn save_hid(&self, hid: u16) -> Result<(), StoreError>;
    fn clear_hid(&self) -> Result<(), StoreError>;
    fn load_bit_index(&self) -> Result<Option<u8>, StoreError>;
    fn save_bit_index(&self, bit: u8) -> Result<(), StoreError>;
    fn clear_bit_index(&self) -> Result<(), StoreError>;
}

/// Sled-backed identity store.
pub struct SledIdentityStore {
    _db: sled::Db,
    tree: sled::Tree,
}

impl SledIdentityStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path_ref = path.as_ref();
        std::fs::create_dir_all(path_ref)?;
        let db = sled::open(path_ref)?;
        let tree = db.open_tree(TREE_IDENTITY)?;
        Ok(Self { _db: db, tree })
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.tree.insert(key, value)?;
        self.tree.flush()?;
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Result<(), StoreError> {
        self.tree.remove(key)?;
        self.tree.flush()?;
        Ok(())
    }
}

impl IdentityStore for SledIdentityStore {
    fn load_hid(&self) -> Result<Option<u16>, StoreError> {
        Ok(self.tree.get(KEY_HID)?.and_then(|v| {
            let bytes: [u8; 2] = v.as_ref().try_into().ok()?;
            Some(u16::from_le_bytes(bytes))
        }))
    }

    fn save_hid(&self, hid: u16) -> Result<(), StoreError> {
        self.put(KEY_HID, &hid.to_le_bytes())
    }

    fn clear_hid(&self) -> Result<(), StoreError> {
        self.remove(KEY_HID)
    }

    fn load_bit_index(&self) -> Result<Option<u8>, StoreError> {
        Ok(self
            .tree
            .get(KEY_BIT_INDEX)?
            .and_then(|v| v.as_ref().first().copied()))
    }

    fn save_bit_index(&self, bit: u8) -> Result<(), StoreError> {
        self.put(KEY_BIT_INDEX, &[bit])
    }

    fn clear_bit_index(&self) -> Result<(), StoreError> {
        self.remove(KEY_BIT_INDEX)
    }
}

/// Volatile store for simulations and tests.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    values: Mutex<HashMap<&'static [u8], Vec<u8>>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut HashMap<&'static [u8], Vec<u8>>) -> T) -> Result<T, StoreError> {
        let mut guard = self.values.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&mut guard))
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn load_hid(&self) -> Result<Option<u16>, StoreError> {
        self.with(|m| {
            m.get(KEY_HID)
                .and_then(|v| Some(u16::from_le_bytes(v.as_slice().try_into().ok()?)))
        })
    }
    fn save_hid(&self, hid: u16) -> Result<(), StoreError> {
        self.with(|m| {
            m.insert(KEY_HID, hid.to_le_bytes().to_vec());
        })
    }
    fn clear_hid(&self) -> Result<(), StoreError> {
        self.with(|m| {
            m.remove(KEY_HID);
        })
    }
    fn load_bit_index(&self) -> Result<Option<u8>, StoreError> {
        self.with(|m| m.get(KEY_BIT_INDEX).and_then(|v| v.first().copied()))
    }
    fn save_bit_index(&self, bit: u8) -> Result<(), StoreError> {
        self.with(|m| {
            m.insert(KEY_BIT_INDEX, vec![bit]);
        })
    }
    fn clear_bit_index(&self) -> Result<(), StoreError> {
        self.with(|m| {
            m.remove(KEY_BIT_INDEX);
        })
    }
}

pub fn is_valid_bit_index(bit: u8) -> bool {
    bit < MAX_BIT_INDEX
}

/// In-memory view of this node's configured identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Identity {
    hid: Option<Hid>,
    bit_index: Option<u8>,
}

impl Identity {
    pub fn unconfigured() -> Self {
        Self::default()
    }

    /// Build directly from raw values; invalid values are treated as absent.
    pub fn with(hid: u16, bit_index: Option<u8>) -> Self {
        Self {
            hid: Hid::new(hid),
            bit_index: bit_index.filter(|b| is_valid_bit_index(*b)),
        }
    }

    /// Read both values from the store. Invalid persisted values are cleared.
    pub fn load(store: &dyn IdentityStore) -> Result<Self, StoreError> {
        let mut identity = Self::default();
        match store.load_hid()? {
            Some(raw) => match Hid::new(raw) {
                Some(hid) => {
                    info!(
                        "HID loaded from store: {}{}",
                        hid,
                        if hid.is_root() { " (ROOT)" } else { "" }
                    );
                    identity.hid = Some(hid);
                }
                None => {
                    warn!("Invalid HID {} in store, clearing", raw);
                    store.clear_hid()?;
                }
            },
            None => info!("No HID configured - node not ready for tree network"),
        }
        match store.load_bit_index()? {
            Some(bit) if is_valid_bit_index(bit) => {
                debug!("Bit index loaded from store: {}", bit);
                identity.bit_index = Some(bit);
            }
            Some(bit) => {
                warn!("Invalid bit index {} in store, clearing", bit);
                store.clear_bit_index()?;
            }
            None => info!("No bit index configured"),
        }
        Ok(identity)
    }

    pub fn hid(&self) -> Option<Hid> {
        self.hid
    }

    /// Raw HID, `0` when unconfigured.
    pub fn raw_hid(&self) -> u16 {
        self.hid.map(Hid::get).unwrap_or(0)
    }

    pub fn bit_index(&self) -> Option<u8> {
        self.bit_index
    }

    pub fn is_configured(&self) -> bool {
        self.hid.is_some()
    }

    pub fn is_fully_configured(&self) -> bool {
        self.hid.is_some() && self.bit_index.is_some()
    }

    pub fn is_root(&self) -> bool {
        self.hid.map(Hid::is_root).unwrap_or(false)
    }

    /// `0` for the root and for unconfigured nodes.
    pub fn parent_hid(&self) -> u16 {
        self.hid.and_then(Hid::parent).map(Hid::get).unwrap_or(0)
    }

    pub fn tree_depth(&self) -> u8 {
        self.hid.map(Hid::depth).unwrap_or(0)
    }

    /// Rejects the unconfigured sentinel and the broadcast marker.
    pub fn configure_hid(&mut self, raw: u16, store: &dyn IdentityStore) -> Result<bool, StoreError> {
        let Some(hid) = Hid::new(raw) else {
            warn!("Invalid HID: {}", raw);
            return Ok(false);
        };
        store.save_hid(raw)?;
        self.hid = Some(hid);
        info!(
            "HID set to: {}{}",
            hid,
            if hid.is_root() { " (ROOT)" } else { "" }
        );
        Ok(true)
    }

    pub fn configure_bit_index(&mut self, bit: u8, store: &dyn IdentityStore) -> Result<bool, StoreError> {
        if !is_valid_bit_index(bit) {
            warn!("Invalid bit index: {} (must be 0-{})", bit, MAX_BIT_INDEX - 1);
            return Ok(false);
        }
        store.save_bit_index(bit)?;
        self.bit_index = Some(bit);
        info!("Bit index set: {}", bit);
        Ok(true)
    }

    pub fn clear_hid(&mut self, store: &dyn IdentityStore) -> Result<(), StoreError> {
        store.clear_hid()?;
        self.hid = None;
        info!("HID cleared");
        Ok(())
    }

    pub fn clear_bit_index(&mut self, store: &dyn IdentityStore) -> Result<(), StoreError> {
        store.clear_bit_index()?;
        self.bit_index = None;
        info!("Bit index cleared");
        Ok(())
    }

    pub fn clear_all(&mut self, store: &dyn IdentityStore) -> Result<(), StoreError> {
        self.clear_hid(store)?;
        self.clear_bit_index(store)
    }

    pub fn status_line(&self) -> String {
        match self.hid {
            None => "HID not configured".to_string(),
            Some(hid) if hid.is_root() => format!("HID:{} (ROOT)", hid),
            Some(hid) => format!("HID:{} P:{}", hid, self.parent_hid()),
        }
    }
}
