//! The in-memory file representation seen by the cache coordinator.
//!
//! A [`CachedInode`] is what the filesystem client keeps for each open file:
//! its stable virtual identity, its authoritative remote attributes, its page
//! mapping, and the slot holding its [`FileCacheObject`] while one is
//! registered. The slot is the only mutable state this crate protects;
//! registration, unregistration and revocation all take its lock, while page
//! operations only clone the handle out of it.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::caps::{CapSnapshot, CapabilitySource};
use crate::coherency::{CoherencyAux, Timestamp};
use crate::object::FileCacheObject;
use crate::page::PageMapping;

/// Snapshot id of the live (non-snapshot) view of a file.
pub const SNAP_HEAD: u64 = u64::MAX - 1;

/// Encoded length of a [`VirtualInode`] key.
pub const VINO_KEY_LEN: usize = 16;

/// Stable identity of a file version: inode number plus snapshot id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtualInode {
    /// Inode number.
    pub ino: u64,
    /// Snapshot id.
    pub snap: u64,
}

impl VirtualInode {
    /// Create a virtual inode.
    pub const fn new(ino: u64, snap: u64) -> Self {
        Self { ino, snap }
    }

    /// The live (head) version of an inode.
    pub const fn head(ino: u64) -> Self {
        Self::new(ino, SNAP_HEAD)
    }

    /// Fixed-size backend key.
    pub fn to_key(&self) -> [u8; VINO_KEY_LEN] {
        let mut key = [0u8; VINO_KEY_LEN];
        key[..8].copy_from_slice(&self.ino.to_le_bytes());
        key[8..].copy_from_slice(&self.snap.to_le_bytes());
        key
    }
}

/// Remote file type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Regular data file.
    Regular,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
    /// Anything else (devices, fifos, sockets).
    Special,
}

/// Authoritative remote attributes relevant to coherency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InodeAttrs {
    /// Remote modification time.
    pub mtime: Timestamp,
    /// Remote logical size in bytes.
    pub size: u64,
}

impl InodeAttrs {
    /// Create attributes.
    pub const fn new(mtime: Timestamp, size: u64) -> Self {
        Self { mtime, size }
    }

    /// Coherency fingerprint of these attributes.
    pub fn aux(&self) -> CoherencyAux {
        CoherencyAux::new(self.mtime, self.size)
    }
}

/// In-memory representation of one file.
pub struct CachedInode {
    vino: VirtualInode,
    kind: FileKind,
    attrs: Arc<RwLock<InodeAttrs>>,
    caps: Arc<dyn CapabilitySource>,
    mapping: Arc<PageMapping>,
    cache: Mutex<Option<Arc<FileCacheObject>>>,
}

impl std::fmt::Debug for CachedInode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never hold the attrs lock while taking the slot: registration takes
        // them in the other order.
        let attrs = self.attrs();
        let cached = self.is_cached();
        f.debug_struct("CachedInode")
            .field("vino", &self.vino)
            .field("kind", &self.kind)
            .field("attrs", &attrs)
            .field("cached", &cached)
            .finish_non_exhaustive()
    }
}

impl CachedInode {
    /// Create a file representation with an empty page mapping.
    pub fn new(
        vino: VirtualInode,
        kind: FileKind,
        attrs: InodeAttrs,
        caps: Arc<dyn CapabilitySource>,
    ) -> Self {
        Self {
            vino,
            kind,
            attrs: Arc::new(RwLock::new(attrs)),
            caps,
            mapping: Arc::new(PageMapping::new()),
            cache: Mutex::new(None),
        }
    }

    /// Virtual identity.
    pub fn vino(&self) -> VirtualInode {
        self.vino
    }

    /// Remote file type.
    pub fn kind(&self) -> FileKind {
        self.kind
    }

    /// Current remote attributes.
    pub fn attrs(&self) -> InodeAttrs {
        *self.attrs.read()
    }

    /// Replace the remote attributes (after a metadata refresh).
    pub fn set_attrs(&self, attrs: InodeAttrs) {
        *self.attrs.write() = attrs;
    }

    /// Current coherency fingerprint.
    pub fn aux(&self) -> CoherencyAux {
        self.attrs().aux()
    }

    /// Current capability state.
    pub fn capabilities(&self) -> CapSnapshot {
        self.caps.capabilities(self.vino)
    }

    /// The file's page mapping.
    pub fn mapping(&self) -> &Arc<PageMapping> {
        &self.mapping
    }

    /// The registered cache object, if any.
    pub fn cache_object(&self) -> Option<Arc<FileCacheObject>> {
        self.cache.lock().clone()
    }

    /// Whether a cache object is registered.
    pub fn is_cached(&self) -> bool {
        self.cache.lock().is_some()
    }

    pub(crate) fn shared_attrs(&self) -> Arc<RwLock<InodeAttrs>> {
        Arc::clone(&self.attrs)
    }

    /// Exclusive access to the cache-handle slot.
    pub(crate) fn cache_slot(&self) -> MutexGuard<'_, Option<Arc<FileCacheObject>>> {
        self.cache.lock()
    }
}
