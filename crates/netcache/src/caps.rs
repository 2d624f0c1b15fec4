//! Capability model and the gate that guards cache use.
//!
//! The remote filesystem hands out capabilities per file. Only a client that
//! holds the read-cache or lazy-IO capability (issued, implemented, or still
//! pending as dirty) may read file content from or write it to the local
//! cache. [`CapabilityGate::evaluate`] is the single place that decision is
//! made; it is never cached because capability state changes independently of
//! the file object's lifecycle.

use bitflags::bitflags;
use dashmap::DashMap;
use tracing::trace;

use crate::inode::{CachedInode, FileKind, VirtualInode};

bitflags! {
    /// Capability bits granted by the remote authority for one file.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Caps: u32 {
        /// Shared access to file metadata.
        const SHARED = 1 << 0;
        /// Client may read file content.
        const READ = 1 << 1;
        /// Client may cache file content locally.
        const CACHE = 1 << 2;
        /// Client may write file content.
        const WRITE = 1 << 3;
        /// Client may buffer writes.
        const BUFFER = 1 << 4;
        /// Client may perform lazy (relaxed-coherency) IO.
        const LAZY_IO = 1 << 5;
    }
}

impl Caps {
    /// Capabilities any one of which allows use of the local cache.
    pub const CACHE_WANT: Caps = Caps::CACHE.union(Caps::LAZY_IO);
}

/// The client's capability state for one file at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapSnapshot {
    /// Capabilities issued by the remote authority.
    pub issued: Caps,
    /// Capabilities the client is still implementing (revocation in flight).
    pub implemented: Caps,
    /// Capabilities with dirty state not yet flushed.
    pub dirty: Caps,
}

impl CapSnapshot {
    /// Snapshot with only issued capabilities.
    pub fn issued(caps: Caps) -> Self {
        Self {
            issued: caps,
            ..Self::default()
        }
    }

    /// Union of issued, implemented and dirty capabilities.
    pub fn effective(&self) -> Caps {
        self.issued | self.implemented | self.dirty
    }
}

/// Source of capability state, implemented by the remote capability layer.
pub trait CapabilitySource: Send + Sync {
    /// Current capability state for a file.
    fn capabilities(&self, vino: VirtualInode) -> CapSnapshot;
}

/// The combined file-type and capability predicate.
#[derive(Debug, Clone, Copy, Default)]
pub struct CapabilityGate;

impl CapabilityGate {
    /// Whether the file may use the cache right now.
    ///
    /// True iff the file is a regular data file and the client holds at
    /// least one of read-cache or lazy-IO.
    pub fn evaluate(inode: &CachedInode) -> bool {
        if inode.kind() != FileKind::Regular {
            return false;
        }
        let caps = inode.capabilities().effective();
        let open = caps.intersects(Caps::CACHE_WANT);
        if !open {
            let vino = inode.vino();
            trace!(ino = vino.ino, snap = vino.snap, ?caps, "No caps for caching inode");
        }
        open
    }
}

/// Concurrent capability table driven by the capability protocol layer.
///
/// Files with no entry hold no capabilities.
#[derive(Debug, Default)]
pub struct CapTable {
    entries: DashMap<VirtualInode, CapSnapshot>,
}

impl CapTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add issued capabilities for a file.
    pub fn grant(&self, vino: VirtualInode, caps: Caps) {
        self.entries.entry(vino).or_default().issued |= caps;
    }

    /// Record capabilities as implemented (revocation acknowledged but not
    /// finished).
    pub fn set_implemented(&self, vino: VirtualInode, caps: Caps) {
        self.entries.entry(vino).or_default().implemented = caps;
    }

    /// Record capabilities with dirty state pending flush.
    pub fn set_dirty(&self, vino: VirtualInode, caps: Caps) {
        self.entries.entry(vino).or_default().dirty = caps;
    }

    /// Remove capabilities from every set for a file.
    pub fn revoke(&self, vino: VirtualInode, caps: Caps) {
        if let Some(mut entry) = self.entries.get_mut(&vino) {
            entry.issued.remove(caps);
            entry.implemented.remove(caps);
            entry.dirty.remove(caps);
        }
    }

    /// Drop all state for a file.
    pub fn forget(&self, vino: VirtualInode) {
        self.entries.remove(&vino);
    }
}

impl CapabilitySource for CapTable {
    fn capabilities(&self, vino: VirtualInode) -> CapSnapshot {
        self.entries.get(&vino).map(|e| *e).unwrap_or_default()
    }
}
