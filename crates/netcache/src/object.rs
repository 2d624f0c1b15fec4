//! Per-file cache objects and their lifecycle.
//!
//! # Lifecycle
//!
//! 1. **Register**: on file open, once the capability gate holds, acquire a
//!    data-file cookie under the session's index cookie. Idempotent.
//! 2. **Unregister**: when the gate stops holding or the file is torn down
//!    normally, relinquish the cookie and keep the stored content for
//!    revalidation on the next open.
//! 3. **Revoke**: when the remote authority says the content can no longer be
//!    trusted, discard the stored content and relinquish the cookie.
//!
//! All three take the file's cache-slot lock, so they are mutually exclusive
//! per file. Page operations never take it for longer than a clone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::backend::{CacheBackend, CookieId, CookieKind, ObjectDef};
use crate::caps::CapabilityGate;
use crate::coherency::{CheckAux, CoherencyAux};
use crate::inode::{CachedInode, InodeAttrs, VINO_KEY_LEN, VirtualInode};
use crate::page::PageMapping;
use crate::session::SessionCache;
use crate::stats::CacheStats;

/// Result of a registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// A cache object now backs the file.
    Registered,
    /// Nothing was acquired.
    Skipped(SkipReason),
}

impl Registration {
    /// Whether a cache object was acquired by this call.
    pub fn is_registered(&self) -> bool {
        matches!(self, Self::Registered)
    }
}

/// Why a registration was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Caching is disabled for the session.
    Disabled,
    /// The file already has a cache object.
    AlreadyRegistered,
    /// The capability gate is closed.
    GateClosed,
    /// The backend declined to provide an object.
    Declined,
}

/// Backend callbacks for one file.
pub(crate) struct InodeObjectDef {
    vino: VirtualInode,
    attrs: Arc<RwLock<InodeAttrs>>,
    mapping: Arc<PageMapping>,
    batch: usize,
    pause: Duration,
    stats: Arc<CacheStats>,
}

impl InodeObjectDef {
    /// Clear the cache marker of every mapped page, in yielding batches.
    fn clear_markers(&self) -> u64 {
        let mut cleared = 0u64;
        self.mapping.sweep(self.batch, self.pause, |page| {
            if page.has_cache_marker() {
                page.clear_cache_marker();
                cleared += 1;
            }
        });
        self.stats.record_sweep();
        self.stats.record_markers_cleared(cleared);
        cleared
    }
}

impl ObjectDef for InodeObjectDef {
    fn name(&self) -> &'static str {
        "netcache.inode"
    }

    fn kind(&self) -> CookieKind {
        CookieKind::DataFile
    }

    fn key(&self) -> Bytes {
        Bytes::copy_from_slice(&self.vino.to_key())
    }

    fn attr_size(&self) -> u64 {
        self.attrs.read().size
    }

    fn aux(&self) -> Option<Bytes> {
        Some(self.attrs.read().aux().to_bytes())
    }

    fn check_aux(&self, stored: &[u8]) -> CheckAux {
        let verdict = self.attrs.read().aux().check(stored);
        match verdict {
            CheckAux::Okay => {
                debug!(ino = self.vino.ino, snap = self.vino.snap, "Inode cached okay");
            }
            CheckAux::Obsolete => {
                debug!(ino = self.vino.ino, snap = self.vino.snap, "Inode cache obsolete");
            }
        }
        verdict
    }

    fn now_uncached(&self) {
        debug!(ino = self.vino.ino, snap = self.vino.snap, "Inode now uncached");
        let cleared = self.clear_markers();
        trace!(ino = self.vino.ino, cleared, "Cache markers cleared");
    }
}

/// A registered per-file cache object.
pub struct FileCacheObject {
    cookie: CookieId,
    vino: VirtualInode,
    backend: Arc<dyn CacheBackend>,
    def: Arc<InodeObjectDef>,
    revoked: Arc<AtomicBool>,
    last_aux: Mutex<CoherencyAux>,
}

impl std::fmt::Debug for FileCacheObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCacheObject")
            .field("cookie", &self.cookie)
            .field("vino", &self.vino)
            .field("revoked", &self.is_revoked())
            .finish_non_exhaustive()
    }
}

impl FileCacheObject {
    /// Backend cookie naming this object.
    pub fn cookie(&self) -> CookieId {
        self.cookie
    }

    /// Identity of the cached file.
    pub fn vino(&self) -> VirtualInode {
        self.vino
    }

    /// Whether the content was revoked.
    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }

    /// The fingerprint most recently observed for this object.
    pub fn last_aux(&self) -> CoherencyAux {
        *self.last_aux.lock()
    }

    pub(crate) fn observe_aux(&self, aux: CoherencyAux) {
        *self.last_aux.lock() = aux;
    }

    pub(crate) fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    pub(crate) fn revoked_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.revoked)
    }

    pub(crate) fn stats(&self) -> &CacheStats {
        &self.def.stats
    }
}

/// Register a cache object for `inode` under `session`.
pub(crate) fn register(session: &SessionCache, inode: &CachedInode) -> Registration {
    let stats = session.stats();
    let vino = inode.vino();
    let skip = |reason: SkipReason| {
        stats.record_registration_skip();
        trace!(ino = vino.ino, snap = vino.snap, ?reason, "Inode cache registration skipped");
        Registration::Skipped(reason)
    };

    let Some(parent) = session.cookie() else {
        return skip(SkipReason::Disabled);
    };

    let mut slot = inode.cache_slot();
    if slot.is_some() {
        return skip(SkipReason::AlreadyRegistered);
    }
    if !CapabilityGate::evaluate(inode) {
        return skip(SkipReason::GateClosed);
    }

    let backend = session.backend();
    if VINO_KEY_LEN > backend.max_key_len() {
        return skip(SkipReason::Declined);
    }

    let config = session.config();
    let def = Arc::new(InodeObjectDef {
        vino,
        attrs: inode.shared_attrs(),
        mapping: Arc::clone(inode.mapping()),
        batch: config.uncache_batch,
        pause: config.uncache_pause,
        stats: session.stats_handle(),
    });

    let Some(cookie) = backend.acquire_data(parent, Arc::clone(&def) as Arc<dyn ObjectDef>) else {
        return skip(SkipReason::Declined);
    };

    *slot = Some(Arc::new(FileCacheObject {
        cookie,
        vino,
        backend: Arc::clone(backend),
        def,
        revoked: Arc::new(AtomicBool::new(false)),
        last_aux: Mutex::new(inode.aux()),
    }));
    stats.record_registration();
    debug!(ino = vino.ino, snap = vino.snap, ?cookie, "Inode cache registered");
    Registration::Registered
}

impl CachedInode {
    /// Drop the cache object, keeping its stored content for revalidation.
    ///
    /// Returns `false` if no object was registered.
    pub fn unregister_cache(&self) -> bool {
        let mut slot = self.cache_slot();
        let Some(object) = slot.take() else {
            return false;
        };
        object.backend.relinquish(object.cookie, false);
        drop(slot);

        object.stats().record_unregistration();
        debug!(ino = object.vino.ino, cookie = ?object.cookie, "Inode cache unregistered");
        true
    }

    /// Drop the cache object and discard its stored content.
    ///
    /// Outstanding read completions for the object are neutralised before
    /// the store is touched. Returns `false` if no object was registered.
    pub fn revoke_cache(&self) -> bool {
        let mut slot = self.cache_slot();
        let Some(object) = slot.take() else {
            return false;
        };
        object.revoked.store(true, Ordering::Release);
        object.backend.invalidate(object.cookie);
        object.backend.relinquish(object.cookie, true);
        drop(slot);

        object.def.clear_markers();
        object.stats().record_revocation();
        debug!(ino = object.vino.ino, cookie = ?object.cookie, "Inode cache revoked");
        true
    }
}
