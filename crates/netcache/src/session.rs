//! Session-level cache object.
//!
//! One [`SessionCache`] exists per mounted filesystem session. It owns the
//! backend index cookie keyed by the filesystem identity, under which every
//! file object of the session is acquired. A session whose configuration has
//! caching off, or whose backend declines the index, is *disabled*: every
//! downstream operation becomes a silent no-op, never an error.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{CacheBackend, CookieId, CookieKind, ObjectDef};
use crate::config::CacheConfig;
use crate::coordinator::PageCoordinator;
use crate::inode::CachedInode;
use crate::object::{self, Registration};
use crate::stats::CacheStats;
use crate::uncache::UncacheWorker;

/// Identity of a filesystem (cluster/filesystem id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FsId(pub Uuid);

impl FsId {
    /// Random identity, mostly useful for tests.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Fixed-size backend key.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl From<Uuid> for FsId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for FsId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

struct SessionObjectDef {
    fsid: FsId,
}

impl ObjectDef for SessionObjectDef {
    fn name(&self) -> &'static str {
        "netcache.fsid"
    }

    fn kind(&self) -> CookieKind {
        CookieKind::Index
    }

    fn key(&self) -> Bytes {
        Bytes::copy_from_slice(self.fsid.as_bytes())
    }
}

/// Cache state for one mounted filesystem session.
pub struct SessionCache {
    fsid: FsId,
    config: Arc<CacheConfig>,
    backend: Arc<dyn CacheBackend>,
    cookie: Option<CookieId>,
    stats: Arc<CacheStats>,
    coordinator: PageCoordinator,
}

impl std::fmt::Debug for SessionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCache")
            .field("fsid", &self.fsid)
            .field("cookie", &self.cookie)
            .field("netfs", &self.config.netfs)
            .finish_non_exhaustive()
    }
}

impl SessionCache {
    /// Open the session cache for `fsid`.
    ///
    /// Never fails: if caching is configured off, the configuration is
    /// invalid, or the backend declines, the returned session is disabled.
    pub fn open(config: Arc<CacheConfig>, backend: Arc<dyn CacheBackend>, fsid: FsId) -> Self {
        let cookie = if !config.enabled {
            debug!(%fsid, "Caching disabled by configuration");
            None
        } else if let Err(e) = config.validate() {
            warn!(%fsid, "Invalid cache configuration, caching disabled: {e}");
            None
        } else if fsid.as_bytes().len() > backend.max_key_len() {
            warn!(%fsid, "Filesystem id does not fit backend key, caching disabled");
            None
        } else {
            let def: Arc<dyn ObjectDef> = Arc::new(SessionObjectDef { fsid });
            let cookie = backend.acquire_index(&config.netfs, def);
            if cookie.is_none() {
                warn!(%fsid, "Cache backend unavailable, caching disabled");
            }
            cookie
        };

        if let Some(cookie) = cookie {
            info!(%fsid, ?cookie, netfs = %config.netfs.name, "Session cache opened");
        }

        let stats = Arc::new(CacheStats::new());
        let coordinator = PageCoordinator::new(
            Arc::clone(&stats),
            cookie.map(|_| UncacheWorker::spawn(&config.netfs.name)),
        );

        Self {
            fsid,
            config,
            backend,
            cookie,
            stats,
            coordinator,
        }
    }

    /// Filesystem identity.
    pub fn fsid(&self) -> FsId {
        self.fsid
    }

    /// Whether caching is active for this session.
    pub fn is_enabled(&self) -> bool {
        self.cookie.is_some()
    }

    /// Backend index cookie, if enabled.
    pub fn cookie(&self) -> Option<CookieId> {
        self.cookie
    }

    /// Shared configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Session statistics.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub(crate) fn stats_handle(&self) -> Arc<CacheStats> {
        Arc::clone(&self.stats)
    }

    pub(crate) fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    /// Page operations for files of this session.
    pub fn pages(&self) -> &PageCoordinator {
        &self.coordinator
    }

    /// Register a cache object for a freshly opened file.
    ///
    /// Skipped if the session is disabled, the file is already registered,
    /// or the capability gate is closed.
    pub fn register_inode(&self, inode: &CachedInode) -> Registration {
        object::register(self, inode)
    }

    /// Remote authority revoked the file's capabilities out of band.
    ///
    /// The cached content can no longer be trusted and is discarded.
    pub fn on_capability_revoked(&self, inode: &CachedInode) -> bool {
        inode.revoke_cache()
    }

    /// Close the session, relinquishing the index cookie.
    ///
    /// File objects not individually unregistered are orphaned by the
    /// backend and dropped without further I/O.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.coordinator.shutdown();
        if let Some(cookie) = self.cookie.take() {
            self.backend.relinquish(cookie, false);
            info!(fsid = %self.fsid, ?cookie, "Session cache closed");
        }
    }
}

impl Drop for SessionCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}
