//! Page-level cache operations.
//!
//! [`PageCoordinator`] sits between the page cache and the backend store.
//! Every operation starts by cloning the file's cache object out of its slot;
//! a file without one gets "not applicable" behaviour, never an error. Every
//! backend failure is logged and demoted to miss semantics so the read and
//! write paths always have a remote fallback.
//!
//! # Locking contracts
//!
//! - [`PageCoordinator::read_page`] is called with the page already locked;
//!   its completion only marks the page valid and never unlocks it.
//! - [`PageCoordinator::read_pages`] locks the pages the store takes and its
//!   completion unlocks them, on success or error.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::backend::{CompletionMode, ReadCompletion, ReclaimHint};
use crate::caps::CapabilityGate;
use crate::error::{BackendError, CacheError};
use crate::inode::CachedInode;
use crate::page::Page;
use crate::stats::CacheStats;
use crate::uncache::{UncacheTicket, UncacheWorker};

/// Result of a cache read attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The store took the read; wait for completion, do not fetch remotely.
    Submitted,
    /// The cache cannot serve the read; fetch remotely.
    Fallback(CacheError),
}

impl ReadOutcome {
    /// Whether the read was submitted to the store.
    pub fn is_submitted(&self) -> bool {
        matches!(self, Self::Submitted)
    }

    /// Whether the content is simply not available from the cache.
    pub fn is_miss(&self) -> bool {
        matches!(self, Self::Fallback(e) if !e.is_backend_failure())
    }

    /// Whether the store failed unexpectedly.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Fallback(e) if e.is_backend_failure())
    }

    /// Whether the caller must fetch the content remotely.
    pub fn needs_remote_fetch(&self) -> bool {
        !self.is_submitted()
    }
}

/// Result of a cache write attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The page is stored.
    Stored,
    /// The page was not stored; its cache marker is cleared.
    Skipped(CacheError),
}

impl WriteOutcome {
    /// Whether the page is stored.
    pub fn is_stored(&self) -> bool {
        matches!(self, Self::Stored)
    }
}

/// Advice to the memory reclaimer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseDecision {
    /// The store still needs the page; keep it.
    Retain,
    /// The page may be reclaimed.
    Release,
}

/// Gated page read/write/invalidate/release against file cache objects.
pub struct PageCoordinator {
    stats: Arc<CacheStats>,
    uncache: Option<UncacheWorker>,
}

impl std::fmt::Debug for PageCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCoordinator")
            .field("async_uncache", &self.uncache.is_some())
            .finish_non_exhaustive()
    }
}

impl PageCoordinator {
    pub(crate) fn new(stats: Arc<CacheStats>, uncache: Option<UncacheWorker>) -> Self {
        Self { stats, uncache }
    }

    pub(crate) fn shutdown(&mut self) {
        if let Some(worker) = self.uncache.as_mut() {
            worker.shutdown();
        }
    }

    /// Try to read one locked page from the cache.
    ///
    /// The caller holds the page lock and keeps it: the completion marks the
    /// page up to date but never unlocks it.
    pub fn read_page(&self, inode: &CachedInode, page: &Arc<Page>) -> ReadOutcome {
        let Some(object) = inode.cache_object() else {
            return ReadOutcome::Fallback(CacheError::Disabled);
        };
        debug_assert!(page.is_locked(), "read_page requires a locked page");

        if !CapabilityGate::evaluate(inode) {
            self.stats.record_read_miss();
            return ReadOutcome::Fallback(CacheError::GateClosed);
        }

        let done = ReadCompletion::new(CompletionMode::KeepLocked, object.revoked_flag());
        let result = object.backend().read_page(object.cookie(), page, done);
        self.classify_read(inode, result, "page")
    }

    /// Try to read a batch of pages (read-ahead) from the cache.
    ///
    /// The gate is re-checked first; capabilities may have been revoked since
    /// the read-ahead was scheduled. Pages the store takes are removed from
    /// `pages`, locked, and unlocked again by their completion. Pages left in
    /// `pages` are untouched and must be fetched remotely.
    pub fn read_pages(&self, inode: &CachedInode, pages: &mut Vec<Arc<Page>>) -> ReadOutcome {
        let Some(object) = inode.cache_object() else {
            return ReadOutcome::Fallback(CacheError::Disabled);
        };

        if !CapabilityGate::evaluate(inode) {
            self.stats.record_read_miss();
            return ReadOutcome::Fallback(CacheError::GateClosed);
        }
        if pages.is_empty() {
            return ReadOutcome::Submitted;
        }

        let done = ReadCompletion::new(CompletionMode::Unlock, object.revoked_flag());
        let result = object.backend().read_pages(object.cookie(), pages, done);
        self.classify_read(inode, result, "pages")
    }

    fn classify_read(
        &self,
        inode: &CachedInode,
        result: Result<(), BackendError>,
        what: &'static str,
    ) -> ReadOutcome {
        let ino = inode.vino().ino;
        match result {
            Ok(()) => {
                self.stats.record_read_submitted();
                trace!(ino, what, "Cache read submitted");
                ReadOutcome::Submitted
            }
            Err(e) if e.is_miss() => {
                self.stats.record_read_miss();
                trace!(ino, what, reason = %e, "Page/inode not in cache");
                ReadOutcome::Fallback(CacheError::from_backend(e))
            }
            Err(e) => {
                self.stats.record_read_error();
                warn!(ino, what, "Unexpected cache read error: {e}");
                ReadOutcome::Fallback(CacheError::Backend(e))
            }
        }
    }

    /// Populate the cache with a page just fetched from the remote side.
    ///
    /// On failure the page's cache presence is actively cleared so no later
    /// read can observe partial content.
    pub fn write_page(&self, inode: &CachedInode, page: &Page) -> WriteOutcome {
        let Some(object) = inode.cache_object() else {
            return WriteOutcome::Skipped(CacheError::Disabled);
        };
        if !CapabilityGate::evaluate(inode) {
            return WriteOutcome::Skipped(CacheError::GateClosed);
        }

        let backend = object.backend();
        let cookie = object.cookie();
        backend.begin_page_write(cookie, page);
        page.begin_write();
        let outcome = match backend.write_page(cookie, page) {
            Ok(()) if page.finish_write() => {
                object.observe_aux(inode.aux());
                self.stats.record_write();
                trace!(ino = inode.vino().ino, page = page.index(), "Page written to cache");
                WriteOutcome::Stored
            }
            Ok(()) => {
                // The marker was dropped while the write was in flight.
                backend.uncache_page(cookie, page);
                self.stats.record_write_failure();
                debug!(ino = inode.vino().ino, page = page.index(), "Cache write raced a marker drop");
                WriteOutcome::Skipped(CacheError::Miss)
            }
            Err(e) => {
                backend.uncache_page(cookie, page);
                page.clear_cache_marker();
                self.stats.record_write_failure();
                debug!(ino = inode.vino().ino, page = page.index(), "Cache write failed: {e}");
                WriteOutcome::Skipped(CacheError::from_backend(e))
            }
        };
        backend.end_page_write(cookie, page);
        outcome
    }

    /// Drop a page whose content is known to be stale.
    ///
    /// Waits for any in-flight write of the page before removing it, so a
    /// stale write can never land after the removal.
    pub fn invalidate_page(&self, inode: &CachedInode, page: &Page) {
        let Some(object) = inode.cache_object() else {
            return;
        };
        if !page.has_cache_marker() {
            return;
        }

        let backend = object.backend();
        backend.wait_on_page_write(object.cookie(), page);
        backend.uncache_page(object.cookie(), page);
        page.clear_cache_marker();
        self.stats.record_invalidation();
        trace!(ino = inode.vino().ino, page = page.index(), "Page invalidated");
    }

    /// Ask whether a page may be reclaimed under memory pressure.
    pub fn release_page(&self, inode: &CachedInode, page: &Page, hint: ReclaimHint) -> ReleaseDecision {
        let Some(object) = inode.cache_object() else {
            return ReleaseDecision::Release;
        };
        if !page.has_cache_marker() {
            return ReleaseDecision::Release;
        }

        if object.backend().maybe_release_page(object.cookie(), page, hint) {
            page.clear_cache_marker();
            self.stats.record_release();
            ReleaseDecision::Release
        } else {
            self.stats.record_retain();
            ReleaseDecision::Retain
        }
    }

    /// Ask the store to drop every page of the file, without waiting.
    ///
    /// Safe to call on an unregistered file (the ticket is already complete)
    /// and safe to repeat.
    pub fn async_uncache(&self, inode: &CachedInode) -> UncacheTicket {
        let Some(object) = inode.cache_object() else {
            return UncacheTicket::completed();
        };
        let Some(worker) = &self.uncache else {
            return UncacheTicket::completed();
        };
        self.stats.record_async_uncache();
        debug!(ino = inode.vino().ino, cookie = ?object.cookie(), "Queueing async uncache");
        worker.submit(
            Arc::clone(object.backend()),
            object.cookie(),
            Arc::clone(inode.mapping()),
        )
    }
}
