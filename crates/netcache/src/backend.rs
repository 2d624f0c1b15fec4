//! Contract between the coordinator and the persistent cache store.
//!
//! The store itself is an external collaborator: it owns durability, layout
//! and I/O scheduling. This module defines only what the coordinator needs
//! from it ([`CacheBackend`]) and what it needs from the coordinator in
//! return ([`ObjectDef`], [`ReadCompletion`]).
//!
//! # Cookies
//!
//! Every object the coordinator acquires is named by a [`CookieId`]. Index
//! cookies represent a filesystem session; data-file cookies represent one
//! file and are children of an index cookie. A cookie stays valid until it is
//! relinquished. Operations on a cookie the store no longer knows must answer
//! [`BackendError::NoBuffers`] rather than fail.
//!
//! # Read completions
//!
//! For every page a backend decides to serve it must first call
//! [`ReadCompletion::claim`] and later exactly once
//! [`ReadCompletion::complete`], possibly from another thread and in any order
//! across pages. Pages it does not claim must be left untouched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use crate::coherency::CheckAux;
use crate::config::NetfsDefinition;
use crate::error::BackendError;
use crate::page::{Page, PageMapping};

/// Opaque name of an object acquired from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CookieId(pub u64);

/// Kind of object a cookie names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieKind {
    /// An index (one per filesystem session).
    Index,
    /// A data file (one per cached file).
    DataFile,
}

/// Callbacks the store invokes on an object's owner.
pub trait ObjectDef: Send + Sync {
    /// Object type name, for diagnostics.
    fn name(&self) -> &'static str;

    /// Kind of object.
    fn kind(&self) -> CookieKind;

    /// Index key of the object within its parent.
    fn key(&self) -> Bytes;

    /// Size of the object's data, reported to the store.
    fn attr_size(&self) -> u64 {
        0
    }

    /// Current coherency fingerprint to store alongside the data.
    fn aux(&self) -> Option<Bytes> {
        None
    }

    /// Compare a stored fingerprint against the current one.
    fn check_aux(&self, _stored: &[u8]) -> CheckAux {
        CheckAux::Okay
    }

    /// The store has dropped this object; forget every cache marker.
    fn now_uncached(&self) {}
}

/// Who owns the page lock when a read completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// The caller holds the page lock and keeps unlock control.
    KeepLocked,
    /// The read path locked the page and must unlock it on completion.
    Unlock,
}

/// Completion handler for page reads submitted to the store.
#[derive(Debug, Clone)]
pub struct ReadCompletion {
    mode: CompletionMode,
    revoked: Arc<AtomicBool>,
}

impl ReadCompletion {
    pub(crate) fn new(mode: CompletionMode, revoked: Arc<AtomicBool>) -> Self {
        Self { mode, revoked }
    }

    /// Locking contract of this completion.
    pub fn mode(&self) -> CompletionMode {
        self.mode
    }

    /// Take ownership of a page for reading.
    ///
    /// Returns `false` if the page cannot be claimed (already locked by
    /// someone else, or already being read); the backend must then leave the
    /// page to the caller.
    pub fn claim(&self, page: &Page) -> bool {
        if self.mode == CompletionMode::Unlock && !page.try_lock() {
            return false;
        }
        if !page.begin_read() {
            if self.mode == CompletionMode::Unlock {
                page.unlock();
            }
            return false;
        }
        true
    }

    /// Settle a claimed page with the bytes the store read for it.
    ///
    /// The bytes are installed, and the page marked valid, only if the page
    /// was neither invalidated nor its object revoked while the read was in
    /// flight. A dropped completion leaves the page content alone. Unlocking
    /// completions release the page lock in every case.
    pub fn complete(&self, page: &Page, result: Result<Bytes, BackendError>) {
        let trusted = !self.revoked.load(Ordering::Acquire);
        let ok = result.is_ok() && trusted;
        if page.finish_read(ok) {
            if let Ok(data) = result {
                page.fill(data);
            }
            page.set_uptodate();
        } else if result.is_ok() {
            trace!(page = page.index(), trusted, "Dropping stale read completion");
        }
        if self.mode == CompletionMode::Unlock {
            page.unlock();
        }
    }
}

/// Allocation context of a reclaim request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimHint {
    /// The reclaimer may block waiting for in-flight store I/O.
    MayWait,
    /// The reclaimer must not block.
    NoWait,
}

/// The persistent cache store.
pub trait CacheBackend: Send + Sync {
    /// Largest object key the store accepts.
    fn max_key_len(&self) -> usize;

    /// Acquire the index object for one filesystem session.
    fn acquire_index(&self, netfs: &NetfsDefinition, def: Arc<dyn ObjectDef>) -> Option<CookieId>;

    /// Acquire a data-file object under an index object.
    ///
    /// The store consults `def.check_aux` against any existing object and
    /// treats an obsolete one as empty.
    fn acquire_data(&self, parent: CookieId, def: Arc<dyn ObjectDef>) -> Option<CookieId>;

    /// Give up a cookie. With `retire`, the object's content is discarded.
    fn relinquish(&self, cookie: CookieId, retire: bool);

    /// Discard all content of an object.
    fn invalidate(&self, cookie: CookieId);

    /// Submit a read of one page.
    fn read_page(
        &self,
        cookie: CookieId,
        page: &Arc<Page>,
        done: ReadCompletion,
    ) -> Result<(), BackendError>;

    /// Submit reads of a batch of pages.
    ///
    /// Claimed pages are removed from `pages`; what remains is the caller's
    /// to fetch. Returns `Err(NoData)` if any page remains.
    fn read_pages(
        &self,
        cookie: CookieId,
        pages: &mut Vec<Arc<Page>>,
        done: ReadCompletion,
    ) -> Result<(), BackendError>;

    /// Mark a write of this page in flight.
    ///
    /// Called before the page enters `WritePending`, so that
    /// [`wait_on_page_write`](Self::wait_on_page_write) sees the write for
    /// as long as the page does. Blocks while another write of the same page
    /// is in flight.
    fn begin_page_write(&self, cookie: CookieId, page: &Page);

    /// End a write started with [`begin_page_write`](Self::begin_page_write)
    /// and wake its waiters.
    fn end_page_write(&self, cookie: CookieId, page: &Page);

    /// Store a page's content.
    fn write_page(&self, cookie: CookieId, page: &Page) -> Result<(), BackendError>;

    /// Block until no write of this page is in flight.
    fn wait_on_page_write(&self, cookie: CookieId, page: &Page);

    /// Remove one page from the store.
    fn uncache_page(&self, cookie: CookieId, page: &Page);

    /// Whether the page may be released from memory right now.
    fn maybe_release_page(&self, cookie: CookieId, page: &Page, hint: ReclaimHint) -> bool;

    /// Remove every page of the object that is present in `mapping`.
    fn uncache_all(&self, cookie: CookieId, mapping: &PageMapping);
}
