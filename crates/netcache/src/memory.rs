//! In-process reference cache store.
//!
//! [`MemoryStore`] implements [`CacheBackend`] entirely in memory. Page
//! contents live in a byte-bounded `moka` cache; object metadata and cookies
//! live in concurrent maps. Stored objects outlive their cookies, so content
//! written under one registration is found again (and revalidated) by the
//! next one.
//!
//! Beyond the trait it offers a few switches that a real store exposes only
//! through failures: an outage switch, fault injection, deferred completion
//! delivery and object withdrawal.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use moka::sync::Cache;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace};

use crate::backend::{CacheBackend, CookieId, CookieKind, ObjectDef, ReadCompletion, ReclaimHint};
use crate::coherency::CheckAux;
use crate::config::NetfsDefinition;
use crate::error::BackendError;
use crate::page::{CachedPageState, Page, PageIndex, PageMapping};

/// Default page-content capacity in bytes (64 MiB).
pub const DEFAULT_STORE_BYTES: u64 = 64 * 1024 * 1024;

/// Default largest accepted object key.
pub const DEFAULT_MAX_KEY_LEN: usize = 255;

/// Pages handled per batch by [`CacheBackend::uncache_all`].
const UNCACHE_ALL_BATCH: usize = 64;

/// Path of an object: netfs name, then one key per level.
type ObjectPath = Vec<Bytes>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PageKey {
    object: u64,
    index: PageIndex,
}

#[derive(Debug)]
struct StoredObject {
    id: u64,
    aux: Option<Bytes>,
    size: u64,
    pages: HashSet<PageIndex>,
}

#[derive(Clone)]
struct LiveCookie {
    path: ObjectPath,
    def: Arc<dyn ObjectDef>,
    parent: Option<CookieId>,
    withdrawn: bool,
}

struct PendingRead {
    page: Arc<Page>,
    data: Bytes,
    done: ReadCompletion,
}

/// Drop every stored page of `object`.
fn purge(pages: &Cache<PageKey, Bytes>, object: &mut StoredObject) {
    for index in object.pages.drain() {
        pages.invalidate(&PageKey {
            object: object.id,
            index,
        });
    }
}

/// Bring a stored object's fingerprint in line with its owner's.
///
/// Obsolete content is purged here, lazily, the first time the mismatch is
/// noticed.
fn reconcile(
    pages: &Cache<PageKey, Bytes>,
    object: &mut StoredObject,
    def: &dyn ObjectDef,
) -> CheckAux {
    let verdict = match &object.aux {
        Some(stored) => def.check_aux(stored),
        None => CheckAux::Okay,
    };
    if verdict == CheckAux::Obsolete {
        trace!(object = object.id, pages = object.pages.len(), "Purging obsolete object");
        purge(pages, object);
    }
    object.aux = def.aux();
    object.size = def.attr_size();
    verdict
}

/// In-memory [`CacheBackend`].
pub struct MemoryStore {
    max_key_len: usize,
    available: AtomicBool,
    deferred: AtomicBool,
    fault: Mutex<Option<BackendError>>,
    write_latency: Mutex<Duration>,

    next_cookie: AtomicU64,
    next_object: AtomicU64,
    cookies: DashMap<CookieId, LiveCookie>,
    objects: DashMap<ObjectPath, StoredObject>,
    netfs_versions: DashMap<String, u32>,
    pages: Cache<PageKey, Bytes>,

    writes: Mutex<HashSet<(CookieId, PageIndex)>>,
    write_done: Condvar,
    pending: Mutex<Vec<PendingRead>>,

    acquisitions: AtomicU64,
    read_requests: AtomicU64,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("available", &self.is_available())
            .field("cookies", &self.cookies.len())
            .field("objects", &self.objects.len())
            .finish_non_exhaustive()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create a store with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_STORE_BYTES)
    }

    /// Create a store holding at most `max_bytes` of page content.
    pub fn with_capacity(max_bytes: u64) -> Self {
        let pages = Cache::builder()
            .weigher(|_key: &PageKey, value: &Bytes| -> u32 {
                // Capped at u32::MAX, so the truncation cannot happen.
                #[allow(clippy::cast_possible_truncation)]
                let weight = value.len().min(u32::MAX as usize) as u32;
                weight
            })
            .max_capacity(max_bytes)
            .build();

        Self {
            max_key_len: DEFAULT_MAX_KEY_LEN,
            available: AtomicBool::new(true),
            deferred: AtomicBool::new(false),
            fault: Mutex::new(None),
            write_latency: Mutex::new(Duration::ZERO),
            next_cookie: AtomicU64::new(1),
            next_object: AtomicU64::new(1),
            cookies: DashMap::new(),
            objects: DashMap::new(),
            netfs_versions: DashMap::new(),
            pages,
            writes: Mutex::new(HashSet::new()),
            write_done: Condvar::new(),
            pending: Mutex::new(Vec::new()),
            acquisitions: AtomicU64::new(0),
            read_requests: AtomicU64::new(0),
        }
    }

    /// Limit accepted object keys to `len` bytes.
    #[must_use]
    pub fn with_max_key_len(mut self, len: usize) -> Self {
        self.max_key_len = len;
        self
    }

    /// Whether the store answers requests.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Simulate the store going away (or coming back).
    ///
    /// While unavailable, acquisitions are declined and page I/O answers
    /// [`BackendError::Unavailable`]. Stored content survives the outage.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
        info!(available, "Memory store availability changed");
    }

    /// Make every page read and write fail with `fault` until cleared.
    pub fn inject_fault(&self, fault: Option<BackendError>) {
        *self.fault.lock() = fault;
    }

    /// Hold every page write in flight for `latency`, like slow media.
    pub fn set_write_latency(&self, latency: Duration) {
        *self.write_latency.lock() = latency;
    }

    /// Number of page writes currently in flight.
    pub fn writes_in_flight(&self) -> usize {
        self.writes.lock().len()
    }

    /// Queue read completions instead of delivering them immediately.
    pub fn set_deferred(&self, deferred: bool) {
        self.deferred.store(deferred, Ordering::Release);
    }

    /// Deliver every queued read completion, in submission order.
    ///
    /// Returns the number delivered.
    pub fn flush_completions(&self) -> usize {
        let queued = std::mem::take(&mut *self.pending.lock());
        let count = queued.len();
        for read in queued {
            read.done.complete(&read.page, Ok(read.data));
        }
        count
    }

    /// Number of read completions waiting for [`flush_completions`](Self::flush_completions).
    pub fn pending_completions(&self) -> usize {
        self.pending.lock().len()
    }

    /// Withdraw the object behind `cookie`, as a store would on eviction.
    ///
    /// The object's content is dropped, the cookie stops accepting I/O, and
    /// the owner is told through [`ObjectDef::now_uncached`]. Returns `false`
    /// if the cookie is unknown or already withdrawn.
    pub fn withdraw_object(&self, cookie: CookieId) -> bool {
        let (path, def) = {
            let Some(mut live) = self.cookies.get_mut(&cookie) else {
                return false;
            };
            if live.withdrawn {
                return false;
            }
            live.withdrawn = true;
            (live.path.clone(), Arc::clone(&live.def))
        };

        if let Some(mut object) = self.objects.get_mut(&path) {
            purge(&self.pages, &mut object);
        }
        debug!(?cookie, object = def.name(), "Object withdrawn from store");
        def.now_uncached();
        true
    }

    /// Whether the store holds page `index` of the object behind `cookie`.
    pub fn contains_page(&self, cookie: CookieId, index: PageIndex) -> bool {
        self.object_id(cookie).is_some_and(|object| {
            self.pages.contains_key(&PageKey { object, index })
        })
    }

    /// Number of pages recorded for the object behind `cookie`.
    pub fn stored_pages(&self, cookie: CookieId) -> usize {
        let Some(path) = self.cookies.get(&cookie).map(|live| live.path.clone()) else {
            return 0;
        };
        self.objects.get(&path).map_or(0, |object| object.pages.len())
    }

    /// Data size last reported by the owner of `cookie`.
    pub fn object_size(&self, cookie: CookieId) -> Option<u64> {
        let path = self.cookies.get(&cookie)?.path.clone();
        self.objects.get(&path).map(|object| object.size)
    }

    /// Number of cookies currently held by owners.
    pub fn live_cookies(&self) -> usize {
        self.cookies.len()
    }

    /// Number of successful data-file acquisitions so far.
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }

    /// Number of page read requests received so far.
    pub fn read_requests(&self) -> u64 {
        self.read_requests.load(Ordering::Relaxed)
    }

    fn new_object(&self) -> StoredObject {
        StoredObject {
            id: self.next_object.fetch_add(1, Ordering::Relaxed),
            aux: None,
            size: 0,
            pages: HashSet::new(),
        }
    }

    fn issue_cookie(&self, path: ObjectPath, def: Arc<dyn ObjectDef>, parent: Option<CookieId>) -> CookieId {
        let cookie = CookieId(self.next_cookie.fetch_add(1, Ordering::Relaxed));
        trace!(?cookie, object = def.name(), "Cookie issued");
        self.cookies.insert(
            cookie,
            LiveCookie {
                path,
                def,
                parent,
                withdrawn: false,
            },
        );
        cookie
    }

    fn object_id(&self, cookie: CookieId) -> Option<u64> {
        let path = self.cookies.get(&cookie)?.path.clone();
        self.objects.get(&path).map(|object| object.id)
    }

    /// Resolve a cookie for page I/O.
    fn live(&self, cookie: CookieId) -> Result<LiveCookie, BackendError> {
        if !self.is_available() {
            return Err(BackendError::Unavailable);
        }
        if let Some(fault) = self.fault.lock().clone() {
            return Err(fault);
        }
        match self.cookies.get(&cookie) {
            Some(live) if !live.withdrawn => Ok(live.clone()),
            _ => Err(BackendError::NoBuffers),
        }
    }

    /// Revalidate the object behind `live` and return its id.
    fn current_object(&self, live: &LiveCookie) -> Result<u64, BackendError> {
        let mut object = self
            .objects
            .get_mut(&live.path)
            .ok_or(BackendError::NoBuffers)?;
        match reconcile(&self.pages, &mut object, live.def.as_ref()) {
            CheckAux::Okay => Ok(object.id),
            CheckAux::Obsolete => Err(BackendError::Obsolete),
        }
    }

    fn deliver(&self, page: Arc<Page>, data: Bytes, done: ReadCompletion) {
        if self.deferred.load(Ordering::Acquire) {
            self.pending.lock().push(PendingRead { page, data, done });
            return;
        }
        done.complete(&page, Ok(data));
    }

    /// A store version change for `netfs` makes everything under it obsolete.
    fn check_netfs_version(&self, netfs: &NetfsDefinition, name: &Bytes) {
        let previous = self.netfs_versions.insert(netfs.name.clone(), netfs.version);
        if previous.is_none_or(|version| version == netfs.version) {
            return;
        }
        info!(
            netfs = %netfs.name,
            old = ?previous,
            new = netfs.version,
            "Netfs version changed, discarding stored objects"
        );
        self.objects.retain(|path, object| {
            if path.first() == Some(name) {
                purge(&self.pages, object);
                false
            } else {
                true
            }
        });
    }

    fn store_page(&self, live: &LiveCookie, page: &Page) -> Result<(), BackendError> {
        let mut object = self
            .objects
            .get_mut(&live.path)
            .ok_or(BackendError::NoBuffers)?;
        reconcile(&self.pages, &mut object, live.def.as_ref());
        let key = PageKey {
            object: object.id,
            index: page.index(),
        };
        self.pages.insert(key, page.data());
        object.pages.insert(page.index());
        Ok(())
    }
}

impl CacheBackend for MemoryStore {
    fn max_key_len(&self) -> usize {
        self.max_key_len
    }

    fn acquire_index(&self, netfs: &NetfsDefinition, def: Arc<dyn ObjectDef>) -> Option<CookieId> {
        if !self.is_available() {
            return None;
        }
        let key = def.key();
        if key.len() > self.max_key_len {
            return None;
        }

        let name = Bytes::copy_from_slice(netfs.name.as_bytes());
        self.check_netfs_version(netfs, &name);
        let path = vec![name, key];
        self.objects
            .entry(path.clone())
            .or_insert_with(|| self.new_object());
        Some(self.issue_cookie(path, def, None))
    }

    fn acquire_data(&self, parent: CookieId, def: Arc<dyn ObjectDef>) -> Option<CookieId> {
        if !self.is_available() {
            return None;
        }
        let mut path = match self.cookies.get(&parent) {
            Some(live) if !live.withdrawn && live.def.kind() == CookieKind::Index => live.path.clone(),
            _ => return None,
        };
        let key = def.key();
        if key.len() > self.max_key_len {
            return None;
        }
        path.push(key);

        {
            let mut object = self
                .objects
                .entry(path.clone())
                .or_insert_with(|| self.new_object());
            reconcile(&self.pages, &mut object, def.as_ref());
        }
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        Some(self.issue_cookie(path, def, Some(parent)))
    }

    fn relinquish(&self, cookie: CookieId, retire: bool) {
        let Some((_, live)) = self.cookies.remove(&cookie) else {
            return;
        };

        if live.def.kind() == CookieKind::Index {
            let orphans: Vec<CookieId> = self
                .cookies
                .iter()
                .filter(|entry| entry.parent == Some(cookie))
                .map(|entry| *entry.key())
                .collect();
            if !orphans.is_empty() {
                debug!(?cookie, orphans = orphans.len(), "Dropping orphaned child cookies");
            }
            for orphan in orphans {
                self.cookies.remove(&orphan);
            }
        }

        if retire {
            self.objects.retain(|path, object| {
                if path.starts_with(&live.path) {
                    purge(&self.pages, object);
                    false
                } else {
                    true
                }
            });
        }
        trace!(?cookie, retire, "Cookie relinquished");
    }

    fn invalidate(&self, cookie: CookieId) {
        let Some(live) = self.cookies.get(&cookie).map(|live| live.clone()) else {
            return;
        };
        if let Some(mut object) = self.objects.get_mut(&live.path) {
            purge(&self.pages, &mut object);
            object.aux = live.def.aux();
        }
    }

    fn read_page(&self, cookie: CookieId, page: &Arc<Page>, done: ReadCompletion) -> Result<(), BackendError> {
        self.read_requests.fetch_add(1, Ordering::Relaxed);
        let live = self.live(cookie)?;
        let object = self.current_object(&live)?;

        let key = PageKey {
            object,
            index: page.index(),
        };
        let data = self.pages.get(&key).ok_or(BackendError::NoData)?;
        if !done.claim(page) {
            return Err(BackendError::NoBuffers);
        }
        self.deliver(Arc::clone(page), data, done);
        Ok(())
    }

    fn read_pages(
        &self,
        cookie: CookieId,
        pages: &mut Vec<Arc<Page>>,
        done: ReadCompletion,
    ) -> Result<(), BackendError> {
        self.read_requests.fetch_add(1, Ordering::Relaxed);
        let live = self.live(cookie)?;
        let object = self.current_object(&live)?;

        pages.retain(|page| {
            let key = PageKey {
                object,
                index: page.index(),
            };
            match self.pages.get(&key) {
                Some(data) if done.claim(page) => {
                    self.deliver(Arc::clone(page), data, done.clone());
                    false
                }
                _ => true,
            }
        });

        if pages.is_empty() {
            Ok(())
        } else {
            Err(BackendError::NoData)
        }
    }

    fn begin_page_write(&self, cookie: CookieId, page: &Page) {
        let key = (cookie, page.index());
        let mut writes = self.writes.lock();
        while writes.contains(&key) {
            self.write_done.wait(&mut writes);
        }
        writes.insert(key);
    }

    fn end_page_write(&self, cookie: CookieId, page: &Page) {
        self.writes.lock().remove(&(cookie, page.index()));
        self.write_done.notify_all();
    }

    fn write_page(&self, cookie: CookieId, page: &Page) -> Result<(), BackendError> {
        let live = self.live(cookie)?;
        let latency = *self.write_latency.lock();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        self.store_page(&live, page)
    }

    fn wait_on_page_write(&self, cookie: CookieId, page: &Page) {
        let key = (cookie, page.index());
        let mut writes = self.writes.lock();
        while writes.contains(&key) {
            self.write_done.wait(&mut writes);
        }
    }

    fn uncache_page(&self, cookie: CookieId, page: &Page) {
        let Some(path) = self.cookies.get(&cookie).map(|live| live.path.clone()) else {
            return;
        };
        if let Some(mut object) = self.objects.get_mut(&path) {
            object.pages.remove(&page.index());
            self.pages.invalidate(&PageKey {
                object: object.id,
                index: page.index(),
            });
        }
    }

    fn maybe_release_page(&self, cookie: CookieId, page: &Page, hint: ReclaimHint) -> bool {
        if page.cache_state() == CachedPageState::ReadPending {
            return false;
        }
        let key = (cookie, page.index());
        let mut writes = self.writes.lock();
        if writes.contains(&key) {
            if hint == ReclaimHint::NoWait {
                return false;
            }
            while writes.contains(&key) {
                self.write_done.wait_for(&mut writes, Duration::from_millis(100));
            }
        }
        true
    }

    fn uncache_all(&self, cookie: CookieId, mapping: &PageMapping) {
        if !self.cookies.contains_key(&cookie) {
            return;
        }
        let removed = mapping.sweep(UNCACHE_ALL_BATCH, Duration::ZERO, |page| {
            if page.has_cache_marker() {
                self.uncache_page(cookie, page);
                page.clear_cache_marker();
            }
        });
        trace!(?cookie, visited = removed, "Object pages uncached");
    }
}
