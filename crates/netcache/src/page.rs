//! In-memory pages and their cache markers.
//!
//! A [`Page`] is one page-sized unit of a file's content. Besides its bytes it
//! carries two independent pieces of state:
//!
//! - [`PageFlags`]: the lock bit and the "content is valid" bit, owned by the
//!   page-cache user.
//! - [`CachedPageState`]: the page's relationship with the backend store.
//!
//! # Cache state machine
//!
//! ```text
//!   Absent ──read──► ReadPending ──ok──► Present
//!     ▲                 │  └──miss/err──► Absent
//!     │                 └──invalidate──► Invalidated ──late completion──► Absent
//!   Absent|Present ──write──► WritePending ──► Present | Absent (failed)
//!   Present ──invalidate──► Absent
//! ```
//!
//! All transitions are compare-and-swap so that out-of-order completions are
//! idempotent: a completion that finds the page no longer `ReadPending` does
//! nothing to the cache state.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use bytes::Bytes;
use parking_lot::RwLock;

/// Size of one page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Index of a page within a file (offset / [`PAGE_SIZE`]).
pub type PageIndex = u64;

bitflags! {
    /// Page-cache flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PageFlags: u32 {
        /// The page is locked for I/O.
        const LOCKED = 1 << 0;
        /// The page content is valid.
        const UPTODATE = 1 << 1;
    }
}

/// Relationship between a page and the backend store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CachedPageState {
    /// The store knows nothing about this page.
    Absent = 0,
    /// A read from the store has been submitted.
    ReadPending = 1,
    /// The store holds valid bytes for this page.
    Present = 2,
    /// The page is being written to the store.
    WritePending = 3,
    /// The page was removed from the store while in use.
    Invalidated = 4,
}

impl CachedPageState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::ReadPending,
            2 => Self::Present,
            3 => Self::WritePending,
            4 => Self::Invalidated,
            _ => Self::Absent,
        }
    }
}

/// One page of file content.
#[derive(Debug)]
pub struct Page {
    index: PageIndex,
    flags: AtomicU32,
    state: AtomicU8,
    data: RwLock<Bytes>,
}

impl Page {
    /// Create an empty, unlocked page.
    pub fn new(index: PageIndex) -> Self {
        Self {
            index,
            flags: AtomicU32::new(0),
            state: AtomicU8::new(CachedPageState::Absent as u8),
            data: RwLock::new(Bytes::new()),
        }
    }

    /// Create an unlocked page holding `data`.
    pub fn with_data(index: PageIndex, data: Bytes) -> Self {
        let page = Self::new(index);
        page.fill(data);
        page
    }

    /// Index of this page within its file.
    pub fn index(&self) -> PageIndex {
        self.index
    }

    /// Current page-cache flags.
    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Try to take the page lock.
    pub fn try_lock(&self) -> bool {
        let prev = self
            .flags
            .fetch_or(PageFlags::LOCKED.bits(), Ordering::AcqRel);
        prev & PageFlags::LOCKED.bits() == 0
    }

    /// Release the page lock. Unlocking an unlocked page is a no-op.
    pub fn unlock(&self) {
        self.flags
            .fetch_and(!PageFlags::LOCKED.bits(), Ordering::AcqRel);
    }

    /// Whether the page is locked.
    pub fn is_locked(&self) -> bool {
        self.flags().contains(PageFlags::LOCKED)
    }

    /// Mark the content valid.
    pub fn set_uptodate(&self) {
        self.flags
            .fetch_or(PageFlags::UPTODATE.bits(), Ordering::AcqRel);
    }

    /// Mark the content invalid.
    pub fn clear_uptodate(&self) {
        self.flags
            .fetch_and(!PageFlags::UPTODATE.bits(), Ordering::AcqRel);
    }

    /// Whether the content is valid.
    pub fn is_uptodate(&self) -> bool {
        self.flags().contains(PageFlags::UPTODATE)
    }

    /// Snapshot of the page content.
    pub fn data(&self) -> Bytes {
        self.data.read().clone()
    }

    /// Replace the page content.
    pub fn fill(&self, data: Bytes) {
        debug_assert!(data.len() <= PAGE_SIZE, "page overflow: {} bytes", data.len());
        *self.data.write() = data;
    }

    /// Current cache state.
    pub fn cache_state(&self) -> CachedPageState {
        CachedPageState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the store is (or is about to be) tracking this page.
    pub fn has_cache_marker(&self) -> bool {
        matches!(
            self.cache_state(),
            CachedPageState::ReadPending | CachedPageState::Present | CachedPageState::WritePending
        )
    }

    fn transition(&self, from: CachedPageState, to: CachedPageState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn set_state(&self, to: CachedPageState) {
        self.state.store(to as u8, Ordering::Release);
    }

    /// Enter `ReadPending` from any settled state.
    ///
    /// Returns `false` if a read or write is already in flight.
    pub(crate) fn begin_read(&self) -> bool {
        [
            CachedPageState::Absent,
            CachedPageState::Invalidated,
            CachedPageState::Present,
        ]
        .into_iter()
        .any(|from| self.transition(from, CachedPageState::ReadPending))
    }

    /// Settle a pending read.
    ///
    /// Returns `true` only if the page moved to `Present`. A page invalidated
    /// while the read was in flight settles to `Absent` instead.
    pub(crate) fn finish_read(&self, ok: bool) -> bool {
        let to = if ok {
            CachedPageState::Present
        } else {
            CachedPageState::Absent
        };
        if self.transition(CachedPageState::ReadPending, to) {
            return ok;
        }
        self.transition(CachedPageState::Invalidated, CachedPageState::Absent);
        false
    }

    /// Enter `WritePending` unconditionally.
    pub(crate) fn begin_write(&self) {
        self.set_state(CachedPageState::WritePending);
    }

    /// Settle a successful write.
    ///
    /// An invalidation that raced the write wins.
    pub(crate) fn finish_write(&self) -> bool {
        self.transition(CachedPageState::WritePending, CachedPageState::Present)
    }

    /// Drop the cache marker.
    ///
    /// A read still in flight is demoted to `Invalidated` so its completion
    /// cannot mark the page present.
    pub fn clear_cache_marker(&self) {
        if self.transition(CachedPageState::ReadPending, CachedPageState::Invalidated) {
            return;
        }
        self.set_state(CachedPageState::Absent);
    }
}

/// Ordered set of the in-memory pages of one file.
#[derive(Debug, Default)]
pub struct PageMapping {
    pages: RwLock<BTreeMap<PageIndex, Arc<Page>>>,
}

impl PageMapping {
    /// Create an empty mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the page at `index`, creating an empty one if needed.
    pub fn get_or_create(&self, index: PageIndex) -> Arc<Page> {
        if let Some(page) = self.get(index) {
            return page;
        }
        Arc::clone(
            self.pages
                .write()
                .entry(index)
                .or_insert_with(|| Arc::new(Page::new(index))),
        )
    }

    /// Get the page at `index` if mapped.
    pub fn get(&self, index: PageIndex) -> Option<Arc<Page>> {
        self.pages.read().get(&index).cloned()
    }

    /// Insert a page, replacing any page at the same index.
    pub fn insert(&self, page: Arc<Page>) {
        self.pages.write().insert(page.index(), page);
    }

    /// Remove the page at `index`.
    pub fn remove(&self, index: PageIndex) -> Option<Arc<Page>> {
        self.pages.write().remove(&index)
    }

    /// Number of mapped pages.
    pub fn len(&self) -> usize {
        self.pages.read().len()
    }

    /// Whether no pages are mapped.
    pub fn is_empty(&self) -> bool {
        self.pages.read().is_empty()
    }

    /// Up to `max` mapped pages with index >= `first`, in index order.
    ///
    /// The mapping lock is released before returning.
    pub fn lookup_batch(&self, first: PageIndex, max: usize) -> Vec<Arc<Page>> {
        self.pages
            .read()
            .range(first..)
            .take(max)
            .map(|(_, page)| Arc::clone(page))
            .collect()
    }

    /// Walk every mapped page in batches of `batch`, calling `f` on each.
    ///
    /// Between batches the thread yields (or sleeps for `pause` if non-zero)
    /// so a large mapping never monopolises the CPU. Returns the number of
    /// pages visited.
    pub fn sweep<F>(&self, batch: usize, pause: Duration, mut f: F) -> usize
    where
        F: FnMut(&Page),
    {
        let batch = batch.max(1);
        let mut first: PageIndex = 0;
        let mut visited = 0;
        loop {
            let pages = self.lookup_batch(first, batch);
            let Some(last) = pages.last() else {
                break;
            };
            let last_index = last.index();
            for page in &pages {
                f(page);
            }
            visited += pages.len();
            drop(pages);

            let Some(next) = last_index.checked_add(1) else {
                break;
            };
            first = next;

            if pause.is_zero() {
                std::thread::yield_now();
            } else {
                std::thread::sleep(pause);
            }
        }
        visited
    }
}
