//! Local persistent-cache coordinator for network filesystem clients.
//!
//! This crate sits between a network filesystem client and a local,
//! disk-backed page store. Content fetched from the remote side once can be
//! served from the store afterwards, without ever serving content that is
//! stale relative to the authoritative remote copy.
//!
//! # Components
//!
//! ## Lifecycle
//!
//! - [`SessionCache`] - One per mounted filesystem, keyed by [`FsId`]
//! - [`FileCacheObject`] - One per cached file, keyed by [`VirtualInode`]
//! - [`CapabilityGate`] - Whether a file may use the cache right now
//!
//! ## Coherency
//!
//! - [`CoherencyAux`] - mtime + size fingerprint, compared byte-exact
//! - [`Page`] / [`PageMapping`] - In-memory pages and their cache markers
//! - [`PageCoordinator`] - Gated page read, write, invalidate and release
//!
//! ## Store
//!
//! - [`CacheBackend`] - The contract a persistent store implements
//! - [`MemoryStore`] - In-process store for tests and embedding
//!
//! # Failure model
//!
//! Nothing here can fail the surrounding read or write path. A disabled
//! session, a closed gate, a miss, an obsolete object and a broken store all
//! degrade to "fetch it remotely".
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use bytes::Bytes;
//! use netcache::{
//!     CacheConfig, CachedInode, CapTable, Caps, FileKind, FsId, InodeAttrs, MemoryStore,
//!     Page, SessionCache, Timestamp, VirtualInode,
//! };
//!
//! let store = Arc::new(MemoryStore::new());
//! let session = SessionCache::open(Arc::new(CacheConfig::default()), store, FsId::random());
//!
//! let caps = Arc::new(CapTable::new());
//! let vino = VirtualInode::head(42);
//! caps.grant(vino, Caps::CACHE);
//! let inode = CachedInode::new(
//!     vino,
//!     FileKind::Regular,
//!     InodeAttrs::new(Timestamp::from_secs(100), 50),
//!     caps,
//! );
//!
//! assert!(session.register_inode(&inode).is_registered());
//!
//! let fetched = Page::with_data(0, Bytes::from_static(b"remote bytes"));
//! assert!(session.pages().write_page(&inode, &fetched).is_stored());
//!
//! let page = inode.mapping().get_or_create(0);
//! assert!(page.try_lock());
//! assert!(session.pages().read_page(&inode, &page).is_submitted());
//! assert_eq!(page.data(), Bytes::from_static(b"remote bytes"));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod caps;
pub mod coherency;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod inode;
pub mod memory;
pub mod object;
pub mod page;
pub mod session;
pub mod stats;
mod uncache;

pub use backend::{
    CacheBackend, CompletionMode, CookieId, CookieKind, ObjectDef, ReadCompletion, ReclaimHint,
};
pub use caps::{CapSnapshot, CapTable, CapabilityGate, CapabilitySource, Caps};
pub use coherency::{AUX_LEN, CheckAux, CoherencyAux, Timestamp};
pub use config::{CacheConfig, NetfsDefinition};
pub use coordinator::{PageCoordinator, ReadOutcome, ReleaseDecision, WriteOutcome};
pub use error::{BackendError, CacheError, ConfigError};
pub use inode::{CachedInode, FileKind, InodeAttrs, VirtualInode};
pub use memory::MemoryStore;
pub use object::{FileCacheObject, Registration, SkipReason};
pub use page::{CachedPageState, PAGE_SIZE, Page, PageFlags, PageIndex, PageMapping};
pub use session::{FsId, SessionCache};
pub use stats::{CacheStats, CacheStatsSnapshot};
pub use uncache::UncacheTicket;
