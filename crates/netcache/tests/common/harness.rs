//! Test harness: a session on a [`MemoryStore`] plus a capability table.
//!
//! `TestFs` plays the filesystem client: it owns the session, hands out
//! inodes whose capabilities it controls, and can remount on the same store
//! to exercise revalidation of previously stored content.

// Not all tests use all TestFs methods
#![allow(dead_code)]

use std::sync::{Arc, Once};

use bytes::Bytes;
use netcache::{
    CacheConfig, CachedInode, CapTable, Caps, CookieId, FileKind, FsId, InodeAttrs, MemoryStore,
    Page, PageIndex, SessionCache, Timestamp, VirtualInode,
};
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Install a test subscriber honouring `RUST_LOG`. Runs at most once.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A mounted filesystem session backed by an in-memory store.
pub struct TestFs {
    pub store: Arc<MemoryStore>,
    pub caps: Arc<CapTable>,
    pub session: SessionCache,
    pub fsid: FsId,
    config: Arc<CacheConfig>,
}

impl TestFs {
    /// Mount with the default configuration on a fresh store.
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    /// Mount with `config` on a fresh store.
    pub fn with_config(config: CacheConfig) -> Self {
        Self::mount(Arc::new(MemoryStore::new()), Arc::new(config), FsId::random())
    }

    /// Mount on an existing store.
    pub fn on_store(store: Arc<MemoryStore>) -> Self {
        Self::mount(store, Arc::new(CacheConfig::default()), FsId::random())
    }

    fn mount(store: Arc<MemoryStore>, config: Arc<CacheConfig>, fsid: FsId) -> Self {
        init_tracing();
        let session = SessionCache::open(
            Arc::clone(&config),
            Arc::clone(&store) as Arc<dyn netcache::CacheBackend>,
            fsid,
        );
        Self {
            store,
            caps: Arc::new(CapTable::new()),
            session,
            fsid,
            config,
        }
    }

    /// Unmount and mount the same filesystem again on the same store.
    pub fn remount(self) -> Self {
        let config = CacheConfig::clone(&self.config);
        self.remount_with(config)
    }

    /// Unmount and mount again with a different configuration.
    pub fn remount_with(self, config: CacheConfig) -> Self {
        let Self {
            store,
            caps,
            session,
            fsid,
            ..
        } = self;
        session.close();
        let mut fs = Self::mount(store, Arc::new(config), fsid);
        fs.caps = caps;
        fs
    }

    /// A regular file holding the read-cache capability.
    pub fn inode(&self, ino: u64, attrs: InodeAttrs) -> CachedInode {
        let vino = VirtualInode::head(ino);
        self.caps.grant(vino, Caps::SHARED | Caps::READ | Caps::CACHE);
        self.inode_without_caps(ino, attrs)
    }

    /// A regular file with whatever the capability table currently says.
    pub fn inode_without_caps(&self, ino: u64, attrs: InodeAttrs) -> CachedInode {
        self.inode_of_kind(ino, FileKind::Regular, attrs)
    }

    /// A file of any kind.
    pub fn inode_of_kind(&self, ino: u64, kind: FileKind, attrs: InodeAttrs) -> CachedInode {
        CachedInode::new(
            VirtualInode::head(ino),
            kind,
            attrs,
            Arc::clone(&self.caps) as Arc<dyn netcache::CapabilitySource>,
        )
    }

    /// A registered regular file.
    pub fn registered(&self, ino: u64, attrs: InodeAttrs) -> CachedInode {
        let inode = self.inode(ino, attrs);
        assert!(
            self.session.register_inode(&inode).is_registered(),
            "inode {ino} failed to register"
        );
        inode
    }

    /// Take the read-cache capabilities away from a file.
    pub fn revoke_caps(&self, inode: &CachedInode) {
        self.caps.revoke(inode.vino(), Caps::CACHE | Caps::LAZY_IO);
    }

    /// Give the read-cache capability back.
    pub fn grant_caps(&self, inode: &CachedInode) {
        self.caps.grant(inode.vino(), Caps::CACHE);
    }
}

/// Attributes with a whole-second mtime.
pub fn attrs(mtime: i64, size: u64) -> InodeAttrs {
    InodeAttrs::new(Timestamp::from_secs(mtime), size)
}

/// Deterministic content for page `index` of file `ino`.
pub fn content(ino: u64, index: PageIndex) -> Bytes {
    Bytes::from(format!("ino {ino} page {index} content"))
}

/// Fill a mapped page with its deterministic content and return it.
pub fn fetched(inode: &CachedInode, index: PageIndex) -> Arc<Page> {
    let page = inode.mapping().get_or_create(index);
    page.fill(content(inode.vino().ino, index));
    page
}

/// A fresh, locked page outside any mapping.
pub fn locked_page(index: PageIndex) -> Arc<Page> {
    let page = Arc::new(Page::new(index));
    assert!(page.try_lock());
    page
}

/// Cookie of a registered inode.
pub fn cookie_of(inode: &CachedInode) -> CookieId {
    inode.cache_object().expect("inode not registered").cookie()
}
