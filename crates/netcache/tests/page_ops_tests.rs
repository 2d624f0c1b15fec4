//! Page operation tests: batch reads, failed writes, invalidation ordering,
//! reclaim advice, bulk uncache, store-driven withdrawal and late
//! completions.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;

use common::*;
use netcache::{
    BackendError, CacheConfig, CacheError, CachedPageState, Page, ReadOutcome, ReclaimHint,
    ReleaseDecision, WriteOutcome,
};

fn spin_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::yield_now();
    }
}

// ============================================================================
// Batch reads
// ============================================================================

#[test]
fn test_read_pages_partial_hit() {
    let fs = TestFs::new();
    let inode = fs.registered(1, attrs(100, 4 * 4096));
    for index in [0, 2] {
        assert!(fs.session.pages().write_page(&inode, &fetched(&inode, index)).is_stored());
    }

    let mut pages: Vec<Arc<Page>> = (0..4).map(|i| Arc::new(Page::new(i))).collect();
    let all = pages.clone();
    let outcome = fs.session.pages().read_pages(&inode, &mut pages);

    assert_eq!(outcome, ReadOutcome::Fallback(CacheError::Miss));
    let remaining: Vec<_> = pages.iter().map(|p| p.index()).collect();
    assert_eq!(remaining, vec![1, 3], "misses are left to the caller");

    for page in &all {
        assert!(!page.is_locked(), "page {} left locked", page.index());
        if page.index() % 2 == 0 {
            assert!(page.is_uptodate());
            assert_eq!(page.data(), content(1, page.index()));
        } else {
            assert!(!page.is_uptodate());
            assert_eq!(page.cache_state(), CachedPageState::Absent, "misses untouched");
        }
    }
}

#[test]
fn test_read_pages_full_hit() {
    let fs = TestFs::new();
    let inode = fs.registered(1, attrs(100, 4 * 4096));
    for index in 0..4 {
        assert!(fs.session.pages().write_page(&inode, &fetched(&inode, index)).is_stored());
    }

    let mut pages: Vec<Arc<Page>> = (0..4).map(|i| Arc::new(Page::new(i))).collect();
    let all = pages.clone();
    assert!(fs.session.pages().read_pages(&inode, &mut pages).is_submitted());
    assert!(pages.is_empty());
    assert!(all.iter().all(|p| p.is_uptodate() && !p.is_locked()));
}

#[test]
fn test_read_pages_rechecks_gate() {
    let fs = TestFs::new();
    let inode = fs.registered(1, attrs(100, 4096));
    assert!(fs.session.pages().write_page(&inode, &fetched(&inode, 0)).is_stored());

    // Capabilities lost between scheduling and execution of read-ahead.
    fs.revoke_caps(&inode);
    let before = fs.store.read_requests();
    let mut pages = vec![Arc::new(Page::new(0))];
    assert_eq!(
        fs.session.pages().read_pages(&inode, &mut pages),
        ReadOutcome::Fallback(CacheError::GateClosed)
    );
    assert_eq!(pages.len(), 1);
    assert!(!pages[0].is_locked());
    assert_eq!(fs.store.read_requests(), before);
}

#[test]
fn test_read_pages_skips_pages_locked_elsewhere() {
    let fs = TestFs::new();
    let inode = fs.registered(1, attrs(100, 4096));
    assert!(fs.session.pages().write_page(&inode, &fetched(&inode, 0)).is_stored());

    let page = locked_page(0);
    let mut pages = vec![Arc::clone(&page)];
    assert!(fs.session.pages().read_pages(&inode, &mut pages).is_miss());
    assert_eq!(pages.len(), 1);
    assert!(page.is_locked(), "foreign lock untouched");
    assert!(!page.is_uptodate());
}

#[test]
fn test_read_pages_empty_set() {
    let fs = TestFs::new();
    let inode = fs.registered(1, attrs(100, 0));
    let mut pages = Vec::new();
    assert!(fs.session.pages().read_pages(&inode, &mut pages).is_submitted());
}

// ============================================================================
// Backend failures
// ============================================================================

#[test]
fn test_failed_write_clears_marker() {
    let fs = TestFs::new();
    let inode = fs.registered(1, attrs(100, 4096));
    let cookie = cookie_of(&inode);
    let page = fetched(&inode, 0);

    fs.store.inject_fault(Some(BackendError::io(28, "no space left")));
    let outcome = fs.session.pages().write_page(&inode, &page);
    assert_eq!(
        outcome,
        WriteOutcome::Skipped(CacheError::Backend(BackendError::io(28, "no space left")))
    );
    assert!(!page.has_cache_marker());
    assert!(!fs.store.contains_page(cookie, 0));

    fs.store.inject_fault(None);
    let reader = locked_page(0);
    assert!(fs.session.pages().read_page(&inode, &reader).is_miss());
    assert_eq!(fs.session.stats().snapshot().write_failures, 1);
}

#[test]
fn test_read_error_demoted_to_fallback() {
    let fs = TestFs::new();
    let inode = fs.registered(1, attrs(100, 4096));
    assert!(fs.session.pages().write_page(&inode, &fetched(&inode, 0)).is_stored());

    fs.store.inject_fault(Some(BackendError::io(5, "media error")));
    let page = locked_page(0);
    let outcome = fs.session.pages().read_page(&inode, &page);
    assert!(outcome.is_error());
    assert!(outcome.needs_remote_fetch());
    assert!(page.is_locked());
    assert!(!page.is_uptodate());

    let stats = fs.session.stats().snapshot();
    assert_eq!(stats.read_errors, 1);
    assert_eq!(stats.read_submitted, 0);
}

#[test]
fn test_unreachable_store_behaves_as_miss() {
    let fs = TestFs::new();
    let inode = fs.registered(1, attrs(100, 4096));
    assert!(fs.session.pages().write_page(&inode, &fetched(&inode, 0)).is_stored());

    fs.store.set_available(false);
    let page = locked_page(0);
    let outcome = fs.session.pages().read_page(&inode, &page);
    assert_eq!(outcome, ReadOutcome::Fallback(CacheError::Miss));
    assert!(!outcome.is_error());

    let fresh = fetched(&inode, 1);
    assert!(!fs.session.pages().write_page(&inode, &fresh).is_stored());
    assert!(!fresh.has_cache_marker());

    // Back online, previously stored content is served again.
    fs.store.set_available(true);
    let page = locked_page(0);
    assert!(fs.session.pages().read_page(&inode, &page).is_submitted());
}

// ============================================================================
// Invalidation
// ============================================================================

#[test]
fn test_invalidate_removes_page() {
    let fs = TestFs::new();
    let inode = fs.registered(1, attrs(100, 4096));
    let cookie = cookie_of(&inode);
    let page = fetched(&inode, 0);
    assert!(fs.session.pages().write_page(&inode, &page).is_stored());
    assert!(fs.store.contains_page(cookie, 0));

    fs.session.pages().invalidate_page(&inode, &page);
    assert!(!fs.store.contains_page(cookie, 0));
    assert_eq!(page.cache_state(), CachedPageState::Absent);

    // Unmarked pages are skipped.
    fs.session.pages().invalidate_page(&inode, &page);
    assert_eq!(fs.session.stats().snapshot().invalidations, 1);
}

#[test]
fn test_invalidate_waits_for_in_flight_write() {
    let fs = Arc::new(TestFs::new());
    let inode = Arc::new(fs.registered(1, attrs(100, 4096)));
    let cookie = cookie_of(&inode);
    let page = fetched(&inode, 0);
    fs.store.set_write_latency(Duration::from_millis(50));

    let writer = {
        let fs = Arc::clone(&fs);
        let inode = Arc::clone(&inode);
        let page = Arc::clone(&page);
        thread::spawn(move || fs.session.pages().write_page(&inode, &page))
    };

    spin_until("write to start", || page.cache_state() == CachedPageState::WritePending);
    assert!(fs.store.writes_in_flight() > 0);
    fs.session.pages().invalidate_page(&inode, &page);
    assert_eq!(fs.store.writes_in_flight(), 0, "invalidate returned mid-write");

    writer.join().unwrap();
    assert!(
        !fs.store.contains_page(cookie, 0),
        "stale write landed after removal"
    );
    assert_eq!(page.cache_state(), CachedPageState::Absent);
}

// ============================================================================
// Reclaim
// ============================================================================

#[test]
fn test_release_without_cache_object() {
    let fs = TestFs::new();
    let inode = fs.inode(1, attrs(100, 4096));
    let page = Page::new(0);
    assert_eq!(
        fs.session.pages().release_page(&inode, &page, ReclaimHint::NoWait),
        ReleaseDecision::Release
    );
}

#[test]
fn test_release_idle_page() {
    let fs = TestFs::new();
    let inode = fs.registered(1, attrs(100, 4096));
    let page = fetched(&inode, 0);
    assert!(fs.session.pages().write_page(&inode, &page).is_stored());

    assert_eq!(
        fs.session.pages().release_page(&inode, &page, ReclaimHint::NoWait),
        ReleaseDecision::Release
    );
    assert!(!page.has_cache_marker());
    // The store keeps the content; only the in-memory page goes.
    assert!(fs.store.contains_page(cookie_of(&inode), 0));
}

#[test]
fn test_release_retains_page_with_pending_read() {
    let fs = TestFs::new();
    let inode = fs.registered(1, attrs(100, 4096));
    assert!(fs.session.pages().write_page(&inode, &fetched(&inode, 0)).is_stored());
    fs.store.set_deferred(true);

    let page = locked_page(0);
    assert!(fs.session.pages().read_page(&inode, &page).is_submitted());
    assert_eq!(
        fs.session.pages().release_page(&inode, &page, ReclaimHint::MayWait),
        ReleaseDecision::Retain
    );

    assert_eq!(fs.store.flush_completions(), 1);
    assert!(page.is_uptodate());
    assert_eq!(fs.session.stats().snapshot().retains, 1);
}

#[test]
fn test_release_hint_controls_waiting_on_write() {
    let fs = Arc::new(TestFs::new());
    let inode = Arc::new(fs.registered(1, attrs(100, 4096)));
    let page = fetched(&inode, 0);
    fs.store.set_write_latency(Duration::from_millis(50));

    let writer = {
        let fs = Arc::clone(&fs);
        let inode = Arc::clone(&inode);
        let page = Arc::clone(&page);
        thread::spawn(move || fs.session.pages().write_page(&inode, &page))
    };
    spin_until("write to start", || page.cache_state() == CachedPageState::WritePending);

    assert_eq!(
        fs.session.pages().release_page(&inode, &page, ReclaimHint::NoWait),
        ReleaseDecision::Retain
    );
    assert_eq!(
        fs.session.pages().release_page(&inode, &page, ReclaimHint::MayWait),
        ReleaseDecision::Release
    );
    assert_eq!(fs.store.writes_in_flight(), 0);
    writer.join().unwrap();
}

// ============================================================================
// Bulk uncache
// ============================================================================

#[test]
fn test_async_uncache_twice() {
    let fs = TestFs::new();
    let inode = fs.registered(1, attrs(100, 8 * 4096));
    let cookie = cookie_of(&inode);
    for index in 0..8 {
        assert!(fs.session.pages().write_page(&inode, &fetched(&inode, index)).is_stored());
    }
    assert_eq!(fs.store.stored_pages(cookie), 8);

    fs.session.pages().async_uncache(&inode).wait();
    assert_eq!(fs.store.stored_pages(cookie), 0);
    assert!(
        inode
            .mapping()
            .lookup_batch(0, 8)
            .iter()
            .all(|p| !p.has_cache_marker())
    );

    let second = fs.session.pages().async_uncache(&inode);
    second.wait();
    assert_eq!(fs.store.stored_pages(cookie), 0);
    assert_eq!(fs.session.stats().snapshot().async_uncaches, 2);
}

#[test]
fn test_async_uncache_after_unregister_is_complete() {
    let fs = TestFs::new();
    let inode = fs.registered(1, attrs(100, 4096));
    let ticket = fs.session.pages().async_uncache(&inode);
    assert!(inode.unregister_cache());
    ticket.wait();

    let ticket = fs.session.pages().async_uncache(&inode);
    assert!(ticket.is_complete());
}

#[test]
fn test_fire_and_forget_uncache_drains_on_close() {
    let fs = TestFs::new();
    let inode = fs.registered(1, attrs(100, 4096));
    assert!(fs.session.pages().write_page(&inode, &fetched(&inode, 0)).is_stored());

    drop(fs.session.pages().async_uncache(&inode));
    let fs = fs.remount();

    // The queued request ran before the session let go of the store.
    assert!(inode.unregister_cache());
    let inode = fs.registered(1, attrs(100, 4096));
    let page = locked_page(0);
    assert!(fs.session.pages().read_page(&inode, &page).is_miss());
}

// ============================================================================
// Store-driven withdrawal
// ============================================================================

#[test]
fn test_withdrawal_sweeps_markers_in_batches() {
    let config = CacheConfig {
        uncache_batch: 14,
        uncache_pause: Duration::from_micros(50),
        ..CacheConfig::default()
    };
    let fs = TestFs::with_config(config);
    let inode = fs.registered(1, attrs(100, 40 * 4096));
    for index in 0..40 {
        assert!(fs.session.pages().write_page(&inode, &fetched(&inode, index)).is_stored());
    }
    // An unmarked page is visited but not counted.
    inode.mapping().get_or_create(100);

    assert!(fs.store.withdraw_object(cookie_of(&inode)));

    assert!(
        inode
            .mapping()
            .lookup_batch(0, 64)
            .iter()
            .all(|p| !p.has_cache_marker())
    );
    let stats = fs.session.stats().snapshot();
    assert_eq!(stats.sweeps, 1);
    assert_eq!(stats.markers_cleared, 40);

    // The withdrawn object serves nothing, but nothing fails either.
    let page = locked_page(0);
    assert!(fs.session.pages().read_page(&inode, &page).is_miss());
    assert!(!fs.session.pages().write_page(&inode, &fetched(&inode, 0)).is_stored());
}

// ============================================================================
// Late completions
// ============================================================================

#[test]
fn test_revoke_neutralises_pending_read() {
    let fs = TestFs::new();
    let inode = fs.registered(1, attrs(100, 4096));
    assert!(fs.session.pages().write_page(&inode, &fetched(&inode, 0)).is_stored());
    fs.store.set_deferred(true);

    let page = inode.mapping().get_or_create(0);
    page.clear_uptodate();
    assert!(page.try_lock());
    assert!(fs.session.pages().read_page(&inode, &page).is_submitted());
    assert_eq!(page.cache_state(), CachedPageState::ReadPending);

    assert!(fs.session.on_capability_revoked(&inode));
    assert_eq!(page.cache_state(), CachedPageState::Invalidated);

    assert_eq!(fs.store.flush_completions(), 1);
    assert!(!page.is_uptodate(), "late completion resurrected a revoked page");
    assert_eq!(page.cache_state(), CachedPageState::Absent);
    assert!(page.is_locked(), "non-unlocking completion must not unlock");
}

#[test]
fn test_revoke_neutralises_pending_batch_read() {
    let fs = TestFs::new();
    let inode = fs.registered(1, attrs(100, 2 * 4096));
    for index in 0..2 {
        assert!(fs.session.pages().write_page(&inode, &fetched(&inode, index)).is_stored());
    }
    fs.store.set_deferred(true);

    let all: Vec<Arc<Page>> = (0..2).map(|i| Arc::new(Page::new(i))).collect();
    let mut pages = all.clone();
    assert!(fs.session.pages().read_pages(&inode, &mut pages).is_submitted());
    assert!(all.iter().all(|p| p.is_locked()));

    assert!(fs.session.on_capability_revoked(&inode));
    assert_eq!(fs.store.flush_completions(), 2);
    for page in &all {
        assert!(!page.is_uptodate());
        assert!(!page.is_locked(), "unlocking completion must unlock on revoke");
    }
}

#[test]
fn test_invalidate_during_pending_read() {
    let fs = TestFs::new();
    let inode = fs.registered(1, attrs(100, 4096));
    assert!(fs.session.pages().write_page(&inode, &fetched(&inode, 0)).is_stored());
    fs.store.set_deferred(true);

    let page = locked_page(0);
    assert!(fs.session.pages().read_page(&inode, &page).is_submitted());
    fs.session.pages().invalidate_page(&inode, &page);
    assert_eq!(page.cache_state(), CachedPageState::Invalidated);

    fs.store.flush_completions();
    assert!(!page.is_uptodate());
    assert_eq!(page.cache_state(), CachedPageState::Absent);
    // A duplicate delivery changes nothing.
    assert_eq!(fs.store.flush_completions(), 0);
    assert_eq!(page.cache_state(), CachedPageState::Absent);
}

#[test]
fn test_late_completion_keeps_refetched_content() {
    let fs = TestFs::new();
    let inode = fs.registered(1, attrs(100, 4096));
    assert!(fs.session.pages().write_page(&inode, &fetched(&inode, 0)).is_stored());
    fs.store.set_deferred(true);

    let page = locked_page(0);
    assert!(fs.session.pages().read_page(&inode, &page).is_submitted());
    fs.session.pages().invalidate_page(&inode, &page);

    // The caller gives up on the cache and installs the remote bytes.
    page.fill(Bytes::from_static(b"remote"));
    page.set_uptodate();

    assert_eq!(fs.store.flush_completions(), 1);
    assert_eq!(page.data(), Bytes::from_static(b"remote"), "late completion overwrote the page");
    assert!(page.is_uptodate());
    assert_eq!(page.cache_state(), CachedPageState::Absent);
}

#[test]
fn test_revoked_completion_leaves_content_untouched() {
    let fs = TestFs::new();
    let inode = fs.registered(1, attrs(100, 4096));
    assert!(fs.session.pages().write_page(&inode, &fetched(&inode, 0)).is_stored());
    fs.store.set_deferred(true);

    let page = locked_page(0);
    assert!(fs.session.pages().read_page(&inode, &page).is_submitted());
    assert!(fs.session.on_capability_revoked(&inode));

    assert_eq!(fs.store.flush_completions(), 1);
    assert!(page.data().is_empty());
    assert!(!page.is_uptodate());
}
