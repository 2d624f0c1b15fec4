//! Background worker for bulk uncache requests.
//!
//! Dropping every page of a file from the store can touch a large page set,
//! so it never runs on the caller's thread. Requests are queued to a single
//! per-session worker thread and the caller gets an [`UncacheTicket`] it may
//! wait on or simply drop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded, unbounded};
use tracing::{debug, trace, warn};

use crate::backend::{CacheBackend, CookieId};
use crate::page::PageMapping;

/// A queued bulk-uncache request.
pub(crate) struct UncacheJob {
    pub(crate) backend: Arc<dyn CacheBackend>,
    pub(crate) cookie: CookieId,
    pub(crate) mapping: Arc<PageMapping>,
    pub(crate) done: Sender<()>,
}

/// Handle to a queued (or already finished) bulk uncache.
#[derive(Debug)]
pub struct UncacheTicket {
    done: Option<Receiver<()>>,
    // Set once the completion message has been taken off the channel.
    finished: AtomicBool,
}

impl UncacheTicket {
    /// A ticket for work that needed no doing.
    pub(crate) fn completed() -> Self {
        Self {
            done: None,
            finished: AtomicBool::new(true),
        }
    }

    pub(crate) fn pending(done: Receiver<()>) -> Self {
        Self {
            done: Some(done),
            finished: AtomicBool::new(false),
        }
    }

    /// Whether the request has finished.
    pub fn is_complete(&self) -> bool {
        if self.finished.load(Ordering::Acquire) {
            return true;
        }
        let Some(rx) = &self.done else {
            return true;
        };
        match rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => {
                self.finished.store(true, Ordering::Release);
                true
            }
            Err(TryRecvError::Empty) => false,
        }
    }

    /// Block until the request has finished.
    ///
    /// Returns immediately if the worker has gone away.
    pub fn wait(self) {
        if self.finished.load(Ordering::Acquire) {
            return;
        }
        if let Some(rx) = self.done {
            let _ = rx.recv();
        }
    }
}

/// Single background thread running bulk uncache jobs in submission order.
pub(crate) struct UncacheWorker {
    tx: Option<Sender<UncacheJob>>,
    handle: Option<JoinHandle<()>>,
}

impl UncacheWorker {
    /// Start the worker thread.
    pub(crate) fn spawn(name: &str) -> Self {
        let (tx, rx) = unbounded::<UncacheJob>();
        let handle = thread::Builder::new()
            .name(format!("{name}-uncache"))
            .spawn(move || worker_loop(&rx));
        match handle {
            Ok(handle) => Self {
                tx: Some(tx),
                handle: Some(handle),
            },
            Err(e) => {
                warn!("Failed to spawn uncache worker, bulk uncache will run inline: {e}");
                Self {
                    tx: None,
                    handle: None,
                }
            }
        }
    }

    /// Queue a bulk uncache of `cookie`'s pages.
    pub(crate) fn submit(
        &self,
        backend: Arc<dyn CacheBackend>,
        cookie: CookieId,
        mapping: Arc<PageMapping>,
    ) -> UncacheTicket {
        let (done, ticket) = bounded(1);
        let job = UncacheJob {
            backend,
            cookie,
            mapping,
            done,
        };
        match &self.tx {
            Some(tx) => match tx.send(job) {
                Ok(()) => UncacheTicket::pending(ticket),
                Err(rejected) => {
                    run_job(rejected.into_inner());
                    UncacheTicket::completed()
                }
            },
            None => {
                run_job(job);
                UncacheTicket::completed()
            }
        }
    }

    /// Stop accepting jobs and wait for queued ones to finish.
    pub(crate) fn shutdown(&mut self) {
        self.tx = None;
        if let Some(handle) = self.handle.take() {
            debug!("Waiting for uncache worker to drain");
            let _ = handle.join();
        }
    }
}

impl Drop for UncacheWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(rx: &Receiver<UncacheJob>) {
    debug!("Uncache worker started");
    while let Ok(job) = rx.recv() {
        run_job(job);
    }
    debug!("Uncache worker exited");
}

fn run_job(job: UncacheJob) {
    trace!(cookie = ?job.cookie, pages = job.mapping.len(), "Uncaching all pages");
    job.backend.uncache_all(job.cookie, &job.mapping);
    // The ticket may have been dropped (fire-and-forget).
    let _ = job.done.send(());
}
