use crate::range::Resource;
use crate::zip::archive::ZipArchive;
use crate::zip::{CorruptionNotice, ZipRoot};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use strata_core::config::ZipConfig;
use strata_core::{Error, Result};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Concurrent cache of opened remote archives, keyed on archive URL.
///
/// Opens are single-flight: the first caller creates an entry in the
/// `Opening` state and a detached task performs the open, so a caller
/// abandoning the request never leaves a half-initialized entry behind.
/// Entries refresh on access after `refresh_interval` (ETag probe) and
/// are swept after `expiration_interval` of idleness.
pub struct ZipCache {
    inner: Arc<Inner>,
    sweeper: tokio::task::JoinHandle<()>,
    corruption_listener: tokio::task::JoinHandle<()>,
}

struct Inner {
    client: reqwest::Client,
    config: ZipConfig,
    archives: DashMap<String, Arc<CacheEntry>>,
    corruption_tx: mpsc::UnboundedSender<String>,
}

#[derive(Debug)]
enum ArchiveState {
    Opening,
    Opened(Arc<ZipArchive>),
    Failed(Error),
    Corrupted,
}

struct CacheEntry {
    url: String,
    state: RwLock<ArchiveState>,
    opened_at: RwLock<Instant>,
    last_used: RwLock<Instant>,
    done: watch::Receiver<bool>,
    refreshing: AtomicBool,
}

impl CacheEntry {
    fn new(url: &str, done: watch::Receiver<bool>) -> Self {
        let now = Instant::now();
        Self {
            url: url.to_string(),
            state: RwLock::new(ArchiveState::Opening),
            opened_at: RwLock::new(now),
            last_used: RwLock::new(now),
            done,
            refreshing: AtomicBool::new(false),
        }
    }

    fn is_corrupted(&self) -> bool {
        matches!(*self.state.read().expect("state lock"), ArchiveState::Corrupted)
    }

    fn mark_corrupted(&self) {
        *self.state.write().expect("state lock") = ArchiveState::Corrupted;
    }

    fn touch(&self) {
        *self.last_used.write().expect("last_used lock") = Instant::now();
    }

    fn needs_refresh(&self, config: &ZipConfig) -> bool {
        self.opened_at.read().expect("opened_at lock").elapsed() > config.refresh_interval()
    }

    fn refreshed(&self) {
        *self.opened_at.write().expect("opened_at lock") = Instant::now();
        self.refreshing.store(false, Ordering::SeqCst);
    }

    fn idle_for(&self) -> std::time::Duration {
        self.last_used.read().expect("last_used lock").elapsed()
    }
}

impl ZipCache {
    pub fn new(client: reqwest::Client, config: ZipConfig) -> Self {
        let (corruption_tx, corruption_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            client,
            config,
            archives: DashMap::new(),
            corruption_tx,
        });

        let sweeper = tokio::spawn(Inner::sweep_loop(Arc::clone(&inner)));
        let corruption_listener =
            tokio::spawn(Inner::corruption_loop(Arc::clone(&inner), corruption_rx));

        Self {
            inner,
            sweeper,
            corruption_listener,
        }
    }

    /// Obtain a serving root for the archive at `location`, opening it
    /// if needed. Concurrent callers for the same URL share one open.
    pub async fn root(&self, location: &str) -> Result<ZipRoot> {
        let resolved = self.inner.config.resolve_location(location);
        let url = resolved.as_str();
        loop {
            let entry = self.lookup_or_open(url);

            let mut done = entry.done.clone();
            if done.wait_for(|ready| *ready).await.is_err() {
                self.remove_exact(url, &entry);
                return Err(Error::ArchiveCorrupted(format!("{url}: open task aborted")));
            }

            enum Outcome {
                Opened(Arc<ZipArchive>),
                Failed(Error),
                Corrupted,
                Opening,
            }

            // Resolved in a block so the read guard is guaranteed to be
            // dropped before any subsequent `.await` point.
            let outcome = {
                let state = entry.state.read().expect("state lock");
                match &*state {
                    ArchiveState::Opened(archive) => Outcome::Opened(Arc::clone(archive)),
                    ArchiveState::Failed(err) => Outcome::Failed(err.clone()),
                    ArchiveState::Corrupted => Outcome::Corrupted,
                    ArchiveState::Opening => Outcome::Opening,
                }
            };

            match outcome {
                Outcome::Opened(archive) => {
                    entry.touch();
                    self.inner.maybe_refresh(&entry, &archive);

                    let notice =
                        CorruptionNotice::new(url.to_string(), self.inner.corruption_tx.clone());
                    return Ok(ZipRoot::new(archive, notice));
                }
                Outcome::Failed(err) => {
                    // Remove so a later attempt retries the open.
                    self.remove_exact(url, &entry);
                    return Err(err);
                }
                Outcome::Corrupted => {
                    self.remove_exact(url, &entry);
                    continue;
                }
                Outcome::Opening => {
                    // done fired before the state was written; retry.
                    tokio::task::yield_now().await;
                    continue;
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.archives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.archives.is_empty()
    }

    fn lookup_or_open(&self, url: &str) -> Arc<CacheEntry> {
        use dashmap::mapref::entry::Entry;

        match self.inner.archives.entry(url.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = Arc::clone(occupied.get());
                if entry.is_corrupted() {
                    // Replace in place under the shard lock so exactly
                    // one rebuild starts.
                    let fresh = Inner::new_open_entry(&self.inner, url);
                    occupied.insert(Arc::clone(&fresh));
                    fresh
                } else {
                    entry
                }
            }
            Entry::Vacant(vacant) => {
                let entry = Inner::new_open_entry(&self.inner, url);
                vacant.insert(Arc::clone(&entry));
                entry
            }
        }
    }

    fn remove_exact(&self, url: &str, entry: &Arc<CacheEntry>) {
        self.inner
            .archives
            .remove_if(url, |_, current| Arc::ptr_eq(current, entry));
    }
}

impl Drop for ZipCache {
    fn drop(&mut self) {
        self.sweeper.abort();
        self.corruption_listener.abort();
    }
}

impl Inner {
    /// Create an `Opening` entry and detach the open task. The task is
    /// intentionally not tied to any caller: cancellation of the
    /// original requester must not leave waiters hanging.
    fn new_open_entry(inner: &Arc<Self>, url: &str) -> Arc<CacheEntry> {
        let (done_tx, done_rx) = watch::channel(false);
        let entry = Arc::new(CacheEntry::new(url, done_rx));

        let task_entry = Arc::clone(&entry);
        let task_inner = Arc::clone(inner);
        let task_url = url.to_string();
        tokio::spawn(async move {
            let opened = tokio::time::timeout(
                task_inner.config.open_timeout(),
                ZipArchive::open(&task_inner.client, &task_url),
            )
            .await;

            let state = match opened {
                Ok(Ok(archive)) => {
                    debug!(url = %task_url, entries = archive.entry_count(), "archive opened");
                    ArchiveState::Opened(Arc::new(archive))
                }
                Ok(Err(err)) => {
                    warn!(url = %task_url, error = %err, "archive open failed");
                    ArchiveState::Failed(err)
                }
                Err(_) => {
                    warn!(url = %task_url, "archive open timed out");
                    ArchiveState::Failed(Error::ArchiveOpenTimeout(task_url.clone()))
                }
            };

            *task_entry.state.write().expect("state lock") = state;
            task_entry.refreshed();
            let _ = done_tx.send(true);
        });

        entry
    }

    /// Re-probe an archive past its refresh interval. ETag unchanged ⇒
    /// touch; changed ⇒ quarantine so the next access rebuilds.
    fn maybe_refresh(self: &Arc<Self>, entry: &Arc<CacheEntry>, archive: &Arc<ZipArchive>) {
        if !entry.needs_refresh(&self.config) {
            return;
        }
        if entry.refreshing.swap(true, Ordering::SeqCst) {
            return;
        }

        let inner = Arc::clone(self);
        let entry = Arc::clone(entry);
        let current_etag = archive.etag().map(|s| s.to_string());
        tokio::spawn(async move {
            match Resource::probe(&inner.client, &entry.url).await {
                Ok(resource) if resource.etag == current_etag => {
                    debug!(url = %entry.url, "archive refresh: unchanged");
                    entry.refreshed();
                }
                Ok(_) => {
                    info!(url = %entry.url, "archive refresh: content changed, quarantining");
                    entry.mark_corrupted();
                    // refreshing stays set: the entry is replaced on the
                    // next access, not refreshed again.
                }
                Err(err) => {
                    warn!(url = %entry.url, error = %err, "archive refresh probe failed");
                    entry.refreshing.store(false, Ordering::SeqCst);
                }
            }
        });
    }

    async fn sweep_loop(inner: Arc<Self>) {
        // interval() panics on zero periods
        let period = inner
            .config
            .cleanup_interval()
            .max(std::time::Duration::from_secs(1));
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let expiration = inner.config.expiration_interval();
            let before = inner.archives.len();
            inner.archives.retain(|_, entry| entry.idle_for() <= expiration);
            let evicted = before - inner.archives.len();
            if evicted > 0 {
                debug!(evicted, remaining = inner.archives.len(), "archive cache sweep");
            }
        }
    }

    async fn corruption_loop(inner: Arc<Self>, mut rx: mpsc::UnboundedReceiver<String>) {
        while let Some(url) = rx.recv().await {
            if let Some(entry) = inner.archives.get(&url) {
                info!(url = %url, "archive read failed after open, quarantining");
                entry.mark_corrupted();
            }
        }
    }
}
