use crate::api::client::ApiClient;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use strata_core::config::ApiConfig;
use strata_core::lookup::VirtualDomain;
use strata_core::{Error, Result};
use tokio::sync::watch;
use tracing::debug;

/// Feature flag: set to "true" to let transient refresh errors replace
/// a previously successful lookup immediately.
pub const FF_DISABLE_REFRESH_TEMPORARY_ERROR: &str = "FF_DISABLE_REFRESH_TEMPORARY_ERROR";

/// A lookup outcome as cached: success or error, both memoizable.
pub type Lookup = Result<Arc<VirtualDomain>>;

/// Hostname-keyed lookup cache with three freshness tiers:
///
/// - up-to-date: cached value, no network;
/// - stale: cached value now, single-flight background refresh;
/// - missing: callers block on one shared retrieval.
///
/// A refresh that fails with a temporary error keeps serving the old
/// response (with its original timestamp) until the entry is older than
/// the expiration interval, so a flapping upstream cannot demote a
/// known site to 404.
pub struct LookupCache {
    client: Arc<ApiClient>,
    config: ApiConfig,
    entries: DashMap<String, Arc<CacheEntry>>,
    pub hits: AtomicU64,
    pub misses: AtomicU64,
}

struct CacheEntry {
    host: String,
    created: Instant,
    /// When a refresh preserved an older response, the original entry's
    /// creation time carries forward so expiration still counts from
    /// the last real success.
    original_created: RwLock<Option<Instant>>,
    response: RwLock<Option<Lookup>>,
    retrieve_started: AtomicBool,
    refresh_started: AtomicBool,
    retrieved_tx: watch::Sender<bool>,
    retrieved_rx: watch::Receiver<bool>,
}

impl CacheEntry {
    fn new(host: &str) -> Arc<Self> {
        let (tx, rx) = watch::channel(false);
        Arc::new(Self {
            host: host.to_string(),
            created: Instant::now(),
            original_created: RwLock::new(None),
            response: RwLock::new(None),
            retrieve_started: AtomicBool::new(false),
            refresh_started: AtomicBool::new(false),
            retrieved_tx: tx,
            retrieved_rx: rx,
        })
    }

    fn lookup(&self) -> Option<Lookup> {
        self.response.read().expect("response lock").clone()
    }

    fn set_response(&self, lookup: Lookup) {
        *self.response.write().expect("response lock") = Some(lookup);
        let _ = self.retrieved_tx.send(true);
    }

    fn effective_created(&self) -> Instant {
        self.original_created
            .read()
            .expect("original_created lock")
            .unwrap_or(self.created)
    }

    fn is_resolved(&self) -> bool {
        self.response.read().expect("response lock").is_some()
    }

    fn is_up_to_date(&self, config: &ApiConfig) -> bool {
        self.is_resolved() && self.effective_created().elapsed() < config.cache_refresh()
    }

    fn needs_refresh(&self, config: &ApiConfig) -> bool {
        self.is_resolved() && self.effective_created().elapsed() >= config.cache_refresh()
    }

    fn is_expired(&self, config: &ApiConfig) -> bool {
        self.effective_created().elapsed() > config.cache_expiration()
    }

    /// A failed lookup whose error does not mean "domain deleted".
    fn has_temporary_error(&self) -> bool {
        if std::env::var(FF_DISABLE_REFRESH_TEMPORARY_ERROR).as_deref() == Ok("true") {
            return false;
        }
        matches!(self.lookup(), Some(Err(err)) if !err.is_permanent())
    }
}

impl LookupCache {
    pub fn new(client: Arc<ApiClient>, config: ApiConfig) -> Self {
        Self {
            client,
            config,
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Resolve a hostname through the cache.
    pub async fn resolve(self: &Arc<Self>, host: &str) -> Lookup {
        let entry = self.load_or_create(host);

        if entry.is_up_to_date(&self.config) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return entry.lookup().unwrap_or(Err(Error::DomainNotFound));
        }

        if entry.needs_refresh(&self.config) {
            self.schedule_refresh(&entry);
            self.hits.fetch_add(1, Ordering::Relaxed);
            return entry.lookup().unwrap_or(Err(Error::DomainNotFound));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        self.retrieve(&entry).await
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn load_or_create(&self, host: &str) -> Arc<CacheEntry> {
        self.entries
            .entry(host.to_string())
            .or_insert_with(|| CacheEntry::new(host))
            .clone()
    }

    /// Kick the single-flight retrieval and wait for it, bounded by the
    /// configured retrieval timeout. The retrieval task is detached:
    /// a caller going away never cancels it, and later callers inherit
    /// its result.
    async fn retrieve(self: &Arc<Self>, entry: &Arc<CacheEntry>) -> Lookup {
        self.ensure_retrieval(entry);

        let mut done = entry.retrieved_rx.clone();
        let waited =
            tokio::time::timeout(self.config.retrieval_timeout(), done.wait_for(|v| *v)).await;

        match waited {
            Ok(Ok(_)) => entry.lookup().unwrap_or(Err(Error::DomainNotFound)),
            Ok(Err(_)) => Err(Error::SourceUnavailable(format!(
                "{}: retrieval task vanished",
                entry.host
            ))),
            Err(_) => Err(Error::Canceled(format!(
                "{}: domain lookup deadline exceeded",
                entry.host
            ))),
        }
    }

    fn ensure_retrieval(self: &Arc<Self>, entry: &Arc<CacheEntry>) {
        if entry.retrieve_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let client = Arc::clone(&self.client);
        let entry = Arc::clone(entry);
        tokio::spawn(async move {
            let lookup = client.retrieve(&entry.host).await;
            entry.set_response(lookup);
        });
    }

    /// Single-flight background refresh: build a replacement entry,
    /// retrieve into it, and swap it into the store. Temporary errors
    /// carry the old response (and its timestamp) forward while the old
    /// entry has not expired.
    fn schedule_refresh(self: &Arc<Self>, entry: &Arc<CacheEntry>) {
        if entry.refresh_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let cache = Arc::clone(self);
        let old = Arc::clone(entry);
        tokio::spawn(async move {
            let fresh = CacheEntry::new(&old.host);
            cache.ensure_retrieval(&fresh);

            let mut done = fresh.retrieved_rx.clone();
            if done.wait_for(|v| *v).await.is_err() {
                // retrieval task died; leave the old entry in place so a
                // later access retries the refresh
                old.refresh_started.store(false, Ordering::SeqCst);
                return;
            }

            if fresh.has_temporary_error() && !old.is_expired(&cache.config) {
                debug!(host = %old.host, "refresh failed temporarily, keeping previous lookup");
                if let Some(previous) = old.lookup() {
                    *fresh.response.write().expect("response lock") = Some(previous);
                }
                *fresh.original_created.write().expect("original_created lock") =
                    Some(old.effective_created());
            }

            cache.entries.insert(old.host.clone(), fresh);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Entry state transitions without any network; the cache behavior
    // against a live server lives in tests/api_source.rs.

    fn config() -> ApiConfig {
        ApiConfig {
            endpoint: "http://unused.test".into(),
            secret: "s".into(),
            cache_refresh_secs: 0,
            cache_expiration_secs: 0,
            retrieval_timeout_secs: 1,
            max_retrieval_retries: 1,
            max_retrieval_interval_ms: 10,
        }
    }

    #[test]
    fn fresh_entry_is_not_resolved() {
        let entry = CacheEntry::new("a.example");
        let cfg = config();
        assert!(!entry.is_resolved());
        assert!(!entry.is_up_to_date(&cfg));
        assert!(!entry.needs_refresh(&cfg));
    }

    #[test]
    fn resolved_entry_with_zero_refresh_needs_refresh() {
        let entry = CacheEntry::new("a.example");
        entry.set_response(Err(Error::DomainNotFound));
        let cfg = config();
        assert!(entry.is_resolved());
        assert!(!entry.is_up_to_date(&cfg));
        assert!(entry.needs_refresh(&cfg));
    }

    #[test]
    fn temporary_error_classification() {
        let entry = CacheEntry::new("a.example");
        entry.set_response(Err(Error::Upstream("boom".into())));
        assert!(entry.has_temporary_error());

        let entry = CacheEntry::new("b.example");
        entry.set_response(Err(Error::DomainNotFound));
        assert!(!entry.has_temporary_error(), "missing domain is permanent");

        let entry = CacheEntry::new("c.example");
        entry.set_response(Ok(Arc::new(VirtualDomain {
            certificate: None,
            key: None,
            lookup_paths: vec![],
        })));
        assert!(!entry.has_temporary_error());
    }

    #[test]
    fn original_timestamp_drives_expiration() {
        let cfg = ApiConfig {
            cache_expiration_secs: 0,
            ..Default::default()
        };
        let entry = CacheEntry::new("a.example");
        entry.set_response(Err(Error::Upstream("x".into())));
        *entry.original_created.write().unwrap() =
            Some(Instant::now() - std::time::Duration::from_secs(5));
        assert!(entry.is_expired(&cfg));
    }
}
