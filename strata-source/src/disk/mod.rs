pub mod map;

pub use map::{read_groups, DomainMap};

use arc_swap::ArcSwapOption;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strata_core::domain::Domain;
use tracing::{info, warn};

/// Name of the sentinel file that debounces rescans.
pub const UPDATE_FILE: &str = ".update";

/// The disk-backed domains source.
///
/// Requests read the current map through an atomic pointer load; the
/// watcher replaces the whole map after a successful scan. A request
/// sees either the old map entirely or the new map entirely.
pub struct DiskSource {
    map: ArcSwapOption<DomainMap>,
    scans: std::sync::atomic::AtomicU64,
}

impl DiskSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            map: ArcSwapOption::from(None),
            scans: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// Number of published scans since start.
    pub fn scan_count(&self) -> u64 {
        self.scans.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn get_domain(&self, host: &str) -> Option<Arc<Domain>> {
        let guard = self.map.load();
        guard.as_ref()?.get(host).cloned()
    }

    /// Ready after the first full scan has been published.
    pub fn is_ready(&self) -> bool {
        self.map.load().is_some()
    }

    pub fn domain_count(&self) -> usize {
        self.map.load().as_ref().map_or(0, |m| m.len())
    }

    fn publish(&self, map: DomainMap) {
        self.map.store(Some(Arc::new(map)));
        self.scans
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    /// Watch `<root>/.update` and rescan whenever its content changes.
    /// The first scan runs immediately so the source becomes ready
    /// without a sentinel write.
    pub fn watch(
        self: &Arc<Self>,
        root: PathBuf,
        pages_domain: String,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let source = Arc::clone(self);
        tokio::spawn(async move {
            let sentinel = root.join(UPDATE_FILE);
            let mut last_seen: Option<Vec<u8>> = Some(b"never-scanned".to_vec());

            loop {
                let current = tokio::fs::read(&sentinel).await.ok();
                if current != last_seen {
                    last_seen = current;
                    source.rescan(&root, &pages_domain).await;
                }
                tokio::time::sleep(interval).await;
            }
        })
    }

    async fn rescan(&self, root: &std::path::Path, pages_domain: &str) {
        let started = Instant::now();
        let scan_root = root.to_path_buf();
        let scan_domain = pages_domain.to_string();

        let scanned =
            tokio::task::spawn_blocking(move || read_groups(&scan_root, &scan_domain)).await;

        match scanned {
            Ok(map) => {
                info!(
                    domains = map.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "domain map updated"
                );
                self.publish(map);
            }
            Err(err) => warn!(error = %err, "domain scan task failed"),
        }
    }
}
