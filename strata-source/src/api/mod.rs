pub mod cache;
pub mod client;

pub use cache::LookupCache;
pub use client::ApiClient;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strata_core::config::ApiConfig;
use strata_core::domain::{Domain, Resolver};
use strata_core::{Error, Result};
use tracing::error;

/// Domains source backed by the internal pages API.
pub struct ApiSource {
    cache: Arc<LookupCache>,
    client: Arc<ApiClient>,
    ready: AtomicBool,
}

impl ApiSource {
    pub fn new(http: reqwest::Client, config: &ApiConfig) -> Arc<Self> {
        let client = Arc::new(ApiClient::new(http, config));
        Arc::new(Self {
            cache: Arc::new(LookupCache::new(Arc::clone(&client), config.clone())),
            client,
            ready: AtomicBool::new(false),
        })
    }

    /// Poll the API status endpoint until it answers, arming readiness.
    pub fn poll_readiness(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let source = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match source.client.status().await {
                    Ok(()) => {
                        source.ready.store(true, Ordering::SeqCst);
                        return;
                    }
                    Err(err) => {
                        error!(error = %err, "pages API is not reachable yet");
                        tokio::time::sleep(interval).await;
                    }
                }
            }
        })
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn lookup_cache(&self) -> &Arc<LookupCache> {
        &self.cache
    }

    /// Resolve a hostname into a domain. `Ok(None)` means the domain
    /// definitively does not exist.
    pub async fn get_domain(&self, host: &str) -> Result<Option<Arc<Domain>>> {
        match self.cache.resolve(host).await {
            Ok(virtual_domain) => {
                self.ready.store(true, Ordering::SeqCst);
                let domain = Domain::new(
                    host.to_string(),
                    String::new(),
                    String::new(),
                    Resolver::Api(Arc::clone(&virtual_domain)),
                )
                .with_certificate(
                    virtual_domain.certificate.clone(),
                    virtual_domain.key.clone(),
                );
                Ok(Some(Arc::new(domain)))
            }
            Err(Error::DomainNotFound) => Ok(None),
            Err(Error::Unauthorized) => {
                // A rejected secret makes the whole source unhealthy:
                // flip readiness so the status endpoint reports 503
                // until a successful call re-arms it.
                self.ready.store(false, Ordering::SeqCst);
                error!(
                    "pages API rejected the shared secret; \
                     verify the configured secret matches the server"
                );
                Err(Error::Unauthorized)
            }
            Err(err) => Err(Error::SourceUnavailable(err.to_string())),
        }
    }
}
