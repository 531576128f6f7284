use std::sync::Arc;
use std::time::Duration;
use strata_core::config::ApiConfig;
use strata_core::lookup::VirtualDomain;
use strata_core::{Error, Result};
use tracing::{debug, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);

/// Client for the internal pages API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    endpoint: String,
    secret: String,
    max_retries: u32,
    max_interval: Duration,
}

impl ApiClient {
    pub fn new(client: reqwest::Client, config: &ApiConfig) -> Self {
        Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            secret: config.secret.clone(),
            max_retries: config.max_retrieval_retries.max(1),
            max_interval: config.max_retrieval_interval(),
        }
    }

    /// One lookup attempt. 204 means the domain definitively does not
    /// exist; 401 means the shared secret is misconfigured.
    pub async fn get_virtual_domain(&self, host: &str) -> Result<VirtualDomain> {
        let url = format!("{}/api/v4/internal/pages", self.endpoint);
        let response = self
            .client
            .get(&url)
            .query(&[("host", host)])
            .bearer_auth(&self.secret)
            .send()
            .await
            .map_err(|e| Error::Upstream(e.to_string()))?;

        match response.status().as_u16() {
            200 => response
                .json::<VirtualDomain>()
                .await
                .map_err(|e| Error::Upstream(format!("{host}: malformed lookup response: {e}"))),
            204 => Err(Error::DomainNotFound),
            401 => Err(Error::Unauthorized),
            other => Err(Error::Upstream(format!(
                "{host}: lookup returned status {other}"
            ))),
        }
    }

    /// Lookup with bounded exponential backoff. Permanent outcomes
    /// (missing domain, rejected secret) return immediately.
    pub async fn retrieve(&self, host: &str) -> Result<Arc<VirtualDomain>> {
        let mut backoff = INITIAL_BACKOFF;
        let mut last_err = Error::Upstream(format!("{host}: lookup never attempted"));

        for attempt in 1..=self.max_retries {
            match self.get_virtual_domain(host).await {
                Ok(vd) => {
                    debug!(host = %host, attempt, paths = vd.lookup_paths.len(), "domain lookup resolved");
                    return Ok(Arc::new(vd));
                }
                Err(err @ (Error::DomainNotFound | Error::Unauthorized)) => return Err(err),
                Err(err) => {
                    warn!(host = %host, attempt, error = %err, "domain lookup failed");
                    last_err = err;
                }
            }

            if attempt < self.max_retries {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(self.max_interval);
            }
        }

        Err(last_err)
    }

    /// Connectivity check used by the readiness poller.
    pub async fn status(&self) -> Result<()> {
        let url = format!("{}/api/v4/internal/pages/status", self.endpoint);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.secret)
            .send()
            .await
            .map_err(|e| Error::Upstream(e.to_string()))?;

        match response.status().as_u16() {
            200 | 204 => Ok(()),
            401 => Err(Error::Unauthorized),
            other => Err(Error::Upstream(format!("status returned {other}"))),
        }
    }
}
