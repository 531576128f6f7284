use http::{header, StatusCode};
use std::time::Duration;
use strata_core::config::ArtifactsConfig;
use strata_serving::response::{self, Body};
use tracing::debug;

/// Requests under this prefix are artifact browsing, not page content.
pub const ARTIFACT_PREFIX: &str = "/-/";

/// Proxy for build artifact browsing on pages hosts. Only requests on
/// hosts under the pages domain are forwarded.
pub struct Artifact {
    server: String,
    pages_domain_suffix: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl Artifact {
    pub fn new(http: reqwest::Client, config: &ArtifactsConfig, pages_domain: &str) -> Self {
        Self {
            server: config.server.trim_end_matches('/').to_string(),
            pages_domain_suffix: format!(".{}", pages_domain.to_ascii_lowercase()),
            timeout: Duration::from_secs(config.timeout_secs),
            http,
        }
    }

    /// Handle an artifact request, or `None` when the request is not
    /// one.
    pub async fn handle(&self, host: &str, url_path: &str) -> Option<http::Response<Body>> {
        if !url_path.starts_with(ARTIFACT_PREFIX) {
            return None;
        }
        if !host.ends_with(&self.pages_domain_suffix) {
            return None;
        }

        let target = format!("{}{}", self.server, url_path);
        debug!(host = %host, target = %target, "proxying artifact request");

        let upstream = match self.http.get(&target).timeout(self.timeout).send().await {
            Ok(upstream) => upstream,
            Err(_) => return Some(response::error_response(StatusCode::BAD_GATEWAY)),
        };

        let status =
            StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let content_type = upstream
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        match upstream.bytes().await {
            Ok(body) => Some(
                http::Response::builder()
                    .status(status)
                    .header(header::CONTENT_TYPE, content_type)
                    .body(response::full(body))
                    .expect("proxied response"),
            ),
            Err(_) => Some(response::error_response(StatusCode::BAD_GATEWAY)),
        }
    }
}
