use http::StatusCode;
use strata_core::domain::Domain;
use strata_core::lookup::ServingRequest;
use strata_serving::response::{self, Body};
use strata_serving::{Reader, ServeParams};
use tracing::debug;

pub const CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// HTTP-01 challenge relay. A token present in the site's content is
/// served directly; everything else is handed to the upstream identity
/// server, which runs the actual ACME client.
pub struct AcmeMiddleware {
    server: String,
    http: reqwest::Client,
}

impl AcmeMiddleware {
    pub fn new(http: reqwest::Client, server: &str) -> Self {
        Self {
            server: server.trim_end_matches('/').to_string(),
            http,
        }
    }

    /// Answer an ACME challenge request, or `None` when the path is not
    /// a challenge.
    pub async fn serve_challenge(
        &self,
        reader: &Reader,
        params: &ServeParams<'_>,
        domain: Option<&Domain>,
        serving: Option<&ServingRequest>,
    ) -> Option<http::Response<Body>> {
        if !params.url_path.starts_with(CHALLENGE_PREFIX) {
            return None;
        }

        // The site may carry the token file itself (manual setups).
        if domain.is_some() {
            if let Some(serving) = serving {
                let mut with_token = serving.clone();
                with_token.sub_path = params.url_path.trim_start_matches('/').to_string();
                if let Some(resp) = reader.serve_file_http(params, &with_token).await {
                    if resp.status().is_success() {
                        return Some(resp);
                    }
                }
            }
        }

        debug!(path = %params.url_path, "relaying acme challenge upstream");
        Some(self.proxy_upstream(params).await)
    }

    async fn proxy_upstream(&self, params: &ServeParams<'_>) -> http::Response<Body> {
        let target = format!("{}{}", self.server, params.url_path);
        match self.http.get(&target).send().await {
            Ok(upstream) => {
                let status = StatusCode::from_u16(upstream.status().as_u16())
                    .unwrap_or(StatusCode::BAD_GATEWAY);
                match upstream.bytes().await {
                    Ok(body) => http::Response::builder()
                        .status(status)
                        .body(response::full(body))
                        .expect("proxied response"),
                    Err(_) => response::error_response(StatusCode::BAD_GATEWAY),
                }
            }
            Err(_) => response::error_response(StatusCode::BAD_GATEWAY),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_prefix_matches_tokens_only() {
        assert!("/.well-known/acme-challenge/token-abc".starts_with(CHALLENGE_PREFIX));
        assert!(!"/.well-known/other".starts_with(CHALLENGE_PREFIX));
    }
}
