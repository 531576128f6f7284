use crate::acme::AcmeMiddleware;
use crate::artifact::Artifact;
use crate::auth::{self, Auth};
use crate::headers;
use http::request::Parts;
use http::{header, HeaderMap, Method, Response, StatusCode};
use std::sync::Arc;
use strata_core::{host, Error};
use strata_observability::Metrics;
use strata_serving::response::{self, Body};
use strata_serving::{Reader, ServeParams};
use strata_source::Source;
use tracing::error;

/// How the request reached us: straight from a client socket, or via a
/// trusted L7 proxy whose `X-Forwarded-*` headers are believed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryVariant {
    Direct,
    Proxy,
}

/// The request pipeline. Each middleware is a step that either
/// short-circuits with a response or lets the request continue; the
/// chain order matches the listener data flow:
/// method filter → routing → custom headers → ACME → auth → aux →
/// access control → CORS → serve.
pub struct PagesService {
    pub source: Source,
    pub reader: Reader,
    pub metrics: Arc<Metrics>,
    pub status_path: String,
    pub redirect_http: bool,
    pub disable_cors: bool,
    pub custom_headers: HeaderMap,
    pub auth: Option<Auth>,
    pub artifact: Option<Artifact>,
    pub acme: Option<AcmeMiddleware>,
}

impl PagesService {
    pub async fn handle(
        &self,
        parts: &Parts,
        transport_https: bool,
        variant: EntryVariant,
    ) -> Response<Body> {
        let mut resp = self.handle_inner(parts, transport_https, variant).await;
        headers::add_custom_headers(&mut resp, &self.custom_headers);
        self.metrics.record_request(resp.status().as_u16());

        if resp.status().is_success() {
            if let Some(size) = resp
                .headers()
                .get(header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<f64>().ok())
            {
                self.metrics.serving_file_size.observe(size);
            }
        }

        resp
    }

    async fn handle_inner(
        &self,
        parts: &Parts,
        transport_https: bool,
        variant: EntryVariant,
    ) -> Response<Body> {
        // ── method filter ───────────────────────────────────────
        if !is_iana_method(&parts.method) {
            self.metrics.rejected_requests_total.inc();
            return text_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed\n");
        }

        // ── entry facts ─────────────────────────────────────────
        let (https, raw_host) = entry_facts(parts, transport_https, variant);
        let host = host::normalize(&raw_host);
        let path = parts.uri.path().to_string();
        let cookies = auth::parse_cookies(
            parts
                .headers
                .get(header::COOKIE)
                .and_then(|v| v.to_str().ok()),
        );

        // ── routing ─────────────────────────────────────────────
        let domain = match self.source.get_domain(&host).await {
            Ok(domain) => domain,
            Err(err) => {
                error!(host = %host, error = %err, "could not fetch domain information from the source");
                return response::error_response(StatusCode::BAD_GATEWAY);
            }
        };
        let serving = domain.as_ref().and_then(|d| match d.resolve(&path, &host) {
            Ok(serving) => Some(serving),
            Err(Error::DomainNotFound) => None,
            Err(_) => None,
        });

        let params = ServeParams {
            host: &host,
            url_path: &path,
            method: &parts.method,
            range: parts
                .headers
                .get(header::RANGE)
                .and_then(|v| v.to_str().ok()),
        };

        // ── acme challenge relay ────────────────────────────────
        if let Some(acme) = &self.acme {
            if let Some(resp) = acme
                .serve_challenge(&self.reader, &params, domain.as_deref(), serving.as_ref())
                .await
            {
                return resp;
            }
        }

        // ── auth endpoints ──────────────────────────────────────
        if let Some(auth) = &self.auth {
            if path == auth::CALLBACK_PATH {
                return auth
                    .handle_callback(parts.uri.query().unwrap_or_default(), &cookies)
                    .await;
            }
            if path == auth::AUTH_PATH {
                let query = auth::parse_query(parts.uri.query().unwrap_or_default());
                let return_to = query
                    .get("return_to")
                    .cloned()
                    .unwrap_or_else(|| "/".to_string());
                return auth.start_login(&host, &return_to);
            }
        }

        // ── auxiliary handlers ──────────────────────────────────
        if path == self.status_path {
            return if self.source.is_ready() {
                text_response(StatusCode::OK, "success")
            } else {
                text_response(StatusCode::SERVICE_UNAVAILABLE, "not yet ready")
            };
        }

        if !https && self.redirect_http {
            let location = https_location(&host, parts);
            return response::redirect(&location, StatusCode::TEMPORARY_REDIRECT);
        }

        if let Some(artifact) = &self.artifact {
            if let Some(resp) = artifact.handle(&host, &path).await {
                return resp;
            }
        }

        if !self.source.is_ready() {
            return response::error_response(StatusCode::SERVICE_UNAVAILABLE);
        }

        // Unknown domain, or a known domain without a site at this
        // path prefix. With auth configured, force a login round first
        // so private sites cannot be probed by 404 timing.
        let (Some(_domain), Some(serving)) = (domain.as_ref(), serving) else {
            if let Some(auth) = &self.auth {
                if auth.session_token(&cookies).is_none() {
                    return auth.start_login(&host, &path);
                }
            }
            return response::error_response(StatusCode::NOT_FOUND);
        };

        if !https && serving.lookup_path.is_https_only {
            let location = https_location(&host, parts);
            return response::redirect(&location, StatusCode::MOVED_PERMANENTLY);
        }

        // ── access control ──────────────────────────────────────
        if serving.lookup_path.has_access_control {
            let Some(auth) = &self.auth else {
                // No identity server to ask: a protected site is not
                // servable.
                return response::error_response(StatusCode::NOT_FOUND);
            };
            match auth.session_token(&cookies) {
                None => return auth.start_login(&host, &path),
                Some(token) => {
                    if !auth
                        .check_project_access(&token, serving.lookup_path.project_id)
                        .await
                    {
                        return response::error_response(StatusCode::NOT_FOUND);
                    }
                }
            }
        }

        // ── serve ───────────────────────────────────────────────
        let mut resp = match self.reader.serve_file_http(&params, &serving).await {
            Some(resp) => resp,
            None => {
                if serving.lookup_path.is_namespace_project {
                    // Projects shadow namespace-project paths and may be
                    // private even when the namespace site is public.
                    if let Some(auth) = &self.auth {
                        if auth.session_token(&cookies).is_none() {
                            return auth.start_login(&host, &path);
                        }
                    }
                    return response::error_response(StatusCode::NOT_FOUND);
                }
                self.reader.serve_not_found_http(&params, &serving).await
            }
        };

        // ── cors (GET only) ─────────────────────────────────────
        if !self.disable_cors
            && matches!(parts.method, Method::GET | Method::HEAD)
            && parts.headers.contains_key(header::ORIGIN)
        {
            resp.headers_mut().insert(
                header::ACCESS_CONTROL_ALLOW_ORIGIN,
                header::HeaderValue::from_static("*"),
            );
            resp.headers_mut()
                .insert(header::VARY, header::HeaderValue::from_static("Origin"));
        }

        resp
    }
}

fn entry_facts(parts: &Parts, transport_https: bool, variant: EntryVariant) -> (bool, String) {
    match variant {
        EntryVariant::Direct => (transport_https, host_header(parts)),
        EntryVariant::Proxy => {
            let https = parts
                .headers
                .get("x-forwarded-proto")
                .and_then(|v| v.to_str().ok())
                .map(|proto| proto.eq_ignore_ascii_case("https"))
                .unwrap_or(transport_https);
            let host = parts
                .headers
                .get("x-forwarded-host")
                .and_then(|v| v.to_str().ok())
                .map(|h| h.to_string())
                .unwrap_or_else(|| host_header(parts));
            (https, host)
        }
    }
}

fn host_header(parts: &Parts) -> String {
    parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|h| h.to_string())
        .or_else(|| parts.uri.host().map(|h| h.to_string()))
        .unwrap_or_default()
}

fn https_location(host: &str, parts: &Parts) -> String {
    match parts.uri.query() {
        Some(query) => format!("https://{}{}?{}", host, parts.uri.path(), query),
        None => format!("https://{}{}", host, parts.uri.path()),
    }
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(response::full(body))
        .expect("static response")
}

fn is_iana_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET
            | Method::HEAD
            | Method::POST
            | Method::PUT
            | Method::PATCH
            | Method::DELETE
            | Method::CONNECT
            | Method::OPTIONS
            | Method::TRACE
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iana_methods() {
        assert!(is_iana_method(&Method::GET));
        assert!(is_iana_method(&Method::TRACE));
        let propfind = Method::from_bytes(b"PROPFIND").unwrap();
        assert!(!is_iana_method(&propfind));
    }

    fn parts_for(uri: &str, headers: &[(&str, &str)]) -> Parts {
        let mut builder = http::Request::builder().uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn entry_facts_direct_uses_transport() {
        let parts = parts_for("/x", &[("host", "Site.Example:8443")]);
        let (https, host) = entry_facts(&parts, true, EntryVariant::Direct);
        assert!(https);
        assert_eq!(host, "Site.Example:8443");
    }

    #[test]
    fn entry_facts_proxy_honors_forwarded_headers() {
        let parts = parts_for(
            "/x",
            &[
                ("host", "edge.internal"),
                ("x-forwarded-proto", "https"),
                ("x-forwarded-host", "site.example"),
            ],
        );
        let (https, host) = entry_facts(&parts, false, EntryVariant::Proxy);
        assert!(https);
        assert_eq!(host, "site.example");
    }

    #[test]
    fn entry_facts_proxy_falls_back_to_transport() {
        let parts = parts_for("/x", &[("host", "site.example")]);
        let (https, host) = entry_facts(&parts, false, EntryVariant::Proxy);
        assert!(!https);
        assert_eq!(host, "site.example");
    }

    #[test]
    fn https_location_keeps_query() {
        let parts = parts_for("/a/b?x=1", &[]);
        assert_eq!(https_location("h.test", &parts), "https://h.test/a/b?x=1");
        let parts = parts_for("/a/b", &[]);
        assert_eq!(https_location("h.test", &parts), "https://h.test/a/b");
    }
}
