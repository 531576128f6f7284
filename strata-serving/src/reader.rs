use crate::redirects::{self, Redirects, CONFIG_FILE};
use crate::response::{self, Body, FileBody};
use http::{header, Method, Response, StatusCode};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use strata_core::lookup::ServingRequest;
use strata_core::{Error, Result};
use strata_vfs::{symlink, Root, Vfs};
use tracing::debug;

/// Sniff window for content-type detection when the extension says
/// nothing.
const SNIFF_LEN: u64 = 512;

/// Everything the serving engine needs to know about the request.
pub struct ServeParams<'a> {
    pub host: &'a str,
    pub url_path: &'a str,
    pub method: &'a Method,
    pub range: Option<&'a str>,
}

impl ServeParams<'_> {
    fn is_head(&self) -> bool {
        self.method == Method::HEAD
    }
}

/// The content serving engine: resolves a `ServingRequest` against the
/// VFS and produces the response.
pub struct Reader {
    vfs: Arc<Vfs>,
}

impl Reader {
    pub fn new(vfs: Arc<Vfs>) -> Self {
        Self { vfs }
    }

    /// Serve the site file for this request. `None` means nothing was
    /// served and the caller decides what a miss looks like.
    pub async fn serve_file_http(
        &self,
        params: &ServeParams<'_>,
        serving_request: &ServingRequest,
    ) -> Option<Response<Body>> {
        let lookup = &serving_request.lookup_path;
        let root = match self.vfs.root(lookup.serving, &lookup.root).await {
            Ok(root) => root,
            Err(err) => {
                debug!(root = %lookup.root, error = %err, "site root not available");
                return match err {
                    // Archive-level failures are server-side errors, not
                    // a silent 404.
                    Error::RangeRequestsNotSupported
                    | Error::ArchiveCorrupted(_)
                    | Error::ArchiveOpenTimeout(_)
                    | Error::ArchiveNotSupported(_)
                    | Error::Upstream(_) => {
                        Some(response::error_response(StatusCode::INTERNAL_SERVER_ERROR))
                    }
                    _ => None,
                };
            }
        };

        match self.try_file(&root, params, serving_request).await {
            Ok(resp) => Some(resp),
            Err(err) => {
                if redirects::enabled() {
                    if let Some(resp) = self.try_redirects(&root, params).await {
                        return Some(resp);
                    }
                }
                match err {
                    Error::RangeRequestsNotSupported | Error::ArchiveCorrupted(_) => {
                        Some(response::error_response(StatusCode::INTERNAL_SERVER_ERROR))
                    }
                    _ => {
                        debug!(path = %params.url_path, error = %err, "file not served");
                        None
                    }
                }
            }
        }
    }

    /// Serve the site's `404.html`, or the minimal 404 page.
    pub async fn serve_not_found_http(
        &self,
        params: &ServeParams<'_>,
        serving_request: &ServingRequest,
    ) -> Response<Body> {
        let lookup = &serving_request.lookup_path;
        let root = match self.vfs.root(lookup.serving, &lookup.root).await {
            Ok(root) => root,
            Err(_) => return response::error_response(StatusCode::NOT_FOUND),
        };

        match self.resolve_path(&root, "404.html").await {
            Ok(full_path) => self
                .serve_contents(&root, &full_path, params, StatusCode::NOT_FOUND, true)
                .await
                .unwrap_or_else(|_| response::error_response(StatusCode::NOT_FOUND)),
            Err(_) => response::error_response(StatusCode::NOT_FOUND),
        }
    }

    async fn try_file(
        &self,
        root: &Root,
        params: &ServeParams<'_>,
        serving_request: &ServingRequest,
    ) -> Result<Response<Body>> {
        let sub_path = &serving_request.sub_path;
        let mut resolved = self.resolve_path(root, sub_path).await;

        if let Err(Error::IsDirectory { .. }) = &resolved {
            if params.url_path.ends_with('/') {
                let with_index = join_sub_path(sub_path, "index.html");
                resolved = self.resolve_path(root, &with_index).await;
            } else {
                // Canonicalize directory requests to `…/`. The redirect
                // is protocol-relative so the client keeps its scheme.
                let mut location = format!(
                    "//{}/{}",
                    params.host,
                    params.url_path.trim_start_matches('/')
                );
                location = format!("{}/", location.trim_end_matches('/'));
                return Ok(response::redirect(&location, StatusCode::FOUND));
            }
        }

        if let Err(Error::NoExtension { .. }) = &resolved {
            let with_html = format!("{}.html", sub_path.trim_end_matches('/'));
            resolved = self.resolve_path(root, &with_html).await;
        }

        let full_path = resolved?;

        // The rules file itself serves its parse diagnostic.
        if full_path == CONFIG_FILE {
            if !redirects::enabled() {
                return Ok(Response::builder()
                    .status(StatusCode::FORBIDDEN)
                    .body(response::empty())
                    .expect("static response"));
            }
            let redirects = Redirects::parse(root).await;
            return Ok(serve_redirects_status(&redirects));
        }

        self.serve_contents(
            root,
            &full_path,
            params,
            StatusCode::OK,
            serving_request.lookup_path.has_access_control,
        )
        .await
    }

    async fn try_redirects(
        &self,
        root: &Root,
        params: &ServeParams<'_>,
    ) -> Option<Response<Body>> {
        let redirects = Redirects::parse(root).await;
        let (to, status) = redirects.rewrite(params.url_path)?;
        let status = StatusCode::from_u16(status).ok()?;
        Some(response::redirect(to, status))
    }

    /// Resolve a request path to a served file, turning the directory
    /// and missing-extension cases into their state-machine errors.
    async fn resolve_path(&self, root: &Root, sub_path: &str) -> Result<String> {
        let full_path = match symlink::eval_symlinks(root, sub_path).await {
            Ok(full_path) => full_path,
            Err(err) => {
                if !sub_path.ends_with(".html") {
                    return Err(Error::NoExtension {
                        full_path: sub_path.to_string(),
                    });
                }
                return Err(err);
            }
        };

        let info = root.lstat(&full_path).await?;

        if info.is_dir() {
            return Err(Error::IsDirectory {
                full_path,
                relative_path: sub_path.to_string(),
            });
        }

        // Block devices, sockets, anything irregular is a security
        // risk, not content.
        if !info.is_regular() {
            return Err(Error::NotRegularFile(full_path));
        }

        Ok(full_path)
    }

    async fn serve_contents(
        &self,
        root: &Root,
        full_path: &str,
        params: &ServeParams<'_>,
        status: StatusCode,
        access_control: bool,
    ) -> Result<Response<Body>> {
        let info = root.lstat(full_path).await?;
        let mut file = root.open(full_path).await?;
        let size = info.size;

        let content_type = self.detect_content_type(root, full_path).await;

        let mut builder = Response::builder().header(header::CONTENT_TYPE, content_type);

        if !access_control && status == StatusCode::OK {
            builder = builder
                .header(header::CACHE_CONTROL, "max-age=600")
                .header(
                    header::EXPIRES,
                    httpdate::fmt_http_date(SystemTime::now() + Duration::from_secs(600)),
                );
        }

        if let Some(modified) = info.modified {
            builder = builder.header(header::LAST_MODIFIED, httpdate::fmt_http_date(modified));
        }

        if file.is_seekable() {
            builder = builder.header(header::ACCEPT_RANGES, "bytes");

            if status == StatusCode::OK {
                match params.range.map(|raw| parse_range(raw, size)) {
                    Some(RangeSpec::Satisfiable { start, len }) => {
                        file.seek(start).await?;
                        let builder = builder
                            .status(StatusCode::PARTIAL_CONTENT)
                            .header(
                                header::CONTENT_RANGE,
                                format!("bytes {}-{}/{}", start, start + len - 1, size),
                            )
                            .header(header::CONTENT_LENGTH, len);
                        let body = if params.is_head() {
                            response::empty()
                        } else {
                            // First read happens before headers so a
                            // corrupted archive fails the request, not
                            // the stream.
                            let first = file.chunk().await?;
                            FileBody::boxed(first, file, len)
                        };
                        return Ok(builder.body(body).expect("range response"));
                    }
                    Some(RangeSpec::Unsatisfiable) => {
                        return Ok(Response::builder()
                            .status(StatusCode::RANGE_NOT_SATISFIABLE)
                            .header(header::CONTENT_RANGE, format!("bytes */{size}"))
                            .body(response::empty())
                            .expect("range response"));
                    }
                    // Malformed range headers are ignored, the full
                    // representation is served.
                    Some(RangeSpec::None) | None => {}
                }
            }
        }

        let builder = builder
            .status(status)
            .header(header::CONTENT_LENGTH, size);
        let body = if params.is_head() {
            response::empty()
        } else {
            let first = file.chunk().await?;
            FileBody::boxed(first, file, size)
        };
        Ok(builder.body(body).expect("file response"))
    }

    /// Content type by extension, sniffing the head of the file when
    /// the extension is unknown.
    async fn detect_content_type(&self, root: &Root, path: &str) -> String {
        if let Some(mime) = mime_guess::from_path(path).first() {
            return if mime.type_() == mime_guess::mime::TEXT {
                format!("{mime}; charset=utf-8")
            } else {
                mime.to_string()
            };
        }

        match root.open(path).await {
            Ok(mut file) => match file.read_all(SNIFF_LEN).await {
                Ok(head) => sniff_content_type(&head).to_string(),
                Err(_) => "application/octet-stream".to_string(),
            },
            Err(_) => "application/octet-stream".to_string(),
        }
    }
}

fn serve_redirects_status(redirects: &Redirects) -> Response<Body> {
    let mut body = redirects.status();
    body.push('\n');
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(header::X_CONTENT_TYPE_OPTIONS, "nosniff")
        .body(response::full(body))
        .expect("static response")
}

fn join_sub_path(base: &str, tail: &str) -> String {
    if base.is_empty() {
        tail.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), tail)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum RangeSpec {
    /// Header malformed, serve the whole file.
    None,
    Satisfiable {
        start: u64,
        len: u64,
    },
    Unsatisfiable,
}

/// Single-range `bytes=` parsing: `a-b`, `a-`, and `-suffix`.
fn parse_range(raw: &str, size: u64) -> RangeSpec {
    let Some(spec) = raw.strip_prefix("bytes=") else {
        return RangeSpec::None;
    };
    if spec.contains(',') {
        // multi-range requests fall back to the full representation
        return RangeSpec::None;
    }
    let Some((start_raw, end_raw)) = spec.split_once('-') else {
        return RangeSpec::None;
    };

    if start_raw.is_empty() {
        // suffix form: last N bytes
        let Ok(suffix) = end_raw.parse::<u64>() else {
            return RangeSpec::None;
        };
        if suffix == 0 || size == 0 {
            return RangeSpec::Unsatisfiable;
        }
        let len = suffix.min(size);
        return RangeSpec::Satisfiable {
            start: size - len,
            len,
        };
    }

    let Ok(start) = start_raw.parse::<u64>() else {
        return RangeSpec::None;
    };
    if start >= size {
        return RangeSpec::Unsatisfiable;
    }

    let end = if end_raw.is_empty() {
        size - 1
    } else {
        match end_raw.parse::<u64>() {
            Ok(end) if end >= start => end.min(size - 1),
            _ => return RangeSpec::None,
        }
    };

    RangeSpec::Satisfiable {
        start,
        len: end - start + 1,
    }
}

fn sniff_content_type(head: &[u8]) -> &'static str {
    let trimmed: &[u8] = {
        let mut h = head;
        while let Some((first, rest)) = h.split_first() {
            if first.is_ascii_whitespace() {
                h = rest;
            } else {
                break;
            }
        }
        h
    };

    let lowered = trimmed
        .iter()
        .take(16)
        .map(|b| b.to_ascii_lowercase())
        .collect::<Vec<u8>>();
    if lowered.starts_with(b"<!doctype html") || lowered.starts_with(b"<html") {
        return "text/html; charset=utf-8";
    }
    if head.contains(&0) {
        return "application/octet-stream";
    }
    "text/plain; charset=utf-8"
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── range parsing ───────────────────────────────────────────

    #[test]
    fn range_full_forms() {
        assert_eq!(
            parse_range("bytes=0-4", 10),
            RangeSpec::Satisfiable { start: 0, len: 5 }
        );
        assert_eq!(
            parse_range("bytes=5-", 10),
            RangeSpec::Satisfiable { start: 5, len: 5 }
        );
        assert_eq!(
            parse_range("bytes=-3", 10),
            RangeSpec::Satisfiable { start: 7, len: 3 }
        );
    }

    #[test]
    fn range_end_clamps_to_size() {
        assert_eq!(
            parse_range("bytes=4-999", 10),
            RangeSpec::Satisfiable { start: 4, len: 6 }
        );
    }

    #[test]
    fn range_unsatisfiable_when_start_past_end() {
        assert_eq!(parse_range("bytes=10-12", 10), RangeSpec::Unsatisfiable);
        assert_eq!(parse_range("bytes=-0", 10), RangeSpec::Unsatisfiable);
    }

    #[test]
    fn range_malformed_is_ignored() {
        assert_eq!(parse_range("bytes=a-b", 10), RangeSpec::None);
        assert_eq!(parse_range("items=0-4", 10), RangeSpec::None);
        assert_eq!(parse_range("bytes=0-1,3-4", 10), RangeSpec::None);
        assert_eq!(parse_range("bytes=4-2", 10), RangeSpec::None);
    }

    // ── sniffing ────────────────────────────────────────────────

    #[test]
    fn sniff_html_text_and_binary() {
        assert_eq!(
            sniff_content_type(b"<!DOCTYPE html><html>"),
            "text/html; charset=utf-8"
        );
        assert_eq!(
            sniff_content_type(b"  <html><body>"),
            "text/html; charset=utf-8"
        );
        assert_eq!(
            sniff_content_type(b"plain words"),
            "text/plain; charset=utf-8"
        );
        assert_eq!(
            sniff_content_type(&[0x7f, b'E', b'L', b'F', 0, 0]),
            "application/octet-stream"
        );
    }

    // ── sub path joining ────────────────────────────────────────

    #[test]
    fn join_sub_path_handles_roots() {
        assert_eq!(join_sub_path("", "index.html"), "index.html");
        assert_eq!(join_sub_path("docs", "index.html"), "docs/index.html");
        assert_eq!(join_sub_path("docs/", "index.html"), "docs/index.html");
    }
}
