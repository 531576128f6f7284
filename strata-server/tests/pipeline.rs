//! End-to-end pipeline behavior over a scanned disk root, exercising
//! the documented serving scenarios without sockets.

use http::request::Parts;
use http::{header, HeaderMap, Method, Request, StatusCode};
use http_body_util::BodyExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use strata_core::config::ZipConfig;
use strata_observability::Metrics;
use strata_server::pipeline::{EntryVariant, PagesService};
use strata_serving::Reader;
use strata_source::disk::DiskSource;
use strata_source::Source;
use strata_vfs::local::LocalFs;
use strata_vfs::zip::ZipCache;
use strata_vfs::Vfs;

struct Fixture {
    service: Arc<PagesService>,
    _watcher: tokio::task::JoinHandle<()>,
}

async fn fixture(dir: &Path) -> Fixture {
    let disk = DiskSource::new();
    let watcher = disk.watch(
        dir.to_path_buf(),
        "pages.test".to_string(),
        Duration::from_millis(10),
    );
    for _ in 0..200 {
        if disk.is_ready() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(disk.is_ready(), "disk source did not become ready");

    let vfs = Arc::new(Vfs::new(
        LocalFs::new(dir).unwrap(),
        ZipCache::new(reqwest::Client::new(), ZipConfig::default()),
    ));

    let service = Arc::new(PagesService {
        source: Source::Disk(disk),
        reader: Reader::new(vfs),
        metrics: Arc::new(Metrics::new().unwrap()),
        status_path: "/@status".to_string(),
        redirect_http: false,
        disable_cors: false,
        custom_headers: HeaderMap::new(),
        auth: None,
        artifact: None,
        acme: None,
    });

    Fixture {
        service,
        _watcher: watcher,
    }
}

fn write(base: &Path, rel: &str, content: &str) {
    let full = base.join(rel);
    std::fs::create_dir_all(full.parent().unwrap()).unwrap();
    std::fs::write(full, content).unwrap();
}

fn get(uri: &str, host: &str) -> Parts {
    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header(header::HOST, host)
        .body(())
        .unwrap()
        .into_parts()
        .0
}

async fn body_text(resp: http::Response<strata_serving::Body>) -> String {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8_lossy(&bytes).into_owned()
}

// ── scenario: group default ────────────────────────────────────

#[tokio::test]
async fn group_default_site_serves_at_root() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "grp/proj/public/index.html", "hi");
    let f = fixture(dir.path()).await;

    let resp = f
        .service
        .handle(&get("/", "grp.pages.test"), false, EntryVariant::Direct)
        .await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()[header::CONTENT_TYPE],
        "text/html; charset=utf-8"
    );
    assert_eq!(resp.headers()[header::CACHE_CONTROL], "max-age=600");
    assert_eq!(body_text(resp).await, "hi");
}

// ── scenario: project under group ──────────────────────────────

#[tokio::test]
async fn project_path_serves_and_redirects_to_slash() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "grp/proj/public/index.html", "hi");
    write(dir.path(), "grp/other/public/index.html", "o");
    let f = fixture(dir.path()).await;

    let resp = f
        .service
        .handle(&get("/other/", "grp.pages.test"), false, EntryVariant::Direct)
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_text(resp).await, "o");

    let resp = f
        .service
        .handle(&get("/other", "grp.pages.test"), false, EntryVariant::Direct)
        .await;
    assert_eq!(resp.status(), StatusCode::FOUND);
    assert_eq!(resp.headers()[header::LOCATION], "//grp.pages.test/other/");
}

// ── scenario: custom domain, https only ────────────────────────

#[tokio::test]
async fn https_only_custom_domain_upgrades_plaintext() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "grp/proj/public/index.html", "secure");
    write(
        dir.path(),
        "grp/proj/config.json",
        r#"{"Domains":[{"Domain":"x.example","HTTPSOnly":true,"Certificate":"--cert--","Key":"--key--"}]}"#,
    );
    let f = fixture(dir.path()).await;

    let resp = f
        .service
        .handle(&get("/", "x.example"), false, EntryVariant::Direct)
        .await;
    assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(resp.headers()[header::LOCATION], "https://x.example/");

    // over TLS the site serves
    let resp = f
        .service
        .handle(&get("/", "x.example"), true, EntryVariant::Direct)
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_text(resp).await, "secure");
}

// ── scenario: traversal ────────────────────────────────────────

#[tokio::test]
async fn traversal_attempts_get_404() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "grp/proj/public/index.html", "x");
    write(dir.path(), "etc/passwd", "root:x");
    let f = fixture(dir.path()).await;

    let resp = f
        .service
        .handle(
            &get("/../../etc/passwd", "grp.pages.test"),
            false,
            EntryVariant::Direct,
        )
        .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

// ── scenario: redirects rule ───────────────────────────────────

#[tokio::test]
async fn redirects_rule_applies() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "grp/proj/public/index.html", "x");
    write(dir.path(), "grp/proj/public/_redirects", "/old /new 302\n");
    let f = fixture(dir.path()).await;

    let resp = f
        .service
        .handle(&get("/old", "grp.pages.test"), false, EntryVariant::Direct)
        .await;
    assert_eq!(resp.status(), StatusCode::FOUND);
    assert_eq!(resp.headers()[header::LOCATION], "/new");
}

// ── lowercase invariance ───────────────────────────────────────

#[tokio::test]
async fn hostname_lookup_is_case_insensitive() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "grp/proj/public/index.html", "hi");
    let f = fixture(dir.path()).await;

    for host in ["grp.pages.test", "GRP.PAGES.TEST", "Grp.Pages.Test:8090"] {
        let resp = f
            .service
            .handle(&get("/", host), false, EntryVariant::Direct)
            .await;
        assert_eq!(resp.status(), StatusCode::OK, "host {host}");
    }
}

// ── method filter ──────────────────────────────────────────────

#[tokio::test]
async fn unknown_methods_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "grp/proj/public/index.html", "x");
    let f = fixture(dir.path()).await;

    let parts = Request::builder()
        .method(Method::from_bytes(b"PROPFIND").unwrap())
        .uri("/")
        .header(header::HOST, "grp.pages.test")
        .body(())
        .unwrap()
        .into_parts()
        .0;

    let resp = f.service.handle(&parts, false, EntryVariant::Direct).await;
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
}

// ── unknown domains and readiness ──────────────────────────────

#[tokio::test]
async fn unknown_domain_is_404_without_auth() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "grp/proj/public/index.html", "x");
    let f = fixture(dir.path()).await;

    let resp = f
        .service
        .handle(&get("/", "nobody.example"), false, EntryVariant::Direct)
        .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn not_ready_source_returns_503() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "grp/proj/public/index.html", "x");

    // no watcher started: the source never becomes ready
    let disk = DiskSource::new();
    let vfs = Arc::new(Vfs::new(
        LocalFs::new(dir.path()).unwrap(),
        ZipCache::new(reqwest::Client::new(), ZipConfig::default()),
    ));
    let service = PagesService {
        source: Source::Disk(disk),
        reader: Reader::new(vfs),
        metrics: Arc::new(Metrics::new().unwrap()),
        status_path: "/@status".to_string(),
        redirect_http: false,
        disable_cors: false,
        custom_headers: HeaderMap::new(),
        auth: None,
        artifact: None,
        acme: None,
    };

    let resp = service
        .handle(&get("/", "grp.pages.test"), false, EntryVariant::Direct)
        .await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    let resp = service
        .handle(&get("/@status", "grp.pages.test"), false, EntryVariant::Direct)
        .await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_text(resp).await, "not yet ready");
}

#[tokio::test]
async fn status_endpoint_reports_success_when_ready() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "grp/proj/public/index.html", "x");
    let f = fixture(dir.path()).await;

    let resp = f
        .service
        .handle(&get("/@status", "anything.example"), false, EntryVariant::Direct)
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_text(resp).await, "success");
}

// ── proxy variant ──────────────────────────────────────────────

#[tokio::test]
async fn proxy_variant_uses_forwarded_host() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "grp/proj/public/index.html", "hi");
    let f = fixture(dir.path()).await;

    let parts = Request::builder()
        .method(Method::GET)
        .uri("/")
        .header(header::HOST, "edge.lb.internal")
        .header("x-forwarded-host", "grp.pages.test")
        .header("x-forwarded-proto", "https")
        .body(())
        .unwrap()
        .into_parts()
        .0;

    let resp = f.service.handle(&parts, false, EntryVariant::Proxy).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_text(resp).await, "hi");
}

// ── cors ───────────────────────────────────────────────────────

#[tokio::test]
async fn cors_header_added_for_get_with_origin() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "grp/proj/public/index.html", "hi");
    let f = fixture(dir.path()).await;

    let parts = Request::builder()
        .method(Method::GET)
        .uri("/")
        .header(header::HOST, "grp.pages.test")
        .header(header::ORIGIN, "https://elsewhere.example")
        .body(())
        .unwrap()
        .into_parts()
        .0;

    let resp = f.service.handle(&parts, false, EntryVariant::Direct).await;
    assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
}

// ── custom headers ─────────────────────────────────────────────

#[tokio::test]
async fn custom_headers_are_injected() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "grp/proj/public/index.html", "hi");
    let mut f = fixture(dir.path()).await;

    let service = Arc::get_mut(&mut f.service).unwrap();
    service.custom_headers =
        strata_server::headers::parse_custom_headers(&["X-Frame-Options: DENY".to_string()])
            .unwrap();

    let resp = f
        .service
        .handle(&get("/", "grp.pages.test"), false, EntryVariant::Direct)
        .await;
    assert_eq!(resp.headers()["x-frame-options"], "DENY");
}
