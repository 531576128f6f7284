//! Behavior of the API source and its lookup cache against a real
//! in-process API server with scriptable responses.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strata_core::config::ApiConfig;
use strata_core::domain::Resolver;
use strata_core::Error;
use strata_source::api::ApiSource;
use strata_source::Source;

// ── Scriptable API fixture ─────────────────────────────────────

#[derive(Clone, Copy, Debug)]
enum Reply {
    Found,
    NoContent,
    ServerError,
    Unauthorized,
}

#[derive(Clone)]
struct ApiFixture {
    replies: Arc<Mutex<HashMap<String, Reply>>>,
    lookups: Arc<AtomicU64>,
}

impl ApiFixture {
    fn new() -> Self {
        Self {
            replies: Arc::new(Mutex::new(HashMap::new())),
            lookups: Arc::new(AtomicU64::new(0)),
        }
    }

    fn set(&self, host: &str, reply: Reply) {
        self.replies.lock().unwrap().insert(host.to_string(), reply);
    }

    fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::SeqCst)
    }

    async fn start(&self) -> String {
        let app = Router::new()
            .route("/api/v4/internal/pages", get(lookup_handler))
            .route(
                "/api/v4/internal/pages/status",
                get(|| async { StatusCode::NO_CONTENT }),
            )
            .with_state(self.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }
}

async fn lookup_handler(
    State(fixture): State<ApiFixture>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    fixture.lookups.fetch_add(1, Ordering::SeqCst);
    let host = params.get("host").cloned().unwrap_or_default();

    let reply = fixture
        .replies
        .lock()
        .unwrap()
        .get(&host)
        .copied()
        .unwrap_or(Reply::NoContent);

    match reply {
        Reply::Found => axum::Json(serde_json::json!({
            "certificate": null,
            "key": null,
            "lookup_paths": [{
                "project_id": 11,
                "access_control": false,
                "https_only": false,
                "prefix": "/",
                "source": { "type": "file", "path": "grp/proj/public" }
            }]
        }))
        .into_response(),
        Reply::NoContent => StatusCode::NO_CONTENT.into_response(),
        Reply::ServerError => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        Reply::Unauthorized => StatusCode::UNAUTHORIZED.into_response(),
    }
}

fn api_config(endpoint: &str, refresh_secs: u64, expiration_secs: u64) -> ApiConfig {
    ApiConfig {
        endpoint: endpoint.to_string(),
        secret: "shared-secret".to_string(),
        cache_refresh_secs: refresh_secs,
        cache_expiration_secs: expiration_secs,
        retrieval_timeout_secs: 5,
        max_retrieval_retries: 1,
        max_retrieval_interval_ms: 50,
    }
}

// ── Tests ──────────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_misses_issue_one_upstream_request() {
    let fixture = ApiFixture::new();
    fixture.set("site.example", Reply::Found);
    let endpoint = fixture.start().await;

    let source = ApiSource::new(reqwest::Client::new(), &api_config(&endpoint, 60, 600));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let source = Arc::clone(&source);
        handles.push(tokio::spawn(
            async move { source.get_domain("site.example").await },
        ));
    }
    for handle in handles {
        let domain = handle.await.unwrap().unwrap().expect("domain exists");
        assert!(matches!(domain.resolver, Resolver::Api(_)));
    }

    assert_eq!(fixture.lookups(), 1, "retrieval must be single-flight");
}

#[tokio::test]
async fn fresh_entries_answer_without_network() {
    let fixture = ApiFixture::new();
    fixture.set("site.example", Reply::Found);
    let endpoint = fixture.start().await;

    let source = ApiSource::new(reqwest::Client::new(), &api_config(&endpoint, 60, 600));

    source.get_domain("site.example").await.unwrap();
    let after_warmup = fixture.lookups();

    for _ in 0..10 {
        let domain = source.get_domain("site.example").await.unwrap();
        assert!(domain.is_some());
    }
    assert_eq!(fixture.lookups(), after_warmup, "fresh hits must not call upstream");
}

#[tokio::test]
async fn missing_domain_is_none_and_cached() {
    let fixture = ApiFixture::new();
    fixture.set("ghost.example", Reply::NoContent);
    let endpoint = fixture.start().await;

    let source = ApiSource::new(reqwest::Client::new(), &api_config(&endpoint, 60, 600));

    assert!(source.get_domain("ghost.example").await.unwrap().is_none());
    let after = fixture.lookups();
    assert!(source.get_domain("ghost.example").await.unwrap().is_none());
    assert_eq!(fixture.lookups(), after, "negative lookups are cached too");
}

#[tokio::test]
async fn stale_entry_refreshes_in_background() {
    let fixture = ApiFixture::new();
    fixture.set("site.example", Reply::Found);
    let endpoint = fixture.start().await;

    // refresh after 0s: every later access is stale
    let source = ApiSource::new(reqwest::Client::new(), &api_config(&endpoint, 0, 600));

    source.get_domain("site.example").await.unwrap();
    let after_warmup = fixture.lookups();

    // stale access: answered from cache, refresh goes to the upstream
    let domain = source.get_domain("site.example").await.unwrap();
    assert!(domain.is_some(), "stale access still serves the old value");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        fixture.lookups() > after_warmup,
        "a background refresh must have hit the upstream"
    );
}

#[tokio::test]
async fn transient_refresh_error_preserves_known_site() {
    let fixture = ApiFixture::new();
    fixture.set("site.example", Reply::Found);
    let endpoint = fixture.start().await;

    let source = ApiSource::new(reqwest::Client::new(), &api_config(&endpoint, 0, 600));

    source.get_domain("site.example").await.unwrap();

    // upstream starts failing transiently
    fixture.set("site.example", Reply::ServerError);

    for _ in 0..5 {
        let domain = source.get_domain("site.example").await.unwrap();
        assert!(
            domain.is_some(),
            "a transient refresh error must not demote a known site"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn permanent_refresh_outcome_replaces_entry() {
    let fixture = ApiFixture::new();
    fixture.set("site.example", Reply::Found);
    let endpoint = fixture.start().await;

    let source = ApiSource::new(reqwest::Client::new(), &api_config(&endpoint, 0, 600));

    source.get_domain("site.example").await.unwrap();

    // the domain is deleted upstream: 204 is permanent
    fixture.set("site.example", Reply::NoContent);

    let mut gone = false;
    for _ in 0..50 {
        if source.get_domain("site.example").await.unwrap().is_none() {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(gone, "a deleted domain must stop resolving after refresh");
}

#[tokio::test]
async fn unauthorized_flips_readiness() {
    let fixture = ApiFixture::new();
    fixture.set("site.example", Reply::Found);
    let endpoint = fixture.start().await;

    let source = ApiSource::new(reqwest::Client::new(), &api_config(&endpoint, 60, 600));

    source.get_domain("site.example").await.unwrap();
    assert!(source.is_ready());

    fixture.set("locked.example", Reply::Unauthorized);
    let err = source.get_domain("locked.example").await.unwrap_err();
    assert_eq!(err, Error::Unauthorized);
    assert!(!source.is_ready(), "401 must mark the source not ready");

    // a successful call re-arms readiness
    source.get_domain("site.example").await.unwrap();
    assert!(source.is_ready());
}

#[tokio::test]
async fn source_front_normalizes_hostnames() {
    let fixture = ApiFixture::new();
    fixture.set("site.example", Reply::Found);
    let endpoint = fixture.start().await;

    let api = ApiSource::new(reqwest::Client::new(), &api_config(&endpoint, 60, 600));
    let source = Source::Api(api);

    let a = source.get_domain("SITE.example").await.unwrap();
    let b = source.get_domain("site.example:8080").await.unwrap();
    assert!(a.is_some());
    assert!(b.is_some());
    assert_eq!(fixture.lookups(), 1, "all spellings share one cache entry");
}
