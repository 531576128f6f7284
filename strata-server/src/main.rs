// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Strata — multi-tenant static-site serving daemon
//
//  Data plane:  tokio + hyper, one task per connection
//  Sources:     disk scanner / internal API with lookup cache
//  Content:     local directories or remote ZIP archives (range reads)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use strata_core::config::{ServerConfig, SourceKind};
use strata_observability::logging::{self, LogFormat};
use strata_observability::Metrics;
use strata_server::acme::AcmeMiddleware;
use strata_server::artifact::Artifact;
use strata_server::auth::Auth;
use strata_server::headers::parse_custom_headers;
use strata_server::listener;
use strata_server::pipeline::{EntryVariant, PagesService};
use strata_server::tls::TlsSettings;
use strata_serving::Reader;
use strata_source::api::ApiSource;
use strata_source::disk::DiskSource;
use strata_source::Source;
use strata_vfs::local::LocalFs;
use strata_vfs::zip::ZipCache;
use strata_vfs::Vfs;
use tracing::{error, info};

const READINESS_POLL: Duration = Duration::from_secs(5);
const METRICS_SYNC: Duration = Duration::from_secs(15);

#[derive(Parser, Debug)]
#[command(name = "strata", version, about = "Multi-tenant static-site serving daemon")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ── Tracing ──
    let format: LogFormat = cli
        .log_format
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    logging::init(format, &cli.log_level)?;

    info!(version = env!("CARGO_PKG_VERSION"), "strata starting");

    // ── Config ──
    let config = ServerConfig::load(cli.config.as_ref())?;

    // ── Shared HTTP client (range reads, API lookups, relays) ──
    let http_client = reqwest::Client::builder()
        .pool_max_idle_per_host(32)
        .build()?;

    // ── Metrics ──
    let metrics = Arc::new(Metrics::new()?);

    // ── VFS: local directories + remote archive cache ──
    let local = LocalFs::new(&config.pages.root)?;
    let zip_cache = ZipCache::new(http_client.clone(), config.zip.clone());
    let vfs = Arc::new(Vfs::new(local, zip_cache));

    // ── Domains source ──
    let mut background = Vec::new();
    let (source, disk_handle, api_handle) = match config.source.kind {
        SourceKind::Disk => {
            let disk = DiskSource::new();
            background.push(disk.watch(
                config.pages.root.clone(),
                config.pages.domain.clone(),
                Duration::from_secs(config.pages.scan_interval_secs),
            ));
            (Source::Disk(Arc::clone(&disk)), Some(disk), None)
        }
        SourceKind::Api => {
            let api = ApiSource::new(http_client.clone(), &config.source.api);
            background.push(api.poll_readiness(READINESS_POLL));
            (Source::Api(Arc::clone(&api)), None, Some(api))
        }
    };

    // ── Pipeline ──
    let auth = config
        .auth
        .as_ref()
        .map(|a| Auth::new(http_client.clone(), a));
    let acme = config
        .auth
        .as_ref()
        .map(|a| AcmeMiddleware::new(http_client.clone(), &a.server));
    let artifact = config
        .artifacts
        .as_ref()
        .map(|a| Artifact::new(http_client.clone(), a, &config.pages.domain));

    let service = Arc::new(PagesService {
        source,
        reader: Reader::new(Arc::clone(&vfs)),
        metrics: Arc::clone(&metrics),
        status_path: config.pages.status_path.clone(),
        redirect_http: config.pages.redirect_http,
        disable_cors: config.pages.disable_cross_origin_requests,
        custom_headers: parse_custom_headers(&config.pages.custom_headers)
            .map_err(|e| anyhow::anyhow!(e.to_string()))?,
        auth,
        artifact,
        acme,
    });

    // ── Listeners: one task per descriptor ──
    let limiter = listener::connection_limiter(config.limits.max_conns);
    let header_timeout = Duration::from_secs(config.limits.header_timeout_secs);

    for addr in &config.listen.http {
        let l = listener::bind(*addr).await?;
        background.push(tokio::spawn(watch_listener(listener::serve_plain(
            l,
            Arc::clone(&service),
            Arc::clone(&limiter),
            EntryVariant::Direct,
            header_timeout,
        ))));
    }

    for addr in &config.listen.proxy {
        let l = listener::bind(*addr).await?;
        background.push(tokio::spawn(watch_listener(listener::serve_plain(
            l,
            Arc::clone(&service),
            Arc::clone(&limiter),
            EntryVariant::Proxy,
            header_timeout,
        ))));
    }

    if !config.listen.https.is_empty() {
        let settings = Arc::new(TlsSettings::from_config(&config.tls)?);
        for addr in &config.listen.https {
            let l = listener::bind(*addr).await?;
            background.push(tokio::spawn(watch_listener(listener::serve_tls(
                l,
                Arc::clone(&service),
                Arc::clone(&limiter),
                Arc::clone(&settings),
                header_timeout,
            ))));
        }
    }

    if let Some(addr) = config.listen.metrics {
        let ready_service = Arc::clone(&service);
        let exporter_metrics = Arc::clone(&metrics);
        background.push(tokio::spawn(async move {
            let ready: strata_observability::exporter::ReadyCheck =
                Arc::new(move || ready_service.source.is_ready());
            if let Err(err) =
                strata_observability::exporter::serve(addr, exporter_metrics, ready).await
            {
                error!(error = %err, "metrics endpoint failed");
            }
        }));
    }

    // ── Gauge sync ──
    background.push(tokio::spawn(sync_metrics(
        Arc::clone(&metrics),
        Arc::clone(&vfs),
        disk_handle,
        api_handle,
    )));

    info!(
        http = config.listen.http.len(),
        https = config.listen.https.len(),
        proxy = config.listen.proxy.len(),
        "strata is ready, serving pages"
    );

    // ── Shutdown on SIGINT / SIGTERM ──
    wait_for_shutdown().await;
    info!("shutdown signal received, stopping");

    for task in background {
        task.abort();
    }

    Ok(())
}

/// Listener tasks run forever; exiting means the socket broke.
async fn watch_listener(serve: impl std::future::Future<Output = anyhow::Result<()>>) {
    if let Err(err) = serve.await {
        error!(error = %err, "listener terminated");
    }
}

/// Bridge internal counters into the prometheus registry.
async fn sync_metrics(
    metrics: Arc<Metrics>,
    vfs: Arc<Vfs>,
    disk: Option<Arc<DiskSource>>,
    api: Option<Arc<ApiSource>>,
) {
    let mut seen_scans = 0u64;
    let mut seen_hits = 0u64;
    let mut seen_misses = 0u64;
    let mut tick = tokio::time::interval(METRICS_SYNC);

    loop {
        tick.tick().await;

        metrics
            .zip_cached_archives
            .set(vfs.zip_cache().len() as i64);

        if let Some(disk) = &disk {
            metrics.served_domains.set(disk.domain_count() as i64);
            let scans = disk.scan_count();
            metrics
                .domains_updated_total
                .inc_by(scans.saturating_sub(seen_scans));
            seen_scans = scans;
        }

        if let Some(api) = &api {
            let cache = api.lookup_cache();
            let hits = cache.hits.load(std::sync::atomic::Ordering::Relaxed);
            let misses = cache.misses.load(std::sync::atomic::Ordering::Relaxed);
            metrics
                .domains_source_cache_hit
                .inc_by(hits.saturating_sub(seen_hits));
            metrics
                .domains_source_cache_miss
                .inc_by(misses.saturating_sub(seen_misses));
            seen_hits = hits;
            seen_misses = misses;
            metrics.served_domains.set(cache.len() as i64);
        }
    }
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                error!(error = %err, "could not install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
