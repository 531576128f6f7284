use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Metrics registry for the daemon.
///
/// Initialized once at startup and shared; the exporter renders the
/// text exposition on scrape.
pub struct Metrics {
    registry: Registry,

    /// Sites currently served (size of the domain map)
    pub served_domains: IntGauge,

    /// Successful domain map updates since start
    pub domains_updated_total: IntCounter,

    /// Failed domain map updates since start
    pub domains_failed_total: IntCounter,

    /// Lookup cache hits / misses against the domains source
    pub domains_source_cache_hit: IntCounter,
    pub domains_source_cache_miss: IntCounter,

    /// Served requests by status class
    pub requests_total: IntCounterVec,

    /// Requests rejected by the method filter
    pub rejected_requests_total: IntCounter,

    /// Size of files served
    pub serving_file_size: Histogram,

    /// Open archives currently cached
    pub zip_cached_archives: IntGauge,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let served_domains = IntGauge::new(
            "strata_pages_served_domains",
            "The number of sites served by this daemon",
        )?;

        let domains_updated_total = IntCounter::new(
            "strata_pages_domains_updated_total",
            "The total number of site updates successfully processed since daemon start",
        )?;

        let domains_failed_total = IntCounter::new(
            "strata_pages_domains_failed_total",
            "The total number of site updates that have failed since daemon start",
        )?;

        let domains_source_cache_hit = IntCounter::new(
            "strata_pages_domains_source_cache_hit",
            "The number of domain lookup cache hits",
        )?;

        let domains_source_cache_miss = IntCounter::new(
            "strata_pages_domains_source_cache_miss",
            "The number of domain lookup cache misses",
        )?;

        let requests_total = IntCounterVec::new(
            Opts::new("strata_pages_requests_total", "Requests served by status"),
            &["status"],
        )?;

        let rejected_requests_total = IntCounter::new(
            "strata_pages_rejected_requests_total",
            "Requests rejected by the method filter",
        )?;

        let serving_file_size = Histogram::with_opts(
            HistogramOpts::new(
                "strata_pages_serving_file_size_bytes",
                "Size of files served",
            )
            .buckets(vec![
                1024.0,
                16.0 * 1024.0,
                128.0 * 1024.0,
                1024.0 * 1024.0,
                16.0 * 1024.0 * 1024.0,
            ]),
        )?;

        let zip_cached_archives = IntGauge::new(
            "strata_pages_zip_cached_archives",
            "Open archives currently held by the archive cache",
        )?;

        registry.register(Box::new(served_domains.clone()))?;
        registry.register(Box::new(domains_updated_total.clone()))?;
        registry.register(Box::new(domains_failed_total.clone()))?;
        registry.register(Box::new(domains_source_cache_hit.clone()))?;
        registry.register(Box::new(domains_source_cache_miss.clone()))?;
        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(rejected_requests_total.clone()))?;
        registry.register(Box::new(serving_file_size.clone()))?;
        registry.register(Box::new(zip_cached_archives.clone()))?;

        Ok(Self {
            registry,
            served_domains,
            domains_updated_total,
            domains_failed_total,
            domains_source_cache_hit,
            domains_source_cache_miss,
            requests_total,
            rejected_requests_total,
            serving_file_size,
            zip_cached_archives,
        })
    }

    pub fn record_request(&self, status: u16) {
        self.requests_total
            .with_label_values(&[&status.to_string()])
            .inc();
    }

    /// Prometheus text exposition.
    pub fn gather_text(&self) -> String {
        let encoder = TextEncoder::new();
        let metrics = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metrics, &mut buffer).unwrap_or_default();
        String::from_utf8(buffer).unwrap_or_default()
    }
}
