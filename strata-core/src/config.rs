use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for the Strata daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listener configuration
    #[serde(default)]
    pub listen: ListenConfig,

    /// Pages content configuration
    #[serde(default)]
    pub pages: PagesConfig,

    /// Domains source configuration
    #[serde(default)]
    pub source: SourceConfig,

    /// Remote archive serving configuration
    #[serde(default)]
    pub zip: ZipConfig,

    /// TLS configuration
    #[serde(default)]
    pub tls: TlsConfig,

    /// Admission control and transport limits
    #[serde(default)]
    pub limits: LimitsConfig,

    /// OAuth2 authentication (absent = auth disabled)
    #[serde(default)]
    pub auth: Option<AuthConfig>,

    /// Artifact proxying (absent = disabled)
    #[serde(default)]
    pub artifacts: Option<ArtifactsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Plain HTTP listener addresses
    #[serde(default = "default_http_addrs")]
    pub http: Vec<SocketAddr>,

    /// HTTPS listener addresses
    #[serde(default)]
    pub https: Vec<SocketAddr>,

    /// Listener addresses behind a trusted L7 proxy
    /// (X-Forwarded-Proto / X-Forwarded-Host are honored)
    #[serde(default)]
    pub proxy: Vec<SocketAddr>,

    /// Metrics / readiness endpoint address
    #[serde(default)]
    pub metrics: Option<SocketAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagesConfig {
    /// Root of the on-disk pages layout: `<root>/<group>/<project>/public`
    #[serde(default = "default_pages_root")]
    pub root: PathBuf,

    /// Base domain for group sites: `<group>.<domain>`
    #[serde(default = "default_pages_domain")]
    pub domain: String,

    /// Redirect plain-HTTP requests to HTTPS
    #[serde(default)]
    pub redirect_http: bool,

    /// Health/status endpoint path
    #[serde(default = "default_status_path")]
    pub status_path: String,

    /// Extra response headers, `name: value` each
    #[serde(default)]
    pub custom_headers: Vec<String>,

    /// Disable the GET-only CORS handling on served content
    #[serde(default)]
    pub disable_cross_origin_requests: bool,

    /// Sentinel poll interval for the disk source watcher (seconds)
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Which source resolves hostnames
    #[serde(default)]
    pub kind: SourceKind,

    /// Remote API settings (required when kind = api)
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Filesystem scanner over the pages root
    Disk,
    /// Remote internal API with a refreshing lookup cache
    Api,
}

impl Default for SourceKind {
    fn default() -> Self {
        Self::Disk
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the internal API
    #[serde(default)]
    pub endpoint: String,

    /// Shared secret presented as a bearer token
    #[serde(default)]
    pub secret: String,

    /// Cached lookup lifetime before a background refresh (seconds)
    #[serde(default = "default_cache_refresh")]
    pub cache_refresh_secs: u64,

    /// Cached lookup lifetime before eviction (seconds)
    #[serde(default = "default_cache_expiration")]
    pub cache_expiration_secs: u64,

    /// Upper bound on a blocking retrieval (seconds)
    #[serde(default = "default_retrieval_timeout")]
    pub retrieval_timeout_secs: u64,

    /// Retry attempts for one retrieval
    #[serde(default = "default_retrieval_retries")]
    pub max_retrieval_retries: u32,

    /// Cap on the backoff between retries (milliseconds)
    #[serde(default = "default_retrieval_interval")]
    pub max_retrieval_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZipConfig {
    /// Base URL joined onto relative archive locations from the API
    /// (object-storage bucket). Absolute URLs pass through untouched.
    #[serde(default)]
    pub bucket_url: Option<String>,

    /// Bound on a single archive open
    #[serde(default = "default_open_timeout")]
    pub open_timeout_secs: u64,

    /// Age after which an accessed archive is re-probed
    #[serde(default = "default_zip_refresh")]
    pub refresh_interval_secs: u64,

    /// Idle time after which an archive entry is evicted
    #[serde(default = "default_zip_expiration")]
    pub expiration_interval_secs: u64,

    /// Sweeper period
    #[serde(default = "default_zip_cleanup")]
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Fallback certificate served when SNI resolves no domain
    #[serde(default)]
    pub root_certificate: Option<PathBuf>,

    /// Key for the fallback certificate
    #[serde(default)]
    pub root_key: Option<PathBuf>,

    /// Minimum TLS protocol version: "1.2" or "1.3"
    #[serde(default = "default_tls_min")]
    pub min_version: String,

    /// Maximum TLS protocol version: "1.2" or "1.3"
    #[serde(default = "default_tls_max")]
    pub max_version: String,

    /// Allow the legacy cipher list
    #[serde(default)]
    pub insecure_ciphers: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Shared connection budget across all listeners (0 = unlimited)
    #[serde(default = "default_max_conns")]
    pub max_conns: usize,

    /// Per-connection header read timeout (seconds)
    #[serde(default = "default_header_timeout")]
    pub header_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// OAuth2 client id
    pub client_id: String,

    /// OAuth2 client secret
    pub client_secret: String,

    /// Registered redirect URI (the `/auth/callback` of the pages domain)
    pub redirect_uri: String,

    /// Identity server base URL (authorize, token, access checks, ACME fallback)
    pub server: String,

    /// Secret sealing the state and session cookies
    pub cookie_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactsConfig {
    /// Artifacts server base URL
    pub server: String,

    /// Proxy timeout (seconds)
    #[serde(default = "default_artifacts_timeout")]
    pub timeout_secs: u64,
}

impl ServerConfig {
    /// Load configuration from a YAML file plus environment variables.
    /// Environment overrides use the `STRATA_` prefix with `__` nesting:
    /// `STRATA_PAGES__DOMAIN`, `STRATA_SOURCE__API__ENDPOINT`, …
    pub fn load(config_path: Option<&PathBuf>) -> anyhow::Result<Self> {
        let mut figment = Figment::new();

        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        }

        figment = figment.merge(Env::prefixed("STRATA_").split("__"));

        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.source.kind == SourceKind::Api {
            if self.source.api.endpoint.is_empty() {
                anyhow::bail!("source.api.endpoint is required when source.kind = api");
            }
            if self.source.api.secret.is_empty() {
                anyhow::bail!("source.api.secret is required when source.kind = api");
            }
        }
        Ok(())
    }
}

impl ZipConfig {
    /// Resolve an archive location against the bucket URL. Absolute
    /// URLs are used as-is.
    pub fn resolve_location(&self, location: &str) -> String {
        if location.contains("://") {
            return location.to_string();
        }
        match &self.bucket_url {
            Some(bucket) => format!(
                "{}/{}",
                bucket.trim_end_matches('/'),
                location.trim_start_matches('/')
            ),
            None => location.to_string(),
        }
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
    pub fn expiration_interval(&self) -> Duration {
        Duration::from_secs(self.expiration_interval_secs)
    }
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl ApiConfig {
    pub fn cache_refresh(&self) -> Duration {
        Duration::from_secs(self.cache_refresh_secs)
    }
    pub fn cache_expiration(&self) -> Duration {
        Duration::from_secs(self.cache_expiration_secs)
    }
    pub fn retrieval_timeout(&self) -> Duration {
        Duration::from_secs(self.retrieval_timeout_secs)
    }
    pub fn max_retrieval_interval(&self) -> Duration {
        Duration::from_millis(self.max_retrieval_interval_ms)
    }
}

// Default implementations

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            http: default_http_addrs(),
            https: vec![],
            proxy: vec![],
            metrics: None,
        }
    }
}

impl Default for PagesConfig {
    fn default() -> Self {
        Self {
            root: default_pages_root(),
            domain: default_pages_domain(),
            redirect_http: false,
            status_path: default_status_path(),
            custom_headers: vec![],
            disable_cross_origin_requests: false,
            scan_interval_secs: default_scan_interval(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Disk,
            api: ApiConfig::default(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            secret: String::new(),
            cache_refresh_secs: default_cache_refresh(),
            cache_expiration_secs: default_cache_expiration(),
            retrieval_timeout_secs: default_retrieval_timeout(),
            max_retrieval_retries: default_retrieval_retries(),
            max_retrieval_interval_ms: default_retrieval_interval(),
        }
    }
}

impl Default for ZipConfig {
    fn default() -> Self {
        Self {
            bucket_url: None,
            open_timeout_secs: default_open_timeout(),
            refresh_interval_secs: default_zip_refresh(),
            expiration_interval_secs: default_zip_expiration(),
            cleanup_interval_secs: default_zip_cleanup(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            root_certificate: None,
            root_key: None,
            min_version: default_tls_min(),
            max_version: default_tls_max(),
            insecure_ciphers: false,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_conns: default_max_conns(),
            header_timeout_secs: default_header_timeout(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: ListenConfig::default(),
            pages: PagesConfig::default(),
            source: SourceConfig::default(),
            zip: ZipConfig::default(),
            tls: TlsConfig::default(),
            limits: LimitsConfig::default(),
            auth: None,
            artifacts: None,
        }
    }
}

// Serde default functions

fn default_http_addrs() -> Vec<SocketAddr> {
    vec!["0.0.0.0:8090".parse().expect("static address")]
}

fn default_pages_root() -> PathBuf {
    PathBuf::from("shared/pages")
}

fn default_pages_domain() -> String {
    "pages.example.io".to_string()
}

fn default_status_path() -> String {
    "/@status".to_string()
}

fn default_scan_interval() -> u64 {
    1
}

fn default_cache_refresh() -> u64 {
    60
}

fn default_cache_expiration() -> u64 {
    600
}

fn default_retrieval_timeout() -> u64 {
    30
}

fn default_retrieval_retries() -> u32 {
    3
}

fn default_retrieval_interval() -> u64 {
    1000
}

fn default_open_timeout() -> u64 {
    30
}

fn default_zip_refresh() -> u64 {
    60
}

fn default_zip_expiration() -> u64 {
    120
}

fn default_zip_cleanup() -> u64 {
    60
}

fn default_tls_min() -> String {
    "1.2".to_string()
}

fn default_tls_max() -> String {
    "1.3".to_string()
}

fn default_max_conns() -> usize {
    5000
}

fn default_header_timeout() -> u64 {
    10
}

fn default_artifacts_timeout() -> u64 {
    10
}
