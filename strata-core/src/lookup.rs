use serde::Deserialize;

/// How a site's content is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServingType {
    /// A directory under the pages root.
    File,
    /// A remote ZIP archive read over HTTP range requests.
    Zip,
}

impl ServingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServingType::File => "file",
            ServingType::Zip => "zip",
        }
    }
}

/// A resolved site descriptor.
///
/// `root` is a filesystem path relative to the pages root for
/// `ServingType::File`, or an archive URL for `ServingType::Zip`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupPath {
    pub serving: ServingType,
    pub root: String,
    /// URL prefix that matched this site: `"/"` or `"/<project>"`.
    pub prefix: String,
    pub is_namespace_project: bool,
    pub is_https_only: bool,
    pub has_access_control: bool,
    pub project_id: u64,
}

/// The resolver's output: a site plus the residual path inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServingRequest {
    pub lookup_path: LookupPath,
    /// URL path minus the matched prefix, no leading slash.
    pub sub_path: String,
}

// ── Internal API response shapes ──────────────────────────────

/// Response of `GET /api/v4/internal/pages?host=<h>`.
#[derive(Debug, Clone, Deserialize)]
pub struct VirtualDomain {
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub lookup_paths: Vec<ApiLookupPath>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiLookupPath {
    pub project_id: u64,
    #[serde(default)]
    pub access_control: bool,
    #[serde(default)]
    pub https_only: bool,
    pub prefix: String,
    pub source: ApiSourceLocation,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiSourceLocation {
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
}
