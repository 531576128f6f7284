use crate::error::{Error, Result};
use crate::lookup::{ApiLookupPath, LookupPath, ServingRequest, ServingType, VirtualDomain};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// Maximum subgroup nesting considered when descending a group tree.
pub const SUBGROUP_SCAN_LIMIT: usize = 21;

/// Maximum URL segments inspected during project resolution: the
/// subgroup limit plus one for the project, one for the empty leading
/// segment, and one for the real file path.
pub const MAX_PROJECT_DEPTH: usize = SUBGROUP_SCAN_LIMIT + 3;

/// A hostname the daemon can serve, together with the resolver that
/// maps request paths to a site.
#[derive(Debug)]
pub struct Domain {
    /// Lowercase hostname.
    pub name: String,
    pub group: String,
    /// Empty for a group-default domain.
    pub project: String,
    /// PEM pair for custom domains and API-provided domains.
    pub certificate: Option<String>,
    pub key: Option<String>,
    pub resolver: Resolver,

    // Parsed at most once per domain lifetime, error outcome included.
    tls_pair: OnceLock<std::result::Result<Arc<CertifiedKey>, String>>,
}

/// Per-domain resolution strategy. One fixed site for custom domains,
/// URL-path project lookup for group domains, prefix matching over the
/// API response for API-sourced domains.
#[derive(Debug, Clone)]
pub enum Resolver {
    Group(Arc<Group>),
    Custom(CustomProject),
    Api(Arc<VirtualDomain>),
}

/// A scanned group tree: projects and nested subgroups, keys lowercased.
#[derive(Debug, Default)]
pub struct Group {
    /// On-disk directory name of the group.
    pub name: String,
    pub projects: HashMap<String, Project>,
    pub subgroups: HashMap<String, Group>,
}

#[derive(Debug, Clone)]
pub struct Project {
    /// On-disk directory name of the project.
    pub dir: String,
    pub https_only: bool,
    pub access_control: bool,
    pub id: u64,
}

#[derive(Debug, Clone)]
pub struct CustomProject {
    /// Site root relative to the pages root: `<group>/<project>/public`.
    pub path: String,
    pub https_only: bool,
    pub access_control: bool,
    pub id: u64,
}

impl Domain {
    pub fn new(name: String, group: String, project: String, resolver: Resolver) -> Self {
        Self {
            name: name.to_ascii_lowercase(),
            group,
            project,
            certificate: None,
            key: None,
            resolver,
            tls_pair: OnceLock::new(),
        }
    }

    pub fn with_certificate(mut self, certificate: Option<String>, key: Option<String>) -> Self {
        self.certificate = certificate;
        self.key = key;
        self
    }

    /// Resolve a request path against this domain.
    pub fn resolve(&self, url_path: &str, host: &str) -> Result<ServingRequest> {
        match &self.resolver {
            Resolver::Group(group) => group.resolve(url_path, host),
            Resolver::Custom(custom) => Ok(custom.resolve(url_path)),
            Resolver::Api(virtual_domain) => resolve_api(virtual_domain, url_path),
        }
    }

    /// Parse the PEM certificate/key pair. Memoized across the domain's
    /// lifetime, including the error outcome.
    pub fn certified_key(&self) -> Result<Arc<CertifiedKey>> {
        let (Some(cert), Some(key)) = (&self.certificate, &self.key) else {
            return Err(Error::TlsKeyPair(format!(
                "{}: no certificate configured",
                self.name
            )));
        };

        let outcome = self
            .tls_pair
            .get_or_init(|| parse_key_pair(cert, key).map_err(|e| e.to_string()));

        outcome
            .clone()
            .map_err(|msg| Error::TlsKeyPair(format!("{}: {msg}", self.name)))
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.group.is_empty() && !self.project.is_empty() {
            write!(f, "{}/{}", self.group, self.project)
        } else if !self.group.is_empty() {
            write!(f, "{}", self.group)
        } else {
            write!(f, "{}", self.name)
        }
    }
}

fn parse_key_pair(cert_pem: &str, key_pem: &str) -> anyhow::Result<Arc<CertifiedKey>> {
    let certs = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        anyhow::bail!("no certificates in PEM");
    }

    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())?
        .ok_or_else(|| anyhow::anyhow!("no private key in PEM"))?;
    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key)
        .map_err(|e| anyhow::anyhow!("unsupported key type: {e}"))?;

    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

impl Group {
    /// Look up a project for a request to a group domain.
    ///
    /// Projects named in the URL shadow the group-default site:
    /// `http://group.pages.test/projectA/...` descends the subgroup
    /// tree. When the URL names no project, the group default is the
    /// project named after the host, or the group's sole project.
    pub fn resolve(&self, url_path: &str, host: &str) -> Result<ServingRequest> {
        let mut split = url_path.splitn(MAX_PROJECT_DEPTH, '/');
        // URL paths start with '/', drop the empty head segment.
        let _ = split.next();
        let segments: Vec<&str> = split.collect();

        if !segments.is_empty() {
            if let Some((project, project_path, sub_path)) = self.dig("", &segments) {
                return Ok(self.serving_request(project, &project_path, &sub_path, false));
            }
        }

        if let Some(project) = self.default_project(host) {
            let sub_path = segments.join("/");
            let project_path = project.dir.clone();
            return Ok(self.serving_request(project, &project_path, &sub_path, true));
        }

        Err(Error::DomainNotFound)
    }

    /// Descend the subgroup tree segment by segment; the first matching
    /// project wins and the remainder becomes the sub path.
    fn dig(&self, parent: &str, segments: &[&str]) -> Option<(&Project, String, String)> {
        let (head, tail) = segments.split_first()?;
        let search = head.to_ascii_lowercase();

        if let Some(project) = self.projects.get(&search) {
            let current = join_path(parent, &project.dir);
            return Some((project, current, tail.join("/")));
        }

        if let Some(subgroup) = self.subgroups.get(&search) {
            let current = join_path(parent, &subgroup.name);
            return subgroup.dig(&current, tail);
        }

        None
    }

    /// The group-default site: the project named after the host
    /// (`group.pages.test` directory), else the sole project.
    fn default_project(&self, host: &str) -> Option<&Project> {
        if let Some(project) = self.projects.get(&host.to_ascii_lowercase()) {
            return Some(project);
        }
        if self.projects.len() == 1 && self.subgroups.is_empty() {
            return self.projects.values().next();
        }
        None
    }

    fn serving_request(
        &self,
        project: &Project,
        project_path: &str,
        sub_path: &str,
        is_default: bool,
    ) -> ServingRequest {
        let prefix = if is_default {
            "/".to_string()
        } else {
            format!("/{project_path}")
        };

        ServingRequest {
            lookup_path: LookupPath {
                serving: ServingType::File,
                root: format!("{}/{}/public", self.name, project_path),
                prefix,
                is_namespace_project: is_default,
                is_https_only: project.https_only,
                has_access_control: project.access_control,
                project_id: project.id,
            },
            sub_path: sub_path.to_string(),
        }
    }
}

fn join_path(parent: &str, child: &str) -> String {
    if parent.is_empty() {
        child.to_string()
    } else {
        format!("{parent}/{child}")
    }
}

impl CustomProject {
    fn resolve(&self, url_path: &str) -> ServingRequest {
        ServingRequest {
            lookup_path: LookupPath {
                serving: ServingType::File,
                root: self.path.clone(),
                prefix: "/".to_string(),
                is_namespace_project: false,
                is_https_only: self.https_only,
                has_access_control: self.access_control,
                project_id: self.id,
            },
            sub_path: url_path.trim_start_matches('/').to_string(),
        }
    }
}

fn resolve_api(virtual_domain: &VirtualDomain, url_path: &str) -> Result<ServingRequest> {
    let clean = clean_path(url_path);
    let size = virtual_domain.lookup_paths.len();

    for lookup in &virtual_domain.lookup_paths {
        let is_sub_path = clean.starts_with(&lookup.prefix);
        // `/project` and `/project/` address the same site root.
        let is_root_path =
            clean.trim_end_matches('/') == lookup.prefix.trim_end_matches('/');

        if is_sub_path || is_root_path {
            let sub_path = if is_sub_path {
                clean
                    .strip_prefix(&lookup.prefix)
                    .unwrap_or_default()
                    .to_string()
            } else {
                String::new()
            };

            return Ok(ServingRequest {
                lookup_path: fabricate_lookup_path(size, lookup),
                sub_path,
            });
        }
    }

    Err(Error::DomainNotFound)
}

fn fabricate_lookup_path(size: usize, lookup: &ApiLookupPath) -> LookupPath {
    let serving = match lookup.source.kind.as_str() {
        "zip" => ServingType::Zip,
        // Unknown source types fall back to local file serving.
        _ => ServingType::File,
    };

    LookupPath {
        serving,
        root: lookup.source.path.clone(),
        prefix: lookup.prefix.clone(),
        is_namespace_project: lookup.prefix == "/" && size > 1,
        is_https_only: lookup.https_only,
        has_access_control: lookup.access_control,
        project_id: lookup.project_id,
    }
}

/// Lexically clean a URL path: collapse `//`, resolve `.` and `..`
/// without touching the filesystem, keep the leading slash.
pub fn clean_path(path: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    let joined = out.join("/");
    let mut clean = String::with_capacity(joined.len() + 1);
    clean.push('/');
    clean.push_str(&joined);
    if path.ends_with('/') && clean.len() > 1 {
        clean.push('/');
    }
    clean
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::{ApiSourceLocation, VirtualDomain};

    fn project(dir: &str) -> Project {
        Project {
            dir: dir.to_string(),
            https_only: false,
            access_control: false,
            id: 0,
        }
    }

    fn group_with(projects: &[&str]) -> Group {
        let mut g = Group {
            name: "grp".to_string(),
            ..Default::default()
        };
        for p in projects {
            g.projects.insert(p.to_ascii_lowercase(), project(p));
        }
        g
    }

    // ── group resolution ────────────────────────────────────────

    #[test]
    fn project_in_url_shadows_group_default() {
        let g = group_with(&["proj", "other"]);
        let req = g.resolve("/other/page.html", "grp.pages.test").unwrap();
        assert_eq!(req.lookup_path.root, "grp/other/public");
        assert_eq!(req.lookup_path.prefix, "/other");
        assert_eq!(req.sub_path, "page.html");
        assert!(!req.lookup_path.is_namespace_project);
    }

    #[test]
    fn host_named_project_is_group_default() {
        let g = group_with(&["grp.pages.test", "other"]);
        let req = g.resolve("/index.html", "grp.pages.test").unwrap();
        assert_eq!(req.lookup_path.root, "grp/grp.pages.test/public");
        assert_eq!(req.lookup_path.prefix, "/");
        assert_eq!(req.sub_path, "index.html");
        assert!(req.lookup_path.is_namespace_project);
    }

    #[test]
    fn sole_project_is_group_default() {
        let g = group_with(&["proj"]);
        let req = g.resolve("/", "grp.pages.test").unwrap();
        assert_eq!(req.lookup_path.root, "grp/proj/public");
        assert_eq!(req.lookup_path.prefix, "/");
        assert_eq!(req.sub_path, "");
    }

    #[test]
    fn two_projects_and_no_match_is_not_found() {
        let g = group_with(&["proj", "other"]);
        assert_eq!(
            g.resolve("/missing/x", "grp.pages.test").unwrap_err(),
            Error::DomainNotFound
        );
    }

    #[test]
    fn project_lookup_is_case_insensitive() {
        let g = group_with(&["Other", "proj"]);
        let req = g.resolve("/OTHER/", "grp.pages.test").unwrap();
        assert_eq!(req.lookup_path.root, "grp/Other/public");
    }

    #[test]
    fn subgroup_descent_finds_nested_project() {
        let mut sub = Group {
            name: "sub".to_string(),
            ..Default::default()
        };
        sub.projects.insert("deep".into(), project("deep"));

        let mut g = group_with(&["proj", "other"]);
        g.subgroups.insert("sub".into(), sub);

        let req = g.resolve("/sub/deep/a/b.html", "grp.pages.test").unwrap();
        assert_eq!(req.lookup_path.root, "grp/sub/deep/public");
        assert_eq!(req.lookup_path.prefix, "/sub/deep");
        assert_eq!(req.sub_path, "a/b.html");
    }

    // ── custom domain resolution ────────────────────────────────

    #[test]
    fn custom_domain_resolves_to_fixed_path() {
        let c = CustomProject {
            path: "grp/proj/public".to_string(),
            https_only: true,
            access_control: false,
            id: 42,
        };
        let req = c.resolve("/a/b.html");
        assert_eq!(req.lookup_path.root, "grp/proj/public");
        assert_eq!(req.lookup_path.prefix, "/");
        assert_eq!(req.sub_path, "a/b.html");
        assert!(req.lookup_path.is_https_only);
        assert_eq!(req.lookup_path.project_id, 42);
    }

    // ── api resolution ──────────────────────────────────────────

    fn api_domain(paths: Vec<(&str, &str, &str)>) -> VirtualDomain {
        VirtualDomain {
            certificate: None,
            key: None,
            lookup_paths: paths
                .into_iter()
                .enumerate()
                .map(|(i, (prefix, kind, path))| ApiLookupPath {
                    project_id: i as u64 + 1,
                    access_control: false,
                    https_only: false,
                    prefix: prefix.to_string(),
                    source: ApiSourceLocation {
                        kind: kind.to_string(),
                        path: path.to_string(),
                    },
                })
                .collect(),
        }
    }

    #[test]
    fn api_prefix_match_in_file_order() {
        let vd = api_domain(vec![
            ("/sub/", "zip", "https://bucket.test/a.zip"),
            ("/", "file", "grp/proj/public"),
        ]);
        let req = resolve_api(&vd, "/sub/index.html").unwrap();
        assert_eq!(req.lookup_path.serving, ServingType::Zip);
        assert_eq!(req.sub_path, "index.html");

        let req = resolve_api(&vd, "/elsewhere").unwrap();
        assert_eq!(req.lookup_path.serving, ServingType::File);
        assert_eq!(req.sub_path, "elsewhere");
    }

    #[test]
    fn api_namespace_flag_requires_multiple_paths() {
        let multi = api_domain(vec![
            ("/", "file", "a/public"),
            ("/b/", "file", "b/public"),
        ]);
        let req = resolve_api(&multi, "/x").unwrap();
        assert!(req.lookup_path.is_namespace_project);

        let single = api_domain(vec![("/", "file", "a/public")]);
        let req = resolve_api(&single, "/x").unwrap();
        assert!(!req.lookup_path.is_namespace_project);
    }

    #[test]
    fn api_no_prefix_match_is_not_found() {
        let vd = api_domain(vec![("/only/", "file", "a/public")]);
        assert_eq!(
            resolve_api(&vd, "/other").unwrap_err(),
            Error::DomainNotFound
        );
    }

    // ── clean_path ──────────────────────────────────────────────

    #[test]
    fn clean_path_collapses_dots_and_slashes() {
        assert_eq!(clean_path("/a//b/./c"), "/a/b/c");
        assert_eq!(clean_path("/a/b/../c"), "/a/c");
        assert_eq!(clean_path("/../../etc/passwd"), "/etc/passwd");
        assert_eq!(clean_path("/"), "/");
        assert_eq!(clean_path("/dir/"), "/dir/");
    }

    // ── certificate memoization ─────────────────────────────────

    #[test]
    fn certified_key_without_pair_errors() {
        let d = Domain::new(
            "x.example".into(),
            "grp".into(),
            "proj".into(),
            Resolver::Custom(CustomProject {
                path: "grp/proj/public".into(),
                https_only: false,
                access_control: false,
                id: 1,
            }),
        );
        assert!(matches!(d.certified_key(), Err(Error::TlsKeyPair(_))));
    }

    #[test]
    fn certified_key_error_is_memoized() {
        let d = Domain::new(
            "x.example".into(),
            "grp".into(),
            "proj".into(),
            Resolver::Custom(CustomProject {
                path: "grp/proj/public".into(),
                https_only: true,
                access_control: false,
                id: 1,
            }),
        )
        .with_certificate(Some("not a pem".into()), Some("not a key".into()));

        let first = d.certified_key().unwrap_err();
        let second = d.certified_key().unwrap_err();
        assert_eq!(first, second);
    }

    #[test]
    fn domain_display() {
        let d = Domain::new(
            "grp.pages.test".into(),
            "grp".into(),
            "proj".into(),
            Resolver::Custom(CustomProject {
                path: "p".into(),
                https_only: false,
                access_control: false,
                id: 1,
            }),
        );
        assert_eq!(d.to_string(), "grp/proj");
    }
}
