use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use strata_core::domain::{CustomProject, Domain, Group, Project, Resolver, SUBGROUP_SCAN_LIMIT};
use strata_core::host;
use tracing::warn;

/// Lowercase hostname → domain. The whole map is rebuilt by a scan and
/// swapped in atomically.
pub type DomainMap = HashMap<String, Arc<Domain>>;

/// Per-project `config.json`, carrying the custom domains bound to the
/// project.
#[derive(Debug, Deserialize, Default)]
struct DomainsConfig {
    #[serde(rename = "Domains", default)]
    domains: Vec<DomainConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
struct DomainConfig {
    #[serde(rename = "Domain", default)]
    domain: String,
    #[serde(rename = "Certificate", default)]
    certificate: String,
    #[serde(rename = "Key", default)]
    key: String,
    #[serde(rename = "HTTPSOnly", default)]
    https_only: bool,
    #[serde(rename = "AccessControl", default)]
    access_control: bool,
    #[serde(rename = "ID", default)]
    id: u64,
}

impl DomainConfig {
    fn valid(&self) -> bool {
        if !host::is_valid_hostname(&self.domain) {
            return false;
        }
        // HTTPS-only custom domains must bring their own certificate.
        if self.https_only && (self.certificate.is_empty() || self.key.is_empty()) {
            return false;
        }
        true
    }
}

/// Scan `<root>/<group>/<project>/public` and build the domain map.
/// Blocking filesystem walk; callers run it on a blocking thread.
pub fn read_groups(root: &Path, pages_domain: &str) -> DomainMap {
    let mut map = DomainMap::new();

    let Ok(entries) = std::fs::read_dir(root) else {
        warn!(root = %root.display(), "pages root is not readable");
        return map;
    };

    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }

        let group_path = entry.path();
        let mut customs = Vec::new();
        let group = scan_group(&group_path, &name, 0, &name, &mut customs);

        if has_projects(&group) {
            let group_host = host::normalize(&format!("{name}.{pages_domain}"));
            let domain = Domain::new(
                group_host.clone(),
                name.clone(),
                String::new(),
                Resolver::Group(Arc::new(group)),
            );
            map.insert(group_host, Arc::new(domain));
        }

        for custom in customs {
            map.insert(custom.name.clone(), Arc::new(custom));
        }
    }

    map
}

/// One level of the group tree. `rel` is the path from the pages root
/// to this group, used for custom-domain site roots.
fn scan_group(
    dir: &Path,
    group_name: &str,
    depth: usize,
    rel: &str,
    customs: &mut Vec<Domain>,
) -> Group {
    let mut group = Group {
        name: dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        ..Default::default()
    };

    let Ok(entries) = std::fs::read_dir(dir) else {
        return group;
    };

    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || name.ends_with(".deleted") {
            continue;
        }
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }

        let child = entry.path();
        let child_rel = format!("{rel}/{name}");

        if child.join("public").is_dir() {
            let config = read_project_config(&child);
            let project = Project {
                dir: name.clone(),
                https_only: false,
                access_control: false,
                id: 0,
            };
            group.projects.insert(name.to_ascii_lowercase(), project);

            for dc in config.domains.iter().filter(|dc| dc.valid()) {
                let domain_name = host::normalize(&dc.domain);
                let custom = Domain::new(
                    domain_name,
                    group_name.to_string(),
                    name.clone(),
                    Resolver::Custom(CustomProject {
                        path: format!("{child_rel}/public"),
                        https_only: dc.https_only,
                        access_control: dc.access_control,
                        id: dc.id,
                    }),
                )
                .with_certificate(
                    non_empty(&dc.certificate),
                    non_empty(&dc.key),
                );
                customs.push(custom);
            }
        } else if depth < SUBGROUP_SCAN_LIMIT {
            let subgroup = scan_group(&child, group_name, depth + 1, &child_rel, customs);
            if has_projects(&subgroup) {
                group.subgroups.insert(name.to_ascii_lowercase(), subgroup);
            }
        }
    }

    group
}

fn has_projects(group: &Group) -> bool {
    !group.projects.is_empty() || group.subgroups.values().any(has_projects)
}

fn read_project_config(project_dir: &Path) -> DomainsConfig {
    let path = project_dir.join("config.json");
    match std::fs::read(&path) {
        Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "unparsable config.json, ignoring");
            DomainsConfig::default()
        }),
        Err(_) => DomainsConfig::default(),
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}
