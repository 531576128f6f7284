use strata_vfs::Root;
use tracing::debug;

/// In-site rules file, relative to the content root.
pub const CONFIG_FILE: &str = "_redirects";

/// Rules files above this size are not parsed.
pub const MAX_CONFIG_SIZE: u64 = 64 * 1024;

/// Feature flag: set to "false" to disable rewrite rules entirely.
pub const FF_ENABLE_REDIRECTS: &str = "FF_ENABLE_REDIRECTS";

const SUPPORTED_STATUSES: [u16; 3] = [301, 302, 303];
const DEFAULT_STATUS: u16 = 301;

pub fn enabled() -> bool {
    std::env::var(FF_ENABLE_REDIRECTS).as_deref() != Ok("false")
}

/// Parsed `_redirects` rules for one site.
#[derive(Debug, Clone, Default)]
pub struct Redirects {
    rules: Vec<Rule>,
    invalid: usize,
    error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub from: String,
    pub to: String,
    pub status: u16,
}

impl Redirects {
    /// Read and parse the site's `_redirects`. Never fails: a missing
    /// or unreadable file yields an empty rule set whose diagnostic
    /// says why, and `rewrite` becomes a no-op.
    pub async fn parse(root: &Root) -> Redirects {
        let mut file = match root.open(CONFIG_FILE).await {
            Ok(file) => file,
            Err(err) => {
                return Redirects {
                    error: Some(format!("no _redirects file loaded: {err}")),
                    ..Default::default()
                }
            }
        };

        if file.size() > MAX_CONFIG_SIZE {
            return Redirects {
                error: Some(format!(
                    "_redirects file too large ({} bytes, {MAX_CONFIG_SIZE} allowed)",
                    file.size()
                )),
                ..Default::default()
            };
        }

        let raw = match file.read_all(MAX_CONFIG_SIZE).await {
            Ok(raw) => raw,
            Err(err) => {
                return Redirects {
                    error: Some(format!("reading _redirects failed: {err}")),
                    ..Default::default()
                }
            }
        };

        let text = String::from_utf8_lossy(&raw);
        Self::parse_text(&text)
    }

    fn parse_text(text: &str) -> Redirects {
        let mut redirects = Redirects::default();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let fields: Vec<&str> = line.split_whitespace().collect();
            let rule = match fields.as_slice() {
                [from, to] => Rule {
                    from: (*from).to_string(),
                    to: (*to).to_string(),
                    status: DEFAULT_STATUS,
                },
                [from, to, status] => match status.parse::<u16>() {
                    Ok(code) if SUPPORTED_STATUSES.contains(&code) => Rule {
                        from: (*from).to_string(),
                        to: (*to).to_string(),
                        status: code,
                    },
                    _ => {
                        redirects.invalid += 1;
                        continue;
                    }
                },
                _ => {
                    redirects.invalid += 1;
                    continue;
                }
            };

            // Rules are absolute URL paths.
            if !rule.from.starts_with('/') || !rule.to.starts_with('/') {
                redirects.invalid += 1;
                continue;
            }

            redirects.rules.push(rule);
        }

        debug!(
            rules = redirects.rules.len(),
            invalid = redirects.invalid,
            "parsed _redirects"
        );
        redirects
    }

    /// First rule matching `path` literally, in file order.
    pub fn rewrite(&self, path: &str) -> Option<(&str, u16)> {
        self.rules
            .iter()
            .find(|rule| rule.from == path)
            .map(|rule| (rule.to.as_str(), rule.status))
    }

    /// Human-readable parse diagnostic, served under `/_redirects`.
    /// Deterministic for a given input.
    pub fn status(&self) -> String {
        if let Some(error) = &self.error {
            return error.clone();
        }

        let mut out = format!(
            "{} rules ({} invalid)",
            self.rules.len() + self.invalid,
            self.invalid
        );
        for rule in &self.rules {
            out.push('\n');
            out.push_str(&format!("{} {} {}", rule.from, rule.to, rule.status));
        }
        out
    }
}
